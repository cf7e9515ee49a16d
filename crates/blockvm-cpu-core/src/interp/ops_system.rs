use blockvm_x86::{DecodedInst, Mnemonic, OpKind, Register};

use super::operand::{linear_address, op_bits, read_op, write_op};
use super::ops_data::merge_flags;
use super::{Ctx, NodeHandler};
use crate::codeblock::Outcome;
use crate::exception::Exception;
use crate::interrupts::{deliver, InterruptKind};
use crate::mem::MemoryBus;
use crate::stack::StackPointer;
use crate::state::{gpr, CpuMode, CpuState, DescriptorTable, EFlags, SegReg, Segment, CR0_PE};

pub(super) fn handler(m: Mnemonic, inst: &DecodedInst) -> Option<NodeHandler> {
    let instr = &inst.instr;
    Some(match m {
        Mnemonic::Mov if instr.op0_register() == Register::CR0 => mov_to_cr0,
        Mnemonic::Mov
            if instr.op1_kind() == OpKind::Register && instr.op1_register() == Register::CR0 =>
        {
            mov_from_cr0
        }
        Mnemonic::Mov if instr.op0_register().is_cr() || instr.op1_register().is_cr() => {
            return None
        }
        Mnemonic::Cli => cli,
        Mnemonic::Sti => sti,
        Mnemonic::Hlt => hlt,
        Mnemonic::Int | Mnemonic::Int3 | Mnemonic::Into => int,
        Mnemonic::Iret | Mnemonic::Iretd => iret,
        Mnemonic::Lgdt | Mnemonic::Lidt => load_descriptor_table,
        Mnemonic::Lmsw => lmsw,
        Mnemonic::Smsw => smsw,
        Mnemonic::In => in_,
        Mnemonic::Out => out,
        _ => return None,
    })
}

fn require_cpl0(cpu: &CpuState) -> Result<(), Exception> {
    if cpu.cpl() != 0 {
        return Err(Exception::gp0());
    }
    Ok(())
}

/// IF-sensitive and I/O instructions: CPL <= IOPL in protected mode, IOPL 3
/// in virtual-8086 mode. There is no I/O permission bitmap.
fn require_iopl(cpu: &CpuState) -> Result<(), Exception> {
    let ok = match cpu.mode() {
        CpuMode::Real => true,
        CpuMode::Protected => cpu.cpl() <= cpu.iopl(),
        CpuMode::Virtual8086 => cpu.iopl() == 3,
    };
    if !ok {
        return Err(Exception::gp0());
    }
    Ok(())
}

/// Commit a new CR0 value. Returns `ModeSwitch` with EIP at the next
/// instruction if PE flipped, `None` otherwise.
fn write_cr0(ctx: &Ctx, cpu: &mut CpuState, value: u32) -> Outcome {
    let before = cpu.mode();
    cpu.cr0 = value;
    if cpu.mode() != before {
        cpu.set_eip(ctx.next_ip());
        return Outcome::ModeSwitch;
    }
    Outcome::None
}

fn mov_to_cr0(
    ctx: &Ctx,
    cpu: &mut CpuState,
    bus: &mut dyn MemoryBus,
) -> Result<Outcome, Exception> {
    require_cpl0(cpu)?;
    let value = read_op(ctx, cpu, bus, 1)?;
    Ok(write_cr0(ctx, cpu, value))
}

fn mov_from_cr0(
    ctx: &Ctx,
    cpu: &mut CpuState,
    bus: &mut dyn MemoryBus,
) -> Result<Outcome, Exception> {
    require_cpl0(cpu)?;
    let value = cpu.cr0;
    write_op(ctx, cpu, bus, 0, value)?;
    Ok(Outcome::None)
}

fn lmsw(ctx: &Ctx, cpu: &mut CpuState, bus: &mut dyn MemoryBus) -> Result<Outcome, Exception> {
    require_cpl0(cpu)?;
    let msw = read_op(ctx, cpu, bus, 0)? & 0xF;
    // LMSW can set PE but never clear it.
    let value = (cpu.cr0 & !0xE) | msw | (cpu.cr0 & CR0_PE);
    Ok(write_cr0(ctx, cpu, value))
}

fn smsw(ctx: &Ctx, cpu: &mut CpuState, bus: &mut dyn MemoryBus) -> Result<Outcome, Exception> {
    let value = cpu.cr0;
    write_op(ctx, cpu, bus, 0, value)?;
    Ok(Outcome::None)
}

fn cli(_: &Ctx, cpu: &mut CpuState, _: &mut dyn MemoryBus) -> Result<Outcome, Exception> {
    require_iopl(cpu)?;
    cpu.set_flag(EFlags::IF, false);
    Ok(Outcome::None)
}

fn sti(_: &Ctx, cpu: &mut CpuState, _: &mut dyn MemoryBus) -> Result<Outcome, Exception> {
    require_iopl(cpu)?;
    if !cpu.flag(EFlags::IF) {
        cpu.set_flag(EFlags::IF, true);
        cpu.inhibit_interrupts_for_one_instruction();
    }
    Ok(Outcome::None)
}

fn hlt(ctx: &Ctx, cpu: &mut CpuState, _: &mut dyn MemoryBus) -> Result<Outcome, Exception> {
    require_cpl0(cpu)?;
    cpu.set_eip(ctx.next_ip());
    cpu.halted = true;
    Ok(Outcome::Halt)
}

fn int(ctx: &Ctx, cpu: &mut CpuState, bus: &mut dyn MemoryBus) -> Result<Outcome, Exception> {
    let instr = &ctx.inst.instr;
    let vector = match instr.mnemonic() {
        Mnemonic::Int3 => 3,
        Mnemonic::Into => {
            if !cpu.flag(EFlags::OF) {
                return Ok(Outcome::None);
            }
            4
        }
        _ => instr.immediate8(),
    };
    if cpu.mode() == CpuMode::Virtual8086 && cpu.iopl() < 3 {
        return Err(Exception::gp0());
    }
    let before = cpu.mode();
    deliver(cpu, bus, vector, ctx.next_ip(), None, InterruptKind::Software)?;
    if cpu.mode() != before {
        return Ok(Outcome::ModeSwitch);
    }
    Ok(Outcome::IndirectCall)
}

fn iret(ctx: &Ctx, cpu: &mut CpuState, bus: &mut dyn MemoryBus) -> Result<Outcome, Exception> {
    let size = match ctx.inst.instr.mnemonic() {
        Mnemonic::Iretd => 4,
        _ => 2,
    };
    let before = (cpu.mode(), cpu.bitness());
    match cpu.mode() {
        CpuMode::Real => iret_real(cpu, bus, size)?,
        CpuMode::Virtual8086 => {
            if cpu.iopl() < 3 {
                return Err(Exception::gp0());
            }
            iret_real(cpu, bus, size)?;
        }
        CpuMode::Protected => iret_protected(cpu, bus, size)?,
    }
    if (cpu.mode(), cpu.bitness()) != before {
        return Ok(Outcome::ModeSwitch);
    }
    Ok(Outcome::Return)
}

fn iret_real(cpu: &mut CpuState, bus: &mut dyn MemoryBus, size: u32) -> Result<(), Exception> {
    let mut sp = StackPointer::current(cpu);
    let eip = sp.pop(bus, size)?;
    let cs = sp.pop(bus, size)? as u16;
    let flags = sp.pop(bus, size)?;
    sp.commit(cpu);
    cpu.segments[SegReg::Cs as usize] = Segment::real(cs);
    merge_flags(cpu, flags, size * 8);
    cpu.set_eip(eip);
    Ok(())
}

fn iret_protected(cpu: &mut CpuState, bus: &mut dyn MemoryBus, size: u32) -> Result<(), Exception> {
    let mut sp = StackPointer::current(cpu);
    let eip = sp.pop(bus, size)?;
    let cs = sp.pop(bus, size)? as u16;
    let flags = sp.pop(bus, size)?;

    if size == 4 && flags & EFlags::VM.bits() != 0 && cpu.cpl() == 0 {
        return iret_to_v86(cpu, bus, sp, eip, cs, flags);
    }

    let rpl = (cs & 3) as u8;
    if rpl < cpu.cpl() {
        return Err(Exception::GeneralProtection(cs & !3));
    }
    let new_cs = cpu.descriptor(bus, SegReg::Cs, cs)?;
    let outer = if rpl > cpu.cpl() {
        let esp = sp.pop(bus, size)?;
        let ss = sp.pop(bus, size)? as u16;
        Some((esp, cpu.descriptor(bus, SegReg::Ss, ss)?))
    } else {
        None
    };

    // Flag writability is judged at the old privilege level.
    merge_flags(cpu, flags, size * 8);
    match outer {
        Some((esp, ss)) => {
            cpu.segments[SegReg::Ss as usize] = ss;
            cpu.set_gpr32(gpr::ESP, if ss.default_32 { esp } else { esp & 0xFFFF });
        }
        None => sp.commit(cpu),
    }
    cpu.segments[SegReg::Cs as usize] = new_cs;
    cpu.set_eip(eip);
    Ok(())
}

fn iret_to_v86(
    cpu: &mut CpuState,
    bus: &mut dyn MemoryBus,
    mut sp: StackPointer,
    eip: u32,
    cs: u16,
    flags: u32,
) -> Result<(), Exception> {
    let esp = sp.pop(bus, 4)?;
    let ss = sp.pop(bus, 4)? as u16;
    let es = sp.pop(bus, 4)? as u16;
    let ds = sp.pop(bus, 4)? as u16;
    let fs = sp.pop(bus, 4)? as u16;
    let gs = sp.pop(bus, 4)? as u16;

    let writable = EFlags::GUEST_WRITABLE | EFlags::VM;
    let new_flags =
        cpu.eflags().difference(writable) | (EFlags::from_bits_truncate(flags) & writable);
    cpu.set_eflags(new_flags);
    for (seg, selector) in [
        (SegReg::Cs, cs),
        (SegReg::Ss, ss),
        (SegReg::Es, es),
        (SegReg::Ds, ds),
        (SegReg::Fs, fs),
        (SegReg::Gs, gs),
    ] {
        cpu.segments[seg as usize] = Segment::real(selector);
    }
    cpu.set_gpr32(gpr::ESP, esp & 0xFFFF);
    cpu.set_eip(eip & 0xFFFF);
    Ok(())
}

fn load_descriptor_table(
    ctx: &Ctx,
    cpu: &mut CpuState,
    bus: &mut dyn MemoryBus,
) -> Result<Outcome, Exception> {
    require_cpl0(cpu)?;
    if cpu.mode() == CpuMode::Virtual8086 {
        return Err(Exception::gp0());
    }
    let addr = linear_address(ctx, cpu)?;
    let limit = bus.read_u16(addr)?;
    let mut base = bus.read_u32(addr + 2)?;
    if ctx.operand_size() == 16 {
        base &= 0x00FF_FFFF;
    }
    let table = DescriptorTable { base, limit };
    match ctx.inst.instr.mnemonic() {
        Mnemonic::Lgdt => cpu.gdtr = table,
        _ => cpu.idtr = table,
    }
    Ok(Outcome::None)
}

fn port(ctx: &Ctx, cpu: &CpuState, i: u32) -> Result<u16, Exception> {
    let instr = &ctx.inst.instr;
    match instr.op_kind(i) {
        OpKind::Immediate8 => Ok(instr.immediate8() as u16),
        OpKind::Register => Ok(cpu.read_reg(instr.op_register(i))? as u16),
        _ => Err(Exception::InvalidOpcode),
    }
}

fn in_(ctx: &Ctx, cpu: &mut CpuState, bus: &mut dyn MemoryBus) -> Result<Outcome, Exception> {
    require_iopl(cpu)?;
    let port = port(ctx, cpu, 1)?;
    let bits = op_bits(ctx, 0);
    let value = bus.io_read(port, bits / 8)?;
    write_op(ctx, cpu, bus, 0, value)?;
    Ok(Outcome::None)
}

fn out(ctx: &Ctx, cpu: &mut CpuState, bus: &mut dyn MemoryBus) -> Result<Outcome, Exception> {
    require_iopl(cpu)?;
    let port = port(ctx, cpu, 0)?;
    let bits = op_bits(ctx, 1);
    let value = read_op(ctx, cpu, bus, 1)?;
    bus.io_write(port, bits / 8, value)?;
    Ok(Outcome::None)
}
