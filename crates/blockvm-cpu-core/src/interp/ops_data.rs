use blockvm_x86::{DecodedInst, Mnemonic, OpKind};

use super::operand::{effective_address, op_bits, read_op, write_op};
use super::{Ctx, NodeHandler};
use crate::codeblock::Outcome;
use crate::exception::Exception;
use crate::mem::MemoryBus;
use crate::stack::{self, StackPointer};
use crate::state::{gpr, gpr_width, CpuMode, CpuState, EFlags, SegReg};

pub(super) fn handler(m: Mnemonic, inst: &DecodedInst) -> Option<NodeHandler> {
    let instr = &inst.instr;
    let op0_sreg =
        instr.op0_kind() == OpKind::Register && instr.op0_register().is_segment_register();
    Some(match m {
        Mnemonic::Nop => nop,
        Mnemonic::Mov if op0_sreg => mov_to_sreg,
        Mnemonic::Mov => mov,
        Mnemonic::Lea => lea,
        Mnemonic::Xchg => xchg,
        Mnemonic::Push => push,
        Mnemonic::Pop if op0_sreg => pop_sreg,
        Mnemonic::Pop => pop,
        Mnemonic::Pushf | Mnemonic::Pushfd => pushf,
        Mnemonic::Popf | Mnemonic::Popfd => popf,
        Mnemonic::Clc => clc,
        Mnemonic::Stc => stc,
        Mnemonic::Cmc => cmc,
        Mnemonic::Cld => cld,
        Mnemonic::Std => std_,
        _ => return None,
    })
}

fn nop(_: &Ctx, _: &mut CpuState, _: &mut dyn MemoryBus) -> Result<Outcome, Exception> {
    Ok(Outcome::None)
}

fn mov(ctx: &Ctx, cpu: &mut CpuState, bus: &mut dyn MemoryBus) -> Result<Outcome, Exception> {
    let value = read_op(ctx, cpu, bus, 1)?;
    write_op(ctx, cpu, bus, 0, value)?;
    Ok(Outcome::None)
}

fn mov_to_sreg(
    ctx: &Ctx,
    cpu: &mut CpuState,
    bus: &mut dyn MemoryBus,
) -> Result<Outcome, Exception> {
    let seg = SegReg::from_register(ctx.inst.instr.op0_register()).ok_or(Exception::InvalidOpcode)?;
    if seg == SegReg::Cs {
        return Err(Exception::InvalidOpcode);
    }
    let selector = read_op(ctx, cpu, bus, 1)? as u16;
    cpu.load_segment(bus, seg, selector)?;
    if seg == SegReg::Ss {
        cpu.inhibit_interrupts_for_one_instruction();
    }
    Ok(Outcome::None)
}

fn lea(ctx: &Ctx, cpu: &mut CpuState, bus: &mut dyn MemoryBus) -> Result<Outcome, Exception> {
    if ctx.inst.instr.op1_kind() != OpKind::Memory {
        return Err(Exception::InvalidOpcode);
    }
    let ea = effective_address(ctx, cpu)?;
    write_op(ctx, cpu, bus, 0, ea)?;
    Ok(Outcome::None)
}

fn xchg(ctx: &Ctx, cpu: &mut CpuState, bus: &mut dyn MemoryBus) -> Result<Outcome, Exception> {
    let a = read_op(ctx, cpu, bus, 0)?;
    let b = read_op(ctx, cpu, bus, 1)?;
    // Memory side first so a faulting store leaves the register untouched.
    if ctx.inst.instr.op1_kind() == OpKind::Memory {
        write_op(ctx, cpu, bus, 1, a)?;
        write_op(ctx, cpu, bus, 0, b)?;
    } else {
        write_op(ctx, cpu, bus, 0, b)?;
        write_op(ctx, cpu, bus, 1, a)?;
    }
    Ok(Outcome::None)
}

/// Width of a PUSH/POP operand in bytes.
fn stack_operand_bytes(ctx: &Ctx) -> u32 {
    let instr = &ctx.inst.instr;
    match instr.op0_kind() {
        OpKind::Register => match gpr_width(instr.op0_register()) {
            Some(bits) => bits / 8,
            // Segment registers use the operand size.
            None => ctx.operand_size() / 8,
        },
        OpKind::Memory => op_bits(ctx, 0) / 8,
        _ => ctx.operand_size() / 8,
    }
}

fn push(ctx: &Ctx, cpu: &mut CpuState, bus: &mut dyn MemoryBus) -> Result<Outcome, Exception> {
    let value = read_op(ctx, cpu, bus, 0)?;
    stack::push(cpu, bus, value, stack_operand_bytes(ctx))?;
    Ok(Outcome::None)
}

fn pop(ctx: &Ctx, cpu: &mut CpuState, bus: &mut dyn MemoryBus) -> Result<Outcome, Exception> {
    let mut sp = StackPointer::current(cpu);
    let value = sp.pop(bus, stack_operand_bytes(ctx))?;
    // A memory destination addressed through ESP sees the incremented value.
    let old_esp = cpu.gpr32(gpr::ESP);
    sp.commit(cpu);
    if let Err(e) = write_op(ctx, cpu, bus, 0, value) {
        cpu.set_gpr32(gpr::ESP, old_esp);
        return Err(e);
    }
    Ok(Outcome::None)
}

fn pop_sreg(ctx: &Ctx, cpu: &mut CpuState, bus: &mut dyn MemoryBus) -> Result<Outcome, Exception> {
    let seg = SegReg::from_register(ctx.inst.instr.op0_register()).ok_or(Exception::InvalidOpcode)?;
    let mut sp = StackPointer::current(cpu);
    let selector = sp.pop(bus, ctx.operand_size() / 8)? as u16;
    cpu.load_segment(bus, seg, selector)?;
    sp.commit(cpu);
    if seg == SegReg::Ss {
        cpu.inhibit_interrupts_for_one_instruction();
    }
    Ok(Outcome::None)
}

fn check_v86_iopl(cpu: &CpuState) -> Result<(), Exception> {
    if cpu.mode() == CpuMode::Virtual8086 && cpu.iopl() < 3 {
        return Err(Exception::gp0());
    }
    Ok(())
}

fn pushf(ctx: &Ctx, cpu: &mut CpuState, bus: &mut dyn MemoryBus) -> Result<Outcome, Exception> {
    check_v86_iopl(cpu)?;
    let value = cpu.eflags().difference(EFlags::VM | EFlags::RF).bits();
    stack::push(cpu, bus, value, ctx.operand_size() / 8)?;
    Ok(Outcome::None)
}

/// Bits POPF/IRET may change at the current privilege level.
pub(super) fn writable_flags(cpu: &CpuState, bits: u32) -> EFlags {
    let mut writable = EFlags::GUEST_WRITABLE;
    match cpu.mode() {
        CpuMode::Real => {}
        CpuMode::Virtual8086 => writable.remove(EFlags::IOPL),
        CpuMode::Protected => {
            if cpu.cpl() > 0 {
                writable.remove(EFlags::IOPL);
            }
            if cpu.cpl() > cpu.iopl() {
                writable.remove(EFlags::IF);
            }
        }
    }
    if bits == 16 {
        writable &= EFlags::from_bits_truncate(0xFFFF);
    }
    writable
}

pub(super) fn merge_flags(cpu: &mut CpuState, popped: u32, bits: u32) {
    let writable = writable_flags(cpu, bits);
    let old = cpu.eflags();
    let new = old.difference(writable) | (EFlags::from_bits_truncate(popped) & writable);
    cpu.set_eflags(new);
}

fn popf(ctx: &Ctx, cpu: &mut CpuState, bus: &mut dyn MemoryBus) -> Result<Outcome, Exception> {
    check_v86_iopl(cpu)?;
    let bits = ctx.operand_size();
    let popped = stack::pop(cpu, bus, bits / 8)?;
    merge_flags(cpu, popped, bits);
    Ok(Outcome::None)
}

fn clc(_: &Ctx, cpu: &mut CpuState, _: &mut dyn MemoryBus) -> Result<Outcome, Exception> {
    cpu.set_flag(EFlags::CF, false);
    Ok(Outcome::None)
}

fn stc(_: &Ctx, cpu: &mut CpuState, _: &mut dyn MemoryBus) -> Result<Outcome, Exception> {
    cpu.set_flag(EFlags::CF, true);
    Ok(Outcome::None)
}

fn cmc(_: &Ctx, cpu: &mut CpuState, _: &mut dyn MemoryBus) -> Result<Outcome, Exception> {
    let cf = cpu.flag(EFlags::CF);
    cpu.set_flag(EFlags::CF, !cf);
    Ok(Outcome::None)
}

fn cld(_: &Ctx, cpu: &mut CpuState, _: &mut dyn MemoryBus) -> Result<Outcome, Exception> {
    cpu.set_flag(EFlags::DF, false);
    Ok(Outcome::None)
}

fn std_(_: &Ctx, cpu: &mut CpuState, _: &mut dyn MemoryBus) -> Result<Outcome, Exception> {
    cpu.set_flag(EFlags::DF, true);
    Ok(Outcome::None)
}
