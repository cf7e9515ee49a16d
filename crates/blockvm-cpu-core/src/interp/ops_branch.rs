use blockvm_x86::{ConditionCode, DecodedInst, MemorySize, Mnemonic, OpKind};

use super::operand::{linear_address, read_op};
use super::{Ctx, NodeHandler};
use crate::codeblock::Outcome;
use crate::exception::Exception;
use crate::mem::MemoryBus;
use crate::stack::{self, StackPointer};
use crate::state::{gpr, CpuState, EFlags, SegReg};

pub(super) fn handler(m: Mnemonic, inst: &DecodedInst) -> Option<NodeHandler> {
    let instr = &inst.instr;
    let op0 = instr.op0_kind();
    let near = matches!(op0, OpKind::NearBranch16 | OpKind::NearBranch32);
    let far_ptr = matches!(op0, OpKind::FarBranch16 | OpKind::FarBranch32);
    let far_mem = op0 == OpKind::Memory
        && matches!(instr.memory_size(), MemorySize::SegPtr16 | MemorySize::SegPtr32);

    Some(match m {
        Mnemonic::Jmp if near => jmp_rel,
        Mnemonic::Jmp if far_ptr => jmp_far,
        Mnemonic::Jmp if far_mem => jmp_far_mem,
        Mnemonic::Jmp => jmp_indirect,
        Mnemonic::Call if near => call_rel,
        Mnemonic::Call if far_ptr || far_mem => return None,
        Mnemonic::Call => call_indirect,
        Mnemonic::Ret => ret,
        Mnemonic::Jcxz | Mnemonic::Jecxz => jcxz,
        Mnemonic::Loop | Mnemonic::Loope | Mnemonic::Loopne => loop_,
        _ if near && instr.condition_code() != ConditionCode::None => jcc,
        _ => return None,
    })
}

fn branch_target(ctx: &Ctx) -> Result<u32, Exception> {
    ctx.near_target().ok_or(Exception::InvalidOpcode)
}

fn jmp_rel(ctx: &Ctx, cpu: &mut CpuState, _: &mut dyn MemoryBus) -> Result<Outcome, Exception> {
    cpu.set_eip(branch_target(ctx)?);
    Ok(Outcome::BranchTaken)
}

fn jmp_indirect(
    ctx: &Ctx,
    cpu: &mut CpuState,
    bus: &mut dyn MemoryBus,
) -> Result<Outcome, Exception> {
    let target = read_op(ctx, cpu, bus, 0)?;
    cpu.set_eip(target);
    Ok(Outcome::IndirectJump)
}

/// Load CS:EIP for a far transfer. Reports a mode switch when the code
/// segment's default size changed, since the next block decodes differently.
fn far_transfer(
    cpu: &mut CpuState,
    bus: &mut dyn MemoryBus,
    selector: u16,
    offset: u32,
) -> Result<Outcome, Exception> {
    let before = (cpu.mode(), cpu.bitness());
    cpu.load_segment(bus, SegReg::Cs, selector)?;
    cpu.set_eip(offset);
    if (cpu.mode(), cpu.bitness()) != before {
        return Ok(Outcome::ModeSwitch);
    }
    Ok(Outcome::BranchTaken)
}

fn jmp_far(ctx: &Ctx, cpu: &mut CpuState, bus: &mut dyn MemoryBus) -> Result<Outcome, Exception> {
    let instr = &ctx.inst.instr;
    let offset = match instr.op0_kind() {
        OpKind::FarBranch16 => instr.far_branch16() as u32,
        _ => instr.far_branch32(),
    };
    far_transfer(cpu, bus, instr.far_branch_selector(), offset)
}

fn jmp_far_mem(
    ctx: &Ctx,
    cpu: &mut CpuState,
    bus: &mut dyn MemoryBus,
) -> Result<Outcome, Exception> {
    let addr = linear_address(ctx, cpu)?;
    let (offset, selector) = match ctx.inst.instr.memory_size() {
        MemorySize::SegPtr16 => (bus.read_u16(addr)? as u32, bus.read_u16(addr + 2)?),
        _ => (bus.read_u32(addr)?, bus.read_u16(addr + 4)?),
    };
    far_transfer(cpu, bus, selector, offset)
}

fn call_rel(ctx: &Ctx, cpu: &mut CpuState, bus: &mut dyn MemoryBus) -> Result<Outcome, Exception> {
    let target = branch_target(ctx)?;
    stack::push(cpu, bus, ctx.next_ip(), ctx.operand_size() / 8)?;
    cpu.set_eip(target);
    Ok(Outcome::DirectCall)
}

fn call_indirect(
    ctx: &Ctx,
    cpu: &mut CpuState,
    bus: &mut dyn MemoryBus,
) -> Result<Outcome, Exception> {
    let target = read_op(ctx, cpu, bus, 0)?;
    stack::push(cpu, bus, ctx.next_ip(), ctx.operand_size() / 8)?;
    cpu.set_eip(target);
    Ok(Outcome::IndirectCall)
}

fn ret(ctx: &Ctx, cpu: &mut CpuState, bus: &mut dyn MemoryBus) -> Result<Outcome, Exception> {
    let mut sp = StackPointer::current(cpu);
    let target = sp.pop(bus, ctx.operand_size() / 8)?;
    if ctx.inst.instr.op0_kind() == OpKind::Immediate16 {
        sp.skip(ctx.inst.instr.immediate16() as u32);
    }
    sp.commit(cpu);
    cpu.set_eip(target);
    Ok(Outcome::Return)
}

fn condition_holds(cc: ConditionCode, flags: EFlags) -> bool {
    let cf = flags.contains(EFlags::CF);
    let zf = flags.contains(EFlags::ZF);
    let sf = flags.contains(EFlags::SF);
    let of = flags.contains(EFlags::OF);
    let pf = flags.contains(EFlags::PF);
    match cc {
        ConditionCode::o => of,
        ConditionCode::no => !of,
        ConditionCode::b => cf,
        ConditionCode::ae => !cf,
        ConditionCode::e => zf,
        ConditionCode::ne => !zf,
        ConditionCode::be => cf || zf,
        ConditionCode::a => !cf && !zf,
        ConditionCode::s => sf,
        ConditionCode::ns => !sf,
        ConditionCode::p => pf,
        ConditionCode::np => !pf,
        ConditionCode::l => sf != of,
        ConditionCode::ge => sf == of,
        ConditionCode::le => zf || sf != of,
        ConditionCode::g => !zf && sf == of,
        ConditionCode::None => true,
    }
}

fn take_branch(ctx: &Ctx, cpu: &mut CpuState, taken: bool) -> Result<Outcome, Exception> {
    if taken {
        cpu.set_eip(branch_target(ctx)?);
        Ok(Outcome::BranchTaken)
    } else {
        cpu.set_eip(ctx.next_ip());
        Ok(Outcome::BranchNotTaken)
    }
}

fn jcc(ctx: &Ctx, cpu: &mut CpuState, _: &mut dyn MemoryBus) -> Result<Outcome, Exception> {
    let taken = condition_holds(ctx.inst.instr.condition_code(), cpu.eflags());
    take_branch(ctx, cpu, taken)
}

fn jcxz(ctx: &Ctx, cpu: &mut CpuState, _: &mut dyn MemoryBus) -> Result<Outcome, Exception> {
    let count = match ctx.inst.instr.mnemonic() {
        Mnemonic::Jcxz => cpu.gpr16(gpr::ECX) as u32,
        _ => cpu.gpr32(gpr::ECX),
    };
    take_branch(ctx, cpu, count == 0)
}

fn loop_(ctx: &Ctx, cpu: &mut CpuState, _: &mut dyn MemoryBus) -> Result<Outcome, Exception> {
    let count = if ctx.address_size() == 16 {
        let cx = cpu.gpr16(gpr::ECX).wrapping_sub(1);
        cpu.set_gpr16(gpr::ECX, cx);
        cx as u32
    } else {
        let ecx = cpu.gpr32(gpr::ECX).wrapping_sub(1);
        cpu.set_gpr32(gpr::ECX, ecx);
        ecx
    };
    let zf = cpu.flag(EFlags::ZF);
    let taken = count != 0
        && match ctx.inst.instr.mnemonic() {
            Mnemonic::Loope => zf,
            Mnemonic::Loopne => !zf,
            _ => true,
        };
    take_branch(ctx, cpu, taken)
}
