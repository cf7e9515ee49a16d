//! Operand resolution for the interpreter: effective addresses, segment
//! bases, and sized register/memory/immediate access.

use blockvm_x86::{OpKind, Register};

use super::Ctx;
use crate::exception::Exception;
use crate::mem::MemoryBus;
use crate::state::{gpr_width, CpuState, SegReg};

fn reg_bits(reg: Register) -> Option<u32> {
    match reg {
        Register::None => None,
        r if r.is_gpr16() => Some(16),
        r if r.is_gpr32() => Some(32),
        _ => None,
    }
}

/// Offset part of a memory operand, wrapped to the instruction's address size.
pub fn effective_address(ctx: &Ctx, cpu: &CpuState) -> Result<u32, Exception> {
    let instr = &ctx.inst.instr;
    let base = instr.memory_base();
    let index = instr.memory_index();
    let bits = reg_bits(base)
        .or_else(|| reg_bits(index))
        .unwrap_or_else(|| ctx.inst.address_size(ctx.mode));

    let mut ea = instr.memory_displacement32();
    if base != Register::None {
        ea = ea.wrapping_add(cpu.read_reg(base)?);
    }
    if index != Register::None {
        ea = ea.wrapping_add(cpu.read_reg(index)?.wrapping_mul(instr.memory_index_scale()));
    }
    Ok(if bits == 16 { ea & 0xFFFF } else { ea })
}

/// Linear address of the instruction's memory operand.
pub fn linear_address(ctx: &Ctx, cpu: &CpuState) -> Result<u64, Exception> {
    let seg = SegReg::from_register(ctx.inst.instr.memory_segment()).unwrap_or(SegReg::Ds);
    let ea = effective_address(ctx, cpu)?;
    Ok(cpu.segment(seg).base.wrapping_add(ea) as u64)
}

pub fn read_mem(bus: &mut dyn MemoryBus, addr: u64, bits: u32) -> Result<u32, Exception> {
    Ok(match bits {
        8 => bus.read_u8(addr)? as u32,
        16 => bus.read_u16(addr)? as u32,
        _ => bus.read_u32(addr)?,
    })
}

pub fn write_mem(
    bus: &mut dyn MemoryBus,
    addr: u64,
    bits: u32,
    value: u32,
) -> Result<(), Exception> {
    match bits {
        8 => bus.write_u8(addr, value as u8),
        16 => bus.write_u16(addr, value as u16),
        _ => bus.write_u32(addr, value),
    }
}

/// Width in bits of operand `i`.
pub fn op_bits(ctx: &Ctx, i: u32) -> u32 {
    let instr = &ctx.inst.instr;
    match instr.op_kind(i) {
        OpKind::Register => {
            let reg = instr.op_register(i);
            gpr_width(reg).unwrap_or(16)
        }
        OpKind::Memory => match instr.memory_size().size() {
            1 => 8,
            2 => 16,
            _ => 32,
        },
        OpKind::Immediate8 => 8,
        OpKind::Immediate16 | OpKind::Immediate8to16 => 16,
        _ => 32,
    }
}

pub fn read_op(
    ctx: &Ctx,
    cpu: &CpuState,
    bus: &mut dyn MemoryBus,
    i: u32,
) -> Result<u32, Exception> {
    let instr = &ctx.inst.instr;
    match instr.op_kind(i) {
        OpKind::Register => cpu.read_reg(instr.op_register(i)),
        OpKind::Memory => {
            let addr = linear_address(ctx, cpu)?;
            read_mem(bus, addr, op_bits(ctx, i))
        }
        OpKind::Immediate8
        | OpKind::Immediate16
        | OpKind::Immediate32
        | OpKind::Immediate8to16
        | OpKind::Immediate8to32 => Ok(instr.immediate(i) as u32),
        OpKind::Immediate8_2nd => Ok(instr.immediate8_2nd() as u32),
        _ => Err(Exception::InvalidOpcode),
    }
}

pub fn write_op(
    ctx: &Ctx,
    cpu: &mut CpuState,
    bus: &mut dyn MemoryBus,
    i: u32,
    value: u32,
) -> Result<(), Exception> {
    let instr = &ctx.inst.instr;
    match instr.op_kind(i) {
        OpKind::Register => cpu.write_reg(instr.op_register(i), value),
        OpKind::Memory => {
            let addr = linear_address(ctx, cpu)?;
            write_mem(bus, addr, op_bits(ctx, i), value)
        }
        _ => Err(Exception::InvalidOpcode),
    }
}

/// Read-modify-write on operand 0. The memory address is computed once.
pub fn modify_op0(
    ctx: &Ctx,
    cpu: &mut CpuState,
    bus: &mut dyn MemoryBus,
    f: impl FnOnce(&mut CpuState, u32) -> Result<Option<u32>, Exception>,
) -> Result<(), Exception> {
    let instr = &ctx.inst.instr;
    match instr.op0_kind() {
        OpKind::Register => {
            let reg = instr.op0_register();
            let old = cpu.read_reg(reg)?;
            if let Some(new) = f(cpu, old)? {
                cpu.write_reg(reg, new)?;
            }
            Ok(())
        }
        OpKind::Memory => {
            let bits = op_bits(ctx, 0);
            let addr = linear_address(ctx, cpu)?;
            let old = read_mem(bus, addr, bits)?;
            if let Some(new) = f(cpu, old)? {
                write_mem(bus, addr, bits, new)?;
            }
            Ok(())
        }
        _ => Err(Exception::InvalidOpcode),
    }
}
