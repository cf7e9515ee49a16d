use blockvm_x86::Mnemonic;

use super::alu::{add_with_flags, inc_dec_with_flags, logic_with_flags, sign_extend, sub_with_flags};
use super::operand::{modify_op0, op_bits, read_op};
use super::{Ctx, NodeHandler};
use crate::codeblock::Outcome;
use crate::exception::Exception;
use crate::mem::MemoryBus;
use crate::state::{gpr, mask_bits, CpuState, EFlags};

pub(super) fn handler(m: Mnemonic) -> Option<NodeHandler> {
    Some(match m {
        Mnemonic::Add => add,
        Mnemonic::Adc => adc,
        Mnemonic::Sub => sub,
        Mnemonic::Sbb => sbb,
        Mnemonic::Cmp => cmp,
        Mnemonic::And => and,
        Mnemonic::Or => or,
        Mnemonic::Xor => xor,
        Mnemonic::Test => test,
        Mnemonic::Inc => inc,
        Mnemonic::Dec => dec,
        Mnemonic::Neg => neg,
        Mnemonic::Not => not,
        Mnemonic::Mul => mul,
        Mnemonic::Div => div,
        Mnemonic::Idiv => idiv,
        _ => return None,
    })
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum BinOp {
    Add,
    Adc,
    Sub,
    Sbb,
    Cmp,
    And,
    Or,
    Xor,
    Test,
}

fn binop(
    ctx: &Ctx,
    cpu: &mut CpuState,
    bus: &mut dyn MemoryBus,
    op: BinOp,
) -> Result<Outcome, Exception> {
    let bits = op_bits(ctx, 0);
    let src = read_op(ctx, cpu, bus, 1)? & mask_bits(bits);
    modify_op0(ctx, cpu, bus, |cpu, dst| {
        let mut flags = cpu.eflags();
        let cf = flags.contains(EFlags::CF);
        let result = match op {
            BinOp::Add => add_with_flags(&mut flags, dst, src, false, bits),
            BinOp::Adc => add_with_flags(&mut flags, dst, src, cf, bits),
            BinOp::Sub | BinOp::Cmp => sub_with_flags(&mut flags, dst, src, false, bits),
            BinOp::Sbb => sub_with_flags(&mut flags, dst, src, cf, bits),
            BinOp::And | BinOp::Test => logic_with_flags(&mut flags, dst & src, bits),
            BinOp::Or => logic_with_flags(&mut flags, dst | src, bits),
            BinOp::Xor => logic_with_flags(&mut flags, dst ^ src, bits),
        };
        cpu.set_eflags(flags);
        Ok((!matches!(op, BinOp::Cmp | BinOp::Test)).then_some(result))
    })?;
    Ok(Outcome::None)
}

fn add(ctx: &Ctx, cpu: &mut CpuState, bus: &mut dyn MemoryBus) -> Result<Outcome, Exception> {
    binop(ctx, cpu, bus, BinOp::Add)
}

fn adc(ctx: &Ctx, cpu: &mut CpuState, bus: &mut dyn MemoryBus) -> Result<Outcome, Exception> {
    binop(ctx, cpu, bus, BinOp::Adc)
}

fn sub(ctx: &Ctx, cpu: &mut CpuState, bus: &mut dyn MemoryBus) -> Result<Outcome, Exception> {
    binop(ctx, cpu, bus, BinOp::Sub)
}

fn sbb(ctx: &Ctx, cpu: &mut CpuState, bus: &mut dyn MemoryBus) -> Result<Outcome, Exception> {
    binop(ctx, cpu, bus, BinOp::Sbb)
}

fn cmp(ctx: &Ctx, cpu: &mut CpuState, bus: &mut dyn MemoryBus) -> Result<Outcome, Exception> {
    binop(ctx, cpu, bus, BinOp::Cmp)
}

fn and(ctx: &Ctx, cpu: &mut CpuState, bus: &mut dyn MemoryBus) -> Result<Outcome, Exception> {
    binop(ctx, cpu, bus, BinOp::And)
}

fn or(ctx: &Ctx, cpu: &mut CpuState, bus: &mut dyn MemoryBus) -> Result<Outcome, Exception> {
    binop(ctx, cpu, bus, BinOp::Or)
}

fn xor(ctx: &Ctx, cpu: &mut CpuState, bus: &mut dyn MemoryBus) -> Result<Outcome, Exception> {
    binop(ctx, cpu, bus, BinOp::Xor)
}

fn test(ctx: &Ctx, cpu: &mut CpuState, bus: &mut dyn MemoryBus) -> Result<Outcome, Exception> {
    binop(ctx, cpu, bus, BinOp::Test)
}

fn inc(ctx: &Ctx, cpu: &mut CpuState, bus: &mut dyn MemoryBus) -> Result<Outcome, Exception> {
    let bits = op_bits(ctx, 0);
    modify_op0(ctx, cpu, bus, |cpu, dst| {
        let mut flags = cpu.eflags();
        let result = inc_dec_with_flags(&mut flags, dst, true, bits);
        cpu.set_eflags(flags);
        Ok(Some(result))
    })?;
    Ok(Outcome::None)
}

fn dec(ctx: &Ctx, cpu: &mut CpuState, bus: &mut dyn MemoryBus) -> Result<Outcome, Exception> {
    let bits = op_bits(ctx, 0);
    modify_op0(ctx, cpu, bus, |cpu, dst| {
        let mut flags = cpu.eflags();
        let result = inc_dec_with_flags(&mut flags, dst, false, bits);
        cpu.set_eflags(flags);
        Ok(Some(result))
    })?;
    Ok(Outcome::None)
}

fn neg(ctx: &Ctx, cpu: &mut CpuState, bus: &mut dyn MemoryBus) -> Result<Outcome, Exception> {
    let bits = op_bits(ctx, 0);
    modify_op0(ctx, cpu, bus, |cpu, dst| {
        let mut flags = cpu.eflags();
        let result = sub_with_flags(&mut flags, 0, dst, false, bits);
        flags.set(EFlags::CF, dst & mask_bits(bits) != 0);
        cpu.set_eflags(flags);
        Ok(Some(result))
    })?;
    Ok(Outcome::None)
}

fn not(ctx: &Ctx, cpu: &mut CpuState, bus: &mut dyn MemoryBus) -> Result<Outcome, Exception> {
    let bits = op_bits(ctx, 0);
    modify_op0(ctx, cpu, bus, |_, dst| Ok(Some(!dst & mask_bits(bits))))?;
    Ok(Outcome::None)
}

/// Double-width accumulator pair (AX for byte ops, DX:AX, EDX:EAX).
fn read_wide_acc(cpu: &CpuState, bits: u32) -> u64 {
    match bits {
        8 => cpu.gpr16(gpr::EAX) as u64,
        16 => ((cpu.gpr16(gpr::EDX) as u64) << 16) | cpu.gpr16(gpr::EAX) as u64,
        _ => ((cpu.gpr32(gpr::EDX) as u64) << 32) | cpu.gpr32(gpr::EAX) as u64,
    }
}

/// Store a (low, high) result pair into the accumulator registers.
fn write_acc_pair(cpu: &mut CpuState, bits: u32, lo: u32, hi: u32) {
    match bits {
        8 => cpu.set_gpr16(gpr::EAX, ((hi as u16 & 0xFF) << 8) | (lo as u16 & 0xFF)),
        16 => {
            cpu.set_gpr16(gpr::EAX, lo as u16);
            cpu.set_gpr16(gpr::EDX, hi as u16);
        }
        _ => {
            cpu.set_gpr32(gpr::EAX, lo);
            cpu.set_gpr32(gpr::EDX, hi);
        }
    }
}

fn mul(ctx: &Ctx, cpu: &mut CpuState, bus: &mut dyn MemoryBus) -> Result<Outcome, Exception> {
    let bits = op_bits(ctx, 0);
    let mask = mask_bits(bits);
    let src = read_op(ctx, cpu, bus, 0)? & mask;
    let acc = cpu.gpr32(gpr::EAX) & mask;
    let product = acc as u64 * src as u64;
    let lo = product as u32 & mask;
    let hi = (product >> bits) as u32 & mask;
    write_acc_pair(cpu, bits, lo, hi);

    let mut flags = cpu.eflags();
    flags.set(EFlags::CF | EFlags::OF, hi != 0);
    cpu.set_eflags(flags);
    Ok(Outcome::None)
}

fn div(ctx: &Ctx, cpu: &mut CpuState, bus: &mut dyn MemoryBus) -> Result<Outcome, Exception> {
    let bits = op_bits(ctx, 0);
    let divisor = (read_op(ctx, cpu, bus, 0)? & mask_bits(bits)) as u64;
    if divisor == 0 {
        return Err(Exception::DivideError);
    }
    let dividend = read_wide_acc(cpu, bits);
    let quotient = dividend / divisor;
    if quotient > mask_bits(bits) as u64 {
        return Err(Exception::DivideError);
    }
    let remainder = dividend % divisor;
    write_acc_pair(cpu, bits, quotient as u32, remainder as u32);
    Ok(Outcome::None)
}

fn idiv(ctx: &Ctx, cpu: &mut CpuState, bus: &mut dyn MemoryBus) -> Result<Outcome, Exception> {
    let bits = op_bits(ctx, 0);
    let divisor = sign_extend(read_op(ctx, cpu, bus, 0)?, bits);
    if divisor == 0 {
        return Err(Exception::DivideError);
    }
    let wide = read_wide_acc(cpu, bits);
    let dividend = match bits {
        8 => wide as u16 as i16 as i64,
        16 => wide as u32 as i32 as i64,
        _ => wide as i64,
    };
    // EDX:EAX = i64::MIN with a divisor of -1 overflows i64 itself.
    let quotient = dividend.checked_div(divisor).ok_or(Exception::DivideError)?;
    let min = -(1i64 << (bits - 1));
    let max = (1i64 << (bits - 1)) - 1;
    if quotient < min || quotient > max {
        return Err(Exception::DivideError);
    }
    let remainder = dividend % divisor;
    write_acc_pair(
        cpu,
        bits,
        quotient as u32 & mask_bits(bits),
        remainder as u32 & mask_bits(bits),
    );
    Ok(Outcome::None)
}
