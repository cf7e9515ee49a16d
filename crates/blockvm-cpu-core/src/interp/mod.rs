//! Per-instruction semantics.
//!
//! Each decoded instruction is bound, once at decode time, to a handler chosen
//! from its mnemonic and operand shapes. Handlers run against the processor
//! state and the memory bus and return a block [`Outcome`]. A handler that
//! returns [`Outcome::None`] must not touch EIP: the owning block advances it
//! once the chain ends. Any other outcome means the handler has already set
//! EIP to wherever execution continues.
//!
//! Only a subset of the instruction set is implemented; everything else binds
//! to [`invalid_opcode`] and raises #UD when executed.

pub mod alu;
pub mod operand;

mod ops_alu;
mod ops_branch;
mod ops_data;
mod ops_system;

use blockvm_x86::{DecodeMode, DecodedInst, Mnemonic, Register};

use crate::codeblock::Outcome;
use crate::exception::Exception;
use crate::mem::MemoryBus;
use crate::state::CpuState;

/// Everything a handler knows about the instruction it is executing.
pub struct Ctx<'a> {
    pub inst: &'a DecodedInst,
    pub mode: DecodeMode,
    /// EIP of this instruction, derived from the block's entry EIP.
    pub ip: u32,
}

impl Ctx<'_> {
    #[inline]
    pub fn next_ip(&self) -> u32 {
        self.ip.wrapping_add(self.inst.len as u32) & self.mode.ip_mask()
    }

    #[inline]
    pub fn operand_size(&self) -> u32 {
        self.inst.operand_size(self.mode)
    }

    #[inline]
    pub fn address_size(&self) -> u32 {
        self.inst.address_size(self.mode)
    }

    /// Target of a relative branch, wrapped to the operand size.
    pub fn near_target(&self) -> Option<u32> {
        let rel = self.inst.near_branch_rel(self.mode)?;
        let target = self.next_ip().wrapping_add(rel as u32);
        Some(if self.operand_size() == 16 { target & 0xFFFF } else { target })
    }
}

pub type NodeHandler = fn(&Ctx, &mut CpuState, &mut dyn MemoryBus) -> Result<Outcome, Exception>;

/// Pick the handler for a decoded instruction.
pub fn handler_for(inst: &DecodedInst) -> NodeHandler {
    let m = inst.instr.mnemonic();
    ops_system::handler(m, inst)
        .or_else(|| ops_data::handler(m, inst))
        .or_else(|| ops_alu::handler(m))
        .or_else(|| ops_branch::handler(m, inst))
        .unwrap_or(invalid_opcode)
}

/// Whether the block must close after this instruction.
///
/// Besides architectural control flow, anything that can change the
/// processor mode, halt, or change IF ends the block so the driver gets a
/// chance to react before the next fetch.
pub fn ends_block(inst: &DecodedInst) -> bool {
    if inst.ends_block() {
        return true;
    }
    let instr = &inst.instr;
    match instr.mnemonic() {
        Mnemonic::Hlt | Mnemonic::Lmsw | Mnemonic::Popf | Mnemonic::Popfd | Mnemonic::Sti => true,
        Mnemonic::Mov => instr.op0_register() == Register::CR0,
        _ => false,
    }
}

pub fn invalid_opcode(
    _: &Ctx,
    _: &mut CpuState,
    _: &mut dyn MemoryBus,
) -> Result<Outcome, Exception> {
    Err(Exception::InvalidOpcode)
}
