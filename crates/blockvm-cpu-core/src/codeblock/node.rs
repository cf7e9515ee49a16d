use blockvm_x86::{DecodeMode, DecodedInst, Instruction};

use super::Outcome;
use crate::exception::Exception;
use crate::interp::{self, Ctx, NodeHandler};
use crate::mem::MemoryBus;
use crate::state::CpuState;

/// One decoded instruction bound to its handler.
///
/// Nodes are immutable after decode. The chain order is the owning
/// [`super::BasicBlock`]'s vector order; `delta` is the byte offset of the
/// instruction from the block's first byte.
#[derive(Clone, Debug)]
pub struct ExecutionNode {
    inst: DecodedInst,
    delta: u32,
    handler: NodeHandler,
}

impl ExecutionNode {
    pub fn new(inst: DecodedInst, delta: u32) -> Self {
        let handler = interp::handler_for(&inst);
        Self {
            inst,
            delta,
            handler,
        }
    }

    /// Placeholder for an undecodable encoding; raises #UD when reached.
    pub fn invalid(delta: u32) -> Self {
        Self {
            inst: DecodedInst {
                instr: Instruction::default(),
                len: 1,
                operand_size_override: false,
                address_size_override: false,
            },
            delta,
            handler: interp::invalid_opcode,
        }
    }

    #[inline]
    pub fn delta(&self) -> u32 {
        self.delta
    }

    #[inline]
    pub fn len(&self) -> u32 {
        self.inst.len as u32
    }

    pub fn instruction(&self) -> &Instruction {
        &self.inst.instr
    }

    /// Run the instruction. `entry_eip` is the EIP the owning block was
    /// entered at; the node's own EIP is derived from it and `delta`.
    #[inline]
    pub fn execute(
        &self,
        mode: DecodeMode,
        entry_eip: u32,
        cpu: &mut CpuState,
        bus: &mut dyn MemoryBus,
    ) -> Result<Outcome, Exception> {
        let ctx = Ctx {
            inst: &self.inst,
            mode,
            ip: entry_eip.wrapping_add(self.delta) & mode.ip_mask(),
        };
        (self.handler)(&ctx, cpu, bus)
    }
}
