//! Decoded code blocks and the factories that produce them.
//!
//! A [`CodeBlock`] is a mode-tagged wrapper around one [`BasicBlock`]: the
//! node chain decoded from a contiguous run of guest bytes that never crosses
//! a page boundary. Runs that would cross one become a
//! [`SpanningCodeBlock`], which decodes lazily against the whole of guest
//! memory and caches the result until a write overlaps it.
//!
//! The [`CodeBlockManager`] owns the factory chains for each mode and is the
//! only place raw guest bytes turn into blocks.

mod basic_block;
mod cursor;
mod factory;
mod manager;
mod node;
mod spanning;

use std::sync::Arc;

pub use basic_block::{precise_eip, BasicBlock};
pub use cursor::{ByteCursor, Window, WindowEnd};
pub use factory::{
    decode_basic_block, CodeBlockFactory, CompilingFactory, DecodeRequest, DecodedBlock,
    FactoryOutput, InterpretingFactory,
};
pub use manager::{CodeBlockManager, BLOCK_LIMIT};
pub use node::ExecutionNode;
pub use spanning::SpanningCodeBlock;

use crate::exception::Exception;
use crate::mem::MemoryBus;
use crate::state::{CpuMode, CpuState};

/// How a node or block finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    /// Fell through; the next node (or the next block) follows.
    None,
    BranchTaken,
    BranchNotTaken,
    IndirectJump,
    IndirectCall,
    DirectCall,
    Return,
    /// EIP was restored to the faulting instruction and the exception is
    /// pending on the CPU.
    Fault,
    /// The processor mode or code segment size changed; EIP is already at
    /// the next instruction to run.
    ModeSwitch,
    Halt,
}

/// Result of running one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockExit {
    pub outcome: Outcome,
    /// Instructions that completed. A faulting instruction does not count.
    pub retired: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOrigin {
    Interpreted,
    /// Built by the background compiler and validated against memory.
    Compiled,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodeBlockError {
    #[error("instruction fetch faulted: {0:?}")]
    Fetch(Exception),
    #[error("no factory capable of producing a {mode:?} code block at {address:#x}")]
    NoFactory { mode: CpuMode, address: u64 },
}

/// A decoded block plus where it lives in the linear address space.
#[derive(Debug, Clone)]
pub struct ModeBlock {
    linear: u64,
    block: Arc<BasicBlock>,
    origin: BlockOrigin,
}

impl ModeBlock {
    pub fn block(&self) -> &BasicBlock {
        &self.block
    }

    fn overlaps(&self, start: u64, end: u64) -> bool {
        let block_end = self.linear + self.block.byte_length() as u64;
        start < block_end && self.linear < end
    }
}

#[derive(Debug)]
pub enum CodeBlock {
    RealMode(ModeBlock),
    ProtectedMode(ModeBlock),
    Virtual8086(ModeBlock),
    Spanning(SpanningCodeBlock),
}

impl CodeBlock {
    pub fn new(mode: CpuMode, linear: u64, block: Arc<BasicBlock>, origin: BlockOrigin) -> Self {
        let inner = ModeBlock {
            linear,
            block,
            origin,
        };
        match mode {
            CpuMode::Real => CodeBlock::RealMode(inner),
            CpuMode::Protected => CodeBlock::ProtectedMode(inner),
            CpuMode::Virtual8086 => CodeBlock::Virtual8086(inner),
        }
    }

    fn inner(&self) -> Option<&ModeBlock> {
        match self {
            CodeBlock::RealMode(b)
            | CodeBlock::ProtectedMode(b)
            | CodeBlock::Virtual8086(b) => Some(b),
            CodeBlock::Spanning(_) => None,
        }
    }

    pub fn mode(&self) -> CpuMode {
        match self {
            CodeBlock::RealMode(_) => CpuMode::Real,
            CodeBlock::ProtectedMode(_) => CpuMode::Protected,
            CodeBlock::Virtual8086(_) => CpuMode::Virtual8086,
            CodeBlock::Spanning(s) => s.mode(),
        }
    }

    pub fn linear(&self) -> u64 {
        match self {
            CodeBlock::Spanning(s) => s.linear(),
            _ => self.inner().map_or(0, |b| b.linear),
        }
    }

    pub fn is_spanning(&self) -> bool {
        matches!(self, CodeBlock::Spanning(_))
    }

    /// `None` for a spanning block that has not been decoded yet.
    pub fn origin(&self) -> Option<BlockOrigin> {
        match self {
            CodeBlock::Spanning(s) => s.cached().and_then(CodeBlock::origin),
            _ => self.inner().map(|b| b.origin),
        }
    }

    pub fn basic_block(&self) -> Option<&BasicBlock> {
        match self {
            CodeBlock::Spanning(s) => s.cached().and_then(CodeBlock::basic_block),
            _ => self.inner().map(|b| b.block()),
        }
    }

    /// Guest bytes covered. Zero for an undecoded spanning block.
    pub fn byte_length(&self) -> u32 {
        self.basic_block().map_or(0, BasicBlock::byte_length)
    }

    pub fn instruction_count(&self) -> u32 {
        self.basic_block().map_or(0, BasicBlock::instruction_count)
    }

    /// Run the block against `cpu`, which must be in this block's mode.
    pub fn execute(
        &mut self,
        cpu: &mut CpuState,
        bus: &mut dyn MemoryBus,
    ) -> Result<BlockExit, CodeBlockError> {
        debug_assert_eq!(cpu.mode(), self.mode(), "block executed in the wrong mode");
        match self {
            CodeBlock::RealMode(b) | CodeBlock::ProtectedMode(b) | CodeBlock::Virtual8086(b) => {
                Ok(b.block.execute(cpu, bus))
            }
            CodeBlock::Spanning(s) => s.execute(cpu, bus),
        }
    }

    /// Whether the block's bytes overlap the written range `[start, end)`.
    /// A spanning block drops its own cached decode and reports `false`.
    pub fn handle_memory_region_change(&mut self, start: u64, end: u64) -> bool {
        match self {
            CodeBlock::RealMode(b)
            | CodeBlock::ProtectedMode(b)
            | CodeBlock::Virtual8086(b) => b.overlaps(start, end),
            CodeBlock::Spanning(s) => s.handle_memory_region_change(start, end),
        }
    }
}
