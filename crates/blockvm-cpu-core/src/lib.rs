//! Block-based x86 execution core.
//!
//! Guest bytes are decoded into [`codeblock::BasicBlock`]s of execution nodes,
//! wrapped in mode-tagged [`codeblock::CodeBlock`]s, cached by the
//! [`exec::ExecDriver`] and invalidated when the guest writes over them. Real,
//! protected and virtual-8086 mode are supported; paging is not.

#![forbid(unsafe_code)]

pub mod codeblock;
pub mod exception;
pub mod exec;
pub mod interp;
pub mod interrupts;
pub mod jit;
pub mod mem;
pub mod stack;
pub mod state;

pub use codeblock::{
    BasicBlock, BlockExit, CodeBlock, CodeBlockError, CodeBlockManager, Outcome, BLOCK_LIMIT,
};
pub use exception::{CpuExit, Exception};
pub use exec::{ExecConfig, ExecDriver, ExecError, ExecStats, StepOutcome, Vcpu};
pub use interrupts::{InterruptQueue, InterruptSource};
pub use jit::JitConfig;
pub use mem::{MemoryBus, PhysicalMemory, PAGE_SIZE};
pub use state::{CpuMode, CpuState, EFlags, SegReg, Segment};
