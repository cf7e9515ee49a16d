use std::cell::RefCell;
use std::rc::Rc;

use blockvm_x86::DecodeMode;
use tracing::{debug, error, trace};

use super::cursor::ByteCursor;
use super::factory::{
    CodeBlockFactory, CompilingFactory, DecodeRequest, FactoryOutput, InterpretingFactory,
};
use super::spanning::SpanningCodeBlock;
use super::{BlockOrigin, CodeBlock, CodeBlockError};
use crate::jit::{ArtifactCache, JitConfig};
use crate::mem::{page_end, MemoryBus};
use crate::state::CpuMode;

/// Default cap on the number of instructions decoded into one block.
pub const BLOCK_LIMIT: usize = 256;

#[derive(Default, Clone)]
struct FactoryChains {
    compiling: Vec<Rc<dyn CodeBlockFactory>>,
    fallback: Vec<Rc<dyn CodeBlockFactory>>,
}

/// Turns guest bytes into code blocks for each processor mode.
///
/// Each mode has a compiling chain, tried first, and a fallback chain of pure
/// interpreters. A request whose page-limited byte window ends inside an
/// instruction becomes a [`SpanningCodeBlock`] seeded with the fallback chain.
pub struct CodeBlockManager {
    real: FactoryChains,
    protected: FactoryChains,
    virtual8086: FactoryChains,
    cursor: ByteCursor,
    block_limit: usize,
    jit: Option<Rc<RefCell<ArtifactCache>>>,
    spanning_promotions: u64,
}

impl CodeBlockManager {
    /// Interpreter fallback for every mode, plus the compiled-artifact
    /// factory in front of it when `jit.enabled`.
    pub fn new(block_limit: usize, jit: JitConfig) -> Self {
        let mut manager = Self::empty(block_limit);
        let interpreter: Rc<dyn CodeBlockFactory> = Rc::new(InterpretingFactory);
        let compiling: Vec<Rc<dyn CodeBlockFactory>> = if jit.enabled {
            let cache = Rc::new(RefCell::new(ArtifactCache::new(jit)));
            manager.jit = Some(cache.clone());
            let compiled: Rc<dyn CodeBlockFactory> = Rc::new(CompilingFactory::new(cache));
            vec![compiled]
        } else {
            Vec::new()
        };
        for mode in [CpuMode::Real, CpuMode::Protected, CpuMode::Virtual8086] {
            manager.set_chains(mode, compiling.clone(), vec![interpreter.clone()]);
        }
        manager
    }

    /// A manager with no factories registered for any mode.
    pub fn empty(block_limit: usize) -> Self {
        Self {
            real: FactoryChains::default(),
            protected: FactoryChains::default(),
            virtual8086: FactoryChains::default(),
            cursor: ByteCursor::new(),
            block_limit,
            jit: None,
            spanning_promotions: 0,
        }
    }

    pub fn set_chains(
        &mut self,
        mode: CpuMode,
        compiling: Vec<Rc<dyn CodeBlockFactory>>,
        fallback: Vec<Rc<dyn CodeBlockFactory>>,
    ) {
        let chains = match mode {
            CpuMode::Real => &mut self.real,
            CpuMode::Protected => &mut self.protected,
            CpuMode::Virtual8086 => &mut self.virtual8086,
        };
        *chains = FactoryChains { compiling, fallback };
    }

    pub fn block_limit(&self) -> usize {
        self.block_limit
    }

    pub fn spanning_promotions(&self) -> u64 {
        self.spanning_promotions
    }

    pub fn artifacts(&self) -> Option<&Rc<RefCell<ArtifactCache>>> {
        self.jit.as_ref()
    }

    pub fn real_mode_code_block_at(
        &mut self,
        bus: &mut dyn MemoryBus,
        linear: u64,
    ) -> Result<CodeBlock, CodeBlockError> {
        self.code_block_at(bus, CpuMode::Real, DecodeMode::Bits16, linear)
    }

    pub fn protected_mode_code_block_at(
        &mut self,
        bus: &mut dyn MemoryBus,
        linear: u64,
        operand_size_32: bool,
    ) -> Result<CodeBlock, CodeBlockError> {
        let decode_mode = if operand_size_32 {
            DecodeMode::Bits32
        } else {
            DecodeMode::Bits16
        };
        self.code_block_at(bus, CpuMode::Protected, decode_mode, linear)
    }

    pub fn virtual8086_mode_code_block_at(
        &mut self,
        bus: &mut dyn MemoryBus,
        linear: u64,
    ) -> Result<CodeBlock, CodeBlockError> {
        self.code_block_at(bus, CpuMode::Virtual8086, DecodeMode::Bits16, linear)
    }

    fn code_block_at(
        &mut self,
        bus: &mut dyn MemoryBus,
        mode: CpuMode,
        decode_mode: DecodeMode,
        linear: u64,
    ) -> Result<CodeBlock, CodeBlockError> {
        let chains = match mode {
            CpuMode::Real => &self.real,
            CpuMode::Protected => &self.protected,
            CpuMode::Virtual8086 => &self.virtual8086,
        };
        let req = DecodeRequest {
            mode,
            decode_mode,
            linear,
            // Branch targets are computed relative to the runtime EIP, so the
            // decode-time IP only has to be consistent within the block.
            ip: linear as u32 & decode_mode.ip_mask(),
            block_limit: self.block_limit,
        };

        let mut underrun = false;
        for factory in chains.compiling.iter().chain(chains.fallback.iter()) {
            self.cursor.reset(linear, Some(page_end(linear)));
            match factory.produce(&req, &mut self.cursor, bus).map_err(CodeBlockError::Fetch)? {
                FactoryOutput::Block(block) => {
                    trace!(
                        factory = factory.name(),
                        linear,
                        instructions = block.instruction_count(),
                        bytes = block.byte_length(),
                        "decoded block"
                    );
                    return Ok(block);
                }
                FactoryOutput::Underrun => {
                    underrun = true;
                    break;
                }
                FactoryOutput::Declined => {}
            }
        }

        if underrun {
            debug!(linear, ?mode, "decode ran past the page; promoting to spanning block");
            self.spanning_promotions += 1;
            return Ok(CodeBlock::Spanning(SpanningCodeBlock::new(
                mode,
                decode_mode,
                linear,
                self.block_limit,
                chains.fallback.clone(),
            )));
        }

        error!(linear, ?mode, "no factory capable of producing a code block");
        Err(CodeBlockError::NoFactory { mode, address: linear })
    }

    /// Hotness bookkeeping after `block` ran with its first instruction at `ip`.
    pub fn note_executed(&mut self, block: &CodeBlock, ip: u32, bus: &mut dyn MemoryBus) {
        let Some(jit) = &self.jit else {
            return;
        };
        if block.is_spanning() || block.origin() != Some(BlockOrigin::Interpreted) {
            return;
        }
        let Some(basic) = block.basic_block() else {
            return;
        };
        jit.borrow_mut().record_execution(
            block.linear(),
            ip,
            basic.decode_mode(),
            self.block_limit,
            basic.byte_length(),
            bus,
        );
    }

    /// Collect finished background compilations. Returns the linear
    /// addresses whose cached interpreted blocks should be refetched.
    pub fn poll_compiled(&mut self) -> Vec<u64> {
        match &self.jit {
            Some(jit) => {
                let mut jit = jit.borrow_mut();
                jit.poll();
                jit.take_newly_installed()
            }
            None => Vec::new(),
        }
    }

    /// Drop the hotness count of a block the caller no longer caches.
    pub fn forget_block(&mut self, linear: u64, decode_mode: DecodeMode) {
        if let Some(jit) = &self.jit {
            jit.borrow_mut().forget(linear, decode_mode);
        }
    }

    /// Forward a guest write to the compiled-artifact cache.
    pub fn handle_memory_region_change(&mut self, start: u64, end: u64) {
        if let Some(jit) = &self.jit {
            jit.borrow_mut().on_guest_write(start, end);
        }
    }
}
