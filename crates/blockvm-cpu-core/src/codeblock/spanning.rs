use std::rc::Rc;

use blockvm_x86::DecodeMode;
use tracing::{debug, error, warn};

use super::cursor::ByteCursor;
use super::factory::{CodeBlockFactory, DecodeRequest, FactoryOutput};
use super::{BlockExit, CodeBlock, CodeBlockError, Outcome};
use crate::mem::MemoryBus;
use crate::state::{CpuMode, CpuState};

/// Redecodes at multiples of this count are reported as a likely storm.
const REDECODE_WARN_INTERVAL: u64 = 256;

/// A block whose bytes run across a page boundary.
///
/// Decoding is deferred until the block first executes and is done against
/// the whole of guest memory rather than a single page. The result is kept in
/// a single cache slot until a write overlaps it.
pub struct SpanningCodeBlock {
    mode: CpuMode,
    decode_mode: DecodeMode,
    linear: u64,
    block_limit: usize,
    factories: Vec<Rc<dyn CodeBlockFactory>>,
    cursor: ByteCursor,
    cached: Option<Box<CodeBlock>>,
    decodes: u64,
}

impl std::fmt::Debug for SpanningCodeBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpanningCodeBlock")
            .field("mode", &self.mode)
            .field("linear", &format_args!("{:#x}", self.linear))
            .field("cached", &self.cached.is_some())
            .field("decodes", &self.decodes)
            .finish()
    }
}

impl SpanningCodeBlock {
    pub fn new(
        mode: CpuMode,
        decode_mode: DecodeMode,
        linear: u64,
        block_limit: usize,
        factories: Vec<Rc<dyn CodeBlockFactory>>,
    ) -> Self {
        Self {
            mode,
            decode_mode,
            linear,
            block_limit,
            factories,
            cursor: ByteCursor::new(),
            cached: None,
            decodes: 0,
        }
    }

    pub fn mode(&self) -> CpuMode {
        self.mode
    }

    pub fn decode_mode(&self) -> DecodeMode {
        self.decode_mode
    }

    pub fn linear(&self) -> u64 {
        self.linear
    }

    pub fn is_cached(&self) -> bool {
        self.cached.is_some()
    }

    /// Number of times the block has been (re)decoded.
    pub fn decode_count(&self) -> u64 {
        self.decodes
    }

    pub fn cached(&self) -> Option<&CodeBlock> {
        self.cached.as_deref()
    }

    /// Drop the cached decode; the next `execute` decodes again.
    pub fn invalidate(&mut self) {
        self.cached = None;
    }

    /// Drops the cached decode if the write overlaps it. Always reports
    /// `false`: the spanning block itself stays valid.
    pub fn handle_memory_region_change(&mut self, start: u64, end: u64) -> bool {
        if let Some(block) = self.cached.as_deref_mut() {
            if block.handle_memory_region_change(start, end) {
                debug!(linear = self.linear, start, end, "spanning block invalidated");
                self.invalidate();
            }
        }
        false
    }

    pub fn execute(
        &mut self,
        cpu: &mut CpuState,
        bus: &mut dyn MemoryBus,
    ) -> Result<BlockExit, CodeBlockError> {
        if self.cached.is_none() {
            match self.decode(cpu.eip(), bus) {
                Ok(block) => self.cached = Some(Box::new(block)),
                Err(CodeBlockError::Fetch(exception)) => {
                    cpu.raise_exception_fault(exception);
                    return Ok(BlockExit {
                        outcome: Outcome::Fault,
                        retired: 0,
                    });
                }
                Err(e) => return Err(e),
            }
        }
        match self.cached.as_deref_mut() {
            Some(block) => block.execute(cpu, bus),
            None => Err(self.exhausted()),
        }
    }

    fn decode(&mut self, ip: u32, bus: &mut dyn MemoryBus) -> Result<CodeBlock, CodeBlockError> {
        self.decodes += 1;
        if self.decodes % REDECODE_WARN_INTERVAL == 0 {
            warn!(
                linear = self.linear,
                decodes = self.decodes,
                "spanning block keeps getting invalidated"
            );
        }

        let req = DecodeRequest {
            mode: self.mode,
            decode_mode: self.decode_mode,
            linear: self.linear,
            ip,
            block_limit: self.block_limit,
        };
        for factory in &self.factories {
            self.cursor.reset(self.linear, None);
            match factory.produce(&req, &mut self.cursor, bus).map_err(CodeBlockError::Fetch)? {
                FactoryOutput::Block(CodeBlock::Spanning(_)) => continue,
                FactoryOutput::Block(block) => return Ok(block),
                // An unbounded cursor never underruns; running off readable
                // memory comes back as a fetch fault at the failing byte.
                FactoryOutput::Underrun => {
                    error!(
                        linear = self.linear,
                        factory = factory.name(),
                        "factory reported an underrun without a page limit"
                    );
                    return Err(self.exhausted());
                }
                FactoryOutput::Declined => continue,
            }
        }
        Err(self.exhausted())
    }

    fn exhausted(&self) -> CodeBlockError {
        CodeBlockError::NoFactory {
            mode: self.mode,
            address: self.linear,
        }
    }
}
