use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use blockvm_x86::{decode_one, DecodeError, DecodeMode};

use super::basic_block::BasicBlock;
use super::cursor::{ByteCursor, WindowEnd};
use super::node::ExecutionNode;
use super::{BlockOrigin, CodeBlock};
use crate::exception::Exception;
use crate::interp;
use crate::jit::ArtifactCache;
use crate::mem::MemoryBus;
use crate::state::CpuMode;

/// Everything a factory needs to know about the block being requested.
#[derive(Debug, Clone, Copy)]
pub struct DecodeRequest {
    pub mode: CpuMode,
    pub decode_mode: DecodeMode,
    /// Linear address of the first instruction byte (where the cursor starts).
    pub linear: u64,
    /// EIP of the first instruction.
    pub ip: u32,
    /// Instruction-count cap for the block.
    pub block_limit: usize,
}

#[derive(Debug)]
pub enum FactoryOutput {
    Block(CodeBlock),
    /// The byte window ended inside an instruction.
    Underrun,
    /// This factory does not handle the request; try the next one.
    Declined,
}

/// A decode strategy. Factories are tried in order by the manager and by
/// spanning blocks until one produces a block.
pub trait CodeBlockFactory {
    fn name(&self) -> &'static str;

    /// Produce a block starting at the cursor. Only a fetch fault on the very
    /// first byte is reported as an error.
    fn produce(
        &self,
        req: &DecodeRequest,
        cursor: &mut ByteCursor,
        bus: &mut dyn MemoryBus,
    ) -> Result<FactoryOutput, Exception>;
}

#[derive(Debug)]
pub enum DecodedBlock {
    Block(BasicBlock),
    Underrun,
}

/// Decode nodes until a block-ending instruction, the instruction cap, the
/// cursor limit or the end of readable memory.
pub fn decode_basic_block(
    req: &DecodeRequest,
    cursor: &mut ByteCursor,
    bus: &mut dyn MemoryBus,
) -> Result<DecodedBlock, Exception> {
    let limit = req.block_limit.max(1);
    let ip_mask = req.decode_mode.ip_mask();
    let mut nodes = Vec::new();
    let mut delta = 0u32;

    while nodes.len() < limit {
        if !nodes.is_empty() && cursor.at_limit() {
            break;
        }
        let window = match cursor.fill(bus) {
            Ok(window) => window,
            Err(e) if nodes.is_empty() => return Err(e),
            Err(_) => break,
        };
        let end = window.end;
        let ip = req.ip.wrapping_add(delta) & ip_mask;

        match decode_one(req.decode_mode, ip as u64, window.bytes) {
            Ok(inst) => {
                let len = inst.len as u32;
                let ends = interp::ends_block(&inst);
                nodes.push(ExecutionNode::new(inst, delta));
                delta += len;
                cursor.advance(len);
                if ends {
                    break;
                }
            }
            Err(DecodeError::Underrun { .. }) => match end {
                WindowEnd::Limit => return Ok(DecodedBlock::Underrun),
                WindowEnd::BusError(addr) if nodes.is_empty() => {
                    return Err(Exception::MemoryFault { addr });
                }
                WindowEnd::BusError(_) => break,
                // The decoder treats a full window that still runs dry as an
                // over-long encoding, so this is effectively unreachable.
                WindowEnd::Full => {
                    nodes.push(ExecutionNode::invalid(delta));
                    break;
                }
            },
            Err(DecodeError::InvalidInstruction) => {
                nodes.push(ExecutionNode::invalid(delta));
                break;
            }
        }
    }

    Ok(DecodedBlock::Block(BasicBlock::new(req.decode_mode, nodes)))
}

/// Pure interpretation: decode nodes straight from guest memory.
#[derive(Debug, Default, Clone, Copy)]
pub struct InterpretingFactory;

impl CodeBlockFactory for InterpretingFactory {
    fn name(&self) -> &'static str {
        "interpreter"
    }

    fn produce(
        &self,
        req: &DecodeRequest,
        cursor: &mut ByteCursor,
        bus: &mut dyn MemoryBus,
    ) -> Result<FactoryOutput, Exception> {
        Ok(match decode_basic_block(req, cursor, bus)? {
            DecodedBlock::Block(block) => FactoryOutput::Block(CodeBlock::new(
                req.mode,
                req.linear,
                Arc::new(block),
                BlockOrigin::Interpreted,
            )),
            DecodedBlock::Underrun => FactoryOutput::Underrun,
        })
    }
}

/// Serves blocks the background compiler has already built.
///
/// Never blocks: if no validated artifact exists for the request it declines
/// and the fallback chain interprets.
pub struct CompilingFactory {
    artifacts: Rc<RefCell<ArtifactCache>>,
}

impl CompilingFactory {
    pub fn new(artifacts: Rc<RefCell<ArtifactCache>>) -> Self {
        Self { artifacts }
    }
}

impl CodeBlockFactory for CompilingFactory {
    fn name(&self) -> &'static str {
        "compiled"
    }

    fn produce(
        &self,
        req: &DecodeRequest,
        _cursor: &mut ByteCursor,
        bus: &mut dyn MemoryBus,
    ) -> Result<FactoryOutput, Exception> {
        let mut artifacts = self.artifacts.borrow_mut();
        artifacts.poll();
        Ok(match artifacts.lookup(req.linear, req.decode_mode, bus) {
            Some(block) => FactoryOutput::Block(CodeBlock::new(
                req.mode,
                req.linear,
                block,
                BlockOrigin::Compiled,
            )),
            None => FactoryOutput::Declined,
        })
    }
}
