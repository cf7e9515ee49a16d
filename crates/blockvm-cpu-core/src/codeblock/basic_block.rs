use blockvm_x86::DecodeMode;

use super::node::ExecutionNode;
use super::{BlockExit, Outcome};
use crate::mem::MemoryBus;
use crate::state::CpuState;

/// EIP of the instruction `delta` bytes into a block entered at `entry_eip`.
#[inline]
pub fn precise_eip(entry_eip: u32, delta: u32, ip_mask: u32) -> u32 {
    entry_eip.wrapping_add(delta) & ip_mask
}

/// The nodes decoded from one contiguous byte run.
#[derive(Clone, Debug)]
pub struct BasicBlock {
    mode: DecodeMode,
    nodes: Vec<ExecutionNode>,
    byte_length: u32,
}

impl BasicBlock {
    pub fn new(mode: DecodeMode, nodes: Vec<ExecutionNode>) -> Self {
        let byte_length = nodes.last().map_or(0, |n| n.delta() + n.len());
        Self {
            mode,
            nodes,
            byte_length,
        }
    }

    pub fn decode_mode(&self) -> DecodeMode {
        self.mode
    }

    pub fn byte_length(&self) -> u32 {
        self.byte_length
    }

    pub fn instruction_count(&self) -> u32 {
        self.nodes.len() as u32
    }

    pub fn nodes(&self) -> &[ExecutionNode] {
        &self.nodes
    }

    /// Run the chain from the current EIP.
    ///
    /// Running off the end of the chain advances EIP by the block's byte
    /// length. A node that returns any other outcome has already placed EIP.
    /// A node that faults leaves EIP at its own first byte with the exception
    /// queued on the CPU, and the block reports [`Outcome::Fault`].
    pub fn execute(&self, cpu: &mut CpuState, bus: &mut dyn MemoryBus) -> BlockExit {
        // Pre-block hook: everything below is relative to the entry EIP.
        let entry_eip = cpu.eip();

        for (idx, node) in self.nodes.iter().enumerate() {
            match node.execute(self.mode, entry_eip, cpu, bus) {
                Ok(Outcome::None) => cpu.end_instruction(),
                Ok(outcome) => {
                    cpu.end_instruction();
                    return BlockExit {
                        outcome,
                        retired: idx as u32 + 1,
                    };
                }
                Err(exception) => {
                    cpu.set_eip(precise_eip(entry_eip, node.delta(), self.mode.ip_mask()));
                    cpu.raise_exception_fault(exception);
                    return BlockExit {
                        outcome: Outcome::Fault,
                        retired: idx as u32,
                    };
                }
            }
        }

        cpu.set_eip(entry_eip.wrapping_add(self.byte_length));
        BlockExit {
            outcome: Outcome::None,
            retired: self.nodes.len() as u32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precise_eip_wraps_within_the_ip_width() {
        assert_eq!(precise_eip(0xFFFE, 3, 0xFFFF), 0x0001);
        assert_eq!(precise_eip(0xFFFE, 3, u32::MAX), 0x1_0001);
    }
}
