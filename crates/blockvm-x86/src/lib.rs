#![forbid(unsafe_code)]

//! x86 decoding front-end for the block decoder.
//!
//! The project uses `iced-x86` as the underlying decoder, but we keep a small
//! wrapper API so the code-block layer does not drive the `iced-x86` decoder
//! directly. The important property exported here is the split between an
//! instruction that is genuinely invalid and one that simply needs more bytes
//! than the caller supplied ([`DecodeError::Underrun`]).

use iced_x86::{Decoder, DecoderError, DecoderOptions};

pub use iced_x86::{
    Code, ConditionCode, FlowControl, Instruction, MemorySize, Mnemonic, OpKind, Register,
};

/// Architectural maximum length of a single x86 instruction.
pub const MAX_INSTRUCTION_LEN: usize = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DecodeMode {
    Bits16,
    Bits32,
}

impl DecodeMode {
    pub fn from_bitness(bitness: u32) -> Option<Self> {
        match bitness {
            16 => Some(DecodeMode::Bits16),
            32 => Some(DecodeMode::Bits32),
            _ => None,
        }
    }

    pub const fn bitness(self) -> u32 {
        match self {
            DecodeMode::Bits16 => 16,
            DecodeMode::Bits32 => 32,
        }
    }

    pub const fn ip_mask(self) -> u32 {
        match self {
            DecodeMode::Bits16 => 0xFFFF,
            DecodeMode::Bits32 => 0xFFFF_FFFF,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// The byte window ended before an instruction boundary was reached.
    #[error("instruction runs past the end of the {available}-byte window")]
    Underrun { available: usize },
    #[error("invalid instruction encoding")]
    InvalidInstruction,
}

#[derive(Debug, Clone)]
pub struct DecodedInst {
    pub instr: Instruction,
    pub len: u8,
    /// 0x66 seen in the legacy prefix run.
    pub operand_size_override: bool,
    /// 0x67 seen in the legacy prefix run.
    pub address_size_override: bool,
}

impl DecodedInst {
    /// Effective operand size in bits.
    pub fn operand_size(&self, mode: DecodeMode) -> u32 {
        match (mode, self.operand_size_override) {
            (DecodeMode::Bits16, false) | (DecodeMode::Bits32, true) => 16,
            _ => 32,
        }
    }

    /// Effective address size in bits (also the width of the count register
    /// used by LOOP/JCXZ).
    pub fn address_size(&self, mode: DecodeMode) -> u32 {
        match (mode, self.address_size_override) {
            (DecodeMode::Bits16, false) | (DecodeMode::Bits32, true) => 16,
            _ => 32,
        }
    }

    /// Signed displacement of a near branch relative to the end of this
    /// instruction, independent of the IP the instruction was decoded at.
    pub fn near_branch_rel(&self, mode: DecodeMode) -> Option<i32> {
        match self.instr.op0_kind() {
            OpKind::NearBranch16 | OpKind::NearBranch32 => {
                let target = self.instr.near_branch_target() as u32;
                let next = self.instr.next_ip() as u32;
                let rel = target.wrapping_sub(next) & mode.ip_mask();
                Some(match mode {
                    DecodeMode::Bits16 => rel as u16 as i16 as i32,
                    DecodeMode::Bits32 => rel as i32,
                })
            }
            _ => None,
        }
    }

    /// Whether executing this instruction can leave the current basic block.
    pub fn ends_block(&self) -> bool {
        !matches!(self.instr.flow_control(), FlowControl::Next)
    }
}

/// Decode exactly one instruction from `bytes`.
///
/// `ip` is the instruction pointer (code segment offset, not linear address)
/// the bytes are decoded at. The decoder never looks past the end of `bytes`.
pub fn decode_one(mode: DecodeMode, ip: u64, bytes: &[u8]) -> Result<DecodedInst, DecodeError> {
    let window = &bytes[..bytes.len().min(MAX_INSTRUCTION_LEN)];
    if window.is_empty() {
        return Err(DecodeError::Underrun { available: 0 });
    }

    let mut decoder = Decoder::with_ip(mode.bitness(), window, ip, DecoderOptions::NONE);
    let instr = decoder.decode();
    match decoder.last_error() {
        DecoderError::None => {
            let len = instr.len();
            let (operand_size_override, address_size_override) = scan_prefixes(&window[..len]);
            Ok(DecodedInst {
                len: len as u8,
                instr,
                operand_size_override,
                address_size_override,
            })
        }
        // A full 15-byte window that still runs dry is an over-long encoding.
        DecoderError::NoMoreBytes if window.len() < MAX_INSTRUCTION_LEN => {
            Err(DecodeError::Underrun {
                available: window.len(),
            })
        }
        _ => Err(DecodeError::InvalidInstruction),
    }
}

fn scan_prefixes(bytes: &[u8]) -> (bool, bool) {
    let mut opsize = false;
    let mut addrsize = false;
    for &b in bytes {
        match b {
            0x66 => opsize = true,
            0x67 => addrsize = true,
            0x26 | 0x2E | 0x36 | 0x3E | 0x64 | 0x65 | 0xF0 | 0xF2 | 0xF3 => {}
            _ => break,
        }
    }
    (opsize, addrsize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn near_branch_rel_is_position_independent() {
        // jmp short $ (infinite loop)
        let a = decode_one(DecodeMode::Bits16, 0x100, &[0xEB, 0xFE]).unwrap();
        let b = decode_one(DecodeMode::Bits16, 0xFFFF, &[0xEB, 0xFE]).unwrap();
        assert_eq!(a.near_branch_rel(DecodeMode::Bits16), Some(-2));
        assert_eq!(b.near_branch_rel(DecodeMode::Bits16), Some(-2));
    }

    #[test]
    fn size_overrides_come_from_the_prefix_run() {
        // mov eax, [ebx] in 16-bit code: 66 67 8B 03
        let inst = decode_one(DecodeMode::Bits16, 0, &[0x66, 0x67, 0x8B, 0x03]).unwrap();
        assert_eq!(inst.operand_size(DecodeMode::Bits16), 32);
        assert_eq!(inst.address_size(DecodeMode::Bits16), 32);

        // mov ax, 0x6666: the immediate bytes are not prefixes.
        let inst = decode_one(DecodeMode::Bits16, 0, &[0xB8, 0x66, 0x66]).unwrap();
        assert_eq!(inst.operand_size(DecodeMode::Bits16), 16);
    }

    #[test]
    fn empty_window_is_underrun() {
        assert_eq!(
            decode_one(DecodeMode::Bits32, 0, &[]).unwrap_err(),
            DecodeError::Underrun { available: 0 }
        );
    }
}
