use blockvm_x86::MAX_INSTRUCTION_LEN;

use crate::exception::Exception;
use crate::mem::MemoryBus;

/// Why a byte window is shorter than [`MAX_INSTRUCTION_LEN`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowEnd {
    /// The full instruction-length window was available.
    Full,
    /// The cursor's limit (a page boundary) cut the window short.
    Limit,
    /// Reading the byte at this address failed.
    BusError(u64),
}

pub struct Window<'a> {
    pub bytes: &'a [u8],
    pub end: WindowEnd,
}

/// Reusable forward-only reader over guest memory used while decoding a block.
///
/// The manager owns one cursor and resets it for every request; a spanning
/// block owns its own.
#[derive(Debug, Clone)]
pub struct ByteCursor {
    pos: u64,
    limit: Option<u64>,
    scratch: [u8; MAX_INSTRUCTION_LEN],
}

impl Default for ByteCursor {
    fn default() -> Self {
        Self::new()
    }
}

impl ByteCursor {
    pub fn new() -> Self {
        Self {
            pos: 0,
            limit: None,
            scratch: [0; MAX_INSTRUCTION_LEN],
        }
    }

    /// Point the cursor at `addr`. With a `limit`, no byte at or past it is
    /// ever read.
    pub fn reset(&mut self, addr: u64, limit: Option<u64>) {
        self.pos = addr;
        self.limit = limit;
    }

    pub fn position(&self) -> u64 {
        self.pos
    }

    pub fn at_limit(&self) -> bool {
        self.limit.is_some_and(|limit| self.pos >= limit)
    }

    pub fn advance(&mut self, n: u32) {
        self.pos += n as u64;
    }

    /// Read up to one instruction's worth of bytes at the current position.
    ///
    /// A failing read of the first byte is an instruction-fetch fault; a
    /// failure further in only shortens the window.
    pub fn fill(&mut self, bus: &mut dyn MemoryBus) -> Result<Window<'_>, Exception> {
        let mut want = MAX_INSTRUCTION_LEN;
        let mut end = WindowEnd::Full;
        if let Some(limit) = self.limit {
            let room = limit.saturating_sub(self.pos) as usize;
            if room < want {
                want = room;
                end = WindowEnd::Limit;
            }
        }

        let mut got = 0;
        while got < want {
            let addr = self.pos + got as u64;
            match bus.read_u8(addr) {
                Ok(b) => self.scratch[got] = b,
                Err(e) if got == 0 => return Err(e),
                Err(_) => {
                    end = WindowEnd::BusError(addr);
                    break;
                }
            }
            got += 1;
        }
        Ok(Window {
            bytes: &self.scratch[..got],
            end,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::PhysicalMemory;

    #[test]
    fn window_stops_at_limit() {
        let mut mem = PhysicalMemory::new(0x2000);
        let mut cursor = ByteCursor::new();
        cursor.reset(0xFFC, Some(0x1000));
        let w = cursor.fill(&mut mem).unwrap();
        assert_eq!(w.bytes.len(), 4);
        assert_eq!(w.end, WindowEnd::Limit);
    }

    #[test]
    fn window_is_truncated_at_end_of_memory() {
        let mut mem = PhysicalMemory::new(0x10);
        let mut cursor = ByteCursor::new();
        cursor.reset(0xC, None);
        let w = cursor.fill(&mut mem).unwrap();
        assert_eq!(w.bytes.len(), 4);
        assert_eq!(w.end, WindowEnd::BusError(0x10));

        cursor.reset(0x10, None);
        assert!(cursor.fill(&mut mem).is_err());
    }
}
