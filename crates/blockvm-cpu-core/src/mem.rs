use crate::exception::Exception;

/// Guest page size. A block's decode window never extends past the end of the
/// page its first byte lives in.
pub const PAGE_SIZE: u64 = 4096;

#[inline]
pub const fn page_end(addr: u64) -> u64 {
    (addr & !(PAGE_SIZE - 1)) + PAGE_SIZE
}

/// Linear-address memory as seen by execution nodes and the block decoder.
///
/// Paging is not modelled: linear addresses are physical addresses.
pub trait MemoryBus {
    fn read_u8(&mut self, addr: u64) -> Result<u8, Exception>;
    fn write_u8(&mut self, addr: u64, val: u8) -> Result<(), Exception>;

    fn read_u16(&mut self, addr: u64) -> Result<u16, Exception> {
        let lo = self.read_u8(addr)? as u16;
        let hi = self.read_u8(addr.wrapping_add(1))? as u16;
        Ok(lo | (hi << 8))
    }

    fn read_u32(&mut self, addr: u64) -> Result<u32, Exception> {
        let lo = self.read_u16(addr)? as u32;
        let hi = self.read_u16(addr.wrapping_add(2))? as u32;
        Ok(lo | (hi << 16))
    }

    fn write_u16(&mut self, addr: u64, val: u16) -> Result<(), Exception> {
        self.write_u8(addr, val as u8)?;
        self.write_u8(addr.wrapping_add(1), (val >> 8) as u8)
    }

    fn write_u32(&mut self, addr: u64, val: u32) -> Result<(), Exception> {
        self.write_u16(addr, val as u16)?;
        self.write_u16(addr.wrapping_add(2), (val >> 16) as u16)
    }

    fn io_read(&mut self, _port: u16, size: u32) -> Result<u32, Exception> {
        Ok(crate::state::mask_bits(size * 8))
    }

    fn io_write(&mut self, _port: u16, _size: u32, _val: u32) -> Result<(), Exception> {
        Ok(())
    }

    /// Report every half-open `[start, end)` range written since the previous
    /// call. Code-block owners use this to invalidate decoded blocks.
    fn drain_modified_regions(&mut self, _sink: &mut dyn FnMut(u64, u64)) {}
}

/// Flat guest RAM that records written ranges for code-block invalidation.
#[derive(Debug, Clone)]
pub struct PhysicalMemory {
    mem: Vec<u8>,
    modified: Vec<(u64, u64)>,
}

impl PhysicalMemory {
    pub fn new(size: usize) -> Self {
        Self {
            mem: vec![0; size],
            modified: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.mem.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mem.is_empty()
    }

    /// Host-side bulk load. Treated as a guest write for invalidation.
    pub fn load(&mut self, addr: u64, data: &[u8]) {
        let start = addr as usize;
        let end = start + data.len();
        self.mem[start..end].copy_from_slice(data);
        self.note_write(addr, data.len() as u64);
    }

    pub fn slice(&self, addr: u64, len: usize) -> &[u8] {
        let start = addr as usize;
        &self.mem[start..start + len]
    }

    fn note_write(&mut self, addr: u64, len: u64) {
        let end = addr + len;
        if let Some(last) = self.modified.last_mut() {
            // Stack pushes and string stores tend to be adjacent; coalesce them.
            if addr <= last.1 && end >= last.0 {
                last.0 = last.0.min(addr);
                last.1 = last.1.max(end);
                return;
            }
        }
        self.modified.push((addr, end));
    }
}

impl MemoryBus for PhysicalMemory {
    fn read_u8(&mut self, addr: u64) -> Result<u8, Exception> {
        self.mem
            .get(addr as usize)
            .copied()
            .ok_or(Exception::MemoryFault { addr })
    }

    fn write_u8(&mut self, addr: u64, val: u8) -> Result<(), Exception> {
        let slot = self
            .mem
            .get_mut(addr as usize)
            .ok_or(Exception::MemoryFault { addr })?;
        *slot = val;
        self.note_write(addr, 1);
        Ok(())
    }

    fn drain_modified_regions(&mut self, sink: &mut dyn FnMut(u64, u64)) {
        for (start, end) in self.modified.drain(..) {
            sink(start, end);
        }
    }
}
