//! Stack accesses through SS.
//!
//! Pushes and pops operate on a working copy of the stack pointer that is
//! only committed back to the CPU once every memory access has succeeded, so a
//! fault half-way through a multi-word frame leaves ESP untouched.

use crate::exception::Exception;
use crate::mem::MemoryBus;
use crate::state::{gpr, CpuMode, CpuState, SegReg};

#[derive(Debug, Clone, Copy)]
pub struct StackPointer {
    base: u32,
    sp: u32,
    wide: bool,
}

impl StackPointer {
    pub fn current(cpu: &CpuState) -> Self {
        let ss = cpu.segment(SegReg::Ss);
        let wide = cpu.mode() == CpuMode::Protected && ss.default_32;
        Self::new(ss.base, cpu.gpr32(gpr::ESP), wide)
    }

    pub fn new(base: u32, esp: u32, wide: bool) -> Self {
        let sp = if wide { esp } else { esp & 0xFFFF };
        Self { base, sp, wide }
    }

    fn mask(&self) -> u32 {
        if self.wide {
            u32::MAX
        } else {
            0xFFFF
        }
    }

    fn linear(&self) -> u64 {
        self.base.wrapping_add(self.sp) as u64
    }

    pub fn push(
        &mut self,
        bus: &mut dyn MemoryBus,
        value: u32,
        size: u32,
    ) -> Result<(), Exception> {
        self.sp = self.sp.wrapping_sub(size) & self.mask();
        match size {
            2 => bus.write_u16(self.linear(), value as u16),
            _ => bus.write_u32(self.linear(), value),
        }
    }

    pub fn pop(&mut self, bus: &mut dyn MemoryBus, size: u32) -> Result<u32, Exception> {
        let value = match size {
            2 => bus.read_u16(self.linear())? as u32,
            _ => bus.read_u32(self.linear())?,
        };
        self.sp = self.sp.wrapping_add(size) & self.mask();
        Ok(value)
    }

    pub fn skip(&mut self, bytes: u32) {
        self.sp = self.sp.wrapping_add(bytes) & self.mask();
    }

    /// Write the stack pointer back, touching only SP for a 16-bit stack.
    pub fn commit(self, cpu: &mut CpuState) {
        if self.wide {
            cpu.set_gpr32(gpr::ESP, self.sp);
        } else {
            cpu.set_gpr16(gpr::ESP, self.sp as u16);
        }
    }

    /// Final ESP value as it would be committed.
    pub fn esp(&self) -> u32 {
        self.sp
    }
}

pub fn push(
    cpu: &mut CpuState,
    bus: &mut dyn MemoryBus,
    value: u32,
    size: u32,
) -> Result<(), Exception> {
    let mut sp = StackPointer::current(cpu);
    sp.push(bus, value, size)?;
    sp.commit(cpu);
    Ok(())
}

pub fn pop(cpu: &mut CpuState, bus: &mut dyn MemoryBus, size: u32) -> Result<u32, Exception> {
    let mut sp = StackPointer::current(cpu);
    let value = sp.pop(bus, size)?;
    sp.commit(cpu);
    Ok(value)
}
