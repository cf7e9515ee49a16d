//! Architectural interrupt/exception delivery for the three processor modes,
//! plus the external interrupt source consulted at quantum boundaries.

use std::collections::VecDeque;

use tracing::debug;

use crate::exception::{CpuExit, Exception};
use crate::mem::MemoryBus;
use crate::stack::StackPointer;
use crate::state::{CpuMode, CpuState, EFlags, SegReg, Segment};

/// Where an interrupt came from. Software interrupts are subject to the gate
/// DPL check; hardware interrupts and exceptions are not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptKind {
    Software,
    External,
    Exception,
}

/// Interrupt controller and device side of the machine.
///
/// The execution driver calls into this only at quantum boundaries.
pub trait InterruptSource {
    /// Give devices a chance to run. `elapsed` is the number of guest
    /// instructions retired since the previous poll.
    fn poll_devices(&mut self, _elapsed: u64) {}

    fn has_pending(&self) -> bool;

    /// Acknowledge the highest priority pending interrupt and return its vector.
    fn acknowledge(&mut self) -> Option<u8>;
}

/// FIFO interrupt controller used by tests and the CLI runner.
#[derive(Debug, Default, Clone)]
pub struct InterruptQueue {
    pending: VecDeque<u8>,
    polls: u64,
    polled_instructions: u64,
}

impl InterruptQueue {
    pub fn raise(&mut self, vector: u8) {
        self.pending.push_back(vector);
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Number of `poll_devices` calls observed so far.
    pub fn polls(&self) -> u64 {
        self.polls
    }

    pub fn polled_instructions(&self) -> u64 {
        self.polled_instructions
    }
}

impl InterruptSource for InterruptQueue {
    fn poll_devices(&mut self, elapsed: u64) {
        self.polls += 1;
        self.polled_instructions += elapsed;
    }

    fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    fn acknowledge(&mut self) -> Option<u8> {
        self.pending.pop_front()
    }
}

/// Deliver a fault queued on the CPU (EIP already points at the faulting
/// instruction), escalating to #DF and then to a triple fault.
pub fn deliver_exception(
    cpu: &mut CpuState,
    bus: &mut dyn MemoryBus,
    exception: Exception,
) -> Result<(), CpuExit> {
    let saved_eip = cpu.eip();
    let Some(vector) = exception.vector() else {
        if let Exception::MemoryFault { addr } = exception {
            return Err(CpuExit::MemoryFault { addr });
        }
        return Err(CpuExit::TripleFault);
    };

    let second = match deliver(
        cpu,
        bus,
        vector,
        saved_eip,
        exception.error_code(),
        InterruptKind::Exception,
    ) {
        Ok(()) => return Ok(()),
        Err(e) => e,
    };
    debug!(?exception, ?second, "fault while delivering exception");

    if let Exception::MemoryFault { addr } = second {
        return Err(CpuExit::MemoryFault { addr });
    }
    if exception == Exception::DoubleFault {
        return Err(CpuExit::TripleFault);
    }

    match deliver(
        cpu,
        bus,
        Exception::DoubleFault.vector().unwrap_or(8),
        saved_eip,
        Some(0),
        InterruptKind::Exception,
    ) {
        Ok(()) => Ok(()),
        Err(Exception::MemoryFault { addr }) => Err(CpuExit::MemoryFault { addr }),
        Err(_) => Err(CpuExit::TripleFault),
    }
}

/// Transfer control to the handler for `vector`.
///
/// `return_eip` is the EIP saved in the frame. Nothing in `cpu` changes if
/// delivery itself faults.
pub fn deliver(
    cpu: &mut CpuState,
    bus: &mut dyn MemoryBus,
    vector: u8,
    return_eip: u32,
    error_code: Option<u32>,
    kind: InterruptKind,
) -> Result<(), Exception> {
    cpu.halted = false;
    match cpu.mode() {
        CpuMode::Real => deliver_real(cpu, bus, vector, return_eip),
        CpuMode::Protected | CpuMode::Virtual8086 => {
            deliver_protected(cpu, bus, vector, return_eip, error_code, kind)
        }
    }
}

fn deliver_real(
    cpu: &mut CpuState,
    bus: &mut dyn MemoryBus,
    vector: u8,
    return_eip: u32,
) -> Result<(), Exception> {
    let entry = (vector as u32) * 4;
    if entry + 3 > cpu.idtr.limit as u32 {
        return Err(Exception::gp0());
    }
    let ivt = cpu.idtr.base.wrapping_add(entry) as u64;
    let offset = bus.read_u16(ivt)?;
    let selector = bus.read_u16(ivt + 2)?;

    let mut sp = StackPointer::current(cpu);
    sp.push(bus, cpu.eflags().bits() & 0xFFFF, 2)?;
    sp.push(bus, cpu.segment(SegReg::Cs).selector as u32, 2)?;
    sp.push(bus, return_eip & 0xFFFF, 2)?;
    sp.commit(cpu);

    let mut flags = cpu.eflags();
    flags.remove(EFlags::IF | EFlags::TF);
    cpu.set_eflags(flags);
    cpu.segments[SegReg::Cs as usize] = Segment::real(selector);
    cpu.set_eip(offset as u32);
    Ok(())
}

struct Gate {
    selector: u16,
    offset: u32,
    wide: bool,
    clears_if: bool,
}

fn read_gate(
    cpu: &CpuState,
    bus: &mut dyn MemoryBus,
    vector: u8,
    kind: InterruptKind,
) -> Result<Gate, Exception> {
    let idt_err = ((vector as u16) << 3) | 2;
    let entry = (vector as u32) * 8;
    if entry + 7 > cpu.idtr.limit as u32 {
        return Err(Exception::GeneralProtection(idt_err));
    }
    let addr = cpu.idtr.base.wrapping_add(entry) as u64;
    let lo = bus.read_u32(addr)?;
    let hi = bus.read_u32(addr + 4)?;

    let type_attr = ((hi >> 8) & 0xFF) as u8;
    let gate_type = type_attr & 0x0F;
    let dpl = (type_attr >> 5) & 3;
    let (wide, clears_if) = match gate_type {
        0x6 => (false, true),
        0x7 => (false, false),
        0xE => (true, true),
        0xF => (true, false),
        _ => return Err(Exception::GeneralProtection(idt_err)),
    };
    if kind == InterruptKind::Software && dpl < cpu.cpl() {
        return Err(Exception::GeneralProtection(idt_err));
    }
    if type_attr & 0x80 == 0 {
        return Err(Exception::SegmentNotPresent(idt_err));
    }

    let offset = (lo & 0xFFFF) | (hi & 0xFFFF_0000);
    Ok(Gate {
        selector: (lo >> 16) as u16,
        offset: if wide { offset } else { offset & 0xFFFF },
        wide,
        clears_if,
    })
}

fn deliver_protected(
    cpu: &mut CpuState,
    bus: &mut dyn MemoryBus,
    vector: u8,
    return_eip: u32,
    error_code: Option<u32>,
    kind: InterruptKind,
) -> Result<(), Exception> {
    let from_v86 = cpu.mode() == CpuMode::Virtual8086;
    let gate = read_gate(cpu, bus, vector, kind)?;
    let mut new_cs = cpu.descriptor(bus, SegReg::Cs, gate.selector)?;
    // Conforming code segments are not modelled; the handler runs at the
    // target descriptor's DPL and CS.RPL follows it.
    let new_cpl = new_cs.dpl;
    new_cs.selector = (new_cs.selector & !3) | new_cpl as u16;
    let size = if gate.wide { 4 } else { 2 };

    let old_flags = cpu.eflags();
    let old_cs = cpu.segment(SegReg::Cs).selector as u32;

    // Only inward transitions to ring 0 switch stacks; there is no TSS model
    // beyond the ring-0 SS:ESP pair.
    let switch_stack = from_v86 || new_cpl < cpu.cpl();
    if switch_stack && new_cpl != 0 {
        return Err(Exception::GeneralProtection(gate.selector & !3));
    }

    let (mut sp, new_ss) = if switch_stack {
        let ss0 = cpu.ring0_stack.ss0;
        let ss = cpu.descriptor(bus, SegReg::Ss, ss0)?;
        (StackPointer::new(ss.base, cpu.ring0_stack.esp0, ss.default_32), Some(ss))
    } else {
        (StackPointer::current(cpu), None)
    };

    if from_v86 {
        for seg in [SegReg::Gs, SegReg::Fs, SegReg::Ds, SegReg::Es] {
            sp.push(bus, cpu.segment(seg).selector as u32, size)?;
        }
    }
    if switch_stack {
        sp.push(bus, cpu.segment(SegReg::Ss).selector as u32, size)?;
        sp.push(bus, cpu.gpr32(crate::state::gpr::ESP), size)?;
    }
    sp.push(bus, old_flags.bits(), size)?;
    sp.push(bus, old_cs, size)?;
    sp.push(bus, return_eip, size)?;
    if let Some(code) = error_code {
        sp.push(bus, code, size)?;
    }

    // Everything that can fault has happened; commit.
    let mut flags = old_flags;
    flags.remove(EFlags::TF | EFlags::NT | EFlags::VM | EFlags::RF);
    if gate.clears_if {
        flags.remove(EFlags::IF);
    }
    cpu.set_eflags(flags);
    if let Some(ss) = new_ss {
        cpu.segments[SegReg::Ss as usize] = ss;
    }
    if from_v86 {
        for seg in [SegReg::Gs, SegReg::Fs, SegReg::Ds, SegReg::Es] {
            cpu.segments[seg as usize] = Segment {
                selector: 0,
                base: 0,
                limit: 0,
                default_32: false,
                dpl: 0,
            };
        }
    }
    sp.commit(cpu);
    cpu.segments[SegReg::Cs as usize] = new_cs;
    cpu.set_eip(gate.offset);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::PhysicalMemory;
    use crate::state::{gpr, DescriptorTable, RingZeroStack, CR0_PE};

    #[test]
    fn real_mode_delivery_builds_iret_frame() {
        let mut mem = PhysicalMemory::new(0x20000);
        // IVT[0x21] = 1234:5678
        mem.write_u16(0x21 * 4, 0x5678).unwrap();
        mem.write_u16(0x21 * 4 + 2, 0x1234).unwrap();

        let mut cpu = CpuState::new();
        cpu.segments[SegReg::Cs as usize] = Segment::real(0x0100);
        cpu.set_eip(0x0010);
        cpu.set_gpr32(gpr::ESP, 0x8000);
        cpu.set_flag(EFlags::IF, true);

        deliver(&mut cpu, &mut mem, 0x21, 0x0012, None, InterruptKind::Software).unwrap();

        assert_eq!(cpu.segment(SegReg::Cs).selector, 0x1234);
        assert_eq!(cpu.eip(), 0x5678);
        assert!(!cpu.flag(EFlags::IF));
        assert_eq!(cpu.gpr16(gpr::ESP), 0x7FFA);
        assert_eq!(mem.read_u16(0x7FFA).unwrap(), 0x0012);
        assert_eq!(mem.read_u16(0x7FFC).unwrap(), 0x0100);
        assert_eq!(mem.read_u16(0x7FFE).unwrap() as u32 & EFlags::IF.bits(), EFlags::IF.bits());
    }

    #[test]
    fn handler_privilege_comes_from_the_target_code_descriptor() {
        let mut mem = PhysicalMemory::new(0x10000);
        let gdt: [u64; 5] = [
            0,
            0x00CF_9A00_0000_FFFF, // 0x08: ring-0 code
            0x00CF_9200_0000_FFFF, // 0x10: ring-0 data
            0x00CF_FA00_0000_FFFF, // 0x18: ring-3 code
            0x00CF_F200_0000_FFFF, // 0x20: ring-3 data
        ];
        for (i, desc) in gdt.iter().enumerate() {
            mem.write_u32(0x500 + i as u64 * 8, *desc as u32).unwrap();
            mem.write_u32(0x504 + i as u64 * 8, (*desc >> 32) as u32).unwrap();
        }
        // Gate 0x30: DPL 3 interrupt gate whose selector carries RPL 3.
        mem.write_u32(0x600 + 0x30 * 8, (0x000B << 16) | 0x4000).unwrap();
        mem.write_u32(0x604 + 0x30 * 8, 0xEE00).unwrap();

        let mut cpu = CpuState::new();
        cpu.cr0 |= CR0_PE;
        cpu.gdtr = DescriptorTable { base: 0x500, limit: 39 };
        cpu.idtr = DescriptorTable {
            base: 0x600,
            limit: 0x30 * 8 + 7,
        };
        cpu.segments[SegReg::Cs as usize] = cpu.descriptor(&mut mem, SegReg::Cs, 0x1B).unwrap();
        cpu.segments[SegReg::Ss as usize] = cpu.descriptor(&mut mem, SegReg::Ss, 0x23).unwrap();
        cpu.ring0_stack = RingZeroStack {
            ss0: 0x10,
            esp0: 0x9000,
        };
        cpu.set_gpr32(gpr::ESP, 0x7000);
        cpu.set_eip(0x1000);
        assert_eq!(cpu.cpl(), 3);

        deliver(&mut cpu, &mut mem, 0x30, 0x1002, None, InterruptKind::Software).unwrap();

        assert_eq!(cpu.cpl(), 0);
        assert_eq!(cpu.segment(SegReg::Cs).selector, 0x08);
        assert_eq!(cpu.segment(SegReg::Ss).selector, 0x10);
        assert_eq!(cpu.eip(), 0x4000);
        let esp = cpu.gpr32(gpr::ESP);
        assert_eq!(esp, 0x9000 - 20);
        assert_eq!(mem.read_u32(esp as u64).unwrap(), 0x1002);
        assert_eq!(mem.read_u32(esp as u64 + 4).unwrap(), 0x1B);
        assert_eq!(mem.read_u32(esp as u64 + 12).unwrap(), 0x7000);
        assert_eq!(mem.read_u32(esp as u64 + 16).unwrap(), 0x23);
    }

    #[test]
    fn exception_outside_idt_limit_escalates_to_triple_fault() {
        let mut mem = PhysicalMemory::new(0x10000);
        let mut cpu = CpuState::new();
        cpu.cr0 |= CR0_PE;
        cpu.segments[SegReg::Cs as usize].default_32 = true;
        cpu.idtr.limit = 0;

        assert_eq!(
            deliver_exception(&mut cpu, &mut mem, Exception::DivideError),
            Err(CpuExit::TripleFault)
        );
    }

    #[test]
    fn memory_fault_is_a_sticky_exit() {
        let mut mem = PhysicalMemory::new(0x100);
        let mut cpu = CpuState::new();
        assert_eq!(
            deliver_exception(&mut cpu, &mut mem, Exception::MemoryFault { addr: 0x5000 }),
            Err(CpuExit::MemoryFault { addr: 0x5000 })
        );
    }
}
