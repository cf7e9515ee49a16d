use bitflags::bitflags;
use blockvm_x86::{DecodeMode, Register};

use crate::exception::Exception;
use crate::mem::MemoryBus;

pub const CR0_PE: u32 = 1 << 0;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EFlags: u32 {
        const CF = 1 << 0;
        const RESERVED1 = 1 << 1;
        const PF = 1 << 2;
        const AF = 1 << 4;
        const ZF = 1 << 6;
        const SF = 1 << 7;
        const TF = 1 << 8;
        const IF = 1 << 9;
        const DF = 1 << 10;
        const OF = 1 << 11;
        const IOPL = 3 << 12;
        const NT = 1 << 14;
        const RF = 1 << 16;
        const VM = 1 << 17;
    }
}

impl EFlags {
    /// Bits the guest can change through POPF/IRET in any mode.
    pub const GUEST_WRITABLE: EFlags = EFlags::CF
        .union(EFlags::PF)
        .union(EFlags::AF)
        .union(EFlags::ZF)
        .union(EFlags::SF)
        .union(EFlags::TF)
        .union(EFlags::IF)
        .union(EFlags::DF)
        .union(EFlags::OF)
        .union(EFlags::IOPL)
        .union(EFlags::NT);
}

/// Processor operating mode. Each mode has its own code-block variant and its
/// own loop in the execution driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CpuMode {
    /// 16-bit real mode (CS:IP segmentation, `selector << 4` bases).
    Real,
    /// 16/32-bit protected mode with GDT-loaded segments and no paging.
    Protected,
    /// Virtual-8086 task running under protected mode (EFLAGS.VM set).
    Virtual8086,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegReg {
    Es = 0,
    Cs = 1,
    Ss = 2,
    Ds = 3,
    Fs = 4,
    Gs = 5,
}

impl SegReg {
    pub fn from_register(reg: Register) -> Option<Self> {
        Some(match reg {
            Register::ES => SegReg::Es,
            Register::CS => SegReg::Cs,
            Register::SS => SegReg::Ss,
            Register::DS => SegReg::Ds,
            Register::FS => SegReg::Fs,
            Register::GS => SegReg::Gs,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub selector: u16,
    pub base: u32,
    pub limit: u32,
    /// D/B bit: 32-bit default operand/address size (CS) or stack width (SS).
    pub default_32: bool,
    /// Descriptor privilege level; 0 for segments loaded outside protected mode.
    pub dpl: u8,
}

impl Segment {
    pub const fn real(selector: u16) -> Self {
        Self {
            selector,
            base: (selector as u32) << 4,
            limit: 0xFFFF,
            default_32: false,
            dpl: 0,
        }
    }
}

impl Default for Segment {
    fn default() -> Self {
        Segment::real(0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DescriptorTable {
    pub base: u32,
    pub limit: u16,
}

/// Ring-0 stack used when an interrupt leaves virtual-8086 mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RingZeroStack {
    pub ss0: u16,
    pub esp0: u32,
}

pub mod gpr {
    pub const EAX: usize = 0;
    pub const ECX: usize = 1;
    pub const EDX: usize = 2;
    pub const EBX: usize = 3;
    pub const ESP: usize = 4;
    pub const EBP: usize = 5;
    pub const ESI: usize = 6;
    pub const EDI: usize = 7;
}

#[derive(Debug, Clone)]
pub struct CpuState {
    gpr: [u32; 8],
    eip: u32,
    eflags: EFlags,
    pub segments: [Segment; 6],
    pub gdtr: DescriptorTable,
    pub idtr: DescriptorTable,
    pub cr0: u32,
    pub ring0_stack: RingZeroStack,
    pub halted: bool,

    /// Interrupt shadow for STI/MOV SS/POP SS.
    ///
    /// Set to 2 by the shadowing instruction; the post-instruction hook
    /// decrements it, so maskable interrupts stay blocked until the
    /// instruction after the shadowing one has retired.
    interrupt_shadow: u8,
    pending_fault: Option<crate::exception::PendingFault>,
}

impl Default for CpuState {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuState {
    /// Power-on state: real mode, CS:IP = F000:FFF0.
    pub fn new() -> Self {
        let mut segments = [Segment::real(0); 6];
        segments[SegReg::Cs as usize] = Segment {
            selector: 0xF000,
            base: 0xF_0000,
            limit: 0xFFFF,
            default_32: false,
            dpl: 0,
        };
        Self {
            gpr: [0; 8],
            eip: 0xFFF0,
            eflags: EFlags::RESERVED1,
            segments,
            gdtr: DescriptorTable::default(),
            idtr: DescriptorTable {
                base: 0,
                limit: 0x3FF,
            },
            cr0: 0,
            ring0_stack: RingZeroStack::default(),
            halted: false,
            interrupt_shadow: 0,
            pending_fault: None,
        }
    }

    pub fn mode(&self) -> CpuMode {
        if self.cr0 & CR0_PE == 0 {
            CpuMode::Real
        } else if self.eflags.contains(EFlags::VM) {
            CpuMode::Virtual8086
        } else {
            CpuMode::Protected
        }
    }

    /// Default operand/address size of the current code segment.
    pub fn bitness(&self) -> u32 {
        match self.mode() {
            CpuMode::Real | CpuMode::Virtual8086 => 16,
            CpuMode::Protected => {
                if self.segment(SegReg::Cs).default_32 {
                    32
                } else {
                    16
                }
            }
        }
    }

    pub fn decode_mode(&self) -> DecodeMode {
        if self.bitness() == 32 {
            DecodeMode::Bits32
        } else {
            DecodeMode::Bits16
        }
    }

    pub fn ip_mask(&self) -> u32 {
        self.decode_mode().ip_mask()
    }

    pub fn cpl(&self) -> u8 {
        match self.mode() {
            CpuMode::Real => 0,
            CpuMode::Virtual8086 => 3,
            CpuMode::Protected => (self.segment(SegReg::Cs).selector & 3) as u8,
        }
    }

    pub fn iopl(&self) -> u8 {
        ((self.eflags.bits() & EFlags::IOPL.bits()) >> 12) as u8
    }

    #[inline]
    pub fn eip(&self) -> u32 {
        self.eip
    }

    #[inline]
    pub fn set_eip(&mut self, eip: u32) {
        self.eip = eip & self.ip_mask();
    }

    /// Linear address of the next instruction (CS base + EIP).
    pub fn code_linear(&self) -> u64 {
        self.segment(SegReg::Cs).base.wrapping_add(self.eip) as u64
    }

    #[inline]
    pub fn eflags(&self) -> EFlags {
        self.eflags
    }

    /// Replace EFLAGS wholesale; bit 1 always reads as set.
    pub fn set_eflags(&mut self, value: EFlags) {
        self.eflags = value | EFlags::RESERVED1;
    }

    #[inline]
    pub fn flag(&self, flag: EFlags) -> bool {
        self.eflags.contains(flag)
    }

    #[inline]
    pub fn set_flag(&mut self, flag: EFlags, value: bool) {
        self.eflags.set(flag, value);
    }

    #[inline]
    pub fn segment(&self, seg: SegReg) -> &Segment {
        &self.segments[seg as usize]
    }

    #[inline]
    pub fn segment_mut(&mut self, seg: SegReg) -> &mut Segment {
        &mut self.segments[seg as usize]
    }

    #[inline]
    pub fn gpr32(&self, idx: usize) -> u32 {
        self.gpr[idx]
    }

    #[inline]
    pub fn set_gpr32(&mut self, idx: usize, value: u32) {
        self.gpr[idx] = value;
    }

    pub fn gpr16(&self, idx: usize) -> u16 {
        self.gpr[idx] as u16
    }

    pub fn set_gpr16(&mut self, idx: usize, value: u16) {
        self.gpr[idx] = (self.gpr[idx] & 0xFFFF_0000) | value as u32;
    }

    /// Read a general purpose register view (8/16/32-bit).
    pub fn read_reg(&self, reg: Register) -> Result<u32, Exception> {
        if let Some(seg) = SegReg::from_register(reg) {
            return Ok(self.segment(seg).selector as u32);
        }
        if reg == Register::CR0 {
            return Ok(self.cr0);
        }
        let (idx, shift, bits) = gpr_access(reg).ok_or(Exception::InvalidOpcode)?;
        Ok((self.gpr[idx] >> shift) & mask_bits(bits))
    }

    /// Write a general purpose register view, preserving the untouched bits of
    /// the full 32-bit register. Segment registers must go through
    /// [`CpuState::load_segment`].
    pub fn write_reg(&mut self, reg: Register, value: u32) -> Result<(), Exception> {
        let (idx, shift, bits) = gpr_access(reg).ok_or(Exception::InvalidOpcode)?;
        let mask = mask_bits(bits) << shift;
        self.gpr[idx] = (self.gpr[idx] & !mask) | ((value << shift) & mask);
        Ok(())
    }

    /// Load a segment register the way the current mode does it.
    ///
    /// Real and virtual-8086 mode compute `selector << 4`; protected mode reads
    /// the descriptor from the GDT.
    pub fn load_segment(
        &mut self,
        bus: &mut dyn MemoryBus,
        seg: SegReg,
        selector: u16,
    ) -> Result<(), Exception> {
        let loaded = match self.mode() {
            CpuMode::Real | CpuMode::Virtual8086 => Segment::real(selector),
            CpuMode::Protected => self.descriptor(bus, seg, selector)?,
        };
        self.segments[seg as usize] = loaded;
        if seg == SegReg::Cs {
            self.eip &= self.ip_mask();
        }
        Ok(())
    }

    /// Parse the GDT descriptor for `selector` as it would be loaded into
    /// `seg`, regardless of the current mode.
    pub fn descriptor(
        &self,
        bus: &mut dyn MemoryBus,
        seg: SegReg,
        selector: u16,
    ) -> Result<Segment, Exception> {
        let sel_err = selector & !0x3;
        if sel_err == 0 {
            return match seg {
                SegReg::Cs | SegReg::Ss => Err(Exception::gp0()),
                _ => Ok(Segment {
                    selector,
                    base: 0,
                    limit: 0,
                    default_32: false,
                    dpl: 0,
                }),
            };
        }
        // LDT selectors are not modelled.
        if selector & 0x4 != 0 {
            return Err(Exception::GeneralProtection(sel_err));
        }

        let offset = (selector & !0x7) as u32;
        if offset + 7 > self.gdtr.limit as u32 {
            return Err(Exception::GeneralProtection(sel_err));
        }
        let addr = self.gdtr.base.wrapping_add(offset) as u64;
        let lo = bus.read_u32(addr)?;
        let hi = bus.read_u32(addr + 4)?;

        let access = ((hi >> 8) & 0xFF) as u8;
        let flags = ((hi >> 20) & 0xF) as u8;
        let is_code_or_data = access & 0x10 != 0;
        let executable = access & 0x08 != 0;
        if !is_code_or_data || (seg == SegReg::Cs && !executable) {
            return Err(Exception::GeneralProtection(sel_err));
        }
        if access & 0x80 == 0 {
            return Err(match seg {
                SegReg::Ss => Exception::StackFault(sel_err),
                _ => Exception::SegmentNotPresent(sel_err),
            });
        }

        let base = (lo >> 16) | ((hi & 0xFF) << 16) | (hi & 0xFF00_0000);
        let mut limit = (lo & 0xFFFF) | (hi & 0x000F_0000);
        if flags & 0x8 != 0 {
            limit = (limit << 12) | 0xFFF;
        }
        Ok(Segment {
            selector,
            base,
            limit,
            default_32: flags & 0x4 != 0,
            dpl: (access >> 5) & 0x3,
        })
    }

    /// Whether a maskable interrupt may be recognised at this boundary.
    pub fn interrupts_enabled(&self) -> bool {
        self.flag(EFlags::IF) && self.interrupt_shadow == 0
    }

    pub fn inhibit_interrupts_for_one_instruction(&mut self) {
        self.interrupt_shadow = 2;
    }

    /// Post-instruction hook run after every execution node.
    #[inline]
    pub fn end_instruction(&mut self) {
        self.interrupt_shadow = self.interrupt_shadow.saturating_sub(1);
    }

    /// Queue a fault for delivery; EIP must already point at the faulting
    /// instruction.
    pub fn raise_exception_fault(&mut self, exception: Exception) {
        self.pending_fault = Some(crate::exception::PendingFault {
            exception,
            saved_eip: self.eip,
        });
    }

    pub fn take_pending_fault(&mut self) -> Option<crate::exception::PendingFault> {
        self.pending_fault.take()
    }

    pub fn pending_fault(&self) -> Option<&crate::exception::PendingFault> {
        self.pending_fault.as_ref()
    }
}

#[inline]
pub fn mask_bits(bits: u32) -> u32 {
    if bits >= 32 {
        u32::MAX
    } else {
        (1u32 << bits) - 1
    }
}

/// Returns (gpr_idx, bit_shift, bit_width) for an 8/16/32-bit GPR view.
fn gpr_access(reg: Register) -> Option<(usize, u32, u32)> {
    use Register::*;
    Some(match reg {
        AL => (0, 0, 8),
        CL => (1, 0, 8),
        DL => (2, 0, 8),
        BL => (3, 0, 8),
        AH => (0, 8, 8),
        CH => (1, 8, 8),
        DH => (2, 8, 8),
        BH => (3, 8, 8),

        AX => (0, 0, 16),
        CX => (1, 0, 16),
        DX => (2, 0, 16),
        BX => (3, 0, 16),
        SP => (4, 0, 16),
        BP => (5, 0, 16),
        SI => (6, 0, 16),
        DI => (7, 0, 16),

        EAX => (0, 0, 32),
        ECX => (1, 0, 32),
        EDX => (2, 0, 32),
        EBX => (3, 0, 32),
        ESP => (4, 0, 32),
        EBP => (5, 0, 32),
        ESI => (6, 0, 32),
        EDI => (7, 0, 32),

        _ => return Option::None,
    })
}

/// Width in bits of a GPR view, or `None` for non-GPR registers.
pub fn gpr_width(reg: Register) -> Option<u32> {
    gpr_access(reg).map(|(_, _, bits)| bits)
}
