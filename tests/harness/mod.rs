#![allow(dead_code)]

use blockvm_cpu_core::exec::{ExecDriver, Vcpu};
use blockvm_cpu_core::interrupts::InterruptQueue;
use blockvm_cpu_core::mem::{MemoryBus, PhysicalMemory};
use blockvm_cpu_core::state::{gpr, CpuState, SegReg, Segment};

pub const RAM_SIZE: usize = 0x2_0000;
pub const GDT_BASE: u64 = 0x0500;
pub const GDTR_PSEUDO: u64 = 0x0520;
pub const IDTR_PSEUDO: u64 = 0x0528;
pub const IDT_BASE: u64 = 0x0600;
pub const BOOT: u64 = 0x7C00;

pub const CODE32_SELECTOR: u16 = 0x08;
pub const DATA32_SELECTOR: u16 = 0x10;

/// Flat 4 GiB ring-0 code and data descriptors.
const FLAT_CODE32: u64 = 0x00CF_9A00_0000_FFFF;
const FLAT_DATA32: u64 = 0x00CF_9200_0000_FFFF;

/// Guest RAM with a flat GDT and an empty IDT already laid out.
pub struct Guest {
    pub mem: PhysicalMemory,
    idt_limit: u16,
}

impl Guest {
    pub fn new() -> Self {
        let mut mem = PhysicalMemory::new(RAM_SIZE);
        let mut gdt = Vec::new();
        for desc in [0u64, FLAT_CODE32, FLAT_DATA32] {
            gdt.extend_from_slice(&desc.to_le_bytes());
        }
        mem.load(GDT_BASE, &gdt);

        let mut gdtr = Vec::new();
        gdtr.extend_from_slice(&((gdt.len() - 1) as u16).to_le_bytes());
        gdtr.extend_from_slice(&(GDT_BASE as u32).to_le_bytes());
        mem.load(GDTR_PSEUDO, &gdtr);

        let mut guest = Self { mem, idt_limit: 0 };
        guest.write_idtr();
        guest
    }

    fn write_idtr(&mut self) {
        let mut idtr = Vec::new();
        idtr.extend_from_slice(&self.idt_limit.to_le_bytes());
        idtr.extend_from_slice(&(IDT_BASE as u32).to_le_bytes());
        self.mem.load(IDTR_PSEUDO, &idtr);
    }

    /// Install a present ring-0 32-bit interrupt gate.
    pub fn interrupt_gate(&mut self, vector: u8, handler: u32) -> &mut Self {
        let lo = ((CODE32_SELECTOR as u32) << 16) | (handler & 0xFFFF);
        let hi = (handler & 0xFFFF_0000) | 0x8E00;
        let entry = IDT_BASE + vector as u64 * 8;
        self.mem.write_u32(entry, lo).unwrap();
        self.mem.write_u32(entry + 4, hi).unwrap();
        self.idt_limit = self.idt_limit.max(vector as u16 * 8 + 7);
        self.write_idtr();
        self
    }

    pub fn code(&mut self, addr: u64, bytes: &[u8]) -> &mut Self {
        self.mem.load(addr, bytes);
        self
    }

    /// A real-mode vCPU at `0000:BOOT` with setup writes already drained.
    pub fn boot(mut self) -> Vcpu<PhysicalMemory> {
        self.mem.drain_modified_regions(&mut |_, _| {});
        let mut cpu = CpuState::new();
        cpu.segments[SegReg::Cs as usize] = Segment::real(0);
        cpu.set_eip(BOOT as u32);
        cpu.set_gpr16(gpr::ESP, BOOT as u16);
        Vcpu::new(cpu, self.mem)
    }
}

/// Real-mode prologue at `BOOT`: load GDTR/IDTR, set CR0.PE and far jump to
/// `entry32` through the flat code selector.
pub fn enter_protected_mode(entry32: u32) -> Vec<u8> {
    let mut code = vec![
        0xFA, // cli
        0x0F, 0x01, 0x16, GDTR_PSEUDO as u8, (GDTR_PSEUDO >> 8) as u8, // lgdt [GDTR_PSEUDO]
        0x0F, 0x01, 0x1E, IDTR_PSEUDO as u8, (IDTR_PSEUDO >> 8) as u8, // lidt [IDTR_PSEUDO]
        0x0F, 0x20, 0xC0, // mov eax, cr0
        0x0C, 0x01, // or al, 1
        0x0F, 0x22, 0xC0, // mov cr0, eax
        0xEA, // jmp far ptr16:16
    ];
    code.extend_from_slice(&(entry32 as u16).to_le_bytes());
    code.extend_from_slice(&CODE32_SELECTOR.to_le_bytes());
    code
}

/// Number of instructions in [`enter_protected_mode`].
pub const PROLOGUE_INSTRUCTIONS: u64 = 7;

/// 32-bit code that loads the flat data selector into DS/ES/SS and sets ESP.
pub fn load_flat_data_segments(esp: u32) -> Vec<u8> {
    let mut code = vec![
        0x66, 0xB8, DATA32_SELECTOR as u8, 0x00, // mov ax, DATA32_SELECTOR
        0x8E, 0xD8, // mov ds, ax
        0x8E, 0xC0, // mov es, ax
        0x8E, 0xD0, // mov ss, ax
        0xBC, // mov esp, imm32
    ];
    code.extend_from_slice(&esp.to_le_bytes());
    code
}

pub const FLAT_DATA_INSTRUCTIONS: u64 = 5;

/// Call `execute` until the CPU halts, stops, or `max_calls` runs out.
pub fn run_until_halt(
    driver: &mut ExecDriver,
    vcpu: &mut Vcpu<PhysicalMemory>,
    max_calls: usize,
) -> u64 {
    let mut irq = InterruptQueue::default();
    let mut executed = 0;
    for _ in 0..max_calls {
        executed += driver
            .execute(vcpu, &mut irq)
            .expect("a factory is available for every mode");
        if vcpu.cpu.halted || vcpu.exit.is_some() {
            break;
        }
    }
    executed
}
