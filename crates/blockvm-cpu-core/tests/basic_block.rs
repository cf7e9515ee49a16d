use blockvm_cpu_core::codeblock::{CodeBlock, CodeBlockManager, Outcome, BLOCK_LIMIT};
use blockvm_cpu_core::exception::Exception;
use blockvm_cpu_core::jit::JitConfig;
use blockvm_cpu_core::mem::PhysicalMemory;
use blockvm_cpu_core::state::{gpr, CpuState, SegReg, Segment};

const CODE: u64 = 0x1000;

fn real_cpu_at(cs: u16, ip: u32) -> CpuState {
    let mut cpu = CpuState::new();
    cpu.segments[SegReg::Cs as usize] = Segment::real(cs);
    cpu.set_eip(ip);
    cpu
}

fn block_at(mem: &mut PhysicalMemory, limit: usize) -> CodeBlock {
    CodeBlockManager::new(limit, JitConfig::default())
        .real_mode_code_block_at(mem, CODE)
        .unwrap()
}

#[test]
fn straight_line_block_runs_every_node() {
    let mut mem = PhysicalMemory::new(0x10000);
    // inc ax; inc bx; inc cx
    mem.load(CODE, &[0x40, 0x43, 0x41]);

    let mut block = block_at(&mut mem, 3);
    assert!(matches!(block, CodeBlock::RealMode(_)));
    assert_eq!(block.instruction_count(), 3);
    assert_eq!(block.byte_length(), 3);

    let mut cpu = real_cpu_at(0, CODE as u32);
    let exit = block.execute(&mut cpu, &mut mem).unwrap();
    assert_eq!(exit.outcome, Outcome::None);
    assert_eq!(exit.retired, 3);
    assert_eq!(cpu.eip(), 0x1003);
    assert_eq!(cpu.gpr16(gpr::EAX), 1);
    assert_eq!(cpu.gpr16(gpr::EBX), 1);
    assert_eq!(cpu.gpr16(gpr::ECX), 1);
    assert!(cpu.pending_fault().is_none());
}

#[test]
fn block_ending_in_a_jump_leaves_eip_at_the_target() {
    let mut mem = PhysicalMemory::new(0x10000);
    // inc ax; inc ax; jmp short +0x10
    mem.load(CODE, &[0x40, 0x40, 0xEB, 0x10]);

    let mut block = block_at(&mut mem, BLOCK_LIMIT);
    assert_eq!(block.instruction_count(), 3);
    assert_eq!(block.byte_length(), 4);

    let mut cpu = real_cpu_at(0, CODE as u32);
    let exit = block.execute(&mut cpu, &mut mem).unwrap();
    assert_eq!(exit.outcome, Outcome::BranchTaken);
    assert_eq!(exit.retired, 3);
    assert_eq!(cpu.eip(), 0x1014);
    assert_eq!(cpu.gpr16(gpr::EAX), 2);
}

#[test]
fn branch_targets_follow_the_runtime_eip() {
    let mut mem = PhysicalMemory::new(0x10000);
    mem.load(CODE, &[0x40, 0x40, 0xEB, 0x10]);
    let mut block = block_at(&mut mem, BLOCK_LIMIT);

    // Same linear address reached as 0100:0000 instead of 0000:1000.
    let mut cpu = real_cpu_at(0x0100, 0);
    let exit = block.execute(&mut cpu, &mut mem).unwrap();
    assert_eq!(exit.outcome, Outcome::BranchTaken);
    assert_eq!(cpu.eip(), 0x0014);
    assert_eq!(cpu.code_linear(), 0x1014);
}

fn run_faulting(code: &[u8], limit: usize) -> (CpuState, u32) {
    let mut mem = PhysicalMemory::new(0x10000);
    mem.load(CODE, code);
    let mut block = block_at(&mut mem, limit);
    let mut cpu = real_cpu_at(0, CODE as u32);
    let exit = block.execute(&mut cpu, &mut mem).unwrap();
    assert_eq!(exit.outcome, Outcome::Fault);
    (cpu, exit.retired)
}

#[test]
fn fault_on_first_node_points_at_block_start() {
    // div bl; inc ax
    let (mut cpu, retired) = run_faulting(&[0xF6, 0xF3, 0x40], 2);
    assert_eq!(retired, 0);
    assert_eq!(cpu.eip(), 0x1000);
    assert_eq!(cpu.gpr16(gpr::EAX), 0);

    let fault = cpu.take_pending_fault().unwrap();
    assert_eq!(fault.exception, Exception::DivideError);
    assert_eq!(fault.saved_eip, 0x1000);
}

#[test]
fn fault_on_interior_node_points_at_that_instruction() {
    // inc ax; div bl; inc ax
    let (mut cpu, retired) = run_faulting(&[0x40, 0xF6, 0xF3, 0x40], 3);
    assert_eq!(retired, 1);
    assert_eq!(cpu.eip(), 0x1001);
    assert_eq!(cpu.gpr16(gpr::EAX), 1);
    assert_eq!(cpu.take_pending_fault().unwrap().saved_eip, 0x1001);
}

#[test]
fn fault_on_last_node_points_at_that_instruction() {
    // inc ax; inc ax; div bl
    let (mut cpu, retired) = run_faulting(&[0x40, 0x40, 0xF6, 0xF3], 3);
    assert_eq!(retired, 2);
    assert_eq!(cpu.eip(), 0x1002);
    assert_eq!(cpu.take_pending_fault().unwrap().exception, Exception::DivideError);
}

#[test]
fn faulting_control_transfer_does_not_move_eip() {
    let mut mem = PhysicalMemory::new(0x10000);
    // inc ax; ret
    mem.load(CODE, &[0x40, 0xC3]);
    let mut block = block_at(&mut mem, BLOCK_LIMIT);
    assert_eq!(block.instruction_count(), 2);

    let mut cpu = real_cpu_at(0, CODE as u32);
    // The high byte of the return address lies past the end of RAM.
    cpu.set_gpr16(gpr::ESP, 0xFFFF);
    let exit = block.execute(&mut cpu, &mut mem).unwrap();
    assert_eq!(exit.outcome, Outcome::Fault);
    assert_eq!(exit.retired, 1);
    assert_eq!(cpu.eip(), 0x1001);
    assert_eq!(cpu.gpr16(gpr::ESP), 0xFFFF);
    assert_eq!(
        cpu.take_pending_fault().unwrap().exception,
        Exception::MemoryFault { addr: 0x10000 }
    );
}

#[test]
fn undecodable_bytes_raise_invalid_opcode_when_reached() {
    let mut mem = PhysicalMemory::new(0x10000);
    // inc ax; ud2
    mem.load(CODE, &[0x40, 0x0F, 0x0B]);
    let mut block = block_at(&mut mem, BLOCK_LIMIT);
    assert_eq!(block.instruction_count(), 2);

    let mut cpu = real_cpu_at(0, CODE as u32);
    let exit = block.execute(&mut cpu, &mut mem).unwrap();
    assert_eq!(exit.outcome, Outcome::Fault);
    assert_eq!(exit.retired, 1);
    assert_eq!(cpu.eip(), 0x1001);
    assert_eq!(cpu.take_pending_fault().unwrap().exception, Exception::InvalidOpcode);
}
