use std::cell::Cell;
use std::rc::Rc;

use blockvm_cpu_core::codeblock::{
    BlockOrigin, ByteCursor, CodeBlock, CodeBlockError, CodeBlockFactory, CodeBlockManager,
    DecodeRequest, FactoryOutput, InterpretingFactory,
};
use blockvm_cpu_core::exception::Exception;
use blockvm_cpu_core::mem::{MemoryBus, PhysicalMemory};
use blockvm_cpu_core::state::{CpuMode, CpuState, SegReg, Segment};

const CODE: u64 = 0x1000;

/// Declines every request and counts how often it was asked.
#[derive(Default)]
struct Declining {
    calls: Cell<u32>,
}

impl CodeBlockFactory for Declining {
    fn name(&self) -> &'static str {
        "declining"
    }

    fn produce(
        &self,
        _req: &DecodeRequest,
        _cursor: &mut ByteCursor,
        _bus: &mut dyn MemoryBus,
    ) -> Result<FactoryOutput, Exception> {
        self.calls.set(self.calls.get() + 1);
        Ok(FactoryOutput::Declined)
    }
}

/// Counts calls, then defers to the interpreter.
#[derive(Default)]
struct Counting {
    calls: Cell<u32>,
}

impl CodeBlockFactory for Counting {
    fn name(&self) -> &'static str {
        "counting"
    }

    fn produce(
        &self,
        req: &DecodeRequest,
        cursor: &mut ByteCursor,
        bus: &mut dyn MemoryBus,
    ) -> Result<FactoryOutput, Exception> {
        self.calls.set(self.calls.get() + 1);
        InterpretingFactory.produce(req, cursor, bus)
    }
}

fn memory_with(addr: u64, code: &[u8]) -> PhysicalMemory {
    let mut mem = PhysicalMemory::new(0x10000);
    mem.load(addr, code);
    mem
}

#[test]
fn compiling_chain_is_tried_before_fallback() {
    let mut mem = memory_with(CODE, &[0x40, 0xF4]);
    let compiling = Rc::new(Declining::default());
    let fallback = Rc::new(Counting::default());

    let mut manager = CodeBlockManager::empty(16);
    manager.set_chains(
        CpuMode::Real,
        vec![compiling.clone() as Rc<dyn CodeBlockFactory>],
        vec![fallback.clone() as Rc<dyn CodeBlockFactory>],
    );

    let block = manager.real_mode_code_block_at(&mut mem, CODE).unwrap();
    assert!(matches!(block, CodeBlock::RealMode(_)));
    assert_eq!(block.origin(), Some(BlockOrigin::Interpreted));
    assert_eq!(block.instruction_count(), 2);
    assert_eq!(compiling.calls.get(), 1);
    assert_eq!(fallback.calls.get(), 1);
}

#[test]
fn first_successful_factory_wins() {
    let mut mem = memory_with(CODE, &[0x40, 0xF4]);
    let first = Rc::new(Counting::default());
    let second = Rc::new(Counting::default());

    let mut manager = CodeBlockManager::empty(16);
    manager.set_chains(
        CpuMode::Real,
        Vec::new(),
        vec![
            first.clone() as Rc<dyn CodeBlockFactory>,
            second.clone() as Rc<dyn CodeBlockFactory>,
        ],
    );
    manager.real_mode_code_block_at(&mut mem, CODE).unwrap();
    assert_eq!(first.calls.get(), 1);
    assert_eq!(second.calls.get(), 0);
}

#[test]
fn chains_are_per_mode() {
    let mut mem = memory_with(CODE, &[0x40, 0xF4]);
    let mut manager = CodeBlockManager::empty(16);
    manager.set_chains(
        CpuMode::Protected,
        Vec::new(),
        vec![Rc::new(InterpretingFactory) as Rc<dyn CodeBlockFactory>],
    );

    let block = manager.protected_mode_code_block_at(&mut mem, CODE, true).unwrap();
    assert!(matches!(block, CodeBlock::ProtectedMode(_)));
    assert!(matches!(
        manager.real_mode_code_block_at(&mut mem, CODE),
        Err(CodeBlockError::NoFactory {
            mode: CpuMode::Real,
            address: CODE
        })
    ));
    assert!(manager.virtual8086_mode_code_block_at(&mut mem, CODE).is_err());
}

#[test]
fn exhausted_chains_report_no_factory() {
    let mut mem = memory_with(CODE, &[0x40, 0xF4]);
    let compiling = Rc::new(Declining::default());
    let fallback = Rc::new(Declining::default());

    let mut manager = CodeBlockManager::empty(16);
    manager.set_chains(
        CpuMode::Real,
        vec![compiling.clone() as Rc<dyn CodeBlockFactory>],
        vec![fallback.clone() as Rc<dyn CodeBlockFactory>],
    );
    let err = manager.real_mode_code_block_at(&mut mem, CODE).unwrap_err();
    assert_eq!(
        err,
        CodeBlockError::NoFactory {
            mode: CpuMode::Real,
            address: CODE
        }
    );
    assert_eq!(compiling.calls.get(), 1);
    assert_eq!(fallback.calls.get(), 1);
}

#[test]
fn spanning_block_is_seeded_with_the_fallback_chain_only() {
    // mov ax, 0x1234 across the page boundary; hlt
    let mut mem = memory_with(0x0FFF, &[0xB8, 0x34, 0x12, 0xF4]);
    let compiling = Rc::new(Declining::default());
    let fallback = Rc::new(Counting::default());

    let mut manager = CodeBlockManager::empty(16);
    manager.set_chains(
        CpuMode::Real,
        vec![compiling.clone() as Rc<dyn CodeBlockFactory>],
        vec![fallback.clone() as Rc<dyn CodeBlockFactory>],
    );
    let mut block = manager.real_mode_code_block_at(&mut mem, 0x0FFF).unwrap();
    assert!(block.is_spanning());
    assert_eq!(compiling.calls.get(), 1);
    assert_eq!(fallback.calls.get(), 1);

    let mut cpu = CpuState::new();
    cpu.segments[SegReg::Cs as usize] = Segment::real(0);
    cpu.set_eip(0x0FFF);
    block.execute(&mut cpu, &mut mem).unwrap();
    assert_eq!(compiling.calls.get(), 1);
    assert_eq!(fallback.calls.get(), 2);
}

#[test]
fn fetch_outside_memory_is_a_fetch_fault() {
    let mut mem = PhysicalMemory::new(0x1000);
    let mut manager = CodeBlockManager::new(16, Default::default());
    assert_eq!(
        manager.real_mode_code_block_at(&mut mem, 0x2000).unwrap_err(),
        CodeBlockError::Fetch(Exception::MemoryFault { addr: 0x2000 })
    );
}

#[test]
fn protected_mode_operand_size_selects_decode_width() {
    // mov eax, imm32 in 32-bit code; mov ax, imm16 + add [bx+si], al in 16-bit code
    let mut mem = memory_with(CODE, &[0xB8, 0x01, 0x00, 0x00, 0x00, 0xF4]);
    let mut manager = CodeBlockManager::new(16, Default::default());

    let wide = manager.protected_mode_code_block_at(&mut mem, CODE, true).unwrap();
    assert_eq!(wide.instruction_count(), 2);
    assert_eq!(wide.byte_length(), 6);

    let narrow = manager.protected_mode_code_block_at(&mut mem, CODE, false).unwrap();
    assert_eq!(narrow.instruction_count(), 3);
    assert_eq!(narrow.byte_length(), 6);
}
