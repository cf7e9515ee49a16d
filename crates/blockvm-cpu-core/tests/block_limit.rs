use blockvm_cpu_core::codeblock::{CodeBlockManager, BLOCK_LIMIT};
use blockvm_cpu_core::jit::JitConfig;
use blockvm_cpu_core::mem::PhysicalMemory;
use proptest::prelude::*;

const CODE: u64 = 0x1000;
const HLT: u8 = 0xF4;

/// Encodings that never end a block in real mode.
fn straight_line_instruction() -> impl Strategy<Value = Vec<u8>> {
    prop_oneof![
        Just(vec![0x40]),       // inc ax
        Just(vec![0x90]),       // nop
        Just(vec![0x01, 0xD8]), // add ax, bx
        Just(vec![0x31, 0xC9]), // xor cx, cx
        any::<u16>().prop_map(|v| vec![0xB8, v as u8, (v >> 8) as u8]), // mov ax, imm16
        any::<u8>().prop_map(|d| vec![0x8D, 0x71, d]),                  // lea si, [bx+di+d8]
    ]
}

/// Instruction lengths plus the flattened bytes, terminated by HLT.
fn program() -> impl Strategy<Value = (Vec<usize>, Vec<u8>)> {
    prop::collection::vec(straight_line_instruction(), 0..48).prop_map(|insts| {
        let mut lens: Vec<usize> = insts.iter().map(Vec::len).collect();
        let mut bytes: Vec<u8> = insts.concat();
        lens.push(1);
        bytes.push(HLT);
        (lens, bytes)
    })
}

proptest! {
    #[test]
    fn blocks_hold_min_of_limit_and_remaining(
        (lens, bytes) in program(),
        limit in 1usize..64,
    ) {
        let mut mem = PhysicalMemory::new(0x10000);
        mem.load(CODE, &bytes);
        let mut manager = CodeBlockManager::new(limit, JitConfig::default());

        let total = lens.len();
        let mut seen = 0usize;
        let mut at = CODE;
        while seen < total {
            let block = manager.real_mode_code_block_at(&mut mem, at).unwrap();
            let count = block.instruction_count() as usize;
            prop_assert_eq!(count, limit.min(total - seen));

            let expected_len: usize = lens[seen..seen + count].iter().sum();
            prop_assert_eq!(block.byte_length() as usize, expected_len);

            seen += count;
            at += block.byte_length() as u64;
        }
        prop_assert_eq!(at, CODE + bytes.len() as u64);
    }

    #[test]
    fn decoding_the_same_bytes_twice_is_idempotent(
        (_lens, bytes) in program(),
        limit in 1usize..64,
    ) {
        let mut mem = PhysicalMemory::new(0x10000);
        mem.load(CODE, &bytes);

        let first = CodeBlockManager::new(limit, JitConfig::default())
            .real_mode_code_block_at(&mut mem, CODE)
            .unwrap();
        let second = CodeBlockManager::new(limit, JitConfig::default())
            .real_mode_code_block_at(&mut mem, CODE)
            .unwrap();
        prop_assert_eq!(first.byte_length(), second.byte_length());
        prop_assert_eq!(first.instruction_count(), second.instruction_count());
    }
}

#[test]
fn default_limit_closes_long_runs() {
    let mut mem = PhysicalMemory::new(0x10000);
    mem.load(CODE, &[0x90; 300]);

    let mut manager = CodeBlockManager::new(BLOCK_LIMIT, JitConfig::default());
    let block = manager.real_mode_code_block_at(&mut mem, CODE).unwrap();
    assert_eq!(block.instruction_count() as usize, BLOCK_LIMIT);
    assert_eq!(block.byte_length() as usize, BLOCK_LIMIT);

    let rest = manager
        .real_mode_code_block_at(&mut mem, CODE + BLOCK_LIMIT as u64)
        .unwrap();
    // 44 NOPs, then zero bytes (`add [bx+si], al`) until the cap.
    assert_eq!(rest.instruction_count() as usize, BLOCK_LIMIT);
    assert_eq!(rest.byte_length() as usize, 44 + 2 * (BLOCK_LIMIT - 44));
}

#[test]
fn zero_limit_still_makes_progress() {
    let mut mem = PhysicalMemory::new(0x10000);
    mem.load(CODE, &[0x40, 0x40, HLT]);
    let mut manager = CodeBlockManager::new(0, JitConfig::default());
    let block = manager.real_mode_code_block_at(&mut mem, CODE).unwrap();
    assert_eq!(block.instruction_count(), 1);
}

#[test]
fn block_stops_at_the_page_boundary() {
    let mut mem = PhysicalMemory::new(0x10000);
    let start = CODE + 0xFF0;
    mem.load(start, &[0x90; 0x40]);

    let mut manager = CodeBlockManager::new(BLOCK_LIMIT, JitConfig::default());
    let block = manager.real_mode_code_block_at(&mut mem, start).unwrap();
    assert!(!block.is_spanning());
    assert_eq!(block.instruction_count(), 0x10);
    assert_eq!(block.byte_length(), 0x10);
}
