#![cfg(not(target_arch = "wasm32"))]

use blockvm_x86::{decode_one, DecodeError, DecodeMode, MAX_INSTRUCTION_LEN};
use proptest::prelude::*;

fn mode() -> impl Strategy<Value = DecodeMode> {
    prop_oneof![Just(DecodeMode::Bits16), Just(DecodeMode::Bits32)]
}

proptest! {
    #[test]
    fn decode_never_reports_length_beyond_window(
        mode in mode(),
        bytes in proptest::collection::vec(any::<u8>(), 0..=MAX_INSTRUCTION_LEN),
    ) {
        if let Ok(inst) = decode_one(mode, 0, &bytes) {
            prop_assert!(inst.len as usize <= bytes.len());
            prop_assert!(inst.len > 0);
        }
    }

    #[test]
    fn every_proper_prefix_of_a_valid_instruction_underruns(
        mode in mode(),
        bytes in proptest::collection::vec(any::<u8>(), MAX_INSTRUCTION_LEN),
    ) {
        if let Ok(inst) = decode_one(mode, 0, &bytes) {
            for cut in 0..inst.len as usize {
                let res = decode_one(mode, 0, &bytes[..cut]);
                prop_assert!(
                    matches!(res, Err(DecodeError::Underrun { .. })),
                    "prefix of len {} decoded as {:?}", cut, res
                );
            }
        }
    }

    #[test]
    fn decoding_is_deterministic(
        mode in mode(),
        ip in any::<u16>(),
        bytes in proptest::collection::vec(any::<u8>(), 1..=MAX_INSTRUCTION_LEN),
    ) {
        let a = decode_one(mode, ip as u64, &bytes).map(|i| (i.len, i.instr.code()));
        let b = decode_one(mode, ip as u64, &bytes).map(|i| (i.len, i.instr.code()));
        prop_assert_eq!(a, b);
    }
}
