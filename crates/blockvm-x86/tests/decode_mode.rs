use blockvm_x86::{decode_one, DecodeError, DecodeMode, Mnemonic, OpKind, Register};

#[test]
fn operand_size_follows_decode_mode() {
    // B8 imm: mov ax, imm16 in 16-bit code, mov eax, imm32 in 32-bit code.
    let bytes = [0xB8, 0x34, 0x12, 0x78, 0x56];

    let inst = decode_one(DecodeMode::Bits16, 0, &bytes).expect("decode");
    assert_eq!(inst.len, 3);
    assert_eq!(inst.instr.op0_register(), Register::AX);

    let inst = decode_one(DecodeMode::Bits32, 0, &bytes).expect("decode");
    assert_eq!(inst.len, 5);
    assert_eq!(inst.instr.op0_register(), Register::EAX);
}

#[test]
fn truncated_immediate_is_underrun_not_invalid() {
    // mov eax, imm32 with only two immediate bytes available.
    let err = decode_one(DecodeMode::Bits32, 0x1000, &[0xB8, 0x01, 0x02]).unwrap_err();
    assert_eq!(err, DecodeError::Underrun { available: 3 });
}

#[test]
fn truncated_modrm_is_underrun() {
    // add [bx+si+disp16], ax with the displacement cut off.
    let err = decode_one(DecodeMode::Bits16, 0, &[0x01, 0x80, 0x34]).unwrap_err();
    assert!(matches!(err, DecodeError::Underrun { .. }));
}

#[test]
fn over_long_encoding_is_invalid() {
    // UD2 itself is a valid encoding; it only raises #UD when executed.
    let ud2 = decode_one(DecodeMode::Bits16, 0, &[0x0F, 0x0B]).expect("ud2 decodes");
    assert_eq!(ud2.instr.mnemonic(), Mnemonic::Ud2);

    let over_long = [0x66u8; 15];
    assert_eq!(
        decode_one(DecodeMode::Bits32, 0, &over_long).unwrap_err(),
        DecodeError::InvalidInstruction
    );
}

#[test]
fn far_jump_exposes_selector_and_offset() {
    // jmp 0x0008:0x00001000 (32-bit operand size via 66 prefix in 16-bit code)
    let bytes = [0x66, 0xEA, 0x00, 0x10, 0x00, 0x00, 0x08, 0x00];
    let inst = decode_one(DecodeMode::Bits16, 0x7C00, &bytes).expect("decode");
    assert_eq!(inst.len, 8);
    assert_eq!(inst.instr.op0_kind(), OpKind::FarBranch32);
    assert_eq!(inst.instr.far_branch_selector(), 0x0008);
    assert_eq!(inst.instr.far_branch32(), 0x1000);
    assert!(inst.ends_block());
}

#[test]
fn straight_line_instruction_does_not_end_block() {
    let inst = decode_one(DecodeMode::Bits16, 0, &[0x40]).expect("inc ax");
    assert_eq!(inst.instr.mnemonic(), Mnemonic::Inc);
    assert!(!inst.ends_block());
}
