use crate::state::{mask_bits, EFlags};

fn sign_bit(bits: u32) -> u32 {
    1u32 << (bits - 1)
}

fn parity(byte: u8) -> bool {
    byte.count_ones() % 2 == 0
}

fn set_result_flags(flags: &mut EFlags, result: u32, bits: u32) {
    flags.set(EFlags::ZF, result == 0);
    flags.set(EFlags::SF, (result & sign_bit(bits)) != 0);
    flags.set(EFlags::PF, parity(result as u8));
}

pub fn sub_with_flags(flags: &mut EFlags, dest: u32, src: u32, borrow_in: bool, bits: u32) -> u32 {
    let mask = mask_bits(bits);
    let dest = dest & mask;
    let src = src & mask;
    let subtrahend = src as u64 + borrow_in as u64;
    let result = (dest as u64).wrapping_sub(subtrahend) as u32 & mask;

    let sb = sign_bit(bits);
    flags.set(EFlags::CF, (dest as u64) < subtrahend);
    flags.set(EFlags::OF, ((dest ^ src) & (dest ^ result) & sb) != 0);
    flags.set(EFlags::AF, ((dest ^ src ^ result) & 0x10) != 0);
    set_result_flags(flags, result, bits);
    result
}

pub fn add_with_flags(flags: &mut EFlags, dest: u32, src: u32, carry_in: bool, bits: u32) -> u32 {
    let mask = mask_bits(bits);
    let dest = dest & mask;
    let src = src & mask;
    let full = dest as u64 + src as u64 + carry_in as u64;
    let result = full as u32 & mask;

    let sb = sign_bit(bits);
    flags.set(EFlags::CF, full > mask as u64);
    flags.set(EFlags::OF, ((dest ^ result) & (src ^ result) & sb) != 0);
    flags.set(EFlags::AF, ((dest ^ src ^ result) & 0x10) != 0);
    set_result_flags(flags, result, bits);
    result
}

pub fn logic_with_flags(flags: &mut EFlags, result: u32, bits: u32) -> u32 {
    let result = result & mask_bits(bits);
    flags.remove(EFlags::CF | EFlags::OF);
    set_result_flags(flags, result, bits);
    result
}

/// INC/DEC: like ADD/SUB with 1 but CF is preserved.
pub fn inc_dec_with_flags(flags: &mut EFlags, dest: u32, inc: bool, bits: u32) -> u32 {
    let cf = flags.contains(EFlags::CF);
    let result = if inc {
        add_with_flags(flags, dest, 1, false, bits)
    } else {
        sub_with_flags(flags, dest, 1, false, bits)
    };
    flags.set(EFlags::CF, cf);
    result
}

#[inline]
pub fn sign_extend(value: u32, bits: u32) -> i64 {
    match bits {
        8 => value as u8 as i8 as i64,
        16 => value as u16 as i16 as i64,
        _ => value as i32 as i64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_sets_carry_and_overflow() {
        let mut f = EFlags::empty();
        assert_eq!(add_with_flags(&mut f, 0xFF, 1, false, 8), 0);
        assert!(f.contains(EFlags::CF | EFlags::ZF | EFlags::AF));
        assert!(!f.contains(EFlags::OF));

        assert_eq!(add_with_flags(&mut f, 0x7FFF, 1, false, 16), 0x8000);
        assert!(f.contains(EFlags::OF | EFlags::SF));
        assert!(!f.contains(EFlags::CF));
    }

    #[test]
    fn sub_with_borrow_wraps() {
        let mut f = EFlags::empty();
        assert_eq!(sub_with_flags(&mut f, 0, 0, true, 32), 0xFFFF_FFFF);
        assert!(f.contains(EFlags::CF | EFlags::SF));
    }

    #[test]
    fn inc_preserves_carry() {
        let mut f = EFlags::CF;
        assert_eq!(inc_dec_with_flags(&mut f, 0xFFFF, true, 16), 0);
        assert!(f.contains(EFlags::CF | EFlags::ZF));
        let mut f = EFlags::empty();
        inc_dec_with_flags(&mut f, 0, false, 8);
        assert!(!f.contains(EFlags::CF));
    }
}
