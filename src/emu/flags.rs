//! Flag computation for the arithmetic, logic, and shift instruction families.

use super::registers::Flags;
use super::{sign_bit, truncate};

/// Which family's flag semantics to apply in [`set_arith_flags`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlagsOp {
    /// AND/OR/XOR/TEST: carry and overflow cleared.
    Logic,
    /// Left shifts; `src2` is the shift count.
    Shl,
    /// Logical right shifts; `src2` is the shift count.
    Shr,
    /// Arithmetic right shifts; `src2` is the shift count.
    Sar,
    /// SUB/CMP/NEG-style borrow semantics.
    Sub,
    /// ADD-style carry semantics.
    Add,
}

fn update_zsp(flags: &mut Flags, dst: u64, size: usize) {
    flags.0 &= !mask!(Flags: MASK_ZF | MASK_SF | MASK_PF);
    if truncate(dst, size) == 0 {
        flags.set_zf();
    }
    if sign_bit(dst, size) {
        flags.set_sf();
    }
    // parity is computed from the low byte only
    if (dst as u8).count_ones() % 2 == 0 {
        flags.set_pf();
    }
}

/// Recomputes the status flags for one result.
///
/// `dst` is the (possibly untruncated) result, `src1`/`src2` the inputs as the instruction saw
/// them; all three are masked to `size` bytes before evaluation. For the shift modes `src2` is
/// the shift count: a count of zero leaves every flag untouched, and overflow is only defined
/// (and only written) for single-bit shifts. AF is left unchanged where it is architecturally
/// undefined (logic and shifts).
pub fn set_arith_flags(flags: &mut Flags, dst: u64, src1: u64, src2: u64, size: usize, op: FlagsOp) {
    let bits = size as u32 * 8;
    let dst_m = truncate(dst, size);
    let src1_m = truncate(src1, size);
    let src2_m = truncate(src2, size);

    match op {
        FlagsOp::Logic => {
            flags.clear_cf();
            flags.clear_of();
            update_zsp(flags, dst_m, size);
        }
        FlagsOp::Add => {
            flags.assign_cf(dst_m < src1_m);
            flags.assign_af((src1_m ^ src2_m ^ dst_m) & 0x10 != 0);
            // overflow if the operands share a sign that differs from the result's
            flags.assign_of(sign_bit(!(src1_m ^ src2_m) & (src1_m ^ dst_m), size));
            update_zsp(flags, dst_m, size);
        }
        FlagsOp::Sub => {
            flags.assign_cf(src1_m < src2_m);
            flags.assign_af((src1_m ^ src2_m ^ dst_m) & 0x10 != 0);
            flags.assign_of(sign_bit((src1_m ^ src2_m) & (src1_m ^ dst_m), size));
            update_zsp(flags, dst_m, size);
        }
        FlagsOp::Shl => {
            let count = src2 as u32;
            if count == 0 {
                return;
            }
            // carry is the last bit shifted out the top
            let carry = match bits.checked_sub(count) {
                Some(idx) if idx < 64 => (src1_m >> idx) & 1 != 0,
                _ => false,
            };
            flags.assign_cf(carry);
            if count == 1 {
                flags.assign_of(sign_bit(dst_m, size) != carry);
            }
            update_zsp(flags, dst_m, size);
        }
        FlagsOp::Shr => {
            let count = src2 as u32;
            if count == 0 {
                return;
            }
            let carry = count <= 64 && (src1_m >> (count - 1).min(63)) & 1 != 0;
            flags.assign_cf(carry);
            if count == 1 {
                flags.assign_of(sign_bit(src1_m, size));
            }
            update_zsp(flags, dst_m, size);
        }
        FlagsOp::Sar => {
            let count = src2 as u32;
            if count == 0 {
                return;
            }
            // sign extension makes over-width counts naturally yield the sign bit
            let extended = super::sign_extend(src1_m, size) as i64;
            flags.assign_cf((extended >> (count - 1).min(63)) & 1 != 0);
            if count == 1 {
                flags.clear_of();
            }
            update_zsp(flags, dst_m, size);
        }
    }
}

#[test]
fn test_add_flags() {
    let mut f = Flags::default();
    set_arith_flags(&mut f, 0x100, 0xff, 0x01, 1, FlagsOp::Add);
    assert!(f.get_cf() && f.get_zf() && !f.get_sf() && !f.get_of() && f.get_af());

    let mut f = Flags::default();
    set_arith_flags(&mut f, 0x80, 0x7f, 0x01, 1, FlagsOp::Add);
    assert!(!f.get_cf() && f.get_of() && f.get_sf());
}

#[test]
fn test_sub_flags() {
    let mut f = Flags::default();
    set_arith_flags(&mut f, 0u64.wrapping_sub(1), 0, 1, 4, FlagsOp::Sub);
    assert!(f.get_cf() && f.get_sf() && !f.get_zf() && !f.get_of());

    let mut f = Flags::default();
    set_arith_flags(&mut f, (0x8000u64).wrapping_sub(1), 0x8000, 1, 2, FlagsOp::Sub);
    assert!(!f.get_cf() && f.get_of()); // min-negative minus one overflows
}

#[test]
fn test_zero_count_shift_leaves_flags() {
    let mut f = Flags(0x8d5);
    let before = f;
    set_arith_flags(&mut f, 0x1234, 0x1234, 0, 2, FlagsOp::Shl);
    assert_eq!(f, before);
    set_arith_flags(&mut f, 0x1234, 0x1234, 0, 2, FlagsOp::Sar);
    assert_eq!(f, before);
}

#[test]
fn test_sar_over_width() {
    // shifting an 8-bit negative value by more than 8 keeps producing sign bits
    let mut f = Flags::default();
    set_arith_flags(&mut f, 0xff, 0x80, 16, 1, FlagsOp::Sar);
    assert!(f.get_cf() && f.get_sf() && !f.get_zf());

    let mut f = Flags::default();
    set_arith_flags(&mut f, 0x00, 0x40, 16, 1, FlagsOp::Sar);
    assert!(!f.get_cf() && f.get_zf());
}
