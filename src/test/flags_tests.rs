use super::*;
use crate::emu::flags::{set_arith_flags, FlagsOp};
use crate::emu::*;

/// Independent reference model for ADD flags, built from widened arithmetic rather than the
/// engine's sign-identity formulas.
fn ref_add(a: u64, b: u64, size: usize) -> (u64, bool, bool, bool, bool, bool, bool) {
    let bits = size as u32 * 8;
    let mask = if bits == 64 { u64::MAX } else { (1u64 << bits) - 1 };
    let (a, b) = (a & mask, b & mask);
    let full = a as u128 + b as u128;
    let res = full as u64 & mask;
    let sign = |v: u64| (v >> (bits - 1)) & 1 != 0;
    let cf = full >> bits != 0;
    let of = sign(a) == sign(b) && sign(res) != sign(a);
    let af = (a & 0xf) + (b & 0xf) > 0xf;
    (res, cf, of, res == 0, sign(res), (res as u8).count_ones() % 2 == 0, af)
}

/// Independent reference model for SUB flags.
fn ref_sub(a: u64, b: u64, size: usize) -> (u64, bool, bool, bool, bool, bool, bool) {
    let bits = size as u32 * 8;
    let mask = if bits == 64 { u64::MAX } else { (1u64 << bits) - 1 };
    let (a, b) = (a & mask, b & mask);
    let res = a.wrapping_sub(b) & mask;
    let sign = |v: u64| (v >> (bits - 1)) & 1 != 0;
    let cf = a < b;
    let of = sign(a) != sign(b) && sign(res) != sign(a);
    let af = (a & 0xf) < (b & 0xf);
    (res, cf, of, res == 0, sign(res), (res as u8).count_ones() % 2 == 0, af)
}

/// Every sign/magnitude boundary for every supported operand size, ADD and SUB, against the
/// reference model.
#[test]
fn test_add_sub_flag_grid() {
    for &size in &[1usize, 2, 4, 8] {
        let bits = size as u32 * 8;
        let mask = if bits == 64 { u64::MAX } else { (1u64 << bits) - 1 };
        let max_pos = mask >> 1;
        let min_neg = max_pos + 1;
        let boundary = [0u64, 1, max_pos, min_neg, mask];

        for &a in &boundary {
            for &b in &boundary {
                let (res, cf, of, zf, sf, pf, af) = ref_add(a, b, size);
                let mut f = Flags::default();
                set_arith_flags(&mut f, a.wrapping_add(b), a, b, size, FlagsOp::Add);
                assert_eq!(
                    (f.get_cf(), f.get_of(), f.get_zf(), f.get_sf(), f.get_pf(), f.get_af()),
                    (cf, of, zf, sf, pf, af),
                    "add {:#x} + {:#x} (size {}) -> {:#x}",
                    a, b, size, res
                );

                let (res, cf, of, zf, sf, pf, af) = ref_sub(a, b, size);
                let mut f = Flags::default();
                set_arith_flags(&mut f, a.wrapping_sub(b), a, b, size, FlagsOp::Sub);
                assert_eq!(
                    (f.get_cf(), f.get_of(), f.get_zf(), f.get_sf(), f.get_pf(), f.get_af()),
                    (cf, of, zf, sf, pf, af),
                    "sub {:#x} - {:#x} (size {}) -> {:#x}",
                    a, b, size, res
                );
            }
        }
    }
}

#[test]
fn test_shift_carry_and_overflow() {
    // single-bit left shift out of the top: carry set, overflow = sign change vs carry
    let mut f = Flags::default();
    set_arith_flags(&mut f, 0x00, 0x80, 1, 1, FlagsOp::Shl);
    assert!(f.get_cf() && f.get_zf() && f.get_of());

    // single-bit right shift: carry is the old bit 0, overflow is the old sign
    let mut f = Flags::default();
    set_arith_flags(&mut f, 0x40, 0x81, 1, 1, FlagsOp::Shr);
    assert!(f.get_cf() && f.get_of());

    // single-bit arithmetic shift clears overflow
    let mut f = Flags(Flags::MASK_OF);
    set_arith_flags(&mut f, 0xc0, 0x81, 1, 1, FlagsOp::Sar);
    assert!(f.get_cf() && !f.get_of() && f.get_sf());
}

/// A zero-count shift executed as machine code leaves the flags byte-for-byte unchanged.
#[test]
fn test_zero_shift_preserves_machine_flags() {
    let code = [
        0xb8, 0xff, 0xff, 0xff, 0xff, // mov eax, -1
        0x83, 0xc0, 0x01, // add eax, 1 (sets CF/ZF/PF/AF)
        0xc1, 0xe0, 0x00, // shl eax, 0
        0xc1, 0xf8, 0x00, // sar eax, 0
    ];
    let mut emu = emu32(&code);
    emu.execute_cycles(2);
    let snapshot = emu.flags;
    assert!(snapshot.get_cf() && snapshot.get_zf());

    emu.execute_cycles(2);
    assert_eq!(emu.flags.0, snapshot.0);
}

/// SAR by at least the operand width produces an all-sign result with carry = sign.
#[test]
fn test_sar_saturates_to_sign() {
    let code = [
        0xb3, 0x80, // mov bl, 0x80
        0xc0, 0xfb, 0x10, // sar bl, 16
        0xb1, 0x40, // mov cl, 0x40
        0xc0, 0xf9, 0x10, // sar cl, 16
    ];
    let mut emu = emu_with(
        &code,
        Params { mode: Mode::Bits32, max_instructions: Some(4), ..Default::default() },
    );
    let (_, reason) = emu.execute_cycles(2);
    assert_eq!(reason, StopReason::MaxCycles);
    assert_eq!(emu.cpu.get_bl(), 0xff);
    assert!(emu.flags.get_cf());

    assert_eq!(emu.run(), StopReason::Completed);
    assert_eq!(emu.cpu.get_cl(), 0x00);
    assert!(!emu.flags.get_cf());
    assert!(emu.flags.get_zf());
}

#[test]
fn test_logic_clears_carry_overflow() {
    let code = [
        0xb8, 0xff, 0xff, 0xff, 0xff, // mov eax, -1
        0x83, 0xc0, 0x01, // add eax, 1 (sets CF)
        0x09, 0xd8, // or eax, ebx
    ];
    let mut emu = emu_with(
        &code,
        Params { mode: Mode::Bits32, max_instructions: Some(3), ..Default::default() },
    );
    assert_eq!(emu.run(), StopReason::Completed);
    assert!(!emu.flags.get_cf() && !emu.flags.get_of());
    assert!(emu.flags.get_zf()); // 0 | 0
}

#[test]
fn test_inc_preserves_carry() {
    let code = [
        0xb8, 0xff, 0xff, 0xff, 0xff, // mov eax, -1
        0x83, 0xc0, 0x01, // add eax, 1 (sets CF)
        0x43, // inc ebx
    ];
    let mut emu = emu_with(
        &code,
        Params { mode: Mode::Bits32, max_instructions: Some(3), ..Default::default() },
    );
    assert_eq!(emu.run(), StopReason::Completed);
    assert!(emu.flags.get_cf());
    assert_eq!(emu.cpu.get_ebx(), 1);
}

#[test]
fn test_condition_codes_drive_branches() {
    // cmp 1, 2 then jb: the below condition must take the branch
    let code = [
        0xb8, 0x01, 0x00, 0x00, 0x00, // mov eax, 1
        0x83, 0xf8, 0x02, // cmp eax, 2
        0x72, 0x02, // jb +2
        0x0f, 0x0b, // ud2 (skipped)
        0xbb, 0x2a, 0x00, 0x00, 0x00, // mov ebx, 42
    ];
    let mut emu = emu_with(
        &code,
        Params { mode: Mode::Bits32, max_instructions: Some(4), ..Default::default() },
    );
    assert_eq!(emu.run(), StopReason::Completed);
    assert_eq!(emu.cpu.get_ebx(), 42);
}
