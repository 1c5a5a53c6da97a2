use crate::emu::*;

fn emu_with(code: &[u8], params: Params) -> Emulator {
    let mut emu = Emulator::new();
    emu.init(code, &params).unwrap();
    emu
}

fn emu32(code: &[u8]) -> Emulator {
    emu_with(code, Params { mode: Mode::Bits32, ..Default::default() })
}

fn emu64(code: &[u8]) -> Emulator {
    emu_with(code, Params { mode: Mode::Bits64, ..Default::default() })
}

mod detect_tests;
mod flags_tests;
