#![forbid(unsafe_code)]

//! Shellcage is a bounded, single-threaded emulator for x86/x86-64 machine code.
//! It runs untrusted shellcode candidates (carved from documents, memory dumps, or network
//! payloads) inside a virtual CPU with a private stack, and raises sticky detection flags for
//! behaviors characteristic of malicious code: decryption loops that rewrite their own bytes,
//! strings constructed on the stack, direct syscalls, stack pivots, NOP sleds, and
//! kernel-structure probing.
//!
//! Instructions are decoded with [`iced-x86`](https://docs.rs/iced-x86); everything after the
//! decode step (operand resolution, arithmetic and flag semantics, the detection heuristics)
//! is implemented here.
//!
//! # Example of Usage
//!
//! ```
//! # use shellcage::emu::*;
//! // a tiny 32-bit decoder loop: xor the payload with 0xaa, then fall into it
//! let shellcode = [
//!     0xbe, 0x10, 0x00, 0x10, 0x00, // mov esi, base+0x10
//!     0xb9, 0x04, 0x00, 0x00, 0x00, // mov ecx, 4
//!     0x80, 0x36, 0xaa,             // xor byte [esi], 0xaa
//!     0x46,                         // inc esi
//!     0xe2, 0xfa,                   // loop back to the xor
//!     0xea, 0xea, 0xea, 0xea,       // "encrypted" payload (inc eax, xored)
//! ];
//!
//! let mut emu = Emulator::new();
//! emu.init(&shellcode, &Params { mode: Mode::Bits32, ..Default::default() }).unwrap();
//! emu.run();
//!
//! // the decryption loop rewrote bytes that are later fetched for execution
//! assert!(emu.detections.contains(Detection::WRITE_SELF));
//! ```

macro_rules! mask {
    ($src:ident : $($mask:ident)|+) => {
        $($src::$mask)|+
    };
    () => { 0 };
}

pub mod emu;

#[cfg(test)]
mod test;
