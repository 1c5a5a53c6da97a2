//! Detection flags, emulation options, and the constants behind the memory-probing heuristics.

use bitflags::bitflags;
use memchr::memchr;

bitflags! {
    /// Sticky detection flags raised by the heuristics.
    ///
    /// Bits are OR-accumulated over the run and never cleared; a non-empty set at the end of a
    /// run is the emulator's verdict that the buffer behaved like shellcode.
    #[derive(Default, Clone, Copy, PartialEq, Eq, Debug)]
    pub struct Detection: u64 {
        /// A leading run of NOPs covered the configured share of all executed instructions.
        const NOP_SLED      = 1 << 0;
        /// An instruction was fetched from bytes previously rewritten by the code itself.
        const WRITE_SELF    = 1 << 1;
        /// A saved return address was read back and propagated somewhere other than a return.
        const LOAD_RIP      = 1 << 2;
        /// A register was pointed at a printable string constructed on the virtual stack.
        const STACK_STR     = 1 << 3;
        /// The thread/process control block was probed through FS/GS.
        const TIB_ACCESS    = 1 << 4;
        /// 32-bit access to the TIB's Wow64 syscall-thunk field.
        const WOW64_ACCESS  = 1 << 5;
        /// An access fell inside the kernel-shared data page.
        const SUD_ACCESS    = 1 << 6;
        /// The stack pointer was exchanged with a pointer into emulated memory.
        const STACK_PIVOT   = 1 << 7;
        /// A syscall was issued with a plausible service number in the accumulator.
        const SYSCALL       = 1 << 8;
        /// SWAPGS executed in ring 0.
        const SWAPGS        = 1 << 9;
        /// SIDT executed in ring 0.
        const SIDT          = 1 << 10;
        /// A SYSCALL/SYSENTER MSR was read in ring 0.
        const MSR_READ      = 1 << 11;
        /// A SYSCALL/SYSENTER MSR was written in ring 0.
        const MSR_WRITE     = 1 << 12;
        /// A far branch in 32-bit mode targeted the 64-bit code segment selector.
        const HEAVENS_GATE  = 1 << 13;
    }
}

bitflags! {
    /// Emulation options supplied through [`Params`](super::Params).
    #[derive(Default, Clone, Copy, PartialEq, Eq, Debug)]
    pub struct Options: u64 {
        /// Log every emulated instruction at `trace` level.
        const TRACE              = 1 << 0;
        /// Abort the run as soon as any detection bit is raised.
        const STOP_ON_DETECTION  = 1 << 1;
        /// Track self-writes in the bitmap but leave the shellcode image unmodified.
        const BYPASS_SELF_WRITES = 1 << 2;
        /// Accepted for callers that probe AES-NI payloads; the AES subset itself is not
        /// emulated and such instructions abort cleanly as unsupported.
        const SUPPORT_AES        = 1 << 3;
        /// Accepted for forward compatibility with extended-register (APX) decoders.
        const EXTENDED_REGS      = 1 << 4;
    }
}

/// Offset of the PEB pointer inside the 32-bit TEB, reached through FS.
pub(super) const TEB_PEB_OFFSET_32: u64 = 0x30;
/// Offset of the PEB pointer inside the 64-bit TEB, reached through GS.
pub(super) const TEB_PEB_OFFSET_64: u64 = 0x60;
/// Offset of the Wow64 syscall-thunk field inside the 32-bit TEB.
pub(super) const TEB_WOW64_OFFSET: u64 = 0xc0;

/// Base and size of the kernel-shared data page, identical in 32 and 64-bit processes.
pub(super) const SHARED_USER_DATA: u64 = 0x7ffe_0000;
pub(super) const SHARED_USER_DATA_SIZE: u64 = 0x1000;

/// The 64-bit code segment selector targeted by Heaven's Gate transitions.
pub(super) const GATE64_CS: u16 = 0x33;

/// MSRs involved in syscall dispatch; reads/writes of these in ring 0 are a hooking signal.
pub(super) const MSR_SYSENTER_CS: u32 = 0x174;
pub(super) const MSR_SYSENTER_ESP: u32 = 0x175;
pub(super) const MSR_SYSENTER_EIP: u32 = 0x176;
pub(super) const MSR_STAR: u32 = 0xc000_0081;
pub(super) const MSR_LSTAR: u32 = 0xc000_0082;
pub(super) const MSR_CSTAR: u32 = 0xc000_0083;

pub(super) fn is_syscall_msr(msr: u32) -> bool {
    matches!(
        msr,
        MSR_SYSENTER_CS | MSR_SYSENTER_ESP | MSR_SYSENTER_EIP | MSR_STAR | MSR_LSTAR | MSR_CSTAR
    )
}

/// Characters that plausibly appear in path/identifier strings built by shellcode.
fn is_path_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'\\' | b'/' | b':' | b'.' | b' ' | b'-' | b'_')
}

/// Length of the printable path/identifier run at the start of `buf`.
/// The scan is capped at the first NUL terminator.
pub(super) fn printable_run_len(buf: &[u8]) -> usize {
    let end = memchr(0, buf).unwrap_or(buf.len());
    buf[..end].iter().take_while(|&&b| is_path_char(b)).count()
}

#[test]
fn test_printable_run() {
    assert_eq!(printable_run_len(b"C:\\Windows\\system32\0junk"), 19);
    assert_eq!(printable_run_len(b"ws2_32.dll"), 10);
    assert_eq!(printable_run_len(b"abc\x01def"), 3);
    assert_eq!(printable_run_len(b"\x90\x90\x90"), 0);
    assert_eq!(printable_run_len(b""), 0);
}

#[test]
fn test_detection_accumulation() {
    let mut d = Detection::default();
    d |= Detection::WRITE_SELF;
    d |= Detection::SYSCALL;
    assert!(d.contains(Detection::WRITE_SELF | Detection::SYSCALL));
    assert!(!d.contains(Detection::NOP_SLED));
}
