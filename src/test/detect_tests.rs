use super::*;
use crate::emu::*;

#[test]
fn test_nop_sled() {
    let mut code = vec![0x90; 200];
    code.extend_from_slice(&[0x0f, 0x0b]); // ud2, never reached under this budget
    let mut emu = emu_with(
        &code,
        Params {
            mode: Mode::Bits32,
            max_instructions: Some(200),
            nop_threshold: Some(75),
            ..Default::default()
        },
    );
    assert_eq!(emu.run(), StopReason::Completed);
    assert_eq!(emu.counters.nops, 200);
    assert!(emu.detections.contains(Detection::NOP_SLED));
}

#[test]
fn test_nop_sled_needs_half_budget() {
    // ten NOPs against a huge budget: the run aborts early and the ratio is not judged
    let code = [0x90; 10];
    let mut emu = emu32(&code);
    assert_eq!(emu.run(), StopReason::Error(EmuError::RipOutside));
    assert!(!emu.detections.contains(Detection::NOP_SLED));
}

#[test]
fn test_write_self() {
    let code = [
        0xc6, 0x05, 0x00, 0x00, 0x10, 0x00, 0x90, // mov byte [shell base], 0x90
        0xeb, 0xf7, // jmp back to offset 0
    ];
    let mut emu = emu_with(
        &code,
        Params { mode: Mode::Bits32, max_instructions: Some(64), ..Default::default() },
    );
    assert_eq!(emu.run(), StopReason::Completed);
    assert!(emu.detections.contains(Detection::WRITE_SELF));
    // the store really landed in the image
    assert_eq!(emu.shellcode()[0], 0x90);
}

#[test]
fn test_write_self_bypass_keeps_image() {
    let code = [
        0xc6, 0x05, 0x00, 0x00, 0x10, 0x00, 0x90, // mov byte [shell base], 0x90
        0xeb, 0xf7, // jmp back to offset 0
    ];
    let mut emu = emu_with(
        &code,
        Params {
            mode: Mode::Bits32,
            max_instructions: Some(64),
            options: Options::BYPASS_SELF_WRITES,
            ..Default::default()
        },
    );
    assert_eq!(emu.run(), StopReason::Completed);
    // the write is tracked but the image stays pristine
    assert!(emu.detections.contains(Detection::WRITE_SELF));
    assert_eq!(emu.shellcode()[0], 0xc6);
}

#[test]
fn test_stop_on_detection_aborts_next_instruction() {
    let code = [
        0xc6, 0x05, 0x00, 0x00, 0x10, 0x00, 0x90, // mov byte [shell base], 0x90
        0xeb, 0xf7, // jmp back to offset 0
    ];
    let mut emu = emu_with(
        &code,
        Params {
            mode: Mode::Bits32,
            max_instructions: Some(64),
            options: Options::STOP_ON_DETECTION,
            ..Default::default()
        },
    );
    assert_eq!(emu.run(), StopReason::Detected);
    assert_eq!(emu.get_state(), State::Detected);
    // store, jmp, then the flagged re-fetch executes before the policy stop
    assert_eq!(emu.counters.instructions, 3);
}

#[test]
fn test_stack_pivot_alignment() {
    // xchg with an aligned stack pointer target fires, a misaligned one does not
    let aligned = [
        0xb8, 0x00, 0x08, 0x20, 0x00, // mov eax, stack base + 0x800
        0x94, // xchg eax, esp
    ];
    let mut emu = emu32(&aligned);
    emu.run();
    assert!(emu.detections.contains(Detection::STACK_PIVOT));

    let misaligned = [
        0xb8, 0x01, 0x08, 0x20, 0x00, // mov eax, stack base + 0x801
        0x94, // xchg eax, esp
    ];
    let mut emu = emu32(&misaligned);
    emu.run();
    assert!(!emu.detections.contains(Detection::STACK_PIVOT));
}

#[test]
fn test_stack_string() {
    let code = [
        0x68, 0x42, 0x42, 0x42, 0x42, // push 'BBBB'
        0x68, 0x41, 0x41, 0x41, 0x41, // push 'AAAA'
        0x89, 0xe0, // mov eax, esp
    ];
    let mut emu = emu_with(
        &code,
        Params { mode: Mode::Bits32, max_instructions: Some(3), ..Default::default() },
    );
    assert_eq!(emu.run(), StopReason::Completed);
    assert!(emu.detections.contains(Detection::STACK_STR));
}

#[test]
fn test_stack_string_below_threshold() {
    let code = [
        0x68, 0x41, 0x41, 0x41, 0x41, // push 'AAAA'
        0x89, 0xe0, // mov eax, esp
    ];
    let mut emu = emu_with(
        &code,
        Params {
            mode: Mode::Bits32,
            max_instructions: Some(2),
            str_threshold: Some(8),
            ..Default::default()
        },
    );
    assert_eq!(emu.run(), StopReason::Completed);
    assert!(!emu.detections.contains(Detection::STACK_STR));
}

#[test]
fn test_load_rip() {
    let code = [
        0xe8, 0x00, 0x00, 0x00, 0x00, // call +0
        0x58, // pop eax (reads the saved return address)
    ];
    let mut emu = emu_with(
        &code,
        Params { mode: Mode::Bits32, max_instructions: Some(2), ..Default::default() },
    );
    assert_eq!(emu.run(), StopReason::Completed);
    assert!(emu.detections.contains(Detection::LOAD_RIP));
    assert_eq!(emu.cpu.get_eax(), 0x0010_0005);
}

#[test]
fn test_ret_does_not_flag_load_rip() {
    let code = [
        0xe8, 0x00, 0x00, 0x00, 0x00, // call +0
        0xc3, // ret (the natural consumer of the saved address)
    ];
    let mut emu = emu32(&code);
    // ret lands back on itself; one more ret then underflows into plain stack bytes
    emu.execute_cycles(2);
    assert!(!emu.detections.contains(Detection::LOAD_RIP));
}

#[test]
fn test_tib_and_wow64_access() {
    let code = [
        0x64, 0xa1, 0x30, 0x00, 0x00, 0x00, // mov eax, fs:[0x30]
    ];
    let mut emu = emu_with(
        &code,
        Params { mode: Mode::Bits32, fs_base: 0x7ffd_f000, ..Default::default() },
    );
    // the probe is flagged even though the access itself fails closed
    assert_eq!(emu.run(), StopReason::Error(EmuError::MemOutOfBounds));
    assert!(emu.detections.contains(Detection::TIB_ACCESS));

    let code = [
        0x64, 0xa1, 0xc0, 0x00, 0x00, 0x00, // mov eax, fs:[0xc0]
    ];
    let mut emu = emu_with(
        &code,
        Params { mode: Mode::Bits32, fs_base: 0x7ffd_f000, ..Default::default() },
    );
    emu.run();
    assert!(emu.detections.contains(Detection::WOW64_ACCESS));
    assert!(!emu.detections.contains(Detection::TIB_ACCESS));
}

#[test]
fn test_tib_access_64() {
    let code = [
        0x65, 0x48, 0x8b, 0x04, 0x25, 0x60, 0x00, 0x00, 0x00, // mov rax, gs:[0x60]
    ];
    let mut emu = emu_with(
        &code,
        Params { mode: Mode::Bits64, gs_base: 0x7ff6_0000_0000, ..Default::default() },
    );
    emu.run();
    assert!(emu.detections.contains(Detection::TIB_ACCESS));
}

#[test]
fn test_shared_user_data_access() {
    let code = [
        0xa1, 0x00, 0x03, 0xfe, 0x7f, // mov eax, [0x7ffe0300]
    ];
    let mut emu = emu32(&code);
    emu.run();
    assert!(emu.detections.contains(Detection::SUD_ACCESS));
}

#[test]
fn test_heavens_gate() {
    let code = [
        0xea, 0x00, 0x00, 0x00, 0x00, 0x33, 0x00, // jmp 0x33:0
    ];
    let mut emu = emu32(&code);
    assert_eq!(emu.run(), StopReason::Error(EmuError::CantContinue));
    assert!(emu.detections.contains(Detection::HEAVENS_GATE));
    assert_eq!(emu.counters.instructions, 1);
}

#[test]
fn test_syscall_detection() {
    let code = [
        0xb8, 0x3b, 0x00, 0x00, 0x00, // mov eax, 0x3b
        0x0f, 0x05, // syscall
    ];
    let mut emu = emu64(&code);
    assert_eq!(emu.run(), StopReason::Error(EmuError::CantContinue));
    assert!(emu.detections.contains(Detection::SYSCALL));

    // int 0x80 with a plausible service number in the accumulator
    let code = [
        0xb8, 0x01, 0x00, 0x00, 0x00, // mov eax, 1
        0xcd, 0x80, // int 0x80
    ];
    let mut emu = emu32(&code);
    assert_eq!(emu.run(), StopReason::Error(EmuError::CantContinue));
    assert!(emu.detections.contains(Detection::SYSCALL));

    // a large accumulator value is not a plausible syscall number
    let code = [
        0xb8, 0x00, 0x00, 0x10, 0x00, // mov eax, 0x100000
        0x0f, 0x05, // syscall
    ];
    let mut emu = emu64(&code);
    emu.run();
    assert!(!emu.detections.contains(Detection::SYSCALL));
}

#[test]
fn test_kernel_probes_in_ring0() {
    let code = [
        0x0f, 0x01, 0x4c, 0x24, 0xf6, // sidt [rsp-10]
        0xb9, 0x82, 0x00, 0x00, 0xc0, // mov ecx, 0xc0000082 (LSTAR)
        0x0f, 0x32, // rdmsr
        0x0f, 0x01, 0xf8, // swapgs
    ];
    let mut emu = emu_with(
        &code,
        Params { mode: Mode::Bits64, ring: Some(0), ..Default::default() },
    );
    assert_eq!(emu.run(), StopReason::Error(EmuError::CantContinue));
    assert!(emu.detections.contains(Detection::SIDT));
    assert!(emu.detections.contains(Detection::MSR_READ));
    assert!(emu.detections.contains(Detection::SWAPGS));
    assert_eq!(emu.counters.instructions, 4);
}

#[test]
fn test_msr_write_detection() {
    let code = [
        0xb9, 0x82, 0x00, 0x00, 0xc0, // mov ecx, 0xc0000082 (LSTAR)
        0x31, 0xc0, // xor eax, eax
        0x31, 0xd2, // xor edx, edx
        0x0f, 0x30, // wrmsr
        0x0f, 0x32, // rdmsr
    ];
    let mut emu = emu_with(
        &code,
        Params {
            mode: Mode::Bits64,
            ring: Some(0),
            max_instructions: Some(5),
            ..Default::default()
        },
    );
    assert_eq!(emu.run(), StopReason::Completed);
    assert!(emu.detections.contains(Detection::MSR_WRITE));
    assert!(emu.detections.contains(Detection::MSR_READ));
}

#[test]
fn test_mem_hook_serves_external_reads() {
    let code = [
        0x64, 0xa1, 0x30, 0x00, 0x00, 0x00, // mov eax, fs:[0x30]
    ];
    let mut emu = emu_with(
        &code,
        Params {
            mode: Mode::Bits32,
            fs_base: 0x7ffd_f000,
            max_instructions: Some(1),
            ..Default::default()
        },
    );
    emu.set_mem_hook(Box::new(|_addr, buf, access| {
        if access == MemAccess::Read {
            for b in buf.iter_mut() {
                *b = 0x11;
            }
        }
        true
    }));
    assert_eq!(emu.run(), StopReason::Completed);
    assert_eq!(emu.cpu.get_eax(), 0x11111111);
    assert_eq!(emu.counters.external_accesses, 1);
    assert!(emu.detections.contains(Detection::TIB_ACCESS));
}

#[test]
fn test_external_access_threshold() {
    let code = [
        0xa1, 0x00, 0x00, 0x30, 0x00, // mov eax, [0x300000]
        0xa1, 0x04, 0x00, 0x30, 0x00, // mov eax, [0x300004]
    ];
    let mut emu = emu_with(
        &code,
        Params { mode: Mode::Bits32, mem_threshold: Some(1), ..Default::default() },
    );
    emu.set_mem_hook(Box::new(|_, buf, _| {
        for b in buf.iter_mut() {
            *b = 0;
        }
        true
    }));
    // the second external access exceeds the configured cap
    assert_eq!(emu.run(), StopReason::Error(EmuError::MemOutOfBounds));
    assert_eq!(emu.counters.instructions, 2);
}
