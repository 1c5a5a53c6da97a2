//! The instruction emulation engine: context, dispatcher loop, operand model, and the
//! per-instruction semantic handlers.

use iced_x86::{Decoder, DecoderError, DecoderOptions, Instruction, Mnemonic, OpKind, Register};
use log::{debug, trace};

use std::collections::BTreeMap;

pub mod registers;
pub mod value;
pub mod flags;
pub mod bitmaps;
pub mod tracker;
pub mod detect;

mod muldiv;
mod strings;

pub use bitmaps::{ShellBitmap, StackBitmap};
pub use detect::{Detection, Options};
pub use flags::FlagsOp;
pub use registers::*;
pub use tracker::{ActiveLoop, LoopTracker};
pub use value::{Value, VALUE_CAPACITY};

/// Default cap on emulated instructions per run.
pub const DEFAULT_MAX_INSTRUCTIONS: u64 = 4096;
/// Default NOP-sled threshold: the leading NOP run as a percentage of all executed instructions.
pub const DEFAULT_NOP_THRESHOLD: u64 = 75;
/// Default minimum printable-run length for the stack-string heuristic, in bytes.
pub const DEFAULT_STR_THRESHOLD: usize = 8;
/// Default cap on memory accesses outside the shellcode/stack images (0 means unlimited).
pub const DEFAULT_MEM_THRESHOLD: u64 = 0;
/// Default virtual load address of the shellcode image.
pub const DEFAULT_SHELL_BASE: u64 = 0x10_0000;
/// Default virtual base of the stack region.
pub const DEFAULT_STACK_BASE: u64 = 0x20_0000;
/// Default stack size.
pub const DEFAULT_STACK_SIZE: usize = 0x2000;

/// Bitmask denoting flags that POPF-class instructions can modify.
pub const MODIFIABLE_FLAGS: u64 = 0x0024_4fd5;

/// Bytes handed to the decoder per instruction fetch.
const FETCH_WINDOW: usize = 16;
/// Valid bytes required beyond a pivoted stack pointer before the pivot heuristic fires.
const PIVOT_MIN_BYTES: u64 = 64;

/// Fake IDT bases reported by SIDT; shellcode only cares that the value looks kernel-like.
const IDT_BASE_64: u64 = 0xffff_8000_0000_0000;
const IDT_BASE_32: u64 = 0x8003_f400;

/// Truncates a value to the given byte size, which is then zero extended to 64-bit.
pub(crate) fn truncate(val: u64, size: usize) -> u64 {
    match size {
        1 => val as u8 as u64,
        2 => val as u16 as u64,
        4 => val as u32 as u64,
        8 => val,
        _ => panic!(),
    }
}
/// Sign extends a value of the given initial byte size to 64-bit.
/// The conversion is first performed by truncation, so bits outside the size range are ignored.
pub(crate) fn sign_extend(val: u64, size: usize) -> i64 {
    match size {
        1 => val as u8 as i8 as i64,
        2 => val as u16 as i16 as i64,
        4 => val as u32 as i32 as i64,
        8 => val as i64,
        _ => panic!(),
    }
}
/// Gets the sign bit of the value with the given byte size.
/// Bits outside the range of the size are ignored.
pub(crate) fn sign_bit(val: u64, size: usize) -> bool {
    sign_extend(val, size) < 0
}

/// Operating mode of the virtual CPU.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Bits16,
    Bits32,
    Bits64,
}
impl Mode {
    /// The decoder bitness for this mode.
    pub fn bitness(self) -> u32 {
        match self {
            Mode::Bits16 => 16,
            Mode::Bits32 => 32,
            Mode::Bits64 => 64,
        }
    }
    /// The natural address (and stack slot) width in bytes.
    pub fn addr_size(self) -> usize {
        match self {
            Mode::Bits16 => 2,
            Mode::Bits32 => 4,
            Mode::Bits64 => 8,
        }
    }
}
impl Default for Mode {
    fn default() -> Self {
        Mode::Bits32
    }
}

/// Current state of an emulator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    /// The emulator has not been initialized with a shellcode buffer.
    Uninitialized,
    /// The emulator is still running.
    Running,
    /// The instruction budget was exhausted without an abort: the run succeeded.
    Completed,
    /// The stop-on-detection policy terminated the run.
    Detected,
    /// The run aborted with an error.
    Error(EmuError),
}

/// Reason why execution stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    /// Emulator was not in the running state.
    NotRunning,
    /// Emulator executed the requested number of cycles; the run itself is still live.
    MaxCycles,
    /// The instruction budget was exhausted without an abort: the run succeeded.
    Completed,
    /// A detection bit was raised while the stop-on-detection option was set.
    Detected,
    /// An error was encountered during execution.
    Error(EmuError),
}

/// Reasons why a run can abort. Every abort is terminal: the engine never retries internally,
/// and the context is left exactly as the failing step left it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EmuError {
    /// Required buffers were missing or the configured regions are inconsistent.
    BadParams,
    /// The instruction pointer left the shellcode region.
    RipOutside,
    /// The decoder reported malformed bytes.
    DecodeError,
    /// A memory access fell outside every modeled region and no host hook accepted it.
    MemOutOfBounds,
    /// The host memory hook reported failure.
    HostAccessFailed,
    /// An operand exceeds the internal value capacity.
    OperandTooLarge,
    /// An operand referenced a register class the engine does not model.
    UnsupportedRegister,
    /// An operand used an addressing form the engine does not model.
    UnsupportedAddressing,
    /// The instruction decoded cleanly but has no semantic handler.
    UnsupportedInstruction,
    /// Division by zero, or a quotient too wide for its destination.
    DivideError,
    /// A segment register load carried a selector outside the modeled descriptor table.
    InvalidSelector,
    /// A privileged instruction executed outside ring 0.
    NoPrivilege,
    /// A handler recorded a condition it can only partially emulate; the run stops one
    /// instruction later so the partial state stays visible.
    CantContinue,
}

/// Access direction reported to the external memory hook.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemAccess {
    Read,
    Write,
}

/// Host hook serving memory outside the shellcode and stack images.
/// Returns `true` when the access was handled (for reads, `buf` must be filled).
pub type MemHook = Box<dyn FnMut(u64, &mut [u8], MemAccess) -> bool>;

/// Holds options for initializing an emulator.
///
/// Optional fields fall back to the documented `DEFAULT_*` constants.
#[derive(Default)]
pub struct Params {
    /// Operating mode of the virtual CPU.
    pub mode: Mode,
    /// Privilege ring (0-3) the code claims to run at. Defaults to 3 via [`Params::default`].
    pub ring: Option<u8>,
    /// Virtual address the shellcode image is mapped at.
    pub shell_base: Option<u64>,
    /// Offset into the shellcode where execution starts.
    pub entry_offset: u64,
    /// Virtual base address of the stack region.
    pub stack_base: Option<u64>,
    /// Stack size; ignored when `stack_image` is supplied.
    pub stack_size: Option<usize>,
    /// Initial stack content; zero-filled when omitted.
    pub stack_image: Option<Vec<u8>>,
    /// Cap on emulated instructions per run.
    pub max_instructions: Option<u64>,
    /// NOP-sled percentage threshold.
    pub nop_threshold: Option<u64>,
    /// Minimum printable run for the stack-string heuristic.
    pub str_threshold: Option<usize>,
    /// Cap on external memory accesses (0 = unlimited).
    pub mem_threshold: Option<u64>,
    /// Emulation options.
    pub options: Options,
    /// FS segment base (the 32-bit TEB address, when the caller models one).
    pub fs_base: u64,
    /// GS segment base (the 64-bit TEB address, when the caller models one).
    pub gs_base: u64,
}

/// Running totals maintained across a run.
#[derive(Default, Clone, Copy, Debug)]
pub struct Counters {
    /// Instructions executed, including repeat-prefix iterations.
    pub instructions: u64,
    /// Length of the leading, uninterrupted run of NOP instructions.
    pub nops: u64,
    /// Shellcode bytes fetched for execution at least once.
    pub unique_bytes: u64,
    /// Executed instructions whose encoding was entirely zero bytes.
    pub null_instructions: u64,
    /// Memory accesses routed outside the shellcode/stack images.
    pub external_accesses: u64,
}

/// Result of the external decode step.
enum DecodeFailure {
    /// The bytes do not form a valid instruction.
    Malformed,
    /// More bytes were needed than the window could supply.
    NeedMoreBytes,
}

/// Invokes the external decoder on one instruction window.
/// The engine depends only on this function and the decoded instruction view, never on the
/// decoder's table representation.
fn decode_one(mode: Mode, bytes: &[u8], ip: u64) -> Result<Instruction, DecodeFailure> {
    let mut decoder = Decoder::with_ip(mode.bitness(), bytes, ip, DecoderOptions::NONE);
    let ins = decoder.decode();
    if ins.is_invalid() {
        return Err(match decoder.last_error() {
            DecoderError::NoMoreBytes => DecodeFailure::NeedMoreBytes,
            _ => DecodeFailure::Malformed,
        });
    }
    Ok(ins)
}

fn gpr_index(reg: Register) -> Result<usize, EmuError> {
    let full = reg.full_register();
    let n = full.number();
    if full.is_gpr64() && n < 16 {
        Ok(n)
    } else {
        Err(EmuError::UnsupportedRegister)
    }
}
fn is_gpr_high(reg: Register) -> bool {
    matches!(reg, Register::AH | Register::CH | Register::DH | Register::BH)
}
fn mmx_index(reg: Register) -> Option<usize> {
    use iced_x86::Register::*;
    match reg {
        MM0 => Some(0),
        MM1 => Some(1),
        MM2 => Some(2),
        MM3 => Some(3),
        MM4 => Some(4),
        MM5 => Some(5),
        MM6 => Some(6),
        MM7 => Some(7),
        _ => Option::None,
    }
}
fn cr_index(reg: Register) -> Option<usize> {
    use iced_x86::Register::*;
    match reg {
        CR0 => Some(0),
        CR2 => Some(2),
        CR3 => Some(3),
        CR4 => Some(4),
        CR8 => Some(8),
        _ => Option::None,
    }
}
fn is_vec_reg(reg: Register) -> bool {
    reg.is_xmm() || reg.is_ymm() || reg.is_zmm()
}

/// Shellcode emulator which runs one candidate buffer inside a bounded virtual CPU.
pub struct Emulator {
    pub cpu: Cpu,
    pub vpu: Vpu,
    pub flags: Flags,
    pub segs: Segments,
    /// Control-register shadow values, indexed by register number.
    pub cr: [u64; 16],
    /// Sticky detection flags accumulated so far.
    pub detections: Detection,
    /// The loop tracker fed by every evaluated loop-like branch.
    pub tracker: LoopTracker,
    /// Running counters.
    pub counters: Counters,

    shell: Vec<u8>,
    shell_base: u64,
    stack: Vec<u8>,
    stack_base: u64,
    shell_bmp: ShellBitmap,
    stack_bmp: StackBitmap,

    rip: u64,
    mode: Mode,
    ring: u8,
    options: Options,
    max_instructions: u64,
    nop_threshold: u64,
    str_threshold: usize,
    mem_threshold: u64,

    msrs: BTreeMap<u32, u64>,
    tsc: u64,
    state: State,
    /// Deferred abort recorded by a handler; fires at the top of the next loop iteration.
    pending_stop: Option<EmuError>,
    /// The current instruction has read bytes holding a saved return address.
    rip_load: bool,
    mem_hook: Option<MemHook>,
}

impl Emulator {
    /// Creates a new emulator in the uninitialized state.
    pub fn new() -> Emulator {
        Emulator {
            cpu: Default::default(),
            vpu: Default::default(),
            flags: Default::default(),
            segs: Default::default(),
            cr: [0; 16],
            detections: Detection::empty(),
            tracker: Default::default(),
            counters: Default::default(),

            shell: vec![],
            shell_base: 0,
            stack: vec![],
            stack_base: 0,
            shell_bmp: Default::default(),
            stack_bmp: Default::default(),

            rip: 0,
            mode: Mode::Bits32,
            ring: 3,
            options: Options::empty(),
            max_instructions: DEFAULT_MAX_INSTRUCTIONS,
            nop_threshold: DEFAULT_NOP_THRESHOLD,
            str_threshold: DEFAULT_STR_THRESHOLD,
            mem_threshold: DEFAULT_MEM_THRESHOLD,

            msrs: BTreeMap::new(),
            tsc: 0,
            state: State::Uninitialized,
            pending_stop: None,
            rip_load: false,
            mem_hook: None,
        }
    }

    /// Initializes the emulator to run the provided shellcode candidate.
    ///
    /// The image is copied into the emulator; the virtual stack is zero-filled (or taken from
    /// `params.stack_image`). Registers are reset to a flat ring-appropriate state; callers that
    /// need specific initial register or segment values mutate the public fields afterwards,
    /// before the first call to [`execute_cycles`](Self::execute_cycles).
    pub fn init(&mut self, shellcode: &[u8], params: &Params) -> Result<(), EmuError> {
        let ring = params.ring.unwrap_or(3);
        if shellcode.is_empty() || ring > 3 || params.entry_offset >= shellcode.len() as u64 {
            return Err(EmuError::BadParams);
        }
        let shell_base = params.shell_base.unwrap_or(DEFAULT_SHELL_BASE);
        let stack_base = params.stack_base.unwrap_or(DEFAULT_STACK_BASE);
        let stack = match &params.stack_image {
            Some(image) if !image.is_empty() => image.clone(),
            Some(_) => return Err(EmuError::BadParams),
            None => vec![0; params.stack_size.unwrap_or(DEFAULT_STACK_SIZE)],
        };
        if stack.is_empty() {
            return Err(EmuError::BadParams);
        }
        let shell_end = shell_base.checked_add(shellcode.len() as u64).ok_or(EmuError::BadParams)?;
        let stack_end = stack_base.checked_add(stack.len() as u64).ok_or(EmuError::BadParams)?;
        if shell_base < stack_end && stack_base < shell_end {
            return Err(EmuError::BadParams); // regions must not overlap
        }

        self.mode = params.mode;
        self.ring = ring;
        self.options = params.options;
        self.max_instructions = params.max_instructions.unwrap_or(DEFAULT_MAX_INSTRUCTIONS);
        self.nop_threshold = params.nop_threshold.unwrap_or(DEFAULT_NOP_THRESHOLD);
        self.str_threshold = params.str_threshold.unwrap_or(DEFAULT_STR_THRESHOLD);
        self.mem_threshold = params.mem_threshold.unwrap_or(DEFAULT_MEM_THRESHOLD);

        self.shell = shellcode.to_vec();
        self.shell_base = shell_base;
        self.stack = stack;
        self.stack_base = stack_base;
        self.shell_bmp = ShellBitmap::new(self.shell.len());
        self.stack_bmp = StackBitmap::new(self.stack.len());

        self.cpu = Default::default();
        self.vpu = Default::default();
        self.flags = Flags(0x202);
        self.cr = [0; 16];
        self.segs = Default::default();
        let (code_sel, data_sel) = match self.mode {
            Mode::Bits64 => (0x33, 0x2b),
            _ => (0x1b, 0x23),
        };
        self.segs.cs.selector = code_sel;
        self.segs.ss.selector = data_sel;
        self.segs.ds.selector = data_sel;
        self.segs.es.selector = data_sel;
        self.segs.fs = SegmentRegister { selector: 0x3b, base: params.fs_base, limit: !0, rights: 0 };
        self.segs.gs = SegmentRegister { selector: 0x2b, base: params.gs_base, limit: !0, rights: 0 };

        // park the stack pointer near the top, leaving headroom for positive displacements
        let len = self.stack.len() as u64;
        let headroom = (len / 2).min(0x100);
        let rsp = ((self.stack_base + len - headroom) & !0xf).max(self.stack_base);
        self.cpu.regs[Cpu::RSP].raw_set(self.mode.addr_size(), rsp);

        self.detections = Detection::empty();
        self.tracker = Default::default();
        self.counters = Default::default();
        self.msrs.clear();
        self.tsc = 0;
        self.pending_stop = None;
        self.rip_load = false;

        self.rip = shell_base + params.entry_offset;
        self.state = State::Running;
        Ok(())
    }

    /// Installs the hook serving memory accesses outside the shellcode and stack images.
    /// Without one, such accesses fail closed.
    pub fn set_mem_hook(&mut self, hook: MemHook) {
        self.mem_hook = Some(hook);
    }

    /// Gets the current state of the emulator.
    pub fn get_state(&self) -> State {
        self.state
    }
    /// The current instruction pointer.
    pub fn rip(&self) -> u64 {
        self.rip
    }
    /// Overrides the instruction pointer (e.g. to retry a buffer from another entry point).
    pub fn set_rip(&mut self, rip: u64) {
        self.rip = rip;
    }
    /// The operating mode of this run.
    pub fn mode(&self) -> Mode {
        self.mode
    }
    /// The shellcode image in its current (possibly self-modified) state.
    pub fn shellcode(&self) -> &[u8] {
        &self.shell
    }
    /// The virtual stack content.
    pub fn stack(&self) -> &[u8] {
        &self.stack
    }

    /// Runs until the emulation reaches a terminal state.
    pub fn run(&mut self) -> StopReason {
        self.execute_cycles(u64::MAX).1
    }

    /// Resumes execution for up to the given number of instructions.
    /// Returns the number executed in this slice and the reason for stopping.
    pub fn execute_cycles(&mut self, cycles: u64) -> (u64, StopReason) {
        if self.state != State::Running {
            return (0, StopReason::NotRunning);
        }

        for cycle in 0..cycles {
            // a handler-recorded "cannot continue" condition and the stop-on-detection policy
            // both abort here, one instruction late, so the last instruction's state is visible
            if let Some(e) = self.pending_stop {
                return (cycle, self.finish(StopReason::Error(e)));
            }
            if self.options.contains(Options::STOP_ON_DETECTION) && !self.detections.is_empty() {
                return (cycle, self.finish(StopReason::Detected));
            }
            if self.counters.instructions >= self.max_instructions {
                return (cycle, self.finish(StopReason::Completed));
            }

            let rip = self.rip;
            let offset = match self.shell_offset(rip) {
                Some(o) => o,
                None => return (cycle, self.finish(StopReason::Error(EmuError::RipOutside))),
            };

            let avail = (self.shell.len() - offset).min(FETCH_WINDOW);
            let ins = match decode_one(self.mode, &self.shell[offset..offset + avail], rip) {
                Ok(ins) => ins,
                Err(DecodeFailure::NeedMoreBytes) => {
                    return (cycle, self.finish(StopReason::Error(EmuError::RipOutside)))
                }
                Err(DecodeFailure::Malformed) => {
                    return (cycle, self.finish(StopReason::Error(EmuError::DecodeError)))
                }
            };
            let len = ins.len();
            if offset + len > self.shell.len() {
                return (cycle, self.finish(StopReason::Error(EmuError::RipOutside)));
            }

            // instruction byte state: a fetch overlapping previously written bytes is the
            // self-modification signal
            if self.shell_bmp.any_dirty(offset, len) {
                self.detect(Detection::WRITE_SELF);
            }
            self.counters.unique_bytes += self.shell_bmp.mark_fetched(offset, len) as u64;

            self.counters.instructions += 1;
            if self.shell[offset..offset + len].iter().all(|&b| b == 0) {
                self.counters.null_instructions += 1;
            }
            if ins.mnemonic() == Mnemonic::Nop && self.counters.nops + 1 == self.counters.instructions {
                self.counters.nops += 1; // still inside the leading NOP run
            }

            self.rip_load = false;
            // the pointer moves before semantics execute, so relative branches and RIP-relative
            // operands see the address of the next instruction
            self.rip = rip.wrapping_add(len as u64);

            if self.options.contains(Options::TRACE) {
                trace!("{:#012x} {:?}", rip, ins.code());
            }

            if self.ring != 0 && ins.is_privileged() {
                return (cycle, self.finish(StopReason::Error(EmuError::NoPrivilege)));
            }

            if let Err(e) = self.dispatch(&ins) {
                return (cycle, self.finish(StopReason::Error(e)));
            }
        }

        (cycles, StopReason::MaxCycles)
    }

    /// Applies end-of-run evaluation and moves to a terminal state.
    fn finish(&mut self, reason: StopReason) -> StopReason {
        self.check_nop_sled();
        self.state = match reason {
            StopReason::Completed => State::Completed,
            StopReason::Detected => State::Detected,
            StopReason::Error(e) => State::Error(e),
            StopReason::NotRunning | StopReason::MaxCycles => self.state,
        };
        reason
    }

    /// The NOP-sled verdict is only meaningful once a representative share of the budget ran.
    fn check_nop_sled(&mut self) {
        if self.counters.instructions == 0 || self.counters.instructions * 2 < self.max_instructions {
            return;
        }
        if self.counters.nops * 100 >= self.counters.instructions * self.nop_threshold {
            self.detect(Detection::NOP_SLED);
        }
    }

    fn detect(&mut self, d: Detection) {
        if !self.detections.contains(d) {
            debug!("detection raised: {:?}", d);
        }
        self.detections |= d;
    }

    // -------------------------------------------------------------------------------------

    fn shell_offset(&self, addr: u64) -> Option<usize> {
        if addr >= self.shell_base && addr - self.shell_base < self.shell.len() as u64 {
            Some((addr - self.shell_base) as usize)
        } else {
            None
        }
    }
    fn stack_offset(&self, addr: u64) -> Option<usize> {
        if addr >= self.stack_base && addr - self.stack_base < self.stack.len() as u64 {
            Some((addr - self.stack_base) as usize)
        } else {
            None
        }
    }
    /// Checks that `[addr, addr+size)` lies entirely inside the given region.
    fn range_within(offset: usize, size: usize, region_len: usize) -> bool {
        size <= region_len - offset
    }

    /// Loads `size` bytes from the linear address, routing by region.
    pub(crate) fn mem_load_val(&mut self, gla: u64, size: usize) -> Result<Value, EmuError> {
        if size == 0 || size > VALUE_CAPACITY {
            return Err(EmuError::OperandTooLarge);
        }
        self.detect_mem_access(gla, size as u64);
        let mut val = Value::new(size);
        if let Some(off) = self.shell_offset(gla) {
            if Self::range_within(off, size, self.shell.len()) {
                val.bytes_mut().copy_from_slice(&self.shell[off..off + size]);
                return Ok(val);
            }
        }
        if let Some(off) = self.stack_offset(gla) {
            if Self::range_within(off, size, self.stack.len()) {
                val.bytes_mut().copy_from_slice(&self.stack[off..off + size]);
                if self.stack_bmp.any_saved_rip(off, size) {
                    self.rip_load = true;
                }
                return Ok(val);
            }
        }
        self.external_access(gla, val.bytes_mut(), MemAccess::Read)?;
        Ok(val)
    }

    /// Stores a value at the linear address, routing by region and maintaining the byte-state
    /// bitmaps.
    pub(crate) fn mem_store_val(&mut self, gla: u64, val: &Value) -> Result<(), EmuError> {
        let size = val.size();
        self.detect_mem_access(gla, size as u64);
        if let Some(off) = self.shell_offset(gla) {
            if Self::range_within(off, size, self.shell.len()) {
                self.shell_bmp.mark_dirty(off, size);
                if !self.options.contains(Options::BYPASS_SELF_WRITES) {
                    self.shell[off..off + size].copy_from_slice(val.bytes());
                }
                return Ok(());
            }
        }
        if let Some(off) = self.stack_offset(gla) {
            if Self::range_within(off, size, self.stack.len()) {
                // an overwritten byte no longer holds a saved return address
                self.stack_bmp.clear_saved_rip(off, size);
                self.stack[off..off + size].copy_from_slice(val.bytes());
                return Ok(());
            }
        }
        let mut buf = *val;
        self.external_access(gla, buf.bytes_mut(), MemAccess::Write)
    }

    fn external_access(&mut self, gla: u64, buf: &mut [u8], access: MemAccess) -> Result<(), EmuError> {
        self.counters.external_accesses += 1;
        if self.mem_threshold != 0 && self.counters.external_accesses > self.mem_threshold {
            return Err(EmuError::MemOutOfBounds);
        }
        match &mut self.mem_hook {
            Some(hook) => {
                if hook(gla, buf, access) {
                    Ok(())
                } else {
                    Err(EmuError::HostAccessFailed)
                }
            }
            None => Err(EmuError::MemOutOfBounds),
        }
    }

    /// Flags accesses to well-known OS structures: the TIB/PEB window through the
    /// mode-appropriate segment, the Wow64 thunk field, and the kernel-shared data page.
    fn detect_mem_access(&mut self, gla: u64, size: u64) {
        let end = gla.wrapping_add(size);
        let covers = |offset: u64| gla <= offset && offset < end;

        match self.mode {
            Mode::Bits32 | Mode::Bits16 => {
                let base = self.segs.fs.base;
                if base != 0 {
                    if covers(base.wrapping_add(detect::TEB_PEB_OFFSET_32)) {
                        self.detect(Detection::TIB_ACCESS);
                    }
                    if self.mode == Mode::Bits32 && covers(base.wrapping_add(detect::TEB_WOW64_OFFSET)) {
                        self.detect(Detection::WOW64_ACCESS);
                    }
                }
            }
            Mode::Bits64 => {
                let base = self.segs.gs.base;
                if base != 0 && covers(base.wrapping_add(detect::TEB_PEB_OFFSET_64)) {
                    self.detect(Detection::TIB_ACCESS);
                }
            }
        }

        if gla < detect::SHARED_USER_DATA + detect::SHARED_USER_DATA_SIZE && end > detect::SHARED_USER_DATA {
            self.detect(Detection::SUD_ACCESS);
        }
    }

    /// Flags a pointer-sized value that lands in the stack and points at a printable run.
    fn check_stack_str(&mut self, ptr: u64) {
        if let Some(off) = self.stack_offset(ptr) {
            if detect::printable_run_len(&self.stack[off..]) >= self.str_threshold {
                self.detect(Detection::STACK_STR);
            }
        }
    }

    /// Flags a stack-pointer exchange that pivots into attacker-reachable memory.
    fn check_stack_pivot(&mut self, v: u64) {
        let width = self.mode.addr_size() as u64;
        if v % width != 0 {
            return;
        }
        let pivoted = match (self.shell_offset(v), self.stack_offset(v)) {
            (Some(off), _) => (self.shell.len() - off) as u64 >= PIVOT_MIN_BYTES,
            (_, Some(off)) => (self.stack.len() - off) as u64 >= PIVOT_MIN_BYTES,
            _ => false,
        };
        if pivoted {
            self.detect(Detection::STACK_PIVOT);
        }
    }

    // -------------------------------------------------------------------------------------

    /// Computes a memory operand's effective address: base + index*scale + displacement
    /// (RIP-relative forms arrive pre-folded from the decoder), truncated to the effective
    /// address width. No segment base is applied.
    fn compute_ea(&self, ins: &Instruction) -> Result<u64, EmuError> {
        let base_reg = ins.memory_base();
        let idx_reg = ins.memory_index();

        let mut addr = ins.memory_displacement64();
        let width;
        if matches!(base_reg, Register::RIP | Register::EIP) {
            // the decoder already folded the next instruction pointer into the displacement
            width = 8;
        } else {
            if base_reg != Register::None {
                addr = addr.wrapping_add(self.cpu.regs[gpr_index(base_reg)?].raw_get(base_reg.size()));
            }
            if idx_reg != Register::None {
                if !idx_reg.is_gpr() {
                    return Err(EmuError::UnsupportedAddressing); // vector-indexed forms
                }
                let scaled = self.cpu.regs[gpr_index(idx_reg)?]
                    .raw_get(idx_reg.size())
                    .wrapping_mul(ins.memory_index_scale() as u64);
                addr = addr.wrapping_add(scaled);
            }
            width = if base_reg != Register::None {
                base_reg.size()
            } else if idx_reg != Register::None {
                idx_reg.size()
            } else {
                self.mode.addr_size()
            };
        }
        Ok(truncate(addr, width))
    }

    /// Computes the full linear address of a memory operand: the effective address combined
    /// with the segment base, re-truncated outside 64-bit mode.
    fn compute_gla(&self, ins: &Instruction) -> Result<u64, EmuError> {
        let ea = self.compute_ea(ins)?;
        let seg_base = match self.mode {
            Mode::Bits64 => match ins.memory_segment() {
                Register::FS => self.segs.fs.base,
                Register::GS => self.segs.gs.base,
                _ => 0,
            },
            _ => self.segs.get(ins.memory_segment()).map(|s| s.base).unwrap_or(0),
        };
        let mut gla = ea.wrapping_add(seg_base);
        if self.mode != Mode::Bits64 {
            gla = truncate(gla, 4);
        }
        Ok(gla)
    }

    /// The declared size of an operand in bytes.
    fn op_size(&self, ins: &Instruction, op: u32) -> usize {
        match ins.op_kind(op) {
            OpKind::Register => ins.op_register(op).size(),
            OpKind::Memory => ins.memory_size().size(),
            OpKind::Immediate8 | OpKind::Immediate8_2nd => 1,
            OpKind::Immediate16 | OpKind::Immediate8to16 => 2,
            OpKind::Immediate32 | OpKind::Immediate8to32 => 4,
            OpKind::Immediate64 | OpKind::Immediate8to64 | OpKind::Immediate32to64 => 8,
            OpKind::NearBranch16 | OpKind::FarBranch16 => 2,
            OpKind::NearBranch32 | OpKind::FarBranch32 => 4,
            OpKind::NearBranch64 => 8,
            _ => 0,
        }
    }

    /// Reads an operand into a [`Value`].
    fn get_op(&mut self, ins: &Instruction, op: u32) -> Result<Value, EmuError> {
        match ins.op_kind(op) {
            OpKind::Register => self.read_register(ins.op_register(op)),
            OpKind::Memory => {
                let size = ins.memory_size().size();
                let gla = self.compute_gla(ins)?;
                self.mem_load_val(gla, size)
            }
            OpKind::Immediate8 => Ok(Value::from_u64(ins.immediate8() as u64, 1)),
            OpKind::Immediate8_2nd => Ok(Value::from_u64(ins.immediate8_2nd() as u64, 1)),
            OpKind::Immediate16 => Ok(Value::from_u64(ins.immediate16() as u64, 2)),
            OpKind::Immediate32 => Ok(Value::from_u64(ins.immediate32() as u64, 4)),
            OpKind::Immediate64 => Ok(Value::from_u64(ins.immediate64(), 8)),
            OpKind::Immediate8to16 => Ok(Value::from_u64(ins.immediate8to16() as u64, 2)),
            OpKind::Immediate8to32 => Ok(Value::from_u64(ins.immediate8to32() as u64, 4)),
            OpKind::Immediate8to64 => Ok(Value::from_u64(ins.immediate8to64() as u64, 8)),
            OpKind::Immediate32to64 => Ok(Value::from_u64(ins.immediate32to64() as u64, 8)),
            OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64 => {
                Ok(Value::from_u64(ins.near_branch_target(), self.mode.addr_size()))
            }
            OpKind::FarBranch16 => Ok(Value::from_u64(ins.far_branch16() as u64, 2)),
            OpKind::FarBranch32 => Ok(Value::from_u64(ins.far_branch32() as u64, 4)),
            _ => Err(EmuError::UnsupportedAddressing),
        }
    }
    fn get_op_u64(&mut self, ins: &Instruction, op: u32) -> Result<u64, EmuError> {
        self.get_op(ins, op).map(|v| v.as_u64())
    }

    /// Writes an operand from a [`Value`].
    fn set_op(&mut self, ins: &Instruction, op: u32, val: &Value) -> Result<(), EmuError> {
        match ins.op_kind(op) {
            OpKind::Register => self.write_register(ins.op_register(op), val),
            OpKind::Memory => {
                let gla = self.compute_gla(ins)?;
                if val.size() >= 4 {
                    self.check_stack_str(val.as_u64());
                }
                // a saved return address flowing into another memory location
                if self.rip_load {
                    self.detect(Detection::LOAD_RIP);
                }
                self.mem_store_val(gla, val)
            }
            _ => Err(EmuError::UnsupportedAddressing),
        }
    }
    fn set_op_u64(&mut self, ins: &Instruction, op: u32, v: u64) -> Result<(), EmuError> {
        let size = self.op_size(ins, op);
        if !matches!(size, 1 | 2 | 4 | 8) {
            return Err(EmuError::OperandTooLarge);
        }
        let val = Value::from_u64(truncate(v, size), size);
        self.set_op(ins, op, &val)
    }

    fn read_register(&mut self, reg: Register) -> Result<Value, EmuError> {
        if is_gpr_high(reg) {
            return Ok(Value::from_u64(self.cpu.regs[gpr_index(reg)?].get_x8h() as u64, 1));
        }
        if reg.is_gpr() {
            let size = reg.size();
            return Ok(Value::from_u64(self.cpu.regs[gpr_index(reg)?].raw_get(size), size));
        }
        if reg.is_segment_register() {
            let seg = self.segs.get(reg).ok_or(EmuError::UnsupportedRegister)?;
            return Ok(Value::from_u64(seg.selector as u64, 2));
        }
        if is_vec_reg(reg) {
            let size = reg.size();
            let slot = &self.vpu.regs[reg.number()];
            return Ok(Value::from_bytes(&slot.0[..size.min(64)]));
        }
        if let Some(i) = mmx_index(reg) {
            return Ok(Value::from_u64(self.vpu.mmx[i], 8));
        }
        if let Some(i) = cr_index(reg) {
            return Ok(Value::from_u64(self.cr[i], self.mode.addr_size()));
        }
        match reg {
            Register::RIP => Ok(Value::from_u64(self.rip, 8)),
            Register::EIP => Ok(Value::from_u64(self.rip & 0xffff_ffff, 4)),
            _ => Err(EmuError::UnsupportedRegister),
        }
    }

    fn write_register(&mut self, reg: Register, val: &Value) -> Result<(), EmuError> {
        if is_gpr_high(reg) {
            self.cpu.regs[gpr_index(reg)?].set_x8h(val.as_u64() as u8);
            return Ok(());
        }
        if reg.is_gpr() {
            let size = reg.size();
            let v = val.as_u64();
            self.cpu.regs[gpr_index(reg)?].raw_set(size, v);
            if size >= 4 {
                self.check_stack_str(truncate(v, size));
            }
            // a saved return address flowing into a plain register
            if self.rip_load {
                self.detect(Detection::LOAD_RIP);
            }
            return Ok(());
        }
        if reg.is_segment_register() {
            let sel = val.as_u64() as u16;
            // the modeled descriptor table is small; anything beyond it is a bad load
            if (sel >> 3) >= 32 {
                return Err(EmuError::InvalidSelector);
            }
            let seg = self.segs.get_mut(reg).ok_or(EmuError::UnsupportedRegister)?;
            seg.selector = sel;
            return Ok(());
        }
        if is_vec_reg(reg) {
            let size = reg.size().min(64);
            let slot = &mut self.vpu.regs[reg.number()];
            let n = val.size().min(size);
            slot.0 = [0; 64];
            slot.0[..n].copy_from_slice(&val.bytes()[..n]);
            return Ok(());
        }
        if let Some(i) = mmx_index(reg) {
            self.vpu.mmx[i] = val.as_u64();
            return Ok(());
        }
        if let Some(i) = cr_index(reg) {
            self.cr[i] = val.as_u64();
            return Ok(());
        }
        Err(EmuError::UnsupportedRegister)
    }

    /// Recomputes flags for a result unless the decoded form suppresses flag writes entirely.
    fn set_flags(&mut self, ins: &Instruction, dst: u64, src1: u64, src2: u64, size: usize, op: FlagsOp) {
        if ins.rflags_modified() == 0 {
            return;
        }
        flags::set_arith_flags(&mut self.flags, dst, src1, src2, size, op);
    }

    // -------------------------------------------------------------------------------------

    fn stack_width(&self) -> usize {
        self.mode.addr_size()
    }

    /// Pushes a value; push-class writes address `[rsp - size]` before the pointer moves.
    fn push_val(&mut self, val: &Value) -> Result<(), EmuError> {
        let width = self.stack_width();
        let rsp = self.cpu.regs[Cpu::RSP].raw_get(width);
        let pos = truncate(rsp.wrapping_sub(val.size() as u64), width);
        self.mem_store_val(self.segs.ss.base.wrapping_add(pos), val)?;
        self.cpu.regs[Cpu::RSP].raw_set(width, pos);
        Ok(())
    }
    /// Pops a value of the given size.
    fn pop_val(&mut self, size: usize) -> Result<Value, EmuError> {
        let width = self.stack_width();
        let rsp = self.cpu.regs[Cpu::RSP].raw_get(width);
        let v = self.mem_load_val(self.segs.ss.base.wrapping_add(rsp), size)?;
        self.cpu.regs[Cpu::RSP].raw_set(width, rsp.wrapping_add(size as u64));
        Ok(v)
    }

    // -------------------------------------------------------------------------------------

    /// Dispatches one decoded instruction to its semantic handler.
    fn dispatch(&mut self, ins: &Instruction) -> Result<(), EmuError> {
        use iced_x86::Mnemonic::*;
        match ins.mnemonic() {
            Nop | Pause | Endbr32 | Endbr64 => Ok(()),

            // data movement (the SIMD mov variants share the generic copy path)
            Mov | Movd | Movq | Movdqa | Movdqu | Movaps | Movups | Vmovdqa | Vmovdqu => {
                self.exec_mov(ins)
            }
            Movzx => self.exec_movzx(ins),
            Movsx | Movsxd => self.exec_movsx(ins),
            Lea => self.exec_lea(ins),
            Xchg => self.exec_xchg(ins),
            Xadd => self.exec_xadd(ins),
            Cmpxchg => self.exec_cmpxchg(ins),
            Bswap => self.exec_bswap(ins),
            Cmova | Cmovae | Cmovb | Cmovbe | Cmove | Cmovg | Cmovge | Cmovl | Cmovle | Cmovne
            | Cmovno | Cmovnp | Cmovns | Cmovo | Cmovp | Cmovs => self.exec_cmovcc(ins),
            Seta | Setae | Setb | Setbe | Sete | Setg | Setge | Setl | Setle | Setne | Setno
            | Setnp | Setns | Seto | Setp | Sets => self.exec_setcc(ins),

            // stack
            Push => self.exec_push(ins),
            Pop => self.exec_pop(ins),
            Pusha | Pushad => self.exec_pusha(ins),
            Popa | Popad => self.exec_popa(ins),
            Pushf | Pushfd | Pushfq => self.exec_pushf(ins),
            Popf | Popfd | Popfq => self.exec_popf(ins),

            // arithmetic and logic
            Add | Adc | Sub | Sbb | Cmp => self.exec_arith(ins),
            Inc | Dec => self.exec_incdec(ins),
            Neg => self.exec_neg(ins),
            Not => self.exec_not(ins),
            And | Or | Xor | Test => self.exec_logic(ins),

            // shifts and rotates
            Shl | Shr | Sar => self.exec_shift(ins),
            Rol | Ror | Rcl | Rcr => self.exec_rotate(ins),
            Shld | Shrd => self.exec_shift_double(ins),

            // bit manipulation
            Bt | Bts | Btr | Btc => self.exec_bit_test(ins),
            Bsf | Bsr => self.exec_bit_scan(ins),
            Popcnt => self.exec_popcnt(ins),
            Lzcnt | Tzcnt => self.exec_count_zeros(ins),

            // accumulator widening
            Cbw | Cwde | Cdqe => self.exec_extend_acc(ins),
            Cwd | Cdq | Cqo => self.exec_extend_dx(ins),

            // control flow
            Jmp => self.exec_jmp(ins),
            Ja | Jae | Jb | Jbe | Je | Jg | Jge | Jl | Jle | Jne | Jno | Jnp | Jns | Jo | Jp
            | Js => self.exec_jcc(ins),
            Jcxz | Jecxz | Jrcxz => self.exec_jcxz(ins),
            Loop | Loope | Loopne => self.exec_loop(ins),
            Call => self.exec_call(ins),
            Ret => self.exec_ret(ins),
            Retf => self.exec_retf(ins),
            Int => self.exec_int(ins),
            Int3 | Int1 | Into => self.exec_breakpoint(),

            // flag and mode bits
            Cld => { self.flags.clear_df(); Ok(()) }
            Std => { self.flags.set_df(); Ok(()) }
            Clc => { self.flags.clear_cf(); Ok(()) }
            Stc => { self.flags.set_cf(); Ok(()) }
            Cmc => { self.flags.flip_cf(); Ok(()) }
            Cli => { self.flags.clear_if(); Ok(()) }
            Sti => { self.flags.set_if(); Ok(()) }
            Sahf => self.exec_sahf(),
            Lahf => self.exec_lahf(),
            Salc => {
                let v = if self.flags.get_cf() { 0xff } else { 0 };
                self.cpu.set_al(v);
                Ok(())
            }

            // string family; MOVSD/CMPSD clash with the SSE mnemonics of the same name
            Movsb | Movsw | Movsq | Stosb | Stosw | Stosd | Stosq | Lodsb | Lodsw | Lodsd
            | Lodsq | Scasb | Scasw | Scasd | Scasq | Cmpsb | Cmpsw | Cmpsq => self.exec_string(ins),
            Movsd | Cmpsd => {
                if ins.is_string_instruction() {
                    self.exec_string(ins)
                } else {
                    Err(EmuError::UnsupportedInstruction)
                }
            }

            // multiply/divide
            Mul => self.exec_mul(ins),
            Imul => self.exec_imul(ins),
            Div => self.exec_div(ins),
            Idiv => self.exec_idiv(ins),

            // SIMD subset
            Pxor | Xorps | Vpxor => self.exec_simd_xor(ins),
            Punpcklbw => self.exec_punpcklbw(ins),
            Vpbroadcastb | Vpbroadcastw | Vpbroadcastd | Vpbroadcastq => self.exec_broadcast(ins),

            // system and privileged probes
            Cpuid => self.exec_cpuid(),
            Rdtsc => self.exec_rdtsc(),
            Rdmsr => self.exec_rdmsr(),
            Wrmsr => self.exec_wrmsr(),
            Sidt => self.exec_sidt(ins),
            Swapgs => self.exec_swapgs(),
            Rdfsbase | Rdgsbase => self.exec_rdbase(ins),
            Syscall => self.exec_syscall(),
            Sysenter => self.exec_sysenter(),

            // I/O is rejected outright
            In | Out | Insb | Insw | Insd | Outsb | Outsw | Outsd => {
                Err(EmuError::UnsupportedInstruction)
            }

            _ => Err(EmuError::UnsupportedInstruction),
        }
    }

    // -------------------------------------------------------------------------------------

    fn exec_mov(&mut self, ins: &Instruction) -> Result<(), EmuError> {
        let v = self.get_op(ins, 1)?;
        self.set_op(ins, 0, &v)
    }
    fn exec_movzx(&mut self, ins: &Instruction) -> Result<(), EmuError> {
        let v = self.get_op(ins, 1)?;
        self.set_op_u64(ins, 0, v.as_u64())
    }
    fn exec_movsx(&mut self, ins: &Instruction) -> Result<(), EmuError> {
        let v = self.get_op(ins, 1)?;
        self.set_op_u64(ins, 0, v.as_i64() as u64)
    }
    fn exec_lea(&mut self, ins: &Instruction) -> Result<(), EmuError> {
        // address generation only: the effective address itself is the result
        let ea = self.compute_ea(ins)?;
        self.set_op_u64(ins, 0, ea)
    }
    fn exec_xchg(&mut self, ins: &Instruction) -> Result<(), EmuError> {
        let a = self.get_op(ins, 0)?;
        let b = self.get_op(ins, 1)?;
        self.set_op(ins, 0, &b)?;
        self.set_op(ins, 1, &a)?;

        // an exchange that redirects the stack pointer is the classic pivot gadget
        let rsp_full = |op: u32| {
            ins.op_kind(op) == OpKind::Register && ins.op_register(op).full_register() == Register::RSP
        };
        if rsp_full(0) {
            self.check_stack_pivot(b.as_u64());
        } else if rsp_full(1) {
            self.check_stack_pivot(a.as_u64());
        }
        Ok(())
    }
    fn exec_xadd(&mut self, ins: &Instruction) -> Result<(), EmuError> {
        let size = self.op_size(ins, 0);
        let a = self.get_op_u64(ins, 0)?;
        let b = self.get_op_u64(ins, 1)?;
        let res = truncate(a.wrapping_add(b), size);
        self.set_flags(ins, res, a, b, size, FlagsOp::Add);
        self.set_op_u64(ins, 1, a)?;
        self.set_op_u64(ins, 0, res)
    }
    fn exec_cmpxchg(&mut self, ins: &Instruction) -> Result<(), EmuError> {
        let size = self.op_size(ins, 0);
        let acc = self.cpu.regs[Cpu::RAX].raw_get(size);
        let dst = self.get_op_u64(ins, 0)?;
        let src = self.get_op_u64(ins, 1)?;
        let res = acc.wrapping_sub(dst);
        self.set_flags(ins, res, acc, dst, size, FlagsOp::Sub);
        if truncate(acc, size) == truncate(dst, size) {
            self.set_op_u64(ins, 0, src)
        } else {
            self.cpu.regs[Cpu::RAX].raw_set(size, dst);
            Ok(())
        }
    }
    fn exec_bswap(&mut self, ins: &Instruction) -> Result<(), EmuError> {
        let size = self.op_size(ins, 0);
        let v = self.get_op_u64(ins, 0)?;
        let res = match size {
            2 => (v as u16).swap_bytes() as u64,
            4 => (v as u32).swap_bytes() as u64,
            _ => v.swap_bytes(),
        };
        self.set_op_u64(ins, 0, res)
    }
    fn exec_cmovcc(&mut self, ins: &Instruction) -> Result<(), EmuError> {
        let v = self.get_op(ins, 1)?; // the load happens regardless of the condition
        if self.flags.eval_condition(ins.condition_code()) {
            self.set_op(ins, 0, &v)?;
        }
        Ok(())
    }
    fn exec_setcc(&mut self, ins: &Instruction) -> Result<(), EmuError> {
        let cnd = self.flags.eval_condition(ins.condition_code());
        self.set_op_u64(ins, 0, cnd as u64)
    }

    // -------------------------------------------------------------------------------------

    fn exec_push(&mut self, ins: &Instruction) -> Result<(), EmuError> {
        let v = self.get_op(ins, 0)?;
        // selectors occupy a full stack slot
        let v = if ins.op_kind(0) == OpKind::Register && ins.op_register(0).is_segment_register() {
            v.resized(self.stack_width())
        } else {
            v
        };
        self.push_val(&v)
    }
    fn exec_pop(&mut self, ins: &Instruction) -> Result<(), EmuError> {
        if ins.op_kind(0) == OpKind::Register && ins.op_register(0).is_segment_register() {
            let v = self.pop_val(self.stack_width())?;
            return self.write_register(ins.op_register(0), &v.resized(2));
        }
        let size = self.op_size(ins, 0);
        let v = self.pop_val(size)?;
        self.set_op(ins, 0, &v)
    }
    fn exec_pusha(&mut self, ins: &Instruction) -> Result<(), EmuError> {
        let size = if ins.mnemonic() == Mnemonic::Pushad { 4 } else { 2 };
        let orig_sp = self.cpu.regs[Cpu::RSP].raw_get(size);
        for &idx in &[Cpu::RAX, Cpu::RCX, Cpu::RDX, Cpu::RBX, Cpu::RSP, Cpu::RBP, Cpu::RSI, Cpu::RDI] {
            let v = if idx == Cpu::RSP { orig_sp } else { self.cpu.regs[idx].raw_get(size) };
            self.push_val(&Value::from_u64(v, size))?;
        }
        Ok(())
    }
    fn exec_popa(&mut self, ins: &Instruction) -> Result<(), EmuError> {
        let size = if ins.mnemonic() == Mnemonic::Popad { 4 } else { 2 };
        for &idx in &[Cpu::RDI, Cpu::RSI, Cpu::RBP, Cpu::RSP, Cpu::RBX, Cpu::RDX, Cpu::RCX, Cpu::RAX] {
            let v = self.pop_val(size)?;
            if idx != Cpu::RSP {
                // the stored SP image is discarded
                self.cpu.regs[idx].raw_set(size, v.as_u64());
            }
        }
        Ok(())
    }
    fn exec_pushf(&mut self, ins: &Instruction) -> Result<(), EmuError> {
        let size = match ins.mnemonic() {
            Mnemonic::Pushfq => 8,
            Mnemonic::Pushfd => 4,
            _ => 2,
        };
        let v = self.flags.0 & !mask!(Flags: MASK_RF | MASK_VM);
        self.push_val(&Value::from_u64(truncate(v, size), size))
    }
    fn exec_popf(&mut self, ins: &Instruction) -> Result<(), EmuError> {
        let size = match ins.mnemonic() {
            Mnemonic::Popfq => 8,
            Mnemonic::Popfd => 4,
            _ => 2,
        };
        let v = self.pop_val(size)?.as_u64();
        let writable = MODIFIABLE_FLAGS & truncate(!0u64, size);
        self.flags.0 = (v & writable) | (self.flags.0 & !writable) | 0x2;
        Ok(())
    }

    // -------------------------------------------------------------------------------------

    fn exec_arith(&mut self, ins: &Instruction) -> Result<(), EmuError> {
        let m = ins.mnemonic();
        let size = self.op_size(ins, 0);
        let a = truncate(self.get_op_u64(ins, 0)?, size);
        let b = truncate(self.get_op_u64(ins, 1)?, size);
        let bits = size as u32 * 8;
        let cin = if matches!(m, Mnemonic::Adc | Mnemonic::Sbb) { self.flags.get_cf() as u64 } else { 0 };

        let (res, carry, op) = match m {
            Mnemonic::Add | Mnemonic::Adc => {
                let full = a as u128 + b as u128 + cin as u128;
                (full as u64, full >> bits != 0, FlagsOp::Add)
            }
            _ => {
                let res = a.wrapping_sub(b).wrapping_sub(cin);
                (res, (b as u128 + cin as u128) > a as u128, FlagsOp::Sub)
            }
        };
        if ins.rflags_modified() != 0 {
            flags::set_arith_flags(&mut self.flags, res, a, b, size, op);
            self.flags.assign_cf(carry); // carry-in variants need the widened compare
        }
        if m == Mnemonic::Cmp {
            Ok(())
        } else {
            self.set_op_u64(ins, 0, res)
        }
    }
    fn exec_incdec(&mut self, ins: &Instruction) -> Result<(), EmuError> {
        let size = self.op_size(ins, 0);
        let v = self.get_op_u64(ins, 0)?;
        let (res, op) = if ins.mnemonic() == Mnemonic::Inc {
            (v.wrapping_add(1), FlagsOp::Add)
        } else {
            (v.wrapping_sub(1), FlagsOp::Sub)
        };
        // INC/DEC never touch the carry flag
        let cf = self.flags.get_cf();
        self.set_flags(ins, res, v, 1, size, op);
        self.flags.assign_cf(cf);
        self.set_op_u64(ins, 0, res)
    }
    fn exec_neg(&mut self, ins: &Instruction) -> Result<(), EmuError> {
        let size = self.op_size(ins, 0);
        let v = self.get_op_u64(ins, 0)?;
        let res = 0u64.wrapping_sub(truncate(v, size));
        self.set_flags(ins, res, 0, v, size, FlagsOp::Sub);
        self.set_op_u64(ins, 0, res)
    }
    fn exec_not(&mut self, ins: &Instruction) -> Result<(), EmuError> {
        let v = self.get_op_u64(ins, 0)?;
        self.set_op_u64(ins, 0, !v)
    }
    fn exec_logic(&mut self, ins: &Instruction) -> Result<(), EmuError> {
        let m = ins.mnemonic();
        let size = self.op_size(ins, 0);
        let a = self.get_op_u64(ins, 0)?;
        let b = self.get_op_u64(ins, 1)?;
        let res = match m {
            Mnemonic::And | Mnemonic::Test => a & b,
            Mnemonic::Or => a | b,
            _ => a ^ b,
        };
        self.set_flags(ins, res, a, b, size, FlagsOp::Logic);
        if m == Mnemonic::Test {
            Ok(())
        } else {
            self.set_op_u64(ins, 0, res)
        }
    }

    // -------------------------------------------------------------------------------------

    fn shift_count_mask(size: usize) -> u64 {
        if size == 8 { 0x3f } else { 0x1f }
    }

    fn exec_shift(&mut self, ins: &Instruction) -> Result<(), EmuError> {
        let size = self.op_size(ins, 0);
        let a = truncate(self.get_op_u64(ins, 0)?, size);
        let count = self.get_op_u64(ins, 1)? & Self::shift_count_mask(size);
        if count == 0 {
            return Ok(()); // flags and destination both stay put
        }
        let (res, op) = match ins.mnemonic() {
            Mnemonic::Shl => (a.wrapping_shl(count as u32), FlagsOp::Shl),
            Mnemonic::Shr => (a.wrapping_shr(count as u32), FlagsOp::Shr),
            _ => ((sign_extend(a, size) >> (count as u32).min(63)) as u64, FlagsOp::Sar),
        };
        self.set_flags(ins, res, a, count, size, op);
        self.set_op_u64(ins, 0, res)
    }

    fn exec_rotate(&mut self, ins: &Instruction) -> Result<(), EmuError> {
        let m = ins.mnemonic();
        let size = self.op_size(ins, 0);
        let bits = size as u32 * 8;
        let a = truncate(self.get_op_u64(ins, 0)?, size);
        let count = (self.get_op_u64(ins, 1)? & Self::shift_count_mask(size)) as u32;

        let (res, carry, overflow) = match m {
            Mnemonic::Rol => {
                let masked = count % bits;
                if masked == 0 && count == 0 {
                    return Ok(());
                }
                let res = match size {
                    1 => (a as u8).rotate_left(masked) as u64,
                    2 => (a as u16).rotate_left(masked) as u64,
                    4 => (a as u32).rotate_left(masked) as u64,
                    _ => a.rotate_left(masked),
                };
                let carry = res & 1 != 0;
                (res, carry, sign_bit(res, size) != carry)
            }
            Mnemonic::Ror => {
                let masked = count % bits;
                if masked == 0 && count == 0 {
                    return Ok(());
                }
                let res = match size {
                    1 => (a as u8).rotate_right(masked) as u64,
                    2 => (a as u16).rotate_right(masked) as u64,
                    4 => (a as u32).rotate_right(masked) as u64,
                    _ => a.rotate_right(masked),
                };
                (res, sign_bit(res, size), sign_bit(res ^ (res << 1), size))
            }
            Mnemonic::Rcl => {
                let masked = count % (bits + 1);
                if masked == 0 {
                    return Ok(());
                }
                let cf = self.flags.get_cf() as u64;
                let lower = if masked > 1 { a >> (bits + 1 - masked) } else { 0 };
                let upper = ((a << 1) | cf) << (masked - 1);
                let res = upper | lower;
                let carry = (a >> (bits - masked)) & 1 != 0;
                (res, carry, sign_bit(res, size) != carry)
            }
            _ => {
                let masked = count % (bits + 1);
                if masked == 0 {
                    return Ok(());
                }
                let cf = self.flags.get_cf() as u64;
                let lower = ((a >> 1) | (cf << (bits - 1))) >> (masked - 1);
                let upper = if masked > 1 { a << (bits + 1 - masked) } else { 0 };
                let res = upper | lower;
                let carry = (a >> (masked - 1)) & 1 != 0;
                (res, carry, sign_bit(res ^ (res << 1), size))
            }
        };

        if ins.rflags_modified() != 0 {
            self.flags.assign_cf(carry);
            if count == 1 {
                self.flags.assign_of(overflow);
            }
        }
        self.set_op_u64(ins, 0, res)
    }

    fn exec_shift_double(&mut self, ins: &Instruction) -> Result<(), EmuError> {
        let size = self.op_size(ins, 0);
        let bits = size as u32 * 8;
        let a = truncate(self.get_op_u64(ins, 0)?, size);
        let b = truncate(self.get_op_u64(ins, 1)?, size);
        let count = (self.get_op_u64(ins, 2)? & Self::shift_count_mask(size)) as u32;
        if count == 0 {
            return Ok(());
        }
        if count > bits {
            // architecturally undefined; leave the operand alone
            return Ok(());
        }
        let (res, op) = if ins.mnemonic() == Mnemonic::Shld {
            let filler = if count == bits { b } else { b >> (bits - count) };
            (a.wrapping_shl(count) | filler, FlagsOp::Shl)
        } else {
            let filler = if count == bits { b } else { b << (bits - count) };
            (a.wrapping_shr(count) | filler, FlagsOp::Shr)
        };
        self.set_flags(ins, res, a, count as u64, size, op);
        self.set_op_u64(ins, 0, res)
    }

    // -------------------------------------------------------------------------------------

    fn exec_bit_test(&mut self, ins: &Instruction) -> Result<(), EmuError> {
        let m = ins.mnemonic();
        let size = self.op_size(ins, 0);
        let bits = size as u64 * 8;
        let b = self.get_op_u64(ins, 1)?;

        let mutate = |v: u64, mask: u64| match m {
            Mnemonic::Bts => Some(v | mask),
            Mnemonic::Btr => Some(v & !mask),
            Mnemonic::Btc => Some(v ^ mask),
            _ => None,
        };

        if ins.op_kind(0) == OpKind::Memory && ins.op_kind(1) == OpKind::Register {
            // bit-base addressing: fold the signed bit offset into the byte address,
            // flooring for negative offsets
            let idx_size = ins.op_register(1).size();
            let bitoff = sign_extend(b, idx_size);
            let gla = self
                .compute_gla(ins)?
                .wrapping_add(bitoff.div_euclid(8) as u64);
            let bit = bitoff.rem_euclid(8) as u32;
            let cur = self.mem_load_val(gla, 1)?.as_u64();
            if ins.rflags_modified() != 0 {
                self.flags.assign_cf((cur >> bit) & 1 != 0);
            }
            if let Some(new) = mutate(cur, 1 << bit) {
                self.mem_store_val(gla, &Value::from_u64(new, 1))?;
            }
            Ok(())
        } else {
            let bit = (b % bits) as u32;
            let a = self.get_op_u64(ins, 0)?;
            if ins.rflags_modified() != 0 {
                self.flags.assign_cf((a >> bit) & 1 != 0);
            }
            match mutate(a, 1 << bit) {
                Some(new) => self.set_op_u64(ins, 0, new),
                None => Ok(()),
            }
        }
    }
    fn exec_bit_scan(&mut self, ins: &Instruction) -> Result<(), EmuError> {
        let size = self.op_size(ins, 0);
        let v = truncate(self.get_op_u64(ins, 1)?, size);
        if ins.rflags_modified() != 0 {
            self.flags.assign_zf(v == 0);
        }
        if v == 0 {
            return Ok(()); // destination is left unchanged
        }
        let res = if ins.mnemonic() == Mnemonic::Bsf {
            v.trailing_zeros() as u64
        } else {
            63 - v.leading_zeros() as u64
        };
        self.set_op_u64(ins, 0, res)
    }
    fn exec_popcnt(&mut self, ins: &Instruction) -> Result<(), EmuError> {
        let size = self.op_size(ins, 0);
        let v = truncate(self.get_op_u64(ins, 1)?, size);
        if ins.rflags_modified() != 0 {
            self.flags.0 &= !mask!(Flags: MASK_CF | MASK_PF | MASK_AF | MASK_ZF | MASK_SF | MASK_OF);
            self.flags.assign_zf(v == 0);
        }
        self.set_op_u64(ins, 0, v.count_ones() as u64)
    }
    fn exec_count_zeros(&mut self, ins: &Instruction) -> Result<(), EmuError> {
        let size = self.op_size(ins, 0);
        let bits = size as u32 * 8;
        let v = truncate(self.get_op_u64(ins, 1)?, size);
        let res = if v == 0 {
            bits as u64
        } else if ins.mnemonic() == Mnemonic::Lzcnt {
            (v.leading_zeros() - (64 - bits)) as u64
        } else {
            v.trailing_zeros() as u64
        };
        if ins.rflags_modified() != 0 {
            self.flags.assign_cf(v == 0);
            self.flags.assign_zf(res == 0);
        }
        self.set_op_u64(ins, 0, res)
    }

    fn exec_extend_acc(&mut self, ins: &Instruction) -> Result<(), EmuError> {
        match ins.mnemonic() {
            Mnemonic::Cbw => self.cpu.set_ax(self.cpu.get_al() as i8 as i16 as u16),
            Mnemonic::Cwde => self.cpu.set_eax(self.cpu.get_ax() as i16 as i32 as u32),
            _ => self.cpu.set_rax(self.cpu.get_eax() as i32 as i64 as u64),
        }
        Ok(())
    }
    fn exec_extend_dx(&mut self, ins: &Instruction) -> Result<(), EmuError> {
        match ins.mnemonic() {
            Mnemonic::Cwd => {
                let fill = if (self.cpu.get_ax() as i16) < 0 { !0 } else { 0 };
                self.cpu.set_dx(fill);
            }
            Mnemonic::Cdq => {
                let fill = if (self.cpu.get_eax() as i32) < 0 { !0 } else { 0 };
                self.cpu.set_edx(fill);
            }
            _ => {
                let fill = if (self.cpu.get_rax() as i64) < 0 { !0 } else { 0 };
                self.cpu.set_rdx(fill);
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------------------------

    /// Evaluates a loop-like branch: the tracker observes every outcome, taken or not.
    fn branch_to(&mut self, ins: &Instruction, target: u64, taken: bool) -> Result<(), EmuError> {
        self.tracker.observe(ins.ip(), target, taken);
        if taken {
            self.rip = target;
        }
        Ok(())
    }

    fn exec_jmp(&mut self, ins: &Instruction) -> Result<(), EmuError> {
        match ins.op_kind(0) {
            OpKind::FarBranch16 | OpKind::FarBranch32 => {
                self.far_branch(ins.far_branch_selector())
            }
            OpKind::Memory if is_far_pointer(ins.memory_size()) => self.far_branch_mem(ins),
            OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64 => {
                self.rip = ins.near_branch_target();
                Ok(())
            }
            _ => {
                let width = self.mode.addr_size();
                let v = self.get_op_u64(ins, 0)?;
                self.rip = truncate(v, width);
                Ok(())
            }
        }
    }
    fn exec_jcc(&mut self, ins: &Instruction) -> Result<(), EmuError> {
        let taken = self.flags.eval_condition(ins.condition_code());
        self.branch_to(ins, ins.near_branch_target(), taken)
    }
    fn exec_jcxz(&mut self, ins: &Instruction) -> Result<(), EmuError> {
        let count = match ins.mnemonic() {
            Mnemonic::Jcxz => self.cpu.get_cx() as u64,
            Mnemonic::Jecxz => self.cpu.get_ecx() as u64,
            _ => self.cpu.get_rcx(),
        };
        self.branch_to(ins, ins.near_branch_target(), count == 0)
    }
    fn exec_loop(&mut self, ins: &Instruction) -> Result<(), EmuError> {
        let width = self.mode.addr_size();
        let count = self.cpu.regs[Cpu::RCX].raw_get(width).wrapping_sub(1);
        self.cpu.regs[Cpu::RCX].raw_set(width, count);
        let cond = match ins.mnemonic() {
            Mnemonic::Loope => self.flags.get_zf(),
            Mnemonic::Loopne => !self.flags.get_zf(),
            _ => true,
        };
        self.branch_to(ins, ins.near_branch_target(), count != 0 && cond)
    }
    fn exec_call(&mut self, ins: &Instruction) -> Result<(), EmuError> {
        match ins.op_kind(0) {
            OpKind::FarBranch16 | OpKind::FarBranch32 => {
                return self.far_branch(ins.far_branch_selector())
            }
            OpKind::Memory if is_far_pointer(ins.memory_size()) => return self.far_branch_mem(ins),
            _ => {}
        }
        let width = self.mode.addr_size();
        let target = match ins.op_kind(0) {
            OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64 => {
                ins.near_branch_target()
            }
            _ => truncate(self.get_op_u64(ins, 0)?, width),
        };
        let ret = self.rip; // already advanced past the call
        self.push_val(&Value::from_u64(truncate(ret, width), width))?;

        // remember where the return address lives so later reads of it stand out
        let rsp = self.cpu.regs[Cpu::RSP].raw_get(width);
        if let Some(off) = self.stack_offset(self.segs.ss.base.wrapping_add(rsp)) {
            if Self::range_within(off, width, self.stack.len()) {
                self.stack_bmp.mark_saved_rip(off, width);
            }
        }
        self.rip = target;
        Ok(())
    }
    fn exec_ret(&mut self, ins: &Instruction) -> Result<(), EmuError> {
        let width = self.mode.addr_size();
        let v = self.pop_val(width)?;
        if ins.op_count() == 1 {
            // ret imm16 releases the callee-cleaned argument bytes
            let extra = ins.immediate16() as u64;
            let rsp = self.cpu.regs[Cpu::RSP].raw_get(width);
            self.cpu.regs[Cpu::RSP].raw_set(width, rsp.wrapping_add(extra));
        }
        self.rip = truncate(v.as_u64(), width);
        Ok(())
    }
    fn exec_retf(&mut self, _ins: &Instruction) -> Result<(), EmuError> {
        // a far return would switch code segments; record and stop instead
        self.pending_stop = Some(EmuError::CantContinue);
        Ok(())
    }

    fn far_branch(&mut self, selector: u16) -> Result<(), EmuError> {
        if self.mode == Mode::Bits32 && selector == detect::GATE64_CS {
            self.detect(Detection::HEAVENS_GATE);
        }
        // switching code segments is not modeled; stop once the flags are recorded
        self.pending_stop = Some(EmuError::CantContinue);
        Ok(())
    }
    fn far_branch_mem(&mut self, ins: &Instruction) -> Result<(), EmuError> {
        let gla = self.compute_gla(ins)?;
        let off_size = ins.memory_size().size().saturating_sub(2).max(2);
        let sel = self.mem_load_val(gla.wrapping_add(off_size as u64), 2)?.as_u64() as u16;
        self.far_branch(sel)
    }

    fn exec_int(&mut self, ins: &Instruction) -> Result<(), EmuError> {
        let vector = ins.immediate8();
        // the legacy syscall gates, with a plausible service number in the accumulator
        if matches!(vector, 0x2e | 0x80) && self.cpu.get_rax() < 0x1000 {
            self.detect(Detection::SYSCALL);
        }
        self.pending_stop = Some(EmuError::CantContinue);
        Ok(())
    }
    fn exec_breakpoint(&mut self) -> Result<(), EmuError> {
        self.pending_stop = Some(EmuError::CantContinue);
        Ok(())
    }
    fn exec_syscall(&mut self) -> Result<(), EmuError> {
        if self.cpu.get_rax() < 0x1000 {
            self.detect(Detection::SYSCALL);
        }
        if self.mode == Mode::Bits64 {
            // the architectural side effects are cheap to keep
            self.cpu.set_rcx(self.rip);
            self.cpu.set_r11(self.flags.0);
        }
        self.pending_stop = Some(EmuError::CantContinue);
        Ok(())
    }
    fn exec_sysenter(&mut self) -> Result<(), EmuError> {
        if self.cpu.get_rax() < 0x1000 {
            self.detect(Detection::SYSCALL);
        }
        self.pending_stop = Some(EmuError::CantContinue);
        Ok(())
    }

    // -------------------------------------------------------------------------------------

    fn exec_sahf(&mut self) -> Result<(), EmuError> {
        let ah = self.cpu.get_ah() as u64;
        self.flags.0 = (self.flags.0 & !0xff) | (ah & 0xd5) | 0x02;
        Ok(())
    }
    fn exec_lahf(&mut self) -> Result<(), EmuError> {
        self.cpu.set_ah(((self.flags.0 & 0xd5) | 0x02) as u8);
        Ok(())
    }

    // -------------------------------------------------------------------------------------

    fn exec_simd_xor(&mut self, ins: &Instruction) -> Result<(), EmuError> {
        let (src1, src2) = if ins.op_count() == 3 { (1, 2) } else { (0, 1) };
        let a = self.get_op(ins, src1)?;
        let b = self.get_op(ins, src2)?;
        let mut res = a;
        for (r, s) in res.bytes_mut().iter_mut().zip(b.bytes()) {
            *r ^= s;
        }
        self.set_op(ins, 0, &res)
    }
    fn exec_punpcklbw(&mut self, ins: &Instruction) -> Result<(), EmuError> {
        let a = self.get_op(ins, 0)?;
        let b = self.get_op(ins, 1)?;
        let size = a.size();
        let mut res = Value::new(size);
        for i in 0..size / 2 {
            res.set_u8(2 * i, a.get_u8(i));
            res.set_u8(2 * i + 1, b.get_u8(i));
        }
        self.set_op(ins, 0, &res)
    }
    fn exec_broadcast(&mut self, ins: &Instruction) -> Result<(), EmuError> {
        let elem = match ins.mnemonic() {
            Mnemonic::Vpbroadcastb => 1,
            Mnemonic::Vpbroadcastw => 2,
            Mnemonic::Vpbroadcastd => 4,
            _ => 8,
        };
        let src = self.get_op(ins, 1)?;
        let dst_size = self.op_size(ins, 0);
        let mut res = Value::new(dst_size);
        for chunk in res.bytes_mut().chunks_mut(elem) {
            chunk.copy_from_slice(&src.bytes()[..elem]);
        }
        self.set_op(ins, 0, &res)
    }

    // -------------------------------------------------------------------------------------

    fn exec_cpuid(&mut self) -> Result<(), EmuError> {
        match self.cpu.get_eax() {
            0 => {
                self.cpu.set_eax(0x16);
                self.cpu.set_ebx(0x756e_6547); // "Genu"
                self.cpu.set_edx(0x4965_6e69); // "ineI"
                self.cpu.set_ecx(0x6c65_746e); // "ntel"
            }
            1 => {
                self.cpu.set_eax(0x0003_06a9);
                self.cpu.set_ebx(0x0010_0800);
                self.cpu.set_ecx(0x7fba_e3bf);
                self.cpu.set_edx(0xbfeb_fbff);
            }
            _ => {
                self.cpu.set_eax(0);
                self.cpu.set_ebx(0);
                self.cpu.set_ecx(0);
                self.cpu.set_edx(0);
            }
        }
        Ok(())
    }
    fn exec_rdtsc(&mut self) -> Result<(), EmuError> {
        // monotonic, loosely tied to progress; real cycle counts are out of scope
        self.tsc = self.tsc.wrapping_add(self.counters.instructions.wrapping_mul(7)).wrapping_add(500);
        self.cpu.set_eax(self.tsc as u32);
        self.cpu.set_edx((self.tsc >> 32) as u32);
        Ok(())
    }
    fn exec_rdmsr(&mut self) -> Result<(), EmuError> {
        let msr = self.cpu.get_ecx();
        if detect::is_syscall_msr(msr) {
            self.detect(Detection::MSR_READ);
        }
        let v = self.msrs.get(&msr).copied().unwrap_or(0);
        self.cpu.set_eax(v as u32);
        self.cpu.set_edx((v >> 32) as u32);
        Ok(())
    }
    fn exec_wrmsr(&mut self) -> Result<(), EmuError> {
        let msr = self.cpu.get_ecx();
        if detect::is_syscall_msr(msr) {
            self.detect(Detection::MSR_WRITE);
        }
        let v = ((self.cpu.get_edx() as u64) << 32) | self.cpu.get_eax() as u64;
        self.msrs.insert(msr, v);
        Ok(())
    }
    fn exec_sidt(&mut self, ins: &Instruction) -> Result<(), EmuError> {
        if self.ring == 0 {
            self.detect(Detection::SIDT);
        }
        let gla = self.compute_gla(ins)?;
        let (base, size) = match self.mode {
            Mode::Bits64 => (IDT_BASE_64, 10),
            _ => (IDT_BASE_32, 6),
        };
        let mut image = Value::new(size);
        image.bytes_mut()[..2].copy_from_slice(&0xfffu16.to_le_bytes());
        image.bytes_mut()[2..].copy_from_slice(&base.to_le_bytes()[..size - 2]);
        self.mem_store_val(gla, &image)
    }
    fn exec_swapgs(&mut self) -> Result<(), EmuError> {
        // only reachable in ring 0; the privileged gate rejects it everywhere else
        self.detect(Detection::SWAPGS);
        self.pending_stop = Some(EmuError::CantContinue);
        Ok(())
    }
    fn exec_rdbase(&mut self, ins: &Instruction) -> Result<(), EmuError> {
        let base = if ins.mnemonic() == Mnemonic::Rdfsbase {
            self.segs.fs.base
        } else {
            self.segs.gs.base
        };
        self.set_op_u64(ins, 0, base)
    }
}

impl Default for Emulator {
    fn default() -> Self {
        Emulator::new()
    }
}

fn is_far_pointer(size: iced_x86::MemorySize) -> bool {
    use iced_x86::MemorySize::*;
    matches!(size, SegPtr16 | SegPtr32 | SegPtr64)
}
