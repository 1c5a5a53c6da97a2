//! The string instruction family (MOVS/STOS/LODS/SCAS/CMPS) and its repeat prefixes.
//!
//! Repeated forms loop internally without re-entering the dispatcher, but every extra element
//! still spends one unit of the instruction budget, so a `rep stosb` over a huge count cannot
//! stall a run: the budget runs out mid-instruction and the next dispatch iteration completes
//! the run.

use iced_x86::Instruction;

use super::flags::FlagsOp;
use super::registers::Cpu;
use super::{EmuError, Emulator, Value};

/// Continuation condition applied between repeat iterations.
#[derive(Clone, Copy, PartialEq, Eq)]
enum RepCond {
    /// REP: repeat until the count register reaches zero.
    Always,
    /// REPE/REPZ: additionally stop once ZF clears.
    WhileZero,
    /// REPNE/REPNZ: additionally stop once ZF sets.
    WhileNotZero,
}

impl Emulator {
    /// Advances a string index register by the element size, honoring the direction flag and
    /// the effective address width.
    fn advance_index(&mut self, reg: usize, size: usize) {
        let addr_size = self.mode.addr_size();
        let step = size as u64;
        let cur = self.cpu.regs[reg].raw_get(addr_size);
        let next = if self.flags.get_df() { cur.wrapping_sub(step) } else { cur.wrapping_add(step) };
        self.cpu.regs[reg].raw_set(addr_size, next);
    }

    /// Linear address of the source element: the (possibly overridden) source segment plus SI.
    fn string_src_addr(&self, ins: &Instruction) -> u64 {
        let base = self.segs.get(ins.memory_segment()).map(|s| s.base).unwrap_or(0);
        let index = self.cpu.regs[Cpu::RSI].raw_get(self.mode.addr_size());
        base.wrapping_add(index)
    }
    /// Linear address of the destination element: always ES plus DI.
    fn string_dst_addr(&self) -> u64 {
        let index = self.cpu.regs[Cpu::RDI].raw_get(self.mode.addr_size());
        self.segs.es.base.wrapping_add(index)
    }

    fn string_movs(&mut self, ins: &Instruction, size: usize) -> Result<(), EmuError> {
        let v = self.mem_load_val(self.string_src_addr(ins), size)?;
        self.mem_store_val(self.string_dst_addr(), &v)?;
        self.advance_index(Cpu::RSI, size);
        self.advance_index(Cpu::RDI, size);
        Ok(())
    }
    fn string_stos(&mut self, _ins: &Instruction, size: usize) -> Result<(), EmuError> {
        let v = Value::from_u64(self.cpu.get_rax(), size);
        self.mem_store_val(self.string_dst_addr(), &v)?;
        self.advance_index(Cpu::RDI, size);
        Ok(())
    }
    fn string_lods(&mut self, ins: &Instruction, size: usize) -> Result<(), EmuError> {
        let v = self.mem_load_val(self.string_src_addr(ins), size)?;
        self.cpu.regs[Cpu::RAX].raw_set(size, v.as_u64());
        self.advance_index(Cpu::RSI, size);
        Ok(())
    }
    fn string_scas(&mut self, _ins: &Instruction, size: usize) -> Result<(), EmuError> {
        let acc = self.cpu.regs[Cpu::RAX].raw_get(size);
        let v = self.mem_load_val(self.string_dst_addr(), size)?.as_u64();
        let res = acc.wrapping_sub(v);
        super::flags::set_arith_flags(&mut self.flags, res, acc, v, size, FlagsOp::Sub);
        self.advance_index(Cpu::RDI, size);
        Ok(())
    }
    fn string_cmps(&mut self, ins: &Instruction, size: usize) -> Result<(), EmuError> {
        let a = self.mem_load_val(self.string_src_addr(ins), size)?.as_u64();
        let b = self.mem_load_val(self.string_dst_addr(), size)?.as_u64();
        let res = a.wrapping_sub(b);
        super::flags::set_arith_flags(&mut self.flags, res, a, b, size, FlagsOp::Sub);
        self.advance_index(Cpu::RSI, size);
        self.advance_index(Cpu::RDI, size);
        Ok(())
    }

    /// Runs one string instruction, repeating per its prefix.
    fn string_repeat(
        &mut self,
        ins: &Instruction,
        size: usize,
        unit: fn(&mut Self, &Instruction, usize) -> Result<(), EmuError>,
    ) -> Result<(), EmuError> {
        let cond = if ins.has_repne_prefix() {
            Some(RepCond::WhileNotZero)
        } else if ins.has_rep_prefix() {
            // F3 means plain REP for MOVS/STOS/LODS and REPE for SCAS/CMPS
            Some(match ins.mnemonic() {
                m if is_compare_string(m) => RepCond::WhileZero,
                _ => RepCond::Always,
            })
        } else {
            None
        };

        let cond = match cond {
            None => return unit(self, ins, size),
            Some(c) => c,
        };

        let addr_size = self.mode.addr_size();
        let mut first = true;
        loop {
            let count = self.cpu.regs[Cpu::RCX].raw_get(addr_size);
            if count == 0 {
                break;
            }
            if !first {
                // each extra element re-spends the instruction budget
                self.counters.instructions += 1;
            }
            first = false;

            unit(self, ins, size)?;
            self.cpu.regs[Cpu::RCX].raw_set(addr_size, count - 1);

            let go_on = match cond {
                RepCond::Always => true,
                RepCond::WhileZero => self.flags.get_zf(),
                RepCond::WhileNotZero => !self.flags.get_zf(),
            };
            // an exhausted budget ends the instruction mid-repeat, count register and all
            if !go_on || self.counters.instructions >= self.max_instructions {
                break;
            }
        }
        Ok(())
    }

    /// Dispatch entry for every string mnemonic; `size` is the element width in bytes.
    pub(super) fn exec_string(&mut self, ins: &Instruction) -> Result<(), EmuError> {
        use iced_x86::Mnemonic::*;
        let size = ins.memory_size().size();
        if size == 0 || size > 8 {
            return Err(EmuError::UnsupportedInstruction);
        }
        let unit = match ins.mnemonic() {
            Movsb | Movsw | Movsd | Movsq => Self::string_movs,
            Stosb | Stosw | Stosd | Stosq => Self::string_stos,
            Lodsb | Lodsw | Lodsd | Lodsq => Self::string_lods,
            Scasb | Scasw | Scasd | Scasq => Self::string_scas,
            Cmpsb | Cmpsw | Cmpsd | Cmpsq => Self::string_cmps,
            _ => return Err(EmuError::UnsupportedInstruction),
        };
        self.string_repeat(ins, size, unit)
    }
}

fn is_compare_string(m: iced_x86::Mnemonic) -> bool {
    use iced_x86::Mnemonic::*;
    matches!(m, Scasb | Scasw | Scasd | Scasq | Cmpsb | Cmpsw | Cmpsd | Cmpsq)
}
