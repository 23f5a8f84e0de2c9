//! Per-architecture register tables and unwinding policy.
//!
//! Every supported instruction set has one [`Architecture`] implementation: [`I386`] and
//! [`Amd64`]. Select it with [`for_arch`] or, from the target an object file declares, with
//! [`for_target`].
//!
//! Registers have three numberings that must not be confused:
//!
//!  - framewalk's own [`Reg`] numbering indexes [`Registers`] and follows the Linux
//!    `user_regs_struct` layout.
//!  - The DWARF numbering is used by call frame information.
//!  - The JIT numbering is the hardware encoding found in ModRM, SIB and opcode register fields.
//!    Managed runtimes use it to describe registers in their code maps.

use std::fmt;

use framewalk_cfi::UnwindRow;
use framewalk_common::{Arch, MemoryAccess, UnknownArchError};

use crate::decoder::{self, Instruction};
use crate::registers::{Reg, Registers};
use crate::special::{self, SpecialFrame, SpecialUnwind};
use crate::trampoline::ResolvedSymbol;

pub mod amd64;
pub mod i386;
mod prologue;

pub use self::amd64::Amd64;
pub use self::i386::I386;

/// Static description of a single register.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RegisterInfo {
    /// The register in framewalk's numbering.
    pub reg: Reg,
    /// The name of the register without sigil, such as `"rip"`.
    pub name: &'static str,
    /// The size of the register in bytes.
    pub size: usize,
    /// The DWARF register number.
    pub dwarf: Option<u16>,
    /// The hardware encoding as used by JIT code generators.
    pub jit: Option<u8>,
}

/// An instruction set and the conventions for unwinding its stack frames.
///
/// Implementations only provide register tables. Everything else is derived from them and may be
/// overridden where an architecture needs special treatment.
pub trait Architecture: fmt::Debug + Send + Sync {
    /// The CPU architecture.
    fn arch(&self) -> Arch;

    /// All registers of a register file, in framewalk's numbering.
    fn register_table(&self) -> &'static [RegisterInfo];

    /// The registers worth displaying in a backtrace.
    fn important_registers(&self) -> &'static [Reg];

    /// The registers a callee must preserve according to the ABI, besides the stack pointer.
    fn callee_saved_registers(&self) -> &'static [Reg];

    /// The instruction pointer.
    fn instruction_pointer(&self) -> Reg;

    /// The stack pointer.
    fn stack_pointer(&self) -> Reg;

    /// The frame pointer.
    fn frame_pointer(&self) -> Reg;

    /// The BFD target name of object files for this architecture.
    fn target_name(&self) -> &'static str {
        self.arch().target_name().unwrap_or("unknown")
    }

    /// Whether instructions execute in 64-bit mode.
    fn is_64bit(&self) -> bool {
        self.arch().is_64bit()
    }

    /// The size of pointers, general purpose registers and stack slots.
    fn pointer_size(&self) -> usize {
        if self.is_64bit() {
            8
        } else {
            4
        }
    }

    /// All registers in framewalk's numbering.
    fn registers(&self) -> Vec<Reg> {
        self.register_table().iter().map(|info| info.reg).collect()
    }

    /// Returns the static description of a register.
    fn register_info(&self, reg: Reg) -> Option<&'static RegisterInfo> {
        self.register_table().iter().find(|info| info.reg == reg)
    }

    /// Returns the name of a register.
    fn register_name(&self, reg: Reg) -> Option<&'static str> {
        self.register_info(reg).map(|info| info.name)
    }

    /// Returns the size of a register in bytes.
    fn register_size(&self, reg: Reg) -> Option<usize> {
        self.register_info(reg).map(|info| info.size)
    }

    /// Looks up a register by name, with or without a leading `$` or `%`.
    fn register_by_name(&self, name: &str) -> Option<Reg> {
        let name = name.trim_start_matches(['$', '%']);
        self.register_table()
            .iter()
            .find(|info| info.name.eq_ignore_ascii_case(name))
            .map(|info| info.reg)
    }

    /// Maps a DWARF register number to framewalk's numbering.
    fn register_from_dwarf(&self, register: u16) -> Option<Reg> {
        self.register_table()
            .iter()
            .find(|info| info.dwarf == Some(register))
            .map(|info| info.reg)
    }

    /// Maps a register to its DWARF register number.
    fn register_to_dwarf(&self, reg: Reg) -> Option<u16> {
        self.register_info(reg).and_then(|info| info.dwarf)
    }

    /// Maps a hardware register encoding to framewalk's numbering.
    fn register_from_jit(&self, register: u8) -> Option<Reg> {
        self.register_table()
            .iter()
            .find(|info| info.jit == Some(register))
            .map(|info| info.reg)
    }

    /// Maps a register to its hardware encoding.
    fn register_to_jit(&self, reg: Reg) -> Option<u8> {
        self.register_info(reg).and_then(|info| info.jit)
    }

    /// Creates the register file of a caller in which only callee-saved registers are known.
    ///
    /// All other registers may have been clobbered by the callee and become invalid. The
    /// instruction and stack pointer must be filled in by the unwinding strategy.
    fn copy_registers_preserving_callee_saved(&self, registers: &Registers) -> Registers {
        let mut caller = Registers::new();
        for &reg in self.callee_saved_registers() {
            caller.copy_from(reg, registers, reg);
        }
        caller
    }

    /// Decodes the instruction at the start of `bytes`.
    fn decode(&self, bytes: &[u8], address: u64) -> Instruction {
        decoder::decode(bytes, address, self.is_64bit())
    }

    /// Recovers the caller's registers from a function's prologue.
    ///
    /// `code` holds the bytes of the function from its first instruction, and `offset` is the
    /// distance of the current instruction pointer from the function start. Recognized are the
    /// entry point itself, the instruction after `push %bp`, and any point after
    /// `push %bp; mov %sp,%bp`. In the last case, registers pushed right after establishing the
    /// frame are recovered as well.
    fn unwind_by_prologue_bytes(
        &self,
        registers: &Registers,
        code: &[u8],
        offset: u64,
        memory: &dyn MemoryAccess,
    ) -> Option<Registers> {
        prologue::unwind_by_prologue(self, registers, code, offset, memory)
    }

    /// Recovers the caller's registers through a matching entry of a special unwind table.
    fn try_special_unwind(
        &self,
        table: &[SpecialUnwind],
        registers: &Registers,
        symbol: Option<&ResolvedSymbol>,
        memory: &dyn MemoryAccess,
    ) -> Option<SpecialFrame> {
        special::try_special_unwind(self, table, registers, symbol, memory)
    }

    /// Recovers the caller's registers by applying a row of call frame information.
    fn unwind_cfi(
        &self,
        row: &UnwindRow,
        registers: &Registers,
        memory: &dyn MemoryAccess,
    ) -> Option<Registers> {
        crate::cfi::apply_unwind_row(self, row, registers, memory)
    }
}

/// Returns the architecture implementation for a CPU architecture.
pub fn for_arch(arch: Arch) -> Option<&'static dyn Architecture> {
    match arch {
        Arch::X86 => Some(&I386),
        Arch::Amd64 => Some(&Amd64),
        _ => None,
    }
}

/// Returns the architecture implementation for a target declared by an object file, such as
/// `"elf64-x86-64"`.
///
/// ```
/// use framewalk_common::Arch;
/// use framewalk_unwind::arch;
///
/// let amd64 = arch::for_target("elf64-x86-64").unwrap();
/// assert_eq!(amd64.arch(), Arch::Amd64);
/// assert!(arch::for_target("elf32-littlearm").is_err());
/// ```
pub fn for_target(target: &str) -> Result<&'static dyn Architecture, UnknownArchError> {
    let arch = Arch::from_target_name(target)?;
    for_arch(arch).ok_or(UnknownArchError)
}
