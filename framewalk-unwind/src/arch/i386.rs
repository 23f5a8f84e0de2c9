//! The 32-bit x86 architecture.

use framewalk_common::Arch;

use super::{Architecture, RegisterInfo};
use crate::registers::Reg;

#[allow(missing_docs)]
mod regs {
    use super::Reg;

    pub const EBX: Reg = Reg(0);
    pub const ECX: Reg = Reg(1);
    pub const EDX: Reg = Reg(2);
    pub const ESI: Reg = Reg(3);
    pub const EDI: Reg = Reg(4);
    pub const EBP: Reg = Reg(5);
    pub const EAX: Reg = Reg(6);
    pub const DS: Reg = Reg(7);
    pub const ES: Reg = Reg(8);
    pub const FS: Reg = Reg(9);
    pub const GS: Reg = Reg(10);
    pub const ORIG_EAX: Reg = Reg(11);
    pub const EIP: Reg = Reg(12);
    pub const CS: Reg = Reg(13);
    pub const EFLAGS: Reg = Reg(14);
    pub const ESP: Reg = Reg(15);
    pub const SS: Reg = Reg(16);
}

pub use self::regs::*;

const fn info(reg: Reg, name: &'static str, size: usize, dwarf: u16, jit: u8) -> RegisterInfo {
    RegisterInfo {
        reg,
        name,
        size,
        dwarf: Some(dwarf),
        jit: Some(jit),
    }
}

const fn other(reg: Reg, name: &'static str, size: usize, dwarf: Option<u16>) -> RegisterInfo {
    RegisterInfo {
        reg,
        name,
        size,
        dwarf,
        jit: None,
    }
}

static REGISTERS: [RegisterInfo; 17] = [
    info(EBX, "ebx", 4, 3, 3),
    info(ECX, "ecx", 4, 1, 1),
    info(EDX, "edx", 4, 2, 2),
    info(ESI, "esi", 4, 6, 6),
    info(EDI, "edi", 4, 7, 7),
    info(EBP, "ebp", 4, 5, 5),
    info(EAX, "eax", 4, 0, 0),
    other(DS, "ds", 2, Some(43)),
    other(ES, "es", 2, Some(40)),
    other(FS, "fs", 2, Some(44)),
    other(GS, "gs", 2, Some(45)),
    other(ORIG_EAX, "orig_eax", 4, None),
    info(EIP, "eip", 4, 8, 8),
    other(CS, "cs", 2, Some(41)),
    other(EFLAGS, "eflags", 4, Some(9)),
    info(ESP, "esp", 4, 4, 4),
    other(SS, "ss", 2, Some(42)),
];

static IMPORTANT: &[Reg] = &[EAX, ECX, EDX, EBX, ESP, EBP, ESI, EDI, EIP, EFLAGS];

static CALLEE_SAVED: &[Reg] = &[EBP, EBX, ESI, EDI];

/// The 32-bit x86 architecture, `elf32-i386`.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct I386;

impl Architecture for I386 {
    fn arch(&self) -> Arch {
        Arch::X86
    }

    fn register_table(&self) -> &'static [RegisterInfo] {
        &REGISTERS
    }

    fn important_registers(&self) -> &'static [Reg] {
        IMPORTANT
    }

    fn callee_saved_registers(&self) -> &'static [Reg] {
        CALLEE_SAVED
    }

    fn instruction_pointer(&self) -> Reg {
        EIP
    }

    fn stack_pointer(&self) -> Reg {
        ESP
    }

    fn frame_pointer(&self) -> Reg {
        EBP
    }
}
