//! The x86-64 architecture.

use framewalk_common::Arch;

use super::{Architecture, RegisterInfo};
use crate::registers::Reg;

#[allow(missing_docs)]
mod regs {
    use super::Reg;

    pub const R15: Reg = Reg(0);
    pub const R14: Reg = Reg(1);
    pub const R13: Reg = Reg(2);
    pub const R12: Reg = Reg(3);
    pub const RBP: Reg = Reg(4);
    pub const RBX: Reg = Reg(5);
    pub const R11: Reg = Reg(6);
    pub const R10: Reg = Reg(7);
    pub const R9: Reg = Reg(8);
    pub const R8: Reg = Reg(9);
    pub const RAX: Reg = Reg(10);
    pub const RCX: Reg = Reg(11);
    pub const RDX: Reg = Reg(12);
    pub const RSI: Reg = Reg(13);
    pub const RDI: Reg = Reg(14);
    pub const ORIG_RAX: Reg = Reg(15);
    pub const RIP: Reg = Reg(16);
    pub const CS: Reg = Reg(17);
    pub const EFLAGS: Reg = Reg(18);
    pub const RSP: Reg = Reg(19);
    pub const SS: Reg = Reg(20);
    pub const FS_BASE: Reg = Reg(21);
    pub const GS_BASE: Reg = Reg(22);
    pub const DS: Reg = Reg(23);
    pub const ES: Reg = Reg(24);
    pub const FS: Reg = Reg(25);
    pub const GS: Reg = Reg(26);
}

pub use self::regs::*;

const fn gpr(reg: Reg, name: &'static str, dwarf: u16, jit: u8) -> RegisterInfo {
    RegisterInfo {
        reg,
        name,
        size: 8,
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

static REGISTERS: [RegisterInfo; 27] = [
    gpr(R15, "r15", 15, 15),
    gpr(R14, "r14", 14, 14),
    gpr(R13, "r13", 13, 13),
    gpr(R12, "r12", 12, 12),
    gpr(RBP, "rbp", 6, 5),
    gpr(RBX, "rbx", 3, 3),
    gpr(R11, "r11", 11, 11),
    gpr(R10, "r10", 10, 10),
    gpr(R9, "r9", 9, 9),
    gpr(R8, "r8", 8, 8),
    gpr(RAX, "rax", 0, 0),
    gpr(RCX, "rcx", 2, 1),
    gpr(RDX, "rdx", 1, 2),
    gpr(RSI, "rsi", 4, 6),
    gpr(RDI, "rdi", 5, 7),
    other(ORIG_RAX, "orig_rax", 8, None),
    gpr(RIP, "rip", 16, 16),
    other(CS, "cs", 2, Some(51)),
    other(EFLAGS, "eflags", 8, Some(49)),
    gpr(RSP, "rsp", 7, 4),
    other(SS, "ss", 2, Some(52)),
    other(FS_BASE, "fs_base", 8, Some(58)),
    other(GS_BASE, "gs_base", 8, Some(59)),
    other(DS, "ds", 2, Some(53)),
    other(ES, "es", 2, Some(50)),
    other(FS, "fs", 2, Some(54)),
    other(GS, "gs", 2, Some(55)),
];

static IMPORTANT: &[Reg] = &[
    RAX, RBX, RCX, RDX, RSI, RDI, RBP, RSP, R8, R9, R10, R11, R12, R13, R14, R15, RIP, EFLAGS,
];

static CALLEE_SAVED: &[Reg] = &[RBP, RBX, R12, R13, R14, R15];

/// The x86-64 architecture, `elf64-x86-64`.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Amd64;

impl Architecture for Amd64 {
    fn arch(&self) -> Arch {
        Arch::Amd64
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
        RIP
    }

    fn stack_pointer(&self) -> Reg {
        RSP
    }

    fn frame_pointer(&self) -> Reg {
        RBP
    }
}
