//! Recovery of caller registers from call frame information.

use framewalk_cfi::{CfaRule, Column, UnwindRow};
use framewalk_common::MemoryAccess;

use crate::arch::Architecture;
use crate::decoder::truncate;
use crate::registers::Registers;

/// Computes the Canonical Frame Address of a row against the callee's registers.
///
/// Returns `None` if the CFA is defined by an expression or its base register is unknown.
pub fn compute_cfa<A>(arch: &A, row: &UnwindRow, registers: &Registers) -> Option<u64>
where
    A: Architecture + ?Sized,
{
    match row.cfa() {
        CfaRule::RegisterOffset { register, offset } => {
            let base = registers.get(arch.register_from_dwarf(register)?)?;
            let cfa = base.wrapping_add(offset as u64);
            Some(truncate(cfa, arch.pointer_size() as u8))
        }
        CfaRule::Expression | CfaRule::Undefined => None,
    }
}

/// Applies the recovery rules of a row to the callee's registers.
///
/// Registers without a rule keep their value only if they are callee-saved. The stack pointer of
/// the caller is the CFA. The result is `None` unless both the instruction pointer and the stack
/// pointer of the caller could be recovered.
pub fn apply_unwind_row<A>(
    arch: &A,
    row: &UnwindRow,
    registers: &Registers,
    memory: &dyn MemoryAccess,
) -> Option<Registers>
where
    A: Architecture + ?Sized,
{
    let cfa = compute_cfa(arch, row, registers)?;
    let size = arch.pointer_size();
    let at = |offset: i64| truncate(cfa.wrapping_add(offset as u64), size as u8);

    let mut caller = arch.copy_registers_preserving_callee_saved(registers);

    for (register, column) in row.columns() {
        let Some(reg) = arch.register_from_dwarf(register) else {
            continue;
        };

        match column {
            Column::Undefined => caller.invalidate(reg),
            Column::SameValue => caller.copy_from(reg, registers, reg),
            Column::Offset(offset) => match memory.read_pointer(at(offset), size) {
                Ok(value) => caller.set_from_memory(reg, value, at(offset)),
                Err(error) => {
                    tracing::debug!(%error, %reg, "failed to read saved register");
                    caller.invalidate(reg);
                }
            },
            Column::ValOffset(offset) => caller.set(reg, at(offset)),
            Column::Register(source) => match arch.register_from_dwarf(source) {
                Some(source) => caller.copy_from(reg, registers, source),
                None => caller.invalidate(reg),
            },
        }
    }

    caller.set(arch.stack_pointer(), cfa);

    // The CIE names the column holding the return address. On both supported architectures this
    // is the instruction pointer itself, but honor the declaration.
    let ip = arch.instruction_pointer();
    let return_address = row.return_address_register();
    if arch.register_to_dwarf(ip) != Some(return_address) {
        match arch.register_from_dwarf(return_address) {
            Some(reg) => {
                let recovered = caller.clone();
                caller.copy_from(ip, &recovered, reg);
            }
            None => caller.invalidate(ip),
        }
    }

    if !caller.is_valid(ip) {
        tracing::trace!("cfi row did not recover the instruction pointer");
        return None;
    }

    Some(caller)
}
