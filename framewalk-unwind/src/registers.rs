//! Register files of a stack frame.

use std::fmt;

/// The number of register slots in a [`Registers`] file.
///
/// Large enough for the general purpose, segment and flags registers of both supported
/// architectures.
pub const MAX_REGISTERS: usize = 32;

/// A register number in framewalk's own numbering.
///
/// framewalk numbers registers in the order of the Linux `user_regs_struct` of the respective
/// architecture, so that a register file can be filled directly from `PTRACE_GETREGS` or from the
/// `NT_PRSTATUS` note of a core file. The constants for each architecture live in
/// [`arch::i386`](crate::arch::i386) and [`arch::amd64`](crate::arch::amd64).
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Reg(pub u8);

impl Reg {
    /// The index of this register's slot in a register file.
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// The value of a single register.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RegisterSlot {
    /// The value of the register. Meaningless unless `valid` is set.
    pub value: u64,
    /// Whether the value is known.
    pub valid: bool,
    /// The memory address the value was loaded from, if it was recovered from the stack.
    pub source: Option<u64>,
}

/// A snapshot of all registers of one stack frame.
///
/// Register files are plain values. The registers of a caller are derived by copying the
/// callee's file and modifying the copy; a file is never changed after it has been attached to a
/// [`StackFrame`](crate::StackFrame).
///
/// ```
/// use framewalk_unwind::Registers;
/// use framewalk_unwind::arch::amd64::{RBP, RSP};
///
/// let mut registers = Registers::new();
/// registers.set(RSP, 0x7ffc_0000);
/// registers.set_from_memory(RBP, 0x7ffc_0100, 0x7ffc_0000);
///
/// assert_eq!(registers.get(RSP), Some(0x7ffc_0000));
/// assert_eq!(registers.source(RBP), Some(0x7ffc_0000));
/// assert_eq!(registers.source(RSP), None);
/// ```
#[derive(Clone, Eq, PartialEq)]
pub struct Registers {
    slots: [RegisterSlot; MAX_REGISTERS],
}

impl Registers {
    /// Creates a register file with all registers invalid.
    pub fn new() -> Self {
        Self {
            slots: [RegisterSlot::default(); MAX_REGISTERS],
        }
    }

    /// Creates a register file from `(register, value)` pairs.
    pub fn from_values<I>(values: I) -> Self
    where
        I: IntoIterator<Item = (Reg, u64)>,
    {
        let mut registers = Self::new();
        for (reg, value) in values {
            registers.set(reg, value);
        }
        registers
    }

    /// Returns the slot of a register, whether valid or not.
    pub fn slot(&self, reg: Reg) -> Option<&RegisterSlot> {
        self.slots.get(reg.index())
    }

    /// Returns the value of a register if it is valid.
    pub fn get(&self, reg: Reg) -> Option<u64> {
        self.slot(reg).filter(|slot| slot.valid).map(|slot| slot.value)
    }

    /// Returns `true` if the register holds a known value.
    pub fn is_valid(&self, reg: Reg) -> bool {
        self.get(reg).is_some()
    }

    /// Returns the address a valid register was loaded from.
    pub fn source(&self, reg: Reg) -> Option<u64> {
        self.slot(reg)
            .filter(|slot| slot.valid)
            .and_then(|slot| slot.source)
    }

    /// Sets a register to a value that was not loaded from memory.
    ///
    /// Registers outside of the file are ignored.
    pub fn set(&mut self, reg: Reg, value: u64) {
        self.set_slot(reg, value, None);
    }

    /// Sets a register to a value loaded from `address`.
    pub fn set_from_memory(&mut self, reg: Reg, value: u64, address: u64) {
        self.set_slot(reg, value, Some(address));
    }

    /// Copies the slot of `from` in `other`, including its validity and source, into `reg`.
    pub fn copy_from(&mut self, reg: Reg, other: &Registers, from: Reg) {
        if let (Some(slot), Some(source)) = (self.slots.get_mut(reg.index()), other.slot(from)) {
            *slot = *source;
        }
    }

    /// Marks a register as unknown.
    pub fn invalidate(&mut self, reg: Reg) {
        if let Some(slot) = self.slots.get_mut(reg.index()) {
            *slot = RegisterSlot::default();
        }
    }

    /// Returns a copy of this file with `reg` set to `value`.
    pub fn with(mut self, reg: Reg, value: u64) -> Self {
        self.set(reg, value);
        self
    }

    /// Iterates all valid registers in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = (Reg, u64)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.valid)
            .map(|(index, slot)| (Reg(index as u8), slot.value))
    }

    fn set_slot(&mut self, reg: Reg, value: u64, source: Option<u64>) {
        if let Some(slot) = self.slots.get_mut(reg.index()) {
            *slot = RegisterSlot {
                value,
                valid: true,
                source,
            };
        }
    }
}

impl Default for Registers {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Registers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (reg, value) in self.iter() {
            map.entry(&reg.0, &format_args!("{value:#x}"));
        }
        map.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use similar_asserts::assert_eq;

    #[test]
    fn test_copy_then_mutate() {
        let callee = Registers::from_values([(Reg(4), 0x1000), (Reg(19), 0x2000)]);

        let mut caller = callee.clone();
        caller.set_from_memory(Reg(4), 0x3000, 0x2000);
        caller.invalidate(Reg(19));

        assert_eq!(callee.get(Reg(4)), Some(0x1000));
        assert_eq!(callee.get(Reg(19)), Some(0x2000));
        assert_eq!(caller.get(Reg(4)), Some(0x3000));
        assert_eq!(caller.source(Reg(4)), Some(0x2000));
        assert_eq!(caller.get(Reg(19)), None);
    }

    #[test]
    fn test_out_of_range() {
        let mut registers = Registers::new();
        registers.set(Reg(200), 1);

        assert_eq!(registers.get(Reg(200)), None);
        assert_eq!(registers.iter().count(), 0);
    }

    #[test]
    fn test_copy_slot() {
        let mut source = Registers::new();
        source.set_from_memory(Reg(1), 0xabcd, 0x7000);

        let mut target = Registers::new().with(Reg(2), 5);
        target.copy_from(Reg(2), &source, Reg(1));
        target.copy_from(Reg(3), &source, Reg(7));

        assert_eq!(target.get(Reg(2)), Some(0xabcd));
        assert_eq!(target.source(Reg(2)), Some(0x7000));
        assert!(!target.is_valid(Reg(3)));
    }
}
