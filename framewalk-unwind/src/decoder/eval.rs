//! Evaluation of effective addresses against a register file.

use std::error::Error;
use std::fmt;

use thiserror::Error;

use framewalk_common::{MemoryAccess, MemoryError};

use super::{truncate, EffectiveAddress, Instruction};
use crate::arch::Architecture;
use crate::registers::Registers;

/// The error type for [`EvalError`].
#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EvalErrorKind {
    /// The instruction has no operand whose address could be computed.
    NoOperand,

    /// A register used by the operand is unknown in the register file.
    MissingRegister,

    /// The operand could not be read from memory.
    MemoryAccess,
}

impl fmt::Display for EvalErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoOperand => write!(f, "instruction has no operand"),
            Self::MissingRegister => write!(f, "operand register is unknown"),
            Self::MemoryAccess => write!(f, "failed to read operand"),
        }
    }
}

/// An error returned when an effective address cannot be evaluated.
#[derive(Debug, Error)]
#[error("{kind}")]
pub struct EvalError {
    kind: EvalErrorKind,
    #[source]
    source: Option<Box<dyn Error + Send + Sync + 'static>>,
}

impl EvalError {
    /// Creates a new evaluation error.
    pub fn new(kind: EvalErrorKind) -> Self {
        Self { kind, source: None }
    }

    /// Returns the corresponding [`EvalErrorKind`] for this error.
    pub fn kind(&self) -> EvalErrorKind {
        self.kind
    }
}

impl From<MemoryError> for EvalError {
    fn from(error: MemoryError) -> Self {
        Self {
            kind: EvalErrorKind::MemoryAccess,
            source: Some(Box::new(error)),
        }
    }
}

impl Instruction {
    /// Computes the address an operand refers to, without reading memory.
    ///
    /// For register-direct operands, this is the value of the register.
    pub fn operand_address<A>(&self, arch: &A, registers: &Registers) -> Result<u64, EvalError>
    where
        A: Architecture + ?Sized,
    {
        let ea = self
            .effective_address
            .ok_or_else(|| EvalError::new(EvalErrorKind::NoOperand))?;

        let register = |encoding: u8| {
            arch.register_from_jit(encoding)
                .and_then(|reg| registers.get(reg))
                .ok_or_else(|| EvalError::new(EvalErrorKind::MissingRegister))
        };

        let base = if ea.rip_relative {
            self.next_address()
                .ok_or_else(|| EvalError::new(EvalErrorKind::NoOperand))?
        } else {
            match ea.base {
                Some(encoding) => register(encoding)?,
                None => 0,
            }
        };

        let index = match ea.index {
            Some(encoding) => register(encoding)?.wrapping_shl(ea.scale.into()),
            None => 0,
        };

        let address = base
            .wrapping_add(index)
            .wrapping_add(ea.displacement as u64);

        Ok(truncate(address, ea.address_size))
    }

    /// Computes the value of the operand: the target of a branch, the value of a register, or
    /// the pointer read from memory for memory operands.
    pub fn evaluate<A, M>(
        &self,
        arch: &A,
        registers: &Registers,
        memory: &M,
    ) -> Result<u64, EvalError>
    where
        A: Architecture + ?Sized,
        M: MemoryAccess + ?Sized,
    {
        let address = self.operand_address(arch, registers)?;
        match self.effective_address {
            Some(EffectiveAddress {
                dereference: true, ..
            }) => Ok(memory.read_pointer(address, self.pointer_size().into())?),
            _ => Ok(address),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use similar_asserts::assert_eq;

    use framewalk_testutils::MockMemory;

    use crate::arch::amd64::{Amd64, R12, RAX, RBX};
    use crate::arch::i386::{I386, EBX, ESI};
    use crate::decoder::decode;

    #[test]
    fn test_register_direct() {
        // call *%rax
        let call = decode(&[0xff, 0xd0], 0x1000, true);
        let registers = Registers::new().with(RAX, 0x4000);

        let target = call.evaluate(&Amd64, &registers, &MockMemory::new()).unwrap();
        assert_eq!(target, 0x4000);
    }

    #[test]
    fn test_sib_with_rex() {
        // call *0x10(%rbx,%r12,8)
        let call = decode(&[0x42, 0xff, 0x54, 0xe3, 0x10], 0x1000, true);
        let registers = Registers::new().with(RBX, 0x8000).with(R12, 2);
        let memory = MockMemory::new().with_words(0x8020, 8, &[0x5555_1234]);

        assert_eq!(call.operand_address(&Amd64, &registers).unwrap(), 0x8020);
        assert_eq!(call.evaluate(&Amd64, &registers, &memory).unwrap(), 0x5555_1234);
    }

    #[test]
    fn test_rip_relative() {
        // jmp *0x2fe2(%rip)
        let jump = decode(&[0xff, 0x25, 0xe2, 0x2f, 0x00, 0x00], 0x1010, true);
        let memory = MockMemory::new().with_words(0x3ff8, 8, &[0x7f00_0000_1000]);

        let target = jump.evaluate(&Amd64, &Registers::new(), &memory).unwrap();
        assert_eq!(target, 0x7f00_0000_1000);
    }

    #[test]
    fn test_truncated_to_address_size() {
        // call *-0x10(%ebx,%esi,4)
        let call = decode(&[0xff, 0x54, 0xb3, 0xf0], 0x8048000, false);
        let registers = Registers::new().with(EBX, 0x8).with(ESI, 1);

        assert_eq!(
            call.operand_address(&I386, &registers).unwrap(),
            0xffff_fffc
        );
    }

    #[test]
    fn test_missing_register() {
        let call = decode(&[0xff, 0xd0], 0x1000, true);
        let error = call
            .evaluate(&Amd64, &Registers::new(), &MockMemory::new())
            .unwrap_err();
        assert_eq!(error.kind(), EvalErrorKind::MissingRegister);
    }

    #[test]
    fn test_memory_failure() {
        // call *(%rax)
        let call = decode(&[0xff, 0x10], 0x1000, true);
        let registers = Registers::new().with(RAX, 0xdead_0000);

        let error = call
            .evaluate(&Amd64, &registers, &MockMemory::new())
            .unwrap_err();
        assert_eq!(error.kind(), EvalErrorKind::MemoryAccess);
        assert!(error.source().is_some());
    }
}
