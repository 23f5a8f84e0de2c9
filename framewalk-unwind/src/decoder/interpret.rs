//! Simulation of control transfers and stack manipulating instructions.

use std::error::Error;
use std::fmt;

use thiserror::Error;

use framewalk_common::{MemoryError, MemoryWrite};

use super::{truncate, EvalError, EvalErrorKind, FrameOp, Instruction, InstructionKind};
use crate::arch::Architecture;
use crate::registers::{Reg, Registers};

/// The error type for [`InterpretError`].
#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InterpretErrorKind {
    /// The instruction cannot be simulated, such as a conditional jump.
    NotInterpretable,

    /// A register the instruction depends on is unknown.
    MissingRegister,

    /// Reading or writing the stack failed.
    MemoryAccess,
}

impl fmt::Display for InterpretErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotInterpretable => write!(f, "instruction cannot be interpreted"),
            Self::MissingRegister => write!(f, "required register is unknown"),
            Self::MemoryAccess => write!(f, "failed to access stack memory"),
        }
    }
}

/// An error returned when an instruction cannot be simulated.
#[derive(Debug, Error)]
#[error("{kind} at {address:#x}")]
pub struct InterpretError {
    kind: InterpretErrorKind,
    address: u64,
    #[source]
    source: Option<Box<dyn Error + Send + Sync + 'static>>,
}

impl InterpretError {
    fn new(kind: InterpretErrorKind, address: u64) -> Self {
        Self {
            kind,
            address,
            source: None,
        }
    }

    fn with_source<E>(kind: InterpretErrorKind, address: u64, source: E) -> Self
    where
        E: Into<Box<dyn Error + Send + Sync>>,
    {
        Self {
            kind,
            address,
            source: Some(source.into()),
        }
    }

    /// Returns the corresponding [`InterpretErrorKind`] for this error.
    pub fn kind(&self) -> InterpretErrorKind {
        self.kind
    }

    /// Returns the address of the instruction that failed to interpret.
    pub fn address(&self) -> u64 {
        self.address
    }
}

/// Register file and memory of a single simulation step.
struct Machine<'a, A: ?Sized, M: ?Sized> {
    arch: &'a A,
    registers: Registers,
    memory: &'a mut M,
    address: u64,
    width: u8,
}

impl<A, M> Machine<'_, A, M>
where
    A: Architecture + ?Sized,
    M: MemoryWrite + ?Sized,
{
    fn get(&self, reg: Reg) -> Result<u64, InterpretError> {
        self.registers
            .get(reg)
            .ok_or_else(|| InterpretError::new(InterpretErrorKind::MissingRegister, self.address))
    }

    fn hardware(&self, encoding: u8) -> Result<Reg, InterpretError> {
        self.arch
            .register_from_jit(encoding)
            .ok_or_else(|| InterpretError::new(InterpretErrorKind::MissingRegister, self.address))
    }

    fn evaluate(&self, instruction: &Instruction) -> Result<u64, InterpretError> {
        instruction
            .evaluate(self.arch, &self.registers, &*self.memory)
            .map_err(|e| eval_error(self.address, e))
    }

    fn memory_error(&self, error: MemoryError) -> InterpretError {
        InterpretError::with_source(InterpretErrorKind::MemoryAccess, self.address, error)
    }

    fn push(&mut self, value: u64) -> Result<(), InterpretError> {
        let sp = self.arch.stack_pointer();
        let top = truncate(self.get(sp)?.wrapping_sub(self.width.into()), self.width);
        self.memory
            .write_pointer(top, value, self.width.into())
            .map_err(|e| self.memory_error(e))?;
        self.registers.set(sp, top);
        Ok(())
    }

    /// Pops a value and returns it with the address it was read from.
    fn pop(&mut self) -> Result<(u64, u64), InterpretError> {
        let sp = self.arch.stack_pointer();
        let top = self.get(sp)?;
        let value = self
            .memory
            .read_pointer(top, self.width.into())
            .map_err(|e| self.memory_error(e))?;
        self.registers
            .set(sp, truncate(top.wrapping_add(self.width.into()), self.width));
        Ok((value, top))
    }

    fn adjust_sp(&mut self, delta: i64) -> Result<(), InterpretError> {
        let sp = self.arch.stack_pointer();
        let value = self.get(sp)?.wrapping_add(delta as u64);
        self.registers.set(sp, truncate(value, self.width));
        Ok(())
    }

    fn frame_op(&mut self, op: FrameOp) -> Result<(), InterpretError> {
        let sp = self.arch.stack_pointer();
        let bp = self.arch.frame_pointer();

        match op {
            FrameOp::Push(encoding) => {
                let value = self.get(self.hardware(encoding)?)?;
                self.push(value)?;
            }
            FrameOp::Pop(encoding) => {
                let reg = self.hardware(encoding)?;
                let (value, source) = self.pop()?;
                self.registers.set_from_memory(reg, value, source);
            }
            FrameOp::MovSpToBp => {
                let value = self.get(sp)?;
                self.registers.set(bp, value);
            }
            FrameOp::MovBpToSp => {
                let value = self.get(bp)?;
                self.registers.set(sp, value);
            }
            FrameOp::Leave => {
                let frame = self.get(bp)?;
                self.registers.set(sp, frame);
                let (value, source) = self.pop()?;
                self.registers.set_from_memory(bp, value, source);
            }
            FrameOp::Nop => {}
            FrameOp::SubSp(imm) => self.adjust_sp(imm.wrapping_neg())?,
            FrameOp::AddSp(imm) => self.adjust_sp(imm)?,
        }

        Ok(())
    }
}

/// Simulates the execution of a single instruction.
///
/// Calls push the return address and continue at the target, returns pop the return address and
/// release the immediate number of bytes, jumps continue at their target. Prologue and epilogue
/// instructions are executed and continue at the next instruction. Registers loaded from the
/// stack record the address they were read from.
///
/// The input register file is left untouched; the result is a new file. Conditional jumps and
/// any other instruction are rejected with [`InterpretErrorKind::NotInterpretable`].
pub fn interpret<A, M>(
    instruction: &Instruction,
    arch: &A,
    registers: &Registers,
    memory: &mut M,
) -> Result<Registers, InterpretError>
where
    A: Architecture + ?Sized,
    M: MemoryWrite + ?Sized,
{
    let address = instruction.address();
    if !instruction.is_interpretable() {
        return Err(InterpretError::new(
            InterpretErrorKind::NotInterpretable,
            address,
        ));
    }

    let next = instruction
        .next_address()
        .ok_or_else(|| InterpretError::new(InterpretErrorKind::NotInterpretable, address))?;

    let mut machine = Machine {
        arch,
        registers: registers.clone(),
        memory,
        address,
        width: instruction.pointer_size(),
    };

    let ip = arch.instruction_pointer();

    match instruction.kind() {
        InstructionKind::Call | InstructionKind::IndirectCall => {
            let target = machine.evaluate(instruction)?;
            machine.push(next)?;
            machine.registers.set(ip, target);
        }
        InstructionKind::Jump | InstructionKind::IndirectJump => {
            let target = machine.evaluate(instruction)?;
            machine.registers.set(ip, target);
        }
        InstructionKind::Return(release) => {
            let (target, source) = machine.pop()?;
            machine.adjust_sp(release.into())?;
            machine.registers.set_from_memory(ip, target, source);
        }
        InstructionKind::Frame(op) => {
            machine.frame_op(op)?;
            machine.registers.set(ip, next);
        }
        InstructionKind::ConditionalJump | InstructionKind::Other | InstructionKind::Unknown => {
            return Err(InterpretError::new(
                InterpretErrorKind::NotInterpretable,
                address,
            ));
        }
    }

    Ok(machine.registers)
}

fn eval_error(address: u64, error: EvalError) -> InterpretError {
    let kind = match error.kind() {
        EvalErrorKind::MissingRegister => InterpretErrorKind::MissingRegister,
        EvalErrorKind::MemoryAccess => InterpretErrorKind::MemoryAccess,
        _ => InterpretErrorKind::NotInterpretable,
    };
    InterpretError::with_source(kind, address, error)
}

#[cfg(test)]
mod tests {
    use super::*;

    use similar_asserts::assert_eq;

    use framewalk_common::MemoryAccess;
    use framewalk_testutils::MockMemory;

    use crate::arch::amd64::{Amd64, RBP, RBX, RIP, RSP};
    use crate::arch::i386::{I386, EBP, EIP, ESP};
    use crate::decoder::decode;

    const STACK: u64 = 0x7ffe_0000;

    fn stack() -> MockMemory {
        MockMemory::new().with_bytes(STACK - 0x40, &[0; 0x80])
    }

    #[test]
    fn test_call_and_return() {
        let mut memory = stack();
        let registers = Registers::new().with(RSP, STACK).with(RIP, 0x1000);

        let call = decode(&[0xe8, 0xfb, 0x00, 0x00, 0x00], 0x1000, true);
        let callee = interpret(&call, &Amd64, &registers, &mut memory).unwrap();

        assert_eq!(callee.get(RIP), Some(0x1100));
        assert_eq!(callee.get(RSP), Some(STACK - 8));
        assert_eq!(memory.read_u64(STACK - 8).unwrap(), 0x1005);

        let ret = decode(&[0xc3], 0x1100, true);
        let caller = interpret(&ret, &Amd64, &callee, &mut memory).unwrap();

        assert_eq!(caller.get(RIP), Some(0x1005));
        assert_eq!(caller.source(RIP), Some(STACK - 8));
        assert_eq!(caller.get(RSP), Some(STACK));
    }

    #[test]
    fn test_return_releases_arguments() {
        let mut memory = stack().with_words(STACK, 4, &[0x0804_8123]);
        let registers = Registers::new().with(ESP, STACK);

        // ret $0x8
        let ret = decode(&[0xc2, 0x08, 0x00], 0x0804_9000, false);
        let caller = interpret(&ret, &I386, &registers, &mut memory).unwrap();

        assert_eq!(caller.get(EIP), Some(0x0804_8123));
        assert_eq!(caller.get(ESP), Some(STACK + 12));
    }

    #[test]
    fn test_prologue_and_epilogue() {
        let mut memory = stack();
        let entry = Registers::new()
            .with(RSP, STACK)
            .with(RBP, 0x1234)
            .with(RBX, 0x5678);

        // push %rbp; mov %rsp,%rbp; push %rbx; sub $0x18,%rsp
        let prologue: &[&[u8]] = &[&[0x55], &[0x48, 0x89, 0xe5], &[0x53], &[0x48, 0x83, 0xec, 0x18]];
        let mut registers = entry.clone();
        let mut address = 0x2000;
        for bytes in prologue {
            let instruction = decode(bytes, address, true);
            registers = interpret(&instruction, &Amd64, &registers, &mut memory).unwrap();
            address = instruction.next_address().unwrap();
        }

        assert_eq!(registers.get(RBP), Some(STACK - 8));
        assert_eq!(registers.get(RSP), Some(STACK - 0x28));
        assert_eq!(registers.get(RIP), Some(0x2009));

        // add $0x18,%rsp; pop %rbx; leave
        let epilogue: &[&[u8]] = &[&[0x48, 0x83, 0xc4, 0x18], &[0x5b], &[0xc9]];
        for bytes in epilogue {
            let instruction = decode(bytes, address, true);
            registers = interpret(&instruction, &Amd64, &registers, &mut memory).unwrap();
            address = instruction.next_address().unwrap();
        }

        assert_eq!(registers.get(RSP), Some(STACK));
        assert_eq!(registers.get(RBP), Some(0x1234));
        assert_eq!(registers.source(RBP), Some(STACK - 8));
        assert_eq!(registers.get(RBX), Some(0x5678));
    }

    #[test]
    fn test_i386_frame_setup() {
        let mut memory = stack();
        let registers = Registers::new().with(ESP, STACK).with(EBP, 0xbeef);

        // push %ebp; mov %esp,%ebp
        let push = decode(&[0x55], 0x0804_8000, false);
        let registers = interpret(&push, &I386, &registers, &mut memory).unwrap();
        let mov = decode(&[0x89, 0xe5], 0x0804_8001, false);
        let registers = interpret(&mov, &I386, &registers, &mut memory).unwrap();

        assert_eq!(registers.get(EBP), Some(STACK - 4));
        assert_eq!(memory.read_u32(STACK - 4).unwrap(), 0xbeef);
        assert_eq!(registers.get(EIP), Some(0x0804_8003));
    }

    #[test]
    fn test_not_interpretable() {
        let mut memory = stack();
        let registers = Registers::new().with(RSP, STACK);

        // je +0x10
        let jump = decode(&[0x74, 0x10], 0x1000, true);
        let error = interpret(&jump, &Amd64, &registers, &mut memory).unwrap_err();
        assert_eq!(error.kind(), InterpretErrorKind::NotInterpretable);
        insta::assert_snapshot!(error.to_string(), @"instruction cannot be interpreted at 0x1000");

        // xor %eax,%eax
        let other = decode(&[0x31, 0xc0], 0x1000, true);
        assert!(interpret(&other, &Amd64, &registers, &mut memory).is_err());
    }

    #[test]
    fn test_push_to_unmapped_stack() {
        let mut memory = MockMemory::new();
        let registers = Registers::new().with(RSP, STACK).with(RBP, 1);

        let push = decode(&[0x55], 0x1000, true);
        let error = interpret(&push, &Amd64, &registers, &mut memory).unwrap_err();
        assert_eq!(error.kind(), InterpretErrorKind::MemoryAccess);
    }
}
