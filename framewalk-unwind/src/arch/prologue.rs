use framewalk_common::MemoryAccess;

use super::Architecture;
use crate::decoder::{self, FrameOp, InstructionKind, ENCODING_BP};
use crate::registers::Registers;

fn read_slot(memory: &dyn MemoryAccess, address: u64, size: usize) -> Option<u64> {
    match memory.read_pointer(address, size) {
        Ok(value) => Some(value),
        Err(error) => {
            tracing::debug!(%error, "failed to read stack slot of prologue");
            None
        }
    }
}

pub(crate) fn unwind_by_prologue<A>(
    arch: &A,
    registers: &Registers,
    code: &[u8],
    offset: u64,
    memory: &dyn MemoryAccess,
) -> Option<Registers>
where
    A: Architecture + ?Sized,
{
    let size = arch.pointer_size();
    let slot = size as u64;

    let ip = arch.instruction_pointer();
    let sp = arch.stack_pointer();
    let bp = arch.frame_pointer();

    let stack = registers.get(sp)?;
    let mut caller = arch.copy_registers_preserving_callee_saved(registers);

    // At the entry point, the return address is on top of the stack.
    if offset == 0 {
        let return_address = read_slot(memory, stack, size)?;
        caller.set_from_memory(ip, return_address, stack);
        caller.set(sp, stack.wrapping_add(slot));
        return Some(caller);
    }

    let mut instructions = decoder::decode_all(code, 0, arch.is_64bit());

    let push = instructions.next()?;
    if push.kind() != InstructionKind::Frame(FrameOp::Push(ENCODING_BP)) {
        return None;
    }
    let push_end = u64::from(push.length()?);

    // After `push %bp`, the caller's frame pointer is on top of the stack.
    if offset == push_end {
        let saved_bp = read_slot(memory, stack, size)?;
        let return_address = read_slot(memory, stack.wrapping_add(slot), size)?;
        caller.set_from_memory(bp, saved_bp, stack);
        caller.set_from_memory(ip, return_address, stack.wrapping_add(slot));
        caller.set(sp, stack.wrapping_add(2 * slot));
        return Some(caller);
    }

    let mov = instructions.next()?;
    if mov.kind() != InstructionKind::Frame(FrameOp::MovSpToBp) {
        return None;
    }
    let frame_end = push_end + u64::from(mov.length()?);
    if offset < frame_end {
        return None;
    }

    // The frame is established and the frame pointer anchors the caller's state.
    let frame = registers.get(bp)?;
    let saved_bp = read_slot(memory, frame, size)?;
    let return_address = read_slot(memory, frame.wrapping_add(slot), size)?;
    caller.set_from_memory(bp, saved_bp, frame);
    caller.set_from_memory(ip, return_address, frame.wrapping_add(slot));
    caller.set(sp, frame.wrapping_add(2 * slot));

    // Registers pushed right after the frame setup occupy the slots below the frame pointer.
    let mut end = frame_end;
    let mut address = frame;
    for instruction in instructions {
        let (Some(length), InstructionKind::Frame(FrameOp::Push(encoding))) =
            (instruction.length(), instruction.kind())
        else {
            break;
        };

        end += u64::from(length);
        if end > offset {
            break;
        }

        address = address.wrapping_sub(slot);
        if let Some(reg) = arch.register_from_jit(encoding) {
            // The callee's value was overwritten after the push and cannot stand in for it.
            match read_slot(memory, address, size) {
                Some(value) => caller.set_from_memory(reg, value, address),
                None => caller.invalidate(reg),
            }
        }
    }

    Some(caller)
}
