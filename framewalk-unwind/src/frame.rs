use std::fmt;

use crate::registers::Registers;
use crate::trampoline::ResolvedSymbol;

/// The strategy that recovered a stack frame.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum UnwindMethod {
    /// The innermost frame, taken from the thread's register context.
    Context,
    /// A fingerprinted piece of assembly from the special unwind table.
    Special,
    /// Call frame information from `.debug_frame`.
    DebugFrame,
    /// Call frame information from `.eh_frame`.
    EhFrame,
    /// The prologue of the callee.
    Prologue,
    /// The chain of saved frame pointers.
    FramePointer,
}

impl UnwindMethod {
    /// Returns the name of this method.
    pub fn name(self) -> &'static str {
        match self {
            Self::Context => "context",
            Self::Special => "special",
            Self::DebugFrame => "debug_frame",
            Self::EhFrame => "eh_frame",
            Self::Prologue => "prologue",
            Self::FramePointer => "frame pointer",
        }
    }
}

impl fmt::Display for UnwindMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A frame of a backtrace.
///
/// Frames are produced by a [`FrameBuilder`](crate::FrameBuilder) and never change afterwards.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StackFrame {
    pub(crate) level: usize,
    pub(crate) pc: u64,
    pub(crate) stack_pointer: u64,
    pub(crate) frame_pointer: Option<u64>,
    pub(crate) registers: Registers,
    pub(crate) thread: Option<u64>,
    pub(crate) symbol: Option<ResolvedSymbol>,
    pub(crate) method: UnwindMethod,
    pub(crate) call_site: Option<u64>,
    pub(crate) signal_frame: bool,
}

impl StackFrame {
    /// The distance from the innermost frame, which is level `0`.
    pub fn level(&self) -> usize {
        self.level
    }

    /// The instruction pointer.
    ///
    /// For caller frames, this is the return address.
    pub fn pc(&self) -> u64 {
        self.pc
    }

    /// The stack pointer.
    pub fn stack_pointer(&self) -> u64 {
        self.stack_pointer
    }

    /// The frame pointer, if it is known.
    pub fn frame_pointer(&self) -> Option<u64> {
        self.frame_pointer
    }

    /// The register file of this frame.
    pub fn registers(&self) -> &Registers {
        &self.registers
    }

    /// The thread this frame belongs to.
    pub fn thread(&self) -> Option<u64> {
        self.thread
    }

    /// The function executing in this frame.
    pub fn symbol(&self) -> Option<&ResolvedSymbol> {
        self.symbol.as_ref()
    }

    /// The strategy that recovered this frame.
    pub fn method(&self) -> UnwindMethod {
        self.method
    }

    /// The address of the call instruction that created the next inner frame.
    ///
    /// This is only set if the instruction could be identified right before the return address.
    pub fn call_site(&self) -> Option<u64> {
        self.call_site
    }

    /// Whether execution was interrupted by a signal rather than making a call.
    pub fn is_signal_frame(&self) -> bool {
        self.signal_frame
    }

    /// The address used to resolve symbols and call frame information of this frame.
    ///
    /// The return address of a caller frame may already belong to the next function if the call
    /// was the last instruction, so the call site or the byte before the return address is used
    /// instead. The innermost frame and interrupted frames use their instruction pointer.
    pub fn lookup_address(&self) -> u64 {
        if self.level == 0 || self.signal_frame {
            self.pc
        } else {
            self.call_site.unwrap_or_else(|| self.pc.wrapping_sub(1))
        }
    }
}

impl fmt::Display for StackFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} {:#x} in ", self.level, self.pc)?;
        match self.symbol {
            Some(ref symbol) => write!(f, "{symbol}"),
            None => f.write_str("??"),
        }
    }
}
