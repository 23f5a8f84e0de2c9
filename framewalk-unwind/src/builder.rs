use std::fmt;

use framewalk_cfi::CfiSectionKind;
use framewalk_common::MemoryAccess;
use framewalk_debuginfo::SymbolTable;

use crate::arch::Architecture;
use crate::frame::{StackFrame, UnwindMethod};
use crate::registers::Registers;
use crate::special::{SpecialUnwind, BUILTIN_SPECIAL_UNWINDS};
use crate::trampoline::{ManagedRuntime, ResolvedSymbol};

/// The number of code bytes inspected for prologue analysis.
const PROLOGUE_WINDOW: usize = 64;

/// Lengths of call instructions, from the most to the least common encoding.
///
/// `call rel32` is 5 bytes long. Indirect calls through a register take 2 bytes, or 3 with REX or
/// an 8-bit displacement. `call *disp32(%rip)` and `call *disp32(%reg)` take 6, an additional SIB
/// byte makes 4 and 7.
const CALL_LENGTHS: [usize; 6] = [5, 2, 3, 6, 7, 4];

/// Options controlling how stack frames are recovered.
///
/// All strategies are enabled by default. Disabling strategies is mostly useful to diagnose
/// unwinding issues.
///
/// ```
/// use framewalk_unwind::UnwindOptions;
///
/// let options = UnwindOptions::new().prologue(false).max_frames(64);
/// assert!(options.is_cfi_enabled());
/// assert!(!options.is_prologue_enabled());
/// ```
#[derive(Clone, Copy, Debug)]
pub struct UnwindOptions {
    special: bool,
    cfi: bool,
    prologue: bool,
    frame_pointer: bool,
    adjust_call_site: bool,
    max_frames: usize,
    special_unwinds: &'static [SpecialUnwind],
}

impl UnwindOptions {
    /// Options with all strategies enabled.
    pub const fn new() -> Self {
        Self {
            special: true,
            cfi: true,
            prologue: true,
            frame_pointer: true,
            adjust_call_site: true,
            max_frames: 1024,
            special_unwinds: BUILTIN_SPECIAL_UNWINDS,
        }
    }

    /// Determines whether fingerprinted assembly is unwound through the special unwind table.
    pub const fn special(mut self, enable: bool) -> Self {
        self.special = enable;
        self
    }

    /// Determines whether call frame information is used.
    pub const fn cfi(mut self, enable: bool) -> Self {
        self.cfi = enable;
        self
    }

    /// Determines whether function prologues are analyzed.
    pub const fn prologue(mut self, enable: bool) -> Self {
        self.prologue = enable;
        self
    }

    /// Determines whether the chain of saved frame pointers is followed as a last resort.
    pub const fn frame_pointer(mut self, enable: bool) -> Self {
        self.frame_pointer = enable;
        self
    }

    /// Determines whether return addresses are backed up to the call instruction for lookups.
    pub const fn adjust_call_site(mut self, enable: bool) -> Self {
        self.adjust_call_site = enable;
        self
    }

    /// Limits the number of frames in a backtrace.
    pub const fn max_frames(mut self, max_frames: usize) -> Self {
        self.max_frames = max_frames;
        self
    }

    /// Replaces the special unwind table.
    ///
    /// To extend the built-in entries, include [`BUILTIN_SPECIAL_UNWINDS`] in the new table.
    pub const fn special_unwinds(mut self, table: &'static [SpecialUnwind]) -> Self {
        self.special_unwinds = table;
        self
    }

    /// Returns `true` if the special unwind table is consulted.
    pub const fn is_special_enabled(&self) -> bool {
        self.special
    }

    /// Returns `true` if call frame information is used.
    pub const fn is_cfi_enabled(&self) -> bool {
        self.cfi
    }

    /// Returns `true` if function prologues are analyzed.
    pub const fn is_prologue_enabled(&self) -> bool {
        self.prologue
    }

    /// Returns `true` if the frame pointer chain is followed.
    pub const fn is_frame_pointer_enabled(&self) -> bool {
        self.frame_pointer
    }

    /// The maximum number of frames in a backtrace.
    pub const fn get_max_frames(&self) -> usize {
        self.max_frames
    }
}

impl Default for UnwindOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// The caller's registers and how they were obtained.
struct Recovered {
    registers: Registers,
    method: UnwindMethod,
    signal_frame: bool,
}

/// Reconstructs the stack frames of a thread.
///
/// The builder combines an [`Architecture`], the modules loaded into the debuggee, and read
/// access to its memory. Starting from the register context of a thread, each
/// [`caller_frame`](Self::caller_frame) call recovers one more frame. To recover a caller, the
/// following strategies are tried in order until one succeeds:
///
///  1. The special unwind table for hand-written assembly.
///  2. Call frame information from `.debug_frame`, then from `.eh_frame`.
///  3. The prologue of the function, if its start is known.
///  4. The frame pointer chain.
///
/// If all strategies fail, the backtrace ends.
pub struct FrameBuilder<'a, 'data> {
    arch: &'static dyn Architecture,
    symbols: &'a SymbolTable<'data>,
    memory: &'a dyn MemoryAccess,
    runtime: Option<&'a dyn ManagedRuntime>,
    options: UnwindOptions,
    thread: Option<u64>,
}

impl<'a, 'data> FrameBuilder<'a, 'data> {
    /// Creates a frame builder with default options.
    pub fn new(
        arch: &'static dyn Architecture,
        symbols: &'a SymbolTable<'data>,
        memory: &'a dyn MemoryAccess,
    ) -> Self {
        Self {
            arch,
            symbols,
            memory,
            runtime: None,
            options: UnwindOptions::default(),
            thread: None,
        }
    }

    /// Resolves JIT-compiled code through a managed runtime.
    pub fn with_runtime(mut self, runtime: &'a dyn ManagedRuntime) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Sets the unwind options.
    pub fn with_options(mut self, options: UnwindOptions) -> Self {
        self.options = options;
        self
    }

    /// Records the thread that frames belong to.
    pub fn with_thread(mut self, thread: u64) -> Self {
        self.thread = Some(thread);
        self
    }

    /// The architecture of the debuggee.
    pub fn arch(&self) -> &'static dyn Architecture {
        self.arch
    }

    /// The unwind options.
    pub fn options(&self) -> &UnwindOptions {
        &self.options
    }

    /// Creates the innermost frame from the register context of a thread.
    ///
    /// Returns `None` if the instruction pointer or the stack pointer is unknown.
    pub fn context_frame(&self, registers: Registers) -> Option<StackFrame> {
        self.make_frame(0, registers, UnwindMethod::Context, false)
    }

    /// Recovers the frame of the function that called the given frame.
    pub fn caller_frame(&self, frame: &StackFrame) -> Option<StackFrame> {
        let recovered = self.recover(frame)?;
        tracing::trace!(
            level = frame.level() + 1,
            method = %recovered.method,
            "recovered caller frame"
        );

        self.make_frame(
            frame.level() + 1,
            recovered.registers,
            recovered.method,
            recovered.signal_frame,
        )
    }

    /// Iterates the frames of a thread, starting with its register context.
    pub fn backtrace(&self, registers: Registers) -> Backtrace<'_, 'a, 'data> {
        Backtrace {
            builder: self,
            next: self.context_frame(registers),
            count: 0,
        }
    }

    /// Resolves the function covering a code address.
    ///
    /// Native modules take precedence over the managed runtime.
    pub fn resolve_symbol(&self, address: u64) -> Option<ResolvedSymbol> {
        if let Some(lookup) = self.symbols.lookup(address) {
            return Some(lookup.into());
        }

        self.runtime?.lookup_symbol(address)
    }

    /// Finds the call instruction that ends right before a return address.
    ///
    /// Returns `None` if none of the common call encodings decodes to a call of exactly the
    /// expected length.
    pub fn find_call_site(&self, return_address: u64) -> Option<u64> {
        let mut buf = [0; 8];
        CALL_LENGTHS.iter().find_map(|&len| {
            let start = return_address.checked_sub(len as u64)?;
            let code = self.read_code(start, &mut buf[..len])?;
            if code.len() != len {
                return None;
            }

            let instruction = self.arch.decode(code, start);
            let is_match = instruction.kind().is_call() && instruction.length() == Some(len as u32);
            is_match.then_some(start)
        })
    }

    fn make_frame(
        &self,
        level: usize,
        registers: Registers,
        method: UnwindMethod,
        signal_frame: bool,
    ) -> Option<StackFrame> {
        let pc = registers.get(self.arch.instruction_pointer())?;
        let stack_pointer = registers.get(self.arch.stack_pointer())?;
        let frame_pointer = registers.get(self.arch.frame_pointer());

        let call_site = if level > 0 && !signal_frame && self.options.adjust_call_site {
            self.find_call_site(pc)
        } else {
            None
        };

        let mut frame = StackFrame {
            level,
            pc,
            stack_pointer,
            frame_pointer,
            registers,
            thread: self.thread,
            symbol: None,
            method,
            call_site,
            signal_frame,
        };

        frame.symbol = self.resolve_symbol(frame.lookup_address()).map(|mut symbol| {
            symbol.offset = pc.wrapping_sub(symbol.address);
            symbol
        });

        Some(frame)
    }

    fn recover(&self, frame: &StackFrame) -> Option<Recovered> {
        let options = &self.options;

        if options.special {
            if let Some(special) = self.arch.try_special_unwind(
                options.special_unwinds,
                frame.registers(),
                frame.symbol(),
                self.memory,
            ) {
                return Some(Recovered {
                    registers: special.registers,
                    method: UnwindMethod::Special,
                    signal_frame: special.signal_frame,
                });
            }
        }

        if options.cfi {
            if let Some(recovered) = self.unwind_cfi(frame) {
                return Some(recovered);
            }
        }

        if options.prologue {
            if let Some(registers) = self.unwind_prologue(frame) {
                return Some(Recovered {
                    registers,
                    method: UnwindMethod::Prologue,
                    signal_frame: false,
                });
            }
        }

        if options.frame_pointer {
            if let Some(registers) = self.unwind_frame_pointer(frame) {
                return Some(Recovered {
                    registers,
                    method: UnwindMethod::FramePointer,
                    signal_frame: false,
                });
            }
        }

        tracing::trace!(level = frame.level(), pc = frame.pc(), "no strategy recovered the caller");
        None
    }

    fn unwind_cfi(&self, frame: &StackFrame) -> Option<Recovered> {
        let address = frame.lookup_address();
        let module = self.symbols.find_module(address)?;

        for (kind, method) in [
            (CfiSectionKind::DebugFrame, UnwindMethod::DebugFrame),
            (CfiSectionKind::EhFrame, UnwindMethod::EhFrame),
        ] {
            let row = match module.unwind_row(kind, address) {
                Ok(Some(row)) => row,
                Ok(None) => continue,
                Err(error) => {
                    tracing::debug!(%error, module = module.name(), address, "invalid cfi");
                    continue;
                }
            };

            match self.arch.unwind_cfi(&row, frame.registers(), self.memory) {
                // A signal frame augmentation marks the caller as interrupted.
                Some(registers) => {
                    return Some(Recovered {
                        registers,
                        method,
                        signal_frame: row.is_signal_frame(),
                    })
                }
                None => tracing::trace!(section = %kind, address, "cfi row not applicable"),
            }
        }

        None
    }

    fn unwind_prologue(&self, frame: &StackFrame) -> Option<Registers> {
        let symbol = frame.symbol()?;
        let offset = frame.pc().checked_sub(symbol.address)?;

        let mut buf = [0; PROLOGUE_WINDOW];
        let code = self.read_code(symbol.address, &mut buf)?;

        self.arch
            .unwind_by_prologue_bytes(frame.registers(), code, offset, self.memory)
    }

    fn unwind_frame_pointer(&self, frame: &StackFrame) -> Option<Registers> {
        let arch = self.arch;
        let size = arch.pointer_size();
        let slot = size as u64;

        let bp = arch.frame_pointer();
        let frame_pointer = frame.frame_pointer()?;
        if frame_pointer < frame.stack_pointer() {
            return None;
        }

        let read = |address: u64| match self.memory.read_pointer(address, size) {
            Ok(value) => Some(value),
            Err(error) => {
                tracing::debug!(%error, "failed to follow frame pointer");
                None
            }
        };

        let saved_bp = read(frame_pointer)?;
        let return_address = read(frame_pointer.wrapping_add(slot))?;

        let mut caller = arch.copy_registers_preserving_callee_saved(frame.registers());
        caller.set_from_memory(bp, saved_bp, frame_pointer);
        caller.set_from_memory(
            arch.instruction_pointer(),
            return_address,
            frame_pointer.wrapping_add(slot),
        );
        caller.set(arch.stack_pointer(), frame_pointer.wrapping_add(2 * slot));
        Some(caller)
    }

    /// Reads code from the file of the covering module, or from memory otherwise.
    ///
    /// The result may be shorter than the buffer if the module's section ends earlier.
    fn read_code<'b>(&self, address: u64, buf: &'b mut [u8]) -> Option<&'b [u8]> {
        let file_bytes = self
            .symbols
            .find_module(address)
            .and_then(|module| module.code_bytes(address, buf.len()));

        if let Some(bytes) = file_bytes {
            let len = bytes.len();
            buf[..len].copy_from_slice(bytes);
            return Some(&buf[..len]);
        }

        match self.memory.read_bytes(address, buf) {
            Ok(()) => Some(&*buf),
            Err(error) => {
                tracing::trace!(%error, "code not readable");
                None
            }
        }
    }
}

impl fmt::Debug for FrameBuilder<'_, '_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameBuilder")
            .field("arch", &self.arch)
            .field("symbols", &self.symbols)
            .field("runtime", &self.runtime.is_some())
            .field("options", &self.options)
            .field("thread", &self.thread)
            .finish()
    }
}

/// An iterator over the frames of a thread.
///
/// Returned by [`FrameBuilder::backtrace`]. The iterator ends when no caller can be recovered,
/// after the maximum number of frames, at a zero return address, or when the stack pointer of a
/// caller does not lie above its callee's. The last check is skipped around interrupted frames,
/// whose stack may be anywhere.
pub struct Backtrace<'b, 'a, 'data> {
    builder: &'b FrameBuilder<'a, 'data>,
    next: Option<StackFrame>,
    count: usize,
}

impl Iterator for Backtrace<'_, '_, '_> {
    type Item = StackFrame;

    fn next(&mut self) -> Option<Self::Item> {
        let frame = self.next.take()?;
        if self.count >= self.builder.options.max_frames {
            return None;
        }
        self.count += 1;

        self.next = self.builder.caller_frame(&frame).filter(|caller| {
            if caller.pc() == 0 {
                return false;
            }

            let interrupted = caller.is_signal_frame() || frame.is_signal_frame();
            if !interrupted && caller.stack_pointer() <= frame.stack_pointer() {
                tracing::debug!(level = caller.level(), "stack pointer did not grow");
                return false;
            }

            true
        });

        Some(frame)
    }
}

impl fmt::Debug for Backtrace<'_, '_, '_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backtrace")
            .field("next", &self.next)
            .field("count", &self.count)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use similar_asserts::assert_eq;

    use framewalk_testutils::MockMemory;

    use crate::arch::amd64::{Amd64, RBP, RIP, RSP};

    static AMD64: Amd64 = Amd64;

    #[test]
    fn test_find_direct_call_site() {
        let memory = MockMemory::new().with_bytes(0x1000, &[0xe8, 0x1b, 0x00, 0x00, 0x00]);
        let symbols = SymbolTable::new();
        let builder = FrameBuilder::new(&AMD64, &symbols, &memory);

        assert_eq!(builder.find_call_site(0x1005), Some(0x1000));
    }

    #[test]
    fn test_find_indirect_call_site() {
        // Leading zeros decode as `add %al,(%rax)` and must not be mistaken for a call.
        let memory = MockMemory::new()
            .with_bytes(0x1ff0, &[0; 16])
            .with_bytes(0x2000, &[0xff, 0xd0]);
        let symbols = SymbolTable::new();
        let builder = FrameBuilder::new(&AMD64, &symbols, &memory);

        assert_eq!(builder.find_call_site(0x2002), Some(0x2000));
    }

    #[test]
    fn test_no_call_site() {
        let memory = MockMemory::new().with_bytes(0x3000, &[0x90; 16]);
        let symbols = SymbolTable::new();
        let builder = FrameBuilder::new(&AMD64, &symbols, &memory);

        assert_eq!(builder.find_call_site(0x3008), None);
    }

    #[test]
    fn test_frame_pointer_chain() {
        let memory = MockMemory::new()
            .with_words(0x7000, 8, &[0x7100, 0x40_1005])
            .with_words(0x7100, 8, &[0, 0])
            .with_bytes(0x40_1000, &[0xe8, 0x00, 0x00, 0x00, 0x00]);
        let symbols = SymbolTable::new();
        let builder = FrameBuilder::new(&AMD64, &symbols, &memory)
            .with_options(UnwindOptions::new().special(false).prologue(false));

        let registers = Registers::from_values([(RIP, 0x40_2000), (RSP, 0x6ff0), (RBP, 0x7000)]);
        let frames: Vec<_> = builder.backtrace(registers).collect();

        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].pc(), 0x40_1005);
        assert_eq!(frames[1].stack_pointer(), 0x7010);
        assert_eq!(frames[1].frame_pointer(), Some(0x7100));
        assert_eq!(frames[1].call_site(), Some(0x40_1000));
        assert_eq!(frames[1].lookup_address(), 0x40_1000);
        assert_eq!(frames[1].method(), UnwindMethod::FramePointer);
    }

    #[test]
    fn test_max_frames() {
        let memory = MockMemory::new()
            .with_words(0x7000, 8, &[0x7100, 0x40_1005])
            .with_words(0x7100, 8, &[0x7200, 0x40_1005]);
        let symbols = SymbolTable::new();
        let builder = FrameBuilder::new(&AMD64, &symbols, &memory)
            .with_options(UnwindOptions::new().max_frames(2));

        let registers = Registers::from_values([(RIP, 0x40_2000), (RSP, 0x6ff0), (RBP, 0x7000)]);
        assert_eq!(builder.backtrace(registers).count(), 2);
    }
}
