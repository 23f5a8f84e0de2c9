//! Unwinding through hand-written assembly that has no call frame information.
//!
//! System call stubs, the i386 vsyscall page, some NPTL functions and the signal return
//! trampolines of the C library are written in assembly and either lack CFI or describe it with
//! expressions. They are recognized by a byte fingerprint and unwound with a fixed recipe.
//!
//! The built-in table is [`BUILTIN_SPECIAL_UNWINDS`]. Additional entries can be supplied through
//! [`UnwindOptions::special_unwinds`](crate::UnwindOptions::special_unwinds).

use framewalk_common::{Arch, MemoryAccess};

use crate::arch::{amd64, i386, Architecture};
use crate::registers::{Reg, Registers};
use crate::trampoline::ResolvedSymbol;

/// The address fingerprint offsets are relative to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Anchor {
    /// The instruction pointer of the frame.
    Pc,
    /// The start of the named function covering the instruction pointer.
    Symbol(&'static str),
}

/// The size of the local area of a function's frame.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FrameSize {
    /// A constant number of bytes.
    Fixed(u64),
    /// The 8-bit immediate of `sub $imm8,%sp` at the given offset from the anchor.
    ///
    /// Until the `sub` has executed, the recipe does not apply.
    Imm8At(u64),
}

/// How to recover the caller's registers once an entry matched.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Recipe {
    /// The registers are popped from consecutive stack slots, followed by the return address.
    StackReturn {
        /// The registers in the order they are popped.
        pops: &'static [Reg],
    },
    /// The function pushed registers at entry and then allocated a frame.
    SavedRegisters {
        /// The registers in the order they were pushed.
        pushed: &'static [Reg],
        /// The size of the frame allocated after the pushes.
        frame_size: FrameSize,
    },
    /// The kernel saved the complete register state of an interrupted context on the stack.
    SignalContext {
        /// The offset of the saved context from the stack pointer.
        context_offset: u64,
        /// The offsets of registers within the saved context.
        slots: &'static [(Reg, u64)],
    },
}

/// An entry of the special unwind table.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SpecialUnwind {
    /// A descriptive name for logging.
    pub name: &'static str,
    /// The architecture this entry applies to.
    pub arch: Arch,
    /// The address fingerprint offsets are relative to.
    pub anchor: Anchor,
    /// Bytes that must be found at the given offsets from the anchor.
    pub fingerprint: &'static [(i64, &'static [u8])],
    /// How to unwind a matching frame.
    pub recipe: Recipe,
}

/// The result of a matching special unwind entry.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SpecialFrame {
    /// The name of the matching entry.
    pub name: &'static str,
    /// The registers of the caller.
    pub registers: Registers,
    /// Whether the caller was interrupted rather than making a call.
    pub signal_frame: bool,
}

static I386_SIGCONTEXT: &[(Reg, u64)] = &[
    (i386::GS, 0),
    (i386::FS, 4),
    (i386::ES, 8),
    (i386::DS, 12),
    (i386::EDI, 16),
    (i386::ESI, 20),
    (i386::EBP, 24),
    (i386::ESP, 28),
    (i386::EBX, 32),
    (i386::EDX, 36),
    (i386::ECX, 40),
    (i386::EAX, 44),
    (i386::EIP, 56),
    (i386::CS, 60),
    (i386::EFLAGS, 64),
    (i386::SS, 72),
];

static AMD64_SIGCONTEXT: &[(Reg, u64)] = &[
    (amd64::R8, 0),
    (amd64::R9, 8),
    (amd64::R10, 16),
    (amd64::R11, 24),
    (amd64::R12, 32),
    (amd64::R13, 40),
    (amd64::R14, 48),
    (amd64::R15, 56),
    (amd64::RDI, 64),
    (amd64::RSI, 72),
    (amd64::RBP, 80),
    (amd64::RBX, 88),
    (amd64::RDX, 96),
    (amd64::RAX, 104),
    (amd64::RCX, 112),
    (amd64::RSP, 120),
    (amd64::RIP, 128),
    (amd64::EFLAGS, 136),
];

/// The built-in special unwind table.
pub static BUILTIN_SPECIAL_UNWINDS: &[SpecialUnwind] = &[
    // `__kernel_vsyscall` resumes after `sysenter` at `pop %ebp; pop %edx; pop %ecx; ret`.
    SpecialUnwind {
        name: "vsyscall",
        arch: Arch::X86,
        anchor: Anchor::Pc,
        fingerprint: &[(0, &[0x5d, 0x5a, 0x59, 0xc3])],
        recipe: Recipe::StackReturn {
            pops: &[i386::EBP, i386::EDX, i386::ECX],
        },
    },
    // `int $0x80; ret`
    SpecialUnwind {
        name: "int80",
        arch: Arch::X86,
        anchor: Anchor::Pc,
        fingerprint: &[(-2, &[0xcd, 0x80, 0xc3])],
        recipe: Recipe::StackReturn { pops: &[] },
    },
    // `syscall; ret`
    SpecialUnwind {
        name: "syscall",
        arch: Arch::Amd64,
        anchor: Anchor::Pc,
        fingerprint: &[(-2, &[0x0f, 0x05, 0xc3])],
        recipe: Recipe::StackReturn { pops: &[] },
    },
    // `push %ebp; push %edi; push %esi; push %ebx; sub $imm8,%esp`
    SpecialUnwind {
        name: "pthread_cond_timedwait",
        arch: Arch::X86,
        anchor: Anchor::Symbol("pthread_cond_timedwait"),
        fingerprint: &[(0, &[0x55, 0x57, 0x56, 0x53, 0x83, 0xec])],
        recipe: Recipe::SavedRegisters {
            pushed: &[i386::EBP, i386::EDI, i386::ESI, i386::EBX],
            frame_size: FrameSize::Imm8At(6),
        },
    },
    // `__restore`: `pop %eax; mov $__NR_sigreturn,%eax; int $0x80`
    SpecialUnwind {
        name: "sigreturn",
        arch: Arch::X86,
        anchor: Anchor::Pc,
        fingerprint: &[(0, &[0x58, 0xb8, 0x77, 0x00, 0x00, 0x00, 0xcd, 0x80])],
        recipe: Recipe::SignalContext {
            // `struct sigframe` without the popped return address: signo, then sigcontext.
            context_offset: 4,
            slots: I386_SIGCONTEXT,
        },
    },
    // `__restore_rt`: `mov $__NR_rt_sigreturn,%eax; int $0x80`
    SpecialUnwind {
        name: "rt_sigreturn",
        arch: Arch::X86,
        anchor: Anchor::Pc,
        fingerprint: &[(0, &[0xb8, 0xad, 0x00, 0x00, 0x00, 0xcd, 0x80])],
        recipe: Recipe::SignalContext {
            // signo, pinfo, puc, siginfo (128 bytes), then the mcontext inside the ucontext.
            context_offset: 12 + 128 + 20,
            slots: I386_SIGCONTEXT,
        },
    },
    // `__restore_rt`: `mov $__NR_rt_sigreturn,%rax; syscall`
    SpecialUnwind {
        name: "rt_sigreturn",
        arch: Arch::Amd64,
        anchor: Anchor::Pc,
        fingerprint: &[(
            0,
            &[0x48, 0xc7, 0xc0, 0x0f, 0x00, 0x00, 0x00, 0x0f, 0x05],
        )],
        recipe: Recipe::SignalContext {
            // The mcontext inside the ucontext.
            context_offset: 40,
            slots: AMD64_SIGCONTEXT,
        },
    },
];

/// Strips a symbol version such as `@@GLIBC_2.3.2`.
fn base_name(name: &str) -> &str {
    name.split('@').next().unwrap_or(name)
}

fn matches_fingerprint(entry: &SpecialUnwind, anchor: u64, memory: &dyn MemoryAccess) -> bool {
    let mut buf = [0; 32];
    entry.fingerprint.iter().all(|&(offset, bytes)| {
        let Some(buf) = buf.get_mut(..bytes.len()) else {
            return false;
        };
        let address = anchor.wrapping_add(offset as u64);
        memory.read_bytes(address, buf).is_ok() && buf == bytes
    })
}

struct Stack<'a> {
    memory: &'a dyn MemoryAccess,
    size: usize,
}

impl Stack<'_> {
    fn read(&self, address: u64) -> Option<u64> {
        match self.memory.read_pointer(address, self.size) {
            Ok(value) => Some(value),
            Err(error) => {
                tracing::debug!(%error, "failed to read stack in special unwind");
                None
            }
        }
    }
}

fn apply_recipe<A>(
    arch: &A,
    recipe: &Recipe,
    anchor: u64,
    offset: u64,
    registers: &Registers,
    memory: &dyn MemoryAccess,
) -> Option<Registers>
where
    A: Architecture + ?Sized,
{
    let size = arch.pointer_size();
    let slot = size as u64;
    let stack = Stack { memory, size };

    let ip = arch.instruction_pointer();
    let sp = arch.stack_pointer();
    let mut address = registers.get(sp)?;

    match *recipe {
        Recipe::StackReturn { pops } => {
            let mut caller = arch.copy_registers_preserving_callee_saved(registers);
            for &reg in pops {
                caller.set_from_memory(reg, stack.read(address)?, address);
                address = address.wrapping_add(slot);
            }
            caller.set_from_memory(ip, stack.read(address)?, address);
            caller.set(sp, address.wrapping_add(slot));
            Some(caller)
        }
        Recipe::SavedRegisters { pushed, frame_size } => {
            let frame_size = match frame_size {
                FrameSize::Fixed(size) => size,
                FrameSize::Imm8At(at) => {
                    // The `sub` is three bytes long and must have executed.
                    if offset < at + 1 {
                        return None;
                    }
                    u64::from(memory.read_u8(anchor.wrapping_add(at)).ok()?)
                }
            };

            let mut caller = arch.copy_registers_preserving_callee_saved(registers);
            address = address.wrapping_add(frame_size);
            for &reg in pushed.iter().rev() {
                caller.set_from_memory(reg, stack.read(address)?, address);
                address = address.wrapping_add(slot);
            }
            caller.set_from_memory(ip, stack.read(address)?, address);
            caller.set(sp, address.wrapping_add(slot));
            Some(caller)
        }
        Recipe::SignalContext {
            context_offset,
            slots,
        } => {
            // An interrupted context has no callee-saved convention, everything is restored.
            let context = address.wrapping_add(context_offset);
            let mut caller = Registers::new();
            for &(reg, offset) in slots {
                let address = context.wrapping_add(offset);
                let value = stack.read(address)?;
                caller.set_from_memory(reg, value, address);
            }
            (caller.is_valid(ip) && caller.is_valid(sp)).then_some(caller)
        }
    }
}

/// Finds the first matching entry of `table` and applies its recipe.
///
/// Entries match if they are for the same architecture, their anchor can be resolved, and all
/// fingerprint bytes can be read and are equal. A memory failure while probing counts as a
/// mismatch. Returns `None` if no entry matches or the recipe of the first matching entry cannot
/// be applied.
pub fn try_special_unwind<A>(
    arch: &A,
    table: &[SpecialUnwind],
    registers: &Registers,
    symbol: Option<&ResolvedSymbol>,
    memory: &dyn MemoryAccess,
) -> Option<SpecialFrame>
where
    A: Architecture + ?Sized,
{
    let pc = registers.get(arch.instruction_pointer())?;

    for entry in table.iter().filter(|entry| entry.arch == arch.arch()) {
        let anchor = match entry.anchor {
            Anchor::Pc => pc,
            Anchor::Symbol(name) => match symbol {
                Some(symbol) if base_name(&symbol.name) == name => symbol.address,
                _ => continue,
            },
        };

        if !matches_fingerprint(entry, anchor, memory) {
            continue;
        }

        tracing::trace!(name = entry.name, pc, "special unwind matched");
        let offset = pc.wrapping_sub(anchor);
        let registers = apply_recipe(arch, &entry.recipe, anchor, offset, registers, memory)?;

        return Some(SpecialFrame {
            name: entry.name,
            registers,
            signal_frame: matches!(entry.recipe, Recipe::SignalContext { .. }),
        });
    }

    None
}
