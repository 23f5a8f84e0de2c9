//! Classification of call targets, including PLT stubs and managed-runtime trampolines.

use std::fmt;

use framewalk_common::MemoryAccess;
use framewalk_debuginfo::{SymbolFile, SymbolLookup, SymbolTable};

use crate::arch::Architecture;
use crate::decoder::{self, Instruction, InstructionKind};
use crate::registers::Registers;

/// Sections holding PLT stubs.
const PLT_SECTIONS: &[&str] = &["plt", "plt.sec"];

/// `endbr64` and `endbr32`, which lead PLT stubs in binaries built with CET.
const ENDBR: &[&[u8]] = &[&[0xf3, 0x0f, 0x1e, 0xfa], &[0xf3, 0x0f, 0x1e, 0xfb]];

/// The symbolic name of a code address.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct ResolvedSymbol {
    /// The name of the function.
    pub name: String,
    /// The address of the start of the function.
    pub address: u64,
    /// The offset of the resolved address into the function.
    pub offset: u64,
    /// The module containing the function, if it is native code.
    pub module: Option<String>,
}

impl From<SymbolLookup> for ResolvedSymbol {
    fn from(lookup: SymbolLookup) -> Self {
        Self {
            name: lookup.name,
            address: lookup.address,
            offset: lookup.offset,
            module: Some(lookup.module),
        }
    }
}

impl fmt::Display for ResolvedSymbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}+{:#x}", self.name, self.offset)
    }
}

/// Metadata of a managed runtime that generates code at runtime.
///
/// Native modules do not cover JIT-compiled code, so the runtime resolves names of such
/// addresses and identifies its trampolines.
pub trait ManagedRuntime: Send + Sync {
    /// Returns `true` if the address is the entry of a JIT-compiled trampoline.
    fn is_trampoline(&self, address: u64) -> bool;

    /// Resolves the name of a JIT-compiled method covering the address.
    fn lookup_symbol(&self, address: u64) -> Option<ResolvedSymbol>;
}

/// The destination of a call or jump.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum CallTarget {
    /// Ordinary code.
    Direct(u64),
    /// A stub in the procedure linkage table of a module.
    Plt {
        /// The address of the stub.
        stub: u64,
        /// The value of the stub's GOT slot.
        target: u64,
        /// Set if the GOT slot still points back into the PLT, so the first call will enter the
        /// dynamic linker.
        is_start: bool,
    },
    /// A trampoline of a managed runtime.
    Managed(u64),
}

impl CallTarget {
    /// The address where execution continues after the transfer, skipping resolved PLT stubs.
    pub fn address(&self) -> u64 {
        match *self {
            Self::Direct(address) | Self::Managed(address) => address,
            Self::Plt {
                stub,
                target,
                is_start,
            } => {
                if is_start {
                    stub
                } else {
                    target
                }
            }
        }
    }
}

/// Determines where a call or jump instruction transfers control to.
///
/// The target of the instruction is evaluated against the given registers and memory. Targets in
/// the PLT of a module are resolved through their GOT slot. Returns `None` for instructions that
/// are not calls or jumps, and if the target cannot be evaluated.
pub fn classify_call_target<A>(
    arch: &A,
    instruction: &Instruction,
    registers: &Registers,
    symbols: &SymbolTable<'_>,
    memory: &dyn MemoryAccess,
    runtime: Option<&dyn ManagedRuntime>,
) -> Option<CallTarget>
where
    A: Architecture + ?Sized,
{
    match instruction.kind() {
        InstructionKind::Call
        | InstructionKind::IndirectCall
        | InstructionKind::Jump
        | InstructionKind::IndirectJump => {}
        _ => return None,
    }

    let target = match instruction.evaluate(arch, registers, memory) {
        Ok(target) => target,
        Err(error) => {
            tracing::debug!(%error, address = instruction.address(), "cannot evaluate call target");
            return None;
        }
    };

    if let Some(module) = symbols.find_module(target) {
        if let Some(plt) = classify_plt(arch, module, target, registers, memory) {
            return Some(plt);
        }
    }

    if runtime.map_or(false, |runtime| runtime.is_trampoline(target)) {
        return Some(CallTarget::Managed(target));
    }

    Some(CallTarget::Direct(target))
}

fn in_plt(module: &SymbolFile<'_>, address: u64) -> bool {
    PLT_SECTIONS.iter().any(|name| {
        module
            .section_range(name)
            .map_or(false, |range| range.contains(&address))
    })
}

/// Resolves the GOT slot of a PLT stub.
///
/// A stub is `jmp *slot`, optionally preceded by `endbr`. Lazy binding initializes the slot to
/// point back into the PLT, right after the jump in classic layouts.
fn classify_plt<A>(
    arch: &A,
    module: &SymbolFile<'_>,
    stub: u64,
    registers: &Registers,
    memory: &dyn MemoryAccess,
) -> Option<CallTarget>
where
    A: Architecture + ?Sized,
{
    if !in_plt(module, stub) {
        return None;
    }

    let mut buf = [0; 2 * decoder::MAX_INSTRUCTION_LENGTH];
    let code = match module.code_bytes(stub, buf.len()) {
        Some(code) => code,
        None => {
            memory.read_bytes(stub, &mut buf[..16]).ok()?;
            &buf[..16]
        }
    };

    let mut instructions = decoder::decode_all(code, stub, arch.is_64bit());
    let mut jump = instructions.next()?;
    if ENDBR.contains(&jump.raw_bytes()) {
        jump = instructions.next()?;
    }

    if jump.kind() != InstructionKind::IndirectJump {
        return None;
    }
    let operand = *jump.effective_address()?;
    if !operand.dereference {
        return None;
    }

    // PIC stubs on i386 address the GOT through %ebx, which holds its address at the call site
    // but is often not recovered for outer frames.
    let mut registers = registers.clone();
    if let Some(base) = operand.base.and_then(|base| arch.register_from_jit(base)) {
        if !arch.is_64bit() && !registers.is_valid(base) {
            let got = module
                .section_range("got.plt")
                .or_else(|| module.section_range("got"))?;
            registers.set(base, got.start);
        }
    }

    let slot = jump.operand_address(arch, &registers).ok()?;
    let target = match memory.read_pointer(slot, arch.pointer_size()) {
        Ok(target) => target,
        Err(error) => {
            tracing::debug!(%error, stub, "cannot read got slot of plt stub");
            return None;
        }
    };

    let is_start = Some(target) == jump.next_address() || in_plt(module, target);
    Some(CallTarget::Plt {
        stub,
        target,
        is_start,
    })
}
