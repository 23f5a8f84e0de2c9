//! Reconstruction of the call stack of a debugged thread on x86 and x86-64.
//!
//! The entry point is the [`FrameBuilder`]. It is created for an [`Architecture`], the modules
//! loaded into the debuggee as a [`SymbolTable`](framewalk_debuginfo::SymbolTable), and read
//! access to the debuggee's memory. Given the register context of a thread, it produces the
//! innermost [`StackFrame`] and recovers callers one by one.
//!
//! ```
//! use framewalk_common::Arch;
//! use framewalk_debuginfo::SymbolTable;
//! use framewalk_testutils::MockMemory;
//! use framewalk_unwind::arch::{self, amd64};
//! use framewalk_unwind::{FrameBuilder, Registers};
//!
//! // A frame pointer chain with a single caller.
//! let memory = MockMemory::new()
//!     .with_words(0x7000, 8, &[0, 0x401005])
//!     .with_bytes(0x401000, &[0xe8, 0x00, 0x00, 0x00, 0x00]);
//! let symbols = SymbolTable::new();
//!
//! let amd64 = arch::for_arch(Arch::Amd64).unwrap();
//! let builder = FrameBuilder::new(amd64, &symbols, &memory);
//!
//! let registers = Registers::new()
//!     .with(amd64::RIP, 0x402000)
//!     .with(amd64::RSP, 0x6ff0)
//!     .with(amd64::RBP, 0x7000);
//!
//! let pcs: Vec<_> = builder.backtrace(registers).map(|frame| frame.pc()).collect();
//! assert_eq!(pcs, [0x402000, 0x401005]);
//! ```
//!
//! # Strategies
//!
//! Callers are recovered by the first applicable strategy:
//!
//!  - Fingerprinted hand-written assembly, see [`BUILTIN_SPECIAL_UNWINDS`].
//!  - DWARF call frame information, parsed by `framewalk-cfi`.
//!  - Analysis of the function prologue through the [`decoder`].
//!  - The chain of saved frame pointers.
//!
//! Which strategies run is configured with [`UnwindOptions`].

#![warn(missing_docs)]

pub mod arch;
mod builder;
mod cfi;
pub mod decoder;
mod frame;
mod registers;
mod special;
mod trampoline;

pub use crate::arch::Architecture;
pub use crate::builder::*;
pub use crate::cfi::*;
pub use crate::frame::*;
pub use crate::registers::*;
pub use crate::special::*;
pub use crate::trampoline::*;
