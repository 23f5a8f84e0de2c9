//! Symbols, code and call frame information of modules loaded into a debugged process.
//!
//! An unwinder needs three things from the object files mapped into a process: function symbols
//! to name frames and locate function starts, the machine code to decode prologues, and the raw
//! `.debug_frame` and `.eh_frame` sections. This crate reads them from ELF files with `goblin`.
//!
//! The entry points are:
//!
//!  - [`ElfObject`]: a parsed ELF file. Its symbol addresses are relative to the load address.
//!  - [`SymbolFile`]: an object mapped at a load bias. It translates runtime addresses and
//!    lazily builds its symbol map and CFI sections.
//!  - [`SymbolTable`]: all modules of a process, looked up by address.

#![warn(missing_docs)]

mod base;
#[cfg(feature = "elf")]
mod elf;
#[cfg(feature = "elf")]
mod module;
#[cfg(feature = "elf")]
mod table;

pub use crate::base::*;
#[cfg(feature = "elf")]
pub use crate::elf::*;
#[cfg(feature = "elf")]
pub use crate::module::*;
#[cfg(feature = "elf")]
pub use crate::table::*;
