//! Common functionality for `framewalk`.
//!
//! This crate exposes a set of key types:
//!
//!  - [`Arch`]: The supported architectures and how object files name them.
//!  - [`MemoryAccess`] and [`MemoryWrite`]: The narrow contract through which the unwinder reads
//!    (and, when simulating instructions, writes) the memory of a debuggee.
//!  - [`MemoryRegion`]: A captured block of memory, such as a stack from a core image.
//!
//! This module is part of the `framewalk` crate.

#![warn(missing_docs)]

mod memory;
mod types;

pub use crate::memory::*;
pub use crate::types::*;
