//! framewalk reconstructs the call stack of a thread in a debugged x86 or x86-64 process.
//!
//! It consists of multiple largely independent crates, bundled together here:
//!
//! - **`common`**: CPU architectures, BFD target names and access to the debuggee's memory.
//! - **`cfi`**: Parsing of DWARF call frame information from `.debug_frame` and `.eh_frame`.
//! - **`debuginfo`**: ELF modules mapped into the debuggee at a load bias, their symbols, code and
//!   call frame information.
//! - **`unwind`**: The x86 instruction decoder, per-architecture register tables, and the frame
//!   builder that combines call frame information, special cases for hand-written assembly,
//!   prologue analysis and frame pointers.
//!
//! # Usage
//!
//! Add `framewalk` as a dependency to your `Cargo.toml`. All features are enabled by default:
//!
//! - **`cfi`**: Call frame information parsing.
//! - **`debuginfo`**: ELF modules and symbol tables. Implies `cfi`.
//! - **`unwind`**: Stack frame reconstruction. Implies `debuginfo`.
//!
//! ## Minimal Rust Version
//!
//! This crate is known to require at least Rust 1.70.

#![warn(missing_docs)]

#[doc(inline)]
#[cfg(feature = "cfi")]
pub use framewalk_cfi as cfi;
#[doc(inline)]
pub use framewalk_common as common;
#[doc(inline)]
#[cfg(feature = "debuginfo")]
pub use framewalk_debuginfo as debuginfo;
#[doc(inline)]
#[cfg(feature = "unwind")]
pub use framewalk_unwind as unwind;
