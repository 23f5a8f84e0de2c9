//! Test helpers for `framewalk`.
//!
//! Unwinding tests need three kinds of synthetic input: process memory, call frame information,
//! and object files. This crate builds all three from a few lines of test code.
#![warn(missing_docs)]

mod cfi;
mod elf;
mod memory;

pub use crate::cfi::*;
pub use crate::elf::*;
pub use crate::memory::*;

/// Encodes an unsigned LEB128 number.
pub fn uleb128(mut value: u64) -> Vec<u8> {
    let mut bytes = Vec::new();
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            bytes.push(byte);
            return bytes;
        }
        bytes.push(byte | 0x80);
    }
}

/// Encodes a signed LEB128 number.
pub fn sleb128(mut value: i64) -> Vec<u8> {
    let mut bytes = Vec::new();
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        let done = (value == 0 && byte & 0x40 == 0) || (value == -1 && byte & 0x40 != 0);
        if done {
            bytes.push(byte);
            return bytes;
        }
        bytes.push(byte | 0x80);
    }
}
