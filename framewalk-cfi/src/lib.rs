//! Handling of DWARF Call Frame Information.
//!
//! The root type exposed by this crate is [`CfiSection`], which wraps the raw bytes of a
//! `.debug_frame` or `.eh_frame` section and answers one question: which rules recover the
//! caller's registers at a given instruction address.
//!
//! # Background
//!
//! Compilers describe how each function manipulates its stack frame in a compact bytecode.
//! Common Information Entries (CIEs) hold the rules shared by many functions, and Frame
//! Description Entries (FDEs) cover one address range each. Replaying the CIE program and then
//! the FDE program up to an address yields an [`UnwindRow`]: the rule computing the Canonical
//! Frame Address (CFA) plus one recovery rule per saved register.
//!
//! The two section flavors share the bytecode but differ in how CIEs are referenced and how
//! addresses are encoded:
//!
//!  - `.debug_frame` references CIEs by absolute section offset and stores plain addresses.
//!  - `.eh_frame` references CIEs relative to the referencing field, and encodes addresses as
//!    specified by the CIE's `R` augmentation (usually PC-relative).
//!
//! Parsed CIEs are kept in a [`CieCache`] owned by the section, so that lookups from multiple
//! threads share the work.

#![warn(missing_docs)]

use std::error::Error;
use std::fmt;

use thiserror::Error;

mod cache;
mod entries;
mod program;
mod section;

pub use crate::cache::*;
pub use crate::entries::*;
pub use crate::program::*;
pub use crate::section::*;

/// The error type for [`CfiError`].
#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CfiErrorKind {
    /// An entry ended before all of its fields could be read.
    UnexpectedEof,

    /// The initial length field of an entry is invalid or exceeds the section.
    BadLength,

    /// An FDE refers to a CIE offset that does not hold a CIE.
    BadCiePointer,

    /// The CIE version is not 1, 3 or 4.
    UnsupportedVersion,

    /// The CIE augmentation string is not understood and carries no length.
    UnsupportedAugmentation,

    /// A pointer encoding is invalid or cannot be resolved statically.
    UnsupportedEncoding,

    /// The bytecode program is malformed, such as restoring an empty state stack.
    BadInstruction,
}

impl fmt::Display for CfiErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnexpectedEof => write!(f, "unexpected end of cfi entry"),
            Self::BadLength => write!(f, "invalid cfi entry length"),
            Self::BadCiePointer => write!(f, "invalid cie pointer"),
            Self::UnsupportedVersion => write!(f, "unsupported cie version"),
            Self::UnsupportedAugmentation => write!(f, "unsupported cie augmentation"),
            Self::UnsupportedEncoding => write!(f, "unsupported pointer encoding"),
            Self::BadInstruction => write!(f, "malformed call frame instruction"),
        }
    }
}

fn file_suffix(file: &Option<String>) -> String {
    match file {
        Some(file) => format!(" in {file}"),
        None => String::new(),
    }
}

/// An error returned when call frame information is malformed.
///
/// The error carries the offset of the offending entry within its section, and the name of the
/// file the section was read from, if known.
#[derive(Debug, Error)]
#[error("{kind} at offset {offset:#x}{}", file_suffix(.file))]
pub struct CfiError {
    kind: CfiErrorKind,
    offset: u64,
    file: Option<String>,
    #[source]
    source: Option<Box<dyn Error + Send + Sync + 'static>>,
}

impl CfiError {
    /// Creates a new CFI error of the given kind at a section offset.
    pub fn new(kind: CfiErrorKind, offset: u64) -> Self {
        Self {
            kind,
            offset,
            file: None,
            source: None,
        }
    }

    /// Creates a new CFI error wrapping an arbitrary error payload.
    fn with_source<E>(kind: CfiErrorKind, offset: u64, source: E) -> Self
    where
        E: Into<Box<dyn Error + Send + Sync>>,
    {
        Self {
            kind,
            offset,
            file: None,
            source: Some(source.into()),
        }
    }

    /// Converts a low-level read error encountered in the entry at `offset`.
    pub(crate) fn read(offset: u64, error: gimli::Error) -> Self {
        let kind = match error {
            gimli::Error::UnexpectedEof(_) => CfiErrorKind::UnexpectedEof,
            gimli::Error::UnknownReservedLength => CfiErrorKind::BadLength,
            gimli::Error::BadUnsignedLeb128 | gimli::Error::BadSignedLeb128 => {
                CfiErrorKind::BadInstruction
            }
            _ => CfiErrorKind::BadLength,
        };
        Self::with_source(kind, offset, error)
    }

    /// Attaches the name of the file the section was read from.
    pub(crate) fn in_file(mut self, file: Option<&str>) -> Self {
        if self.file.is_none() {
            self.file = file.map(str::to_owned);
        }
        self
    }

    /// Returns the corresponding [`CfiErrorKind`] for this error.
    pub fn kind(&self) -> CfiErrorKind {
        self.kind
    }

    /// Returns the section offset of the entry that failed to parse.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Returns the name of the file containing the malformed section.
    pub fn file(&self) -> Option<&str> {
        self.file.as_deref()
    }
}

/// The flavor of a call frame information section.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum CfiSectionKind {
    /// The `.debug_frame` section, as emitted with debug information.
    DebugFrame,
    /// The `.eh_frame` section, as loaded at runtime for exception handling.
    EhFrame,
}

impl CfiSectionKind {
    /// Returns the ELF section name without its leading dot.
    pub fn section_name(self) -> &'static str {
        match self {
            Self::DebugFrame => "debug_frame",
            Self::EhFrame => "eh_frame",
        }
    }
}

impl fmt::Display for CfiSectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, ".{}", self.section_name())
    }
}
