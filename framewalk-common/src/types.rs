//! The architectures framewalk unwinds.

use thiserror::Error;

/// An error returned for a target that names no supported [`Arch`].
#[derive(Debug, Error)]
#[error("unknown architecture")]
pub struct UnknownArchError;

/// A CPU architecture, as declared by an object file.
///
/// Only the two Intel families are unwound. All other machines map to `Unknown` and are rejected
/// when selecting an unwinder.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum Arch {
    /// Any machine other than the ones below.
    #[default]
    Unknown,
    /// 32-bit protected mode, also known as i386.
    X86,
    /// 64-bit long mode, also known as x86-64.
    Amd64,
}

impl Arch {
    /// Returns the BFD target name an ELF object of this architecture declares.
    pub fn target_name(self) -> Option<&'static str> {
        match self {
            Arch::Unknown => None,
            Arch::X86 => Some("elf32-i386"),
            Arch::Amd64 => Some("elf64-x86-64"),
        }
    }

    /// Selects the architecture from an object file's declared target.
    ///
    /// ```
    /// use framewalk_common::Arch;
    ///
    /// assert_eq!(Arch::from_target_name("elf64-x86-64").unwrap(), Arch::Amd64);
    /// assert!(Arch::from_target_name("elf32-littlearm").is_err());
    /// ```
    pub fn from_target_name(target: &str) -> Result<Arch, UnknownArchError> {
        match target {
            "elf32-i386" | "elf32-i386-freebsd" | "elf32-i386-sol2" => Ok(Arch::X86),
            "elf64-x86-64" | "elf64-x86-64-freebsd" | "elf64-x86-64-sol2" => Ok(Arch::Amd64),
            _ => Err(UnknownArchError),
        }
    }

    /// Returns whether the architecture executes in 64-bit long mode.
    pub fn is_64bit(self) -> bool {
        self == Arch::Amd64
    }

    /// The size of pointers, general purpose registers and stack slots.
    pub fn pointer_size(self) -> Option<usize> {
        match self {
            Arch::Unknown => None,
            Arch::X86 => Some(4),
            Arch::Amd64 => Some(8),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use similar_asserts::assert_eq;

    #[test]
    fn test_target_name_roundtrip() {
        for arch in [Arch::X86, Arch::Amd64] {
            let target = arch.target_name().unwrap();
            assert_eq!(Arch::from_target_name(target).unwrap(), arch);
        }
        assert_eq!(Arch::Unknown.target_name(), None);
    }

    #[test]
    fn test_vendor_targets() {
        assert_eq!(
            Arch::from_target_name("elf32-i386-freebsd").unwrap(),
            Arch::X86
        );
        assert_eq!(
            Arch::from_target_name("elf64-x86-64-sol2").unwrap(),
            Arch::Amd64
        );
        assert!(Arch::from_target_name("elf64-littleaarch64").is_err());
    }

    #[test]
    fn test_pointer_size() {
        assert_eq!(Arch::X86.pointer_size(), Some(4));
        assert_eq!(Arch::Amd64.pointer_size(), Some(8));
        assert_eq!(Arch::Unknown.pointer_size(), None);
        assert!(!Arch::X86.is_64bit());
    }
}
