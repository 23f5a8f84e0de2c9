//! Access to the memory of a traced process or core image.

use std::borrow::Cow;
use std::error::Error;
use std::fmt;

use scroll::{Pread, Pwrite, LE};
use thiserror::Error;

/// The error type for [`MemoryError`].
#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemoryErrorKind {
    /// The address is not covered by any readable mapping.
    Unmapped,

    /// The mapping exists but does not permit writes.
    ReadOnly,

    /// The target process exited or the image can no longer be read.
    TargetGone,
}

impl fmt::Display for MemoryErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unmapped => write!(f, "unmapped address"),
            Self::ReadOnly => write!(f, "read-only memory"),
            Self::TargetGone => write!(f, "target is gone"),
        }
    }
}

/// A failed memory access, carrying the address and size of the access.
#[derive(Debug, Error)]
#[error("{kind} at {address:#x} ({size} bytes)")]
pub struct MemoryError {
    kind: MemoryErrorKind,
    address: u64,
    size: usize,
    #[source]
    source: Option<Box<dyn Error + Send + Sync + 'static>>,
}

impl MemoryError {
    /// Creates a new memory error for an access of `size` bytes at `address`.
    pub fn new(kind: MemoryErrorKind, address: u64, size: usize) -> Self {
        Self {
            kind,
            address,
            size,
            source: None,
        }
    }

    /// Creates a new memory error wrapping an arbitrary error payload, such as an I/O error from
    /// `/proc/<pid>/mem`.
    pub fn with_source<E>(kind: MemoryErrorKind, address: u64, size: usize, source: E) -> Self
    where
        E: Into<Box<dyn Error + Send + Sync>>,
    {
        Self {
            kind,
            address,
            size,
            source: Some(source.into()),
        }
    }

    /// Returns the corresponding [`MemoryErrorKind`] for this error.
    pub fn kind(&self) -> MemoryErrorKind {
        self.kind
    }

    /// Returns the first address of the failed access.
    pub fn address(&self) -> u64 {
        self.address
    }
}

/// Reads memory of the debuggee.
///
/// Implementors only provide [`read_bytes`](Self::read_bytes). All multi-byte reads are
/// little-endian, the only byte order of the supported architectures.
pub trait MemoryAccess {
    /// Fills `buf` with the bytes starting at `address`.
    ///
    /// Partial reads are errors. Either all of `buf` is written or an error is returned.
    fn read_bytes(&self, address: u64, buf: &mut [u8]) -> Result<(), MemoryError>;

    /// Reads a single byte.
    fn read_u8(&self, address: u64) -> Result<u8, MemoryError> {
        let mut buf = [0; 1];
        self.read_bytes(address, &mut buf)?;
        Ok(buf[0])
    }

    /// Reads a little-endian `u16`.
    fn read_u16(&self, address: u64) -> Result<u16, MemoryError> {
        let mut buf = [0; 2];
        self.read_bytes(address, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    /// Reads a little-endian `u32`.
    fn read_u32(&self, address: u64) -> Result<u32, MemoryError> {
        let mut buf = [0; 4];
        self.read_bytes(address, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    /// Reads a little-endian `u64`.
    fn read_u64(&self, address: u64) -> Result<u64, MemoryError> {
        let mut buf = [0; 8];
        self.read_bytes(address, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    /// Reads a pointer of `pointer_size` bytes, zero-extended to 64 bits.
    ///
    /// Any size other than 4 or 8 reads 8 bytes.
    fn read_pointer(&self, address: u64, pointer_size: usize) -> Result<u64, MemoryError> {
        match pointer_size {
            4 => self.read_u32(address).map(u64::from),
            _ => self.read_u64(address),
        }
    }
}

/// Writes memory of the debuggee.
///
/// Used when simulating instructions that store to the stack, such as `push` and `call`.
pub trait MemoryWrite: MemoryAccess {
    /// Writes all of `data` starting at `address`.
    fn write_bytes(&mut self, address: u64, data: &[u8]) -> Result<(), MemoryError>;

    /// Writes a pointer of `pointer_size` bytes, truncating `value` as needed.
    fn write_pointer(
        &mut self,
        address: u64,
        value: u64,
        pointer_size: usize,
    ) -> Result<(), MemoryError> {
        match pointer_size {
            4 => self.write_bytes(address, &(value as u32).to_le_bytes()),
            _ => self.write_bytes(address, &value.to_le_bytes()),
        }
    }
}

impl<T: MemoryAccess + ?Sized> MemoryAccess for &T {
    fn read_bytes(&self, address: u64, buf: &mut [u8]) -> Result<(), MemoryError> {
        (**self).read_bytes(address, buf)
    }
}

impl<T: MemoryAccess + ?Sized> MemoryAccess for &mut T {
    fn read_bytes(&self, address: u64, buf: &mut [u8]) -> Result<(), MemoryError> {
        (**self).read_bytes(address, buf)
    }
}

impl<T: MemoryWrite + ?Sized> MemoryWrite for &mut T {
    fn write_bytes(&mut self, address: u64, data: &[u8]) -> Result<(), MemoryError> {
        (**self).write_bytes(address, data)
    }
}

/// A contiguous region of memory, such as a thread's stack captured from a core file.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct MemoryRegion<'a> {
    /// The address of the first byte of this region.
    pub base_addr: u64,
    /// The bytes of this region.
    pub contents: Cow<'a, [u8]>,
}

impl<'a> MemoryRegion<'a> {
    /// Creates a region borrowing `contents` at `base_addr`.
    pub fn new(base_addr: u64, contents: &'a [u8]) -> Self {
        Self {
            base_addr,
            contents: Cow::Borrowed(contents),
        }
    }

    /// The size of this region in bytes.
    pub fn size(&self) -> u64 {
        self.contents.len() as u64
    }

    /// Returns `true` if `[address, address + size)` lies entirely within this region.
    pub fn contains(&self, address: u64, size: usize) -> bool {
        let Some(start) = address.checked_sub(self.base_addr) else {
            return false;
        };
        start
            .checked_add(size as u64)
            .map_or(false, |end| end <= self.size())
    }

    /// Reads a little-endian value of type `T` at `address`.
    pub fn get<T>(&self, address: u64) -> Option<T>
    where
        T: for<'b> scroll::ctx::TryFromCtx<'b, scroll::Endian, Error = scroll::Error>,
    {
        let offset = address.checked_sub(self.base_addr)?;
        let offset = usize::try_from(offset).ok()?;
        self.contents.pread_with(offset, LE).ok()
    }

    fn offset_of(&self, address: u64, size: usize) -> Result<usize, MemoryError> {
        if !self.contains(address, size) {
            return Err(MemoryError::new(MemoryErrorKind::Unmapped, address, size));
        }
        // `contains` bounds the offset by the slice length
        Ok((address - self.base_addr) as usize)
    }
}

impl MemoryAccess for MemoryRegion<'_> {
    fn read_bytes(&self, address: u64, buf: &mut [u8]) -> Result<(), MemoryError> {
        let offset = self.offset_of(address, buf.len())?;
        buf.copy_from_slice(&self.contents[offset..offset + buf.len()]);
        Ok(())
    }

    fn read_u32(&self, address: u64) -> Result<u32, MemoryError> {
        self.get(address)
            .ok_or_else(|| MemoryError::new(MemoryErrorKind::Unmapped, address, 4))
    }

    fn read_u64(&self, address: u64) -> Result<u64, MemoryError> {
        self.get(address)
            .ok_or_else(|| MemoryError::new(MemoryErrorKind::Unmapped, address, 8))
    }
}

impl MemoryWrite for MemoryRegion<'_> {
    fn write_bytes(&mut self, address: u64, data: &[u8]) -> Result<(), MemoryError> {
        let offset = self.offset_of(address, data.len())?;
        self.contents
            .to_mut()
            .pwrite_with(data, offset, ())
            .map_err(|e| MemoryError::with_source(MemoryErrorKind::Unmapped, address, data.len(), e))?;
        Ok(())
    }
}

/// A set of disjoint memory regions, as found in a core image.
impl MemoryAccess for [MemoryRegion<'_>] {
    fn read_bytes(&self, address: u64, buf: &mut [u8]) -> Result<(), MemoryError> {
        self.iter()
            .find(|region| region.contains(address, buf.len()))
            .ok_or_else(|| MemoryError::new(MemoryErrorKind::Unmapped, address, buf.len()))?
            .read_bytes(address, buf)
    }
}

impl MemoryAccess for Vec<MemoryRegion<'_>> {
    fn read_bytes(&self, address: u64, buf: &mut [u8]) -> Result<(), MemoryError> {
        self.as_slice().read_bytes(address, buf)
    }
}
