use std::collections::HashMap;

use framewalk_common::{MemoryAccess, MemoryError, MemoryErrorKind, MemoryWrite};

/// Sparse, writable memory of a fake debuggee.
///
/// Every byte that was never written is unmapped, so reads outside of the populated areas fail
/// like reads from an unmapped page.
///
/// ```
/// use framewalk_common::MemoryAccess;
/// use framewalk_testutils::MockMemory;
///
/// let memory = MockMemory::new().with_words(0x7000, 8, &[0x1122, 0x3344]);
/// assert_eq!(memory.read_u64(0x7008).unwrap(), 0x3344);
/// assert!(memory.read_u8(0x6fff).is_err());
/// ```
#[derive(Clone, Debug, Default)]
pub struct MockMemory {
    bytes: HashMap<u64, u8>,
}

impl MockMemory {
    /// Creates memory with nothing mapped.
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps `data` at `address`.
    pub fn with_bytes(mut self, address: u64, data: &[u8]) -> Self {
        self.set_bytes(address, data);
        self
    }

    /// Maps consecutive words of `word_size` bytes starting at `address`.
    pub fn with_words(mut self, address: u64, word_size: usize, words: &[u64]) -> Self {
        for (index, word) in words.iter().enumerate() {
            let bytes = word.to_le_bytes();
            self.set_bytes(address + (index * word_size) as u64, &bytes[..word_size]);
        }
        self
    }

    /// Maps `data` at `address`, overwriting previous contents.
    pub fn set_bytes(&mut self, address: u64, data: &[u8]) {
        for (index, byte) in data.iter().enumerate() {
            self.bytes.insert(address + index as u64, *byte);
        }
    }

    /// Returns `true` if every byte in `[address, address + size)` is mapped.
    pub fn is_mapped(&self, address: u64, size: usize) -> bool {
        (0..size as u64).all(|index| self.bytes.contains_key(&(address + index)))
    }
}

impl MemoryAccess for MockMemory {
    fn read_bytes(&self, address: u64, buf: &mut [u8]) -> Result<(), MemoryError> {
        let size = buf.len();
        for (index, byte) in buf.iter_mut().enumerate() {
            *byte = *address
                .checked_add(index as u64)
                .and_then(|address| self.bytes.get(&address))
                .ok_or_else(|| MemoryError::new(MemoryErrorKind::Unmapped, address, size))?;
        }
        Ok(())
    }
}

impl MemoryWrite for MockMemory {
    fn write_bytes(&mut self, address: u64, data: &[u8]) -> Result<(), MemoryError> {
        if !self.is_mapped(address, data.len()) {
            return Err(MemoryError::new(
                MemoryErrorKind::Unmapped,
                address,
                data.len(),
            ));
        }
        self.set_bytes(address, data);
        Ok(())
    }
}
