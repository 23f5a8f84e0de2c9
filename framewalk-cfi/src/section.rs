use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

use fallible_iterator::FallibleIterator;
use gimli::{EndianSlice, LittleEndian};

use crate::entries::{EntryHeader, EntryId, PointerReader};
use crate::{CfiError, CfiErrorKind, CfiSectionKind, Cie, CieCache, Fde, UnwindRow};

/// A `.debug_frame` or `.eh_frame` section of an object file.
///
/// Addresses in this section, and addresses passed to its lookups, are link-time virtual
/// addresses of the object file. Callers translate runtime addresses by subtracting the load
/// bias first.
///
/// ```
/// use framewalk_cfi::{CfiSection, CfiSectionKind};
///
/// // An `.eh_frame` consisting only of its terminator.
/// let section = CfiSection::new(CfiSectionKind::EhFrame, &[0u8; 4][..], 0x2000, 8);
/// assert!(section.unwind_row(0x1000).unwrap().is_none());
/// ```
pub struct CfiSection<'data> {
    kind: CfiSectionKind,
    data: Cow<'data, [u8]>,
    address: u64,
    address_size: u8,
    text_address: Option<u64>,
    data_address: Option<u64>,
    file: Option<String>,
    cache: CieCache,
}

impl<'data> CfiSection<'data> {
    /// Creates a section from its contents and the virtual address it is linked at.
    ///
    /// `address_size` is the size of target addresses in bytes, 4 for i386 and 8 for x86-64.
    pub fn new<D>(kind: CfiSectionKind, data: D, address: u64, address_size: u8) -> Self
    where
        D: Into<Cow<'data, [u8]>>,
    {
        Self {
            kind,
            data: data.into(),
            address,
            address_size,
            text_address: None,
            data_address: None,
            file: None,
            cache: CieCache::new(),
        }
    }

    /// Names the file this section was read from, for error messages.
    pub fn with_file<S: Into<String>>(mut self, file: S) -> Self {
        self.file = Some(file.into());
        self
    }

    /// Sets the base address for `DW_EH_PE_textrel` pointers.
    pub fn with_text_address(mut self, address: u64) -> Self {
        self.text_address = Some(address);
        self
    }

    /// Sets the base address for `DW_EH_PE_datarel` pointers.
    pub fn with_data_address(mut self, address: u64) -> Self {
        self.data_address = Some(address);
        self
    }

    /// The flavor of this section.
    pub fn kind(&self) -> CfiSectionKind {
        self.kind
    }

    /// The virtual address of the first byte of this section.
    pub fn address(&self) -> u64 {
        self.address
    }

    /// The raw contents of this section.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// The name of the file this section was read from.
    pub fn file(&self) -> Option<&str> {
        self.file.as_deref()
    }

    /// The cache of CIEs parsed from this section.
    pub fn cache(&self) -> &CieCache {
        &self.cache
    }

    fn pointers(&self) -> PointerReader<'_> {
        PointerReader {
            section: EndianSlice::new(&self.data, LittleEndian),
            section_address: self.address,
            text_address: self.text_address,
            data_address: self.data_address,
            address_size: self.address_size,
        }
    }

    /// Returns the CIE at the given section offset, parsing it on first use.
    pub fn cie_at(&self, offset: u64) -> Result<Arc<Cie>, CfiError> {
        self.cie_at_inner(offset).map_err(|e| e.in_file(self.file()))
    }

    fn cie_at_inner(&self, offset: u64) -> Result<Arc<Cie>, CfiError> {
        self.cache.get_or_try_insert(offset, || {
            let pointers = self.pointers();
            let header = EntryHeader::parse(pointers.section, self.kind, offset)?;
            Cie::parse(header, &pointers)
        })
    }

    /// Iterates all entries of this section in file order.
    pub fn entries(&self) -> CfiEntries<'_> {
        CfiEntries {
            section: self,
            offset: 0,
            done: false,
        }
    }

    /// Finds the FDE covering `address`.
    ///
    /// This scans the section from the start. A malformed entry before the matching FDE aborts
    /// the lookup with an error.
    pub fn find_fde(&self, address: u64) -> Result<Option<Fde<'_>>, CfiError> {
        let mut entries = self.entries();
        while let Some(entry) = entries.next()? {
            if let CfiEntry::Fde(fde) = entry {
                if fde.contains(address) {
                    return Ok(Some(fde));
                }
            }
        }

        Ok(None)
    }

    /// Computes the recovery rules in effect at `address`.
    ///
    /// Returns `Ok(None)` if no FDE covers the address.
    #[tracing::instrument(level = "trace", skip(self), fields(section = %self.kind))]
    pub fn unwind_row(&self, address: u64) -> Result<Option<UnwindRow>, CfiError> {
        let Some(fde) = self.find_fde(address)? else {
            tracing::trace!("no fde covers address");
            return Ok(None);
        };

        tracing::trace!(fde = fde.offset(), cie = fde.cie().offset(), "found fde");
        let row = fde
            .evaluate(&self.pointers(), address)
            .map_err(|e| e.in_file(self.file()))?;

        Ok(Some(row))
    }
}

impl fmt::Debug for CfiSection<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CfiSection")
            .field("kind", &self.kind)
            .field("address", &format_args!("{:#x}", self.address))
            .field("size", &self.data.len())
            .field("address_size", &self.address_size)
            .field("file", &self.file)
            .finish()
    }
}

/// An entry of a call frame information section.
#[derive(Clone, Debug)]
pub enum CfiEntry<'a> {
    /// A Common Information Entry.
    Cie(Arc<Cie>),
    /// A Frame Description Entry.
    Fde(Fde<'a>),
}

/// An iterator over the entries of a [`CfiSection`].
///
/// Returned by [`CfiSection::entries`]. Iteration ends at the end of the section, at a zero
/// length terminator in `.eh_frame`, or after the first error.
pub struct CfiEntries<'a> {
    section: &'a CfiSection<'a>,
    offset: u64,
    done: bool,
}

impl<'a> CfiEntries<'a> {
    fn next_entry(&mut self) -> Result<Option<CfiEntry<'a>>, CfiError> {
        let section = self.section;
        let pointers = section.pointers();

        loop {
            if self.done || self.offset >= section.data.len() as u64 {
                return Ok(None);
            }

            let header = EntryHeader::parse(pointers.section, section.kind, self.offset)?;
            self.offset = header.next_offset;

            match header.id {
                EntryId::Terminator if section.kind == CfiSectionKind::EhFrame => {
                    self.done = true;
                    return Ok(None);
                }
                EntryId::Terminator => continue,
                EntryId::Cie => {
                    let cie = section.cie_at_inner(header.offset)?;
                    return Ok(Some(CfiEntry::Cie(cie)));
                }
                EntryId::Fde { cie_offset } => {
                    if cie_offset >= section.data.len() as u64 {
                        return Err(CfiError::new(CfiErrorKind::BadCiePointer, header.offset));
                    }
                    let cie = section.cie_at_inner(cie_offset)?;
                    let fde = Fde::parse(header, cie, &pointers)?;
                    return Ok(Some(CfiEntry::Fde(fde)));
                }
            }
        }
    }
}

impl<'a> FallibleIterator for CfiEntries<'a> {
    type Item = CfiEntry<'a>;
    type Error = CfiError;

    fn next(&mut self) -> Result<Option<Self::Item>, Self::Error> {
        self.next_entry().map_err(|e| {
            self.done = true;
            e.in_file(self.section.file())
        })
    }
}
