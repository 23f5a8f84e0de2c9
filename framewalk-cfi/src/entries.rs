//! Parsing of Common Information Entries and Frame Description Entries.

use std::ops::Range;
use std::sync::Arc;

use gimli::constants::{self, DwEhPe};
use gimli::{EndianSlice, Format, LittleEndian, Reader, ReaderOffset};

use crate::program::{execute, ProgramContext, UnwindRow};
use crate::{CfiError, CfiErrorKind, CfiSectionKind};

/// The reader over call frame information. Both supported architectures are little-endian.
pub(crate) type CfiReader<'d> = EndianSlice<'d, LittleEndian>;

/// Resolves encoded pointers relative to the section they are read from.
#[derive(Clone, Copy, Debug)]
pub(crate) struct PointerReader<'d> {
    pub section: CfiReader<'d>,
    pub section_address: u64,
    pub text_address: Option<u64>,
    pub data_address: Option<u64>,
    pub address_size: u8,
}

impl<'d> PointerReader<'d> {
    /// Reads a pointer encoded as described by `encoding`, applying its base.
    ///
    /// Indirect pointers are returned without dereferencing them.
    pub fn read(
        &self,
        reader: &mut CfiReader<'d>,
        encoding: DwEhPe,
        entry_offset: u64,
    ) -> Result<u64, CfiError> {
        let unsupported = || CfiError::new(CfiErrorKind::UnsupportedEncoding, entry_offset);

        if encoding == constants::DW_EH_PE_omit {
            return Err(unsupported());
        }

        if encoding.application() == constants::DW_EH_PE_aligned {
            let size = usize::from(self.address_size.max(1));
            let offset = reader.offset_from(self.section);
            let padding = (size - offset % size) % size;
            reader
                .skip(padding)
                .map_err(|e| CfiError::read(entry_offset, e))?;
        }

        let field_address = self
            .section_address
            .wrapping_add(reader.offset_from(self.section) as u64);
        let value = self.read_value(reader, encoding.format(), entry_offset)?;

        let base = match encoding.application() {
            constants::DW_EH_PE_absptr | constants::DW_EH_PE_aligned => 0,
            constants::DW_EH_PE_pcrel => field_address,
            constants::DW_EH_PE_textrel => self.text_address.ok_or_else(unsupported)?,
            constants::DW_EH_PE_datarel => self.data_address.ok_or_else(unsupported)?,
            _ => return Err(unsupported()),
        };

        Ok(self.truncate(base.wrapping_add(value)))
    }

    /// Reads the raw value of a pointer without applying any base.
    pub fn read_value(
        &self,
        reader: &mut CfiReader<'d>,
        format: DwEhPe,
        entry_offset: u64,
    ) -> Result<u64, CfiError> {
        let value = match format {
            constants::DW_EH_PE_absptr => reader.read_address(self.address_size),
            constants::DW_EH_PE_uleb128 => reader.read_uleb128(),
            constants::DW_EH_PE_udata2 => reader.read_u16().map(u64::from),
            constants::DW_EH_PE_udata4 => reader.read_u32().map(u64::from),
            constants::DW_EH_PE_udata8 => reader.read_u64(),
            constants::DW_EH_PE_sleb128 => reader.read_sleb128().map(|v| v as u64),
            constants::DW_EH_PE_sdata2 => reader.read_i16().map(|v| v as i64 as u64),
            constants::DW_EH_PE_sdata4 => reader.read_i32().map(|v| v as i64 as u64),
            constants::DW_EH_PE_sdata8 => reader.read_i64().map(|v| v as u64),
            _ => {
                return Err(CfiError::new(
                    CfiErrorKind::UnsupportedEncoding,
                    entry_offset,
                ))
            }
        };

        value.map_err(|e| CfiError::read(entry_offset, e))
    }

    fn truncate(&self, address: u64) -> u64 {
        match self.address_size {
            4 => address & 0xffff_ffff,
            _ => address,
        }
    }
}

/// What an entry header identifies.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum EntryId {
    Cie,
    Fde { cie_offset: u64 },
    /// A zero length entry, which ends `.eh_frame`.
    Terminator,
}

/// The common prefix of CIEs and FDEs.
#[derive(Clone, Copy, Debug)]
pub(crate) struct EntryHeader<'d> {
    pub offset: u64,
    pub id: EntryId,
    pub content: CfiReader<'d>,
    pub next_offset: u64,
}

impl<'d> EntryHeader<'d> {
    pub fn parse(
        section: CfiReader<'d>,
        kind: CfiSectionKind,
        offset: u64,
    ) -> Result<Self, CfiError> {
        let bad_length = |_| CfiError::new(CfiErrorKind::BadLength, offset);

        let mut reader = section;
        let start = usize::from_u64(offset).map_err(bad_length)?;
        reader.skip(start).map_err(bad_length)?;

        let (length, format) = reader
            .read_initial_length()
            .map_err(|e| CfiError::read(offset, e))?;
        let header_size = reader.offset_from(section) - start;

        if length == 0 {
            return Ok(Self {
                offset,
                id: EntryId::Terminator,
                content: EndianSlice::new(&[], LittleEndian),
                next_offset: offset + header_size as u64,
            });
        }

        let mut content = reader.split(length).map_err(bad_length)?;
        let id_offset = offset + header_size as u64;
        let id = content
            .read_offset(format)
            .map_err(|e| CfiError::read(offset, e))? as u64;

        let is_cie = match (kind, format) {
            (CfiSectionKind::DebugFrame, Format::Dwarf32) => id == 0xffff_ffff,
            (CfiSectionKind::DebugFrame, Format::Dwarf64) => id == u64::MAX,
            (CfiSectionKind::EhFrame, _) => id == 0,
        };

        let id = if is_cie {
            EntryId::Cie
        } else {
            let cie_offset = match kind {
                CfiSectionKind::DebugFrame => id,
                CfiSectionKind::EhFrame => id_offset
                    .checked_sub(id)
                    .ok_or_else(|| CfiError::new(CfiErrorKind::BadCiePointer, offset))?,
            };
            EntryId::Fde { cie_offset }
        };

        Ok(Self {
            offset,
            id,
            content,
            next_offset: id_offset + length as u64,
        })
    }
}

/// A Common Information Entry, holding the rules shared by many functions.
///
/// The CIE's own program is replayed once while parsing. The resulting [`UnwindRow`] is the
/// starting point for every FDE referencing this CIE.
#[derive(Clone, Debug)]
pub struct Cie {
    offset: u64,
    version: u8,
    augmentation: String,
    address_size: u8,
    code_alignment_factor: u64,
    data_alignment_factor: i64,
    return_address_register: u16,
    fde_encoding: DwEhPe,
    lsda_encoding: Option<DwEhPe>,
    personality: Option<u64>,
    has_augmentation_length: bool,
    signal_frame: bool,
    initial_row: UnwindRow,
}

impl Cie {
    pub(crate) fn parse<'d>(
        header: EntryHeader<'d>,
        pointers: &PointerReader<'d>,
    ) -> Result<Self, CfiError> {
        let offset = header.offset;
        let read = |e| CfiError::read(offset, e);

        if header.id != EntryId::Cie {
            return Err(CfiError::new(CfiErrorKind::BadCiePointer, offset));
        }

        let mut content = header.content;
        let version = content.read_u8().map_err(read)?;
        if !matches!(version, 1 | 3 | 4) {
            return Err(CfiError::new(CfiErrorKind::UnsupportedVersion, offset));
        }

        let augmentation = content
            .read_null_terminated_slice()
            .map_err(read)?
            .to_string_lossy()
            .into_owned();

        let mut pointers = *pointers;
        if version == 4 {
            pointers.address_size = content.read_u8().map_err(read)?;
            let _segment_size = content.read_u8().map_err(read)?;
        }

        let code_alignment_factor = content.read_uleb128().map_err(read)?;
        let data_alignment_factor = content.read_sleb128().map_err(read)?;
        let return_address_register = match version {
            1 => content.read_u8().map_err(read)?.into(),
            _ => content.read_uleb128_u16().map_err(read)?,
        };

        let mut augmentation_chars = augmentation.as_str();
        if let Some(rest) = augmentation_chars.strip_prefix("eh") {
            content.read_address(pointers.address_size).map_err(read)?;
            augmentation_chars = rest;
        }

        let mut fde_encoding = constants::DW_EH_PE_absptr;
        let mut lsda_encoding = None;
        let mut personality = None;
        let mut signal_frame = false;
        let has_augmentation_length = augmentation_chars.starts_with('z');

        if let Some(rest) = augmentation_chars.strip_prefix('z') {
            let len = content.read_uleb128().map_err(read)?;
            let len = usize::from_u64(len).map_err(read)?;
            let mut data = content.split(len).map_err(read)?;

            for c in rest.chars() {
                match c {
                    'L' => lsda_encoding = Some(DwEhPe(data.read_u8().map_err(read)?)),
                    'P' => {
                        let encoding = DwEhPe(data.read_u8().map_err(read)?);
                        personality = Some(pointers.read(&mut data, encoding, offset)?);
                    }
                    'R' => fde_encoding = DwEhPe(data.read_u8().map_err(read)?),
                    'S' => signal_frame = true,
                    // The remaining data is skipped by its length.
                    _ => break,
                }
            }
        } else if !augmentation_chars.is_empty() {
            return Err(CfiError::new(CfiErrorKind::UnsupportedAugmentation, offset));
        }

        let mut initial_row = UnwindRow::new(return_address_register, signal_frame);
        let cx = ProgramContext {
            entry_offset: offset,
            code_alignment_factor,
            data_alignment_factor,
            pointers: &pointers,
            address_encoding: fde_encoding,
        };
        execute(content, &cx, &mut initial_row, None, None)?;

        Ok(Self {
            offset,
            version,
            augmentation,
            address_size: pointers.address_size,
            code_alignment_factor,
            data_alignment_factor,
            return_address_register,
            fde_encoding,
            lsda_encoding,
            personality,
            has_augmentation_length,
            signal_frame,
            initial_row,
        })
    }

    /// The offset of this CIE within its section.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// The CIE format version (1, 3 or 4).
    pub fn version(&self) -> u8 {
        self.version
    }

    /// The augmentation string, such as `"zR"`.
    pub fn augmentation(&self) -> &str {
        &self.augmentation
    }

    /// The size of target addresses in bytes.
    pub fn address_size(&self) -> u8 {
        self.address_size
    }

    /// Factor applied to all location advances.
    pub fn code_alignment_factor(&self) -> u64 {
        self.code_alignment_factor
    }

    /// Factor applied to all factored register offsets.
    pub fn data_alignment_factor(&self) -> i64 {
        self.data_alignment_factor
    }

    /// The DWARF register number of the return address column.
    pub fn return_address_register(&self) -> u16 {
        self.return_address_register
    }

    /// The encoding of addresses in FDEs referencing this CIE.
    pub fn fde_encoding(&self) -> DwEhPe {
        self.fde_encoding
    }

    /// The address of the personality routine, if declared.
    ///
    /// Indirect encodings yield the address of the pointer to the routine.
    pub fn personality(&self) -> Option<u64> {
        self.personality
    }

    /// Returns `true` if functions using this CIE are signal trampolines.
    pub fn is_signal_frame(&self) -> bool {
        self.signal_frame
    }

    /// The rules in effect at the start of every function using this CIE.
    pub fn initial_row(&self) -> &UnwindRow {
        &self.initial_row
    }
}

/// A Frame Description Entry, describing the frame of one function.
///
/// FDEs are cheap to parse and are not cached. They borrow the section data.
#[derive(Clone, Debug)]
pub struct Fde<'d> {
    offset: u64,
    cie: Arc<Cie>,
    initial_address: u64,
    address_range: u64,
    lsda: Option<u64>,
    instructions: CfiReader<'d>,
}

impl<'d> Fde<'d> {
    pub(crate) fn parse(
        header: EntryHeader<'d>,
        cie: Arc<Cie>,
        pointers: &PointerReader<'d>,
    ) -> Result<Self, CfiError> {
        let offset = header.offset;
        let read = |e| CfiError::read(offset, e);

        let pointers = PointerReader {
            address_size: cie.address_size,
            ..*pointers
        };

        let encoding = cie.fde_encoding;
        if encoding.is_indirect() {
            return Err(CfiError::new(CfiErrorKind::UnsupportedEncoding, offset));
        }

        let mut content = header.content;
        let initial_address = pointers.read(&mut content, encoding, offset)?;
        let address_range = pointers.read_value(&mut content, encoding.format(), offset)?;

        let mut lsda = None;
        if cie.has_augmentation_length {
            let len = content.read_uleb128().map_err(read)?;
            let len = usize::from_u64(len).map_err(read)?;
            let mut data = content.split(len).map_err(read)?;
            if let Some(encoding) = cie.lsda_encoding.filter(|e| *e != constants::DW_EH_PE_omit) {
                lsda = Some(pointers.read(&mut data, encoding, offset)?);
            }
        }

        Ok(Self {
            offset,
            cie,
            initial_address,
            address_range,
            lsda,
            instructions: content,
        })
    }

    /// The offset of this FDE within its section.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// The CIE governing this FDE.
    pub fn cie(&self) -> &Cie {
        &self.cie
    }

    /// The instruction addresses covered by this FDE.
    pub fn pc_range(&self) -> Range<u64> {
        self.initial_address..self.initial_address.wrapping_add(self.address_range)
    }

    /// Determines whether the given address is covered by this FDE.
    pub fn contains(&self, address: u64) -> bool {
        self.pc_range().contains(&address)
    }

    /// The address of the language-specific data area, if declared.
    pub fn lsda(&self) -> Option<u64> {
        self.lsda
    }

    /// Replays the CIE and FDE programs up to `address`.
    ///
    /// The result is deterministic: evaluating the same address always yields an identical row.
    pub(crate) fn evaluate(
        &self,
        pointers: &PointerReader<'d>,
        address: u64,
    ) -> Result<UnwindRow, CfiError> {
        let pointers = PointerReader {
            address_size: self.cie.address_size,
            ..*pointers
        };

        let cx = ProgramContext {
            entry_offset: self.offset,
            code_alignment_factor: self.cie.code_alignment_factor,
            data_alignment_factor: self.cie.data_alignment_factor,
            pointers: &pointers,
            address_encoding: self.cie.fde_encoding,
        };

        let initial = &self.cie.initial_row;
        let mut row = initial.clone();
        row.set_range(self.pc_range());
        execute(self.instructions, &cx, &mut row, Some(initial), Some(address))?;

        Ok(row)
    }
}
