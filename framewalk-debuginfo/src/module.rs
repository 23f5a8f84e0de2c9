//! Modules mapped into the address space of a debugged process.

use std::fmt;
use std::ops::Range;

use once_cell::sync::OnceCell;

use framewalk_cfi::{CfiError, CfiSection, CfiSectionKind, UnwindRow};
use framewalk_common::Arch;

use crate::base::SymbolMap;
use crate::elf::{ElfError, ElfObject, ElfSection};

/// Sections whose extent makes up the code bounds of a module.
const CODE_SECTIONS: &[&str] = &["plt", "plt.sec", "text", "bss"];

/// The result of resolving an address to a symbol.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct SymbolLookup {
    /// The name of the symbol covering the address.
    pub name: String,
    /// The runtime address of the start of the symbol.
    pub address: u64,
    /// The offset of the looked up address from the start of the symbol.
    pub offset: u64,
    /// The name of the module containing the symbol.
    pub module: String,
}

impl fmt::Display for SymbolLookup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}+{:#x}", self.name, self.offset)
    }
}

/// An object file mapped into the debuggee at a load bias.
///
/// All addresses accepted and returned by this type are runtime addresses. The load bias is the
/// difference between runtime addresses and the virtual addresses declared in the object file,
/// which is zero for non-relocated executables.
///
/// The symbol map and the call frame information sections are built on first use and shared by
/// all threads.
pub struct SymbolFile<'data> {
    name: String,
    object: ElfObject<'data>,
    bias: u64,
    symbols: OnceCell<SymbolMap<'data>>,
    debug_frame: OnceCell<Option<CfiSection<'data>>>,
    eh_frame: OnceCell<Option<CfiSection<'data>>>,
}

impl<'data> SymbolFile<'data> {
    /// Creates a module from a parsed object mapped at the given load bias.
    pub fn new<S: Into<String>>(name: S, object: ElfObject<'data>, bias: u64) -> Self {
        Self {
            name: name.into(),
            object,
            bias,
            symbols: OnceCell::new(),
            debug_frame: OnceCell::new(),
            eh_frame: OnceCell::new(),
        }
    }

    /// Parses an ELF object and creates a module mapped at the given load bias.
    pub fn parse<S: Into<String>>(name: S, data: &'data [u8], bias: u64) -> Result<Self, ElfError> {
        Ok(Self::new(name, ElfObject::parse(data)?, bias))
    }

    /// The name of this module, usually its path.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The underlying object file.
    pub fn object(&self) -> &ElfObject<'data> {
        &self.object
    }

    /// The CPU architecture of this module.
    pub fn arch(&self) -> Arch {
        self.object.arch()
    }

    /// The difference between runtime addresses and the object's virtual addresses.
    pub fn bias(&self) -> u64 {
        self.bias
    }

    /// Translates a runtime address to a virtual address of the object file.
    pub fn to_vaddr(&self, address: u64) -> u64 {
        address.wrapping_sub(self.bias)
    }

    fn to_runtime(&self, vaddr: u64) -> u64 {
        vaddr.wrapping_add(self.bias)
    }

    /// The runtime range spanned by the code of this module, from `.plt` or `.text` to the end
    /// of `.bss`.
    pub fn bounds(&self) -> Option<Range<u64>> {
        let mut sections = self
            .object
            .sections()
            .filter(|section| CODE_SECTIONS.contains(&section.name));

        let first = sections.next()?;
        let (start, end) = sections.fold((first.address, first.end_address()), |(s, e), sec| {
            (s.min(sec.address), e.max(sec.end_address()))
        });

        Some(self.to_runtime(start)..self.to_runtime(end))
    }

    /// Determines whether the given runtime address falls into the code bounds of this module.
    pub fn contains(&self, address: u64) -> bool {
        self.bounds().map_or(false, |range| range.contains(&address))
    }

    /// The runtime range of a section, by name without the leading dot.
    pub fn section_range(&self, name: &str) -> Option<Range<u64>> {
        let section = self.object.section(name)?;
        Some(self.to_runtime(section.address)..self.to_runtime(section.end_address()))
    }

    /// Returns up to `len` bytes of file-backed code or data starting at the runtime `address`.
    ///
    /// The result is shorter than `len` if the section ends earlier. Returns `None` if the
    /// address is not backed by the file.
    pub fn code_bytes(&self, address: u64, len: usize) -> Option<&'data [u8]> {
        let vaddr = self.to_vaddr(address);
        let section = self
            .object
            .sections()
            .find(|section| !section.data.is_empty() && section.contains(vaddr))?;

        let start = (vaddr - section.address) as usize;
        let data = section.data.get(start..)?;
        Some(&data[..len.min(data.len())])
    }

    /// The ordered function symbols of this module, including PLT stubs.
    pub fn symbol_map(&self) -> &SymbolMap<'data> {
        self.symbols.get_or_init(|| self.object.symbol_map())
    }

    /// Resolves a runtime address to the function symbol covering it.
    pub fn lookup(&self, address: u64) -> Option<SymbolLookup> {
        let relative = self
            .to_vaddr(address)
            .checked_sub(self.object.load_address())?;
        let symbol = self.symbol_map().lookup(relative)?;

        let start = self.to_runtime(symbol.address + self.object.load_address());
        Some(SymbolLookup {
            name: symbol.name().unwrap_or("<unknown>").to_owned(),
            address: start,
            offset: address.wrapping_sub(start),
            module: self.name.clone(),
        })
    }

    /// Returns the call frame information section of the given kind, if present.
    pub fn cfi_section(&self, kind: CfiSectionKind) -> Option<&CfiSection<'data>> {
        let cell = match kind {
            CfiSectionKind::DebugFrame => &self.debug_frame,
            CfiSectionKind::EhFrame => &self.eh_frame,
        };

        cell.get_or_init(|| self.load_cfi(kind)).as_ref()
    }

    fn load_cfi(&self, kind: CfiSectionKind) -> Option<CfiSection<'data>> {
        let address_size = self.arch().pointer_size()?;
        let section = self.object.section(kind.section_name())?;
        tracing::trace!(module = %self.name, section = %kind, "loading call frame information");

        let mut cfi = CfiSection::new(kind, section.data, section.address, address_size as u8)
            .with_file(self.name.as_str());
        if let Some(text) = self.object.section("text") {
            cfi = cfi.with_text_address(text.address);
        }
        if let Some(got) = self.object.section("got") {
            cfi = cfi.with_data_address(got.address);
        }

        Some(cfi)
    }

    /// Computes the call frame rules in effect at the runtime `address`.
    ///
    /// The returned row covers virtual addresses of the object file. Returns `Ok(None)` if the
    /// section is missing or has no entry for the address.
    pub fn unwind_row(
        &self,
        kind: CfiSectionKind,
        address: u64,
    ) -> Result<Option<UnwindRow>, CfiError> {
        match self.cfi_section(kind) {
            Some(cfi) => cfi.unwind_row(self.to_vaddr(address)),
            None => Ok(None),
        }
    }

    /// Returns the section containing the runtime `address`, if any.
    pub fn section_at(&self, address: u64) -> Option<ElfSection<'data>> {
        let vaddr = self.to_vaddr(address);
        self.object.sections().find(|section| section.contains(vaddr))
    }
}

impl fmt::Debug for SymbolFile<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SymbolFile")
            .field("name", &self.name)
            .field("arch", &self.arch())
            .field("bias", &format_args!("{:#x}", self.bias))
            .field("bounds", &self.bounds())
            .finish()
    }
}
