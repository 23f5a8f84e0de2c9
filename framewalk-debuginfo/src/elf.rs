//! Support for the Executable and Linkable Format, used on Linux.

use std::borrow::Cow;
use std::fmt;

use goblin::container::{Container, Ctx};
use goblin::elf::header::{self, Header};
use goblin::elf::program_header::PT_LOAD;
use goblin::elf::section_header::{
    SectionHeader, SHN_UNDEF, SHT_DYNSYM, SHT_NOBITS, SHT_REL, SHT_RELA, SHT_SYMTAB,
};
use goblin::elf::sym::{Sym, STT_FUNC};
use goblin::elf::{Elf, ProgramHeader, RelocSection, Symtab};
use goblin::strtab::Strtab;
use thiserror::Error;

use framewalk_common::Arch;

use crate::base::{Symbol, SymbolMap};

/// The size of a PLT stub in both the classic and the IBT (`.plt.sec`) layouts.
const PLT_ENTRY_SIZE: u64 = 16;

/// An error when dealing with [`ElfObject`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ElfError {
    /// The file header could not be read.
    #[error("invalid ELF header")]
    Header(#[source] goblin::error::Error),
    /// The header declares an unknown word size or byte order.
    #[error("unsupported ELF class or data encoding")]
    Encoding,
    /// A table required to locate sections could not be read.
    #[error("invalid ELF {0} table")]
    Table(&'static str, #[source] goblin::error::Error),
}

/// A section of an ELF file.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ElfSection<'data> {
    /// The section name without its leading dot.
    pub name: &'data str,
    /// The virtual address of the section.
    pub address: u64,
    /// The size of the section in memory.
    pub size: u64,
    /// The file contents of the section. Empty for `SHT_NOBITS` sections such as `.bss`.
    pub data: &'data [u8],
    /// Whether the section contains executable code.
    pub executable: bool,
}

impl ElfSection<'_> {
    /// The end address of this section, exclusive.
    pub fn end_address(&self) -> u64 {
        self.address.saturating_add(self.size)
    }

    /// Determines whether the given virtual address falls into this section.
    pub fn contains(&self, address: u64) -> bool {
        address >= self.address && address < self.end_address()
    }
}

/// A symbol table section together with the string table holding its names.
struct SymbolSection<'data> {
    symbols: Symtab<'data>,
    names: Strtab<'data>,
}

impl<'data> SymbolSection<'data> {
    fn parse(
        data: &'data [u8],
        headers: &[SectionHeader],
        header: &SectionHeader,
        ctx: Ctx,
    ) -> goblin::error::Result<Self> {
        header.check_size(data.len())?;
        let count = header.sh_size.checked_div(header.sh_entsize).unwrap_or(0);
        Ok(Self {
            symbols: Symtab::parse(data, header.sh_offset as usize, count as usize, ctx)?,
            names: string_table(data, headers, header.sh_link as usize)?,
        })
    }

    fn name(&self, symbol: &Sym) -> Option<&'data str> {
        self.names.get_at(symbol.st_name)
    }
}

fn string_table<'data>(
    data: &'data [u8],
    headers: &[SectionHeader],
    index: usize,
) -> goblin::error::Result<Strtab<'data>> {
    match headers.get(index) {
        Some(header) => {
            header.check_size(data.len())?;
            Strtab::parse(data, header.sh_offset as usize, header.sh_size as usize, 0)
        }
        None => Ok(Strtab::default()),
    }
}

fn container_context(header: &Header) -> Result<Ctx, ElfError> {
    let container = match header.e_ident[header::EI_CLASS] {
        header::ELFCLASS32 => Container::Little,
        header::ELFCLASS64 => Container::Big,
        _ => return Err(ElfError::Encoding),
    };

    let endian = match header.e_ident[header::EI_DATA] {
        header::ELFDATA2LSB => scroll::Endian::Little,
        header::ELFDATA2MSB => scroll::Endian::Big,
        _ => return Err(ElfError::Encoding),
    };

    Ok(Ctx::new(container, endian))
}

/// Drops a symbol or relocation table that cannot be read. The object stays usable for its
/// sections and call frame information.
fn optional<T>(table: &str, result: goblin::error::Result<T>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(error) => {
            tracing::debug!(%error, table, "ignoring unreadable ELF table");
            None
        }
    }
}

/// Executable and Linkable Format, used for executables and libraries on Linux.
///
/// Only the parts needed to symbolize and unwind code are read: the section headers, the static
/// and dynamic symbol tables, and the PLT relocations.
pub struct ElfObject<'data> {
    machine: u16,
    load_address: u64,
    sections: Vec<ElfSection<'data>>,
    symtab: Option<SymbolSection<'data>>,
    dynsym: Option<SymbolSection<'data>>,
    plt_relocations: Option<RelocSection<'data>>,
}

impl<'data> ElfObject<'data> {
    /// Tests whether the buffer could contain an ELF object.
    pub fn test(data: &[u8]) -> bool {
        data.starts_with(header::ELFMAG)
    }

    /// Parses an ELF object from the given slice.
    ///
    /// Fails if the program headers, section headers or section names are unreadable. Broken
    /// symbol or relocation tables are skipped, leaving the object without those symbols.
    pub fn parse(data: &'data [u8]) -> Result<Self, ElfError> {
        let header = Elf::parse_header(data).map_err(ElfError::Header)?;
        let ctx = container_context(&header)?;

        let segments =
            ProgramHeader::parse(data, header.e_phoff as usize, header.e_phnum as usize, ctx)
                .map_err(|e| ElfError::Table("program header", e))?;
        // Segments are sorted by address, so the first one marks where the image is linked.
        let load_address = segments
            .iter()
            .find(|segment| segment.p_type == PT_LOAD)
            .map_or(0, |segment| segment.p_vaddr);

        let headers =
            SectionHeader::parse(data, header.e_shoff as usize, header.e_shnum as usize, ctx)
                .map_err(|e| ElfError::Table("section header", e))?;
        let section_names = string_table(data, &headers, header.e_shstrndx as usize)
            .map_err(|e| ElfError::Table("section name", e))?;

        let mut object = ElfObject {
            machine: header.e_machine,
            load_address,
            sections: Vec::with_capacity(headers.len()),
            symtab: None,
            dynsym: None,
            plt_relocations: None,
        };

        for section in &headers {
            let Some(name) = section_names.get_at(section.sh_name) else {
                continue;
            };

            match section.sh_type {
                SHT_SYMTAB => {
                    object.symtab =
                        optional(name, SymbolSection::parse(data, &headers, section, ctx));
                }
                SHT_DYNSYM => {
                    object.dynsym =
                        optional(name, SymbolSection::parse(data, &headers, section, ctx));
                }
                SHT_RELA | SHT_REL if matches!(name, ".rela.plt" | ".rel.plt") => {
                    let relocations = section.check_size(data.len()).and_then(|()| {
                        RelocSection::parse(
                            data,
                            section.sh_offset as usize,
                            section.sh_size as usize,
                            section.sh_type == SHT_RELA,
                            ctx,
                        )
                    });
                    object.plt_relocations = optional(name, relocations);
                }
                _ => {}
            }

            object.sections.extend(read_section(data, name, section));
        }

        Ok(object)
    }

    /// The CPU architecture of this object, as specified in the ELF header.
    pub fn arch(&self) -> Arch {
        match self.machine {
            header::EM_386 => Arch::X86,
            header::EM_X86_64 => Arch::Amd64,
            _ => Arch::Unknown,
        }
    }

    /// The BFD target name of this object, such as `"elf64-x86-64"`.
    ///
    /// Returns `None` for machines other than i386 and x86-64.
    pub fn target_name(&self) -> Option<&'static str> {
        self.arch().target_name()
    }

    /// The virtual address of the first loadable segment.
    ///
    /// This is zero for shared libraries and position independent executables. Addresses of
    /// [`symbols`](Self::symbols) are relative to it, section addresses are not.
    pub fn load_address(&self) -> u64 {
        self.load_address
    }

    /// Determines whether this object has a static or dynamic symbol table.
    pub fn has_symbols(&self) -> bool {
        let has = |table: &Option<SymbolSection<'_>>| {
            table.as_ref().map_or(false, |t| !t.symbols.is_empty())
        };
        has(&self.symtab) || has(&self.dynsym)
    }

    /// Returns the function symbols defined in executable sections.
    ///
    /// Symbols come from `.symtab`, or from `.dynsym` in stripped objects. PLT stubs are not part
    /// of either table, see [`plt_symbols`](Self::plt_symbols).
    pub fn symbols(&self) -> impl Iterator<Item = Symbol<'data>> + '_ {
        let table = match &self.symtab {
            Some(symtab) if !symtab.symbols.is_empty() => Some(symtab),
            _ => self.dynsym.as_ref(),
        };

        table.into_iter().flat_map(move |table| {
            table
                .symbols
                .iter()
                .filter_map(move |symbol| self.function_symbol(table, &symbol))
        })
    }

    fn function_symbol(&self, table: &SymbolSection<'data>, symbol: &Sym) -> Option<Symbol<'data>> {
        if symbol.st_type() != STT_FUNC || symbol.st_shndx == SHN_UNDEF as usize {
            return None;
        }

        let vaddr = symbol.st_value;
        let in_code = self
            .sections
            .iter()
            .any(|section| section.executable && section.contains(vaddr));
        if !in_code {
            return None;
        }

        Some(Symbol {
            name: table.name(symbol).map(Cow::Borrowed),
            address: vaddr.checked_sub(self.load_address)?,
            size: symbol.st_size,
        })
    }

    /// Synthesizes `name@plt` symbols for the stubs in the procedure linkage table.
    ///
    /// Stubs are assumed to be 16 bytes each and in the order of the PLT relocations. In the
    /// classic layout, the first stub follows the 16-byte resolver entry at the start of `.plt`.
    /// When a separate `.plt.sec` section exists, it holds the stubs without a resolver entry.
    pub fn plt_symbols(&self) -> impl Iterator<Item = Symbol<'data>> + '_ {
        let first_stub = match (self.section("plt.sec"), self.section("plt")) {
            (Some(sec), _) => Some(sec.address),
            (None, Some(plt)) => Some(plt.address + PLT_ENTRY_SIZE),
            (None, None) => None,
        };

        let stubs = first_stub
            .zip(self.plt_relocations.as_ref())
            .zip(self.dynsym.as_ref());

        stubs
            .into_iter()
            .flat_map(move |((first_stub, relocations), dynsym)| {
                relocations
                    .iter()
                    .enumerate()
                    .filter_map(move |(index, relocation)| {
                        let import = dynsym.symbols.get(relocation.r_sym)?;
                        let name = dynsym.name(&import)?;
                        let vaddr = first_stub + index as u64 * PLT_ENTRY_SIZE;
                        Some(Symbol {
                            name: Some(Cow::Owned(format!("{name}@plt"))),
                            address: vaddr.checked_sub(self.load_address)?,
                            size: PLT_ENTRY_SIZE,
                        })
                    })
            })
    }

    /// Returns an ordered map of all function symbols, including synthesized PLT stubs.
    pub fn symbol_map(&self) -> SymbolMap<'data> {
        self.symbols().chain(self.plt_symbols()).collect()
    }

    /// Determines whether this object contains call frame information.
    pub fn has_unwind_info(&self) -> bool {
        self.section("eh_frame").is_some() || self.section("debug_frame").is_some()
    }

    /// Locates a section by its name, without the leading dot, such as `"eh_frame"`.
    ///
    /// Sections without file contents are returned with empty `data`, so that their address
    /// range can still be used.
    pub fn section(&self, name: &str) -> Option<ElfSection<'data>> {
        self.sections().find(|section| section.name == name)
    }

    /// Iterates all named sections of this object.
    pub fn sections(&self) -> impl Iterator<Item = ElfSection<'data>> + '_ {
        self.sections.iter().copied()
    }
}

fn read_section<'data>(
    data: &'data [u8],
    name: &'data str,
    header: &SectionHeader,
) -> Option<ElfSection<'data>> {
    let name = name.strip_prefix('.').unwrap_or(name);
    if name.is_empty() {
        return None;
    }

    let contents = if header.sh_type == SHT_NOBITS {
        &[][..]
    } else if header.sh_offset == 0 {
        // Stripped files keep headers of removed sections with a zero offset.
        return None;
    } else {
        data.get(header.sh_offset as usize..)?
            .get(..header.sh_size as usize)?
    };

    Some(ElfSection {
        name,
        address: header.sh_addr,
        size: header.sh_size,
        data: contents,
        executable: header.is_executable(),
    })
}

impl fmt::Debug for ElfObject<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ElfObject")
            .field("arch", &self.arch())
            .field("load_address", &format_args!("{:#x}", self.load_address))
            .field("sections", &self.sections.len())
            .field("has_symbols", &self.has_symbols())
            .finish()
    }
}
