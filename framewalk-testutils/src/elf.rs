const SHT_PROGBITS: u32 = 1;
const SHT_SYMTAB: u32 = 2;
const SHT_STRTAB: u32 = 3;
const SHT_RELA: u32 = 4;
const SHT_NOBITS: u32 = 8;
const SHT_REL: u32 = 9;
const SHT_DYNSYM: u32 = 11;

/// Section flag for writable data.
pub const SHF_WRITE: u64 = 0x1;
/// Section flag for sections occupying memory at runtime.
pub const SHF_ALLOC: u64 = 0x2;
/// Section flag for executable code.
pub const SHF_EXECINSTR: u64 = 0x4;

const STT_FUNC: u8 = 2;
const STB_GLOBAL: u8 = 1;
const R_JUMP_SLOT: u32 = 7;

#[derive(Clone, Debug)]
struct SectionSpec {
    name: String,
    kind: u32,
    flags: u64,
    address: u64,
    data: Vec<u8>,
    size: u64,
    link: u32,
    info: u32,
    entsize: u64,
}

#[derive(Clone, Debug)]
struct FunctionSpec {
    name: String,
    address: u64,
    size: u64,
}

/// Writes small ELF images for tests.
///
/// The image has a single `PT_LOAD` segment at the load address, the sections added by the test,
/// a `.symtab` with function symbols, and optionally a PLT relocation table with its `.dynsym`.
///
/// ```
/// use framewalk_testutils::{ElfBuilder, SHF_ALLOC, SHF_EXECINSTR};
///
/// let image = ElfBuilder::new(true)
///     .section(".text", 0x1000, SHF_ALLOC | SHF_EXECINSTR, &[0x90; 32])
///     .function("main", 0x1000, 32)
///     .build();
/// assert_eq!(&image[..4], b"\x7fELF");
/// ```
#[derive(Clone, Debug)]
pub struct ElfBuilder {
    is_64: bool,
    load_address: u64,
    sections: Vec<SectionSpec>,
    functions: Vec<FunctionSpec>,
    plt_imports: Vec<String>,
}

impl ElfBuilder {
    /// Starts an x86-64 image when `is_64` is set, an i386 image otherwise.
    pub fn new(is_64: bool) -> Self {
        Self {
            is_64,
            load_address: 0,
            sections: Vec::new(),
            functions: Vec::new(),
            plt_imports: Vec::new(),
        }
    }

    /// Sets the virtual address of the first loadable byte.
    pub fn load_address(mut self, address: u64) -> Self {
        self.load_address = address;
        self
    }

    /// Adds a section with contents.
    pub fn section(mut self, name: &str, address: u64, flags: u64, data: &[u8]) -> Self {
        self.sections.push(SectionSpec {
            name: name.to_owned(),
            kind: SHT_PROGBITS,
            flags,
            address,
            data: data.to_vec(),
            size: data.len() as u64,
            link: 0,
            info: 0,
            entsize: 0,
        });
        self
    }

    /// Adds a section without file contents, such as `.bss`.
    pub fn nobits(mut self, name: &str, address: u64, size: u64) -> Self {
        self.sections.push(SectionSpec {
            name: name.to_owned(),
            kind: SHT_NOBITS,
            flags: SHF_ALLOC | SHF_WRITE,
            address,
            data: Vec::new(),
            size,
            link: 0,
            info: 0,
            entsize: 0,
        });
        self
    }

    /// Adds a global function symbol. It is attributed to the section containing `address`.
    pub fn function(mut self, name: &str, address: u64, size: u64) -> Self {
        self.functions.push(FunctionSpec {
            name: name.to_owned(),
            address,
            size,
        });
        self
    }

    /// Adds an imported function with a PLT slot, in PLT order.
    pub fn plt_import(mut self, name: &str) -> Self {
        self.plt_imports.push(name.to_owned());
        self
    }

    fn word(&self, out: &mut Vec<u8>, value: u64) {
        if self.is_64 {
            out.extend_from_slice(&value.to_le_bytes());
        } else {
            out.extend_from_slice(&(value as u32).to_le_bytes());
        }
    }

    fn symbol(&self, out: &mut Vec<u8>, name: u32, value: u64, size: u64, shndx: u16) {
        let info = (STB_GLOBAL << 4) | STT_FUNC;
        out.extend_from_slice(&name.to_le_bytes());
        if self.is_64 {
            out.push(info);
            out.push(0);
            out.extend_from_slice(&shndx.to_le_bytes());
            out.extend_from_slice(&value.to_le_bytes());
            out.extend_from_slice(&size.to_le_bytes());
        } else {
            out.extend_from_slice(&(value as u32).to_le_bytes());
            out.extend_from_slice(&(size as u32).to_le_bytes());
            out.push(info);
            out.push(0);
            out.extend_from_slice(&shndx.to_le_bytes());
        }
    }

    fn symbol_size(&self) -> u64 {
        if self.is_64 {
            24
        } else {
            16
        }
    }

    fn string_table(names: &[&str]) -> (Vec<u8>, Vec<u32>) {
        let mut table = vec![0u8];
        let mut offsets = Vec::new();
        for name in names {
            offsets.push(table.len() as u32);
            table.extend_from_slice(name.as_bytes());
            table.push(0);
        }
        (table, offsets)
    }

    fn push_table(&self, sections: &mut Vec<SectionSpec>, name: &str, kind: u32, data: Vec<u8>) {
        sections.push(SectionSpec {
            name: name.to_owned(),
            kind,
            flags: 0,
            address: 0,
            size: data.len() as u64,
            data,
            link: 0,
            info: 0,
            entsize: 0,
        });
    }

    /// Serializes the image.
    pub fn build(self) -> Vec<u8> {
        let mut sections = self.sections.clone();

        // Index 0 is the null section, user sections follow.
        let section_index = |address: u64| {
            self.sections
                .iter()
                .position(|s| address >= s.address && address < s.address + s.size)
                .map_or(0, |index| index as u16 + 1)
        };

        let names: Vec<&str> = self.functions.iter().map(|f| f.name.as_str()).collect();
        let (strtab, name_offsets) = Self::string_table(&names);
        let mut symtab = Vec::new();
        self.symbol(&mut symtab, 0, 0, 0, 0);
        for (function, name) in self.functions.iter().zip(&name_offsets) {
            let shndx = section_index(function.address);
            self.symbol(&mut symtab, *name, function.address, function.size, shndx);
        }

        let symtab_index = sections.len() as u32 + 1;
        self.push_table(&mut sections, ".symtab", SHT_SYMTAB, symtab);
        self.push_table(&mut sections, ".strtab", SHT_STRTAB, strtab);
        let symtab = symtab_index as usize - 1;
        sections[symtab].link = symtab_index + 1;
        sections[symtab].entsize = self.symbol_size();

        if !self.plt_imports.is_empty() {
            let names: Vec<&str> = self.plt_imports.iter().map(String::as_str).collect();
            let (dynstr, name_offsets) = Self::string_table(&names);
            let mut dynsym = Vec::new();
            self.symbol(&mut dynsym, 0, 0, 0, 0);
            for name in &name_offsets {
                self.symbol(&mut dynsym, *name, 0, 0, 0);
            }

            let got_address = self
                .sections
                .iter()
                .find(|s| s.name == ".got.plt" || s.name == ".got")
                .map_or(0, |s| s.address);

            let mut relocs = Vec::new();
            for index in 0..self.plt_imports.len() as u64 {
                let symbol = index + 1;
                if self.is_64 {
                    let slot = got_address + 24 + index * 8;
                    relocs.extend_from_slice(&slot.to_le_bytes());
                    let info = (symbol << 32) | u64::from(R_JUMP_SLOT);
                    relocs.extend_from_slice(&info.to_le_bytes());
                    relocs.extend_from_slice(&0i64.to_le_bytes());
                } else {
                    let slot = got_address + 12 + index * 4;
                    relocs.extend_from_slice(&(slot as u32).to_le_bytes());
                    let info = ((symbol as u32) << 8) | R_JUMP_SLOT;
                    relocs.extend_from_slice(&info.to_le_bytes());
                }
            }

            let dynsym_index = sections.len() as u32 + 1;
            self.push_table(&mut sections, ".dynsym", SHT_DYNSYM, dynsym);
            self.push_table(&mut sections, ".dynstr", SHT_STRTAB, dynstr);
            sections[dynsym_index as usize - 1].link = dynsym_index + 1;
            sections[dynsym_index as usize - 1].entsize = self.symbol_size();

            let (name, kind, entsize) = if self.is_64 {
                (".rela.plt", SHT_RELA, 24)
            } else {
                (".rel.plt", SHT_REL, 8)
            };
            self.push_table(&mut sections, name, kind, relocs);
            if let Some(rel) = sections.last_mut() {
                rel.link = dynsym_index;
                rel.entsize = entsize;
                rel.flags = SHF_ALLOC;
            }
        }

        let section_names: Vec<&str> = sections
            .iter()
            .map(|s| s.name.as_str())
            .chain(Some(".shstrtab"))
            .collect();
        let (shstrtab, shstr_offsets) = Self::string_table(&section_names);
        self.push_table(&mut sections, ".shstrtab", SHT_STRTAB, shstrtab);

        let (ehsize, phentsize, shentsize) = if self.is_64 {
            (64u64, 56u64, 64u64)
        } else {
            (52, 32, 40)
        };

        // Section contents follow the header and the single program header.
        let mut body = Vec::new();
        let mut offsets = Vec::new();
        let data_start = ehsize + phentsize;
        for section in &sections {
            while (data_start as usize + body.len()) % 8 != 0 {
                body.push(0);
            }
            offsets.push(data_start + body.len() as u64);
            body.extend_from_slice(&section.data);
        }
        while (data_start as usize + body.len()) % 8 != 0 {
            body.push(0);
        }
        let shoff = data_start + body.len() as u64;

        let mut out = Vec::new();
        out.extend_from_slice(b"\x7fELF");
        out.push(if self.is_64 { 2 } else { 1 });
        out.extend_from_slice(&[1, 1, 0]);
        out.extend_from_slice(&[0; 8]);
        out.extend_from_slice(&3u16.to_le_bytes());
        let machine: u16 = if self.is_64 { 62 } else { 3 };
        out.extend_from_slice(&machine.to_le_bytes());
        out.extend_from_slice(&1u32.to_le_bytes());
        self.word(&mut out, self.load_address);
        self.word(&mut out, ehsize);
        self.word(&mut out, shoff);
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&(ehsize as u16).to_le_bytes());
        out.extend_from_slice(&(phentsize as u16).to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes());
        out.extend_from_slice(&(shentsize as u16).to_le_bytes());
        out.extend_from_slice(&(sections.len() as u16 + 1).to_le_bytes());
        out.extend_from_slice(&(sections.len() as u16).to_le_bytes());

        // PT_LOAD, readable and executable, covering the whole file.
        let file_size = shoff;
        if self.is_64 {
            out.extend_from_slice(&1u32.to_le_bytes());
            out.extend_from_slice(&5u32.to_le_bytes());
            out.extend_from_slice(&0u64.to_le_bytes());
            out.extend_from_slice(&self.load_address.to_le_bytes());
            out.extend_from_slice(&self.load_address.to_le_bytes());
            out.extend_from_slice(&file_size.to_le_bytes());
            out.extend_from_slice(&file_size.to_le_bytes());
            out.extend_from_slice(&0x1000u64.to_le_bytes());
        } else {
            out.extend_from_slice(&1u32.to_le_bytes());
            out.extend_from_slice(&0u32.to_le_bytes());
            out.extend_from_slice(&(self.load_address as u32).to_le_bytes());
            out.extend_from_slice(&(self.load_address as u32).to_le_bytes());
            out.extend_from_slice(&(file_size as u32).to_le_bytes());
            out.extend_from_slice(&(file_size as u32).to_le_bytes());
            out.extend_from_slice(&5u32.to_le_bytes());
            out.extend_from_slice(&0x1000u32.to_le_bytes());
        }

        out.extend_from_slice(&body);

        // The null section header.
        out.extend(std::iter::repeat(0).take(shentsize as usize));
        for ((section, offset), name) in sections.iter().zip(&offsets).zip(&shstr_offsets) {
            out.extend_from_slice(&name.to_le_bytes());
            out.extend_from_slice(&section.kind.to_le_bytes());
            self.word(&mut out, section.flags);
            self.word(&mut out, section.address);
            self.word(&mut out, *offset);
            self.word(&mut out, section.size);
            out.extend_from_slice(&section.link.to_le_bytes());
            out.extend_from_slice(&section.info.to_le_bytes());
            self.word(&mut out, 1);
            self.word(&mut out, section.entsize);
        }

        out
    }
}
