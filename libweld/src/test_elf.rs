//! Builds small ELF images byte-by-byte for tests, using the same raw `object::elf` structs the
//! parser reads.
//!
//! Section layout convention: index 0 is the null section, then the caller's sections in the
//! order they were added, then the symbol table, its string table, and `.shstrtab`. Callers that
//! need to reference those trailing tables (e.g. for `sh_link` of a verdef section) compute the
//! indices from their user-section count.

use crate::elf::ElfSym;
use crate::elf::Rela;
use crate::elf::SectionHeader;
use crate::elf::U16;
use crate::elf::U32;
use crate::elf::U64;
use crate::input_data::MappedFile;
use object::LittleEndian as LE;
use std::path::PathBuf;

pub(crate) struct SecSpec {
    pub(crate) name: &'static str,
    pub(crate) sh_type: u32,
    pub(crate) sh_flags: u64,
    pub(crate) sh_link: u32,
    pub(crate) sh_info: u32,
    pub(crate) sh_addralign: u64,
    pub(crate) sh_entsize: u64,
    pub(crate) data: Vec<u8>,
}

impl SecSpec {
    pub(crate) fn progbits(name: &'static str, data: &[u8]) -> SecSpec {
        SecSpec {
            name,
            sh_type: object::elf::SHT_PROGBITS,
            sh_flags: u64::from(object::elf::SHF_ALLOC),
            sh_link: 0,
            sh_info: 0,
            sh_addralign: 1,
            sh_entsize: 0,
            data: data.to_vec(),
        }
    }

    pub(crate) fn text(name: &'static str, size: usize) -> SecSpec {
        SecSpec {
            sh_flags: u64::from(object::elf::SHF_ALLOC | object::elf::SHF_EXECINSTR),
            sh_addralign: 16,
            ..SecSpec::progbits(name, &vec![0u8; size])
        }
    }

    pub(crate) fn merge_strings(name: &'static str, data: &[u8]) -> SecSpec {
        SecSpec {
            sh_flags: u64::from(
                object::elf::SHF_ALLOC | object::elf::SHF_MERGE | object::elf::SHF_STRINGS,
            ),
            sh_entsize: 1,
            ..SecSpec::progbits(name, data)
        }
    }
}

pub(crate) struct SymSpec {
    name: String,
    st_info: u8,
    st_other: u8,
    st_shndx: u16,
    st_value: u64,
    st_size: u64,
}

impl SymSpec {
    fn new(name: &str, bind: u8, st_type: u8, shndx: u16, value: u64, size: u64) -> SymSpec {
        SymSpec {
            name: name.to_owned(),
            st_info: (bind << 4) | st_type,
            st_other: 0,
            st_shndx: shndx,
            st_value: value,
            st_size: size,
        }
    }

    pub(crate) fn local(name: &str, shndx: u16, value: u64) -> SymSpec {
        Self::new(name, object::elf::STB_LOCAL, object::elf::STT_NOTYPE, shndx, value, 0)
    }

    pub(crate) fn section_sym(shndx: u16) -> SymSpec {
        Self::new("", object::elf::STB_LOCAL, object::elf::STT_SECTION, shndx, 0, 0)
    }

    pub(crate) fn file_sym(name: &str) -> SymSpec {
        Self::new(
            name,
            object::elf::STB_LOCAL,
            object::elf::STT_FILE,
            object::elf::SHN_ABS,
            0,
            0,
        )
    }

    pub(crate) fn global(name: &str, shndx: u16, value: u64) -> SymSpec {
        Self::new(name, object::elf::STB_GLOBAL, object::elf::STT_FUNC, shndx, value, 0)
    }

    pub(crate) fn weak(name: &str, shndx: u16, value: u64) -> SymSpec {
        Self::new(name, object::elf::STB_WEAK, object::elf::STT_FUNC, shndx, value, 0)
    }

    pub(crate) fn undef(name: &str) -> SymSpec {
        Self::new(name, object::elf::STB_GLOBAL, object::elf::STT_NOTYPE, 0, 0, 0)
    }

    pub(crate) fn common(name: &str, align: u64, size: u64) -> SymSpec {
        Self::new(
            name,
            object::elf::STB_GLOBAL,
            object::elf::STT_OBJECT,
            object::elf::SHN_COMMON,
            align,
            size,
        )
    }

    pub(crate) fn visibility(mut self, st_other: u8) -> SymSpec {
        self.st_other = st_other;
        self
    }
}

pub(crate) struct TestElf {
    e_type: u16,
    e_machine: u16,
    dynsym: bool,
    extended_counts: bool,
    sections: Vec<SecSpec>,
    syms: Vec<(SymSpec, u32)>,
    num_locals: usize,
    strtab: Vec<u8>,
}

impl TestElf {
    pub(crate) fn object() -> TestElf {
        TestElf {
            e_type: object::elf::ET_REL,
            e_machine: object::elf::EM_X86_64,
            dynsym: false,
            extended_counts: false,
            sections: Vec::new(),
            syms: Vec::new(),
            num_locals: 0,
            strtab: vec![0],
        }
    }

    pub(crate) fn dso() -> TestElf {
        TestElf {
            e_type: object::elf::ET_DYN,
            dynsym: true,
            ..TestElf::object()
        }
    }

    pub(crate) fn machine(mut self, e_machine: u16) -> TestElf {
        self.e_machine = e_machine;
        self
    }

    /// Store the section and symbol counts in section header 0, as files with more than 0xffff
    /// sections do.
    pub(crate) fn extended_counts(mut self) -> TestElf {
        self.extended_counts = true;
        self
    }

    pub(crate) fn section(mut self, spec: SecSpec) -> TestElf {
        self.sections.push(spec);
        self
    }

    /// Adds a string to the symbol string table, returning its offset.
    pub(crate) fn string(&mut self, s: &str) -> u32 {
        let offset = self.strtab.len() as u32;
        self.strtab.extend_from_slice(s.as_bytes());
        self.strtab.push(0);
        offset
    }

    pub(crate) fn symbol(mut self, spec: SymSpec) -> TestElf {
        let name_off = if spec.name.is_empty() {
            0
        } else {
            let name = spec.name.clone();
            self.string(&name)
        };
        if spec.st_info >> 4 == object::elf::STB_LOCAL {
            assert_eq!(self.num_locals, self.syms.len(), "locals must come first");
            self.num_locals += 1;
        }
        self.syms.push((spec, name_off));
        self
    }

    /// Index the symbol string table will land at, given the sections added so far.
    pub(crate) fn strtab_index(&self) -> u32 {
        self.sections.len() as u32 + 2
    }

    pub(crate) fn build(self) -> Vec<u8> {
        let e = LE;

        let mut symtab_data = Vec::new();
        symtab_data.extend_from_slice(object::bytes_of(&ElfSym {
            st_name: U32::new(e, 0),
            st_info: 0,
            st_other: 0,
            st_shndx: U16::new(e, 0),
            st_value: U64::new(e, 0),
            st_size: U64::new(e, 0),
        }));
        for (spec, name_off) in &self.syms {
            symtab_data.extend_from_slice(object::bytes_of(&ElfSym {
                st_name: U32::new(e, *name_off),
                st_info: spec.st_info,
                st_other: spec.st_other,
                st_shndx: U16::new(e, spec.st_shndx),
                st_value: U64::new(e, spec.st_value),
                st_size: U64::new(e, spec.st_size),
            }));
        }

        let strtab_index = self.strtab_index();
        let first_global = self.num_locals as u32 + 1;

        let mut metas: Vec<(&str, u32, u64, u32, u32, u64, u64, Vec<u8>)> = Vec::new();
        metas.push(("", object::elf::SHT_NULL, 0, 0, 0, 0, 0, Vec::new()));
        for spec in self.sections {
            metas.push((
                spec.name,
                spec.sh_type,
                spec.sh_flags,
                spec.sh_link,
                spec.sh_info,
                spec.sh_addralign,
                spec.sh_entsize,
                spec.data,
            ));
        }
        metas.push((
            if self.dynsym { ".dynsym" } else { ".symtab" },
            if self.dynsym {
                object::elf::SHT_DYNSYM
            } else {
                object::elf::SHT_SYMTAB
            },
            0,
            strtab_index,
            first_global,
            8,
            size_of::<ElfSym>() as u64,
            symtab_data,
        ));
        metas.push((
            if self.dynsym { ".dynstr" } else { ".strtab" },
            object::elf::SHT_STRTAB,
            0,
            0,
            0,
            1,
            0,
            self.strtab,
        ));

        // .shstrtab must know its own name, so build its contents before pushing it.
        let mut shstrtab = vec![0u8];
        let mut name_offsets = Vec::new();
        for (name, ..) in &metas {
            if name.is_empty() {
                name_offsets.push(0);
            } else {
                name_offsets.push(shstrtab.len() as u32);
                shstrtab.extend_from_slice(name.as_bytes());
                shstrtab.push(0);
            }
        }
        let shstrtab_name_off = shstrtab.len() as u32;
        shstrtab.extend_from_slice(b".shstrtab\0");
        metas.push((".shstrtab", object::elf::SHT_STRTAB, 0, 0, 0, 1, 0, shstrtab));
        name_offsets.push(shstrtab_name_off);

        // Lay out: file header, section contents, then the section header table.
        let mut image = vec![0u8; size_of::<crate::elf::FileHeader>()];
        let mut offsets = Vec::new();
        for (_, sh_type, _, _, _, _, _, data) in &metas {
            while image.len() % 8 != 0 {
                image.push(0);
            }
            offsets.push(image.len() as u64);
            if *sh_type != object::elf::SHT_NOBITS {
                image.extend_from_slice(data);
            }
        }
        while image.len() % 8 != 0 {
            image.push(0);
        }
        let e_shoff = image.len() as u64;

        let num_sections = metas.len();
        let shstrndx = num_sections - 1;

        for (i, (_, sh_type, sh_flags, sh_link, sh_info, sh_addralign, sh_entsize, data)) in
            metas.iter().enumerate()
        {
            let mut shdr = SectionHeader {
                sh_name: U32::new(e, name_offsets[i]),
                sh_type: U32::new(e, *sh_type),
                sh_flags: U64::new(e, *sh_flags),
                sh_addr: U64::new(e, 0),
                sh_offset: U64::new(e, offsets[i]),
                sh_size: U64::new(e, data.len() as u64),
                sh_link: U32::new(e, *sh_link),
                sh_info: U32::new(e, *sh_info),
                sh_addralign: U64::new(e, *sh_addralign),
                sh_entsize: U64::new(e, *sh_entsize),
            };
            if i == 0 && self.extended_counts {
                shdr.sh_size = U64::new(e, num_sections as u64);
                shdr.sh_link = U32::new(e, shstrndx as u32);
            }
            image.extend_from_slice(object::bytes_of(&shdr));
        }

        let ehdr = crate::elf::FileHeader {
            e_ident: object::elf::Ident {
                magic: *b"\x7fELF",
                class: object::elf::ELFCLASS64,
                data: object::elf::ELFDATA2LSB,
                version: object::elf::EV_CURRENT,
                os_abi: object::elf::ELFOSABI_SYSV,
                abi_version: 0,
                padding: [0; 7],
            },
            e_type: U16::new(e, self.e_type),
            e_machine: U16::new(e, self.e_machine),
            e_version: U32::new(e, u32::from(object::elf::EV_CURRENT)),
            e_entry: U64::new(e, 0),
            e_phoff: U64::new(e, 0),
            e_shoff: U64::new(e, e_shoff),
            e_flags: U32::new(e, 0),
            e_ehsize: U16::new(e, size_of::<crate::elf::FileHeader>() as u16),
            e_phentsize: U16::new(e, 0),
            e_phnum: U16::new(e, 0),
            e_shentsize: U16::new(e, size_of::<SectionHeader>() as u16),
            e_shnum: U16::new(e, if self.extended_counts { 0 } else { num_sections as u16 }),
            e_shstrndx: U16::new(
                e,
                if self.extended_counts {
                    object::elf::SHN_XINDEX
                } else {
                    shstrndx as u16
                },
            ),
        };
        image[..size_of::<crate::elf::FileHeader>()].copy_from_slice(object::bytes_of(&ehdr));

        image
    }
}

/// Serializes RELA entries for a relocation section.
pub(crate) fn rela_data(rels: &[(u64, u32, u32, i64)]) -> Vec<u8> {
    let e = LE;
    let mut data = Vec::new();
    for &(r_offset, r_type, r_sym, r_addend) in rels {
        data.extend_from_slice(object::bytes_of(&Rela {
            r_offset: U64::new(e, r_offset),
            r_info: U64::new(e, (u64::from(r_sym) << 32) | u64::from(r_type)),
            r_addend: object::I64::<LE>::new(e, r_addend),
        }));
    }
    data
}

pub(crate) fn rela_section(target: u32, symtab: u32, rels: &[(u64, u32, u32, i64)]) -> SecSpec {
    SecSpec {
        name: ".rela",
        sh_type: object::elf::SHT_RELA,
        sh_flags: 0,
        sh_link: symtab,
        sh_info: target,
        sh_addralign: 8,
        sh_entsize: size_of::<Rela>() as u64,
        data: rela_data(rels),
    }
}

pub(crate) fn mapped<'data>(data: &'data [u8], name: &str, priority: u32) -> MappedFile<'data> {
    MappedFile {
        data,
        name: PathBuf::from(name),
        given_fullpath: true,
        archive_name: None,
        priority,
        exclude_libs: false,
    }
}

pub(crate) fn mapped_member<'data>(
    data: &'data [u8],
    archive: &str,
    name: &str,
    priority: u32,
) -> MappedFile<'data> {
    MappedFile {
        archive_name: Some(PathBuf::from(archive)),
        ..mapped(data, name, priority)
    }
}
