//! Zero-copy structural access to an ELF image. Inputs are always ELF64 little-endian; the raw
//! struct definitions and constants come from the `object` crate. Everything handed out borrows
//! from the mapped file, which the driver guarantees outlives all parsed state.

use crate::arch::Architecture;
use crate::bail;
use crate::ensure;
use crate::error::Result;
use anyhow::Context as _;
use anyhow::anyhow;
use object::LittleEndian;
use object::read::elf::Sym as _;

pub type FileHeader = object::elf::FileHeader64<LittleEndian>;
pub type ProgramHeader = object::elf::ProgramHeader64<LittleEndian>;
pub type SectionHeader = object::elf::SectionHeader64<LittleEndian>;
pub type ElfSym = object::elf::Sym64<LittleEndian>;
pub type DynamicEntry = object::elf::Dyn64<LittleEndian>;
pub type Rela = object::elf::Rela64<LittleEndian>;
pub type RelEntry = object::elf::Rel64<LittleEndian>;
pub type NoteHeader = object::elf::NoteHeader64<LittleEndian>;
pub type Verdef = object::elf::Verdef<LittleEndian>;
pub type Verdaux = object::elf::Verdaux<LittleEndian>;
pub type Versym = object::elf::Versym<LittleEndian>;
pub type U16 = object::U16<LittleEndian>;
pub type U32 = object::U32<LittleEndian>;
pub type U64 = object::U64<LittleEndian>;

pub(crate) const ELF_MAGIC: &[u8] = b"\x7fELF";

/// Section names with special meaning to the parser.
pub(crate) mod secnames {
    pub(crate) const NOTE_GNU_STACK: &[u8] = b".note.GNU-stack";
    pub(crate) const NOTE_GNU_PROPERTY: &[u8] = b".note.gnu.property";
    pub(crate) const NOTE_GNU_BUILD_ID: &[u8] = b".note.gnu.build-id";
    pub(crate) const COMMENT: &[u8] = b".comment";
    pub(crate) const EH_FRAME: &[u8] = b".eh_frame";
    pub(crate) const GOT2: &[u8] = b".got2";
    pub(crate) const DEBUG_INFO: &[u8] = b".debug_info";
    pub(crate) const DEBUG_GNU_PUBNAMES: &[u8] = b".debug_gnu_pubnames";
    pub(crate) const DEBUG_GNU_PUBTYPES: &[u8] = b".debug_gnu_pubtypes";
    pub(crate) const DEBUG_TYPES: &[u8] = b".debug_types";
    pub(crate) const COMMON: &[u8] = b".common";
    pub(crate) const TLS_COMMON: &[u8] = b".tls_common";

    /// Sections emitted by old glibc i386 CRT files and by ICC that we drop for compatibility.
    pub(crate) const LEGACY_LINKONCE_NAMES: &[&[u8]] = &[
        b".gnu.linkonce.t.__x86.get_pc_thunk.bx",
        b".gnu.linkonce.t.__i686.get_pc_thunk.bx",
        b".gnu.linkonce.d.DW.ref.__gxx_personality_v0",
    ];
}

/// Section flag bit values.
#[allow(unused)]
pub(crate) mod shf {
    use super::SectionFlags;

    pub(crate) const WRITE: SectionFlags = SectionFlags::from_u64(object::elf::SHF_WRITE as u64);
    pub(crate) const ALLOC: SectionFlags = SectionFlags::from_u64(object::elf::SHF_ALLOC as u64);
    pub(crate) const EXECINSTR: SectionFlags =
        SectionFlags::from_u64(object::elf::SHF_EXECINSTR as u64);
    pub(crate) const MERGE: SectionFlags = SectionFlags::from_u64(object::elf::SHF_MERGE as u64);
    pub(crate) const STRINGS: SectionFlags =
        SectionFlags::from_u64(object::elf::SHF_STRINGS as u64);
    pub(crate) const OS_NONCONFORMING: SectionFlags =
        SectionFlags::from_u64(object::elf::SHF_OS_NONCONFORMING as u64);
    pub(crate) const GROUP: SectionFlags = SectionFlags::from_u64(object::elf::SHF_GROUP as u64);
    pub(crate) const TLS: SectionFlags = SectionFlags::from_u64(object::elf::SHF_TLS as u64);
    pub(crate) const EXCLUDE: SectionFlags =
        SectionFlags::from_u64(object::elf::SHF_EXCLUDE as u64);
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SectionFlags(u64);

impl SectionFlags {
    pub(crate) fn from_header(header: &SectionHeader) -> Self {
        Self(header.sh_flags.get(LittleEndian))
    }

    pub(crate) const fn from_u64(raw: u64) -> Self {
        Self(raw)
    }

    pub(crate) fn contains(self, flag: SectionFlags) -> bool {
        self.0 & flag.0 != 0
    }

    pub(crate) const fn raw(self) -> u64 {
        self.0
    }
}

impl std::fmt::Debug for SectionFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Extension section types that aren't in every header set. The processor-specific values
/// overlap, so they must always be checked together with the architecture.
pub(crate) mod sht {
    pub(crate) const CREL: u32 = 0x4000_0014;
    pub(crate) const LLVM_ADDRSIG: u32 = 0x6fff_4c03;
    pub(crate) const ARM_EXIDX: u32 = 0x7000_0001;
    pub(crate) const ARM_ATTRIBUTES: u32 = 0x7000_0003;
    pub(crate) const X86_64_UNWIND: u32 = 0x7000_0001;
    pub(crate) const RISCV_ATTRIBUTES: u32 = 0x7000_0003;
}

/// RISC-V object attribute tags we understand. See the RISC-V ELF psABI.
pub(crate) mod riscvattr {
    pub(crate) const TAG_RISCV_WHOLE_FILE: u8 = 1;
    pub(crate) const TAG_RISCV_STACK_ALIGN: u64 = 4;
    pub(crate) const TAG_RISCV_ARCH: u64 = 5;
    pub(crate) const TAG_RISCV_UNALIGNED_ACCESS: u64 = 6;
}

/// A parsed view of one ELF image. Purely structural: header validation, the section table and
/// string access. Symbol and relocation interpretation is layered on top by the file parsers.
pub(crate) struct File<'data> {
    pub(crate) data: &'data [u8],
    pub(crate) ehdr: &'data FileHeader,
    pub(crate) sections: &'data [SectionHeader],
    pub(crate) shstrtab: &'data [u8],
}

impl<'data> File<'data> {
    pub(crate) fn parse(data: &'data [u8]) -> Result<File<'data>> {
        let e = LittleEndian;

        ensure!(data.len() >= size_of::<FileHeader>(), "File too small");
        ensure!(data.starts_with(ELF_MAGIC), "Not an ELF file");

        let (ehdr, _) = object::from_bytes::<FileHeader>(data)
            .map_err(|()| anyhow!("Invalid ELF header"))?;

        let e_shoff = ehdr.e_shoff.get(e);
        if e_shoff == 0 {
            return Ok(File {
                data,
                ehdr,
                sections: &[],
                shstrtab: &[],
            });
        }

        let shdr_data = data
            .get(usize::try_from(e_shoff).ok().context("e_shoff is corrupted")?..)
            .context("e_shoff is corrupted")?;

        // e_shnum is a 16-bit field. Files with more than 65535 sections store the real count in
        // the sh_size field of section header 0. Similarly, a .shstrtab index that doesn't fit in
        // e_shstrndx is stored in section header 0's sh_link.
        let (first, _) = object::from_bytes::<SectionHeader>(shdr_data)
            .map_err(|()| anyhow!("e_shoff is corrupted"))?;

        let num_sections = match ehdr.e_shnum.get(e) {
            0 => usize::try_from(first.sh_size.get(e))
                .ok()
                .context("Extended section count is corrupted")?,
            n => n as usize,
        };

        let (sections, _) = object::slice_from_bytes::<SectionHeader>(shdr_data, num_sections)
            .map_err(|()| {
                anyhow!("e_shoff or e_shnum is corrupted: {} {num_sections}", data.len())
            })?;

        let shstrndx = match ehdr.e_shstrndx.get(e) {
            object::elf::SHN_XINDEX => first.sh_link.get(e) as usize,
            n => n as usize,
        };
        ensure!(shstrndx < num_sections, "e_shstrndx is corrupted");

        let mut file = File {
            data,
            ehdr,
            sections,
            shstrtab: &[],
        };
        file.shstrtab = file.section_data(&sections[shstrndx])?;
        Ok(file)
    }

    pub(crate) fn architecture(&self) -> Result<Architecture> {
        self.ehdr.e_machine.get(LittleEndian).try_into()
    }

    pub(crate) fn is_dynamic(&self) -> bool {
        self.ehdr.e_type.get(LittleEndian) == object::elf::ET_DYN
    }

    pub(crate) fn section(&self, index: usize) -> Result<&'data SectionHeader> {
        self.sections
            .get(index)
            .with_context(|| format!("Section index {index} is out of range"))
    }

    pub(crate) fn find_section(&self, sh_type: u32) -> Option<(usize, &'data SectionHeader)> {
        self.sections
            .iter()
            .enumerate()
            .find(|(_, shdr)| shdr.sh_type.get(LittleEndian) == sh_type)
    }

    /// Returns the raw bytes of a section. `SHT_NOBITS` sections occupy no file space.
    pub(crate) fn section_data(&self, shdr: &SectionHeader) -> Result<&'data [u8]> {
        let e = LittleEndian;
        if shdr.sh_type.get(e) == object::elf::SHT_NOBITS {
            return Ok(&[]);
        }
        let offset = usize::try_from(shdr.sh_offset.get(e)).ok();
        let size = usize::try_from(shdr.sh_size.get(e)).ok();
        offset
            .zip(size)
            .and_then(|(offset, size)| self.data.get(offset..offset.checked_add(size)?))
            .context("Section extends past the end of the file")
    }

    /// Returns the contents of a section as a slice of `T`, checking that the section size is a
    /// multiple of the record size.
    pub(crate) fn get_data<T: object::Pod>(&self, shdr: &SectionHeader) -> Result<&'data [T]> {
        let data = self.section_data(shdr)?;
        ensure!(
            data.len() % size_of::<T>() == 0,
            "Section size {} is not a multiple of the record size {}",
            data.len(),
            size_of::<T>()
        );
        let (slice, _) = object::slice_from_bytes::<T>(data, data.len() / size_of::<T>())
            .map_err(|()| anyhow!("Misaligned section contents"))?;
        Ok(slice)
    }

    pub(crate) fn section_name(&self, shdr: &SectionHeader) -> Result<&'data [u8]> {
        str_in_table(self.shstrtab, shdr.sh_name.get(LittleEndian))
    }

    /// Returns the contents of the string table held by the section at `index`.
    pub(crate) fn strtab(&self, index: usize) -> Result<&'data [u8]> {
        self.section_data(self.section(index)?)
    }

    pub(crate) fn program_headers(&self) -> Result<&'data [ProgramHeader]> {
        let e = LittleEndian;
        let e_phoff = self.ehdr.e_phoff.get(e);
        if e_phoff == 0 {
            return Ok(&[]);
        }
        let rest = self
            .data
            .get(usize::try_from(e_phoff).ok().context("e_phoff is corrupted")?..)
            .context("e_phoff is corrupted")?;
        let (phdrs, _) =
            object::slice_from_bytes::<ProgramHeader>(rest, self.ehdr.e_phnum.get(e) as usize)
                .map_err(|()| anyhow!("e_phoff or e_phnum is corrupted"))?;
        Ok(phdrs)
    }
}

/// Fetches the NUL-terminated string at `offset` in a string table.
pub(crate) fn str_in_table(table: &[u8], offset: u32) -> Result<&[u8]> {
    let rest = table
        .get(offset as usize..)
        .with_context(|| format!("String table offset {offset} is out of range"))?;
    let len = memchr::memchr(0, rest).context("Unterminated string table entry")?;
    Ok(&rest[..len])
}

/// One relocation in the uniform in-memory form all three encodings (REL, RELA, CREL) decode
/// into. Keeping decoded relocations in plain vectors lets the mergeable-section rewrite and the
/// RISC-V sort mutate them without touching the input mapping.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Rel {
    pub r_offset: u64,
    pub r_type: u32,
    pub r_sym: u32,
    pub r_addend: i64,
}

pub(crate) fn rels_from_rela(relas: &[Rela]) -> Vec<Rel> {
    let e = LittleEndian;
    relas
        .iter()
        .map(|r| Rel {
            r_offset: r.r_offset.get(e),
            r_type: r.r_type(e, false),
            r_sym: r.r_sym(e, false),
            r_addend: r.r_addend.get(e),
        })
        .collect()
}

/// Addends of REL-encoded relocations live in the section contents and are the relocation
/// applier's concern, so they decode as zero here.
pub(crate) fn rels_from_rel(rels: &[RelEntry]) -> Vec<Rel> {
    let e = LittleEndian;
    rels.iter()
        .map(|r| Rel {
            r_offset: r.r_offset.get(e),
            r_type: r.r_type(e),
            r_sym: r.r_sym(e),
            r_addend: 0,
        })
        .collect()
}

/// Decodes a CREL relocation table. The header is a ULEB128 value whose low three bits are
/// `{has_addends, scale_1, scale_0}` and whose remaining bits are the entry count. Each entry
/// starts with a flag byte that may borrow its top bits for the start of the offset delta.
pub(crate) fn decode_crel(arch: Architecture, data: &[u8]) -> Result<Vec<Rel>> {
    let mut p = data;
    let hdr = leb128::read::unsigned(&mut p).context("Corrupted CREL header")?;
    let nrels = (hdr >> 3) as usize;
    let is_rela = hdr & 0b100 != 0;
    let scale = (hdr & 0b11) as u32;

    if is_rela && !arch.is_rela() {
        bail!("CREL with addends is not supported for {arch}");
    }

    let mut offset = 0u64;
    let mut r_type = 0i64;
    let mut symidx = 0i64;
    let mut addend = 0i64;

    let mut rels = Vec::with_capacity(nrels);

    while rels.len() < nrels {
        let (&flags, rest) = p.split_first().context("Truncated CREL entry")?;
        p = rest;
        let nflags: u32 = if is_rela { 3 } else { 2 };

        // The flag byte and an optional ULEB128 value together encode the offset delta. The
        // combined value can be up to 67 bits wide, so the shift math has to wrap rather than
        // going through a plain ULEB read.
        let delta = if flags & 0x80 != 0 {
            let rest = leb128::read::unsigned(&mut p).context("Truncated CREL entry")?;
            rest.wrapping_shl(7 - nflags) | u64::from((flags & 0x7f) >> nflags)
        } else {
            u64::from(flags >> nflags)
        };
        offset = offset.wrapping_add(delta.wrapping_shl(scale));

        if flags & 1 != 0 {
            symidx =
                symidx.wrapping_add(leb128::read::signed(&mut p).context("Truncated CREL entry")?);
        }
        if flags & 2 != 0 {
            r_type =
                r_type.wrapping_add(leb128::read::signed(&mut p).context("Truncated CREL entry")?);
        }
        if is_rela && flags & 4 != 0 {
            addend =
                addend.wrapping_add(leb128::read::signed(&mut p).context("Truncated CREL entry")?);
        }

        rels.push(Rel {
            r_offset: offset,
            r_type: r_type as u32,
            r_sym: symidx as u32,
            r_addend: addend,
        });
    }

    Ok(rels)
}

pub(crate) fn esym_is_abs(esym: &ElfSym) -> bool {
    esym.st_shndx(LittleEndian) == object::elf::SHN_ABS
}

pub(crate) fn esym_is_common(esym: &ElfSym) -> bool {
    esym.st_shndx(LittleEndian) == object::elf::SHN_COMMON
}

pub(crate) fn esym_is_weak(esym: &ElfSym) -> bool {
    esym.st_bind() == object::elf::STB_WEAK
}
