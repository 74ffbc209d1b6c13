//! Parsing of relocatable object files: the section dispatch table, COMDAT groups, GNU property
//! notes, RISC-V attributes, relocation attachment and symbol initialization. Resolution and
//! symtab sizing build on the state assembled here.

use crate::arch::Architecture;
use crate::args::Args;
use crate::bail;
use crate::eh_frame;
use crate::eh_frame::CieRecord;
use crate::eh_frame::FdeRecord;
use crate::elf;
use crate::elf::ElfSym;
use crate::elf::Rel;
use crate::elf::Rela;
use crate::elf::RelEntry;
use crate::elf::SectionFlags;
use crate::elf::SectionHeader;
use crate::elf::U32;
use crate::elf::riscvattr;
use crate::elf::secnames;
use crate::elf::shf;
use crate::elf::sht;
use crate::ensure;
use crate::error::Diagnostics;
use crate::error::Result;
use crate::error::warning;
use crate::input_data::FileCommon;
use crate::input_data::FileId;
use crate::input_data::MappedFile;
use crate::string_merging;
use crate::string_merging::MergeableSection;
use crate::string_merging::MergedSections;
use crate::symbol::Symbol;
use crate::symbol::SymbolPlace;
use crate::symbol_db::ComdatGroup;
use crate::symbol_db::SymbolDb;
use anyhow::Context as _;
use anyhow::anyhow;
use hashbrown::HashMap;
use itertools::Itertools as _;
use object::LittleEndian;
use object::read::elf::Sym as _;
use std::ops::Range;

pub struct ObjectFile<'data> {
    pub common: FileCommon,
    pub(crate) elf: elf::File<'data>,

    pub elf_syms: &'data [ElfSym],
    /// Index of the first global in the symbol table (`sh_info` of `SHT_SYMTAB`).
    pub first_global: usize,
    pub(crate) symbol_strtab: &'data [u8],
    pub(crate) symtab_shndx: &'data [U32],

    /// Wrapped sections indexed by section number. Entries are None for sections we skip and for
    /// mergeable sections once they've been converted. Synthetic sections (converted commons) are
    /// appended past the ELF section count.
    pub sections: Vec<Option<InputSection<'data>>>,
    pub mergeable_sections: Vec<Option<MergeableSection<'data>>>,

    /// All symbols of this file: locals, then interned globals, then synthetic fragment symbols.
    pub symbols: Vec<&'data Symbol<'data>>,

    pub(crate) comdat_groups: Vec<ComdatGroupRef<'data>>,
    pub eh_frame_sections: Vec<usize>,
    pub cies: Vec<CieRecord>,
    pub fdes: Vec<FdeRecord>,

    /// `.llvm_addrsig` contents, kept aside for ICF.
    pub llvm_addrsig: Option<InputSection<'data>>,

    /// Accumulated `.note.gnu.property` values, keyed by property type.
    pub gnu_properties: HashMap<u32, u32>,

    pub is_rust_obj: bool,
    pub is_gcc_offload_obj: bool,
    pub needs_executable_stack: bool,
    pub has_init_array: bool,
    pub has_ctors: bool,
    pub(crate) has_common_symbol: bool,

    pub(crate) debug_info: Option<usize>,
    pub(crate) debug_pubnames: Option<usize>,
    pub(crate) debug_pubtypes: Option<usize>,

    pub extra: ArchExtra<'data>,
}

/// Architecture-specific oddments collected during section parsing.
#[derive(Default)]
pub struct ArchExtra<'data> {
    /// PPC32 `.got2`, needed by the relocation applier for got-relative addends.
    pub got2: Option<u32>,
    pub stack_align: Option<u64>,
    pub riscv_arch: Option<&'data [u8]>,
    pub unaligned_access: bool,
}

pub(crate) struct ComdatGroupRef<'data> {
    pub(crate) group: &'data ComdatGroup,
    #[allow(dead_code)]
    pub(crate) section_index: u32,
    pub(crate) members: &'data [U32],
}

pub struct InputSection<'data> {
    pub index: u32,
    pub shdr: SectionHeader,
    pub name: &'data [u8],
    pub is_alive: bool,
    pub relsec_idx: Option<u32>,
    pub rels: Vec<Rel>,
    /// Range of this file's FDE list covering this section, set by the eh-frame parser.
    pub fde_range: Option<Range<u32>>,
    /// ARM: the `.ARM.exidx` section describing this section.
    pub exidx: Option<u32>,
}

impl<'data> InputSection<'data> {
    fn new(index: u32, shdr: &SectionHeader, name: &'data [u8]) -> Self {
        Self::new_synthetic(index, *shdr, name)
    }

    /// Also used for sections that have no backing header in the file, such as the NOBITS
    /// sections that surviving common symbols are converted into.
    pub(crate) fn new_synthetic(index: u32, shdr: SectionHeader, name: &'data [u8]) -> Self {
        Self {
            index,
            shdr,
            name,
            is_alive: true,
            relsec_idx: None,
            rels: Vec::new(),
            fde_range: None,
            exidx: None,
        }
    }

    pub(crate) fn flags(&self) -> SectionFlags {
        SectionFlags::from_header(&self.shdr)
    }

    pub(crate) fn sh_type(&self) -> u32 {
        self.shdr.sh_type.get(LittleEndian)
    }
}

/// Resolves a symbol's section index, following the extended-index table for `SHN_XINDEX`.
pub(crate) fn esym_shndx(esym: &ElfSym, index: usize, shndx_table: &[U32]) -> u32 {
    let e = LittleEndian;
    let shndx = esym.st_shndx(e);
    if shndx == object::elf::SHN_XINDEX {
        shndx_table.get(index).map_or(0, |v| v.get(e))
    } else {
        u32::from(shndx)
    }
}

fn is_debug_section(flags: SectionFlags, name: &[u8]) -> bool {
    !flags.contains(shf::ALLOC) && name.starts_with(b".debug")
}

fn is_known_section_type(arch: Architecture, sh_type: u32, flags: SectionFlags) -> bool {
    if matches!(
        sh_type,
        object::elf::SHT_PROGBITS
            | object::elf::SHT_NOTE
            | object::elf::SHT_NOBITS
            | object::elf::SHT_INIT_ARRAY
            | object::elf::SHT_FINI_ARRAY
            | object::elf::SHT_PREINIT_ARRAY
    ) {
        return true;
    }
    if (object::elf::SHT_LOUSER..=object::elf::SHT_HIUSER).contains(&sh_type)
        && !flags.contains(shf::ALLOC)
    {
        return true;
    }
    if (object::elf::SHT_LOOS..=object::elf::SHT_HIOS).contains(&sh_type)
        && !flags.contains(shf::OS_NONCONFORMING)
    {
        return true;
    }
    match arch {
        Architecture::X86_64 => sh_type == sht::X86_64_UNWIND,
        Architecture::Arm => sh_type == sht::ARM_EXIDX || sh_type == sht::ARM_ATTRIBUTES,
        Architecture::RiscV64 => sh_type == sht::RISCV_ATTRIBUTES,
        _ => false,
    }
}

impl<'data> ObjectFile<'data> {
    pub(crate) fn new(
        elf: elf::File<'data>,
        input: &MappedFile<'data>,
        file_id: FileId,
    ) -> Result<Self> {
        let e = LittleEndian;

        let mut first_global = 0;
        let mut elf_syms: &[ElfSym] = &[];
        let mut symbol_strtab: &[u8] = &[];
        let mut symtab_shndx: &[U32] = &[];

        if let Some((_, symtab)) = elf.find_section(object::elf::SHT_SYMTAB) {
            // All local symbols precede globals; sh_info holds the index of the first global.
            first_global = symtab.sh_info.get(e) as usize;
            elf_syms = elf.get_data::<ElfSym>(symtab)?;
            symbol_strtab = elf.strtab(symtab.sh_link.get(e) as usize)?;
            ensure!(
                first_global <= elf_syms.len(),
                "{}: sh_info of the symbol table is corrupted",
                input.name.display()
            );
            if let Some((_, shndx)) = elf.find_section(object::elf::SHT_SYMTAB_SHNDX) {
                symtab_shndx = elf.get_data::<U32>(shndx)?;
            }
        }

        let num_sections = elf.sections.len();
        let common = FileCommon::new(input, file_id, input.archive_name.is_none());

        Ok(Self {
            common,
            elf,
            elf_syms,
            first_global,
            symbol_strtab,
            symtab_shndx,
            sections: (0..num_sections).map(|_| None).collect(),
            mergeable_sections: (0..num_sections).map(|_| None).collect(),
            symbols: Vec::new(),
            comdat_groups: Vec::new(),
            eh_frame_sections: Vec::new(),
            cies: Vec::new(),
            fdes: Vec::new(),
            llvm_addrsig: None,
            gnu_properties: HashMap::new(),
            is_rust_obj: false,
            is_gcc_offload_obj: false,
            needs_executable_stack: false,
            has_init_array: false,
            has_ctors: false,
            has_common_symbol: false,
            debug_info: None,
            debug_pubnames: None,
            debug_pubtypes: None,
            extra: ArchExtra::default(),
        })
    }

    pub(crate) fn parse(
        &mut self,
        args: &Args,
        symbol_db: &SymbolDb<'data>,
        merged_sections: &MergedSections<'data>,
        diagnostics: &Diagnostics,
    ) -> Result {
        let mut decoded_crel = HashMap::new();
        self.initialize_sections(args, symbol_db, &mut decoded_crel)?;
        self.attach_relocation_sections(decoded_crel)?;
        if args.arch == Architecture::Arm {
            self.attach_arm_exidx();
        }
        string_merging::convert_mergeable_sections(self, merged_sections)?;
        eh_frame::parse_eh_frame(self, args, diagnostics)?;
        self.initialize_symbols(args, symbol_db)?;
        self.sort_relocations(args);

        tracing::debug!(target: "metrics",
            file = %self.common.display(),
            num_symbols = self.elf_syms.len(),
            regular_sections = self.sections.iter().flatten().count(),
            "parsed object");

        Ok(())
    }

    fn initialize_sections(
        &mut self,
        args: &Args,
        symbol_db: &SymbolDb<'data>,
        decoded_crel: &mut HashMap<usize, Vec<Rel>>,
    ) -> Result {
        let e = LittleEndian;
        let section_headers = self.elf.sections;

        for (i, shdr) in section_headers.iter().enumerate() {
            let name = self.elf.section_name(shdr)?;
            let flags = SectionFlags::from_header(shdr);
            let sh_type = shdr.sh_type.get(e);

            if flags.contains(shf::EXCLUDE) && name.starts_with(b".gnu.offload_lto_.symtab.") {
                self.is_gcc_offload_obj = true;
                continue;
            }

            if flags.contains(shf::EXCLUDE)
                && !flags.contains(shf::ALLOC)
                && sh_type != sht::LLVM_ADDRSIG
                && !args.relocatable
            {
                continue;
            }

            if args.arch == Architecture::Arm && sh_type == sht::ARM_ATTRIBUTES {
                continue;
            }

            if args.arch == Architecture::RiscV64 && sh_type == sht::RISCV_ATTRIBUTES {
                let data = self.elf.section_data(shdr)?;
                self.read_riscv_attributes(data)?;
                continue;
            }

            match sh_type {
                object::elf::SHT_GROUP => self.initialize_group(symbol_db, i, shdr)?,
                sht::CREL => {
                    let data = self.elf.section_data(shdr)?;
                    decoded_crel.insert(
                        i,
                        elf::decode_crel(args.arch, data).with_context(|| {
                            format!("{}: invalid CREL section", self.common.display())
                        })?,
                    );
                }
                object::elf::SHT_REL
                | object::elf::SHT_RELA
                | object::elf::SHT_SYMTAB
                | object::elf::SHT_SYMTAB_SHNDX
                | object::elf::SHT_STRTAB
                | object::elf::SHT_NULL => {}
                _ => {
                    if !is_known_section_type(args.arch, sh_type, flags) {
                        bail!(
                            "{}: {}: unsupported section type: {sh_type:#x}",
                            self.common.display(),
                            String::from_utf8_lossy(name)
                        );
                    }

                    // .note.GNU-stack controls stack executability in GNU linkers. Silently
                    // making the stack executable is too dangerous, so we only record the
                    // request and tell the user when it would change behavior.
                    if name == secnames::NOTE_GNU_STACK && !args.relocatable {
                        if flags.contains(shf::EXECINSTR) {
                            if !args.z_execstack && !args.z_execstack_if_needed {
                                warning(&format!(
                                    "{}: this file may cause a segmentation fault because it \
                                     requires an executable stack",
                                    self.common.display()
                                ));
                            }
                            self.needs_executable_stack = true;
                        }
                        continue;
                    }

                    if name == secnames::NOTE_GNU_PROPERTY {
                        self.parse_note_gnu_property(shdr)?;
                        continue;
                    }

                    // A build-id note in an input only shows up in `ld -r --build-id` output.
                    if name == secnames::NOTE_GNU_BUILD_ID {
                        continue;
                    }

                    if secnames::LEGACY_LINKONCE_NAMES.contains(&name) {
                        continue;
                    }

                    if (args.strip_all || args.strip_debug) && is_debug_section(flags, name) {
                        continue;
                    }

                    if args.should_discard_section(name) {
                        continue;
                    }

                    if name == secnames::COMMENT
                        && self.elf.section_data(shdr)?.starts_with(b"rustc ")
                    {
                        self.is_rust_obj = true;
                    }

                    // Without section headers in the output there's nowhere to place non-alloc
                    // sections.
                    if args.oformat_binary && !flags.contains(shf::ALLOC) {
                        continue;
                    }

                    self.sections[i] = Some(InputSection::new(i as u32, shdr, name));

                    // Keep .llvm_addrsig aside for --icf=safe. Tools that rewrite the symbol
                    // table tend not to preserve sh_link, in which case the section is useless.
                    if sh_type == sht::LLVM_ADDRSIG && !args.relocatable {
                        if shdr.sh_link.get(e) != 0 {
                            self.llvm_addrsig = self.sections[i].take();
                        }
                        continue;
                    }

                    if matches!(
                        sh_type,
                        object::elf::SHT_INIT_ARRAY
                            | object::elf::SHT_FINI_ARRAY
                            | object::elf::SHT_PREINIT_ARRAY
                    ) {
                        self.has_init_array = true;
                    }

                    if name == b".ctors"
                        || name.starts_with(b".ctors.")
                        || name == b".dtors"
                        || name.starts_with(b".dtors.")
                    {
                        self.has_ctors = true;
                    }

                    if name == secnames::EH_FRAME {
                        self.eh_frame_sections.push(i);
                    }

                    if args.arch == Architecture::Ppc32 && name == secnames::GOT2 {
                        self.extra.got2 = Some(i as u32);
                    }

                    if args.gdb_index {
                        self.record_debug_sections(i, name)?;
                    }
                }
            }
        }

        Ok(())
    }

    fn initialize_group(
        &mut self,
        symbol_db: &SymbolDb<'data>,
        index: usize,
        shdr: &SectionHeader,
    ) -> Result {
        let e = LittleEndian;

        let esym = self
            .elf_syms
            .get(shdr.sh_info.get(e) as usize)
            .with_context(|| format!("{}: invalid symbol index", self.common.display()))?;

        let signature = if esym.st_type() == object::elf::STT_SECTION {
            let shndx = esym_shndx(esym, shdr.sh_info.get(e) as usize, self.symtab_shndx);
            self.elf.section_name(self.elf.section(shndx as usize)?)?
        } else {
            elf::str_in_table(self.symbol_strtab, esym.st_name(e))?
        };

        // GCC emits a broken comdat group for .debug_macros with a "wm4." signature; ignore it.
        if signature.starts_with(b"wm4.") {
            return Ok(());
        }

        let entries = self.elf.get_data::<U32>(shdr)?;
        ensure!(!entries.is_empty(), "{}: empty SHT_GROUP", self.common.display());
        if entries[0].get(e) == 0 {
            return Ok(());
        }
        ensure!(
            entries[0].get(e) == object::elf::GRP_COMDAT,
            "{}: unsupported SHT_GROUP format",
            self.common.display()
        );

        let group = symbol_db.insert_comdat_group(signature);
        self.comdat_groups.push(ComdatGroupRef {
            group,
            section_index: index as u32,
            members: &entries[1..],
        });
        Ok(())
    }

    fn record_debug_sections(&mut self, index: usize, name: &[u8]) -> Result {
        if name == secnames::DEBUG_INFO {
            self.debug_info = Some(index);
        }

        // .gdb_index subsumes the gnu_pubnames/gnu_pubtypes contents, so keeping the sections in
        // the output would waste space.
        if name == secnames::DEBUG_GNU_PUBNAMES {
            self.debug_pubnames = Some(index);
            if let Some(isec) = &mut self.sections[index] {
                isec.is_alive = false;
            }
        }
        if name == secnames::DEBUG_GNU_PUBTYPES {
            self.debug_pubtypes = Some(index);
            if let Some(isec) = &mut self.sections[index] {
                isec.is_alive = false;
            }
        }

        if name == secnames::DEBUG_TYPES {
            bail!(
                "{}: --gdb-index is not compatible with .debug_types; recompile without \
                 -fdebug-types-section",
                self.common.display()
            );
        }
        Ok(())
    }

    fn parse_note_gnu_property(&mut self, shdr: &SectionHeader) -> Result {
        let e = LittleEndian;
        let corrupt = || anyhow!("{}: corrupted .note.gnu.property", self.common.display());

        let mut data = self.elf.section_data(shdr)?;
        while !data.is_empty() {
            let (nhdr, rest) = object::from_bytes::<elf::NoteHeader>(data).map_err(|()| corrupt())?;
            let namesz = nhdr.n_namesz.get(e) as usize;
            let descsz = nhdr.n_descsz.get(e) as usize;

            let name = rest.get(..namesz.saturating_sub(1)).ok_or_else(corrupt)?;
            let desc_start = namesz.next_multiple_of(4);
            let mut desc = rest
                .get(desc_start..desc_start + descsz)
                .ok_or_else(corrupt)?;
            data = rest
                .get(desc_start + descsz.next_multiple_of(8)..)
                .unwrap_or_default();

            if nhdr.n_type.get(e) != object::elf::NT_GNU_PROPERTY_TYPE_0 || name != b"GNU".as_slice()
            {
                continue;
            }

            while !desc.is_empty() {
                ensure!(desc.len() >= 8, corrupt());
                let ptype = u32::from_le_bytes(desc[..4].try_into().unwrap());
                let size = u32::from_le_bytes(desc[4..8].try_into().unwrap()) as usize;
                desc = &desc[8..];

                // Almost all currently defined properties carry a 32-bit value. Sizes we don't
                // understand (GNU_PROPERTY_STACK_SIZE etc.) are skipped, not merged.
                if size == 4 {
                    ensure!(desc.len() >= 4, corrupt());
                    let value = u32::from_le_bytes(desc[..4].try_into().unwrap());
                    *self.gnu_properties.entry(ptype).or_insert(0) |= value;
                }
                desc = desc.get(size.next_multiple_of(8)..).ok_or_else(corrupt)?;
            }
        }
        Ok(())
    }

    /// Parses a `.riscv.attributes` section: a format byte `'A'`, then vendor subsections of
    /// which we only understand `"riscv\0"`, containing ULEB128-tagged file attributes.
    fn read_riscv_attributes(&mut self, data: &'data [u8]) -> Result {
        let corrupt = || anyhow!("{}: corrupted .riscv.attributes section", self.common.display());
        ensure!(!data.is_empty(), corrupt());

        if data[0] != b'A' {
            return Ok(());
        }
        let mut data = &data[1..];

        while !data.is_empty() {
            ensure!(data.len() >= 4, corrupt());
            let size = u32::from_le_bytes(data[..4].try_into().unwrap()) as usize;
            ensure!(size >= 4 && size <= data.len(), corrupt());

            let mut p = &data[4..size];
            data = &data[size..];

            if !p.starts_with(b"riscv\0") {
                continue;
            }
            p = &p[6..];

            // Expect a file-scope sub-subsection: one tag byte and a 32-bit size.
            ensure!(p.first() == Some(&riscvattr::TAG_RISCV_WHOLE_FILE), corrupt());
            ensure!(p.len() >= 5, corrupt());
            p = &p[5..];

            while !p.is_empty() {
                let tag = leb128::read::unsigned(&mut p).map_err(|_| corrupt())?;
                match tag {
                    riscvattr::TAG_RISCV_STACK_ALIGN => {
                        self.extra.stack_align =
                            Some(leb128::read::unsigned(&mut p).map_err(|_| corrupt())?);
                    }
                    riscvattr::TAG_RISCV_ARCH => {
                        let len = memchr::memchr(0, p).ok_or_else(corrupt)?;
                        self.extra.riscv_arch = Some(&p[..len]);
                        p = &p[len + 1..];
                    }
                    riscvattr::TAG_RISCV_UNALIGNED_ACCESS => {
                        self.extra.unaligned_access =
                            leb128::read::unsigned(&mut p).map_err(|_| corrupt())? != 0;
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }

    /// Attaches each relocation section to the section named by its `sh_info`, decoding the
    /// relocations into the uniform in-memory form. A section may have at most one.
    fn attach_relocation_sections(&mut self, mut decoded_crel: HashMap<usize, Vec<Rel>>) -> Result {
        let e = LittleEndian;
        let section_headers = self.elf.sections;

        for (i, shdr) in section_headers.iter().enumerate() {
            let sh_type = shdr.sh_type.get(e);
            if !matches!(sh_type, object::elf::SHT_REL | object::elf::SHT_RELA | sht::CREL) {
                continue;
            }

            let rels = match sh_type {
                sht::CREL => decoded_crel.remove(&i).unwrap_or_default(),
                object::elf::SHT_RELA => elf::rels_from_rela(self.elf.get_data::<Rela>(shdr)?),
                _ => elf::rels_from_rel(self.elf.get_data::<RelEntry>(shdr)?),
            };

            let target_idx = shdr.sh_info.get(e) as usize;
            let Some(Some(target)) = self.sections.get_mut(target_idx) else {
                continue;
            };
            ensure!(
                target.relsec_idx.is_none(),
                "{}: {}: section has multiple relocation sections",
                self.common.display(),
                String::from_utf8_lossy(target.name)
            );
            target.relsec_idx = Some(i as u32);
            target.rels = rels;
        }
        Ok(())
    }

    /// ARM: `.ARM.exidx` sections name the section they describe through `sh_link`.
    fn attach_arm_exidx(&mut self) {
        let e = LittleEndian;
        let pairs = self
            .sections
            .iter()
            .flatten()
            .filter(|isec| isec.sh_type() == sht::ARM_EXIDX)
            .map(|isec| (isec.shdr.sh_link.get(e) as usize, isec.index))
            .collect_vec();
        for (target, exidx) in pairs {
            if let Some(Some(target)) = self.sections.get_mut(target) {
                target.exidx = Some(exidx);
            }
        }
    }

    fn initialize_symbols(&mut self, args: &Args, symbol_db: &SymbolDb<'data>) -> Result {
        if self.elf_syms.is_empty() {
            return Ok(());
        }
        let e = LittleEndian;
        let file_id = self.common.file_id;

        self.symbols = Vec::with_capacity(self.elf_syms.len());
        self.symbols.push(symbol_db.alloc_symbol(Symbol::new_local(
            b"",
            file_id,
            0,
            0,
            SymbolPlace::None,
        )));

        for i in 1..self.first_global {
            let esym = &self.elf_syms[i];
            ensure!(
                !elf::esym_is_common(esym),
                "{}: common local symbol?",
                self.common.display()
            );

            let shndx = esym_shndx(esym, i, self.symtab_shndx) as usize;
            let name = if esym.st_type() == object::elf::STT_SECTION {
                self.elf.section_name(self.elf.section(shndx)?)?
            } else {
                elf::str_in_table(self.symbol_strtab, esym.st_name(e))?
            };

            let place = if !elf::esym_is_abs(esym)
                && self.sections.get(shndx).is_some_and(Option::is_some)
            {
                SymbolPlace::Section(shndx as u32)
            } else {
                SymbolPlace::None
            };

            self.symbols.push(symbol_db.alloc_symbol(Symbol::new_local(
                name,
                file_id,
                i as u32,
                esym.st_value(e),
                place,
            )));
        }

        for i in self.first_global..self.elf_syms.len() {
            let esym = &self.elf_syms[i];
            if elf::esym_is_common(esym) {
                self.has_common_symbol = true;
            }

            let full = elf::str_in_table(self.symbol_strtab, esym.st_name(e))?;

            // `name@version` binds the reference to one version; `name@@version` additionally
            // makes it the default, so it interns under the bare name.
            let mut key = full;
            let mut name = full;
            if let Some(pos) = memchr::memchr(b'@', full) {
                let ver = &full[pos..];
                name = &full[..pos];
                if ver != b"@".as_slice() && ver != b"@@".as_slice() && ver.starts_with(b"@@") {
                    key = name;
                }
            }

            let is_undef = esym.is_undefined(e);

            // --wrap: an undefined `__real_X` resolves to `X`, and any other undefined reference
            // to a wrapped `X` resolves to `__wrap_X`.
            let sym = if is_undef
                && name.starts_with(b"__real_")
                && args.wrap_contains(&name[7..])
            {
                symbol_db.get_symbol_with_name(&key[7..], &name[7..])
            } else {
                let mut sym = symbol_db.get_symbol_with_name(key, name);
                if is_undef && sym.is_wrapped() {
                    let wrapped_key = symbol_db.save_concat(&[b"__wrap_", key]);
                    let wrapped_name = symbol_db.save_concat(&[b"__wrap_", name]);
                    sym = symbol_db.get_symbol_with_name(wrapped_key, wrapped_name);
                }
                sym
            };

            self.symbols.push(sym);
        }

        Ok(())
    }

    /// Relocation tables are sorted by `r_offset` everywhere except RISC-V and LoongArch.
    fn sort_relocations(&mut self, args: &Args) {
        if !args.arch.needs_sorted_relocations() {
            return;
        }
        for isec in self.sections.iter_mut().skip(1).flatten() {
            if !isec.is_alive || !isec.flags().contains(shf::ALLOC) {
                continue;
            }
            if !isec.rels.is_sorted_by_key(|r| r.r_offset) {
                isec.rels.sort_by_key(|r| r.r_offset);
            }
        }
    }

    /// The source filename, if the compiler recorded one as an `STT_FILE` local.
    pub fn source_name(&self) -> &'data [u8] {
        for i in 0..self.first_global.min(self.symbols.len()) {
            if self.elf_syms[i].st_type() == object::elf::STT_FILE {
                return self.symbols[i].name();
            }
        }
        b""
    }

    pub(crate) fn get_shndx(&self, esym: &ElfSym, index: usize) -> u32 {
        esym_shndx(esym, index, self.symtab_shndx)
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Arenas;
    use crate::context::Context;
    use crate::parsing;
    use crate::test_elf::SecSpec;
    use crate::test_elf::SymSpec;
    use crate::test_elf::TestElf;
    use crate::test_elf::mapped;
    use crate::test_elf::rela_section;

    fn parse<'data>(ctx: &mut Context<'data>, bytes: &'data [u8]) {
        parsing::parse_input_files(ctx, vec![mapped(bytes, "test.o", 0)]).unwrap();
    }

    #[test]
    fn parses_sections_and_symbols() {
        let bytes = TestElf::object()
            .section(SecSpec::text(".text", 16))
            .symbol(SymSpec::file_sym("test.c"))
            .symbol(SymSpec::section_sym(1))
            .symbol(SymSpec::local("local_a", 1, 4))
            .symbol(SymSpec::global("entry", 1, 0))
            .build();
        let args = Args::new(Architecture::X86_64);
        let arenas = Arenas::new();
        let mut ctx = Context::new(&args, &arenas);
        parse(&mut ctx, &bytes);

        let obj = ctx.files[0].as_object().unwrap();
        assert_eq!(obj.first_global, 4);
        assert!(obj.sections[1].is_some());
        assert_eq!(obj.symbols[2].name(), b".text");
        assert_eq!(obj.symbols[3].name(), b"local_a");
        assert_eq!(obj.symbols[3].file(), Some(obj.common.file_id));
        assert_eq!(obj.symbols[4].name(), b"entry");
        assert_eq!(obj.source_name(), b"test.c");
        assert!(obj.common.is_reachable());
    }

    #[test]
    fn extended_section_counts() {
        let bytes = TestElf::object()
            .extended_counts()
            .section(SecSpec::text(".text", 8))
            .symbol(SymSpec::global("f", 1, 0))
            .build();
        let args = Args::new(Architecture::X86_64);
        let arenas = Arenas::new();
        let mut ctx = Context::new(&args, &arenas);
        parse(&mut ctx, &bytes);

        let obj = ctx.files[0].as_object().unwrap();
        assert!(obj.sections[1].is_some());
        assert_eq!(obj.symbols[1].name(), b"f");
    }

    #[test]
    fn unknown_section_type_is_fatal() {
        let bytes = TestElf::object()
            .section(SecSpec {
                sh_type: 0x1234_5678,
                ..SecSpec::progbits(".weird", &[])
            })
            .build();
        let args = Args::new(Architecture::X86_64);
        let arenas = Arenas::new();
        let mut ctx = Context::new(&args, &arenas);
        let err = parsing::parse_input_files(&mut ctx, vec![mapped(&bytes, "bad.o", 0)])
            .unwrap_err();
        assert!(err.to_string().contains("unsupported section type"));
    }

    #[test]
    fn executable_stack_note_is_recorded() {
        let bytes = TestElf::object()
            .section(SecSpec {
                sh_type: object::elf::SHT_PROGBITS,
                sh_flags: u64::from(object::elf::SHF_EXECINSTR),
                ..SecSpec::progbits(".note.GNU-stack", &[])
            })
            .build();
        let args = Args::new(Architecture::X86_64);
        let arenas = Arenas::new();
        let mut ctx = Context::new(&args, &arenas);
        parse(&mut ctx, &bytes);

        let obj = ctx.files[0].as_object().unwrap();
        assert!(obj.needs_executable_stack);
        // The note itself isn't kept as an input section.
        assert!(obj.sections[1].is_none());
    }

    #[test]
    fn rustc_comment_marks_rust_object() {
        let bytes = TestElf::object()
            .section(SecSpec {
                sh_flags: 0,
                ..SecSpec::progbits(".comment", b"rustc version 1.90.0\0")
            })
            .build();
        let args = Args::new(Architecture::X86_64);
        let arenas = Arenas::new();
        let mut ctx = Context::new(&args, &arenas);
        parse(&mut ctx, &bytes);
        assert!(ctx.files[0].as_object().unwrap().is_rust_obj);
    }

    #[test]
    fn discard_section_drops_named_sections() {
        let bytes = TestElf::object()
            .section(SecSpec::progbits(".dropme", b"x"))
            .section(SecSpec::progbits(".keepme", b"y"))
            .build();
        let mut args = Args::new(Architecture::X86_64);
        args.discard_section.insert(".dropme".to_owned());
        let arenas = Arenas::new();
        let mut ctx = Context::new(&args, &arenas);
        parse(&mut ctx, &bytes);

        let obj = ctx.files[0].as_object().unwrap();
        assert!(obj.sections[1].is_none());
        assert!(obj.sections[2].is_some());
    }

    #[test]
    fn comdat_group_is_interned_by_signature() {
        let group_data: Vec<u8> = [object::elf::GRP_COMDAT, 1u32]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        let bytes = TestElf::object()
            .section(SecSpec::text(".text.foo", 8))
            .section(SecSpec {
                sh_type: object::elf::SHT_GROUP,
                sh_info: 1, // signature symbol index
                sh_entsize: 4,
                ..SecSpec::progbits(".group", &group_data)
            })
            .symbol(SymSpec::local("foo_sig", 1, 0))
            .build();
        let args = Args::new(Architecture::X86_64);
        let arenas = Arenas::new();
        let mut ctx = Context::new(&args, &arenas);
        parse(&mut ctx, &bytes);

        let obj = ctx.files[0].as_object().unwrap();
        assert_eq!(obj.comdat_groups.len(), 1);
        assert_eq!(obj.comdat_groups[0].members.len(), 1);
    }

    #[test]
    fn empty_comdat_group_is_fatal() {
        let bytes = TestElf::object()
            .section(SecSpec {
                sh_type: object::elf::SHT_GROUP,
                sh_info: 1,
                sh_entsize: 4,
                ..SecSpec::progbits(".group", &[])
            })
            .symbol(SymSpec::local("sig", 0, 0))
            .build();
        let args = Args::new(Architecture::X86_64);
        let arenas = Arenas::new();
        let mut ctx = Context::new(&args, &arenas);
        let err = parsing::parse_input_files(&mut ctx, vec![mapped(&bytes, "g.o", 0)])
            .unwrap_err();
        assert!(err.to_string().contains("empty SHT_GROUP"));
    }

    #[test]
    fn non_comdat_group_is_fatal() {
        let group_data: Vec<u8> = 2u32.to_le_bytes().to_vec();
        let bytes = TestElf::object()
            .section(SecSpec {
                sh_type: object::elf::SHT_GROUP,
                sh_info: 1,
                sh_entsize: 4,
                ..SecSpec::progbits(".group", &group_data)
            })
            .symbol(SymSpec::local("sig", 0, 0))
            .build();
        let args = Args::new(Architecture::X86_64);
        let arenas = Arenas::new();
        let mut ctx = Context::new(&args, &arenas);
        let err = parsing::parse_input_files(&mut ctx, vec![mapped(&bytes, "g.o", 0)])
            .unwrap_err();
        assert!(err.to_string().contains("unsupported SHT_GROUP format"));
    }

    #[test]
    fn broken_gcc_groups_are_skipped() {
        let group_data: Vec<u8> = [object::elf::GRP_COMDAT, 1u32]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        let bytes = TestElf::object()
            .section(SecSpec::progbits(".debug_macro", b""))
            .section(SecSpec {
                sh_type: object::elf::SHT_GROUP,
                sh_info: 1,
                sh_entsize: 4,
                ..SecSpec::progbits(".group", &group_data)
            })
            .symbol(SymSpec::local("wm4.foo.h.12345", 0, 0))
            .build();
        let args = Args::new(Architecture::X86_64);
        let arenas = Arenas::new();
        let mut ctx = Context::new(&args, &arenas);
        parse(&mut ctx, &bytes);
        assert!(ctx.files[0].as_object().unwrap().comdat_groups.is_empty());
    }

    #[test]
    fn crel_relocations_attach_to_their_target() {
        // One relocation, offset delta 1, against symbol 0.
        let crel_data = vec![0b0000_1000u8, 0x04];
        let bytes = TestElf::object()
            .section(SecSpec::text(".text", 8))
            .section(SecSpec {
                sh_type: sht::CREL,
                sh_info: 1,
                ..SecSpec::progbits(".crel.text", &crel_data)
            })
            .symbol(SymSpec::global("f", 1, 0))
            .build();
        let args = Args::new(Architecture::X86_64);
        let arenas = Arenas::new();
        let mut ctx = Context::new(&args, &arenas);
        parse(&mut ctx, &bytes);

        let obj = ctx.files[0].as_object().unwrap();
        let text = obj.sections[1].as_ref().unwrap();
        assert_eq!(text.relsec_idx, Some(2));
        assert_eq!(text.rels, vec![Rel { r_offset: 1, r_type: 0, r_sym: 0, r_addend: 0 }]);
    }

    #[test]
    fn riscv_relocations_are_sorted() {
        let bytes = TestElf::object()
            .machine(object::elf::EM_RISCV)
            .section(SecSpec::text(".text", 32))
            .section(rela_section(1, 0, &[(16, 2, 1, 0), (0, 2, 1, 0), (8, 2, 1, 0)]))
            .symbol(SymSpec::global("f", 1, 0))
            .build();
        let args = Args::new(Architecture::RiscV64);
        let arenas = Arenas::new();
        let mut ctx = Context::new(&args, &arenas);
        parse(&mut ctx, &bytes);

        let obj = ctx.files[0].as_object().unwrap();
        let offsets: Vec<u64> = obj.sections[1]
            .as_ref()
            .unwrap()
            .rels
            .iter()
            .map(|r| r.r_offset)
            .collect();
        assert_eq!(offsets, &[0, 8, 16]);
    }

    #[test]
    fn riscv_attributes_are_parsed() {
        // 'A', then one subsection: size, "riscv\0", file tag + size, then
        // stack_align(4)=16 and arch(5)="rv64gc".
        let mut sub = Vec::new();
        sub.extend_from_slice(b"riscv\0");
        sub.push(riscvattr::TAG_RISCV_WHOLE_FILE);
        sub.extend_from_slice(&0u32.to_le_bytes());
        sub.push(4); // stack_align tag
        sub.push(16);
        sub.push(5); // arch tag
        sub.extend_from_slice(b"rv64gc\0");
        let mut data = vec![b'A'];
        data.extend_from_slice(&(sub.len() as u32 + 4).to_le_bytes());
        data.extend_from_slice(&sub);

        let bytes = TestElf::object()
            .machine(object::elf::EM_RISCV)
            .section(SecSpec {
                sh_type: sht::RISCV_ATTRIBUTES,
                sh_flags: 0,
                ..SecSpec::progbits(".riscv.attributes", &data)
            })
            .build();
        let args = Args::new(Architecture::RiscV64);
        let arenas = Arenas::new();
        let mut ctx = Context::new(&args, &arenas);
        parse(&mut ctx, &bytes);

        let obj = ctx.files[0].as_object().unwrap();
        assert_eq!(obj.extra.stack_align, Some(16));
        assert_eq!(obj.extra.riscv_arch, Some(b"rv64gc".as_slice()));
    }

    #[test]
    fn gnu_properties_accumulate() {
        let mut desc = Vec::new();
        for (ptype, value) in [(0xc000_0002u32, 3u32), (0xc000_0002, 4)] {
            desc.extend_from_slice(&ptype.to_le_bytes());
            desc.extend_from_slice(&4u32.to_le_bytes());
            desc.extend_from_slice(&value.to_le_bytes());
            desc.extend_from_slice(&0u32.to_le_bytes()); // padding to 8
        }
        let mut note = Vec::new();
        note.extend_from_slice(&4u32.to_le_bytes()); // namesz
        note.extend_from_slice(&(desc.len() as u32).to_le_bytes());
        note.extend_from_slice(&object::elf::NT_GNU_PROPERTY_TYPE_0.to_le_bytes());
        note.extend_from_slice(b"GNU\0");
        note.extend_from_slice(&desc);

        let bytes = TestElf::object()
            .section(SecSpec {
                sh_type: object::elf::SHT_NOTE,
                ..SecSpec::progbits(".note.gnu.property", &note)
            })
            .build();
        let args = Args::new(Architecture::X86_64);
        let arenas = Arenas::new();
        let mut ctx = Context::new(&args, &arenas);
        parse(&mut ctx, &bytes);

        let obj = ctx.files[0].as_object().unwrap();
        assert_eq!(obj.gnu_properties.get(&0xc000_0002), Some(&7));
        assert!(obj.sections[1].is_none());
    }

    #[test]
    fn wrap_rewrites_undefined_references() {
        let bytes_a = TestElf::object()
            .section(SecSpec::text(".text", 16))
            .symbol(SymSpec::global("malloc", 1, 0))
            .symbol(SymSpec::global("__wrap_malloc", 1, 8))
            .symbol(SymSpec::undef("__real_malloc"))
            .build();
        let bytes_b = TestElf::object()
            .symbol(SymSpec::undef("malloc"))
            .build();

        let mut args = Args::new(Architecture::X86_64);
        args.wrap.insert("malloc".to_owned());
        let arenas = Arenas::new();
        let mut ctx = Context::new(&args, &arenas);
        parsing::parse_input_files(
            &mut ctx,
            vec![mapped(&bytes_a, "a.o", 0), mapped(&bytes_b, "b.o", 1)],
        )
        .unwrap();

        let a = ctx.files[0].as_object().unwrap();
        let b = ctx.files[1].as_object().unwrap();
        // The reference to __real_malloc resolves to malloc.
        assert!(std::ptr::eq(a.symbols[3], ctx.get_symbol(b"malloc")));
        // A defined malloc stays itself, but undefined references go to __wrap_malloc.
        assert!(std::ptr::eq(a.symbols[1], ctx.get_symbol(b"malloc")));
        assert!(std::ptr::eq(b.symbols[1], ctx.get_symbol(b"__wrap_malloc")));
    }
}
