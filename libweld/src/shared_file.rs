//! Parsing of shared objects. For symbol resolution we only care about a DSO's dynamic symbol
//! table, its soname/DT_NEEDED identity, and GNU symbol versioning.
//!
//! Versioning makes interning tricky because one symbol can be reachable under two names. Each
//! name has exactly one "default" version, written `foo@@VERSION`, referable both as `foo` and as
//! `foo@VERSION`; non-default versioned symbols are only referable with an explicit suffix. We
//! intern a default-versioned symbol under both names, recording the `foo@VERSION` shadow in
//! `symbols2`, and the resolver later redirects references to the shadow onto the primary.

use crate::elf;
use crate::elf::DynamicEntry;
use crate::elf::ElfSym;
use crate::elf::Verdaux;
use crate::elf::Verdef;
use crate::elf::U16;
use crate::error::Result;
use crate::input_data::FileCommon;
use crate::input_data::FileId;
use crate::input_data::MappedFile;
use crate::symbol::Symbol;
use crate::symbol_db::SymbolDb;
use anyhow::Context as _;
use anyhow::anyhow;
use object::LittleEndian;
use object::read::elf::Sym as _;
use std::sync::OnceLock;

pub struct SharedFile<'data> {
    pub common: FileCommon,
    pub(crate) elf: elf::File<'data>,

    /// `DT_SONAME`, or the path the user gave us, or the filename.
    pub soname: String,

    /// Version strings from `SHT_GNU_VERDEF`, indexed by version number.
    pub version_names: Vec<&'data [u8]>,

    /// Per-symbol version indices (with `VERSYM_HIDDEN` stripped), parallel to `elf_syms`.
    pub versyms: Vec<u16>,

    pub dt_needed: Vec<&'data [u8]>,

    /// Dynamic symbols that take part in resolution: globals, minus `VER_NDX_LOCAL` entries.
    pub elf_syms: Vec<ElfSym>,

    pub symbols: Vec<&'data Symbol<'data>>,

    /// For default-versioned symbols, the `name@version` shadow of the entry in `symbols`.
    pub symbols2: Vec<Option<&'data Symbol<'data>>>,

    /// Indices into `symbols` owned by this file, sorted by symbol value. Built on first use.
    sorted_syms: OnceLock<Vec<u32>>,
}

impl<'data> SharedFile<'data> {
    pub(crate) fn new(
        elf: elf::File<'data>,
        input: &MappedFile<'data>,
        file_id: FileId,
    ) -> Result<Self> {
        Ok(Self {
            common: FileCommon::new(input, file_id, false),
            elf,
            soname: String::new(),
            version_names: Vec::new(),
            versyms: Vec::new(),
            dt_needed: Vec::new(),
            elf_syms: Vec::new(),
            symbols: Vec::new(),
            symbols2: Vec::new(),
            sorted_syms: OnceLock::new(),
        })
    }

    pub(crate) fn parse(&mut self, symbol_db: &SymbolDb<'data>) -> Result {
        let e = LittleEndian;

        let Some((_, symtab_shdr)) = self.elf.find_section(object::elf::SHT_DYNSYM) else {
            return Ok(());
        };
        let symbol_strtab = self.elf.strtab(symtab_shdr.sh_link.get(e) as usize)?;

        self.soname = self.get_soname()?;
        self.version_names = self.read_verdef()?;
        self.dt_needed = self.read_dynamic_strings(object::elf::DT_NEEDED)?;

        let esyms = self.elf.get_data::<ElfSym>(symtab_shdr)?;
        let vers: &[U16] = match self.elf.find_section(object::elf::SHT_GNU_VERSYM) {
            Some((_, shdr)) => self.elf.get_data::<U16>(shdr)?,
            None => &[],
        };

        for (i, esym) in esyms
            .iter()
            .enumerate()
            .skip(symtab_shdr.sh_info.get(e) as usize)
        {
            let raw_versym = if vers.is_empty() {
                object::elf::VER_NDX_GLOBAL
            } else {
                vers.get(i)
                    .with_context(|| {
                        format!("{}: .gnu.version is too short", self.common.display())
                    })?
                    .get(e)
            };

            let ver = if vers.is_empty() || esym.is_undefined(e) {
                object::elf::VER_NDX_GLOBAL
            } else {
                raw_versym & !object::elf::VERSYM_HIDDEN
            };
            if ver == object::elf::VER_NDX_LOCAL {
                continue;
            }

            let name = elf::str_in_table(symbol_strtab, esym.st_name(e))?;
            let is_hidden = !vers.is_empty() && raw_versym & object::elf::VERSYM_HIDDEN != 0;

            self.elf_syms.push(*esym);
            self.versyms.push(ver);

            if vers.is_empty() || ver == object::elf::VER_NDX_GLOBAL {
                // Unversioned symbol.
                self.symbols.push(symbol_db.get_symbol(name));
                self.symbols2.push(None);
            } else if is_hidden {
                // Versioned non-default symbol: only referable as `name@version`.
                self.symbols.push(self.versioned_symbol(symbol_db, name, ver)?);
                self.symbols2.push(None);
            } else {
                // Versioned default symbol: referable as both `name` and `name@version`.
                self.symbols.push(symbol_db.get_symbol(name));
                self.symbols2
                    .push(Some(self.versioned_symbol(symbol_db, name, ver)?));
            }
        }

        tracing::debug!(target: "metrics",
            file = %self.common.display(),
            dso_syms = self.elf_syms.len(),
            "parsed shared object");

        Ok(())
    }

    fn versioned_symbol(
        &self,
        symbol_db: &SymbolDb<'data>,
        name: &'data [u8],
        ver: u16,
    ) -> Result<&'data Symbol<'data>> {
        let version = self
            .version_names
            .get(ver as usize)
            .copied()
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                anyhow!("{}: invalid version index {ver}", self.common.display())
            })?;
        let key = symbol_db.save_concat(&[name, b"@", version]);
        Ok(symbol_db.get_symbol_with_name(key, &key[..name.len()]))
    }

    fn get_soname(&self) -> Result<String> {
        if let Some(soname) = self.read_dynamic_strings(object::elf::DT_SONAME)?.first() {
            return Ok(String::from_utf8_lossy(soname).into_owned());
        }
        if self.common.given_fullpath {
            return Ok(self.common.filename.display().to_string());
        }
        Ok(self
            .common
            .filename
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default())
    }

    /// Collects the string values of all dynamic entries with the given tag.
    fn read_dynamic_strings(&self, tag: u32) -> Result<Vec<&'data [u8]>> {
        let e = LittleEndian;
        let mut values = Vec::new();
        if let Some((_, dynamic)) = self.elf.find_section(object::elf::SHT_DYNAMIC) {
            let strtab = self.elf.strtab(dynamic.sh_link.get(e) as usize)?;
            for entry in self.elf.get_data::<DynamicEntry>(dynamic)? {
                if entry.d_tag.get(e) == u64::from(tag) {
                    values.push(elf::str_in_table(strtab, entry.d_val.get(e) as u32)?);
                }
            }
        }
        Ok(values)
    }

    /// Reads `SHT_GNU_VERDEF` into a version-number-indexed list of version strings.
    fn read_verdef(&self) -> Result<Vec<&'data [u8]>> {
        let e = LittleEndian;
        let Some((_, verdef_shdr)) = self.elf.find_section(object::elf::SHT_GNU_VERDEF) else {
            return Ok(Vec::new());
        };

        let data = self.elf.section_data(verdef_shdr)?;
        let strtab = self.elf.strtab(verdef_shdr.sh_link.get(e) as usize)?;
        let corrupt = || anyhow!("{}: corrupted version definitions", self.common.display());

        let mut names: Vec<&'data [u8]> = Vec::new();
        let mut offset = 0usize;
        loop {
            let (vd, _) = object::from_bytes::<Verdef>(data.get(offset..).ok_or_else(corrupt)?)
                .map_err(|()| corrupt())?;

            let ndx = vd.vd_ndx.get(e) as usize;
            if names.len() <= ndx {
                names.resize(ndx + 1, b"".as_slice());
            }

            let aux_offset = offset + vd.vd_aux.get(e) as usize;
            let (aux, _) =
                object::from_bytes::<Verdaux>(data.get(aux_offset..).ok_or_else(corrupt)?)
                    .map_err(|()| corrupt())?;
            names[ndx] = elf::str_in_table(strtab, aux.vda_name.get(e))?;

            let next = vd.vd_next.get(e) as usize;
            if next == 0 {
                break;
            }
            offset += next;
        }
        Ok(names)
    }

    /// All symbols this file defines at the same value as `sym`. Used by the copy-relocation
    /// logic to keep aliases consistent. The sorted index is built once, on first use.
    pub fn get_symbols_at(&self, sym: &Symbol<'data>) -> Vec<&'data Symbol<'data>> {
        let e = LittleEndian;
        debug_assert_eq!(sym.file(), Some(self.common.file_id));

        let sorted = self.sorted_syms.get_or_init(|| {
            let mut indices: Vec<u32> = (0..self.symbols.len() as u32)
                .filter(|&i| self.symbols[i as usize].file() == Some(self.common.file_id))
                .collect();
            indices.sort_by_key(|&i| (self.elf_syms[i as usize].st_value(e), i));
            indices
        });

        let value = self.elf_syms[sym.lock().sym_idx as usize].st_value(e);
        let start = sorted.partition_point(|&i| self.elf_syms[i as usize].st_value(e) < value);
        let end = sorted.partition_point(|&i| self.elf_syms[i as usize].st_value(e) <= value);
        sorted[start..end]
            .iter()
            .map(|&i| self.symbols[i as usize])
            .collect()
    }

    /// Conservatively infers the alignment of a symbol from its address and its section's
    /// alignment. Needed when the out-of-scope writer emits a copy relocation for it.
    pub fn get_alignment(&self, sym: &Symbol<'data>) -> u64 {
        let e = LittleEndian;
        let val = sym.resolution();
        let esym = &self.elf_syms[val.sym_idx as usize];
        let shndx = esym.st_shndx(e) as usize;
        let align = self
            .elf
            .sections
            .get(shndx)
            .map_or(1, |shdr| shdr.sh_addralign.get(e))
            .max(1);
        if val.value != 0 {
            align.min(1 << val.value.trailing_zeros())
        } else {
            align
        }
    }

    /// Whether the symbol lives in read-only mapped memory.
    pub fn is_readonly(&self, sym: &Symbol<'data>) -> Result<bool> {
        let e = LittleEndian;
        let val = sym.resolution();
        let address = self.elf_syms[val.sym_idx as usize].st_value(e);

        for phdr in self.elf.program_headers()? {
            let p_type = phdr.p_type.get(e);
            if !matches!(p_type, object::elf::PT_LOAD | object::elf::PT_GNU_RELRO) {
                continue;
            }
            if phdr.p_flags.get(e) & object::elf::PF_W != 0 {
                continue;
            }
            let vaddr = phdr.p_vaddr.get(e);
            if vaddr <= address && address < vaddr + phdr.p_memsz.get(e) {
                return Ok(true);
            }
        }
        Ok(false)
    }
}
