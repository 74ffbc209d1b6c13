//! Handling for `SHF_MERGE` input sections. A mergeable section is not an atomic unit of
//! inclusion: we split it into pieces (at NUL terminators for string sections, at `sh_entsize`
//! boundaries otherwise) and intern each piece by content into a `MergedSection` shared by all
//! files, so duplicate literals collapse to one fragment.
//!
//! Downstream GC and ICF work on a graph whose vertices are sections and fragments, so after
//! splitting we rewrite this file's symbols and relocations until every non-absolute reference
//! into a former mergeable section names a single fragment: defined symbols get a fragment
//! attached, and relocations against section symbols are redirected to synthetic per-file
//! "fragment symbols" whose indices sit just past the real symbol table.

use crate::bail;
use crate::elf::SectionFlags;
use crate::elf::shf;
use crate::error::Result;
use crate::hash::PassThroughHashMap;
use crate::hash::PreHashed;
use crate::object_file::ObjectFile;
use crate::object_file::esym_shndx;
use crate::symbol::Symbol;
use crate::symbol::SymbolPlace;
use crate::symbol::Visibility;
use crate::symbol_db::SymbolDb;
use colosseum::sync::Arena;
use hashbrown::HashMap;
use object::LittleEndian;
use object::read::elf::Sym as _;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering;

pub(crate) const FRAGMENT_SYMBOL_NAME: &[u8] = b"<fragment>";

/// Registry of merged output sections, interned by name, flags and entry size.
pub(crate) struct MergedSections<'data> {
    map: Mutex<HashMap<MergedSectionKey<'data>, &'data MergedSection<'data>>>,
    sections: &'data Arena<MergedSection<'data>>,
    pub(crate) fragments: &'data Arena<SectionFragment<'data>>,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
struct MergedSectionKey<'data> {
    name: &'data [u8],
    flags: u64,
    entsize: u64,
}

impl<'data> MergedSections<'data> {
    pub(crate) fn new(
        sections: &'data Arena<MergedSection<'data>>,
        fragments: &'data Arena<SectionFragment<'data>>,
    ) -> Self {
        Self {
            map: Mutex::new(HashMap::new()),
            sections,
            fragments,
        }
    }

    /// Returns the merged section that inputs with the given name and header merge into, or None
    /// if the section can't be split (no usable entry size).
    pub(crate) fn get_instance(
        &self,
        name: &'data [u8],
        shdr: &crate::elf::SectionHeader,
    ) -> Option<&'data MergedSection<'data>> {
        let e = LittleEndian;
        let flags = shdr.sh_flags.get(e);
        let mut entsize = shdr.sh_entsize.get(e);
        if entsize == 0 {
            entsize = if SectionFlags::from_u64(flags).contains(shf::STRINGS) {
                1
            } else {
                shdr.sh_addralign.get(e)
            };
        }
        if entsize == 0 {
            return None;
        }

        let key = MergedSectionKey {
            name,
            flags,
            entsize,
        };
        let mut map = self.map.lock().unwrap();
        Some(*map.entry(key).or_insert_with(|| {
            &*self.sections.alloc(MergedSection {
                name,
                flags: SectionFlags::from_u64(flags),
                entsize,
                map: Mutex::new(PassThroughHashMap::default()),
            })
        }))
    }
}

pub struct MergedSection<'data> {
    pub name: &'data [u8],
    pub flags: SectionFlags,
    pub entsize: u64,

    /// Fragments interned by content.
    map: Mutex<PassThroughHashMap<&'data [u8], &'data SectionFragment<'data>>>,
}

impl<'data> MergedSection<'data> {
    fn insert(
        &self,
        arena: &'data Arena<SectionFragment<'data>>,
        data: &'data [u8],
        p2align: u8,
    ) -> &'data SectionFragment<'data> {
        let hashed = PreHashed::from_bytes(data);
        let mut map = self.map.lock().unwrap();
        let frag = *map.entry(hashed).or_insert_with(|| {
            &*arena.alloc(SectionFragment {
                data,
                is_alive: AtomicBool::new(true),
                p2align: AtomicU8::new(0),
            })
        });
        frag.p2align.fetch_max(p2align, Ordering::AcqRel);
        frag
    }

    pub fn num_fragments(&self) -> usize {
        self.map.lock().unwrap().len()
    }
}

/// One piece of a merged section. Identical pieces from different files are the same fragment.
pub struct SectionFragment<'data> {
    pub data: &'data [u8],

    /// Cleared by the GC pass (out of scope here); everything starts live.
    pub is_alive: AtomicBool,

    pub p2align: AtomicU8,
}

/// A former `SHF_MERGE` input section, now just a mapping from input offsets to fragments of its
/// parent merged section.
pub struct MergeableSection<'data> {
    pub parent: &'data MergedSection<'data>,
    pub p2align: u8,
    frag_offsets: Vec<u64>,
    fragments: Vec<&'data SectionFragment<'data>>,
}

impl<'data> MergeableSection<'data> {
    /// Finds the fragment containing `offset`. Returns the fragment and the offset within it.
    pub fn get_fragment(&self, offset: u64) -> Option<(&'data SectionFragment<'data>, u64)> {
        let idx = self
            .frag_offsets
            .partition_point(|&start| start <= offset)
            .checked_sub(1)?;
        Some((self.fragments[idx], offset - self.frag_offsets[idx]))
    }
}

/// Replaces this file's unrelocated `SHF_MERGE` sections with piece-oriented wrappers, interning
/// each piece into the shared merged section.
pub(crate) fn convert_mergeable_sections<'data>(
    file: &mut ObjectFile<'data>,
    merged: &MergedSections<'data>,
) -> Result {
    let e = LittleEndian;

    for i in 0..file.sections.len() {
        let Some(isec) = &file.sections[i] else {
            continue;
        };
        if isec.shdr.sh_size.get(e) == 0 || isec.relsec_idx.is_some() {
            continue;
        }
        if !isec.flags().contains(shf::MERGE) {
            continue;
        }
        let Some(parent) = merged.get_instance(isec.name, &isec.shdr) else {
            continue;
        };

        let data = file.elf.section_data(&isec.shdr)?;
        let addralign = isec.shdr.sh_addralign.get(e);
        let p2align = if addralign == 0 { 0 } else { addralign.trailing_zeros() as u8 };
        let is_strings = isec.flags().contains(shf::STRINGS);

        let mergeable = split_pieces(parent, merged.fragments, data, parent.entsize, is_strings, p2align)
            .map_err(|error| {
                error.context(format!(
                    "{}: invalid mergeable section {}",
                    file.common.display(),
                    String::from_utf8_lossy(isec.name)
                ))
            })?;

        file.mergeable_sections[i] = Some(mergeable);
        file.sections[i] = None;
    }
    Ok(())
}

fn split_pieces<'data>(
    parent: &'data MergedSection<'data>,
    arena: &'data Arena<SectionFragment<'data>>,
    data: &'data [u8],
    entsize: u64,
    is_strings: bool,
    p2align: u8,
) -> Result<MergeableSection<'data>> {
    let entsize = entsize as usize;
    let mut frag_offsets = Vec::new();
    let mut fragments = Vec::new();

    if is_strings {
        let mut pos = 0;
        while pos < data.len() {
            let end = find_terminator(data, pos, entsize)
                .ok_or_else(|| anyhow::anyhow!("string is not NUL terminated"))?;
            let piece = &data[pos..end + entsize];
            frag_offsets.push(pos as u64);
            fragments.push(parent.insert(arena, piece, p2align));
            pos = end + entsize;
        }
    } else {
        if data.len() % entsize != 0 {
            bail!("section size is not a multiple of sh_entsize");
        }
        for (n, piece) in data.chunks_exact(entsize).enumerate() {
            frag_offsets.push((n * entsize) as u64);
            fragments.push(parent.insert(arena, piece, p2align));
        }
    }

    Ok(MergeableSection {
        parent,
        p2align,
        frag_offsets,
        fragments,
    })
}

/// Finds the offset of the entry-sized NUL terminator of the string starting at `pos`.
fn find_terminator(data: &[u8], pos: usize, entsize: usize) -> Option<usize> {
    if entsize == 1 {
        return memchr::memchr(0, &data[pos..]).map(|i| pos + i);
    }
    let mut i = pos;
    while i + entsize <= data.len() {
        if data[i..i + entsize].iter().all(|&b| b == 0) {
            return Some(i);
        }
        i += entsize;
    }
    None
}

/// Rewrites this file's symbols and relocations to refer to fragments.
///
/// Defined local symbols in a mergeable section get their fragment attached here. Globals are
/// validated here but pick their fragment up when resolution claims them, so that every write to
/// a shared symbol stays under its mutex. Relocations whose target is the section symbol of a
/// mergeable get redirected to a synthetic hidden symbol placed past the real symbol range, with
/// `value` chosen so that `value + addend` lands at the referenced piece offset.
pub(crate) fn reattach_section_pieces<'data>(
    file: &mut ObjectFile<'data>,
    db: &SymbolDb<'data>,
) -> Result {
    let e = LittleEndian;
    let elf_syms = file.elf_syms;
    let shndx_table = file.symtab_shndx;

    for (i, esym) in elf_syms.iter().enumerate().skip(1) {
        if crate::elf::esym_is_abs(esym)
            || crate::elf::esym_is_common(esym)
            || esym.is_undefined(e)
        {
            continue;
        }
        let shndx = esym_shndx(esym, i, shndx_table) as usize;
        let Some(m) = file.mergeable_sections.get(shndx).and_then(|m| m.as_ref()) else {
            continue;
        };
        let st_value = esym.st_value(e);
        let Some((frag, offset)) = m.get_fragment(st_value) else {
            bail!(
                "{}: bad symbol value: {st_value:#x}",
                file.common.display()
            );
        };
        if i < file.first_global {
            let mut val = file.symbols[i].lock();
            val.place = SymbolPlace::Fragment(frag);
            val.value = offset;
        }
    }

    let num_esyms = elf_syms.len();

    for si in 0..file.sections.len() {
        let Some(isec) = file.sections[si].as_mut() else {
            continue;
        };
        if !isec.flags().contains(shf::ALLOC) {
            continue;
        }
        for rel in &mut isec.rels {
            let Some(esym) = elf_syms.get(rel.r_sym as usize) else {
                bail!(
                    "{}: relocation has invalid symbol index {}",
                    file.common.display(),
                    rel.r_sym
                );
            };
            if esym.st_type() != object::elf::STT_SECTION {
                continue;
            }
            let shndx = esym_shndx(esym, rel.r_sym as usize, shndx_table) as usize;
            let Some(m) = file.mergeable_sections.get(shndx).and_then(|m| m.as_ref()) else {
                continue;
            };

            let lookup = esym.st_value(e) as i64 + rel.r_addend;
            let frag_and_offset =
                u64::try_from(lookup).ok().and_then(|offset| m.get_fragment(offset));
            let Some((frag, in_frag_offset)) = frag_and_offset else {
                bail!("{}: bad relocation at {}", file.common.display(), rel.r_sym);
            };

            let sym = Symbol::new_local(
                FRAGMENT_SYMBOL_NAME,
                file.common.file_id,
                rel.r_sym,
                (in_frag_offset as i64 - rel.r_addend) as u64,
                SymbolPlace::Fragment(frag),
            );
            sym.merge_visibility(Visibility::Hidden);
            // Fragment symbols are indexed past the real symbol table, so `r_sym` stays a
            // single-space integer.
            debug_assert!(file.symbols.len() >= num_esyms);
            rel.r_sym = u32::try_from(file.symbols.len()).expect("too many symbols");
            file.symbols.push(db.alloc_symbol(sym));
        }
    }

    Ok(())
}
