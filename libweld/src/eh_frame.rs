//! Structural parsing of `.eh_frame` input sections.
//!
//! Unlike most sections, `.eh_frame` can't be copied through verbatim: one section describes
//! exception handling for every function in its object, so after dead-section elimination it
//! would be full of records for functions that no longer exist, and identical CIEs repeat across
//! objects. We therefore decode each section into CIE and FDE records with their relocations
//! attached, and the output pass re-synthesizes a deduplicated section from the live records.

use crate::args::Args;
use crate::bail;
use crate::elf;
use crate::ensure;
use crate::error::Diagnostics;
use crate::error::Result;
use crate::object_file::ObjectFile;
use crate::object_file::esym_shndx;
use anyhow::anyhow;
use std::ops::Range;

/// A Common Information Entry. Offsets are relative to the start of the owning input section.
#[derive(Debug)]
pub struct CieRecord {
    pub section_idx: u32,
    pub input_offset: u32,
    /// Range into the owning section's relocation list.
    pub rel_range: Range<u32>,
}

/// A Frame Description Entry.
#[derive(Debug)]
pub struct FdeRecord {
    pub section_idx: u32,
    pub input_offset: u32,
    pub rel_range: Range<u32>,
    /// Index into the file's CIE list; always a CIE of the same input section.
    pub cie_idx: u32,
    pub is_alive: bool,
}

fn read_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(data[offset..offset + 4].try_into().unwrap())
}

/// The offset within an FDE at which its first relocation (the function start) must sit.
const FDE_FIRST_RELOC_OFFSET: u64 = 8;

pub(crate) fn parse_eh_frame(
    file: &mut ObjectFile,
    args: &Args,
    diagnostics: &Diagnostics,
) -> Result {
    let eh_sections = file.eh_frame_sections.clone();

    for &si in &eh_sections {
        let cies_begin = file.cies.len();
        let fdes_begin = file.fdes.len();

        let Some(isec) = &file.sections[si] else {
            continue;
        };
        let contents = file.elf.section_data(&isec.shdr)?;
        let rels = &isec.rels;
        debug_assert!(rels.is_sorted_by_key(|r| r.r_offset));

        let mut rel_idx = 0;
        let mut pos = 0;

        // Walk CIE and FDE records until the terminator or the end of the section. Each record
        // is a 32-bit length (zero terminates), then a 32-bit field that distinguishes CIEs
        // (zero) from FDEs (a back-pointer to their CIE).
        while pos < contents.len() {
            ensure!(
                contents.len() - pos >= 4,
                "{}: corrupted .eh_frame",
                file.common.display()
            );
            let size = read_u32(contents, pos) as usize;
            if size == 0 {
                break;
            }
            ensure!(
                contents.len() - pos >= 8,
                "{}: corrupted .eh_frame",
                file.common.display()
            );
            let begin_offset = pos;
            let end_offset = begin_offset + size + 4;
            ensure!(
                end_offset <= contents.len(),
                "{}: corrupted .eh_frame record length",
                file.common.display()
            );
            let id = read_u32(contents, begin_offset + 4);
            pos = end_offset;

            let rel_begin = rel_idx;
            while rel_idx < rels.len() && (rels[rel_idx].r_offset as usize) < end_offset {
                rel_idx += 1;
            }

            if id == 0 {
                file.cies.push(CieRecord {
                    section_idx: si as u32,
                    input_offset: begin_offset as u32,
                    rel_range: rel_begin as u32..rel_idx as u32,
                });
            } else {
                if rel_begin == rel_idx || rels[rel_begin].r_sym == 0 {
                    // An FDE with no usable relocation is dead on arrival. Compilers don't
                    // produce these, but `ld -r` output can.
                    continue;
                }
                if rels[rel_begin].r_offset - begin_offset as u64 != FDE_FIRST_RELOC_OFFSET {
                    bail!(
                        "{}: FDE's first relocation should have offset 8",
                        file.common.display()
                    );
                }
                file.fdes.push(FdeRecord {
                    section_idx: si as u32,
                    input_offset: begin_offset as u32,
                    rel_range: rel_begin as u32..rel_idx as u32,
                    cie_idx: 0,
                    is_alive: true,
                });
            }
        }

        // Associate each FDE with its CIE. The back-pointer is relative to its own position, and
        // always refers within the same input section.
        for fi in fdes_begin..file.fdes.len() {
            let off = file.fdes[fi].input_offset as usize;
            let cie_ptr = read_u32(contents, off + 4) as i32;
            let target = off as i64 + 4 - i64::from(cie_ptr);
            let cie_idx = (cies_begin..file.cies.len())
                .find(|&ci| i64::from(file.cies[ci].input_offset) == target)
                .ok_or_else(|| anyhow!("{}: bad FDE pointer", file.common.display()))?;
            file.fdes[fi].cie_idx = cie_idx as u32;
        }

        // The section's contents are consumed structurally rather than copied.
        if let Some(isec) = &mut file.sections[si] {
            isec.is_alive = false;
        }
    }

    if args.pic {
        report_absolute_cie_relocations(file, args, diagnostics);
    }

    group_fdes_by_section(file);
    Ok(())
}

/// Position-independent output can't carry absolute relocations in `.eh_frame`.
fn report_absolute_cie_relocations(file: &ObjectFile, args: &Args, diagnostics: &Diagnostics) {
    for cie in &file.cies {
        let Some(isec) = &file.sections[cie.section_idx as usize] else {
            continue;
        };
        for rel in &isec.rels[cie.rel_range.start as usize..cie.rel_range.end as usize] {
            if rel.r_type == args.arch.r_abs() {
                let name = file
                    .elf_syms
                    .get(rel.r_sym as usize)
                    .and_then(|esym| {
                        use object::read::elf::Sym as _;
                        elf::str_in_table(file.symbol_strtab, esym.st_name(object::LittleEndian))
                            .ok()
                    })
                    .unwrap_or_default();
                diagnostics.error(anyhow!(
                    "{}: relocation against `{}` in .eh_frame can not be used when making a \
                     position-independent output; recompile with -fPIE or -fPIC",
                    file.common.display(),
                    String::from_utf8_lossy(name)
                ));
            }
        }
    }
}

/// Sorts FDEs so that FDEs covering the same input section are contiguous, then records each
/// section's range. FDEs whose target section is gone or dead stay in the list but are marked
/// dead themselves.
fn group_fdes_by_section(file: &mut ObjectFile) {
    let elf_syms = file.elf_syms;
    let shndx_table = file.symtab_shndx;

    let target_of = |fde: &FdeRecord, sections: &[Option<crate::object_file::InputSection>]| {
        let isec = sections[fde.section_idx as usize].as_ref()?;
        let rel = isec.rels.get(fde.rel_range.start as usize)?;
        let esym = elf_syms.get(rel.r_sym as usize)?;
        Some(esym_shndx(esym, rel.r_sym as usize, shndx_table))
    };

    let fdes = std::mem::take(&mut file.fdes);
    let mut keyed: Vec<(Option<u32>, FdeRecord)> = fdes
        .into_iter()
        .map(|fde| (target_of(&fde, &file.sections), fde))
        .collect();
    keyed.sort_by_key(|(target, _)| target.unwrap_or(u32::MAX));

    let mut i = 0;
    while i < keyed.len() {
        let Some(target) = keyed[i].0 else {
            keyed[i].1.is_alive = false;
            i += 1;
            continue;
        };
        let section_alive = file
            .sections
            .get(target as usize)
            .and_then(Option::as_ref)
            .is_some_and(|isec| isec.is_alive);
        if section_alive {
            let begin = i;
            i += 1;
            while i < keyed.len() && keyed[i].0 == Some(target) {
                i += 1;
            }
            let isec = file.sections[target as usize].as_mut().unwrap();
            debug_assert!(isec.fde_range.is_none());
            isec.fde_range = Some(begin as u32..i as u32);
        } else {
            keyed[i].1.is_alive = false;
            i += 1;
        }
    }

    file.fdes = keyed.into_iter().map(|(_, fde)| fde).collect();
}
