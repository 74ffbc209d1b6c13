//! Sizing and population of the output symbol and string tables. Each file computes which of its
//! symbols survive and how much name storage they need; a prefix-sum pass then assigns every file
//! its slice of the output tables, and population runs per file over disjoint sub-slices.
//!
//! The import/export flags consulted for local demotion are assigned by the driver's export pass
//! (version scripts, dynamic-symbol selection), which runs between resolution and sizing.

use crate::args::Args;
use crate::context::Context;
use crate::elf::ElfSym;
use crate::elf::U16;
use crate::elf::U32;
use crate::elf::U64;
use crate::elf::shf;
use crate::ensure;
use crate::error::Result;
use crate::input_data::FileId;
use crate::object_file::ObjectFile;
use crate::parsing::InputFile;
use crate::shared_file::SharedFile;
use crate::string_merging::SectionFragment;
use crate::symbol::Symbol;
use crate::symbol::SymbolFlags;
use crate::symbol::SymbolPlace;
use crate::symbol::SymbolValue;
use object::LittleEndian;
use object::read::elf::Sym as _;
use rayon::iter::IndexedParallelIterator;
use rayon::iter::IntoParallelIterator;
use rayon::iter::IntoParallelRefIterator;
use rayon::iter::IntoParallelRefMutIterator;
use rayon::iter::ParallelIterator;
use std::sync::atomic::Ordering;

/// Maps input sections and fragments to output section indices. Implemented by the (out-of-scope)
/// layout pass; tests supply trivial mappings.
pub trait OutputIndexes: Sync {
    fn section_shndx(&self, file: FileId, section_index: u32) -> u32;
    fn fragment_shndx(&self, fragment: &SectionFragment) -> u32;
}

#[derive(Debug, Clone, Copy)]
pub struct SymtabLayout {
    /// Total entries in the output symtab, including the null entry at index 0.
    pub num_symtab_entries: u32,
    /// Index of the first global entry (== `sh_info` of the output symtab).
    pub first_global_index: u32,
    /// Total bytes of the output strtab, including the leading NUL.
    pub strtab_size: u64,
}

pub struct SymtabBuffers<'out> {
    pub symtab: &'out mut [ElfSym],
    pub strtab: &'out mut [u8],
    /// Extended-index table, parallel to `symtab`, for outputs with ≥ SHN_LORESERVE sections.
    pub symtab_shndx: Option<&'out mut [U32]>,
}

fn symbol_is_alive(file: &ObjectFile, val: &SymbolValue) -> bool {
    match val.place {
        SymbolPlace::Fragment(frag) => frag.is_alive.load(Ordering::Acquire),
        SymbolPlace::Section(idx) => file
            .sections
            .get(idx as usize)
            .and_then(Option::as_ref)
            .is_some_and(|isec| isec.is_alive),
        SymbolPlace::None | SymbolPlace::ShadowOf(_) => true,
    }
}

/// Whether a local symbol is written to the output symtab. Section symbols never are. Compiler
/// temporaries (`.L*`, and the odd `L0\x01` some assemblers emit) are dropped under
/// `--discard-locals`, and always when they live in a mergeable section, where merging makes
/// their origin meaningless.
fn should_write_to_local_symtab(
    args: &Args,
    file: &ObjectFile,
    index: usize,
    val: &SymbolValue,
) -> bool {
    if file.elf_syms[index].st_type() == object::elf::STT_SECTION {
        return false;
    }

    let name = file.symbols[index].name();
    if name.starts_with(b".L") || name == b"L0\x01" {
        if args.discard_locals {
            return false;
        }
        let in_merge_section = match val.place {
            SymbolPlace::Fragment(_) => true,
            SymbolPlace::Section(idx) => file
                .sections
                .get(idx as usize)
                .and_then(Option::as_ref)
                .is_some_and(|isec| isec.flags().contains(shf::MERGE)),
            _ => false,
        };
        if in_merge_section {
            return false;
        }
    }

    true
}

#[tracing::instrument(skip_all, name = "Compute symtab sizes")]
pub fn compute_symtab_sizes(ctx: &mut Context) {
    let args = ctx.args;
    ctx.files.par_iter_mut().for_each(|file| match file {
        InputFile::Object(o) => compute_object_symtab_size(args, o),
        InputFile::Shared(s) => compute_dso_symtab_size(args, s),
    });
}

fn compute_object_symtab_size(args: &Args, file: &mut ObjectFile) {
    if !file.common.is_reachable() {
        return;
    }
    file.common.output_sym_indices = vec![-1; file.elf_syms.len()];

    let keep_locals =
        !args.discard_all && !args.strip_all && args.retain_symbols_file.is_none();
    if keep_locals {
        for i in 1..file.first_global {
            let sym = file.symbols[i];
            let val = sym.resolution();
            if symbol_is_alive(file, &val) && should_write_to_local_symtab(args, file, i, &val) {
                file.common.strtab_size += sym.name().len() as u64 + 1;
                file.common.output_sym_indices[i] = file.common.num_local_symtab as i32;
                file.common.num_local_symtab += 1;
                sym.set_flags(SymbolFlags::WRITE_TO_SYMTAB);
            }
        }
    }

    for i in file.first_global..file.elf_syms.len() {
        let sym = file.symbols[i];
        let val = sym.resolution();
        if val.file == Some(file.common.file_id)
            && symbol_is_alive(file, &val)
            && (args.retain_symbols_file.is_none() || sym.has_flags(SymbolFlags::WRITE_TO_SYMTAB))
        {
            file.common.strtab_size += sym.name().len() as u64 + 1;
            // Globals can be demoted to the local partition by visibility or version scripts.
            if sym.is_local() {
                file.common.output_sym_indices[i] = file.common.num_local_symtab as i32;
                file.common.num_local_symtab += 1;
            } else {
                file.common.output_sym_indices[i] = file.common.num_global_symtab as i32;
                file.common.num_global_symtab += 1;
            }
            sym.set_flags(SymbolFlags::WRITE_TO_SYMTAB);
        }
    }
}

fn compute_dso_symtab_size(args: &Args, file: &mut SharedFile) {
    if !file.common.is_reachable() {
        return;
    }
    file.common.output_sym_indices = vec![-1; file.elf_syms.len()];

    for i in 0..file.elf_syms.len() {
        let sym = file.symbols[i];
        if sym.file() == Some(file.common.file_id)
            && sym
                .flags()
                .intersects(SymbolFlags::IMPORTED | SymbolFlags::EXPORTED)
            && (args.retain_symbols_file.is_none() || sym.has_flags(SymbolFlags::WRITE_TO_SYMTAB))
        {
            file.common.strtab_size += sym.name().len() as u64 + 1;
            file.common.output_sym_indices[i] = file.common.num_global_symtab as i32;
            file.common.num_global_symtab += 1;
            sym.set_flags(SymbolFlags::WRITE_TO_SYMTAB);
        }
    }
}

/// Assigns each file its slice of the output tables: all locals first (after the null entry at
/// index 0), then all globals; string-table offsets likewise after the leading NUL.
#[tracing::instrument(skip_all, name = "Finalize symtab layout")]
pub fn finalize_symtab_layout(ctx: &mut Context) -> SymtabLayout {
    let mut local_idx = 1u32;
    for file in &mut ctx.files {
        let common = file.common_mut();
        common.local_symtab_idx = local_idx;
        local_idx += common.num_local_symtab;
    }

    let first_global_index = local_idx;
    let mut global_idx = local_idx;
    for file in &mut ctx.files {
        let common = file.common_mut();
        common.global_symtab_idx = global_idx;
        global_idx += common.num_global_symtab;
    }

    let mut strtab_offset = 1u64;
    for file in &mut ctx.files {
        let common = file.common_mut();
        common.strtab_offset = strtab_offset;
        strtab_offset += common.strtab_size;
    }

    SymtabLayout {
        num_symtab_entries: global_idx,
        first_global_index,
        strtab_size: strtab_offset,
    }
}

struct FileShards<'out> {
    locals: &'out mut [ElfSym],
    globals: &'out mut [ElfSym],
    locals_shndx: Option<&'out mut [U32]>,
    globals_shndx: Option<&'out mut [U32]>,
    strtab: &'out mut [u8],
}

fn take<'a, T>(buf: &mut &'a mut [T], n: usize) -> &'a mut [T] {
    let rest = std::mem::take(buf);
    let (head, rest) = rest.split_at_mut(n);
    *buf = rest;
    head
}

/// Writes one `ElfSym` and one NUL-terminated name per surviving symbol into the driver-provided
/// buffers. The null entry at index 0 and the leading strtab NUL are left as the driver zeroed
/// them.
#[tracing::instrument(skip_all, name = "Populate symtabs")]
pub fn populate_symtabs(
    ctx: &Context,
    layout: &SymtabLayout,
    out: SymtabBuffers,
    indexes: &dyn OutputIndexes,
) -> Result {
    ensure!(
        out.symtab.len() >= layout.num_symtab_entries as usize,
        "symtab buffer is too small"
    );
    ensure!(
        out.strtab.len() >= layout.strtab_size as usize,
        "strtab buffer is too small"
    );
    if let Some(shndx) = &out.symtab_shndx {
        ensure!(
            shndx.len() >= layout.num_symtab_entries as usize,
            "symtab_shndx buffer is too small"
        );
    }

    // Carve the buffers into disjoint per-file shards so population can run in parallel.
    let num_locals = (layout.first_global_index - 1) as usize;
    let (_null, sym_rest) = out.symtab.split_at_mut(1);
    let (mut locals_buf, mut globals_buf) = sym_rest.split_at_mut(num_locals);

    let (mut locals_shndx_buf, mut globals_shndx_buf) = match out.symtab_shndx {
        Some(shndx) => {
            let (_null, rest) = shndx.split_at_mut(1);
            let (l, g) = rest.split_at_mut(num_locals);
            (Some(l), Some(g))
        }
        None => (None, None),
    };

    let (_null, mut strtab_buf) = out.strtab.split_at_mut(1);

    let mut shards = Vec::with_capacity(ctx.files.len());
    for file in &ctx.files {
        let common = file.common();
        shards.push(FileShards {
            locals: take(&mut locals_buf, common.num_local_symtab as usize),
            globals: take(&mut globals_buf, common.num_global_symtab as usize),
            locals_shndx: locals_shndx_buf
                .as_mut()
                .map(|buf| take(buf, common.num_local_symtab as usize)),
            globals_shndx: globals_shndx_buf
                .as_mut()
                .map(|buf| take(buf, common.num_global_symtab as usize)),
            strtab: take(&mut strtab_buf, common.strtab_size as usize),
        });
    }

    ctx.files
        .par_iter()
        .zip(shards.into_par_iter())
        .for_each(|(file, mut shard)| match file {
            InputFile::Object(o) => populate_object_symtab(o, &mut shard, indexes),
            InputFile::Shared(s) => populate_dso_symtab(s, &mut shard, indexes),
        });

    Ok(())
}

fn populate_object_symtab(file: &ObjectFile, shard: &mut FileShards, indexes: &dyn OutputIndexes) {
    if !file.common.is_reachable() {
        return;
    }
    let mut str_off = 0usize;

    for i in 1..file.elf_syms.len() {
        let out_idx = file.common.output_sym_indices[i];
        if out_idx < 0 {
            continue;
        }
        let out_idx = out_idx as usize;
        let sym = file.symbols[i];
        let val = sym.resolution();
        let is_local_out = i < file.first_global || sym.is_local();

        let (entries, shndx_entries) = if is_local_out {
            (&mut *shard.locals, shard.locals_shndx.as_deref_mut())
        } else {
            (&mut *shard.globals, shard.globals_shndx.as_deref_mut())
        };

        let name_off = file.common.strtab_offset + str_off as u64;
        entries[out_idx] = to_output_esym(
            file.common.file_id,
            &file.elf_syms[i],
            sym,
            &val,
            name_off as u32,
            is_local_out,
            indexes,
            shndx_entries.map(|entries| &mut entries[out_idx]),
        );
        str_off += write_name(&mut shard.strtab[str_off..], sym.name());
    }
}

fn populate_dso_symtab(file: &SharedFile, shard: &mut FileShards, indexes: &dyn OutputIndexes) {
    if !file.common.is_reachable() {
        return;
    }
    let mut str_off = 0usize;

    for i in 0..file.elf_syms.len() {
        let out_idx = file.common.output_sym_indices[i];
        if out_idx < 0 {
            continue;
        }
        let out_idx = out_idx as usize;
        let sym = file.symbols[i];
        let val = sym.resolution();

        let name_off = file.common.strtab_offset + str_off as u64;
        let shndx_slot = shard
            .globals_shndx
            .as_deref_mut()
            .map(|entries| &mut entries[out_idx]);
        shard.globals[out_idx] = to_output_esym(
            file.common.file_id,
            &file.elf_syms[i],
            sym,
            &val,
            name_off as u32,
            false,
            indexes,
            shndx_slot,
        );
        str_off += write_name(&mut shard.strtab[str_off..], sym.name());
    }
}

fn write_name(strtab: &mut [u8], name: &[u8]) -> usize {
    strtab[..name.len()].copy_from_slice(name);
    strtab[name.len()] = 0;
    name.len() + 1
}

#[allow(clippy::too_many_arguments)]
fn to_output_esym(
    owner: FileId,
    esym_in: &ElfSym,
    sym: &Symbol,
    val: &SymbolValue,
    st_name: u32,
    is_local_out: bool,
    indexes: &dyn OutputIndexes,
    xindex: Option<&mut U32>,
) -> ElfSym {
    let e = LittleEndian;

    let bind = if is_local_out {
        object::elf::STB_LOCAL
    } else if val.is_weak {
        object::elf::STB_WEAK
    } else {
        object::elf::STB_GLOBAL
    };

    let (shndx_val, is_section_ref) = match val.place {
        SymbolPlace::Section(idx) => (indexes.section_shndx(owner, idx), true),
        SymbolPlace::Fragment(frag) => (indexes.fragment_shndx(frag), true),
        SymbolPlace::None | SymbolPlace::ShadowOf(_) => {
            if esym_in.is_undefined(e) {
                (u32::from(object::elf::SHN_UNDEF), false)
            } else if crate::elf::esym_is_common(esym_in) {
                (u32::from(object::elf::SHN_COMMON), false)
            } else {
                (u32::from(object::elf::SHN_ABS), false)
            }
        }
    };

    let st_shndx = if is_section_ref && shndx_val >= u32::from(object::elf::SHN_LORESERVE) {
        if let Some(xindex) = xindex {
            xindex.set(e, shndx_val);
        }
        object::elf::SHN_XINDEX
    } else {
        shndx_val as u16
    };

    ElfSym {
        st_name: U32::new(e, st_name),
        st_info: (bind << 4) | esym_in.st_type(),
        st_other: sym.visibility().to_elf(),
        st_shndx: U16::new(e, st_shndx),
        st_value: U64::new(e, val.value),
        st_size: U64::new(e, esym_in.st_size(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::Architecture;
    use crate::args::Args;
    use crate::context::Arenas;
    use crate::link_inputs;
    use crate::test_elf::SecSpec;
    use crate::test_elf::SymSpec;
    use crate::test_elf::TestElf;
    use crate::test_elf::mapped;

    struct TestIndexes;

    impl OutputIndexes for TestIndexes {
        fn section_shndx(&self, _file: FileId, section_index: u32) -> u32 {
            section_index + 1
        }

        fn fragment_shndx(&self, _fragment: &SectionFragment) -> u32 {
            42
        }
    }

    fn zeroed_esym() -> ElfSym {
        let e = LittleEndian;
        ElfSym {
            st_name: U32::new(e, 0),
            st_info: 0,
            st_other: 0,
            st_shndx: U16::new(e, 0),
            st_value: U64::new(e, 0),
            st_size: U64::new(e, 0),
        }
    }

    fn test_object() -> Vec<u8> {
        TestElf::object()
            .section(SecSpec::text(".text", 16))
            .section(SecSpec::merge_strings(".rodata.str1.1", b"lit\0"))
            .symbol(SymSpec::section_sym(1))
            .symbol(SymSpec::local("keep_me", 1, 4))
            .symbol(SymSpec::local(".Ltmp0", 1, 8))
            .symbol(SymSpec::local(".Lstr", 2, 0))
            .symbol(SymSpec::global("entry", 1, 0))
            .build()
    }

    fn run_sizing(args: &Args, bytes: &[u8]) -> (u32, u32, u64) {
        let arenas = Arenas::new();
        let mut ctx = crate::Context::new(args, &arenas);
        link_inputs(&mut ctx, vec![mapped(bytes, "t.o", 0)]).unwrap();
        ctx.get_symbol(b"entry").set_flags(SymbolFlags::EXPORTED);
        compute_symtab_sizes(&mut ctx);
        let common = ctx.files[0].common();
        (
            common.num_local_symtab,
            common.num_global_symtab,
            common.strtab_size,
        )
    }

    #[test]
    fn local_survivor_policy() {
        let bytes = test_object();
        let args = Args::new(Architecture::X86_64);
        // Section symbols are always dropped; the .L symbol in the merge section is always
        // dropped; the other two locals and the exported global survive.
        let (locals, globals, strtab) = run_sizing(&args, &bytes);
        assert_eq!(locals, 2);
        assert_eq!(globals, 1);
        assert_eq!(
            strtab,
            ("keep_me".len() + 1 + ".Ltmp0".len() + 1 + "entry".len() + 1) as u64
        );

        let mut args = Args::new(Architecture::X86_64);
        args.discard_locals = true;
        let (locals, _, _) = run_sizing(&args, &bytes);
        assert_eq!(locals, 1); // .Ltmp0 dropped too

        let mut args = Args::new(Architecture::X86_64);
        args.strip_all = true;
        let (locals, globals, _) = run_sizing(&args, &bytes);
        assert_eq!(locals, 0);
        assert_eq!(globals, 1);
    }

    #[test]
    fn unexported_globals_demote_to_the_local_partition() {
        let bytes = test_object();
        let args = Args::new(Architecture::X86_64);
        let arenas = Arenas::new();
        let mut ctx = crate::Context::new(&args, &arenas);
        link_inputs(&mut ctx, vec![mapped(&bytes, "t.o", 0)]).unwrap();
        // Without import/export flags the global counts as local in the output.
        compute_symtab_sizes(&mut ctx);
        let common = ctx.files[0].common();
        assert_eq!(common.num_local_symtab, 3);
        assert_eq!(common.num_global_symtab, 0);
    }

    #[test]
    fn populate_writes_symbols_and_names() {
        let bytes_a = test_object();
        let bytes_b = TestElf::object()
            .section(SecSpec::text(".text", 8))
            .symbol(SymSpec::global("second", 1, 2))
            .build();
        let args = Args::new(Architecture::X86_64);
        let arenas = Arenas::new();
        let mut ctx = crate::Context::new(&args, &arenas);
        link_inputs(
            &mut ctx,
            vec![mapped(&bytes_a, "a.o", 0), mapped(&bytes_b, "b.o", 1)],
        )
        .unwrap();
        ctx.get_symbol(b"entry").set_flags(SymbolFlags::EXPORTED);
        ctx.get_symbol(b"second").set_flags(SymbolFlags::EXPORTED);

        compute_symtab_sizes(&mut ctx);
        let layout = finalize_symtab_layout(&mut ctx);

        // a.o: 2 locals + 1 global; b.o: 0 locals + 1 global; plus the null entry.
        assert_eq!(layout.first_global_index, 3);
        assert_eq!(layout.num_symtab_entries, 5);

        let mut symtab = vec![zeroed_esym(); layout.num_symtab_entries as usize];
        let mut strtab = vec![0u8; layout.strtab_size as usize];
        populate_symtabs(
            &ctx,
            &layout,
            SymtabBuffers {
                symtab: &mut symtab,
                strtab: &mut strtab,
                symtab_shndx: None,
            },
            &TestIndexes,
        )
        .unwrap();

        let e = LittleEndian;
        let name_at = |off: u32| {
            let bytes = &strtab[off as usize..];
            &bytes[..bytes.iter().position(|&b| b == 0).unwrap()]
        };

        // Null entry untouched.
        assert_eq!(symtab[0].st_name.get(e), 0);

        // a.o's locals at indices 1-2.
        assert_eq!(name_at(symtab[1].st_name.get(e)), b"keep_me");
        assert_eq!(symtab[1].st_info >> 4, object::elf::STB_LOCAL);
        assert_eq!(symtab[1].st_shndx.get(e), 2); // section 1, mapped to 1 + 1
        assert_eq!(symtab[1].st_value.get(e), 4);
        assert_eq!(name_at(symtab[2].st_name.get(e)), b".Ltmp0");

        // Globals at indices 3-4, in file order.
        assert_eq!(name_at(symtab[3].st_name.get(e)), b"entry");
        assert_eq!(symtab[3].st_info >> 4, object::elf::STB_GLOBAL);
        assert_eq!(name_at(symtab[4].st_name.get(e)), b"second");
        assert_eq!(symtab[4].st_value.get(e), 2);

        // The strtab begins with its NUL byte.
        assert_eq!(strtab[0], 0);
    }
}
