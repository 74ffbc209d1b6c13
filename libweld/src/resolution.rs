//! Symbol resolution across all input files, and the reachability expansion that decides which
//! archive members and DSOs join the link.
//!
//! Every definition is ranked; lower ranks win, and ties break on the file's command-line
//! priority, so the outcome doesn't depend on which worker gets where first:
//!
//!   1. strong definition in a reachable object
//!   2. weak definition in a reachable object
//!   3. strong definition in a DSO or a not-yet-reachable archive member
//!   4. weak definition in a DSO or a not-yet-reachable archive member
//!   5. common symbol
//!   6. common symbol in an archive member
//!   7. unclaimed
//!
//! Claims are made under the per-symbol mutex: compare ranks, replace on improvement, and let
//! releasing the lock publish the update. This makes concurrent per-file resolution safe and,
//! because the comparison is total, order-independent.

use crate::args::Args;
use crate::context::Context;
use crate::elf;
use crate::elf::ElfSym;
use crate::elf::SectionHeader;
use crate::elf::U32;
use crate::elf::U64;
use crate::elf::secnames;
use crate::error::Result;
use crate::error::output;
use crate::error::warning;
use crate::input_data::FileCommon;
use crate::input_data::FileId;
use crate::object_file::InputSection;
use crate::object_file::ObjectFile;
use crate::parsing::InputFile;
use crate::shared_file::SharedFile;
use crate::symbol::Symbol;
use crate::symbol::SymbolPlace;
use crate::symbol::SymbolValue;
use crate::symbol::Visibility;
use anyhow::anyhow;
use object::LittleEndian;
use object::read::elf::Sym as _;
use rayon::Scope;
use rayon::iter::IntoParallelRefIterator;
use rayon::iter::IntoParallelRefMutIterator;
use rayon::iter::ParallelIterator;

const UNCLAIMED_RANK: u64 = 7 << 24;

fn rank_key(priority: u32, is_dso: bool, is_in_archive: bool, esym: &ElfSym) -> u64 {
    let rank: u64 = if elf::esym_is_common(esym) {
        debug_assert!(!is_dso);
        if is_in_archive { 6 } else { 5 }
    } else if is_dso || is_in_archive {
        if elf::esym_is_weak(esym) { 4 } else { 3 }
    } else if elf::esym_is_weak(esym) {
        2
    } else {
        1
    };
    (rank << 24) + u64::from(priority)
}

/// Decides whether a candidate definition displaces the current one. Caller holds the symbol's
/// mutex.
fn should_replace(
    ctx: &Context,
    new_esym: &ElfSym,
    new_key: u64,
    current: &SymbolValue,
) -> bool {
    let e = LittleEndian;
    let Some(cur_file_id) = current.file else {
        return new_key < UNCLAIMED_RANK;
    };
    let cur_file = ctx.file(cur_file_id);
    let cur_esym = &cur_file.elf_syms()[current.sym_idx as usize];
    let cur_key = rank_key(
        cur_file.common().priority,
        cur_file.is_dso(),
        !cur_file.common().is_reachable(),
        cur_esym,
    );

    // Between two tentative definitions the larger one wins, so the merged common ends up with
    // the maximum size and that definition's alignment.
    if elf::esym_is_common(new_esym) && elf::esym_is_common(cur_esym) {
        let (new_size, cur_size) = (new_esym.st_size(e), cur_esym.st_size(e));
        if new_size != cur_size {
            return new_size > cur_size;
        }
    }

    new_key < cur_key
}

#[tracing::instrument(skip_all, name = "Resolve symbols")]
pub fn resolve_symbols(ctx: &Context) {
    ctx.files.par_iter().for_each(|file| match file {
        InputFile::Object(o) => resolve_object_symbols(ctx, o),
        InputFile::Shared(s) => resolve_dso_symbols(ctx, s),
    });
}

fn resolve_object_symbols<'data>(ctx: &Context<'data>, file: &ObjectFile<'data>) {
    let e = LittleEndian;
    let elf_syms = file.elf_syms;

    for i in file.first_global..elf_syms.len() {
        let esym = &elf_syms[i];
        if esym.is_undefined(e) {
            continue;
        }

        let mut place = SymbolPlace::None;
        let mut value = esym.st_value(e);
        if !elf::esym_is_abs(esym) && !elf::esym_is_common(esym) {
            let shndx = file.get_shndx(esym, i) as usize;
            if let Some(m) = file.mergeable_sections.get(shndx).and_then(Option::as_ref) {
                // Defined in a converted mergeable section; bind straight to the piece. The
                // offset was validated during reattachment.
                let Some((frag, offset)) = m.get_fragment(value) else {
                    continue;
                };
                place = SymbolPlace::Fragment(frag);
                value = offset;
            } else {
                match file.sections.get(shndx).and_then(Option::as_ref) {
                    Some(isec) if isec.is_alive => place = SymbolPlace::Section(shndx as u32),
                    _ => continue,
                }
            }
        }

        let sym = file.symbols[i];
        let new_key = rank_key(
            file.common.priority,
            false,
            !file.common.is_reachable(),
            esym,
        );

        let mut val = sym.lock();
        if should_replace(ctx, esym, new_key, &val) {
            *val = SymbolValue {
                file: Some(file.common.file_id),
                sym_idx: i as u32,
                value,
                place,
                ver_idx: ctx.args.default_version,
                is_weak: elf::esym_is_weak(esym),
                is_versioned_default: false,
            };
        }
    }
}

fn resolve_dso_symbols<'data>(ctx: &Context<'data>, file: &SharedFile<'data>) {
    let e = LittleEndian;

    for (i, esym) in file.elf_syms.iter().enumerate() {
        if esym.is_undefined(e) {
            continue;
        }

        let sym = file.symbols[i];
        let new_key = rank_key(file.common.priority, true, false, esym);

        let mut val = sym.lock();
        if should_replace(ctx, esym, new_key, &val) {
            *val = SymbolValue {
                file: Some(file.common.file_id),
                sym_idx: i as u32,
                value: esym.st_value(e),
                place: SymbolPlace::None,
                ver_idx: file.versyms[i],
                is_weak: true,
                is_versioned_default: false,
            };
        }

        // A default-versioned symbol can also be named `name@version`; claim the shadow as a
        // proxy that forwards to the primary. Nested locking is fine here: the primary is always
        // locked first, and the shadow is a distinct symbol by construction.
        if let Some(shadow) = file.symbols2[i] {
            if !std::ptr::eq(shadow, sym) {
                let mut val2 = shadow.lock();
                if should_replace(ctx, esym, new_key, &val2) {
                    *val2 = SymbolValue {
                        file: Some(file.common.file_id),
                        sym_idx: i as u32,
                        value: esym.st_value(e),
                        place: SymbolPlace::ShadowOf(sym),
                        ver_idx: file.versyms[i],
                        is_weak: true,
                        is_versioned_default: true,
                    };
                }
            }
        }
    }
}

/// Expands reachability to a fixed point: starting from the command-line files, any file whose
/// definition satisfies an undefined (or common-upgrading) reference from a reachable file
/// becomes reachable itself and is fed to a worker to have its own references followed.
#[tracing::instrument(skip_all, name = "Mark reachable files")]
pub fn mark_reachable_files(ctx: &Context) {
    rayon::in_place_scope(|scope| {
        for file in &ctx.files {
            if file.common().is_reachable() {
                let file_id = file.common().file_id;
                scope.spawn(move |scope| mark_file(ctx, file_id, scope));
            }
        }
    });
}

fn mark_file<'scope, 'data: 'scope>(
    ctx: &'scope Context<'data>,
    file_id: FileId,
    scope: &Scope<'scope>,
) {
    let feeder = |next: FileId| {
        scope.spawn(move |scope| mark_file(ctx, next, scope));
    };
    match ctx.file(file_id) {
        InputFile::Object(o) => mark_live_objects(ctx, o, feeder),
        InputFile::Shared(s) => mark_live_dso(ctx, s, feeder),
    }
}

/// Follows this object's global references. Also the point where each reference's visibility is
/// merged into the symbol, since this pass visits every reference of every reachable file.
fn mark_live_objects<'data>(
    ctx: &Context<'data>,
    file: &ObjectFile<'data>,
    feeder: impl Fn(FileId),
) {
    let e = LittleEndian;
    debug_assert!(file.common.is_reachable());
    let elf_syms = file.elf_syms;

    for i in file.first_global..elf_syms.len() {
        let esym = &elf_syms[i];
        let sym = file.symbols[i];

        if !esym.is_undefined(e) && file.common.exclude_libs {
            sym.merge_visibility(Visibility::Hidden);
        } else {
            sym.merge_visibility(Visibility::from_elf(esym.st_visibility()));
        }

        if sym.is_traced() {
            print_trace_symbol(ctx, &file.common, esym, sym);
        }

        let val = sym.resolution();
        let Some(owner_id) = val.file else {
            continue;
        };
        let owner = ctx.file(owner_id);

        let undef_ref = esym.is_undefined(e) && (!elf::esym_is_weak(esym) || owner.is_dso());
        let common_ref = elf::esym_is_common(esym)
            && !elf::esym_is_common(&owner.elf_syms()[val.sym_idx as usize]);

        if (undef_ref || common_ref) && owner.common().mark_reachable() {
            feeder(owner_id);
            if sym.is_traced() {
                output(&format!(
                    "trace-symbol: {} keeps {} for {}",
                    file.common.display(),
                    owner.common().display(),
                    sym.display(ctx.args.demangle)
                ));
            }
        }
    }
}

/// We follow undefined references out of DSOs only so that `--no-allow-shlib-undefined` can be
/// checked at the end of the link.
fn mark_live_dso<'data>(ctx: &Context<'data>, file: &SharedFile<'data>, feeder: impl Fn(FileId)) {
    let e = LittleEndian;

    for (i, esym) in file.elf_syms.iter().enumerate() {
        let sym = file.symbols[i];

        if sym.is_traced() {
            print_trace_symbol(ctx, &file.common, esym, sym);
        }

        if !esym.is_undefined(e) || elf::esym_is_weak(esym) {
            continue;
        }
        let Some(owner_id) = sym.file() else {
            continue;
        };
        let owner = ctx.file(owner_id);
        if (!owner.is_dso() || !ctx.args.allow_shlib_undefined)
            && owner.common().mark_reachable()
        {
            feeder(owner_id);
            if sym.is_traced() {
                output(&format!(
                    "trace-symbol: {} keeps {} for {}",
                    file.common.display(),
                    owner.common().display(),
                    sym.display(ctx.args.demangle)
                ));
            }
        }
    }
}

fn print_trace_symbol(ctx: &Context, file: &FileCommon, esym: &ElfSym, sym: &Symbol) {
    let e = LittleEndian;
    let name = sym.display(ctx.args.demangle);
    if !esym.is_undefined(e) {
        output(&format!("trace-symbol: {}: definition of {name}", file.display()));
    } else if elf::esym_is_weak(esym) {
        output(&format!("trace-symbol: {}: weak reference to {name}", file.display()));
    } else {
        output(&format!("trace-symbol: {}: reference to {name}", file.display()));
    }
}

/// Runs the post-reachability cleanup passes, then checks for recorded errors.
pub fn finish_resolution(ctx: &mut Context) -> Result {
    release_unreachable_claims(ctx);
    redirect_versioned_symbols(ctx);
    eliminate_comdat_groups(ctx);
    convert_common_symbols(ctx);
    check_shlib_undefined(ctx)?;
    ctx.diagnostics.check()
}

/// Claims held by files that never became reachable are released so the symbols rank as
/// unclaimed. Locals keep pointing at their own file regardless of liveness.
#[tracing::instrument(skip_all, name = "Release unreachable claims")]
fn release_unreachable_claims(ctx: &Context) {
    ctx.files.par_iter().for_each(|file| {
        if file.common().is_reachable() {
            return;
        }
        let file_id = file.common().file_id;
        for &sym in &file.symbols()[file.global_symbol_range()] {
            let mut val = sym.lock();
            if val.file == Some(file_id) {
                *val = SymbolValue::unclaimed();
            }
        }
    });
}

/// Rewrites each file's references to `name@version` shadows into references to the primary
/// symbol recorded when the shadow was claimed.
#[tracing::instrument(skip_all, name = "Redirect versioned symbols")]
fn redirect_versioned_symbols(ctx: &mut Context) {
    ctx.files.par_iter_mut().for_each(|file| {
        let range = file.global_symbol_range();
        let symbols = match file {
            InputFile::Object(o) => &mut o.symbols[range],
            InputFile::Shared(s) => &mut s.symbols[range],
        };
        for slot in symbols {
            let val = slot.resolution();
            if val.is_versioned_default {
                if let SymbolPlace::ShadowOf(primary) = val.place {
                    *slot = primary;
                }
            }
        }
    });
}

/// Keeps one COMDAT group per signature (the earliest inserter) and kills the member sections of
/// every other copy.
#[tracing::instrument(skip_all, name = "Eliminate duplicate comdat groups")]
fn eliminate_comdat_groups(ctx: &mut Context) {
    let e = LittleEndian;

    ctx.files.par_iter().for_each(|file| {
        let Some(obj) = file.as_object() else { return };
        if !obj.common.is_reachable() {
            return;
        }
        for group_ref in &obj.comdat_groups {
            group_ref.group.claim(obj.common.priority);
        }
    });

    ctx.files.par_iter_mut().for_each(|file| {
        let InputFile::Object(obj) = file else { return };
        if !obj.common.is_reachable() {
            return;
        }
        let ObjectFile {
            common,
            comdat_groups,
            sections,
            ..
        } = &mut **obj;
        for group_ref in comdat_groups {
            if group_ref.group.owner_priority() == common.priority {
                continue;
            }
            for member in group_ref.members {
                if let Some(Some(isec)) = sections.get_mut(member.get(e) as usize) {
                    isec.is_alive = false;
                }
            }
        }
    });
}

/// Allocates space for surviving common symbols. A common that lost to a real definition needs
/// nothing; the rest get a synthetic NOBITS section in their winning file, sized and aligned per
/// the ELF convention (`st_size` is the size, `st_value` the alignment).
#[tracing::instrument(skip_all, name = "Convert common symbols")]
fn convert_common_symbols(ctx: &mut Context) {
    let args = ctx.args;
    ctx.files.par_iter_mut().for_each(|file| {
        let InputFile::Object(obj) = file else { return };
        if obj.has_common_symbol && obj.common.is_reachable() {
            convert_commons_for(args, obj);
        }
    });
}

fn convert_commons_for(args: &Args, file: &mut ObjectFile) {
    let e = LittleEndian;
    let elf_syms = file.elf_syms;

    for i in file.first_global..elf_syms.len() {
        let esym = &elf_syms[i];
        if !elf::esym_is_common(esym) {
            continue;
        }

        let sym = file.symbols[i];
        let mut val = sym.lock();
        if val.file != Some(file.common.file_id) {
            if args.warn_common {
                warning(&format!(
                    "{}: multiple common symbols: {}",
                    file.common.display(),
                    sym.display(args.demangle)
                ));
            }
            continue;
        }

        let is_tls = esym.st_type() == object::elf::STT_TLS;
        let mut sh_flags = u64::from(object::elf::SHF_ALLOC | object::elf::SHF_WRITE);
        if is_tls {
            sh_flags |= u64::from(object::elf::SHF_TLS);
        }
        let shdr = SectionHeader {
            sh_name: U32::new(e, 0),
            sh_type: U32::new(e, object::elf::SHT_NOBITS),
            sh_flags: U64::new(e, sh_flags),
            sh_addr: U64::new(e, 0),
            sh_offset: U64::new(e, 0),
            sh_size: U64::new(e, esym.st_size(e)),
            sh_link: U32::new(e, 0),
            sh_info: U32::new(e, 0),
            sh_addralign: U64::new(e, esym.st_value(e)),
            sh_entsize: U64::new(e, 0),
        };

        let index = file.sections.len() as u32;
        let name = if is_tls { secnames::TLS_COMMON } else { secnames::COMMON };
        file.sections.push(Some(InputSection::new_synthetic(index, shdr, name)));
        file.mergeable_sections.push(None);

        *val = SymbolValue {
            file: Some(file.common.file_id),
            sym_idx: i as u32,
            value: 0,
            place: SymbolPlace::Section(index),
            ver_idx: args.default_version,
            is_weak: false,
            is_versioned_default: false,
        };
    }
}

/// `--no-allow-shlib-undefined`: every non-weak undefined symbol of a reachable DSO must have
/// found a definition somewhere in the link.
#[tracing::instrument(skip_all, name = "Check DSO undefined symbols")]
fn check_shlib_undefined(ctx: &Context) -> Result {
    if ctx.args.allow_shlib_undefined {
        return Ok(());
    }
    let e = LittleEndian;

    for file in &ctx.files {
        let Some(dso) = file.as_shared() else { continue };
        if !dso.common.is_reachable() {
            continue;
        }
        for (i, esym) in dso.elf_syms.iter().enumerate() {
            if !esym.is_undefined(e) || elf::esym_is_weak(esym) {
                continue;
            }
            let sym = dso.symbols[i];
            if sym.file().is_none() {
                ctx.diagnostics.error(anyhow!(
                    "undefined symbol in {}: {}",
                    dso.common.display(),
                    sym.display(ctx.args.demangle)
                ));
            }
        }
    }
    Ok(())
}
