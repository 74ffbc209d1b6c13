//! Entry point for turning the driver's mapped files into parsed input files. Files parse
//! concurrently, one task per file; the section-piece reattachment runs as a second per-file pass
//! because it needs the file's symbols.

use crate::args::Args;
use crate::bail;
use crate::context::Context;
use crate::elf;
use crate::elf::ElfSym;
use crate::error::Diagnostics;
use crate::error::Result;
use crate::input_data::FileCommon;
use crate::input_data::FileId;
use crate::input_data::MappedFile;
use crate::object_file::ObjectFile;
use crate::shared_file::SharedFile;
use crate::string_merging;
use crate::string_merging::MergedSections;
use crate::symbol::Symbol;
use crate::symbol_db::SymbolDb;
use anyhow::Context as _;
use rayon::iter::IndexedParallelIterator;
use rayon::iter::IntoParallelIterator;
use rayon::iter::IntoParallelRefMutIterator;
use rayon::iter::ParallelIterator;

pub enum InputFile<'data> {
    Object(Box<ObjectFile<'data>>),
    Shared(Box<SharedFile<'data>>),
}

impl<'data> InputFile<'data> {
    pub fn common(&self) -> &FileCommon {
        match self {
            InputFile::Object(o) => &o.common,
            InputFile::Shared(s) => &s.common,
        }
    }

    pub(crate) fn common_mut(&mut self) -> &mut FileCommon {
        match self {
            InputFile::Object(o) => &mut o.common,
            InputFile::Shared(s) => &mut s.common,
        }
    }

    pub fn is_dso(&self) -> bool {
        matches!(self, InputFile::Shared(_))
    }

    pub(crate) fn elf_syms(&self) -> &[ElfSym] {
        match self {
            InputFile::Object(o) => o.elf_syms,
            InputFile::Shared(s) => &s.elf_syms,
        }
    }

    pub(crate) fn symbols(&self) -> &[&'data Symbol<'data>] {
        match self {
            InputFile::Object(o) => &o.symbols,
            InputFile::Shared(s) => &s.symbols,
        }
    }

    /// The range of `symbols` holding interned globals: past the locals for an object, everything
    /// for a DSO.
    pub(crate) fn global_symbol_range(&self) -> std::ops::Range<usize> {
        match self {
            InputFile::Object(o) => o.first_global..o.elf_syms.len(),
            InputFile::Shared(s) => 0..s.elf_syms.len(),
        }
    }

    pub fn as_object(&self) -> Option<&ObjectFile<'data>> {
        match self {
            InputFile::Object(o) => Some(o),
            InputFile::Shared(_) => None,
        }
    }

    pub fn as_shared(&self) -> Option<&SharedFile<'data>> {
        match self {
            InputFile::Object(_) => None,
            InputFile::Shared(s) => Some(s),
        }
    }
}

#[tracing::instrument(skip_all, name = "Parse input files")]
pub fn parse_input_files<'data>(
    ctx: &mut Context<'data>,
    inputs: Vec<MappedFile<'data>>,
) -> Result {
    let base = ctx.files.len();
    let args = ctx.args;
    let symbol_db = &ctx.symbol_db;
    let merged_sections = &ctx.merged_sections;
    let diagnostics = &ctx.diagnostics;

    let mut files = inputs
        .into_par_iter()
        .enumerate()
        .map(|(i, input)| {
            parse_input(
                args,
                symbol_db,
                merged_sections,
                diagnostics,
                &input,
                FileId::new(base + i),
            )
        })
        .collect::<Result<Vec<InputFile>>>()?;

    files.par_iter_mut().try_for_each(|file| -> Result {
        if let InputFile::Object(obj) = file {
            string_merging::reattach_section_pieces(obj, symbol_db)?;
        }
        Ok(())
    })?;

    ctx.files.extend(files);
    Ok(())
}

fn parse_input<'data>(
    args: &Args,
    symbol_db: &SymbolDb<'data>,
    merged_sections: &MergedSections<'data>,
    diagnostics: &Diagnostics,
    input: &MappedFile<'data>,
    file_id: FileId,
) -> Result<InputFile<'data>> {
    let view = elf::File::parse(input.data)
        .with_context(|| format!("Failed to parse `{}`", input.name.display()))?;

    let arch = view
        .architecture()
        .with_context(|| format!("`{}`", input.name.display()))?;
    if arch != args.arch {
        bail!(
            "`{}` has incompatible architecture: {arch}, expecting {}",
            input.name.display(),
            args.arch
        );
    }

    if view.is_dynamic() {
        let mut file = SharedFile::new(view, input, file_id)?;
        file.parse(symbol_db)?;
        Ok(InputFile::Shared(Box::new(file)))
    } else {
        let mut file = ObjectFile::new(view, input, file_id)?;
        file.parse(args, symbol_db, merged_sections, diagnostics)?;
        Ok(InputFile::Object(Box::new(file)))
    }
}
