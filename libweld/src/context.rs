//! The shared state of one link: the interned symbol table, merged sections, the file table and
//! recorded diagnostics. Everything arena-allocated hangs off `Arenas`, which the driver creates
//! first so that all parsed state shares the `'data` lifetime of the mapped inputs.

use crate::args::Args;
use crate::error::Diagnostics;
use crate::input_data::FileId;
use crate::parsing::InputFile;
use crate::string_merging::MergedSection;
use crate::string_merging::MergedSections;
use crate::string_merging::SectionFragment;
use crate::symbol::Symbol;
use crate::symbol::SymbolFlags;
use crate::symbol_db::ComdatGroup;
use crate::symbol_db::SymbolDb;
use bumpalo_herd::Herd;
use colosseum::sync::Arena;

/// Backing stores for state that must stay at stable addresses while being inserted concurrently:
/// interned symbols, comdat groups, merged sections and their fragments, and saved name strings.
pub struct Arenas<'data> {
    pub(crate) symbols: Arena<Symbol<'data>>,
    pub(crate) comdat_groups: Arena<ComdatGroup>,
    pub(crate) merged_sections: Arena<MergedSection<'data>>,
    pub(crate) fragments: Arena<SectionFragment<'data>>,
    pub(crate) herd: Herd,
}

impl Arenas<'_> {
    pub fn new() -> Self {
        Self {
            symbols: Arena::new(),
            comdat_groups: Arena::new(),
            merged_sections: Arena::new(),
            fragments: Arena::new(),
            herd: Herd::new(),
        }
    }
}

impl Default for Arenas<'_> {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Context<'data> {
    pub args: &'data Args,
    pub(crate) symbol_db: SymbolDb<'data>,
    pub(crate) merged_sections: MergedSections<'data>,

    /// All input files, indexed by `FileId`, in driver (command-line) order.
    pub files: Vec<InputFile<'data>>,

    pub diagnostics: Diagnostics,
}

impl<'data> Context<'data> {
    pub fn new(args: &'data Args, arenas: &'data Arenas<'data>) -> Self {
        let ctx = Self {
            args,
            symbol_db: SymbolDb::new(&arenas.symbols, &arenas.comdat_groups, &arenas.herd),
            merged_sections: MergedSections::new(&arenas.merged_sections, &arenas.fragments),
            files: Vec::new(),
            diagnostics: Diagnostics::default(),
        };
        ctx.apply_symbol_options();
        ctx
    }

    pub(crate) fn file(&self, id: FileId) -> &InputFile<'data> {
        &self.files[id.as_usize()]
    }

    /// Interns a symbol by name. Mostly useful to the driver and to tests; parsing interns
    /// through the symbol table directly.
    pub fn get_symbol(&self, key: &[u8]) -> &'data Symbol<'data> {
        self.symbol_db.get_symbol(self.symbol_db.save_bytes(key))
    }

    /// Pre-marks symbols named by options so that parsing and the symtab sizing pass see the
    /// flags no matter which file mentions the name first.
    fn apply_symbol_options(&self) {
        for name in &self.args.wrap {
            self.get_symbol(name.as_bytes()).set_flags(SymbolFlags::WRAPPED);
        }
        for name in &self.args.trace_symbol {
            self.get_symbol(name.as_bytes()).set_flags(SymbolFlags::TRACED);
        }
        if let Some(retain) = &self.args.retain_symbols_file {
            for name in retain {
                self.get_symbol(name.as_bytes())
                    .set_flags(SymbolFlags::WRITE_TO_SYMTAB);
            }
        }
    }
}
