//! Interned symbols. One `Symbol` exists per interning key for the whole link and is shared by
//! every file that references the name, so all mutable state is either atomic (visibility, flag
//! bits) or guarded by the per-symbol mutex (the resolver-owned fields).

use crate::input_data::FileId;
use crate::string_merging::SectionFragment;
use bitflags::bitflags;
use std::fmt::Display;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub(crate) struct SymbolFlags: u32 {
        /// The symbol is named by `--wrap`; undefined references to it are redirected to
        /// `__wrap_<name>` at parse time.
        const WRAPPED = 1 << 0;
        /// Resolution decisions involving this symbol are reported (`--trace-symbol`).
        const TRACED = 1 << 1;
        const IMPORTED = 1 << 2;
        const EXPORTED = 1 << 3;
        /// Marked by the symtab sizing pass (or pre-marked from `--retain-symbols-file`).
        const WRITE_TO_SYMTAB = 1 << 4;
    }
}

/// Symbol visibility, ordered so that a numerically smaller rank is more restrictive. INTERNAL is
/// canonicalised to Hidden on entry.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum Visibility {
    Hidden = 1,
    Protected = 2,
    Default = 3,
}

impl Visibility {
    pub(crate) fn from_elf(st_visibility: u8) -> Visibility {
        match st_visibility {
            object::elf::STV_INTERNAL | object::elf::STV_HIDDEN => Visibility::Hidden,
            object::elf::STV_PROTECTED => Visibility::Protected,
            _ => Visibility::Default,
        }
    }

    pub(crate) fn to_elf(self) -> u8 {
        match self {
            Visibility::Hidden => object::elf::STV_HIDDEN,
            Visibility::Protected => object::elf::STV_PROTECTED,
            Visibility::Default => object::elf::STV_DEFAULT,
        }
    }

    fn from_rank(rank: u8) -> Visibility {
        match rank {
            1 => Visibility::Hidden,
            2 => Visibility::Protected,
            _ => Visibility::Default,
        }
    }
}

/// What a symbol's resolved definition points at.
#[derive(Clone, Copy)]
pub(crate) enum SymbolPlace<'data> {
    /// Absolute, common-before-conversion, or unclaimed.
    None,

    /// A section of the owning file, by index into that file's section table.
    Section(u32),

    /// A piece of a merged section.
    Fragment(&'data SectionFragment<'data>),

    /// This symbol is the `name@version` shadow of a DSO's versioned default symbol; references
    /// to it are redirected to the primary after resolution.
    ShadowOf(&'data Symbol<'data>),
}

/// The fields the resolver rewrites when a better definition is found. Reads and writes happen
/// under the symbol's mutex; releasing it publishes the update.
#[derive(Clone, Copy)]
pub(crate) struct SymbolValue<'data> {
    pub(crate) file: Option<FileId>,
    pub(crate) sym_idx: u32,
    pub(crate) value: u64,
    pub(crate) place: SymbolPlace<'data>,
    pub(crate) ver_idx: u16,
    pub(crate) is_weak: bool,
    pub(crate) is_versioned_default: bool,
}

impl SymbolValue<'_> {
    pub(crate) fn unclaimed() -> Self {
        Self {
            file: None,
            sym_idx: 0,
            value: 0,
            place: SymbolPlace::None,
            ver_idx: object::elf::VER_NDX_GLOBAL,
            is_weak: false,
            is_versioned_default: false,
        }
    }
}

pub struct Symbol<'data> {
    name: &'data [u8],

    /// The version suffix this symbol was interned with, if any.
    version: Option<&'data [u8]>,

    visibility: AtomicU8,
    flags: AtomicU32,
    pub(crate) inner: Mutex<SymbolValue<'data>>,
}

impl<'data> Symbol<'data> {
    pub(crate) fn new(name: &'data [u8], version: Option<&'data [u8]>) -> Self {
        Self {
            name,
            version,
            visibility: AtomicU8::new(Visibility::Default as u8),
            flags: AtomicU32::new(0),
            inner: Mutex::new(SymbolValue::unclaimed()),
        }
    }

    /// Creates a symbol that belongs to a single file: a local, or a synthetic fragment symbol.
    /// Such symbols are allocated in the symbol arena but never interned.
    pub(crate) fn new_local(
        name: &'data [u8],
        file: FileId,
        sym_idx: u32,
        value: u64,
        place: SymbolPlace<'data>,
    ) -> Self {
        let sym = Symbol::new(name, None);
        *sym.inner.lock().unwrap() = SymbolValue {
            file: Some(file),
            sym_idx,
            value,
            place,
            ver_idx: object::elf::VER_NDX_GLOBAL,
            is_weak: false,
            is_versioned_default: false,
        };
        sym
    }

    pub fn name(&self) -> &'data [u8] {
        self.name
    }

    pub fn version(&self) -> Option<&'data [u8]> {
        self.version
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, SymbolValue<'data>> {
        self.inner.lock().unwrap()
    }

    /// Snapshot of the resolved value. Only meaningful once the resolution phases are done.
    pub(crate) fn resolution(&self) -> SymbolValue<'data> {
        *self.lock()
    }

    pub fn file(&self) -> Option<FileId> {
        self.lock().file
    }

    pub fn visibility(&self) -> Visibility {
        Visibility::from_rank(self.visibility.load(Ordering::Acquire))
    }

    /// Merges in one observation of the symbol's visibility. The result is the most restrictive
    /// of everything seen so far, so the stored value only ever moves toward Hidden.
    pub(crate) fn merge_visibility(&self, visibility: Visibility) {
        let new_rank = visibility as u8;
        let _ = self.visibility.fetch_update(
            Ordering::AcqRel,
            Ordering::Acquire,
            |current| (new_rank < current).then_some(new_rank),
        );
    }

    pub(crate) fn flags(&self) -> SymbolFlags {
        SymbolFlags::from_bits_retain(self.flags.load(Ordering::Acquire))
    }

    pub(crate) fn set_flags(&self, flags: SymbolFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    pub(crate) fn has_flags(&self, flags: SymbolFlags) -> bool {
        self.flags().contains(flags)
    }

    pub(crate) fn is_wrapped(&self) -> bool {
        self.has_flags(SymbolFlags::WRAPPED)
    }

    pub(crate) fn is_traced(&self) -> bool {
        self.has_flags(SymbolFlags::TRACED)
    }

    /// Whether the symbol is demoted to the output symtab's local partition. The import/export
    /// flags are assigned by the driver's export pass (version scripts, dynamic sections), which
    /// runs between resolution and symtab sizing.
    pub(crate) fn is_local(&self) -> bool {
        !self.flags().intersects(SymbolFlags::IMPORTED | SymbolFlags::EXPORTED)
    }

    pub(crate) fn display(&self, demangle: bool) -> SymbolDisplay<'_> {
        SymbolDisplay {
            name: self.name,
            demangle,
        }
    }
}

pub(crate) struct SymbolDisplay<'a> {
    name: &'a [u8],
    demangle: bool,
}

impl Display for SymbolDisplay<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match std::str::from_utf8(self.name) {
            Ok(name) if self.demangle => Display::fmt(&symbolic_demangle::demangle(name), f),
            Ok(name) => Display::fmt(name, f),
            Err(_) => write!(f, "{}", String::from_utf8_lossy(self.name)),
        }
    }
}

impl std::fmt::Debug for Symbol<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Symbol({})", String::from_utf8_lossy(self.name))
    }
}
