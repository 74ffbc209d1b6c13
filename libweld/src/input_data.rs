//! Driver-facing description of input files. The driver owns mapping (and archive expansion); we
//! get each file as a byte slice that outlives everything we parse out of it.

use std::fmt::Display;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

/// Identifies an input file by its index in the context's file table. Symbols refer to their
/// owning file through this rather than a reference, which keeps the symbol/file graph acyclic.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct FileId(u32);

impl FileId {
    pub(crate) fn new(index: usize) -> Self {
        Self(u32::try_from(index).expect("too many input files"))
    }

    pub(crate) fn as_usize(self) -> usize {
        self.0 as usize
    }
}

/// One mapped input file as supplied by the driver.
pub struct MappedFile<'data> {
    pub data: &'data [u8],

    pub name: PathBuf,

    /// True if the user named this file with an explicit path rather than via path search. Affects
    /// the soname fallback for DSOs that carry no `DT_SONAME`.
    pub given_fullpath: bool,

    /// Set when this file came out of an archive; such files only join the link when something
    /// references them.
    pub archive_name: Option<PathBuf>,

    /// Command-line ordinal. Lower values win resolution ties.
    pub priority: u32,

    /// Definitions from this file are forced to hidden visibility (`--exclude-libs`).
    pub exclude_libs: bool,
}

/// State shared by both kinds of input file: identity, liveness and the output-symtab bookkeeping
/// filled in by the symtab sizing pass.
pub struct FileCommon {
    pub(crate) file_id: FileId,
    pub filename: PathBuf,
    pub archive_name: Option<PathBuf>,
    pub(crate) given_fullpath: bool,
    pub priority: u32,
    pub(crate) exclude_libs: bool,

    /// Whether this file takes part in the link. Starts set for command-line objects, unset for
    /// archive members and DSOs until something reachable references them.
    pub is_reachable: AtomicBool,

    pub strtab_size: u64,
    pub num_local_symtab: u32,
    pub num_global_symtab: u32,
    pub strtab_offset: u64,
    pub local_symtab_idx: u32,
    pub global_symtab_idx: u32,

    /// Dense per-file index into the output's local or global symtab partition, -1 for symbols
    /// that don't survive.
    pub output_sym_indices: Vec<i32>,
}

impl FileCommon {
    pub(crate) fn new(input: &MappedFile, file_id: FileId, initially_reachable: bool) -> Self {
        Self {
            file_id,
            filename: input.name.clone(),
            archive_name: input.archive_name.clone(),
            given_fullpath: input.given_fullpath,
            priority: input.priority,
            exclude_libs: input.exclude_libs,
            is_reachable: AtomicBool::new(initially_reachable),
            strtab_size: 0,
            num_local_symtab: 0,
            num_global_symtab: 0,
            strtab_offset: 0,
            local_symtab_idx: 0,
            global_symtab_idx: 0,
            output_sym_indices: Vec::new(),
        }
    }

    pub(crate) fn is_reachable(&self) -> bool {
        self.is_reachable.load(Ordering::Acquire)
    }

    /// Atomically marks the file reachable. Returns true if this call did the 0→1 transition.
    pub(crate) fn mark_reachable(&self) -> bool {
        !self.is_reachable.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn display(&self) -> FileDisplay<'_> {
        FileDisplay(self)
    }
}

pub(crate) struct FileDisplay<'a>(&'a FileCommon);

impl Display for FileDisplay<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(archive) = &self.0.archive_name {
            write!(f, "{}({})", archive.display(), self.0.filename.display())
        } else {
            write!(f, "{}", self.0.filename.display())
        }
    }
}
