//! The linker options this crate recognises. The command-line parser lives in the driver; it hands
//! us an immutable `Args` before any input file is opened.

use crate::arch::Architecture;
use hashbrown::HashSet;

#[derive(Debug)]
pub struct Args {
    pub arch: Architecture,

    /// Demangle symbol names in diagnostics.
    pub demangle: bool,

    /// Output is `ld -r` style relocatable.
    pub relocatable: bool,

    pub strip_all: bool,
    pub strip_debug: bool,
    pub discard_all: bool,
    pub discard_locals: bool,

    /// Section names to drop from inputs (`--discard-section`).
    pub discard_section: HashSet<String>,

    /// If set, only the listed symbols are written to the output symtab.
    pub retain_symbols_file: Option<HashSet<String>>,

    /// The output has no section headers (`--oformat=binary`).
    pub oformat_binary: bool,

    pub gdb_index: bool,
    pub pic: bool,
    pub z_execstack: bool,
    pub z_execstack_if_needed: bool,

    /// Symbols wrapped via `--wrap`.
    pub wrap: HashSet<String>,

    /// Symbols to report resolution decisions for (`--trace-symbol`).
    pub trace_symbol: Vec<String>,

    pub allow_shlib_undefined: bool,
    pub warn_common: bool,

    /// Version index assigned to claimed definitions. `VER_NDX_GLOBAL` unless the driver
    /// implements `--default-symver`.
    pub default_version: u16,
}

impl Args {
    pub fn new(arch: Architecture) -> Self {
        Self {
            arch,
            demangle: true,
            relocatable: false,
            strip_all: false,
            strip_debug: false,
            discard_all: false,
            discard_locals: false,
            discard_section: HashSet::new(),
            retain_symbols_file: None,
            oformat_binary: false,
            gdb_index: false,
            pic: false,
            z_execstack: false,
            z_execstack_if_needed: false,
            wrap: HashSet::new(),
            trace_symbol: Vec::new(),
            allow_shlib_undefined: false,
            warn_common: false,
            default_version: object::elf::VER_NDX_GLOBAL,
        }
    }

    pub(crate) fn wrap_contains(&self, name: &[u8]) -> bool {
        !self.wrap.is_empty()
            && std::str::from_utf8(name).is_ok_and(|name| self.wrap.contains(name))
    }

    pub(crate) fn should_discard_section(&self, name: &[u8]) -> bool {
        !self.discard_section.is_empty()
            && std::str::from_utf8(name).is_ok_and(|name| self.discard_section.contains(name))
    }
}
