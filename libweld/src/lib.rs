//! The input-file ingestion and symbol-resolution core of the weld linker.
//!
//! The driver maps each input file (expanding archives itself), assigns every file a
//! command-line priority, and hands the lot to [`link_inputs`]. We parse the ELF structure of
//! relocatable objects and shared objects, build the interned global symbol table, resolve name
//! collisions by rank, rewrite mergeable sections into deduplicated pieces, decode `.eh_frame`,
//! and expand reachability across archive members and DSOs. The symtab sizing passes in
//! [`symtab`] then prepare the per-file bookkeeping that the output-writing phases (which live
//! outside this crate, together with layout, GC and relocation application) consume.

pub(crate) use anyhow::bail;
pub(crate) use anyhow::ensure;

pub mod arch;
pub mod args;
pub mod context;
pub mod eh_frame;
pub mod elf;
pub mod error;
pub(crate) mod hash;
pub mod input_data;
pub mod object_file;
pub mod parsing;
pub mod resolution;
pub mod shared_file;
pub mod string_merging;
pub mod symbol;
pub mod symbol_db;
pub mod symtab;
#[cfg(test)]
pub(crate) mod test_elf;

pub use crate::arch::Architecture;
pub use crate::args::Args;
pub use crate::context::Arenas;
pub use crate::context::Context;
pub use crate::error::Result;
pub use crate::input_data::FileId;
pub use crate::input_data::MappedFile;

/// Parses all inputs and resolves the global symbol table, leaving `ctx` ready for the symtab
/// sizing passes and the out-of-scope layout/output phases.
pub fn link_inputs<'data>(ctx: &mut Context<'data>, inputs: Vec<MappedFile<'data>>) -> Result {
    parsing::parse_input_files(ctx, inputs)?;
    resolution::resolve_symbols(ctx);
    resolution::mark_reachable_files(ctx);
    resolution::finish_resolution(ctx)?;
    Ok(())
}
