//! The process-wide symbol interner. Any number of files can look up or insert symbols
//! concurrently; for a given key, every caller gets the same `&Symbol` back for the whole link.
//! The map is sharded by name hash to keep lock contention down, and the symbols themselves live
//! in a lock-free arena so the returned references stay stable while the map grows.

use crate::hash::PassThroughHashMap;
use crate::hash::PreHashed;
use crate::symbol::Symbol;
use bumpalo_herd::Herd;
use colosseum::sync::Arena;
use std::sync::Mutex;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

const SYMBOL_MAP_SHARDS: usize = 32;

pub struct SymbolDb<'data> {
    shards: Vec<Mutex<PassThroughHashMap<&'data [u8], &'data Symbol<'data>>>>,

    symbols: &'data Arena<Symbol<'data>>,

    comdat_groups: Mutex<PassThroughHashMap<&'data [u8], &'data ComdatGroup>>,
    comdat_arena: &'data Arena<ComdatGroup>,

    /// Durable storage for names we synthesise during parsing (`__wrap_` rewrites, `name@version`
    /// keys for DSO symbols).
    herd: &'data Herd,
}

impl<'data> SymbolDb<'data> {
    pub(crate) fn new(
        symbols: &'data Arena<Symbol<'data>>,
        comdat_arena: &'data Arena<ComdatGroup>,
        herd: &'data Herd,
    ) -> Self {
        let mut shards = Vec::new();
        shards.resize_with(SYMBOL_MAP_SHARDS, || Mutex::new(PassThroughHashMap::default()));
        Self {
            shards,
            symbols,
            comdat_groups: Mutex::new(PassThroughHashMap::default()),
            comdat_arena,
            herd,
        }
    }

    /// Interns `key`, deriving the display name by stripping any `@version` suffix.
    pub(crate) fn get_symbol(&self, key: &'data [u8]) -> &'data Symbol<'data> {
        let name_len = memchr::memchr(b'@', key).unwrap_or(key.len());
        self.get_symbol_with_name(key, &key[..name_len])
    }

    /// Interns `key`, using `name` as the display name. The two differ for versioned symbols:
    /// `foo@V` interns under the full key but displays as `foo`, while a default-versioned
    /// `foo@@V` interns under the bare name.
    pub(crate) fn get_symbol_with_name(
        &self,
        key: &'data [u8],
        name: &'data [u8],
    ) -> &'data Symbol<'data> {
        let hashed = PreHashed::from_bytes(key);
        let shard = &self.shards[hashed.hash() as usize % SYMBOL_MAP_SHARDS];
        let mut map = shard.lock().unwrap();
        if let Some(&sym) = map.get(&hashed) {
            return sym;
        }
        let version = key
            .get(name.len() + 1..)
            .map(|v| v.strip_prefix(b"@").unwrap_or(v));
        let sym: &'data Symbol<'data> = self.symbols.alloc(Symbol::new(name, version));
        map.insert(hashed, sym);
        sym
    }

    /// Allocates a symbol that is owned by one file (a local or a synthetic fragment symbol)
    /// without interning it.
    pub(crate) fn alloc_symbol(&self, symbol: Symbol<'data>) -> &'data Symbol<'data> {
        self.symbols.alloc(symbol)
    }

    pub(crate) fn insert_comdat_group(&self, signature: &'data [u8]) -> &'data ComdatGroup {
        let hashed = PreHashed::from_bytes(signature);
        let mut map = self.comdat_groups.lock().unwrap();
        *map.entry(hashed)
            .or_insert_with(|| &*self.comdat_arena.alloc(ComdatGroup::new()))
    }

    pub(crate) fn save_bytes(&self, bytes: &[u8]) -> &'data [u8] {
        self.save_concat(&[bytes])
    }

    pub(crate) fn save_concat(&self, parts: &[&[u8]]) -> &'data [u8] {
        let len = parts.iter().map(|part| part.len()).sum();
        let member = self.herd.get();
        let out: &'data mut [u8] = member.alloc_slice_fill_default(len);
        let mut pos = 0;
        for part in parts {
            out[pos..pos + part.len()].copy_from_slice(part);
            pos += part.len();
        }
        out
    }
}

/// A COMDAT group, interned by signature. Of all groups with the same signature, the one from the
/// lowest-priority (earliest) file is kept; member sections of the others are discarded.
pub struct ComdatGroup {
    owner_priority: AtomicU32,
}

impl ComdatGroup {
    fn new() -> Self {
        Self {
            owner_priority: AtomicU32::new(u32::MAX),
        }
    }

    pub(crate) fn claim(&self, priority: u32) {
        self.owner_priority.fetch_min(priority, Ordering::AcqRel);
    }

    pub(crate) fn owner_priority(&self) -> u32 {
        self.owner_priority.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Arenas;

    #[test]
    fn interning_returns_one_identity_per_key() {
        let arenas = Arenas::new();
        let db = SymbolDb::new(&arenas.symbols, &arenas.comdat_groups, &arenas.herd);

        let symbols: Vec<usize> = std::thread::scope(|scope| {
            (0..8)
                .map(|_| scope.spawn(|| db.get_symbol(b"foo") as *const Symbol as usize))
                .collect::<Vec<_>>()
                .into_iter()
                .map(|handle| handle.join().unwrap())
                .collect()
        });

        assert!(symbols.windows(2).all(|pair| pair[0] == pair[1]));
        assert!(std::ptr::eq(
            db.get_symbol(b"foo"),
            db.get_symbol_with_name(b"foo", b"foo")
        ));
        assert!(!std::ptr::eq(db.get_symbol(b"foo"), db.get_symbol(b"bar")));
    }

    #[test]
    fn version_suffix_is_stripped_from_name() {
        let arenas = Arenas::new();
        let db = SymbolDb::new(&arenas.symbols, &arenas.comdat_groups, &arenas.herd);

        let sym = db.get_symbol(b"read@GLIBC_2.2.5");
        assert_eq!(sym.name(), b"read");
        assert_eq!(sym.version(), Some(b"GLIBC_2.2.5".as_slice()));
        // Same name at a different version is a different symbol.
        assert!(!std::ptr::eq(sym, db.get_symbol(b"read@GLIBC_2.34")));
        assert!(!std::ptr::eq(sym, db.get_symbol(b"read")));
    }

    #[test]
    fn comdat_groups_intern_by_signature_and_keep_first_claimer() {
        let arenas = Arenas::new();
        let db = SymbolDb::new(&arenas.symbols, &arenas.comdat_groups, &arenas.herd);

        let a = db.insert_comdat_group(b"_ZN3fooC2Ev");
        let b = db.insert_comdat_group(b"_ZN3fooC2Ev");
        assert!(std::ptr::eq(a, b));

        a.claim(5);
        a.claim(3);
        a.claim(9);
        assert_eq!(a.owner_priority(), 3);
    }
}
