//! The process-wide symbol registry
//!
//! Every module that finishes relocation publishes its exports here and every
//! unload withdraws them. The table is created once by whoever owns the
//! runtime, shared between loaders through an `Arc`, and torn down with
//! [`SymbolRegistry::shutdown`].
//!
//! Publish and withdraw run under a spin lock. On the target that lock is the
//! interrupt-suppressed critical section: an interrupt-context lookup can
//! never observe the table half-updated.

use crate::{
    Error, Result,
    addr::FarPtr,
    error::state_error,
    lifecycle::ModuleHandle,
    symbol::{SymbolFlags, SymbolLookup, SymbolName},
};
use alloc::vec::Vec;
use core::{
    hash::{Hash, Hasher},
    ops::Range,
};
use foldhash::{SharedSeed, fast::FoldHasher};
use hashbrown::HashTable;
use spin::Mutex;

/// Maximum number of exports the registry holds at once.
pub const SYMBOL_CAPACITY: usize = 256;

const HASHER: FoldHasher<'static> = FoldHasher::with_seed(0, SharedSeed::global_fixed());

#[inline]
fn hash(name: &[u8]) -> u64 {
    let mut hasher = HASHER.clone();
    name.hash(&mut hasher);
    hasher.finish()
}

/// A published symbol.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResolvedSymbol {
    pub name: SymbolName,
    /// Absolute address of the symbol.
    pub addr: FarPtr,
    pub flags: SymbolFlags,
    /// The module that published it.
    pub module: ModuleHandle,
}

/// All publications of one name, oldest first.
struct Bucket {
    name: SymbolName,
    symbols: Vec<ResolvedSymbol>,
}

struct Inner {
    table: HashTable<Bucket>,
    len: usize,
    /// Raw value of the next handle to hand out.
    next_handle: u32,
    shut_down: bool,
}

impl Inner {
    fn retain(&mut self, mut keep: impl FnMut(&ResolvedSymbol) -> bool) -> usize {
        let mut removed = 0;
        self.table.retain(|bucket| {
            let before = bucket.symbols.len();
            bucket.symbols.retain(&mut keep);
            removed += before - bucket.symbols.len();
            !bucket.symbols.is_empty()
        });
        self.len -= removed;
        removed
    }
}

/// The global name → address table.
pub struct SymbolRegistry {
    inner: Mutex<Inner>,
    capacity: usize,
}

impl Default for SymbolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for SymbolRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("SymbolRegistry")
            .field("len", &inner.len)
            .field("capacity", &self.capacity)
            .field("shut_down", &inner.shut_down)
            .finish()
    }
}

impl SymbolRegistry {
    /// Creates an empty registry holding up to [`SYMBOL_CAPACITY`] symbols.
    pub fn new() -> Self {
        Self::with_capacity(SYMBOL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                table: HashTable::with_capacity(capacity.min(SYMBOL_CAPACITY)),
                len: 0,
                next_handle: 1,
                shut_down: false,
            }),
            capacity,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.lock().shut_down
    }

    /// Hands out a module handle no other loader sharing this registry holds.
    ///
    /// Symbols are withdrawn by handle, so handles must be unique per registry
    /// rather than per loader.
    pub fn allocate_handle(&self) -> ModuleHandle {
        let mut inner = self.inner.lock();
        let handle = ModuleHandle::new(inner.next_handle);
        inner.next_handle = inner.next_handle.wrapping_add(1).max(1);
        handle
    }

    /// Publishes `symbols` as one batch.
    ///
    /// Either every symbol becomes visible or none does. A name that is already
    /// published keeps resolving to the earlier publisher.
    pub fn publish(&self, symbols: &[ResolvedSymbol]) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.shut_down {
            return Err(state_error("symbol registry has been shut down"));
        }
        if inner.len + symbols.len() > self.capacity {
            return Err(Error::SymbolTableFull {
                capacity: self.capacity,
            });
        }
        for symbol in symbols {
            let name = symbol.name;
            let hash = hash(name.as_bytes());
            match inner.table.find_mut(hash, |bucket| bucket.name == name) {
                Some(bucket) => bucket.symbols.push(*symbol),
                None => {
                    inner.table.insert_unique(
                        hash,
                        Bucket {
                            name,
                            symbols: alloc::vec![*symbol],
                        },
                        |bucket| self::hash(bucket.name.as_bytes()),
                    );
                }
            }
        }
        inner.len += symbols.len();
        #[cfg(feature = "log")]
        log::trace!(
            "[Registry] published {} symbols, {} in table",
            symbols.len(),
            inner.len
        );
        Ok(())
    }

    /// Removes everything `module` published. Returns the number removed.
    pub fn withdraw(&self, module: ModuleHandle) -> usize {
        let removed = self.inner.lock().retain(|symbol| symbol.module != module);
        #[cfg(feature = "log")]
        log::trace!("[Registry] withdrew {} symbols of module {}", removed, module);
        removed
    }

    /// Removes the symbols of `module` whose offset lies in `offsets`.
    pub fn withdraw_range(&self, module: ModuleHandle, offsets: Range<usize>) -> usize {
        self.inner.lock().retain(|symbol| {
            symbol.module != module || !offsets.contains(&(symbol.addr.offset as usize))
        })
    }

    /// Finds the first published symbol called `name`.
    pub fn resolve(&self, name: &str) -> Option<ResolvedSymbol> {
        let key = SymbolName::new(name)?;
        let inner = self.inner.lock();
        inner
            .table
            .find(hash(key.as_bytes()), |bucket| bucket.name == key)
            .and_then(|bucket| bucket.symbols.first().copied())
    }

    /// All symbols `module` currently has in the table.
    pub fn symbols_of(&self, module: ModuleHandle) -> Vec<ResolvedSymbol> {
        let inner = self.inner.lock();
        let mut symbols: Vec<_> = inner
            .table
            .iter()
            .flat_map(|bucket| bucket.symbols.iter())
            .filter(|symbol| symbol.module == module)
            .copied()
            .collect();
        symbols.sort_by_key(|symbol| symbol.name);
        symbols
    }

    /// Empties the table and refuses further publishes.
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock();
        inner.table.clear();
        inner.len = 0;
        inner.shut_down = true;
    }
}

impl SymbolLookup for SymbolRegistry {
    fn lookup(&self, name: &str) -> Option<FarPtr> {
        self.resolve(name).map(|symbol| symbol.addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sym(name: &str, offset: u16, module: u32) -> ResolvedSymbol {
        ResolvedSymbol {
            name: SymbolName::new(name).unwrap(),
            addr: FarPtr::new(0x2000 + module as u16, offset),
            flags: SymbolFlags::FUNCTION,
            module: ModuleHandle::new(module),
        }
    }

    #[test]
    fn first_publisher_wins() {
        let registry = SymbolRegistry::new();
        registry.publish(&[sym("hello", 0x40, 1)]).unwrap();
        registry.publish(&[sym("hello", 0x80, 2)]).unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.resolve("hello").unwrap().module, ModuleHandle::new(1));
        assert_eq!(registry.withdraw(ModuleHandle::new(1)), 1);
        assert_eq!(registry.resolve("hello").unwrap().module, ModuleHandle::new(2));
        assert!(registry.resolve("nonexistent").is_none());
    }

    #[test]
    fn capacity_is_all_or_nothing() {
        let registry = SymbolRegistry::with_capacity(2);
        registry.publish(&[sym("a", 0x40, 1)]).unwrap();
        let err = registry
            .publish(&[sym("b", 0x40, 2), sym("c", 0x42, 2)])
            .unwrap_err();
        assert!(matches!(err, Error::SymbolTableFull { capacity: 2 }));
        assert!(registry.resolve("b").is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn withdraw_range_and_shutdown() {
        let registry = SymbolRegistry::new();
        registry
            .publish(&[sym("hello", 0x40, 1), sym("setup", 0x190, 1), sym("other", 0x190, 2)])
            .unwrap();
        assert_eq!(registry.withdraw_range(ModuleHandle::new(1), 0x180..0x200), 1);
        assert!(registry.resolve("setup").is_none());
        assert!(registry.resolve("other").is_some());
        assert_eq!(registry.symbols_of(ModuleHandle::new(1)).len(), 1);
        registry.shutdown();
        assert!(registry.is_empty());
        assert_ne!(registry.allocate_handle(), registry.allocate_handle());
        assert!(matches!(
            registry.publish(&[sym("late", 0x40, 3)]),
            Err(Error::InvalidState { .. })
        ));
    }
}
