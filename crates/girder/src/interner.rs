//! String Intern Map
//!
//! Maps byte sequences to unique `StringData` blocks. Entries are weak:
//! the map holds raw block pointers without counting a reference, and the
//! last `GirderString` handle to drop purges its entry. Keys are content
//! hashes with an explicit collision chain per hash.

use crate::string::{GirderString, StringData};
use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::ptr::NonNull;

/// Per-environment intern map.
///
/// Boxed inside the environment so its address is stable; every
/// `StringData` block carries a back-pointer used to purge on last drop.
pub struct Interner {
    buckets: HashMap<u64, Vec<NonNull<StringData>>>,
}

impl Interner {
    pub fn new() -> Self {
        Interner {
            buckets: HashMap::new(),
        }
    }

    /// Intern a string, returning a counted handle.
    ///
    /// A hit bumps the existing block's refcount; a miss allocates a fresh
    /// block with refcount 1. Two calls with equal content always return
    /// handles to the same block.
    pub fn intern(&mut self, content: &str) -> GirderString {
        let hash = content_hash(content.as_bytes());
        let owner = self as *mut Interner;
        let chain = self.buckets.entry(hash).or_default();
        for &ptr in chain.iter() {
            // Safety: chain entries are purged before their block is freed.
            let block = unsafe { ptr.as_ref() };
            if block.content() == content.as_bytes() {
                let handle = unsafe { GirderString::from_raw(ptr) };
                handle.bump();
                return handle;
            }
        }
        let handle = StringData::allocate(content, hash, owner);
        // The chain entry is weak: store the pointer without a count.
        chain.push(handle.raw());
        handle
    }

    /// Remove a dying block's entry. Called from `GirderString::drop` when
    /// the last handle goes away, before the block is freed.
    pub(crate) fn purge(&mut self, hash: u64, ptr: NonNull<StringData>) {
        if let Some(chain) = self.buckets.get_mut(&hash) {
            chain.retain(|&entry| entry != ptr);
            if chain.is_empty() {
                self.buckets.remove(&hash);
            }
        }
    }

    /// Number of distinct interned strings currently alive.
    pub fn len(&self) -> usize {
        self.buckets.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

impl Default for Interner {
    fn default() -> Self {
        Interner::new()
    }
}

fn content_hash(bytes: &[u8]) -> u64 {
    let mut hasher = DefaultHasher::new();
    bytes.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equal_content_coalesces() {
        let mut interner = Interner::new();
        let a = interner.intern("name");
        let b = interner.intern("name");
        assert_eq!(a, b);
        assert_eq!(a.as_ptr(), b.as_ptr());
        assert_eq!(a.refcount(), 2);
    }

    #[test]
    fn test_distinct_content_distinct_blocks() {
        let mut interner = Interner::new();
        let a = interner.intern("left");
        let b = interner.intern("right");
        assert_ne!(a, b);
        assert_eq!(interner.len(), 2);
    }

    #[test]
    fn test_last_drop_purges_entry() {
        let mut interner = Interner::new();
        let a = interner.intern("transient");
        assert_eq!(interner.len(), 1);
        drop(a);
        assert_eq!(interner.len(), 0);

        // Re-interning after a purge allocates a fresh block.
        let b = interner.intern("transient");
        assert_eq!(b.refcount(), 1);
        assert_eq!(interner.len(), 1);
    }

    #[test]
    fn test_purge_keeps_siblings() {
        let mut interner = Interner::new();
        let a = interner.intern("keep");
        let b = interner.intern("drop");
        drop(b);
        assert_eq!(interner.len(), 1);
        assert_eq!(interner.intern("keep"), a);
    }
}
