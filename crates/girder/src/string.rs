//! GirderString - Interned String Handle
//!
//! Strings in Girder are immutable byte sequences interned per environment.
//! For a given environment and byte sequence there is exactly one heap block;
//! handle equality is therefore content equality, and hashing a handle is
//! hashing a pointer.
//!
//! The heap block stores its own refcount, a cached content hash (so the
//! intern map can be purged without rehashing), a back-pointer to the owning
//! interner, and the bytes themselves with a trailing NUL for external
//! consumers.

use crate::interner::Interner;
use std::cell::Cell;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ptr::NonNull;

/// Heap block backing an interned string.
///
/// # Safety Invariants
/// - `bytes` is valid UTF-8 content followed by exactly one NUL byte
/// - `owner` points at the interner that allocated this block and outlives
///   every handle to it
/// - `refcount` counts live `GirderString` handles only; the intern map's
///   entry is weak and is purged when the count reaches zero
pub struct StringData {
    refcount: Cell<usize>,
    hash: u64,
    owner: *mut Interner,
    bytes: Box<[u8]>,
}

impl StringData {
    /// Allocate a fresh block with refcount 1 and return the first handle.
    ///
    /// Only the interner calls this; everyone else goes through
    /// `Interner::intern` so the uniqueness invariant holds.
    pub(crate) fn allocate(content: &str, hash: u64, owner: *mut Interner) -> GirderString {
        let mut bytes = Vec::with_capacity(content.len() + 1);
        bytes.extend_from_slice(content.as_bytes());
        bytes.push(0);
        let data = Box::new(StringData {
            refcount: Cell::new(1),
            hash,
            owner,
            bytes: bytes.into_boxed_slice(),
        });
        GirderString {
            data: NonNull::from(Box::leak(data)),
        }
    }

    pub(crate) fn hash(&self) -> u64 {
        self.hash
    }

    pub(crate) fn retain(&self) {
        self.refcount.set(self.refcount.get() + 1);
    }

    pub(crate) fn content(&self) -> &[u8] {
        &self.bytes[..self.bytes.len() - 1]
    }
}

/// Handle to an interned string.
///
/// Copying a handle bumps the block's refcount; dropping the last handle
/// removes the block from the intern map and frees it.
pub struct GirderString {
    data: NonNull<StringData>,
}

impl GirderString {
    /// Rebuild a handle from a raw block pointer without touching the
    /// refcount.
    ///
    /// # Safety
    /// `ptr` must have come from `into_raw` (or an equivalent transfer of an
    /// owned reference) on a still-live block.
    pub(crate) unsafe fn from_raw(ptr: NonNull<StringData>) -> Self {
        GirderString { data: ptr }
    }

    /// Consume the handle, returning the raw block pointer with its
    /// reference still counted.
    pub(crate) fn into_raw(self) -> NonNull<StringData> {
        let ptr = self.data;
        std::mem::forget(self);
        ptr
    }

    /// Raw block pointer without transferring the reference.
    pub(crate) fn raw(&self) -> NonNull<StringData> {
        self.data
    }

    fn block(&self) -> &StringData {
        // Safety: a live handle implies a live block (refcount > 0).
        unsafe { self.data.as_ref() }
    }

    /// String content as UTF-8.
    ///
    /// # Safety
    /// Constructors only accept `&str`, so the content bytes are valid
    /// UTF-8 by construction.
    pub fn as_str(&self) -> &str {
        unsafe { std::str::from_utf8_unchecked(self.block().content()) }
    }

    /// Content bytes, without the trailing NUL.
    pub fn as_bytes(&self) -> &[u8] {
        self.block().content()
    }

    /// Pointer to NUL-terminated bytes for external consumers.
    pub fn as_ptr(&self) -> *const u8 {
        self.block().bytes.as_ptr()
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.block().content().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current handle count. Test and diagnostic aid.
    pub fn refcount(&self) -> usize {
        self.block().refcount.get()
    }

    pub(crate) fn bump(&self) {
        let count = self.block().refcount.get();
        self.block().refcount.set(count + 1);
    }
}

impl Clone for GirderString {
    fn clone(&self) -> Self {
        self.bump();
        GirderString { data: self.data }
    }
}

impl Drop for GirderString {
    fn drop(&mut self) {
        let block = unsafe { self.data.as_ref() };
        let count = block.refcount.get();
        if count > 1 {
            block.refcount.set(count - 1);
            return;
        }
        // Last handle: purge the weak intern entry, then free the block.
        unsafe {
            if let Some(owner) = block.owner.as_mut() {
                owner.purge(block.hash, self.data);
            }
            drop(Box::from_raw(self.data.as_ptr()));
        }
    }
}

// Interning makes pointer identity equivalent to content equality.
impl PartialEq for GirderString {
    fn eq(&self, other: &Self) -> bool {
        self.data == other.data
    }
}

impl Eq for GirderString {}

impl Hash for GirderString {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.data.as_ptr().hash(state);
    }
}

impl fmt::Debug for GirderString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "GirderString({:?}, rc={})",
            self.as_str(),
            self.refcount()
        )
    }
}

impl fmt::Display for GirderString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use crate::interner::Interner;

    #[test]
    fn test_content_round_trip() {
        let mut interner = Interner::new();
        let s = interner.intern("hello");
        assert_eq!(s.as_str(), "hello");
        assert_eq!(s.as_bytes(), b"hello");
        assert_eq!(s.len(), 5);
    }

    #[test]
    fn test_nul_terminated_for_external_consumers() {
        let mut interner = Interner::new();
        let s = interner.intern("abc");
        unsafe {
            assert_eq!(*s.as_ptr().add(3), 0);
        }
    }

    #[test]
    fn test_clone_bumps_refcount() {
        let mut interner = Interner::new();
        let a = interner.intern("shared");
        assert_eq!(a.refcount(), 1);
        let b = a.clone();
        assert_eq!(a.refcount(), 2);
        drop(b);
        assert_eq!(a.refcount(), 1);
    }

    #[test]
    fn test_empty_string() {
        let mut interner = Interner::new();
        let s = interner.intern("");
        assert!(s.is_empty());
        assert_eq!(s.as_str(), "");
        unsafe {
            assert_eq!(*s.as_ptr(), 0);
        }
    }

    #[test]
    fn test_unicode_content() {
        let mut interner = Interner::new();
        let s = interner.intern("héllo 世界");
        assert_eq!(s.as_str(), "héllo 世界");
        assert!(s.len() > 8);
    }
}
