//! Table Heap Block
//!
//! An insertion-friendly map from value to value with a refcount. Keys use
//! raw cell equality: simple payload bits, string handles (content equality
//! through interning), and handle identity for tables, arrays, and native
//! objects. The table owns its entries; dropping the last handle drops the
//! map, which dereferences every key and value it contains.

use crate::value::Value;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::ptr::NonNull;

pub struct TableData {
    refcount: Cell<usize>,
    entries: RefCell<HashMap<Value, Value>>,
}

impl TableData {
    pub(crate) fn retain(&self) {
        self.refcount.set(self.refcount.get() + 1);
    }
}

/// Counted handle to a table block.
pub struct GirderTable {
    data: NonNull<TableData>,
}

impl GirderTable {
    /// Allocate an empty table with refcount 1.
    pub fn new() -> Self {
        let data = Box::new(TableData {
            refcount: Cell::new(1),
            entries: RefCell::new(HashMap::new()),
        });
        GirderTable {
            data: NonNull::from(Box::leak(data)),
        }
    }

    /// Rebuild a handle from a raw block pointer without touching the
    /// refcount.
    ///
    /// # Safety
    /// `ptr` must carry an owned reference to a live block.
    pub(crate) unsafe fn from_raw(ptr: NonNull<TableData>) -> Self {
        GirderTable { data: ptr }
    }

    pub(crate) fn into_raw(self) -> NonNull<TableData> {
        let ptr = self.data;
        std::mem::forget(self);
        ptr
    }

    fn block(&self) -> &TableData {
        // Safety: a live handle implies a live block.
        unsafe { self.data.as_ref() }
    }

    pub(crate) fn bump(&self) {
        self.block().retain();
    }

    pub fn refcount(&self) -> usize {
        self.block().refcount.get()
    }

    /// Read an entry; absent keys read as null.
    pub fn get(&self, key: &Value) -> Value {
        self.block()
            .entries
            .borrow()
            .get(key)
            .cloned()
            .unwrap_or_else(Value::null)
    }

    pub fn contains_key(&self, key: &Value) -> bool {
        self.block().entries.borrow().contains_key(key)
    }

    /// Write an entry, dropping any previous value for the key.
    pub fn set(&self, key: Value, value: Value) {
        self.block().entries.borrow_mut().insert(key, value);
    }

    pub fn remove(&self, key: &Value) -> Value {
        self.block()
            .entries
            .borrow_mut()
            .remove(key)
            .unwrap_or_else(Value::null)
    }

    pub fn len(&self) -> usize {
        self.block().entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the current keys, each counted.
    pub fn keys(&self) -> Vec<Value> {
        self.block().entries.borrow().keys().cloned().collect()
    }

    /// Handle identity, for complex-comparable equality.
    pub fn ptr_eq(&self, other: &GirderTable) -> bool {
        self.data == other.data
    }
}

impl Default for GirderTable {
    fn default() -> Self {
        GirderTable::new()
    }
}

impl Clone for GirderTable {
    fn clone(&self) -> Self {
        self.bump();
        GirderTable { data: self.data }
    }
}

impl Drop for GirderTable {
    fn drop(&mut self) {
        let block = unsafe { self.data.as_ref() };
        let count = block.refcount.get();
        if count > 1 {
            block.refcount.set(count - 1);
            return;
        }
        // Last handle: the map drop dereferences every entry.
        unsafe {
            drop(Box::from_raw(self.data.as_ptr()));
        }
    }
}

impl std::fmt::Debug for GirderTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "GirderTable({:p}, len={}, rc={})",
            self.data.as_ptr(),
            self.len(),
            self.refcount()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interner::Interner;

    #[test]
    fn test_absent_key_reads_null() {
        let t = GirderTable::new();
        assert!(t.get(&Value::integer(1)).is_null());
        assert!(!t.contains_key(&Value::integer(1)));
    }

    #[test]
    fn test_set_get_overwrite() {
        let t = GirderTable::new();
        t.set(Value::integer(1), Value::integer(10));
        assert_eq!(t.get(&Value::integer(1)), Value::integer(10));

        t.set(Value::integer(1), Value::integer(20));
        assert_eq!(t.get(&Value::integer(1)), Value::integer(20));
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn test_string_keys_compare_by_content() {
        let mut interner = Interner::new();
        let t = GirderTable::new();
        t.set(Value::from(interner.intern("k")), Value::integer(1));
        assert_eq!(t.get(&Value::from(interner.intern("k"))), Value::integer(1));
    }

    #[test]
    fn test_entries_dereferenced_on_drop() {
        let mut interner = Interner::new();
        let s = interner.intern("held");
        {
            let t = GirderTable::new();
            t.set(Value::integer(0), Value::from(s.clone()));
            assert_eq!(s.refcount(), 2);
        }
        assert_eq!(s.refcount(), 1);
    }

    #[test]
    fn test_table_keys_by_identity() {
        let a = GirderTable::new();
        let b = GirderTable::new();
        let outer = GirderTable::new();
        outer.set(Value::from(a.clone()), Value::integer(1));
        assert!(outer.get(&Value::from(b.clone())).is_null());
        assert_eq!(outer.get(&Value::from(a.clone())), Value::integer(1));
    }
}
