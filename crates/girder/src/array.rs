//! Array Heap Block
//!
//! One block type, two shapes. A *managed* array owns a growable sequence
//! of cells. A *view* borrows a managed array plus an (offset, length)
//! window; the view holds a counted handle to its base, so holding a view
//! keeps the underlying storage alive. Views are always windows onto a
//! managed base (a view of a view re-composes offsets), and operations that
//! would change the base's length through a view are rejected at the call
//! site.

use crate::value::Value;
use std::cell::{Cell, RefCell};
use std::ptr::NonNull;

enum ArrayRepr {
    Managed(RefCell<Vec<Value>>),
    View {
        base: GirderArray,
        offset: usize,
        len: usize,
    },
}

pub struct ArrayData {
    refcount: Cell<usize>,
    repr: ArrayRepr,
}

impl ArrayData {
    pub(crate) fn retain(&self) {
        self.refcount.set(self.refcount.get() + 1);
    }
}

/// Counted handle to an array block.
pub struct GirderArray {
    data: NonNull<ArrayData>,
}

impl GirderArray {
    /// Allocate a managed array with refcount 1, taking ownership of the
    /// elements.
    pub fn managed(elements: Vec<Value>) -> Self {
        let data = Box::new(ArrayData {
            refcount: Cell::new(1),
            repr: ArrayRepr::Managed(RefCell::new(elements)),
        });
        GirderArray {
            data: NonNull::from(Box::leak(data)),
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        GirderArray::managed(Vec::with_capacity(capacity))
    }

    /// Allocate a view over `[offset, offset + len)` of this array.
    ///
    /// Viewing a view composes offsets so the result always borrows the
    /// managed base directly. Bounds must already be normalized and inside
    /// the base's current length.
    pub fn view(&self, offset: usize, len: usize) -> Self {
        let (base, base_offset) = match &self.block().repr {
            ArrayRepr::Managed(_) => (self.clone(), 0),
            ArrayRepr::View {
                base,
                offset: inner,
                ..
            } => (base.clone(), *inner),
        };
        debug_assert!(base_offset + offset + len <= base.len());
        let data = Box::new(ArrayData {
            refcount: Cell::new(1),
            repr: ArrayRepr::View {
                base,
                offset: base_offset + offset,
                len,
            },
        });
        GirderArray {
            data: NonNull::from(Box::leak(data)),
        }
    }

    /// Rebuild a handle from a raw block pointer without touching the
    /// refcount.
    ///
    /// # Safety
    /// `ptr` must carry an owned reference to a live block.
    pub(crate) unsafe fn from_raw(ptr: NonNull<ArrayData>) -> Self {
        GirderArray { data: ptr }
    }

    pub(crate) fn into_raw(self) -> NonNull<ArrayData> {
        let ptr = self.data;
        std::mem::forget(self);
        ptr
    }

    fn block(&self) -> &ArrayData {
        // Safety: a live handle implies a live block.
        unsafe { self.data.as_ref() }
    }

    pub(crate) fn bump(&self) {
        self.block().retain();
    }

    pub fn refcount(&self) -> usize {
        self.block().refcount.get()
    }

    pub fn is_view(&self) -> bool {
        matches!(self.block().repr, ArrayRepr::View { .. })
    }

    pub fn len(&self) -> usize {
        match &self.block().repr {
            ArrayRepr::Managed(elements) => elements.borrow().len(),
            ArrayRepr::View { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read element `index`, or `None` out of bounds.
    pub fn get(&self, index: usize) -> Option<Value> {
        match &self.block().repr {
            ArrayRepr::Managed(elements) => elements.borrow().get(index).cloned(),
            ArrayRepr::View { base, offset, len } => {
                if index < *len {
                    base.get(offset + index)
                } else {
                    None
                }
            }
        }
    }

    /// Write element `index`, dropping the previous cell. Returns false out
    /// of bounds. Element writes through views are allowed; only
    /// length-changing mutation is not.
    pub fn set(&self, index: usize, value: Value) -> bool {
        match &self.block().repr {
            ArrayRepr::Managed(elements) => {
                let mut elements = elements.borrow_mut();
                match elements.get_mut(index) {
                    Some(slot) => {
                        *slot = value;
                        true
                    }
                    None => false,
                }
            }
            ArrayRepr::View { base, offset, len } => {
                index < *len && base.set(offset + index, value)
            }
        }
    }

    /// Append to a managed array. Returns false for views, whose length is
    /// pinned to the base window.
    pub fn push(&self, value: Value) -> bool {
        match &self.block().repr {
            ArrayRepr::Managed(elements) => {
                elements.borrow_mut().push(value);
                true
            }
            ArrayRepr::View { .. } => false,
        }
    }

    /// Pop from a managed array; `None` for views and empty arrays.
    pub fn pop(&self) -> Option<Value> {
        match &self.block().repr {
            ArrayRepr::Managed(elements) => elements.borrow_mut().pop(),
            ArrayRepr::View { .. } => None,
        }
    }

    /// Snapshot the visible elements, each counted.
    pub fn to_vec(&self) -> Vec<Value> {
        (0..self.len()).filter_map(|i| self.get(i)).collect()
    }

    /// Replace the managed contents wholesale. Returns false for views.
    pub fn replace(&self, elements: Vec<Value>) -> bool {
        match &self.block().repr {
            ArrayRepr::Managed(slot) => {
                *slot.borrow_mut() = elements;
                true
            }
            ArrayRepr::View { .. } => false,
        }
    }

    /// Handle identity, for complex-comparable equality.
    pub fn ptr_eq(&self, other: &GirderArray) -> bool {
        self.data == other.data
    }
}

impl Clone for GirderArray {
    fn clone(&self) -> Self {
        self.bump();
        GirderArray { data: self.data }
    }
}

impl Drop for GirderArray {
    fn drop(&mut self) {
        let block = unsafe { self.data.as_ref() };
        let count = block.refcount.get();
        if count > 1 {
            block.refcount.set(count - 1);
            return;
        }
        // Last handle: managed storage dereferences its cells; a view
        // releases its base handle.
        unsafe {
            drop(Box::from_raw(self.data.as_ptr()));
        }
    }
}

impl std::fmt::Debug for GirderArray {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "GirderArray({:p}, len={}, view={}, rc={})",
            self.data.as_ptr(),
            self.len(),
            self.is_view(),
            self.refcount()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interner::Interner;

    fn ints(values: &[i64]) -> GirderArray {
        GirderArray::managed(values.iter().map(|&v| Value::integer(v)).collect())
    }

    #[test]
    fn test_managed_basics() {
        let a = ints(&[10, 20, 30]);
        assert_eq!(a.len(), 3);
        assert_eq!(a.get(1), Some(Value::integer(20)));
        assert_eq!(a.get(3), None);
        assert!(a.set(2, Value::integer(33)));
        assert_eq!(a.get(2), Some(Value::integer(33)));
    }

    #[test]
    fn test_view_window() {
        let a = ints(&[1, 2, 3, 4, 5]);
        let v = a.view(1, 3);
        assert!(v.is_view());
        assert_eq!(v.len(), 3);
        // a[i:j][k] == a[i+k]
        for k in 0..3 {
            assert_eq!(v.get(k), a.get(1 + k));
        }
        assert_eq!(v.get(3), None);
    }

    #[test]
    fn test_view_keeps_base_alive() {
        let a = ints(&[1, 2]);
        assert_eq!(a.refcount(), 1);
        let v = a.view(0, 2);
        assert_eq!(a.refcount(), 2);
        drop(v);
        assert_eq!(a.refcount(), 1);
    }

    #[test]
    fn test_view_of_view_composes_offsets() {
        let a = ints(&[0, 1, 2, 3, 4, 5]);
        let v = a.view(1, 4); // [1, 2, 3, 4]
        let w = v.view(1, 2); // [2, 3]
        assert_eq!(w.get(0), Some(Value::integer(2)));
        assert_eq!(w.get(1), Some(Value::integer(3)));
        // Composed views borrow the managed base directly.
        assert_eq!(a.refcount(), 3);
    }

    #[test]
    fn test_length_mutation_forbidden_on_view() {
        let a = ints(&[1, 2, 3]);
        let v = a.view(0, 2);
        assert!(!v.push(Value::integer(9)));
        assert!(v.pop().is_none());
        assert_eq!(a.len(), 3);
    }

    #[test]
    fn test_element_write_through_view() {
        let a = ints(&[1, 2, 3]);
        let v = a.view(1, 2);
        assert!(v.set(0, Value::integer(42)));
        assert_eq!(a.get(1), Some(Value::integer(42)));
    }

    #[test]
    fn test_elements_dereferenced_on_drop() {
        let mut interner = Interner::new();
        let s = interner.intern("kept");
        {
            let a = GirderArray::managed(vec![Value::from(s.clone())]);
            assert_eq!(s.refcount(), 2);
            drop(a);
        }
        assert_eq!(s.refcount(), 1);
    }
}
