//! Native Objects and Virtual Tables
//!
//! A native object embeds host state (any `Box<dyn Any>` payload) behind a
//! refcounted heap block that carries a shared virtual table. The virtual
//! table holds a method map consulted by selection plus one optional slot
//! per overloadable operator; an empty slot means the operation traps with
//! "UnsupportedOperation" when dispatched (see `object.rs`).
//!
//! The payload's destructor is the box's drop glue, run when the last
//! handle drops.

use crate::environment::Environment;
use crate::error::EvalResult;
use crate::object::Reference;
use crate::string::GirderString;
use crate::value::Value;
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::ptr::NonNull;
use std::rc::Rc;

/// Binary operator slot: `(env, self, rhs) -> value`.
pub type BinarySlot = fn(&mut Environment, &Value, &Value) -> EvalResult<Value>;

/// Unary operator slot: `(env, self) -> value`.
pub type UnarySlot = fn(&mut Environment, &Value) -> EvalResult<Value>;

/// In-place assignment operator slot: `(env, self, rhs)`, returns nothing.
pub type AssignSlot = fn(&mut Environment, &Value, &Value) -> EvalResult<()>;

/// Index slot: yields a mutable reference cell.
pub type IndexSlot = fn(&mut Environment, &Value, &Value) -> EvalResult<Reference>;

/// Ranged-selection slot: `(env, self, from, to) -> value`.
pub type RangedSelectSlot = fn(&mut Environment, &Value, &Value, &Value) -> EvalResult<Value>;

/// Call slot: `(env, self) -> value`; arguments are read from the
/// environment's argument slot.
pub type CallSlot = fn(&mut Environment, &Value) -> EvalResult<Value>;

/// Operator dispatch record: one optional slot per overloadable operator.
/// Empty slots trap with "UnsupportedOperation" at dispatch.
#[derive(Default)]
pub struct OperatorTable {
    pub assign: Option<AssignSlot>,

    pub add: Option<BinarySlot>,
    pub sub: Option<BinarySlot>,
    pub mul: Option<BinarySlot>,
    pub div: Option<BinarySlot>,
    pub modulus: Option<BinarySlot>,
    pub pow: Option<BinarySlot>,

    pub eq: Option<BinarySlot>,
    pub ne: Option<BinarySlot>,
    pub lt: Option<BinarySlot>,
    pub le: Option<BinarySlot>,
    pub gt: Option<BinarySlot>,
    pub ge: Option<BinarySlot>,
    pub logical_or: Option<BinarySlot>,
    pub logical_and: Option<BinarySlot>,
    pub logical_not: Option<UnarySlot>,

    pub bor: Option<BinarySlot>,
    pub bxor: Option<BinarySlot>,
    pub band: Option<BinarySlot>,
    pub bnot: Option<UnarySlot>,
    pub shl: Option<BinarySlot>,
    pub shr: Option<BinarySlot>,

    pub add_assign: Option<AssignSlot>,
    pub sub_assign: Option<AssignSlot>,
    pub mul_assign: Option<AssignSlot>,
    pub div_assign: Option<AssignSlot>,
    pub mod_assign: Option<AssignSlot>,
    pub pow_assign: Option<AssignSlot>,
    pub bor_assign: Option<AssignSlot>,
    pub bxor_assign: Option<AssignSlot>,
    pub band_assign: Option<AssignSlot>,
    pub shl_assign: Option<AssignSlot>,
    pub shr_assign: Option<AssignSlot>,

    pub length: Option<UnarySlot>,
    pub pre_increment: Option<UnarySlot>,
    pub post_increment: Option<UnarySlot>,
    pub pre_decrement: Option<UnarySlot>,
    pub post_decrement: Option<UnarySlot>,

    pub index: Option<IndexSlot>,
    pub select: Option<BinarySlot>,
    pub ranged_select: Option<RangedSelectSlot>,

    pub call: Option<CallSlot>,
    pub construct: Option<CallSlot>,
}

/// Per-class record: method/constant map plus operator slots.
pub struct VirtualTable {
    /// Class name, shown in diagnostics and default rendering.
    pub name: String,
    methods: RefCell<HashMap<GirderString, Value>>,
    pub ops: OperatorTable,
}

impl VirtualTable {
    pub fn new(name: impl Into<String>) -> Self {
        VirtualTable {
            name: name.into(),
            methods: RefCell::new(HashMap::new()),
            ops: OperatorTable::default(),
        }
    }

    pub fn with_ops(name: impl Into<String>, ops: OperatorTable) -> Self {
        VirtualTable {
            name: name.into(),
            methods: RefCell::new(HashMap::new()),
            ops,
        }
    }

    /// Define a method or constant.
    pub fn define(&self, name: GirderString, value: Value) {
        self.methods.borrow_mut().insert(name, value);
    }

    /// Look up a method or constant; absent names read as `None`.
    pub fn lookup(&self, name: &GirderString) -> Option<Value> {
        self.methods.borrow().get(name).cloned()
    }
}

/// Heap block for a native object.
pub struct NativeData {
    refcount: Cell<usize>,
    vtable: Rc<VirtualTable>,
    payload: RefCell<Box<dyn Any>>,
}

impl NativeData {
    pub(crate) fn retain(&self) {
        self.refcount.set(self.refcount.get() + 1);
    }
}

/// Counted handle to a native-object block.
pub struct GirderNative {
    data: NonNull<NativeData>,
}

impl GirderNative {
    /// Allocate a native object with refcount 1.
    pub fn new(vtable: Rc<VirtualTable>, payload: Box<dyn Any>) -> Self {
        let data = Box::new(NativeData {
            refcount: Cell::new(1),
            vtable,
            payload: RefCell::new(payload),
        });
        GirderNative {
            data: NonNull::from(Box::leak(data)),
        }
    }

    /// Rebuild a handle from a raw block pointer without touching the
    /// refcount.
    ///
    /// # Safety
    /// `ptr` must carry an owned reference to a live block.
    pub(crate) unsafe fn from_raw(ptr: NonNull<NativeData>) -> Self {
        GirderNative { data: ptr }
    }

    pub(crate) fn into_raw(self) -> NonNull<NativeData> {
        let ptr = self.data;
        std::mem::forget(self);
        ptr
    }

    fn block(&self) -> &NativeData {
        // Safety: a live handle implies a live block.
        unsafe { self.data.as_ref() }
    }

    pub(crate) fn bump(&self) {
        self.block().retain();
    }

    pub fn refcount(&self) -> usize {
        self.block().refcount.get()
    }

    pub fn vtable(&self) -> Rc<VirtualTable> {
        Rc::clone(&self.block().vtable)
    }

    pub fn class_name(&self) -> String {
        self.block().vtable.name.clone()
    }

    /// Borrow the payload downcast to `T`; `None` if the type differs.
    pub fn with_payload<T: 'static, R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        let payload = self.block().payload.borrow();
        payload.downcast_ref::<T>().map(f)
    }

    /// Mutably borrow the payload downcast to `T`.
    pub fn with_payload_mut<T: 'static, R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let mut payload = self.block().payload.borrow_mut();
        payload.downcast_mut::<T>().map(f)
    }

    /// Handle identity, for complex-comparable equality.
    pub fn ptr_eq(&self, other: &GirderNative) -> bool {
        self.data == other.data
    }
}

impl Clone for GirderNative {
    fn clone(&self) -> Self {
        self.bump();
        GirderNative { data: self.data }
    }
}

impl Drop for GirderNative {
    fn drop(&mut self) {
        let block = unsafe { self.data.as_ref() };
        let count = block.refcount.get();
        if count > 1 {
            block.refcount.set(count - 1);
            return;
        }
        // Last handle: payload drop glue is the destructor.
        unsafe {
            drop(Box::from_raw(self.data.as_ptr()));
        }
    }
}

impl std::fmt::Debug for GirderNative {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "GirderNative({}, {:p}, rc={})",
            self.class_name(),
            self.data.as_ptr(),
            self.refcount()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interner::Interner;

    struct Counter {
        hits: u32,
    }

    #[test]
    fn test_payload_access() {
        let vtable = Rc::new(VirtualTable::new("Counter"));
        let native = GirderNative::new(vtable, Box::new(Counter { hits: 0 }));

        native.with_payload_mut::<Counter, _>(|c| c.hits += 3);
        assert_eq!(native.with_payload::<Counter, _>(|c| c.hits), Some(3));
        // Wrong payload type reads as None, not a panic.
        assert_eq!(native.with_payload::<String, _>(|s| s.len()), None);
    }

    #[test]
    fn test_destructor_runs_at_zero() {
        struct Flagged(std::rc::Rc<Cell<bool>>);
        impl Drop for Flagged {
            fn drop(&mut self) {
                self.0.set(true);
            }
        }

        let dropped = std::rc::Rc::new(Cell::new(false));
        let vtable = Rc::new(VirtualTable::new("Flagged"));
        let native = GirderNative::new(vtable, Box::new(Flagged(Rc::clone(&dropped))));
        let other = native.clone();

        drop(native);
        assert!(!dropped.get());
        drop(other);
        assert!(dropped.get());
    }

    #[test]
    fn test_vtable_method_lookup() {
        let mut interner = Interner::new();
        let vtable = VirtualTable::new("Thing");
        let name = interner.intern("Answer");
        vtable.define(name.clone(), Value::integer(42));
        assert_eq!(vtable.lookup(&name), Some(Value::integer(42)));
        assert_eq!(vtable.lookup(&interner.intern("Missing")), None);
    }
}
