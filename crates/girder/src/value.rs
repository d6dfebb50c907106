//! Tagged Value Cell
//!
//! Every Girder value fits in one 16-byte cell: a type tag word and a
//! payload word. Simple types (null, boolean, integer, number, function)
//! carry their payload directly; complex types carry a borrowed heap handle
//! whose refcount is adjusted on copy and drop.
//!
//! # Memory Layout
//!
//! `#[repr(C, align(16))]` pins the tag at offset 0 and the payload at
//! offset 8. Natively compiled code reads and writes cells directly and
//! moves whole cells with 128-bit loads, so this layout is load-bearing and
//! asserted by tests.
//!
//! # Tag Ordering
//!
//! The tag order encodes two boundaries the runtime branches on:
//! everything at or below `Function` is simple (bitwise copy/drop), and
//! everything at or below `String` is simply comparable (equality is
//! payload equality).

use crate::array::{ArrayData, GirderArray};
use crate::native::{GirderNative, NativeData};
use crate::string::{GirderString, StringData};
use crate::table::{GirderTable, TableData};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ptr::NonNull;

/// Type tag. Discriminant values are part of the compiled-code ABI.
#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Null = 0,
    Boolean = 1,
    Integer = 2,
    Number = 3,
    Function = 4,
    String = 5,
    Table = 6,
    Array = 7,
    NativeObject = 8,
}

/// Last tag whose payload carries no heap obligation.
pub const SIMPLE_TYPE_END: u64 = ValueKind::Function as u64;

/// Last tag whose `==` is payload equality.
pub const SIMPLY_COMPARABLE_END: u64 = ValueKind::String as u64;

impl ValueKind {
    /// Human-readable name, as produced by the `typeof` operator.
    pub fn name(self) -> &'static str {
        match self {
            ValueKind::Null => "null",
            ValueKind::Boolean => "boolean",
            ValueKind::Integer => "integer",
            ValueKind::Number => "number",
            ValueKind::Function => "function",
            ValueKind::String => "string",
            ValueKind::Table => "table",
            ValueKind::Array => "array",
            ValueKind::NativeObject => "native",
        }
    }
}

/// One language value: tag word + payload word.
#[repr(C, align(16))]
pub struct Value {
    kind: ValueKind,
    data: u64,
}

impl Value {
    pub fn null() -> Self {
        Value {
            kind: ValueKind::Null,
            data: 0,
        }
    }

    pub fn boolean(value: bool) -> Self {
        Value {
            kind: ValueKind::Boolean,
            data: value as u64,
        }
    }

    pub fn integer(value: i64) -> Self {
        Value {
            kind: ValueKind::Integer,
            data: value as u64,
        }
    }

    pub fn number(value: f64) -> Self {
        Value {
            kind: ValueKind::Number,
            data: value.to_bits(),
        }
    }

    /// Callable handle: the payload is a function id assigned at
    /// registration by the environment's function registry.
    pub fn function(id: u64) -> Self {
        Value {
            kind: ValueKind::Function,
            data: id,
        }
    }

    /// Rebuild a cell from raw tag and payload words without adjusting any
    /// refcount.
    ///
    /// # Safety
    /// If `kind` is complex, `data` must be an owned reference to a live
    /// heap block (the cell assumes the count).
    pub unsafe fn from_raw_parts(kind: ValueKind, data: u64) -> Self {
        Value { kind, data }
    }

    /// Decompose into raw words, keeping the reference counted.
    pub fn into_raw_parts(self) -> (ValueKind, u64) {
        let parts = (self.kind, self.data);
        std::mem::forget(self);
        parts
    }

    pub fn kind(&self) -> ValueKind {
        self.kind
    }

    /// Raw payload word.
    pub fn data(&self) -> u64 {
        self.data
    }

    pub fn is_null(&self) -> bool {
        self.kind == ValueKind::Null
    }

    pub fn is_simple_type(&self) -> bool {
        self.kind as u64 <= SIMPLE_TYPE_END
    }

    pub fn is_complex_type(&self) -> bool {
        self.kind as u64 > SIMPLE_TYPE_END
    }

    pub fn is_simply_comparable(&self) -> bool {
        self.kind as u64 <= SIMPLY_COMPARABLE_END
    }

    /// Truthiness: payload non-zero and type non-null.
    pub fn truthy(&self) -> bool {
        self.kind != ValueKind::Null && self.data != 0
    }

    pub fn as_boolean(&self) -> Option<bool> {
        match self.kind {
            ValueKind::Boolean => Some(self.data != 0),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self.kind {
            ValueKind::Integer => Some(self.data as i64),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self.kind {
            ValueKind::Number => Some(f64::from_bits(self.data)),
            _ => None,
        }
    }

    /// Integer or number widened to f64.
    pub fn as_arithmetic(&self) -> Option<f64> {
        match self.kind {
            ValueKind::Integer => Some(self.data as i64 as f64),
            ValueKind::Number => Some(f64::from_bits(self.data)),
            _ => None,
        }
    }

    pub fn as_function_id(&self) -> Option<u64> {
        match self.kind {
            ValueKind::Function => Some(self.data),
            _ => None,
        }
    }

    /// Borrow string content without touching the refcount.
    pub fn as_str(&self) -> Option<&str> {
        match self.kind {
            ValueKind::String => {
                let block = self.data as *const StringData;
                // Safety: a live String cell owns a reference to the block.
                Some(unsafe {
                    std::str::from_utf8_unchecked((*block).content())
                })
            }
            _ => None,
        }
    }

    /// Counted string handle.
    pub fn string_handle(&self) -> Option<GirderString> {
        match self.kind {
            ValueKind::String => {
                let ptr = NonNull::new(self.data as *mut StringData)?;
                let handle = unsafe { GirderString::from_raw(ptr) };
                handle.bump();
                Some(handle)
            }
            _ => None,
        }
    }

    /// Counted table handle.
    pub fn table_handle(&self) -> Option<GirderTable> {
        match self.kind {
            ValueKind::Table => {
                let ptr = NonNull::new(self.data as *mut TableData)?;
                let handle = unsafe { GirderTable::from_raw(ptr) };
                handle.bump();
                Some(handle)
            }
            _ => None,
        }
    }

    /// Counted array handle.
    pub fn array_handle(&self) -> Option<GirderArray> {
        match self.kind {
            ValueKind::Array => {
                let ptr = NonNull::new(self.data as *mut ArrayData)?;
                let handle = unsafe { GirderArray::from_raw(ptr) };
                handle.bump();
                Some(handle)
            }
            _ => None,
        }
    }

    /// Counted native-object handle.
    pub fn native_handle(&self) -> Option<GirderNative> {
        match self.kind {
            ValueKind::NativeObject => {
                let ptr = NonNull::new(self.data as *mut NativeData)?;
                let handle = unsafe { GirderNative::from_raw(ptr) };
                handle.bump();
                Some(handle)
            }
            _ => None,
        }
    }

    /// Render for string concatenation and diagnostics.
    pub fn to_display_string(&self) -> String {
        match self.kind {
            ValueKind::Null => "null".to_string(),
            ValueKind::Boolean => if self.data != 0 { "true" } else { "false" }.to_string(),
            ValueKind::Integer => (self.data as i64).to_string(),
            ValueKind::Number => format!("{}", f64::from_bits(self.data)),
            ValueKind::Function => format!("Function<{}>", self.data),
            ValueKind::String => self.as_str().unwrap_or_default().to_string(),
            ValueKind::Table => format!("Table<{:#x}>", self.data),
            ValueKind::Array => {
                let handle = self.array_handle().expect("array cell holds array block");
                let parts: Vec<String> = (0..handle.len())
                    .map(|i| handle.get(i).map(|v| v.to_display_string()).unwrap_or_default())
                    .collect();
                format!("[{}]", parts.join(", "))
            }
            ValueKind::NativeObject => {
                let handle = self
                    .native_handle()
                    .expect("native cell holds native block");
                format!("{}<{:#x}>", handle.class_name(), self.data)
            }
        }
    }
}

/// Bump the refcount behind a complex payload.
///
/// # Safety
/// `data` must point at a live heap block of the matching kind.
pub(crate) unsafe fn reference_payload(kind: ValueKind, data: u64) {
    unsafe {
        match kind {
            ValueKind::String => (*(data as *const StringData)).retain(),
            ValueKind::Table => (*(data as *const TableData)).retain(),
            ValueKind::Array => (*(data as *const ArrayData)).retain(),
            ValueKind::NativeObject => (*(data as *const NativeData)).retain(),
            _ => {}
        }
    }
}

/// Drop one reference behind a complex payload, freeing at zero.
///
/// # Safety
/// `data` must carry an owned reference to a live heap block of the
/// matching kind; that reference is consumed.
pub(crate) unsafe fn dereference_payload(kind: ValueKind, data: u64) {
    unsafe {
        match kind {
            ValueKind::String => {
                if let Some(ptr) = NonNull::new(data as *mut StringData) {
                    drop(GirderString::from_raw(ptr));
                }
            }
            ValueKind::Table => {
                if let Some(ptr) = NonNull::new(data as *mut TableData) {
                    drop(GirderTable::from_raw(ptr));
                }
            }
            ValueKind::Array => {
                if let Some(ptr) = NonNull::new(data as *mut ArrayData) {
                    drop(GirderArray::from_raw(ptr));
                }
            }
            ValueKind::NativeObject => {
                if let Some(ptr) = NonNull::new(data as *mut NativeData) {
                    drop(GirderNative::from_raw(ptr));
                }
            }
            _ => {}
        }
    }
}

impl Clone for Value {
    fn clone(&self) -> Self {
        if self.is_complex_type() {
            // Safety: this cell owns a reference, so the block is live.
            unsafe { reference_payload(self.kind, self.data) };
        }
        Value {
            kind: self.kind,
            data: self.data,
        }
    }
}

impl Drop for Value {
    fn drop(&mut self) {
        if self.is_complex_type() {
            // Safety: this cell owns the reference being released.
            unsafe { dereference_payload(self.kind, self.data) };
            self.kind = ValueKind::Null;
            self.data = 0;
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::null()
    }
}

// Raw cell equality: tag plus payload bits. Simply comparable types compare
// content (strings by handle, valid through interning); complex types
// compare handle identity. Operator-level `==` with native overloads lives
// in `object.rs` on top of this.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.data == other.data
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (self.kind as u64).hash(state);
        self.data.hash(state);
    }
}

impl From<GirderString> for Value {
    fn from(handle: GirderString) -> Self {
        Value {
            kind: ValueKind::String,
            data: handle.into_raw().as_ptr() as u64,
        }
    }
}

impl From<GirderTable> for Value {
    fn from(handle: GirderTable) -> Self {
        Value {
            kind: ValueKind::Table,
            data: handle.into_raw().as_ptr() as u64,
        }
    }
}

impl From<GirderArray> for Value {
    fn from(handle: GirderArray) -> Self {
        Value {
            kind: ValueKind::Array,
            data: handle.into_raw().as_ptr() as u64,
        }
    }
}

impl From<GirderNative> for Value {
    fn from(handle: GirderNative) -> Self {
        Value {
            kind: ValueKind::NativeObject,
            data: handle.into_raw().as_ptr() as u64,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ValueKind::String => write!(f, "Value::String({:?})", self.as_str().unwrap_or("")),
            ValueKind::Table | ValueKind::Array | ValueKind::NativeObject => {
                write!(f, "Value::{:?}({:#x})", self.kind, self.data)
            }
            _ => write!(f, "Value::{:?}({})", self.kind, self.to_display_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interner::Interner;
    use std::mem::{align_of, offset_of, size_of};

    #[test]
    fn test_cell_layout() {
        // Compiled code depends on this layout: tag at 0, payload at 8,
        // 16 bytes total, 16-byte aligned for 128-bit cell moves.
        assert_eq!(size_of::<Value>(), 16);
        assert_eq!(align_of::<Value>(), 16);
        assert_eq!(offset_of!(Value, kind), 0);
        assert_eq!(offset_of!(Value, data), 8);
    }

    #[test]
    fn test_tag_boundaries() {
        assert!(Value::function(0).is_simple_type());
        assert!(Value::function(0).is_simply_comparable());
        assert!(Value::number(1.0).is_simple_type());

        let mut interner = Interner::new();
        let s = Value::from(interner.intern("s"));
        assert!(!s.is_simple_type());
        assert!(s.is_simply_comparable());
    }

    #[test]
    fn test_truthiness() {
        assert!(!Value::null().truthy());
        assert!(!Value::boolean(false).truthy());
        assert!(Value::boolean(true).truthy());
        assert!(!Value::integer(0).truthy());
        assert!(Value::integer(-3).truthy());
        assert!(!Value::number(0.0).truthy());
        assert!(Value::number(0.5).truthy());
    }

    #[test]
    fn test_number_payload_round_trip() {
        let v = Value::number(-123.456);
        assert_eq!(v.as_number(), Some(-123.456));
        assert_eq!(v.as_integer(), None);
    }

    #[test]
    fn test_string_cell_refcount() {
        let mut interner = Interner::new();
        let s = interner.intern("cell");
        assert_eq!(s.refcount(), 1);

        let v = Value::from(s.clone());
        assert_eq!(s.refcount(), 2);

        let w = v.clone();
        assert_eq!(s.refcount(), 3);

        drop(w);
        drop(v);
        assert_eq!(s.refcount(), 1);
    }

    #[test]
    fn test_display_strings() {
        assert_eq!(Value::null().to_display_string(), "null");
        assert_eq!(Value::boolean(true).to_display_string(), "true");
        assert_eq!(Value::integer(14).to_display_string(), "14");
        assert_eq!(Value::function(3).to_display_string(), "Function<3>");

        let mut interner = Interner::new();
        let s = Value::from(interner.intern("text"));
        assert_eq!(s.to_display_string(), "text");
    }

    #[test]
    fn test_raw_cell_equality() {
        assert_eq!(Value::integer(5), Value::integer(5));
        assert_ne!(Value::integer(5), Value::number(5.0));

        let mut interner = Interner::new();
        let a = Value::from(interner.intern("x"));
        let b = Value::from(interner.intern("x"));
        assert_eq!(a, b);
    }
}
