//! Runtime Helpers for Natively Compiled Code
//!
//! Every `girder_rt_*` function is an `extern "C"` entry point whose
//! address the code generator embeds as a 64-bit immediate. The contract
//! shared by all of them:
//!
//! - input cells are borrowed; the caller still owns their references and
//!   dereferences its temporaries afterwards
//! - output cells are written with `ptr::write` into storage the caller
//!   has already emptied; the caller receives ownership of the result
//! - failures record the exception in the environment and set the
//!   unwinding flag; compiled code tests the flag after every call site
//!   and jumps to its scope's unwind label
//!
//! Nothing here allocates per call beyond what the operation itself
//! requires; argument passing reuses the environment's argument slot.

use crate::environment::Environment;
use crate::object::{self, BinaryOp};
use crate::string::StringData;
use crate::value::{Value, ValueKind};
use std::ptr::NonNull;

/// Reborrow a raw cell.
///
/// # Safety
/// `cell` must point at a live, initialized value cell.
unsafe fn cell<'a>(ptr: *const Value) -> &'a Value {
    unsafe { &*ptr }
}

unsafe fn env_ref<'a>(env: *mut Environment) -> &'a mut Environment {
    unsafe { &mut *env }
}

/// Write an owned result into caller-provided storage. The destination is
/// dead storage; nothing is dropped.
unsafe fn write_out(out: *mut Value, value: Value) {
    unsafe { std::ptr::write(out, value) }
}

// ----------------------------------------------------------------------
// Reference counting
// ----------------------------------------------------------------------

/// Bump the refcount behind a cell in place (the cell was copied bitwise
/// into a long-lived location).
#[unsafe(no_mangle)]
pub unsafe extern "C" fn girder_rt_reference(cell_ptr: *mut Value) {
    let value = unsafe { cell(cell_ptr) };
    if value.is_complex_type() {
        unsafe { crate::value::reference_payload(value.kind(), value.data()) };
    }
}

/// Release the reference a cell owns and reset the cell to null.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn girder_rt_dereference(cell_ptr: *mut Value) {
    unsafe {
        let value = std::ptr::read(cell_ptr);
        drop(value);
        std::ptr::write(cell_ptr, Value::null());
    }
}

/// Release `count` consecutive cells starting at `base`. This is the
/// compiler's garbage collection: emitted on every block exit.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn girder_rt_block_dereference(base: *mut Value, count: usize) {
    for i in 0..count {
        unsafe { girder_rt_dereference(base.add(i)) };
    }
}

// ----------------------------------------------------------------------
// Operators
// ----------------------------------------------------------------------

macro_rules! binary_helper {
    ($name:ident, $op:path) => {
        #[unsafe(no_mangle)]
        pub unsafe extern "C" fn $name(
            env: *mut Environment,
            out: *mut Value,
            lhs: *const Value,
            rhs: *const Value,
        ) {
            let env = unsafe { env_ref(env) };
            let (lhs, rhs) = unsafe { (cell(lhs), cell(rhs)) };
            if let Ok(value) = $op(env, lhs, rhs) {
                unsafe { write_out(out, value) };
            }
        }
    };
}

binary_helper!(girder_rt_add, object::add);
binary_helper!(girder_rt_sub, object::sub);
binary_helper!(girder_rt_mul, object::mul);
binary_helper!(girder_rt_div, object::div);
binary_helper!(girder_rt_mod, object::modulus);
binary_helper!(girder_rt_pow, object::pow);
binary_helper!(girder_rt_eq, object::eq);
binary_helper!(girder_rt_ne, object::ne);
binary_helper!(girder_rt_lt, object::lt);
binary_helper!(girder_rt_le, object::le);
binary_helper!(girder_rt_gt, object::gt);
binary_helper!(girder_rt_ge, object::ge);
binary_helper!(girder_rt_or, object::logical_or);
binary_helper!(girder_rt_and, object::logical_and);
binary_helper!(girder_rt_bor, object::bor);
binary_helper!(girder_rt_bxor, object::bxor);
binary_helper!(girder_rt_band, object::band);
binary_helper!(girder_rt_shl, object::shl);
binary_helper!(girder_rt_shr, object::shr);

macro_rules! unary_helper {
    ($name:ident, $op:path) => {
        #[unsafe(no_mangle)]
        pub unsafe extern "C" fn $name(
            env: *mut Environment,
            out: *mut Value,
            operand: *const Value,
        ) {
            let env = unsafe { env_ref(env) };
            let operand = unsafe { cell(operand) };
            if let Ok(value) = $op(env, operand) {
                unsafe { write_out(out, value) };
            }
        }
    };
}

unary_helper!(girder_rt_not, object::logical_not);
unary_helper!(girder_rt_bnot, object::bnot);
unary_helper!(girder_rt_length, object::length);

#[unsafe(no_mangle)]
pub unsafe extern "C" fn girder_rt_typeof(
    env: *mut Environment,
    out: *mut Value,
    operand: *const Value,
) {
    let env = unsafe { env_ref(env) };
    let operand = unsafe { cell(operand) };
    let value = object::type_of(env, operand);
    unsafe { write_out(out, value) };
}

// ----------------------------------------------------------------------
// Indexing and selection
// ----------------------------------------------------------------------

/// Read-only selection (`a.k`, `a::k`, `a->k`, `a[k]` in value position).
#[unsafe(no_mangle)]
pub unsafe extern "C" fn girder_rt_select(
    env: *mut Environment,
    out: *mut Value,
    target: *const Value,
    key: *const Value,
) {
    let env = unsafe { env_ref(env) };
    let (target, key) = unsafe { (cell(target), cell(key)) };
    if let Ok(value) = object::select(env, target, key) {
        unsafe { write_out(out, value) };
    }
}

/// Ranged selection (`a[i:j]`).
#[unsafe(no_mangle)]
pub unsafe extern "C" fn girder_rt_ranged_select(
    env: *mut Environment,
    out: *mut Value,
    target: *const Value,
    from: *const Value,
    to: *const Value,
) {
    let env = unsafe { env_ref(env) };
    let (target, from, to) = unsafe { (cell(target), cell(from), cell(to)) };
    if let Ok(value) = object::ranged_select(env, target, from, to) {
        unsafe { write_out(out, value) };
    }
}

/// `a[k] = v` through the reference cell protocol.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn girder_rt_index_assign(
    env: *mut Environment,
    target: *const Value,
    key: *const Value,
    value: *const Value,
) {
    let env = unsafe { env_ref(env) };
    let (target, key, value) = unsafe { (cell(target), cell(key), cell(value)) };
    if let Ok(reference) = object::index(env, target, key) {
        let _ = object::assign(env, &reference, value.clone());
    }
}

/// `a[k] op= v`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn girder_rt_index_compound(
    env: *mut Environment,
    op: u32,
    target: *const Value,
    key: *const Value,
    rhs: *const Value,
) {
    let env = unsafe { env_ref(env) };
    let (target, key, rhs) = unsafe { (cell(target), cell(key), cell(rhs)) };
    let op = binary_op_from(op);
    if let Ok(reference) = object::index(env, target, key) {
        let _ = object::apply_compound(env, op, &reference, rhs);
    }
}

/// `++a[k]` and friends. `prefix` non-zero yields the updated value.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn girder_rt_step_index(
    env: *mut Environment,
    out: *mut Value,
    target: *const Value,
    key: *const Value,
    delta: i64,
    prefix: u8,
) {
    let env = unsafe { env_ref(env) };
    let (target, key) = unsafe { (cell(target), cell(key)) };
    if let Ok(reference) = object::index(env, target, key) {
        if let Ok(value) = object::step(env, &reference, delta, prefix != 0) {
            unsafe { write_out(out, value) };
        }
    }
}

// ----------------------------------------------------------------------
// Local cells (compound assignment and stepping act on the slot directly)
// ----------------------------------------------------------------------

/// `x op= v` where `x` is a local slot or argument cell.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn girder_rt_compound_cell(
    env: *mut Environment,
    op: u32,
    slot: *mut Value,
    rhs: *const Value,
) {
    let env = unsafe { env_ref(env) };
    let rhs = unsafe { cell(rhs) };
    let op = binary_op_from(op);
    let current = unsafe { cell(slot) };

    // Arrays append in place for `+=`; everything else computes then
    // replaces the slot's owned cell.
    if op == BinaryOp::Add && current.kind() == ValueKind::Array {
        let array = current.array_handle().expect("array cell");
        if !array.push(rhs.clone()) {
            let _ = env.throw_message(
                crate::error::exception::TYPE_ERROR,
                "cannot grow an array view",
            );
        }
        return;
    }

    match object::binary(env, op, current, rhs) {
        Ok(updated) => unsafe {
            girder_rt_dereference(slot);
            write_out(slot, updated);
        },
        Err(_) => {}
    }
}

/// `++x` / `x++` on a local slot or argument cell.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn girder_rt_step_cell(
    env: *mut Environment,
    out: *mut Value,
    slot: *mut Value,
    delta: i64,
    prefix: u8,
) {
    let env = unsafe { env_ref(env) };
    let current = unsafe { cell(slot) };
    let updated = match current.kind() {
        ValueKind::Integer => Value::integer(current.as_integer().unwrap().wrapping_add(delta)),
        ValueKind::Number => Value::number(current.as_number().unwrap() + delta as f64),
        other => {
            let op = if delta > 0 { "++" } else { "--" };
            let _ = env.throw_message(
                crate::error::exception::TYPE_ERROR,
                format!("unsupported operand for {}: {}", op, other.name()),
            );
            return;
        }
    };
    let yielded = if prefix != 0 {
        updated.clone()
    } else {
        current.clone()
    };
    unsafe {
        girder_rt_dereference(slot);
        write_out(slot, updated);
        write_out(out, yielded);
    }
}

// ----------------------------------------------------------------------
// Globals
// ----------------------------------------------------------------------

/// Read a global by interned name; absent reads as null.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn girder_rt_global_get(
    env: *mut Environment,
    out: *mut Value,
    name: *const StringData,
) {
    let env = unsafe { env_ref(env) };
    let key = unsafe { name_cell(name) };
    let value = env.globals().get(&key);
    std::mem::forget(key);
    unsafe { write_out(out, value) };
}

/// Write a global by interned name.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn girder_rt_global_set(
    env: *mut Environment,
    name: *const StringData,
    value: *const Value,
) {
    let env = unsafe { env_ref(env) };
    let key = unsafe { name_cell(name) };
    let value = unsafe { cell(value) };
    // The key cell borrows the codegen-pinned string; clone gives the
    // table its own reference.
    env.globals().set(key.clone(), value.clone());
    std::mem::forget(key);
}

/// `g op= v` on a global.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn girder_rt_global_compound(
    env: *mut Environment,
    op: u32,
    name: *const StringData,
    rhs: *const Value,
) {
    let env = unsafe { env_ref(env) };
    let key = unsafe { name_cell(name) };
    let rhs = unsafe { cell(rhs) };
    let reference = object::Reference::TableEntry {
        table: env.globals().clone(),
        key: key.clone(),
    };
    std::mem::forget(key);
    let _ = object::apply_compound(env, binary_op_from(op), &reference, rhs);
}

/// `++g` / `g++` on a global.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn girder_rt_step_global(
    env: *mut Environment,
    out: *mut Value,
    name: *const StringData,
    delta: i64,
    prefix: u8,
) {
    let env = unsafe { env_ref(env) };
    let key = unsafe { name_cell(name) };
    let reference = object::Reference::TableEntry {
        table: env.globals().clone(),
        key: key.clone(),
    };
    std::mem::forget(key);
    if let Ok(value) = object::step(env, &reference, delta, prefix != 0) {
        unsafe { write_out(out, value) };
    }
}

/// Build a borrowed key cell around a codegen-pinned interned string.
///
/// # Safety
/// `name` must be a string block pinned for the lifetime of the compiled
/// code (the JIT state holds a handle). The returned cell must be
/// `mem::forget`-ed or cloned, never dropped.
unsafe fn name_cell(name: *const StringData) -> Value {
    let ptr = NonNull::new(name as *mut StringData).expect("pinned name");
    unsafe { Value::from_raw_parts(ValueKind::String, ptr.as_ptr() as u64) }
}

// ----------------------------------------------------------------------
// Literals
// ----------------------------------------------------------------------

/// Allocate an empty table; the enclosing expression owns the single
/// reference created.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn girder_rt_new_table(out: *mut Value) {
    unsafe { write_out(out, Value::from(crate::table::GirderTable::new())) };
}

/// Allocate a managed array of `len` null cells.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn girder_rt_new_array(out: *mut Value, len: usize) {
    let elements = (0..len).map(|_| Value::null()).collect();
    unsafe { write_out(out, Value::from(crate::array::GirderArray::managed(elements))) };
}

/// Element store for array literals.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn girder_rt_array_set(
    env: *mut Environment,
    array: *const Value,
    index: usize,
    value: *const Value,
) {
    let env = unsafe { env_ref(env) };
    let (array, value) = unsafe { (cell(array), cell(value)) };
    let handle = array.array_handle().expect("array cell");
    if !handle.set(index, value.clone()) {
        let _ = env.throw_message(
            crate::error::exception::INDEX_ERROR,
            format!("index {} out of bounds (length {})", index, handle.len()),
        );
    }
}

// ----------------------------------------------------------------------
// Calls
// ----------------------------------------------------------------------

/// Invoke any callee cell. Arguments were written to the environment's
/// argument slot by the caller; the result lands in `*ret`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn girder_rt_invoke(
    env: *mut Environment,
    ret: *mut Value,
    callee: *const Value,
) {
    let env = unsafe { env_ref(env) };
    let callee = unsafe { cell(callee) };
    // Copy the arguments out: the callee is free to reuse the slot.
    let args = env.args();
    if let Ok(value) = env.call_value(callee, &args) {
        unsafe { write_out(ret, value) };
    }
}

/// `new T(args)`, arguments through the slot.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn girder_rt_construct(
    env: *mut Environment,
    ret: *mut Value,
    callee: *const Value,
) {
    let env = unsafe { env_ref(env) };
    let callee = unsafe { cell(callee) };
    let args = env.args();
    if let Ok(value) = object::construct(env, callee, &args) {
        unsafe { write_out(ret, value) };
    }
}

/// Bind `function(a.b.c)`-style declarations: walk the dotted path from
/// the globals, creating intermediate tables, and store the function
/// value at the leaf. `parts` is an array of pinned string-block
/// addresses emitted alongside the compiled code.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn girder_rt_declare_function(
    env: *mut Environment,
    parts: *const u64,
    count: usize,
    function_id: u64,
) {
    let env = unsafe { env_ref(env) };
    let mut table = env.globals().clone();
    for i in 0..count {
        let name = unsafe { name_cell(*parts.add(i) as *const StringData) };
        if i + 1 == count {
            table.set(name.clone(), Value::function(function_id));
            std::mem::forget(name);
            return;
        }
        let entry = table.get(&name);
        let next = match entry.kind() {
            ValueKind::Table => entry.table_handle().expect("table cell"),
            ValueKind::Null => {
                let fresh = crate::table::GirderTable::new();
                table.set(name.clone(), Value::from(fresh.clone()));
                fresh
            }
            other => {
                let segment = name.as_str().unwrap_or_default().to_string();
                std::mem::forget(name);
                let _ = env.throw_message(
                    crate::error::exception::TYPE_ERROR,
                    format!(
                        "cannot declare through {} (a {} value)",
                        segment,
                        other.name()
                    ),
                );
                return;
            }
        };
        std::mem::forget(name);
        table = next;
    }
}

fn binary_op_from(op: u32) -> BinaryOp {
    match op {
        0 => BinaryOp::Add,
        1 => BinaryOp::Sub,
        2 => BinaryOp::Mul,
        3 => BinaryOp::Div,
        4 => BinaryOp::Mod,
        5 => BinaryOp::Pow,
        6 => BinaryOp::BitOr,
        7 => BinaryOp::BitXor,
        8 => BinaryOp::BitAnd,
        9 => BinaryOp::Shl,
        _ => BinaryOp::Shr,
    }
}

/// Stable operator encodings for `girder_rt_*_compound` and friends.
/// Codegen embeds these as immediates.
pub fn binary_op_code(op: BinaryOp) -> u32 {
    match op {
        BinaryOp::Add => 0,
        BinaryOp::Sub => 1,
        BinaryOp::Mul => 2,
        BinaryOp::Div => 3,
        BinaryOp::Mod => 4,
        BinaryOp::Pow => 5,
        BinaryOp::BitOr => 6,
        BinaryOp::BitXor => 7,
        BinaryOp::BitAnd => 8,
        BinaryOp::Shl => 9,
        BinaryOp::Shr => 10,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::ProviderKind;

    #[test]
    fn test_reference_dereference_round_trip() {
        let mut env = Environment::new(ProviderKind::Interpreter);
        let s = env.intern("cell");
        let mut slot = Value::from(s.clone());
        assert_eq!(s.refcount(), 2);

        unsafe { girder_rt_reference(&mut slot as *mut Value) };
        assert_eq!(s.refcount(), 3);

        // Give back the extra count, then release the slot itself.
        unsafe {
            crate::value::dereference_payload(slot.kind(), slot.data());
        }
        assert_eq!(s.refcount(), 2);

        unsafe { girder_rt_dereference(&mut slot as *mut Value) };
        assert_eq!(s.refcount(), 1);
        assert!(slot.is_null());
    }

    #[test]
    fn test_block_dereference_nulls_cells() {
        let mut env = Environment::new(ProviderKind::Interpreter);
        let s = env.intern("local");
        let mut slots = [
            Value::from(s.clone()),
            Value::integer(3),
            Value::from(s.clone()),
        ];
        assert_eq!(s.refcount(), 3);

        unsafe { girder_rt_block_dereference(slots.as_mut_ptr(), slots.len()) };
        assert_eq!(s.refcount(), 1);
        assert!(slots.iter().all(Value::is_null));
    }

    #[test]
    fn test_binary_helper_writes_result() {
        let mut env = Environment::new(ProviderKind::Interpreter);
        let lhs = Value::integer(2);
        let rhs = Value::integer(3);
        let mut out = Value::null();
        unsafe {
            girder_rt_add(
                env.as_mut() as *mut Environment,
                &mut out as *mut Value,
                &lhs as *const Value,
                &rhs as *const Value,
            );
        }
        assert_eq!(out, Value::integer(5));
        assert!(!env.is_unwinding());
    }

    #[test]
    fn test_binary_helper_sets_unwind_flag() {
        let mut env = Environment::new(ProviderKind::Interpreter);
        let lhs = Value::from(crate::table::GirderTable::new());
        let rhs = Value::integer(1);
        let mut out = Value::null();
        unsafe {
            girder_rt_add(
                env.as_mut() as *mut Environment,
                &mut out as *mut Value,
                &lhs as *const Value,
                &rhs as *const Value,
            );
        }
        assert!(env.is_unwinding());
        assert!(out.is_null());
    }

    #[test]
    fn test_global_helpers() {
        let mut env = Environment::new(ProviderKind::Interpreter);
        let name = env.intern("counter");
        let value = Value::integer(10);
        unsafe {
            girder_rt_global_set(
                env.as_mut() as *mut Environment,
                name.raw().as_ptr(),
                &value as *const Value,
            );
        }
        assert_eq!(env.global("counter"), Value::integer(10));

        let mut out = Value::null();
        unsafe {
            girder_rt_step_global(
                env.as_mut() as *mut Environment,
                &mut out as *mut Value,
                name.raw().as_ptr(),
                1,
                1,
            );
        }
        assert_eq!(out, Value::integer(11));
        assert_eq!(env.global("counter"), Value::integer(11));
    }
}
