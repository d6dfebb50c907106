//! Value Operator Protocol
//!
//! Every operation dispatches on the left operand's type tag; a native
//! object forwards to its v-table operator slot before any fallback, and a
//! missing slot traps. Anything outside the defined combinations raises a
//! runtime error.
//!
//! Shape of the rules:
//! - numeric pairs produce numeric results; integer-integer stays integer
//!   except division, which always yields number; mixing widens to number
//! - string `+` concatenates after coercing the other side; string `*`
//!   integer repeats; simple types stringify when added to a string
//! - array `+` returns a fresh array with the value appended; the compound
//!   form mutates in place
//! - comparisons widen numeric mixes and compare string length against
//!   integers
//! - bitwise and shift operate on the payload bits of integers and numbers

use crate::array::GirderArray;
use crate::environment::Environment;
use crate::error::{EvalResult, exception};
use crate::native::VirtualTable;
use crate::table::GirderTable;
use crate::value::{Value, ValueKind};
use std::rc::Rc;

/// Mutable cell reference: the result of evaluating an assignable
/// position. Reads and writes go through the owning handle, so a resize
/// between producing and using the reference is caught instead of
/// dereferencing stale storage.
#[derive(Debug, Clone)]
pub enum Reference {
    TableEntry { table: GirderTable, key: Value },
    ArrayElement { array: GirderArray, index: usize },
}

impl Reference {
    pub fn read(&self, env: &mut Environment) -> EvalResult<Value> {
        match self {
            Reference::TableEntry { table, key } => Ok(table.get(key)),
            Reference::ArrayElement { array, index } => match array.get(*index) {
                Some(value) => Ok(value),
                None => Err(env.throw_message(
                    exception::INDEX_ERROR,
                    format!("index {} out of bounds (length {})", index, array.len()),
                )),
            },
        }
    }

    pub fn write(&self, env: &mut Environment, value: Value) -> EvalResult<()> {
        match self {
            Reference::TableEntry { table, key } => {
                table.set(key.clone(), value);
                Ok(())
            }
            Reference::ArrayElement { array, index } => {
                if array.set(*index, value) {
                    Ok(())
                } else {
                    Err(env.throw_message(
                        exception::INDEX_ERROR,
                        format!("index {} out of bounds (length {})", index, array.len()),
                    ))
                }
            }
        }
    }
}

/// Binary operators that can also appear in compound-assignment form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    BitOr,
    BitXor,
    BitAnd,
    Shl,
    Shr,
}

fn type_error(env: &mut Environment, op: &str, lhs: &Value, rhs: &Value) -> crate::error::Unwind {
    env.throw_message(
        exception::TYPE_ERROR,
        format!(
            "unsupported operands for {}: {} and {}",
            op,
            lhs.kind().name(),
            rhs.kind().name()
        ),
    )
}

fn unary_type_error(env: &mut Environment, op: &str, value: &Value) -> crate::error::Unwind {
    env.throw_message(
        exception::TYPE_ERROR,
        format!("unsupported operand for {}: {}", op, value.kind().name()),
    )
}

fn unsupported(env: &mut Environment, class: &str, op: &str) -> crate::error::Unwind {
    env.throw_message(
        exception::UNSUPPORTED_OPERATION,
        format!("{} does not overload {}", class, op),
    )
}

fn vtable_of(value: &Value) -> Option<Rc<VirtualTable>> {
    value.native_handle().map(|native| native.vtable())
}

fn concat(env: &mut Environment, lhs: &Value, rhs: &Value) -> Value {
    let mut text = lhs.to_display_string();
    text.push_str(&rhs.to_display_string());
    Value::from(env.intern(&text))
}

/// Character count; string indexing, slicing, and length all agree on
/// character positions rather than bytes.
fn string_len(value: &Value) -> Option<i64> {
    value.as_str().map(|s| s.chars().count() as i64)
}

// ----------------------------------------------------------------------
// Arithmetic
// ----------------------------------------------------------------------

pub fn add(env: &mut Environment, lhs: &Value, rhs: &Value) -> EvalResult<Value> {
    match lhs.kind() {
        ValueKind::Null | ValueKind::Boolean | ValueKind::Function => {
            if rhs.kind() == ValueKind::String {
                Ok(concat(env, lhs, rhs))
            } else {
                Err(type_error(env, "+", lhs, rhs))
            }
        }
        ValueKind::Integer => match rhs.kind() {
            ValueKind::Integer => Ok(Value::integer(
                lhs.as_integer().unwrap().wrapping_add(rhs.as_integer().unwrap()),
            )),
            ValueKind::Number => Ok(Value::number(
                lhs.as_integer().unwrap() as f64 + rhs.as_number().unwrap(),
            )),
            ValueKind::String => Ok(concat(env, lhs, rhs)),
            _ => Err(type_error(env, "+", lhs, rhs)),
        },
        ValueKind::Number => match rhs.kind() {
            ValueKind::Integer => Ok(Value::number(
                lhs.as_number().unwrap() + rhs.as_integer().unwrap() as f64,
            )),
            ValueKind::Number => Ok(Value::number(
                lhs.as_number().unwrap() + rhs.as_number().unwrap(),
            )),
            ValueKind::String => Ok(concat(env, lhs, rhs)),
            _ => Err(type_error(env, "+", lhs, rhs)),
        },
        ValueKind::String => Ok(concat(env, lhs, rhs)),
        ValueKind::Array => {
            let array = lhs.array_handle().expect("array cell");
            let mut elements = array.to_vec();
            elements.push(rhs.clone());
            Ok(Value::from(GirderArray::managed(elements)))
        }
        ValueKind::Table => Err(type_error(env, "+", lhs, rhs)),
        ValueKind::NativeObject => {
            let vtable = vtable_of(lhs).expect("native cell");
            match vtable.ops.add {
                Some(slot) => slot(env, lhs, rhs),
                None => Err(unsupported(env, &vtable.name, "+")),
            }
        }
    }
}

fn numeric_binary(
    env: &mut Environment,
    op: &str,
    lhs: &Value,
    rhs: &Value,
    int_op: fn(i64, i64) -> i64,
    num_op: fn(f64, f64) -> f64,
    slot: fn(&VirtualTable) -> Option<crate::native::BinarySlot>,
) -> EvalResult<Value> {
    match (lhs.kind(), rhs.kind()) {
        (ValueKind::Integer, ValueKind::Integer) => Ok(Value::integer(int_op(
            lhs.as_integer().unwrap(),
            rhs.as_integer().unwrap(),
        ))),
        (ValueKind::Integer, ValueKind::Number)
        | (ValueKind::Number, ValueKind::Integer)
        | (ValueKind::Number, ValueKind::Number) => Ok(Value::number(num_op(
            lhs.as_arithmetic().unwrap(),
            rhs.as_arithmetic().unwrap(),
        ))),
        (ValueKind::NativeObject, _) => {
            let vtable = vtable_of(lhs).expect("native cell");
            match slot(&vtable) {
                Some(f) => f(env, lhs, rhs),
                None => Err(unsupported(env, &vtable.name, op)),
            }
        }
        _ => Err(type_error(env, op, lhs, rhs)),
    }
}

pub fn sub(env: &mut Environment, lhs: &Value, rhs: &Value) -> EvalResult<Value> {
    numeric_binary(env, "-", lhs, rhs, i64::wrapping_sub, |a, b| a - b, |v| v.ops.sub)
}

pub fn mul(env: &mut Environment, lhs: &Value, rhs: &Value) -> EvalResult<Value> {
    // String repetition comes before the numeric matrix.
    if lhs.kind() == ValueKind::String {
        if let Some(count) = rhs.as_integer() {
            let repeated = lhs.as_str().unwrap().repeat(count.max(0) as usize);
            return Ok(Value::from(env.intern(&repeated)));
        }
        return Err(type_error(env, "*", lhs, rhs));
    }
    numeric_binary(env, "*", lhs, rhs, i64::wrapping_mul, |a, b| a * b, |v| v.ops.mul)
}

pub fn div(env: &mut Environment, lhs: &Value, rhs: &Value) -> EvalResult<Value> {
    // Division always yields number, even for integer operands.
    match (lhs.kind(), rhs.kind()) {
        (ValueKind::Integer | ValueKind::Number, ValueKind::Integer | ValueKind::Number) => {
            Ok(Value::number(
                lhs.as_arithmetic().unwrap() / rhs.as_arithmetic().unwrap(),
            ))
        }
        (ValueKind::NativeObject, _) => {
            let vtable = vtable_of(lhs).expect("native cell");
            match vtable.ops.div {
                Some(slot) => slot(env, lhs, rhs),
                None => Err(unsupported(env, &vtable.name, "/")),
            }
        }
        _ => Err(type_error(env, "/", lhs, rhs)),
    }
}

pub fn modulus(env: &mut Environment, lhs: &Value, rhs: &Value) -> EvalResult<Value> {
    match (lhs.kind(), rhs.kind()) {
        (ValueKind::Integer, ValueKind::Integer) => {
            let divisor = rhs.as_integer().unwrap();
            if divisor == 0 {
                return Err(env.throw_message(exception::TYPE_ERROR, "modulo by zero"));
            }
            Ok(Value::integer(lhs.as_integer().unwrap().wrapping_rem(divisor)))
        }
        (ValueKind::Integer | ValueKind::Number, ValueKind::Integer | ValueKind::Number) => {
            Ok(Value::number(
                lhs.as_arithmetic().unwrap() % rhs.as_arithmetic().unwrap(),
            ))
        }
        (ValueKind::NativeObject, _) => {
            let vtable = vtable_of(lhs).expect("native cell");
            match vtable.ops.modulus {
                Some(slot) => slot(env, lhs, rhs),
                None => Err(unsupported(env, &vtable.name, "%")),
            }
        }
        _ => Err(type_error(env, "%", lhs, rhs)),
    }
}

pub fn pow(env: &mut Environment, lhs: &Value, rhs: &Value) -> EvalResult<Value> {
    match (lhs.kind(), rhs.kind()) {
        (ValueKind::Integer, ValueKind::Integer) => {
            let base = lhs.as_integer().unwrap();
            let exp = rhs.as_integer().unwrap();
            if exp >= 0 && exp <= u32::MAX as i64 {
                Ok(Value::integer(base.wrapping_pow(exp as u32)))
            } else {
                Ok(Value::number((base as f64).powf(exp as f64)))
            }
        }
        (ValueKind::Integer | ValueKind::Number, ValueKind::Integer | ValueKind::Number) => {
            Ok(Value::number(
                lhs.as_arithmetic().unwrap().powf(rhs.as_arithmetic().unwrap()),
            ))
        }
        (ValueKind::NativeObject, _) => {
            let vtable = vtable_of(lhs).expect("native cell");
            match vtable.ops.pow {
                Some(slot) => slot(env, lhs, rhs),
                None => Err(unsupported(env, &vtable.name, "^")),
            }
        }
        _ => Err(type_error(env, "^", lhs, rhs)),
    }
}

// ----------------------------------------------------------------------
// Comparison
// ----------------------------------------------------------------------

pub fn eq(env: &mut Environment, lhs: &Value, rhs: &Value) -> EvalResult<Value> {
    if lhs.kind() == ValueKind::NativeObject {
        let vtable = vtable_of(lhs).expect("native cell");
        if let Some(slot) = vtable.ops.eq {
            return slot(env, lhs, rhs);
        }
    }
    if lhs.kind() != rhs.kind() {
        return Ok(Value::boolean(false));
    }
    // Simply comparable types compare payloads; the rest by handle
    // identity, which is payload identity for interned cells too.
    Ok(Value::boolean(lhs.data() == rhs.data()))
}

pub fn ne(env: &mut Environment, lhs: &Value, rhs: &Value) -> EvalResult<Value> {
    if lhs.kind() == ValueKind::NativeObject {
        let vtable = vtable_of(lhs).expect("native cell");
        if let Some(slot) = vtable.ops.ne {
            return slot(env, lhs, rhs);
        }
    }
    let equal = eq(env, lhs, rhs)?;
    Ok(Value::boolean(!equal.truthy()))
}

fn ordered(
    env: &mut Environment,
    op: &str,
    lhs: &Value,
    rhs: &Value,
    int_cmp: fn(i64, i64) -> bool,
    num_cmp: fn(f64, f64) -> bool,
    slot: fn(&VirtualTable) -> Option<crate::native::BinarySlot>,
) -> EvalResult<Value> {
    match (lhs.kind(), rhs.kind()) {
        (ValueKind::Integer, ValueKind::Integer) => Ok(Value::boolean(int_cmp(
            lhs.as_integer().unwrap(),
            rhs.as_integer().unwrap(),
        ))),
        (ValueKind::Integer | ValueKind::Number, ValueKind::Integer | ValueKind::Number) => {
            Ok(Value::boolean(num_cmp(
                lhs.as_arithmetic().unwrap(),
                rhs.as_arithmetic().unwrap(),
            )))
        }
        // String length against integer, both directions.
        (ValueKind::String, ValueKind::Integer) => Ok(Value::boolean(int_cmp(
            string_len(lhs).unwrap(),
            rhs.as_integer().unwrap(),
        ))),
        (ValueKind::Integer, ValueKind::String) => Ok(Value::boolean(int_cmp(
            lhs.as_integer().unwrap(),
            string_len(rhs).unwrap(),
        ))),
        (ValueKind::NativeObject, _) => {
            let vtable = vtable_of(lhs).expect("native cell");
            match slot(&vtable) {
                Some(f) => f(env, lhs, rhs),
                None => Err(unsupported(env, &vtable.name, op)),
            }
        }
        _ => Err(type_error(env, op, lhs, rhs)),
    }
}

pub fn lt(env: &mut Environment, lhs: &Value, rhs: &Value) -> EvalResult<Value> {
    ordered(env, "<", lhs, rhs, |a, b| a < b, |a, b| a < b, |v| v.ops.lt)
}

pub fn le(env: &mut Environment, lhs: &Value, rhs: &Value) -> EvalResult<Value> {
    ordered(env, "<=", lhs, rhs, |a, b| a <= b, |a, b| a <= b, |v| v.ops.le)
}

pub fn gt(env: &mut Environment, lhs: &Value, rhs: &Value) -> EvalResult<Value> {
    ordered(env, ">", lhs, rhs, |a, b| a > b, |a, b| a > b, |v| v.ops.gt)
}

pub fn ge(env: &mut Environment, lhs: &Value, rhs: &Value) -> EvalResult<Value> {
    ordered(env, ">=", lhs, rhs, |a, b| a >= b, |a, b| a >= b, |v| v.ops.ge)
}

// ----------------------------------------------------------------------
// Logical
// ----------------------------------------------------------------------

/// Non-short-circuit `||`: the evaluators short-circuit before calling
/// this; it exists for native overloads and the compiled fallback path.
pub fn logical_or(env: &mut Environment, lhs: &Value, rhs: &Value) -> EvalResult<Value> {
    if lhs.kind() == ValueKind::NativeObject {
        let vtable = vtable_of(lhs).expect("native cell");
        if let Some(slot) = vtable.ops.logical_or {
            return slot(env, lhs, rhs);
        }
    }
    if lhs.truthy() {
        Ok(lhs.clone())
    } else {
        Ok(rhs.clone())
    }
}

pub fn logical_and(env: &mut Environment, lhs: &Value, rhs: &Value) -> EvalResult<Value> {
    if lhs.kind() == ValueKind::NativeObject {
        let vtable = vtable_of(lhs).expect("native cell");
        if let Some(slot) = vtable.ops.logical_and {
            return slot(env, lhs, rhs);
        }
    }
    if lhs.truthy() && rhs.truthy() {
        Ok(rhs.clone())
    } else {
        Ok(Value::boolean(false))
    }
}

pub fn logical_not(env: &mut Environment, value: &Value) -> EvalResult<Value> {
    if value.kind() == ValueKind::NativeObject {
        let vtable = vtable_of(value).expect("native cell");
        if let Some(slot) = vtable.ops.logical_not {
            return slot(env, value);
        }
    }
    Ok(Value::boolean(!value.truthy()))
}

// ----------------------------------------------------------------------
// Bitwise and shifts (payload bits of integer and number)
// ----------------------------------------------------------------------

fn bits_binary(
    env: &mut Environment,
    op: &str,
    lhs: &Value,
    rhs: &Value,
    bit_op: fn(u64, u64) -> u64,
    slot: fn(&VirtualTable) -> Option<crate::native::BinarySlot>,
) -> EvalResult<Value> {
    match (lhs.kind(), rhs.kind()) {
        (
            ValueKind::Integer | ValueKind::Number,
            ValueKind::Integer | ValueKind::Number,
        ) => {
            // Safety: the payload carries no heap obligation for either
            // operand kind, and the result keeps the left kind.
            Ok(unsafe { Value::from_raw_parts(lhs.kind(), bit_op(lhs.data(), rhs.data())) })
        }
        (ValueKind::NativeObject, _) => {
            let vtable = vtable_of(lhs).expect("native cell");
            match slot(&vtable) {
                Some(f) => f(env, lhs, rhs),
                None => Err(unsupported(env, &vtable.name, op)),
            }
        }
        _ => Err(type_error(env, op, lhs, rhs)),
    }
}

pub fn bor(env: &mut Environment, lhs: &Value, rhs: &Value) -> EvalResult<Value> {
    bits_binary(env, "|", lhs, rhs, |a, b| a | b, |v| v.ops.bor)
}

pub fn bxor(env: &mut Environment, lhs: &Value, rhs: &Value) -> EvalResult<Value> {
    bits_binary(env, ">|", lhs, rhs, |a, b| a ^ b, |v| v.ops.bxor)
}

pub fn band(env: &mut Environment, lhs: &Value, rhs: &Value) -> EvalResult<Value> {
    bits_binary(env, "&", lhs, rhs, |a, b| a & b, |v| v.ops.band)
}

pub fn bnot(env: &mut Environment, value: &Value) -> EvalResult<Value> {
    match value.kind() {
        ValueKind::Integer | ValueKind::Number => {
            Ok(unsafe { Value::from_raw_parts(value.kind(), !value.data()) })
        }
        ValueKind::NativeObject => {
            let vtable = vtable_of(value).expect("native cell");
            match vtable.ops.bnot {
                Some(slot) => slot(env, value),
                None => Err(unsupported(env, &vtable.name, "~")),
            }
        }
        _ => Err(unary_type_error(env, "~", value)),
    }
}

pub fn shl(env: &mut Environment, lhs: &Value, rhs: &Value) -> EvalResult<Value> {
    match (lhs.kind(), rhs.kind()) {
        (ValueKind::Integer | ValueKind::Number, ValueKind::Integer) => {
            let count = (rhs.as_integer().unwrap() as u32) & 63;
            Ok(unsafe { Value::from_raw_parts(lhs.kind(), lhs.data() << count) })
        }
        (ValueKind::NativeObject, _) => {
            let vtable = vtable_of(lhs).expect("native cell");
            match vtable.ops.shl {
                Some(slot) => slot(env, lhs, rhs),
                None => Err(unsupported(env, &vtable.name, "<<")),
            }
        }
        _ => Err(type_error(env, "<<", lhs, rhs)),
    }
}

pub fn shr(env: &mut Environment, lhs: &Value, rhs: &Value) -> EvalResult<Value> {
    match (lhs.kind(), rhs.kind()) {
        (ValueKind::Integer | ValueKind::Number, ValueKind::Integer) => {
            let count = (rhs.as_integer().unwrap() as u32) & 63;
            Ok(unsafe { Value::from_raw_parts(lhs.kind(), lhs.data() >> count) })
        }
        (ValueKind::NativeObject, _) => {
            let vtable = vtable_of(lhs).expect("native cell");
            match vtable.ops.shr {
                Some(slot) => slot(env, lhs, rhs),
                None => Err(unsupported(env, &vtable.name, ">>")),
            }
        }
        _ => Err(type_error(env, ">>", lhs, rhs)),
    }
}

// ----------------------------------------------------------------------
// Length, typeof
// ----------------------------------------------------------------------

pub fn length(env: &mut Environment, value: &Value) -> EvalResult<Value> {
    match value.kind() {
        ValueKind::String => Ok(Value::integer(string_len(value).unwrap())),
        ValueKind::Array => {
            Ok(Value::integer(value.array_handle().unwrap().len() as i64))
        }
        ValueKind::NativeObject => {
            let vtable = vtable_of(value).expect("native cell");
            match vtable.ops.length {
                Some(slot) => slot(env, value),
                None => Err(unsupported(env, &vtable.name, "#")),
            }
        }
        // Everything else is its own length.
        _ => Ok(value.clone()),
    }
}

pub fn type_of(env: &mut Environment, value: &Value) -> Value {
    Value::from(env.intern(value.kind().name()))
}

// ----------------------------------------------------------------------
// Indexing and selection
// ----------------------------------------------------------------------

/// `a[k]` in assignable position: yields a mutable cell reference.
pub fn index(env: &mut Environment, target: &Value, key: &Value) -> EvalResult<Reference> {
    match target.kind() {
        ValueKind::Table => Ok(Reference::TableEntry {
            table: target.table_handle().unwrap(),
            key: key.clone(),
        }),
        ValueKind::Array => {
            let array = target.array_handle().unwrap();
            let Some(position) = key.as_integer() else {
                return Err(env.throw_message(
                    exception::TYPE_ERROR,
                    format!("array index must be an integer, got {}", key.kind().name()),
                ));
            };
            let index = normalize_index(position, array.len()).ok_or_else(|| {
                env.throw_message(
                    exception::INDEX_ERROR,
                    format!("index {} out of bounds (length {})", position, array.len()),
                )
            })?;
            Ok(Reference::ArrayElement { array, index })
        }
        ValueKind::NativeObject => {
            let vtable = vtable_of(target).expect("native cell");
            match vtable.ops.index {
                Some(slot) => slot(env, target, key),
                None => Err(unsupported(env, &vtable.name, "[]")),
            }
        }
        other => Err(env.throw_message(
            exception::TYPE_ERROR,
            format!("cannot index a value of type {}", other.name()),
        )),
    }
}

/// Negative positions count back from the end.
fn normalize_index(position: i64, len: usize) -> Option<usize> {
    let len = len as i64;
    let resolved = if position < 0 { len + position } else { position };
    if (0..len).contains(&resolved) {
        Some(resolved as usize)
    } else {
        None
    }
}

/// `a.k` / `a::k` / `a->k` and `a[k]` in value position: read-only
/// selection.
pub fn select(env: &mut Environment, target: &Value, key: &Value) -> EvalResult<Value> {
    match target.kind() {
        ValueKind::String => {
            // Integer position first, then the string method table.
            if let Some(position) = key.as_integer() {
                let text = target.as_str().unwrap();
                let len = text.chars().count();
                let index = normalize_index(position, len).ok_or_else(|| {
                    env.throw_message(
                        exception::INDEX_ERROR,
                        format!("index {} out of bounds (length {})", position, len),
                    )
                })?;
                let ch: String = text.chars().skip(index).take(1).collect();
                return Ok(Value::from(env.intern(&ch)));
            }
            Ok(env.string_vtable().get(key))
        }
        ValueKind::Array => {
            if let Some(position) = key.as_integer() {
                let array = target.array_handle().unwrap();
                let index = normalize_index(position, array.len()).ok_or_else(|| {
                    env.throw_message(
                        exception::INDEX_ERROR,
                        format!("index {} out of bounds (length {})", position, array.len()),
                    )
                })?;
                return Ok(array.get(index).unwrap_or_else(Value::null));
            }
            Ok(env.array_vtable().get(key))
        }
        ValueKind::Table => Ok(target.table_handle().unwrap().get(key)),
        ValueKind::NativeObject => {
            let native = target.native_handle().expect("native cell");
            let vtable = native.vtable();
            if let Some(slot) = vtable.ops.select {
                return slot(env, target, key);
            }
            // Fall back to the v-table's name table.
            if let Some(name) = key.string_handle() {
                if let Some(value) = vtable.lookup(&name) {
                    return Ok(value);
                }
            }
            Ok(Value::null())
        }
        other => Err(env.throw_message(
            exception::TYPE_ERROR,
            format!("cannot select from a value of type {}", other.name()),
        )),
    }
}

/// `a[i:j]`: substring or array view. Negative ends count from the
/// length; reversed bounds are swapped; the normalized range is inclusive
/// of both ends and must lie inside the value.
pub fn ranged_select(
    env: &mut Environment,
    target: &Value,
    from: &Value,
    to: &Value,
) -> EvalResult<Value> {
    if target.kind() == ValueKind::NativeObject {
        let vtable = vtable_of(target).expect("native cell");
        return match vtable.ops.ranged_select {
            Some(slot) => slot(env, target, from, to),
            None => Err(unsupported(env, &vtable.name, "[:]")),
        };
    }

    let len = match target.kind() {
        ValueKind::String => string_len(target).unwrap() as usize,
        ValueKind::Array => target.array_handle().unwrap().len(),
        other => {
            return Err(env.throw_message(
                exception::TYPE_ERROR,
                format!("cannot slice a value of type {}", other.name()),
            ));
        }
    };
    let (Some(from), Some(to)) = (from.as_integer(), to.as_integer()) else {
        return Err(env.throw_message(
            exception::TYPE_ERROR,
            "slice bounds must be integers",
        ));
    };

    let (Some(mut start), Some(mut end)) =
        (normalize_index(from, len), normalize_index(to, len))
    else {
        return Err(env.throw_message(
            exception::INDEX_ERROR,
            format!("slice {}:{} out of bounds (length {})", from, to, len),
        ));
    };
    if start > end {
        std::mem::swap(&mut start, &mut end);
    }

    match target.kind() {
        ValueKind::String => {
            let text: String = target
                .as_str()
                .unwrap()
                .chars()
                .skip(start)
                .take(end - start + 1)
                .collect();
            Ok(Value::from(env.intern(&text)))
        }
        ValueKind::Array => {
            let array = target.array_handle().unwrap();
            Ok(Value::from(array.view(start, end - start + 1)))
        }
        _ => unreachable!("length computed above"),
    }
}

// ----------------------------------------------------------------------
// Calls and construction
// ----------------------------------------------------------------------

/// Invoke a native object through its call slot.
pub fn call_native(env: &mut Environment, target: &Value, args: &[Value]) -> EvalResult<Value> {
    let vtable = vtable_of(target).expect("native cell");
    let Some(slot) = vtable.ops.call else {
        return Err(unsupported(env, &vtable.name, "()"));
    };
    env.set_args(args);
    let result = slot(env, target);
    env.clear_args();
    result
}

/// `new T(args)`: forwarded to the construct slot of a native object.
pub fn construct(env: &mut Environment, target: &Value, args: &[Value]) -> EvalResult<Value> {
    match target.kind() {
        ValueKind::NativeObject => {
            let vtable = vtable_of(target).expect("native cell");
            let Some(slot) = vtable.ops.construct else {
                return Err(unsupported(env, &vtable.name, "new"));
            };
            env.set_args(args);
            let result = slot(env, target);
            env.clear_args();
            result
        }
        other => Err(env.throw_message(
            exception::TYPE_ERROR,
            format!("cannot construct a value of type {}", other.name()),
        )),
    }
}

// ----------------------------------------------------------------------
// Compound assignment, increments
// ----------------------------------------------------------------------

pub fn binary(env: &mut Environment, op: BinaryOp, lhs: &Value, rhs: &Value) -> EvalResult<Value> {
    match op {
        BinaryOp::Add => add(env, lhs, rhs),
        BinaryOp::Sub => sub(env, lhs, rhs),
        BinaryOp::Mul => mul(env, lhs, rhs),
        BinaryOp::Div => div(env, lhs, rhs),
        BinaryOp::Mod => modulus(env, lhs, rhs),
        BinaryOp::Pow => pow(env, lhs, rhs),
        BinaryOp::BitOr => bor(env, lhs, rhs),
        BinaryOp::BitXor => bxor(env, lhs, rhs),
        BinaryOp::BitAnd => band(env, lhs, rhs),
        BinaryOp::Shl => shl(env, lhs, rhs),
        BinaryOp::Shr => shr(env, lhs, rhs),
    }
}

fn assign_slot(vtable: &VirtualTable, op: BinaryOp) -> Option<crate::native::AssignSlot> {
    match op {
        BinaryOp::Add => vtable.ops.add_assign,
        BinaryOp::Sub => vtable.ops.sub_assign,
        BinaryOp::Mul => vtable.ops.mul_assign,
        BinaryOp::Div => vtable.ops.div_assign,
        BinaryOp::Mod => vtable.ops.mod_assign,
        BinaryOp::Pow => vtable.ops.pow_assign,
        BinaryOp::BitOr => vtable.ops.bor_assign,
        BinaryOp::BitXor => vtable.ops.bxor_assign,
        BinaryOp::BitAnd => vtable.ops.band_assign,
        BinaryOp::Shl => vtable.ops.shl_assign,
        BinaryOp::Shr => vtable.ops.shr_assign,
    }
}

/// Apply a compound assignment through a reference. Arrays append in
/// place for `+=`; native objects dispatch their in-place slot; everything
/// else reads, applies the base operator, and writes back.
pub fn apply_compound(
    env: &mut Environment,
    op: BinaryOp,
    target: &Reference,
    rhs: &Value,
) -> EvalResult<()> {
    let current = target.read(env)?;

    if op == BinaryOp::Add && current.kind() == ValueKind::Array {
        let array = current.array_handle().expect("array cell");
        if !array.push(rhs.clone()) {
            return Err(env.throw_message(
                exception::TYPE_ERROR,
                "cannot grow an array view",
            ));
        }
        return Ok(());
    }

    if current.kind() == ValueKind::NativeObject {
        let vtable = vtable_of(&current).expect("native cell");
        if let Some(slot) = assign_slot(&vtable, op) {
            return slot(env, &current, rhs);
        }
    }

    let updated = binary(env, op, &current, rhs)?;
    target.write(env, updated)
}

/// Pre/post increment and decrement through a reference. Returns the
/// value the expression yields (old value for postfix, new for prefix).
pub fn step(
    env: &mut Environment,
    target: &Reference,
    delta: i64,
    prefix: bool,
) -> EvalResult<Value> {
    let current = target.read(env)?;

    if current.kind() == ValueKind::NativeObject {
        let vtable = vtable_of(&current).expect("native cell");
        let slot = match (delta > 0, prefix) {
            (true, true) => vtable.ops.pre_increment,
            (true, false) => vtable.ops.post_increment,
            (false, true) => vtable.ops.pre_decrement,
            (false, false) => vtable.ops.post_decrement,
        };
        if let Some(slot) = slot {
            return slot(env, &current);
        }
        let op = if delta > 0 { "++" } else { "--" };
        return Err(unsupported(env, &vtable.name, op));
    }

    let updated = match current.kind() {
        ValueKind::Integer => Value::integer(current.as_integer().unwrap().wrapping_add(delta)),
        ValueKind::Number => Value::number(current.as_number().unwrap() + delta as f64),
        _ => {
            let op = if delta > 0 { "++" } else { "--" };
            return Err(unary_type_error(env, op, &current));
        }
    };
    target.write(env, updated.clone())?;
    Ok(if prefix { updated } else { current })
}

/// Plain assignment through a reference; a native object holding an
/// assign overload intercepts the write.
pub fn assign(env: &mut Environment, target: &Reference, value: Value) -> EvalResult<()> {
    let current = target.read(env)?;
    if current.kind() == ValueKind::NativeObject {
        let vtable = vtable_of(&current).expect("native cell");
        if let Some(slot) = vtable.ops.assign {
            return slot(env, &current, &value);
        }
    }
    target.write(env, value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::ProviderKind;

    fn env() -> Box<Environment> {
        Environment::new(ProviderKind::Interpreter)
    }

    #[test]
    fn test_integer_arithmetic_stays_integer() {
        let mut env = env();
        let v = add(&mut env, &Value::integer(2), &Value::integer(3)).unwrap();
        assert_eq!(v, Value::integer(5));
        let v = mul(&mut env, &Value::integer(3), &Value::integer(4)).unwrap();
        assert_eq!(v, Value::integer(12));
    }

    #[test]
    fn test_division_always_number() {
        let mut env = env();
        let v = div(&mut env, &Value::integer(7), &Value::integer(2)).unwrap();
        assert_eq!(v.as_number(), Some(3.5));
    }

    #[test]
    fn test_mixed_arithmetic_widens() {
        let mut env = env();
        let v = add(&mut env, &Value::integer(1), &Value::number(0.5)).unwrap();
        assert_eq!(v.as_number(), Some(1.5));
    }

    #[test]
    fn test_string_concat_coerces() {
        let mut env = env();
        let s = Value::from(env.intern("n="));
        let v = add(&mut env, &s, &Value::integer(5)).unwrap();
        assert_eq!(v.as_str(), Some("n=5"));

        // Dispatch on the left still concatenates when the right is the
        // string.
        let s = Value::from(env.intern("!"));
        let v = add(&mut env, &Value::integer(5), &s).unwrap();
        assert_eq!(v.as_str(), Some("5!"));
    }

    #[test]
    fn test_string_repeat() {
        let mut env = env();
        let s = Value::from(env.intern("ab"));
        let v = mul(&mut env, &s, &Value::integer(3)).unwrap();
        assert_eq!(v.as_str(), Some("ababab"));
    }

    #[test]
    fn test_add_unsupported_raises() {
        let mut env = env();
        let t = Value::from(crate::table::GirderTable::new());
        assert!(add(&mut env, &t, &Value::integer(1)).is_err());
        assert!(env.is_unwinding());
    }

    #[test]
    fn test_equality_matrix() {
        let mut env = env();
        assert_eq!(
            eq(&mut env, &Value::integer(5), &Value::integer(5)).unwrap(),
            Value::boolean(true)
        );
        // Tags must match.
        assert_eq!(
            eq(&mut env, &Value::integer(5), &Value::number(5.0)).unwrap(),
            Value::boolean(false)
        );
        let a = Value::from(env.intern("x"));
        let b = Value::from(env.intern("x"));
        assert_eq!(eq(&mut env, &a, &b).unwrap(), Value::boolean(true));

        let t1 = Value::from(crate::table::GirderTable::new());
        let t2 = Value::from(crate::table::GirderTable::new());
        assert_eq!(eq(&mut env, &t1, &t1.clone()).unwrap(), Value::boolean(true));
        assert_eq!(eq(&mut env, &t1, &t2).unwrap(), Value::boolean(false));
    }

    #[test]
    fn test_string_length_comparison() {
        let mut env = env();
        let s = Value::from(env.intern("abc"));
        assert_eq!(
            lt(&mut env, &s, &Value::integer(5)).unwrap(),
            Value::boolean(true)
        );
        assert_eq!(
            gt(&mut env, &Value::integer(5), &s).unwrap(),
            Value::boolean(true)
        );
    }

    #[test]
    fn test_length_operator() {
        let mut env = env();
        let s = Value::from(env.intern("four"));
        assert_eq!(length(&mut env, &s).unwrap(), Value::integer(4));

        let a = Value::from(GirderArray::managed(vec![
            Value::integer(10),
            Value::integer(20),
            Value::integer(30),
        ]));
        assert_eq!(length(&mut env, &a).unwrap(), Value::integer(3));

        // Others return self.
        assert_eq!(length(&mut env, &Value::integer(9)).unwrap(), Value::integer(9));
    }

    #[test]
    fn test_table_selection() {
        let mut env = env();
        let table = GirderTable::new();
        let key = Value::from(env.intern("k"));
        table.set(key.clone(), Value::integer(1));
        let t = Value::from(table);
        assert_eq!(select(&mut env, &t, &key).unwrap(), Value::integer(1));
        let missing = Value::from(env.intern("missing"));
        assert!(select(&mut env, &t, &missing).unwrap().is_null());
    }

    #[test]
    fn test_string_selection_by_position() {
        let mut env = env();
        let s = Value::from(env.intern("abc"));
        let v = select(&mut env, &s, &Value::integer(1)).unwrap();
        assert_eq!(v.as_str(), Some("b"));
        let v = select(&mut env, &s, &Value::integer(-1)).unwrap();
        assert_eq!(v.as_str(), Some("c"));
    }

    #[test]
    fn test_ranged_select_string() {
        let mut env = env();
        let s = Value::from(env.intern("girder"));
        let v = ranged_select(&mut env, &s, &Value::integer(1), &Value::integer(3)).unwrap();
        assert_eq!(v.as_str(), Some("ird"));

        // Negative indices count from the end; reversed bounds swap.
        let v = ranged_select(&mut env, &s, &Value::integer(-1), &Value::integer(-3)).unwrap();
        assert_eq!(v.as_str(), Some("der"));
    }

    #[test]
    fn test_ranged_select_array_view() {
        let mut env = env();
        let a = Value::from(GirderArray::managed(
            (0..6).map(Value::integer).collect(),
        ));
        let v = ranged_select(&mut env, &a, &Value::integer(1), &Value::integer(3)).unwrap();
        let view = v.array_handle().unwrap();
        assert!(view.is_view());
        assert_eq!(view.len(), 3);
        assert_eq!(view.get(0), Some(Value::integer(1)));
    }

    #[test]
    fn test_index_out_of_bounds_raises() {
        let mut env = env();
        let a = Value::from(GirderArray::managed(vec![Value::integer(1)]));
        assert!(index(&mut env, &a, &Value::integer(3)).is_err());
    }

    #[test]
    fn test_compound_add_on_array_mutates() {
        let mut env = env();
        let table = GirderTable::new();
        let key = Value::from(env.intern("a"));
        let array = GirderArray::managed(vec![Value::integer(1)]);
        table.set(key.clone(), Value::from(array.clone()));

        let target = Reference::TableEntry {
            table: table.clone(),
            key,
        };
        apply_compound(&mut env, BinaryOp::Add, &target, &Value::integer(2)).unwrap();
        assert_eq!(array.len(), 2);
        assert_eq!(array.get(1), Some(Value::integer(2)));
    }

    #[test]
    fn test_step_prefix_postfix() {
        let mut env = env();
        let table = GirderTable::new();
        let key = Value::from(env.intern("x"));
        table.set(key.clone(), Value::integer(5));
        let target = Reference::TableEntry { table, key };

        assert_eq!(step(&mut env, &target, 1, false).unwrap(), Value::integer(5));
        assert_eq!(step(&mut env, &target, 1, true).unwrap(), Value::integer(7));
        assert_eq!(step(&mut env, &target, -1, true).unwrap(), Value::integer(6));
    }

    #[test]
    fn test_bitwise_on_integer() {
        let mut env = env();
        assert_eq!(
            bor(&mut env, &Value::integer(0b0101), &Value::integer(0b0011)).unwrap(),
            Value::integer(0b0111)
        );
        assert_eq!(
            shl(&mut env, &Value::integer(1), &Value::integer(4)).unwrap(),
            Value::integer(16)
        );
    }
}
