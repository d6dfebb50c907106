//! Array Method Table
//!
//! Selection on an array with a non-integer key consults this table.
//! Length-changing methods refuse views; `Sort` orders integers, numbers,
//! or strings and raises on mixed contents.

use crate::array::GirderArray;
use crate::environment::Environment;
use crate::error::{EvalResult, exception};
use crate::value::{Value, ValueKind};

pub(super) fn load(env: &mut Environment) {
    let methods: &[(&str, crate::environment::NativeFunction)] = &[
        ("Size", size),
        ("PushBack", push_back),
        ("PopBack", pop_back),
        ("Contains", contains),
        ("IndexOf", index_of),
        ("Join", join),
        ("Reverse", reverse),
        ("Sort", sort),
    ];
    for &(name, function) in methods {
        let callable = env.bind_library(function, name);
        let key = Value::from(env.intern(name));
        env.array_vtable().set(key, callable.as_value());
    }
}

fn receiver(env: &mut Environment, args: &[Value], method: &str) -> EvalResult<GirderArray> {
    match args.first().and_then(Value::array_handle) {
        Some(array) => Ok(array),
        None => Err(env.throw_message(
            exception::TYPE_ERROR,
            format!("{} expects an array receiver", method),
        )),
    }
}

fn size(env: &mut Environment, args: &[Value]) -> EvalResult<Value> {
    let array = receiver(env, args, "Size")?;
    Ok(Value::integer(array.len() as i64))
}

fn push_back(env: &mut Environment, args: &[Value]) -> EvalResult<Value> {
    let array = receiver(env, args, "PushBack")?;
    let value = args.get(1).cloned().unwrap_or_else(Value::null);
    if !array.push(value) {
        return Err(env.throw_message(exception::TYPE_ERROR, "cannot grow an array view"));
    }
    Ok(Value::null())
}

fn pop_back(env: &mut Environment, args: &[Value]) -> EvalResult<Value> {
    let array = receiver(env, args, "PopBack")?;
    if array.is_view() {
        return Err(env.throw_message(exception::TYPE_ERROR, "cannot shrink an array view"));
    }
    Ok(array.pop().unwrap_or_else(Value::null))
}

fn contains(env: &mut Environment, args: &[Value]) -> EvalResult<Value> {
    let array = receiver(env, args, "Contains")?;
    let needle = args.get(1).cloned().unwrap_or_else(Value::null);
    let found = (0..array.len()).any(|i| array.get(i).as_ref() == Some(&needle));
    Ok(Value::boolean(found))
}

fn index_of(env: &mut Environment, args: &[Value]) -> EvalResult<Value> {
    let array = receiver(env, args, "IndexOf")?;
    let needle = args.get(1).cloned().unwrap_or_else(Value::null);
    for i in 0..array.len() {
        if array.get(i).as_ref() == Some(&needle) {
            return Ok(Value::integer(i as i64));
        }
    }
    Ok(Value::integer(-1))
}

fn join(env: &mut Environment, args: &[Value]) -> EvalResult<Value> {
    let array = receiver(env, args, "Join")?;
    let separator = args
        .get(1)
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    let joined = array
        .to_vec()
        .iter()
        .map(Value::to_display_string)
        .collect::<Vec<_>>()
        .join(&separator);
    Ok(Value::from(env.intern(&joined)))
}

fn reverse(env: &mut Environment, args: &[Value]) -> EvalResult<Value> {
    let array = receiver(env, args, "Reverse")?;
    let mut elements = array.to_vec();
    elements.reverse();
    if array.is_view() {
        // Element writes through a view are fine; only growth is not.
        for (i, value) in elements.into_iter().enumerate() {
            array.set(i, value);
        }
    } else {
        array.replace(elements);
    }
    Ok(Value::null())
}

fn sort(env: &mut Environment, args: &[Value]) -> EvalResult<Value> {
    let array = receiver(env, args, "Sort")?;
    let elements = array.to_vec();

    let uniform = elements
        .first()
        .map(|first| elements.iter().all(|v| v.kind() == first.kind()))
        .unwrap_or(true);
    let sortable = elements.first().map_or(true, |first| {
        matches!(
            first.kind(),
            ValueKind::Integer | ValueKind::Number | ValueKind::String
        )
    });
    if !uniform || !sortable {
        return Err(env.throw_message(
            exception::TYPE_ERROR,
            "Sort expects integers, numbers, or strings of one type",
        ));
    }

    let mut elements = elements;
    match elements.first().map(Value::kind) {
        Some(ValueKind::Integer) => {
            elements.sort_by_key(|v| v.as_integer().expect("uniform integers"));
        }
        Some(ValueKind::Number) => {
            elements.sort_by(|a, b| {
                a.as_number()
                    .expect("uniform numbers")
                    .total_cmp(&b.as_number().expect("uniform numbers"))
            });
        }
        Some(ValueKind::String) => {
            elements.sort_by(|a, b| {
                a.as_str()
                    .expect("uniform strings")
                    .cmp(b.as_str().expect("uniform strings"))
            });
        }
        _ => {}
    }

    if array.is_view() {
        for (i, value) in elements.into_iter().enumerate() {
            array.set(i, value);
        }
    } else {
        array.replace(elements);
    }
    Ok(Value::null())
}

#[cfg(test)]
mod tests {
    use crate::environment::{Environment, ProviderKind};
    use crate::value::Value;
    use std::collections::HashMap;

    fn run(source: &str) -> Value {
        let mut env = Environment::new(ProviderKind::Interpreter);
        let callable = env.compile_source(source, "test", HashMap::new()).unwrap();
        env.call(&callable, &[]).unwrap()
    }

    fn run_err(source: &str) -> crate::error::RuntimeError {
        let mut env = Environment::new(ProviderKind::Interpreter);
        let callable = env.compile_source(source, "test", HashMap::new()).unwrap();
        env.call(&callable, &[]).unwrap_err()
    }

    #[test]
    fn test_size_and_push_pop() {
        assert_eq!(run("return [1,2].Size();"), Value::integer(2));
        assert_eq!(
            run("local a = [1]; a.PushBack(9); return a[1];"),
            Value::integer(9)
        );
        assert_eq!(run("local a = [1, 2]; return a.PopBack();"), Value::integer(2));
    }

    #[test]
    fn test_contains_index_of() {
        assert_eq!(run("return [1,2,3].Contains(2);"), Value::boolean(true));
        assert_eq!(run("return [1,2,3].IndexOf(3);"), Value::integer(2));
        assert_eq!(run("return [1,2,3].IndexOf(9);"), Value::integer(-1));
    }

    #[test]
    fn test_join_and_reverse() {
        assert_eq!(run("return [1,2,3].Join(\"-\");").as_str(), Some("1-2-3"));
        assert_eq!(
            run("local a = [1,2,3]; a.Reverse(); return a.Join(\"\");").as_str(),
            Some("321")
        );
    }

    #[test]
    fn test_sort_orders_uniform_types() {
        assert_eq!(run("local a = [3,1,2]; a.Sort(); return a.Join(\"\");").as_str(), Some("123"));
        assert_eq!(
            run("local a = [\"b\",\"a\"]; a.Sort(); return a.Join(\"\");").as_str(),
            Some("ab")
        );
    }

    #[test]
    fn test_sort_rejects_mixed() {
        let error = run_err("local a = [1, \"x\"]; a.Sort();");
        assert_eq!(error.kind, "TypeError");
    }

    #[test]
    fn test_view_growth_rejected() {
        let error = run_err("local a = [1,2,3]; local v = a[0:1]; v.PushBack(4);");
        assert_eq!(error.kind, "TypeError");
    }
}
