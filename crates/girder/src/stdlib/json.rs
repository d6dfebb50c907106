//! Json Native Class
//!
//! `Json.Parse(text)` maps a JSON document onto language values (objects
//! become tables, arrays become managed arrays); `Json.Stringify(value)`
//! goes the other way. Parse failures raise `JsonError`.

use crate::array::GirderArray;
use crate::environment::Environment;
use crate::error::{EvalResult, Unwind, exception};
use crate::native::VirtualTable;
use crate::table::GirderTable;
use crate::value::{Value, ValueKind};

pub(super) fn load(env: &mut Environment) {
    let vtable = VirtualTable::new("Json");
    let methods: &[(&str, crate::environment::NativeFunction)] =
        &[("Parse", parse), ("Stringify", stringify)];
    let bound: Vec<(String, crate::environment::Callable)> = methods
        .iter()
        .map(|&(name, function)| (name.to_string(), env.bind_library(function, name)))
        .collect();
    for (name, callable) in bound {
        let key = env.intern(&name);
        vtable.define(key, callable.as_value());
    }
    env.register_native_class("Json", vtable);
}

fn parse(env: &mut Environment, args: &[Value]) -> EvalResult<Value> {
    // args[0] is the class object (dot-call receiver).
    let Some(text) = args.get(1).and_then(Value::as_str) else {
        return Err(env.throw_message(exception::TYPE_ERROR, "Parse expects a JSON string"));
    };
    let document: serde_json::Value = match serde_json::from_str(text) {
        Ok(document) => document,
        Err(e) => {
            return Err(env.throw_message(exception::JSON_ERROR, format!("parse failed: {}", e)));
        }
    };
    Ok(from_json(env, &document))
}

fn from_json(env: &mut Environment, document: &serde_json::Value) -> Value {
    match document {
        serde_json::Value::Null => Value::null(),
        serde_json::Value::Bool(b) => Value::boolean(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::integer(i)
            } else {
                Value::number(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        serde_json::Value::String(s) => Value::from(env.intern(s)),
        serde_json::Value::Array(elements) => {
            let values = elements.iter().map(|e| from_json(env, e)).collect();
            Value::from(GirderArray::managed(values))
        }
        serde_json::Value::Object(entries) => {
            let table = GirderTable::new();
            for (key, value) in entries {
                let key = Value::from(env.intern(key));
                let value = from_json(env, value);
                table.set(key, value);
            }
            Value::from(table)
        }
    }
}

fn stringify(env: &mut Environment, args: &[Value]) -> EvalResult<Value> {
    let value = args.get(1).cloned().unwrap_or_else(Value::null);
    let document = to_json(env, &value)?;
    match serde_json::to_string(&document) {
        Ok(text) => Ok(Value::from(env.intern(&text))),
        Err(e) => Err(env.throw_message(exception::JSON_ERROR, format!("stringify failed: {}", e))),
    }
}

fn to_json(env: &mut Environment, value: &Value) -> Result<serde_json::Value, Unwind> {
    Ok(match value.kind() {
        ValueKind::Null => serde_json::Value::Null,
        ValueKind::Boolean => serde_json::Value::Bool(value.truthy()),
        ValueKind::Integer => {
            serde_json::Value::from(value.as_integer().expect("integer cell"))
        }
        ValueKind::Number => serde_json::Value::from(value.as_number().expect("number cell")),
        ValueKind::String => {
            serde_json::Value::String(value.as_str().expect("string cell").to_string())
        }
        ValueKind::Array => {
            let array = value.array_handle().expect("array cell");
            let mut elements = Vec::with_capacity(array.len());
            for element in array.to_vec() {
                elements.push(to_json(env, &element)?);
            }
            serde_json::Value::Array(elements)
        }
        ValueKind::Table => {
            let table = value.table_handle().expect("table cell");
            let mut entries = serde_json::Map::new();
            for key in table.keys() {
                let rendered = key.to_display_string();
                let entry = to_json(env, &table.get(&key))?;
                entries.insert(rendered, entry);
            }
            serde_json::Value::Object(entries)
        }
        ValueKind::Function | ValueKind::NativeObject => {
            return Err(env.throw_message(
                exception::JSON_ERROR,
                format!("cannot serialize a {} value", value.kind().name()),
            ));
        }
    })
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

    #[test]
    fn test_parse_object() {
        assert_eq!(
            run("local d = Json.Parse(\"{\\\"n\\\": 5}\"); return d[\"n\"];"),
            Value::integer(5)
        );
    }

    #[test]
    fn test_parse_array_and_scalars() {
        assert_eq!(
            run("local d = Json.Parse(\"[1, 2.5, true, null, \\\"s\\\"]\"); return #d;"),
            Value::integer(5)
        );
        assert_eq!(
            run("return Json.Parse(\"[1, 2.5]\")[1];").as_number(),
            Some(2.5)
        );
    }

    #[test]
    fn test_stringify_round_trip() {
        assert_eq!(
            run("return Json.Stringify([1, \"a\", false]);").as_str(),
            Some("[1,\"a\",false]")
        );
        assert_eq!(
            run("return Json.Parse(Json.Stringify({ n = 1 }))[\"n\"];"),
            Value::integer(1)
        );
    }

    #[test]
    fn test_parse_error_raises() {
        let mut env = Environment::new(ProviderKind::Interpreter);
        let callable = env
            .compile_source("Json.Parse(\"{oops\");", "test", HashMap::new())
            .unwrap();
        let error = env.call(&callable, &[]).unwrap_err();
        assert_eq!(error.kind, "JsonError");
    }
}
