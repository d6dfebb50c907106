//! Regex Native Class
//!
//! `new Regex(pattern)` compiles a pattern into a native object whose
//! payload is the compiled engine; instances answer `Matches`, `Find`,
//! `FindAll`, and `Replace` through the class v-table. An invalid pattern
//! raises `RegexError`.

use crate::array::GirderArray;
use crate::environment::Environment;
use crate::error::{EvalResult, exception};
use crate::native::{GirderNative, OperatorTable, VirtualTable};
use crate::value::Value;

pub(super) fn load(env: &mut Environment) {
    let ops = OperatorTable {
        construct: Some(construct),
        ..OperatorTable::default()
    };
    let vtable = VirtualTable::with_ops("Regex", ops);
    let methods: &[(&str, crate::environment::NativeFunction)] = &[
        ("Matches", matches),
        ("Find", find),
        ("FindAll", find_all),
        ("Replace", replace),
    ];
    let bound: Vec<(String, crate::environment::Callable)> = methods
        .iter()
        .map(|&(name, function)| (name.to_string(), env.bind_library(function, name)))
        .collect();
    for (name, callable) in bound {
        let key = env.intern(&name);
        vtable.define(key, callable.as_value());
    }
    env.register_native_class("Regex", vtable);
}

/// `new Regex(pattern)`.
fn construct(env: &mut Environment, class: &Value) -> EvalResult<Value> {
    let args = env.args();
    let Some(pattern) = args.first().and_then(Value::as_str) else {
        return Err(env.throw_message(
            exception::TYPE_ERROR,
            "Regex expects a pattern string",
        ));
    };
    let compiled = match regex::Regex::new(pattern) {
        Ok(compiled) => compiled,
        Err(e) => {
            return Err(
                env.throw_message(exception::REGEX_ERROR, format!("invalid pattern: {}", e))
            );
        }
    };
    let vtable = class
        .native_handle()
        .expect("construct dispatches on a native object")
        .vtable();
    Ok(Value::from(GirderNative::new(vtable, Box::new(compiled))))
}

/// Instance payload access for methods.
fn engine<R>(
    env: &mut Environment,
    args: &[Value],
    method: &str,
    f: impl FnOnce(&regex::Regex) -> R,
) -> EvalResult<R> {
    let result = args
        .first()
        .and_then(Value::native_handle)
        .and_then(|native| native.with_payload::<regex::Regex, R>(f));
    match result {
        Some(result) => Ok(result),
        None => Err(env.throw_message(
            exception::TYPE_ERROR,
            format!("{} expects a Regex receiver", method),
        )),
    }
}

fn subject(env: &mut Environment, args: &[Value], method: &str) -> EvalResult<String> {
    match args.get(1).and_then(Value::as_str) {
        Some(text) => Ok(text.to_string()),
        None => Err(env.throw_message(
            exception::TYPE_ERROR,
            format!("{} expects a subject string", method),
        )),
    }
}

/// Whole-subject match.
fn matches(env: &mut Environment, args: &[Value]) -> EvalResult<Value> {
    let text = subject(env, args, "Matches")?;
    let matched = engine(env, args, "Matches", |r| {
        r.find(&text)
            .is_some_and(|m| m.start() == 0 && m.end() == text.len())
    })?;
    Ok(Value::boolean(matched))
}

/// First match, or null.
fn find(env: &mut Environment, args: &[Value]) -> EvalResult<Value> {
    let text = subject(env, args, "Find")?;
    let found = engine(env, args, "Find", |r| {
        r.find(&text).map(|m| m.as_str().to_string())
    })?;
    match found {
        Some(found) => Ok(Value::from(env.intern(&found))),
        None => Ok(Value::null()),
    }
}

/// Every match, as an array of strings.
fn find_all(env: &mut Environment, args: &[Value]) -> EvalResult<Value> {
    let text = subject(env, args, "FindAll")?;
    let found: Vec<String> = engine(env, args, "FindAll", |r| {
        r.find_iter(&text).map(|m| m.as_str().to_string()).collect()
    })?;
    let mut matches = Vec::with_capacity(found.len());
    for text in found {
        let cell = env.intern(&text);
        matches.push(Value::from(cell));
    }
    Ok(Value::from(GirderArray::managed(matches)))
}

/// Replace every match.
fn replace(env: &mut Environment, args: &[Value]) -> EvalResult<Value> {
    let text = subject(env, args, "Replace")?;
    let Some(replacement) = args.get(2).and_then(Value::as_str).map(str::to_string) else {
        return Err(env.throw_message(
            exception::TYPE_ERROR,
            "Replace expects a replacement string",
        ));
    };
    let replaced = engine(env, args, "Replace", |r| {
        r.replace_all(&text, replacement.as_str()).into_owned()
    })?;
    Ok(Value::from(env.intern(&replaced)))
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
    fn test_construct_and_match() {
        assert_eq!(
            run("local r = new Regex(\"[0-9]+\"); return r.Matches(\"123\");"),
            Value::boolean(true)
        );
        assert_eq!(
            run("local r = new Regex(\"[0-9]+\"); return r.Matches(\"12x\");"),
            Value::boolean(false)
        );
    }

    #[test]
    fn test_find_and_find_all() {
        assert_eq!(
            run("local r = new Regex(\"[0-9]+\"); return r.Find(\"a12b345\");").as_str(),
            Some("12")
        );
        assert!(run("local r = new Regex(\"x\"); return r.Find(\"abc\");").is_null());
        assert_eq!(
            run("local r = new Regex(\"[0-9]+\"); return r.FindAll(\"a1b23\").Join(\",\");")
                .as_str(),
            Some("1,23")
        );
    }

    #[test]
    fn test_replace() {
        assert_eq!(
            run("local r = new Regex(\"[0-9]\"); return r.Replace(\"a1b2\", \"#\");").as_str(),
            Some("a#b#")
        );
    }

    #[test]
    fn test_invalid_pattern_raises() {
        let mut env = Environment::new(ProviderKind::Interpreter);
        let callable = env
            .compile_source("new Regex(\"(\");", "test", HashMap::new())
            .unwrap();
        let error = env.call(&callable, &[]).unwrap_err();
        assert_eq!(error.kind, "RegexError");
    }
}
