//! Standard Library
//!
//! Loaded into every environment at creation. Four pieces:
//!
//! - general globals (`PrintLn`, `Print`, `Input`, `Include`, `TypeOf`,
//!   `throw`)
//! - the string method table consulted by selection on strings
//! - the array method table consulted by selection on arrays
//! - the `Regex` and `Json` native classes
//!
//! Every function is a bound native callable with Library origin; methods
//! receive their receiver as the first argument (dot-call convention).

mod array_base;
mod json;
mod regex;
mod string_base;

use crate::environment::Environment;
use crate::error::{EvalResult, exception};
use crate::value::Value;
use std::io::Write;

pub(crate) fn load(env: &mut Environment) {
    general(env);
    string_base::load(env);
    array_base::load(env);
    regex::load(env);
    json::load(env);
}

fn general(env: &mut Environment) {
    let functions: &[(&str, crate::environment::NativeFunction)] = &[
        ("PrintLn", println_fn),
        ("Print", print_fn),
        ("Input", input_fn),
        ("Include", include_fn),
        ("TypeOf", typeof_fn),
        ("throw", throw_fn),
    ];
    for &(name, function) in functions {
        let callable = env.bind_library(function, name);
        env.set_global(name, callable.as_value());
    }
}

fn println_fn(env: &mut Environment, args: &[Value]) -> EvalResult<Value> {
    let text = render(args);
    let result = writeln!(env.output(), "{}", text);
    if let Err(e) = result {
        return Err(env.throw_message(exception::TYPE_ERROR, format!("output failed: {}", e)));
    }
    Ok(Value::null())
}

fn print_fn(env: &mut Environment, args: &[Value]) -> EvalResult<Value> {
    let text = render(args);
    let result = write!(env.output(), "{}", text);
    if let Err(e) = result {
        return Err(env.throw_message(exception::TYPE_ERROR, format!("output failed: {}", e)));
    }
    Ok(Value::null())
}

fn render(args: &[Value]) -> String {
    args.iter()
        .map(Value::to_display_string)
        .collect::<Vec<_>>()
        .join("")
}

fn input_fn(env: &mut Environment, _args: &[Value]) -> EvalResult<Value> {
    let mut line = String::new();
    let result = env.input().read_line(&mut line);
    match result {
        Ok(_) => {
            let trimmed = line.trim_end_matches(['\n', '\r']).to_string();
            Ok(Value::from(env.intern(&trimmed)))
        }
        Err(e) => Err(env.throw_message(exception::TYPE_ERROR, format!("input failed: {}", e))),
    }
}

/// Compile and run another file in this environment; returns its result.
fn include_fn(env: &mut Environment, args: &[Value]) -> EvalResult<Value> {
    let Some(path) = args.first().and_then(Value::as_str) else {
        return Err(env.throw_message(exception::TYPE_ERROR, "Include expects a path string"));
    };
    let path = path.to_string();
    let callable = match env.compile_file(&path, &path, Default::default()) {
        Ok(callable) => callable,
        Err(e) => {
            return Err(env.throw_message(
                exception::TYPE_ERROR,
                format!("Include failed: {}", e),
            ));
        }
    };
    env.invoke(callable.id(), &[])
}

fn typeof_fn(env: &mut Environment, args: &[Value]) -> EvalResult<Value> {
    let value = args.first().cloned().unwrap_or_else(Value::null);
    Ok(crate::object::type_of(env, &value))
}

/// Script-level `throw(type, payload)`.
fn throw_fn(env: &mut Environment, args: &[Value]) -> EvalResult<Value> {
    let kind = args
        .first()
        .and_then(Value::as_str)
        .unwrap_or(exception::NONE)
        .to_string();
    let payload = args.get(1).cloned().unwrap_or_else(Value::null);
    Err(env.throw(&kind, payload))
}

#[cfg(test)]
mod tests {
    use crate::environment::{Environment, ProviderKind};
    use crate::value::Value;
    use std::collections::HashMap;
    use std::io::Write;
    use std::sync::{Arc, Mutex};

    /// Shared sink for capturing script output.
    #[derive(Clone, Default)]
    struct Sink(Arc<Mutex<Vec<u8>>>);

    impl Write for Sink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn run(source: &str) -> Value {
        let mut env = Environment::new(ProviderKind::Interpreter);
        let callable = env.compile_source(source, "test", HashMap::new()).unwrap();
        env.call(&callable, &[]).unwrap()
    }

    #[test]
    fn test_println_writes_to_output_stream() {
        let sink = Sink::default();
        let mut env = Environment::new(ProviderKind::Interpreter);
        env.set_output(Box::new(sink.clone()));
        let callable = env
            .compile_source("PrintLn(\"n=\", 5);", "test", HashMap::new())
            .unwrap();
        env.call(&callable, &[]).unwrap();
        assert_eq!(String::from_utf8(sink.0.lock().unwrap().clone()).unwrap(), "n=5\n");
    }

    #[test]
    fn test_typeof_global() {
        assert_eq!(run("return TypeOf(3);").as_str(), Some("integer"));
        assert_eq!(run("return typeof 3;").as_str(), Some("integer"));
    }

    #[test]
    fn test_throw_carries_type_and_payload() {
        let mut env = Environment::new(ProviderKind::Interpreter);
        let callable = env
            .compile_source("throw(\"E\", \"msg\");", "test", HashMap::new())
            .unwrap();
        let error = env.call(&callable, &[]).unwrap_err();
        assert_eq!(error.kind, "E");
        assert_eq!(error.payload.as_str(), Some("msg"));
    }

    #[test]
    fn test_include_runs_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lib.gdr");
        std::fs::write(&path, "shared = 41;").unwrap();

        let mut env = Environment::new(ProviderKind::Interpreter);
        let source = format!("Include(\"{}\"); return shared + 1;", path.display());
        let callable = env.compile_source(&source, "test", HashMap::new()).unwrap();
        assert_eq!(env.call(&callable, &[]).unwrap(), Value::integer(42));
    }
}
