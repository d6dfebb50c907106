//! End-to-end scenarios through the public API, interpreter provider.

use girder::{Environment, ProviderKind, Value};
use std::collections::HashMap;

fn run(source: &str) -> Value {
    let mut env = Environment::new(ProviderKind::Interpreter);
    let callable = env
        .compile_source(source, "scenario", HashMap::new())
        .expect("source compiles");
    env.call(&callable, &[]).expect("call succeeds")
}

#[test]
fn arithmetic() {
    assert_eq!(run("return 2 + 3 * 4;"), Value::integer(14));
}

#[test]
fn string_concat() {
    assert_eq!(run("return \"n=\" + 5;").as_str(), Some("n=5"));
}

#[test]
fn local_and_reassign() {
    assert_eq!(run("local x = 1; x += 2; return x;"), Value::integer(3));
}

#[test]
fn array_length() {
    assert_eq!(run("local a = [10,20,30]; return #a;"), Value::integer(3));
}

#[test]
fn table_dot_call() {
    let source = r#"
        local t = { greet = function(self, name) { return "hi " + name; } };
        return t.greet("bo");
    "#;
    assert_eq!(run(source).as_str(), Some("hi bo"));
}

#[test]
fn control_flow() {
    assert_eq!(
        run("local s = 0; for (local i = 1; i <= 3; i = i + 1) { s = s + i; } return s;"),
        Value::integer(6)
    );
}

#[test]
fn exception_surfaces_to_host() {
    let mut env = Environment::new(ProviderKind::Interpreter);
    let source = r#"
        function boom() { throw("E", "msg"); }
        boom();
    "#;
    let callable = env
        .compile_source(source, "scenario", HashMap::new())
        .expect("source compiles");
    let error = env.call(&callable, &[]).expect_err("call throws");

    assert_eq!(error.kind, "E");
    assert_eq!(error.payload.as_str(), Some("msg"));
    let script_frames: Vec<_> = error
        .trace
        .frames()
        .filter(|f| f.function == "boom")
        .collect();
    assert_eq!(script_frames.len(), 1);

    // The rendered failure leads with type and payload, then the trace.
    let rendered = error.to_string();
    assert!(rendered.starts_with("E: msg"));
    assert!(rendered.contains("boom"));

    // Recovery is complete: the environment is usable again.
    let callable = env
        .compile_source("return 1;", "after", HashMap::new())
        .unwrap();
    assert_eq!(env.call(&callable, &[]).unwrap(), Value::integer(1));
}

#[test]
fn arguments_reach_the_callable() {
    let mut env = Environment::new(ProviderKind::Interpreter);
    let source = r#"
        function pick(a, b) { return b; }
        return pick;
    "#;
    let program = env.compile_source(source, "scenario", HashMap::new()).unwrap();
    let function = env.call(&program, &[]).unwrap();
    let callable = girder::Callable::from_value(&function).expect("a function value");
    let result = env
        .call(&callable, &[Value::integer(1), Value::integer(2)])
        .unwrap();
    assert_eq!(result, Value::integer(2));
}
