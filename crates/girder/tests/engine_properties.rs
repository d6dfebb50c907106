//! Engine invariants and boundary properties through the public API.

use girder::{Environment, ProviderKind, Value};
use std::collections::HashMap;

fn run(source: &str) -> Value {
    let mut env = Environment::new(ProviderKind::Interpreter);
    let callable = env
        .compile_source(source, "property", HashMap::new())
        .expect("source compiles");
    env.call(&callable, &[]).expect("call succeeds")
}

#[test]
fn interning_coalesces_equal_content() {
    let mut env = Environment::new(ProviderKind::Interpreter);
    let a = env.intern("twice");
    let b = env.intern("twice");
    assert_eq!(a, b);
    assert_eq!(a.as_ptr(), b.as_ptr());
    // Content round-trips byte for byte.
    assert_eq!(a.as_bytes(), b"twice");
}

#[test]
fn refcounts_balance_after_evaluation() {
    let mut env = Environment::new(ProviderKind::Interpreter);
    let probe = env.intern("refcount probe payload");
    let base = probe.refcount();

    let source = r#"
        local s = "refcount probe payload";
        local t = { entry = s };
        local a = [s, s];
        local u = a[0];
        return 0;
    "#;
    let callable = env.compile_source(source, "property", HashMap::new()).unwrap();
    env.call(&callable, &[]).unwrap();

    // Every owning handle created during the call has been dropped.
    assert_eq!(probe.refcount(), base);
}

#[test]
fn locals_die_with_their_block() {
    let mut env = Environment::new(ProviderKind::Interpreter);
    let probe = env.intern("block local payload");
    let base = probe.refcount();

    let source = r#"
        local keep = 0;
        {
            local inner = "block local payload";
            keep = 1;
        }
        return keep;
    "#;
    let callable = env.compile_source(source, "property", HashMap::new()).unwrap();
    assert_eq!(env.call(&callable, &[]).unwrap(), Value::integer(1));
    assert_eq!(probe.refcount(), base);
}

#[test]
fn locals_die_on_early_exits() {
    let mut env = Environment::new(ProviderKind::Interpreter);
    let probe = env.intern("early exit payload");
    let base = probe.refcount();

    let source = r#"
        for (local i = 0; i < 3; i = i + 1) {
            local held = "early exit payload";
            if (i == 1) break;
            if (i == 0) continue;
        }
        function f() {
            local held = "early exit payload";
            return 7;
        }
        return f();
    "#;
    let callable = env.compile_source(source, "property", HashMap::new()).unwrap();
    assert_eq!(env.call(&callable, &[]).unwrap(), Value::integer(7));
    assert_eq!(probe.refcount(), base);
}

#[test]
fn view_indexing_matches_base() {
    // a[i:j][k] == a[i+k] across the whole window.
    let source = r#"
        local a = [10, 11, 12, 13, 14, 15];
        local v = a[2:4];
        local ok = 1;
        for (local k = 0; k < 3; k = k + 1) {
            if (v[k] != a[2 + k]) ok = 0;
        }
        return ok;
    "#;
    assert_eq!(run(source), Value::integer(1));
}

#[test]
fn additive_identities() {
    assert_eq!(run("return (5 + 0) == 5;"), Value::boolean(true));
    assert_eq!(run("return (2.5 + 0) == 2.5;"), Value::boolean(true));
    assert_eq!(run("return (\"s\" + \"\") == \"s\";"), Value::boolean(true));
}

#[test]
fn negative_slice_bounds_normalize_and_swap() {
    assert_eq!(run("return \"girder\"[-3:-1];").as_str(), Some("der"));
    assert_eq!(run("return \"girder\"[-1:-3];").as_str(), Some("der"));
    assert_eq!(run("return [1,2,3,4][-2:-1].Join(\"\");").as_str(), Some("34"));
}

#[test]
fn out_of_bounds_raises_not_crashes() {
    let mut env = Environment::new(ProviderKind::Interpreter);
    for source in [
        "local a = [1]; return a[3];",
        "local a = [1]; a[5] = 2;",
        "return \"ab\"[9];",
        "return [1,2][0:9];",
    ] {
        let callable = env.compile_source(source, "property", HashMap::new()).unwrap();
        let error = env.call(&callable, &[]).expect_err("raises");
        assert_eq!(error.kind, "IndexError", "source: {}", source);
    }
}

#[test]
fn handler_stack_capacity_is_bounded() {
    // Mutual host/script recursion nests a handler frame per call; the
    // 33rd nested call is itself a runtime error rather than a crash.
    fn reenter(env: &mut Environment, args: &[Value]) -> girder::EvalResult<Value> {
        let callable = girder::Callable::from_value(&args[0]).expect("function value");
        match env.call(&callable, args) {
            Ok(value) => Ok(value),
            Err(error) => {
                let kind = error.kind.clone();
                Err(env.throw(&kind, error.payload))
            }
        }
    }

    let mut env = Environment::new(ProviderKind::Interpreter);
    let callable = env.bind(reenter, "reenter", HashMap::new());
    let self_value = callable.as_value();
    let error = env.call(&callable, &[self_value]).expect_err("depth bound");
    assert_eq!(error.kind, "CallDepthError");
}

#[test]
fn uncaught_error_renders_header_and_frames() {
    let mut env = Environment::new(ProviderKind::Interpreter);
    let source = r#"
        function inner() { throw("Boom", 42); }
        function outer() { return inner(); }
        outer();
    "#;
    let callable = env.compile_source(source, "property", HashMap::new()).unwrap();
    let error = env.call(&callable, &[]).unwrap_err();
    let rendered = error.to_string();
    assert!(rendered.starts_with("Boom: 42"));
    assert!(rendered.contains("inner"));
    assert!(rendered.contains("outer"));
}

#[test]
fn compile_file_records_file_info() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("program.gdr");
    std::fs::write(&path, "return 9;").unwrap();

    let mut env = Environment::new(ProviderKind::Interpreter);
    let callable = env
        .compile_file(&path, "program", HashMap::new())
        .expect("file compiles");
    assert_eq!(env.call(&callable, &[]).unwrap(), Value::integer(9));

    let info = env.function_info(callable.id()).unwrap();
    assert_eq!(info.origin, girder::FunctionOrigin::File);
    assert!(info.info.get("FILE").unwrap().contains("program.gdr"));
}

#[test]
fn syntax_errors_carry_position_and_line() {
    let mut env = Environment::new(ProviderKind::Interpreter);
    let error = env
        .compile_source("local x = ;\n", "bad", HashMap::new())
        .expect_err("syntax error");
    match error {
        girder::GirderError::Syntax(e) => {
            assert_eq!(e.row, 1);
            assert!(e.line.contains("local x = ;"));
            assert!(e.message.contains("expected expression"));
        }
        other => panic!("expected a syntax error, got {}", other),
    }
}
