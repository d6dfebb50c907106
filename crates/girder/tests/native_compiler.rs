//! Compiler-provider end-to-end tests.
//!
//! These assemble through the system toolchain and execute the loaded
//! code, so they are ignored by default; run them on a machine with `cc`
//! available:
//!
//! ```text
//! cargo test --test native_compiler -- --ignored
//! ```

use girder::{Environment, ProviderKind, Value};
use std::collections::HashMap;

fn run_compiled(source: &str) -> Value {
    let mut env = Environment::new(ProviderKind::Compiler);
    let callable = env
        .compile_source(source, "jit", HashMap::new())
        .expect("native compilation succeeds");
    env.call(&callable, &[]).expect("call succeeds")
}

/// Interpreter and compiler agree on the returned value.
fn differential(source: &str) {
    let mut reference = Environment::new(ProviderKind::Interpreter);
    let callable = reference
        .compile_source(source, "ref", HashMap::new())
        .expect("source compiles");
    let expected = reference.call(&callable, &[]).expect("reference runs");

    let actual = run_compiled(source);
    assert_eq!(
        actual.kind(),
        expected.kind(),
        "provider kinds diverge for: {}",
        source
    );
    assert_eq!(
        actual.to_display_string(),
        expected.to_display_string(),
        "provider results diverge for: {}",
        source
    );
}

#[test]
#[ignore = "requires a system assembler (cc)"]
fn jit_arithmetic() {
    assert_eq!(run_compiled("return 2 + 3 * 4;"), Value::integer(14));
}

#[test]
#[ignore = "requires a system assembler (cc)"]
fn jit_locals_and_compound_assign() {
    assert_eq!(
        run_compiled("local x = 1; x += 2; return x;"),
        Value::integer(3)
    );
}

#[test]
#[ignore = "requires a system assembler (cc)"]
fn jit_string_concat() {
    assert_eq!(run_compiled("return \"n=\" + 5;").as_str(), Some("n=5"));
}

#[test]
#[ignore = "requires a system assembler (cc)"]
fn jit_control_flow() {
    assert_eq!(
        run_compiled(
            "local s = 0; for (local i = 1; i <= 3; i = i + 1) { s = s + i; } return s;"
        ),
        Value::integer(6)
    );
}

#[test]
#[ignore = "requires a system assembler (cc)"]
fn jit_function_calls() {
    let source = r#"
        function add(a, b) { return a + b; }
        return add(2, 40);
    "#;
    assert_eq!(run_compiled(source), Value::integer(42));
}

#[test]
#[ignore = "requires a system assembler (cc)"]
fn jit_exception_unwind_releases_locals() {
    let mut env = Environment::new(ProviderKind::Compiler);
    let source = r#"
        function boom() {
            local held = "jit unwind payload";
            throw("E", "msg");
        }
        boom();
    "#;
    let callable = env
        .compile_source(source, "jit", HashMap::new())
        .expect("native compilation succeeds");
    let probe = env.intern("jit unwind payload");
    let base = probe.refcount();

    let error = env.call(&callable, &[]).expect_err("throws");
    assert_eq!(error.kind, "E");
    assert_eq!(error.payload.as_str(), Some("msg"));
    // The frame crossed by the unwind dereferenced its local exactly once.
    assert_eq!(probe.refcount(), base);
}

#[test]
#[ignore = "requires a system assembler (cc)"]
fn providers_agree_on_shared_scenarios() {
    for source in [
        "return 2 + 3 * 4;",
        "return \"n=\" + 5;",
        "local x = 1; x += 2; return x;",
        "local a = [10,20,30]; return #a;",
        "local s = 0; for (local i = 1; i <= 3; i = i + 1) { s = s + i; } return s;",
        "local t = { greet = function(self, name) { return \"hi \" + name; } }; return t.greet(\"bo\");",
        "return 1 < 2 ? 10 : 20;",
        "return false || 7;",
        "local a = [0,1,2,3,4,5]; local v = a[1:3]; return v[0] * 100 + v[1] * 10 + v[2];",
        "local i = 5; local a = i++; return a * 100 + i;",
        "local n = 0; do { n = n + 1; } while (n < 3); return n;",
        "return (2 ^ 10) + (7 % 4) + (1 << 3);",
    ] {
        differential(source);
    }
}
