//! Native-Code Provider
//!
//! Translates each function's syntax tree into x86-64 assembly text,
//! assembles it through the external system assembler (`cc -shared`), and
//! loads the result in-process with `dlopen`. The entry point of every
//! compiled function is `extern "C" fn(ret: *mut Value, env: *mut
//! Environment)`: arguments travel through the environment's argument
//! slot, the return value is written to `*ret`.
//!
//! # Frame
//!
//! A preliminary scan (`scan.rs`) bounds the number of concurrently-live
//! locals and the expression spill depth. The machine frame is laid out as
//! `[locals | spill | scratch | frame node | argument regions]` of 16-byte
//! value cells; locals are null-initialized on entry and every scope exit
//! emits a `girder_rt_block_dereference` over the slots it owned - that
//! call is the compiler's garbage collection.
//!
//! # Registers
//!
//! Pinned per function: `r12` = return slot, `r13` = environment, the
//! "left" operand in `r14`/`r15` (type/payload), the "right" operand in
//! `rbx`/`rbp`, `rcx` as the transient identifier register, and `xmm0` as
//! the 128-bit cell-transfer register.
//!
//! # Unwinding
//!
//! `girder_rt_throw` sets the environment's unwinding flag; every emitted
//! call site dereferences its operand temporaries, tests the flag, and
//! jumps to the innermost scope's unwind label. Unwind labels cascade
//! outward - each dereferences its own scope's slot range (slot nulling
//! makes the cascade idempotent) - and end in the function epilogue, which
//! unlinks the logical frame node. The host `call` boundary turns the
//! recorded exception into a runtime error.
//!
//! # Module Structure
//!
//! - `scan.rs`: preliminary scan (locals bound, spill bound, call sites)
//! - `frame.rs`: slot allocation, scope stack, loop stack, label supply
//! - `asm.rs`: assembly text builder
//! - `expression.rs`: expression pass
//! - `statements.rs`: statement and control-flow pass
//! - `calls.rs`: call-site emission
//! - `jit.rs`: external assembler invocation, dlopen, entry registry

mod asm;
mod calls;
mod expression;
mod frame;
mod jit;
mod scan;
mod statements;

pub(crate) use jit::JitState;

use crate::ast::{Block, Expression, FunctionLiteral, Statement};
use crate::environment::{Environment, FunctionBody, ScriptFunction};
use crate::error::CompileError;
use crate::stack_trace::FunctionOrigin;
use asm::Asm;
use frame::Frame;
use std::rc::Rc;

/// Cell size and the frame's unit of allocation.
pub(crate) const CELL: usize = 16;

/// Per-call-site argument region capacity, in cells.
pub(crate) const DEFAULT_ARGUMENT_ALLOCATION: usize = 16;

/// Compile one registered script function (and, first, every function
/// literal nested in it). Safe to call twice; the second call is a no-op.
pub(crate) fn compile_function(env: &mut Environment, id: u64) -> Result<(), CompileError> {
    if env.jit().entry(id).is_some() {
        return Ok(());
    }
    let Some(info) = env.function_info(id) else {
        return Err(CompileError::Unsupported(format!("unknown function {}", id)));
    };
    let FunctionBody::Script(function) = &info.body else {
        // Native bindings are already callable.
        return Ok(());
    };
    let function = Rc::clone(function);
    let name = info.name.clone();
    tracing::debug!(id, name, "native-compiling function");

    // Bottom-up: nested literals first, so their ids exist when this body
    // emits function-value cells.
    compile_nested_literals(env, &function.body)?;

    let scan = scan::scan(&function)?;
    let mut codegen = CodeGen::new(env, id, &scan);
    let text = codegen.emit_function(&function)?;
    let pinned = codegen.pinned;

    let entry = env.jit_mut().assemble(id, &text)?;
    env.jit_mut().register(id, entry, text, pinned);
    Ok(())
}

/// Register and compile every function literal in a block.
fn compile_nested_literals(env: &mut Environment, block: &Block) -> Result<(), CompileError> {
    let mut literals = Vec::new();
    collect_literals_block(block, &mut literals);
    for literal in literals {
        let id = register_literal(env, &literal);
        compile_function(env, id)?;
    }
    Ok(())
}

/// Register a literal in the function registry, caching the id on the
/// node so re-registration is impossible.
pub(crate) fn register_literal(env: &mut Environment, literal: &Rc<FunctionLiteral>) -> u64 {
    if let Some(id) = literal.registered.get() {
        return id;
    }
    let params = literal.params.iter().map(|p| env.intern(p)).collect();
    let function = Rc::new(ScriptFunction {
        params,
        body: Rc::clone(&literal.body),
    });
    let id = env.register_function(
        literal.name.clone(),
        FunctionOrigin::Immediate,
        FunctionBody::Script(function),
        Default::default(),
    );
    literal.registered.set(Some(id));
    id
}

fn collect_literals_block(block: &Block, out: &mut Vec<Rc<FunctionLiteral>>) {
    for statement in &block.statements {
        collect_literals_statement(statement, out);
    }
}

fn collect_literals_statement(statement: &Statement, out: &mut Vec<Rc<FunctionLiteral>>) {
    match statement {
        Statement::Expression(e) | Statement::Return(Some(e)) => collect_literals_expr(e, out),
        Statement::Local { value: Some(e), .. } => collect_literals_expr(e, out),
        Statement::Local { value: None, .. }
        | Statement::Return(None)
        | Statement::Break
        | Statement::Continue => {}
        Statement::If { arms, otherwise } => {
            for (condition, body) in arms {
                collect_literals_expr(condition, out);
                collect_literals_block(body, out);
            }
            if let Some(body) = otherwise {
                collect_literals_block(body, out);
            }
        }
        Statement::For {
            init,
            condition,
            step,
            body,
        } => {
            if let Some(init) = init {
                collect_literals_statement(init, out);
            }
            if let Some(condition) = condition {
                collect_literals_expr(condition, out);
            }
            if let Some(step) = step {
                collect_literals_expr(step, out);
            }
            collect_literals_block(body, out);
        }
        Statement::While { condition, body } => {
            collect_literals_expr(condition, out);
            collect_literals_block(body, out);
        }
        Statement::DoWhile { body, condition } => {
            collect_literals_block(body, out);
            collect_literals_expr(condition, out);
        }
        Statement::Switch {
            subject,
            cases,
            default,
        } => {
            collect_literals_expr(subject, out);
            for case in cases {
                for matcher in &case.matches {
                    collect_literals_expr(matcher, out);
                }
                collect_literals_block(&case.body, out);
            }
            if let Some(body) = default {
                collect_literals_block(body, out);
            }
        }
        Statement::Block(block) => collect_literals_block(block, out),
        Statement::FunctionDeclaration { function, .. } => {
            out.push(Rc::clone(function));
            collect_literals_block(&function.body, out);
        }
        Statement::ClassDeclaration { members, .. } => {
            for member in members {
                out.push(Rc::clone(member));
                collect_literals_block(&member.body, out);
            }
        }
    }
}

fn collect_literals_expr(expression: &Expression, out: &mut Vec<Rc<FunctionLiteral>>) {
    match expression {
        Expression::FunctionLiteral(literal) => {
            out.push(Rc::clone(literal));
            collect_literals_block(&literal.body, out);
        }
        Expression::Binary { lhs, rhs, .. }
        | Expression::Comparison { lhs, rhs, .. }
        | Expression::LogicalOr { lhs, rhs }
        | Expression::LogicalAnd { lhs, rhs } => {
            collect_literals_expr(lhs, out);
            collect_literals_expr(rhs, out);
        }
        Expression::Unary { operand, .. }
        | Expression::PreIncrement(operand)
        | Expression::PostIncrement(operand)
        | Expression::PreDecrement(operand)
        | Expression::PostDecrement(operand) => collect_literals_expr(operand, out),
        Expression::Ternary {
            condition,
            then,
            otherwise,
        } => {
            collect_literals_expr(condition, out);
            collect_literals_expr(then, out);
            collect_literals_expr(otherwise, out);
        }
        Expression::Assign { target, value } | Expression::CompoundAssign { target, value, .. } => {
            collect_literals_expr(target, out);
            collect_literals_expr(value, out);
        }
        Expression::Index { target, key } => {
            collect_literals_expr(target, out);
            collect_literals_expr(key, out);
        }
        Expression::RangedIndex { target, from, to } => {
            collect_literals_expr(target, out);
            collect_literals_expr(from, out);
            collect_literals_expr(to, out);
        }
        Expression::Select { target, .. } => collect_literals_expr(target, out),
        Expression::Call { callee, args, .. } | Expression::New { class: callee, args, .. } => {
            collect_literals_expr(callee, out);
            for arg in args {
                collect_literals_expr(arg, out);
            }
        }
        Expression::Table(entries) => {
            for (_, value) in entries {
                collect_literals_expr(value, out);
            }
        }
        Expression::Array(elements) => {
            for element in elements {
                collect_literals_expr(element, out);
            }
        }
        Expression::Null
        | Expression::Boolean(_)
        | Expression::Integer(_)
        | Expression::Number(_)
        | Expression::String(_)
        | Expression::Identifier(_) => {}
    }
}

/// Advisory flags threaded through one level of expression emission.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct PassControl {
    /// The parent discards the result; the child may skip materializing it.
    pub suppress_result: bool,
    /// The identifier being emitted defines a new local in this scope.
    pub local_definition: bool,
}

/// Per-function code generator. Owns the text being built plus the frame
/// bookkeeping; pins interned strings it embeds as immediates.
pub(crate) struct CodeGen<'e> {
    env: &'e mut Environment,
    fn_id: u64,
    asm: Asm,
    /// Unwind cascade blocks, appended after the body.
    appendix: String,
    frame: Frame,
    /// Interned strings whose addresses are baked into the text.
    pinned: Vec<crate::string::GirderString>,
    /// Next call-site argument region.
    site_counter: usize,
    scan: scan::ScanResult,
}

impl<'e> CodeGen<'e> {
    fn new(env: &'e mut Environment, fn_id: u64, scan: &scan::ScanResult) -> Self {
        CodeGen {
            env,
            fn_id,
            asm: Asm::new(),
            appendix: String::new(),
            frame: Frame::new(scan.max_locals, scan.max_spill, scan.call_sites),
            pinned: Vec::new(),
            site_counter: 0,
            scan: scan.clone(),
        }
    }

    /// Pin a string in the environment for the lifetime of the compiled
    /// code and return its block address for embedding.
    fn pin_string(&mut self, content: &str) -> u64 {
        let handle = self.env.intern(content);
        let block = handle.raw().as_ptr() as u64;
        self.pinned.push(handle);
        block
    }

    /// Function-value cell payload for a registered literal.
    fn literal_id(&self, literal: &Rc<FunctionLiteral>) -> Result<u64, CompileError> {
        literal.registered.get().ok_or_else(|| {
            CompileError::Unsupported("function literal compiled before registration".to_string())
        })
    }

    fn null_cell_to_left(&mut self) {
        self.asm.ins("movq $0, %r14");
        self.asm.ins("movq $0, %r15");
    }

    fn value_imm_to_left(&mut self, kind: u64, data: u64) {
        self.asm.ins(&format!("movq ${}, %r14", kind));
        if data <= i32::MAX as u64 {
            self.asm.ins(&format!("movq ${}, %r15", data));
        } else {
            self.asm.ins(&format!("movabs ${:#x}, %r15", data));
        }
    }

}

#[cfg(test)]
mod tests {
    use crate::environment::{Environment, ProviderKind};
    use std::collections::HashMap;

    /// Compile through the public path but stop at the emitted text.
    fn emit(source: &str) -> String {
        let mut env = Environment::new(ProviderKind::Interpreter);
        let callable = env
            .compile_source(source, "unit", HashMap::new())
            .expect("source compiles");
        let id = callable.id();
        let function = match &env.function_info(id).unwrap().body {
            crate::environment::FunctionBody::Script(f) => std::rc::Rc::clone(f),
            _ => unreachable!("compile_source registers script bodies"),
        };
        let scan = super::scan::scan(&function).expect("scan succeeds");
        let mut codegen = super::CodeGen::new(&mut env, id, &scan);
        codegen.emit_function(&function).expect("emission succeeds")
    }

    #[test]
    fn test_emits_entry_symbol_and_frame() {
        let text = emit("return 1 + 2;");
        assert!(text.contains(".globl girder_fn_"));
        assert!(text.contains("push %rbp"));
        assert!(text.contains("push %r15"));
        // Locals are zero-initialized with a string store loop.
        assert!(text.contains("rep stosq"));
        // Frame node link and unlink.
        assert!(text.contains("girder frame link"));
        assert!(text.contains("ret"));
    }

    #[test]
    fn test_binary_operator_calls_helper() {
        let text = emit("return 1 + 2;");
        assert!(text.contains("girder_rt_add"));
        // Every helper call is followed by an unwinding-flag test.
        assert!(text.contains("cmpb $0, 16(%r13)"));
    }

    #[test]
    fn test_return_dereferences_whole_locals_stack() {
        let text = emit("local x = 1; return x;");
        assert!(text.contains("girder_rt_block_dereference"));
    }

    #[test]
    fn test_call_site_reserves_argument_region() {
        let text = emit("f(1, 2);");
        assert!(text.contains("girder_rt_invoke"));
        // Arguments land in the call site's region before the slot is set.
        assert!(text.contains("# arg slot"));
    }

    #[test]
    fn test_reference_fast_path_is_inline() {
        let text = emit("local x = \"s\"; local y = x; return y;");
        // Tag boundary compare against the simple-type end before the
        // reference/dereference helpers.
        assert!(text.contains("cmpq $4,"));
        assert!(text.contains("girder_rt_reference"));
    }

    #[test]
    fn test_switch_is_rejected() {
        let mut env = Environment::new(ProviderKind::Compiler);
        let error = env
            .compile_source("switch (1) { default: }", "unit", HashMap::new())
            .unwrap_err();
        assert!(error.to_string().contains("switch"));
    }
}
