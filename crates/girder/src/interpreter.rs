//! Tree-Walking Interpreter
//!
//! The reference semantics the native compiler is validated against. A
//! call activation owns a stack of local scopes (each a table keyed by
//! interned identifier); identifier resolution scans scopes
//! innermost-first, then the globals. Block evaluation returns a tagged
//! flow result - normal, return, break, or continue - which control nodes
//! propagate upward and loops consume.

use crate::ast::{
    Block, ComparisonOp, Expression, FunctionLiteral, FunctionTag, SelectKind, Statement,
    TableKey, UnaryOp,
};
use crate::environment::{Environment, FunctionBody, ScriptFunction};
use crate::error::{EvalResult, exception};
use crate::object::{self, Reference};
use crate::stack_trace::FunctionOrigin;
use crate::table::GirderTable;
use crate::value::{Value, ValueKind};
use std::rc::Rc;

/// Result of evaluating a block or statement.
enum Flow {
    Normal,
    Return(Value),
    Break,
    Continue,
}

/// Run a script function: bind parameters from the argument slot's
/// contents into a fresh scope, evaluate the body, surface the return
/// value.
pub(crate) fn call_script(
    env: &mut Environment,
    function: &ScriptFunction,
    args: &[Value],
) -> EvalResult<Value> {
    let scope = GirderTable::new();
    for (i, param) in function.params.iter().enumerate() {
        // Missing arguments bind null; extras are ignored.
        let value = args.get(i).cloned().unwrap_or_else(Value::null);
        scope.set(Value::from(param.clone()), value);
    }

    let mut interp = Interp {
        env,
        scopes: vec![scope],
    };
    match interp.eval_block_in_place(&function.body)? {
        Flow::Return(value) => Ok(value),
        _ => Ok(Value::null()),
    }
}

struct Interp<'e> {
    env: &'e mut Environment,
    scopes: Vec<GirderTable>,
}

impl<'e> Interp<'e> {
    fn key(&mut self, name: &str) -> Value {
        Value::from(self.env.intern(name))
    }

    fn innermost(&self) -> &GirderTable {
        self.scopes.last().expect("at least the call scope")
    }

    // ------------------------------------------------------------------
    // Blocks and statements
    // ------------------------------------------------------------------

    /// Evaluate a block inside a fresh scope.
    fn eval_block(&mut self, block: &Block) -> EvalResult<Flow> {
        self.scopes.push(GirderTable::new());
        let flow = self.eval_block_in_place(block);
        self.scopes.pop();
        flow
    }

    /// Evaluate a block in the current scope (function bodies share the
    /// parameter scope).
    fn eval_block_in_place(&mut self, block: &Block) -> EvalResult<Flow> {
        for statement in &block.statements {
            match self.eval_statement(statement)? {
                Flow::Normal => {}
                other => return Ok(other),
            }
        }
        Ok(Flow::Normal)
    }

    fn eval_statement(&mut self, statement: &Statement) -> EvalResult<Flow> {
        match statement {
            Statement::Expression(expression) => {
                self.eval_expression(expression)?;
                Ok(Flow::Normal)
            }
            Statement::Local { name, value, .. } => {
                let value = match value {
                    Some(expression) => self.eval_expression(expression)?,
                    None => Value::null(),
                };
                let key = self.key(name);
                self.innermost().set(key, value);
                Ok(Flow::Normal)
            }
            Statement::If { arms, otherwise } => {
                for (condition, body) in arms {
                    if self.eval_expression(condition)?.truthy() {
                        return self.eval_block(body);
                    }
                }
                match otherwise {
                    Some(body) => self.eval_block(body),
                    None => Ok(Flow::Normal),
                }
            }
            Statement::While { condition, body } => {
                while self.eval_expression(condition)?.truthy() {
                    match self.eval_block(body)? {
                        Flow::Break => break,
                        Flow::Return(value) => return Ok(Flow::Return(value)),
                        Flow::Normal | Flow::Continue => {}
                    }
                }
                Ok(Flow::Normal)
            }
            Statement::DoWhile { body, condition } => {
                loop {
                    match self.eval_block(body)? {
                        Flow::Break => break,
                        Flow::Return(value) => return Ok(Flow::Return(value)),
                        Flow::Normal | Flow::Continue => {}
                    }
                    if !self.eval_expression(condition)?.truthy() {
                        break;
                    }
                }
                Ok(Flow::Normal)
            }
            Statement::For {
                init,
                condition,
                step,
                body,
            } => {
                // The loop header gets its own scope so `local i` dies with
                // the loop.
                self.scopes.push(GirderTable::new());
                let flow = self.eval_for(init.as_deref(), condition.as_ref(), step.as_ref(), body);
                self.scopes.pop();
                flow
            }
            Statement::Switch {
                subject,
                cases,
                default,
            } => self.eval_switch(subject, cases, default.as_ref()),
            Statement::Return(value) => {
                let value = match value {
                    Some(expression) => self.eval_expression(expression)?,
                    None => Value::null(),
                };
                Ok(Flow::Return(value))
            }
            Statement::Break => Ok(Flow::Break),
            Statement::Continue => Ok(Flow::Continue),
            Statement::Block(block) => self.eval_block(block),
            Statement::FunctionDeclaration {
                path,
                tag,
                function,
            } => {
                self.eval_function_declaration(path, *tag, function)?;
                Ok(Flow::Normal)
            }
            Statement::ClassDeclaration { name, .. } => Err(self.env.throw_message(
                exception::TYPE_ERROR,
                format!("class declarations are not executed (class {})", name),
            )),
        }
    }

    fn eval_for(
        &mut self,
        init: Option<&Statement>,
        condition: Option<&Expression>,
        step: Option<&Expression>,
        body: &Block,
    ) -> EvalResult<Flow> {
        if let Some(init) = init {
            self.eval_statement(init)?;
        }
        loop {
            if let Some(condition) = condition {
                if !self.eval_expression(condition)?.truthy() {
                    break;
                }
            }
            match self.eval_block(body)? {
                Flow::Break => break,
                Flow::Return(value) => return Ok(Flow::Return(value)),
                Flow::Normal | Flow::Continue => {}
            }
            if let Some(step) = step {
                self.eval_expression(step)?;
            }
        }
        Ok(Flow::Normal)
    }

    fn eval_switch(
        &mut self,
        subject: &Expression,
        cases: &[crate::ast::SwitchCase],
        default: Option<&Block>,
    ) -> EvalResult<Flow> {
        let subject = self.eval_expression(subject)?;
        for case in cases {
            for matcher in &case.matches {
                let candidate = self.eval_expression(matcher)?;
                if object::eq(self.env, &subject, &candidate)?.truthy() {
                    return match self.eval_block(&case.body)? {
                        Flow::Break | Flow::Normal => Ok(Flow::Normal),
                        other => Ok(other),
                    };
                }
            }
        }
        match default {
            Some(body) => match self.eval_block(body)? {
                Flow::Break | Flow::Normal => Ok(Flow::Normal),
                other => Ok(other),
            },
            None => Ok(Flow::Normal),
        }
    }

    fn eval_function_declaration(
        &mut self,
        path: &[String],
        tag: FunctionTag,
        function: &Rc<FunctionLiteral>,
    ) -> EvalResult<()> {
        let value = self.function_value(function);
        match tag {
            FunctionTag::Basic | FunctionTag::BasicConstant => {
                if path.len() != 1 {
                    return Err(self.env.throw_message(
                        exception::TYPE_ERROR,
                        "a local function cannot declare a dotted path",
                    ));
                }
                let key = self.key(&path[0]);
                self.innermost().set(key, value);
                Ok(())
            }
            FunctionTag::Global | FunctionTag::GlobalConstant => {
                if path.len() == 1 {
                    self.env.set_global(&path[0], value);
                    return Ok(());
                }
                // Walk the dotted path through the globals, creating
                // intermediate tables.
                let mut table = self.env.globals().clone();
                for segment in &path[..path.len() - 1] {
                    let key = self.key(segment);
                    let entry = table.get(&key);
                    let next = match entry.kind() {
                        ValueKind::Table => entry.table_handle().expect("table cell"),
                        ValueKind::Null => {
                            let fresh = GirderTable::new();
                            table.set(key, Value::from(fresh.clone()));
                            fresh
                        }
                        other => {
                            return Err(self.env.throw_message(
                                exception::TYPE_ERROR,
                                format!(
                                    "cannot declare through {} (a {} value)",
                                    segment,
                                    other.name()
                                ),
                            ));
                        }
                    };
                    table = next;
                }
                let key = self.key(path.last().expect("non-empty path"));
                table.set(key, value);
                Ok(())
            }
        }
    }

    /// Register a function literal on first sight; later evaluations reuse
    /// the cached id so both providers agree on the callable.
    fn function_value(&mut self, literal: &Rc<FunctionLiteral>) -> Value {
        if let Some(id) = literal.registered.get() {
            return Value::function(id);
        }
        let params = literal
            .params
            .iter()
            .map(|p| self.env.intern(p))
            .collect();
        let function = Rc::new(ScriptFunction {
            params,
            body: Rc::clone(&literal.body),
        });
        let id = self.env.register_function(
            literal.name.clone(),
            FunctionOrigin::Immediate,
            FunctionBody::Script(function),
            Default::default(),
        );
        literal.registered.set(Some(id));
        Value::function(id)
    }

    // ------------------------------------------------------------------
    // Identifier resolution
    // ------------------------------------------------------------------

    fn lookup(&mut self, name: &str) -> Value {
        let key = self.key(name);
        for scope in self.scopes.iter().rev() {
            if scope.contains_key(&key) {
                return scope.get(&key);
            }
        }
        self.env.globals().get(&key)
    }

    /// Resolve an assignable expression to a mutable reference cell.
    fn resolve_reference(&mut self, expression: &Expression) -> EvalResult<Reference> {
        match expression {
            Expression::Identifier(name) => {
                let key = self.key(name);
                for scope in self.scopes.iter().rev() {
                    if scope.contains_key(&key) {
                        return Ok(Reference::TableEntry {
                            table: scope.clone(),
                            key,
                        });
                    }
                }
                Ok(Reference::TableEntry {
                    table: self.env.globals().clone(),
                    key,
                })
            }
            Expression::Index { target, key } => {
                let target = self.eval_expression(target)?;
                let key = self.eval_expression(key)?;
                object::index(self.env, &target, &key)
            }
            Expression::Select { target, key, .. } => {
                let target = self.eval_expression(target)?;
                let key = self.key(key);
                object::index(self.env, &target, &key)
            }
            _ => Err(self.env.throw_message(
                exception::TYPE_ERROR,
                "expression is not assignable",
            )),
        }
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    fn eval_expression(&mut self, expression: &Expression) -> EvalResult<Value> {
        match expression {
            Expression::Null => Ok(Value::null()),
            Expression::Boolean(value) => Ok(Value::boolean(*value)),
            Expression::Integer(value) => Ok(Value::integer(*value)),
            Expression::Number(value) => Ok(Value::number(*value)),
            Expression::String(text) => Ok(Value::from(self.env.intern(text))),
            Expression::Identifier(name) => Ok(self.lookup(name)),

            Expression::Binary { op, lhs, rhs } => {
                let lhs = self.eval_expression(lhs)?;
                let rhs = self.eval_expression(rhs)?;
                object::binary(self.env, *op, &lhs, &rhs)
            }
            Expression::Comparison { op, lhs, rhs } => {
                let lhs = self.eval_expression(lhs)?;
                let rhs = self.eval_expression(rhs)?;
                match op {
                    ComparisonOp::Eq => object::eq(self.env, &lhs, &rhs),
                    ComparisonOp::Ne => object::ne(self.env, &lhs, &rhs),
                    ComparisonOp::Lt => object::lt(self.env, &lhs, &rhs),
                    ComparisonOp::Le => object::le(self.env, &lhs, &rhs),
                    ComparisonOp::Gt => object::gt(self.env, &lhs, &rhs),
                    ComparisonOp::Ge => object::ge(self.env, &lhs, &rhs),
                }
            }
            Expression::LogicalOr { lhs, rhs } => {
                let lhs = self.eval_expression(lhs)?;
                if lhs.kind() == ValueKind::NativeObject {
                    let rhs = self.eval_expression(rhs)?;
                    return object::logical_or(self.env, &lhs, &rhs);
                }
                // Short-circuit: the first truthy operand is the result.
                if lhs.truthy() {
                    Ok(lhs)
                } else {
                    self.eval_expression(rhs)
                }
            }
            Expression::LogicalAnd { lhs, rhs } => {
                let lhs = self.eval_expression(lhs)?;
                if lhs.kind() == ValueKind::NativeObject {
                    let rhs = self.eval_expression(rhs)?;
                    return object::logical_and(self.env, &lhs, &rhs);
                }
                if !lhs.truthy() {
                    return Ok(Value::boolean(false));
                }
                let rhs = self.eval_expression(rhs)?;
                if rhs.truthy() {
                    Ok(rhs)
                } else {
                    Ok(Value::boolean(false))
                }
            }
            Expression::Unary { op, operand } => {
                let operand = self.eval_expression(operand)?;
                match op {
                    UnaryOp::Not => object::logical_not(self.env, &operand),
                    UnaryOp::BitNot => object::bnot(self.env, &operand),
                    UnaryOp::Length => object::length(self.env, &operand),
                    UnaryOp::TypeOf => Ok(object::type_of(self.env, &operand)),
                }
            }
            Expression::Ternary {
                condition,
                then,
                otherwise,
            } => {
                if self.eval_expression(condition)?.truthy() {
                    self.eval_expression(then)
                } else {
                    self.eval_expression(otherwise)
                }
            }

            Expression::Assign { target, value } => {
                // Target pieces evaluate before the value, matching the
                // native provider's emission order.
                let reference = self.resolve_reference(target)?;
                let value = self.eval_expression(value)?;
                object::assign(self.env, &reference, value.clone())?;
                Ok(value)
            }
            Expression::CompoundAssign { op, target, value } => {
                let reference = self.resolve_reference(target)?;
                let value = self.eval_expression(value)?;
                object::apply_compound(self.env, *op, &reference, &value)?;
                Ok(Value::null())
            }
            Expression::PreIncrement(target) => {
                let reference = self.resolve_reference(target)?;
                object::step(self.env, &reference, 1, true)
            }
            Expression::PostIncrement(target) => {
                let reference = self.resolve_reference(target)?;
                object::step(self.env, &reference, 1, false)
            }
            Expression::PreDecrement(target) => {
                let reference = self.resolve_reference(target)?;
                object::step(self.env, &reference, -1, true)
            }
            Expression::PostDecrement(target) => {
                let reference = self.resolve_reference(target)?;
                object::step(self.env, &reference, -1, false)
            }

            Expression::Index { target, key } => {
                let target = self.eval_expression(target)?;
                let key = self.eval_expression(key)?;
                object::select(self.env, &target, &key)
            }
            Expression::RangedIndex { target, from, to } => {
                let target = self.eval_expression(target)?;
                let from = self.eval_expression(from)?;
                let to = self.eval_expression(to)?;
                object::ranged_select(self.env, &target, &from, &to)
            }
            Expression::Select { target, key, .. } => {
                let target = self.eval_expression(target)?;
                let key = self.key(key);
                object::select(self.env, &target, &key)
            }

            Expression::Call { callee, args, .. } => self.eval_call(callee, args),
            Expression::New { class, args, .. } => {
                let class = self.eval_expression(class)?;
                let args = self.eval_arguments(args)?;
                object::construct(self.env, &class, &args)
            }

            Expression::FunctionLiteral(literal) => Ok(self.function_value(literal)),
            Expression::Table(entries) => {
                let table = GirderTable::new();
                for (key, value) in entries {
                    let key = match key {
                        TableKey::Identifier(name) | TableKey::String(name) => self.key(name),
                    };
                    let value = self.eval_expression(value)?;
                    table.set(key, value);
                }
                Ok(Value::from(table))
            }
            Expression::Array(elements) => {
                let mut values = Vec::with_capacity(elements.len());
                for element in elements {
                    values.push(self.eval_expression(element)?);
                }
                Ok(Value::from(crate::array::GirderArray::managed(values)))
            }
        }
    }

    fn eval_arguments(&mut self, args: &[Expression]) -> EvalResult<Vec<Value>> {
        let mut values = Vec::with_capacity(args.len());
        for arg in args {
            values.push(self.eval_expression(arg)?);
        }
        Ok(values)
    }

    fn eval_call(&mut self, callee: &Expression, args: &[Expression]) -> EvalResult<Value> {
        // A dot-call evaluates its LHS once and passes it as the implicit
        // first argument.
        if let Expression::Select {
            kind: SelectKind::Dot,
            target,
            key,
        } = callee
        {
            let receiver = self.eval_expression(target)?;
            let mut values = Vec::with_capacity(args.len() + 1);
            values.push(receiver.clone());
            values.extend(self.eval_arguments(args)?);
            // Method resolution happens after the arguments, as at a
            // compiled call site.
            let key = self.key(key);
            let method = object::select(self.env, &receiver, &key)?;
            return self.env.call_value(&method, &values);
        }

        // Arguments first, callee last.
        let values = self.eval_arguments(args)?;
        let callee = self.eval_expression(callee)?;
        self.env.call_value(&callee, &values)
    }
}

#[cfg(test)]
mod tests {
    use crate::environment::{Environment, ProviderKind};
    use crate::value::Value;
    use std::collections::HashMap;

    fn run(source: &str) -> Value {
        let mut env = Environment::new(ProviderKind::Interpreter);
        let callable = env
            .compile_source(source, "test", HashMap::new())
            .expect("source compiles");
        env.call(&callable, &[]).expect("call succeeds")
    }

    #[test]
    fn test_arithmetic_precedence() {
        assert_eq!(run("return 2 + 3 * 4;"), Value::integer(14));
    }

    #[test]
    fn test_string_concat_coercion() {
        assert_eq!(run("return \"n=\" + 5;").as_str(), Some("n=5"));
    }

    #[test]
    fn test_local_and_compound_assign() {
        assert_eq!(run("local x = 1; x += 2; return x;"), Value::integer(3));
    }

    #[test]
    fn test_array_length() {
        assert_eq!(run("local a = [10,20,30]; return #a;"), Value::integer(3));
    }

    #[test]
    fn test_table_dot_call_binds_receiver() {
        let source = r#"
            local t = { greet = function(self, name) { return "hi " + name; } };
            return t.greet("bo");
        "#;
        assert_eq!(run(source).as_str(), Some("hi bo"));
    }

    #[test]
    fn test_for_loop_accumulates() {
        assert_eq!(
            run("local s = 0; for (local i = 1; i <= 3; i = i + 1) { s = s + i; } return s;"),
            Value::integer(6)
        );
    }

    #[test]
    fn test_while_break_continue() {
        let source = r#"
            local s = 0;
            local i = 0;
            while (true) {
                i = i + 1;
                if (i > 10) break;
                if (i % 2 == 0) continue;
                s = s + i;
            }
            return s;
        "#;
        assert_eq!(run(source), Value::integer(25));
    }

    #[test]
    fn test_do_while_runs_once() {
        assert_eq!(
            run("local n = 0; do { n = n + 1; } while (false); return n;"),
            Value::integer(1)
        );
    }

    #[test]
    fn test_switch_matching() {
        let source = r#"
            local y = 0;
            switch (2) {
                case 1: case 2:
                    y = 12;
                    break;
                case 3:
                    y = 3;
                    break;
                default:
                    y = 99;
            }
            return y;
        "#;
        assert_eq!(run(source), Value::integer(12));
    }

    #[test]
    fn test_locals_shadow_globals() {
        let source = r#"
            g = 1;
            local g = 2;
            return g;
        "#;
        assert_eq!(run(source), Value::integer(2));
    }

    #[test]
    fn test_inner_scope_sees_outer_local() {
        let source = r#"
            local x = 1;
            { x = x + 1; local y = 10; }
            return x;
        "#;
        assert_eq!(run(source), Value::integer(2));
    }

    #[test]
    fn test_function_declaration_and_call() {
        let source = r#"
            function add(a, b) { return a + b; }
            return add(2, 40);
        "#;
        assert_eq!(run(source), Value::integer(42));
    }

    #[test]
    fn test_dotted_function_declaration() {
        // `::` selects without binding the receiver; `.` would pass the
        // namespace table as the first argument.
        let source = r#"
            function math.double(n) { return n * 2; }
            return math::double(21);
        "#;
        assert_eq!(run(source), Value::integer(42));
    }

    #[test]
    fn test_missing_arguments_bind_null() {
        let source = r#"
            function probe(a, b) { return b == null; }
            return probe(1);
        "#;
        assert_eq!(run(source), Value::boolean(true));
    }

    #[test]
    fn test_ternary_and_logical() {
        assert_eq!(run("return 1 < 2 ? 10 : 20;"), Value::integer(10));
        assert_eq!(run("return false || 7;"), Value::integer(7));
        assert_eq!(run("return 1 && 7;"), Value::integer(7));
        assert_eq!(run("return 0 && 7;"), Value::boolean(false));
    }

    #[test]
    fn test_increment_family() {
        assert_eq!(run("local i = 5; local a = i++; return a * 100 + i;"), Value::integer(506));
        assert_eq!(run("local i = 5; local a = ++i; return a * 100 + i;"), Value::integer(606));
    }

    #[test]
    fn test_slicing_matches_indexing() {
        let source = r#"
            local a = [0, 1, 2, 3, 4, 5];
            local v = a[1:3];
            return v[0] * 100 + v[1] * 10 + v[2];
        "#;
        assert_eq!(run(source), Value::integer(123));
    }

    #[test]
    fn test_script_throw_surfaces() {
        let mut env = Environment::new(ProviderKind::Interpreter);
        let source = r#"
            function fail() { throw("E", "msg"); }
            fail();
        "#;
        let callable = env.compile_source(source, "test", HashMap::new()).unwrap();
        let error = env.call(&callable, &[]).unwrap_err();
        assert_eq!(error.kind, "E");
        assert_eq!(error.payload.as_str(), Some("msg"));
        assert!(error.trace.frames().any(|f| f.function == "fail"));
    }

    #[test]
    fn test_negative_index_from_end() {
        assert_eq!(run("local a = [1, 2, 3]; return a[-1];"), Value::integer(3));
    }

    #[test]
    fn test_nested_function_literal_value() {
        let source = r#"
            local make = function() { return function() { return 7; }; };
            local f = make();
            return f();
        "#;
        assert_eq!(run(source), Value::integer(7));
    }
}
