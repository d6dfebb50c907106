//! Preliminary Scan
//!
//! Walks a function's syntax tree before code generation and bounds the
//! frame: the maximum number of concurrently-live locals (including those
//! declared inside nested blocks and loop headers), the expression spill
//! depth, and the number of call sites needing argument regions. Also the
//! place constructs the provider rejects are diagnosed, before any text is
//! emitted.

use crate::ast::{Block, Expression, Statement};
use crate::environment::ScriptFunction;
use crate::error::CompileError;
use super::DEFAULT_ARGUMENT_ALLOCATION;

#[derive(Debug, Clone)]
pub(crate) struct ScanResult {
    /// Upper bound on concurrently-reserved local slots, parameters
    /// included.
    pub max_locals: usize,
    /// Upper bound on spill cells live at once during expression
    /// evaluation (at least 6).
    pub max_spill: usize,
    /// Number of call sites; each gets its own argument region.
    pub call_sites: usize,
}

pub(crate) fn scan(function: &ScriptFunction) -> Result<ScanResult, CompileError> {
    let mut scanner = Scanner {
        live_locals: function.params.len(),
        max_locals: function.params.len(),
        call_sites: 0,
        max_spill: 0,
    };
    scanner.block(&function.body)?;
    Ok(ScanResult {
        max_locals: scanner.max_locals.max(1),
        max_spill: scanner.max_spill.max(6),
        call_sites: scanner.call_sites,
    })
}

struct Scanner {
    live_locals: usize,
    max_locals: usize,
    call_sites: usize,
    max_spill: usize,
}

impl Scanner {
    fn block(&mut self, block: &Block) -> Result<(), CompileError> {
        let snapshot = self.live_locals;
        for statement in &block.statements {
            self.statement(statement)?;
        }
        // Slots rewind on scope exit; siblings reuse them.
        self.live_locals = snapshot;
        Ok(())
    }

    fn declare(&mut self) {
        self.live_locals += 1;
        self.max_locals = self.max_locals.max(self.live_locals);
    }

    fn statement(&mut self, statement: &Statement) -> Result<(), CompileError> {
        match statement {
            Statement::Expression(e) => self.expression(e),
            Statement::Local { value, .. } => {
                if let Some(value) = value {
                    self.expression(value)?;
                }
                self.declare();
                Ok(())
            }
            Statement::If { arms, otherwise } => {
                for (condition, body) in arms {
                    self.expression(condition)?;
                    self.block(body)?;
                }
                if let Some(body) = otherwise {
                    self.block(body)?;
                }
                Ok(())
            }
            Statement::For {
                init,
                condition,
                step,
                body,
            } => {
                // The loop header is its own scope.
                let snapshot = self.live_locals;
                if let Some(init) = init {
                    self.statement(init)?;
                }
                if let Some(condition) = condition {
                    self.expression(condition)?;
                }
                if let Some(step) = step {
                    self.expression(step)?;
                }
                self.block(body)?;
                self.live_locals = snapshot;
                Ok(())
            }
            Statement::While { condition, body } => {
                self.expression(condition)?;
                self.block(body)
            }
            Statement::DoWhile { body, condition } => {
                self.block(body)?;
                self.expression(condition)
            }
            Statement::Switch { .. } => Err(CompileError::Unsupported(
                "switch statements".to_string(),
            )),
            Statement::ClassDeclaration { .. } => Err(CompileError::Unsupported(
                "class declarations".to_string(),
            )),
            Statement::Return(value) => {
                if let Some(value) = value {
                    self.expression(value)?;
                }
                Ok(())
            }
            Statement::Break | Statement::Continue => Ok(()),
            Statement::Block(block) => self.block(block),
            Statement::FunctionDeclaration { path, tag, .. } => {
                // The nested body is scanned by its own compilation; only
                // the binding affects this frame.
                use crate::ast::FunctionTag;
                if matches!(tag, FunctionTag::Basic | FunctionTag::BasicConstant) {
                    if path.len() != 1 {
                        return Err(CompileError::Unsupported(
                            "dotted local function declarations".to_string(),
                        ));
                    }
                    self.declare();
                }
                Ok(())
            }
        }
    }

    fn expression(&mut self, expression: &Expression) -> Result<(), CompileError> {
        let depth = self.spill_depth(expression, 0)?;
        self.max_spill = self.max_spill.max(depth);
        Ok(())
    }

    /// Spill cells live at once while evaluating `expression`, given
    /// `held` cells already pinned by enclosing evaluations.
    fn spill_depth(&mut self, expression: &Expression, held: usize) -> Result<usize, CompileError> {
        let depth = match expression {
            Expression::Null
            | Expression::Boolean(_)
            | Expression::Integer(_)
            | Expression::Number(_)
            | Expression::String(_)
            | Expression::Identifier(_)
            | Expression::FunctionLiteral(_) => held,

            Expression::Binary { lhs, rhs, .. } | Expression::Comparison { lhs, rhs, .. } => {
                let left = self.spill_depth(lhs, held)?;
                // The left result is spilled while the right evaluates.
                let right = self.spill_depth(rhs, held + 1)?;
                left.max(right)
            }
            Expression::LogicalOr { lhs, rhs } | Expression::LogicalAnd { lhs, rhs } => {
                // The left result stays spilled while the right evaluates.
                let left = self.spill_depth(lhs, held)?;
                let right = self.spill_depth(rhs, held + 1)?;
                left.max(right)
            }
            Expression::Unary { operand, .. } => self.spill_depth(operand, held)?,
            Expression::Ternary {
                condition,
                then,
                otherwise,
            } => {
                let c = self.spill_depth(condition, held)?;
                let t = self.spill_depth(then, held)?;
                let o = self.spill_depth(otherwise, held)?;
                c.max(t).max(o)
            }
            Expression::Assign { target, value }
            | Expression::CompoundAssign { target, value, .. } => {
                // Emission order: target pieces first, value last with the
                // target (and any key) still spilled.
                match &**target {
                    Expression::Identifier(_) => self.spill_depth(value, held)?,
                    Expression::Index {
                        target: base, key, ..
                    } => {
                        let t = self.spill_depth(base, held)?;
                        let k = self.spill_depth(key, held + 1)?;
                        let v = self.spill_depth(value, held + 2)?;
                        t.max(k).max(v)
                    }
                    Expression::Select { target: base, .. } => {
                        let t = self.spill_depth(base, held)?;
                        let v = self.spill_depth(value, held + 2)?;
                        t.max(v)
                    }
                    _ => {
                        return Err(CompileError::Unsupported(
                            "assignment target shape".to_string(),
                        ));
                    }
                }
            }
            Expression::PreIncrement(target)
            | Expression::PostIncrement(target)
            | Expression::PreDecrement(target)
            | Expression::PostDecrement(target) => self.assignable_depth(target, held)?,

            Expression::Index { target, key } => {
                // Target and key both stage in spill cells.
                let t = self.spill_depth(target, held)?;
                let k = self.spill_depth(key, held + 1)?;
                t.max(k).max(held + 2)
            }
            Expression::RangedIndex { target, from, to } => {
                let t = self.spill_depth(target, held)?;
                let f = self.spill_depth(from, held + 1)?;
                let o = self.spill_depth(to, held + 2)?;
                t.max(f).max(o)
            }
            Expression::Select { target, .. } => {
                self.spill_depth(target, held)?.max(held + 2)
            }

            Expression::Call { callee, args, span } | Expression::New {
                class: callee,
                args,
                span,
            } => {
                self.call_sites += 1;
                let implicit = matches!(
                    &**callee,
                    Expression::Select {
                        kind: crate::ast::SelectKind::Dot,
                        ..
                    }
                );
                let arity = args.len() + usize::from(implicit);
                if arity > DEFAULT_ARGUMENT_ALLOCATION {
                    return Err(CompileError::Unsupported(format!(
                        "more than {} call arguments (row {})",
                        DEFAULT_ARGUMENT_ALLOCATION, span.row
                    )));
                }
                let mut depth = held;
                for arg in args {
                    depth = depth.max(self.spill_depth(arg, held)?);
                }
                // Dot-calls evaluate the receiver through the target
                // expression; plain calls evaluate the callee after the
                // arguments.
                depth = depth.max(self.spill_depth(callee, held)?);
                depth
            }
            Expression::Table(entries) => {
                let mut depth = held + 1;
                for (_, value) in entries {
                    depth = depth.max(self.spill_depth(value, held + 1)?);
                }
                depth
            }
            Expression::Array(elements) => {
                let mut depth = held + 1;
                for element in elements {
                    depth = depth.max(self.spill_depth(element, held + 1)?);
                }
                depth
            }
        };
        Ok(depth)
    }

    /// Assignable positions hold their target pieces while the write
    /// happens.
    fn assignable_depth(
        &mut self,
        target: &Expression,
        held: usize,
    ) -> Result<usize, CompileError> {
        match target {
            Expression::Identifier(_) => Ok(held),
            Expression::Index { target, key } => {
                let t = self.spill_depth(target, held)?;
                let k = self.spill_depth(key, held + 1)?;
                Ok(t.max(k).max(held + 2))
            }
            Expression::Select { target, .. } => {
                Ok(self.spill_depth(target, held)?.max(held + 2))
            }
            _ => Err(CompileError::Unsupported(
                "assignment target shape".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::ScriptFunction;
    use crate::error::SourceOrigin;
    use crate::interner::Interner;
    use std::rc::Rc;

    fn scan_source(source: &str) -> Result<ScanResult, CompileError> {
        let block = crate::parser::parse(source, SourceOrigin::Immediate).unwrap();
        let mut interner = Interner::new();
        let function = ScriptFunction {
            params: vec![interner.intern("a"), interner.intern("b")],
            body: Rc::new(block),
        };
        scan(&function)
    }

    #[test]
    fn test_params_count_as_locals() {
        let result = scan_source("return a;").unwrap();
        assert_eq!(result.max_locals, 2);
    }

    #[test]
    fn test_sibling_scopes_reuse_slots() {
        let result = scan_source(
            "{ local x = 1; local y = 2; } { local z = 3; } return 0;",
        )
        .unwrap();
        // Two params plus the deepest block (two locals).
        assert_eq!(result.max_locals, 4);
    }

    #[test]
    fn test_loop_header_counts() {
        let result = scan_source("for (local i = 0; i < 3; i++) { local x = i; } return 0;")
            .unwrap();
        // Params + loop counter + body local.
        assert_eq!(result.max_locals, 4);
    }

    #[test]
    fn test_spill_floor_is_six() {
        let result = scan_source("return 1;").unwrap();
        assert!(result.max_spill >= 6);
    }

    #[test]
    fn test_deep_expression_raises_spill_bound() {
        let result =
            scan_source("return ((((((1+2)+3)+4)+5)+6)+7)+(1+(2+(3+(4+(5+(6+(7+8)))))));")
                .unwrap();
        assert!(result.max_spill >= 7);
    }

    #[test]
    fn test_call_sites_counted() {
        let result = scan_source("f(1); g(h(2)); return 0;").unwrap();
        assert_eq!(result.call_sites, 3);
    }

    #[test]
    fn test_switch_rejected() {
        let error = scan_source("switch (a) { default: }").unwrap_err();
        assert!(error.to_string().contains("switch"));
    }
}
