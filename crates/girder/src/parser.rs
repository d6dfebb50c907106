//! Recursive-Descent Parser
//!
//! Precedence, low to high: assignment family; ternary; logical or;
//! logical and; comparisons; bit-or/xor/and; shifts and modulus;
//! addition/subtraction; multiplication/division; exponent; unary;
//! call/index/selection. Ternary and assignment are right-associative;
//! exponent is right-associative; everything else associates left.

use crate::ast::{
    Block, ComparisonOp, Expression, FunctionLiteral, FunctionTag, SelectKind, Span, Statement,
    SwitchCase, TableKey, UnaryOp,
};
use crate::error::{SourceOrigin, SyntaxError};
use crate::lexer::{Lexer, source_line};
use crate::object::BinaryOp;
use crate::token::{Keyword, Separator, Token, TokenKind};
use std::rc::Rc;

/// Parse a complete program into its top-level block.
pub fn parse(source: &str, origin: SourceOrigin) -> Result<Block, SyntaxError> {
    let tokens = Lexer::new(source, origin.clone()).tokenize()?;
    let mut parser = Parser {
        source,
        origin,
        tokens,
        pos: 0,
    };
    parser.parse_program()
}

struct Parser<'a> {
    source: &'a str,
    origin: SourceOrigin,
    tokens: Vec<Token>,
    pos: usize,
}

impl<'a> Parser<'a> {
    // ------------------------------------------------------------------
    // Token plumbing
    // ------------------------------------------------------------------

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn advance(&mut self) -> Option<&Token> {
        let token = self.tokens.get(self.pos);
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn check_separator(&self, separator: Separator) -> bool {
        self.peek().is_some_and(|t| t.is_separator(separator))
    }

    fn check_keyword(&self, keyword: Keyword) -> bool {
        self.peek().is_some_and(|t| t.is_keyword(keyword))
    }

    fn eat_separator(&mut self, separator: Separator) -> bool {
        if self.check_separator(separator) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn eat_keyword(&mut self, keyword: Keyword) -> bool {
        if self.check_keyword(keyword) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_separator(
        &mut self,
        separator: Separator,
        what: &str,
    ) -> Result<(), SyntaxError> {
        if self.eat_separator(separator) {
            Ok(())
        } else {
            Err(self.error(format!("expected {}", what)))
        }
    }

    fn expect_identifier(&mut self, what: &str) -> Result<String, SyntaxError> {
        match self.peek().map(|t| t.kind.clone()) {
            Some(TokenKind::Identifier(name)) => {
                self.pos += 1;
                Ok(name)
            }
            _ => Err(self.error(format!("expected {}", what))),
        }
    }

    fn span(&self) -> Span {
        match self.peek().or_else(|| self.tokens.last()) {
            Some(token) => Span {
                row: token.row,
                column: token.column,
            },
            None => Span::default(),
        }
    }

    fn error(&self, message: impl Into<String>) -> SyntaxError {
        let (index, row, column) = match self.peek().or_else(|| self.tokens.last()) {
            Some(token) => (token.index, token.row, token.column),
            None => (self.source.len(), 1, 1),
        };
        SyntaxError {
            origin: self.origin.clone(),
            index,
            row,
            column,
            line: source_line(self.source, row),
            message: message.into(),
        }
    }

    // ------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------

    fn parse_program(&mut self) -> Result<Block, SyntaxError> {
        let mut statements = Vec::new();
        while !self.at_end() {
            statements.push(self.parse_statement()?);
        }
        Ok(Block::new(statements))
    }

    fn parse_statement(&mut self) -> Result<Statement, SyntaxError> {
        if self.check_keyword(Keyword::Local) || self.check_keyword(Keyword::Const) {
            return self.parse_declaration();
        }
        if self.check_keyword(Keyword::Function) {
            return self.parse_function_declaration(FunctionTag::Global);
        }
        if self.eat_keyword(Keyword::If) {
            return self.parse_if();
        }
        if self.eat_keyword(Keyword::For) {
            return self.parse_for();
        }
        if self.eat_keyword(Keyword::While) {
            let condition = self.parse_parenthesized()?;
            let body = self.parse_body()?;
            return Ok(Statement::While { condition, body });
        }
        if self.eat_keyword(Keyword::Do) {
            let body = self.parse_body()?;
            if !self.eat_keyword(Keyword::While) {
                return Err(self.error("expected 'while' after do body"));
            }
            let condition = self.parse_parenthesized()?;
            self.expect_separator(Separator::EndStatement, "';' after do-while")?;
            return Ok(Statement::DoWhile { body, condition });
        }
        if self.eat_keyword(Keyword::Switch) {
            return self.parse_switch();
        }
        if self.eat_keyword(Keyword::Class) {
            return self.parse_class();
        }
        if self.eat_keyword(Keyword::Return) {
            if self.eat_separator(Separator::EndStatement) {
                return Ok(Statement::Return(None));
            }
            let value = self.parse_expression()?;
            self.expect_separator(Separator::EndStatement, "';' after return value")?;
            return Ok(Statement::Return(Some(value)));
        }
        if self.eat_keyword(Keyword::Break) {
            self.expect_separator(Separator::EndStatement, "';' after break")?;
            return Ok(Statement::Break);
        }
        if self.eat_keyword(Keyword::Continue) {
            self.expect_separator(Separator::EndStatement, "';' after continue")?;
            return Ok(Statement::Continue);
        }
        if self.check_separator(Separator::ScopeOpen) {
            return Ok(Statement::Block(self.parse_block()?));
        }

        let expression = self.parse_expression()?;
        self.expect_separator(Separator::EndStatement, "';' after expression")?;
        Ok(Statement::Expression(expression))
    }

    /// `local x`, `local const x`, `local function f`, `const function f`,
    /// `local const function f`.
    fn parse_declaration(&mut self) -> Result<Statement, SyntaxError> {
        let local = self.eat_keyword(Keyword::Local);
        let constant = self.eat_keyword(Keyword::Const);

        if self.check_keyword(Keyword::Function) {
            let tag = match (local, constant) {
                (true, false) => FunctionTag::Basic,
                (true, true) => FunctionTag::BasicConstant,
                (false, true) => FunctionTag::GlobalConstant,
                (false, false) => FunctionTag::Global,
            };
            return self.parse_function_declaration(tag);
        }
        if !local {
            return Err(self.error("expected 'function' after 'const'"));
        }

        let name = self.expect_identifier("identifier after 'local'")?;
        let value = if self.eat_separator(Separator::Assignment) {
            Some(self.parse_expression()?)
        } else {
            None
        };
        self.expect_separator(Separator::EndStatement, "';' after declaration")?;
        Ok(Statement::Local {
            name,
            constant,
            value,
        })
    }

    /// `function name.path(params) { ... }`
    fn parse_function_declaration(&mut self, tag: FunctionTag) -> Result<Statement, SyntaxError> {
        let span = self.span();
        self.eat_keyword(Keyword::Function);

        let mut path = vec![self.expect_identifier("function name")?];
        while self.eat_separator(Separator::Dot) {
            path.push(self.expect_identifier("name after '.'")?);
        }

        let params = self.parse_parameter_list()?;
        let body = self.parse_block()?;
        let function = Rc::new(FunctionLiteral::new(path.join("."), params, body, span));
        Ok(Statement::FunctionDeclaration {
            path,
            tag,
            function,
        })
    }

    fn parse_parameter_list(&mut self) -> Result<Vec<String>, SyntaxError> {
        self.expect_separator(Separator::GroupOpen, "'(' before parameters")?;
        let mut params = Vec::new();
        if !self.check_separator(Separator::GroupClose) {
            loop {
                params.push(self.expect_identifier("parameter name")?);
                if !self.eat_separator(Separator::List) {
                    break;
                }
            }
        }
        self.expect_separator(Separator::GroupClose, "')' after parameters")?;
        Ok(params)
    }

    fn parse_if(&mut self) -> Result<Statement, SyntaxError> {
        let mut arms = Vec::new();
        let condition = self.parse_parenthesized()?;
        let body = self.parse_body()?;
        arms.push((condition, body));

        let mut otherwise = None;
        while self.eat_keyword(Keyword::Else) {
            if self.eat_keyword(Keyword::If) {
                let condition = self.parse_parenthesized()?;
                let body = self.parse_body()?;
                arms.push((condition, body));
            } else {
                otherwise = Some(self.parse_body()?);
                break;
            }
        }
        Ok(Statement::If { arms, otherwise })
    }

    fn parse_for(&mut self) -> Result<Statement, SyntaxError> {
        self.expect_separator(Separator::GroupOpen, "'(' after 'for'")?;

        let init = if self.eat_separator(Separator::EndStatement) {
            None
        } else if self.check_keyword(Keyword::Local) {
            // parse_declaration consumes the trailing ';'.
            Some(Box::new(self.parse_declaration()?))
        } else {
            let expression = self.parse_expression()?;
            self.expect_separator(Separator::EndStatement, "';' after for-init")?;
            Some(Box::new(Statement::Expression(expression)))
        };

        let condition = if self.eat_separator(Separator::EndStatement) {
            None
        } else {
            let expression = self.parse_expression()?;
            self.expect_separator(Separator::EndStatement, "';' after for-condition")?;
            Some(expression)
        };

        let step = if self.check_separator(Separator::GroupClose) {
            None
        } else {
            Some(self.parse_expression()?)
        };
        self.expect_separator(Separator::GroupClose, "')' after for-iterator")?;

        let body = self.parse_body()?;
        Ok(Statement::For {
            init,
            condition,
            step,
            body,
        })
    }

    fn parse_switch(&mut self) -> Result<Statement, SyntaxError> {
        let subject = self.parse_parenthesized()?;
        self.expect_separator(Separator::ScopeOpen, "'{' after switch subject")?;

        let mut cases: Vec<SwitchCase> = Vec::new();
        let mut default = None;
        while !self.eat_separator(Separator::ScopeClose) {
            if self.eat_keyword(Keyword::Case) {
                let mut matches = vec![self.parse_expression()?];
                self.expect_separator(Separator::Seek, "':' after case value")?;
                // Empty cases group with the next one.
                while self.eat_keyword(Keyword::Case) {
                    matches.push(self.parse_expression()?);
                    self.expect_separator(Separator::Seek, "':' after case value")?;
                }
                let body = self.parse_case_body()?;
                cases.push(SwitchCase { matches, body });
            } else if self.eat_keyword(Keyword::Default) {
                self.expect_separator(Separator::Seek, "':' after 'default'")?;
                default = Some(self.parse_case_body()?);
            } else {
                return Err(self.error("expected 'case', 'default', or '}' in switch"));
            }
        }
        Ok(Statement::Switch {
            subject,
            cases,
            default,
        })
    }

    fn parse_case_body(&mut self) -> Result<Block, SyntaxError> {
        let mut statements = Vec::new();
        while !self.at_end()
            && !self.check_keyword(Keyword::Case)
            && !self.check_keyword(Keyword::Default)
            && !self.check_separator(Separator::ScopeClose)
        {
            statements.push(self.parse_statement()?);
        }
        Ok(Block::new(statements))
    }

    fn parse_class(&mut self) -> Result<Statement, SyntaxError> {
        let name = self.expect_identifier("class name")?;
        self.expect_separator(Separator::ScopeOpen, "'{' after class name")?;
        let mut members = Vec::new();
        while !self.eat_separator(Separator::ScopeClose) {
            match self.parse_function_declaration(FunctionTag::Basic)? {
                Statement::FunctionDeclaration { function, .. } => members.push(function),
                _ => unreachable!("parse_function_declaration yields declarations"),
            }
        }
        Ok(Statement::ClassDeclaration { name, members })
    }

    fn parse_parenthesized(&mut self) -> Result<Expression, SyntaxError> {
        self.expect_separator(Separator::GroupOpen, "'('")?;
        let expression = self.parse_expression()?;
        self.expect_separator(Separator::GroupClose, "')'")?;
        Ok(expression)
    }

    /// A control-structure body: a block, or a single statement.
    fn parse_body(&mut self) -> Result<Block, SyntaxError> {
        if self.check_separator(Separator::ScopeOpen) {
            self.parse_block()
        } else {
            Ok(Block::new(vec![self.parse_statement()?]))
        }
    }

    fn parse_block(&mut self) -> Result<Block, SyntaxError> {
        self.expect_separator(Separator::ScopeOpen, "'{'")?;
        let mut statements = Vec::new();
        while !self.eat_separator(Separator::ScopeClose) {
            if self.at_end() {
                return Err(self.error("unterminated block"));
            }
            statements.push(self.parse_statement()?);
        }
        Ok(Block::new(statements))
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    fn parse_expression(&mut self) -> Result<Expression, SyntaxError> {
        self.parse_assignment()
    }

    fn parse_assignment(&mut self) -> Result<Expression, SyntaxError> {
        let target = self.parse_ternary()?;

        let compound = |op| Some(op);
        let op = match self.peek().map(|t| &t.kind) {
            Some(TokenKind::Separator(Separator::Assignment)) => None,
            Some(TokenKind::Separator(Separator::AdditionAssignment)) => compound(BinaryOp::Add),
            Some(TokenKind::Separator(Separator::SubtractionAssignment)) => compound(BinaryOp::Sub),
            Some(TokenKind::Separator(Separator::MultiplicationAssignment)) => {
                compound(BinaryOp::Mul)
            }
            Some(TokenKind::Separator(Separator::DivisionAssignment)) => compound(BinaryOp::Div),
            Some(TokenKind::Separator(Separator::ModulusAssignment)) => compound(BinaryOp::Mod),
            Some(TokenKind::Separator(Separator::ExponentAssignment)) => compound(BinaryOp::Pow),
            Some(TokenKind::Separator(Separator::BitwiseOrAssignment)) => compound(BinaryOp::BitOr),
            Some(TokenKind::Separator(Separator::BitwiseXorAssignment)) => {
                compound(BinaryOp::BitXor)
            }
            Some(TokenKind::Separator(Separator::BitwiseAndAssignment)) => {
                compound(BinaryOp::BitAnd)
            }
            Some(TokenKind::Separator(Separator::ShiftLeftAssignment)) => compound(BinaryOp::Shl),
            Some(TokenKind::Separator(Separator::ShiftRightAssignment)) => compound(BinaryOp::Shr),
            _ => return Ok(target),
        };

        if !target.is_assignable() {
            return Err(self.error("left side of assignment is not assignable"));
        }
        self.pos += 1;
        // Right-associative: `a = b = c` assigns through.
        let value = self.parse_assignment()?;
        Ok(match op {
            None => Expression::Assign {
                target: Box::new(target),
                value: Box::new(value),
            },
            Some(op) => Expression::CompoundAssign {
                op,
                target: Box::new(target),
                value: Box::new(value),
            },
        })
    }

    fn parse_ternary(&mut self) -> Result<Expression, SyntaxError> {
        let condition = self.parse_logical_or()?;
        if !self.eat_separator(Separator::Ternary) {
            return Ok(condition);
        }
        let then = self.parse_ternary()?;
        self.expect_separator(Separator::Seek, "':' in ternary")?;
        let otherwise = self.parse_ternary()?;
        Ok(Expression::Ternary {
            condition: Box::new(condition),
            then: Box::new(then),
            otherwise: Box::new(otherwise),
        })
    }

    fn parse_logical_or(&mut self) -> Result<Expression, SyntaxError> {
        let mut lhs = self.parse_logical_and()?;
        while self.eat_separator(Separator::LogicalOr) {
            let rhs = self.parse_logical_and()?;
            lhs = Expression::LogicalOr {
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn parse_logical_and(&mut self) -> Result<Expression, SyntaxError> {
        let mut lhs = self.parse_comparison()?;
        while self.eat_separator(Separator::LogicalAnd) {
            let rhs = self.parse_comparison()?;
            lhs = Expression::LogicalAnd {
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn parse_comparison(&mut self) -> Result<Expression, SyntaxError> {
        let mut lhs = self.parse_bitwise()?;
        loop {
            let op = match self.peek().map(|t| &t.kind) {
                Some(TokenKind::Separator(Separator::Equality)) => ComparisonOp::Eq,
                Some(TokenKind::Separator(Separator::InverseEquality)) => ComparisonOp::Ne,
                Some(TokenKind::Separator(Separator::Lesser)) => ComparisonOp::Lt,
                Some(TokenKind::Separator(Separator::LesserEquality)) => ComparisonOp::Le,
                Some(TokenKind::Separator(Separator::Greater)) => ComparisonOp::Gt,
                Some(TokenKind::Separator(Separator::GreaterEquality)) => ComparisonOp::Ge,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.parse_bitwise()?;
            lhs = Expression::Comparison {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
    }

    fn parse_bitwise(&mut self) -> Result<Expression, SyntaxError> {
        let mut lhs = self.parse_shift()?;
        loop {
            let op = match self.peek().map(|t| &t.kind) {
                Some(TokenKind::Separator(Separator::BitwiseOr)) => BinaryOp::BitOr,
                Some(TokenKind::Separator(Separator::BitwiseXor)) => BinaryOp::BitXor,
                Some(TokenKind::Separator(Separator::BitwiseAnd)) => BinaryOp::BitAnd,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.parse_shift()?;
            lhs = Expression::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
    }

    fn parse_shift(&mut self) -> Result<Expression, SyntaxError> {
        let mut lhs = self.parse_additive()?;
        loop {
            let op = match self.peek().map(|t| &t.kind) {
                Some(TokenKind::Separator(Separator::ShiftLeft)) => BinaryOp::Shl,
                Some(TokenKind::Separator(Separator::ShiftRight)) => BinaryOp::Shr,
                Some(TokenKind::Separator(Separator::Modulus)) => BinaryOp::Mod,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.parse_additive()?;
            lhs = Expression::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
    }

    fn parse_additive(&mut self) -> Result<Expression, SyntaxError> {
        let mut lhs = self.parse_multiplicative()?;
        loop {
            let op = match self.peek().map(|t| &t.kind) {
                Some(TokenKind::Separator(Separator::Addition)) => BinaryOp::Add,
                Some(TokenKind::Separator(Separator::Subtraction)) => BinaryOp::Sub,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.parse_multiplicative()?;
            lhs = Expression::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
    }

    fn parse_multiplicative(&mut self) -> Result<Expression, SyntaxError> {
        let mut lhs = self.parse_exponent()?;
        loop {
            let op = match self.peek().map(|t| &t.kind) {
                Some(TokenKind::Separator(Separator::Multiplication)) => BinaryOp::Mul,
                Some(TokenKind::Separator(Separator::Division)) => BinaryOp::Div,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.parse_exponent()?;
            lhs = Expression::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
    }

    fn parse_exponent(&mut self) -> Result<Expression, SyntaxError> {
        let lhs = self.parse_unary()?;
        if self.eat_separator(Separator::Exponent) {
            // Right-associative.
            let rhs = self.parse_exponent()?;
            return Ok(Expression::Binary {
                op: BinaryOp::Pow,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            });
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expression, SyntaxError> {
        if self.eat_separator(Separator::LogicalNot) {
            let operand = self.parse_unary()?;
            return Ok(Expression::Unary {
                op: UnaryOp::Not,
                operand: Box::new(operand),
            });
        }
        if self.eat_separator(Separator::BitwiseNot) {
            let operand = self.parse_unary()?;
            return Ok(Expression::Unary {
                op: UnaryOp::BitNot,
                operand: Box::new(operand),
            });
        }
        if self.eat_separator(Separator::Length) {
            let operand = self.parse_unary()?;
            return Ok(Expression::Unary {
                op: UnaryOp::Length,
                operand: Box::new(operand),
            });
        }
        if self.eat_keyword(Keyword::TypeOf) {
            let operand = self.parse_unary()?;
            return Ok(Expression::Unary {
                op: UnaryOp::TypeOf,
                operand: Box::new(operand),
            });
        }
        if self.eat_separator(Separator::Subtraction) {
            // Unary minus desugars to subtraction from integer zero.
            let operand = self.parse_unary()?;
            return Ok(Expression::Binary {
                op: BinaryOp::Sub,
                lhs: Box::new(Expression::Integer(0)),
                rhs: Box::new(operand),
            });
        }
        if self.eat_separator(Separator::Increment) {
            let operand = self.parse_unary()?;
            self.require_assignable(&operand, "'++'")?;
            return Ok(Expression::PreIncrement(Box::new(operand)));
        }
        if self.eat_separator(Separator::Decrement) {
            let operand = self.parse_unary()?;
            self.require_assignable(&operand, "'--'")?;
            return Ok(Expression::PreDecrement(Box::new(operand)));
        }
        if self.check_separator(Separator::NewObject) {
            let span = self.span();
            self.pos += 1;
            let target = self.parse_postfix()?;
            return match target {
                Expression::Call { callee, args, .. } => Ok(Expression::New {
                    class: callee,
                    args,
                    span,
                }),
                _ => Err(self.error("expected constructor call after 'new'")),
            };
        }
        self.parse_postfix()
    }

    fn require_assignable(
        &self,
        expression: &Expression,
        what: &str,
    ) -> Result<(), SyntaxError> {
        if expression.is_assignable() {
            Ok(())
        } else {
            Err(self.error(format!("operand of {} is not assignable", what)))
        }
    }

    fn parse_postfix(&mut self) -> Result<Expression, SyntaxError> {
        let mut expression = self.parse_primary()?;
        loop {
            if self.check_separator(Separator::GroupOpen) {
                let span = self.span();
                let args = self.parse_argument_list()?;
                expression = Expression::Call {
                    callee: Box::new(expression),
                    args,
                    span,
                };
            } else if self.eat_separator(Separator::SelectorOpen) {
                let first = self.parse_expression()?;
                if self.eat_separator(Separator::Seek) {
                    let to = self.parse_expression()?;
                    self.expect_separator(Separator::SelectorClose, "']' after slice")?;
                    expression = Expression::RangedIndex {
                        target: Box::new(expression),
                        from: Box::new(first),
                        to: Box::new(to),
                    };
                } else {
                    self.expect_separator(Separator::SelectorClose, "']' after index")?;
                    expression = Expression::Index {
                        target: Box::new(expression),
                        key: Box::new(first),
                    };
                }
            } else if self.eat_separator(Separator::Dot) {
                let key = self.expect_identifier("name after '.'")?;
                expression = Expression::Select {
                    kind: SelectKind::Dot,
                    target: Box::new(expression),
                    key,
                };
            } else if self.eat_separator(Separator::NamespaceIndex) {
                let key = self.expect_identifier("name after '::'")?;
                expression = Expression::Select {
                    kind: SelectKind::Namespace,
                    target: Box::new(expression),
                    key,
                };
            } else if self.eat_separator(Separator::Direct) {
                let key = self.expect_identifier("name after '->'")?;
                expression = Expression::Select {
                    kind: SelectKind::Direct,
                    target: Box::new(expression),
                    key,
                };
            } else if self.check_separator(Separator::Increment) {
                self.require_assignable(&expression, "'++'")?;
                self.pos += 1;
                expression = Expression::PostIncrement(Box::new(expression));
            } else if self.check_separator(Separator::Decrement) {
                self.require_assignable(&expression, "'--'")?;
                self.pos += 1;
                expression = Expression::PostDecrement(Box::new(expression));
            } else {
                return Ok(expression);
            }
        }
    }

    fn parse_argument_list(&mut self) -> Result<Vec<Expression>, SyntaxError> {
        self.expect_separator(Separator::GroupOpen, "'('")?;
        let mut args = Vec::new();
        if !self.check_separator(Separator::GroupClose) {
            loop {
                args.push(self.parse_expression()?);
                if !self.eat_separator(Separator::List) {
                    break;
                }
            }
        }
        self.expect_separator(Separator::GroupClose, "')' after arguments")?;
        Ok(args)
    }

    fn parse_primary(&mut self) -> Result<Expression, SyntaxError> {
        let Some(token) = self.peek() else {
            return Err(self.error("expected expression"));
        };
        let kind = token.kind.clone();
        match kind {
            TokenKind::Keyword(Keyword::LiteralNull) => {
                self.pos += 1;
                Ok(Expression::Null)
            }
            TokenKind::Keyword(Keyword::LiteralTrue) => {
                self.pos += 1;
                Ok(Expression::Boolean(true))
            }
            TokenKind::Keyword(Keyword::LiteralFalse) => {
                self.pos += 1;
                Ok(Expression::Boolean(false))
            }
            TokenKind::Integer(value) => {
                self.pos += 1;
                Ok(Expression::Integer(value))
            }
            TokenKind::Number(value) => {
                self.pos += 1;
                Ok(Expression::Number(value))
            }
            TokenKind::StringLiteral(value) => {
                self.pos += 1;
                Ok(Expression::String(value))
            }
            TokenKind::Identifier(name) => {
                self.pos += 1;
                Ok(Expression::Identifier(name))
            }
            TokenKind::Keyword(Keyword::Function) => self.parse_function_literal(),
            TokenKind::Separator(Separator::GroupOpen) => {
                self.pos += 1;
                let expression = self.parse_expression()?;
                self.expect_separator(Separator::GroupClose, "')'")?;
                Ok(expression)
            }
            TokenKind::Separator(Separator::ScopeOpen) => self.parse_table_literal(),
            TokenKind::Separator(Separator::SelectorOpen) => self.parse_array_literal(),
            _ => Err(self.error("expected expression")),
        }
    }

    /// `function (params) { ... }` in expression position.
    fn parse_function_literal(&mut self) -> Result<Expression, SyntaxError> {
        let span = self.span();
        self.eat_keyword(Keyword::Function);
        let params = self.parse_parameter_list()?;
        let body = self.parse_block()?;
        Ok(Expression::FunctionLiteral(Rc::new(FunctionLiteral::new(
            "<anonymous>",
            params,
            body,
            span,
        ))))
    }

    /// `{ k = v, "s" = v, ... }`
    fn parse_table_literal(&mut self) -> Result<Expression, SyntaxError> {
        self.expect_separator(Separator::ScopeOpen, "'{'")?;
        let mut entries = Vec::new();
        if !self.check_separator(Separator::ScopeClose) {
            loop {
                let key = match self.peek().map(|t| t.kind.clone()) {
                    Some(TokenKind::Identifier(name)) => {
                        self.pos += 1;
                        TableKey::Identifier(name)
                    }
                    Some(TokenKind::StringLiteral(text)) => {
                        self.pos += 1;
                        TableKey::String(text)
                    }
                    _ => return Err(self.error("expected table key")),
                };
                self.expect_separator(Separator::Assignment, "'=' after table key")?;
                let value = self.parse_expression()?;
                entries.push((key, value));
                if !self.eat_separator(Separator::List) {
                    break;
                }
            }
        }
        self.expect_separator(Separator::ScopeClose, "'}' after table entries")?;
        Ok(Expression::Table(entries))
    }

    /// `[ v, ... ]`
    fn parse_array_literal(&mut self) -> Result<Expression, SyntaxError> {
        self.expect_separator(Separator::SelectorOpen, "'['")?;
        let mut elements = Vec::new();
        if !self.check_separator(Separator::SelectorClose) {
            loop {
                elements.push(self.parse_expression()?);
                if !self.eat_separator(Separator::List) {
                    break;
                }
            }
        }
        self.expect_separator(Separator::SelectorClose, "']' after array elements")?;
        Ok(Expression::Array(elements))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(source: &str) -> Block {
        parse(source, SourceOrigin::Immediate).unwrap()
    }

    fn single_expression(source: &str) -> Expression {
        let block = parse_ok(source);
        match block.statements.into_iter().next() {
            Some(Statement::Expression(e)) | Some(Statement::Return(Some(e))) => e,
            other => panic!("expected expression statement, got {:?}", other),
        }
    }

    #[test]
    fn test_precedence_mul_over_add() {
        let e = single_expression("return 2 + 3 * 4;");
        match e {
            Expression::Binary {
                op: BinaryOp::Add,
                rhs,
                ..
            } => {
                assert!(matches!(
                    *rhs,
                    Expression::Binary {
                        op: BinaryOp::Mul,
                        ..
                    }
                ));
            }
            other => panic!("expected addition at the root, got {:?}", other),
        }
    }

    #[test]
    fn test_exponent_right_associative() {
        let e = single_expression("2 ^ 3 ^ 2;");
        match e {
            Expression::Binary {
                op: BinaryOp::Pow,
                lhs,
                rhs,
            } => {
                assert!(matches!(*lhs, Expression::Integer(2)));
                assert!(matches!(
                    *rhs,
                    Expression::Binary {
                        op: BinaryOp::Pow,
                        ..
                    }
                ));
            }
            other => panic!("expected exponent at the root, got {:?}", other),
        }
    }

    #[test]
    fn test_ternary_right_associative() {
        let e = single_expression("a ? 1 : b ? 2 : 3;");
        match e {
            Expression::Ternary { otherwise, .. } => {
                assert!(matches!(*otherwise, Expression::Ternary { .. }));
            }
            other => panic!("expected ternary, got {:?}", other),
        }
    }

    #[test]
    fn test_assignment_requires_assignable() {
        let error = parse("1 = 2;", SourceOrigin::Immediate).unwrap_err();
        assert!(error.message.contains("not assignable"));
    }

    #[test]
    fn test_compound_assignment() {
        let e = single_expression("x += 2;");
        assert!(matches!(
            e,
            Expression::CompoundAssign {
                op: BinaryOp::Add,
                ..
            }
        ));
    }

    #[test]
    fn test_local_declaration() {
        let block = parse_ok("local x = 1;");
        assert!(matches!(
            &block.statements[0],
            Statement::Local {
                name,
                constant: false,
                value: Some(_)
            } if name == "x"
        ));
    }

    #[test]
    fn test_if_else_chain() {
        let block = parse_ok("if (a) { } else if (b) { } else { }");
        match &block.statements[0] {
            Statement::If { arms, otherwise } => {
                assert_eq!(arms.len(), 2);
                assert!(otherwise.is_some());
            }
            other => panic!("expected if, got {:?}", other),
        }
    }

    #[test]
    fn test_for_loop_shape() {
        let block = parse_ok("for (local i = 1; i <= 3; i = i + 1) { }");
        match &block.statements[0] {
            Statement::For {
                init,
                condition,
                step,
                ..
            } => {
                assert!(init.is_some());
                assert!(condition.is_some());
                assert!(step.is_some());
            }
            other => panic!("expected for, got {:?}", other),
        }
    }

    #[test]
    fn test_function_declaration_path_and_tags() {
        let block = parse_ok("function a.b(x) { return x; }");
        match &block.statements[0] {
            Statement::FunctionDeclaration { path, tag, function } => {
                assert_eq!(path, &vec!["a".to_string(), "b".to_string()]);
                assert_eq!(*tag, FunctionTag::Global);
                assert_eq!(function.params, vec!["x".to_string()]);
            }
            other => panic!("expected function declaration, got {:?}", other),
        }

        let block = parse_ok("local function f() { }");
        assert!(matches!(
            &block.statements[0],
            Statement::FunctionDeclaration {
                tag: FunctionTag::Basic,
                ..
            }
        ));

        let block = parse_ok("const function f() { }");
        assert!(matches!(
            &block.statements[0],
            Statement::FunctionDeclaration {
                tag: FunctionTag::GlobalConstant,
                ..
            }
        ));
    }

    #[test]
    fn test_table_and_array_literals() {
        let block = parse_ok("t = { greet = 1, \"two\" = 2 };");
        match &block.statements[0] {
            Statement::Expression(Expression::Assign { value, .. }) => {
                assert!(matches!(**value, Expression::Table(ref entries) if entries.len() == 2));
            }
            other => panic!("expected table assignment, got {:?}", other),
        }

        let e = single_expression("[10, 20, 30];");
        assert!(matches!(e, Expression::Array(ref elements) if elements.len() == 3));
    }

    #[test]
    fn test_dot_call_and_slicing() {
        let e = single_expression("t.greet(\"bo\");");
        match e {
            Expression::Call { callee, args, .. } => {
                assert_eq!(args.len(), 1);
                assert!(matches!(
                    *callee,
                    Expression::Select {
                        kind: SelectKind::Dot,
                        ..
                    }
                ));
            }
            other => panic!("expected call, got {:?}", other),
        }

        let e = single_expression("a[1:3];");
        assert!(matches!(e, Expression::RangedIndex { .. }));
        let e = single_expression("a[1];");
        assert!(matches!(e, Expression::Index { .. }));
    }

    #[test]
    fn test_new_expression() {
        let e = single_expression("new Regex(\"a+\");");
        match e {
            Expression::New { class, args, .. } => {
                assert!(matches!(*class, Expression::Identifier(ref n) if n == "Regex"));
                assert_eq!(args.len(), 1);
            }
            other => panic!("expected new, got {:?}", other),
        }
    }

    #[test]
    fn test_switch_with_grouped_cases() {
        let block = parse_ok(
            "switch (x) { case 1: case 2: y = 1; break; default: y = 3; }",
        );
        match &block.statements[0] {
            Statement::Switch { cases, default, .. } => {
                assert_eq!(cases.len(), 1);
                assert_eq!(cases[0].matches.len(), 2);
                assert!(default.is_some());
            }
            other => panic!("expected switch, got {:?}", other),
        }
    }

    #[test]
    fn test_unary_minus_desugars() {
        let e = single_expression("-x;");
        assert!(matches!(
            e,
            Expression::Binary {
                op: BinaryOp::Sub,
                ..
            }
        ));
    }

    #[test]
    fn test_word_operators_parse() {
        let e = single_expression("a and b or not c;");
        assert!(matches!(e, Expression::LogicalOr { .. }));
    }

    #[test]
    fn test_postfix_increment() {
        let e = single_expression("x++;");
        assert!(matches!(e, Expression::PostIncrement(_)));
        let e = single_expression("++x;");
        assert!(matches!(e, Expression::PreIncrement(_)));
    }

    #[test]
    fn test_syntax_error_carries_position() {
        let error = parse("local = 5;", SourceOrigin::Immediate).unwrap_err();
        assert_eq!(error.row, 1);
        assert!(error.line.contains("local = 5;"));
    }
}
