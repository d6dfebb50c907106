//! Statement and Control-Flow Pass
//!
//! Owns function emission: prologue (frame setup, local zeroing, logical
//! frame-node link, parameter copy-in), the statement walk, the unwind
//! cascade appendix, and the epilogue. If-chains share one end label per
//! chain; loops push a (continue, break) label pair; `return` writes the
//! return slot, dereferences the whole locals stack, and jumps to the
//! epilogue.

use super::frame::LoopLabels;
use super::jit::entry_symbol;
use super::{CodeGen, PassControl};
use crate::ast::{Block, Expression, FunctionTag, Statement};
use crate::environment::ScriptFunction;
use crate::error::CompileError;
use crate::ffi;
use crate::value::ValueKind;
use std::fmt::Write;
use std::rc::Rc;

impl CodeGen<'_> {
    pub(super) fn emit_function(
        &mut self,
        function: &Rc<ScriptFunction>,
    ) -> Result<String, CompileError> {
        let symbol = entry_symbol(self.fn_id);
        self.asm.directive(".text");
        self.asm.directive(&format!(".globl {}", symbol));
        self.asm.directive(".p2align 4");
        self.asm.bind(&symbol);

        self.emit_prologue(function);

        // Function scope: parameters live in the first slots.
        let unwind = self.asm.fresh_label("unwind_fn");
        self.frame.push_scope(unwind);
        for param in &function.params {
            let slot = self.frame.define_local(param.as_str());
            debug_assert!(slot < function.params.len());
        }

        let body = Rc::clone(&function.body);
        for statement in &body.statements {
            self.emit_statement(statement)?;
        }

        // Default return path: null result.
        self.asm.note("implicit null return");
        self.asm.ins("movq $0, (%r12)");
        self.asm.ins("movq $0, 8(%r12)");
        self.exit_scope_via_epilogue();

        self.emit_epilogue();
        let appendix = std::mem::take(&mut self.appendix);
        self.asm.append_raw(&appendix);

        debug_assert_eq!(self.site_counter, self.scan.call_sites);
        Ok(std::mem::replace(&mut self.asm, super::asm::Asm::new()).finish())
    }

    fn emit_prologue(&mut self, function: &Rc<ScriptFunction>) {
        let frame_size = self.frame.frame_size();
        let locals_cells = self.frame.locals_cells();
        let node = self.frame.frame_node_offset();

        self.asm.ins("push %rbp");
        self.asm.ins("push %rbx");
        self.asm.ins("push %r12");
        self.asm.ins("push %r13");
        self.asm.ins("push %r14");
        self.asm.ins("push %r15");
        self.asm.ins_note("mov %rdi, %r12", "ret slot");
        self.asm.ins_note("mov %rsi, %r13", "environment");
        self.asm.ins(&format!("sub ${}, %rsp", frame_size));

        // Null-initialize the locals stack.
        self.asm.ins("lea 0(%rsp), %rdi");
        self.asm.ins(&format!("mov ${}, %ecx", locals_cells * 2));
        self.asm.ins("xor %eax, %eax");
        self.asm.ins("rep stosq");

        // Link the logical call-chain node (girder frame link).
        self.asm.note("girder frame link");
        self.asm.ins("mov 24(%r13), %rax");
        self.asm.ins(&format!("mov %rax, {}(%rsp)", node));
        self.asm.ins("lea 0(%rsp), %rax");
        self.asm.ins(&format!("mov %rax, {}(%rsp)", node + 8));
        self.asm
            .ins(&format!("movq ${}, {}(%rsp)", locals_cells, node + 16));
        self.asm
            .ins(&format!("movq ${}, {}(%rsp)", self.fn_id, node + 24));
        self.asm.ins(&format!("lea {}(%rsp), %rax", node));
        self.asm.ins("mov %rax, 24(%r13)");

        // Copy arguments into the parameter slots; missing ones stay
        // null. Each copy moves the whole cell through the transfer
        // register, then takes its own reference.
        for (i, param) in function.params.iter().enumerate() {
            let skip = self.asm.fresh_label("param_skip");
            let offset = self.frame.local_offset(i);
            self.asm.note(&format!("parameter \"{}\"", param.as_str()));
            self.asm.ins("mov 0(%r13), %rax");
            self.asm.ins("mov 8(%r13), %rcx");
            self.asm.ins(&format!("cmp ${}, %rcx", i));
            self.asm.ins(&format!("jbe {}", skip));
            self.asm.ins(&format!("movdqu {}(%rax), %xmm0", i * 16));
            self.asm.ins(&format!("movdqa %xmm0, {}(%rsp)", offset));
            self.emit_ref_cell(offset);
            self.asm.bind(&skip);
        }
    }

    fn emit_epilogue(&mut self) {
        let node = self.frame.frame_node_offset();
        self.asm.bind(".Lepilogue");
        self.asm.note("girder frame unlink");
        self.asm.ins(&format!("mov {}(%rsp), %rax", node));
        self.asm.ins("mov %rax, 24(%r13)");
        self.asm
            .ins(&format!("add ${}, %rsp", self.frame.frame_size()));
        self.asm.ins("pop %r15");
        self.asm.ins("pop %r14");
        self.asm.ins("pop %r13");
        self.asm.ins("pop %r12");
        self.asm.ins("pop %rbx");
        self.asm.ins("pop %rbp");
        self.asm.ins("ret");
    }

    // ------------------------------------------------------------------
    // Scopes
    // ------------------------------------------------------------------

    fn enter_scope(&mut self) {
        let unwind = self.asm.fresh_label("unwind");
        self.frame.push_scope(unwind);
    }

    /// Normal scope exit: dereference the scope's slot range and write its
    /// unwind cascade block into the appendix.
    fn exit_scope(&mut self) {
        let parent = self
            .frame
            .parent_unwind_label()
            .map(str::to_string)
            .unwrap_or_else(|| ".Lepilogue".to_string());
        let (base, count, label) = self.frame.pop_scope();
        self.emit_block_dereference(base, count);
        self.append_cascade(&label, base, count, &parent);
    }

    /// Scope exit on the implicit-return path: the cascade block is still
    /// required, but the inline dereference falls through to the epilogue
    /// with the full locals stack released.
    fn exit_scope_via_epilogue(&mut self) {
        let (base, count, label) = self.frame.pop_scope();
        self.emit_block_dereference(base, count);
        self.append_cascade(&label, base, count, ".Lepilogue");
    }

    fn append_cascade(&mut self, label: &str, base: usize, count: usize, parent: &str) {
        let mut block = String::new();
        let _ = writeln!(block, "{}:", label);
        if count > 0 {
            let _ = writeln!(block, "    lea {}(%rsp), %rdi", base * 16);
            let _ = writeln!(block, "    mov ${}, %esi", count);
            let _ = writeln!(
                block,
                "    movabs ${:#x}, %rax                    # girder_rt_block_dereference",
                ffi::girder_rt_block_dereference as usize as u64
            );
            let _ = writeln!(block, "    call *%rax");
        }
        let _ = writeln!(block, "    jmp {}", parent);
        self.appendix.push_str(&block);
    }

    /// `girder_rt_block_dereference(base, count)` over a slot range.
    fn emit_block_dereference(&mut self, base: usize, count: usize) {
        if count == 0 {
            return;
        }
        self.asm
            .ins(&format!("lea {}(%rsp), %rdi", self.frame.local_offset(base)));
        self.asm.ins(&format!("mov ${}, %esi", count));
        self.asm.call_helper(
            ffi::girder_rt_block_dereference as usize as u64,
            "girder_rt_block_dereference",
        );
    }

    // ------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------

    pub(super) fn emit_statement(&mut self, statement: &Statement) -> Result<(), CompileError> {
        match statement {
            Statement::Expression(expression) => {
                self.emit_expression(
                    expression,
                    PassControl {
                        suppress_result: true,
                        ..PassControl::default()
                    },
                )?;
                self.discard_left();
                Ok(())
            }
            Statement::Local { name, value, .. } => {
                match value {
                    Some(value) => self.emit_expression(value, PassControl::default())?,
                    None => self.null_cell_to_left(),
                }
                self.emit_store_identifier(
                    name,
                    PassControl {
                        local_definition: true,
                        suppress_result: true,
                        ..PassControl::default()
                    },
                );
                Ok(())
            }
            Statement::If { arms, otherwise } => self.emit_if(arms, otherwise.as_ref()),
            Statement::While { condition, body } => self.emit_while(condition, body),
            Statement::DoWhile { body, condition } => self.emit_do_while(body, condition),
            Statement::For {
                init,
                condition,
                step,
                body,
            } => self.emit_for(init.as_deref(), condition.as_ref(), step.as_ref(), body),
            Statement::Return(value) => self.emit_return(value.as_ref()),
            Statement::Break => self.emit_break(),
            Statement::Continue => self.emit_continue(),
            Statement::Block(block) => {
                self.enter_scope();
                for statement in &block.statements {
                    self.emit_statement(statement)?;
                }
                self.exit_scope();
                Ok(())
            }
            Statement::FunctionDeclaration {
                path,
                tag,
                function,
            } => self.emit_function_declaration(path, *tag, function),
            Statement::Switch { .. } => Err(CompileError::Unsupported(
                "switch statements".to_string(),
            )),
            Statement::ClassDeclaration { .. } => Err(CompileError::Unsupported(
                "class declarations".to_string(),
            )),
        }
    }

    /// Evaluate a condition, consume it, and jump to `false_target` when
    /// falsy.
    fn emit_condition(
        &mut self,
        condition: &Expression,
        false_target: &str,
    ) -> Result<(), CompileError> {
        self.emit_expression(condition, PassControl::default())?;
        let cond = self.frame.scratch_offset(super::frame::Scratch::Cond);
        self.store_left(cond);
        self.emit_truthiness(cond);
        self.emit_deref_cell(cond);
        self.asm.ins("test %eax, %eax");
        self.asm.ins(&format!("jz {}", false_target));
        Ok(())
    }

    /// If / else-if / else share a single end-of-chain label.
    fn emit_if(
        &mut self,
        arms: &[(Expression, Block)],
        otherwise: Option<&Block>,
    ) -> Result<(), CompileError> {
        let end = self.asm.fresh_label("if_end");
        for (condition, body) in arms {
            let next = self.asm.fresh_label("if_next");
            self.emit_condition(condition, &next)?;
            self.enter_scope();
            for statement in &body.statements {
                self.emit_statement(statement)?;
            }
            self.exit_scope();
            self.asm.ins(&format!("jmp {}", end));
            self.asm.bind(&next);
        }
        if let Some(body) = otherwise {
            self.enter_scope();
            for statement in &body.statements {
                self.emit_statement(statement)?;
            }
            self.exit_scope();
        }
        self.asm.bind(&end);
        Ok(())
    }

    fn emit_loop_body(&mut self, body: &Block) -> Result<(), CompileError> {
        self.enter_scope();
        for statement in &body.statements {
            self.emit_statement(statement)?;
        }
        self.exit_scope();
        Ok(())
    }

    fn emit_while(&mut self, condition: &Expression, body: &Block) -> Result<(), CompileError> {
        let head = self.asm.fresh_label("while_head");
        let end = self.asm.fresh_label("while_end");
        self.frame.push_loop(LoopLabels {
            continue_label: head.clone(),
            break_label: end.clone(),
            scope_depth: self.frame.scope_depth(),
        });

        self.asm.bind(&head);
        self.emit_condition(condition, &end)?;
        self.emit_loop_body(body)?;
        self.asm.ins(&format!("jmp {}", head));
        self.asm.bind(&end);

        self.frame.pop_loop();
        Ok(())
    }

    fn emit_do_while(&mut self, body: &Block, condition: &Expression) -> Result<(), CompileError> {
        let head = self.asm.fresh_label("do_head");
        let check = self.asm.fresh_label("do_check");
        let end = self.asm.fresh_label("do_end");
        self.frame.push_loop(LoopLabels {
            continue_label: check.clone(),
            break_label: end.clone(),
            scope_depth: self.frame.scope_depth(),
        });

        self.asm.bind(&head);
        self.emit_loop_body(body)?;
        self.asm.bind(&check);
        self.emit_condition(condition, &end)?;
        self.asm.ins(&format!("jmp {}", head));
        self.asm.bind(&end);

        self.frame.pop_loop();
        Ok(())
    }

    fn emit_for(
        &mut self,
        init: Option<&Statement>,
        condition: Option<&Expression>,
        step: Option<&Expression>,
        body: &Block,
    ) -> Result<(), CompileError> {
        // The loop header scope owns `local i`.
        self.enter_scope();
        if let Some(init) = init {
            self.emit_statement(init)?;
        }

        let head = self.asm.fresh_label("for_head");
        let step_label = self.asm.fresh_label("for_step");
        let end = self.asm.fresh_label("for_end");
        self.frame.push_loop(LoopLabels {
            continue_label: step_label.clone(),
            break_label: end.clone(),
            scope_depth: self.frame.scope_depth(),
        });

        self.asm.bind(&head);
        if let Some(condition) = condition {
            self.emit_condition(condition, &end)?;
        }
        self.emit_loop_body(body)?;
        self.asm.bind(&step_label);
        if let Some(step) = step {
            self.emit_expression(
                step,
                PassControl {
                    suppress_result: true,
                    ..PassControl::default()
                },
            )?;
            self.discard_left();
        }
        self.asm.ins(&format!("jmp {}", head));
        self.asm.bind(&end);

        self.frame.pop_loop();
        self.exit_scope();
        Ok(())
    }

    fn emit_return(&mut self, value: Option<&Expression>) -> Result<(), CompileError> {
        match value {
            Some(value) => self.emit_expression(value, PassControl::default())?,
            None => self.null_cell_to_left(),
        }
        self.asm.note("write return slot");
        self.asm.ins("mov %r14, (%r12)");
        self.asm.ins("mov %r15, 8(%r12)");
        // Return crosses every scope: dereference the entire locals stack.
        self.emit_block_dereference(0, self.frame.locals_cells());
        self.asm.ins("jmp .Lepilogue");
        Ok(())
    }

    fn emit_break(&mut self) -> Result<(), CompileError> {
        let Some(current) = self.frame.current_loop() else {
            return Err(CompileError::Unsupported("break outside a loop".to_string()));
        };
        let target = current.break_label.clone();
        let depth = current.scope_depth;
        for (base, count) in self.frame.crossed_scopes(depth) {
            self.emit_block_dereference(base, count);
        }
        self.asm.ins(&format!("jmp {}", target));
        Ok(())
    }

    fn emit_continue(&mut self) -> Result<(), CompileError> {
        let Some(current) = self.frame.current_loop() else {
            return Err(CompileError::Unsupported(
                "continue outside a loop".to_string(),
            ));
        };
        let target = current.continue_label.clone();
        let depth = current.scope_depth;
        for (base, count) in self.frame.crossed_scopes(depth) {
            self.emit_block_dereference(base, count);
        }
        self.asm.ins(&format!("jmp {}", target));
        Ok(())
    }

    fn emit_function_declaration(
        &mut self,
        path: &[String],
        tag: FunctionTag,
        function: &Rc<crate::ast::FunctionLiteral>,
    ) -> Result<(), CompileError> {
        let id = self.literal_id(function)?;
        match tag {
            FunctionTag::Basic | FunctionTag::BasicConstant => {
                let slot = self.frame.define_local(&path[0]);
                let offset = self.frame.local_offset(slot);
                self.store_imm_cell(offset, ValueKind::Function as u64, id);
                Ok(())
            }
            FunctionTag::Global | FunctionTag::GlobalConstant => {
                if path.len() == 1 {
                    let block = self.pin_string(&path[0]);
                    let staged = self.frame.scratch_offset(super::frame::Scratch::Right);
                    self.store_imm_cell(staged, ValueKind::Function as u64, id);
                    self.asm.ins("mov %r13, %rdi");
                    self.asm.ins_note(
                        &format!("movabs ${:#x}, %rsi", block),
                        &format!("\"{}\"", path[0]),
                    );
                    self.asm.ins(&format!("lea {}(%rsp), %rdx", staged));
                    self.asm.call_helper(
                        ffi::girder_rt_global_set as usize as u64,
                        "girder_rt_global_set",
                    );
                    return Ok(());
                }

                // Dotted path: the segment addresses live in a local data
                // blob walked by the runtime.
                let parts = self.asm.fresh_label("fn_path");
                let mut blob = format!("{}:\n", parts);
                for segment in path {
                    let block = self.pin_string(segment);
                    let _ = writeln!(blob, "    .quad {:#x}                         # \"{}\"", block, segment);
                }
                self.appendix.push_str(".section .data\n");
                self.appendix.push_str(&blob);
                self.appendix.push_str(".text\n");

                self.asm.ins("mov %r13, %rdi");
                self.asm.ins(&format!("lea {}(%rip), %rsi", parts));
                self.asm.ins(&format!("mov ${}, %rdx", path.len()));
                self.asm.ins(&format!("mov ${}, %rcx", id));
                self.asm.call_helper(
                    ffi::girder_rt_declare_function as usize as u64,
                    "girder_rt_declare_function",
                );
                self.emit_unwind_check();
                Ok(())
            }
        }
    }
}
