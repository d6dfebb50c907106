//! Expression Pass
//!
//! Every expression leaves its result in the "left" evaluation registers
//! (`r14` = type, `r15` = payload), owning one reference for complex
//! payloads. Binary operators spill the left result while the right
//! operand evaluates, stage both operands in memory, and call the runtime
//! operator helper; operand temporaries are dereferenced (with the inline
//! simple-type fast path) before the unwinding flag is tested.

use super::frame::Scratch;
use super::{CodeGen, PassControl};
use crate::ast::{ComparisonOp, Expression, TableKey, UnaryOp};
use crate::error::CompileError;
use crate::ffi;
use crate::object::BinaryOp;
use crate::value::{SIMPLE_TYPE_END, ValueKind};

impl CodeGen<'_> {
    // ------------------------------------------------------------------
    // Cell plumbing
    // ------------------------------------------------------------------

    /// Store the left registers into a frame cell (ownership moves to the
    /// cell).
    pub(super) fn store_left(&mut self, offset: usize) {
        self.asm.ins(&format!("mov %r14, {}(%rsp)", offset));
        self.asm.ins(&format!("mov %r15, {}(%rsp)", offset + 8));
    }

    /// Load a frame cell into the left registers (ownership moves to the
    /// registers).
    pub(super) fn load_left(&mut self, offset: usize) {
        self.asm.ins(&format!("mov {}(%rsp), %r14", offset));
        self.asm.ins(&format!("mov {}(%rsp), %r15", offset + 8));
    }

    /// Move the left pair into the right pair.
    pub(super) fn left_to_right(&mut self) {
        self.asm.ins("mov %r14, %rbx");
        self.asm.ins("mov %r15, %rbp");
    }

    /// Spill the left registers to the next spill cell; returns its
    /// offset.
    pub(super) fn spill_left(&mut self) -> usize {
        let offset = self.frame.push_spill();
        self.store_left(offset);
        offset
    }

    /// Write an immediate cell into a frame slot.
    pub(super) fn store_imm_cell(&mut self, offset: usize, kind: u64, data: u64) {
        self.asm.ins(&format!("movq ${}, {}(%rsp)", kind, offset));
        if data <= i32::MAX as u64 {
            self.asm.ins(&format!("movq ${}, {}(%rsp)", data, offset + 8));
        } else {
            self.asm.ins(&format!("movabs ${:#x}, %rax", data));
            self.asm.ins(&format!("mov %rax, {}(%rsp)", offset + 8));
        }
    }

    /// Inline fast path around `girder_rt_reference`: complex tags only.
    pub(super) fn emit_ref_cell(&mut self, offset: usize) {
        let skip = self.asm.fresh_label("ref_skip");
        self.asm
            .ins(&format!("cmpq ${}, {}(%rsp)", SIMPLE_TYPE_END, offset));
        self.asm.ins(&format!("jbe {}", skip));
        self.asm.ins(&format!("lea {}(%rsp), %rdi", offset));
        self.asm
            .call_helper(ffi::girder_rt_reference as usize as u64, "girder_rt_reference");
        self.asm.bind(&skip);
    }

    /// Inline fast path around `girder_rt_dereference`.
    pub(super) fn emit_deref_cell(&mut self, offset: usize) {
        let skip = self.asm.fresh_label("deref_skip");
        self.asm
            .ins(&format!("cmpq ${}, {}(%rsp)", SIMPLE_TYPE_END, offset));
        self.asm.ins(&format!("jbe {}", skip));
        self.asm.ins(&format!("lea {}(%rsp), %rdi", offset));
        self.asm.call_helper(
            ffi::girder_rt_dereference as usize as u64,
            "girder_rt_dereference",
        );
        self.asm.bind(&skip);
    }

    /// Release the value currently in the left registers.
    pub(super) fn discard_left(&mut self) {
        let offset = self.frame.scratch_offset(Scratch::Out);
        self.store_left(offset);
        self.emit_deref_cell(offset);
    }

    /// Test the environment's unwinding flag; jump to the innermost
    /// scope's unwind label when set.
    pub(super) fn emit_unwind_check(&mut self) {
        let target = self.frame.unwind_label().to_string();
        self.asm.ins("cmpb $0, 16(%r13)");
        self.asm.ins(&format!("jne {}", target));
    }

    /// Truthiness of the cell at `offset` into `%al` (1 = truthy) without
    /// consuming the cell.
    pub(super) fn emit_truthiness(&mut self, offset: usize) {
        let falsy = self.asm.fresh_label("falsy");
        let done = self.asm.fresh_label("truth_done");
        self.asm.ins("xor %eax, %eax");
        self.asm.ins(&format!("cmpq $0, {}(%rsp)", offset));
        self.asm.ins(&format!("je {}", falsy));
        self.asm.ins(&format!("cmpq $0, {}(%rsp)", offset + 8));
        self.asm.ins(&format!("je {}", falsy));
        self.asm.ins("mov $1, %eax");
        self.asm.ins(&format!("jmp {}", done));
        self.asm.bind(&falsy);
        self.asm.bind(&done);
    }

    fn helper_binary(&mut self, address: u64, name: &str, lhs_offset: usize, rhs_offset: usize) {
        let out = self.frame.scratch_offset(Scratch::Out);
        self.asm.ins("mov %r13, %rdi");
        self.asm.ins(&format!("lea {}(%rsp), %rsi", out));
        self.asm.ins(&format!("lea {}(%rsp), %rdx", lhs_offset));
        self.asm.ins(&format!("lea {}(%rsp), %rcx", rhs_offset));
        self.asm.call_helper(address, name);
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    pub(super) fn emit_expression(
        &mut self,
        expression: &Expression,
        pass: PassControl,
    ) -> Result<(), CompileError> {
        match expression {
            Expression::Null => {
                self.null_cell_to_left();
                Ok(())
            }
            Expression::Boolean(value) => {
                self.value_imm_to_left(ValueKind::Boolean as u64, *value as u64);
                Ok(())
            }
            Expression::Integer(value) => {
                self.value_imm_to_left(ValueKind::Integer as u64, *value as u64);
                Ok(())
            }
            Expression::Number(value) => {
                self.value_imm_to_left(ValueKind::Number as u64, value.to_bits());
                Ok(())
            }
            Expression::String(text) => {
                self.emit_string_literal(&text.clone());
                Ok(())
            }
            Expression::Identifier(name) => {
                self.emit_identifier_read(&name.clone());
                Ok(())
            }
            Expression::FunctionLiteral(literal) => {
                let id = self.literal_id(literal)?;
                self.value_imm_to_left(ValueKind::Function as u64, id);
                Ok(())
            }

            Expression::Binary { op, lhs, rhs } => self.emit_binary(*op, lhs, rhs),
            Expression::Comparison { op, lhs, rhs } => self.emit_comparison(*op, lhs, rhs),
            Expression::LogicalOr { lhs, rhs } => self.emit_logical(lhs, rhs, true),
            Expression::LogicalAnd { lhs, rhs } => self.emit_logical(lhs, rhs, false),
            Expression::Unary { op, operand } => self.emit_unary(*op, operand),
            Expression::Ternary {
                condition,
                then,
                otherwise,
            } => self.emit_ternary(condition, then, otherwise),

            Expression::Assign { target, value } => self.emit_assign(target, value, pass),
            Expression::CompoundAssign { op, target, value } => {
                self.emit_compound(*op, target, value)
            }
            Expression::PreIncrement(target) => self.emit_step(target, 1, true),
            Expression::PostIncrement(target) => self.emit_step(target, 1, false),
            Expression::PreDecrement(target) => self.emit_step(target, -1, true),
            Expression::PostDecrement(target) => self.emit_step(target, -1, false),

            Expression::Index { target, key } => self.emit_index_read(target, key),
            Expression::RangedIndex { target, from, to } => self.emit_ranged(target, from, to),
            Expression::Select { target, key, .. } => {
                self.emit_select_read(target, &key.clone())
            }

            Expression::Call { callee, args, .. } => self.emit_call(callee, args, false),
            Expression::New { class, args, .. } => self.emit_call(class, args, true),

            Expression::Table(entries) => self.emit_table_literal(entries),
            Expression::Array(elements) => self.emit_array_literal(elements),
        }
    }

    // ------------------------------------------------------------------
    // Atoms
    // ------------------------------------------------------------------

    /// A string literal: the interned block address is baked in; the
    /// registers take a counted reference of their own.
    fn emit_string_literal(&mut self, text: &str) {
        let block = self.pin_string(text);
        let out = self.frame.scratch_offset(Scratch::Out);
        self.store_imm_cell(out, ValueKind::String as u64, block);
        self.asm.ins(&format!("lea {}(%rsp), %rdi", out));
        self.asm
            .call_helper(ffi::girder_rt_reference as usize as u64, "girder_rt_reference");
        self.load_left(out);
    }

    /// Identifier read: local slots innermost-first, then the globals.
    fn emit_identifier_read(&mut self, name: &str) {
        if let Some(slot) = self.frame.resolve_local(name) {
            let offset = self.frame.local_offset(slot);
            self.emit_ref_cell(offset);
            self.load_left(offset);
            return;
        }
        let block = self.pin_string(name);
        let out = self.frame.scratch_offset(Scratch::Out);
        self.asm.ins("mov %r13, %rdi");
        self.asm.ins(&format!("lea {}(%rsp), %rsi", out));
        self.asm
            .ins_note(&format!("movabs ${:#x}, %rdx", block), &format!("\"{}\"", name));
        self.asm.call_helper(
            ffi::girder_rt_global_get as usize as u64,
            "girder_rt_global_get",
        );
        self.load_left(out);
    }

    // ------------------------------------------------------------------
    // Operators
    // ------------------------------------------------------------------

    fn binary_helper_for(op: BinaryOp) -> (u64, &'static str) {
        match op {
            BinaryOp::Add => (ffi::girder_rt_add as usize as u64, "girder_rt_add"),
            BinaryOp::Sub => (ffi::girder_rt_sub as usize as u64, "girder_rt_sub"),
            BinaryOp::Mul => (ffi::girder_rt_mul as usize as u64, "girder_rt_mul"),
            BinaryOp::Div => (ffi::girder_rt_div as usize as u64, "girder_rt_div"),
            BinaryOp::Mod => (ffi::girder_rt_mod as usize as u64, "girder_rt_mod"),
            BinaryOp::Pow => (ffi::girder_rt_pow as usize as u64, "girder_rt_pow"),
            BinaryOp::BitOr => (ffi::girder_rt_bor as usize as u64, "girder_rt_bor"),
            BinaryOp::BitXor => (ffi::girder_rt_bxor as usize as u64, "girder_rt_bxor"),
            BinaryOp::BitAnd => (ffi::girder_rt_band as usize as u64, "girder_rt_band"),
            BinaryOp::Shl => (ffi::girder_rt_shl as usize as u64, "girder_rt_shl"),
            BinaryOp::Shr => (ffi::girder_rt_shr as usize as u64, "girder_rt_shr"),
        }
    }

    fn comparison_helper_for(op: ComparisonOp) -> (u64, &'static str) {
        match op {
            ComparisonOp::Eq => (ffi::girder_rt_eq as usize as u64, "girder_rt_eq"),
            ComparisonOp::Ne => (ffi::girder_rt_ne as usize as u64, "girder_rt_ne"),
            ComparisonOp::Lt => (ffi::girder_rt_lt as usize as u64, "girder_rt_lt"),
            ComparisonOp::Le => (ffi::girder_rt_le as usize as u64, "girder_rt_le"),
            ComparisonOp::Gt => (ffi::girder_rt_gt as usize as u64, "girder_rt_gt"),
            ComparisonOp::Ge => (ffi::girder_rt_ge as usize as u64, "girder_rt_ge"),
        }
    }

    fn emit_operator(
        &mut self,
        address: u64,
        name: &str,
        lhs: &Expression,
        rhs: &Expression,
    ) -> Result<(), CompileError> {
        self.emit_expression(lhs, PassControl::default())?;
        let lhs_offset = self.spill_left();

        self.emit_expression(rhs, PassControl::default())?;
        // Stage the right operand; the pair moves through the right
        // registers so the operand sides are explicit in the text.
        self.left_to_right();
        let rhs_offset = self.frame.scratch_offset(Scratch::Right);
        self.asm.ins(&format!("mov %rbx, {}(%rsp)", rhs_offset));
        self.asm.ins(&format!("mov %rbp, {}(%rsp)", rhs_offset + 8));

        self.helper_binary(address, name, lhs_offset, rhs_offset);

        self.emit_deref_cell(lhs_offset);
        self.frame.pop_spill();
        self.emit_deref_cell(rhs_offset);
        self.emit_unwind_check();
        self.load_left(self.frame.scratch_offset(Scratch::Out));
        Ok(())
    }

    fn emit_binary(
        &mut self,
        op: BinaryOp,
        lhs: &Expression,
        rhs: &Expression,
    ) -> Result<(), CompileError> {
        let (address, name) = Self::binary_helper_for(op);
        self.emit_operator(address, name, lhs, rhs)
    }

    fn emit_comparison(
        &mut self,
        op: ComparisonOp,
        lhs: &Expression,
        rhs: &Expression,
    ) -> Result<(), CompileError> {
        let (address, name) = Self::comparison_helper_for(op);
        self.emit_operator(address, name, lhs, rhs)
    }

    fn emit_unary(&mut self, op: UnaryOp, operand: &Expression) -> Result<(), CompileError> {
        let (address, name): (u64, &str) = match op {
            UnaryOp::Not => (ffi::girder_rt_not as usize as u64, "girder_rt_not"),
            UnaryOp::BitNot => (ffi::girder_rt_bnot as usize as u64, "girder_rt_bnot"),
            UnaryOp::Length => (ffi::girder_rt_length as usize as u64, "girder_rt_length"),
            UnaryOp::TypeOf => (ffi::girder_rt_typeof as usize as u64, "girder_rt_typeof"),
        };
        self.emit_expression(operand, PassControl::default())?;
        let operand_offset = self.frame.scratch_offset(Scratch::Right);
        self.store_left(operand_offset);

        let out = self.frame.scratch_offset(Scratch::Out);
        self.asm.ins("mov %r13, %rdi");
        self.asm.ins(&format!("lea {}(%rsp), %rsi", out));
        self.asm.ins(&format!("lea {}(%rsp), %rdx", operand_offset));
        self.asm.call_helper(address, name);

        self.emit_deref_cell(operand_offset);
        self.emit_unwind_check();
        self.load_left(out);
        Ok(())
    }

    /// Short-circuit `||` / `&&`. A native-object left operand falls back
    /// to the overload helper so v-table slots fire exactly as in the
    /// interpreter.
    fn emit_logical(
        &mut self,
        lhs: &Expression,
        rhs: &Expression,
        is_or: bool,
    ) -> Result<(), CompileError> {
        self.emit_expression(lhs, PassControl::default())?;
        let lhs_offset = self.spill_left();

        let native = self.asm.fresh_label("logic_native");
        let plain = self.asm.fresh_label("logic_plain");
        let end = self.asm.fresh_label("logic_end");
        self.asm.ins(&format!(
            "cmpq ${}, {}(%rsp)",
            ValueKind::NativeObject as u64,
            lhs_offset
        ));
        self.asm.ins(&format!("je {}", native));
        self.asm.ins(&format!("jmp {}", plain));

        // Overloaded path: evaluate the right side and call the helper.
        self.asm.bind(&native);
        self.emit_expression(rhs, PassControl::default())?;
        let rhs_offset = self.frame.scratch_offset(Scratch::Right);
        self.store_left(rhs_offset);
        let (address, name): (u64, &str) = if is_or {
            (ffi::girder_rt_or as usize as u64, "girder_rt_or")
        } else {
            (ffi::girder_rt_and as usize as u64, "girder_rt_and")
        };
        self.helper_binary(address, name, lhs_offset, rhs_offset);
        self.emit_deref_cell(lhs_offset);
        self.emit_deref_cell(rhs_offset);
        self.emit_unwind_check();
        self.load_left(self.frame.scratch_offset(Scratch::Out));
        self.asm.ins(&format!("jmp {}", end));

        // Short-circuit path.
        self.asm.bind(&plain);
        self.emit_truthiness(lhs_offset);
        let lhs_decides = self.asm.fresh_label("logic_lhs");
        if is_or {
            // Truthy left is the result; falsy left yields the right.
            self.asm.ins("test %eax, %eax");
            self.asm.ins(&format!("jnz {}", lhs_decides));
            self.emit_deref_cell(lhs_offset);
            self.emit_expression(rhs, PassControl::default())?;
            self.asm.ins(&format!("jmp {}", end));
            self.asm.bind(&lhs_decides);
            self.load_left(lhs_offset);
        } else {
            // Falsy left yields false; otherwise the right decides.
            let rhs_path = self.asm.fresh_label("logic_rhs");
            self.asm.ins("test %eax, %eax");
            self.asm.ins(&format!("jnz {}", rhs_path));
            self.emit_deref_cell(lhs_offset);
            self.value_imm_to_left(ValueKind::Boolean as u64, 0);
            self.asm.ins(&format!("jmp {}", end));

            self.asm.bind(&rhs_path);
            self.emit_deref_cell(lhs_offset);
            self.emit_expression(rhs, PassControl::default())?;
            let rhs_offset = self.frame.scratch_offset(Scratch::Right);
            self.store_left(rhs_offset);
            self.emit_truthiness(rhs_offset);
            self.asm.ins("test %eax, %eax");
            self.asm.ins(&format!("jnz {}", lhs_decides));
            self.emit_deref_cell(rhs_offset);
            self.value_imm_to_left(ValueKind::Boolean as u64, 0);
            self.asm.ins(&format!("jmp {}", end));
            self.asm.bind(&lhs_decides);
            self.load_left(rhs_offset);
        }
        self.asm.bind(&end);
        self.frame.pop_spill();
        Ok(())
    }

    fn emit_ternary(
        &mut self,
        condition: &Expression,
        then: &Expression,
        otherwise: &Expression,
    ) -> Result<(), CompileError> {
        let else_label = self.asm.fresh_label("tern_else");
        let end = self.asm.fresh_label("tern_end");

        self.emit_expression(condition, PassControl::default())?;
        let cond = self.frame.scratch_offset(Scratch::Cond);
        self.store_left(cond);
        self.emit_truthiness(cond);
        self.emit_deref_cell(cond);
        self.asm.ins("test %eax, %eax");
        self.asm.ins(&format!("jz {}", else_label));

        self.emit_expression(then, PassControl::default())?;
        self.asm.ins(&format!("jmp {}", end));
        self.asm.bind(&else_label);
        self.emit_expression(otherwise, PassControl::default())?;
        self.asm.bind(&end);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Assignment family
    // ------------------------------------------------------------------

    pub(super) fn emit_assign(
        &mut self,
        target: &Expression,
        value: &Expression,
        pass: PassControl,
    ) -> Result<(), CompileError> {
        match target {
            Expression::Identifier(name) => {
                let name = name.clone();
                self.emit_expression(value, PassControl::default())?;
                self.emit_store_identifier(&name, pass);
                Ok(())
            }
            Expression::Index { target, key } => {
                self.emit_index_write(target, Some(key.as_ref()), None, value, pass)
            }
            Expression::Select { target, key, .. } => {
                let key = key.clone();
                self.emit_index_write(target, None, Some(&key), value, pass)
            }
            _ => Err(CompileError::Unsupported(
                "assignment target shape".to_string(),
            )),
        }
    }

    /// Store the left registers through an identifier. Locals dereference
    /// the old cell and take the new one; globals go through the runtime.
    /// When the result is suppressed the registers are left null, so the
    /// statement-level discard never sees a transferred reference twice.
    pub(super) fn emit_store_identifier(&mut self, name: &str, pass: PassControl) {
        if pass.local_definition {
            let slot = self.frame.define_local(name);
            let offset = self.frame.local_offset(slot);
            // Fresh slots are null (prologue zeroing / exit nulling).
            self.store_left(offset);
            self.null_cell_to_left();
            return;
        }
        if let Some(slot) = self.frame.resolve_local(name) {
            let offset = self.frame.local_offset(slot);
            self.emit_deref_cell(offset);
            self.store_left(offset);
            if pass.suppress_result {
                self.null_cell_to_left();
            } else {
                // The expression still yields the value: take a fresh
                // count for the registers.
                self.emit_ref_cell(offset);
            }
            return;
        }
        let block = self.pin_string(name);
        let staged = self.frame.scratch_offset(Scratch::Right);
        self.store_left(staged);
        self.asm.ins("mov %r13, %rdi");
        self.asm
            .ins_note(&format!("movabs ${:#x}, %rsi", block), &format!("\"{}\"", name));
        self.asm.ins(&format!("lea {}(%rsp), %rdx", staged));
        self.asm.call_helper(
            ffi::girder_rt_global_set as usize as u64,
            "girder_rt_global_set",
        );
        if pass.suppress_result {
            self.emit_deref_cell(staged);
            self.null_cell_to_left();
        } else {
            // The staged cell still owns its count; move it back.
            self.load_left(staged);
        }
    }

    fn emit_compound(
        &mut self,
        op: BinaryOp,
        target: &Expression,
        value: &Expression,
    ) -> Result<(), CompileError> {
        let code = ffi::binary_op_code(op);
        match target {
            Expression::Identifier(name) => {
                let name = name.clone();
                self.emit_expression(value, PassControl::default())?;
                let staged = self.frame.scratch_offset(Scratch::Right);
                self.store_left(staged);

                if let Some(slot) = self.frame.resolve_local(&name) {
                    let offset = self.frame.local_offset(slot);
                    self.asm.ins("mov %r13, %rdi");
                    self.asm.ins(&format!("mov ${}, %esi", code));
                    self.asm.ins(&format!("lea {}(%rsp), %rdx", offset));
                    self.asm.ins(&format!("lea {}(%rsp), %rcx", staged));
                    self.asm.call_helper(
                        ffi::girder_rt_compound_cell as usize as u64,
                        "girder_rt_compound_cell",
                    );
                } else {
                    let block = self.pin_string(&name);
                    self.asm.ins("mov %r13, %rdi");
                    self.asm.ins(&format!("mov ${}, %esi", code));
                    self.asm
                        .ins_note(&format!("movabs ${:#x}, %rdx", block), &format!("\"{}\"", name));
                    self.asm.ins(&format!("lea {}(%rsp), %rcx", staged));
                    self.asm.call_helper(
                        ffi::girder_rt_global_compound as usize as u64,
                        "girder_rt_global_compound",
                    );
                }
                self.emit_deref_cell(staged);
                self.emit_unwind_check();
                self.null_cell_to_left();
                Ok(())
            }
            Expression::Index { target, key } => {
                self.emit_target_key_compound(code, target, Some(key.as_ref()), None, value)
            }
            Expression::Select { target, key, .. } => {
                let key = key.clone();
                self.emit_target_key_compound(code, target, None, Some(&key), value)
            }
            _ => Err(CompileError::Unsupported(
                "compound assignment target shape".to_string(),
            )),
        }
    }

    /// Build the key cell for an element access in a spill slot: either an
    /// evaluated expression (owned) or a pinned selection name (borrowed -
    /// released without a dereference). Spill staging keeps the key safe
    /// across whatever the value expression evaluates.
    fn emit_key_cell(
        &mut self,
        key_expr: Option<&Expression>,
        key_name: Option<&str>,
    ) -> Result<(usize, bool), CompileError> {
        match (key_expr, key_name) {
            (Some(expr), None) => {
                self.emit_expression(expr, PassControl::default())?;
                let offset = self.frame.push_spill();
                self.store_left(offset);
                Ok((offset, true))
            }
            (None, Some(name)) => {
                let block = self.pin_string(name);
                let offset = self.frame.push_spill();
                self.store_imm_cell(offset, ValueKind::String as u64, block);
                Ok((offset, false))
            }
            _ => unreachable!("exactly one key form"),
        }
    }

    fn release_key(&mut self, offset: usize, owned: bool) {
        if owned {
            self.emit_deref_cell(offset);
        }
        self.frame.pop_spill();
    }

    fn emit_index_write(
        &mut self,
        target: &Expression,
        key_expr: Option<&Expression>,
        key_name: Option<&str>,
        value: &Expression,
        pass: PassControl,
    ) -> Result<(), CompileError> {
        self.emit_expression(target, PassControl::default())?;
        let target_offset = self.spill_left();
        let (key_offset, key_owned) = self.emit_key_cell(key_expr, key_name)?;

        self.emit_expression(value, PassControl::default())?;
        let staged = self.frame.scratch_offset(Scratch::Right);
        self.store_left(staged);

        self.asm.ins("mov %r13, %rdi");
        self.asm.ins(&format!("lea {}(%rsp), %rsi", target_offset));
        self.asm.ins(&format!("lea {}(%rsp), %rdx", key_offset));
        self.asm.ins(&format!("lea {}(%rsp), %rcx", staged));
        self.asm.call_helper(
            ffi::girder_rt_index_assign as usize as u64,
            "girder_rt_index_assign",
        );

        self.release_key(key_offset, key_owned);
        self.emit_deref_cell(target_offset);
        self.frame.pop_spill();
        self.emit_unwind_check();
        if pass.suppress_result {
            self.emit_deref_cell(staged);
            self.null_cell_to_left();
        } else {
            // The assignment yields the assigned value; the staged cell's
            // count moves back to the registers.
            self.load_left(staged);
        }
        Ok(())
    }

    fn emit_target_key_compound(
        &mut self,
        code: u32,
        target: &Expression,
        key_expr: Option<&Expression>,
        key_name: Option<&str>,
        value: &Expression,
    ) -> Result<(), CompileError> {
        self.emit_expression(target, PassControl::default())?;
        let target_offset = self.spill_left();
        let (key_offset, key_owned) = self.emit_key_cell(key_expr, key_name)?;

        self.emit_expression(value, PassControl::default())?;
        let staged = self.frame.scratch_offset(Scratch::Right);
        self.store_left(staged);

        self.asm.ins("mov %r13, %rdi");
        self.asm.ins(&format!("mov ${}, %esi", code));
        self.asm.ins(&format!("lea {}(%rsp), %rdx", target_offset));
        self.asm.ins(&format!("lea {}(%rsp), %rcx", key_offset));
        self.asm.ins(&format!("lea {}(%rsp), %r8", staged));
        self.asm.call_helper(
            ffi::girder_rt_index_compound as usize as u64,
            "girder_rt_index_compound",
        );

        self.release_key(key_offset, key_owned);
        self.emit_deref_cell(target_offset);
        self.frame.pop_spill();
        self.emit_deref_cell(staged);
        self.emit_unwind_check();
        self.null_cell_to_left();
        Ok(())
    }

    fn emit_step(
        &mut self,
        target: &Expression,
        delta: i64,
        prefix: bool,
    ) -> Result<(), CompileError> {
        let out = self.frame.scratch_offset(Scratch::Out);
        match target {
            Expression::Identifier(name) => {
                let name = name.clone();
                if let Some(slot) = self.frame.resolve_local(&name) {
                    let offset = self.frame.local_offset(slot);
                    self.asm.ins("mov %r13, %rdi");
                    self.asm.ins(&format!("lea {}(%rsp), %rsi", out));
                    self.asm.ins(&format!("lea {}(%rsp), %rdx", offset));
                    self.asm.ins(&format!("mov ${}, %rcx", delta));
                    self.asm.ins(&format!("mov ${}, %r8d", prefix as u32));
                    self.asm.call_helper(
                        ffi::girder_rt_step_cell as usize as u64,
                        "girder_rt_step_cell",
                    );
                } else {
                    let block = self.pin_string(&name);
                    self.asm.ins("mov %r13, %rdi");
                    self.asm.ins(&format!("lea {}(%rsp), %rsi", out));
                    self.asm
                        .ins_note(&format!("movabs ${:#x}, %rdx", block), &format!("\"{}\"", name));
                    self.asm.ins(&format!("mov ${}, %rcx", delta));
                    self.asm.ins(&format!("mov ${}, %r8d", prefix as u32));
                    self.asm.call_helper(
                        ffi::girder_rt_step_global as usize as u64,
                        "girder_rt_step_global",
                    );
                }
                self.emit_unwind_check();
                self.load_left(out);
                Ok(())
            }
            Expression::Index { target, key } => {
                self.emit_expression(target, PassControl::default())?;
                let target_offset = self.spill_left();
                let (key_offset, key_owned) = self.emit_key_cell(Some(key.as_ref()), None)?;

                self.asm.ins("mov %r13, %rdi");
                self.asm.ins(&format!("lea {}(%rsp), %rsi", out));
                self.asm.ins(&format!("lea {}(%rsp), %rdx", target_offset));
                self.asm.ins(&format!("lea {}(%rsp), %rcx", key_offset));
                self.asm.ins(&format!("mov ${}, %r8", delta));
                self.asm.ins(&format!("mov ${}, %r9d", prefix as u32));
                self.asm.call_helper(
                    ffi::girder_rt_step_index as usize as u64,
                    "girder_rt_step_index",
                );

                self.release_key(key_offset, key_owned);
                self.emit_deref_cell(target_offset);
                self.frame.pop_spill();
                self.emit_unwind_check();
                self.load_left(out);
                Ok(())
            }
            Expression::Select { target, key, .. } => {
                let key = key.clone();
                self.emit_expression(target, PassControl::default())?;
                let target_offset = self.spill_left();
                let (key_offset, key_owned) = self.emit_key_cell(None, Some(&key))?;

                self.asm.ins("mov %r13, %rdi");
                self.asm.ins(&format!("lea {}(%rsp), %rsi", out));
                self.asm.ins(&format!("lea {}(%rsp), %rdx", target_offset));
                self.asm.ins(&format!("lea {}(%rsp), %rcx", key_offset));
                self.asm.ins(&format!("mov ${}, %r8", delta));
                self.asm.ins(&format!("mov ${}, %r9d", prefix as u32));
                self.asm.call_helper(
                    ffi::girder_rt_step_index as usize as u64,
                    "girder_rt_step_index",
                );

                self.release_key(key_offset, key_owned);
                self.emit_deref_cell(target_offset);
                self.frame.pop_spill();
                self.emit_unwind_check();
                self.load_left(out);
                Ok(())
            }
            _ => Err(CompileError::Unsupported(
                "increment target shape".to_string(),
            )),
        }
    }

    // ------------------------------------------------------------------
    // Selection
    // ------------------------------------------------------------------

    fn emit_index_read(
        &mut self,
        target: &Expression,
        key: &Expression,
    ) -> Result<(), CompileError> {
        self.emit_expression(target, PassControl::default())?;
        let target_offset = self.spill_left();
        let (key_offset, key_owned) = self.emit_key_cell(Some(key), None)?;
        self.emit_select_call(target_offset, key_offset);
        self.release_key(key_offset, key_owned);
        self.emit_deref_cell(target_offset);
        self.frame.pop_spill();
        self.emit_unwind_check();
        self.load_left(self.frame.scratch_offset(Scratch::Out));
        Ok(())
    }

    pub(super) fn emit_select_read(
        &mut self,
        target: &Expression,
        key: &str,
    ) -> Result<(), CompileError> {
        self.emit_expression(target, PassControl::default())?;
        let target_offset = self.spill_left();
        let (key_offset, key_owned) = self.emit_key_cell(None, Some(key))?;
        self.emit_select_call(target_offset, key_offset);
        self.release_key(key_offset, key_owned);
        self.emit_deref_cell(target_offset);
        self.frame.pop_spill();
        self.emit_unwind_check();
        self.load_left(self.frame.scratch_offset(Scratch::Out));
        Ok(())
    }

    /// `girder_rt_select(env, out, target, key)` with both cells already
    /// in the frame.
    pub(super) fn emit_select_call(&mut self, target_offset: usize, key_offset: usize) {
        let out = self.frame.scratch_offset(Scratch::Out);
        self.asm.ins("mov %r13, %rdi");
        self.asm.ins(&format!("lea {}(%rsp), %rsi", out));
        self.asm.ins(&format!("lea {}(%rsp), %rdx", target_offset));
        self.asm.ins(&format!("lea {}(%rsp), %rcx", key_offset));
        self.asm
            .call_helper(ffi::girder_rt_select as usize as u64, "girder_rt_select");
    }

    fn emit_ranged(
        &mut self,
        target: &Expression,
        from: &Expression,
        to: &Expression,
    ) -> Result<(), CompileError> {
        self.emit_expression(target, PassControl::default())?;
        let target_offset = self.spill_left();
        self.emit_expression(from, PassControl::default())?;
        let from_offset = self.spill_left();
        self.emit_expression(to, PassControl::default())?;
        let to_offset = self.frame.scratch_offset(Scratch::Extra);
        self.store_left(to_offset);

        let out = self.frame.scratch_offset(Scratch::Out);
        self.asm.ins("mov %r13, %rdi");
        self.asm.ins(&format!("lea {}(%rsp), %rsi", out));
        self.asm.ins(&format!("lea {}(%rsp), %rdx", target_offset));
        self.asm.ins(&format!("lea {}(%rsp), %rcx", from_offset));
        self.asm.ins(&format!("lea {}(%rsp), %r8", to_offset));
        self.asm.call_helper(
            ffi::girder_rt_ranged_select as usize as u64,
            "girder_rt_ranged_select",
        );

        self.emit_deref_cell(to_offset);
        self.emit_deref_cell(from_offset);
        self.frame.pop_spill();
        self.emit_deref_cell(target_offset);
        self.frame.pop_spill();
        self.emit_unwind_check();
        self.load_left(out);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Immediates
    // ------------------------------------------------------------------

    /// `{ k = v, ... }`: allocate, then one index-assign per entry.
    fn emit_table_literal(
        &mut self,
        entries: &[(TableKey, Expression)],
    ) -> Result<(), CompileError> {
        let out = self.frame.scratch_offset(Scratch::Out);
        self.asm.ins(&format!("lea {}(%rsp), %rdi", out));
        self.asm.call_helper(
            ffi::girder_rt_new_table as usize as u64,
            "girder_rt_new_table",
        );
        let table_offset = self.frame.push_spill();
        self.load_left(out);
        self.store_left(table_offset);

        for (key, value) in entries {
            let name = match key {
                TableKey::Identifier(name) | TableKey::String(name) => name.clone(),
            };
            let (key_offset, key_owned) = self.emit_key_cell(None, Some(&name))?;
            self.emit_expression(value, PassControl::default())?;
            let staged = self.frame.scratch_offset(Scratch::Right);
            self.store_left(staged);

            self.asm.ins("mov %r13, %rdi");
            self.asm.ins(&format!("lea {}(%rsp), %rsi", table_offset));
            self.asm.ins(&format!("lea {}(%rsp), %rdx", key_offset));
            self.asm.ins(&format!("lea {}(%rsp), %rcx", staged));
            self.asm.call_helper(
                ffi::girder_rt_index_assign as usize as u64,
                "girder_rt_index_assign",
            );
            self.release_key(key_offset, key_owned);
            self.emit_deref_cell(staged);
            self.emit_unwind_check();
        }

        self.load_left(table_offset);
        self.frame.pop_spill();
        Ok(())
    }

    /// `[ v, ... ]`: allocate sized to the literal, then element stores.
    fn emit_array_literal(&mut self, elements: &[Expression]) -> Result<(), CompileError> {
        let out = self.frame.scratch_offset(Scratch::Out);
        self.asm.ins(&format!("lea {}(%rsp), %rdi", out));
        self.asm.ins(&format!("mov ${}, %rsi", elements.len()));
        self.asm.call_helper(
            ffi::girder_rt_new_array as usize as u64,
            "girder_rt_new_array",
        );
        let array_offset = self.frame.push_spill();
        self.load_left(out);
        self.store_left(array_offset);

        for (i, element) in elements.iter().enumerate() {
            self.emit_expression(element, PassControl::default())?;
            let staged = self.frame.scratch_offset(Scratch::Right);
            self.store_left(staged);

            self.asm.ins("mov %r13, %rdi");
            self.asm.ins(&format!("lea {}(%rsp), %rsi", array_offset));
            self.asm.ins(&format!("mov ${}, %rdx", i));
            self.asm.ins(&format!("lea {}(%rsp), %rcx", staged));
            self.asm.call_helper(
                ffi::girder_rt_array_set as usize as u64,
                "girder_rt_array_set",
            );
            self.emit_deref_cell(staged);
            self.emit_unwind_check();
        }

        self.load_left(array_offset);
        self.frame.pop_spill();
        Ok(())
    }
}
