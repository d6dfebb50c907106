//! Call-Site Emission
//!
//! Every call site owns one argument region in the frame, reserved in
//! emission order and reused each time the site executes. The sequence
//! follows the calling discipline shared with the interpreter:
//!
//! 1. evaluate the arguments into the region (a dot-call evaluates its
//!    receiver first and makes it the implicit first argument),
//! 2. resolve the callee - dot-calls through selection, everything else
//!    by evaluating the callee expression,
//! 3. publish `(region, count)` through the environment's argument slot,
//! 4. call the runtime invoke (or construct) entry,
//! 5. dereference the region cells and the callee, test the unwinding
//!    flag, and take the result.

use super::frame::Scratch;
use super::{CodeGen, PassControl};
use crate::ast::{Expression, SelectKind};
use crate::error::CompileError;
use crate::ffi;

impl CodeGen<'_> {
    pub(super) fn emit_call(
        &mut self,
        callee: &Expression,
        args: &[Expression],
        is_new: bool,
    ) -> Result<(), CompileError> {
        let site = self.site_counter;
        self.site_counter += 1;
        let region = self.frame.argument_region_offset(site);
        self.asm.note(&format!("call site {}", site));

        // Dot-calls bind the receiver as the first argument.
        let dot = match callee {
            Expression::Select {
                kind: SelectKind::Dot,
                target,
                key,
            } if !is_new => Some((target.as_ref(), key.clone())),
            _ => None,
        };

        let implicit = usize::from(dot.is_some());
        if let Some((receiver, _)) = &dot {
            self.emit_expression(receiver, PassControl::default())?;
            self.store_left(region);
        }
        for (i, arg) in args.iter().enumerate() {
            self.emit_expression(arg, PassControl::default())?;
            self.store_left(region + (implicit + i) * 16);
        }
        let count = args.len() + implicit;

        // Resolve the callee into its scratch cell.
        let callee_cell = self.frame.scratch_offset(Scratch::Callee);
        match &dot {
            Some((_, method)) => {
                let (key_offset, key_owned) = self.emit_method_key(method)?;
                let out = self.frame.scratch_offset(Scratch::Out);
                self.asm.ins("mov %r13, %rdi");
                self.asm.ins(&format!("lea {}(%rsp), %rsi", out));
                self.asm.ins(&format!("lea {}(%rsp), %rdx", region));
                self.asm.ins(&format!("lea {}(%rsp), %rcx", key_offset));
                self.asm
                    .call_helper(ffi::girder_rt_select as usize as u64, "girder_rt_select");
                if key_owned {
                    self.emit_deref_cell(key_offset);
                }
                self.frame.pop_spill();
                self.emit_unwind_check();
                self.load_left(out);
                self.store_left(callee_cell);
            }
            None => {
                self.emit_expression(callee, PassControl::default())?;
                self.store_left(callee_cell);
            }
        }

        // The result cell must be dead-but-defined: the dispatcher only
        // writes it on success.
        let out = self.frame.scratch_offset(Scratch::Out);
        self.asm.ins(&format!("movq $0, {}(%rsp)", out));
        self.asm.ins(&format!("movq $0, {}(%rsp)", out + 8));

        // Publish the argument slot.
        self.asm.ins(&format!("lea {}(%rsp), %rax", region));
        self.asm.ins_note("mov %rax, 0(%r13)", "arg slot");
        self.asm.ins(&format!("movq ${}, 8(%r13)", count));

        let (address, name): (u64, &str) = if is_new {
            (
                ffi::girder_rt_construct as usize as u64,
                "girder_rt_construct",
            )
        } else {
            (ffi::girder_rt_invoke as usize as u64, "girder_rt_invoke")
        };
        self.asm.ins("mov %r13, %rdi");
        self.asm.ins(&format!("lea {}(%rsp), %rsi", out));
        self.asm.ins(&format!("lea {}(%rsp), %rdx", callee_cell));
        self.asm.call_helper(address, name);

        // Release the region and the callee before surfacing failure.
        if count > 0 {
            self.asm.ins(&format!("lea {}(%rsp), %rdi", region));
            self.asm.ins(&format!("mov ${}, %esi", count));
            self.asm.call_helper(
                ffi::girder_rt_block_dereference as usize as u64,
                "girder_rt_block_dereference",
            );
        }
        self.emit_deref_cell(callee_cell);
        self.emit_unwind_check();
        self.load_left(out);
        Ok(())
    }

    /// Method-name cell for a dot-call, staged in a spill slot like every
    /// other key.
    fn emit_method_key(&mut self, method: &str) -> Result<(usize, bool), CompileError> {
        let block = self.pin_string(method);
        let offset = self.frame.push_spill();
        self.store_imm_cell(offset, crate::value::ValueKind::String as u64, block);
        Ok((offset, false))
    }
}
