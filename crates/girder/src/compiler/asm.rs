//! Assembly Text Builder
//!
//! Emits GNU `as` syntax (AT&T) for x86-64 System V. Purely textual: the
//! external assembler owns encoding. Labels are function-local
//! (`.Lg<id>_<n>`) so several functions can share one translation unit if
//! needed.

use std::fmt::Write;

pub(crate) struct Asm {
    text: String,
    label_counter: usize,
}

impl Asm {
    pub fn new() -> Self {
        Asm {
            text: String::new(),
            label_counter: 0,
        }
    }

    /// One instruction line.
    pub fn ins(&mut self, instruction: &str) {
        let _ = writeln!(self.text, "    {}", instruction);
    }

    /// One instruction line with a trailing comment.
    pub fn ins_note(&mut self, instruction: &str, note: &str) {
        let _ = writeln!(self.text, "    {:<40} # {}", instruction, note);
    }

    /// A comment-only line.
    pub fn note(&mut self, note: &str) {
        let _ = writeln!(self.text, "    # {}", note);
    }

    /// An assembler directive (no indent rules beyond the default).
    pub fn directive(&mut self, directive: &str) {
        let _ = writeln!(self.text, "{}", directive);
    }

    /// Bind a label at the current position.
    pub fn bind(&mut self, label: &str) {
        let _ = writeln!(self.text, "{}:", label);
    }

    /// Allocate a fresh function-local label.
    pub fn fresh_label(&mut self, hint: &str) -> String {
        let label = format!(".L{}_{}", hint, self.label_counter);
        self.label_counter += 1;
        label
    }

    /// Call a runtime helper whose address is embedded as an immediate.
    /// Clobbers `rax` and the argument registers already loaded by the
    /// caller.
    pub fn call_helper(&mut self, address: u64, name: &str) {
        self.ins_note(&format!("movabs ${:#x}, %rax", address), name);
        self.ins("call *%rax");
    }

    /// Append raw text (used for the unwind appendix).
    pub fn append_raw(&mut self, raw: &str) {
        self.text.push_str(raw);
    }

    pub fn finish(self) -> String {
        self.text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labels_are_unique() {
        let mut asm = Asm::new();
        let a = asm.fresh_label("if_end");
        let b = asm.fresh_label("if_end");
        assert_ne!(a, b);
    }

    #[test]
    fn test_helper_call_embeds_address() {
        let mut asm = Asm::new();
        asm.call_helper(0x1234_5678_9abc, "girder_rt_add");
        let text = asm.finish();
        assert!(text.contains("movabs $0x123456789abc, %rax"));
        assert!(text.contains("call *%rax"));
        assert!(text.contains("girder_rt_add"));
    }
}
