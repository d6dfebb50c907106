//! Frame Layout and Scope Bookkeeping
//!
//! The machine frame, measured in 16-byte value cells from `%rsp` up:
//!
//! ```text
//! [ locals (max_locals) | spill (max_spill) | scratch (6 fixed cells) |
//!   frame node (32 bytes) | argument regions (sites x 16 cells) | pad ]
//! ```
//!
//! Locals are assigned slot offsets on first definition in their scope;
//! the slot counter rewinds to the scope's entry offset on exit, so
//! sibling scopes reuse slots. Every scope also owns an unwind label; call
//! sites jump to the innermost one and the labels cascade outward.

use super::CELL;
use super::DEFAULT_ARGUMENT_ALLOCATION;
use std::collections::HashMap;

/// Fixed scratch cells after the spill region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Scratch {
    /// Helper output cell.
    Out = 0,
    /// Right operand staging.
    Right = 1,
    /// Selection/index key staging.
    Key = 2,
    /// Callee cell for call sites.
    Callee = 3,
    /// Condition staging for truthiness tests.
    Cond = 4,
    /// Secondary staging (ranged selection bounds).
    Extra = 5,
}

pub(crate) const SCRATCH_CELLS: usize = 6;

/// One lexical scope: its name-to-slot map, the counter snapshot to
/// rewind to, and its unwind label.
struct Scope {
    names: HashMap<String, usize>,
    entry_counter: usize,
    /// Highest counter observed while this scope was innermost.
    high_water: usize,
    unwind_label: String,
}

/// An active loop: where `continue` and `break` jump, and how deep the
/// scope stack was at entry (so early exits dereference crossed scopes).
pub(crate) struct LoopLabels {
    pub continue_label: String,
    pub break_label: String,
    pub scope_depth: usize,
}

pub(crate) struct Frame {
    max_locals: usize,
    max_spill: usize,
    call_sites: usize,
    slot_counter: usize,
    scopes: Vec<Scope>,
    loops: Vec<LoopLabels>,
    spill_depth: usize,
}

impl Frame {
    pub fn new(max_locals: usize, max_spill: usize, call_sites: usize) -> Self {
        Frame {
            max_locals,
            max_spill,
            call_sites,
            slot_counter: 0,
            scopes: Vec::new(),
            loops: Vec::new(),
            spill_depth: 0,
        }
    }

    // ------------------------------------------------------------------
    // Layout
    // ------------------------------------------------------------------

    pub fn locals_cells(&self) -> usize {
        self.max_locals
    }

    pub fn local_offset(&self, slot: usize) -> usize {
        slot * CELL
    }

    fn spill_base(&self) -> usize {
        self.max_locals * CELL
    }

    pub fn spill_offset(&self, depth: usize) -> usize {
        debug_assert!(depth < self.max_spill);
        self.spill_base() + depth * CELL
    }

    fn scratch_base(&self) -> usize {
        self.spill_base() + self.max_spill * CELL
    }

    pub fn scratch_offset(&self, cell: Scratch) -> usize {
        self.scratch_base() + (cell as usize) * CELL
    }

    /// Byte offset of the logical frame node (32 bytes: parent, locals
    /// base, locals count, function id).
    pub fn frame_node_offset(&self) -> usize {
        self.scratch_base() + SCRATCH_CELLS * CELL
    }

    pub fn argument_region_offset(&self, site: usize) -> usize {
        debug_assert!(site < self.call_sites.max(1));
        self.frame_node_offset() + 32 + site * DEFAULT_ARGUMENT_ALLOCATION * CELL
    }

    /// Total frame size: contents rounded to 16, plus 8 so call sites see
    /// a 16-byte-aligned stack (entry `%rsp` is 8 off, and the prologue
    /// pushes six registers).
    pub fn frame_size(&self) -> usize {
        let content =
            self.frame_node_offset() + 32 + self.call_sites * DEFAULT_ARGUMENT_ALLOCATION * CELL;
        content.div_ceil(16) * 16 + 8
    }

    // ------------------------------------------------------------------
    // Scopes and locals
    // ------------------------------------------------------------------

    pub fn push_scope(&mut self, unwind_label: String) {
        self.scopes.push(Scope {
            names: HashMap::new(),
            entry_counter: self.slot_counter,
            high_water: self.slot_counter,
            unwind_label,
        });
    }

    /// Pop the innermost scope. Returns `(base slot, cell count,
    /// unwind label)` for the block-dereference the caller emits.
    pub fn pop_scope(&mut self) -> (usize, usize, String) {
        let scope = self.scopes.pop().expect("scope stack underflow");
        let base = scope.entry_counter;
        let count = scope.high_water - scope.entry_counter;
        self.slot_counter = scope.entry_counter;
        (base, count, scope.unwind_label)
    }

    pub fn scope_depth(&self) -> usize {
        self.scopes.len()
    }

    /// Define a local in the innermost scope, returning its slot.
    pub fn define_local(&mut self, name: &str) -> usize {
        let slot = self.slot_counter;
        self.slot_counter += 1;
        debug_assert!(self.slot_counter <= self.max_locals, "scan bound exceeded");
        let scope = self.scopes.last_mut().expect("a scope to define into");
        scope.names.insert(name.to_string(), slot);
        scope.high_water = scope.high_water.max(self.slot_counter);
        slot
    }

    /// Innermost-first lookup.
    pub fn resolve_local(&self, name: &str) -> Option<usize> {
        for scope in self.scopes.iter().rev() {
            if let Some(&slot) = scope.names.get(name) {
                return Some(slot);
            }
        }
        None
    }

    /// The innermost unwind label - where a failed call site jumps.
    pub fn unwind_label(&self) -> &str {
        &self
            .scopes
            .last()
            .expect("a scope for the unwind target")
            .unwind_label
    }

    /// Unwind label of the enclosing scope, for cascade emission when a
    /// scope is popped (the function scope cascades to the epilogue).
    pub fn parent_unwind_label(&self) -> Option<&str> {
        let n = self.scopes.len();
        if n >= 2 {
            Some(&self.scopes[n - 2].unwind_label)
        } else {
            None
        }
    }

    /// Scopes crossed by a jump out to `target_depth`, innermost first:
    /// `(base slot, live cell count)` pairs to dereference.
    pub fn crossed_scopes(&self, target_depth: usize) -> Vec<(usize, usize)> {
        self.scopes[target_depth..]
            .iter()
            .rev()
            .map(|scope| {
                (
                    scope.entry_counter,
                    self.slot_counter.saturating_sub(scope.entry_counter).min(
                        scope.high_water - scope.entry_counter,
                    ),
                )
            })
            .collect()
    }

    // ------------------------------------------------------------------
    // Loops
    // ------------------------------------------------------------------

    pub fn push_loop(&mut self, labels: LoopLabels) {
        self.loops.push(labels);
    }

    pub fn pop_loop(&mut self) {
        self.loops.pop();
    }

    pub fn current_loop(&self) -> Option<&LoopLabels> {
        self.loops.last()
    }

    // ------------------------------------------------------------------
    // Spill stack
    // ------------------------------------------------------------------

    /// Reserve the next spill cell; returns its byte offset.
    pub fn push_spill(&mut self) -> usize {
        let offset = self.spill_offset(self.spill_depth);
        self.spill_depth += 1;
        offset
    }

    pub fn pop_spill(&mut self) {
        debug_assert!(self.spill_depth > 0, "spill stack underflow");
        self.spill_depth -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_regions_do_not_overlap() {
        let frame = Frame::new(4, 6, 2);
        assert_eq!(frame.local_offset(3), 48);
        assert!(frame.spill_offset(0) >= 64);
        assert!(frame.scratch_offset(Scratch::Out) >= frame.spill_offset(5) + CELL);
        // The scratch bank is six distinct cells.
        let scratch = [
            Scratch::Out,
            Scratch::Right,
            Scratch::Key,
            Scratch::Callee,
            Scratch::Cond,
            Scratch::Extra,
        ];
        for pair in scratch.windows(2) {
            assert_eq!(
                frame.scratch_offset(pair[1]),
                frame.scratch_offset(pair[0]) + CELL
            );
        }
        assert!(frame.frame_node_offset() >= frame.scratch_offset(Scratch::Extra) + CELL);
        assert!(frame.argument_region_offset(0) >= frame.frame_node_offset() + 32);
        assert!(frame.argument_region_offset(1) >= frame.argument_region_offset(0) + 256);
        assert!(frame.frame_size() > frame.argument_region_offset(1));
    }

    #[test]
    fn test_frame_size_alignment() {
        // Entry rsp is 8 off alignment; six pushes keep it 8 off; the
        // frame must restore 16-byte alignment.
        for (locals, spill, sites) in [(1, 6, 0), (3, 7, 2), (10, 6, 5)] {
            let frame = Frame::new(locals, spill, sites);
            assert_eq!(frame.frame_size() % 16, 8);
        }
    }

    #[test]
    fn test_slot_counter_rewinds() {
        let mut frame = Frame::new(4, 6, 0);
        frame.push_scope(".Lu0".to_string());
        let a = frame.define_local("a");
        frame.push_scope(".Lu1".to_string());
        let b = frame.define_local("b");
        assert_eq!((a, b), (0, 1));
        assert_eq!(frame.resolve_local("b"), Some(1));

        let (base, count, _) = frame.pop_scope();
        assert_eq!((base, count), (1, 1));

        // Sibling scope reuses the slot.
        frame.push_scope(".Lu2".to_string());
        let c = frame.define_local("c");
        assert_eq!(c, 1);
        assert_eq!(frame.resolve_local("b"), None);
        assert_eq!(frame.resolve_local("a"), Some(0));
    }

    #[test]
    fn test_crossed_scopes_for_break() {
        let mut frame = Frame::new(8, 6, 0);
        frame.push_scope(".Lf".to_string());
        frame.define_local("x");
        frame.push_scope(".Lloop".to_string());
        frame.define_local("i");
        frame.push_scope(".Lbody".to_string());
        frame.define_local("y");

        // Break out of the body and the loop header scope.
        let crossed = frame.crossed_scopes(1);
        assert_eq!(crossed, vec![(2, 1), (1, 1)]);
    }
}
