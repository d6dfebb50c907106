//! Stack Trace
//!
//! The environment keeps one active trace: a stack of frame records pushed
//! at function entry and popped at exit by both providers. Throwing
//! snapshots the active trace into the resulting runtime error.

use std::fmt;

/// How a callable came to exist. Recorded at registration and shown in
/// trace lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionOrigin {
    /// Compiled from a source file.
    File,
    /// Compiled from an in-memory string.
    Immediate,
    /// Part of the standard library.
    Library,
    /// Bound from a host function pointer.
    Bound,
    /// Engine-internal plumbing.
    Internal,
}

impl fmt::Display for FunctionOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            FunctionOrigin::File => "file",
            FunctionOrigin::Immediate => "immediate",
            FunctionOrigin::Library => "library",
            FunctionOrigin::Bound => "bound",
            FunctionOrigin::Internal => "internal",
        };
        write!(f, "{}", text)
    }
}

/// One active call.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceFrame {
    pub function: String,
    pub origin: FunctionOrigin,
    /// 1-indexed row/column of the call site, when known.
    pub position: Option<(usize, usize)>,
}

impl fmt::Display for TraceFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.position {
            Some((row, column)) => {
                write!(f, "at {} [{}] {}:{}", self.function, self.origin, row, column)
            }
            None => write!(f, "at {} [{}]", self.function, self.origin),
        }
    }
}

/// Stack of active frames, innermost last.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StackTrace {
    frames: Vec<TraceFrame>,
}

impl StackTrace {
    pub fn new() -> Self {
        StackTrace { frames: Vec::new() }
    }

    pub fn push(&mut self, frame: TraceFrame) {
        self.frames.push(frame);
    }

    pub fn pop(&mut self) {
        self.frames.pop();
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Frames innermost-first, the order trace lines are printed.
    pub fn frames(&self) -> impl Iterator<Item = &TraceFrame> {
        self.frames.iter().rev()
    }

    /// Snapshot for embedding into a runtime error.
    pub fn capture(&self) -> StackTrace {
        self.clone()
    }

    /// Drop frames above `depth`, used when a handler boundary recovers.
    pub fn truncate(&mut self, depth: usize) {
        self.frames.truncate(depth);
    }
}

impl fmt::Display for StackTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, frame) in self.frames().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "    {}", frame)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frames_render_innermost_first() {
        let mut trace = StackTrace::new();
        trace.push(TraceFrame {
            function: "outer".to_string(),
            origin: FunctionOrigin::Immediate,
            position: None,
        });
        trace.push(TraceFrame {
            function: "inner".to_string(),
            origin: FunctionOrigin::Immediate,
            position: Some((3, 1)),
        });
        let lines: Vec<String> = trace.frames().map(|f| f.to_string()).collect();
        assert_eq!(lines[0], "at inner [immediate] 3:1");
        assert_eq!(lines[1], "at outer [immediate]");
    }

    #[test]
    fn test_truncate_to_handler_depth() {
        let mut trace = StackTrace::new();
        for name in ["a", "b", "c"] {
            trace.push(TraceFrame {
                function: name.to_string(),
                origin: FunctionOrigin::Internal,
                position: None,
            });
        }
        trace.truncate(1);
        assert_eq!(trace.depth(), 1);
        assert_eq!(trace.frames().next().unwrap().function, "a");
    }
}
