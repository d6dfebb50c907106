//! Error Taxonomy
//!
//! Three user-visible failure families:
//!
//! - **Syntax errors** from the lexer/parser, carrying a source origin,
//!   byte index, row/column, and the offending line. Never recovered
//!   internally.
//! - **Runtime errors**, thrown by the engine or by script via `throw`.
//!   Carry an exception-type name, an arbitrary payload value, and the
//!   stack trace captured at the throw site. Recoverable only at a host
//!   `call` boundary.
//! - **Compile errors** from the native-code provider (assembler or loader
//!   failure, constructs the provider rejects).
//!
//! While an exception is in flight, fallible engine paths return
//! `Err(Unwind)`; the exception type and payload live in the environment's
//! current-exception slot until the enclosing `call` boundary converts them
//! into a `RuntimeError`.

use crate::stack_trace::StackTrace;
use crate::value::Value;
use std::fmt;
use std::path::PathBuf;

/// Marker for an in-flight exception. Carries no data: the type and
/// payload sit in the environment's exception slot until the `call`
/// boundary recovers them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Unwind;

/// Result of any engine operation that can throw.
pub type EvalResult<T> = Result<T, Unwind>;

/// Where a piece of source text came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceOrigin {
    File(PathBuf),
    Immediate,
}

impl fmt::Display for SourceOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceOrigin::File(path) => write!(f, "{}", path.display()),
            SourceOrigin::Immediate => write!(f, "<immediate>"),
        }
    }
}

/// Lexer or parser failure.
#[derive(Debug, Clone, PartialEq)]
pub struct SyntaxError {
    pub origin: SourceOrigin,
    /// Byte index into the source.
    pub index: usize,
    /// 1-indexed row.
    pub row: usize,
    /// 1-indexed column.
    pub column: usize,
    /// The offending source line.
    pub line: String,
    pub message: String,
}

impl fmt::Display for SyntaxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "syntax error: {} [{}:{}:{}]",
            self.message, self.origin, self.row, self.column
        )?;
        write!(f, "    {}", self.line)
    }
}

impl std::error::Error for SyntaxError {}

/// A runtime error recovered at a `call` boundary.
#[derive(Debug)]
pub struct RuntimeError {
    /// Exception-type name, e.g. "TypeError" or a user-chosen string.
    pub kind: String,
    /// Arbitrary payload value; must not outlive the owning environment.
    pub payload: Value,
    /// Stack trace captured at the throw site.
    pub trace: StackTrace,
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {}",
            self.kind,
            self.payload.to_display_string()
        )?;
        for frame in self.trace.frames() {
            write!(f, "\n    {}", frame)?;
        }
        Ok(())
    }
}

impl std::error::Error for RuntimeError {}

/// Native-code provider failure.
#[derive(Debug)]
pub enum CompileError {
    /// A construct the provider does not emit (e.g. switch/class bodies).
    Unsupported(String),
    /// The external assembler rejected the emitted text or could not run.
    Assembler(String),
    /// The assembled object could not be loaded or its entry resolved.
    Loader(String),
    /// Writing intermediate files failed.
    Io(std::io::Error),
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompileError::Unsupported(what) => {
                write!(f, "native compiler does not support {}", what)
            }
            CompileError::Assembler(msg) => write!(f, "assembler failed: {}", msg),
            CompileError::Loader(msg) => write!(f, "loading compiled code failed: {}", msg),
            CompileError::Io(e) => write!(f, "compile i/o error: {}", e),
        }
    }
}

impl std::error::Error for CompileError {}

impl From<std::io::Error> for CompileError {
    fn from(e: std::io::Error) -> Self {
        CompileError::Io(e)
    }
}

/// Any failure surfaced by the public API.
#[derive(Debug)]
pub enum GirderError {
    Syntax(SyntaxError),
    Compile(CompileError),
    Runtime(RuntimeError),
    Io(std::io::Error),
}

impl fmt::Display for GirderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GirderError::Syntax(e) => write!(f, "{}", e),
            GirderError::Compile(e) => write!(f, "{}", e),
            GirderError::Runtime(e) => write!(f, "{}", e),
            GirderError::Io(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for GirderError {}

impl From<SyntaxError> for GirderError {
    fn from(e: SyntaxError) -> Self {
        GirderError::Syntax(e)
    }
}

impl From<CompileError> for GirderError {
    fn from(e: CompileError) -> Self {
        GirderError::Compile(e)
    }
}

impl From<RuntimeError> for GirderError {
    fn from(e: RuntimeError) -> Self {
        GirderError::Runtime(e)
    }
}

impl From<std::io::Error> for GirderError {
    fn from(e: std::io::Error) -> Self {
        GirderError::Io(e)
    }
}

/// Built-in exception-type names the engine itself throws with.
pub mod exception {
    /// Default type for a bare `throw`.
    pub const NONE: &str = "None";
    pub const TYPE_ERROR: &str = "TypeError";
    pub const INDEX_ERROR: &str = "IndexError";
    pub const UNSUPPORTED_OPERATION: &str = "UnsupportedOperation";
    pub const CALL_DEPTH: &str = "CallDepthError";
    pub const REGEX_ERROR: &str = "RegexError";
    pub const JSON_ERROR: &str = "JsonError";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_syntax_error_render() {
        let e = SyntaxError {
            origin: SourceOrigin::Immediate,
            index: 12,
            row: 2,
            column: 5,
            line: "local x = ;".to_string(),
            message: "expected expression".to_string(),
        };
        let rendered = e.to_string();
        assert!(rendered.contains("expected expression"));
        assert!(rendered.contains("<immediate>:2:5"));
        assert!(rendered.contains("local x = ;"));
    }

    #[test]
    fn test_runtime_error_render() {
        let e = RuntimeError {
            kind: "E".to_string(),
            payload: Value::integer(7),
            trace: StackTrace::new(),
        };
        assert_eq!(e.to_string(), "E: 7");
    }
}
