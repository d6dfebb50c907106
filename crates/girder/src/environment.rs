//! Environment - Process-Wide Runtime State
//!
//! One environment owns everything a running script can reach: the intern
//! map, the global table, the per-type method tables consulted by
//! selection, the native-class registry, the function registry, four
//! redirectable I/O streams, the current-exception slot, the active stack
//! trace, and the argument-passing slot shared by every call.
//!
//! # Memory Layout
//!
//! `#[repr(C)]` with the `EnvHeader` as the first field: natively compiled
//! code addresses the argument slot, the unwinding flag, and the logical
//! frame chain directly through `offset_of!` offsets baked in at code
//! generation.
//!
//! # Threading
//!
//! An environment is single-threaded by design. The argument slot is valid
//! only between the caller writing it and the callee reading it; the
//! exception slot is valid only while unwinding. Raw handles make the type
//! `!Send` automatically.

use crate::error::{EvalResult, GirderError, RuntimeError, SourceOrigin, Unwind, exception};
use crate::interner::Interner;
use crate::interpreter;
use crate::object;
use crate::parser;
use crate::stack_trace::{FunctionOrigin, StackTrace, TraceFrame};
use crate::string::GirderString;
use crate::table::GirderTable;
use crate::value::{Value, ValueKind};
use crate::{ast, compiler};
use std::collections::HashMap;
use std::io::{BufRead, Write};
use std::path::Path;
use std::rc::Rc;

/// Which execution provider the environment drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProviderKind {
    #[default]
    Interpreter,
    Compiler,
}

/// JIT-visible prefix of the environment. Field offsets are part of the
/// compiled-code ABI; layout asserted by tests.
#[repr(C)]
pub struct EnvHeader {
    /// Argument slot: pointer + count, set by the caller immediately
    /// before a call and consumed by the callee on entry.
    pub args_ptr: *const Value,
    pub args_len: usize,
    /// Non-zero while an exception unwinds. Compiled code tests this after
    /// every call site.
    pub unwinding: u8,
    _pad: [u8; 7],
    /// Top of the logical call chain maintained by compiled frames.
    pub frame_top: *mut CallFrame,
}

/// Logical call-chain node. Compiled code allocates one per frame on its
/// own machine stack, links it at entry, and unlinks it at exit; the chain
/// supplies stack traces for natively compiled frames.
#[repr(C)]
pub struct CallFrame {
    pub parent: *mut CallFrame,
    /// Base of this frame's locals region.
    pub locals: *mut Value,
    pub locals_count: usize,
    /// Function id in the registry (for trace rendering).
    pub function_id: u64,
}

/// Entry point of a natively compiled function.
pub type CompiledEntry = unsafe extern "C" fn(*mut Value, *mut Environment);

/// A host-facing native binding. Arguments arrive as a borrowed slice read
/// from the environment's argument slot; the return value is the result.
pub type NativeFunction = fn(&mut Environment, &[Value]) -> EvalResult<Value>;

/// Script function payload: parameter names plus the body AST.
pub struct ScriptFunction {
    pub params: Vec<GirderString>,
    pub body: Rc<ast::Block>,
}

pub enum FunctionBody {
    Script(Rc<ScriptFunction>),
    Native(NativeFunction),
}

/// Registry record for every callable: source name, origin kind, numeric
/// id, and the body. Powers stack traces and reflection.
pub struct FunctionInfo {
    pub name: String,
    pub origin: FunctionOrigin,
    pub id: u64,
    pub body: FunctionBody,
    /// Free-form key-value info supplied at registration ("FILE", ...).
    pub info: HashMap<String, String>,
}

/// Opaque callable produced by `compile_*` and `bind`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Callable {
    id: u64,
}

impl Callable {
    pub(crate) fn new(id: u64) -> Self {
        Callable { id }
    }

    /// Rebuild a callable from a function value, e.g. one returned by a
    /// script.
    pub fn from_value(value: &Value) -> Option<Callable> {
        value.as_function_id().map(Callable::new)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// The callable as a first-class language value.
    pub fn as_value(&self) -> Value {
        Value::function(self.id)
    }
}

/// Redirectable I/O streams.
pub struct Streams {
    pub input: Box<dyn BufRead>,
    pub output: Box<dyn Write>,
    pub log: Box<dyn Write>,
    pub error: Box<dyn Write>,
}

impl Default for Streams {
    fn default() -> Self {
        Streams {
            input: Box::new(std::io::BufReader::new(std::io::stdin())),
            output: Box::new(std::io::stdout()),
            log: Box::new(std::io::stderr()),
            error: Box::new(std::io::stderr()),
        }
    }
}

/// Nested host-call handler capacity. The 33rd nested `call` raises a
/// runtime error rather than overflowing.
pub const MAX_HANDLER_DEPTH: usize = 32;

#[repr(C)]
pub struct Environment {
    header: EnvHeader,

    globals: GirderTable,
    /// Method table consulted by selection on strings.
    string_vtable: GirderTable,
    /// Method table consulted by selection on arrays.
    array_vtable: GirderTable,
    native_classes: HashMap<Value, Rc<crate::native::VirtualTable>>,
    functions: Vec<FunctionInfo>,
    streams: Streams,

    exception_kind: Option<GirderString>,
    exception_payload: Value,
    exception_trace: StackTrace,
    trace: StackTrace,

    provider: ProviderKind,
    jit: compiler::JitState,
    handler_depth: usize,

    /// Dropped last so heap blocks freed by earlier fields can purge their
    /// intern entries.
    interner: Box<Interner>,
}

impl Environment {
    pub fn new(provider: ProviderKind) -> Box<Environment> {
        let mut env = Box::new(Environment {
            header: EnvHeader {
                args_ptr: std::ptr::null(),
                args_len: 0,
                unwinding: 0,
                _pad: [0; 7],
                frame_top: std::ptr::null_mut(),
            },
            globals: GirderTable::new(),
            string_vtable: GirderTable::new(),
            array_vtable: GirderTable::new(),
            native_classes: HashMap::new(),
            functions: Vec::new(),
            streams: Streams::default(),
            exception_kind: None,
            exception_payload: Value::null(),
            exception_trace: StackTrace::new(),
            trace: StackTrace::new(),
            provider,
            jit: compiler::JitState::new(),
            handler_depth: 0,
            interner: Box::new(Interner::new()),
        });
        crate::stdlib::load(&mut env);
        env
    }

    pub fn provider(&self) -> ProviderKind {
        self.provider
    }

    pub fn set_provider(&mut self, provider: ProviderKind) {
        self.provider = provider;
    }

    // ------------------------------------------------------------------
    // Interning and root tables
    // ------------------------------------------------------------------

    pub fn intern(&mut self, content: &str) -> GirderString {
        self.interner.intern(content)
    }

    pub fn globals(&self) -> &GirderTable {
        &self.globals
    }

    pub fn string_vtable(&self) -> &GirderTable {
        &self.string_vtable
    }

    pub fn array_vtable(&self) -> &GirderTable {
        &self.array_vtable
    }

    /// Define a global by name.
    pub fn set_global(&mut self, name: &str, value: Value) {
        let key = Value::from(self.intern(name));
        self.globals.set(key, value);
    }

    /// Read a global by name; absent reads as null.
    pub fn global(&mut self, name: &str) -> Value {
        let key = Value::from(self.intern(name));
        self.globals.get(&key)
    }

    // ------------------------------------------------------------------
    // Native classes
    // ------------------------------------------------------------------

    /// Register a native class under an identifier. Also publishes a
    /// global of the same name holding the class object, so script can
    /// reach static methods and `new`.
    pub fn register_native_class(
        &mut self,
        name: &str,
        vtable: crate::native::VirtualTable,
    ) -> Rc<crate::native::VirtualTable> {
        let vtable = Rc::new(vtable);
        let identifier = Value::from(self.intern(name));
        self.native_classes.insert(identifier, Rc::clone(&vtable));

        let class_object =
            crate::native::GirderNative::new(Rc::clone(&vtable), Box::new(()));
        self.set_global(name, Value::from(class_object));
        vtable
    }

    pub fn native_class(&mut self, name: &str) -> Option<Rc<crate::native::VirtualTable>> {
        let identifier = Value::from(self.intern(name));
        self.native_classes.get(&identifier).cloned()
    }

    // ------------------------------------------------------------------
    // Function registry
    // ------------------------------------------------------------------

    pub fn register_function(
        &mut self,
        name: impl Into<String>,
        origin: FunctionOrigin,
        body: FunctionBody,
        info: HashMap<String, String>,
    ) -> u64 {
        let id = self.functions.len() as u64;
        self.functions.push(FunctionInfo {
            name: name.into(),
            origin,
            id,
            body,
            info,
        });
        id
    }

    pub fn function_info(&self, id: u64) -> Option<&FunctionInfo> {
        self.functions.get(id as usize)
    }

    pub fn function_count(&self) -> usize {
        self.functions.len()
    }

    // ------------------------------------------------------------------
    // Compilation and binding
    // ------------------------------------------------------------------

    /// Compile source text into a callable that runs the program body.
    pub fn compile_source(
        &mut self,
        source: &str,
        name: &str,
        info: HashMap<String, String>,
    ) -> Result<Callable, GirderError> {
        self.compile_with_origin(source, name, SourceOrigin::Immediate, FunctionOrigin::Immediate, info)
    }

    /// Read and compile a file; records the path under the "FILE" info key.
    pub fn compile_file(
        &mut self,
        path: impl AsRef<Path>,
        name: &str,
        mut info: HashMap<String, String>,
    ) -> Result<Callable, GirderError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)?;
        info.insert("FILE".to_string(), path.display().to_string());
        self.compile_with_origin(
            &source,
            name,
            SourceOrigin::File(path.to_path_buf()),
            FunctionOrigin::File,
            info,
        )
    }

    fn compile_with_origin(
        &mut self,
        source: &str,
        name: &str,
        source_origin: SourceOrigin,
        origin: FunctionOrigin,
        info: HashMap<String, String>,
    ) -> Result<Callable, GirderError> {
        tracing::debug!(name, ?origin, "compiling source");
        let block = parser::parse(source, source_origin)?;
        let function = Rc::new(ScriptFunction {
            params: Vec::new(),
            body: Rc::new(block),
        });
        let id = self.register_function(name, origin, FunctionBody::Script(function), info);
        if self.provider == ProviderKind::Compiler {
            compiler::compile_function(self, id).map_err(GirderError::Compile)?;
        }
        Ok(Callable::new(id))
    }

    /// Bind a host function as a callable.
    pub fn bind(
        &mut self,
        function: NativeFunction,
        name: impl Into<String>,
        info: HashMap<String, String>,
    ) -> Callable {
        let id = self.register_function(name, FunctionOrigin::Bound, FunctionBody::Native(function), info);
        Callable::new(id)
    }

    /// Bind a standard-library function.
    pub(crate) fn bind_library(
        &mut self,
        function: NativeFunction,
        name: impl Into<String>,
    ) -> Callable {
        let id = self.register_function(
            name,
            FunctionOrigin::Library,
            FunctionBody::Native(function),
            HashMap::new(),
        );
        Callable::new(id)
    }

    // ------------------------------------------------------------------
    // Exceptions
    // ------------------------------------------------------------------

    /// Record an exception and start unwinding. Returns the `Unwind`
    /// marker so throw sites read `return Err(env.throw(...))`.
    pub fn throw(&mut self, kind: &str, payload: Value) -> Unwind {
        let kind = self.intern(kind);
        tracing::trace!(kind = kind.as_str(), "throw");
        self.exception_kind = Some(kind);
        self.exception_payload = payload;
        self.exception_trace = self.capture_trace();
        self.header.unwinding = 1;
        Unwind
    }

    /// Convenience for engine-raised errors with string payloads.
    pub fn throw_message(&mut self, kind: &str, message: impl Into<String>) -> Unwind {
        let payload = Value::from(self.intern(&message.into()));
        self.throw(kind, payload)
    }

    pub fn is_unwinding(&self) -> bool {
        self.header.unwinding != 0
    }

    /// Exception type name while unwinding.
    pub fn exception_kind(&self) -> Option<&GirderString> {
        self.exception_kind.as_ref()
    }

    pub fn exception_payload(&self) -> &Value {
        &self.exception_payload
    }

    /// Consume the exception slot into a host-facing error; ends the
    /// unwind.
    fn recover(&mut self) -> RuntimeError {
        self.header.unwinding = 0;
        let kind = self
            .exception_kind
            .take()
            .map(|s| s.as_str().to_string())
            .unwrap_or_else(|| exception::NONE.to_string());
        let payload = std::mem::take(&mut self.exception_payload);
        let trace = std::mem::take(&mut self.exception_trace);
        RuntimeError {
            kind,
            payload,
            trace,
        }
    }

    // ------------------------------------------------------------------
    // Stack trace
    // ------------------------------------------------------------------

    pub fn trace(&self) -> &StackTrace {
        &self.trace
    }

    pub(crate) fn push_trace_frame(&mut self, id: u64) {
        let frame = match self.function_info(id) {
            Some(info) => TraceFrame {
                function: info.name.clone(),
                origin: info.origin,
                position: None,
            },
            None => TraceFrame {
                function: format!("<unknown:{}>", id),
                origin: FunctionOrigin::Internal,
                position: None,
            },
        };
        self.trace.push(frame);
    }

    pub(crate) fn pop_trace_frame(&mut self) {
        self.trace.pop();
    }

    /// Interpreter frames plus the logical chain of compiled frames,
    /// innermost last.
    fn capture_trace(&self) -> StackTrace {
        let mut captured = self.trace.capture();
        let mut node = self.header.frame_top;
        let mut compiled = Vec::new();
        while let Some(frame) = unsafe { node.as_ref() } {
            compiled.push(frame.function_id);
            node = frame.parent;
        }
        for id in compiled.into_iter().rev() {
            if let Some(info) = self.function_info(id) {
                captured.push(TraceFrame {
                    function: info.name.clone(),
                    origin: info.origin,
                    position: None,
                });
            }
        }
        captured
    }

    // ------------------------------------------------------------------
    // Calls
    // ------------------------------------------------------------------

    /// Host-boundary call: invokes a callable and recovers any runtime
    /// error. This is where the bounded handler stack lives.
    pub fn call(&mut self, callable: &Callable, args: &[Value]) -> Result<Value, RuntimeError> {
        if self.handler_depth >= MAX_HANDLER_DEPTH {
            let unwind = self.throw_message(
                exception::CALL_DEPTH,
                format!("nested call depth exceeds {}", MAX_HANDLER_DEPTH),
            );
            let _ = unwind;
            return Err(self.recover());
        }
        self.handler_depth += 1;
        let trace_snapshot = self.trace.depth();

        let result = self.invoke(callable.id(), args);

        self.handler_depth -= 1;
        match result {
            Ok(value) => Ok(value),
            Err(Unwind) => {
                // Frames between the handler snapshot and the throw site
                // have already cleaned their locals while propagating.
                self.trace.truncate(trace_snapshot);
                Err(self.recover())
            }
        }
    }

    /// Internal call on a function value: arguments through the slot, error
    /// propagation through `Unwind`.
    pub fn invoke(&mut self, id: u64, args: &[Value]) -> EvalResult<Value> {
        let Some(info) = self.function_info(id) else {
            return Err(self.throw_message(
                exception::TYPE_ERROR,
                format!("no such function: {}", id),
            ));
        };
        match &info.body {
            FunctionBody::Native(function) => {
                let function = *function;
                self.push_trace_frame(id);
                let result = function(self, args);
                self.pop_trace_frame();
                result
            }
            FunctionBody::Script(function) => {
                let function = Rc::clone(function);
                match self.provider {
                    ProviderKind::Interpreter => {
                        self.push_trace_frame(id);
                        let result = interpreter::call_script(self, &function, args);
                        self.pop_trace_frame();
                        result
                    }
                    ProviderKind::Compiler => {
                        let entry = match self.jit.entry(id) {
                            Some(entry) => entry,
                            None => {
                                compiler::compile_function(self, id).map_err(|e| {
                                    self.throw_message(
                                        exception::TYPE_ERROR,
                                        format!("native compilation failed: {}", e),
                                    )
                                })?;
                                self.jit.entry(id).expect("entry registered by compile")
                            }
                        };
                        self.call_compiled(entry, args)
                    }
                }
            }
        }
    }

    /// Call any callee value: function handles dispatch through the
    /// registry, native objects through their call slot.
    pub fn call_value(&mut self, callee: &Value, args: &[Value]) -> EvalResult<Value> {
        match callee.kind() {
            ValueKind::Function => {
                let id = callee.as_function_id().expect("function cell");
                self.invoke(id, args)
            }
            ValueKind::NativeObject => object::call_native(self, callee, args),
            other => Err(self.throw_message(
                exception::TYPE_ERROR,
                format!("cannot call a value of type {}", other.name()),
            )),
        }
    }

    /// Run a compiled entry point against the argument slot.
    fn call_compiled(&mut self, entry: CompiledEntry, args: &[Value]) -> EvalResult<Value> {
        let mut ret = Value::null();
        self.set_args(args);
        unsafe {
            entry(&mut ret as *mut Value, self as *mut Environment);
        }
        self.clear_args();
        if self.is_unwinding() {
            Err(Unwind)
        } else {
            Ok(ret)
        }
    }

    /// Point the argument slot at a borrowed slice for the duration of one
    /// call. A callee that calls again must copy its arguments out first.
    pub(crate) fn set_args(&mut self, args: &[Value]) {
        self.header.args_ptr = args.as_ptr();
        self.header.args_len = args.len();
    }

    pub(crate) fn clear_args(&mut self) {
        self.header.args_ptr = std::ptr::null();
        self.header.args_len = 0;
    }

    /// Copy the current arguments out of the slot.
    pub fn args(&self) -> Vec<Value> {
        if self.header.args_ptr.is_null() {
            return Vec::new();
        }
        let slice =
            unsafe { std::slice::from_raw_parts(self.header.args_ptr, self.header.args_len) };
        slice.to_vec()
    }

    // ------------------------------------------------------------------
    // Streams
    // ------------------------------------------------------------------

    pub fn set_input(&mut self, input: Box<dyn BufRead>) {
        self.streams.input = input;
    }

    pub fn set_output(&mut self, output: Box<dyn Write>) {
        self.streams.output = output;
    }

    pub fn set_log(&mut self, log: Box<dyn Write>) {
        self.streams.log = log;
    }

    pub fn set_error(&mut self, error: Box<dyn Write>) {
        self.streams.error = error;
    }

    pub fn output(&mut self) -> &mut dyn Write {
        self.streams.output.as_mut()
    }

    pub fn log(&mut self) -> &mut dyn Write {
        self.streams.log.as_mut()
    }

    pub fn error_stream(&mut self) -> &mut dyn Write {
        self.streams.error.as_mut()
    }

    pub fn input(&mut self) -> &mut dyn BufRead {
        self.streams.input.as_mut()
    }

    // ------------------------------------------------------------------
    // JIT plumbing
    // ------------------------------------------------------------------

    pub(crate) fn jit(&self) -> &compiler::JitState {
        &self.jit
    }

    pub(crate) fn jit_mut(&mut self) -> &mut compiler::JitState {
        &mut self.jit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::offset_of;

    #[test]
    fn test_header_layout() {
        // Compiled code addresses these fields; the header must sit at
        // offset 0 with this exact field order.
        assert_eq!(offset_of!(Environment, header), 0);
        assert_eq!(offset_of!(EnvHeader, args_ptr), 0);
        assert_eq!(offset_of!(EnvHeader, args_len), 8);
        assert_eq!(offset_of!(EnvHeader, unwinding), 16);
        assert_eq!(offset_of!(EnvHeader, frame_top), 24);
    }

    #[test]
    fn test_intern_through_environment() {
        let mut env = Environment::new(ProviderKind::Interpreter);
        let a = env.intern("twice");
        let b = env.intern("twice");
        assert_eq!(a, b);
        assert_eq!(a.as_ptr(), b.as_ptr());
    }

    #[test]
    fn test_globals_round_trip() {
        let mut env = Environment::new(ProviderKind::Interpreter);
        env.set_global("answer", Value::integer(42));
        assert_eq!(env.global("answer"), Value::integer(42));
        assert!(env.global("missing").is_null());
    }

    #[test]
    fn test_bind_and_call_native() {
        fn double(env: &mut Environment, args: &[Value]) -> EvalResult<Value> {
            match args.first().and_then(Value::as_integer) {
                Some(n) => Ok(Value::integer(n * 2)),
                None => Err(env.throw_message(exception::TYPE_ERROR, "expected an integer")),
            }
        }

        let mut env = Environment::new(ProviderKind::Interpreter);
        let callable = env.bind(double, "double", HashMap::new());
        let result = env.call(&callable, &[Value::integer(21)]).unwrap();
        assert_eq!(result, Value::integer(42));
    }

    #[test]
    fn test_native_throw_recovers_at_boundary() {
        fn boom(env: &mut Environment, _args: &[Value]) -> EvalResult<Value> {
            let payload = Value::from(env.intern("msg"));
            Err(env.throw("E", payload))
        }

        let mut env = Environment::new(ProviderKind::Interpreter);
        let callable = env.bind(boom, "boom", HashMap::new());
        let error = env.call(&callable, &[]).unwrap_err();
        assert_eq!(error.kind, "E");
        assert_eq!(error.payload.as_str(), Some("msg"));
        assert!(!env.is_unwinding());
    }

    #[test]
    fn test_handler_depth_limit() {
        fn recurse(env: &mut Environment, args: &[Value]) -> EvalResult<Value> {
            let callable = Callable::new(args[0].as_function_id().unwrap());
            match env.call(&callable, args) {
                Ok(v) => Ok(v),
                Err(e) => {
                    let payload = Value::from(env.intern(&e.kind));
                    Err(env.throw(&e.kind, payload))
                }
            }
        }

        let mut env = Environment::new(ProviderKind::Interpreter);
        let callable = env.bind(recurse, "recurse", HashMap::new());
        let self_ref = callable.as_value();
        let error = env.call(&callable, &[self_ref]).unwrap_err();
        assert_eq!(error.kind, exception::CALL_DEPTH);
    }
}
