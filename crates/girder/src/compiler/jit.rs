//! External Assembler and Loader
//!
//! Compiled functions travel through the filesystem: the emitted text is
//! written to a scratch `.s` file, assembled and linked into a shared
//! object by the system toolchain (`cc -shared`), loaded with
//! `libc::dlopen`, and the entry symbol resolved with `dlsym`. The
//! emitted text references no external symbols - helper addresses are
//! embedded as immediates - so the object carries no relocations and
//! loads anywhere.
//!
//! Loaded objects stay open for the environment's lifetime; the registry
//! also pins every interned string whose block address was baked into the
//! text.

use crate::environment::CompiledEntry;
use crate::error::CompileError;
use crate::string::GirderString;
use std::collections::HashMap;
use std::ffi::CString;
use std::path::PathBuf;
use std::process::Command;

struct LoadedObject {
    handle: *mut libc::c_void,
    path: PathBuf,
}

impl Drop for LoadedObject {
    fn drop(&mut self) {
        unsafe {
            libc::dlclose(self.handle);
        }
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Per-environment JIT state: compiled entries, loaded objects, pinned
/// strings, and the scratch directory.
pub(crate) struct JitState {
    entries: HashMap<u64, CompiledEntry>,
    objects: Vec<LoadedObject>,
    pinned: Vec<GirderString>,
    /// Emitted text per function, kept for diagnostics.
    listings: HashMap<u64, String>,
    scratch_dir: Option<PathBuf>,
    counter: usize,
}

impl JitState {
    pub fn new() -> Self {
        JitState {
            entries: HashMap::new(),
            objects: Vec::new(),
            pinned: Vec::new(),
            listings: HashMap::new(),
            scratch_dir: None,
            counter: 0,
        }
    }

    pub fn entry(&self, id: u64) -> Option<CompiledEntry> {
        self.entries.get(&id).copied()
    }

    pub fn listing(&self, id: u64) -> Option<&str> {
        self.listings.get(&id).map(String::as_str)
    }

    pub fn register(
        &mut self,
        id: u64,
        entry: CompiledEntry,
        listing: String,
        pinned: Vec<GirderString>,
    ) {
        self.entries.insert(id, entry);
        self.listings.insert(id, listing);
        self.pinned.extend(pinned);
    }

    fn scratch_dir(&mut self) -> Result<PathBuf, CompileError> {
        if let Some(dir) = &self.scratch_dir {
            return Ok(dir.clone());
        }
        let dir = std::env::temp_dir().join(format!("girder-jit-{}", std::process::id()));
        std::fs::create_dir_all(&dir)?;
        self.scratch_dir = Some(dir.clone());
        Ok(dir)
    }

    /// Assemble one function's text and resolve its entry point.
    pub fn assemble(&mut self, id: u64, text: &str) -> Result<CompiledEntry, CompileError> {
        let dir = self.scratch_dir()?;
        let stem = format!("fn_{}_{}", id, self.counter);
        self.counter += 1;
        let source_path = dir.join(format!("{}.s", stem));
        let object_path = dir.join(format!("{}.so", stem));
        std::fs::write(&source_path, text)?;

        let output = Command::new("cc")
            .arg("-shared")
            .arg("-nostdlib")
            .arg("-o")
            .arg(&object_path)
            .arg(&source_path)
            .output()
            .map_err(|e| {
                CompileError::Assembler(format!(
                    "failed to run the system assembler (cc): {}",
                    e
                ))
            })?;
        if !output.status.success() {
            return Err(CompileError::Assembler(format!(
                "cc exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        let _ = std::fs::remove_file(&source_path);

        let path_c = CString::new(object_path.display().to_string())
            .map_err(|_| CompileError::Loader("object path contains NUL".to_string()))?;
        let handle = unsafe { libc::dlopen(path_c.as_ptr(), libc::RTLD_NOW) };
        if handle.is_null() {
            return Err(CompileError::Loader(dlerror_string()));
        }
        self.objects.push(LoadedObject {
            handle,
            path: object_path,
        });

        let symbol = CString::new(entry_symbol(id)).expect("symbol has no NUL");
        let address = unsafe { libc::dlsym(handle, symbol.as_ptr()) };
        if address.is_null() {
            return Err(CompileError::Loader(format!(
                "entry symbol {} missing: {}",
                entry_symbol(id),
                dlerror_string()
            )));
        }
        // Safety: the symbol was emitted with the compiled-entry ABI.
        let entry = unsafe {
            std::mem::transmute::<*mut libc::c_void, CompiledEntry>(address)
        };
        Ok(entry)
    }
}

impl Drop for JitState {
    fn drop(&mut self) {
        if let Some(dir) = &self.scratch_dir {
            // Objects are removed by their own drops first.
            self.objects.clear();
            let _ = std::fs::remove_dir(dir);
        }
    }
}

pub(crate) fn entry_symbol(id: u64) -> String {
    format!("girder_fn_{}", id)
}

fn dlerror_string() -> String {
    let message = unsafe { libc::dlerror() };
    if message.is_null() {
        "unknown dlopen error".to_string()
    } else {
        unsafe { std::ffi::CStr::from_ptr(message) }
            .to_string_lossy()
            .into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_symbol_shape() {
        assert_eq!(entry_symbol(7), "girder_fn_7");
    }

    #[test]
    fn test_state_starts_empty() {
        let state = JitState::new();
        assert!(state.entry(0).is_none());
        assert!(state.listing(0).is_none());
    }
}
