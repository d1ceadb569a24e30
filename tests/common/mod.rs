//! Shared helpers for the blox integration tests.
//!
//! In a test file, add:
//! ```ignore
//! #[macro_use]
//! mod common;
//! use common::*;
//! ```

#![allow(dead_code, unused_macros)]

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

pub use blox::config::VmConfig;
pub use blox::prelude::*;
pub use blox::vm::ModuleLoader;

/// A VM that prints into a buffer.
pub fn new_vm() -> VM<Vec<u8>> {
    VM::new(VmConfig::default(), Vec::new())
}

/// Everything `vm` has printed so far.
pub fn printed(vm: &VM<Vec<u8>>) -> String {
    String::from_utf8_lossy(vm.output()).into_owned()
}

/// Runs `source` in a fresh VM and returns what it printed, or the error.
pub fn run(source: &str) -> Result<String, InterpretationError> {
    let mut vm = new_vm();
    vm.interpret(source)?;
    Ok(printed(&vm))
}

/// The message of the runtime error `source` ends with.
pub fn runtime_error(source: &str) -> String {
    match run(source) {
        Err(InterpretationError::RuntimeError(fault)) => fault.message,
        other => panic!("expected a runtime error from {source:?}, got {other:?}"),
    }
}

/// The messages of every compile error in `source`.
pub fn compile_errors(source: &str) -> Vec<String> {
    match run(source) {
        Err(InterpretationError::CompileError(diagnostics)) => {
            diagnostics.into_iter().map(|d| d.message).collect()
        }
        other => panic!("expected compile errors from {source:?}, got {other:?}"),
    }
}

/// Assert that running `source` prints exactly `expected`.
macro_rules! assert_prints {
    ($source:expr, $expected:expr) => {
        match $crate::common::run($source) {
            Ok(output) => assert_eq!(
                $expected, output,
                "output of {:?} did not match expected",
                $source
            ),
            Err(e) => panic!("failed to run {:?}: {:?}", $source, e),
        }
    };
}

/// Assert that running `source` fails at run time with `message`.
macro_rules! assert_runtime_error {
    ($source:expr, $message:expr) => {
        assert_eq!(
            $message,
            $crate::common::runtime_error($source),
            "wrong error from {:?}",
            $source
        )
    };
}

/// Serves modules from memory, keyed by the path written in the `import`.
#[derive(Debug, Default, Clone)]
pub struct MemoryLoader {
    modules: HashMap<PathBuf, String>,
}

impl MemoryLoader {
    pub fn new() -> Self {
        MemoryLoader::default()
    }

    pub fn with_module(mut self, path: &str, source: &str) -> Self {
        self.modules.insert(PathBuf::from(path), source.to_owned());
        self
    }
}

impl ModuleLoader for MemoryLoader {
    fn resolve(&self, path: &str) -> PathBuf {
        PathBuf::from(path)
    }

    fn load(&self, resolved: &Path) -> io::Result<String> {
        self.modules.get(resolved).cloned().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no module {}", resolved.display()),
            )
        })
    }
}
