//! blox: a bytecode compiler and stack virtual machine for a Lox dialect with lists, tuples,
//! dicts, exceptions and modules.
//!
//! ```
//! use blox::InterpretStatus;
//!
//! let (status, output) = blox::interpret("var l = [1, 2, 3]\nprint l[-1]");
//! assert_eq!(InterpretStatus::Ok, status);
//! assert_eq!("3\n", output);
//! ```

pub mod cache;
pub mod chunk;
pub mod compiler;
pub mod config;
pub mod debug;
pub mod error;
pub mod gc;
pub mod natives;
pub mod scanner;
pub mod value;
pub mod vm;
#[macro_use]
mod with_try_from_u8;

pub use error::{InterpretStatus, InterpretationError};

/// Result of compiling or running blox code.
pub type Result<T> = std::result::Result<T, InterpretationError>;

/// Re-exports common items.
pub mod prelude {
    pub use crate::chunk::{Chunk, OpCode};
    pub use crate::error::{InterpretStatus, InterpretationError};
    pub use crate::value::Value;
    pub use crate::vm::VM;
}

/// Runs a whole program in a fresh VM, capturing everything it prints.
///
/// Diagnostics still go to stderr.
pub fn interpret(source: &str) -> (InterpretStatus, String) {
    let mut vm = vm::VM::new(config::VmConfig::default(), Vec::new());
    let status = match vm.interpret(source) {
        Ok(_) => InterpretStatus::Ok,
        Err(e) => e.status(),
    };
    let output = String::from_utf8_lossy(&vm.into_output()).into_owned();
    (status, output)
}
