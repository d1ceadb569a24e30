//! Provides [InterpretationError], the error that most things return.
use std::fmt;

use thiserror::Error;

/// Any error that can occur during interpretation.
#[derive(Debug, Error)]
pub enum InterpretationError {
    /// A compile-time error, such as a syntax error, or a name error. Carries every error the
    /// compiler found, in source order.
    #[error("compile-time error")]
    CompileError(Vec<Diagnostic>),
    /// A runtime error, such as a type error or an uncaught exception.
    #[error("runtime error: {0}")]
    RuntimeError(RuntimeFault),
}

/// One compile error, located at a token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub line: usize,
    /// Where on the line: ` at 'token'`, ` at end`, or empty for lexical errors.
    pub location: String,
    pub message: String,
}

/// An uncaught runtime error, and the call stack at the moment it was raised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeFault {
    pub message: String,
    /// One entry per active call frame, innermost first.
    pub backtrace: Vec<TraceEntry>,
}

/// A call frame in a [RuntimeFault]'s backtrace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceEntry {
    pub line: usize,
    /// `None` for the top-level script.
    pub function: Option<String>,
}

/// The coarse outcome of [crate::interpret].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterpretStatus {
    Ok,
    CompileError,
    RuntimeError,
}

impl InterpretationError {
    /// Maps the error to its [InterpretStatus].
    pub fn status(&self) -> InterpretStatus {
        match self {
            InterpretationError::CompileError(_) => InterpretStatus::CompileError,
            InterpretationError::RuntimeError(_) => InterpretStatus::RuntimeError,
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[line {}] Error{} : {}",
            self.line, self.location, self.message
        )
    }
}

impl fmt::Display for RuntimeFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        for entry in &self.backtrace {
            write!(f, "\n{entry}")?;
        }
        Ok(())
    }
}

impl fmt::Display for TraceEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.function {
            Some(name) => write!(f, "[line {}] in {name}()", self.line),
            None => write!(f, "[line {}] in script", self.line),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn diagnostics_print_like_clox() {
        let diagnostic = Diagnostic {
            line: 3,
            location: " at 'x'".to_owned(),
            message: "Expect expression.".to_owned(),
        };
        assert_eq!("[line 3] Error at 'x' : Expect expression.", diagnostic.to_string());
    }

    #[test]
    fn faults_print_a_backtrace_innermost_first() {
        let fault = RuntimeFault {
            message: "Operands must be numbers.".to_owned(),
            backtrace: vec![
                TraceEntry {
                    line: 2,
                    function: Some("inner".to_owned()),
                },
                TraceEntry {
                    line: 5,
                    function: None,
                },
            ],
        };
        assert_eq!(
            "Operands must be numbers.\n[line 2] in inner()\n[line 5] in script",
            fault.to_string()
        );
    }
}
