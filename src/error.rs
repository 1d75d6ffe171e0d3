//! Error model: a cheap copyable tag plus the rich, user-visible form.
//!
//! Following the C Lua convention that "errors are values", the actual
//! payload (almost always a string, but can be any `LuaValue`) is not
//! carried inline in [`LuaError`] — it lives on the [`crate::vm::Vm`]
//! until the nearest protected boundary (`pcall`/top level) reads it out.

use std::fmt;

/// Lightweight error tag threaded through every opcode handler.
#[derive(Debug, Clone, PartialEq)]
pub enum LuaError {
    /// A normal runtime error; the value is in `Vm::error_value`.
    Runtime,
    /// A compile-time (lexer/parser) error, carrying its own rendered
    /// message since it can occur with no `Vm` yet in existence.
    Syntax(String),
    /// The running coroutine yielded; values are in `Vm::yield_values`.
    Yield,
    /// The Lua call stack exceeded `VmConfig::max_call_depth`.
    StackOverflow,
    /// An error raised while already unwinding from another error
    /// inside the same protected region (`error in error handling`).
    ErrorInErrorHandling,
}

impl fmt::Display for LuaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LuaError::Runtime => f.write_str("runtime error"),
            LuaError::Syntax(msg) => f.write_str(msg),
            LuaError::Yield => f.write_str("coroutine yield"),
            LuaError::StackOverflow => f.write_str("stack overflow"),
            LuaError::ErrorInErrorHandling => f.write_str("error in error handling"),
        }
    }
}

impl std::error::Error for LuaError {}

/// Rich error returned across the public API boundary: kind, rendered
/// message and (when available) the traceback captured at raise time.
#[derive(Debug, Clone)]
pub struct LuaFullError {
    pub kind: LuaError,
    pub message: String,
    pub traceback: Option<String>,
}

impl fmt::Display for LuaFullError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(tb) = &self.traceback {
            write!(f, "\n{tb}")?;
        }
        Ok(())
    }
}

impl std::error::Error for LuaFullError {}

pub type LuaResult<T> = Result<T, LuaError>;
