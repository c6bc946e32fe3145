use std::fmt;

use crate::lua_value::LuaValue;

pub type LuaResult<T> = Result<T, LuaError>;

/// Classification of a runtime failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LuaErrorKind {
    /// Indexing, calling, comparing or doing arithmetic on an unsupported type
    Type,
    /// Value-stack or frame-stack capacity exceeded; fatal to the coroutine
    Overflow,
    /// A native callable received a missing or wrongly typed argument
    Argument,
    /// Explicit script-level `error(v)` carrying an arbitrary cause value
    User,
    /// Unknown opcode or out-of-range operand in a prototype
    Bytecode,
    /// Everything else the runtime raises
    Runtime,
}

/// An error unwinding through the interpreter.
///
/// The `cause` is the script-visible error value and is distinct from the
/// display message, so `error(t)` can carry a table through a pcall
/// boundary intact. When no explicit cause is attached the message string
/// doubles as the cause.
#[derive(Debug, Clone)]
pub struct LuaError {
    pub kind: LuaErrorKind,
    pub message: String,
    pub cause: Option<LuaValue>,
}

impl LuaError {
    pub fn new(kind: LuaErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            cause: None,
        }
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::new(LuaErrorKind::Runtime, message)
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new(LuaErrorKind::Type, message)
    }

    pub fn overflow(message: impl Into<String>) -> Self {
        Self::new(LuaErrorKind::Overflow, message)
    }

    pub fn argument(message: impl Into<String>) -> Self {
        Self::new(LuaErrorKind::Argument, message)
    }

    pub fn bytecode(message: impl Into<String>) -> Self {
        Self::new(LuaErrorKind::Bytecode, message)
    }

    /// A script-level raise: the value is the cause, the message is its
    /// best-effort textual form.
    pub fn user(cause: LuaValue) -> Self {
        Self {
            kind: LuaErrorKind::User,
            message: cause.raw_tostring(),
            cause: Some(cause),
        }
    }

    pub fn with_cause(mut self, cause: LuaValue) -> Self {
        self.cause = Some(cause);
        self
    }

    /// The script-visible error value delivered by pcall and failed resume.
    pub fn cause(&self) -> LuaValue {
        match &self.cause {
            Some(value) => value.clone(),
            None => LuaValue::string(&self.message),
        }
    }
}

impl fmt::Display for LuaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for LuaError {}
