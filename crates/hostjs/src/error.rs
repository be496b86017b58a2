//! Error taxonomy for the embedding surface

use crate::value::HostValue;
use rquickjs::{Ctx, Value};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Errors returned by lifecycle, evaluation, module and marshaling calls.
#[derive(Debug, Error)]
pub enum EmbedError {
    #[error("runtime is not initialized")]
    NotInitialized,

    #[error("runtime is already initialized")]
    AlreadyInitialized,

    #[error("script not found: {}", path.display())]
    ScriptNotFound { path: PathBuf },

    #[error(
        "parse error: {message}{}",
        location.as_ref().map(|l| format!(" ({l})")).unwrap_or_default()
    )]
    Parse {
        message: String,
        location: Option<SourceLocation>,
    },

    #[error("uncaught guest exception: {0}")]
    RuntimeException(GuestException),

    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: String, found: String },

    #[error("property '{name}' not found")]
    NotFound { name: String },

    #[error("module '{name}' is already registered")]
    ModuleNameCollision { name: String },

    #[error("event loop is already being driven on this runtime")]
    EventLoopBusy,

    #[error("invalid engine argument '{arg}': {reason}")]
    InvalidEngineArg { arg: String, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("engine error: {0}")]
    Engine(rquickjs::Error),
}

impl EmbedError {
    /// Converts an engine error into an owned error, pulling the pending
    /// exception out of `ctx` when the engine reports one.
    pub(crate) fn capture(ctx: &Ctx<'_>, err: rquickjs::Error) -> Self {
        match err {
            rquickjs::Error::Exception => {
                EmbedError::RuntimeException(GuestException::capture(ctx.catch()))
            }
            rquickjs::Error::FromJs { from, to, message } => EmbedError::TypeMismatch {
                expected: to.to_string(),
                found: message.map_or_else(|| from.to_string(), |m| format!("{from} ({m})")),
            },
            other => EmbedError::Engine(other),
        }
    }

    pub(crate) fn type_mismatch(expected: impl Into<String>, found: impl Into<String>) -> Self {
        EmbedError::TypeMismatch {
            expected: expected.into(),
            found: found.into(),
        }
    }
}

/// Location reported by the engine for a parse error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLocation {
    pub file: String,
    pub line: u32,
}

impl SourceLocation {
    /// Pulls `file:line` out of the first `at` frame of an engine stack trace.
    fn from_stack(stack: &str) -> Option<Self> {
        let frame = stack.lines().map(str::trim).find(|l| l.starts_with("at "))?;
        let frame = frame.trim_start_matches("at ").trim_end_matches(')');
        let frame = frame.rsplit('(').next().unwrap_or(frame);
        let mut parts = frame.rsplitn(3, ':');
        let last = parts.next()?;
        // Frames are either `file:line` or `file:line:column`.
        let (line, file) = match (parts.next(), parts.next()) {
            (Some(line), Some(file)) if line.parse::<u32>().is_ok() => (line, file),
            (Some(file), _) => (last, file),
            _ => return None,
        };
        Some(Self {
            file: file.to_string(),
            line: line.parse().ok()?,
        })
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

/// Owned copy of a value thrown by guest code.
///
/// Nothing here borrows guest memory, so it can travel past the call that
/// produced it and even past `deinitialize`.
#[derive(Debug, Clone, PartialEq)]
pub struct GuestException {
    /// Constructor name (`TypeError`, `SyntaxError`, ...), empty for thrown primitives.
    pub name: String,
    pub message: String,
    pub stack: Option<String>,
    /// Marshaled thrown value; `Undefined` when it had no host representation.
    pub value: HostValue,
}

impl GuestException {
    pub(crate) fn capture(thrown: Value<'_>) -> Self {
        let value = HostValue::from_guest_lossy(thrown.clone());
        match thrown.as_object() {
            Some(object) => {
                let name = object.get::<_, Option<String>>("name").ok().flatten();
                let message = object.get::<_, Option<String>>("message").ok().flatten();
                let stack = object.get::<_, Option<String>>("stack").ok().flatten();
                Self {
                    name: name.unwrap_or_default(),
                    message: message.unwrap_or_default(),
                    stack,
                    value,
                }
            }
            None => Self {
                name: String::new(),
                message: value.to_string(),
                stack: None,
                value,
            },
        }
    }

    /// For an exception raised while compiling submitted source, before any
    /// of it ran.
    pub(crate) fn into_parse_error(self) -> EmbedError {
        let location = self.stack.as_deref().and_then(SourceLocation::from_stack);
        EmbedError::Parse {
            message: self.message,
            location,
        }
    }
}

impl fmt::Display for GuestException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.name.is_empty() {
            write!(f, "{}", self.message)
        } else {
            write!(f, "{}: {}", self.name, self.message)
        }
    }
}
