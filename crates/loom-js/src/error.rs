//! Error Taxonomy
//!
//! Four kinds of failure cross the runtime:
//! - [`EngineError`]: the engine itself failed. The only fatal kind.
//! - [`ScriptError`]: a script raised an exception. Caught per job.
//! - [`HostError`]: a native operation failed. Delivered to a script callback.
//! - [`ContractViolation`]: a host API was used out of order.

use std::fmt;

use rquickjs::{Coerced, Ctx, Exception, FromJs, Value};

use crate::module::{ModuleId, ModuleState};
use crate::realm::RealmId;

/// Failure of the engine itself (allocation, context creation, API misuse)
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("Failed to initialize JavaScript runtime: {0}")]
    Initialization(String),

    #[error("Failed to create JavaScript context: {0}")]
    ContextCreation(String),

    #[error("JavaScript engine error: {0}")]
    Js(String),

    #[error("Re-entrant {0} while a realm is entered")]
    Reentrant(&'static str),

    #[error("Engine was dropped while the realm was still in use")]
    EngineDropped,

    #[error("Context does not belong to {0}")]
    ForeignContext(RealmId),

    #[error("Engine still owns {0} live realm(s)")]
    RealmsAlive(usize),
}

impl From<rquickjs::Error> for EngineError {
    fn from(error: rquickjs::Error) -> Self {
        EngineError::Js(error.to_string())
    }
}

/// Position inside a script or module source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLocation {
    pub url: String,
    pub line: u32,
    pub column: Option<u32>,
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.column {
            Some(column) => write!(f, "{}:{}:{}", self.url, self.line, column),
            None => write!(f, "{}:{}", self.url, self.line),
        }
    }
}

impl SourceLocation {
    /// Extract the innermost frame from a QuickJS stack trace.
    ///
    /// Frames look like `    at fn (file:///a.js:3:7)` or `    at file:///a.js:3`.
    pub fn from_stack(stack: &str) -> Option<Self> {
        stack.lines().find_map(|line| {
            let frame = line.trim().strip_prefix("at ")?;
            let frame = match (frame.rfind('('), frame.ends_with(')')) {
                (Some(open), true) => &frame[open + 1..frame.len() - 1],
                _ => frame,
            };
            Self::parse_frame(frame)
        })
    }

    fn parse_frame(frame: &str) -> Option<Self> {
        let (rest, last) = frame.rsplit_once(':')?;
        let last: u32 = last.parse().ok()?;
        match rest.rsplit_once(':') {
            Some((url, line)) if line.parse::<u32>().is_ok() => Some(Self {
                url: url.to_string(),
                line: line.parse().ok()?,
                column: Some(last),
            }),
            _ => Some(Self {
                url: rest.to_string(),
                line: last,
                column: None,
            }),
        }
    }
}

/// An exception raised by script code, captured as plain data
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{name}: {message}")]
pub struct ScriptError {
    pub name: String,
    pub message: String,
    pub stack: Option<String>,
    pub code: Option<String>,
    pub location: Option<SourceLocation>,
}

impl ScriptError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: None,
            code: None,
            location: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Capture a thrown value. Error objects keep their name, stack and location;
    /// anything else is stringified.
    pub fn from_value<'js>(ctx: &Ctx<'js>, value: Value<'js>) -> Self {
        if let Some(object) = value.as_object() {
            if let Some(exception) = Exception::from_object(object.clone()) {
                let name = object
                    .get::<_, Option<String>>("name")
                    .ok()
                    .flatten()
                    .unwrap_or_else(|| "Error".to_string());
                let code = object.get::<_, Option<String>>("code").ok().flatten();
                let stack = exception.stack().filter(|s| !s.is_empty());
                let location = Self::location_of(object).or_else(|| {
                    stack.as_deref().and_then(SourceLocation::from_stack)
                });
                return Self {
                    name,
                    message: exception.message().unwrap_or_default(),
                    stack,
                    code,
                    location,
                };
            }
        }

        let message = Coerced::<String>::from_js(ctx, value)
            .map(|coerced| coerced.0)
            .unwrap_or_else(|_| "<unprintable value>".to_string());
        Self::new("Uncaught", message)
    }

    // Syntax errors carry fileName/lineNumber instead of a useful stack.
    fn location_of(object: &rquickjs::Object<'_>) -> Option<SourceLocation> {
        let url = object.get::<_, Option<String>>("fileName").ok().flatten()?;
        let line = object.get::<_, Option<u32>>("lineNumber").ok().flatten()?;
        let column = object.get::<_, Option<u32>>("columnNumber").ok().flatten();
        Some(SourceLocation { url, line, column })
    }
}

/// Failure of a native operation, surfaced to script as an `Error` with a `code`
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message} ({code})")]
pub struct HostError {
    pub message: String,
    pub code: String,
}

impl HostError {
    pub fn new(message: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: code.into(),
        }
    }
}

impl From<std::io::Error> for HostError {
    fn from(error: std::io::Error) -> Self {
        use std::io::ErrorKind;

        let code = match error.kind() {
            ErrorKind::NotFound => "ENOENT",
            ErrorKind::PermissionDenied => "EACCES",
            ErrorKind::AlreadyExists => "EEXIST",
            ErrorKind::InvalidInput | ErrorKind::InvalidData => "EINVAL",
            ErrorKind::NotADirectory => "ENOTDIR",
            ErrorKind::IsADirectory => "EISDIR",
            ErrorKind::DirectoryNotEmpty => "ENOTEMPTY",
            ErrorKind::BrokenPipe => "EPIPE",
            ErrorKind::TimedOut => "ETIMEDOUT",
            ErrorKind::Interrupted => "EINTR",
            _ => "EIO",
        };
        Self::new(error.to_string(), code)
    }
}

/// A host API called out of order
///
/// Never mutates the module registry. Thrown into script when raised by a
/// script-invoked native function, recorded in the drain report otherwise.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContractViolation {
    #[error("Module {url} is {actual}, expected {expected}")]
    UnexpectedModuleState {
        url: String,
        expected: ModuleState,
        actual: ModuleState,
    },

    #[error("No module load callback is registered for this realm")]
    NoModuleLoader,

    #[error("Unknown module record {0}")]
    UnknownModule(ModuleId),

    #[error("Unknown script id {0}")]
    UnknownScript(u32),
}

impl ContractViolation {
    /// Value of the `code` property on the script-visible error
    pub fn code(&self) -> &'static str {
        match self {
            ContractViolation::UnexpectedModuleState { .. } => "ERR_MODULE_STATE",
            ContractViolation::NoModuleLoader => "ERR_NO_MODULE_LOADER",
            ContractViolation::UnknownModule(_) => "ERR_UNKNOWN_MODULE",
            ContractViolation::UnknownScript(_) => "ERR_UNKNOWN_SCRIPT",
        }
    }
}

impl From<ContractViolation> for ScriptError {
    fn from(violation: ContractViolation) -> Self {
        ScriptError::new("Error", violation.to_string()).with_code(violation.code())
    }
}

/// Error returned by realm operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Script(#[from] ScriptError),

    #[error(transparent)]
    Contract(#[from] ContractViolation),
}

impl RuntimeError {
    /// Throw this error into script as an `Error` object
    ///
    /// Returns the pending-exception marker to hand back to the engine.
    pub fn throw(self, ctx: &Ctx<'_>) -> rquickjs::Error {
        let (name, message, code) = match self {
            RuntimeError::Script(error) => (error.name, error.message, error.code),
            RuntimeError::Contract(violation) => (
                "Error".to_string(),
                violation.to_string(),
                Some(violation.code().to_string()),
            ),
            RuntimeError::Engine(error) => {
                tracing::error!("Engine failure inside native callback: {}", error);
                ("InternalError".to_string(), error.to_string(), None)
            }
        };
        match crate::realm::build_error(ctx, &name, &message, code.as_deref()) {
            Ok(value) => ctx.throw(value),
            Err(error) => error,
        }
    }
}
