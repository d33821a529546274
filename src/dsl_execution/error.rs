//! Error taxonomy for the DSL execution host.
//!
//! Every failure a caller can observe is one of the closed variants defined
//! here. Interpreter-specific error types are translated by the result
//! normalizer and never cross the public API.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Position inside a script source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLocation {
    /// 1-based line number
    pub line: usize,
    /// 1-based column, when the interpreter reports one
    pub column: Option<usize>,
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.column {
            Some(column) => write!(f, "line {}, column {}", self.line, column),
            None => write!(f, "line {}", self.line),
        }
    }
}

/// Details of a syntax error reported while compiling a module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyntaxDetails {
    /// Parser message
    pub message: String,
    /// Where the parser gave up
    pub location: Option<SourceLocation>,
}

impl fmt::Display for SyntaxDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.location {
            Some(location) => write!(f, "{} ({})", self.message, location),
            None => write!(f, "{}", self.message),
        }
    }
}

/// Failures converting between host values and interpreter values.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BridgeError {
    /// Integer outside the host's 64-bit signed range
    #[error("Integer {value} does not fit the host's 64-bit integer range")]
    NumericOverflow { value: String },

    /// Value refers to itself
    #[error("Value contains a reference cycle")]
    CyclicValue,

    /// Nesting deeper than the configured limit
    #[error("Value nesting exceeds the maximum depth of {limit}")]
    DepthExceeded { limit: usize },

    /// Value has no counterpart in the bridged value model
    #[error("Values of type '{type_name}' cannot be bridged")]
    UnsupportedShape { type_name: String },
}

/// Failures reported by a content resolver.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResolveError {
    /// No content exists for the name
    #[error("Module '{name}' not found")]
    NotFound { name: String },

    /// The resolver could not produce content
    #[error("Failed to resolve module '{name}': {message}")]
    Failure { name: String, message: String },
}

/// Failures loading or validating host configuration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {message}")]
    Io { path: String, message: String },

    #[error("Failed to parse config file '{path}': {message}")]
    Parse { path: String, message: String },

    #[error("Unsupported config file format '{path}' (only JSON and TOML supported)")]
    UnsupportedFormat { path: String },

    #[error("Invalid configuration value for '{field}': {message}")]
    Invalid { field: String, message: String },
}

impl ConfigError {
    /// Creates a validation error for a single field.
    pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Failures loading a module.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LoadError {
    /// The resolver has no such module
    #[error("Module not found: {module}")]
    NotFound { module: String },

    /// The resolver failed for another reason
    #[error("Content resolver failed for module '{module}': {message}")]
    ResolverFailure { module: String, message: String },

    /// The source does not parse
    #[error("Syntax error in module '{module}': {details}")]
    Syntax {
        module: String,
        details: SyntaxDetails,
    },
}

impl From<ResolveError> for LoadError {
    fn from(error: ResolveError) -> Self {
        match error {
            ResolveError::NotFound { name } => LoadError::NotFound { module: name },
            ResolveError::Failure { name, message } => LoadError::ResolverFailure {
                module: name,
                message,
            },
        }
    }
}

/// Resource whose ceiling was hit during an invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    /// Size of strings, arrays and maps
    Memory,
    /// Interpreter operation count
    Operations,
    /// Function call depth
    CallStack,
    /// Anything else the interpreter meters
    Other,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Memory => write!(f, "memory"),
            ResourceKind::Operations => write!(f, "operations"),
            ResourceKind::CallStack => write!(f, "call stack"),
            ResourceKind::Other => write!(f, "resource"),
        }
    }
}

/// Failures executing an entry point.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum InvocationError {
    /// The module has no callable with that name and arity
    #[error("Entry point '{entry_point}' not found in module '{module}'")]
    EntryPointNotFound {
        module: String,
        entry_point: String,
        available: Vec<String>,
    },

    /// Wall-clock budget exhausted
    #[error("Invocation of '{module}::{entry_point}' exceeded its {limit:?} time budget")]
    Timeout {
        module: String,
        entry_point: String,
        limit: Duration,
        elapsed: Duration,
    },

    /// Memory or another metered resource exhausted
    #[error("Invocation of '{module}::{entry_point}' exceeded its {resource} limit: {detail}")]
    ResourceExceeded {
        module: String,
        entry_point: String,
        resource: ResourceKind,
        detail: String,
    },

    /// Error raised by the script itself
    #[error("Runtime fault: {message}")]
    RuntimeFault {
        message: String,
        location: Option<SourceLocation>,
        trace: Option<String>,
    },

    /// Return value could not be bridged
    #[error("Returned value is too complex to bridge: {0}")]
    ValueTooComplex(#[source] BridgeError),
}

impl InvocationError {
    /// Creates a runtime fault without position information.
    pub fn runtime_fault(message: impl Into<String>) -> Self {
        Self::RuntimeFault {
            message: message.into(),
            location: None,
            trace: None,
        }
    }
}

/// Closed error taxonomy surfaced to callers.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum HostError {
    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Invocation(#[from] InvocationError),

    /// Host-supplied arguments that have no bridged form. Script values that
    /// fail to bridge are reported as `ValueTooComplex` instead.
    #[error(transparent)]
    Bridge(#[from] BridgeError),
}

impl HostError {
    /// Gets the leaf kind, for branching without string matching.
    pub fn kind(&self) -> ErrorKind {
        match self {
            HostError::Load(LoadError::NotFound { .. }) => ErrorKind::NotFound,
            HostError::Load(LoadError::ResolverFailure { .. }) => ErrorKind::ResolverFailure,
            HostError::Load(LoadError::Syntax { .. }) => ErrorKind::Syntax,
            HostError::Invocation(InvocationError::EntryPointNotFound { .. }) => {
                ErrorKind::EntryPointNotFound
            }
            HostError::Invocation(InvocationError::Timeout { .. }) => ErrorKind::Timeout,
            HostError::Invocation(InvocationError::ResourceExceeded { .. }) => {
                ErrorKind::ResourceExceeded
            }
            HostError::Invocation(InvocationError::RuntimeFault { .. }) => ErrorKind::RuntimeFault,
            HostError::Invocation(InvocationError::ValueTooComplex(_)) => {
                ErrorKind::ValueTooComplex
            }
            HostError::Bridge(BridgeError::NumericOverflow { .. }) => ErrorKind::NumericOverflow,
            HostError::Bridge(BridgeError::CyclicValue) => ErrorKind::CyclicValue,
            HostError::Bridge(BridgeError::DepthExceeded { .. }) => ErrorKind::DepthExceeded,
            HostError::Bridge(BridgeError::UnsupportedShape { .. }) => ErrorKind::UnsupportedShape,
        }
    }

    /// Gets the error category.
    pub fn category(&self) -> ErrorCategory {
        match self {
            HostError::Load(_) => ErrorCategory::Load,
            HostError::Invocation(_) => ErrorCategory::Invocation,
            HostError::Bridge(_) => ErrorCategory::Bridge,
        }
    }

    /// Gets the error severity level.
    pub fn severity(&self) -> ErrorSeverity {
        match self.kind() {
            ErrorKind::NotFound | ErrorKind::EntryPointNotFound => ErrorSeverity::Warning,
            ErrorKind::Timeout => ErrorSeverity::Warning,
            ErrorKind::ResourceExceeded => ErrorSeverity::Critical,
            ErrorKind::ResolverFailure => ErrorSeverity::Critical,
            _ => ErrorSeverity::Error,
        }
    }

    /// Only budget violations may succeed on a fresh interpreter; load and
    /// bridge failures are deterministic.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Timeout | ErrorKind::ResourceExceeded
        )
    }

    /// Source position, if the failure has one.
    pub fn location(&self) -> Option<SourceLocation> {
        match self {
            HostError::Load(LoadError::Syntax { details, .. }) => details.location,
            HostError::Invocation(InvocationError::RuntimeFault { location, .. }) => *location,
            _ => None,
        }
    }

    /// Script call trace, if the failure has one.
    pub fn trace(&self) -> Option<&str> {
        match self {
            HostError::Invocation(InvocationError::RuntimeFault { trace, .. }) => trace.as_deref(),
            _ => None,
        }
    }
}

/// Leaf kinds of the error taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    NotFound,
    ResolverFailure,
    Syntax,
    EntryPointNotFound,
    Timeout,
    ResourceExceeded,
    RuntimeFault,
    ValueTooComplex,
    NumericOverflow,
    CyclicValue,
    DepthExceeded,
    UnsupportedShape,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::ResolverFailure => "RESOLVER_FAILURE",
            ErrorKind::Syntax => "SYNTAX",
            ErrorKind::EntryPointNotFound => "ENTRY_POINT_NOT_FOUND",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::ResourceExceeded => "RESOURCE_EXCEEDED",
            ErrorKind::RuntimeFault => "RUNTIME_FAULT",
            ErrorKind::ValueTooComplex => "VALUE_TOO_COMPLEX",
            ErrorKind::NumericOverflow => "NUMERIC_OVERFLOW",
            ErrorKind::CyclicValue => "CYCLIC_VALUE",
            ErrorKind::DepthExceeded => "DEPTH_EXCEEDED",
            ErrorKind::UnsupportedShape => "UNSUPPORTED_SHAPE",
        };
        write!(f, "{}", name)
    }
}

/// Error categories for classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCategory {
    /// Resolving or compiling a module
    Load,
    /// Executing an entry point
    Invocation,
    /// Converting values
    Bridge,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Load => write!(f, "LOAD"),
            ErrorCategory::Invocation => write!(f, "INVOCATION"),
            ErrorCategory::Bridge => write!(f, "BRIDGE"),
        }
    }
}

/// Error severity levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ErrorSeverity {
    /// Warning conditions
    Warning,
    /// Error conditions
    Error,
    /// Critical conditions
    Critical,
}

impl ErrorSeverity {
    /// Log level used when reporting an error of this severity.
    pub fn log_level(&self) -> log::Level {
        match self {
            ErrorSeverity::Warning => log::Level::Warn,
            ErrorSeverity::Error | ErrorSeverity::Critical => log::Level::Error,
        }
    }
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorSeverity::Warning => write!(f, "WARNING"),
            ErrorSeverity::Error => write!(f, "ERROR"),
            ErrorSeverity::Critical => write!(f, "CRITICAL"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_error_maps_to_load_error() {
        let error: LoadError = ResolveError::NotFound {
            name: "config".to_string(),
        }
        .into();
        assert_eq!(
            error,
            LoadError::NotFound {
                module: "config".to_string()
            }
        );

        let error: LoadError = ResolveError::Failure {
            name: "config".to_string(),
            message: "permission denied".to_string(),
        }
        .into();
        assert!(matches!(error, LoadError::ResolverFailure { .. }));
    }

    #[test]
    fn test_only_budget_violations_are_retryable() {
        let timeout = HostError::from(InvocationError::Timeout {
            module: "m".to_string(),
            entry_point: "f".to_string(),
            limit: Duration::from_millis(50),
            elapsed: Duration::from_millis(51),
        });
        assert!(timeout.is_retryable());
        assert_eq!(timeout.kind(), ErrorKind::Timeout);
        assert_eq!(timeout.category(), ErrorCategory::Invocation);

        let syntax = HostError::from(LoadError::Syntax {
            module: "m".to_string(),
            details: SyntaxDetails {
                message: "unexpected end".to_string(),
                location: None,
            },
        });
        assert!(!syntax.is_retryable());

        let bridge = HostError::from(BridgeError::CyclicValue);
        assert!(!bridge.is_retryable());
        assert_eq!(bridge.category(), ErrorCategory::Bridge);
    }

    #[test]
    fn test_location_and_trace() {
        let error = HostError::from(InvocationError::RuntimeFault {
            message: "boom".to_string(),
            location: Some(SourceLocation {
                line: 3,
                column: Some(7),
            }),
            trace: Some("in 'inner'".to_string()),
        });
        assert_eq!(error.location().map(|l| l.line), Some(3));
        assert_eq!(error.trace(), Some("in 'inner'"));
        assert_eq!(error.to_string(), "Runtime fault: boom");
    }

    #[test]
    fn test_syntax_details_display() {
        let details = SyntaxDetails {
            message: "Expecting ')'".to_string(),
            location: Some(SourceLocation {
                line: 2,
                column: Some(14),
            }),
        };
        assert_eq!(details.to_string(), "Expecting ')' (line 2, column 14)");
        assert_eq!(ErrorKind::EntryPointNotFound.to_string(), "ENTRY_POINT_NOT_FOUND");
    }
}
