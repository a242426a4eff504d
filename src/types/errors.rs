//! Application error types.
//!
//! All errors use `thiserror` for automatic Error trait derivation. Every
//! variant falls into one of the runtime's error classes (see [`ErrorKind`]),
//! which decides whether the retry executor tries again and how the router
//! reports the failure to the client.

use thiserror::Error;

/// Application result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Error class used for retry decisions and client reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed or incomplete source/action definitions. Never retried.
    Configuration,
    /// Bad client input: missing parameters, unknown blocks or actions.
    Validation,
    /// Network failures, non-2xx responses, timeouts. Retried per policy.
    Transient,
    /// Deterministic execution failures (bad payloads, non-zero exits).
    Permanent,
    /// Fail-fast rejection by an open circuit breaker.
    CircuitOpen,
    /// The execution context was cancelled or its deadline passed.
    Cancelled,
    /// Bugs and invariant violations.
    Internal,
}

/// Main error enum for the livedoc runtime.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration errors (fatal at construction).
    #[error("configuration error: {0}")]
    Config(String),

    /// Validation errors (bad client input).
    #[error("validation error: {0}")]
    Validation(String),

    /// A required action parameter is absent or empty.
    #[error("missing required parameter: {0}")]
    MissingParameter(String),

    /// Action kind outside the supported set.
    #[error("unknown action kind: {0}")]
    UnknownActionKind(String),

    /// Exec actions or sources requested while execution is disabled.
    #[error("exec actions disabled (use --allow-exec flag)")]
    ExecDisabled,

    /// A `sql` action ran without a source registry.
    #[error("source registry not configured")]
    RegistryMissing,

    /// A source name did not resolve through the registry.
    #[error("source {0:?} not found")]
    SourceNotFound(String),

    /// Block id not present in the session's page state.
    #[error("unknown block: {0}")]
    UnknownBlock(String),

    /// Resource not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Execution failure raised by a source or action.
    #[error("source {source_name}: {operation}: {message}")]
    Source {
        source_name: String,
        operation: String,
        message: String,
        retryable: bool,
    },

    /// Non-2xx HTTP response.
    #[error("source {source_name}: HTTP {status}: {body}")]
    Http {
        source_name: String,
        status: u16,
        body: String,
    },

    /// Circuit breaker rejected the call without running it.
    #[error("circuit open for {0}")]
    CircuitOpen(String),

    /// Retries exhausted; wraps the last error.
    #[error("{label}: failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        label: String,
        attempts: u32,
        #[source]
        last: Box<Error>,
    },

    /// Cancellation.
    #[error("operation cancelled: {0}")]
    Cancelled(String),

    /// Deadline exceeded.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Template parse or evaluation failure.
    #[error("template error in {text:?}: {reason}")]
    Template { text: String, reason: String },

    /// Internal errors.
    #[error("internal error: {0}")]
    Internal(String),

    /// Serialization/deserialization errors.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Config(_)
            | Error::UnknownActionKind(_)
            | Error::ExecDisabled
            | Error::RegistryMissing
            | Error::SourceNotFound(_) => ErrorKind::Configuration,
            Error::Validation(_)
            | Error::MissingParameter(_)
            | Error::UnknownBlock(_)
            | Error::NotFound(_)
            | Error::Template { .. }
            | Error::Serialization(_) => ErrorKind::Validation,
            Error::Source { retryable, .. } => {
                if *retryable {
                    ErrorKind::Transient
                } else {
                    ErrorKind::Permanent
                }
            }
            Error::Http { .. } | Error::Timeout(_) | Error::Io(_) => ErrorKind::Transient,
            Error::CircuitOpen(_) => ErrorKind::CircuitOpen,
            Error::RetriesExhausted { last, .. } => last.kind(),
            Error::Cancelled(_) => ErrorKind::Cancelled,
            Error::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether the retry executor may try again after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transient)
    }

    /// Stable code reported to clients in `meta.code`.
    pub fn code(&self) -> &'static str {
        match self.kind() {
            ErrorKind::Configuration => "INVALID_CONFIG",
            ErrorKind::Validation => match self {
                Error::UnknownBlock(_) | Error::NotFound(_) => "NOT_FOUND",
                _ => "INVALID_ARGUMENT",
            },
            ErrorKind::Transient => match self {
                Error::Timeout(_) => "DEADLINE_EXCEEDED",
                _ => "UNAVAILABLE",
            },
            ErrorKind::Permanent => "FAILED_PRECONDITION",
            ErrorKind::CircuitOpen => "CIRCUIT_OPEN",
            ErrorKind::Cancelled => "CANCELLED",
            ErrorKind::Internal => "INTERNAL",
        }
    }
}

// Convenience constructors
impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::Cancelled(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Transient source failure (retried).
    pub fn transient(
        source_name: impl Into<String>,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Source {
            source_name: source_name.into(),
            operation: operation.into(),
            message: message.into(),
            retryable: true,
        }
    }

    /// Permanent source failure (not retried).
    pub fn permanent(
        source_name: impl Into<String>,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Source {
            source_name: source_name.into(),
            operation: operation.into(),
            message: message.into(),
            retryable: false,
        }
    }

    pub fn template(text: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Template {
            text: text.into(),
            reason: reason.into(),
        }
    }
}
