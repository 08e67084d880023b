//! Error types for the control engine.

use std::error::Error as StdError;
use thiserror::Error;

/// Boxed error type used for error chaining across crate boundaries.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Context wrapper that preserves an optional underlying source error.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct ErrorContext {
    message: String,
    #[source]
    source: Option<BoxError>,
}

impl ErrorContext {
    /// Create context-only error (no underlying source).
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    /// Create context error with an underlying source.
    pub fn with_source<E>(message: impl Into<String>, source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

/// Engine-level errors.
///
/// Controllers never leak foreign error types past the engine boundary; every
/// internal failure is translated into one of these variants, and each variant
/// maps to exactly one [`ResultCode`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EngineError {
    /// Key material is malformed (bad base64, wrong length).
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Meshnet or DNS configuration failed validation.
    #[error("Bad config: {0}")]
    BadConfig(#[source] ErrorContext),

    /// The engine serialization point could not be acquired (contended or
    /// poisoned). Transient; callers may retry.
    #[error("Failed to acquire engine lock")]
    Lock,

    /// A string argument could not be parsed (endpoint, network info).
    #[error("Invalid string: {0}")]
    InvalidString(String),

    /// Start was invoked while an adapter is already active.
    #[error("Engine already started")]
    AlreadyStarted,

    /// A started-only operation was invoked before start (or after stop).
    #[error("Engine not started")]
    NotStarted,

    /// Virtual adapter creation or teardown failed.
    #[error("Adapter error: {0}")]
    Adapter(#[source] ErrorContext),

    /// The tunnel transport rejected an operation.
    #[error("Transport error: {0}")]
    Transport(#[source] ErrorContext),

    /// Exit-node state did not match the caller's request.
    #[error("Exit node error: {0}")]
    ExitNode(String),

    /// Network I/O error on the control plane.
    #[error("Network error: {0}")]
    Network(#[from] std::io::Error),
}

impl EngineError {
    /// Create a config validation error with context only.
    pub fn bad_config(message: impl Into<String>) -> Self {
        Self::BadConfig(ErrorContext::new(message))
    }

    /// Create a config validation error with preserved source.
    pub fn bad_config_with_source<E>(message: impl Into<String>, source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::BadConfig(ErrorContext::with_source(message, source))
    }

    /// Create an adapter error with context only.
    pub fn adapter(message: impl Into<String>) -> Self {
        Self::Adapter(ErrorContext::new(message))
    }

    /// Create an adapter error with preserved source.
    pub fn adapter_with_source<E>(message: impl Into<String>, source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::Adapter(ErrorContext::with_source(message, source))
    }

    /// Create a transport error with context only.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(ErrorContext::new(message))
    }
}

/// Result type alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Closed result-code taxonomy exposed on the control surface.
///
/// Discriminants are stable; external callers match on the numeric values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ResultCode {
    /// Operation succeeded (including idempotent no-ops).
    Ok = 0,
    /// Generic failure; detail retrievable via `get_last_error`.
    Error = 1,
    /// Malformed key material.
    InvalidKey = 2,
    /// Config validation failed; prior config untouched.
    BadConfig = 3,
    /// Serialization point contended or poisoned; retryable.
    LockError = 4,
    /// Unparseable string argument.
    InvalidString = 5,
    /// Start invoked on an already-started engine.
    AlreadyStarted = 6,
}

impl From<&EngineError> for ResultCode {
    fn from(err: &EngineError) -> Self {
        match err {
            EngineError::InvalidKey(_) => ResultCode::InvalidKey,
            EngineError::BadConfig(_) => ResultCode::BadConfig,
            EngineError::Lock => ResultCode::LockError,
            EngineError::InvalidString(_) => ResultCode::InvalidString,
            EngineError::AlreadyStarted => ResultCode::AlreadyStarted,
            EngineError::NotStarted
            | EngineError::Adapter(_)
            | EngineError::Transport(_)
            | EngineError::ExitNode(_)
            | EngineError::Network(_) => ResultCode::Error,
        }
    }
}
