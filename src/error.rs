//! Unified error types for the control plane.

use std::fmt;

// ---------------------------------------------------------------------------
// ErrorKind
// ---------------------------------------------------------------------------

/// Stable classification of a [`MuxError`], used by audit and retry logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    Validation,
    Security,
    RateLimitExceeded,
    ConcurrencyLimit,
    Connection,
    Timeout,
    BackendUnavailable,
    Execution,
    SessionNotFound,
    Shutdown,
}

// ---------------------------------------------------------------------------
// MuxError
// ---------------------------------------------------------------------------

/// Errors surfaced by every multiplexer-facing operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MuxError {
    /// Malformed or disallowed input, rejected before execution.
    Validation(String),
    /// Injection or traversal attempt. Always audited at high severity.
    Security(String),
    /// The sliding-window limiter blocked this source.
    RateLimitExceeded { source: String, retry_after_ms: u64 },
    /// No execution slot became free within the command timeout.
    ConcurrencyLimit,
    /// Pool exhaustion or transport failure.
    Connection(String),
    /// A multiplexer-facing operation exceeded its deadline.
    Timeout { operation: String, after_ms: u64 },
    /// Every backend eligible under the active strategy is unhealthy.
    BackendUnavailable(String),
    /// The multiplexer ran the command and reported a failure.
    Execution(String),
    /// The referenced session is not tracked.
    SessionNotFound(String),
    /// The component was shut down.
    Shutdown,
}

impl MuxError {
    /// Stable kind for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::Security(_) => ErrorKind::Security,
            Self::RateLimitExceeded { .. } => ErrorKind::RateLimitExceeded,
            Self::ConcurrencyLimit => ErrorKind::ConcurrencyLimit,
            Self::Connection(_) => ErrorKind::Connection,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::BackendUnavailable(_) => ErrorKind::BackendUnavailable,
            Self::Execution(_) => ErrorKind::Execution,
            Self::SessionNotFound(_) => ErrorKind::SessionNotFound,
            Self::Shutdown => ErrorKind::Shutdown,
        }
    }

    /// Transport-class failures that a fallback backend may succeed on.
    ///
    /// Validation and security rejections are terminal for the call.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::Timeout { .. } | Self::BackendUnavailable(_)
        )
    }

    /// Shorthand for a timeout error.
    pub fn timeout(operation: impl Into<String>, after: std::time::Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            after_ms: after.as_millis() as u64,
        }
    }
}

impl fmt::Display for MuxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation(msg) => write!(f, "validation: {msg}"),
            Self::Security(msg) => write!(f, "security: {msg}"),
            Self::RateLimitExceeded {
                source,
                retry_after_ms,
            } => write!(
                f,
                "rate limit exceeded: source `{source}` blocked for {retry_after_ms}ms"
            ),
            Self::ConcurrencyLimit => write!(f, "concurrency limit reached"),
            Self::Connection(msg) => write!(f, "connection: {msg}"),
            Self::Timeout {
                operation,
                after_ms,
            } => write!(f, "timeout: {operation} after {after_ms}ms"),
            Self::BackendUnavailable(msg) => write!(f, "backend unavailable: {msg}"),
            Self::Execution(msg) => write!(f, "execution failed: {msg}"),
            Self::SessionNotFound(id) => write!(f, "session not found: {id}"),
            Self::Shutdown => write!(f, "component is shut down"),
        }
    }
}

impl std::error::Error for MuxError {}

// ---------------------------------------------------------------------------
// ConfigError
// ---------------------------------------------------------------------------

/// Errors when loading or parsing configuration.
#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Toml(toml::de::Error),
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "io: {e}"),
            Self::Toml(e) => write!(f, "toml: {e}"),
            Self::Invalid(msg) => write!(f, "invalid config: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        Self::Toml(e)
    }
}
