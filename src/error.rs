//! Error types for Agentry

use thiserror::Error;

/// Result type alias using Agentry's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Agentry
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid or missing configuration; fatal at startup
    #[error("Configuration error: {0}")]
    Config(String),

    /// Network, DNS, connection or timeout failure against an LLM or tool server
    #[error("Transport error: {0}")]
    Transport(String),

    /// Structured error returned by the LLM provider
    #[error("Provider error ({status}): {message}")]
    Provider {
        /// HTTP status code, 0 if not applicable
        status: u16,
        /// Provider-supplied message
        message: String,
    },

    /// A tool executed and reported failure
    #[error("Tool error: {0}")]
    Tool(String),

    /// A tool exceeded its execution timeout
    #[error("Tool \"{name}\" timed out after {timeout_ms}ms")]
    ToolTimeout {
        /// Tool name
        name: String,
        /// Configured timeout in milliseconds
        timeout_ms: u64,
    },

    /// Input, output or tool call blocked by a guardrail rule
    #[error("Blocked by guardrail: {0}")]
    GuardrailBlock(String),

    /// Permission policy or the user rejected a tool call
    #[error("Tool \"{0}\" is denied by permission policy")]
    PermissionDenied(String),

    /// Optimistic-lock failure updating task state
    #[error("Task state conflict: expected version {expected}, found {actual}")]
    TaskStateConflict {
        /// Version the caller updated against
        expected: i64,
        /// Version currently stored
        actual: i64,
    },

    /// A hard stop condition fired with no continuation
    #[error("Task stopped: {0}")]
    StopConditionHit(String),

    /// Fast-fail while the circuit breaker is open
    #[error("Circuit breaker open for \"{0}\"")]
    CircuitOpen(String),

    /// Cancellation was signalled
    #[error("Aborted: {0}")]
    Aborted(String),

    /// Embedding dimensionality does not match the store
    #[error("Embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Dimensionality the store was created with
        expected: usize,
        /// Dimensionality of the rejected vector
        actual: usize,
    },

    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// HTTP request error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Check if the error is retryable by the recovery policy.
    ///
    /// Transport failures, 5xx and 429 provider responses, and tool
    /// timeouts are retryable. 4xx provider responses (other than 429)
    /// and invalid arguments are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Transport(_) | Error::ToolTimeout { .. } => true,
            Error::Provider { status, .. } => *status == 429 || *status >= 500 || *status == 0,
            Error::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            Error::Database(sqlx::Error::PoolTimedOut) => true,
            _ => false,
        }
    }

    /// Check if the error is a client error (caller's fault)
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Error::InvalidInput(_) | Error::NotFound(_) | Error::Config(_)
        )
    }

    /// Construct a provider error with no HTTP status
    pub fn provider(message: impl Into<String>) -> Self {
        Error::Provider {
            status: 0,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classes() {
        assert!(Error::Transport("connection reset".into()).is_retryable());
        assert!(Error::ToolTimeout {
            name: "slow".into(),
            timeout_ms: 30_000
        }
        .is_retryable());
        assert!(Error::Provider {
            status: 429,
            message: "rate limited".into()
        }
        .is_retryable());
        assert!(Error::Provider {
            status: 503,
            message: "overloaded".into()
        }
        .is_retryable());
    }

    #[test]
    fn non_retryable_classes() {
        assert!(!Error::Provider {
            status: 400,
            message: "bad request".into()
        }
        .is_retryable());
        assert!(!Error::InvalidInput("missing field".into()).is_retryable());
        assert!(!Error::PermissionDenied("shell_exec".into()).is_retryable());
        assert!(!Error::Tool("exit code 1".into()).is_retryable());
    }

    #[test]
    fn deterministic_messages() {
        let e = Error::PermissionDenied("shell_exec".into());
        assert_eq!(
            e.to_string(),
            "Tool \"shell_exec\" is denied by permission policy"
        );

        let e = Error::StopConditionHit("max iterations reached".into());
        assert_eq!(e.to_string(), "Task stopped: max iterations reached");

        let e = Error::TaskStateConflict {
            expected: 1,
            actual: 2,
        };
        assert_eq!(
            e.to_string(),
            "Task state conflict: expected version 1, found 2"
        );
    }
}
