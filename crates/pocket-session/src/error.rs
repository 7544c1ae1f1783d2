/*
[INPUT]:  Failure sources (connect, handshake, transport I/O, framing, correlation)
[OUTPUT]: Structured session error type with retry hints
[POS]:    Error handling layer - unified error type for the session crate
[UPDATE]: When adding new failure kinds or changing propagation rules
*/

use std::time::Duration;

use thiserror::Error;

/// Main error type for the session client
#[derive(Error, Debug)]
pub enum SessionError {
    /// Endpoint unreachable, refused, or the open timed out
    #[error("Connect to {endpoint} failed: {message}")]
    Connect { endpoint: String, message: String },

    /// Explicit rejection or timeout during the auth handshake
    #[error("Authentication failed: {message}")]
    Authentication { message: String },

    /// Mid-session I/O failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Malformed frame
    #[error("Decode error: {0}")]
    Decode(String),

    /// No correlated response within the deadline
    #[error("Command {tag} timed out after {}ms", timeout.as_millis())]
    CommandTimeout { tag: String, timeout: Duration },

    /// Pending work invalidated by a lost connection
    #[error("Connection lost (generation {generation})")]
    ConnectionLost { generation: u64 },

    /// Every configured endpoint failed during one cycle
    #[error("All {attempts} endpoints failed; last error: {last_error}")]
    ExhaustedEndpoints { attempts: usize, last_error: String },

    /// The venue answered a command with its failure event
    #[error("Command rejected with {tag}: {payload}")]
    Rejected {
        tag: String,
        payload: serde_json::Value,
    },

    /// Overall connect deadline elapsed
    #[error("Connect did not complete within {}s", timeout.as_secs())]
    ConnectTimeout { timeout: Duration },

    /// Session is not connected and queueing is disabled
    #[error("Session is not connected")]
    NotConnected,

    /// Session was explicitly closed
    #[error("Session closed")]
    Closed,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SessionError {
    /// Check if the failure is worth another attempt
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SessionError::Connect { .. }
                | SessionError::Transport(_)
                | SessionError::CommandTimeout { .. }
                | SessionError::ConnectionLost { .. }
                | SessionError::ExhaustedEndpoints { .. }
                | SessionError::ConnectTimeout { .. }
                | SessionError::NotConnected
        )
    }

    /// Check if error indicates authentication failure
    pub fn is_auth_error(&self) -> bool {
        matches!(self, SessionError::Authentication { .. })
    }

    pub(crate) fn connect(endpoint: impl Into<String>, message: impl ToString) -> Self {
        SessionError::Connect {
            endpoint: endpoint.into(),
            message: message.to_string(),
        }
    }

    pub(crate) fn auth(message: impl Into<String>) -> Self {
        SessionError::Authentication {
            message: message.into(),
        }
    }
}

/// Result type alias for session operations
pub type Result<T> = std::result::Result<T, SessionError>;
