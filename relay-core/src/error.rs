//! Error types for the relay

use thiserror::Error;

/// Relay-wide error type
///
/// Transport-local errors (timeout, refused, protocol) are recovered
/// automatically by retry/backoff/failover; only exhaustion states are
/// surfaced to consumers via status and alerts.
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("connect timeout after {0}ms")]
    ConnectTimeout(u64),

    #[error("connection refused: {0}")]
    ConnectRefused(String),

    #[error("protocol error: {0}")]
    ProtocolError(String),

    #[error("heartbeat timeout: no pong within {0}ms")]
    HeartbeatTimeout(u64),

    #[error("all endpoints exhausted")]
    AllEndpointsExhausted,

    #[error("backup activation failed: {0}")]
    BackupActivationFailed(String),

    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl RelayError {
    pub fn refused(msg: impl Into<String>) -> Self {
        RelayError::ConnectRefused(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        RelayError::ProtocolError(msg.into())
    }

    pub fn malformed(msg: impl Into<String>) -> Self {
        RelayError::MalformedEnvelope(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        RelayError::Storage(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        RelayError::Config(msg.into())
    }

    pub fn backup(msg: impl Into<String>) -> Self {
        RelayError::BackupActivationFailed(msg.into())
    }

    /// Per-attempt errors that move the scan to the next endpoint
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RelayError::ConnectTimeout(_)
                | RelayError::ConnectRefused(_)
                | RelayError::ProtocolError(_)
        )
    }
}

/// Result type alias for relay operations
pub type RelayResult<T> = Result<T, RelayError>;
