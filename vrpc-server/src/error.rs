//! Server error types.

use thiserror::Error;
use vrpc_protocol::ProtocolError;

/// Server errors: accept-loop failures and per-connection close causes.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("connection closed by peer")]
    PeerClosed,

    #[error("idle timeout waiting for next request")]
    IdleTimeout,

    #[error("keep-alive disabled")]
    KeepAliveDisabled,

    #[error("server shutting down")]
    ShuttingDown,
}

impl ServerError {
    /// Whether this close cause counts as a failure in the stats, as opposed
    /// to a normal end of a connection's life.
    pub fn is_failure(&self) -> bool {
        matches!(self, ServerError::Io(_) | ServerError::Protocol(_))
    }
}
