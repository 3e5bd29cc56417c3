//! Client error types.

use std::sync::Arc;
use thiserror::Error;
use vrpc_protocol::ProtocolError;

/// Client errors.
///
/// Errors are cheaply cloneable because the first error observed on a
/// connection is also stored as its close cause.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    #[error("protocol error: {0}")]
    Protocol(Arc<ProtocolError>),

    #[error("dial failed: {0}")]
    Dial(Arc<std::io::Error>),

    #[error("conn early close")]
    ConnEarlyClose,

    #[error("read response timeout")]
    ReadTimeout,

    #[error("round trip cancelled")]
    Cancelled,

    #[error("connection closed by peer")]
    PeerClosed,

    #[error("conn idle timeout")]
    IdleTimeout,

    #[error("idle timer close")]
    IdleTimerClose,

    #[error("out of connection pool")]
    OutOfPool,

    #[error("unknown server error")]
    UnknownServer,

    #[error("server status {code}: {message}")]
    Server { code: u16, message: String },
}

impl From<ProtocolError> for ClientError {
    fn from(err: ProtocolError) -> Self {
        ClientError::Protocol(Arc::new(err))
    }
}

impl ClientError {
    /// Whether this is one of the two idle-eviction close causes: the pool
    /// scan during `get` or the armed idle timer.
    pub fn is_idle_close(&self) -> bool {
        matches!(self, ClientError::IdleTimeout | ClientError::IdleTimerClose)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_close_grouping() {
        assert!(ClientError::IdleTimeout.is_idle_close());
        assert!(ClientError::IdleTimerClose.is_idle_close());
        assert!(!ClientError::OutOfPool.is_idle_close());
        assert!(!ClientError::ConnEarlyClose.is_idle_close());
    }

    #[test]
    fn test_display() {
        let err = ClientError::Server {
            code: 402,
            message: "invalid path".to_string(),
        };
        assert_eq!(err.to_string(), "server status 402: invalid path");
    }
}
