//! Protocol error types and server status codes.

use std::fmt;
use thiserror::Error;

/// Errors raised while framing or decoding messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid header magic: {0:#06x}")]
    InvalidMagic(u16),

    #[error("body exceeds frame capacity: {0} bytes")]
    BodyTooLarge(usize),

    #[error("unexpected end of stream")]
    UnexpectedEof,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("call cancelled")]
    Cancelled,

    #[error("deadline exceeded")]
    TimedOut,

    #[error("truncated message body")]
    Truncated,

    #[error("invalid UTF-8 in message")]
    InvalidUtf8,
}

impl ProtocolError {
    /// Returns whether the underlying stream is no longer usable.
    ///
    /// A broken connection must be closed and never returned to a pool.
    /// Framing errors (bad magic, oversized body) and deadline errors leave
    /// the stream usable.
    pub fn is_broken(&self) -> bool {
        match self {
            ProtocolError::UnexpectedEof => true,
            ProtocolError::Io(err) => !matches!(
                err.kind(),
                std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
            ),
            _ => false,
        }
    }
}

/// A server-level failure written back as a status frame: the frame `code`
/// carries the status code and the body carries the message bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    code: u16,
    message: String,
}

impl Status {
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// The request body did not decode into an envelope.
    pub fn invalid_request() -> Self {
        Self::new(401, "invalid request")
    }

    /// No handler is registered for the requested path.
    pub fn invalid_path() -> Self {
        Self::new(402, "invalid path")
    }

    /// The handler panicked while serving the request.
    pub fn handler_panic(detail: &str) -> Self {
        Self::new(500, format!("panic serving request: {detail}"))
    }

    pub fn code(&self) -> u16 {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for Status {}
