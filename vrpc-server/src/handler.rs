//! Handler registration and lookup.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use vrpc_protocol::REPLY_ERR;

/// A business failure returned by a handler, carried to the client inside
/// the response envelope.
#[derive(Debug, Clone)]
pub struct HandlerError {
    pub code: u16,
    pub message: String,
}

impl HandlerError {
    /// A failure with the generic business error code.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: REPLY_ERR,
            message: message.into(),
        }
    }

    pub fn with_code(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for HandlerError {}

/// A registered request handler: opaque payload in, opaque payload out.
pub type Handler = Arc<dyn Fn(&[u8]) -> Result<Vec<u8>, HandlerError> + Send + Sync>;

/// Path-keyed handler table, shared between the accept loop and every
/// per-connection task.
#[derive(Default)]
pub(crate) struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Handler>>,
}

impl HandlerRegistry {
    pub(crate) fn register(&self, path: impl Into<String>, handler: Handler) {
        self.handlers.write().unwrap().insert(path.into(), handler);
    }

    pub(crate) fn get(&self, path: &str) -> Option<Handler> {
        self.handlers.read().unwrap().get(path).cloned()
    }
}
