//! # vrpc-server
//!
//! Server side of vrpc.
//!
//! This crate provides:
//! - A handler registry keyed by path
//! - An accept loop over TCP or VSOCK listeners
//! - A per-connection keep-alive serve loop with idle, read, and write
//!   deadlines

pub mod conn;
pub mod error;
pub mod handler;
pub mod metrics;
pub mod server;
pub mod stream;

pub use error::ServerError;
pub use handler::{Handler, HandlerError};
pub use metrics::ServerMetrics;
pub use server::{Listener, Server, ServerConfig, ServerStats};
