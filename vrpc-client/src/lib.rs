//! # vrpc-client
//!
//! Client transport for vrpc.
//!
//! This crate provides:
//! - Persistent connections with cooperating reader and writer tasks
//! - A LIFO connection pool with idle eviction and per-key capacity caps
//! - A round-trip transport with one-shot retry on reused connections
//! - A high-level [`Client`] for request/response calls

pub mod client;
pub mod config;
pub mod connect_key;
pub mod error;
pub mod metrics;
pub mod persist;
pub mod pool;
pub mod stream;
pub mod transport;

pub use client::Client;
pub use config::ClientConfig;
pub use connect_key::ConnectKey;
pub use error::ClientError;
pub use metrics::TransportMetrics;
pub use persist::Response;
