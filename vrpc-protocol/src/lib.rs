//! # vrpc-protocol
//!
//! Wire protocol implementation for vrpc.
//!
//! This crate provides:
//! - Fixed 8-byte header framing over buffered streams
//! - Length-prefixed binary request/response envelopes
//! - Destination addresses for TCP and VSOCK
//! - Call contexts carrying deadlines and cancellation
//! - Protocol errors and server status codes

pub mod addr;
pub mod context;
pub mod error;
pub mod frame;
pub mod message;

pub use addr::Address;
pub use context::{CallContext, CancelHandle};
pub use error::{ProtocolError, Status};
pub use frame::{read_frame, write_frame, Header};
pub use message::{CallReply, CallRequest, REPLY_ERR, REPLY_OK};

/// Protocol version supported by this implementation.
pub const PROTOCOL_VERSION: u16 = 1;

/// Magic number identifying vrpc frames.
pub const MAGIC: u16 = 0x1617;

/// Size of the fixed frame header in bytes (2+2+2+2 = 8).
pub const HEADER_SIZE: usize = 8;

/// Maximum frame body size; the length field is a `u16`.
pub const MAX_BODY_SIZE: usize = u16::MAX as usize;
