//! Application envelopes carried as frame bodies.
//!
//! Both envelopes use a length-prefixed binary layout so the opaque payload
//! needs no escaping or copying on decode.

use crate::error::ProtocolError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Business status for a successful reply envelope.
pub const REPLY_OK: u16 = 0;

/// Generic business failure code for handler errors without their own code.
pub const REPLY_ERR: u16 = 1;

/// Request envelope: the handler path plus an opaque payload.
///
/// Wire layout: `u16 BE path_len | path bytes | payload...`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRequest {
    pub path: String,
    pub payload: Bytes,
}

impl CallRequest {
    pub fn new(path: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            path: path.into(),
            payload: payload.into(),
        }
    }

    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        if self.path.len() > u16::MAX as usize {
            return Err(ProtocolError::BodyTooLarge(self.path.len()));
        }
        let mut buf = BytesMut::with_capacity(2 + self.path.len() + self.payload.len());
        buf.put_u16(self.path.len() as u16);
        buf.put_slice(self.path.as_bytes());
        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }

    pub fn decode(mut body: Bytes) -> Result<Self, ProtocolError> {
        if body.len() < 2 {
            return Err(ProtocolError::Truncated);
        }
        let path_len = body.get_u16() as usize;
        if body.len() < path_len {
            return Err(ProtocolError::Truncated);
        }
        let path_bytes = body.split_to(path_len);
        let path = std::str::from_utf8(&path_bytes)
            .map_err(|_| ProtocolError::InvalidUtf8)?
            .to_string();
        Ok(Self {
            path,
            payload: body,
        })
    }
}

/// Response envelope: a business status code, payload, and error text.
///
/// Wire layout: `u16 BE code | u16 BE err_len | err bytes | payload...`
/// `code == 0` means success; any other code carries a business error with
/// human-readable `err`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallReply {
    pub code: u16,
    pub payload: Bytes,
    pub err: String,
}

impl CallReply {
    pub fn ok(payload: impl Into<Bytes>) -> Self {
        Self {
            code: REPLY_OK,
            payload: payload.into(),
            err: String::new(),
        }
    }

    pub fn error(code: u16, err: impl Into<String>) -> Self {
        Self {
            code,
            payload: Bytes::new(),
            err: err.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == REPLY_OK
    }

    /// Encodes the envelope. Error text longer than the length prefix allows
    /// is truncated rather than rejected; payload limits are enforced at the
    /// frame layer.
    pub fn encode(&self) -> Bytes {
        let err = &self.err.as_bytes()[..self.err.len().min(u16::MAX as usize)];
        let mut buf = BytesMut::with_capacity(4 + err.len() + self.payload.len());
        buf.put_u16(self.code);
        buf.put_u16(err.len() as u16);
        buf.put_slice(err);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    pub fn decode(mut body: Bytes) -> Result<Self, ProtocolError> {
        if body.len() < 4 {
            return Err(ProtocolError::Truncated);
        }
        let code = body.get_u16();
        let err_len = body.get_u16() as usize;
        if body.len() < err_len {
            return Err(ProtocolError::Truncated);
        }
        let err_bytes = body.split_to(err_len);
        let err = std::str::from_utf8(&err_bytes)
            .map_err(|_| ProtocolError::InvalidUtf8)?
            .to_string();
        Ok(Self {
            code,
            payload: body,
            err,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_roundtrip() {
        let request = CallRequest::new("test", &b"hello"[..]);
        let decoded = CallRequest::decode(request.encode().unwrap()).unwrap();
        assert_eq!(decoded.path, "test");
        assert_eq!(&decoded.payload[..], b"hello");
    }

    #[test]
    fn test_request_empty_payload() {
        let request = CallRequest::new("ping", Bytes::new());
        let decoded = CallRequest::decode(request.encode().unwrap()).unwrap();
        assert_eq!(decoded.path, "ping");
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn test_request_truncated() {
        assert!(matches!(
            CallRequest::decode(Bytes::from_static(&[0x00])),
            Err(ProtocolError::Truncated)
        ));
        // path_len claims more bytes than present
        assert!(matches!(
            CallRequest::decode(Bytes::from_static(&[0x00, 0x08, b'a'])),
            Err(ProtocolError::Truncated)
        ));
    }

    #[test]
    fn test_request_invalid_utf8_path() {
        let body = Bytes::from_static(&[0x00, 0x02, 0xff, 0xfe]);
        assert!(matches!(
            CallRequest::decode(body),
            Err(ProtocolError::InvalidUtf8)
        ));
    }

    #[test]
    fn test_reply_roundtrip() {
        let reply = CallReply::ok(&b"rsp:hello"[..]);
        let decoded = CallReply::decode(reply.encode()).unwrap();
        assert!(decoded.is_ok());
        assert_eq!(&decoded.payload[..], b"rsp:hello");
        assert!(decoded.err.is_empty());
    }

    #[test]
    fn test_reply_business_error() {
        let reply = CallReply::error(7, "balance too low");
        let decoded = CallReply::decode(reply.encode()).unwrap();
        assert!(!decoded.is_ok());
        assert_eq!(decoded.code, 7);
        assert_eq!(decoded.err, "balance too low");
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn test_reply_truncated() {
        assert!(matches!(
            CallReply::decode(Bytes::from_static(&[0x00, 0x00, 0x00])),
            Err(ProtocolError::Truncated)
        ));
    }
}
