//! Binary frame format for vrpc.
//!
//! Frame layout (8-byte header + body):
//!
//! ```text
//! +--------+---------+--------+--------+
//! | magic  | version | code   | length |
//! | 2 bytes| 2 bytes |2 bytes | 2 bytes|
//! +--------+---------+--------+--------+
//! | body                               |
//! | length bytes                       |
//! +------------------------------------+
//! ```
//!
//! All fields are big-endian. `code` carries the status on responses (0 = OK)
//! and is reserved as zero on requests. `length` is the byte count of the
//! body that immediately follows.

use crate::context::CallContext;
use crate::error::ProtocolError;
use crate::{HEADER_SIZE, MAGIC, MAX_BODY_SIZE, PROTOCOL_VERSION};
use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// A parsed frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub magic: u16,
    pub version: u16,
    pub code: u16,
    pub length: u16,
}

impl Header {
    /// Creates a request header. The length is stamped by [`write_frame`].
    pub fn request() -> Self {
        Self::status(0)
    }

    /// Creates a response header carrying a status code.
    pub fn status(code: u16) -> Self {
        Self {
            magic: MAGIC,
            version: PROTOCOL_VERSION,
            code,
            length: 0,
        }
    }

    fn put(&self, buf: &mut BytesMut) {
        buf.put_u16(self.magic);
        buf.put_u16(self.version);
        buf.put_u16(self.code);
        buf.put_u16(self.length);
    }
}

/// Reads one frame from `reader`.
///
/// The context is checked non-blockingly before the header read and before
/// the body read. A magic mismatch fails without consuming body bytes, so the
/// caller may keep using the stream; EOF and other I/O failures classify as
/// broken via [`ProtocolError::is_broken`].
pub async fn read_frame<R>(
    reader: &mut R,
    ctx: &CallContext,
) -> Result<(Header, Bytes), ProtocolError>
where
    R: AsyncRead + Unpin,
{
    if ctx.is_done() {
        return Err(ProtocolError::Cancelled);
    }

    let mut head = [0u8; HEADER_SIZE];
    reader.read_exact(&mut head).await.map_err(map_read_err)?;

    let magic = u16::from_be_bytes([head[0], head[1]]);
    if magic != MAGIC {
        return Err(ProtocolError::InvalidMagic(magic));
    }

    let header = Header {
        magic,
        version: u16::from_be_bytes([head[2], head[3]]),
        code: u16::from_be_bytes([head[4], head[5]]),
        length: u16::from_be_bytes([head[6], head[7]]),
    };

    if header.length == 0 {
        return Ok((header, Bytes::new()));
    }

    if ctx.is_done() {
        return Err(ProtocolError::Cancelled);
    }

    let mut body = vec![0u8; header.length as usize];
    reader.read_exact(&mut body).await.map_err(map_read_err)?;

    Ok((header, Bytes::from(body)))
}

fn map_read_err(err: std::io::Error) -> ProtocolError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        ProtocolError::UnexpectedEof
    } else {
        ProtocolError::Io(err)
    }
}

/// Writes one frame to `writer` and flushes it.
///
/// The body size is validated before the writer is touched. Header and body
/// are serialized into a single buffer and issued as one write, so a failure
/// cannot leave a header on the wire without its body.
pub async fn write_frame<W>(
    writer: &mut W,
    ctx: &CallContext,
    header: &mut Header,
    body: &[u8],
) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    if ctx.is_done() {
        return Err(ProtocolError::Cancelled);
    }

    if body.len() > MAX_BODY_SIZE {
        return Err(ProtocolError::BodyTooLarge(body.len()));
    }
    header.length = body.len() as u16;

    let mut buf = BytesMut::with_capacity(HEADER_SIZE + body.len());
    header.put(&mut buf);
    buf.put_slice(body);

    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}
