//! Client stream abstraction over TCP and VSOCK sockets.

use pin_project_lite::pin_project;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_vsock::{VsockAddr, VsockStream};
use vrpc_protocol::Address;

pin_project! {
    /// A dialed stream that can be either TCP or VSOCK.
    #[project = ClientStreamProj]
    pub enum ClientStream {
        Tcp { #[pin] stream: TcpStream },
        Vsock { #[pin] stream: VsockStream },
    }
}

/// Dials the destination, dispatching on the address variant.
pub async fn dial(addr: &Address) -> io::Result<ClientStream> {
    match addr {
        Address::Tcp { ip, port } => {
            let port = u16::try_from(*port)
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "tcp port out of range"))?;
            let stream = TcpStream::connect((ip.as_str(), port)).await?;
            stream.set_nodelay(true).ok();
            Ok(ClientStream::Tcp { stream })
        }
        Address::Vsock { context_id, port } => {
            let stream = VsockStream::connect(VsockAddr::new(*context_id, *port)).await?;
            Ok(ClientStream::Vsock { stream })
        }
    }
}

impl AsyncRead for ClientStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.project() {
            ClientStreamProj::Tcp { stream } => stream.poll_read(cx, buf),
            ClientStreamProj::Vsock { stream } => stream.poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ClientStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.project() {
            ClientStreamProj::Tcp { stream } => stream.poll_write(cx, buf),
            ClientStreamProj::Vsock { stream } => stream.poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            ClientStreamProj::Tcp { stream } => stream.poll_flush(cx),
            ClientStreamProj::Vsock { stream } => stream.poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            ClientStreamProj::Tcp { stream } => stream.poll_shutdown(cx),
            ClientStreamProj::Vsock { stream } => stream.poll_shutdown(cx),
        }
    }
}
