//! Server stream abstraction over accepted TCP and VSOCK sockets.

use pin_project_lite::pin_project;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_vsock::VsockStream;

pin_project! {
    /// An accepted stream that can be either TCP or VSOCK.
    #[project = ServerStreamProj]
    pub enum ServerStream {
        Tcp { #[pin] stream: TcpStream },
        Vsock { #[pin] stream: VsockStream },
    }
}

impl AsyncRead for ServerStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.project() {
            ServerStreamProj::Tcp { stream } => stream.poll_read(cx, buf),
            ServerStreamProj::Vsock { stream } => stream.poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ServerStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.project() {
            ServerStreamProj::Tcp { stream } => stream.poll_write(cx, buf),
            ServerStreamProj::Vsock { stream } => stream.poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            ServerStreamProj::Tcp { stream } => stream.poll_flush(cx),
            ServerStreamProj::Vsock { stream } => stream.poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            ServerStreamProj::Tcp { stream } => stream.poll_shutdown(cx),
            ServerStreamProj::Vsock { stream } => stream.poll_shutdown(cx),
        }
    }
}
