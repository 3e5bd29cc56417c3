//! Per-connection serve loop with keep-alive.

use crate::error::ServerError;
use crate::handler::HandlerRegistry;
use crate::server::{ServerConfig, ServerStats};
use bytes::Bytes;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader, BufWriter, ReadHalf, WriteHalf};
use tokio::sync::broadcast;
use tokio::time::Instant;
use vrpc_protocol::{
    read_frame, write_frame, CallContext, CallReply, CallRequest, Header, ProtocolError, Status,
};

use crate::stream::ServerStream;

const READ_BUFFER_SIZE: usize = 4 * 1024;
const WRITE_BUFFER_SIZE: usize = 4 * 1024;

/// One accepted connection.
pub(crate) struct Conn {
    pub(crate) name: i64,
    pub(crate) remote: String,
    config: ServerConfig,
    handlers: Arc<HandlerRegistry>,
    stats: Arc<ServerStats>,
    keep_alive: Arc<AtomicBool>,
}

/// Runs `fut` under `limit` when non-zero; a zero limit waits indefinitely.
/// `None` means the limit elapsed.
async fn maybe_timeout<F: Future>(limit: Duration, fut: F) -> Option<F::Output> {
    if limit.is_zero() {
        Some(fut.await)
    } else {
        tokio::time::timeout(limit, fut).await.ok()
    }
}

fn panic_detail(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl Conn {
    pub(crate) fn new(
        name: i64,
        remote: String,
        config: ServerConfig,
        handlers: Arc<HandlerRegistry>,
        stats: Arc<ServerStats>,
        keep_alive: Arc<AtomicBool>,
    ) -> Self {
        Self {
            name,
            remote,
            config,
            handlers,
            stats,
            keep_alive,
        }
    }

    /// Serves request frames until the connection ends, then records the
    /// close cause.
    pub(crate) async fn serve(self, stream: ServerStream, mut shutdown: broadcast::Receiver<()>) {
        tracing::info!(conn = self.name, remote = %self.remote, "client connected");

        let cause = self.serve_inner(stream, &mut shutdown).await;

        if cause.is_failure() {
            self.stats.errors_total.fetch_add(1, Ordering::Relaxed);
        }
        self.stats.connections_active.fetch_sub(1, Ordering::Relaxed);
        if let Some(metrics) = &self.config.metrics {
            metrics.connections_active.dec();
        }
        tracing::info!(conn = self.name, remote = %self.remote, cause = %cause, "client disconnected");
    }

    async fn serve_inner(
        &self,
        stream: ServerStream,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> ServerError {
        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader = BufReader::with_capacity(READ_BUFFER_SIZE, read_half);
        let mut writer = BufWriter::with_capacity(WRITE_BUFFER_SIZE, write_half);
        let ctx = CallContext::background();

        loop {
            // Keep-alive: park until the next request's bytes arrive.
            if let Err(cause) = self.wait_next(&mut reader, shutdown).await {
                return cause;
            }

            let started = Instant::now();
            let read = maybe_timeout(
                self.config.read_timeout,
                read_frame(&mut reader, &ctx),
            )
            .await
            .unwrap_or(Err(ProtocolError::TimedOut));
            if let Some(metrics) = &self.config.metrics {
                metrics.read_duration.observe(started.elapsed().as_secs_f64());
            }

            let (_, body) = match read {
                Ok(frame) => frame,
                Err(err) if err.is_broken() => return ServerError::Protocol(err),
                Err(err) => {
                    tracing::debug!(conn = self.name, error = %err, "skipping malformed frame");
                    continue;
                }
            };

            self.stats.requests_total.fetch_add(1, Ordering::Relaxed);

            let handled = Instant::now();
            let reply = self.dispatch(body);
            if let Some(metrics) = &self.config.metrics {
                metrics
                    .handle_duration
                    .observe(handled.elapsed().as_secs_f64());
            }

            let started = Instant::now();
            let written = match &reply {
                Ok(reply_body) => self.write_reply(&mut writer, &ctx, Header::status(0), reply_body).await,
                Err(status) => {
                    self.write_reply(
                        &mut writer,
                        &ctx,
                        Header::status(status.code()),
                        status.message().as_bytes(),
                    )
                    .await
                }
            };
            if let Some(metrics) = &self.config.metrics {
                metrics
                    .write_duration
                    .observe(started.elapsed().as_secs_f64());
            }

            match written {
                Ok(()) => {}
                Err(err) if err.is_broken() => return ServerError::Protocol(err),
                Err(err) => {
                    tracing::debug!(conn = self.name, error = %err, "response write failed");
                }
            }

            if !self.keep_alive.load(Ordering::Relaxed) {
                return ServerError::KeepAliveDisabled;
            }
        }
    }

    /// Blocks until the next request's first bytes are readable, bounded by
    /// the effective idle timeout.
    async fn wait_next(
        &self,
        reader: &mut BufReader<ReadHalf<ServerStream>>,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<(), ServerError> {
        let wait = self.config.effective_idle_timeout();
        let peek = async { reader.fill_buf().await.map(|buf| !buf.is_empty()) };

        tokio::select! {
            _ = shutdown.recv() => Err(ServerError::ShuttingDown),
            res = maybe_timeout(wait, peek) => match res {
                Some(Ok(true)) => Ok(()),
                Some(Ok(false)) => Err(ServerError::PeerClosed),
                Some(Err(err)) => Err(ServerError::Io(err)),
                None => Err(ServerError::IdleTimeout),
            },
        }
    }

    /// Decodes the envelope, runs the handler, and encodes the reply.
    ///
    /// Server-level failures come back as a [`Status`]: 401 when the body
    /// does not decode, 402 when no handler matches, 500 when the handler
    /// panics.
    fn dispatch(&self, body: Bytes) -> Result<Bytes, Status> {
        let request = CallRequest::decode(body).map_err(|_| Status::invalid_request())?;
        let handler = self
            .handlers
            .get(&request.path)
            .ok_or_else(Status::invalid_path)?;

        let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| handler(&request.payload)));
        let reply = match outcome {
            Ok(Ok(payload)) => CallReply::ok(payload),
            Ok(Err(err)) => CallReply::error(err.code, err.message),
            Err(panic) => {
                let detail = panic_detail(panic.as_ref());
                tracing::error!(
                    conn = self.name,
                    remote = %self.remote,
                    path = %request.path,
                    detail = %detail,
                    "handler panicked"
                );
                return Err(Status::handler_panic(&detail));
            }
        };
        Ok(reply.encode())
    }

    async fn write_reply(
        &self,
        writer: &mut BufWriter<WriteHalf<ServerStream>>,
        ctx: &CallContext,
        mut header: Header,
        body: &[u8],
    ) -> Result<(), ProtocolError> {
        maybe_timeout(
            self.config.write_timeout,
            write_frame(writer, ctx, &mut header, body),
        )
        .await
        .unwrap_or(Err(ProtocolError::TimedOut))
    }
}
