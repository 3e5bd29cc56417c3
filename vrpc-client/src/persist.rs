//! Persistent connections.
//!
//! A [`PersistConn`] owns one dialed socket and runs two cooperating tasks: a
//! writer draining a capacity-1 send mailbox and a reader that peeks the
//! socket, takes one receive notification per frame, and delivers the
//! response to the waiting caller. Callers see a synchronous
//! [`PersistConn::round_trip`] on top.

use crate::connect_key::ConnectKey;
use crate::error::ClientError;
use crate::metrics::TransportMetrics;
use crate::pool::ConnPool;
use crate::stream::ClientStream;
use bytes::Bytes;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader, BufWriter, ReadHalf, WriteHalf};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use vrpc_protocol::{read_frame, write_frame, CallContext, CallReply, Header, REPLY_OK};

/// One response delivered to a caller.
#[derive(Debug, Clone)]
pub struct Response {
    /// Name of the connection that carried the round trip.
    pub conn_name: i64,
    /// Business status code (`0` on success).
    pub code: u16,
    /// Response payload on success.
    pub payload: Bytes,
    /// Business error text when `code` is non-zero.
    pub err: Option<String>,
}

/// A request handed to the writer task.
struct SendRequest {
    header: Header,
    body: Bytes,
    ctx: CallContext,
    reply: oneshot::Sender<Result<(), ClientError>>,
}

/// Tells the reader task that a caller awaits the next response frame.
struct NotifyReceive {
    ctx: CallContext,
    reply: oneshot::Sender<Result<Response, ClientError>>,
}

/// Idle bookkeeping, maintained by the pool.
#[derive(Default)]
struct IdleState {
    idle_at: Option<Instant>,
    timer: Option<JoinHandle<()>>,
    reused: bool,
}

/// A dialed socket kept alive across round trips.
pub(crate) struct PersistConn {
    pub(crate) name: i64,
    pub(crate) key: ConnectKey,
    pool: Weak<ConnPool>,
    metrics: Option<Arc<TransportMetrics>>,
    receive_timeout: Option<Duration>,
    send_tx: mpsc::Sender<SendRequest>,
    notify_tx: mpsc::Sender<NotifyReceive>,
    /// First close cause wins; a set cause is terminal.
    closed: RwLock<Option<ClientError>>,
    /// Fired exactly once, on the closed transition.
    closed_tx: broadcast::Sender<()>,
    idle: Mutex<IdleState>,
}

impl PersistConn {
    /// Wraps a dialed stream and spawns its reader and writer tasks.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn spawn(
        name: i64,
        key: ConnectKey,
        stream: ClientStream,
        pool: Weak<ConnPool>,
        metrics: Option<Arc<TransportMetrics>>,
        receive_timeout: Option<Duration>,
        read_buffer_size: usize,
        write_buffer_size: usize,
    ) -> Arc<Self> {
        let (send_tx, send_rx) = mpsc::channel(1);
        let (notify_tx, notify_rx) = mpsc::channel(1);
        let (closed_tx, _) = broadcast::channel(1);
        let (read_half, write_half) = tokio::io::split(stream);

        let conn = Arc::new(Self {
            name,
            key,
            pool,
            metrics,
            receive_timeout,
            send_tx,
            notify_tx,
            closed: RwLock::new(None),
            closed_tx,
            idle: Mutex::new(IdleState::default()),
        });

        let reader = BufReader::with_capacity(read_buffer_size, read_half);
        let writer = BufWriter::with_capacity(write_buffer_size, write_half);
        tokio::spawn(Self::read_loop(Arc::clone(&conn), reader, notify_rx));
        tokio::spawn(Self::write_loop(Arc::clone(&conn), writer, send_rx));

        tracing::debug!(conn = name, key = %conn.key, "created connection");
        conn
    }

    /// One request frame out, one response frame in.
    ///
    /// Does not touch the pool or decide retries; the transport owns both.
    pub(crate) async fn round_trip(
        &self,
        header: Header,
        body: Bytes,
        ctx: &CallContext,
    ) -> Result<Response, ClientError> {
        // Subscribe before the closed check so a close after the check is
        // guaranteed to reach this receiver.
        let mut closed_rx = self.closed_tx.subscribe();
        if self.is_closed() {
            return Err(ClientError::ConnEarlyClose);
        }

        let started = Instant::now();
        let (send_reply_tx, mut send_reply_rx) = oneshot::channel();
        let (receive_reply_tx, mut receive_reply_rx) = oneshot::channel();

        self.send_tx
            .send(SendRequest {
                header,
                body,
                ctx: ctx.clone(),
                reply: send_reply_tx,
            })
            .await
            .map_err(|_| ClientError::ConnEarlyClose)?;
        self.notify_tx
            .send(NotifyReceive {
                ctx: ctx.clone(),
                reply: receive_reply_tx,
            })
            .await
            .map_err(|_| ClientError::ConnEarlyClose)?;

        // The reader cannot deliver a response for this request before the
        // frame is on the wire, so wait for the writer's verdict first.
        tokio::select! {
            res = &mut send_reply_rx => {
                if let Some(metrics) = &self.metrics {
                    metrics.send_done.observe(started.elapsed().as_secs_f64());
                }
                match res {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => return Err(err),
                    Err(_) => return Err(ClientError::ConnEarlyClose),
                }
            }
            _ = closed_rx.recv() => return Err(ClientError::ConnEarlyClose),
            _ = ctx.done() => return Err(ClientError::Cancelled),
        }

        // The receive deadline arms only now that the write completed.
        let receive_deadline = async {
            match self.receive_timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            res = &mut receive_reply_rx => {
                if let Some(metrics) = &self.metrics {
                    metrics.receive.observe(started.elapsed().as_secs_f64());
                }
                match res {
                    Ok(result) => result,
                    Err(_) => Err(ClientError::ConnEarlyClose),
                }
            }
            _ = closed_rx.recv() => {
                self.observe_no_response(started);
                Err(ClientError::ConnEarlyClose)
            }
            _ = ctx.done() => {
                self.observe_no_response(started);
                Err(ClientError::Cancelled)
            }
            _ = receive_deadline => {
                self.observe_no_response(started);
                Err(ClientError::ReadTimeout)
            }
        }
    }

    fn observe_no_response(&self, started: Instant) {
        if let Some(metrics) = &self.metrics {
            metrics
                .receive_timeout
                .observe(started.elapsed().as_secs_f64());
        }
    }

    async fn write_loop(
        conn: Arc<Self>,
        mut writer: BufWriter<WriteHalf<ClientStream>>,
        mut send_rx: mpsc::Receiver<SendRequest>,
    ) {
        let mut closed_rx = conn.closed_tx.subscribe();
        loop {
            let request = tokio::select! {
                _ = closed_rx.recv() => return,
                request = send_rx.recv() => match request {
                    Some(request) => request,
                    None => return,
                },
            };

            let SendRequest {
                mut header,
                body,
                ctx,
                reply,
            } = request;

            let result = tokio::select! {
                // Dropping the reply makes the caller observe the close.
                _ = closed_rx.recv() => return,
                res = write_frame(&mut writer, &ctx, &mut header, &body) => res,
            };

            match result {
                Ok(()) => {
                    let _ = reply.send(Ok(()));
                }
                Err(err) => {
                    let broken = err.is_broken();
                    let err = ClientError::from(err);
                    let _ = reply.send(Err(err.clone()));
                    if broken {
                        conn.close(err);
                        return;
                    }
                }
            }
        }
    }

    async fn read_loop(
        conn: Arc<Self>,
        mut reader: BufReader<ReadHalf<ClientStream>>,
        mut notify_rx: mpsc::Receiver<NotifyReceive>,
    ) {
        let mut closed_rx = conn.closed_tx.subscribe();
        loop {
            // Peek before taking a notify: an idle connection is never read
            // speculatively, and a cancelled caller cannot make the reader
            // consume bytes before the next request was written.
            let peeked = tokio::select! {
                _ = closed_rx.recv() => return,
                res = reader.fill_buf() => res.map(|buf| !buf.is_empty()),
            };
            match peeked {
                Ok(true) => {}
                Ok(false) => {
                    conn.close(ClientError::PeerClosed);
                    return;
                }
                Err(err) => {
                    conn.close(ClientError::from(vrpc_protocol::ProtocolError::Io(err)));
                    return;
                }
            }

            let notify = tokio::select! {
                _ = closed_rx.recv() => return,
                notify = notify_rx.recv() => match notify {
                    Some(notify) => notify,
                    None => return,
                },
            };
            let NotifyReceive { ctx, reply } = notify;

            let result = tokio::select! {
                _ = closed_rx.recv() => return,
                res = read_frame(&mut reader, &ctx) => res,
            };

            let (outcome, broken_cause) = match result {
                Ok((header, body)) => (Self::wrap_response(conn.name, header, body), None),
                Err(err) => {
                    let broken = err.is_broken();
                    let err = ClientError::from(err);
                    (Err(err.clone()), broken.then_some(err))
                }
            };

            // A caller that gave up dropped its receiver; delivery then fails
            // without blocking the reader.
            let _ = reply.send(outcome);

            if let Some(cause) = broken_cause {
                conn.close(cause);
                return;
            }
        }
    }

    /// Builds a caller-facing response from a raw frame.
    fn wrap_response(
        conn_name: i64,
        header: Header,
        body: Bytes,
    ) -> Result<Response, ClientError> {
        if header.code != 0 {
            if body.is_empty() {
                return Err(ClientError::UnknownServer);
            }
            // Server-level status: the stream stays in sync, so surface it
            // as a business error and keep the connection usable.
            let message = String::from_utf8_lossy(&body).into_owned();
            return Ok(Response {
                conn_name,
                code: header.code,
                payload: Bytes::new(),
                err: Some(message),
            });
        }

        let reply = CallReply::decode(body).map_err(ClientError::from)?;
        if reply.code != REPLY_OK {
            return Ok(Response {
                conn_name,
                code: reply.code,
                payload: Bytes::new(),
                err: Some(reply.err),
            });
        }
        Ok(Response {
            conn_name,
            code: REPLY_OK,
            payload: reply.payload,
            err: None,
        })
    }

    /// Closes the connection with `cause`. Idempotent; the first cause wins.
    pub(crate) fn close(&self, cause: ClientError) {
        {
            let mut closed = self.closed.write().unwrap();
            if closed.is_some() {
                return;
            }
            tracing::debug!(conn = self.name, %cause, "closing connection");
            *closed = Some(cause);
        }
        // Both loops exit on this signal and drop their halves, which closes
        // the socket.
        let _ = self.closed_tx.send(());

        let mut idle = self.idle.lock().unwrap();
        if let Some(timer) = idle.timer.take() {
            timer.abort();
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.read().unwrap().is_some()
    }

    /// The first close cause, if the connection is closed.
    pub(crate) fn close_cause(&self) -> Option<ClientError> {
        self.closed.read().unwrap().clone()
    }

    /// Whether this connection has been returned to the pool before.
    pub(crate) fn was_reused(&self) -> bool {
        self.idle.lock().unwrap().reused
    }

    pub(crate) fn idle_at(&self) -> Option<Instant> {
        self.idle.lock().unwrap().idle_at
    }

    /// Marks the connection idle and (re)arms its idle timer.
    pub(crate) fn mark_idle(self: &Arc<Self>, idle_timeout: Duration) {
        let mut idle = self.idle.lock().unwrap();
        idle.reused = true;
        idle.idle_at = Some(Instant::now());
        if let Some(timer) = idle.timer.take() {
            timer.abort();
        }
        if !idle_timeout.is_zero() {
            let conn = Arc::clone(self);
            idle.timer = Some(tokio::spawn(async move {
                tokio::time::sleep(idle_timeout).await;
                conn.close_when_idle_timeout();
            }));
        }
    }

    /// Stops the idle timer and clears the idle timestamp on checkout.
    pub(crate) fn clear_idle(&self) {
        let mut idle = self.idle.lock().unwrap();
        idle.idle_at = None;
        if let Some(timer) = idle.timer.take() {
            timer.abort();
        }
    }

    /// Idle-timer callback. Removes the connection from the pool first: if a
    /// caller already took it out, the timer must not close it out from under
    /// them.
    fn close_when_idle_timeout(self: &Arc<Self>) {
        let Some(pool) = self.pool.upgrade() else {
            return;
        };
        if !pool.remove(self) {
            return;
        }
        self.close(ClientError::IdleTimerClose);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::{TcpListener, TcpStream};
    use vrpc_protocol::{CallContext, CallRequest};

    /// Dials a fresh connection against an in-test listener, returning the
    /// accepted server-side socket alongside it.
    async fn connected_pair(name: i64) -> (Arc<PersistConn>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, (server, _)) = tokio::join!(
            TcpStream::connect(addr),
            async { listener.accept().await.unwrap() }
        );
        let conn = PersistConn::spawn(
            name,
            ConnectKey {
                uri: addr.ip().to_string(),
                port: addr.port() as u32,
            },
            crate::stream::ClientStream::Tcp {
                stream: client.unwrap(),
            },
            Weak::new(),
            None,
            None,
            4096,
            4096,
        );
        (conn, server)
    }

    /// Serves `count` echo responses on the raw server socket.
    async fn echo_frames(mut server: TcpStream, count: usize) {
        let ctx = CallContext::background();
        let (read_half, write_half) = server.split();
        let mut reader = tokio::io::BufReader::new(read_half);
        let mut writer = tokio::io::BufWriter::new(write_half);
        for _ in 0..count {
            let (_, body) = read_frame(&mut reader, &ctx).await.unwrap();
            let request = CallRequest::decode(body).unwrap();
            let mut rsp = Vec::from(&b"rsp:"[..]);
            rsp.extend_from_slice(&request.payload);
            let reply = CallReply::ok(rsp).encode();
            let mut header = Header::request();
            write_frame(&mut writer, &ctx, &mut header, &reply)
                .await
                .unwrap();
        }
    }

    fn request_body(payload: &[u8]) -> Bytes {
        CallRequest::new("test", payload.to_vec()).encode().unwrap()
    }

    #[tokio::test]
    async fn test_round_trip_echo() {
        let (conn, server) = connected_pair(1).await;
        let server_task = tokio::spawn(echo_frames(server, 1));

        let ctx = CallContext::background();
        let rsp = conn
            .round_trip(Header::request(), request_body(b"hello"), &ctx)
            .await
            .unwrap();
        assert_eq!(rsp.code, 0);
        assert_eq!(&rsp.payload[..], b"rsp:hello");
        assert_eq!(rsp.conn_name, 1);
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_sequential_round_trips_share_the_socket() {
        let (conn, server) = connected_pair(2).await;
        let server_task = tokio::spawn(echo_frames(server, 3));

        let ctx = CallContext::background();
        for i in 0..3u8 {
            let rsp = conn
                .round_trip(Header::request(), request_body(&[b'0' + i]), &ctx)
                .await
                .unwrap();
            assert_eq!(rsp.payload[..4], b"rsp:"[..]);
        }
        server_task.await.unwrap();
        assert!(!conn.is_closed());
    }

    #[tokio::test]
    async fn test_concurrent_callers_never_interleave_frames() {
        let (conn, server) = connected_pair(3).await;
        let server_task = tokio::spawn(echo_frames(server, 2));

        let ctx = CallContext::background();
        let (a, b) = tokio::join!(
            conn.round_trip(Header::request(), request_body(b"aa"), &ctx),
            conn.round_trip(Header::request(), request_body(b"bb"), &ctx),
        );
        // Frames stay whole on the wire; both callers get well-formed echo
        // responses, one per request.
        let mut got = vec![a.unwrap().payload, b.unwrap().payload];
        got.sort();
        assert_eq!(got, vec![Bytes::from("rsp:aa"), Bytes::from("rsp:bb")]);
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_cancellation_mid_read() {
        let (conn, mut server) = connected_pair(4).await;
        // The server reads the request but never responds.
        let server_task = tokio::spawn(async move {
            let ctx = CallContext::background();
            let (read_half, _write_half) = server.split();
            let mut reader = tokio::io::BufReader::new(read_half);
            let _ = read_frame(&mut reader, &ctx).await;
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let (ctx, handle) = CallContext::cancellable();
        let trip = conn.round_trip(Header::request(), request_body(b"x"), &ctx);
        let cancel = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            handle.cancel();
        };
        let (result, ()) = tokio::join!(trip, cancel);
        assert!(matches!(result, Err(ClientError::Cancelled)));
        server_task.abort();
    }

    #[tokio::test]
    async fn test_receive_timeout_after_write() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, (server, _)) = tokio::join!(
            TcpStream::connect(addr),
            async { listener.accept().await.unwrap() }
        );
        let conn = PersistConn::spawn(
            5,
            ConnectKey {
                uri: addr.ip().to_string(),
                port: addr.port() as u32,
            },
            crate::stream::ClientStream::Tcp {
                stream: client.unwrap(),
            },
            Weak::new(),
            None,
            Some(Duration::from_millis(30)),
            4096,
            4096,
        );

        let ctx = CallContext::background();
        let result = conn
            .round_trip(Header::request(), request_body(b"x"), &ctx)
            .await;
        assert!(matches!(result, Err(ClientError::ReadTimeout)));
        drop(server);
    }

    #[tokio::test]
    async fn test_early_close_mid_trip() {
        let (conn, mut server) = connected_pair(6).await;
        let server_task = tokio::spawn(async move {
            let ctx = CallContext::background();
            let (read_half, _write_half) = server.split();
            let mut reader = tokio::io::BufReader::new(read_half);
            let _ = read_frame(&mut reader, &ctx).await;
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let ctx = CallContext::background();
        let closer = {
            let conn = Arc::clone(&conn);
            async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                conn.close(ClientError::ConnEarlyClose);
            }
        };
        let (result, ()) = tokio::join!(
            conn.round_trip(Header::request(), request_body(b"x"), &ctx),
            closer
        );
        assert!(matches!(result, Err(ClientError::ConnEarlyClose)));
        server_task.abort();
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_keeps_first_cause() {
        let (conn, _server) = connected_pair(7).await;
        conn.close(ClientError::IdleTimeout);
        conn.close(ClientError::OutOfPool);
        assert!(conn.is_closed());
        assert!(matches!(
            conn.close_cause(),
            Some(ClientError::IdleTimeout)
        ));
    }

    #[tokio::test]
    async fn test_peer_close_marks_connection_broken() {
        let (conn, server) = connected_pair(8).await;
        drop(server);

        // The reader sees EOF on its peek and records the cause.
        tokio::time::timeout(Duration::from_secs(1), async {
            while !conn.is_closed() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(matches!(
            conn.close_cause(),
            Some(ClientError::PeerClosed)
        ));
    }

    #[tokio::test]
    async fn test_round_trip_on_closed_conn_fails_fast() {
        let (conn, _server) = connected_pair(9).await;
        conn.close(ClientError::ConnEarlyClose);

        let ctx = CallContext::background();
        let result = conn
            .round_trip(Header::request(), request_body(b"x"), &ctx)
            .await;
        assert!(matches!(result, Err(ClientError::ConnEarlyClose)));
    }

    #[tokio::test]
    async fn test_server_status_frame_surfaces_as_business_error() {
        let (conn, mut server) = connected_pair(10).await;
        let server_task = tokio::spawn(async move {
            let ctx = CallContext::background();
            let (read_half, write_half) = server.split();
            let mut reader = tokio::io::BufReader::new(read_half);
            let mut writer = tokio::io::BufWriter::new(write_half);
            let _ = read_frame(&mut reader, &ctx).await.unwrap();
            let mut header = Header::status(402);
            write_frame(&mut writer, &ctx, &mut header, b"invalid path")
                .await
                .unwrap();
            writer.flush().await.unwrap();
        });

        let ctx = CallContext::background();
        let rsp = conn
            .round_trip(Header::request(), request_body(b"x"), &ctx)
            .await
            .unwrap();
        assert_eq!(rsp.code, 402);
        assert_eq!(rsp.err.as_deref(), Some("invalid path"));
        // The frame was well-formed, so the connection stays open.
        assert!(!conn.is_closed());
        server_task.await.unwrap();
    }
}
