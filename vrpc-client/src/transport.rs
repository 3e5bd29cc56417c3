//! Round-trip transport: connection acquisition, retry policy, and pool
//! lifecycle.

use crate::config::ClientConfig;
use crate::connect_key::ConnectKey;
use crate::error::ClientError;
use crate::metrics::TransportMetrics;
use crate::persist::{PersistConn, Response};
use crate::pool::ConnPool;
use crate::stream::dial;
use bytes::Bytes;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use vrpc_protocol::{Address, CallContext, Header};

/// A reused connection is retried at most this many times.
const MAX_RETRY_COUNT: usize = 1;

/// One application request bound for a destination.
pub(crate) struct Request {
    pub(crate) addr: Address,
    pub(crate) body: Bytes,
    pub(crate) ctx: CallContext,
}

/// Client transport: owns the pool and every connection it creates.
pub(crate) struct Transport {
    name: String,
    pool: Arc<ConnPool>,
    read_buffer_size: usize,
    write_buffer_size: usize,
    receive_timeout: Option<Duration>,
    conn_index: AtomicI64,
    metrics: Option<Arc<TransportMetrics>>,
}

impl Transport {
    pub(crate) fn new(name: String, config: &ClientConfig) -> Arc<Self> {
        Arc::new(Self {
            name,
            pool: Arc::new(ConnPool::new(
                config.pool_idle_timeout(),
                config.pool_max_per_key(),
            )),
            read_buffer_size: config.read_buffer_size(),
            write_buffer_size: config.write_buffer_size(),
            receive_timeout: config.receive_timeout,
            conn_index: AtomicI64::new(0),
            metrics: config.metrics.clone(),
        })
    }

    pub(crate) fn metrics(&self) -> Option<&Arc<TransportMetrics>> {
        self.metrics.as_ref()
    }

    pub(crate) fn idle_count(&self, key: &ConnectKey) -> usize {
        self.pool.idle_count(key)
    }

    fn next_conn_name(&self) -> i64 {
        self.conn_index.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Acquires a connection for `addr`: from the pool on the first attempt,
    /// always freshly dialed on a retry.
    async fn get_conn(
        &self,
        addr: &Address,
        retry_count: usize,
    ) -> Result<Arc<PersistConn>, ClientError> {
        let key = ConnectKey::from(addr);

        if retry_count == 0 {
            let started = Instant::now();
            if let Some(conn) = self.pool.get(&key) {
                if let Some(metrics) = &self.metrics {
                    metrics.conn_get.observe(started.elapsed().as_secs_f64());
                }
                tracing::debug!(
                    transport = %self.name,
                    conn = conn.name,
                    key = %key,
                    "reusing pooled connection"
                );
                return Ok(conn);
            }
        }

        let started = Instant::now();
        let stream = dial(addr)
            .await
            .map_err(|err| ClientError::Dial(Arc::new(err)))?;
        let conn = PersistConn::spawn(
            self.next_conn_name(),
            key,
            stream,
            Arc::downgrade(&self.pool),
            self.metrics.clone(),
            self.receive_timeout,
            self.read_buffer_size,
            self.write_buffer_size,
        );
        if let Some(metrics) = &self.metrics {
            metrics.conn_new.observe(started.elapsed().as_secs_f64());
        }
        tracing::debug!(transport = %self.name, conn = conn.name, addr = %addr, "dialed connection");
        Ok(conn)
    }

    /// Executes one round trip, retrying once on a reused connection.
    ///
    /// On success the connection goes back to the pool if it is still open.
    /// On failure the offending connection is closed with the observed error
    /// as its cause. Dial failures are terminal and never retried; a freshly
    /// dialed connection is never retried either, since its failure is
    /// assumed to be logical rather than a stale-socket artifact.
    pub(crate) async fn round_trip(&self, req: &Request) -> Result<Response, ClientError> {
        let mut retry_count = 0;
        loop {
            if req.ctx.is_done() {
                return Err(ClientError::Cancelled);
            }

            let conn = self.get_conn(&req.addr, retry_count).await?;

            let started = Instant::now();
            let result = conn
                .round_trip(Header::request(), req.body.clone(), &req.ctx)
                .await;
            if let Some(metrics) = &self.metrics {
                metrics.trip.observe(started.elapsed().as_secs_f64());
            }

            match result {
                Ok(rsp) => {
                    if !conn.is_closed() {
                        self.pool.put(&conn);
                    }
                    return Ok(rsp);
                }
                Err(err) => {
                    if !conn.was_reused() || retry_count >= MAX_RETRY_COUNT {
                        conn.close(err.clone());
                        return Err(err);
                    }
                    // TODO: distinguish transient I/O failures from logical
                    // ones instead of retrying any reused-connection error.
                    tracing::debug!(
                        transport = %self.name,
                        conn = conn.name,
                        error = %err,
                        "retrying round trip on a fresh connection"
                    );
                    conn.close(err);
                    retry_count += 1;
                }
            }
        }
    }
}
