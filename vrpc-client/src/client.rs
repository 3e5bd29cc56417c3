//! High-level client API.

use crate::config::ClientConfig;
use crate::connect_key::ConnectKey;
use crate::error::ClientError;
use crate::metrics::TransportMetrics;
use crate::persist::Response;
use crate::transport::{Request, Transport};
use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use vrpc_protocol::{Address, CallContext, CallRequest};

static TRANSPORT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Request/response client over pooled persistent connections.
///
/// The client is cheap to share: wrap it in an [`Arc`] and call it from any
/// number of tasks. Its transport is created on construction and owns every
/// connection it dials until the process exits.
pub struct Client {
    transport: Arc<Transport>,
    timeout: Duration,
}

impl Client {
    pub fn new(config: ClientConfig) -> Self {
        let seq = TRANSPORT_SEQ.fetch_add(1, Ordering::Relaxed) + 1;
        Self {
            timeout: config.timeout(),
            transport: Transport::new(format!("transport-{seq}"), &config),
        }
    }

    /// Issues one request against the handler registered at `path` on the
    /// destination, under the configured default timeout.
    ///
    /// A returned error is either a system error (dial, framing, timeout,
    /// cancellation) or a [`ClientError::Server`] business error carried in
    /// the response envelope.
    pub async fn call(
        &self,
        addr: &Address,
        path: &str,
        payload: &[u8],
    ) -> Result<Bytes, ClientError> {
        let ctx = if self.timeout.is_zero() {
            CallContext::background()
        } else {
            CallContext::with_timeout(self.timeout)
        };
        self.call_with_context(ctx, addr, path, payload).await
    }

    /// Like [`Client::call`] with a caller-supplied context for deadlines
    /// and cancellation.
    pub async fn call_with_context(
        &self,
        ctx: CallContext,
        addr: &Address,
        path: &str,
        payload: &[u8],
    ) -> Result<Bytes, ClientError> {
        let rsp = self.round_trip(ctx, addr, path, payload).await?;
        match rsp.err {
            Some(message) => Err(ClientError::Server {
                code: rsp.code,
                message,
            }),
            None => Ok(rsp.payload),
        }
    }

    /// Issues one request and returns the full [`Response`], including the
    /// name of the connection that served it and any business error.
    pub async fn call_raw(
        &self,
        ctx: CallContext,
        addr: &Address,
        path: &str,
        payload: &[u8],
    ) -> Result<Response, ClientError> {
        self.round_trip(ctx, addr, path, payload).await
    }

    async fn round_trip(
        &self,
        ctx: CallContext,
        addr: &Address,
        path: &str,
        payload: &[u8],
    ) -> Result<Response, ClientError> {
        let body = CallRequest::new(path, payload.to_vec())
            .encode()
            .map_err(ClientError::from)?;
        let req = Request {
            addr: addr.clone(),
            body,
            ctx,
        };
        self.transport.round_trip(&req).await
    }

    /// Number of idle pooled connections for the destination.
    pub fn idle_connections(&self, addr: &Address) -> usize {
        self.transport.idle_count(&ConnectKey::from(addr))
    }

    /// The transport's latency histograms, if metrics were enabled.
    pub fn metrics(&self) -> Option<&Arc<TransportMetrics>> {
        self.transport.metrics()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_applies_default_timeout() {
        let client = Client::new(ClientConfig::new());
        assert_eq!(client.timeout, crate::config::DEFAULT_TIMEOUT);
    }

    #[test]
    fn test_transport_names_are_unique() {
        let a = Client::new(ClientConfig::new());
        let b = Client::new(ClientConfig::new());
        // Both clients own independent transports and pools.
        assert_eq!(a.idle_connections(&Address::tcp("127.0.0.1", 1)), 0);
        assert_eq!(b.idle_connections(&Address::tcp("127.0.0.1", 1)), 0);
    }
}
