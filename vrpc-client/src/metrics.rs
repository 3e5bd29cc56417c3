//! Latency histograms for the client transport.

use prometheus::{Histogram, HistogramOpts, Registry};

/// Latency histogram buckets (in seconds).
const LATENCY_BUCKETS: &[f64] = &[
    0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5,
];

/// Latency histograms for the client transport.
pub struct TransportMetrics {
    registry: Registry,
    /// Time to fetch a live connection from the pool.
    pub conn_get: Histogram,
    /// Time to dial and set up a fresh connection.
    pub conn_new: Histogram,
    /// Full round-trip time as seen by the transport.
    pub trip: Histogram,
    /// Time until the writer acknowledged the request frame.
    pub send_done: Histogram,
    /// Time until the reader delivered the response.
    pub receive: Histogram,
    /// Time spent before a round trip ended without a response.
    pub receive_timeout: Histogram,
}

impl TransportMetrics {
    /// Creates a new metrics instance with all histograms registered.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let conn_get = Self::histogram(
            &registry,
            "vrpc_client_conn_get_seconds",
            "Time to fetch a pooled connection",
        )?;
        let conn_new = Self::histogram(
            &registry,
            "vrpc_client_conn_new_seconds",
            "Time to dial a fresh connection",
        )?;
        let trip = Self::histogram(
            &registry,
            "vrpc_client_trip_seconds",
            "Round-trip time per request",
        )?;
        let send_done = Self::histogram(
            &registry,
            "vrpc_client_send_done_seconds",
            "Time until the request frame was written",
        )?;
        let receive = Self::histogram(
            &registry,
            "vrpc_client_receive_seconds",
            "Time until the response frame was delivered",
        )?;
        let receive_timeout = Self::histogram(
            &registry,
            "vrpc_client_receive_timeout_seconds",
            "Time spent in round trips that ended without a response",
        )?;

        Ok(Self {
            registry,
            conn_get,
            conn_new,
            trip,
            send_done,
            receive,
            receive_timeout,
        })
    }

    fn histogram(
        registry: &Registry,
        name: &str,
        help: &str,
    ) -> Result<Histogram, prometheus::Error> {
        let histogram =
            Histogram::with_opts(HistogramOpts::new(name, help).buckets(LATENCY_BUCKETS.to_vec()))?;
        registry.register(Box::new(histogram.clone()))?;
        Ok(histogram)
    }

    /// Returns the registry holding all transport metrics.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_register() {
        let metrics = TransportMetrics::new().unwrap();
        metrics.trip.observe(0.005);
        metrics.conn_new.observe(0.001);

        let families = metrics.registry().gather();
        assert_eq!(families.len(), 6);
    }
}
