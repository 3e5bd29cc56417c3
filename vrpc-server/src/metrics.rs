//! Prometheus metrics for the vrpc server.

use prometheus::{Counter, Gauge, Histogram, HistogramOpts, Opts, Registry};

/// Duration histogram buckets (in seconds).
const DURATION_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0];

/// Prometheus metrics for the server.
#[derive(Clone)]
pub struct ServerMetrics {
    registry: Registry,
    /// Total connections accepted.
    pub connections_total: Counter,
    /// Currently active connections.
    pub connections_active: Gauge,
    /// Time spent reading one request frame.
    pub read_duration: Histogram,
    /// Time spent writing one response frame.
    pub write_duration: Histogram,
    /// Time spent inside the handler.
    pub handle_duration: Histogram,
}

impl ServerMetrics {
    /// Creates a new metrics instance with all metrics registered.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let connections_total = Counter::with_opts(Opts::new(
            "vrpc_server_connections_total",
            "Total number of connections accepted",
        ))?;
        registry.register(Box::new(connections_total.clone()))?;

        let connections_active = Gauge::with_opts(Opts::new(
            "vrpc_server_connections_active",
            "Number of currently active connections",
        ))?;
        registry.register(Box::new(connections_active.clone()))?;

        let read_duration = Histogram::with_opts(
            HistogramOpts::new(
                "vrpc_server_read_seconds",
                "Time spent reading one request frame",
            )
            .buckets(DURATION_BUCKETS.to_vec()),
        )?;
        registry.register(Box::new(read_duration.clone()))?;

        let write_duration = Histogram::with_opts(
            HistogramOpts::new(
                "vrpc_server_write_seconds",
                "Time spent writing one response frame",
            )
            .buckets(DURATION_BUCKETS.to_vec()),
        )?;
        registry.register(Box::new(write_duration.clone()))?;

        let handle_duration = Histogram::with_opts(
            HistogramOpts::new(
                "vrpc_server_handle_seconds",
                "Time spent inside request handlers",
            )
            .buckets(DURATION_BUCKETS.to_vec()),
        )?;
        registry.register(Box::new(handle_duration.clone()))?;

        Ok(Self {
            registry,
            connections_total,
            connections_active,
            read_duration,
            write_duration,
            handle_duration,
        })
    }

    /// Returns the registry holding all server metrics.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}
