//! Prometheus-based metrics module
//!
//! Provides metrics collection using Prometheus client library.
//! All metrics are exposed via the /metrics endpoint when the stats API is
//! enabled.

use lazy_static::lazy_static;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // === Line Metrics ===

    /// Total lines created on every worker
    pub static ref LINES_CREATED: IntCounter = IntCounter::new(
        "netchain_lines_created_total",
        "Total number of lines created"
    ).unwrap();

    /// Lines created and not yet freed
    pub static ref LINES_ACTIVE: IntGauge = IntGauge::new(
        "netchain_lines_active",
        "Number of lines not yet freed"
    ).unwrap();

    // === Adapter Metrics ===

    /// Sockets accepted or connected per adapter
    pub static ref ADAPTER_CONNECTIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("netchain_adapter_connections_total", "Total sockets per adapter"),
        &["tag"]
    ).unwrap();

    /// Open sockets per adapter
    pub static ref ADAPTER_CONNECTIONS_ACTIVE: IntGaugeVec = IntGaugeVec::new(
        Opts::new("netchain_adapter_connections_active", "Open sockets per adapter"),
        &["tag"]
    ).unwrap();

    /// Bytes read from sockets per adapter
    pub static ref ADAPTER_BYTES_READ: IntCounterVec = IntCounterVec::new(
        Opts::new("netchain_adapter_bytes_read_total", "Bytes read per adapter"),
        &["tag"]
    ).unwrap();

    /// Bytes written to sockets per adapter
    pub static ref ADAPTER_BYTES_WRITTEN: IntCounterVec = IntCounterVec::new(
        Opts::new("netchain_adapter_bytes_written_total", "Bytes written per adapter"),
        &["tag"]
    ).unwrap();

    // === Mux Metrics ===

    /// Live parent lines per mux stage
    pub static ref MUX_PARENTS_ACTIVE: IntGaugeVec = IntGaugeVec::new(
        Opts::new("netchain_mux_parents_active", "Live mux parent lines"),
        &["tag"]
    ).unwrap();

    /// Live children per mux stage
    pub static ref MUX_CHILDREN_ACTIVE: IntGaugeVec = IntGaugeVec::new(
        Opts::new("netchain_mux_children_active", "Live mux child lines"),
        &["tag"]
    ).unwrap();

    /// Frames written per mux stage and flag
    pub static ref MUX_FRAMES_SENT: IntCounterVec = IntCounterVec::new(
        Opts::new("netchain_mux_frames_sent_total", "Mux frames written"),
        &["tag", "flag"]
    ).unwrap();

    /// Parents torn down because their read stream overflowed
    pub static ref MUX_PARENT_OVERFLOWS: IntCounter = IntCounter::new(
        "netchain_mux_parent_overflows_total",
        "Mux parents closed after a read stream overflow"
    ).unwrap();

    // === HalfDuplex Metrics ===

    /// Paired upload/download legs per stage
    pub static ref HALFDUPLEX_PAIRS_ACTIVE: IntGaugeVec = IntGaugeVec::new(
        Opts::new("netchain_halfduplex_pairs_active", "Paired half-duplex connections"),
        &["tag"]
    ).unwrap();

    /// Legs dropped before pairing, by reason
    pub static ref HALFDUPLEX_UNPAIRED_DROPPED: IntCounterVec = IntCounterVec::new(
        Opts::new("netchain_halfduplex_unpaired_dropped_total", "Legs dropped before pairing"),
        &["tag", "reason"]
    ).unwrap();

    // === Connection Duration ===

    /// Socket lifetime histogram
    pub static ref CONNECTION_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "netchain_connection_duration_seconds",
            "Socket lifetime in seconds"
        ).buckets(vec![0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0, 600.0, 1800.0, 3600.0]),
        &["tag"]
    ).unwrap();
}

/// Initialize and register all metrics with the global registry
pub fn init_metrics() {
    // Lines
    REGISTRY.register(Box::new(LINES_CREATED.clone())).ok();
    REGISTRY.register(Box::new(LINES_ACTIVE.clone())).ok();

    // Adapters
    REGISTRY.register(Box::new(ADAPTER_CONNECTIONS_TOTAL.clone())).ok();
    REGISTRY.register(Box::new(ADAPTER_CONNECTIONS_ACTIVE.clone())).ok();
    REGISTRY.register(Box::new(ADAPTER_BYTES_READ.clone())).ok();
    REGISTRY.register(Box::new(ADAPTER_BYTES_WRITTEN.clone())).ok();

    // Mux
    REGISTRY.register(Box::new(MUX_PARENTS_ACTIVE.clone())).ok();
    REGISTRY.register(Box::new(MUX_CHILDREN_ACTIVE.clone())).ok();
    REGISTRY.register(Box::new(MUX_FRAMES_SENT.clone())).ok();
    REGISTRY.register(Box::new(MUX_PARENT_OVERFLOWS.clone())).ok();

    // HalfDuplex
    REGISTRY.register(Box::new(HALFDUPLEX_PAIRS_ACTIVE.clone())).ok();
    REGISTRY.register(Box::new(HALFDUPLEX_UNPAIRED_DROPPED.clone())).ok();

    // Connection duration
    REGISTRY.register(Box::new(CONNECTION_DURATION_SECONDS.clone())).ok();
}

/// Encode every registered metric in the Prometheus text format
pub fn render() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if encoder.encode(&REGISTRY.gather(), &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Helper struct for tracking a single socket's metrics
pub struct ConnectionMetrics {
    tag: String,
    start_time: std::time::Instant,
}

impl ConnectionMetrics {
    pub fn new(tag: &str) -> Self {
        ADAPTER_CONNECTIONS_TOTAL.with_label_values(&[tag]).inc();
        ADAPTER_CONNECTIONS_ACTIVE.with_label_values(&[tag]).inc();
        Self {
            tag: tag.to_string(),
            start_time: std::time::Instant::now(),
        }
    }

    pub fn record_read(&self, bytes: usize) {
        ADAPTER_BYTES_READ
            .with_label_values(&[&self.tag])
            .inc_by(bytes as u64);
    }

    pub fn record_written(&self, bytes: usize) {
        ADAPTER_BYTES_WRITTEN
            .with_label_values(&[&self.tag])
            .inc_by(bytes as u64);
    }
}

impl Drop for ConnectionMetrics {
    fn drop(&mut self) {
        ADAPTER_CONNECTIONS_ACTIVE.with_label_values(&[&self.tag]).dec();
        CONNECTION_DURATION_SECONDS
            .with_label_values(&[&self.tag])
            .observe(self.start_time.elapsed().as_secs_f64());
    }
}
