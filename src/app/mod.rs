//! Application Layer
//!
//! This module contains:
//! - Runtime: configuration-driven chain construction and worker threads
//! - Metrics: Prometheus counters and gauges for every stage
//! - StatsApi: HTTP endpoint serving the metrics

pub mod metrics;
mod runtime;
pub mod stats_api;

pub use runtime::Runtime;
