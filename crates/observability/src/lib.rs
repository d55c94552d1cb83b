//! Tracing, logging, metrics (shared setup).

/// Initialize process-wide observability (tracing/logging).
///
/// Safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init();
}

/// Counters injected into services as a `MetricsSink`.
pub mod metrics;

/// Tracing subscriber configuration (filters, layers).
pub mod tracing;

pub use metrics::{InMemoryMetrics, MetricsSink, NoopMetrics, TracingMetrics};
