use std::collections::BTreeMap;
use std::sync::Mutex;

/// Counter sink handed to services at construction time.
///
/// Implementations must be cheap and must never fail the caller.
pub trait MetricsSink: Send + Sync + 'static {
    fn incr(&self, name: &'static str, labels: &[(&'static str, &str)]);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn incr(&self, _name: &'static str, _labels: &[(&'static str, &str)]) {}
}

/// Emits each increment as a `debug!` event so log pipelines can aggregate it.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetrics;

impl MetricsSink for TracingMetrics {
    fn incr(&self, name: &'static str, labels: &[(&'static str, &str)]) {
        ::tracing::debug!(metric = name, labels = %render_labels(labels), "counter incremented");
    }
}

/// Records counts keyed by `name{k=v,...}`, for assertions in tests.
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    counts: Mutex<BTreeMap<String, u64>>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total for `name` across all label sets.
    pub fn count(&self, name: &str) -> u64 {
        let counts = match self.counts.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        counts
            .iter()
            .filter(|(key, _)| key.as_str() == name || key.starts_with(&format!("{name}{{")))
            .map(|(_, v)| *v)
            .sum()
    }

    /// Count for one exact series, e.g. `count_with("ledger.rejected", &[("kind", "conflict")])`.
    pub fn count_with(&self, name: &str, labels: &[(&'static str, &str)]) -> u64 {
        let counts = match self.counts.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        counts.get(&series_key(name, labels)).copied().unwrap_or(0)
    }

    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        match self.counts.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl MetricsSink for InMemoryMetrics {
    fn incr(&self, name: &'static str, labels: &[(&'static str, &str)]) {
        let mut counts = match self.counts.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *counts.entry(series_key(name, labels)).or_insert(0) += 1;
    }
}

impl<M> MetricsSink for std::sync::Arc<M>
where
    M: MetricsSink + ?Sized,
{
    fn incr(&self, name: &'static str, labels: &[(&'static str, &str)]) {
        (**self).incr(name, labels)
    }
}

fn render_labels(labels: &[(&'static str, &str)]) -> String {
    let mut sorted: Vec<_> = labels.to_vec();
    sorted.sort_by_key(|(k, _)| *k);
    sorted
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

fn series_key(name: &str, labels: &[(&'static str, &str)]) -> String {
    if labels.is_empty() {
        name.to_string()
    } else {
        format!("{name}{{{}}}", render_labels(labels))
    }
}
