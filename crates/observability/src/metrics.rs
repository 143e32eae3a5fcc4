//! Monotonic metric counters.
//!
//! Both batch workers increment these; observability tooling reads them.
//! Counters only ever go up — rates and deltas are the reader's business.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// One named counter value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricCounter {
    pub name: String,
    pub value: u64,
    pub updated_at: DateTime<Utc>,
}

/// Sink for monotonic counters.
pub trait MetricsSink: Send + Sync {
    /// Increment `name` by `delta` (creating it at zero if absent).
    fn incr(&self, name: &str, delta: u64);

    /// Current values, sorted by name.
    fn snapshot(&self) -> Vec<MetricCounter>;
}

impl<S> MetricsSink for Arc<S>
where
    S: MetricsSink + ?Sized,
{
    fn incr(&self, name: &str, delta: u64) {
        (**self).incr(name, delta)
    }

    fn snapshot(&self) -> Vec<MetricCounter> {
        (**self).snapshot()
    }
}

/// In-memory counter store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    counters: RwLock<HashMap<String, MetricCounter>>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of one counter (0 if never incremented).
    pub fn value(&self, name: &str) -> u64 {
        self.counters
            .read()
            .ok()
            .and_then(|c| c.get(name).map(|m| m.value))
            .unwrap_or(0)
    }
}

impl MetricsSink for InMemoryMetrics {
    fn incr(&self, name: &str, delta: u64) {
        if let Ok(mut counters) = self.counters.write() {
            let entry = counters.entry(name.to_string()).or_insert_with(|| MetricCounter {
                name: name.to_string(),
                value: 0,
                updated_at: Utc::now(),
            });
            entry.value = entry.value.saturating_add(delta);
            entry.updated_at = Utc::now();
        }
    }

    fn snapshot(&self) -> Vec<MetricCounter> {
        let mut all: Vec<MetricCounter> = match self.counters.read() {
            Ok(c) => c.values().cloned().collect(),
            Err(_) => return vec![],
        };
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }
}

/// Metrics sink that drops everything (for tests that don't care).
#[derive(Debug, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn incr(&self, _name: &str, _delta: u64) {}

    fn snapshot(&self) -> Vec<MetricCounter> {
        vec![]
    }
}
