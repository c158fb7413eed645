//! In-process metrics registry
//!
//! Counters and latency histograms with a JSON snapshot for the metrics
//! endpoint. Names are registered lazily on first touch.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

/// Histogram bucket upper bounds, in milliseconds.
const BUCKET_BOUNDS_MS: [u64; 10] = [5, 10, 25, 50, 100, 250, 500, 1_000, 2_500, 5_000];

#[derive(Debug, Default)]
struct Histogram {
    count: u64,
    sum: u64,
    buckets: [u64; BUCKET_BOUNDS_MS.len() + 1],
}

impl Histogram {
    fn observe(&mut self, value_ms: u64) {
        self.count += 1;
        self.sum += value_ms;
        let idx = BUCKET_BOUNDS_MS
            .iter()
            .position(|bound| value_ms <= *bound)
            .unwrap_or(BUCKET_BOUNDS_MS.len());
        self.buckets[idx] += 1;
    }
}

/// Snapshot of one histogram.
#[derive(Debug, Clone, Serialize)]
pub struct HistogramSnapshot {
    pub count: u64,
    pub sum_ms: u64,
    /// `(upper_bound_ms, count)`; the last entry is the overflow bucket
    pub buckets: Vec<(String, u64)>,
}

/// Full registry snapshot, serialized as the metrics endpoint body.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub counters: BTreeMap<String, u64>,
    pub histograms: BTreeMap<String, HistogramSnapshot>,
}

/// Counter and histogram registry shared across the engine, runner, and
/// server.
#[derive(Default)]
pub struct Metrics {
    counters: Mutex<HashMap<&'static str, Arc<AtomicU64>>>,
    histograms: Mutex<HashMap<&'static str, Histogram>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(&self, name: &'static str) {
        self.incr_by(name, 1);
    }

    pub fn incr_by(&self, name: &'static str, value: u64) {
        let counter = {
            let mut guard = self.counters.lock();
            guard
                .entry(name)
                .or_insert_with(|| Arc::new(AtomicU64::new(0)))
                .clone()
        };
        counter.fetch_add(value, Ordering::Relaxed);
    }

    pub fn observe_ms(&self, name: &'static str, value_ms: u64) {
        let mut guard = self.histograms.lock();
        guard.entry(name).or_default().observe(value_ms);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let counters = {
            let guard = self.counters.lock();
            guard
                .iter()
                .map(|(name, value)| (name.to_string(), value.load(Ordering::Relaxed)))
                .collect()
        };
        let histograms = {
            let guard = self.histograms.lock();
            guard
                .iter()
                .map(|(name, histogram)| {
                    let mut buckets: Vec<(String, u64)> = BUCKET_BOUNDS_MS
                        .iter()
                        .enumerate()
                        .map(|(i, bound)| (format!("le_{bound}"), histogram.buckets[i]))
                        .collect();
                    buckets.push((
                        "le_inf".to_string(),
                        histogram.buckets[BUCKET_BOUNDS_MS.len()],
                    ));
                    (
                        name.to_string(),
                        HistogramSnapshot {
                            count: histogram.count,
                            sum_ms: histogram.sum,
                            buckets,
                        },
                    )
                })
                .collect()
        };
        MetricsSnapshot {
            counters,
            histograms,
        }
    }
}
