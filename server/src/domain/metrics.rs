//! Event plane metrics
//!
//! Counters and gauges the event plane emits; the scraping endpoint shape is
//! an external concern, so consumers take a snapshot and render it however
//! they like. One `GatewayMetrics` is shared by every component of a replica.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;

/// Histogram bucket upper bounds in milliseconds
const LATENCY_BUCKETS_MS: &[u64] = &[1, 2, 5, 10, 25, 50, 100, 250, 500, 1000, 2500];

/// Coarse latency histogram with fixed millisecond buckets
#[derive(Default)]
pub struct LatencyHistogram {
    buckets: [AtomicU64; LATENCY_BUCKETS_MS.len() + 1],
    count: AtomicU64,
    sum_ms: AtomicU64,
}

impl LatencyHistogram {
    pub fn observe(&self, elapsed: Duration) {
        let ms = elapsed.as_millis() as u64;
        let idx = LATENCY_BUCKETS_MS
            .iter()
            .position(|&bound| ms <= bound)
            .unwrap_or(LATENCY_BUCKETS_MS.len());
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_ms.fetch_add(ms, Ordering::Relaxed);
    }

    fn snapshot(&self) -> HistogramSnapshot {
        HistogramSnapshot {
            bucket_bounds_ms: LATENCY_BUCKETS_MS.to_vec(),
            bucket_counts: self
                .buckets
                .iter()
                .map(|b| b.load(Ordering::Relaxed))
                .collect(),
            count: self.count.load(Ordering::Relaxed),
            sum_ms: self.sum_ms.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HistogramSnapshot {
    pub bucket_bounds_ms: Vec<u64>,
    pub bucket_counts: Vec<u64>,
    pub count: u64,
    pub sum_ms: u64,
}

/// Shared metrics sink for one replica
#[derive(Default)]
pub struct GatewayMetrics {
    events_published: AtomicU64,
    events_delivered: AtomicU64,
    events_dropped: AtomicU64,
    rate_limit_hits: AtomicU64,
    rate_limit_blocks: AtomicU64,
    errors: DashMap<&'static str, u64>,
    topics_active: AtomicI64,
    subscribers_active: AtomicI64,
    publish_latency: LatencyHistogram,
    subscribe_setup_latency: LatencyHistogram,
}

impl GatewayMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr_published(&self) {
        self.events_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_delivered(&self) {
        self.events_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_dropped(&self, n: u64) {
        self.events_dropped.fetch_add(n, Ordering::Relaxed);
    }

    pub fn incr_rate_limit_hits(&self) {
        self.rate_limit_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_rate_limit_blocks(&self) {
        self.rate_limit_blocks.fetch_add(1, Ordering::Relaxed);
    }

    /// Count an error by its stable kind tag
    pub fn incr_error(&self, kind: &'static str) {
        *self.errors.entry(kind).or_insert(0) += 1;
    }

    pub fn set_topics_active(&self, n: i64) {
        self.topics_active.store(n, Ordering::Relaxed);
    }

    pub fn set_subscribers_active(&self, n: i64) {
        self.subscribers_active.store(n, Ordering::Relaxed);
    }

    pub fn add_subscribers_active(&self, delta: i64) {
        self.subscribers_active.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn observe_publish_latency(&self, elapsed: Duration) {
        self.publish_latency.observe(elapsed);
    }

    pub fn observe_subscribe_setup_latency(&self, elapsed: Duration) {
        self.subscribe_setup_latency.observe(elapsed);
    }

    pub fn events_dropped(&self) -> u64 {
        self.events_dropped.load(Ordering::Relaxed)
    }

    pub fn events_published(&self) -> u64 {
        self.events_published.load(Ordering::Relaxed)
    }

    pub fn events_delivered(&self) -> u64 {
        self.events_delivered.load(Ordering::Relaxed)
    }

    /// Point-in-time view for the scraping surface
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            events_published: self.events_published.load(Ordering::Relaxed),
            events_delivered: self.events_delivered.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            rate_limit_hits: self.rate_limit_hits.load(Ordering::Relaxed),
            rate_limit_blocks: self.rate_limit_blocks.load(Ordering::Relaxed),
            errors_total: self
                .errors
                .iter()
                .map(|entry| (entry.key().to_string(), *entry.value()))
                .collect(),
            topics_active: self.topics_active.load(Ordering::Relaxed),
            subscribers_active: self.subscribers_active.load(Ordering::Relaxed),
            publish_latency: self.publish_latency.snapshot(),
            subscribe_setup_latency: self.subscribe_setup_latency.snapshot(),
        }
    }
}

/// Serializable metrics snapshot
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub events_published: u64,
    pub events_delivered: u64,
    pub events_dropped: u64,
    pub rate_limit_hits: u64,
    pub rate_limit_blocks: u64,
    pub errors_total: std::collections::HashMap<String, u64>,
    pub topics_active: i64,
    pub subscribers_active: i64,
    pub publish_latency: HistogramSnapshot,
    pub subscribe_setup_latency: HistogramSnapshot,
}
