//! Cache Metrics Collection
//!
//! Lookup/hit/miss counters for monitoring cache health. They have no role in
//! correctness and live as long as the cache that owns them; only
//! [`CacheMetrics::reset`] (called by flush) clears them.

use std::sync::atomic::{AtomicU64, Ordering};

use prometheus::{Encoder, IntGauge, Opts, Registry, TextEncoder};

use super::store::StoreStats;
use crate::error::{Error, Result};

/// Cache metrics collector
#[derive(Debug, Default)]
pub struct CacheMetrics {
    lookups: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    lookup_errors: AtomicU64,
    inserts: AtomicU64,
    duplicate_inserts: AtomicU64,
    insert_errors: AtomicU64,
    bytes_inserted: AtomicU64,
}

impl CacheMetrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_lookup(&self) {
        self.lookups.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lookup_error(&self) {
        self.lookup_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_insert(&self, bytes: u64) {
        self.inserts.fetch_add(1, Ordering::Relaxed);
        self.bytes_inserted.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_duplicate_insert(&self) {
        self.duplicate_inserts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_insert_error(&self) {
        self.insert_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn lookups(&self) -> u64 {
        self.lookups.load(Ordering::Relaxed)
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn inserts(&self) -> u64 {
        self.inserts.load(Ordering::Relaxed)
    }

    /// Get hit ratio
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits() as f64;
        let total = hits + self.misses() as f64;
        if total == 0.0 {
            0.0
        } else {
            hits / total
        }
    }

    /// Snapshot counters together with the backing store's statistics
    pub fn snapshot(&self, store: StoreStats) -> MetricsSnapshot {
        MetricsSnapshot {
            lookups: self.lookups(),
            hits: self.hits(),
            misses: self.misses(),
            lookup_errors: self.lookup_errors.load(Ordering::Relaxed),
            hit_ratio: self.hit_ratio(),
            inserts: self.inserts(),
            duplicate_inserts: self.duplicate_inserts.load(Ordering::Relaxed),
            insert_errors: self.insert_errors.load(Ordering::Relaxed),
            bytes_inserted: self.bytes_inserted.load(Ordering::Relaxed),
            store,
        }
    }

    /// Reset all metrics
    pub fn reset(&self) {
        self.lookups.store(0, Ordering::Relaxed);
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.lookup_errors.store(0, Ordering::Relaxed);
        self.inserts.store(0, Ordering::Relaxed);
        self.duplicate_inserts.store(0, Ordering::Relaxed);
        self.insert_errors.store(0, Ordering::Relaxed);
        self.bytes_inserted.store(0, Ordering::Relaxed);
    }
}

/// Point-in-time copy of all cache metrics
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub lookups: u64,
    pub hits: u64,
    pub misses: u64,
    pub lookup_errors: u64,
    pub hit_ratio: f64,
    pub inserts: u64,
    pub duplicate_inserts: u64,
    pub insert_errors: u64,
    pub bytes_inserted: u64,
    /// Backing store view
    pub store: StoreStats,
}

impl MetricsSnapshot {
    /// Render in the Prometheus text exposition format
    ///
    /// Metric names are prefixed with `respcache_` and labelled with the
    /// backend name.
    pub fn to_prometheus(&self, backend: &str) -> Result<String> {
        let registry = Registry::new();
        let mut gauges = vec![
            ("lookups_total", "Cache lookups", self.lookups as i64),
            ("hits_total", "Lookups that found an entry", self.hits as i64),
            ("misses_total", "Lookups that found nothing", self.misses as i64),
            ("lookup_errors_total", "Lookups that failed", self.lookup_errors as i64),
            ("inserts_total", "Entries inserted", self.inserts as i64),
            (
                "duplicate_inserts_total",
                "Inserts rejected because the key existed",
                self.duplicate_inserts as i64,
            ),
            ("insert_errors_total", "Inserts that failed", self.insert_errors as i64),
            ("inserted_bytes_total", "Payload bytes inserted", self.bytes_inserted as i64),
            ("entries", "Entries held by the backing store", self.store.entries as i64),
            ("stored_bytes", "Bytes held by the backing store", self.store.bytes as i64),
            ("evictions_total", "Entries evicted to make room", self.store.evictions as i64),
        ];
        if let Some(capacity) = self.store.capacity {
            gauges.push(("capacity_bytes", "Arena capacity", capacity as i64));
        }

        for (name, help, value) in gauges {
            let opts = Opts::new(format!("respcache_{}", name), help)
                .const_label("backend", backend);
            let gauge = IntGauge::with_opts(opts).map_err(prometheus_error)?;
            gauge.set(value);
            registry
                .register(Box::new(gauge))
                .map_err(prometheus_error)?;
        }

        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&registry.gather(), &mut buffer)
            .map_err(prometheus_error)?;
        String::from_utf8(buffer).map_err(|e| Error::internal(e.to_string()))
    }
}

fn prometheus_error(err: prometheus::Error) -> Error {
    Error::internal(format!("metrics encoding failed: {}", err))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_counters() {
        let metrics = CacheMetrics::new();
        metrics.record_lookup();
        metrics.record_lookup();
        metrics.record_hit();
        metrics.record_miss();
        metrics.record_insert(128);

        assert_eq!(metrics.lookups(), 2);
        assert_eq!(metrics.hits(), 1);
        assert_eq!(metrics.misses(), 1);
        assert_eq!(metrics.inserts(), 1);
        assert_eq!(metrics.hit_ratio(), 0.5);
    }

    #[test]
    fn test_metrics_hit_ratio_empty() {
        assert_eq!(CacheMetrics::new().hit_ratio(), 0.0);
    }

    #[test]
    fn test_metrics_reset() {
        let metrics = CacheMetrics::new();
        metrics.record_lookup();
        metrics.record_hit();
        metrics.record_insert_error();
        metrics.reset();

        let snapshot = metrics.snapshot(StoreStats::default());
        assert_eq!(snapshot.lookups, 0);
        assert_eq!(snapshot.hits, 0);
        assert_eq!(snapshot.insert_errors, 0);
    }

    #[test]
    fn test_prometheus_exposition() {
        let metrics = CacheMetrics::new();
        metrics.record_lookup();
        metrics.record_hit();
        let store = StoreStats {
            entries: 3,
            capacity: Some(4096),
            evictions: 2,
            ..Default::default()
        };

        let text = metrics.snapshot(store).to_prometheus("local").unwrap();
        assert!(text.contains("respcache_hits_total{backend=\"local\"} 1"));
        assert!(text.contains("respcache_entries{backend=\"local\"} 3"));
        assert!(text.contains("respcache_evictions_total{backend=\"local\"} 2"));
        assert!(text.contains("respcache_capacity_bytes{backend=\"local\"} 4096"));
    }

    #[test]
    fn test_prometheus_exposition_unbounded_store() {
        let text = CacheMetrics::new()
            .snapshot(StoreStats::default())
            .to_prometheus("redis")
            .unwrap();
        assert!(!text.contains("capacity_bytes"));
        assert!(text.contains("respcache_lookups_total{backend=\"redis\"} 0"));
    }
}
