//! Per-store statistics.
//!
//! Counters live on the store instance; every mutation is also mirrored to
//! the `metrics` facade with a `store` label.

use std::sync::atomic::{AtomicU64, Ordering};

use metrics::{counter, gauge};
use serde::Serialize;

pub(crate) const METRIC_HIT: &str = "strata_cache_hit_total";
pub(crate) const METRIC_MISS: &str = "strata_cache_miss_total";
pub(crate) const METRIC_PUT: &str = "strata_cache_put_total";
pub(crate) const METRIC_EVICT: &str = "strata_cache_evict_total";
pub(crate) const METRIC_INVALIDATE: &str = "strata_cache_invalidate_total";
pub(crate) const METRIC_ENTRIES: &str = "strata_cache_entries";
pub(crate) const METRIC_CAPTURE_ABANDONED: &str = "strata_cache_capture_abandoned_total";

#[derive(Debug)]
pub struct StoreStats {
    store: String,
    hits: AtomicU64,
    misses: AtomicU64,
    puts: AtomicU64,
    evictions: AtomicU64,
    invalidations: AtomicU64,
    entries: AtomicU64,
    bytes: AtomicU64,
}

/// Point-in-time copy of a store's counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub store: String,
    pub hits: u64,
    pub misses: u64,
    pub puts: u64,
    pub evictions: u64,
    pub invalidations: u64,
    pub entries: u64,
    pub bytes: u64,
}

impl StoreStats {
    pub fn new(store: impl Into<String>) -> Self {
        Self {
            store: store.into(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            puts: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
            entries: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
        }
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        counter!(METRIC_HIT, "store" => self.store.clone()).increment(1);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        counter!(METRIC_MISS, "store" => self.store.clone()).increment(1);
    }

    pub fn record_put(&self) {
        self.puts.fetch_add(1, Ordering::Relaxed);
        counter!(METRIC_PUT, "store" => self.store.clone()).increment(1);
    }

    pub fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
        counter!(METRIC_EVICT, "store" => self.store.clone()).increment(1);
    }

    pub fn record_invalidations(&self, removed: u64) {
        if removed == 0 {
            return;
        }
        self.invalidations.fetch_add(removed, Ordering::Relaxed);
        counter!(METRIC_INVALIDATE, "store" => self.store.clone()).increment(removed);
    }

    /// Overwrite the occupancy figures after a mutation.
    pub fn set_occupancy(&self, entries: u64, bytes: u64) {
        self.entries.store(entries, Ordering::Relaxed);
        self.bytes.store(bytes, Ordering::Relaxed);
        gauge!(METRIC_ENTRIES, "store" => self.store.clone()).set(entries as f64);
    }

    /// Adjust occupancy by signed deltas, saturating at zero.
    pub fn adjust_occupancy(&self, entries: i64, bytes: i64) {
        let entries = saturating_apply(&self.entries, entries);
        saturating_apply(&self.bytes, bytes);
        gauge!(METRIC_ENTRIES, "store" => self.store.clone()).set(entries as f64);
    }

    pub fn entries(&self) -> u64 {
        self.entries.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            store: self.store.clone(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            puts: self.puts.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            entries: self.entries.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
        }
    }

    /// Reset every counter. Called by a full clear.
    pub fn reset(&self) {
        for counter in [
            &self.hits,
            &self.misses,
            &self.puts,
            &self.evictions,
            &self.invalidations,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.set_occupancy(0, 0);
    }
}

fn saturating_apply(target: &AtomicU64, delta: i64) -> u64 {
    let mut current = target.load(Ordering::Relaxed);
    loop {
        let next = if delta >= 0 {
            current.saturating_add(delta as u64)
        } else {
            current.saturating_sub(delta.unsigned_abs())
        };
        match target.compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(actual) => current = actual,
        }
    }
}
