//! Backend Usage Statistics
//!
//! Per-backend counters collected lock-free and snapshotted into a
//! [`UsageStats`] tree mirroring the backend graph.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

use super::{BackendKind, PutStatus, SpeedClass};

/// Counters kept by every backend
#[derive(Debug, Default)]
pub struct BackendStats {
    get_hits: AtomicU64,
    get_misses: AtomicU64,
    get_bytes: AtomicU64,

    put_stored: AtomicU64,
    put_skipped: AtomicU64,
    put_bytes: AtomicU64,

    removes: AtomicU64,
    corruptions: AtomicU64,

    // Operation latencies (microseconds, exponential moving average)
    read_latency_us: AtomicU64,
    write_latency_us: AtomicU64,
}

impl BackendStats {
    /// Create a new collector
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_get_hit(&self, bytes: u64, latency: Duration) {
        self.get_hits.fetch_add(1, Ordering::Relaxed);
        self.get_bytes.fetch_add(bytes, Ordering::Relaxed);
        update_latency_ema(&self.read_latency_us, latency);
    }

    pub fn record_get_miss(&self) {
        self.get_misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the outcome of a write
    pub fn record_put(&self, status: PutStatus, bytes: u64, latency: Duration) {
        match status {
            PutStatus::Cached => {
                self.put_stored.fetch_add(1, Ordering::Relaxed);
                self.put_bytes.fetch_add(bytes, Ordering::Relaxed);
                update_latency_ema(&self.write_latency_us, latency);
            }
            PutStatus::NotCached => {
                self.put_skipped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn record_remove(&self) {
        self.removes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_corruption(&self) {
        self.corruptions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_hits(&self) -> u64 {
        self.get_hits.load(Ordering::Relaxed)
    }

    pub fn get_misses(&self) -> u64 {
        self.get_misses.load(Ordering::Relaxed)
    }

    pub fn corruptions(&self) -> u64 {
        self.corruptions.load(Ordering::Relaxed)
    }

    /// Fraction of gets that hit
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.get_hits() as f64;
        let total = hits + self.get_misses() as f64;
        if total == 0.0 {
            0.0
        } else {
            hits / total
        }
    }

    pub fn read_latency(&self) -> Duration {
        Duration::from_micros(self.read_latency_us.load(Ordering::Relaxed))
    }

    pub fn write_latency(&self) -> Duration {
        Duration::from_micros(self.write_latency_us.load(Ordering::Relaxed))
    }

    /// Get snapshot of all counters
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            get_hits: self.get_hits(),
            get_misses: self.get_misses(),
            get_bytes: self.get_bytes.load(Ordering::Relaxed),
            put_stored: self.put_stored.load(Ordering::Relaxed),
            put_skipped: self.put_skipped.load(Ordering::Relaxed),
            put_bytes: self.put_bytes.load(Ordering::Relaxed),
            removes: self.removes.load(Ordering::Relaxed),
            corruptions: self.corruptions(),
            hit_ratio: self.hit_ratio(),
            read_latency_us: self.read_latency_us.load(Ordering::Relaxed),
            write_latency_us: self.write_latency_us.load(Ordering::Relaxed),
        }
    }

    /// Reset all counters
    pub fn reset(&self) {
        for counter in [
            &self.get_hits,
            &self.get_misses,
            &self.get_bytes,
            &self.put_stored,
            &self.put_skipped,
            &self.put_bytes,
            &self.removes,
            &self.corruptions,
            &self.read_latency_us,
            &self.write_latency_us,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

fn update_latency_ema(target: &AtomicU64, duration: Duration) {
    let new_us = duration.as_micros() as u64;
    let alpha = 0.1; // EMA smoothing factor

    loop {
        let current = target.load(Ordering::Relaxed);
        let updated = if current == 0 {
            new_us
        } else {
            ((1.0 - alpha) * current as f64 + alpha * new_us as f64) as u64
        };

        if target
            .compare_exchange_weak(current, updated, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            break;
        }
    }
}

/// Point-in-time copy of [`BackendStats`]
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub get_hits: u64,
    pub get_misses: u64,
    pub get_bytes: u64,
    pub put_stored: u64,
    pub put_skipped: u64,
    pub put_bytes: u64,
    pub removes: u64,
    pub corruptions: u64,
    pub hit_ratio: f64,
    pub read_latency_us: u64,
    pub write_latency_us: u64,
}

impl StatsSnapshot {
    /// Sum counters of two snapshots; ratios and latencies are recomputed or
    /// taken as the maximum
    pub fn combine(&self, other: &StatsSnapshot) -> StatsSnapshot {
        let get_hits = self.get_hits + other.get_hits;
        let get_misses = self.get_misses + other.get_misses;
        let total = get_hits + get_misses;
        StatsSnapshot {
            get_hits,
            get_misses,
            get_bytes: self.get_bytes + other.get_bytes,
            put_stored: self.put_stored + other.put_stored,
            put_skipped: self.put_skipped + other.put_skipped,
            put_bytes: self.put_bytes + other.put_bytes,
            removes: self.removes + other.removes,
            corruptions: self.corruptions + other.corruptions,
            hit_ratio: if total == 0 {
                0.0
            } else {
                get_hits as f64 / total as f64
            },
            read_latency_us: self.read_latency_us.max(other.read_latency_us),
            write_latency_us: self.write_latency_us.max(other.write_latency_us),
        }
    }
}

/// Usage of one node of the backend graph and of everything below it
#[derive(Debug, Clone, Serialize)]
pub struct UsageStats {
    /// Node name
    pub name: String,
    /// Node type
    pub kind: BackendKind,
    /// Speed classification
    pub speed_class: SpeedClass,
    /// Counters of this node
    pub stats: StatsSnapshot,
    /// Wrapped or composed backends
    pub children: Vec<UsageStats>,
}

impl UsageStats {
    /// Stats of a node without children
    pub fn leaf(
        name: impl Into<String>,
        kind: BackendKind,
        speed_class: SpeedClass,
        stats: StatsSnapshot,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            speed_class,
            stats,
            children: Vec::new(),
        }
    }

    /// Attach child stats
    pub fn with_children(mut self, children: Vec<UsageStats>) -> Self {
        self.children = children;
        self
    }

    /// Every node without children, depth first
    pub fn leaves(&self) -> Vec<&UsageStats> {
        if self.children.is_empty() {
            return vec![self];
        }
        self.children.iter().flat_map(|c| c.leaves()).collect()
    }

    /// Counters summed over every leaf
    pub fn totals(&self) -> StatsSnapshot {
        self.leaves()
            .iter()
            .fold(StatsSnapshot::default(), |acc, leaf| acc.combine(&leaf.stats))
    }
}

/// Latency tracker helper
pub struct LatencyTracker {
    start: Instant,
}

impl LatencyTracker {
    /// Start tracking latency
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get elapsed duration
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

// =============================================================================
// Tests
// =============================================================================
