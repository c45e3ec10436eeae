//! Hierarchical Backend
//!
//! Presents N ordered tiers (fastest first) as one backend.
//!
//! # Reads
//!
//! Tiers are tried in order. On the first hit the data is returned at once
//! and background tasks:
//!
//! - **backfill** every earlier (faster) writable tier
//! - **cascade** into later writable tiers of class `Fast` or better, if the
//!   hit tier allows it, stopping at a read-only archive that already holds
//!   the key
//!
//! # Writes
//!
//! The first writable tier that accepts the data is written synchronously;
//! the remaining writable tiers are written in the background.
//!
//! Background fills and writes run one priority level below the request
//! that caused them.
//!
//! The tier list sits behind a read-write lock so archives can be mounted
//! and unmounted while requests are in flight. Requests work on a snapshot.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::join_all;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info};

use super::executor::{current_priority, BackgroundExecutor};
use super::stats::{BackendStats, LatencyTracker, StatsSnapshot, UsageStats};
use super::{probe_policy, BackendKind, CacheBackend, PutStatus, SharedBackend, SpeedClass};
use crate::error::{Error, Result};
use crate::key::{CacheKey, LegacyKey};
use crate::record::{CachePolicy, CacheRecord, Value};

/// Background fill counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct FillStats {
    pub backfills: u64,
    pub cascades: u64,
    pub failed: u64,
}

#[derive(Debug, Default)]
struct FillCounters {
    backfills: AtomicU64,
    cascades: AtomicU64,
    failed: AtomicU64,
}

/// Item copied between tiers by a background fill
#[derive(Clone)]
enum FillItem {
    Legacy(LegacyKey, Bytes),
    Record(CacheRecord, CachePolicy),
    Value(CacheKey, Value, CachePolicy),
}

impl FillItem {
    fn describe(&self) -> String {
        match self {
            FillItem::Legacy(key, _) => key.to_string(),
            FillItem::Record(record, _) => record.key().to_string(),
            FillItem::Value(key, _, _) => key.to_string(),
        }
    }

    fn allowed_in(&self, tier: &dyn CacheBackend) -> bool {
        match self {
            FillItem::Legacy(..) => true,
            FillItem::Record(_, policy) | FillItem::Value(_, _, policy) => {
                policy.allows_store(tier.is_remote())
            }
        }
    }

    async fn put_into(&self, tier: &dyn CacheBackend) -> PutStatus {
        match self {
            FillItem::Legacy(key, data) => tier.put(key, data.clone(), false).await,
            FillItem::Record(record, policy) => tier.put_record(record, *policy).await,
            FillItem::Value(key, value, policy) => tier.put_value(key, value, *policy).await,
        }
    }

    async fn present_in(&self, tier: &dyn CacheBackend) -> bool {
        match self {
            FillItem::Legacy(key, _) => tier.exists(key).await,
            FillItem::Record(record, _) => tier.get_record(record.key(), probe_policy()).await.is_some(),
            FillItem::Value(key, _, _) => tier
                .get_value(key, CachePolicy::QUERY | CachePolicy::SKIP_DATA)
                .await
                .is_some(),
        }
    }
}

/// Composite of ordered tiers
pub struct HierarchicalBackend {
    name: String,
    tiers: RwLock<Vec<SharedBackend>>,
    executor: BackgroundExecutor,
    fills: Arc<FillCounters>,
    stats: BackendStats,
}

impl HierarchicalBackend {
    /// Create a hierarchy over `tiers`, fastest first
    pub fn new(name: impl Into<String>, tiers: Vec<SharedBackend>, executor: BackgroundExecutor) -> Self {
        Self {
            name: name.into(),
            tiers: RwLock::new(tiers),
            executor,
            fills: Arc::new(FillCounters::default()),
            stats: BackendStats::new(),
        }
    }

    /// Snapshot of the current tiers
    pub fn tiers(&self) -> Vec<SharedBackend> {
        self.tiers.read().clone()
    }

    /// Executor running backfills and cascades
    pub fn executor(&self) -> &BackgroundExecutor {
        &self.executor
    }

    /// Insert a tier
    ///
    /// Without a position the tier goes before the first slower tier, which
    /// keeps the list ordered fastest first.
    pub fn mount(&self, backend: SharedBackend, position: Option<usize>) -> Result<()> {
        let mut tiers = self.tiers.write();
        if tiers.iter().any(|t| t.name() == backend.name()) {
            return Err(Error::Config(format!(
                "a tier named '{}' is already mounted in '{}'",
                backend.name(),
                self.name
            )));
        }
        let index = position.map(|p| p.min(tiers.len())).unwrap_or_else(|| {
            tiers
                .iter()
                .position(|t| t.speed_class() < backend.speed_class())
                .unwrap_or(tiers.len())
        });
        info!("{}: mounted '{}' at position {}", self.name, backend.name(), index);
        tiers.insert(index, backend);
        Ok(())
    }

    /// Remove a tier by name
    pub fn unmount(&self, name: &str) -> Option<SharedBackend> {
        let mut tiers = self.tiers.write();
        let index = tiers.iter().position(|t| t.name() == name)?;
        info!("{}: unmounted '{}'", self.name, name);
        Some(tiers.remove(index))
    }

    /// Background fill counters
    pub fn fill_stats(&self) -> FillStats {
        FillStats {
            backfills: self.fills.backfills.load(Ordering::Relaxed),
            cascades: self.fills.cascades.load(Ordering::Relaxed),
            failed: self.fills.failed.load(Ordering::Relaxed),
        }
    }

    /// Schedule backfill of faster tiers and cascade into slower ones
    fn schedule_fill(&self, tiers: &[SharedBackend], hit: usize, item: FillItem) {
        let priority = current_priority().lower();
        for tier in tiers[..hit].iter().filter(|t| t.is_writable()) {
            if !item.allowed_in(tier.as_ref()) {
                continue;
            }
            let tier = Arc::clone(tier);
            let item = item.clone();
            let fills = Arc::clone(&self.fills);
            self.executor.spawn_at("backfill", priority, async move {
                if item.put_into(tier.as_ref()).await.is_cached() {
                    fills.backfills.fetch_add(1, Ordering::Relaxed);
                } else {
                    fills.failed.fetch_add(1, Ordering::Relaxed);
                    debug!("Backfill of {} into '{}' failed", item.describe(), tier.name());
                }
            });
        }

        if !tiers[hit].backfill_lower_cache_levels() || hit + 1 >= tiers.len() {
            return;
        }
        let lower: Vec<SharedBackend> = tiers[hit + 1..].to_vec();
        let fills = Arc::clone(&self.fills);
        self.executor.spawn_at("cascade", priority, async move {
            for tier in lower {
                if tier.is_read_only_archive() {
                    if item.present_in(tier.as_ref()).await {
                        break;
                    }
                    continue;
                }
                if !tier.is_writable() || !tier.speed_class().is_fast() || !item.allowed_in(tier.as_ref()) {
                    continue;
                }
                if item.put_into(tier.as_ref()).await.is_cached() {
                    fills.cascades.fetch_add(1, Ordering::Relaxed);
                } else {
                    fills.failed.fetch_add(1, Ordering::Relaxed);
                    debug!("Cascade of {} into '{}' failed", item.describe(), tier.name());
                }
            }
        });
    }

    /// Write synchronously until one tier accepts, then the rest in the
    /// background
    async fn put_two_phase(&self, item: FillItem) -> PutStatus {
        let tracker = LatencyTracker::start();
        let targets: Vec<SharedBackend> = self
            .tiers()
            .into_iter()
            .filter(|t| t.is_writable() && item.allowed_in(t.as_ref()))
            .collect();

        let mut status = PutStatus::NotCached;
        let mut remaining = targets.into_iter();
        for tier in remaining.by_ref() {
            if item.put_into(tier.as_ref()).await.is_cached() {
                status = PutStatus::Cached;
                break;
            }
            debug!("{}: tier '{}' skipped {}", self.name, tier.name(), item.describe());
        }

        if status.is_cached() {
            for tier in remaining {
                let item = item.clone();
                self.executor.spawn_at("put", current_priority().lower(), async move {
                    if !item.put_into(tier.as_ref()).await.is_cached() {
                        debug!("Background put of {} into '{}' skipped", item.describe(), tier.name());
                    }
                });
            }
        }
        self.stats.record_put(status, 0, tracker.elapsed());
        status
    }
}

#[async_trait]
impl CacheBackend for HierarchicalBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Hierarchical
    }

    fn speed_class(&self) -> SpeedClass {
        self.tiers
            .read()
            .iter()
            .map(|t| t.speed_class())
            .max()
            .unwrap_or(SpeedClass::Unknown)
    }

    fn is_writable(&self) -> bool {
        self.tiers.read().iter().any(|t| t.is_writable())
    }

    fn is_remote(&self) -> bool {
        let tiers = self.tiers.read();
        !tiers.is_empty() && tiers.iter().all(|t| t.is_remote())
    }

    fn backfill_lower_cache_levels(&self) -> bool {
        self.tiers
            .read()
            .iter()
            .any(|t| t.backfill_lower_cache_levels())
    }

    fn usage_stats(&self) -> UsageStats {
        let children = self.tiers().iter().map(|t| t.usage_stats()).collect();
        UsageStats::leaf(
            self.name(),
            self.kind(),
            self.speed_class(),
            self.stats.snapshot(),
        )
        .with_children(children)
    }

    async fn exists(&self, key: &LegacyKey) -> bool {
        for tier in self.tiers() {
            if tier.exists(key).await {
                return true;
            }
        }
        false
    }

    async fn get(&self, key: &LegacyKey) -> Option<Bytes> {
        let tracker = LatencyTracker::start();
        let tiers = self.tiers();
        for (index, tier) in tiers.iter().enumerate() {
            if let Some(data) = tier.get(key).await {
                self.stats
                    .record_get_hit(data.len() as u64, tracker.elapsed());
                self.schedule_fill(&tiers, index, FillItem::Legacy(key.clone(), data.clone()));
                return Some(data);
            }
        }
        self.stats.record_get_miss();
        None
    }

    async fn put(&self, key: &LegacyKey, data: Bytes, put_even_if_exists: bool) -> PutStatus {
        if !put_even_if_exists {
            return self
                .put_two_phase(FillItem::Legacy(key.clone(), data))
                .await;
        }
        // Overwrites must reach every tier, so they cannot reuse fill items
        let tracker = LatencyTracker::start();
        let targets: Vec<SharedBackend> = self.tiers().into_iter().filter(|t| t.is_writable()).collect();
        let mut status = PutStatus::NotCached;
        let mut remaining = targets.into_iter();
        for tier in remaining.by_ref() {
            if tier.put(key, data.clone(), true).await.is_cached() {
                status = PutStatus::Cached;
                break;
            }
        }
        if status.is_cached() {
            for tier in remaining {
                let key = key.clone();
                let data = data.clone();
                self.executor.spawn_at("put", current_priority().lower(), async move {
                    tier.put(&key, data, true).await;
                });
            }
        }
        self.stats.record_put(status, 0, tracker.elapsed());
        status
    }

    async fn remove(&self, key: &LegacyKey, transient: bool) {
        let tiers = self.tiers();
        join_all(tiers.iter().map(|t| t.remove(key, transient))).await;
        self.stats.record_remove();
    }

    async fn get_record(&self, key: &CacheKey, policy: CachePolicy) -> Option<CacheRecord> {
        let tracker = LatencyTracker::start();
        let tiers = self.tiers();
        for (index, tier) in tiers.iter().enumerate() {
            if !policy.allows_query(tier.is_remote()) {
                continue;
            }
            if let Some(record) = tier.get_record(key, policy).await {
                self.stats
                    .record_get_hit(record.total_compressed_size(), tracker.elapsed());
                let fillable = record.is_complete()
                    && !policy.intersects(CachePolicy::SKIP_DATA | CachePolicy::SKIP_META);
                if fillable {
                    self.schedule_fill(&tiers, index, FillItem::Record(record.clone(), policy));
                }
                return Some(record);
            }
        }
        self.stats.record_get_miss();
        None
    }

    async fn put_record(&self, record: &CacheRecord, policy: CachePolicy) -> PutStatus {
        self.put_two_phase(FillItem::Record(record.clone(), policy))
            .await
    }

    async fn get_value(&self, key: &CacheKey, policy: CachePolicy) -> Option<Value> {
        let tracker = LatencyTracker::start();
        let tiers = self.tiers();
        for (index, tier) in tiers.iter().enumerate() {
            if !policy.allows_query(tier.is_remote()) {
                continue;
            }
            if let Some(value) = tier.get_value(key, policy).await {
                self.stats
                    .record_get_hit(value.compressed_size(), tracker.elapsed());
                if value.has_data() {
                    self.schedule_fill(
                        &tiers,
                        index,
                        FillItem::Value(key.clone(), value.clone(), policy),
                    );
                }
                return Some(value);
            }
        }
        self.stats.record_get_miss();
        None
    }

    async fn put_value(&self, key: &CacheKey, value: &Value, policy: CachePolicy) -> PutStatus {
        self.put_two_phase(FillItem::Value(key.clone(), value.clone(), policy))
            .await
    }

    async fn flush(&self) {
        self.executor.wait_idle().await;
        join_all(self.tiers().iter().map(|t| t.flush())).await;
        // Tier flushes may have triggered more fills
        self.executor.wait_idle().await;
    }

    async fn shutdown(&self) {
        self.flush().await;
        join_all(self.tiers().iter().map(|t| t.shutdown())).await;
    }
}

impl HierarchicalBackend {
    /// Counters of the composite itself, without children
    pub fn own_stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}

// =============================================================================
// Tests
// =============================================================================
