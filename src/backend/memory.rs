//! Memory Cache Store
//!
//! In-process tier holding legacy blobs, records and values in sharded maps
//! under a byte budget. A put that would exceed the budget is refused rather
//! than evicting, so the tier fills with the first items of a session.
//!
//! The boot variant persists its contents to a snapshot file on shutdown and
//! reloads it on the next start.

use std::hash::Hash;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::stats::{BackendStats, LatencyTracker, UsageStats};
use super::trailer::{self, TrailerKind};
use super::{BackendKind, CacheBackend, PutStatus, SpeedClass};
use crate::error::{Error, Result};
use crate::key::{CacheKey, LegacyKey};
use crate::record::package::{self, Placement};
use crate::record::{CachePolicy, CacheRecord, Value};

const SNAPSHOT_VERSION: u32 = 1;
const RECORD_OVERHEAD: u64 = 64;
const VALUE_OVERHEAD: u64 = 32;

/// Memory store configuration
#[derive(Debug, Clone)]
pub struct MemoryCacheConfig {
    /// Node name
    pub name: String,
    /// Byte budget, zero for unlimited
    pub max_cache_size: u64,
    /// Snapshot file of the boot variant
    pub boot_filename: Option<PathBuf>,
    /// Hits may be cascaded to slower tiers
    pub backfill_lower_cache_levels: bool,
}

impl Default for MemoryCacheConfig {
    fn default() -> Self {
        Self {
            name: "Memory".to_string(),
            max_cache_size: 0,
            boot_filename: None,
            backfill_lower_cache_levels: true,
        }
    }
}

/// In-memory store
pub struct MemoryCacheStore {
    config: MemoryCacheConfig,
    legacy: DashMap<LegacyKey, Bytes>,
    records: DashMap<CacheKey, CacheRecord>,
    values: DashMap<CacheKey, Value>,
    current_size: AtomicU64,
    budget_warned: AtomicBool,
    shut_down: AtomicBool,
    stats: BackendStats,
}

impl MemoryCacheStore {
    /// Create an unbounded store
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_config(MemoryCacheConfig {
            name: name.into(),
            ..Default::default()
        })
    }

    /// Create with custom config
    pub fn with_config(config: MemoryCacheConfig) -> Self {
        Self {
            config,
            legacy: DashMap::new(),
            records: DashMap::new(),
            values: DashMap::new(),
            current_size: AtomicU64::new(0),
            budget_warned: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
            stats: BackendStats::new(),
        }
    }

    /// Create a boot store and load its snapshot if one exists
    pub async fn open_boot(config: MemoryCacheConfig) -> Self {
        let store = Self::with_config(config);
        if let Err(e) = store.load_snapshot().await {
            if e.is_not_found() {
                debug!("{}: no boot snapshot yet", store.config.name);
            } else {
                warn!("{}: ignoring unreadable boot snapshot: {}", store.config.name, e);
            }
        }
        store
    }

    /// Bytes currently accounted against the budget
    pub fn current_size(&self) -> u64 {
        self.current_size.load(Ordering::Relaxed)
    }

    /// Number of stored items of every kind
    pub fn len(&self) -> usize {
        self.legacy.len() + self.records.len() + self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reserve `size` bytes against the budget
    fn reserve(&self, size: u64) -> bool {
        let max = self.config.max_cache_size;
        let reserved = self
            .current_size
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                let next = current + size;
                (max == 0 || next <= max).then_some(next)
            })
            .is_ok();
        if !reserved && !self.budget_warned.swap(true, Ordering::Relaxed) {
            warn!(
                "{}: memory cache is full ({} of {} bytes), further puts are refused",
                self.config.name,
                self.current_size(),
                max
            );
        }
        reserved
    }

    fn release(&self, size: u64) {
        let _ = self
            .current_size
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_sub(size))
            });
    }

    /// Insert `item` accounting `size` bytes; a replaced item only charges
    /// the difference
    fn store_sized<K, V>(
        &self,
        map: &DashMap<K, V>,
        key: K,
        item: V,
        size: u64,
        size_of: impl Fn(&V) -> u64,
    ) -> bool
    where
        K: Eq + Hash,
    {
        match map.entry(key) {
            Entry::Occupied(mut entry) => {
                let old = size_of(entry.get());
                if size > old && !self.reserve(size - old) {
                    return false;
                }
                entry.insert(item);
                if old > size {
                    self.release(old - size);
                }
                true
            }
            Entry::Vacant(entry) => {
                if !self.reserve(size) {
                    return false;
                }
                entry.insert(item);
                true
            }
        }
    }

    fn accepts_writes(&self) -> bool {
        !self.shut_down.load(Ordering::Acquire)
    }

    fn record_size(record: &CacheRecord) -> u64 {
        record.total_compressed_size() + RECORD_OVERHEAD
    }

    fn value_size(value: &Value) -> u64 {
        value.compressed_size() + VALUE_OVERHEAD
    }

    // =========================================================================
    // Boot snapshot
    // =========================================================================

    /// Write every entry to the boot snapshot file
    pub async fn save_snapshot(&self) -> Result<()> {
        let Some(path) = self.config.boot_filename.clone() else {
            return Ok(());
        };

        let mut snapshot = BootSnapshot {
            version: SNAPSHOT_VERSION,
            ..Default::default()
        };
        for entry in self.legacy.iter() {
            snapshot.legacy.push(BootEntry {
                key: entry.key().as_str().to_string(),
                data: hex::encode(entry.value()),
            });
        }
        for entry in self.records.iter() {
            let placements = vec![Placement::Inline; entry.value().values().count()];
            let encoded = package::encode_record(entry.value(), &placements)?;
            snapshot.records.push(hex::encode(encoded));
        }
        for entry in self.values.iter() {
            snapshot.values.push(BootEntry {
                key: entry.key().to_string(),
                data: hex::encode(package::encode_value(entry.value(), Placement::Inline)),
            });
        }

        let json = serde_json::to_vec(&snapshot)
            .map_err(|e| Error::Internal(format!("failed to encode boot snapshot: {}", e)))?;
        let sealed = trailer::seal(&json, TrailerKind::Hash);

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let temp = path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4()));
        tokio::fs::write(&temp, &sealed).await?;
        if let Err(e) = tokio::fs::rename(&temp, &path).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(e.into());
        }
        info!(
            "{}: saved boot snapshot with {} entries to {}",
            self.config.name,
            self.len(),
            path.display()
        );
        Ok(())
    }

    /// Load entries from the boot snapshot file
    pub async fn load_snapshot(&self) -> Result<()> {
        let Some(path) = self.config.boot_filename.as_ref() else {
            return Ok(());
        };
        let data = Bytes::from(tokio::fs::read(path).await?);
        let json = trailer::open(data, TrailerKind::Hash)?;
        let snapshot: BootSnapshot = serde_json::from_slice(&json)
            .map_err(|e| Error::corruption("boot snapshot", e.to_string()))?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(Error::corruption(
                "boot snapshot",
                format!("unsupported version {}", snapshot.version),
            ));
        }

        let decode_hex =
            |s: &str| hex::decode(s).map_err(|e| Error::corruption("boot snapshot", e.to_string()));

        for entry in &snapshot.legacy {
            let data = Bytes::from(decode_hex(&entry.data)?);
            if self.reserve(data.len() as u64 + entry.key.len() as u64) {
                self.legacy.insert(LegacyKey::new(entry.key.clone()), data);
            }
        }
        for encoded in &snapshot.records {
            let decoded = package::decode_record(Bytes::from(decode_hex(encoded)?))?;
            if self.reserve(Self::record_size(&decoded.record)) {
                self.records
                    .insert(decoded.record.key().clone(), decoded.record);
            }
        }
        for entry in &snapshot.values {
            let key: CacheKey = entry
                .key
                .parse()
                .map_err(|e: Error| Error::corruption("boot snapshot", e.to_string()))?;
            let (value, _) = package::decode_value(Bytes::from(decode_hex(&entry.data)?))?;
            if self.reserve(Self::value_size(&value)) {
                self.values.insert(key, value);
            }
        }

        info!(
            "{}: loaded {} entries from boot snapshot {}",
            self.config.name,
            self.len(),
            path.display()
        );
        Ok(())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct BootSnapshot {
    version: u32,
    legacy: Vec<BootEntry>,
    records: Vec<String>,
    values: Vec<BootEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct BootEntry {
    key: String,
    data: String,
}

#[async_trait]
impl CacheBackend for MemoryCacheStore {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Memory
    }

    fn speed_class(&self) -> SpeedClass {
        SpeedClass::Local
    }

    fn is_writable(&self) -> bool {
        self.accepts_writes()
    }

    fn backfill_lower_cache_levels(&self) -> bool {
        self.config.backfill_lower_cache_levels
    }

    fn usage_stats(&self) -> UsageStats {
        UsageStats::leaf(
            self.name(),
            self.kind(),
            self.speed_class(),
            self.stats.snapshot(),
        )
    }

    async fn exists(&self, key: &LegacyKey) -> bool {
        self.legacy.contains_key(key)
    }

    async fn get(&self, key: &LegacyKey) -> Option<Bytes> {
        let tracker = LatencyTracker::start();
        match self.legacy.get(key) {
            Some(data) => {
                self.stats
                    .record_get_hit(data.len() as u64, tracker.elapsed());
                Some(data.value().clone())
            }
            None => {
                self.stats.record_get_miss();
                None
            }
        }
    }

    async fn put(&self, key: &LegacyKey, data: Bytes, put_even_if_exists: bool) -> PutStatus {
        let tracker = LatencyTracker::start();
        let bytes = data.len() as u64;
        let status = if !self.accepts_writes() {
            PutStatus::NotCached
        } else if !put_even_if_exists && self.legacy.contains_key(key) {
            PutStatus::Cached
        } else if self.store_sized(&self.legacy, key.clone(), data, bytes + key.len() as u64, |old| {
            old.len() as u64 + key.len() as u64
        }) {
            PutStatus::Cached
        } else {
            PutStatus::NotCached
        };
        self.stats.record_put(status, bytes, tracker.elapsed());
        status
    }

    async fn remove(&self, key: &LegacyKey, _transient: bool) {
        if let Some((_, old)) = self.legacy.remove(key) {
            self.release(old.len() as u64 + key.len() as u64);
            self.stats.record_remove();
        }
    }

    async fn get_record(&self, key: &CacheKey, policy: CachePolicy) -> Option<CacheRecord> {
        if !policy.allows_query(self.is_remote()) {
            return None;
        }
        let tracker = LatencyTracker::start();
        let found = self.records.get(key).map(|r| r.value().clone());
        match found {
            Some(record)
                if record.is_complete()
                    || policy.intersects(CachePolicy::SKIP_DATA | CachePolicy::PARTIAL_RECORD) =>
            {
                let record = record.filtered(policy);
                self.stats
                    .record_get_hit(record.total_compressed_size(), tracker.elapsed());
                Some(record)
            }
            _ => {
                self.stats.record_get_miss();
                None
            }
        }
    }

    async fn put_record(&self, record: &CacheRecord, policy: CachePolicy) -> PutStatus {
        if !policy.allows_store(self.is_remote()) || !self.accepts_writes() {
            return PutStatus::NotCached;
        }
        let tracker = LatencyTracker::start();
        let size = Self::record_size(record);
        let status = if self.store_sized(
            &self.records,
            record.key().clone(),
            record.clone(),
            size,
            Self::record_size,
        ) {
            PutStatus::Cached
        } else {
            PutStatus::NotCached
        };
        self.stats.record_put(status, size, tracker.elapsed());
        status
    }

    async fn get_value(&self, key: &CacheKey, policy: CachePolicy) -> Option<Value> {
        if !policy.allows_query(self.is_remote()) {
            return None;
        }
        let tracker = LatencyTracker::start();
        let found = self.values.get(key).map(|v| v.value().clone());
        match found {
            Some(value) if value.has_data() || policy.contains(CachePolicy::SKIP_DATA) => {
                self.stats
                    .record_get_hit(value.compressed_size(), tracker.elapsed());
                if policy.contains(CachePolicy::SKIP_DATA) {
                    Some(value.without_data())
                } else {
                    Some(value)
                }
            }
            _ => {
                self.stats.record_get_miss();
                None
            }
        }
    }

    async fn put_value(&self, key: &CacheKey, value: &Value, policy: CachePolicy) -> PutStatus {
        if !policy.allows_store(self.is_remote()) || !self.accepts_writes() {
            return PutStatus::NotCached;
        }
        let tracker = LatencyTracker::start();
        let size = Self::value_size(value);
        let status = if self.store_sized(
            &self.values,
            key.clone(),
            value.clone(),
            size,
            Self::value_size,
        ) {
            PutStatus::Cached
        } else {
            PutStatus::NotCached
        };
        self.stats.record_put(status, size, tracker.elapsed());
        status
    }

    async fn shutdown(&self) {
        self.shut_down.store(true, Ordering::Release);
        if let Err(e) = self.save_snapshot().await {
            warn!("{}: failed to save boot snapshot: {}", self.config.name, e);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::ValueId;

    fn make_key(name: &str) -> CacheKey {
        CacheKey::from_content("Mem", name.as_bytes()).unwrap()
    }

    #[tokio::test]
    async fn test_legacy_round_trip() {
        let store = MemoryCacheStore::new("mem");
        let key = LegacyKey::from("A");
        assert!(!store.exists(&key).await);
        assert_eq!(
            store.put(&key, Bytes::from_static(&[1, 2, 3]), false).await,
            PutStatus::Cached
        );
        assert!(store.exists(&key).await);
        assert_eq!(store.get(&key).await.unwrap().as_ref(), &[1, 2, 3]);

        store.remove(&key, true).await;
        assert!(!store.exists(&key).await);
        assert_eq!(store.current_size(), 0);
    }

    #[tokio::test]
    async fn test_budget_refuses_puts() {
        let store = MemoryCacheStore::with_config(MemoryCacheConfig {
            max_cache_size: 1024,
            ..Default::default()
        });
        let big = Bytes::from(vec![0u8; 800]);
        assert!(store.put(&"a".into(), big.clone(), false).await.is_cached());
        assert_eq!(store.put(&"b".into(), big, false).await, PutStatus::NotCached);
        assert!(store.current_size() <= 1024);
        assert!(!store.exists(&"b".into()).await);
    }

    #[tokio::test]
    async fn test_replace_updates_size() {
        let store = MemoryCacheStore::new("mem");
        let key = LegacyKey::from("k");
        store.put(&key, Bytes::from(vec![0u8; 100]), false).await;
        // Existing data wins unless overwriting is requested
        store.put(&key, Bytes::from(vec![0u8; 10]), false).await;
        assert_eq!(store.get(&key).await.unwrap().len(), 100);
        store.put(&key, Bytes::from(vec![0u8; 10]), true).await;
        assert_eq!(store.current_size(), 10 + key.len() as u64);
    }

    #[tokio::test]
    async fn test_overwrite_near_budget() {
        let store = MemoryCacheStore::with_config(MemoryCacheConfig {
            max_cache_size: 1024,
            ..Default::default()
        });
        let key = LegacyKey::from("k");
        assert!(store.put(&key, Bytes::from(vec![1u8; 900]), false).await.is_cached());

        // Same size fits because the old entry's bytes are reused
        assert!(store.put(&key, Bytes::from(vec![2u8; 900]), true).await.is_cached());
        assert_eq!(store.get(&key).await.unwrap()[0], 2);
        assert_eq!(store.current_size(), 900 + key.len() as u64);

        // Growing past the budget is still refused and keeps the old data
        assert_eq!(
            store.put(&key, Bytes::from(vec![3u8; 1100]), true).await,
            PutStatus::NotCached
        );
        assert_eq!(store.get(&key).await.unwrap()[0], 2);

        assert!(store.put(&key, Bytes::from(vec![4u8; 100]), true).await.is_cached());
        assert_eq!(store.current_size(), 100 + key.len() as u64);
    }

    #[tokio::test]
    async fn test_record_policy() {
        let store = MemoryCacheStore::new("mem");
        let record = CacheRecord::builder(make_key("r"))
            .value(Value::from_raw(b"payload"))
            .meta(serde_json::json!({"v": 1}))
            .build();

        assert_eq!(
            store.put_record(&record, CachePolicy::QUERY).await,
            PutStatus::NotCached
        );
        assert!(store.put_record(&record, CachePolicy::DEFAULT).await.is_cached());

        assert!(store
            .get_record(record.key(), CachePolicy::STORE)
            .await
            .is_none());
        let full = store
            .get_record(record.key(), CachePolicy::DEFAULT)
            .await
            .unwrap();
        assert_eq!(full, record);

        let skipped = store
            .get_record(record.key(), CachePolicy::DEFAULT | CachePolicy::SKIP_DATA)
            .await
            .unwrap();
        assert!(!skipped.value().unwrap().has_data());
    }

    #[tokio::test]
    async fn test_incomplete_record_requires_partial() {
        let store = MemoryCacheStore::new("mem");
        let record = CacheRecord::builder(make_key("partial"))
            .attachment(ValueId::from_name("x"), Value::from_raw(b"x").without_data())
            .unwrap()
            .build();
        store.put_record(&record, CachePolicy::DEFAULT).await;
        assert!(store
            .get_record(record.key(), CachePolicy::DEFAULT)
            .await
            .is_none());
        assert!(store
            .get_record(record.key(), CachePolicy::DEFAULT | CachePolicy::PARTIAL_RECORD)
            .await
            .is_some());
    }

    #[tokio::test]
    async fn test_boot_snapshot_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let config = MemoryCacheConfig {
            name: "boot".into(),
            boot_filename: Some(dir.path().join("boot.ddc")),
            ..Default::default()
        };

        let key = make_key("value");
        let value = Value::from_raw(b"value data");
        {
            let store = MemoryCacheStore::open_boot(config.clone()).await;
            store.put(&"legacy".into(), Bytes::from_static(b"abc"), false).await;
            store.put_value(&key, &value, CachePolicy::DEFAULT).await;
            store.shutdown().await;
            assert!(!store.is_writable());
        }

        let store = MemoryCacheStore::open_boot(config).await;
        assert_eq!(store.get(&"legacy".into()).await.unwrap().as_ref(), b"abc");
        assert_eq!(
            store.get_value(&key, CachePolicy::DEFAULT).await.unwrap(),
            value
        );
    }

    #[tokio::test]
    async fn test_corrupt_boot_snapshot_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("boot.ddc");
        std::fs::write(&path, b"not a snapshot").unwrap();
        let store = MemoryCacheStore::open_boot(MemoryCacheConfig {
            boot_filename: Some(path),
            ..Default::default()
        })
        .await;
        assert!(store.is_empty());
    }
}
