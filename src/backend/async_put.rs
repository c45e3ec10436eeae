//! Asynchronous Put Wrapper
//!
//! Makes puts return immediately. The data is parked in an in-flight table
//! and written to the inner backend by the background executor; until the
//! write completes, reads of the same key are answered from the table.
//!
//! ```text
//!   put ──► in-flight table ──► executor ──► inner.put ──► clear entry
//!   get ──► in-flight table ──(miss)──► inner.get
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tracing::debug;

use super::executor::BackgroundExecutor;
use super::stats::{BackendStats, LatencyTracker, UsageStats};
use super::{BackendKind, CacheBackend, PutStatus, SharedBackend, SpeedClass};
use crate::key::{CacheKey, LegacyKey};
use crate::record::{CachePolicy, CacheRecord, Value};

#[derive(Clone, PartialEq, Eq, Hash)]
enum InflightKey {
    Legacy(LegacyKey),
    Record(CacheKey),
    Value(CacheKey),
}

#[derive(Clone)]
enum InflightItem {
    /// Data and the caller's `put_even_if_exists`
    Legacy(Bytes, bool),
    Record(CacheRecord, CachePolicy),
    Value(Value, CachePolicy),
}

struct Inflight {
    generation: u64,
    item: InflightItem,
}

type InflightTable = DashMap<InflightKey, Inflight>;

/// Wrapper turning puts into background writes
pub struct AsyncPutWrapper {
    name: String,
    inner: SharedBackend,
    executor: BackgroundExecutor,
    inflight: Arc<InflightTable>,
    generation: AtomicU64,
    stats: BackendStats,
}

impl AsyncPutWrapper {
    pub fn new(name: impl Into<String>, inner: SharedBackend, executor: BackgroundExecutor) -> Self {
        Self {
            name: name.into(),
            inner,
            executor,
            inflight: Arc::new(DashMap::new()),
            generation: AtomicU64::new(0),
            stats: BackendStats::new(),
        }
    }

    /// Wrapped backend
    pub fn inner(&self) -> &SharedBackend {
        &self.inner
    }

    /// Number of puts not yet written to the inner backend
    pub fn inflight(&self) -> usize {
        self.inflight.len()
    }

    fn lookup(&self, key: &InflightKey) -> Option<InflightItem> {
        self.inflight.get(key).map(|entry| entry.value().item.clone())
    }

    /// Park `item` and schedule its write
    ///
    /// A later put of the same key replaces the entry; only the write that
    /// matches the current generation clears it.
    fn enqueue(&self, key: InflightKey, item: InflightItem, size: u64) -> PutStatus {
        let tracker = LatencyTracker::start();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        self.inflight.insert(
            key.clone(),
            Inflight {
                generation,
                item: item.clone(),
            },
        );

        let inner = Arc::clone(&self.inner);
        let inflight = Arc::clone(&self.inflight);
        self.executor.spawn("async_put", async move {
            let status = match (&key, &item) {
                (InflightKey::Legacy(key), InflightItem::Legacy(data, put_even_if_exists)) => {
                    inner.put(key, data.clone(), *put_even_if_exists).await
                }
                (InflightKey::Record(_), InflightItem::Record(record, policy)) => {
                    inner.put_record(record, *policy).await
                }
                (InflightKey::Value(key), InflightItem::Value(value, policy)) => {
                    inner.put_value(key, value, *policy).await
                }
                _ => PutStatus::NotCached,
            };
            if !status.is_cached() {
                debug!("Background put into '{}' was not cached", inner.name());
            }
            inflight.remove_if(&key, |_, entry| entry.generation == generation);
        });

        self.stats
            .record_put(PutStatus::Cached, size, tracker.elapsed());
        PutStatus::Cached
    }
}

#[async_trait]
impl CacheBackend for AsyncPutWrapper {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> BackendKind {
        BackendKind::AsyncPut
    }

    fn speed_class(&self) -> SpeedClass {
        self.inner.speed_class()
    }

    fn is_writable(&self) -> bool {
        self.inner.is_writable()
    }

    fn is_remote(&self) -> bool {
        self.inner.is_remote()
    }

    fn backfill_lower_cache_levels(&self) -> bool {
        self.inner.backfill_lower_cache_levels()
    }

    fn is_read_only_archive(&self) -> bool {
        self.inner.is_read_only_archive()
    }

    fn usage_stats(&self) -> UsageStats {
        UsageStats::leaf(
            self.name(),
            self.kind(),
            self.speed_class(),
            self.stats.snapshot(),
        )
        .with_children(vec![self.inner.usage_stats()])
    }

    async fn exists(&self, key: &LegacyKey) -> bool {
        self.inflight
            .contains_key(&InflightKey::Legacy(key.clone()))
            || self.inner.exists(key).await
    }

    async fn get(&self, key: &LegacyKey) -> Option<Bytes> {
        if let Some(InflightItem::Legacy(data, _)) = self.lookup(&InflightKey::Legacy(key.clone())) {
            return Some(data);
        }
        self.inner.get(key).await
    }

    async fn put(&self, key: &LegacyKey, data: Bytes, put_even_if_exists: bool) -> PutStatus {
        if !self.inner.is_writable() {
            return PutStatus::NotCached;
        }
        let inflight_key = InflightKey::Legacy(key.clone());
        if !put_even_if_exists && self.inflight.contains_key(&inflight_key) {
            return PutStatus::Cached;
        }
        let size = data.len() as u64;
        self.enqueue(inflight_key, InflightItem::Legacy(data, put_even_if_exists), size)
    }

    async fn remove(&self, key: &LegacyKey, transient: bool) {
        self.inflight.remove(&InflightKey::Legacy(key.clone()));
        self.inner.remove(key, transient).await;
        self.stats.record_remove();
    }

    async fn get_record(&self, key: &CacheKey, policy: CachePolicy) -> Option<CacheRecord> {
        if let Some(InflightItem::Record(record, _)) = self.lookup(&InflightKey::Record(key.clone())) {
            if policy.allows_query(self.is_remote()) {
                return Some(record.filtered(policy));
            }
        }
        self.inner.get_record(key, policy).await
    }

    async fn put_record(&self, record: &CacheRecord, policy: CachePolicy) -> PutStatus {
        if !self.inner.is_writable() || !policy.allows_store(self.is_remote()) {
            return PutStatus::NotCached;
        }
        self.enqueue(
            InflightKey::Record(record.key().clone()),
            InflightItem::Record(record.clone(), policy),
            record.total_compressed_size(),
        )
    }

    async fn get_value(&self, key: &CacheKey, policy: CachePolicy) -> Option<Value> {
        if let Some(InflightItem::Value(value, _)) = self.lookup(&InflightKey::Value(key.clone())) {
            if policy.allows_query(self.is_remote()) {
                if policy.contains(CachePolicy::SKIP_DATA) {
                    return Some(value.without_data());
                }
                return Some(value);
            }
        }
        self.inner.get_value(key, policy).await
    }

    async fn put_value(&self, key: &CacheKey, value: &Value, policy: CachePolicy) -> PutStatus {
        if !self.inner.is_writable() || !policy.allows_store(self.is_remote()) || !value.has_data() {
            return PutStatus::NotCached;
        }
        self.enqueue(
            InflightKey::Value(key.clone()),
            InflightItem::Value(value.clone(), policy),
            value.compressed_size(),
        )
    }

    async fn flush(&self) {
        self.executor.wait_idle().await;
        self.inner.flush().await;
    }

    async fn shutdown(&self) {
        self.flush().await;
        self.inner.shutdown().await;
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryCacheStore;
    use crate::backend::ThrottleWrapper;
    use std::time::Duration;

    fn wrap(inner: SharedBackend) -> AsyncPutWrapper {
        AsyncPutWrapper::new("async", inner, BackgroundExecutor::new())
    }

    #[tokio::test]
    async fn test_put_is_visible_before_write_completes() {
        let memory = Arc::new(MemoryCacheStore::new("mem"));
        let slow: SharedBackend = Arc::new(ThrottleWrapper::new(
            "slow",
            memory.clone(),
            Duration::from_millis(200),
            0,
        ));
        let wrapper = wrap(slow);

        let key = LegacyKey::from("Pending");
        assert!(wrapper.put(&key, Bytes::from_static(b"data"), false).await.is_cached());
        assert_eq!(wrapper.inflight(), 1);
        assert!(wrapper.exists(&key).await);
        assert_eq!(wrapper.get(&key).await.unwrap().as_ref(), b"data");
        assert!(!memory.exists(&key).await);

        wrapper.flush().await;
        assert_eq!(wrapper.inflight(), 0);
        assert!(memory.exists(&key).await);
    }

    #[tokio::test]
    async fn test_background_write_keeps_overwrite_flag() {
        let memory = Arc::new(MemoryCacheStore::new("mem"));
        let key = LegacyKey::from("Existing");
        memory.put(&key, Bytes::from_static(b"original"), false).await;
        let wrapper = wrap(memory.clone());

        assert!(wrapper.put(&key, Bytes::from_static(b"ignored"), false).await.is_cached());
        wrapper.flush().await;
        assert_eq!(memory.get(&key).await.unwrap().as_ref(), b"original");

        assert!(wrapper.put(&key, Bytes::from_static(b"replaced"), true).await.is_cached());
        wrapper.flush().await;
        assert_eq!(memory.get(&key).await.unwrap().as_ref(), b"replaced");
    }

    #[tokio::test]
    async fn test_records_and_values_land_in_inner() {
        let memory = Arc::new(MemoryCacheStore::new("mem"));
        let wrapper = wrap(memory.clone());

        let record = CacheRecord::builder(CacheKey::from_content("Async", b"r").unwrap())
            .value(Value::from_raw(b"payload"))
            .build();
        let value_key = CacheKey::from_content("Async", b"v").unwrap();
        let value = Value::from_raw(b"value payload");

        assert!(wrapper.put_record(&record, CachePolicy::DEFAULT).await.is_cached());
        assert!(wrapper.put_value(&value_key, &value, CachePolicy::DEFAULT).await.is_cached());
        wrapper.flush().await;

        assert_eq!(memory.get_record(record.key(), CachePolicy::DEFAULT).await.unwrap(), record);
        assert_eq!(memory.get_value(&value_key, CachePolicy::DEFAULT).await.unwrap(), value);
    }

    #[tokio::test]
    async fn test_refuses_when_inner_read_only() {
        let memory = Arc::new(MemoryCacheStore::new("mem"));
        memory.shutdown().await;
        let wrapper = wrap(memory);
        let status = wrapper
            .put(&LegacyKey::from("X"), Bytes::from_static(b"x"), false)
            .await;
        assert_eq!(status, PutStatus::NotCached);
    }

    #[tokio::test]
    async fn test_policy_without_store_is_refused() {
        let wrapper = wrap(Arc::new(MemoryCacheStore::new("mem")));
        let key = CacheKey::from_content("Async", b"q").unwrap();
        let status = wrapper
            .put_value(&key, &Value::from_raw(b"q"), CachePolicy::QUERY)
            .await;
        assert_eq!(status, PutStatus::NotCached);
    }
}
