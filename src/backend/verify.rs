//! Verify Wrapper
//!
//! Checks that what the inner backend stores is what was produced. The
//! first put of every key is read back and compared; a mismatch is logged
//! and, with `fix` enabled, overwritten with the new data.
//!
//! Until a key has been verified, reads of it report a miss so the caller
//! regenerates the data and the put path gets to compare it.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashSet;
use tracing::{debug, warn};

use super::stats::{BackendStats, UsageStats};
use super::{BackendKind, CacheBackend, PutStatus, SharedBackend, SpeedClass};
use crate::key::{CacheKey, LegacyKey};
use crate::record::{CachePolicy, CacheRecord, Value};

#[derive(Clone, PartialEq, Eq, Hash)]
enum VerifyKey {
    Legacy(LegacyKey),
    Record(CacheKey),
    Value(CacheKey),
}

/// Round-trip verifying wrapper
pub struct VerifyWrapper {
    name: String,
    inner: SharedBackend,
    fix: bool,
    verified: DashSet<VerifyKey>,
    mismatches: AtomicU64,
    stats: BackendStats,
}

impl VerifyWrapper {
    pub fn new(name: impl Into<String>, inner: SharedBackend, fix: bool) -> Self {
        Self {
            name: name.into(),
            inner,
            fix,
            verified: DashSet::new(),
            mismatches: AtomicU64::new(0),
            stats: BackendStats::new(),
        }
    }

    /// Number of puts whose stored data differed from the new data
    pub fn mismatches(&self) -> u64 {
        self.mismatches.load(Ordering::Relaxed)
    }

    /// Keys verified so far
    pub fn verified_count(&self) -> usize {
        self.verified.len()
    }

    /// Record a mismatch; returns whether the caller should repair it
    fn report_mismatch(&self, what: &str) -> bool {
        self.mismatches.fetch_add(1, Ordering::Relaxed);
        self.stats.record_corruption();
        if self.fix {
            warn!("{}: stored data for {} differs from new data, overwriting", self.name, what);
        } else {
            warn!("{}: stored data for {} differs from new data", self.name, what);
        }
        self.fix
    }
}

#[async_trait]
impl CacheBackend for VerifyWrapper {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Verify
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
        self.verified.contains(&VerifyKey::Legacy(key.clone())) && self.inner.exists(key).await
    }

    async fn get(&self, key: &LegacyKey) -> Option<Bytes> {
        if !self.verified.contains(&VerifyKey::Legacy(key.clone())) {
            debug!("{}: {} not verified yet, reporting a miss", self.name, key);
            self.stats.record_get_miss();
            return None;
        }
        self.inner.get(key).await
    }

    async fn put(&self, key: &LegacyKey, data: Bytes, put_even_if_exists: bool) -> PutStatus {
        if !self.verified.insert(VerifyKey::Legacy(key.clone())) {
            return self.inner.put(key, data, put_even_if_exists).await;
        }

        let mut status = self
            .inner
            .put(key, data.clone(), put_even_if_exists)
            .await;
        match self.inner.get(key).await {
            Some(stored) if stored == data => debug!("{}: verified {}", self.name, key),
            Some(_) => {
                if self.report_mismatch(key.as_str()) {
                    status = self.inner.put(key, data, true).await;
                }
            }
            None => debug!("{}: {} not readable after put", self.name, key),
        }
        status
    }

    async fn remove(&self, key: &LegacyKey, transient: bool) {
        self.inner.remove(key, transient).await;
    }

    async fn get_record(&self, key: &CacheKey, policy: CachePolicy) -> Option<CacheRecord> {
        if !self.verified.contains(&VerifyKey::Record(key.clone())) {
            self.stats.record_get_miss();
            return None;
        }
        self.inner.get_record(key, policy).await
    }

    async fn put_record(&self, record: &CacheRecord, policy: CachePolicy) -> PutStatus {
        if !self.verified.insert(VerifyKey::Record(record.key().clone())) {
            return self.inner.put_record(record, policy).await;
        }

        let mut status = self.inner.put_record(record, policy).await;
        let read_policy = (policy & !CachePolicy::SKIP_DATA & !CachePolicy::SKIP_META) | CachePolicy::QUERY;
        match self.inner.get_record(record.key(), read_policy).await {
            Some(stored) if stored == *record => debug!("{}: verified {}", self.name, record.key()),
            Some(_) => {
                if self.report_mismatch(&record.key().to_string()) {
                    // Records are replaced wholesale, so a plain put overwrites
                    status = self.inner.put_record(record, policy).await;
                }
            }
            None => debug!("{}: {} not readable after put", self.name, record.key()),
        }
        status
    }

    async fn get_value(&self, key: &CacheKey, policy: CachePolicy) -> Option<Value> {
        if !self.verified.contains(&VerifyKey::Value(key.clone())) {
            self.stats.record_get_miss();
            return None;
        }
        self.inner.get_value(key, policy).await
    }

    async fn put_value(&self, key: &CacheKey, value: &Value, policy: CachePolicy) -> PutStatus {
        if !self.verified.insert(VerifyKey::Value(key.clone())) {
            return self.inner.put_value(key, value, policy).await;
        }

        let mut status = self.inner.put_value(key, value, policy).await;
        let read_policy = (policy & !CachePolicy::SKIP_DATA) | CachePolicy::QUERY;
        match self.inner.get_value(key, read_policy).await {
            Some(stored) if stored.raw_hash() == value.raw_hash() => {
                debug!("{}: verified {}", self.name, key)
            }
            Some(_) => {
                if self.report_mismatch(&key.to_string()) {
                    status = self.inner.put_value(key, value, policy).await;
                }
            }
            None => debug!("{}: {} not readable after put", self.name, key),
        }
        status
    }

    async fn flush(&self) {
        self.inner.flush().await;
    }

    async fn shutdown(&self) {
        self.inner.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryCacheStore;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_unverified_reads_miss() {
        let memory = Arc::new(MemoryCacheStore::new("mem"));
        let key = LegacyKey::from("Seeded");
        memory.put(&key, Bytes::from_static(b"old"), false).await;

        let verify = VerifyWrapper::new("verify", memory, false);
        assert!(verify.get(&key).await.is_none());
        assert!(!verify.exists(&key).await);
    }

    #[tokio::test]
    async fn test_matching_data_verifies() {
        let verify = VerifyWrapper::new("verify", Arc::new(MemoryCacheStore::new("mem")), false);
        let key = LegacyKey::from("Fresh");

        assert!(verify.put(&key, Bytes::from_static(b"abc"), false).await.is_cached());
        assert_eq!(verify.mismatches(), 0);
        assert_eq!(verify.verified_count(), 1);
        assert_eq!(verify.get(&key).await.unwrap().as_ref(), b"abc");
    }

    #[tokio::test]
    async fn test_mismatch_is_reported_and_fixed() {
        let memory = Arc::new(MemoryCacheStore::new("mem"));
        let key = LegacyKey::from("Stale");
        memory.put(&key, Bytes::from_static(b"stale"), false).await;

        let verify = VerifyWrapper::new("verify", memory.clone(), true);
        verify.put(&key, Bytes::from_static(b"fresh"), false).await;
        assert_eq!(verify.mismatches(), 1);
        assert_eq!(memory.get(&key).await.unwrap().as_ref(), b"fresh");

        // Already verified: no second comparison
        verify.put(&key, Bytes::from_static(b"other"), false).await;
        assert_eq!(verify.mismatches(), 1);
    }

    #[tokio::test]
    async fn test_mismatch_without_fix_keeps_stored_data() {
        let memory = Arc::new(MemoryCacheStore::new("mem"));
        let key = LegacyKey::from("Stale");
        memory.put(&key, Bytes::from_static(b"stale"), false).await;

        let verify = VerifyWrapper::new("verify", memory.clone(), false);
        verify.put(&key, Bytes::from_static(b"fresh"), false).await;
        assert_eq!(verify.mismatches(), 1);
        assert_eq!(memory.get(&key).await.unwrap().as_ref(), b"stale");
    }

    #[tokio::test]
    async fn test_value_verification() {
        let verify = VerifyWrapper::new("verify", Arc::new(MemoryCacheStore::new("mem")), false);
        let key = CacheKey::from_content("Verify", b"v").unwrap();
        let value = Value::from_raw(b"value bytes");

        assert!(verify.get_value(&key, CachePolicy::DEFAULT).await.is_none());
        assert!(verify.put_value(&key, &value, CachePolicy::DEFAULT).await.is_cached());
        assert_eq!(verify.mismatches(), 0);
        assert_eq!(verify.get_value(&key, CachePolicy::DEFAULT).await.unwrap(), value);
    }
}
