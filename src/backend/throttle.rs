//! Throttle Wrapper
//!
//! Simulates a slower store in front of any backend: a fixed latency before
//! every request and an aggregate bandwidth cap shared by all requests.
//!
//! The cap is a single transfer slot. A request of `B` bytes occupies it for
//! `B / max_bytes_per_sec`, starting when the slot is next free or now,
//! whichever is later. Idle time does not accumulate credit.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::time::Instant;

use super::stats::{BackendStats, UsageStats};
use super::{BackendKind, CacheBackend, PutStatus, SharedBackend, SpeedClass};
use crate::key::{CacheKey, LegacyKey};
use crate::record::{CachePolicy, CacheRecord, Value};

/// Latency and bandwidth limiter
pub struct ThrottleWrapper {
    name: String,
    inner: SharedBackend,
    latency: Duration,
    max_bytes_per_sec: u64,
    /// End of the last scheduled transfer
    next_free: Mutex<Option<Instant>>,
    stats: BackendStats,
}

impl ThrottleWrapper {
    /// Wrap `inner`; a zero latency or bandwidth disables that limit
    pub fn new(
        name: impl Into<String>,
        inner: SharedBackend,
        latency: Duration,
        max_bytes_per_sec: u64,
    ) -> Self {
        Self {
            name: name.into(),
            inner,
            latency,
            max_bytes_per_sec,
            next_free: Mutex::new(None),
            stats: BackendStats::new(),
        }
    }

    pub fn latency(&self) -> Duration {
        self.latency
    }

    pub fn max_bytes_per_sec(&self) -> u64 {
        self.max_bytes_per_sec
    }

    /// Apply the fixed latency
    async fn before(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }

    /// Reserve the transfer slot for `bytes` and wait until it ends
    async fn after(&self, bytes: u64) {
        if self.max_bytes_per_sec == 0 || bytes == 0 {
            return;
        }
        let transfer = Duration::from_secs_f64(bytes as f64 / self.max_bytes_per_sec as f64);
        let deadline = {
            let now = Instant::now();
            let mut next_free = self.next_free.lock();
            let start = next_free.map_or(now, |free| free.max(now));
            let end = start + transfer;
            *next_free = Some(end);
            end
        };
        tokio::time::sleep_until(deadline).await;
    }
}

#[async_trait]
impl CacheBackend for ThrottleWrapper {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Throttle
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
        self.before().await;
        self.inner.exists(key).await
    }

    async fn get(&self, key: &LegacyKey) -> Option<Bytes> {
        self.before().await;
        let data = self.inner.get(key).await;
        self.after(data.as_ref().map_or(0, |d| d.len() as u64)).await;
        data
    }

    async fn put(&self, key: &LegacyKey, data: Bytes, put_even_if_exists: bool) -> PutStatus {
        self.before().await;
        let size = data.len() as u64;
        let status = self.inner.put(key, data, put_even_if_exists).await;
        self.after(size).await;
        status
    }

    async fn remove(&self, key: &LegacyKey, transient: bool) {
        self.before().await;
        self.inner.remove(key, transient).await;
    }

    async fn get_record(&self, key: &CacheKey, policy: CachePolicy) -> Option<CacheRecord> {
        self.before().await;
        let record = self.inner.get_record(key, policy).await;
        self.after(record.as_ref().map_or(0, |r| r.total_compressed_size()))
            .await;
        record
    }

    async fn put_record(&self, record: &CacheRecord, policy: CachePolicy) -> PutStatus {
        self.before().await;
        let status = self.inner.put_record(record, policy).await;
        self.after(record.total_compressed_size()).await;
        status
    }

    async fn get_value(&self, key: &CacheKey, policy: CachePolicy) -> Option<Value> {
        self.before().await;
        let value = self.inner.get_value(key, policy).await;
        self.after(value.as_ref().map_or(0, |v| v.compressed_size()))
            .await;
        value
    }

    async fn put_value(&self, key: &CacheKey, value: &Value, policy: CachePolicy) -> PutStatus {
        self.before().await;
        let status = self.inner.put_value(key, value, policy).await;
        self.after(value.compressed_size()).await;
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
    async fn test_latency_applies_to_every_request() {
        let throttle = ThrottleWrapper::new(
            "throttle",
            Arc::new(MemoryCacheStore::new("mem")),
            Duration::from_millis(50),
            0,
        );
        let start = std::time::Instant::now();
        throttle.exists(&LegacyKey::from("a")).await;
        throttle.get(&LegacyKey::from("a")).await;
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_bandwidth_cap_is_aggregate() {
        let throttle = Arc::new(ThrottleWrapper::new(
            "throttle",
            Arc::new(MemoryCacheStore::new("mem")),
            Duration::ZERO,
            1_000_000,
        ));

        let start = std::time::Instant::now();
        let tasks: Vec<_> = (0..10)
            .map(|i| {
                let throttle = Arc::clone(&throttle);
                tokio::spawn(async move {
                    let key = LegacyKey::new(format!("Key{}", i));
                    throttle.put(&key, Bytes::from(vec![i as u8; 100 * 1024]), false).await
                })
            })
            .collect();
        for task in tasks {
            assert!(task.await.unwrap().is_cached());
        }
        // 1 024 000 bytes at 1 000 000 B/s
        assert!(start.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_idle_time_does_not_build_credit() {
        let throttle = Arc::new(ThrottleWrapper::new(
            "throttle",
            Arc::new(MemoryCacheStore::new("mem")),
            Duration::ZERO,
            1_000_000,
        ));
        throttle
            .put(&LegacyKey::from("Warmup"), Bytes::from_static(b"x"), false)
            .await;
        tokio::time::sleep(Duration::from_secs(2)).await;

        let start = std::time::Instant::now();
        let tasks: Vec<_> = (0..10)
            .map(|i| {
                let throttle = Arc::clone(&throttle);
                tokio::spawn(async move {
                    let key = LegacyKey::new(format!("Burst{}", i));
                    throttle.put(&key, Bytes::from(vec![0u8; 100_000]), false).await
                })
            })
            .collect();
        for task in tasks {
            assert!(task.await.unwrap().is_cached());
        }
        assert!(start.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_unlimited_is_passthrough() {
        let throttle = ThrottleWrapper::new(
            "throttle",
            Arc::new(MemoryCacheStore::new("mem")),
            Duration::ZERO,
            0,
        );
        let key = LegacyKey::from("fast");
        throttle.put(&key, Bytes::from_static(b"x"), false).await;
        assert_eq!(throttle.get(&key).await.unwrap().as_ref(), b"x");
    }
}
