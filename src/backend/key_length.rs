//! Key Length Limiting Wrapper
//!
//! Legacy keys whose sanitized form is longer than the limit are replaced by
//! `<prefix>__<hash of full key>`. Since different keys may share a short
//! form, the full key is appended to the stored payload:
//!
//! ```text
//! +----------------+------------------+-------------------+
//! | payload        | full key (UTF-8) | key length (u32)  |
//! +----------------+------------------+-------------------+
//! ```
//!
//! A read whose tail does not name the requested key is treated as
//! corruption: the entry is removed and the read misses. Keys within the
//! limit, records and values pass through unchanged.

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use tracing::warn;

use super::stats::{BackendStats, UsageStats};
use super::{BackendKind, CacheBackend, PutStatus, SharedBackend, SpeedClass};
use crate::error::{Error, Result};
use crate::key::{CacheKey, IoHash, LegacyKey};
use crate::record::{CachePolicy, CacheRecord, Value};

/// Default sanitized key length limit
pub const DEFAULT_MAX_KEY_LENGTH: usize = 120;

const SEPARATOR: &str = "__";
const HASH_HEX_LEN: usize = IoHash::LEN * 2;
const MIN_MAX_KEY_LENGTH: usize = HASH_HEX_LEN + SEPARATOR.len() + 1;

/// Shorten `key` if its sanitized form exceeds `max_len`
///
/// Returns `None` when the key already fits.
pub fn shorten_key(key: &LegacyKey, max_len: usize) -> Option<LegacyKey> {
    let max_len = max_len.max(MIN_MAX_KEY_LENGTH);
    if key.sanitized().len() <= max_len {
        return None;
    }
    let prefix_len = max_len - HASH_HEX_LEN - SEPARATOR.len();
    let prefix: String = key
        .as_str()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
        .take(prefix_len)
        .collect();
    let hash = IoHash::hash(key.as_str().as_bytes());
    Some(LegacyKey::new(format!("{}{}{}", prefix, SEPARATOR, hash.to_hex())))
}

/// Append the full key to `data`
pub fn append_key_tail(data: &[u8], key: &LegacyKey) -> Bytes {
    let full = key.as_str().as_bytes();
    let mut buf = BytesMut::with_capacity(data.len() + full.len() + 4);
    buf.put_slice(data);
    buf.put_slice(full);
    buf.put_u32_le(full.len() as u32);
    buf.freeze()
}

/// Split off and check the key tail, returning the payload
pub fn strip_key_tail(mut data: Bytes, key: &LegacyKey) -> Result<Bytes> {
    let location = key.to_string();
    if data.len() < 4 {
        return Err(Error::corruption(location, "payload too short for key tail"));
    }
    let len_offset = data.len() - 4;
    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&data[len_offset..]);
    let key_len = u32::from_le_bytes(len_bytes) as usize;
    if key_len > len_offset {
        return Err(Error::corruption(location, "key tail length out of range"));
    }
    let key_offset = len_offset - key_len;
    if &data[key_offset..len_offset] != key.as_str().as_bytes() {
        return Err(Error::corruption(location, "key tail names a different key"));
    }
    data.truncate(key_offset);
    Ok(data)
}

/// Wrapper shortening overlong legacy keys
pub struct LimitKeyLengthWrapper {
    name: String,
    inner: SharedBackend,
    max_key_length: usize,
    stats: BackendStats,
}

impl LimitKeyLengthWrapper {
    pub fn new(name: impl Into<String>, inner: SharedBackend, max_key_length: usize) -> Self {
        Self {
            name: name.into(),
            inner,
            max_key_length: max_key_length.max(MIN_MAX_KEY_LENGTH),
            stats: BackendStats::new(),
        }
    }

    pub fn max_key_length(&self) -> usize {
        self.max_key_length
    }

    fn shorten(&self, key: &LegacyKey) -> Option<LegacyKey> {
        shorten_key(key, self.max_key_length)
    }
}

#[async_trait]
impl CacheBackend for LimitKeyLengthWrapper {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> BackendKind {
        BackendKind::LimitKeyLength
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
        match self.shorten(key) {
            Some(short) => self.inner.exists(&short).await,
            None => self.inner.exists(key).await,
        }
    }

    async fn get(&self, key: &LegacyKey) -> Option<Bytes> {
        let Some(short) = self.shorten(key) else {
            return self.inner.get(key).await;
        };
        let data = self.inner.get(&short).await?;
        match strip_key_tail(data, key) {
            Ok(payload) => Some(payload),
            Err(e) => {
                warn!("{}: {} ({}), removing", self.name, e, short);
                self.stats.record_corruption();
                self.inner.remove(&short, false).await;
                None
            }
        }
    }

    async fn put(&self, key: &LegacyKey, data: Bytes, put_even_if_exists: bool) -> PutStatus {
        match self.shorten(key) {
            Some(short) => {
                let data = append_key_tail(&data, key);
                self.inner.put(&short, data, put_even_if_exists).await
            }
            None => self.inner.put(key, data, put_even_if_exists).await,
        }
    }

    async fn remove(&self, key: &LegacyKey, transient: bool) {
        match self.shorten(key) {
            Some(short) => self.inner.remove(&short, transient).await,
            None => self.inner.remove(key, transient).await,
        }
    }

    async fn get_record(&self, key: &CacheKey, policy: CachePolicy) -> Option<CacheRecord> {
        self.inner.get_record(key, policy).await
    }

    async fn put_record(&self, record: &CacheRecord, policy: CachePolicy) -> PutStatus {
        self.inner.put_record(record, policy).await
    }

    async fn get_value(&self, key: &CacheKey, policy: CachePolicy) -> Option<Value> {
        self.inner.get_value(key, policy).await
    }

    async fn put_value(&self, key: &CacheKey, value: &Value, policy: CachePolicy) -> PutStatus {
        self.inner.put_value(key, value, policy).await
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
    use proptest::prelude::*;
    use std::sync::Arc;

    fn long_key(tag: &str) -> LegacyKey {
        LegacyKey::new(format!("{}_{}", tag, "X".repeat(200)))
    }

    #[test]
    fn test_short_keys_are_kept() {
        assert!(shorten_key(&LegacyKey::from("Short"), 64).is_none());
    }

    #[test]
    fn test_shortened_key_fits() {
        let key = long_key("Mesh");
        let short = shorten_key(&key, 64).unwrap();
        assert_eq!(short.sanitized().len(), 64);
        assert!(short.as_str().starts_with("Mesh_"));
        assert!(short.as_str().contains("__"));
        // Deterministic
        assert_eq!(shorten_key(&key, 64).unwrap(), short);
    }

    #[test]
    fn test_tail_rejects_other_key() {
        let a = long_key("A");
        let b = long_key("B");
        let stored = append_key_tail(b"payload", &a);
        assert_eq!(strip_key_tail(stored.clone(), &a).unwrap().as_ref(), b"payload");
        assert!(strip_key_tail(stored, &b).unwrap_err().is_corruption());
        assert!(strip_key_tail(Bytes::from_static(b"\x01"), &a).is_err());
        assert!(strip_key_tail(Bytes::from_static(b"ab\xff\x00\x00\x00"), &a).is_err());
    }

    #[tokio::test]
    async fn test_round_trip_through_wrapper() {
        let memory = Arc::new(MemoryCacheStore::new("mem"));
        let wrapper = LimitKeyLengthWrapper::new("limit", memory.clone(), 64);
        let key = long_key("Texture");

        assert!(wrapper.put(&key, Bytes::from_static(b"texels"), false).await.is_cached());
        assert!(wrapper.exists(&key).await);
        assert!(!memory.exists(&key).await);
        assert_eq!(wrapper.get(&key).await.unwrap().as_ref(), b"texels");

        let plain = LegacyKey::from("Plain");
        wrapper.put(&plain, Bytes::from_static(b"p"), false).await;
        assert_eq!(memory.get(&plain).await.unwrap().as_ref(), b"p");
    }

    #[tokio::test]
    async fn test_forged_entry_is_removed() {
        let memory = Arc::new(MemoryCacheStore::new("mem"));
        let wrapper = LimitKeyLengthWrapper::new("limit", memory.clone(), 64);
        let key = long_key("Victim");
        let short = shorten_key(&key, 64).unwrap();

        let forged = append_key_tail(b"evil", &long_key("Forger"));
        memory.put(&short, forged, false).await;

        assert!(wrapper.get(&key).await.is_none());
        assert!(!memory.exists(&short).await);
        assert_eq!(wrapper.usage_stats().stats.corruptions, 1);
    }

    proptest! {
        #[test]
        fn prop_shortened_length_bounded(key in "[ -~]{0,300}", max in 43usize..200) {
            let key = LegacyKey::new(key);
            match shorten_key(&key, max) {
                Some(short) => prop_assert!(short.sanitized().len() <= max),
                None => prop_assert!(key.sanitized().len() <= max),
            }
        }
    }
}
