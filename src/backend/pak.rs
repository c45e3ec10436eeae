//! Pak File Store
//!
//! A single-file archive of complete key/value entries. In write mode
//! entries are appended and the index is kept in memory until
//! [`PakFileStore::close`] serializes it; in read mode the index is loaded
//! once on open.
//!
//! ```text
//! ┌─────────┬─────────┬─────┬───────────────────────────────┬────────────┐
//! │ entry 0 │ entry 1 │ ... │ index: (key, offset, size,    │   footer   │
//! │         │         │     │         raw_size, crc, flags)*│            │
//! └─────────┴─────────┴─────┴───────────────────────────────┴────────────┘
//! footer := index_offset u64, index_size u64, index_crc u32, magic, version
//! ```
//!
//! A pak file is not crash-safe while being written: without a footer it
//! fails to open.

use std::collections::BTreeMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use super::stats::{BackendStats, LatencyTracker, UsageStats};
use super::{BackendKind, CacheBackend, PutStatus, SpeedClass};
use crate::error::{Error, Result};
use crate::key::{CacheKey, LegacyKey};
use crate::record::compression::{CompressionManager, CompressionMethod};
use crate::record::package::{self, Placement};
use crate::record::{CachePolicy, CacheRecord, Value};

const PAK_MAGIC: u32 = 0x5043_4444; // "DDCP"
const PAK_VERSION: u32 = 1;
const FOOTER_LEN: u64 = 8 + 8 + 4 + 4 + 4;

const FLAG_COMPRESSED: u8 = 1 << 0;

/// Index key lengths are stored as u16
const MAX_ENTRY_KEY_LEN: usize = u16::MAX as usize;
/// Index entry count is stored as u32
const MAX_ENTRIES: usize = u32::MAX as usize;

const LEGACY_PREFIX: &str = "LEG:";
const RECORD_PREFIX: &str = "REC:";
const VALUE_PREFIX: &str = "VAL:";

/// How a pak file is opened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PakMode {
    /// Existing archive, immutable
    Read,
    /// New archive, appended until closed
    Write,
}

/// Pak store configuration
#[derive(Debug, Clone)]
pub struct PakConfig {
    /// Node name
    pub name: String,
    /// Archive file
    pub path: PathBuf,
    /// Compress entries with LZ4 when written
    pub compressed: bool,
}

impl PakConfig {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            compressed: false,
        }
    }
}

/// Location and checksum of one entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PakEntry {
    offset: u64,
    size: u64,
    raw_size: u64,
    crc: u32,
    flags: u8,
}

struct PakFile {
    file: tokio::fs::File,
    /// Where the next entry is appended
    end: u64,
}

/// Single-file archive store
pub struct PakFileStore {
    config: PakConfig,
    mode: PakMode,
    file: Mutex<PakFile>,
    index: RwLock<BTreeMap<String, PakEntry>>,
    closed: AtomicBool,
    stats: BackendStats,
}

impl PakFileStore {
    /// Create a new archive for writing, truncating any existing file
    #[instrument(skip(config), fields(path = %config.path.display()))]
    pub async fn create(config: PakConfig) -> Result<Self> {
        if let Some(parent) = config.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&config.path)
            .await?;
        info!("{}: writing pak file {}", config.name, config.path.display());
        Ok(Self {
            config,
            mode: PakMode::Write,
            file: Mutex::new(PakFile { file, end: 0 }),
            index: RwLock::new(BTreeMap::new()),
            closed: AtomicBool::new(false),
            stats: BackendStats::new(),
        })
    }

    /// Open an existing archive for reading
    #[instrument(skip(config), fields(path = %config.path.display()))]
    pub async fn open(config: PakConfig) -> Result<Self> {
        let mut file = tokio::fs::File::open(&config.path).await?;
        let len = file.metadata().await?.len();
        let index = read_index(&mut file, len).await?;
        info!(
            "{}: opened pak file {} with {} entries",
            config.name,
            config.path.display(),
            index.len()
        );
        Ok(Self {
            config,
            mode: PakMode::Read,
            file: Mutex::new(PakFile { file, end: len }),
            index: RwLock::new(index),
            closed: AtomicBool::new(true),
            stats: BackendStats::new(),
        })
    }

    /// Archive file path
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Mode the archive was opened in
    pub fn mode(&self) -> PakMode {
        self.mode
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.index.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every key in sorted order
    pub fn keys(&self) -> Vec<String> {
        self.index.read().keys().cloned().collect()
    }

    fn accepts_writes(&self) -> bool {
        self.mode == PakMode::Write && !self.closed.load(Ordering::Acquire)
    }

    /// Write the index and footer; the archive is read-only afterwards
    pub async fn close(&self) -> Result<()> {
        if self.mode != PakMode::Write || self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let index = encode_index(&self.index.read());

        let mut pak = self.file.lock().await;
        let index_offset = pak.end;
        let mut footer = BytesMut::with_capacity(FOOTER_LEN as usize);
        footer.put_u64_le(index_offset);
        footer.put_u64_le(index.len() as u64);
        footer.put_u32_le(crc32fast::hash(&index));
        footer.put_u32_le(PAK_MAGIC);
        footer.put_u32_le(PAK_VERSION);

        pak.file.seek(SeekFrom::Start(index_offset)).await?;
        pak.file.write_all(&index).await?;
        pak.file.write_all(&footer).await?;
        pak.file.flush().await?;
        pak.file.sync_all().await?;
        pak.end = index_offset + index.len() as u64 + FOOTER_LEN;

        info!(
            "{}: closed pak file {} with {} entries",
            self.config.name,
            self.config.path.display(),
            self.len()
        );
        Ok(())
    }

    // =========================================================================
    // Entry I/O
    // =========================================================================

    /// Stored bytes of an entry, checksum verified
    async fn read_raw(&self, entry: &PakEntry) -> Result<Bytes> {
        let mut buf = vec![0u8; entry.size as usize];
        {
            let mut pak = self.file.lock().await;
            pak.file.seek(SeekFrom::Start(entry.offset)).await?;
            pak.file.read_exact(&mut buf).await?;
        }
        if crc32fast::hash(&buf) != entry.crc {
            return Err(Error::corruption(
                format!("pak {}", self.config.path.display()),
                format!("checksum mismatch at offset {}", entry.offset),
            ));
        }
        Ok(Bytes::from(buf))
    }

    /// Decoded bytes of an entry
    async fn read_entry(&self, key: &str) -> Result<Bytes> {
        let entry = self
            .index
            .read()
            .get(key)
            .copied()
            .ok_or_else(|| Error::NotFound(key.to_string()))?;
        let raw = self.read_raw(&entry).await?;
        if entry.flags & FLAG_COMPRESSED == 0 {
            return Ok(raw);
        }
        let data = CompressionManager::shared().decompress(&raw, CompressionMethod::Lz4)?;
        if data.len() as u64 != entry.raw_size {
            return Err(Error::corruption(
                format!("pak {}", self.config.path.display()),
                "decompressed size mismatch",
            ));
        }
        Ok(data)
    }

    /// Append stored bytes under `key`
    async fn append_raw(&self, key: String, raw: &[u8], raw_size: u64, flags: u8) -> Result<()> {
        if !self.accepts_writes() {
            return Err(Error::BackendReadOnly(self.config.name.clone()));
        }
        if key.len() > MAX_ENTRY_KEY_LEN {
            return Err(Error::Capacity {
                what: "pak entry key".to_string(),
                len: key.len(),
                limit: MAX_ENTRY_KEY_LEN,
            });
        }
        let entries = self.index.read().len();
        if entries >= MAX_ENTRIES {
            return Err(Error::Capacity {
                what: "pak entries".to_string(),
                len: entries + 1,
                limit: MAX_ENTRIES,
            });
        }
        let mut pak = self.file.lock().await;
        let offset = pak.end;
        pak.file.seek(SeekFrom::Start(offset)).await?;
        pak.file.write_all(raw).await?;
        pak.file.flush().await?;
        pak.end = offset + raw.len() as u64;
        self.index.write().insert(
            key,
            PakEntry {
                offset,
                size: raw.len() as u64,
                raw_size,
                crc: crc32fast::hash(raw),
                flags,
            },
        );
        Ok(())
    }

    /// Append `data` under `key`, compressing if configured
    async fn write_entry(&self, key: String, data: &[u8]) -> Result<()> {
        if self.config.compressed {
            let (compressed, method) = CompressionManager::shared().compress(data);
            if method == CompressionMethod::Lz4 {
                return self
                    .append_raw(key, &compressed, data.len() as u64, FLAG_COMPRESSED)
                    .await;
            }
        }
        self.append_raw(key, data, data.len() as u64, 0).await
    }

    async fn put_entry(&self, key: String, data: &[u8], put_even_if_exists: bool) -> PutStatus {
        if !self.accepts_writes() {
            return PutStatus::NotCached;
        }
        let tracker = LatencyTracker::start();
        if !put_even_if_exists && self.index.read().contains_key(&key) {
            return PutStatus::Cached;
        }
        let status = match self.write_entry(key, data).await {
            Ok(()) => PutStatus::Cached,
            Err(e) => {
                warn!("{}: failed to append to pak: {}", self.config.name, e);
                PutStatus::NotCached
            }
        };
        self.stats
            .record_put(status, data.len() as u64, tracker.elapsed());
        status
    }

    async fn get_entry(&self, key: &str) -> Option<Bytes> {
        let tracker = LatencyTracker::start();
        match self.read_entry(key).await {
            Ok(data) => {
                self.stats
                    .record_get_hit(data.len() as u64, tracker.elapsed());
                Some(data)
            }
            Err(e) => {
                if e.is_corruption() {
                    warn!("{}: {}", self.config.name, e);
                    self.stats.record_corruption();
                } else {
                    debug!("{}: miss for {}", self.config.name, key);
                }
                self.stats.record_get_miss();
                None
            }
        }
    }

    // =========================================================================
    // Offline utilities
    // =========================================================================

    /// Copy every entry of `other` missing from this archive
    pub async fn merge_from(&self, other: &PakFileStore) -> Result<usize> {
        let mut copied = 0;
        let entries: Vec<(String, PakEntry)> = other
            .index
            .read()
            .iter()
            .map(|(k, e)| (k.clone(), *e))
            .collect();
        for (key, entry) in entries {
            if self.index.read().contains_key(&key) {
                continue;
            }
            let raw = other.read_raw(&entry).await?;
            self.append_raw(key, &raw, entry.raw_size, entry.flags)
                .await?;
            copied += 1;
        }
        info!(
            "{}: merged {} entries from {}",
            self.config.name,
            copied,
            other.path().display()
        );
        Ok(copied)
    }

    /// Rewrite `input` into `output` with entries laid out in key order
    pub async fn sort_and_copy(input: &Path, output: &Path) -> Result<usize> {
        let source = PakFileStore::open(PakConfig::new("SortSource", input)).await?;
        let target = PakFileStore::create(PakConfig::new("SortTarget", output)).await?;
        let copied = target.merge_from(&source).await?;
        target.close().await?;
        Ok(copied)
    }
}

fn encode_index(index: &BTreeMap<String, PakEntry>) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u32_le(index.len() as u32);
    for (key, entry) in index {
        buf.put_u16_le(key.len() as u16);
        buf.put_slice(key.as_bytes());
        buf.put_u64_le(entry.offset);
        buf.put_u64_le(entry.size);
        buf.put_u64_le(entry.raw_size);
        buf.put_u32_le(entry.crc);
        buf.put_u8(entry.flags);
    }
    buf.freeze()
}

fn decode_index(mut data: Bytes, data_end: u64) -> Result<BTreeMap<String, PakEntry>> {
    let bad = |reason: &str| Error::corruption("pak index", reason);
    if data.len() < 4 {
        return Err(bad("truncated count"));
    }
    let count = data.get_u32_le();
    let mut index = BTreeMap::new();
    for _ in 0..count {
        if data.len() < 2 {
            return Err(bad("truncated key length"));
        }
        let len = data.get_u16_le() as usize;
        if data.len() < len + 8 + 8 + 8 + 4 + 1 {
            return Err(bad("truncated entry"));
        }
        let key = String::from_utf8(data.split_to(len).to_vec()).map_err(|_| bad("key is not utf-8"))?;
        let entry = PakEntry {
            offset: data.get_u64_le(),
            size: data.get_u64_le(),
            raw_size: data.get_u64_le(),
            crc: data.get_u32_le(),
            flags: data.get_u8(),
        };
        if entry.offset.saturating_add(entry.size) > data_end {
            return Err(bad("entry past end of data"));
        }
        index.insert(key, entry);
    }
    if !data.is_empty() {
        return Err(bad("trailing bytes"));
    }
    Ok(index)
}

async fn read_index(file: &mut tokio::fs::File, len: u64) -> Result<BTreeMap<String, PakEntry>> {
    if len < FOOTER_LEN {
        return Err(Error::corruption("pak footer", "file shorter than footer"));
    }
    let mut footer = [0u8; FOOTER_LEN as usize];
    file.seek(SeekFrom::Start(len - FOOTER_LEN)).await?;
    file.read_exact(&mut footer).await?;
    let mut footer = &footer[..];
    let index_offset = footer.get_u64_le();
    let index_size = footer.get_u64_le();
    let index_crc = footer.get_u32_le();
    if footer.get_u32_le() != PAK_MAGIC {
        return Err(Error::corruption("pak footer", "bad magic"));
    }
    let version = footer.get_u32_le();
    if version != PAK_VERSION {
        return Err(Error::corruption(
            "pak footer",
            format!("unsupported version {}", version),
        ));
    }
    if index_offset.checked_add(index_size) != Some(len - FOOTER_LEN) {
        return Err(Error::corruption("pak footer", "index bounds do not match file size"));
    }

    let mut index = vec![0u8; index_size as usize];
    file.seek(SeekFrom::Start(index_offset)).await?;
    file.read_exact(&mut index).await?;
    if crc32fast::hash(&index) != index_crc {
        return Err(Error::corruption("pak index", "checksum mismatch"));
    }
    decode_index(Bytes::from(index), index_offset)
}

fn legacy_entry_key(key: &LegacyKey) -> String {
    format!("{}{}", LEGACY_PREFIX, key)
}

fn record_entry_key(key: &CacheKey) -> String {
    format!("{}{}", RECORD_PREFIX, key)
}

fn value_entry_key(key: &CacheKey) -> String {
    format!("{}{}", VALUE_PREFIX, key)
}

#[async_trait]
impl CacheBackend for PakFileStore {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Pak
    }

    fn speed_class(&self) -> SpeedClass {
        SpeedClass::Local
    }

    fn is_writable(&self) -> bool {
        self.accepts_writes()
    }

    fn backfill_lower_cache_levels(&self) -> bool {
        self.mode == PakMode::Write
    }

    fn is_read_only_archive(&self) -> bool {
        self.mode == PakMode::Read
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
        self.index.read().contains_key(&legacy_entry_key(key))
    }

    async fn get(&self, key: &LegacyKey) -> Option<Bytes> {
        self.get_entry(&legacy_entry_key(key)).await
    }

    async fn put(&self, key: &LegacyKey, data: Bytes, put_even_if_exists: bool) -> PutStatus {
        self.put_entry(legacy_entry_key(key), &data, put_even_if_exists)
            .await
    }

    async fn remove(&self, key: &LegacyKey, _transient: bool) {
        if self.accepts_writes() && self.index.write().remove(&legacy_entry_key(key)).is_some() {
            self.stats.record_remove();
        }
    }

    async fn get_record(&self, key: &CacheKey, policy: CachePolicy) -> Option<CacheRecord> {
        if !policy.allows_query(self.is_remote()) {
            return None;
        }
        let data = self.get_entry(&record_entry_key(key)).await?;
        match package::decode_record(data) {
            Ok(decoded) if decoded.record.key() == key => Some(decoded.record.filtered(policy)),
            _ => {
                warn!("{}: invalid record package for {}", self.config.name, key);
                self.stats.record_corruption();
                None
            }
        }
    }

    async fn put_record(&self, record: &CacheRecord, policy: CachePolicy) -> PutStatus {
        if !policy.allows_store(self.is_remote()) || !record.is_complete() {
            return PutStatus::NotCached;
        }
        let placements = vec![Placement::Inline; record.values().count()];
        match package::encode_record(record, &placements) {
            Ok(data) => {
                self.put_entry(record_entry_key(record.key()), &data, false)
                    .await
            }
            Err(e) => {
                warn!("{}: failed to encode record {}: {}", self.config.name, record.key(), e);
                PutStatus::NotCached
            }
        }
    }

    async fn get_value(&self, key: &CacheKey, policy: CachePolicy) -> Option<Value> {
        if !policy.allows_query(self.is_remote()) {
            return None;
        }
        let data = self.get_entry(&value_entry_key(key)).await?;
        match package::decode_value(data) {
            Ok((value, false)) if value.has_data() => {
                if policy.contains(CachePolicy::SKIP_DATA) {
                    Some(value.without_data())
                } else {
                    Some(value)
                }
            }
            _ => {
                warn!("{}: invalid value package for {}", self.config.name, key);
                self.stats.record_corruption();
                None
            }
        }
    }

    async fn put_value(&self, key: &CacheKey, value: &Value, policy: CachePolicy) -> PutStatus {
        if !policy.allows_store(self.is_remote()) || !value.has_data() {
            return PutStatus::NotCached;
        }
        let data = package::encode_value(value, Placement::Inline);
        self.put_entry(value_entry_key(key), &data, false).await
    }

    async fn shutdown(&self) {
        if let Err(e) = self.close().await {
            warn!("{}: failed to close pak file: {}", self.config.name, e);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    async fn write_pak(path: &Path, compressed: bool, keys: &[(&str, &[u8])]) -> PakFileStore {
        let mut config = PakConfig::new("pak", path);
        config.compressed = compressed;
        let pak = PakFileStore::create(config).await.unwrap();
        for (key, data) in keys {
            assert!(pak
                .put(&LegacyKey::from(*key), Bytes::copy_from_slice(data), false)
                .await
                .is_cached());
        }
        pak
    }

    #[tokio::test]
    async fn test_write_close_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.pak");
        let entries: [(&str, &[u8]); 3] = [("A", b"alpha"), ("B", b"bravo"), ("C", b"charlie")];

        let pak = write_pak(&path, false, &entries).await;
        // Readable before close as well
        assert_eq!(pak.get(&"B".into()).await.unwrap().as_ref(), b"bravo");
        pak.close().await.unwrap();
        assert!(!pak.is_writable());
        assert_eq!(
            pak.put(&"D".into(), Bytes::from_static(b"late"), false).await,
            PutStatus::NotCached
        );

        let pak = PakFileStore::open(PakConfig::new("pak", &path)).await.unwrap();
        assert!(pak.is_read_only_archive());
        for (key, data) in entries {
            assert_eq!(pak.get(&key.into()).await.unwrap().as_ref(), data);
        }
        assert!(pak.get(&"unknown".into()).await.is_none());
        assert!(!pak.exists(&"unknown".into()).await);
    }

    #[tokio::test]
    async fn test_oversized_key_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("long.pak");
        let pak = write_pak(&path, false, &[("A", b"alpha")]).await;

        let long = LegacyKey::new("K".repeat(70_000));
        assert_eq!(
            pak.put(&long, Bytes::from_static(b"too long"), false).await,
            PutStatus::NotCached
        );
        assert!(!pak.exists(&long).await);
        pak.close().await.unwrap();

        let pak = PakFileStore::open(PakConfig::new("pak", &path)).await.unwrap();
        assert_eq!(pak.len(), 1);
        assert_eq!(pak.get(&"A".into()).await.unwrap().as_ref(), b"alpha");
    }

    #[tokio::test]
    async fn test_compressed_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("compressed.pak");
        let data = b"texture mip texture mip ".repeat(100);

        let pak = write_pak(&path, true, &[("TEX", &data)]).await;
        pak.close().await.unwrap();
        assert!(std::fs::metadata(&path).unwrap().len() < data.len() as u64);

        let pak = PakFileStore::open(PakConfig::new("pak", &path)).await.unwrap();
        assert_eq!(pak.get(&"TEX".into()).await.unwrap().as_ref(), data.as_slice());
    }

    #[tokio::test]
    async fn test_missing_footer_fails_to_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("unclosed.pak");
        let pak = write_pak(&path, false, &[("A", b"alpha")]).await;
        drop(pak);

        let result = PakFileStore::open(PakConfig::new("pak", &path)).await;
        assert!(matches!(result, Err(Error::Corruption { .. })));
    }

    #[tokio::test]
    async fn test_corrupt_entry_is_miss() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corrupt.pak");
        let pak = write_pak(&path, false, &[("A", b"alpha"), ("B", b"bravo")]).await;
        pak.close().await.unwrap();

        let mut raw = std::fs::read(&path).unwrap();
        raw[0] ^= 0xff;
        std::fs::write(&path, raw).unwrap();

        let pak = PakFileStore::open(PakConfig::new("pak", &path)).await.unwrap();
        assert!(pak.get(&"A".into()).await.is_none());
        assert_eq!(pak.get(&"B".into()).await.unwrap().as_ref(), b"bravo");
        assert_eq!(pak.usage_stats().stats.corruptions, 1);
    }

    #[tokio::test]
    async fn test_records_and_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.pak");
        let key = CacheKey::from_content("Pak", b"record").unwrap();
        let record = CacheRecord::builder(key.clone())
            .value(Value::from_raw(b"record value"))
            .meta(serde_json::json!({"platform": "linux"}))
            .build();
        let value_key = CacheKey::from_content("Pak", b"value").unwrap();
        let value = Value::from_raw(b"standalone");

        let pak = PakFileStore::create(PakConfig::new("pak", &path)).await.unwrap();
        assert!(pak.put_record(&record, CachePolicy::DEFAULT).await.is_cached());
        assert!(pak.put_value(&value_key, &value, CachePolicy::DEFAULT).await.is_cached());
        pak.shutdown().await;

        let pak = PakFileStore::open(PakConfig::new("pak", &path)).await.unwrap();
        assert_eq!(pak.get_record(&key, CachePolicy::DEFAULT).await.unwrap(), record);
        assert_eq!(pak.get_value(&value_key, CachePolicy::DEFAULT).await.unwrap(), value);
        // Legacy, record and value namespaces do not collide
        assert!(pak.get_value(&key, CachePolicy::DEFAULT).await.is_none());
    }

    #[tokio::test]
    async fn test_sort_and_copy_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let forward = dir.path().join("forward.pak");
        let backward = dir.path().join("backward.pak");
        let entries: [(&str, &[u8]); 3] = [("A", b"1"), ("B", b"22"), ("C", b"333")];
        let mut reversed = entries;
        reversed.reverse();

        write_pak(&forward, false, &entries).await.close().await.unwrap();
        write_pak(&backward, false, &reversed).await.close().await.unwrap();
        assert_ne!(std::fs::read(&forward).unwrap(), std::fs::read(&backward).unwrap());

        let sorted_a = dir.path().join("sorted_a.pak");
        let sorted_b = dir.path().join("sorted_b.pak");
        assert_eq!(PakFileStore::sort_and_copy(&forward, &sorted_a).await.unwrap(), 3);
        assert_eq!(PakFileStore::sort_and_copy(&backward, &sorted_b).await.unwrap(), 3);
        assert_eq!(std::fs::read(&sorted_a).unwrap(), std::fs::read(&sorted_b).unwrap());
    }

    #[tokio::test]
    async fn test_merge_from_skips_existing() {
        let dir = tempfile::tempdir().unwrap();
        let other_path = dir.path().join("other.pak");
        write_pak(&other_path, false, &[("A", b"other"), ("B", b"bravo")])
            .await
            .close()
            .await
            .unwrap();
        let other = PakFileStore::open(PakConfig::new("other", &other_path)).await.unwrap();

        let target = write_pak(&dir.path().join("target.pak"), false, &[("A", b"mine")]).await;
        assert_eq!(target.merge_from(&other).await.unwrap(), 1);
        assert_eq!(target.get(&"A".into()).await.unwrap().as_ref(), b"mine");
        assert_eq!(target.get(&"B".into()).await.unwrap().as_ref(), b"bravo");
    }
}
