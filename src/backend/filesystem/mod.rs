//! File System Cache Store
//!
//! Durable leaf store for content blobs, record and value packages, and
//! legacy flat keys under one root directory.
//!
//! # Design
//!
//! - Writes go to a unique temp file that is renamed into place
//! - Every file ends with an integrity trailer; a read that fails
//!   verification deletes the file and reports a miss
//! - Large record values are stored as separate content blobs
//! - A one-time speed test classifies the store and may degrade it to
//!   read-only or disable it

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, info, instrument, warn};

use super::maintainer::MaintainerConfig;
use super::stats::{BackendStats, LatencyTracker, UsageStats};
use super::trailer::{self, TrailerKind};
use super::{BackendKind, CacheBackend, PutStatus, SpeedClass};
use crate::error::{Error, Result};
use crate::key::{CacheKey, IoHash, LegacyKey};
use crate::record::package::{self, PackageLimits, Placement};
use crate::record::{CachePolicy, CacheRecord, CompressedBuffer, Value};

pub mod layout;

pub use layout::{StoreLayout, MAX_LEGACY_PATH_LEN};
pub use speed_test::{SpeedTestResult, SpeedThresholds};

// =============================================================================
// Configuration
// =============================================================================

/// File system store configuration
#[derive(Debug, Clone)]
pub struct FileSystemConfig {
    /// Node name
    pub name: String,
    /// Root directory
    pub path: PathBuf,
    /// Never write or delete
    pub read_only: bool,
    /// Refresh file times on hits so aging treats them as used
    pub touch: bool,
    /// Apply transient removes as well
    pub purge_transient: bool,
    /// Treat the store as a remote tier for policy purposes
    pub remote: bool,
    /// Run the startup speed test
    pub speed_test: bool,
    /// Thresholds used by the speed test
    pub speed_thresholds: SpeedThresholds,
    /// Skip classification and use this speed class
    pub force_speed_class: Option<SpeedClass>,
    /// Limits deciding which record values are inlined
    pub package_limits: PackageLimits,
    /// Hits may be cascaded to slower tiers
    pub backfill_lower_cache_levels: bool,
    /// Run a maintainer deleting unused files
    pub delete_unused: bool,
    /// Age after which unused files are deleted
    pub unused_file_age: Duration,
    /// Maintainer scan rate cap in paths per second, zero for unlimited
    pub max_file_checks_per_sec: u64,
}

impl Default for FileSystemConfig {
    fn default() -> Self {
        let maintainer = MaintainerConfig::default();
        Self {
            name: "FileSystem".to_string(),
            path: PathBuf::new(),
            read_only: false,
            touch: false,
            purge_transient: false,
            remote: false,
            speed_test: true,
            speed_thresholds: SpeedThresholds::default(),
            force_speed_class: None,
            package_limits: PackageLimits::default(),
            backfill_lower_cache_levels: true,
            delete_unused: true,
            unused_file_age: maintainer.max_file_age,
            max_file_checks_per_sec: maintainer.max_scan_rate,
        }
    }
}

impl FileSystemConfig {
    /// Config for a named store at `path`
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            ..Default::default()
        }
    }

    /// Maintainer settings derived from this store's settings
    pub fn maintainer_config(&self) -> MaintainerConfig {
        MaintainerConfig {
            max_file_age: self.unused_file_age,
            max_scan_rate: self.max_file_checks_per_sec,
            ..Default::default()
        }
    }
}

// =============================================================================
// Access State
// =============================================================================

/// What the store may still do after its startup probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StoreAccess {
    Writable = 0,
    ReadOnly = 1,
    Disabled = 2,
}

impl StoreAccess {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => StoreAccess::Writable,
            1 => StoreAccess::ReadOnly,
            _ => StoreAccess::Disabled,
        }
    }
}

// =============================================================================
// Store
// =============================================================================

/// Disk-backed leaf store
pub struct FileSystemCacheStore {
    config: FileSystemConfig,
    layout: StoreLayout,
    speed_class: SpeedClass,
    access: AtomicU8,
    stats: BackendStats,
}

impl FileSystemCacheStore {
    /// Open a store, running the speed test if configured
    ///
    /// Opening never fails: a store whose probe fails is disabled and every
    /// operation on it is a miss or a skipped write.
    #[instrument(skip(config), fields(name = %config.name, path = %config.path.display()))]
    pub async fn open(config: FileSystemConfig) -> Self {
        if !config.read_only {
            if let Err(e) = tokio::fs::create_dir_all(&config.path).await {
                warn!("Failed to create cache root {}: {}", config.path.display(), e);
            }
        }

        let (access, measured) = if config.speed_test {
            let result =
                speed_test::run(&config.path, config.read_only, &config.speed_thresholds).await;
            let access = if result.is_unusable() {
                StoreAccess::Disabled
            } else if config.read_only || !result.write_ok {
                StoreAccess::ReadOnly
            } else {
                StoreAccess::Writable
            };
            (access, result.speed_class)
        } else {
            let access = match tokio::fs::metadata(&config.path).await {
                Ok(meta) if meta.is_dir() && config.read_only => StoreAccess::ReadOnly,
                Ok(meta) if meta.is_dir() => StoreAccess::Writable,
                _ => StoreAccess::Disabled,
            };
            (access, SpeedClass::Local)
        };

        match access {
            StoreAccess::Disabled => warn!(
                "{}: cache at {} is unusable and has been disabled",
                config.name,
                config.path.display()
            ),
            StoreAccess::ReadOnly if !config.read_only => warn!(
                "{}: cache at {} is not writable, continuing read-only",
                config.name,
                config.path.display()
            ),
            _ => {}
        }

        let speed_class = config.force_speed_class.unwrap_or(measured);
        info!(
            "{}: opened file system cache at {} ({:?}, {})",
            config.name,
            config.path.display(),
            access,
            speed_class
        );

        Self {
            layout: StoreLayout::new(&config.path),
            config,
            speed_class,
            access: AtomicU8::new(access as u8),
            stats: BackendStats::new(),
        }
    }

    /// Store configuration
    pub fn config(&self) -> &FileSystemConfig {
        &self.config
    }

    /// Path layout
    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    /// Root directory
    pub fn root(&self) -> &Path {
        self.layout.root()
    }

    /// Current access state
    pub fn access(&self) -> StoreAccess {
        StoreAccess::from_u8(self.access.load(Ordering::Acquire))
    }

    pub fn is_disabled(&self) -> bool {
        self.access() == StoreAccess::Disabled
    }

    fn can_read(&self) -> bool {
        self.access() != StoreAccess::Disabled
    }

    fn can_write(&self) -> bool {
        self.access() == StoreAccess::Writable
    }

    // =========================================================================
    // File helpers
    // =========================================================================

    /// Read a file and verify its trailer; corrupt files are deleted
    async fn load(&self, path: &Path, kind: TrailerKind) -> Result<Bytes> {
        let data = Bytes::from(tokio::fs::read(path).await?);
        match trailer::open(data, kind) {
            Ok(payload) => {
                self.touch(path).await;
                Ok(payload)
            }
            Err(e) => {
                self.discard_corrupt(path, &e).await;
                Err(e)
            }
        }
    }

    async fn discard_corrupt(&self, path: &Path, error: &Error) {
        warn!(
            "{}: corrupt cache file {}: {}",
            self.config.name,
            path.display(),
            error
        );
        self.stats.record_corruption();
        if self.can_write() {
            if let Err(e) = tokio::fs::remove_file(path).await {
                debug!("Failed to delete corrupt file {}: {}", path.display(), e);
            }
        }
    }

    /// Write `payload` plus trailer through a temp file renamed into place
    async fn store(&self, path: &Path, payload: &[u8], kind: TrailerKind) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let temp = StoreLayout::temp_path(path);
        let sealed = trailer::seal(payload, kind);
        if let Err(e) = tokio::fs::write(&temp, &sealed).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(e.into());
        }
        if let Err(e) = tokio::fs::rename(&temp, path).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn touch(&self, path: &Path) {
        if !self.config.touch || !self.can_write() {
            return;
        }
        let owned = path.to_path_buf();
        let result =
            tokio::task::spawn_blocking(move || set_file_times(&owned, SystemTime::now())).await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("Failed to touch {}: {}", path.display(), e),
            Err(e) => debug!("Touch task for {} failed: {}", path.display(), e),
        }
    }

    async fn file_exists(&self, path: &Path) -> bool {
        tokio::fs::metadata(path)
            .await
            .map(|m| m.is_file())
            .unwrap_or(false)
    }

    // =========================================================================
    // Content blobs
    // =========================================================================

    /// Store the data of `value` as a content blob unless already present
    async fn put_content(&self, value: &Value) -> Result<()> {
        let Some(buffer) = value.data() else {
            return Ok(());
        };
        let path = self.layout.content_path(value.raw_hash());
        if self.file_exists(&path).await {
            self.touch(&path).await;
            return Ok(());
        }
        self.store(&path, &buffer.encode(), TrailerKind::Hash).await
    }

    /// Load and verify the content blob for `hash`
    async fn get_content(&self, hash: &IoHash) -> Result<CompressedBuffer> {
        let path = self.layout.content_path(hash);
        let payload = self.load(&path, TrailerKind::Hash).await?;
        let decoded = CompressedBuffer::decode(payload).and_then(|buffer| {
            if buffer.raw_hash() == hash {
                Ok(buffer)
            } else {
                Err(Error::corruption("content blob", "raw hash does not match path"))
            }
        });
        if let Err(e) = &decoded {
            self.discard_corrupt(&path, e).await;
        }
        decoded
    }

    // =========================================================================
    // Records and values
    // =========================================================================

    async fn write_record(&self, record: &CacheRecord) -> Result<u64> {
        let placements = package::plan_placement(record, &self.config.package_limits);
        for ((_, value), placement) in record.values().zip(&placements) {
            if *placement == Placement::External {
                self.put_content(value).await?;
            }
        }
        let payload = package::encode_record(record, &placements)?;
        self.store(&self.layout.record_path(record.key()), &payload, TrailerKind::Hash)
            .await?;
        Ok(payload.len() as u64)
    }

    async fn read_record(&self, key: &CacheKey, policy: CachePolicy) -> Result<CacheRecord> {
        let path = self.layout.record_path(key);
        let payload = self.load(&path, TrailerKind::Hash).await?;
        let decoded = match package::decode_record(payload) {
            Ok(decoded) if decoded.record.key() == key => decoded,
            Ok(_) => {
                let e = Error::corruption("record package", "stored key does not match path");
                self.discard_corrupt(&path, &e).await;
                return Err(e);
            }
            Err(e) => {
                self.discard_corrupt(&path, &e).await;
                return Err(e);
            }
        };

        let mut record = decoded.record;
        let skip_data = policy.contains(CachePolicy::SKIP_DATA);
        let partial = policy.contains(CachePolicy::PARTIAL_RECORD);

        if !skip_data {
            for id in &decoded.external {
                let reference = match id {
                    None => record.value().cloned(),
                    Some(id) => record.attachment(id).cloned(),
                };
                let Some(reference) = reference else { continue };
                match self.get_content(reference.raw_hash()).await {
                    Ok(buffer) => {
                        let value = reference.with_data(buffer)?;
                        record.set_value(id.as_ref(), value);
                    }
                    Err(e) if partial => {
                        debug!("{}: partial record {}: {}", self.config.name, key, e);
                    }
                    Err(e) => return Err(e),
                }
            }
            if !partial && !record.is_complete() {
                return Err(Error::NotFound(format!("data of record {}", key)));
            }
        }

        Ok(record.filtered(policy))
    }

    fn value_placement(&self, value: &Value) -> Placement {
        if value.compressed_size() > self.config.package_limits.max_inline_value_size {
            Placement::External
        } else {
            Placement::Inline
        }
    }

    async fn write_value(&self, key: &CacheKey, value: &Value) -> Result<u64> {
        let placement = self.value_placement(value);
        if placement == Placement::External {
            self.put_content(value).await?;
        }
        let payload = package::encode_value(value, placement);
        self.store(&self.layout.value_path(key), &payload, TrailerKind::Hash)
            .await?;
        Ok(value.compressed_size())
    }

    async fn read_value(&self, key: &CacheKey, policy: CachePolicy) -> Result<Value> {
        let path = self.layout.value_path(key);
        let payload = self.load(&path, TrailerKind::Hash).await?;
        let (value, external) = match package::decode_value(payload) {
            Ok(decoded) => decoded,
            Err(e) => {
                self.discard_corrupt(&path, &e).await;
                return Err(e);
            }
        };

        if policy.contains(CachePolicy::SKIP_DATA) {
            return Ok(value.without_data());
        }
        if external {
            let buffer = self.get_content(value.raw_hash()).await?;
            return value.with_data(buffer);
        }
        if !value.has_data() {
            return Err(Error::NotFound(format!("data of value {}", key)));
        }
        Ok(value)
    }

    fn log_miss(&self, what: &dyn std::fmt::Display, error: &Error) {
        if error.is_not_found() {
            debug!("{}: miss for {}", self.config.name, what);
        } else {
            debug!("{}: miss for {}: {}", self.config.name, what, error);
        }
        self.stats.record_get_miss();
    }
}

/// Set access and modification times of a file
pub(crate) fn set_file_times(path: &Path, time: SystemTime) -> std::io::Result<()> {
    let file = std::fs::File::options().write(true).open(path)?;
    file.set_times(
        std::fs::FileTimes::new()
            .set_accessed(time)
            .set_modified(time),
    )
}

#[async_trait]
impl CacheBackend for FileSystemCacheStore {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn kind(&self) -> BackendKind {
        BackendKind::FileSystem
    }

    fn speed_class(&self) -> SpeedClass {
        self.speed_class
    }

    fn is_writable(&self) -> bool {
        self.can_write()
    }

    fn is_remote(&self) -> bool {
        self.config.remote || self.speed_class == SpeedClass::Slow
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
        if !self.can_read() {
            return false;
        }
        let Ok(path) = self.layout.legacy_path(key) else {
            return false;
        };
        let found = self.file_exists(&path).await;
        if found {
            self.touch(&path).await;
        }
        found
    }

    async fn get(&self, key: &LegacyKey) -> Option<Bytes> {
        if !self.can_read() {
            return None;
        }
        let tracker = LatencyTracker::start();
        let result = match self.layout.legacy_path(key) {
            Ok(path) => self.load(&path, TrailerKind::Crc32).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(data) => {
                self.stats
                    .record_get_hit(data.len() as u64, tracker.elapsed());
                Some(data)
            }
            Err(e) => {
                self.log_miss(key, &e);
                None
            }
        }
    }

    async fn put(&self, key: &LegacyKey, data: Bytes, put_even_if_exists: bool) -> PutStatus {
        if !self.can_write() {
            return PutStatus::NotCached;
        }
        let tracker = LatencyTracker::start();
        let path = match self.layout.legacy_path(key) {
            Ok(path) => path,
            Err(e) => {
                debug!("{}: skipping put of {}: {}", self.config.name, key, e);
                self.stats
                    .record_put(PutStatus::NotCached, 0, tracker.elapsed());
                return PutStatus::NotCached;
            }
        };

        let status = if !put_even_if_exists && self.file_exists(&path).await {
            PutStatus::Cached
        } else {
            match self.store(&path, &data, TrailerKind::Crc32).await {
                Ok(()) => PutStatus::Cached,
                Err(e) => {
                    warn!("{}: failed to write {}: {}", self.config.name, path.display(), e);
                    PutStatus::NotCached
                }
            }
        };
        self.stats
            .record_put(status, data.len() as u64, tracker.elapsed());
        status
    }

    async fn remove(&self, key: &LegacyKey, transient: bool) {
        if !self.can_write() || (transient && !self.config.purge_transient) {
            return;
        }
        let Ok(path) = self.layout.legacy_path(key) else {
            return;
        };
        match tokio::fs::remove_file(&path).await {
            Ok(()) => self.stats.record_remove(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => debug!("{}: failed to remove {}: {}", self.config.name, path.display(), e),
        }
    }

    async fn get_record(&self, key: &CacheKey, policy: CachePolicy) -> Option<CacheRecord> {
        if !self.can_read() || !policy.allows_query(self.is_remote()) {
            return None;
        }
        let tracker = LatencyTracker::start();
        match self.read_record(key, policy).await {
            Ok(record) => {
                self.stats
                    .record_get_hit(record.total_compressed_size(), tracker.elapsed());
                Some(record)
            }
            Err(e) => {
                self.log_miss(key, &e);
                None
            }
        }
    }

    async fn put_record(&self, record: &CacheRecord, policy: CachePolicy) -> PutStatus {
        if !self.can_write() || !policy.allows_store(self.is_remote()) {
            return PutStatus::NotCached;
        }
        let tracker = LatencyTracker::start();
        let (status, bytes) = match self.write_record(record).await {
            Ok(bytes) => (PutStatus::Cached, bytes),
            Err(e) => {
                warn!("{}: failed to store record {}: {}", self.config.name, record.key(), e);
                (PutStatus::NotCached, 0)
            }
        };
        self.stats.record_put(status, bytes, tracker.elapsed());
        status
    }

    async fn get_value(&self, key: &CacheKey, policy: CachePolicy) -> Option<Value> {
        if !self.can_read() || !policy.allows_query(self.is_remote()) {
            return None;
        }
        let tracker = LatencyTracker::start();
        match self.read_value(key, policy).await {
            Ok(value) => {
                self.stats
                    .record_get_hit(value.compressed_size(), tracker.elapsed());
                Some(value)
            }
            Err(e) => {
                self.log_miss(key, &e);
                None
            }
        }
    }

    async fn put_value(&self, key: &CacheKey, value: &Value, policy: CachePolicy) -> PutStatus {
        if !self.can_write() || !policy.allows_store(self.is_remote()) {
            return PutStatus::NotCached;
        }
        let tracker = LatencyTracker::start();
        let (status, bytes) = match self.write_value(key, value).await {
            Ok(bytes) => (PutStatus::Cached, bytes),
            Err(e) => {
                warn!("{}: failed to store value {}: {}", self.config.name, key, e);
                (PutStatus::NotCached, 0)
            }
        };
        self.stats.record_put(status, bytes, tracker.elapsed());
        status
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::ValueId;

    fn make_config(root: &Path) -> FileSystemConfig {
        FileSystemConfig {
            speed_test: false,
            ..FileSystemConfig::new("disk", root)
        }
    }

    fn make_key(name: &str) -> CacheKey {
        CacheKey::from_content("Disk", name.as_bytes()).unwrap()
    }

    fn noisy(len: usize, seed: u8) -> Vec<u8> {
        // Incompressible enough to stay large after LZ4
        let mut state = seed as u32 | 1;
        (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                state as u8
            })
            .collect()
    }

    #[tokio::test]
    async fn test_legacy_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSystemCacheStore::open(make_config(dir.path())).await;
        let key = LegacyKey::from("SHADER_0001");

        assert!(store.get(&key).await.is_none());
        assert!(store.put(&key, Bytes::from_static(b"bytecode"), false).await.is_cached());
        assert!(store.exists(&key).await);
        for _ in 0..3 {
            assert_eq!(store.get(&key).await.unwrap().as_ref(), b"bytecode");
        }
    }

    #[tokio::test]
    async fn test_corrupt_file_is_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSystemCacheStore::open(make_config(dir.path())).await;
        let key = LegacyKey::from("CORRUPT_ME");
        store.put(&key, Bytes::from_static(b"payload bytes"), false).await;

        let path = store.layout().legacy_path(&key).unwrap();
        let mut raw = std::fs::read(&path).unwrap();
        raw[3] ^= 0x01;
        std::fs::write(&path, raw).unwrap();

        assert!(store.get(&key).await.is_none());
        assert!(!path.exists());
        assert!(!store.exists(&key).await);
        assert_eq!(store.usage_stats().stats.corruptions, 1);
    }

    #[tokio::test]
    async fn test_no_temp_files_left() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSystemCacheStore::open(make_config(dir.path())).await;
        let key = LegacyKey::from("TEMP_CHECK");
        store.put(&key, Bytes::from_static(b"x"), false).await;

        let parent = store.layout().legacy_path(&key).unwrap();
        let parent = parent.parent().unwrap();
        let names: Vec<_> = std::fs::read_dir(parent)
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        assert_eq!(names.len(), 1);
        assert!(!StoreLayout::is_temp_file(&names[0]));
    }

    #[tokio::test]
    async fn test_record_with_external_attachment() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = make_config(dir.path());
        config.package_limits = PackageLimits {
            max_inline_value_size: 1024,
            max_record_size: 8 * 1024,
        };
        let store = FileSystemCacheStore::open(config).await;

        let big = Value::from_raw(&noisy(4096, 7));
        let record = CacheRecord::builder(make_key("mesh"))
            .value(Value::from_raw(b"small"))
            .attachment(ValueId::from_name("lod0"), big.clone())
            .unwrap()
            .meta(serde_json::json!({"lods": 1}))
            .build();

        assert!(store.put_record(&record, CachePolicy::DEFAULT).await.is_cached());
        let content = store.layout().content_path(big.raw_hash());
        assert!(content.exists());

        let loaded = store
            .get_record(record.key(), CachePolicy::DEFAULT)
            .await
            .unwrap();
        assert_eq!(loaded, record);

        // Losing the content blob makes the record a miss unless partial
        std::fs::remove_file(&content).unwrap();
        assert!(store
            .get_record(record.key(), CachePolicy::DEFAULT)
            .await
            .is_none());
        let partial = store
            .get_record(record.key(), CachePolicy::DEFAULT | CachePolicy::PARTIAL_RECORD)
            .await
            .unwrap();
        assert!(partial.value().unwrap().has_data());
        assert!(!partial.attachments()[0].1.has_data());
    }

    #[tokio::test]
    async fn test_value_round_trip_and_skip_data() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSystemCacheStore::open(make_config(dir.path())).await;
        let key = make_key("value");
        let value = Value::from_raw(&noisy(200 * 1024, 3));

        assert!(store.put_value(&key, &value, CachePolicy::DEFAULT).await.is_cached());
        assert!(store.layout().content_path(value.raw_hash()).exists());
        assert_eq!(
            store.get_value(&key, CachePolicy::DEFAULT).await.unwrap(),
            value
        );
        let skipped = store
            .get_value(&key, CachePolicy::DEFAULT | CachePolicy::SKIP_DATA)
            .await
            .unwrap();
        assert!(!skipped.has_data());
        assert_eq!(skipped.raw_size(), value.raw_size());
    }

    #[tokio::test]
    async fn test_read_only_store_refuses_writes() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = make_config(dir.path());
        config.read_only = true;
        let store = FileSystemCacheStore::open(config).await;
        assert_eq!(store.access(), StoreAccess::ReadOnly);
        assert_eq!(
            store.put(&"K".into(), Bytes::from_static(b"x"), false).await,
            PutStatus::NotCached
        );
    }

    #[tokio::test]
    async fn test_unusable_root_disables_store() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("not_a_dir");
        std::fs::write(&file, b"x").unwrap();

        let mut config = make_config(&file);
        config.speed_test = true;
        let store = FileSystemCacheStore::open(config).await;
        assert!(store.is_disabled());
        assert!(!store.is_writable());
        assert!(!store.put(&"K".into(), Bytes::from_static(b"x"), false).await.is_cached());
        assert!(store.get(&"K".into()).await.is_none());
    }

    #[tokio::test]
    async fn test_transient_remove_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSystemCacheStore::open(make_config(dir.path())).await;
        let key = LegacyKey::from("KEEP");
        store.put(&key, Bytes::from_static(b"x"), false).await;

        store.remove(&key, true).await;
        assert!(store.exists(&key).await);
        store.remove(&key, false).await;
        assert!(!store.exists(&key).await);
    }

    #[tokio::test]
    async fn test_touch_refreshes_times() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = make_config(dir.path());
        config.touch = true;
        let store = FileSystemCacheStore::open(config).await;
        let key = LegacyKey::from("TOUCHED");
        store.put(&key, Bytes::from_static(b"x"), false).await;

        let path = store.layout().legacy_path(&key).unwrap();
        let old = SystemTime::now() - Duration::from_secs(30 * 24 * 3600);
        set_file_times(&path, old).unwrap();

        assert!(store.exists(&key).await);
        let modified = std::fs::metadata(&path).unwrap().modified().unwrap();
        assert!(modified > old + Duration::from_secs(24 * 3600));
    }

    #[tokio::test]
    async fn test_overlong_legacy_key_not_cached() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSystemCacheStore::open(make_config(dir.path())).await;
        let key = LegacyKey::new("X".repeat(MAX_LEGACY_PATH_LEN + 1));
        assert_eq!(
            store.put(&key, Bytes::from_static(b"x"), false).await,
            PutStatus::NotCached
        );
    }
}
