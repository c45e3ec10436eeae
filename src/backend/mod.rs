//! Cache Backends
//!
//! Every store and decorator of the derived data cache implements
//! [`CacheBackend`]. Backends compose into a graph:
//!
//! ```text
//!                     ┌──────────────────────┐
//!      request ──────▶│  HierarchicalBackend │
//!                     └──────────┬───────────┘
//!            fastest first       │
//!        ┌───────────────┬───────┴────────┬─────────────────┐
//!        ▼               ▼                ▼                 ▼
//!   ┌─────────┐   ┌─────────────┐  ┌────────────┐   ┌──────────────┐
//!   │ Memory  │   │ LimitKeyLen │  │  PakFile   │   │   AsyncPut   │
//!   └─────────┘   │  Throttle   │  │ (read-only)│   │   (remote)   │
//!                 │  FileSystem │  └────────────┘   └──────────────┘
//!                 └─────────────┘
//! ```
//!
//! Backends never return errors: every failure degrades to a miss for reads
//! and to [`PutStatus::NotCached`] for writes.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;

use crate::key::{CacheKey, LegacyKey};
use crate::record::{CachePolicy, CacheRecord, Value};

pub mod async_put;
pub mod executor;
pub mod filesystem;
pub mod hierarchical;
pub mod key_length;
pub mod maintainer;
pub mod memory;
pub mod pak;
pub mod stats;
pub mod throttle;
pub mod trailer;
pub mod verify;

pub use async_put::AsyncPutWrapper;
pub use executor::{current_priority, with_priority, BackgroundExecutor, Priority};
pub use filesystem::{FileSystemCacheStore, FileSystemConfig, SpeedThresholds};
pub use hierarchical::{FillStats, HierarchicalBackend};
pub use key_length::LimitKeyLengthWrapper;
pub use maintainer::{CacheStoreMaintainer, MaintainerConfig, MaintainerStats};
pub use memory::{MemoryCacheConfig, MemoryCacheStore};
pub use pak::{PakConfig, PakFileStore, PakMode};
pub use stats::{BackendStats, StatsSnapshot, UsageStats};
pub use throttle::ThrottleWrapper;
pub use verify::VerifyWrapper;

/// Shared handle to any backend
pub type SharedBackend = Arc<dyn CacheBackend>;

// =============================================================================
// Classification
// =============================================================================

/// Coarse latency classification assigned to a backend at startup
///
/// Variants are ordered from slowest to fastest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum SpeedClass {
    /// Not measured or probe failed
    Unknown,
    /// High latency, typically remote
    Slow,
    /// Moderate latency
    Ok,
    /// Low latency
    Fast,
    /// Local disk or memory
    Local,
}

impl SpeedClass {
    /// True for `Fast` and `Local`
    pub fn is_fast(self) -> bool {
        self >= SpeedClass::Fast
    }

    pub fn name(self) -> &'static str {
        match self {
            SpeedClass::Unknown => "unknown",
            SpeedClass::Slow => "slow",
            SpeedClass::Ok => "ok",
            SpeedClass::Fast => "fast",
            SpeedClass::Local => "local",
        }
    }

    /// Parse a configuration value (case-insensitive)
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "unknown" => Some(SpeedClass::Unknown),
            "slow" => Some(SpeedClass::Slow),
            "ok" => Some(SpeedClass::Ok),
            "fast" => Some(SpeedClass::Fast),
            "local" => Some(SpeedClass::Local),
            _ => None,
        }
    }
}

impl std::fmt::Display for SpeedClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Backend implementation type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum BackendKind {
    Memory,
    FileSystem,
    Pak,
    Hierarchical,
    AsyncPut,
    Throttle,
    Verify,
    LimitKeyLength,
    Remote,
}

impl BackendKind {
    pub fn name(self) -> &'static str {
        match self {
            BackendKind::Memory => "memory",
            BackendKind::FileSystem => "filesystem",
            BackendKind::Pak => "pak",
            BackendKind::Hierarchical => "hierarchical",
            BackendKind::AsyncPut => "async_put",
            BackendKind::Throttle => "throttle",
            BackendKind::Verify => "verify",
            BackendKind::LimitKeyLength => "key_length",
            BackendKind::Remote => "remote",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Outcome of a write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutStatus {
    /// The data is stored (or was already present)
    Cached,
    /// The write was skipped or failed
    NotCached,
}

impl PutStatus {
    pub fn is_cached(self) -> bool {
        self == PutStatus::Cached
    }
}

// =============================================================================
// Backend Trait
// =============================================================================

/// Capability implemented by every store and decorator
///
/// Legacy operations address flat string keys; structured operations address
/// records and values by [`CacheKey`] and honour a [`CachePolicy`].
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Node name from the graph configuration
    fn name(&self) -> &str;

    /// Implementation type
    fn kind(&self) -> BackendKind;

    /// Speed classification
    fn speed_class(&self) -> SpeedClass;

    /// Returns true if writes can succeed
    fn is_writable(&self) -> bool;

    /// Returns true if the tier answers to the `*_REMOTE` policy bits
    fn is_remote(&self) -> bool {
        false
    }

    /// Returns true if hits in this tier may be cascaded into slower tiers
    fn backfill_lower_cache_levels(&self) -> bool;

    /// Returns true for immutable archives that are authoritative for their
    /// contents
    fn is_read_only_archive(&self) -> bool {
        false
    }

    /// Usage statistics of this node and everything below it
    fn usage_stats(&self) -> UsageStats;

    /// Returns true if data exists for a legacy key
    async fn exists(&self, key: &LegacyKey) -> bool;

    /// Fetch data for a legacy key
    async fn get(&self, key: &LegacyKey) -> Option<Bytes>;

    /// Store data for a legacy key
    async fn put(&self, key: &LegacyKey, data: Bytes, put_even_if_exists: bool) -> PutStatus;

    /// Remove a legacy key; transient removes only affect non-persistent tiers
    async fn remove(&self, key: &LegacyKey, transient: bool);

    /// Fetch a record
    async fn get_record(&self, key: &CacheKey, policy: CachePolicy) -> Option<CacheRecord>;

    /// Store a record
    async fn put_record(&self, record: &CacheRecord, policy: CachePolicy) -> PutStatus;

    /// Fetch a standalone value
    async fn get_value(&self, key: &CacheKey, policy: CachePolicy) -> Option<Value>;

    /// Store a standalone value
    async fn put_value(&self, key: &CacheKey, value: &Value, policy: CachePolicy) -> PutStatus;

    /// Wait for background work started by this node to finish
    async fn flush(&self) {}

    /// Release resources; the backend is not used afterwards
    async fn shutdown(&self) {}
}

/// Policy that only asks whether a record exists
pub(crate) fn probe_policy() -> CachePolicy {
    CachePolicy::QUERY | CachePolicy::SKIP_DATA | CachePolicy::SKIP_META | CachePolicy::PARTIAL_RECORD
}
