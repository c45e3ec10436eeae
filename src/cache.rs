//! Cache Façade
//!
//! Entry point for callers. Wraps an assembled [`CacheGraph`] and offers:
//!
//! - batched record and value requests returning [`CacheTask`] handles
//! - legacy key access
//! - blocking variants for callers outside the runtime
//! - administration (pak mounting, maintenance, stats, shutdown)
//!
//! ```text
//!   caller ──► Cache ──► RequestOwner (priority, cancellation, task count)
//!                 │
//!                 └──► graph root ──► tiers ...
//! ```
//!
//! Requests never fail with an error: a miss or a skipped write is reported
//! as [`Status::Error`], a cancelled request as [`Status::Canceled`].

use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use futures::future::join_all;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub use crate::backend::executor::Priority;

use crate::backend::{
    BackgroundExecutor, MaintainerStats, PakConfig, PakFileStore, PutStatus, SharedBackend,
    UsageStats,
};
use crate::error::{Error, Result};
use crate::graph::{CacheGraph, GraphBuilder, GraphConfig};
use crate::key::{CacheKey, LegacyKey};
use crate::record::{CachePolicy, CacheRecord, Value};

/// Concurrent request batches in flight across all owners
pub const DEFAULT_REQUEST_CONCURRENCY: usize = 256;

// =============================================================================
// Request Ownership
// =============================================================================

/// Outcome of one request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Status {
    Ok,
    /// Miss or skipped write
    Error,
    Canceled,
}

/// Groups requests for cancellation and waiting
#[derive(Clone)]
pub struct RequestOwner {
    inner: Arc<OwnerInner>,
}

struct OwnerInner {
    priority: Priority,
    token: CancellationToken,
    tasks: BackgroundExecutor,
}

impl RequestOwner {
    pub fn new(priority: Priority) -> Self {
        Self {
            inner: Arc::new(OwnerInner {
                priority,
                token: CancellationToken::new(),
                tasks: BackgroundExecutor::new(),
            }),
        }
    }

    pub fn priority(&self) -> Priority {
        self.inner.priority
    }

    pub fn token(&self) -> &CancellationToken {
        &self.inner.token
    }

    /// Cancel outstanding requests
    ///
    /// Gets still running respond `Canceled`; puts already started complete.
    pub fn cancel(&self) {
        self.inner.token.cancel();
    }

    pub fn is_canceled(&self) -> bool {
        self.inner.token.is_cancelled() && self.inner.priority != Priority::Blocking
    }

    /// Number of request batches not yet answered
    pub fn pending(&self) -> usize {
        self.inner.tasks.pending()
    }

    /// Wait for every batch submitted by this owner
    pub async fn wait(&self) {
        self.inner.tasks.wait_idle().await;
    }

    /// Run `lookup` unless the owner is cancelled first
    async fn run_cancellable<T>(&self, lookup: impl Future<Output = T>) -> Option<T> {
        if self.is_canceled() {
            return None;
        }
        if self.inner.priority == Priority::Blocking {
            return Some(lookup.await);
        }
        tokio::select! {
            result = lookup => Some(result),
            _ = self.inner.token.cancelled() => None,
        }
    }
}

impl Default for RequestOwner {
    fn default() -> Self {
        Self::new(Priority::Normal)
    }
}

/// Handle to a submitted request batch
pub struct CacheTask<T> {
    rx: oneshot::Receiver<T>,
}

impl<T> CacheTask<T> {
    /// Wait for the responses
    pub async fn wait(self) -> Result<T> {
        self.rx
            .await
            .map_err(|_| Error::Internal("request task ended without responding".to_string()))
    }

    /// Wait from outside the runtime
    ///
    /// Panics if called from within an async context.
    pub fn wait_blocking(self) -> Result<T> {
        self.rx
            .blocking_recv()
            .map_err(|_| Error::Internal("request task ended without responding".to_string()))
    }
}

// =============================================================================
// Requests
// =============================================================================

#[derive(Debug, Clone)]
pub struct GetRequest {
    /// Caller label for logging
    pub name: String,
    pub key: CacheKey,
    pub policy: CachePolicy,
    pub user_data: u64,
}

#[derive(Debug, Clone)]
pub struct GetResponse {
    pub name: String,
    pub key: CacheKey,
    pub record: Option<CacheRecord>,
    pub user_data: u64,
    pub status: Status,
}

#[derive(Debug, Clone)]
pub struct PutRequest {
    pub name: String,
    pub record: CacheRecord,
    pub policy: CachePolicy,
    pub user_data: u64,
}

#[derive(Debug, Clone)]
pub struct PutResponse {
    pub name: String,
    pub key: CacheKey,
    pub user_data: u64,
    pub status: Status,
}

#[derive(Debug, Clone)]
pub struct GetValueRequest {
    pub name: String,
    pub key: CacheKey,
    pub policy: CachePolicy,
    pub user_data: u64,
}

#[derive(Debug, Clone)]
pub struct GetValueResponse {
    pub name: String,
    pub key: CacheKey,
    pub value: Option<Value>,
    pub user_data: u64,
    pub status: Status,
}

#[derive(Debug, Clone)]
pub struct PutValueRequest {
    pub name: String,
    pub key: CacheKey,
    pub value: Value,
    pub policy: CachePolicy,
    pub user_data: u64,
}

fn put_status(status: PutStatus) -> Status {
    if status.is_cached() {
        Status::Ok
    } else {
        Status::Error
    }
}

// =============================================================================
// Cache
// =============================================================================

/// Top-level cache handle
pub struct Cache {
    graph: CacheGraph,
    handle: Handle,
    tasks: BackgroundExecutor,
}

impl Cache {
    /// Wrap an assembled graph; request tasks are spawned on `handle`
    pub fn new(graph: CacheGraph, handle: Handle) -> Self {
        info!("Cache ready with root '{}'", graph.root().name());
        Self {
            graph,
            handle,
            tasks: BackgroundExecutor::with_concurrency(DEFAULT_REQUEST_CONCURRENCY),
        }
    }

    /// Parse and build a graph, then wrap it
    ///
    /// Uses the current runtime.
    pub async fn from_config_str(text: &str) -> Result<Self> {
        let graph = GraphBuilder::new(GraphConfig::parse(text)?).build().await?;
        Ok(Self::new(graph, Handle::current()))
    }

    pub fn graph(&self) -> &CacheGraph {
        &self.graph
    }

    fn root(&self) -> SharedBackend {
        Arc::clone(self.graph.root())
    }

    /// Spawn `work` on behalf of `owner`
    fn submit<T, F>(&self, owner: &RequestOwner, label: &'static str, work: F) -> CacheTask<T>
    where
        T: Send + 'static,
        F: Future<Output = T> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let tracked = owner.inner.tasks.track(work);
        let _runtime = self.handle.enter();
        // Fills triggered by the request queue one level below this
        self.tasks.spawn_at(label, owner.priority(), async move {
            // The receiver may have been dropped; nobody is waiting then
            let _ = tx.send(tracked.await);
        });
        CacheTask { rx }
    }

    // =========================================================================
    // Records and values
    // =========================================================================

    /// Look up records
    pub fn get(&self, owner: &RequestOwner, requests: Vec<GetRequest>) -> CacheTask<Vec<GetResponse>> {
        let root = self.root();
        let request_owner = owner.clone();
        self.submit(owner, "get", async move {
            join_all(requests.into_iter().map(|request| {
                let root = Arc::clone(&root);
                let owner = request_owner.clone();
                async move {
                    let found = owner
                        .run_cancellable(root.get_record(&request.key, request.policy))
                        .await;
                    let (record, status) = match found {
                        None => (None, Status::Canceled),
                        Some(Some(record)) => (Some(record), Status::Ok),
                        Some(None) => (None, Status::Error),
                    };
                    debug!("get {} ({}): {:?}", request.key, request.name, status);
                    GetResponse {
                        name: request.name,
                        key: request.key,
                        record,
                        user_data: request.user_data,
                        status,
                    }
                }
            }))
            .await
        })
    }

    /// Store records
    pub fn put(&self, owner: &RequestOwner, requests: Vec<PutRequest>) -> CacheTask<Vec<PutResponse>> {
        let root = self.root();
        let request_owner = owner.clone();
        self.submit(owner, "put", async move {
            join_all(requests.into_iter().map(|request| {
                let root = Arc::clone(&root);
                let owner = request_owner.clone();
                async move {
                    // A started write is never abandoned half way
                    let status = if owner.is_canceled() {
                        Status::Canceled
                    } else {
                        put_status(root.put_record(&request.record, request.policy).await)
                    };
                    debug!("put {} ({}): {:?}", request.record.key(), request.name, status);
                    PutResponse {
                        name: request.name,
                        key: request.record.key().clone(),
                        user_data: request.user_data,
                        status,
                    }
                }
            }))
            .await
        })
    }

    /// Look up standalone values
    pub fn get_value(
        &self,
        owner: &RequestOwner,
        requests: Vec<GetValueRequest>,
    ) -> CacheTask<Vec<GetValueResponse>> {
        let root = self.root();
        let request_owner = owner.clone();
        self.submit(owner, "get_value", async move {
            join_all(requests.into_iter().map(|request| {
                let root = Arc::clone(&root);
                let owner = request_owner.clone();
                async move {
                    let found = owner
                        .run_cancellable(root.get_value(&request.key, request.policy))
                        .await;
                    let (value, status) = match found {
                        None => (None, Status::Canceled),
                        Some(Some(value)) => (Some(value), Status::Ok),
                        Some(None) => (None, Status::Error),
                    };
                    GetValueResponse {
                        name: request.name,
                        key: request.key,
                        value,
                        user_data: request.user_data,
                        status,
                    }
                }
            }))
            .await
        })
    }

    /// Store standalone values
    pub fn put_value(
        &self,
        owner: &RequestOwner,
        requests: Vec<PutValueRequest>,
    ) -> CacheTask<Vec<PutResponse>> {
        let root = self.root();
        let request_owner = owner.clone();
        self.submit(owner, "put_value", async move {
            join_all(requests.into_iter().map(|request| {
                let root = Arc::clone(&root);
                let owner = request_owner.clone();
                async move {
                    let status = if owner.is_canceled() {
                        Status::Canceled
                    } else {
                        put_status(root.put_value(&request.key, &request.value, request.policy).await)
                    };
                    PutResponse {
                        name: request.name,
                        key: request.key,
                        user_data: request.user_data,
                        status,
                    }
                }
            }))
            .await
        })
    }

    pub fn get_blocking(&self, owner: &RequestOwner, requests: Vec<GetRequest>) -> Result<Vec<GetResponse>> {
        self.get(owner, requests).wait_blocking()
    }

    pub fn put_blocking(&self, owner: &RequestOwner, requests: Vec<PutRequest>) -> Result<Vec<PutResponse>> {
        self.put(owner, requests).wait_blocking()
    }

    pub fn get_value_blocking(
        &self,
        owner: &RequestOwner,
        requests: Vec<GetValueRequest>,
    ) -> Result<Vec<GetValueResponse>> {
        self.get_value(owner, requests).wait_blocking()
    }

    pub fn put_value_blocking(
        &self,
        owner: &RequestOwner,
        requests: Vec<PutValueRequest>,
    ) -> Result<Vec<PutResponse>> {
        self.put_value(owner, requests).wait_blocking()
    }

    // =========================================================================
    // Legacy keys
    // =========================================================================

    pub async fn get_legacy(&self, key: &LegacyKey) -> Option<Bytes> {
        self.graph.root().get(key).await
    }

    pub async fn put_legacy(&self, key: &LegacyKey, data: Bytes) -> PutStatus {
        self.graph.root().put(key, data, false).await
    }

    pub async fn exists_legacy(&self, key: &LegacyKey) -> bool {
        self.graph.root().exists(key).await
    }

    pub async fn remove_legacy(&self, key: &LegacyKey, transient: bool) {
        self.graph.root().remove(key, transient).await
    }

    /// Must not be called from inside the runtime
    pub fn get_legacy_blocking(&self, key: &LegacyKey) -> Option<Bytes> {
        self.handle.block_on(self.get_legacy(key))
    }

    /// Must not be called from inside the runtime
    pub fn put_legacy_blocking(&self, key: &LegacyKey, data: Bytes) -> PutStatus {
        self.handle.block_on(self.put_legacy(key, data))
    }

    /// Must not be called from inside the runtime
    pub fn exists_legacy_blocking(&self, key: &LegacyKey) -> bool {
        self.handle.block_on(self.exists_legacy(key))
    }

    // =========================================================================
    // Administration
    // =========================================================================

    /// Mount a read-only pak archive into the hierarchy
    ///
    /// The archive is registered under its path, which is also the name used
    /// to unmount it.
    pub async fn mount_pak(&self, path: impl AsRef<Path>) -> Result<()> {
        let hierarchy = self
            .graph
            .hierarchy()
            .ok_or_else(|| Error::Config("the cache graph has no hierarchy to mount into".to_string()))?;
        let path = path.as_ref();
        let pak = PakFileStore::open(PakConfig::new(path.display().to_string(), path)).await?;
        hierarchy.mount(Arc::new(pak), None)
    }

    /// Unmount an archive mounted with [`Cache::mount_pak`]
    pub fn unmount_pak(&self, path: impl AsRef<Path>) -> bool {
        self.graph
            .hierarchy()
            .and_then(|h| h.unmount(&path.as_ref().display().to_string()))
            .is_some()
    }

    /// Start a maintenance pass on every store now
    pub fn boost_maintenance(&self) {
        self.graph.boost_maintenance();
    }

    pub fn maintenance_stats(&self) -> Vec<(String, MaintainerStats)> {
        self.graph
            .maintainers()
            .iter()
            .map(|m| (m.name().to_string(), m.stats()))
            .collect()
    }

    pub fn usage_stats(&self) -> UsageStats {
        self.graph.root().usage_stats()
    }

    /// Wait until no request and no background write is pending
    pub async fn wait_for_quiescence(&self) {
        self.tasks.wait_idle().await;
        self.graph.root().flush().await;
    }

    /// Drain outstanding work and shut every backend down
    pub async fn shutdown(&self) {
        self.wait_for_quiescence().await;
        self.graph.shutdown().await;
        info!("Cache shut down");
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{
        BackgroundExecutor, CacheBackend, HierarchicalBackend, MemoryCacheStore, PakMode,
    };
    use crate::backend::throttle::ThrottleWrapper;
    use assert_matches::assert_matches;
    use std::time::Duration;

    fn memory_cache() -> Cache {
        let graph = CacheGraph::from_root(
            Arc::new(MemoryCacheStore::new("mem")),
            BackgroundExecutor::new(),
        );
        Cache::new(graph, Handle::current())
    }

    fn record(seed: &[u8]) -> CacheRecord {
        CacheRecord::builder(CacheKey::from_content("Facade", seed).unwrap())
            .value(Value::from_raw(seed))
            .build()
    }

    fn get_request(key: &CacheKey) -> GetRequest {
        GetRequest {
            name: "test".to_string(),
            key: key.clone(),
            policy: CachePolicy::DEFAULT,
            user_data: 7,
        }
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let cache = memory_cache();
        let owner = RequestOwner::default();
        let record = record(b"first");

        let put = cache
            .put(
                &owner,
                vec![PutRequest {
                    name: "test".to_string(),
                    record: record.clone(),
                    policy: CachePolicy::DEFAULT,
                    user_data: 1,
                }],
            )
            .wait()
            .await
            .unwrap();
        assert_eq!(put[0].status, Status::Ok);

        let missing = CacheKey::from_content("Facade", b"missing").unwrap();
        let got = cache
            .get(&owner, vec![get_request(record.key()), get_request(&missing)])
            .wait()
            .await
            .unwrap();
        assert_eq!(got[0].status, Status::Ok);
        assert_eq!(got[0].record.as_ref().unwrap(), &record);
        assert_eq!(got[0].user_data, 7);
        assert_eq!(got[1].status, Status::Error);
        assert!(got[1].record.is_none());
    }

    #[tokio::test]
    async fn test_values() {
        let cache = memory_cache();
        let owner = RequestOwner::default();
        let key = CacheKey::from_content("Facade", b"value").unwrap();
        let value = Value::from_raw(b"value");

        let put = cache
            .put_value(
                &owner,
                vec![PutValueRequest {
                    name: "v".to_string(),
                    key: key.clone(),
                    value: value.clone(),
                    policy: CachePolicy::DEFAULT,
                    user_data: 0,
                }],
            )
            .wait()
            .await
            .unwrap();
        assert_eq!(put[0].status, Status::Ok);

        let got = cache
            .get_value(
                &owner,
                vec![GetValueRequest {
                    name: "v".to_string(),
                    key,
                    policy: CachePolicy::DEFAULT,
                    user_data: 0,
                }],
            )
            .wait()
            .await
            .unwrap();
        assert_eq!(got[0].value.as_ref().unwrap(), &value);
    }

    #[tokio::test]
    async fn test_cancelled_owner() {
        let cache = memory_cache();
        let owner = RequestOwner::new(Priority::Normal);
        owner.cancel();
        let record = record(b"cancelled");

        let put = cache
            .put(
                &owner,
                vec![PutRequest {
                    name: "test".to_string(),
                    record: record.clone(),
                    policy: CachePolicy::DEFAULT,
                    user_data: 0,
                }],
            )
            .wait()
            .await
            .unwrap();
        assert_eq!(put[0].status, Status::Canceled);

        let got = cache.get(&owner, vec![get_request(record.key())]).wait().await.unwrap();
        assert_eq!(got[0].status, Status::Canceled);

        // Blocking owners ignore cancellation
        let blocking = RequestOwner::new(Priority::Blocking);
        blocking.cancel();
        let got = cache.get(&blocking, vec![get_request(record.key())]).wait().await.unwrap();
        assert_eq!(got[0].status, Status::Error);
    }

    #[tokio::test]
    async fn test_cancel_in_flight_get() {
        let slow: SharedBackend = Arc::new(ThrottleWrapper::new(
            "slow",
            Arc::new(MemoryCacheStore::new("mem")),
            Duration::from_secs(30),
            0,
        ));
        let cache = Cache::new(
            CacheGraph::from_root(slow, BackgroundExecutor::new()),
            Handle::current(),
        );
        let owner = RequestOwner::default();
        let task = cache.get(&owner, vec![get_request(record(b"slow").key())]);
        assert_eq!(owner.pending(), 1);

        tokio::time::sleep(Duration::from_millis(20)).await;
        owner.cancel();
        let got = tokio::time::timeout(Duration::from_secs(5), task.wait())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got[0].status, Status::Canceled);
        owner.wait().await;
        assert_eq!(owner.pending(), 0);
    }

    #[tokio::test]
    async fn test_legacy_api() {
        let cache = memory_cache();
        let key = LegacyKey::from("Legacy");
        assert!(!cache.exists_legacy(&key).await);
        assert!(cache.put_legacy(&key, Bytes::from_static(b"old")).await.is_cached());
        assert_eq!(cache.get_legacy(&key).await.unwrap().as_ref(), b"old");
        cache.remove_legacy(&key, false).await;
        assert!(cache.get_legacy(&key).await.is_none());
    }

    #[test]
    fn test_blocking_api() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let cache = runtime.block_on(Cache::from_config_str("Root=(Type=Memory)")).unwrap();
        let owner = RequestOwner::default();
        let record = record(b"blocking");

        let put = cache
            .put_blocking(
                &owner,
                vec![PutRequest {
                    name: "b".to_string(),
                    record: record.clone(),
                    policy: CachePolicy::DEFAULT,
                    user_data: 0,
                }],
            )
            .unwrap();
        assert_eq!(put[0].status, Status::Ok);
        let got = cache.get_blocking(&owner, vec![get_request(record.key())]).unwrap();
        assert_eq!(got[0].status, Status::Ok);

        let key = LegacyKey::from("BlockingLegacy");
        assert!(cache.put_legacy_blocking(&key, Bytes::from_static(b"b")).is_cached());
        assert!(cache.exists_legacy_blocking(&key));
        assert_eq!(cache.get_legacy_blocking(&key).unwrap().as_ref(), b"b");
    }

    #[tokio::test]
    async fn test_mount_and_unmount_pak() {
        let dir = tempfile::tempdir().unwrap();
        let pak_path = dir.path().join("archive.pak");
        let key = LegacyKey::from("Archived");
        {
            let pak = PakFileStore::create(PakConfig::new("writer", &pak_path)).await.unwrap();
            assert_eq!(pak.mode(), PakMode::Write);
            pak.put(&key, Bytes::from_static(b"archived"), false).await;
            pak.close().await.unwrap();
        }

        let hierarchy = Arc::new(HierarchicalBackend::new(
            "root",
            vec![Arc::new(MemoryCacheStore::new("mem")) as SharedBackend],
            BackgroundExecutor::new(),
        ));
        let cache = Cache::new(CacheGraph::from_hierarchy(hierarchy), Handle::current());
        assert!(cache.get_legacy(&key).await.is_none());

        cache.mount_pak(&pak_path).await.unwrap();
        assert_eq!(cache.get_legacy(&key).await.unwrap().as_ref(), b"archived");
        assert!(cache.unmount_pak(&pak_path));
        assert!(!cache.unmount_pak(&pak_path));

        assert_matches!(cache.mount_pak(dir.path().join("missing.pak")).await, Err(_));
        cache.shutdown().await;
    }

    #[tokio::test]
    async fn test_mount_requires_hierarchy() {
        let cache = memory_cache();
        assert_matches!(cache.mount_pak("any.pak").await, Err(Error::Config(_)));
    }
}
