//! Graph Builder
//!
//! Turns a validated [`GraphConfig`] into live backends. Nodes are built
//! depth first from the root and memoized, so a node referenced twice is
//! one shared backend.
//!
//! File system nodes are always wrapped in a key length limiter (and a
//! throttle when `LatencyMS` or `MaxBytesPerSecond` is set), and get a
//! maintainer when `DeleteUnused` is on. A read pak that fails to open is
//! left out of the graph with a warning.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use tracing::{debug, info, warn};

use super::config::{GraphConfig, NodeConfig, NodeType};
use crate::backend::key_length::DEFAULT_MAX_KEY_LENGTH;
use crate::backend::{
    AsyncPutWrapper, BackgroundExecutor, CacheBackend, CacheStoreMaintainer, FileSystemCacheStore,
    FileSystemConfig, HierarchicalBackend, LimitKeyLengthWrapper, MaintainerConfig,
    MemoryCacheConfig, MemoryCacheStore, PakConfig, PakFileStore, SharedBackend, SpeedClass,
    ThrottleWrapper, VerifyWrapper,
};
use crate::error::{Error, Result};

const MB: u64 = 1024 * 1024;

/// Assembled backend graph
pub struct CacheGraph {
    root: SharedBackend,
    hierarchy: Option<Arc<HierarchicalBackend>>,
    maintainers: Vec<Arc<CacheStoreMaintainer>>,
    nodes: HashMap<String, SharedBackend>,
    executor: BackgroundExecutor,
}

impl CacheGraph {
    /// Graph made of a single backend
    pub fn from_root(root: SharedBackend, executor: BackgroundExecutor) -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(root.name().to_ascii_lowercase(), Arc::clone(&root));
        Self {
            root,
            hierarchy: None,
            maintainers: Vec::new(),
            nodes,
            executor,
        }
    }

    /// Graph whose root is a hierarchy
    pub fn from_hierarchy(hierarchy: Arc<HierarchicalBackend>) -> Self {
        let executor = hierarchy.executor().clone();
        let mut graph = Self::from_root(hierarchy.clone(), executor);
        graph.hierarchy = Some(hierarchy);
        graph
    }

    pub fn root(&self) -> &SharedBackend {
        &self.root
    }

    /// The hierarchy archives are mounted into
    pub fn hierarchy(&self) -> Option<&Arc<HierarchicalBackend>> {
        self.hierarchy.as_ref()
    }

    pub fn maintainers(&self) -> &[Arc<CacheStoreMaintainer>] {
        &self.maintainers
    }

    /// Backend built for a node, by node name
    pub fn node(&self, name: &str) -> Option<&SharedBackend> {
        self.nodes.get(&name.to_ascii_lowercase())
    }

    pub fn executor(&self) -> &BackgroundExecutor {
        &self.executor
    }

    /// Wake every maintainer for an immediate pass
    pub fn boost_maintenance(&self) {
        for maintainer in &self.maintainers {
            maintainer.boost_priority();
        }
    }

    /// Stop maintainers, drain background work and shut every backend down
    pub async fn shutdown(&self) {
        for maintainer in &self.maintainers {
            maintainer.cancel();
        }
        self.root.shutdown().await;
    }
}

/// Builder for [`CacheGraph`]
pub struct GraphBuilder {
    config: GraphConfig,
    base_dir: Option<PathBuf>,
    overrides: HashMap<String, PathBuf>,
    executor: BackgroundExecutor,
    maintainer: MaintainerConfig,
    start_maintainers: bool,
    speed_test: bool,
}

impl GraphBuilder {
    pub fn new(config: GraphConfig) -> Self {
        Self {
            config,
            base_dir: None,
            overrides: HashMap::new(),
            executor: BackgroundExecutor::new(),
            maintainer: MaintainerConfig::default(),
            start_maintainers: true,
            speed_test: true,
        }
    }

    /// Resolve relative paths against `dir`
    pub fn base_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.base_dir = Some(dir.into());
        self
    }

    /// Path used by nodes declaring `CommandLineOverride=<name>`
    pub fn path_override(mut self, name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.overrides
            .insert(name.into().to_ascii_lowercase(), path.into());
        self
    }

    pub fn executor(mut self, executor: BackgroundExecutor) -> Self {
        self.executor = executor;
        self
    }

    /// Template for maintainer settings not given per node
    pub fn maintainer_config(mut self, config: MaintainerConfig) -> Self {
        self.maintainer = config;
        self
    }

    /// Create maintainers without starting them
    pub fn start_maintainers(mut self, start: bool) -> Self {
        self.start_maintainers = start;
        self
    }

    /// Run startup speed tests on file system nodes
    pub fn speed_test(mut self, enabled: bool) -> Self {
        self.speed_test = enabled;
        self
    }

    /// Build every node reachable from the root
    pub async fn build(self) -> Result<CacheGraph> {
        let mut state = BuildState::default();
        let root_name = self.config.root().to_string();
        let root = self
            .build_node(&root_name, &mut state)
            .await?
            .ok_or_else(|| Error::Config(format!("root node '{}' has no usable backend", root_name)))?;

        let hierarchy = self.find_hierarchy(&state);
        info!(
            "Built cache graph with root '{}' ({} nodes, {} maintainers)",
            root.name(),
            state.nodes.len(),
            state.maintainers.len()
        );
        Ok(CacheGraph {
            root,
            hierarchy,
            maintainers: state.maintainers,
            nodes: state
                .nodes
                .into_iter()
                .filter_map(|(k, v)| v.map(|backend| (k, backend)))
                .collect(),
            executor: self.executor.clone(),
        })
    }

    /// First hierarchy reached breadth first from the root
    fn find_hierarchy(&self, state: &BuildState) -> Option<Arc<HierarchicalBackend>> {
        let mut queue = std::collections::VecDeque::from([self.config.root().to_string()]);
        while let Some(name) = queue.pop_front() {
            let key = name.to_ascii_lowercase();
            if let Some(hierarchy) = state.hierarchies.get(&key) {
                return Some(Arc::clone(hierarchy));
            }
            if let Some(node) = self.config.node(&name) {
                queue.extend(node.inner.iter().cloned());
            }
        }
        None
    }

    fn build_node<'a>(
        &'a self,
        name: &'a str,
        state: &'a mut BuildState,
    ) -> BoxFuture<'a, Result<Option<SharedBackend>>> {
        async move {
            let key = name.to_ascii_lowercase();
            if let Some(built) = state.nodes.get(&key) {
                return Ok(built.clone());
            }
            let node = self
                .config
                .node(name)
                .ok_or_else(|| Error::Config(format!("unknown node '{}'", name)))?
                .clone();

            let built = match node.node_type {
                NodeType::FileSystem => Some(self.build_filesystem(&node, state).await?),
                NodeType::Memory => Some(self.build_memory(&node, false).await?),
                NodeType::Boot => Some(self.build_memory(&node, true).await?),
                NodeType::ReadPak => self.build_read_pak(&node).await?,
                NodeType::WritePak => Some(self.build_write_pak(&node).await?),
                NodeType::Hierarchical => {
                    let mut tiers = Vec::with_capacity(node.inner.len());
                    for inner in &node.inner {
                        if let Some(tier) = self.build_node(inner, state).await? {
                            tiers.push(tier);
                        }
                    }
                    let hierarchy = Arc::new(HierarchicalBackend::new(
                        node.name.clone(),
                        tiers,
                        self.executor.clone(),
                    ));
                    state.hierarchies.insert(key.clone(), Arc::clone(&hierarchy));
                    Some(hierarchy as SharedBackend)
                }
                NodeType::AsyncPut | NodeType::Verify | NodeType::KeyLength => {
                    match self.build_node(&node.inner[0], state).await? {
                        Some(inner) => Some(self.wrap(&node, inner)?),
                        None => None,
                    }
                }
            };

            if built.is_none() {
                debug!("Node '{}' produced no backend", node.name);
            }
            state.nodes.insert(key, built.clone());
            Ok(built)
        }
        .boxed()
    }

    fn wrap(&self, node: &NodeConfig, inner: SharedBackend) -> Result<SharedBackend> {
        let wrapped: SharedBackend = match node.node_type {
            NodeType::AsyncPut => Arc::new(AsyncPutWrapper::new(
                node.name.clone(),
                inner,
                self.executor.clone(),
            )),
            NodeType::Verify => Arc::new(VerifyWrapper::new(
                node.name.clone(),
                inner,
                node.bool_param("Fix", false)?,
            )),
            NodeType::KeyLength => Arc::new(LimitKeyLengthWrapper::new(
                node.name.clone(),
                inner,
                node.u64_param("Length", DEFAULT_MAX_KEY_LENGTH as u64)? as usize,
            )),
            other => {
                return Err(Error::Internal(format!("{} is not a wrapper type", other)));
            }
        };
        Ok(wrapped)
    }

    /// Root path of a file system node after overrides
    fn resolve_path(&self, node: &NodeConfig) -> Result<PathBuf> {
        if let Some(var) = node.param("EnvPathOverride") {
            if let Ok(value) = std::env::var(var) {
                if !value.is_empty() {
                    info!("{}: path overridden by environment variable {}", node.name, var);
                    return Ok(self.absolute(Path::new(&value)));
                }
            }
        }
        if let Some(name) = node.param("CommandLineOverride") {
            if let Some(path) = self.overrides.get(&name.to_ascii_lowercase()) {
                info!("{}: path overridden by command line ({})", node.name, name);
                return Ok(self.absolute(path));
            }
        }
        Ok(self.absolute(Path::new(node.require("Path")?)))
    }

    fn absolute(&self, path: &Path) -> PathBuf {
        match &self.base_dir {
            Some(base) if path.is_relative() => base.join(path),
            _ => path.to_path_buf(),
        }
    }

    async fn build_filesystem(&self, node: &NodeConfig, state: &mut BuildState) -> Result<SharedBackend> {
        let defaults = FileSystemConfig::default();
        let force_speed_class = match node.param("ForceSpeedClass") {
            Some(value) => Some(SpeedClass::parse(value).ok_or_else(|| {
                Error::Config(format!("node '{}': unknown speed class '{}'", node.name, value))
            })?),
            None => None,
        };
        let config = FileSystemConfig {
            name: node.name.clone(),
            path: self.resolve_path(node)?,
            read_only: node.bool_param("ReadOnly", false)?,
            touch: node.bool_param("Touch", false)?,
            purge_transient: node.bool_param("PurgeTransient", false)?,
            remote: node.bool_param("Remote", false)?,
            speed_test: self.speed_test && node.bool_param("SpeedTest", true)?,
            force_speed_class,
            backfill_lower_cache_levels: node.bool_param("BackfillLowerCacheLevels", true)?,
            delete_unused: node.bool_param("DeleteUnused", defaults.delete_unused)?,
            unused_file_age: node.days_param("UnusedFileAge", defaults.unused_file_age)?,
            max_file_checks_per_sec: node.u64_param("MaxFileChecksPerSec", defaults.max_file_checks_per_sec)?,
            ..defaults
        };
        let latency = Duration::from_millis(node.u64_param("LatencyMS", 0)?);
        let max_bytes_per_sec = node.u64_param("MaxBytesPerSecond", 0)?;
        let max_key_length = node.u64_param("MaxKeyLength", DEFAULT_MAX_KEY_LENGTH as u64)? as usize;

        let store = FileSystemCacheStore::open(config).await;
        let config = store.config();
        if config.delete_unused && !config.read_only && !store.is_disabled() {
            let maintainer_config = MaintainerConfig {
                max_file_age: config.unused_file_age,
                max_scan_rate: config.max_file_checks_per_sec,
                ..self.maintainer.clone()
            };
            let maintainer =
                CacheStoreMaintainer::new(node.name.clone(), config.path.clone(), maintainer_config);
            if self.start_maintainers {
                maintainer.start();
            }
            state.maintainers.push(maintainer);
        }

        let mut backend: SharedBackend = Arc::new(store);
        if !latency.is_zero() || max_bytes_per_sec > 0 {
            backend = Arc::new(ThrottleWrapper::new(
                format!("{}.Throttle", node.name),
                backend,
                latency,
                max_bytes_per_sec,
            ));
        }
        Ok(Arc::new(LimitKeyLengthWrapper::new(
            format!("{}.KeyLength", node.name),
            backend,
            max_key_length,
        )))
    }

    async fn build_memory(&self, node: &NodeConfig, boot: bool) -> Result<SharedBackend> {
        let config = MemoryCacheConfig {
            name: node.name.clone(),
            max_cache_size: node.u64_param("MaxCacheSize", 0)? * MB,
            boot_filename: if boot {
                Some(self.absolute(Path::new(node.require("Filename")?)))
            } else {
                None
            },
            backfill_lower_cache_levels: node.bool_param("BackfillLowerCacheLevels", true)?,
        };
        let store = if boot {
            MemoryCacheStore::open_boot(config).await
        } else {
            MemoryCacheStore::with_config(config)
        };
        Ok(Arc::new(store))
    }

    async fn build_read_pak(&self, node: &NodeConfig) -> Result<Option<SharedBackend>> {
        let config = PakConfig::new(node.name.clone(), self.absolute(Path::new(node.require("Filename")?)));
        match PakFileStore::open(config).await {
            Ok(pak) => Ok(Some(Arc::new(pak))),
            Err(e) => {
                warn!("{}: skipping read pak: {}", node.name, e);
                Ok(None)
            }
        }
    }

    async fn build_write_pak(&self, node: &NodeConfig) -> Result<SharedBackend> {
        let config = PakConfig {
            compressed: node.bool_param("Compressed", false)?,
            ..PakConfig::new(node.name.clone(), self.absolute(Path::new(node.require("Filename")?)))
        };
        Ok(Arc::new(PakFileStore::create(config).await?))
    }
}

#[derive(Default)]
struct BuildState {
    nodes: HashMap<String, Option<SharedBackend>>,
    hierarchies: HashMap<String, Arc<HierarchicalBackend>>,
    maintainers: Vec<Arc<CacheStoreMaintainer>>,
}
