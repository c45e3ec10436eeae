//! Cache Store Maintainer
//!
//! Background garbage collector bound to one file system store. It deletes
//! files unused for longer than a configured age and removes directories
//! once they are empty.
//!
//! # Scanning
//!
//! ```text
//!   Idle ──tick/boost──▶ Scanning ──pass done──▶ Idle
//! ```
//!
//! A pass visits every root (content, each bucket, legacy digits) in random
//! order. Inside a root the shallow sharded directories are walked in a
//! pseudo-random order produced by a linear congruential generator, rather
//! than in lexical order. Throughput is capped at `max_scan_rate` paths per
//! second unless the priority is boosted. Cancellation is checked before
//! every delete and every directory descent.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use super::filesystem::StoreLayout;

/// Scan frequencies at or above this mean "scan once and stop"
pub const SCAN_ONCE_THRESHOLD: Duration = Duration::from_secs(1_000_000);

// =============================================================================
// Configuration
// =============================================================================

/// Maintainer configuration
#[derive(Debug, Clone)]
pub struct MaintainerConfig {
    /// Files unused for longer than this are deleted
    pub max_file_age: Duration,
    /// Paths examined per second, zero for unlimited
    pub max_scan_rate: u64,
    /// Time between passes
    pub scan_frequency: Duration,
    /// Delay before the first pass
    pub time_to_wait_after_init: Duration,
    /// Remove directories found empty
    pub delete_empty_dirs: bool,
}

impl Default for MaintainerConfig {
    fn default() -> Self {
        Self {
            max_file_age: Duration::from_secs(15 * 24 * 3600),
            max_scan_rate: 1000,
            scan_frequency: Duration::from_secs(3600),
            time_to_wait_after_init: Duration::from_secs(60),
            delete_empty_dirs: true,
        }
    }
}

impl MaintainerConfig {
    /// True if the maintainer stops after a single pass
    pub fn scan_once(&self) -> bool {
        self.scan_frequency >= SCAN_ONCE_THRESHOLD
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Maintainer counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct MaintainerStats {
    pub files_scanned: u64,
    pub files_deleted: u64,
    pub bytes_deleted: u64,
    pub dirs_scanned: u64,
    pub dirs_deleted: u64,
    pub passes: u64,
    pub last_pass: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct Counters {
    files_scanned: AtomicU64,
    files_deleted: AtomicU64,
    bytes_deleted: AtomicU64,
    dirs_scanned: AtomicU64,
    dirs_deleted: AtomicU64,
    passes: AtomicU64,
}

/// Maintainer activity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaintainerState {
    Idle,
    Scanning,
}

// =============================================================================
// Pseudo-random order
// =============================================================================

/// Visits `0..len` exactly once in pseudo-random order
///
/// A full-period LCG over the next power of two, skipping values >= `len`.
pub(crate) struct RandomOrder {
    len: u64,
    mask: u64,
    multiplier: u64,
    increment: u64,
    state: u64,
    emitted: u64,
}

impl RandomOrder {
    pub(crate) fn new(len: usize, seed: u64) -> Self {
        let modulus = (len as u64).max(1).next_power_of_two();
        let mask = modulus - 1;
        Self {
            len: len as u64,
            mask,
            // Hull-Dobell: a = 1 mod 4 and c odd give a full period
            multiplier: ((seed >> 16) & mask & !3) | 1,
            increment: (seed >> 32) | 1,
            state: seed & mask,
            emitted: 0,
        }
    }
}

impl Iterator for RandomOrder {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        while self.emitted < self.len {
            self.state = self
                .multiplier
                .wrapping_mul(self.state)
                .wrapping_add(self.increment)
                & self.mask;
            if self.state < self.len {
                self.emitted += 1;
                return Some(self.state as usize);
            }
        }
        None
    }
}

// =============================================================================
// Maintainer
// =============================================================================

/// One directory tree swept by the maintainer
#[derive(Debug, Clone)]
struct ScanRoot {
    path: PathBuf,
    /// Directory levels above the files
    depth: usize,
    /// Only descend into single-digit directories at the top level
    digits_only: bool,
}

struct DirEntry {
    name: String,
    path: PathBuf,
    is_dir: bool,
}

/// Scan throttle
struct Pacer {
    rate: u64,
    start: Instant,
    count: u64,
}

/// Background garbage collector for one store
pub struct CacheStoreMaintainer {
    name: String,
    layout: StoreLayout,
    config: MaintainerConfig,
    token: CancellationToken,
    boost: AtomicBool,
    wake: Notify,
    scanning: AtomicBool,
    finished: AtomicBool,
    idle: Notify,
    counters: Counters,
    last_pass: Mutex<Option<DateTime<Utc>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl CacheStoreMaintainer {
    /// Create a maintainer for the store rooted at `root`
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>, config: MaintainerConfig) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            layout: StoreLayout::new(root),
            config,
            token: CancellationToken::new(),
            boost: AtomicBool::new(false),
            wake: Notify::new(),
            scanning: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            idle: Notify::new(),
            counters: Counters::default(),
            last_pass: Mutex::new(None),
            task: Mutex::new(None),
        })
    }

    /// Spawn the background loop
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock();
        if task.is_none() {
            *task = Some(tokio::spawn(Arc::clone(self).run()));
        }
    }

    /// Run the maintenance loop until cancelled or done
    #[instrument(skip(self), fields(name = %self.name))]
    pub async fn run(self: Arc<Self>) {
        info!(
            "Starting cache maintainer for {} (max age {:?}, rate {}/s)",
            self.layout.root().display(),
            self.config.max_file_age,
            self.config.max_scan_rate
        );

        if !self.config.time_to_wait_after_init.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(self.config.time_to_wait_after_init) => {}
                _ = self.wake.notified() => {}
                _ = self.token.cancelled() => {
                    self.finish();
                    return;
                }
            }
        }

        loop {
            self.scanning.store(true, Ordering::Release);
            let completed = self.scan_pass().await;
            let boosted = self.boost.swap(false, Ordering::AcqRel);
            self.scanning.store(false, Ordering::Release);
            self.idle.notify_waiters();

            if !completed || self.token.is_cancelled() {
                info!("Cache maintainer shutting down");
                break;
            }
            if boosted || self.config.scan_once() {
                info!("Cache maintainer finished");
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.scan_frequency) => {}
                _ = self.wake.notified() => {}
                _ = self.token.cancelled() => {
                    info!("Cache maintainer shutting down");
                    break;
                }
            }
        }
        self.finish();
    }

    fn finish(&self) {
        self.finished.store(true, Ordering::Release);
        self.idle.notify_waiters();
    }

    /// Scan every root once; returns false if cancelled
    pub async fn scan_pass(&self) -> bool {
        let mut roots = self.collect_roots().await;
        roots.shuffle(&mut rand::thread_rng());

        let mut pacer = Pacer {
            rate: self.config.max_scan_rate,
            start: Instant::now(),
            count: 0,
        };
        let deleted_before = self.counters.files_deleted.load(Ordering::Relaxed);

        for root in &roots {
            if self.token.is_cancelled() {
                return false;
            }
            debug!("Scanning {}", root.path.display());
            let seed = rand::random::<u64>();
            if !self
                .scan_dir(&root.path, root.depth, root.digits_only, seed, &mut pacer)
                .await
            {
                return false;
            }
        }

        self.counters.passes.fetch_add(1, Ordering::Relaxed);
        *self.last_pass.lock() = Some(Utc::now());
        info!(
            "Cache maintenance pass over {} finished: {} files deleted",
            self.layout.root().display(),
            self.counters.files_deleted.load(Ordering::Relaxed) - deleted_before
        );
        true
    }

    async fn collect_roots(&self) -> Vec<ScanRoot> {
        let mut roots = vec![ScanRoot {
            path: self.layout.content_root(),
            depth: 2,
            digits_only: false,
        }];
        if let Ok(mut entries) = tokio::fs::read_dir(self.layout.buckets_root()).await {
            while let Ok(Some(entry)) = entries.next_entry().await {
                if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                    roots.push(ScanRoot {
                        path: entry.path(),
                        depth: 2,
                        digits_only: false,
                    });
                }
            }
        }
        roots.push(ScanRoot {
            path: self.layout.root().to_path_buf(),
            depth: 3,
            digits_only: true,
        });
        roots
    }

    fn scan_dir<'a>(
        &'a self,
        dir: &'a Path,
        depth: usize,
        digits_only: bool,
        seed: u64,
        pacer: &'a mut Pacer,
    ) -> BoxFuture<'a, bool> {
        async move {
            let entries = match list_dir(dir).await {
                Ok(entries) => entries,
                Err(e) => {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        debug!("Skipping {}: {}", dir.display(), e);
                    }
                    return true;
                }
            };

            let now = SystemTime::now();
            for idx in RandomOrder::new(entries.len(), seed) {
                let entry = &entries[idx];
                if !self.pace(pacer).await {
                    return false;
                }

                if entry.is_dir {
                    if depth == 0 || (digits_only && !is_digit_dir(&entry.name)) {
                        continue;
                    }
                    self.counters.dirs_scanned.fetch_add(1, Ordering::Relaxed);
                    if self.token.is_cancelled() {
                        return false;
                    }
                    let child_seed = seed.rotate_left(7) ^ idx as u64;
                    if !self
                        .scan_dir(&entry.path, depth - 1, false, child_seed, pacer)
                        .await
                    {
                        return false;
                    }
                    if self.config.delete_empty_dirs && tokio::fs::remove_dir(&entry.path).await.is_ok() {
                        debug!("Removed empty directory {}", entry.path.display());
                        self.counters.dirs_deleted.fetch_add(1, Ordering::Relaxed);
                    }
                } else if depth == 0 {
                    self.counters.files_scanned.fetch_add(1, Ordering::Relaxed);
                    let Ok(meta) = tokio::fs::metadata(&entry.path).await else {
                        continue;
                    };
                    if !self.is_expired(&meta, now) {
                        continue;
                    }
                    if self.token.is_cancelled() {
                        return false;
                    }
                    match tokio::fs::remove_file(&entry.path).await {
                        Ok(()) => {
                            debug!("Deleted unused file {}", entry.path.display());
                            self.counters.files_deleted.fetch_add(1, Ordering::Relaxed);
                            self.counters
                                .bytes_deleted
                                .fetch_add(meta.len(), Ordering::Relaxed);
                        }
                        Err(e) => debug!("Failed to delete {}: {}", entry.path.display(), e),
                    }
                }
            }
            true
        }
        .boxed()
    }

    /// Both modification and access time older than the maximum age
    fn is_expired(&self, meta: &std::fs::Metadata, now: SystemTime) -> bool {
        let age = |time: std::io::Result<SystemTime>| {
            time.ok()
                .map(|t| now.duration_since(t).unwrap_or(Duration::ZERO))
        };
        let Some(modified) = age(meta.modified()) else {
            return false;
        };
        let accessed = age(meta.accessed()).unwrap_or(modified);
        modified > self.config.max_file_age && accessed > self.config.max_file_age
    }

    /// Sleep to honour the scan rate; returns false if cancelled
    async fn pace(&self, pacer: &mut Pacer) -> bool {
        pacer.count += 1;
        if pacer.rate == 0 || self.boost.load(Ordering::Acquire) {
            return !self.token.is_cancelled();
        }
        let due = pacer.start + Duration::from_secs_f64(pacer.count as f64 / pacer.rate as f64);
        if due > Instant::now() {
            tokio::select! {
                _ = tokio::time::sleep_until(due.into()) => {}
                _ = self.token.cancelled() => return false,
            }
        }
        !self.token.is_cancelled()
    }

    /// Scan now, ignoring the rate cap, and stop after the pass
    pub fn boost_priority(&self) {
        info!("Boosting cache maintenance for {}", self.layout.root().display());
        self.boost.store(true, Ordering::Release);
        self.wake.notify_one();
    }

    /// Stop the maintainer at the next file or directory boundary
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Current activity
    pub fn state(&self) -> MaintainerState {
        if self.scanning.load(Ordering::Acquire) {
            MaintainerState::Scanning
        } else {
            MaintainerState::Idle
        }
    }

    /// True if no pass is running or requested
    pub fn is_idle(&self) -> bool {
        self.finished.load(Ordering::Acquire)
            || (!self.scanning.load(Ordering::Acquire) && !self.boost.load(Ordering::Acquire))
    }

    /// True once the background loop has exited
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Wait until no pass is running or requested
    pub async fn wait_for_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }

    /// Name of the store this maintainer serves
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get statistics
    pub fn stats(&self) -> MaintainerStats {
        MaintainerStats {
            files_scanned: self.counters.files_scanned.load(Ordering::Relaxed),
            files_deleted: self.counters.files_deleted.load(Ordering::Relaxed),
            bytes_deleted: self.counters.bytes_deleted.load(Ordering::Relaxed),
            dirs_scanned: self.counters.dirs_scanned.load(Ordering::Relaxed),
            dirs_deleted: self.counters.dirs_deleted.load(Ordering::Relaxed),
            passes: self.counters.passes.load(Ordering::Relaxed),
            last_pass: *self.last_pass.lock(),
        }
    }
}

impl Drop for CacheStoreMaintainer {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Entries of a directory sorted by name
async fn list_dir(dir: &Path) -> std::io::Result<Vec<DirEntry>> {
    let mut entries = Vec::new();
    let mut read = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = read.next_entry().await? {
        let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
        entries.push(DirEntry {
            name: entry.file_name().to_string_lossy().into_owned(),
            path: entry.path(),
            is_dir,
        });
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}

fn is_digit_dir(name: &str) -> bool {
    name.len() == 1 && name.as_bytes()[0].is_ascii_digit()
}

// =============================================================================
// Tests
// =============================================================================
