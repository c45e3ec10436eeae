//! Background Executor
//!
//! Fire-and-forget tasks (backfills, cascades, async puts) run here. The
//! executor bounds how many run at once and tracks how many are pending so
//! callers can wait for quiescence.
//!
//! Every task carries a [`Priority`]. When all slots are busy, waiting tasks
//! are admitted highest priority first, in submission order within one
//! priority. A task runs with its priority as the ambient request priority
//! (see [`current_priority`]), so work it schedules in turn can be placed
//! below it.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{oneshot, Notify};
use tracing::trace;

/// Default number of background tasks allowed to run concurrently
pub const DEFAULT_MAX_CONCURRENCY: usize = 64;

// =============================================================================
// Priority
// =============================================================================

/// Request priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize)]
pub enum Priority {
    Lowest,
    Low,
    #[default]
    Normal,
    High,
    Highest,
    /// The caller is waiting; requests run to completion even if cancelled
    Blocking,
}

impl Priority {
    /// One level down, saturating at `Lowest`
    pub fn lower(self) -> Priority {
        match self {
            Priority::Blocking => Priority::Highest,
            Priority::Highest => Priority::High,
            Priority::High => Priority::Normal,
            Priority::Normal => Priority::Low,
            Priority::Low | Priority::Lowest => Priority::Lowest,
        }
    }
}

tokio::task_local! {
    static CURRENT_PRIORITY: Priority;
}

/// Priority of the request being served by the current task
///
/// `Normal` outside any prioritized scope.
pub fn current_priority() -> Priority {
    CURRENT_PRIORITY.try_with(|p| *p).unwrap_or_default()
}

/// Run `task` with `priority` as the ambient request priority
pub async fn with_priority<F: Future>(priority: Priority, task: F) -> F::Output {
    CURRENT_PRIORITY.scope(priority, task).await
}

// =============================================================================
// Admission
// =============================================================================

struct Waiter {
    priority: Priority,
    seq: u64,
    admit: oneshot::Sender<()>,
}

impl PartialEq for Waiter {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for Waiter {}

impl PartialOrd for Waiter {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Waiter {
    // Max-heap: higher priority first, then earlier submission
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct GateState {
    running: usize,
    next_seq: u64,
    waiting: BinaryHeap<Waiter>,
}

/// Concurrency limit with priority-ordered admission
struct Gate {
    slots: usize,
    state: Mutex<GateState>,
}

impl Gate {
    /// Take a slot now or join the queue
    fn ticket(self: &Arc<Self>, priority: Priority) -> Ticket {
        let mut state = self.state.lock();
        if state.running < self.slots && state.waiting.is_empty() {
            state.running += 1;
            return Ticket {
                gate: Arc::clone(self),
                queued: None,
                admitted: true,
            };
        }
        let (admit, queued) = oneshot::channel();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.waiting.push(Waiter {
            priority,
            seq,
            admit,
        });
        Ticket {
            gate: Arc::clone(self),
            queued: Some(queued),
            admitted: false,
        }
    }

    /// Hand a finished slot to the best waiter, or free it
    fn release(&self) {
        let mut state = self.state.lock();
        while let Some(waiter) = state.waiting.pop() {
            if waiter.admit.send(()).is_ok() {
                return;
            }
        }
        state.running -= 1;
    }
}

/// A place in the gate; holds the slot once admitted
struct Ticket {
    gate: Arc<Gate>,
    queued: Option<oneshot::Receiver<()>>,
    admitted: bool,
}

impl Ticket {
    async fn admitted(&mut self) {
        if let Some(queued) = self.queued.as_mut() {
            self.admitted = queued.await.is_ok();
            self.queued = None;
        }
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        if self.admitted {
            self.gate.release();
        } else if let Some(mut queued) = self.queued.take() {
            // Admitted after the task was abandoned
            queued.close();
            if queued.try_recv().is_ok() {
                self.gate.release();
            }
        }
    }
}

// =============================================================================
// Executor
// =============================================================================

/// Bounded spawner for background work
#[derive(Clone)]
pub struct BackgroundExecutor {
    inner: Arc<ExecutorInner>,
}

struct ExecutorInner {
    gate: Arc<Gate>,
    pending: AtomicUsize,
    completed: AtomicU64,
    idle: Notify,
}

impl BackgroundExecutor {
    /// Create an executor with the default concurrency
    pub fn new() -> Self {
        Self::with_concurrency(DEFAULT_MAX_CONCURRENCY)
    }

    /// Create an executor running at most `max_concurrency` tasks at once
    pub fn with_concurrency(max_concurrency: usize) -> Self {
        Self {
            inner: Arc::new(ExecutorInner {
                gate: Arc::new(Gate {
                    slots: max_concurrency.max(1),
                    state: Mutex::new(GateState::default()),
                }),
                pending: AtomicUsize::new(0),
                completed: AtomicU64::new(0),
                idle: Notify::new(),
            }),
        }
    }

    /// Spawn a task at the current request priority
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<F>(&self, label: &'static str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.spawn_at(label, current_priority(), task);
    }

    /// Spawn a task at `priority`; it runs to completion even if the caller
    /// goes away
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn_at<F>(&self, label: &'static str, priority: Priority, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let guard = PendingGuard::new(&self.inner);
        let mut ticket = self.inner.gate.ticket(priority);
        tokio::spawn(async move {
            ticket.admitted().await;
            trace!("Running background task {} at {:?}", label, priority);
            with_priority(priority, task).await;
            drop(ticket);
            drop(guard);
        });
    }

    /// Count `task` as pending until it finishes or is dropped, without
    /// spawning it or taking a concurrency slot
    pub fn track<F>(&self, task: F) -> impl Future<Output = F::Output>
    where
        F: Future,
    {
        let guard = PendingGuard::new(&self.inner);
        async move {
            let output = task.await;
            drop(guard);
            output
        }
    }

    /// Number of tasks spawned but not finished
    pub fn pending(&self) -> usize {
        self.inner.pending.load(Ordering::Acquire)
    }

    /// Number of tasks finished since creation
    pub fn completed(&self) -> u64 {
        self.inner.completed.load(Ordering::Relaxed)
    }

    /// Wait until no task is pending
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.pending() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Keeps a task counted as pending while alive
struct PendingGuard {
    inner: Arc<ExecutorInner>,
}

impl PendingGuard {
    fn new(inner: &Arc<ExecutorInner>) -> Self {
        inner.pending.fetch_add(1, Ordering::AcqRel);
        Self {
            inner: Arc::clone(inner),
        }
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.inner.completed.fetch_add(1, Ordering::Relaxed);
        if self.inner.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.inner.idle.notify_waiters();
        }
    }
}

impl Default for BackgroundExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for BackgroundExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundExecutor")
            .field("pending", &self.pending())
            .field("completed", &self.completed())
            .finish()
    }
}
