//! Search index projection
//!
//! Committed changes are mirrored into a [`ProjectionSink`] by a fixed
//! pool of worker threads. Projection is outside the write's atomicity
//! boundary: a failed projection never changes the write's result, it is
//! retried with linear backoff and, once attempts run out, recorded and
//! flagged for a full reindex.
//!
//! A task carries only the id. Workers re-read the document from the
//! primary store while holding the id's stripe lock and write whatever
//! they find (or remove the entry when the id is gone), so tasks for the
//! same id may run in any order and still leave the index matching the
//! primary.

use crate::config::ProjectionConfig;
use crate::error::{EngineError, EngineResult};
use edstore_core::{Document, DocumentId, StripedLocks};
use edstore_search::{IndexError, ProjectionSink};
use edstore_storage::{DocumentRepository, GetOutcome, StoreError};
use parking_lot::{Condvar, Mutex};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Failures kept for inspection; older ones are dropped
const MAX_RECORDED_FAILURES: usize = 100;

/// Documents fetched per scan during a reindex
const REINDEX_PAGE_SIZE: usize = 256;

/// Kind of committed change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// Document inserted or replaced
    Upsert,
    /// Document deleted
    Delete,
}

/// A change that could not be projected
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectionFailure {
    /// Document whose entry may be stale
    pub id: DocumentId,
    /// Last error seen
    pub error: String,
    /// Attempts made
    pub attempts: u32,
}

/// Projector metrics snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectionStats {
    /// Tasks waiting, including ones waiting out a retry delay
    pub queue_depth: usize,
    /// Tasks being applied right now
    pub active_tasks: usize,
    /// Tasks applied successfully
    pub applied: u64,
    /// Failed attempts that were re-queued
    pub retried: u64,
    /// Tasks that ran out of attempts
    pub failed: u64,
    /// Whether the index may have diverged from the primary store
    pub needs_reindex: bool,
    /// Number of worker threads
    pub worker_count: usize,
}

/// Result of a full reindex
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReindexReport {
    /// Documents written to the index
    pub documents: usize,
    /// Documents the sink refused; each one is also recorded as a failure
    pub rejected: usize,
    /// Wall time taken
    pub elapsed: Duration,
}

#[derive(Debug, Error)]
enum RefreshError {
    #[error(transparent)]
    Index(#[from] IndexError),

    #[error("primary read failed: {0}")]
    Store(String),
}

impl From<RefreshError> for EngineError {
    fn from(e: RefreshError) -> Self {
        match e {
            RefreshError::Index(e) => EngineError::Index(e),
            RefreshError::Store(message) => EngineError::Store(StoreError::Engine(message)),
        }
    }
}

struct ProjectionTask {
    id: DocumentId,
    kind: ChangeKind,
    attempt: u32,
    not_before: Instant,
    sequence: u64,
}

impl Eq for ProjectionTask {}

impl PartialEq for ProjectionTask {
    fn eq(&self, other: &Self) -> bool {
        self.not_before == other.not_before && self.sequence == other.sequence
    }
}

// Earliest due first, then lower sequence (older) first
impl Ord for ProjectionTask {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .not_before
            .cmp(&self.not_before)
            .then(other.sequence.cmp(&self.sequence))
    }
}

impl PartialOrd for ProjectionTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct ProjectorInner {
    repository: Arc<dyn DocumentRepository>,
    sink: Arc<dyn ProjectionSink>,
    locks: StripedLocks,
    queue: Mutex<BinaryHeap<ProjectionTask>>,
    work_ready: Condvar,
    drain_cond: Condvar,
    shutdown: AtomicBool,
    sequence: AtomicU64,
    queue_depth: AtomicUsize,
    active_tasks: AtomicUsize,
    applied: AtomicU64,
    retried: AtomicU64,
    failed: AtomicU64,
    needs_reindex: AtomicBool,
    failures: Mutex<VecDeque<ProjectionFailure>>,
    queue_capacity: usize,
    max_attempts: u32,
    retry_backoff: Duration,
}

impl ProjectorInner {
    fn push(&self, id: DocumentId, kind: ChangeKind, attempt: u32, not_before: Instant) {
        let task = ProjectionTask {
            id,
            kind,
            attempt,
            not_before,
            sequence: self.sequence.fetch_add(1, AtomicOrdering::Relaxed),
        };
        {
            let mut queue = self.queue.lock();
            queue.push(task);
            self.queue_depth.fetch_add(1, AtomicOrdering::Release);
        }
        self.work_ready.notify_one();
    }

    /// Make the index entry for `id` match the primary store
    fn refresh(&self, id: &DocumentId) -> Result<bool, RefreshError> {
        let _guard = self.locks.lock(id);
        match self.repository.get_by_id(id) {
            GetOutcome::Success(document) => {
                self.sink.upsert(&document)?;
                Ok(true)
            }
            GetOutcome::NotExists => {
                self.sink.remove(id)?;
                Ok(false)
            }
            GetOutcome::UnknownFailure(message) => Err(RefreshError::Store(message)),
        }
    }

    fn run(&self, task: ProjectionTask) {
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            self.refresh(&task.id)
        }));
        let message = match outcome {
            Ok(Ok(_)) => {
                self.applied.fetch_add(1, AtomicOrdering::Relaxed);
                debug!(target: "edstore::projector", id = %task.id, kind = ?task.kind, "Projected change");
                return;
            }
            Ok(Err(e)) => e.to_string(),
            Err(panic) => format!(
                "projection panicked: {}",
                panic
                    .downcast_ref::<&str>()
                    .copied()
                    .unwrap_or("(non-string panic)")
            ),
        };

        if task.attempt < self.max_attempts {
            self.retried.fetch_add(1, AtomicOrdering::Relaxed);
            warn!(
                target: "edstore::projector",
                id = %task.id,
                attempt = task.attempt,
                error = %message,
                "Projection failed, retrying"
            );
            let delay = self.retry_backoff * task.attempt;
            self.push(task.id, task.kind, task.attempt + 1, Instant::now() + delay);
        } else {
            self.failed.fetch_add(1, AtomicOrdering::Relaxed);
            self.needs_reindex.store(true, AtomicOrdering::Release);
            error!(
                target: "edstore::projector",
                id = %task.id,
                attempts = task.attempt,
                error = %message,
                "Projection abandoned, index needs reindex"
            );
            self.record_failure(task.id, message, task.attempt);
        }
    }

    fn record_failure(&self, id: DocumentId, error: String, attempts: u32) {
        let mut failures = self.failures.lock();
        if failures.len() == MAX_RECORDED_FAILURES {
            failures.pop_front();
        }
        failures.push_back(ProjectionFailure {
            id,
            error,
            attempts,
        });
    }
}

/// Worker pool mirroring committed changes into a sink
pub struct SearchIndexProjector {
    inner: Arc<ProjectorInner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    num_threads: usize,
}

impl SearchIndexProjector {
    /// Start `config.workers` projection threads
    ///
    /// Workers are named `edstore-projector-0`, `edstore-projector-1`, etc.
    pub fn new(
        repository: Arc<dyn DocumentRepository>,
        sink: Arc<dyn ProjectionSink>,
        config: &ProjectionConfig,
    ) -> Self {
        let num_threads = config.workers.max(1);
        let inner = Arc::new(ProjectorInner {
            repository,
            sink,
            locks: StripedLocks::default(),
            queue: Mutex::new(BinaryHeap::new()),
            work_ready: Condvar::new(),
            drain_cond: Condvar::new(),
            shutdown: AtomicBool::new(false),
            sequence: AtomicU64::new(0),
            queue_depth: AtomicUsize::new(0),
            active_tasks: AtomicUsize::new(0),
            applied: AtomicU64::new(0),
            retried: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            needs_reindex: AtomicBool::new(false),
            failures: Mutex::new(VecDeque::new()),
            queue_capacity: config.queue_capacity,
            max_attempts: config.max_attempts.max(1),
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
        });

        let mut workers = Vec::with_capacity(num_threads);
        for i in 0..num_threads {
            let inner_clone = Arc::clone(&inner);
            let handle = std::thread::Builder::new()
                .name(format!("edstore-projector-{}", i))
                .spawn(move || worker_loop(&inner_clone))
                .expect("failed to spawn projection worker thread");
            workers.push(handle);
        }

        Self {
            inner,
            workers: Mutex::new(workers),
            num_threads,
        }
    }

    /// Queue a committed change for projection
    ///
    /// Never blocks and never fails the caller. When the queue is full or
    /// the projector is shut down the change is dropped and the index is
    /// flagged for reindex.
    pub fn on_committed(&self, document: &Document, kind: ChangeKind) {
        if self.inner.shutdown.load(AtomicOrdering::Acquire) {
            self.inner.needs_reindex.store(true, AtomicOrdering::Release);
            warn!(target: "edstore::projector", id = %document.id, "Projector shut down, change dropped");
            return;
        }
        if self.inner.queue_depth.load(AtomicOrdering::Acquire) >= self.inner.queue_capacity {
            self.inner.needs_reindex.store(true, AtomicOrdering::Release);
            warn!(target: "edstore::projector", id = %document.id, "Projection queue full, change dropped");
            return;
        }
        self.inner
            .push(document.id.clone(), kind, 1, Instant::now());
    }

    /// Block until all queued, retrying and in-flight tasks have finished.
    ///
    /// Workers keep running afterwards.
    pub fn drain(&self) {
        let mut queue = self.inner.queue.lock();
        while self.inner.queue_depth.load(AtomicOrdering::Acquire) > 0
            || self.inner.active_tasks.load(AtomicOrdering::Acquire) > 0
        {
            self.inner.drain_cond.wait(&mut queue);
        }
    }

    /// Stop the workers and join them.
    ///
    /// Queued tasks still run, without waiting out retry delays.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, AtomicOrdering::Release);

        // Notify under the queue lock so a worker about to wait cannot miss it
        {
            let _queue = self.inner.queue.lock();
            self.inner.work_ready.notify_all();
        }

        let mut workers = self.workers.lock();
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
    }

    /// Return a snapshot of projector metrics.
    pub fn stats(&self) -> ProjectionStats {
        ProjectionStats {
            queue_depth: self.inner.queue_depth.load(AtomicOrdering::Relaxed),
            active_tasks: self.inner.active_tasks.load(AtomicOrdering::Relaxed),
            applied: self.inner.applied.load(AtomicOrdering::Relaxed),
            retried: self.inner.retried.load(AtomicOrdering::Relaxed),
            failed: self.inner.failed.load(AtomicOrdering::Relaxed),
            needs_reindex: self.inner.needs_reindex.load(AtomicOrdering::Acquire),
            worker_count: self.num_threads,
        }
    }

    /// Most recent abandoned changes, oldest first
    pub fn recent_failures(&self) -> Vec<ProjectionFailure> {
        self.inner.failures.lock().iter().cloned().collect()
    }

    /// Rebuild the sink from the primary store
    ///
    /// Clears the sink, then pages through every stored document. Each
    /// entry is written under the same per-id lock the workers use, so
    /// changes committed during the reindex are not overwritten with older
    /// data. A document the sink refuses is recorded as a failure and
    /// skipped; another reindex would refuse it again.
    ///
    /// # Errors
    ///
    /// Fails if the sink is unavailable or the primary store cannot be
    /// read; the needs-reindex flag is set again in that case.
    pub fn reindex(&self) -> EngineResult<ReindexReport> {
        let started = Instant::now();
        info!(target: "edstore::projector", "Reindex started");
        self.inner.needs_reindex.store(false, AtomicOrdering::Release);
        self.inner.failures.lock().clear();

        match self.rebuild() {
            Ok((documents, rejected)) => {
                let report = ReindexReport {
                    documents,
                    rejected,
                    elapsed: started.elapsed(),
                };
                info!(
                    target: "edstore::projector",
                    documents = report.documents,
                    rejected = report.rejected,
                    elapsed_ms = report.elapsed.as_millis() as u64,
                    "Reindex complete"
                );
                Ok(report)
            }
            Err(e) => {
                self.inner.needs_reindex.store(true, AtomicOrdering::Release);
                error!(target: "edstore::projector", error = %e, "Reindex failed");
                Err(e)
            }
        }
    }

    /// Documents written and documents rejected
    fn rebuild(&self) -> EngineResult<(usize, usize)> {
        self.inner.sink.clear()?;
        let mut after: Option<DocumentId> = None;
        let mut documents = 0;
        let mut rejected = 0;
        loop {
            let page = self
                .inner
                .repository
                .scan(after.as_ref(), REINDEX_PAGE_SIZE)?;
            let Some(last) = page.last() else {
                break;
            };
            after = Some(last.id.clone());
            for document in &page {
                match self.inner.refresh(&document.id) {
                    Ok(true) => documents += 1,
                    Ok(false) => {}
                    Err(RefreshError::Index(e @ IndexError::Rejected { .. })) => {
                        warn!(target: "edstore::projector", id = %document.id, error = %e, "Reindex skipped document");
                        self.inner
                            .record_failure(document.id.clone(), e.to_string(), 1);
                        rejected += 1;
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            if page.len() < REINDEX_PAGE_SIZE {
                break;
            }
        }
        Ok((documents, rejected))
    }
}

impl Drop for SearchIndexProjector {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Decrements `active_tasks` and wakes drain waiters on drop, panics included
struct ActiveTaskGuard<'a> {
    inner: &'a ProjectorInner,
}

impl<'a> Drop for ActiveTaskGuard<'a> {
    fn drop(&mut self) {
        let prev_active = self.inner.active_tasks.fetch_sub(1, AtomicOrdering::Release);
        if prev_active == 1 && self.inner.queue_depth.load(AtomicOrdering::Acquire) == 0 {
            let _queue = self.inner.queue.lock();
            self.inner.drain_cond.notify_all();
        }
    }
}

fn worker_loop(inner: &ProjectorInner) {
    loop {
        let task = {
            let mut queue = inner.queue.lock();
            loop {
                let shutting_down = inner.shutdown.load(AtomicOrdering::Acquire);
                match queue.peek().map(|task| task.not_before) {
                    None if shutting_down => return,
                    None => {
                        inner.work_ready.wait(&mut queue);
                    }
                    Some(due) if !shutting_down && due > Instant::now() => {
                        inner.work_ready.wait_until(&mut queue, due);
                    }
                    Some(_) => {
                        if let Some(task) = queue.pop() {
                            inner.queue_depth.fetch_sub(1, AtomicOrdering::Release);
                            inner.active_tasks.fetch_add(1, AtomicOrdering::Release);
                            break task;
                        }
                    }
                }
            }
        };

        let _guard = ActiveTaskGuard { inner };
        inner.run(task);
    }
}
