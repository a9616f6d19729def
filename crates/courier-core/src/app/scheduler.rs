//! Scheduler - 受付・キャンセル・照会・シャットダウン
//!
//! # ロック順序
//! `dispatch` → store の順でのみ取得する。どちらも `.await` を跨いで保持しない。
//!
//! # シャットダウン
//! 1. 受付停止（以降の submit は `ShuttingDown`）
//! 2. `drain_timeout` まで通常どおり処理を続ける
//! 3. 残った非終端タスクを `Cancelled(ShutdownTimeout)` にしてワーカーを止める

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::config::{ConfigError, SchedulerConfig};
use super::dispatch::DispatchQueues;
use super::retry::RetryPolicy;
use super::status::StateCounts;
use super::{gc_loop, worker_loop};
use crate::domain::{CancelReason, SchedulerError, Task, TaskId, TaskState};
use crate::ports::task_store::TaskFilter;
use crate::ports::{Clock, TaskStore, UploadExecutor};
use crate::store::{TaskRecord, TaskSnapshot};

/// What `shutdown` did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// Every admitted task finished before the deadline.
    pub drained: bool,

    /// Tasks forced to `Cancelled(ShutdownTimeout)`.
    pub cancelled: Vec<TaskId>,
}

/// Mutable dispatch state, guarded by one mutex.
pub(crate) struct DispatchState {
    pub(crate) queues: DispatchQueues,

    /// Cancellation token per non-terminal task. Attempts run on a child.
    pub(crate) tokens: HashMap<TaskId, CancellationToken>,

    pub(crate) accepting: bool,
}

/// State shared between the handle and the background loops.
pub(crate) struct Inner {
    pub(crate) config: SchedulerConfig,
    pub(crate) retry: RetryPolicy,
    pub(crate) store: Arc<dyn TaskStore>,
    pub(crate) executor: Arc<dyn UploadExecutor>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) dispatch: Mutex<DispatchState>,

    /// Queue content or running slots changed.
    pub(crate) work_ready: Notify,

    /// A task reached a terminal state.
    pub(crate) settled: Notify,

    /// Hard stop for workers and the GC loop.
    pub(crate) stop: CancellationToken,
}

impl Inner {
    pub(crate) fn lock_dispatch(&self) -> MutexGuard<'_, DispatchState> {
        self.dispatch.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Evicts terminal records older than the retention window.
    pub(crate) fn evict_expired(&self) -> Vec<TaskId> {
        let Some(retention) = self.config.retention() else {
            return Vec::new();
        };
        let Ok(retention) = chrono::Duration::from_std(retention) else {
            return Vec::new();
        };
        let Some(cutoff) = self.clock.now().checked_sub_signed(retention) else {
            return Vec::new();
        };
        self.store.evict_terminal(cutoff)
    }
}

/// Handle to a running scheduler.
///
/// Dropping the handle without calling [`Scheduler::shutdown`] stops the
/// workers without touching task state.
pub struct Scheduler {
    inner: Arc<Inner>,
    loops: Mutex<Vec<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl Scheduler {
    /// Validates `config` and spawns the worker pool and the GC loop.
    ///
    /// Must be called from inside a tokio runtime.
    pub fn start(
        config: SchedulerConfig,
        store: Arc<dyn TaskStore>,
        executor: Arc<dyn UploadExecutor>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let inner = Arc::new(Inner {
            retry: config.retry_policy(),
            dispatch: Mutex::new(DispatchState {
                queues: DispatchQueues::new(config.per_device_limit),
                tokens: HashMap::new(),
                accepting: true,
            }),
            config,
            store,
            executor,
            clock,
            work_ready: Notify::new(),
            settled: Notify::new(),
            stop: CancellationToken::new(),
        });

        let mut loops = Vec::with_capacity(inner.config.workers + 1);
        for worker_id in 0..inner.config.workers {
            let inner = Arc::clone(&inner);
            loops.push(tokio::spawn(worker_loop::run(worker_id, inner)));
        }
        if inner.config.retention().is_some() {
            loops.push(tokio::spawn(gc_loop::run(Arc::clone(&inner))));
        }

        tracing::info!(
            workers = inner.config.workers,
            per_device_limit = inner.config.per_device_limit,
            "scheduler started"
        );

        Ok(Self {
            inner,
            loops: Mutex::new(loops),
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// The backing store, for lazy listing.
    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.inner.store
    }

    /// Admits `task` into its device queue. Never waits for a worker.
    pub fn submit(&self, task: Task) -> Result<TaskId, SchedulerError> {
        if task.device_id().is_empty() {
            return Err(SchedulerError::invalid("device_id must not be empty"));
        }
        if task.payload_ref().is_empty() {
            return Err(SchedulerError::invalid("payload_ref must not be empty"));
        }
        if task.max_attempts() == Some(0) {
            return Err(SchedulerError::invalid("max_attempts must be at least 1"));
        }

        let config = &self.inner.config;
        let task = task.with_defaults(config.default_max_attempts, config.attempt_timeout());
        let max_attempts = task.max_attempts().unwrap_or(config.default_max_attempts);

        let now = self.inner.clock.now();
        let gate = task
            .not_before()
            .and_then(|at| (at - now).to_std().ok())
            .filter(|d| !d.is_zero())
            .map(|d| Instant::now() + d);

        let id = task.id();
        let device = task.device_id().clone();
        let record = TaskRecord::new(task, max_attempts, now).with_gate(gate);

        {
            let mut dispatch = self.inner.lock_dispatch();
            if !dispatch.accepting {
                return Err(SchedulerError::ShuttingDown);
            }
            self.inner.store.insert(record)?;
            dispatch.tokens.insert(id, CancellationToken::new());
            dispatch.queues.push(device.clone(), id);
        }
        self.inner.work_ready.notify_waiters();

        tracing::info!(task_id = %id, device = %device, max_attempts, "task queued");
        Ok(id)
    }

    /// Cancels a task.
    ///
    /// Queued tasks become `Cancelled` immediately. For a running task the
    /// attempt's token is signalled and the worker commits the transition.
    pub fn cancel(&self, id: TaskId) -> Result<(), SchedulerError> {
        loop {
            let state = self.inner.store.readiness(id)?.state;
            match state {
                s if s.is_terminal() => {
                    return Err(SchedulerError::AlreadyTerminal { id, state: s });
                }
                TaskState::Queued => {
                    let mut dispatch = self.inner.lock_dispatch();
                    match self.inner.store.compare_and_swap(
                        id,
                        TaskState::Queued,
                        TaskState::Cancelled,
                        &mut |r| r.cancel_reason = Some(CancelReason::Requested),
                    ) {
                        Ok(_) => {
                            dispatch.tokens.remove(&id);
                            drop(dispatch);
                            self.inner.settled.notify_waiters();
                            tracing::info!(task_id = %id, "queued task cancelled");
                            return Ok(());
                        }
                        // Claimed in the meantime; look again.
                        Err(SchedulerError::StateConflict { .. }) => continue,
                        Err(e) => return Err(e),
                    }
                }
                _ => {
                    // Completion also runs under the dispatch lock, so a
                    // Running state seen here is still current.
                    let dispatch = self.inner.lock_dispatch();
                    if self.inner.store.readiness(id)?.state != TaskState::Running {
                        continue;
                    }
                    if let Some(token) = dispatch.tokens.get(&id) {
                        token.cancel();
                    }
                    tracing::info!(task_id = %id, "cancellation signalled to running attempt");
                    return Ok(());
                }
            }
        }
    }

    pub fn status(&self, id: TaskId) -> Result<TaskSnapshot, SchedulerError> {
        self.inner.store.get(id)
    }

    pub fn list(&self, filter: TaskFilter) -> Vec<TaskSnapshot> {
        self.inner.store.list(filter).collect()
    }

    pub fn counts(&self) -> StateCounts {
        self.inner.store.counts()
    }

    /// Runs one retention sweep now. The GC loop does this periodically.
    pub fn evict_expired(&self) -> Vec<TaskId> {
        self.inner.evict_expired()
    }

    /// Stops accepting work and drains for up to `drain_timeout`.
    ///
    /// Whatever is still queued or running afterwards ends as
    /// `Cancelled(ShutdownTimeout)`. Only the first call does anything.
    pub async fn shutdown(&self, drain_timeout: Duration) -> ShutdownReport {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return ShutdownReport::default();
        }

        self.inner.lock_dispatch().accepting = false;
        tracing::info!(drain_timeout_ms = drain_timeout.as_millis() as u64, "shutdown started");

        let drained = self.drain(drain_timeout).await;
        // stop より先に: ワーカー側の Stopped が先に書くと report から漏れる
        let cancelled = self.cancel_remaining();
        self.inner.stop.cancel();

        let loops = std::mem::take(&mut *self.loops.lock().unwrap_or_else(|e| e.into_inner()));
        for handle in loops {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "background loop ended abnormally");
            }
        }

        tracing::info!(drained, cancelled = cancelled.len(), "shutdown complete");
        ShutdownReport { drained, cancelled }
    }

    async fn drain(&self, drain_timeout: Duration) -> bool {
        let deadline = Instant::now() + drain_timeout;
        loop {
            let settled = self.inner.settled.notified();
            tokio::pin!(settled);
            settled.as_mut().enable();

            if self.inner.store.counts().active() == 0 {
                return true;
            }
            tokio::select! {
                _ = &mut settled => {}
                _ = tokio::time::sleep_until(deadline) => {
                    return self.inner.store.counts().active() == 0;
                }
            }
        }
    }

    /// Forces every non-terminal task to `Cancelled(ShutdownTimeout)`.
    fn cancel_remaining(&self) -> Vec<TaskId> {
        let mut dispatch = self.inner.lock_dispatch();
        dispatch.queues.clear_queues();

        let active: Vec<TaskSnapshot> = self.inner.store.list(TaskFilter::active()).collect();
        let mut cancelled = Vec::with_capacity(active.len());
        for snapshot in active {
            let id = snapshot.id();
            let result = self.inner.store.compare_and_swap(
                id,
                snapshot.state,
                TaskState::Cancelled,
                &mut |r| r.cancel_reason = Some(CancelReason::ShutdownTimeout),
            );
            match result {
                Ok(_) => {
                    if let Some(token) = dispatch.tokens.remove(&id) {
                        token.cancel();
                    }
                    tracing::warn!(task_id = %id, from = ?snapshot.state, "cancelled at shutdown");
                    cancelled.push(id);
                }
                Err(e) => tracing::debug!(task_id = %id, error = %e, "shutdown cancel skipped"),
            }
        }
        cancelled
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.inner.stop.cancel();
    }
}
