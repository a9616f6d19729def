//! WorkerLoop - タスク実行ループ
//!
//! # フロー
//! 1. dispatch から次のタスクを claim（Queued → Running の CAS）
//! 2. Executor を別タスクで実行（timeout / cancel / stop と select）
//! 3. 結果から次の状態を決める（成功 / リトライ / 失敗 / キャンセル）
//! 4. dispatch ロックの下で CAS、スロット解放、待機中ワーカーを起こす
//!
//! timeout 後も戻らない呼び出しは別タスクで見張る。戻るまでタスクは Running の
//! ままデバイススロットも保持するので、同じタスクが二重に走ることはない。

use std::sync::Arc;

use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::dispatch::Pick;
use super::retry::Decision;
use super::scheduler::Inner;
use crate::domain::{
    AttemptOutcome, CancelReason, ExecuteError, FailureReason, Receipt, Task, TaskState,
};

/// A claimed task, owned by one worker until completion.
struct Lease {
    task: Task,
    attempt: u32,
    max_attempts: u32,
    cancel: CancellationToken,
}

type Attempt = JoinHandle<Result<Receipt, ExecuteError>>;

/// How the attempt ended, before any state is written.
enum AttemptEnd {
    Returned(Result<Receipt, ExecuteError>),
    Panicked(String),
    TimedOut,

    /// Cancel requested and the executor did not return within the grace period.
    CancelAbandoned,

    /// Scheduler stopped; the executor call was left behind.
    Stopped,
}

/// The transition a finished attempt turns into.
enum Verdict {
    Succeed(Receipt),
    Cancel(CancelReason, AttemptOutcome),
    Fail(FailureReason, AttemptOutcome),
}

pub(crate) async fn run(worker_id: usize, inner: Arc<Inner>) {
    tracing::debug!(worker_id, "worker started");
    while let Some(lease) = next_lease(&inner).await {
        match execute(&inner, &lease).await {
            Ok(end) => complete(&inner, lease, end),
            Err(handle) => {
                tracing::warn!(
                    worker_id,
                    task_id = %lease.task.id(),
                    attempt = lease.attempt,
                    "executor ignored timeout cancellation, holding device slot until it returns"
                );
                tokio::spawn(settle_overrun(Arc::clone(&inner), lease, handle));
            }
        }
    }
    tracing::debug!(worker_id, "worker stopped");
}

/// Waits until a task can be claimed. `None` once the scheduler stops.
async fn next_lease(inner: &Inner) -> Option<Lease> {
    loop {
        // 取りこぼし防止: 走査の前に通知を登録しておく
        let notified = inner.work_ready.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let next_wake = {
            let mut dispatch = inner.lock_dispatch();
            if inner.stop.is_cancelled() {
                return None;
            }
            let store = inner.store.as_ref();
            let clock = inner.clock.as_ref();
            let pick = dispatch.queues.next_ready(Instant::now(), store, &mut |id| {
                store.compare_and_swap(id, TaskState::Queued, TaskState::Running, &mut |r| {
                    r.begin_attempt(clock.now())
                })
            });
            match pick {
                Pick::Claimed(snapshot) => {
                    let id = snapshot.id();
                    let cancel = dispatch.tokens.entry(id).or_default().clone();
                    tracing::info!(
                        task_id = %id,
                        device = %snapshot.device_id(),
                        attempt = snapshot.attempts,
                        max_attempts = snapshot.max_attempts,
                        "attempt started"
                    );
                    return Some(Lease {
                        task: snapshot.task,
                        attempt: snapshot.attempts,
                        max_attempts: snapshot.max_attempts,
                        cancel,
                    });
                }
                Pick::Idle { next_wake } => next_wake,
            }
        };

        tokio::select! {
            _ = &mut notified => {}
            _ = sleep_until(next_wake) => {}
            _ = inner.stop.cancelled() => return None,
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Runs one attempt. `Err` hands back a call that timed out and is still
/// running after the grace period.
async fn execute(inner: &Inner, lease: &Lease) -> Result<AttemptEnd, Attempt> {
    let attempt_token = lease.cancel.child_token();
    let mut handle: Attempt = {
        let executor = Arc::clone(&inner.executor);
        let task = lease.task.clone();
        let token = attempt_token.clone();
        tokio::spawn(async move { executor.execute(&task, token).await })
    };
    let deadline = lease.task.attempt_timeout().map(|t| Instant::now() + t);
    let grace = inner.config.cancel_grace();

    let end = tokio::select! {
        joined = &mut handle => from_join(joined),
        _ = sleep_until(deadline) => {
            attempt_token.cancel();
            let waited = tokio::time::timeout(grace, &mut handle).await;
            // 猶予内に戻っても timeout は timeout として扱う
            match waited {
                Ok(_) => AttemptEnd::TimedOut,
                Err(_) => return Err(handle),
            }
        }
        _ = lease.cancel.cancelled() => {
            tokio::select! {
                joined = tokio::time::timeout(grace, &mut handle) => match joined {
                    Ok(joined) => from_join(joined),
                    Err(_) => AttemptEnd::CancelAbandoned,
                },
                _ = inner.stop.cancelled() => AttemptEnd::Stopped,
            }
        }
        _ = inner.stop.cancelled() => {
            attempt_token.cancel();
            AttemptEnd::Stopped
        }
    };
    Ok(end)
}

/// Waits for an overrunning call before the attempt is committed. A cancel or
/// stop still ends the task right away, since a terminal task is never re-run.
async fn settle_overrun(inner: Arc<Inner>, lease: Lease, mut handle: Attempt) {
    let end = tokio::select! {
        biased;
        _ = &mut handle => AttemptEnd::TimedOut,
        _ = lease.cancel.cancelled() => AttemptEnd::CancelAbandoned,
        _ = inner.stop.cancelled() => AttemptEnd::Stopped,
    };
    complete(&inner, lease, end);
}

fn from_join(joined: Result<Result<Receipt, ExecuteError>, JoinError>) -> AttemptEnd {
    match joined {
        Ok(result) => AttemptEnd::Returned(result),
        Err(e) if e.is_panic() => {
            let payload = e.into_panic();
            let msg = payload
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            AttemptEnd::Panicked(msg)
        }
        Err(e) => AttemptEnd::Panicked(e.to_string()),
    }
}

fn verdict(end: AttemptEnd, cancel_requested: bool) -> Verdict {
    match end {
        AttemptEnd::Returned(Ok(receipt)) => Verdict::Succeed(receipt),
        AttemptEnd::Stopped => {
            Verdict::Cancel(CancelReason::ShutdownTimeout, AttemptOutcome::Abandoned)
        }
        AttemptEnd::CancelAbandoned => {
            Verdict::Cancel(CancelReason::Requested, AttemptOutcome::Abandoned)
        }
        _ if cancel_requested => Verdict::Cancel(CancelReason::Requested, AttemptOutcome::Cancelled),
        AttemptEnd::TimedOut => Verdict::Fail(FailureReason::Timeout, AttemptOutcome::TimedOut),
        AttemptEnd::Returned(Err(e)) => {
            let msg = match e {
                ExecuteError::Transfer(msg) => msg,
                // 誰も頼んでいないキャンセルは executor 側の失敗
                ExecuteError::Cancelled => "executor reported cancellation".to_string(),
            };
            Verdict::Fail(
                FailureReason::Executor(msg.clone()),
                AttemptOutcome::Failed(msg),
            )
        }
        AttemptEnd::Panicked(msg) => {
            let reason = FailureReason::Panicked(msg);
            let outcome = AttemptOutcome::Failed(reason.to_string());
            Verdict::Fail(reason, outcome)
        }
    }
}

/// Commits the attempt's result. Runs entirely under the dispatch lock.
fn complete(inner: &Inner, lease: Lease, end: AttemptEnd) {
    let id = lease.task.id();
    let device = lease.task.device_id().clone();
    let now = inner.clock.now();
    let store = inner.store.as_ref();

    let mut dispatch = inner.lock_dispatch();
    let verdict = verdict(end, lease.cancel.is_cancelled());

    let result = match verdict {
        Verdict::Succeed(receipt) => store
            .compare_and_swap(id, TaskState::Running, TaskState::Succeeded, &mut |r| {
                r.finish_attempt(AttemptOutcome::Succeeded, now);
                r.receipt = Some(receipt.clone());
            })
            .map(|snapshot| {
                tracing::info!(
                    task_id = %id,
                    attempt = lease.attempt,
                    stored_path = snapshot.receipt.as_ref().and_then(|r| r.stored_path()),
                    "task succeeded"
                );
                true
            }),
        Verdict::Cancel(reason, outcome) => store
            .compare_and_swap(id, TaskState::Running, TaskState::Cancelled, &mut |r| {
                r.finish_attempt(outcome.clone(), now);
                r.cancel_reason = Some(reason);
            })
            .map(|_| {
                tracing::info!(task_id = %id, attempt = lease.attempt, ?reason, "task cancelled");
                true
            }),
        Verdict::Fail(reason, outcome) => match inner.retry.decide(lease.attempt, lease.max_attempts) {
            Decision::Retry { delay } => store
                .compare_and_swap(id, TaskState::Running, TaskState::Queued, &mut |r| {
                    r.finish_attempt(outcome.clone(), now);
                    r.next_eligible_at = Some(Instant::now() + delay);
                })
                .map(|_| {
                    dispatch.queues.push(device.clone(), id);
                    tracing::warn!(
                        task_id = %id,
                        attempt = lease.attempt,
                        error = %reason,
                        retry_in_ms = delay.as_millis() as u64,
                        "attempt failed, retrying"
                    );
                    false
                }),
            Decision::GiveUp => store
                .compare_and_swap(id, TaskState::Running, TaskState::Failed, &mut |r| {
                    r.finish_attempt(outcome.clone(), now);
                    r.last_error = Some(reason.to_string());
                })
                .map(|_| {
                    tracing::error!(
                        task_id = %id,
                        attempts = lease.attempt,
                        error = %reason,
                        "task failed"
                    );
                    true
                }),
        },
    };

    let terminal = match result {
        Ok(terminal) => terminal,
        Err(e) => {
            // 例: シャットダウンが先に Cancelled を書いた
            tracing::debug!(task_id = %id, error = %e, "completion lost a race");
            store.get(id).map(|s| s.is_terminal()).unwrap_or(true)
        }
    };
    if terminal {
        dispatch.tokens.remove(&id);
    }
    dispatch.queues.release(&device);
    drop(dispatch);

    inner.work_ready.notify_waiters();
    if terminal {
        inner.settled.notify_waiters();
    }
}
