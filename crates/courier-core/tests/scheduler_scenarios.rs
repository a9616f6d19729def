//! End-to-end scheduler behaviour with scripted executors.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use courier_core::app::{SchedulerBuilder, SchedulerConfig};
use courier_core::domain::{
    AttemptOutcome, CancelReason, ExecuteError, Receipt, SchedulerError, Task, TaskId, TaskState,
};
use courier_core::ports::{FixedClock, UploadExecutor};
use courier_core::store::TaskSnapshot;
use courier_core::Scheduler;
use rstest::rstest;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
enum Step {
    Succeed,
    Fail(&'static str),
    /// Sleeps, then succeeds; returns early on cancellation.
    Work(Duration),
    /// Waits until the test opens the gate or the attempt is cancelled.
    Gate,
    /// Ignores the cancellation signal forever.
    Hang,
    /// Ignores the cancellation signal, then succeeds after the given time.
    Stall(Duration),
    Panic,
}

/// Executor whose behaviour is scripted per payload.
struct Scripted {
    default: Step,
    scripts: Mutex<HashMap<String, VecDeque<Step>>>,
    gate: CancellationToken,
    calls: Mutex<Vec<String>>,
    running: Mutex<HashMap<String, usize>>,
    max_running: Mutex<HashMap<String, usize>>,
}

impl Scripted {
    fn new(default: Step) -> Arc<Self> {
        Arc::new(Self {
            default,
            scripts: Mutex::new(HashMap::new()),
            gate: CancellationToken::new(),
            calls: Mutex::new(Vec::new()),
            running: Mutex::new(HashMap::new()),
            max_running: Mutex::new(HashMap::new()),
        })
    }

    fn script(&self, payload: &str, steps: impl IntoIterator<Item = Step>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(payload.to_string(), steps.into_iter().collect());
    }

    fn open_gate(&self) {
        self.gate.cancel();
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn max_running(&self, device: &str) -> usize {
        self.max_running.lock().unwrap().get(device).copied().unwrap_or(0)
    }

    fn enter(&self, device: &str) {
        let mut running = self.running.lock().unwrap();
        let n = running.entry(device.to_string()).or_default();
        *n += 1;
        let mut max = self.max_running.lock().unwrap();
        let m = max.entry(device.to_string()).or_default();
        *m = (*m).max(*n);
    }

    fn leave(&self, device: &str) {
        *self.running.lock().unwrap().entry(device.to_string()).or_default() -= 1;
    }
}

#[async_trait]
impl UploadExecutor for Scripted {
    async fn execute(&self, task: &Task, cancel: CancellationToken) -> Result<Receipt, ExecuteError> {
        let payload = task.payload_ref().as_str().to_string();
        let device = task.device_id().as_str().to_string();
        self.calls.lock().unwrap().push(payload.clone());
        let step = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&payload)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| self.default.clone());

        self.enter(&device);
        let result = match step {
            Step::Succeed => Ok(Receipt::new()),
            Step::Fail(msg) => Err(ExecuteError::transfer(msg)),
            Step::Work(d) => tokio::select! {
                _ = tokio::time::sleep(d) => Ok(Receipt::new()),
                _ = cancel.cancelled() => Err(ExecuteError::Cancelled),
            },
            Step::Gate => tokio::select! {
                _ = self.gate.cancelled() => Ok(Receipt::new()),
                _ = cancel.cancelled() => Err(ExecuteError::Cancelled),
            },
            Step::Hang => std::future::pending().await,
            Step::Stall(d) => {
                tokio::time::sleep(d).await;
                Ok(Receipt::new())
            }
            Step::Panic => panic!("executor blew up"),
        };
        self.leave(&device);
        result
    }
}

fn config() -> SchedulerConfig {
    SchedulerConfig {
        workers: 4,
        per_device_limit: 1,
        default_max_attempts: 3,
        base_delay_ms: 100,
        max_delay_ms: 1_000,
        attempt_timeout_ms: None,
        cancel_grace_ms: 200,
        retention_ms: None,
        gc_interval_ms: 1_000,
    }
}

fn start(config: SchedulerConfig, executor: &Arc<Scripted>) -> Scheduler {
    SchedulerBuilder::new()
        .config(config)
        .shared_executor(executor.clone())
        .build()
        .unwrap()
}

fn task(device: &str, payload: &str) -> Task {
    Task::builder(device, payload).build()
}

async fn wait_for(scheduler: &Scheduler, id: TaskId, pred: impl Fn(&TaskSnapshot) -> bool) -> TaskSnapshot {
    for _ in 0..10_000 {
        let snapshot = scheduler.status(id).unwrap();
        if pred(&snapshot) {
            return snapshot;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("task {id} never reached the expected state");
}

async fn wait_terminal(scheduler: &Scheduler, id: TaskId) -> TaskSnapshot {
    wait_for(scheduler, id, TaskSnapshot::is_terminal).await
}

#[tokio::test(start_paused = true)]
async fn scenario_a_failing_executor_exhausts_attempts() {
    let executor = Scripted::new(Step::Fail("device offline"));
    let scheduler = start(config(), &executor);

    let id = scheduler
        .submit(Task::builder("cam-1", "a").max_attempts(3).build())
        .unwrap();
    let snapshot = wait_terminal(&scheduler, id).await;

    assert_eq!(snapshot.state, TaskState::Failed);
    assert_eq!(snapshot.attempts, 3);
    assert_eq!(snapshot.last_error.as_deref(), Some("device offline"));
    assert_eq!(snapshot.history.len(), 3);
    assert!(
        snapshot
            .history
            .iter()
            .all(|a| a.outcome == AttemptOutcome::Failed("device offline".into()))
    );
    assert_eq!(executor.calls().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn scenario_b_first_attempt_succeeds() {
    let executor = Scripted::new(Step::Succeed);
    let scheduler = start(config(), &executor);

    let id = scheduler.submit(task("cam-1", "a")).unwrap();
    let snapshot = wait_terminal(&scheduler, id).await;

    assert_eq!(snapshot.state, TaskState::Succeeded);
    assert_eq!(snapshot.attempts, 1);
    assert!(snapshot.receipt.is_some());
    assert!(snapshot.last_error.is_none());
}

#[tokio::test(start_paused = true)]
async fn scenario_c_cancel_while_queued_never_runs() {
    let executor = Scripted::new(Step::Succeed);
    let scheduler = start(config(), &executor);

    // current_thread runtime: no worker runs between these two calls.
    let id = scheduler.submit(task("cam-1", "a")).unwrap();
    scheduler.cancel(id).unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;

    let snapshot = scheduler.status(id).unwrap();
    assert_eq!(snapshot.state, TaskState::Cancelled);
    assert_eq!(snapshot.cancel_reason, Some(CancelReason::Requested));
    assert_eq!(snapshot.attempts, 0);
    assert!(snapshot.history.is_empty());
    assert!(executor.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn scenario_d_second_task_waits_for_device_slot() {
    let executor = Scripted::new(Step::Gate);
    let scheduler = start(config(), &executor);

    let first = scheduler.submit(task("cam-1", "first")).unwrap();
    let second = scheduler.submit(task("cam-1", "second")).unwrap();
    wait_for(&scheduler, first, |s| s.state == TaskState::Running).await;
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(scheduler.status(second).unwrap().state, TaskState::Queued);

    executor.open_gate();
    let done = wait_terminal(&scheduler, first).await;
    assert_eq!(done.state, TaskState::Succeeded);
    assert_eq!(wait_terminal(&scheduler, second).await.state, TaskState::Succeeded);
    assert_eq!(executor.calls(), vec!["first", "second"]);
}

#[tokio::test(start_paused = true)]
async fn scenario_e_duplicate_id_is_rejected() {
    let executor = Scripted::new(Step::Gate);
    let scheduler = start(config(), &executor);

    let original = task("cam-1", "a");
    let id = scheduler.submit(original.clone()).unwrap();
    let before = scheduler.status(id).unwrap();

    let copy = Task::builder("cam-2", "b").id(id).build();
    assert_eq!(scheduler.submit(copy), Err(SchedulerError::DuplicateTask(id)));

    let after = scheduler.status(id).unwrap();
    assert_eq!(after.task, before.task);
    assert_eq!(after.device_id().as_str(), "cam-1");
}

#[tokio::test(start_paused = true)]
async fn busy_device_does_not_starve_others() {
    let executor = Scripted::new(Step::Succeed);
    let scheduler = start(
        SchedulerConfig {
            workers: 1,
            ..config()
        },
        &executor,
    );

    let mut ids = Vec::new();
    for n in 0..6 {
        ids.push(scheduler.submit(task("busy", &format!("busy-{n}"))).unwrap());
    }
    ids.push(scheduler.submit(task("quiet-1", "quiet-1")).unwrap());
    ids.push(scheduler.submit(task("quiet-2", "quiet-2")).unwrap());
    for id in ids {
        wait_terminal(&scheduler, id).await;
    }

    let calls = executor.calls();
    let first_three = &calls[..3];
    assert!(first_three.contains(&"quiet-1".to_string()), "{calls:?}");
    assert!(first_three.contains(&"quiet-2".to_string()), "{calls:?}");
}

#[rstest]
#[case(1)]
#[case(2)]
#[case(3)]
#[tokio::test(start_paused = true)]
async fn per_device_limit_is_never_exceeded(#[case] limit: usize) {
    let executor = Scripted::new(Step::Work(Duration::from_millis(50)));
    let scheduler = start(
        SchedulerConfig {
            workers: 8,
            per_device_limit: limit,
            ..config()
        },
        &executor,
    );

    let ids: Vec<TaskId> = (0..10)
        .map(|n| scheduler.submit(task("cam-1", &format!("p{n}"))).unwrap())
        .collect();
    for id in ids {
        assert_eq!(wait_terminal(&scheduler, id).await.state, TaskState::Succeeded);
    }

    assert_eq!(executor.max_running("cam-1"), limit);
}

#[tokio::test(start_paused = true)]
async fn backed_off_task_is_overtaken_by_later_one() {
    let executor = Scripted::new(Step::Succeed);
    executor.script("flaky", [Step::Fail("busy")]);
    let scheduler = start(
        SchedulerConfig {
            workers: 1,
            base_delay_ms: 5_000,
            max_delay_ms: 5_000,
            ..config()
        },
        &executor,
    );

    let flaky = scheduler.submit(task("cam-1", "flaky")).unwrap();
    let steady = scheduler.submit(task("cam-1", "steady")).unwrap();

    let done = wait_terminal(&scheduler, flaky).await;
    assert_eq!(done.state, TaskState::Succeeded);
    assert_eq!(done.attempts, 2);
    assert_eq!(wait_terminal(&scheduler, steady).await.state, TaskState::Succeeded);
    assert_eq!(executor.calls(), vec!["flaky", "steady", "flaky"]);
}

#[tokio::test(start_paused = true)]
async fn retry_waits_for_backoff() {
    let executor = Scripted::new(Step::Succeed);
    executor.script("flaky", [Step::Fail("busy")]);
    let scheduler = start(
        SchedulerConfig {
            base_delay_ms: 10_000,
            max_delay_ms: 10_000,
            ..config()
        },
        &executor,
    );

    let id = scheduler.submit(task("cam-1", "flaky")).unwrap();
    let queued = wait_for(&scheduler, id, |s| s.attempts == 1 && s.state == TaskState::Queued).await;
    assert!(queued.last_error.is_none());

    let started = tokio::time::Instant::now();
    let done = wait_terminal(&scheduler, id).await;
    assert_eq!(done.state, TaskState::Succeeded);
    assert!(started.elapsed() >= Duration::from_secs(9));
}

#[tokio::test(start_paused = true)]
async fn status_is_idempotent() {
    let executor = Scripted::new(Step::Gate);
    let scheduler = start(config(), &executor);

    let id = scheduler.submit(task("cam-1", "a")).unwrap();
    wait_for(&scheduler, id, |s| s.state == TaskState::Running).await;

    assert_eq!(scheduler.status(id).unwrap(), scheduler.status(id).unwrap());
}

#[tokio::test(start_paused = true)]
async fn cancel_running_is_cooperative() {
    let executor = Scripted::new(Step::Gate);
    let scheduler = start(config(), &executor);

    let id = scheduler.submit(task("cam-1", "a")).unwrap();
    wait_for(&scheduler, id, |s| s.state == TaskState::Running).await;
    scheduler.cancel(id).unwrap();

    let snapshot = wait_terminal(&scheduler, id).await;
    assert_eq!(snapshot.state, TaskState::Cancelled);
    assert_eq!(snapshot.cancel_reason, Some(CancelReason::Requested));
    assert_eq!(snapshot.history[0].outcome, AttemptOutcome::Cancelled);
}

#[tokio::test(start_paused = true)]
async fn executor_ignoring_cancel_is_abandoned_after_grace() {
    let executor = Scripted::new(Step::Hang);
    let scheduler = start(config(), &executor);

    let id = scheduler.submit(task("cam-1", "a")).unwrap();
    let next = scheduler.submit(task("cam-1", "b")).unwrap();
    wait_for(&scheduler, id, |s| s.state == TaskState::Running).await;
    scheduler.cancel(id).unwrap();

    let snapshot = wait_terminal(&scheduler, id).await;
    assert_eq!(snapshot.state, TaskState::Cancelled);
    assert_eq!(snapshot.history[0].outcome, AttemptOutcome::Abandoned);

    // The device slot was freed.
    wait_for(&scheduler, next, |s| s.state == TaskState::Running).await;
}

#[tokio::test(start_paused = true)]
async fn attempt_timeout_counts_as_failure() {
    let executor = Scripted::new(Step::Work(Duration::from_secs(5)));
    let scheduler = start(config(), &executor);

    let id = scheduler
        .submit(
            Task::builder("cam-1", "a")
                .max_attempts(2)
                .attempt_timeout(Duration::from_secs(1))
                .build(),
        )
        .unwrap();
    let snapshot = wait_terminal(&scheduler, id).await;

    assert_eq!(snapshot.state, TaskState::Failed);
    assert_eq!(snapshot.attempts, 2);
    assert_eq!(snapshot.last_error.as_deref(), Some("timeout"));
    assert!(snapshot.history.iter().all(|a| a.outcome == AttemptOutcome::TimedOut));
}

#[tokio::test(start_paused = true)]
async fn overrunning_attempt_is_not_retried_while_still_running() {
    let executor = Scripted::new(Step::Stall(Duration::from_secs(3)));
    let scheduler = start(config(), &executor);

    let id = scheduler
        .submit(
            Task::builder("cam-1", "a")
                .attempt_timeout(Duration::from_secs(1))
                .build(),
        )
        .unwrap();
    let other = scheduler.submit(task("cam-1", "b")).unwrap();

    // Past timeout + grace the call is still running: the task stays Running
    // and keeps the device slot.
    tokio::time::sleep(Duration::from_millis(2_000)).await;
    let snapshot = scheduler.status(id).unwrap();
    assert_eq!(snapshot.state, TaskState::Running);
    assert_eq!(snapshot.attempts, 1);
    assert_eq!(scheduler.status(other).unwrap().state, TaskState::Queued);

    let snapshot = wait_terminal(&scheduler, id).await;
    assert_eq!(snapshot.state, TaskState::Failed);
    assert_eq!(snapshot.attempts, 3);
    assert_eq!(snapshot.last_error.as_deref(), Some("timeout"));
    assert_eq!(wait_terminal(&scheduler, other).await.state, TaskState::Succeeded);
    assert_eq!(executor.max_running("cam-1"), 1);
    assert_eq!(executor.calls().iter().filter(|p| *p == "a").count(), 3);
}

#[tokio::test(start_paused = true)]
async fn cancel_ends_an_overrunning_attempt() {
    let executor = Scripted::new(Step::Stall(Duration::from_secs(30)));
    let scheduler = start(config(), &executor);

    let id = scheduler
        .submit(
            Task::builder("cam-1", "a")
                .attempt_timeout(Duration::from_secs(1))
                .build(),
        )
        .unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(scheduler.status(id).unwrap().state, TaskState::Running);

    scheduler.cancel(id).unwrap();
    let snapshot = wait_terminal(&scheduler, id).await;
    assert_eq!(snapshot.state, TaskState::Cancelled);
    assert_eq!(snapshot.cancel_reason, Some(CancelReason::Requested));
    assert_eq!(snapshot.history[0].outcome, AttemptOutcome::Abandoned);
    assert_eq!(executor.calls(), vec!["a"]);
}

#[tokio::test(start_paused = true)]
async fn executor_panic_is_a_failed_attempt() {
    let executor = Scripted::new(Step::Panic);
    let scheduler = start(config(), &executor);

    let id = scheduler
        .submit(Task::builder("cam-1", "a").max_attempts(1).build())
        .unwrap();
    let snapshot = wait_terminal(&scheduler, id).await;

    assert_eq!(snapshot.state, TaskState::Failed);
    let error = snapshot.last_error.unwrap();
    assert!(error.contains("executor blew up"), "{error}");
}

#[tokio::test(start_paused = true)]
async fn shutdown_drains_admitted_work() {
    let executor = Scripted::new(Step::Work(Duration::from_millis(100)));
    let scheduler = start(config(), &executor);

    let ids: Vec<TaskId> = (0..5)
        .map(|n| scheduler.submit(task("cam-1", &format!("p{n}"))).unwrap())
        .collect();
    let report = scheduler.shutdown(Duration::from_secs(10)).await;

    assert!(report.drained);
    assert!(report.cancelled.is_empty());
    for id in ids {
        assert_eq!(scheduler.status(id).unwrap().state, TaskState::Succeeded);
    }
}

#[tokio::test(start_paused = true)]
async fn shutdown_timeout_leaves_every_task_terminal() {
    let executor = Scripted::new(Step::Hang);
    let scheduler = start(config(), &executor);

    let running = scheduler.submit(task("cam-1", "a")).unwrap();
    let queued = scheduler.submit(task("cam-1", "b")).unwrap();
    wait_for(&scheduler, running, |s| s.state == TaskState::Running).await;

    let report = scheduler.shutdown(Duration::from_secs(1)).await;

    assert!(!report.drained);
    assert_eq!(report.cancelled.len(), 2);
    for id in [running, queued] {
        let snapshot = scheduler.status(id).unwrap();
        assert_eq!(snapshot.state, TaskState::Cancelled);
        assert_eq!(snapshot.cancel_reason, Some(CancelReason::ShutdownTimeout));
    }
    assert_eq!(scheduler.counts().active(), 0);

    let again = scheduler.shutdown(Duration::from_secs(1)).await;
    assert_eq!(again, Default::default());
    assert_eq!(
        scheduler.submit(task("cam-1", "c")),
        Err(SchedulerError::ShuttingDown)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_report_includes_running_tasks_on_multi_thread_runtime() {
    for _ in 0..5 {
        let executor = Scripted::new(Step::Hang);
        let scheduler = start(
            SchedulerConfig {
                cancel_grace_ms: 10,
                ..config()
            },
            &executor,
        );
        let running = scheduler.submit(task("cam-1", "a")).unwrap();
        wait_for(&scheduler, running, |s| s.state == TaskState::Running).await;

        let report = scheduler.shutdown(Duration::from_millis(20)).await;
        assert_eq!(report.cancelled, vec![running]);
        let snapshot = scheduler.status(running).unwrap();
        assert_eq!(snapshot.cancel_reason, Some(CancelReason::ShutdownTimeout));
    }
}

#[rstest]
#[case::empty_device(Task::builder(" ", "a").build())]
#[case::empty_payload(Task::builder("cam-1", "").build())]
#[case::zero_attempts(Task::builder("cam-1", "a").max_attempts(0).build())]
#[tokio::test]
async fn malformed_tasks_are_rejected(#[case] bad: Task) {
    let executor = Scripted::new(Step::Succeed);
    let scheduler = start(config(), &executor);

    assert!(matches!(scheduler.submit(bad), Err(SchedulerError::InvalidTask(_))));
    assert_eq!(scheduler.counts().total(), 0);
}

#[tokio::test(start_paused = true)]
async fn cancel_reports_unknown_and_finished_tasks() {
    let executor = Scripted::new(Step::Succeed);
    let scheduler = start(config(), &executor);

    let unknown = TaskId::generate();
    assert_eq!(scheduler.cancel(unknown), Err(SchedulerError::NotFound(unknown)));

    let id = scheduler.submit(task("cam-1", "a")).unwrap();
    wait_terminal(&scheduler, id).await;
    assert_eq!(
        scheduler.cancel(id),
        Err(SchedulerError::AlreadyTerminal {
            id,
            state: TaskState::Succeeded
        })
    );
}

#[tokio::test(start_paused = true)]
async fn not_before_delays_the_first_attempt() {
    let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
    let clock = Arc::new(FixedClock::new(t0));
    let executor = Scripted::new(Step::Succeed);
    let scheduler = SchedulerBuilder::new()
        .config(config())
        .shared_executor(executor.clone())
        .clock(clock.clone())
        .build()
        .unwrap();

    let id = scheduler
        .submit(
            Task::builder("cam-1", "a")
                .not_before(t0 + chrono::Duration::seconds(30))
                .build(),
        )
        .unwrap();

    tokio::time::sleep(Duration::from_secs(20)).await;
    assert_eq!(scheduler.status(id).unwrap().state, TaskState::Queued);

    tokio::time::sleep(Duration::from_secs(15)).await;
    assert_eq!(scheduler.status(id).unwrap().state, TaskState::Succeeded);
}

#[tokio::test(start_paused = true)]
async fn expired_tasks_are_evicted_and_ids_stay_reserved() {
    let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
    let clock = Arc::new(FixedClock::new(t0));
    let executor = Scripted::new(Step::Succeed);
    let scheduler = SchedulerBuilder::new()
        .config(SchedulerConfig {
            retention_ms: Some(60_000),
            ..config()
        })
        .shared_executor(executor.clone())
        .clock(clock.clone())
        .build()
        .unwrap();

    let done = scheduler.submit(task("cam-1", "a")).unwrap();
    wait_terminal(&scheduler, done).await;

    assert!(scheduler.evict_expired().is_empty());
    clock.advance(chrono::Duration::minutes(2));
    assert_eq!(scheduler.evict_expired(), vec![done]);

    assert_eq!(scheduler.status(done), Err(SchedulerError::NotFound(done)));
    let again = Task::builder("cam-1", "a").id(done).build();
    assert_eq!(scheduler.submit(again), Err(SchedulerError::DuplicateTask(done)));
}
