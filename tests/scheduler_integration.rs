//! Scheduler integration tests
//!
//! Drives the public `Scheduler` API end to end with in-process work.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use gatekeeper::checkpoint::{Checkpoint, CheckpointConfig, CheckpointManager};
use gatekeeper::cost::CostEstimate;
use gatekeeper::limits::{LimitTable, ProviderLimitRegistry, ProviderLimits, RateLimit};
use gatekeeper::scheduler::{
    Scheduler, SchedulerBuilder, SchedulerConfig, SchedulerEvent, ScoringConfig, Task, WorkError,
};
use gatekeeper::storage::LockConfig;
use gatekeeper::types::{TaskPriority, TaskSource};
use serde_json::json;
use tempfile::TempDir;
use tokio::sync::{Notify, Semaphore, mpsc};
use tokio_util::sync::CancellationToken;

const PROVIDER: &str = "acme";
const MODEL: &str = "m1";

fn builder(concurrency: u32) -> SchedulerBuilder {
    let table = LimitTable::from([(
        PROVIDER.to_string(),
        ProviderLimits {
            default: Some(RateLimit::new(6_000, concurrency)),
            ..Default::default()
        },
    )]);
    Scheduler::builder(SchedulerConfig::default()).with_registry(Arc::new(ProviderLimitRegistry::with_presets(table)))
}

/// Builder over two providers, each with its own concurrency limit.
fn two_provider_builder(config: SchedulerConfig, acme: u32, zeta: u32) -> SchedulerBuilder {
    let limits = |concurrency| ProviderLimits {
        default: Some(RateLimit::new(6_000, concurrency)),
        ..Default::default()
    };
    let table = LimitTable::from([
        (PROVIDER.to_string(), limits(acme)),
        ("zeta".to_string(), limits(zeta)),
    ]);
    Scheduler::builder(config).with_registry(Arc::new(ProviderLimitRegistry::with_presets(table)))
}

fn scoring_builder(scoring: ScoringConfig) -> SchedulerBuilder {
    two_provider_builder(
        SchedulerConfig {
            scoring,
            ..Default::default()
        },
        1,
        1,
    )
}

fn drain(rx: &mut mpsc::Receiver<SchedulerEvent>) -> Vec<SchedulerEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Task that blocks until `gate` is notified.
fn blocker(id: &str, priority: TaskPriority, gate: Arc<Notify>) -> Task {
    Task::from_fn(TaskSource::Team, PROVIDER, MODEL, move |_ctx| async move {
        gate.notified().await;
        Ok::<_, WorkError>(json!(null))
    })
    .with_id(id)
    .with_priority(priority)
    .with_cost(CostEstimate::fixed(1_000, 100))
}

/// Task that appends its id to `order` and returns.
fn recorder(id: &str, priority: TaskPriority, order: Arc<Mutex<Vec<String>>>) -> Task {
    let name = id.to_string();
    Task::from_fn(TaskSource::Subagent, PROVIDER, MODEL, move |_ctx| async move {
        order.lock().unwrap().push(name);
        Ok::<_, WorkError>(json!(null))
    })
    .with_id(id)
    .with_priority(priority)
    .with_cost(CostEstimate::fixed(1_000, 100))
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached within 5s");
}

#[tokio::test]
async fn test_admission_respects_concurrency_limit() {
    let scheduler = builder(2).build();
    let gate = Arc::new(Semaphore::new(0));
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for i in 0..3 {
        let (gate, running, peak) = (gate.clone(), running.clone(), peak.clone());
        let task = Task::from_fn(TaskSource::Subagent, PROVIDER, MODEL, move |_ctx| async move {
            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            let _permit = gate.acquire().await.map_err(|e| WorkError::new(e.to_string()))?;
            running.fetch_sub(1, Ordering::SeqCst);
            Ok::<_, WorkError>(json!(i))
        })
        .with_id(format!("t{}", i));
        let runner = scheduler.clone();
        handles.push(tokio::spawn(async move { runner.submit(task).await }));
    }

    wait_until(|| scheduler.active_count() == 2 && scheduler.queued_count() == 1).await;
    let stats = scheduler.stats();
    assert_eq!(stats.total_active, 2);
    assert_eq!(stats.queues[0].effective_limit, 2);

    gate.add_permits(3);
    let results = futures::future::join_all(handles).await;
    assert!(results.into_iter().all(|r| r.unwrap().success));
    assert_eq!(peak.load(Ordering::SeqCst), 2);
    assert_eq!(scheduler.active_count(), 0);
}

#[tokio::test]
async fn test_critical_admitted_before_earlier_lows() {
    let scheduler = builder(1).build();
    let gate = Arc::new(Notify::new());
    let order = Arc::new(Mutex::new(Vec::new()));

    let runner = scheduler.clone();
    let first = blocker("blocker", TaskPriority::High, gate.clone());
    let blocker_handle = tokio::spawn(async move { runner.submit(first).await });
    wait_until(|| scheduler.active_count() == 1).await;

    let mut handles = Vec::new();
    for i in 0..3 {
        let task = recorder(&format!("low-{}", i), TaskPriority::Low, order.clone());
        let runner = scheduler.clone();
        handles.push(tokio::spawn(async move { runner.submit(task).await }));
        wait_until(|| scheduler.queued_count() == i + 1).await;
    }
    let task = recorder("critical", TaskPriority::Critical, order.clone());
    let runner = scheduler.clone();
    handles.push(tokio::spawn(async move { runner.submit(task).await }));
    wait_until(|| scheduler.queued_count() == 4).await;

    // High work is never preempted by critical
    assert_eq!(scheduler.active_count(), 1);

    gate.notify_one();
    assert!(blocker_handle.await.unwrap().success);
    for handle in handles {
        assert!(handle.await.unwrap().success);
    }

    let order = order.lock().unwrap().clone();
    assert_eq!(order, vec!["critical", "low-0", "low-1", "low-2"]);
}

#[tokio::test]
async fn test_preemption_checkpoints_and_resumes() {
    let temp = TempDir::new().unwrap();
    let store = Arc::new(CheckpointManager::new(
        temp.path().join("checkpoints"),
        CheckpointConfig::default(),
        LockConfig::default(),
    ));
    let scheduler = builder(1).with_checkpoints(store.clone()).build();
    let started = Arc::new(Notify::new());

    let signal = started.clone();
    let low = Task::from_fn(TaskSource::Subagent, PROVIDER, MODEL, move |ctx| async move {
        ctx.report_progress(0.4, json!({"step": 2}));
        signal.notify_one();
        ctx.cancelled().await;
        ctx.report_progress(0.5, json!({"step": 3}));
        Err::<serde_json::Value, _>(WorkError::cancelled())
    })
    .with_id("low-work")
    .with_priority(TaskPriority::Low);

    let runner = scheduler.clone();
    let low_handle = tokio::spawn(async move { runner.submit(low).await });
    started.notified().await;

    let critical = Task::from_fn(TaskSource::Subagent, PROVIDER, MODEL, |_ctx| async move {
        Ok::<_, WorkError>(json!("urgent"))
    })
    .with_id("critical-work")
    .with_priority(TaskPriority::Critical);
    let critical_result = scheduler.submit(critical).await;
    assert!(critical_result.success);

    let low_result = low_handle.await.unwrap();
    assert!(!low_result.success);
    assert!(low_result.preempted);
    assert!(low_result.aborted);
    assert!(!low_result.timed_out);
    assert!(low_result.checkpoint_id.is_some());

    let checkpoint = store.load("low-work").await.unwrap().unwrap();
    assert_eq!(checkpoint.state, json!({"step": 3}));
    assert_eq!(checkpoint.progress, 0.5);
    assert_eq!(checkpoint.priority, TaskPriority::Low);

    let resumed = Task::from_fn(TaskSource::Subagent, PROVIDER, MODEL, |ctx| async move {
        let step = ctx
            .resume()
            .map(|c| c.state["step"].clone())
            .ok_or_else(|| WorkError::new("expected a checkpoint to resume from"))?;
        Ok::<_, WorkError>(json!({"resumed_from": step}))
    })
    .with_id("low-work")
    .with_priority(TaskPriority::Low);
    let result = scheduler.submit(resumed).await;
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.result, Some(json!({"resumed_from": 3})));
    assert!(store.load("low-work").await.unwrap().is_none());
}

#[tokio::test]
async fn test_equal_priority_is_not_preempted() {
    let scheduler = builder(1).build();
    let gate = Arc::new(Notify::new());

    let runner = scheduler.clone();
    let first = blocker("first", TaskPriority::Normal, gate.clone());
    let first_handle = tokio::spawn(async move { runner.submit(first).await });
    wait_until(|| scheduler.active_count() == 1).await;

    let runner = scheduler.clone();
    let second = blocker("second", TaskPriority::Normal, gate.clone());
    let second_handle = tokio::spawn(async move { runner.submit(second).await });
    wait_until(|| scheduler.queued_count() == 1).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(scheduler.active_count(), 1);

    gate.notify_one();
    let first_result = first_handle.await.unwrap();
    assert!(first_result.success);
    assert!(!first_result.preempted);

    wait_until(|| scheduler.active_count() == 1).await;
    gate.notify_one();
    assert!(second_handle.await.unwrap().success);
}

#[tokio::test]
async fn test_deadline_while_queued() {
    let scheduler = builder(1).build();
    let gate = Arc::new(Notify::new());

    let runner = scheduler.clone();
    let first = blocker("blocker", TaskPriority::Normal, gate.clone());
    let blocker_handle = tokio::spawn(async move { runner.submit(first).await });
    wait_until(|| scheduler.active_count() == 1).await;

    let late = Task::from_fn(TaskSource::Subagent, PROVIDER, MODEL, |_ctx| async move {
        Ok::<_, WorkError>(json!("never"))
    })
    .with_id("late")
    .with_deadline(Duration::from_millis(50));
    let result = scheduler.submit(late).await;

    assert!(!result.success);
    assert!(result.timed_out);
    assert!(!result.aborted);
    assert_eq!(result.execution_ms, 0);
    assert_eq!(scheduler.queued_count(), 0);

    gate.notify_one();
    assert!(blocker_handle.await.unwrap().success);
}

#[tokio::test]
async fn test_deadline_while_running() {
    let scheduler = builder(1).build();
    let slow = Task::from_fn(TaskSource::Subagent, PROVIDER, MODEL, |ctx| async move {
        ctx.cancelled().await;
        Err::<serde_json::Value, _>(WorkError::cancelled())
    })
    .with_id("slow")
    .with_deadline(Duration::from_millis(50));

    let result = scheduler.submit(slow).await;
    assert!(!result.success);
    assert!(result.timed_out);
    assert!(!result.aborted);
    assert!(!result.preempted);
    assert_eq!(scheduler.active_count(), 0);
}

#[tokio::test]
async fn test_caller_cancel_while_queued() {
    let scheduler = builder(1).build();
    let gate = Arc::new(Notify::new());

    let runner = scheduler.clone();
    let first = blocker("blocker", TaskPriority::Normal, gate.clone());
    let blocker_handle = tokio::spawn(async move { runner.submit(first).await });
    wait_until(|| scheduler.active_count() == 1).await;

    let cancel = CancellationToken::new();
    let waiting = Task::from_fn(TaskSource::Subagent, PROVIDER, MODEL, |_ctx| async move {
        Ok::<_, WorkError>(json!("never"))
    })
    .with_id("waiting")
    .with_cancel(cancel.clone());
    let runner = scheduler.clone();
    let handle = tokio::spawn(async move { runner.submit(waiting).await });
    wait_until(|| scheduler.queued_count() == 1).await;

    cancel.cancel();
    let result = handle.await.unwrap();
    assert!(!result.success);
    assert!(result.aborted);
    assert!(!result.timed_out);
    assert_eq!(scheduler.queued_count(), 0);

    gate.notify_one();
    assert!(blocker_handle.await.unwrap().success);
}

#[tokio::test]
async fn test_caller_cancel_while_running() {
    let scheduler = builder(1).build();
    let cancel = CancellationToken::new();
    let started = Arc::new(Notify::new());

    let signal = started.clone();
    let task = Task::from_fn(TaskSource::Subagent, PROVIDER, MODEL, move |ctx| async move {
        signal.notify_one();
        ctx.cancelled().await;
        Err::<serde_json::Value, _>(WorkError::cancelled())
    })
    .with_id("running")
    .with_cancel(cancel.clone());

    let runner = scheduler.clone();
    let handle = tokio::spawn(async move { runner.submit(task).await });
    started.notified().await;
    cancel.cancel();

    let result = handle.await.unwrap();
    assert!(!result.success);
    assert!(result.aborted);
    assert!(!result.preempted);
    assert!(!result.timed_out);
}

#[tokio::test]
async fn test_lifecycle_events() {
    let (tx, mut rx) = mpsc::channel(16);
    let scheduler = builder(2).with_events(tx).build();

    let task = Task::from_fn(TaskSource::Subagent, PROVIDER, MODEL, |_ctx| async move {
        Ok::<_, WorkError>(json!(1))
    })
    .with_id("observed");
    assert!(scheduler.submit(task).await.success);

    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    assert_eq!(events.len(), 3);
    assert!(matches!(events[0], SchedulerEvent::Queued { priority: TaskPriority::Normal, .. }));
    assert!(matches!(events[1], SchedulerEvent::Admitted { effective_limit: 2, .. }));
    assert!(matches!(events[2], SchedulerEvent::Finished { success: true, .. }));
    assert!(events.iter().all(|e| e.task_id() == "observed"));
}

#[tokio::test]
async fn test_rate_limited_work_lowers_learned_limit() {
    let scheduler = builder(4).build();

    let task = Task::from_fn(TaskSource::Subagent, PROVIDER, MODEL, |_ctx| async move {
        Err::<serde_json::Value, _>(WorkError::new("HTTP 429: Too Many Requests"))
    })
    .with_id("throttled");
    let result = scheduler.submit(task).await;
    assert!(!result.success);

    let learned = scheduler.controller().get_learned_limit(PROVIDER, MODEL).unwrap();
    assert_eq!(learned.concurrency, 2);
    assert_eq!(learned.original_concurrency, 4);
    assert!(learned.recovery_scheduled);
    assert!(scheduler.effective_limit(PROVIDER, MODEL) <= 2);
    assert!(scheduler.limiter().can_proceed(PROVIDER, MODEL, 1.0) > 0);
}

#[tokio::test]
async fn test_skip_count_promotes_exactly_at_the_limit() {
    let (tx, mut rx) = mpsc::channel(64);
    let scheduler = scoring_builder(ScoringConfig {
        max_skip_count: 2,
        ..Default::default()
    })
    .with_events(tx)
    .build();
    let gate = Arc::new(Notify::new());
    let order = Arc::new(Mutex::new(Vec::new()));

    let runner = scheduler.clone();
    let first = blocker("blocker", TaskPriority::High, gate.clone());
    let blocker_handle = tokio::spawn(async move { runner.submit(first).await });
    wait_until(|| scheduler.active_count() == 1).await;

    let mut handles = Vec::new();
    let queued = [
        ("low", TaskPriority::Low),
        ("high-1", TaskPriority::High),
        ("high-2", TaskPriority::High),
        ("high-3", TaskPriority::High),
    ];
    for (i, (id, priority)) in queued.into_iter().enumerate() {
        let task = recorder(id, priority, order.clone());
        let runner = scheduler.clone();
        handles.push(tokio::spawn(async move { runner.submit(task).await }));
        wait_until(|| scheduler.queued_count() == i + 1).await;
    }

    gate.notify_one();
    assert!(blocker_handle.await.unwrap().success);
    for handle in handles {
        assert!(handle.await.unwrap().success);
    }

    // Overtaken once (skip 1) it still loses to high-2; overtaken twice it jumps high-3
    let order = order.lock().unwrap().clone();
    assert_eq!(order, vec!["high-1", "high-2", "low", "high-3"]);

    let promoted: Vec<(String, u32)> = drain(&mut rx)
        .into_iter()
        .filter_map(|e| match e {
            SchedulerEvent::Promoted { task_id, skip_count, .. } => Some((task_id, skip_count)),
            _ => None,
        })
        .collect();
    assert_eq!(promoted, vec![("low".to_string(), 2)]);
}

#[tokio::test]
async fn test_long_wait_promotes_over_higher_priority() {
    let (tx, mut rx) = mpsc::channel(64);
    let scheduler = scoring_builder(ScoringConfig {
        starvation_threshold_ms: 100,
        max_skip_count: 1_000,
        ..Default::default()
    })
    .with_events(tx)
    .build();
    let gate = Arc::new(Notify::new());
    let order = Arc::new(Mutex::new(Vec::new()));

    let runner = scheduler.clone();
    let first = blocker("blocker", TaskPriority::High, gate.clone());
    let blocker_handle = tokio::spawn(async move { runner.submit(first).await });
    wait_until(|| scheduler.active_count() == 1).await;

    let old = recorder("old", TaskPriority::Low, order.clone());
    let runner = scheduler.clone();
    let old_handle = tokio::spawn(async move { runner.submit(old).await });
    wait_until(|| scheduler.queued_count() == 1).await;
    tokio::time::sleep(Duration::from_millis(150)).await;

    let fresh = recorder("fresh", TaskPriority::High, order.clone());
    let runner = scheduler.clone();
    let fresh_handle = tokio::spawn(async move { runner.submit(fresh).await });
    wait_until(|| scheduler.queued_count() == 2).await;
    assert_eq!(scheduler.stats().queues[0].starving, 1);

    gate.notify_one();
    assert!(blocker_handle.await.unwrap().success);
    assert!(old_handle.await.unwrap().success);
    assert!(fresh_handle.await.unwrap().success);

    assert_eq!(order.lock().unwrap().clone(), vec!["old", "fresh"]);
    let events = drain(&mut rx);
    assert!(events.iter().any(|e| matches!(
        e,
        SchedulerEvent::Promoted { task_id, skip_count: 0, .. } if task_id == "old"
    )));
}

#[tokio::test]
async fn test_cross_key_preemption_takes_one_victim() {
    let temp = TempDir::new().unwrap();
    let store = Arc::new(CheckpointManager::new(
        temp.path().join("checkpoints"),
        CheckpointConfig::default(),
        LockConfig::default(),
    ));
    let scheduler = two_provider_builder(
        SchedulerConfig {
            max_total_concurrent: 1,
            ..Default::default()
        },
        4,
        1,
    )
    .with_checkpoints(store.clone())
    .build();
    let order = Arc::new(Mutex::new(Vec::new()));
    let release = CancellationToken::new();

    let mut lows = Vec::new();
    for i in 0..4 {
        let (order, release) = (order.clone(), release.clone());
        let id = format!("low-{}", i);
        let name = id.clone();
        let task = Task::from_fn(TaskSource::Subagent, PROVIDER, MODEL, move |ctx| async move {
            order.lock().unwrap().push(format!("start {}", name));
            ctx.report_progress(0.1, json!({"low": i}));
            tokio::select! {
                _ = ctx.cancelled() => Err::<serde_json::Value, _>(WorkError::cancelled()),
                _ = release.cancelled() => Ok(json!(null)),
            }
        })
        .with_id(id)
        .with_priority(TaskPriority::Low);
        let runner = scheduler.clone();
        lows.push(tokio::spawn(async move { runner.submit(task).await }));
        if i == 0 {
            wait_until(|| scheduler.active_count() == 1).await;
        } else {
            wait_until(|| scheduler.queued_count() == i).await;
        }
    }

    let crit_order = order.clone();
    let crit = Task::from_fn(TaskSource::Team, "zeta", "z1", move |_ctx| async move {
        crit_order.lock().unwrap().push("start crit".to_string());
        Ok::<_, WorkError>(json!("urgent"))
    })
    .with_id("crit")
    .with_priority(TaskPriority::Critical);
    let crit_result = scheduler.submit(crit).await;
    assert!(crit_result.success);
    {
        let order = order.lock().unwrap();
        assert_eq!(order[..2], ["start low-0".to_string(), "start crit".to_string()]);
    }

    release.cancel();
    let results: Vec<_> = futures::future::join_all(lows)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();
    let preempted: Vec<&str> = results.iter().filter(|r| r.preempted).map(|r| r.task_id.as_str()).collect();
    assert_eq!(preempted, vec!["low-0"]);
    assert!(results[1..].iter().all(|r| r.success));

    assert_eq!(
        order.lock().unwrap().clone(),
        vec!["start low-0", "start crit", "start low-1", "start low-2", "start low-3"]
    );
    let saved: Vec<String> = store.list().await.unwrap().into_iter().map(|c| c.task_id).collect();
    assert_eq!(saved, vec!["low-0".to_string()]);
}

#[tokio::test]
async fn test_look_alike_task_ids_do_not_share_checkpoints() {
    let temp = TempDir::new().unwrap();
    let store = Arc::new(CheckpointManager::new(
        temp.path().join("checkpoints"),
        CheckpointConfig::default(),
        LockConfig::default(),
    ));
    let scheduler = builder(2).with_checkpoints(store.clone()).build();

    let saved = store
        .save(
            Checkpoint::new("team/worker:1", TaskSource::Team, PROVIDER, MODEL, TaskPriority::Normal)
                .with_state(json!({"owner": "A"}), 0.5),
        )
        .await;
    assert!(saved.success);

    let look_alike = Task::from_fn(TaskSource::Team, PROVIDER, MODEL, |ctx| async move {
        let resumed = ctx.resume().is_some();
        ctx.report_progress(1.0, json!({"owner": "B"}));
        Ok::<_, WorkError>(json!({"resumed": resumed}))
    })
    .with_id("team_worker_1");
    let result = scheduler.submit(look_alike).await;
    assert!(result.success);
    assert_eq!(result.result, Some(json!({"resumed": false})));
    assert_eq!(store.load("team/worker:1").await.unwrap().unwrap().state["owner"], "A");

    let owner = Task::from_fn(TaskSource::Team, PROVIDER, MODEL, |ctx| async move {
        let owner = ctx
            .resume()
            .map(|c| c.state["owner"].clone())
            .ok_or_else(|| WorkError::new("expected a checkpoint to resume from"))?;
        Ok::<_, WorkError>(owner)
    })
    .with_id("team/worker:1");
    let result = scheduler.submit(owner).await;
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.result, Some(json!("A")));
    assert!(store.load("team/worker:1").await.unwrap().is_none());
}
