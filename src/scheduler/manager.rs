//! The admission-controlled priority scheduler.
//!
//! Admission runs whenever something changes:
//! 1. A task is submitted
//! 2. A running task finishes
//! 3. A token-bucket timer fires or the maintenance loop ticks
//!
//! Each pass drops queued entries whose deadline passed, admits entries per queue key
//! while the key and the global ceiling have room and the token bucket allows it, then
//! asks running lower-priority work to yield to waiting higher-priority work. A slot
//! given up that way is held for the key that asked and served first next pass.
//! Admitted work runs on its own tokio task; the scheduler only sees it start and finish.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::events::{ParallelismHint, SchedulerEvent, scale_limit};
use super::preempt::can_preempt;
use super::priority::{Candidate, ScoringConfig};
use super::select::{overtaken, select_next};
use super::task::{Task, TaskContext, TaskResult, WorkError};
use crate::checkpoint::{Checkpoint, CheckpointManager};
use crate::cost::{CostEstimate, CostEstimator, ExecutionRecord};
use crate::error::GatekeeperError;
use crate::id::now_ms;
use crate::limits::ProviderLimitRegistry;
use crate::ratelimit::{
    AdaptiveConfig, AdaptivePenaltyController, AdaptiveRateController, ErrorClass, ErrorClassifier, PenaltyConfig,
    PenaltyReason, RateEvent, RateEventKind, TokenBucketConfig, TokenBucketLimiter, model_key,
};
use crate::types::TaskPriority;

/// Scheduler configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct SchedulerConfig {
    /// Ceiling on running tasks across all queue keys.
    pub max_total_concurrent: usize,
    pub scoring: ScoringConfig,
    /// Period of the maintenance loop (ms).
    pub maintenance_interval_ms: u64,
    /// Request units debited from the token bucket per admission.
    pub tokens_per_admission: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_total_concurrent: 8,
            scoring: ScoringConfig::default(),
            maintenance_interval_ms: 5_000,
            tokens_per_admission: 1.0,
        }
    }
}

/// Queue depth and limits for one `provider:model`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueStats {
    pub key: String,
    pub provider: String,
    pub model: String,
    pub queued: usize,
    pub active: usize,
    pub effective_limit: u32,
    /// Queued entries that qualify for promotion.
    pub starving: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchedulerStats {
    pub total_active: usize,
    pub total_queued: usize,
    pub max_total_concurrent: usize,
    pub queues: Vec<QueueStats>,
}

struct QueueEntry {
    task: Task,
    seq: u64,
    enqueued_at_ms: u64,
    deadline_at_ms: Option<u64>,
    skip_count: u32,
    estimate: CostEstimate,
    resume: Option<Checkpoint>,
    responder: oneshot::Sender<TaskResult>,
}

impl QueueEntry {
    fn candidate(&self) -> Candidate {
        Candidate {
            priority: self.task.priority,
            enqueued_at_ms: self.enqueued_at_ms,
            estimated_duration_ms: self.estimate.estimated_duration_ms,
            estimated_tokens: self.estimate.estimated_tokens,
            skip_count: self.skip_count,
        }
    }
}

struct ActiveEntry {
    key: String,
    provider: String,
    model: String,
    priority: TaskPriority,
    started_at_ms: u64,
    /// Taken from the same counter as queue sequence numbers, so it orders
    /// admissions against enqueues.
    admitted_seq: u64,
    cancel: CancellationToken,
    /// Queue key whose waiting task asked this one to yield.
    preempted_for: Option<String>,
}

/// Slot owed to a queue key whose waiting task preempted running work.
struct Reservation {
    victim: String,
    waiter: String,
}

#[derive(Default)]
struct State {
    queues: BTreeMap<String, Vec<QueueEntry>>,
    active: HashMap<String, ActiveEntry>,
    reservations: BTreeMap<String, Reservation>,
    next_seq: u64,
    wake_at_ms: Option<u64>,
}

impl State {
    fn active_for(&self, key: &str) -> usize {
        self.active.values().filter(|a| a.key == key).count()
    }

    /// Whether the preempted work behind `key`'s reservation has returned its slot.
    fn reservation_ready(&self, key: &str) -> bool {
        self.reservations
            .get(key)
            .is_some_and(|r| !self.active.contains_key(&r.victim))
    }

    /// Slots freed by preempted work that are held for keys other than `key`.
    fn held_for_others(&self, key: &str) -> usize {
        self.reservations
            .iter()
            .filter(|(k, r)| k.as_str() != key && !self.active.contains_key(&r.victim))
            .count()
    }

    fn contains(&self, task_id: &str) -> bool {
        self.active.contains_key(task_id)
            || self
                .queues
                .values()
                .any(|entries| entries.iter().any(|e| e.task.id == task_id))
    }
}

struct Admission {
    entry: QueueEntry,
    key: String,
    cancel: CancellationToken,
    started_at_ms: u64,
}

struct Inner {
    config: SchedulerConfig,
    registry: Arc<ProviderLimitRegistry>,
    limiter: Arc<TokenBucketLimiter>,
    controller: Arc<AdaptiveRateController>,
    penalty: Arc<AdaptivePenaltyController>,
    estimator: Arc<CostEstimator>,
    checkpoints: Option<Arc<CheckpointManager>>,
    classifier: ErrorClassifier,
    hint: Option<Arc<dyn ParallelismHint>>,
    events: Option<mpsc::Sender<SchedulerEvent>>,
    state: Mutex<State>,
}

/// Builds a [`Scheduler`]. Collaborators not supplied get in-memory defaults.
pub struct SchedulerBuilder {
    config: SchedulerConfig,
    registry: Option<Arc<ProviderLimitRegistry>>,
    limiter: Option<Arc<TokenBucketLimiter>>,
    controller: Option<Arc<AdaptiveRateController>>,
    penalty: Option<Arc<AdaptivePenaltyController>>,
    estimator: Option<Arc<CostEstimator>>,
    checkpoints: Option<Arc<CheckpointManager>>,
    classifier: ErrorClassifier,
    hint: Option<Arc<dyn ParallelismHint>>,
    events: Option<mpsc::Sender<SchedulerEvent>>,
}

impl SchedulerBuilder {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            registry: None,
            limiter: None,
            controller: None,
            penalty: None,
            estimator: None,
            checkpoints: None,
            classifier: ErrorClassifier::default(),
            hint: None,
            events: None,
        }
    }

    pub fn with_registry(mut self, registry: Arc<ProviderLimitRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_limiter(mut self, limiter: Arc<TokenBucketLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn with_controller(mut self, controller: Arc<AdaptiveRateController>) -> Self {
        self.controller = Some(controller);
        self
    }

    pub fn with_penalty(mut self, penalty: Arc<AdaptivePenaltyController>) -> Self {
        self.penalty = Some(penalty);
        self
    }

    pub fn with_estimator(mut self, estimator: Arc<CostEstimator>) -> Self {
        self.estimator = Some(estimator);
        self
    }

    pub fn with_checkpoints(mut self, checkpoints: Arc<CheckpointManager>) -> Self {
        self.checkpoints = Some(checkpoints);
        self
    }

    pub fn with_classifier(mut self, classifier: ErrorClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_parallelism_hint(mut self, hint: Arc<dyn ParallelismHint>) -> Self {
        self.hint = Some(hint);
        self
    }

    /// Send lifecycle events to `tx`. Events are dropped when the channel is full.
    pub fn with_events(mut self, tx: mpsc::Sender<SchedulerEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn build(self) -> Scheduler {
        let registry = self.registry.unwrap_or_else(|| Arc::new(ProviderLimitRegistry::new()));
        let limiter = self
            .limiter
            .unwrap_or_else(|| Arc::new(TokenBucketLimiter::new(registry.clone(), TokenBucketConfig::default())));
        let controller = self
            .controller
            .unwrap_or_else(|| Arc::new(AdaptiveRateController::new(registry.clone(), AdaptiveConfig::default())));
        let penalty = self
            .penalty
            .unwrap_or_else(|| Arc::new(AdaptivePenaltyController::new(PenaltyConfig::default())));
        let estimator = self.estimator.unwrap_or_default();

        Scheduler {
            inner: Arc::new(Inner {
                config: self.config,
                registry,
                limiter,
                controller,
                penalty,
                estimator,
                checkpoints: self.checkpoints,
                classifier: self.classifier,
                hint: self.hint,
                events: self.events,
                state: Mutex::new(State::default()),
            }),
        }
    }
}

/// Admission-controlled priority scheduler. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn builder(config: SchedulerConfig) -> SchedulerBuilder {
        SchedulerBuilder::new(config)
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &Arc<ProviderLimitRegistry> {
        &self.inner.registry
    }

    pub fn limiter(&self) -> &Arc<TokenBucketLimiter> {
        &self.inner.limiter
    }

    pub fn controller(&self) -> &Arc<AdaptiveRateController> {
        &self.inner.controller
    }

    pub fn penalty(&self) -> &Arc<AdaptivePenaltyController> {
        &self.inner.penalty
    }

    pub fn estimator(&self) -> &Arc<CostEstimator> {
        &self.inner.estimator
    }

    pub fn checkpoints(&self) -> Option<&Arc<CheckpointManager>> {
        self.inner.checkpoints.as_ref()
    }

    /// Submit a task and wait for its outcome.
    ///
    /// Resolves when the task finishes, is preempted, is cancelled by the caller, or
    /// its deadline passes. Rate-limit and capacity failures are folded into the
    /// limit controllers and show up here only as a failed result.
    pub async fn submit(&self, mut task: Task) -> TaskResult {
        let task_id = task.id.clone();
        let caller_cancel = task.cancel.clone();
        let deadline = task.deadline;

        let estimate = task.cost.take().unwrap_or_else(|| {
            self.inner.estimator.estimate(
                task.source,
                Some(&task.provider),
                Some(&task.model),
                task.description.as_deref(),
            )
        });
        let resume = self.inner.load_resume(&task_id).await;

        if caller_cancel.is_cancelled() {
            return TaskResult::aborted_in_queue(task_id, 0);
        }

        let (tx, mut rx) = oneshot::channel();
        if let Err(e) = self.inner.enqueue(task, estimate, resume, tx) {
            return TaskResult {
                task_id,
                error: Some(e.to_string()),
                ..Default::default()
            };
        }
        self.inner.schedule();

        let deadline_sleep = async move {
            match deadline {
                Some(d) => tokio::time::sleep(d).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(deadline_sleep);
        let mut watch_deadline = deadline.is_some();
        let mut watch_cancel = true;

        loop {
            tokio::select! {
                result = &mut rx => {
                    return result.unwrap_or_else(|_| TaskResult {
                        task_id: task_id.clone(),
                        error: Some(GatekeeperError::Scheduler("task dropped before completion".to_string()).to_string()),
                        ..Default::default()
                    });
                }
                _ = &mut deadline_sleep, if watch_deadline => {
                    // Once admitted, the driver enforces the deadline instead
                    watch_deadline = false;
                    if let Some(waited_ms) = self.inner.withdraw(&task_id, true) {
                        self.inner.schedule();
                        tracing::warn!(task_id = %task_id, waited_ms, "Task deadline passed while queued");
                        return TaskResult::timed_out_in_queue(task_id, waited_ms);
                    }
                }
                _ = caller_cancel.cancelled(), if watch_cancel => {
                    watch_cancel = false;
                    if let Some(waited_ms) = self.inner.withdraw(&task_id, false) {
                        self.inner.schedule();
                        tracing::info!(task_id = %task_id, waited_ms, "Task cancelled while queued");
                        return TaskResult::aborted_in_queue(task_id, waited_ms);
                    }
                }
            }
        }
    }

    /// Effective concurrency limit for a provider/model right now.
    pub fn effective_limit(&self, provider: &str, model: &str) -> u32 {
        self.inner.effective_limit_at(provider, model, now_ms())
    }

    /// Run one admission pass.
    pub fn tick(&self) {
        self.inner.schedule();
    }

    pub fn active_count(&self) -> usize {
        self.inner.lock_state().active.len()
    }

    pub fn queued_count(&self) -> usize {
        self.inner.lock_state().queues.values().map(Vec::len).sum()
    }

    pub fn stats(&self) -> SchedulerStats {
        self.inner.stats_at(now_ms())
    }

    /// One maintenance pass: adopt newer controller state from disk, run due
    /// recoveries, purge expired checkpoints, and re-run admission.
    pub async fn run_maintenance(&self) {
        self.inner.maintain(true).await;
    }

    /// Run maintenance every `maintenance_interval_ms` until `shutdown` is cancelled.
    ///
    /// Checkpoint cleanup runs at the checkpoint store's own cleanup interval.
    pub fn spawn_maintenance(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let period = Duration::from_millis(inner.config.maintenance_interval_ms.max(10));
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut last_cleanup_ms = now_ms();

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {}
                }

                let now = now_ms();
                let cleanup_due = inner
                    .checkpoints
                    .as_ref()
                    .is_some_and(|c| now.saturating_sub(last_cleanup_ms) >= c.config().cleanup_interval_ms);
                if cleanup_due {
                    last_cleanup_ms = now;
                }
                inner.maintain(cleanup_due).await;
            }
            tracing::debug!("Scheduler maintenance loop stopped");
        })
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| {
            tracing::error!("Scheduler state lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn emit(&self, event: SchedulerEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.try_send(event);
        }
    }

    /// registry preset -> learned limit -> predictive throttle -> penalty -> fleet multiplier
    fn effective_limit_at(&self, provider: &str, model: &str, now_ms: u64) -> u32 {
        let preset = self.registry.resolve(provider, model, None).concurrency;
        let learned = self.controller.get_effective_limit(provider, model, preset);
        let predicted = self
            .controller
            .get_predictive_concurrency_at(provider, model, learned, now_ms);
        let penalized = self
            .penalty
            .apply_limit_at(&model_key(provider, model), predicted, now_ms);
        match &self.hint {
            Some(hint) => scale_limit(penalized, hint.multiplier(provider, model)),
            None => penalized,
        }
    }

    async fn load_resume(&self, task_id: &str) -> Option<Checkpoint> {
        let store = self.checkpoints.as_ref()?;
        match store.load(task_id).await {
            Ok(checkpoint) => checkpoint,
            Err(e) => {
                tracing::warn!(task_id, error = %e, "Could not read checkpoint, starting fresh");
                None
            }
        }
    }

    fn enqueue(
        &self,
        task: Task,
        estimate: CostEstimate,
        resume: Option<Checkpoint>,
        responder: oneshot::Sender<TaskResult>,
    ) -> crate::error::Result<()> {
        let now = now_ms();
        let key = model_key(&task.provider, &task.model);
        let event = SchedulerEvent::Queued {
            task_id: task.id.clone(),
            key: key.clone(),
            priority: task.priority,
        };

        {
            let mut state = self.lock_state();
            if state.contains(&task.id) {
                tracing::warn!(task_id = %task.id, "Rejected duplicate task id");
                return Err(GatekeeperError::Scheduler(format!(
                    "a task with id {} is already queued or running",
                    task.id
                )));
            }
            let seq = state.next_seq;
            state.next_seq += 1;

            tracing::debug!(task_id = %task.id, key = %key, priority = %task.priority, "Task queued");
            let entry = QueueEntry {
                deadline_at_ms: task
                    .deadline
                    .map(|d| now.saturating_add(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))),
                task,
                seq,
                enqueued_at_ms: now,
                skip_count: 0,
                estimate,
                resume,
                responder,
            };
            state.queues.entry(key).or_default().push(entry);
        }

        self.emit(event);
        Ok(())
    }

    /// Remove a still-queued task. Returns how long it waited, or `None` if it was
    /// already admitted or gone.
    fn withdraw(&self, task_id: &str, timed_out: bool) -> Option<u64> {
        let now = now_ms();
        let (key, entry) = {
            let mut state = self.lock_state();
            let mut found = None;
            for (key, entries) in state.queues.iter_mut() {
                if let Some(pos) = entries.iter().position(|e| e.task.id == task_id) {
                    found = Some((key.clone(), entries.remove(pos)));
                    break;
                }
            }
            let (key, entry) = found?;
            if state.queues.get(&key).is_some_and(Vec::is_empty) {
                state.queues.remove(&key);
                state.reservations.remove(&key);
            }
            (key, entry)
        };

        self.emit(SchedulerEvent::Finished {
            task_id: task_id.to_string(),
            key,
            success: false,
            timed_out,
            aborted: !timed_out,
            preempted: false,
            execution_ms: 0,
        });
        Some(now.saturating_sub(entry.enqueued_at_ms))
    }

    /// One admission pass.
    fn schedule(self: &Arc<Self>) {
        let now = now_ms();
        let mut admissions = Vec::new();
        let mut expired = Vec::new();
        let mut events = Vec::new();
        let mut wake_after: Option<u64> = None;
        let mut arm_timer = None;

        {
            let mut state = self.lock_state();

            for entries in state.queues.values_mut() {
                let mut i = 0;
                while i < entries.len() {
                    if entries[i].deadline_at_ms.is_some_and(|d| now >= d) {
                        expired.push(entries.remove(i));
                    } else {
                        i += 1;
                    }
                }
            }
            {
                let State {
                    queues, reservations, ..
                } = &mut *state;
                queues.retain(|_, entries| !entries.is_empty());
                // A waiter that left its queue gives up the slot held for it
                reservations.retain(|key, _| queues.contains_key(key));
            }

            let mut keys: Vec<String> = state.queues.keys().cloned().collect();
            // Keys owed a slot by preempted work go first
            keys.sort_by_key(|key| !state.reservation_ready(key));
            for key in keys {
                loop {
                    if state.active.len() + state.held_for_others(&key) >= self.config.max_total_concurrent {
                        break;
                    }
                    let active_here = state.active_for(&key);
                    let reservation_ready = state.reservation_ready(&key);
                    let State {
                        queues,
                        active,
                        reservations,
                        next_seq,
                        ..
                    } = &mut *state;
                    let Some(entries) = queues.get_mut(&key) else {
                        break;
                    };
                    let Some(head) = entries.first() else {
                        break;
                    };
                    let provider = head.task.provider.clone();
                    let model = head.task.model.clone();

                    let limit = self.effective_limit_at(&provider, &model, now);
                    if active_here >= limit as usize {
                        if reservation_ready && reservations.remove(&key).is_some() {
                            tracing::debug!(key = %key, limit, "Released slot reservation, key is at its own limit");
                        }
                        break;
                    }
                    let wait = self
                        .limiter
                        .can_proceed_at(&provider, &model, self.config.tokens_per_admission, now);
                    if wait > 0 {
                        wake_after = Some(wake_after.map_or(wait, |w| w.min(wait)));
                        break;
                    }

                    let candidates: Vec<Candidate> = entries.iter().map(QueueEntry::candidate).collect();
                    let Some(selection) = select_next(&self.config.scoring, &candidates, now) else {
                        break;
                    };
                    for i in overtaken(selection) {
                        entries[i].skip_count += 1;
                    }
                    let entry = entries.remove(selection.index);
                    self.limiter
                        .consume_at(&provider, &model, self.config.tokens_per_admission, now);

                    let task_id = entry.task.id.clone();
                    let waited_ms = now.saturating_sub(entry.enqueued_at_ms);
                    let cancel = entry.task.cancel.child_token();
                    let admitted_seq = *next_seq;
                    *next_seq += 1;
                    active.insert(
                        task_id.clone(),
                        ActiveEntry {
                            key: key.clone(),
                            provider,
                            model,
                            priority: entry.task.priority,
                            started_at_ms: now,
                            admitted_seq,
                            cancel: cancel.clone(),
                            preempted_for: None,
                        },
                    );
                    if let Some(reservation) = reservations.remove(&key) {
                        tracing::debug!(
                            key = %key,
                            task_id = %task_id,
                            waiter = %reservation.waiter,
                            "Reserved slot taken"
                        );
                    }

                    if selection.promoted {
                        tracing::info!(task_id = %task_id, key = %key, skip_count = entry.skip_count, "Promoted starving task");
                        events.push(SchedulerEvent::Promoted {
                            task_id: task_id.clone(),
                            key: key.clone(),
                            skip_count: entry.skip_count,
                        });
                    }
                    tracing::info!(task_id = %task_id, key = %key, waited_ms, limit, "Task admitted");
                    events.push(SchedulerEvent::Admitted {
                        task_id,
                        key: key.clone(),
                        waited_ms,
                        effective_limit: limit,
                    });
                    admissions.push(Admission {
                        entry,
                        key: key.clone(),
                        cancel,
                        started_at_ms: now,
                    });
                }
            }
            state.queues.retain(|_, entries| !entries.is_empty());

            self.request_preemptions(&mut state, now, &mut events);

            if let Some(wait) = wake_after {
                let at = now + wait;
                if state.wake_at_ms.is_none_or(|w| at < w) {
                    state.wake_at_ms = Some(at);
                    arm_timer = Some(wait);
                }
            }
        }

        for entry in expired {
            let waited_ms = now.saturating_sub(entry.enqueued_at_ms);
            let task_id = entry.task.id.clone();
            tracing::warn!(task_id = %task_id, waited_ms, "Task deadline passed while queued");
            events.push(SchedulerEvent::Finished {
                task_id: task_id.clone(),
                key: model_key(&entry.task.provider, &entry.task.model),
                success: false,
                timed_out: true,
                aborted: false,
                preempted: false,
                execution_ms: 0,
            });
            let _ = entry
                .responder
                .send(TaskResult::timed_out_in_queue(task_id, waited_ms));
        }

        for event in events {
            self.emit(event);
        }

        for admission in admissions {
            tokio::spawn(Arc::clone(self).drive(admission));
        }

        if let Some(wait) = arm_timer {
            let inner = Arc::clone(self);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(wait.max(1))).await;
                {
                    let mut state = inner.lock_state();
                    if state.wake_at_ms.is_some_and(|w| w <= now_ms()) {
                        state.wake_at_ms = None;
                    }
                }
                inner.schedule();
            });
        }
    }

    /// Ask running work to yield to waiting work that dominates it.
    ///
    /// At most one preemption per queue key is in flight. The slot the preempted
    /// work frees is reserved for the key that asked, so it cannot be picked up by
    /// the preempted key's own queue. Work admitted after the waiter enqueued is
    /// never a victim.
    fn request_preemptions(&self, state: &mut State, now: u64, events: &mut Vec<SchedulerEvent>) {
        let mut decisions = Vec::new();

        for (key, entries) in &state.queues {
            let Some(waiter) = entries
                .iter()
                .max_by_key(|e| (e.task.priority.rank(), Reverse(e.seq)))
            else {
                continue;
            };
            let in_flight = state.reservations.contains_key(key)
                || state
                    .active
                    .values()
                    .any(|a| a.preempted_for.as_deref() == Some(key.as_str()));
            if in_flight {
                continue;
            }

            let limit = self.effective_limit_at(&waiter.task.provider, &waiter.task.model, now);
            let key_full = state.active_for(key) >= limit as usize;
            let global_full = state.active.len() + state.held_for_others(key) >= self.config.max_total_concurrent;
            if !key_full && !global_full {
                // Blocked by the token bucket, which preemption cannot help
                continue;
            }

            let victim = state
                .active
                .iter()
                .filter(|(_, a)| a.preempted_for.is_none())
                .filter(|(_, a)| a.admitted_seq < waiter.seq)
                .filter(|(_, a)| !key_full || a.key == *key)
                .filter(|(_, a)| can_preempt(waiter.task.priority, a.priority))
                .min_by_key(|(_, a)| (a.priority.rank(), Reverse(a.started_at_ms)))
                .map(|(id, _)| id.clone());

            if let Some(victim) = victim {
                decisions.push((victim, key.clone(), waiter.task.id.clone(), waiter.task.priority));
            }
        }

        for (victim, key, waiter_id, waiter_priority) in decisions {
            if let Some(active) = state.active.get_mut(&victim) {
                tracing::warn!(
                    task_id = %victim,
                    priority = %active.priority,
                    by_task_id = %waiter_id,
                    by_priority = %waiter_priority,
                    "Preempting running task"
                );
                active.preempted_for = Some(key.clone());
                active.cancel.cancel();
                events.push(SchedulerEvent::Preempted {
                    task_id: victim.clone(),
                    key: active.key.clone(),
                    by_task_id: waiter_id.clone(),
                });
                state.reservations.insert(
                    key,
                    Reservation {
                        victim,
                        waiter: waiter_id,
                    },
                );
            }
        }
    }

    /// Run admitted work to completion and fold its outcome back in.
    async fn drive(self: Arc<Self>, admission: Admission) {
        let Admission {
            entry,
            key,
            cancel,
            started_at_ms,
        } = admission;
        let QueueEntry {
            task,
            enqueued_at_ms,
            deadline_at_ms,
            estimate,
            resume,
            responder,
            ..
        } = entry;
        let Task {
            id: task_id,
            source,
            provider,
            model,
            priority,
            work,
            ..
        } = task;

        let had_resume = resume.is_some();
        let progress = Arc::new(Mutex::new(None));
        let ctx = TaskContext::new(task_id.clone(), cancel.clone(), resume, progress.clone());

        let mut handle = tokio::spawn(work.run(ctx));
        let mut timed_out = false;
        let joined = match deadline_at_ms {
            Some(deadline) => {
                let remaining = Duration::from_millis(deadline.saturating_sub(now_ms()));
                tokio::select! {
                    joined = &mut handle => joined,
                    _ = tokio::time::sleep(remaining) => {
                        timed_out = true;
                        tracing::warn!(task_id = %task_id, "Task deadline passed while running, cancelling");
                        cancel.cancel();
                        handle.await
                    }
                }
            }
            None => handle.await,
        };
        let outcome: Result<Value, WorkError> =
            joined.unwrap_or_else(|e| Err(WorkError::new(format!("task panicked: {}", e))));
        let execution_ms = now_ms().saturating_sub(started_at_ms);

        let preempted = self
            .lock_state()
            .active
            .get(&task_id)
            .is_some_and(|a| a.preempted_for.is_some());
        let cancel_requested = cancel.is_cancelled();

        let mut result = TaskResult {
            task_id: task_id.clone(),
            waited_ms: started_at_ms.saturating_sub(enqueued_at_ms),
            execution_ms,
            timed_out,
            ..Default::default()
        };
        let (class, retry_after_ms) = match outcome {
            Ok(value) if !timed_out => {
                result.success = true;
                result.result = Some(value);
                (None, None)
            }
            Ok(value) => {
                result.result = Some(value);
                result.error = Some("deadline exceeded".to_string());
                (Some(ErrorClass::Timeout), None)
            }
            Err(e) => {
                result.aborted = cancel_requested && !timed_out;
                result.preempted = preempted;
                let class = if timed_out {
                    ErrorClass::Timeout
                } else if let Some(class) = e.class {
                    class
                } else if cancel_requested {
                    ErrorClass::Cancelled
                } else {
                    self.classifier.classify(&e.message)
                };
                result.error = Some(e.message);
                (Some(class), e.retry_after_ms)
            }
        };

        self.record_feedback(&provider, &model, class, retry_after_ms).await;
        if class != Some(ErrorClass::Cancelled) {
            self.estimator.record_execution(ExecutionRecord {
                source,
                provider: Some(provider.clone()),
                model: Some(model.clone()),
                duration_ms: execution_ms,
                tokens: estimate.estimated_tokens,
                success: result.success,
                recorded_at: now_ms(),
            });
        }

        if let Some(store) = &self.checkpoints {
            let snapshot = match progress.lock() {
                Ok(guard) => guard.clone(),
                Err(poisoned) => poisoned.into_inner().clone(),
            };
            if result.success {
                if (had_resume || snapshot.is_some())
                    && let Err(e) = store.delete(&task_id).await
                {
                    tracing::warn!(task_id = %task_id, error = %e, "Could not delete checkpoint of finished task");
                }
            } else if (result.aborted || result.preempted)
                && let Some(snapshot) = snapshot
            {
                let checkpoint = Checkpoint::new(task_id.clone(), source, provider.clone(), model.clone(), priority)
                    .with_state(snapshot.state, snapshot.progress);
                let saved = store.save(checkpoint).await;
                if saved.success {
                    result.checkpoint_id = Some(saved.checkpoint_id);
                }
            }
        }

        self.lock_state().active.remove(&task_id);
        tracing::info!(
            task_id = %task_id,
            key = %key,
            success = result.success,
            timed_out = result.timed_out,
            aborted = result.aborted,
            preempted = result.preempted,
            execution_ms,
            "Task finished"
        );
        self.emit(SchedulerEvent::Finished {
            task_id,
            key,
            success: result.success,
            timed_out: result.timed_out,
            aborted: result.aborted,
            preempted: result.preempted,
            execution_ms,
        });

        self.schedule();
        let _ = responder.send(result);
    }

    /// Route an outcome into the token bucket, learned limits and penalty.
    async fn record_feedback(&self, provider: &str, model: &str, class: Option<ErrorClass>, retry_after_ms: Option<u64>) {
        let context = model_key(provider, model);
        match class {
            None => {
                self.limiter.record_success(provider, model);
                self.penalty.lower(&context);
                self.controller
                    .record_event(RateEvent::new(RateEventKind::Success, provider, model))
                    .await;
            }
            Some(throttle) if throttle.is_throttle() => {
                let reason = if throttle == ErrorClass::RateLimited {
                    PenaltyReason::RateLimit
                } else {
                    PenaltyReason::Capacity
                };
                self.limiter.record_429(provider, model, retry_after_ms);
                self.penalty.raise(&context, reason);
                self.controller
                    .record_event(RateEvent::new(RateEventKind::RateLimited, provider, model))
                    .await;
            }
            Some(ErrorClass::Timeout) => {
                self.penalty.raise(&context, PenaltyReason::Timeout);
                self.controller
                    .record_event(RateEvent::new(RateEventKind::Timeout, provider, model))
                    .await;
            }
            Some(ErrorClass::Cancelled) => {}
            Some(_) => {
                self.penalty.raise(&context, PenaltyReason::Error);
                self.controller
                    .record_event(RateEvent::new(RateEventKind::Error, provider, model))
                    .await;
            }
        }
    }

    async fn maintain(self: &Arc<Self>, cleanup_checkpoints: bool) {
        match self.controller.refresh().await {
            Ok(true) => tracing::debug!("Adopted newer learned-limit state from disk"),
            Ok(false) => {}
            Err(e) => tracing::warn!(error = %e, "Could not refresh learned-limit state"),
        }

        let recovered = self.controller.process_recovery().await;
        if recovered > 0 {
            tracing::info!(recovered, "Learned limits recovered");
        }

        if cleanup_checkpoints && let Some(store) = &self.checkpoints {
            match store.cleanup().await {
                Ok(removed) if removed > 0 => tracing::info!(removed, "Purged expired checkpoints"),
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "Checkpoint cleanup failed"),
            }
        }

        self.schedule();
    }

    fn stats_at(&self, now: u64) -> SchedulerStats {
        let state = self.lock_state();
        let mut keys: BTreeMap<String, (String, String)> = BTreeMap::new();
        for (key, entries) in &state.queues {
            if let Some(head) = entries.first() {
                keys.insert(key.clone(), (head.task.provider.clone(), head.task.model.clone()));
            }
        }
        for active in state.active.values() {
            keys.entry(active.key.clone())
                .or_insert_with(|| (active.provider.clone(), active.model.clone()));
        }

        let queues: Vec<QueueStats> = keys
            .into_iter()
            .map(|(key, (provider, model))| {
                let entries = state.queues.get(&key);
                let queued = entries.map(Vec::len).unwrap_or(0);
                let starving = entries
                    .map(|e| {
                        e.iter()
                            .filter(|entry| self.config.scoring.is_starving(&entry.candidate(), now))
                            .count()
                    })
                    .unwrap_or(0);
                QueueStats {
                    active: state.active_for(&key),
                    effective_limit: self.effective_limit_at(&provider, &model, now),
                    key,
                    provider,
                    model,
                    queued,
                    starving,
                }
            })
            .collect();

        SchedulerStats {
            total_active: state.active.len(),
            total_queued: queues.iter().map(|q| q.queued).sum(),
            max_total_concurrent: self.config.max_total_concurrent,
            queues,
        }
    }
}
