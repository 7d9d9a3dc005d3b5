//! Units of work submitted to the scheduler.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::checkpoint::Checkpoint;
use crate::cost::CostEstimate;
use crate::id::generate_task_id;
use crate::ratelimit::ErrorClass;
use crate::types::{TaskPriority, TaskSource};

/// Error returned by task work.
///
/// `class` overrides message-based classification; `retry_after_ms` is forwarded to
/// the token bucket when the error is a rate limit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkError {
    pub message: String,
    pub class: Option<ErrorClass>,
    pub retry_after_ms: Option<u64>,
}

impl WorkError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn rate_limited(message: impl Into<String>, retry_after_ms: Option<u64>) -> Self {
        Self {
            message: message.into(),
            class: Some(ErrorClass::RateLimited),
            retry_after_ms,
        }
    }

    pub fn cancelled() -> Self {
        Self {
            message: "cancelled".to_string(),
            class: Some(ErrorClass::Cancelled),
            retry_after_ms: None,
        }
    }

    pub fn with_class(mut self, class: ErrorClass) -> Self {
        self.class = Some(class);
        self
    }
}

impl fmt::Display for WorkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for WorkError {}

impl From<String> for WorkError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for WorkError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

/// The work a task performs once admitted.
///
/// Implementations should watch [`TaskContext::cancelled`] at their await points;
/// the scheduler never force-stops work.
#[async_trait]
pub trait TaskWork: Send {
    async fn run(self: Box<Self>, ctx: TaskContext) -> Result<Value, WorkError>;
}

struct FnWork<F>(F);

#[async_trait]
impl<F, Fut> TaskWork for FnWork<F>
where
    F: FnOnce(TaskContext) -> Fut + Send + 'static,
    Fut: Future<Output = Result<Value, WorkError>> + Send + 'static,
{
    async fn run(self: Box<Self>, ctx: TaskContext) -> Result<Value, WorkError> {
        let FnWork(f) = *self;
        f(ctx).await
    }
}

/// Latest progress a running task reported.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub progress: f64,
    pub state: Value,
}

/// Handle passed to running work.
#[derive(Debug, Clone)]
pub struct TaskContext {
    task_id: String,
    cancel: CancellationToken,
    resume: Option<Checkpoint>,
    progress: Arc<Mutex<Option<ProgressSnapshot>>>,
}

impl TaskContext {
    pub(crate) fn new(
        task_id: String,
        cancel: CancellationToken,
        resume: Option<Checkpoint>,
        progress: Arc<Mutex<Option<ProgressSnapshot>>>,
    ) -> Self {
        Self {
            task_id,
            cancel,
            resume,
            progress,
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Checkpoint left by an earlier preempted or cancelled run, if still live.
    pub fn resume(&self) -> Option<&Checkpoint> {
        self.resume.as_ref()
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when the caller cancels, the deadline passes, or the task is preempted.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Record the state to checkpoint if this run is preempted or cancelled.
    pub fn report_progress(&self, progress: f64, state: Value) {
        let snapshot = ProgressSnapshot {
            progress: progress.clamp(0.0, 1.0),
            state,
        };
        match self.progress.lock() {
            Ok(mut guard) => *guard = Some(snapshot),
            Err(poisoned) => *poisoned.into_inner() = Some(snapshot),
        }
    }
}

/// A task as submitted by the caller.
pub struct Task {
    pub id: String,
    pub source: TaskSource,
    pub provider: String,
    pub model: String,
    pub priority: TaskPriority,
    /// Caller-supplied estimate; the cost estimator fills it in when absent.
    pub cost: Option<CostEstimate>,
    pub description: Option<String>,
    /// Covers both queue wait and execution.
    pub deadline: Option<Duration>,
    pub cancel: CancellationToken,
    pub(crate) work: Box<dyn TaskWork>,
}

impl Task {
    pub fn new(
        source: TaskSource,
        provider: impl Into<String>,
        model: impl Into<String>,
        work: impl TaskWork + 'static,
    ) -> Self {
        Self {
            id: generate_task_id(),
            source,
            provider: provider.into(),
            model: model.into(),
            priority: TaskPriority::default(),
            cost: None,
            description: None,
            deadline: None,
            cancel: CancellationToken::new(),
            work: Box::new(work),
        }
    }

    /// Task whose work is an async closure.
    pub fn from_fn<F, Fut>(source: TaskSource, provider: impl Into<String>, model: impl Into<String>, f: F) -> Self
    where
        F: FnOnce(TaskContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Value, WorkError>> + Send + 'static,
    {
        Self::new(source, provider, model, FnWork(f))
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_cost(mut self, cost: CostEstimate) -> Self {
        self.cost = Some(cost);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("source", &self.source)
            .field("provider", &self.provider)
            .field("model", &self.model)
            .field("priority", &self.priority)
            .field("cost", &self.cost)
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}

/// Outcome of a submitted task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    pub task_id: String,
    pub success: bool,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub waited_ms: u64,
    pub execution_ms: u64,
    pub timed_out: bool,
    pub aborted: bool,
    pub preempted: bool,
    /// Checkpoint written when the run was preempted or cancelled.
    pub checkpoint_id: Option<String>,
}

impl TaskResult {
    pub(crate) fn timed_out_in_queue(task_id: String, waited_ms: u64) -> Self {
        Self {
            task_id,
            error: Some("deadline exceeded while queued".to_string()),
            waited_ms,
            timed_out: true,
            ..Default::default()
        }
    }

    pub(crate) fn aborted_in_queue(task_id: String, waited_ms: u64) -> Self {
        Self {
            task_id,
            error: Some("cancelled while queued".to_string()),
            waited_ms,
            aborted: true,
            ..Default::default()
        }
    }
}
