//! Admission-controlled priority scheduling.
//!
//! This module provides:
//! - **Tasks**: caller-constructed work with a priority, a cost estimate, an optional
//!   deadline and a cancellation token.
//! - **Scoring**: hybrid priority / shortest-job-first / fair-queue score with
//!   starvation promotion.
//! - **Preemption**: a fixed matrix of which priorities may preempt which.
//! - **Scheduler**: per-`provider:model` queues admitted against the limit registry,
//!   learned limits, penalty and token bucket.
//!
//! # Example
//!
//! ```ignore
//! use gatekeeper::scheduler::{Scheduler, SchedulerConfig, Task};
//! use gatekeeper::types::{TaskPriority, TaskSource};
//!
//! let scheduler = Scheduler::builder(SchedulerConfig::default()).build();
//! let task = Task::from_fn(TaskSource::Subagent, "anthropic", "claude-3-haiku", |ctx| async move {
//!     Ok(serde_json::json!({"task": ctx.task_id()}))
//! })
//! .with_priority(TaskPriority::High);
//!
//! let result = scheduler.submit(task).await;
//! ```

mod events;
mod manager;
mod preempt;
mod priority;
mod select;
mod task;

pub use events::{FixedParallelism, ParallelismHint, SchedulerEvent, scale_limit};
pub use manager::{QueueStats, Scheduler, SchedulerBuilder, SchedulerConfig, SchedulerStats};
pub use preempt::can_preempt;
pub use priority::{Candidate, ScoringConfig, fair_queue_score, sjf_score, virtual_finish};
pub use select::{Selection, overtaken, select_next};
pub use task::{ProgressSnapshot, Task, TaskContext, TaskResult, TaskWork, WorkError};
