//! Gatekeeper - admission control and priority scheduling for rate-limited agent work
//!
//! Gatekeeper sits between callers that submit agent tasks (subagents, teams, parallel
//! fan-outs) and the model providers those tasks call. It decides when each task may
//! start, based on static provider limits, limits learned from 429s, a token bucket,
//! a decaying penalty and task priority, and it checkpoints work it preempts.

pub mod checkpoint;
pub mod config;
pub mod cost;
pub mod error;
pub mod id;
pub mod limits;
pub mod ratelimit;
pub mod scheduler;
pub mod storage;
pub mod types;

pub use config::GatekeeperConfig;
pub use error::{GatekeeperError, Result};
pub use scheduler::{Scheduler, SchedulerConfig, Task, TaskContext, TaskResult, WorkError};
pub use types::{TaskPriority, TaskSource};
