//! Hooks for collaborators outside the scheduler.

use serde::{Deserialize, Serialize};

use crate::types::TaskPriority;

/// Lifecycle events for an external metrics collector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SchedulerEvent {
    Queued {
        task_id: String,
        key: String,
        priority: TaskPriority,
    },
    Admitted {
        task_id: String,
        key: String,
        waited_ms: u64,
        effective_limit: u32,
    },
    /// Admitted ahead of its score because it was starving.
    Promoted {
        task_id: String,
        key: String,
        skip_count: u32,
    },
    Preempted {
        task_id: String,
        key: String,
        by_task_id: String,
    },
    Finished {
        task_id: String,
        key: String,
        success: bool,
        timed_out: bool,
        aborted: bool,
        preempted: bool,
        execution_ms: u64,
    },
}

impl SchedulerEvent {
    pub fn task_id(&self) -> &str {
        match self {
            SchedulerEvent::Queued { task_id, .. }
            | SchedulerEvent::Admitted { task_id, .. }
            | SchedulerEvent::Promoted { task_id, .. }
            | SchedulerEvent::Preempted { task_id, .. }
            | SchedulerEvent::Finished { task_id, .. } => task_id,
        }
    }
}

/// Fleet-wide parallelism budget, folded into every effective limit.
///
/// A multi-process coordinator implements this to give each instance its share.
pub trait ParallelismHint: Send + Sync {
    /// Multiplier applied to the effective limit for a provider/model, usually in (0, 1].
    fn multiplier(&self, provider: &str, model: &str) -> f64;
}

/// A constant multiplier.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FixedParallelism(pub f64);

impl ParallelismHint for FixedParallelism {
    fn multiplier(&self, _provider: &str, _model: &str) -> f64 {
        self.0
    }
}

/// Apply a multiplier to a limit: floor, never below 1.
pub fn scale_limit(limit: u32, multiplier: f64) -> u32 {
    if !multiplier.is_finite() || multiplier <= 0.0 {
        return 1;
    }
    ((limit as f64 * multiplier).floor() as u32).max(1)
}
