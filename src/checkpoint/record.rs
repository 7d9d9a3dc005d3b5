use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::id::{generate_checkpoint_id, now_ms};
use crate::types::{TaskPriority, TaskSource};

/// Snapshot of an in-flight task.
///
/// Source, provider, model and priority are copied from the task so a checkpoint can
/// be resumed without the original task at hand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub id: String,
    pub task_id: String,
    pub source: TaskSource,
    pub provider: String,
    pub model: String,
    pub priority: TaskPriority,
    /// Task-defined payload.
    pub state: Value,
    /// Fraction complete, in [0, 1].
    pub progress: f64,
    pub created_at: u64,
    /// Zero means "use the manager's default TTL".
    pub ttl_ms: u64,
}

impl Checkpoint {
    pub fn new(
        task_id: impl Into<String>,
        source: TaskSource,
        provider: impl Into<String>,
        model: impl Into<String>,
        priority: TaskPriority,
    ) -> Self {
        let task_id = task_id.into();
        Self {
            id: generate_checkpoint_id(&task_id),
            task_id,
            source,
            provider: provider.into(),
            model: model.into(),
            priority,
            state: Value::Null,
            progress: 0.0,
            created_at: now_ms(),
            ttl_ms: 0,
        }
    }

    pub fn with_state(mut self, state: Value, progress: f64) -> Self {
        self.state = state;
        self.progress = progress;
        self
    }

    pub fn with_ttl(mut self, ttl_ms: u64) -> Self {
        self.ttl_ms = ttl_ms;
        self
    }

    pub fn expires_at(&self) -> u64 {
        self.created_at.saturating_add(self.ttl_ms)
    }

    pub fn is_expired_at(&self, now_ms: u64) -> bool {
        now_ms >= self.expires_at()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_checkpoint_defaults() {
        let ckpt = Checkpoint::new("task-1", TaskSource::Team, "openai", "gpt-4o", TaskPriority::Low);
        assert!(ckpt.id.starts_with("ckpt-task-1-"));
        assert_eq!(ckpt.progress, 0.0);
        assert_eq!(ckpt.state, Value::Null);
    }

    #[test]
    fn test_expiry() {
        let mut ckpt = Checkpoint::new("t", TaskSource::Subagent, "p", "m", TaskPriority::Normal).with_ttl(1_000);
        ckpt.created_at = 10_000;
        assert_eq!(ckpt.expires_at(), 11_000);
        assert!(!ckpt.is_expired_at(10_999));
        assert!(ckpt.is_expired_at(11_000));
    }

    #[test]
    fn test_serializes_camel_case() {
        let ckpt = Checkpoint::new("t", TaskSource::ParallelTeam, "p", "m", TaskPriority::High)
            .with_state(json!({"step": 3}), 0.5);
        let value = serde_json::to_value(&ckpt).unwrap();
        assert_eq!(value["taskId"], "t");
        assert_eq!(value["source"], "parallel-team");
        assert_eq!(value["ttlMs"], 0);
        assert_eq!(value["state"]["step"], 3);
    }
}
