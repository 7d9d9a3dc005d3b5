//! Shared task vocabulary: work kinds and priorities.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::GatekeeperError;

/// Kind of delegated work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskSource {
    Subagent,
    Team,
    ParallelSubagent,
    ParallelTeam,
}

impl TaskSource {
    pub const ALL: [TaskSource; 4] = [
        TaskSource::Subagent,
        TaskSource::Team,
        TaskSource::ParallelSubagent,
        TaskSource::ParallelTeam,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskSource::Subagent => "subagent",
            TaskSource::Team => "team",
            TaskSource::ParallelSubagent => "parallel-subagent",
            TaskSource::ParallelTeam => "parallel-team",
        }
    }
}

impl fmt::Display for TaskSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TaskSource {
    type Err = GatekeeperError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskSource::ALL
            .into_iter()
            .find(|source| source.as_str() == s.trim().to_lowercase())
            .ok_or_else(|| GatekeeperError::Config(format!("unknown task source: {}", s)))
    }
}

/// Task priority, most important first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Critical,
    High,
    #[default]
    Normal,
    Low,
    Background,
}

impl TaskPriority {
    pub const ALL: [TaskPriority; 5] = [
        TaskPriority::Critical,
        TaskPriority::High,
        TaskPriority::Normal,
        TaskPriority::Low,
        TaskPriority::Background,
    ];

    /// Normalized priority term for scoring, 1.0 for critical down to 0.0.
    pub fn value(&self) -> f64 {
        match self {
            TaskPriority::Critical => 1.0,
            TaskPriority::High => 0.75,
            TaskPriority::Normal => 0.5,
            TaskPriority::Low => 0.25,
            TaskPriority::Background => 0.0,
        }
    }

    /// Higher rank is more important.
    pub fn rank(&self) -> u8 {
        match self {
            TaskPriority::Critical => 4,
            TaskPriority::High => 3,
            TaskPriority::Normal => 2,
            TaskPriority::Low => 1,
            TaskPriority::Background => 0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskPriority::Critical => "critical",
            TaskPriority::High => "high",
            TaskPriority::Normal => "normal",
            TaskPriority::Low => "low",
            TaskPriority::Background => "background",
        }
    }
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TaskPriority {
    type Err = GatekeeperError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskPriority::ALL
            .into_iter()
            .find(|p| p.as_str() == s.trim().to_lowercase())
            .ok_or_else(|| GatekeeperError::Config(format!("unknown priority: {}", s)))
    }
}
