//! Duration/token estimates for pending tasks.
//!
//! The scheduler's shortest-job-first term reads these. Estimates come from a
//! fixed per-source table until enough executions are on record.

mod estimator;

pub use estimator::{CostEstimator, CostEstimatorConfig, default_estimate};

use serde::{Deserialize, Serialize};

use crate::types::TaskSource;

/// How an estimate was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EstimationMethod {
    Default,
    Historical,
    HistoricalModel,
}

impl EstimationMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            EstimationMethod::Default => "default",
            EstimationMethod::Historical => "historical",
            EstimationMethod::HistoricalModel => "historical-model",
        }
    }
}

/// Cost estimate for a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CostEstimate {
    pub estimated_duration_ms: u64,
    pub estimated_tokens: u64,
    pub confidence: f64,
    pub method: EstimationMethod,
}

impl CostEstimate {
    /// Caller-supplied estimate with full confidence.
    pub fn fixed(estimated_duration_ms: u64, estimated_tokens: u64) -> Self {
        Self {
            estimated_duration_ms,
            estimated_tokens,
            confidence: 1.0,
            method: EstimationMethod::Default,
        }
    }
}

/// One completed execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRecord {
    pub source: TaskSource,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub duration_ms: u64,
    pub tokens: u64,
    pub success: bool,
    pub recorded_at: u64,
}
