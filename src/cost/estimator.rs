//! Historical cost estimator.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use super::{CostEstimate, EstimationMethod, ExecutionRecord};
use crate::types::TaskSource;

/// Confidence assigned to table defaults.
const DEFAULT_CONFIDENCE: f64 = 0.3;
/// Historical estimates never claim more than this.
const MAX_HISTORICAL_CONFIDENCE: f64 = 0.95;
/// Descriptions longer than this start scaling the estimate up.
const DESCRIPTION_BASELINE_CHARS: usize = 200;
/// Upper bound of the description scaling, as a fraction.
const DESCRIPTION_MAX_SCALE: f64 = 0.5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct CostEstimatorConfig {
    pub min_historical_executions: usize,
    pub max_history_per_source: usize,
}

impl Default for CostEstimatorConfig {
    fn default() -> Self {
        Self {
            min_historical_executions: 5,
            max_history_per_source: 100,
        }
    }
}

/// Table default for a source: `(duration_ms, tokens)`.
pub fn default_estimate(source: TaskSource) -> (u64, u64) {
    match source {
        TaskSource::Subagent => (60_000, 8_000),
        TaskSource::Team => (120_000, 16_000),
        TaskSource::ParallelSubagent => (90_000, 12_000),
        TaskSource::ParallelTeam => (180_000, 24_000),
    }
}

type History = HashMap<TaskSource, Arc<VecDeque<ExecutionRecord>>>;

/// Cost estimator backed by a bounded per-source execution history.
///
/// Writers swap in a new history map; readers clone the current `Arc` and never
/// wait on a writer past that clone.
#[derive(Debug, Default)]
pub struct CostEstimator {
    config: CostEstimatorConfig,
    history: RwLock<Arc<History>>,
}

impl CostEstimator {
    pub fn new(config: CostEstimatorConfig) -> Self {
        Self {
            config,
            history: RwLock::new(Arc::new(HashMap::new())),
        }
    }

    fn snapshot(&self) -> Arc<History> {
        match self.history.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Estimate cost for a task of `source`, optionally narrowed to a provider/model.
    pub fn estimate(
        &self,
        source: TaskSource,
        provider: Option<&str>,
        model: Option<&str>,
        description: Option<&str>,
    ) -> CostEstimate {
        let history = self.snapshot();
        let ring = history.get(&source);
        let min = self.config.min_historical_executions.max(1);

        let successes = || ring.into_iter().flat_map(|r| r.iter()).filter(|r| r.success);

        let estimate = match (provider, model) {
            (Some(p), Some(m)) => {
                let matching: Vec<&ExecutionRecord> = successes()
                    .filter(|r| {
                        r.provider.as_deref().is_some_and(|rp| rp.eq_ignore_ascii_case(p))
                            && r.model.as_deref().is_some_and(|rm| rm.eq_ignore_ascii_case(m))
                    })
                    .collect();
                (matching.len() >= min).then(|| historical(&matching, EstimationMethod::HistoricalModel))
            }
            _ => None,
        };

        let estimate = estimate.or_else(|| {
            let all: Vec<&ExecutionRecord> = successes().collect();
            (all.len() >= min).then(|| historical(&all, EstimationMethod::Historical))
        });

        let estimate = estimate.unwrap_or_else(|| {
            let (duration, tokens) = default_estimate(source);
            CostEstimate {
                estimated_duration_ms: duration,
                estimated_tokens: tokens,
                confidence: DEFAULT_CONFIDENCE,
                method: EstimationMethod::Default,
            }
        });

        match description {
            Some(text) => scale_for_description(estimate, text),
            None => estimate,
        }
    }

    /// Append an execution to its source's ring buffer.
    pub fn record_execution(&self, record: ExecutionRecord) {
        let mut guard = match self.history.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let mut next: History = (**guard).clone();
        let ring = Arc::make_mut(next.entry(record.source).or_default());
        ring.push_back(record);
        while ring.len() > self.config.max_history_per_source.max(1) {
            ring.pop_front();
        }
        *guard = Arc::new(next);
    }

    /// Number of recorded executions for a source.
    pub fn history_len(&self, source: TaskSource) -> usize {
        self.snapshot().get(&source).map(|r| r.len()).unwrap_or(0)
    }
}

fn historical(records: &[&ExecutionRecord], method: EstimationMethod) -> CostEstimate {
    let n = records.len() as f64;
    let duration = records.iter().map(|r| r.duration_ms as f64).sum::<f64>() / n;
    let tokens = records.iter().map(|r| r.tokens as f64).sum::<f64>() / n;
    CostEstimate {
        estimated_duration_ms: duration.round() as u64,
        estimated_tokens: tokens.round() as u64,
        confidence: (n / (n + 5.0)).min(MAX_HISTORICAL_CONFIDENCE),
        method,
    }
}

fn scale_for_description(mut estimate: CostEstimate, description: &str) -> CostEstimate {
    let extra = description.chars().count().saturating_sub(DESCRIPTION_BASELINE_CHARS);
    if extra == 0 {
        return estimate;
    }
    let factor = 1.0 + (extra as f64 / 2000.0).min(DESCRIPTION_MAX_SCALE);
    estimate.estimated_duration_ms = (estimate.estimated_duration_ms as f64 * factor).round() as u64;
    estimate.estimated_tokens = (estimate.estimated_tokens as f64 * factor).round() as u64;
    estimate
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(source: TaskSource, model: Option<&str>, duration_ms: u64) -> ExecutionRecord {
        ExecutionRecord {
            source,
            provider: model.map(|_| "anthropic".to_string()),
            model: model.map(str::to_string),
            duration_ms,
            tokens: duration_ms / 10,
            success: true,
            recorded_at: 0,
        }
    }

    #[test]
    fn test_default_table_without_history() {
        let estimator = CostEstimator::default();
        let estimate = estimator.estimate(TaskSource::Team, None, None, None);
        assert_eq!(estimate.method, EstimationMethod::Default);
        assert_eq!(estimate.estimated_duration_ms, 120_000);
        assert_eq!(estimate.estimated_tokens, 16_000);
        assert_eq!(estimate.confidence, DEFAULT_CONFIDENCE);
    }

    #[test]
    fn test_historical_after_minimum() {
        let estimator = CostEstimator::new(CostEstimatorConfig::default());
        for _ in 0..4 {
            estimator.record_execution(record(TaskSource::Subagent, None, 10_000));
        }
        assert_eq!(
            estimator.estimate(TaskSource::Subagent, None, None, None).method,
            EstimationMethod::Default
        );

        estimator.record_execution(record(TaskSource::Subagent, None, 20_000));
        let estimate = estimator.estimate(TaskSource::Subagent, None, None, None);
        assert_eq!(estimate.method, EstimationMethod::Historical);
        assert_eq!(estimate.estimated_duration_ms, 12_000);
        assert!((estimate.confidence - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_model_specific_history_preferred() {
        let estimator = CostEstimator::default();
        for _ in 0..5 {
            estimator.record_execution(record(TaskSource::Subagent, Some("claude-3-haiku"), 5_000));
            estimator.record_execution(record(TaskSource::Subagent, None, 50_000));
        }

        let specific = estimator.estimate(TaskSource::Subagent, Some("anthropic"), Some("claude-3-haiku"), None);
        assert_eq!(specific.method, EstimationMethod::HistoricalModel);
        assert_eq!(specific.estimated_duration_ms, 5_000);

        let other = estimator.estimate(TaskSource::Subagent, Some("anthropic"), Some("claude-3-opus"), None);
        assert_eq!(other.method, EstimationMethod::Historical);
    }

    #[test]
    fn test_confidence_capped() {
        let estimator = CostEstimator::new(CostEstimatorConfig {
            min_historical_executions: 1,
            max_history_per_source: 1000,
        });
        for _ in 0..500 {
            estimator.record_execution(record(TaskSource::Team, None, 1_000));
        }
        let estimate = estimator.estimate(TaskSource::Team, None, None, None);
        assert!(estimate.confidence <= MAX_HISTORICAL_CONFIDENCE);
        assert!(estimate.confidence < 1.0);
    }

    #[test]
    fn test_ring_buffer_bounded() {
        let estimator = CostEstimator::new(CostEstimatorConfig {
            min_historical_executions: 1,
            max_history_per_source: 3,
        });
        for d in [1_000, 1_000, 1_000, 9_000, 9_000, 9_000] {
            estimator.record_execution(record(TaskSource::Team, None, d));
        }
        assert_eq!(estimator.history_len(TaskSource::Team), 3);
        assert_eq!(
            estimator.estimate(TaskSource::Team, None, None, None).estimated_duration_ms,
            9_000
        );
    }

    #[test]
    fn test_failed_executions_ignored() {
        let estimator = CostEstimator::new(CostEstimatorConfig {
            min_historical_executions: 1,
            max_history_per_source: 10,
        });
        let mut failed = record(TaskSource::Team, None, 1);
        failed.success = false;
        estimator.record_execution(failed);
        assert_eq!(
            estimator.estimate(TaskSource::Team, None, None, None).method,
            EstimationMethod::Default
        );
    }

    #[test]
    fn test_long_description_scales_estimate() {
        let estimator = CostEstimator::default();
        let short = estimator.estimate(TaskSource::Subagent, None, None, Some("fix typo"));
        assert_eq!(short.estimated_duration_ms, 60_000);

        let long_text = "x".repeat(1_200);
        let long = estimator.estimate(TaskSource::Subagent, None, None, Some(&long_text));
        assert_eq!(long.estimated_duration_ms, 90_000);
        assert_eq!(long.estimated_tokens, 12_000);
    }
}
