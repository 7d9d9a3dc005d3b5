//! Hybrid scoring for queued tasks.
//!
//! A task's score combines:
//! - Priority value (critical=1.0 down to background=0.0)
//! - Shortest-job-first: shorter estimated duration scores closer to 1.0
//! - Fair queueing: earlier virtual finish time scores closer to 1.0
//! - Aging credit for entries that keep getting passed over
//!
//! Scores are relative to the other entries in the same queue. Starving entries
//! skip scoring entirely and are promoted.

use serde::{Deserialize, Serialize};

use crate::types::TaskPriority;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ScoringConfig {
    pub priority_weight: f64,
    pub sjf_weight: f64,
    pub fair_queue_weight: f64,
    /// Credit per skip, as a fraction of the priority weight, reached at `max_skip_count`.
    pub aging_weight: f64,
    /// Wait after which an entry is promoted regardless of score.
    pub starvation_threshold_ms: u64,
    /// Skips after which an entry is promoted regardless of score.
    pub max_skip_count: u32,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            priority_weight: 0.6,
            sjf_weight: 0.25,
            fair_queue_weight: 0.15,
            aging_weight: 0.1,
            starvation_threshold_ms: 5 * 60 * 1000,
            max_skip_count: 10,
        }
    }
}

/// What scoring needs to know about a queued entry.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub priority: TaskPriority,
    pub enqueued_at_ms: u64,
    pub estimated_duration_ms: u64,
    pub estimated_tokens: u64,
    pub skip_count: u32,
}

/// Shortest-job-first term in [0, 1]. A zero normalizer returns 1.0.
pub fn sjf_score(duration_ms: u64, max_duration_ms: u64) -> f64 {
    if max_duration_ms == 0 {
        return 1.0;
    }
    1.0 - (duration_ms.min(max_duration_ms) as f64 / max_duration_ms as f64)
}

/// Virtual finish time: arrival plus token cost scaled down by priority.
pub fn virtual_finish(candidate: &Candidate) -> f64 {
    let weight = candidate.priority.rank() as f64 + 1.0;
    candidate.enqueued_at_ms as f64 + candidate.estimated_tokens as f64 / weight
}

/// Fair-queue term in [0, 1]; the earliest virtual finish scores 1.0.
pub fn fair_queue_score(finish: f64, min_finish: f64, max_finish: f64) -> f64 {
    let span = max_finish - min_finish;
    if span <= f64::EPSILON {
        return 1.0;
    }
    1.0 - (finish - min_finish) / span
}

impl ScoringConfig {
    /// Whether an entry has waited or been skipped long enough to be promoted.
    pub fn is_starving(&self, candidate: &Candidate, now_ms: u64) -> bool {
        candidate.skip_count >= self.max_skip_count
            || now_ms.saturating_sub(candidate.enqueued_at_ms) >= self.starvation_threshold_ms
    }

    fn aging_credit(&self, skip_count: u32) -> f64 {
        if self.max_skip_count == 0 {
            return 0.0;
        }
        let ratio = (skip_count as f64 / self.max_skip_count as f64).min(1.0);
        self.aging_weight * self.priority_weight * ratio
    }

    /// Score every candidate. Higher wins.
    pub fn score_all(&self, candidates: &[Candidate]) -> Vec<f64> {
        let max_duration = candidates.iter().map(|c| c.estimated_duration_ms).max().unwrap_or(0);
        let finishes: Vec<f64> = candidates.iter().map(virtual_finish).collect();
        let min_finish = finishes.iter().copied().fold(f64::INFINITY, f64::min);
        let max_finish = finishes.iter().copied().fold(f64::NEG_INFINITY, f64::max);

        candidates
            .iter()
            .zip(&finishes)
            .map(|(c, &finish)| {
                self.priority_weight * c.priority.value()
                    + self.sjf_weight * sjf_score(c.estimated_duration_ms, max_duration)
                    + self.fair_queue_weight * fair_queue_score(finish, min_finish, max_finish)
                    + self.aging_credit(c.skip_count)
            })
            .collect()
    }
}
