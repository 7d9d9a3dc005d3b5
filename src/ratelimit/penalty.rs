//! Adaptive penalty controller.
//!
//! A short-memory penalty scalar per context (usually `provider:model`). It is
//! raised on rate-limit, capacity and timeout signals, reset on confirmed
//! success, and decays toward 0 with elapsed time. The scheduler subtracts it
//! from the concurrency limit, which makes it the fast defense layer in front
//! of the slower learned limit.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::id::now_ms;

/// How the penalty decays between raises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecayStrategy {
    /// Constant rate: a full `max_penalty` drains in `decay_ms`.
    Linear,
    /// Halves every `decay_ms / 4`.
    Exponential,
    /// Exponential shape with the linear drain on top.
    Hybrid,
}

/// Why the penalty was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PenaltyReason {
    RateLimit,
    Capacity,
    Timeout,
    Error,
}

impl PenaltyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            PenaltyReason::RateLimit => "rate-limit",
            PenaltyReason::Capacity => "capacity",
            PenaltyReason::Timeout => "timeout",
            PenaltyReason::Error => "error",
        }
    }
}

impl std::fmt::Display for PenaltyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Penalty configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct PenaltyConfig {
    pub max_penalty: f64,
    pub decay_ms: u64,
    pub strategy: DecayStrategy,
    pub rate_limit_weight: f64,
    pub capacity_weight: f64,
    pub timeout_weight: f64,
    pub error_weight: f64,
    /// Number of (reason, timestamp) pairs retained per context.
    pub history_size: usize,
}

impl Default for PenaltyConfig {
    fn default() -> Self {
        Self {
            max_penalty: 8.0,
            decay_ms: 60_000,
            strategy: DecayStrategy::Hybrid,
            rate_limit_weight: 2.0,
            capacity_weight: 1.5,
            timeout_weight: 1.0,
            error_weight: 0.5,
            history_size: 20,
        }
    }
}

impl PenaltyConfig {
    pub fn weight(&self, reason: PenaltyReason) -> f64 {
        match reason {
            PenaltyReason::RateLimit => self.rate_limit_weight,
            PenaltyReason::Capacity => self.capacity_weight,
            PenaltyReason::Timeout => self.timeout_weight,
            PenaltyReason::Error => self.error_weight,
        }
    }
}

/// Penalty for one context.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PenaltyState {
    pub penalty: f64,
    pub updated_at_ms: u64,
    pub history: VecDeque<(PenaltyReason, u64)>,
}

impl PenaltyState {
    /// Penalty value at `now_ms`, without committing the decay.
    pub fn current(&self, config: &PenaltyConfig, now_ms: u64) -> f64 {
        if self.penalty <= 0.0 {
            return 0.0;
        }
        let elapsed = now_ms.saturating_sub(self.updated_at_ms);
        if config.decay_ms == 0 || elapsed >= config.decay_ms {
            return 0.0;
        }

        let elapsed = elapsed as f64;
        let decay_ms = config.decay_ms as f64;
        let linear_drain = config.max_penalty * elapsed / decay_ms;
        let half_life = decay_ms / 4.0;
        let exponential = self.penalty * 0.5_f64.powf(elapsed / half_life);

        let value = match config.strategy {
            DecayStrategy::Linear => self.penalty - linear_drain,
            DecayStrategy::Exponential => exponential,
            DecayStrategy::Hybrid => exponential - linear_drain / 4.0,
        };
        if value < 0.01 { 0.0 } else { value }
    }

    /// Commit the decay up to `now_ms`.
    pub fn decay(&mut self, config: &PenaltyConfig, now_ms: u64) {
        self.penalty = self.current(config, now_ms);
        self.updated_at_ms = now_ms;
    }

    /// Raise by the reason's weight, capped at `max_penalty`.
    pub fn raise(&mut self, reason: PenaltyReason, config: &PenaltyConfig, now_ms: u64) {
        self.decay(config, now_ms);
        self.penalty = (self.penalty + config.weight(reason)).min(config.max_penalty);
        self.history.push_back((reason, now_ms));
        while self.history.len() > config.history_size {
            self.history.pop_front();
        }
    }

    /// Reset to 0 on confirmed success.
    pub fn lower(&mut self, now_ms: u64) {
        self.penalty = 0.0;
        self.updated_at_ms = now_ms;
    }

    /// `max(1, floor(base - penalty))` at `now_ms`.
    pub fn apply_limit(&self, base_limit: u32, config: &PenaltyConfig, now_ms: u64) -> u32 {
        let limited = (base_limit as f64 - self.current(config, now_ms)).floor();
        if limited < 1.0 { 1 } else { limited as u32 }
    }
}

/// Penalty states keyed by context.
#[derive(Debug, Default)]
pub struct AdaptivePenaltyController {
    config: PenaltyConfig,
    states: Mutex<HashMap<String, PenaltyState>>,
}

impl AdaptivePenaltyController {
    pub fn new(config: PenaltyConfig) -> Self {
        Self {
            config,
            states: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &PenaltyConfig {
        &self.config
    }

    pub fn raise(&self, context: &str, reason: PenaltyReason) {
        self.raise_at(context, reason, now_ms());
    }

    pub fn raise_at(&self, context: &str, reason: PenaltyReason, now_ms: u64) {
        if let Ok(mut states) = self.states.lock() {
            let state = states.entry(context.to_string()).or_default();
            state.raise(reason, &self.config, now_ms);
            tracing::debug!(context, reason = %reason, penalty = state.penalty, "Penalty raised");
        }
    }

    pub fn lower(&self, context: &str) {
        self.lower_at(context, now_ms());
    }

    pub fn lower_at(&self, context: &str, now_ms: u64) {
        if let Ok(mut states) = self.states.lock()
            && let Some(state) = states.get_mut(context)
        {
            state.lower(now_ms);
        }
    }

    /// Current penalty for a context (0 when unknown).
    pub fn penalty(&self, context: &str) -> f64 {
        self.penalty_at(context, now_ms())
    }

    pub fn penalty_at(&self, context: &str, now_ms: u64) -> f64 {
        self.states
            .lock()
            .ok()
            .and_then(|states| states.get(context).map(|s| s.current(&self.config, now_ms)))
            .unwrap_or(0.0)
    }

    /// Apply the context's penalty to a base limit.
    pub fn apply_limit(&self, context: &str, base_limit: u32) -> u32 {
        self.apply_limit_at(context, base_limit, now_ms())
    }

    pub fn apply_limit_at(&self, context: &str, base_limit: u32, now_ms: u64) -> u32 {
        self.states
            .lock()
            .ok()
            .and_then(|states| states.get(context).map(|s| s.apply_limit(base_limit, &self.config, now_ms)))
            .unwrap_or(base_limit.max(1))
    }

    /// Reason history for a context, oldest first.
    pub fn history(&self, context: &str) -> Vec<(PenaltyReason, u64)> {
        self.states
            .lock()
            .ok()
            .and_then(|states| states.get(context).map(|s| s.history.iter().copied().collect()))
            .unwrap_or_default()
    }

    /// Drop all state. Test harness only.
    pub fn reset(&self) {
        if let Ok(mut states) = self.states.lock() {
            states.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linear() -> PenaltyConfig {
        PenaltyConfig {
            strategy: DecayStrategy::Linear,
            ..Default::default()
        }
    }

    #[test]
    fn test_raise_is_weighted_and_capped() {
        let config = linear();
        let mut state = PenaltyState::default();
        state.raise(PenaltyReason::RateLimit, &config, 0);
        assert_eq!(state.penalty, 2.0);
        state.raise(PenaltyReason::Timeout, &config, 0);
        assert_eq!(state.penalty, 3.0);

        for _ in 0..10 {
            state.raise(PenaltyReason::RateLimit, &config, 0);
        }
        assert_eq!(state.penalty, config.max_penalty);
    }

    #[test]
    fn test_linear_decay() {
        let config = linear();
        let mut state = PenaltyState::default();
        for _ in 0..4 {
            state.raise(PenaltyReason::RateLimit, &config, 0);
        }
        assert_eq!(state.penalty, 8.0);

        // 8.0 drains at 8 per 60s
        assert!((state.current(&config, 30_000) - 4.0).abs() < 1e-9);
        assert_eq!(state.current(&config, 60_000), 0.0);
    }

    #[test]
    fn test_exponential_decay_halves() {
        let config = PenaltyConfig {
            strategy: DecayStrategy::Exponential,
            ..Default::default()
        };
        let mut state = PenaltyState::default();
        state.raise(PenaltyReason::RateLimit, &config, 0);
        assert!((state.current(&config, 15_000) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_every_strategy_forgets_within_decay_ms() {
        for strategy in [DecayStrategy::Linear, DecayStrategy::Exponential, DecayStrategy::Hybrid] {
            let config = PenaltyConfig {
                strategy,
                ..Default::default()
            };
            let mut state = PenaltyState::default();
            state.raise(PenaltyReason::Capacity, &config, 1_000);
            assert!(state.current(&config, 30_000) < state.penalty);
            assert_eq!(state.current(&config, 61_000), 0.0, "{:?}", strategy);
        }
    }

    #[test]
    fn test_lower_resets() {
        let config = linear();
        let mut state = PenaltyState::default();
        state.raise(PenaltyReason::RateLimit, &config, 0);
        state.lower(10);
        assert_eq!(state.current(&config, 10), 0.0);
    }

    #[test]
    fn test_apply_limit_floor_of_one() {
        let config = linear();
        let mut state = PenaltyState::default();
        assert_eq!(state.apply_limit(5, &config, 0), 5);

        state.raise(PenaltyReason::RateLimit, &config, 0);
        state.raise(PenaltyReason::Timeout, &config, 0);
        // 5 - 3.0 = 2
        assert_eq!(state.apply_limit(5, &config, 0), 2);

        for _ in 0..5 {
            state.raise(PenaltyReason::RateLimit, &config, 0);
        }
        assert_eq!(state.apply_limit(5, &config, 0), 1);
    }

    #[test]
    fn test_history_is_bounded() {
        let config = PenaltyConfig {
            history_size: 3,
            ..linear()
        };
        let mut state = PenaltyState::default();
        for t in 0..5 {
            state.raise(PenaltyReason::Error, &config, t);
        }
        assert_eq!(state.history.len(), 3);
        assert_eq!(state.history.front(), Some(&(PenaltyReason::Error, 2)));
    }

    #[test]
    fn test_controller_contexts_are_independent() {
        let controller = AdaptivePenaltyController::new(linear());
        controller.raise_at("anthropic:claude", PenaltyReason::RateLimit, 0);

        assert_eq!(controller.apply_limit_at("anthropic:claude", 10, 0), 8);
        assert_eq!(controller.apply_limit_at("openai:gpt-4o", 10, 0), 10);
        assert_eq!(controller.history("anthropic:claude").len(), 1);

        controller.lower_at("anthropic:claude", 1);
        assert_eq!(controller.penalty_at("anthropic:claude", 1), 0.0);
    }

    #[test]
    fn test_controller_limit_matches_state_limit() {
        let controller = AdaptivePenaltyController::new(linear());
        controller.raise_at("anthropic:claude", PenaltyReason::Timeout, 0);
        controller.raise_at("anthropic:claude", PenaltyReason::RateLimit, 0);

        let mut state = PenaltyState::default();
        state.raise(PenaltyReason::Timeout, &linear(), 0);
        state.raise(PenaltyReason::RateLimit, &linear(), 0);
        for base in [0, 1, 3, 10] {
            assert_eq!(
                controller.apply_limit_at("anthropic:claude", base, 500),
                state.apply_limit(base, &linear(), 500)
            );
        }
        assert_eq!(controller.apply_limit_at("unknown:model", 0, 0), 1);
    }
}
