//! Rate-limit learning stack.
//!
//! Three layers, consulted together on every admission decision:
//! - **Token bucket** ([`TokenBucketLimiter`]): per (provider, model) request-rate gate
//!   with burst capacity and hard backoff windows after a 429.
//! - **Penalty controller** ([`AdaptivePenaltyController`]): fast, decaying penalty
//!   subtracted from the concurrency limit. Reacts in one cycle, forgets within
//!   `decay_ms`.
//! - **Adaptive rate controller** ([`AdaptiveRateController`]): slow, persisted learned
//!   concurrency ceiling. Multiplicative decrease on 429, slower multiplicative
//!   increase after a quiet recovery interval.
//!
//! All time-dependent logic is expressed as pure functions of `(state, now_ms)`;
//! the wall-clock methods are thin wrappers.

mod adaptive;
mod bucket;
mod classify;
mod penalty;
mod predict;

pub use adaptive::{
    AdaptiveConfig, AdaptiveControllerState, AdaptiveRateController, LearnedLimit, RateEvent, RateEventKind,
};
pub use bucket::{BucketSnapshot, BucketStats, TokenBucket, TokenBucketConfig, TokenBucketLimiter};
pub use classify::{ErrorClass, ErrorClassifier};
pub use penalty::{AdaptivePenaltyController, DecayStrategy, PenaltyConfig, PenaltyReason, PenaltyState};
pub use predict::{RecencyFrequencyPredictor, ThrottlePredictor};

/// Key for per-model state: `provider:model`, lowercased.
pub fn model_key(provider: &str, model: &str) -> String {
    format!("{}:{}", provider.to_lowercase(), model.to_lowercase())
}
