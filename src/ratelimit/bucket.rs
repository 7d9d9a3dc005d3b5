//! Token-bucket request limiter.
//!
//! Capacity is `rpm * burst_multiplier`, refilled continuously at `rpm` per minute.
//! Refill is computed lazily from the elapsed time at each read; there is no
//! background timer. The limiter never blocks, it only reports how long a
//! caller would have to wait.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use super::model_key;
use crate::id::now_ms;
use crate::limits::ProviderLimitRegistry;

/// Token bucket configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct TokenBucketConfig {
    /// Capacity as a multiple of the per-minute rate.
    pub burst_multiplier: f64,
    /// Fill ratio below which a bucket is reported as low.
    pub low_capacity_threshold: f64,
    /// Backoff applied when a 429 carries no retry-after hint (ms).
    pub default_retry_after_ms: u64,
}

impl Default for TokenBucketConfig {
    fn default() -> Self {
        Self {
            burst_multiplier: 1.5,
            low_capacity_threshold: 0.2,
            default_retry_after_ms: 60_000,
        }
    }
}

/// State of a single bucket.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenBucket {
    pub rpm: u32,
    pub capacity: f64,
    pub tokens: f64,
    pub last_refill_ms: u64,
    /// Explicit retry-after floor set by a 429.
    pub backoff_until_ms: Option<u64>,
    pub consecutive_429s: u32,
}

impl TokenBucket {
    /// A full bucket for the given rate.
    pub fn new(rpm: u32, burst_multiplier: f64, now_ms: u64) -> Self {
        let capacity = (rpm as f64 * burst_multiplier).max(1.0);
        Self {
            rpm,
            capacity,
            tokens: capacity,
            last_refill_ms: now_ms,
            backoff_until_ms: None,
            consecutive_429s: 0,
        }
    }

    fn refill_per_ms(&self) -> f64 {
        self.rpm.max(1) as f64 / 60_000.0
    }

    /// Bring `tokens` up to date.
    pub fn refill(&mut self, now_ms: u64) {
        if now_ms > self.last_refill_ms {
            let elapsed = (now_ms - self.last_refill_ms) as f64;
            self.tokens = (self.tokens + elapsed * self.refill_per_ms()).min(self.capacity);
            self.last_refill_ms = now_ms;
        }
    }

    /// Adopt a new rate (registry reload) without losing the current fill.
    pub fn rescale(&mut self, rpm: u32, burst_multiplier: f64) {
        self.rpm = rpm;
        self.capacity = (rpm as f64 * burst_multiplier).max(1.0);
        self.tokens = self.tokens.min(self.capacity);
    }

    /// Milliseconds until the backoff window ends, 0 if none is active.
    pub fn backoff_remaining(&self, now_ms: u64) -> u64 {
        self.backoff_until_ms.map(|until| until.saturating_sub(now_ms)).unwrap_or(0)
    }

    /// Required wait before `tokens_needed` can be consumed. 0 = admissible now.
    ///
    /// Requests larger than the capacity are treated as needing a full bucket.
    pub fn wait_ms(&mut self, tokens_needed: f64, now_ms: u64) -> u64 {
        self.refill(now_ms);
        let needed = tokens_needed.min(self.capacity);
        let refill_wait = if self.tokens >= needed {
            0
        } else {
            ((needed - self.tokens) / self.refill_per_ms()).ceil() as u64
        };
        refill_wait.max(self.backoff_remaining(now_ms))
    }

    /// Debit the bucket. May go negative only through explicit over-consumption.
    pub fn consume(&mut self, tokens: f64, now_ms: u64) {
        self.refill(now_ms);
        self.tokens -= tokens;
    }

    /// Empty the bucket and hold it shut for `retry_after_ms`.
    pub fn record_429(&mut self, retry_after_ms: u64, now_ms: u64) {
        self.refill(now_ms);
        self.tokens = 0.0;
        self.consecutive_429s += 1;
        let until = now_ms + retry_after_ms;
        self.backoff_until_ms = Some(self.backoff_until_ms.map_or(until, |current| current.max(until)));
    }

    /// Clear a residual (elapsed) backoff and the 429 streak.
    pub fn record_success(&mut self, now_ms: u64) {
        self.consecutive_429s = 0;
        if self.backoff_remaining(now_ms) == 0 {
            self.backoff_until_ms = None;
        }
    }

    /// Current fill ratio in [0, 1].
    pub fn fill_ratio(&self) -> f64 {
        (self.tokens / self.capacity).clamp(0.0, 1.0)
    }
}

/// Snapshot of one bucket for observability.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BucketSnapshot {
    pub key: String,
    pub rpm: u32,
    pub capacity: f64,
    pub tokens: f64,
    pub backoff_remaining_ms: u64,
}

/// Limiter-wide statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BucketStats {
    pub buckets: Vec<BucketSnapshot>,
    /// Keys whose fill ratio is below the low-capacity threshold.
    pub low_capacity: Vec<String>,
}

/// Per (provider, model) token buckets fed by the limit registry.
#[derive(Debug)]
pub struct TokenBucketLimiter {
    config: TokenBucketConfig,
    registry: Arc<ProviderLimitRegistry>,
    buckets: Mutex<HashMap<String, TokenBucket>>,
}

impl TokenBucketLimiter {
    pub fn new(registry: Arc<ProviderLimitRegistry>, config: TokenBucketConfig) -> Self {
        Self {
            config,
            registry,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    fn with_bucket<R>(&self, provider: &str, model: &str, now_ms: u64, f: impl FnOnce(&mut TokenBucket) -> R) -> Option<R> {
        let rpm = self.registry.get_rpm_limit(provider, model);
        let mut buckets = self.buckets.lock().ok()?;
        let bucket = buckets
            .entry(model_key(provider, model))
            .or_insert_with(|| TokenBucket::new(rpm, self.config.burst_multiplier, now_ms));
        if bucket.rpm != rpm {
            bucket.rescale(rpm, self.config.burst_multiplier);
        }
        Some(f(bucket))
    }

    /// Required wait in ms before `tokens_needed` may proceed; 0 if admissible now.
    pub fn can_proceed(&self, provider: &str, model: &str, tokens_needed: f64) -> u64 {
        self.can_proceed_at(provider, model, tokens_needed, now_ms())
    }

    pub fn can_proceed_at(&self, provider: &str, model: &str, tokens_needed: f64, now_ms: u64) -> u64 {
        // A poisoned limiter must not stall admission.
        self.with_bucket(provider, model, now_ms, |b| b.wait_ms(tokens_needed, now_ms))
            .unwrap_or(0)
    }

    /// Debit `tokens` from the bucket.
    pub fn consume(&self, provider: &str, model: &str, tokens: f64) {
        self.consume_at(provider, model, tokens, now_ms());
    }

    pub fn consume_at(&self, provider: &str, model: &str, tokens: f64, now_ms: u64) {
        self.with_bucket(provider, model, now_ms, |b| b.consume(tokens, now_ms));
    }

    /// Record a 429. `None` applies the configured default retry-after.
    pub fn record_429(&self, provider: &str, model: &str, retry_after_ms: Option<u64>) {
        self.record_429_at(provider, model, retry_after_ms, now_ms());
    }

    pub fn record_429_at(&self, provider: &str, model: &str, retry_after_ms: Option<u64>, now_ms: u64) {
        let retry_after = retry_after_ms.unwrap_or(self.config.default_retry_after_ms);
        self.with_bucket(provider, model, now_ms, |b| b.record_429(retry_after, now_ms));
        tracing::warn!(provider, model, retry_after_ms = retry_after, "Token bucket backing off after 429");
    }

    /// Record a successful request.
    pub fn record_success(&self, provider: &str, model: &str) {
        self.record_success_at(provider, model, now_ms());
    }

    pub fn record_success_at(&self, provider: &str, model: &str, now_ms: u64) {
        self.with_bucket(provider, model, now_ms, |b| b.record_success(now_ms));
    }

    /// Snapshot all buckets, flagging those below the low-capacity threshold.
    pub fn get_stats(&self) -> BucketStats {
        self.get_stats_at(now_ms())
    }

    pub fn get_stats_at(&self, now_ms: u64) -> BucketStats {
        let Ok(mut buckets) = self.buckets.lock() else {
            return BucketStats::default();
        };

        let mut stats = BucketStats::default();
        let mut keys: Vec<String> = buckets.keys().cloned().collect();
        keys.sort();
        for key in keys {
            let Some(bucket) = buckets.get_mut(&key) else {
                continue;
            };
            bucket.refill(now_ms);
            if bucket.fill_ratio() < self.config.low_capacity_threshold {
                stats.low_capacity.push(key.clone());
            }
            stats.buckets.push(BucketSnapshot {
                key,
                rpm: bucket.rpm,
                capacity: bucket.capacity,
                tokens: bucket.tokens,
                backoff_remaining_ms: bucket.backoff_remaining(now_ms),
            });
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_bucket_is_full() {
        let bucket = TokenBucket::new(60, 1.5, 0);
        assert_eq!(bucket.capacity, 90.0);
        assert_eq!(bucket.tokens, 90.0);
    }

    #[test]
    fn test_refill_is_time_based() {
        let mut bucket = TokenBucket::new(60, 1.0, 0);
        bucket.consume(60.0, 0);
        assert_eq!(bucket.tokens, 0.0);

        // 60 rpm = 1 token per second
        bucket.refill(10_000);
        assert!((bucket.tokens - 10.0).abs() < 1e-9);

        // Never above capacity
        bucket.refill(600_000);
        assert_eq!(bucket.tokens, 60.0);
    }

    #[test]
    fn test_wait_ms_when_empty() {
        let mut bucket = TokenBucket::new(60, 1.0, 0);
        bucket.consume(60.0, 0);
        assert_eq!(bucket.wait_ms(1.0, 0), 1_000);
        assert_eq!(bucket.wait_ms(1.0, 1_000), 0);
    }

    #[test]
    fn test_oversized_request_waits_for_full_bucket() {
        let mut bucket = TokenBucket::new(60, 1.0, 0);
        assert_eq!(bucket.wait_ms(500.0, 0), 0);
    }

    #[test]
    fn test_record_429_dominates_refill() {
        let mut bucket = TokenBucket::new(6000, 1.0, 0);
        bucket.record_429(30_000, 0);

        // Refill alone would admit after 10ms; the retry-after floor holds
        assert_eq!(bucket.wait_ms(1.0, 10), 29_990);
        assert_eq!(bucket.wait_ms(1.0, 30_000), 0);
    }

    #[test]
    fn test_record_success_clears_only_residual_backoff() {
        let mut bucket = TokenBucket::new(60, 1.0, 0);
        bucket.record_429(5_000, 0);

        bucket.record_success(1_000);
        assert!(bucket.backoff_until_ms.is_some());
        assert_eq!(bucket.consecutive_429s, 0);

        bucket.record_success(6_000);
        assert!(bucket.backoff_until_ms.is_none());
    }

    #[test]
    fn test_limiter_uses_registry_rate() {
        let limiter = TokenBucketLimiter::new(Arc::new(ProviderLimitRegistry::new()), TokenBucketConfig::default());
        // Unknown provider -> floor rpm 20, capacity 30
        for _ in 0..30 {
            assert_eq!(limiter.can_proceed_at("nowhere", "m", 1.0, 0), 0);
            limiter.consume_at("nowhere", "m", 1.0, 0);
        }
        assert_eq!(limiter.can_proceed_at("nowhere", "m", 1.0, 0), 3_000);
    }

    #[test]
    fn test_limiter_record_429_and_stats() {
        let limiter = TokenBucketLimiter::new(Arc::new(ProviderLimitRegistry::new()), TokenBucketConfig::default());
        limiter.can_proceed_at("anthropic", "claude-3-haiku", 1.0, 0);
        limiter.can_proceed_at("openai", "gpt-4o", 1.0, 0);
        limiter.record_429_at("anthropic", "claude-3-haiku", Some(10_000), 0);

        assert_eq!(limiter.can_proceed_at("anthropic", "claude-3-haiku", 1.0, 100), 9_900);
        assert_eq!(limiter.can_proceed_at("openai", "gpt-4o", 1.0, 100), 0);

        let stats = limiter.get_stats_at(100);
        assert_eq!(stats.buckets.len(), 2);
        assert_eq!(stats.low_capacity, vec!["anthropic:claude-3-haiku".to_string()]);
    }

    #[test]
    fn test_limiter_default_retry_after() {
        let config = TokenBucketConfig {
            default_retry_after_ms: 2_000,
            ..Default::default()
        };
        let limiter = TokenBucketLimiter::new(Arc::new(ProviderLimitRegistry::new()), config);
        limiter.record_429_at("openai", "gpt-4o", None, 0);
        assert_eq!(limiter.can_proceed_at("openai", "gpt-4o", 1.0, 0), 2_000);
    }
}
