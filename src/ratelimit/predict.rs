//! Predictive 429 estimation.
//!
//! The estimate is heuristic, so it sits behind [`ThrottlePredictor`] and the
//! controller only depends on the probability it returns.

/// Estimates the probability of an imminent 429 from past 429 timestamps.
pub trait ThrottlePredictor: Send + Sync + std::fmt::Debug {
    /// Probability in [0, 1] given 429 timestamps (ms, any order) at `now_ms`.
    fn probability(&self, history: &[u64], now_ms: u64) -> f64;
}

/// Recency-weighted frequency score.
///
/// Each 429 inside `window_ms` contributes `0.5^(age / half_life_ms)`; the sum `s`
/// maps to `1 - exp(-s / saturation)`.
#[derive(Debug, Clone, PartialEq)]
pub struct RecencyFrequencyPredictor {
    pub window_ms: u64,
    pub half_life_ms: u64,
    pub saturation: f64,
}

impl Default for RecencyFrequencyPredictor {
    fn default() -> Self {
        Self {
            window_ms: 600_000,
            half_life_ms: 120_000,
            saturation: 2.0,
        }
    }
}

impl ThrottlePredictor for RecencyFrequencyPredictor {
    fn probability(&self, history: &[u64], now_ms: u64) -> f64 {
        let half_life = self.half_life_ms.max(1) as f64;
        let score: f64 = history
            .iter()
            .filter(|&&t| t <= now_ms && now_ms - t <= self.window_ms)
            .map(|&t| 0.5_f64.powf((now_ms - t) as f64 / half_life))
            .sum();
        if score <= 0.0 {
            return 0.0;
        }
        (1.0 - (-score / self.saturation.max(f64::EPSILON)).exp()).clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_history_is_zero() {
        let predictor = RecencyFrequencyPredictor::default();
        assert_eq!(predictor.probability(&[], 1_000), 0.0);
    }

    #[test]
    fn test_more_recent_429s_raise_probability() {
        let predictor = RecencyFrequencyPredictor::default();
        let now = 1_000_000;
        let one = predictor.probability(&[now], now);
        let three = predictor.probability(&[now - 2_000, now - 1_000, now], now);
        assert!(three > one);
        assert!(three > 0.6);
        assert!(one < 0.6);
    }

    #[test]
    fn test_old_429s_fade() {
        let predictor = RecencyFrequencyPredictor::default();
        let now = 10_000_000;
        let fresh = predictor.probability(&[now - 1_000], now);
        let stale = predictor.probability(&[now - 400_000], now);
        let outside = predictor.probability(&[now - 700_000], now);
        assert!(fresh > stale);
        assert_eq!(outside, 0.0);
    }
}
