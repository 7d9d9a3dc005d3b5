//! Error classification for task outcomes.

use serde::{Deserialize, Serialize};

/// Classified failure kind, used to route feedback into the rate-limit stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorClass {
    /// Provider returned 429
    RateLimited,
    /// Provider-side resource limit (overloaded, 529/503)
    CapacityExhausted,
    /// Deadline exceeded
    Timeout,
    /// Cooperative cancellation
    Cancelled,
    /// Anything else
    Other,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::RateLimited => "rate-limited",
            ErrorClass::CapacityExhausted => "capacity-exhausted",
            ErrorClass::Timeout => "timeout",
            ErrorClass::Cancelled => "cancelled",
            ErrorClass::Other => "other",
        }
    }

    /// Whether this failure shrinks the learned concurrency.
    pub fn is_throttle(&self) -> bool {
        matches!(self, ErrorClass::RateLimited | ErrorClass::CapacityExhausted)
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

const RATE_LIMIT_PATTERNS: &[&str] = &["429", "rate limit", "rate_limit", "ratelimit", "too many requests"];
const CAPACITY_PATTERNS: &[&str] = &["overloaded", "capacity", "529", "503", "resource exhausted", "resource_exhausted"];
const TIMEOUT_PATTERNS: &[&str] = &["timeout", "timed out", "etimedout", "deadline exceeded"];

/// Substring classifier over lowercased error messages.
#[derive(Debug, Clone)]
pub struct ErrorClassifier {
    rate_limit: Vec<String>,
    capacity: Vec<String>,
    timeout: Vec<String>,
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self {
            rate_limit: RATE_LIMIT_PATTERNS.iter().map(|p| p.to_string()).collect(),
            capacity: CAPACITY_PATTERNS.iter().map(|p| p.to_string()).collect(),
            timeout: TIMEOUT_PATTERNS.iter().map(|p| p.to_string()).collect(),
        }
    }
}

impl ErrorClassifier {
    /// Add extra substrings that classify as rate limits.
    pub fn with_rate_limit_patterns<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for pattern in patterns {
            let pattern = pattern.as_ref().trim().to_lowercase();
            if !pattern.is_empty() && !self.rate_limit.contains(&pattern) {
                self.rate_limit.push(pattern);
            }
        }
        self
    }

    /// Classify an error message. Rate limit wins over capacity, capacity over timeout.
    pub fn classify(&self, message: &str) -> ErrorClass {
        let message = message.to_lowercase();
        let hit = |patterns: &[String]| patterns.iter().any(|p| message.contains(p.as_str()));

        if hit(&self.rate_limit) {
            ErrorClass::RateLimited
        } else if hit(&self.capacity) {
            ErrorClass::CapacityExhausted
        } else if hit(&self.timeout) {
            ErrorClass::Timeout
        } else {
            ErrorClass::Other
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_rate_limit() {
        let classifier = ErrorClassifier::default();
        assert_eq!(classifier.classify("HTTP 429 Too Many Requests"), ErrorClass::RateLimited);
        assert_eq!(classifier.classify("rate limit exceeded"), ErrorClass::RateLimited);
    }

    #[test]
    fn test_classify_capacity() {
        let classifier = ErrorClassifier::default();
        assert_eq!(classifier.classify("API is Overloaded"), ErrorClass::CapacityExhausted);
        assert_eq!(classifier.classify("status 529"), ErrorClass::CapacityExhausted);
    }

    #[test]
    fn test_classify_timeout_and_other() {
        let classifier = ErrorClassifier::default();
        assert_eq!(classifier.classify("request timed out"), ErrorClass::Timeout);
        assert_eq!(classifier.classify("invalid prompt"), ErrorClass::Other);
    }

    #[test]
    fn test_extra_patterns() {
        let classifier = ErrorClassifier::default().with_rate_limit_patterns(["Quota Exceeded", " "]);
        assert_eq!(classifier.classify("daily quota exceeded"), ErrorClass::RateLimited);
    }

    #[test]
    fn test_is_throttle() {
        assert!(ErrorClass::RateLimited.is_throttle());
        assert!(ErrorClass::CapacityExhausted.is_throttle());
        assert!(!ErrorClass::Timeout.is_throttle());
    }
}
