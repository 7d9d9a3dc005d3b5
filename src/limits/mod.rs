//! Provider limit registry.
//!
//! Static table of (provider, model pattern, tier) -> {requests per minute,
//! concurrency}. Built-in presets can be overridden per provider and pattern by
//! a user JSON file that is reloaded on demand.
//!
//! Resolution never fails: an unknown provider or model falls back through
//! tier default, provider default and finally a hard-coded floor, with the
//! fallback level reported as [`LimitSource`].

mod presets;
mod registry;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub use presets::{DEFAULT_TIER, FLOOR_LIMIT, builtin_presets};
pub use registry::{LimitEntry, ProviderLimitRegistry};

/// A requests-per-minute / concurrency pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    pub rpm: u32,
    pub concurrency: u32,
}

impl RateLimit {
    pub const fn new(rpm: u32, concurrency: u32) -> Self {
        Self { rpm, concurrency }
    }
}

/// Which fallback level produced a resolved limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LimitSource {
    /// Matched a model pattern
    Model,
    /// Provider tier default
    Tier,
    /// Provider-wide default
    Provider,
    /// Hard-coded floor
    Floor,
}

impl LimitSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitSource::Model => "model",
            LimitSource::Tier => "tier",
            LimitSource::Provider => "provider",
            LimitSource::Floor => "floor",
        }
    }
}

impl std::fmt::Display for LimitSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Result of a registry lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedLimit {
    pub rpm: u32,
    pub concurrency: u32,
    pub tier: String,
    pub source: LimitSource,
}

/// Limits for a single provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderLimits {
    /// Provider-wide default.
    pub default: Option<RateLimit>,
    /// Tier defaults, e.g. `tier1`, `tier4`.
    pub tiers: BTreeMap<String, RateLimit>,
    /// Model glob pattern -> tier -> limit. The `default` tier applies to any tier.
    pub models: BTreeMap<String, BTreeMap<String, RateLimit>>,
}

/// Provider name -> limits. Same shape for presets and the user override file.
pub type LimitTable = BTreeMap<String, ProviderLimits>;

/// Merge `overrides` over `base`. User entries win per provider + pattern.
pub fn merge_tables(base: &LimitTable, overrides: &LimitTable) -> LimitTable {
    let mut merged = base.clone();
    for (provider, user) in overrides {
        let entry = merged.entry(provider.to_lowercase()).or_default();
        if user.default.is_some() {
            entry.default = user.default;
        }
        for (tier, limit) in &user.tiers {
            entry.tiers.insert(tier.clone(), *limit);
        }
        for (pattern, tiers) in &user.models {
            entry.models.insert(pattern.to_lowercase(), tiers.clone());
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_source_display() {
        assert_eq!(LimitSource::Model.to_string(), "model");
        assert_eq!(LimitSource::Floor.to_string(), "floor");
    }

    #[test]
    fn test_merge_user_pattern_wins() {
        let mut base = LimitTable::new();
        let mut anthropic = ProviderLimits {
            default: Some(RateLimit::new(50, 5)),
            ..Default::default()
        };
        anthropic
            .models
            .insert("claude-*".into(), BTreeMap::from([(DEFAULT_TIER.to_string(), RateLimit::new(50, 5))]));
        base.insert("anthropic".into(), anthropic);

        let mut user = LimitTable::new();
        let mut override_limits = ProviderLimits::default();
        override_limits
            .models
            .insert("claude-*".into(), BTreeMap::from([(DEFAULT_TIER.to_string(), RateLimit::new(10, 1))]));
        user.insert("Anthropic".into(), override_limits);

        let merged = merge_tables(&base, &user);
        let anthropic = &merged["anthropic"];
        assert_eq!(anthropic.default, Some(RateLimit::new(50, 5)));
        assert_eq!(anthropic.models["claude-*"][DEFAULT_TIER], RateLimit::new(10, 1));
    }

    #[test]
    fn test_merge_adds_new_provider() {
        let base = LimitTable::new();
        let mut user = LimitTable::new();
        user.insert(
            "local".into(),
            ProviderLimits {
                default: Some(RateLimit::new(600, 2)),
                ..Default::default()
            },
        );

        let merged = merge_tables(&base, &user);
        assert_eq!(merged["local"].default, Some(RateLimit::new(600, 2)));
    }
}
