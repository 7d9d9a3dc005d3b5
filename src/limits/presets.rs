//! Built-in provider limits.

use std::collections::BTreeMap;

use super::{LimitTable, ProviderLimits, RateLimit};

/// Tier used when the caller does not name one.
pub const DEFAULT_TIER: &str = "default";

/// Returned when nothing else matches. Conservative so unknown backends are not hammered.
pub const FLOOR_LIMIT: RateLimit = RateLimit::new(20, 2);

fn models(entries: &[(&str, RateLimit)]) -> BTreeMap<String, BTreeMap<String, RateLimit>> {
    entries
        .iter()
        .map(|(pattern, limit)| {
            (
                pattern.to_string(),
                BTreeMap::from([(DEFAULT_TIER.to_string(), *limit)]),
            )
        })
        .collect()
}

fn tiers(entries: &[(&str, RateLimit)]) -> BTreeMap<String, RateLimit> {
    entries.iter().map(|(tier, limit)| (tier.to_string(), *limit)).collect()
}

/// The built-in preset table.
pub fn builtin_presets() -> LimitTable {
    let mut table = LimitTable::new();

    let mut anthropic = ProviderLimits {
        default: Some(RateLimit::new(50, 5)),
        tiers: tiers(&[
            ("tier1", RateLimit::new(50, 3)),
            ("tier2", RateLimit::new(1000, 10)),
            ("tier3", RateLimit::new(2000, 20)),
            ("tier4", RateLimit::new(4000, 40)),
        ]),
        models: models(&[
            ("claude-*opus*", RateLimit::new(50, 3)),
            ("claude-*sonnet*", RateLimit::new(50, 5)),
            ("claude-*haiku*", RateLimit::new(100, 10)),
        ]),
    };
    anthropic
        .models
        .entry("claude-*opus*".to_string())
        .or_default()
        .insert("tier4".to_string(), RateLimit::new(4000, 20));
    table.insert("anthropic".to_string(), anthropic);

    table.insert(
        "openai".to_string(),
        ProviderLimits {
            default: Some(RateLimit::new(500, 10)),
            tiers: tiers(&[
                ("tier1", RateLimit::new(500, 5)),
                ("tier2", RateLimit::new(5000, 15)),
                ("tier5", RateLimit::new(10000, 50)),
            ]),
            models: models(&[
                ("gpt-4o*", RateLimit::new(500, 10)),
                ("gpt-4o-mini*", RateLimit::new(1000, 20)),
                ("o1*", RateLimit::new(100, 3)),
                ("o3*", RateLimit::new(100, 3)),
            ]),
        },
    );

    table.insert(
        "google".to_string(),
        ProviderLimits {
            default: Some(RateLimit::new(60, 5)),
            tiers: BTreeMap::new(),
            models: models(&[
                ("gemini-*flash*", RateLimit::new(1000, 15)),
                ("gemini-*pro*", RateLimit::new(150, 5)),
            ]),
        },
    );

    table.insert(
        "deepseek".to_string(),
        ProviderLimits {
            default: Some(RateLimit::new(60, 4)),
            ..Default::default()
        },
    );

    table
}
