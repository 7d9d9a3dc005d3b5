//! Registry lookups and override file handling.

use std::path::{Path, PathBuf};
use std::sync::RwLock;

use glob::Pattern;
use serde::Serialize;

use super::presets::{DEFAULT_TIER, FLOOR_LIMIT, builtin_presets};
use super::{LimitSource, LimitTable, ProviderLimits, RateLimit, ResolvedLimit, merge_tables};
use crate::error::{GatekeeperError, Result};
use crate::storage::{FileLock, LockConfig, read_json, write_json_atomic};

/// One flattened row of the merged table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LimitEntry {
    pub provider: String,
    /// Model pattern, or `None` for tier / provider defaults.
    pub pattern: Option<String>,
    pub tier: String,
    pub limit: RateLimit,
}

/// Provider limit registry with a hot-reloadable user override layer.
#[derive(Debug)]
pub struct ProviderLimitRegistry {
    presets: LimitTable,
    overrides_path: Option<PathBuf>,
    lock: LockConfig,
    default_tier: String,
    user: RwLock<LimitTable>,
    merged: RwLock<LimitTable>,
}

impl Default for ProviderLimitRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderLimitRegistry {
    /// Registry with built-in presets and no override file.
    pub fn new() -> Self {
        Self::with_presets(builtin_presets())
    }

    /// Registry over a custom preset table.
    pub fn with_presets(presets: LimitTable) -> Self {
        let merged = merge_tables(&LimitTable::new(), &presets);
        Self {
            presets: merged.clone(),
            overrides_path: None,
            lock: LockConfig::default(),
            default_tier: DEFAULT_TIER.to_string(),
            user: RwLock::new(LimitTable::new()),
            merged: RwLock::new(merged),
        }
    }

    /// Attach a user override file. Call [`reload_limits`](Self::reload_limits) to read it.
    pub fn with_overrides_file(mut self, path: impl Into<PathBuf>, lock: LockConfig) -> Self {
        self.overrides_path = Some(path.into());
        self.lock = lock;
        self
    }

    /// Tier used when `resolve` is called without one.
    pub fn with_default_tier(mut self, tier: impl Into<String>) -> Self {
        self.default_tier = tier.into();
        self
    }

    /// Path of the user override file, if configured.
    pub fn overrides_path(&self) -> Option<&Path> {
        self.overrides_path.as_deref()
    }

    /// Resolve the limit for a provider/model/tier.
    ///
    /// Lookup order: most specific matching model pattern, tier default,
    /// provider default, floor.
    pub fn resolve(&self, provider: &str, model: &str, tier: Option<&str>) -> ResolvedLimit {
        let tier = tier.unwrap_or(&self.default_tier).to_string();
        let floor = ResolvedLimit {
            rpm: FLOOR_LIMIT.rpm,
            concurrency: FLOOR_LIMIT.concurrency,
            tier: tier.clone(),
            source: LimitSource::Floor,
        };

        let Ok(table) = self.merged.read() else {
            tracing::warn!(provider, model, "Limit table unavailable, serving floor");
            return floor;
        };
        let Some(limits) = table.get(&provider.to_lowercase()) else {
            return floor;
        };

        let (limit, source) = match resolve_in_provider(limits, &model.to_lowercase(), &tier) {
            Some(found) => found,
            None => return floor,
        };

        ResolvedLimit {
            rpm: limit.rpm.max(1),
            concurrency: limit.concurrency.max(1),
            tier,
            source,
        }
    }

    /// Concurrency ceiling for the default tier.
    pub fn get_concurrency_limit(&self, provider: &str, model: &str) -> u32 {
        self.resolve(provider, model, None).concurrency
    }

    /// Requests-per-minute for the default tier.
    pub fn get_rpm_limit(&self, provider: &str, model: &str) -> u32 {
        self.resolve(provider, model, None).rpm
    }

    /// Current user override table.
    pub fn user_limits(&self) -> LimitTable {
        self.user.read().map(|u| u.clone()).unwrap_or_default()
    }

    /// Persist a new user override table and apply it.
    pub async fn save_user_limits(&self, limits: &LimitTable) -> Result<()> {
        let path = self
            .overrides_path
            .as_ref()
            .ok_or_else(|| GatekeeperError::Config("no provider limits file configured".to_string()))?;

        {
            let _lock = FileLock::acquire(path, &self.lock).await?;
            write_json_atomic(path, limits).await?;
        }
        self.apply(limits.clone());
        log::info!("Saved user provider limits to {}", path.display());
        Ok(())
    }

    /// Re-read the override file and rebuild the merged table.
    ///
    /// A missing file clears the override layer. Returns the number of providers
    /// carrying overrides.
    pub async fn reload_limits(&self) -> Result<usize> {
        let Some(path) = self.overrides_path.as_ref() else {
            return Ok(0);
        };

        let user: LimitTable = {
            let _lock = FileLock::acquire(path, &self.lock).await?;
            read_json(path).await?.unwrap_or_default()
        };
        let count = user.len();
        self.apply(user);
        log::info!("Reloaded provider limits from {} ({} providers)", path.display(), count);
        Ok(count)
    }

    /// Flatten the merged table for display.
    pub fn entries(&self) -> Vec<LimitEntry> {
        let Ok(table) = self.merged.read() else {
            return Vec::new();
        };

        let mut entries = Vec::new();
        for (provider, limits) in table.iter() {
            if let Some(limit) = limits.default {
                entries.push(LimitEntry {
                    provider: provider.clone(),
                    pattern: None,
                    tier: DEFAULT_TIER.to_string(),
                    limit,
                });
            }
            for (tier, limit) in &limits.tiers {
                entries.push(LimitEntry {
                    provider: provider.clone(),
                    pattern: None,
                    tier: tier.clone(),
                    limit: *limit,
                });
            }
            for (pattern, tiers) in &limits.models {
                for (tier, limit) in tiers {
                    entries.push(LimitEntry {
                        provider: provider.clone(),
                        pattern: Some(pattern.clone()),
                        tier: tier.clone(),
                        limit: *limit,
                    });
                }
            }
        }
        entries
    }

    fn apply(&self, user: LimitTable) {
        let merged = merge_tables(&self.presets, &user);
        if let Ok(mut slot) = self.merged.write() {
            *slot = merged;
        }
        if let Ok(mut slot) = self.user.write() {
            *slot = user;
        }
    }
}

/// Literal characters in a glob pattern; more literals = more specific.
fn specificity(pattern: &str) -> usize {
    pattern.chars().filter(|c| !matches!(c, '*' | '?' | '[' | ']')).count()
}

fn resolve_in_provider(limits: &ProviderLimits, model: &str, tier: &str) -> Option<(RateLimit, LimitSource)> {
    let mut matching: Vec<(&String, &std::collections::BTreeMap<String, RateLimit>)> = limits
        .models
        .iter()
        .filter(|(pattern, _)| Pattern::new(pattern).map(|p| p.matches(model)).unwrap_or(false))
        .collect();
    matching.sort_by(|a, b| specificity(b.0).cmp(&specificity(a.0)));

    for (_, tiers) in matching {
        if let Some(limit) = tiers.get(tier).or_else(|| tiers.get(DEFAULT_TIER)) {
            return Some((*limit, LimitSource::Model));
        }
    }

    if let Some(limit) = limits.tiers.get(tier) {
        return Some((*limit, LimitSource::Tier));
    }

    limits.default.map(|limit| (limit, LimitSource::Provider))
}
