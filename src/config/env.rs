//! `GATEKEEPER_*` environment overrides, applied once after the config file.

use std::path::PathBuf;
use std::str::FromStr;

use super::GatekeeperConfig;

pub const STATE_DIR: &str = "GATEKEEPER_STATE_DIR";
pub const CHECKPOINT_TTL_MS: &str = "GATEKEEPER_CHECKPOINT_TTL_MS";
pub const MAX_CHECKPOINTS: &str = "GATEKEEPER_MAX_CHECKPOINTS";
pub const CHECKPOINT_CLEANUP_INTERVAL_MS: &str = "GATEKEEPER_CHECKPOINT_CLEANUP_INTERVAL_MS";
pub const MAX_TOTAL_CONCURRENT: &str = "GATEKEEPER_MAX_TOTAL_CONCURRENT";
pub const PROVIDER_LIMITS_FILE: &str = "GATEKEEPER_PROVIDER_LIMITS_FILE";
pub const RETRYABLE_PATTERNS: &str = "GATEKEEPER_RETRYABLE_PATTERNS";
pub const PREDICTIVE: &str = "GATEKEEPER_PREDICTIVE";

/// Apply overrides read through `lookup`. Unparseable values are logged and ignored.
pub fn apply<F>(config: &mut GatekeeperConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let get = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

    if let Some(dir) = get(STATE_DIR) {
        config.state_dir = Some(PathBuf::from(dir));
    }
    if let Some(file) = get(PROVIDER_LIMITS_FILE) {
        config.limits_file = Some(PathBuf::from(file));
    }
    if let Some(ttl) = parse(CHECKPOINT_TTL_MS, get(CHECKPOINT_TTL_MS)) {
        config.checkpoints.ttl_ms = ttl;
    }
    if let Some(max) = parse(MAX_CHECKPOINTS, get(MAX_CHECKPOINTS)) {
        config.checkpoints.max_checkpoints = max;
    }
    if let Some(interval) = parse(CHECKPOINT_CLEANUP_INTERVAL_MS, get(CHECKPOINT_CLEANUP_INTERVAL_MS)) {
        config.checkpoints.cleanup_interval_ms = interval;
    }
    if let Some(max) = parse(MAX_TOTAL_CONCURRENT, get(MAX_TOTAL_CONCURRENT)) {
        config.scheduler.max_total_concurrent = max;
    }
    if let Some(patterns) = get(RETRYABLE_PATTERNS) {
        config.retryable_patterns.extend(
            patterns
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(String::from),
        );
    }
    if let Some(flag) = get(PREDICTIVE) {
        config.adaptive.predictive_enabled = matches!(flag.to_lowercase().as_str(), "1" | "true" | "yes" | "on");
    }
}

fn parse<T: FromStr>(name: &str, value: Option<String>) -> Option<T> {
    let value = value?;
    match value.parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            log::warn!("Ignoring {}={:?}: not a valid number", name, value);
            None
        }
    }
}
