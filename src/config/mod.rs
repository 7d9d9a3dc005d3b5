//! Gatekeeper configuration.
//!
//! Loaded from `gatekeeper.yml` with a fallback chain, then adjusted once by
//! `GATEKEEPER_*` environment variables (see [`env`]).

pub mod env;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::checkpoint::{CheckpointConfig, CheckpointManager};
use crate::cost::{CostEstimator, CostEstimatorConfig};
use crate::limits::ProviderLimitRegistry;
use crate::ratelimit::{
    AdaptiveConfig, AdaptivePenaltyController, AdaptiveRateController, ErrorClassifier, PenaltyConfig,
    TokenBucketConfig, TokenBucketLimiter,
};
use crate::scheduler::{Scheduler, SchedulerConfig};
use crate::storage::LockConfig;

/// File name searched for in the working directory and the user config dir.
pub const CONFIG_FILE_NAME: &str = "gatekeeper.yml";
/// Learned-limit state file, under the state directory.
pub const CONTROLLER_STATE_FILE: &str = "adaptive-controller.json";
/// Provider-limit override file, under the state directory.
pub const LIMITS_FILE: &str = "provider-limits.json";
/// Checkpoint directory, under the state directory.
pub const CHECKPOINTS_DIR: &str = "checkpoints";

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct GatekeeperConfig {
    /// Root for all persisted state. Defaults to `<data_local_dir>/gatekeeper`.
    pub state_dir: Option<PathBuf>,

    /// User override file for the limit registry. Defaults to `<state_dir>/provider-limits.json`.
    pub limits_file: Option<PathBuf>,

    /// Tier used when resolving limits without an explicit one.
    pub default_tier: Option<String>,

    /// Extra substrings classified as rate limits.
    pub retryable_patterns: Vec<String>,

    pub scheduler: SchedulerConfig,
    pub token_bucket: TokenBucketConfig,
    pub penalty: PenaltyConfig,
    pub adaptive: AdaptiveConfig,
    pub checkpoints: CheckpointConfig,
    pub cost: CostEstimatorConfig,
    pub lock: LockConfig,
}

impl GatekeeperConfig {
    /// Load configuration with fallback chain, then apply environment overrides.
    ///
    /// Search order:
    /// 1. Explicit path if provided
    /// 2. gatekeeper.yml in current directory
    /// 3. ~/.config/gatekeeper/gatekeeper.yml
    /// 4. Defaults
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        let mut config = Self::load_file_chain(config_path)?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    fn load_file_chain(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        let project_config = PathBuf::from(CONFIG_FILE_NAME);
        if project_config.exists() {
            match Self::load_from_file(&project_config) {
                Ok(config) => {
                    log::info!("Loaded config from {}", CONFIG_FILE_NAME);
                    return Ok(config);
                }
                Err(e) => log::warn!("Failed to load {}: {}", CONFIG_FILE_NAME, e),
            }
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("gatekeeper").join(CONFIG_FILE_NAME);
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => {
                        log::info!("Loaded config from {}", user_config.display());
                        return Ok(config);
                    }
                    Err(e) => log::warn!("Failed to load {}: {}", user_config.display(), e),
                }
            }
        }

        log::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;
        Ok(config)
    }

    /// Apply `GATEKEEPER_*` overrides from the process environment.
    pub fn apply_env(&mut self) {
        env::apply(self, |name| std::env::var(name).ok());
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.scheduler.max_total_concurrent == 0 {
            eyre::bail!("scheduler.max-total-concurrent must be > 0");
        }
        if self.scheduler.tokens_per_admission <= 0.0 {
            eyre::bail!("scheduler.tokens-per-admission must be > 0");
        }
        if self.token_bucket.burst_multiplier <= 0.0 {
            eyre::bail!("token-bucket.burst-multiplier must be > 0");
        }
        let reduction = self.adaptive.reduction_factor;
        if !(reduction > 0.0 && reduction < 1.0) {
            eyre::bail!("adaptive.reduction-factor must be in (0, 1), got {}", reduction);
        }
        if self.adaptive.recovery_factor < 1.0 {
            eyre::bail!("adaptive.recovery-factor must be >= 1, got {}", self.adaptive.recovery_factor);
        }
        let multiplier = self.adaptive.global_multiplier;
        if !(multiplier > 0.0 && multiplier <= 1.0) {
            eyre::bail!("adaptive.global-multiplier must be in (0, 1], got {}", multiplier);
        }
        if !(0.0..=1.0).contains(&self.adaptive.predictive_threshold) {
            eyre::bail!("adaptive.predictive-threshold must be in [0, 1]");
        }
        if self.penalty.max_penalty < 0.0 || self.penalty.decay_ms == 0 {
            eyre::bail!("penalty.max-penalty must be >= 0 and penalty.decay-ms > 0");
        }
        if self.checkpoints.max_checkpoints == 0 {
            eyre::bail!("checkpoints.max-checkpoints must be > 0");
        }
        if self.checkpoints.ttl_ms == 0 {
            eyre::bail!("checkpoints.ttl-ms must be > 0");
        }
        if self.cost.max_history_per_source == 0 {
            eyre::bail!("cost.max-history-per-source must be > 0");
        }
        Ok(())
    }

    /// Resolved state directory.
    pub fn state_dir(&self) -> PathBuf {
        self.state_dir.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .map(|d| d.join("gatekeeper"))
                .unwrap_or_else(|| PathBuf::from(".gatekeeper"))
        })
    }

    pub fn limits_file(&self) -> PathBuf {
        self.limits_file
            .clone()
            .unwrap_or_else(|| self.state_dir().join(LIMITS_FILE))
    }

    pub fn controller_state_file(&self) -> PathBuf {
        self.state_dir().join(CONTROLLER_STATE_FILE)
    }

    pub fn checkpoints_dir(&self) -> PathBuf {
        self.state_dir().join(CHECKPOINTS_DIR)
    }

    /// Limit registry with the override file loaded, if present.
    pub async fn build_registry(&self) -> Result<Arc<ProviderLimitRegistry>> {
        let mut registry = ProviderLimitRegistry::new().with_overrides_file(self.limits_file(), self.lock.clone());
        if let Some(tier) = &self.default_tier {
            registry = registry.with_default_tier(tier.clone());
        }
        registry
            .reload_limits()
            .await
            .context(format!("Failed to load provider limits from {}", self.limits_file().display()))?;
        Ok(Arc::new(registry))
    }

    /// Learned-limit controller with its persisted state loaded.
    pub async fn build_controller(&self, registry: Arc<ProviderLimitRegistry>) -> Result<Arc<AdaptiveRateController>> {
        let controller = AdaptiveRateController::new(registry, self.adaptive.clone())
            .with_state_file(self.controller_state_file(), self.lock.clone());
        controller
            .load()
            .await
            .context("Failed to load learned-limit state")?;
        Ok(Arc::new(controller))
    }

    pub fn build_checkpoints(&self) -> Arc<CheckpointManager> {
        Arc::new(CheckpointManager::new(
            self.checkpoints_dir(),
            self.checkpoints.clone(),
            self.lock.clone(),
        ))
    }

    pub fn build_classifier(&self) -> ErrorClassifier {
        ErrorClassifier::default().with_rate_limit_patterns(&self.retryable_patterns)
    }

    /// Fully wired scheduler backed by the state directory.
    pub async fn build_scheduler(&self) -> Result<Scheduler> {
        let registry = self.build_registry().await?;
        let controller = self.build_controller(registry.clone()).await?;
        let limiter = Arc::new(TokenBucketLimiter::new(registry.clone(), self.token_bucket.clone()));

        Ok(Scheduler::builder(self.scheduler.clone())
            .with_registry(registry)
            .with_limiter(limiter)
            .with_controller(controller)
            .with_penalty(Arc::new(AdaptivePenaltyController::new(self.penalty.clone())))
            .with_estimator(Arc::new(CostEstimator::new(self.cost.clone())))
            .with_checkpoints(self.build_checkpoints())
            .with_classifier(self.build_classifier())
            .build())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        GatekeeperConfig::default().validate().unwrap();
    }

    #[test]
    fn test_load_yaml_kebab_case() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("gatekeeper.yml");
        fs::write(
            &path,
            r#"
state-dir: /tmp/gk
scheduler:
  max-total-concurrent: 3
  scoring:
    max-skip-count: 4
adaptive:
  reduction-factor: 0.7
checkpoints:
  max-checkpoints: 12
"#,
        )
        .unwrap();

        let config = GatekeeperConfig::load_from_file(&path).unwrap();
        assert_eq!(config.state_dir(), PathBuf::from("/tmp/gk"));
        assert_eq!(config.scheduler.max_total_concurrent, 3);
        assert_eq!(config.scheduler.scoring.max_skip_count, 4);
        assert_eq!(config.scheduler.scoring.priority_weight, 0.6);
        assert_eq!(config.adaptive.reduction_factor, 0.7);
        assert_eq!(config.adaptive.recovery_factor, 1.2);
        assert_eq!(config.checkpoints.max_checkpoints, 12);
        assert_eq!(config.checkpoints_dir(), PathBuf::from("/tmp/gk/checkpoints"));
    }

    #[test]
    fn test_explicit_missing_file_is_error() {
        let missing = PathBuf::from("/nonexistent/gatekeeper.yml");
        assert!(GatekeeperConfig::load(Some(&missing)).is_err());
    }

    #[test]
    fn test_validate_rejects_bad_factors() {
        let mut config = GatekeeperConfig::default();
        config.adaptive.reduction_factor = 1.0;
        assert!(config.validate().is_err());

        let mut config = GatekeeperConfig::default();
        config.adaptive.recovery_factor = 0.9;
        assert!(config.validate().is_err());

        let mut config = GatekeeperConfig::default();
        config.scheduler.max_total_concurrent = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_limits_file_defaults_under_state_dir() {
        let config = GatekeeperConfig {
            state_dir: Some(PathBuf::from("/var/gk")),
            ..Default::default()
        };
        assert_eq!(config.limits_file(), PathBuf::from("/var/gk/provider-limits.json"));
        assert_eq!(
            config.controller_state_file(),
            PathBuf::from("/var/gk/adaptive-controller.json")
        );
    }

    #[tokio::test]
    async fn test_build_scheduler_in_temp_state_dir() {
        let temp = TempDir::new().unwrap();
        let config = GatekeeperConfig {
            state_dir: Some(temp.path().to_path_buf()),
            ..Default::default()
        };
        let scheduler = config.build_scheduler().await.unwrap();
        assert!(scheduler.checkpoints().is_some());
        assert_eq!(scheduler.config().max_total_concurrent, 8);
    }
}
