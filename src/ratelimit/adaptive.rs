//! Adaptive rate controller.
//!
//! Keeps one learned concurrency ceiling per `provider:model`, persisted as a
//! single versioned JSON document. A 429 shrinks the ceiling multiplicatively
//! and schedules one recovery check; once the recovery interval passes without
//! another 429 the ceiling grows back by a smaller factor, never above the
//! preset it started from.
//!
//! Reads are served from the in-memory mirror. Every mutation is persisted
//! under the shared file lock; persistence failures are logged and the
//! in-memory state stays authoritative.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use super::model_key;
use super::predict::{RecencyFrequencyPredictor, ThrottlePredictor};
use crate::error::{GatekeeperError, Result};
use crate::id::now_ms;
use crate::limits::ProviderLimitRegistry;
use crate::storage::{FileLock, LockConfig, read_json, write_json_atomic};

/// Controller configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct AdaptiveConfig {
    pub recovery_interval_ms: u64,
    /// Multiplier applied to the learned ceiling on each 429, in (0, 1).
    pub reduction_factor: f64,
    /// Growth applied on recovery relative to undoing one reduction, >= 1.
    pub recovery_factor: f64,
    pub global_multiplier: f64,
    pub predictive_enabled: bool,
    pub predictive_threshold: f64,
    /// 429 timestamps older than this are dropped from the history.
    pub history_window_ms: u64,
    pub max_history: usize,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            recovery_interval_ms: 60_000,
            reduction_factor: 0.5,
            recovery_factor: 1.2,
            global_multiplier: 1.0,
            predictive_enabled: false,
            predictive_threshold: 0.6,
            history_window_ms: 3_600_000,
            max_history: 50,
        }
    }
}

/// Learned ceiling for one `provider:model`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LearnedLimit {
    pub concurrency: u32,
    pub original_concurrency: u32,
    pub consecutive_429_count: u32,
    pub total_429_count: u64,
    pub last_429_at: Option<u64>,
    pub last_success_at: Option<u64>,
    pub recovery_scheduled: bool,
    #[serde(default)]
    pub recovery_scheduled_at: Option<u64>,
    #[serde(default)]
    pub recovery_due_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub historical_429s: Vec<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predicted_429_probability: Option<f64>,
    /// Last time this entry changed; decides merges between instances.
    #[serde(default)]
    pub updated_at: u64,
}

impl LearnedLimit {
    /// Fresh entry at the preset ceiling.
    pub fn new(preset: u32) -> Self {
        let preset = preset.max(1);
        Self {
            concurrency: preset,
            original_concurrency: preset,
            consecutive_429_count: 0,
            total_429_count: 0,
            last_429_at: None,
            last_success_at: None,
            recovery_scheduled: false,
            recovery_scheduled_at: None,
            recovery_due_at: None,
            historical_429s: Vec::new(),
            predicted_429_probability: None,
            updated_at: 0,
        }
    }

    /// Apply a 429: shrink, stamp, and (re)schedule the single pending recovery.
    pub fn on_429(&mut self, now_ms: u64, reduction_factor: f64, recovery_interval_ms: u64) {
        self.consecutive_429_count += 1;
        self.total_429_count += 1;

        let reduced = (self.concurrency as f64 * reduction_factor).floor() as u32;
        self.concurrency = reduced.clamp(1, self.concurrency.max(1));
        self.last_429_at = Some(now_ms);

        self.recovery_scheduled = true;
        self.recovery_scheduled_at = Some(now_ms);
        self.recovery_due_at = Some(now_ms.saturating_add(recovery_interval_ms));
        self.updated_at = now_ms;
    }

    /// Append to the bounded 429 history.
    pub fn push_history(&mut self, now_ms: u64, window_ms: u64, max_history: usize) {
        self.historical_429s.push(now_ms);
        self.historical_429s.retain(|&t| now_ms.saturating_sub(t) <= window_ms);
        if self.historical_429s.len() > max_history {
            let excess = self.historical_429s.len() - max_history;
            self.historical_429s.drain(..excess);
        }
    }

    pub fn on_success(&mut self, now_ms: u64) {
        self.consecutive_429_count = 0;
        self.last_success_at = Some(now_ms);
        self.updated_at = now_ms;
    }

    /// Whether a reduction is still waiting for its recovery at `now_ms`.
    pub fn is_throttled_at(&self, now_ms: u64) -> bool {
        self.recovery_scheduled && self.recovery_due_at.is_some_and(|due| due > now_ms)
    }

    /// Fold another instance's copy of this entry into this one.
    ///
    /// The newer copy wins unless the older one holds a lower ceiling that is
    /// still throttled. 429 history and counts are combined from both.
    pub fn merge(&mut self, other: LearnedLimit, now_ms: u64, max_history: usize) {
        let mut history: Vec<u64> = self
            .historical_429s
            .iter()
            .chain(other.historical_429s.iter())
            .copied()
            .collect();
        history.sort_unstable();
        history.dedup();
        if history.len() > max_history {
            let excess = history.len() - max_history;
            history.drain(..excess);
        }
        let total_429_count = self.total_429_count.max(other.total_429_count);

        let (newer, older) = if other.updated_at > self.updated_at {
            (other, self.clone())
        } else {
            (self.clone(), other)
        };
        let mut winner = if older.is_throttled_at(now_ms) && older.concurrency < newer.concurrency {
            older
        } else {
            newer
        };
        winner.historical_429s = history;
        winner.total_429_count = total_429_count;
        *self = winner;
    }

    /// Run a due recovery. Returns true if the ceiling changed.
    ///
    /// Growth is `round(concurrency / reduction * recovery)`, at least one step,
    /// capped at the preset. Below the preset the next check is rescheduled.
    pub fn recover(&mut self, now_ms: u64, reduction_factor: f64, recovery_factor: f64, recovery_interval_ms: u64) -> bool {
        if !self.recovery_scheduled {
            return false;
        }
        let Some(due) = self.recovery_due_at else {
            self.recovery_scheduled = false;
            self.updated_at = now_ms;
            return false;
        };
        if now_ms < due {
            return false;
        }
        self.updated_at = now_ms;
        if let (Some(last), Some(scheduled)) = (self.last_429_at, self.recovery_scheduled_at)
            && last > scheduled
        {
            self.recovery_scheduled_at = Some(last);
            self.recovery_due_at = Some(last.saturating_add(recovery_interval_ms));
            return false;
        }

        let before = self.concurrency;
        let grown = (before as f64 / reduction_factor * recovery_factor).round() as u32;
        self.concurrency = grown.max(before + 1).min(self.original_concurrency).max(before);

        if self.concurrency >= self.original_concurrency {
            self.recovery_scheduled = false;
            self.recovery_scheduled_at = None;
            self.recovery_due_at = None;
        } else {
            self.recovery_scheduled_at = Some(now_ms);
            self.recovery_due_at = Some(now_ms + recovery_interval_ms);
        }
        self.concurrency != before
    }
}

/// Everything the controller persists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdaptiveControllerState {
    pub version: u64,
    pub last_updated: u64,
    pub limits: BTreeMap<String, LearnedLimit>,
    pub global_multiplier: f64,
    pub recovery_interval_ms: u64,
    pub reduction_factor: f64,
    pub recovery_factor: f64,
    pub predictive_enabled: bool,
    pub predictive_threshold: f64,
    /// Keys reset by some instance, with the reset time.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub removed: BTreeMap<String, u64>,
}

/// How long a reset is remembered so other instances do not write the key back.
const REMOVAL_RETENTION_MS: u64 = 24 * 60 * 60 * 1000;

impl AdaptiveControllerState {
    pub fn from_config(config: &AdaptiveConfig) -> Self {
        Self {
            version: 0,
            last_updated: 0,
            limits: BTreeMap::new(),
            global_multiplier: config.global_multiplier,
            recovery_interval_ms: config.recovery_interval_ms,
            reduction_factor: config.reduction_factor,
            recovery_factor: config.recovery_factor,
            predictive_enabled: config.predictive_enabled,
            predictive_threshold: config.predictive_threshold,
            removed: BTreeMap::new(),
        }
    }

    /// Fold the entries another instance persisted into this state.
    ///
    /// Settings stay as they are here. A key reset on either side is dropped
    /// unless it changed after the reset.
    pub fn merge_from(&mut self, other: AdaptiveControllerState, now_ms: u64, max_history: usize) {
        self.version = self.version.max(other.version);
        for (key, at) in other.removed {
            let removed_at = self.removed.entry(key).or_insert(at);
            *removed_at = (*removed_at).max(at);
        }
        for (key, theirs) in other.limits {
            match self.limits.get_mut(&key) {
                Some(ours) => ours.merge(theirs, now_ms, max_history),
                None => {
                    self.limits.insert(key, theirs);
                }
            }
        }

        let removed = &self.removed;
        self.limits
            .retain(|key, limit| removed.get(key).is_none_or(|&at| limit.updated_at > at));
        self.removed
            .retain(|_, at| now_ms.saturating_sub(*at) < REMOVAL_RETENTION_MS);
    }
}

/// Outcome reported to the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateEventKind {
    #[serde(rename = "429")]
    RateLimited,
    Timeout,
    Success,
    Error,
}

/// A rate feedback event for one provider/model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateEvent {
    pub kind: RateEventKind,
    pub provider: String,
    pub model: String,
}

impl RateEvent {
    pub fn new(kind: RateEventKind, provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            kind,
            provider: provider.into(),
            model: model.into(),
        }
    }
}

/// Learned per-model concurrency controller.
#[derive(Debug)]
pub struct AdaptiveRateController {
    state: Mutex<AdaptiveControllerState>,
    registry: Arc<ProviderLimitRegistry>,
    predictor: Box<dyn ThrottlePredictor>,
    state_path: Option<PathBuf>,
    lock: LockConfig,
    history_window_ms: u64,
    max_history: usize,
}

impl AdaptiveRateController {
    /// In-memory controller; add a state file with [`with_state_file`](Self::with_state_file).
    pub fn new(registry: Arc<ProviderLimitRegistry>, config: AdaptiveConfig) -> Self {
        Self {
            state: Mutex::new(AdaptiveControllerState::from_config(&config)),
            registry,
            predictor: Box::new(RecencyFrequencyPredictor::default()),
            state_path: None,
            lock: LockConfig::default(),
            history_window_ms: config.history_window_ms,
            max_history: config.max_history,
        }
    }

    pub fn with_state_file(mut self, path: impl Into<PathBuf>, lock: LockConfig) -> Self {
        self.state_path = Some(path.into());
        self.lock = lock;
        self
    }

    pub fn with_predictor(mut self, predictor: Box<dyn ThrottlePredictor>) -> Self {
        self.predictor = predictor;
        self
    }

    pub fn state_path(&self) -> Option<&Path> {
        self.state_path.as_deref()
    }

    /// Build the learned-limit key, rejecting malformed provider/model names.
    pub fn build_key(provider: &str, model: &str) -> Result<String> {
        let valid_part = |s: &str, allow_colon: bool| {
            !s.is_empty()
                && s.len() <= 128
                && s.chars().all(|c| {
                    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | '@') || (allow_colon && c == ':')
                })
        };
        let provider = provider.trim();
        let model = model.trim();
        if !valid_part(provider, false) {
            return Err(GatekeeperError::InvalidKey(format!("provider {:?}", provider)));
        }
        if !valid_part(model, true) {
            return Err(GatekeeperError::InvalidKey(format!("model {:?}", model)));
        }
        Ok(model_key(provider, model))
    }

    /// [`build_key`](Self::build_key) for lookups: `None` means "use the preset limit unchanged".
    pub fn try_build_key(provider: &str, model: &str) -> Option<String> {
        Self::build_key(provider, model).ok()
    }

    fn lock_state(&self) -> Option<MutexGuard<'_, AdaptiveControllerState>> {
        match self.state.lock() {
            Ok(guard) => Some(guard),
            Err(_) => {
                tracing::error!("Adaptive controller state poisoned, serving presets");
                None
            }
        }
    }

    /// `round(min(preset, learned) * global_multiplier)`, at least 1.
    pub fn get_effective_limit(&self, provider: &str, model: &str, preset_limit: u32) -> u32 {
        let preset_limit = preset_limit.max(1);
        let Some(key) = Self::try_build_key(provider, model) else {
            return preset_limit;
        };
        let Some(state) = self.lock_state() else {
            return preset_limit;
        };

        let learned = state.limits.get(&key).map(|l| l.concurrency).unwrap_or(preset_limit);
        let effective = (learned.min(preset_limit) as f64 * state.global_multiplier).round() as u32;
        effective.max(1)
    }

    /// Fold an outcome into the learned limit and persist.
    pub async fn record_event(&self, event: RateEvent) {
        if self.apply_event_at(&event, now_ms()) {
            self.persist_or_warn().await;
        }
    }

    /// Apply an event at `now_ms` without persisting. Returns true on mutation.
    pub fn apply_event_at(&self, event: &RateEvent, now_ms: u64) -> bool {
        let Some(key) = Self::try_build_key(&event.provider, &event.model) else {
            tracing::warn!(provider = %event.provider, model = %event.model, "Rejected malformed learned-limit key");
            return false;
        };

        match event.kind {
            RateEventKind::RateLimited => {
                let preset = self.registry.get_concurrency_limit(&event.provider, &event.model);
                let Some(mut state) = self.lock_state() else {
                    return false;
                };
                let reduction = state.reduction_factor;
                let interval = state.recovery_interval_ms;
                let predictive = state.predictive_enabled;
                let entry = state.limits.entry(key.clone()).or_insert_with(|| LearnedLimit::new(preset));
                entry.on_429(now_ms, reduction, interval);
                entry.push_history(now_ms, self.history_window_ms, self.max_history);
                if predictive {
                    entry.predicted_429_probability = Some(self.predictor.probability(&entry.historical_429s, now_ms));
                }
                tracing::warn!(
                    key = %key,
                    concurrency = entry.concurrency,
                    consecutive = entry.consecutive_429_count,
                    "Learned limit reduced after 429"
                );
                true
            }
            RateEventKind::Success => {
                let Some(mut state) = self.lock_state() else {
                    return false;
                };
                match state.limits.get_mut(&key) {
                    Some(entry) => {
                        entry.on_success(now_ms);
                        true
                    }
                    None => false,
                }
            }
            RateEventKind::Timeout | RateEventKind::Error => false,
        }
    }

    /// Snapshot of one learned limit.
    pub fn get_learned_limit(&self, provider: &str, model: &str) -> Option<LearnedLimit> {
        let key = Self::try_build_key(provider, model)?;
        self.lock_state()?.limits.get(&key).cloned()
    }

    pub fn get_all_learned_limits(&self) -> BTreeMap<String, LearnedLimit> {
        self.lock_state().map(|s| s.limits.clone()).unwrap_or_default()
    }

    /// Full state snapshot.
    pub fn snapshot(&self) -> Option<AdaptiveControllerState> {
        self.lock_state().map(|s| s.clone())
    }

    /// Forget the learned limit for a provider/model. Returns whether one existed.
    pub async fn reset_learned_limit(&self, provider: &str, model: &str) -> bool {
        let removed = match (Self::try_build_key(provider, model), self.lock_state()) {
            (Some(key), Some(mut state)) => {
                let existed = state.limits.remove(&key).is_some();
                if existed {
                    state.removed.insert(key, now_ms());
                }
                existed
            }
            _ => false,
        };
        if removed {
            self.persist_or_warn().await;
        }
        removed
    }

    /// Set the fleet-wide multiplier, clamped to [0.1, 1.0].
    pub async fn set_global_multiplier(&self, multiplier: f64) {
        if let Some(mut state) = self.lock_state() {
            state.global_multiplier = multiplier.clamp(0.1, 1.0);
        }
        self.persist_or_warn().await;
    }

    /// Update recovery tuning. `None` keeps the current value.
    pub async fn configure_recovery(
        &self,
        recovery_interval_ms: Option<u64>,
        reduction_factor: Option<f64>,
        recovery_factor: Option<f64>,
    ) -> Result<()> {
        if let Some(r) = reduction_factor
            && !(r > 0.0 && r < 1.0)
        {
            return Err(GatekeeperError::Config(format!("reduction factor must be in (0, 1), got {}", r)));
        }
        if let Some(r) = recovery_factor
            && r < 1.0
        {
            return Err(GatekeeperError::Config(format!("recovery factor must be >= 1, got {}", r)));
        }

        if let Some(mut state) = self.lock_state() {
            if let Some(interval) = recovery_interval_ms {
                state.recovery_interval_ms = interval;
            }
            if let Some(r) = reduction_factor {
                state.reduction_factor = r;
            }
            if let Some(r) = recovery_factor {
                state.recovery_factor = r;
            }
        }
        self.persist_or_warn().await;
        Ok(())
    }

    /// Enable or disable predictive throttling.
    pub async fn set_predictive(&self, enabled: bool, threshold: Option<f64>) {
        if let Some(mut state) = self.lock_state() {
            state.predictive_enabled = enabled;
            if let Some(threshold) = threshold {
                state.predictive_threshold = threshold.clamp(0.0, 1.0);
            }
        }
        self.persist_or_warn().await;
    }

    /// Run all due recoveries and persist. Returns how many ceilings grew.
    pub async fn process_recovery(&self) -> usize {
        let recovered = self.process_recovery_at(now_ms());
        if recovered > 0 {
            self.persist_or_warn().await;
        }
        recovered
    }

    pub fn process_recovery_at(&self, now_ms: u64) -> usize {
        let Some(mut state) = self.lock_state() else {
            return 0;
        };
        let reduction = state.reduction_factor;
        let recovery = state.recovery_factor;
        let interval = state.recovery_interval_ms;

        let mut recovered = 0;
        for (key, limit) in state.limits.iter_mut() {
            if limit.recover(now_ms, reduction, recovery, interval) {
                recovered += 1;
                tracing::info!(key = %key, concurrency = limit.concurrency, "Learned limit recovered");
            }
        }
        recovered
    }

    /// Predicted 429 probability for a provider/model at `now_ms`.
    pub fn predicted_probability_at(&self, provider: &str, model: &str, now_ms: u64) -> f64 {
        let Some(key) = Self::try_build_key(provider, model) else {
            return 0.0;
        };
        self.lock_state()
            .and_then(|s| s.limits.get(&key).map(|l| self.predictor.probability(&l.historical_429s, now_ms)))
            .unwrap_or(0.0)
    }

    /// Whether the predictor says to throttle before a 429 is observed.
    pub fn should_proactively_throttle(&self, provider: &str, model: &str) -> bool {
        self.should_proactively_throttle_at(provider, model, now_ms())
    }

    pub fn should_proactively_throttle_at(&self, provider: &str, model: &str, now_ms: u64) -> bool {
        let Some((enabled, threshold)) = self.lock_state().map(|s| (s.predictive_enabled, s.predictive_threshold))
        else {
            return false;
        };
        enabled && self.predicted_probability_at(provider, model, now_ms) > threshold
    }

    /// Recommended concurrency after predictive throttling.
    ///
    /// Above the threshold the ceiling shrinks by half the predicted probability.
    pub fn get_predictive_concurrency(&self, provider: &str, model: &str, current: u32) -> u32 {
        self.get_predictive_concurrency_at(provider, model, current, now_ms())
    }

    pub fn get_predictive_concurrency_at(&self, provider: &str, model: &str, current: u32, now_ms: u64) -> u32 {
        if !self.should_proactively_throttle_at(provider, model, now_ms) {
            return current;
        }
        let probability = self.predicted_probability_at(provider, model, now_ms);
        ((current as f64 * (1.0 - probability / 2.0)).floor() as u32).max(1)
    }

    /// Load the state file into memory, if one exists.
    pub async fn load(&self) -> Result<bool> {
        let Some(path) = self.state_path.as_ref() else {
            return Ok(false);
        };
        let loaded: Option<AdaptiveControllerState> = {
            let _lock = FileLock::acquire(path, &self.lock).await?;
            read_json(path).await?
        };
        match (loaded, self.lock_state()) {
            (Some(disk), Some(mut state)) => {
                *state = disk;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Adopt the on-disk state if another process wrote a newer version.
    pub async fn refresh(&self) -> Result<bool> {
        let Some(path) = self.state_path.as_ref() else {
            return Ok(false);
        };
        let disk: Option<AdaptiveControllerState> = read_json(path).await?;
        let Some(disk) = disk else {
            return Ok(false);
        };
        let Some(mut state) = self.lock_state() else {
            return Ok(false);
        };
        if disk.version > state.version {
            *state = disk;
            return Ok(true);
        }
        Ok(false)
    }

    /// Merge with the state file and write the result, under the file lock.
    ///
    /// Entries other instances wrote since the last refresh are kept.
    pub async fn persist(&self) -> Result<()> {
        let Some(path) = self.state_path.as_ref() else {
            return Ok(());
        };
        let _lock = FileLock::acquire(path, &self.lock).await?;

        let disk = match read_json::<AdaptiveControllerState>(path).await {
            Ok(disk) => disk,
            Err(e) => {
                tracing::warn!(error = %e, "Unreadable controller state file, overwriting");
                None
            }
        };

        let snapshot = {
            let mut state = self
                .state
                .lock()
                .map_err(|e| GatekeeperError::Persistence(e.to_string()))?;
            let now = now_ms();
            if let Some(disk) = disk {
                state.merge_from(disk, now, self.max_history);
            }
            state.version += 1;
            state.last_updated = now;
            state.clone()
        };
        write_json_atomic(path, &snapshot).await
    }

    async fn persist_or_warn(&self) {
        if let Err(e) = self.persist().await {
            tracing::warn!(error = %e, "Failed to persist adaptive controller state, continuing in memory");
        }
    }

    /// Drop all learned limits. Test harness only.
    pub fn reset(&self) {
        if let Some(mut state) = self.lock_state() {
            state.limits.clear();
        }
    }
}
