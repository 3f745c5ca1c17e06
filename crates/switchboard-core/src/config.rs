use crate::error::{SwitchboardError, SwitchboardResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level configuration, usually read from `switchboard.toml`.
///
/// Every section and field has a default, so an empty file is valid.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SwitchboardConfig {
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub liveness: LivenessConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub learning: LearningConfig,
}

/// Message bus limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusConfig {
    /// Maximum number of queued, undelivered messages.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// How many delivered messages the history ring keeps.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    /// Default wait for `send_and_await_reply`.
    #[serde(default = "default_reply_timeout_ms")]
    pub reply_timeout_ms: u64,
    /// Per-component inbox size.
    #[serde(default = "default_mailbox_capacity")]
    pub mailbox_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            history_limit: default_history_limit(),
            reply_timeout_ms: default_reply_timeout_ms(),
            mailbox_capacity: default_mailbox_capacity(),
        }
    }
}

impl BusConfig {
    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }
}

/// Component liveness monitoring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LivenessConfig {
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
    /// A component silent for longer than this is evicted.
    #[serde(default = "default_liveness_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: default_check_interval_secs(),
            timeout_secs: default_liveness_timeout_secs(),
        }
    }
}

impl LivenessConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Task classification and agent scoring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Feedback score above which a completed task counts as a success.
    #[serde(default = "default_success_threshold")]
    pub success_threshold: f64,
    /// Added when the agent's specialization appears in the description.
    #[serde(default = "default_specialization_bonus")]
    pub specialization_bonus: f64,
    /// Weight of the matched-capability ratio.
    #[serde(default = "default_capability_weight")]
    pub capability_weight: f64,
    /// Nudge applied by "advanced"/"simple" style keywords.
    #[serde(default = "default_complexity_delta")]
    pub complexity_delta: f64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            success_threshold: default_success_threshold(),
            specialization_bonus: default_specialization_bonus(),
            capability_weight: default_capability_weight(),
            complexity_delta: default_complexity_delta(),
        }
    }
}

/// Periodic re-weighting of agent scores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningConfig {
    #[serde(default = "default_learning_interval_secs")]
    pub interval_secs: u64,
    /// Share of the blended score kept from the current score; the rest
    /// comes from the historical average.
    #[serde(default = "default_current_weight")]
    pub current_weight: f64,
    /// Most recent outcomes per agent that feed the historical average.
    #[serde(default = "default_history_window")]
    pub history_window: usize,
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_learning_interval_secs(),
            current_weight: default_current_weight(),
            history_window: default_history_window(),
        }
    }
}

impl LearningConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

fn default_queue_capacity() -> usize {
    10_000
}
fn default_history_limit() -> usize {
    1_000
}
fn default_reply_timeout_ms() -> u64 {
    30_000
}
fn default_mailbox_capacity() -> usize {
    1_024
}
fn default_check_interval_secs() -> u64 {
    30
}
fn default_liveness_timeout_secs() -> u64 {
    60
}
fn default_success_threshold() -> f64 {
    0.7
}
fn default_specialization_bonus() -> f64 {
    0.2
}
fn default_capability_weight() -> f64 {
    0.3
}
fn default_complexity_delta() -> f64 {
    0.2
}
fn default_learning_interval_secs() -> u64 {
    300
}
fn default_current_weight() -> f64 {
    0.7
}
fn default_history_window() -> usize {
    50
}

impl SwitchboardConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(raw: &str) -> SwitchboardResult<Self> {
        let config: SwitchboardConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a file. A missing file yields the defaults.
    pub fn load(path: &Path) -> SwitchboardResult<Self> {
        if !path.exists() {
            tracing::info!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path).map_err(|e| {
            SwitchboardError::Config(format!(
                "Failed to read config '{}': {}",
                path.display(),
                e
            ))
        })?;
        Self::from_toml_str(&raw)
    }

    /// Render as TOML.
    pub fn to_toml_string(&self) -> SwitchboardResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| SwitchboardError::Config(format!("Failed to render config: {e}")))
    }

    /// Reject values the runtime cannot work with.
    pub fn validate(&self) -> SwitchboardResult<()> {
        if self.bus.queue_capacity == 0 {
            return Err(SwitchboardError::Config(
                "bus.queue_capacity must be greater than 0".into(),
            ));
        }
        if self.bus.mailbox_capacity == 0 {
            return Err(SwitchboardError::Config(
                "bus.mailbox_capacity must be greater than 0".into(),
            ));
        }
        if self.liveness.check_interval_secs == 0 {
            return Err(SwitchboardError::Config(
                "liveness.check_interval_secs must be greater than 0".into(),
            ));
        }
        if self.liveness.timeout_secs <= self.liveness.check_interval_secs {
            return Err(SwitchboardError::Config(format!(
                "liveness.timeout_secs ({}) must exceed liveness.check_interval_secs ({})",
                self.liveness.timeout_secs, self.liveness.check_interval_secs
            )));
        }
        if self.learning.interval_secs == 0 {
            return Err(SwitchboardError::Config(
                "learning.interval_secs must be greater than 0".into(),
            ));
        }
        for (name, value) in [
            ("dispatch.success_threshold", self.dispatch.success_threshold),
            ("dispatch.specialization_bonus", self.dispatch.specialization_bonus),
            ("dispatch.capability_weight", self.dispatch.capability_weight),
            ("dispatch.complexity_delta", self.dispatch.complexity_delta),
            ("learning.current_weight", self.learning.current_weight),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(SwitchboardError::Config(format!(
                    "{name} must be within [0, 1], got {value}"
                )));
            }
        }
        Ok(())
    }
}
