use serde::Deserialize;

use crate::error::SchedulerError;

/// Scorer weight vector (spec.md §4.5). Must sum to 1 within `1e-3`.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct ScorerWeights {
    #[serde(default = "default_weight_wait")]
    pub wait: f64,
    #[serde(default = "default_weight_load")]
    pub load: f64,
    #[serde(default = "default_weight_priority")]
    pub priority: f64,
}

impl Default for ScorerWeights {
    fn default() -> Self {
        Self {
            wait: default_weight_wait(),
            load: default_weight_load(),
            priority: default_weight_priority(),
        }
    }
}

impl ScorerWeights {
    /// spec.md §4.5 `validateWeights`: weights must sum to 1 within 1e-3.
    pub fn validate(&self) -> Result<(), SchedulerError> {
        let sum = self.wait + self.load + self.priority;
        if (sum - 1.0).abs() > 1e-3 {
            return Err(SchedulerError::InvalidConfig(format!(
                "scorer weights must sum to 1.0 (got {sum})"
            )));
        }
        Ok(())
    }
}

fn default_weight_wait() -> f64 {
    0.4
}
fn default_weight_load() -> f64 {
    0.4
}
fn default_weight_priority() -> f64 {
    0.2
}

/// Recognized runtime configuration (spec.md §6). Loaded from TOML
/// following the teacher's `HostConfig` pattern: every field carries
/// the named default via `#[serde(default = "...")]` so a partial file
/// is valid.
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_fallback_threshold")]
    pub fallback_threshold: u32,
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,
    #[serde(default = "default_unhealthy_timeout_ms")]
    pub unhealthy_timeout_ms: u64,
    #[serde(default = "default_removed_timeout_ms")]
    pub removed_timeout_ms: u64,
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,
    #[serde(default = "default_avg_task_duration_ms")]
    pub avg_task_duration_ms: f64,
    #[serde(default = "default_alpha")]
    pub alpha: f64,
    #[serde(default = "default_default_duration_ms")]
    pub default_duration_ms: f64,
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: u64,
    #[serde(default = "default_snapshot_interval")]
    pub snapshot_interval: u64,
    #[serde(default = "default_accuracy_window_size")]
    pub accuracy_window_size: usize,
    #[serde(default = "default_accuracy_threshold")]
    pub accuracy_threshold: f64,
    #[serde(default = "default_drift_lower")]
    pub drift_lower: f64,
    #[serde(default = "default_drift_upper")]
    pub drift_upper: f64,
    #[serde(default)]
    pub weights: ScorerWeights,
    #[serde(default = "default_max_wait_ms")]
    pub max_wait_ms: f64,
    #[serde(default = "default_max_priority")]
    pub max_priority: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            fallback_threshold: default_fallback_threshold(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            unhealthy_timeout_ms: default_unhealthy_timeout_ms(),
            removed_timeout_ms: default_removed_timeout_ms(),
            health_check_interval_ms: default_health_check_interval_ms(),
            avg_task_duration_ms: default_avg_task_duration_ms(),
            alpha: default_alpha(),
            default_duration_ms: default_default_duration_ms(),
            confidence_threshold: default_confidence_threshold(),
            snapshot_interval: default_snapshot_interval(),
            accuracy_window_size: default_accuracy_window_size(),
            accuracy_threshold: default_accuracy_threshold(),
            drift_lower: default_drift_lower(),
            drift_upper: default_drift_upper(),
            weights: ScorerWeights::default(),
            max_wait_ms: default_max_wait_ms(),
            max_priority: default_max_priority(),
        }
    }
}

impl SchedulerConfig {
    /// Validated at the config mutation point, never in the hot loop
    /// (spec.md §7.8).
    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.fallback_threshold < 1 {
            return Err(SchedulerError::InvalidConfig(
                "fallbackThreshold must be >= 1".into(),
            ));
        }
        if self.heartbeat_timeout_ms < 1000 {
            return Err(SchedulerError::InvalidConfig(
                "heartbeatTimeoutMs must be >= 1000".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.alpha) || self.alpha == 0.0 {
            return Err(SchedulerError::InvalidConfig(
                "alpha must be in (0, 1]".into(),
            ));
        }
        self.weights.validate()?;
        Ok(())
    }
}

fn default_fallback_threshold() -> u32 {
    3
}
fn default_heartbeat_timeout_ms() -> u64 {
    30_000
}
fn default_unhealthy_timeout_ms() -> u64 {
    30_000
}
fn default_removed_timeout_ms() -> u64 {
    300_000
}
fn default_health_check_interval_ms() -> u64 {
    5_000
}
fn default_avg_task_duration_ms() -> f64 {
    5_000.0
}
fn default_alpha() -> f64 {
    0.3
}
fn default_default_duration_ms() -> f64 {
    5_000.0
}
fn default_confidence_threshold() -> u64 {
    100
}
fn default_snapshot_interval() -> u64 {
    100
}
fn default_accuracy_window_size() -> usize {
    1000
}
fn default_accuracy_threshold() -> f64 {
    0.25
}
fn default_drift_lower() -> f64 {
    0.5
}
fn default_drift_upper() -> f64 {
    2.0
}
fn default_max_wait_ms() -> f64 {
    60_000.0
}
fn default_max_priority() -> u32 {
    10
}
