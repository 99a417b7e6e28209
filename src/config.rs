//! # Joint-control configuration
//!
//! Everything tunable about the control core lives in one TOML file. Every
//! field has a default, so an empty file is a valid configuration.
//!
//! ## Example: TOML Configuration
//!
//! ```toml
//! [control]
//! tick_period_us = 2000
//! startup_timeout_ms = 5000
//! publish_retries = 3
//!
//! [mode]
//! initial = "low_level"
//! switch_timeout_ms = 1000
//!
//! [gains.left_knee]
//! kp = 120.0
//! kd = 2.5
//!
//! [limits.left_elbow]
//! min = -2.0
//! max = 0.0
//! ```
//!
//! Gain and limit overrides are keyed by joint name (see `joints.rs`). Joints
//! without an override use the defaults of their role.

// src/config.rs - Single configuration file
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

use crate::joints::JointId;
use crate::mode::ControlMode;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Main configuration struct for the control loop, mode arbitration, gains,
/// limits and the loopback transport.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub mode: ModeConfig,
    #[serde(default)]
    pub gains: HashMap<String, GainOverride>,
    #[serde(default)]
    pub limits: HashMap<String, LimitOverride>,
    #[serde(default)]
    pub loopback: LoopbackConfig,
}

/// Fixed-rate loop and publication settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ControlConfig {
    #[serde(default = "default_tick_period_us")]
    pub tick_period_us: u64,
    #[serde(default = "default_startup_timeout_ms")]
    pub startup_timeout_ms: u64,
    #[serde(default = "default_publish_retries")]
    pub publish_retries: u32,
    #[serde(default = "default_publish_retry_backoff_us")]
    pub publish_retry_backoff_us: u64,
    #[serde(default = "default_publish_queue_depth")]
    pub publish_queue_depth: usize,
    /// Feedback older than this triggers the emergency stop. 0 disables the watchdog.
    #[serde(default = "default_feedback_timeout_ms")]
    pub feedback_timeout_ms: u64,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            tick_period_us: default_tick_period_us(),
            startup_timeout_ms: default_startup_timeout_ms(),
            publish_retries: default_publish_retries(),
            publish_retry_backoff_us: default_publish_retry_backoff_us(),
            publish_queue_depth: default_publish_queue_depth(),
            feedback_timeout_ms: default_feedback_timeout_ms(),
        }
    }
}

impl ControlConfig {
    pub fn tick_period(&self) -> Duration {
        Duration::from_micros(self.tick_period_us)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn publish_retry_backoff(&self) -> Duration {
        Duration::from_micros(self.publish_retry_backoff_us)
    }

    pub fn feedback_timeout(&self) -> Option<Duration> {
        (self.feedback_timeout_ms > 0).then(|| Duration::from_millis(self.feedback_timeout_ms))
    }
}

/// Mode arbitration settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModeConfig {
    #[serde(default = "default_initial_mode")]
    pub initial: ControlMode,
    #[serde(default = "default_switch_timeout_ms")]
    pub switch_timeout_ms: u64,
}

impl Default for ModeConfig {
    fn default() -> Self {
        Self {
            initial: default_initial_mode(),
            switch_timeout_ms: default_switch_timeout_ms(),
        }
    }
}

impl ModeConfig {
    pub fn switch_timeout(&self) -> Duration {
        Duration::from_millis(self.switch_timeout_ms)
    }
}

/// Per-joint gain override. Missing fields keep the role default.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct GainOverride {
    #[serde(default)]
    pub kp: Option<f64>,
    #[serde(default)]
    pub kd: Option<f64>,
}

/// Per-joint position limit override, in radians.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LimitOverride {
    pub min: f64,
    pub max: f64,
}

/// Simulated robot behind the loopback transport.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoopbackConfig {
    #[serde(default = "default_feedback_period_us")]
    pub feedback_period_us: u64,
    /// Fraction of the position error closed per feedback period.
    #[serde(default = "default_tracking")]
    pub tracking: f64,
    /// Amplitude of uniform noise added to reported positions.
    #[serde(default)]
    pub noise: f64,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            feedback_period_us: default_feedback_period_us(),
            tracking: default_tracking(),
            noise: 0.0,
        }
    }
}

impl LoopbackConfig {
    pub fn feedback_period(&self) -> Duration {
        Duration::from_micros(self.feedback_period_us)
    }
}

impl Config {
    /// Validate ranges and joint names referenced by overrides.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.control.tick_period_us == 0 {
            return Err(ConfigError::Invalid("control.tick_period_us must be > 0".to_string()));
        }
        if self.control.publish_queue_depth == 0 {
            return Err(ConfigError::Invalid("control.publish_queue_depth must be > 0".to_string()));
        }
        if self.mode.switch_timeout_ms == 0 {
            return Err(ConfigError::Invalid("mode.switch_timeout_ms must be > 0".to_string()));
        }
        for (name, gains) in &self.gains {
            if JointId::from_name(name).is_none() {
                return Err(ConfigError::Invalid(format!("gains: unknown joint '{}'", name)));
            }
            for value in [gains.kp, gains.kd].into_iter().flatten() {
                if !value.is_finite() || value < 0.0 {
                    return Err(ConfigError::Invalid(format!(
                        "gains for joint '{}' must be finite and >= 0",
                        name
                    )));
                }
            }
        }
        for (name, limits) in &self.limits {
            if JointId::from_name(name).is_none() {
                return Err(ConfigError::Invalid(format!("limits: unknown joint '{}'", name)));
            }
            if !limits.min.is_finite() || !limits.max.is_finite() || limits.min > limits.max {
                return Err(ConfigError::Invalid(format!(
                    "limits for joint '{}' must be finite with min <= max",
                    name
                )));
            }
        }
        if self.loopback.feedback_period_us == 0 {
            return Err(ConfigError::Invalid("loopback.feedback_period_us must be > 0".to_string()));
        }
        if !(self.loopback.tracking > 0.0 && self.loopback.tracking <= 1.0) {
            return Err(ConfigError::Invalid("loopback.tracking must be in (0, 1]".to_string()));
        }
        if !self.loopback.noise.is_finite() || self.loopback.noise < 0.0 {
            return Err(ConfigError::Invalid("loopback.noise must be finite and >= 0".to_string()));
        }
        Ok(())
    }
}

// Default value functions
fn default_tick_period_us() -> u64 { 2000 }
fn default_startup_timeout_ms() -> u64 { 5000 }
fn default_publish_retries() -> u32 { 3 }
fn default_publish_retry_backoff_us() -> u64 { 200 }
fn default_publish_queue_depth() -> usize { 8 }
fn default_feedback_timeout_ms() -> u64 { 500 }
fn default_initial_mode() -> ControlMode { ControlMode::HighLevel }
fn default_switch_timeout_ms() -> u64 { 1000 }
fn default_feedback_period_us() -> u64 { 2000 }
fn default_tracking() -> f64 { 0.2 }

/// Load configuration from a TOML file at the given path.
pub fn load_config(path: &str) -> Result<Config, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        tracing::error!("Failed to read config file '{}': {}", path, e);
        ConfigError::Io(e)
    })?;
    let config: Config = toml::from_str(&contents).map_err(|e| {
        tracing::error!("Failed to parse config TOML: {}", e);
        ConfigError::Toml(e)
    })?;
    config.validate()?;
    Ok(config)
}
