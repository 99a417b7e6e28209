// src/safety.rs - Per-joint position limits
use serde::Serialize;

use crate::config::{Config, ConfigError};
use crate::joints::{JointId, JointRole, JOINT_COUNT};

/// Position range of one joint in radians. `min <= max` always holds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct JointLimits {
    min: f64,
    max: f64,
}

impl JointLimits {
    /// Returns `None` unless both bounds are finite and `min <= max`.
    pub fn new(min: f64, max: f64) -> Option<Self> {
        (min.is_finite() && max.is_finite() && min <= max).then_some(Self { min, max })
    }

    pub fn min(&self) -> f64 {
        self.min
    }

    pub fn max(&self) -> f64 {
        self.max
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }

    /// Default range for a role. `Other` gets the conservative fallback.
    pub const fn for_role(role: JointRole) -> Self {
        let (min, max) = match role {
            JointRole::ShoulderPitch => (-3.14, 1.57),
            JointRole::ShoulderRoll => (-1.57, 1.57),
            JointRole::Elbow => (-2.62, 0.0),
            JointRole::Wrist => (-1.57, 1.57),
            JointRole::HipPitch => (-0.785, 2.356),
            JointRole::HipRoll | JointRole::HipYaw => (-0.785, 0.785),
            JointRole::Knee => (0.0, 2.356),
            JointRole::AnklePitch => (-1.047, 1.047),
            JointRole::AnkleRoll => (-0.524, 0.524),
            JointRole::Other => (-1.57, 1.57),
        };
        Self { min, max }
    }
}

/// Clamping table with exactly one entry per joint.
#[derive(Debug, Clone)]
pub struct SafetyLimits {
    table: [JointLimits; JOINT_COUNT],
}

impl Default for SafetyLimits {
    fn default() -> Self {
        let mut table = [JointLimits::for_role(JointRole::Other); JOINT_COUNT];
        for joint in JointId::all() {
            table[joint.index()] = JointLimits::for_role(joint.role());
        }
        Self { table }
    }
}

impl SafetyLimits {
    /// Role defaults with the per-joint overrides from `[limits]` applied.
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let mut limits = Self::default();
        for (name, range) in &config.limits {
            let joint = JointId::from_name(name)
                .ok_or_else(|| ConfigError::Invalid(format!("limits: unknown joint '{}'", name)))?;
            let entry = JointLimits::new(range.min, range.max).ok_or_else(|| {
                ConfigError::Invalid(format!("limits for joint '{}' must be finite with min <= max", name))
            })?;
            limits.set(joint, entry);
        }
        Ok(limits)
    }

    pub fn set(&mut self, joint: JointId, limits: JointLimits) {
        self.table[joint.index()] = limits;
    }

    pub fn limits_for(&self, joint: JointId) -> JointLimits {
        self.table[joint.index()]
    }

    pub fn clamp(&self, joint: JointId, value: f64) -> f64 {
        self.clamp_checked(joint, value).0
    }

    /// Clamped value plus whether the input was outside the range.
    pub fn clamp_checked(&self, joint: JointId, value: f64) -> (f64, bool) {
        let limits = self.limits_for(joint);
        let clamped = value.clamp(limits.min, limits.max);
        (clamped, clamped != value)
    }
}
