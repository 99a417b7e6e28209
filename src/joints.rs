// src/joints.rs - Fixed joint set and role classification
use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of actuated joints on the limb system. The motor order below is the
/// hardware order and never changes at runtime.
pub const JOINT_COUNT: usize = 29;

/// Index of one actuator in the fixed joint set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "usize", into = "usize")]
pub struct JointId(usize);

impl JointId {
    /// Returns `None` for indices outside the joint set.
    pub fn new(index: usize) -> Option<Self> {
        (index < JOINT_COUNT).then_some(Self(index))
    }

    pub fn index(self) -> usize {
        self.0
    }

    pub fn name(self) -> &'static str {
        JOINT_TABLE[self.0].0
    }

    pub fn role(self) -> JointRole {
        JOINT_TABLE[self.0].1
    }

    pub fn from_name(name: &str) -> Option<Self> {
        JOINT_TABLE
            .iter()
            .position(|(joint_name, _)| *joint_name == name)
            .map(Self)
    }

    /// All joints in hardware order.
    pub fn all() -> impl Iterator<Item = JointId> {
        (0..JOINT_COUNT).map(Self)
    }
}

impl fmt::Display for JointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.name(), self.0)
    }
}

impl TryFrom<usize> for JointId {
    type Error = String;

    fn try_from(index: usize) -> Result<Self, Self::Error> {
        Self::new(index).ok_or_else(|| format!("joint index {} out of range 0..{}", index, JOINT_COUNT))
    }
}

impl From<JointId> for usize {
    fn from(joint: JointId) -> usize {
        joint.0
    }
}

/// Mechanical role of a joint. Limits and default gains are keyed on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JointRole {
    ShoulderPitch,
    ShoulderRoll,
    Elbow,
    Wrist,
    HipPitch,
    HipRoll,
    HipYaw,
    Knee,
    AnklePitch,
    AnkleRoll,
    Other,
}

use JointRole::*;

const JOINT_TABLE: [(&str, JointRole); JOINT_COUNT] = [
    // Left leg
    ("left_hip_pitch", HipPitch),
    ("left_hip_roll", HipRoll),
    ("left_hip_yaw", HipYaw),
    ("left_knee", Knee),
    ("left_ankle_pitch", AnklePitch),
    ("left_ankle_roll", AnkleRoll),
    // Right leg
    ("right_hip_pitch", HipPitch),
    ("right_hip_roll", HipRoll),
    ("right_hip_yaw", HipYaw),
    ("right_knee", Knee),
    ("right_ankle_pitch", AnklePitch),
    ("right_ankle_roll", AnkleRoll),
    // Waist
    ("waist_yaw", Other),
    ("waist_roll", Other),
    ("waist_pitch", Other),
    // Left arm
    ("left_shoulder_pitch", ShoulderPitch),
    ("left_shoulder_roll", ShoulderRoll),
    ("left_shoulder_yaw", Other),
    ("left_elbow", Elbow),
    ("left_wrist_roll", Wrist),
    ("left_wrist_pitch", Wrist),
    ("left_wrist_yaw", Wrist),
    // Right arm
    ("right_shoulder_pitch", ShoulderPitch),
    ("right_shoulder_roll", ShoulderRoll),
    ("right_shoulder_yaw", Other),
    ("right_elbow", Elbow),
    ("right_wrist_roll", Wrist),
    ("right_wrist_pitch", Wrist),
    ("right_wrist_yaw", Wrist),
];
