// src/motion/mod.rs - Joint-space trajectories
pub mod planner;
pub mod trajectory;

pub use planner::TrajectoryPlanner;
pub use trajectory::{ease_in_out, JointSegment, Trajectory};

use thiserror::Error;

use crate::joints::JointId;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum MotionError {
    #[error("Target {value} for joint {joint} is not finite")]
    InvalidTarget { joint: JointId, value: f64 },
    #[error("Trajectory duration must be finite, >= 0 and at most one hour, got {0}s")]
    InvalidDuration(f64),
    #[error("Joint {0} appears more than once in the request")]
    DuplicateJoint(JointId),
    #[error("Trajectory request names no joints")]
    EmptyRequest,
}
