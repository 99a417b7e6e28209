//! Ease-in-out trajectories in joint space.
//!
//! A trajectory moves a set of joints from a frozen start position to a
//! clamped target over a fixed duration. The weighting `0.5 * (1 - cos(pi t))`
//! has zero slope at both ends, so a joint leaves and arrives at rest.

// src/motion/trajectory.rs
use std::f64::consts::PI;
use std::time::Duration;
use tokio::time::Instant;

use super::MotionError;
use crate::joints::JointId;

/// Interpolation weight for normalised progress `t`. Inputs outside `[0, 1]`
/// are clamped.
pub fn ease_in_out(t: f64) -> f64 {
    let t = t.clamp(0.0, 1.0);
    0.5 * (1.0 - (PI * t).cos())
}

/// Longest trajectory accepted, in seconds.
pub const MAX_DURATION_SECS: f64 = 3600.0;

/// Longest trajectory accepted.
pub const MAX_DURATION: Duration = Duration::from_secs(3600);

/// Convert a caller-supplied duration in seconds. Anything negative, not
/// finite or longer than [`MAX_DURATION`] is rejected.
pub fn duration_from_secs(secs: f64) -> Result<Duration, MotionError> {
    if !(0.0..=MAX_DURATION_SECS).contains(&secs) {
        return Err(MotionError::InvalidDuration(secs));
    }
    Duration::try_from_secs_f64(secs).map_err(|_| MotionError::InvalidDuration(secs))
}

/// Path of one joint inside a trajectory.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JointSegment {
    pub joint: JointId,
    /// Captured once when the trajectory is created.
    pub start: f64,
    /// Already clamped to the joint's limits.
    pub target: f64,
}

impl JointSegment {
    /// Position at normalised progress `t`. Exact at both endpoints.
    pub fn position_at(&self, t: f64) -> f64 {
        if t <= 0.0 {
            self.start
        } else if t >= 1.0 {
            self.target
        } else {
            self.start + ease_in_out(t) * (self.target - self.start)
        }
    }
}

#[derive(Debug, Clone)]
pub struct Trajectory {
    segments: Vec<JointSegment>,
    duration: Duration,
    created: Instant,
}

impl Trajectory {
    pub fn new(segments: Vec<JointSegment>, duration: Duration, created: Instant) -> Self {
        Self { segments, duration, created }
    }

    pub fn segments(&self) -> &[JointSegment] {
        &self.segments
    }

    pub fn segment(&self, joint: JointId) -> Option<&JointSegment> {
        self.segments.iter().find(|segment| segment.joint == joint)
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn created(&self) -> Instant {
        self.created
    }

    pub fn contains(&self, joint: JointId) -> bool {
        self.segment(joint).is_some()
    }

    /// Normalised progress in `[0, 1]`. A zero-length trajectory is complete
    /// immediately.
    pub fn progress(&self, now: Instant) -> f64 {
        if self.duration.is_zero() {
            return 1.0;
        }
        let elapsed = now.saturating_duration_since(self.created);
        (elapsed.as_secs_f64() / self.duration.as_secs_f64()).clamp(0.0, 1.0)
    }

    /// Instant at which the trajectory reaches its target, if representable.
    pub fn end(&self) -> Option<Instant> {
        self.created.checked_add(self.duration)
    }

    /// Active while `now < created + duration`. An end past the clock's range
    /// never arrives.
    pub fn is_active(&self, now: Instant) -> bool {
        self.end().is_none_or(|end| now < end)
    }

    /// Interpolated position of every joint in the trajectory.
    pub fn sample(&self, now: Instant) -> impl Iterator<Item = (JointId, f64)> + '_ {
        let t = self.progress(now);
        self.segments
            .iter()
            .map(move |segment| (segment.joint, segment.position_at(t)))
    }

    pub fn sample_joint(&self, joint: JointId, now: Instant) -> Option<f64> {
        let t = self.progress(now);
        self.segment(joint).map(|segment| segment.position_at(t))
    }

    /// Drop the given joints from this trajectory. Returns `true` if any
    /// joint is left.
    pub(crate) fn release(&mut self, joints: &[JointId]) -> bool {
        self.segments.retain(|segment| !joints.contains(&segment.joint));
        !self.segments.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn joint(index: usize) -> JointId {
        JointId::new(index).unwrap()
    }

    #[test]
    fn test_ease_in_out_endpoints() {
        assert_eq!(ease_in_out(0.0), 0.0);
        assert_eq!(ease_in_out(1.0), 1.0);
        assert!((ease_in_out(0.5) - 0.5).abs() < 1e-12);
        assert_eq!(ease_in_out(-3.0), 0.0);
        assert_eq!(ease_in_out(7.0), 1.0);
    }

    #[test]
    fn test_segment_exact_endpoints() {
        let segment = JointSegment { joint: joint(0), start: 0.123, target: -0.456 };
        assert_eq!(segment.position_at(0.0), 0.123);
        assert_eq!(segment.position_at(1.0), -0.456);
        assert_eq!(segment.position_at(1.5), -0.456);
    }

    #[test]
    fn test_segment_is_monotonic_and_bounded() {
        let rising = JointSegment { joint: joint(1), start: -0.4, target: 1.1 };
        let falling = JointSegment { joint: joint(2), start: 0.9, target: -2.0 };
        for segment in [rising, falling] {
            let (lo, hi) = if segment.start < segment.target {
                (segment.start, segment.target)
            } else {
                (segment.target, segment.start)
            };
            let mut previous_distance = (segment.target - segment.start).abs();
            for step in 1..=1000 {
                let value = segment.position_at(step as f64 / 1000.0);
                assert!(value >= lo && value <= hi);
                let distance = (segment.target - value).abs();
                assert!(distance < previous_distance, "step {}", step);
                previous_distance = distance;
            }
        }
    }

    #[test]
    fn test_velocity_is_zero_at_endpoints() {
        let segment = JointSegment { joint: joint(3), start: 0.0, target: 1.0 };
        let h = 1e-6;
        let start_slope = (segment.position_at(h) - segment.position_at(0.0)) / h;
        let end_slope = (segment.position_at(1.0) - segment.position_at(1.0 - h)) / h;
        assert!(start_slope.abs() < 1e-3);
        assert!(end_slope.abs() < 1e-3);
    }

    #[test]
    fn test_zero_duration_completes_immediately() {
        let now = Instant::now();
        let trajectory = Trajectory::new(
            vec![JointSegment { joint: joint(4), start: 0.0, target: 0.3 }],
            Duration::ZERO,
            now,
        );
        assert!(!trajectory.is_active(now));
        assert_eq!(trajectory.sample_joint(joint(4), now), Some(0.3));
    }

    #[test]
    fn test_duration_from_secs() {
        assert_eq!(duration_from_secs(1.5).unwrap(), Duration::from_millis(1500));
        assert!(matches!(duration_from_secs(-1.0), Err(MotionError::InvalidDuration(_))));
        assert!(duration_from_secs(f64::NAN).is_err());
        assert!(duration_from_secs(f64::INFINITY).is_err());
        assert_eq!(duration_from_secs(MAX_DURATION_SECS).unwrap(), MAX_DURATION);
        assert!(duration_from_secs(MAX_DURATION_SECS + 1.0).is_err());
        assert!(duration_from_secs(1.8e19).is_err());
    }

    #[test]
    fn test_unreachable_end_stays_active() {
        let now = Instant::now();
        let trajectory = Trajectory::new(
            vec![JointSegment { joint: joint(7), start: 0.2, target: 0.5 }],
            Duration::MAX,
            now,
        );
        assert!(trajectory.end().is_none());
        assert!(trajectory.is_active(now + Duration::from_secs(86_400)));
        assert_eq!(trajectory.sample_joint(joint(7), now), Some(0.2));
    }

    #[test]
    fn test_release_drops_joints() {
        let now = Instant::now();
        let mut trajectory = Trajectory::new(
            vec![
                JointSegment { joint: joint(5), start: 0.0, target: 0.1 },
                JointSegment { joint: joint(6), start: 0.0, target: 0.2 },
            ],
            Duration::from_secs(1),
            now,
        );
        assert!(trajectory.release(&[joint(5)]));
        assert!(!trajectory.contains(joint(5)));
        assert!(!trajectory.release(&[joint(6)]));
    }
}
