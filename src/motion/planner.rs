// src/motion/planner.rs - Active trajectory bookkeeping
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;

use super::MotionError;
use super::trajectory::{JointSegment, Trajectory, MAX_DURATION};
use crate::joints::JointId;
use crate::safety::SafetyLimits;
use crate::state_feed::FeedSnapshot;

/// Owns the trajectories currently in flight. Each joint belongs to at most
/// one active trajectory; a new request takes over only the joints it names.
#[derive(Debug)]
pub struct TrajectoryPlanner {
    limits: SafetyLimits,
    active: Vec<Trajectory>,
    clamped: u64,
}

impl TrajectoryPlanner {
    pub fn new(limits: SafetyLimits) -> Self {
        Self {
            limits,
            active: Vec::new(),
            clamped: 0,
        }
    }

    pub fn limits(&self) -> &SafetyLimits {
        &self.limits
    }

    /// Start a trajectory toward `targets`.
    ///
    /// Targets are clamped to the joint limits. A joint that is mid-flight
    /// starts from its current interpolated position and leaves its previous
    /// trajectory; every other joint starts from the feedback snapshot.
    pub fn begin(
        &mut self,
        targets: &[(JointId, f64)],
        duration: Duration,
        now: Instant,
        snapshot: &FeedSnapshot,
    ) -> Result<Trajectory, MotionError> {
        if targets.is_empty() {
            return Err(MotionError::EmptyRequest);
        }
        if duration > MAX_DURATION || now.checked_add(duration).is_none() {
            return Err(MotionError::InvalidDuration(duration.as_secs_f64()));
        }
        for (i, &(joint, value)) in targets.iter().enumerate() {
            if !value.is_finite() {
                return Err(MotionError::InvalidTarget { joint, value });
            }
            if targets[..i].iter().any(|(other, _)| *other == joint) {
                return Err(MotionError::DuplicateJoint(joint));
            }
        }

        let mut segments = Vec::with_capacity(targets.len());
        for &(joint, requested) in targets {
            let (target, was_clamped) = self.limits.clamp_checked(joint, requested);
            if was_clamped {
                self.clamped += 1;
                let limits = self.limits.limits_for(joint);
                tracing::warn!(
                    "Target {:.4} for {} outside [{:.4}, {:.4}], clamped to {:.4}",
                    requested,
                    joint,
                    limits.min(),
                    limits.max(),
                    target
                );
            }
            let start = self
                .in_flight_position(joint, now)
                .unwrap_or_else(|| snapshot.position(joint));
            segments.push(JointSegment { joint, start, target });
        }

        let joints: Vec<JointId> = targets.iter().map(|(joint, _)| *joint).collect();
        self.active.retain_mut(|trajectory| trajectory.release(&joints));

        let trajectory = Trajectory::new(segments, duration, now);
        tracing::debug!(
            "Trajectory started for {} joints over {:?} ({} active)",
            joints.len(),
            duration,
            self.active.len() + 1
        );
        self.active.push(trajectory.clone());
        Ok(trajectory)
    }

    fn in_flight_position(&self, joint: JointId, now: Instant) -> Option<f64> {
        self.active
            .iter()
            .find_map(|trajectory| trajectory.sample_joint(joint, now))
    }

    /// Sample every active trajectory at `now` and retire the finished ones.
    /// A retiring trajectory reports its exact targets one last time so the
    /// caller can hold there.
    pub fn advance(&mut self, now: Instant) -> BTreeMap<JointId, f64> {
        let mut samples = BTreeMap::new();
        for trajectory in &self.active {
            samples.extend(trajectory.sample(now));
        }
        let before = self.active.len();
        self.active.retain(|trajectory| trajectory.is_active(now));
        if self.active.len() != before {
            tracing::debug!("{} trajectories finished", before - self.active.len());
        }
        samples
    }

    /// Discard every active trajectory without sampling it.
    pub fn clear(&mut self) -> usize {
        let dropped = self.active.len();
        self.active.clear();
        dropped
    }

    pub fn is_active(&self) -> bool {
        !self.active.is_empty()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Number of targets clamped since creation.
    pub fn clamped_count(&self) -> u64 {
        self.clamped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::joints::JOINT_COUNT;
    use crate::state_feed::JointState;

    fn snapshot_at(position: f64) -> FeedSnapshot {
        FeedSnapshot {
            joints: vec![JointState { position, velocity: 0.0 }; JOINT_COUNT],
            sequence: 1,
            received_at: Some(Instant::now()),
        }
    }

    fn roll() -> JointId {
        JointId::from_name("left_shoulder_roll").unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_clamped_target_scenario() {
        let mut planner = TrajectoryPlanner::new(SafetyLimits::default());
        let now = Instant::now();
        let trajectory = planner
            .begin(&[(roll(), 3.14)], Duration::from_secs(1), now, &snapshot_at(0.0))
            .unwrap();
        assert_eq!(trajectory.segment(roll()).unwrap().target, 1.57);
        assert_eq!(planner.clamped_count(), 1);

        let half = trajectory.sample_joint(roll(), now + Duration::from_millis(500)).unwrap();
        assert!((half - 0.785).abs() < 1e-9);
        let end = trajectory.sample_joint(roll(), now + Duration::from_secs(1)).unwrap();
        assert_eq!(end, 1.57);
        assert_eq!(trajectory.sample_joint(roll(), now), Some(0.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_advance_retires_with_final_target() {
        let mut planner = TrajectoryPlanner::new(SafetyLimits::default());
        let now = Instant::now();
        planner
            .begin(&[(roll(), 0.5)], Duration::from_millis(100), now, &snapshot_at(0.0))
            .unwrap();
        let mid = planner.advance(now + Duration::from_millis(50));
        assert!(mid[&roll()] > 0.0 && mid[&roll()] < 0.5);
        assert!(planner.is_active());

        let last = planner.advance(now + Duration::from_millis(100));
        assert_eq!(last[&roll()], 0.5);
        assert!(!planner.is_active());
        assert!(planner.advance(now + Duration::from_millis(102)).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_replacement_starts_from_interpolated_position() {
        let mut planner = TrajectoryPlanner::new(SafetyLimits::default());
        let now = Instant::now();
        let elbow = JointId::from_name("left_elbow").unwrap();
        planner
            .begin(
                &[(roll(), 1.0), (elbow, -1.0)],
                Duration::from_secs(1),
                now,
                &snapshot_at(0.0),
            )
            .unwrap();

        let later = now + Duration::from_millis(250);
        let expected = planner.advance(later)[&roll()];
        // The snapshot lags behind; the new start must not jump back to it.
        let replacement = planner
            .begin(&[(roll(), -0.5)], Duration::from_secs(2), later, &snapshot_at(0.0))
            .unwrap();
        assert_eq!(replacement.segment(roll()).unwrap().start, expected);
        assert_eq!(planner.active_count(), 2);

        let samples = planner.advance(later);
        assert_eq!(samples[&roll()], expected);
        assert!(samples.contains_key(&elbow));
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_takeover_drops_old_trajectory() {
        let mut planner = TrajectoryPlanner::new(SafetyLimits::default());
        let now = Instant::now();
        planner
            .begin(&[(roll(), 1.0)], Duration::from_secs(1), now, &snapshot_at(0.0))
            .unwrap();
        planner
            .begin(&[(roll(), 0.2)], Duration::from_secs(1), now, &snapshot_at(0.0))
            .unwrap();
        assert_eq!(planner.active_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_begin_rejects_bad_requests() {
        let mut planner = TrajectoryPlanner::new(SafetyLimits::default());
        let now = Instant::now();
        let snapshot = snapshot_at(0.0);
        assert_eq!(
            planner.begin(&[], Duration::from_secs(1), now, &snapshot).unwrap_err(),
            MotionError::EmptyRequest
        );
        assert!(matches!(
            planner.begin(&[(roll(), f64::NAN)], Duration::from_secs(1), now, &snapshot),
            Err(MotionError::InvalidTarget { .. })
        ));
        assert_eq!(
            planner
                .begin(&[(roll(), 0.1), (roll(), 0.2)], Duration::from_secs(1), now, &snapshot)
                .unwrap_err(),
            MotionError::DuplicateJoint(roll())
        );
        assert!(matches!(
            planner.begin(&[(roll(), 0.1)], MAX_DURATION + Duration::from_secs(1), now, &snapshot),
            Err(MotionError::InvalidDuration(_))
        ));
        assert!(matches!(
            planner.begin(&[(roll(), 0.1)], Duration::MAX, now, &snapshot),
            Err(MotionError::InvalidDuration(_))
        ));
        assert!(!planner.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_longest_duration_advances() {
        let mut planner = TrajectoryPlanner::new(SafetyLimits::default());
        let now = Instant::now();
        planner
            .begin(&[(roll(), 1.0)], MAX_DURATION, now, &snapshot_at(0.0))
            .unwrap();
        let samples = planner.advance(now + Duration::from_secs(1));
        assert!(samples[&roll()] > 0.0 && samples[&roll()] < 1e-3);
        assert!(planner.is_active());
        let last = planner.advance(now + MAX_DURATION);
        assert_eq!(last[&roll()], 1.0);
        assert!(!planner.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_discards_everything() {
        let mut planner = TrajectoryPlanner::new(SafetyLimits::default());
        let now = Instant::now();
        planner
            .begin(&[(roll(), 1.0)], Duration::from_secs(1), now, &snapshot_at(0.0))
            .unwrap();
        assert_eq!(planner.clear(), 1);
        assert!(planner.advance(now + Duration::from_millis(10)).is_empty());
    }
}
