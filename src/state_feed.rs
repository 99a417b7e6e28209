// src/state_feed.rs - Lock-free joint feedback snapshot
use arc_swap::ArcSwap;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::joints::{JointId, JOINT_COUNT};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum FeedError {
    #[error("Feedback carries {got} joints, expected {expected}")]
    MalformedFeedback { got: usize, expected: usize },
    #[error("Feedback for joint {0} is not finite")]
    NonFinite(usize),
    #[error("No feedback received within {0:?}")]
    StartupTimeout(Duration),
}

/// One motor's report as delivered by the transport.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MotorFeedback {
    pub position: f64,
    pub velocity: f64,
}

/// Raw feedback message, not yet validated.
#[derive(Debug, Clone, Default)]
pub struct RawFeedback {
    pub sequence: u64,
    pub motors: Vec<MotorFeedback>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct JointState {
    pub position: f64,
    pub velocity: f64,
}

/// Immutable view of the latest accepted feedback.
#[derive(Debug, Clone)]
pub struct FeedSnapshot {
    pub joints: Vec<JointState>,
    pub sequence: u64,
    /// `None` until the first valid message arrives.
    pub received_at: Option<Instant>,
}

impl FeedSnapshot {
    fn empty() -> Self {
        Self {
            joints: vec![JointState::default(); JOINT_COUNT],
            sequence: 0,
            received_at: None,
        }
    }

    pub fn position(&self, joint: JointId) -> f64 {
        self.joints[joint.index()].position
    }

    pub fn positions(&self) -> Vec<f64> {
        self.joints.iter().map(|state| state.position).collect()
    }

    pub fn age(&self, now: Instant) -> Option<Duration> {
        self.received_at.map(|at| now.saturating_duration_since(at))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FeedStats {
    pub accepted: u64,
    pub rejected: u64,
}

/// Latest joint feedback, written by the transport callback and read by the
/// control task without either side waiting on the other.
#[derive(Debug)]
pub struct StateFeed {
    current: ArcSwap<FeedSnapshot>,
    accepted: AtomicU64,
    rejected: AtomicU64,
    first_tx: watch::Sender<bool>,
}

impl Default for StateFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl StateFeed {
    pub fn new() -> Self {
        let (first_tx, _) = watch::channel(false);
        Self {
            current: ArcSwap::from_pointee(FeedSnapshot::empty()),
            accepted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            first_tx,
        }
    }

    /// Validate and publish a feedback message. A malformed message is
    /// discarded and the previous snapshot stays visible.
    pub fn ingest(&self, raw: RawFeedback) -> Result<(), FeedError> {
        if let Err(e) = Self::validate(&raw) {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            tracing::warn!("Discarding feedback seq {}: {}", raw.sequence, e);
            return Err(e);
        }
        let joints = raw
            .motors
            .iter()
            .map(|motor| JointState {
                position: motor.position,
                velocity: motor.velocity,
            })
            .collect();
        self.current.store(Arc::new(FeedSnapshot {
            joints,
            sequence: raw.sequence,
            received_at: Some(Instant::now()),
        }));
        if self.accepted.fetch_add(1, Ordering::Relaxed) == 0 {
            tracing::info!("First joint feedback received (seq {})", raw.sequence);
            self.first_tx.send_replace(true);
        }
        Ok(())
    }

    fn validate(raw: &RawFeedback) -> Result<(), FeedError> {
        if raw.motors.len() != JOINT_COUNT {
            return Err(FeedError::MalformedFeedback {
                got: raw.motors.len(),
                expected: JOINT_COUNT,
            });
        }
        match raw
            .motors
            .iter()
            .position(|m| !m.position.is_finite() || !m.velocity.is_finite())
        {
            Some(index) => Err(FeedError::NonFinite(index)),
            None => Ok(()),
        }
    }

    pub fn snapshot(&self) -> Arc<FeedSnapshot> {
        self.current.load_full()
    }

    pub fn has_data(&self) -> bool {
        *self.first_tx.borrow()
    }

    /// Wait until the first valid message has been ingested.
    pub async fn await_first(&self, timeout: Duration) -> Result<Arc<FeedSnapshot>, FeedError> {
        let mut rx = self.first_tx.subscribe();
        match tokio::time::timeout(timeout, rx.wait_for(|ready| *ready)).await {
            Ok(Ok(_)) => Ok(self.snapshot()),
            // The sender lives in `self`, so the channel cannot close here.
            Ok(Err(_)) | Err(_) => Err(FeedError::StartupTimeout(timeout)),
        }
    }

    pub fn stats(&self) -> FeedStats {
        FeedStats {
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feedback(sequence: u64, count: usize, position: f64) -> RawFeedback {
        RawFeedback {
            sequence,
            motors: vec![MotorFeedback { position, velocity: 0.0 }; count],
        }
    }

    #[tokio::test]
    async fn test_ingest_valid_feedback() {
        let feed = StateFeed::new();
        assert!(!feed.has_data());
        feed.ingest(feedback(7, JOINT_COUNT, 0.25)).unwrap();
        let snapshot = feed.snapshot();
        assert_eq!(snapshot.sequence, 7);
        assert!(snapshot.received_at.is_some());
        assert!(snapshot.joints.iter().all(|j| j.position == 0.25));
        assert!(feed.has_data());
    }

    #[tokio::test]
    async fn test_malformed_count_keeps_previous_snapshot() {
        let feed = StateFeed::new();
        feed.ingest(feedback(1, JOINT_COUNT, 0.1)).unwrap();
        let result = feed.ingest(feedback(2, JOINT_COUNT - 1, 0.9));
        assert_eq!(
            result,
            Err(FeedError::MalformedFeedback { got: JOINT_COUNT - 1, expected: JOINT_COUNT })
        );
        let snapshot = feed.snapshot();
        assert_eq!(snapshot.sequence, 1);
        assert_eq!(snapshot.joints[0].position, 0.1);
        assert_eq!(feed.stats(), FeedStats { accepted: 1, rejected: 1 });
    }

    #[tokio::test]
    async fn test_non_finite_rejected() {
        let feed = StateFeed::new();
        let mut raw = feedback(3, JOINT_COUNT, 0.0);
        raw.motors[4].velocity = f64::NAN;
        assert_eq!(feed.ingest(raw), Err(FeedError::NonFinite(4)));
        assert!(!feed.has_data());
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_first_times_out() {
        let feed = StateFeed::new();
        let result = feed.await_first(Duration::from_millis(50)).await;
        assert!(matches!(result, Err(FeedError::StartupTimeout(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_first_resolves_on_ingest() {
        let feed = Arc::new(StateFeed::new());
        let writer = feed.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            writer.ingest(feedback(9, JOINT_COUNT, 0.5)).unwrap();
        });
        let snapshot = feed.await_first(Duration::from_secs(1)).await.unwrap();
        assert_eq!(snapshot.sequence, 9);
    }
}
