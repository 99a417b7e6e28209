// src/transport/loopback.rs - In-process simulated robot
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

use super::{FeedbackCallback, Transport, TransportError};
use crate::command::{CommandFrame, IntegrityCodec};
use crate::config::LoopbackConfig;
use crate::joints::JOINT_COUNT;
use crate::state_feed::{MotorFeedback, RawFeedback};

/// Published frames kept for inspection.
const HISTORY_LEN: usize = 4096;

/// First-order model of the motors: every feedback period each joint closes
/// a fixed fraction of the gap to its commanded position.
#[derive(Debug)]
struct Plant {
    commanded: Option<Vec<f64>>,
    measured: Vec<f64>,
    sequence: u64,
}

impl Plant {
    fn step(&mut self, period: Duration, tracking: f64, noise: f64) -> RawFeedback {
        let dt = period.as_secs_f64();
        let mut motors = Vec::with_capacity(self.measured.len());
        for (i, measured) in self.measured.iter_mut().enumerate() {
            let previous = *measured;
            if let Some(target) = self.commanded.as_ref().and_then(|c| c.get(i)) {
                *measured += tracking * (target - previous);
            }
            let jitter = if noise > 0.0 {
                (rand::random::<f64>() - 0.5) * 2.0 * noise
            } else {
                0.0
            };
            motors.push(MotorFeedback {
                position: *measured + jitter,
                velocity: if dt > 0.0 { (*measured - previous) / dt } else { 0.0 },
            });
        }
        self.sequence += 1;
        RawFeedback {
            sequence: self.sequence,
            motors,
        }
    }
}

/// Transport that verifies every frame the way a real bus would, drives a
/// simulated plant with it and streams the plant's state back as feedback.
/// Failures can be injected for testing.
pub struct LoopbackTransport {
    config: LoopbackConfig,
    codec: Arc<dyn IntegrityCodec>,
    plant: Arc<Mutex<Plant>>,
    callbacks: Arc<Mutex<Vec<FeedbackCallback>>>,
    history: Mutex<VecDeque<CommandFrame>>,
    published: AtomicU64,
    fail_budget: AtomicU32,
    fail_always: AtomicBool,
    feedback_paused: Arc<AtomicBool>,
    closed: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
    feedback_task: Mutex<Option<JoinHandle<()>>>,
}

impl LoopbackTransport {
    pub fn new(config: LoopbackConfig, codec: Arc<dyn IntegrityCodec>) -> Self {
        Self::with_positions(config, codec, [0.0; JOINT_COUNT])
    }

    /// Start the simulated joints at `positions`.
    pub fn with_positions(
        config: LoopbackConfig,
        codec: Arc<dyn IntegrityCodec>,
        positions: [f64; JOINT_COUNT],
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            codec,
            plant: Arc::new(Mutex::new(Plant {
                commanded: None,
                measured: positions.to_vec(),
                sequence: 0,
            })),
            callbacks: Arc::new(Mutex::new(Vec::new())),
            history: Mutex::new(VecDeque::with_capacity(HISTORY_LEN)),
            published: AtomicU64::new(0),
            fail_budget: AtomicU32::new(0),
            fail_always: AtomicBool::new(false),
            feedback_paused: Arc::new(AtomicBool::new(false)),
            closed: AtomicBool::new(false),
            shutdown_tx,
            feedback_task: Mutex::new(None),
        }
    }

    /// Fail the next `count` publish calls.
    pub fn fail_next(&self, count: u32) {
        self.fail_budget.store(count, Ordering::SeqCst);
    }

    /// Fail every publish call until turned off.
    pub fn set_fail_always(&self, fail: bool) {
        self.fail_always.store(fail, Ordering::SeqCst);
    }

    /// Stop or resume the feedback stream without closing the transport.
    pub fn pause_feedback(&self, paused: bool) {
        self.feedback_paused.store(paused, Ordering::SeqCst);
    }

    /// Deliver `raw` to every subscriber as if it came off the bus.
    pub async fn inject(&self, raw: RawFeedback) {
        let callbacks = self.callbacks.lock().await.clone();
        for callback in callbacks {
            callback(raw.clone());
        }
    }

    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::SeqCst)
    }

    pub async fn published_frames(&self) -> Vec<CommandFrame> {
        self.history.lock().await.iter().cloned().collect()
    }

    pub async fn last_frame(&self) -> Option<CommandFrame> {
        self.history.lock().await.back().cloned()
    }

    pub async fn measured_positions(&self) -> Vec<f64> {
        self.plant.lock().await.measured.clone()
    }

    fn spawn_feedback(&self) -> JoinHandle<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let plant = self.plant.clone();
        let callbacks = self.callbacks.clone();
        let paused = self.feedback_paused.clone();
        let period = self.config.feedback_period();
        let tracking = self.config.tracking;
        let noise = self.config.noise;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        tracing::info!("Loopback feedback stream shutting down");
                        break;
                    }
                    _ = interval.tick() => {
                        if paused.load(Ordering::SeqCst) {
                            continue;
                        }
                        let raw = plant.lock().await.step(period, tracking, noise);
                        let subscribers = callbacks.lock().await.clone();
                        for callback in subscribers {
                            callback(raw.clone());
                        }
                    }
                }
            }
        })
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn publish(&self, frame: &CommandFrame) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        if self.fail_always.load(Ordering::SeqCst)
            || self
                .fail_budget
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            return Err(TransportError::Publish("injected failure".to_string()));
        }
        let decoded = CommandFrame::decode(&frame.to_bytes(), self.codec.as_ref())
            .map_err(|e| TransportError::Publish(e.to_string()))?;

        self.plant.lock().await.commanded = Some(decoded.positions());
        let mut history = self.history.lock().await;
        if history.len() == HISTORY_LEN {
            history.pop_front();
        }
        history.push_back(decoded);
        self.published.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn subscribe(&self, callback: FeedbackCallback) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.callbacks.lock().await.push(callback);
        let mut task = self.feedback_task.lock().await;
        if task.is_none() {
            tracing::info!(
                "Loopback feedback stream started ({:?} period)",
                self.config.feedback_period()
            );
            *task = Some(self.spawn_feedback());
        }
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(());
        if let Some(task) = self.feedback_task.lock().await.take() {
            let _ = task.await;
        }
    }
}
