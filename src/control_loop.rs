// src/control_loop.rs - Fixed-rate command generation
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::command::{CommandBuilder, CommandFrame, GainTable, IntegrityCodec};
use crate::config::ControlConfig;
use crate::emergency::EmergencyStop;
use crate::joints::{JointId, JOINT_COUNT};
use crate::limb::ControlError;
use crate::motion::{Trajectory, TrajectoryPlanner};
use crate::safety::SafetyLimits;
use crate::state_feed::StateFeed;
use crate::transport::Transport;

/// Pending requests from control handles.
const REQUEST_QUEUE_DEPTH: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    NotStarted,
    Running,
    Stopped,
}

/// Requests served by the tick task between ticks.
#[derive(Debug)]
pub enum ControlRequest {
    BeginTrajectory {
        targets: Vec<(JointId, f64)>,
        duration: Duration,
        respond_to: oneshot::Sender<Result<Trajectory, ControlError>>,
    },
}

/// What the tick task last produced.
#[derive(Debug, Clone, Serialize)]
pub struct LoopStatus {
    pub state: LoopState,
    pub last_frame_seq: Option<u64>,
    pub commanded: Vec<f64>,
    pub active_trajectories: usize,
}

#[derive(Debug, Default)]
pub(crate) struct LoopCounters {
    ticks: AtomicU64,
    overruns: AtomicU64,
    published: AtomicU64,
    publish_retries: AtomicU64,
    publish_failures: AtomicU64,
    dropped_frames: AtomicU64,
}

/// Counter snapshot for status reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoopStats {
    pub ticks: u64,
    pub overruns: u64,
    pub published: u64,
    pub publish_retries: u64,
    pub publish_failures: u64,
    pub dropped_frames: u64,
}

impl LoopCounters {
    pub(crate) fn snapshot(&self) -> LoopStats {
        LoopStats {
            ticks: self.ticks.load(Ordering::Relaxed),
            overruns: self.overruns.load(Ordering::Relaxed),
            published: self.published.load(Ordering::Relaxed),
            publish_retries: self.publish_retries.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            dropped_frames: self.dropped_frames.load(Ordering::Relaxed),
        }
    }
}

/// Drives the planner and builder at a fixed period and hands frames to a
/// publisher task.
///
/// Lifecycle is `NotStarted -> Running -> Stopped`; a stopped loop cannot be
/// restarted. Feedback must have arrived before the first tick.
pub struct ControlLoop {
    config: ControlConfig,
    feed: Arc<StateFeed>,
    emergency: EmergencyStop,
    transport: Arc<dyn Transport>,
    codec: Arc<dyn IntegrityCodec>,
    limits: SafetyLimits,
    gains: GainTable,
    state: LoopState,
    shutdown_tx: broadcast::Sender<()>,
    requests_tx: mpsc::Sender<ControlRequest>,
    requests_rx: Option<mpsc::Receiver<ControlRequest>>,
    status_tx: Arc<watch::Sender<LoopStatus>>,
    status_rx: watch::Receiver<LoopStatus>,
    counters: Arc<LoopCounters>,
    low_level: watch::Receiver<bool>,
    stopping: Arc<AtomicBool>,
    tick_task: Option<JoinHandle<()>>,
    publisher_task: Option<JoinHandle<()>>,
}

impl ControlLoop {
    pub fn new(
        config: ControlConfig,
        feed: Arc<StateFeed>,
        emergency: EmergencyStop,
        transport: Arc<dyn Transport>,
        codec: Arc<dyn IntegrityCodec>,
        limits: SafetyLimits,
        gains: GainTable,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let (requests_tx, requests_rx) = mpsc::channel(REQUEST_QUEUE_DEPTH);
        let (status_tx, status_rx) = watch::channel(LoopStatus {
            state: LoopState::NotStarted,
            last_frame_seq: None,
            commanded: vec![0.0; JOINT_COUNT],
            active_trajectories: 0,
        });
        // Without a gate, low-level commands are always allowed.
        let (_, low_level) = watch::channel(true);
        Self {
            config,
            feed,
            emergency,
            transport,
            codec,
            limits,
            gains,
            state: LoopState::NotStarted,
            shutdown_tx,
            requests_tx,
            requests_rx: Some(requests_rx),
            status_tx: Arc::new(status_tx),
            status_rx,
            counters: Arc::new(LoopCounters::default()),
            low_level,
            stopping: Arc::new(AtomicBool::new(false)),
            tick_task: None,
            publisher_task: None,
        }
    }

    /// Trajectories are sampled only while `gate` reads `true`; otherwise they
    /// are discarded and every joint holds.
    pub fn with_low_level_gate(mut self, gate: watch::Receiver<bool>) -> Self {
        self.low_level = gate;
        self
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub(crate) fn request_sender(&self) -> mpsc::Sender<ControlRequest> {
        self.requests_tx.clone()
    }

    pub fn status(&self) -> watch::Receiver<LoopStatus> {
        self.status_rx.clone()
    }

    pub(crate) fn counters(&self) -> Arc<LoopCounters> {
        self.counters.clone()
    }

    /// Wait for the first feedback, seed the hold positions from it and
    /// spawn the tick and publisher tasks.
    pub async fn start(&mut self) -> Result<(), ControlError> {
        if self.state != LoopState::NotStarted {
            return Err(ControlError::AlreadyStarted);
        }
        let timeout = self.config.startup_timeout();
        tracing::info!("Waiting up to {:?} for joint feedback", timeout);
        let snapshot = self.feed.await_first(timeout).await.map_err(|e| {
            tracing::error!("Control loop cannot start: {}", e);
            e
        })?;
        let requests_rx = self.requests_rx.take().ok_or(ControlError::AlreadyStarted)?;

        let mut hold = [0.0; JOINT_COUNT];
        for (slot, joint) in hold.iter_mut().zip(&snapshot.joints) {
            *slot = joint.position;
        }

        let (frames_tx, frames_rx) = mpsc::channel(self.config.publish_queue_depth);
        let publisher = Publisher {
            transport: self.transport.clone(),
            emergency: self.emergency.clone(),
            counters: self.counters.clone(),
            retries: self.config.publish_retries,
            backoff: self.config.publish_retry_backoff(),
        };
        self.publisher_task = Some(self.supervise("publisher", tokio::spawn(publisher.run(frames_rx))));

        let ticker = Ticker {
            planner: TrajectoryPlanner::new(self.limits.clone()),
            builder: CommandBuilder::new(self.codec.clone()),
            gains: self.gains.clone(),
            hold,
            feed: self.feed.clone(),
            emergency: self.emergency.clone(),
            counters: self.counters.clone(),
            status_tx: self.status_tx.clone(),
            frames_tx,
            period: self.config.tick_period(),
            feedback_timeout: self.config.feedback_timeout(),
            low_level: self.low_level.clone(),
            holding: false,
        };
        let shutdown_rx = self.shutdown_tx.subscribe();
        self.tick_task = Some(self.supervise("tick", tokio::spawn(ticker.run(shutdown_rx, requests_rx))));

        self.state = LoopState::Running;
        self.status_tx.send_modify(|status| status.state = LoopState::Running);
        tracing::info!(
            "Control loop running at {:?} per tick (feedback seq {})",
            self.config.tick_period(),
            snapshot.sequence
        );
        Ok(())
    }

    /// Emit a final hold frame, drain the publisher and join both tasks.
    pub async fn stop(&mut self) -> Result<(), ControlError> {
        if self.state != LoopState::Running {
            return Err(ControlError::NotRunning);
        }
        tracing::info!("Stopping control loop");
        self.stopping.store(true, Ordering::Release);
        let _ = self.shutdown_tx.send(());
        if let Some(task) = self.tick_task.take() {
            if let Err(e) = task.await {
                tracing::error!("Tick task ended abnormally: {}", e);
            }
        }
        if let Some(task) = self.publisher_task.take() {
            if let Err(e) = task.await {
                tracing::error!("Publisher task ended abnormally: {}", e);
            }
        }
        self.state = LoopState::Stopped;
        self.status_tx.send_modify(|status| status.state = LoopState::Stopped);
        let stats = self.counters.snapshot();
        tracing::info!(
            "Control loop stopped: {} ticks, {} published, {} overruns, {} dropped",
            stats.ticks,
            stats.published,
            stats.overruns,
            stats.dropped_frames
        );
        Ok(())
    }

    /// Trigger the emergency stop if `task` ends, or panics, before `stop`.
    fn supervise(&self, name: &'static str, task: JoinHandle<()>) -> JoinHandle<()> {
        let stopping = self.stopping.clone();
        let emergency = self.emergency.clone();
        tokio::spawn(async move {
            if let Err(e) = task.await {
                tracing::error!("{} task ended abnormally: {}", name, e);
            }
            if !stopping.load(Ordering::Acquire) {
                emergency.trigger(format!("{} task ended while running", name));
            }
        })
    }
}

/// State owned by the tick task.
struct Ticker {
    planner: TrajectoryPlanner,
    builder: CommandBuilder,
    gains: GainTable,
    /// Last commanded position of every joint.
    hold: [f64; JOINT_COUNT],
    feed: Arc<StateFeed>,
    emergency: EmergencyStop,
    counters: Arc<LoopCounters>,
    status_tx: Arc<watch::Sender<LoopStatus>>,
    frames_tx: mpsc::Sender<CommandFrame>,
    period: Duration,
    feedback_timeout: Option<Duration>,
    low_level: watch::Receiver<bool>,
    holding: bool,
}

impl Ticker {
    async fn run(
        mut self,
        mut shutdown_rx: broadcast::Receiver<()>,
        mut requests_rx: mpsc::Receiver<ControlRequest>,
    ) {
        let mut interval = tokio::time::interval(self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => {
                    tracing::info!("Tick task shutting down");
                    break;
                }
                deadline = interval.tick() => self.tick(deadline),
                Some(request) = requests_rx.recv() => self.serve(request),
            }
        }
        self.finish().await;
    }

    fn serve(&mut self, request: ControlRequest) {
        match request {
            ControlRequest::BeginTrajectory { targets, duration, respond_to } => {
                let result = if self.emergency.is_active() {
                    Err(ControlError::EmergencyActive)
                } else {
                    let snapshot = self.feed.snapshot();
                    self.planner
                        .begin(&targets, duration, Instant::now(), &snapshot)
                        .map_err(ControlError::from)
                };
                if respond_to.send(result).is_err() {
                    tracing::debug!("Trajectory requester went away before the reply");
                }
            }
        }
    }

    fn tick(&mut self, deadline: Instant) {
        let started = Instant::now();
        self.counters.ticks.fetch_add(1, Ordering::Relaxed);
        let lateness = started.saturating_duration_since(deadline);
        if lateness > self.period {
            self.record_overrun("scheduled", lateness);
        }

        self.check_feedback(started);
        let frame = if self.emergency.is_active() {
            // A trajectory may have been accepted during a reset that no tick saw.
            let dropped = self.planner.clear();
            if !self.holding || dropped > 0 {
                tracing::warn!(
                    "Emergency stop active ({}), holding position, {} trajectories discarded",
                    self.emergency.cause().unwrap_or_default(),
                    dropped
                );
                self.holding = true;
            }
            self.builder.build_hold(&self.hold, &self.gains)
        } else {
            if self.holding {
                tracing::info!("Emergency stop cleared, resuming trajectory control");
                self.holding = false;
            }
            let samples = if *self.low_level.borrow() {
                self.planner.advance(started)
            } else {
                let dropped = self.planner.clear();
                if dropped > 0 {
                    tracing::info!("Low-level control released, {} trajectories discarded", dropped);
                }
                BTreeMap::new()
            };
            self.builder.build(&self.hold, &samples, &self.gains)
        };
        self.record(&frame);

        match self.frames_tx.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(frame)) => {
                self.counters.dropped_frames.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("Publisher backlog full, dropped frame {}", frame.sequence);
            }
            Err(TrySendError::Closed(_)) => {
                self.emergency.trigger("publisher stopped");
            }
        }

        let busy = started.elapsed();
        if busy > self.period {
            self.record_overrun("work", busy);
        }
    }

    fn check_feedback(&self, now: Instant) {
        let Some(limit) = self.feedback_timeout else {
            return;
        };
        if self.emergency.is_active() {
            return;
        }
        if let Some(age) = self.feed.snapshot().age(now) {
            if age > limit {
                self.emergency
                    .trigger(format!("feedback timeout ({} ms without feedback)", age.as_millis()));
            }
        }
    }

    fn record(&mut self, frame: &CommandFrame) {
        for (slot, command) in self.hold.iter_mut().zip(&frame.commands) {
            *slot = command.position;
        }
        let active = self.planner.active_count();
        let hold = &self.hold;
        self.status_tx.send_modify(|status| {
            status.last_frame_seq = Some(frame.sequence);
            status.commanded.copy_from_slice(hold);
            status.active_trajectories = active;
        });
    }

    fn record_overrun(&self, kind: &str, took: Duration) {
        let total = self.counters.overruns.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::warn!(
            "Tick overrun ({}): {:?} against a {:?} period ({} total)",
            kind,
            took,
            self.period,
            total
        );
    }

    /// Final hold frame on shutdown. Waits for queue space so the frame is
    /// never dropped.
    async fn finish(mut self) {
        self.planner.clear();
        let frame = self.builder.build(&self.hold, &BTreeMap::new(), &self.gains);
        self.record(&frame);
        let sequence = frame.sequence;
        if self.frames_tx.send(frame).await.is_err() {
            tracing::error!("Publisher gone, final hold frame {} not sent", sequence);
        } else {
            tracing::info!("Final hold frame {} queued", sequence);
        }
    }
}

/// Publishes queued frames, retrying outside the tick.
struct Publisher {
    transport: Arc<dyn Transport>,
    emergency: EmergencyStop,
    counters: Arc<LoopCounters>,
    retries: u32,
    backoff: Duration,
}

impl Publisher {
    async fn run(self, mut frames_rx: mpsc::Receiver<CommandFrame>) {
        while let Some(frame) = frames_rx.recv().await {
            self.publish(&frame).await;
        }
        tracing::debug!("Publisher drained");
    }

    async fn publish(&self, frame: &CommandFrame) {
        let mut attempt = 0;
        loop {
            match self.transport.publish(frame).await {
                Ok(()) => {
                    self.counters.published.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Err(e) if attempt < self.retries => {
                    attempt += 1;
                    self.counters.publish_retries.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(
                        "Publishing frame {} failed (attempt {}): {}",
                        frame.sequence,
                        attempt,
                        e
                    );
                    tokio::time::sleep(self.backoff).await;
                }
                Err(e) => {
                    self.counters.publish_failures.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(
                        "Publishing frame {} failed after {} retries: {}",
                        frame.sequence,
                        self.retries,
                        e
                    );
                    self.emergency.trigger("publish failure");
                    return;
                }
            }
        }
    }
}
