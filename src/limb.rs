// src/limb.rs - Context object wiring the control core together
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};

use crate::actions::{ActionCatalog, ActionError, ActionId};
use crate::command::{Crc32Codec, GainTable, IntegrityCodec};
use crate::config::{Config, ConfigError};
use crate::control_loop::{ControlLoop, ControlRequest, LoopCounters, LoopState, LoopStats, LoopStatus};
use crate::emergency::EmergencyStop;
use crate::joints::JointId;
use crate::mode::{ControlMode, ModeArbitrator, ModeError, ModeSwitcher};
use crate::motion::trajectory::duration_from_secs;
use crate::motion::{MotionError, Trajectory};
use crate::safety::SafetyLimits;
use crate::state_feed::{FeedError, FeedStats, RawFeedback, StateFeed};
use crate::transport::{FeedbackCallback, Transport, TransportError};

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("Feedback error: {0}")]
    Feed(#[from] FeedError),
    #[error("Mode error: {0}")]
    Mode(#[from] ModeError),
    #[error("Trajectory error: {0}")]
    Motion(#[from] MotionError),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
    #[error("Emergency stop is active")]
    EmergencyActive,
    #[error("Control loop is not running")]
    NotRunning,
    #[error("Control loop was already started")]
    AlreadyStarted,
}

/// Everything a supervisor needs to know about the core at a glance.
#[derive(Debug, Clone, Serialize)]
pub struct ControlStatus {
    pub mode: ControlMode,
    pub emergency_active: bool,
    pub emergency_cause: Option<String>,
    pub emergency_triggers: u64,
    pub loop_state: LoopState,
    pub last_frame_seq: Option<u64>,
    pub commanded: Vec<f64>,
    pub active_trajectories: usize,
    pub feed: FeedStats,
    pub stats: LoopStats,
}

/// The limb system: owns the feed, the emergency latch, the mode arbitrator
/// and the control loop, and hands out [`ControlHandle`]s.
pub struct Limb {
    config: Config,
    feed: Arc<StateFeed>,
    emergency: EmergencyStop,
    modes: Arc<ModeArbitrator>,
    transport: Arc<dyn Transport>,
    control_loop: ControlLoop,
}

impl Limb {
    pub fn new(
        config: Config,
        transport: Arc<dyn Transport>,
        catalog: Arc<dyn ActionCatalog>,
        switcher: Arc<dyn ModeSwitcher>,
    ) -> Result<Self, ControlError> {
        Self::with_codec(config, transport, catalog, switcher, Arc::new(Crc32Codec))
    }

    pub fn with_codec(
        config: Config,
        transport: Arc<dyn Transport>,
        catalog: Arc<dyn ActionCatalog>,
        switcher: Arc<dyn ModeSwitcher>,
        codec: Arc<dyn IntegrityCodec>,
    ) -> Result<Self, ControlError> {
        config.validate()?;
        let limits = SafetyLimits::from_config(&config)?;
        let gains = GainTable::from_config(&config)?;
        let feed = Arc::new(StateFeed::new());
        let emergency = EmergencyStop::new();
        let modes = Arc::new(ModeArbitrator::new(
            config.mode.initial,
            config.mode.switch_timeout(),
            switcher,
            catalog,
            emergency.clone(),
        ));
        let control_loop = ControlLoop::new(
            config.control.clone(),
            feed.clone(),
            emergency.clone(),
            transport.clone(),
            codec,
            limits,
            gains,
        )
        .with_low_level_gate(modes.low_level_gate());
        Ok(Self {
            config,
            feed,
            emergency,
            modes,
            transport,
            control_loop,
        })
    }

    /// Subscribe to feedback and start the control loop once the first
    /// valid feedback has arrived.
    pub async fn start(&mut self) -> Result<(), ControlError> {
        if self.control_loop.state() != LoopState::NotStarted {
            return Err(ControlError::AlreadyStarted);
        }
        tracing::info!("Starting limb control core in {} mode", self.modes.mode());
        let feed = self.feed.clone();
        let callback: FeedbackCallback = Arc::new(move |raw: RawFeedback| {
            // Rejections are counted and logged by the feed.
            let _ = feed.ingest(raw);
        });
        self.transport.subscribe(callback).await?;
        self.control_loop.start().await?;
        tracing::info!("Limb control core ready");
        Ok(())
    }

    /// Stop the loop (sending its final hold frame) and close the transport.
    pub async fn shutdown(&mut self) -> Result<(), ControlError> {
        tracing::info!("Shutting down limb control core");
        let result = match self.control_loop.state() {
            LoopState::Running => self.control_loop.stop().await,
            _ => Ok(()),
        };
        self.transport.close().await;
        result
    }

    pub fn handle(&self) -> ControlHandle {
        ControlHandle {
            modes: self.modes.clone(),
            emergency: self.emergency.clone(),
            feed: self.feed.clone(),
            requests: self.control_loop.request_sender(),
            status: self.control_loop.status(),
            counters: self.control_loop.counters(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn loop_state(&self) -> LoopState {
        self.control_loop.state()
    }
}

/// Cloneable control surface for the layer above the core.
#[derive(Clone)]
pub struct ControlHandle {
    modes: Arc<ModeArbitrator>,
    emergency: EmergencyStop,
    feed: Arc<StateFeed>,
    requests: mpsc::Sender<ControlRequest>,
    status: watch::Receiver<LoopStatus>,
    counters: Arc<LoopCounters>,
}

impl ControlHandle {
    pub async fn request_mode(&self, target: ControlMode) -> Result<(), ControlError> {
        self.modes.request(target).await?;
        Ok(())
    }

    pub fn mode(&self) -> ControlMode {
        self.modes.mode()
    }

    /// Move the named joints to `targets` over `duration_s` seconds. Only
    /// valid in low-level mode. Returns the trajectory as stored, with
    /// targets clamped to the joint limits.
    pub async fn begin_trajectory(
        &self,
        targets: &[(JointId, f64)],
        duration_s: f64,
    ) -> Result<Trajectory, ControlError> {
        let duration = duration_from_secs(duration_s)?;
        if self.emergency.is_active() {
            return Err(ControlError::EmergencyActive);
        }
        if self.status.borrow().state != LoopState::Running {
            return Err(ControlError::NotRunning);
        }
        let issue = async {
            let (respond_to, reply) = oneshot::channel();
            let request = ControlRequest::BeginTrajectory {
                targets: targets.to_vec(),
                duration,
                respond_to,
            };
            if self.requests.send(request).await.is_err() {
                return Err(ControlError::NotRunning);
            }
            match reply.await {
                Ok(result) => result,
                Err(_) => Err(ControlError::NotRunning),
            }
        };
        self.modes.issue_low_level(issue).await?
    }

    /// Run a catalog action. Only valid in high-level mode.
    pub async fn execute_action(&self, id: ActionId) -> Result<(), ControlError> {
        if self.emergency.is_active() {
            return Err(ControlError::EmergencyActive);
        }
        self.modes.issue_high_level(id).await?;
        Ok(())
    }

    /// Look up a catalog action by name and run it.
    pub async fn execute_named_action(&self, name: &str) -> Result<(), ControlError> {
        let id = self
            .modes
            .catalog()
            .lookup(name)
            .ok_or_else(|| ModeError::ActionFailed(ActionError::UnknownName(name.to_string())))?;
        self.execute_action(id).await
    }

    pub fn trigger_emergency(&self, cause: impl Into<String>) {
        self.emergency.trigger(cause);
    }

    /// Clear the emergency latch. Returns `false` if it was not active.
    pub fn reset_emergency(&self) -> bool {
        self.emergency.reset()
    }

    pub fn is_emergency_active(&self) -> bool {
        self.emergency.is_active()
    }

    pub fn status(&self) -> ControlStatus {
        let status = self.status.borrow().clone();
        ControlStatus {
            mode: self.modes.mode(),
            emergency_active: self.emergency.is_active(),
            emergency_cause: self.emergency.cause(),
            emergency_triggers: self.emergency.trigger_count(),
            loop_state: status.state,
            last_frame_seq: status.last_frame_seq,
            commanded: status.commanded,
            active_trajectories: status.active_trajectories,
            feed: self.feed.stats(),
            stats: self.counters.snapshot(),
        }
    }
}
