// src/mode.rs - High-level / low-level mode arbitration
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{RwLock, watch};

use crate::actions::{ActionCatalog, ActionError, ActionId};
use crate::emergency::EmergencyStop;

/// Which control path currently owns the joints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlMode {
    /// Named pre-built behaviors from the action catalog.
    HighLevel,
    /// Direct per-joint targets.
    LowLevel,
}

impl ControlMode {
    fn as_u8(self) -> u8 {
        match self {
            ControlMode::HighLevel => 0,
            ControlMode::LowLevel => 1,
        }
    }

    fn from_u8(raw: u8) -> Self {
        if raw == 1 { ControlMode::LowLevel } else { ControlMode::HighLevel }
    }
}

impl fmt::Display for ControlMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlMode::HighLevel => write!(f, "high-level"),
            ControlMode::LowLevel => write!(f, "low-level"),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
#[error("{0}")]
pub struct HandshakeError(pub String);

/// Collaborator that hands exclusive ownership of the joints between the
/// two control paths.
#[async_trait]
pub trait ModeSwitcher: Send + Sync {
    /// Give up ownership held by `mode`.
    async fn release(&self, mode: ControlMode) -> Result<(), HandshakeError>;
    /// Confirm that `mode` now owns the joints.
    async fn confirm(&self, mode: ControlMode) -> Result<(), HandshakeError>;
}

/// Switcher for a single-process setup where both paths live here.
#[derive(Debug, Default)]
pub struct LocalModeSwitcher;

#[async_trait]
impl ModeSwitcher for LocalModeSwitcher {
    async fn release(&self, mode: ControlMode) -> Result<(), HandshakeError> {
        tracing::debug!("Released {} ownership", mode);
        Ok(())
    }

    async fn confirm(&self, mode: ControlMode) -> Result<(), HandshakeError> {
        tracing::debug!("Confirmed {} ownership", mode);
        Ok(())
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ModeError {
    #[error("Operation requires {required} mode, active mode is {active}")]
    WrongMode { required: ControlMode, active: ControlMode },
    #[error("A mode switch is in progress")]
    SwitchInProgress,
    #[error("Cannot switch to {target}: {reason}")]
    InvalidModeTransition { target: ControlMode, reason: String },
    #[error("Switch to {target} failed during {phase}: {reason}")]
    ModeSwitchFailed {
        target: ControlMode,
        phase: &'static str,
        reason: String,
    },
    #[error(transparent)]
    ActionFailed(#[from] ActionError),
}

/// Serialises mode switches and gates issuance on the active mode.
///
/// A switch holds the write side of the lock for the whole handshake and
/// issuance holds the read side while its command is handed over, so the
/// two never interleave. Neither side waits: contention is reported as
/// `SwitchInProgress`.
///
/// The low-level gate drops as soon as low-level ownership is released, before
/// the target mode confirms, and rises only once low-level mode owns the joints.
pub struct ModeArbitrator {
    mode: RwLock<ControlMode>,
    observed: AtomicU8,
    low_level: watch::Sender<bool>,
    switches: AtomicU64,
    switcher: Arc<dyn ModeSwitcher>,
    catalog: Arc<dyn ActionCatalog>,
    emergency: EmergencyStop,
    switch_timeout: Duration,
}

impl ModeArbitrator {
    pub fn new(
        initial: ControlMode,
        switch_timeout: Duration,
        switcher: Arc<dyn ModeSwitcher>,
        catalog: Arc<dyn ActionCatalog>,
        emergency: EmergencyStop,
    ) -> Self {
        let (low_level, _) = watch::channel(initial == ControlMode::LowLevel);
        Self {
            mode: RwLock::new(initial),
            observed: AtomicU8::new(initial.as_u8()),
            low_level,
            switches: AtomicU64::new(0),
            switcher,
            catalog,
            emergency,
            switch_timeout,
        }
    }

    /// Active mode. Never waits, even during a switch.
    pub fn mode(&self) -> ControlMode {
        ControlMode::from_u8(self.observed.load(Ordering::Acquire))
    }

    /// Completed switches, excluding no-op requests.
    pub fn switch_count(&self) -> u64 {
        self.switches.load(Ordering::Relaxed)
    }

    pub fn catalog(&self) -> &Arc<dyn ActionCatalog> {
        &self.catalog
    }

    /// `true` while low-level commands may drive the joints.
    pub fn low_level_gate(&self) -> watch::Receiver<bool> {
        self.low_level.subscribe()
    }

    /// Switch to `target` with a release/confirm handshake.
    pub async fn request(&self, target: ControlMode) -> Result<(), ModeError> {
        let mut guard = self.mode.try_write().map_err(|_| ModeError::SwitchInProgress)?;
        let current = *guard;
        if current == target {
            tracing::debug!("Already in {} mode", target);
            return Ok(());
        }
        if self.emergency.is_active() {
            return Err(ModeError::InvalidModeTransition {
                target,
                reason: "emergency stop is active".to_string(),
            });
        }

        tracing::info!("Switching mode {} -> {}", current, target);
        self.low_level.send_replace(false);
        if let Err(reason) = self.bounded(self.switcher.release(current)).await {
            tracing::warn!("Releasing {} failed: {}", current, reason);
            self.low_level.send_replace(current == ControlMode::LowLevel);
            return Err(ModeError::ModeSwitchFailed { target, phase: "release", reason });
        }
        if let Err(reason) = self.bounded(self.switcher.confirm(target)).await {
            tracing::warn!("Confirming {} failed: {}, reacquiring {}", target, reason, current);
            match self.bounded(self.switcher.confirm(current)).await {
                Ok(()) => {
                    self.low_level.send_replace(current == ControlMode::LowLevel);
                }
                Err(e) => {
                    self.emergency
                        .trigger(format!("mode switch left no owner: {}", e));
                }
            }
            return Err(ModeError::ModeSwitchFailed { target, phase: "confirm", reason });
        }

        self.low_level.send_replace(target == ControlMode::LowLevel);
        *guard = target;
        self.observed.store(target.as_u8(), Ordering::Release);
        self.switches.fetch_add(1, Ordering::Relaxed);
        tracing::info!("Mode is now {}", target);
        Ok(())
    }

    async fn bounded<F>(&self, phase: F) -> Result<(), String>
    where
        F: Future<Output = Result<(), HandshakeError>>,
    {
        match tokio::time::timeout(self.switch_timeout, phase).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("timed out after {:?}", self.switch_timeout)),
        }
    }

    /// Run `issue` only while low-level mode is active. The mode cannot
    /// change until it completes.
    pub async fn issue_low_level<F, T>(&self, issue: F) -> Result<T, ModeError>
    where
        F: Future<Output = T>,
    {
        let guard = self.mode.try_read().map_err(|_| ModeError::SwitchInProgress)?;
        if *guard != ControlMode::LowLevel {
            return Err(ModeError::WrongMode {
                required: ControlMode::LowLevel,
                active: *guard,
            });
        }
        Ok(issue.await)
    }

    /// Forward `id` to the action catalog while high-level mode is active.
    pub async fn issue_high_level(&self, id: ActionId) -> Result<(), ModeError> {
        let guard = self.mode.try_read().map_err(|_| ModeError::SwitchInProgress)?;
        if *guard != ControlMode::HighLevel {
            return Err(ModeError::WrongMode {
                required: ControlMode::HighLevel,
                active: *guard,
            });
        }
        tracing::debug!("Forwarding {} to the action catalog", id);
        self.catalog.execute(id).await?;
        Ok(())
    }
}
