// src/actions.rs - High-level action catalog
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

/// Opaque identifier of a pre-built behavior. The core never looks inside.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ActionId(pub u32);

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "action#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ActionDescriptor {
    pub id: ActionId,
    pub name: &'static str,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ActionError {
    #[error("Unknown action {0}")]
    UnknownAction(ActionId),
    #[error("No action named '{0}'")]
    UnknownName(String),
    #[error("Action {id} failed: {reason}")]
    Failed { id: ActionId, reason: String },
}

/// Executes named behaviors on behalf of the high-level control path.
#[async_trait]
pub trait ActionCatalog: Send + Sync {
    async fn execute(&self, id: ActionId) -> Result<(), ActionError>;

    /// The static set of actions this catalog accepts.
    fn actions(&self) -> &[ActionDescriptor];

    fn lookup(&self, name: &str) -> Option<ActionId> {
        self.actions()
            .iter()
            .find(|action| action.name == name)
            .map(|action| action.id)
    }
}

const fn action(id: u32, name: &'static str) -> ActionDescriptor {
    ActionDescriptor { id: ActionId(id), name }
}

/// Arm gestures of the reference humanoid.
pub const ARM_ACTIONS: &[ActionDescriptor] = &[
    action(99, "release arm"),
    action(11, "two-hand kiss"),
    action(12, "left kiss"),
    action(13, "right kiss"),
    action(15, "hands up"),
    action(17, "clap"),
    action(18, "high five"),
    action(19, "hug"),
    action(20, "heart"),
    action(21, "right heart"),
    action(22, "reject"),
    action(23, "right hand up"),
    action(24, "x-ray"),
    action(25, "face wave"),
    action(26, "high wave"),
    action(27, "shake hand"),
];

/// In-process catalog that accepts a fixed table and only logs.
#[derive(Debug)]
pub struct StaticActionCatalog {
    actions: &'static [ActionDescriptor],
    executed: AtomicU64,
}

impl Default for StaticActionCatalog {
    fn default() -> Self {
        Self::new(ARM_ACTIONS)
    }
}

impl StaticActionCatalog {
    pub fn new(actions: &'static [ActionDescriptor]) -> Self {
        Self {
            actions,
            executed: AtomicU64::new(0),
        }
    }

    pub fn executed_count(&self) -> u64 {
        self.executed.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ActionCatalog for StaticActionCatalog {
    async fn execute(&self, id: ActionId) -> Result<(), ActionError> {
        let descriptor = self
            .actions
            .iter()
            .find(|action| action.id == id)
            .ok_or(ActionError::UnknownAction(id))?;
        self.executed.fetch_add(1, Ordering::Relaxed);
        tracing::info!("Executing high-level action '{}' ({})", descriptor.name, id);
        Ok(())
    }

    fn actions(&self) -> &[ActionDescriptor] {
        self.actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_catalog_executes_known_actions() {
        let catalog = StaticActionCatalog::default();
        let wave = catalog.lookup("high wave").unwrap();
        assert_eq!(wave, ActionId(26));
        catalog.execute(wave).await.unwrap();
        assert_eq!(catalog.executed_count(), 1);
    }

    #[tokio::test]
    async fn test_unknown_action_is_rejected() {
        let catalog = StaticActionCatalog::default();
        let result = catalog.execute(ActionId(4242)).await;
        assert_eq!(result, Err(ActionError::UnknownAction(ActionId(4242))));
        assert_eq!(catalog.executed_count(), 0);
        assert!(catalog.lookup("moonwalk").is_none());
    }

    #[test]
    fn test_action_ids_are_unique() {
        for (i, a) in ARM_ACTIONS.iter().enumerate() {
            assert!(ARM_ACTIONS[i + 1..].iter().all(|b| b.id != a.id && b.name != a.name));
        }
    }
}
