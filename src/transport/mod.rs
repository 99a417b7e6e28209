// src/transport/mod.rs - Bus abstraction between the core and the motors
pub mod loopback;

pub use loopback::LoopbackTransport;

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

use crate::command::CommandFrame;
use crate::state_feed::RawFeedback;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum TransportError {
    #[error("Publish failed: {0}")]
    Publish(String),
    #[error("Subscribe failed: {0}")]
    Subscribe(String),
    #[error("Transport is closed")]
    Closed,
}

/// Invoked for every feedback message, possibly from an I/O task.
pub type FeedbackCallback = Arc<dyn Fn(RawFeedback) + Send + Sync>;

/// Delivery of command frames and feedback. Framing, addressing and delivery
/// guarantees belong to the implementation.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn publish(&self, frame: &CommandFrame) -> Result<(), TransportError>;

    async fn subscribe(&self, callback: FeedbackCallback) -> Result<(), TransportError>;

    /// Stop delivering feedback and release resources.
    async fn close(&self) {}
}
