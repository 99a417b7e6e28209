//! Real-time joint-control core for multi-joint robotic limbs.
//!
//! A [`Limb`] owns the feedback snapshot, the emergency latch, the mode
//! arbitrator and the fixed-rate control loop. Callers drive it through a
//! cloneable [`ControlHandle`].

pub mod actions;
pub mod command;
pub mod config;
pub mod control_loop;
pub mod emergency;
pub mod joints;
pub mod limb;
pub mod mode;
pub mod motion;
pub mod safety;
pub mod state_feed;
pub mod transport;

pub use actions::{ActionCatalog, ActionId, StaticActionCatalog};
pub use command::{CommandBuilder, CommandFrame, Crc32Codec, IntegrityCodec};
pub use config::{load_config, Config};
pub use control_loop::LoopState;
pub use emergency::EmergencyStop;
pub use joints::{JointId, JOINT_COUNT};
pub use limb::{ControlError, ControlHandle, ControlStatus, Limb};
pub use mode::{ControlMode, LocalModeSwitcher, ModeSwitcher};
pub use transport::{LoopbackTransport, Transport};
