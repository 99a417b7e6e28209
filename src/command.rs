// src/command.rs - Per-tick command frames
use crc_any::CRCu32;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

use crate::config::{Config, ConfigError};
use crate::joints::{JointId, JointRole, JOINT_COUNT};

/// Bytes before the per-joint block: sequence (u64) and joint count (u16).
const HEADER_LEN: usize = 8 + 2;
/// Five f64 fields per joint.
const JOINT_LEN: usize = 5 * 8;
const CHECKSUM_LEN: usize = 4;

/// Serialized size of a full frame.
pub const FRAME_LEN: usize = HEADER_LEN + JOINT_COUNT * JOINT_LEN + CHECKSUM_LEN;

/// Integrity code over serialized frame bytes. Must be pure.
pub trait IntegrityCodec: Send + Sync {
    fn checksum(&self, bytes: &[u8]) -> u32;
}

/// CRC-32/MPEG-2 (poly 0x04C11DB7, init 0xFFFFFFFF, no reflection, no final xor).
#[derive(Debug, Clone, Copy, Default)]
pub struct Crc32Codec;

impl IntegrityCodec for Crc32Codec {
    fn checksum(&self, bytes: &[u8]) -> u32 {
        let mut crc = CRCu32::crc32mpeg2();
        crc.digest(bytes);
        crc.get_crc()
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum FrameError {
    #[error("Frame is {got} bytes, expected {expected}")]
    Length { got: usize, expected: usize },
    #[error("Frame carries {got} joints, expected {expected}")]
    JointCount { got: usize, expected: usize },
    #[error("Checksum mismatch: frame says {stored:#010x}, computed {computed:#010x}")]
    Checksum { stored: u32, computed: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Gains {
    pub kp: f64,
    pub kd: f64,
}

impl Gains {
    pub const fn new(kp: f64, kd: f64) -> Self {
        Self { kp, kd }
    }

    /// Role default. Waist joints are unclassified but stiffer than the arms.
    pub fn default_for(joint: JointId) -> Self {
        match joint.role() {
            JointRole::HipPitch | JointRole::HipRoll | JointRole::HipYaw => Self::new(60.0, 1.0),
            JointRole::Knee => Self::new(100.0, 2.0),
            JointRole::AnklePitch | JointRole::AnkleRoll => Self::new(40.0, 1.0),
            JointRole::Other if joint.name().starts_with("waist") => Self::new(60.0, 1.0),
            _ => Self::new(40.0, 1.0),
        }
    }
}

/// Position and damping gains for every joint.
#[derive(Debug, Clone)]
pub struct GainTable {
    table: [Gains; JOINT_COUNT],
}

impl Default for GainTable {
    fn default() -> Self {
        let mut table = [Gains::new(0.0, 0.0); JOINT_COUNT];
        for joint in JointId::all() {
            table[joint.index()] = Gains::default_for(joint);
        }
        Self { table }
    }
}

impl GainTable {
    /// Role defaults with `[gains]` overrides applied field by field.
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let mut gains = Self::default();
        for (name, entry) in &config.gains {
            let joint = JointId::from_name(name)
                .ok_or_else(|| ConfigError::Invalid(format!("gains: unknown joint '{}'", name)))?;
            let current = gains.get(joint);
            gains.set(
                joint,
                Gains::new(entry.kp.unwrap_or(current.kp), entry.kd.unwrap_or(current.kd)),
            );
        }
        Ok(gains)
    }

    pub fn get(&self, joint: JointId) -> Gains {
        self.table[joint.index()]
    }

    pub fn set(&mut self, joint: JointId, gains: Gains) {
        self.table[joint.index()] = gains;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct JointCommand {
    pub position: f64,
    pub velocity: f64,
    pub torque: f64,
    pub kp: f64,
    pub kd: f64,
}

/// One tick's worth of commands, one entry per joint in hardware order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandFrame {
    pub sequence: u64,
    pub commands: Vec<JointCommand>,
    pub checksum: u32,
}

impl CommandFrame {
    /// Every byte covered by the checksum.
    pub fn payload_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(FRAME_LEN);
        bytes.extend_from_slice(&self.sequence.to_le_bytes());
        bytes.extend_from_slice(&(self.commands.len() as u16).to_le_bytes());
        for command in &self.commands {
            for value in [command.position, command.velocity, command.torque, command.kp, command.kd] {
                bytes.extend_from_slice(&value.to_le_bytes());
            }
        }
        bytes
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = self.payload_bytes();
        bytes.extend_from_slice(&self.checksum.to_le_bytes());
        bytes
    }

    pub fn verify(&self, codec: &dyn IntegrityCodec) -> bool {
        codec.checksum(&self.payload_bytes()) == self.checksum
    }

    /// Parse wire bytes, rejecting anything whose checksum does not match.
    pub fn decode(bytes: &[u8], codec: &dyn IntegrityCodec) -> Result<Self, FrameError> {
        if bytes.len() != FRAME_LEN {
            return Err(FrameError::Length { got: bytes.len(), expected: FRAME_LEN });
        }
        let (payload, tail) = bytes.split_at(FRAME_LEN - CHECKSUM_LEN);
        let stored = u32::from_le_bytes([tail[0], tail[1], tail[2], tail[3]]);
        let computed = codec.checksum(payload);
        if stored != computed {
            return Err(FrameError::Checksum { stored, computed });
        }

        let mut sequence = [0u8; 8];
        sequence.copy_from_slice(&payload[..8]);
        let count = u16::from_le_bytes([payload[8], payload[9]]) as usize;
        if count != JOINT_COUNT {
            return Err(FrameError::JointCount { got: count, expected: JOINT_COUNT });
        }
        let commands = payload[HEADER_LEN..]
            .chunks_exact(JOINT_LEN)
            .map(|chunk| {
                let mut fields = chunk.chunks_exact(8).map(|raw| {
                    let mut word = [0u8; 8];
                    word.copy_from_slice(raw);
                    f64::from_le_bytes(word)
                });
                let mut next = || fields.next().unwrap_or_default();
                JointCommand {
                    position: next(),
                    velocity: next(),
                    torque: next(),
                    kp: next(),
                    kd: next(),
                }
            })
            .collect();
        Ok(Self {
            sequence: u64::from_le_bytes(sequence),
            commands,
            checksum: stored,
        })
    }

    pub fn positions(&self) -> Vec<f64> {
        self.commands.iter().map(|command| command.position).collect()
    }

    /// True when every joint is commanded to rest.
    pub fn is_hold(&self) -> bool {
        self.commands
            .iter()
            .all(|command| command.velocity == 0.0 && command.torque == 0.0)
    }
}

/// Assembles frames and owns the sequence counter. Never publishes.
pub struct CommandBuilder {
    codec: Arc<dyn IntegrityCodec>,
    next_sequence: u64,
}

impl CommandBuilder {
    pub fn new(codec: Arc<dyn IntegrityCodec>) -> Self {
        Self { codec, next_sequence: 1 }
    }

    /// Sequence number the next frame will carry.
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    /// Build a full frame. Joints with an entry in `active` take that
    /// position; every other joint holds its entry in `hold`.
    pub fn build(
        &mut self,
        hold: &[f64; JOINT_COUNT],
        active: &BTreeMap<JointId, f64>,
        gains: &GainTable,
    ) -> CommandFrame {
        let commands = JointId::all()
            .map(|joint| {
                let gains = gains.get(joint);
                JointCommand {
                    position: active.get(&joint).copied().unwrap_or(hold[joint.index()]),
                    velocity: 0.0,
                    torque: 0.0,
                    kp: gains.kp,
                    kd: gains.kd,
                }
            })
            .collect();
        let mut frame = CommandFrame {
            sequence: self.next_sequence,
            commands,
            checksum: 0,
        };
        self.next_sequence += 1;
        frame.checksum = self.codec.checksum(&frame.payload_bytes());
        frame
    }

    /// Frame that holds every joint where it is.
    pub fn build_hold(&mut self, hold: &[f64; JOINT_COUNT], gains: &GainTable) -> CommandFrame {
        self.build(hold, &BTreeMap::new(), gains)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GainOverride;

    fn builder() -> CommandBuilder {
        CommandBuilder::new(Arc::new(Crc32Codec))
    }

    #[test]
    fn test_crc32_mpeg2_check_value() {
        assert_eq!(Crc32Codec.checksum(b"123456789"), 0x0376_E6E7);
    }

    #[test]
    fn test_frame_is_fully_populated() {
        let mut builder = builder();
        let hold = [0.1; JOINT_COUNT];
        let knee = JointId::from_name("left_knee").unwrap();
        let mut active = BTreeMap::new();
        active.insert(knee, 0.8);
        let frame = builder.build(&hold, &active, &GainTable::default());

        assert_eq!(frame.commands.len(), JOINT_COUNT);
        assert_eq!(frame.commands[knee.index()].position, 0.8);
        assert_eq!(frame.commands[knee.index()].kp, 100.0);
        assert_eq!(frame.commands[knee.index()].kd, 2.0);
        assert_eq!(frame.commands[0].position, 0.1);
        assert!(frame.is_hold());
        assert!(frame.verify(&Crc32Codec));
    }

    #[test]
    fn test_sequence_is_monotonic() {
        let mut builder = builder();
        let hold = [0.0; JOINT_COUNT];
        let gains = GainTable::default();
        let first = builder.build_hold(&hold, &gains);
        let second = builder.build_hold(&hold, &gains);
        assert_eq!(first.sequence, 1);
        assert_eq!(second.sequence, 2);
        assert_eq!(builder.next_sequence(), 3);
    }

    #[test]
    fn test_wire_layout_and_tamper_detection() {
        let mut builder = builder();
        let frame = builder.build_hold(&[0.25; JOINT_COUNT], &GainTable::default());
        let mut bytes = frame.to_bytes();
        assert_eq!(bytes.len(), FRAME_LEN);
        assert_eq!(&bytes[..8], &1u64.to_le_bytes());
        assert_eq!(&bytes[8..10], &(JOINT_COUNT as u16).to_le_bytes());

        let decoded = CommandFrame::decode(&bytes, &Crc32Codec).unwrap();
        assert_eq!(decoded, frame);

        bytes[HEADER_LEN] ^= 0x01;
        assert!(matches!(
            CommandFrame::decode(&bytes, &Crc32Codec),
            Err(FrameError::Checksum { .. })
        ));
        assert!(matches!(
            CommandFrame::decode(&bytes[1..], &Crc32Codec),
            Err(FrameError::Length { .. })
        ));
    }

    #[test]
    fn test_gain_defaults_and_overrides() {
        let gains = GainTable::default();
        let hip = JointId::from_name("right_hip_roll").unwrap();
        let waist = JointId::from_name("waist_pitch").unwrap();
        let wrist = JointId::from_name("right_wrist_yaw").unwrap();
        assert_eq!(gains.get(hip), Gains::new(60.0, 1.0));
        assert_eq!(gains.get(waist), Gains::new(60.0, 1.0));
        assert_eq!(gains.get(wrist), Gains::new(40.0, 1.0));

        let mut config = Config::default();
        config
            .gains
            .insert("right_wrist_yaw".to_string(), GainOverride { kp: Some(20.0), kd: None });
        let gains = GainTable::from_config(&config).unwrap();
        assert_eq!(gains.get(wrist), Gains::new(20.0, 1.0));
    }
}
