// SPDX-License-Identifier: Apache-2.0 OR MIT

//! CHP heartbeat messages, flags and roles.
//!
//! Frame 0 packs protocol tag, sender, send time, state byte, flags byte
//! and the announced interval in milliseconds; an optional second frame
//! carries a UTF-8 status text.

use chrono::{DateTime, Utc};

use crate::error::DecodeError;
use crate::fsm::SatelliteState;

use super::value::{Reader, Value};
use super::Protocol;

/// Message flags of CHP messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChpFlags(u8);

impl ChpFlags {
    pub const NONE: ChpFlags = ChpFlags(0x00);
    /// Out-of-schedule heartbeat emitted right after a state change.
    pub const IS_EXTRASYSTOLE: ChpFlags = ChpFlags(0x01);
    /// The sender operates autonomously and ignores remote fault policy.
    pub const IS_AUTONOMOUS: ChpFlags = ChpFlags(0x02);
    /// Faults of this sender should interrupt the receiving satellite.
    pub const TRIGGER_INTERRUPT: ChpFlags = ChpFlags(0x04);
    /// Departure of this sender should be treated as a fault.
    pub const DENY_DEPARTURE: ChpFlags = ChpFlags(0x08);

    pub fn from_bits(bits: u8) -> ChpFlags {
        ChpFlags(bits)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, other: ChpFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for ChpFlags {
    type Output = ChpFlags;

    fn bitor(self, rhs: ChpFlags) -> ChpFlags {
        ChpFlags(self.0 | rhs.0)
    }
}

/// Fault policy role of a satellite, encoded in its heartbeat flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChpRole {
    /// Faults and departures are ignored.
    None,
    /// Autonomous operation; failures do not propagate to peers.
    Transient,
    /// Faults interrupt peers; departures are orderly.
    #[default]
    Dynamic,
    /// Faults and departures both interrupt peers.
    Essential,
}

impl ChpRole {
    /// The flags a sender with this role carries in its heartbeats.
    pub fn flags(self) -> ChpFlags {
        match self {
            ChpRole::None => ChpFlags::NONE,
            ChpRole::Transient => ChpFlags::IS_AUTONOMOUS,
            ChpRole::Dynamic => ChpFlags::TRIGGER_INTERRUPT,
            ChpRole::Essential => ChpFlags::TRIGGER_INTERRUPT | ChpFlags::DENY_DEPARTURE,
        }
    }

    /// Reconstruct the role from received message flags.
    pub fn from_flags(flags: ChpFlags) -> ChpRole {
        if flags.contains(ChpFlags::DENY_DEPARTURE) {
            ChpRole::Essential
        } else if flags.contains(ChpFlags::TRIGGER_INTERRUPT) {
            ChpRole::Dynamic
        } else if flags.contains(ChpFlags::IS_AUTONOMOUS) {
            ChpRole::Transient
        } else {
            ChpRole::None
        }
    }

    /// Whether the role asks receivers to act on the given policy flag.
    pub fn requires(self, flag: ChpFlags) -> bool {
        self.flags().contains(flag)
    }

    /// Parse a role from its configuration name.
    pub fn from_name(name: &str) -> Option<ChpRole> {
        match name.to_ascii_lowercase().as_str() {
            "none" => Some(ChpRole::None),
            "transient" => Some(ChpRole::Transient),
            "dynamic" => Some(ChpRole::Dynamic),
            "essential" => Some(ChpRole::Essential),
            _ => None,
        }
    }
}

/// A decoded heartbeat.
#[derive(Debug, Clone)]
pub struct ChpMessage {
    pub sender: String,
    pub time: DateTime<Utc>,
    pub state: SatelliteState,
    pub flags: ChpFlags,
    pub interval_ms: u64,
    pub status: Option<String>,
}

impl ChpMessage {
    /// Assemble into wire frames.
    pub fn assemble(&self) -> Vec<Vec<u8>> {
        let mut frame = Vec::new();
        Value::Str(Protocol::Chp.tag().to_owned()).pack(&mut frame);
        Value::Str(self.sender.clone()).pack(&mut frame);
        Value::Time(self.time).pack(&mut frame);
        Value::Int(i64::from(self.state as u8)).pack(&mut frame);
        Value::Int(i64::from(self.flags.bits())).pack(&mut frame);
        Value::Int(self.interval_ms as i64).pack(&mut frame);

        let mut frames = vec![frame];
        if let Some(status) = &self.status {
            frames.push(status.as_bytes().to_vec());
        }
        frames
    }

    /// Disassemble from wire frames.
    pub fn disassemble(frames: &[Vec<u8>]) -> Result<ChpMessage, DecodeError> {
        if frames.is_empty() || frames.len() > 2 {
            return Err(DecodeError::malformed(format!(
                "expected 1 or 2 frames, got {}",
                frames.len()
            )));
        }
        let mut reader = Reader::new(&frames[0]);
        Protocol::expect(&mut reader, Protocol::Chp)?;
        let sender = reader.read_str()?;
        let time = reader.read_time()?;
        let state = SatelliteState::from_int(reader.read_int()?)?;
        let flags = ChpFlags::from_bits(
            u8::try_from(reader.read_int()?)
                .map_err(|_| DecodeError::malformed("flags out of range"))?,
        );
        let interval_ms = u64::try_from(reader.read_int()?)
            .map_err(|_| DecodeError::malformed("interval out of range"))?;

        let status = match frames.get(1) {
            Some(frame) => Some(
                String::from_utf8(frame.clone())
                    .map_err(|_| DecodeError::malformed("status text is not UTF-8"))?,
            ),
            None => None,
        };

        Ok(ChpMessage {
            sender,
            time,
            state,
            flags,
            interval_ms,
            status,
        })
    }
}
