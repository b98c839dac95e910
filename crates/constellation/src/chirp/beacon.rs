// SPDX-License-Identifier: Apache-2.0 OR MIT

//! CHIRP datagram codec and beacon transmitter.
//!
//! A CHIRP datagram is exactly 42 bytes, big-endian:
//!
//! ```text
//! offset  size  field
//! 0       6     magic "CHIRP\x01"
//! 6       1     msgtype
//! 7       16    group_uuid
//! 23      16    host_uuid
//! 39      1     service_id
//! 40      2     port
//! ```

use std::net::{IpAddr, Ipv4Addr};

use crate::error::ChirpError;
use crate::identity::Uuid;
use crate::transport::MulticastSocket;

/// Well-known CHIRP multicast port.
pub const CHIRP_PORT: u16 = 7123;
/// Well-known CHIRP multicast group.
pub const CHIRP_MULTICAST_ADDRESS: Ipv4Addr = Ipv4Addr::new(239, 192, 7, 123);
/// Datagram magic.
const CHIRP_MAGIC: &[u8; 6] = b"CHIRP\x01";
/// Fixed datagram length.
const CHIRP_LENGTH: usize = 42;

/// Identifies the type of service a satellite announces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ServiceId {
    /// Initialization value only, not a valid service type.
    None = 0x0,
    /// CSCP control service.
    Control = 0x1,
    /// CHP heartbeat service.
    Heartbeat = 0x2,
    /// CMDP monitoring service.
    Monitoring = 0x3,
    /// CDTP data service.
    Data = 0x4,
}

impl ServiceId {
    fn from_u8(value: u8) -> Result<ServiceId, ChirpError> {
        match value {
            0x0 => Ok(ServiceId::None),
            0x1 => Ok(ServiceId::Control),
            0x2 => Ok(ServiceId::Heartbeat),
            0x3 => Ok(ServiceId::Monitoring),
            0x4 => Ok(ServiceId::Data),
            other => Err(ChirpError::Malformed(format!(
                "service identifier {other:#x} out of range"
            ))),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ServiceId::None => "NONE",
            ServiceId::Control => "CONTROL",
            ServiceId::Heartbeat => "HEARTBEAT",
            ServiceId::Monitoring => "MONITORING",
            ServiceId::Data => "DATA",
        }
    }
}

/// Type of a CHIRP message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChirpMessageType {
    /// Initialization value only, not a valid message type.
    None = 0x0,
    /// Hosts should reply with an OFFER.
    Request = 0x1,
    /// A service is available.
    Offer = 0x2,
    /// A service is no longer available.
    Depart = 0x3,
}

impl ChirpMessageType {
    fn from_u8(value: u8) -> Result<ChirpMessageType, ChirpError> {
        match value {
            0x0 => Ok(ChirpMessageType::None),
            0x1 => Ok(ChirpMessageType::Request),
            0x2 => Ok(ChirpMessageType::Offer),
            0x3 => Ok(ChirpMessageType::Depart),
            other => Err(ChirpError::Malformed(format!(
                "message type {other:#x} out of range"
            ))),
        }
    }
}

/// A CHIRP discovery message.
#[derive(Debug, Clone)]
pub struct ChirpMessage {
    pub msgtype: ChirpMessageType,
    pub group_uuid: Uuid,
    pub host_uuid: Uuid,
    pub service: ServiceId,
    pub port: u16,
    /// Sender address, filled on receive.
    pub from_address: Option<IpAddr>,
}

impl ChirpMessage {
    /// Serialize to the fixed 42-byte wire form.
    pub fn pack(&self) -> [u8; CHIRP_LENGTH] {
        let mut out = [0u8; CHIRP_LENGTH];
        out[0..6].copy_from_slice(CHIRP_MAGIC);
        out[6] = self.msgtype as u8;
        out[7..23].copy_from_slice(self.group_uuid.as_bytes());
        out[23..39].copy_from_slice(self.host_uuid.as_bytes());
        out[39] = self.service as u8;
        out[40..42].copy_from_slice(&self.port.to_be_bytes());
        out
    }

    /// Decode from bytes, checking length and magic.
    pub fn unpack(msg: &[u8]) -> Result<ChirpMessage, ChirpError> {
        if msg.len() != CHIRP_LENGTH {
            return Err(ChirpError::Malformed(format!(
                "length is {} instead of {CHIRP_LENGTH} bytes",
                msg.len()
            )));
        }
        if &msg[0..6] != CHIRP_MAGIC {
            return Err(ChirpError::Malformed(format!(
                "header {:02x?} is malformed",
                &msg[0..6]
            )));
        }
        let mut group = [0u8; 16];
        group.copy_from_slice(&msg[7..23]);
        let mut host = [0u8; 16];
        host.copy_from_slice(&msg[23..39]);
        Ok(ChirpMessage {
            msgtype: ChirpMessageType::from_u8(msg[6])?,
            group_uuid: Uuid::from_bytes(group),
            host_uuid: Uuid::from_bytes(host),
            service: ServiceId::from_u8(msg[39])?,
            port: u16::from_be_bytes([msg[40], msg[41]]),
            from_address: None,
        })
    }
}

/// Sends and receives CHIRP multicast messages for one host.
pub struct ChirpBeacon {
    host_uuid: Uuid,
    group_uuid: Uuid,
    /// Whether to drop incoming messages from other groups.
    filter_group: bool,
    socket: MulticastSocket,
}

impl ChirpBeacon {
    pub fn new(
        name: &str,
        group: &str,
        interfaces: &[Ipv4Addr],
    ) -> Result<ChirpBeacon, ChirpError> {
        let socket = MulticastSocket::new(interfaces, CHIRP_MULTICAST_ADDRESS, CHIRP_PORT)?;
        Ok(ChirpBeacon {
            host_uuid: Uuid::from_name(name),
            group_uuid: Uuid::from_name(group),
            filter_group: true,
            socket,
        })
    }

    pub fn host_uuid(&self) -> Uuid {
        self.host_uuid
    }

    pub fn group_uuid(&self) -> Uuid {
        self.group_uuid
    }

    #[cfg(test)]
    pub(crate) fn set_group_filter(&mut self, enabled: bool) {
        self.filter_group = enabled;
    }

    /// Emit a message for the given service on all interfaces.
    pub fn emit(
        &self,
        service: ServiceId,
        msgtype: ChirpMessageType,
        port: u16,
    ) -> Result<(), ChirpError> {
        let msg = ChirpMessage {
            msgtype,
            group_uuid: self.group_uuid,
            host_uuid: self.host_uuid,
            service,
            port,
            from_address: None,
        };
        self.socket.send(&msg.pack())?;
        Ok(())
    }

    /// Listen on the CHIRP port and return a message if one was received.
    ///
    /// Messages from this host are dropped, as are messages from other
    /// groups while the group filter is enabled. Malformed datagrams are
    /// an error for the caller to report.
    pub fn listen(&self) -> Result<Option<ChirpMessage>, ChirpError> {
        let Some(datagram) = self.socket.recv()? else {
            return Ok(None);
        };

        let mut msg = ChirpMessage::unpack(&datagram.content).map_err(|e| {
            ChirpError::Malformed(format!(
                "received malformed message from {}: {e}",
                datagram.address
            ))
        })?;

        // Ignore messages from this (our) host.
        if msg.host_uuid == self.host_uuid {
            return Ok(None);
        }
        // Optionally drop messages from other groups.
        if self.filter_group && msg.group_uuid != self.group_uuid {
            return Ok(None);
        }

        msg.from_address = Some(datagram.address);
        Ok(Some(msg))
    }
}
