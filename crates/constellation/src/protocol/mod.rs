// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Wire codecs for the Constellation protocol family.
//!
//! Every protocol frames structured fields with MessagePack and starts with
//! a protocol tag string. [`chirp`](crate::chirp) is the exception: it uses
//! a fixed 42-byte binary layout and lives with the discovery code.

pub mod chp;
pub mod cmdp;
pub mod cscp1;
pub mod cdtp2;
pub mod value;

use chrono::{DateTime, Utc};

use crate::error::DecodeError;
use value::{Map, Reader, Value};

/// Protocol identifiers carried as the first packed header field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// Satellite control protocol, revision 1.
    Cscp1,
    /// Data transmission protocol, revision 2.
    Cdtp2,
    /// Heartbeat protocol.
    Chp,
    /// Monitoring distribution protocol.
    Cmdp,
}

impl Protocol {
    /// The tag string written on the wire.
    pub fn tag(self) -> &'static str {
        match self {
            Protocol::Cscp1 => "CSCP1",
            Protocol::Cdtp2 => "CDTP2",
            Protocol::Chp => "CHP\x01",
            Protocol::Cmdp => "CMDP\x01",
        }
    }

    fn from_tag(tag: &str) -> Option<Protocol> {
        // Tags of retired protocol generations are recognised so that the
        // reader can report a protocol mismatch instead of a decode failure.
        match tag {
            "CSCP1" => Some(Protocol::Cscp1),
            "CDTP2" => Some(Protocol::Cdtp2),
            "CHP\x01" => Some(Protocol::Chp),
            "CMDP\x01" => Some(Protocol::Cmdp),
            _ => None,
        }
    }

    /// Read and check the protocol tag leading a header frame.
    pub(crate) fn expect(reader: &mut Reader<'_>, expected: Protocol) -> Result<(), DecodeError> {
        let tag = reader.read_str()?;
        match Protocol::from_tag(&tag) {
            Some(p) if p == expected => Ok(()),
            Some(p) => Err(DecodeError::UnexpectedProtocol {
                got: p.tag().replace('\x01', "1"),
                expected: expected.tag().replace('\x01', "1"),
            }),
            None => Err(DecodeError::UnknownProtocol(tag)),
        }
    }
}

/// Common header shape of CSCP1 and CMDP frames: sender, send time, tag map.
#[derive(Debug, Clone, PartialEq)]
pub struct Header {
    pub sender: String,
    pub time: DateTime<Utc>,
    pub tags: Map,
}

impl Header {
    pub fn new(sender: impl Into<String>) -> Header {
        Header {
            sender: sender.into(),
            time: Utc::now(),
            tags: Map::new(),
        }
    }

    pub fn with_tags(sender: impl Into<String>, tags: Map) -> Header {
        Header {
            sender: sender.into(),
            time: Utc::now(),
            tags,
        }
    }

    /// Pack protocol tag plus header fields into `out`.
    pub(crate) fn pack(&self, protocol: Protocol, out: &mut Vec<u8>) {
        Value::Str(protocol.tag().to_owned()).pack(out);
        Value::Str(self.sender.clone()).pack(out);
        Value::Time(self.time).pack(out);
        Value::Map(self.tags.clone()).pack(out);
    }

    /// Unpack a header frame, checking the protocol tag.
    pub(crate) fn unpack(
        reader: &mut Reader<'_>,
        protocol: Protocol,
    ) -> Result<Header, DecodeError> {
        Protocol::expect(reader, protocol)?;
        let sender = reader.read_str()?;
        let time = reader.read_time()?;
        let tags = reader.read_map()?;
        Ok(Header { sender, time, tags })
    }
}
