// SPDX-License-Identifier: Apache-2.0 OR MIT

//! CSCP1 request/reply messages.
//!
//! A message is two or three frames: a packed header, a packed verb
//! (type + text) and an optional payload holding a single packed object.

use crate::error::DecodeError;

use super::value::{Map, Reader, Value};
use super::{Header, Protocol};

/// Verb type of a CSCP1 message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum VerbType {
    /// Request with a command.
    Request = 0x0,
    /// Command is being executed.
    Success = 0x1,
    /// Command is valid but not implemented.
    NotImplemented = 0x2,
    /// Command is valid but mandatory payload information is missing or
    /// incorrectly formatted.
    Incomplete = 0x3,
    /// Command is invalid for the current state.
    Invalid = 0x4,
    /// Command is entirely unknown.
    Unknown = 0x5,
    /// Previously received message is invalid.
    Error = 0x6,
}

impl VerbType {
    pub fn from_int(value: i64) -> Result<VerbType, DecodeError> {
        match value {
            0x0 => Ok(VerbType::Request),
            0x1 => Ok(VerbType::Success),
            0x2 => Ok(VerbType::NotImplemented),
            0x3 => Ok(VerbType::Incomplete),
            0x4 => Ok(VerbType::Invalid),
            0x5 => Ok(VerbType::Unknown),
            0x6 => Ok(VerbType::Error),
            other => Err(DecodeError::malformed(format!(
                "verb type {other} out of range"
            ))),
        }
    }
}

/// A CSCP1 control message.
#[derive(Debug, Clone)]
pub struct Cscp1Message {
    pub header: Header,
    pub verb: VerbType,
    pub verb_msg: String,
    pub payload: Option<Value>,
}

impl Cscp1Message {
    pub fn new(sender: impl Into<String>, verb: VerbType, verb_msg: impl Into<String>) -> Self {
        Cscp1Message {
            header: Header::new(sender),
            verb,
            verb_msg: verb_msg.into(),
            payload: None,
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_tags(mut self, tags: Map) -> Self {
        self.header.tags = tags;
        self
    }

    pub fn sender(&self) -> &str {
        &self.header.sender
    }

    /// Assemble into wire frames.
    pub fn assemble(&self) -> Vec<Vec<u8>> {
        let mut header = Vec::new();
        self.header.pack(Protocol::Cscp1, &mut header);

        let mut verb = Vec::new();
        Value::Int(i64::from(self.verb as u8)).pack(&mut verb);
        Value::Str(self.verb_msg.clone()).pack(&mut verb);

        let mut frames = vec![header, verb];
        if let Some(payload) = &self.payload {
            frames.push(payload.pack_to_vec());
        }
        frames
    }

    /// Disassemble from wire frames.
    pub fn disassemble(frames: &[Vec<u8>]) -> Result<Cscp1Message, DecodeError> {
        if frames.len() != 2 && frames.len() != 3 {
            return Err(DecodeError::malformed(format!(
                "expected 2 or 3 frames, got {}",
                frames.len()
            )));
        }

        let mut reader = Reader::new(&frames[0]);
        let header = Header::unpack(&mut reader, Protocol::Cscp1)?;

        let mut reader = Reader::new(&frames[1]);
        let verb = VerbType::from_int(reader.read_int()?)?;
        let verb_msg = reader.read_str()?;

        let payload = match frames.get(2) {
            Some(frame) => Some(Value::unpack(frame)?),
            None => None,
        };

        Ok(Cscp1Message {
            header,
            verb,
            verb_msg,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_without_payload() {
        let msg = Cscp1Message::new("Mock.a", VerbType::Request, "get_state");
        let frames = msg.assemble();
        assert_eq!(frames.len(), 2);

        let decoded = Cscp1Message::disassemble(&frames).unwrap();
        assert_eq!(decoded.sender(), "Mock.a");
        assert_eq!(decoded.verb, VerbType::Request);
        assert_eq!(decoded.verb_msg, "get_state");
        assert!(decoded.payload.is_none());
    }

    #[test]
    fn roundtrip_with_payload_and_tags() {
        let mut tags = Map::new();
        tags.insert("last_changed_iso".into(), Value::Str("2024-01-01".into()));
        let mut config = Map::new();
        config.insert("voltage".into(), Value::Int(1000));

        let msg = Cscp1Message::new("Mock.a", VerbType::Success, "transitioning")
            .with_payload(Value::Map(config.clone()))
            .with_tags(tags);
        let frames = msg.assemble();
        assert_eq!(frames.len(), 3);

        let decoded = Cscp1Message::disassemble(&frames).unwrap();
        assert_eq!(decoded.verb, VerbType::Success);
        assert_eq!(decoded.payload, Some(Value::Map(config)));
        assert!(decoded.header.tags.contains_key("last_changed_iso"));
    }

    #[test]
    fn verb_out_of_range_is_decoding_error() {
        let msg = Cscp1Message::new("Mock.a", VerbType::Request, "get_state");
        let mut frames = msg.assemble();
        let mut verb = Vec::new();
        Value::Int(0x7).pack(&mut verb);
        Value::Str("get_state".into()).pack(&mut verb);
        frames[1] = verb;
        assert!(matches!(
            Cscp1Message::disassemble(&frames),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn wrong_frame_count_is_rejected() {
        let msg = Cscp1Message::new("Mock.a", VerbType::Request, "get_state");
        let frames = msg.assemble();
        assert!(Cscp1Message::disassemble(&frames[..1]).is_err());
        let mut too_many = frames.clone();
        too_many.extend_from_slice(&frames);
        assert!(Cscp1Message::disassemble(&too_many).is_err());
    }
}
