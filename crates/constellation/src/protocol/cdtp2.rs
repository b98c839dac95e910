// SPDX-License-Identifier: Apache-2.0 OR MIT

//! CDTP2 data messages.
//!
//! A message is one frame: packed protocol tag, sender, message type and an
//! array of data records. Each record is `[sequence_number, tags, [bin…]]`.
//! Begin-of-run and end-of-run messages carry exactly two records whose tag
//! maps hold user tags plus the run configuration or run metadata.

use crate::error::DecodeError;

use super::value::{pack_array_len, pack_bin, Map, Reader, Value};
use super::Protocol;

/// Type of a CDTP2 message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CdtpMessageType {
    /// Data message.
    Data = 0x0,
    /// Begin-of-run message.
    Bor = 0x1,
    /// End-of-run message.
    Eor = 0x2,
}

impl CdtpMessageType {
    fn from_int(value: i64) -> Result<CdtpMessageType, DecodeError> {
        match value {
            0x0 => Ok(CdtpMessageType::Data),
            0x1 => Ok(CdtpMessageType::Bor),
            0x2 => Ok(CdtpMessageType::Eor),
            other => Err(DecodeError::malformed(format!(
                "message type {other} out of range"
            ))),
        }
    }
}

/// A data record: sequence number, tag map and binary blocks.
#[derive(Debug, Clone, PartialEq)]
pub struct DataRecord {
    pub sequence_number: u64,
    pub tags: Map,
    blocks: Vec<Vec<u8>>,
}

impl DataRecord {
    pub fn new(sequence_number: u64, tags: Map) -> DataRecord {
        DataRecord {
            sequence_number,
            tags,
            blocks: Vec::new(),
        }
    }

    /// Append a block of binary data.
    pub fn add_block(&mut self, data: Vec<u8>) {
        self.blocks.push(data);
    }

    pub fn blocks(&self) -> &[Vec<u8>] {
        &self.blocks
    }

    /// Total payload bytes across all blocks.
    pub fn payload_bytes(&self) -> usize {
        self.blocks.iter().map(Vec::len).sum()
    }

    fn pack(&self, out: &mut Vec<u8>) {
        pack_array_len(out, 3);
        Value::Int(self.sequence_number as i64).pack(out);
        Value::Map(self.tags.clone()).pack(out);
        pack_array_len(out, self.blocks.len());
        for block in &self.blocks {
            pack_bin(out, block);
        }
    }

    fn unpack(value: Value) -> Result<DataRecord, DecodeError> {
        let array = value
            .as_array()
            .ok_or_else(|| DecodeError::malformed("data record is not an array"))?;
        if array.len() != 3 {
            return Err(DecodeError::malformed("data record array has wrong size"));
        }
        let sequence_number = array[0]
            .as_int()
            .and_then(|v| u64::try_from(v).ok())
            .ok_or_else(|| DecodeError::malformed("sequence number is not an unsigned int"))?;
        let tags = array[1]
            .as_map()
            .ok_or_else(|| DecodeError::malformed("record tags are not a map"))?
            .clone();
        let blocks = array[2]
            .as_array()
            .ok_or_else(|| DecodeError::malformed("data blocks are not an array"))?
            .iter()
            .map(|block| {
                block
                    .as_bin()
                    .map(<[u8]>::to_vec)
                    .ok_or_else(|| DecodeError::malformed("data block is not binary"))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let mut record = DataRecord::new(sequence_number, tags);
        record.blocks = blocks;
        Ok(record)
    }
}

/// A CDTP2 message: header fields plus a batch of data records.
#[derive(Debug, Clone)]
pub struct Cdtp2Message {
    pub sender: String,
    pub msg_type: CdtpMessageType,
    records: Vec<DataRecord>,
}

impl Cdtp2Message {
    pub fn new(sender: impl Into<String>, msg_type: CdtpMessageType) -> Cdtp2Message {
        Cdtp2Message {
            sender: sender.into(),
            msg_type,
            records: Vec::new(),
        }
    }

    /// Build a begin-of-run message from user tags and the run configuration.
    pub fn bor(sender: impl Into<String>, user_tags: Map, configuration: Map) -> Cdtp2Message {
        let mut msg = Cdtp2Message::new(sender, CdtpMessageType::Bor);
        msg.add_record(DataRecord::new(0, user_tags));
        msg.add_record(DataRecord::new(1, configuration));
        msg
    }

    /// Build an end-of-run message from user tags and the run metadata.
    pub fn eor(sender: impl Into<String>, user_tags: Map, run_metadata: Map) -> Cdtp2Message {
        let mut msg = Cdtp2Message::new(sender, CdtpMessageType::Eor);
        msg.add_record(DataRecord::new(0, user_tags));
        msg.add_record(DataRecord::new(1, run_metadata));
        msg
    }

    pub fn add_record(&mut self, record: DataRecord) {
        self.records.push(record);
    }

    pub fn records(&self) -> &[DataRecord] {
        &self.records
    }

    pub fn into_records(self) -> Vec<DataRecord> {
        self.records
    }

    /// Total payload bytes across all records.
    pub fn payload_bytes(&self) -> usize {
        self.records.iter().map(DataRecord::payload_bytes).sum()
    }

    /// For BOR/EOR messages: the (user_tags, configuration/metadata) pair.
    pub fn marker_tags(&self) -> Result<(&Map, &Map), DecodeError> {
        if self.msg_type == CdtpMessageType::Data {
            return Err(DecodeError::malformed("not a BOR or EOR message"));
        }
        if self.records.len() != 2 {
            return Err(DecodeError::malformed(
                "wrong number of data records, exactly two expected",
            ));
        }
        Ok((&self.records[0].tags, &self.records[1].tags))
    }

    /// Assemble into a single wire frame.
    pub fn assemble(&self) -> Vec<u8> {
        let mut out = Vec::new();
        Value::Str(Protocol::Cdtp2.tag().to_owned()).pack(&mut out);
        Value::Str(self.sender.clone()).pack(&mut out);
        Value::Int(i64::from(self.msg_type as u8)).pack(&mut out);
        pack_array_len(&mut out, self.records.len());
        for record in &self.records {
            record.pack(&mut out);
        }
        out
    }

    /// Disassemble from wire frames (exactly one expected).
    pub fn disassemble(frames: &[Vec<u8>]) -> Result<Cdtp2Message, DecodeError> {
        if frames.len() != 1 {
            return Err(DecodeError::malformed(format!(
                "expected 1 frame, got {}",
                frames.len()
            )));
        }
        let mut reader = Reader::new(&frames[0]);
        Protocol::expect(&mut reader, Protocol::Cdtp2)?;
        let sender = reader.read_str()?;
        let msg_type = CdtpMessageType::from_int(reader.read_int()?)?;
        let raw_records = match reader.read()? {
            Value::Array(items) => items,
            other => {
                return Err(DecodeError::malformed(format!(
                    "data records are not an array ({other:?})"
                )))
            }
        };
        let mut msg = Cdtp2Message::new(sender, msg_type);
        for raw in raw_records {
            msg.add_record(DataRecord::unpack(raw)?);
        }
        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_roundtrip() {
        let mut msg = Cdtp2Message::new("Mock.a", CdtpMessageType::Data);
        let mut record = DataRecord::new(2, Map::new());
        record.add_block(vec![0xDE, 0xAD, 0xBE, 0xEF]);
        record.add_block(vec![0x01]);
        msg.add_record(record);

        let frame = msg.assemble();
        let decoded = Cdtp2Message::disassemble(std::slice::from_ref(&frame)).unwrap();
        assert_eq!(decoded.sender, "Mock.a");
        assert_eq!(decoded.msg_type, CdtpMessageType::Data);
        assert_eq!(decoded.records().len(), 1);
        assert_eq!(decoded.records()[0].sequence_number, 2);
        assert_eq!(decoded.records()[0].blocks().len(), 2);
        assert_eq!(decoded.payload_bytes(), 5);
    }

    #[test]
    fn bor_carries_tags_and_configuration() {
        let mut user_tags = Map::new();
        user_tags.insert("foo".into(), Value::Str("bar".into()));
        let mut config = Map::new();
        config.insert("voltage".into(), Value::Int(1000));

        let msg = Cdtp2Message::bor("Mock.a", user_tags.clone(), config.clone());
        let decoded = Cdtp2Message::disassemble(&[msg.assemble()]).unwrap();
        assert_eq!(decoded.msg_type, CdtpMessageType::Bor);
        let (tags, cfg) = decoded.marker_tags().unwrap();
        assert_eq!(tags, &user_tags);
        assert_eq!(cfg, &config);
        assert_eq!(decoded.records()[0].sequence_number, 0);
        assert_eq!(decoded.records()[1].sequence_number, 1);
    }

    #[test]
    fn eor_requires_two_records() {
        let mut msg = Cdtp2Message::new("Mock.a", CdtpMessageType::Eor);
        msg.add_record(DataRecord::new(0, Map::new()));
        let decoded = Cdtp2Message::disassemble(&[msg.assemble()]).unwrap();
        assert!(decoded.marker_tags().is_err());
    }

    #[test]
    fn multi_frame_is_rejected() {
        let msg = Cdtp2Message::new("Mock.a", CdtpMessageType::Data);
        let frame = msg.assemble();
        assert!(Cdtp2Message::disassemble(&[frame.clone(), frame]).is_err());
    }
}
