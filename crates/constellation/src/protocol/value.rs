// SPDX-License-Identifier: Apache-2.0 OR MIT

//! MessagePack value model shared by all protocol codecs.
//!
//! Message headers are concatenations of individually packed values rather
//! than a single array, so the codec layer works with a [`Reader`] cursor
//! that yields one value at a time. Timestamps use the MessagePack
//! timestamp extension (type -1) and are always UTC.

use std::collections::BTreeMap;

use chrono::{DateTime, TimeZone, Utc};
use rmp::Marker;

use crate::error::DecodeError;

/// String-keyed value map, used for header tags and record tags.
pub type Map = BTreeMap<String, Value>;

/// A decoded MessagePack value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bin(Vec<u8>),
    Time(DateTime<Utc>),
    Array(Vec<Value>),
    Map(Map),
}

impl Value {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            Value::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bin(&self) -> Option<&[u8]> {
        match self {
            Value::Bin(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_time(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::Time(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&Map> {
        match self {
            Value::Map(v) => Some(v),
            _ => None,
        }
    }

    /// Append the packed form of this value to `out`.
    pub fn pack(&self, out: &mut Vec<u8>) {
        match self {
            Value::Nil => out.push(Marker::Null.to_u8()),
            Value::Bool(v) => out.push(if *v { Marker::True } else { Marker::False }.to_u8()),
            Value::Int(v) => pack_int(out, *v),
            Value::Float(v) => {
                out.push(Marker::F64.to_u8());
                out.extend_from_slice(&v.to_be_bytes());
            }
            Value::Str(v) => pack_str(out, v),
            Value::Bin(v) => pack_bin(out, v),
            Value::Time(v) => pack_time(out, *v),
            Value::Array(items) => {
                pack_array_len(out, items.len());
                for item in items {
                    item.pack(out);
                }
            }
            Value::Map(map) => {
                pack_map_len(out, map.len());
                for (key, value) in map {
                    pack_str(out, key);
                    value.pack(out);
                }
            }
        }
    }

    /// Pack this value into a fresh buffer.
    pub fn pack_to_vec(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.pack(&mut out);
        out
    }

    /// Decode a single value occupying the whole buffer.
    pub fn unpack(buf: &[u8]) -> Result<Value, DecodeError> {
        let mut reader = Reader::new(buf);
        let value = reader.read()?;
        if !reader.done() {
            return Err(DecodeError::malformed("trailing bytes after value"));
        }
        Ok(value)
    }

    fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::Bin(_) => "binary",
            Value::Time(_) => "timestamp",
            Value::Array(_) => "array",
            Value::Map(_) => "map",
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Value {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Value {
        Value::Int(v)
    }
}

impl From<u16> for Value {
    fn from(v: u16) -> Value {
        Value::Int(i64::from(v))
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Value {
        Value::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Value {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Value {
        Value::Str(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Value {
        Value::Str(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Value {
        Value::Bin(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Value {
        Value::Time(v)
    }
}

fn pack_int(out: &mut Vec<u8>, v: i64) {
    if v >= 0 {
        let u = v as u64;
        if u <= 0x7f {
            out.push(Marker::FixPos(u as u8).to_u8());
        } else if u <= u64::from(u8::MAX) {
            out.push(Marker::U8.to_u8());
            out.push(u as u8);
        } else if u <= u64::from(u16::MAX) {
            out.push(Marker::U16.to_u8());
            out.extend_from_slice(&(u as u16).to_be_bytes());
        } else if u <= u64::from(u32::MAX) {
            out.push(Marker::U32.to_u8());
            out.extend_from_slice(&(u as u32).to_be_bytes());
        } else {
            out.push(Marker::U64.to_u8());
            out.extend_from_slice(&u.to_be_bytes());
        }
    } else if v >= -32 {
        out.push(Marker::FixNeg(v as i8).to_u8());
    } else if v >= i64::from(i8::MIN) {
        out.push(Marker::I8.to_u8());
        out.push((v as i8) as u8);
    } else if v >= i64::from(i16::MIN) {
        out.push(Marker::I16.to_u8());
        out.extend_from_slice(&(v as i16).to_be_bytes());
    } else if v >= i64::from(i32::MIN) {
        out.push(Marker::I32.to_u8());
        out.extend_from_slice(&(v as i32).to_be_bytes());
    } else {
        out.push(Marker::I64.to_u8());
        out.extend_from_slice(&v.to_be_bytes());
    }
}

pub(crate) fn pack_str(out: &mut Vec<u8>, v: &str) {
    let bytes = v.as_bytes();
    let len = bytes.len();
    if len < 32 {
        out.push(Marker::FixStr(len as u8).to_u8());
    } else if len <= usize::from(u8::MAX) {
        out.push(Marker::Str8.to_u8());
        out.push(len as u8);
    } else if len <= usize::from(u16::MAX) {
        out.push(Marker::Str16.to_u8());
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.push(Marker::Str32.to_u8());
        out.extend_from_slice(&(len as u32).to_be_bytes());
    }
    out.extend_from_slice(bytes);
}

pub(crate) fn pack_bin(out: &mut Vec<u8>, v: &[u8]) {
    let len = v.len();
    if len <= usize::from(u8::MAX) {
        out.push(Marker::Bin8.to_u8());
        out.push(len as u8);
    } else if len <= usize::from(u16::MAX) {
        out.push(Marker::Bin16.to_u8());
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.push(Marker::Bin32.to_u8());
        out.extend_from_slice(&(len as u32).to_be_bytes());
    }
    out.extend_from_slice(v);
}

pub(crate) fn pack_array_len(out: &mut Vec<u8>, len: usize) {
    if len < 16 {
        out.push(Marker::FixArray(len as u8).to_u8());
    } else if len <= usize::from(u16::MAX) {
        out.push(Marker::Array16.to_u8());
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.push(Marker::Array32.to_u8());
        out.extend_from_slice(&(len as u32).to_be_bytes());
    }
}

pub(crate) fn pack_map_len(out: &mut Vec<u8>, len: usize) {
    if len < 16 {
        out.push(Marker::FixMap(len as u8).to_u8());
    } else if len <= usize::from(u16::MAX) {
        out.push(Marker::Map16.to_u8());
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.push(Marker::Map32.to_u8());
        out.extend_from_slice(&(len as u32).to_be_bytes());
    }
}

/// MessagePack timestamp extension type.
const EXT_TIMESTAMP: i8 = -1;

fn pack_time(out: &mut Vec<u8>, t: DateTime<Utc>) {
    let secs = t.timestamp();
    let nanos = t.timestamp_subsec_nanos();
    if secs >= 0 && (secs >> 34) == 0 {
        if nanos == 0 && secs <= i64::from(u32::MAX) {
            // timestamp 32
            out.push(Marker::FixExt4.to_u8());
            out.push(EXT_TIMESTAMP as u8);
            out.extend_from_slice(&(secs as u32).to_be_bytes());
        } else {
            // timestamp 64
            let combined = (u64::from(nanos) << 34) | (secs as u64);
            out.push(Marker::FixExt8.to_u8());
            out.push(EXT_TIMESTAMP as u8);
            out.extend_from_slice(&combined.to_be_bytes());
        }
    } else {
        // timestamp 96
        out.push(Marker::Ext8.to_u8());
        out.push(12);
        out.push(EXT_TIMESTAMP as u8);
        out.extend_from_slice(&nanos.to_be_bytes());
        out.extend_from_slice(&secs.to_be_bytes());
    }
}

/// Cursor over a buffer of concatenated MessagePack values.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Reader<'a> {
        Reader { buf, pos: 0 }
    }

    /// Whether the whole buffer has been consumed.
    pub fn done(&self) -> bool {
        self.pos >= self.buf.len()
    }

    /// Read the next value.
    pub fn read(&mut self) -> Result<Value, DecodeError> {
        let marker = Marker::from_u8(self.take_u8()?);
        match marker {
            Marker::Null => Ok(Value::Nil),
            Marker::True => Ok(Value::Bool(true)),
            Marker::False => Ok(Value::Bool(false)),
            Marker::FixPos(v) => Ok(Value::Int(i64::from(v))),
            Marker::FixNeg(v) => Ok(Value::Int(i64::from(v))),
            Marker::U8 => Ok(Value::Int(i64::from(self.take_u8()?))),
            Marker::U16 => Ok(Value::Int(i64::from(u16::from_be_bytes(
                self.take_bytes::<2>()?,
            )))),
            Marker::U32 => Ok(Value::Int(i64::from(u32::from_be_bytes(
                self.take_bytes::<4>()?,
            )))),
            Marker::U64 => {
                let v = u64::from_be_bytes(self.take_bytes::<8>()?);
                i64::try_from(v)
                    .map(Value::Int)
                    .map_err(|_| DecodeError::malformed("integer out of range"))
            }
            Marker::I8 => Ok(Value::Int(i64::from(self.take_u8()? as i8))),
            Marker::I16 => Ok(Value::Int(i64::from(i16::from_be_bytes(
                self.take_bytes::<2>()?,
            )))),
            Marker::I32 => Ok(Value::Int(i64::from(i32::from_be_bytes(
                self.take_bytes::<4>()?,
            )))),
            Marker::I64 => Ok(Value::Int(i64::from_be_bytes(self.take_bytes::<8>()?))),
            Marker::F32 => Ok(Value::Float(f64::from(f32::from_be_bytes(
                self.take_bytes::<4>()?,
            )))),
            Marker::F64 => Ok(Value::Float(f64::from_be_bytes(self.take_bytes::<8>()?))),
            Marker::FixStr(len) => self.read_str_body(usize::from(len)),
            Marker::Str8 => {
                let len = usize::from(self.take_u8()?);
                self.read_str_body(len)
            }
            Marker::Str16 => {
                let len = usize::from(u16::from_be_bytes(self.take_bytes::<2>()?));
                self.read_str_body(len)
            }
            Marker::Str32 => {
                let len = u32::from_be_bytes(self.take_bytes::<4>()?) as usize;
                self.read_str_body(len)
            }
            Marker::Bin8 => {
                let len = usize::from(self.take_u8()?);
                Ok(Value::Bin(self.take_slice(len)?.to_vec()))
            }
            Marker::Bin16 => {
                let len = usize::from(u16::from_be_bytes(self.take_bytes::<2>()?));
                Ok(Value::Bin(self.take_slice(len)?.to_vec()))
            }
            Marker::Bin32 => {
                let len = u32::from_be_bytes(self.take_bytes::<4>()?) as usize;
                Ok(Value::Bin(self.take_slice(len)?.to_vec()))
            }
            Marker::FixArray(len) => self.read_array_body(usize::from(len)),
            Marker::Array16 => {
                let len = usize::from(u16::from_be_bytes(self.take_bytes::<2>()?));
                self.read_array_body(len)
            }
            Marker::Array32 => {
                let len = u32::from_be_bytes(self.take_bytes::<4>()?) as usize;
                self.read_array_body(len)
            }
            Marker::FixMap(len) => self.read_map_body(usize::from(len)),
            Marker::Map16 => {
                let len = usize::from(u16::from_be_bytes(self.take_bytes::<2>()?));
                self.read_map_body(len)
            }
            Marker::Map32 => {
                let len = u32::from_be_bytes(self.take_bytes::<4>()?) as usize;
                self.read_map_body(len)
            }
            Marker::FixExt4 => self.read_ext_body(4),
            Marker::FixExt8 => self.read_ext_body(8),
            Marker::Ext8 => {
                let len = usize::from(self.take_u8()?);
                self.read_ext_body(len)
            }
            other => Err(DecodeError::malformed(format!(
                "unsupported marker {other:?}"
            ))),
        }
    }

    /// Read the next value, requiring a string.
    pub fn read_str(&mut self) -> Result<String, DecodeError> {
        match self.read()? {
            Value::Str(s) => Ok(s),
            other => Err(type_mismatch("string", &other)),
        }
    }

    /// Read the next value, requiring an integer.
    pub fn read_int(&mut self) -> Result<i64, DecodeError> {
        match self.read()? {
            Value::Int(v) => Ok(v),
            other => Err(type_mismatch("int", &other)),
        }
    }

    /// Read the next value, requiring a map.
    pub fn read_map(&mut self) -> Result<Map, DecodeError> {
        match self.read()? {
            Value::Map(m) => Ok(m),
            other => Err(type_mismatch("map", &other)),
        }
    }

    /// Read the next value, requiring a timestamp.
    pub fn read_time(&mut self) -> Result<DateTime<Utc>, DecodeError> {
        match self.read()? {
            Value::Time(t) => Ok(t),
            other => Err(type_mismatch("timestamp", &other)),
        }
    }

    fn read_str_body(&mut self, len: usize) -> Result<Value, DecodeError> {
        let bytes = self.take_slice(len)?;
        let s = std::str::from_utf8(bytes)
            .map_err(|_| DecodeError::malformed("invalid UTF-8 in string"))?;
        Ok(Value::Str(s.to_owned()))
    }

    fn read_array_body(&mut self, len: usize) -> Result<Value, DecodeError> {
        let mut items = Vec::with_capacity(len.min(1024));
        for _ in 0..len {
            items.push(self.read()?);
        }
        Ok(Value::Array(items))
    }

    fn read_map_body(&mut self, len: usize) -> Result<Value, DecodeError> {
        let mut map = Map::new();
        for _ in 0..len {
            let key = self.read_str()?;
            let value = self.read()?;
            map.insert(key, value);
        }
        Ok(Value::Map(map))
    }

    fn read_ext_body(&mut self, len: usize) -> Result<Value, DecodeError> {
        let ext_type = self.take_u8()? as i8;
        if ext_type != EXT_TIMESTAMP {
            return Err(DecodeError::malformed(format!(
                "unsupported extension type {ext_type}"
            )));
        }
        let (secs, nanos) = match len {
            4 => (i64::from(u32::from_be_bytes(self.take_bytes::<4>()?)), 0u32),
            8 => {
                let combined = u64::from_be_bytes(self.take_bytes::<8>()?);
                ((combined & 0x3_FFFF_FFFF) as i64, (combined >> 34) as u32)
            }
            12 => {
                let nanos = u32::from_be_bytes(self.take_bytes::<4>()?);
                let secs = i64::from_be_bytes(self.take_bytes::<8>()?);
                (secs, nanos)
            }
            _ => {
                return Err(DecodeError::malformed(format!(
                    "invalid timestamp length {len}"
                )))
            }
        };
        Utc.timestamp_opt(secs, nanos)
            .single()
            .map(Value::Time)
            .ok_or_else(|| DecodeError::malformed("timestamp out of range"))
    }

    fn take_u8(&mut self) -> Result<u8, DecodeError> {
        let byte = *self
            .buf
            .get(self.pos)
            .ok_or_else(|| DecodeError::malformed("truncated frame"))?;
        self.pos += 1;
        Ok(byte)
    }

    fn take_bytes<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let slice = self.take_slice(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        Ok(out)
    }

    fn take_slice(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| DecodeError::malformed("truncated frame"))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }
}

fn type_mismatch(expected: &'static str, got: &Value) -> DecodeError {
    DecodeError::malformed(format!("expected {expected}, got {}", got.type_name()))
}
