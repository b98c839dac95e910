// SPDX-License-Identifier: Apache-2.0 OR MIT

//! CMDP monitoring messages: topic-tagged logs, metrics and notifications.
//!
//! Messages are three frames: topic, packed header and payload. Log
//! payloads carry the formatted message text with the structured record in
//! the header tags; metric payloads pack value, handling and unit;
//! notification payloads (`LOG?`/`STAT?`) pack a map of published topics to
//! one-line descriptions.

use chrono::{DateTime, Utc};

use crate::error::DecodeError;

use super::value::{Map, Reader, Value};
use super::{Header, Protocol};

/// Log severity levels spoken on the monitoring channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warning,
    Status,
    Critical,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Status => "STATUS",
            LogLevel::Critical => "CRITICAL",
        }
    }

    /// Parse a level name; `ERROR` maps to `CRITICAL`.
    pub fn from_name(name: &str) -> Option<LogLevel> {
        match name.to_ascii_uppercase().as_str() {
            "TRACE" => Some(LogLevel::Trace),
            "DEBUG" => Some(LogLevel::Debug),
            "INFO" => Some(LogLevel::Info),
            "WARNING" | "WARN" => Some(LogLevel::Warning),
            "STATUS" => Some(LogLevel::Status),
            "CRITICAL" | "ERROR" => Some(LogLevel::Critical),
            _ => None,
        }
    }
}

impl From<log::Level> for LogLevel {
    fn from(level: log::Level) -> LogLevel {
        match level {
            log::Level::Trace => LogLevel::Trace,
            log::Level::Debug => LogLevel::Debug,
            log::Level::Info => LogLevel::Info,
            log::Level::Warn => LogLevel::Warning,
            log::Level::Error => LogLevel::Critical,
        }
    }
}

/// A structured log record distributed via CMDP.
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub level: LogLevel,
    /// Dotted logger name, e.g. `Mock.a.DATA`.
    pub logger: String,
    pub message: String,
    pub sender: String,
    pub time: DateTime<Utc>,
    /// Structured record fields carried in the header tags.
    pub tags: Map,
}

impl LogRecord {
    pub fn new(level: LogLevel, logger: impl Into<String>, message: impl Into<String>) -> Self {
        LogRecord {
            level,
            logger: logger.into(),
            message: message.into(),
            sender: String::new(),
            time: Utc::now(),
            tags: Map::new(),
        }
    }

    /// The topic this record publishes under.
    pub fn topic(&self) -> String {
        format!("LOG/{}/{}", self.level.as_str(), self.logger.to_uppercase())
    }

    pub(crate) fn assemble(&self, sender: &str) -> Vec<Vec<u8>> {
        let mut tags = self.tags.clone();
        tags.insert("msg".into(), Value::Str(self.message.clone()));
        tags.insert("level".into(), Value::Str(self.level.as_str().into()));
        tags.insert("logger".into(), Value::Str(self.logger.clone()));

        let mut header = Vec::new();
        Header::with_tags(sender, tags).pack(Protocol::Cmdp, &mut header);

        vec![
            self.topic().into_bytes(),
            header,
            self.message.clone().into_bytes(),
        ]
    }
}

/// How a metric value is to be handled by consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MetricHandling {
    LastValue = 0x1,
    Accumulate = 0x2,
    Average = 0x3,
    Rate = 0x4,
}

impl MetricHandling {
    fn from_int(value: i64) -> Result<MetricHandling, DecodeError> {
        match value {
            0x1 => Ok(MetricHandling::LastValue),
            0x2 => Ok(MetricHandling::Accumulate),
            0x3 => Ok(MetricHandling::Average),
            0x4 => Ok(MetricHandling::Rate),
            other => Err(DecodeError::malformed(format!(
                "metric handling {other} out of range"
            ))),
        }
    }
}

/// A single metric sample.
#[derive(Debug, Clone)]
pub struct Metric {
    pub name: String,
    pub unit: String,
    pub handling: MetricHandling,
    pub value: Value,
    pub sender: String,
    pub time: DateTime<Utc>,
    pub meta: Option<Map>,
}

impl Metric {
    pub fn new(
        name: impl Into<String>,
        unit: impl Into<String>,
        handling: MetricHandling,
        value: Value,
    ) -> Metric {
        Metric {
            name: name.into(),
            unit: unit.into(),
            handling,
            value,
            sender: String::new(),
            time: Utc::now(),
            meta: None,
        }
    }

    /// The topic this metric publishes under, always upper case.
    pub fn topic(&self) -> String {
        format!("STAT/{}", self.name.to_uppercase())
    }

    pub(crate) fn assemble(&self, sender: &str) -> Vec<Vec<u8>> {
        let mut header = Vec::new();
        Header::new(sender).pack(Protocol::Cmdp, &mut header);

        let mut payload = Vec::new();
        self.value.pack(&mut payload);
        Value::Int(i64::from(self.handling as u8)).pack(&mut payload);
        Value::Str(self.unit.clone()).pack(&mut payload);

        vec![self.topic().into_bytes(), header, payload]
    }
}

/// Assemble a `LOG?`/`STAT?` notification listing published topics.
pub(crate) fn assemble_notification(
    sender: &str,
    topic: &str,
    topics: &Map,
) -> Vec<Vec<u8>> {
    let mut header = Vec::new();
    Header::new(sender).pack(Protocol::Cmdp, &mut header);
    vec![
        topic.as_bytes().to_vec(),
        header,
        Value::Map(topics.clone()).pack_to_vec(),
    ]
}

/// A decoded CMDP message.
#[derive(Debug, Clone)]
pub enum CmdpMessage {
    Log(LogRecord),
    Metric(Metric),
    /// `LOG?` or `STAT?` notification with topic descriptions.
    Notification { topic: String, topics: Map },
}

impl CmdpMessage {
    /// Disassemble from wire frames.
    pub fn disassemble(frames: &[Vec<u8>]) -> Result<CmdpMessage, DecodeError> {
        if frames.len() != 3 {
            return Err(DecodeError::malformed(format!(
                "expected 3 frames, got {}",
                frames.len()
            )));
        }
        let topic = std::str::from_utf8(&frames[0])
            .map_err(|_| DecodeError::malformed("topic is not UTF-8"))?;

        let mut reader = Reader::new(&frames[1]);
        let header = Header::unpack(&mut reader, Protocol::Cmdp)?;

        if let Some(rest) = topic.strip_prefix("LOG/") {
            Ok(CmdpMessage::Log(decode_log(rest, header, &frames[2])?))
        } else if let Some(name) = topic.strip_prefix("STAT/") {
            Ok(CmdpMessage::Metric(decode_metric(name, header, &frames[2])?))
        } else if topic == "LOG?" || topic == "STAT?" {
            let topics = Reader::new(&frames[2]).read_map()?;
            Ok(CmdpMessage::Notification {
                topic: topic.to_owned(),
                topics,
            })
        } else {
            Err(DecodeError::malformed(format!(
                "cannot decode messages of topic `{topic}`"
            )))
        }
    }
}

fn decode_log(topic_rest: &str, header: Header, payload: &[u8]) -> Result<LogRecord, DecodeError> {
    let (level_name, logger) = match topic_rest.split_once('/') {
        Some((level, logger)) => (level, logger),
        None => (topic_rest, ""),
    };
    let level = LogLevel::from_name(level_name)
        .ok_or_else(|| DecodeError::malformed(format!("unknown log level `{level_name}`")))?;
    let message = match header.tags.get("msg").and_then(Value::as_str) {
        Some(msg) => msg.to_owned(),
        None => String::from_utf8(payload.to_vec())
            .map_err(|_| DecodeError::malformed("log message is not UTF-8"))?,
    };
    Ok(LogRecord {
        level,
        logger: logger.to_owned(),
        message,
        sender: header.sender,
        time: header.time,
        tags: header.tags,
    })
}

fn decode_metric(name: &str, header: Header, payload: &[u8]) -> Result<Metric, DecodeError> {
    let mut reader = Reader::new(payload);
    let value = reader.read()?;
    let handling = MetricHandling::from_int(reader.read_int()?)?;
    let unit = reader.read_str()?;
    Ok(Metric {
        name: name.to_owned(),
        unit,
        handling,
        value,
        sender: header.sender,
        time: header.time,
        meta: if header.tags.is_empty() {
            None
        } else {
            Some(header.tags)
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_roundtrip() {
        let record = LogRecord::new(LogLevel::Warning, "Mock.a.DATA", "queue nearly full");
        assert_eq!(record.topic(), "LOG/WARNING/MOCK.A.DATA");

        let frames = record.assemble("Mock.a");
        let decoded = match CmdpMessage::disassemble(&frames).unwrap() {
            CmdpMessage::Log(rec) => rec,
            other => panic!("expected log, got {other:?}"),
        };
        assert_eq!(decoded.level, LogLevel::Warning);
        assert_eq!(decoded.logger, "MOCK.A.DATA");
        assert_eq!(decoded.message, "queue nearly full");
        assert_eq!(decoded.sender, "Mock.a");
    }

    #[test]
    fn error_level_maps_to_critical() {
        let record = LogRecord::new(LogLevel::Critical, "Mock.a", "boom");
        let mut frames = record.assemble("Mock.a");
        frames[0] = b"LOG/ERROR/MOCK.A".to_vec();
        let decoded = match CmdpMessage::disassemble(&frames).unwrap() {
            CmdpMessage::Log(rec) => rec,
            other => panic!("expected log, got {other:?}"),
        };
        assert_eq!(decoded.level, LogLevel::Critical);
    }

    #[test]
    fn metric_roundtrip() {
        let metric = Metric::new("rx_bytes", "B", MetricHandling::LastValue, Value::Int(40));
        assert_eq!(metric.topic(), "STAT/RX_BYTES");

        let frames = metric.assemble("Mock.a");
        let decoded = match CmdpMessage::disassemble(&frames).unwrap() {
            CmdpMessage::Metric(m) => m,
            other => panic!("expected metric, got {other:?}"),
        };
        assert_eq!(decoded.name, "RX_BYTES");
        assert_eq!(decoded.unit, "B");
        assert_eq!(decoded.handling, MetricHandling::LastValue);
        assert_eq!(decoded.value, Value::Int(40));
    }

    #[test]
    fn notification_roundtrip() {
        let mut topics = Map::new();
        topics.insert("STAT/RX_BYTES".into(), Value::Str("bytes received".into()));
        let frames = assemble_notification("Mock.a", "STAT?", &topics);
        match CmdpMessage::disassemble(&frames).unwrap() {
            CmdpMessage::Notification { topic, topics } => {
                assert_eq!(topic, "STAT?");
                assert!(topics.contains_key("STAT/RX_BYTES"));
            }
            other => panic!("expected notification, got {other:?}"),
        }
    }

    #[test]
    fn unknown_topic_is_rejected() {
        let record = LogRecord::new(LogLevel::Info, "Mock.a", "hello");
        let mut frames = record.assemble("Mock.a");
        frames[0] = b"BOGUS/TOPIC".to_vec();
        assert!(CmdpMessage::disassemble(&frames).is_err());
    }
}
