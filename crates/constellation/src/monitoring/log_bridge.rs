// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Bridge from the `log` facade onto the monitoring channel.
//!
//! Records are converted and handed to the publisher loop over a bounded
//! channel, never touching the socket from the logging call site. An
//! optional stderr tee keeps console output available.

use crossbeam_channel::Sender;

use crate::protocol::cmdp::LogRecord;

pub struct CmdpLogBridge {
    /// Satellite canonical name, prefixed to the logger name.
    name: String,
    tx: Sender<LogRecord>,
    stderr_level: log::LevelFilter,
    max_level: log::LevelFilter,
}

impl CmdpLogBridge {
    pub fn new(name: impl Into<String>, tx: Sender<LogRecord>) -> CmdpLogBridge {
        CmdpLogBridge {
            name: name.into(),
            tx,
            stderr_level: log::LevelFilter::Info,
            max_level: log::LevelFilter::Trace,
        }
    }

    /// Maximum level echoed to stderr (monitoring always gets everything).
    pub fn with_stderr_level(mut self, level: log::LevelFilter) -> CmdpLogBridge {
        self.stderr_level = level;
        self
    }

    /// Install as the global logger.
    pub fn init(self) -> Result<(), log::SetLoggerError> {
        log::set_max_level(self.max_level);
        log::set_boxed_logger(Box::new(self))
    }

    fn to_record(&self, record: &log::Record<'_>) -> LogRecord {
        let logger = format!("{}.{}", self.name, record.target().replace("::", "."));
        LogRecord::new(record.level().into(), logger, record.args().to_string())
    }
}

impl log::Log for CmdpLogBridge {
    fn enabled(&self, metadata: &log::Metadata<'_>) -> bool {
        metadata.level() <= self.max_level
    }

    fn log(&self, record: &log::Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        if record.level() <= self.stderr_level {
            eprintln!(
                "{:<5} [{}] {}",
                record.level(),
                record.target(),
                record.args()
            );
        }
        // Drop on a full queue rather than block the caller.
        let _ = self.tx.try_send(self.to_record(record));
    }

    fn flush(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::cmdp::LogLevel;

    #[test]
    fn records_are_forwarded_with_prefixed_logger() {
        let (tx, rx) = crossbeam_channel::bounded(4);
        let bridge = CmdpLogBridge::new("Mock.a", tx).with_stderr_level(log::LevelFilter::Off);

        // The format_args! temporary must stay within one statement.
        log::Log::log(
            &bridge,
            &log::Record::builder()
                .args(format_args!("queue nearly full"))
                .level(log::Level::Warn)
                .target("constellation::data")
                .build(),
        );

        let forwarded = rx.try_recv().unwrap();
        assert_eq!(forwarded.level, LogLevel::Warning);
        assert_eq!(forwarded.logger, "Mock.a.constellation.data");
        assert_eq!(forwarded.message, "queue nearly full");
    }

    #[test]
    fn full_queue_drops_instead_of_blocking() {
        let (tx, _rx) = crossbeam_channel::bounded(1);
        let bridge = CmdpLogBridge::new("Mock.a", tx).with_stderr_level(log::LevelFilter::Off);
        for _ in 0..10 {
            log::Log::log(
                &bridge,
                &log::Record::builder()
                    .args(format_args!("spam"))
                    .level(log::Level::Debug)
                    .target("constellation::test")
                    .build(),
            );
        }
    }
}
