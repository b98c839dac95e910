// SPDX-License-Identifier: Apache-2.0 OR MIT

//! CMDP publisher with XPUB subscription accounting.
//!
//! The XPUB socket delivers every subscribe (0x01) and unsubscribe (0x00)
//! frame; those are folded into a per-topic counter so that log records and
//! metrics are only encoded and sent when somebody listens. A new
//! subscription to the `LOG`/`STAT` tree triggers a `LOG?`/`STAT?`
//! notification listing the published topics.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::protocol::cmdp::{assemble_notification, LogRecord, Metric};
use crate::protocol::value::{Map, Value};

pub struct CmdpPublisher {
    name: String,
    socket: Mutex<zmq::Socket>,
    /// Active subscription prefixes with reference counts.
    subscriptions: Mutex<HashMap<String, usize>>,
    /// Published log topics and their one-line descriptions.
    log_topics: Mutex<Map>,
    /// Published metric topics and their one-line descriptions.
    stat_topics: Mutex<Map>,
}

impl CmdpPublisher {
    /// Wrap a bound XPUB socket with verbose subscription passing enabled.
    pub fn new(name: impl Into<String>, socket: zmq::Socket) -> CmdpPublisher {
        CmdpPublisher {
            name: name.into(),
            socket: Mutex::new(socket),
            subscriptions: Mutex::new(HashMap::new()),
            log_topics: Mutex::new(Map::new()),
            stat_topics: Mutex::new(Map::new()),
        }
    }

    /// Announce a log topic for `LOG?` notifications.
    pub fn register_log(&self, logger: &str, description: &str) {
        self.log_topics.lock().insert(
            format!("LOG/{}", logger.to_uppercase()),
            Value::Str(description.to_owned()),
        );
    }

    /// Announce a metric for `STAT?` notifications.
    pub fn register_stat(&self, name: &str, description: &str) {
        self.stat_topics.lock().insert(
            format!("STAT/{}", name.to_uppercase()),
            Value::Str(description.to_owned()),
        );
    }

    /// Drain pending subscription frames into the counter map.
    pub fn update_subscriptions(&self) {
        let mut notify_log = false;
        let mut notify_stat = false;
        {
            let socket = self.socket.lock();
            let mut subscriptions = self.subscriptions.lock();
            loop {
                let frame = match socket.recv_bytes(zmq::DONTWAIT) {
                    Ok(frame) if !frame.is_empty() => frame,
                    _ => break,
                };
                let subscribe = frame[0] == 0x01;
                let topic = String::from_utf8_lossy(&frame[1..]).into_owned();
                let count = subscriptions.entry(topic.clone()).or_insert(0);
                if subscribe {
                    *count += 1;
                    if *count == 1 {
                        // First subscriber on this prefix: notify the tree.
                        if topic.is_empty() || "LOG".starts_with(topic.as_str()) || topic.starts_with("LOG") {
                            notify_log = true;
                        }
                        if topic.is_empty() || "STAT".starts_with(topic.as_str()) || topic.starts_with("STAT") {
                            notify_stat = true;
                        }
                    }
                    log::trace!("[cmdp] subscription on `{topic}` ({count})");
                } else {
                    *count = count.saturating_sub(1);
                    if *count == 0 {
                        subscriptions.remove(&topic);
                    }
                    log::trace!("[cmdp] unsubscription on `{topic}`");
                }
            }
        }
        if notify_log {
            self.send_notification("LOG?", &self.log_topics.lock().clone());
        }
        if notify_stat {
            self.send_notification("STAT?", &self.stat_topics.lock().clone());
        }
    }

    /// Whether a record on `topic` has at least one subscribed prefix.
    fn has_subscribers(&self, topic: &str) -> bool {
        self.subscriptions
            .lock()
            .keys()
            .any(|prefix| topic.starts_with(prefix.as_str()))
    }

    /// Whether the given record would reach any subscriber.
    pub fn has_log_subscribers(&self, record: &LogRecord) -> bool {
        self.has_subscribers(&record.topic())
    }

    /// Whether the given metric would reach any subscriber.
    pub fn has_metric_subscribers(&self, name: &str) -> bool {
        self.has_subscribers(&format!("STAT/{}", name.to_uppercase()))
    }

    /// Number of currently known subscriptions (all prefixes).
    pub fn subscriber_count(&self) -> usize {
        self.subscriptions.lock().values().sum()
    }

    pub fn send_log(&self, record: &LogRecord) {
        let frames = record.assemble(&self.name);
        if let Err(e) = self.socket.lock().send_multipart(frames, 0) {
            log::debug!("[cmdp] failed to publish log record: {e}");
        }
    }

    pub fn send_metric(&self, metric: &Metric) {
        let frames = metric.assemble(&self.name);
        if let Err(e) = self.socket.lock().send_multipart(frames, 0) {
            log::debug!("[cmdp] failed to publish metric: {e}");
        }
    }

    fn send_notification(&self, topic: &str, topics: &Map) {
        let frames = assemble_notification(&self.name, topic, topics);
        if let Err(e) = self.socket.lock().send_multipart(frames, 0) {
            log::debug!("[cmdp] failed to publish {topic} notification: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::cmdp::{LogLevel, MetricHandling};

    fn publisher_with_subscriptions(prefixes: &[&str]) -> CmdpPublisher {
        let ctx = zmq::Context::new();
        let xpub = ctx.socket(zmq::XPUB).unwrap();
        xpub.bind("inproc://cmdp-pub-test").unwrap();
        let publisher = CmdpPublisher::new("Mock.a", xpub);
        {
            let mut subs = publisher.subscriptions.lock();
            for prefix in prefixes {
                *subs.entry((*prefix).to_owned()).or_insert(0) += 1;
            }
        }
        publisher
    }

    #[test]
    fn prefix_matching_for_logs() {
        let publisher = publisher_with_subscriptions(&["LOG/WARNING/"]);
        let warning = LogRecord::new(LogLevel::Warning, "Mock.a.DATA", "m");
        let info = LogRecord::new(LogLevel::Info, "Mock.a.DATA", "m");
        assert!(publisher.has_log_subscribers(&warning));
        assert!(!publisher.has_log_subscribers(&info));
    }

    #[test]
    fn bare_log_prefix_matches_all_levels() {
        let publisher = publisher_with_subscriptions(&["LOG/"]);
        for level in [LogLevel::Trace, LogLevel::Status, LogLevel::Critical] {
            let record = LogRecord::new(level, "Mock.a", "m");
            assert!(publisher.has_log_subscribers(&record));
        }
    }

    #[test]
    fn empty_prefix_matches_everything() {
        let publisher = publisher_with_subscriptions(&[""]);
        let record = LogRecord::new(LogLevel::Debug, "Mock.a", "m");
        assert!(publisher.has_log_subscribers(&record));
        assert!(publisher.has_metric_subscribers("rx_bytes"));
    }

    #[test]
    fn metric_matching_is_case_insensitive_on_name() {
        let publisher = publisher_with_subscriptions(&["STAT/RX_BYTES"]);
        assert!(publisher.has_metric_subscribers("rx_bytes"));
        assert!(!publisher.has_metric_subscribers("tx_bytes"));
    }

    #[test]
    fn subscription_frames_are_counted() {
        let ctx = zmq::Context::new();
        let xpub = ctx.socket(zmq::XPUB).unwrap();
        xpub.set_xpub_verbose(true).unwrap();
        let port = crate::transport::bind_tcp(&xpub, 0).unwrap();
        let publisher = CmdpPublisher::new("Mock.a", xpub);

        let sub = ctx.socket(zmq::SUB).unwrap();
        sub.connect(&format!("tcp://127.0.0.1:{port}")).unwrap();
        sub.set_subscribe(b"LOG/").unwrap();
        sub.set_subscribe(b"STAT/").unwrap();

        // Subscription frames need a moment to arrive.
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        while publisher.subscriber_count() < 2 && std::time::Instant::now() < deadline {
            publisher.update_subscriptions();
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert_eq!(publisher.subscriber_count(), 2);

        sub.set_unsubscribe(b"STAT/").unwrap();
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        while publisher.subscriber_count() > 1 && std::time::Instant::now() < deadline {
            publisher.update_subscriptions();
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert_eq!(publisher.subscriber_count(), 1);

        let metric = Metric::new("rx_bytes", "B", MetricHandling::LastValue, Value::Int(1));
        assert!(!publisher.has_metric_subscribers(&metric.name));
    }
}
