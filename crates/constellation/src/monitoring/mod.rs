// SPDX-License-Identifier: Apache-2.0 OR MIT

//! CMDP monitoring: publisher loop, metric registry, listener, log bridge.
//!
//! Metrics are registered at construction time as polled closures with a
//! name, unit, handling and interval. The publisher loop refreshes the
//! subscription counters, forwards bridged log records and polls metrics
//! that are due and have at least one subscriber.

mod listener;
mod log_bridge;
mod publisher;

pub use listener::CmdpListener;
pub use log_bridge::CmdpLogBridge;
pub use publisher::CmdpPublisher;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use parking_lot::Mutex;

use crate::protocol::cmdp::{LogRecord, Metric, MetricHandling};
use crate::protocol::value::Value;

/// Closure polled for a metric value; `None` skips the sample.
pub type MetricPoll = Box<dyn Fn() -> Option<Value> + Send + Sync + 'static>;

struct ScheduledMetric {
    unit: String,
    handling: MetricHandling,
    interval: Duration,
    poll: MetricPoll,
}

/// Publishes logs and metrics for one satellite.
pub struct MonitoringSender {
    publisher: Arc<CmdpPublisher>,
    metrics: Mutex<HashMap<String, ScheduledMetric>>,
    log_rx: Receiver<LogRecord>,
}

impl MonitoringSender {
    pub fn new(publisher: Arc<CmdpPublisher>, log_rx: Receiver<LogRecord>) -> MonitoringSender {
        MonitoringSender {
            publisher,
            metrics: Mutex::new(HashMap::new()),
            log_rx,
        }
    }

    pub fn publisher(&self) -> &Arc<CmdpPublisher> {
        &self.publisher
    }

    /// Schedule a metric callback at a regular interval.
    pub fn schedule_metric(
        &self,
        name: &str,
        description: &str,
        unit: &str,
        handling: MetricHandling,
        interval: Duration,
        poll: MetricPoll,
    ) {
        self.publisher.register_stat(name, description);
        self.metrics.lock().insert(
            name.to_owned(),
            ScheduledMetric {
                unit: unit.to_owned(),
                handling,
                interval,
                poll,
            },
        );
    }

    /// Send a single metric immediately, subscription permitting.
    pub fn send_metric(&self, metric: &Metric) {
        if self.publisher.has_metric_subscribers(&metric.name) {
            self.publisher.send_metric(metric);
        }
    }

    /// Publishing loop: subscription updates, bridged logs, metric polling.
    pub fn run(&self, stop: &AtomicBool) {
        let mut last_update: HashMap<String, Instant> = HashMap::new();
        while !stop.load(Ordering::Relaxed) {
            thread::sleep(Duration::from_millis(100));

            self.publisher.update_subscriptions();

            // Forward log records from the bridge, topic filter permitting.
            while let Ok(record) = self.log_rx.try_recv() {
                if self.publisher.has_log_subscribers(&record) {
                    self.publisher.send_log(&record);
                }
            }

            let metrics = self.metrics.lock();
            for (name, scheduled) in metrics.iter() {
                if !self.publisher.has_metric_subscribers(name) {
                    continue;
                }
                let due = last_update
                    .get(name)
                    .map_or(true, |last| last.elapsed() > scheduled.interval);
                if !due {
                    continue;
                }
                match (scheduled.poll)() {
                    Some(value) => {
                        let metric = Metric::new(name.clone(), scheduled.unit.clone(), scheduled.handling, value);
                        self.publisher.send_metric(&metric);
                    }
                    None => {
                        log::trace!("[cmdp] not sending metric {name}: currently unavailable");
                    }
                }
                last_update.insert(name.clone(), Instant::now());
            }
        }
        log::info!("[cmdp] monitoring sender shutting down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::cmdp::CmdpMessage;

    #[test]
    fn scheduled_metric_reaches_subscriber() {
        let ctx = zmq::Context::new();
        let xpub = ctx.socket(zmq::XPUB).unwrap();
        xpub.set_xpub_verbose(true).unwrap();
        let port = crate::transport::bind_tcp(&xpub, 0).unwrap();

        let publisher = Arc::new(CmdpPublisher::new("Mock.a", xpub));
        let (_log_tx, log_rx) = crossbeam_channel::bounded(16);
        let sender = Arc::new(MonitoringSender::new(publisher, log_rx));
        sender.schedule_metric(
            "rx_bytes",
            "Number of bytes received.",
            "B",
            MetricHandling::LastValue,
            Duration::from_millis(100),
            Box::new(|| Some(Value::Int(40))),
        );

        let listener = CmdpListener::connect(&ctx, &format!("tcp://127.0.0.1:{port}")).unwrap();
        listener.subscribe("STAT/").unwrap();
        listener.set_receive_timeout(Duration::from_millis(250)).unwrap();

        let stop = Arc::new(AtomicBool::new(false));
        let stop_thread = Arc::clone(&stop);
        let sender_thread = Arc::clone(&sender);
        let handle = thread::spawn(move || sender_thread.run(&stop_thread));

        let mut metric = None;
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            match listener.recv(false).unwrap() {
                Some(CmdpMessage::Metric(m)) => {
                    metric = Some(m);
                    break;
                }
                _ => continue,
            }
        }
        stop.store(true, Ordering::Relaxed);
        handle.join().unwrap();

        let metric = metric.expect("metric should arrive");
        assert_eq!(metric.name, "RX_BYTES");
        assert_eq!(metric.value, Value::Int(40));
        assert_eq!(metric.sender, "Mock.a");
    }
}
