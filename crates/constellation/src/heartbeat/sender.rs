// SPDX-License-Identifier: Apache-2.0 OR MIT

//! CHP heartbeat sender.
//!
//! Publishes the satellite state via XPUB at an adaptive period: with no
//! subscribers the period stays short, with many it backs off towards the
//! configured default. A finished state transition triggers an immediate
//! out-of-schedule heartbeat (extrasystole). The interval announced to
//! receivers is padded by 10% so they can size their deadlines.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;

use crate::fsm::SatelliteFsm;
use crate::protocol::chp::{ChpFlags, ChpMessage, ChpRole};

/// Default heartbeat period with a full subscriber load.
pub const DEFAULT_HEARTBEAT_PERIOD_MS: u64 = 60_000;

/// Granularity of the send loop.
const LOOP_GRANULARITY: Duration = Duration::from_millis(100);

pub struct HeartbeatSender {
    name: String,
    socket: zmq::Socket,
    fsm: Arc<SatelliteFsm>,
    role: Arc<Mutex<ChpRole>>,
    default_period_ms: u64,
    period_ms: u64,
    subscribers: i64,
}

impl HeartbeatSender {
    /// Wrap a bound XPUB socket.
    ///
    /// The socket must have verbose subscription passing enabled so that
    /// every subscribe/unsubscribe frame reaches the counter.
    pub fn new(
        name: impl Into<String>,
        socket: zmq::Socket,
        fsm: Arc<SatelliteFsm>,
        role: Arc<Mutex<ChpRole>>,
        default_period_ms: u64,
    ) -> HeartbeatSender {
        HeartbeatSender {
            name: name.into(),
            socket,
            fsm,
            role,
            default_period_ms,
            period_ms: 500,
            subscribers: 0,
        }
    }

    /// Send loop; returns when `stop` is set.
    pub fn run(&mut self, stop: &AtomicBool) {
        log::info!("[chp] starting heartbeat sender");
        let mut last = Instant::now();
        while !stop.load(Ordering::Relaxed) {
            let transitioned = self.fsm.take_transitioned();
            if last.elapsed() < Duration::from_millis(self.period_ms) && !transitioned {
                thread::sleep(LOOP_GRANULARITY);
                continue;
            }

            self.update_subscribers();
            self.period_ms = adaptive_period(self.default_period_ms, self.subscribers);
            log::trace!(
                "[chp] sending heartbeat, current period {} ms with {} subscribers",
                self.period_ms,
                self.subscribers
            );

            last = Instant::now();
            if let Err(e) = self.send_heartbeat(transitioned) {
                log::warn!("[chp] failed to send heartbeat: {e}");
            }
        }
        log::info!("[chp] heartbeat sender shutting down");
    }

    /// Drain XPUB subscription frames into the subscriber counter.
    fn update_subscribers(&mut self) {
        loop {
            match self.socket.recv_bytes(zmq::DONTWAIT) {
                Ok(frame) => {
                    if frame.first() == Some(&0x01) {
                        self.subscribers += 1;
                    } else {
                        self.subscribers -= 1;
                    }
                }
                Err(_) => break,
            }
        }
        self.subscribers = self.subscribers.max(0);
    }

    fn send_heartbeat(&self, extrasystole: bool) -> Result<(), zmq::Error> {
        let mut flags = self.role.lock().flags();
        if extrasystole {
            flags = flags | ChpFlags::IS_EXTRASYSTOLE;
        }
        let msg = ChpMessage {
            sender: self.name.clone(),
            time: Utc::now(),
            state: self.fsm.state(),
            flags,
            // Padded so receivers can size their deadlines.
            interval_ms: self.period_ms + self.period_ms / 10,
            status: extrasystole.then(|| self.fsm.status()),
        };
        self.socket.send_multipart(msg.assemble(), 0)
    }
}

/// `min(default, default · (0.01 · subscribers)² + 500 ms)`.
fn adaptive_period(default_ms: u64, subscribers: i64) -> u64 {
    let factor = 0.01 * subscribers as f64;
    let scaled = (default_ms as f64 * factor * factor) as u64 + 500;
    scaled.min(default_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adaptive_period_grows_with_subscribers() {
        assert_eq!(adaptive_period(60_000, 0), 500);
        assert_eq!(adaptive_period(60_000, 1), 506);
        assert!(adaptive_period(60_000, 50) > adaptive_period(60_000, 10));
        // Saturates at the default period.
        assert_eq!(adaptive_period(60_000, 1000), 60_000);
    }

    #[test]
    fn extrasystole_follows_transition_latch() {
        let ctx = zmq::Context::new();
        let xpub = ctx.socket(zmq::XPUB).unwrap();
        xpub.set_xpub_verbose(true).unwrap();
        let port = crate::transport::bind_tcp(&xpub, 0).unwrap();

        let sub = ctx.socket(zmq::SUB).unwrap();
        sub.connect(&format!("tcp://127.0.0.1:{port}")).unwrap();
        sub.set_subscribe(b"").unwrap();
        sub.set_rcvtimeo(2000).unwrap();

        let fsm = Arc::new(SatelliteFsm::new());
        let role = Arc::new(Mutex::new(ChpRole::Dynamic));
        let mut sender = HeartbeatSender::new(
            "Mock.a",
            xpub,
            Arc::clone(&fsm),
            role,
            DEFAULT_HEARTBEAT_PERIOD_MS,
        );

        let stop = Arc::new(AtomicBool::new(false));
        let stop_thread = Arc::clone(&stop);
        let handle = thread::spawn(move || sender.run(&stop_thread));

        // The first regular heartbeat carries no extrasystole flag.
        let frames = sub.recv_multipart(0).expect("first heartbeat");
        let first = ChpMessage::disassemble(&frames).unwrap();
        assert!(!first.flags.contains(ChpFlags::IS_EXTRASYSTOLE));

        // A state change produces an extrasystole within one granularity tick.
        fsm.react(crate::fsm::Transition::Initialize, "Initializing")
            .unwrap();
        let mut saw_extrasystole = false;
        for _ in 0..10 {
            let Ok(frames) = sub.recv_multipart(0) else { break };
            let msg = ChpMessage::disassemble(&frames).unwrap();
            if msg.flags.contains(ChpFlags::IS_EXTRASYSTOLE) {
                assert_eq!(msg.state, crate::fsm::SatelliteState::Initializing);
                assert!(msg.status.is_some());
                saw_extrasystole = true;
                break;
            }
        }
        assert!(saw_extrasystole, "extrasystole expected after state change");

        stop.store(true, Ordering::Relaxed);
        handle.join().unwrap();
    }
}
