// SPDX-License-Identifier: Apache-2.0 OR MIT

//! CHP heartbeat checker.
//!
//! Subscribes to the heartbeat service of each registered peer and keeps a
//! per-peer book of record: remaining lives, announced interval, time of
//! the last refresh, last state and role. A single poll loop reads all
//! subscriptions; a 300 ms sweep decrements lives of stale peers. Faults
//! invoke the interrupt callback exactly once per failure episode.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::SatelliteError;
use crate::fsm::SatelliteState;
use crate::identity::Uuid;
use crate::protocol::chp::{ChpFlags, ChpMessage, ChpRole};

/// Lives granted to a peer on registration and on every heartbeat.
pub const HB_INIT_LIVES: u8 = 3;
/// Interval assumed before the first heartbeat arrives.
pub const HB_INIT_INTERVAL_MS: u64 = 2000;
/// Cadence of the stale-connection sweep.
const CHECK_INTERVAL: Duration = Duration::from_millis(300);

/// Callback invoked when a peer faults: canonical name and observed state.
pub type InterruptCallback = Box<dyn Fn(&str, SatelliteState) + Send + Sync + 'static>;

struct PeerState {
    host: Uuid,
    name: String,
    role: ChpRole,
    lives: u8,
    interval_ms: u64,
    last_refresh: Instant,
    state: SatelliteState,
    failed: bool,
}

struct PeerSlot {
    socket: zmq::Socket,
    state: PeerState,
}

#[derive(Default)]
struct CheckerShared {
    slots: Mutex<Vec<PeerSlot>>,
    callback: Mutex<Option<InterruptCallback>>,
}

impl CheckerShared {
    fn interrupting(&self, name: &str, state: SatelliteState) {
        let callback = self.callback.lock();
        if let Some(callback) = callback.as_ref() {
            callback(name, state);
        }
    }
}

/// Checks peers' state via subscription to their heartbeats.
pub struct HeartbeatChecker {
    context: zmq::Context,
    shared: Arc<CheckerShared>,
    stop: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl HeartbeatChecker {
    pub fn new(context: zmq::Context) -> HeartbeatChecker {
        HeartbeatChecker {
            context,
            shared: Arc::new(CheckerShared::default()),
            stop: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
        }
    }

    /// Install the callback invoked on peer faults.
    pub fn register_callback(&self, callback: InterruptCallback) {
        *self.shared.callback.lock() = Some(callback);
    }

    /// Register a heartbeat check for a peer, replacing any previous
    /// registration for the same host.
    pub fn register(
        &self,
        host: Uuid,
        endpoint: &str,
        name: &str,
    ) -> Result<(), SatelliteError> {
        if self.is_registered(host) {
            log::warn!("[chp] heartbeating for {name} already registered, replacing connection");
            self.unregister(host);
        }

        let socket = match self.context.socket(zmq::SUB) {
            Ok(socket) => socket,
            Err(zmq::Error::EMFILE) => {
                log::error!(
                    "[chp] system reports too many open files: cannot open further connections. \
                     Consider raising the OS limit, e.g. via `ulimit -n` on Linux."
                );
                return Err(SatelliteError::Socket(zmq::Error::EMFILE));
            }
            Err(e) => return Err(SatelliteError::Socket(e)),
        };
        socket.connect(endpoint)?;
        socket.set_subscribe(b"")?;

        self.shared.slots.lock().push(PeerSlot {
            socket,
            state: PeerState {
                host,
                name: name.to_owned(),
                role: ChpRole::default(),
                lives: HB_INIT_LIVES,
                interval_ms: HB_INIT_INTERVAL_MS,
                last_refresh: Instant::now(),
                state: SatelliteState::New,
                failed: false,
            },
        });
        log::info!("[chp] registered heartbeating check for {endpoint}");
        Ok(())
    }

    /// Unregister a peer. Peers whose role denies departure trigger the
    /// interrupt callback with DEAD.
    pub fn unregister(&self, host: Uuid) {
        let removed = {
            let mut slots = self.shared.slots.lock();
            slots
                .iter()
                .position(|slot| slot.state.host == host)
                .map(|pos| slots.remove(pos))
        };
        let Some(slot) = removed else { return };
        log::info!("[chp] removed heartbeat check for {}", slot.state.name);
        if slot.state.role.requires(ChpFlags::DENY_DEPARTURE) {
            log::info!(
                "[chp] {} departure causing interrupt callback to be called",
                slot.state.name
            );
            self.shared
                .interrupting(&slot.state.name, SatelliteState::Dead);
        }
    }

    pub fn is_registered(&self, host: Uuid) -> bool {
        self.shared
            .slots
            .lock()
            .iter()
            .any(|slot| slot.state.host == host)
    }

    /// Last known state per monitored peer.
    pub fn states(&self) -> HashMap<String, SatelliteState> {
        self.shared
            .slots
            .lock()
            .iter()
            .map(|slot| (slot.state.name.clone(), slot.state.state))
            .collect()
    }

    /// Names of all peers currently marked failed.
    pub fn failed(&self) -> Vec<String> {
        self.shared
            .slots
            .lock()
            .iter()
            .filter(|slot| slot.state.failed)
            .map(|slot| slot.state.name.clone())
            .collect()
    }

    /// Start the poll loop.
    pub fn start(&self) {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            return;
        }
        self.stop.store(false, Ordering::Relaxed);
        let shared = Arc::clone(&self.shared);
        let stop = Arc::clone(&self.stop);
        *handle = Some(thread::spawn(move || check_loop(&shared, &stop)));
    }

    /// Stop the poll loop and close all subscriptions.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                log::error!("[chp] checker thread panicked");
            }
        }
        self.shared.slots.lock().clear();
    }
}

impl Drop for HeartbeatChecker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn check_loop(shared: &CheckerShared, stop: &AtomicBool) {
    log::info!("[chp] starting heartbeat check loop");
    let mut last_check = Instant::now();

    while !stop.load(Ordering::Relaxed) {
        // Faults are collected under the lock and reported after releasing
        // it, as the callback may register or unregister peers itself.
        let mut faults: Vec<(String, SatelliteState)> = Vec::new();

        {
            let mut slots = shared.slots.lock();
            if slots.is_empty() {
                drop(slots);
                thread::sleep(Duration::from_millis(50));
            } else {
                let ready: Vec<usize> = {
                    let mut items: Vec<zmq::PollItem<'_>> = slots
                        .iter()
                        .map(|slot| slot.socket.as_poll_item(zmq::POLLIN))
                        .collect();
                    match zmq::poll(&mut items, 50) {
                        Ok(_) => items
                            .iter()
                            .enumerate()
                            .filter(|(_, item)| item.is_readable())
                            .map(|(idx, _)| idx)
                            .collect(),
                        Err(e) => {
                            log::warn!("[chp] poll failed: {e}");
                            Vec::new()
                        }
                    }
                };

                for idx in ready {
                    let frames = match slots[idx].socket.recv_multipart(zmq::DONTWAIT) {
                        Ok(frames) => frames,
                        Err(zmq::Error::EAGAIN) => continue,
                        Err(e) => {
                            log::warn!("[chp] receive failed: {e}");
                            continue;
                        }
                    };
                    let msg = match ChpMessage::disassemble(&frames) {
                        Ok(msg) => msg,
                        Err(e) => {
                            log::warn!("[chp] discarding malformed heartbeat: {e}");
                            continue;
                        }
                    };
                    receive_heartbeat(&mut slots[idx].state, &msg, &mut faults);
                }
            }
        }

        // Regularly check for stale connections and missed heartbeats.
        if last_check.elapsed() > CHECK_INTERVAL {
            let mut slots = shared.slots.lock();
            for slot in slots.iter_mut() {
                check_liveness(&mut slot.state, &mut faults);
            }
            drop(slots);
            last_check = Instant::now();
        }

        for (name, state) in faults {
            shared.interrupting(&name, state);
        }
    }
    log::info!("[chp] heartbeat check loop shutting down");
}

fn receive_heartbeat(
    peer: &mut PeerState,
    msg: &ChpMessage,
    faults: &mut Vec<(String, SatelliteState)>,
) {
    log::debug!(
        "[chp] received heartbeat from {}, state {}, next in {} ms",
        msg.sender,
        msg.state.name(),
        msg.interval_ms
    );
    peer.name = msg.sender.clone();
    peer.last_refresh = Instant::now();
    peer.state = msg.state;
    peer.interval_ms = msg.interval_ms.max(1);
    peer.role = ChpRole::from_flags(msg.flags);
    if peer.lives != HB_INIT_LIVES {
        log::trace!("[chp] {} had {} lives left, refreshing", peer.name, peer.lives);
    }
    peer.lives = HB_INIT_LIVES;

    let fault_state = matches!(
        peer.state,
        SatelliteState::Error | SatelliteState::Safe | SatelliteState::Dead
    );
    if fault_state && msg.flags.contains(ChpFlags::TRIGGER_INTERRUPT) {
        if !peer.failed {
            log::info!("[chp] {} state causing interrupt callback to be called", peer.name);
            peer.failed = true;
            faults.push((peer.name.clone(), peer.state));
        }
    } else if peer.failed {
        // Peer recovered, clear the failed flag.
        peer.failed = false;
    }
}

fn check_liveness(peer: &mut PeerState, faults: &mut Vec<(String, SatelliteState)>) {
    let stale = peer.last_refresh.elapsed()
        > Duration::from_millis(peer.interval_ms + peer.interval_ms / 2);
    if !stale || peer.failed {
        return;
    }
    peer.lives = peer.lives.saturating_sub(1);
    log::debug!(
        "[chp] missed heartbeat from {}, reduced lives to {}",
        peer.name,
        peer.lives
    );
    if peer.lives == 0 && peer.role.requires(ChpFlags::TRIGGER_INTERRUPT) {
        log::info!(
            "[chp] {} unresponsive causing interrupt callback to be called",
            peer.name
        );
        peer.failed = true;
        peer.state = SatelliteState::Dead;
        faults.push((peer.name.clone(), SatelliteState::Dead));
    }
    // Back off until the next full interval either way.
    peer.last_refresh = Instant::now();
}
