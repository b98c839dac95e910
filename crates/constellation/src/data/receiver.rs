// SPDX-License-Identifier: Apache-2.0 OR MIT

//! CDTP receiver.
//!
//! Opens one PULL socket per discovered DATA service and multiplexes them
//! on a single poll loop. Per sender the BOR/DATA/EOR framing is
//! reconstructed; senders with a BOR but no EOR yet are "active". When the
//! run stops the receiver keeps polling until every active sender has
//! delivered its EOR or the timeout expires, extending the deadline while
//! traffic still arrives.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::chirp::DiscoveredService;
use crate::config::Configuration;
use crate::error::{DataError, SatelliteError};
use crate::identity::Uuid;
use crate::protocol::cdtp2::{Cdtp2Message, CdtpMessageType, DataRecord};
use crate::protocol::value::Map;

/// Poll deadline of the receive loop.
const POLL_TIMEOUT_MS: i64 = 250;

/// User callbacks invoked from the pull thread, one sender at a time.
pub struct DataCallbacks {
    /// Begin-of-run: sender, user tags, sent configuration.
    pub on_bor: Box<dyn Fn(&str, &Map, Configuration) -> Result<(), SatelliteError> + Send>,
    /// One data record.
    pub on_data: Box<dyn Fn(&str, DataRecord) -> Result<(), SatelliteError> + Send>,
    /// End-of-run: sender, user tags, run metadata.
    pub on_eor: Box<dyn Fn(&str, &Map, &Map) -> Result<(), SatelliteError> + Send>,
}

struct RxSlot {
    host: Uuid,
    socket: zmq::Socket,
    /// Canonical name, learned from the first message.
    name: Option<String>,
    bor_seen: bool,
}

struct RxShared {
    slots: Mutex<Vec<RxSlot>>,
    /// Senders with BOR received but EOR outstanding.
    active: Mutex<BTreeSet<String>>,
    bytes_received: Arc<AtomicU64>,
    callbacks: Mutex<DataCallbacks>,
    fault: Mutex<Option<SatelliteError>>,
    last_message: Mutex<Instant>,
}

/// Pull-side of a CDTP data stream, multiplexing all connected senders.
pub struct DataReceiver {
    context: zmq::Context,
    shared: Arc<RxShared>,
    /// Accepted sender names, or `None` for all.
    data_transmitters: Option<BTreeSet<String>>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl DataReceiver {
    pub fn new(
        context: zmq::Context,
        callbacks: DataCallbacks,
        data_transmitters: Option<BTreeSet<String>>,
    ) -> DataReceiver {
        DataReceiver {
            context,
            shared: Arc::new(RxShared {
                slots: Mutex::new(Vec::new()),
                active: Mutex::new(BTreeSet::new()),
                bytes_received: Arc::new(AtomicU64::new(0)),
                callbacks: Mutex::new(callbacks),
                fault: Mutex::new(None),
                last_message: Mutex::new(Instant::now()),
            }),
            data_transmitters,
            stop: Arc::new(AtomicBool::new(false)),
            handle: None,
        }
    }

    /// The configured sender restriction, if any.
    pub fn data_transmitters(&self) -> Option<&BTreeSet<String>> {
        self.data_transmitters.as_ref()
    }

    /// Monotonic counter of payload bytes received.
    pub fn bytes_received(&self) -> u64 {
        self.shared.bytes_received.load(Ordering::Acquire)
    }

    pub fn bytes_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.shared.bytes_received)
    }

    pub fn running(&self) -> bool {
        self.handle.is_some()
    }

    /// Connect to a discovered DATA service.
    ///
    /// With a sender restriction in place, services not named in the set
    /// are ignored.
    pub fn add_sender(&self, service: &DiscoveredService) -> Result<(), SatelliteError> {
        if let Some(accepted) = &self.data_transmitters {
            let allowed = accepted
                .iter()
                .any(|name| Uuid::from_name(name) == service.host_uuid);
            if !allowed {
                log::debug!(
                    "[cdtp] ignoring data service from non-accepted sender {}",
                    service.host_uuid
                );
                return Ok(());
            }
        }
        let mut slots = self.shared.slots.lock();
        if slots.iter().any(|slot| slot.host == service.host_uuid) {
            return Ok(());
        }
        let socket = self.context.socket(zmq::PULL)?;
        socket.connect(&service.endpoint())?;
        log::info!("[cdtp] connected to data service at {}", service.endpoint());
        slots.push(RxSlot {
            host: service.host_uuid,
            socket,
            name: None,
            bor_seen: false,
        });
        Ok(())
    }

    /// Disconnect a departed DATA service.
    pub fn remove_sender(&self, service: &DiscoveredService) {
        let mut slots = self.shared.slots.lock();
        if let Some(pos) = slots.iter().position(|slot| slot.host == service.host_uuid) {
            let slot = slots.remove(pos);
            log::info!(
                "[cdtp] disconnected data service of {}",
                slot.name.as_deref().unwrap_or("<unknown>")
            );
        }
    }

    /// Names of the senders a named restriction still misses.
    pub fn missing_senders(&self) -> Vec<String> {
        let Some(accepted) = &self.data_transmitters else {
            return Vec::new();
        };
        let slots = self.shared.slots.lock();
        accepted
            .iter()
            .filter(|name| {
                let uuid = Uuid::from_name(name);
                !slots.iter().any(|slot| slot.host == uuid)
            })
            .cloned()
            .collect()
    }

    /// Start the pull thread.
    pub fn start_receiving(&mut self) {
        if self.handle.is_some() {
            return;
        }
        self.stop.store(false, Ordering::Release);
        *self.shared.fault.lock() = None;
        self.shared.active.lock().clear();
        *self.shared.last_message.lock() = Instant::now();
        let shared = Arc::clone(&self.shared);
        let stop = Arc::clone(&self.stop);
        self.handle = Some(thread::spawn(move || pull_loop(&shared, &stop)));
    }

    /// Stop after waiting up to `eor_timeout` for outstanding EORs.
    ///
    /// The deadline extends while messages keep arriving. On expiry the
    /// pending senders are reported in the error; the pull thread is
    /// stopped either way.
    pub fn stop_receiving(&mut self, eor_timeout: Duration) -> Result<(), DataError> {
        let deadline = Instant::now() + eor_timeout;
        let pending = loop {
            let pending = self.shared.active.lock().clone();
            if pending.is_empty() {
                break pending;
            }
            let last_message = *self.shared.last_message.lock();
            let deadline = deadline.max(last_message + eor_timeout);
            if Instant::now() > deadline {
                break pending;
            }
            thread::sleep(Duration::from_millis(50));
        };
        self.stop_pull_thread();
        if pending.is_empty() {
            Ok(())
        } else {
            let names = pending.into_iter().collect::<Vec<_>>().join(", ");
            log::warn!("[cdtp] EOR timeout, still waiting for: {names}");
            Err(DataError::EorTimeout(names))
        }
    }

    /// Stop the pull thread without flushing (failure path).
    pub fn stop_pull_thread(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("[cdtp] pull thread panicked");
            }
        }
    }

    /// Rethrow a fault latched by the pull thread.
    pub fn check_exception(&self) -> Result<(), SatelliteError> {
        match self.shared.fault.lock().take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Drop for DataReceiver {
    fn drop(&mut self) {
        self.stop_pull_thread();
    }
}

fn pull_loop(shared: &RxShared, stop: &AtomicBool) {
    log::debug!("[cdtp] pull thread started");
    while !stop.load(Ordering::Relaxed) {
        let mut slots = shared.slots.lock();
        if slots.is_empty() {
            drop(slots);
            thread::sleep(Duration::from_millis(50));
            continue;
        }

        let ready: Vec<usize> = {
            let mut items: Vec<zmq::PollItem<'_>> = slots
                .iter()
                .map(|slot| slot.socket.as_poll_item(zmq::POLLIN))
                .collect();
            match zmq::poll(&mut items, POLL_TIMEOUT_MS) {
                Ok(_) => items
                    .iter()
                    .enumerate()
                    .filter(|(_, item)| item.is_readable())
                    .map(|(idx, _)| idx)
                    .collect(),
                Err(e) => {
                    log::warn!("[cdtp] poll failed: {e}");
                    Vec::new()
                }
            }
        };

        for idx in ready {
            let frames = match slots[idx].socket.recv_multipart(zmq::DONTWAIT) {
                Ok(frames) => frames,
                Err(zmq::Error::EAGAIN) => continue,
                Err(e) => {
                    log::warn!("[cdtp] receive failed: {e}");
                    continue;
                }
            };
            let msg = match Cdtp2Message::disassemble(&frames) {
                Ok(msg) => msg,
                Err(e) => {
                    log::warn!("[cdtp] discarding undecodable message: {e}");
                    continue;
                }
            };
            *shared.last_message.lock() = Instant::now();
            shared
                .bytes_received
                .fetch_add(msg.payload_bytes() as u64, Ordering::AcqRel);
            if let Err(e) = handle_message(shared, &mut slots[idx], msg) {
                log::error!("[cdtp] handling message failed: {e}");
                *shared.fault.lock() = Some(e);
                return;
            }
        }
    }
    log::debug!("[cdtp] pull thread finished");
}

fn handle_message(
    shared: &RxShared,
    slot: &mut RxSlot,
    msg: Cdtp2Message,
) -> Result<(), SatelliteError> {
    let sender = msg.sender.clone();
    slot.name = Some(sender.clone());
    let callbacks = shared.callbacks.lock();

    match msg.msg_type {
        CdtpMessageType::Bor => {
            let (user_tags, configuration) = msg
                .marker_tags()
                .map_err(|e| SatelliteError::Failed(e.to_string()))?;
            let configuration = Configuration::try_from_map(configuration.clone())?;
            (callbacks.on_bor)(&sender, user_tags, configuration)?;
            slot.bor_seen = true;
            shared.active.lock().insert(sender);
        }
        CdtpMessageType::Data => {
            if !slot.bor_seen {
                // Late-joiner policy: accept the stream anyway.
                log::warn!("[cdtp] received DATA from {sender} before BOR");
                slot.bor_seen = true;
                shared.active.lock().insert(sender.clone());
            }
            for record in msg.into_records() {
                (callbacks.on_data)(&sender, record)?;
            }
        }
        CdtpMessageType::Eor => {
            let (user_tags, metadata) = msg
                .marker_tags()
                .map_err(|e| SatelliteError::Failed(e.to_string()))?;
            (callbacks.on_eor)(&sender, user_tags, metadata)?;
            slot.bor_seen = false;
            shared.active.lock().remove(&sender);
        }
    }
    Ok(())
}
