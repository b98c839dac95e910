// SPDX-License-Identifier: Apache-2.0 OR MIT

//! CHIRP service discovery.
//!
//! The manager keeps a table of services this process offers and a table of
//! services discovered from peers. A background thread answers REQUEST
//! messages with matching OFFERs, installs and retires discovered services,
//! and enqueues registered callbacks on the task queue so the receive loop
//! never blocks on user code.

mod beacon;

pub use beacon::{
    ChirpBeacon, ChirpMessage, ChirpMessageType, ServiceId, CHIRP_MULTICAST_ADDRESS, CHIRP_PORT,
};

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::Sender;
use parking_lot::Mutex;

use crate::error::ChirpError;
use crate::identity::Uuid;
use crate::transport::interface_addresses;

/// A task enqueued for the single task-handler worker.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Callback invoked when a matching service is discovered or departs.
pub type ChirpCallback = Arc<dyn Fn(DiscoveredService) + Send + Sync + 'static>;

/// A service discovered from a peer.
///
/// Identity is `(host_uuid, service)`: a differing port for the same key
/// means the remote endpoint was replaced.
#[derive(Debug, Clone)]
pub struct DiscoveredService {
    pub host_uuid: Uuid,
    pub service: ServiceId,
    pub address: IpAddr,
    pub port: u16,
    pub alive: bool,
}

impl DiscoveredService {
    fn from_message(msg: &ChirpMessage) -> Option<DiscoveredService> {
        Some(DiscoveredService {
            host_uuid: msg.host_uuid,
            service: msg.service,
            address: msg.from_address?,
            port: msg.port,
            alive: true,
        })
    }

    /// ZeroMQ endpoint string for this service.
    pub fn endpoint(&self) -> String {
        format!("tcp://{}:{}", self.address, self.port)
    }
}

impl PartialEq for DiscoveredService {
    fn eq(&self, other: &Self) -> bool {
        self.host_uuid == other.host_uuid && self.service == other.service
    }
}

impl Eq for DiscoveredService {}

struct ChirpShared {
    beacon: ChirpBeacon,
    offered: Mutex<HashMap<u16, ServiceId>>,
    discovered: Mutex<Vec<DiscoveredService>>,
    callbacks: Mutex<HashMap<ServiceId, ChirpCallback>>,
    tasks: Sender<Task>,
}

impl ChirpShared {
    /// Send OFFER datagrams for all offered services matching `service`.
    fn emit_offers(&self, service: Option<ServiceId>) -> Result<(), ChirpError> {
        let offered = self.offered.lock().clone();
        for (port, sid) in offered {
            if service.is_none() || service == Some(sid) {
                log::debug!("[chirp] sending service OFFER: {} for {}", port, sid.name());
                self.beacon.emit(sid, ChirpMessageType::Offer, port)?;
            }
        }
        Ok(())
    }

    /// Send DEPART datagrams for all offered services.
    fn emit_depart(&self) -> Result<(), ChirpError> {
        let offered = self.offered.lock().clone();
        for (port, sid) in offered {
            log::debug!("[chirp] sending service DEPART on {} for {}", port, sid.name());
            self.beacon.emit(sid, ChirpMessageType::Depart, port)?;
        }
        Ok(())
    }

    fn enqueue_callback(&self, service: DiscoveredService) {
        let callback = self.callbacks.lock().get(&service.service).cloned();
        match callback {
            Some(callback) => {
                if self.tasks.send(Box::new(move || callback(service))).is_err() {
                    log::debug!("[chirp] task queue closed, dropping callback");
                }
            }
            None => {
                log::debug!("[chirp] no callback for service {} set up", service.service.name());
            }
        }
    }

    /// Install a newly offered service, replacing a stale entry if the port
    /// changed for the same `(host, service)` key.
    fn discover_service(&self, msg: &ChirpMessage) {
        let Some(service) = DiscoveredService::from_message(msg) else {
            return;
        };
        let mut replaced = None;
        {
            let mut discovered = self.discovered.lock();
            if let Some(pos) = discovered.iter().position(|known| *known == service) {
                if discovered[pos].port == service.port {
                    log::debug!(
                        "[chirp] service already discovered: {} on {}:{}",
                        service.service.name(),
                        service.address,
                        service.port
                    );
                    return;
                }
                // Assume the old endpoint is dead.
                log::warn!(
                    "[chirp] {} has new port {} for {} service, assuming service has been replaced",
                    msg.host_uuid,
                    msg.port,
                    service.service.name()
                );
                let mut old = discovered.remove(pos);
                old.alive = false;
                replaced = Some(old);
            }
            discovered.push(service.clone());
        }
        if let Some(old) = replaced {
            self.enqueue_callback(old);
        }
        log::debug!(
            "[chirp] received new OFFER for service: {} on {}:{}",
            service.service.name(),
            service.address,
            service.port
        );
        self.enqueue_callback(service);
    }

    /// Remove a departed service and notify via callback.
    fn depart_service(&self, msg: &ChirpMessage) {
        let mut discovered = self.discovered.lock();
        let pos = discovered
            .iter()
            .position(|known| known.host_uuid == msg.host_uuid && known.service == msg.service);
        match pos {
            Some(pos) => {
                let mut service = discovered.remove(pos);
                drop(discovered);
                log::debug!(
                    "[chirp] received DEPART for service {} on {}: removed",
                    msg.service.name(),
                    service.address
                );
                service.alive = false;
                self.enqueue_callback(service);
            }
            None => {
                log::debug!(
                    "[chirp] received DEPART for service {}: not in use",
                    msg.service.name()
                );
            }
        }
    }
}

/// Manages service discovery and multicast messaging via CHIRP.
pub struct ChirpManager {
    shared: Arc<ChirpShared>,
    stop: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ChirpManager {
    /// Open the multicast beacon for `name` in `group`.
    ///
    /// Discovery and depart callbacks are enqueued on `tasks` and must be
    /// drained by a task-handler loop.
    pub fn new(
        name: &str,
        group: &str,
        interfaces: Option<&[String]>,
        tasks: Sender<Task>,
    ) -> Result<ChirpManager, ChirpError> {
        let addresses = interface_addresses(interfaces)?;
        log::info!("[chirp] using interface addresses {addresses:?}");
        let beacon = ChirpBeacon::new(name, group, &addresses)?;
        Ok(ChirpManager {
            shared: Arc::new(ChirpShared {
                beacon,
                offered: Mutex::new(HashMap::new()),
                discovered: Mutex::new(Vec::new()),
                callbacks: Mutex::new(HashMap::new()),
                tasks,
            }),
            stop: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
        })
    }

    pub fn host_uuid(&self) -> Uuid {
        self.shared.beacon.host_uuid()
    }

    /// Register a service this process offers, replacing any registration
    /// with the same port.
    pub fn register_offer(&self, service: ServiceId, port: u16) {
        let mut offered = self.shared.offered.lock();
        if offered.insert(port, service).is_some() {
            log::warn!("[chirp] replacing service registration for port {port}");
        }
    }

    /// Register a callback for discovered services of the given identifier.
    ///
    /// Already-known services produce one immediate callback each.
    pub fn register_request(&self, service: ServiceId, callback: ChirpCallback) {
        {
            let mut callbacks = self.shared.callbacks.lock();
            if callbacks.insert(service, callback).is_some() {
                log::warn!("[chirp] overwriting CHIRP callback for {}", service.name());
            }
        }
        for known in self.get_discovered(service) {
            self.shared.enqueue_callback(known);
        }
    }

    /// Send a REQUEST for the given service.
    pub fn request(&self, service: ServiceId) -> Result<(), ChirpError> {
        if !self.shared.callbacks.lock().contains_key(&service) {
            log::debug!(
                "[chirp] emitted REQUEST for {} does not have a registered callback",
                service.name()
            );
        }
        self.shared.beacon.emit(service, ChirpMessageType::Request, 0)
    }

    /// Send OFFERs for registered services; `None` selects all.
    pub fn emit_offers(&self, service: Option<ServiceId>) -> Result<(), ChirpError> {
        self.shared.emit_offers(service)
    }

    /// Send DEPART for every offered service.
    pub fn emit_depart(&self) -> Result<(), ChirpError> {
        self.shared.emit_depart()
    }

    /// Already discovered services for a given identifier.
    pub fn get_discovered(&self, service: ServiceId) -> Vec<DiscoveredService> {
        self.shared
            .discovered
            .lock()
            .iter()
            .filter(|s| s.service == service)
            .cloned()
            .collect()
    }

    /// Start the background receive/dispatch thread.
    pub fn start(&self) {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            return;
        }
        let shared = Arc::clone(&self.shared);
        let stop = Arc::clone(&self.stop);
        *handle = Some(thread::spawn(move || listen_loop(&shared, &stop)));
    }

    /// Stop the background thread; it emits DEPART on the way out.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                log::error!("[chirp] listener thread panicked");
            }
        }
    }
}

impl Drop for ChirpManager {
    fn drop(&mut self) {
        self.stop();
    }
}

fn listen_loop(shared: &ChirpShared, stop: &AtomicBool) {
    while !stop.load(Ordering::Relaxed) {
        let msg = match shared.beacon.listen() {
            Ok(Some(msg)) => msg,
            Ok(None) => continue,
            Err(e) => {
                log::warn!("[chirp] {e}");
                continue;
            }
        };

        log::trace!(
            "[chirp] received {:?} for {} from {:?}",
            msg.msgtype,
            msg.service.name(),
            msg.from_address
        );

        match msg.msgtype {
            ChirpMessageType::Request => {
                // Wait a short moment to spread out responses somewhat.
                let jitter = std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .map(|d| u64::from(d.subsec_nanos()) % 200)
                    .unwrap_or(100);
                thread::sleep(Duration::from_millis(jitter));
                if let Err(e) = shared.emit_offers(Some(msg.service)) {
                    log::warn!("[chirp] failed to answer REQUEST: {e}");
                }
            }
            ChirpMessageType::Offer => shared.discover_service(&msg),
            ChirpMessageType::Depart if msg.port != 0 => shared.depart_service(&msg),
            _ => {}
        }
    }

    // Shutdown: announce departure and give the buffers a moment to flush.
    log::debug!("[chirp] manager thread shutting down");
    if let Err(e) = shared.emit_depart() {
        log::warn!("[chirp] failed to emit DEPART: {e}");
    }
    thread::sleep(Duration::from_millis(500));
}
