// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Controller composition.
//!
//! A controller discovers CONTROL services via CHIRP, opens one CSCP
//! connection per satellite, subscribes a heartbeat check to every
//! HEARTBEAT service, and keeps an in-memory array mapping canonical names
//! to command links. The global constellation state is aggregated from the
//! per-peer heartbeat states.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use parking_lot::Mutex;

use crate::chirp::{ChirpManager, DiscoveredService, ServiceId, Task};
use crate::config::Configuration;
use crate::control::CommandTransmitter;
use crate::error::{CscpError, SatelliteError};
use crate::fsm::SatelliteState;
use crate::heartbeat::HeartbeatChecker;
use crate::identity::Uuid;
use crate::protocol::cscp1::{Cscp1Message, VerbType};
use crate::protocol::value::{Map, Value};

/// Reply deadline for requests to a single satellite.
const REQUEST_TIMEOUT_MS: i32 = 5000;

/// Aggregated state of the whole constellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    New,
    Init,
    Orbit,
    Run,
    Error,
    Transitioning,
}

/// One controlled satellite: command link plus its advertised commands.
pub struct SatelliteLink {
    pub canonical_name: String,
    pub class_name: String,
    pub uuid: Uuid,
    pub commands: Map,
    transmitter: CommandTransmitter,
}

impl SatelliteLink {
    /// Send a request to this satellite and await the typed reply.
    pub fn request(
        &self,
        command: &str,
        payload: Option<Value>,
    ) -> Result<Cscp1Message, CscpError> {
        self.transmitter.request_get_response(command, payload, None)
    }
}

/// Selects the recipients of a controller command.
#[derive(Debug, Clone)]
pub enum CommandTarget {
    /// One satellite by canonical name.
    Satellite(String),
    /// All satellites of one type.
    Class(String),
    /// Every connected satellite.
    All,
}

impl CommandTarget {
    fn matches(&self, link: &SatelliteLink) -> bool {
        match self {
            CommandTarget::Satellite(name) => link.canonical_name.eq_ignore_ascii_case(name),
            CommandTarget::Class(class) => link.class_name.eq_ignore_ascii_case(class),
            CommandTarget::All => true,
        }
    }
}

/// Layered run configuration dispatched to satellites: general values,
/// overridden per type, overridden per individual satellite.
#[derive(Debug, Clone, Default)]
pub struct RunConfiguration {
    global: Map,
    types: HashMap<String, Map>,
    satellites: HashMap<String, Map>,
}

impl RunConfiguration {
    pub fn new(global: Map) -> RunConfiguration {
        RunConfiguration {
            global,
            types: HashMap::new(),
            satellites: HashMap::new(),
        }
    }

    pub fn set_type_section(&mut self, class_name: &str, values: Map) {
        self.types.insert(class_name.to_lowercase(), values);
    }

    pub fn set_satellite_section(&mut self, canonical_name: &str, values: Map) {
        self.satellites.insert(canonical_name.to_lowercase(), values);
    }

    /// The flat view a single satellite receives.
    pub fn for_satellite(&self, class_name: &str, canonical_name: &str) -> Map {
        let mut flat = self.global.clone();
        if let Some(section) = self.types.get(&class_name.to_lowercase()) {
            merge_map(&mut flat, section);
        }
        if let Some(section) = self.satellites.get(&canonical_name.to_lowercase()) {
            merge_map(&mut flat, section);
        }
        flat
    }
}

/// Deep-merge `overlay` into `base`; scalar values are overwritten,
/// nested sections merged recursively.
fn merge_map(base: &mut Map, overlay: &Map) {
    for (key, value) in overlay {
        match (base.get_mut(key), value) {
            (Some(Value::Map(base_section)), Value::Map(overlay_section)) => {
                merge_map(base_section, overlay_section);
            }
            (slot, _) => {
                if let Some(slot) = slot {
                    *slot = value.clone();
                } else {
                    base.insert(key.clone(), value.clone());
                }
            }
        }
    }
}

struct ControllerShared {
    name: String,
    context: zmq::Context,
    links: Mutex<BTreeMap<String, SatelliteLink>>,
}

impl ControllerShared {
    /// Connect a newly discovered CONTROL service and fill the array.
    fn connect_satellite(&self, service: &DiscoveredService) {
        let socket = match self.context.socket(zmq::REQ) {
            Ok(socket) => socket,
            Err(zmq::Error::EMFILE) => {
                log::error!(
                    "[controller] system reports too many open files: cannot open further \
                     connections. Consider raising the OS limit, e.g. via `ulimit -n` on Linux."
                );
                return;
            }
            Err(e) => {
                log::error!("[controller] could not create socket: {e}");
                return;
            }
        };
        let endpoint = service.endpoint();
        if let Err(e) = socket
            .set_rcvtimeo(REQUEST_TIMEOUT_MS)
            .and_then(|()| socket.set_sndtimeo(REQUEST_TIMEOUT_MS))
            .and_then(|()| socket.set_linger(0))
            .and_then(|()| socket.connect(&endpoint))
        {
            log::error!("[controller] could not connect to {endpoint}: {e}");
            return;
        }
        let transmitter = CommandTransmitter::new(&self.name, socket);

        // Identify the peer and learn its command set.
        let canonical_name = match transmitter.request_get_response("get_name", None, None) {
            Ok(reply) if reply.verb == VerbType::Success => reply.verb_msg,
            Ok(reply) => {
                log::warn!("[controller] get_name rejected by {endpoint}: {}", reply.verb_msg);
                return;
            }
            Err(e) => {
                log::warn!("[controller] get_name failed for {endpoint}: {e}");
                return;
            }
        };
        let commands = match transmitter.request_get_response("get_commands", None, None) {
            Ok(reply) => match reply.payload {
                Some(Value::Map(commands)) => commands,
                _ => Map::new(),
            },
            Err(e) => {
                log::warn!("[controller] get_commands failed for {canonical_name}: {e}");
                Map::new()
            }
        };
        let class_name = canonical_name
            .split_once('.')
            .map_or(canonical_name.as_str(), |(class, _)| class)
            .to_owned();

        log::info!(
            "[controller] connected to {canonical_name} at {endpoint} ({} commands)",
            commands.len()
        );
        self.links.lock().insert(
            canonical_name.clone(),
            SatelliteLink {
                canonical_name,
                class_name,
                uuid: service.host_uuid,
                commands,
                transmitter,
            },
        );
    }

    fn disconnect_satellite(&self, service: &DiscoveredService) {
        let mut links = self.links.lock();
        let name = links
            .iter()
            .find(|(_, link)| link.uuid == service.host_uuid)
            .map(|(name, _)| name.clone());
        if let Some(name) = name {
            links.remove(&name);
            log::info!("[controller] satellite {name} departed");
        }
    }
}

/// A controller driving an array of satellites.
pub struct Controller {
    shared: Arc<ControllerShared>,
    chirp: Arc<ChirpManager>,
    checker: Arc<HeartbeatChecker>,
    tasks_rx: Receiver<Task>,
    task_thread: Option<JoinHandle<()>>,
    task_stop: Arc<std::sync::atomic::AtomicBool>,
}

impl Controller {
    /// Open the discovery beacon, subscribe the callbacks and start the
    /// background machinery.
    pub fn new(
        name: &str,
        group: &str,
        interfaces: Option<&[String]>,
    ) -> Result<Controller, SatelliteError> {
        let context = zmq::Context::new();
        let (tasks_tx, tasks_rx) = crossbeam_channel::unbounded::<Task>();

        let chirp = Arc::new(ChirpManager::new(name, group, interfaces, tasks_tx)?);
        let checker = Arc::new(HeartbeatChecker::new(context.clone()));
        let shared = Arc::new(ControllerShared {
            name: name.to_owned(),
            context,
            links: Mutex::new(BTreeMap::new()),
        });

        {
            let shared_cb = Arc::clone(&shared);
            chirp.register_request(
                ServiceId::Control,
                Arc::new(move |service: DiscoveredService| {
                    if service.alive {
                        shared_cb.connect_satellite(&service);
                    } else {
                        shared_cb.disconnect_satellite(&service);
                    }
                }),
            );
        }
        {
            let checker_cb = Arc::clone(&checker);
            chirp.register_request(
                ServiceId::Heartbeat,
                Arc::new(move |service: DiscoveredService| {
                    if service.alive {
                        let endpoint = service.endpoint();
                        if let Err(e) = checker_cb.register(
                            service.host_uuid,
                            &endpoint,
                            &service.host_uuid.to_string(),
                        ) {
                            log::error!("[controller] heartbeat registration failed: {e}");
                        }
                    } else {
                        checker_cb.unregister(service.host_uuid);
                    }
                }),
            );
        }

        chirp.start();
        checker.start();
        chirp.request(ServiceId::Control)?;
        chirp.request(ServiceId::Heartbeat)?;

        // Discovery callbacks execute sequentially on the task handler.
        let task_stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let task_thread = {
            let stop = Arc::clone(&task_stop);
            let tasks = tasks_rx.clone();
            Some(std::thread::spawn(move || {
                while !stop.load(std::sync::atomic::Ordering::Relaxed) {
                    match tasks.recv_timeout(Duration::from_millis(500)) {
                        Ok(task) => task(),
                        Err(RecvTimeoutError::Timeout) => {}
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            }))
        };

        Ok(Controller {
            shared,
            chirp,
            checker,
            tasks_rx,
            task_thread,
            task_stop,
        })
    }

    pub fn chirp(&self) -> &Arc<ChirpManager> {
        &self.chirp
    }

    /// Canonical names of all connected satellites.
    pub fn satellites(&self) -> Vec<String> {
        self.shared.links.lock().keys().cloned().collect()
    }

    /// Advertised command map of one satellite.
    pub fn commands_of(&self, canonical_name: &str) -> Option<Map> {
        self.shared
            .links
            .lock()
            .get(canonical_name)
            .map(|link| link.commands.clone())
    }

    /// Send a command to the selected targets and collect the replies.
    pub fn command(
        &self,
        target: &CommandTarget,
        command: &str,
        payload: Option<Value>,
    ) -> Vec<(String, Result<Cscp1Message, CscpError>)> {
        let links = self.shared.links.lock();
        links
            .values()
            .filter(|link| target.matches(link))
            .map(|link| {
                (
                    link.canonical_name.clone(),
                    link.request(command, payload.clone()),
                )
            })
            .collect()
    }

    /// Initialize the selected targets, flattening the layered run
    /// configuration to each recipient's view.
    pub fn initialize(
        &self,
        target: &CommandTarget,
        config: &RunConfiguration,
    ) -> Vec<(String, Result<Cscp1Message, CscpError>)> {
        let links = self.shared.links.lock();
        links
            .values()
            .filter(|link| target.matches(link))
            .map(|link| {
                let flat = config.for_satellite(&link.class_name, &link.canonical_name);
                (
                    link.canonical_name.clone(),
                    link.request("initialize", Some(Value::Map(flat))),
                )
            })
            .collect()
    }

    /// Last known per-satellite states from the heartbeat checker.
    pub fn states(&self) -> HashMap<String, SatelliteState> {
        self.checker.states()
    }

    /// The aggregated state of the constellation.
    pub fn global_state(&self) -> ControllerState {
        aggregate_state(self.checker.states().values().copied())
    }

    /// Orderly teardown of discovery, heartbeat checks and connections.
    pub fn close(&mut self) {
        self.chirp.stop();
        self.checker.stop();
        self.task_stop
            .store(true, std::sync::atomic::Ordering::Relaxed);
        if let Some(handle) = self.task_thread.take() {
            if handle.join().is_err() {
                log::error!("[controller] task thread panicked");
            }
        }
        // Drain remaining queued callbacks.
        while let Ok(task) = self.tasks_rx.try_recv() {
            task();
        }
        self.shared.links.lock().clear();
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        self.close();
    }
}

/// Aggregate per-satellite states into the global controller state.
fn aggregate_state(states: impl Iterator<Item = SatelliteState>) -> ControllerState {
    let mut lowest: Option<SatelliteState> = None;
    let mut transitioning = false;
    for state in states {
        match state {
            SatelliteState::Error | SatelliteState::Dead | SatelliteState::Safe => {
                return ControllerState::Error;
            }
            state if state.is_transitional() => transitioning = true,
            state => {
                lowest = Some(match lowest {
                    Some(current) if (current as u8) <= state as u8 => current,
                    _ => state,
                });
            }
        }
    }
    if transitioning {
        return ControllerState::Transitioning;
    }
    match lowest {
        None => ControllerState::New,
        Some(SatelliteState::New) => ControllerState::New,
        Some(SatelliteState::Init) => ControllerState::Init,
        Some(SatelliteState::Orbit) => ControllerState::Orbit,
        Some(SatelliteState::Run) => ControllerState::Run,
        Some(_) => ControllerState::Transitioning,
    }
}

/// Convert a layered configuration value object into dispatchable form.
///
/// The `satellites` section holds type and canonical-name subsections; all
/// remaining top-level values are general.
pub fn run_configuration_from(config: &Configuration) -> RunConfiguration {
    let mut global = config.as_map().clone();
    let sections = match global.remove("satellites") {
        Some(Value::Map(sections)) => sections,
        _ => Map::new(),
    };
    let mut run_config = RunConfiguration::new(global);
    for (key, value) in sections {
        let Value::Map(section) = value else { continue };
        if key.contains('.') {
            run_config.set_satellite_section(&key, section);
        } else {
            run_config.set_type_section(&key, section);
        }
    }
    run_config
}
