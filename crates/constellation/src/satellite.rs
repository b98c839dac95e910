// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Satellite composition.
//!
//! A satellite owns a command receiver, a CHIRP manager, a heartbeat
//! sender, a monitoring sender and optionally a data transmitter or
//! receiver. Construction binds all sockets, registers the offered
//! services and spawns the background threads; [`Satellite::run`] then
//! drives the task-handler loop that executes discovery callbacks and
//! state transitions sequentially.
//!
//! Device-specific behaviour is supplied through [`SatelliteHooks`]. All
//! hooks run inline on the task handler except [`SatelliteHooks::do_run`],
//! which executes in a single-slot worker thread so that `stop` and
//! `interrupt` can proceed while a run is active; it must poll the
//! cooperative cancellation token.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

use crate::chirp::{ChirpManager, DiscoveredService, ServiceId, Task};
use crate::config::Configuration;
use crate::control::{
    CommandError, CommandReceiver, CommandRegistry, CommandReply, CommandTransmitter,
};
use crate::data::{DataCallbacks, DataReceiver, DataTransmitter, TransmitterState};
use crate::error::SatelliteError;
use crate::fsm::{SatelliteFsm, SatelliteState, Transition};
use crate::heartbeat::{HeartbeatChecker, HeartbeatSender};
use crate::identity::{valid_run_identifier, CanonicalName, Uuid};
use crate::monitoring::{CmdpLogBridge, CmdpPublisher, MonitoringSender};
use crate::protocol::chp::ChpRole;
use crate::protocol::cmdp::{LogRecord, MetricHandling};
use crate::protocol::cscp1::Cscp1Message;
use crate::protocol::value::{Map, Value};
use crate::transport::bind_tcp;

/// Data-plane role of a satellite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataRole {
    /// No CDTP service.
    #[default]
    None,
    /// Pushes data via CDTP; offers a DATA service.
    Transmitter,
    /// Pulls data from discovered DATA services.
    Receiver,
}

/// Construction options of a satellite. Ports left at zero are chosen by
/// the operating system.
#[derive(Clone)]
pub struct SatelliteOptions {
    pub name: CanonicalName,
    pub group: String,
    pub interfaces: Option<Vec<String>>,
    pub cmd_port: u16,
    pub hb_port: u16,
    pub mon_port: u16,
    pub data_port: u16,
    pub data_role: DataRole,
    pub default_heartbeat_period_ms: u64,
}

impl SatelliteOptions {
    pub fn new(name: CanonicalName, group: impl Into<String>) -> SatelliteOptions {
        SatelliteOptions {
            name,
            group: group.into(),
            interfaces: None,
            cmd_port: 0,
            hb_port: 0,
            mon_port: 0,
            data_port: 0,
            data_role: DataRole::None,
            default_heartbeat_period_ms: crate::heartbeat::DEFAULT_HEARTBEAT_PERIOD_MS,
        }
    }
}

/// Context handed to [`SatelliteHooks::do_run`].
pub struct RunContext<'a> {
    run_identifier: &'a str,
    stop: &'a AtomicBool,
    data: Option<&'a DataTransmitter>,
}

impl RunContext<'_> {
    pub fn run_identifier(&self) -> &str {
        self.run_identifier
    }

    /// Whether a stop or interrupt has been requested.
    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// The data transmitter, for satellites with [`DataRole::Transmitter`].
    pub fn data(&self) -> Option<&DataTransmitter> {
        self.data
    }
}

/// Device-specific behaviour of a concrete satellite.
///
/// Every hook returns the status text shown for the reached state.
#[allow(unused_variables)]
pub trait SatelliteHooks: Send {
    /// Apply configuration values.
    fn do_initializing(&mut self, config: &mut Configuration) -> Result<String, SatelliteError> {
        Ok("Initialized.".to_owned())
    }

    /// Prepare for data acquisition.
    fn do_launching(&mut self) -> Result<String, SatelliteError> {
        Ok("Launched.".to_owned())
    }

    /// Return to the initialized state.
    fn do_landing(&mut self) -> Result<String, SatelliteError> {
        Ok("Landed.".to_owned())
    }

    /// Whether `do_reconfigure` is implemented.
    fn supports_reconfigure(&self) -> bool {
        false
    }

    /// Apply a partial configuration while in orbit.
    fn do_reconfigure(&mut self, partial: &mut Configuration) -> Result<String, SatelliteError> {
        Err(SatelliteError::NotImplemented(
            "Reconfigure not supported: missing handler".to_owned(),
        ))
    }

    /// Final preparation for acquisition.
    fn do_starting(&mut self, run_identifier: &str) -> Result<String, SatelliteError> {
        Ok("Finished preparations, starting.".to_owned())
    }

    /// The acquisition loop. Runs in the threaded slot and must observe
    /// the cancellation token.
    fn do_run(&mut self, ctx: &RunContext<'_>) -> Result<String, SatelliteError> {
        while !ctx.stop_requested() {
            thread::sleep(Duration::from_millis(200));
        }
        Ok("Finished acquisition.".to_owned())
    }

    /// Stop the data acquisition.
    fn do_stopping(&mut self) -> Result<String, SatelliteError> {
        Ok("Acquisition stopped.".to_owned())
    }

    /// Move to the safe state. Defaults to stopping and landing.
    fn do_interrupting(&mut self) -> Result<String, SatelliteError> {
        self.do_stopping()?;
        self.do_landing()?;
        Ok("Interrupted.".to_owned())
    }

    /// Called when reaching the error state; must not fail.
    fn fail_gracefully(&mut self) -> String {
        "Failed gracefully.".to_owned()
    }

    /// User tags for the begin-of-run message (transmitters).
    fn bor_tags(&self) -> Map {
        Map::new()
    }

    /// User tags for the end-of-run message (transmitters).
    fn eor_tags(&self) -> Map {
        Map::new()
    }

    /// Begin-of-run received from a data sender (receivers).
    fn receive_bor(
        &mut self,
        sender: &str,
        user_tags: &Map,
        configuration: Configuration,
    ) -> Result<(), SatelliteError> {
        Err(SatelliteError::NotImplemented(
            "receive_bor not implemented".to_owned(),
        ))
    }

    /// Data record received from a data sender (receivers).
    fn receive_data(
        &mut self,
        sender: &str,
        record: crate::protocol::cdtp2::DataRecord,
    ) -> Result<(), SatelliteError> {
        Err(SatelliteError::NotImplemented(
            "receive_data not implemented".to_owned(),
        ))
    }

    /// End-of-run received from a data sender (receivers).
    fn receive_eor(
        &mut self,
        sender: &str,
        user_tags: &Map,
        run_metadata: &Map,
    ) -> Result<(), SatelliteError> {
        Err(SatelliteError::NotImplemented(
            "receive_eor not implemented".to_owned(),
        ))
    }
}

/// Work items executed on the task handler for a granted transition.
enum TransitionWork {
    Initialize(Map),
    Launch,
    Land,
    Start(String),
    Stop,
    Reconfigure(Map),
    Interrupt,
    Failure,
}

struct RunSlot {
    stop: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<Option<String>>>>,
}

struct Core {
    name: String,
    fsm: Arc<SatelliteFsm>,
    role: Arc<Mutex<ChpRole>>,
    config: Mutex<Configuration>,
    run_identifier: Mutex<String>,
    hooks: Mutex<Box<dyn SatelliteHooks>>,
    tasks: Sender<Task>,
    run_slot: RunSlot,
    data_role: DataRole,
    data_tx: Option<Arc<DataTransmitter>>,
    data_rx: Mutex<Option<DataReceiver>>,
    eor_timeout: Mutex<Duration>,
    chirp: OnceLock<Arc<ChirpManager>>,
    hb_checker: Arc<HeartbeatChecker>,
    context: zmq::Context,
    reentry_requested: AtomicBool,
}

impl Core {
    fn chirp(&self) -> &Arc<ChirpManager> {
        self.chirp.get().expect("chirp manager installed at construction")
    }

    /// Drive the FSM and enqueue the matching transition work.
    fn request_transition(
        self: &Arc<Core>,
        transition: Transition,
        work: TransitionWork,
    ) -> Result<CommandReply, CommandError> {
        log::debug!("[satellite] state transition {} requested", transition.name());
        self.fsm.react(
            transition,
            format!("{} called via CSCP request.", transition.name()),
        )?;
        log::info!("[satellite] state transition {} initiated", transition.name());
        let core = Arc::clone(self);
        let task: Task = Box::new(move || core.execute_transition(work));
        self.tasks
            .send(task)
            .map_err(|_| CommandError::Failed("task queue closed".to_owned()))?;
        Ok(CommandReply::new("transitioning").with_payload(Value::Str(transition.name().to_owned())))
    }

    /// Run transition work on the task handler; failures enter ERROR.
    fn execute_transition(self: &Arc<Core>, work: TransitionWork) {
        let result = match work {
            TransitionWork::Initialize(map) => self.wrap_initialize(map),
            TransitionWork::Launch => self.wrap_launch(),
            TransitionWork::Land => self.wrap_land(),
            TransitionWork::Start(run_id) => {
                self.start_run_thread(run_id);
                return;
            }
            TransitionWork::Stop => self.wrap_stop(),
            TransitionWork::Reconfigure(map) => self.wrap_reconfigure(map),
            TransitionWork::Interrupt => self.wrap_interrupt(),
            TransitionWork::Failure => {
                self.error_cleanup(true);
                return;
            }
        };
        match result {
            Ok(status) => {
                self.fsm.complete(status);
            }
            Err(e) => self.enter_error(&e.to_string(), true),
        }
    }

    fn wrap_initialize(self: &Arc<Core>, map: Map) -> Result<String, SatelliteError> {
        // Verify that no run thread is left over from a previous cycle.
        self.run_slot.stop.store(true, Ordering::Release);
        if let Some(handle) = self.run_slot.handle.lock().take() {
            let _ = handle.join();
        }
        self.run_slot.stop.store(false, Ordering::Release);

        let mut config = Configuration::try_from_map(map)?;

        // Framework-level configuration values.
        let role_name = config.get_str_or("_role", "dynamic")?;
        match ChpRole::from_name(&role_name) {
            Some(role) => *self.role.lock() = role,
            None => {
                return Err(SatelliteError::WrongArgument(format!(
                    "`{role_name}` is not a valid role"
                )))
            }
        }
        match self.data_role {
            DataRole::Transmitter => self.configure_transmitter(&mut config)?,
            DataRole::Receiver => self.configure_receiver(&mut config)?,
            DataRole::None => {}
        }

        let mut status = self.hooks.lock().do_initializing(&mut config)?;

        let unused = config.take_unused();
        if !unused.is_empty() {
            for key in &unused {
                log::warn!("[satellite] ignored configuration value: `{key}`");
            }
            status.push_str(" IGNORED parameters: ");
            status.push_str(&unused.join(","));
        }
        *self.config.lock() = config;
        Ok(status)
    }

    fn configure_transmitter(&self, config: &mut Configuration) -> Result<(), SatelliteError> {
        let data_tx = self.data_tx.as_ref().expect("transmitter role has a data socket");
        let bor = config.get_int_or("_bor_timeout", 10)?.max(1) as u64;
        let data = config.get_int_or("_data_timeout", 10)?.max(1) as u64;
        let eor = config.get_int_or("_eor_timeout", 10)?.max(1) as u64;
        let threshold = config.get_int_or("_payload_threshold", 128)?.max(0) as usize;
        let queue_size = config.get_int_or("_queue_size", 32_768)?.max(1) as usize;
        data_tx.set_timeouts(
            Duration::from_secs(bor),
            Duration::from_secs(data),
            Duration::from_secs(eor),
        );
        data_tx.set_payload_threshold(threshold);
        data_tx.set_queue_size(queue_size);
        Ok(())
    }

    fn configure_receiver(self: &Arc<Core>, config: &mut Configuration) -> Result<(), SatelliteError> {
        let data_transmitters: Option<BTreeSet<String>> = if config.has("_data_transmitters") {
            Some(config.get_str_set("_data_transmitters")?)
        } else {
            None
        };
        let eor_timeout = config.get_int_or("_eor_timeout", 10)?.max(1) as u64;
        *self.eor_timeout.lock() = Duration::from_secs(eor_timeout);
        log::debug!("[satellite] timeout for EOR messages is {eor_timeout} s");

        let weak = Arc::downgrade(self);
        let callbacks = receiver_callbacks(weak);
        *self.data_rx.lock() = Some(DataReceiver::new(
            self.context.clone(),
            callbacks,
            data_transmitters,
        ));
        Ok(())
    }

    fn wrap_launch(&self) -> Result<String, SatelliteError> {
        self.hb_checker.start();
        if self.data_role == DataRole::Receiver {
            // Always request data services.
            self.chirp().request(ServiceId::Data)?;
            self.await_data_transmitters()?;
        }
        self.hooks.lock().do_launching()
    }

    /// Wait until all configured data transmitters have been discovered.
    fn await_data_transmitters(&self) -> Result<(), SatelliteError> {
        let accepted: Vec<String> = {
            let data_rx = self.data_rx.lock();
            match data_rx.as_ref().and_then(|rx| rx.data_transmitters()) {
                Some(accepted) => accepted.iter().cloned().collect(),
                None => return Ok(()),
            }
        };
        let deadline = Instant::now() + Duration::from_secs(3);
        loop {
            let discovered = self.chirp().get_discovered(ServiceId::Data);
            let missing: Vec<&String> = accepted
                .iter()
                .filter(|name| {
                    let uuid = Uuid::from_name(name);
                    !discovered.iter().any(|service| service.host_uuid == uuid)
                })
                .collect();
            if missing.is_empty() {
                return Ok(());
            }
            if Instant::now() > deadline {
                return Err(crate::error::DataError::MissingTransmitters(
                    missing
                        .into_iter()
                        .cloned()
                        .collect::<Vec<_>>()
                        .join(", "),
                )
                .into());
            }
            thread::sleep(Duration::from_millis(100));
        }
    }

    fn wrap_land(&self) -> Result<String, SatelliteError> {
        self.hb_checker.stop();
        self.hooks.lock().do_landing()
    }

    fn wrap_reconfigure(&self, map: Map) -> Result<String, SatelliteError> {
        let mut partial = Configuration::try_from_map(map)?;
        let mut status = self.hooks.lock().do_reconfigure(&mut partial)?;
        let unused = partial.take_unused();
        if !unused.is_empty() {
            for key in &unused {
                log::warn!("[satellite] ignored configuration value: `{key}`");
            }
            status.push_str(" IGNORED parameters: ");
            status.push_str(&unused.join(","));
        }
        self.config.lock().update(&partial)?;
        Ok(status)
    }

    /// Spawn the single-slot worker executing starting + run.
    fn start_run_thread(self: &Arc<Core>, run_identifier: String) {
        self.run_slot.stop.store(false, Ordering::Release);
        let core = Arc::clone(self);
        let handle = thread::spawn(move || core.run_thread_body(&run_identifier));
        *self.run_slot.handle.lock() = Some(handle);
    }

    fn run_thread_body(self: &Arc<Core>, run_identifier: &str) -> Option<String> {
        let result = self.run_thread_inner(run_identifier);
        match result {
            Ok(status) => {
                if self.run_slot.stop.load(Ordering::Acquire) {
                    // Cancelled: stop/interrupt completes the transition.
                    Some(status)
                } else {
                    self.fsm.complete(status.clone());
                    Some(status)
                }
            }
            Err(e) => {
                // The worker cannot join itself on the error path.
                self.enter_error(&e.to_string(), false);
                None
            }
        }
    }

    fn run_thread_inner(self: &Arc<Core>, run_identifier: &str) -> Result<String, SatelliteError> {
        *self.run_identifier.lock() = run_identifier.to_owned();
        log::info!("[satellite] starting run `{run_identifier}`");

        let status = self.hooks.lock().do_starting(run_identifier)?;

        // Bring up the data plane before entering RUN.
        match self.data_role {
            DataRole::Transmitter => {
                let data_tx = self.data_tx.as_ref().expect("transmitter role has a data socket");
                let (bor_tags, config_map) = {
                    let hooks = self.hooks.lock();
                    (hooks.bor_tags(), self.config.lock().as_map().clone())
                };
                data_tx.send_bor(bor_tags, config_map)?;
                data_tx.start_sending()?;
            }
            DataRole::Receiver => {
                {
                    let mut data_rx = self.data_rx.lock();
                    let rx = data_rx.as_mut().ok_or_else(|| {
                        SatelliteError::Failed("data receiver not initialized".to_owned())
                    })?;
                    rx.start_receiving();
                    for service in self.chirp().get_discovered(ServiceId::Data) {
                        rx.add_sender(&service)?;
                    }
                }
                self.chirp().request(ServiceId::Data)?;
            }
            DataRole::None => {}
        }

        self.fsm.complete(status);

        // Execute the acquisition loop.
        if self.data_role == DataRole::Receiver {
            self.receiver_run_loop()
        } else {
            let mut hooks = self.hooks.lock();
            let ctx = RunContext {
                run_identifier,
                stop: &self.run_slot.stop,
                data: self.data_tx.as_deref(),
            };
            hooks.do_run(&ctx)
        }
    }

    /// Built-in acquisition loop of receiver satellites.
    fn receiver_run_loop(&self) -> Result<String, SatelliteError> {
        while !self.run_slot.stop.load(Ordering::Acquire) {
            if let Some(rx) = self.data_rx.lock().as_ref() {
                rx.check_exception()?;
            }
            thread::sleep(Duration::from_millis(100));
        }
        Ok("Finished run".to_owned())
    }

    fn wrap_stop(&self) -> Result<String, SatelliteError> {
        // Receivers wait for outstanding EOR messages first.
        if self.data_role == DataRole::Receiver {
            let timeout = *self.eor_timeout.lock();
            let mut data_rx = self.data_rx.lock();
            if let Some(rx) = data_rx.as_mut() {
                rx.stop_receiving(timeout)?;
                rx.check_exception()?;
            }
        }

        // Indicate to the acquisition thread that it is time to stop.
        self.run_slot.stop.store(true, Ordering::Release);
        let res_run = self.join_run_thread();
        log::debug!("[satellite] RUN thread finished, continue with stopping");
        let status = self.hooks.lock().do_stopping()?;

        // Transmitters flush their queue and close the run with an EOR.
        if self.data_role == DataRole::Transmitter {
            let data_tx = self.data_tx.as_ref().expect("transmitter role has a data socket");
            data_tx.stop_sending();
            data_tx.check_exception()?;
            let eor_tags = self.hooks.lock().eor_tags();
            data_tx.send_eor(eor_tags, Map::new())?;
        }

        Ok(match res_run {
            Some(res_run) => format!("{res_run}; {status}"),
            None => status,
        })
    }

    fn wrap_interrupt(&self) -> Result<String, SatelliteError> {
        // Missing EOR messages are only a warning when interrupting.
        if self.data_role == DataRole::Receiver {
            let timeout = *self.eor_timeout.lock();
            let mut data_rx = self.data_rx.lock();
            if let Some(rx) = data_rx.as_mut() {
                if let Err(e) = rx.stop_receiving(timeout) {
                    log::warn!("[satellite] {e}");
                }
            }
        }

        self.run_slot.stop.store(true, Ordering::Release);
        let res_run = self.join_run_thread();
        log::debug!("[satellite] RUN thread finished, continue with interrupting");
        self.hb_checker.stop();
        let status = self.hooks.lock().do_interrupting()?;

        if self.data_role == DataRole::Transmitter {
            let data_tx = self.data_tx.as_ref().expect("transmitter role has a data socket");
            data_tx.stop_sending();
            data_tx.check_exception()?;
            if data_tx.state() == TransmitterState::BorSent {
                let eor_tags = self.hooks.lock().eor_tags();
                data_tx.send_eor(eor_tags, Map::new())?;
            }
        }

        Ok(match res_run {
            Some(res_run) => format!("{res_run}; {status}"),
            None => status,
        })
    }

    fn join_run_thread(&self) -> Option<String> {
        let handle = self.run_slot.handle.lock().take()?;
        match handle.join() {
            Ok(result) => result,
            Err(_) => {
                log::error!("[satellite] RUN thread panicked");
                None
            }
        }
    }

    /// Move to ERROR with cleanup; `join_run` is false on the run thread
    /// itself, which cannot join its own handle.
    fn enter_error(&self, why: &str, join_run: bool) {
        log::error!("[satellite] entering ERROR state: {why}");
        if self.fsm.react(Transition::Failure, why.to_owned()).is_err() {
            // Already DEAD; nothing to clean up.
            return;
        }
        self.error_cleanup(join_run);
    }

    /// Best-effort teardown on the way into ERROR.
    fn error_cleanup(&self, join_run: bool) {
        self.hb_checker.stop();
        self.run_slot.stop.store(true, Ordering::Release);
        if join_run {
            let _ = self.join_run_thread();
        }

        match self.data_role {
            DataRole::Transmitter => {
                if let Some(data_tx) = &self.data_tx {
                    data_tx.stop_sending();
                    // Already failing, no further exception checks.
                    if data_tx.state() == TransmitterState::BorSent {
                        let eor_tags = self.hooks.lock().eor_tags();
                        if let Err(e) = data_tx.send_eor(eor_tags, Map::new()) {
                            log::warn!("[satellite] could not send EOR during failure: {e}");
                        }
                    }
                }
            }
            DataRole::Receiver => {
                // Stop the pull thread without flushing.
                if let Some(rx) = self.data_rx.lock().as_mut() {
                    rx.stop_pull_thread();
                }
            }
            DataRole::None => {}
        }

        let status = self.hooks.lock().fail_gracefully();
        log::info!("[satellite] {status}");
    }
}

/// Callbacks wiring the data receiver into the hook object.
fn receiver_callbacks(core: Weak<Core>) -> DataCallbacks {
    let bor_core = core.clone();
    let data_core = core.clone();
    let eor_core = core;
    DataCallbacks {
        on_bor: Box::new(move |sender, tags, config| match bor_core.upgrade() {
            Some(core) => core.hooks.lock().receive_bor(sender, tags, config),
            None => Ok(()),
        }),
        on_data: Box::new(move |sender, record| match data_core.upgrade() {
            Some(core) => core.hooks.lock().receive_data(sender, record),
            None => Ok(()),
        }),
        on_eor: Box::new(move |sender, tags, metadata| match eor_core.upgrade() {
            Some(core) => core.hooks.lock().receive_eor(sender, tags, metadata),
            None => Ok(()),
        }),
    }
}

/// Network ports bound by a satellite.
#[derive(Debug, Clone, Copy)]
pub struct SatellitePorts {
    pub cmd: u16,
    pub hb: u16,
    pub mon: u16,
    pub data: Option<u16>,
}

/// A Constellation satellite process.
pub struct Satellite {
    core: Arc<Core>,
    chirp: Arc<ChirpManager>,
    monitoring: Arc<MonitoringSender>,
    log_tx: Sender<LogRecord>,
    tasks_rx: Receiver<Task>,
    stop_threads: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
    ports: SatellitePorts,
}

impl Satellite {
    /// Open all sockets, register services and start background threads.
    pub fn new(
        options: SatelliteOptions,
        hooks: Box<dyn SatelliteHooks>,
    ) -> Result<Satellite, SatelliteError> {
        let canonical = options.name.to_string();
        let context = zmq::Context::new();
        let (tasks_tx, tasks_rx) = crossbeam_channel::unbounded::<Task>();

        // Control channel.
        let rep = context.socket(zmq::REP)?;
        let cmd_port = bind_tcp(&rep, options.cmd_port)?;
        log::info!("[satellite] listening on command port {cmd_port}");

        // Heartbeat channel.
        let hb_socket = context.socket(zmq::XPUB)?;
        hb_socket.set_xpub_verbose(true)?;
        let hb_port = bind_tcp(&hb_socket, options.hb_port)?;
        log::info!("[satellite] setting up heartbeater on port {hb_port}");

        // Monitoring channel.
        let mon_socket = context.socket(zmq::XPUB)?;
        mon_socket.set_xpub_verbose(true)?;
        let mon_port = bind_tcp(&mon_socket, options.mon_port)?;

        // Data channel (transmitters bind at construction time).
        let mut data_port = None;
        let data_tx = if options.data_role == DataRole::Transmitter {
            let push = context.socket(zmq::PUSH)?;
            let port = bind_tcp(&push, options.data_port)?;
            log::info!("[satellite] publishing data on port {port}");
            data_port = Some(port);
            Some(Arc::new(DataTransmitter::new(&canonical, push)))
        } else {
            None
        };

        let fsm = Arc::new(SatelliteFsm::new());
        let role = Arc::new(Mutex::new(ChpRole::default()));
        let hb_checker = Arc::new(HeartbeatChecker::new(context.clone()));

        let core = Arc::new(Core {
            name: canonical.clone(),
            fsm: Arc::clone(&fsm),
            role: Arc::clone(&role),
            config: Mutex::new(Configuration::new()),
            run_identifier: Mutex::new(String::new()),
            hooks: Mutex::new(hooks),
            tasks: tasks_tx.clone(),
            run_slot: RunSlot {
                stop: Arc::new(AtomicBool::new(false)),
                handle: Mutex::new(None),
            },
            data_role: options.data_role,
            data_tx,
            data_rx: Mutex::new(None),
            eor_timeout: Mutex::new(Duration::from_secs(10)),
            chirp: OnceLock::new(),
            hb_checker: Arc::clone(&hb_checker),
            context: context.clone(),
            reentry_requested: AtomicBool::new(false),
        });

        // Peer faults interrupt a running satellite.
        {
            let weak = Arc::downgrade(&core);
            hb_checker.register_callback(Box::new(move |name, state| {
                let Some(core) = weak.upgrade() else { return };
                log::warn!(
                    "[satellite] heartbeat fault of {name} (state {}), interrupting",
                    state.name()
                );
                let _ = core.request_transition(Transition::Interrupt, TransitionWork::Interrupt);
            }));
        }

        // Command surface. The reconfigure capability is a constant of the
        // hook object, probed once so the receive loop never waits on a
        // busy hook lock.
        let supports_reconfigure = core.hooks.lock().supports_reconfigure();
        let registry = Arc::new(CommandRegistry::new());
        register_default_commands(&registry, &core, supports_reconfigure);
        let receiver = CommandReceiver::new(
            CommandTransmitter::new(&canonical, rep),
            Arc::clone(&registry),
        );

        // Service discovery.
        let chirp = Arc::new(ChirpManager::new(
            &canonical,
            &options.group,
            options.interfaces.as_deref(),
            tasks_tx,
        )?);
        chirp.register_offer(ServiceId::Control, cmd_port);
        chirp.register_offer(ServiceId::Heartbeat, hb_port);
        chirp.register_offer(ServiceId::Monitoring, mon_port);
        if let Some(port) = data_port {
            chirp.register_offer(ServiceId::Data, port);
        }
        if options.data_role == DataRole::Receiver {
            let weak = Arc::downgrade(&core);
            chirp.register_request(
                ServiceId::Data,
                Arc::new(move |service: DiscoveredService| {
                    let Some(core) = weak.upgrade() else { return };
                    let data_rx = core.data_rx.lock();
                    if let Some(rx) = data_rx.as_ref() {
                        if service.alive {
                            if let Err(e) = rx.add_sender(&service) {
                                log::warn!("[satellite] could not connect data sender: {e}");
                            }
                        } else {
                            rx.remove_sender(&service);
                        }
                    }
                }),
            );
        }
        core.chirp
            .set(Arc::clone(&chirp))
            .map_err(|_| SatelliteError::Failed("chirp manager already installed".to_owned()))?;
        chirp.emit_offers(None)?;
        chirp.start();

        // Monitoring sender with the log bridge queue.
        let publisher = Arc::new(CmdpPublisher::new(&canonical, mon_socket));
        let (log_tx, log_rx) = crossbeam_channel::bounded(4096);
        let monitoring = Arc::new(MonitoringSender::new(publisher, log_rx));
        if options.data_role == DataRole::Receiver {
            let weak = Arc::downgrade(&core);
            monitoring.schedule_metric(
                "rx_bytes",
                "Number of payload bytes received.",
                "B",
                MetricHandling::LastValue,
                Duration::from_secs(10),
                Box::new(move || {
                    let core = weak.upgrade()?;
                    let data_rx = core.data_rx.lock();
                    data_rx
                        .as_ref()
                        .filter(|rx| rx.running())
                        .map(|rx| Value::Int(rx.bytes_received() as i64))
                }),
            );
        }

        // Background threads: command receiver, heartbeat sender, monitoring.
        let stop_threads = Arc::new(AtomicBool::new(false));
        let mut threads = Vec::new();
        {
            let stop = Arc::clone(&stop_threads);
            threads.push(thread::spawn(move || receiver.run(&stop)));
        }
        {
            let stop = Arc::clone(&stop_threads);
            let mut sender = HeartbeatSender::new(
                &canonical,
                hb_socket,
                fsm,
                role,
                options.default_heartbeat_period_ms,
            );
            threads.push(thread::spawn(move || sender.run(&stop)));
        }
        {
            let stop = Arc::clone(&stop_threads);
            let monitoring = Arc::clone(&monitoring);
            threads.push(thread::spawn(move || monitoring.run(&stop)));
        }

        log::info!(
            "[satellite] satellite {canonical}, version {} ready to launch",
            crate::VERSION
        );

        Ok(Satellite {
            core,
            chirp,
            monitoring,
            log_tx,
            tasks_rx,
            stop_threads,
            threads,
            ports: SatellitePorts {
                cmd: cmd_port,
                hb: hb_port,
                mon: mon_port,
                data: data_port,
            },
        })
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub fn ports(&self) -> SatellitePorts {
        self.ports
    }

    pub fn state(&self) -> SatelliteState {
        self.core.fsm.state()
    }

    pub fn status(&self) -> String {
        self.core.fsm.status()
    }

    pub fn chirp(&self) -> &Arc<ChirpManager> {
        &self.chirp
    }

    pub fn monitoring(&self) -> &Arc<MonitoringSender> {
        &self.monitoring
    }

    /// A log bridge feeding this satellite's monitoring channel; install
    /// it with [`CmdpLogBridge::init`].
    pub fn log_bridge(&self) -> CmdpLogBridge {
        CmdpLogBridge::new(&self.core.name, self.log_tx.clone())
    }

    /// Main event loop: executes queued tasks until shutdown is requested.
    pub fn run(&mut self) {
        while !self.core.reentry_requested.load(Ordering::Acquire) {
            match self.tasks_rx.recv_timeout(Duration::from_millis(500)) {
                Ok(task) => task(),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }

            // Faults of the data-sending worker surface on the next tick.
            if self.core.fsm.state() == SatelliteState::Run {
                if let Some(data_tx) = &self.core.data_tx {
                    if let Err(e) = data_tx.check_exception() {
                        self.core.enter_error(&e.to_string(), true);
                    }
                }
            }
        }
        self.reentry();
    }

    /// Request an orderly shutdown of the event loop.
    pub fn request_reentry(&self) {
        self.core.reentry_requested.store(true, Ordering::Release);
    }

    /// Orderly teardown: DEPART, thread shutdown, socket close.
    fn reentry(&mut self) {
        log::info!("[satellite] on reentry course for shutdown");
        let state = self.core.fsm.state();
        if !matches!(
            state,
            SatelliteState::New | SatelliteState::Init | SatelliteState::Safe | SatelliteState::Error
        ) {
            self.core
                .enter_error("Performing controlled reentry and shutdown.", true);
        }
        let _ = self.core.fsm.react(Transition::Shutdown, "Satellite shut down.");

        // CHIRP departs first so peers stop contacting us.
        self.chirp.stop();
        self.core.hb_checker.stop();
        self.stop_threads.store(true, Ordering::Release);
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                log::error!("[satellite] communication thread panicked during teardown");
            }
        }
    }
}

impl Drop for Satellite {
    fn drop(&mut self) {
        if !self.threads.is_empty() {
            self.reentry();
        }
    }
}

/// Register the command set every satellite provides.
fn register_default_commands(
    registry: &Arc<CommandRegistry>,
    core: &Arc<Core>,
    supports_reconfigure: bool,
) {
    let reg = Arc::downgrade(registry);
    registry.register(
        "get_commands",
        "Return all commands supported by the Satellite.",
        Arc::new(move |_req| {
            let registry = reg
                .upgrade()
                .ok_or_else(|| CommandError::Failed("registry gone".to_owned()))?;
            let docs = registry.docs(false);
            Ok(CommandReply::new(format!("{} commands known", docs.len()))
                .with_payload(Value::Map(docs)))
        }),
    );

    let reg = Arc::downgrade(registry);
    registry.register(
        "_get_commands",
        "Return all hidden commands supported by the Satellite.",
        Arc::new(move |_req| {
            let registry = reg
                .upgrade()
                .ok_or_else(|| CommandError::Failed("registry gone".to_owned()))?;
            let docs = registry.docs(true);
            Ok(CommandReply::new(format!("{} commands known", docs.len()))
                .with_payload(Value::Map(docs)))
        }),
    );

    let c = Arc::clone(core);
    registry.register(
        "get_name",
        "Return the canonical name of the Satellite.",
        Arc::new(move |_req| Ok(CommandReply::new(c.name.clone()))),
    );

    registry.register(
        "get_version",
        "Return the Constellation version.",
        Arc::new(move |_req| Ok(CommandReply::new(crate::VERSION))),
    );

    let c = Arc::clone(core);
    registry.register(
        "get_state",
        "Return the current state of the Satellite.",
        Arc::new(move |_req| {
            let state = c.fsm.state();
            let last_changed = c.fsm.last_changed();
            let mut tags = Map::new();
            tags.insert("last_changed".to_owned(), Value::Time(last_changed));
            tags.insert(
                "last_changed_iso".to_owned(),
                Value::Str(last_changed.to_rfc3339()),
            );
            Ok(CommandReply::new(state.name())
                .with_payload(Value::Int(i64::from(state as u8)))
                .with_tags(tags))
        }),
    );

    let c = Arc::clone(core);
    registry.register(
        "get_status",
        "Return a string describing the current status of the Satellite.",
        Arc::new(move |_req| Ok(CommandReply::new(c.fsm.status()))),
    );

    let c = Arc::clone(core);
    registry.register(
        "get_config",
        "Return the current satellite configuration.",
        Arc::new(move |_req| {
            let config = c.config.lock();
            Ok(
                CommandReply::new(format!(
                    "{} configuration keys, dictionary attached in payload",
                    config.len()
                ))
                .with_payload(Value::Map(config.as_map().clone())),
            )
        }),
    );

    let c = Arc::clone(core);
    registry.register(
        "get_run_id",
        "Return the current or last known run identifier.",
        Arc::new(move |_req| Ok(CommandReply::new(c.run_identifier.lock().clone()))),
    );

    let c = Arc::clone(core);
    registry.register(
        "register",
        "Register a heartbeat check via CSCP request.",
        Arc::new(move |req| {
            let payload = req
                .payload
                .as_ref()
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    CommandError::WrongArgument("payload must be `name ip port`".to_owned())
                })?;
            let parts: Vec<&str> = payload.split_whitespace().collect();
            let [name, ip, port] = parts.as_slice() else {
                return Err(CommandError::WrongArgument(
                    "payload must be `name ip port`".to_owned(),
                ));
            };
            let endpoint = format!("tcp://{ip}:{port}");
            let name = (*name).to_owned();
            let uuid = Uuid::from_name(&name);
            let checker = Arc::clone(&c.hb_checker);
            let task: Task = Box::new(move || {
                if let Err(e) = checker.register(uuid, &endpoint, &name) {
                    log::error!("[satellite] heartbeat registration failed: {e}");
                }
            });
            c.tasks
                .send(task)
                .map_err(|_| CommandError::Failed("task queue closed".to_owned()))?;
            Ok(CommandReply::new("registering"))
        }),
    );

    let c = Arc::clone(core);
    registry.register(
        "shutdown",
        "Queue the Satellite's reentry.",
        Arc::new(move |_req| {
            let core = Arc::clone(&c);
            // Executed from the queue so that earlier transitions finish
            // and the CSCP reply reaches the controller first.
            let task: Task = Box::new(move || {
                thread::sleep(Duration::from_millis(500));
                core.reentry_requested.store(true, Ordering::Release);
            });
            c.tasks
                .send(task)
                .map_err(|_| CommandError::Failed("task queue closed".to_owned()))?;
            Ok(CommandReply::new(format!("{} queued for reentry", c.name)))
        }),
    );

    // State transition commands.
    let c = Arc::clone(core);
    registry.register(
        "initialize",
        "Initiate the initialize transition; takes a map with configuration values.",
        Arc::new(move |req| {
            let map = require_map_payload(req)?;
            c.request_transition(Transition::Initialize, TransitionWork::Initialize(map))
        }),
    );

    let c = Arc::clone(core);
    registry.register(
        "launch",
        "Initiate the launch transition; no payload.",
        Arc::new(move |_req| c.request_transition(Transition::Launch, TransitionWork::Launch)),
    );

    let c = Arc::clone(core);
    registry.register(
        "land",
        "Initiate the landing transition; no payload.",
        Arc::new(move |_req| c.request_transition(Transition::Land, TransitionWork::Land)),
    );

    let c = Arc::clone(core);
    registry.register(
        "start",
        "Initiate the start transition; takes the run identifier as payload.",
        Arc::new(move |req| {
            let run_id = req
                .payload
                .as_ref()
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    CommandError::WrongArgument(
                        "payload must be a run identification string".to_owned(),
                    )
                })?;
            if !valid_run_identifier(run_id) {
                return Err(CommandError::WrongArgument(
                    "run identifier contains invalid characters".to_owned(),
                ));
            }
            c.request_transition(Transition::Start, TransitionWork::Start(run_id.to_owned()))
        }),
    );

    let c = Arc::clone(core);
    registry.register(
        "stop",
        "Initiate the stop transition; no payload.",
        Arc::new(move |_req| c.request_transition(Transition::Stop, TransitionWork::Stop)),
    );

    let c = Arc::clone(core);
    registry.register(
        "reconfigure",
        "Initiate the reconfigure transition; takes a map with configuration values.",
        Arc::new(move |req| {
            if !supports_reconfigure {
                return Err(CommandError::NotImplemented(
                    "Reconfigure not supported: missing handler".to_owned(),
                ));
            }
            let map = require_map_payload(req)?;
            c.request_transition(Transition::Reconfigure, TransitionWork::Reconfigure(map))
        }),
    );

    let c = Arc::clone(core);
    registry.register(
        "interrupt",
        "Initiate the interrupt transition; no payload.",
        Arc::new(move |_req| c.request_transition(Transition::Interrupt, TransitionWork::Interrupt)),
    );

    let c = Arc::clone(core);
    registry.register(
        "failure",
        "Enter the error state; intended for debugging only.",
        Arc::new(move |_req| c.request_transition(Transition::Failure, TransitionWork::Failure)),
    );
}

fn require_map_payload(req: &Cscp1Message) -> Result<Map, CommandError> {
    match &req.payload {
        Some(Value::Map(map)) => Ok(map.clone()),
        _ => Err(CommandError::WrongArgument(
            "payload must be a map with configuration values".to_owned(),
        )),
    }
}
