// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Command registry and CSCP receive loop.
//!
//! Satellites register their commands at construction time: a name maps to
//! a handler closure with a doc string and an optional guard deciding
//! whether the command is allowed in the current state. The receive loop
//! polls the REP socket non-blockingly, sleeps 25 ms when idle, and maps
//! handler outcomes onto the CSCP reply types.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::{CscpError, SatelliteError};
use crate::protocol::cscp1::{Cscp1Message, VerbType};
use crate::protocol::value::{Map, Value};

use super::CommandTransmitter;

/// Handler invoked for a received command.
pub type CommandHandler =
    Arc<dyn Fn(&Cscp1Message) -> Result<CommandReply, CommandError> + Send + Sync + 'static>;

/// Guard deciding whether a command is allowed right now.
pub type CommandGuard = Arc<dyn Fn(&Cscp1Message) -> bool + Send + Sync + 'static>;

/// Successful command outcome: reply text, optional payload, tag map.
#[derive(Debug, Clone, Default)]
pub struct CommandReply {
    pub msg: String,
    pub payload: Option<Value>,
    pub tags: Map,
}

impl CommandReply {
    pub fn new(msg: impl Into<String>) -> CommandReply {
        CommandReply {
            msg: msg.into(),
            payload: None,
            tags: Map::new(),
        }
    }

    pub fn with_payload(mut self, payload: Value) -> CommandReply {
        self.payload = Some(payload);
        self
    }

    pub fn with_tags(mut self, tags: Map) -> CommandReply {
        self.tags = tags;
        self
    }
}

/// Failed command outcome, mapped onto a CSCP reply type.
#[derive(Debug, Clone)]
pub enum CommandError {
    /// Wrong argument type or value, including payload-shape rejection.
    WrongArgument(String),
    /// Transition or command not allowed in the current state.
    NotAllowed(String),
    /// Command is valid but the satellite does not implement it.
    NotImplemented(String),
    /// Any other handler failure.
    Failed(String),
}

impl CommandError {
    fn verb(&self) -> VerbType {
        match self {
            CommandError::WrongArgument(_) => VerbType::Incomplete,
            CommandError::NotAllowed(_) => VerbType::Invalid,
            CommandError::NotImplemented(_) => VerbType::NotImplemented,
            CommandError::Failed(_) => VerbType::Invalid,
        }
    }

    fn reply_text(&self) -> String {
        match self {
            CommandError::WrongArgument(e) => format!("Wrong argument: {e}"),
            CommandError::NotAllowed(e) => format!("Transition not allowed: {e}"),
            CommandError::NotImplemented(e) => format!("WrongImplementation: {e}"),
            CommandError::Failed(e) => format!("Exception: {e}"),
        }
    }
}

impl From<SatelliteError> for CommandError {
    fn from(err: SatelliteError) -> CommandError {
        match err {
            SatelliteError::TransitionNotAllowed { .. } => CommandError::NotAllowed(err.to_string()),
            SatelliteError::WrongArgument(e) => CommandError::WrongArgument(e),
            SatelliteError::NotImplemented(e) => CommandError::NotImplemented(e),
            SatelliteError::Config(e) => CommandError::WrongArgument(e.to_string()),
            other => CommandError::Failed(other.to_string()),
        }
    }
}

/// One registered command.
#[derive(Clone)]
pub struct CommandEntry {
    pub doc: String,
    pub guard: Option<CommandGuard>,
    pub handler: CommandHandler,
}

/// The command set of one satellite, keyed by lower-case name.
#[derive(Default)]
pub struct CommandRegistry {
    commands: Mutex<BTreeMap<String, CommandEntry>>,
}

impl CommandRegistry {
    pub fn new() -> CommandRegistry {
        CommandRegistry::default()
    }

    /// Register a command; the doc string's first line becomes its summary.
    pub fn register(&self, name: &str, doc: &str, handler: CommandHandler) {
        self.register_entry(
            name,
            CommandEntry {
                doc: doc.to_owned(),
                guard: None,
                handler,
            },
        );
    }

    /// Register a command with a guard deciding its availability.
    pub fn register_guarded(
        &self,
        name: &str,
        doc: &str,
        guard: CommandGuard,
        handler: CommandHandler,
    ) {
        self.register_entry(
            name,
            CommandEntry {
                doc: doc.to_owned(),
                guard: Some(guard),
                handler,
            },
        );
    }

    fn register_entry(&self, name: &str, entry: CommandEntry) {
        let name = name.to_lowercase();
        if self.commands.lock().insert(name.clone(), entry).is_some() {
            log::warn!("[cscp] replacing registered command `{name}`");
        }
    }

    pub fn get(&self, name: &str) -> Option<CommandEntry> {
        self.commands.lock().get(name).cloned()
    }

    /// Command summaries; `hidden` selects the `_`-prefixed internal set.
    pub fn docs(&self, hidden: bool) -> Map {
        self.commands
            .lock()
            .iter()
            .filter(|(name, _)| name.starts_with('_') == hidden)
            .map(|(name, entry)| {
                let summary = entry.doc.lines().next().unwrap_or_default().to_owned();
                (name.clone(), Value::Str(summary))
            })
            .collect()
    }
}

/// Receives CSCP requests on a REP socket and dispatches to the registry.
pub struct CommandReceiver {
    transmitter: CommandTransmitter,
    registry: Arc<CommandRegistry>,
}

impl CommandReceiver {
    pub fn new(transmitter: CommandTransmitter, registry: Arc<CommandRegistry>) -> Self {
        CommandReceiver {
            transmitter,
            registry,
        }
    }

    /// Request receive loop; returns when `stop` is set.
    pub fn run(&self, stop: &AtomicBool) {
        while !stop.load(Ordering::Relaxed) {
            match self.poll_once() {
                Ok(true) => {}
                Ok(false) => thread::sleep(Duration::from_millis(25)),
                Err(e) => {
                    // Something wrong with the socket, wait a while for recovery.
                    log::error!("[cscp] receive failed: {e}");
                    thread::sleep(Duration::from_millis(500));
                }
            }
        }
        log::info!("[cscp] command receiver shutting down");
    }

    /// Handle at most one pending request; `Ok(true)` if one was handled.
    pub fn poll_once(&self) -> Result<bool, CscpError> {
        let request = match self.transmitter.get_message(true) {
            Ok(Some(request)) => request,
            Ok(None) => return Ok(false),
            Err(CscpError::Decode(e)) => {
                // The peer is still waiting for an answer on the REP socket.
                log::warn!("[cscp] discarding undecodable request: {e}");
                self.transmitter
                    .send_reply(&format!("Error decoding message: {e}"), VerbType::Error, None, None)?;
                return Ok(true);
            }
            Err(e) => return Err(e),
        };

        if request.verb != VerbType::Request {
            log::error!(
                "[cscp] received malformed request with msg verb {:?}",
                request.verb
            );
            self.transmitter.send_reply(
                &format!("Received malformed request with msg verb {:?}", request.verb),
                VerbType::Invalid,
                None,
                None,
            )?;
            return Ok(true);
        }

        let command = request.verb_msg.clone();
        let Some(entry) = self.registry.get(&command) else {
            log::error!("[cscp] unknown command: {command}");
            self.transmitter.send_reply(
                &format!("Unknown command: {command}"),
                VerbType::Unknown,
                None,
                None,
            )?;
            return Ok(true);
        };

        if let Some(guard) = &entry.guard {
            if !guard(&request) {
                log::error!("[cscp] command not allowed: {command}");
                self.transmitter.send_reply(
                    "Command not allowed (in current state)",
                    VerbType::Invalid,
                    None,
                    None,
                )?;
                return Ok(true);
            }
        }

        log::debug!("[cscp] calling command {command}");
        match (entry.handler)(&request) {
            Ok(reply) => {
                log::debug!("[cscp] command `{command}` succeeded with `{}`", reply.msg);
                self.transmitter.send_reply(
                    &reply.msg,
                    VerbType::Success,
                    reply.payload,
                    Some(reply.tags),
                )?;
            }
            Err(err) => {
                log::error!("[cscp] command `{command}` failed: {}", err.reply_text());
                self.transmitter
                    .send_reply(&err.reply_text(), err.verb(), None, None)?;
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn receiver_pair(endpoint: &str) -> (CommandReceiver, CommandTransmitter) {
        let ctx = zmq::Context::new();
        let rep = ctx.socket(zmq::REP).unwrap();
        rep.bind(endpoint).unwrap();
        let req = ctx.socket(zmq::REQ).unwrap();
        req.connect(endpoint).unwrap();

        let registry = Arc::new(CommandRegistry::new());
        registry.register(
            "get_name",
            "Return the canonical name of the Satellite.",
            Arc::new(|_req| Ok(CommandReply::new("Mock.a"))),
        );
        registry.register_guarded(
            "start",
            "Initiate start state transition.",
            Arc::new(|_req| false),
            Arc::new(|_req| Ok(CommandReply::new("transitioning"))),
        );
        registry.register(
            "broken",
            "Always fails.",
            Arc::new(|_req| Err(CommandError::Failed("boom".into()))),
        );
        registry.register(
            "needs_payload",
            "Requires a map payload.",
            Arc::new(|req| match &req.payload {
                Some(Value::Map(_)) => Ok(CommandReply::new("ok")),
                _ => Err(CommandError::WrongArgument(
                    "payload must be a map with configuration values".into(),
                )),
            }),
        );
        registry.register(
            "_hidden_probe",
            "Internal probe command.",
            Arc::new(|_req| Ok(CommandReply::new("probed"))),
        );

        let receiver = CommandReceiver::new(CommandTransmitter::new("Mock.a", rep), registry);
        let client = CommandTransmitter::new("ctrl", req);
        (receiver, client)
    }

    fn roundtrip(
        receiver: &CommandReceiver,
        client: &CommandTransmitter,
        command: &str,
        payload: Option<Value>,
    ) -> Cscp1Message {
        client.send_request(command, payload, None).unwrap();
        for _ in 0..100 {
            if receiver.poll_once().unwrap() {
                return client.get_message(false).unwrap().unwrap();
            }
            thread::sleep(Duration::from_millis(1));
        }
        panic!("request was never handled");
    }

    #[test]
    fn success_reply() {
        let (receiver, client) = receiver_pair("inproc://cmdrecv-success");
        let reply = roundtrip(&receiver, &client, "get_name", None);
        assert_eq!(reply.verb, VerbType::Success);
        assert_eq!(reply.verb_msg, "Mock.a");
    }

    #[test]
    fn unknown_command() {
        let (receiver, client) = receiver_pair("inproc://cmdrecv-unknown");
        let reply = roundtrip(&receiver, &client, "make_sandwich", None);
        assert_eq!(reply.verb, VerbType::Unknown);
        assert_eq!(reply.verb_msg, "Unknown command: make_sandwich");
    }

    #[test]
    fn guard_rejects_with_invalid() {
        let (receiver, client) = receiver_pair("inproc://cmdrecv-guard");
        let reply = roundtrip(&receiver, &client, "start", None);
        assert_eq!(reply.verb, VerbType::Invalid);
        assert_eq!(reply.verb_msg, "Command not allowed (in current state)");
    }

    #[test]
    fn handler_failure_maps_to_invalid() {
        let (receiver, client) = receiver_pair("inproc://cmdrecv-fail");
        let reply = roundtrip(&receiver, &client, "broken", None);
        assert_eq!(reply.verb, VerbType::Invalid);
        assert!(reply.verb_msg.contains("boom"));
    }

    #[test]
    fn payload_shape_rejection_maps_to_incomplete() {
        let (receiver, client) = receiver_pair("inproc://cmdrecv-payload");
        let reply = roundtrip(&receiver, &client, "needs_payload", Some(Value::Int(3)));
        assert_eq!(reply.verb, VerbType::Incomplete);
        let reply = roundtrip(
            &receiver,
            &client,
            "needs_payload",
            Some(Value::Map(Map::new())),
        );
        assert_eq!(reply.verb, VerbType::Success);
    }

    #[test]
    fn command_matching_is_case_insensitive() {
        let (receiver, client) = receiver_pair("inproc://cmdrecv-case");
        let reply = roundtrip(&receiver, &client, "GET_NAME", None);
        assert_eq!(reply.verb, VerbType::Success);
    }

    #[test]
    fn docs_split_public_and_hidden() {
        let (receiver, _client) = receiver_pair("inproc://cmdrecv-docs");
        let public = receiver.registry.docs(false);
        assert!(public.contains_key("get_name"));
        assert!(!public.contains_key("_hidden_probe"));
        let hidden = receiver.registry.docs(true);
        assert!(hidden.contains_key("_hidden_probe"));
    }
}
