// SPDX-License-Identifier: Apache-2.0 OR MIT

//! End-to-end control-channel scenarios against a live satellite.

use std::thread;
use std::time::{Duration, Instant};

use constellation::chirp::ServiceId;
use constellation::control::CommandTransmitter;
use constellation::protocol::chp::ChpMessage;
use constellation::protocol::cscp1::VerbType;
use constellation::protocol::value::{Map, Value};
use constellation::satellite::SatellitePorts;
use constellation::{
    CanonicalName, ChirpManager, Satellite, SatelliteHooks, SatelliteOptions, SatelliteState,
};

struct MockHooks;

impl SatelliteHooks for MockHooks {
    fn do_initializing(
        &mut self,
        config: &mut constellation::Configuration,
    ) -> Result<String, constellation::SatelliteError> {
        // Read the values a mock device cares about.
        let _ = config.get_int_or("voltage", 0)?;
        Ok("Initialized.".to_owned())
    }
}

fn spawn_satellite(instance: &str, group: &str) -> (thread::JoinHandle<()>, SatellitePorts) {
    let name = CanonicalName::new("Mock", instance).unwrap();
    let options = SatelliteOptions::new(name, group);
    let mut satellite = Satellite::new(options, Box::new(MockHooks)).expect("satellite starts");
    let ports = satellite.ports();
    let handle = thread::spawn(move || satellite.run());
    (handle, ports)
}

fn controller_link(cmd_port: u16) -> CommandTransmitter {
    let ctx = zmq::Context::new();
    let req = ctx.socket(zmq::REQ).unwrap();
    req.set_rcvtimeo(5000).unwrap();
    req.set_linger(0).unwrap();
    req.connect(&format!("tcp://127.0.0.1:{cmd_port}")).unwrap();
    CommandTransmitter::new("ctrl.test", req)
}

fn await_state(link: &CommandTransmitter, state: SatelliteState, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    loop {
        let reply = link
            .request_get_response("get_state", None, None)
            .expect("get_state");
        if reply.payload == Some(Value::Int(i64::from(state as u8))) {
            assert_eq!(reply.verb_msg, state.name());
            assert!(reply.header.tags.contains_key("last_changed"));
            assert!(reply.header.tags.contains_key("last_changed_iso"));
            return;
        }
        assert!(
            Instant::now() < deadline,
            "satellite did not reach {} in time (still {})",
            state.name(),
            reply.verb_msg
        );
        thread::sleep(Duration::from_millis(50));
    }
}

#[test]
fn full_command_cycle() {
    let (handle, ports) = spawn_satellite("cycle", "edda_ctl1");
    let link = controller_link(ports.cmd);

    // Fresh satellite reports NEW with the state byte as payload.
    let reply = link.request_get_response("get_state", None, None).unwrap();
    assert_eq!(reply.verb, VerbType::Success);
    assert_eq!(reply.verb_msg, "NEW");
    assert_eq!(reply.payload, Some(Value::Int(0x10)));

    // Identity commands.
    let reply = link.request_get_response("get_name", None, None).unwrap();
    assert_eq!(reply.verb_msg, "Mock.cycle");
    let reply = link.request_get_response("get_version", None, None).unwrap();
    assert_eq!(reply.verb_msg, constellation::VERSION);
    let reply = link.request_get_response("get_commands", None, None).unwrap();
    let commands = reply.payload.as_ref().and_then(Value::as_map).unwrap();
    for expected in ["initialize", "launch", "start", "get_state", "shutdown"] {
        assert!(commands.contains_key(expected), "missing {expected}");
    }
    assert!(!commands.contains_key("_get_commands"));

    // Unknown command.
    let reply = link
        .request_get_response("make_sandwich", None, None)
        .unwrap();
    assert_eq!(reply.verb, VerbType::Unknown);
    assert_eq!(reply.verb_msg, "Unknown command: make_sandwich");

    // Transition commands not allowed from NEW.
    let reply = link.request_get_response("launch", None, None).unwrap();
    assert_eq!(reply.verb, VerbType::Invalid);

    // Initialize with a configuration map.
    let mut config = Map::new();
    config.insert("voltage".into(), Value::Int(1000));
    let reply = link
        .request_get_response("initialize", Some(Value::Map(config)), None)
        .unwrap();
    assert_eq!(reply.verb, VerbType::Success);
    assert_eq!(reply.verb_msg, "transitioning");
    assert_eq!(reply.payload, Some(Value::Str("initialize".into())));
    await_state(&link, SatelliteState::Init, Duration::from_secs(2));

    // Initialize without a map payload is INCOMPLETE.
    let reply = link
        .request_get_response("initialize", Some(Value::Int(3)), None)
        .unwrap();
    assert_eq!(reply.verb, VerbType::Incomplete);

    // The applied configuration is returned by get_config.
    let reply = link.request_get_response("get_config", None, None).unwrap();
    let config = reply.payload.as_ref().and_then(Value::as_map).unwrap();
    assert_eq!(config.get("voltage"), Some(&Value::Int(1000)));

    // Launch and run a full cycle.
    let reply = link.request_get_response("launch", None, None).unwrap();
    assert_eq!(reply.verb, VerbType::Success);
    await_state(&link, SatelliteState::Orbit, Duration::from_secs(2));

    // Reconfigure is valid but unimplemented by the mock.
    let reply = link
        .request_get_response("reconfigure", Some(Value::Map(Map::new())), None)
        .unwrap();
    assert_eq!(reply.verb, VerbType::NotImplemented);

    // Run identifiers are validated.
    let reply = link
        .request_get_response("start", Some(Value::Str("bad run!".into())), None)
        .unwrap();
    assert_eq!(reply.verb, VerbType::Incomplete);

    let reply = link
        .request_get_response("start", Some(Value::Str("run-2026_001".into())), None)
        .unwrap();
    assert_eq!(reply.verb, VerbType::Success);
    await_state(&link, SatelliteState::Run, Duration::from_secs(2));

    let reply = link.request_get_response("get_run_id", None, None).unwrap();
    assert_eq!(reply.verb_msg, "run-2026_001");

    let reply = link.request_get_response("stop", None, None).unwrap();
    assert_eq!(reply.verb, VerbType::Success);
    await_state(&link, SatelliteState::Orbit, Duration::from_secs(2));

    let reply = link.request_get_response("land", None, None).unwrap();
    assert_eq!(reply.verb, VerbType::Success);
    await_state(&link, SatelliteState::Init, Duration::from_secs(2));

    // Shutdown queues the reentry and replies first.
    let reply = link.request_get_response("shutdown", None, None).unwrap();
    assert_eq!(reply.verb, VerbType::Success);
    assert!(reply.verb_msg.contains("queued for reentry"));
    handle.join().expect("satellite loop exits");
}

#[test]
fn failure_command_enters_error_state() {
    let (handle, ports) = spawn_satellite("failing", "edda_ctl2");
    let link = controller_link(ports.cmd);

    let reply = link.request_get_response("failure", None, None).unwrap();
    assert_eq!(reply.verb, VerbType::Success);
    await_state(&link, SatelliteState::Error, Duration::from_secs(2));

    // ERROR recovers via initialize.
    let reply = link
        .request_get_response("initialize", Some(Value::Map(Map::new())), None)
        .unwrap();
    assert_eq!(reply.verb, VerbType::Success);
    await_state(&link, SatelliteState::Init, Duration::from_secs(2));

    let reply = link.request_get_response("shutdown", None, None).unwrap();
    assert_eq!(reply.verb, VerbType::Success);
    handle.join().expect("satellite loop exits");
}

#[test]
fn heartbeats_flow_to_subscribers() {
    let (handle, ports) = spawn_satellite("beating", "edda_ctl3");
    let link = controller_link(ports.cmd);

    let ctx = zmq::Context::new();
    let sub = ctx.socket(zmq::SUB).unwrap();
    sub.connect(&format!("tcp://127.0.0.1:{}", ports.hb)).unwrap();
    sub.set_subscribe(b"").unwrap();
    sub.set_rcvtimeo(2000).unwrap();

    // With one subscriber the period stays near the 500 ms floor, so
    // several heartbeats arrive within a few seconds.
    let mut count = 0;
    let deadline = Instant::now() + Duration::from_secs(6);
    while Instant::now() < deadline && count < 3 {
        if let Ok(frames) = sub.recv_multipart(0) {
            let msg = ChpMessage::disassemble(&frames).expect("valid heartbeat");
            assert_eq!(msg.sender, "Mock.beating");
            assert!(msg.interval_ms >= 500);
            count += 1;
        }
    }
    assert!(count >= 3, "expected at least 3 heartbeats, got {count}");

    let reply = link.request_get_response("shutdown", None, None).unwrap();
    assert_eq!(reply.verb, VerbType::Success);
    handle.join().expect("satellite loop exits");
}

#[test]
fn discovery_offers_control_service() {
    let (handle, ports) = spawn_satellite("visible", "edda_disco");

    // A controller-side manager in the same group requests CONTROL.
    let (tasks_tx, tasks_rx) = crossbeam_channel::unbounded();
    let manager = ChirpManager::new("Ctrl.probe", "edda_disco", None, tasks_tx).unwrap();
    manager.register_request(ServiceId::Control, std::sync::Arc::new(|_| {}));
    manager.start();
    manager.request(ServiceId::Control).unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    let mut found = Vec::new();
    while Instant::now() < deadline {
        found = manager.get_discovered(ServiceId::Control);
        if !found.is_empty() {
            break;
        }
        thread::sleep(Duration::from_millis(50));
    }
    assert!(!found.is_empty(), "CONTROL service was not discovered");
    assert_eq!(found[0].port, ports.cmd);
    drop(tasks_rx);

    let link = controller_link(ports.cmd);
    let reply = link.request_get_response("shutdown", None, None).unwrap();
    assert_eq!(reply.verb, VerbType::Success);
    handle.join().expect("satellite loop exits");
}
