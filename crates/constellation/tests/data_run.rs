// SPDX-License-Identifier: Apache-2.0 OR MIT

//! End-to-end CDTP run: a transmitter satellite streams a framed run, a
//! receiver satellite discovers it via CHIRP and reconstructs it.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use constellation::control::CommandTransmitter;
use constellation::protocol::cdtp2::{Cdtp2Message, CdtpMessageType, DataRecord};
use constellation::protocol::cscp1::VerbType;
use constellation::protocol::value::{Map, Value};
use constellation::{
    CanonicalName, Configuration, DataRole, Satellite, SatelliteError, SatelliteHooks,
    SatelliteOptions, SatelliteState,
};

/// Pushes ten fixed data blocks, then idles until stopped.
struct PusherHooks {
    pushed: Arc<AtomicUsize>,
}

impl SatelliteHooks for PusherHooks {
    fn bor_tags(&self) -> Map {
        let mut tags = Map::new();
        tags.insert("foo".into(), Value::Str("bar".into()));
        tags
    }

    fn eor_tags(&self) -> Map {
        let mut tags = Map::new();
        tags.insert("n".into(), Value::Int(10));
        tags
    }

    fn do_run(
        &mut self,
        ctx: &constellation::RunContext<'_>,
    ) -> Result<String, SatelliteError> {
        let data = ctx.data().expect("transmitter satellite has a data plane");
        for _ in 0..10 {
            let mut block = data.new_data_block(None);
            block.add_block(vec![0xDE, 0xAD, 0xBE, 0xEF]);
            data.send_data_block(block)?;
            self.pushed.fetch_add(1, Ordering::Relaxed);
        }
        while !ctx.stop_requested() {
            thread::sleep(Duration::from_millis(50));
        }
        Ok("Pushed 10 blocks.".to_owned())
    }
}

#[derive(Default)]
struct RunRecord {
    bor_tags: Option<Map>,
    records: Vec<DataRecord>,
    eor_tags: Option<Map>,
}

/// Records everything delivered by the data receiver.
struct CollectorHooks {
    record: Arc<Mutex<RunRecord>>,
}

impl SatelliteHooks for CollectorHooks {
    fn receive_bor(
        &mut self,
        _sender: &str,
        user_tags: &Map,
        _configuration: Configuration,
    ) -> Result<(), SatelliteError> {
        self.record.lock().bor_tags = Some(user_tags.clone());
        Ok(())
    }

    fn receive_data(&mut self, _sender: &str, record: DataRecord) -> Result<(), SatelliteError> {
        self.record.lock().records.push(record);
        Ok(())
    }

    fn receive_eor(
        &mut self,
        _sender: &str,
        user_tags: &Map,
        _run_metadata: &Map,
    ) -> Result<(), SatelliteError> {
        self.record.lock().eor_tags = Some(user_tags.clone());
        Ok(())
    }
}

fn controller_link(cmd_port: u16) -> CommandTransmitter {
    let ctx = zmq::Context::new();
    let req = ctx.socket(zmq::REQ).unwrap();
    req.set_rcvtimeo(5000).unwrap();
    req.set_linger(0).unwrap();
    req.connect(&format!("tcp://127.0.0.1:{cmd_port}")).unwrap();
    CommandTransmitter::new("ctrl.data", req)
}

fn drive(link: &CommandTransmitter, command: &str, payload: Option<Value>) {
    let reply = link.request_get_response(command, payload, None).unwrap();
    assert_eq!(
        reply.verb,
        VerbType::Success,
        "{command} rejected: {}",
        reply.verb_msg
    );
}

fn await_state(link: &CommandTransmitter, state: SatelliteState, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    loop {
        let reply = link
            .request_get_response("get_state", None, None)
            .expect("get_state");
        if reply.payload == Some(Value::Int(i64::from(state as u8))) {
            return;
        }
        assert!(
            Instant::now() < deadline,
            "state {} not reached (still {})",
            state.name(),
            reply.verb_msg
        );
        thread::sleep(Duration::from_millis(50));
    }
}

#[test]
fn transmitter_run_over_raw_pull_socket() {
    let name = CanonicalName::new("Pusher", "raw").unwrap();
    let mut options = SatelliteOptions::new(name, "edda_data1");
    options.data_role = DataRole::Transmitter;
    let pushed = Arc::new(AtomicUsize::new(0));
    let mut satellite = Satellite::new(
        options,
        Box::new(PusherHooks {
            pushed: Arc::clone(&pushed),
        }),
    )
    .expect("satellite starts");
    let ports = satellite.ports();
    let handle = thread::spawn(move || satellite.run());

    // Attach a bare consumer to the data port.
    let ctx = zmq::Context::new();
    let pull = ctx.socket(zmq::PULL).unwrap();
    pull.set_rcvtimeo(5000).unwrap();
    pull.connect(&format!("tcp://127.0.0.1:{}", ports.data.unwrap()))
        .unwrap();

    let link = controller_link(ports.cmd);
    drive(&link, "initialize", Some(Value::Map(Map::new())));
    await_state(&link, SatelliteState::Init, Duration::from_secs(2));
    drive(&link, "launch", None);
    await_state(&link, SatelliteState::Orbit, Duration::from_secs(2));
    drive(&link, "start", Some(Value::Str("run-0001".into())));
    await_state(&link, SatelliteState::Run, Duration::from_secs(5));

    // BOR first, carrying user tags and the applied configuration.
    let frames = pull.recv_multipart(0).expect("BOR expected");
    let bor = Cdtp2Message::disassemble(&frames).unwrap();
    assert_eq!(bor.msg_type, CdtpMessageType::Bor);
    assert_eq!(bor.sender, "Pusher.raw");
    let (user_tags, _config) = bor.marker_tags().unwrap();
    assert_eq!(user_tags.get("foo"), Some(&Value::Str("bar".into())));

    // All ten DATA records, strictly increasing from 2.
    let mut records = Vec::new();
    while records.len() < 10 {
        let frames = pull.recv_multipart(0).expect("DATA expected");
        let msg = Cdtp2Message::disassemble(&frames).unwrap();
        assert_eq!(msg.msg_type, CdtpMessageType::Data);
        records.extend(msg.into_records());
    }
    assert_eq!(records.len(), 10);
    assert_eq!(records[0].sequence_number, 2);
    assert!(records
        .windows(2)
        .all(|w| w[1].sequence_number == w[0].sequence_number + 1));
    let payload: usize = records.iter().map(DataRecord::payload_bytes).sum();
    assert_eq!(payload, 40);

    // Stop closes the run with an EOR whose numbers top every DATA record.
    drive(&link, "stop", None);
    let frames = pull.recv_multipart(0).expect("EOR expected");
    let eor = Cdtp2Message::disassemble(&frames).unwrap();
    assert_eq!(eor.msg_type, CdtpMessageType::Eor);
    let (user_tags, _metadata) = eor.marker_tags().unwrap();
    assert_eq!(user_tags.get("n"), Some(&Value::Int(10)));
    assert!(eor
        .records()
        .iter()
        .all(|r| r.sequence_number > records[9].sequence_number));
    await_state(&link, SatelliteState::Orbit, Duration::from_secs(5));
    assert_eq!(pushed.load(Ordering::Relaxed), 10);

    drive(&link, "shutdown", None);
    handle.join().expect("satellite loop exits");
}

#[test]
fn discovered_receiver_reconstructs_run() {
    let group = "edda_data2";

    // Transmitter satellite.
    let name = CanonicalName::new("Pusher", "disc").unwrap();
    let mut options = SatelliteOptions::new(name, group);
    options.data_role = DataRole::Transmitter;
    let pushed = Arc::new(AtomicUsize::new(0));
    let mut tx_satellite = Satellite::new(
        options,
        Box::new(PusherHooks {
            pushed: Arc::clone(&pushed),
        }),
    )
    .expect("transmitter starts");
    let tx_ports = tx_satellite.ports();
    let tx_handle = thread::spawn(move || tx_satellite.run());

    // Receiver satellite restricted to exactly this transmitter.
    let name = CanonicalName::new("Writer", "disc").unwrap();
    let mut options = SatelliteOptions::new(name, group);
    options.data_role = DataRole::Receiver;
    let record = Arc::new(Mutex::new(RunRecord::default()));
    let mut rx_satellite = Satellite::new(
        options,
        Box::new(CollectorHooks {
            record: Arc::clone(&record),
        }),
    )
    .expect("receiver starts");
    let rx_ports = rx_satellite.ports();
    let rx_handle = thread::spawn(move || rx_satellite.run());

    let tx = controller_link(tx_ports.cmd);
    let rx = controller_link(rx_ports.cmd);

    let mut rx_config = Map::new();
    rx_config.insert(
        "_data_transmitters".into(),
        Value::Array(vec![Value::Str("Pusher.disc".into())]),
    );
    drive(&rx, "initialize", Some(Value::Map(rx_config)));
    await_state(&rx, SatelliteState::Init, Duration::from_secs(2));
    drive(&tx, "initialize", Some(Value::Map(Map::new())));
    await_state(&tx, SatelliteState::Init, Duration::from_secs(2));

    // Launching the receiver requires the named transmitter to be
    // discovered; the transmitter's offers are already on the wire.
    drive(&rx, "launch", None);
    await_state(&rx, SatelliteState::Orbit, Duration::from_secs(5));
    drive(&tx, "launch", None);
    await_state(&tx, SatelliteState::Orbit, Duration::from_secs(2));

    drive(&rx, "start", Some(Value::Str("run-0002".into())));
    await_state(&rx, SatelliteState::Run, Duration::from_secs(5));
    drive(&tx, "start", Some(Value::Str("run-0002".into())));
    await_state(&tx, SatelliteState::Run, Duration::from_secs(5));

    // The full run arrives at the receiver.
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        let done = {
            let record = record.lock();
            record.bor_tags.is_some() && record.records.len() >= 10
        };
        if done {
            break;
        }
        thread::sleep(Duration::from_millis(100));
    }

    // Stop the transmitter first so its EOR reaches the receiver.
    drive(&tx, "stop", None);
    await_state(&tx, SatelliteState::Orbit, Duration::from_secs(5));
    drive(&rx, "stop", None);
    await_state(&rx, SatelliteState::Orbit, Duration::from_secs(15));

    {
        let record = record.lock();
        let bor_tags = record.bor_tags.as_ref().expect("BOR received");
        assert_eq!(bor_tags.get("foo"), Some(&Value::Str("bar".into())));
        assert_eq!(record.records.len(), 10);
        assert!(record
            .records
            .iter()
            .all(|r| r.blocks()[0] == vec![0xDE, 0xAD, 0xBE, 0xEF]));
        let eor_tags = record.eor_tags.as_ref().expect("EOR received");
        assert_eq!(eor_tags.get("n"), Some(&Value::Int(10)));
    }

    drive(&tx, "shutdown", None);
    drive(&rx, "shutdown", None);
    tx_handle.join().expect("transmitter loop exits");
    rx_handle.join().expect("receiver loop exits");
}
