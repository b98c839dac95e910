// SPDX-License-Identifier: Apache-2.0 OR MIT

//! CSCP message transmitter.
//!
//! Wraps one ZeroMQ socket for sending requests and replies. Transmissions
//! are single-writer per socket; concurrent sends are serialised with a
//! mutex.

use parking_lot::Mutex;

use crate::error::CscpError;
use crate::protocol::cscp1::{Cscp1Message, VerbType};
use crate::protocol::value::{Map, Value};

pub struct CommandTransmitter {
    name: String,
    socket: Mutex<zmq::Socket>,
}

impl CommandTransmitter {
    pub fn new(name: impl Into<String>, socket: zmq::Socket) -> CommandTransmitter {
        CommandTransmitter {
            name: name.into(),
            socket: Mutex::new(socket),
        }
    }

    /// Send a command request.
    pub fn send_request(
        &self,
        command: &str,
        payload: Option<Value>,
        tags: Option<Map>,
    ) -> Result<(), CscpError> {
        let mut msg = Cscp1Message::new(&self.name, VerbType::Request, command);
        msg.payload = payload;
        if let Some(tags) = tags {
            msg.header.tags = tags;
        }
        self.send(&msg)
    }

    /// Send a reply to a previously received request.
    pub fn send_reply(
        &self,
        reply: &str,
        verb: VerbType,
        payload: Option<Value>,
        tags: Option<Map>,
    ) -> Result<(), CscpError> {
        let mut msg = Cscp1Message::new(&self.name, verb, reply);
        msg.payload = payload;
        if let Some(tags) = tags {
            msg.header.tags = tags;
        }
        self.send(&msg)
    }

    /// Send a request and block for the typed reply.
    pub fn request_get_response(
        &self,
        command: &str,
        payload: Option<Value>,
        tags: Option<Map>,
    ) -> Result<Cscp1Message, CscpError> {
        let mut msg = Cscp1Message::new(&self.name, VerbType::Request, command);
        msg.payload = payload;
        if let Some(tags) = tags {
            msg.header.tags = tags;
        }
        let socket = self.socket.lock();
        socket.send_multipart(msg.assemble(), 0)?;
        let frames = socket.recv_multipart(0)?;
        Ok(Cscp1Message::disassemble(&frames)?)
    }

    /// Receive one message, or `None` in non-blocking mode with no data.
    ///
    /// The command text of requests is lower-cased on receipt.
    pub fn get_message(&self, nonblocking: bool) -> Result<Option<Cscp1Message>, CscpError> {
        let flags = if nonblocking { zmq::DONTWAIT } else { 0 };
        let frames = match self.socket.lock().recv_multipart(flags) {
            Ok(frames) => frames,
            Err(zmq::Error::EAGAIN) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut msg = Cscp1Message::disassemble(&frames)?;
        if msg.verb == VerbType::Request {
            msg.verb_msg = msg.verb_msg.to_lowercase();
        }
        Ok(Some(msg))
    }

    fn send(&self, msg: &Cscp1Message) -> Result<(), CscpError> {
        self.socket.lock().send_multipart(msg.assemble(), 0)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_reply_over_inproc_pair() {
        let ctx = zmq::Context::new();
        let rep = ctx.socket(zmq::REP).unwrap();
        rep.bind("inproc://cscp-test").unwrap();
        let req = ctx.socket(zmq::REQ).unwrap();
        req.connect("inproc://cscp-test").unwrap();

        let client = CommandTransmitter::new("ctrl.a", req);
        let server = CommandTransmitter::new("Mock.a", rep);

        client
            .send_request("Get_State", None, None)
            .expect("request sent");

        let request = server
            .get_message(false)
            .expect("receive works")
            .expect("request present");
        assert_eq!(request.verb, VerbType::Request);
        // Command text is lower-cased on receipt.
        assert_eq!(request.verb_msg, "get_state");

        server
            .send_reply("new", VerbType::Success, Some(Value::Int(0x10)), None)
            .expect("reply sent");

        let reply = client
            .get_message(false)
            .expect("receive works")
            .expect("reply present");
        assert_eq!(reply.verb, VerbType::Success);
        assert_eq!(reply.verb_msg, "new");
        assert_eq!(reply.payload, Some(Value::Int(0x10)));
    }

    #[test]
    fn nonblocking_receive_yields_none() {
        let ctx = zmq::Context::new();
        let rep = ctx.socket(zmq::REP).unwrap();
        rep.bind("inproc://cscp-test-empty").unwrap();
        let server = CommandTransmitter::new("Mock.a", rep);
        assert!(server.get_message(true).unwrap().is_none());
    }
}
