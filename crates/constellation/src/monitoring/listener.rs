// SPDX-License-Identifier: Apache-2.0 OR MIT

//! CMDP listener: subscribe to a remote monitoring service and decode
//! log records, metrics and notifications.

use std::time::Duration;

use crate::error::CscpError;
use crate::protocol::cmdp::CmdpMessage;

pub struct CmdpListener {
    socket: zmq::Socket,
}

impl CmdpListener {
    /// Connect a SUB socket to a monitoring endpoint.
    pub fn connect(context: &zmq::Context, endpoint: &str) -> Result<CmdpListener, zmq::Error> {
        let socket = context.socket(zmq::SUB)?;
        socket.connect(endpoint)?;
        Ok(CmdpListener { socket })
    }

    /// Subscribe to a topic prefix (`LOG/`, `LOG/WARNING/`, `STAT/FOO`, …).
    pub fn subscribe(&self, prefix: &str) -> Result<(), zmq::Error> {
        self.socket.set_subscribe(prefix.as_bytes())
    }

    pub fn unsubscribe(&self, prefix: &str) -> Result<(), zmq::Error> {
        self.socket.set_unsubscribe(prefix.as_bytes())
    }

    /// Bound the blocking receive; expired deadlines yield `None`.
    pub fn set_receive_timeout(&self, timeout: Duration) -> Result<(), zmq::Error> {
        let millis = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
        self.socket.set_rcvtimeo(millis)
    }

    /// Receive one monitoring message; `None` when no data is available.
    pub fn recv(&self, nonblocking: bool) -> Result<Option<CmdpMessage>, CscpError> {
        let flags = if nonblocking { zmq::DONTWAIT } else { 0 };
        let frames = match self.socket.recv_multipart(flags) {
            Ok(frames) => frames,
            Err(zmq::Error::EAGAIN) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(CmdpMessage::disassemble(&frames)?))
    }
}
