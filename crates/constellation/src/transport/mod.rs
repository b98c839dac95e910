// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Network transport helpers: multicast sockets and interface discovery.

mod multicast;

pub use multicast::{interface_addresses, MulticastMessage, MulticastSocket};

/// Bind a ZeroMQ socket to a TCP port, or to an ephemeral port when
/// `port` is zero. Returns the port actually bound.
pub(crate) fn bind_tcp(socket: &zmq::Socket, port: u16) -> Result<u16, zmq::Error> {
    if port == 0 {
        socket.bind("tcp://*:*")?;
    } else {
        socket.bind(&format!("tcp://*:{port}"))?;
    }
    let endpoint = socket
        .get_last_endpoint()?
        .map_err(|_| zmq::Error::EINVAL)?;
    endpoint
        .rsplit_once(':')
        .and_then(|(_, port)| port.parse().ok())
        .ok_or(zmq::Error::EINVAL)
}
