// SPDX-License-Identifier: Apache-2.0 OR MIT

//! IPv4 multicast send/receive socket.
//!
//! One receive socket is bound to the wildcard address on the advertised
//! port and joins the multicast group on every configured interface. One
//! send socket per interface fans outgoing datagrams to all of them.
//! Loopback is disabled on send sockets except on the loopback interface,
//! which is added explicitly.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};

use crate::error::ChirpError;

/// Maximum datagram size read from the wire.
const MESSAGE_BUFFER: usize = 1024;
/// Multicast TTL (network hops).
const MULTICAST_TTL: u32 = 8;
/// Receive deadline per [`MulticastSocket::recv`] call.
const RECV_TIMEOUT: Duration = Duration::from_millis(50);

/// A received datagram with its sender address.
#[derive(Debug, Clone)]
pub struct MulticastMessage {
    pub content: Vec<u8>,
    pub address: IpAddr,
}

/// Multicast socket fanning sends over all configured interfaces.
pub struct MulticastSocket {
    endpoint: SocketAddrV4,
    send_sockets: Vec<UdpSocket>,
    recv_socket: UdpSocket,
}

impl MulticastSocket {
    pub fn new(
        interfaces: &[Ipv4Addr],
        group: Ipv4Addr,
        port: u16,
    ) -> io::Result<MulticastSocket> {
        let mut send_sockets = Vec::with_capacity(interfaces.len());
        for interface in interfaces {
            let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
            socket.set_reuse_address(true)?;
            socket.set_multicast_ttl_v4(MULTICAST_TTL)?;
            // Loopback interface is in the interface list explicitly.
            socket.set_multicast_loop_v4(interface.is_loopback())?;
            socket.set_multicast_if_v4(interface)?;
            send_sockets.push(socket.into());
        }

        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        #[cfg(not(windows))]
        socket.set_reuse_port(true)?;
        socket.set_multicast_loop_v4(true)?;
        socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)).into())?;
        for interface in interfaces {
            match socket.join_multicast_v4(&group, interface) {
                Ok(()) => {}
                // Already joined on the same physical NIC.
                Err(e) if e.raw_os_error() == Some(98) => {
                    log::debug!("[multicast] join {group} on {interface}: already joined");
                }
                Err(e) => {
                    log::debug!("[multicast] join {group} on {interface} failed (non-fatal): {e}");
                }
            }
        }
        let recv_socket: UdpSocket = socket.into();
        recv_socket.set_read_timeout(Some(RECV_TIMEOUT))?;

        Ok(MulticastSocket {
            endpoint: SocketAddrV4::new(group, port),
            send_sockets,
            recv_socket,
        })
    }

    /// Fan a datagram out to the multicast group on every interface.
    ///
    /// Succeeds if at least one interface accepted the datagram; an
    /// interface without a multicast route must not take the others down.
    pub fn send(&self, message: &[u8]) -> io::Result<()> {
        let mut sent = false;
        let mut last_err = None;
        for socket in &self.send_sockets {
            match socket.send_to(message, self.endpoint) {
                Ok(_) => sent = true,
                Err(e) => {
                    log::debug!("[multicast] send failed on one interface: {e}");
                    last_err = Some(e);
                }
            }
        }
        if sent {
            Ok(())
        } else {
            Err(last_err
                .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "no send sockets")))
        }
    }

    /// Read one datagram, or `None` when the 50 ms deadline expires.
    pub fn recv(&self) -> io::Result<Option<MulticastMessage>> {
        let mut buf = [0u8; MESSAGE_BUFFER];
        match self.recv_socket.recv_from(&mut buf) {
            Ok((len, sender)) => Ok(Some(MulticastMessage {
                content: buf[..len].to_vec(),
                address: sender.ip(),
            })),
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut =>
            {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

/// Resolve the IPv4 addresses to use for multicast.
///
/// `interfaces` entries may be interface names (`eth0`) or IPv4 addresses;
/// `None` selects every IPv4 interface on the host, loopback included.
pub fn interface_addresses(interfaces: Option<&[String]>) -> Result<Vec<Ipv4Addr>, ChirpError> {
    let netifas = local_ip_address::list_afinet_netifas().map_err(|e| {
        ChirpError::Socket(io::Error::new(io::ErrorKind::Other, e.to_string()))
    })?;

    let mut addresses = Vec::new();
    for (name, ip) in netifas {
        let IpAddr::V4(ipv4) = ip else { continue };
        let selected = match interfaces {
            None => true,
            Some(wanted) => wanted
                .iter()
                .any(|w| w == &name || w.parse::<Ipv4Addr>() == Ok(ipv4)),
        };
        if selected && !addresses.contains(&ipv4) {
            addresses.push(ipv4);
        }
    }

    if addresses.is_empty() {
        return Err(ChirpError::NoInterface(
            interfaces.map(<[String]>::to_vec).unwrap_or_default(),
        ));
    }
    Ok(addresses)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_roundtrip() {
        let interfaces = [Ipv4Addr::LOCALHOST];
        // High port away from the well-known CHIRP port to avoid clashes.
        let socket = MulticastSocket::new(&interfaces, Ipv4Addr::new(239, 192, 7, 123), 17123)
            .expect("multicast socket");
        socket.send(b"chirp test datagram").expect("send");

        // The datagram loops back on the loopback interface.
        let mut received = None;
        for _ in 0..20 {
            if let Some(msg) = socket.recv().expect("recv") {
                received = Some(msg);
                break;
            }
        }
        let msg = received.expect("datagram should loop back");
        assert_eq!(msg.content, b"chirp test datagram");
    }

    #[test]
    fn recv_times_out_quietly() {
        let interfaces = [Ipv4Addr::LOCALHOST];
        let socket = MulticastSocket::new(&interfaces, Ipv4Addr::new(239, 192, 7, 123), 17124)
            .expect("multicast socket");
        assert!(socket.recv().expect("recv").is_none());
    }

    #[test]
    fn interface_listing_is_not_empty() {
        let addresses = interface_addresses(None).expect("interfaces");
        assert!(!addresses.is_empty());
    }
}
