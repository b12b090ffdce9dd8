//! UDP endpoints.
//!
//! A [`SocketAddress`] pairs a remote endpoint with the local transport
//! used to reach it. Equality and ordering cover only the endpoint, so
//! a received datagram's source can be matched against a peer's stored
//! address regardless of which local socket it arrived on. Sockets are
//! built through socket2 so the send and receive buffers can be sized
//! for burst absorption.

use std::cmp::Ordering;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::Arc;

use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;

use jamlink_proto::FRAME_BYTES;

#[derive(Debug, Error)]
pub enum SocketError {
    #[error("cannot bind UDP port: {0}")]
    Bind(std::io::Error),
    #[error("cannot resolve {0}")]
    Resolve(String),
    #[error("cannot start thread: {0}")]
    Thread(std::io::Error),
}

/// How frames leave the process.
#[derive(Clone, Default)]
pub enum Transport {
    /// No transport attached; sends are silently dropped.
    #[default]
    None,
    /// A bound UDP socket.
    Udp(Arc<UdpSocket>),
    /// In-process delivery of `(destination, frame bytes)`. Used by
    /// embedders and tests that shuttle frames without a network.
    Queue(crossbeam_channel::Sender<(SocketAddr, Box<[u8]>)>),
}

/// Remote endpoint plus the local transport for reaching it.
#[derive(Clone, Default)]
pub struct SocketAddress {
    addr: Option<SocketAddr>,
    transport: Transport,
}

impl SocketAddress {
    pub fn invalid() -> Self {
        Self::default()
    }

    pub fn new(addr: SocketAddr, transport: Transport) -> Self {
        Self {
            addr: Some(addr),
            transport,
        }
    }

    /// Endpoint without a transport; sends are dropped.
    pub fn from_addr(addr: SocketAddr) -> Self {
        Self::new(addr, Transport::None)
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    pub fn valid(&self) -> bool {
        self.addr.is_some()
    }

    pub fn addr(&self) -> Option<SocketAddr> {
        self.addr
    }

    pub fn is_ipv6(&self) -> bool {
        matches!(self.addr, Some(SocketAddr::V6(_)))
    }

    /// Swap the local transport, keeping the endpoint.
    pub fn set_transport(&mut self, transport: Transport) {
        self.transport = transport;
    }

    /// Same endpoint, different port.
    pub fn with_port(&self, port: u16) -> Self {
        let mut out = self.clone();
        if let Some(addr) = &mut out.addr {
            addr.set_port(port);
        }
        out
    }

    /// Fire one datagram at the endpoint. UDP is best effort: failures
    /// are dropped, a missing transport is a no-op.
    pub fn send_frame(&self, bytes: &[u8]) {
        let Some(addr) = self.addr else {
            return;
        };
        match &self.transport {
            Transport::None => {}
            Transport::Udp(sock) => {
                let _ = sock.send_to(bytes, addr);
            }
            Transport::Queue(tx) => {
                let _ = tx.send((addr, bytes.into()));
            }
        }
    }

    fn rank(&self) -> u8 {
        match self.addr {
            None => 0,
            Some(SocketAddr::V4(_)) => 1,
            Some(SocketAddr::V6(_)) => 2,
        }
    }

    fn key(&self) -> (u8, u16, u128) {
        match self.addr {
            None => (0, 0, 0),
            Some(SocketAddr::V4(a)) => (1, a.port(), u32::from(*a.ip()) as u128),
            Some(SocketAddr::V6(a)) => (2, a.port(), u128::from(*a.ip())),
        }
    }
}

impl PartialEq for SocketAddress {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for SocketAddress {}

impl PartialOrd for SocketAddress {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SocketAddress {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

impl std::fmt::Debug for SocketAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.addr {
            Some(addr) => write!(f, "SocketAddress({})", addr),
            None => write!(f, "SocketAddress(invalid)"),
        }
    }
}

/// Resolve a host/port pair, preferring IPv4 results.
pub fn resolve(host: &str, port: u16) -> Result<SocketAddr, SocketError> {
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|_| SocketError::Resolve(host.to_string()))?
        .collect();

    addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| SocketError::Resolve(host.to_string()))
}

/// Bind a UDP socket with sized buffers, retrying on consecutive ports.
/// Returns the socket and the port actually bound.
pub fn bind_udp(
    ipv6: bool,
    mut port: u16,
    buffer_size: usize,
    tries: u16,
) -> Result<(Arc<UdpSocket>, u16), SocketError> {
    let domain = if ipv6 { Domain::IPV6 } else { Domain::IPV4 };
    let mut last_err = None;

    for _ in 0..tries.max(1) {
        let sock = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).map_err(SocketError::Bind)?;
        let _ = sock.set_send_buffer_size(buffer_size);
        let _ = sock.set_recv_buffer_size(buffer_size);
        if ipv6 {
            let _ = sock.set_only_v6(true);
        }

        let bind_ip: IpAddr = if ipv6 {
            Ipv6Addr::UNSPECIFIED.into()
        } else {
            Ipv4Addr::UNSPECIFIED.into()
        };
        match sock.bind(&SocketAddr::new(bind_ip, port).into()) {
            Ok(()) => {
                let sock: UdpSocket = sock.into();
                let bound = sock
                    .local_addr()
                    .map_err(SocketError::Bind)?
                    .port();
                return Ok((Arc::new(sock), bound));
            }
            Err(err) => {
                last_err = Some(err);
                port = port.wrapping_add(1);
            }
        }
    }

    Err(SocketError::Bind(last_err.unwrap_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::AddrInUse, "no port available")
    })))
}

/// Blocking receive loop: zero-fill short datagrams to a full frame and
/// hand them to `deliver` together with their source address.
pub fn receive_loop<F>(sock: Arc<UdpSocket>, transport: Transport, deliver: F)
where
    F: Fn(SocketAddress, &[u8; FRAME_BYTES]),
{
    let mut buf = [0u8; FRAME_BYTES];

    loop {
        match sock.recv_from(&mut buf) {
            Ok((len, src)) => {
                if len < 1 {
                    continue;
                }
                buf[len..].fill(0);
                deliver(SocketAddress::new(src, transport.clone()), &buf);
            }
            Err(err) => {
                log::warn!("udp receive failed: {}", err);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4(text: &str) -> SocketAddress {
        SocketAddress::from_addr(text.parse().unwrap())
    }

    #[test]
    fn ordering_is_total_across_families() {
        let a = v4("10.0.0.1:100");
        let b = v4("10.0.0.2:100");
        let c = v4("10.0.0.1:101");
        let d = SocketAddress::from_addr("[2001:db8::1]:100".parse().unwrap());
        let none = SocketAddress::invalid();

        assert!(a < b);
        assert!(a < c); // port compares before address
        assert!(b < c);
        assert!(c < d); // v4 sorts before v6
        assert!(none < a);
        assert_eq!(a, v4("10.0.0.1:100"));
    }

    #[test]
    fn equality_ignores_transport() {
        let (tx, _rx) = crossbeam_channel::unbounded();
        let mut a = v4("10.0.0.1:100");
        let b = v4("10.0.0.1:100");
        a.set_transport(Transport::Queue(tx));
        assert_eq!(a, b);
    }

    #[test]
    fn queue_transport_captures_frames() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let addr = SocketAddress::new("127.0.0.1:9999".parse().unwrap(), Transport::Queue(tx));
        addr.send_frame(&[1, 2, 3]);

        let (dst, bytes) = rx.try_recv().unwrap();
        assert_eq!(dst, "127.0.0.1:9999".parse::<SocketAddr>().unwrap());
        assert_eq!(&bytes[..], &[1, 2, 3]);
    }

    #[test]
    fn invalid_address_drops_sends() {
        SocketAddress::invalid().send_frame(&[0; 16]);
    }

    #[test]
    fn with_port_changes_only_the_port() {
        let a = v4("10.0.0.1:100");
        let b = a.with_port(115);
        assert_eq!(b.addr().unwrap().port(), 115);
        assert_eq!(b.addr().unwrap().ip(), a.addr().unwrap().ip());
    }
}
