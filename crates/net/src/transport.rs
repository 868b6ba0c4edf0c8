use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, ToSocketAddrs, UdpSocket};

use crate::message::MAX_DATAGRAM_SIZE;

/// Non-blocking UDP socket owned by a host.
///
/// This is the only place the core touches the platform socket API. It moves
/// raw bytes and nothing else; framing, validation and retransmission all
/// live above it.
pub struct NetSocket {
    socket: UdpSocket,
    local_addr: SocketAddr,
    recv_buffer: [u8; MAX_DATAGRAM_SIZE],
}

impl NetSocket {
    /// Bind a socket and switch it to non-blocking mode.
    pub fn bind<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;

        let local_addr = socket.local_addr()?;

        Ok(Self {
            socket,
            local_addr,
            recv_buffer: [0u8; MAX_DATAGRAM_SIZE],
        })
    }

    /// Bind to an OS-assigned port on all interfaces.
    pub fn bind_ephemeral() -> io::Result<Self> {
        Self::bind("0.0.0.0:0")
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Allow sending to the broadcast address (LAN discovery).
    pub fn set_broadcast(&self, enabled: bool) -> io::Result<()> {
        self.socket.set_broadcast(enabled)
    }

    pub fn send_to(&self, data: &[u8], addr: SocketAddr) -> io::Result<usize> {
        self.socket.send_to(data, addr)
    }

    /// Receive one datagram if any is pending.
    ///
    /// Returns `Ok(None)` when the socket has no data (would block). Any
    /// other error is surfaced to the caller.
    pub fn recv_from(&mut self) -> io::Result<Option<(&[u8], SocketAddr)>> {
        match self.socket.recv_from(&mut self.recv_buffer) {
            Ok((size, addr)) => Ok(Some((&self.recv_buffer[..size], addr))),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Convert a v4 address to its 32-bit big-endian integer form.
pub fn ip_to_u32(ip: Ipv4Addr) -> u32 {
    u32::from_be_bytes(ip.octets())
}

/// Inverse of [`ip_to_u32`].
pub fn u32_to_ip(value: u32) -> Ipv4Addr {
    Ipv4Addr::from(value.to_be_bytes())
}

/// Build a socket address from the packed integer form.
pub fn u32_to_addr(ip: u32, port: u16) -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(u32_to_ip(ip), port))
}

/// Pack a socket address into (ip, port) integers. Non-v4 addresses map to
/// the unspecified address.
pub fn addr_to_u32(addr: SocketAddr) -> (u32, u16) {
    match addr {
        SocketAddr::V4(v4) => (ip_to_u32(*v4.ip()), v4.port()),
        SocketAddr::V6(v6) => (0, v6.port()),
    }
}
