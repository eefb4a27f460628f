//! Non-blocking UDP transport.
//!
//! Features:
//! - Non-blocking I/O (absence of data is `Ok(None)`, not an error)
//! - Configurable socket buffer sizes
//! - Broadcast enabled for LAN discovery

use crate::transport::{DatagramSocket, TransportError, TransportResult};
use crate::{MAX_UDP_PACKET_SIZE, TransportConfig};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{SocketAddr, UdpSocket};

/// UDP transport
pub struct UdpTransport {
    socket: UdpSocket,
    recv_buffer_size: usize,
    send_buffer_size: usize,
}

impl UdpTransport {
    /// Create a new UDP transport bound to the given address with default
    /// configuration.
    ///
    /// # Examples
    /// ```no_run
    /// use wisp_transport::udp::UdpTransport;
    /// use std::net::SocketAddr;
    ///
    /// let addr: SocketAddr = "127.0.0.1:33445".parse().unwrap();
    /// let transport = UdpTransport::bind(addr).unwrap();
    /// println!("Listening on {}", transport.local_addr().unwrap());
    /// ```
    ///
    /// # Errors
    /// Returns an I/O error if the socket cannot be created or bound.
    pub fn bind<A: Into<SocketAddr>>(addr: A) -> io::Result<Self> {
        Self::bind_with_config(addr, &TransportConfig::default())
    }

    /// Create a new UDP transport with explicit buffer sizes.
    ///
    /// # Errors
    /// Returns an I/O error if the socket cannot be created or bound.
    pub fn bind_with_config<A: Into<SocketAddr>>(
        addr: A,
        config: &TransportConfig,
    ) -> io::Result<Self> {
        let addr = addr.into();

        let domain = if addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };

        let socket2 = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        socket2.set_nonblocking(true)?;
        socket2.set_recv_buffer_size(config.recv_buffer_size)?;
        socket2.set_send_buffer_size(config.send_buffer_size)?;
        if config.broadcast && addr.is_ipv4() {
            socket2.set_broadcast(true)?;
        }

        // The kernel may round the requested sizes
        let recv_buffer_size = socket2.recv_buffer_size()?;
        let send_buffer_size = socket2.send_buffer_size()?;

        socket2.bind(&addr.into())?;
        let socket: UdpSocket = socket2.into();

        tracing::debug!("UDP transport bound to {:?}", socket.local_addr());

        Ok(Self {
            socket,
            recv_buffer_size,
            send_buffer_size,
        })
    }

    /// Get the local address this socket is bound to
    ///
    /// # Errors
    /// Returns an I/O error if the address cannot be determined.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Get the receive buffer size in bytes
    #[must_use]
    pub fn recv_buffer_size(&self) -> usize {
        self.recv_buffer_size
    }

    /// Get the send buffer size in bytes
    #[must_use]
    pub fn send_buffer_size(&self) -> usize {
        self.send_buffer_size
    }
}

impl DatagramSocket for UdpTransport {
    fn send_to(&mut self, buf: &[u8], addr: SocketAddr) -> TransportResult<usize> {
        if buf.len() > MAX_UDP_PACKET_SIZE {
            return Err(TransportError::TooLarge {
                size: buf.len(),
                max: MAX_UDP_PACKET_SIZE,
            });
        }
        Ok(self.socket.send_to(buf, addr)?)
    }

    fn try_recv_from(&mut self, buf: &mut [u8]) -> TransportResult<Option<(usize, SocketAddr)>> {
        match self.socket.recv_from(buf) {
            Ok(received) => Ok(Some(received)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            // ICMP port unreachable from an earlier send surfaces here on some platforms
            Err(e) if e.kind() == io::ErrorKind::ConnectionReset => Ok(None),
            Err(e) => Err(TransportError::Io(e)),
        }
    }

    fn local_addr(&self) -> TransportResult<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}
