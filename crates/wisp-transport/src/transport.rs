//! Datagram socket abstraction.
//!
//! Every protocol layer is sans-IO: it queues [`Transmit`]s and consumes
//! received bytes. The host pumps those through a [`DatagramSocket`], which
//! lets the same node run on a real UDP socket or on an in-memory network.

use std::io;
use std::net::SocketAddr;

/// Transport layer errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// I/O error from underlying transport
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Datagram larger than the transport accepts
    #[error("Datagram too large: {size} bytes (max {max})")]
    TooLarge {
        /// Datagram size
        size: usize,
        /// Maximum size
        max: usize,
    },
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Non-blocking datagram socket.
pub trait DatagramSocket {
    /// Send one datagram.
    ///
    /// # Errors
    /// Returns `TransportError` if the send fails. `WouldBlock` is reported
    /// as an error so the caller can count it as a failed send.
    fn send_to(&mut self, buf: &[u8], addr: SocketAddr) -> TransportResult<usize>;

    /// Receive one datagram if one is pending.
    ///
    /// Returns `Ok(None)` when nothing is waiting.
    ///
    /// # Errors
    /// Returns `TransportError` on socket failure.
    fn try_recv_from(&mut self, buf: &mut [u8]) -> TransportResult<Option<(usize, SocketAddr)>>;

    /// Get the local address this socket is bound to.
    ///
    /// # Errors
    /// Returns `TransportError` if the address cannot be determined
    fn local_addr(&self) -> TransportResult<SocketAddr>;
}

/// An outgoing datagram produced by a protocol layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transmit {
    /// Destination address
    pub dest: SocketAddr,
    /// Packet bytes, kind byte first
    pub payload: Vec<u8>,
}

impl Transmit {
    /// Create a new transmit
    #[must_use]
    pub fn new(dest: SocketAddr, payload: Vec<u8>) -> Self {
        Self { dest, payload }
    }
}

/// Transport statistics
#[derive(Debug, Clone, Default)]
pub struct TransportStats {
    /// Total bytes sent
    pub bytes_sent: u64,
    /// Total bytes received
    pub bytes_received: u64,
    /// Total packets sent
    pub packets_sent: u64,
    /// Total packets received
    pub packets_received: u64,
    /// Send errors
    pub send_errors: u64,
    /// Receive errors
    pub recv_errors: u64,
}

impl TransportStats {
    /// Record a successful send
    pub fn record_send(&mut self, bytes: usize) {
        self.packets_sent += 1;
        self.bytes_sent += bytes as u64;
    }

    /// Record a successful receive
    pub fn record_recv(&mut self, bytes: usize) {
        self.packets_received += 1;
        self.bytes_received += bytes as u64;
    }

    /// Record a send error
    pub fn record_send_error(&mut self) {
        self.send_errors += 1;
    }

    /// Record a receive error
    pub fn record_recv_error(&mut self) {
        self.recv_errors += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_recording() {
        let mut stats = TransportStats::default();
        stats.record_send(100);
        stats.record_send(50);
        stats.record_recv(20);
        stats.record_send_error();

        assert_eq!(stats.packets_sent, 2);
        assert_eq!(stats.bytes_sent, 150);
        assert_eq!(stats.packets_received, 1);
        assert_eq!(stats.bytes_received, 20);
        assert_eq!(stats.send_errors, 1);
        assert_eq!(stats.recv_errors, 0);
    }

    #[test]
    fn test_error_display() {
        let err = TransportError::TooLarge { size: 3000, max: 2048 };
        assert_eq!(err.to_string(), "Datagram too large: 3000 bytes (max 2048)");
    }
}
