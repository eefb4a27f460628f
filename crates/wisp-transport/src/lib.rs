//! # wisp Transport
//!
//! Network I/O layer for wisp.
//!
//! This crate provides:
//! - A non-blocking UDP socket ([`udp::UdpTransport`]) behind the
//!   [`transport::DatagramSocket`] trait
//! - The packet-kind byte shared by UDP and relay-delivered packets
//!   ([`packet::PacketKind`])
//! - Bounds-checked wire readers and writers, including packed addresses
//! - Periodic timers re-checked on every tick
//! - Logging initialization
//!
//! Nothing here blocks: a receive with no pending datagram returns `Ok(None)`.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod logging;
pub mod packet;
pub mod timer;
pub mod transport;
pub mod udp;
pub mod wire;

pub use packet::{Layer, PacketError, PacketKind};
pub use timer::Interval;
pub use transport::{DatagramSocket, Transmit, TransportError, TransportResult, TransportStats};
pub use udp::UdpTransport;
pub use wire::{PacketReader, PacketWriter};

/// Largest UDP payload wisp sends or accepts
pub const MAX_UDP_PACKET_SIZE: usize = 2048;

/// Transport configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Receive buffer size requested from the kernel
    pub recv_buffer_size: usize,
    /// Send buffer size requested from the kernel
    pub send_buffer_size: usize,
    /// Allow sending to broadcast addresses (LAN discovery)
    pub broadcast: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            recv_buffer_size: 256 * 1024,
            send_buffer_size: 256 * 1024,
            broadcast: true,
        }
    }
}
