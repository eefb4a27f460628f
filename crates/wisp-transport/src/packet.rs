//! Packet kinds.
//!
//! Every wisp packet, whether it arrived over UDP or inside a relay
//! frame, starts with one kind byte. Decoding that byte into a
//! [`PacketKind`] and matching on it is the only dispatch mechanism.

use wisp_crypto::CryptoError;

/// Packet decoding errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PacketError {
    /// Packet shorter than its fixed layout
    #[error("packet truncated: needed {needed} bytes, {available} available")]
    Truncated {
        /// Bytes needed
        needed: usize,
        /// Bytes available
        available: usize,
    },

    /// Unknown kind byte
    #[error("unknown packet kind: 0x{0:02x}")]
    UnknownKind(u8),

    /// Kind byte valid but not what the parser expected
    #[error("unexpected packet kind: {0:?}")]
    UnexpectedKind(PacketKind),

    /// Unknown address family in a packed address
    #[error("invalid address family: {0}")]
    InvalidAddressFamily(u8),

    /// A field holds a value outside its domain
    #[error("invalid field: {0}")]
    InvalidField(&'static str),

    /// Packet exceeds the size limit for its kind
    #[error("packet too large: {size} bytes (max {max})")]
    TooLarge {
        /// Packet size
        size: usize,
        /// Maximum size
        max: usize,
    },

    /// Authentication or key agreement failed
    #[error("crypto: {0}")]
    Crypto(#[from] CryptoError),
}

/// Layer that owns a packet kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layer {
    /// Routing table maintenance and LAN discovery
    Dht,
    /// Onion forwarding, announce and onion data
    Onion,
    /// Crypto connection handshake and data
    NetCrypto,
}

/// Packet kind (first byte of every packet)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketKind {
    /// DHT ping request
    PingRequest = 0x00,
    /// DHT ping response
    PingResponse = 0x01,
    /// DHT find-node request
    NodesRequest = 0x02,
    /// DHT find-node response
    NodesResponse = 0x04,
    /// Cookie request (pre-handshake)
    CookieRequest = 0x18,
    /// Cookie response
    CookieResponse = 0x19,
    /// Crypto connection handshake
    CryptoHandshake = 0x1a,
    /// Crypto connection data
    CryptoData = 0x1b,
    /// LAN discovery presence
    LanDiscovery = 0x21,
    /// Onion request entering hop 1
    OnionRequest0 = 0x80,
    /// Onion request entering hop 2
    OnionRequest1 = 0x81,
    /// Onion request entering hop 3
    OnionRequest2 = 0x82,
    /// Announce request (delivered by hop 3)
    AnnounceRequest = 0x83,
    /// Announce response (returned along the onion path)
    AnnounceResponse = 0x84,
    /// Onion data request for a stored announcer
    OnionDataRequest = 0x85,
    /// Onion data delivered to an announcer
    OnionDataResponse = 0x86,
    /// Response travelling back to hop 3
    OnionResponse3 = 0x8c,
    /// Response travelling back to hop 2
    OnionResponse2 = 0x8d,
    /// Response travelling back to hop 1
    OnionResponse1 = 0x8e,
}

impl PacketKind {
    /// Decode the kind byte of a packet.
    ///
    /// # Errors
    ///
    /// Returns [`PacketError::Truncated`] for an empty packet and
    /// [`PacketError::UnknownKind`] for an unassigned byte.
    pub fn of(packet: &[u8]) -> Result<Self, PacketError> {
        let first = packet.first().ok_or(PacketError::Truncated {
            needed: 1,
            available: 0,
        })?;
        Self::try_from(*first)
    }

    /// Owning layer for dispatch
    #[must_use]
    pub fn layer(self) -> Layer {
        match self {
            Self::PingRequest
            | Self::PingResponse
            | Self::NodesRequest
            | Self::NodesResponse
            | Self::LanDiscovery => Layer::Dht,
            Self::CookieRequest
            | Self::CookieResponse
            | Self::CryptoHandshake
            | Self::CryptoData => Layer::NetCrypto,
            Self::OnionRequest0
            | Self::OnionRequest1
            | Self::OnionRequest2
            | Self::AnnounceRequest
            | Self::AnnounceResponse
            | Self::OnionDataRequest
            | Self::OnionDataResponse
            | Self::OnionResponse3
            | Self::OnionResponse2
            | Self::OnionResponse1 => Layer::Onion,
        }
    }

    /// Whether this kind may arrive inside a relay frame
    #[must_use]
    pub fn relayable(self) -> bool {
        matches!(self.layer(), Layer::NetCrypto)
    }
}

impl TryFrom<u8> for PacketKind {
    type Error = PacketError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Self::PingRequest),
            0x01 => Ok(Self::PingResponse),
            0x02 => Ok(Self::NodesRequest),
            0x04 => Ok(Self::NodesResponse),
            0x18 => Ok(Self::CookieRequest),
            0x19 => Ok(Self::CookieResponse),
            0x1a => Ok(Self::CryptoHandshake),
            0x1b => Ok(Self::CryptoData),
            0x21 => Ok(Self::LanDiscovery),
            0x80 => Ok(Self::OnionRequest0),
            0x81 => Ok(Self::OnionRequest1),
            0x82 => Ok(Self::OnionRequest2),
            0x83 => Ok(Self::AnnounceRequest),
            0x84 => Ok(Self::AnnounceResponse),
            0x85 => Ok(Self::OnionDataRequest),
            0x86 => Ok(Self::OnionDataResponse),
            0x8c => Ok(Self::OnionResponse3),
            0x8d => Ok(Self::OnionResponse2),
            0x8e => Ok(Self::OnionResponse1),
            other => Err(PacketError::UnknownKind(other)),
        }
    }
}

impl From<PacketKind> for u8 {
    fn from(kind: PacketKind) -> Self {
        kind as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [PacketKind; 19] = [
        PacketKind::PingRequest,
        PacketKind::PingResponse,
        PacketKind::NodesRequest,
        PacketKind::NodesResponse,
        PacketKind::CookieRequest,
        PacketKind::CookieResponse,
        PacketKind::CryptoHandshake,
        PacketKind::CryptoData,
        PacketKind::LanDiscovery,
        PacketKind::OnionRequest0,
        PacketKind::OnionRequest1,
        PacketKind::OnionRequest2,
        PacketKind::AnnounceRequest,
        PacketKind::AnnounceResponse,
        PacketKind::OnionDataRequest,
        PacketKind::OnionDataResponse,
        PacketKind::OnionResponse3,
        PacketKind::OnionResponse2,
        PacketKind::OnionResponse1,
    ];

    #[test]
    fn test_kind_byte_roundtrip() {
        for kind in ALL {
            assert_eq!(PacketKind::try_from(u8::from(kind)).unwrap(), kind);
        }
    }

    #[test]
    fn test_unknown_kind() {
        assert_eq!(
            PacketKind::try_from(0x03),
            Err(PacketError::UnknownKind(0x03))
        );
        assert_eq!(
            PacketKind::try_from(0xff),
            Err(PacketError::UnknownKind(0xff))
        );
    }

    #[test]
    fn test_of_empty_packet() {
        assert!(matches!(
            PacketKind::of(&[]),
            Err(PacketError::Truncated { .. })
        ));
        assert_eq!(PacketKind::of(&[0x1b, 1, 2]).unwrap(), PacketKind::CryptoData);
    }

    #[test]
    fn test_layers() {
        assert_eq!(PacketKind::PingRequest.layer(), Layer::Dht);
        assert_eq!(PacketKind::LanDiscovery.layer(), Layer::Dht);
        assert_eq!(PacketKind::CryptoData.layer(), Layer::NetCrypto);
        assert_eq!(PacketKind::OnionResponse1.layer(), Layer::Onion);
        assert!(PacketKind::CookieRequest.relayable());
        assert!(!PacketKind::NodesRequest.relayable());
    }
}
