//! DHT wire packets.
//!
//! Encrypted DHT packets share one envelope:
//!
//! ```text
//! [kind u8][sender pk 32][nonce 24][box(payload)]
//! ```
//!
//! LAN discovery is the only plaintext kind: `[0x21][pk 32]`.

use super::node::PackedNode;
use wisp_crypto::{MAC_SIZE, NONCE_SIZE, Nonce, PUBLIC_KEY_SIZE, PublicKey, SharedKey};
use wisp_transport::{PacketError, PacketKind, PacketReader, PacketWriter};

/// Most nodes carried by one nodes response
pub const MAX_SENT_NODES: usize = 4;

/// Smallest valid encrypted DHT packet
pub const MIN_ENCRYPTED_SIZE: usize = 1 + PUBLIC_KEY_SIZE + NONCE_SIZE + MAC_SIZE;

/// LAN discovery packet size
pub const LAN_DISCOVERY_SIZE: usize = 1 + PUBLIC_KEY_SIZE;

/// Encrypted envelope of a DHT packet
#[derive(Debug, Clone)]
pub struct DhtPacket<'a> {
    /// Packet kind
    pub kind: PacketKind,
    /// Sender's DHT key
    pub sender: PublicKey,
    /// Box nonce
    pub nonce: Nonce,
    /// Encrypted payload
    pub ciphertext: &'a [u8],
}

impl<'a> DhtPacket<'a> {
    /// Parse the envelope without decrypting.
    ///
    /// # Errors
    ///
    /// Returns an error for short packets and kinds that are not encrypted
    /// DHT kinds.
    pub fn parse(bytes: &'a [u8]) -> Result<Self, PacketError> {
        let kind = PacketKind::of(bytes)?;
        if !matches!(
            kind,
            PacketKind::PingRequest
                | PacketKind::PingResponse
                | PacketKind::NodesRequest
                | PacketKind::NodesResponse
        ) {
            return Err(PacketError::UnexpectedKind(kind));
        }
        if bytes.len() < MIN_ENCRYPTED_SIZE {
            return Err(PacketError::Truncated {
                needed: MIN_ENCRYPTED_SIZE,
                available: bytes.len(),
            });
        }

        let mut reader = PacketReader::new(&bytes[1..]);
        let sender = reader.key()?;
        let nonce = reader.nonce()?;
        Ok(Self {
            kind,
            sender,
            nonce,
            ciphertext: reader.rest(),
        })
    }

    /// Decrypt and decode the payload.
    ///
    /// # Errors
    ///
    /// Returns [`PacketError::Crypto`] on authentication failure and a
    /// decoding error for malformed plaintext.
    pub fn open(&self, key: &SharedKey) -> Result<DhtPayload, PacketError> {
        let plaintext = key.decrypt(&self.nonce, self.ciphertext)?;
        DhtPayload::decode(self.kind, &plaintext)
    }
}

/// Decrypted DHT payloads
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DhtPayload {
    /// Liveness probe
    PingRequest {
        /// Correlation id echoed by the response
        ping_id: u64,
    },
    /// Liveness reply
    PingResponse {
        /// Echoed correlation id
        ping_id: u64,
    },
    /// Find-node query
    NodesRequest {
        /// Key to find nodes close to
        target: PublicKey,
        /// Correlation id echoed by the response
        request_id: u64,
    },
    /// Find-node reply
    NodesResponse {
        /// Closest nodes the responder knows
        nodes: Vec<PackedNode>,
        /// Echoed correlation id
        request_id: u64,
    },
}

impl DhtPayload {
    /// Packet kind carrying this payload
    #[must_use]
    pub fn kind(&self) -> PacketKind {
        match self {
            Self::PingRequest { .. } => PacketKind::PingRequest,
            Self::PingResponse { .. } => PacketKind::PingResponse,
            Self::NodesRequest { .. } => PacketKind::NodesRequest,
            Self::NodesResponse { .. } => PacketKind::NodesResponse,
        }
    }

    /// Plaintext encoding
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn encode(&self) -> Vec<u8> {
        let mut writer = PacketWriter::new();
        match self {
            Self::PingRequest { ping_id } | Self::PingResponse { ping_id } => {
                writer.put_u64(*ping_id);
            }
            Self::NodesRequest { target, request_id } => {
                writer.put_key(target).put_u64(*request_id);
            }
            Self::NodesResponse { nodes, request_id } => {
                let count = nodes.len().min(MAX_SENT_NODES);
                writer.put_u8(count as u8);
                for node in &nodes[..count] {
                    node.write(&mut writer);
                }
                writer.put_u64(*request_id);
            }
        }
        writer.finish()
    }

    /// Decode a plaintext payload of the given kind.
    ///
    /// # Errors
    ///
    /// Returns an error on truncation, trailing bytes or a node count above
    /// [`MAX_SENT_NODES`].
    pub fn decode(kind: PacketKind, plaintext: &[u8]) -> Result<Self, PacketError> {
        let mut reader = PacketReader::new(plaintext);
        let payload = match kind {
            PacketKind::PingRequest => Self::PingRequest {
                ping_id: reader.u64()?,
            },
            PacketKind::PingResponse => Self::PingResponse {
                ping_id: reader.u64()?,
            },
            PacketKind::NodesRequest => Self::NodesRequest {
                target: reader.key()?,
                request_id: reader.u64()?,
            },
            PacketKind::NodesResponse => {
                let count = usize::from(reader.u8()?);
                if count > MAX_SENT_NODES {
                    return Err(PacketError::InvalidField("node count"));
                }
                let nodes = (0..count)
                    .map(|_| PackedNode::read(&mut reader))
                    .collect::<Result<Vec<_>, _>>()?;
                Self::NodesResponse {
                    nodes,
                    request_id: reader.u64()?,
                }
            }
            other => return Err(PacketError::UnexpectedKind(other)),
        };
        reader.finish()?;
        Ok(payload)
    }

    /// Encrypt into a full packet.
    ///
    /// # Errors
    ///
    /// Returns [`PacketError::Crypto`] if encryption fails.
    pub fn seal(&self, sender: &PublicKey, key: &SharedKey) -> Result<Vec<u8>, PacketError> {
        let nonce = Nonce::random();
        let ciphertext = key.encrypt(&nonce, &self.encode())?;
        let mut writer = PacketWriter::with_kind(self.kind());
        writer.put_key(sender).put_nonce(&nonce).put_bytes(&ciphertext);
        Ok(writer.finish())
    }
}

/// Build a LAN discovery packet
#[must_use]
pub fn lan_discovery_packet(own: &PublicKey) -> Vec<u8> {
    let mut writer = PacketWriter::with_kind(PacketKind::LanDiscovery);
    writer.put_key(own);
    writer.finish()
}

/// Parse a LAN discovery packet.
///
/// # Errors
///
/// Returns an error unless the packet is exactly a kind byte and a key.
pub fn parse_lan_discovery(bytes: &[u8]) -> Result<PublicKey, PacketError> {
    let mut reader = PacketReader::expect_kind(bytes, PacketKind::LanDiscovery)?;
    let key = reader.key()?;
    reader.finish()?;
    Ok(key)
}
