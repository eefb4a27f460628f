//! Relay wire protocol.
//!
//! A relay connection starts with a one-round handshake boxed between the
//! long-term keys of client and relay, which exchanges temporary keys and
//! base nonces. Everything after it is a stream of frames:
//!
//! ```text
//! [len u16 be][seal(session key, base nonce + n, bincode(RelayMessage))]
//! ```
//!
//! `n` counts frames in each direction separately. TCP delivers frames in
//! order, so the counter is implicit and a frame that fails to open means
//! the stream is corrupt.

use serde::{Deserialize, Serialize};
use std::io;
use wisp_crypto::{
    CryptoError, KeyPair, MAC_SIZE, NONCE_SIZE, Nonce, PUBLIC_KEY_SIZE, PublicKey, SharedKey,
};
use wisp_transport::{PacketError, PacketReader, PacketWriter};

/// Route slot on one relay connection
pub type ConnectionId = u8;

/// Routes one client may hold on a relay
pub const MAX_ROUTES: usize = 240;

/// Largest sealed frame body
pub const MAX_FRAME_SIZE: usize = 4096;

const HANDSHAKE_PLAIN_SIZE: usize = PUBLIC_KEY_SIZE + NONCE_SIZE;

/// Client hello: `[client pk][nonce][box(temp pk, base nonce)]`
pub const CLIENT_HANDSHAKE_SIZE: usize =
    PUBLIC_KEY_SIZE + NONCE_SIZE + HANDSHAKE_PLAIN_SIZE + MAC_SIZE;

/// Relay reply: `[nonce][box(temp pk, base nonce)]`
pub const SERVER_HANDSHAKE_SIZE: usize = NONCE_SIZE + HANDSHAKE_PLAIN_SIZE + MAC_SIZE;

/// Relay protocol messages
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum RelayMessage {
    /// Client asks for a route to `key`
    RouteRequest {
        /// Peer to route to
        key: PublicKey,
    },

    /// Relay assigns a route slot, or refuses with `None`
    RouteResponse {
        /// Assigned slot
        connection_id: Option<ConnectionId>,
        /// Peer the route is for
        key: PublicKey,
    },

    /// Both ends of a route are present
    ConnectNotification {
        /// Route slot
        connection_id: ConnectionId,
    },

    /// Route closed (sent by either side)
    DisconnectNotification {
        /// Route slot
        connection_id: ConnectionId,
    },

    /// Keepalive probe
    Ping {
        /// Echoed in the pong
        ping_id: u64,
    },

    /// Keepalive answer
    Pong {
        /// Id from the ping
        ping_id: u64,
    },

    /// One-off delivery to a client of this relay without a route
    OobSend {
        /// Destination client
        key: PublicKey,
        /// Opaque bytes
        payload: Vec<u8>,
    },

    /// Out-of-band delivery from another client
    OobRecv {
        /// Sending client
        sender: PublicKey,
        /// Opaque bytes
        payload: Vec<u8>,
    },

    /// Opaque bytes over a route
    Data {
        /// Route slot on the receiving connection
        connection_id: ConnectionId,
        /// Opaque bytes
        payload: Vec<u8>,
    },
}

impl RelayMessage {
    /// Serialize message to bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, RelayError> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserialize message from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, RelayError> {
        Ok(bincode::deserialize(bytes)?)
    }

    /// Get the message type name
    pub fn message_type(&self) -> &'static str {
        match self {
            RelayMessage::RouteRequest { .. } => "RouteRequest",
            RelayMessage::RouteResponse { .. } => "RouteResponse",
            RelayMessage::ConnectNotification { .. } => "ConnectNotification",
            RelayMessage::DisconnectNotification { .. } => "DisconnectNotification",
            RelayMessage::Ping { .. } => "Ping",
            RelayMessage::Pong { .. } => "Pong",
            RelayMessage::OobSend { .. } => "OobSend",
            RelayMessage::OobRecv { .. } => "OobRecv",
            RelayMessage::Data { .. } => "Data",
        }
    }
}

/// Relay errors
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Message encoding failed
    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    /// Handshake bytes malformed
    #[error("packet error: {0}")]
    Packet(#[from] PacketError),

    /// Handshake or frame did not open
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Network I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Handshake had the wrong size
    #[error("invalid handshake")]
    InvalidHandshake,

    /// Frame length outside bounds
    #[error("invalid frame length: {0}")]
    InvalidFrameLength(usize),

    /// Message does not fit in a frame
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge {
        /// Sealed size
        size: usize,
        /// Limit
        max: usize,
    },

    /// Link not (or no longer) connected
    #[error("relay link not connected")]
    NotConnected,

    /// No route to the peer on this link
    #[error("no route to peer {0}")]
    NoRoute(PublicKey),

    /// Route exists but the peer is not connected to the relay
    #[error("peer {0} offline on this relay")]
    PeerOffline(PublicKey),

    /// Every relay failed or none has a route
    #[error("no relay could deliver to {0}")]
    NoRelay(PublicKey),

    /// Route slots exhausted
    #[error("too many routes (max {0})")]
    TooManyRoutes(usize),

    /// Relay address not in the pool
    #[error("unknown relay {0}")]
    UnknownRelay(std::net::SocketAddr),

    /// Server connection id not known
    #[error("unknown connection {0}")]
    UnknownConnection(u64),

    /// Server at capacity
    #[error("server at capacity")]
    ServerFull,

    /// Sender exceeded its frame rate
    #[error("rate limited")]
    RateLimited,

    /// Keepalive or handshake timed out
    #[error("relay timed out")]
    Timeout,

    /// Routing to oneself
    #[error("cannot route to own key")]
    SelfRoute,
}

/// Frame sealing state for one direction pair of a relay connection.
pub struct FrameCodec {
    key: SharedKey,
    send_base: Nonce,
    sent: u64,
    recv_base: Nonce,
    received: u64,
    inbound: Vec<u8>,
}

impl FrameCodec {
    fn new(key: SharedKey, send_base: Nonce, recv_base: Nonce) -> Self {
        Self {
            key,
            send_base,
            sent: 0,
            recv_base,
            received: 0,
            inbound: Vec::new(),
        }
    }

    /// Seal one message into a length-prefixed frame.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::FrameTooLarge`] if the message exceeds
    /// [`MAX_FRAME_SIZE`], or a nonce error once the counter is exhausted.
    pub fn encode(&mut self, msg: &RelayMessage) -> Result<Vec<u8>, RelayError> {
        let plain = msg.to_bytes()?;
        let size = plain.len() + MAC_SIZE;
        if size > MAX_FRAME_SIZE {
            return Err(RelayError::FrameTooLarge {
                size,
                max: MAX_FRAME_SIZE,
            });
        }
        let counter = self.sent;
        self.sent = counter.checked_add(1).ok_or(CryptoError::NonceOverflow)?;
        let sealed = self.key.encrypt(&self.send_base.add(counter), &plain)?;

        let mut frame = Vec::with_capacity(2 + sealed.len());
        frame.extend_from_slice(&(sealed.len() as u16).to_be_bytes());
        frame.extend_from_slice(&sealed);
        Ok(frame)
    }

    /// Buffer bytes read from the stream
    pub fn push(&mut self, bytes: &[u8]) {
        self.inbound.extend_from_slice(bytes);
    }

    /// Open the next complete frame, if one is buffered.
    ///
    /// # Errors
    ///
    /// Any error means the stream is unusable and the connection must be
    /// closed.
    pub fn decode(&mut self) -> Result<Option<RelayMessage>, RelayError> {
        let Some(header) = self.inbound.get(..2) else {
            return Ok(None);
        };
        let len = usize::from(u16::from_be_bytes([header[0], header[1]]));
        if !(MAC_SIZE..=MAX_FRAME_SIZE).contains(&len) {
            return Err(RelayError::InvalidFrameLength(len));
        }
        if self.inbound.len() < 2 + len {
            return Ok(None);
        }

        let counter = self.received;
        let plain = self
            .key
            .decrypt(&self.recv_base.add(counter), &self.inbound[2..2 + len])?;
        self.inbound.drain(..2 + len);
        self.received = counter.checked_add(1).ok_or(CryptoError::NonceOverflow)?;
        RelayMessage::from_bytes(&plain).map(Some)
    }

    /// Bytes buffered but not yet decoded
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.inbound.len()
    }
}

impl std::fmt::Debug for FrameCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameCodec")
            .field("sent", &self.sent)
            .field("received", &self.received)
            .field("buffered", &self.inbound.len())
            .finish_non_exhaustive()
    }
}

/// Client side of the relay handshake, waiting for the reply.
pub struct ClientHandshake {
    temp: KeyPair,
    send_base: Nonce,
    shared: SharedKey,
}

impl ClientHandshake {
    /// Start a handshake with the relay whose long-term key is `relay`.
    ///
    /// Returns the pending state and the bytes to write to the stream.
    ///
    /// # Errors
    ///
    /// Returns a crypto error if `relay` is not a usable public key.
    pub fn start(identity: &KeyPair, relay: &PublicKey) -> Result<(Self, Vec<u8>), RelayError> {
        let shared = SharedKey::precompute(identity.secret(), relay)?;
        let temp = KeyPair::generate();
        let send_base = Nonce::random();
        let nonce = Nonce::random();
        let sealed = shared.encrypt(&nonce, &handshake_plain(&temp.public(), &send_base))?;

        let mut writer = PacketWriter::new();
        writer
            .put_key(&identity.public())
            .put_nonce(&nonce)
            .put_bytes(&sealed);
        Ok((
            Self {
                temp,
                send_base,
                shared,
            },
            writer.finish(),
        ))
    }

    /// Finish with the relay's reply.
    ///
    /// # Errors
    ///
    /// Returns an error if the reply has the wrong size or does not open.
    pub fn complete(self, reply: &[u8]) -> Result<FrameCodec, RelayError> {
        if reply.len() != SERVER_HANDSHAKE_SIZE {
            return Err(RelayError::InvalidHandshake);
        }
        let mut reader = PacketReader::new(reply);
        let nonce = reader.nonce()?;
        let plain = self.shared.decrypt(&nonce, reader.rest())?;
        let (peer_temp, recv_base) = parse_handshake_plain(&plain)?;
        let key = SharedKey::precompute(self.temp.secret(), &peer_temp)?;
        Ok(FrameCodec::new(key, self.send_base, recv_base))
    }
}

/// Relay side of the handshake.
///
/// Returns the client's long-term key, the frame codec, and the reply to
/// write back.
///
/// # Errors
///
/// Returns an error if the hello has the wrong size or does not open.
pub fn accept_handshake(
    identity: &KeyPair,
    hello: &[u8],
) -> Result<(PublicKey, FrameCodec, Vec<u8>), RelayError> {
    if hello.len() != CLIENT_HANDSHAKE_SIZE {
        return Err(RelayError::InvalidHandshake);
    }
    let mut reader = PacketReader::new(hello);
    let client = reader.key()?;
    let nonce = reader.nonce()?;
    let shared = SharedKey::precompute(identity.secret(), &client)?;
    let plain = shared.decrypt(&nonce, reader.rest())?;
    let (client_temp, recv_base) = parse_handshake_plain(&plain)?;

    let temp = KeyPair::generate();
    let send_base = Nonce::random();
    let reply_nonce = Nonce::random();
    let sealed = shared.encrypt(&reply_nonce, &handshake_plain(&temp.public(), &send_base))?;
    let mut writer = PacketWriter::new();
    writer.put_nonce(&reply_nonce).put_bytes(&sealed);

    let key = SharedKey::precompute(temp.secret(), &client_temp)?;
    Ok((
        client,
        FrameCodec::new(key, send_base, recv_base),
        writer.finish(),
    ))
}

fn handshake_plain(temp: &PublicKey, base: &Nonce) -> Vec<u8> {
    let mut writer = PacketWriter::new();
    writer.put_key(temp).put_nonce(base);
    writer.finish()
}

fn parse_handshake_plain(plain: &[u8]) -> Result<(PublicKey, Nonce), RelayError> {
    let mut reader = PacketReader::new(plain);
    let temp = reader.key()?;
    let base = reader.nonce()?;
    reader.finish()?;
    Ok((temp, base))
}
