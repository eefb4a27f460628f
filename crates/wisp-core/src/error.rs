//! Error types for wisp-core

use thiserror::Error;

use crate::net_crypto::NetCryptoError;
use wisp_crypto::CryptoError;
use wisp_discovery::dht::DhtError;
use wisp_discovery::onion::OnionError;
use wisp_discovery::relay::RelayError;
use wisp_transport::{PacketError, TransportError};

/// Top-level error for node operations
#[derive(Debug, Error)]
pub enum Error {
    /// Crypto error
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Socket error
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Malformed packet
    #[error("packet error: {0}")]
    Packet(#[from] PacketError),

    /// DHT error
    #[error("DHT error: {0}")]
    Dht(#[from] DhtError),

    /// Onion error
    #[error("onion error: {0}")]
    Onion(#[from] OnionError),

    /// Relay error
    #[error("relay error: {0}")]
    Relay(#[from] RelayError),

    /// Crypto connection error
    #[error("connection error: {0}")]
    NetCrypto(#[from] NetCryptoError),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O error outside the UDP transport (relay streams)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Onion message did not encode or decode
    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    /// Operation on a peer that is not a friend
    #[error("unknown friend")]
    UnknownFriend,
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File could not be read
    #[error("cannot read config: {0}")]
    Io(#[from] std::io::Error),

    /// File is not valid TOML for [`NodeConfig`](crate::config::NodeConfig)
    #[error("cannot parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is out of range
    #[error("invalid config: {0}")]
    Invalid(String),

    /// A hex key did not decode
    #[error("invalid key {0:?}")]
    InvalidKey(String),
}

/// Result alias for node operations
pub type Result<T> = std::result::Result<T, Error>;
