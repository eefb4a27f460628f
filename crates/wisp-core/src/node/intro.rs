//! Messages friends exchange as onion data.
//!
//! Onion data is the only channel open before a friend's address is known,
//! so it carries the introduction (DHT key and relays) and, until a direct
//! or relayed route exists, the crypto handshake packets themselves.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use wisp_crypto::PublicKey;
use wisp_discovery::relay::RelayInfo;

use crate::error::Result;

/// A relay the sender is connected to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayHint {
    /// Relay address
    pub addr: SocketAddr,
    /// Relay key
    pub key: PublicKey,
}

impl From<&RelayInfo> for RelayHint {
    fn from(r: &RelayInfo) -> Self {
        Self {
            addr: r.addr,
            key: r.key,
        }
    }
}

impl From<RelayHint> for RelayInfo {
    fn from(h: RelayHint) -> Self {
        RelayInfo::new(h.addr, h.key)
    }
}

/// Payload of onion data between friends
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OnionMessage {
    /// Where to find the sender
    Introduction {
        /// Sender's current DHT key
        dht_key: PublicKey,
        /// Relays the sender is reachable through
        relays: Vec<RelayHint>,
    },
    /// A cookie request, cookie response or handshake packet
    Crypto(Vec<u8>),
}

impl OnionMessage {
    /// Encode for [`OnionClient::send_data`](wisp_discovery::onion::OnionClient::send_data)
    ///
    /// # Errors
    ///
    /// Returns [`Error::Codec`](crate::Error::Codec) if encoding fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Decode received onion data
    ///
    /// # Errors
    ///
    /// Returns [`Error::Codec`](crate::Error::Codec) for bytes that are not
    /// an onion message.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wisp_crypto::KeyPair;

    #[test]
    fn test_introduction_fits_onion_payload() {
        let relays = (0..3)
            .map(|i| RelayHint {
                addr: SocketAddr::from(([192, 0, 2, i], 443)),
                key: KeyPair::generate().public(),
            })
            .collect();
        let msg = OnionMessage::Introduction {
            dht_key: KeyPair::generate().public(),
            relays,
        };
        let bytes = msg.to_bytes().unwrap();
        assert!(bytes.len() <= wisp_discovery::onion::MAX_ONION_PAYLOAD);
        assert_eq!(OnionMessage::from_bytes(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(OnionMessage::from_bytes(&[9, 9, 9, 9]).is_err());
        assert!(OnionMessage::from_bytes(&[]).is_err());
    }
}
