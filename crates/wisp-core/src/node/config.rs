//! Node configuration
//!
//! Every section derives serde with `#[serde(default)]`, so a partial TOML
//! file is valid. Durations are whole milliseconds (`*_ms` fields) and are
//! converted into the per-layer config types when the node is built.

use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;
use crate::net_crypto::{CongestionConfig, NetCryptoConfig};
use wisp_crypto::{KeyPair, PublicKey, SECRET_KEY_SIZE};
use wisp_discovery::dht::{DhtConfig, PackedNode};
use wisp_discovery::onion::OnionConfig;
use wisp_discovery::relay::{MAX_ROUTES, RelayConfig, RelayInfo, SelectionStrategy};
use wisp_transport::TransportConfig;

fn ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

fn dur(ms: u64) -> Duration {
    Duration::from_millis(ms)
}

/// Node configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// UDP listen address
    pub listen_addr: SocketAddr,

    /// Long-term secret key (hex); a fresh one is generated when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_key: Option<String>,

    /// Known-good DHT nodes seeded at startup
    pub bootstrap_nodes: Vec<PeerEntry>,

    /// Known TCP relays
    pub relays: Vec<PeerEntry>,

    /// Socket settings
    pub transport: TransportSettings,

    /// DHT settings
    pub dht: DhtSettings,

    /// Onion settings
    pub onion: OnionSettings,

    /// Crypto connection settings
    pub net_crypto: NetCryptoSettings,

    /// Relay client settings
    pub relay: RelaySettings,

    /// Logging settings
    pub logging: LoggingConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 33445)),
            secret_key: None,
            bootstrap_nodes: Vec::new(),
            relays: Vec::new(),
            transport: TransportSettings::default(),
            dht: DhtSettings::default(),
            onion: OnionSettings::default(),
            net_crypto: NetCryptoSettings::default(),
            relay: RelaySettings::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// A `{ key = "<hex>", addr = "ip:port" }` entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerEntry {
    /// Public key, hex
    pub key: String,
    /// Address
    pub addr: SocketAddr,
}

impl PeerEntry {
    /// Entry for `key` at `addr`
    #[must_use]
    pub fn new(key: PublicKey, addr: SocketAddr) -> Self {
        Self {
            key: key.to_hex(),
            addr,
        }
    }

    /// Decoded key
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidKey`] if the key is not 64 hex digits.
    pub fn public_key(&self) -> Result<PublicKey, ConfigError> {
        self.key
            .parse()
            .map_err(|_| ConfigError::InvalidKey(self.key.clone()))
    }
}

/// UDP socket settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    /// Kernel receive buffer
    pub recv_buffer_size: usize,
    /// Kernel send buffer
    pub send_buffer_size: usize,
    /// Allow broadcast (LAN discovery)
    pub broadcast: bool,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self::from(&TransportConfig::default())
    }
}

impl From<&TransportConfig> for TransportSettings {
    fn from(c: &TransportConfig) -> Self {
        Self {
            recv_buffer_size: c.recv_buffer_size,
            send_buffer_size: c.send_buffer_size,
            broadcast: c.broadcast,
        }
    }
}

impl TransportSettings {
    /// Socket config
    #[must_use]
    pub fn to_config(&self) -> TransportConfig {
        TransportConfig {
            recv_buffer_size: self.recv_buffer_size,
            send_buffer_size: self.send_buffer_size,
            broadcast: self.broadcast,
        }
    }
}

/// DHT settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DhtSettings {
    /// Nodes per bucket
    pub bucket_size: usize,
    /// Keepalive ping period
    pub ping_interval_ms: u64,
    /// Unanswered ping deadline
    pub ping_timeout_ms: u64,
    /// Missed pings before eviction
    pub max_missed_pings: u8,
    /// Random and search lookup period
    pub nodes_request_interval_ms: u64,
    /// Unverified candidates kept
    pub candidate_queue_size: usize,
    /// Outstanding request slots
    pub ping_array_size: usize,
    /// Cached box keys
    pub shared_key_cache_size: usize,
    /// Concurrent search targets
    pub max_searches: usize,
    /// LAN discovery on/off
    pub lan_discovery: bool,
    /// LAN discovery period
    pub lan_discovery_interval_ms: u64,
    /// LAN discovery port
    pub lan_port: u16,
}

impl Default for DhtSettings {
    fn default() -> Self {
        Self::from(&DhtConfig::default())
    }
}

impl From<&DhtConfig> for DhtSettings {
    fn from(c: &DhtConfig) -> Self {
        Self {
            bucket_size: c.bucket_size,
            ping_interval_ms: ms(c.ping_interval),
            ping_timeout_ms: ms(c.ping_timeout),
            max_missed_pings: c.max_missed_pings,
            nodes_request_interval_ms: ms(c.nodes_request_interval),
            candidate_queue_size: c.candidate_queue_size,
            ping_array_size: c.ping_array_size,
            shared_key_cache_size: c.shared_key_cache_size,
            max_searches: c.max_searches,
            lan_discovery: c.lan_discovery,
            lan_discovery_interval_ms: ms(c.lan_discovery_interval),
            lan_port: c.lan_port,
        }
    }
}

impl DhtSettings {
    /// DHT config
    #[must_use]
    pub fn to_config(&self) -> DhtConfig {
        DhtConfig {
            bucket_size: self.bucket_size,
            ping_interval: dur(self.ping_interval_ms),
            ping_timeout: dur(self.ping_timeout_ms),
            max_missed_pings: self.max_missed_pings,
            nodes_request_interval: dur(self.nodes_request_interval_ms),
            candidate_queue_size: self.candidate_queue_size,
            ping_array_size: self.ping_array_size,
            shared_key_cache_size: self.shared_key_cache_size,
            max_searches: self.max_searches,
            lan_discovery: self.lan_discovery,
            lan_discovery_interval: dur(self.lan_discovery_interval_ms),
            lan_port: self.lan_port,
        }
    }
}

/// Onion settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OnionSettings {
    /// Paths per set
    pub max_paths: usize,
    /// Path lifetime
    pub path_lifetime_ms: u64,
    /// Timeouts that retire a path
    pub max_path_failures: u32,
    /// Hop penalty after a path failure
    pub penalty_duration_ms: u64,
    /// DHT nodes sampled for path building
    pub path_pool_size: usize,
    /// Request timeout
    pub request_timeout_ms: u64,
    /// Re-announce period once stored
    pub announce_interval_ms: u64,
    /// Re-announce period while unstored
    pub announce_retry_ms: u64,
    /// Friend search period
    pub search_interval_ms: u64,
    /// Announce nodes tracked per key
    pub max_announce_nodes: usize,
    /// Friends searched at once
    pub max_friends: usize,
    /// Outstanding requests
    pub pending_capacity: usize,
    /// Announcements stored for others
    pub announce_capacity: usize,
    /// Stored announcement lifetime
    pub announce_timeout_ms: u64,
    /// Ping id bucket
    pub ping_id_period_ms: u64,
    /// Return key rotation
    pub return_key_rotation_ms: u64,
    /// Cached hop keys
    pub key_cache_size: usize,
}

impl Default for OnionSettings {
    fn default() -> Self {
        Self::from(&OnionConfig::default())
    }
}

impl From<&OnionConfig> for OnionSettings {
    fn from(c: &OnionConfig) -> Self {
        Self {
            max_paths: c.max_paths,
            path_lifetime_ms: ms(c.path_lifetime),
            max_path_failures: c.max_path_failures,
            penalty_duration_ms: ms(c.penalty_duration),
            path_pool_size: c.path_pool_size,
            request_timeout_ms: ms(c.request_timeout),
            announce_interval_ms: ms(c.announce_interval),
            announce_retry_ms: ms(c.announce_retry),
            search_interval_ms: ms(c.search_interval),
            max_announce_nodes: c.max_announce_nodes,
            max_friends: c.max_friends,
            pending_capacity: c.pending_capacity,
            announce_capacity: c.announce_capacity,
            announce_timeout_ms: ms(c.announce_timeout),
            ping_id_period_ms: ms(c.ping_id_period),
            return_key_rotation_ms: ms(c.return_key_rotation),
            key_cache_size: c.key_cache_size,
        }
    }
}

impl OnionSettings {
    /// Onion config
    #[must_use]
    pub fn to_config(&self) -> OnionConfig {
        OnionConfig {
            max_paths: self.max_paths,
            path_lifetime: dur(self.path_lifetime_ms),
            max_path_failures: self.max_path_failures,
            penalty_duration: dur(self.penalty_duration_ms),
            path_pool_size: self.path_pool_size,
            request_timeout: dur(self.request_timeout_ms),
            announce_interval: dur(self.announce_interval_ms),
            announce_retry: dur(self.announce_retry_ms),
            search_interval: dur(self.search_interval_ms),
            max_announce_nodes: self.max_announce_nodes,
            max_friends: self.max_friends,
            pending_capacity: self.pending_capacity,
            announce_capacity: self.announce_capacity,
            announce_timeout: dur(self.announce_timeout_ms),
            ping_id_period: dur(self.ping_id_period_ms),
            return_key_rotation: dur(self.return_key_rotation_ms),
            key_cache_size: self.key_cache_size,
        }
    }
}

/// Crypto connection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetCryptoSettings {
    /// Cookie request / handshake resend period
    pub handshake_retry_ms: u64,
    /// Attempt abandoned after this long
    pub handshake_timeout_ms: u64,
    /// Cookie lifetime
    pub cookie_timeout_ms: u64,
    /// Silence that kills a confirmed connection
    pub connection_timeout_ms: u64,
    /// Idle period before a keepalive
    pub keepalive_interval_ms: u64,
    /// UDP preferred while fresher than this
    pub udp_path_timeout_ms: u64,
    /// Dead connections kept this long
    pub dead_grace_ms: u64,
    /// Unacknowledged packets kept
    pub send_buffer_size: usize,
    /// Reorder window
    pub recv_buffer_size: usize,
    /// Replay window in counters
    pub replay_window: u64,
    /// Connection table size
    pub max_connections: usize,
    /// Congestion control constants
    pub congestion: CongestionConfig,
}

impl Default for NetCryptoSettings {
    fn default() -> Self {
        Self::from(&NetCryptoConfig::default())
    }
}

impl From<&NetCryptoConfig> for NetCryptoSettings {
    fn from(c: &NetCryptoConfig) -> Self {
        Self {
            handshake_retry_ms: ms(c.handshake_retry),
            handshake_timeout_ms: ms(c.handshake_timeout),
            cookie_timeout_ms: ms(c.cookie_timeout),
            connection_timeout_ms: ms(c.connection_timeout),
            keepalive_interval_ms: ms(c.keepalive_interval),
            udp_path_timeout_ms: ms(c.udp_path_timeout),
            dead_grace_ms: ms(c.dead_grace),
            send_buffer_size: c.send_buffer_size,
            recv_buffer_size: c.recv_buffer_size,
            replay_window: c.replay_window,
            max_connections: c.max_connections,
            congestion: c.congestion.clone(),
        }
    }
}

impl NetCryptoSettings {
    /// Crypto connection config
    #[must_use]
    pub fn to_config(&self) -> NetCryptoConfig {
        NetCryptoConfig {
            handshake_retry: dur(self.handshake_retry_ms),
            handshake_timeout: dur(self.handshake_timeout_ms),
            cookie_timeout: dur(self.cookie_timeout_ms),
            connection_timeout: dur(self.connection_timeout_ms),
            keepalive_interval: dur(self.keepalive_interval_ms),
            udp_path_timeout: dur(self.udp_path_timeout_ms),
            dead_grace: dur(self.dead_grace_ms),
            send_buffer_size: self.send_buffer_size,
            recv_buffer_size: self.recv_buffer_size,
            replay_window: self.replay_window,
            max_connections: self.max_connections,
            congestion: self.congestion.clone(),
        }
    }
}

/// Relay client settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelaySettings {
    /// Links kept open
    pub max_links: usize,
    /// Links each peer is routed over
    pub routes_per_peer: usize,
    /// Keepalive period
    pub ping_interval_ms: u64,
    /// Unanswered ping deadline
    pub ping_timeout_ms: u64,
    /// Handshake deadline
    pub handshake_timeout_ms: u64,
    /// Wait before reconnecting
    pub reconnect_delay_ms: u64,
    /// Ranking strategy
    pub strategy: SelectionStrategy,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self::from(&RelayConfig::default())
    }
}

impl From<&RelayConfig> for RelaySettings {
    fn from(c: &RelayConfig) -> Self {
        Self {
            max_links: c.max_links,
            routes_per_peer: c.routes_per_peer,
            ping_interval_ms: ms(c.ping_interval),
            ping_timeout_ms: ms(c.ping_timeout),
            handshake_timeout_ms: ms(c.handshake_timeout),
            reconnect_delay_ms: ms(c.reconnect_delay),
            strategy: c.strategy,
        }
    }
}

impl RelaySettings {
    /// Relay pool config
    #[must_use]
    pub fn to_config(&self) -> RelayConfig {
        RelayConfig {
            max_links: self.max_links,
            routes_per_peer: self.routes_per_peer,
            ping_interval: dur(self.ping_interval_ms),
            ping_timeout: dur(self.ping_timeout_ms),
            handshake_timeout: dur(self.handshake_timeout_ms),
            reconnect_delay: dur(self.reconnect_delay_ms),
            strategy: self.strategy,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `tracing` filter, e.g. `info` or `wisp_core=debug,info`
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl LoggingConfig {
    /// Install the global subscriber with this filter; `false` if one was
    /// already installed
    pub fn init(&self) -> bool {
        wisp_transport::logging::init(&self.level)
    }
}

impl NodeConfig {
    /// Parse TOML
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for invalid TOML or field types.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    /// Load from a TOML file and validate it
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        let config = Self::from_toml_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Write as TOML, creating the parent directory
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, contents)?;
        Ok(())
    }

    /// Long-term key pair from `secret_key`, if set
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidKey`] if the key is not 64 hex digits.
    pub fn keypair(&self) -> Result<Option<KeyPair>, ConfigError> {
        let Some(hex_key) = &self.secret_key else {
            return Ok(None);
        };
        let bytes: [u8; SECRET_KEY_SIZE] = hex::decode(hex_key.trim())
            .ok()
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| ConfigError::InvalidKey("secret_key".to_string()))?;
        Ok(Some(KeyPair::from_secret_bytes(bytes)))
    }

    /// Bootstrap nodes
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidKey`] for a bad key.
    pub fn bootstrap(&self) -> Result<Vec<PackedNode>, ConfigError> {
        self.bootstrap_nodes
            .iter()
            .map(|e| Ok(PackedNode::new(e.public_key()?, e.addr)))
            .collect()
    }

    /// Known relays
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidKey`] for a bad key.
    pub fn relay_infos(&self) -> Result<Vec<RelayInfo>, ConfigError> {
        self.relays
            .iter()
            .map(|e| Ok(RelayInfo::new(e.addr, e.public_key()?)))
            .collect()
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first bad value, or
    /// [`ConfigError::InvalidKey`] for a key that does not decode.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        let dht = &self.dht;
        if dht.bucket_size == 0 {
            return invalid("dht.bucket_size must be positive");
        }
        if dht.ping_timeout_ms == 0 || dht.ping_interval_ms == 0 {
            return invalid("dht ping interval and timeout must be positive");
        }
        if dht.max_missed_pings == 0 {
            return invalid("dht.max_missed_pings must be positive");
        }
        if dht.ping_array_size == 0 || dht.candidate_queue_size == 0 {
            return invalid("dht.ping_array_size and candidate_queue_size must be positive");
        }
        if dht.nodes_request_interval_ms == 0 {
            return invalid("dht.nodes_request_interval_ms must be positive");
        }

        let onion = &self.onion;
        if onion.max_paths == 0 {
            return invalid("onion.max_paths must be positive");
        }
        if onion.path_pool_size < 3 {
            return invalid("onion.path_pool_size must be at least 3");
        }
        if onion.request_timeout_ms == 0 || onion.ping_id_period_ms == 0 {
            return invalid("onion request timeout and ping id period must be positive");
        }

        let nc = &self.net_crypto;
        if nc.handshake_retry_ms == 0 || nc.handshake_retry_ms >= nc.handshake_timeout_ms {
            return invalid("net_crypto.handshake_retry_ms must be positive and below handshake_timeout_ms");
        }
        if nc.keepalive_interval_ms == 0 || nc.keepalive_interval_ms >= nc.connection_timeout_ms {
            return invalid("net_crypto.keepalive_interval_ms must be positive and below connection_timeout_ms");
        }
        if nc.send_buffer_size == 0 || nc.recv_buffer_size == 0 {
            return invalid("net_crypto buffer sizes must be positive");
        }
        if nc.replay_window == 0 || nc.max_connections == 0 {
            return invalid("net_crypto.replay_window and max_connections must be positive");
        }
        nc.congestion.validate()?;

        let relay = &self.relay;
        if relay.max_links == 0 {
            return invalid("relay.max_links must be positive");
        }
        if relay.routes_per_peer == 0 || relay.routes_per_peer > MAX_ROUTES {
            return invalid("relay.routes_per_peer out of range");
        }

        let level = self.logging.level.to_lowercase();
        let levels = ["trace", "debug", "info", "warn", "error", "off"];
        if !levels.contains(&level.as_str()) && !level.contains('=') {
            return Err(ConfigError::Invalid(format!(
                "invalid log level: {}. Must be one of: {} or a target=level filter",
                self.logging.level,
                levels.join(", ")
            )));
        }

        self.keypair()?;
        self.bootstrap()?;
        self.relay_infos()?;
        Ok(())
    }
}
