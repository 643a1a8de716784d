//! Network configuration
//!
//! All tunables consumed by the network layer. Loaded from a JSON file or
//! built in code from [`NetworkConfig::default`].

use crate::network::message::MAX_PEERS_PER_PACKET;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

// =============================================================================
// Defaults
// =============================================================================

/// Network identifier carried in every packet header ("PBLM")
pub const DEFAULT_NETWORK_ID: u32 = 0x5042_4C4D;

/// Protocol version announced in VERSION
pub const DEFAULT_PROTOCOL_VERSION: u32 = 7;

/// Default P2P port
pub const DEFAULT_PORT: u16 = 18750;

/// Maximum packet size including header (16 MiB)
pub const DEFAULT_MAX_PACKET_SIZE: usize = 16 * 1024 * 1024;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    ParseError(#[from] serde_json::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Network layer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Network identifier (packet header magic)
    pub network_id: u32,
    /// Protocol version; peers must match exactly
    pub protocol_version: u32,
    /// Address to listen on for inbound peers
    pub listen_addr: SocketAddr,
    /// Whether this node is reachable from the public internet
    pub public: bool,
    /// Designated bootstrap node
    pub bootstrap_endpoint: Option<SocketAddr>,
    /// Seed peers dialed on startup
    pub static_peers: Vec<SocketAddr>,
    /// Directory for the peer address file
    pub data_dir: PathBuf,

    // Address manager dimensions
    pub tried_bucket_count: usize,
    pub new_bucket_count: usize,
    pub bucket_size: usize,
    /// Accept loopback/private addresses into the address manager
    pub allow_local_addresses: bool,

    // Timeouts
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub write_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
    pub connecting_force_timeout_secs: u64,
    pub pong_timeout_secs: u64,
    pub max_clock_skew_secs: i64,

    // Attempt caps
    pub max_connect_attempts: u32,
    pub bootstrap_rounds: u32,
    pub bootstrap_backoff_ms: u64,

    // Pool limits
    pub min_outbound: usize,
    pub max_outbound: usize,
    pub max_inbound: usize,
    pub max_connecting: usize,
    pub max_feelers: usize,

    // Service intervals
    pub heartbeat_interval_secs: u64,
    pub feeler_interval_secs: u64,
    pub exchange_interval_secs: u64,
    pub rebalance_interval_secs: u64,
    pub save_interval_secs: u64,

    // Packet limits
    pub max_packet_size: usize,
    pub send_queue_capacity: usize,
    /// Peers asked per exchange round
    pub exchange_fanout: usize,
    /// Maximum endpoints requested/returned per REQUESTPEERS
    pub max_peers_per_request: u32,
    /// Maximum share of the address manager returned by one GetAddr
    pub max_getaddr_percent: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            network_id: DEFAULT_NETWORK_ID,
            protocol_version: DEFAULT_PROTOCOL_VERSION,
            listen_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            public: false,
            bootstrap_endpoint: None,
            static_peers: Vec::new(),
            data_dir: PathBuf::from(".peerbloom"),

            tried_bucket_count: 256,
            new_bucket_count: 1024,
            bucket_size: 64,
            allow_local_addresses: false,

            connect_timeout_ms: 5_000,
            read_timeout_ms: 30_000,
            write_timeout_ms: 10_000,
            handshake_timeout_ms: 10_000,
            connecting_force_timeout_secs: 60,
            pong_timeout_secs: 60,
            max_clock_skew_secs: 2 * 60 * 60,

            max_connect_attempts: 3,
            bootstrap_rounds: 5,
            bootstrap_backoff_ms: 2_000,

            min_outbound: 8,
            max_outbound: 16,
            max_inbound: 64,
            max_connecting: 32,
            max_feelers: 2,

            heartbeat_interval_secs: 30,
            feeler_interval_secs: 10,
            exchange_interval_secs: 120,
            rebalance_interval_secs: 60,
            save_interval_secs: 15 * 60,

            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            send_queue_capacity: 1024,
            exchange_fanout: 3,
            max_peers_per_request: 100,
            max_getaddr_percent: 23,
        }
    }
}

impl NetworkConfig {
    /// Load configuration from a JSON file; missing fields take defaults
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read(path)?;
        let config: NetworkConfig = serde_json::from_slice(&data)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject combinations the network layer cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tried_bucket_count == 0 || self.new_bucket_count == 0 || self.bucket_size == 0 {
            return Err(ConfigError::Invalid(
                "address table dimensions must be non-zero".to_string(),
            ));
        }
        if self.min_outbound > self.max_outbound {
            return Err(ConfigError::Invalid(format!(
                "min_outbound ({}) exceeds max_outbound ({})",
                self.min_outbound, self.max_outbound
            )));
        }
        if self.max_connect_attempts == 0 {
            return Err(ConfigError::Invalid(
                "max_connect_attempts must be at least 1".to_string(),
            ));
        }
        if self.send_queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "send_queue_capacity must be at least 1".to_string(),
            ));
        }
        // Larger responses would not decode on the requesting side
        if self.max_peers_per_request as usize > MAX_PEERS_PER_PACKET {
            return Err(ConfigError::Invalid(format!(
                "max_peers_per_request ({}) exceeds {}",
                self.max_peers_per_request, MAX_PEERS_PER_PACKET
            )));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn connecting_force_timeout(&self) -> Duration {
        Duration::from_secs(self.connecting_force_timeout_secs)
    }

    pub fn pong_timeout(&self) -> Duration {
        Duration::from_secs(self.pong_timeout_secs)
    }

    pub fn bootstrap_backoff(&self) -> Duration {
        Duration::from_millis(self.bootstrap_backoff_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn feeler_interval(&self) -> Duration {
        Duration::from_secs(self.feeler_interval_secs)
    }

    pub fn exchange_interval(&self) -> Duration {
        Duration::from_secs(self.exchange_interval_secs)
    }

    pub fn rebalance_interval(&self) -> Duration {
        Duration::from_secs(self.rebalance_interval_secs)
    }

    pub fn save_interval(&self) -> Duration {
        Duration::from_secs(self.save_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = NetworkConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_packet_size, 16 * 1024 * 1024);
        assert_eq!(config.max_clock_skew_secs, 7200);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("net.json");
        let mut file = std::fs::File::create(&path).unwrap();
        write!(
            file,
            r#"{{"protocol_version": 6, "max_inbound": 3, "static_peers": ["10.0.0.1:18750"]}}"#
        )
        .unwrap();

        let config = NetworkConfig::from_file(&path).unwrap();
        assert_eq!(config.protocol_version, 6);
        assert_eq!(config.max_inbound, 3);
        assert_eq!(config.static_peers.len(), 1);
        assert_eq!(config.max_outbound, NetworkConfig::default().max_outbound);
    }

    #[test]
    fn test_invalid_outbound_bounds() {
        let config = NetworkConfig {
            min_outbound: 10,
            max_outbound: 2,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_peer_request_cap() {
        let at_cap = NetworkConfig {
            max_peers_per_request: MAX_PEERS_PER_PACKET as u32,
            ..Default::default()
        };
        assert!(at_cap.validate().is_ok());

        let over = NetworkConfig {
            max_peers_per_request: MAX_PEERS_PER_PACKET as u32 + 1,
            ..Default::default()
        };
        assert!(matches!(over.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_oversized_peer_request_in_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("net.json");
        std::fs::write(&path, r#"{"max_peers_per_request": 5000}"#).unwrap();
        assert!(matches!(
            NetworkConfig::from_file(&path),
            Err(ConfigError::Invalid(_))
        ));
    }
}
