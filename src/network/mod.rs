//! P2P Networking module
//!
//! Provides the peer-to-peer layer of a ledger daemon.
//!
//! # Features
//! - TCP sessions with a VERSION/VERACK handshake
//! - Bucketed peer address store with persistence
//! - Inbound/outbound/feeler connection pools
//! - Bootstrap, peer exchange and feeler probing
//! - Heartbeat liveness checks
//! - Opaque packet dispatch to an external handler

pub mod addrman;
pub mod config;
pub mod connection;
pub mod discovery;
pub mod feeler;
pub mod handler;
pub mod heartbeat;
pub mod message;
pub mod node;
pub mod peer;
pub mod server;

pub use addrman::{AddrManConfig, AddrManError, AddrManStats, AddrManager, AddrRecord};
pub use config::{ConfigError, NetworkConfig};
pub use connection::{connect_outbound, Connection, HandshakeParams};
pub use handler::{NullHandler, PacketHandler, RequestTracker};
pub use message::{
    command, CodecError, DisconnectReason, Packet, ServiceFlags, VerAckPacket, VersionPacket,
    HEADER_SIZE,
};
pub use node::{Node, NodeStats};
pub use peer::{Direction, HandshakeError, PeerError, PeerManager, PeerManagerStats, PoolLimits};
pub use server::{connect_to_peer, PacketCodec, Server};

/// Current unix time in seconds
pub(crate) fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Current unix time in milliseconds
pub(crate) fn unix_now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
