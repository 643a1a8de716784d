//! Peerbloom: the peer-to-peer network layer of a ledger daemon
//!
//! This crate provides:
//! - A salted, bucketed peer address store (tried/new tables) with binary
//!   persistence and warm restart
//! - TCP sessions with a VERSION/VERACK handshake, heartbeats and bounded
//!   send queues
//! - Connection pools with admission limits, bootstrap, rebalancing and
//!   broadcast
//! - Feeler probing, collision resolution and peer exchange
//!
//! Ledger packets are opaque: they are handed to a [`network::PacketHandler`]
//! supplied by the embedding daemon.
//!
//! # Example
//!
//! ```rust,no_run
//! use peerbloom::network::{NetworkConfig, Node, NullHandler};
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//! let node = Node::new(NetworkConfig::default(), Arc::new(NullHandler))?;
//! let addr = node.start().await?;
//! println!("Listening on {}", addr);
//!
//! tokio::signal::ctrl_c().await?;
//! node.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod crypto;
pub mod network;
pub mod storage;

// Re-export commonly used types
pub use network::{
    AddrManager, Direction, DisconnectReason, NetworkConfig, Node, NullHandler, Packet,
    PacketHandler, PeerError,
};
pub use storage::{PeerStore, StorageError};
