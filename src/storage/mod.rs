//! Storage module for peer address persistence

pub mod persistence;

pub use persistence::{PeerStore, StorageConfig, StorageError};
