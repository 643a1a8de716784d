//! Cryptographic helpers
//!
//! Only hashing is needed by the network layer: salted double SHA-256 drives
//! deterministic bucket placement in the address manager.

pub mod hash;

pub use hash::{cheap_hash, double_sha256, double_sha256_hex, sha256};
