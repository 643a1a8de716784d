//! Hashing utilities for peer address placement
//!
//! Bucket and slot coordinates in the address manager are derived from a
//! double SHA-256 over salted inputs, reduced to a 64-bit integer.

use sha2::{Digest, Sha256};

/// Computes SHA-256 hash of the input data
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Computes double SHA-256 hash (SHA-256 of SHA-256)
pub fn double_sha256(data: &[u8]) -> [u8; 32] {
    sha256(&sha256(data))
}

/// Computes double SHA-256 hash and returns it as a hex string
pub fn double_sha256_hex(data: &[u8]) -> String {
    hex::encode(double_sha256(data))
}

/// First 8 bytes of the double SHA-256, little endian.
pub fn cheap_hash(data: &[u8]) -> u64 {
    let digest = double_sha256(data);
    let mut word = [0u8; 8];
    word.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(word)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256() {
        let data = b"hello world";
        assert_eq!(
            hex::encode(sha256(data)),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_double_sha256() {
        let data = b"hello world";
        assert_eq!(double_sha256(data), sha256(&sha256(data)));
        assert_eq!(double_sha256_hex(data).len(), 64);
    }

    #[test]
    fn test_cheap_hash_is_stable() {
        let a = cheap_hash(b"10.1.2.3:8333");
        let b = cheap_hash(b"10.1.2.3:8333");
        let c = cheap_hash(b"10.1.2.4:8333");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
