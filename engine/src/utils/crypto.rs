//! Hashing utility functions

use sha2::{Digest, Sha256};

/// Calculate SHA256 hash and return as hex string
pub fn sha256_hex(data: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data.as_bytes());
    hex::encode(hasher.finalize())
}

/// Short stable hash for idempotency keys (first 8 hex chars of SHA256)
pub fn short_hash(data: &str) -> String {
    sha256_hex(data)[..8].to_string()
}
