//! Stable content hashing for values persisted in annotations
//!
//! `DefaultHasher` is not guaranteed stable across Rust releases, so anything
//! persisted to the cluster (build revisions, logging hashes) uses truncated
//! SHA-256 instead.

use sha2::{Digest, Sha256};

/// Compute a deterministic hash of the input, returning a 16-char hex digest
pub fn content_hash(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    digest[..8]
        .iter()
        .fold(String::with_capacity(16), |mut s, b| {
            use std::fmt::Write;
            let _ = write!(s, "{:02x}", b);
            s
        })
}
