//! Content fingerprinting and normalization.
//!
//! [`content_hash`] is the single source of truth for "is this the same
//! content?" decisions. It hashes the exact bytes it is given: no trimming,
//! no case folding, no line-ending normalization. Any byte difference,
//! including whitespace, yields a different digest.
//!
//! [`process_content`] derives the search-ready form stored alongside the
//! raw content. It is recomputed on every content change and never takes
//! part in deduplication.
//!
//! # Example
//!
//! ```rust
//! use imaging_records_core::hash::{content_hash, DIGEST_HEX_LEN};
//!
//! let a = content_hash(b"hello");
//! let b = content_hash(b"hello ");
//! assert_eq!(a.len(), DIGEST_HEX_LEN);
//! assert_ne!(a, b);
//! ```

use sha2::{Digest, Sha256};

/// Length of a hex-encoded SHA-256 digest.
pub const DIGEST_HEX_LEN: usize = 64;

/// SHA-256 of `content`, lowercase hex.
pub fn content_hash(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    hex::encode(hasher.finalize())
}

/// Normalize raw report text for search.
///
/// Control characters become spaces, whitespace runs collapse to a single
/// space, the result is trimmed and lowercased.
pub fn process_content(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// First `n` characters of a digest, for log lines and change descriptions.
pub fn short_hash(hash: &str, n: usize) -> &str {
    match hash.char_indices().nth(n) {
        Some((idx, _)) => &hash[..idx],
        None => hash,
    }
}
