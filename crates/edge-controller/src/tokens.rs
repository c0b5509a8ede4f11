use sha2::{Digest, Sha256};

/// Hash a bearer token for use as a store key.
///
/// Bearer values never hit the disk in the clear; lookups hash first. The
/// digest is deterministic so the by-token index stays a plain key lookup.
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    format!("{:x}", hasher.finalize())
}
