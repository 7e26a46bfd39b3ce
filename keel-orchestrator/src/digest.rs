//! Content digests
//!
//! Every digest in Keel is a hex encoded sha256. Multi-part digests
//! length-prefix each part so that `("ab", "c")` and `("a", "bc")` differ.

use sha2::{Digest, Sha256};

/// Digest of a sequence of byte strings
pub fn digest_parts(parts: &[&[u8]]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update((part.len() as u64).to_be_bytes());
        hasher.update(part);
    }
    hex::encode(hasher.finalize())
}

/// Digest of a single string
pub fn digest_str(value: &str) -> String {
    digest_parts(&[value.as_bytes()])
}
