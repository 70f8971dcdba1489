pub mod config;
pub mod error;
pub mod scrub;
pub mod types;

pub use config::Config;
pub use error::{RefineryError, Result};
pub use scrub::scrub_pii;
pub use types::*;

use sha2::{Digest, Sha256};

/// SHA-256 of the scrubbed text in lowercase hex: the deduplication key
/// for everything the pipeline ingests.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_hash_is_stable() {
        let a = content_hash("Central bank hikes rates 25bp.");
        let b = content_hash("Central bank hikes rates 25bp.");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn content_hash_differs_on_different_text() {
        assert_ne!(content_hash("one"), content_hash("two"));
    }
}
