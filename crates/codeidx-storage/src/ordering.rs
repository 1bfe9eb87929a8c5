//! Row-order digest
//!
//! Hashes each row's canonical JSON line in stream order so two builds can
//! be compared without diffing their artifacts.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Final digest of a row stream
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderingDigest {
    /// `sha256:<hex>`
    pub hash: String,
    pub count: u64,
}

#[derive(Debug, Clone, Default)]
pub struct OrderingHasher {
    hasher: Sha256,
    count: u64,
}

impl OrderingHasher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one serialized row, without its trailing newline
    pub fn update(&mut self, line: &[u8]) {
        self.hasher.update(line);
        self.hasher.update(b"\n");
        self.count += 1;
    }

    pub fn finish(self) -> OrderingDigest {
        OrderingDigest {
            hash: format!("sha256:{}", hex::encode(self.hasher.finalize())),
            count: self.count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest(lines: &[&str]) -> OrderingDigest {
        let mut hasher = OrderingHasher::new();
        for line in lines {
            hasher.update(line.as_bytes());
        }
        hasher.finish()
    }

    #[test]
    fn test_order_sensitive() {
        let a = digest(&["{\"id\":1}", "{\"id\":2}"]);
        let b = digest(&["{\"id\":2}", "{\"id\":1}"]);
        assert_ne!(a.hash, b.hash);
        assert_eq!(a.count, 2);
        assert!(a.hash.starts_with("sha256:"));
        assert_eq!(a, digest(&["{\"id\":1}", "{\"id\":2}"]));
    }
}
