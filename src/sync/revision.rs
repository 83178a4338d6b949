//! Immutable config revisions

use std::time::SystemTime;

use sha2::{Digest, Sha256};

/// One fully rendered version of the daemon's config
///
/// A revision is derived, disposable state: it can be regenerated at any time
/// from the server profile and the active peer set, and is never treated as a
/// source of truth. The digest is a pure function of the text, so two renders
/// of the same state compare equal and redundant commits are detected cheaply.
#[derive(Debug, Clone)]
pub struct ConfigRevision {
    number: u64,
    text: String,
    digest: String,
    created_at: SystemTime,
}

impl ConfigRevision {
    /// Create a revision from rendered config text
    pub fn new(number: u64, text: String) -> Self {
        let digest = hex_digest(&text);
        Self {
            number,
            text,
            digest,
            created_at: SystemTime::now(),
        }
    }

    /// Monotonic revision number
    pub fn number(&self) -> u64 {
        self.number
    }

    /// The rendered config text
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Lowercase hex SHA-256 of the text
    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// When the revision was rendered
    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }
}

fn hex_digest(text: &str) -> String {
    let hash = Sha256::digest(text.as_bytes());
    hash.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_is_deterministic() {
        let a = ConfigRevision::new(1, "[Interface]\n".into());
        let b = ConfigRevision::new(2, "[Interface]\n".into());
        assert_eq!(a.digest(), b.digest());
        assert_eq!(a.digest().len(), 64);
    }

    #[test]
    fn test_digest_changes_with_text() {
        let a = ConfigRevision::new(1, "[Interface]\n".into());
        let b = ConfigRevision::new(1, "[Interface]\nListenPort = 1\n".into());
        assert_ne!(a.digest(), b.digest());
    }

    #[test]
    fn test_accessors() {
        let rev = ConfigRevision::new(7, "text".into());
        assert_eq!(rev.number(), 7);
        assert_eq!(rev.text(), "text");
    }
}
