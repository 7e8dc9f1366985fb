pub mod factory;
pub mod memory;
pub mod store;

use sha2::{Digest, Sha256};

/// A storage namespace: the sha-256 digest of a hierarchical path, rendered
/// as hex. Hashing the length-prefixed path join makes namespaces of
/// distinct logical objects collision-free by construction.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Namespace(String);

impl Namespace {
    /// Derives the namespace for a hierarchical path, e.g.
    /// `["", my_addr, peer_addr, "my_requests"]`.
    pub fn derive(path: &[&str]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(key_join(path).as_bytes());
        Namespace(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Joins path segments into a single parseable string. Length prefixes keep
/// the mapping one-to-one so distinct paths can never collide.
fn key_join(parts: &[&str]) -> String {
    parts
        .iter()
        .map(|part| format!("[{}:{}]", part.len(), part))
        .collect::<Vec<_>>()
        .join("||")
}
