use std::sync::Mutex;

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use serde_derive::{Deserialize, Serialize};

/// An opaque, globally-unique identifier attached to every shared object
/// revision. Freshly minted identifiers are 16 random bytes rendered as
/// lowercase hex, but any opaque string a command declares is legal.
/// Equality is byte-equality.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionId(String);

impl VersionId {
    pub fn new(id: impl Into<String>) -> Self {
        VersionId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for VersionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for VersionId {
    fn from(s: &str) -> Self {
        VersionId(s.to_string())
    }
}

/// Source of unique strings: fresh object versions and request correlators
/// (cid). One generator is carried by the VASP registry and shared by its
/// channels; tests construct a seeded one to get deterministic identifiers.
pub struct UidGenerator {
    rng: Mutex<StdRng>,
}

impl UidGenerator {
    /// Creates a generator seeded from OS entropy.
    pub fn new() -> Self {
        UidGenerator { rng: Mutex::new(StdRng::from_entropy()) }
    }

    /// Creates a deterministic generator from a fixed seed.
    pub fn seeded(seed: u64) -> Self {
        UidGenerator { rng: Mutex::new(StdRng::seed_from_u64(seed)) }
    }

    /// Returns a fresh unique string: 16 random bytes, hex encoded.
    pub fn unique_str(&self) -> String {
        let mut bytes = [0u8; 16];
        // A poisoned rng lock means a panic mid-fill; aborting here is fine.
        self.rng.lock().expect("uid generator lock poisoned").fill_bytes(&mut bytes);
        hex::encode(bytes)
    }

    /// Returns a fresh object version identifier.
    pub fn fresh_version(&self) -> VersionId {
        VersionId(self.unique_str())
    }
}

impl Default for UidGenerator {
    fn default() -> Self {
        Self::new()
    }
}
