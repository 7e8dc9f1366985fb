use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{CResult, Error};

/// The network address of a VASP. An opaque byte string with exactly two
/// defined operations: the last bit of its final byte, and lexicographic
/// comparison. Rendered and parsed as hex.
///
/// The pair of addresses on a channel determines the client/server role of
/// each side, so both sides must agree on the byte content exactly.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address {
    bytes: Vec<u8>,
}

impl Address {
    /// Creates an address from raw bytes. Empty addresses are rejected,
    /// since role assignment needs at least one byte.
    pub fn new(bytes: impl Into<Vec<u8>>) -> CResult<Self> {
        let bytes = bytes.into();
        if bytes.is_empty() {
            return Err(Error::Channel("empty VASP address".to_string()));
        }
        Ok(Address { bytes })
    }

    /// Parses an address from its hex rendering.
    pub fn from_hex(s: &str) -> CResult<Self> {
        let bytes = hex::decode(s).map_err(|err| Error::Parse(err.to_string()))?;
        Address::new(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// The hex rendering used on the wire and in storage paths.
    pub fn as_str(&self) -> String {
        hex::encode(&self.bytes)
    }

    /// The lowest bit of the final byte.
    pub fn last_bit(&self) -> u8 {
        self.bytes[self.bytes.len() - 1] & 1
    }

    /// Lexicographic greater-or-equal, the comparison role assignment uses.
    pub fn greater_than_or_equal(&self, other: &Address) -> bool {
        self.bytes >= other.bytes
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.as_str())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Address::from_hex(&s).map_err(|err| D::Error::custom(err.to_string()))
    }
}
