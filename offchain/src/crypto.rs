use crate::error::{CResult, Error};

/// Signs and verifies opaque wire payloads. The concrete scheme (the
/// original uses compact JWS over EdDSA compliance keys) lives outside
/// this crate; the channel only needs the seam.
///
/// `verify` must return the recovered payload, and fail with
/// Error::Signature on any tampering -- the channel treats that as fatal.
pub trait Signer: Send + Sync {
    /// Signs a payload, returning the signed envelope to put on the wire.
    fn sign(&self, payload: &str) -> CResult<String>;

    /// Verifies a signed envelope and returns the payload it protects.
    fn verify(&self, signed: &str) -> CResult<String>;
}

/// Pass-through signer for tests and loopback wiring: the envelope is the
/// payload itself.
pub struct NullSigner;

impl Signer for NullSigner {
    fn sign(&self, payload: &str) -> CResult<String> {
        Ok(payload.to_string())
    }

    fn verify(&self, signed: &str) -> CResult<String> {
        Ok(signed.to_string())
    }
}

/// A toy envelope signer for exercising the failure path: prefixes the
/// payload with a shared-secret tag and rejects envelopes without it.
pub struct TagSigner {
    tag: String,
}

impl TagSigner {
    pub fn new(tag: impl Into<String>) -> Self {
        TagSigner { tag: tag.into() }
    }
}

impl Signer for TagSigner {
    fn sign(&self, payload: &str) -> CResult<String> {
        Ok(format!("{}.{}", self.tag, payload))
    }

    fn verify(&self, signed: &str) -> CResult<String> {
        match signed.split_once('.') {
            Some((tag, payload)) if tag == self.tag => Ok(payload.to_string()),
            _ => Err(Error::Signature("envelope tag mismatch".to_string())),
        }
    }
}
