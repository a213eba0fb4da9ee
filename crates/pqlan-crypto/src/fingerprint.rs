//! Public key fingerprints.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Fingerprint length (SHA-256 output).
pub const FINGERPRINT_SIZE: usize = 32;

/// SHA-256 hash of a signing public key.
///
/// Stable short identifier for trust decisions. Ordering is lexicographic over
/// the raw bytes, which is also the handshake tie-break order.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Fingerprint([u8; FINGERPRINT_SIZE]);

impl Fingerprint {
    /// Fingerprint of the given encoded public key.
    pub fn of(public_key_bytes: &[u8]) -> Self {
        Self(Sha256::digest(public_key_bytes).into())
    }

    /// Wrap raw fingerprint bytes (e.g. parsed from the wire).
    pub const fn from_bytes(bytes: [u8; FINGERPRINT_SIZE]) -> Self {
        Self(bytes)
    }

    /// Raw fingerprint bytes.
    pub const fn as_bytes(&self) -> &[u8; FINGERPRINT_SIZE] {
        &self.0
    }

    /// First 8 bytes as hex, for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }

    /// Parse a full 64-character hex fingerprint.
    pub fn from_hex(s: &str) -> Option<Self> {
        let mut bytes = [0u8; FINGERPRINT_SIZE];
        hex::decode_to_slice(s, &mut bytes).ok()?;
        Some(Self(bytes))
    }
}

/// SHA-256 of arbitrary transcript material.
pub fn transcript_hash(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({}..)", self.short())
    }
}
