//! Out-of-band pairing payload.
//!
//! The bytes a QR code carries between two devices. Self-describing CBOR so
//! later payload versions can add fields without breaking older readers.

use pqlan_crypto::Fingerprint;
use serde::{Deserialize, Serialize};

use crate::errors::{ProtocolError, Result};

/// Current pairing payload version.
pub const PAIRING_PAYLOAD_VERSION: u8 = 1;

/// Identity tuple exchanged during pairing.
///
/// Decoding only checks structure. Whether the fingerprint matches the key and
/// whether the version is supported is decided by the identity store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingPayload {
    /// Payload format version
    pub version: u8,
    /// SHA-256 of `signing_public_key`
    pub fingerprint: Fingerprint,
    /// Encoded ML-DSA public key
    pub signing_public_key: Vec<u8>,
    /// Optional address hint (`host:port`) for the first connection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

impl PairingPayload {
    /// Encode as CBOR.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::CborEncode` if serialization fails
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::ser::into_writer(self, &mut buf)
            .map_err(|e| ProtocolError::CborEncode(e.to_string()))?;
        Ok(buf)
    }

    /// Decode from CBOR.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::FieldTooLarge` if the input exceeds
    ///   [`crate::MAX_FIELD_SIZE`]
    /// - `ProtocolError::CborDecode` on malformed input
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() > crate::MAX_FIELD_SIZE {
            return Err(ProtocolError::FieldTooLarge {
                size: bytes.len(),
                max: crate::MAX_FIELD_SIZE,
            });
        }
        ciborium::de::from_reader(bytes).map_err(|e| ProtocolError::CborDecode(e.to_string()))
    }
}
