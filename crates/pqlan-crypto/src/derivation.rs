//! Key derivation using HKDF-SHA256.

use std::fmt;

use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{Fingerprint, kem::SessionSecret};

/// Label for pairwise session key derivation
const SESSION_KEY_LABEL: &[u8] = b"pqlanSessionV1";

/// Label for per-sender group key derivation
const GROUP_SENDER_LABEL: &[u8] = b"pqlanGroupSenderV1";

/// Symmetric key length.
pub const KEY_SIZE: usize = 32;

/// A 32-byte symmetric key, wiped on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey([u8; KEY_SIZE]);

impl SymmetricKey {
    /// Wrap raw key bytes.
    pub const fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Borrow the key bytes.
    pub const fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SymmetricKey([REDACTED])")
    }
}

/// Directional keys for one pairwise session.
///
/// Each direction gets its own key so both peers can start their send counter
/// at zero without ever reusing a (key, nonce) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionKeys {
    /// Key for frames sent by the initiator
    pub initiator_to_responder: SymmetricKey,
    /// Key for frames sent by the responder
    pub responder_to_initiator: SymmetricKey,
}

/// Derive the session keys from a KEM shared secret.
///
/// The secret is taken by value and dropped (wiped) on return, so it is used
/// for exactly one derivation.
///
/// # Security
///
/// - Both fingerprints are bound into the info string: a secret replayed into
///   a session between other peers yields unrelated keys
/// - The protocol version is bound so a downgrade changes every key
pub fn derive_session_keys(
    secret: SessionSecret,
    initiator: &Fingerprint,
    responder: &Fingerprint,
    protocol_version: u8,
) -> SessionKeys {
    let hkdf = Hkdf::<Sha256>::new(None, secret.as_bytes());

    // label || I.fp || R.fp || version
    let mut info = Vec::with_capacity(SESSION_KEY_LABEL.len() + 32 + 32 + 1);
    info.extend_from_slice(SESSION_KEY_LABEL);
    info.extend_from_slice(initiator.as_bytes());
    info.extend_from_slice(responder.as_bytes());
    info.push(protocol_version);

    let mut okm = [0u8; 2 * KEY_SIZE];
    let Ok(()) = hkdf.expand(&info, &mut okm) else {
        unreachable!("64 bytes is a valid HKDF-SHA256 output length");
    };

    let mut i2r = [0u8; KEY_SIZE];
    let mut r2i = [0u8; KEY_SIZE];
    i2r.copy_from_slice(&okm[..KEY_SIZE]);
    r2i.copy_from_slice(&okm[KEY_SIZE..]);
    okm.zeroize();

    let keys = SessionKeys {
        initiator_to_responder: SymmetricKey(i2r),
        responder_to_initiator: SymmetricKey(r2i),
    };
    i2r.zeroize();
    r2i.zeroize();
    keys
}

/// Derive the key one member uses to encrypt to a group.
///
/// Unique per (group key, group, epoch, sender): two members sending with the
/// same counter never share a nonce under the same key.
pub fn derive_group_sender_key(
    group_key: &SymmetricKey,
    group_id: &[u8; 16],
    epoch: u32,
    sender: &Fingerprint,
) -> SymmetricKey {
    let hkdf = Hkdf::<Sha256>::new(None, group_key.as_bytes());

    // label || group_id || epoch || sender
    let mut info = Vec::with_capacity(GROUP_SENDER_LABEL.len() + 16 + 4 + 32);
    info.extend_from_slice(GROUP_SENDER_LABEL);
    info.extend_from_slice(group_id);
    info.extend_from_slice(&epoch.to_be_bytes());
    info.extend_from_slice(sender.as_bytes());

    let mut key = SymmetricKey([0u8; KEY_SIZE]);
    let Ok(()) = hkdf.expand(&info, &mut key.0) else {
        unreachable!("32 bytes is a valid HKDF-SHA256 output length");
    };
    key
}
