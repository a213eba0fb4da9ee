//! Frame encryption using `XChaCha20-Poly1305`
//!
//! Nonces are deterministic: they are built from the channel namespace, the
//! epoch and the frame counter. Uniqueness is the caller's job, enforced by
//! never reusing a counter under one key.

use chacha20poly1305::{
    Tag, XChaCha20Poly1305, XNonce,
    aead::{AeadInPlace, KeyInit},
};

use crate::{SymmetricKey, error::AeadError};

/// Poly1305 tag size (16 bytes)
pub const TAG_SIZE: usize = 16;

/// Nonce size for `XChaCha20` (24 bytes)
pub const NONCE_SIZE: usize = 24;

/// Which kind of channel a key belongs to.
///
/// Written into the first nonce byte so a pairwise frame and a group frame can
/// never collide even if keys were ever shared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ChannelNamespace {
    /// Pairwise session traffic
    Pairwise = 0x01,
    /// Group traffic
    Group = 0x02,
}

/// Ciphertext with its detached authentication tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedPayload {
    /// Encrypted bytes (same length as the plaintext)
    pub ciphertext: Vec<u8>,
    /// Poly1305 tag
    pub tag: [u8; TAG_SIZE],
}

/// Encrypt `plaintext` under `key`.
///
/// `aad` is authenticated but not encrypted; callers put the frame header
/// (including the counter) there.
pub fn seal(
    key: &SymmetricKey,
    namespace: ChannelNamespace,
    epoch: u32,
    counter: u64,
    aad: &[u8],
    plaintext: &[u8],
) -> SealedPayload {
    let nonce = build_nonce(namespace, epoch, counter);
    let cipher = XChaCha20Poly1305::new(key.as_bytes().into());

    let mut buffer = plaintext.to_vec();
    let Ok(tag) = cipher.encrypt_in_place_detached(XNonce::from_slice(&nonce), aad, &mut buffer)
    else {
        unreachable!("XChaCha20-Poly1305 encryption cannot fail below the 256 GiB limit");
    };

    let mut tag_bytes = [0u8; TAG_SIZE];
    tag_bytes.copy_from_slice(&tag);
    SealedPayload { ciphertext: buffer, tag: tag_bytes }
}

/// Decrypt and authenticate a sealed payload.
///
/// # Errors
///
/// - `AeadError::AuthenticationFailed` if the tag does not verify. Nothing
///   about the plaintext is returned in that case.
pub fn open(
    key: &SymmetricKey,
    namespace: ChannelNamespace,
    epoch: u32,
    counter: u64,
    aad: &[u8],
    ciphertext: &[u8],
    tag: &[u8; TAG_SIZE],
) -> Result<Vec<u8>, AeadError> {
    let nonce = build_nonce(namespace, epoch, counter);
    let cipher = XChaCha20Poly1305::new(key.as_bytes().into());

    let mut buffer = ciphertext.to_vec();
    cipher
        .decrypt_in_place_detached(
            XNonce::from_slice(&nonce),
            aad,
            &mut buffer,
            Tag::from_slice(tag),
        )
        .map_err(|_| AeadError::AuthenticationFailed)?;

    Ok(buffer)
}

/// Build a 24-byte nonce for `XChaCha20`.
///
/// Structure:
/// - byte 0: namespace
/// - bytes 1-3: zero
/// - bytes 4-7: epoch (big-endian)
/// - bytes 8-15: counter (big-endian)
/// - bytes 16-23: zero
fn build_nonce(namespace: ChannelNamespace, epoch: u32, counter: u64) -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    nonce[0] = namespace as u8;
    nonce[4..8].copy_from_slice(&epoch.to_be_bytes());
    nonce[8..16].copy_from_slice(&counter.to_be_bytes());
    nonce
}
