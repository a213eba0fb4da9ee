//! Key Exchange Engine (ML-KEM-768).
//!
//! One ephemeral keypair per handshake attempt. The responder encapsulates to
//! the initiator's public key; the initiator decapsulates the ciphertext. Both
//! end up with the same 32-byte [`SessionSecret`], which the KDF consumes.
//!
//! # Implicit Rejection
//!
//! A ciphertext of the right length that was not produced for this key still
//! decapsulates: ML-KEM returns a pseudo-random value derived from the secret
//! key and the ciphertext instead of an error. The handshake then fails at key
//! confirmation (READY does not open), with no timing or error signal from
//! decapsulation itself. Only structurally malformed input is an error here.

use std::fmt;

use fips203::{
    ml_kem_768,
    traits::{Decaps, Encaps, KeyGen, SerDes},
};
use rand_core::CryptoRngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::KemError;

/// Encoded encapsulation (public) key length.
pub const ENCAPSULATION_KEY_SIZE: usize = ml_kem_768::EK_LEN;

/// Encoded ciphertext length.
pub const CIPHERTEXT_SIZE: usize = ml_kem_768::CT_LEN;

/// Shared secret length.
pub const SHARED_SECRET_SIZE: usize = 32;

/// Raw KEM shared secret.
///
/// Consumed by value by [`crate::derive_session_keys`] and wiped on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionSecret([u8; SHARED_SECRET_SIZE]);

impl SessionSecret {
    /// Wrap raw secret bytes.
    pub const fn from_bytes(bytes: [u8; SHARED_SECRET_SIZE]) -> Self {
        Self(bytes)
    }

    /// Borrow the secret bytes.
    pub const fn as_bytes(&self) -> &[u8; SHARED_SECRET_SIZE] {
        &self.0
    }
}

impl fmt::Debug for SessionSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionSecret([REDACTED])")
    }
}

/// Ephemeral ML-KEM keypair for a single handshake attempt.
///
/// The decapsulation key never leaves this struct. `DecapsKey` is
/// `ZeroizeOnDrop`, so dropping the pair wipes it. There is no serialization:
/// ephemeral keys are never persisted.
pub struct EphemeralKeyPair {
    encapsulation_key: Vec<u8>,
    decapsulation_key: ml_kem_768::DecapsKey,
}

impl EphemeralKeyPair {
    /// Encoded encapsulation key to put on the wire.
    pub fn public_bytes(&self) -> &[u8] {
        &self.encapsulation_key
    }
}

impl fmt::Debug for EphemeralKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EphemeralKeyPair")
            .field("encapsulation_key_len", &self.encapsulation_key.len())
            .finish_non_exhaustive()
    }
}

/// Generate a fresh ephemeral keypair.
///
/// # Errors
///
/// - `KemError::Entropy` if the RNG fails
pub fn generate_ephemeral(rng: &mut impl CryptoRngCore) -> Result<EphemeralKeyPair, KemError> {
    let (ek, dk) = ml_kem_768::KG::try_keygen_with_rng(rng).map_err(KemError::Entropy)?;

    Ok(EphemeralKeyPair { encapsulation_key: ek.into_bytes().to_vec(), decapsulation_key: dk })
}

/// Encapsulate to a peer's encoded encapsulation key.
///
/// Returns the ciphertext to send and the shared secret to keep.
///
/// # Errors
///
/// - `KemError::InvalidEncapsulationKey` if the key has the wrong length or
///   fails the encoding check
/// - `KemError::Entropy` if the RNG fails
pub fn encapsulate(
    peer_encapsulation_key: &[u8],
    rng: &mut impl CryptoRngCore,
) -> Result<(Vec<u8>, SessionSecret), KemError> {
    let invalid = || KemError::InvalidEncapsulationKey {
        expected: ENCAPSULATION_KEY_SIZE,
        actual: peer_encapsulation_key.len(),
    };

    let bytes: [u8; ENCAPSULATION_KEY_SIZE] =
        peer_encapsulation_key.try_into().map_err(|_| invalid())?;
    let ek = ml_kem_768::EncapsKey::try_from_bytes(bytes).map_err(|_| invalid())?;

    let (shared, ciphertext) = ek.try_encaps_with_rng(rng).map_err(KemError::Entropy)?;

    Ok((ciphertext.into_bytes().to_vec(), SessionSecret(shared.into_bytes())))
}

/// Decapsulate a ciphertext with the local ephemeral keypair.
///
/// # Errors
///
/// - `KemError::Decapsulation` if the ciphertext has the wrong length or cannot
///   be parsed. A well-formed ciphertext never errors (implicit rejection).
pub fn decapsulate(
    keypair: &EphemeralKeyPair,
    ciphertext: &[u8],
) -> Result<SessionSecret, KemError> {
    let bytes: [u8; CIPHERTEXT_SIZE] = ciphertext
        .try_into()
        .map_err(|_| KemError::Decapsulation { reason: "wrong ciphertext length" })?;
    let ct = ml_kem_768::CipherText::try_from_bytes(bytes)
        .map_err(|_| KemError::Decapsulation { reason: "malformed ciphertext" })?;

    let shared = keypair
        .decapsulation_key
        .try_decaps(&ct)
        .map_err(|_| KemError::Decapsulation { reason: "decapsulation rejected input" })?;

    Ok(SessionSecret(shared.into_bytes()))
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    use super::*;

    #[test]
    fn encapsulate_then_decapsulate_agrees() {
        let mut rng = ChaCha20Rng::seed_from_u64(1);
        let keypair = generate_ephemeral(&mut rng).unwrap();

        let (ct, sender_secret) = encapsulate(keypair.public_bytes(), &mut rng).unwrap();
        let receiver_secret = decapsulate(&keypair, &ct).unwrap();

        assert_eq!(sender_secret.as_bytes(), receiver_secret.as_bytes());
        assert_eq!(ct.len(), CIPHERTEXT_SIZE);
    }

    #[test]
    fn short_encapsulation_key_rejected() {
        let mut rng = ChaCha20Rng::seed_from_u64(2);
        let err = encapsulate(&[0u8; 12], &mut rng).unwrap_err();
        assert_eq!(
            err,
            KemError::InvalidEncapsulationKey { expected: ENCAPSULATION_KEY_SIZE, actual: 12 }
        );
    }

    #[test]
    fn wrong_length_ciphertext_rejected() {
        let mut rng = ChaCha20Rng::seed_from_u64(3);
        let keypair = generate_ephemeral(&mut rng).unwrap();

        assert!(matches!(
            decapsulate(&keypair, &[0u8; CIPHERTEXT_SIZE - 1]),
            Err(KemError::Decapsulation { .. })
        ));
        assert!(matches!(decapsulate(&keypair, &[]), Err(KemError::Decapsulation { .. })));
    }

    #[test]
    fn tampered_ciphertext_yields_different_secret() {
        let mut rng = ChaCha20Rng::seed_from_u64(4);
        let keypair = generate_ephemeral(&mut rng).unwrap();
        let (mut ct, sender_secret) = encapsulate(keypair.public_bytes(), &mut rng).unwrap();

        ct[7] ^= 0x01;
        let rejected = decapsulate(&keypair, &ct).unwrap();

        assert_ne!(rejected.as_bytes(), sender_secret.as_bytes());
    }

    #[test]
    fn ciphertext_for_other_key_decapsulates_to_unrelated_secret() {
        let mut rng = ChaCha20Rng::seed_from_u64(5);
        let ours = generate_ephemeral(&mut rng).unwrap();
        let theirs = generate_ephemeral(&mut rng).unwrap();

        let (ct, secret_for_them) = encapsulate(theirs.public_bytes(), &mut rng).unwrap();
        let ours_secret = decapsulate(&ours, &ct).unwrap();

        assert_ne!(ours_secret.as_bytes(), secret_for_them.as_bytes());
    }

    #[test]
    fn keypairs_are_fresh() {
        let mut rng = ChaCha20Rng::seed_from_u64(6);
        let a = generate_ephemeral(&mut rng).unwrap();
        let b = generate_ephemeral(&mut rng).unwrap();
        assert_ne!(a.public_bytes(), b.public_bytes());
    }
}
