//! Long-term identity signatures (ML-DSA-65).
//!
//! All signatures carry a fixed context string so a pqlan signature can never
//! be confused with a signature made by the same key for another protocol.

use std::fmt;

use fips204::{
    ml_dsa_65,
    traits::{SerDes, Signer, Verifier},
};
use rand_core::CryptoRngCore;
use zeroize::Zeroizing;

use crate::{Fingerprint, error::SignatureError};

/// Encoded public key length.
pub const PUBLIC_KEY_SIZE: usize = ml_dsa_65::PK_LEN;

/// Encoded secret key length.
pub const SECRET_KEY_SIZE: usize = ml_dsa_65::SK_LEN;

/// Signature length.
pub const SIGNATURE_SIZE: usize = ml_dsa_65::SIG_LEN;

/// Signing context bound into every signature.
const SIGNING_CONTEXT: &[u8] = b"pqlan-v1";

/// A parsed, validated ML-DSA-65 public key.
#[derive(Clone)]
pub struct SigningPublicKey {
    inner: ml_dsa_65::PublicKey,
    encoded: Vec<u8>,
}

impl SigningPublicKey {
    /// Parse an encoded public key.
    ///
    /// # Errors
    ///
    /// - `SignatureError::InvalidPublicKey` on wrong length or invalid encoding
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SignatureError> {
        let array: [u8; PUBLIC_KEY_SIZE] =
            bytes.try_into().map_err(|_| SignatureError::InvalidPublicKey("wrong length"))?;
        let inner = ml_dsa_65::PublicKey::try_from_bytes(array)
            .map_err(|_| SignatureError::InvalidPublicKey("invalid encoding"))?;

        Ok(Self { inner, encoded: bytes.to_vec() })
    }

    /// Encoded key bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.encoded
    }

    /// SHA-256 fingerprint of the encoded key.
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of(&self.encoded)
    }

    /// Verify `signature` over `message`. Returns `false` for any mismatch,
    /// including a signature of the wrong length.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        let Ok(signature) = <&[u8; SIGNATURE_SIZE]>::try_from(signature) else {
            return false;
        };
        self.inner.verify(message, signature, SIGNING_CONTEXT)
    }
}

impl PartialEq for SigningPublicKey {
    fn eq(&self, other: &Self) -> bool {
        self.encoded == other.encoded
    }
}

impl Eq for SigningPublicKey {}

impl fmt::Debug for SigningPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SigningPublicKey({:?})", self.fingerprint())
    }
}

/// Verify a signature against an encoded public key.
///
/// Unparseable keys and malformed signatures verify as `false`; the caller
/// treats that as a hard authentication failure.
pub fn verify(public_key: &[u8], message: &[u8], signature: &[u8]) -> bool {
    SigningPublicKey::from_bytes(public_key).is_ok_and(|pk| pk.verify(message, signature))
}

/// Local long-term signing keypair.
pub struct SigningKeyPair {
    public: SigningPublicKey,
    secret: ml_dsa_65::PrivateKey,
}

impl SigningKeyPair {
    /// Generate a new keypair.
    ///
    /// # Errors
    ///
    /// - `SignatureError::Entropy` if the RNG fails
    pub fn generate(rng: &mut impl CryptoRngCore) -> Result<Self, SignatureError> {
        let (pk, sk) = ml_dsa_65::try_keygen_with_rng(rng).map_err(SignatureError::Entropy)?;
        let encoded = pk.clone().into_bytes().to_vec();

        Ok(Self { public: SigningPublicKey { inner: pk, encoded }, secret: sk })
    }

    /// Restore a keypair from persisted bytes.
    ///
    /// # Errors
    ///
    /// - `SignatureError::InvalidSecretKey` if the secret key cannot be parsed
    /// - `SignatureError::InvalidPublicKey` if the public key cannot be parsed
    pub fn from_bytes(public_key: &[u8], secret_key: &[u8]) -> Result<Self, SignatureError> {
        let public = SigningPublicKey::from_bytes(public_key)?;

        let array: Zeroizing<[u8; SECRET_KEY_SIZE]> = Zeroizing::new(
            secret_key.try_into().map_err(|_| SignatureError::InvalidSecretKey)?,
        );
        let secret = ml_dsa_65::PrivateKey::try_from_bytes(*array)
            .map_err(|_| SignatureError::InvalidSecretKey)?;

        Ok(Self { public, secret })
    }

    /// Public half.
    pub fn public_key(&self) -> &SigningPublicKey {
        &self.public
    }

    /// Fingerprint of the public half.
    pub fn fingerprint(&self) -> Fingerprint {
        self.public.fingerprint()
    }

    /// Encoded secret key, for persistence only. Wiped when dropped.
    pub fn secret_bytes(&self) -> Zeroizing<Vec<u8>> {
        Zeroizing::new(self.secret.clone().into_bytes().to_vec())
    }

    /// Sign `message`.
    ///
    /// # Errors
    ///
    /// - `SignatureError::Entropy` if the signer's hedging randomness fails
    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>, SignatureError> {
        let signature =
            self.secret.try_sign(message, SIGNING_CONTEXT).map_err(SignatureError::Entropy)?;
        Ok(signature.to_vec())
    }
}

impl fmt::Debug for SigningKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKeyPair")
            .field("fingerprint", &self.fingerprint())
            .finish_non_exhaustive()
    }
}
