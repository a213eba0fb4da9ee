//! Error types for cryptographic primitives.
//!
//! Messages never include key or plaintext material.

use thiserror::Error;

/// Key encapsulation failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KemError {
    /// Encapsulation key has the wrong length or an invalid encoding
    #[error("invalid encapsulation key: expected {expected} bytes, got {actual}")]
    InvalidEncapsulationKey {
        /// Required length
        expected: usize,
        /// Received length
        actual: usize,
    },

    /// Ciphertext is malformed or has the wrong length
    #[error("decapsulation failed: {reason}")]
    Decapsulation {
        /// What was wrong with the input
        reason: &'static str,
    },

    /// Random number generator failed during key generation or encapsulation
    #[error("entropy source failure: {0}")]
    Entropy(&'static str),
}

/// Signature scheme failures.
///
/// Verification does not use this type: it returns `bool`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignatureError {
    /// Public key bytes have the wrong length or are not a valid key
    #[error("invalid signing public key: {0}")]
    InvalidPublicKey(&'static str),

    /// Secret key bytes have the wrong length or are not a valid key
    #[error("invalid signing secret key")]
    InvalidSecretKey,

    /// Random number generator failed during key generation or signing
    #[error("entropy source failure: {0}")]
    Entropy(&'static str),
}

/// AEAD failures.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AeadError {
    /// Authentication tag did not verify (tampering or wrong key)
    #[error("authentication failed")]
    AuthenticationFailed,
}

/// Replay window rejections.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayError {
    /// Counter was already accepted
    #[error("duplicate counter {counter}")]
    Duplicate {
        /// Rejected counter
        counter: u64,
    },

    /// Counter is older than the window allows
    #[error("counter {counter} outside window (highest {highest})")]
    TooOld {
        /// Rejected counter
        counter: u64,
        /// Highest counter accepted so far
        highest: u64,
    },
}
