//! pqlan Cryptographic Primitives
//!
//! Cryptographic building blocks for the pqlan session protocol. Pure
//! functions with deterministic outputs wherever the algorithm allows it.
//! Callers provide the random number generator so tests can run seeded.
//!
//! # Key Lifecycle
//!
//! Long-term identities sign handshake messages. Each handshake generates a
//! fresh ML-KEM keypair whose shared secret is consumed once by HKDF to produce
//! two directional channel keys. Group keys are random per epoch and expanded
//! into one key per sender.
//!
//! ```text
//! ML-DSA identity ──signs──> Offer / Response
//!                                │
//! ML-KEM ephemeral ──encaps──> SessionSecret (consumed once)
//!                                │
//!                                ▼
//!             HKDF → initiator→responder key, responder→initiator key
//!                                │
//!                                ▼
//!          XChaCha20-Poly1305 (counter nonce, namespace byte) → DATA
//!
//! random group key (per epoch) → HKDF per sender → GROUP_DATA
//! ```
//!
//! # Security
//!
//! Forward Secrecy:
//! - Ephemeral decapsulation keys are zeroized on drop
//! - Shared secrets are consumed by value and zeroized after derivation
//! - Group epochs never derive from the previous group key
//!
//! Nonce Uniqueness:
//! - Pairwise traffic uses a separate key per direction
//! - Group traffic uses a separate key per sender
//! - The nonce binds (namespace, epoch, counter); counters never repeat
//!
//! Authenticity:
//! - AEAD tag failure rejects the frame before the replay window is touched
//! - Signature verification is a boolean the caller must check

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod aead;
pub mod derivation;
mod error;
pub mod fingerprint;
pub mod kem;
pub mod replay;
pub mod signature;

pub use aead::{ChannelNamespace, SealedPayload, TAG_SIZE, open, seal};
pub use derivation::{SessionKeys, SymmetricKey, derive_group_sender_key, derive_session_keys};
pub use error::{AeadError, KemError, ReplayError, SignatureError};
pub use fingerprint::{FINGERPRINT_SIZE, Fingerprint, transcript_hash};
pub use kem::{EphemeralKeyPair, SessionSecret, decapsulate, encapsulate, generate_ephemeral};
pub use replay::{ReceiveWindow, WINDOW_SIZE};
pub use signature::{SigningKeyPair, SigningPublicKey, verify};

/// Algorithms backing the abstract KEM and signature capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlgorithmSuite {
    /// Key encapsulation mechanism.
    pub kem: &'static str,
    /// Signature scheme for long-term identities.
    pub signature: &'static str,
    /// Authenticated encryption for channel frames.
    pub aead: &'static str,
    /// Key derivation function.
    pub kdf: &'static str,
}

/// The fixed algorithm suite of protocol version 1.
pub const SUITE_V1: AlgorithmSuite = AlgorithmSuite {
    kem: "ML-KEM-768",
    signature: "ML-DSA-65",
    aead: "XChaCha20-Poly1305",
    kdf: "HKDF-SHA256",
};

/// Algorithms this build supports.
pub fn supported_algorithms() -> AlgorithmSuite {
    SUITE_V1
}
