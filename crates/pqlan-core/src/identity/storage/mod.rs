//! Trust table persistence.
//!
//! Synchronous trait so the identity store can write inside its critical
//! section. Implementations share state via `Arc`, so clones see the same
//! table.

mod memory;
mod redb;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

pub use self::{memory::MemoryTrustStorage, redb::RedbTrustStorage};
use super::PeerRecord;

/// Storage backend failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Database could not be opened, read or written
    #[error("I/O error: {0}")]
    Io(String),

    /// Stored value could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// The local identity as persisted.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct StoredIdentity {
    /// Encoded ML-DSA public key
    pub public_key: Vec<u8>,
    /// Encoded ML-DSA secret key
    pub secret_key: Vec<u8>,
}

impl std::fmt::Debug for StoredIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoredIdentity")
            .field("public_key_len", &self.public_key.len())
            .finish_non_exhaustive()
    }
}

/// Durable home of the local identity and the peer trust records.
///
/// Must be Clone, Send + Sync and synchronous. Every method is atomic: on
/// error nothing was written.
pub trait TrustStorage: Clone + Send + Sync + 'static {
    /// Load the local identity. `None` if none was ever stored.
    fn load_identity(&self) -> Result<Option<StoredIdentity>, StorageError>;

    /// Store a new local identity and delete every peer record.
    ///
    /// Both happen in one transaction: trust records never outlive the
    /// identity they were made for.
    fn replace_identity(&self, identity: &StoredIdentity) -> Result<(), StorageError>;

    /// Load every peer record. Order is not guaranteed.
    fn load_peers(&self) -> Result<Vec<PeerRecord>, StorageError>;

    /// Insert or overwrite the record for `peer.fingerprint`.
    fn store_peer(&self, peer: &PeerRecord) -> Result<(), StorageError>;
}
