use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use pqlan_crypto::Fingerprint;

use super::{StorageError, StoredIdentity, TrustStorage};
use crate::identity::PeerRecord;

/// In-memory trust storage for tests and ephemeral nodes.
///
/// Clones share the same table.
#[derive(Clone, Default)]
pub struct MemoryTrustStorage {
    inner: Arc<Mutex<MemoryInner>>,
}

#[derive(Default)]
struct MemoryInner {
    identity: Option<StoredIdentity>,
    peers: HashMap<Fingerprint, PeerRecord>,
}

impl MemoryTrustStorage {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored peer records.
    pub fn peer_count(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).peers.len()
    }
}

impl TrustStorage for MemoryTrustStorage {
    fn load_identity(&self) -> Result<Option<StoredIdentity>, StorageError> {
        Ok(self.inner.lock().unwrap_or_else(PoisonError::into_inner).identity.clone())
    }

    fn replace_identity(&self, identity: &StoredIdentity) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.identity = Some(identity.clone());
        inner.peers.clear();
        Ok(())
    }

    fn load_peers(&self) -> Result<Vec<PeerRecord>, StorageError> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(inner.peers.values().cloned().collect())
    }

    fn store_peer(&self, peer: &PeerRecord) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.peers.insert(peer.fingerprint, peer.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::TrustState;

    fn record(byte: u8) -> PeerRecord {
        PeerRecord {
            fingerprint: Fingerprint::from_bytes([byte; 32]),
            signing_public_key: vec![byte; 8],
            trust_state: TrustState::Unverified,
        }
    }

    #[test]
    fn replace_identity_clears_peers() {
        let storage = MemoryTrustStorage::new();
        storage.store_peer(&record(1)).unwrap();
        storage.store_peer(&record(2)).unwrap();
        assert_eq!(storage.peer_count(), 2);

        storage
            .replace_identity(&StoredIdentity { public_key: vec![1], secret_key: vec![2] })
            .unwrap();

        assert_eq!(storage.peer_count(), 0);
        assert!(storage.load_identity().unwrap().is_some());
    }

    #[test]
    fn clones_share_table() {
        let a = MemoryTrustStorage::new();
        let b = a.clone();
        a.store_peer(&record(3)).unwrap();
        assert_eq!(b.load_peers().unwrap(), vec![record(3)]);
    }
}
