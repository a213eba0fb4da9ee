//! Redb-backed durable trust storage.
//!
//! Uses Redb's ACID transactions with Copy-on-Write for crash safety. The
//! local identity and all peer records survive restarts.

use std::{path::Path, sync::Arc};

use redb::{Database, ReadableTable, TableDefinition};
use zeroize::Zeroizing;

use super::{StorageError, StoredIdentity, TrustStorage};
use crate::identity::PeerRecord;

/// Table: identity
/// Key: fixed string [`IDENTITY_KEY`]
/// Value: CBOR-encoded StoredIdentity
const IDENTITY: TableDefinition<&str, &[u8]> = TableDefinition::new("identity");

/// Table: peers
/// Key: fingerprint [32 bytes]
/// Value: CBOR-encoded PeerRecord
const PEERS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("peers");

/// The single row of the identity table.
const IDENTITY_KEY: &str = "local";

/// Durable trust storage backed by Redb.
///
/// Thread-safe through Redb's internal locking. Clone is cheap (Arc).
#[derive(Clone)]
pub struct RedbTrustStorage {
    db: Arc<Database>,
}

impl RedbTrustStorage {
    /// Open or create a Redb database at the given path.
    ///
    /// Creates the IDENTITY and PEERS tables if they don't exist.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Io` if the database cannot be opened or created.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = Database::create(path.as_ref()).map_err(|e| StorageError::Io(e.to_string()))?;

        let txn = db.begin_write().map_err(|e| StorageError::Io(e.to_string()))?;
        {
            let _ = txn.open_table(IDENTITY).map_err(|e| StorageError::Io(e.to_string()))?;
            let _ = txn.open_table(PEERS).map_err(|e| StorageError::Io(e.to_string()))?;
        }
        txn.commit().map_err(|e| StorageError::Io(e.to_string()))?;

        Ok(Self { db: Arc::new(db) })
    }
}

impl TrustStorage for RedbTrustStorage {
    fn load_identity(&self) -> Result<Option<StoredIdentity>, StorageError> {
        let txn = self.db.begin_read().map_err(|e| StorageError::Io(e.to_string()))?;
        let table = txn.open_table(IDENTITY).map_err(|e| StorageError::Io(e.to_string()))?;

        let Some(value) = table.get(IDENTITY_KEY).map_err(|e| StorageError::Io(e.to_string()))?
        else {
            return Ok(None);
        };

        let identity = ciborium::from_reader(value.value())
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        Ok(Some(identity))
    }

    fn replace_identity(&self, identity: &StoredIdentity) -> Result<(), StorageError> {
        let mut bytes = Zeroizing::new(Vec::new());
        ciborium::into_writer(identity, &mut *bytes)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;

        let txn = self.db.begin_write().map_err(|e| StorageError::Io(e.to_string()))?;
        {
            let mut table =
                txn.open_table(IDENTITY).map_err(|e| StorageError::Io(e.to_string()))?;
            table
                .insert(IDENTITY_KEY, bytes.as_slice())
                .map_err(|e| StorageError::Io(e.to_string()))?;
        }
        {
            let mut table = txn.open_table(PEERS).map_err(|e| StorageError::Io(e.to_string()))?;

            let mut keys = Vec::new();
            for entry in table.iter().map_err(|e| StorageError::Io(e.to_string()))? {
                let (key, _) = entry.map_err(|e| StorageError::Io(e.to_string()))?;
                keys.push(key.value().to_vec());
            }
            for key in keys {
                table.remove(key.as_slice()).map_err(|e| StorageError::Io(e.to_string()))?;
            }
        }
        txn.commit().map_err(|e| StorageError::Io(e.to_string()))?;

        Ok(())
    }

    fn load_peers(&self) -> Result<Vec<PeerRecord>, StorageError> {
        let txn = self.db.begin_read().map_err(|e| StorageError::Io(e.to_string()))?;
        let table = txn.open_table(PEERS).map_err(|e| StorageError::Io(e.to_string()))?;

        let mut peers = Vec::new();
        for entry in table.iter().map_err(|e| StorageError::Io(e.to_string()))? {
            let (_, value) = entry.map_err(|e| StorageError::Io(e.to_string()))?;
            let peer = ciborium::from_reader(value.value())
                .map_err(|e| StorageError::Serialization(e.to_string()))?;
            peers.push(peer);
        }

        Ok(peers)
    }

    fn store_peer(&self, peer: &PeerRecord) -> Result<(), StorageError> {
        let mut bytes = Vec::new();
        ciborium::into_writer(peer, &mut bytes)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;

        let txn = self.db.begin_write().map_err(|e| StorageError::Io(e.to_string()))?;
        {
            let mut table = txn.open_table(PEERS).map_err(|e| StorageError::Io(e.to_string()))?;
            table
                .insert(peer.fingerprint.as_bytes().as_slice(), bytes.as_slice())
                .map_err(|e| StorageError::Io(e.to_string()))?;
        }
        txn.commit().map_err(|e| StorageError::Io(e.to_string()))?;

        Ok(())
    }
}
