//! Identity Store.
//!
//! Owns the local long-term signing keypair and the trust table mapping peer
//! fingerprints to verified public keys. All access goes through
//! [`IdentityStore`], which serializes mutations behind one lock and persists
//! each one before it becomes visible.
//!
//! # Trust States
//!
//! ```text
//!   first contact (TOFU)        pairing / mark_verified
//! ───────────────────> Unverified ──────────────────────> Verified
//!                          │                                 │
//!                          └──────────── revoke ─────────────┴──> Revoked
//!   pairing ─────────────────────────────────────────────> Verified
//! ```
//!
//! A fingerprint's key never changes and `Revoked` is terminal. Regenerating
//! the local identity wipes every record.

mod storage;

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use pqlan_crypto::{Fingerprint, SigningKeyPair, SigningPublicKey};
use pqlan_proto::{PAIRING_PAYLOAD_VERSION, PairingPayload};
use rand_chacha::rand_core::CryptoRngCore;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

pub use self::storage::{
    MemoryTrustStorage, RedbTrustStorage, StorageError, StoredIdentity, TrustStorage,
};
use crate::error::IdentityError;

/// Trust level of a remote peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrustState {
    /// Seen on first contact, key not confirmed out-of-band
    Unverified,
    /// Key confirmed out-of-band
    Verified,
    /// Explicitly distrusted; rejected by every handshake
    Revoked,
}

/// What the trust table knows about one peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    /// SHA-256 of `signing_public_key`
    pub fingerprint: Fingerprint,
    /// Encoded ML-DSA public key bound to this fingerprint
    pub signing_public_key: Vec<u8>,
    /// Current trust level
    pub trust_state: TrustState,
}

/// How handshakes treat peers that are not verified.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TrustPolicy {
    /// Only verified peers may complete a handshake
    #[default]
    Strict,
    /// Unknown peers are recorded as unverified and allowed
    TrustOnFirstUse,
}

/// The local long-term identity.
///
/// Immutable once generated; shared by reference count so handshakes can sign
/// without holding the store lock.
#[derive(Debug)]
pub struct Identity {
    keypair: SigningKeyPair,
}

impl Identity {
    /// Fingerprint of the signing public key.
    pub fn fingerprint(&self) -> Fingerprint {
        self.keypair.fingerprint()
    }

    /// Signing public key.
    pub fn public_key(&self) -> &SigningPublicKey {
        self.keypair.public_key()
    }

    /// Sign `message` with the long-term key.
    ///
    /// # Errors
    ///
    /// - `IdentityError::Signature` if the signer's randomness fails
    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>, IdentityError> {
        Ok(self.keypair.sign(message)?)
    }

    fn to_stored(&self) -> StoredIdentity {
        let secret: Zeroizing<Vec<u8>> = self.keypair.secret_bytes();
        StoredIdentity {
            public_key: self.keypair.public_key().as_bytes().to_vec(),
            secret_key: secret.to_vec(),
        }
    }

    fn from_stored(stored: &StoredIdentity) -> Result<Self, IdentityError> {
        let keypair = SigningKeyPair::from_bytes(&stored.public_key, &stored.secret_key)?;
        Ok(Self { keypair })
    }
}

/// Shared identity and trust table.
///
/// Cheap to share behind an `Arc`. Every mutation takes the internal lock,
/// writes through to storage, and only then updates the in-memory view, so
/// two handshakes can never race on one fingerprint.
pub struct IdentityStore<S: TrustStorage> {
    storage: S,
    policy: TrustPolicy,
    inner: Mutex<StoreInner>,
}

struct StoreInner {
    identity: Option<Arc<Identity>>,
    peers: BTreeMap<Fingerprint, PeerRecord>,
}

impl<S: TrustStorage> IdentityStore<S> {
    /// Load the identity and trust table from `storage`.
    ///
    /// # Errors
    ///
    /// - `IdentityError::Storage` if the backend cannot be read
    /// - `IdentityError::Signature` if the persisted key is corrupt
    pub fn open(storage: S, policy: TrustPolicy) -> Result<Self, IdentityError> {
        let identity = match storage.load_identity()? {
            Some(stored) => Some(Arc::new(Identity::from_stored(&stored)?)),
            None => None,
        };
        let peers =
            storage.load_peers()?.into_iter().map(|peer| (peer.fingerprint, peer)).collect();

        Ok(Self { storage, policy, inner: Mutex::new(StoreInner { identity, peers }) })
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        // Storage is written before memory, so a poisoned view is still
        // consistent with disk.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Trust policy applied to handshakes.
    pub fn policy(&self) -> TrustPolicy {
        self.policy
    }

    /// Generate a new local identity, replacing any existing one.
    ///
    /// Regeneration invalidates every trust record: peers paired with the old
    /// key have nothing to do with the new one.
    ///
    /// # Errors
    ///
    /// - `IdentityError::Signature` on entropy failure (fatal)
    /// - `IdentityError::Storage` if the new identity cannot be persisted
    pub fn generate_identity(
        &self,
        rng: &mut impl CryptoRngCore,
    ) -> Result<Arc<Identity>, IdentityError> {
        let identity = Arc::new(Identity { keypair: SigningKeyPair::generate(rng)? });

        let mut inner = self.lock();
        let regenerated = inner.identity.is_some();
        self.storage.replace_identity(&identity.to_stored())?;
        inner.identity = Some(Arc::clone(&identity));
        inner.peers.clear();

        if regenerated {
            tracing::warn!("Identity regenerated; trust table cleared");
        }
        tracing::info!("Local identity {}", identity.fingerprint());
        Ok(identity)
    }

    /// Return the existing identity or generate one.
    ///
    /// # Errors
    ///
    /// Same as [`Self::generate_identity`].
    pub fn load_or_generate(
        &self,
        rng: &mut impl CryptoRngCore,
    ) -> Result<Arc<Identity>, IdentityError> {
        if let Some(identity) = self.lock().identity.clone() {
            return Ok(identity);
        }
        self.generate_identity(rng)
    }

    /// The local identity.
    ///
    /// # Errors
    ///
    /// - `IdentityError::NoIdentity` before one is generated
    pub fn identity(&self) -> Result<Arc<Identity>, IdentityError> {
        self.lock().identity.clone().ok_or(IdentityError::NoIdentity)
    }

    /// Sign `message` with the local identity.
    ///
    /// # Errors
    ///
    /// - `IdentityError::NoIdentity` before one is generated
    /// - `IdentityError::Signature` if signing fails
    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>, IdentityError> {
        self.identity()?.sign(message)
    }

    /// Verify a signature made by `peer_public_key`.
    ///
    /// Never errors; `false` is a hard authentication failure.
    pub fn verify(&self, peer_public_key: &[u8], message: &[u8], signature: &[u8]) -> bool {
        pqlan_crypto::verify(peer_public_key, message, signature)
    }

    /// Record a peer seen on first contact as unverified.
    ///
    /// Idempotent for the same key. Returns the stored record, which may be
    /// verified or revoked if the peer was already known.
    ///
    /// # Errors
    ///
    /// - `IdentityError::FingerprintMismatch` if the key does not hash to
    ///   `fingerprint`
    /// - `IdentityError::KeyMismatch` if the fingerprint is bound to another key
    /// - `IdentityError::Storage` if the record cannot be persisted
    pub fn record_peer(
        &self,
        fingerprint: Fingerprint,
        public_key: &[u8],
    ) -> Result<PeerRecord, IdentityError> {
        check_binding(&fingerprint, public_key)?;

        let mut inner = self.lock();
        self.record_locked(&mut inner, fingerprint, public_key, TrustState::Unverified)
    }

    /// Promote a known peer to verified after out-of-band confirmation.
    ///
    /// # Errors
    ///
    /// - `IdentityError::UnknownPeer` if the peer was never recorded
    /// - `IdentityError::Revoked` if the peer was revoked
    /// - `IdentityError::Storage` if the record cannot be persisted
    pub fn mark_verified(&self, fingerprint: &Fingerprint) -> Result<PeerRecord, IdentityError> {
        let mut inner = self.lock();
        let record =
            inner.peers.get(fingerprint).cloned().ok_or(IdentityError::UnknownPeer(*fingerprint))?;

        match record.trust_state {
            TrustState::Verified => Ok(record),
            TrustState::Revoked => Err(IdentityError::Revoked(*fingerprint)),
            TrustState::Unverified => {
                let updated = PeerRecord { trust_state: TrustState::Verified, ..record };
                self.store_locked(&mut inner, updated)
            },
        }
    }

    /// Revoke a peer. Every later handshake with it is rejected.
    ///
    /// # Errors
    ///
    /// - `IdentityError::UnknownPeer` if the peer was never recorded
    /// - `IdentityError::Storage` if the record cannot be persisted
    pub fn revoke(&self, fingerprint: &Fingerprint) -> Result<PeerRecord, IdentityError> {
        let mut inner = self.lock();
        let record =
            inner.peers.get(fingerprint).cloned().ok_or(IdentityError::UnknownPeer(*fingerprint))?;

        if record.trust_state == TrustState::Revoked {
            return Ok(record);
        }

        tracing::warn!("Revoking peer {}", fingerprint.short());
        let updated = PeerRecord { trust_state: TrustState::Revoked, ..record };
        self.store_locked(&mut inner, updated)
    }

    /// Is `fingerprint` verified (and not revoked)?
    pub fn is_trusted(&self, fingerprint: &Fingerprint) -> bool {
        self.lock()
            .peers
            .get(fingerprint)
            .is_some_and(|peer| peer.trust_state == TrustState::Verified)
    }

    /// Record for one peer.
    pub fn peer(&self, fingerprint: &Fingerprint) -> Option<PeerRecord> {
        self.lock().peers.get(fingerprint).cloned()
    }

    /// All peer records, ordered by fingerprint.
    pub fn peers(&self) -> Vec<PeerRecord> {
        self.lock().peers.values().cloned().collect()
    }

    /// CBOR pairing payload for the local identity, for the QR collaborator.
    ///
    /// # Errors
    ///
    /// - `IdentityError::NoIdentity` before one is generated
    /// - `IdentityError::Protocol` if encoding fails
    pub fn pairing_payload(&self, endpoint: Option<String>) -> Result<Vec<u8>, IdentityError> {
        let identity = self.identity()?;
        let payload = PairingPayload {
            version: PAIRING_PAYLOAD_VERSION,
            fingerprint: identity.fingerprint(),
            signing_public_key: identity.public_key().as_bytes().to_vec(),
            endpoint,
        };
        Ok(payload.encode()?)
    }

    /// Accept a scanned pairing payload: the peer becomes verified.
    ///
    /// # Errors
    ///
    /// - `IdentityError::Protocol` if the payload cannot be decoded
    /// - `IdentityError::UnsupportedPairingVersion` for an unknown version
    /// - `IdentityError::FingerprintMismatch` if the fingerprint is not the
    ///   hash of the key
    /// - `IdentityError::SelfPeer` for our own payload
    /// - `IdentityError::KeyMismatch` if the fingerprint is bound to another key
    /// - `IdentityError::Revoked` if the peer was revoked
    pub fn verify_pairing_payload(&self, payload: &[u8]) -> Result<PeerRecord, IdentityError> {
        let payload = PairingPayload::decode(payload)?;
        if payload.version != PAIRING_PAYLOAD_VERSION {
            return Err(IdentityError::UnsupportedPairingVersion(payload.version));
        }
        check_binding(&payload.fingerprint, &payload.signing_public_key)?;

        let mut inner = self.lock();
        if inner.identity.as_ref().is_some_and(|id| id.fingerprint() == payload.fingerprint) {
            return Err(IdentityError::SelfPeer);
        }

        let record = self.record_locked(
            &mut inner,
            payload.fingerprint,
            &payload.signing_public_key,
            TrustState::Verified,
        )?;

        match record.trust_state {
            TrustState::Verified => {
                tracing::info!("Paired with peer {}", record.fingerprint.short());
                Ok(record)
            },
            TrustState::Revoked => Err(IdentityError::Revoked(record.fingerprint)),
            TrustState::Unverified => {
                let updated = PeerRecord { trust_state: TrustState::Verified, ..record };
                let stored = self.store_locked(&mut inner, updated)?;
                tracing::info!("Peer {} verified by pairing", stored.fingerprint.short());
                Ok(stored)
            },
        }
    }

    /// Trust decision for a peer presenting `public_key` in a handshake.
    ///
    /// Checked and (under `TrustOnFirstUse`) recorded in one critical section.
    ///
    /// # Errors
    ///
    /// - `IdentityError::FingerprintMismatch`, `KeyMismatch`, `Revoked`,
    ///   `SelfPeer`
    /// - `IdentityError::UnknownPeer` / `Unverified` under `Strict`
    /// - `IdentityError::Storage` if a first-contact record cannot be persisted
    pub fn authorize_peer(
        &self,
        fingerprint: Fingerprint,
        public_key: &[u8],
    ) -> Result<PeerRecord, IdentityError> {
        check_binding(&fingerprint, public_key)?;

        let mut inner = self.lock();
        if inner.identity.as_ref().is_some_and(|id| id.fingerprint() == fingerprint) {
            return Err(IdentityError::SelfPeer);
        }

        let existing = inner.peers.get(&fingerprint).cloned();
        match (existing, self.policy) {
            (Some(record), _) if record.signing_public_key != public_key => {
                Err(IdentityError::KeyMismatch(fingerprint))
            },
            (Some(record), policy) => match (record.trust_state, policy) {
                (TrustState::Verified, _)
                | (TrustState::Unverified, TrustPolicy::TrustOnFirstUse) => Ok(record),
                (TrustState::Revoked, _) => Err(IdentityError::Revoked(fingerprint)),
                (TrustState::Unverified, TrustPolicy::Strict) => {
                    Err(IdentityError::Unverified(fingerprint))
                },
            },
            (None, TrustPolicy::Strict) => Err(IdentityError::UnknownPeer(fingerprint)),
            (None, TrustPolicy::TrustOnFirstUse) => {
                tracing::info!(
                    "First contact with {}, recording as unverified",
                    fingerprint.short()
                );
                self.record_locked(&mut inner, fingerprint, public_key, TrustState::Unverified)
            },
        }
    }

    /// Insert a record if absent; returns whatever is stored afterwards.
    fn record_locked(
        &self,
        inner: &mut StoreInner,
        fingerprint: Fingerprint,
        public_key: &[u8],
        initial: TrustState,
    ) -> Result<PeerRecord, IdentityError> {
        if let Some(existing) = inner.peers.get(&fingerprint) {
            if existing.signing_public_key != public_key {
                return Err(IdentityError::KeyMismatch(fingerprint));
            }
            return Ok(existing.clone());
        }

        let record = PeerRecord {
            fingerprint,
            signing_public_key: public_key.to_vec(),
            trust_state: initial,
        };
        self.store_locked(inner, record)
    }

    fn store_locked(
        &self,
        inner: &mut StoreInner,
        record: PeerRecord,
    ) -> Result<PeerRecord, IdentityError> {
        self.storage.store_peer(&record)?;
        inner.peers.insert(record.fingerprint, record.clone());
        Ok(record)
    }
}

/// The presented key must hash to the presented fingerprint.
fn check_binding(fingerprint: &Fingerprint, public_key: &[u8]) -> Result<(), IdentityError> {
    if Fingerprint::of(public_key) != *fingerprint {
        return Err(IdentityError::FingerprintMismatch);
    }
    Ok(())
}
