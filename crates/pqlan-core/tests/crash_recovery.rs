//! Crash recovery tests for `RedbTrustStorage`.
//!
//! These tests verify that the local identity and the trust table persist
//! across database close/reopen cycles, simulating node restarts.

use pqlan_core::{
    EnvRng, IdentityError, IdentityStore, RedbTrustStorage, SeededEnv, TrustPolicy, TrustState,
    TrustStorage,
};
use tempfile::tempdir;

fn open(path: &std::path::Path) -> IdentityStore<RedbTrustStorage> {
    let storage = RedbTrustStorage::open(path).unwrap();
    IdentityStore::open(storage, TrustPolicy::Strict).unwrap()
}

fn remote_payload(seed: u64) -> (Vec<u8>, pqlan_crypto::Fingerprint) {
    let env = SeededEnv::new(seed);
    let store =
        IdentityStore::open(pqlan_core::MemoryTrustStorage::new(), TrustPolicy::Strict).unwrap();
    let identity = store.generate_identity(&mut EnvRng::new(&env)).unwrap();
    (store.pairing_payload(None).unwrap(), identity.fingerprint())
}

#[test]
fn identity_survives_restart() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("trust.redb");
    let env = SeededEnv::new(1);

    let (fingerprint, signature) = {
        let store = open(&db_path);
        let identity = store.generate_identity(&mut EnvRng::new(&env)).unwrap();
        (identity.fingerprint(), store.sign(b"before restart").unwrap())

        // Database dropped
    };

    {
        let store = open(&db_path);
        let identity = store.identity().unwrap();
        assert_eq!(identity.fingerprint(), fingerprint);

        // The reloaded key still verifies old signatures and signs new ones
        let public_key = identity.public_key().as_bytes().to_vec();
        assert!(store.verify(&public_key, b"before restart", &signature));
        let fresh = store.sign(b"after restart").unwrap();
        assert!(store.verify(&public_key, b"after restart", &fresh));
    }
}

#[test]
fn trust_states_survive_restart() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("trust.redb");
    let env = SeededEnv::new(2);

    let (verified_payload, verified) = remote_payload(10);
    let (revoked_payload, revoked) = remote_payload(11);

    {
        let store = open(&db_path);
        store.generate_identity(&mut EnvRng::new(&env)).unwrap();
        store.verify_pairing_payload(&verified_payload).unwrap();
        store.verify_pairing_payload(&revoked_payload).unwrap();
        store.revoke(&revoked).unwrap();
    }

    {
        let store = open(&db_path);
        assert_eq!(store.peers().len(), 2);
        assert!(store.is_trusted(&verified));
        assert_eq!(store.peer(&revoked).unwrap().trust_state, TrustState::Revoked);

        // Revocation is still terminal after restart
        assert_eq!(
            store.verify_pairing_payload(&revoked_payload),
            Err(IdentityError::Revoked(revoked))
        );
    }
}

#[test]
fn regeneration_wipe_survives_restart() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("trust.redb");
    let env = SeededEnv::new(3);
    let (payload, peer) = remote_payload(20);

    {
        let store = open(&db_path);
        store.generate_identity(&mut EnvRng::new(&env)).unwrap();
        store.verify_pairing_payload(&payload).unwrap();
        store.generate_identity(&mut EnvRng::new(&env)).unwrap();
    }

    {
        let storage = RedbTrustStorage::open(&db_path).unwrap();
        assert!(storage.load_peers().unwrap().is_empty());

        let store = IdentityStore::open(storage, TrustPolicy::Strict).unwrap();
        assert!(store.peer(&peer).is_none());
    }
}

#[test]
fn empty_database_has_no_identity() {
    let dir = tempdir().unwrap();
    let store = open(&dir.path().join("trust.redb"));
    assert_eq!(store.identity().unwrap_err(), IdentityError::NoIdentity);
    assert!(store.peers().is_empty());
}
