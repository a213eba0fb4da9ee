//! End-to-end scenarios across identity, handshake, channel and group.
//!
//! Messages are shuttled between in-memory peers through their wire encoding,
//! so every frame crosses the codec exactly as it would on a transport.

use std::sync::Arc;

use bytes::Bytes;
use pqlan_core::{
    ChannelError, EnvRng, Environment, FailureKind, GroupConfig, GroupError, GroupManager,
    Handshake, HandshakeAction, HandshakeConfig, HandshakeState, Identity, IdentityStore,
    MemoryTrustStorage, RejectReason, SeededEnv, Session, SessionTable, TrustPolicy,
};
use pqlan_crypto::Fingerprint;
use pqlan_proto::{InnerMessage, Message};

struct Peer {
    store: IdentityStore<MemoryTrustStorage>,
    identity: Arc<Identity>,
}

impl Peer {
    fn new(env: &SeededEnv) -> Self {
        let store = IdentityStore::open(MemoryTrustStorage::new(), TrustPolicy::Strict).unwrap();
        let identity = store.generate_identity(&mut EnvRng::new(env)).unwrap();
        Self { store, identity }
    }

    fn fingerprint(&self) -> Fingerprint {
        self.identity.fingerprint()
    }

    fn pair_with(&self, other: &Peer) {
        self.store.verify_pairing_payload(&other.store.pairing_payload(None).unwrap()).unwrap();
        other.store.verify_pairing_payload(&self.store.pairing_payload(None).unwrap()).unwrap();
    }
}

/// Encode and decode, as a transport would.
fn wire(message: &Message) -> Message {
    Message::decode(&message.to_vec().unwrap()).unwrap()
}

/// Drive a handshake between `initiator` and `responder` to completion.
fn connect(env: &SeededEnv, initiator: &Peer, responder: &Peer) -> (Session, Session) {
    let now = env.now();
    let mut hs_i = Handshake::initiator(
        Arc::clone(&initiator.identity),
        Some(responder.fingerprint()),
        HandshakeConfig::default(),
        now,
    );
    let mut hs_r =
        Handshake::responder(Arc::clone(&responder.identity), HandshakeConfig::default(), now);

    let mut to_responder: Vec<Message> = Vec::new();
    let mut to_initiator: Vec<Message> = Vec::new();
    let mut session_i = None;
    let mut session_r = None;

    for action in hs_i.start(env).unwrap() {
        if let HandshakeAction::Send(message) = action {
            to_responder.push(wire(&message));
        }
    }

    while !to_responder.is_empty() || !to_initiator.is_empty() {
        for message in std::mem::take(&mut to_responder) {
            for action in hs_r.handle_message(&message, &responder.store, env, now) {
                match action {
                    HandshakeAction::Send(reply) => to_initiator.push(wire(&reply)),
                    HandshakeAction::Established(session) => session_r = Some(session),
                    HandshakeAction::Rejected(reason) => panic!("responder rejected: {reason}"),
                }
            }
        }
        for message in std::mem::take(&mut to_initiator) {
            for action in hs_i.handle_message(&message, &initiator.store, env, now) {
                match action {
                    HandshakeAction::Send(reply) => to_responder.push(wire(&reply)),
                    HandshakeAction::Established(session) => session_i = Some(session),
                    HandshakeAction::Rejected(reason) => panic!("initiator rejected: {reason}"),
                }
            }
        }
    }

    assert_eq!(hs_i.state(), HandshakeState::Established);
    assert_eq!(hs_r.state(), HandshakeState::Established);
    (session_i.unwrap(), session_r.unwrap())
}

fn data_frame(message: &Message) -> pqlan_proto::DataFrame {
    match wire(message) {
        Message::Data(frame) => frame,
        other => panic!("expected DATA, got {other:?}"),
    }
}

#[test]
fn fresh_peers_exchange_hello() {
    let env = SeededEnv::new(100);
    let alice = Peer::new(&env);
    let bob = Peer::new(&env);
    alice.pair_with(&bob);

    let (mut a, mut b) = connect(&env, &alice, &bob);

    let frame = data_frame(&a.seal(b"hello").unwrap());
    assert_eq!(b.open(&frame).unwrap(), InnerMessage::App(Bytes::from_static(b"hello")));
}

#[test]
fn corrupted_ciphertext_is_crypto_failure() {
    let env = SeededEnv::new(101);
    let alice = Peer::new(&env);
    let bob = Peer::new(&env);
    alice.pair_with(&bob);
    let (mut a, mut b) = connect(&env, &alice, &bob);

    let mut bytes = a.seal(b"integrity").unwrap().to_vec().unwrap();
    // [type][version][counter:8][len:4] then ciphertext
    bytes[14] ^= 0x80;
    let Message::Data(frame) = Message::decode(&bytes).unwrap() else { unreachable!() };

    let err = b.open(&frame).unwrap_err();
    assert_eq!(err.kind(), FailureKind::CryptoFailure);
}

#[test]
fn replayed_frame_is_dropped() {
    let env = SeededEnv::new(102);
    let alice = Peer::new(&env);
    let bob = Peer::new(&env);
    alice.pair_with(&bob);
    let (mut a, mut b) = connect(&env, &alice, &bob);

    let frame = data_frame(&a.seal(b"once").unwrap());
    b.open(&frame).unwrap();

    let err = b.open(&frame).unwrap_err();
    assert!(matches!(err, ChannelError::Replay(_)));
    assert_eq!(err.kind(), FailureKind::ReplayDetected);
}

#[test]
fn impostor_offer_never_establishes() {
    let env = SeededEnv::new(103);
    let alice = Peer::new(&env);
    let bob = Peer::new(&env);
    let mallory = Peer::new(&env);
    alice.pair_with(&bob);

    // Mallory signs with her own key but claims Alice's fingerprint and key
    let now = env.now();
    let config = HandshakeConfig::default();
    let mut hs_m = Handshake::initiator(Arc::clone(&mallory.identity), None, config.clone(), now);
    let mut hs_b = Handshake::responder(Arc::clone(&bob.identity), config, now);

    let Some(HandshakeAction::Send(Message::Offer(mut offer))) =
        hs_m.start(&env).unwrap().into_iter().next()
    else {
        panic!("no offer");
    };
    offer.fingerprint = alice.fingerprint();
    offer.signing_public_key = Bytes::copy_from_slice(alice.identity.public_key().as_bytes());

    let actions = hs_b.handle_message(&Message::Offer(offer), &bob.store, &env, now);

    assert!(matches!(actions.as_slice(), [HandshakeAction::Rejected(RejectReason::PeerRejected)]));
    assert_eq!(hs_b.state(), HandshakeState::Failed);
    assert!(!actions.iter().any(|action| matches!(action, HandshakeAction::Established(_))));
}

#[test]
fn revoked_peer_cannot_reconnect() {
    let env = SeededEnv::new(104);
    let alice = Peer::new(&env);
    let bob = Peer::new(&env);
    alice.pair_with(&bob);
    connect(&env, &alice, &bob);

    bob.store.revoke(&alice.fingerprint()).unwrap();

    let now = env.now();
    let mut hs_a =
        Handshake::initiator(Arc::clone(&alice.identity), None, HandshakeConfig::default(), now);
    let mut hs_b = Handshake::responder(Arc::clone(&bob.identity), HandshakeConfig::default(), now);
    let Some(HandshakeAction::Send(offer)) = hs_a.start(&env).unwrap().into_iter().next() else {
        panic!("no offer");
    };

    let actions = hs_b.handle_message(&wire(&offer), &bob.store, &env, now);
    assert!(matches!(actions.as_slice(), [HandshakeAction::Rejected(RejectReason::PeerRejected)]));
    assert_eq!(hs_b.failure().map(|err| err.kind()), Some(FailureKind::TrustPolicyViolation));
}

/// Deliver every queued GROUP_KEY frame to its recipient's session and group
/// manager.
fn deliver_keys(
    env: &SeededEnv,
    admin: Fingerprint,
    table: &mut SessionTable,
    members: &mut [(Fingerprint, Session, GroupManager)],
) {
    for (to, message) in table.take_outbox() {
        let Some((_, session, manager)) = members.iter_mut().find(|(fp, ..)| *fp == to) else {
            continue;
        };
        match session.open(&data_frame(&message)).unwrap() {
            InnerMessage::GroupKey(key) => {
                manager.install_group_key(&admin, key, env.now()).unwrap();
            },
            other => panic!("expected GROUP_KEY, got {other:?}"),
        }
    }
}

#[test]
fn removed_member_cannot_read_new_epoch() {
    let env = SeededEnv::new(105);
    let admin = Peer::new(&env);
    let bob = Peer::new(&env);
    let carol = Peer::new(&env);
    admin.pair_with(&bob);
    admin.pair_with(&carol);

    let (admin_bob, bob_session) = connect(&env, &admin, &bob);
    let (admin_carol, carol_session) = connect(&env, &admin, &carol);

    let mut table = SessionTable::new();
    table.insert(admin_bob);
    table.insert(admin_carol);

    let mut members = vec![
        (
            bob.fingerprint(),
            bob_session,
            GroupManager::new(bob.fingerprint(), GroupConfig::default()),
        ),
        (
            carol.fingerprint(),
            carol_session,
            GroupManager::new(carol.fingerprint(), GroupConfig::default()),
        ),
    ];
    let mut manager: GroupManager = GroupManager::new(admin.fingerprint(), GroupConfig::default());

    let group_id = manager
        .create_group(&[bob.fingerprint(), carol.fingerprint()], &mut table, &env)
        .unwrap()
        .group_id();
    deliver_keys(&env, admin.fingerprint(), &mut table, &mut members);

    // Everyone reads epoch 0
    let Message::GroupData(frame) = manager.encrypt_to_group(&group_id, b"epoch zero").unwrap()
    else {
        unreachable!()
    };
    for (_, _, member) in &mut members {
        assert_eq!(member.decrypt_from_group(&frame).unwrap(), b"epoch zero");
    }

    // Carol is removed
    manager.rotate(&group_id, &[bob.fingerprint()], &mut table, &env, env.now()).unwrap();
    deliver_keys(&env, admin.fingerprint(), &mut table, &mut members);

    let Message::GroupData(frame) = manager.encrypt_to_group(&group_id, b"epoch one").unwrap()
    else {
        unreachable!()
    };

    let (_, _, bob_manager) = &mut members[0];
    assert_eq!(bob_manager.decrypt_from_group(&frame).unwrap(), b"epoch one");

    let (_, _, carol_manager) = &mut members[1];
    assert_eq!(carol_manager.group(&group_id).map(|epoch| epoch.epoch()), Some(0));
    assert!(matches!(
        carol_manager.decrypt_from_group(&frame),
        Err(GroupError::UnknownEpoch { epoch: 1, .. })
    ));

    // Relabelling the frame with Carol's old epoch fails authentication
    let mut forced = frame.clone();
    forced.epoch = 0;
    forced.counter = 1;
    assert_eq!(carol_manager.decrypt_from_group(&forced), Err(GroupError::Authentication));
}

#[test]
fn group_creation_without_session_sends_nothing() {
    let env = SeededEnv::new(106);
    let admin = Peer::new(&env);
    let bob = Peer::new(&env);
    let stranger = Peer::new(&env);
    admin.pair_with(&bob);

    let (admin_bob, _) = connect(&env, &admin, &bob);
    let mut table = SessionTable::new();
    table.insert(admin_bob);

    let mut manager: GroupManager = GroupManager::new(admin.fingerprint(), GroupConfig::default());
    let err = manager
        .create_group(&[bob.fingerprint(), stranger.fingerprint()], &mut table, &env)
        .unwrap_err();

    assert_eq!(err, GroupError::NoSession(stranger.fingerprint()));
    assert!(table.take_outbox().is_empty());
}
