//! Handshake state machine.
//!
//! Authenticated ML-KEM key exchange between two long-term identities. Uses
//! the action pattern: methods take time as input and return actions for the
//! driver to execute. No I/O happens here.
//!
//! # State Machine
//!
//! ```text
//! Initiator:
//!   Init ──Offer──> SentOffer ──Response──> ReceivedResponse
//!                                                 │ verify, decapsulate, send Ready
//!                                                 ↓
//!                                           Authenticated ──Ready──> Established
//!
//! Responder:
//!   Init ──Offer (verify, encapsulate, send Response)──> Authenticated
//!   Authenticated ──Ready (send Ready)──> Established
//!
//! Any verification failure, unexpected message or timeout ──> Failed
//! ```
//!
//! # Security
//!
//! - The OFFER signature covers `version || I.fp || I.ek`
//! - The RESPONSE signature covers `version || R.fp || ct || H(I.ek) || I.fp`,
//!   so a response cannot be replayed against another offer
//! - The ephemeral decapsulation key lives in an `Option` and is dropped
//!   (wiped) on every exit path: success, failure, timeout or drop of the
//!   handshake itself
//! - The shared secret is consumed by the KDF and never stored

use std::{
    fmt,
    ops::Sub,
    sync::Arc,
    time::{Duration, Instant},
};

use bytes::Bytes;
use pqlan_crypto::{
    EphemeralKeyPair, Fingerprint, SigningPublicKey, decapsulate, derive_session_keys,
    encapsulate, generate_ephemeral, transcript_hash,
};
use pqlan_proto::{DataFrame, Message, Offer, PROTOCOL_VERSION, Response};

use crate::{
    channel::{ChannelConfig, Session},
    env::{EnvRng, Environment},
    error::{HandshakeError, RejectReason},
    identity::{Identity, IdentityStore, TrustStorage},
};

/// Time allowed for a handshake to reach `Established`.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Which side of the handshake we are.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Sends the OFFER
    Initiator,
    /// Answers with the RESPONSE
    Responder,
}

/// Handshake state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandshakeState {
    /// Nothing sent or received yet
    Init,
    /// Offer sent, waiting for Response (initiator)
    SentOffer,
    /// Response received, being verified (initiator)
    ReceivedResponse,
    /// Keys derived, waiting for the peer's READY
    Authenticated,
    /// Both READYs exchanged; the session has been handed out
    Established,
    /// Terminal failure; all key material released
    Failed,
}

impl fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Handshake configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeConfig {
    /// Deadline for reaching `Established`, measured from creation
    pub timeout: Duration,
    /// Configuration for the resulting session
    pub channel: ChannelConfig,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self { timeout: DEFAULT_HANDSHAKE_TIMEOUT, channel: ChannelConfig::default() }
    }
}

/// Actions returned by the handshake state machine.
///
/// The driver executes these:
/// - `Send`: encode and write the message to the peer
/// - `Established`: take ownership of the session; the handshake is done
/// - `Rejected`: close the connection and report the reason
#[derive(Debug)]
pub enum HandshakeAction {
    /// Send this message to the peer
    Send(Message),
    /// Handshake finished; the driver now owns the session
    Established(Session),
    /// Handshake failed; close the connection
    Rejected(RejectReason),
}

/// Handshake state machine for one connection attempt.
///
/// Generic over `Instant` to support both real time and virtual time for
/// deterministic testing.
pub struct Handshake<I = Instant>
where
    I: Copy + Ord + Send + Sync + Sub<Output = Duration>,
{
    role: Role,
    state: HandshakeState,
    config: HandshakeConfig,
    local: Arc<Identity>,
    /// Initiator only: the fingerprint we meant to reach
    expected_peer: Option<Fingerprint>,
    /// Fingerprint of the authenticated peer
    peer: Option<Fingerprint>,
    /// Initiator only; dropped as soon as it has been used or the attempt ends
    ephemeral: Option<EphemeralKeyPair>,
    /// Keys derived, confirmation pending
    session: Option<Session>,
    started_at: I,
    failure: Option<HandshakeError>,
}

impl<I> Handshake<I>
where
    I: Copy + Ord + Send + Sync + Sub<Output = Duration>,
{
    /// Create the initiating side.
    ///
    /// `expected_peer` pins the responder: a RESPONSE signed by anyone else
    /// fails the handshake.
    pub fn initiator(
        local: Arc<Identity>,
        expected_peer: Option<Fingerprint>,
        config: HandshakeConfig,
        now: I,
    ) -> Self {
        Self::new(Role::Initiator, local, expected_peer, config, now)
    }

    /// Create the responding side.
    pub fn responder(local: Arc<Identity>, config: HandshakeConfig, now: I) -> Self {
        Self::new(Role::Responder, local, None, config, now)
    }

    fn new(
        role: Role,
        local: Arc<Identity>,
        expected_peer: Option<Fingerprint>,
        config: HandshakeConfig,
        now: I,
    ) -> Self {
        Self {
            role,
            state: HandshakeState::Init,
            config,
            local,
            expected_peer,
            peer: None,
            ephemeral: None,
            session: None,
            started_at: now,
            failure: None,
        }
    }

    /// Our role.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Current state.
    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Authenticated peer, once its signature has verified.
    pub fn peer(&self) -> Option<Fingerprint> {
        self.peer
    }

    /// Why the handshake failed. `None` unless the state is `Failed`.
    ///
    /// For local logging only; the peer is told a [`RejectReason`].
    pub fn failure(&self) -> Option<&HandshakeError> {
        self.failure.as_ref()
    }

    /// True once `Established` or `Failed`.
    pub fn is_finished(&self) -> bool {
        matches!(self.state, HandshakeState::Established | HandshakeState::Failed)
    }

    /// Time left before the handshake times out.
    pub fn time_remaining(&self, now: I) -> Duration {
        self.config.timeout.saturating_sub(now - self.started_at)
    }

    /// Send the OFFER (initiator only).
    ///
    /// # Errors
    ///
    /// - `HandshakeError::InvalidState` if not an initiator in `Init`
    /// - `HandshakeError::Kem` / `Identity` if key generation or signing fails
    ///
    /// A generation or signing failure also moves the handshake to `Failed`.
    pub fn start<E: Environment>(
        &mut self,
        env: &E,
    ) -> Result<Vec<HandshakeAction>, HandshakeError> {
        if self.role != Role::Initiator || self.state != HandshakeState::Init {
            return Err(HandshakeError::InvalidState { state: self.state, operation: "start" });
        }

        match self.build_offer(env) {
            Ok(offer) => {
                self.transition(HandshakeState::SentOffer);
                Ok(vec![HandshakeAction::Send(Message::Offer(offer))])
            },
            Err(err) => {
                self.fail(err.clone());
                Err(err)
            },
        }
    }

    fn build_offer<E: Environment>(&mut self, env: &E) -> Result<Offer, HandshakeError> {
        let ephemeral = generate_ephemeral(&mut EnvRng::new(env))?;
        let fingerprint = self.local.fingerprint();
        let transcript = Offer::signing_transcript(&fingerprint, ephemeral.public_bytes());
        let signature = self.local.sign(&transcript)?;

        let offer = Offer {
            fingerprint,
            signing_public_key: Bytes::copy_from_slice(self.local.public_key().as_bytes()),
            encapsulation_key: Bytes::copy_from_slice(ephemeral.public_bytes()),
            signature: Bytes::from(signature),
        };
        self.ephemeral = Some(ephemeral);
        Ok(offer)
    }

    /// Process a message from the peer.
    ///
    /// Never returns an error: any failure moves the handshake to `Failed`
    /// and yields a single `Rejected` action. Messages arriving after the
    /// handshake finished are ignored.
    pub fn handle_message<S: TrustStorage, E: Environment>(
        &mut self,
        message: &Message,
        store: &IdentityStore<S>,
        env: &E,
        now: I,
    ) -> Vec<HandshakeAction> {
        if self.is_finished() {
            tracing::debug!("Ignoring {:?} after handshake finished", message.message_type());
            return Vec::new();
        }

        let elapsed = now - self.started_at;
        if elapsed > self.config.timeout {
            return self.fail(HandshakeError::Timeout { elapsed });
        }

        let result = match (self.role, self.state, message) {
            (Role::Responder, HandshakeState::Init, Message::Offer(offer)) => {
                self.handle_offer(offer, store, env)
            },
            (Role::Initiator, HandshakeState::SentOffer, Message::Response(response)) => {
                self.handle_response(response, store)
            },
            (_, HandshakeState::Authenticated, Message::Data(frame)) => self.handle_ready(frame),
            (_, state, message) => Err(HandshakeError::UnexpectedMessage {
                state,
                message: message.message_type(),
            }),
        };

        result.unwrap_or_else(|err| self.fail(err))
    }

    /// Responder: verify the OFFER, encapsulate, answer with a RESPONSE.
    fn handle_offer<S: TrustStorage, E: Environment>(
        &mut self,
        offer: &Offer,
        store: &IdentityStore<S>,
        env: &E,
    ) -> Result<Vec<HandshakeAction>, HandshakeError> {
        let initiator = offer.fingerprint;

        let peer_key = SigningPublicKey::from_bytes(&offer.signing_public_key)
            .map_err(|_| HandshakeError::BadSignature)?;
        let transcript = Offer::signing_transcript(&initiator, &offer.encapsulation_key);
        if !peer_key.verify(&transcript, &offer.signature) {
            return Err(HandshakeError::BadSignature);
        }

        // Trust decision only after the peer proved possession of the key
        store.authorize_peer(initiator, peer_key.as_bytes())?;
        self.peer = Some(initiator);

        let (ciphertext, secret) = encapsulate(&offer.encapsulation_key, &mut EnvRng::new(env))?;

        let local = self.local.fingerprint();
        let offer_hash = transcript_hash(&offer.encapsulation_key);
        let transcript = Response::signing_transcript(&local, &ciphertext, &offer_hash, &initiator);
        let signature = self.local.sign(&transcript)?;

        let keys = derive_session_keys(secret, &initiator, &local, PROTOCOL_VERSION);
        self.session =
            Some(Session::new(initiator, Role::Responder, keys, self.config.channel.clone()));
        self.transition(HandshakeState::Authenticated);

        let response = Response {
            fingerprint: local,
            signing_public_key: Bytes::copy_from_slice(self.local.public_key().as_bytes()),
            ciphertext: Bytes::from(ciphertext),
            signature: Bytes::from(signature),
        };
        Ok(vec![HandshakeAction::Send(Message::Response(response))])
    }

    /// Initiator: verify the RESPONSE, decapsulate, send our READY.
    fn handle_response<S: TrustStorage>(
        &mut self,
        response: &Response,
        store: &IdentityStore<S>,
    ) -> Result<Vec<HandshakeAction>, HandshakeError> {
        self.transition(HandshakeState::ReceivedResponse);

        // Dropped at the end of this function whatever happens
        let ephemeral = self.ephemeral.take().ok_or(HandshakeError::InvalidState {
            state: self.state,
            operation: "handle_response",
        })?;

        let responder = response.fingerprint;
        if let Some(expected) = self.expected_peer.filter(|expected| *expected != responder) {
            return Err(HandshakeError::UnexpectedPeer { expected, actual: responder });
        }

        let local = self.local.fingerprint();
        let peer_key = SigningPublicKey::from_bytes(&response.signing_public_key)
            .map_err(|_| HandshakeError::BadSignature)?;
        let offer_hash = transcript_hash(ephemeral.public_bytes());
        let transcript =
            Response::signing_transcript(&responder, &response.ciphertext, &offer_hash, &local);
        if !peer_key.verify(&transcript, &response.signature) {
            return Err(HandshakeError::BadSignature);
        }

        store.authorize_peer(responder, peer_key.as_bytes())?;
        self.peer = Some(responder);

        let secret = decapsulate(&ephemeral, &response.ciphertext)?;
        drop(ephemeral);

        let keys = derive_session_keys(secret, &local, &responder, PROTOCOL_VERSION);
        let mut session =
            Session::new(responder, Role::Initiator, keys, self.config.channel.clone());
        let ready = session.seal_ready()?;

        self.session = Some(session);
        self.transition(HandshakeState::Authenticated);
        Ok(vec![HandshakeAction::Send(ready)])
    }

    /// Both sides: open the peer's READY. The responder answers with its own.
    fn handle_ready(
        &mut self,
        frame: &DataFrame,
    ) -> Result<Vec<HandshakeAction>, HandshakeError> {
        let mut session = self.session.take().ok_or(HandshakeError::InvalidState {
            state: self.state,
            operation: "handle_ready",
        })?;

        // A wrong key (including ML-KEM implicit rejection) surfaces here
        session.open_ready(frame).map_err(|_| HandshakeError::KeyConfirmation)?;

        let mut actions = Vec::with_capacity(2);
        if self.role == Role::Responder {
            actions.push(HandshakeAction::Send(session.seal_ready()?));
        }

        session.establish();
        self.transition(HandshakeState::Established);
        actions.push(HandshakeAction::Established(session));
        Ok(actions)
    }

    /// Fail the handshake if its deadline has passed.
    pub fn tick(&mut self, now: I) -> Vec<HandshakeAction> {
        if self.is_finished() {
            return Vec::new();
        }

        let elapsed = now - self.started_at;
        if elapsed > self.config.timeout {
            return self.fail(HandshakeError::Timeout { elapsed });
        }

        Vec::new()
    }

    /// Abort the handshake, e.g. because the connection dropped.
    pub fn abort(&mut self) {
        if !self.is_finished() {
            self.ephemeral = None;
            self.session = None;
            self.transition(HandshakeState::Failed);
        }
    }

    fn fail(&mut self, err: HandshakeError) -> Vec<HandshakeAction> {
        match self.peer {
            Some(peer) => tracing::warn!("Handshake with {} failed: {}", peer.short(), err),
            None => tracing::warn!("Handshake failed: {}", err),
        }

        self.ephemeral = None;
        self.session = None;
        self.transition(HandshakeState::Failed);

        let reason = err.kind().reject_reason();
        self.failure = Some(err);
        vec![HandshakeAction::Rejected(reason)]
    }

    fn transition(&mut self, next: HandshakeState) {
        tracing::debug!("Handshake ({:?}) {} -> {}", self.role, self.state, next);
        self.state = next;
    }
}

impl<I> fmt::Debug for Handshake<I>
where
    I: Copy + Ord + Send + Sync + Sub<Output = Duration>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handshake")
            .field("role", &self.role)
            .field("state", &self.state)
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

/// Simultaneous-open tie-break: the lexicographically lower fingerprint
/// initiates.
pub fn should_initiate(local: &Fingerprint, remote: &Fingerprint) -> bool {
    local < remote
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        env::SeededEnv,
        error::{FailureKind, IdentityError},
        identity::{MemoryTrustStorage, TrustPolicy},
    };

    struct Node {
        store: IdentityStore<MemoryTrustStorage>,
        identity: Arc<Identity>,
    }

    fn node(env: &SeededEnv, policy: TrustPolicy) -> Node {
        let store = IdentityStore::open(MemoryTrustStorage::new(), policy).unwrap();
        let identity = store.generate_identity(&mut EnvRng::new(env)).unwrap();
        Node { store, identity }
    }

    fn pair(env: &SeededEnv) -> (Node, Node) {
        let a = node(env, TrustPolicy::Strict);
        let b = node(env, TrustPolicy::Strict);
        a.store.verify_pairing_payload(&b.store.pairing_payload(None).unwrap()).unwrap();
        b.store.verify_pairing_payload(&a.store.pairing_payload(None).unwrap()).unwrap();
        (a, b)
    }

    fn sent(actions: Vec<HandshakeAction>) -> Message {
        match actions.as_slice() {
            [HandshakeAction::Send(message)] => message.clone(),
            other => panic!("expected one Send, got {other:?}"),
        }
    }

    fn rejected(actions: &[HandshakeAction]) -> RejectReason {
        match actions {
            [HandshakeAction::Rejected(reason)] => *reason,
            other => panic!("expected Rejected, got {other:?}"),
        }
    }

    #[test]
    fn full_handshake_establishes_both_sides() {
        let env = SeededEnv::new(1);
        let (a, b) = pair(&env);
        let now = env.now();
        let config = HandshakeConfig::default();

        let mut hs_a = Handshake::initiator(
            Arc::clone(&a.identity),
            Some(b.identity.fingerprint()),
            config.clone(),
            now,
        );
        let mut hs_b = Handshake::responder(Arc::clone(&b.identity), config, now);

        let offer = sent(hs_a.start(&env).unwrap());
        assert_eq!(hs_a.state(), HandshakeState::SentOffer);

        let response = sent(hs_b.handle_message(&offer, &b.store, &env, now));
        assert_eq!(hs_b.state(), HandshakeState::Authenticated);

        let ready_a = sent(hs_a.handle_message(&response, &a.store, &env, now));
        assert_eq!(hs_a.state(), HandshakeState::Authenticated);

        let mut actions = hs_b.handle_message(&ready_a, &b.store, &env, now);
        assert_eq!(hs_b.state(), HandshakeState::Established);
        let Some(HandshakeAction::Established(mut session_b)) = actions.pop() else {
            panic!("responder did not establish");
        };
        let ready_b = sent(actions);

        let mut actions = hs_a.handle_message(&ready_b, &a.store, &env, now);
        assert_eq!(hs_a.state(), HandshakeState::Established);
        let Some(HandshakeAction::Established(mut session_a)) = actions.pop() else {
            panic!("initiator did not establish");
        };

        assert_eq!(session_a.peer(), b.identity.fingerprint());
        assert_eq!(session_b.peer(), a.identity.fingerprint());

        let Message::Data(frame) = session_a.seal(b"hello").unwrap() else { unreachable!() };
        assert_eq!(
            session_b.open(&frame).unwrap(),
            pqlan_proto::InnerMessage::App(Bytes::from_static(b"hello"))
        );
    }

    #[test]
    fn forged_offer_signature_fails() {
        let env = SeededEnv::new(2);
        let (a, b) = pair(&env);
        let now = env.now();

        let mut hs_a = Handshake::initiator(a.identity, None, HandshakeConfig::default(), now);
        let mut hs_b = Handshake::responder(b.identity, HandshakeConfig::default(), now);

        let Message::Offer(mut offer) = sent(hs_a.start(&env).unwrap()) else { unreachable!() };
        let mut signature = offer.signature.to_vec();
        signature[0] ^= 0xFF;
        offer.signature = Bytes::from(signature);

        let actions = hs_b.handle_message(&Message::Offer(offer), &b.store, &env, now);

        assert_eq!(rejected(&actions), RejectReason::PeerRejected);
        assert_eq!(hs_b.state(), HandshakeState::Failed);
        assert_eq!(hs_b.failure(), Some(&HandshakeError::BadSignature));
    }

    #[test]
    fn forged_response_signature_fails() {
        let env = SeededEnv::new(3);
        let (a, b) = pair(&env);
        let now = env.now();

        let mut hs_a = Handshake::initiator(a.identity, None, HandshakeConfig::default(), now);
        let mut hs_b = Handshake::responder(b.identity, HandshakeConfig::default(), now);

        let offer = sent(hs_a.start(&env).unwrap());
        let response = sent(hs_b.handle_message(&offer, &b.store, &env, now));
        let Message::Response(mut response) = response else { unreachable!() };
        let mut signature = response.signature.to_vec();
        signature[10] ^= 0x01;
        response.signature = Bytes::from(signature);

        let actions = hs_a.handle_message(&Message::Response(response), &a.store, &env, now);
        assert_eq!(rejected(&actions), RejectReason::PeerRejected);
        assert_eq!(hs_a.failure().map(HandshakeError::kind), Some(FailureKind::CryptoFailure));
    }

    #[test]
    fn unknown_peer_rejected_under_strict_policy() {
        let env = SeededEnv::new(4);
        let a = node(&env, TrustPolicy::Strict);
        let b = node(&env, TrustPolicy::Strict);
        let now = env.now();

        let mut hs_a =
            Handshake::initiator(a.identity.clone(), None, HandshakeConfig::default(), now);
        let mut hs_b = Handshake::responder(b.identity, HandshakeConfig::default(), now);

        let offer = sent(hs_a.start(&env).unwrap());
        let actions = hs_b.handle_message(&offer, &b.store, &env, now);

        assert_eq!(rejected(&actions), RejectReason::PeerRejected);
        assert_eq!(
            hs_b.failure(),
            Some(&HandshakeError::Identity(IdentityError::UnknownPeer(a.identity.fingerprint())))
        );
    }

    #[test]
    fn trust_on_first_use_records_peer() {
        let env = SeededEnv::new(5);
        let a = node(&env, TrustPolicy::TrustOnFirstUse);
        let b = node(&env, TrustPolicy::TrustOnFirstUse);
        let now = env.now();

        let mut hs_a =
            Handshake::initiator(a.identity.clone(), None, HandshakeConfig::default(), now);
        let mut hs_b = Handshake::responder(b.identity.clone(), HandshakeConfig::default(), now);

        let offer = sent(hs_a.start(&env).unwrap());
        let response = sent(hs_b.handle_message(&offer, &b.store, &env, now));
        sent(hs_a.handle_message(&response, &a.store, &env, now));

        assert!(b.store.peer(&a.identity.fingerprint()).is_some());
        assert!(a.store.peer(&b.identity.fingerprint()).is_some());
        assert!(!a.store.is_trusted(&b.identity.fingerprint()));
    }

    #[test]
    fn pinned_peer_mismatch_fails() {
        let env = SeededEnv::new(6);
        let (a, b) = pair(&env);
        let now = env.now();
        let stranger = Fingerprint::from_bytes([0x55; 32]);

        let mut hs_a =
            Handshake::initiator(a.identity, Some(stranger), HandshakeConfig::default(), now);
        let mut hs_b = Handshake::responder(b.identity.clone(), HandshakeConfig::default(), now);

        let offer = sent(hs_a.start(&env).unwrap());
        let response = sent(hs_b.handle_message(&offer, &b.store, &env, now));
        let actions = hs_a.handle_message(&response, &a.store, &env, now);

        assert_eq!(rejected(&actions), RejectReason::PeerRejected);
        assert_eq!(
            hs_a.failure(),
            Some(&HandshakeError::UnexpectedPeer {
                expected: stranger,
                actual: b.identity.fingerprint()
            })
        );
    }

    #[test]
    fn timeout_fails_handshake() {
        let env = SeededEnv::new(7);
        let (a, _) = pair(&env);
        let start = env.now();

        let mut hs = Handshake::initiator(a.identity, None, HandshakeConfig::default(), start);
        hs.start(&env).unwrap();

        env.advance(Duration::from_secs(5));
        assert!(hs.tick(env.now()).is_empty());
        assert_eq!(hs.time_remaining(env.now()), Duration::from_secs(5));

        env.advance(Duration::from_secs(6));
        let actions = hs.tick(env.now());
        assert_eq!(rejected(&actions), RejectReason::TimedOut);
        assert_eq!(hs.state(), HandshakeState::Failed);
        assert!(hs.failure().is_some_and(HandshakeError::is_transient));
    }

    #[test]
    fn late_response_after_deadline_fails() {
        let env = SeededEnv::new(8);
        let (a, b) = pair(&env);
        let now = env.now();

        let mut hs_a = Handshake::initiator(a.identity, None, HandshakeConfig::default(), now);
        let mut hs_b = Handshake::responder(b.identity, HandshakeConfig::default(), now);

        let offer = sent(hs_a.start(&env).unwrap());
        let response = sent(hs_b.handle_message(&offer, &b.store, &env, now));

        env.advance(Duration::from_secs(11));
        let actions = hs_a.handle_message(&response, &a.store, &env, env.now());
        assert_eq!(rejected(&actions), RejectReason::TimedOut);
    }

    #[test]
    fn unexpected_message_fails() {
        let env = SeededEnv::new(9);
        let (a, b) = pair(&env);
        let now = env.now();

        let mut hs_a = Handshake::initiator(a.identity, None, HandshakeConfig::default(), now);
        let offer = sent(hs_a.start(&env).unwrap());

        // An initiator never accepts an OFFER
        let actions = hs_a.handle_message(&offer, &b.store, &env, now);
        assert_eq!(rejected(&actions), RejectReason::PeerRejected);
        assert!(matches!(hs_a.failure(), Some(HandshakeError::UnexpectedMessage { .. })));
    }

    #[test]
    fn start_twice_is_invalid() {
        let env = SeededEnv::new(10);
        let (a, _) = pair(&env);
        let mut hs = Handshake::initiator(a.identity, None, HandshakeConfig::default(), env.now());
        hs.start(&env).unwrap();
        assert!(matches!(hs.start(&env), Err(HandshakeError::InvalidState { .. })));
    }

    #[test]
    fn tie_break_is_antisymmetric() {
        let low = Fingerprint::from_bytes([1; 32]);
        let high = Fingerprint::from_bytes([2; 32]);
        assert!(should_initiate(&low, &high));
        assert!(!should_initiate(&high, &low));
        assert!(!should_initiate(&low, &low));
    }
}
