//! Secure channel over an established session.
//!
//! A [`Session`] holds the two directional keys derived by the handshake, the
//! send counter and the receive window. It is owned by exactly one connection
//! task and never shared.
//!
//! # Frame Processing
//!
//! ```text
//! seal:  counter = send_counter++ → AEAD(key_out, nonce(counter), aad(counter)) → DATA
//! open:  window.check(counter) → AEAD open → window.accept(counter) → decode
//! ```
//!
//! The window only moves after the tag verifies, so forged frames can never
//! advance it.

use std::collections::HashMap;

use bytes::Bytes;
use pqlan_crypto::{ChannelNamespace, Fingerprint, ReceiveWindow, SessionKeys, SymmetricKey, aead};
use pqlan_proto::{DataFrame, InnerMessage, Message, ProtocolError};
use zeroize::Zeroizing;

use crate::{error::ChannelError, handshake::Role};

/// Pairwise traffic always uses epoch 0 in the nonce; the keys are unique per
/// session.
const PAIRWISE_EPOCH: u32 = 0;

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Keys derived, key confirmation (READY) still in flight
    Handshaking,
    /// Both sides confirmed; application traffic allowed
    Established,
    /// Keys wiped; every operation fails
    Closed,
}

/// Channel configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelConfig {
    /// Number of frames that may be sealed before the session must be torn
    /// down. Counters `0..max_frames` are used.
    pub max_frames: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self { max_frames: u64::MAX }
    }
}

/// One end of an authenticated pairwise channel.
#[derive(Debug)]
pub struct Session {
    peer: Fingerprint,
    role: Role,
    state: SessionState,
    config: ChannelConfig,
    /// `None` once closed
    send_key: Option<SymmetricKey>,
    /// `None` once closed
    recv_key: Option<SymmetricKey>,
    send_counter: u64,
    window: ReceiveWindow,
}

impl Session {
    /// Build a session from freshly derived keys. Starts in
    /// [`SessionState::Handshaking`].
    pub(crate) fn new(
        peer: Fingerprint,
        role: Role,
        keys: SessionKeys,
        config: ChannelConfig,
    ) -> Self {
        let SessionKeys { initiator_to_responder, responder_to_initiator } = keys;
        let (send_key, recv_key) = match role {
            Role::Initiator => (initiator_to_responder, responder_to_initiator),
            Role::Responder => (responder_to_initiator, initiator_to_responder),
        };

        Self {
            peer,
            role,
            state: SessionState::Handshaking,
            config,
            send_key: Some(send_key),
            recv_key: Some(recv_key),
            send_counter: 0,
            window: ReceiveWindow::new(),
        }
    }

    /// Remote peer fingerprint.
    pub fn peer(&self) -> Fingerprint {
        self.peer
    }

    /// Our role in the handshake that produced this session.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// True once both sides have confirmed the keys.
    pub fn is_established(&self) -> bool {
        self.state == SessionState::Established
    }

    /// Counter the next sealed frame will carry.
    pub fn send_counter(&self) -> u64 {
        self.send_counter
    }

    /// Highest counter accepted from the peer.
    pub fn highest_received(&self) -> Option<u64> {
        self.window.highest()
    }

    pub(crate) fn establish(&mut self) {
        if self.state == SessionState::Handshaking {
            tracing::debug!("Session with {} established", self.peer.short());
            self.state = SessionState::Established;
        }
    }

    /// Seal an application payload.
    ///
    /// # Errors
    ///
    /// - `ChannelError::NotEstablished` before key confirmation completes
    /// - `ChannelError::Closed` after [`Self::close`]
    /// - `ChannelError::CounterExhausted` once every counter is used; the
    ///   session must be torn down
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Message, ChannelError> {
        self.seal_message(&InnerMessage::App(Bytes::copy_from_slice(plaintext)))
    }

    /// Seal any inner message (application data, group keys, goodbye).
    ///
    /// # Errors
    ///
    /// Same as [`Self::seal`], plus `ChannelError::Protocol` if the message
    /// cannot be encoded.
    pub fn seal_message(&mut self, message: &InnerMessage) -> Result<Message, ChannelError> {
        match self.state {
            SessionState::Established => self.seal_inner(message),
            SessionState::Handshaking => Err(ChannelError::NotEstablished),
            SessionState::Closed => Err(ChannelError::Closed),
        }
    }

    /// Seal the key confirmation frame.
    pub(crate) fn seal_ready(&mut self) -> Result<Message, ChannelError> {
        match self.state {
            SessionState::Handshaking | SessionState::Established => {
                self.seal_inner(&InnerMessage::Ready)
            },
            SessionState::Closed => Err(ChannelError::Closed),
        }
    }

    fn seal_inner(&mut self, message: &InnerMessage) -> Result<Message, ChannelError> {
        let key = self.send_key.as_ref().ok_or(ChannelError::Closed)?;

        let counter = self.send_counter;
        if counter >= self.config.max_frames {
            tracing::warn!("Send counter exhausted for session with {}", self.peer.short());
            return Err(ChannelError::CounterExhausted);
        }

        // May carry a raw group key
        let plaintext = Zeroizing::new(message.to_vec()?);
        let sealed = aead::seal(
            key,
            ChannelNamespace::Pairwise,
            PAIRWISE_EPOCH,
            counter,
            &DataFrame::aad(counter),
            &plaintext,
        );
        self.send_counter = counter + 1;

        Ok(Message::Data(DataFrame {
            counter,
            ciphertext: Bytes::from(sealed.ciphertext),
            tag: sealed.tag,
        }))
    }

    /// Authenticate and decrypt a DATA frame.
    ///
    /// Rejected frames leave the session untouched; the caller drops them.
    ///
    /// # Errors
    ///
    /// - `ChannelError::NotEstablished` before key confirmation completes
    /// - `ChannelError::Closed` after [`Self::close`]
    /// - `ChannelError::Authentication` if the tag does not verify
    /// - `ChannelError::Replay` if the counter was seen or is below the window
    /// - `ChannelError::Protocol` if the authenticated plaintext is malformed
    pub fn open(&mut self, frame: &DataFrame) -> Result<InnerMessage, ChannelError> {
        match self.state {
            SessionState::Established => {},
            SessionState::Handshaking => return Err(ChannelError::NotEstablished),
            SessionState::Closed => return Err(ChannelError::Closed),
        }

        self.open_inner(frame).inspect_err(|err| {
            tracing::warn!(
                "Dropping frame {} from {}: {}",
                frame.counter,
                self.peer.short(),
                err
            );
        })
    }

    /// Open the peer's key confirmation frame.
    pub(crate) fn open_ready(&mut self, frame: &DataFrame) -> Result<(), ChannelError> {
        if self.state == SessionState::Closed {
            return Err(ChannelError::Closed);
        }

        match self.open_inner(frame)? {
            InnerMessage::Ready => Ok(()),
            other => Err(ChannelError::Protocol(ProtocolError::UnexpectedType {
                expected: "READY",
                found: other.message_type().to_u8(),
            })),
        }
    }

    fn open_inner(&mut self, frame: &DataFrame) -> Result<InnerMessage, ChannelError> {
        let key = self.recv_key.as_ref().ok_or(ChannelError::Closed)?;

        self.window.check(frame.counter)?;

        let plaintext = aead::open(
            key,
            ChannelNamespace::Pairwise,
            PAIRWISE_EPOCH,
            frame.counter,
            &DataFrame::aad(frame.counter),
            &frame.ciphertext,
            &frame.tag,
        )
        .map(Zeroizing::new)
        .map_err(|_| ChannelError::Authentication)?;

        self.window.accept(frame.counter)?;

        Ok(InnerMessage::decode(&plaintext)?)
    }

    /// Seal a GOODBYE and close the session.
    ///
    /// # Errors
    ///
    /// Same as [`Self::seal_message`]. The session is closed either way.
    pub fn goodbye(&mut self, reason: impl Into<String>) -> Result<Message, ChannelError> {
        let result = self.seal_message(&InnerMessage::Goodbye { reason: reason.into() });
        self.close();
        result
    }

    /// Wipe both keys. Every later operation fails with
    /// [`ChannelError::Closed`].
    pub fn close(&mut self) {
        if self.state != SessionState::Closed {
            tracing::debug!("Session with {} closed", self.peer.short());
        }
        // SymmetricKey zeroizes on drop
        self.send_key = None;
        self.recv_key = None;
        self.state = SessionState::Closed;
    }
}

/// Established sessions keyed by peer, plus frames waiting to be sent.
///
/// Used when one owner drives several sessions directly (tests, single-task
/// embedders). Implements the group key courier by sealing into the owned
/// session and queueing the resulting frame.
#[derive(Debug, Default)]
pub struct SessionTable {
    sessions: HashMap<Fingerprint, Session>,
    outbox: Vec<(Fingerprint, Message)>,
}

impl SessionTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a session, closing any previous one with the same peer.
    pub fn insert(&mut self, session: Session) {
        if let Some(mut previous) = self.sessions.insert(session.peer(), session) {
            previous.close();
        }
    }

    /// Session with `peer`.
    pub fn get(&self, peer: &Fingerprint) -> Option<&Session> {
        self.sessions.get(peer)
    }

    /// Mutable session with `peer`.
    pub fn get_mut(&mut self, peer: &Fingerprint) -> Option<&mut Session> {
        self.sessions.get_mut(peer)
    }

    /// Remove and close the session with `peer`.
    pub fn remove(&mut self, peer: &Fingerprint) -> bool {
        self.sessions.remove(peer).map(|mut session| session.close()).is_some()
    }

    /// Number of sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// True if there are no sessions.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub(crate) fn enqueue(&mut self, peer: Fingerprint, message: Message) {
        self.outbox.push((peer, message));
    }

    /// Take every queued frame.
    pub fn take_outbox(&mut self) -> Vec<(Fingerprint, Message)> {
        std::mem::take(&mut self.outbox)
    }
}

#[cfg(test)]
mod tests {
    use pqlan_crypto::{ReplayError, SymmetricKey};

    use super::*;

    fn keys() -> SessionKeys {
        SessionKeys {
            initiator_to_responder: SymmetricKey::from_bytes([1; 32]),
            responder_to_initiator: SymmetricKey::from_bytes([2; 32]),
        }
    }

    fn pair(config: ChannelConfig) -> (Session, Session) {
        let a = Fingerprint::from_bytes([0xA; 32]);
        let b = Fingerprint::from_bytes([0xB; 32]);
        let mut initiator = Session::new(b, Role::Initiator, keys(), config.clone());
        let mut responder = Session::new(a, Role::Responder, keys(), config);
        initiator.establish();
        responder.establish();
        (initiator, responder)
    }

    fn data(message: Message) -> DataFrame {
        match message {
            Message::Data(frame) => frame,
            other => panic!("expected DATA, got {other:?}"),
        }
    }

    #[test]
    fn seal_open_both_directions() {
        let (mut a, mut b) = pair(ChannelConfig::default());

        let frame = data(a.seal(b"ping").unwrap());
        assert_eq!(b.open(&frame).unwrap(), InnerMessage::App(Bytes::from_static(b"ping")));

        let frame = data(b.seal(b"pong").unwrap());
        assert_eq!(a.open(&frame).unwrap(), InnerMessage::App(Bytes::from_static(b"pong")));
    }

    #[test]
    fn same_plaintext_different_frames() {
        let (mut a, _) = pair(ChannelConfig::default());
        let first = data(a.seal(b"same").unwrap());
        let second = data(a.seal(b"same").unwrap());

        assert_ne!(first.counter, second.counter);
        assert_ne!(first.ciphertext, second.ciphertext);
    }

    #[test]
    fn replayed_frame_rejected() {
        let (mut a, mut b) = pair(ChannelConfig::default());
        let frame = data(a.seal(b"once").unwrap());

        b.open(&frame).unwrap();
        assert_eq!(
            b.open(&frame),
            Err(ChannelError::Replay(ReplayError::Duplicate { counter: 0 }))
        );
    }

    #[test]
    fn tampered_frame_does_not_move_window() {
        let (mut a, mut b) = pair(ChannelConfig::default());
        let frame = data(a.seal(b"payload").unwrap());

        let mut forged = frame.clone();
        let mut bytes = forged.ciphertext.to_vec();
        bytes[0] ^= 0x01;
        forged.ciphertext = Bytes::from(bytes);

        let err = b.open(&forged).unwrap_err();
        assert_eq!(err, ChannelError::Authentication);
        assert_eq!(err.kind(), crate::FailureKind::CryptoFailure);
        assert_eq!(b.highest_received(), None);

        // The genuine frame still opens
        assert!(b.open(&frame).is_ok());
    }

    #[test]
    fn own_frames_do_not_open_locally() {
        let (mut a, _) = pair(ChannelConfig::default());
        let frame = data(a.seal(b"loop").unwrap());
        assert_eq!(a.open(&frame), Err(ChannelError::Authentication));
    }

    #[test]
    fn counter_exhaustion_is_hard_limit() {
        let (mut a, _) = pair(ChannelConfig { max_frames: 2 });
        a.seal(b"1").unwrap();
        a.seal(b"2").unwrap();

        let err = a.seal(b"3").unwrap_err();
        assert_eq!(err, ChannelError::CounterExhausted);
        assert_eq!(err.kind(), crate::FailureKind::ResourceExhaustion);
    }

    #[test]
    fn app_traffic_requires_establishment() {
        let fp = Fingerprint::from_bytes([3; 32]);
        let mut session = Session::new(fp, Role::Initiator, keys(), ChannelConfig::default());

        assert_eq!(session.seal(b"early"), Err(ChannelError::NotEstablished));
        assert!(session.seal_ready().is_ok());
    }

    #[test]
    fn closed_session_refuses_everything() {
        let (mut a, mut b) = pair(ChannelConfig::default());
        let frame = data(a.seal(b"late").unwrap());

        b.close();
        assert_eq!(b.state(), SessionState::Closed);
        assert_eq!(b.open(&frame), Err(ChannelError::Closed));
        assert_eq!(b.seal(b"x"), Err(ChannelError::Closed));
    }

    #[test]
    fn goodbye_closes_sender() {
        let (mut a, mut b) = pair(ChannelConfig::default());
        let frame = data(a.goodbye("done").unwrap());

        assert_eq!(a.state(), SessionState::Closed);
        assert_eq!(b.open(&frame).unwrap(), InnerMessage::Goodbye { reason: "done".into() });
    }

    #[test]
    fn ready_frame_must_be_ready() {
        let (mut a, mut b) = pair(ChannelConfig::default());
        let frame = data(a.seal(b"not ready").unwrap());
        assert!(matches!(b.open_ready(&frame), Err(ChannelError::Protocol(_))));
    }

    #[test]
    fn table_replaces_and_closes() {
        let (a, _) = pair(ChannelConfig::default());
        let peer = a.peer();
        let mut table = SessionTable::new();
        table.insert(a);
        let (a2, _) = pair(ChannelConfig::default());
        table.insert(a2);

        assert_eq!(table.len(), 1);
        assert!(table.remove(&peer));
        assert!(table.is_empty());
    }
}
