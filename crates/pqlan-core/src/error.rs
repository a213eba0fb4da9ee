//! Error types for the pqlan protocol core.
//!
//! One enum per component. Every error maps onto a [`FailureKind`] that tells
//! the driver what to do with it (drop the frame, fail the handshake, tear
//! down the session), and onto an opaque [`RejectReason`] that is safe to show
//! a user or send to a peer.

use std::time::Duration;

use pqlan_crypto::{Fingerprint, KemError, ReplayError, SignatureError};
use pqlan_proto::{MessageType, ProtocolError};
use thiserror::Error;

use crate::{group::GroupId, handshake::HandshakeState, identity::StorageError};

/// Failure taxonomy shared by all components.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Signature mismatch, malformed KEM input, AEAD tag mismatch
    CryptoFailure,
    /// Frame counter already seen or outside the window; drop the frame
    ReplayDetected,
    /// Peer is unknown, unverified, revoked or presented a different key
    TrustPolicyViolation,
    /// Counter overflow or entropy failure; the session cannot continue
    ResourceExhaustion,
    /// Malformed or out-of-order message
    Protocol,
    /// Peer did not respond in time
    Timeout,
    /// Operation not valid in the current state
    InvalidState,
    /// Trust table could not be read or written
    Storage,
}

/// What a rejected peer (or the local user) is told.
///
/// Deliberately coarse: it never says which check failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum RejectReason {
    /// Peer rejected / untrusted
    #[error("peer rejected / untrusted")]
    PeerRejected,
    /// Handshake did not complete in time
    #[error("handshake timed out")]
    TimedOut,
    /// Local failure unrelated to the peer
    #[error("local failure")]
    LocalFailure,
}

impl FailureKind {
    /// The user-visible reason for a failure of this kind.
    pub const fn reject_reason(self) -> RejectReason {
        match self {
            Self::CryptoFailure
            | Self::ReplayDetected
            | Self::TrustPolicyViolation
            | Self::Protocol
            | Self::InvalidState => RejectReason::PeerRejected,
            Self::Timeout => RejectReason::TimedOut,
            Self::ResourceExhaustion | Self::Storage => RejectReason::LocalFailure,
        }
    }
}

/// Errors from the identity store and trust table.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    /// No local identity has been generated yet
    #[error("no local identity")]
    NoIdentity,

    /// Fingerprint is already bound to a different public key
    #[error("key mismatch for peer {0}")]
    KeyMismatch(Fingerprint),

    /// Claimed fingerprint is not the hash of the presented key
    #[error("fingerprint does not match public key")]
    FingerprintMismatch,

    /// Peer is not in the trust table
    #[error("unknown peer {0}")]
    UnknownPeer(Fingerprint),

    /// Peer is known but not verified (strict policy)
    #[error("peer {0} is not verified")]
    Unverified(Fingerprint),

    /// Peer was revoked
    #[error("peer {0} is revoked")]
    Revoked(Fingerprint),

    /// Peer presented our own identity
    #[error("peer presented the local identity")]
    SelfPeer,

    /// Pairing payload version is not supported
    #[error("unsupported pairing payload version {0}")]
    UnsupportedPairingVersion(u8),

    /// Key generation, parsing or signing failed
    #[error("signature error: {0}")]
    Signature(#[from] SignatureError),

    /// Pairing payload could not be decoded
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Trust table backend failed
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

impl IdentityError {
    /// Failure classification.
    pub const fn kind(&self) -> FailureKind {
        match self {
            Self::NoIdentity => FailureKind::InvalidState,
            Self::KeyMismatch(_)
            | Self::UnknownPeer(_)
            | Self::Unverified(_)
            | Self::Revoked(_)
            | Self::SelfPeer => FailureKind::TrustPolicyViolation,
            Self::FingerprintMismatch => FailureKind::CryptoFailure,
            Self::UnsupportedPairingVersion(_) | Self::Protocol(_) => FailureKind::Protocol,
            Self::Signature(SignatureError::Entropy(_)) => FailureKind::ResourceExhaustion,
            Self::Signature(_) => FailureKind::CryptoFailure,
            Self::Storage(_) => FailureKind::Storage,
        }
    }
}

/// Errors that fail a handshake.
///
/// Any of these moves the handshake to `Failed`; the peer is told only
/// [`RejectReason`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    /// Operation not valid in the current state
    #[error("invalid state: cannot {operation} in {state:?}")]
    InvalidState {
        /// State when the error occurred
        state: HandshakeState,
        /// Attempted operation
        operation: &'static str,
    },

    /// Message type not expected in the current state
    #[error("unexpected {message:?} in {state:?}")]
    UnexpectedMessage {
        /// State when the message arrived
        state: HandshakeState,
        /// Received type
        message: MessageType,
    },

    /// Peer is not the one this handshake was started for
    #[error("expected peer {expected}, got {actual}")]
    UnexpectedPeer {
        /// Fingerprint we dialed
        expected: Fingerprint,
        /// Fingerprint the peer presented
        actual: Fingerprint,
    },

    /// Trust decision or trust table update failed
    #[error("identity error: {0}")]
    Identity(#[from] IdentityError),

    /// Signature over the transcript did not verify
    #[error("signature verification failed")]
    BadSignature,

    /// Encapsulation or decapsulation input was malformed
    #[error("key exchange failed: {0}")]
    Kem(#[from] KemError),

    /// Key confirmation (READY) did not open under the derived key
    #[error("key confirmation failed")]
    KeyConfirmation,

    /// Message could not be decoded
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Sealing the key confirmation failed
    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),

    /// Handshake did not complete within the timeout
    #[error("handshake timeout after {elapsed:?}")]
    Timeout {
        /// Time since the handshake started
        elapsed: Duration,
    },
}

impl HandshakeError {
    /// Failure classification.
    pub const fn kind(&self) -> FailureKind {
        match self {
            Self::InvalidState { .. } => FailureKind::InvalidState,
            Self::UnexpectedMessage { .. } | Self::Protocol(_) => FailureKind::Protocol,
            Self::UnexpectedPeer { .. } => FailureKind::TrustPolicyViolation,
            Self::Identity(err) => err.kind(),
            Self::BadSignature | Self::KeyConfirmation => FailureKind::CryptoFailure,
            Self::Kem(KemError::Entropy(_)) => FailureKind::ResourceExhaustion,
            Self::Kem(_) => FailureKind::CryptoFailure,
            Self::Channel(err) => err.kind(),
            Self::Timeout { .. } => FailureKind::Timeout,
        }
    }

    /// Returns true if this error is transient and a fresh handshake may
    /// succeed.
    ///
    /// Only timeouts qualify; verification failures indicate a broken or
    /// malicious peer.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Errors from sealing or opening channel frames.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// Session was closed; all key material is gone
    #[error("session closed")]
    Closed,

    /// Application traffic before the handshake finished
    #[error("session not established")]
    NotEstablished,

    /// Send counter reached its limit; the session must be torn down
    #[error("send counter exhausted")]
    CounterExhausted,

    /// Tag did not verify
    #[error("authentication failed")]
    Authentication,

    /// Counter already seen or outside the window
    #[error("replay detected: {0}")]
    Replay(#[from] ReplayError),

    /// Frame authenticated but its content is malformed
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl ChannelError {
    /// Failure classification.
    pub const fn kind(&self) -> FailureKind {
        match self {
            Self::Closed | Self::NotEstablished => FailureKind::InvalidState,
            Self::CounterExhausted => FailureKind::ResourceExhaustion,
            Self::Authentication => FailureKind::CryptoFailure,
            Self::Replay(_) => FailureKind::ReplayDetected,
            Self::Protocol(_) => FailureKind::Protocol,
        }
    }
}

/// Errors from group key management and group traffic.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GroupError {
    /// No such group
    #[error("unknown group {0}")]
    UnknownGroup(GroupId),

    /// Frame names an epoch we do not hold (never had it, or pruned)
    #[error("unknown epoch {epoch} for group {group}")]
    UnknownEpoch {
        /// Group
        group: GroupId,
        /// Requested epoch
        epoch: u32,
    },

    /// A member has no established pairwise session to carry the key
    #[error("no established session with {0}")]
    NoSession(Fingerprint),

    /// Sender or local node is not a member of the epoch
    #[error("{0} is not a member")]
    NotAMember(Fingerprint),

    /// Only the group admin may rotate or send key updates
    #[error("{from} is not the admin of group {group}")]
    NotAdmin {
        /// Group
        group: GroupId,
        /// Who attempted the operation
        from: Fingerprint,
    },

    /// Key update does not advance the epoch
    #[error("stale epoch {received} for group {group} (current {current})")]
    StaleEpoch {
        /// Group
        group: GroupId,
        /// Epoch we hold
        current: u32,
        /// Epoch received
        received: u32,
    },

    /// Group has no members besides the local node
    #[error("group needs at least one other member")]
    NoMembers,

    /// Too many members for one GROUP_KEY message
    #[error("group too large: {0} members")]
    TooManyMembers(usize),

    /// Epoch number or send counter reached its limit
    #[error("group counter exhausted")]
    CounterExhausted,

    /// Tag did not verify
    #[error("authentication failed")]
    Authentication,

    /// Counter already seen or outside the sender's window
    #[error("replay detected: {0}")]
    Replay(#[from] ReplayError),

    /// Delivering the key over a pairwise session failed
    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),
}

impl GroupError {
    /// Failure classification.
    pub const fn kind(&self) -> FailureKind {
        match self {
            Self::UnknownGroup(_) | Self::UnknownEpoch { .. } | Self::StaleEpoch { .. } => {
                FailureKind::Protocol
            },
            Self::NoSession(_) | Self::NoMembers | Self::TooManyMembers(_) => {
                FailureKind::InvalidState
            },
            Self::NotAMember(_) | Self::NotAdmin { .. } => FailureKind::TrustPolicyViolation,
            Self::CounterExhausted => FailureKind::ResourceExhaustion,
            Self::Authentication => FailureKind::CryptoFailure,
            Self::Replay(_) => FailureKind::ReplayDetected,
            Self::Channel(err) => err.kind(),
        }
    }
}
