//! Node error types.
//!
//! Wraps the core errors and adds what only a driver can hit: I/O, framing,
//! handshake deadlines and missing connections.

use pqlan_core::{
    ChannelError, GroupError, HandshakeError, IdentityError, RejectReason, StorageError,
};
use pqlan_crypto::Fingerprint;
use pqlan_proto::ProtocolError;
use thiserror::Error;

/// Errors that can occur while running a node.
#[derive(Debug, Error)]
pub enum NodeError {
    /// Socket or stream failure.
    ///
    /// The connection is gone; reconnecting is the only remedy.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Length prefix exceeds the frame limit.
    ///
    /// Treated as a protocol violation: the stream cannot be resynchronised.
    #[error("frame of {len} bytes exceeds limit of {max}")]
    FrameTooLarge {
        /// Announced frame length
        len: usize,
        /// Configured limit
        max: usize,
    },

    /// Stream ended in the middle of a frame
    #[error("stream ended inside a frame")]
    TruncatedFrame,

    /// Peer closed the connection before the handshake finished
    #[error("connection closed during handshake")]
    ConnectionClosed,

    /// Handshake did not finish before its deadline
    #[error("handshake timed out")]
    HandshakeTimeout,

    /// Handshake state machine rejected the peer.
    ///
    /// Carries only the opaque reason; the detailed cause is logged.
    #[error("handshake rejected: {0}")]
    Rejected(RejectReason),

    /// A session with this peer already exists and wins the tie-break
    #[error("duplicate session with {0}")]
    DuplicateSession(Fingerprint),

    /// No live session with the peer
    #[error("not connected to {0}")]
    NotConnected(Fingerprint),

    /// Message could not be encoded or decoded
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Identity store failure
    #[error("identity error: {0}")]
    Identity(#[from] IdentityError),

    /// Trust database could not be opened
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Handshake could not be started
    #[error("handshake error: {0}")]
    Handshake(#[from] HandshakeError),

    /// Session-level failure that ends the connection
    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),

    /// Group operation failed
    #[error("group error: {0}")]
    Group(#[from] GroupError),

    /// CLI input was not valid hex
    #[error("invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),
}

impl NodeError {
    /// What to report when this error ends a handshake.
    pub fn reject_reason(&self) -> RejectReason {
        match self {
            Self::Rejected(reason) => *reason,
            Self::HandshakeTimeout => RejectReason::TimedOut,
            Self::Handshake(err) => err.kind().reject_reason(),
            Self::Io(_)
            | Self::FrameTooLarge { .. }
            | Self::TruncatedFrame
            | Self::ConnectionClosed
            | Self::DuplicateSession(_)
            | Self::Protocol(_) => RejectReason::PeerRejected,
            Self::NotConnected(_)
            | Self::Identity(_)
            | Self::Storage(_)
            | Self::Channel(_)
            | Self::Group(_)
            | Self::Hex(_) => RejectReason::LocalFailure,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_reports_timed_out() {
        assert_eq!(NodeError::HandshakeTimeout.reject_reason(), RejectReason::TimedOut);
    }

    #[test]
    fn rejection_keeps_reason() {
        let err = NodeError::Rejected(RejectReason::PeerRejected);
        assert_eq!(err.reject_reason(), RejectReason::PeerRejected);
    }

    #[test]
    fn framing_errors_reject_peer() {
        let err = NodeError::FrameTooLarge { len: 2 << 20, max: 1 << 20 };
        assert_eq!(err.reject_reason(), RejectReason::PeerRejected);
        assert_eq!(NodeError::TruncatedFrame.reject_reason(), RejectReason::PeerRejected);
    }
}
