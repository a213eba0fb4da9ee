//! pqlan Protocol Core
//!
//! Sans-IO state machines for the pqlan secure session protocol: identity and
//! trust, the authenticated key exchange, the pairwise channel and group
//! rekeying. Nothing here performs I/O or reads the clock; the driver passes
//! time in and executes the returned actions.
//!
//! # Components
//!
//! ```text
//!            IdentityStore (trust table, single writer)
//!                  │ authorize_peer / sign
//!                  ▼
//! Handshake ──Established(Session)──> Session ──seal/open──> DATA frames
//!                                        │
//!                                        │ GroupKeyCourier
//!                                        ▼
//!                                   GroupManager ──> GROUP_DATA frames
//! ```
//!
//! # Failure Handling
//!
//! Every error carries a [`FailureKind`]. Frame-level failures (tag mismatch,
//! replay) drop the frame; handshake-level failures move the handshake to
//! `Failed` and surface an opaque [`RejectReason`]; nothing panics on peer
//! input.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod channel;
pub mod env;
pub mod error;
pub mod group;
pub mod handshake;
pub mod identity;

pub use channel::{ChannelConfig, Session, SessionState, SessionTable};
pub use env::{EnvRng, Environment, SeededEnv};
pub use error::{
    ChannelError, FailureKind, GroupError, HandshakeError, IdentityError, RejectReason,
};
pub use group::{GroupConfig, GroupEpoch, GroupId, GroupKeyCourier, GroupManager};
pub use handshake::{
    Handshake, HandshakeAction, HandshakeConfig, HandshakeState, Role, should_initiate,
};
pub use identity::{
    Identity, IdentityStore, MemoryTrustStorage, PeerRecord, RedbTrustStorage, StorageError,
    TrustPolicy, TrustState, TrustStorage,
};
