//! pqlan Wire Protocol
//!
//! Binary encoding for every message exchanged between two peers, plus the
//! CBOR pairing payload carried out-of-band (QR code).
//!
//! # Layout
//!
//! Every message starts with `[type:1][version:1]`. Fixed-size fields follow in
//! declaration order; variable-size fields are prefixed with a big-endian
//! `u32` length. Decoding rejects unknown type bytes, unsupported versions,
//! truncated input and trailing bytes.
//!
//! Two families share the type byte space:
//!
//! - [`Message`]: what travels in the clear on the transport (handshake,
//!   sealed pairwise frames, sealed group frames)
//! - [`InnerMessage`]: what is sealed inside a pairwise DATA frame (key
//!   confirmation, group keys, application payloads, goodbye)

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod errors;
mod inner;
mod message;
mod pairing;
mod wire;

pub use errors::{ProtocolError, Result};
pub use inner::{GroupKey, InnerMessage};
pub use message::{DataFrame, GroupDataFrame, Message, MessageType, Offer, Response};
pub use pairing::{PAIRING_PAYLOAD_VERSION, PairingPayload};

/// Protocol version carried in every message header.
pub const PROTOCOL_VERSION: u8 = 0x01;

/// Upper bound on any single variable-length field.
pub const MAX_FIELD_SIZE: usize = 1024 * 1024;

/// Upper bound on group size carried in a GROUP_KEY message.
pub const MAX_GROUP_MEMBERS: usize = 256;
