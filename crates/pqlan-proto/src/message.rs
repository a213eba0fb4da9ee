//! Transport-level messages.
//!
//! # Invariants
//!
//! Each variant maps to exactly one [`MessageType`] (enforced by match
//! exhaustiveness in `message_type`, `encode` and `decode`). A decoded message
//! re-encodes to the same bytes.

use bytes::{BufMut, Bytes};
use pqlan_crypto::{Fingerprint, TAG_SIZE};

use crate::{
    PROTOCOL_VERSION,
    errors::{ProtocolError, Result},
    wire::{Reader, put_header, put_var},
};

/// Label prefixed to the OFFER signing transcript
const OFFER_LABEL: &[u8] = b"pqlan-offer";

/// Label prefixed to the RESPONSE signing transcript
const RESPONSE_LABEL: &[u8] = b"pqlan-response";

/// Type byte of every message, across both families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Handshake offer (initiator → responder)
    Offer = 0x01,
    /// Handshake response (responder → initiator)
    Response = 0x02,
    /// Key confirmation, sealed
    Ready = 0x03,
    /// Sealed pairwise frame
    Data = 0x04,
    /// Group key delivery, sealed
    GroupKey = 0x05,
    /// Sealed group frame
    GroupData = 0x06,
    /// Application payload, sealed
    App = 0x07,
    /// Graceful close, sealed
    Goodbye = 0x08,
}

impl MessageType {
    /// Parse a type byte.
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::Offer),
            0x02 => Some(Self::Response),
            0x03 => Some(Self::Ready),
            0x04 => Some(Self::Data),
            0x05 => Some(Self::GroupKey),
            0x06 => Some(Self::GroupData),
            0x07 => Some(Self::App),
            0x08 => Some(Self::Goodbye),
            _ => None,
        }
    }

    /// Raw type byte.
    pub const fn to_u8(self) -> u8 {
        self as u8
    }
}

/// Handshake step 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Offer {
    /// Initiator fingerprint
    pub fingerprint: Fingerprint,
    /// Initiator's encoded signing public key
    pub signing_public_key: Bytes,
    /// Ephemeral ML-KEM encapsulation key
    pub encapsulation_key: Bytes,
    /// Signature over [`Offer::signing_transcript`]
    pub signature: Bytes,
}

impl Offer {
    /// Bytes the initiator signs: `label || version || fingerprint || ek`.
    pub fn signing_transcript(fingerprint: &Fingerprint, encapsulation_key: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(OFFER_LABEL.len() + 1 + 32 + encapsulation_key.len());
        out.extend_from_slice(OFFER_LABEL);
        out.push(PROTOCOL_VERSION);
        out.extend_from_slice(fingerprint.as_bytes());
        out.extend_from_slice(encapsulation_key);
        out
    }
}

/// Handshake step 2.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Responder fingerprint
    pub fingerprint: Fingerprint,
    /// Responder's encoded signing public key
    pub signing_public_key: Bytes,
    /// ML-KEM ciphertext to the initiator's ephemeral key
    pub ciphertext: Bytes,
    /// Signature over [`Response::signing_transcript`]
    pub signature: Bytes,
}

impl Response {
    /// Bytes the responder signs:
    /// `label || version || fingerprint || ciphertext || H(offer ek) || initiator`.
    ///
    /// Binding the offer's key hash and the initiator fingerprint ties the
    /// response to exactly one offer.
    pub fn signing_transcript(
        fingerprint: &Fingerprint,
        ciphertext: &[u8],
        offer_key_hash: &[u8; 32],
        initiator: &Fingerprint,
    ) -> Vec<u8> {
        let mut out =
            Vec::with_capacity(RESPONSE_LABEL.len() + 1 + 32 + ciphertext.len() + 32 + 32);
        out.extend_from_slice(RESPONSE_LABEL);
        out.push(PROTOCOL_VERSION);
        out.extend_from_slice(fingerprint.as_bytes());
        out.extend_from_slice(ciphertext);
        out.extend_from_slice(offer_key_hash);
        out.extend_from_slice(initiator.as_bytes());
        out
    }
}

/// Pairwise frame sealed under a session key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFrame {
    /// Sender's frame counter
    pub counter: u64,
    /// Encrypted [`crate::InnerMessage`]
    pub ciphertext: Bytes,
    /// Poly1305 tag
    pub tag: [u8; TAG_SIZE],
}

impl DataFrame {
    /// Associated data for a DATA frame: its header up to and including the
    /// counter.
    pub fn aad(counter: u64) -> [u8; 10] {
        let mut out = [0u8; 10];
        out[0] = MessageType::Data.to_u8();
        out[1] = PROTOCOL_VERSION;
        out[2..].copy_from_slice(&counter.to_be_bytes());
        out
    }
}

/// Group frame sealed under a per-sender group key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupDataFrame {
    /// Group identifier
    pub group_id: [u8; 16],
    /// Group epoch the sender encrypted under
    pub epoch: u32,
    /// Sender fingerprint (selects the per-sender key)
    pub sender: Fingerprint,
    /// Sender's counter within this epoch
    pub counter: u64,
    /// Encrypted application payload
    pub ciphertext: Bytes,
    /// Poly1305 tag
    pub tag: [u8; TAG_SIZE],
}

impl GroupDataFrame {
    /// Associated data for a GROUP_DATA frame: every header field before the
    /// ciphertext.
    pub fn aad(group_id: &[u8; 16], epoch: u32, sender: &Fingerprint, counter: u64) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 + 16 + 4 + 32 + 8);
        out.push(MessageType::GroupData.to_u8());
        out.push(PROTOCOL_VERSION);
        out.extend_from_slice(group_id);
        out.extend_from_slice(&epoch.to_be_bytes());
        out.extend_from_slice(sender.as_bytes());
        out.extend_from_slice(&counter.to_be_bytes());
        out
    }
}

/// A message as it travels on the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Handshake offer
    Offer(Offer),
    /// Handshake response
    Response(Response),
    /// Sealed pairwise frame
    Data(DataFrame),
    /// Sealed group frame
    GroupData(GroupDataFrame),
}

impl Message {
    /// Type byte of this message.
    pub const fn message_type(&self) -> MessageType {
        match self {
            Self::Offer(_) => MessageType::Offer,
            Self::Response(_) => MessageType::Response,
            Self::Data(_) => MessageType::Data,
            Self::GroupData(_) => MessageType::GroupData,
        }
    }

    /// Encode into `dst`.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::FieldTooLarge` if a variable field exceeds
    ///   [`crate::MAX_FIELD_SIZE`]
    pub fn encode(&self, dst: &mut impl BufMut) -> Result<()> {
        put_header(dst, self.message_type().to_u8());

        match self {
            Self::Offer(offer) => {
                dst.put_slice(offer.fingerprint.as_bytes());
                put_var(dst, &offer.signing_public_key)?;
                put_var(dst, &offer.encapsulation_key)?;
                put_var(dst, &offer.signature)?;
            },
            Self::Response(response) => {
                dst.put_slice(response.fingerprint.as_bytes());
                put_var(dst, &response.signing_public_key)?;
                put_var(dst, &response.ciphertext)?;
                put_var(dst, &response.signature)?;
            },
            Self::Data(frame) => {
                dst.put_u64(frame.counter);
                put_var(dst, &frame.ciphertext)?;
                dst.put_slice(&frame.tag);
            },
            Self::GroupData(frame) => {
                dst.put_slice(&frame.group_id);
                dst.put_u32(frame.epoch);
                dst.put_slice(frame.sender.as_bytes());
                dst.put_u64(frame.counter);
                put_var(dst, &frame.ciphertext)?;
                dst.put_slice(&frame.tag);
            },
        }

        Ok(())
    }

    /// Encode into a fresh buffer.
    ///
    /// # Errors
    ///
    /// Same as [`Self::encode`].
    pub fn to_vec(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.encode(&mut buf)?;
        Ok(buf)
    }

    /// Decode one complete message.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::UnknownType` for an unassigned type byte
    /// - `ProtocolError::UnexpectedType` for an inner (sealed-only) type
    /// - `ProtocolError::UnsupportedVersion`, `Truncated`, `FieldTooLarge`,
    ///   `TrailingBytes` for structural problems
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(bytes);
        let type_byte = reader.header()?;
        let message_type =
            MessageType::from_u8(type_byte).ok_or(ProtocolError::UnknownType(type_byte))?;

        let message = match message_type {
            MessageType::Offer => Self::Offer(Offer {
                fingerprint: Fingerprint::from_bytes(reader.array()?),
                signing_public_key: reader.var()?,
                encapsulation_key: reader.var()?,
                signature: reader.var()?,
            }),
            MessageType::Response => Self::Response(Response {
                fingerprint: Fingerprint::from_bytes(reader.array()?),
                signing_public_key: reader.var()?,
                ciphertext: reader.var()?,
                signature: reader.var()?,
            }),
            MessageType::Data => Self::Data(DataFrame {
                counter: reader.u64()?,
                ciphertext: reader.var()?,
                tag: reader.array()?,
            }),
            MessageType::GroupData => Self::GroupData(GroupDataFrame {
                group_id: reader.array()?,
                epoch: reader.u32()?,
                sender: Fingerprint::from_bytes(reader.array()?),
                counter: reader.u64()?,
                ciphertext: reader.var()?,
                tag: reader.array()?,
            }),
            MessageType::Ready
            | MessageType::GroupKey
            | MessageType::App
            | MessageType::Goodbye => {
                return Err(ProtocolError::UnexpectedType {
                    expected: "transport message",
                    found: type_byte,
                });
            },
        };

        reader.finish()?;
        Ok(message)
    }
}
