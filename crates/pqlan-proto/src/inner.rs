//! Messages sealed inside a pairwise DATA frame.
//!
//! These never appear on the transport in the clear. The enclosing DATA frame
//! provides confidentiality and authentication, so a GROUP_KEY can carry the
//! raw group key.

use bytes::{BufMut, Bytes};
use pqlan_crypto::{Fingerprint, SymmetricKey, derivation::KEY_SIZE};

use crate::{
    MAX_GROUP_MEMBERS,
    errors::{ProtocolError, Result},
    message::MessageType,
    wire::{Reader, put_header, put_var},
};

/// Group key delivery for one epoch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupKey {
    /// Group identifier
    pub group_id: [u8; 16],
    /// Epoch this key belongs to
    pub epoch: u32,
    /// The epoch's group key
    pub key: SymmetricKey,
    /// Fingerprints of every member of the epoch, sender included
    pub members: Vec<Fingerprint>,
}

/// Plaintext of a pairwise DATA frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InnerMessage {
    /// Key confirmation; the first frame each side seals
    Ready,
    /// Group key for a new group or a new epoch
    GroupKey(GroupKey),
    /// Opaque application payload
    App(Bytes),
    /// Graceful close
    Goodbye {
        /// Human-readable reason
        reason: String,
    },
}

impl InnerMessage {
    /// Type byte of this message.
    pub const fn message_type(&self) -> MessageType {
        match self {
            Self::Ready => MessageType::Ready,
            Self::GroupKey(_) => MessageType::GroupKey,
            Self::App(_) => MessageType::App,
            Self::Goodbye { .. } => MessageType::Goodbye,
        }
    }

    /// Encode into `dst`.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::FieldTooLarge` if a payload or the member list is over
    ///   its limit
    pub fn encode(&self, dst: &mut impl BufMut) -> Result<()> {
        put_header(dst, self.message_type().to_u8());

        match self {
            Self::Ready => {},
            Self::GroupKey(group_key) => {
                if group_key.members.len() > MAX_GROUP_MEMBERS {
                    return Err(ProtocolError::FieldTooLarge {
                        size: group_key.members.len(),
                        max: MAX_GROUP_MEMBERS,
                    });
                }
                dst.put_slice(&group_key.group_id);
                dst.put_u32(group_key.epoch);
                put_var(dst, group_key.key.as_bytes())?;
                dst.put_u32(group_key.members.len() as u32);
                for member in &group_key.members {
                    dst.put_slice(member.as_bytes());
                }
            },
            Self::App(payload) => put_var(dst, payload)?,
            Self::Goodbye { reason } => put_var(dst, reason.as_bytes())?,
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

    /// Decode one complete inner message.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::UnknownType` / `UnexpectedType` for a type byte that
    ///   is not an inner message
    /// - `ProtocolError::InvalidLength` if the group key is not 32 bytes
    /// - `ProtocolError::InvalidUtf8` for a non-UTF-8 goodbye reason
    /// - structural errors as for [`crate::Message::decode`]
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(bytes);
        let type_byte = reader.header()?;
        let message_type =
            MessageType::from_u8(type_byte).ok_or(ProtocolError::UnknownType(type_byte))?;

        let message = match message_type {
            MessageType::Ready => Self::Ready,
            MessageType::GroupKey => Self::GroupKey(decode_group_key(&mut reader)?),
            MessageType::App => Self::App(reader.var()?),
            MessageType::Goodbye => {
                let reason = reader.var()?;
                let reason =
                    String::from_utf8(reason.to_vec()).map_err(|_| ProtocolError::InvalidUtf8)?;
                Self::Goodbye { reason }
            },
            MessageType::Offer
            | MessageType::Response
            | MessageType::Data
            | MessageType::GroupData => {
                return Err(ProtocolError::UnexpectedType {
                    expected: "sealed message",
                    found: type_byte,
                });
            },
        };

        reader.finish()?;
        Ok(message)
    }
}

fn decode_group_key(reader: &mut Reader<'_>) -> Result<GroupKey> {
    let group_id = reader.array()?;
    let epoch = reader.u32()?;

    let raw_key = reader.var()?;
    let key_bytes: [u8; KEY_SIZE] =
        raw_key.as_ref().try_into().map_err(|_| ProtocolError::InvalidLength {
            field: "group key",
            expected: KEY_SIZE,
            actual: raw_key.len(),
        })?;
    let key = SymmetricKey::from_bytes(key_bytes);

    let count = reader.u32()? as usize;
    if count > MAX_GROUP_MEMBERS {
        return Err(ProtocolError::FieldTooLarge { size: count, max: MAX_GROUP_MEMBERS });
    }
    let mut members = Vec::with_capacity(count);
    for _ in 0..count {
        members.push(Fingerprint::from_bytes(reader.array()?));
    }

    Ok(GroupKey { group_id, epoch, key, members })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PROTOCOL_VERSION;

    #[test]
    fn ready_is_header_only() {
        assert_eq!(InnerMessage::Ready.to_vec().unwrap(), vec![0x03, PROTOCOL_VERSION]);
    }

    #[test]
    fn group_key_roundtrip() {
        let message = InnerMessage::GroupKey(GroupKey {
            group_id: [4; 16],
            epoch: 2,
            key: SymmetricKey::from_bytes([8; 32]),
            members: vec![Fingerprint::from_bytes([1; 32]), Fingerprint::from_bytes([2; 32])],
        });
        let bytes = message.to_vec().unwrap();
        assert_eq!(InnerMessage::decode(&bytes).unwrap(), message);
    }

    #[test]
    fn short_group_key_rejected() {
        let mut bytes = vec![MessageType::GroupKey.to_u8(), PROTOCOL_VERSION];
        bytes.extend_from_slice(&[0; 16]);
        bytes.extend_from_slice(&1u32.to_be_bytes());
        bytes.extend_from_slice(&3u32.to_be_bytes());
        bytes.extend_from_slice(&[1, 2, 3]);
        bytes.extend_from_slice(&0u32.to_be_bytes());

        assert_eq!(
            InnerMessage::decode(&bytes),
            Err(ProtocolError::InvalidLength { field: "group key", expected: 32, actual: 3 })
        );
    }

    #[test]
    fn oversized_member_count_rejected_before_allocation() {
        let mut bytes = vec![MessageType::GroupKey.to_u8(), PROTOCOL_VERSION];
        bytes.extend_from_slice(&[0; 16]);
        bytes.extend_from_slice(&1u32.to_be_bytes());
        bytes.extend_from_slice(&32u32.to_be_bytes());
        bytes.extend_from_slice(&[0; 32]);
        bytes.extend_from_slice(&u32::MAX.to_be_bytes());

        assert!(matches!(InnerMessage::decode(&bytes), Err(ProtocolError::FieldTooLarge { .. })));
    }

    #[test]
    fn invalid_utf8_goodbye_rejected() {
        let mut bytes = vec![MessageType::Goodbye.to_u8(), PROTOCOL_VERSION];
        bytes.extend_from_slice(&2u32.to_be_bytes());
        bytes.extend_from_slice(&[0xFF, 0xFE]);
        assert_eq!(InnerMessage::decode(&bytes), Err(ProtocolError::InvalidUtf8));
    }

    #[test]
    fn transport_type_rejected_as_inner() {
        assert!(matches!(
            InnerMessage::decode(&[MessageType::Offer.to_u8(), PROTOCOL_VERSION]),
            Err(ProtocolError::UnexpectedType { .. })
        ));
    }
}
