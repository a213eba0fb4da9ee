//! Property-based tests for message encoding/decoding
//!
//! Verifies the codec for all generated inputs: decode inverts encode, and no
//! byte string makes the decoder panic.

use bytes::Bytes;
use pqlan_crypto::{Fingerprint, SymmetricKey, TAG_SIZE};
use pqlan_proto::{
    DataFrame, GroupDataFrame, GroupKey, InnerMessage, Message, Offer, ProtocolError, Response,
};
use proptest::prelude::*;

fn arbitrary_fingerprint() -> impl Strategy<Value = Fingerprint> {
    any::<[u8; 32]>().prop_map(Fingerprint::from_bytes)
}

fn arbitrary_bytes(max: usize) -> impl Strategy<Value = Bytes> {
    prop::collection::vec(any::<u8>(), 0..max).prop_map(Bytes::from)
}

fn arbitrary_tag() -> impl Strategy<Value = [u8; TAG_SIZE]> {
    any::<[u8; TAG_SIZE]>()
}

/// Strategy for generating arbitrary transport messages
fn arbitrary_message() -> impl Strategy<Value = Message> {
    prop_oneof![
        (arbitrary_fingerprint(), arbitrary_bytes(64), arbitrary_bytes(256), arbitrary_bytes(128))
            .prop_map(|(fingerprint, signing_public_key, encapsulation_key, signature)| {
                Message::Offer(Offer {
                    fingerprint,
                    signing_public_key,
                    encapsulation_key,
                    signature,
                })
            }),
        (arbitrary_fingerprint(), arbitrary_bytes(64), arbitrary_bytes(256), arbitrary_bytes(128))
            .prop_map(|(fingerprint, signing_public_key, ciphertext, signature)| {
                Message::Response(Response {
                    fingerprint,
                    signing_public_key,
                    ciphertext,
                    signature,
                })
            }),
        (any::<u64>(), arbitrary_bytes(512), arbitrary_tag()).prop_map(
            |(counter, ciphertext, tag)| Message::Data(DataFrame { counter, ciphertext, tag })
        ),
        (
            any::<[u8; 16]>(),
            any::<u32>(),
            arbitrary_fingerprint(),
            any::<u64>(),
            arbitrary_bytes(512),
            arbitrary_tag()
        )
            .prop_map(|(group_id, epoch, sender, counter, ciphertext, tag)| {
                Message::GroupData(GroupDataFrame {
                    group_id,
                    epoch,
                    sender,
                    counter,
                    ciphertext,
                    tag,
                })
            }),
    ]
}

/// Strategy for generating arbitrary sealed messages
fn arbitrary_inner() -> impl Strategy<Value = InnerMessage> {
    prop_oneof![
        Just(InnerMessage::Ready),
        arbitrary_bytes(512).prop_map(InnerMessage::App),
        ".{0,64}".prop_map(|reason| InnerMessage::Goodbye { reason }),
        (
            any::<[u8; 16]>(),
            any::<u32>(),
            any::<[u8; 32]>(),
            prop::collection::vec(arbitrary_fingerprint(), 0..16)
        )
            .prop_map(|(group_id, epoch, key, members)| {
                InnerMessage::GroupKey(GroupKey {
                    group_id,
                    epoch,
                    key: SymmetricKey::from_bytes(key),
                    members,
                })
            }),
    ]
}

proptest! {
    #[test]
    fn prop_message_roundtrip(message in arbitrary_message()) {
        let bytes = message.to_vec().unwrap();
        let decoded = Message::decode(&bytes).unwrap();

        // PROPERTY: decode(encode(m)) == m and re-encoding is byte-identical
        prop_assert_eq!(&decoded, &message);
        prop_assert_eq!(decoded.to_vec().unwrap(), bytes);
    }

    #[test]
    fn prop_inner_roundtrip(message in arbitrary_inner()) {
        let bytes = message.to_vec().unwrap();
        prop_assert_eq!(InnerMessage::decode(&bytes).unwrap(), message);
    }

    #[test]
    fn prop_decode_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..512)) {
        // PROPERTY: arbitrary input yields Ok or Err, never a panic
        let _ = Message::decode(&bytes);
        let _ = InnerMessage::decode(&bytes);
    }

    #[test]
    fn prop_truncation_always_detected(
        message in arbitrary_message(),
        cut in any::<prop::sample::Index>(),
    ) {
        let bytes = message.to_vec().unwrap();
        let len = cut.index(bytes.len());

        // PROPERTY: every strict prefix fails to decode
        prop_assert!(Message::decode(&bytes[..len]).is_err());
    }

    #[test]
    fn prop_appended_bytes_rejected(message in arbitrary_message(), extra in 1usize..16) {
        let mut bytes = message.to_vec().unwrap();
        bytes.extend(std::iter::repeat_n(0u8, extra));

        prop_assert_eq!(Message::decode(&bytes), Err(ProtocolError::TrailingBytes(extra)));
    }
}
