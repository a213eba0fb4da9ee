//! Property-based tests for the symmetric layer
//!
//! 1. **Round-trip**: open(seal(p)) == p for all plaintexts and counters
//! 2. **Integrity**: flipping any ciphertext or tag bit fails authentication
//! 3. **Window**: every counter is accepted at most once, in any order
//! 4. **Isolation**: group sender keys differ per sender

use pqlan_crypto::{
    AeadError, ChannelNamespace, Fingerprint, ReceiveWindow, ReplayError, SymmetricKey, WINDOW_SIZE,
    derive_group_sender_key, open, seal,
};
use proptest::prelude::*;

fn arbitrary_namespace() -> impl Strategy<Value = ChannelNamespace> {
    prop_oneof![Just(ChannelNamespace::Pairwise), Just(ChannelNamespace::Group)]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_seal_open_roundtrip(
        key in any::<[u8; 32]>(),
        namespace in arbitrary_namespace(),
        epoch in any::<u32>(),
        counter in any::<u64>(),
        aad in prop::collection::vec(any::<u8>(), 0..64),
        plaintext in prop::collection::vec(any::<u8>(), 0..1024),
    ) {
        let key = SymmetricKey::from_bytes(key);
        let sealed = seal(&key, namespace, epoch, counter, &aad, &plaintext);
        let opened = open(&key, namespace, epoch, counter, &aad, &sealed.ciphertext, &sealed.tag);

        prop_assert_eq!(opened, Ok(plaintext));
    }

    #[test]
    fn prop_bit_flip_fails_authentication(
        key in any::<[u8; 32]>(),
        plaintext in prop::collection::vec(any::<u8>(), 1..256),
        flip_index in any::<prop::sample::Index>(),
        flip_bit in 0u8..8,
    ) {
        let key = SymmetricKey::from_bytes(key);
        let sealed = seal(&key, ChannelNamespace::Pairwise, 0, 0, b"", &plaintext);

        // Flip a bit anywhere in ciphertext || tag
        let mut ciphertext = sealed.ciphertext.clone();
        let mut tag = sealed.tag;
        let index = flip_index.index(ciphertext.len() + tag.len());
        if index < ciphertext.len() {
            ciphertext[index] ^= 1 << flip_bit;
        } else {
            tag[index - ciphertext.len()] ^= 1 << flip_bit;
        }

        let result = open(&key, ChannelNamespace::Pairwise, 0, 0, b"", &ciphertext, &tag);
        prop_assert_eq!(result, Err(AeadError::AuthenticationFailed));
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn prop_window_accepts_each_counter_once(
        counters in prop::collection::vec(0u64..256, 1..128),
    ) {
        let mut window = ReceiveWindow::new();
        let mut accepted = std::collections::HashSet::new();

        for counter in counters {
            match window.accept(counter) {
                Ok(()) => {
                    prop_assert!(accepted.insert(counter), "counter {} accepted twice", counter);
                },
                Err(ReplayError::Duplicate { counter: c }) => {
                    prop_assert!(accepted.contains(&c));
                },
                Err(ReplayError::TooOld { counter: c, highest }) => {
                    prop_assert!(highest - c >= WINDOW_SIZE);
                },
            }
        }
    }

    #[test]
    fn prop_window_in_order_always_accepts(
        start in 0u64..u64::MAX / 2,
        len in 1usize..200,
    ) {
        let mut window = ReceiveWindow::new();
        for counter in start..start + len as u64 {
            prop_assert!(window.accept(counter).is_ok());
        }
        prop_assert_eq!(window.highest(), Some(start + len as u64 - 1));
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(50))]

    #[test]
    fn prop_group_sender_keys_isolated(
        group_key in any::<[u8; 32]>(),
        group_id in any::<[u8; 16]>(),
        epoch in any::<u32>(),
        sender_a in any::<[u8; 32]>(),
        sender_b in any::<[u8; 32]>(),
    ) {
        prop_assume!(sender_a != sender_b);
        let group_key = SymmetricKey::from_bytes(group_key);

        let sender_a = Fingerprint::from_bytes(sender_a);
        let sender_b = Fingerprint::from_bytes(sender_b);
        let key_a = derive_group_sender_key(&group_key, &group_id, epoch, &sender_a);
        let key_b = derive_group_sender_key(&group_key, &group_id, epoch, &sender_b);

        prop_assert_ne!(key_a, key_b);
    }
}
