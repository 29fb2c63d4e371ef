#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use crate::codec::{decrypt_message, encrypt_message, MessageHeader};
    use crate::commitment::{commit, verify, SubjectKind};
    use crate::content::{open_content, seal_content, ContentKey};
    use crate::envelope::WireEnvelope;
    use crate::identity::{verify_signature, KeyPair, SigningKeyPair};
    use crate::replay::ReplayFilter;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn test_message_round_trip(
            plaintext in proptest::collection::vec(any::<u8>(), 0..4096),
            timestamp in any::<u64>(),
            sequence in any::<u64>(),
        ) {
            let alice = KeyPair::generate();
            let alice_sign = SigningKeyPair::generate();
            let bob = KeyPair::generate();
            let header = MessageHeader {
                message_id: "prop".into(),
                timestamp,
                sequence,
            };

            let env = encrypt_message(&plaintext, &header, &alice, &alice_sign, &bob.public_key())
                .unwrap();
            let out = decrypt_message(&env, &bob, Some(&alice_sign.public_key())).unwrap();
            prop_assert_eq!(out.plaintext.as_ref(), plaintext.as_slice());
            prop_assert!(out.verified);
            prop_assert_eq!(env.sequence, sequence);
        }

        #[test]
        fn test_wire_json_preserves_envelope(
            plaintext in proptest::collection::vec(any::<u8>(), 0..256),
            conversation in "[a-f0-9-]{0,40}",
        ) {
            let alice = KeyPair::generate();
            let alice_sign = SigningKeyPair::generate();
            let bob = KeyPair::generate();
            let header = MessageHeader {
                message_id: "wire".into(),
                timestamp: 1,
                sequence: 1,
            };
            let env = encrypt_message(&plaintext, &header, &alice, &alice_sign, &bob.public_key())
                .unwrap();

            let json = WireEnvelope::new(&env, None, &conversation).to_json().unwrap();
            let back = WireEnvelope::from_json(&json).unwrap();
            prop_assert_eq!(back.to_ciphertext().unwrap(), env);
            prop_assert_eq!(back.conversation_id, conversation);
        }

        #[test]
        fn test_commitment_binding(
            subject in proptest::collection::vec(any::<u8>(), 0..128),
            other in proptest::collection::vec(any::<u8>(), 0..128),
        ) {
            let signer = SigningKeyPair::generate();
            let c = commit(&subject, SubjectKind::Message, &signer, 0).unwrap();
            prop_assert!(verify(&c, &subject, &signer.public_key()));
            if other != subject {
                prop_assert!(!verify(&c, &other, &signer.public_key()));
            }
        }

        #[test]
        fn test_signature_round_trip(
            seed in any::<[u8; 32]>(),
            message in any::<Vec<u8>>(),
        ) {
            let signer = SigningKeyPair::from_secret_bytes(&seed);
            let sig = signer.sign(&message);
            prop_assert!(verify_signature(&signer.public_key(), &message, &sig).is_ok());
        }

        #[test]
        fn test_replay_filter_rejects_every_repeat(
            sequences in proptest::collection::vec(0u64..2048, 1..200),
        ) {
            let mut filter = ReplayFilter::default();
            let mut accepted = std::collections::HashSet::new();
            for seq in sequences {
                if filter.check_and_update(seq).is_ok() {
                    prop_assert!(accepted.insert(seq), "sequence {} accepted twice", seq);
                }
            }
        }

        #[test]
        fn test_content_round_trip(
            key in any::<[u8; 32]>(),
            content in proptest::collection::vec(any::<u8>(), 0..2048),
        ) {
            let key = ContentKey::from_bytes(key);
            let sealed = seal_content(&key, &content).unwrap();
            prop_assert_eq!(open_content(&key, &sealed).unwrap(), content);
        }
    }
}
