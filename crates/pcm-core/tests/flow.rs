//! End-to-end message flow between two in-process messengers.

use pcm_core::delivery::DeliveryEvent;
use pcm_core::harness::{connected_pair, pump, test_config};
use pcm_core::types::MessageStatus;
use pcm_crypto::codec::verify_envelope;
use pcm_crypto::envelope::WireEnvelope;

#[tokio::test]
async fn test_alice_to_bob() {
    let mut pair = connected_pair(&test_config()).expect("pair");
    let mut alice_events = pair.alice.subscribe();

    let sent = pair.alice.send("bob", "hello").await.unwrap();
    assert_eq!(sent.status, MessageStatus::Delivered);

    let log = pair.alice.conversation_with("bob").unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].id, sent.id);
    assert_eq!(log[0].status, MessageStatus::Delivered);

    let statuses: Vec<MessageStatus> = std::iter::from_fn(|| alice_events.try_recv().ok())
        .filter_map(|e| match e {
            DeliveryEvent::StatusChanged { status, .. } => Some(status),
            _ => None,
        })
        .collect();
    assert_eq!(statuses, vec![MessageStatus::Pending, MessageStatus::Delivered]);

    // addressed to Bob and signed by Alice
    let json = pair.to_bob.try_recv().unwrap();
    let ciphertext = WireEnvelope::from_json(&json).unwrap().to_ciphertext().unwrap();
    let bob_identity = pair.bob.identity().unwrap();
    let alice_identity = pair.alice.identity().unwrap();
    assert_eq!(ciphertext.to, bob_identity.encryption_public());
    assert_eq!(ciphertext.from, alice_identity.encryption_public());
    assert!(verify_envelope(&ciphertext, &alice_identity.signing_public()));

    let received = pair.bob.delivery().receive_json(&json).unwrap();
    assert_eq!(received.plaintext.as_deref(), Some("hello"));
    assert!(received.verified);
    assert_eq!(received.status, MessageStatus::Received);
    assert_eq!(received.contact_id.as_deref(), Some("alice"));
    assert_eq!(
        pair.alice.conversation_id_with("bob").unwrap(),
        pair.bob.conversation_id_with("alice").unwrap()
    );
}

#[tokio::test]
async fn test_conversation_round_trip() {
    let mut pair = connected_pair(&test_config()).unwrap();
    let mut bob_events = pair.bob.subscribe();

    pair.alice.send("bob", "ping").await.unwrap();
    pair.alice.send("bob", "are you there?").await.unwrap();
    for result in pump(&mut pair.to_bob, pair.bob.delivery()) {
        assert!(result.unwrap().verified);
    }
    pair.bob.send("alice", "pong").await.unwrap();
    pump(&mut pair.to_alice, pair.alice.delivery());

    let alice_view: Vec<String> = pair
        .alice
        .conversation_with("bob")
        .unwrap()
        .iter()
        .map(|m| m.display_text().to_string())
        .collect();
    let bob_view: Vec<String> = pair
        .bob
        .conversation_with("alice")
        .unwrap()
        .iter()
        .map(|m| m.display_text().to_string())
        .collect();
    assert_eq!(alice_view, vec!["ping", "are you there?", "pong"]);
    assert_eq!(bob_view, alice_view);

    let received: Vec<String> = std::iter::from_fn(|| bob_events.try_recv().ok())
        .filter_map(|e| match e {
            DeliveryEvent::Received(m) => m.plaintext,
            _ => None,
        })
        .collect();
    assert_eq!(received, vec!["ping", "are you there?"]);
}

#[tokio::test]
async fn test_tampered_envelope_shows_placeholder() {
    let mut pair = connected_pair(&test_config()).unwrap();
    let mut bob_events = pair.bob.subscribe();

    pair.alice.send("bob", "secret").await.unwrap();
    let mut wire = WireEnvelope::from_json(&pair.to_bob.try_recv().unwrap()).unwrap();
    // flip one byte of the outer ciphertext
    let mut raw = {
        use base64::Engine as _;
        base64::engine::general_purpose::STANDARD
            .decode(&wire.encrypted_message)
            .unwrap()
    };
    raw[0] ^= 0x80;
    wire.encrypted_message = {
        use base64::Engine as _;
        base64::engine::general_purpose::STANDARD.encode(&raw)
    };

    let stored = pair.bob.receive(wire).unwrap();
    assert!(stored.is_undecryptable());
    assert!(!stored.verified);
    assert_eq!(stored.display_text(), "[undecryptable message]");
    assert_eq!(pair.bob.stats().undecryptable, 1);
    assert!(matches!(
        bob_events.try_recv().unwrap(),
        DeliveryEvent::Undecryptable { .. }
    ));
    assert_eq!(pair.bob.conversation_with("alice").unwrap().len(), 1);
}
