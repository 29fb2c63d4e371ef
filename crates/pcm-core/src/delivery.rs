//! Delivery coordination.
//!
//! Outbound: look up the contact, allocate a sequence number, encrypt, attach
//! a send commitment, persist as `pending`, then hand the wire envelope to the
//! transport and record `delivered` or `failed`.
//!
//! Inbound: decode, resolve the sender's signing key, decrypt, persist as
//! `received` and notify subscribers. Envelopes that fail to decrypt are kept
//! with no plaintext so the conversation can show a placeholder.
//!
//! Work on one conversation is serialized by a per-conversation mutex that is
//! never held across an `.await`. The transport call itself runs in a spawned
//! task which records the outcome, so dropping a `send` future does not leave
//! a message stuck in `pending`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use pcm_crypto::codec::{
    decrypt_message, encrypt_message, verify_envelope, CiphertextEnvelope, CodecError, Layer,
    MessageHeader,
};
use pcm_crypto::commitment::{
    self, commit, commit_query, message_subject, Commitment, SubjectKind,
};
use pcm_crypto::envelope::WireEnvelope;
use pcm_crypto::hash::sha256;
use pcm_crypto::identity::{encode_key, KEY_LEN};
use pcm_crypto::replay::{DigestWindow, MonotonicCounter, ReplayError, ReplayFilter};

use crate::config::CoreConfig;
use crate::contacts::ContactDirectory;
use crate::conversation::ConversationStore;
use crate::errors::CoreError;
use crate::keys::KeyManager;
use crate::store::{load_json, save_json, Persistence};
use crate::transport::Transport;
use crate::types::{
    conversation_id, new_message_id, now_millis, short_hex, Direction, Message, MessageStatus,
};

/// Persistence key of the last allocated outbound sequence number.
pub const SEQUENCE_KEY: &str = "delivery/sequence";

// ============================================================================
// Events and Statistics
// ============================================================================

/// Notifications published to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryEvent {
    StatusChanged {
        message_id: String,
        conversation_id: String,
        status: MessageStatus,
    },
    /// Inbound message stored and ready to show.
    Received(Message),
    /// Inbound message stored, but its signature could not be checked.
    /// Only emitted with `quarantine_unverified`.
    Unverified(Message),
    /// Inbound envelope stored without plaintext.
    Undecryptable { message: Message, layer: Layer },
    /// A status change could not be written.
    PersistenceFailed { message_id: String, reason: String },
}

/// Delivery statistics.
#[derive(Debug, Default)]
pub struct DeliveryStats {
    /// Outbound messages persisted
    pub sent: AtomicU64,
    /// Outbound messages accepted by the transport
    pub delivered: AtomicU64,
    /// Outbound transport failures
    pub failed: AtomicU64,
    /// Caller-initiated retries
    pub retried: AtomicU64,
    /// Inbound messages stored with plaintext
    pub received: AtomicU64,
    /// Inbound messages whose signature was unknown or invalid
    pub unverified: AtomicU64,
    /// Inbound messages that failed to decrypt
    pub undecryptable: AtomicU64,
    /// Inbound messages refused by the replay window
    pub replays_rejected: AtomicU64,
}

impl DeliveryStats {
    pub fn snapshot(&self) -> DeliveryStatsSnapshot {
        DeliveryStatsSnapshot {
            sent: self.sent.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            unverified: self.unverified.load(Ordering::Relaxed),
            undecryptable: self.undecryptable.load(Ordering::Relaxed),
            replays_rejected: self.replays_rejected.load(Ordering::Relaxed),
        }
    }

    /// Reset all statistics to zero.
    pub fn reset(&self) {
        for counter in [
            &self.sent,
            &self.delivered,
            &self.failed,
            &self.retried,
            &self.received,
            &self.unverified,
            &self.undecryptable,
            &self.replays_rejected,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time copy of [`DeliveryStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryStatsSnapshot {
    pub sent: u64,
    pub delivered: u64,
    pub failed: u64,
    pub retried: u64,
    pub received: u64,
    pub unverified: u64,
    pub undecryptable: u64,
    pub replays_rejected: u64,
}

// ============================================================================
// Coordinator
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct Options {
    quarantine_unverified: bool,
    enforce_sequence: bool,
    replay_window: usize,
}

struct Inner {
    keys: Arc<KeyManager>,
    contacts: Arc<ContactDirectory>,
    conversations: Arc<ConversationStore>,
    transport: Arc<dyn Transport>,
    store: Arc<dyn Persistence>,
    options: Options,
    sequence: MonotonicCounter,
    sequence_write: Mutex<()>,
    conversation_locks: DashMap<String, Arc<Mutex<()>>>,
    replay: DashMap<[u8; KEY_LEN], SenderWindow>,
    events: broadcast::Sender<DeliveryEvent>,
    stats: DeliveryStats,
}

/// Replay state for one sender.
///
/// The sequence number is not covered by the signature, so ciphertext
/// digests are tracked too: a replay must reuse the exact ciphertext bytes,
/// or it fails to decrypt.
#[derive(Debug)]
struct SenderWindow {
    sequences: ReplayFilter,
    ciphertexts: DigestWindow,
}

impl SenderWindow {
    fn new(window: usize) -> Self {
        Self {
            sequences: ReplayFilter::new(window),
            ciphertexts: DigestWindow::new(window),
        }
    }

    fn check(&self, sequence: u64, digest: &[u8; 32]) -> Result<(), ReplayError> {
        self.ciphertexts.check(digest)?;
        self.sequences.check(sequence)
    }

    fn record(&mut self, sequence: u64, digest: [u8; 32]) {
        self.sequences.record(sequence);
        self.ciphertexts.record(digest);
    }
}

/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct DeliveryCoordinator {
    inner: Arc<Inner>,
}

impl DeliveryCoordinator {
    pub fn new(
        keys: Arc<KeyManager>,
        contacts: Arc<ContactDirectory>,
        conversations: Arc<ConversationStore>,
        transport: Arc<dyn Transport>,
        store: Arc<dyn Persistence>,
        config: &CoreConfig,
    ) -> Result<Self, CoreError> {
        let last_sequence = load_json::<u64>(store.as_ref(), SEQUENCE_KEY)?.unwrap_or(0);
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        debug!("delivery coordinator starting at sequence {}", last_sequence);

        Ok(Self {
            inner: Arc::new(Inner {
                keys,
                contacts,
                conversations,
                transport,
                store,
                options: Options {
                    quarantine_unverified: config.quarantine_unverified,
                    enforce_sequence: config.enforce_sequence,
                    replay_window: config.replay_window,
                },
                sequence: MonotonicCounter::new(last_sequence),
                sequence_write: Mutex::new(()),
                conversation_locks: DashMap::new(),
                replay: DashMap::new(),
                events,
                stats: DeliveryStats::default(),
            }),
        })
    }

    /// Subscribe to delivery events.
    pub fn subscribe(&self) -> broadcast::Receiver<DeliveryEvent> {
        self.inner.events.subscribe()
    }

    pub fn stats(&self) -> DeliveryStatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Encrypt and send `text` to a contact.
    ///
    /// Returns the stored message with its final status. Once the message is
    /// persisted, transport failure is reported as `status == Failed`, not as
    /// an error.
    pub async fn send(&self, contact_id: &str, text: &str) -> Result<Message, CoreError> {
        let message_id = new_message_id();
        let mut message = match self.inner.prepare_outbound(&message_id, contact_id, text) {
            Ok(message) => message,
            Err(CoreError::PersistenceFailed(reason)) => {
                warn!("message {} not stored: {}", message_id, reason);
                self.inner.emit(DeliveryEvent::PersistenceFailed {
                    message_id,
                    reason: reason.clone(),
                });
                return Err(CoreError::PersistenceFailed(reason));
            }
            Err(e) => return Err(e),
        };
        let status = self.inner.clone().spawn_delivery(&message).await;
        message.status = status;
        Ok(message)
    }

    /// Hand a failed outbound message to the transport again.
    pub async fn retry(&self, message_id: &str) -> Result<Message, CoreError> {
        let mut message = self
            .inner
            .conversations
            .get(message_id)?
            .ok_or_else(|| CoreError::MessageNotFound(message_id.to_string()))?;
        if message.direction != Direction::Outbound || message.status != MessageStatus::Failed {
            return Err(CoreError::NotRetryable {
                message_id: message.id,
                status: message.status,
            });
        }

        DeliveryStats::inc(&self.inner.stats.retried);
        self.inner.conversations.update_status(message_id, MessageStatus::Sent)?;
        self.inner.emit_status(&message, MessageStatus::Sent);
        info!("retrying message {}", message_id);

        let status = self.inner.clone().spawn_delivery(&message).await;
        message.status = status;
        Ok(message)
    }

    /// Accept an inbound envelope.
    ///
    /// Undecryptable envelopes are stored and returned with `plaintext ==
    /// None`; they are not an error.
    pub fn receive(&self, wire: WireEnvelope) -> Result<Message, CoreError> {
        self.inner.receive(wire)
    }

    /// Parse and accept a JSON wire envelope.
    pub fn receive_json(&self, json: &str) -> Result<Message, CoreError> {
        self.inner.receive(WireEnvelope::from_json(json)?)
    }

    /// Commitment to a search query, signed by the local identity.
    pub fn commit_query(&self, query: &str) -> Result<Commitment, CoreError> {
        let identity = self.inner.keys.get_or_create_identity()?;
        Ok(commit_query(query, identity.signing_keys(), now_millis())?)
    }

    /// Check that `contact_id` signed a commitment to `claimed_subject`.
    pub fn verify_proof(
        &self,
        contact_id: &str,
        proof: &Commitment,
        claimed_subject: &[u8],
    ) -> Result<(), CoreError> {
        let contact = self.inner.contacts.lookup(contact_id)?;
        let signing = contact.signing_public_key.ok_or_else(|| {
            warn!("contact {} has no signing key; proof cannot be checked", contact_id);
            CoreError::SignatureInvalid
        })?;
        if commitment::verify(proof, claimed_subject, &signing) {
            Ok(())
        } else {
            Err(CoreError::SignatureInvalid)
        }
    }
}

impl Inner {
    fn conversation_lock(&self, conversation_id: &str) -> Arc<Mutex<()>> {
        self.conversation_locks
            .entry(conversation_id.to_string())
            .or_default()
            .value()
            .clone()
    }

    fn next_sequence(&self) -> Result<u64, CoreError> {
        let _write = self
            .sequence_write
            .lock()
            .map_err(|_| CoreError::PersistenceFailed("sequence lock poisoned".into()))?;
        let sequence = self.sequence.increment();
        save_json(self.store.as_ref(), SEQUENCE_KEY, &self.sequence.current())?;
        Ok(sequence)
    }

    fn emit(&self, event: DeliveryEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    fn emit_status(&self, message: &Message, status: MessageStatus) {
        self.emit(DeliveryEvent::StatusChanged {
            message_id: message.id.clone(),
            conversation_id: message.conversation_id.clone(),
            status,
        });
    }

    /// Everything up to and including the `pending` write.
    fn prepare_outbound(
        &self,
        message_id: &str,
        contact_id: &str,
        text: &str,
    ) -> Result<Message, CoreError> {
        let contact = self.contacts.lookup(contact_id)?;
        let identity = self.keys.get_or_create_identity()?;
        let local_public = identity.encryption_public();
        let conversation_id = conversation_id(&local_public, &contact.encryption_public_key);

        let lock = self.conversation_lock(&conversation_id);
        let _guard = lock
            .lock()
            .map_err(|_| CoreError::PersistenceFailed("conversation lock poisoned".into()))?;

        let header = MessageHeader {
            message_id: message_id.to_string(),
            timestamp: now_millis(),
            sequence: self.next_sequence()?,
        };
        let envelope = encrypt_message(
            text.as_bytes(),
            &header,
            identity.encryption_keys(),
            identity.signing_keys(),
            &contact.encryption_public_key,
        )?;
        let proof = commit(
            &message_subject(&header.message_id, &conversation_id),
            SubjectKind::Message,
            identity.signing_keys(),
            header.timestamp,
        )?;

        let message = Message {
            id: header.message_id.clone(),
            conversation_id: conversation_id.clone(),
            direction: Direction::Outbound,
            contact_id: Some(contact.id.clone()),
            from: encode_key(&local_public),
            to: encode_key(&contact.encryption_public_key),
            plaintext: Some(text.to_string()),
            envelope: WireEnvelope::new(&envelope, Some(&proof), &conversation_id),
            timestamp: header.timestamp,
            sequence: header.sequence,
            status: MessageStatus::Pending,
            verified: true,
        };
        self.conversations.append(&conversation_id, message.clone())?;

        DeliveryStats::inc(&self.stats.sent);
        self.emit_status(&message, MessageStatus::Pending);
        debug!(
            "queued message {} to {} (seq {})",
            message.id, contact.id, message.sequence
        );
        Ok(message)
    }

    /// Run the transport call in its own task and wait for the outcome.
    async fn spawn_delivery(self: Arc<Self>, message: &Message) -> MessageStatus {
        let handle: JoinHandle<MessageStatus> =
            tokio::spawn(self.clone().deliver(message.clone()));
        match handle.await {
            Ok(status) => status,
            Err(e) => {
                warn!("delivery task for {} ended abnormally: {}", message.id, e);
                self.conversations
                    .get(&message.id)
                    .ok()
                    .flatten()
                    .map(|m| m.status)
                    .unwrap_or(MessageStatus::Failed)
            }
        }
    }

    async fn deliver(self: Arc<Self>, message: Message) -> MessageStatus {
        let status = match self.transport.send(message.envelope.clone()).await {
            Ok(()) => {
                DeliveryStats::inc(&self.stats.delivered);
                debug!("message {} delivered", message.id);
                MessageStatus::Delivered
            }
            Err(e) => {
                DeliveryStats::inc(&self.stats.failed);
                warn!("message {} failed: {}", message.id, e);
                MessageStatus::Failed
            }
        };

        if let Err(e) = self.conversations.update_status(&message.id, status) {
            warn!("could not record status of {}: {}", message.id, e);
            self.emit(DeliveryEvent::PersistenceFailed {
                message_id: message.id.clone(),
                reason: e.to_string(),
            });
        } else {
            self.emit_status(&message, status);
        }
        status
    }

    fn receive(&self, wire: WireEnvelope) -> Result<Message, CoreError> {
        let identity = self.keys.get_or_create_identity()?;
        let envelope = wire.to_ciphertext()?;
        let local_public = identity.encryption_public();
        if envelope.to != local_public {
            return Err(CoreError::InvalidEnvelope(format!(
                "addressed to {}, not this identity",
                short_hex(&envelope.to)
            )));
        }

        let conversation_id = conversation_id(&local_public, &envelope.from);
        if wire.conversation_id != conversation_id {
            warn!(
                "envelope {} names conversation {}, using {}",
                envelope.message_id, wire.conversation_id, conversation_id
            );
        }

        let contact = self.contacts.find_by_encryption_key(&envelope.from);
        let signing = contact.as_ref().and_then(|c| c.signing_public_key);
        if contact.is_none() {
            debug!(
                "message {} from unknown sender {}",
                envelope.message_id,
                short_hex(&envelope.from)
            );
        }

        let lock = self.conversation_lock(&conversation_id);
        let _guard = lock
            .lock()
            .map_err(|_| CoreError::PersistenceFailed("conversation lock poisoned".into()))?;

        if self.conversations.get(&envelope.message_id)?.is_some() {
            return Err(CoreError::DuplicateMessage {
                message_id: envelope.message_id,
            });
        }

        let opened = decrypt_message(&envelope, identity.encryption_keys(), signing.as_ref());
        let (plaintext, verified, failed_layer) = match opened {
            Ok(decrypted) => {
                self.check_replay(&envelope)?;
                let verified = decrypted.verified
                    && self.proof_holds(
                        &wire,
                        &envelope.message_id,
                        &conversation_id,
                        signing.as_ref(),
                    );
                let text = String::from_utf8_lossy(&decrypted.plaintext).into_owned();
                (Some(text), verified, None)
            }
            Err(CodecError::DecryptFailed(layer)) => {
                let verified = signing
                    .map(|key| verify_envelope(&envelope, &key))
                    .unwrap_or(false);
                warn!(
                    "message {} from {} undecryptable at {}",
                    envelope.message_id,
                    short_hex(&envelope.from),
                    layer
                );
                (None, verified, Some(layer))
            }
            Err(other) => return Err(other.into()),
        };

        let message = Message {
            id: envelope.message_id.clone(),
            conversation_id: conversation_id.clone(),
            direction: Direction::Inbound,
            contact_id: contact.map(|c| c.id),
            from: encode_key(&envelope.from),
            to: encode_key(&envelope.to),
            plaintext,
            envelope: wire,
            timestamp: envelope.timestamp,
            sequence: envelope.sequence,
            status: MessageStatus::Received,
            verified,
        };

        if let Err(e) = self.conversations.append(&conversation_id, message.clone()) {
            self.emit(DeliveryEvent::PersistenceFailed {
                message_id: message.id.clone(),
                reason: e.to_string(),
            });
            return Err(e);
        }

        if let Some(layer) = failed_layer {
            DeliveryStats::inc(&self.stats.undecryptable);
            self.emit(DeliveryEvent::Undecryptable {
                message: message.clone(),
                layer,
            });
            return Ok(message);
        }
        self.record_replay(&envelope);

        DeliveryStats::inc(&self.stats.received);
        if !verified {
            DeliveryStats::inc(&self.stats.unverified);
        }
        if !verified && self.options.quarantine_unverified {
            debug!("message {} held as unverified", message.id);
            self.emit(DeliveryEvent::Unverified(message.clone()));
        } else {
            self.emit(DeliveryEvent::Received(message.clone()));
        }
        Ok(message)
    }

    /// Refuse a sequence or ciphertext already seen from this sender. Nothing
    /// is recorded until `record_replay`.
    fn check_replay(&self, envelope: &CiphertextEnvelope) -> Result<(), CoreError> {
        if !self.options.enforce_sequence {
            return Ok(());
        }
        let Some(window) = self.replay.get(&envelope.from) else {
            return Ok(());
        };
        let digest = sha256(&envelope.encrypted_message);
        if let Err(e) = window.check(envelope.sequence, &digest) {
            DeliveryStats::inc(&self.stats.replays_rejected);
            warn!(
                "rejected message {} (seq {}) from {}: {}",
                envelope.message_id,
                envelope.sequence,
                short_hex(&envelope.from),
                e
            );
            return Err(e.into());
        }
        Ok(())
    }

    fn record_replay(&self, envelope: &CiphertextEnvelope) {
        if !self.options.enforce_sequence {
            return;
        }
        let size = self.options.replay_window;
        self.replay
            .entry(envelope.from)
            .or_insert_with(|| SenderWindow::new(size))
            .record(envelope.sequence, sha256(&envelope.encrypted_message));
    }

    /// An attached send proof must open to `message_id || conversation_id`
    /// under the sender's signing key. A missing proof is not held against
    /// the message.
    fn proof_holds(
        &self,
        wire: &WireEnvelope,
        message_id: &str,
        conversation_id: &str,
        signing: Option<&[u8; KEY_LEN]>,
    ) -> bool {
        let (Some(signing), Some(_)) = (signing, wire.zk_proof.as_ref()) else {
            return true;
        };
        match wire.proof() {
            Ok(Some(proof)) => {
                proof.subject_kind == SubjectKind::Message
                    && commitment::verify(
                        &proof,
                        &message_subject(message_id, conversation_id),
                        signing,
                    )
            }
            Ok(None) => true,
            Err(e) => {
                warn!("message {} carries a malformed proof: {}", message_id, e);
                false
            }
        }
    }
}
