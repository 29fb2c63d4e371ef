//! Test harness for PCM core.
//!
//! In-process transports and helpers for wiring two messengers together
//! without a network.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use pcm_crypto::envelope::WireEnvelope;

use crate::config::CoreConfig;
use crate::delivery::DeliveryCoordinator;
use crate::errors::CoreError;
use crate::messenger::Messenger;
use crate::store::{InMemoryPersistence, Persistence, StoreError};
use crate::transport::{Transport, TransportError};
use crate::types::Message;

/// Accepts every envelope and keeps it for inspection.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<WireEnvelope>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove and return everything sent so far.
    pub fn take(&self) -> Vec<WireEnvelope> {
        self.sent
            .lock()
            .map(|mut sent| std::mem::take(&mut *sent))
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.sent.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send(&self, envelope: WireEnvelope) -> Result<(), TransportError> {
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(envelope);
        }
        Ok(())
    }
}

/// Fails every send until switched off.
#[derive(Debug)]
pub struct FailingTransport {
    failing: AtomicBool,
    attempts: AtomicUsize,
    inner: RecordingTransport,
}

impl Default for FailingTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl FailingTransport {
    pub fn new() -> Self {
        Self {
            failing: AtomicBool::new(true),
            attempts: AtomicUsize::new(0),
            inner: RecordingTransport::new(),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Total send attempts, failed or not.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Envelopes that went through while not failing.
    pub fn take(&self) -> Vec<WireEnvelope> {
        self.inner.take()
    }
}

#[async_trait]
impl Transport for FailingTransport {
    async fn send(&self, envelope: WireEnvelope) -> Result<(), TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(TransportError::Unreachable("peer offline".into()));
        }
        self.inner.send(envelope).await
    }
}

/// In-memory store whose writes can be switched off. Keeps the keys of
/// successful writes for inspection.
#[derive(Debug, Default)]
pub struct FlakyPersistence {
    inner: InMemoryPersistence,
    failing: AtomicBool,
    writes: Mutex<Vec<String>>,
}

impl FlakyPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Remove and return the keys written so far, oldest first.
    pub fn take_writes(&self) -> Vec<String> {
        self.writes
            .lock()
            .map(|mut w| std::mem::take(&mut *w))
            .unwrap_or_default()
    }
}

impl Persistence for FlakyPersistence {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.inner.get(key)
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::OperationFailed("disk full".into()));
        }
        self.inner.put(key, value)?;
        if let Ok(mut writes) = self.writes.lock() {
            writes.push(key.to_string());
        }
        Ok(())
    }
}

/// Forwards envelopes into an unbounded channel, as JSON would cross a wire.
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<String>,
}

impl ChannelTransport {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&self, envelope: WireEnvelope) -> Result<(), TransportError> {
        let json = envelope
            .to_json()
            .map_err(|e| TransportError::Rejected(e.to_string()))?;
        self.tx.send(json).map_err(|_| TransportError::Closed)
    }
}

/// Hand every queued envelope to `to`, in order.
pub fn pump(
    rx: &mut mpsc::UnboundedReceiver<String>,
    to: &DeliveryCoordinator,
) -> Vec<Result<Message, CoreError>> {
    let mut out = Vec::new();
    while let Ok(json) = rx.try_recv() {
        out.push(to.receive_json(&json));
    }
    out
}

/// In-memory config for tests.
pub fn test_config() -> CoreConfig {
    CoreConfig::default()
}

/// Two messengers that know each other under `"alice"` and `"bob"`.
pub struct Pair {
    pub alice: Messenger,
    pub bob: Messenger,
    pub to_bob: mpsc::UnboundedReceiver<String>,
    pub to_alice: mpsc::UnboundedReceiver<String>,
}

/// Build a connected pair over channel transports.
pub fn connected_pair(config: &CoreConfig) -> Result<Pair, CoreError> {
    let (alice_out, to_bob) = ChannelTransport::new();
    let (bob_out, to_alice) = ChannelTransport::new();

    let alice_store: Arc<dyn Persistence> = Arc::new(InMemoryPersistence::new());
    let bob_store: Arc<dyn Persistence> = Arc::new(InMemoryPersistence::new());
    let alice = Messenger::with_persistence(config.clone(), alice_store, Arc::new(alice_out))?;
    let bob = Messenger::with_persistence(config.clone(), bob_store, Arc::new(bob_out))?;

    let a = alice.public_bundle()?;
    let b = bob.public_bundle()?;
    alice.add_contact("bob", &b.encryption_public_key, Some(&b.signing_public_key))?;
    bob.add_contact("alice", &a.encryption_public_key, Some(&a.signing_public_key))?;

    Ok(Pair {
        alice,
        bob,
        to_bob,
        to_alice,
    })
}
