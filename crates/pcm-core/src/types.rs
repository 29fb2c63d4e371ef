//! Shared message types.

use serde::{Deserialize, Serialize};

use pcm_crypto::envelope::WireEnvelope;
use pcm_crypto::identity::KEY_LEN;

/// Text shown in place of a message that could not be decrypted.
pub const UNDECRYPTABLE_PLACEHOLDER: &str = "[undecryptable message]";

/// Delivery status of a stored message.
///
/// Outbound: `Pending` -> `Delivered` | `Failed`; a caller retry moves
/// `Failed` -> `Sent` while the transport is in flight. Inbound messages are
/// always `Received`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Pending,
    Sent,
    Delivered,
    Failed,
    Received,
}

impl MessageStatus {
    /// True once no further transition is expected.
    pub fn is_final(&self) -> bool {
        matches!(self, MessageStatus::Delivered | MessageStatus::Received)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Outbound,
    Inbound,
}

/// A stored message. `plaintext` never leaves the local device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub direction: Direction,
    /// Local contact id of the other party, when known.
    pub contact_id: Option<String>,
    /// Sender encryption public key, base64.
    pub from: String,
    /// Recipient encryption public key, base64.
    pub to: String,
    /// `None` for inbound envelopes that failed to decrypt.
    pub plaintext: Option<String>,
    pub envelope: WireEnvelope,
    /// Unix milliseconds.
    pub timestamp: u64,
    pub sequence: u64,
    pub status: MessageStatus,
    pub verified: bool,
}

impl Message {
    pub fn is_undecryptable(&self) -> bool {
        self.plaintext.is_none()
    }

    /// Text for display, with a placeholder for undecryptable messages.
    pub fn display_text(&self) -> &str {
        self.plaintext.as_deref().unwrap_or(UNDECRYPTABLE_PLACEHOLDER)
    }
}

/// Conversation id: both encryption public keys as lowercase hex, sorted,
/// joined with `-`. Symmetric in its arguments.
pub fn conversation_id(a: &[u8; KEY_LEN], b: &[u8; KEY_LEN]) -> String {
    let (a, b) = (hex::encode(a), hex::encode(b));
    if a <= b {
        format!("{}-{}", a, b)
    } else {
        format!("{}-{}", b, a)
    }
}

/// Fresh UUID v4 message id.
pub fn new_message_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Current Unix time in milliseconds.
pub fn now_millis() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
}

/// First 8 hex characters of a key, for logs.
pub(crate) fn short_hex(bytes: &[u8]) -> String {
    let mut s = hex::encode(bytes);
    s.truncate(8);
    s
}
