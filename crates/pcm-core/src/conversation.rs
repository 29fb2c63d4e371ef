//! Append-only, per-conversation message logs.
//!
//! Storage layout:
//! - `conversations/index`: sorted conversation ids
//! - `conversations/<id>/index`: message ids in log order
//! - `conversations/<id>/<n>`: the message at position `n`
//!
//! A status change rewrites only the affected message record. Every mutation
//! is written through before returning; if the write fails the in-memory
//! change is undone so memory and storage agree.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, warn};

use crate::errors::CoreError;
use crate::store::{load_json, save_json, Persistence};
use crate::types::{Message, MessageStatus};

pub const CONVERSATION_INDEX_KEY: &str = "conversations/index";

fn message_index_key(conversation_id: &str) -> String {
    format!("conversations/{}/index", conversation_id)
}

fn message_key(conversation_id: &str, position: usize) -> String {
    format!("conversations/{}/{}", conversation_id, position)
}

#[derive(Default)]
struct Logs {
    by_conversation: HashMap<String, Vec<Message>>,
    /// message id -> (conversation id, position)
    locator: HashMap<String, (String, usize)>,
}

pub struct ConversationStore {
    store: Arc<dyn Persistence>,
    logs: Mutex<Logs>,
}

impl ConversationStore {
    /// Open the store, loading every indexed conversation.
    pub fn open(store: Arc<dyn Persistence>) -> Result<Self, CoreError> {
        let mut logs = Logs::default();
        let index: Vec<String> =
            load_json(store.as_ref(), CONVERSATION_INDEX_KEY)?.unwrap_or_default();
        for conversation_id in index {
            let ids: Vec<String> =
                load_json(store.as_ref(), &message_index_key(&conversation_id))?
                    .unwrap_or_default();
            let mut messages = Vec::with_capacity(ids.len());
            for (position, id) in ids.iter().enumerate() {
                let key = message_key(&conversation_id, position);
                let message: Message = load_json(store.as_ref(), &key)?.ok_or_else(|| {
                    CoreError::PersistenceFailed(format!("missing record {}", key))
                })?;
                if &message.id != id {
                    return Err(CoreError::PersistenceFailed(format!(
                        "record {} holds {}, index says {}",
                        key, message.id, id
                    )));
                }
                logs.locator
                    .insert(message.id.clone(), (conversation_id.clone(), position));
                messages.push(message);
            }
            logs.by_conversation.insert(conversation_id, messages);
        }
        debug!(
            "loaded {} conversations ({} messages)",
            logs.by_conversation.len(),
            logs.locator.len()
        );
        Ok(Self {
            store,
            logs: Mutex::new(logs),
        })
    }

    /// Append `message` to the end of `conversation_id`'s log.
    pub fn append(&self, conversation_id: &str, message: Message) -> Result<(), CoreError> {
        if message.conversation_id != conversation_id {
            return Err(CoreError::InvalidEnvelope(format!(
                "message {} belongs to conversation {}",
                message.id, message.conversation_id
            )));
        }

        let mut logs = self.lock()?;
        if logs.locator.contains_key(&message.id) {
            return Err(CoreError::DuplicateMessage {
                message_id: message.id,
            });
        }

        let is_new = !logs.by_conversation.contains_key(conversation_id);
        let position = logs
            .by_conversation
            .get(conversation_id)
            .map(Vec::len)
            .unwrap_or(0);

        // record, then its conversation's index, then the conversation index:
        // anything not yet indexed is never loaded
        save_json(
            self.store.as_ref(),
            &message_key(conversation_id, position),
            &message,
        )?;

        let message_id = message.id.clone();
        logs.by_conversation
            .entry(conversation_id.to_string())
            .or_default()
            .push(message);

        let mut written = self.persist_message_index(&logs, conversation_id);
        if is_new && written.is_ok() {
            written = self.persist_index(&logs);
        }

        if let Err(e) = written {
            if is_new {
                logs.by_conversation.remove(conversation_id);
            } else if let Some(log) = logs.by_conversation.get_mut(conversation_id) {
                log.pop();
            }
            return Err(e);
        }

        logs.locator
            .insert(message_id, (conversation_id.to_string(), position));
        Ok(())
    }

    /// Messages of a conversation in insertion order.
    pub fn list(&self, conversation_id: &str) -> Result<Vec<Message>, CoreError> {
        Ok(self
            .lock()?
            .by_conversation
            .get(conversation_id)
            .cloned()
            .unwrap_or_default())
    }

    pub fn get(&self, message_id: &str) -> Result<Option<Message>, CoreError> {
        let logs = self.lock()?;
        Ok(logs
            .locator
            .get(message_id)
            .and_then(|(conv, position)| logs.by_conversation.get(conv)?.get(*position))
            .cloned())
    }

    /// Known conversation ids, sorted.
    pub fn conversations(&self) -> Result<Vec<String>, CoreError> {
        let logs = self.lock()?;
        let ids: BTreeSet<&String> = logs.by_conversation.keys().collect();
        Ok(ids.into_iter().cloned().collect())
    }

    /// Set the delivery status. Unknown ids are logged and ignored.
    pub fn update_status(&self, message_id: &str, status: MessageStatus) -> Result<(), CoreError> {
        self.mutate(message_id, |m| m.status = status)
    }

    /// Set the verified flag. Unknown ids are logged and ignored.
    pub fn set_verified(&self, message_id: &str, verified: bool) -> Result<(), CoreError> {
        self.mutate(message_id, |m| m.verified = verified)
    }

    fn mutate(&self, message_id: &str, change: impl FnOnce(&mut Message)) -> Result<(), CoreError> {
        let mut logs = self.lock()?;
        let (conversation_id, position) = match logs.locator.get(message_id) {
            Some(found) => found.clone(),
            None => {
                warn!("update for unknown message {} ignored", message_id);
                return Ok(());
            }
        };

        let Some(slot) = logs
            .by_conversation
            .get_mut(&conversation_id)
            .and_then(|log| log.get_mut(position))
        else {
            warn!("message {} missing from conversation {}", message_id, conversation_id);
            return Ok(());
        };

        let mut updated = slot.clone();
        change(&mut updated);
        if updated == *slot {
            return Ok(());
        }

        save_json(
            self.store.as_ref(),
            &message_key(&conversation_id, position),
            &updated,
        )?;
        *slot = updated;
        Ok(())
    }

    fn persist_message_index(&self, logs: &Logs, conversation_id: &str) -> Result<(), CoreError> {
        let ids: Vec<&str> = logs
            .by_conversation
            .get(conversation_id)
            .map(|log| log.iter().map(|m| m.id.as_str()).collect())
            .unwrap_or_default();
        save_json(self.store.as_ref(), &message_index_key(conversation_id), &ids)?;
        Ok(())
    }

    fn persist_index(&self, logs: &Logs) -> Result<(), CoreError> {
        let ids: BTreeSet<&String> = logs.by_conversation.keys().collect();
        save_json(self.store.as_ref(), CONVERSATION_INDEX_KEY, &ids)?;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Logs>, CoreError> {
        self.logs
            .lock()
            .map_err(|_| CoreError::PersistenceFailed("conversation store lock poisoned".into()))
    }
}
