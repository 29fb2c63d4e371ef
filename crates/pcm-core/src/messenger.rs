//! One local profile, wired together from a [`CoreConfig`].

use std::sync::Arc;

use tracing::info;

use pcm_crypto::content::{open_content, seal_content, SealedContent};
use pcm_crypto::envelope::WireEnvelope;

use crate::config::CoreConfig;
use crate::contacts::{Contact, ContactDirectory};
use crate::conversation::ConversationStore;
use crate::delivery::{DeliveryCoordinator, DeliveryEvent, DeliveryStatsSnapshot};
use crate::errors::CoreError;
use crate::keys::{KeyManager, LocalIdentity, PublicBundle};
use crate::store::Persistence;
use crate::transport::Transport;
use crate::types::{conversation_id, Message};

pub struct Messenger {
    config: CoreConfig,
    keys: Arc<KeyManager>,
    contacts: Arc<ContactDirectory>,
    conversations: Arc<ConversationStore>,
    delivery: DeliveryCoordinator,
}

impl Messenger {
    /// Open the profile described by `config`.
    pub fn open(config: CoreConfig, transport: Arc<dyn Transport>) -> Result<Self, CoreError> {
        let store = config.open_persistence()?;
        Self::with_persistence(config, store, transport)
    }

    /// Open over an explicit backend. The backend is used as is; `config.namespace`
    /// is not applied.
    pub fn with_persistence(
        config: CoreConfig,
        store: Arc<dyn Persistence>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, CoreError> {
        config.validate()?;

        let keys = Arc::new(KeyManager::new(store.clone(), config.allow_key_regeneration));
        let identity = keys.get_or_create_identity()?;
        let contacts = Arc::new(ContactDirectory::open(store.clone())?);
        let conversations = Arc::new(ConversationStore::open(store.clone())?);
        let delivery = DeliveryCoordinator::new(
            keys.clone(),
            contacts.clone(),
            conversations.clone(),
            transport,
            store,
            &config,
        )?;

        info!(
            "messenger profile {} ready (anonymous id {})",
            config.namespace, identity.anonymous_id
        );
        Ok(Self {
            config,
            keys,
            contacts,
            conversations,
            delivery,
        })
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn keys(&self) -> &Arc<KeyManager> {
        &self.keys
    }

    pub fn contacts(&self) -> &Arc<ContactDirectory> {
        &self.contacts
    }

    pub fn conversations(&self) -> &Arc<ConversationStore> {
        &self.conversations
    }

    pub fn delivery(&self) -> &DeliveryCoordinator {
        &self.delivery
    }

    pub fn identity(&self) -> Result<Arc<LocalIdentity>, CoreError> {
        self.keys.get_or_create_identity()
    }

    pub fn public_bundle(&self) -> Result<PublicBundle, CoreError> {
        self.keys.public_bundle()
    }

    pub fn add_contact(
        &self,
        id: &str,
        encryption_public_key: &str,
        signing_public_key: Option<&str>,
    ) -> Result<Contact, CoreError> {
        self.contacts.add_contact(id, encryption_public_key, signing_public_key)
    }

    pub async fn send(&self, contact_id: &str, text: &str) -> Result<Message, CoreError> {
        self.delivery.send(contact_id, text).await
    }

    pub fn receive(&self, envelope: WireEnvelope) -> Result<Message, CoreError> {
        self.delivery.receive(envelope)
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<DeliveryEvent> {
        self.delivery.subscribe()
    }

    pub fn stats(&self) -> DeliveryStatsSnapshot {
        self.delivery.stats()
    }

    /// Conversation id shared with `contact_id`.
    pub fn conversation_id_with(&self, contact_id: &str) -> Result<String, CoreError> {
        let contact = self.contacts.lookup(contact_id)?;
        let identity = self.identity()?;
        Ok(conversation_id(&identity.encryption_public(), &contact.encryption_public_key))
    }

    /// Messages exchanged with `contact_id`, oldest first.
    pub fn conversation_with(&self, contact_id: &str) -> Result<Vec<Message>, CoreError> {
        self.conversations.list(&self.conversation_id_with(contact_id)?)
    }

    /// Seal a blob for storage outside this device.
    pub fn seal_content(&self, content: &[u8]) -> Result<SealedContent, CoreError> {
        let key = self.keys.get_or_create_content_key()?;
        seal_content(&key, content).map_err(|e| CoreError::EncryptionFailed(e.to_string()))
    }

    pub fn open_content(&self, sealed: &SealedContent) -> Result<Vec<u8>, CoreError> {
        let key = self.keys.get_or_create_content_key()?;
        open_content(&key, sealed).map_err(|e| CoreError::InvalidEnvelope(e.to_string()))
    }
}
