//! Contact directory: contact id to public keys.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use pcm_crypto::identity::{decode_public_key, decode_signing_public_key, encode_key, KEY_LEN};

use crate::errors::CoreError;
use crate::store::{load_json, save_json, Persistence};
use crate::types::short_hex;

pub const CONTACTS_KEY: &str = "contacts";

/// A known peer. Without a signing key, its messages decrypt but stay
/// unverified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contact {
    pub id: String,
    pub encryption_public_key: [u8; KEY_LEN],
    pub signing_public_key: Option<[u8; KEY_LEN]>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContactRecord {
    id: String,
    encryption_public_key: String,
    #[serde(default)]
    signing_public_key: Option<String>,
}

impl From<&Contact> for ContactRecord {
    fn from(c: &Contact) -> Self {
        Self {
            id: c.id.clone(),
            encryption_public_key: encode_key(&c.encryption_public_key),
            signing_public_key: c.signing_public_key.map(|k| encode_key(&k)),
        }
    }
}

impl ContactRecord {
    fn into_contact(self) -> Result<Contact, CoreError> {
        Ok(Contact {
            encryption_public_key: decode_public_key(&self.encryption_public_key)?,
            signing_public_key: self
                .signing_public_key
                .as_deref()
                .map(decode_signing_public_key)
                .transpose()?,
            id: self.id,
        })
    }
}

pub struct ContactDirectory {
    store: Arc<dyn Persistence>,
    contacts: RwLock<BTreeMap<String, Contact>>,
}

impl ContactDirectory {
    /// Open the directory, loading any persisted contacts.
    pub fn open(store: Arc<dyn Persistence>) -> Result<Self, CoreError> {
        let mut contacts = BTreeMap::new();
        if let Some(records) = load_json::<Vec<ContactRecord>>(store.as_ref(), CONTACTS_KEY)? {
            for record in records {
                let id = record.id.clone();
                match record.into_contact() {
                    Ok(contact) => {
                        contacts.insert(contact.id.clone(), contact);
                    }
                    Err(e) => warn!("skipping stored contact {}: {}", id, e),
                }
            }
        }
        debug!("loaded {} contacts", contacts.len());
        Ok(Self {
            store,
            contacts: RwLock::new(contacts),
        })
    }

    /// Add or replace a contact from base64 public keys.
    pub fn add_contact(
        &self,
        id: &str,
        encryption_public_key: &str,
        signing_public_key: Option<&str>,
    ) -> Result<Contact, CoreError> {
        let contact = Contact {
            id: id.to_string(),
            encryption_public_key: decode_public_key(encryption_public_key)?,
            signing_public_key: signing_public_key.map(decode_signing_public_key).transpose()?,
        };

        let mut contacts = self.write()?;
        let previous = contacts.insert(contact.id.clone(), contact.clone());
        if let Err(e) = self.persist(&contacts) {
            match previous {
                Some(prev) => contacts.insert(prev.id.clone(), prev),
                None => contacts.remove(id),
            };
            return Err(e);
        }

        debug!(
            "added contact {} (key {}, signing key {})",
            id,
            short_hex(&contact.encryption_public_key),
            contact.signing_public_key.is_some()
        );
        Ok(contact)
    }

    pub fn remove_contact(&self, id: &str) -> Result<Contact, CoreError> {
        let mut contacts = self.write()?;
        let removed = contacts
            .remove(id)
            .ok_or_else(|| CoreError::ContactNotFound(id.to_string()))?;
        if let Err(e) = self.persist(&contacts) {
            contacts.insert(removed.id.clone(), removed);
            return Err(e);
        }
        Ok(removed)
    }

    pub fn lookup(&self, id: &str) -> Result<Contact, CoreError> {
        self.read()?
            .get(id)
            .cloned()
            .ok_or_else(|| CoreError::ContactNotFound(id.to_string()))
    }

    /// All contacts, sorted by id.
    pub fn list(&self) -> Result<Vec<Contact>, CoreError> {
        Ok(self.read()?.values().cloned().collect())
    }

    /// The contact owning `encryption_public_key`, if any.
    pub fn find_by_encryption_key(&self, encryption_public_key: &[u8; KEY_LEN]) -> Option<Contact> {
        self.read()
            .ok()?
            .values()
            .find(|c| &c.encryption_public_key == encryption_public_key)
            .cloned()
    }

    fn persist(&self, contacts: &BTreeMap<String, Contact>) -> Result<(), CoreError> {
        let records: Vec<ContactRecord> = contacts.values().map(ContactRecord::from).collect();
        save_json(self.store.as_ref(), CONTACTS_KEY, &records)?;
        Ok(())
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, BTreeMap<String, Contact>>, CoreError> {
        self.contacts
            .read()
            .map_err(|_| CoreError::PersistenceFailed("contact directory lock poisoned".into()))
    }

    fn write(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, BTreeMap<String, Contact>>, CoreError> {
        self.contacts
            .write()
            .map_err(|_| CoreError::PersistenceFailed("contact directory lock poisoned".into()))
    }
}
