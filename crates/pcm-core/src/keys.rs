//! Local identity and key management.
//!
//! `KeyManager` exclusively owns the device's secret key material. Secrets are
//! written only to its own persistence keys (`keys/identity`, `keys/content`)
//! and are zeroized when their in-memory holders drop.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use pcm_crypto::commitment::{commit_identity, Commitment};
use pcm_crypto::content::ContentKey;
use pcm_crypto::identity::{
    decode_fixed, encode_key, AnonymousIdentity, KeyPair, SecretKeyRecord, SigningKeyPair, KEY_LEN,
};

use crate::errors::CoreError;
use crate::store::{load_json, save_json, Persistence};
use crate::types::{now_millis, short_hex};

pub const IDENTITY_KEY: &str = "keys/identity";
pub const CONTENT_KEY: &str = "keys/content";

const IDENTITY_RECORD_VERSION: u8 = 1;

/// On-disk form of the identity. Every field is zeroized on drop.
#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(rename_all = "camelCase")]
struct IdentityRecord {
    version: u8,
    #[serde(flatten)]
    secrets: SecretKeyRecord,
    anonymous_nonce: String,
    created_at: u64,
}

#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
struct ContentKeyRecord {
    key: String,
}

/// The device identity: two independent key pairs and the anonymous handle.
///
/// Only public halves are reachable from outside this crate.
///
/// ```compile_fail
/// fn leak(identity: &pcm_core::keys::LocalIdentity) {
///     let _ = &identity.encryption;
/// }
/// ```
#[derive(Debug)]
pub struct LocalIdentity {
    encryption: KeyPair,
    signing: SigningKeyPair,
    pub anonymous_id: AnonymousIdentity,
    /// Unix milliseconds.
    pub created_at: u64,
    anonymous_nonce: [u8; 32],
}

impl LocalIdentity {
    fn generate() -> Result<Self, CoreError> {
        let mut anonymous_nonce = [0u8; 32];
        getrandom::getrandom(&mut anonymous_nonce)
            .map_err(|e| CoreError::KeyUnavailable(format!("random source unavailable: {}", e)))?;
        let encryption = KeyPair::generate();
        let created_at = now_millis();
        Ok(Self {
            anonymous_id: AnonymousIdentity::derive(
                &encryption.public_key(),
                &anonymous_nonce,
                created_at,
            ),
            encryption,
            signing: SigningKeyPair::generate(),
            created_at,
            anonymous_nonce,
        })
    }

    fn to_record(&self) -> IdentityRecord {
        IdentityRecord {
            version: IDENTITY_RECORD_VERSION,
            secrets: SecretKeyRecord::export(&self.encryption, &self.signing),
            anonymous_nonce: encode_key(&self.anonymous_nonce),
            created_at: self.created_at,
        }
    }

    fn from_record(record: &IdentityRecord) -> Result<Self, String> {
        if record.version != IDENTITY_RECORD_VERSION {
            return Err(format!("unsupported identity record version {}", record.version));
        }
        let (encryption, signing) = record
            .secrets
            .restore()
            .map_err(|e| format!("identity secret: {}", e))?;
        let anonymous_nonce = decode_fixed::<32>(&record.anonymous_nonce)
            .map_err(|e| format!("anonymous nonce: {}", e))?;

        Ok(Self {
            anonymous_id: AnonymousIdentity::derive(
                &encryption.public_key(),
                &anonymous_nonce,
                record.created_at,
            ),
            encryption,
            signing,
            created_at: record.created_at,
            anonymous_nonce,
        })
    }

    pub(crate) fn encryption_keys(&self) -> &KeyPair {
        &self.encryption
    }

    pub(crate) fn signing_keys(&self) -> &SigningKeyPair {
        &self.signing
    }

    pub fn encryption_public(&self) -> [u8; KEY_LEN] {
        self.encryption.public_key()
    }

    pub fn signing_public(&self) -> [u8; KEY_LEN] {
        self.signing.public_key()
    }

    /// Public keys to hand to contacts.
    pub fn public_bundle(&self) -> PublicBundle {
        PublicBundle {
            encryption_public_key: encode_key(&self.encryption_public()),
            signing_public_key: encode_key(&self.signing_public()),
            anonymous_id: self.anonymous_id.to_hex(),
        }
    }
}

/// Shareable public half of a [`LocalIdentity`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicBundle {
    pub encryption_public_key: String,
    pub signing_public_key: String,
    pub anonymous_id: String,
}

pub struct KeyManager {
    store: Arc<dyn Persistence>,
    allow_regeneration: bool,
    identity: Mutex<Option<Arc<LocalIdentity>>>,
    content_key: Mutex<Option<Arc<ContentKey>>>,
}

impl KeyManager {
    pub fn new(store: Arc<dyn Persistence>, allow_regeneration: bool) -> Self {
        Self {
            store,
            allow_regeneration,
            identity: Mutex::new(None),
            content_key: Mutex::new(None),
        }
    }

    /// Load the persisted identity, or create one on first run.
    ///
    /// An unreadable or corrupt record is replaced only when regeneration is
    /// allowed; otherwise the call fails with `KeyUnavailable`.
    pub fn get_or_create_identity(&self) -> Result<Arc<LocalIdentity>, CoreError> {
        let mut cached = self
            .identity
            .lock()
            .map_err(|_| CoreError::KeyUnavailable("identity lock poisoned".into()))?;
        if let Some(identity) = cached.as_ref() {
            return Ok(identity.clone());
        }

        let identity = match self.load_identity() {
            Ok(Some(identity)) => {
                debug!("loaded identity {}", short_hex(&identity.encryption_public()));
                identity
            }
            Ok(None) => {
                info!("no identity on record, generating");
                self.create_identity()?
            }
            Err(reason) if self.allow_regeneration => {
                warn!(
                    "identity record unusable ({}), regenerating; \
                     earlier messages will not decrypt",
                    reason
                );
                self.create_identity()?
            }
            Err(reason) => return Err(CoreError::KeyUnavailable(reason)),
        };

        let identity = Arc::new(identity);
        *cached = Some(identity.clone());
        Ok(identity)
    }

    pub fn public_bundle(&self) -> Result<PublicBundle, CoreError> {
        Ok(self.get_or_create_identity()?.public_bundle())
    }

    /// Commitment proving control of the anonymous identity.
    pub fn prove_identity(&self) -> Result<Commitment, CoreError> {
        let identity = self.get_or_create_identity()?;
        Ok(commit_identity(&identity.anonymous_id, &identity.signing, now_millis())?)
    }

    /// Master key for content sealing, created on first use.
    pub fn get_or_create_content_key(&self) -> Result<Arc<ContentKey>, CoreError> {
        let mut cached = self
            .content_key
            .lock()
            .map_err(|_| CoreError::KeyUnavailable("content key lock poisoned".into()))?;
        if let Some(key) = cached.as_ref() {
            return Ok(key.clone());
        }

        let loaded = load_json::<ContentKeyRecord>(self.store.as_ref(), CONTENT_KEY)
            .map_err(|e| e.to_string())
            .and_then(|record| {
                record
                    .map(|r| decode_fixed::<32>(&r.key).map_err(|e| e.to_string()))
                    .transpose()
            });

        let key = match loaded {
            Ok(Some(bytes)) => ContentKey::from_bytes(bytes),
            Ok(None) => self.create_content_key()?,
            Err(reason) if self.allow_regeneration => {
                warn!("content key unusable ({}), regenerating", reason);
                self.create_content_key()?
            }
            Err(reason) => return Err(CoreError::KeyUnavailable(reason)),
        };

        let key = Arc::new(key);
        *cached = Some(key.clone());
        Ok(key)
    }

    fn load_identity(&self) -> Result<Option<LocalIdentity>, String> {
        let record = load_json::<IdentityRecord>(self.store.as_ref(), IDENTITY_KEY)
            .map_err(|e| e.to_string())?;
        record.map(|r| LocalIdentity::from_record(&r)).transpose()
    }

    fn create_identity(&self) -> Result<LocalIdentity, CoreError> {
        let identity = LocalIdentity::generate()?;
        save_json(self.store.as_ref(), IDENTITY_KEY, &identity.to_record())?;
        info!(
            "created identity {} (anonymous id {})",
            short_hex(&identity.encryption_public()),
            identity.anonymous_id
        );
        Ok(identity)
    }

    fn create_content_key(&self) -> Result<ContentKey, CoreError> {
        let mut bytes = Zeroizing::new([0u8; 32]);
        getrandom::getrandom(&mut bytes[..])
            .map_err(|e| CoreError::KeyUnavailable(format!("random source unavailable: {}", e)))?;
        let record = ContentKeyRecord {
            key: encode_key(&bytes[..]),
        };
        save_json(self.store.as_ref(), CONTENT_KEY, &record)?;
        Ok(ContentKey::from_bytes(*bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryPersistence;
    use pcm_crypto::commitment::{verify, SubjectKind};
    use pcm_crypto::content::{open_content, seal_content};

    fn manager(store: &Arc<InMemoryPersistence>, allow: bool) -> KeyManager {
        KeyManager::new(store.clone(), allow)
    }

    #[test]
    fn test_first_run_generates_and_persists() {
        let store = Arc::new(InMemoryPersistence::new());
        let keys = manager(&store, false);
        let identity = keys.get_or_create_identity().unwrap();

        assert!(store.get(IDENTITY_KEY).unwrap().is_some());
        assert!(Arc::ptr_eq(&identity, &keys.get_or_create_identity().unwrap()));
    }

    #[test]
    fn test_reload_restores_same_identity() {
        let store = Arc::new(InMemoryPersistence::new());
        let first = manager(&store, false).get_or_create_identity().unwrap();
        let second = manager(&store, false).get_or_create_identity().unwrap();

        assert_eq!(first.encryption_public(), second.encryption_public());
        assert_eq!(first.signing_public(), second.signing_public());
        assert_eq!(first.anonymous_id, second.anonymous_id);
    }

    #[test]
    fn test_corrupt_record_without_regeneration_fails() {
        let store = Arc::new(InMemoryPersistence::new());
        store.put(IDENTITY_KEY, b"{\"version\":1,\"encryptionSecret\":").unwrap();

        let err = manager(&store, false).get_or_create_identity().unwrap_err();
        assert!(matches!(err, CoreError::KeyUnavailable(_)));
        assert_eq!(
            store.get(IDENTITY_KEY).unwrap(),
            Some(b"{\"version\":1,\"encryptionSecret\":".to_vec())
        );
    }

    #[test]
    fn test_corrupt_record_with_regeneration_replaces_it() {
        let store = Arc::new(InMemoryPersistence::new());
        store.put(IDENTITY_KEY, b"garbage").unwrap();

        let identity = manager(&store, true).get_or_create_identity().unwrap();
        let reloaded = manager(&store, false).get_or_create_identity().unwrap();
        assert_eq!(identity.encryption_public(), reloaded.encryption_public());
    }

    #[test]
    fn test_wrong_version_is_unusable() {
        let store = Arc::new(InMemoryPersistence::new());
        let identity = manager(&store, false).get_or_create_identity().unwrap();
        let mut value: serde_json::Value =
            serde_json::from_slice(&store.get(IDENTITY_KEY).unwrap().unwrap()).unwrap();
        value["version"] = 2.into();
        store.put(IDENTITY_KEY, &serde_json::to_vec(&value).unwrap()).unwrap();

        assert!(matches!(
            manager(&store, false).get_or_create_identity(),
            Err(CoreError::KeyUnavailable(msg)) if msg.contains("version")
        ));
        let fresh = manager(&store, true).get_or_create_identity().unwrap();
        assert_ne!(fresh.encryption_public(), identity.encryption_public());
    }

    #[test]
    fn test_public_bundle_has_no_secrets() {
        let store = Arc::new(InMemoryPersistence::new());
        let keys = manager(&store, false);
        let identity = keys.get_or_create_identity().unwrap();
        let bundle = keys.public_bundle().unwrap();

        assert_eq!(bundle.encryption_public_key, encode_key(&identity.encryption_public()));
        assert_eq!(bundle.signing_public_key, encode_key(&identity.signing_public()));
        let record: serde_json::Value =
            serde_json::from_slice(&store.get(IDENTITY_KEY).unwrap().unwrap()).unwrap();
        let json = serde_json::to_string(&bundle).unwrap();
        for field in ["encryptionSecret", "signingSecret"] {
            let secret = record[field].as_str().unwrap();
            assert!(!json.contains(secret));
            assert!(!format!("{:?}", identity).contains(secret));
        }
    }

    #[test]
    fn test_identity_proof_verifies() {
        let store = Arc::new(InMemoryPersistence::new());
        let keys = manager(&store, false);
        let identity = keys.get_or_create_identity().unwrap();
        let proof = keys.prove_identity().unwrap();

        assert_eq!(proof.subject_kind, SubjectKind::Identity);
        assert!(verify(&proof, identity.anonymous_id.as_bytes(), &identity.signing_public()));
    }

    #[test]
    fn test_content_key_persists() {
        let store = Arc::new(InMemoryPersistence::new());
        let sealed = {
            let key = manager(&store, false).get_or_create_content_key().unwrap();
            seal_content(&key, b"cached page").unwrap()
        };
        let key = manager(&store, false).get_or_create_content_key().unwrap();
        assert_eq!(open_content(&key, &sealed).unwrap(), b"cached page");
    }
}
