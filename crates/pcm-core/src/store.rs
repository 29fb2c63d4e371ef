//! Key/value persistence for identity, contacts and conversation logs.
//!
//! The `Persistence` trait is deliberately small (`get`/`put` on string keys)
//! and synchronous. Keys are `/`-separated paths such as `keys/identity` or
//! `conversations/<id>`. `Namespaced` scopes a backend under a prefix so
//! several profiles can share one root.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur during store operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("invalid storage key: {0}")]
    InvalidKey(String),

    #[error("storage operation failed: {0}")]
    OperationFailed(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::OperationFailed(e.to_string())
    }
}

// ============================================================================
// Persistence Trait
// ============================================================================

/// Namespaced key to bytes store.
pub trait Persistence: Send + Sync {
    /// Read the value under `key`; `Ok(None)` when nothing was ever written.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Write `value` under `key`, replacing any previous value.
    fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;
}

impl<P: Persistence + ?Sized> Persistence for Arc<P> {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        (**self).get(key)
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        (**self).put(key, value)
    }
}

/// Read and deserialize a JSON record.
pub fn load_json<T: DeserializeOwned>(
    store: &dyn Persistence,
    key: &str,
) -> Result<Option<T>, StoreError> {
    match store.get(key)? {
        None => Ok(None),
        Some(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| StoreError::Serialization(format!("{}: {}", key, e))),
    }
}

/// Serialize and write a JSON record.
pub fn save_json<T: Serialize>(
    store: &dyn Persistence,
    key: &str,
    value: &T,
) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec(value).map_err(|e| StoreError::Serialization(e.to_string()))?;
    store.put(key, &bytes)
}

fn validate_key(key: &str) -> Result<(), StoreError> {
    if key.is_empty() {
        return Err(StoreError::InvalidKey("empty key".into()));
    }
    for segment in key.split('/') {
        let ok = !segment.is_empty()
            && segment != "."
            && segment != ".."
            && segment
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !ok {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
    }
    Ok(())
}

// ============================================================================
// In-Memory Implementation
// ============================================================================

/// In-memory persistence for tests and ephemeral profiles.
#[derive(Debug, Default)]
pub struct InMemoryPersistence {
    data: RwLock<HashMap<String, Vec<u8>>>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.data.read().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All stored keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .data
            .read()
            .map(|d| d.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }
}

impl Persistence for InMemoryPersistence {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        validate_key(key)?;
        let data = self
            .data
            .read()
            .map_err(|_| StoreError::OperationFailed("lock poisoned".into()))?;
        Ok(data.get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        validate_key(key)?;
        let mut data = self
            .data
            .write()
            .map_err(|_| StoreError::OperationFailed("lock poisoned".into()))?;
        data.insert(key.to_string(), value.to_vec());
        Ok(())
    }
}

// ============================================================================
// File-Backed Implementation
// ============================================================================

const FILE_SUFFIX: &str = "dat";

/// One file per key under a root directory.
///
/// `a/b` is stored at `<root>/a/b.dat`. Writes go to a temporary sibling and
/// are renamed into place, so a reader never sees a half-written value.
#[derive(Debug, Clone)]
pub struct FilePersistence {
    root: PathBuf,
}

impl FilePersistence {
    pub fn open(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        validate_key(key)?;
        let mut path = self.root.clone();
        let mut segments = key.split('/').peekable();
        while let Some(segment) = segments.next() {
            if segments.peek().is_some() {
                path.push(segment);
            } else {
                path.push(format!("{}.{}", segment, FILE_SUFFIX));
            }
        }
        Ok(path)
    }
}

impl Persistence for FilePersistence {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.path_for(key)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension(format!(
            "{}.tmp-{}",
            FILE_SUFFIX,
            uuid::Uuid::new_v4().simple()
        ));
        fs::write(&tmp, value)?;
        if let Err(e) = fs::rename(&tmp, &path) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }
}

// ============================================================================
// Namespacing
// ============================================================================

/// Prefixes every key with `<namespace>/`.
#[derive(Debug, Clone)]
pub struct Namespaced<P> {
    inner: P,
    namespace: String,
}

impl<P: Persistence> Namespaced<P> {
    pub fn new(inner: P, namespace: impl Into<String>) -> Result<Self, StoreError> {
        let namespace = namespace.into();
        validate_key(&namespace)?;
        Ok(Self { inner, namespace })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn scoped(&self, key: &str) -> String {
        format!("{}/{}", self.namespace, key)
    }
}

impl<P: Persistence> Persistence for Namespaced<P> {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.inner.get(&self.scoped(key))
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.inner.put(&self.scoped(key), value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_get_put() {
        let store = InMemoryPersistence::new();
        assert_eq!(store.get("keys/identity").unwrap(), None);
        store.put("keys/identity", b"v1").unwrap();
        store.put("keys/identity", b"v2").unwrap();
        assert_eq!(store.get("keys/identity").unwrap(), Some(b"v2".to_vec()));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_rejects_bad_keys() {
        let store = InMemoryPersistence::new();
        for key in ["", "a//b", "../etc", "a/./b", "sp ace", "/lead"] {
            assert!(
                matches!(store.put(key, b"x"), Err(StoreError::InvalidKey(_))),
                "accepted {:?}",
                key
            );
        }
    }

    #[test]
    fn test_file_persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FilePersistence::open(dir.path()).unwrap();
            store.put("conversations/abc-def", b"log").unwrap();
            store.put("conversations", b"index").unwrap();
        }
        let store = FilePersistence::open(dir.path()).unwrap();
        assert_eq!(store.get("conversations/abc-def").unwrap(), Some(b"log".to_vec()));
        assert_eq!(store.get("conversations").unwrap(), Some(b"index".to_vec()));
        assert_eq!(store.get("missing").unwrap(), None);
    }

    #[test]
    fn test_file_persistence_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilePersistence::open(dir.path()).unwrap();
        store.put("k", b"1").unwrap();
        store.put("k", b"2").unwrap();

        let names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["k.dat".to_string()]);
    }

    #[test]
    fn test_namespaces_are_isolated() {
        let backing = Arc::new(InMemoryPersistence::new());
        let alice = Namespaced::new(backing.clone(), "alice").unwrap();
        let bob = Namespaced::new(backing.clone(), "bob").unwrap();

        alice.put("keys/identity", b"a").unwrap();
        assert_eq!(bob.get("keys/identity").unwrap(), None);
        assert_eq!(backing.keys(), vec!["alice/keys/identity".to_string()]);
    }

    #[test]
    fn test_json_helpers() {
        let store = InMemoryPersistence::new();
        save_json(&store, "list", &vec![1u32, 2, 3]).unwrap();
        let back: Option<Vec<u32>> = load_json(&store, "list").unwrap();
        assert_eq!(back, Some(vec![1, 2, 3]));

        store.put("list", b"{not json").unwrap();
        assert!(matches!(
            load_json::<Vec<u32>>(&store, "list"),
            Err(StoreError::Serialization(_))
        ));
    }
}
