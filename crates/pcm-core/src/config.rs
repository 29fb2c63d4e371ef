//! Configuration management

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use pcm_crypto::replay::MAX_WINDOW;

use crate::store::{FilePersistence, InMemoryPersistence, Namespaced, Persistence, StoreError};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),
}

/// Messenger core configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Profile namespace; every persisted key lives under it.
    pub namespace: String,
    /// Root directory for file storage. `None` keeps everything in memory.
    pub storage_dir: Option<PathBuf>,
    /// Replace an unreadable identity instead of failing.
    pub allow_key_regeneration: bool,
    /// Emit `Unverified` instead of `Received` for messages whose signature
    /// could not be checked.
    pub quarantine_unverified: bool,
    /// Reject duplicate and too-old sequence numbers per sender.
    pub enforce_sequence: bool,
    pub replay_window: usize,
    /// Buffered delivery events per subscriber.
    pub event_capacity: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            storage_dir: None,
            allow_key_regeneration: false,
            quarantine_unverified: false,
            enforce_sequence: false,
            replay_window: MAX_WINDOW,
            event_capacity: 256,
        }
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|e| ConfigError::Invalid(format!("Invalid {}: {}", name, e)))
}

fn parse_usize(name: &str, value: &str) -> Result<usize, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|e| ConfigError::Invalid(format!("Invalid {}: {}", name, e)))
}

impl CoreConfig {
    /// Load configuration from environment variables and TOML file
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        // TOML first so environment variables win
        if let Ok(config_path) = std::env::var("PCM_CONFIG") {
            config.load_from_toml(&config_path)?;
        }

        if let Ok(ns) = std::env::var("PCM_NAMESPACE") {
            config.namespace = ns;
        }

        if let Ok(dir) = std::env::var("PCM_STORAGE_DIR") {
            config.storage_dir = if dir.is_empty() { None } else { Some(PathBuf::from(dir)) };
        }

        if let Ok(v) = std::env::var("PCM_ALLOW_KEY_REGENERATION") {
            config.allow_key_regeneration = parse_bool("PCM_ALLOW_KEY_REGENERATION", &v)?;
        }

        if let Ok(v) = std::env::var("PCM_QUARANTINE_UNVERIFIED") {
            config.quarantine_unverified = parse_bool("PCM_QUARANTINE_UNVERIFIED", &v)?;
        }

        if let Ok(v) = std::env::var("PCM_ENFORCE_SEQUENCE") {
            config.enforce_sequence = parse_bool("PCM_ENFORCE_SEQUENCE", &v)?;
        }

        if let Ok(v) = std::env::var("PCM_REPLAY_WINDOW") {
            config.replay_window = parse_usize("PCM_REPLAY_WINDOW", &v)?;
        }

        if let Ok(v) = std::env::var("PCM_EVENT_CAPACITY") {
            config.event_capacity = parse_usize("PCM_EVENT_CAPACITY", &v)?;
        }

        config.validate()?;

        Ok(config)
    }

    /// Load from TOML config file
    pub fn load_from_toml(&mut self, path: &str) -> Result<(), ConfigError> {
        let content = std::fs::read_to_string(path)?;
        self.apply_toml(&content)
    }

    fn apply_toml(&mut self, content: &str) -> Result<(), ConfigError> {
        let toml_config: toml::Value = toml::from_str(content)?;

        if let Some(ns) = toml_config.get("namespace").and_then(|v| v.as_str()) {
            self.namespace = ns.to_string();
        }

        if let Some(dir) = toml_config.get("storage_dir").and_then(|v| v.as_str()) {
            self.storage_dir = Some(PathBuf::from(dir));
        }

        for (key, field) in [
            ("allow_key_regeneration", &mut self.allow_key_regeneration),
            ("quarantine_unverified", &mut self.quarantine_unverified),
            ("enforce_sequence", &mut self.enforce_sequence),
        ] {
            if let Some(v) = toml_config.get(key) {
                *field = v
                    .as_bool()
                    .ok_or_else(|| ConfigError::Invalid(format!("{} must be a boolean", key)))?;
            }
        }

        for (key, field) in [
            ("replay_window", &mut self.replay_window),
            ("event_capacity", &mut self.event_capacity),
        ] {
            if let Some(v) = toml_config.get(key) {
                *field = v
                    .as_integer()
                    .and_then(|i| usize::try_from(i).ok())
                    .ok_or_else(|| {
                        ConfigError::Invalid(format!("{} must be a non-negative integer", key))
                    })?;
            }
        }

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let ns_ok = !self.namespace.is_empty()
            && self
                .namespace
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'));
        if !ns_ok {
            return Err(ConfigError::Invalid(
                "namespace must be non-empty and use only [A-Za-z0-9_-]".to_string(),
            ));
        }

        if self.replay_window == 0 || self.replay_window > MAX_WINDOW {
            return Err(ConfigError::Invalid(format!(
                "replay_window must be in 1..={}",
                MAX_WINDOW
            )));
        }

        if self.event_capacity == 0 {
            return Err(ConfigError::Invalid("event_capacity must be > 0".to_string()));
        }

        Ok(())
    }

    /// Build the namespaced persistence backend this config describes.
    pub fn open_persistence(&self) -> Result<Arc<dyn Persistence>, ConfigError> {
        self.validate()?;
        let namespace = self.namespace.clone();
        Ok(match &self.storage_dir {
            Some(dir) => Arc::new(Namespaced::new(FilePersistence::open(dir)?, namespace)?),
            None => Arc::new(Namespaced::new(InMemoryPersistence::new(), namespace)?),
        })
    }
}
