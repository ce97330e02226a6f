//! Obfuscated, namespaced local persistence for the session.
//!
//! [`SecureStore`] is a key/value layer over a [`StorageBackend`] that prefixes
//! every key with a namespace and passes every value through
//! [`Obfuscator`](crate::crypto::Obfuscator). [`AuthStore`] sits on top and owns
//! the three session entries:
//!
//! | key | contents |
//! |---|---|
//! | `{namespace}user` | identity record (JSON) |
//! | `{namespace}access_token` | access credential |
//! | `{namespace}refresh_token` | refresh credential |
//!
//! The entries are independently readable but only ever written and cleared as a
//! group. A group write that fails part way is rolled back by clearing the whole
//! group, so a reload never observes one credential without the other.

pub mod backend;

use std::sync::Arc;
use thiserror::Error as ThisError;
use tracing::warn;

use crate::auth::session::Credentials;
use crate::config::{StorageBackendConfig, StorageConfig};
use crate::crypto::Obfuscator;
use crate::types::User;
pub use backend::{FileBackend, MemoryBackend, StorageBackend};

pub const USER_KEY: &str = "user";
pub const ACCESS_TOKEN_KEY: &str = "access_token";
pub const REFRESH_TOKEN_KEY: &str = "refresh_token";

#[derive(ThisError, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Storage I/O failed during {operation}: {message}")]
    Io { operation: String, message: String },

    #[error("Storage serialization failed: {message}")]
    Serialization { message: String },

    #[error("Stored entry {key} is unreadable: {message}")]
    Corrupt { key: String, message: String },
}

impl StoreError {
    pub(crate) fn io(operation: &str, err: std::io::Error) -> Self {
        StoreError::Io {
            operation: operation.to_string(),
            message: err.to_string(),
        }
    }
}

#[derive(Clone)]
pub struct SecureStore {
    backend: Arc<dyn StorageBackend>,
    namespace: String,
    obfuscator: Obfuscator,
}

impl SecureStore {
    pub fn new(backend: Arc<dyn StorageBackend>, namespace: impl Into<String>, obfuscation_key: &str) -> Self {
        Self {
            backend,
            namespace: namespace.into(),
            obfuscator: Obfuscator::new(obfuscation_key),
        }
    }

    fn namespaced(&self, key: &str) -> String {
        format!("{}{}", self.namespace, key)
    }

    pub fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let full_key = self.namespaced(key);
        match self.backend.get(&full_key)? {
            Some(raw) => self
                .obfuscator
                .deobfuscate(&raw)
                .map(Some)
                .map_err(|e| StoreError::Corrupt {
                    key: full_key,
                    message: e.to_string(),
                }),
            None => Ok(None),
        }
    }

    pub fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.backend.set(&self.namespaced(key), &self.obfuscator.obfuscate(value))
    }

    pub fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.backend.remove(&self.namespaced(key))
    }
}

/// What was found in the store at startup. Fields are read independently.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PersistedSession {
    pub user: Option<User>,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
}

impl PersistedSession {
    pub fn is_empty(&self) -> bool {
        self.user.is_none() && self.access_token.is_none() && self.refresh_token.is_none()
    }

    /// Identity plus both credentials, or `None` if any piece is missing.
    pub fn complete(self) -> Option<(User, Credentials)> {
        match (self.user, self.access_token, self.refresh_token) {
            (Some(user), Some(access_token), Some(refresh_token)) => Some((
                user,
                Credentials {
                    access_token,
                    refresh_token,
                },
            )),
            _ => None,
        }
    }
}

/// The session's three persisted entries.
#[derive(Clone)]
pub struct AuthStore {
    store: SecureStore,
}

impl AuthStore {
    pub fn new(store: SecureStore) -> Self {
        Self { store }
    }

    /// Build the store described by `config`.
    pub fn from_config(config: &StorageConfig) -> Self {
        let backend: Arc<dyn StorageBackend> = match &config.backend {
            StorageBackendConfig::Memory => Arc::new(MemoryBackend::new()),
            StorageBackendConfig::File { path } => Arc::new(FileBackend::new(path.clone())),
        };
        Self::new(SecureStore::new(backend, config.namespace.clone(), &config.obfuscation_key))
    }

    /// In-memory store, as used by tests and ephemeral clients.
    pub fn in_memory() -> Self {
        Self::new(SecureStore::new(Arc::new(MemoryBackend::new()), "sra_", "sra-dashboard"))
    }

    /// Read all three entries. A read failure is logged and the entry treated as absent.
    pub fn load(&self) -> PersistedSession {
        let user = self.read(USER_KEY).and_then(|raw| match serde_json::from_str::<User>(&raw) {
            Ok(user) => Some(user),
            Err(e) => {
                warn!(error = %e, "Persisted identity is unreadable, ignoring it");
                None
            }
        });

        PersistedSession {
            user,
            access_token: self.read(ACCESS_TOKEN_KEY),
            refresh_token: self.read(REFRESH_TOKEN_KEY),
        }
    }

    fn read(&self, key: &str) -> Option<String> {
        match self.store.get(key) {
            Ok(value) => value,
            Err(e) => {
                warn!(key, error = %e, "Failed to read persisted session entry, treating as absent");
                None
            }
        }
    }

    /// Persist identity and both credentials as one group.
    pub fn save(&self, user: &User, credentials: &Credentials) -> Result<(), StoreError> {
        let user_json = serde_json::to_string(user).map_err(|e| StoreError::Serialization { message: e.to_string() })?;
        self.write_group(&[
            (USER_KEY, user_json.as_str()),
            (ACCESS_TOKEN_KEY, credentials.access_token.as_str()),
            (REFRESH_TOKEN_KEY, credentials.refresh_token.as_str()),
        ])
    }

    /// Replace both credentials, leaving the identity entry as is.
    pub fn save_credentials(&self, credentials: &Credentials) -> Result<(), StoreError> {
        self.write_group(&[
            (ACCESS_TOKEN_KEY, credentials.access_token.as_str()),
            (REFRESH_TOKEN_KEY, credentials.refresh_token.as_str()),
        ])
    }

    pub fn save_user(&self, user: &User) -> Result<(), StoreError> {
        let user_json = serde_json::to_string(user).map_err(|e| StoreError::Serialization { message: e.to_string() })?;
        self.write_group(&[(USER_KEY, user_json.as_str())])
    }

    fn write_group(&self, entries: &[(&str, &str)]) -> Result<(), StoreError> {
        for (key, value) in entries {
            if let Err(e) = self.store.set(key, value) {
                warn!(key, error = %e, "Group write failed, clearing persisted session");
                if let Err(clear_err) = self.clear() {
                    warn!(error = %clear_err, "Failed to roll back partial session write");
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Remove all three entries. Every removal is attempted; the first error is returned.
    pub fn clear(&self) -> Result<(), StoreError> {
        let mut first_err = None;
        for key in [USER_KEY, ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY] {
            if let Err(e) = self.store.remove(key) {
                warn!(key, error = %e, "Failed to remove persisted session entry");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
