//! Expiring secret storage.
//!
//! This module provides:
//! - [`Secret`] - A wrapper for sensitive values that prevents accidental logging
//! - [`SecretStore`] - Trait for key-value backends with a per-entry TTL
//! - [`MemoryStore`] - In-memory implementation for tests and ephemeral sessions
//! - [`FileStore`] - JSON file in the platform data directory
//! - [`KeyringStore`] - OS keyring implementation (with `keyring-store` feature)
//! - [`create_store`] - Helper to select a backend by name
//!
//! Every entry carries its own expiry. An expired entry reads as absent, the
//! same way a browser drops a cookie whose max-age has elapsed.
//!
//! # Example
//!
//! ```rust,ignore
//! use chrono::Duration;
//! use examkit_core::store::{MemoryStore, Secret, SecretStore};
//!
//! let store = MemoryStore::new();
//! store.set("examkit/access_token", &Secret::new("eyJ..."), Duration::days(1)).await?;
//!
//! let entry = store.get_entry("examkit/access_token").await?.unwrap();
//! println!("expires at {}", entry.expires_at);
//! ```

use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

mod file;
#[cfg(feature = "keyring-store")]
mod keyring;
mod memory;

pub use file::FileStore;
#[cfg(feature = "keyring-store")]
pub use keyring::KeyringStore;
pub use memory::MemoryStore;

/// A secret value that prevents accidental exposure in logs.
///
/// The inner value is only accessible via [`expose()`](Secret::expose).
/// Debug and Display implementations show `[REDACTED]` instead of the value,
/// and the buffer is wiped when the secret is dropped.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct Secret(String);

impl Secret {
    /// Create a new secret from a string value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Expose the secret value.
    ///
    /// Use sparingly and never log the result.
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Consume the secret and return the inner value.
    pub fn into_inner(mut self) -> String {
        std::mem::take(&mut self.0)
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Secret([REDACTED])")
    }
}

impl std::fmt::Display for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl PartialEq for Secret {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for Secret {}

/// A stored value together with the instant it stops being readable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEntry {
    pub value: Secret,
    pub expires_at: DateTime<Utc>,
}

impl StoredEntry {
    /// Create an entry that lives for `ttl` starting now.
    pub fn new(value: Secret, ttl: Duration) -> Self {
        Self::until(value, Utc::now() + ttl)
    }

    pub fn until(value: Secret, expires_at: DateTime<Utc>) -> Self {
        Self { value, expires_at }
    }

    /// Whether the entry has outlived its TTL.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Error type for secret store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The storage backend encountered an error.
    #[error("backend error: {message}")]
    BackendError { message: String },

    /// Reading or writing the backing file failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// The keyring backend is not available.
    #[error("keyring not available: {message}")]
    KeyringUnavailable { message: String },
}

/// Abstraction over expiring key-value backends.
///
/// Implementations include:
/// - [`MemoryStore`] - In-memory storage for testing
/// - [`FileStore`] - JSON file on disk
/// - [`KeyringStore`] (with `keyring-store` feature) - OS keyring
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Retrieve an entry and its expiry by key.
    ///
    /// Returns `Ok(None)` if the key doesn't exist or has expired.
    async fn get_entry(&self, key: &str) -> Result<Option<StoredEntry>, StoreError>;

    /// Store an entry with an explicit expiry.
    ///
    /// Overwrites any existing value.
    async fn put(&self, key: &str, entry: StoredEntry) -> Result<(), StoreError>;

    /// Delete a value by key.
    ///
    /// Returns `Ok(())` even if the key didn't exist.
    async fn remove(&self, key: &str) -> Result<(), StoreError>;

    /// List all live keys matching a prefix.
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    /// Store a value that stays readable for `ttl`.
    async fn set(&self, key: &str, secret: &Secret, ttl: Duration) -> Result<(), StoreError> {
        self.put(key, StoredEntry::new(secret.clone(), ttl)).await
    }

    /// Retrieve a value by key.
    async fn get(&self, key: &str) -> Result<Option<Secret>, StoreError> {
        Ok(self.get_entry(key).await?.map(|entry| entry.value.clone()))
    }

    /// Check if a live key exists without retrieving the value.
    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.get_entry(key).await?.is_some())
    }
}

/// Which backend persists the session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process memory; the session ends with the process.
    Memory,
    /// JSON file in the data directory.
    #[default]
    File,
    /// OS keyring.
    Keyring,
}

impl FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "file" => Ok(Self::File),
            "keyring" => Ok(Self::Keyring),
            other => Err(format!("unknown store backend: {other}")),
        }
    }
}

/// Create a secret store for the requested backend.
///
/// # Backend Selection Logic
///
/// - [`StoreBackend::File`]: a [`FileStore`] at `<data_dir>/session.json`
/// - [`StoreBackend::Keyring`]: a [`KeyringStore`] when the `keyring-store`
///   feature is enabled and the keyring is reachable, otherwise falls back to
///   [`MemoryStore`] with a warning
/// - [`StoreBackend::Memory`]: a [`MemoryStore`]
pub fn create_store(
    backend: StoreBackend,
    data_dir: &Path,
) -> Result<Box<dyn SecretStore>, StoreError> {
    match backend {
        StoreBackend::File => {
            let store = FileStore::open(data_dir.join("session.json"))?;
            tracing::debug!("Using file session storage at {:?}", store.path());
            Ok(Box::new(store))
        }
        StoreBackend::Keyring => {
            #[cfg(feature = "keyring-store")]
            match KeyringStore::try_new("examkit") {
                Ok(store) => {
                    tracing::info!("Using OS keyring for session storage");
                    return Ok(Box::new(store));
                }
                Err(e) => {
                    tracing::warn!(
                        "Keyring unavailable ({}), falling back to memory store. \
                         The session will not persist across restarts.",
                        e
                    );
                }
            }

            #[cfg(not(feature = "keyring-store"))]
            tracing::warn!(
                "Keyring storage requested but keyring-store feature not enabled. \
                 Using memory store. The session will not persist across restarts."
            );

            Ok(Box::new(MemoryStore::new()))
        }
        StoreBackend::Memory => {
            tracing::debug!("Using in-memory session storage");
            Ok(Box::new(MemoryStore::new()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_debug_redacted() {
        let secret = Secret::new("super-secret");
        let debug = format!("{:?}", secret);
        assert!(!debug.contains("super-secret"));
        assert!(debug.contains("REDACTED"));
    }

    #[test]
    fn test_secret_display_redacted() {
        let secret = Secret::new("super-secret");
        let display = format!("{}", secret);
        assert!(!display.contains("super-secret"));
        assert!(display.contains("REDACTED"));
    }

    #[test]
    fn test_secret_into_inner() {
        assert_eq!(Secret::new("abc").into_inner(), "abc");
    }

    #[test]
    fn test_entry_expiry() {
        let entry = StoredEntry::new(Secret::new("v"), Duration::seconds(30));
        assert!(!entry.is_expired());
        assert!(entry.is_expired_at(Utc::now() + Duration::seconds(31)));
    }

    #[test]
    fn test_backend_from_str() {
        assert_eq!("File".parse::<StoreBackend>().unwrap(), StoreBackend::File);
        assert_eq!("memory".parse::<StoreBackend>().unwrap(), StoreBackend::Memory);
        assert!("cookie".parse::<StoreBackend>().is_err());
    }

    #[tokio::test]
    async fn test_create_store_memory() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = create_store(StoreBackend::Memory, dir.path()).unwrap();

        store
            .set("test-key", &Secret::new("test"), Duration::minutes(1))
            .await
            .unwrap();
        let retrieved = store.get("test-key").await.unwrap();
        assert_eq!(retrieved.unwrap().expose(), "test");
    }

    #[tokio::test]
    async fn test_create_store_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = create_store(StoreBackend::File, dir.path()).unwrap();

        store
            .set("test-key", &Secret::new("test"), Duration::minutes(1))
            .await
            .unwrap();
        assert!(dir.path().join("session.json").exists());
    }
}
