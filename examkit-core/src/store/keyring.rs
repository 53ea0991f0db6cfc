//! OS keyring-backed expiring store.

use async_trait::async_trait;
use keyring::Entry;

use super::{SecretStore, StoreError, StoredEntry};

/// OS keyring-backed store.
///
/// Uses the platform's native keyring service (Keychain, Secret Service,
/// Credential Manager). Keyrings have no notion of expiry, so every entry is
/// written as a JSON [`StoredEntry`] envelope and the expiry is checked on
/// read. An expired envelope is deleted the first time it is read.
///
/// Entries are stored under the keyring service `{service_name}/{key}`.
pub struct KeyringStore {
    service_name: String,
}

impl KeyringStore {
    /// Try to create a new keyring store.
    ///
    /// Returns an error if the keyring backend is not available on this platform.
    pub fn try_new(service_name: &str) -> Result<Self, StoreError> {
        let probe = format!("{}/__probe__", service_name);
        match Entry::new(&probe, "availability_check") {
            Ok(_) => Ok(Self {
                service_name: service_name.to_string(),
            }),
            Err(e) => Err(StoreError::KeyringUnavailable {
                message: format!("keyring backend not available: {}", e),
            }),
        }
    }

    fn create_entry(&self, key: &str) -> Result<Entry, StoreError> {
        let service = format!("{}/{}", self.service_name, key);
        Entry::new(&service, "examkit").map_err(|e| StoreError::BackendError {
            message: format!("failed to create keyring entry: {}", e),
        })
    }
}

impl std::fmt::Debug for KeyringStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyringStore")
            .field("service_name", &self.service_name)
            .finish()
    }
}

#[async_trait]
impl SecretStore for KeyringStore {
    async fn get_entry(&self, key: &str) -> Result<Option<StoredEntry>, StoreError> {
        let entry = self.create_entry(key)?;

        let raw = match entry.get_password() {
            Ok(raw) => raw,
            Err(keyring::Error::NoEntry) => return Ok(None),
            Err(keyring::Error::Ambiguous(_)) => {
                return Err(StoreError::BackendError {
                    message: format!("ambiguous keyring entry for key: {}", key),
                });
            }
            Err(keyring::Error::PlatformFailure(e)) => {
                return Err(StoreError::BackendError {
                    message: format!("platform keyring failure: {}", e),
                });
            }
            Err(e) => {
                return Err(StoreError::BackendError {
                    message: format!("keyring error: {}", e),
                });
            }
        };

        let stored: StoredEntry = serde_json::from_str(&raw)?;
        if stored.is_expired() {
            let _ = entry.delete_credential();
            return Ok(None);
        }
        Ok(Some(stored))
    }

    async fn put(&self, key: &str, stored: StoredEntry) -> Result<(), StoreError> {
        let entry = self.create_entry(key)?;
        let envelope = serde_json::to_string(&stored)?;

        entry
            .set_password(&envelope)
            .map_err(|e| StoreError::BackendError {
                message: format!("failed to set keyring password: {}", e),
            })
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        let entry = self.create_entry(key)?;

        match entry.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(StoreError::BackendError {
                message: format!("failed to delete keyring entry: {}", e),
            }),
        }
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        // Platform keyring APIs have no enumeration.
        Err(StoreError::BackendError {
            message: format!(
                "list_keys not supported by keyring backend (requested prefix: {})",
                prefix
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Secret;
    use chrono::Duration;

    // These tests skip themselves on hosts without a working keyring daemon.

    #[test]
    fn test_keyring_store_creation() {
        match KeyringStore::try_new("examkit-test") {
            Ok(store) => assert_eq!(store.service_name, "examkit-test"),
            Err(StoreError::KeyringUnavailable { .. }) => {}
            Err(e) => panic!("unexpected error: {}", e),
        }
    }

    #[tokio::test]
    async fn test_keyring_store_round_trip_with_expiry() {
        let Ok(store) = KeyringStore::try_new("examkit-test-ops") else {
            return;
        };

        let key = format!(
            "test/{}",
            chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
        );
        if store
            .set(&key, &Secret::new("test-value"), Duration::hours(1))
            .await
            .is_err()
        {
            return;
        }

        // Headless hosts may accept the write without persisting it.
        if let Ok(Some(entry)) = store.get_entry(&key).await {
            assert_eq!(entry.value.expose(), "test-value");
            assert!(!entry.is_expired());
        }

        let _ = store.remove(&key).await;
    }

    #[tokio::test]
    async fn test_keyring_list_keys_unsupported() {
        let Ok(store) = KeyringStore::try_new("examkit-test-list") else {
            return;
        };

        let result = store.list_keys("examkit").await;
        assert!(matches!(result, Err(StoreError::BackendError { .. })));
    }
}
