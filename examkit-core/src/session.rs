//! The signed-in session as persisted between runs.
//!
//! [`SessionStore`] maps the logical session onto four entries of a
//! [`SecretStore`]:
//!
//! | key | TTL |
//! |---|---|
//! | `examkit/access_token` | access TTL (1 day) |
//! | `examkit/refresh_token` | refresh TTL (30 days) |
//! | `examkit/user` | access TTL, re-written whenever the access token is |
//! | `examkit/locale` | refresh TTL, survives logout |
//!
//! The user snapshot always shares the access token's expiry, so the cached
//! profile and the "logged in" state lapse together.
//!
//! Every sign-in and sign-out starts a new [`Generation`]. Renewed
//! credentials are only committed into the generation they were requested
//! for, so a renewal that outlives its session cannot sign the user back in.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::codec;
use crate::store::{Secret, SecretStore, StoreError, StoredEntry};

const KEY_PREFIX: &str = "examkit/";
const ACCESS_TOKEN: &str = "access_token";
const REFRESH_TOKEN: &str = "refresh_token";
const USER: &str = "user";
const LOCALE: &str = "locale";

/// Lifetimes of the persisted session entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTtl {
    pub access: Duration,
    pub refresh: Duration,
}

impl Default for SessionTtl {
    fn default() -> Self {
        Self {
            access: Duration::days(1),
            refresh: Duration::days(30),
        }
    }
}

/// An access token and, when the server issued one, its refresh token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialPair {
    pub access_token: Secret,
    pub refresh_token: Option<Secret>,
}

impl CredentialPair {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: Secret::new(access_token),
            refresh_token: None,
        }
    }

    pub fn with_refresh_token(mut self, refresh_token: impl Into<String>) -> Self {
        self.refresh_token = Some(Secret::new(refresh_token));
        self
    }

    /// Extract `accessToken` and `refreshToken` from an auth response.
    ///
    /// The tokens may sit at the top level or under a `data` envelope; the
    /// top level wins. Returns `None` when no access token is present.
    pub fn from_response(body: &Value) -> Option<Self> {
        let access_token = token_field(body, "accessToken")?;
        let refresh_token = token_field(body, "refreshToken");
        Some(Self {
            access_token: Secret::new(access_token),
            refresh_token: refresh_token.map(Secret::new),
        })
    }
}

fn response_field<'a>(body: &'a Value, name: &str) -> Option<&'a Value> {
    body.get(name)
        .filter(|v| !v.is_null())
        .or_else(|| body.get("data")?.get(name).filter(|v| !v.is_null()))
}

fn token_field(body: &Value, name: &str) -> Option<String> {
    response_field(body, name)?
        .as_str()
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Credentials plus profile returned by login, registration or an
/// OAuth/Telegram completion.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub credentials: CredentialPair,
    pub user: Option<Value>,
}

impl NewSession {
    pub fn new(credentials: CredentialPair) -> Self {
        Self {
            credentials,
            user: None,
        }
    }

    pub fn with_user(mut self, user: Value) -> Self {
        self.user = Some(user);
        self
    }

    /// Build a session from a login response body, picking up `user` the
    /// same way [`CredentialPair::from_response`] picks up the tokens.
    pub fn from_response(body: &Value) -> Option<Self> {
        Some(Self {
            credentials: CredentialPair::from_response(body)?,
            user: response_field(body, "user").cloned(),
        })
    }
}

/// Identifies one sign-in, from `establish` to `destroy`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Generation(u64);

/// A read-back view of the persisted session.
#[derive(Debug, Clone)]
pub struct StoredSession {
    pub credentials: CredentialPair,
    pub user: Option<Value>,
    /// When the access token stops being usable, taken from its `exp` claim
    /// or, failing that, from the entry's TTL.
    pub expires_at: Option<DateTime<Utc>>,
}

/// Typed access to the persisted session.
///
/// Cheap to clone; clones share the same backend and generation counter.
#[derive(Clone)]
pub struct SessionStore {
    backend: Arc<dyn SecretStore>,
    ttl: SessionTtl,
    /// Held while credentials are written or removed.
    generation: Arc<Mutex<u64>>,
}

impl SessionStore {
    pub fn new(backend: Arc<dyn SecretStore>, ttl: SessionTtl) -> Self {
        Self {
            backend,
            ttl,
            generation: Arc::new(Mutex::new(0)),
        }
    }

    fn key(name: &str) -> String {
        format!("{KEY_PREFIX}{name}")
    }

    pub async fn access_token(&self) -> Result<Option<Secret>, StoreError> {
        self.backend.get(&Self::key(ACCESS_TOKEN)).await
    }

    pub async fn refresh_token(&self) -> Result<Option<Secret>, StoreError> {
        self.backend.get(&Self::key(REFRESH_TOKEN)).await
    }

    /// The cached user profile.
    ///
    /// A snapshot that no longer parses is treated as absent.
    pub async fn user(&self) -> Result<Option<Value>, StoreError> {
        let Some(raw) = self.backend.get(&Self::key(USER)).await? else {
            return Ok(None);
        };
        match serde_json::from_str(raw.expose()) {
            Ok(user) => Ok(Some(user)),
            Err(e) => {
                tracing::warn!("Discarding unreadable user snapshot: {}", e);
                Ok(None)
            }
        }
    }

    pub async fn locale(&self) -> Result<Option<String>, StoreError> {
        Ok(self
            .backend
            .get(&Self::key(LOCALE))
            .await?
            .map(Secret::into_inner))
    }

    /// Raw entries, exposed for inspecting expiries.
    pub async fn access_entry(&self) -> Result<Option<StoredEntry>, StoreError> {
        self.backend.get_entry(&Self::key(ACCESS_TOKEN)).await
    }

    pub async fn user_entry(&self) -> Result<Option<StoredEntry>, StoreError> {
        self.backend.get_entry(&Self::key(USER)).await
    }

    pub async fn is_logged_in(&self) -> Result<bool, StoreError> {
        self.backend.exists(&Self::key(ACCESS_TOKEN)).await
    }

    /// The current generation together with the refresh token to renew it
    /// with, read atomically with respect to sign-in and sign-out.
    pub async fn renewal_source(&self) -> Result<(Generation, Option<Secret>), StoreError> {
        let generation = self.generation.lock().await;
        Ok((Generation(*generation), self.refresh_token().await?))
    }

    /// Persist a freshly signed-in session, replacing any previous one.
    pub async fn establish(&self, session: NewSession) -> Result<(), StoreError> {
        let mut generation = self.generation.lock().await;
        *generation += 1;

        let NewSession { credentials, user } = session;
        let expires_at = Utc::now() + self.ttl.access;

        self.backend
            .put(
                &Self::key(ACCESS_TOKEN),
                StoredEntry::until(credentials.access_token.clone(), expires_at),
            )
            .await?;
        match &credentials.refresh_token {
            Some(refresh) => {
                self.backend
                    .set(&Self::key(REFRESH_TOKEN), refresh, self.ttl.refresh)
                    .await?
            }
            None => self.backend.remove(&Self::key(REFRESH_TOKEN)).await?,
        }
        match user {
            Some(user) => {
                let raw = Secret::new(serde_json::to_string(&user)?);
                self.backend
                    .put(&Self::key(USER), StoredEntry::until(raw, expires_at))
                    .await?
            }
            None => self.backend.remove(&Self::key(USER)).await?,
        }

        tracing::info!("Session established");
        Ok(())
    }

    /// Commit the outcome of a successful renewal.
    ///
    /// The refresh token is only replaced when the server rotated it. The
    /// user snapshot is re-written with the access TTL so both entries keep
    /// the same expiry.
    pub async fn apply_renewal(&self, credentials: &CredentialPair) -> Result<(), StoreError> {
        let _generation = self.generation.lock().await;
        self.write_renewal(credentials).await
    }

    /// Commit renewed credentials only if `generation` is still current.
    ///
    /// Returns `false`, writing nothing, when the session was destroyed or
    /// replaced after the renewal started.
    pub async fn apply_renewal_for(
        &self,
        generation: Generation,
        credentials: &CredentialPair,
    ) -> Result<bool, StoreError> {
        let current = self.generation.lock().await;
        if Generation(*current) != generation {
            return Ok(false);
        }
        self.write_renewal(credentials).await?;
        Ok(true)
    }

    async fn write_renewal(&self, credentials: &CredentialPair) -> Result<(), StoreError> {
        let expires_at = Utc::now() + self.ttl.access;
        self.backend
            .put(
                &Self::key(ACCESS_TOKEN),
                StoredEntry::until(credentials.access_token.clone(), expires_at),
            )
            .await?;

        if let Some(refresh) = &credentials.refresh_token {
            self.backend
                .set(&Self::key(REFRESH_TOKEN), refresh, self.ttl.refresh)
                .await?;
        }

        if let Some(user) = self.backend.get(&Self::key(USER)).await? {
            self.backend
                .put(&Self::key(USER), StoredEntry::until(user, expires_at))
                .await?;
        }

        tracing::debug!(
            rotated_refresh = credentials.refresh_token.is_some(),
            "Renewed credentials committed"
        );
        Ok(())
    }

    /// Replace the cached profile, keeping it aligned with the access token.
    pub async fn set_user(&self, user: &Value) -> Result<(), StoreError> {
        self.write_user(user).await
    }

    pub async fn set_locale(&self, locale: &str) -> Result<(), StoreError> {
        self.backend
            .set(&Self::key(LOCALE), &Secret::new(locale), self.ttl.refresh)
            .await
    }

    async fn write_user(&self, user: &Value) -> Result<(), StoreError> {
        let raw = Secret::new(serde_json::to_string(user)?);
        let expires_at = match self.access_entry().await? {
            Some(entry) => entry.expires_at,
            None => Utc::now() + self.ttl.access,
        };
        self.backend
            .put(&Self::key(USER), StoredEntry::until(raw, expires_at))
            .await
    }

    /// Remove the credentials and the cached profile.
    ///
    /// Returns whether there was anything to remove, so callers can tell a
    /// real logout from a repeated one. The locale preference is kept.
    pub async fn destroy(&self) -> Result<bool, StoreError> {
        let mut generation = self.generation.lock().await;
        *generation += 1;

        let mut existed = false;
        for name in [ACCESS_TOKEN, REFRESH_TOKEN, USER] {
            let key = Self::key(name);
            if self.backend.exists(&key).await? {
                existed = true;
                self.backend.remove(&key).await?;
            }
        }

        if existed {
            tracing::info!("Session destroyed");
        }
        Ok(existed)
    }

    /// Read the whole session back, if one is live.
    pub async fn snapshot(&self) -> Result<Option<StoredSession>, StoreError> {
        let Some(access) = self.access_entry().await? else {
            return Ok(None);
        };

        let expires_at =
            codec::decode_expiry(access.value.expose()).or(Some(access.expires_at));

        Ok(Some(StoredSession {
            credentials: CredentialPair {
                access_token: access.value,
                refresh_token: self.refresh_token().await?,
            },
            user: self.user().await?,
            expires_at,
        }))
    }
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::testing::token_expiring_at;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn session_store() -> SessionStore {
        SessionStore::new(Arc::new(MemoryStore::new()), SessionTtl::default())
    }

    #[tokio::test]
    async fn test_establish_and_read_back() {
        let store = session_store();
        store
            .establish(
                NewSession::new(CredentialPair::new("access-1").with_refresh_token("refresh-1"))
                    .with_user(json!({ "id": 7, "name": "Ada" })),
            )
            .await
            .unwrap();

        assert!(store.is_logged_in().await.unwrap());
        assert_eq!(store.access_token().await.unwrap().unwrap().expose(), "access-1");
        assert_eq!(store.refresh_token().await.unwrap().unwrap().expose(), "refresh-1");
        assert_eq!(store.user().await.unwrap().unwrap()["name"], "Ada");
    }

    #[tokio::test]
    async fn test_establish_without_refresh_clears_stale_one() {
        let store = session_store();
        store
            .establish(NewSession::new(
                CredentialPair::new("a1").with_refresh_token("r1"),
            ))
            .await
            .unwrap();
        store
            .establish(NewSession::new(CredentialPair::new("a2")))
            .await
            .unwrap();

        assert!(store.refresh_token().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_apply_renewal_keeps_refresh_when_not_rotated() {
        let store = session_store();
        store
            .establish(NewSession::new(
                CredentialPair::new("old").with_refresh_token("refresh"),
            ))
            .await
            .unwrap();

        store.apply_renewal(&CredentialPair::new("new")).await.unwrap();

        assert_eq!(store.access_token().await.unwrap().unwrap().expose(), "new");
        assert_eq!(store.refresh_token().await.unwrap().unwrap().expose(), "refresh");
    }

    #[tokio::test]
    async fn test_apply_renewal_synchronizes_user_expiry() {
        let ttl = SessionTtl {
            access: Duration::hours(2),
            refresh: Duration::days(30),
        };
        let store = SessionStore::new(Arc::new(MemoryStore::new()), ttl);
        store
            .establish(
                NewSession::new(CredentialPair::new("old").with_refresh_token("r"))
                    .with_user(json!({ "id": 1 })),
            )
            .await
            .unwrap();

        store
            .apply_renewal(&CredentialPair::new("new").with_refresh_token("r2"))
            .await
            .unwrap();

        let access = store.access_entry().await.unwrap().unwrap();
        let user = store.user_entry().await.unwrap().unwrap();
        assert_eq!(user.expires_at, access.expires_at);
        assert_eq!(store.user().await.unwrap().unwrap()["id"], 1);
    }

    #[tokio::test]
    async fn test_set_user_follows_access_expiry() {
        let store = session_store();
        store
            .establish(NewSession::new(CredentialPair::new("a")))
            .await
            .unwrap();
        store.set_user(&json!({ "id": 2 })).await.unwrap();

        let access = store.access_entry().await.unwrap().unwrap();
        let user = store.user_entry().await.unwrap().unwrap();
        assert_eq!(user.expires_at, access.expires_at);
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent_and_keeps_locale() {
        let store = session_store();
        store.set_locale("uz").await.unwrap();
        store
            .establish(NewSession::new(CredentialPair::new("a").with_refresh_token("r")))
            .await
            .unwrap();

        assert!(store.destroy().await.unwrap());
        assert!(!store.destroy().await.unwrap());
        assert!(!store.is_logged_in().await.unwrap());
        assert_eq!(store.locale().await.unwrap().as_deref(), Some("uz"));
    }

    #[tokio::test]
    async fn test_snapshot_prefers_token_expiry() {
        let store = session_store();
        let expiry = Utc::now() + Duration::minutes(30);
        store
            .establish(NewSession::new(CredentialPair::new(token_expiring_at(expiry))))
            .await
            .unwrap();

        let snapshot = store.snapshot().await.unwrap().unwrap();
        assert_eq!(snapshot.expires_at.unwrap().timestamp(), expiry.timestamp());
    }

    #[tokio::test]
    async fn test_snapshot_falls_back_to_entry_ttl() {
        let store = session_store();
        store
            .establish(NewSession::new(CredentialPair::new("opaque")))
            .await
            .unwrap();

        let snapshot = store.snapshot().await.unwrap().unwrap();
        let entry = store.access_entry().await.unwrap().unwrap();
        assert_eq!(snapshot.expires_at, Some(entry.expires_at));
    }

    #[test]
    fn test_credentials_from_response_shapes() {
        let top = json!({ "accessToken": "a", "refreshToken": "r" });
        assert_eq!(
            CredentialPair::from_response(&top),
            Some(CredentialPair::new("a").with_refresh_token("r"))
        );

        let nested = json!({ "data": { "accessToken": "a" } });
        assert_eq!(CredentialPair::from_response(&nested), Some(CredentialPair::new("a")));

        assert!(CredentialPair::from_response(&json!({ "accessToken": "" })).is_none());
        assert!(CredentialPair::from_response(&json!({ "data": null })).is_none());
    }

    #[test]
    fn test_new_session_from_login_response() {
        let body = json!({
            "data": {
                "accessToken": "a",
                "refreshToken": "r",
                "user": { "id": 9, "role": "student" }
            }
        });
        let session = NewSession::from_response(&body).unwrap();
        assert_eq!(session.credentials.refresh_token.unwrap().expose(), "r");
        assert_eq!(session.user.unwrap()["role"], "student");
    }

    #[tokio::test]
    async fn test_renewal_for_destroyed_session_is_discarded() {
        let store = session_store();
        store
            .establish(NewSession::new(CredentialPair::new("a1").with_refresh_token("r1")))
            .await
            .unwrap();
        let (generation, refresh) = store.renewal_source().await.unwrap();
        assert_eq!(refresh.unwrap().expose(), "r1");

        store.destroy().await.unwrap();
        let applied = store
            .apply_renewal_for(generation, &CredentialPair::new("a2").with_refresh_token("r2"))
            .await
            .unwrap();

        assert!(!applied);
        assert!(!store.is_logged_in().await.unwrap());
        assert!(store.refresh_token().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_renewal_for_replaced_session_is_discarded() {
        let store = session_store();
        store
            .establish(NewSession::new(CredentialPair::new("a1").with_refresh_token("r1")))
            .await
            .unwrap();
        let (stale, _) = store.renewal_source().await.unwrap();
        store
            .establish(NewSession::new(CredentialPair::new("b1").with_refresh_token("s1")))
            .await
            .unwrap();

        assert!(!store.apply_renewal_for(stale, &CredentialPair::new("a2")).await.unwrap());
        assert_eq!(store.access_token().await.unwrap().unwrap().expose(), "b1");

        let (current, _) = store.renewal_source().await.unwrap();
        assert!(store.apply_renewal_for(current, &CredentialPair::new("b2")).await.unwrap());
        assert_eq!(store.access_token().await.unwrap().unwrap().expose(), "b2");
    }

    #[tokio::test]
    async fn test_snapshot_empty() {
        assert!(session_store().snapshot().await.unwrap().is_none());
    }
}
