//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use examkit_core::{ApiClient, ClientConfig, CredentialPair, NewSession, SessionEvent};
use tokio::sync::broadcast;
use wiremock::MockServer;

/// An unsigned three-part token whose payload carries `exp`.
pub fn token_expiring_at(expiry: DateTime<Utc>) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(
        serde_json::json!({ "sub": "student-1", "exp": expiry.timestamp() }).to_string(),
    );
    format!("{header}.{payload}.sig")
}

pub fn config_for(base_url: &str) -> ClientConfig {
    ClientConfig {
        base_url: base_url.to_string(),
        request_timeout_secs: 5,
        ..Default::default()
    }
}

/// A client talking to `server` with an in-memory session.
pub fn client_for(server: &MockServer) -> ApiClient {
    ApiClient::builder(config_for(&server.uri())).build().unwrap()
}

pub async fn sign_in(client: &ApiClient, access: &str, refresh: Option<&str>) {
    let mut credentials = CredentialPair::new(access);
    if let Some(refresh) = refresh {
        credentials = credentials.with_refresh_token(refresh);
    }
    client
        .session()
        .establish(NewSession::new(credentials))
        .await
        .unwrap();
}

/// Everything published so far.
pub fn drain(rx: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

pub fn forced_logouts(events: &[SessionEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, SessionEvent::ForcedLogout))
        .count()
}
