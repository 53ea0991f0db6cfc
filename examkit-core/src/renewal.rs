//! Single-flight credential renewal.
//!
//! [`RenewalCoordinator`] guarantees that at most one renewal request is in
//! flight at any time. The first caller to ask for a renewal becomes the
//! leader and performs the network call; everyone who asks while it is
//! running parks a continuation on the waiter queue and receives the
//! leader's outcome.
//!
//! Two paths lead here:
//!
//! - **Proactive**: the outbound phase noticed the access token is about to
//!   expire. Failure is harmless, the caller keeps the old token.
//! - **Reactive**: the server already rejected the token with `401`. Failure
//!   means the session is over: it is destroyed and
//!   [`SessionEvent::ForcedLogout`] is published once.
//!
//! ```text
//!            renew()                    outcome
//!   Idle ───────────────► Renewing ───────────────► Settled
//!    ▲                     │  ▲ renew() joins          │
//!    └── leader cancelled ─┘  └─ the waiter queue      │ renew()
//!                                                      ▼
//!                                                   Renewing
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};
use thiserror::Error;
use tokio::sync::oneshot;
use url::Url;

use crate::error::message_from_body;
use crate::events::{EventBus, SessionEvent};
use crate::session::{CredentialPair, SessionStore};
use crate::store::Secret;

/// Why a renewal was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewalPath {
    /// Ahead of expiry, from the outbound phase.
    Proactive,
    /// After the server answered `401`.
    Reactive,
}

/// Error type for renewal operations.
///
/// Cloneable so one outcome can be handed to every waiter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RenewalError {
    /// The session has no refresh token to renew with.
    #[error("no refresh token available")]
    NoRefreshToken,

    /// The renewal endpoint answered with a non-success status.
    #[error("renewal rejected with status {status}: {message}")]
    Rejected { status: u16, message: String },

    /// The renewal endpoint answered 2xx without an access token.
    #[error("renewal response did not contain an access token")]
    MissingAccessToken,

    /// The renewal request never got a response.
    #[error("renewal request failed: {message}")]
    Network { message: String },

    /// The renewal request exceeded its timeout.
    #[error("renewal request timed out")]
    Timeout,

    /// Renewed credentials could not be persisted.
    #[error("could not persist renewed credentials: {message}")]
    Store { message: String },

    /// The leader was cancelled before the renewal settled, or the session
    /// it was renewing ended in the meantime.
    #[error("renewal was abandoned before it settled")]
    Abandoned,
}

impl RenewalError {
    fn from_transport(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else {
            Self::Network {
                message: e.to_string(),
            }
        }
    }
}

impl From<crate::store::StoreError> for RenewalError {
    fn from(e: crate::store::StoreError) -> Self {
        Self::Store {
            message: e.to_string(),
        }
    }
}

/// Performs the renewal network call.
///
/// The seam between the coordinator's bookkeeping and the transport; tests
/// substitute a scripted implementation.
#[async_trait]
pub trait Renewer: Send + Sync {
    /// Exchange a refresh token for a new credential pair.
    ///
    /// A pair without a refresh token means the server kept the old one.
    async fn renew(&self, refresh_token: &Secret) -> Result<CredentialPair, RenewalError>;
}

/// [`Renewer`] that POSTs to the renewal endpoint.
///
/// Owns a plain `reqwest::Client` that never passes through the request
/// pipeline, so a renewal call can never trigger another renewal.
#[derive(Debug, Clone)]
pub struct HttpRenewer {
    client: reqwest::Client,
    endpoint: Url,
}

impl HttpRenewer {
    pub fn new(endpoint: Url, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, endpoint })
    }
}

#[async_trait]
impl Renewer for HttpRenewer {
    async fn renew(&self, refresh_token: &Secret) -> Result<CredentialPair, RenewalError> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(&json!({ "refreshToken": refresh_token.expose() }))
            .send()
            .await
            .map_err(RenewalError::from_transport)?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(RenewalError::from_transport)?;

        if !status.is_success() {
            return Err(RenewalError::Rejected {
                status: status.as_u16(),
                message: message_from_body(&body, status),
            });
        }

        let value: Value =
            serde_json::from_str(&body).map_err(|_| RenewalError::MissingAccessToken)?;
        CredentialPair::from_response(&value).ok_or(RenewalError::MissingAccessToken)
    }
}

/// Observable state of the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewalPhase {
    Idle,
    Renewing(RenewalPath),
    Succeeded,
    Failed,
}

type Waiter = oneshot::Sender<Result<Secret, RenewalError>>;

enum RenewalState {
    Idle,
    Renewing {
        path: RenewalPath,
        /// Set when the operation started reactively or a reactive caller
        /// joined it; a failure then ends the session.
        terminate_on_failure: bool,
        waiters: Vec<Waiter>,
    },
    Settled {
        failure: Option<RenewalError>,
    },
}

/// Serializes renewals into a single in-flight operation.
pub struct RenewalCoordinator {
    session: SessionStore,
    renewer: Arc<dyn Renewer>,
    events: EventBus,
    state: Mutex<RenewalState>,
}

impl RenewalCoordinator {
    pub fn new(session: SessionStore, renewer: Arc<dyn Renewer>, events: EventBus) -> Self {
        Self {
            session,
            renewer,
            events,
            state: Mutex::new(RenewalState::Idle),
        }
    }

    pub fn phase(&self) -> RenewalPhase {
        match &*self.state.lock() {
            RenewalState::Idle => RenewalPhase::Idle,
            RenewalState::Renewing { path, .. } => RenewalPhase::Renewing(*path),
            RenewalState::Settled { failure: None } => RenewalPhase::Succeeded,
            RenewalState::Settled { failure: Some(_) } => RenewalPhase::Failed,
        }
    }

    /// The error the last settled renewal failed with, if it failed.
    pub fn last_failure(&self) -> Option<RenewalError> {
        match &*self.state.lock() {
            RenewalState::Settled { failure } => failure.clone(),
            _ => None,
        }
    }

    pub fn is_renewing(&self) -> bool {
        matches!(self.phase(), RenewalPhase::Renewing(_))
    }

    /// Renew the credential pair, or wait for the renewal already in flight.
    ///
    /// Returns the access token that is current once the renewal settled.
    pub async fn renew(&self, path: RenewalPath) -> Result<Secret, RenewalError> {
        let parked = {
            let mut state = self.state.lock();
            match &mut *state {
                RenewalState::Renewing {
                    terminate_on_failure,
                    waiters,
                    ..
                } => {
                    *terminate_on_failure |= path == RenewalPath::Reactive;
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    Some(rx)
                }
                _ => {
                    *state = RenewalState::Renewing {
                        path,
                        terminate_on_failure: path == RenewalPath::Reactive,
                        waiters: Vec::new(),
                    };
                    None
                }
            }
        };

        if let Some(rx) = parked {
            tracing::debug!(?path, "Waiting for in-flight renewal");
            return rx.await.unwrap_or(Err(RenewalError::Abandoned));
        }

        tracing::debug!(?path, "Starting renewal");
        let leader = Leader {
            coordinator: self,
            armed: true,
        };
        let outcome = self.perform().await;
        leader.settle(path, outcome).await
    }

    async fn perform(&self) -> Result<Secret, RenewalError> {
        let (generation, refresh_token) = self.session.renewal_source().await?;
        let refresh_token = refresh_token.ok_or(RenewalError::NoRefreshToken)?;

        let credentials = self.renewer.renew(&refresh_token).await?;
        if !self.session.apply_renewal_for(generation, &credentials).await? {
            tracing::info!("Session ended during renewal, discarding renewed credentials");
            return Err(RenewalError::Abandoned);
        }
        Ok(credentials.access_token)
    }

    /// Destroy the stored session and announce it.
    ///
    /// Publishes [`SessionEvent::ForcedLogout`] only when there was a session
    /// to destroy, so repeated calls are silent. Returns whether the event
    /// was published.
    pub async fn terminate_session(&self) -> bool {
        match self.session.destroy().await {
            Ok(true) => {
                tracing::warn!("Session terminated, sign-in required");
                self.events.publish(SessionEvent::ForcedLogout);
                true
            }
            Ok(false) => false,
            Err(e) => {
                tracing::error!("Failed to destroy session: {}", e);
                self.events.publish(SessionEvent::ForcedLogout);
                true
            }
        }
    }

    fn terminate_requested(&self) -> bool {
        matches!(
            &*self.state.lock(),
            RenewalState::Renewing {
                terminate_on_failure: true,
                ..
            }
        )
    }
}

impl std::fmt::Debug for RenewalCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenewalCoordinator")
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}

/// Ownership of the in-flight renewal.
///
/// If the leader's future is dropped before settling, the state returns to
/// idle and every waiter receives [`RenewalError::Abandoned`].
struct Leader<'a> {
    coordinator: &'a RenewalCoordinator,
    armed: bool,
}

impl Leader<'_> {
    async fn settle(
        mut self,
        path: RenewalPath,
        outcome: Result<Secret, RenewalError>,
    ) -> Result<Secret, RenewalError> {
        let coordinator = self.coordinator;

        // An abandoned renewal belongs to a session that is already gone.
        let abandoned = matches!(outcome, Err(RenewalError::Abandoned));
        let mut terminated = false;
        if let Err(e) = &outcome {
            if abandoned {
                tracing::debug!(?path, "Renewal outlived its session");
            } else if coordinator.terminate_requested() {
                tracing::error!(?path, "Renewal failed: {}", e);
                coordinator.terminate_session().await;
                terminated = true;
            } else {
                tracing::warn!(?path, "Renewal failed, keeping current credentials: {}", e);
            }
        }

        let (waiters, late_terminate) = {
            let mut state = coordinator.state.lock();
            let previous = std::mem::replace(
                &mut *state,
                RenewalState::Settled {
                    failure: outcome.as_ref().err().cloned(),
                },
            );
            match previous {
                RenewalState::Renewing {
                    waiters,
                    terminate_on_failure,
                    ..
                } => (waiters, terminate_on_failure),
                _ => (Vec::new(), false),
            }
        };
        self.armed = false;

        if outcome.is_err() && late_terminate && !terminated && !abandoned {
            coordinator.terminate_session().await;
        }

        if outcome.is_ok() {
            tracing::info!(?path, waiters = waiters.len(), "Credentials renewed");
        }
        for waiter in waiters {
            let _ = waiter.send(outcome.clone());
        }
        outcome
    }
}

impl Drop for Leader<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let previous = std::mem::replace(&mut *self.coordinator.state.lock(), RenewalState::Idle);
        if let RenewalState::Renewing { waiters, .. } = previous {
            tracing::warn!(waiters = waiters.len(), "Renewal abandoned");
            for waiter in waiters {
                let _ = waiter.send(Err(RenewalError::Abandoned));
            }
        }
    }
}
