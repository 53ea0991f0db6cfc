//! Request pipeline.
//!
//! Every request issued through [`ApiClient`](crate::ApiClient) walks an
//! ordered chain of [`Middleware`] layers before reaching the transport:
//!
//! ```text
//!   ErrorReporter ─► LocaleHeader ─► (custom layers) ─► Authentication ─► reqwest
//! ```
//!
//! A layer sees the request on the way in and the outcome on the way out.
//! [`Authentication`] is innermost, so when it replays a request the replay
//! only goes through the transport and can never reach renewal again.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::{ACCEPT_LANGUAGE, AUTHORIZATION, HeaderValue};
use reqwest::{Request, Response, StatusCode};

use crate::client::ApiError;
use crate::codec;
use crate::error::message_from_body;
use crate::events::{EventBus, SessionEvent};
use crate::renewal::{RenewalCoordinator, RenewalPath};
use crate::session::SessionStore;
use crate::store::Secret;

/// One layer of the request pipeline.
#[async_trait]
pub trait Middleware: Send + Sync + 'static {
    /// Handle `request`, usually by adjusting it and passing it to `next`.
    async fn handle(&self, request: Request, next: Next<'_>) -> Result<Response, ApiError>;
}

/// The remainder of the chain after the current layer.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    client: &'a reqwest::Client,
    middlewares: &'a [Arc<dyn Middleware>],
}

impl<'a> Next<'a> {
    pub(crate) fn new(client: &'a reqwest::Client, middlewares: &'a [Arc<dyn Middleware>]) -> Self {
        Self {
            client,
            middlewares,
        }
    }

    /// Pass the request to the next layer, or to the transport when none is
    /// left.
    pub async fn run(self, request: Request) -> Result<Response, ApiError> {
        match self.middlewares.split_first() {
            Some((current, rest)) => {
                current
                    .handle(
                        request,
                        Next {
                            client: self.client,
                            middlewares: rest,
                        },
                    )
                    .await
            }
            None => self
                .client
                .execute(request)
                .await
                .map_err(ApiError::from_transport),
        }
    }
}

impl std::fmt::Debug for Next<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Next")
            .field("remaining", &self.middlewares.len())
            .finish()
    }
}

/// Outermost layer: turns failed outcomes into [`ApiError`]s and announces
/// the ones the UI cares about.
///
/// | outcome | event | error |
/// |---|---|---|
/// | `403` | `AccessDenied` | `Status` |
/// | `5xx` | `ServerError` | `Status` |
/// | no response | `Connectivity` | `Network` / `Timeout` |
/// | other `4xx` | none | `Status` |
///
/// A `403` never ends the session: it means the action is forbidden, not
/// that the credentials are bad.
#[derive(Debug, Clone)]
pub struct ErrorReporter {
    events: EventBus,
}

impl ErrorReporter {
    pub fn new(events: EventBus) -> Self {
        Self { events }
    }
}

#[async_trait]
impl Middleware for ErrorReporter {
    async fn handle(&self, request: Request, next: Next<'_>) -> Result<Response, ApiError> {
        let url = request.url().to_string();

        let response = match next.run(request).await {
            Ok(response) => response,
            Err(e @ (ApiError::Network { .. } | ApiError::Timeout { .. })) => {
                self.events
                    .publish(SessionEvent::connectivity(e.to_string(), Some(url)));
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        let status = response.status();
        if !status.is_client_error() && !status.is_server_error() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let message = message_from_body(&body, status);

        if status == StatusCode::FORBIDDEN {
            tracing::debug!(%url, "Access denied");
            self.events
                .publish(SessionEvent::access_denied(message.clone(), Some(url.clone())));
        } else if status.is_server_error() {
            tracing::debug!(%url, %status, "Server error");
            self.events.publish(SessionEvent::server_error(
                status.as_u16(),
                message.clone(),
                Some(url.clone()),
            ));
        }

        Err(ApiError::Status {
            status,
            message,
            url,
        })
    }
}

/// Sets `Accept-Language` from the stored locale preference.
#[derive(Debug, Clone)]
pub struct LocaleHeader {
    session: SessionStore,
    default_locale: String,
}

impl LocaleHeader {
    pub fn new(session: SessionStore, default_locale: impl Into<String>) -> Self {
        Self {
            session,
            default_locale: default_locale.into(),
        }
    }

    async fn locale(&self) -> String {
        match self.session.locale().await {
            Ok(Some(locale)) => locale,
            Ok(None) => self.default_locale.clone(),
            Err(e) => {
                tracing::warn!("Could not read locale preference: {}", e);
                self.default_locale.clone()
            }
        }
    }
}

#[async_trait]
impl Middleware for LocaleHeader {
    async fn handle(&self, mut request: Request, next: Next<'_>) -> Result<Response, ApiError> {
        if !request.headers().contains_key(ACCEPT_LANGUAGE) {
            let locale = self.locale().await;
            match HeaderValue::from_str(&locale) {
                Ok(value) => {
                    request.headers_mut().insert(ACCEPT_LANGUAGE, value);
                }
                Err(_) => tracing::warn!(%locale, "Ignoring unusable locale"),
            }
        }
        next.run(request).await
    }
}

/// Attaches the bearer credential and recovers from an expired one.
///
/// Outbound, a token about to expire is renewed first (joining any renewal
/// already in flight); if that fails the current token is sent anyway.
/// Inbound, a `401` is answered by renewing and replaying the request once.
pub struct Authentication {
    session: SessionStore,
    coordinator: Arc<RenewalCoordinator>,
    horizon: chrono::Duration,
}

impl Authentication {
    pub fn new(
        session: SessionStore,
        coordinator: Arc<RenewalCoordinator>,
        horizon: chrono::Duration,
    ) -> Self {
        Self {
            session,
            coordinator,
            horizon,
        }
    }

    /// The token to send, renewed ahead of time when it is about to expire.
    async fn outbound_token(&self) -> Result<Option<Secret>, ApiError> {
        let Some(token) = self.session.access_token().await? else {
            return Ok(None);
        };
        if !codec::is_expiring_soon(token.expose(), self.horizon) {
            return Ok(Some(token));
        }

        tracing::debug!("Access token close to expiry, renewing");
        match self.coordinator.renew(RenewalPath::Proactive).await {
            Ok(renewed) => Ok(Some(renewed)),
            Err(e) => {
                tracing::warn!("Proactive renewal failed, sending current token: {}", e);
                Ok(Some(token))
            }
        }
    }

    async fn recover(
        &self,
        rejected: Response,
        sent: Option<Secret>,
        replay: Option<Request>,
        next: Next<'_>,
    ) -> Result<Response, ApiError> {
        if self.session.refresh_token().await?.is_none() {
            // The session this request was signed with already ended in a
            // failed renewal; report it the way the other requests saw it.
            if sent.is_some() && self.session.access_token().await?.is_none() {
                if let Some(failure) = self.coordinator.last_failure() {
                    tracing::debug!("Access token rejected after the session expired");
                    return Err(ApiError::SessionExpired(failure));
                }
            }
            tracing::info!("Access token rejected and no refresh token stored");
            self.coordinator.terminate_session().await;
            return Ok(rejected);
        }

        let Some(mut replay) = replay else {
            tracing::warn!(url = %rejected.url(), "Rejected request cannot be replayed");
            return Ok(rejected);
        };

        let token = match (self.session.access_token().await?, sent) {
            (Some(stored), Some(sent)) if stored != sent => {
                tracing::debug!("Access token changed while the request was in flight");
                stored
            }
            _ => self
                .coordinator
                .renew(RenewalPath::Reactive)
                .await
                .map_err(ApiError::SessionExpired)?,
        };

        set_bearer(&mut replay, &token)?;
        tracing::debug!(url = %replay.url(), "Replaying request with renewed token");
        next.run(replay).await
    }
}

impl std::fmt::Debug for Authentication {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authentication")
            .field("horizon", &self.horizon)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Middleware for Authentication {
    async fn handle(&self, mut request: Request, next: Next<'_>) -> Result<Response, ApiError> {
        let token = self.outbound_token().await?;
        if let Some(token) = &token {
            set_bearer(&mut request, token)?;
        }

        let replay = request.try_clone();
        let response = next.run(request).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        self.recover(response, token, replay, next).await
    }
}

fn set_bearer(request: &mut Request, token: &Secret) -> Result<(), ApiError> {
    let mut value = HeaderValue::from_str(&format!("Bearer {}", token.expose())).map_err(|_| {
        ApiError::InvalidHeader {
            name: AUTHORIZATION.to_string(),
        }
    })?;
    value.set_sensitive(true);
    request.headers_mut().insert(AUTHORIZATION, value);
    Ok(())
}
