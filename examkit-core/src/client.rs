//! The authenticated HTTP client.
//!
//! [`ApiClient`] is the single entry point screens use to talk to the
//! server. Each request runs through the [pipeline](crate::pipeline), which
//! attaches the locale and bearer credential, renews credentials when they
//! expire and reports failures on the [`EventBus`].
//!
//! # Example
//!
//! ```rust,ignore
//! use examkit_core::{ApiClient, ClientConfig};
//!
//! let client = ApiClient::builder(ClientConfig::default()).build()?;
//! let exams: serde_json::Value = client.get_json("exams?page=1").await?;
//! ```

use std::sync::Arc;

use reqwest::{Method, Request, RequestBuilder, Response, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use url::Url;

use crate::config::{ClientConfig, ConfigError, resolve_url};
use crate::events::EventBus;
use crate::pipeline::{Authentication, ErrorReporter, LocaleHeader, Middleware, Next};
use crate::renewal::{HttpRenewer, RenewalCoordinator, RenewalError, Renewer};
use crate::session::SessionStore;
use crate::store::{MemoryStore, SecretStore, StoreError};

/// Error type for requests issued through [`ApiClient`].
#[derive(Debug, Error)]
pub enum ApiError {
    /// The server answered with an error status.
    #[error("{status} from {url}: {message}")]
    Status {
        status: StatusCode,
        message: String,
        url: String,
    },

    /// The credential expired and could not be renewed; the session is gone.
    #[error("session expired: {0}")]
    SessionExpired(#[source] RenewalError),

    /// No response was received.
    #[error("could not reach {url}: {message}")]
    Network { url: String, message: String },

    #[error("request to {url} timed out")]
    Timeout { url: String },

    /// The request could not be built or sent.
    #[error("request error: {0}")]
    Request(#[source] reqwest::Error),

    /// The response body did not have the expected shape.
    #[error("could not decode response: {message}")]
    Decode { message: String },

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("configuration error: {message}")]
    Config { message: String },

    /// A stored value cannot be sent as a header.
    #[error("invalid {name} header value")]
    InvalidHeader { name: String },
}

impl ApiError {
    /// HTTP status associated with the failure, when there is one.
    ///
    /// An expired session reports `401`, the status that triggered it.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Status { status, .. } => Some(*status),
            Self::SessionExpired(_) => Some(StatusCode::UNAUTHORIZED),
            Self::Request(e) => e.status(),
            _ => None,
        }
    }

    pub fn is_session_expired(&self) -> bool {
        matches!(self, Self::SessionExpired(_))
    }

    /// Whether no response was received at all.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Network { .. } | Self::Timeout { .. })
    }

    pub(crate) fn from_transport(e: reqwest::Error) -> Self {
        let url = e.url().map(Url::to_string).unwrap_or_default();
        if e.is_timeout() {
            Self::Timeout { url }
        } else if e.is_builder() {
            Self::Request(e)
        } else {
            Self::Network {
                url,
                message: e.to_string(),
            }
        }
    }
}

impl From<ConfigError> for ApiError {
    fn from(e: ConfigError) -> Self {
        Self::Config { message: e.message }
    }
}

struct Inner {
    http: reqwest::Client,
    base_url: Url,
    middlewares: Vec<Arc<dyn Middleware>>,
    session: SessionStore,
    coordinator: Arc<RenewalCoordinator>,
    events: EventBus,
}

/// HTTP client with credential lifecycle management.
///
/// Cheap to clone; clones share the session, the renewal coordinator and the
/// event bus.
#[derive(Clone)]
pub struct ApiClient {
    inner: Arc<Inner>,
}

impl ApiClient {
    pub fn builder(config: ClientConfig) -> ApiClientBuilder {
        ApiClientBuilder::new(config)
    }

    pub fn base_url(&self) -> &Url {
        &self.inner.base_url
    }

    /// Start a request to `path`, relative to the base URL unless absolute.
    ///
    /// Send it with [`send`](Self::send); sending it with a plain
    /// `reqwest::Client` would bypass the pipeline.
    pub fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let target = match resolve_url(&self.inner.base_url, path) {
            Ok(url) => url.to_string(),
            // reqwest reports the parse failure when the request is built
            Err(_) => path.to_string(),
        };
        self.inner.http.request(method, target)
    }

    /// Run a prepared request through the pipeline.
    ///
    /// Resolves with any 2xx/3xx response; every other outcome is an
    /// [`ApiError`].
    pub async fn execute(&self, request: Request) -> Result<Response, ApiError> {
        tracing::debug!(method = %request.method(), url = %request.url(), "Sending request");
        Next::new(&self.inner.http, &self.inner.middlewares)
            .run(request)
            .await
    }

    pub async fn send(&self, builder: RequestBuilder) -> Result<Response, ApiError> {
        let request = builder.build().map_err(ApiError::Request)?;
        self.execute(request).await
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let response = self.send(self.request(Method::GET, path)).await?;
        decode_json(response).await
    }

    pub async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T, ApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let response = self.send(self.request(Method::POST, path).json(body)).await?;
        decode_json(response).await
    }

    pub fn session(&self) -> &SessionStore {
        &self.inner.session
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn coordinator(&self) -> &Arc<RenewalCoordinator> {
        &self.inner.coordinator
    }

    /// Sign out locally.
    ///
    /// A user-initiated logout, so no [`ForcedLogout`] is published. Returns
    /// whether a session existed.
    ///
    /// [`ForcedLogout`]: crate::events::SessionEvent::ForcedLogout
    pub async fn logout(&self) -> Result<bool, ApiError> {
        Ok(self.inner.session.destroy().await?)
    }
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("base_url", &self.inner.base_url.as_str())
            .field("middlewares", &self.inner.middlewares.len())
            .finish_non_exhaustive()
    }
}

async fn decode_json<T: DeserializeOwned>(response: Response) -> Result<T, ApiError> {
    let bytes = response.bytes().await.map_err(ApiError::from_transport)?;
    let parsed = if bytes.is_empty() {
        serde_json::from_value(serde_json::Value::Null)
    } else {
        serde_json::from_slice(&bytes)
    };
    parsed.map_err(|e| ApiError::Decode {
        message: e.to_string(),
    })
}

/// Builder for [`ApiClient`].
///
/// Without an explicit store the session lives in memory; without an
/// explicit renewer one is built from the configured refresh endpoint.
pub struct ApiClientBuilder {
    config: ClientConfig,
    store: Option<Arc<dyn SecretStore>>,
    renewer: Option<Arc<dyn Renewer>>,
    events: Option<EventBus>,
    http: Option<reqwest::Client>,
    middlewares: Vec<Arc<dyn Middleware>>,
}

impl ApiClientBuilder {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            store: None,
            renewer: None,
            events: None,
            http: None,
            middlewares: Vec::new(),
        }
    }

    pub fn store(mut self, store: Arc<dyn SecretStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn renewer(mut self, renewer: Arc<dyn Renewer>) -> Self {
        self.renewer = Some(renewer);
        self
    }

    pub fn event_bus(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Use a preconfigured transport for pipeline requests.
    pub fn http_client(mut self, http: reqwest::Client) -> Self {
        self.http = Some(http);
        self
    }

    /// Add a layer between the locale header and authentication.
    ///
    /// Layers run in the order they were added.
    pub fn with_middleware(mut self, middleware: impl Middleware) -> Self {
        self.middlewares.push(Arc::new(middleware));
        self
    }

    pub fn build(self) -> Result<ApiClient, ApiError> {
        let config = self.config;
        let base_url = config.validate()?;

        let store: Arc<dyn SecretStore> = match self.store {
            Some(store) => store,
            None => Arc::new(MemoryStore::new()),
        };
        let session = SessionStore::new(store, config.session_ttl());
        let events = self.events.unwrap_or_default();

        let renewer: Arc<dyn Renewer> = match self.renewer {
            Some(renewer) => renewer,
            None => Arc::new(
                HttpRenewer::new(config.refresh_url()?, config.request_timeout())
                    .map_err(ApiError::Request)?,
            ),
        };
        let coordinator = Arc::new(RenewalCoordinator::new(
            session.clone(),
            renewer,
            events.clone(),
        ));

        let http = match self.http {
            Some(http) => http,
            None => reqwest::Client::builder()
                .timeout(config.request_timeout())
                .build()
                .map_err(ApiError::Request)?,
        };

        let mut middlewares: Vec<Arc<dyn Middleware>> = vec![
            Arc::new(ErrorReporter::new(events.clone())),
            Arc::new(LocaleHeader::new(session.clone(), config.default_locale.clone())),
        ];
        middlewares.extend(self.middlewares);
        middlewares.push(Arc::new(Authentication::new(
            session.clone(),
            coordinator.clone(),
            config.renewal_horizon(),
        )));

        tracing::debug!(%base_url, layers = middlewares.len(), "API client ready");

        Ok(ApiClient {
            inner: Arc::new(Inner {
                http,
                base_url,
                middlewares,
                session,
                coordinator,
                events,
            }),
        })
    }
}
