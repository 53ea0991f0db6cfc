//! # examkit Core
//!
//! Client core for the examkit exam-preparation service.
//!
//! This crate provides:
//! - An authenticated HTTP client that attaches bearer credentials and the
//!   preferred locale to every request
//! - Single-flight credential renewal, proactive ahead of expiry and
//!   reactive after a `401`, with one replay per rejected request
//! - Session persistence with per-entry expiry on memory, file or OS keyring
//!   backends
//! - A session event bus announcing forced logouts and request failures
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use examkit_core::{ApiClient, ClientConfig, SessionEvent};
//!
//! let client = ApiClient::builder(ClientConfig::default()).build()?;
//! let mut events = client.events().subscribe();
//!
//! let profile: serde_json::Value = client.get_json("users/me").await?;
//!
//! if let Ok(SessionEvent::ForcedLogout) = events.try_recv() {
//!     // back to the sign-in screen
//! }
//! ```

pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod events;
pub mod pipeline;
pub mod renewal;
pub mod session;
pub mod store;

// Re-export commonly used types at crate root
pub use client::{
    ApiClient,
    ApiClientBuilder,
    ApiError,
};

pub use config::{
    ClientConfig,
    ConfigError,
};

pub use error::ExamkitError;

pub use events::{
    ApiErrorEvent,
    ApiErrorKind,
    EventBus,
    SessionEvent,
    SessionObserver,
};

pub use pipeline::{
    Middleware,
    Next,
};

pub use renewal::{
    HttpRenewer,
    RenewalCoordinator,
    RenewalError,
    RenewalPath,
    RenewalPhase,
    Renewer,
};

pub use session::{
    CredentialPair,
    Generation,
    NewSession,
    SessionStore,
    SessionTtl,
    StoredSession,
};

pub use store::{
    FileStore,
    MemoryStore,
    Secret,
    SecretStore,
    StoreBackend,
    StoreError,
    StoredEntry,
    create_store,
};

#[cfg(feature = "keyring-store")]
pub use store::KeyringStore;
