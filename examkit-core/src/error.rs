//! Top-level error types for examkit.

use reqwest::StatusCode;
use serde_json::Value;
use thiserror::Error;

use crate::client::ApiError;
use crate::config::ConfigError;
use crate::renewal::RenewalError;
use crate::store::StoreError;

/// Top-level error type encompassing all examkit errors.
#[derive(Debug, Error)]
pub enum ExamkitError {
    /// Error from secret storage operations.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Error from credential renewal.
    #[error("renewal error: {0}")]
    Renewal(#[from] RenewalError),

    /// Error from a request issued through the pipeline.
    #[error("api error: {0}")]
    Api(#[from] ApiError),

    /// Configuration error.
    #[error("configuration error: {message}")]
    Config { message: String },
}

impl From<ConfigError> for ExamkitError {
    fn from(e: ConfigError) -> Self {
        Self::Config { message: e.message }
    }
}

/// Longest raw body that is still quoted verbatim in an error message.
const MAX_RAW_MESSAGE: usize = 200;

/// Pull a human-readable message out of an error response body.
///
/// Understands `{"message": ..}`, `{"error": ..}` (string or object with a
/// `message`) and `{"detail": ..}`. Short plain-text bodies are used as is;
/// anything else falls back to the status reason.
pub(crate) fn message_from_body(body: &str, status: StatusCode) -> String {
    if let Ok(value) = serde_json::from_str::<Value>(body) {
        let found = value
            .get("message")
            .and_then(Value::as_str)
            .or_else(|| value.get("error").and_then(Value::as_str))
            .or_else(|| {
                value
                    .get("error")
                    .and_then(|e| e.get("message"))
                    .and_then(Value::as_str)
            })
            .or_else(|| value.get("detail").and_then(Value::as_str));
        if let Some(message) = found {
            return message.to_string();
        }
    } else {
        let trimmed = body.trim();
        if !trimmed.is_empty() && trimmed.len() <= MAX_RAW_MESSAGE && !trimmed.starts_with('<') {
            return trimmed.to_string();
        }
    }

    status
        .canonical_reason()
        .map(str::to_string)
        .unwrap_or_else(|| status.to_string())
}
