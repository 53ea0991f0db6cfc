//! Session event bus.
//!
//! The pipeline announces session termination and transport failures here;
//! UI layers subscribe and decide how to present them. Delivery is
//! fire-and-forget: nothing is persisted, late subscribers miss earlier
//! events, and duplicates are the subscriber's problem.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Buffered events per subscriber before the slowest one starts lagging.
const EVENT_CAPACITY: usize = 64;

/// Class of a failure announced on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApiErrorKind {
    /// `403`: the session is fine, the action is not permitted.
    AccessDenied,
    /// `5xx`.
    ServerError,
    /// No response at all (DNS, refused connection, timeout).
    Connectivity,
}

/// Payload of an `api-error` announcement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApiErrorEvent {
    pub kind: ApiErrorKind,
    /// HTTP status, absent for connectivity failures.
    pub status: Option<u16>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Events published by the client core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "topic", rename_all = "kebab-case")]
pub enum SessionEvent {
    /// The stored session was destroyed; the user has to sign in again.
    ForcedLogout,
    /// A request failed in a way the UI may want to surface.
    ApiError(ApiErrorEvent),
}

impl SessionEvent {
    pub fn access_denied(message: impl Into<String>, url: Option<String>) -> Self {
        Self::ApiError(ApiErrorEvent {
            kind: ApiErrorKind::AccessDenied,
            status: Some(403),
            message: message.into(),
            url,
        })
    }

    pub fn server_error(status: u16, message: impl Into<String>, url: Option<String>) -> Self {
        Self::ApiError(ApiErrorEvent {
            kind: ApiErrorKind::ServerError,
            status: Some(status),
            message: message.into(),
            url,
        })
    }

    pub fn connectivity(message: impl Into<String>, url: Option<String>) -> Self {
        Self::ApiError(ApiErrorEvent {
            kind: ApiErrorKind::Connectivity,
            status: None,
            message: message.into(),
            url,
        })
    }
}

/// Something that reacts to session events, typically a UI store deriving
/// "is the user signed in".
pub trait SessionObserver: Send + Sync + 'static {
    fn on_event(&self, event: &SessionEvent);
}

/// Process-wide publish/subscribe channel for [`SessionEvent`]s.
///
/// Clones share the same channel. Construct one per client and hand it to
/// whatever needs to listen.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SessionEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    /// Publish an event to every current subscriber.
    ///
    /// Never blocks and never fails; with no subscribers the event is dropped.
    pub fn publish(&self, event: SessionEvent) {
        tracing::debug!(?event, "Publishing session event");
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Forward every event to `observer` from a background task.
    ///
    /// The task ends when the last clone of the bus is dropped. A lagging
    /// observer skips the events it missed.
    pub fn attach(&self, observer: Arc<dyn SessionObserver>) -> JoinHandle<()> {
        let mut rx = self.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => observer.on_event(&event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Session observer lagged behind");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<SessionEvent>>,
    }

    impl SessionObserver for Recorder {
        fn on_event(&self, event: &SessionEvent) {
            self.seen.lock().push(event.clone());
        }
    }

    #[test]
    fn test_publish_without_subscribers_is_silent() {
        let bus = EventBus::new();
        bus.publish(SessionEvent::ForcedLogout);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_subscribers_receive_in_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(SessionEvent::access_denied("nope", None));
        bus.publish(SessionEvent::ForcedLogout);

        assert_eq!(rx.recv().await.unwrap(), SessionEvent::access_denied("nope", None));
        assert_eq!(rx.recv().await.unwrap(), SessionEvent::ForcedLogout);
    }

    #[tokio::test]
    async fn test_duplicates_are_delivered() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(SessionEvent::ForcedLogout);
        bus.publish(SessionEvent::ForcedLogout);

        assert_eq!(rx.recv().await.unwrap(), SessionEvent::ForcedLogout);
        assert_eq!(rx.recv().await.unwrap(), SessionEvent::ForcedLogout);
    }

    #[tokio::test]
    async fn test_attach_forwards_to_observer() {
        let bus = EventBus::new();
        let recorder = Arc::new(Recorder::default());
        let handle = bus.attach(recorder.clone());

        bus.publish(SessionEvent::server_error(502, "bad gateway", Some("/x".into())));
        drop(bus);
        handle.await.unwrap();

        let seen = recorder.seen.lock();
        assert_eq!(seen.len(), 1);
        assert!(matches!(
            &seen[0],
            SessionEvent::ApiError(ApiErrorEvent {
                kind: ApiErrorKind::ServerError,
                status: Some(502),
                ..
            })
        ));
    }

    #[test]
    fn test_event_serializes_with_topic() {
        let json = serde_json::to_value(SessionEvent::connectivity("offline", None)).unwrap();
        assert_eq!(json["topic"], "api-error");
        assert_eq!(json["kind"], "connectivity");
        assert!(json["status"].is_null());
        assert!(json.get("url").is_none());
    }
}
