//! Message router: one validated frame in, at most one handler execution and
//! one response out
//!
//! The router is the only component that touches the dedup store. Frames it
//! cannot attribute (blank message id, blank or malformed envelope, unknown
//! request type) are dropped without acknowledgment; whether the broker
//! redelivers those is its own policy. Routed frames are always acknowledged,
//! including the duplicate-skip and handler-failure paths.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, error, warn};

use crate::connection::ResponsePublisher;
use crate::dedup::{lock_key, DedupLockStore};
use crate::protocol::{
    Frame, ResponseBody, WorkEnvelope, ENVELOPE_HEADER, MESSAGE_ID_HEADER,
};

use super::HandlerRegistry;

/// What the router did with one frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Handler ran; response published when a destination was given
    Completed,
    /// Another execution owns this unit of work; handler skipped, frame acked
    DuplicateSkipped,
    /// Handler failed; logged and swallowed, lock released, frame acked
    HandlerFailed,
    /// Missing message id/payload or off-schema envelope; dropped, not acked
    DroppedMalformed,
    /// No handler registered for the request type; dropped, not acked, lock
    /// never consulted
    DroppedUnroutable,
}

/// Routes inbound frames to registered handlers with dedup and explicit ack
pub struct MessageRouter {
    registry: Arc<HandlerRegistry>,
    locks: Arc<dyn DedupLockStore>,
    publisher: Arc<dyn ResponsePublisher>,
    stats: RouterStats,
}

#[derive(Default)]
struct RouterStats {
    completed: AtomicU64,
    duplicates_skipped: AtomicU64,
    handler_failures: AtomicU64,
    dropped: AtomicU64,
}

/// Point-in-time router counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouterStatsSnapshot {
    pub completed: u64,
    pub duplicates_skipped: u64,
    pub handler_failures: u64,
    pub dropped: u64,
}

impl MessageRouter {
    pub fn new(
        registry: Arc<HandlerRegistry>,
        locks: Arc<dyn DedupLockStore>,
        publisher: Arc<dyn ResponsePublisher>,
    ) -> Self {
        Self {
            registry,
            locks,
            publisher,
            stats: RouterStats::default(),
        }
    }

    /// Route one inbound frame end to end
    pub async fn route(&self, frame: &Frame) -> RouteOutcome {
        let message_id = frame.get_header(MESSAGE_ID_HEADER).unwrap_or("").trim();
        let raw_envelope = frame.get_header(ENVELOPE_HEADER).unwrap_or("").trim();

        if message_id.is_empty() || raw_envelope.is_empty() {
            warn!("frame missing message id or payload; dropping without ack");
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            return RouteOutcome::DroppedMalformed;
        }

        let envelope = match WorkEnvelope::decode(raw_envelope) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(message_id, error = %e, "dropping frame without ack");
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                return RouteOutcome::DroppedMalformed;
            }
        };

        let handler = match self.registry.lookup(envelope.request_type).await {
            Some(handler) => handler,
            None => {
                warn!(
                    message_id,
                    request_type = %envelope.request_type,
                    "no handler registered; dropping frame without ack"
                );
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                return RouteOutcome::DroppedUnroutable;
            }
        };

        let (key, token) = lock_key(envelope.request_type, &envelope.payload);
        let acquired = match self.locks.acquire(&key, &token).await {
            Ok(acquired) => acquired,
            Err(e) => {
                // Failing closed keeps the at-most-once guarantee under
                // storage faults; the frame is still acked below.
                warn!(lock_key = %key, error = %e, "dedup acquire failed; skipping handler");
                false
            }
        };

        let outcome = if acquired {
            let outcome = self.execute(handler.as_ref(), &envelope, message_id).await;
            if let Err(e) = self.locks.release(&key, &token).await {
                warn!(lock_key = %key, error = %e, "dedup release failed");
            }
            outcome
        } else {
            debug!(
                message_id,
                lock_key = %key,
                "duplicate in flight elsewhere; skipping handler"
            );
            self.stats.duplicates_skipped.fetch_add(1, Ordering::Relaxed);
            RouteOutcome::DuplicateSkipped
        };

        // Acked whether or not the lock was acquired.
        if let Err(e) = self.publisher.ack(message_id).await {
            warn!(message_id, error = %e, "failed to ack frame");
        }

        outcome
    }

    async fn execute(
        &self,
        handler: &dyn super::WorkHandler,
        envelope: &WorkEnvelope,
        message_id: &str,
    ) -> RouteOutcome {
        match handler
            .handle(
                &envelope.payload,
                &envelope.response_username,
                &envelope.response_destination,
            )
            .await
        {
            Ok(message) => {
                self.publish_response(handler.response_type(), message, envelope)
                    .await;
                self.stats.completed.fetch_add(1, Ordering::Relaxed);
                RouteOutcome::Completed
            }
            Err(e) => {
                // Fire-and-forget once routed: no response, no retry.
                error!(
                    message_id,
                    handler = handler.name(),
                    request_type = %envelope.request_type,
                    error = %e,
                    "handler execution failed"
                );
                self.stats.handler_failures.fetch_add(1, Ordering::Relaxed);
                RouteOutcome::HandlerFailed
            }
        }
    }

    async fn publish_response(&self, response_type: &str, message: Value, envelope: &WorkEnvelope) {
        if envelope.response_destination.is_empty() {
            debug!(request_type = %envelope.request_type, "no response destination; not publishing");
            return;
        }
        let body = ResponseBody::new(response_type, message).encode();
        if let Err(e) = self
            .publisher
            .publish(&envelope.response_destination, &body)
            .await
        {
            warn!(
                destination = %envelope.response_destination,
                error = %e,
                "failed to publish handler response"
            );
        }
    }

    pub fn stats(&self) -> RouterStatsSnapshot {
        RouterStatsSnapshot {
            completed: self.stats.completed.load(Ordering::Relaxed),
            duplicates_skipped: self.stats.duplicates_skipped.load(Ordering::Relaxed),
            handler_failures: self.stats.handler_failures.load(Ordering::Relaxed),
            dropped: self.stats.dropped.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionError;
    use crate::dedup::{DedupError, InMemoryDedupStore};
    use crate::protocol::{FrameCommand, RequestType};
    use crate::routing::{HandlerError, WorkHandler};
    use crate::services::ServiceError;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    /// Records publishes and acks instead of hitting a session
    #[derive(Default)]
    struct RecordingPublisher {
        published: Mutex<Vec<(String, String)>>,
        acked: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ResponsePublisher for RecordingPublisher {
        async fn publish(&self, destination: &str, body: &str) -> Result<(), ConnectionError> {
            self.published
                .lock()
                .unwrap()
                .push((destination.to_string(), body.to_string()));
            Ok(())
        }

        async fn ack(&self, message_id: &str) -> Result<(), ConnectionError> {
            self.acked.lock().unwrap().push(message_id.to_string());
            Ok(())
        }
    }

    struct EchoHandler;

    #[async_trait]
    impl WorkHandler for EchoHandler {
        async fn handle(
            &self,
            payload: &Value,
            _username: &str,
            _destination: &str,
        ) -> Result<Value, HandlerError> {
            Ok(payload.clone())
        }

        fn response_type(&self) -> &str {
            "PONG"
        }

        fn name(&self) -> &str {
            "echo"
        }
    }

    struct FailingHandler;

    #[async_trait]
    impl WorkHandler for FailingHandler {
        async fn handle(
            &self,
            _payload: &Value,
            _username: &str,
            _destination: &str,
        ) -> Result<Value, HandlerError> {
            Err(HandlerError::Service(ServiceError::DataUpdate {
                message: "constraint violation".to_string(),
            }))
        }

        fn response_type(&self) -> &str {
            "PONG"
        }

        fn name(&self) -> &str {
            "failing"
        }
    }

    /// A lock store whose storage is unavailable
    struct BrokenStore;

    #[async_trait]
    impl crate::dedup::DedupLockStore for BrokenStore {
        async fn acquire(&self, _key: &str, _token: &str) -> Result<bool, DedupError> {
            Err(DedupError::Storage {
                message: "down".to_string(),
            })
        }

        async fn release(&self, _key: &str, _token: &str) -> Result<bool, DedupError> {
            Err(DedupError::Storage {
                message: "down".to_string(),
            })
        }
    }

    fn message_frame(message_id: &str, envelope: Value) -> Frame {
        Frame::new(FrameCommand::Message)
            .header(MESSAGE_ID_HEADER, message_id)
            .header(ENVELOPE_HEADER, envelope.to_string())
    }

    struct Fixture {
        router: MessageRouter,
        publisher: Arc<RecordingPublisher>,
        locks: Arc<InMemoryDedupStore>,
    }

    async fn fixture_with(handler: Option<Arc<dyn WorkHandler>>) -> Fixture {
        let registry = Arc::new(HandlerRegistry::new());
        if let Some(handler) = handler {
            registry.register(RequestType::Ping, handler).await;
        }
        let publisher = Arc::new(RecordingPublisher::default());
        let locks = Arc::new(InMemoryDedupStore::new());
        Fixture {
            router: MessageRouter::new(registry, locks.clone(), publisher.clone()),
            publisher,
            locks,
        }
    }

    #[tokio::test]
    async fn routes_publishes_and_acks() {
        let fx = fixture_with(Some(Arc::new(EchoHandler))).await;
        let frame = message_frame(
            "m-1",
            json!({
                "requestType": "PING",
                "payload": {"n": 7},
                "responseDestination": "/queue/responses-u1",
            }),
        );

        let outcome = fx.router.route(&frame).await;
        assert_eq!(outcome, RouteOutcome::Completed);

        let published = fx.publisher.published.lock().unwrap().clone();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "/queue/responses-u1");
        let body: Value = serde_json::from_str(&published[0].1).unwrap();
        assert_eq!(body["responseType"], "PONG");
        assert_eq!(body["message"]["n"], 7);

        assert_eq!(fx.publisher.acked.lock().unwrap().as_slice(), ["m-1"]);
        // Lock released after execution
        assert!(fx.locks.is_empty());
    }

    #[tokio::test]
    async fn missing_payload_is_never_acked_or_dispatched() {
        let fx = fixture_with(Some(Arc::new(EchoHandler))).await;
        let frame = Frame::new(FrameCommand::Message).header(MESSAGE_ID_HEADER, "m-1");

        assert_eq!(fx.router.route(&frame).await, RouteOutcome::DroppedMalformed);
        assert!(fx.publisher.acked.lock().unwrap().is_empty());
        assert!(fx.publisher.published.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn blank_message_id_is_never_acked() {
        let fx = fixture_with(Some(Arc::new(EchoHandler))).await;
        let frame = Frame::new(FrameCommand::Message)
            .header(MESSAGE_ID_HEADER, "  ")
            .header(
                ENVELOPE_HEADER,
                json!({"requestType": "PING", "payload": {}}).to_string(),
            );

        assert_eq!(fx.router.route(&frame).await, RouteOutcome::DroppedMalformed);
        assert!(fx.publisher.acked.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unroutable_frame_never_touches_the_lock() {
        let registry = Arc::new(HandlerRegistry::new());
        let publisher = Arc::new(RecordingPublisher::default());
        // A broken store proves acquire is never called: routing would warn
        // but outcomes below only make sense if lookup fails first.
        let router = MessageRouter::new(registry, Arc::new(BrokenStore), publisher.clone());

        let frame = message_frame("m-1", json!({"requestType": "PING", "payload": {}}));
        assert_eq!(router.route(&frame).await, RouteOutcome::DroppedUnroutable);
        assert!(publisher.acked.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn duplicate_in_flight_skips_handler_but_acks() {
        let fx = fixture_with(Some(Arc::new(EchoHandler))).await;
        let payload = json!({"n": 1});
        let (key, token) = lock_key(RequestType::Ping, &payload);
        // Simulate another process holding the claim
        fx.locks.acquire(&key, &token).await.unwrap();

        let frame = message_frame(
            "m-2",
            json!({
                "requestType": "PING",
                "payload": payload,
                "responseDestination": "/queue/responses-u1",
            }),
        );
        assert_eq!(fx.router.route(&frame).await, RouteOutcome::DuplicateSkipped);

        assert!(fx.publisher.published.lock().unwrap().is_empty());
        assert_eq!(fx.publisher.acked.lock().unwrap().as_slice(), ["m-2"]);
        // The other owner's claim is untouched
        assert_eq!(fx.locks.len(), 1);
    }

    #[tokio::test]
    async fn handler_failure_releases_lock_and_acks_without_response() {
        let fx = fixture_with(Some(Arc::new(FailingHandler))).await;
        let frame = message_frame(
            "m-3",
            json!({
                "requestType": "PING",
                "payload": {},
                "responseDestination": "/queue/responses-u1",
            }),
        );

        assert_eq!(fx.router.route(&frame).await, RouteOutcome::HandlerFailed);
        assert!(fx.publisher.published.lock().unwrap().is_empty());
        assert_eq!(fx.publisher.acked.lock().unwrap().as_slice(), ["m-3"]);
        assert!(fx.locks.is_empty());

        let stats = fx.router.stats();
        assert_eq!(stats.handler_failures, 1);
        assert_eq!(stats.completed, 0);
    }

    #[tokio::test]
    async fn lock_storage_fault_skips_handler_but_acks() {
        let registry = Arc::new(HandlerRegistry::new());
        registry
            .register(RequestType::Ping, Arc::new(EchoHandler) as Arc<dyn WorkHandler>)
            .await;
        let publisher = Arc::new(RecordingPublisher::default());
        let router = MessageRouter::new(registry, Arc::new(BrokenStore), publisher.clone());

        let frame = message_frame("m-4", json!({"requestType": "PING", "payload": {}}));
        assert_eq!(router.route(&frame).await, RouteOutcome::DuplicateSkipped);
        assert_eq!(publisher.acked.lock().unwrap().as_slice(), ["m-4"]);
    }

    #[tokio::test]
    async fn empty_destination_completes_without_publishing() {
        let fx = fixture_with(Some(Arc::new(EchoHandler))).await;
        let frame = message_frame("m-5", json!({"requestType": "PING", "payload": {}}));

        assert_eq!(fx.router.route(&frame).await, RouteOutcome::Completed);
        assert!(fx.publisher.published.lock().unwrap().is_empty());
        assert_eq!(fx.publisher.acked.lock().unwrap().as_slice(), ["m-5"]);
    }
}
