//! Request correlator: turns the connection manager's one-way message stream
//! into awaitable request/response calls.
//!
//! # How pairing works
//!
//! Every issued request is recorded in a pending table keyed by its envelope
//! id.  An inbound response-type envelope (`*_RESPONSE` or `ERROR`) is looked
//! up by its id and nothing else.  Whichever path removes the entry from the
//! table first (matching response, deadline, or owner disconnect) is the one
//! that resolves the waiter, so a request is resolved exactly once and the
//! losing paths are no-ops.
//!
//! # Inbound requests
//!
//! Any other envelope type is routed to the [`EnvelopeHandler`] registered for
//! it.  Handlers run on their own task so a handler waiting on a device never
//! stalls the dispatch loop.  A type with no handler gets an
//! `ERROR{UNKNOWN_MESSAGE_TYPE}` reply.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use devbridge_core::protocol::{Envelope, ErrorCode, ErrorPayload, MessageType};
use devbridge_core::task::ScheduledTask;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::domain::{BridgeError, RequestError};
use crate::infrastructure::events::{lock, ConnectionEvent, ConnectionId, Subscription};

/// Something that can deliver an envelope to a connection by id.
///
/// Implemented by [`crate::infrastructure::ConnectionManager`]; tests use an
/// in-memory recorder.
pub trait EnvelopeSink: Send + Sync {
    /// Returns `false` if the connection is unknown or not writable.
    fn send_to(&self, connection_id: &str, envelope: &Envelope) -> bool;
}

/// Answers one kind of inbound request envelope.
///
/// Returning `Ok(Some(reply))` sends `reply` back to the sender, `Ok(None)`
/// sends nothing, and `Err(e)` sends an `ERROR` carrying the request's id.
#[async_trait]
pub trait EnvelopeHandler: Send + Sync {
    async fn handle(
        &self,
        correlator: Arc<Correlator>,
        from: ConnectionId,
        envelope: Arc<Envelope>,
    ) -> Result<Option<Envelope>, BridgeError>;
}

struct PendingRequest {
    owner: ConnectionId,
    tx: oneshot::Sender<Result<Envelope, RequestError>>,
}

/// Pairs outbound requests with inbound responses by envelope id.
pub struct Correlator {
    sink: Arc<dyn EnvelopeSink>,
    pending: Mutex<HashMap<String, PendingRequest>>,
    handlers: Mutex<HashMap<MessageType, Arc<dyn EnvelopeHandler>>>,
    dispatcher: Mutex<Option<ScheduledTask>>,
}

impl Correlator {
    pub fn new(sink: Arc<dyn EnvelopeSink>) -> Arc<Self> {
        Arc::new(Self {
            sink,
            pending: Mutex::new(HashMap::new()),
            handlers: Mutex::new(HashMap::new()),
            dispatcher: Mutex::new(None),
        })
    }

    /// Starts consuming connection events from `events`.
    ///
    /// Replaces any previous subscription.
    pub fn attach(self: &Arc<Self>, mut events: Subscription) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let task = ScheduledTask::spawn("correlator-dispatch", async move {
            while let Some(event) = events.recv().await {
                let Some(correlator) = weak.upgrade() else {
                    break;
                };
                correlator.handle_event(event);
            }
            debug!("correlator dispatch loop ended");
        });
        *lock(&self.dispatcher) = Some(task);
    }

    /// Sends `request` to `connection_id` and waits for the envelope that
    /// echoes its id.
    ///
    /// An `ERROR` envelope answering the request is a successful outcome here;
    /// interpreting it is the caller's job.
    ///
    /// # Errors
    ///
    /// - [`RequestError::SendFailed`] if the request could not be written.
    /// - [`RequestError::Disconnected`] if the connection closed first.
    /// - [`RequestError::Timeout`] if nothing matched before `timeout`.
    pub async fn issue(
        &self,
        connection_id: &str,
        request: Envelope,
        timeout: Duration,
    ) -> Result<Envelope, RequestError> {
        let id = request.id.clone();
        let (tx, mut rx) = oneshot::channel();
        {
            let mut pending = lock(&self.pending);
            if pending.contains_key(&id) {
                warn!("refusing to issue {id}: id is already pending");
                return Err(RequestError::SendFailed {
                    id,
                    connection_id: connection_id.to_string(),
                });
            }
            pending.insert(
                id.clone(),
                PendingRequest {
                    owner: connection_id.to_string(),
                    tx,
                },
            );
        }
        // Removes the entry if this future is dropped before it resolves.
        let guard = PendingGuard {
            pending: &self.pending,
            id: &id,
        };

        if !self.sink.send_to(connection_id, &request) {
            drop(guard);
            return Err(RequestError::SendFailed {
                id,
                connection_id: connection_id.to_string(),
            });
        }
        debug!("issued {} {id} to {connection_id}", request.kind);

        let outcome = match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(RequestError::Disconnected {
                id: id.clone(),
                connection_id: connection_id.to_string(),
            }),
            Err(_) => {
                let removed = lock(&self.pending).remove(&id);
                match removed {
                    Some(_) => {
                        debug!("request {id} timed out after {timeout:?}");
                        Err(RequestError::Timeout {
                            id: id.clone(),
                            timeout_ms: timeout.as_millis() as u64,
                        })
                    }
                    // Resolved between the deadline firing and the lock.
                    None => rx.try_recv().unwrap_or_else(|_| {
                        Err(RequestError::Disconnected {
                            id: id.clone(),
                            connection_id: connection_id.to_string(),
                        })
                    }),
                }
            }
        };
        drop(guard);
        outcome
    }

    /// Installs `handler` for `kind`, returning the handler it replaced.
    pub fn register_handler(
        &self,
        kind: MessageType,
        handler: Arc<dyn EnvelopeHandler>,
    ) -> Option<Arc<dyn EnvelopeHandler>> {
        debug!("handler registered for {kind}");
        lock(&self.handlers).insert(kind, handler)
    }

    pub fn unregister_handler(&self, kind: MessageType) -> Option<Arc<dyn EnvelopeHandler>> {
        lock(&self.handlers).remove(&kind)
    }

    pub fn has_handler(&self, kind: MessageType) -> bool {
        lock(&self.handlers).contains_key(&kind)
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Routes one connection event.
    pub fn handle_event(self: &Arc<Self>, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Message {
                connection_id,
                envelope,
            } => self.dispatch(connection_id, envelope),
            ConnectionEvent::Disconnected { connection_id, .. } => {
                let failed = self.fail_connection(&connection_id);
                if failed > 0 {
                    info!("connection {connection_id} closed with {failed} request(s) pending");
                }
            }
            ConnectionEvent::Connected { .. } | ConnectionEvent::Error { .. } => {}
        }
    }

    /// Resolves every request owned by `connection_id` as `Disconnected`.
    pub fn fail_connection(&self, connection_id: &str) -> usize {
        let drained: Vec<(String, PendingRequest)> = {
            let mut pending = lock(&self.pending);
            let ids: Vec<String> = pending
                .iter()
                .filter(|(_, p)| p.owner == connection_id)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| pending.remove(&id).map(|p| (id, p)))
                .collect()
        };
        let count = drained.len();
        for (id, p) in drained {
            let _ = p.tx.send(Err(RequestError::Disconnected {
                id,
                connection_id: p.owner,
            }));
        }
        count
    }

    /// Stops dispatching and fails every outstanding request.
    pub fn shutdown(&self) {
        lock(&self.dispatcher).take();
        let drained: Vec<(String, PendingRequest)> = lock(&self.pending).drain().collect();
        for (id, p) in drained {
            let _ = p.tx.send(Err(RequestError::Disconnected {
                id,
                connection_id: p.owner,
            }));
        }
    }

    fn dispatch(self: &Arc<Self>, from: ConnectionId, envelope: Arc<Envelope>) {
        if envelope.kind.is_response() {
            self.resolve(&from, &envelope);
            return;
        }

        let handler = lock(&self.handlers).get(&envelope.kind).cloned();
        let Some(handler) = handler else {
            warn!("connection {from}: no handler for {}", envelope.kind);
            let reply = Envelope::error(
                envelope.id.clone(),
                ErrorPayload::new(
                    ErrorCode::UnknownMessageType,
                    format!("no handler registered for {}", envelope.kind),
                ),
            );
            self.sink.send_to(&from, &reply);
            return;
        };

        let correlator = Arc::clone(self);
        tokio::spawn(async move {
            let request_id = envelope.id.clone();
            let outcome = handler
                .handle(Arc::clone(&correlator), from.clone(), envelope)
                .await;
            let reply = match outcome {
                Ok(Some(reply)) => reply,
                Ok(None) => return,
                Err(e) => {
                    debug!("handler for {request_id} failed: {e}");
                    Envelope::error(request_id, e.to_error_payload())
                }
            };
            if !correlator.sink.send_to(&from, &reply) {
                debug!("reply {} to {from} dropped: connection gone", reply.id);
            }
        });
    }

    fn resolve(&self, from: &str, envelope: &Envelope) -> bool {
        let Some(pending) = lock(&self.pending).remove(&envelope.id) else {
            debug!(
                "connection {from}: {} {} matches no pending request; ignored",
                envelope.kind, envelope.id
            );
            return false;
        };
        if pending.owner != from {
            debug!(
                "request {} answered by {from}, issued to {}",
                envelope.id, pending.owner
            );
        }
        pending.tx.send(Ok(envelope.clone())).is_ok()
    }
}

struct PendingGuard<'a> {
    pending: &'a Mutex<HashMap<String, PendingRequest>>,
    id: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock(self.pending).remove(self.id);
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use devbridge_core::protocol::encode_envelope;
    use serde_json::json;

    use crate::infrastructure::events::{CloseReason, EventBus};

    /// Records every envelope "sent" and can be told to refuse writes.
    #[derive(Default)]
    struct RecordingSink {
        sent: Mutex<Vec<(String, Envelope)>>,
        refuse: bool,
    }

    impl EnvelopeSink for RecordingSink {
        fn send_to(&self, connection_id: &str, envelope: &Envelope) -> bool {
            if self.refuse {
                return false;
            }
            lock(&self.sent).push((connection_id.to_string(), envelope.clone()));
            true
        }
    }

    impl RecordingSink {
        fn sent(&self) -> Vec<(String, Envelope)> {
            lock(&self.sent).clone()
        }
    }

    fn message(conn: &str, env: Envelope) -> ConnectionEvent {
        ConnectionEvent::Message {
            connection_id: conn.to_string(),
            envelope: Arc::new(env),
        }
    }

    fn request(id: &str) -> Envelope {
        let mut env = Envelope::new(MessageType::ScreenshotRequest, None);
        env.id = id.to_string();
        env
    }

    fn response(id: &str, data: serde_json::Value) -> Envelope {
        let mut env = Envelope::new(MessageType::ScreenshotResponse, Some(data));
        env.id = id.to_string();
        env
    }

    #[tokio::test]
    async fn test_response_with_matching_id_resolves_request() {
        // Arrange
        let sink = Arc::new(RecordingSink::default());
        let correlator = Correlator::new(sink.clone());
        let c = Arc::clone(&correlator);
        let waiter = tokio::spawn(async move {
            c.issue("dev-1", request("s1"), Duration::from_secs(5)).await
        });
        tokio::task::yield_now().await;

        // Act
        correlator.handle_event(message("dev-1", response("s1", json!("abc"))));

        // Assert
        let reply = waiter.await.unwrap().unwrap();
        assert_eq!(reply.data, Some(json!("abc")));
        assert_eq!(sink.sent()[0].1.id, "s1");
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_response_resolves_only_its_own_id() {
        // Arrange: two requests in flight on the same connection.
        let correlator = Correlator::new(Arc::new(RecordingSink::default()));
        let (c1, c2) = (Arc::clone(&correlator), Arc::clone(&correlator));
        let a = tokio::spawn(async move { c1.issue("dev", request("a"), Duration::from_secs(5)).await });
        let b = tokio::spawn(async move { c2.issue("dev", request("b"), Duration::from_secs(5)).await });
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        // Act: answer out of order.
        correlator.handle_event(message("dev", response("b", json!(2))));
        tokio::task::yield_now().await;

        // Assert: "a" is still pending, "b" got its own data.
        assert_eq!(correlator.pending_count(), 1);
        assert_eq!(b.await.unwrap().unwrap().data, Some(json!(2)));
        correlator.handle_event(message("dev", response("a", json!(1))));
        assert_eq!(a.await.unwrap().unwrap().data, Some(json!(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_times_out_and_late_response_is_ignored() {
        // Arrange
        let correlator = Correlator::new(Arc::new(RecordingSink::default()));

        // Act
        let outcome = correlator
            .issue("dev", request("t1"), Duration::from_millis(100))
            .await;

        // Assert
        assert!(matches!(outcome, Err(RequestError::Timeout { ref id, timeout_ms: 100 }) if id == "t1"));
        assert_eq!(correlator.pending_count(), 0);
        assert!(!correlator.resolve("dev", &response("t1", json!("late"))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_fails_pending_request_before_deadline() {
        // Arrange
        let correlator = Correlator::new(Arc::new(RecordingSink::default()));
        let c = Arc::clone(&correlator);
        let started = tokio::time::Instant::now();
        let waiter = tokio::spawn(async move {
            c.issue("dev", request("d1"), Duration::from_secs(30)).await
        });

        // Act: the owner disconnects 50ms in.
        tokio::time::sleep(Duration::from_millis(50)).await;
        correlator.handle_event(ConnectionEvent::Disconnected {
            connection_id: "dev".to_string(),
            reason: CloseReason::PeerClosed,
        });

        // Assert
        let outcome = waiter.await.unwrap();
        assert!(matches!(outcome, Err(RequestError::Disconnected { .. })));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_disconnect_of_other_connection_leaves_request_pending() {
        let correlator = Correlator::new(Arc::new(RecordingSink::default()));
        let c = Arc::clone(&correlator);
        let _waiter = tokio::spawn(async move {
            c.issue("dev-a", request("x"), Duration::from_secs(30)).await
        });
        tokio::task::yield_now().await;

        assert_eq!(correlator.fail_connection("dev-b"), 0);
        assert_eq!(correlator.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_unwritable_connection_is_send_failed() {
        let sink = Arc::new(RecordingSink {
            refuse: true,
            ..RecordingSink::default()
        });
        let correlator = Correlator::new(sink);

        let outcome = correlator
            .issue("dev", request("f1"), Duration::from_secs(1))
            .await;

        assert!(matches!(outcome, Err(RequestError::SendFailed { .. })));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_dropped_issue_future_removes_pending_entry() {
        let correlator = Correlator::new(Arc::new(RecordingSink::default()));
        let c = Arc::clone(&correlator);
        let waiter = tokio::spawn(async move {
            c.issue("dev", request("gone"), Duration::from_secs(30)).await
        });
        tokio::task::yield_now().await;
        assert_eq!(correlator.pending_count(), 1);

        waiter.abort();
        let _ = waiter.await;

        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_error_envelope_resolves_by_id() {
        let correlator = Correlator::new(Arc::new(RecordingSink::default()));
        let c = Arc::clone(&correlator);
        let waiter = tokio::spawn(async move {
            c.issue("dev", request("e1"), Duration::from_secs(5)).await
        });
        tokio::task::yield_now().await;

        let err = Envelope::error("e1", ErrorPayload::new(ErrorCode::PermissionDenied, "nope"));
        correlator.handle_event(message("dev", err));

        let reply = waiter.await.unwrap().unwrap();
        assert_eq!(reply.kind, MessageType::Error);
        assert_eq!(reply.error.unwrap().code, "PERMISSION_DENIED");
    }

    #[tokio::test]
    async fn test_unregistered_type_gets_unknown_message_type_reply() {
        // Arrange
        let sink = Arc::new(RecordingSink::default());
        let correlator = Correlator::new(sink.clone());
        let text = r#"{"type":"TELEPORT","id":"u1","timestamp":1}"#;
        let env = devbridge_core::decode_envelope(text).unwrap();

        // Act
        correlator.handle_event(message("dev", env));

        // Assert
        let sent = sink.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "dev");
        assert_eq!(sent[0].1.id, "u1");
        assert_eq!(sent[0].1.error.as_ref().unwrap().code, "UNKNOWN_MESSAGE_TYPE");
    }

    struct EchoHandler;

    #[async_trait]
    impl EnvelopeHandler for EchoHandler {
        async fn handle(
            &self,
            _correlator: Arc<Correlator>,
            _from: ConnectionId,
            envelope: Arc<Envelope>,
        ) -> Result<Option<Envelope>, BridgeError> {
            Ok(Some(Envelope::reply_to(
                &envelope,
                MessageType::Discovery,
                envelope.data.clone(),
            )))
        }
    }

    struct FailingHandler;

    #[async_trait]
    impl EnvelopeHandler for FailingHandler {
        async fn handle(
            &self,
            _correlator: Arc<Correlator>,
            _from: ConnectionId,
            _envelope: Arc<Envelope>,
        ) -> Result<Option<Envelope>, BridgeError> {
            Err(BridgeError::DeviceUnavailable {
                target: "default".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn test_registered_handler_reply_is_sent_to_sender() {
        // Arrange
        let sink = Arc::new(RecordingSink::default());
        let correlator = Correlator::new(sink.clone());
        correlator.register_handler(MessageType::Discovery, Arc::new(EchoHandler));
        let bus = EventBus::new();
        correlator.attach(bus.subscribe());

        // Act
        let mut probe = Envelope::new(MessageType::Discovery, Some(json!({"hello": 1})));
        probe.id = "p1".to_string();
        bus.publish(message("probe-conn", probe));
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        // Assert
        let sent = sink.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "probe-conn");
        assert_eq!(sent[0].1.id, "p1");
        assert_eq!(sent[0].1.data, Some(json!({"hello": 1})));
    }

    #[tokio::test]
    async fn test_handler_error_becomes_error_envelope_with_request_id() {
        let sink = Arc::new(RecordingSink::default());
        let correlator = Correlator::new(sink.clone());
        correlator.register_handler(MessageType::Command, Arc::new(FailingHandler));

        correlator.handle_event(message("dev", {
            let mut e = Envelope::new(MessageType::Command, None);
            e.id = "c1".to_string();
            e
        }));
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        let sent = sink.sent();
        assert_eq!(sent[0].1.id, "c1");
        assert_eq!(sent[0].1.error.as_ref().unwrap().code, "DEVICE_UNAVAILABLE");
        // The reply must be a well-formed envelope.
        assert!(encode_envelope(&sent[0].1).is_ok());
    }

    #[test]
    fn test_unregister_handler_returns_previous() {
        let correlator = Correlator::new(Arc::new(RecordingSink::default()));
        correlator.register_handler(MessageType::Discovery, Arc::new(EchoHandler));
        assert!(correlator.has_handler(MessageType::Discovery));

        assert!(correlator.unregister_handler(MessageType::Discovery).is_some());
        assert!(!correlator.has_handler(MessageType::Discovery));
    }

    #[tokio::test]
    async fn test_shutdown_fails_every_pending_request() {
        let correlator = Correlator::new(Arc::new(RecordingSink::default()));
        let c = Arc::clone(&correlator);
        let waiter = tokio::spawn(async move {
            c.issue("dev", request("s"), Duration::from_secs(30)).await
        });
        tokio::task::yield_now().await;

        correlator.shutdown();

        assert!(matches!(waiter.await.unwrap(), Err(RequestError::Disconnected { .. })));
    }
}
