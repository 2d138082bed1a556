//! RequestDispatcher: answers bridge requests using the native providers.
//!
//! Every answer echoes the request's id; that is the only way the bridge can
//! pair it.  Provider failures become `ERROR` envelopes with a stable code
//! rather than silence, so the waiting caller learns why immediately instead
//! of timing out.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use devbridge_core::protocol::{
    now_millis, CommandPayload, CommandResult, ContextRequest, Envelope, ErrorCode, ErrorPayload,
    MessageType, ScreenshotPayload, ScreenshotRequest,
};
use serde_json::Value;
use tracing::{debug, warn};

use crate::application::capture::{CommandExecutor, ScreenCapture, UiSnapshotProvider};

/// Maps request envelopes to provider calls.
pub struct RequestDispatcher {
    capture: Arc<dyn ScreenCapture>,
    snapshots: Arc<dyn UiSnapshotProvider>,
    commands: Arc<dyn CommandExecutor>,
}

impl RequestDispatcher {
    pub fn new(
        capture: Arc<dyn ScreenCapture>,
        snapshots: Arc<dyn UiSnapshotProvider>,
        commands: Arc<dyn CommandExecutor>,
    ) -> Self {
        Self {
            capture,
            snapshots,
            commands,
        }
    }

    /// Produces the answer to `request`, or `None` for envelopes that need
    /// no answer (handshake, heartbeats, stray responses).
    pub async fn dispatch(&self, request: &Envelope) -> Option<Envelope> {
        let reply = match request.kind {
            MessageType::ScreenshotRequest => self.screenshot(request).await,
            MessageType::ContextRequest => self.context(request).await,
            MessageType::Command => self.command(request).await,
            MessageType::Unknown => error_reply(
                request,
                ErrorCode::UnknownMessageType,
                "device does not understand this message type".to_string(),
            ),
            MessageType::Error => {
                if let Some(error) = &request.error {
                    warn!("bridge reported {} for {}: {}", error.code, request.id, error.message);
                }
                return None;
            }
            _ => return None,
        };
        debug!("answering {} {} with {}", request.kind, request.id, reply.kind);
        Some(reply)
    }

    async fn screenshot(&self, request: &Envelope) -> Envelope {
        let req: ScreenshotRequest = match request.payload() {
            Ok(r) => r,
            Err(e) => return error_reply(request, ErrorCode::InvalidMessage, e.to_string()),
        };
        let bytes = match self.capture.capture(&req.options).await {
            Ok(b) => b,
            Err(e) => return error_reply(request, e.code(), e.to_string()),
        };

        // Frames can be tens of megabytes; keep the encode off the async workers.
        let byte_length = bytes.len();
        let image = match tokio::task::spawn_blocking(move || STANDARD.encode(bytes)).await {
            Ok(image) => image,
            Err(e) => return error_reply(request, ErrorCode::InternalError, e.to_string()),
        };

        let payload = ScreenshotPayload {
            image,
            format: req.options.format,
            byte_length,
            captured_at: now_millis(),
        };
        reply_with(request, MessageType::ScreenshotResponse, &payload)
    }

    async fn context(&self, request: &Envelope) -> Envelope {
        let req: ContextRequest = match request.payload() {
            Ok(r) => r,
            Err(e) => return error_reply(request, ErrorCode::InvalidMessage, e.to_string()),
        };
        let mut snapshot = match self.snapshots.snapshot(&req.options).await {
            Ok(s) => s,
            Err(e) => return error_reply(request, e.code(), e.to_string()),
        };
        if !req.options.include_tree {
            snapshot.component_tree = Value::Null;
        }
        if !req.options.include_interactions {
            snapshot.recent_interactions.clear();
        }
        reply_with(request, MessageType::ContextResponse, &snapshot)
    }

    async fn command(&self, request: &Envelope) -> Envelope {
        let command: CommandPayload = match request.payload() {
            Ok(c) => c,
            Err(e) => return error_reply(request, ErrorCode::InvalidMessage, e.to_string()),
        };
        match self.commands.execute(&command.name, &command.params).await {
            Ok(result) => reply_with(request, MessageType::CommandResponse, &CommandResult { result }),
            Err(e) => error_reply(request, e.code(), e.to_string()),
        }
    }
}

fn reply_with<T: serde::Serialize>(request: &Envelope, kind: MessageType, payload: &T) -> Envelope {
    match serde_json::to_value(payload) {
        Ok(data) => Envelope::reply_to(request, kind, Some(data)),
        Err(e) => error_reply(request, ErrorCode::InternalError, e.to_string()),
    }
}

fn error_reply(request: &Envelope, code: ErrorCode, message: String) -> Envelope {
    Envelope::error(request.id.clone(), ErrorPayload::new(code, message))
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use devbridge_core::protocol::{ContextSnapshot, ImageFormat, Interaction, ScreenshotOptions};
    use serde_json::json;

    use crate::application::capture::CaptureError;
    use crate::infrastructure::providers::mock::{
        MockCommandExecutor, MockScreenCapture, MockSnapshotProvider,
    };

    struct Fixture {
        capture: Arc<MockScreenCapture>,
        snapshots: Arc<MockSnapshotProvider>,
        commands: Arc<MockCommandExecutor>,
        dispatcher: RequestDispatcher,
    }

    fn fixture() -> Fixture {
        let capture = Arc::new(MockScreenCapture::with_frame(b"abc".to_vec()));
        let snapshots = Arc::new(MockSnapshotProvider::with_snapshot(ContextSnapshot {
            route: "/home".to_string(),
            component_tree: json!({"type": "Root"}),
            recent_interactions: vec![Interaction {
                kind: "tap".to_string(),
                target: "login".to_string(),
                timestamp: 1,
            }],
            ..ContextSnapshot::default()
        }));
        let commands = Arc::new(MockCommandExecutor::default());
        let dispatcher = RequestDispatcher::new(capture.clone(), snapshots.clone(), commands.clone());
        Fixture {
            capture,
            snapshots,
            commands,
            dispatcher,
        }
    }

    fn request(kind: MessageType, data: Value) -> Envelope {
        let mut env = Envelope::new(kind, Some(data));
        env.id = "req-1".to_string();
        env
    }

    #[tokio::test]
    async fn test_screenshot_reply_echoes_id_and_base64_encodes_frame() {
        // Arrange
        let f = fixture();
        let req = request(MessageType::ScreenshotRequest, json!({"format": "jpeg", "quality": 50}));

        // Act
        let reply = f.dispatcher.dispatch(&req).await.unwrap();

        // Assert
        assert_eq!(reply.id, "req-1");
        assert_eq!(reply.kind, MessageType::ScreenshotResponse);
        let payload: ScreenshotPayload = reply.payload().unwrap();
        assert_eq!(payload.image, "YWJj");
        assert_eq!(payload.byte_length, 3);
        assert_eq!(payload.format, ImageFormat::Jpeg);
        let calls = f.capture.calls.lock().unwrap();
        assert_eq!(calls[0].quality, 50);
    }

    #[tokio::test]
    async fn test_permission_failure_becomes_permission_denied_error() {
        let f = fixture();
        f.capture.fail_with(CaptureError::PermissionDenied("screen recording off".into()));

        let reply = f
            .dispatcher
            .dispatch(&request(MessageType::ScreenshotRequest, json!({})))
            .await
            .unwrap();

        assert_eq!(reply.id, "req-1");
        assert_eq!(reply.error.unwrap().code, "PERMISSION_DENIED");
    }

    #[tokio::test]
    async fn test_context_respects_include_flags() {
        let f = fixture();
        let req = request(
            MessageType::ContextRequest,
            json!({"includeTree": false, "includeInteractions": false}),
        );

        let reply = f.dispatcher.dispatch(&req).await.unwrap();

        let snapshot: ContextSnapshot = reply.payload().unwrap();
        assert_eq!(snapshot.route, "/home");
        assert!(snapshot.component_tree.is_null());
        assert!(snapshot.recent_interactions.is_empty());
        assert_eq!(*f.snapshots.calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_command_result_is_wrapped_in_command_response() {
        let f = fixture();
        f.commands.respond_with("reload", json!({"ok": true}));

        let reply = f
            .dispatcher
            .dispatch(&request(MessageType::Command, json!({"name": "reload", "params": {}})))
            .await
            .unwrap();

        assert_eq!(reply.kind, MessageType::CommandResponse);
        let result: CommandResult = reply.payload().unwrap();
        assert_eq!(result.result, json!({"ok": true}));
        assert_eq!(f.commands.calls.lock().unwrap()[0].0, "reload");
    }

    #[tokio::test]
    async fn test_unknown_command_is_unsupported() {
        let f = fixture();

        let reply = f
            .dispatcher
            .dispatch(&request(MessageType::Command, json!({"name": "teleport"})))
            .await
            .unwrap();

        assert_eq!(reply.error.unwrap().code, "UNSUPPORTED");
    }

    #[tokio::test]
    async fn test_malformed_request_payload_is_invalid_message() {
        let f = fixture();

        let reply = f
            .dispatcher
            .dispatch(&request(MessageType::ScreenshotRequest, json!({"quality": "high"})))
            .await
            .unwrap();

        assert_eq!(reply.error.unwrap().code, "INVALID_MESSAGE");
    }

    #[tokio::test]
    async fn test_heartbeat_and_welcome_need_no_answer() {
        let f = fixture();
        for kind in [MessageType::Heartbeat, MessageType::Welcome, MessageType::ScreenshotResponse] {
            assert!(f.dispatcher.dispatch(&request(kind, json!({}))).await.is_none());
        }
        assert!(f.capture.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_default_options_reach_the_provider() {
        let f = fixture();
        f.dispatcher
            .dispatch(&request(MessageType::ScreenshotRequest, Value::Null))
            .await
            .unwrap();
        assert_eq!(f.capture.calls.lock().unwrap()[0], ScreenshotOptions::default());
    }
}
