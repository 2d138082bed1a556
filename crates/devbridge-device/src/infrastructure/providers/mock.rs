//! Recording providers for tests.
//!
//! Real capture needs a display, OS permissions, and a live UI toolkit, none
//! of which exist in CI.  These mocks record every call in a `Mutex` so tests
//! can assert exactly what the dispatcher asked for, and can be told to fail
//! so error paths are reachable without a broken OS.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use devbridge_core::protocol::{ContextOptions, ContextSnapshot, ScreenshotOptions};
use serde_json::Value;

use crate::application::capture::{
    CaptureError, CommandError, CommandExecutor, ScreenCapture, UiSnapshotProvider,
};

/// Returns a fixed frame and records each options value it was called with.
#[derive(Default)]
pub struct MockScreenCapture {
    pub frame: Vec<u8>,
    pub calls: Mutex<Vec<ScreenshotOptions>>,
    failure: Mutex<Option<CaptureError>>,
}

impl MockScreenCapture {
    pub fn with_frame(frame: Vec<u8>) -> Self {
        Self {
            frame,
            ..Self::default()
        }
    }

    /// Makes every following call fail with `error`.
    pub fn fail_with(&self, error: CaptureError) {
        *self.failure.lock().unwrap_or_else(|p| p.into_inner()) = Some(error);
    }
}

#[async_trait]
impl ScreenCapture for MockScreenCapture {
    async fn capture(&self, options: &ScreenshotOptions) -> Result<Vec<u8>, CaptureError> {
        self.calls
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(options.clone());
        if let Some(error) = self.failure.lock().unwrap_or_else(|p| p.into_inner()).clone() {
            return Err(error);
        }
        Ok(self.frame.clone())
    }
}

/// Returns a fixed snapshot and counts calls.
#[derive(Default)]
pub struct MockSnapshotProvider {
    pub snapshot: ContextSnapshot,
    pub calls: Mutex<usize>,
    failure: Mutex<Option<CaptureError>>,
}

impl MockSnapshotProvider {
    pub fn with_snapshot(snapshot: ContextSnapshot) -> Self {
        Self {
            snapshot,
            ..Self::default()
        }
    }

    pub fn fail_with(&self, error: CaptureError) {
        *self.failure.lock().unwrap_or_else(|p| p.into_inner()) = Some(error);
    }
}

#[async_trait]
impl UiSnapshotProvider for MockSnapshotProvider {
    async fn snapshot(&self, _options: &ContextOptions) -> Result<ContextSnapshot, CaptureError> {
        *self.calls.lock().unwrap_or_else(|p| p.into_inner()) += 1;
        if let Some(error) = self.failure.lock().unwrap_or_else(|p| p.into_inner()).clone() {
            return Err(error);
        }
        Ok(self.snapshot.clone())
    }
}

/// Answers configured command names; anything else is unknown.
#[derive(Default)]
pub struct MockCommandExecutor {
    pub calls: Mutex<Vec<(String, Value)>>,
    responses: Mutex<HashMap<String, Result<Value, String>>>,
}

impl MockCommandExecutor {
    pub fn respond_with(&self, name: &str, result: Value) {
        self.responses
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(name.to_string(), Ok(result));
    }

    pub fn fail(&self, name: &str, reason: &str) {
        self.responses
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(name.to_string(), Err(reason.to_string()));
    }
}

#[async_trait]
impl CommandExecutor for MockCommandExecutor {
    async fn execute(&self, name: &str, params: &Value) -> Result<Value, CommandError> {
        self.calls
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push((name.to_string(), params.clone()));
        match self
            .responses
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(name)
        {
            Some(Ok(value)) => Ok(value.clone()),
            Some(Err(reason)) => Err(CommandError::Failed {
                name: name.to_string(),
                reason: reason.clone(),
            }),
            None => Err(CommandError::Unknown(name.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_mock_capture_records_then_fails_when_told() {
        let capture = MockScreenCapture::with_frame(vec![1, 2, 3]);
        assert_eq!(capture.capture(&ScreenshotOptions::default()).await.unwrap(), vec![1, 2, 3]);

        capture.fail_with(CaptureError::Failed("gpu lost".into()));
        assert!(capture.capture(&ScreenshotOptions::default()).await.is_err());
        assert_eq!(capture.calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_mock_commands_distinguish_unknown_from_failed() {
        let commands = MockCommandExecutor::default();
        commands.fail("reload", "busy");

        let failed = commands.execute("reload", &json!({})).await.unwrap_err();
        let unknown = commands.execute("warp", &json!({})).await.unwrap_err();

        assert!(matches!(failed, CommandError::Failed { .. }));
        assert_eq!(unknown, CommandError::Unknown("warp".into()));
    }
}
