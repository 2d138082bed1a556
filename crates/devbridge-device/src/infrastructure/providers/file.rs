//! File-backed providers for the standalone agent binary.
//!
//! `FileScreenCapture` serves an image file as the "screen" and
//! `JsonSnapshotProvider` serves a JSON file as the UI snapshot.  Both re-read
//! the file on every call, so editing it on disk changes what the bridge sees
//! without restarting the agent.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use devbridge_core::protocol::{
    ContextOptions, ContextSnapshot, ImageFormat, ScreenshotOptions,
};
use tracing::debug;

use crate::application::capture::{CaptureError, ScreenCapture, UiSnapshotProvider};

const PNG_MAGIC: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
const JPEG_MAGIC: &[u8] = &[0xFF, 0xD8, 0xFF];

/// Identifies an encoded image by its leading bytes.
pub fn sniff_format(bytes: &[u8]) -> Option<ImageFormat> {
    if bytes.starts_with(PNG_MAGIC) {
        Some(ImageFormat::Png)
    } else if bytes.starts_with(JPEG_MAGIC) {
        Some(ImageFormat::Jpeg)
    } else {
        None
    }
}

fn read_error(path: &Path, e: std::io::Error) -> CaptureError {
    match e.kind() {
        ErrorKind::PermissionDenied => {
            CaptureError::PermissionDenied(format!("cannot read {}", path.display()))
        }
        _ => CaptureError::Failed(format!("cannot read {}: {e}", path.display())),
    }
}

/// Serves an image file as the current frame.
///
/// The file is not transcoded: asking for a format other than the file's own
/// is `UNSUPPORTED`.
pub struct FileScreenCapture {
    path: PathBuf,
}

impl FileScreenCapture {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ScreenCapture for FileScreenCapture {
    async fn capture(&self, options: &ScreenshotOptions) -> Result<Vec<u8>, CaptureError> {
        let bytes = tokio::fs::read(&self.path)
            .await
            .map_err(|e| read_error(&self.path, e))?;

        match sniff_format(&bytes) {
            Some(format) if format == options.format => {
                debug!("captured {} bytes from {}", bytes.len(), self.path.display());
                Ok(bytes)
            }
            Some(format) => Err(CaptureError::Unsupported(format!(
                "frame source is {}, cannot produce {}",
                format.as_str(),
                options.format.as_str()
            ))),
            None => Err(CaptureError::Failed(format!(
                "{} is not a PNG or JPEG image",
                self.path.display()
            ))),
        }
    }
}

/// Serves a JSON-encoded [`ContextSnapshot`] file.
pub struct JsonSnapshotProvider {
    path: PathBuf,
}

impl JsonSnapshotProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl UiSnapshotProvider for JsonSnapshotProvider {
    async fn snapshot(&self, _options: &ContextOptions) -> Result<ContextSnapshot, CaptureError> {
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| read_error(&self.path, e))?;
        serde_json::from_str(&text).map_err(|e| {
            CaptureError::Failed(format!("{} is not a UI snapshot: {e}", self.path.display()))
        })
    }
}

/// Stands in when no source was configured; every call is `UNSUPPORTED`.
pub struct Unavailable;

#[async_trait]
impl ScreenCapture for Unavailable {
    async fn capture(&self, _options: &ScreenshotOptions) -> Result<Vec<u8>, CaptureError> {
        Err(CaptureError::Unsupported("no screen source configured".to_string()))
    }
}

#[async_trait]
impl UiSnapshotProvider for Unavailable {
    async fn snapshot(&self, _options: &ContextOptions) -> Result<ContextSnapshot, CaptureError> {
        Err(CaptureError::Unsupported("no snapshot source configured".to_string()))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
