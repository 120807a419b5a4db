//! Platform capture adapter trait
//!
//! Screen/window enumeration and pixel capture are platform concerns; the
//! engine only sees encoded frames tagged with a stable `source_key`.

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("Capture failed: {0}")]
    Platform(String),
}

/// One captured frame, already encoded (PNG unless stated otherwise)
#[derive(Debug, Clone)]
pub struct Frame {
    /// Stable identifier of a screen or window (e.g. "screen:1")
    pub source_key: String,
    pub bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub mime: String,
    pub app_hint: Option<String>,
    pub window_title: Option<String>,
}

/// Platform adapter producing one frame per visible source per iteration
#[async_trait]
pub trait CaptureSource: Send + Sync {
    async fn grab(&self) -> Result<Vec<Frame>, CaptureError>;
}

/// Placeholder used when no platform adapter is registered. Grabs nothing;
/// the engine still serves its graph and API.
pub struct NullCaptureSource;

#[async_trait]
impl CaptureSource for NullCaptureSource {
    async fn grab(&self) -> Result<Vec<Frame>, CaptureError> {
        Ok(Vec::new())
    }
}
