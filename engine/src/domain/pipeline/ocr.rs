//! OCR stage
//!
//! Screenshots flagged OCR-eligible by the VLM (supported language plus a
//! bounding region) get the region cropped from the capture file and run
//! through the local OCR engine. Success stores the text, deletes the file,
//! and marks the row's storage deleted; the row survives as evidence.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::data::sqlite::SqliteService;
use crate::data::sqlite::repositories::screenshots;
use crate::data::types::{ScreenshotRow, StorageState};

use super::PipelineError;

#[derive(Debug, Error)]
pub enum OcrError {
    #[error("OCR engine error: {0}")]
    Engine(String),

    #[error("Invalid region: {0}")]
    InvalidRegion(String),
}

/// Local OCR engine adapter
#[async_trait]
pub trait Ocr: Send + Sync {
    async fn recognize(&self, image: image::DynamicImage, lang: &str) -> Result<String, OcrError>;
}

/// Crop the OCR region out of a decoded frame, clamping to bounds
pub fn crop_region(
    img: &image::DynamicImage,
    region: [i64; 4],
) -> Result<image::DynamicImage, OcrError> {
    let [x, y, w, h] = region;
    if w <= 0 || h <= 0 {
        return Err(OcrError::InvalidRegion(format!("degenerate region {region:?}")));
    }
    let x = x.clamp(0, img.width() as i64) as u32;
    let y = y.clamp(0, img.height() as i64) as u32;
    let w = (w as u32).min(img.width().saturating_sub(x));
    let h = (h as u32).min(img.height().saturating_sub(y));
    if w == 0 || h == 0 {
        return Err(OcrError::InvalidRegion(format!(
            "region {region:?} lies outside the {}x{} frame",
            img.width(),
            img.height()
        )));
    }
    Ok(img.crop_imm(x, y, w, h))
}

/// OCR stage worker
pub struct OcrStage {
    db: Arc<SqliteService>,
    engine: Arc<dyn Ocr>,
}

impl OcrStage {
    pub fn new(db: Arc<SqliteService>, engine: Arc<dyn Ocr>) -> Arc<Self> {
        Arc::new(Self { db, engine })
    }

    /// Process one due OCR row. Converts all errors into row transitions.
    pub async fn process(&self, shot: ScreenshotRow) {
        if !matches!(
            screenshots::claim_ocr(self.db.pool(), shot.id, shot.ocr_attempts).await,
            Ok(true)
        ) {
            return;
        }
        let attempts = shot.ocr_attempts + 1;

        if let Err(e) = self.run(&shot).await {
            tracing::warn!(id = shot.id, attempts, error = %e, "OCR failed");
            if let Err(db_err) = screenshots::mark_ocr_failed(self.db.pool(), shot.id, attempts).await
            {
                tracing::error!(id = shot.id, error = %db_err, "Failed to record OCR failure");
            }
        }
    }

    async fn run(&self, shot: &ScreenshotRow) -> Result<(), PipelineError> {
        if shot.storage_state == StorageState::Deleted {
            // File already gone: nothing to recognize, close the task
            screenshots::mark_ocr_failed(self.db.pool(), shot.id, i64::MAX).await?;
            return Ok(());
        }
        let path = shot
            .file_path
            .clone()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "file path missing"))?;
        let region: [i64; 4] = shot
            .ocr_region
            .as_deref()
            .and_then(|r| serde_json::from_str(r).ok())
            .ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::InvalidData, "ocr region missing")
            })?;
        let lang = shot.ocr_lang.clone().unwrap_or_default();

        // Decode + crop off the async thread
        let path_for_decode = path.clone();
        let cropped = tokio::task::spawn_blocking(move || -> Result<_, PipelineError> {
            let img = image::open(&path_for_decode).map_err(|e| {
                PipelineError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("image decode failed: {e}"),
                ))
            })?;
            crop_region(&img, region).map_err(|e| {
                PipelineError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))
            })
        })
        .await
        .map_err(|e| std::io::Error::other(format!("crop task panicked: {e}")))??;

        let text = self
            .engine
            .recognize(cropped, &lang)
            .await
            .map_err(|e| std::io::Error::other(e.to_string()))?;

        screenshots::mark_ocr_succeeded(self.db.pool(), shot.id, &text).await?;

        // File deleted after OCR; the row is the evidence
        if let Err(e) = tokio::fs::remove_file(&path).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!(id = shot.id, error = %e, "Failed to delete capture file after OCR");
        }

        // Mirror the recognized text into FTS
        if let Some(row) = screenshots::get(self.db.pool(), shot.id).await? {
            screenshots::fts_upsert(self.db.pool(), &row).await?;
        }

        tracing::debug!(id = shot.id, chars = text.len(), "Screenshot OCR complete");
        Ok(())
    }
}
