//! Capture scheduler
//!
//! A self-rescheduling loop: after iteration `i` finishes at `t_end`, the
//! next iteration is scheduled at `t_start + period - (t_end - t_start)`,
//! which stabilizes the effective period against slow iterations. The
//! period is `base_interval * interval_multiplier`, with the multiplier
//! driven live by the backpressure controller.
//!
//! The scheduler observes two pause inputs: user pause (capture.pause) and
//! the VLM circuit breaker. Either one stops frame acceptance; the loop
//! keeps ticking so resume takes effect within one iteration.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::core::config::CaptureConfig;
use crate::core::constants::RETENTION_SWEEP_INTERVAL_SECS;
use crate::core::storage::{AppStorage, DataSubdir};
use crate::data::sqlite::SqliteService;
use crate::data::sqlite::repositories::screenshots::{self, NewScreenshot};
use crate::data::topics::{CaptureStateEvent, EventBus};
use crate::utils::time::now_ms;

use super::backpressure::CaptureTuning;
use super::dedup::SourceDedup;
use super::phash;
use super::source::{CaptureSource, Frame};

/// User-facing capture lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureStatus {
    Running,
    Paused,
    Stopped,
}

impl CaptureStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            CaptureStatus::Running => "running",
            CaptureStatus::Paused => "paused",
            CaptureStatus::Stopped => "stopped",
        }
    }
}

/// Capture frontend service
pub struct CaptureService {
    source: Arc<dyn CaptureSource>,
    db: Arc<SqliteService>,
    bus: Arc<EventBus>,
    storage: AppStorage,
    config: CaptureConfig,
    dedup: SourceDedup,
    status: Mutex<CaptureStatus>,
    tuning_rx: watch::Receiver<CaptureTuning>,
    breaker_pause_rx: watch::Receiver<bool>,
    pub frames_captured: AtomicU64,
    pub frames_deduplicated: AtomicU64,
}

impl CaptureService {
    pub fn new(
        source: Arc<dyn CaptureSource>,
        db: Arc<SqliteService>,
        bus: Arc<EventBus>,
        storage: AppStorage,
        config: CaptureConfig,
        tuning_rx: watch::Receiver<CaptureTuning>,
        breaker_pause_rx: watch::Receiver<bool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            source,
            db,
            bus,
            storage,
            config,
            dedup: SourceDedup::new(),
            status: Mutex::new(CaptureStatus::Stopped),
            tuning_rx,
            breaker_pause_rx,
            frames_captured: AtomicU64::new(0),
            frames_deduplicated: AtomicU64::new(0),
        })
    }

    // =========================================================================
    // User controls
    // =========================================================================

    pub fn status(&self) -> CaptureStatus {
        *self.status.lock()
    }

    /// Whether frames are being accepted right now
    pub fn capturing_now(&self) -> bool {
        self.status() == CaptureStatus::Running && !*self.breaker_pause_rx.borrow()
    }

    pub fn set_status(&self, status: CaptureStatus) {
        {
            let mut current = self.status.lock();
            if *current == status {
                return;
            }
            *current = status;
        }
        tracing::info!(status = status.as_str(), "Capture status changed");
        self.publish_state();
    }

    fn publish_state(&self) {
        self.bus.publish_capture_state(CaptureStateEvent {
            at_ms: now_ms(),
            status: self.status().as_str().to_string(),
            capturing_now: self.capturing_now(),
        });
    }

    // =========================================================================
    // Capture loop
    // =========================================================================

    pub fn start(self: &Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        let service = Arc::clone(self);
        let mut breaker_rx = self.breaker_pause_rx.clone();
        tokio::spawn(async move {
            tracing::debug!("Capture loop started");
            loop {
                let t_start = Instant::now();
                let tuning = *service.tuning_rx.borrow();

                if service.capturing_now() {
                    service.run_iteration(tuning.phash_threshold).await;
                }

                // Stabilized period: subtract the iteration's own cost
                let period = Duration::from_millis(
                    (service.config.interval_ms as f64 * tuning.interval_multiplier) as u64,
                );
                let elapsed = t_start.elapsed();
                let delay = period.saturating_sub(elapsed);

                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            tracing::debug!("Capture loop shutting down");
                            break;
                        }
                    }
                    // Breaker transitions surface a state event immediately
                    _ = breaker_rx.changed() => {
                        service.publish_state();
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        })
    }

    async fn run_iteration(&self, phash_threshold: u32) {
        let frames = match self.source.grab().await {
            Ok(frames) => frames,
            Err(e) => {
                tracing::warn!(error = %e, "Capture grab failed");
                return;
            }
        };

        for frame in frames {
            if let Err(e) = self.process_frame(frame, phash_threshold).await {
                tracing::warn!(error = %e, "Frame processing failed");
            }
        }
    }

    async fn process_frame(&self, frame: Frame, threshold: u32) -> anyhow::Result<()> {
        self.frames_captured.fetch_add(1, Ordering::Relaxed);

        // Hashing decodes the image: CPU-bound, off the async thread
        let bytes = frame.bytes;
        let hash = tokio::task::spawn_blocking(move || phash::phash(&bytes).map(|h| (h, bytes)))
            .await??;
        let (hash, bytes) = hash;

        if !self.dedup.accept(&frame.source_key, hash, threshold) {
            self.frames_deduplicated.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(source = %frame.source_key, "Frame deduplicated");
            return Ok(());
        }

        let ts = now_ms();
        let ext = match frame.mime.as_str() {
            "image/jpeg" => "jpg",
            "image/webp" => "webp",
            _ => "png",
        };
        let filename = format!(
            "{}_{}_{}.{ext}",
            frame.source_key.replace([':', '/'], "-"),
            ts,
            Uuid::new_v4().simple()
        );
        let path = self.storage.subdir_path(DataSubdir::ShotsTmp, &filename);
        let size = bytes.len() as i64;
        tokio::fs::write(&path, &bytes).await?;

        let id = screenshots::insert(
            self.db.pool(),
            &NewScreenshot {
                ts_ms: ts,
                source_key: frame.source_key.clone(),
                phash: hash as i64,
                file_path: path.to_string_lossy().to_string(),
                width: frame.width as i64,
                height: frame.height as i64,
                bytes: size,
                mime: frame.mime,
                app_hint: frame.app_hint,
                window_title: frame.window_title,
            },
        )
        .await?;

        tracing::debug!(id, source = %frame.source_key, "Screenshot accepted");
        Ok(())
    }

    // =========================================================================
    // Retention sweep
    // =========================================================================

    /// Delete capture files past their retention expiry
    pub fn start_retention_task(
        self: &Arc<Self>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_secs(RETENTION_SWEEP_INTERVAL_SECS));
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            tracing::debug!("Retention sweep shutting down");
                            break;
                        }
                    }
                    _ = interval.tick() => {
                        service.sweep_expired().await;
                    }
                }
            }
        })
    }

    async fn sweep_expired(&self) {
        let expired = match screenshots::retention_expired(self.db.pool(), now_ms(), 200).await {
            Ok(rows) => rows,
            Err(e) => {
                tracing::warn!(error = %e, "Retention query failed");
                return;
            }
        };
        if expired.is_empty() {
            return;
        }

        let count = expired.len();
        for shot in expired {
            if let Some(ref path) = shot.file_path
                && let Err(e) = tokio::fs::remove_file(path).await
                && e.kind() != std::io::ErrorKind::NotFound
            {
                tracing::warn!(id = shot.id, error = %e, "Failed to delete expired file");
                continue;
            }
            if let Err(e) = screenshots::mark_file_deleted(self.db.pool(), shot.id).await {
                tracing::warn!(id = shot.id, error = %e, "Failed to mark file deleted");
            }
        }
        tracing::debug!(count, "Retention sweep deleted expired capture files");
    }
}
