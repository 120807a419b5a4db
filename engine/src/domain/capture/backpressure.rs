//! Backpressure controller
//!
//! Polls the durable store for the VLM backlog (pending batches) and maps
//! it onto a discrete pressure ladder with hysteresis. Level changes retune
//! the capture scheduler: longer periods and a stricter dedup threshold
//! shed load at the source instead of growing the queue.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::core::constants::{BACKPRESSURE_ENTER, BACKPRESSURE_EXIT, BACKPRESSURE_POLL_SECS};
use crate::data::sqlite::SqliteService;
use crate::data::sqlite::repositories::{batches, settings};
use crate::data::topics::{BackpressureEvent, EventBus};
use crate::utils::time::now_ms;

/// Discrete pressure ladder
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PressureLevel {
    Healthy,
    Warning,
    Hot,
    Critical,
}

impl PressureLevel {
    pub const fn as_str(&self) -> &'static str {
        match self {
            PressureLevel::Healthy => "healthy",
            PressureLevel::Warning => "warning",
            PressureLevel::Hot => "hot",
            PressureLevel::Critical => "critical",
        }
    }

    const fn rank(&self) -> usize {
        match self {
            PressureLevel::Healthy => 0,
            PressureLevel::Warning => 1,
            PressureLevel::Hot => 2,
            PressureLevel::Critical => 3,
        }
    }

    const fn from_rank(rank: usize) -> Self {
        match rank {
            0 => PressureLevel::Healthy,
            1 => PressureLevel::Warning,
            2 => PressureLevel::Hot,
            _ => PressureLevel::Critical,
        }
    }

    /// Capture period multiplier at this level
    pub const fn interval_multiplier(&self) -> f64 {
        match self {
            PressureLevel::Healthy => 1.0,
            PressureLevel::Warning => 1.5,
            PressureLevel::Hot => 2.5,
            PressureLevel::Critical => 4.0,
        }
    }

    /// Added on top of the configured dedup threshold at this level
    pub const fn phash_threshold_delta(&self) -> u32 {
        match self {
            PressureLevel::Healthy => 0,
            PressureLevel::Warning => 1,
            PressureLevel::Hot => 2,
            PressureLevel::Critical => 4,
        }
    }
}

/// Live capture tuning derived from the pressure level
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CaptureTuning {
    pub interval_multiplier: f64,
    pub phash_threshold: u32,
}

/// Pure ladder transition with hysteresis.
///
/// Rising requires the backlog to reach the next level's entry bound;
/// falling requires it to drop below the current level's exit floor.
/// One step per evaluation in either direction keeps transitions smooth.
pub fn next_level(current: PressureLevel, backlog: i64) -> PressureLevel {
    let rank = current.rank();

    if rank < 3 && backlog >= BACKPRESSURE_ENTER[rank] {
        return PressureLevel::from_rank(rank + 1);
    }
    if rank > 0 && backlog < BACKPRESSURE_EXIT[rank - 1] {
        return PressureLevel::from_rank(rank - 1);
    }
    current
}

/// Watches the backlog and publishes tuning updates
pub struct BackpressureController {
    db: Arc<SqliteService>,
    bus: Arc<EventBus>,
    base_phash_threshold: u32,
    level: Mutex<PressureLevel>,
    tuning_tx: watch::Sender<CaptureTuning>,
    tuning_rx: watch::Receiver<CaptureTuning>,
}

impl BackpressureController {
    pub fn new(db: Arc<SqliteService>, bus: Arc<EventBus>, base_phash_threshold: u32) -> Arc<Self> {
        let initial = CaptureTuning {
            interval_multiplier: PressureLevel::Healthy.interval_multiplier(),
            phash_threshold: base_phash_threshold,
        };
        let (tuning_tx, tuning_rx) = watch::channel(initial);
        Arc::new(Self {
            db,
            bus,
            base_phash_threshold,
            level: Mutex::new(PressureLevel::Healthy),
            tuning_tx,
            tuning_rx,
        })
    }

    /// Watch the capture scheduler subscribes to
    pub fn tuning_rx(&self) -> watch::Receiver<CaptureTuning> {
        self.tuning_rx.clone()
    }

    pub fn level(&self) -> PressureLevel {
        *self.level.lock()
    }

    fn tuning_for(&self, level: PressureLevel) -> CaptureTuning {
        CaptureTuning {
            interval_multiplier: level.interval_multiplier(),
            phash_threshold: self.base_phash_threshold + level.phash_threshold_delta(),
        }
    }

    /// One evaluation step against the current backlog
    pub async fn evaluate(&self) {
        let backlog = match batches::count_pending(self.db.pool()).await {
            Ok(count) => count,
            Err(e) => {
                tracing::warn!(error = %e, "Backpressure backlog query failed");
                return;
            }
        };

        let (changed, level) = {
            let mut current = self.level.lock();
            let next = next_level(*current, backlog);
            let changed = next != *current;
            *current = next;
            (changed, next)
        };

        if changed {
            let tuning = self.tuning_for(level);
            tracing::info!(
                level = level.as_str(),
                backlog,
                interval_multiplier = tuning.interval_multiplier,
                phash_threshold = tuning.phash_threshold,
                "Backpressure level changed"
            );
            let _ = self.tuning_tx.send(tuning);
            self.bus.publish_backpressure(BackpressureEvent {
                at_ms: now_ms(),
                level: level.as_str().to_string(),
                interval_multiplier: tuning.interval_multiplier,
                phash_threshold: tuning.phash_threshold,
            });
            // Mirror into the settings row for observability
            if let Err(e) = settings::set_capture_tuning(
                self.db.pool(),
                tuning.interval_multiplier,
                tuning.phash_threshold,
            )
            .await
            {
                tracing::warn!(error = %e, "Failed to mirror capture tuning");
            }
        }
    }

    pub fn start(self: &Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(BACKPRESSURE_POLL_SECS));
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            tracing::debug!("Backpressure controller shutting down");
                            break;
                        }
                    }
                    _ = interval.tick() => {
                        controller.evaluate().await;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::sqlite::repositories::batches::NewBatch;

    #[test]
    fn test_ladder_rises_on_entry_bounds() {
        assert_eq!(
            next_level(PressureLevel::Healthy, BACKPRESSURE_ENTER[0]),
            PressureLevel::Warning
        );
        assert_eq!(
            next_level(PressureLevel::Warning, BACKPRESSURE_ENTER[1]),
            PressureLevel::Hot
        );
        assert_eq!(
            next_level(PressureLevel::Hot, BACKPRESSURE_ENTER[2]),
            PressureLevel::Critical
        );
    }

    #[test]
    fn test_ladder_hysteresis_band_holds() {
        // Between the exit floor and the entry bound, the level is sticky
        let mid = (BACKPRESSURE_EXIT[0] + BACKPRESSURE_ENTER[0]) / 2;
        assert_eq!(next_level(PressureLevel::Warning, mid), PressureLevel::Warning);
        assert_eq!(
            next_level(PressureLevel::Warning, BACKPRESSURE_EXIT[0] - 1),
            PressureLevel::Healthy
        );
    }

    #[test]
    fn test_ladder_steps_one_level_at_a_time() {
        // A huge backlog spike still climbs one level per evaluation
        assert_eq!(next_level(PressureLevel::Healthy, 10_000), PressureLevel::Warning);
        assert_eq!(next_level(PressureLevel::Warning, 10_000), PressureLevel::Hot);
    }

    #[tokio::test]
    async fn test_controller_reacts_to_backlog() {
        let db = Arc::new(SqliteService::init_in_memory().await.unwrap());
        let bus = Arc::new(EventBus::new());
        let controller = BackpressureController::new(Arc::clone(&db), Arc::clone(&bus), 4);
        let tuning_rx = controller.tuning_rx();

        // Inject a critical-sized backlog
        for i in 0..BACKPRESSURE_ENTER[2] + 10 {
            batches::insert(
                db.pool(),
                &NewBatch {
                    batch_id: format!("b{i}"),
                    source_key: "screen:1".to_string(),
                    screenshot_ids: vec![i],
                    ts_start: i,
                    ts_end: i + 1,
                    history_pack: None,
                },
            )
            .await
            .unwrap();
        }

        // Three evaluations climb the full ladder
        controller.evaluate().await;
        controller.evaluate().await;
        controller.evaluate().await;
        assert_eq!(controller.level(), PressureLevel::Critical);
        let tuning = *tuning_rx.borrow();
        assert_eq!(
            tuning.interval_multiplier,
            PressureLevel::Critical.interval_multiplier()
        );
        assert_eq!(tuning.phash_threshold, 4 + PressureLevel::Critical.phash_threshold_delta());

        // Drain the backlog below every exit floor: steps back down
        sqlx::query("UPDATE batches SET status = 'succeeded'")
            .execute(db.pool())
            .await
            .unwrap();
        controller.evaluate().await;
        controller.evaluate().await;
        controller.evaluate().await;
        assert_eq!(controller.level(), PressureLevel::Healthy);
        assert_eq!(tuning_rx.borrow().phash_threshold, 4);
    }
}
