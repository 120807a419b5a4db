//! Activity timeline engine
//!
//! Rolls context nodes into fixed UTC-aligned windows, generates per-window
//! summaries and events, detects long events, serves lazy event details,
//! and emits debounced change notifications.

pub mod details;
pub mod events;
pub mod notify;
pub mod summary;

pub use details::DetailsGenerator;
pub use notify::ActivityNotifier;
pub use summary::SummaryWorker;

use std::sync::Arc;

use serde::Serialize;

use crate::core::constants::ACTIVITY_WINDOW_MS;
use crate::data::sqlite::repositories::activity;
use crate::data::sqlite::{SqliteError, SqliteService};
use crate::data::types::{ActivityEventRow, ActivitySummaryRow};
use crate::utils::json::{parse_id_vec, parse_string_vec};
use crate::utils::time::floor_to_window;

/// One window as returned to the UI
#[derive(Debug, Serialize)]
pub struct TimelineWindow {
    pub window_start: i64,
    pub window_end: i64,
    pub status: String,
    pub title: Option<String>,
    pub summary: Option<String>,
    pub highlights: Vec<String>,
    pub stats: Option<serde_json::Value>,
    pub events: Vec<TimelineEvent>,
}

#[derive(Debug, Serialize)]
pub struct TimelineEvent {
    pub id: i64,
    pub event_key: String,
    pub title: String,
    pub kind: String,
    pub start_ts: i64,
    pub end_ts: i64,
    pub duration_ms: i64,
    pub is_long: bool,
    pub confidence: f64,
    pub importance: f64,
    pub thread_id: Option<String>,
    pub node_ids: Vec<i64>,
    pub has_details: bool,
}

impl TimelineEvent {
    fn from_row(row: &ActivityEventRow) -> Self {
        Self {
            id: row.id,
            event_key: row.event_key.clone(),
            title: row.title.clone(),
            kind: row.kind.clone(),
            start_ts: row.start_ts,
            end_ts: row.end_ts,
            duration_ms: row.duration_ms,
            is_long: row.is_long,
            confidence: row.confidence,
            importance: row.importance,
            thread_id: row.thread_id.clone(),
            node_ids: parse_id_vec(Some(&row.node_ids)),
            has_details: row.details_text.is_some(),
        }
    }
}

/// Timeline assembled for a query range
#[derive(Debug, Serialize)]
pub struct Timeline {
    pub windows: Vec<TimelineWindow>,
    pub long_events: Vec<TimelineEvent>,
}

/// Read-side service over the activity tables
pub struct ActivityService {
    db: Arc<SqliteService>,
}

impl ActivityService {
    pub fn new(db: Arc<SqliteService>) -> Arc<Self> {
        Arc::new(Self { db })
    }

    /// Assemble windows and long events intersecting `[from_ts, to_ts]`
    pub async fn get_timeline(&self, from_ts: i64, to_ts: i64) -> Result<Timeline, SqliteError> {
        let from = floor_to_window(from_ts, ACTIVITY_WINDOW_MS);
        let summaries = activity::summaries_in_range(self.db.pool(), from, to_ts).await?;
        let events = activity::events_in_range(self.db.pool(), from_ts, to_ts).await?;

        let windows = summaries
            .iter()
            .map(|s| {
                let window_events = events
                    .iter()
                    .filter(|e| {
                        !e.is_long && e.start_ts < s.window_end && e.end_ts >= s.window_start
                    })
                    .map(TimelineEvent::from_row)
                    .collect();
                summary_to_window(s, window_events)
            })
            .collect();

        let long_events = events
            .iter()
            .filter(|e| e.is_long)
            .map(TimelineEvent::from_row)
            .collect();

        Ok(Timeline {
            windows,
            long_events,
        })
    }

    /// One window's summary, if a row exists
    pub async fn get_summary(
        &self,
        window_start: i64,
        window_end: i64,
    ) -> Result<Option<TimelineWindow>, SqliteError> {
        let Some(row) = activity::get_summary(self.db.pool(), window_start, window_end).await?
        else {
            return Ok(None);
        };
        let events = activity::events_in_range(self.db.pool(), window_start, window_end - 1)
            .await?
            .iter()
            .filter(|e| !e.is_long)
            .map(TimelineEvent::from_row)
            .collect();
        Ok(Some(summary_to_window(&row, events)))
    }

    /// Queue a window for regeneration; the reconcile loop picks it up
    pub async fn regenerate_summary(
        &self,
        window_start: i64,
        window_end: i64,
    ) -> Result<bool, SqliteError> {
        activity::reset_summary_for_regeneration(self.db.pool(), window_start, window_end).await
    }
}

fn summary_to_window(row: &ActivitySummaryRow, events: Vec<TimelineEvent>) -> TimelineWindow {
    TimelineWindow {
        window_start: row.window_start,
        window_end: row.window_end,
        status: row.status.as_str().to_string(),
        title: row.title.clone(),
        summary: row.summary.clone(),
        highlights: parse_string_vec(row.highlights.as_deref()),
        stats: row
            .stats
            .as_deref()
            .and_then(|s| serde_json::from_str(s).ok()),
        events,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::data::sqlite::repositories::activity::EventUpsert;
    use crate::data::sqlite::repositories::nodes;
    use crate::data::types::NodeKind;

    #[tokio::test]
    async fn test_timeline_assembles_windows_and_long_events() {
        let db = Arc::new(SqliteService::init_in_memory().await.unwrap());
        nodes::insert(db.pool(), &nodes::test_node("b1", NodeKind::Event, 1_000))
            .await
            .unwrap();
        activity::ensure_window_rows(db.pool(), ACTIVITY_WINDOW_MS, ACTIVITY_WINDOW_MS * 2)
            .await
            .unwrap();

        activity::upsert_event(
            db.pool(),
            &EventUpsert {
                event_key: "k1".to_string(),
                title: "Short".to_string(),
                kind: "work".to_string(),
                start_ts: 500,
                end_ts: 1_500,
                confidence: 0.5,
                importance: 0.5,
                thread_id: None,
                summary_id: None,
                node_ids: vec![],
                force_long: false,
            },
        )
        .await
        .unwrap();
        activity::upsert_event(
            db.pool(),
            &EventUpsert {
                event_key: "thr_a".to_string(),
                title: "Long".to_string(),
                kind: "thread".to_string(),
                start_ts: 0,
                end_ts: ACTIVITY_WINDOW_MS,
                confidence: 1.0,
                importance: 0.8,
                thread_id: Some("thr_a".to_string()),
                summary_id: None,
                node_ids: vec![],
                force_long: true,
            },
        )
        .await
        .unwrap();

        let service = ActivityService::new(Arc::clone(&db));
        let timeline = service.get_timeline(0, ACTIVITY_WINDOW_MS).await.unwrap();

        assert_eq!(timeline.windows.len(), 1);
        assert_eq!(timeline.windows[0].status, "pending");
        assert_eq!(timeline.windows[0].events.len(), 1);
        assert_eq!(timeline.windows[0].events[0].title, "Short");
        assert_eq!(timeline.long_events.len(), 1);
        assert_eq!(timeline.long_events[0].title, "Long");
    }

    #[tokio::test]
    async fn test_get_summary_missing_is_none() {
        let db = Arc::new(SqliteService::init_in_memory().await.unwrap());
        let service = ActivityService::new(Arc::clone(&db));
        assert!(
            service
                .get_summary(0, ACTIVITY_WINDOW_MS)
                .await
                .unwrap()
                .is_none()
        );
    }
}
