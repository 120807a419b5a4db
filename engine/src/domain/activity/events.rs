//! Activity event derivation
//!
//! Event keys are deterministic so regenerating a window produces the same
//! key set and upserts merge instead of duplicating. Long events are
//! synthetic per-thread events keyed `thr_<thread_id>`, detected whenever a
//! thread's activity span crosses the long threshold inside a window.

use sqlx::SqlitePool;

use crate::core::constants::{LONG_EVENT_NODE_CAP, LONG_EVENT_THRESHOLD_MS};
use crate::data::sqlite::SqliteError;
use crate::data::sqlite::repositories::activity::{self, EventUpsert};
use crate::data::sqlite::repositories::{nodes, threads};
use crate::utils::crypto::short_hash;

/// Idempotency key for a window-derived event
pub fn window_event_key(window_start: i64, idx: usize, kind: &str, title: &str) -> String {
    format!(
        "win_{window_start}_evt_{idx}_{}",
        short_hash(&format!("{kind}|{title}"))
    )
}

/// Idempotency key for a synthetic per-thread long event
pub fn thread_event_key(thread_id: &str) -> String {
    format!("thr_{thread_id}")
}

/// Detect threads that have grown past the long threshold and are active
/// within the window; upsert one synthetic long event per such thread with
/// its most recent nodes attached. Returns upserted event ids.
pub async fn detect_long_events(
    pool: &SqlitePool,
    window_start: i64,
    window_end: i64,
) -> Result<Vec<i64>, SqliteError> {
    let candidates = threads::active_in_range(pool, window_start, window_end).await?;
    let mut upserted = Vec::new();

    for thread in candidates {
        if thread.duration_ms < LONG_EVENT_THRESHOLD_MS {
            continue;
        }
        let recent = nodes::recent_for_thread(pool, &thread.id, LONG_EVENT_NODE_CAP as i64).await?;
        let node_ids: Vec<i64> = recent.iter().map(|n| n.id).collect();

        let id = activity::upsert_event(
            pool,
            &EventUpsert {
                event_key: thread_event_key(&thread.id),
                title: thread.title.clone(),
                kind: "thread".to_string(),
                start_ts: thread.start_time,
                end_ts: thread.last_active_at,
                confidence: 1.0,
                importance: 0.8,
                thread_id: Some(thread.id.clone()),
                summary_id: None,
                node_ids,
                force_long: true,
            },
        )
        .await?;
        upserted.push(id);
    }

    Ok(upserted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::data::sqlite::SqliteService;
    use crate::data::types::NodeKind;

    #[test]
    fn test_window_event_key_deterministic() {
        let a = window_event_key(1000, 0, "work", "Coding");
        let b = window_event_key(1000, 0, "work", "Coding");
        assert_eq!(a, b);
        assert!(a.starts_with("win_1000_evt_0_"));

        // Different title, different key
        assert_ne!(a, window_event_key(1000, 0, "work", "Reading"));
    }

    #[tokio::test]
    async fn test_long_thread_produces_synthetic_event() {
        let db = Arc::new(SqliteService::init_in_memory().await.unwrap());
        let thread_id = threads::create(db.pool(), "Long task", None, 0).await.unwrap();
        // Activity spans past the long threshold
        threads::touch_activity(db.pool(), &thread_id, LONG_EVENT_THRESHOLD_MS + 60_000, 60)
            .await
            .unwrap();
        let mut spec = nodes::test_node("b1", NodeKind::Event, 100);
        spec.thread_id = Some(thread_id.clone());
        let node_id = nodes::insert(db.pool(), &spec).await.unwrap();

        let upserted = detect_long_events(db.pool(), 0, LONG_EVENT_THRESHOLD_MS * 2)
            .await
            .unwrap();
        assert_eq!(upserted.len(), 1);

        let event = activity::get_event(db.pool(), upserted[0]).await.unwrap().unwrap();
        assert_eq!(event.event_key, format!("thr_{thread_id}"));
        assert!(event.is_long);
        assert_eq!(event.thread_id.as_deref(), Some(thread_id.as_str()));
        assert!(event.node_id_list().contains(&node_id));

        // Re-detection merges into the same row
        let again = detect_long_events(db.pool(), 0, LONG_EVENT_THRESHOLD_MS * 2)
            .await
            .unwrap();
        assert_eq!(again, upserted);
    }

    #[tokio::test]
    async fn test_short_thread_produces_nothing() {
        let db = Arc::new(SqliteService::init_in_memory().await.unwrap());
        let thread_id = threads::create(db.pool(), "Quick check", None, 0).await.unwrap();
        threads::touch_activity(db.pool(), &thread_id, 60_000, 2)
            .await
            .unwrap();

        let upserted = detect_long_events(db.pool(), 0, LONG_EVENT_THRESHOLD_MS).await.unwrap();
        assert!(upserted.is_empty());
    }
}
