//! Activity summary and event repositories
//!
//! Summaries are keyed by a UTC-aligned `(window_start, window_end)` grid.
//! Events are idempotent on `event_key`; conflicting upserts merge so one
//! logical event can span multiple windows.

use sqlx::SqlitePool;

use super::{attempts_exhausted, backoff_delay_ms};
use crate::core::constants::{LONG_EVENT_THRESHOLD_MS, MAX_ATTEMPTS};
use crate::data::sqlite::SqliteError;
use crate::data::types::{ActivityEventRow, ActivitySummaryRow};
use crate::utils::json::parse_id_vec;
use crate::utils::time::{floor_to_window, now_ms};

// =============================================================================
// Summaries
// =============================================================================

/// Insert a pending summary row for every completed window that has nodes
/// and no row yet. Returns the number of new rows.
pub async fn ensure_window_rows(
    pool: &SqlitePool,
    window_ms: i64,
    now: i64,
) -> Result<u64, SqliteError> {
    let completed_before = floor_to_window(now, window_ms);
    let result = sqlx::query(
        "INSERT OR IGNORE INTO activity_summaries (window_start, window_end, created_at, updated_at) \
         SELECT DISTINCT (event_time - (event_time % ?1)), (event_time - (event_time % ?1)) + ?1, ?2, ?2 \
         FROM context_nodes \
         WHERE event_time < ?3",
    )
    .bind(window_ms)
    .bind(now)
    .bind(completed_before)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

pub async fn get_summary(
    pool: &SqlitePool,
    window_start: i64,
    window_end: i64,
) -> Result<Option<ActivitySummaryRow>, SqliteError> {
    let row = sqlx::query_as(
        "SELECT * FROM activity_summaries WHERE window_start = ? AND window_end = ?",
    )
    .bind(window_start)
    .bind(window_end)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

pub async fn get_summary_by_id(
    pool: &SqlitePool,
    id: i64,
) -> Result<Option<ActivitySummaryRow>, SqliteError> {
    let row = sqlx::query_as("SELECT * FROM activity_summaries WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

pub async fn summaries_in_range(
    pool: &SqlitePool,
    from: i64,
    to: i64,
) -> Result<Vec<ActivitySummaryRow>, SqliteError> {
    let rows = sqlx::query_as(
        "SELECT * FROM activity_summaries WHERE window_start >= ? AND window_start < ? \
         ORDER BY window_start",
    )
    .bind(from)
    .bind(to)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn scan_summaries_due(
    pool: &SqlitePool,
    now: i64,
    limit: i64,
) -> Result<Vec<ActivitySummaryRow>, SqliteError> {
    let rows = sqlx::query_as(
        "SELECT * FROM activity_summaries \
         WHERE status IN ('pending', 'failed') \
           AND (next_run_at IS NULL OR next_run_at <= ?) \
           AND attempts < ? \
         ORDER BY window_start \
         LIMIT ?",
    )
    .bind(now)
    .bind(MAX_ATTEMPTS)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn claim_summary(pool: &SqlitePool, id: i64, attempts: i64) -> Result<bool, SqliteError> {
    let result = sqlx::query(
        "UPDATE activity_summaries SET status = 'running', attempts = attempts + 1, \
           next_run_at = NULL, updated_at = ? \
         WHERE id = ? AND status IN ('pending', 'failed') AND attempts = ?",
    )
    .bind(now_ms())
    .bind(id)
    .bind(attempts)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn mark_summary_succeeded(
    pool: &SqlitePool,
    id: i64,
    title: &str,
    summary: &str,
    highlights_json: &str,
    stats_json: &str,
) -> Result<(), SqliteError> {
    sqlx::query(
        "UPDATE activity_summaries SET status = 'succeeded', title = ?, summary = ?, \
           highlights = ?, stats = ?, next_run_at = NULL, updated_at = ? \
         WHERE id = ?",
    )
    .bind(title)
    .bind(summary)
    .bind(highlights_json)
    .bind(stats_json)
    .bind(now_ms())
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Empty window: terminal `no_data` with a synthetic markdown summary
pub async fn mark_summary_no_data(pool: &SqlitePool, id: i64) -> Result<(), SqliteError> {
    sqlx::query(
        "UPDATE activity_summaries SET status = 'no_data', title = '', \
           summary = '_No activity recorded in this window._', next_run_at = NULL, updated_at = ? \
         WHERE id = ?",
    )
    .bind(now_ms())
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn mark_summary_failed(
    pool: &SqlitePool,
    id: i64,
    attempts: i64,
) -> Result<(), SqliteError> {
    let now = now_ms();
    if attempts_exhausted(attempts) {
        sqlx::query(
            "UPDATE activity_summaries SET status = 'failed_permanent', next_run_at = NULL, updated_at = ? \
             WHERE id = ?",
        )
        .bind(now)
        .bind(id)
        .execute(pool)
        .await?;
    } else {
        sqlx::query(
            "UPDATE activity_summaries SET status = 'failed', next_run_at = ?, updated_at = ? \
             WHERE id = ?",
        )
        .bind(now + backoff_delay_ms(attempts))
        .bind(now)
        .bind(id)
        .execute(pool)
        .await?;
    }
    Ok(())
}

/// Reset a terminal summary back to pending for explicit regeneration
pub async fn reset_summary_for_regeneration(
    pool: &SqlitePool,
    window_start: i64,
    window_end: i64,
) -> Result<bool, SqliteError> {
    let result = sqlx::query(
        "UPDATE activity_summaries SET status = 'pending', attempts = 0, next_run_at = NULL, updated_at = ? \
         WHERE window_start = ? AND window_end = ? AND status != 'running'",
    )
    .bind(now_ms())
    .bind(window_start)
    .bind(window_end)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn recover_stale_summaries(
    pool: &SqlitePool,
    stale_before: i64,
) -> Result<u64, SqliteError> {
    let result = sqlx::query(
        "UPDATE activity_summaries SET status = 'pending', next_run_at = NULL, updated_at = ? \
         WHERE status = 'running' AND updated_at < ?",
    )
    .bind(now_ms())
    .bind(stale_before)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

pub async fn next_wake_summaries(pool: &SqlitePool, now: i64) -> Result<Option<i64>, SqliteError> {
    let wake: Option<i64> = sqlx::query_scalar(
        "SELECT MIN(COALESCE(next_run_at, ?)) FROM activity_summaries \
         WHERE status IN ('pending', 'failed') AND attempts < ?",
    )
    .bind(now)
    .bind(MAX_ATTEMPTS)
    .fetch_one(pool)
    .await?;
    Ok(wake)
}

pub async fn count_summaries_pending(pool: &SqlitePool) -> Result<i64, SqliteError> {
    let count = sqlx::query_scalar(
        "SELECT COUNT(*) FROM activity_summaries WHERE status IN ('pending', 'failed')",
    )
    .fetch_one(pool)
    .await?;
    Ok(count)
}

// =============================================================================
// Events
// =============================================================================

/// Upsert payload for an activity event
#[derive(Debug, Clone)]
pub struct EventUpsert {
    pub event_key: String,
    pub title: String,
    pub kind: String,
    pub start_ts: i64,
    pub end_ts: i64,
    pub confidence: f64,
    pub importance: f64,
    pub thread_id: Option<String>,
    pub summary_id: Option<i64>,
    pub node_ids: Vec<i64>,
    /// Force the long flag regardless of duration (synthetic thread events)
    pub force_long: bool,
}

/// Idempotent event upsert keyed by `event_key`.
///
/// On conflict the spans merge (min start, max end), `node_ids` union, the
/// newer title/kind/confidence/importance win, and existing
/// `thread_id`/`summary_id` survive a null incoming value. Long events get
/// `details_status='pending'` so details can be generated on demand.
pub async fn upsert_event(pool: &SqlitePool, event: &EventUpsert) -> Result<i64, SqliteError> {
    let now = now_ms();

    let mut tx = pool.begin().await?;

    let existing: Option<(i64, i64, i64, String)> = sqlx::query_as(
        "SELECT id, start_ts, end_ts, node_ids FROM activity_events WHERE event_key = ?",
    )
    .bind(&event.event_key)
    .fetch_optional(&mut *tx)
    .await?;

    let id = match existing {
        None => {
            let duration = event.end_ts - event.start_ts;
            let is_long = event.force_long || duration >= LONG_EVENT_THRESHOLD_MS;
            let details_status = if is_long { Some("pending") } else { None };
            let result = sqlx::query(
                "INSERT INTO activity_events \
                 (event_key, title, kind, start_ts, end_ts, duration_ms, is_long, confidence, \
                  importance, thread_id, summary_id, node_ids, details_status, created_at, updated_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&event.event_key)
            .bind(&event.title)
            .bind(&event.kind)
            .bind(event.start_ts)
            .bind(event.end_ts)
            .bind(duration)
            .bind(is_long)
            .bind(event.confidence)
            .bind(event.importance)
            .bind(&event.thread_id)
            .bind(event.summary_id)
            .bind(serde_json::to_string(&event.node_ids)?)
            .bind(details_status)
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await?;
            result.last_insert_rowid()
        }
        Some((id, old_start, old_end, old_node_ids)) => {
            let start_ts = old_start.min(event.start_ts);
            let end_ts = old_end.max(event.end_ts);
            let duration = end_ts - start_ts;
            let is_long = event.force_long || duration >= LONG_EVENT_THRESHOLD_MS;

            let mut node_ids = parse_id_vec(Some(&old_node_ids));
            for nid in &event.node_ids {
                if !node_ids.contains(nid) {
                    node_ids.push(*nid);
                }
            }

            sqlx::query(
                "UPDATE activity_events SET \
                   title = ?, kind = ?, start_ts = ?, end_ts = ?, duration_ms = ?, is_long = ?, \
                   confidence = ?, importance = ?, \
                   thread_id = COALESCE(?, thread_id), \
                   summary_id = COALESCE(?, summary_id), \
                   node_ids = ?, \
                   details_status = CASE WHEN ? AND details_status IS NULL THEN 'pending' ELSE details_status END, \
                   updated_at = ? \
                 WHERE id = ?",
            )
            .bind(&event.title)
            .bind(&event.kind)
            .bind(start_ts)
            .bind(end_ts)
            .bind(duration)
            .bind(is_long)
            .bind(event.confidence)
            .bind(event.importance)
            .bind(&event.thread_id)
            .bind(event.summary_id)
            .bind(serde_json::to_string(&node_ids)?)
            .bind(is_long)
            .bind(now)
            .bind(id)
            .execute(&mut *tx)
            .await?;
            id
        }
    };

    tx.commit().await?;
    Ok(id)
}

pub async fn get_event(pool: &SqlitePool, id: i64) -> Result<Option<ActivityEventRow>, SqliteError> {
    let row = sqlx::query_as("SELECT * FROM activity_events WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

/// Events whose span intersects `[from, to]`
pub async fn events_in_range(
    pool: &SqlitePool,
    from: i64,
    to: i64,
) -> Result<Vec<ActivityEventRow>, SqliteError> {
    let rows = sqlx::query_as(
        "SELECT * FROM activity_events WHERE start_ts <= ? AND end_ts >= ? ORDER BY start_ts",
    )
    .bind(to)
    .bind(from)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn long_events_in_range(
    pool: &SqlitePool,
    from: i64,
    to: i64,
) -> Result<Vec<ActivityEventRow>, SqliteError> {
    let rows = sqlx::query_as(
        "SELECT * FROM activity_events WHERE is_long = 1 AND start_ts <= ? AND end_ts >= ? \
         ORDER BY start_ts",
    )
    .bind(to)
    .bind(from)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Event keys produced from a summary window (regeneration idempotence checks)
pub async fn event_keys_for_summary(
    pool: &SqlitePool,
    summary_id: i64,
) -> Result<Vec<String>, SqliteError> {
    let keys = sqlx::query_scalar(
        "SELECT event_key FROM activity_events WHERE summary_id = ? ORDER BY event_key",
    )
    .bind(summary_id)
    .fetch_all(pool)
    .await?;
    Ok(keys)
}

// =============================================================================
// Event details task family (lazy, on demand)
// =============================================================================

pub async fn claim_details(pool: &SqlitePool, id: i64, attempts: i64) -> Result<bool, SqliteError> {
    let result = sqlx::query(
        "UPDATE activity_events SET details_status = 'running', \
           details_attempts = details_attempts + 1, details_next_run_at = NULL, updated_at = ? \
         WHERE id = ? AND details_status IN ('pending', 'failed') AND details_attempts = ?",
    )
    .bind(now_ms())
    .bind(id)
    .bind(attempts)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn mark_details_succeeded(
    pool: &SqlitePool,
    id: i64,
    details_text: &str,
) -> Result<(), SqliteError> {
    sqlx::query(
        "UPDATE activity_events SET details_status = 'succeeded', details_text = ?, \
           details_next_run_at = NULL, updated_at = ? \
         WHERE id = ?",
    )
    .bind(details_text)
    .bind(now_ms())
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn mark_details_failed(
    pool: &SqlitePool,
    id: i64,
    attempts: i64,
) -> Result<(), SqliteError> {
    let now = now_ms();
    if attempts_exhausted(attempts) {
        sqlx::query(
            "UPDATE activity_events SET details_status = 'failed_permanent', \
               details_next_run_at = NULL, updated_at = ? WHERE id = ?",
        )
        .bind(now)
        .bind(id)
        .execute(pool)
        .await?;
    } else {
        sqlx::query(
            "UPDATE activity_events SET details_status = 'failed', details_next_run_at = ?, \
               updated_at = ? WHERE id = ?",
        )
        .bind(now + backoff_delay_ms(attempts))
        .bind(now)
        .bind(id)
        .execute(pool)
        .await?;
    }
    Ok(())
}

pub async fn recover_stale_details(
    pool: &SqlitePool,
    stale_before: i64,
) -> Result<u64, SqliteError> {
    let result = sqlx::query(
        "UPDATE activity_events SET details_status = 'pending', details_next_run_at = NULL, updated_at = ? \
         WHERE details_status = 'running' AND updated_at < ?",
    )
    .bind(now_ms())
    .bind(stale_before)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}
