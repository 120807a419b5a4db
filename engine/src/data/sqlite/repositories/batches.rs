//! Batch repository (VLM work queue)

use sqlx::SqlitePool;

use super::{attempts_exhausted, backoff_delay_ms};
use crate::core::constants::MAX_ATTEMPTS;
use crate::data::sqlite::SqliteError;
use crate::data::types::BatchRow;
use crate::utils::time::now_ms;

/// Insert payload for a freshly formed batch
#[derive(Debug, Clone)]
pub struct NewBatch {
    pub batch_id: String,
    pub source_key: String,
    pub screenshot_ids: Vec<i64>,
    pub ts_start: i64,
    pub ts_end: i64,
    pub history_pack: Option<String>,
}

/// Insert a batch in `pending`
pub async fn insert(pool: &SqlitePool, batch: &NewBatch) -> Result<i64, SqliteError> {
    let now = now_ms();
    let ids_json = serde_json::to_string(&batch.screenshot_ids)?;
    let result = sqlx::query(
        "INSERT INTO batches \
         (batch_id, source_key, screenshot_ids, ts_start, ts_end, history_pack, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&batch.batch_id)
    .bind(&batch.source_key)
    .bind(&ids_json)
    .bind(batch.ts_start)
    .bind(batch.ts_end)
    .bind(&batch.history_pack)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(result.last_insert_rowid())
}

/// Insert a batch and stamp its screenshots in one transaction, so the
/// membership invariant (every listed screenshot points back at this batch)
/// holds even across a crash.
pub async fn insert_and_enqueue(pool: &SqlitePool, batch: &NewBatch) -> Result<i64, SqliteError> {
    let now = now_ms();
    let ids_json = serde_json::to_string(&batch.screenshot_ids)?;

    let mut tx = pool.begin().await?;

    let result = sqlx::query(
        "INSERT INTO batches \
         (batch_id, source_key, screenshot_ids, ts_start, ts_end, history_pack, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&batch.batch_id)
    .bind(&batch.source_key)
    .bind(&ids_json)
    .bind(batch.ts_start)
    .bind(batch.ts_end)
    .bind(&batch.history_pack)
    .bind(now)
    .bind(now)
    .execute(&mut *tx)
    .await?;
    let id = result.last_insert_rowid();

    if !batch.screenshot_ids.is_empty() {
        let placeholders = vec!["?"; batch.screenshot_ids.len()].join(",");
        let sql = format!(
            "UPDATE screenshots SET enqueued_batch_id = ?, updated_at = ? WHERE id IN ({placeholders})"
        );
        let mut query = sqlx::query(&sql).bind(&batch.batch_id).bind(now);
        for shot_id in &batch.screenshot_ids {
            query = query.bind(shot_id);
        }
        query.execute(&mut *tx).await?;
    }

    tx.commit().await?;
    Ok(id)
}

pub async fn get(pool: &SqlitePool, id: i64) -> Result<Option<BatchRow>, SqliteError> {
    let row = sqlx::query_as("SELECT * FROM batches WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

pub async fn get_by_batch_id(
    pool: &SqlitePool,
    batch_id: &str,
) -> Result<Option<BatchRow>, SqliteError> {
    let row = sqlx::query_as("SELECT * FROM batches WHERE batch_id = ?")
        .bind(batch_id)
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

/// Due batches: pending/failed, ripe, attempts remaining
pub async fn scan_due(
    pool: &SqlitePool,
    now: i64,
    limit: i64,
) -> Result<Vec<BatchRow>, SqliteError> {
    let rows = sqlx::query_as(
        "SELECT * FROM batches \
         WHERE status IN ('pending', 'failed') \
           AND (next_run_at IS NULL OR next_run_at <= ?) \
           AND attempts < ? \
         ORDER BY ts_start \
         LIMIT ?",
    )
    .bind(now)
    .bind(MAX_ATTEMPTS)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Conditional claim. Returns false when another worker won the row.
pub async fn claim(pool: &SqlitePool, id: i64, attempts: i64) -> Result<bool, SqliteError> {
    let result = sqlx::query(
        "UPDATE batches SET status = 'running', attempts = attempts + 1, \
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

/// Batch succeeded: store the parsed VLM output
pub async fn mark_succeeded(
    pool: &SqlitePool,
    id: i64,
    index_json: &str,
) -> Result<(), SqliteError> {
    sqlx::query(
        "UPDATE batches SET status = 'succeeded', index_json = ?, next_run_at = NULL, \
           last_error = NULL, last_error_code = NULL, updated_at = ? \
         WHERE id = ?",
    )
    .bind(index_json)
    .bind(now_ms())
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Batch failed: schedule a retry or escalate to failed_permanent.
/// Returns the scheduled `next_run_at` (None when permanent).
pub async fn mark_failed(
    pool: &SqlitePool,
    id: i64,
    attempts: i64,
    error: &str,
    error_code: &str,
) -> Result<Option<i64>, SqliteError> {
    let now = now_ms();
    if attempts_exhausted(attempts) {
        sqlx::query(
            "UPDATE batches SET status = 'failed_permanent', next_run_at = NULL, \
               last_error = ?, last_error_code = ?, updated_at = ? \
             WHERE id = ?",
        )
        .bind(error)
        .bind(error_code)
        .bind(now)
        .bind(id)
        .execute(pool)
        .await?;
        Ok(None)
    } else {
        let next_run_at = now + backoff_delay_ms(attempts);
        sqlx::query(
            "UPDATE batches SET status = 'failed', next_run_at = ?, \
               last_error = ?, last_error_code = ?, updated_at = ? \
             WHERE id = ?",
        )
        .bind(next_run_at)
        .bind(error)
        .bind(error_code)
        .bind(now)
        .bind(id)
        .execute(pool)
        .await?;
        Ok(Some(next_run_at))
    }
}

/// Reset batches stuck in `running` back to `pending`
pub async fn recover_stale(pool: &SqlitePool, stale_before: i64) -> Result<u64, SqliteError> {
    let result = sqlx::query(
        "UPDATE batches SET status = 'pending', next_run_at = NULL, updated_at = ? \
         WHERE status = 'running' AND updated_at < ?",
    )
    .bind(now_ms())
    .bind(stale_before)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

/// Earliest `next_run_at` among retryable batches (NULL counts as now)
pub async fn next_wake(pool: &SqlitePool, now: i64) -> Result<Option<i64>, SqliteError> {
    let wake: Option<i64> = sqlx::query_scalar(
        "SELECT MIN(COALESCE(next_run_at, ?)) FROM batches \
         WHERE status IN ('pending', 'failed') AND attempts < ?",
    )
    .bind(now)
    .bind(MAX_ATTEMPTS)
    .fetch_one(pool)
    .await?;
    Ok(wake)
}

/// Backlog metric observed by the backpressure controller
pub async fn count_pending(pool: &SqlitePool) -> Result<i64, SqliteError> {
    let count =
        sqlx::query_scalar("SELECT COUNT(*) FROM batches WHERE status IN ('pending', 'failed')")
            .fetch_one(pool)
            .await?;
    Ok(count)
}
