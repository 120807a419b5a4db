//! Screenshot repository
//!
//! Screenshot rows are created by the capture frontend, claimed into batches
//! by the batch builder, and carry two task families: `vlm_*` (driven through
//! the owning batch) and `ocr_*` (driven per row).

use sqlx::SqlitePool;

use super::{attempts_exhausted, backoff_delay_ms};
use crate::core::constants::MAX_ATTEMPTS;
use crate::data::sqlite::SqliteError;
use crate::data::types::{ScreenshotRow, TaskStatus};
use crate::utils::time::now_ms;

/// Insert payload for an accepted frame
#[derive(Debug, Clone)]
pub struct NewScreenshot {
    pub ts_ms: i64,
    pub source_key: String,
    pub phash: i64,
    pub file_path: String,
    pub width: i64,
    pub height: i64,
    pub bytes: i64,
    pub mime: String,
    pub app_hint: Option<String>,
    pub window_title: Option<String>,
}

/// Insert an accepted screenshot in `vlm_status='pending'`
pub async fn insert(pool: &SqlitePool, shot: &NewScreenshot) -> Result<i64, SqliteError> {
    let now = now_ms();
    let result = sqlx::query(
        "INSERT INTO screenshots \
         (ts_ms, source_key, phash, file_path, width, height, bytes, mime, app_hint, window_title, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(shot.ts_ms)
    .bind(&shot.source_key)
    .bind(shot.phash)
    .bind(&shot.file_path)
    .bind(shot.width)
    .bind(shot.height)
    .bind(shot.bytes)
    .bind(&shot.mime)
    .bind(&shot.app_hint)
    .bind(&shot.window_title)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(result.last_insert_rowid())
}

pub async fn get(pool: &SqlitePool, id: i64) -> Result<Option<ScreenshotRow>, SqliteError> {
    let row = sqlx::query_as("SELECT * FROM screenshots WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

/// Fetch screenshots by id, preserving the requested order
pub async fn get_many(pool: &SqlitePool, ids: &[i64]) -> Result<Vec<ScreenshotRow>, SqliteError> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let placeholders = vec!["?"; ids.len()].join(",");
    let sql = format!("SELECT * FROM screenshots WHERE id IN ({placeholders})");
    let mut query = sqlx::query_as::<_, ScreenshotRow>(&sql);
    for id in ids {
        query = query.bind(id);
    }
    let mut rows: Vec<ScreenshotRow> = query.fetch_all(pool).await?;
    rows.sort_by_key(|r| ids.iter().position(|id| *id == r.id).unwrap_or(usize::MAX));
    Ok(rows)
}

/// Warm-up query for the in-memory dedup window: the most recent phashes
/// of one source, newest first.
pub async fn recent_hashes(
    pool: &SqlitePool,
    source_key: &str,
    limit: u32,
) -> Result<Vec<i64>, SqliteError> {
    let hashes = sqlx::query_scalar(
        "SELECT phash FROM screenshots WHERE source_key = ? ORDER BY ts_ms DESC LIMIT ?",
    )
    .bind(source_key)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(hashes)
}

// =============================================================================
// Batch membership
// =============================================================================

/// Stamp a set of screenshots as enqueued into a batch
pub async fn set_enqueued(
    pool: &SqlitePool,
    ids: &[i64],
    batch_id: &str,
) -> Result<(), SqliteError> {
    if ids.is_empty() {
        return Ok(());
    }
    let placeholders = vec!["?"; ids.len()].join(",");
    let sql = format!(
        "UPDATE screenshots SET enqueued_batch_id = ?, updated_at = ? WHERE id IN ({placeholders})"
    );
    let mut query = sqlx::query(&sql).bind(batch_id).bind(now_ms());
    for id in ids {
        query = query.bind(id);
    }
    query.execute(pool).await?;
    Ok(())
}

/// Screenshots never claimed by a batch: no `enqueued_batch_id`, older than
/// the cutoff, file still present, VLM work outstanding. Ordered by source
/// then timestamp so the orphan sweep can group them into new batches.
pub async fn orphans(
    pool: &SqlitePool,
    older_than_ms: i64,
    limit: u32,
) -> Result<Vec<ScreenshotRow>, SqliteError> {
    let rows = sqlx::query_as(
        "SELECT * FROM screenshots \
         WHERE enqueued_batch_id IS NULL \
           AND ts_ms < ? \
           AND file_path IS NOT NULL \
           AND storage_state = 'ephemeral' \
           AND vlm_status IN ('pending', 'failed') \
         ORDER BY source_key, ts_ms \
         LIMIT ?",
    )
    .bind(older_than_ms)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

// =============================================================================
// VLM task family (status mirrors the owning batch)
// =============================================================================

/// Move a batch's screenshots into `running` and bump their attempt counters
pub async fn mark_vlm_running(pool: &SqlitePool, ids: &[i64]) -> Result<(), SqliteError> {
    set_vlm_status(pool, ids, TaskStatus::Running, true).await
}

/// Mark a batch's screenshots failed (or permanently failed)
pub async fn mark_vlm_failed(
    pool: &SqlitePool,
    ids: &[i64],
    permanent: bool,
    next_run_at: Option<i64>,
) -> Result<(), SqliteError> {
    if ids.is_empty() {
        return Ok(());
    }
    let status = if permanent {
        TaskStatus::FailedPermanent
    } else {
        TaskStatus::Failed
    };
    let placeholders = vec!["?"; ids.len()].join(",");
    let sql = format!(
        "UPDATE screenshots SET vlm_status = ?, vlm_next_run_at = ?, updated_at = ? \
         WHERE id IN ({placeholders})"
    );
    let mut query = sqlx::query(&sql).bind(status).bind(next_run_at).bind(now_ms());
    for id in ids {
        query = query.bind(id);
    }
    query.execute(pool).await?;
    Ok(())
}

async fn set_vlm_status(
    pool: &SqlitePool,
    ids: &[i64],
    status: TaskStatus,
    bump_attempts: bool,
) -> Result<(), SqliteError> {
    if ids.is_empty() {
        return Ok(());
    }
    let placeholders = vec!["?"; ids.len()].join(",");
    let attempts_sql = if bump_attempts {
        "vlm_attempts = vlm_attempts + 1,"
    } else {
        ""
    };
    let sql = format!(
        "UPDATE screenshots SET vlm_status = ?, {attempts_sql} vlm_next_run_at = NULL, updated_at = ? \
         WHERE id IN ({placeholders})"
    );
    let mut query = sqlx::query(&sql).bind(status).bind(now_ms());
    for id in ids {
        query = query.bind(id);
    }
    query.execute(pool).await?;
    Ok(())
}

/// Per-screenshot success write after a VLM batch completes.
///
/// `app_hint` is only written when the row had none (conservative update,
/// gated on candidate confidence by the caller).
#[derive(Debug, Clone, Default)]
pub struct VlmShotUpdate {
    pub ocr_text: Option<String>,
    pub ui_text_snippets: Option<String>,
    pub app_hint: Option<String>,
    pub retention_expires_at: Option<i64>,
}

pub async fn mark_vlm_succeeded(
    pool: &SqlitePool,
    id: i64,
    update: &VlmShotUpdate,
) -> Result<(), SqliteError> {
    sqlx::query(
        "UPDATE screenshots SET \
           vlm_status = 'succeeded', \
           vlm_next_run_at = NULL, \
           ocr_text = COALESCE(?, ocr_text), \
           ui_text_snippets = COALESCE(?, ui_text_snippets), \
           app_hint = COALESCE(app_hint, ?), \
           retention_expires_at = COALESCE(?, retention_expires_at), \
           updated_at = ? \
         WHERE id = ?",
    )
    .bind(&update.ocr_text)
    .bind(&update.ui_text_snippets)
    .bind(&update.app_hint)
    .bind(update.retention_expires_at)
    .bind(now_ms())
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Reset screenshots stuck in `running` back to `pending`
pub async fn recover_stale_vlm(pool: &SqlitePool, stale_before: i64) -> Result<u64, SqliteError> {
    let result = sqlx::query(
        "UPDATE screenshots SET vlm_status = 'pending', vlm_next_run_at = NULL, updated_at = ? \
         WHERE vlm_status = 'running' AND updated_at < ?",
    )
    .bind(now_ms())
    .bind(stale_before)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

// =============================================================================
// OCR task family
// =============================================================================

/// Flag a screenshot for OCR with the detected region and language
pub async fn set_ocr_pending(
    pool: &SqlitePool,
    id: i64,
    region: &str,
    lang: &str,
) -> Result<(), SqliteError> {
    sqlx::query(
        "UPDATE screenshots SET ocr_status = 'pending', ocr_region = ?, ocr_lang = ?, updated_at = ? \
         WHERE id = ? AND storage_state = 'ephemeral'",
    )
    .bind(region)
    .bind(lang)
    .bind(now_ms())
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Due OCR rows (pending/failed, ripe, attempts remaining)
pub async fn scan_ocr_due(
    pool: &SqlitePool,
    now: i64,
    limit: i64,
) -> Result<Vec<ScreenshotRow>, SqliteError> {
    let rows = sqlx::query_as(
        "SELECT * FROM screenshots \
         WHERE ocr_status IN ('pending', 'failed') \
           AND (ocr_next_run_at IS NULL OR ocr_next_run_at <= ?) \
           AND ocr_attempts < ? \
         ORDER BY ts_ms \
         LIMIT ?",
    )
    .bind(now)
    .bind(MAX_ATTEMPTS)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Conditional claim of an OCR row. Returns false when another worker won.
pub async fn claim_ocr(pool: &SqlitePool, id: i64, attempts: i64) -> Result<bool, SqliteError> {
    let result = sqlx::query(
        "UPDATE screenshots SET ocr_status = 'running', ocr_attempts = ocr_attempts + 1, \
           ocr_next_run_at = NULL, updated_at = ? \
         WHERE id = ? AND ocr_status IN ('pending', 'failed') AND ocr_attempts = ?",
    )
    .bind(now_ms())
    .bind(id)
    .bind(attempts)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// OCR success: store text, drop the file reference, mark storage deleted
pub async fn mark_ocr_succeeded(
    pool: &SqlitePool,
    id: i64,
    ocr_text: &str,
) -> Result<(), SqliteError> {
    sqlx::query(
        "UPDATE screenshots SET ocr_status = 'succeeded', ocr_text = ?, \
           storage_state = 'deleted', file_path = NULL, updated_at = ? \
         WHERE id = ?",
    )
    .bind(ocr_text)
    .bind(now_ms())
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn mark_ocr_failed(pool: &SqlitePool, id: i64, attempts: i64) -> Result<(), SqliteError> {
    let now = now_ms();
    if attempts_exhausted(attempts) {
        sqlx::query(
            "UPDATE screenshots SET ocr_status = 'failed_permanent', ocr_next_run_at = NULL, updated_at = ? \
             WHERE id = ?",
        )
        .bind(now)
        .bind(id)
        .execute(pool)
        .await?;
    } else {
        sqlx::query(
            "UPDATE screenshots SET ocr_status = 'failed', ocr_next_run_at = ?, updated_at = ? \
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

pub async fn recover_stale_ocr(pool: &SqlitePool, stale_before: i64) -> Result<u64, SqliteError> {
    let result = sqlx::query(
        "UPDATE screenshots SET ocr_status = 'pending', ocr_next_run_at = NULL, updated_at = ? \
         WHERE ocr_status = 'running' AND updated_at < ?",
    )
    .bind(now_ms())
    .bind(stale_before)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

// =============================================================================
// Retention
// =============================================================================

/// Screenshots whose retention expired but whose file is still on disk
pub async fn retention_expired(
    pool: &SqlitePool,
    now: i64,
    limit: u32,
) -> Result<Vec<ScreenshotRow>, SqliteError> {
    let rows = sqlx::query_as(
        "SELECT * FROM screenshots \
         WHERE storage_state = 'ephemeral' \
           AND retention_expires_at IS NOT NULL AND retention_expires_at <= ? \
           AND vlm_status IN ('succeeded', 'failed_permanent') \
           AND (ocr_status IS NULL OR ocr_status IN ('succeeded', 'failed_permanent')) \
         LIMIT ?",
    )
    .bind(now)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Record that the on-disk file is gone
pub async fn mark_file_deleted(pool: &SqlitePool, id: i64) -> Result<(), SqliteError> {
    sqlx::query(
        "UPDATE screenshots SET storage_state = 'deleted', file_path = NULL, updated_at = ? \
         WHERE id = ?",
    )
    .bind(now_ms())
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

// =============================================================================
// FTS mirror
// =============================================================================

/// Refresh a screenshot's row in the FTS mirror (delete + insert by rowid)
pub async fn fts_upsert(pool: &SqlitePool, shot: &ScreenshotRow) -> Result<(), SqliteError> {
    sqlx::query("DELETE FROM screenshots_fts WHERE rowid = ?")
        .bind(shot.id)
        .execute(pool)
        .await?;
    sqlx::query(
        "INSERT INTO screenshots_fts (rowid, ocr_text, ui_text_snippets, window_title) \
         VALUES (?, ?, ?, ?)",
    )
    .bind(shot.id)
    .bind(shot.ocr_text.as_deref().unwrap_or(""))
    .bind(shot.ui_text_snippets.as_deref().unwrap_or(""))
    .bind(shot.window_title.as_deref().unwrap_or(""))
    .execute(pool)
    .await?;
    Ok(())
}

// =============================================================================
// Queue metrics
// =============================================================================

pub async fn count_vlm_outstanding(pool: &SqlitePool) -> Result<i64, SqliteError> {
    let count = sqlx::query_scalar(
        "SELECT COUNT(*) FROM screenshots WHERE vlm_status IN ('pending', 'running', 'failed')",
    )
    .fetch_one(pool)
    .await?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::sqlite::SqliteService;

    fn shot(source: &str, ts: i64, phash: i64) -> NewScreenshot {
        NewScreenshot {
            ts_ms: ts,
            source_key: source.to_string(),
            phash,
            file_path: format!("/tmp/{source}-{ts}.png"),
            width: 1920,
            height: 1080,
            bytes: 1000,
            mime: "image/png".to_string(),
            app_hint: None,
            window_title: Some("editor".to_string()),
        }
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let db = SqliteService::init_in_memory().await.unwrap();
        let id = insert(db.pool(), &shot("screen:1", 1000, 42)).await.unwrap();
        let row = get(db.pool(), id).await.unwrap().unwrap();
        assert_eq!(row.source_key, "screen:1");
        assert_eq!(row.vlm_status, TaskStatus::Pending);
        assert_eq!(row.vlm_attempts, 0);
        assert!(row.ocr_status.is_none());
    }

    #[tokio::test]
    async fn test_get_many_preserves_order() {
        let db = SqliteService::init_in_memory().await.unwrap();
        let a = insert(db.pool(), &shot("s", 1, 1)).await.unwrap();
        let b = insert(db.pool(), &shot("s", 2, 2)).await.unwrap();
        let rows = get_many(db.pool(), &[b, a]).await.unwrap();
        assert_eq!(rows[0].id, b);
        assert_eq!(rows[1].id, a);
    }

    #[tokio::test]
    async fn test_claim_ocr_contention() {
        let db = SqliteService::init_in_memory().await.unwrap();
        let id = insert(db.pool(), &shot("s", 1, 1)).await.unwrap();
        set_ocr_pending(db.pool(), id, "[0,0,100,100]", "ja")
            .await
            .unwrap();

        // First claim at attempts=0 wins; a second claim at the same
        // observed attempt count must lose.
        assert!(claim_ocr(db.pool(), id, 0).await.unwrap());
        assert!(!claim_ocr(db.pool(), id, 0).await.unwrap());
    }

    #[tokio::test]
    async fn test_ocr_failure_schedules_retry_then_permanent() {
        let db = SqliteService::init_in_memory().await.unwrap();
        let id = insert(db.pool(), &shot("s", 1, 1)).await.unwrap();
        set_ocr_pending(db.pool(), id, "[0,0,10,10]", "ja")
            .await
            .unwrap();

        assert!(claim_ocr(db.pool(), id, 0).await.unwrap());
        mark_ocr_failed(db.pool(), id, 1).await.unwrap();
        let row = get(db.pool(), id).await.unwrap().unwrap();
        assert_eq!(row.ocr_status, Some(TaskStatus::Failed));
        assert!(row.ocr_next_run_at.unwrap() > now_ms());

        mark_ocr_failed(db.pool(), id, MAX_ATTEMPTS).await.unwrap();
        let row = get(db.pool(), id).await.unwrap().unwrap();
        assert_eq!(row.ocr_status, Some(TaskStatus::FailedPermanent));
        assert!(row.ocr_next_run_at.is_none());
    }

    #[tokio::test]
    async fn test_ocr_success_drops_file() {
        let db = SqliteService::init_in_memory().await.unwrap();
        let id = insert(db.pool(), &shot("s", 1, 1)).await.unwrap();
        mark_ocr_succeeded(db.pool(), id, "recognized text")
            .await
            .unwrap();
        let row = get(db.pool(), id).await.unwrap().unwrap();
        assert_eq!(row.ocr_text.as_deref(), Some("recognized text"));
        assert_eq!(row.storage_state, crate::data::types::StorageState::Deleted);
        assert!(row.file_path.is_none());
    }

    #[tokio::test]
    async fn test_vlm_success_is_conservative_on_app_hint() {
        let db = SqliteService::init_in_memory().await.unwrap();
        let mut s = shot("s", 1, 1);
        s.app_hint = Some("Terminal".to_string());
        let id = insert(db.pool(), &s).await.unwrap();

        let update = VlmShotUpdate {
            app_hint: Some("Browser".to_string()),
            ..Default::default()
        };
        mark_vlm_succeeded(db.pool(), id, &update).await.unwrap();
        let row = get(db.pool(), id).await.unwrap().unwrap();
        // Existing hint wins
        assert_eq!(row.app_hint.as_deref(), Some("Terminal"));
        assert_eq!(row.vlm_status, TaskStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_orphans_excludes_enqueued() {
        let db = SqliteService::init_in_memory().await.unwrap();
        let a = insert(db.pool(), &shot("s", 1, 1)).await.unwrap();
        let b = insert(db.pool(), &shot("s", 2, 2)).await.unwrap();
        set_enqueued(db.pool(), &[b], "batch-x").await.unwrap();

        let rows = orphans(db.pool(), 100, 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, a);
    }

    #[tokio::test]
    async fn test_recover_stale_vlm() {
        let db = SqliteService::init_in_memory().await.unwrap();
        let id = insert(db.pool(), &shot("s", 1, 1)).await.unwrap();
        mark_vlm_running(db.pool(), &[id]).await.unwrap();

        // Not stale yet
        let recovered = recover_stale_vlm(db.pool(), now_ms() - 60_000).await.unwrap();
        assert_eq!(recovered, 0);

        // Stale threshold in the future captures the row
        let recovered = recover_stale_vlm(db.pool(), now_ms() + 1).await.unwrap();
        assert_eq!(recovered, 1);
        let row = get(db.pool(), id).await.unwrap().unwrap();
        assert_eq!(row.vlm_status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_fts_upsert_and_match() {
        let db = SqliteService::init_in_memory().await.unwrap();
        let id = insert(db.pool(), &shot("s", 1, 1)).await.unwrap();
        mark_ocr_succeeded(db.pool(), id, "rust compiler error")
            .await
            .unwrap();
        let row = get(db.pool(), id).await.unwrap().unwrap();
        fts_upsert(db.pool(), &row).await.unwrap();

        let hits: Vec<i64> =
            sqlx::query_scalar("SELECT rowid FROM screenshots_fts WHERE screenshots_fts MATCH ?")
                .bind("compiler")
                .fetch_all(db.pool())
                .await
                .unwrap();
        assert_eq!(hits, vec![id]);
    }
}
