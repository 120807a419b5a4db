//! Vector document repository
//!
//! One row per indexable node, carrying two independent subtask states.
//! The invariant `index_status = succeeded implies embedding_status =
//! succeeded` is enforced here: indexing work only ever scans rows whose
//! embedding already succeeded, and a text change resets both states.

use sqlx::SqlitePool;

use super::{attempts_exhausted, backoff_delay_ms};
use crate::core::constants::MAX_ATTEMPTS;
use crate::data::sqlite::SqliteError;
use crate::data::types::VectorDocumentRow;
use crate::utils::crypto::sha256_hex;
use crate::utils::time::now_ms;

/// Result of an upsert: whether embedding work was (re)enqueued
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// New row, embedding pending
    Inserted,
    /// Text changed, embedding + index reset to pending
    TextChanged,
    /// Same text hash, only metadata refreshed
    MetadataRefreshed,
}

/// Hash-idempotent upsert keyed by `vector_id` ("node:<nodeId>").
///
/// When the text hash matches the stored row, only `meta_payload` is
/// refreshed and the subtask states are left untouched.
pub async fn upsert(
    pool: &SqlitePool,
    node_id: i64,
    text_content: &str,
    meta_payload: Option<&str>,
) -> Result<UpsertOutcome, SqliteError> {
    let vector_id = format!("node:{node_id}");
    let text_hash = sha256_hex(text_content);
    let now = now_ms();

    let existing: Option<(i64, String)> =
        sqlx::query_as("SELECT id, text_hash FROM vector_documents WHERE vector_id = ?")
            .bind(&vector_id)
            .fetch_optional(pool)
            .await?;

    match existing {
        None => {
            sqlx::query(
                "INSERT INTO vector_documents \
                 (vector_id, ref_id, doc_type, text_content, text_hash, meta_payload, created_at, updated_at) \
                 VALUES (?, ?, 'node', ?, ?, ?, ?, ?)",
            )
            .bind(&vector_id)
            .bind(node_id)
            .bind(text_content)
            .bind(&text_hash)
            .bind(meta_payload)
            .bind(now)
            .bind(now)
            .execute(pool)
            .await?;
            Ok(UpsertOutcome::Inserted)
        }
        Some((id, old_hash)) if old_hash == text_hash => {
            sqlx::query("UPDATE vector_documents SET meta_payload = ?, updated_at = ? WHERE id = ?")
                .bind(meta_payload)
                .bind(now)
                .bind(id)
                .execute(pool)
                .await?;
            Ok(UpsertOutcome::MetadataRefreshed)
        }
        Some((id, _)) => {
            sqlx::query(
                "UPDATE vector_documents SET text_content = ?, text_hash = ?, meta_payload = ?, \
                   embedding = NULL, \
                   embedding_status = 'pending', embedding_attempts = 0, embedding_next_run_at = NULL, \
                   index_status = 'pending', index_attempts = 0, index_next_run_at = NULL, \
                   updated_at = ? \
                 WHERE id = ?",
            )
            .bind(text_content)
            .bind(&text_hash)
            .bind(meta_payload)
            .bind(now)
            .bind(id)
            .execute(pool)
            .await?;
            Ok(UpsertOutcome::TextChanged)
        }
    }
}

pub async fn get(pool: &SqlitePool, id: i64) -> Result<Option<VectorDocumentRow>, SqliteError> {
    let row = sqlx::query_as("SELECT * FROM vector_documents WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

pub async fn get_by_node(
    pool: &SqlitePool,
    node_id: i64,
) -> Result<Option<VectorDocumentRow>, SqliteError> {
    let row = sqlx::query_as("SELECT * FROM vector_documents WHERE vector_id = ?")
        .bind(format!("node:{node_id}"))
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

/// Reverse lookup for ANN hits: map document ids back to node refs
pub async fn get_many(
    pool: &SqlitePool,
    ids: &[i64],
) -> Result<Vec<VectorDocumentRow>, SqliteError> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let placeholders = vec!["?"; ids.len()].join(",");
    let sql = format!("SELECT * FROM vector_documents WHERE id IN ({placeholders})");
    let mut query = sqlx::query_as::<_, VectorDocumentRow>(&sql);
    for id in ids {
        query = query.bind(id);
    }
    Ok(query.fetch_all(pool).await?)
}

// =============================================================================
// Embedding subtask
// =============================================================================

pub async fn scan_embedding_due(
    pool: &SqlitePool,
    now: i64,
    limit: i64,
) -> Result<Vec<VectorDocumentRow>, SqliteError> {
    let rows = sqlx::query_as(
        "SELECT * FROM vector_documents \
         WHERE embedding_status IN ('pending', 'failed') \
           AND (embedding_next_run_at IS NULL OR embedding_next_run_at <= ?) \
           AND embedding_attempts < ? \
         ORDER BY id \
         LIMIT ?",
    )
    .bind(now)
    .bind(MAX_ATTEMPTS)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn claim_embedding(
    pool: &SqlitePool,
    id: i64,
    attempts: i64,
) -> Result<bool, SqliteError> {
    let result = sqlx::query(
        "UPDATE vector_documents SET embedding_status = 'running', \
           embedding_attempts = embedding_attempts + 1, embedding_next_run_at = NULL, updated_at = ? \
         WHERE id = ? AND embedding_status IN ('pending', 'failed') AND embedding_attempts = ?",
    )
    .bind(now_ms())
    .bind(id)
    .bind(attempts)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Embedding succeeded: store the little-endian f32 blob (refreshed text
/// from the current node fields) and enqueue indexing.
pub async fn mark_embedding_succeeded(
    pool: &SqlitePool,
    id: i64,
    text_content: &str,
    embedding: &[u8],
) -> Result<(), SqliteError> {
    sqlx::query(
        "UPDATE vector_documents SET embedding_status = 'succeeded', embedding_next_run_at = NULL, \
           text_content = ?, text_hash = ?, embedding = ?, \
           index_status = 'pending', index_attempts = 0, index_next_run_at = NULL, updated_at = ? \
         WHERE id = ?",
    )
    .bind(text_content)
    .bind(sha256_hex(text_content))
    .bind(embedding)
    .bind(now_ms())
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn mark_embedding_failed(
    pool: &SqlitePool,
    id: i64,
    attempts: i64,
) -> Result<(), SqliteError> {
    let now = now_ms();
    if attempts_exhausted(attempts) {
        sqlx::query(
            "UPDATE vector_documents SET embedding_status = 'failed_permanent', \
               embedding_next_run_at = NULL, updated_at = ? WHERE id = ?",
        )
        .bind(now)
        .bind(id)
        .execute(pool)
        .await?;
    } else {
        sqlx::query(
            "UPDATE vector_documents SET embedding_status = 'failed', embedding_next_run_at = ?, \
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

// =============================================================================
// Index subtask
// =============================================================================

/// Due index rows. The embedding precondition is part of the scan, so the
/// ordering invariant holds by construction.
pub async fn scan_index_due(
    pool: &SqlitePool,
    now: i64,
    limit: i64,
) -> Result<Vec<VectorDocumentRow>, SqliteError> {
    let rows = sqlx::query_as(
        "SELECT * FROM vector_documents \
         WHERE embedding_status = 'succeeded' \
           AND index_status IN ('pending', 'failed') \
           AND (index_next_run_at IS NULL OR index_next_run_at <= ?) \
           AND index_attempts < ? \
         ORDER BY id \
         LIMIT ?",
    )
    .bind(now)
    .bind(MAX_ATTEMPTS)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn claim_index(pool: &SqlitePool, id: i64, attempts: i64) -> Result<bool, SqliteError> {
    let result = sqlx::query(
        "UPDATE vector_documents SET index_status = 'running', \
           index_attempts = index_attempts + 1, index_next_run_at = NULL, updated_at = ? \
         WHERE id = ? AND index_status IN ('pending', 'failed') AND index_attempts = ? \
           AND embedding_status = 'succeeded'",
    )
    .bind(now_ms())
    .bind(id)
    .bind(attempts)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn mark_index_succeeded(pool: &SqlitePool, id: i64) -> Result<(), SqliteError> {
    sqlx::query(
        "UPDATE vector_documents SET index_status = 'succeeded', index_next_run_at = NULL, updated_at = ? \
         WHERE id = ?",
    )
    .bind(now_ms())
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn mark_index_failed(
    pool: &SqlitePool,
    id: i64,
    attempts: i64,
) -> Result<(), SqliteError> {
    let now = now_ms();
    if attempts_exhausted(attempts) {
        sqlx::query(
            "UPDATE vector_documents SET index_status = 'failed_permanent', \
               index_next_run_at = NULL, updated_at = ? WHERE id = ?",
        )
        .bind(now)
        .bind(id)
        .execute(pool)
        .await?;
    } else {
        sqlx::query(
            "UPDATE vector_documents SET index_status = 'failed', index_next_run_at = ?, \
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

// =============================================================================
// Recovery and scheduling
// =============================================================================

pub async fn recover_stale(pool: &SqlitePool, stale_before: i64) -> Result<u64, SqliteError> {
    let now = now_ms();
    let embed = sqlx::query(
        "UPDATE vector_documents SET embedding_status = 'pending', embedding_next_run_at = NULL, updated_at = ? \
         WHERE embedding_status = 'running' AND updated_at < ?",
    )
    .bind(now)
    .bind(stale_before)
    .execute(pool)
    .await?;
    let index = sqlx::query(
        "UPDATE vector_documents SET index_status = 'pending', index_next_run_at = NULL, updated_at = ? \
         WHERE index_status = 'running' AND updated_at < ?",
    )
    .bind(now)
    .bind(stale_before)
    .execute(pool)
    .await?;
    Ok(embed.rows_affected() + index.rows_affected())
}

pub async fn next_wake(pool: &SqlitePool, now: i64) -> Result<Option<i64>, SqliteError> {
    let embed: Option<i64> = sqlx::query_scalar(
        "SELECT MIN(COALESCE(embedding_next_run_at, ?)) FROM vector_documents \
         WHERE embedding_status IN ('pending', 'failed') AND embedding_attempts < ?",
    )
    .bind(now)
    .bind(MAX_ATTEMPTS)
    .fetch_one(pool)
    .await?;
    let index: Option<i64> = sqlx::query_scalar(
        "SELECT MIN(COALESCE(index_next_run_at, ?)) FROM vector_documents \
         WHERE embedding_status = 'succeeded' AND index_status IN ('pending', 'failed') \
           AND index_attempts < ?",
    )
    .bind(now)
    .bind(MAX_ATTEMPTS)
    .fetch_one(pool)
    .await?;
    Ok(match (embed, index) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    })
}

pub async fn count_embedding_pending(pool: &SqlitePool) -> Result<i64, SqliteError> {
    let count = sqlx::query_scalar(
        "SELECT COUNT(*) FROM vector_documents WHERE embedding_status IN ('pending', 'failed')",
    )
    .fetch_one(pool)
    .await?;
    Ok(count)
}

pub async fn count_index_pending(pool: &SqlitePool) -> Result<i64, SqliteError> {
    let count = sqlx::query_scalar(
        "SELECT COUNT(*) FROM vector_documents \
         WHERE embedding_status = 'succeeded' AND index_status IN ('pending', 'failed')",
    )
    .fetch_one(pool)
    .await?;
    Ok(count)
}
