//! Context node repository
//!
//! Nodes carry two pieces of pipeline state: the merge task family
//! (`merge_*`) and the write-once `thread_id` assignment.

use sqlx::SqlitePool;

use super::{attempts_exhausted, backoff_delay_ms};
use crate::core::constants::MAX_ATTEMPTS;
use crate::data::sqlite::SqliteError;
use crate::data::types::{ContextNodeRow, NodeKind};
use crate::utils::time::now_ms;

/// Insert payload for a node expanded from a VLM segment
#[derive(Debug, Clone)]
pub struct NewNode {
    pub batch_id: String,
    pub kind: NodeKind,
    pub event_time: i64,
    pub title: String,
    pub summary: String,
    pub keywords: Vec<String>,
    pub entities: Vec<String>,
    pub knowledge_payload: Option<String>,
    pub state_payload: Option<String>,
    pub action_items: Vec<String>,
    pub importance: f64,
    pub confidence: f64,
    pub screenshot_ids: Vec<i64>,
    /// Pre-assigned thread from a VLM merge hint, when present
    pub thread_id: Option<String>,
}

pub async fn insert(pool: &SqlitePool, node: &NewNode) -> Result<i64, SqliteError> {
    let now = now_ms();
    let result = sqlx::query(
        "INSERT INTO context_nodes \
         (batch_id, kind, thread_id, event_time, title, summary, keywords, entities, \
          knowledge_payload, state_payload, action_items, importance, confidence, \
          screenshot_ids, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&node.batch_id)
    .bind(node.kind)
    .bind(&node.thread_id)
    .bind(node.event_time)
    .bind(&node.title)
    .bind(&node.summary)
    .bind(serde_json::to_string(&node.keywords)?)
    .bind(serde_json::to_string(&node.entities)?)
    .bind(&node.knowledge_payload)
    .bind(&node.state_payload)
    .bind(serde_json::to_string(&node.action_items)?)
    .bind(node.importance)
    .bind(node.confidence)
    .bind(serde_json::to_string(&node.screenshot_ids)?)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(result.last_insert_rowid())
}

pub async fn get(pool: &SqlitePool, id: i64) -> Result<Option<ContextNodeRow>, SqliteError> {
    let row = sqlx::query_as("SELECT * FROM context_nodes WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

pub async fn get_many(pool: &SqlitePool, ids: &[i64]) -> Result<Vec<ContextNodeRow>, SqliteError> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let placeholders = vec!["?"; ids.len()].join(",");
    let sql =
        format!("SELECT * FROM context_nodes WHERE id IN ({placeholders}) ORDER BY event_time");
    let mut query = sqlx::query_as::<_, ContextNodeRow>(&sql);
    for id in ids {
        query = query.bind(id);
    }
    Ok(query.fetch_all(pool).await?)
}

pub async fn for_batch(
    pool: &SqlitePool,
    batch_id: &str,
) -> Result<Vec<ContextNodeRow>, SqliteError> {
    let rows =
        sqlx::query_as("SELECT * FROM context_nodes WHERE batch_id = ? ORDER BY event_time")
            .bind(batch_id)
            .fetch_all(pool)
            .await?;
    Ok(rows)
}

/// Nodes whose event time falls inside `[from, to)`
pub async fn in_window(
    pool: &SqlitePool,
    from: i64,
    to: i64,
) -> Result<Vec<ContextNodeRow>, SqliteError> {
    let rows = sqlx::query_as(
        "SELECT * FROM context_nodes WHERE event_time >= ? AND event_time < ? ORDER BY event_time",
    )
    .bind(from)
    .bind(to)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Most recent nodes of a thread, newest first
pub async fn recent_for_thread(
    pool: &SqlitePool,
    thread_id: &str,
    limit: i64,
) -> Result<Vec<ContextNodeRow>, SqliteError> {
    let rows = sqlx::query_as(
        "SELECT * FROM context_nodes WHERE thread_id = ? ORDER BY event_time DESC LIMIT ?",
    )
    .bind(thread_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

// =============================================================================
// Thread assignment (write-once)
// =============================================================================

/// Write-once thread assignment. Returns false if the node already had a
/// thread, which retries must never overwrite.
pub async fn assign_thread(
    pool: &SqlitePool,
    node_id: i64,
    thread_id: &str,
) -> Result<bool, SqliteError> {
    let result = sqlx::query(
        "UPDATE context_nodes SET thread_id = ?, updated_at = ? \
         WHERE id = ? AND thread_id IS NULL",
    )
    .bind(thread_id)
    .bind(now_ms())
    .bind(node_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Batches that still have unassigned nodes, oldest first
pub async fn batches_with_unassigned(
    pool: &SqlitePool,
    limit: i64,
) -> Result<Vec<String>, SqliteError> {
    let ids = sqlx::query_scalar(
        "SELECT batch_id FROM context_nodes WHERE thread_id IS NULL \
         GROUP BY batch_id ORDER BY MIN(event_time) LIMIT ?",
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(ids)
}

// =============================================================================
// Merge task family
// =============================================================================

/// Due merge rows. Only nodes with an assigned thread are merge candidates;
/// unassigned nodes wait for the thread assigner.
pub async fn scan_merge_due(
    pool: &SqlitePool,
    now: i64,
    limit: i64,
) -> Result<Vec<ContextNodeRow>, SqliteError> {
    let rows = sqlx::query_as(
        "SELECT * FROM context_nodes \
         WHERE merge_status IN ('pending', 'failed') \
           AND thread_id IS NOT NULL \
           AND (merge_next_run_at IS NULL OR merge_next_run_at <= ?) \
           AND merge_attempts < ? \
         ORDER BY event_time \
         LIMIT ?",
    )
    .bind(now)
    .bind(MAX_ATTEMPTS)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn claim_merge(pool: &SqlitePool, id: i64, attempts: i64) -> Result<bool, SqliteError> {
    let result = sqlx::query(
        "UPDATE context_nodes SET merge_status = 'running', merge_attempts = merge_attempts + 1, \
           merge_next_run_at = NULL, updated_at = ? \
         WHERE id = ? AND merge_status IN ('pending', 'failed') AND merge_attempts = ?",
    )
    .bind(now_ms())
    .bind(id)
    .bind(attempts)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn mark_merge_succeeded(pool: &SqlitePool, id: i64) -> Result<(), SqliteError> {
    sqlx::query(
        "UPDATE context_nodes SET merge_status = 'succeeded', merge_next_run_at = NULL, updated_at = ? \
         WHERE id = ?",
    )
    .bind(now_ms())
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn mark_merge_failed(
    pool: &SqlitePool,
    id: i64,
    attempts: i64,
) -> Result<(), SqliteError> {
    let now = now_ms();
    if attempts_exhausted(attempts) {
        sqlx::query(
            "UPDATE context_nodes SET merge_status = 'failed_permanent', merge_next_run_at = NULL, updated_at = ? \
             WHERE id = ?",
        )
        .bind(now)
        .bind(id)
        .execute(pool)
        .await?;
    } else {
        sqlx::query(
            "UPDATE context_nodes SET merge_status = 'failed', merge_next_run_at = ?, updated_at = ? \
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

pub async fn recover_stale_merge(pool: &SqlitePool, stale_before: i64) -> Result<u64, SqliteError> {
    let result = sqlx::query(
        "UPDATE context_nodes SET merge_status = 'pending', merge_next_run_at = NULL, updated_at = ? \
         WHERE merge_status = 'running' AND updated_at < ?",
    )
    .bind(now_ms())
    .bind(stale_before)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

pub async fn next_wake_merge(pool: &SqlitePool, now: i64) -> Result<Option<i64>, SqliteError> {
    let wake: Option<i64> = sqlx::query_scalar(
        "SELECT MIN(COALESCE(merge_next_run_at, ?)) FROM context_nodes \
         WHERE merge_status IN ('pending', 'failed') AND thread_id IS NOT NULL \
           AND merge_attempts < ?",
    )
    .bind(now)
    .bind(MAX_ATTEMPTS)
    .fetch_one(pool)
    .await?;
    Ok(wake)
}

/// The most recent merge target: a succeeded node in the same thread with
/// the same kind, excluding the source itself.
pub async fn latest_merge_target(
    pool: &SqlitePool,
    thread_id: &str,
    kind: NodeKind,
    exclude_id: i64,
) -> Result<Option<ContextNodeRow>, SqliteError> {
    let row = sqlx::query_as(
        "SELECT * FROM context_nodes \
         WHERE thread_id = ? AND kind = ? AND merge_status = 'succeeded' AND id != ? \
         ORDER BY event_time DESC LIMIT 1",
    )
    .bind(thread_id)
    .bind(kind)
    .bind(exclude_id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// Fields the merge LLM may revise on the surviving target node
#[derive(Debug, Clone)]
pub struct MergePatch {
    pub title: String,
    pub summary: String,
    pub keywords: Vec<String>,
    pub entities: Vec<String>,
    pub importance: f64,
    pub confidence: f64,
}

/// Absorb `source` into `target` in one transaction:
/// revise target fields, union the screenshot link set, append the source
/// id to `merged_from_ids`, and mark the source's merge done.
pub async fn apply_absorb(
    pool: &SqlitePool,
    target: &ContextNodeRow,
    source: &ContextNodeRow,
    patch: &MergePatch,
) -> Result<(), SqliteError> {
    let now = now_ms();

    let mut shot_ids = target.shot_ids();
    for id in source.shot_ids() {
        if !shot_ids.contains(&id) {
            shot_ids.push(id);
        }
    }

    let mut merged_from = target.merged_from();
    if !merged_from.contains(&source.id) {
        merged_from.push(source.id);
    }

    let mut tx = pool.begin().await?;

    sqlx::query(
        "UPDATE context_nodes SET title = ?, summary = ?, keywords = ?, entities = ?, \
           importance = ?, confidence = ?, screenshot_ids = ?, merged_from_ids = ?, updated_at = ? \
         WHERE id = ?",
    )
    .bind(&patch.title)
    .bind(&patch.summary)
    .bind(serde_json::to_string(&patch.keywords)?)
    .bind(serde_json::to_string(&patch.entities)?)
    .bind(patch.importance)
    .bind(patch.confidence)
    .bind(serde_json::to_string(&shot_ids)?)
    .bind(serde_json::to_string(&merged_from)?)
    .bind(now)
    .bind(target.id)
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        "UPDATE context_nodes SET merge_status = 'succeeded', merge_next_run_at = NULL, updated_at = ? \
         WHERE id = ?",
    )
    .bind(now)
    .bind(source.id)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}

// =============================================================================
// Entity mentions
// =============================================================================

/// Record entity mentions for an event node (idempotent per entity/node pair)
pub async fn sync_mentions(
    pool: &SqlitePool,
    node_id: i64,
    entities: &[String],
    at_ms: i64,
) -> Result<(), SqliteError> {
    for entity in entities {
        sqlx::query(
            "INSERT OR IGNORE INTO entity_mentions (entity, node_id, at_ms) VALUES (?, ?, ?)",
        )
        .bind(entity)
        .bind(node_id)
        .bind(at_ms)
        .execute(pool)
        .await?;
    }
    Ok(())
}

/// Top mentioned entities within a time range
pub async fn top_entities(
    pool: &SqlitePool,
    from: i64,
    to: i64,
    limit: i64,
) -> Result<Vec<(String, i64)>, SqliteError> {
    let rows: Vec<(String, i64)> = sqlx::query_as(
        "SELECT entity, COUNT(*) as mentions FROM entity_mentions \
         WHERE at_ms >= ? AND at_ms < ? \
         GROUP BY entity ORDER BY mentions DESC LIMIT ?",
    )
    .bind(from)
    .bind(to)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

// =============================================================================
// Queue metrics
// =============================================================================

pub async fn count_merge_pending(pool: &SqlitePool) -> Result<i64, SqliteError> {
    let count = sqlx::query_scalar(
        "SELECT COUNT(*) FROM context_nodes WHERE merge_status IN ('pending', 'failed')",
    )
    .fetch_one(pool)
    .await?;
    Ok(count)
}

/// Test fixture: a minimal node insert payload
#[cfg(test)]
pub(crate) fn test_node(batch_id: &str, kind: NodeKind, event_time: i64) -> NewNode {
    NewNode {
        batch_id: batch_id.to_string(),
        kind,
        event_time,
        title: "Editing parser".to_string(),
        summary: "Working on the tokenizer".to_string(),
        keywords: vec!["parser".to_string()],
        entities: vec!["tokenizer.rs".to_string()],
        knowledge_payload: None,
        state_payload: None,
        action_items: vec![],
        importance: 0.6,
        confidence: 0.8,
        screenshot_ids: vec![1],
        thread_id: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::sqlite::SqliteService;
    use crate::data::types::TaskStatus;

    use super::test_node as node;

    #[tokio::test]
    async fn test_thread_assignment_is_write_once() {
        let db = SqliteService::init_in_memory().await.unwrap();
        let id = insert(db.pool(), &node("b1", NodeKind::Event, 100))
            .await
            .unwrap();

        assert!(assign_thread(db.pool(), id, "thr_a").await.unwrap());
        // A second assignment never overwrites
        assert!(!assign_thread(db.pool(), id, "thr_b").await.unwrap());
        let row = get(db.pool(), id).await.unwrap().unwrap();
        assert_eq!(row.thread_id.as_deref(), Some("thr_a"));
    }

    #[tokio::test]
    async fn test_merge_scan_excludes_unassigned() {
        let db = SqliteService::init_in_memory().await.unwrap();
        let unassigned = insert(db.pool(), &node("b1", NodeKind::Event, 100))
            .await
            .unwrap();
        let assigned = insert(db.pool(), &node("b1", NodeKind::Event, 200))
            .await
            .unwrap();
        assign_thread(db.pool(), assigned, "thr_a").await.unwrap();

        let due = scan_merge_due(db.pool(), now_ms(), 10).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, assigned);

        let batches = batches_with_unassigned(db.pool(), 10).await.unwrap();
        assert_eq!(batches, vec!["b1".to_string()]);
        let _ = unassigned;
    }

    #[tokio::test]
    async fn test_merge_claim_contention() {
        let db = SqliteService::init_in_memory().await.unwrap();
        let id = insert(db.pool(), &node("b1", NodeKind::Event, 100))
            .await
            .unwrap();
        assign_thread(db.pool(), id, "thr_a").await.unwrap();

        assert!(claim_merge(db.pool(), id, 0).await.unwrap());
        assert!(!claim_merge(db.pool(), id, 0).await.unwrap());
    }

    #[tokio::test]
    async fn test_latest_merge_target_picks_same_kind_succeeded() {
        let db = SqliteService::init_in_memory().await.unwrap();
        let older = insert(db.pool(), &node("b1", NodeKind::Event, 100))
            .await
            .unwrap();
        let other_kind = insert(db.pool(), &node("b1", NodeKind::Knowledge, 150))
            .await
            .unwrap();
        let source = insert(db.pool(), &node("b2", NodeKind::Event, 200))
            .await
            .unwrap();
        for id in [older, other_kind, source] {
            assign_thread(db.pool(), id, "thr_a").await.unwrap();
        }
        mark_merge_succeeded(db.pool(), older).await.unwrap();
        mark_merge_succeeded(db.pool(), other_kind).await.unwrap();

        let target = latest_merge_target(db.pool(), "thr_a", NodeKind::Event, source)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(target.id, older);
    }

    #[tokio::test]
    async fn test_apply_absorb_unions_links_and_marks_source() {
        let db = SqliteService::init_in_memory().await.unwrap();
        let target_id = insert(db.pool(), &node("b1", NodeKind::Event, 100))
            .await
            .unwrap();
        let mut source_spec = node("b2", NodeKind::Event, 200);
        source_spec.screenshot_ids = vec![1, 7];
        let source_id = insert(db.pool(), &source_spec).await.unwrap();
        assign_thread(db.pool(), target_id, "thr_a").await.unwrap();
        assign_thread(db.pool(), source_id, "thr_a").await.unwrap();
        mark_merge_succeeded(db.pool(), target_id).await.unwrap();

        let target = get(db.pool(), target_id).await.unwrap().unwrap();
        let source = get(db.pool(), source_id).await.unwrap().unwrap();
        let patch = MergePatch {
            title: "Editing parser".to_string(),
            summary: "Extended session on the tokenizer".to_string(),
            keywords: vec!["parser".to_string(), "tokenizer".to_string()],
            entities: vec!["tokenizer.rs".to_string()],
            importance: 0.7,
            confidence: 0.85,
        };
        apply_absorb(db.pool(), &target, &source, &patch)
            .await
            .unwrap();

        let target = get(db.pool(), target_id).await.unwrap().unwrap();
        assert_eq!(target.shot_ids(), vec![1, 7]);
        assert_eq!(target.merged_from(), vec![source_id]);
        assert_eq!(target.summary, "Extended session on the tokenizer");

        let source = get(db.pool(), source_id).await.unwrap().unwrap();
        assert_eq!(source.merge_status, TaskStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_merge_failure_escalates() {
        let db = SqliteService::init_in_memory().await.unwrap();
        let id = insert(db.pool(), &node("b1", NodeKind::Event, 100))
            .await
            .unwrap();
        assign_thread(db.pool(), id, "thr_a").await.unwrap();

        mark_merge_failed(db.pool(), id, 1).await.unwrap();
        let row = get(db.pool(), id).await.unwrap().unwrap();
        assert_eq!(row.merge_status, TaskStatus::Failed);
        assert!(row.merge_next_run_at.is_some());

        mark_merge_failed(db.pool(), id, MAX_ATTEMPTS).await.unwrap();
        let row = get(db.pool(), id).await.unwrap().unwrap();
        assert_eq!(row.merge_status, TaskStatus::FailedPermanent);
    }

    #[tokio::test]
    async fn test_sync_mentions_idempotent() {
        let db = SqliteService::init_in_memory().await.unwrap();
        let id = insert(db.pool(), &node("b1", NodeKind::Event, 100))
            .await
            .unwrap();
        let entities = vec!["tokenizer.rs".to_string()];
        sync_mentions(db.pool(), id, &entities, 100).await.unwrap();
        sync_mentions(db.pool(), id, &entities, 100).await.unwrap();

        let top = top_entities(db.pool(), 0, 1000, 10).await.unwrap();
        assert_eq!(top, vec![("tokenizer.rs".to_string(), 1)]);
    }
}
