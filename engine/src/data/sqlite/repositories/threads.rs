//! Thread repository

use sqlx::SqlitePool;

use crate::data::sqlite::SqliteError;
use crate::data::types::ThreadRow;
use crate::utils::time::now_ms;

/// Create a new thread with a generated CUID2 id
pub async fn create(
    pool: &SqlitePool,
    title: &str,
    summary: Option<&str>,
    start_time: i64,
) -> Result<String, SqliteError> {
    let id = cuid2::create_id();
    let now = now_ms();
    sqlx::query(
        "INSERT INTO threads (id, title, summary, start_time, last_active_at, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(title)
    .bind(summary)
    .bind(start_time)
    .bind(start_time)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(id)
}

pub async fn get(pool: &SqlitePool, id: &str) -> Result<Option<ThreadRow>, SqliteError> {
    let row = sqlx::query_as("SELECT * FROM threads WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

/// All threads, most recently active first
pub async fn list(pool: &SqlitePool, limit: i64) -> Result<Vec<ThreadRow>, SqliteError> {
    let rows = sqlx::query_as("SELECT * FROM threads ORDER BY last_active_at DESC LIMIT ?")
        .bind(limit)
        .fetch_all(pool)
        .await?;
    Ok(rows)
}

/// Active threads, most recently active first (thread-LLM context)
pub async fn active_recent(pool: &SqlitePool, limit: i64) -> Result<Vec<ThreadRow>, SqliteError> {
    let rows = sqlx::query_as(
        "SELECT * FROM threads WHERE status = 'active' ORDER BY last_active_at DESC LIMIT ?",
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Threads active inside a time range (their activity span intersects it)
pub async fn active_in_range(
    pool: &SqlitePool,
    from: i64,
    to: i64,
) -> Result<Vec<ThreadRow>, SqliteError> {
    let rows = sqlx::query_as(
        "SELECT * FROM threads WHERE start_time < ? AND last_active_at >= ? \
         ORDER BY last_active_at DESC",
    )
    .bind(to)
    .bind(from)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Bump activity bookkeeping when nodes land on a thread
pub async fn touch_activity(
    pool: &SqlitePool,
    id: &str,
    event_time: i64,
    new_nodes: i64,
) -> Result<(), SqliteError> {
    sqlx::query(
        "UPDATE threads SET \
           last_active_at = MAX(last_active_at, ?), \
           duration_ms = MAX(last_active_at, ?) - start_time, \
           node_count = node_count + ?, \
           updated_at = ? \
         WHERE id = ?",
    )
    .bind(event_time)
    .bind(event_time)
    .bind(new_nodes)
    .bind(now_ms())
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Metadata the thread LLM may revise on existing threads
#[derive(Debug, Clone, Default)]
pub struct ThreadMetadataPatch {
    pub current_phase: Option<String>,
    pub current_focus: Option<String>,
    pub main_project: Option<String>,
    pub key_entities: Option<Vec<String>>,
    pub milestones: Option<Vec<String>>,
    pub apps: Option<Vec<String>>,
}

pub async fn update_metadata(
    pool: &SqlitePool,
    id: &str,
    patch: &ThreadMetadataPatch,
) -> Result<(), SqliteError> {
    let key_entities = patch
        .key_entities
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    let milestones = patch
        .milestones
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    let apps = patch.apps.as_ref().map(serde_json::to_string).transpose()?;
    sqlx::query(
        "UPDATE threads SET \
           current_phase = COALESCE(?, current_phase), \
           current_focus = COALESCE(?, current_focus), \
           main_project = COALESCE(?, main_project), \
           key_entities = COALESCE(?, key_entities), \
           milestones = COALESCE(?, milestones), \
           apps = COALESCE(?, apps), \
           updated_at = ? \
         WHERE id = ?",
    )
    .bind(&patch.current_phase)
    .bind(&patch.current_focus)
    .bind(&patch.main_project)
    .bind(key_entities)
    .bind(milestones)
    .bind(apps)
    .bind(now_ms())
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn mark_inactive(pool: &SqlitePool, id: &str) -> Result<bool, SqliteError> {
    let result = sqlx::query(
        "UPDATE threads SET status = 'inactive', updated_at = ? WHERE id = ? AND status = 'active'",
    )
    .bind(now_ms())
    .bind(id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn count_in_range(pool: &SqlitePool, from: i64, to: i64) -> Result<i64, SqliteError> {
    let count = sqlx::query_scalar(
        "SELECT COUNT(DISTINCT thread_id) FROM context_nodes \
         WHERE thread_id IS NOT NULL AND event_time >= ? AND event_time < ?",
    )
    .bind(from)
    .bind(to)
    .fetch_one(pool)
    .await?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::sqlite::SqliteService;
    use crate::data::types::ThreadStatus;

    #[tokio::test]
    async fn test_create_and_get() {
        let db = SqliteService::init_in_memory().await.unwrap();
        let id = create(db.pool(), "Parser work", None, 1000).await.unwrap();
        let row = get(db.pool(), &id).await.unwrap().unwrap();
        assert_eq!(row.title, "Parser work");
        assert_eq!(row.status, ThreadStatus::Active);
        assert_eq!(row.start_time, 1000);
        assert_eq!(row.last_active_at, 1000);
    }

    #[tokio::test]
    async fn test_touch_activity_extends_duration() {
        let db = SqliteService::init_in_memory().await.unwrap();
        let id = create(db.pool(), "t", None, 1000).await.unwrap();
        touch_activity(db.pool(), &id, 31_000, 3).await.unwrap();
        let row = get(db.pool(), &id).await.unwrap().unwrap();
        assert_eq!(row.last_active_at, 31_000);
        assert_eq!(row.duration_ms, 30_000);
        assert_eq!(row.node_count, 3);

        // Out-of-order events never move activity backwards
        touch_activity(db.pool(), &id, 20_000, 1).await.unwrap();
        let row = get(db.pool(), &id).await.unwrap().unwrap();
        assert_eq!(row.last_active_at, 31_000);
        assert_eq!(row.node_count, 4);
    }

    #[tokio::test]
    async fn test_mark_inactive_once() {
        let db = SqliteService::init_in_memory().await.unwrap();
        let id = create(db.pool(), "t", None, 0).await.unwrap();
        assert!(mark_inactive(db.pool(), &id).await.unwrap());
        assert!(!mark_inactive(db.pool(), &id).await.unwrap());
    }

    #[tokio::test]
    async fn test_update_metadata_partial() {
        let db = SqliteService::init_in_memory().await.unwrap();
        let id = create(db.pool(), "t", None, 0).await.unwrap();
        update_metadata(
            db.pool(),
            &id,
            &ThreadMetadataPatch {
                current_phase: Some("refactor".to_string()),
                key_entities: Some(vec!["lexer.rs".to_string()]),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let row = get(db.pool(), &id).await.unwrap().unwrap();
        assert_eq!(row.current_phase.as_deref(), Some("refactor"));
        assert_eq!(row.key_entities.as_deref(), Some(r#"["lexer.rs"]"#));
        assert!(row.current_focus.is_none());
    }
}
