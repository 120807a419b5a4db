//! Settings repository (singleton row)

use sqlx::SqlitePool;

use crate::data::sqlite::SqliteError;
use crate::data::types::SettingsRow;
use crate::utils::time::now_ms;

pub async fn get(pool: &SqlitePool) -> Result<SettingsRow, SqliteError> {
    let row = sqlx::query_as("SELECT * FROM settings WHERE id = 1")
        .fetch_optional(pool)
        .await?;
    row.ok_or_else(|| SqliteError::NotFound("settings singleton".to_string()))
}

pub async fn set_pinned_thread(
    pool: &SqlitePool,
    thread_id: Option<&str>,
) -> Result<(), SqliteError> {
    sqlx::query("UPDATE settings SET pinned_thread_id = ?, updated_at = ? WHERE id = 1")
        .bind(thread_id)
        .bind(now_ms())
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn set_capture_enabled(pool: &SqlitePool, enabled: bool) -> Result<(), SqliteError> {
    sqlx::query("UPDATE settings SET capture_enabled = ?, updated_at = ? WHERE id = 1")
        .bind(enabled)
        .bind(now_ms())
        .execute(pool)
        .await?;
    Ok(())
}

/// Mirror the live capture tuning for observability
pub async fn set_capture_tuning(
    pool: &SqlitePool,
    interval_multiplier: f64,
    phash_threshold: u32,
) -> Result<(), SqliteError> {
    sqlx::query(
        "UPDATE settings SET interval_multiplier = ?, phash_threshold = ?, updated_at = ? WHERE id = 1",
    )
    .bind(interval_multiplier)
    .bind(phash_threshold)
    .bind(now_ms())
    .execute(pool)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::sqlite::SqliteService;

    #[tokio::test]
    async fn test_singleton_exists_after_migration() {
        let db = SqliteService::init_in_memory().await.unwrap();
        let row = get(db.pool()).await.unwrap();
        assert!(row.capture_enabled);
        assert!(row.pinned_thread_id.is_none());
    }

    #[tokio::test]
    async fn test_pin_and_unpin() {
        let db = SqliteService::init_in_memory().await.unwrap();
        set_pinned_thread(db.pool(), Some("thr_a")).await.unwrap();
        assert_eq!(
            get(db.pool()).await.unwrap().pinned_thread_id.as_deref(),
            Some("thr_a")
        );
        set_pinned_thread(db.pool(), None).await.unwrap();
        assert!(get(db.pool()).await.unwrap().pinned_thread_id.is_none());
    }

    #[tokio::test]
    async fn test_capture_tuning_mirror() {
        let db = SqliteService::init_in_memory().await.unwrap();
        set_capture_tuning(db.pool(), 2.5, 6).await.unwrap();
        let row = get(db.pool()).await.unwrap();
        assert_eq!(row.interval_multiplier, 2.5);
        assert_eq!(row.phash_threshold, 6);
    }
}
