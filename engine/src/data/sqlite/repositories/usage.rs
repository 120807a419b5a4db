//! Usage event repository (append-only)

use serde::Serialize;
use sqlx::SqlitePool;

use crate::data::sqlite::SqliteError;
use crate::data::types::UsageEventRow;

/// Insert payload for one AI call's usage
#[derive(Debug, Clone)]
pub struct NewUsageEvent {
    pub at_ms: i64,
    pub capability: String,
    pub operation: String,
    pub model: String,
    pub provider: Option<String>,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub status: String,
    pub error_code: Option<String>,
}

pub async fn record(pool: &SqlitePool, event: &NewUsageEvent) -> Result<(), SqliteError> {
    sqlx::query(
        "INSERT INTO usage_events \
         (at_ms, capability, operation, model, provider, input_tokens, output_tokens, status, error_code) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(event.at_ms)
    .bind(&event.capability)
    .bind(&event.operation)
    .bind(&event.model)
    .bind(&event.provider)
    .bind(event.input_tokens)
    .bind(event.output_tokens)
    .bind(&event.status)
    .bind(&event.error_code)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn query_range(
    pool: &SqlitePool,
    from: i64,
    to: i64,
    limit: i64,
) -> Result<Vec<UsageEventRow>, SqliteError> {
    let rows = sqlx::query_as(
        "SELECT * FROM usage_events WHERE at_ms >= ? AND at_ms < ? ORDER BY at_ms DESC LIMIT ?",
    )
    .bind(from)
    .bind(to)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Per-capability aggregate over a time range
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct UsageBreakdown {
    pub capability: String,
    pub calls: i64,
    pub failures: i64,
    pub input_tokens: i64,
    pub output_tokens: i64,
}

pub async fn breakdown(
    pool: &SqlitePool,
    from: i64,
    to: i64,
) -> Result<Vec<UsageBreakdown>, SqliteError> {
    let rows = sqlx::query_as(
        "SELECT capability, \
                COUNT(*) as calls, \
                SUM(CASE WHEN status != 'succeeded' THEN 1 ELSE 0 END) as failures, \
                COALESCE(SUM(input_tokens), 0) as input_tokens, \
                COALESCE(SUM(output_tokens), 0) as output_tokens \
         FROM usage_events WHERE at_ms >= ? AND at_ms < ? \
         GROUP BY capability ORDER BY capability",
    )
    .bind(from)
    .bind(to)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::sqlite::SqliteService;

    fn usage(capability: &str, at: i64, status: &str) -> NewUsageEvent {
        NewUsageEvent {
            at_ms: at,
            capability: capability.to_string(),
            operation: "batch".to_string(),
            model: "test-model".to_string(),
            provider: Some("local".to_string()),
            input_tokens: 100,
            output_tokens: 50,
            status: status.to_string(),
            error_code: None,
        }
    }

    #[tokio::test]
    async fn test_record_and_query_range() {
        let db = SqliteService::init_in_memory().await.unwrap();
        record(db.pool(), &usage("vlm", 100, "succeeded")).await.unwrap();
        record(db.pool(), &usage("vlm", 200, "failed")).await.unwrap();
        record(db.pool(), &usage("text", 300, "succeeded")).await.unwrap();

        let rows = query_range(db.pool(), 0, 250, 100).await.unwrap();
        assert_eq!(rows.len(), 2);
        // Newest first
        assert_eq!(rows[0].at_ms, 200);
    }

    #[tokio::test]
    async fn test_breakdown_aggregates() {
        let db = SqliteService::init_in_memory().await.unwrap();
        record(db.pool(), &usage("vlm", 100, "succeeded")).await.unwrap();
        record(db.pool(), &usage("vlm", 200, "failed")).await.unwrap();
        record(db.pool(), &usage("embedding", 300, "succeeded"))
            .await
            .unwrap();

        let rows = breakdown(db.pool(), 0, 1000).await.unwrap();
        assert_eq!(rows.len(), 2);
        let vlm = rows.iter().find(|r| r.capability == "vlm").unwrap();
        assert_eq!(vlm.calls, 2);
        assert_eq!(vlm.failures, 1);
        assert_eq!(vlm.input_tokens, 200);
    }
}
