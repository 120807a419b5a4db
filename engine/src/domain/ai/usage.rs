//! Usage recording
//!
//! Every AI call lands one append-only usage row and an `ai_request` bus
//! event; failures additionally publish `ai_error`. Range and breakdown
//! queries back the monitoring metrics stream.

use std::sync::Arc;

use crate::data::sqlite::SqliteService;
use crate::data::sqlite::repositories::usage::{self, NewUsageEvent, UsageBreakdown};
use crate::data::topics::{AiErrorEvent, AiRequestEvent, EventBus};
use crate::data::types::UsageEventRow;
use crate::utils::time::now_ms;

use super::providers::TokenUsage;
use super::runtime::Capability;
use super::AiError;

/// Records usage rows and publishes request/error events
pub struct UsageRecorder {
    db: Arc<SqliteService>,
    bus: Arc<EventBus>,
}

impl UsageRecorder {
    pub fn new(db: Arc<SqliteService>, bus: Arc<EventBus>) -> Self {
        Self { db, bus }
    }

    /// Record a successful call
    pub async fn success(
        &self,
        capability: Capability,
        operation: &str,
        model: &str,
        usage: TokenUsage,
        duration_ms: i64,
    ) {
        self.record(capability, operation, model, usage, "succeeded", None, duration_ms)
            .await;
    }

    /// Record a failed call
    pub async fn failure(
        &self,
        capability: Capability,
        operation: &str,
        model: &str,
        err: &AiError,
        duration_ms: i64,
    ) {
        let code = err.code();
        self.bus.publish_ai_error(AiErrorEvent {
            at_ms: now_ms(),
            capability: capability.as_str().to_string(),
            operation: operation.to_string(),
            code: code.clone(),
            message: err.to_string(),
        });
        self.record(
            capability,
            operation,
            model,
            TokenUsage::default(),
            "failed",
            Some(code),
            duration_ms,
        )
        .await;
    }

    #[allow(clippy::too_many_arguments)]
    async fn record(
        &self,
        capability: Capability,
        operation: &str,
        model: &str,
        usage: TokenUsage,
        status: &str,
        error_code: Option<String>,
        duration_ms: i64,
    ) {
        let at_ms = now_ms();
        self.bus.publish_ai_request(AiRequestEvent {
            at_ms,
            capability: capability.as_str().to_string(),
            operation: operation.to_string(),
            model: model.to_string(),
            status: status.to_string(),
            duration_ms,
        });

        let event = NewUsageEvent {
            at_ms,
            capability: capability.as_str().to_string(),
            operation: operation.to_string(),
            model: model.to_string(),
            provider: None,
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            status: status.to_string(),
            error_code,
        };
        if let Err(e) = usage::record(self.db.pool(), &event).await {
            // Usage is observability, never a pipeline failure
            tracing::warn!(error = %e, "Failed to record usage event");
        }
    }

    pub async fn query_range(&self, from: i64, to: i64, limit: i64) -> Vec<UsageEventRow> {
        usage::query_range(self.db.pool(), from, to, limit)
            .await
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Usage range query failed");
                Vec::new()
            })
    }

    pub async fn breakdown(&self, from: i64, to: i64) -> Vec<UsageBreakdown> {
        usage::breakdown(self.db.pool(), from, to)
            .await
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Usage breakdown query failed");
                Vec::new()
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_success_records_row_and_event() {
        let db = Arc::new(SqliteService::init_in_memory().await.unwrap());
        let bus = Arc::new(EventBus::new());
        let mut rx = bus.subscribe_ai_request();
        let recorder = UsageRecorder::new(Arc::clone(&db), Arc::clone(&bus));

        recorder
            .success(
                Capability::Vlm,
                "batch",
                "test-model",
                TokenUsage {
                    input_tokens: 10,
                    output_tokens: 5,
                },
                1234,
            )
            .await;

        let event = rx.recv().await.unwrap();
        assert_eq!(event.capability, "vlm");
        assert_eq!(event.status, "succeeded");

        let rows = recorder.query_range(0, now_ms() + 1, 10).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].input_tokens, 10);
    }

    #[tokio::test]
    async fn test_failure_publishes_ai_error() {
        let db = Arc::new(SqliteService::init_in_memory().await.unwrap());
        let bus = Arc::new(EventBus::new());
        let mut rx = bus.subscribe_ai_error();
        let recorder = UsageRecorder::new(Arc::clone(&db), Arc::clone(&bus));

        let err = AiError::provider("HTTP_500", "boom", true);
        recorder
            .failure(Capability::Text, "merge", "test-model", &err, 50)
            .await;

        let event = rx.recv().await.unwrap();
        assert_eq!(event.code, "HTTP_500");

        let breakdown = recorder.breakdown(0, now_ms() + 1).await;
        assert_eq!(breakdown.len(), 1);
        assert_eq!(breakdown[0].failures, 1);
    }
}
