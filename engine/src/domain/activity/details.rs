//! Lazy event details generation
//!
//! `details_text` for a long event is produced on first request: the
//! handler claims the row, gathers window-local plus recent thread-wide
//! nodes under item-count and character budgets, and persists the generated
//! markdown. Later requests return the cached text.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::core::constants::{DETAILS_CHAR_BUDGET, DETAILS_NODE_CAP, DETAILS_TIMEOUT_MS};
use crate::data::sqlite::SqliteService;
use crate::data::sqlite::repositories::{activity, nodes, threads};
use crate::data::topics::{AlertKind, EventBus};
use crate::data::types::{ActivityEventRow, ContextNodeRow, TaskStatus};
use crate::domain::ai::providers::TextProvider;
use crate::domain::ai::trace::TraceRecorder;
use crate::domain::ai::usage::UsageRecorder;
use crate::domain::ai::{AiError, AiRuntime, Capability};
use crate::domain::pipeline::PipelineError;

/// On-demand details generator
pub struct DetailsGenerator {
    db: Arc<SqliteService>,
    runtime: Arc<AiRuntime>,
    provider: Arc<dyn TextProvider>,
    usage: Arc<UsageRecorder>,
    traces: Arc<TraceRecorder>,
    bus: Arc<EventBus>,
}

impl DetailsGenerator {
    pub fn new(
        db: Arc<SqliteService>,
        runtime: Arc<AiRuntime>,
        provider: Arc<dyn TextProvider>,
        usage: Arc<UsageRecorder>,
        traces: Arc<TraceRecorder>,
        bus: Arc<EventBus>,
    ) -> Arc<Self> {
        Arc::new(Self {
            db,
            runtime,
            provider,
            usage,
            traces,
            bus,
        })
    }

    /// Return the event with details populated, generating them on first
    /// call. A concurrent request observes `running` and returns the row
    /// as-is for the client to poll.
    pub async fn get_or_generate(&self, event_id: i64) -> Result<ActivityEventRow, PipelineError> {
        let event = activity::get_event(self.db.pool(), event_id)
            .await?
            .ok_or_else(|| {
                crate::data::sqlite::SqliteError::NotFound(format!("event {event_id}"))
            })?;

        match event.details_status {
            Some(TaskStatus::Succeeded) => return Ok(event),
            Some(TaskStatus::Pending) | Some(TaskStatus::Failed) => {}
            // Running elsewhere, permanently failed, or not a long event
            _ => return Ok(event),
        }

        if !activity::claim_details(self.db.pool(), event.id, event.details_attempts).await? {
            // Another request won the claim
            return Ok(event);
        }
        let attempts = event.details_attempts + 1;

        match self.generate(&event).await {
            Ok(details) => {
                activity::mark_details_succeeded(self.db.pool(), event.id, &details).await?;
            }
            Err(e) => {
                tracing::warn!(event_id, attempts, error = %e, "Event details generation failed");
                activity::mark_details_failed(self.db.pool(), event.id, attempts).await?;
            }
        }

        activity::get_event(self.db.pool(), event_id)
            .await?
            .ok_or_else(|| {
                crate::data::sqlite::SqliteError::NotFound(format!("event {event_id}")).into()
            })
    }

    async fn generate(&self, event: &ActivityEventRow) -> Result<String, PipelineError> {
        let prompt = self.build_prompt(event).await?;

        let permit = self.runtime.acquire(Capability::Text).await?;
        let started = Instant::now();
        let result = tokio::time::timeout(
            Duration::from_millis(DETAILS_TIMEOUT_MS),
            self.provider.generate(prompt),
        )
        .await
        .map_err(|_| AiError::Timeout {
            capability: Capability::Text,
            ms: DETAILS_TIMEOUT_MS,
        })
        .and_then(|r| r);
        let duration_ms = started.elapsed().as_millis() as i64;
        drop(permit);

        match result {
            Ok(response) => {
                self.runtime.record_success(Capability::Text);
                self.usage
                    .success(
                        Capability::Text,
                        "event_details",
                        self.provider.model(),
                        response.usage,
                        duration_ms,
                    )
                    .await;
                self.traces.record(
                    Capability::Text,
                    "event_details",
                    self.provider.model(),
                    "succeeded",
                    duration_ms,
                    Some(&response.text),
                    None,
                    Vec::new(),
                );
                Ok(response.text)
            }
            Err(e) => {
                if matches!(e, AiError::Timeout { .. }) {
                    self.bus.alert(
                        AlertKind::EventDetailsTimeout,
                        format!("details generation for event {} timed out", event.id),
                    );
                }
                self.runtime.record_failure(Capability::Text, &e);
                self.usage
                    .failure(
                        Capability::Text,
                        "event_details",
                        self.provider.model(),
                        &e,
                        duration_ms,
                    )
                    .await;
                Err(e.into())
            }
        }
    }

    async fn build_prompt(&self, event: &ActivityEventRow) -> Result<String, PipelineError> {
        let mut gathered: Vec<ContextNodeRow> =
            nodes::get_many(self.db.pool(), &event.node_id_list()).await?;

        // Supplement with recent thread-wide nodes beyond the event span
        if let Some(ref thread_id) = event.thread_id {
            let recent =
                nodes::recent_for_thread(self.db.pool(), thread_id, DETAILS_NODE_CAP as i64)
                    .await?;
            for node in recent {
                if !gathered.iter().any(|n| n.id == node.id) {
                    gathered.push(node);
                }
            }
        }
        gathered.truncate(DETAILS_NODE_CAP);

        let mut prompt = format!(
            "Write a detailed markdown account of this activity event: \"{}\" ({}). \
             Cover what was worked on, how it progressed, and notable outcomes. \
             Reply with markdown only, no JSON.\n\n",
            event.title, event.kind
        );

        if let Some(ref thread_id) = event.thread_id
            && let Some(thread) = threads::get(self.db.pool(), thread_id).await?
        {
            prompt.push_str(&format!(
                "Thread: \"{}\"{}{}\n\n",
                thread.title,
                thread
                    .current_phase
                    .as_deref()
                    .map(|p| format!(", phase: {p}"))
                    .unwrap_or_default(),
                thread
                    .current_focus
                    .as_deref()
                    .map(|f| format!(", focus: {f}"))
                    .unwrap_or_default(),
            ));
        }

        prompt.push_str("Nodes:\n");
        let mut used = prompt.len();
        for node in &gathered {
            let line = format!(
                "- [{}] at {} \"{}\": {}\n",
                node.kind.as_str(),
                node.event_time,
                node.title,
                node.summary
            );
            if used + line.len() > DETAILS_CHAR_BUDGET {
                break;
            }
            used += line.len();
            prompt.push_str(&line);
        }

        Ok(prompt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::core::constants::LONG_EVENT_THRESHOLD_MS;
    use crate::data::sqlite::repositories::activity::EventUpsert;
    use crate::domain::ai::providers::mock::MockText;

    fn generator_for(db: &Arc<SqliteService>, response: &str) -> Arc<DetailsGenerator> {
        let bus = Arc::new(EventBus::new());
        let runtime = AiRuntime::new(Arc::clone(&bus));
        let usage = Arc::new(UsageRecorder::new(Arc::clone(db), Arc::clone(&bus)));
        let traces = Arc::new(TraceRecorder::new());
        DetailsGenerator::new(
            Arc::clone(db),
            runtime,
            MockText::new(response),
            usage,
            traces,
            bus,
        )
    }

    async fn long_event(db: &SqliteService) -> i64 {
        activity::upsert_event(
            db.pool(),
            &EventUpsert {
                event_key: "thr_x".to_string(),
                title: "Long task".to_string(),
                kind: "thread".to_string(),
                start_ts: 0,
                end_ts: LONG_EVENT_THRESHOLD_MS + 60_000,
                confidence: 1.0,
                importance: 0.8,
                thread_id: None,
                summary_id: None,
                node_ids: vec![],
                force_long: true,
            },
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_first_call_generates_second_call_cached() {
        let db = Arc::new(SqliteService::init_in_memory().await.unwrap());
        let event_id = long_event(&db).await;
        let generator = generator_for(&db, "## Detailed account\nWork happened.");

        let event = generator.get_or_generate(event_id).await.unwrap();
        assert_eq!(event.details_status, Some(TaskStatus::Succeeded));
        assert!(event.details_text.unwrap().contains("Detailed account"));

        // Second call returns the cache without another model call
        let generator2 = generator_for(&db, "different text");
        let event = generator2.get_or_generate(event_id).await.unwrap();
        assert!(event.details_text.unwrap().contains("Detailed account"));
    }

    #[tokio::test]
    async fn test_short_event_returns_without_generation() {
        let db = Arc::new(SqliteService::init_in_memory().await.unwrap());
        let event_id = activity::upsert_event(
            db.pool(),
            &EventUpsert {
                event_key: "k1".to_string(),
                title: "Quick".to_string(),
                kind: "work".to_string(),
                start_ts: 0,
                end_ts: 1000,
                confidence: 0.5,
                importance: 0.5,
                thread_id: None,
                summary_id: None,
                node_ids: vec![],
                force_long: false,
            },
        )
        .await
        .unwrap();

        let generator = generator_for(&db, "should not be called");
        let event = generator.get_or_generate(event_id).await.unwrap();
        assert!(event.details_status.is_none());
        assert!(event.details_text.is_none());
    }

    #[tokio::test]
    async fn test_unknown_event_errors() {
        let db = Arc::new(SqliteService::init_in_memory().await.unwrap());
        let generator = generator_for(&db, "x");
        assert!(generator.get_or_generate(9999).await.is_err());
    }
}
