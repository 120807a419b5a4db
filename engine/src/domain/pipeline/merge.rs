//! Per-node merge stage
//!
//! For each node with merge work outstanding, find the most recent
//! succeeded node in the same thread with the same kind. With no target the
//! node simply becomes the thread's latest of its kind. Otherwise a text
//! LLM decides whether the target absorbs the source; absorption revises
//! the target, unions the evidence links, and re-embeds the target.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Deserialize;

use crate::core::constants::TEXT_TIMEOUT_MS;
use crate::data::sqlite::SqliteService;
use crate::data::sqlite::repositories::nodes::{self, MergePatch};
use crate::data::topics::{EventBus, PipelineStageEvent};
use crate::data::types::{ContextNodeRow, NodeKind};
use crate::domain::ai::providers::TextProvider;
use crate::domain::ai::trace::TraceRecorder;
use crate::domain::ai::usage::UsageRecorder;
use crate::domain::ai::{AiError, AiRuntime, Capability};
use crate::utils::time::now_ms;

use super::PipelineError;
use super::expand::upsert_node_document;

/// Structured merge decision from the text LLM
#[derive(Debug, Deserialize)]
struct MergeResponse {
    /// "ABSORB" folds the source into the target; anything else keeps both
    decision: String,
    #[serde(default)]
    merged: Option<MergedFields>,
}

#[derive(Debug, Deserialize)]
struct MergedFields {
    title: String,
    summary: String,
    #[serde(default)]
    keywords: Vec<String>,
    #[serde(default)]
    entities: Vec<String>,
    #[serde(default = "default_score")]
    importance: f64,
    #[serde(default = "default_score")]
    confidence: f64,
}

fn default_score() -> f64 {
    0.5
}

/// Merge stage worker
pub struct MergeStage {
    db: Arc<SqliteService>,
    runtime: Arc<AiRuntime>,
    provider: Arc<dyn TextProvider>,
    usage: Arc<UsageRecorder>,
    traces: Arc<TraceRecorder>,
    bus: Arc<EventBus>,
}

impl MergeStage {
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

    /// Process one due merge row. Converts all errors into row transitions.
    pub async fn process(&self, node: ContextNodeRow) {
        if !matches!(
            nodes::claim_merge(self.db.pool(), node.id, node.merge_attempts).await,
            Ok(true)
        ) {
            return;
        }
        let attempts = node.merge_attempts + 1;

        self.bus.publish_pipeline_stage(PipelineStageEvent {
            at_ms: now_ms(),
            stage: "merge".to_string(),
            detail: node.id.to_string(),
        });

        if let Err(e) = self.run(&node).await {
            tracing::warn!(node_id = node.id, attempts, error = %e, "Merge failed");
            if let Err(db_err) = nodes::mark_merge_failed(self.db.pool(), node.id, attempts).await {
                tracing::error!(node_id = node.id, error = %db_err, "Failed to record merge failure");
            }
        }
    }

    async fn run(&self, source: &ContextNodeRow) -> Result<(), PipelineError> {
        let Some(ref thread_id) = source.thread_id else {
            // Scans exclude unassigned nodes; a stale row just waits
            return Ok(());
        };

        let target =
            nodes::latest_merge_target(self.db.pool(), thread_id, source.kind, source.id).await?;
        let Some(target) = target else {
            // First of its kind in the thread: nothing to merge with
            nodes::mark_merge_succeeded(self.db.pool(), source.id).await?;
            return Ok(());
        };

        let prompt = build_prompt(&target, source);

        let permit = self.runtime.acquire(Capability::Text).await?;
        let started = Instant::now();
        let result = tokio::time::timeout(
            Duration::from_millis(TEXT_TIMEOUT_MS),
            self.provider.generate(prompt),
        )
        .await
        .map_err(|_| AiError::Timeout {
            capability: Capability::Text,
            ms: TEXT_TIMEOUT_MS,
        })
        .and_then(|r| r);
        let duration_ms = started.elapsed().as_millis() as i64;
        drop(permit);

        let response = match result {
            Ok(response) => {
                self.runtime.record_success(Capability::Text);
                self.usage
                    .success(
                        Capability::Text,
                        "merge",
                        self.provider.model(),
                        response.usage,
                        duration_ms,
                    )
                    .await;
                self.traces.record(
                    Capability::Text,
                    "merge",
                    self.provider.model(),
                    "succeeded",
                    duration_ms,
                    Some(&response.text),
                    None,
                    Vec::new(),
                );
                response
            }
            Err(e) => {
                self.runtime.record_failure(Capability::Text, &e);
                self.usage
                    .failure(Capability::Text, "merge", self.provider.model(), &e, duration_ms)
                    .await;
                self.traces.record(
                    Capability::Text,
                    "merge",
                    self.provider.model(),
                    "failed",
                    duration_ms,
                    None,
                    Some(&e.to_string()),
                    Vec::new(),
                );
                return Err(e.into());
            }
        };

        let parsed: MergeResponse = serde_json::from_str(response.text.trim())
            .map_err(|e| AiError::Parse(format!("merge response: {e}")))?;

        if parsed.decision.eq_ignore_ascii_case("absorb") {
            let fields = parsed
                .merged
                .ok_or_else(|| AiError::Parse("ABSORB decision without merged fields".into()))?;
            let patch = MergePatch {
                title: fields.title,
                summary: fields.summary,
                keywords: fields.keywords,
                entities: fields.entities.clone(),
                importance: fields.importance,
                confidence: fields.confidence,
            };
            nodes::apply_absorb(self.db.pool(), &target, source, &patch).await?;

            // Target text changed: re-embed through the standard upsert path
            if let Some(revised) = nodes::get(self.db.pool(), target.id).await? {
                upsert_node_document(&self.db, &revised).await?;
                if revised.kind == NodeKind::Event {
                    nodes::sync_mentions(
                        self.db.pool(),
                        revised.id,
                        &fields.entities,
                        revised.event_time,
                    )
                    .await?;
                }
            }
            tracing::debug!(source = source.id, target = target.id, "Node absorbed");
        } else {
            nodes::mark_merge_succeeded(self.db.pool(), source.id).await?;
        }

        Ok(())
    }
}

fn build_prompt(target: &ContextNodeRow, source: &ContextNodeRow) -> String {
    format!(
        "Two context nodes from the same activity thread, same kind ({kind}). Decide \
         whether the NEW node is a continuation of the EXISTING node and should be \
         absorbed into it. Reply with ONE JSON object: {{\"decision\": \"ABSORB\"|\"KEEP\", \
         \"merged\": {{\"title\", \"summary\", \"keywords\", \"entities\", \"importance\", \
         \"confidence\"}}}} (merged required for ABSORB, describing the combined node).\n\n\
         EXISTING (id {target_id}):\ntitle: {target_title}\nsummary: {target_summary}\n\n\
         NEW (id {source_id}):\ntitle: {source_title}\nsummary: {source_summary}\n",
        kind = target.kind.as_str(),
        target_id = target.id,
        target_title = target.title,
        target_summary = target.summary,
        source_id = source.id,
        source_title = source.title,
        source_summary = source.summary,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::data::sqlite::repositories::vector_docs;
    use crate::data::types::TaskStatus;
    use crate::domain::ai::providers::mock::MockText;

    fn stage_for(db: &Arc<SqliteService>, response: &serde_json::Value) -> Arc<MergeStage> {
        let bus = Arc::new(EventBus::new());
        let runtime = AiRuntime::new(Arc::clone(&bus));
        let usage = Arc::new(UsageRecorder::new(Arc::clone(db), Arc::clone(&bus)));
        let traces = Arc::new(TraceRecorder::new());
        MergeStage::new(
            Arc::clone(db),
            runtime,
            MockText::new(response.to_string()),
            usage,
            traces,
            bus,
        )
    }

    async fn seeded_pair(db: &SqliteService) -> (i64, i64) {
        let target = nodes::insert(db.pool(), &nodes::test_node("b1", NodeKind::Event, 100))
            .await
            .unwrap();
        let mut spec = nodes::test_node("b2", NodeKind::Event, 200);
        spec.screenshot_ids = vec![9];
        let source = nodes::insert(db.pool(), &spec).await.unwrap();
        for id in [target, source] {
            nodes::assign_thread(db.pool(), id, "thr_a").await.unwrap();
        }
        nodes::mark_merge_succeeded(db.pool(), target).await.unwrap();
        (target, source)
    }

    #[tokio::test]
    async fn test_first_of_kind_succeeds_without_llm() {
        let db = Arc::new(SqliteService::init_in_memory().await.unwrap());
        let id = nodes::insert(db.pool(), &nodes::test_node("b1", NodeKind::Event, 100))
            .await
            .unwrap();
        nodes::assign_thread(db.pool(), id, "thr_a").await.unwrap();
        let node = nodes::get(db.pool(), id).await.unwrap().unwrap();

        let stage = stage_for(&db, &json!({"decision": "KEEP"}));
        stage.process(node).await;

        let row = nodes::get(db.pool(), id).await.unwrap().unwrap();
        assert_eq!(row.merge_status, TaskStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_absorb_updates_target_and_reembeds() {
        let db = Arc::new(SqliteService::init_in_memory().await.unwrap());
        let (target_id, source_id) = seeded_pair(&db).await;

        // Target already has an embedded, indexed document
        let target_row = nodes::get(db.pool(), target_id).await.unwrap().unwrap();
        upsert_node_document(&db, &target_row).await.unwrap();
        let doc = vector_docs::get_by_node(db.pool(), target_id)
            .await
            .unwrap()
            .unwrap();
        let old_hash = doc.text_hash.clone();
        vector_docs::claim_embedding(db.pool(), doc.id, 0).await.unwrap();
        vector_docs::mark_embedding_succeeded(db.pool(), doc.id, &doc.text_content, &[0; 8])
            .await
            .unwrap();

        let response = json!({
            "decision": "ABSORB",
            "merged": {
                "title": "Extended parser session",
                "summary": "Tokenizer and lexer work combined",
                "keywords": ["parser", "lexer"],
                "entities": ["tokenizer.rs", "lexer.rs"],
                "importance": 0.8,
                "confidence": 0.9,
            },
        });
        let stage = stage_for(&db, &response);
        let source = nodes::get(db.pool(), source_id).await.unwrap().unwrap();
        stage.process(source).await;

        let target = nodes::get(db.pool(), target_id).await.unwrap().unwrap();
        assert_eq!(target.title, "Extended parser session");
        assert!(target.merged_from().contains(&source_id));
        assert!(target.shot_ids().contains(&9));

        let source = nodes::get(db.pool(), source_id).await.unwrap().unwrap();
        assert_eq!(source.merge_status, TaskStatus::Succeeded);

        // Revised text re-enqueued embedding work with a new hash
        let doc = vector_docs::get_by_node(db.pool(), target_id)
            .await
            .unwrap()
            .unwrap();
        assert_ne!(doc.text_hash, old_hash);
        assert_eq!(doc.embedding_status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_keep_decision_marks_source_done() {
        let db = Arc::new(SqliteService::init_in_memory().await.unwrap());
        let (target_id, source_id) = seeded_pair(&db).await;

        let stage = stage_for(&db, &json!({"decision": "KEEP"}));
        let source = nodes::get(db.pool(), source_id).await.unwrap().unwrap();
        stage.process(source).await;

        let source = nodes::get(db.pool(), source_id).await.unwrap().unwrap();
        assert_eq!(source.merge_status, TaskStatus::Succeeded);
        let target = nodes::get(db.pool(), target_id).await.unwrap().unwrap();
        assert!(target.merged_from().is_empty());
    }

    #[tokio::test]
    async fn test_bad_response_schedules_retry() {
        let db = Arc::new(SqliteService::init_in_memory().await.unwrap());
        let (_, source_id) = seeded_pair(&db).await;

        let stage = stage_for(&db, &json!({"decision": "ABSORB"}));
        let source = nodes::get(db.pool(), source_id).await.unwrap().unwrap();
        stage.process(source).await;

        let source = nodes::get(db.pool(), source_id).await.unwrap().unwrap();
        assert_eq!(source.merge_status, TaskStatus::Failed);
        assert_eq!(source.merge_attempts, 1);
        assert!(source.merge_next_run_at.is_some());
    }
}
