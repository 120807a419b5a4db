//! Node expansion
//!
//! Turns a validated VLM index into context nodes: one `event` node per
//! segment plus derived knowledge/state/procedure/plan nodes. Every
//! inserted node gets a hash-idempotent vector-document upsert, which
//! enqueues embedding and indexing work.

use std::sync::Arc;

use serde_json::json;

use crate::data::sqlite::{SqliteError, SqliteService};
use crate::data::sqlite::repositories::nodes::{self, NewNode};
use crate::data::sqlite::repositories::{threads, vector_docs};
use crate::data::types::{BatchRow, ContextNodeRow, NodeKind};
use crate::domain::ai::schema::{MergeDecision, VlmIndex, VlmSegment};

/// Text a node is embedded under; rebuilt from current fields on
/// re-embedding so merged nodes pick up revised content.
pub fn build_node_text(node: &ContextNodeRow) -> String {
    let mut text = format!("{}\n{}", node.title, node.summary);
    let keywords = node.keyword_list();
    if !keywords.is_empty() {
        text.push_str("\nkeywords: ");
        text.push_str(&keywords.join(", "));
    }
    let entities = node.entity_list();
    if !entities.is_empty() {
        text.push_str("\nentities: ");
        text.push_str(&entities.join(", "));
    }
    text
}

/// Metadata stored alongside the vector for reverse lookup and filtering
pub fn build_node_meta(node: &ContextNodeRow) -> String {
    json!({
        "kind": node.kind.as_str(),
        "thread_id": node.thread_id,
        "event_time": node.event_time,
        "batch_id": node.batch_id,
    })
    .to_string()
}

/// Upsert a node's vector document from its current fields
pub async fn upsert_node_document(
    db: &SqliteService,
    node: &ContextNodeRow,
) -> Result<(), SqliteError> {
    let text = build_node_text(node);
    let meta = build_node_meta(node);
    vector_docs::upsert(db.pool(), node.id, &text, Some(&meta)).await?;
    Ok(())
}

/// Expands VLM output into context nodes
pub struct Expander {
    db: Arc<SqliteService>,
}

impl Expander {
    pub fn new(db: Arc<SqliteService>) -> Self {
        Self { db }
    }

    /// Expand every segment of a batch result. Returns inserted node ids.
    pub async fn expand_batch(
        &self,
        batch: &BatchRow,
        index: &VlmIndex,
    ) -> Result<Vec<i64>, SqliteError> {
        let shot_ids = batch.shot_ids();
        let mut inserted = Vec::new();

        for segment in &index.segments {
            let segment_shots: Vec<i64> = segment
                .screen_ids
                .iter()
                .filter_map(|&ordinal| shot_ids.get(ordinal).copied())
                .collect();
            let event_time = self.segment_event_time(batch, &segment_shots).await?;

            // A merge hint naming an existing thread pre-assigns it; anything
            // else leaves assignment to the thread LLM.
            let mut thread_hint = None;
            if let Some(hint) = &segment.merge_hint
                && hint.decision == MergeDecision::Merge
                && let Some(id) = &hint.thread_id
                && threads::get(self.db.pool(), id).await?.is_some()
            {
                thread_hint = Some(id.clone());
            }

            let event_id = self
                .insert_node(
                    batch,
                    segment,
                    NodeKind::Event,
                    &segment.title,
                    &segment.summary,
                    index.entities.clone(),
                    None,
                    Vec::new(),
                    event_time,
                    &segment_shots,
                    thread_hint.clone(),
                )
                .await?;
            inserted.push(event_id);

            for (kind, items) in [
                (NodeKind::Knowledge, &segment.knowledge),
                (NodeKind::State, &segment.state),
                (NodeKind::Procedure, &segment.procedure),
                (NodeKind::Plan, &segment.plan),
            ] {
                for item in items {
                    let payload = match kind {
                        NodeKind::Knowledge => Some(
                            json!({"language": item.language, "summary": item.summary})
                                .to_string(),
                        ),
                        NodeKind::State => Some(json!({"summary": item.summary}).to_string()),
                        _ => None,
                    };
                    let id = self
                        .insert_node(
                            batch,
                            segment,
                            kind,
                            &item.title,
                            &item.summary,
                            Vec::new(),
                            payload,
                            item.steps.clone(),
                            event_time,
                            &segment_shots,
                            thread_hint.clone(),
                        )
                        .await?;
                    inserted.push(id);
                }
            }
        }

        Ok(inserted)
    }

    async fn segment_event_time(
        &self,
        batch: &BatchRow,
        segment_shots: &[i64],
    ) -> Result<i64, SqliteError> {
        if segment_shots.is_empty() {
            return Ok(batch.ts_end);
        }
        let shots =
            crate::data::sqlite::repositories::screenshots::get_many(self.db.pool(), segment_shots)
                .await?;
        Ok(shots.iter().map(|s| s.ts_ms).max().unwrap_or(batch.ts_end))
    }

    #[allow(clippy::too_many_arguments)]
    async fn insert_node(
        &self,
        batch: &BatchRow,
        segment: &VlmSegment,
        kind: NodeKind,
        title: &str,
        summary: &str,
        entities: Vec<String>,
        payload: Option<String>,
        steps: Vec<String>,
        event_time: i64,
        segment_shots: &[i64],
        thread_hint: Option<String>,
    ) -> Result<i64, SqliteError> {
        let (knowledge_payload, state_payload) = match kind {
            NodeKind::Knowledge => (payload, None),
            NodeKind::State => (None, payload),
            _ => (None, None),
        };

        let node = NewNode {
            batch_id: batch.batch_id.clone(),
            kind,
            event_time,
            title: title.to_string(),
            summary: summary.to_string(),
            keywords: segment.keywords.clone(),
            entities: entities.clone(),
            knowledge_payload,
            state_payload,
            action_items: steps,
            importance: segment.importance,
            confidence: segment.confidence,
            screenshot_ids: segment_shots.to_vec(),
            thread_id: thread_hint.clone(),
        };
        let id = nodes::insert(self.db.pool(), &node).await?;

        let row = nodes::get(self.db.pool(), id)
            .await?
            .ok_or_else(|| SqliteError::NotFound(format!("node {id}")))?;
        upsert_node_document(&self.db, &row).await?;

        if kind == NodeKind::Event {
            nodes::sync_mentions(self.db.pool(), id, &entities, event_time).await?;
        }
        if let Some(ref thread_id) = thread_hint {
            threads::touch_activity(self.db.pool(), thread_id, event_time, 1).await?;
        }

        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::data::sqlite::repositories::batches::{self, NewBatch};
    use crate::data::types::TaskStatus;
    use crate::domain::ai::schema::parse_vlm_index;

    async fn seeded_batch(db: &SqliteService) -> BatchRow {
        let id = batches::insert(
            db.pool(),
            &NewBatch {
                batch_id: "batch-1".to_string(),
                source_key: "screen:1".to_string(),
                screenshot_ids: vec![11, 12],
                ts_start: 1000,
                ts_end: 2000,
                history_pack: None,
            },
        )
        .await
        .unwrap();
        batches::get(db.pool(), id).await.unwrap().unwrap()
    }

    fn index_json() -> serde_json::Value {
        json!({
            "segments": [{
                "screen_ids": [0, 1],
                "title": "Debugging tests",
                "summary": "Stepping through failing assertions",
                "keywords": ["tests"],
                "knowledge": [{"title": "Fix", "summary": "Assertion order matters", "language": "ja"}],
                "procedure": [{"title": "Run tests", "summary": "How to run", "steps": ["cargo test"]}],
            }],
            "entities": ["harness.rs"],
            "screenshots": [{"screen_id": 0}, {"screen_id": 1}],
        })
    }

    #[tokio::test]
    async fn test_expand_creates_event_and_derived_nodes() {
        let db = Arc::new(SqliteService::init_in_memory().await.unwrap());
        let batch = seeded_batch(&db).await;
        let index = parse_vlm_index(&index_json(), 2).unwrap();

        let expander = Expander::new(Arc::clone(&db));
        let inserted = expander.expand_batch(&batch, &index).await.unwrap();
        assert_eq!(inserted.len(), 3);

        let rows = nodes::for_batch(db.pool(), "batch-1").await.unwrap();
        let kinds: Vec<NodeKind> = rows.iter().map(|n| n.kind).collect();
        assert!(kinds.contains(&NodeKind::Event));
        assert!(kinds.contains(&NodeKind::Knowledge));
        assert!(kinds.contains(&NodeKind::Procedure));

        let event = rows.iter().find(|n| n.kind == NodeKind::Event).unwrap();
        assert_eq!(event.shot_ids(), vec![11, 12]);
        assert_eq!(event.entity_list(), vec!["harness.rs"]);
        assert!(event.thread_id.is_none());
        assert_eq!(event.merge_status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_expand_enqueues_vector_documents() {
        let db = Arc::new(SqliteService::init_in_memory().await.unwrap());
        let batch = seeded_batch(&db).await;
        let index = parse_vlm_index(&index_json(), 2).unwrap();

        let expander = Expander::new(Arc::clone(&db));
        let inserted = expander.expand_batch(&batch, &index).await.unwrap();

        for node_id in inserted {
            let doc = vector_docs::get_by_node(db.pool(), node_id)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(doc.embedding_status, TaskStatus::Pending);
            assert!(!doc.text_content.is_empty());
        }
    }

    #[tokio::test]
    async fn test_merge_hint_preassigns_existing_thread_only() {
        let db = Arc::new(SqliteService::init_in_memory().await.unwrap());
        let batch = seeded_batch(&db).await;
        let thread_id = threads::create(db.pool(), "Existing", None, 0).await.unwrap();

        let mut doc = index_json();
        doc["segments"][0]["merge_hint"] =
            json!({"decision": "MERGE", "thread_id": thread_id});
        let index = parse_vlm_index(&doc, 2).unwrap();

        let expander = Expander::new(Arc::clone(&db));
        expander.expand_batch(&batch, &index).await.unwrap();

        let rows = nodes::for_batch(db.pool(), "batch-1").await.unwrap();
        assert!(rows.iter().all(|n| n.thread_id.as_deref() == Some(thread_id.as_str())));

        // A hint naming an unknown thread is ignored
        let db2 = Arc::new(SqliteService::init_in_memory().await.unwrap());
        let batch2 = seeded_batch(&db2).await;
        let mut doc2 = index_json();
        doc2["segments"][0]["merge_hint"] =
            json!({"decision": "MERGE", "thread_id": "nonexistent"});
        let index2 = parse_vlm_index(&doc2, 2).unwrap();
        Expander::new(Arc::clone(&db2))
            .expand_batch(&batch2, &index2)
            .await
            .unwrap();
        let rows2 = nodes::for_batch(db2.pool(), "batch-1").await.unwrap();
        assert!(rows2.iter().all(|n| n.thread_id.is_none()));
    }

    #[tokio::test]
    async fn test_build_node_text_includes_fields() {
        let db = Arc::new(SqliteService::init_in_memory().await.unwrap());
        let batch = seeded_batch(&db).await;
        let index = parse_vlm_index(&index_json(), 2).unwrap();
        let inserted = Expander::new(Arc::clone(&db))
            .expand_batch(&batch, &index)
            .await
            .unwrap();

        let node = nodes::get(db.pool(), inserted[0]).await.unwrap().unwrap();
        let text = build_node_text(&node);
        assert!(text.contains("Debugging tests"));
        assert!(text.contains("keywords: tests"));
        assert!(text.contains("entities: harness.rs"));
    }
}
