//! Hybrid keyword + vector search
//!
//! Three cooperative phases per search: keyword match over screenshot text,
//! ANN search over node embeddings, optional answer synthesis. A per-search
//! cancellation token is checked between phases; `cancel()` aborts the
//! current search at the next check.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::core::constants::{
    ACTIVITY_WINDOW_MS, SEARCH_KEYWORD_LIMIT, SEARCH_RESULT_CAP, SEARCH_VECTOR_LIMIT,
    TEXT_TIMEOUT_MS,
};
use crate::data::sqlite::repositories::{nodes, screenshots, vector_docs};
use crate::data::sqlite::{SqliteError, SqliteService};
use crate::data::types::ContextNodeRow;
use crate::data::vector::VectorStore;
use crate::domain::ai::providers::TextProvider;
use crate::domain::ai::{AiError, AiRuntime, Capability};
use crate::domain::pipeline::embed::EmbedStage;

use super::fts::FtsService;

#[derive(Debug, Error)]
pub enum SearchError {
    #[error(transparent)]
    Sqlite(#[from] SqliteError),

    #[error(transparent)]
    Ai(#[from] AiError),

    #[error("Search cancelled")]
    Cancelled,
}

/// One node hit with provenance
#[derive(Debug, Clone, Serialize)]
pub struct ScoredNode {
    pub node_id: i64,
    pub title: String,
    pub summary: String,
    pub kind: String,
    pub thread_id: Option<String>,
    pub event_time: i64,
    pub score: f64,
    /// "vector", "keyword", or "neighbor"
    pub origin: String,
}

/// One screenshot evidence hit
#[derive(Debug, Clone, Serialize)]
pub struct ScreenshotHit {
    pub screenshot_id: i64,
    pub ts_ms: i64,
    pub source_key: String,
    pub window_title: Option<String>,
    pub ocr_excerpt: Option<String>,
    pub score: f64,
}

/// Assembled search result
#[derive(Debug, Serialize)]
pub struct SearchResult {
    pub query: String,
    pub nodes: Vec<ScoredNode>,
    pub screenshots: Vec<ScreenshotHit>,
    pub answer: Option<String>,
    pub degraded: bool,
}

/// Hybrid search service
pub struct SearchService {
    db: Arc<SqliteService>,
    fts: Arc<FtsService>,
    vectors: Arc<VectorStore>,
    embedder: Arc<EmbedStage>,
    runtime: Arc<AiRuntime>,
    text: Option<Arc<dyn TextProvider>>,
    current: Mutex<Option<CancellationToken>>,
}

impl SearchService {
    pub fn new(
        db: Arc<SqliteService>,
        fts: Arc<FtsService>,
        vectors: Arc<VectorStore>,
        embedder: Arc<EmbedStage>,
        runtime: Arc<AiRuntime>,
        text: Option<Arc<dyn TextProvider>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            db,
            fts,
            vectors,
            embedder,
            runtime,
            text,
            current: Mutex::new(None),
        })
    }

    /// Cancel the search in flight, if any
    pub fn cancel(&self) {
        if let Some(token) = self.current.lock().take() {
            token.cancel();
        }
    }

    pub async fn search(&self, query: &str, synthesize: bool) -> Result<SearchResult, SearchError> {
        let token = CancellationToken::new();
        *self.current.lock() = Some(token.clone());

        let result = self.run(query, synthesize, &token).await;
        self.current.lock().take();
        result
    }

    async fn run(
        &self,
        query: &str,
        synthesize: bool,
        token: &CancellationToken,
    ) -> Result<SearchResult, SearchError> {
        // Phase 1: keyword over screenshot text
        let keyword_hits = self.fts.keyword_search(query, SEARCH_KEYWORD_LIMIT).await?;
        let mut screenshot_hits = Vec::new();
        for hit in &keyword_hits {
            if let Some(shot) = screenshots::get(self.db.pool(), hit.screenshot_id).await? {
                screenshot_hits.push(ScreenshotHit {
                    screenshot_id: shot.id,
                    ts_ms: shot.ts_ms,
                    source_key: shot.source_key,
                    window_title: shot.window_title,
                    ocr_excerpt: shot
                        .ocr_text
                        .as_deref()
                        .map(|t| crate::utils::string::truncate_preview(t, 200)),
                    score: hit.score,
                });
            }
        }

        if token.is_cancelled() {
            return Err(SearchError::Cancelled);
        }

        // Phase 2: ANN over node embeddings
        let mut node_hits: Vec<ScoredNode> = Vec::new();
        match self.embedder.embed_query(query).await {
            Ok(vector) => {
                let ann_hits = self.vectors.search(&vector, SEARCH_VECTOR_LIMIT).await;
                let doc_ids: Vec<i64> = ann_hits.iter().map(|(id, _)| *id).collect();
                let docs = vector_docs::get_many(self.db.pool(), &doc_ids).await?;
                for (doc_id, score) in ann_hits {
                    let Some(doc) = docs.iter().find(|d| d.id == doc_id) else {
                        continue;
                    };
                    if let Some(node) = nodes::get(self.db.pool(), doc.ref_id).await? {
                        node_hits.push(scored(&node, score as f64, "vector"));
                    }
                }
            }
            Err(e) => {
                // Vector-only degradation applies the other way too: keyword
                // results still return when the embedder is down
                tracing::warn!(error = %e, "Query embedding failed, keyword-only search");
            }
        }

        if token.is_cancelled() {
            return Err(SearchError::Cancelled);
        }

        // Neighbor expansion: same thread plus adjacent activity windows
        let seeds: Vec<ScoredNode> = node_hits.iter().take(5).cloned().collect();
        for seed in seeds {
            for neighbor in self.neighbors_of(&seed).await? {
                if !node_hits.iter().any(|n| n.node_id == neighbor.id) {
                    node_hits.push(scored(&neighbor, seed.score * 0.5, "neighbor"));
                }
            }
        }
        node_hits.truncate(SEARCH_RESULT_CAP);

        if token.is_cancelled() {
            return Err(SearchError::Cancelled);
        }

        // Phase 3: optional answer synthesis
        let answer = if synthesize && !node_hits.is_empty() {
            match self.synthesize_answer(query, &node_hits).await {
                Ok(answer) => Some(answer),
                Err(e) => {
                    tracing::warn!(error = %e, "Answer synthesis failed");
                    None
                }
            }
        } else {
            None
        };

        Ok(SearchResult {
            query: query.to_string(),
            nodes: node_hits,
            screenshots: screenshot_hits,
            answer,
            degraded: self.fts.is_degraded(),
        })
    }

    async fn neighbors_of(&self, seed: &ScoredNode) -> Result<Vec<ContextNodeRow>, SearchError> {
        let mut neighbors = Vec::new();
        if let Some(ref thread_id) = seed.thread_id {
            neighbors.extend(nodes::recent_for_thread(self.db.pool(), thread_id, 3).await?);
        }
        neighbors.extend(
            nodes::in_window(
                self.db.pool(),
                seed.event_time - ACTIVITY_WINDOW_MS,
                seed.event_time + ACTIVITY_WINDOW_MS,
            )
            .await?
            .into_iter()
            .take(3),
        );
        neighbors.retain(|n| n.id != seed.node_id);
        Ok(neighbors)
    }

    async fn synthesize_answer(
        &self,
        query: &str,
        hits: &[ScoredNode],
    ) -> Result<String, SearchError> {
        let Some(ref provider) = self.text else {
            return Err(AiError::NotConfigured(Capability::Text).into());
        };

        let mut prompt = format!(
            "Answer the question from the retrieved screen-activity context. Reply with \
             concise markdown.\n\nQuestion: {query}\n\nContext:\n"
        );
        for hit in hits.iter().take(10) {
            prompt.push_str(&format!("- \"{}\": {}\n", hit.title, hit.summary));
        }

        let permit = self.runtime.acquire(Capability::Text).await?;
        let result = tokio::time::timeout(
            std::time::Duration::from_millis(TEXT_TIMEOUT_MS),
            provider.generate(prompt),
        )
        .await
        .map_err(|_| AiError::Timeout {
            capability: Capability::Text,
            ms: TEXT_TIMEOUT_MS,
        })
        .and_then(|r| r);
        drop(permit);

        match result {
            Ok(response) => {
                self.runtime.record_success(Capability::Text);
                Ok(response.text)
            }
            Err(e) => {
                self.runtime.record_failure(Capability::Text, &e);
                Err(e.into())
            }
        }
    }
}

fn scored(node: &ContextNodeRow, score: f64, origin: &str) -> ScoredNode {
    ScoredNode {
        node_id: node.id,
        title: node.title.clone(),
        summary: node.summary.clone(),
        kind: node.kind.as_str().to_string(),
        thread_id: node.thread_id.clone(),
        event_time: node.event_time,
        score,
        origin: origin.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::data::topics::EventBus;
    use crate::data::types::NodeKind;
    use crate::data::vector::FlatIndex;
    use crate::domain::ai::providers::mock::{MockEmbedding, MockText};
    use crate::domain::ai::trace::TraceRecorder;
    use crate::domain::ai::usage::UsageRecorder;
    use crate::domain::pipeline::expand::upsert_node_document;

    async fn service(db: Arc<SqliteService>, with_text: bool) -> (Arc<SearchService>, Arc<VectorStore>) {
        let bus = Arc::new(EventBus::new());
        let runtime = AiRuntime::new(Arc::clone(&bus));
        let usage = Arc::new(UsageRecorder::new(Arc::clone(&db), Arc::clone(&bus)));
        let traces = Arc::new(TraceRecorder::new());
        let temp = tempfile::tempdir().unwrap();
        let vectors = Arc::new(VectorStore::new(
            Box::new(FlatIndex::new()),
            temp.keep().join("t.ann"),
        ));
        let embedder = EmbedStage::new(
            Arc::clone(&db),
            Arc::clone(&runtime),
            MockEmbedding::new(),
            Arc::clone(&vectors),
            usage,
            traces,
        );
        let fts = FtsService::new(Arc::clone(&db), Arc::clone(&bus));
        let text: Option<Arc<dyn TextProvider>> = if with_text {
            Some(MockText::new("The user worked on the parser."))
        } else {
            None
        };
        (
            SearchService::new(db, fts, Arc::clone(&vectors), embedder, runtime, text),
            vectors,
        )
    }

    async fn indexed_node(db: &SqliteService, vectors: &VectorStore, title: &str) -> i64 {
        let mut spec = nodes::test_node("b1", NodeKind::Event, 1_000);
        spec.title = title.to_string();
        let id = nodes::insert(db.pool(), &spec).await.unwrap();
        let node = nodes::get(db.pool(), id).await.unwrap().unwrap();
        upsert_node_document(db, &node).await.unwrap();
        let doc = vector_docs::get_by_node(db.pool(), id).await.unwrap().unwrap();
        // Mirror the pipeline: embed deterministically and index by doc id
        let mut vector = [0.0f32; 4];
        for (i, b) in doc.text_content.bytes().enumerate() {
            vector[i % 4] += b as f32 / 255.0;
        }
        vectors.upsert(doc.id, &vector).await;
        id
    }

    #[tokio::test]
    async fn test_vector_phase_resolves_nodes() {
        let db = Arc::new(SqliteService::init_in_memory().await.unwrap());
        let (service, vectors) = service(Arc::clone(&db), false).await;
        let id = indexed_node(&db, &vectors, "Parser debugging").await;

        let result = service.search("Parser debugging", false).await.unwrap();
        assert!(!result.nodes.is_empty());
        assert_eq!(result.nodes[0].node_id, id);
        assert_eq!(result.nodes[0].origin, "vector");
        assert!(result.answer.is_none());
        assert!(!result.degraded);
    }

    #[tokio::test]
    async fn test_answer_synthesis_with_provider() {
        let db = Arc::new(SqliteService::init_in_memory().await.unwrap());
        let (service, vectors) = service(Arc::clone(&db), true).await;
        indexed_node(&db, &vectors, "Parser debugging").await;

        let result = service.search("what did I work on", true).await.unwrap();
        assert_eq!(result.answer.as_deref(), Some("The user worked on the parser."));
    }

    #[tokio::test]
    async fn test_cancelled_token_aborts() {
        let db = Arc::new(SqliteService::init_in_memory().await.unwrap());
        let (service, _) = service(Arc::clone(&db), false).await;

        let token = CancellationToken::new();
        token.cancel();
        let err = service.run("query", false, &token).await.unwrap_err();
        assert!(matches!(err, SearchError::Cancelled));
    }

    #[tokio::test]
    async fn test_keyword_phase_returns_evidence() {
        let db = Arc::new(SqliteService::init_in_memory().await.unwrap());
        let (service, _) = service(Arc::clone(&db), false).await;

        use crate::data::sqlite::repositories::screenshots::{self as shots, NewScreenshot};
        let id = shots::insert(
            db.pool(),
            &NewScreenshot {
                ts_ms: 5,
                source_key: "screen:1".to_string(),
                phash: 1,
                file_path: "/tmp/x.png".to_string(),
                width: 1,
                height: 1,
                bytes: 1,
                mime: "image/png".to_string(),
                app_hint: None,
                window_title: None,
            },
        )
        .await
        .unwrap();
        sqlx::query("UPDATE screenshots SET ocr_text = 'unique keyword haystack' WHERE id = ?")
            .bind(id)
            .execute(db.pool())
            .await
            .unwrap();
        let row = shots::get(db.pool(), id).await.unwrap().unwrap();
        shots::fts_upsert(db.pool(), &row).await.unwrap();

        let result = service.search("haystack", false).await.unwrap();
        assert_eq!(result.screenshots.len(), 1);
        assert_eq!(result.screenshots[0].screenshot_id, id);
        assert!(result.screenshots[0].ocr_excerpt.as_deref().unwrap().contains("haystack"));
    }
}
