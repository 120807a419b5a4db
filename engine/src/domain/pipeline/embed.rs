//! Embedding and index stage
//!
//! Two independent subtasks per vector document. Embedding rebuilds the
//! text from the node's current fields (so merges re-embed revised
//! content), calls the embedding model, and stores a little-endian f32
//! blob. Indexing hands the stored vector to the single-writer vector
//! store under the document's integer id.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::core::constants::EMBEDDING_TIMEOUT_MS;
use crate::data::sqlite::SqliteService;
use crate::data::sqlite::repositories::{nodes, vector_docs};
use crate::data::types::VectorDocumentRow;
use crate::data::vector::{VectorStore, decode_embedding, encode_embedding};
use crate::domain::ai::providers::EmbeddingProvider;
use crate::domain::ai::trace::TraceRecorder;
use crate::domain::ai::usage::UsageRecorder;
use crate::domain::ai::{AiError, AiRuntime, Capability};

use super::PipelineError;
use super::expand::build_node_text;

/// Embedding + index stage worker
pub struct EmbedStage {
    db: Arc<SqliteService>,
    runtime: Arc<AiRuntime>,
    provider: Arc<dyn EmbeddingProvider>,
    vectors: Arc<VectorStore>,
    usage: Arc<UsageRecorder>,
    traces: Arc<TraceRecorder>,
}

impl EmbedStage {
    pub fn new(
        db: Arc<SqliteService>,
        runtime: Arc<AiRuntime>,
        provider: Arc<dyn EmbeddingProvider>,
        vectors: Arc<VectorStore>,
        usage: Arc<UsageRecorder>,
        traces: Arc<TraceRecorder>,
    ) -> Arc<Self> {
        Arc::new(Self {
            db,
            runtime,
            provider,
            vectors,
            usage,
            traces,
        })
    }

    /// Embed a query string (used by hybrid search; shares permit + timeout
    /// discipline with the pipeline path)
    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>, AiError> {
        let permit = self.runtime.acquire(Capability::Embedding).await?;
        let result = tokio::time::timeout(
            Duration::from_millis(EMBEDDING_TIMEOUT_MS),
            self.provider.embed(text),
        )
        .await
        .map_err(|_| AiError::Timeout {
            capability: Capability::Embedding,
            ms: EMBEDDING_TIMEOUT_MS,
        })
        .and_then(|r| r);
        drop(permit);

        match result {
            Ok(response) => {
                self.runtime.record_success(Capability::Embedding);
                Ok(response.vector)
            }
            Err(e) => {
                self.runtime.record_failure(Capability::Embedding, &e);
                Err(e)
            }
        }
    }

    // =========================================================================
    // Embedding subtask
    // =========================================================================

    /// Process one due embedding row
    pub async fn process_embedding(&self, doc: VectorDocumentRow) {
        if !matches!(
            vector_docs::claim_embedding(self.db.pool(), doc.id, doc.embedding_attempts).await,
            Ok(true)
        ) {
            return;
        }
        let attempts = doc.embedding_attempts + 1;

        if let Err(e) = self.run_embedding(&doc).await {
            tracing::warn!(doc_id = doc.id, attempts, error = %e, "Embedding failed");
            if let Err(db_err) =
                vector_docs::mark_embedding_failed(self.db.pool(), doc.id, attempts).await
            {
                tracing::error!(doc_id = doc.id, error = %db_err, "Failed to record embedding failure");
            }
        }
    }

    async fn run_embedding(&self, doc: &VectorDocumentRow) -> Result<(), PipelineError> {
        // Rebuild text from the node's current fields
        let text = match nodes::get(self.db.pool(), doc.ref_id).await? {
            Some(node) => build_node_text(&node),
            None => doc.text_content.clone(),
        };

        let permit = self.runtime.acquire(Capability::Embedding).await?;
        let started = Instant::now();
        let result = tokio::time::timeout(
            Duration::from_millis(EMBEDDING_TIMEOUT_MS),
            self.provider.embed(&text),
        )
        .await
        .map_err(|_| AiError::Timeout {
            capability: Capability::Embedding,
            ms: EMBEDDING_TIMEOUT_MS,
        })
        .and_then(|r| r);
        let duration_ms = started.elapsed().as_millis() as i64;
        drop(permit);

        let response = match result {
            Ok(response) => {
                self.runtime.record_success(Capability::Embedding);
                self.usage
                    .success(
                        Capability::Embedding,
                        "embed",
                        self.provider.model(),
                        response.usage,
                        duration_ms,
                    )
                    .await;
                response
            }
            Err(e) => {
                self.runtime.record_failure(Capability::Embedding, &e);
                self.usage
                    .failure(Capability::Embedding, "embed", self.provider.model(), &e, duration_ms)
                    .await;
                self.traces.record(
                    Capability::Embedding,
                    "embed",
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

        let blob = encode_embedding(&response.vector);
        vector_docs::mark_embedding_succeeded(self.db.pool(), doc.id, &text, &blob).await?;
        tracing::trace!(doc_id = doc.id, dims = response.vector.len(), "Document embedded");
        Ok(())
    }

    // =========================================================================
    // Index subtask
    // =========================================================================

    /// Process one due index row
    pub async fn process_index(&self, doc: VectorDocumentRow) {
        if !matches!(
            vector_docs::claim_index(self.db.pool(), doc.id, doc.index_attempts).await,
            Ok(true)
        ) {
            return;
        }
        let attempts = doc.index_attempts + 1;

        if let Err(e) = self.run_index(&doc).await {
            tracing::warn!(doc_id = doc.id, attempts, error = %e, "Indexing failed");
            if let Err(db_err) =
                vector_docs::mark_index_failed(self.db.pool(), doc.id, attempts).await
            {
                tracing::error!(doc_id = doc.id, error = %db_err, "Failed to record index failure");
            }
        }
    }

    async fn run_index(&self, doc: &VectorDocumentRow) -> Result<(), PipelineError> {
        // Re-read the row: the embedding may have been stored after scan
        let current = vector_docs::get(self.db.pool(), doc.id)
            .await?
            .ok_or_else(|| {
                crate::data::sqlite::SqliteError::NotFound(format!("vector doc {}", doc.id))
            })?;
        let blob = current.embedding.as_deref().ok_or_else(|| {
            crate::data::sqlite::SqliteError::NotFound(format!("embedding blob for doc {}", doc.id))
        })?;
        let vector = decode_embedding(blob)
            .map_err(|e| AiError::Parse(format!("stored embedding invalid: {e}")))?;

        self.vectors.upsert(doc.id, &vector).await;
        vector_docs::mark_index_succeeded(self.db.pool(), doc.id).await?;
        tracing::trace!(doc_id = doc.id, "Document indexed");
        Ok(())
    }
}
