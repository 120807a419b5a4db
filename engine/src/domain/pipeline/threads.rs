//! Thread assignment
//!
//! For batches that produced nodes without a thread, the thread LLM sees
//! the active threads (most recent first, with their recent nodes) and the
//! new nodes, and returns per-node assignments plus any new threads to
//! create. Assignments are write-once: a retry can never rewrite one.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Deserialize;

use crate::core::constants::{HISTORY_PACK_NODES_PER_THREAD, HISTORY_PACK_THREADS, TEXT_TIMEOUT_MS};
use crate::data::sqlite::SqliteService;
use crate::data::sqlite::repositories::nodes;
use crate::data::sqlite::repositories::threads::{self, ThreadMetadataPatch};
use crate::data::types::ContextNodeRow;
use crate::domain::ai::providers::TextProvider;
use crate::domain::ai::trace::TraceRecorder;
use crate::domain::ai::usage::UsageRecorder;
use crate::domain::ai::{AiError, AiRuntime, Capability};

use super::PipelineError;

/// Structured response expected from the thread LLM
#[derive(Debug, Deserialize)]
struct AssignmentResponse {
    /// Node assignments onto existing threads
    #[serde(default)]
    assignments: Vec<Assignment>,
    /// Threads to create, each claiming a set of nodes
    #[serde(default)]
    new_threads: Vec<NewThreadSpec>,
    /// Metadata refreshes for existing threads
    #[serde(default)]
    thread_updates: Vec<ThreadUpdate>,
}

#[derive(Debug, Deserialize)]
struct Assignment {
    node_id: i64,
    thread_id: String,
}

#[derive(Debug, Deserialize)]
struct NewThreadSpec {
    title: String,
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    node_ids: Vec<i64>,
}

#[derive(Debug, Deserialize)]
struct ThreadUpdate {
    thread_id: String,
    #[serde(default)]
    current_phase: Option<String>,
    #[serde(default)]
    current_focus: Option<String>,
    #[serde(default)]
    milestones: Option<Vec<String>>,
}

/// Thread assignment worker
pub struct ThreadAssigner {
    db: Arc<SqliteService>,
    runtime: Arc<AiRuntime>,
    provider: Arc<dyn TextProvider>,
    usage: Arc<UsageRecorder>,
    traces: Arc<TraceRecorder>,
}

impl ThreadAssigner {
    pub fn new(
        db: Arc<SqliteService>,
        runtime: Arc<AiRuntime>,
        provider: Arc<dyn TextProvider>,
        usage: Arc<UsageRecorder>,
        traces: Arc<TraceRecorder>,
    ) -> Arc<Self> {
        Arc::new(Self {
            db,
            runtime,
            provider,
            usage,
            traces,
        })
    }

    /// Assign threads for a batch's unassigned nodes. A no-op when every
    /// node already has one.
    pub async fn assign_for_batch(&self, batch_id: &str) -> Result<(), PipelineError> {
        let unassigned: Vec<ContextNodeRow> = nodes::for_batch(self.db.pool(), batch_id)
            .await?
            .into_iter()
            .filter(|n| n.thread_id.is_none())
            .collect();
        if unassigned.is_empty() {
            return Ok(());
        }

        let prompt = self.build_prompt(&unassigned).await?;

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
                        "thread_assign",
                        self.provider.model(),
                        response.usage,
                        duration_ms,
                    )
                    .await;
                self.traces.record(
                    Capability::Text,
                    "thread_assign",
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
                    .failure(Capability::Text, "thread_assign", self.provider.model(), &e, duration_ms)
                    .await;
                self.traces.record(
                    Capability::Text,
                    "thread_assign",
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

        let parsed: AssignmentResponse = serde_json::from_str(response.text.trim())
            .map_err(|e| AiError::Parse(format!("thread response: {e}")))?;

        self.apply(&unassigned, parsed).await
    }

    async fn build_prompt(&self, unassigned: &[ContextNodeRow]) -> Result<String, PipelineError> {
        let mut prompt = String::from(
            "Assign each new context node to an activity thread. Reply with ONE JSON \
             object: `assignments` ([{\"node_id\", \"thread_id\"}] for existing threads), \
             `new_threads` ([{\"title\", \"summary\", \"node_ids\"}] for nodes starting a \
             new thread), and `thread_updates` ([{\"thread_id\", \"current_phase\", \
             \"current_focus\", \"milestones\"}]). Every node id must appear exactly once \
             across assignments and new_threads.\n\nActive threads (most recent first):\n",
        );

        let active = threads::active_recent(self.db.pool(), HISTORY_PACK_THREADS as i64).await?;
        if active.is_empty() {
            prompt.push_str("(none)\n");
        }
        for thread in &active {
            prompt.push_str(&format!(
                "- {} \"{}\"{}\n",
                thread.id,
                thread.title,
                thread
                    .current_focus
                    .as_deref()
                    .map(|f| format!(", focus: {f}"))
                    .unwrap_or_default()
            ));
            let recent = nodes::recent_for_thread(
                self.db.pool(),
                &thread.id,
                HISTORY_PACK_NODES_PER_THREAD as i64,
            )
            .await?;
            for node in recent {
                prompt.push_str(&format!("    · [{}] {}\n", node.kind.as_str(), node.title));
            }
        }

        prompt.push_str("\nNew nodes:\n");
        for node in unassigned {
            prompt.push_str(&format!(
                "- id {} [{}] \"{}\": {}\n",
                node.id,
                node.kind.as_str(),
                node.title,
                node.summary
            ));
        }

        Ok(prompt)
    }

    async fn apply(
        &self,
        unassigned: &[ContextNodeRow],
        response: AssignmentResponse,
    ) -> Result<(), PipelineError> {
        let known: Vec<i64> = unassigned.iter().map(|n| n.id).collect();

        // Existing-thread assignments (write-once; unknown targets skipped)
        for assignment in &response.assignments {
            if !known.contains(&assignment.node_id) {
                tracing::warn!(node_id = assignment.node_id, "Assignment for unknown node ignored");
                continue;
            }
            if threads::get(self.db.pool(), &assignment.thread_id)
                .await?
                .is_none()
            {
                tracing::warn!(thread_id = %assignment.thread_id, "Assignment to unknown thread ignored");
                continue;
            }
            if nodes::assign_thread(self.db.pool(), assignment.node_id, &assignment.thread_id)
                .await?
            {
                self.touch(&assignment.thread_id, assignment.node_id, unassigned)
                    .await?;
            }
        }

        // New threads claim their nodes
        for spec in &response.new_threads {
            let claimed: Vec<i64> = spec
                .node_ids
                .iter()
                .copied()
                .filter(|id| known.contains(id))
                .collect();
            if claimed.is_empty() {
                continue;
            }
            let start_time = unassigned
                .iter()
                .filter(|n| claimed.contains(&n.id))
                .map(|n| n.event_time)
                .min()
                .unwrap_or(0);
            let thread_id = threads::create(
                self.db.pool(),
                &spec.title,
                spec.summary.as_deref(),
                start_time,
            )
            .await?;
            tracing::debug!(thread_id = %thread_id, nodes = claimed.len(), "Thread created");
            for node_id in claimed {
                if nodes::assign_thread(self.db.pool(), node_id, &thread_id).await? {
                    self.touch(&thread_id, node_id, unassigned).await?;
                }
            }
        }

        // Metadata refreshes on existing threads
        for update in &response.thread_updates {
            threads::update_metadata(
                self.db.pool(),
                &update.thread_id,
                &ThreadMetadataPatch {
                    current_phase: update.current_phase.clone(),
                    current_focus: update.current_focus.clone(),
                    milestones: update.milestones.clone(),
                    ..Default::default()
                },
            )
            .await?;
        }

        Ok(())
    }

    async fn touch(
        &self,
        thread_id: &str,
        node_id: i64,
        unassigned: &[ContextNodeRow],
    ) -> Result<(), PipelineError> {
        let event_time = unassigned
            .iter()
            .find(|n| n.id == node_id)
            .map(|n| n.event_time)
            .unwrap_or(0);
        threads::touch_activity(self.db.pool(), thread_id, event_time, 1).await?;
        Ok(())
    }
}
