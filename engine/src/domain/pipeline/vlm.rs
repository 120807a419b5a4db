//! VLM stage
//!
//! Claims a batch, loads its images, issues structured-generation requests
//! (one per shard when the batch exceeds the per-call image limit), and
//! persists the validated result. Downstream expansion and thread
//! assignment are triggered on success but never re-fail the batch.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::core::constants::{
    APP_HINT_MIN_CONFIDENCE, OCR_SUPPORTED_LANGUAGES, SHARD_MAX_SHOTS, VLM_ENTITIES_MAX,
    VLM_TIMEOUT_MS,
};
use crate::data::sqlite::SqliteService;
use crate::data::sqlite::repositories::{batches, screenshots};
use crate::data::sqlite::repositories::screenshots::VlmShotUpdate;
use crate::data::topics::{AlertKind, EventBus, PipelineStageEvent};
use crate::data::types::{BatchRow, ScreenshotRow, StorageState};
use crate::domain::ai::providers::{InlineImage, VlmProvider, VlmRequest};
use crate::domain::ai::schema::{VlmIndex, parse_vlm_index};
use crate::domain::ai::trace::TraceRecorder;
use crate::domain::ai::usage::UsageRecorder;
use crate::domain::ai::{AiError, AiRuntime, Capability};
use crate::utils::time::now_ms;

use super::PipelineError;
use super::expand::Expander;
use super::threads::ThreadAssigner;

/// One loaded image with its batch-ordinal position
struct LoadedShot {
    ordinal: usize,
    row: ScreenshotRow,
    bytes: Vec<u8>,
}

/// VLM batch stage
pub struct VlmStage {
    db: Arc<SqliteService>,
    runtime: Arc<AiRuntime>,
    provider: Arc<dyn VlmProvider>,
    usage: Arc<UsageRecorder>,
    traces: Arc<TraceRecorder>,
    bus: Arc<EventBus>,
    expander: Expander,
    assigner: Arc<ThreadAssigner>,
    retention_ms: i64,
    ocr_enabled: bool,
}

impl VlmStage {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Arc<SqliteService>,
        runtime: Arc<AiRuntime>,
        provider: Arc<dyn VlmProvider>,
        usage: Arc<UsageRecorder>,
        traces: Arc<TraceRecorder>,
        bus: Arc<EventBus>,
        assigner: Arc<ThreadAssigner>,
        retention_ms: i64,
        ocr_enabled: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            expander: Expander::new(Arc::clone(&db)),
            db,
            runtime,
            provider,
            usage,
            traces,
            bus,
            assigner,
            retention_ms,
            ocr_enabled,
        })
    }

    /// Process one due batch. Converts all errors into row transitions.
    pub async fn process(&self, batch: BatchRow) {
        if !matches!(
            batches::claim(self.db.pool(), batch.id, batch.attempts).await,
            Ok(true)
        ) {
            return;
        }
        let attempts = batch.attempts + 1;

        self.bus.publish_pipeline_stage(PipelineStageEvent {
            at_ms: now_ms(),
            stage: "vlm".to_string(),
            detail: batch.batch_id.clone(),
        });

        match self.run(&batch).await {
            Ok(()) => {}
            Err(e) => {
                if let Err(db_err) = self.fail_batch(&batch, attempts, &e).await {
                    tracing::error!(batch_id = %batch.batch_id, error = %db_err, "Failed to record batch failure");
                }
            }
        }
    }

    async fn run(&self, batch: &BatchRow) -> Result<(), PipelineError> {
        let shot_ids = batch.shot_ids();
        let shots = screenshots::get_many(self.db.pool(), &shot_ids).await?;
        screenshots::mark_vlm_running(self.db.pool(), &shot_ids).await?;

        // Read each image; a missing file fails that shot only
        let mut loaded: Vec<LoadedShot> = Vec::new();
        let mut missing: Vec<i64> = Vec::new();
        for (ordinal, row) in shots.into_iter().enumerate() {
            let Some(ref path) = row.file_path else {
                missing.push(row.id);
                continue;
            };
            match tokio::fs::read(path).await {
                Ok(bytes) => loaded.push(LoadedShot { ordinal, row, bytes }),
                Err(e) => {
                    tracing::warn!(id = row.id, error = %e, "Screenshot file unreadable");
                    missing.push(row.id);
                }
            }
        }

        if loaded.is_empty() {
            return Err(AiError::provider("MISSING_FILES", "no readable images in batch", false)
                .into());
        }

        // One permit covers the batch's sequential shard calls
        let permit = self.runtime.acquire(Capability::Vlm).await?;
        let started = Instant::now();
        let result = self.interpret_shards(batch, &loaded).await;
        let duration_ms = started.elapsed().as_millis() as i64;
        drop(permit);

        let image_uris: Vec<String> = loaded
            .iter()
            .filter_map(|s| s.row.file_path.clone())
            .collect();

        let index = match result {
            Ok(index) => {
                self.runtime.record_success(Capability::Vlm);
                self.usage
                    .success(
                        Capability::Vlm,
                        "batch",
                        self.provider.model(),
                        Default::default(),
                        duration_ms,
                    )
                    .await;
                let preview = serde_json::to_string(&index).unwrap_or_default();
                self.traces.record(
                    Capability::Vlm,
                    "batch",
                    self.provider.model(),
                    "succeeded",
                    duration_ms,
                    Some(&preview),
                    None,
                    image_uris,
                );
                index
            }
            Err(e) => {
                if matches!(e, AiError::Timeout { .. }) {
                    self.bus.alert(
                        AlertKind::VlmTimeout,
                        format!("VLM request for batch {} timed out", batch.batch_id),
                    );
                }
                self.runtime.record_failure(Capability::Vlm, &e);
                self.usage
                    .failure(Capability::Vlm, "batch", self.provider.model(), &e, duration_ms)
                    .await;
                self.traces.record(
                    Capability::Vlm,
                    "batch",
                    self.provider.model(),
                    "failed",
                    duration_ms,
                    None,
                    Some(&e.to_string()),
                    image_uris,
                );
                return Err(e.into());
            }
        };

        self.persist_success(batch, &loaded, &missing, &index).await?;

        // Downstream expansion must not re-fail the batch
        if let Err(e) = self.expand_and_assign(batch, &index).await {
            tracing::warn!(batch_id = %batch.batch_id, error = %e, "Post-VLM expansion failed");
        }

        Ok(())
    }

    /// Issue one structured request per shard and merge the results back
    /// into batch-ordinal space.
    async fn interpret_shards(
        &self,
        batch: &BatchRow,
        loaded: &[LoadedShot],
    ) -> Result<VlmIndex, AiError> {
        let mut combined = VlmIndex::default();

        for shard in loaded.chunks(SHARD_MAX_SHOTS) {
            let prompt = build_prompt(batch, shard);
            let images = shard
                .iter()
                .map(|s| InlineImage {
                    mime: s.row.mime.clone(),
                    data: s.bytes.clone(),
                })
                .collect();

            let response = tokio::time::timeout(
                Duration::from_millis(VLM_TIMEOUT_MS),
                self.provider.interpret(VlmRequest { prompt, images }),
            )
            .await
            .map_err(|_| AiError::Timeout {
                capability: Capability::Vlm,
                ms: VLM_TIMEOUT_MS,
            })??;

            let mut index = parse_vlm_index(&response.json, shard.len())?;

            // Shard-local ordinals back to batch ordinals
            for segment in &mut index.segments {
                for id in &mut segment.screen_ids {
                    *id = shard[*id].ordinal;
                }
            }
            for report in &mut index.screenshots {
                report.screen_id = shard[report.screen_id].ordinal;
            }

            combined.segments.extend(index.segments);
            for entity in index.entities {
                if !combined.entities.contains(&entity) {
                    combined.entities.push(entity);
                }
            }
            combined.screenshots.extend(index.screenshots);
        }

        combined.entities.truncate(VLM_ENTITIES_MAX);
        Ok(combined)
    }

    async fn persist_success(
        &self,
        batch: &BatchRow,
        loaded: &[LoadedShot],
        missing: &[i64],
        index: &VlmIndex,
    ) -> Result<(), PipelineError> {
        let retention = now_ms() + self.retention_ms;

        for report in &index.screenshots {
            let Some(shot) = loaded.iter().find(|s| s.ordinal == report.screen_id) else {
                continue;
            };

            let app_hint = report.app_guess.as_ref().and_then(|guess| {
                (guess.confidence >= APP_HINT_MIN_CONFIDENCE).then(|| guess.name.clone())
            });
            let ui_snippets = (!report.ui_text_snippets.is_empty())
                .then(|| serde_json::to_string(&report.ui_text_snippets))
                .transpose()?;

            screenshots::mark_vlm_succeeded(
                self.db.pool(),
                shot.row.id,
                &VlmShotUpdate {
                    ocr_text: report.ocr_text.clone(),
                    ui_text_snippets: ui_snippets,
                    app_hint,
                    retention_expires_at: Some(retention),
                },
            )
            .await?;

            if let Some(row) = screenshots::get(self.db.pool(), shot.row.id).await? {
                screenshots::fts_upsert(self.db.pool(), &row).await?;

                // OCR eligibility: supported language + region + live file
                if self.ocr_enabled
                    && let Some(ref hint) = report.ocr_hint
                    && OCR_SUPPORTED_LANGUAGES.contains(&hint.language.as_str())
                    && row.storage_state == StorageState::Ephemeral
                    && row.file_path.as_deref().is_some_and(|p| std::path::Path::new(p).exists())
                {
                    let region = serde_json::to_string(&hint.region)?;
                    screenshots::set_ocr_pending(self.db.pool(), row.id, &region, &hint.language)
                        .await?;
                }
            }
        }

        // Shots that never reached the model are individually failed
        if !missing.is_empty() {
            screenshots::mark_vlm_failed(self.db.pool(), missing, true, None).await?;
        }

        let index_json = serde_json::to_string(index)?;
        batches::mark_succeeded(self.db.pool(), batch.id, &index_json).await?;
        tracing::debug!(batch_id = %batch.batch_id, segments = index.segments.len(), "Batch interpreted");
        Ok(())
    }

    async fn expand_and_assign(
        &self,
        batch: &BatchRow,
        index: &VlmIndex,
    ) -> Result<(), PipelineError> {
        let inserted = self.expander.expand_batch(batch, index).await?;
        tracing::debug!(batch_id = %batch.batch_id, nodes = inserted.len(), "Nodes expanded");
        self.assigner.assign_for_batch(&batch.batch_id).await?;
        Ok(())
    }

    async fn fail_batch(
        &self,
        batch: &BatchRow,
        attempts: i64,
        err: &PipelineError,
    ) -> Result<(), PipelineError> {
        let code = match err {
            PipelineError::Ai(ai) => ai.code(),
            _ => "INTERNAL".to_string(),
        };
        tracing::warn!(batch_id = %batch.batch_id, attempts, code = %code, error = %err, "Batch failed");

        let next_run_at =
            batches::mark_failed(self.db.pool(), batch.id, attempts, &err.to_string(), &code)
                .await?;
        let permanent = next_run_at.is_none();
        screenshots::mark_vlm_failed(self.db.pool(), &batch.shot_ids(), permanent, next_run_at)
            .await?;
        Ok(())
    }
}

/// Build the structured-generation prompt for one shard
fn build_prompt(batch: &BatchRow, shard: &[LoadedShot]) -> String {
    let mut prompt = String::from(
        "You are a screen-understanding engine. Interpret the attached screenshots \
         (ordered, ids 0-based) and return ONE JSON object with fields `segments`, \
         `entities`, and `screenshots` (one report per input image, `screen_id` matching \
         input order). Segments group contiguous screenshots describing one activity, \
         with `title`, `summary`, `confidence`, `importance`, `keywords`, optional \
         derived `knowledge`/`state`/`procedure`/`plan` items (procedures need `steps`), \
         and an optional `merge_hint` ({\"decision\": \"NEW\"|\"MERGE\", \"thread_id\"}). \
         Replace any visible secrets, passwords, or tokens with ***.\n\n",
    );

    prompt.push_str("Screenshots:\n");
    for (i, shot) in shard.iter().enumerate() {
        prompt.push_str(&format!(
            "- id {i}: source {} at {}{}\n",
            shot.row.source_key,
            shot.row.ts_ms,
            shot.row
                .window_title
                .as_deref()
                .map(|t| format!(", window \"{t}\""))
                .unwrap_or_default()
        ));
    }

    if let Some(ref pack) = batch.history_pack {
        prompt.push_str("\nRecent activity threads for continuity:\n");
        prompt.push_str(pack);
        prompt.push('\n');
    }

    prompt
}
