//! Batch builder
//!
//! Groups accepted screenshots per source into bounded batches and attaches
//! a history pack: a snapshot of recent threads and their nodes that gives
//! the VLM continuity context at interpretation time.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::core::constants::{BATCH_MAX_AGE_MS, BATCH_MAX_SHOTS, HISTORY_PACK_NODES_PER_THREAD,
    HISTORY_PACK_THREADS};
use crate::data::sqlite::{SqliteError, SqliteService};
use crate::data::sqlite::repositories::batches::{self, NewBatch};
use crate::data::sqlite::repositories::{nodes, screenshots, threads};
use crate::data::types::ScreenshotRow;
use crate::utils::time::now_ms;

/// Poll interval for batch formation (ms)
const BATCH_POLL_MS: u64 = 2_000;

/// Snapshot of one recent thread for the history pack
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryThread {
    pub id: String,
    pub title: String,
    pub current_phase: Option<String>,
    pub current_focus: Option<String>,
    pub recent_nodes: Vec<HistoryNode>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryNode {
    pub title: String,
    pub summary: String,
    pub kind: String,
    pub event_time: i64,
}

/// History pack attached to every batch at formation time
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistoryPack {
    pub threads: Vec<HistoryThread>,
}

/// Builds the history pack from the current graph
pub async fn build_history_pack(db: &SqliteService) -> Result<HistoryPack, SqliteError> {
    let recent = threads::active_recent(db.pool(), HISTORY_PACK_THREADS as i64).await?;
    let mut pack = HistoryPack::default();
    for thread in recent {
        let recent_nodes = nodes::recent_for_thread(
            db.pool(),
            &thread.id,
            HISTORY_PACK_NODES_PER_THREAD as i64,
        )
        .await?
        .into_iter()
        .map(|n| HistoryNode {
            title: n.title,
            summary: n.summary,
            kind: n.kind.as_str().to_string(),
            event_time: n.event_time,
        })
        .collect();
        pack.threads.push(HistoryThread {
            id: thread.id,
            title: thread.title,
            current_phase: thread.current_phase,
            current_focus: thread.current_focus,
            recent_nodes,
        });
    }
    Ok(pack)
}

/// Batch formation service
pub struct BatchBuilder {
    db: Arc<SqliteService>,
}

impl BatchBuilder {
    pub fn new(db: Arc<SqliteService>) -> Arc<Self> {
        Arc::new(Self { db })
    }

    /// Form batches from screenshots not yet claimed by any batch.
    ///
    /// Per source: full batches close immediately; a partial run closes once
    /// its oldest screenshot exceeds the age bound. Returns new batch ids.
    pub async fn form_due_batches(&self) -> Result<Vec<i64>, SqliteError> {
        let now = now_ms();
        let candidates = screenshots::orphans(self.db.pool(), now, 500).await?;
        if candidates.is_empty() {
            return Ok(Vec::new());
        }
        self.form_from(&candidates, now).await
    }

    /// Group already-fetched screenshots (ordered by source, timestamp) into
    /// batches. Shared with the reconcile loop's orphan sweep.
    pub async fn form_from(
        &self,
        shots: &[ScreenshotRow],
        now: i64,
    ) -> Result<Vec<i64>, SqliteError> {
        let mut created = Vec::new();

        let mut group: Vec<&ScreenshotRow> = Vec::new();
        for shot in shots {
            if let Some(first) = group.first()
                && first.source_key != shot.source_key
            {
                created.extend(self.form_group(&group, now).await?);
                group.clear();
            }
            group.push(shot);
        }
        created.extend(self.form_group(&group, now).await?);

        Ok(created)
    }

    async fn form_group(
        &self,
        group: &[&ScreenshotRow],
        now: i64,
    ) -> Result<Vec<i64>, SqliteError> {
        let mut created = Vec::new();
        let mut rest = group;

        // Full batches close immediately
        while rest.len() >= BATCH_MAX_SHOTS {
            let (chunk, tail) = rest.split_at(BATCH_MAX_SHOTS);
            created.push(self.insert_batch(chunk).await?);
            rest = tail;
        }

        // A partial run closes once its oldest member ages out
        if let Some(oldest) = rest.first()
            && now - oldest.ts_ms >= BATCH_MAX_AGE_MS
        {
            created.push(self.insert_batch(rest).await?);
        }

        Ok(created)
    }

    async fn insert_batch(&self, shots: &[&ScreenshotRow]) -> Result<i64, SqliteError> {
        let pack = build_history_pack(&self.db).await?;
        let batch = NewBatch {
            batch_id: cuid2::create_id(),
            source_key: shots[0].source_key.clone(),
            screenshot_ids: shots.iter().map(|s| s.id).collect(),
            ts_start: shots.first().map(|s| s.ts_ms).unwrap_or(0),
            ts_end: shots.last().map(|s| s.ts_ms).unwrap_or(0),
            history_pack: Some(serde_json::to_string(&pack)?),
        };
        let id = batches::insert_and_enqueue(self.db.pool(), &batch).await?;
        tracing::debug!(
            batch_id = %batch.batch_id,
            source = %batch.source_key,
            shots = batch.screenshot_ids.len(),
            "Batch formed"
        );
        Ok(id)
    }

    /// Periodic formation task
    pub fn start(self: &Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        let builder = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(BATCH_POLL_MS));
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            tracing::debug!("Batch builder shutting down");
                            break;
                        }
                    }
                    _ = interval.tick() => {
                        if let Err(e) = builder.form_due_batches().await {
                            tracing::warn!(error = %e, "Batch formation failed");
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::sqlite::repositories::screenshots::NewScreenshot;

    async fn seed_shot(db: &SqliteService, source: &str, ts: i64) -> i64 {
        screenshots::insert(
            db.pool(),
            &NewScreenshot {
                ts_ms: ts,
                source_key: source.to_string(),
                phash: ts,
                file_path: format!("/tmp/{source}-{ts}.png"),
                width: 100,
                height: 100,
                bytes: 10,
                mime: "image/png".to_string(),
                app_hint: None,
                window_title: None,
            },
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_full_batch_closes_immediately() {
        let db = Arc::new(SqliteService::init_in_memory().await.unwrap());
        let builder = BatchBuilder::new(Arc::clone(&db));
        let now = now_ms();
        for i in 0..BATCH_MAX_SHOTS as i64 {
            seed_shot(&db, "screen:1", now - 100 + i).await;
        }

        let created = builder.form_due_batches().await.unwrap();
        assert_eq!(created.len(), 1);

        let batch = batches::get(db.pool(), created[0]).await.unwrap().unwrap();
        assert_eq!(batch.shot_ids().len(), BATCH_MAX_SHOTS);

        // Membership invariant: every listed shot points back
        for shot_id in batch.shot_ids() {
            let shot = screenshots::get(db.pool(), shot_id).await.unwrap().unwrap();
            assert_eq!(shot.enqueued_batch_id.as_deref(), Some(batch.batch_id.as_str()));
        }
    }

    #[tokio::test]
    async fn test_partial_batch_waits_for_age() {
        let db = Arc::new(SqliteService::init_in_memory().await.unwrap());
        let builder = BatchBuilder::new(Arc::clone(&db));
        seed_shot(&db, "screen:1", now_ms()).await;

        // Fresh partial run: no batch yet
        assert!(builder.form_due_batches().await.unwrap().is_empty());

        // Aged partial run closes
        let db2 = Arc::new(SqliteService::init_in_memory().await.unwrap());
        let builder2 = BatchBuilder::new(Arc::clone(&db2));
        seed_shot(&db2, "screen:1", now_ms() - BATCH_MAX_AGE_MS - 1).await;
        assert_eq!(builder2.form_due_batches().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_sources_batch_separately() {
        let db = Arc::new(SqliteService::init_in_memory().await.unwrap());
        let builder = BatchBuilder::new(Arc::clone(&db));
        let old = now_ms() - BATCH_MAX_AGE_MS - 1;
        seed_shot(&db, "screen:1", old).await;
        seed_shot(&db, "screen:2", old + 1).await;

        let created = builder.form_due_batches().await.unwrap();
        assert_eq!(created.len(), 2);
        let a = batches::get(db.pool(), created[0]).await.unwrap().unwrap();
        let b = batches::get(db.pool(), created[1]).await.unwrap().unwrap();
        assert_ne!(a.source_key, b.source_key);
    }

    #[tokio::test]
    async fn test_history_pack_snapshots_recent_threads() {
        let db = Arc::new(SqliteService::init_in_memory().await.unwrap());
        let thread_id = threads::create(db.pool(), "Parser work", None, 0)
            .await
            .unwrap();
        let mut spec = nodes::test_node("b0", crate::data::types::NodeKind::Event, 50);
        spec.thread_id = Some(thread_id.clone());
        nodes::insert(db.pool(), &spec).await.unwrap();

        let pack = build_history_pack(&db).await.unwrap();
        assert_eq!(pack.threads.len(), 1);
        assert_eq!(pack.threads[0].id, thread_id);
        assert_eq!(pack.threads[0].recent_nodes.len(), 1);
    }
}
