//! Full-text search health and keyword queries
//!
//! The FTS5 mirror is checked on boot; corruption triggers a rebuild from
//! the screenshots table, and repeated failure degrades keyword search to a
//! `LIKE` scan while surfacing a degraded health status.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::data::sqlite::{SqliteError, SqliteService};
use crate::data::topics::{AlertKind, EventBus};

/// One keyword hit over screenshot text
#[derive(Debug, Clone)]
pub struct KeywordHit {
    pub screenshot_id: i64,
    pub score: f64,
}

/// FTS mirror health manager
pub struct FtsService {
    db: Arc<SqliteService>,
    bus: Arc<EventBus>,
    degraded: AtomicBool,
}

impl FtsService {
    pub fn new(db: Arc<SqliteService>, bus: Arc<EventBus>) -> Arc<Self> {
        Arc::new(Self {
            db,
            bus,
            degraded: AtomicBool::new(false),
        })
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    /// Boot-time health check: integrity check, rebuild on failure,
    /// degrade on repeated failure.
    pub async fn ensure_health(&self) -> Result<(), SqliteError> {
        if self.integrity_check().await {
            tracing::debug!("FTS integrity check passed");
            return Ok(());
        }

        tracing::warn!("FTS integrity check failed, rebuilding");
        if let Err(e) = self.rebuild().await {
            tracing::error!(error = %e, "FTS rebuild failed");
        }

        if self.integrity_check().await {
            tracing::info!("FTS mirror rebuilt");
            return Ok(());
        }

        self.degraded.store(true, Ordering::SeqCst);
        self.bus.alert(
            AlertKind::FtsDegraded,
            "full-text index corrupt; keyword search degraded to LIKE scans",
        );
        Ok(())
    }

    async fn integrity_check(&self) -> bool {
        sqlx::query("INSERT INTO screenshots_fts(screenshots_fts) VALUES('integrity-check')")
            .execute(self.db.pool())
            .await
            .is_ok()
    }

    /// Repopulate the mirror from the screenshots table
    pub async fn rebuild(&self) -> Result<(), SqliteError> {
        let mut tx = self.db.pool().begin().await?;
        sqlx::query("DELETE FROM screenshots_fts")
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT INTO screenshots_fts (rowid, ocr_text, ui_text_snippets, window_title) \
             SELECT id, COALESCE(ocr_text, ''), COALESCE(ui_text_snippets, ''), COALESCE(window_title, '') \
             FROM screenshots",
        )
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Keyword search: FTS5 MATCH with LIKE fallback when degraded or when
    /// the match query errors out.
    pub async fn keyword_search(
        &self,
        query: &str,
        limit: u32,
    ) -> Result<Vec<KeywordHit>, SqliteError> {
        if !self.is_degraded() {
            match self.match_search(query, limit).await {
                Ok(hits) => return Ok(hits),
                Err(e) => {
                    tracing::warn!(error = %e, "FTS match failed, falling back to LIKE");
                }
            }
        }
        self.like_search(query, limit).await
    }

    async fn match_search(&self, query: &str, limit: u32) -> Result<Vec<KeywordHit>, SqliteError> {
        let match_expr = sanitize_match_query(query);
        if match_expr.is_empty() {
            return Ok(Vec::new());
        }
        let rows: Vec<(i64, f64)> = sqlx::query_as(
            "SELECT rowid, rank FROM screenshots_fts WHERE screenshots_fts MATCH ? \
             ORDER BY rank LIMIT ?",
        )
        .bind(&match_expr)
        .bind(limit)
        .fetch_all(self.db.pool())
        .await?;
        // FTS5 rank is negative (more negative = better); normalize to
        // a positive descending score
        Ok(rows
            .into_iter()
            .map(|(screenshot_id, rank)| KeywordHit {
                screenshot_id,
                score: -rank,
            })
            .collect())
    }

    async fn like_search(&self, query: &str, limit: u32) -> Result<Vec<KeywordHit>, SqliteError> {
        let pattern = format!("%{}%", query.replace(['%', '_'], " "));
        let rows: Vec<(i64,)> = sqlx::query_as(
            "SELECT id FROM screenshots \
             WHERE ocr_text LIKE ?1 OR ui_text_snippets LIKE ?1 OR window_title LIKE ?1 \
             ORDER BY ts_ms DESC LIMIT ?2",
        )
        .bind(&pattern)
        .bind(limit)
        .fetch_all(self.db.pool())
        .await?;
        Ok(rows
            .into_iter()
            .map(|(screenshot_id,)| KeywordHit {
                screenshot_id,
                score: 1.0,
            })
            .collect())
    }
}

/// Quote each term so user input cannot inject FTS5 operators
fn sanitize_match_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(|term| term.replace('"', ""))
        .filter(|term| !term.is_empty())
        .map(|term| format!("\"{term}\""))
        .collect::<Vec<_>>()
        .join(" ")
}
