//! Context graph endpoints: search, thread reads, evidence

use axum::Json;
use axum::extract::{Path, State};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::api::ApiState;
use crate::api::types::{ApiError, Envelope, ok};
use crate::data::sqlite::repositories::{nodes, screenshots, threads};
use crate::data::types::{ContextNodeRow, ThreadRow};
use crate::domain::search::hybrid::SearchResult;
use crate::utils::string::truncate_preview;

/// Maximum node ids per evidence request
const MAX_EVIDENCE_NODES: usize = 100;

/// Nodes returned per thread read
const THREAD_NODE_LIMIT: i64 = 200;

#[derive(Debug, Deserialize, Validate)]
pub struct SearchRequest {
    #[validate(length(min = 1, max = 500))]
    pub query: String,
    /// Ask the text LLM for an answer over the retrieved context
    #[serde(default)]
    pub synthesize: bool,
}

pub async fn search(
    State(state): State<ApiState>,
    Json(request): Json<SearchRequest>,
) -> Result<Json<Envelope<SearchResult>>, ApiError> {
    request
        .validate()
        .map_err(|e| ApiError::bad_request("INVALID_QUERY", e.to_string()))?;

    let result = state
        .search
        .search(&request.query, request.synthesize)
        .await
        .map_err(ApiError::from_search)?;
    Ok(ok(result))
}

pub async fn search_cancel(
    State(state): State<ApiState>,
) -> Result<Json<Envelope<bool>>, ApiError> {
    state.search.cancel();
    Ok(ok(true))
}

/// A node with its evidence links, as returned by thread reads
#[derive(Debug, Serialize)]
pub struct ExpandedNode {
    pub id: i64,
    pub kind: String,
    pub title: String,
    pub summary: String,
    pub event_time: i64,
    pub importance: f64,
    pub confidence: f64,
    pub keywords: Vec<String>,
    pub entities: Vec<String>,
    pub screenshot_ids: Vec<i64>,
    pub merged_from_ids: Vec<i64>,
}

impl ExpandedNode {
    fn from_row(row: &ContextNodeRow) -> Self {
        Self {
            id: row.id,
            kind: row.kind.as_str().to_string(),
            title: row.title.clone(),
            summary: row.summary.clone(),
            event_time: row.event_time,
            importance: row.importance,
            confidence: row.confidence,
            keywords: row.keyword_list(),
            entities: row.entity_list(),
            screenshot_ids: row.shot_ids(),
            merged_from_ids: row.merged_from(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ThreadDetail {
    pub thread: ThreadRow,
    pub nodes: Vec<ExpandedNode>,
}

pub async fn get_thread(
    State(state): State<ApiState>,
    Path(thread_id): Path<String>,
) -> Result<Json<Envelope<ThreadDetail>>, ApiError> {
    let thread = threads::get(state.db.pool(), &thread_id)
        .await
        .map_err(ApiError::from_sqlite)?
        .ok_or_else(|| ApiError::not_found("THREAD_NOT_FOUND", format!("thread {thread_id}")))?;

    let rows = nodes::recent_for_thread(state.db.pool(), &thread_id, THREAD_NODE_LIMIT)
        .await
        .map_err(ApiError::from_sqlite)?;
    let nodes = rows.iter().map(ExpandedNode::from_row).collect();

    Ok(ok(ThreadDetail { thread, nodes }))
}

#[derive(Debug, Deserialize)]
pub struct EvidenceRequest {
    pub node_ids: Vec<i64>,
}

#[derive(Debug, Serialize)]
pub struct ScreenshotEvidence {
    pub screenshot_id: i64,
    pub node_id: i64,
    pub ts_ms: i64,
    pub source_key: String,
    pub app_hint: Option<String>,
    pub window_title: Option<String>,
    pub ocr_excerpt: Option<String>,
    /// Whether the capture file is still on disk
    pub file_available: bool,
    pub file_path: Option<String>,
}

pub async fn get_evidence(
    State(state): State<ApiState>,
    Json(request): Json<EvidenceRequest>,
) -> Result<Json<Envelope<Vec<ScreenshotEvidence>>>, ApiError> {
    if request.node_ids.is_empty() || request.node_ids.len() > MAX_EVIDENCE_NODES {
        return Err(ApiError::bad_request(
            "INVALID_NODE_IDS",
            format!("node_ids must contain 1..={MAX_EVIDENCE_NODES} ids"),
        ));
    }

    let node_rows = nodes::get_many(state.db.pool(), &request.node_ids)
        .await
        .map_err(ApiError::from_sqlite)?;

    let mut evidence = Vec::new();
    for node in &node_rows {
        let shots = screenshots::get_many(state.db.pool(), &node.shot_ids())
            .await
            .map_err(ApiError::from_sqlite)?;
        for shot in shots {
            evidence.push(ScreenshotEvidence {
                screenshot_id: shot.id,
                node_id: node.id,
                ts_ms: shot.ts_ms,
                source_key: shot.source_key,
                app_hint: shot.app_hint,
                window_title: shot.window_title,
                ocr_excerpt: shot.ocr_text.as_deref().map(|t| truncate_preview(t, 200)),
                file_available: shot.file_path.is_some(),
                file_path: shot.file_path,
            });
        }
    }

    Ok(ok(evidence))
}
