//! Thread endpoints

use axum::Json;
use axum::extract::{Path, State};
use serde::Serialize;

use crate::api::ApiState;
use crate::api::types::{ApiError, Envelope, ok};
use crate::data::sqlite::repositories::{nodes, settings, threads};
use crate::data::types::ThreadRow;
use crate::utils::json::parse_string_vec;

/// Threads returned by list/candidate queries
const THREAD_LIST_LIMIT: i64 = 50;

/// Recent nodes included in a brief
const BRIEF_NODE_LIMIT: i64 = 10;

pub async fn list(State(state): State<ApiState>) -> Result<Json<Envelope<Vec<ThreadRow>>>, ApiError> {
    let rows = threads::list(state.db.pool(), THREAD_LIST_LIMIT)
        .await
        .map_err(ApiError::from_sqlite)?;
    Ok(ok(rows))
}

pub async fn candidates(
    State(state): State<ApiState>,
) -> Result<Json<Envelope<Vec<ThreadRow>>>, ApiError> {
    let rows = threads::active_recent(state.db.pool(), THREAD_LIST_LIMIT)
        .await
        .map_err(ApiError::from_sqlite)?;
    Ok(ok(rows))
}

#[derive(Debug, Serialize)]
pub struct LensState {
    pub pinned: Option<ThreadRow>,
    pub active: Vec<ThreadRow>,
}

/// The lens: the pinned thread (if any) plus the active candidates
pub async fn lens_state(
    State(state): State<ApiState>,
) -> Result<Json<Envelope<LensState>>, ApiError> {
    let row = settings::get(state.db.pool())
        .await
        .map_err(ApiError::from_sqlite)?;
    let pinned = match row.pinned_thread_id {
        Some(ref id) => threads::get(state.db.pool(), id)
            .await
            .map_err(ApiError::from_sqlite)?,
        None => None,
    };
    let active = threads::active_recent(state.db.pool(), THREAD_LIST_LIMIT)
        .await
        .map_err(ApiError::from_sqlite)?;
    Ok(ok(LensState { pinned, active }))
}

pub async fn get(
    State(state): State<ApiState>,
    Path(thread_id): Path<String>,
) -> Result<Json<Envelope<ThreadRow>>, ApiError> {
    let thread = require_thread(&state, &thread_id).await?;
    Ok(ok(thread))
}

#[derive(Debug, Serialize)]
pub struct ThreadBrief {
    pub id: String,
    pub title: String,
    pub summary: Option<String>,
    pub current_phase: Option<String>,
    pub current_focus: Option<String>,
    pub status: String,
    pub duration_ms: i64,
    pub node_count: i64,
    pub key_entities: Vec<String>,
    pub milestones: Vec<String>,
    pub recent_titles: Vec<String>,
}

pub async fn brief(
    State(state): State<ApiState>,
    Path(thread_id): Path<String>,
) -> Result<Json<Envelope<ThreadBrief>>, ApiError> {
    let thread = require_thread(&state, &thread_id).await?;
    let recent = nodes::recent_for_thread(state.db.pool(), &thread_id, BRIEF_NODE_LIMIT)
        .await
        .map_err(ApiError::from_sqlite)?;

    Ok(ok(ThreadBrief {
        id: thread.id,
        title: thread.title,
        summary: thread.summary,
        current_phase: thread.current_phase,
        current_focus: thread.current_focus,
        status: match thread.status {
            crate::data::types::ThreadStatus::Active => "active".to_string(),
            crate::data::types::ThreadStatus::Inactive => "inactive".to_string(),
        },
        duration_ms: thread.duration_ms,
        node_count: thread.node_count,
        key_entities: parse_string_vec(thread.key_entities.as_deref()),
        milestones: parse_string_vec(thread.milestones.as_deref()),
        recent_titles: recent.into_iter().map(|n| n.title).collect(),
    }))
}

pub async fn pin(
    State(state): State<ApiState>,
    Path(thread_id): Path<String>,
) -> Result<Json<Envelope<bool>>, ApiError> {
    require_thread(&state, &thread_id).await?;
    settings::set_pinned_thread(state.db.pool(), Some(&thread_id))
        .await
        .map_err(ApiError::from_sqlite)?;
    Ok(ok(true))
}

pub async fn unpin(
    State(state): State<ApiState>,
    Path(_thread_id): Path<String>,
) -> Result<Json<Envelope<bool>>, ApiError> {
    settings::set_pinned_thread(state.db.pool(), None)
        .await
        .map_err(ApiError::from_sqlite)?;
    Ok(ok(true))
}

pub async fn mark_inactive(
    State(state): State<ApiState>,
    Path(thread_id): Path<String>,
) -> Result<Json<Envelope<bool>>, ApiError> {
    require_thread(&state, &thread_id).await?;
    let changed = threads::mark_inactive(state.db.pool(), &thread_id)
        .await
        .map_err(ApiError::from_sqlite)?;
    Ok(ok(changed))
}

async fn require_thread(state: &ApiState, thread_id: &str) -> Result<ThreadRow, ApiError> {
    threads::get(state.db.pool(), thread_id)
        .await
        .map_err(ApiError::from_sqlite)?
        .ok_or_else(|| ApiError::not_found("THREAD_NOT_FOUND", format!("thread {thread_id}")))
}
