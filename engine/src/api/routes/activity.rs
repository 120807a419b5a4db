//! Activity timeline endpoints

use axum::Json;
use axum::extract::{Path, Query, State};
use serde::{Deserialize, Serialize};

use crate::api::ApiState;
use crate::api::types::{ApiError, Envelope, ok};
use crate::core::constants::ACTIVITY_WINDOW_MS;
use crate::domain::activity::{Timeline, TimelineWindow};

/// Longest timeline range served in one request (7 days)
const MAX_TIMELINE_RANGE_MS: i64 = 7 * 24 * 60 * 60 * 1000;

#[derive(Debug, Deserialize)]
pub struct TimelineQuery {
    pub from_ts: i64,
    pub to_ts: i64,
}

pub async fn get_timeline(
    State(state): State<ApiState>,
    Query(query): Query<TimelineQuery>,
) -> Result<Json<Envelope<Timeline>>, ApiError> {
    if query.from_ts >= query.to_ts {
        return Err(ApiError::bad_request(
            "INVALID_RANGE",
            "from_ts must be before to_ts",
        ));
    }
    if query.to_ts - query.from_ts > MAX_TIMELINE_RANGE_MS {
        return Err(ApiError::bad_request(
            "RANGE_TOO_LARGE",
            "timeline range exceeds 7 days",
        ));
    }

    let timeline = state
        .activity
        .get_timeline(query.from_ts, query.to_ts)
        .await
        .map_err(ApiError::from_sqlite)?;
    Ok(ok(timeline))
}

#[derive(Debug, Deserialize)]
pub struct WindowQuery {
    pub window_start: i64,
    pub window_end: i64,
}

fn validate_window(query: &WindowQuery) -> Result<(), ApiError> {
    if query.window_end - query.window_start != ACTIVITY_WINDOW_MS
        || query.window_start % ACTIVITY_WINDOW_MS != 0
    {
        return Err(ApiError::bad_request(
            "INVALID_WINDOW",
            "window bounds must lie on the activity grid",
        ));
    }
    Ok(())
}

pub async fn get_summary(
    State(state): State<ApiState>,
    Query(query): Query<WindowQuery>,
) -> Result<Json<Envelope<Option<TimelineWindow>>>, ApiError> {
    validate_window(&query)?;
    let summary = state
        .activity
        .get_summary(query.window_start, query.window_end)
        .await
        .map_err(ApiError::from_sqlite)?;
    Ok(ok(summary))
}

#[derive(Debug, Serialize)]
pub struct RegenerateResponse {
    pub queued: bool,
}

pub async fn regenerate_summary(
    State(state): State<ApiState>,
    Query(query): Query<WindowQuery>,
) -> Result<Json<Envelope<RegenerateResponse>>, ApiError> {
    validate_window(&query)?;
    let queued = state
        .activity
        .regenerate_summary(query.window_start, query.window_end)
        .await
        .map_err(ApiError::from_sqlite)?;
    if queued {
        // Pull the reconcile loop forward instead of waiting for its timer
        state.reconcile.wake();
    }
    Ok(ok(RegenerateResponse { queued }))
}

#[derive(Debug, Serialize)]
pub struct EventDetails {
    pub event_id: i64,
    pub details_status: Option<String>,
    pub details_text: Option<String>,
}

pub async fn get_event_details(
    State(state): State<ApiState>,
    Path(event_id): Path<i64>,
) -> Result<Json<Envelope<EventDetails>>, ApiError> {
    let event = state
        .details
        .get_or_generate(event_id)
        .await
        .map_err(|e| match e {
            crate::domain::pipeline::PipelineError::Sqlite(
                crate::data::sqlite::SqliteError::NotFound(_),
            ) => ApiError::not_found("EVENT_NOT_FOUND", format!("event {event_id}")),
            other => ApiError::from_pipeline(other),
        })?;

    Ok(ok(EventDetails {
        event_id: event.id,
        details_status: event.details_status.map(|s| s.as_str().to_string()),
        details_text: event.details_text,
    }))
}
