//! Capture control endpoints

use axum::Json;
use axum::extract::State;
use serde::Serialize;

use crate::api::ApiState;
use crate::api::types::{ApiError, Envelope, ok};
use crate::data::sqlite::repositories::settings;
use crate::domain::capture::CaptureStatus;

#[derive(Debug, Serialize)]
pub struct CaptureState {
    pub status: String,
    pub capturing_now: bool,
}

fn current_state(state: &ApiState) -> CaptureState {
    CaptureState {
        status: state.capture.status().as_str().to_string(),
        capturing_now: state.capture.capturing_now(),
    }
}

async fn transition(
    state: &ApiState,
    status: CaptureStatus,
    persist_enabled: Option<bool>,
) -> Result<Json<Envelope<CaptureState>>, ApiError> {
    state.capture.set_status(status);
    if let Some(enabled) = persist_enabled {
        settings::set_capture_enabled(state.db.pool(), enabled)
            .await
            .map_err(ApiError::from_sqlite)?;
    }
    Ok(ok(current_state(state)))
}

pub async fn start(
    State(state): State<ApiState>,
) -> Result<Json<Envelope<CaptureState>>, ApiError> {
    transition(&state, CaptureStatus::Running, Some(true)).await
}

pub async fn stop(State(state): State<ApiState>) -> Result<Json<Envelope<CaptureState>>, ApiError> {
    transition(&state, CaptureStatus::Stopped, Some(false)).await
}

pub async fn pause(
    State(state): State<ApiState>,
) -> Result<Json<Envelope<CaptureState>>, ApiError> {
    transition(&state, CaptureStatus::Paused, None).await
}

pub async fn resume(
    State(state): State<ApiState>,
) -> Result<Json<Envelope<CaptureState>>, ApiError> {
    transition(&state, CaptureStatus::Running, None).await
}

pub async fn state(
    State(state): State<ApiState>,
) -> Result<Json<Envelope<CaptureState>>, ApiError> {
    Ok(ok(current_state(&state)))
}
