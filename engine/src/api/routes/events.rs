//! UI push events
//!
//! One SSE channel carrying `state_changed` (capture) and
//! `timeline_changed` (activity) events, plus the monitoring dashboard
//! opener.

use std::convert::Infallible;
use std::time::Duration;

use axum::Json;
use axum::extract::State;
use axum::response::sse::{Event, Sse};
use futures::stream::Stream;
use serde::Serialize;

use crate::api::ApiState;
use crate::api::types::{ApiError, Envelope, ok};

pub async fn sse(
    State(state): State<ApiState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut capture_rx = state.bus.subscribe_capture_state();
    let mut timeline_rx = state.bus.subscribe_timeline_changed();
    let mut shutdown_rx = state.shutdown_rx.clone();

    let stream = async_stream::stream! {
        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        yield Ok(Event::default().event("terminate").data("shutdown"));
                        break;
                    }
                }
                result = capture_rx.recv() => {
                    match result {
                        Ok(event) => {
                            if let Ok(data) = serde_json::to_string(&event) {
                                yield Ok(Event::default().event("state_changed").data(data));
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            tracing::warn!(lagged = n, "Capture event subscriber lagged");
                        }
                        Err(_) => break,
                    }
                }
                result = timeline_rx.recv() => {
                    match result {
                        Ok(event) => {
                            if let Ok(data) = serde_json::to_string(&event) {
                                yield Ok(Event::default().event("timeline_changed").data(data));
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            tracing::warn!(lagged = n, "Timeline event subscriber lagged");
                        }
                        Err(_) => break,
                    }
                }
            }
        }
    };

    Sse::new(stream).keep_alive(
        axum::response::sse::KeepAlive::new()
            .interval(Duration::from_secs(30))
            .text("keep-alive"),
    )
}

#[derive(Debug, Serialize)]
pub struct DashboardInfo {
    pub url: String,
}

/// Start the loopback monitoring listener on demand and return its URL
pub async fn open_dashboard(
    State(state): State<ApiState>,
) -> Result<Json<Envelope<DashboardInfo>>, ApiError> {
    let url = state
        .monitoring
        .ensure_started()
        .await
        .map_err(|e| ApiError::service_unavailable(e.to_string()))?;
    Ok(ok(DashboardInfo { url }))
}
