//! API route modules

pub mod activity;
pub mod capture;
pub mod context;
pub mod events;
pub mod threads;

use axum::Router;
use axum::routing::{get, post};

use super::ApiState;

/// Assemble the `/api` router
pub fn router() -> Router<ApiState> {
    Router::new()
        // Capture controls
        .route("/capture/start", post(capture::start))
        .route("/capture/stop", post(capture::stop))
        .route("/capture/pause", post(capture::pause))
        .route("/capture/resume", post(capture::resume))
        .route("/capture/state", get(capture::state))
        // Context graph
        .route("/context/search", post(context::search))
        .route("/context/search/cancel", post(context::search_cancel))
        .route("/context/threads/{thread_id}", get(context::get_thread))
        .route("/context/evidence", post(context::get_evidence))
        // Activity timeline
        .route("/activity/timeline", get(activity::get_timeline))
        .route("/activity/summary", get(activity::get_summary))
        .route(
            "/activity/summary/regenerate",
            post(activity::regenerate_summary),
        )
        .route(
            "/activity/events/{event_id}/details",
            get(activity::get_event_details),
        )
        // Threads
        .route("/threads", get(threads::list))
        .route("/threads/lens", get(threads::lens_state))
        .route("/threads/candidates", get(threads::candidates))
        .route("/threads/{thread_id}", get(threads::get))
        .route("/threads/{thread_id}/brief", get(threads::brief))
        .route("/threads/{thread_id}/pin", post(threads::pin))
        .route("/threads/{thread_id}/unpin", post(threads::unpin))
        .route(
            "/threads/{thread_id}/mark-inactive",
            post(threads::mark_inactive),
        )
        // Push events
        .route("/events", get(events::sse))
        // Monitoring
        .route("/monitoring/dashboard", post(events::open_dashboard))
}
