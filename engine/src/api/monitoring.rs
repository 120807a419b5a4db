//! Loopback monitoring endpoint
//!
//! Disabled by default; started on explicit request. Binds loopback only,
//! probing ports upward from a fixed base, and serves the embedded
//! dashboard plus a unidirectional event stream with message types
//! `metrics`, `queue`, `ai_error`, `ai_request`, `health`,
//! `activity_alert`, and an `init` snapshot on connect.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use axum::Router;
use axum::extract::State;
use axum::http::header;
use axum::response::sse::{Event, Sse};
use axum::response::{Html, IntoResponse};
use axum::routing::get;
use futures::stream::Stream;
use rust_embed::RustEmbed;
use serde_json::json;
use tokio::sync::{Mutex, watch};

use crate::core::constants::{MONITORING_BASE_PORT, MONITORING_PORT_PROBE_LIMIT};
use crate::data::sqlite::SqliteService;
use crate::data::topics::EventBus;
use crate::domain::ai::trace::TraceRecorder;
use crate::domain::ai::usage::UsageRecorder;
use crate::domain::ai::{AiRuntime, Capability};
use crate::utils::time::now_ms;

/// Health snapshot interval on the event stream (seconds)
const HEALTH_INTERVAL_SECS: u64 = 5;

#[derive(RustEmbed)]
#[folder = "dashboard/"]
struct DashboardAssets;

#[derive(Clone)]
struct MonitoringState {
    db: Arc<SqliteService>,
    bus: Arc<EventBus>,
    runtime: Arc<AiRuntime>,
    usage: Arc<UsageRecorder>,
    traces: Arc<TraceRecorder>,
    shutdown_rx: watch::Receiver<bool>,
}

/// On-demand monitoring listener
pub struct MonitoringServer {
    state: MonitoringState,
    started: Mutex<Option<String>>,
}

impl MonitoringServer {
    pub fn new(
        db: Arc<SqliteService>,
        bus: Arc<EventBus>,
        runtime: Arc<AiRuntime>,
        usage: Arc<UsageRecorder>,
        traces: Arc<TraceRecorder>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            state: MonitoringState {
                db,
                bus,
                runtime,
                usage,
                traces,
                shutdown_rx,
            },
            started: Mutex::new(None),
        })
    }

    /// Start the listener if it isn't running; returns the dashboard URL
    pub async fn ensure_started(&self) -> Result<String> {
        let mut started = self.started.lock().await;
        if let Some(ref url) = *started {
            return Ok(url.clone());
        }

        let listener = self.probe_port().await?;
        let addr = listener.local_addr().context("monitoring listener addr")?;
        let url = format!("http://{addr}");

        let router = Router::new()
            .route("/", get(dashboard))
            .route("/events", get(events))
            .with_state(self.state.clone());

        let mut shutdown_rx = self.state.shutdown_rx.clone();
        tokio::spawn(async move {
            let result = axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.wait_for(|&v| v).await;
                })
                .await;
            if let Err(e) = result {
                tracing::error!(error = %e, "Monitoring server error");
            }
        });

        tracing::info!(url = %url, "Monitoring endpoint started");
        *started = Some(url.clone());
        Ok(url)
    }

    async fn probe_port(&self) -> Result<tokio::net::TcpListener> {
        for offset in 0..MONITORING_PORT_PROBE_LIMIT {
            let port = MONITORING_BASE_PORT + offset;
            match tokio::net::TcpListener::bind(("127.0.0.1", port)).await {
                Ok(listener) => return Ok(listener),
                Err(e) => {
                    tracing::debug!(port, error = %e, "Monitoring port busy, probing next");
                }
            }
        }
        bail!(
            "no free monitoring port in {}..{}",
            MONITORING_BASE_PORT,
            MONITORING_BASE_PORT + MONITORING_PORT_PROBE_LIMIT
        );
    }
}

async fn dashboard() -> impl IntoResponse {
    match DashboardAssets::get("index.html") {
        Some(asset) => Html(asset.data.into_owned()).into_response(),
        None => (
            axum::http::StatusCode::NOT_FOUND,
            [(header::CONTENT_TYPE, "text/plain")],
            "dashboard asset missing",
        )
            .into_response(),
    }
}

async fn events(
    State(state): State<MonitoringState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut metrics_rx = state.bus.subscribe_metrics();
    let mut queue_rx = state.bus.subscribe_queue();
    let mut ai_error_rx = state.bus.subscribe_ai_error();
    let mut ai_request_rx = state.bus.subscribe_ai_request();
    let mut alert_rx = state.bus.subscribe_alerts();
    let mut shutdown_rx = state.shutdown_rx.clone();

    let stream = async_stream::stream! {
        // Init snapshot: current limits, breaker states, recent alerts and
        // traces, last hour of usage
        let now = now_ms();
        let init = json!({
            "limits": {
                "vlm": state.runtime.get_limit(Capability::Vlm),
                "text": state.runtime.get_limit(Capability::Text),
                "embedding": state.runtime.get_limit(Capability::Embedding),
            },
            "breakers": {
                "vlm": state.runtime.breaker_state(Capability::Vlm),
                "text": state.runtime.breaker_state(Capability::Text),
                "embedding": state.runtime.breaker_state(Capability::Embedding),
            },
            "recent_alerts": state.bus.recent_alerts(20),
            "recent_requests": state.traces.recent(50),
            "usage": state.usage.breakdown(now - 60 * 60 * 1000, now).await,
        });
        if let Ok(data) = serde_json::to_string(&init) {
            yield Ok(Event::default().event("init").data(data));
        }

        let mut health_interval = tokio::time::interval(Duration::from_secs(HEALTH_INTERVAL_SECS));

        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
                result = metrics_rx.recv() => {
                    if let Some(event) = sse_json("metrics", result) { yield Ok(event); }
                }
                result = queue_rx.recv() => {
                    if let Some(event) = sse_json("queue", result) { yield Ok(event); }
                }
                result = ai_error_rx.recv() => {
                    if let Some(event) = sse_json("ai_error", result) { yield Ok(event); }
                }
                result = ai_request_rx.recv() => {
                    if let Some(event) = sse_json("ai_request", result) { yield Ok(event); }
                }
                result = alert_rx.recv() => {
                    if let Some(event) = sse_json("activity_alert", result) { yield Ok(event); }
                }
                _ = health_interval.tick() => {
                    let health = json!({
                        "at_ms": now_ms(),
                        "db_open": !state.db.pool().is_closed(),
                        "breakers": {
                            "vlm": state.runtime.breaker_state(Capability::Vlm),
                            "text": state.runtime.breaker_state(Capability::Text),
                            "embedding": state.runtime.breaker_state(Capability::Embedding),
                        },
                        "in_flight": {
                            "vlm": state.runtime.in_flight(Capability::Vlm),
                            "text": state.runtime.in_flight(Capability::Text),
                            "embedding": state.runtime.in_flight(Capability::Embedding),
                        },
                    });
                    if let Ok(data) = serde_json::to_string(&health) {
                        yield Ok(Event::default().event("health").data(data));
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

/// Serialize one broadcast result into an SSE event, tolerating lag
fn sse_json<T: serde::Serialize>(
    name: &'static str,
    result: Result<T, tokio::sync::broadcast::error::RecvError>,
) -> Option<Event> {
    match result {
        Ok(payload) => serde_json::to_string(&payload)
            .ok()
            .map(|data| Event::default().event(name).data(data)),
        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
            tracing::debug!(stream = name, lagged = n, "Monitoring subscriber lagged");
            None
        }
        Err(_) => None,
    }
}
