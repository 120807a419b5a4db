//! HTTP API layer
//!
//! The UI-facing request/response surface (under `/api`) plus the loopback
//! monitoring endpoint with its event stream and embedded dashboard.

pub mod monitoring;
pub mod routes;
pub mod server;
pub mod types;

pub use server::ApiServer;

use std::sync::Arc;

use tokio::sync::watch;

use crate::data::sqlite::SqliteService;
use crate::data::topics::EventBus;
use crate::domain::activity::{ActivityService, DetailsGenerator};
use crate::domain::ai::AiRuntime;
use crate::domain::ai::trace::TraceRecorder;
use crate::domain::ai::usage::UsageRecorder;
use crate::domain::capture::CaptureService;
use crate::domain::pipeline::ReconcileLoop;
use crate::domain::search::SearchService;

/// Shared state for all API handlers
#[derive(Clone)]
pub struct ApiState {
    pub db: Arc<SqliteService>,
    pub bus: Arc<EventBus>,
    pub runtime: Arc<AiRuntime>,
    pub capture: Arc<CaptureService>,
    pub search: Arc<SearchService>,
    pub activity: Arc<ActivityService>,
    pub details: Arc<DetailsGenerator>,
    pub reconcile: Arc<ReconcileLoop>,
    pub usage: Arc<UsageRecorder>,
    pub traces: Arc<TraceRecorder>,
    pub monitoring: Arc<monitoring::MonitoringServer>,
    pub shutdown_rx: watch::Receiver<bool>,
}
