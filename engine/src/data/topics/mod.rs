//! In-process typed event bus
//!
//! Broadcasts pipeline stage events to zero or more subscribers (SSE
//! endpoints, the monitoring stream, the capture scheduler). Delivery is
//! best-effort and non-blocking: a publish never waits on subscribers, and
//! a slow subscriber observes `Lagged` and continues from the latest events.

pub mod ring;

pub use ring::RingBuffer;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::utils::time::now_ms;

/// Broadcast channel capacity per topic
const TOPIC_CAPACITY: usize = 1_024;

/// Recent activity alerts retained for monitoring init snapshots
const ALERT_BUFFER_CAPACITY: usize = 100;

// =============================================================================
// Event Types
// =============================================================================

/// Periodic engine metrics snapshot
#[derive(Debug, Clone, Serialize)]
pub struct MetricsEvent {
    pub at_ms: i64,
    pub frames_captured: u64,
    pub frames_deduplicated: u64,
    pub batches_completed: u64,
    pub nodes_created: u64,
    pub vlm_limit: u32,
    pub text_limit: u32,
    pub embedding_limit: u32,
}

/// Durable queue depths, published each reconcile tick
#[derive(Debug, Clone, Serialize)]
pub struct QueueStatusEvent {
    pub at_ms: i64,
    pub pending_batches: i64,
    pub pending_merges: i64,
    pub pending_embeddings: i64,
    pub pending_indexes: i64,
    pub pending_summaries: i64,
}

/// A failed AI call
#[derive(Debug, Clone, Serialize)]
pub struct AiErrorEvent {
    pub at_ms: i64,
    pub capability: String,
    pub operation: String,
    pub code: String,
    pub message: String,
}

/// A completed AI call (success or failure)
#[derive(Debug, Clone, Serialize)]
pub struct AiRequestEvent {
    pub at_ms: i64,
    pub capability: String,
    pub operation: String,
    pub model: String,
    pub status: String,
    pub duration_ms: i64,
}

/// Kinds of operational alerts surfaced to the UI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    VlmTimeout,
    SemaphoreWait,
    BreakerOpen,
    BreakerClosed,
    EventDetailsTimeout,
    EventDetailsStuckRunning,
    FtsDegraded,
}

/// An operational alert
#[derive(Debug, Clone, Serialize)]
pub struct ActivityAlert {
    pub at_ms: i64,
    pub kind: AlertKind,
    pub message: String,
}

/// A pipeline stage transition (for the monitoring dashboard)
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStageEvent {
    pub at_ms: i64,
    pub stage: String,
    pub detail: String,
}

/// Backpressure level change
#[derive(Debug, Clone, Serialize)]
pub struct BackpressureEvent {
    pub at_ms: i64,
    pub level: String,
    pub interval_multiplier: f64,
    pub phash_threshold: u32,
}

/// Capture state change pushed to the UI
#[derive(Debug, Clone, Serialize)]
pub struct CaptureStateEvent {
    pub at_ms: i64,
    pub status: String,
    pub capturing_now: bool,
}

/// Debounced activity-timeline change notification
#[derive(Debug, Clone, Serialize)]
pub struct TimelineChangedEvent {
    pub revision: u64,
    pub from_ts: i64,
    pub to_ts: i64,
}

// =============================================================================
// Event Bus
// =============================================================================

/// Process-wide typed event bus
#[derive(Debug)]
pub struct EventBus {
    metrics: broadcast::Sender<MetricsEvent>,
    queue: broadcast::Sender<QueueStatusEvent>,
    ai_error: broadcast::Sender<AiErrorEvent>,
    ai_request: broadcast::Sender<AiRequestEvent>,
    activity_alert: broadcast::Sender<ActivityAlert>,
    pipeline_stage: broadcast::Sender<PipelineStageEvent>,
    backpressure: broadcast::Sender<BackpressureEvent>,
    capture_state: broadcast::Sender<CaptureStateEvent>,
    timeline_changed: broadcast::Sender<TimelineChangedEvent>,
    /// Recent alerts, kept for monitoring init snapshots
    recent_alerts: Mutex<RingBuffer<ActivityAlert>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

macro_rules! topic_accessors {
    ($field:ident, $publish:ident, $subscribe:ident, $ty:ty) => {
        pub fn $publish(&self, event: $ty) {
            let _ = self.$field.send(event);
        }

        pub fn $subscribe(&self) -> broadcast::Receiver<$ty> {
            self.$field.subscribe()
        }
    };
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            metrics: broadcast::channel(TOPIC_CAPACITY).0,
            queue: broadcast::channel(TOPIC_CAPACITY).0,
            ai_error: broadcast::channel(TOPIC_CAPACITY).0,
            ai_request: broadcast::channel(TOPIC_CAPACITY).0,
            activity_alert: broadcast::channel(TOPIC_CAPACITY).0,
            pipeline_stage: broadcast::channel(TOPIC_CAPACITY).0,
            backpressure: broadcast::channel(TOPIC_CAPACITY).0,
            capture_state: broadcast::channel(TOPIC_CAPACITY).0,
            timeline_changed: broadcast::channel(TOPIC_CAPACITY).0,
            recent_alerts: Mutex::new(RingBuffer::new(ALERT_BUFFER_CAPACITY)),
        }
    }

    topic_accessors!(metrics, publish_metrics, subscribe_metrics, MetricsEvent);
    topic_accessors!(queue, publish_queue, subscribe_queue, QueueStatusEvent);
    topic_accessors!(ai_error, publish_ai_error, subscribe_ai_error, AiErrorEvent);
    topic_accessors!(
        ai_request,
        publish_ai_request,
        subscribe_ai_request,
        AiRequestEvent
    );
    topic_accessors!(
        pipeline_stage,
        publish_pipeline_stage,
        subscribe_pipeline_stage,
        PipelineStageEvent
    );
    topic_accessors!(
        backpressure,
        publish_backpressure,
        subscribe_backpressure,
        BackpressureEvent
    );
    topic_accessors!(
        capture_state,
        publish_capture_state,
        subscribe_capture_state,
        CaptureStateEvent
    );
    topic_accessors!(
        timeline_changed,
        publish_timeline_changed,
        subscribe_timeline_changed,
        TimelineChangedEvent
    );

    /// Publish an alert and retain it in the bounded alert buffer
    pub fn alert(&self, kind: AlertKind, message: impl Into<String>) {
        let alert = ActivityAlert {
            at_ms: now_ms(),
            kind,
            message: message.into(),
        };
        self.recent_alerts.lock().push(alert.clone());
        let _ = self.activity_alert.send(alert);
    }

    pub fn subscribe_alerts(&self) -> broadcast::Receiver<ActivityAlert> {
        self.activity_alert.subscribe()
    }

    /// Snapshot of recent alerts, newest first
    pub fn recent_alerts(&self, n: usize) -> Vec<ActivityAlert> {
        self.recent_alerts
            .lock()
            .recent(n)
            .into_iter()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_without_subscribers_does_not_block() {
        let bus = EventBus::new();
        // No subscribers: send fails silently, publish must not panic
        bus.publish_queue(QueueStatusEvent {
            at_ms: 0,
            pending_batches: 1,
            pending_merges: 0,
            pending_embeddings: 0,
            pending_indexes: 0,
            pending_summaries: 0,
        });
    }

    #[tokio::test]
    async fn test_subscriber_receives_event() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe_capture_state();
        bus.publish_capture_state(CaptureStateEvent {
            at_ms: 1,
            status: "running".to_string(),
            capturing_now: true,
        });
        let event = rx.recv().await.unwrap();
        assert_eq!(event.status, "running");
        assert!(event.capturing_now);
    }

    #[tokio::test]
    async fn test_alert_buffer_retains_recent() {
        let bus = EventBus::new();
        bus.alert(AlertKind::VlmTimeout, "first");
        bus.alert(AlertKind::SemaphoreWait, "second");
        let recent = bus.recent_alerts(10);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].message, "second");
        assert_eq!(recent[1].message, "first");
    }
}
