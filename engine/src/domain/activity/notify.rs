//! Debounced timeline change notifications
//!
//! Mutations to summaries and events coalesce into a single
//! `activity-timeline:changed` event carrying a monotonically increasing
//! revision and the union of changed ranges, fired at most once per
//! debounce interval.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;

use crate::core::constants::TIMELINE_DEBOUNCE_MS;
use crate::data::topics::{EventBus, TimelineChangedEvent};

/// Coalescing notifier for timeline mutations
pub struct ActivityNotifier {
    bus: Arc<EventBus>,
    revision: AtomicU64,
    pending: Mutex<Option<(i64, i64)>>,
    kick: Notify,
}

impl ActivityNotifier {
    pub fn new(bus: Arc<EventBus>) -> Arc<Self> {
        Arc::new(Self {
            bus,
            revision: AtomicU64::new(0),
            pending: Mutex::new(None),
            kick: Notify::new(),
        })
    }

    /// Record a changed range; the debounce task folds it into the next fire
    pub fn mark_changed(&self, from_ts: i64, to_ts: i64) {
        {
            let mut pending = self.pending.lock();
            *pending = Some(match *pending {
                Some((f, t)) => (f.min(from_ts), t.max(to_ts)),
                None => (from_ts, to_ts),
            });
        }
        self.kick.notify_one();
    }

    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::SeqCst)
    }

    /// Fire a pending notification immediately (used by the debounce task
    /// and by tests)
    pub fn flush(&self) {
        let range = self.pending.lock().take();
        if let Some((from_ts, to_ts)) = range {
            let revision = self.revision.fetch_add(1, Ordering::SeqCst) + 1;
            self.bus.publish_timeline_changed(TimelineChangedEvent {
                revision,
                from_ts,
                to_ts,
            });
        }
    }

    /// Debounce task: at most one notification per interval
    pub fn start(self: &Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        let notifier = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            notifier.flush();
                            break;
                        }
                    }
                    _ = notifier.kick.notified() => {
                        tokio::time::sleep(Duration::from_millis(TIMELINE_DEBOUNCE_MS)).await;
                        notifier.flush();
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ranges_union_and_revision_increments() {
        let bus = Arc::new(EventBus::new());
        let mut rx = bus.subscribe_timeline_changed();
        let notifier = ActivityNotifier::new(Arc::clone(&bus));

        notifier.mark_changed(1000, 2000);
        notifier.mark_changed(500, 1500);
        notifier.flush();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.revision, 1);
        assert_eq!(event.from_ts, 500);
        assert_eq!(event.to_ts, 2000);

        notifier.mark_changed(0, 10);
        notifier.flush();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.revision, 2);
    }

    #[tokio::test]
    async fn test_flush_without_pending_is_silent() {
        let bus = Arc::new(EventBus::new());
        let mut rx = bus.subscribe_timeline_changed();
        let notifier = ActivityNotifier::new(Arc::clone(&bus));

        notifier.flush();
        assert!(rx.try_recv().is_err());
        assert_eq!(notifier.revision(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_coalesces_bursts() {
        let bus = Arc::new(EventBus::new());
        let mut rx = bus.subscribe_timeline_changed();
        let notifier = ActivityNotifier::new(Arc::clone(&bus));
        let (_tx, shutdown_rx) = watch::channel(false);
        let handle = notifier.start(shutdown_rx);

        for i in 0..10 {
            notifier.mark_changed(i * 100, i * 100 + 50);
        }
        tokio::time::sleep(Duration::from_millis(TIMELINE_DEBOUNCE_MS * 2)).await;

        let event = rx.recv().await.unwrap();
        assert_eq!(event.revision, 1);
        assert_eq!(event.from_ts, 0);
        assert_eq!(event.to_ts, 950);
        // The burst produced exactly one notification
        assert!(rx.try_recv().is_err());
        handle.abort();
    }
}
