//! AI runtime: adaptive concurrency and circuit breaking
//!
//! Three independent capability lanes (`vlm`, `text`, `embedding`), each a
//! permit gate with AIMD adjustment:
//!
//! - additive increase: a streak of successes raises the permit count by 1,
//!   capped per capability
//! - multiplicative decrease: any recorded failure halves it (floor 1)
//!
//! A hand-rolled gate (mutex state + notify queue) rather than
//! `tokio::sync::Semaphore`, because AIMD shrinks the limit and a Tokio
//! semaphore cannot revoke outstanding permits. The limit gates new
//! admissions only; in-flight calls run to completion after a decrease.
//!
//! Breaker-qualifying failures accumulate in a sliding window; crossing the
//! threshold opens the lane's circuit breaker. An open VLM breaker flips the
//! capture-pause watch consumed by the capture scheduler. After a cooldown
//! the breaker admits a single half-open probe; its success closes the
//! breaker, its failure re-opens it.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{Notify, watch};

use crate::core::constants::{
    AI_INITIAL_LIMITS, AI_MAX_LIMITS, AIMD_SUCCESS_STREAK, BREAKER_COOLDOWN_SECS,
    BREAKER_FAILURE_THRESHOLD, BREAKER_FAILURE_WINDOW_SECS, SEMAPHORE_WAIT_ALERT_MS,
};
use crate::data::topics::{AlertKind, EventBus};
use crate::utils::time::now_ms;

use super::AiError;

/// The three AI capabilities
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Vlm,
    Text,
    Embedding,
}

impl Capability {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Capability::Vlm => "vlm",
            Capability::Text => "text",
            Capability::Embedding => "embedding",
        }
    }

    const fn index(&self) -> usize {
        match self {
            Capability::Vlm => 0,
            Capability::Text => 1,
            Capability::Embedding => 2,
        }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Breaker lifecycle per lane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum BreakerState {
    Closed,
    Open { until_ms: i64 },
    HalfOpen,
}

#[derive(Debug)]
enum Breaker {
    Closed,
    Open { until_ms: i64 },
    HalfOpen { probe_out: bool },
}

#[derive(Debug)]
struct LaneState {
    limit: u32,
    in_flight: u32,
    consecutive_successes: u32,
    /// Breaker-qualifying failure timestamps within the sliding window
    recent_failures: VecDeque<i64>,
    breaker: Breaker,
}

impl LaneState {
    fn new(limit: u32) -> Self {
        Self {
            limit,
            in_flight: 0,
            consecutive_successes: 0,
            recent_failures: VecDeque::new(),
            breaker: Breaker::Closed,
        }
    }

    /// Move Open past its cooldown into HalfOpen
    fn tick_breaker(&mut self, now: i64) {
        if let Breaker::Open { until_ms } = self.breaker
            && now >= until_ms
        {
            self.breaker = Breaker::HalfOpen { probe_out: false };
        }
    }

    fn prune_failures(&mut self, now: i64) {
        let cutoff = now - (BREAKER_FAILURE_WINDOW_SECS as i64) * 1000;
        while self
            .recent_failures
            .front()
            .is_some_and(|&at| at < cutoff)
        {
            self.recent_failures.pop_front();
        }
    }
}

/// Scoped permit; releases its lane slot on drop (idempotent)
#[derive(Debug)]
pub struct Permit {
    runtime: Arc<AiRuntime>,
    capability: Capability,
    probe: bool,
    released: bool,
}

impl Permit {
    /// Whether this permit is the single half-open probe
    pub fn is_probe(&self) -> bool {
        self.probe
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            self.runtime.release(self.capability);
        }
    }
}

/// Process-wide AI concurrency governor
#[derive(Debug)]
pub struct AiRuntime {
    lanes: [Mutex<LaneState>; 3],
    notifies: [Notify; 3],
    max_limits: [u32; 3],
    bus: Arc<EventBus>,
    capture_pause_tx: watch::Sender<bool>,
    capture_pause_rx: watch::Receiver<bool>,
}

impl AiRuntime {
    pub fn new(bus: Arc<EventBus>) -> Arc<Self> {
        let (capture_pause_tx, capture_pause_rx) = watch::channel(false);
        Arc::new(Self {
            lanes: [
                Mutex::new(LaneState::new(AI_INITIAL_LIMITS[0])),
                Mutex::new(LaneState::new(AI_INITIAL_LIMITS[1])),
                Mutex::new(LaneState::new(AI_INITIAL_LIMITS[2])),
            ],
            notifies: [Notify::new(), Notify::new(), Notify::new()],
            max_limits: AI_MAX_LIMITS,
            bus,
            capture_pause_tx,
            capture_pause_rx,
        })
    }

    /// Acquire a permit, waiting FIFO when the lane is saturated.
    ///
    /// Returns `BreakerOpen` without waiting when the lane's breaker is open
    /// (or half-open with its probe already out); a half-open lane admits
    /// exactly one probe.
    pub async fn acquire(self: &Arc<Self>, cap: Capability) -> Result<Permit, AiError> {
        let started = Instant::now();
        let idx = cap.index();

        loop {
            let notified = self.notifies[idx].notified();
            tokio::pin!(notified);

            {
                let mut lane = self.lanes[idx].lock();
                lane.tick_breaker(now_ms());

                match lane.breaker {
                    Breaker::Open { .. } => return Err(AiError::BreakerOpen(cap)),
                    Breaker::HalfOpen { probe_out: true } => {
                        return Err(AiError::BreakerOpen(cap));
                    }
                    Breaker::HalfOpen { probe_out: false } => {
                        if lane.in_flight == 0 {
                            lane.breaker = Breaker::HalfOpen { probe_out: true };
                            lane.in_flight += 1;
                            drop(lane);
                            self.report_wait(cap, started);
                            return Ok(self.permit(cap, true));
                        }
                        // Drain before probing
                    }
                    Breaker::Closed => {
                        if lane.in_flight < lane.limit {
                            lane.in_flight += 1;
                            drop(lane);
                            self.report_wait(cap, started);
                            return Ok(self.permit(cap, false));
                        }
                    }
                }
            }

            notified.await;
        }
    }

    fn permit(self: &Arc<Self>, capability: Capability, probe: bool) -> Permit {
        Permit {
            runtime: Arc::clone(self),
            capability,
            probe,
            released: false,
        }
    }

    fn report_wait(&self, cap: Capability, started: Instant) {
        let waited = started.elapsed().as_millis();
        if waited > SEMAPHORE_WAIT_ALERT_MS {
            self.bus.alert(
                AlertKind::SemaphoreWait,
                format!("{cap} permit wait took {waited}ms"),
            );
        }
    }

    fn release(&self, cap: Capability) {
        let idx = cap.index();
        {
            let mut lane = self.lanes[idx].lock();
            lane.in_flight = lane.in_flight.saturating_sub(1);
        }
        self.notifies[idx].notify_one();
    }

    /// AIMD additive increase on a success streak. A half-open probe success
    /// closes the breaker and resumes capture for the VLM lane.
    pub fn record_success(&self, cap: Capability) {
        let idx = cap.index();
        let mut closed_breaker = false;
        {
            let mut lane = self.lanes[idx].lock();

            if matches!(lane.breaker, Breaker::HalfOpen { .. }) {
                lane.breaker = Breaker::Closed;
                lane.recent_failures.clear();
                closed_breaker = true;
            }

            lane.consecutive_successes += 1;
            if lane.consecutive_successes >= AIMD_SUCCESS_STREAK {
                lane.consecutive_successes = 0;
                if lane.limit < self.max_limits[idx] {
                    lane.limit += 1;
                    tracing::debug!(capability = %cap, limit = lane.limit, "AIMD limit increased");
                }
            }
        }
        if closed_breaker {
            self.on_breaker_closed(cap);
        }
        // Raised limits may admit a parked waiter
        self.notifies[idx].notify_one();
    }

    /// Multiplicative decrease; optionally participate in the breaker window.
    pub fn record_failure(&self, cap: Capability, err: &AiError) {
        let idx = cap.index();
        let now = now_ms();
        let mut opened_breaker = false;
        {
            let mut lane = self.lanes[idx].lock();
            lane.consecutive_successes = 0;

            let halved = (lane.limit / 2).max(1);
            if halved != lane.limit {
                lane.limit = halved;
                tracing::debug!(capability = %cap, limit = lane.limit, "AIMD limit halved");
            }

            if matches!(lane.breaker, Breaker::HalfOpen { .. }) {
                // The probe failed: back to open for another cooldown
                lane.breaker = Breaker::Open {
                    until_ms: now + (BREAKER_COOLDOWN_SECS as i64) * 1000,
                };
                opened_breaker = true;
            } else if err.trips_breaker() && matches!(lane.breaker, Breaker::Closed) {
                lane.recent_failures.push_back(now);
                lane.prune_failures(now);
                if lane.recent_failures.len() >= BREAKER_FAILURE_THRESHOLD {
                    lane.breaker = Breaker::Open {
                        until_ms: now + (BREAKER_COOLDOWN_SECS as i64) * 1000,
                    };
                    opened_breaker = true;
                }
            }
        }
        if opened_breaker {
            self.on_breaker_opened(cap);
        }
    }

    fn on_breaker_opened(&self, cap: Capability) {
        tracing::warn!(capability = %cap, "Circuit breaker opened");
        self.bus
            .alert(AlertKind::BreakerOpen, format!("{cap} breaker opened"));
        if cap == Capability::Vlm {
            let _ = self.capture_pause_tx.send(true);
        }
    }

    fn on_breaker_closed(&self, cap: Capability) {
        tracing::info!(capability = %cap, "Circuit breaker closed");
        self.bus
            .alert(AlertKind::BreakerClosed, format!("{cap} breaker closed"));
        if cap == Capability::Vlm {
            let _ = self.capture_pause_tx.send(false);
        }
    }

    /// Current permit count; sizes reconcile scan batches and worker pools
    pub fn get_limit(&self, cap: Capability) -> u32 {
        self.lanes[cap.index()].lock().limit
    }

    /// Live in-flight count
    pub fn in_flight(&self, cap: Capability) -> u32 {
        self.lanes[cap.index()].lock().in_flight
    }

    pub fn breaker_state(&self, cap: Capability) -> BreakerState {
        let mut lane = self.lanes[cap.index()].lock();
        lane.tick_breaker(now_ms());
        match lane.breaker {
            Breaker::Closed => BreakerState::Closed,
            Breaker::Open { until_ms } => BreakerState::Open { until_ms },
            Breaker::HalfOpen { .. } => BreakerState::HalfOpen,
        }
    }

    /// Watch the capture scheduler subscribes to: true while the VLM breaker
    /// demands a capture pause
    pub fn capture_pause_rx(&self) -> watch::Receiver<bool> {
        self.capture_pause_rx.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runtime() -> Arc<AiRuntime> {
        AiRuntime::new(Arc::new(EventBus::new()))
    }

    fn transient() -> AiError {
        AiError::provider("HTTP_500", "server error", true)
    }

    #[tokio::test]
    async fn test_acquire_respects_limit() {
        let rt = runtime();
        let limit = rt.get_limit(Capability::Vlm);

        let mut permits = Vec::new();
        for _ in 0..limit {
            permits.push(rt.acquire(Capability::Vlm).await.unwrap());
        }
        assert_eq!(rt.in_flight(Capability::Vlm), limit);

        // Lane saturated: the next acquire parks
        let rt2 = Arc::clone(&rt);
        let waiter = tokio::spawn(async move { rt2.acquire(Capability::Vlm).await });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        // Releasing one permit admits the waiter
        permits.pop();
        let permit = tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(rt.in_flight(Capability::Vlm), limit);
        drop(permit);
        drop(permits);
        assert_eq!(rt.in_flight(Capability::Vlm), 0);
    }

    #[tokio::test]
    async fn test_release_is_idempotent_per_acquire() {
        let rt = runtime();
        let permit = rt.acquire(Capability::Text).await.unwrap();
        assert_eq!(rt.in_flight(Capability::Text), 1);
        drop(permit);
        assert_eq!(rt.in_flight(Capability::Text), 0);
        // A stray notify or double release cannot underflow
        rt.release(Capability::Text);
        assert_eq!(rt.in_flight(Capability::Text), 0);
    }

    #[tokio::test]
    async fn test_aimd_additive_increase() {
        let rt = runtime();
        let initial = rt.get_limit(Capability::Embedding);
        for _ in 0..AIMD_SUCCESS_STREAK {
            rt.record_success(Capability::Embedding);
        }
        assert_eq!(rt.get_limit(Capability::Embedding), initial + 1);
    }

    #[tokio::test]
    async fn test_aimd_capped_at_max() {
        let rt = runtime();
        for _ in 0..AIMD_SUCCESS_STREAK * 64 {
            rt.record_success(Capability::Vlm);
        }
        assert_eq!(rt.get_limit(Capability::Vlm), AI_MAX_LIMITS[0]);
    }

    #[tokio::test]
    async fn test_multiplicative_decrease_floors_at_one() {
        let rt = runtime();
        for _ in 0..8 {
            rt.record_failure(Capability::Text, &transient());
        }
        assert_eq!(rt.get_limit(Capability::Text), 1);
    }

    #[tokio::test]
    async fn test_breaker_opens_and_pauses_capture() {
        let rt = runtime();
        let pause_rx = rt.capture_pause_rx();
        assert!(!*pause_rx.borrow());

        for _ in 0..BREAKER_FAILURE_THRESHOLD {
            rt.record_failure(Capability::Vlm, &transient());
        }
        assert!(matches!(
            rt.breaker_state(Capability::Vlm),
            BreakerState::Open { .. }
        ));
        assert!(*pause_rx.borrow());

        // Open breaker denies acquires without waiting
        let err = rt.acquire(Capability::Vlm).await.unwrap_err();
        assert!(matches!(err, AiError::BreakerOpen(Capability::Vlm)));
    }

    #[tokio::test]
    async fn test_parse_errors_do_not_trip_breaker() {
        let rt = runtime();
        for _ in 0..BREAKER_FAILURE_THRESHOLD * 2 {
            rt.record_failure(Capability::Vlm, &AiError::Parse("bad json".to_string()));
        }
        assert!(matches!(
            rt.breaker_state(Capability::Vlm),
            BreakerState::Closed
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_probe_closes_breaker() {
        let rt = runtime();
        for _ in 0..BREAKER_FAILURE_THRESHOLD {
            rt.record_failure(Capability::Vlm, &transient());
        }
        assert!(matches!(
            rt.breaker_state(Capability::Vlm),
            BreakerState::Open { .. }
        ));

        // Cooldown elapses on the wall clock used by the breaker
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        // Force the cooldown by rewriting the open deadline
        {
            let mut lane = rt.lanes[Capability::Vlm.index()].lock();
            lane.breaker = Breaker::Open { until_ms: 0 };
        }
        assert!(matches!(
            rt.breaker_state(Capability::Vlm),
            BreakerState::HalfOpen
        ));

        // Exactly one probe is admitted
        let probe = rt.acquire(Capability::Vlm).await.unwrap();
        assert!(probe.is_probe());
        let denied = rt.acquire(Capability::Vlm).await.unwrap_err();
        assert!(matches!(denied, AiError::BreakerOpen(_)));

        rt.record_success(Capability::Vlm);
        drop(probe);
        assert!(matches!(
            rt.breaker_state(Capability::Vlm),
            BreakerState::Closed
        ));
        assert!(!*rt.capture_pause_rx().borrow());
    }

    #[tokio::test]
    async fn test_failed_probe_reopens_breaker() {
        let rt = runtime();
        for _ in 0..BREAKER_FAILURE_THRESHOLD {
            rt.record_failure(Capability::Vlm, &transient());
        }
        {
            let mut lane = rt.lanes[Capability::Vlm.index()].lock();
            lane.breaker = Breaker::Open { until_ms: 0 };
        }
        let probe = rt.acquire(Capability::Vlm).await.unwrap();
        rt.record_failure(Capability::Vlm, &transient());
        drop(probe);

        assert!(matches!(
            rt.breaker_state(Capability::Vlm),
            BreakerState::Open { .. }
        ));
        assert!(*rt.capture_pause_rx().borrow());
    }
}
