//! Repository functions over the relational store
//!
//! Every mutation the pipeline performs goes through these functions.
//! Claimable task tables (batches, screenshots.vlm/ocr, context_nodes.merge,
//! vector_documents.embedding/index, activity_summaries,
//! activity_events.details) share the same protocol:
//!
//! - **Claim**: `UPDATE ... SET status='running', attempts=attempts+1,
//!   next_run_at=NULL WHERE id=? AND status IN ('pending','failed') AND
//!   attempts=?`. Zero rows changed means another worker won the row.
//! - **Retry**: on failure, `next_run_at = now + schedule[min(attempts-1,
//!   len-1)] + jitter`, or `failed_permanent` once attempts reach the cap.
//! - **Recovery**: rows stuck in `running` past the stale threshold reset
//!   to `pending` with `next_run_at = NULL`.

pub mod activity;
pub mod batches;
pub mod nodes;
pub mod screenshots;
pub mod settings;
pub mod threads;
pub mod usage;
pub mod vector_docs;

use rand::Rng;

use crate::core::constants::{BACKOFF_JITTER_MS, BACKOFF_SCHEDULE_MS, MAX_ATTEMPTS};

/// Compute the retry delay after `attempts` consumed attempts.
///
/// Indexes the backoff schedule by the previous attempt count, clamped to
/// the last entry, plus uniform jitter.
pub fn backoff_delay_ms(attempts: i64) -> i64 {
    let idx = (attempts - 1).clamp(0, BACKOFF_SCHEDULE_MS.len() as i64 - 1) as usize;
    let jitter = rand::thread_rng().gen_range(0..=BACKOFF_JITTER_MS);
    BACKOFF_SCHEDULE_MS[idx] + jitter
}

/// Whether a task that just consumed `attempts` attempts is out of retries
pub fn attempts_exhausted(attempts: i64) -> bool {
    attempts >= MAX_ATTEMPTS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_monotone_and_clamped() {
        let base: Vec<i64> = (1..=8)
            .map(|a| backoff_delay_ms(a) - backoff_delay_ms(a).rem_euclid(1))
            .collect();
        // Jitter aside, delays never shrink below the first schedule entry
        for d in &base {
            assert!(*d >= BACKOFF_SCHEDULE_MS[0]);
        }
        // Beyond the schedule length, the last entry is reused
        let last = BACKOFF_SCHEDULE_MS[BACKOFF_SCHEDULE_MS.len() - 1];
        assert!(backoff_delay_ms(100) >= last);
        assert!(backoff_delay_ms(100) <= last + BACKOFF_JITTER_MS);
    }

    #[test]
    fn test_attempts_exhausted() {
        assert!(!attempts_exhausted(MAX_ATTEMPTS - 1));
        assert!(attempts_exhausted(MAX_ATTEMPTS));
        assert!(attempts_exhausted(MAX_ATTEMPTS + 1));
    }
}
