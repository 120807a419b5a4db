//! Reconcile-driven processing pipeline
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                      PROCESSING PIPELINE                            │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │                                                                     │
//! │ capture ──▶ screenshots(pending) ──▶ batcher ──▶ batches(pending)   │
//! │                                                      │              │
//! │                 ┌────────────────────────────────────┘              │
//! │                 ▼                                                   │
//! │          reconcile loop ──▶ vlm ──▶ expand ──▶ threads              │
//! │                 │                      │                            │
//! │                 ├──▶ merge             └──▶ vector docs             │
//! │                 ├──▶ embed ──▶ index                               │
//! │                 ├──▶ ocr                                            │
//! │                 └──▶ window summaries                               │
//! │                                                                     │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! All stage state lives in the relational store; the reconcile loop is the
//! only scheduler, driving claimable rows to terminal status with retry,
//! backoff, and stale-claim recovery.

pub mod batcher;
pub mod embed;
pub mod expand;
pub mod merge;
pub mod ocr;
pub mod reconcile;
pub mod threads;
pub mod vlm;

pub use batcher::BatchBuilder;
pub use reconcile::ReconcileLoop;

use thiserror::Error;

/// Stage-worker error. Workers convert every variant into a row status
/// transition; nothing here ever escapes a reconcile tick.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Sqlite(#[from] crate::data::sqlite::SqliteError),

    #[error(transparent)]
    Ai(#[from] crate::domain::ai::AiError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
