//! Vector index adapter
//!
//! Single logical writer over the ANN index: every mutation goes through
//! `VectorStore`, which serializes access with an async mutex and flushes
//! the index to disk after a quiescence interval once dirty. The reconcile
//! loop keeps the index worker pool at one, matching this design.

pub mod index;

pub use index::{AnnIndex, FlatIndex};

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;

use crate::core::constants::{VECTOR_FLUSH_POLL_MS, VECTOR_FLUSH_QUIESCENCE_MS};
use crate::utils::time::now_ms;

#[derive(Debug, Error)]
pub enum VectorError {
    #[error("Index I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid embedding blob: length {0} is not a multiple of 4")]
    InvalidBlob(usize),
}

/// Decode a little-endian f32 blob into a vector
pub fn decode_embedding(blob: &[u8]) -> Result<Vec<f32>, VectorError> {
    if !blob.len().is_multiple_of(4) {
        return Err(VectorError::InvalidBlob(blob.len()));
    }
    Ok(blob
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

/// Encode a vector as a little-endian f32 blob
pub fn encode_embedding(vector: &[f32]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(vector.len() * 4);
    for value in vector {
        blob.extend_from_slice(&value.to_le_bytes());
    }
    blob
}

/// Single-writer wrapper over an ANN index with dirty-flag flush
pub struct VectorStore {
    index: Mutex<Box<dyn AnnIndex>>,
    path: PathBuf,
    dirty: AtomicBool,
    last_write_ms: AtomicI64,
}

impl VectorStore {
    pub fn new(index: Box<dyn AnnIndex>, path: PathBuf) -> Self {
        Self {
            index: Mutex::new(index),
            path,
            dirty: AtomicBool::new(false),
            last_write_ms: AtomicI64::new(0),
        }
    }

    /// Open the persisted flat index at `path` (empty when absent)
    pub fn open_flat(path: PathBuf) -> Result<Self, VectorError> {
        let index = FlatIndex::load(&path)?;
        tracing::debug!(path = %path.display(), vectors = index.len(), "VectorStore opened");
        Ok(Self::new(Box::new(index), path))
    }

    /// Insert or replace a vector; marks the store dirty
    pub async fn upsert(&self, id: i64, vector: &[f32]) {
        let mut index = self.index.lock().await;
        index.upsert(id, vector);
        self.dirty.store(true, Ordering::SeqCst);
        self.last_write_ms.store(now_ms(), Ordering::SeqCst);
    }

    /// Search by descending similarity
    pub async fn search(&self, query: &[f32], k: usize) -> Vec<(i64, f32)> {
        self.index.lock().await.search(query, k)
    }

    pub async fn len(&self) -> usize {
        self.index.lock().await.len()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    /// Persist the index if dirty
    pub async fn flush(&self) -> Result<(), VectorError> {
        if !self.dirty.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let index = self.index.lock().await;
        if let Err(e) = index.save(&self.path) {
            // Keep the dirty flag so the next flush retries
            self.dirty.store(true, Ordering::SeqCst);
            return Err(e.into());
        }
        tracing::debug!(path = %self.path.display(), vectors = index.len(), "Vector index flushed");
        Ok(())
    }

    /// Background task flushing the index after write quiescence
    pub fn start_flush_task(
        self: &Arc<Self>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(VECTOR_FLUSH_POLL_MS));
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            tracing::debug!("Vector flush task shutting down");
                            break;
                        }
                    }
                    _ = interval.tick() => {
                        let quiesced = now_ms() - store.last_write_ms.load(Ordering::SeqCst)
                            >= VECTOR_FLUSH_QUIESCENCE_MS as i64;
                        if store.is_dirty() && quiesced
                            && let Err(e) = store.flush().await
                        {
                            tracing::warn!(error = %e, "Vector index flush failed");
                        }
                    }
                }
            }
        })
    }
}
