//! Hybrid search
//!
//! - `fts`    - FTS mirror health plus keyword queries
//! - `hybrid` - keyword + vector retrieval with neighbor expansion,
//!              optional answer synthesis, and cooperative cancellation

pub mod fts;
pub mod hybrid;

pub use fts::FtsService;
pub use hybrid::{SearchError, SearchService};
