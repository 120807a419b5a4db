//! Domain logic
//!
//! - `ai`       - capability lanes, providers, structured output, usage
//! - `capture`  - frame acquisition, dedup, backpressure
//! - `pipeline` - batch formation and the reconcile-driven stages
//! - `activity` - timeline windows, summaries, events
//! - `search`   - hybrid keyword + vector retrieval

pub mod activity;
pub mod ai;
pub mod capture;
pub mod pipeline;
pub mod search;
