//! Data storage layer
//!
//! - `sqlite` - relational store holding the durable work queue and graph
//! - `vector` - ANN index adapter with single-writer flush discipline
//! - `topics` - in-process typed event bus and ring buffer
//! - `types`  - row types and status enums shared across the engine

pub mod sqlite;
pub mod topics;
pub mod types;
pub mod vector;

pub use sqlite::{SqliteError, SqliteService};
pub use topics::EventBus;
pub use vector::VectorStore;
