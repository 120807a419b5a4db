//! Row types and status enums shared across the engine

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::utils::json::{parse_id_vec, parse_string_vec};

// =============================================================================
// Status Enums
// =============================================================================

/// Lifecycle of a claimable pipeline task.
///
/// Workers claim `pending`/`failed` rows via conditional update, move them to
/// `running`, and finish at `succeeded` or back to `failed` with a scheduled
/// retry. `failed_permanent` is terminal once attempts are exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    FailedPermanent,
}

impl TaskStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
            TaskStatus::FailedPermanent => "failed_permanent",
        }
    }

    pub const fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Succeeded | TaskStatus::FailedPermanent)
    }
}

/// Window summary status: task lifecycle plus `no_data` for empty windows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SummaryStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    FailedPermanent,
    NoData,
}

impl SummaryStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            SummaryStatus::Pending => "pending",
            SummaryStatus::Running => "running",
            SummaryStatus::Succeeded => "succeeded",
            SummaryStatus::Failed => "failed",
            SummaryStatus::FailedPermanent => "failed_permanent",
            SummaryStatus::NoData => "no_data",
        }
    }
}

/// Whether a screenshot's file is still on disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum StorageState {
    Ephemeral,
    Deleted,
}

/// Context node kind: the VLM derivation categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Event,
    Knowledge,
    State,
    Procedure,
    Plan,
}

impl NodeKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Event => "event",
            NodeKind::Knowledge => "knowledge",
            NodeKind::State => "state",
            NodeKind::Procedure => "procedure",
            NodeKind::Plan => "plan",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ThreadStatus {
    Active,
    Inactive,
}

// =============================================================================
// Rows
// =============================================================================

/// A captured frame
#[derive(Debug, Clone, FromRow)]
pub struct ScreenshotRow {
    pub id: i64,
    pub ts_ms: i64,
    pub source_key: String,
    pub phash: i64,
    pub file_path: Option<String>,
    pub width: i64,
    pub height: i64,
    pub bytes: i64,
    pub mime: String,
    pub app_hint: Option<String>,
    pub window_title: Option<String>,
    pub storage_state: StorageState,
    pub vlm_status: TaskStatus,
    pub vlm_attempts: i64,
    pub vlm_next_run_at: Option<i64>,
    pub ocr_status: Option<TaskStatus>,
    pub ocr_attempts: i64,
    pub ocr_next_run_at: Option<i64>,
    pub ocr_region: Option<String>,
    pub ocr_lang: Option<String>,
    pub ocr_text: Option<String>,
    pub ui_text_snippets: Option<String>,
    pub enqueued_batch_id: Option<String>,
    pub retention_expires_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl ScreenshotRow {
    pub fn ui_snippets(&self) -> Vec<String> {
        parse_string_vec(self.ui_text_snippets.as_deref())
    }
}

/// A contiguous run of screenshots from one source, submitted to the VLM together
#[derive(Debug, Clone, FromRow)]
pub struct BatchRow {
    pub id: i64,
    pub batch_id: String,
    pub source_key: String,
    pub screenshot_ids: String,
    pub ts_start: i64,
    pub ts_end: i64,
    pub status: TaskStatus,
    pub attempts: i64,
    pub next_run_at: Option<i64>,
    pub history_pack: Option<String>,
    pub index_json: Option<String>,
    pub last_error: Option<String>,
    pub last_error_code: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl BatchRow {
    pub fn shot_ids(&self) -> Vec<i64> {
        parse_id_vec(Some(&self.screenshot_ids))
    }
}

/// The smallest structured unit extracted from a VLM segment
#[derive(Debug, Clone, FromRow)]
pub struct ContextNodeRow {
    pub id: i64,
    pub batch_id: String,
    pub kind: NodeKind,
    pub thread_id: Option<String>,
    pub event_time: i64,
    pub title: String,
    pub summary: String,
    pub keywords: Option<String>,
    pub entities: Option<String>,
    pub knowledge_payload: Option<String>,
    pub state_payload: Option<String>,
    pub action_items: Option<String>,
    pub importance: f64,
    pub confidence: f64,
    pub screenshot_ids: Option<String>,
    pub merge_status: TaskStatus,
    pub merge_attempts: i64,
    pub merge_next_run_at: Option<i64>,
    pub merged_from_ids: String,
    pub created_at: i64,
    pub updated_at: i64,
}

impl ContextNodeRow {
    pub fn keyword_list(&self) -> Vec<String> {
        parse_string_vec(self.keywords.as_deref())
    }

    pub fn entity_list(&self) -> Vec<String> {
        parse_string_vec(self.entities.as_deref())
    }

    pub fn shot_ids(&self) -> Vec<i64> {
        parse_id_vec(self.screenshot_ids.as_deref())
    }

    pub fn merged_from(&self) -> Vec<i64> {
        parse_id_vec(Some(&self.merged_from_ids))
    }
}

/// One-to-one with an indexable node; carries the two independent
/// embedding/index subtask states
#[derive(Debug, Clone, FromRow)]
pub struct VectorDocumentRow {
    pub id: i64,
    pub vector_id: String,
    pub ref_id: i64,
    pub doc_type: String,
    pub text_content: String,
    pub text_hash: String,
    pub embedding: Option<Vec<u8>>,
    pub meta_payload: Option<String>,
    pub embedding_status: TaskStatus,
    pub embedding_attempts: i64,
    pub embedding_next_run_at: Option<i64>,
    pub index_status: TaskStatus,
    pub index_attempts: i64,
    pub index_next_run_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// A coherent activity stream
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ThreadRow {
    pub id: String,
    pub title: String,
    pub summary: Option<String>,
    pub current_phase: Option<String>,
    pub current_focus: Option<String>,
    pub status: ThreadStatus,
    pub start_time: i64,
    pub last_active_at: i64,
    pub duration_ms: i64,
    pub node_count: i64,
    pub apps: Option<String>,
    pub main_project: Option<String>,
    pub key_entities: Option<String>,
    pub milestones: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Per-window activity record
#[derive(Debug, Clone, FromRow)]
pub struct ActivitySummaryRow {
    pub id: i64,
    pub window_start: i64,
    pub window_end: i64,
    pub title: Option<String>,
    pub summary: Option<String>,
    pub highlights: Option<String>,
    pub stats: Option<String>,
    pub status: SummaryStatus,
    pub attempts: i64,
    pub next_run_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// A discrete event within a window, or a long event spanning windows
#[derive(Debug, Clone, FromRow)]
pub struct ActivityEventRow {
    pub id: i64,
    pub event_key: String,
    pub title: String,
    pub kind: String,
    pub start_ts: i64,
    pub end_ts: i64,
    pub duration_ms: i64,
    pub is_long: bool,
    pub confidence: f64,
    pub importance: f64,
    pub thread_id: Option<String>,
    pub summary_id: Option<i64>,
    pub node_ids: String,
    pub details_status: Option<TaskStatus>,
    pub details_attempts: i64,
    pub details_next_run_at: Option<i64>,
    pub details_text: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl ActivityEventRow {
    pub fn node_id_list(&self) -> Vec<i64> {
        parse_id_vec(Some(&self.node_ids))
    }
}

/// Append-only AI usage record
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct UsageEventRow {
    pub id: i64,
    pub at_ms: i64,
    pub capability: String,
    pub operation: String,
    pub model: String,
    pub provider: Option<String>,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub status: String,
    pub error_code: Option<String>,
}

/// Singleton settings row
#[derive(Debug, Clone, FromRow)]
pub struct SettingsRow {
    pub id: i64,
    pub pinned_thread_id: Option<String>,
    pub capture_enabled: bool,
    pub interval_multiplier: f64,
    pub phash_threshold: i64,
    pub updated_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_status_terminal() {
        assert!(TaskStatus::Succeeded.is_terminal());
        assert!(TaskStatus::FailedPermanent.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(!TaskStatus::Failed.is_terminal());
    }

    #[test]
    fn test_status_strings_match_schema() {
        assert_eq!(TaskStatus::FailedPermanent.as_str(), "failed_permanent");
        assert_eq!(SummaryStatus::NoData.as_str(), "no_data");
        assert_eq!(NodeKind::Procedure.as_str(), "procedure");
    }
}
