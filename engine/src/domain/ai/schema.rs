//! VLM structured output schema
//!
//! The strict schema every VLM response is validated against. Violations
//! produce `AiError::Parse`, which marks the batch failed without tripping
//! the circuit breaker. Text fields are scrubbed for secret-like patterns
//! as a second line of defense behind the prompt instruction.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::core::constants::{
    VLM_DERIVED_PER_KIND_MAX, VLM_ENTITIES_MAX, VLM_KEYWORDS_MAX, VLM_OCR_TEXT_MAX,
    VLM_SEGMENTS_MAX, VLM_UI_SNIPPETS_MAX,
};
use crate::utils::string::truncate_chars;

use super::AiError;

/// Replacement for scrubbed secrets
const SECRET_MASK: &str = "***";

static SECRET_VALUE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?x)
        sk-[A-Za-z0-9_-]{8,}                                   # API-style keys
        | ghp_[A-Za-z0-9]{20,}                                 # GitHub PATs
        | AKIA[0-9A-Z]{16}                                     # AWS access keys
        | eyJ[A-Za-z0-9_-]{10,}\.[A-Za-z0-9_-]{10,}\.[A-Za-z0-9_-]{5,}  # JWTs
        ",
    )
    .expect("secret value regex")
});

static SECRET_ASSIGNMENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\b(password|passwd|secret|token|api[_-]?key)\b(\s*[:=]\s*)\S+"#)
        .expect("secret assignment regex")
});

/// Scrub secret-like substrings out of model-produced text
pub fn scrub_secrets(text: &str) -> String {
    let pass1 = SECRET_VALUE_RE.replace_all(text, SECRET_MASK);
    SECRET_ASSIGNMENT_RE
        .replace_all(&pass1, format!("$1$2{SECRET_MASK}").as_str())
        .into_owned()
}

// =============================================================================
// Schema types
// =============================================================================

/// One object per batch: segments, canonical entities, per-shot reports
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VlmIndex {
    #[serde(default)]
    pub segments: Vec<VlmSegment>,
    #[serde(default)]
    pub entities: Vec<String>,
    #[serde(default)]
    pub screenshots: Vec<VlmShotReport>,
}

/// A contiguous slice of the batch describing one activity
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VlmSegment {
    /// Ordinal ids of the screenshots backing this segment (request order)
    #[serde(default)]
    pub screen_ids: Vec<usize>,
    pub title: String,
    pub summary: String,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    #[serde(default = "default_confidence")]
    pub importance: f64,
    #[serde(default)]
    pub knowledge: Vec<DerivedItem>,
    #[serde(default)]
    pub state: Vec<DerivedItem>,
    #[serde(default)]
    pub procedure: Vec<DerivedItem>,
    #[serde(default)]
    pub plan: Vec<DerivedItem>,
    #[serde(default)]
    pub merge_hint: Option<MergeHint>,
    #[serde(default)]
    pub keywords: Vec<String>,
}

fn default_confidence() -> f64 {
    0.5
}

/// A knowledge/state/procedure/plan item derived from a segment
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DerivedItem {
    pub title: String,
    pub summary: String,
    /// Required for procedure items
    #[serde(default)]
    pub steps: Vec<String>,
    /// Knowledge items may carry a detected language (drives OCR eligibility)
    #[serde(default)]
    pub language: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MergeDecision {
    #[serde(rename = "NEW")]
    New,
    #[serde(rename = "MERGE")]
    Merge,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeHint {
    pub decision: MergeDecision,
    #[serde(default)]
    pub thread_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppGuess {
    pub name: String,
    #[serde(default)]
    pub confidence: f64,
}

/// Region + language hint that makes a screenshot OCR-eligible
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrHint {
    pub language: String,
    /// [x, y, width, height] in source pixels
    pub region: [i64; 4],
}

/// Per-input-screenshot report
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VlmShotReport {
    pub screen_id: usize,
    #[serde(default)]
    pub app_guess: Option<AppGuess>,
    #[serde(default)]
    pub ocr_text: Option<String>,
    #[serde(default)]
    pub ui_text_snippets: Vec<String>,
    #[serde(default)]
    pub ocr_hint: Option<OcrHint>,
}

// =============================================================================
// Validation
// =============================================================================

/// Parse and validate a raw VLM response against the schema.
///
/// Count caps (segments, derived items per kind, screenshots-per-input) are
/// strict and reject the response; text caps (OCR text, snippet and keyword
/// lists) truncate in place.
pub fn parse_vlm_index(json: &JsonValue, expected_shots: usize) -> Result<VlmIndex, AiError> {
    let mut index: VlmIndex = serde_json::from_value(json.clone())
        .map_err(|e| AiError::Parse(format!("schema mismatch: {e}")))?;

    if index.segments.len() > VLM_SEGMENTS_MAX {
        return Err(AiError::Parse(format!(
            "{} segments exceeds the cap of {VLM_SEGMENTS_MAX}",
            index.segments.len()
        )));
    }
    if index.screenshots.len() != expected_shots {
        return Err(AiError::Parse(format!(
            "expected {expected_shots} screenshot reports, got {}",
            index.screenshots.len()
        )));
    }

    index.entities.truncate(VLM_ENTITIES_MAX);

    for (i, segment) in index.segments.iter_mut().enumerate() {
        if segment.title.trim().is_empty() || segment.summary.trim().is_empty() {
            return Err(AiError::Parse(format!(
                "segment {i} is missing title or summary"
            )));
        }
        for id in &segment.screen_ids {
            if *id >= expected_shots {
                return Err(AiError::Parse(format!(
                    "segment {i} references screen id {id} out of range"
                )));
            }
        }
        for (kind, items) in [
            ("knowledge", &segment.knowledge),
            ("state", &segment.state),
            ("procedure", &segment.procedure),
            ("plan", &segment.plan),
        ] {
            if items.len() > VLM_DERIVED_PER_KIND_MAX {
                return Err(AiError::Parse(format!(
                    "segment {i} has {} {kind} items, cap is {VLM_DERIVED_PER_KIND_MAX}",
                    items.len()
                )));
            }
            for item in items {
                if item.title.trim().is_empty() || item.summary.trim().is_empty() {
                    return Err(AiError::Parse(format!(
                        "segment {i} has a {kind} item missing title or summary"
                    )));
                }
            }
        }
        for item in &segment.procedure {
            if item.steps.is_empty() {
                return Err(AiError::Parse(format!(
                    "segment {i} has a procedure item without steps"
                )));
            }
        }
        segment.keywords.truncate(VLM_KEYWORDS_MAX);

        segment.title = scrub_secrets(&segment.title);
        segment.summary = scrub_secrets(&segment.summary);
    }

    for report in &mut index.screenshots {
        if report.screen_id >= expected_shots {
            return Err(AiError::Parse(format!(
                "screenshot report references screen id {} out of range",
                report.screen_id
            )));
        }
        if let Some(ref mut text) = report.ocr_text {
            *text = scrub_secrets(&truncate_chars(text, VLM_OCR_TEXT_MAX));
        }
        report.ui_text_snippets.truncate(VLM_UI_SNIPPETS_MAX);
        for snippet in &mut report.ui_text_snippets {
            *snippet = scrub_secrets(snippet);
        }
    }

    Ok(index)
}
