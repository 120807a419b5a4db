//! AI capability layer
//!
//! - `runtime`   - per-capability permit lanes with AIMD and circuit breakers
//! - `providers` - opaque model adapters (VLM, text, embedding)
//! - `openai`    - OpenAI-compatible HTTP adapter for all three capabilities
//! - `schema`    - strict structured-output schema for VLM results
//! - `usage`     - append-only usage recording
//! - `trace`     - bounded request traces with truncated previews

pub mod openai;
pub mod providers;
pub mod runtime;
pub mod schema;
pub mod trace;
pub mod usage;

pub use runtime::{AiRuntime, Capability, Permit};

use thiserror::Error;

/// Error taxonomy for AI calls.
///
/// Parse failures are validation errors and never trip a breaker; provider
/// errors carry a retryable flag that decides breaker participation.
#[derive(Debug, Error)]
pub enum AiError {
    #[error("{0} circuit breaker is open")]
    BreakerOpen(Capability),

    #[error("{capability} request timed out after {ms}ms")]
    Timeout { capability: Capability, ms: u64 },

    #[error("Provider error [{code}]: {message}")]
    Provider {
        code: String,
        message: String,
        retryable: bool,
    },

    #[error("Structured output validation failed: {0}")]
    Parse(String),

    #[error("{0} provider is not configured")]
    NotConfigured(Capability),
}

impl AiError {
    /// Stable error code for usage rows and traces
    pub fn code(&self) -> String {
        match self {
            AiError::BreakerOpen(_) => "BREAKER_OPEN".to_string(),
            AiError::Timeout { .. } => "TIMEOUT".to_string(),
            AiError::Provider { code, .. } => code.clone(),
            AiError::Parse(_) => "PARSE".to_string(),
            AiError::NotConfigured(_) => "NOT_CONFIGURED".to_string(),
        }
    }

    /// Whether this failure counts toward opening the circuit breaker
    pub fn trips_breaker(&self) -> bool {
        match self {
            AiError::Timeout { .. } => true,
            AiError::Provider { retryable, .. } => *retryable,
            AiError::BreakerOpen(_) | AiError::Parse(_) | AiError::NotConfigured(_) => false,
        }
    }

    pub fn provider(code: impl Into<String>, message: impl Into<String>, retryable: bool) -> Self {
        AiError::Provider {
            code: code.into(),
            message: message.into(),
            retryable,
        }
    }
}
