//! Model provider traits
//!
//! The engine treats model endpoints as opaque request/response adapters.
//! Production deployments plug in the OpenAI-compatible adapter or any
//! other implementation of these traits; tests use scripted mocks.

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use super::AiError;

/// Token accounting reported by an adapter
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenUsage {
    pub input_tokens: i64,
    pub output_tokens: i64,
}

/// An image passed inline with a VLM request
#[derive(Debug, Clone)]
pub struct InlineImage {
    pub mime: String,
    pub data: Vec<u8>,
}

/// One structured-generation request over a batch of screenshots
#[derive(Debug, Clone)]
pub struct VlmRequest {
    pub prompt: String,
    pub images: Vec<InlineImage>,
}

/// Raw structured output plus usage; schema validation happens in the stage
#[derive(Debug, Clone)]
pub struct VlmResponse {
    pub json: JsonValue,
    pub usage: TokenUsage,
}

#[derive(Debug, Clone)]
pub struct TextResponse {
    pub text: String,
    pub usage: TokenUsage,
}

#[derive(Debug, Clone)]
pub struct EmbeddingResponse {
    pub vector: Vec<f32>,
    pub usage: TokenUsage,
}

/// Vision-language model adapter
#[async_trait]
pub trait VlmProvider: Send + Sync {
    fn model(&self) -> &str;

    /// Issue a single structured-generation request
    async fn interpret(&self, request: VlmRequest) -> Result<VlmResponse, AiError>;
}

/// Text model adapter (merge decisions, thread assignment, summaries)
#[async_trait]
pub trait TextProvider: Send + Sync {
    fn model(&self) -> &str;

    async fn generate(&self, prompt: String) -> Result<TextResponse, AiError>;
}

/// Embedding model adapter
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn model(&self) -> &str;

    async fn embed(&self, text: &str) -> Result<EmbeddingResponse, AiError>;
}

/// Stand-ins used when a capability has no configured endpoint. Every call
/// fails with `NotConfigured`, which is non-retryable and never trips a
/// breaker; the UI surfaces it as a configuration problem.
pub mod unconfigured {
    use super::*;
    use crate::domain::ai::Capability;

    pub struct UnconfiguredVlm;

    #[async_trait]
    impl VlmProvider for UnconfiguredVlm {
        fn model(&self) -> &str {
            "unconfigured"
        }

        async fn interpret(&self, _request: VlmRequest) -> Result<VlmResponse, AiError> {
            Err(AiError::NotConfigured(Capability::Vlm))
        }
    }

    pub struct UnconfiguredText;

    #[async_trait]
    impl TextProvider for UnconfiguredText {
        fn model(&self) -> &str {
            "unconfigured"
        }

        async fn generate(&self, _prompt: String) -> Result<TextResponse, AiError> {
            Err(AiError::NotConfigured(Capability::Text))
        }
    }

    pub struct UnconfiguredEmbedding;

    #[async_trait]
    impl EmbeddingProvider for UnconfiguredEmbedding {
        fn model(&self) -> &str {
            "unconfigured"
        }

        async fn embed(&self, _text: &str) -> Result<EmbeddingResponse, AiError> {
            Err(AiError::NotConfigured(Capability::Embedding))
        }
    }
}

/// Scripted providers for tests and scenario fixtures
#[cfg(test)]
pub mod mock {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;

    use super::*;

    /// VLM mock returning queued responses (or a terminal error) in order
    pub struct MockVlm {
        responses: Mutex<Vec<Result<JsonValue, AiError>>>,
        pub calls: AtomicUsize,
    }

    impl MockVlm {
        pub fn new(responses: Vec<Result<JsonValue, AiError>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses),
                calls: AtomicUsize::new(0),
            })
        }

        /// A mock that always times out
        pub fn always_timeout() -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(Vec::new()),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl VlmProvider for MockVlm {
        fn model(&self) -> &str {
            "mock-vlm"
        }

        async fn interpret(&self, _request: VlmRequest) -> Result<VlmResponse, AiError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut responses = self.responses.lock();
            if responses.is_empty() {
                return Err(AiError::Timeout {
                    capability: crate::domain::ai::Capability::Vlm,
                    ms: 0,
                });
            }
            responses.remove(0).map(|json| VlmResponse {
                json,
                usage: TokenUsage {
                    input_tokens: 100,
                    output_tokens: 50,
                },
            })
        }
    }

    /// Text mock replying with a fixed response for every prompt
    pub struct MockText {
        pub response: Mutex<String>,
        pub calls: AtomicUsize,
        pub prompts: Mutex<Vec<String>>,
    }

    impl MockText {
        pub fn new(response: impl Into<String>) -> Arc<Self> {
            Arc::new(Self {
                response: Mutex::new(response.into()),
                calls: AtomicUsize::new(0),
                prompts: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl TextProvider for MockText {
        fn model(&self) -> &str {
            "mock-text"
        }

        async fn generate(&self, prompt: String) -> Result<TextResponse, AiError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.prompts.lock().push(prompt);
            Ok(TextResponse {
                text: self.response.lock().clone(),
                usage: TokenUsage {
                    input_tokens: 50,
                    output_tokens: 20,
                },
            })
        }
    }

    /// Embedding mock producing a deterministic vector from text bytes
    pub struct MockEmbedding {
        pub calls: AtomicUsize,
    }

    impl MockEmbedding {
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl EmbeddingProvider for MockEmbedding {
        fn model(&self) -> &str {
            "mock-embedding"
        }

        async fn embed(&self, text: &str) -> Result<EmbeddingResponse, AiError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            // Deterministic 4-dim vector from the text content
            let mut vector = [0.0f32; 4];
            for (i, b) in text.bytes().enumerate() {
                vector[i % 4] += b as f32 / 255.0;
            }
            Ok(EmbeddingResponse {
                vector: vector.to_vec(),
                usage: TokenUsage {
                    input_tokens: text.len() as i64 / 4,
                    output_tokens: 0,
                },
            })
        }
    }
}
