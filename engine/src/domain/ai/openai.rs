//! OpenAI-compatible HTTP adapter
//!
//! One adapter serves all three capabilities against any endpoint speaking
//! the OpenAI wire format (llama.cpp, vLLM, Ollama's compat layer, hosted
//! APIs). Requests carry inline base64 images as data URIs.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::{Value as JsonValue, json};

use crate::core::config::ProviderConfig;

use super::providers::{
    EmbeddingProvider, EmbeddingResponse, TextProvider, TextResponse, TokenUsage, VlmProvider,
    VlmRequest, VlmResponse,
};
use super::runtime::Capability;
use super::AiError;

/// Adapter over an OpenAI-compatible endpoint
pub struct OpenAiCompatible {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
}

impl OpenAiCompatible {
    pub fn from_config(config: &ProviderConfig, capability: Capability) -> Result<Self, AiError> {
        if !config.is_configured() {
            return Err(AiError::NotConfigured(capability));
        }
        Ok(Self {
            client: reqwest::Client::new(),
            base_url: config
                .base_url
                .clone()
                .unwrap_or_default()
                .trim_end_matches('/')
                .to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone().unwrap_or_default(),
        })
    }

    async fn post_json(&self, path: &str, body: JsonValue) -> Result<JsonValue, AiError> {
        let url = format!("{}{path}", self.base_url);
        let mut request = self.client.post(&url).json(&body);
        if let Some(ref key) = self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            AiError::provider("NETWORK", format!("request to {url} failed: {e}"), true)
        })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(map_status_error(status.as_u16(), &text));
        }

        response
            .json()
            .await
            .map_err(|e| AiError::provider("BAD_RESPONSE", format!("invalid JSON body: {e}"), true))
    }
}

/// Map HTTP status codes onto the engine's error taxonomy.
/// 401/403 are configuration problems and never retried; 408/429/5xx are
/// transient and participate in the breaker window.
fn map_status_error(status: u16, body: &str) -> AiError {
    let preview: String = body.chars().take(200).collect();
    match status {
        401 | 403 => AiError::provider("UNAUTHORIZED", preview, false),
        404 => AiError::provider("NOT_FOUND", preview, false),
        408 | 429 => AiError::provider(format!("HTTP_{status}"), preview, true),
        500..=599 => AiError::provider(format!("HTTP_{status}"), preview, true),
        _ => AiError::provider(format!("HTTP_{status}"), preview, false),
    }
}

fn extract_usage(response: &JsonValue) -> TokenUsage {
    TokenUsage {
        input_tokens: response["usage"]["prompt_tokens"].as_i64().unwrap_or(0),
        output_tokens: response["usage"]["completion_tokens"].as_i64().unwrap_or(0),
    }
}

fn extract_content(response: &JsonValue) -> Result<String, AiError> {
    response["choices"][0]["message"]["content"]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| AiError::provider("BAD_RESPONSE", "missing message content", true))
}

/// Strip markdown code fences some models wrap JSON output in
fn strip_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let inner = inner.strip_prefix("json").unwrap_or(inner);
    inner.strip_suffix("```").unwrap_or(inner).trim()
}

#[async_trait]
impl VlmProvider for OpenAiCompatible {
    fn model(&self) -> &str {
        &self.model
    }

    async fn interpret(&self, request: VlmRequest) -> Result<VlmResponse, AiError> {
        let mut content = vec![json!({"type": "text", "text": request.prompt})];
        for image in &request.images {
            let data_uri = format!("data:{};base64,{}", image.mime, BASE64.encode(&image.data));
            content.push(json!({"type": "image_url", "image_url": {"url": data_uri}}));
        }

        let body = json!({
            "model": self.model,
            "messages": [{"role": "user", "content": content}],
            "response_format": {"type": "json_object"},
        });

        let response = self.post_json("/chat/completions", body).await?;
        let usage = extract_usage(&response);
        let text = extract_content(&response)?;
        let json = serde_json::from_str(strip_fences(&text))
            .map_err(|e| AiError::Parse(format!("response is not valid JSON: {e}")))?;
        Ok(VlmResponse { json, usage })
    }
}

#[async_trait]
impl TextProvider for OpenAiCompatible {
    fn model(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: String) -> Result<TextResponse, AiError> {
        let body = json!({
            "model": self.model,
            "messages": [{"role": "user", "content": prompt}],
        });
        let response = self.post_json("/chat/completions", body).await?;
        let usage = extract_usage(&response);
        let text = extract_content(&response)?;
        Ok(TextResponse { text, usage })
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiCompatible {
    fn model(&self) -> &str {
        &self.model
    }

    async fn embed(&self, text: &str) -> Result<EmbeddingResponse, AiError> {
        let body = json!({
            "model": self.model,
            "input": text,
        });
        let response = self.post_json("/embeddings", body).await?;
        let vector: Vec<f32> = response["data"][0]["embedding"]
            .as_array()
            .ok_or_else(|| AiError::provider("BAD_RESPONSE", "missing embedding array", true))?
            .iter()
            .filter_map(|v| v.as_f64().map(|f| f as f32))
            .collect();
        if vector.is_empty() {
            return Err(AiError::provider("BAD_RESPONSE", "empty embedding", true));
        }
        Ok(EmbeddingResponse {
            vector,
            usage: TokenUsage {
                input_tokens: response["usage"]["prompt_tokens"].as_i64().unwrap_or(0),
                output_tokens: 0,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_fences() {
        assert_eq!(strip_fences(r#"{"a":1}"#), r#"{"a":1}"#);
        assert_eq!(strip_fences("```json\n{\"a\":1}\n```"), r#"{"a":1}"#);
        assert_eq!(strip_fences("```\n{\"a\":1}\n```"), r#"{"a":1}"#);
    }

    #[test]
    fn test_status_mapping() {
        assert!(!map_status_error(401, "").trips_breaker());
        assert!(map_status_error(429, "").trips_breaker());
        assert!(map_status_error(503, "").trips_breaker());
        assert!(!map_status_error(404, "").trips_breaker());
    }

    #[test]
    fn test_from_config_requires_endpoint() {
        let err = OpenAiCompatible::from_config(&ProviderConfig::default(), Capability::Vlm)
            .err()
            .unwrap();
        assert!(matches!(err, AiError::NotConfigured(Capability::Vlm)));
    }
}
