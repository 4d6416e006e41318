use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);
/// Temperature the target model family requires for structured output.
pub const REQUIRED_TEMPERATURE: f32 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelTier {
    Flash,
    Pro,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    MaxTokens,
    Other,
}

#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub system_instruction: String,
    pub prompt: String,
    pub response_schema: Value,
    pub tier: ModelTier,
}

#[derive(Debug, Clone)]
pub struct LlmResponse {
    /// Parsed JSON payload, already coerced by the response schema.
    pub payload: Value,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub finish_reason: FinishReason,
}

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("llm request failed with status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("llm request timed out after {0:?}")]
    Timeout(Duration),
    #[error("llm request failed: {0}")]
    Request(String),
    #[error("llm response invalid: {0}")]
    InvalidResponse(String),
    #[error("llm output truncated before completion")]
    Truncated,
}

impl LlmError {
    /// Structured transient classification. Opaque errors fall back to the
    /// router's substring matching.
    pub fn is_known_transient(&self) -> bool {
        match self {
            LlmError::Status { status, .. } => {
                matches!(status, 429 | 502 | 503 | 504)
            }
            LlmError::Timeout(_) => true,
            LlmError::Request(_) => true,
            LlmError::InvalidResponse(_) | LlmError::Truncated => false,
        }
    }
}

/// Structured-output LLM boundary: schema-coerced generation with
/// per-request token accounting. Holds no per-request state.
#[async_trait]
pub trait LlmBackend: Send + Sync + 'static {
    async fn generate(&self, request: LlmRequest) -> Result<LlmResponse, LlmError>;
}

/// Client for the Gemini generateContent API.
pub struct GeminiClient {
    http: reqwest::Client,
    api_base: String,
    api_key: String,
    flash_model: String,
    pro_model: String,
    timeout: Duration,
}

impl GeminiClient {
    pub fn new(
        api_base: impl Into<String>,
        api_key: impl Into<String>,
        flash_model: impl Into<String>,
        pro_model: impl Into<String>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_base: api_base.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            flash_model: flash_model.into(),
            pro_model: pro_model.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn model_for(&self, tier: ModelTier) -> &str {
        match tier {
            ModelTier::Flash => &self.flash_model,
            ModelTier::Pro => &self.pro_model,
        }
    }

    fn parse_response(body: Value) -> Result<LlmResponse, LlmError> {
        let candidate = body["candidates"]
            .get(0)
            .ok_or_else(|| LlmError::InvalidResponse("missing candidates".into()))?;

        let finish_reason = match candidate["finishReason"].as_str() {
            Some("STOP") | None => FinishReason::Stop,
            Some("MAX_TOKENS") => FinishReason::MaxTokens,
            Some(_) => FinishReason::Other,
        };
        if finish_reason == FinishReason::MaxTokens {
            return Err(LlmError::Truncated);
        }

        let text = candidate["content"]["parts"]
            .get(0)
            .and_then(|part| part["text"].as_str())
            .ok_or_else(|| LlmError::InvalidResponse("missing content parts".into()))?;

        let payload: Value = serde_json::from_str(text)
            .map_err(|err| LlmError::InvalidResponse(format!("payload not valid JSON: {err}")))?;

        let usage = &body["usageMetadata"];
        Ok(LlmResponse {
            payload,
            input_tokens: usage["promptTokenCount"].as_u64().unwrap_or(0),
            output_tokens: usage["candidatesTokenCount"].as_u64().unwrap_or(0),
            finish_reason,
        })
    }
}

#[async_trait]
impl LlmBackend for GeminiClient {
    async fn generate(&self, request: LlmRequest) -> Result<LlmResponse, LlmError> {
        let model = self.model_for(request.tier);
        let url = format!("{}/v1beta/models/{}:generateContent", self.api_base, model);

        let payload = json!({
            "system_instruction": { "parts": [{ "text": request.system_instruction }] },
            "contents": [{ "role": "user", "parts": [{ "text": request.prompt }] }],
            "generationConfig": {
                "temperature": REQUIRED_TEMPERATURE,
                "response_mime_type": "application/json",
                "response_schema": request.response_schema,
            },
        });

        debug!(%model, "sending structured extraction request");
        let response = self
            .http
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .timeout(self.timeout)
            .json(&payload)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    LlmError::Timeout(self.timeout)
                } else {
                    LlmError::Request(err.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let body: String = body.chars().take(500).collect();
            return Err(LlmError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body: Value = response
            .json()
            .await
            .map_err(|err| LlmError::InvalidResponse(err.to_string()))?;
        Self::parse_response(body)
    }
}
