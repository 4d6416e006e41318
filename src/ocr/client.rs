use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use serde_json::json;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{info, warn};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
pub const HEALTH_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_MAX_TOKENS: u32 = 3072;

#[derive(Debug, Error)]
pub enum OcrError {
    #[error("empty image bytes provided")]
    EmptyImage,
    #[error("request failed with status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("request failed: {0}")]
    Request(String),
    #[error("invalid response format: {0}")]
    InvalidResponse(String),
    #[error("gpu service unhealthy")]
    Unhealthy,
    #[error("ocr circuit breaker open")]
    BreakerOpen,
}

/// Remote OCR service boundary. The production implementation talks to the
/// GPU service; tests script it.
#[async_trait]
pub trait OcrBackend: Send + Sync + 'static {
    async fn extract_text(&self, image_bytes: &[u8]) -> Result<String, OcrError>;
    async fn health_check(&self) -> bool;
}

/// Client for the GPU OCR service, which exposes a vLLM OpenAI-compatible
/// chat endpoint taking one base64 image per request.
pub struct GpuOcrClient {
    http: reqwest::Client,
    service_url: String,
    auth_token: Option<String>,
    model_id: String,
    max_tokens: u32,
    timeout: Duration,
}

impl GpuOcrClient {
    pub fn new(service_url: impl Into<String>, auth_token: Option<String>, model_id: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            service_url: service_url.into().trim_end_matches('/').to_string(),
            auth_token,
            model_id: model_id.into(),
            max_tokens: DEFAULT_MAX_TOKENS,
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn detect_content_type(image_bytes: &[u8]) -> &'static str {
        if image_bytes.starts_with(b"\x89PNG\r\n\x1a\n") {
            return "image/png";
        }
        if image_bytes.starts_with(b"\xff\xd8") {
            return "image/jpeg";
        }
        "image/jpeg"
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Poll the health endpoint with exponential backoff, tolerating GPU
    /// cold starts that can take up to a couple of minutes.
    pub async fn health_check_with_retry(&self, max_wait: Duration) -> bool {
        let mut delay = Duration::from_secs(1);
        let mut waited = Duration::ZERO;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            if self.health_check().await {
                if attempt > 1 {
                    info!(attempts = attempt, waited_secs = waited.as_secs(), "gpu service became healthy");
                }
                return true;
            }
            if waited >= max_wait {
                warn!(attempts = attempt, waited_secs = waited.as_secs(), "gpu service did not become healthy");
                return false;
            }
            let wait = delay.min(max_wait - waited);
            info!(attempt, wait_secs = wait.as_secs(), "gpu service not ready, retrying");
            sleep(wait).await;
            waited += wait;
            delay *= 2;
        }
    }
}

#[async_trait]
impl OcrBackend for GpuOcrClient {
    async fn extract_text(&self, image_bytes: &[u8]) -> Result<String, OcrError> {
        if image_bytes.is_empty() {
            return Err(OcrError::EmptyImage);
        }

        let content_type = Self::detect_content_type(image_bytes);
        let encoded = base64::engine::general_purpose::STANDARD.encode(image_bytes);
        let image_url = format!("data:{content_type};base64,{encoded}");

        let payload = json!({
            "model": self.model_id,
            "messages": [{
                "role": "user",
                "content": [{
                    "type": "image_url",
                    "image_url": { "url": image_url },
                }],
            }],
            "max_tokens": self.max_tokens,
        });

        let response = self
            .authorize(self.http.post(format!("{}/v1/chat/completions", self.service_url)))
            .timeout(self.timeout)
            .json(&payload)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    OcrError::Timeout(self.timeout)
                } else {
                    OcrError::Request(err.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let body: String = body.chars().take(500).collect();
            return Err(OcrError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let result: serde_json::Value = response
            .json()
            .await
            .map_err(|err| OcrError::InvalidResponse(err.to_string()))?;

        let text = result["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| OcrError::InvalidResponse("missing choices[0].message.content".into()))?;
        Ok(text.to_string())
    }

    async fn health_check(&self) -> bool {
        let response = self
            .authorize(self.http.get(format!("{}/v1/models", self.service_url)))
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await;

        match response {
            Ok(response) if response.status().is_success() => {
                match response.json::<serde_json::Value>().await {
                    Ok(body) => body["data"]
                        .as_array()
                        .map(|models| {
                            models
                                .iter()
                                .any(|model| model["id"].as_str() == Some(self.model_id.as_str()))
                        })
                        .unwrap_or(false),
                    Err(err) => {
                        warn!(error = %err, "health check returned unreadable body");
                        false
                    }
                }
            }
            Ok(response) => {
                warn!(status = %response.status(), "health check failed");
                false
            }
            Err(err) => {
                warn!(error = %err, "health check failed");
                false
            }
        }
    }
}
