use std::{fmt, str::FromStr, sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::sleep;
use tracing::{info, warn};
use uuid::Uuid;

use crate::content::DocumentContent;

pub mod chunker;
pub mod complexity;
pub mod confidence;
pub mod consistency;
pub mod dedup;
pub mod extractor;
pub mod grounded;
pub mod llm;
pub mod validation;

pub use extractor::{BorrowerExtractor, ExtractionOutput, Reconciler};
pub use grounded::GroundedExtractor;
pub use llm::{GeminiClient, LlmBackend, LlmError};

/// Substrings marking an opaque error message as transient, matched against
/// the lowercased printable form.
const TRANSIENT_MARKERS: &[&str] = &["503", "429", "timeout", "overloaded", "rate limit"];

pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_BASE: Duration = Duration::from_secs(4);
pub const DEFAULT_RETRY_MAX_WAIT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractionMethod {
    Docling,
    Langextract,
    Auto,
}

impl Default for ExtractionMethod {
    fn default() -> Self {
        ExtractionMethod::Docling
    }
}

impl fmt::Display for ExtractionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExtractionMethod::Docling => write!(f, "docling"),
            ExtractionMethod::Langextract => write!(f, "langextract"),
            ExtractionMethod::Auto => write!(f, "auto"),
        }
    }
}

impl FromStr for ExtractionMethod {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "docling" => Ok(ExtractionMethod::Docling),
            "langextract" => Ok(ExtractionMethod::Langextract),
            "auto" => Ok(ExtractionMethod::Auto),
            other => Err(format!("unknown extraction method: {other}")),
        }
    }
}

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("extraction failed: {0}")]
    Fatal(String),
    #[error("extraction failed after retries: {0}")]
    Transient(String),
}

/// Extraction boundary the task pipeline depends on.
#[async_trait]
pub trait ExtractionEngine: Send + Sync + 'static {
    async fn extract(
        &self,
        document: &DocumentContent,
        document_id: Uuid,
        document_name: &str,
        method: ExtractionMethod,
    ) -> Result<ExtractionOutput, ExtractionError>;
}

/// Exponential backoff budget for transient extraction failures. Every
/// `extract` call gets a fresh counter; nothing leaks across requests.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base: Duration,
    pub max_wait: Duration,
}

impl RetryPolicy {
    pub fn wait_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let wait = self.base.saturating_mul(2u32.saturating_pow(exponent));
        wait.min(self.max_wait)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_RETRY_ATTEMPTS,
            base: DEFAULT_RETRY_BASE,
            max_wait: DEFAULT_RETRY_MAX_WAIT,
        }
    }
}

/// Classify an extraction-path error. Structured kinds from the LLM client
/// are consulted first; opaque messages fall back to substring matching.
pub fn is_transient(error: &LlmError) -> bool {
    if error.is_known_transient() {
        return true;
    }
    is_transient_message(&error.to_string())
}

pub fn is_transient_message(message: &str) -> bool {
    let lowered = message.to_lowercase();
    TRANSIENT_MARKERS.iter().any(|marker| lowered.contains(marker))
}

/// Routes between the page-level extractor and the character-grounded
/// extractor, retrying transient failures and falling back in auto mode.
pub struct ExtractionRouter {
    extractor: BorrowerExtractor,
    grounded: GroundedExtractor,
    retry: RetryPolicy,
}

impl ExtractionRouter {
    pub fn new(extractor: BorrowerExtractor, grounded: GroundedExtractor) -> Self {
        Self {
            extractor,
            grounded,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Run the grounded extractor under the transient-retry budget. Fatal
    /// errors are returned immediately; transient errors are retried with
    /// exponential backoff until the budget is spent.
    async fn try_grounded(
        &self,
        document: &DocumentContent,
        document_id: Uuid,
        document_name: &str,
    ) -> Result<ExtractionOutput, ExtractionError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.grounded.extract(document, document_id, document_name).await {
                Ok(output) => return Ok(output),
                Err(error) if is_transient(&error) => {
                    if attempt >= self.retry.attempts {
                        return Err(ExtractionError::Transient(error.to_string()));
                    }
                    let wait = self.retry.wait_for(attempt);
                    warn!(
                        %document_id,
                        attempt,
                        wait_secs = wait.as_secs(),
                        error = %error,
                        "transient extraction error, backing off"
                    );
                    sleep(wait).await;
                }
                Err(error) => return Err(ExtractionError::Fatal(error.to_string())),
            }
        }
    }

    async fn docling(
        &self,
        document: &DocumentContent,
        document_id: Uuid,
        document_name: &str,
    ) -> Result<ExtractionOutput, ExtractionError> {
        self.extractor
            .extract(document, document_id, document_name)
            .await
            .map_err(|error| {
                if is_transient(&error) {
                    ExtractionError::Transient(error.to_string())
                } else {
                    ExtractionError::Fatal(error.to_string())
                }
            })
    }
}

#[async_trait]
impl ExtractionEngine for ExtractionRouter {
    async fn extract(
        &self,
        document: &DocumentContent,
        document_id: Uuid,
        document_name: &str,
        method: ExtractionMethod,
    ) -> Result<ExtractionOutput, ExtractionError> {
        info!(%document_id, %method, "extraction method chosen");
        match method {
            ExtractionMethod::Docling => self.docling(document, document_id, document_name).await,
            ExtractionMethod::Langextract => {
                self.try_grounded(document, document_id, document_name).await
            }
            ExtractionMethod::Auto => {
                match self.try_grounded(document, document_id, document_name).await {
                    Ok(output) => Ok(output),
                    Err(error) => {
                        warn!(
                            %document_id,
                            error = %error,
                            "grounded extraction unavailable, falling back"
                        );
                        self.docling(document, document_id, document_name).await
                    }
                }
            }
        }
    }
}
