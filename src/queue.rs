use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

use crate::pipeline::TaskRequest;

#[derive(Debug, Error)]
#[error("failed to enqueue task: {0}")]
pub struct DispatchError(pub String);

/// Queue boundary the ingress layer uses to hand documents to the external
/// dispatcher. The dispatcher later calls back into the task intake route
/// with retry metadata.
#[async_trait]
pub trait TaskDispatcher: Send + Sync + 'static {
    async fn dispatch(&self, request: &TaskRequest) -> Result<(), DispatchError>;
}

/// Dispatcher that POSTs the task payload to a queue-fronting endpoint.
pub struct HttpTaskDispatcher {
    http: reqwest::Client,
    queue_url: String,
    auth_token: Option<String>,
}

impl HttpTaskDispatcher {
    pub fn new(queue_url: impl Into<String>, auth_token: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            queue_url: queue_url.into(),
            auth_token,
        }
    }
}

#[async_trait]
impl TaskDispatcher for HttpTaskDispatcher {
    async fn dispatch(&self, request: &TaskRequest) -> Result<(), DispatchError> {
        let mut builder = self.http.post(&self.queue_url).json(request);
        if let Some(token) = &self.auth_token {
            builder = builder.bearer_auth(token);
        }

        let response = builder
            .send()
            .await
            .map_err(|err| DispatchError(err.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(DispatchError(format!("queue returned {status}: {body}")));
        }

        info!(
            document_id = %request.document_id,
            method = %request.method,
            ocr = %request.ocr,
            "queued document for processing"
        );
        Ok(())
    }
}
