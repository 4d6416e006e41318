use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::timeout;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::content::DocumentProcessingError;
use crate::extract::{ExtractionEngine, ExtractionMethod};
use crate::ocr::{OcrEngine, OcrMethod, OcrMode};
use crate::storage::{parse_blob_uri, ObjectStorage, StorageError};
use crate::store::{BorrowerSink, ClaimOutcome, DocumentStatus, DocumentStore};

/// Retry budget: deliveries carry a 0-based retry count, so 4 prior retries
/// means the fifth invocation is the last.
pub const MAX_RETRY_COUNT: u32 = 4;

pub const DEFAULT_TASK_DEADLINE: Duration = Duration::from_secs(540);

/// One processing request as delivered by the dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    pub document_id: Uuid,
    pub filename: String,
    #[serde(default)]
    pub method: ExtractionMethod,
    #[serde(default)]
    pub ocr: OcrMode,
}

/// Transport metadata accompanying a delivery.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task_name: String,
    pub retry_count: u32,
}

impl TaskContext {
    pub fn first_delivery(task_name: impl Into<String>) -> Self {
        Self {
            task_name: task_name.into(),
            retry_count: 0,
        }
    }
}

/// Outcome of one task invocation, mapped by the intake route onto HTTP
/// status codes: `Retry` asks the dispatcher for another delivery (503),
/// everything else is final (200).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    /// Document was already terminal; the stored state is echoed back.
    AlreadyTerminal(DocumentStatus),
    /// Another in-flight delivery holds the document.
    InFlight,
    Failed { error: String },
    Retry { error: String },
}

impl TaskOutcome {
    pub fn wants_retry(&self) -> bool {
        matches!(self, TaskOutcome::Retry { .. })
    }

    pub fn status_label(&self) -> &'static str {
        match self {
            TaskOutcome::Completed => "completed",
            TaskOutcome::AlreadyTerminal(DocumentStatus::Completed) => "completed",
            TaskOutcome::AlreadyTerminal(_) => "failed",
            TaskOutcome::InFlight => "processing",
            TaskOutcome::Failed { .. } => "failed",
            TaskOutcome::Retry { .. } => "retrying",
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            TaskOutcome::Failed { error } | TaskOutcome::Retry { error } => Some(error),
            _ => None,
        }
    }
}

enum PipelineError {
    /// Unparseable document; never retried.
    Permanent(String),
    /// Everything else; retried until the budget is spent.
    Transient(String),
}

impl From<DocumentProcessingError> for PipelineError {
    fn from(err: DocumentProcessingError) -> Self {
        PipelineError::Permanent(format!("Document processing failed: {}", err.message))
    }
}

struct TaskSuccess {
    borrower_count: usize,
    persisted: usize,
    status: DocumentStatus,
    error_message: Option<String>,
}

/// Drives one document through PENDING -> PROCESSING -> terminal. This is
/// the only component that writes document status or commits borrowers.
pub struct DocumentPipeline {
    documents: Arc<dyn DocumentStore>,
    borrowers: Arc<dyn BorrowerSink>,
    storage: Arc<dyn ObjectStorage>,
    ocr: Arc<dyn OcrEngine>,
    extraction: Arc<dyn ExtractionEngine>,
    deadline: Duration,
}

impl DocumentPipeline {
    pub fn new(
        documents: Arc<dyn DocumentStore>,
        borrowers: Arc<dyn BorrowerSink>,
        storage: Arc<dyn ObjectStorage>,
        ocr: Arc<dyn OcrEngine>,
        extraction: Arc<dyn ExtractionEngine>,
    ) -> Self {
        Self {
            documents,
            borrowers,
            storage,
            ocr,
            extraction,
            deadline: DEFAULT_TASK_DEADLINE,
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    pub async fn run_task(&self, request: TaskRequest, context: TaskContext) -> TaskOutcome {
        info!(
            document_id = %request.document_id,
            task = %context.task_name,
            retry = context.retry_count,
            method = %request.method,
            ocr = %request.ocr,
            "processing document task"
        );

        // Claim before any heavy work; terminal states are idempotent no-ops.
        let claim = match self.documents.claim_processing(request.document_id).await {
            Ok(claim) => claim,
            Err(err) => {
                return self
                    .transient_outcome(&request, &context, format!("claim failed: {err}"))
                    .await;
            }
        };

        match claim {
            ClaimOutcome::NotFound => {
                error!(document_id = %request.document_id, "document not found");
                return TaskOutcome::Failed {
                    error: format!("Document not found: {}", request.document_id),
                };
            }
            ClaimOutcome::Terminal(status) => {
                info!(
                    document_id = %request.document_id,
                    status = %status,
                    "document already processed, skipping"
                );
                return TaskOutcome::AlreadyTerminal(status);
            }
            ClaimOutcome::AlreadyProcessing if context.retry_count == 0 => {
                // Duplicate first delivery racing another worker; that worker
                // owns the document now.
                info!(
                    document_id = %request.document_id,
                    "document claimed by a concurrent delivery, exiting"
                );
                return TaskOutcome::InFlight;
            }
            ClaimOutcome::Claimed | ClaimOutcome::AlreadyProcessing => {}
        }

        let work = self.run_inner(&request);
        let result = match timeout(self.deadline, work).await {
            Ok(result) => result,
            Err(_) => Err(PipelineError::Transient(format!(
                "task deadline of {}s exceeded",
                self.deadline.as_secs()
            ))),
        };

        match result {
            Ok(success) => {
                if let Err(err) = self
                    .documents
                    .finish(
                        request.document_id,
                        success.status,
                        success.error_message.clone(),
                    )
                    .await
                {
                    return self
                        .transient_outcome(
                            &request,
                            &context,
                            format!("terminal status write failed: {err}"),
                        )
                        .await;
                }
                info!(
                    document_id = %request.document_id,
                    status = %success.status,
                    borrowers = success.borrower_count,
                    persisted = success.persisted,
                    "document processed"
                );
                match success.status {
                    DocumentStatus::Completed => TaskOutcome::Completed,
                    _ => TaskOutcome::Failed {
                        error: success.error_message.unwrap_or_default(),
                    },
                }
            }
            Err(PipelineError::Permanent(message)) => {
                error!(document_id = %request.document_id, error = %message, "permanent failure");
                if let Err(err) = self
                    .documents
                    .finish(request.document_id, DocumentStatus::Failed, Some(message.clone()))
                    .await
                {
                    error!(document_id = %request.document_id, error = %err, "failed to mark document failed");
                }
                TaskOutcome::Failed { error: message }
            }
            Err(PipelineError::Transient(message)) => {
                self.transient_outcome(&request, &context, message).await
            }
        }
    }

    /// A transient failure turns into a retry request until the budget is
    /// exhausted, then a terminal FAILED.
    async fn transient_outcome(
        &self,
        request: &TaskRequest,
        context: &TaskContext,
        message: String,
    ) -> TaskOutcome {
        error!(
            document_id = %request.document_id,
            retry = context.retry_count,
            error = %message,
            "task failed"
        );

        if context.retry_count >= MAX_RETRY_COUNT {
            let final_message = format!(
                "Max retries exhausted after {} attempts: {message}",
                context.retry_count + 1
            );
            if let Err(err) = self
                .documents
                .finish(
                    request.document_id,
                    DocumentStatus::Failed,
                    Some(final_message),
                )
                .await
            {
                error!(document_id = %request.document_id, error = %err, "failed to mark document failed");
            }
            return TaskOutcome::Failed {
                error: format!("Max retries exhausted: {message}"),
            };
        }

        TaskOutcome::Retry {
            error: format!("Processing failed (attempt {}): {message}", context.retry_count + 1),
        }
    }

    async fn run_inner(&self, request: &TaskRequest) -> Result<TaskSuccess, PipelineError> {
        let document = self
            .documents
            .get(request.document_id)
            .await
            .map_err(|err| PipelineError::Transient(format!("document read failed: {err}")))?
            .ok_or_else(|| {
                PipelineError::Transient(format!("document row vanished: {}", request.document_id))
            })?;

        // A concurrent uploader may still be committing the URI.
        let blob_uri = document
            .blob_uri
            .as_deref()
            .ok_or_else(|| PipelineError::Transient("document has no blob URI".into()))?;

        let (_, blob_path) = parse_blob_uri(blob_uri)
            .map_err(|err| PipelineError::Transient(format!("bad blob uri: {err}")))?;
        let bytes = self.storage.download(&blob_path).await.map_err(|err| match err {
            StorageError::NotFound(path) => {
                PipelineError::Transient(format!("blob missing at {path}"))
            }
            StorageError::Other(message) => PipelineError::Transient(message),
        })?;

        let ocr_result = self
            .ocr
            .process(&bytes, &request.filename, request.ocr)
            .await?;
        let ocr_processed = ocr_result.ocr_method != OcrMethod::None;
        info!(
            document_id = %request.document_id,
            ocr_method = %ocr_result.ocr_method,
            pages_ocrd = ocr_result.pages_ocrd.len(),
            ocr_processed,
            "ocr routing complete"
        );

        self.documents
            .update_progress(
                request.document_id,
                ocr_result.content.page_count,
                ocr_processed,
            )
            .await
            .map_err(|err| PipelineError::Transient(format!("progress write failed: {err}")))?;

        let output = self
            .extraction
            .extract(
                &ocr_result.content,
                request.document_id,
                &request.filename,
                request.method,
            )
            .await
            .map_err(|err| PipelineError::Transient(err.to_string()))?;

        let total = output.borrowers.len();
        let mut persisted = 0usize;
        let mut persistence_errors: Vec<String> = Vec::new();
        for borrower in &output.borrowers {
            match self.borrowers.persist(borrower, request.document_id).await {
                Ok(_) => {
                    persisted += 1;
                    info!(
                        document_id = %request.document_id,
                        borrower = %borrower.name,
                        "persisted borrower"
                    );
                }
                Err(err) => {
                    warn!(
                        document_id = %request.document_id,
                        borrower = %borrower.name,
                        error = %err,
                        "failed to persist borrower"
                    );
                    persistence_errors.push(format!("'{}': {err}", borrower.name));
                }
            }
        }

        // Zero extracted borrowers is a valid completed document. All
        // attempted borrowers failing is not.
        let (status, error_message) = if total > 0 && persisted == 0 {
            (
                DocumentStatus::Failed,
                Some(format!(
                    "Borrower persistence failed for all {total} borrowers: {}",
                    persistence_errors.join("; ")
                )),
            )
        } else if persisted < total {
            (
                DocumentStatus::Completed,
                Some(format!(
                    "Partial success: {persisted}/{total} borrowers persisted ({})",
                    persistence_errors.join("; ")
                )),
            )
        } else {
            (DocumentStatus::Completed, None)
        };

        Ok(TaskSuccess {
            borrower_count: total,
            persisted,
            status,
            error_message,
        })
    }
}
