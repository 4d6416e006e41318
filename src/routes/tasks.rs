use axum::extract::{Json, State};
use axum::http::{HeaderMap, StatusCode};
use serde::Serialize;

use crate::pipeline::{TaskContext, TaskOutcome, TaskRequest};
use crate::state::AppState;

pub const TASK_NAME_HEADER: &str = "x-task-name";
pub const TASK_RETRY_COUNT_HEADER: &str = "x-task-retry-count";

#[derive(Debug, Serialize)]
pub struct ProcessDocumentResponse {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub fn task_context_from_headers(headers: &HeaderMap) -> TaskContext {
    let task_name = headers
        .get(TASK_NAME_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("unknown")
        .to_string();
    let retry_count = headers
        .get(TASK_RETRY_COUNT_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse().ok())
        .unwrap_or(0);
    TaskContext {
        task_name,
        retry_count,
    }
}

pub fn outcome_response(outcome: &TaskOutcome) -> (StatusCode, ProcessDocumentResponse) {
    let status = if outcome.wants_retry() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (
        status,
        ProcessDocumentResponse {
            status: outcome.status_label().to_string(),
            error: outcome.error().map(String::from),
        },
    )
}

/// Task intake: the dispatcher delivers one processing request per call.
/// 200 means final (completed or permanently failed); 503 requests another
/// delivery.
pub async fn process_document(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<TaskRequest>,
) -> (StatusCode, Json<ProcessDocumentResponse>) {
    let context = task_context_from_headers(&headers);
    let outcome = state.pipeline.run_task(payload, context).await;
    let (status, body) = outcome_response(&outcome);
    (status, Json(body))
}
