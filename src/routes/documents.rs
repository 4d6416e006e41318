use axum::extract::{Json, Multipart, Path, State};
use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::extract::ExtractionMethod;
use crate::models::Document;
use crate::ocr::OcrMode;
use crate::pipeline::{TaskContext, TaskRequest};
use crate::state::AppState;
use crate::storage::parse_blob_uri;
use crate::store::DocumentStatus;

pub const MAX_FILE_SIZE: usize = 50 * 1024 * 1024;

const ALLOWED_TYPES: &[(&str, &str)] = &[
    ("application/pdf", "pdf"),
    (
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "docx",
    ),
    ("image/png", "png"),
    ("image/jpeg", "jpg"),
    ("image/jpg", "jpg"),
];

#[derive(Serialize)]
pub struct DocumentResponse {
    pub id: Uuid,
    pub filename: String,
    pub content_hash: String,
    pub file_type: String,
    pub size_bytes: i64,
    pub status: String,
    pub page_count: Option<i32>,
    pub error_message: Option<String>,
    pub extraction_method: String,
    pub ocr_mode: String,
    pub ocr_processed: Option<bool>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Document> for DocumentResponse {
    fn from(doc: Document) -> Self {
        Self {
            id: doc.id,
            filename: doc.filename,
            content_hash: doc.content_hash,
            file_type: doc.file_type,
            size_bytes: doc.size_bytes,
            status: doc.status,
            page_count: doc.page_count,
            error_message: doc.error_message,
            extraction_method: doc.extraction_method,
            ocr_mode: doc.ocr_mode,
            ocr_processed: doc.ocr_processed,
            created_at: doc.created_at,
            updated_at: doc.updated_at,
        }
    }
}

/// Validate size and type, returning `(content_type, file_type)`.
pub fn validate_file(
    bytes: &[u8],
    content_type: Option<&str>,
    filename: &str,
) -> Result<(String, String), AppError> {
    if bytes.is_empty() {
        return Err(AppError::bad_request("file must not be empty"));
    }
    if bytes.len() > MAX_FILE_SIZE {
        let max_mb = MAX_FILE_SIZE / (1024 * 1024);
        return Err(AppError::payload_too_large(format!(
            "file too large, maximum size is {max_mb}MB"
        )));
    }

    let resolved = match content_type.filter(|value| !value.is_empty()) {
        Some(value) => value.to_string(),
        None => mime_guess::from_path(filename)
            .first_raw()
            .unwrap_or_default()
            .to_string(),
    };

    match ALLOWED_TYPES
        .iter()
        .find(|(mime, _)| *mime == resolved.as_str())
    {
        Some((mime, file_type)) => Ok((mime.to_string(), file_type.to_string())),
        None => {
            let allowed: Vec<&str> = ALLOWED_TYPES.iter().map(|(mime, _)| *mime).collect();
            Err(AppError::bad_request(format!(
                "unsupported file type: {resolved}. Allowed: {}",
                allowed.join(", ")
            )))
        }
    }
}

pub fn compute_content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

struct UploadFields {
    bytes: Vec<u8>,
    filename: String,
    content_type: Option<String>,
    method: ExtractionMethod,
    ocr: OcrMode,
}

async fn read_upload_fields(mut multipart: Multipart) -> Result<UploadFields, AppError> {
    let mut bytes: Option<Vec<u8>> = None;
    let mut filename: Option<String> = None;
    let mut content_type: Option<String> = None;
    let mut method = ExtractionMethod::default();
    let mut ocr = OcrMode::default();

    while let Some(field) = multipart.next_field().await.map_err(|err| {
        error!(error = %err, "invalid multipart data");
        AppError::bad_request(format!("invalid multipart data: {err}"))
    })? {
        let name = field.name().map(|n| n.to_string());
        match name.as_deref() {
            Some("file") => {
                filename = field.file_name().map(|n| n.to_string());
                content_type = field.content_type().map(|mime| mime.to_string());
                let data = field.bytes().await.map_err(|err| {
                    error!(error = %err, "failed to read file bytes");
                    AppError::bad_request(format!("failed to read file bytes: {err}"))
                })?;
                bytes = Some(data.to_vec());
            }
            Some("method") => {
                let value = field
                    .text()
                    .await
                    .map_err(|err| AppError::bad_request(format!("invalid method field: {err}")))?;
                method = value
                    .trim()
                    .parse()
                    .map_err(|err: String| AppError::bad_request(err))?;
            }
            Some("ocr") => {
                let value = field
                    .text()
                    .await
                    .map_err(|err| AppError::bad_request(format!("invalid ocr field: {err}")))?;
                ocr = value
                    .trim()
                    .parse()
                    .map_err(|err: String| AppError::bad_request(err))?;
            }
            _ => {}
        }
    }

    let bytes = bytes.ok_or_else(|| AppError::bad_request("file field is required"))?;
    let filename = filename.ok_or_else(|| AppError::bad_request("filename is required"))?;
    Ok(UploadFields {
        bytes,
        filename,
        content_type,
        method,
        ocr,
    })
}

/// Ingress: validate, hash-dedup, store the blob, create the PENDING row,
/// then hand the document to the dispatcher (or process inline when no
/// dispatcher is configured).
pub async fn upload_document(
    State(state): State<AppState>,
    multipart: Multipart,
) -> AppResult<(StatusCode, Json<DocumentResponse>)> {
    let fields = read_upload_fields(multipart).await?;
    let (content_type, file_type) =
        validate_file(&fields.bytes, fields.content_type.as_deref(), &fields.filename)?;
    let content_hash = compute_content_hash(&fields.bytes);

    if let Some(existing) = state.documents.find_by_hash(&content_hash).await? {
        info!(document_id = %existing.id, %content_hash, "duplicate upload rejected");
        return Err(AppError::conflict(format!(
            "duplicate document exists with id: {}",
            existing.id
        )));
    }

    let document_id = Uuid::new_v4();
    let new_document = crate::models::NewDocument {
        id: document_id,
        filename: fields.filename.clone(),
        content_hash,
        file_type,
        size_bytes: fields.bytes.len() as i64,
        blob_uri: None,
        status: DocumentStatus::Pending.as_str().to_string(),
        extraction_method: fields.method.to_string(),
        ocr_mode: fields.ocr.to_string(),
    };
    let mut document = state.documents.insert(new_document).await?;

    let blob_path = format!("documents/{document_id}/{}", fields.filename);
    let blob_uri = match state
        .storage
        .upload(fields.bytes, &blob_path, Some(content_type))
        .await
    {
        Ok(uri) => uri,
        Err(err) => {
            let message = format!("blob upload failed: {err}");
            state
                .documents
                .finish(document_id, DocumentStatus::Failed, Some(message.clone()))
                .await?;
            error!(document_id = %document_id, error = %err, "blob upload failed");
            return Err(AppError::internal(message));
        }
    };

    // Commit the URI before any heavy work so a crash leaves a recoverable
    // record rather than a lost write.
    state.documents.set_blob_uri(document_id, &blob_uri).await?;

    let task = TaskRequest {
        document_id,
        filename: fields.filename.clone(),
        method: fields.method,
        ocr: fields.ocr,
    };

    match &state.dispatcher {
        Some(dispatcher) => {
            if let Err(err) = dispatcher.dispatch(&task).await {
                error!(document_id = %document_id, error = %err, "failed to queue processing task");
                state
                    .documents
                    .finish(
                        document_id,
                        DocumentStatus::Failed,
                        Some(format!("Failed to queue processing: {err}")),
                    )
                    .await?;
            }
        }
        None => {
            // No dispatcher configured (local development): process inline.
            let outcome = state
                .pipeline
                .run_task(task, TaskContext::first_delivery("inline"))
                .await;
            info!(
                document_id = %document_id,
                status = outcome.status_label(),
                "inline processing finished"
            );
        }
    }

    if let Some(refreshed) = state.documents.get(document_id).await? {
        document = refreshed;
    }

    Ok((StatusCode::CREATED, Json(document.into())))
}

pub async fn get_document(
    State(state): State<AppState>,
    Path(document_id): Path<Uuid>,
) -> AppResult<Json<DocumentResponse>> {
    let document = state
        .documents
        .get(document_id)
        .await?
        .ok_or_else(AppError::not_found)?;
    Ok(Json(document.into()))
}

pub async fn list_documents(
    State(state): State<AppState>,
) -> AppResult<Json<Vec<DocumentResponse>>> {
    let documents = state.documents.list().await?;
    Ok(Json(documents.into_iter().map(Into::into).collect()))
}

pub async fn delete_document(
    State(state): State<AppState>,
    Path(document_id): Path<Uuid>,
) -> AppResult<Json<Value>> {
    let document = state
        .documents
        .get(document_id)
        .await?
        .ok_or_else(AppError::not_found)?;

    // Row first (cascades borrowers and their relations), then the blob.
    let deleted = state.documents.delete(document_id).await?;
    if !deleted {
        return Err(AppError::not_found());
    }

    if let Some(blob_uri) = document.blob_uri.as_deref() {
        match parse_blob_uri(blob_uri) {
            Ok((_, path)) => {
                if let Err(err) = state.storage.delete(&path).await {
                    warn!(document_id = %document_id, error = %err, "failed to delete blob");
                }
            }
            Err(err) => warn!(document_id = %document_id, error = %err, "unparseable blob uri"),
        }
    }

    Ok(Json(json!({ "deleted": document_id })))
}
