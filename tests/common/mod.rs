#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use loandocs::content::{
    ContentExtractor, DocumentContent, DocumentProcessingError, PageContent,
};
use loandocs::extract::llm::{LlmBackend, LlmError, LlmRequest, LlmResponse};
use loandocs::extract::{ExtractionEngine, ExtractionError, ExtractionMethod, ExtractionOutput};
use loandocs::models::Document;
use loandocs::ocr::{OcrBackend, OcrEngine, OcrError, OcrMode, OcrResult};
use loandocs::records::BorrowerRecord;
use loandocs::storage::{ObjectStorage, StorageError};
use loandocs::store::{BorrowerSink, ClaimOutcome, DocumentStatus, DocumentStore};

pub fn document_row(id: Uuid, status: DocumentStatus, blob_uri: Option<String>) -> Document {
    let now = Utc::now();
    Document {
        id,
        filename: "loan.pdf".into(),
        content_hash: format!("{:064x}", id.as_u128()),
        file_type: "pdf".into(),
        size_bytes: 1024,
        blob_uri,
        status: status.as_str().to_string(),
        page_count: None,
        error_message: None,
        extraction_method: "docling".into(),
        ocr_mode: "auto".into(),
        ocr_processed: None,
        created_at: now,
        updated_at: now,
    }
}

pub fn page(page_number: i32, text: &str) -> PageContent {
    PageContent {
        page_number,
        text: text.to_string(),
        tables: Vec::new(),
    }
}

#[derive(Default)]
pub struct FakeStorage {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    pub fail_downloads: bool,
}

impl FakeStorage {
    pub fn failing_downloads() -> Self {
        Self {
            objects: Mutex::new(HashMap::new()),
            fail_downloads: true,
        }
    }

    pub async fn seed(&self, path: &str, bytes: Vec<u8>) {
        let mut guard = self.objects.lock().await;
        guard.insert(path.to_string(), bytes);
    }

    pub async fn object_count(&self) -> usize {
        let guard = self.objects.lock().await;
        guard.len()
    }
}

#[async_trait]
impl ObjectStorage for FakeStorage {
    async fn upload(
        &self,
        bytes: Vec<u8>,
        path: &str,
        _content_type: Option<String>,
    ) -> Result<String, StorageError> {
        let mut guard = self.objects.lock().await;
        guard.insert(path.to_string(), bytes);
        Ok(self.uri_for(path))
    }

    async fn download(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        if self.fail_downloads {
            return Err(StorageError::Other("simulated blob outage".into()));
        }
        let guard = self.objects.lock().await;
        guard
            .get(path)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(path.to_string()))
    }

    async fn exists(&self, path: &str) -> Result<bool, StorageError> {
        let guard = self.objects.lock().await;
        Ok(guard.contains_key(path))
    }

    async fn delete(&self, path: &str) -> Result<(), StorageError> {
        let mut guard = self.objects.lock().await;
        guard.remove(path);
        Ok(())
    }

    fn uri_for(&self, path: &str) -> String {
        format!("s3://test-bucket/{path}")
    }
}

/// In-memory stand-in for the document table with the same claim semantics
/// as the Postgres store.
#[derive(Default)]
pub struct InMemoryDocumentStore {
    docs: Mutex<HashMap<Uuid, Document>>,
}

impl InMemoryDocumentStore {
    pub async fn seed(&self, document: Document) {
        let mut guard = self.docs.lock().await;
        guard.insert(document.id, document);
    }

    pub async fn snapshot(&self, id: Uuid) -> Option<Document> {
        let guard = self.docs.lock().await;
        guard.get(&id).cloned()
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn get(&self, id: Uuid) -> Result<Option<Document>> {
        let guard = self.docs.lock().await;
        Ok(guard.get(&id).cloned())
    }

    async fn find_by_hash(&self, content_hash: &str) -> Result<Option<Document>> {
        let guard = self.docs.lock().await;
        Ok(guard
            .values()
            .find(|doc| doc.content_hash == content_hash)
            .cloned())
    }

    async fn insert(&self, document: loandocs::models::NewDocument) -> Result<Document> {
        let now = Utc::now();
        let row = Document {
            id: document.id,
            filename: document.filename,
            content_hash: document.content_hash,
            file_type: document.file_type,
            size_bytes: document.size_bytes,
            blob_uri: document.blob_uri,
            status: document.status,
            page_count: None,
            error_message: None,
            extraction_method: document.extraction_method,
            ocr_mode: document.ocr_mode,
            ocr_processed: None,
            created_at: now,
            updated_at: now,
        };
        let mut guard = self.docs.lock().await;
        guard.insert(row.id, row.clone());
        Ok(row)
    }

    async fn set_blob_uri(&self, id: Uuid, blob_uri: &str) -> Result<()> {
        let mut guard = self.docs.lock().await;
        let doc = guard.get_mut(&id).ok_or_else(|| anyhow!("missing doc"))?;
        doc.blob_uri = Some(blob_uri.to_string());
        doc.updated_at = Utc::now();
        Ok(())
    }

    async fn claim_processing(&self, id: Uuid) -> Result<ClaimOutcome> {
        let mut guard = self.docs.lock().await;
        let doc = match guard.get_mut(&id) {
            Some(doc) => doc,
            None => return Ok(ClaimOutcome::NotFound),
        };
        match doc.status.parse::<DocumentStatus>().map_err(|e| anyhow!(e))? {
            DocumentStatus::Pending => {
                doc.status = DocumentStatus::Processing.as_str().to_string();
                doc.updated_at = Utc::now();
                Ok(ClaimOutcome::Claimed)
            }
            DocumentStatus::Processing => Ok(ClaimOutcome::AlreadyProcessing),
            status => Ok(ClaimOutcome::Terminal(status)),
        }
    }

    async fn update_progress(&self, id: Uuid, page_count: i32, ocr_processed: bool) -> Result<()> {
        let mut guard = self.docs.lock().await;
        let doc = guard.get_mut(&id).ok_or_else(|| anyhow!("missing doc"))?;
        doc.page_count = Some(page_count);
        doc.ocr_processed = Some(ocr_processed);
        doc.updated_at = Utc::now();
        Ok(())
    }

    async fn finish(
        &self,
        id: Uuid,
        status: DocumentStatus,
        error_message: Option<String>,
    ) -> Result<()> {
        let mut guard = self.docs.lock().await;
        let doc = guard.get_mut(&id).ok_or_else(|| anyhow!("missing doc"))?;
        doc.status = status.as_str().to_string();
        doc.error_message = error_message;
        doc.updated_at = Utc::now();
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Document>> {
        let guard = self.docs.lock().await;
        Ok(guard.values().cloned().collect())
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        let mut guard = self.docs.lock().await;
        Ok(guard.remove(&id).is_some())
    }
}

/// Borrower sink that records persisted names and can be told to reject
/// specific borrowers.
#[derive(Default)]
pub struct RecordingBorrowerSink {
    pub persisted: Mutex<Vec<BorrowerRecord>>,
    pub reject_names: Vec<String>,
}

impl RecordingBorrowerSink {
    pub fn rejecting(names: &[&str]) -> Self {
        Self {
            persisted: Mutex::new(Vec::new()),
            reject_names: names.iter().map(|n| n.to_string()).collect(),
        }
    }

    pub async fn count(&self) -> usize {
        self.persisted.lock().await.len()
    }
}

#[async_trait]
impl BorrowerSink for RecordingBorrowerSink {
    async fn persist(&self, record: &BorrowerRecord, _document_id: Uuid) -> Result<Uuid> {
        if self.reject_names.contains(&record.name) {
            return Err(anyhow!("constraint violation for '{}'", record.name));
        }
        let mut guard = self.persisted.lock().await;
        guard.push(record.clone());
        Ok(record.id)
    }
}

/// OCR engine returning a canned document.
pub struct ScriptedOcrEngine {
    pub content: DocumentContent,
    pub ocr_method: loandocs::ocr::OcrMethod,
    pub calls: AtomicUsize,
}

impl ScriptedOcrEngine {
    pub fn native(content: DocumentContent) -> Self {
        Self {
            content,
            ocr_method: loandocs::ocr::OcrMethod::None,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl OcrEngine for ScriptedOcrEngine {
    async fn process(
        &self,
        _bytes: &[u8],
        _filename: &str,
        _mode: OcrMode,
    ) -> Result<OcrResult, DocumentProcessingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(OcrResult {
            content: self.content.clone(),
            ocr_method: self.ocr_method,
            pages_ocrd: Vec::new(),
        })
    }
}

/// Extraction engine returning canned borrowers.
pub struct ScriptedExtractionEngine {
    pub borrowers: Vec<BorrowerRecord>,
    pub calls: AtomicUsize,
}

impl ScriptedExtractionEngine {
    pub fn returning(borrowers: Vec<BorrowerRecord>) -> Self {
        Self {
            borrowers,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ExtractionEngine for ScriptedExtractionEngine {
    async fn extract(
        &self,
        _document: &DocumentContent,
        _document_id: Uuid,
        _document_name: &str,
        _method: ExtractionMethod,
    ) -> Result<ExtractionOutput, ExtractionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(ExtractionOutput {
            borrowers: self.borrowers.clone(),
            ..Default::default()
        })
    }
}

/// LLM backend that replays a script of responses.
pub struct ScriptedLlm {
    responses: Mutex<Vec<Result<LlmResponse, LlmError>>>,
    pub calls: AtomicUsize,
}

impl ScriptedLlm {
    pub fn new(responses: Vec<Result<LlmResponse, LlmError>>) -> Self {
        Self {
            responses: Mutex::new(responses),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

pub fn llm_ok(payload: serde_json::Value) -> Result<LlmResponse, LlmError> {
    Ok(LlmResponse {
        payload,
        input_tokens: 100,
        output_tokens: 40,
        finish_reason: loandocs::extract::llm::FinishReason::Stop,
    })
}

#[async_trait]
impl LlmBackend for ScriptedLlm {
    async fn generate(&self, _request: LlmRequest) -> Result<LlmResponse, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut guard = self.responses.lock().await;
        if guard.is_empty() {
            return Err(LlmError::Request("script exhausted".into()));
        }
        guard.remove(0)
    }
}

/// Remote OCR fake with a switchable health state.
pub struct FakeOcrBackend {
    pub healthy: bool,
    pub page_text: String,
    pub extract_calls: AtomicUsize,
    pub health_calls: AtomicUsize,
    pub fail_extracts: bool,
}

impl FakeOcrBackend {
    pub fn healthy(page_text: &str) -> Self {
        Self {
            healthy: true,
            page_text: page_text.to_string(),
            extract_calls: AtomicUsize::new(0),
            health_calls: AtomicUsize::new(0),
            fail_extracts: false,
        }
    }

    pub fn unhealthy() -> Self {
        Self {
            healthy: false,
            page_text: String::new(),
            extract_calls: AtomicUsize::new(0),
            health_calls: AtomicUsize::new(0),
            fail_extracts: false,
        }
    }
}

#[async_trait]
impl OcrBackend for FakeOcrBackend {
    async fn extract_text(&self, _image_bytes: &[u8]) -> Result<String, OcrError> {
        self.extract_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_extracts {
            return Err(OcrError::Request("simulated gpu failure".into()));
        }
        Ok(self.page_text.clone())
    }

    async fn health_check(&self) -> bool {
        self.health_calls.fetch_add(1, Ordering::SeqCst);
        self.healthy
    }
}

/// Content extractor with scripted page classifications.
pub struct FakeContentExtractor {
    pub page_lengths: Vec<Option<usize>>,
    pub native_pages: Vec<PageContent>,
    pub ocr_pages: Vec<PageContent>,
    pub process_calls: Mutex<Vec<bool>>,
}

impl FakeContentExtractor {
    pub fn new(page_lengths: Vec<Option<usize>>, native_pages: Vec<PageContent>) -> Self {
        Self {
            page_lengths,
            ocr_pages: native_pages.clone(),
            native_pages,
            process_calls: Mutex::new(Vec::new()),
        }
    }

    pub async fn enable_ocr_calls(&self) -> Vec<bool> {
        self.process_calls.lock().await.clone()
    }
}

impl ContentExtractor for FakeContentExtractor {
    fn process_bytes(
        &self,
        _bytes: &[u8],
        _filename: &str,
        enable_ocr: bool,
    ) -> Result<DocumentContent, DocumentProcessingError> {
        self.process_calls.blocking_lock().push(enable_ocr);
        let pages = if enable_ocr {
            self.ocr_pages.clone()
        } else {
            self.native_pages.clone()
        };
        Ok(DocumentContent::from_pages(
            pages,
            serde_json::Value::Object(Default::default()),
        ))
    }

    fn page_text_lengths(&self, _bytes: &[u8]) -> Result<Vec<Option<usize>>, DocumentProcessingError> {
        Ok(self.page_lengths.clone())
    }

    fn render_page_png(
        &self,
        _bytes: &[u8],
        page_index: usize,
        _dpi: f32,
    ) -> Result<Vec<u8>, DocumentProcessingError> {
        Ok(format!("png-page-{page_index}").into_bytes())
    }
}

pub fn arc<T>(value: T) -> Arc<T> {
    Arc::new(value)
}
