mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use common::{
    arc, document_row, page, FakeStorage, InMemoryDocumentStore, RecordingBorrowerSink,
    ScriptedExtractionEngine, ScriptedOcrEngine,
};
use loandocs::content::DocumentContent;
use loandocs::extract::ExtractionMethod;
use loandocs::ocr::OcrMode;
use loandocs::pipeline::{DocumentPipeline, TaskContext, TaskOutcome, TaskRequest, MAX_RETRY_COUNT};
use loandocs::records::{BorrowerRecord, SourceReference};
use loandocs::store::{DocumentStatus, DocumentStore};

fn borrower(name: &str, document_id: Uuid) -> BorrowerRecord {
    BorrowerRecord {
        id: Uuid::new_v4(),
        name: name.into(),
        ssn: None,
        phone: None,
        email: None,
        address: None,
        income_history: Vec::new(),
        account_numbers: Vec::new(),
        loan_numbers: Vec::new(),
        sources: vec![SourceReference {
            document_id,
            document_name: "loan.pdf".into(),
            page_number: 1,
            section: None,
            snippet: "snippet".into(),
            char_start: None,
            char_end: None,
        }],
        confidence_score: 0.75,
    }
}

fn sample_content() -> DocumentContent {
    DocumentContent::from_pages(
        vec![page(1, "Borrower: John Smith"), page(2, "Income: $85,000")],
        serde_json::Value::Object(Default::default()),
    )
}

fn request(document_id: Uuid) -> TaskRequest {
    TaskRequest {
        document_id,
        filename: "loan.pdf".into(),
        method: ExtractionMethod::Docling,
        ocr: OcrMode::Auto,
    }
}

struct Harness {
    documents: Arc<InMemoryDocumentStore>,
    sink: Arc<RecordingBorrowerSink>,
    storage: Arc<FakeStorage>,
    extraction: Arc<ScriptedExtractionEngine>,
    pipeline: DocumentPipeline,
}

fn harness(
    storage: FakeStorage,
    sink: RecordingBorrowerSink,
    borrowers: Vec<BorrowerRecord>,
) -> Harness {
    let documents = arc(InMemoryDocumentStore::default());
    let sink = arc(sink);
    let storage = arc(storage);
    let ocr = arc(ScriptedOcrEngine::native(sample_content()));
    let extraction = arc(ScriptedExtractionEngine::returning(borrowers));
    let pipeline = DocumentPipeline::new(
        documents.clone(),
        sink.clone(),
        storage.clone(),
        ocr,
        extraction.clone(),
    )
    .with_deadline(Duration::from_secs(30));
    Harness {
        documents,
        sink,
        storage,
        extraction,
        pipeline,
    }
}

async fn seed_pending(harness: &Harness, document_id: Uuid) {
    harness
        .documents
        .seed(document_row(
            document_id,
            DocumentStatus::Pending,
            Some(format!("s3://test-bucket/documents/{document_id}/loan.pdf")),
        ))
        .await;
    harness
        .storage
        .seed(&format!("documents/{document_id}/loan.pdf"), b"%PDF-1.7".to_vec())
        .await;
}

#[tokio::test]
async fn successful_run_completes_and_persists_borrowers() {
    let document_id = Uuid::new_v4();
    let harness = harness(
        FakeStorage::default(),
        RecordingBorrowerSink::default(),
        vec![borrower("John Smith", document_id)],
    );
    seed_pending(&harness, document_id).await;

    let outcome = harness
        .pipeline
        .run_task(request(document_id), TaskContext::first_delivery("t-1"))
        .await;

    assert_eq!(outcome, TaskOutcome::Completed);
    assert_eq!(harness.sink.count().await, 1);

    let doc = harness.documents.snapshot(document_id).await.unwrap();
    assert_eq!(doc.status, "completed");
    assert_eq!(doc.page_count, Some(2));
    assert_eq!(doc.ocr_processed, Some(false));
    assert!(doc.error_message.is_none());
}

#[tokio::test]
async fn completed_documents_are_idempotent() {
    // Scenario: the document finished earlier with one borrower; a duplicate
    // delivery must not reprocess or add rows.
    let document_id = Uuid::new_v4();
    let harness = harness(
        FakeStorage::default(),
        RecordingBorrowerSink::default(),
        vec![borrower("John Smith", document_id)],
    );
    harness
        .documents
        .seed(document_row(document_id, DocumentStatus::Completed, None))
        .await;

    let outcome = harness
        .pipeline
        .run_task(request(document_id), TaskContext::first_delivery("t-dup"))
        .await;

    assert_eq!(outcome, TaskOutcome::AlreadyTerminal(DocumentStatus::Completed));
    assert_eq!(outcome.status_label(), "completed");
    assert_eq!(harness.sink.count().await, 0);
    assert_eq!(harness.extraction.calls.load(Ordering::SeqCst), 0);

    let doc = harness.documents.snapshot(document_id).await.unwrap();
    assert_eq!(doc.status, "completed");
}

#[tokio::test]
async fn failed_documents_stay_failed() {
    let document_id = Uuid::new_v4();
    let harness = harness(
        FakeStorage::default(),
        RecordingBorrowerSink::default(),
        Vec::new(),
    );
    harness
        .documents
        .seed(document_row(document_id, DocumentStatus::Failed, None))
        .await;

    let outcome = harness
        .pipeline
        .run_task(request(document_id), TaskContext::first_delivery("t-f"))
        .await;
    assert_eq!(outcome, TaskOutcome::AlreadyTerminal(DocumentStatus::Failed));
    assert_eq!(outcome.status_label(), "failed");
}

#[tokio::test]
async fn missing_document_fails_without_retry() {
    let harness = harness(
        FakeStorage::default(),
        RecordingBorrowerSink::default(),
        Vec::new(),
    );
    let outcome = harness
        .pipeline
        .run_task(request(Uuid::new_v4()), TaskContext::first_delivery("t-404"))
        .await;
    match outcome {
        TaskOutcome::Failed { error } => assert!(error.contains("Document not found")),
        other => panic!("expected Failed, got {other:?}"),
    }
}

#[tokio::test]
async fn duplicate_first_delivery_exits_in_flight() {
    let document_id = Uuid::new_v4();
    let harness = harness(
        FakeStorage::default(),
        RecordingBorrowerSink::default(),
        Vec::new(),
    );
    harness
        .documents
        .seed(document_row(document_id, DocumentStatus::Processing, None))
        .await;

    let outcome = harness
        .pipeline
        .run_task(request(document_id), TaskContext::first_delivery("t-race"))
        .await;

    assert_eq!(outcome, TaskOutcome::InFlight);
    assert!(!outcome.wants_retry());
    assert_eq!(harness.extraction.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn zero_borrowers_still_completes() {
    let document_id = Uuid::new_v4();
    let harness = harness(
        FakeStorage::default(),
        RecordingBorrowerSink::default(),
        Vec::new(),
    );
    seed_pending(&harness, document_id).await;

    let outcome = harness
        .pipeline
        .run_task(request(document_id), TaskContext::first_delivery("t-0"))
        .await;

    assert_eq!(outcome, TaskOutcome::Completed);
    let doc = harness.documents.snapshot(document_id).await.unwrap();
    assert_eq!(doc.status, "completed");
    assert!(doc.error_message.is_none());
}

#[tokio::test]
async fn partial_persistence_completes_with_partial_message() {
    // Scenario: three extracted borrowers, the store rejects the third.
    let document_id = Uuid::new_v4();
    let harness = harness(
        FakeStorage::default(),
        RecordingBorrowerSink::rejecting(&["Charlie Brown"]),
        vec![
            borrower("Alice Adams", document_id),
            borrower("Bob Baker", document_id),
            borrower("Charlie Brown", document_id),
        ],
    );
    seed_pending(&harness, document_id).await;

    let outcome = harness
        .pipeline
        .run_task(request(document_id), TaskContext::first_delivery("t-p"))
        .await;

    assert_eq!(outcome, TaskOutcome::Completed);
    assert_eq!(harness.sink.count().await, 2);

    let doc = harness.documents.snapshot(document_id).await.unwrap();
    assert_eq!(doc.status, "completed");
    let message = doc.error_message.unwrap();
    assert!(message.contains("Partial success: 2/3"), "message: {message}");
}

#[tokio::test]
async fn total_persistence_failure_fails_the_document() {
    let document_id = Uuid::new_v4();
    let harness = harness(
        FakeStorage::default(),
        RecordingBorrowerSink::rejecting(&["Alice Adams", "Bob Baker"]),
        vec![
            borrower("Alice Adams", document_id),
            borrower("Bob Baker", document_id),
        ],
    );
    seed_pending(&harness, document_id).await;

    let outcome = harness
        .pipeline
        .run_task(request(document_id), TaskContext::first_delivery("t-tp"))
        .await;

    match outcome {
        TaskOutcome::Failed { error } => assert!(error.contains("persistence failed")),
        other => panic!("expected Failed, got {other:?}"),
    }
    let doc = harness.documents.snapshot(document_id).await.unwrap();
    assert_eq!(doc.status, "failed");
}

#[tokio::test]
async fn missing_blob_uri_is_transient() {
    let document_id = Uuid::new_v4();
    let harness = harness(
        FakeStorage::default(),
        RecordingBorrowerSink::default(),
        Vec::new(),
    );
    harness
        .documents
        .seed(document_row(document_id, DocumentStatus::Pending, None))
        .await;

    let outcome = harness
        .pipeline
        .run_task(request(document_id), TaskContext::first_delivery("t-uri"))
        .await;

    assert!(outcome.wants_retry());
}

#[tokio::test]
async fn blob_outage_retries_then_exhausts_the_budget() {
    // Scenario: the blob download raises on every delivery. Retry counts
    // 0 through 3 ask for redelivery; retry count 4 is final.
    let document_id = Uuid::new_v4();
    let harness = harness(
        FakeStorage::failing_downloads(),
        RecordingBorrowerSink::default(),
        Vec::new(),
    );
    seed_pending(&harness, document_id).await;

    for retry_count in 0..MAX_RETRY_COUNT {
        let outcome = harness
            .pipeline
            .run_task(
                request(document_id),
                TaskContext {
                    task_name: format!("t-{retry_count}"),
                    retry_count,
                },
            )
            .await;
        assert!(outcome.wants_retry(), "retry {retry_count} should request redelivery");
        let doc = harness.documents.snapshot(document_id).await.unwrap();
        assert_eq!(doc.status, "processing");
    }

    let outcome = harness
        .pipeline
        .run_task(
            request(document_id),
            TaskContext {
                task_name: "t-final".into(),
                retry_count: MAX_RETRY_COUNT,
            },
        )
        .await;

    match outcome {
        TaskOutcome::Failed { error } => {
            assert!(error.contains("Max retries exhausted"), "error: {error}")
        }
        other => panic!("expected Failed, got {other:?}"),
    }
    let doc = harness.documents.snapshot(document_id).await.unwrap();
    assert_eq!(doc.status, "failed");
    assert!(doc.error_message.unwrap().contains("Max retries exhausted"));
}

#[tokio::test]
async fn status_never_regresses_from_terminal() {
    let document_id = Uuid::new_v4();
    let harness = harness(
        FakeStorage::default(),
        RecordingBorrowerSink::default(),
        vec![borrower("John Smith", document_id)],
    );
    seed_pending(&harness, document_id).await;

    let first = harness
        .pipeline
        .run_task(request(document_id), TaskContext::first_delivery("t-1"))
        .await;
    assert_eq!(first, TaskOutcome::Completed);

    // Redeliveries after completion observe the terminal state untouched.
    for retry_count in 0..=MAX_RETRY_COUNT {
        let outcome = harness
            .pipeline
            .run_task(
                request(document_id),
                TaskContext {
                    task_name: "t-again".into(),
                    retry_count,
                },
            )
            .await;
        assert_eq!(outcome, TaskOutcome::AlreadyTerminal(DocumentStatus::Completed));
    }
    assert_eq!(harness.sink.count().await, 1);
    let doc = harness.documents.snapshot(document_id).await.unwrap();
    assert_eq!(doc.status, "completed");
}

#[tokio::test]
async fn progress_is_flushed_before_extraction() {
    let document_id = Uuid::new_v4();
    let harness = harness(
        FakeStorage::default(),
        RecordingBorrowerSink::default(),
        Vec::new(),
    );
    seed_pending(&harness, document_id).await;

    harness
        .pipeline
        .run_task(request(document_id), TaskContext::first_delivery("t-pc"))
        .await;

    let doc = harness.documents.snapshot(document_id).await.unwrap();
    assert_eq!(doc.page_count, Some(2));
    assert_eq!(doc.ocr_processed, Some(false));
}
