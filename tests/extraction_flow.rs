mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use serde_json::json;
use uuid::Uuid;

use common::{arc, llm_ok, page, FakeContentExtractor, FakeOcrBackend, ScriptedLlm};
use loandocs::content::{DocumentContent, PageContent};
use loandocs::extract::llm::LlmError;
use loandocs::extract::{
    BorrowerExtractor, ExtractionEngine, ExtractionError, ExtractionMethod, ExtractionRouter,
    GroundedExtractor, RetryPolicy,
};
use loandocs::ocr::{CircuitBreaker, OcrEngine, OcrMethod, OcrMode, OcrRouter};

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        attempts: 3,
        base: Duration::ZERO,
        max_wait: Duration::ZERO,
    }
}

fn router_with(llm: std::sync::Arc<ScriptedLlm>) -> ExtractionRouter {
    ExtractionRouter::new(
        BorrowerExtractor::new(llm.clone()),
        GroundedExtractor::new(llm),
    )
    .with_retry_policy(fast_retry())
}

fn content_with_text(text: &str) -> DocumentContent {
    DocumentContent::from_pages(
        vec![PageContent {
            page_number: 1,
            text: text.to_string(),
            tables: Vec::new(),
        }],
        serde_json::Value::Object(Default::default()),
    )
}

fn grounded_payload() -> serde_json::Value {
    json!({
        "extractions": [
            {
                "extraction_class": "borrower",
                "extraction_text": "John Smith",
                "attributes": { "ssn": "123-45-6789", "phone": "(555) 123-4567" },
            },
            {
                "extraction_class": "account",
                "extraction_text": "ACC-1001",
            },
        ],
    })
}

fn chunk_payload(name: &str, ssn: &str, accounts: &[&str]) -> serde_json::Value {
    json!({
        "borrowers": [{
            "name": name,
            "ssn": ssn,
            "account_numbers": accounts,
        }],
    })
}

#[tokio::test]
async fn transient_errors_retry_then_succeed_without_fallback() {
    // Scenario: the grounded path returns 503 twice, then a valid result on
    // the third call. No page-level fallback may run.
    let llm = arc(ScriptedLlm::new(vec![
        Err(LlmError::Status { status: 503, body: "Service Unavailable".into() }),
        Err(LlmError::Status { status: 503, body: "Service Unavailable".into() }),
        llm_ok(grounded_payload()),
    ]));
    let router = router_with(llm.clone());
    let content = content_with_text("Borrower: John Smith\nAccount ACC-1001");

    let output = router
        .extract(&content, Uuid::new_v4(), "loan.pdf", ExtractionMethod::Auto)
        .await
        .unwrap();

    assert_eq!(llm.call_count(), 3);
    assert_eq!(output.borrowers.len(), 1);
    assert_eq!(output.borrowers[0].name, "John Smith");
    assert_eq!(output.borrowers[0].account_numbers, vec!["ACC-1001"]);
}

#[tokio::test]
async fn fatal_errors_fall_back_to_the_page_level_path() {
    // Scenario: the grounded path dies on an auth error; auto mode falls
    // back to the page-level extractor exactly once.
    let llm = arc(ScriptedLlm::new(vec![
        Err(LlmError::Status { status: 401, body: "Invalid API key".into() }),
        llm_ok(chunk_payload("John Smith", "123-45-6789", &["ACC-1001"])),
    ]));
    let router = router_with(llm.clone());
    let content = content_with_text("Borrower: John Smith");

    let output = router
        .extract(&content, Uuid::new_v4(), "loan.pdf", ExtractionMethod::Auto)
        .await
        .unwrap();

    assert_eq!(llm.call_count(), 2);
    assert_eq!(output.borrowers.len(), 1);
    // The page-level path yields page-numbered references without offsets.
    for source in &output.borrowers[0].sources {
        assert!(source.page_number >= 1);
        assert!(source.char_start.is_none());
        assert!(source.char_end.is_none());
    }
}

#[tokio::test]
async fn langextract_mode_raises_after_the_retry_budget() {
    let llm = arc(ScriptedLlm::new(vec![
        Err(LlmError::Status { status: 503, body: "unavailable".into() }),
        Err(LlmError::Status { status: 503, body: "unavailable".into() }),
        Err(LlmError::Status { status: 503, body: "unavailable".into() }),
    ]));
    let router = router_with(llm.clone());
    let content = content_with_text("Borrower: John Smith");

    let result = router
        .extract(&content, Uuid::new_v4(), "loan.pdf", ExtractionMethod::Langextract)
        .await;

    assert_eq!(llm.call_count(), 3);
    assert!(matches!(result, Err(ExtractionError::Transient(_))));
}

#[tokio::test]
async fn langextract_mode_raises_fatal_errors_immediately() {
    let llm = arc(ScriptedLlm::new(vec![Err(LlmError::InvalidResponse(
        "schema mismatch".into(),
    ))]));
    let router = router_with(llm.clone());
    let content = content_with_text("Borrower: John Smith");

    let result = router
        .extract(&content, Uuid::new_v4(), "loan.pdf", ExtractionMethod::Langextract)
        .await;

    assert_eq!(llm.call_count(), 1);
    assert!(matches!(result, Err(ExtractionError::Fatal(_))));
}

#[tokio::test]
async fn grounded_references_carry_verified_offsets() {
    let llm = arc(ScriptedLlm::new(vec![llm_ok(grounded_payload())]));
    let router = router_with(llm);
    let text = "Borrower: John Smith\nAccount ACC-1001";
    let content = content_with_text(text);

    let output = router
        .extract(&content, Uuid::new_v4(), "loan.pdf", ExtractionMethod::Langextract)
        .await
        .unwrap();

    assert_eq!(output.borrowers.len(), 1);
    for source in &output.borrowers[0].sources {
        let (start, end) = (source.char_start.unwrap(), source.char_end.unwrap());
        let slice: String = text.chars().skip(start).take(end - start).collect();
        assert_eq!(slice, "John Smith");
    }
}

#[tokio::test]
async fn duplicate_borrowers_across_chunks_merge_by_ssn() {
    // Scenario: two chunks each emit the same borrower with overlapping
    // account numbers; reconciliation yields one borrower with the union.
    let llm = arc(ScriptedLlm::new(vec![
        llm_ok(chunk_payload("John Smith", "123-45-6789", &["ACC-A", "ACC-B"])),
        llm_ok(chunk_payload("J. Smith", "123-45-6789", &["ACC-B", "ACC-C"])),
    ]));
    let router = router_with(llm.clone());

    // Two pages big enough to force two chunks, with the page boundary
    // inside the first chunk so the chunks map to different pages.
    let content = DocumentContent::from_pages(
        vec![
            PageContent {
                page_number: 1,
                text: "Borrower: John Smith ".repeat(450),
                tables: Vec::new(),
            },
            PageContent {
                page_number: 2,
                text: "Same borrower continued ".repeat(400),
                tables: Vec::new(),
            },
        ],
        serde_json::Value::Object(Default::default()),
    );
    assert!(content.text.chars().count() > 16_000);

    let output = router
        .extract(&content, Uuid::new_v4(), "loan.pdf", ExtractionMethod::Docling)
        .await
        .unwrap();

    assert_eq!(llm.call_count(), 2);
    assert_eq!(output.chunks_processed, 2);
    assert_eq!(output.borrowers.len(), 1);

    let merged = &output.borrowers[0];
    let accounts: std::collections::HashSet<&str> =
        merged.account_numbers.iter().map(String::as_str).collect();
    assert_eq!(
        accounts,
        std::collections::HashSet::from(["ACC-A", "ACC-B", "ACC-C"])
    );
    assert_eq!(merged.sources.len(), 2);
}

#[tokio::test]
async fn skip_mode_never_runs_ocr() {
    let extractor = arc(FakeContentExtractor::new(
        vec![Some(0)],
        vec![page(1, "native text")],
    ));
    let gpu = arc(FakeOcrBackend::healthy("ocr text"));
    let router = OcrRouter::new(gpu.clone(), extractor.clone(), arc(CircuitBreaker::default()));

    let result = router
        .process(b"%PDF-1.7", "loan.pdf", OcrMode::Skip)
        .await
        .unwrap();

    assert_eq!(result.ocr_method, OcrMethod::None);
    assert!(result.pages_ocrd.is_empty());
    assert_eq!(gpu.extract_calls.load(Ordering::SeqCst), 0);
    assert_eq!(gpu.health_calls.load(Ordering::SeqCst), 0);
    assert_eq!(extractor.enable_ocr_calls().await, vec![false]);
}

#[tokio::test]
async fn native_documents_skip_ocr_in_auto_mode() {
    let extractor = arc(FakeContentExtractor::new(
        vec![Some(900), Some(1200)],
        vec![page(1, "page one"), page(2, "page two")],
    ));
    let gpu = arc(FakeOcrBackend::healthy("ocr text"));
    let router = OcrRouter::new(gpu.clone(), extractor, arc(CircuitBreaker::default()));

    let result = router
        .process(b"%PDF-1.7", "loan.pdf", OcrMode::Auto)
        .await
        .unwrap();

    assert_eq!(result.ocr_method, OcrMethod::None);
    assert!(result.pages_ocrd.is_empty());
    assert_eq!(gpu.extract_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn unhealthy_gpu_falls_back_to_native_ocr() {
    // Scenario: fully scanned document, GPU health probe negative. The
    // native extractor runs once with OCR enabled and no page is sent to
    // the GPU.
    let extractor = arc(FakeContentExtractor::new(
        vec![Some(0), Some(3)],
        vec![page(1, "ocr page one"), page(2, "ocr page two")],
    ));
    let gpu = arc(FakeOcrBackend::unhealthy());
    let router = OcrRouter::new(gpu.clone(), extractor.clone(), arc(CircuitBreaker::default()));

    let result = router
        .process(b"%PDF-1.7", "scan.pdf", OcrMode::Auto)
        .await
        .unwrap();

    assert_eq!(result.ocr_method, OcrMethod::Docling);
    assert_eq!(result.pages_ocrd, vec![0, 1]);
    assert_eq!(gpu.extract_calls.load(Ordering::SeqCst), 0);
    assert_eq!(extractor.enable_ocr_calls().await, vec![true]);
}

#[tokio::test]
async fn force_mode_sends_every_page_to_a_healthy_gpu() {
    let extractor = arc(FakeContentExtractor::new(
        vec![Some(900), Some(1200), Some(800)],
        vec![page(1, "native one"), page(2, "native two"), page(3, "native three")],
    ));
    let gpu = arc(FakeOcrBackend::healthy("gpu ocr text"));
    let router = OcrRouter::new(gpu.clone(), extractor, arc(CircuitBreaker::default()));

    let result = router
        .process(b"%PDF-1.7", "loan.pdf", OcrMode::Force)
        .await
        .unwrap();

    assert_eq!(result.ocr_method, OcrMethod::Gpu);
    assert_eq!(result.pages_ocrd, vec![0, 1, 2]);
    assert_eq!(gpu.extract_calls.load(Ordering::SeqCst), 3);
    assert_eq!(result.content.page_count, 3);
    for page in &result.content.pages {
        assert_eq!(page.text, "gpu ocr text");
    }
}

#[tokio::test]
async fn open_breaker_short_circuits_the_gpu() {
    let extractor = arc(FakeContentExtractor::new(
        vec![Some(0)],
        vec![page(1, "ocr fallback text")],
    ));
    let gpu = arc(FakeOcrBackend::healthy("gpu text"));
    let breaker = arc(CircuitBreaker::new(3, Duration::from_secs(60)));
    breaker.record_failure();
    breaker.record_failure();
    breaker.record_failure();

    let router = OcrRouter::new(gpu.clone(), extractor, breaker);
    let result = router
        .process(b"%PDF-1.7", "scan.pdf", OcrMode::Auto)
        .await
        .unwrap();

    assert_eq!(result.ocr_method, OcrMethod::Docling);
    assert_eq!(gpu.health_calls.load(Ordering::SeqCst), 0);
    assert_eq!(gpu.extract_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn gpu_page_failures_open_the_breaker_and_fall_back() {
    let extractor = arc(FakeContentExtractor::new(
        vec![Some(0), Some(0), Some(0)],
        vec![page(1, "a"), page(2, "b"), page(3, "c")],
    ));
    let gpu = arc(FakeOcrBackend {
        healthy: true,
        page_text: String::new(),
        extract_calls: std::sync::atomic::AtomicUsize::new(0),
        health_calls: std::sync::atomic::AtomicUsize::new(0),
        fail_extracts: true,
    });
    let breaker = arc(CircuitBreaker::new(3, Duration::from_secs(60)));
    let router = OcrRouter::new(gpu.clone(), extractor.clone(), breaker);

    let result = router
        .process(b"%PDF-1.7", "scan.pdf", OcrMode::Auto)
        .await
        .unwrap();

    // GPU attempts fail, the fallback still produces content and the
    // attempted pages remain auditable.
    assert_eq!(result.ocr_method, OcrMethod::Docling);
    assert_eq!(result.pages_ocrd, vec![0, 1, 2]);
    assert!(gpu.extract_calls.load(Ordering::SeqCst) >= 1);
    assert_eq!(extractor.enable_ocr_calls().await, vec![true]);
}

#[tokio::test]
async fn mixed_documents_merge_gpu_and_native_pages_in_order() {
    // Pages 0 and 2 scanned, page 1 native.
    let extractor = arc(FakeContentExtractor::new(
        vec![Some(0), Some(2000), Some(3)],
        vec![page(1, "native one"), page(2, "native two"), page(3, "native three")],
    ));
    let gpu = arc(FakeOcrBackend::healthy("gpu text"));
    let router = OcrRouter::new(gpu.clone(), extractor, arc(CircuitBreaker::default()));

    let result = router
        .process(b"%PDF-1.7", "mixed.pdf", OcrMode::Auto)
        .await
        .unwrap();

    assert_eq!(result.ocr_method, OcrMethod::Gpu);
    assert_eq!(result.pages_ocrd, vec![0, 2]);
    assert_eq!(result.content.pages.len(), 3);
    assert_eq!(result.content.pages[0].text, "gpu text");
    assert_eq!(result.content.pages[1].text, "native two");
    assert_eq!(result.content.pages[2].text, "gpu text");
    assert_eq!(result.content.pages[1].page_number, 2);
}
