use std::sync::Arc;

use serde::Serialize;

use crate::content::{ContentExtractor, DocumentProcessingError};

pub const DEFAULT_MIN_CHARS: usize = 50;
pub const DEFAULT_SCANNED_RATIO: f64 = 0.5;

/// Per-page classification of a PDF into native and scanned pages, based on
/// text-layer density.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionResult {
    pub needs_ocr: bool,
    /// 0-based indices of pages classified as scanned, in page order.
    pub scanned_pages: Vec<usize>,
    pub total_pages: usize,
    pub scanned_ratio: f64,
}

impl DetectionResult {
    pub fn all_scanned(total_pages: usize) -> Self {
        Self {
            needs_ocr: true,
            scanned_pages: (0..total_pages).collect(),
            total_pages,
            scanned_ratio: 1.0,
        }
    }

    fn unparseable() -> Self {
        Self {
            needs_ocr: true,
            scanned_pages: Vec::new(),
            total_pages: 0,
            scanned_ratio: 1.0,
        }
    }
}

#[derive(Clone)]
pub struct ScannedPageDetector {
    extractor: Arc<dyn ContentExtractor>,
    min_chars_threshold: usize,
    scanned_ratio_threshold: f64,
}

impl ScannedPageDetector {
    pub fn new(extractor: Arc<dyn ContentExtractor>) -> Self {
        Self::with_thresholds(extractor, DEFAULT_MIN_CHARS, DEFAULT_SCANNED_RATIO)
    }

    pub fn with_thresholds(
        extractor: Arc<dyn ContentExtractor>,
        min_chars_threshold: usize,
        scanned_ratio_threshold: f64,
    ) -> Self {
        Self {
            extractor,
            min_chars_threshold,
            scanned_ratio_threshold,
        }
    }

    /// Classify every page of the PDF. An unparseable document is treated
    /// conservatively as fully scanned; the router's fallback can still
    /// refuse it.
    pub fn detect(&self, pdf_bytes: &[u8]) -> DetectionResult {
        match self.extractor.page_text_lengths(pdf_bytes) {
            Ok(lengths) => self.evaluate(&lengths),
            Err(DocumentProcessingError { message }) => {
                tracing::warn!(error = %message, "pdf unparseable during scan detection");
                DetectionResult::unparseable()
            }
        }
    }

    /// Pure classification from per-page text lengths. `None` marks a page
    /// whose text extraction raised; it counts as scanned.
    pub fn evaluate(&self, page_chars: &[Option<usize>]) -> DetectionResult {
        let total_pages = page_chars.len();
        if total_pages == 0 {
            return DetectionResult {
                needs_ocr: false,
                scanned_pages: Vec::new(),
                total_pages: 0,
                scanned_ratio: 0.0,
            };
        }

        let scanned_pages: Vec<usize> = page_chars
            .iter()
            .enumerate()
            .filter(|(_, chars)| match chars {
                Some(count) => *count < self.min_chars_threshold,
                None => true,
            })
            .map(|(index, _)| index)
            .collect();

        let scanned_ratio = scanned_pages.len() as f64 / total_pages as f64;
        DetectionResult {
            needs_ocr: scanned_ratio >= self.scanned_ratio_threshold,
            scanned_pages,
            total_pages,
            scanned_ratio,
        }
    }
}
