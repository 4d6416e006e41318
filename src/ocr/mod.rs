use std::{fmt, str::FromStr, sync::Arc};

use async_trait::async_trait;
use futures_util::{stream, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::task;
use tracing::{info, warn};

use crate::content::{ContentExtractor, DocumentContent, DocumentProcessingError, PageContent};

pub mod breaker;
pub mod client;
pub mod detector;

pub use breaker::{BreakerState, CircuitBreaker};
pub use client::{GpuOcrClient, OcrBackend, OcrError};
pub use detector::{DetectionResult, ScannedPageDetector};

pub const DEFAULT_RENDER_DPI: f32 = 150.0;
pub const DEFAULT_MAX_WORKERS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OcrMode {
    Auto,
    Force,
    Skip,
}

impl Default for OcrMode {
    fn default() -> Self {
        OcrMode::Auto
    }
}

impl fmt::Display for OcrMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OcrMode::Auto => write!(f, "auto"),
            OcrMode::Force => write!(f, "force"),
            OcrMode::Skip => write!(f, "skip"),
        }
    }
}

impl FromStr for OcrMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "auto" => Ok(OcrMode::Auto),
            "force" => Ok(OcrMode::Force),
            "skip" => Ok(OcrMode::Skip),
            other => Err(format!("unknown ocr mode: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OcrMethod {
    Gpu,
    Docling,
    None,
}

impl fmt::Display for OcrMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OcrMethod::Gpu => write!(f, "gpu"),
            OcrMethod::Docling => write!(f, "docling"),
            OcrMethod::None => write!(f, "none"),
        }
    }
}

#[derive(Debug)]
pub struct OcrResult {
    pub content: DocumentContent,
    pub ocr_method: OcrMethod,
    /// Page indices handed to the GPU branch, recorded even when the
    /// fallback ends up producing the text.
    pub pages_ocrd: Vec<usize>,
}

/// OCR boundary the task pipeline depends on.
#[async_trait]
pub trait OcrEngine: Send + Sync + 'static {
    async fn process(
        &self,
        bytes: &[u8],
        filename: &str,
        mode: OcrMode,
    ) -> Result<OcrResult, DocumentProcessingError>;
}

/// Routes between the remote GPU OCR service and the native extractor with
/// OCR enabled. GPU failures never surface to the caller; only an
/// unrecoverable native extraction failure propagates.
pub struct OcrRouter {
    gpu: Arc<dyn OcrBackend>,
    extractor: Arc<dyn ContentExtractor>,
    detector: ScannedPageDetector,
    breaker: Arc<CircuitBreaker>,
    render_dpi: f32,
    max_workers: usize,
}

impl OcrRouter {
    pub fn new(
        gpu: Arc<dyn OcrBackend>,
        extractor: Arc<dyn ContentExtractor>,
        breaker: Arc<CircuitBreaker>,
    ) -> Self {
        let detector = ScannedPageDetector::new(extractor.clone());
        Self {
            gpu,
            extractor,
            detector,
            breaker,
            render_dpi: DEFAULT_RENDER_DPI,
            max_workers: DEFAULT_MAX_WORKERS,
        }
    }

    pub fn with_render_dpi(mut self, dpi: f32) -> Self {
        self.render_dpi = dpi;
        self
    }

    pub fn with_detector(mut self, detector: ScannedPageDetector) -> Self {
        self.detector = detector;
        self
    }

    pub fn breaker_state(&self) -> BreakerState {
        self.breaker.state()
    }

    async fn native(
        &self,
        bytes: &Arc<Vec<u8>>,
        filename: &str,
        enable_ocr: bool,
    ) -> Result<DocumentContent, DocumentProcessingError> {
        let extractor = self.extractor.clone();
        let bytes = bytes.clone();
        let filename = filename.to_string();
        task::spawn_blocking(move || extractor.process_bytes(&bytes, &filename, enable_ocr))
            .await
            .map_err(|err| DocumentProcessingError::new(format!("extraction task panicked: {err}")))?
    }

    async fn try_gpu_ocr(&self, image_bytes: Vec<u8>) -> Result<String, OcrError> {
        if !self.breaker.try_acquire() {
            return Err(OcrError::BreakerOpen);
        }
        match self.gpu.extract_text(&image_bytes).await {
            Ok(text) => {
                self.breaker.record_success();
                Ok(text)
            }
            Err(err) => {
                self.breaker.record_failure();
                Err(err)
            }
        }
    }

    async fn ocr_pages_with_gpu(
        &self,
        bytes: &Arc<Vec<u8>>,
        scanned_pages: &[usize],
    ) -> Result<Vec<(usize, String)>, OcrError> {
        let mut results: Vec<(usize, String)> = stream::iter(scanned_pages.iter().copied())
            .map(|page_index| {
                let bytes = bytes.clone();
                let extractor = self.extractor.clone();
                let dpi = self.render_dpi;
                async move {
                    let render_bytes = bytes.clone();
                    let png = task::spawn_blocking(move || {
                        extractor.render_page_png(&render_bytes, page_index, dpi)
                    })
                    .await
                    .map_err(|err| OcrError::Request(format!("render task panicked: {err}")))?
                    .map_err(|err| OcrError::Request(err.to_string()))?;
                    let text = self.try_gpu_ocr(png).await?;
                    Ok::<(usize, String), OcrError>((page_index, text))
                }
            })
            .buffer_unordered(self.max_workers)
            .try_collect()
            .await?;

        // Results complete out of order; page index restores determinism.
        results.sort_by_key(|(index, _)| *index);
        Ok(results)
    }

    async fn merge_gpu_results(
        &self,
        bytes: &Arc<Vec<u8>>,
        filename: &str,
        ocr_texts: Vec<(usize, String)>,
        detection: &DetectionResult,
    ) -> Result<DocumentContent, DocumentProcessingError> {
        let scanned: std::collections::HashSet<usize> =
            detection.scanned_pages.iter().copied().collect();

        let native_content = if scanned.len() < detection.total_pages {
            Some(self.native(bytes, filename, false).await?)
        } else {
            None
        };

        let ocr_map: std::collections::HashMap<usize, String> = ocr_texts.into_iter().collect();

        let mut pages = Vec::with_capacity(detection.total_pages);
        let mut text_parts = Vec::with_capacity(detection.total_pages);
        for page_index in 0..detection.total_pages {
            let page_number = page_index as i32 + 1;
            if scanned.contains(&page_index) {
                let page_text = ocr_map.get(&page_index).cloned().unwrap_or_default();
                text_parts.push(format!("## Page {page_number}\n\n{page_text}"));
                pages.push(PageContent {
                    page_number,
                    text: page_text,
                    tables: Vec::new(),
                });
            } else if let Some(native_page) = native_content
                .as_ref()
                .and_then(|content| content.pages.get(page_index))
            {
                text_parts.push(format!("## Page {page_number}\n\n{}", native_page.text));
                pages.push(PageContent {
                    page_number,
                    text: native_page.text.clone(),
                    tables: native_page.tables.clone(),
                });
            } else {
                pages.push(PageContent {
                    page_number,
                    text: String::new(),
                    tables: Vec::new(),
                });
            }
        }

        let tables = native_content
            .map(|content| content.tables)
            .unwrap_or_default();
        let native_pages: Vec<usize> =
            (0..detection.total_pages).filter(|i| !scanned.contains(i)).collect();

        Ok(DocumentContent {
            text: text_parts.join("\n\n"),
            pages,
            page_count: detection.total_pages as i32,
            tables,
            metadata: json!({
                "ocr_method": "gpu",
                "scanned_pages": detection.scanned_pages,
                "native_pages": native_pages,
            }),
        })
    }
}

#[async_trait]
impl OcrEngine for OcrRouter {
    async fn process(
        &self,
        bytes: &[u8],
        filename: &str,
        mode: OcrMode,
    ) -> Result<OcrResult, DocumentProcessingError> {
        let bytes = Arc::new(bytes.to_vec());

        if mode == OcrMode::Skip {
            info!(%filename, "ocr skip mode, using native extraction");
            let content = self.native(&bytes, filename, false).await?;
            return Ok(OcrResult {
                content,
                ocr_method: OcrMethod::None,
                pages_ocrd: Vec::new(),
            });
        }

        let detection = if mode == OcrMode::Force {
            let extractor = self.extractor.clone();
            let detect_bytes = bytes.clone();
            let lengths = task::spawn_blocking(move || extractor.page_text_lengths(&detect_bytes))
                .await
                .map_err(|err| {
                    DocumentProcessingError::new(format!("detection task panicked: {err}"))
                })?;
            match lengths {
                Ok(lengths) => DetectionResult::all_scanned(lengths.len()),
                Err(err) => {
                    warn!(%filename, error = %err, "pdf unparseable in force mode");
                    DetectionResult::all_scanned(0)
                }
            }
        } else {
            let detector = self.detector.clone();
            let detector_bytes = bytes.clone();
            task::spawn_blocking(move || detector.detect(&detector_bytes))
                .await
                .map_err(|err| {
                    DocumentProcessingError::new(format!("detection task panicked: {err}"))
                })?
        };

        if !detection.needs_ocr {
            info!(
                %filename,
                scanned_pct = detection.scanned_ratio * 100.0,
                "native pdf detected, skipping ocr"
            );
            let content = self.native(&bytes, filename, false).await?;
            return Ok(OcrResult {
                content,
                ocr_method: OcrMethod::None,
                pages_ocrd: Vec::new(),
            });
        }

        info!(
            %filename,
            scanned_pct = detection.scanned_ratio * 100.0,
            scanned_pages = detection.scanned_pages.len(),
            "scanned pdf detected, attempting gpu ocr"
        );

        let gpu_attempt = async {
            if !self.breaker.try_acquire() {
                return Err(OcrError::BreakerOpen);
            }
            if self.gpu.health_check().await {
                self.breaker.record_success();
            } else {
                self.breaker.record_failure();
                return Err(OcrError::Unhealthy);
            }

            let ocr_texts = self.ocr_pages_with_gpu(&bytes, &detection.scanned_pages).await?;
            Ok(ocr_texts)
        };

        match gpu_attempt.await {
            Ok(ocr_texts) => {
                let content = self
                    .merge_gpu_results(&bytes, filename, ocr_texts, &detection)
                    .await?;
                Ok(OcrResult {
                    content,
                    ocr_method: OcrMethod::Gpu,
                    pages_ocrd: detection.scanned_pages,
                })
            }
            Err(err) => {
                warn!(%filename, error = %err, "gpu ocr unavailable, falling back to native ocr");
                let content = self.native(&bytes, filename, true).await?;
                Ok(OcrResult {
                    content,
                    ocr_method: OcrMethod::Docling,
                    pages_ocrd: detection.scanned_pages,
                })
            }
        }
    }
}
