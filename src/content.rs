use std::{
    fmt, fs,
    io::{Cursor, ErrorKind, Read, Write},
    process::Command,
};

use pdfium_render::prelude::*;
use quick_xml::events::Event;
use quick_xml::Reader;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tempfile::NamedTempFile;
use thiserror::Error;

/// Minimum extracted characters before a document is considered to have a
/// usable text layer.
pub const MIN_TEXT_LENGTH: usize = 50;

/// Unrecoverable failure while turning raw bytes into document content.
/// The task lifecycle treats this as permanent.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct DocumentProcessingError {
    pub message: String,
}

impl DocumentProcessingError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableContent {
    pub page_number: i32,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageContent {
    pub page_number: i32,
    pub text: String,
    pub tables: Vec<TableContent>,
}

/// Linearized document produced by extraction or OCR. Lives inside one task
/// invocation and is never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentContent {
    pub text: String,
    pub pages: Vec<PageContent>,
    pub page_count: i32,
    pub tables: Vec<TableContent>,
    pub metadata: Value,
}

impl DocumentContent {
    pub fn from_pages(pages: Vec<PageContent>, metadata: Value) -> Self {
        let text = pages
            .iter()
            .map(|p| p.text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");
        let tables = pages.iter().flat_map(|p| p.tables.clone()).collect();
        let page_count = pages.len() as i32;
        Self {
            text,
            pages,
            page_count,
            tables,
            metadata,
        }
    }

    pub fn empty() -> Self {
        Self {
            text: String::new(),
            pages: Vec::new(),
            page_count: 0,
            tables: Vec::new(),
            metadata: Value::Object(Default::default()),
        }
    }
}

/// Engine that turns raw file bytes into [`DocumentContent`] and exposes the
/// per-page primitives the OCR router needs. The production implementation
/// is [`NativeExtractor`]; tests substitute scripted fakes.
pub trait ContentExtractor: Send + Sync + 'static {
    fn process_bytes(
        &self,
        bytes: &[u8],
        filename: &str,
        enable_ocr: bool,
    ) -> Result<DocumentContent, DocumentProcessingError>;

    /// Extracted character count of each PDF page's text layer; `None` for a
    /// page whose text extraction raised.
    fn page_text_lengths(&self, bytes: &[u8]) -> Result<Vec<Option<usize>>, DocumentProcessingError>;

    /// Render one PDF page to PNG bytes at the given DPI.
    fn render_page_png(
        &self,
        bytes: &[u8],
        page_index: usize,
        dpi: f32,
    ) -> Result<Vec<u8>, DocumentProcessingError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileKind {
    Pdf,
    Docx,
    Image,
}

impl fmt::Display for FileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileKind::Pdf => write!(f, "pdf"),
            FileKind::Docx => write!(f, "docx"),
            FileKind::Image => write!(f, "image"),
        }
    }
}

fn detect_kind(bytes: &[u8], filename: &str) -> FileKind {
    if bytes.starts_with(b"%PDF") {
        return FileKind::Pdf;
    }
    if bytes.starts_with(b"\x89PNG") || bytes.starts_with(b"\xff\xd8") {
        return FileKind::Image;
    }
    if bytes.starts_with(b"PK") {
        return FileKind::Docx;
    }
    match filename.rsplit('.').next().map(|ext| ext.to_ascii_lowercase()) {
        Some(ext) if ext == "docx" => FileKind::Docx,
        Some(ext) if ext == "png" || ext == "jpg" || ext == "jpeg" => FileKind::Image,
        _ => FileKind::Pdf,
    }
}

/// Native text extraction over pdfium for PDFs, the DOCX XML body for Word
/// documents, and a sidecar `ocrmypdf` pass when OCR is requested and the
/// text layer is too thin.
pub struct NativeExtractor;

impl NativeExtractor {
    pub fn new() -> Self {
        Self
    }
}

impl Default for NativeExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl ContentExtractor for NativeExtractor {
    fn process_bytes(
        &self,
        bytes: &[u8],
        filename: &str,
        enable_ocr: bool,
    ) -> Result<DocumentContent, DocumentProcessingError> {
        if bytes.is_empty() {
            return Err(DocumentProcessingError::new("empty document"));
        }

        match detect_kind(bytes, filename) {
            FileKind::Docx => extract_docx(bytes),
            FileKind::Pdf => {
                let content = extract_pdf(bytes)?;
                let total_chars: usize = content.pages.iter().map(|p| p.text.chars().count()).sum();
                if enable_ocr && total_chars < MIN_TEXT_LENGTH {
                    if let Some(ocr_content) = run_sidecar_ocr(bytes)? {
                        return Ok(ocr_content);
                    }
                }
                Ok(content)
            }
            FileKind::Image => {
                if enable_ocr {
                    if let Some(ocr_content) = run_sidecar_ocr(bytes)? {
                        return Ok(ocr_content);
                    }
                }
                // An image has no text layer; a single empty page keeps the
                // page numbering contract intact.
                Ok(DocumentContent::from_pages(
                    vec![PageContent {
                        page_number: 1,
                        text: String::new(),
                        tables: Vec::new(),
                    }],
                    serde_json::json!({ "source": "image" }),
                ))
            }
        }
    }

    fn page_text_lengths(&self, bytes: &[u8]) -> Result<Vec<Option<usize>>, DocumentProcessingError> {
        let pdfium = Pdfium::default();
        let document = pdfium
            .load_pdf_from_byte_slice(bytes, None)
            .map_err(|err| DocumentProcessingError::new(format!("load pdf: {err}")))?;

        let pages = document.pages();
        let mut lengths = Vec::with_capacity(pages.len() as usize);
        for page_index in 0..pages.len() {
            let length = pages
                .get(page_index)
                .ok()
                .and_then(|page| page.text().ok().map(|text| text.all().chars().count()));
            lengths.push(length);
        }
        Ok(lengths)
    }

    fn render_page_png(
        &self,
        bytes: &[u8],
        page_index: usize,
        dpi: f32,
    ) -> Result<Vec<u8>, DocumentProcessingError> {
        let pdfium = Pdfium::default();
        let document = pdfium
            .load_pdf_from_byte_slice(bytes, None)
            .map_err(|err| DocumentProcessingError::new(format!("load pdf: {err}")))?;

        let page = document
            .pages()
            .get(page_index as u16)
            .map_err(|err| DocumentProcessingError::new(format!("load page {page_index}: {err}")))?;

        // PDF user space is 72 DPI.
        let scale = dpi / 72.0;
        let bitmap = page
            .render_with_config(&PdfRenderConfig::new().scale_page_by_factor(scale))
            .map_err(|err| DocumentProcessingError::new(format!("render page {page_index}: {err}")))?;

        let mut buffer = Cursor::new(Vec::new());
        bitmap
            .as_image()
            .write_to(&mut buffer, image::ImageFormat::Png)
            .map_err(|err| DocumentProcessingError::new(format!("encode page {page_index}: {err}")))?;
        Ok(buffer.into_inner())
    }
}

fn extract_pdf(bytes: &[u8]) -> Result<DocumentContent, DocumentProcessingError> {
    let pdfium = Pdfium::default();
    let document = pdfium
        .load_pdf_from_byte_slice(bytes, None)
        .map_err(|err| DocumentProcessingError::new(format!("load pdf: {err}")))?;

    let pdf_pages = document.pages();
    let mut pages = Vec::with_capacity(pdf_pages.len() as usize);
    for page_index in 0..pdf_pages.len() {
        let page = pdf_pages
            .get(page_index)
            .map_err(|err| DocumentProcessingError::new(format!("load page {page_index}: {err}")))?;
        let text = page.text().map(|text| text.all()).unwrap_or_default();
        pages.push(PageContent {
            page_number: page_index as i32 + 1,
            text,
            tables: Vec::new(),
        });
    }

    Ok(DocumentContent::from_pages(
        pages,
        serde_json::json!({ "source": "pdf-text" }),
    ))
}

fn extract_docx(bytes: &[u8]) -> Result<DocumentContent, DocumentProcessingError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))
        .map_err(|err| DocumentProcessingError::new(format!("open docx: {err}")))?;
    let mut xml = String::new();
    archive
        .by_name("word/document.xml")
        .map_err(|err| DocumentProcessingError::new(format!("docx body missing: {err}")))?
        .read_to_string(&mut xml)
        .map_err(|err| DocumentProcessingError::new(format!("read docx body: {err}")))?;

    let mut reader = Reader::from_str(&xml);
    let mut text = String::new();
    let mut tables = Vec::new();
    let mut in_text_run = false;
    let mut table_depth = 0usize;
    let mut table_text = String::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(start)) => match start.local_name().as_ref() {
                b"t" => in_text_run = true,
                b"tbl" => table_depth += 1,
                _ => {}
            },
            Ok(Event::End(end)) => match end.local_name().as_ref() {
                b"t" => in_text_run = false,
                b"p" => {
                    if table_depth > 0 {
                        table_text.push('\n');
                    } else {
                        text.push('\n');
                    }
                }
                b"tbl" => {
                    table_depth = table_depth.saturating_sub(1);
                    if table_depth == 0 && !table_text.trim().is_empty() {
                        tables.push(TableContent {
                            page_number: 1,
                            text: std::mem::take(&mut table_text),
                        });
                    }
                }
                _ => {}
            },
            Ok(Event::Text(content)) if in_text_run => {
                let unescaped = content
                    .unescape()
                    .map_err(|err| DocumentProcessingError::new(format!("decode docx text: {err}")))?;
                if table_depth > 0 {
                    table_text.push_str(&unescaped);
                } else {
                    text.push_str(&unescaped);
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(err) => {
                return Err(DocumentProcessingError::new(format!("parse docx body: {err}")));
            }
        }
    }

    // DOCX carries no pagination; the body is a single logical page.
    Ok(DocumentContent {
        text: text.trim_end().to_string(),
        pages: vec![PageContent {
            page_number: 1,
            text: text.trim_end().to_string(),
            tables: tables.clone(),
        }],
        page_count: 1,
        tables,
        metadata: serde_json::json!({ "source": "docx" }),
    })
}

/// Run `ocrmypdf --sidecar` over the document and split the sidecar text on
/// form feeds into pages. Returns `None` when the binary is missing or the
/// OCR output is too thin to be useful.
fn run_sidecar_ocr(bytes: &[u8]) -> Result<Option<DocumentContent>, DocumentProcessingError> {
    let mut input = NamedTempFile::new()
        .map_err(|err| DocumentProcessingError::new(format!("ocr tempfile: {err}")))?;
    input
        .write_all(bytes)
        .and_then(|_| input.flush())
        .map_err(|err| DocumentProcessingError::new(format!("ocr tempfile: {err}")))?;

    let output_pdf = NamedTempFile::new()
        .map_err(|err| DocumentProcessingError::new(format!("ocr tempfile: {err}")))?;
    let sidecar = NamedTempFile::new()
        .map_err(|err| DocumentProcessingError::new(format!("ocr tempfile: {err}")))?;

    let status = Command::new("ocrmypdf")
        .arg("--sidecar")
        .arg(sidecar.path())
        .arg("--skip-text")
        .arg(input.path())
        .arg(output_pdf.path())
        .output();

    match status {
        Ok(output) => {
            if !output.status.success() {
                return Err(DocumentProcessingError::new(format!(
                    "ocrmypdf failed: exit={} stderr={}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr)
                )));
            }

            let text = fs::read_to_string(sidecar.path())
                .map_err(|err| DocumentProcessingError::new(format!("read ocr sidecar: {err}")))?;
            if text.trim().chars().count() < MIN_TEXT_LENGTH {
                return Ok(None);
            }

            let pages: Vec<PageContent> = text
                .split('\u{c}')
                .enumerate()
                .map(|(index, page_text)| PageContent {
                    page_number: index as i32 + 1,
                    text: page_text.trim_end().to_string(),
                    tables: Vec::new(),
                })
                .collect();
            Ok(Some(DocumentContent::from_pages(
                pages,
                serde_json::json!({ "source": "ocr" }),
            )))
        }
        Err(err) => {
            if err.kind() == ErrorKind::NotFound {
                tracing::warn!("ocrmypdf not installed; cannot perform local OCR");
                Ok(None)
            } else {
                Err(DocumentProcessingError::new(format!("ocr command failed: {err}")))
            }
        }
    }
}
