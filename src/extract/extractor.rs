use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

use crate::content::DocumentContent;
use crate::extract::chunker::DocumentChunker;
use crate::extract::complexity::{ComplexityAssessment, ComplexityClassifier, ComplexityLevel};
use crate::extract::confidence::ConfidenceCalculator;
use crate::extract::consistency::ConsistencyValidator;
use crate::extract::dedup::BorrowerDeduplicator;
use crate::extract::llm::{LlmBackend, LlmError, LlmRequest, ModelTier};
use crate::extract::validation::FieldValidator;
use crate::records::{
    normalize_ssn, parse_money, Address, BorrowerRecord, ConsistencyWarning, IncomeRecord,
    SourceReference, ValidationError, ValidationKind,
};

const SNIPPET_CHARS: usize = 200;

pub const EXTRACTION_SYSTEM_PROMPT: &str = "You are a mortgage document analyst. Extract every \
borrower mentioned in the provided text: legal name, SSN, phone, email, mailing address, income \
records (amount, period, year, source type, employer), account numbers, and loan numbers. Report \
values exactly as written in the document. Omit anything unclear or ambiguous rather than \
guessing. Return JSON matching the response schema.";

pub fn build_extraction_prompt(chunk_text: &str) -> String {
    format!("Extract all borrower information from this loan document text:\n\n{chunk_text}")
}

/// Gemini-style response schema for the per-chunk extraction call.
pub fn borrower_response_schema() -> Value {
    let income = json!({
        "type": "OBJECT",
        "properties": {
            "amount": { "type": "STRING" },
            "period": { "type": "STRING" },
            "year": { "type": "INTEGER" },
            "source_type": { "type": "STRING" },
            "employer": { "type": "STRING", "nullable": true },
        },
        "required": ["amount", "year"],
    });
    json!({
        "type": "OBJECT",
        "properties": {
            "borrowers": {
                "type": "ARRAY",
                "items": {
                    "type": "OBJECT",
                    "properties": {
                        "name": { "type": "STRING" },
                        "ssn": { "type": "STRING", "nullable": true },
                        "phone": { "type": "STRING", "nullable": true },
                        "email": { "type": "STRING", "nullable": true },
                        "address": {
                            "type": "OBJECT",
                            "nullable": true,
                            "properties": {
                                "street": { "type": "STRING", "nullable": true },
                                "city": { "type": "STRING", "nullable": true },
                                "state": { "type": "STRING", "nullable": true },
                                "zip_code": { "type": "STRING", "nullable": true },
                            },
                        },
                        "income_history": { "type": "ARRAY", "items": income },
                        "account_numbers": { "type": "ARRAY", "items": { "type": "STRING" } },
                        "loan_numbers": { "type": "ARRAY", "items": { "type": "STRING" } },
                    },
                    "required": ["name"],
                },
            },
        },
        "required": ["borrowers"],
    })
}

#[derive(Debug, Deserialize)]
pub struct RawExtraction {
    #[serde(default)]
    pub borrowers: Vec<RawBorrower>,
}

#[derive(Debug, Deserialize)]
pub struct RawBorrower {
    #[serde(default)]
    pub name: String,
    pub ssn: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub address: Option<RawAddress>,
    #[serde(default)]
    pub income_history: Vec<RawIncome>,
    #[serde(default)]
    pub account_numbers: Vec<String>,
    #[serde(default)]
    pub loan_numbers: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct RawAddress {
    pub street: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub zip_code: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RawIncome {
    pub amount: Option<Value>,
    pub period: Option<String>,
    pub year: Option<i32>,
    pub source_type: Option<String>,
    pub employer: Option<String>,
}

/// Everything one extraction pass produces: the reconciled borrowers plus
/// the bookkeeping a reviewer needs.
#[derive(Debug, Default)]
pub struct ExtractionOutput {
    pub borrowers: Vec<BorrowerRecord>,
    pub complexity: Option<ComplexityAssessment>,
    pub chunks_processed: usize,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub validation_errors: Vec<ValidationError>,
    pub consistency_warnings: Vec<ConsistencyWarning>,
    pub alignment_warnings: Vec<String>,
}

/// The reconciliation engine: deduplicate, validate, score, and flag. Both
/// extraction paths funnel their per-chunk records through here, and this is
/// the only place confidence scores are assigned.
pub struct Reconciler {
    deduplicator: BorrowerDeduplicator,
    validator: FieldValidator,
    confidence: ConfidenceCalculator,
    consistency: ConsistencyValidator,
}

impl Reconciler {
    pub fn new() -> Self {
        Self {
            deduplicator: BorrowerDeduplicator::new(),
            validator: FieldValidator::new(),
            confidence: ConfidenceCalculator::new(),
            consistency: ConsistencyValidator::new(),
        }
    }

    pub fn reconcile(
        &self,
        records: Vec<BorrowerRecord>,
    ) -> (Vec<BorrowerRecord>, Vec<ValidationError>, Vec<ConsistencyWarning>) {
        let mut merged = self.deduplicator.deduplicate(records);
        let mut validation_errors = Vec::new();

        for borrower in &mut merged {
            let mut passed = true;

            let result = self.validator.validate_ssn(borrower.ssn.as_deref());
            passed &= result.is_valid();
            validation_errors.extend(result.errors);

            let result = self.validator.validate_phone(borrower.phone.as_deref());
            passed &= result.is_valid();
            validation_errors.extend(result.errors);

            if let Some(address) = &borrower.address {
                let result = self.validator.validate_zip(address.zip_code.as_deref());
                passed &= result.is_valid();
                validation_errors.extend(result.errors);
            }

            for income in &borrower.income_history {
                let result = self.validator.validate_year(income.year);
                passed &= result.is_valid();
                validation_errors.extend(result.errors);
            }

            let breakdown =
                self.confidence
                    .calculate(borrower, passed, borrower.sources.len());
            borrower.confidence_score = breakdown.total;
        }

        let consistency_warnings = self.consistency.validate(&merged);
        (merged, validation_errors, consistency_warnings)
    }
}

impl Default for Reconciler {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-chunk extraction over the page-level pipeline: classify complexity,
/// chunk the text, call the LLM per chunk, convert raw records, then hand
/// everything to the reconciliation engine.
pub struct BorrowerExtractor {
    llm: Arc<dyn LlmBackend>,
    classifier: ComplexityClassifier,
    chunker: DocumentChunker,
    reconciler: Reconciler,
}

impl BorrowerExtractor {
    pub fn new(llm: Arc<dyn LlmBackend>) -> Self {
        Self {
            llm,
            classifier: ComplexityClassifier::new(),
            chunker: DocumentChunker::default(),
            reconciler: Reconciler::new(),
        }
    }

    pub fn with_chunker(mut self, chunker: DocumentChunker) -> Self {
        self.chunker = chunker;
        self
    }

    pub async fn extract(
        &self,
        document: &DocumentContent,
        document_id: Uuid,
        document_name: &str,
    ) -> Result<ExtractionOutput, LlmError> {
        let assessment = self.classifier.classify(&document.text, document.page_count);
        let tier = match assessment.level {
            ComplexityLevel::Standard => ModelTier::Flash,
            ComplexityLevel::Complex => ModelTier::Pro,
        };
        info!(
            %document_id,
            level = ?assessment.level,
            estimated_borrowers = assessment.estimated_borrowers,
            "document complexity assessed"
        );

        let chunks = self.chunker.chunk(&document.text);
        let mut all_records = Vec::new();
        let mut validation_errors = Vec::new();
        let mut input_tokens = 0u64;
        let mut output_tokens = 0u64;

        for chunk in &chunks {
            let page_number = find_page_for_position(document, chunk.start_char);
            let response = self
                .llm
                .generate(LlmRequest {
                    system_instruction: EXTRACTION_SYSTEM_PROMPT.to_string(),
                    prompt: build_extraction_prompt(&chunk.text),
                    response_schema: borrower_response_schema(),
                    tier,
                })
                .await?;

            input_tokens += response.input_tokens;
            output_tokens += response.output_tokens;
            info!(
                %document_id,
                chunk_index = chunk.chunk_index,
                total_chunks = chunk.total_chunks,
                input_tokens = response.input_tokens,
                output_tokens = response.output_tokens,
                "chunk extracted"
            );

            let parsed: RawExtraction = serde_json::from_value(response.payload)
                .map_err(|err| LlmError::InvalidResponse(format!("schema mismatch: {err}")))?;

            let snippet: String = chunk.text.chars().take(SNIPPET_CHARS).collect();
            for raw in parsed.borrowers {
                match convert_raw_borrower(raw, document_id, document_name, page_number, &snippet) {
                    Ok((record, errors)) => {
                        validation_errors.extend(errors);
                        all_records.push(record);
                    }
                    Err(errors) => {
                        warn!(%document_id, "skipping invalid extracted borrower");
                        validation_errors.extend(errors);
                    }
                }
            }
        }

        let (borrowers, reconcile_errors, consistency_warnings) =
            self.reconciler.reconcile(all_records);
        validation_errors.extend(reconcile_errors);

        Ok(ExtractionOutput {
            borrowers,
            complexity: Some(assessment),
            chunks_processed: chunks.len(),
            input_tokens,
            output_tokens,
            validation_errors,
            consistency_warnings,
            alignment_warnings: Vec::new(),
        })
    }
}

/// Map a character offset in the linearized text to a 1-indexed page. Uses
/// cumulative page text lengths when pages are available, otherwise a
/// uniform-density estimate. Page numbers are advisory metadata.
pub fn find_page_for_position(document: &DocumentContent, char_pos: usize) -> i32 {
    if !document.pages.is_empty() {
        let mut cumulative = 0usize;
        for page in &document.pages {
            let page_len = page.text.chars().count();
            if cumulative + page_len > char_pos {
                return page.page_number;
            }
            cumulative += page_len;
        }
        return document.pages.last().map(|p| p.page_number).unwrap_or(1);
    }

    let total_chars = document.text.chars().count();
    if document.page_count > 0 && total_chars > 0 {
        let chars_per_page = total_chars as f64 / document.page_count as f64;
        let estimated = (char_pos as f64 / chars_per_page) as i32 + 1;
        return estimated.clamp(1, document.page_count);
    }

    1
}

type ConversionResult = Result<(BorrowerRecord, Vec<ValidationError>), Vec<ValidationError>>;

/// Convert one raw LLM borrower into a domain record. A record violating a
/// hard invariant (empty name) is skipped; soft failures normalize away and
/// are reported without dropping the record.
pub fn convert_raw_borrower(
    raw: RawBorrower,
    document_id: Uuid,
    document_name: &str,
    page_number: i32,
    snippet: &str,
) -> ConversionResult {
    let name = raw.name.trim().to_string();
    if name.is_empty() {
        return Err(vec![ValidationError {
            field: "name".into(),
            value: String::new(),
            kind: ValidationKind::Format,
            message: "borrower name must not be empty".into(),
        }]);
    }

    let mut soft_errors = Vec::new();

    let ssn = match raw.ssn.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        None => None,
        Some(raw_ssn) => match normalize_ssn(raw_ssn) {
            Some(normalized) => Some(normalized),
            None => {
                soft_errors.push(ValidationError {
                    field: "ssn".into(),
                    value: "<redacted>".into(),
                    kind: ValidationKind::Format,
                    message: "SSN could not be normalized to XXX-XX-XXXX".into(),
                });
                None
            }
        },
    };

    let address = raw.address.and_then(|raw_address| {
        let address = Address {
            street: none_if_blank(raw_address.street),
            city: none_if_blank(raw_address.city),
            state: none_if_blank(raw_address.state),
            zip_code: none_if_blank(raw_address.zip_code),
        };
        (!address.is_empty()).then_some(address)
    });

    let mut income_history: Vec<IncomeRecord> = Vec::new();
    for raw_income in raw.income_history {
        let amount = match raw_income.amount.as_ref().and_then(money_from_value) {
            Some(amount) => amount,
            None => {
                soft_errors.push(ValidationError {
                    field: "income.amount".into(),
                    value: raw_income
                        .amount
                        .map(|v| v.to_string())
                        .unwrap_or_default(),
                    kind: ValidationKind::Format,
                    message: "income amount could not be parsed".into(),
                });
                continue;
            }
        };
        if amount < bigdecimal::BigDecimal::from(0) {
            soft_errors.push(ValidationError {
                field: "income.amount".into(),
                value: amount.to_string(),
                kind: ValidationKind::Range,
                message: "income amount must be non-negative".into(),
            });
            continue;
        }
        let year = match raw_income.year {
            Some(year) => year,
            None => {
                soft_errors.push(ValidationError {
                    field: "income.year".into(),
                    value: String::new(),
                    kind: ValidationKind::Format,
                    message: "income record is missing a year".into(),
                });
                continue;
            }
        };
        let income = IncomeRecord {
            amount,
            period: raw_income.period.unwrap_or_else(|| "annual".into()),
            year,
            source_type: raw_income.source_type.unwrap_or_else(|| "employment".into()),
            employer: none_if_blank(raw_income.employer),
        };
        if !income_history
            .iter()
            .any(|existing| existing.dedup_key() == income.dedup_key())
        {
            income_history.push(income);
        }
    }

    let source = SourceReference {
        document_id,
        document_name: document_name.to_string(),
        page_number: page_number.max(1),
        section: None,
        snippet: snippet.chars().take(500).collect(),
        char_start: None,
        char_end: None,
    };

    let record = BorrowerRecord {
        id: Uuid::new_v4(),
        name,
        ssn,
        phone: none_if_blank(raw.phone),
        email: none_if_blank(raw.email),
        address,
        income_history,
        account_numbers: dedup_preserving_order(raw.account_numbers),
        loan_numbers: dedup_preserving_order(raw.loan_numbers),
        sources: vec![source],
        confidence_score: 0.5,
    };
    Ok((record, soft_errors))
}

fn none_if_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn dedup_preserving_order(values: Vec<String>) -> Vec<String> {
    let mut seen = Vec::new();
    for value in values {
        let trimmed = value.trim().to_string();
        if !trimmed.is_empty() && !seen.contains(&trimmed) {
            seen.push(trimmed);
        }
    }
    seen
}

fn money_from_value(value: &Value) -> Option<bigdecimal::BigDecimal> {
    match value {
        Value::String(text) => parse_money(text),
        Value::Number(number) => parse_money(&number.to_string()),
        _ => None,
    }
}
