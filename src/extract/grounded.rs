use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

use crate::content::DocumentContent;
use crate::extract::extractor::{ExtractionOutput, Reconciler};
use crate::extract::llm::{LlmBackend, LlmError, LlmRequest, ModelTier};
use crate::records::{
    normalize_ssn, parse_money, slice_chars, Address, BorrowerRecord, IncomeRecord,
    SourceReference,
};

const SNIPPET_BEFORE: usize = 50;
const SNIPPET_AFTER: usize = 150;
const SNIPPET_MAX: usize = 500;
/// Pre-reconciliation confidence for character-grounded records.
const GROUNDED_SEED_CONFIDENCE: f64 = 0.8;

pub const GROUNDED_SYSTEM_PROMPT: &str = "You are a mortgage document analyst. Emit one \
extraction per fact found in the document: class `borrower` for each borrower name (with ssn, \
phone, email, street, city, state, zip_code attributes when present), class `income` for each \
income record (amount, period, year, source_type, employer attributes), and classes `account` \
and `loan` for account and loan numbers. The extraction_text must be copied verbatim from the \
document, character for character, so it can be located exactly. Emit extractions in document \
order. Omit anything unclear rather than guessing.";

fn grounded_prompt(document_text: &str) -> String {
    format!("Extract all borrower information from this loan document:\n\n{document_text}")
}

fn grounded_response_schema() -> Value {
    json!({
        "type": "OBJECT",
        "properties": {
            "extractions": {
                "type": "ARRAY",
                "items": {
                    "type": "OBJECT",
                    "properties": {
                        "extraction_class": {
                            "type": "STRING",
                            "enum": ["borrower", "income", "account", "loan"],
                        },
                        "extraction_text": { "type": "STRING" },
                        "attributes": {
                            "type": "OBJECT",
                            "nullable": true,
                            "properties": {
                                "ssn": { "type": "STRING", "nullable": true },
                                "phone": { "type": "STRING", "nullable": true },
                                "email": { "type": "STRING", "nullable": true },
                                "street": { "type": "STRING", "nullable": true },
                                "city": { "type": "STRING", "nullable": true },
                                "state": { "type": "STRING", "nullable": true },
                                "zip_code": { "type": "STRING", "nullable": true },
                                "amount": { "type": "STRING", "nullable": true },
                                "period": { "type": "STRING", "nullable": true },
                                "year": { "type": "INTEGER", "nullable": true },
                                "source_type": { "type": "STRING", "nullable": true },
                                "employer": { "type": "STRING", "nullable": true },
                            },
                        },
                    },
                    "required": ["extraction_class", "extraction_text"],
                },
            },
        },
        "required": ["extractions"],
    })
}

#[derive(Debug, Deserialize)]
struct RawGrounded {
    #[serde(default)]
    extractions: Vec<RawGroundedExtraction>,
}

#[derive(Debug, Deserialize)]
struct RawGroundedExtraction {
    extraction_class: String,
    extraction_text: String,
    #[serde(default)]
    attributes: Option<Value>,
}

/// How precisely an extraction was located in the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlignmentStatus {
    Exact,
    Fuzzy,
    None,
}

#[derive(Debug, Clone, Copy)]
pub struct Alignment {
    pub char_start: usize,
    pub char_end: usize,
    pub status: AlignmentStatus,
}

/// Verify the substring invariant: the document slice at the offsets equals
/// the extracted text.
pub fn verify_offset(document_text: &str, start: usize, end: usize, extracted: &str) -> bool {
    slice_chars(document_text, start, end) == extracted
}

/// Locate `needle` in the document, preferring an exact occurrence at or
/// after `cursor`, then an exact occurrence anywhere, then a
/// whitespace-normalized fuzzy match.
pub fn align_extraction(document_text: &str, needle: &str, cursor: usize) -> Option<Alignment> {
    if needle.is_empty() {
        return None;
    }
    let doc_chars: Vec<char> = document_text.chars().collect();
    let needle_chars: Vec<char> = needle.chars().collect();

    if let Some(start) = find_chars(&doc_chars, &needle_chars, cursor)
        .or_else(|| find_chars(&doc_chars, &needle_chars, 0))
    {
        return Some(Alignment {
            char_start: start,
            char_end: start + needle_chars.len(),
            status: AlignmentStatus::Exact,
        });
    }

    // Fuzzy pass: collapse whitespace runs on both sides and map the match
    // back to original code-point offsets.
    let (collapsed_doc, index_map) = collapse_whitespace(&doc_chars);
    let (collapsed_needle, _) = collapse_whitespace(&needle_chars);
    if collapsed_needle.is_empty() {
        return None;
    }
    let collapsed_doc_chars: Vec<char> = collapsed_doc.chars().collect();
    let collapsed_needle_chars: Vec<char> = collapsed_needle.chars().collect();
    let start = find_chars(&collapsed_doc_chars, &collapsed_needle_chars, 0)?;
    let end = start + collapsed_needle_chars.len();
    Some(Alignment {
        char_start: index_map[start],
        char_end: index_map[end - 1] + 1,
        status: AlignmentStatus::Fuzzy,
    })
}

fn find_chars(haystack: &[char], needle: &[char], from: usize) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    let last_start = haystack.len() - needle.len();
    if from > last_start {
        return None;
    }
    (from..=last_start).find(|&start| haystack[start..start + needle.len()] == *needle)
}

/// Collapse whitespace runs to single spaces, returning the collapsed text
/// and a map from collapsed positions to original positions.
fn collapse_whitespace(chars: &[char]) -> (String, Vec<usize>) {
    let mut collapsed = String::new();
    let mut map = Vec::new();
    let mut in_whitespace = false;
    for (index, &ch) in chars.iter().enumerate() {
        if ch.is_whitespace() {
            if !in_whitespace && !collapsed.is_empty() {
                collapsed.push(' ');
                map.push(index);
            }
            in_whitespace = true;
        } else {
            collapsed.push(ch);
            map.push(index);
            in_whitespace = false;
        }
    }
    while collapsed.ends_with(' ') {
        collapsed.pop();
        map.pop();
    }
    (collapsed, map)
}

#[derive(Debug, Default)]
struct PendingBorrower {
    name: String,
    ssn: Option<String>,
    phone: Option<String>,
    email: Option<String>,
    address: Address,
    income_history: Vec<IncomeRecord>,
    account_numbers: Vec<String>,
    loan_numbers: Vec<String>,
    sources: Vec<SourceReference>,
}

/// Character-grounded extraction: a single LLM pass whose extractions are
/// aligned back into the document text, so source references carry verified
/// code-point offsets.
pub struct GroundedExtractor {
    llm: Arc<dyn LlmBackend>,
    reconciler: Reconciler,
}

impl GroundedExtractor {
    pub fn new(llm: Arc<dyn LlmBackend>) -> Self {
        Self {
            llm,
            reconciler: Reconciler::new(),
        }
    }

    pub async fn extract(
        &self,
        document: &DocumentContent,
        document_id: Uuid,
        document_name: &str,
    ) -> Result<ExtractionOutput, LlmError> {
        let response = self
            .llm
            .generate(LlmRequest {
                system_instruction: GROUNDED_SYSTEM_PROMPT.to_string(),
                prompt: grounded_prompt(&document.text),
                response_schema: grounded_response_schema(),
                tier: ModelTier::Flash,
            })
            .await?;

        let parsed: RawGrounded = serde_json::from_value(response.payload)
            .map_err(|err| LlmError::InvalidResponse(format!("schema mismatch: {err}")))?;

        let mut warnings = Vec::new();
        let mut pending: Vec<PendingBorrower> = Vec::new();
        let mut cursor = 0usize;

        for extraction in parsed.extractions {
            let alignment = align_extraction(&document.text, &extraction.extraction_text, cursor);
            let (char_start, char_end) = match alignment {
                Some(alignment) => {
                    cursor = alignment.char_end;
                    match alignment.status {
                        AlignmentStatus::Exact
                            if verify_offset(
                                &document.text,
                                alignment.char_start,
                                alignment.char_end,
                                &extraction.extraction_text,
                            ) =>
                        {
                            (Some(alignment.char_start), Some(alignment.char_end))
                        }
                        AlignmentStatus::Exact => {
                            warnings.push(format!(
                                "Offset verification failed for '{}'",
                                preview(&extraction.extraction_text)
                            ));
                            (None, None)
                        }
                        _ => {
                            warnings.push(format!(
                                "Fuzzy alignment for '{}'",
                                preview(&extraction.extraction_text)
                            ));
                            (None, None)
                        }
                    }
                }
                None => {
                    warnings.push(format!(
                        "No alignment for '{}'",
                        preview(&extraction.extraction_text)
                    ));
                    (None, None)
                }
            };

            let attributes = extraction.attributes.unwrap_or(Value::Null);
            match extraction.extraction_class.as_str() {
                "borrower" => {
                    let snippet = snippet_around(&document.text, char_start, char_end);
                    let name = extraction.extraction_text.trim().to_string();
                    if name.is_empty() {
                        continue;
                    }
                    let page_number = page_for_offset(document, char_start);
                    let source = SourceReference {
                        document_id,
                        document_name: document_name.to_string(),
                        page_number,
                        section: None,
                        snippet,
                        char_start,
                        char_end,
                    };
                    match pending.iter_mut().find(|b| b.name == name) {
                        Some(existing) => {
                            merge_borrower_attributes(existing, &attributes, &mut warnings);
                            if !existing
                                .sources
                                .iter()
                                .any(|s| s.dedup_key() == source.dedup_key())
                            {
                                existing.sources.push(source);
                            }
                        }
                        None => {
                            let mut borrower = PendingBorrower {
                                name,
                                sources: vec![source],
                                ..Default::default()
                            };
                            merge_borrower_attributes(&mut borrower, &attributes, &mut warnings);
                            pending.push(borrower);
                        }
                    }
                }
                "income" => match pending.last_mut() {
                    Some(borrower) => {
                        if let Some(income) = income_from_attributes(&attributes) {
                            if !borrower
                                .income_history
                                .iter()
                                .any(|existing| existing.dedup_key() == income.dedup_key())
                            {
                                borrower.income_history.push(income);
                            }
                        }
                    }
                    None => warnings.push("income extraction before any borrower".into()),
                },
                "account" | "loan" => match pending.last_mut() {
                    Some(borrower) => {
                        let number = extraction.extraction_text.trim().to_string();
                        if number.is_empty() {
                            continue;
                        }
                        let list = if extraction.extraction_class == "loan" {
                            &mut borrower.loan_numbers
                        } else {
                            &mut borrower.account_numbers
                        };
                        if !list.contains(&number) {
                            list.push(number);
                        }
                    }
                    None => warnings.push(format!(
                        "{} extraction before any borrower",
                        extraction.extraction_class
                    )),
                },
                other => warnings.push(format!("unknown extraction class '{other}'")),
            }
        }

        let records: Vec<BorrowerRecord> = pending
            .into_iter()
            .map(|borrower| {
                let ssn = borrower.ssn.as_deref().and_then(|raw| {
                    let normalized = normalize_ssn(raw);
                    if normalized.is_none() {
                        warnings.push(format!(
                            "SSN for '{}' could not be normalized",
                            borrower.name
                        ));
                    }
                    normalized
                });
                BorrowerRecord {
                    id: Uuid::new_v4(),
                    name: borrower.name,
                    ssn,
                    phone: borrower.phone,
                    email: borrower.email,
                    address: (!borrower.address.is_empty()).then_some(borrower.address),
                    income_history: borrower.income_history,
                    account_numbers: borrower.account_numbers,
                    loan_numbers: borrower.loan_numbers,
                    sources: borrower.sources,
                    confidence_score: GROUNDED_SEED_CONFIDENCE,
                }
            })
            .collect();

        info!(
            %document_id,
            borrowers = records.len(),
            warnings = warnings.len(),
            "grounded extraction complete"
        );

        let (borrowers, validation_errors, consistency_warnings) =
            self.reconciler.reconcile(records);

        Ok(ExtractionOutput {
            borrowers,
            complexity: None,
            chunks_processed: 1,
            input_tokens: response.input_tokens,
            output_tokens: response.output_tokens,
            validation_errors,
            consistency_warnings,
            alignment_warnings: warnings,
        })
    }
}

fn preview(text: &str) -> String {
    let short: String = text.chars().take(30).collect();
    if short.len() < text.len() {
        format!("{short}...")
    } else {
        short
    }
}

fn snippet_around(text: &str, char_start: Option<usize>, char_end: Option<usize>) -> String {
    match (char_start, char_end) {
        (Some(start), Some(end)) => {
            let context_start = start.saturating_sub(SNIPPET_BEFORE);
            let context_end = end + SNIPPET_AFTER;
            slice_chars(text, context_start, context_end)
                .chars()
                .take(SNIPPET_MAX)
                .collect()
        }
        _ => text.chars().take(200).collect(),
    }
}

fn page_for_offset(document: &DocumentContent, char_start: Option<usize>) -> i32 {
    match char_start {
        Some(offset) => crate::extract::extractor::find_page_for_position(document, offset),
        None => 1,
    }
}

fn merge_borrower_attributes(
    borrower: &mut PendingBorrower,
    attributes: &Value,
    _warnings: &mut Vec<String>,
) {
    let get = |key: &str| {
        attributes[key]
            .as_str()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(String::from)
    };
    if borrower.ssn.is_none() {
        borrower.ssn = get("ssn");
    }
    if borrower.phone.is_none() {
        borrower.phone = get("phone");
    }
    if borrower.email.is_none() {
        borrower.email = get("email");
    }
    if borrower.address.street.is_none() {
        borrower.address.street = get("street");
    }
    if borrower.address.city.is_none() {
        borrower.address.city = get("city");
    }
    if borrower.address.state.is_none() {
        borrower.address.state = get("state");
    }
    if borrower.address.zip_code.is_none() {
        borrower.address.zip_code = get("zip_code");
    }
}

fn income_from_attributes(attributes: &Value) -> Option<IncomeRecord> {
    let amount = match &attributes["amount"] {
        Value::String(text) => parse_money(text),
        Value::Number(number) => parse_money(&number.to_string()),
        _ => None,
    }?;
    let year = attributes["year"].as_i64()? as i32;
    let text_field = |key: &str, default: &str| {
        attributes[key]
            .as_str()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(String::from)
            .unwrap_or_else(|| default.to_string())
    };
    Some(IncomeRecord {
        amount,
        period: text_field("period", "annual"),
        year,
        source_type: text_field("source_type", "employment"),
        employer: attributes["employer"]
            .as_str()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(String::from),
    })
}
