use bigdecimal::BigDecimal;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;
use uuid::Uuid;

/// Mailing address as it appears on a loan document. All parts are optional;
/// an address with no parts set is treated as absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub street: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub zip_code: Option<String>,
}

impl Address {
    pub fn is_empty(&self) -> bool {
        self.street.is_none() && self.city.is_none() && self.state.is_none() && self.zip_code.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncomeRecord {
    pub amount: BigDecimal,
    pub period: String,
    pub year: i32,
    pub source_type: String,
    pub employer: Option<String>,
}

impl IncomeRecord {
    /// Uniqueness key within one borrower's income history.
    pub fn dedup_key(&self) -> (i32, String, BigDecimal) {
        (self.year, self.period.clone(), self.amount.clone())
    }
}

/// Weak reference from a borrower into a document. Offsets are code-point
/// positions into the linearized document text; when both are set the slice
/// they denote matched the extracted text at creation time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceReference {
    pub document_id: Uuid,
    pub document_name: String,
    pub page_number: i32,
    pub section: Option<String>,
    pub snippet: String,
    pub char_start: Option<usize>,
    pub char_end: Option<usize>,
}

impl SourceReference {
    pub fn dedup_key(&self) -> (Uuid, i32, Option<usize>, Option<usize>) {
        (self.document_id, self.page_number, self.char_start, self.char_end)
    }
}

/// A reconciled borrower. The raw SSN only ever lives here, in memory, for
/// the duration of one task invocation; persistence stores its hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BorrowerRecord {
    pub id: Uuid,
    pub name: String,
    pub ssn: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub address: Option<Address>,
    pub income_history: Vec<IncomeRecord>,
    pub account_numbers: Vec<String>,
    pub loan_numbers: Vec<String>,
    pub sources: Vec<SourceReference>,
    pub confidence_score: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WarningKind {
    AddressConflict,
    IncomeDrop,
    IncomeSpike,
    CrossDocMismatch,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsistencyWarning {
    pub kind: WarningKind,
    pub borrower_id: Uuid,
    pub field: String,
    pub message: String,
    pub details: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidationKind {
    Format,
    Range,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationError {
    pub field: String,
    pub value: String,
    pub kind: ValidationKind,
    pub message: String,
}

static SSN_DIGITS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\D").expect("valid regex"));
static SSN_FORMAT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d{3}-\d{2}-\d{4}$").expect("valid regex"));

/// Normalize an SSN to `XXX-XX-XXXX`. Any string containing exactly nine
/// digits normalizes; everything else is rejected. Idempotent.
pub fn normalize_ssn(raw: &str) -> Option<String> {
    let digits = SSN_DIGITS.replace_all(raw, "");
    if digits.len() != 9 {
        return None;
    }
    Some(format!("{}-{}-{}", &digits[0..3], &digits[3..5], &digits[5..9]))
}

pub fn is_normalized_ssn(value: &str) -> bool {
    SSN_FORMAT.is_match(value)
}

/// Last four digits of a normalized or raw SSN, for partial-identity checks.
/// Never persisted.
pub fn ssn_last4(ssn: &str) -> Option<String> {
    let digits = SSN_DIGITS.replace_all(ssn, "");
    if digits.len() < 4 {
        return None;
    }
    Some(digits[digits.len() - 4..].to_string())
}

/// Parse a money field, stripping currency symbols and thousands separators.
pub fn parse_money(raw: &str) -> Option<BigDecimal> {
    let cleaned: String = raw
        .trim()
        .chars()
        .filter(|c| !matches!(c, '$' | ',' | ' '))
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    BigDecimal::from_str(&cleaned).ok()
}

/// Lowercase a name and collapse runs of whitespace, for comparison.
pub fn normalize_name(name: &str) -> String {
    name.split_whitespace()
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Slice a string by code-point positions. Positions beyond the end clamp.
pub fn slice_chars(text: &str, start: usize, end: usize) -> String {
    text.chars().skip(start).take(end.saturating_sub(start)).collect()
}
