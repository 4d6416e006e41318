use chrono::{Datelike, Utc};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::records::{ValidationError, ValidationKind};

pub const MIN_INCOME_YEAR: i32 = 1950;

static SSN_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d{3}-\d{2}-\d{4}$").expect("valid regex"));
static ZIP_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d{5}(-\d{4})?$").expect("valid regex"));
static PHONE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\+?[\d\s\-\.\(\)]+$").expect("valid regex"));

#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub errors: Vec<ValidationError>,
}

impl ValidationResult {
    fn ok() -> Self {
        Self { errors: Vec::new() }
    }

    fn failed(field: &str, value: &str, kind: ValidationKind, message: impl Into<String>) -> Self {
        Self {
            errors: vec![ValidationError {
                field: field.to_string(),
                value: value.to_string(),
                kind,
                message: message.into(),
            }],
        }
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Format and range validation of reconciled borrower fields. Failures never
/// disqualify a record; they surface as [`ValidationError`]s and withhold the
/// confidence validation bonus.
pub struct FieldValidator;

impl FieldValidator {
    pub fn new() -> Self {
        Self
    }

    /// SSN must already be normalized. The raw value is not echoed into the
    /// error to keep it out of every stored string.
    pub fn validate_ssn(&self, ssn: Option<&str>) -> ValidationResult {
        match ssn {
            None => ValidationResult::ok(),
            Some(value) if SSN_PATTERN.is_match(value) => ValidationResult::ok(),
            Some(_) => ValidationResult::failed(
                "ssn",
                "<redacted>",
                ValidationKind::Format,
                "SSN does not match XXX-XX-XXXX",
            ),
        }
    }

    /// Locale-agnostic phone check: punctuation-only separators and 10 to 15
    /// digits (NANP length up to full E.164).
    pub fn validate_phone(&self, phone: Option<&str>) -> ValidationResult {
        match phone {
            None => ValidationResult::ok(),
            Some(value) => {
                let digits = value.chars().filter(|c| c.is_ascii_digit()).count();
                if PHONE_PATTERN.is_match(value.trim()) && (10..=15).contains(&digits) {
                    ValidationResult::ok()
                } else {
                    ValidationResult::failed(
                        "phone",
                        value,
                        ValidationKind::Format,
                        "phone number must contain 10-15 digits",
                    )
                }
            }
        }
    }

    pub fn validate_zip(&self, zip: Option<&str>) -> ValidationResult {
        match zip {
            None => ValidationResult::ok(),
            Some(value) if ZIP_PATTERN.is_match(value) => ValidationResult::ok(),
            Some(value) => ValidationResult::failed(
                "zip_code",
                value,
                ValidationKind::Format,
                "ZIP code must match 12345 or 12345-6789",
            ),
        }
    }

    pub fn validate_year(&self, year: i32) -> ValidationResult {
        let max_year = Utc::now().year() + 1;
        if (MIN_INCOME_YEAR..=max_year).contains(&year) {
            ValidationResult::ok()
        } else {
            ValidationResult::failed(
                "year",
                &year.to_string(),
                ValidationKind::Range,
                format!("income year must be between {MIN_INCOME_YEAR} and {max_year}"),
            )
        }
    }
}

impl Default for FieldValidator {
    fn default() -> Self {
        Self::new()
    }
}
