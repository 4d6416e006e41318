use serde::Serialize;

use crate::records::BorrowerRecord;

/// Review threshold in hundredths.
const REVIEW_THRESHOLD: i32 = 70;

/// Additive confidence score for one reconciled borrower. Bonuses are
/// tracked in integer hundredths so the arithmetic stays exact; the public
/// fields expose them as fractions for audit.
#[derive(Debug, Clone, Serialize)]
pub struct ConfidenceBreakdown {
    pub base_score: f64,
    pub required_fields_bonus: f64,
    pub optional_fields_bonus: f64,
    pub multi_source_bonus: f64,
    pub validation_bonus: f64,
    pub total: f64,
    pub requires_review: bool,
}

pub struct ConfidenceCalculator;

impl ConfidenceCalculator {
    pub fn new() -> Self {
        Self
    }

    pub fn calculate(
        &self,
        record: &BorrowerRecord,
        format_validation_passed: bool,
        source_count: usize,
    ) -> ConfidenceBreakdown {
        let base = 50;

        let mut required = 0;
        if record.name.trim().chars().count() >= 2 {
            required += 10;
        }
        if record.address.as_ref().map(|a| !a.is_empty()).unwrap_or(false) {
            required += 10;
        }
        let required = required.min(20);

        let mut optional = 0;
        if !record.income_history.is_empty() {
            optional += 5;
        }
        if !record.account_numbers.is_empty() {
            optional += 5;
        }
        if !record.loan_numbers.is_empty() {
            optional += 5;
        }
        let optional = optional.min(15);

        // Fixed corroboration bonus, not scaled by source count.
        let multi_source = if source_count >= 2 { 10 } else { 0 };
        let validation = if format_validation_passed { 15 } else { 0 };

        let raw_total: i32 = base + required + optional + multi_source + validation;
        let total = raw_total.clamp(0, 100);

        ConfidenceBreakdown {
            base_score: base as f64 / 100.0,
            required_fields_bonus: required as f64 / 100.0,
            optional_fields_bonus: optional as f64 / 100.0,
            multi_source_bonus: multi_source as f64 / 100.0,
            validation_bonus: validation as f64 / 100.0,
            total: total as f64 / 100.0,
            requires_review: total < REVIEW_THRESHOLD,
        }
    }
}

impl Default for ConfidenceCalculator {
    fn default() -> Self {
        Self::new()
    }
}
