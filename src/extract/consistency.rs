use std::collections::HashSet;

use bigdecimal::{BigDecimal, ToPrimitive};
use serde_json::json;

use crate::records::{
    normalize_name, ssn_last4, BorrowerRecord, ConsistencyWarning, WarningKind,
};

/// Year-over-year income ratio below which a drop is flagged.
pub const INCOME_DROP_THRESHOLD: f64 = 0.5;
/// Year-over-year income ratio above which a spike is flagged.
pub const INCOME_SPIKE_THRESHOLD: f64 = 3.0;

/// Flags logical inconsistencies in reconciled borrowers for human review.
/// Unlike deduplication, nothing here is ever auto-corrected.
pub struct ConsistencyValidator;

impl ConsistencyValidator {
    pub fn new() -> Self {
        Self
    }

    pub fn validate(&self, borrowers: &[BorrowerRecord]) -> Vec<ConsistencyWarning> {
        let mut warnings = Vec::new();
        for borrower in borrowers {
            warnings.extend(self.check_address_conflicts(borrower));
            warnings.extend(self.check_income_progression(borrower));
        }
        warnings.extend(self.check_cross_document_consistency(borrowers));
        warnings
    }

    /// A multi-source borrower with an address may be hiding a merge
    /// conflict between documents.
    fn check_address_conflicts(&self, borrower: &BorrowerRecord) -> Vec<ConsistencyWarning> {
        let address = match &borrower.address {
            Some(address) if !address.is_empty() => address,
            _ => return Vec::new(),
        };
        if borrower.sources.len() < 2 {
            return Vec::new();
        }

        let source_docs: Vec<&str> = borrower
            .sources
            .iter()
            .map(|s| s.document_name.as_str())
            .collect();
        vec![ConsistencyWarning {
            kind: WarningKind::AddressConflict,
            borrower_id: borrower.id,
            field: "address".into(),
            message: format!(
                "Borrower '{}' has {} sources - verify address is correct",
                borrower.name,
                borrower.sources.len()
            ),
            details: json!({
                "source_count": borrower.sources.len(),
                "current_address": address,
                "source_docs": source_docs,
            }),
        }]
    }

    fn check_income_progression(&self, borrower: &BorrowerRecord) -> Vec<ConsistencyWarning> {
        if borrower.income_history.len() < 2 {
            return Vec::new();
        }

        let mut sorted: Vec<_> = borrower.income_history.iter().collect();
        sorted.sort_by_key(|income| income.year);

        let mut warnings = Vec::new();
        for pair in sorted.windows(2) {
            let (prev, curr) = (pair[0], pair[1]);
            if curr.year != prev.year + 1 {
                continue;
            }
            if prev.amount <= BigDecimal::from(0) {
                continue;
            }
            let ratio = match (&curr.amount / &prev.amount).to_f64() {
                Some(ratio) => ratio,
                None => continue,
            };
            let pct_change = (ratio - 1.0) * 100.0;

            if ratio < INCOME_DROP_THRESHOLD {
                warnings.push(ConsistencyWarning {
                    kind: WarningKind::IncomeDrop,
                    borrower_id: borrower.id,
                    field: "income_history".into(),
                    message: format!(
                        "Income dropped {:.0}% from {} to {}",
                        pct_change.abs(),
                        prev.year,
                        curr.year
                    ),
                    details: json!({
                        "year1": prev.year,
                        "amount1": prev.amount.to_string(),
                        "year2": curr.year,
                        "amount2": curr.amount.to_string(),
                        "pct_change": (pct_change * 10.0).round() / 10.0,
                    }),
                });
            } else if ratio > INCOME_SPIKE_THRESHOLD {
                warnings.push(ConsistencyWarning {
                    kind: WarningKind::IncomeSpike,
                    borrower_id: borrower.id,
                    field: "income_history".into(),
                    message: format!(
                        "Income increased {:.0}% from {} to {} - verify accuracy",
                        pct_change, prev.year, curr.year
                    ),
                    details: json!({
                        "year1": prev.year,
                        "amount1": prev.amount.to_string(),
                        "year2": curr.year,
                        "amount2": curr.amount.to_string(),
                        "pct_change": (pct_change * 10.0).round() / 10.0,
                    }),
                });
            }
        }
        warnings
    }

    /// Same name appearing with different SSN last-4 values after dedup:
    /// either different people sharing a name, or an extraction error.
    fn check_cross_document_consistency(
        &self,
        borrowers: &[BorrowerRecord],
    ) -> Vec<ConsistencyWarning> {
        let mut groups: Vec<(String, Vec<&BorrowerRecord>)> = Vec::new();
        for borrower in borrowers {
            let key = normalize_name(&borrower.name);
            match groups.iter_mut().find(|(name, _)| *name == key) {
                Some((_, members)) => members.push(borrower),
                None => groups.push((key, vec![borrower])),
            }
        }

        let mut warnings = Vec::new();
        for (_, group) in groups {
            if group.len() < 2 {
                continue;
            }
            let with_ssn: Vec<(&BorrowerRecord, String)> = group
                .iter()
                .filter_map(|b| {
                    b.ssn
                        .as_deref()
                        .and_then(ssn_last4)
                        .map(|last4| (*b, last4))
                })
                .collect();
            if with_ssn.len() < 2 {
                continue;
            }
            let last4_values: HashSet<&str> =
                with_ssn.iter().map(|(_, last4)| last4.as_str()).collect();
            if last4_values.len() > 1 {
                let record_ids: Vec<String> = group.iter().map(|b| b.id.to_string()).collect();
                let mut last4_sorted: Vec<&str> = last4_values.into_iter().collect();
                last4_sorted.sort_unstable();
                warnings.push(ConsistencyWarning {
                    kind: WarningKind::CrossDocMismatch,
                    borrower_id: group[0].id,
                    field: "ssn".into(),
                    message: format!(
                        "Multiple records for '{}' with different identifiers - may be \
                         different people or data error",
                        group[0].name
                    ),
                    details: json!({
                        "name": group[0].name,
                        "record_ids": record_ids,
                        "ssn_last4_values": last4_sorted,
                    }),
                });
            }
        }
        warnings
    }
}

impl Default for ConsistencyValidator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{Address, IncomeRecord, SourceReference};
    use uuid::Uuid;

    fn record(name: &str) -> BorrowerRecord {
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
            sources: Vec::new(),
            confidence_score: 0.5,
        }
    }

    fn source(page: i32) -> SourceReference {
        SourceReference {
            document_id: Uuid::new_v4(),
            document_name: format!("doc-{page}.pdf"),
            page_number: page,
            section: None,
            snippet: "snippet".into(),
            char_start: None,
            char_end: None,
        }
    }

    fn income(year: i32, amount: i64) -> IncomeRecord {
        IncomeRecord {
            amount: BigDecimal::from(amount),
            period: "annual".into(),
            year,
            source_type: "employment".into(),
            employer: None,
        }
    }

    fn kinds(warnings: &[ConsistencyWarning]) -> Vec<WarningKind> {
        warnings.iter().map(|w| w.kind).collect()
    }

    #[test]
    fn single_source_address_is_not_flagged() {
        let mut borrower = record("John Smith");
        borrower.address = Some(Address {
            street: Some("123 Main St".into()),
            ..Default::default()
        });
        borrower.sources = vec![source(1)];
        let warnings = ConsistencyValidator::new().validate(&[borrower]);
        assert!(warnings.is_empty());
    }

    #[test]
    fn multi_source_address_is_flagged() {
        let mut borrower = record("John Smith");
        borrower.address = Some(Address {
            street: Some("123 Main St".into()),
            ..Default::default()
        });
        borrower.sources = vec![source(1), source(2)];
        let warnings = ConsistencyValidator::new().validate(&[borrower]);
        assert_eq!(kinds(&warnings), vec![WarningKind::AddressConflict]);
    }

    #[test]
    fn multi_source_without_address_is_not_flagged() {
        let mut borrower = record("John Smith");
        borrower.sources = vec![source(1), source(2)];
        let warnings = ConsistencyValidator::new().validate(&[borrower]);
        assert!(warnings.is_empty());
    }

    #[test]
    fn income_drop_below_half_is_flagged() {
        let mut borrower = record("John Smith");
        borrower.income_history = vec![income(2022, 100_000), income(2023, 40_000)];
        let warnings = ConsistencyValidator::new().validate(&[borrower]);
        assert_eq!(kinds(&warnings), vec![WarningKind::IncomeDrop]);
    }

    #[test]
    fn drop_to_exactly_half_is_not_flagged() {
        let mut borrower = record("John Smith");
        borrower.income_history = vec![income(2022, 100_000), income(2023, 50_000)];
        let warnings = ConsistencyValidator::new().validate(&[borrower]);
        assert!(warnings.is_empty());
    }

    #[test]
    fn income_spike_above_triple_is_flagged() {
        let mut borrower = record("John Smith");
        borrower.income_history = vec![income(2022, 30_000), income(2023, 100_000)];
        let warnings = ConsistencyValidator::new().validate(&[borrower]);
        assert_eq!(kinds(&warnings), vec![WarningKind::IncomeSpike]);
    }

    #[test]
    fn exactly_triple_is_not_flagged() {
        let mut borrower = record("John Smith");
        borrower.income_history = vec![income(2022, 30_000), income(2023, 90_000)];
        let warnings = ConsistencyValidator::new().validate(&[borrower]);
        assert!(warnings.is_empty());
    }

    #[test]
    fn non_consecutive_years_are_skipped() {
        let mut borrower = record("John Smith");
        borrower.income_history = vec![income(2020, 100_000), income(2023, 10_000)];
        let warnings = ConsistencyValidator::new().validate(&[borrower]);
        assert!(warnings.is_empty());
    }

    #[test]
    fn zero_previous_amount_is_skipped() {
        let mut borrower = record("John Smith");
        borrower.income_history = vec![income(2022, 0), income(2023, 100_000)];
        let warnings = ConsistencyValidator::new().validate(&[borrower]);
        assert!(warnings.is_empty());
    }

    #[test]
    fn unsorted_income_history_is_sorted_before_comparison() {
        let mut borrower = record("John Smith");
        borrower.income_history = vec![income(2023, 40_000), income(2022, 100_000)];
        let warnings = ConsistencyValidator::new().validate(&[borrower]);
        assert_eq!(kinds(&warnings), vec![WarningKind::IncomeDrop]);
    }

    #[test]
    fn same_name_different_last_four_is_flagged() {
        let mut a = record("John Smith");
        a.ssn = Some("123-45-6789".into());
        let mut b = record("john  smith");
        b.ssn = Some("123-45-1111".into());
        let warnings = ConsistencyValidator::new().validate(&[a, b]);
        assert_eq!(kinds(&warnings), vec![WarningKind::CrossDocMismatch]);
    }

    #[test]
    fn same_name_same_last_four_is_not_flagged() {
        let mut a = record("John Smith");
        a.ssn = Some("123-45-6789".into());
        let mut b = record("John Smith");
        b.ssn = Some("999-99-6789".into());
        let warnings = ConsistencyValidator::new().validate(&[a, b]);
        assert!(warnings.is_empty());
    }

    #[test]
    fn group_needs_two_ssn_bearing_records() {
        let mut a = record("John Smith");
        a.ssn = Some("123-45-6789".into());
        let b = record("John Smith");
        let warnings = ConsistencyValidator::new().validate(&[a, b]);
        assert!(warnings.is_empty());
    }
}
