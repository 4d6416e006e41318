use std::collections::HashSet;

use strsim::normalized_levenshtein;

use crate::records::{normalize_name, ssn_last4, BorrowerRecord};

const NAME_ZIP_THRESHOLD: f64 = 0.90;
const STRONG_NAME_THRESHOLD: f64 = 0.95;
const NAME_LAST4_THRESHOLD: f64 = 0.80;

/// Merges borrower records that refer to the same person. Five ordered
/// strategies decide equivalence; equivalence is transitive via union-find,
/// and the whole pass is deterministic for a given input order.
pub struct BorrowerDeduplicator;

impl BorrowerDeduplicator {
    pub fn new() -> Self {
        Self
    }

    pub fn deduplicate(&self, records: Vec<BorrowerRecord>) -> Vec<BorrowerRecord> {
        let len = records.len();
        if len < 2 {
            return records;
        }

        let mut parent: Vec<usize> = (0..len).collect();
        for i in 0..len {
            for j in (i + 1)..len {
                if find(&mut parent, i) == find(&mut parent, j) {
                    continue;
                }
                if Self::is_duplicate(&records[i], &records[j]) {
                    union(&mut parent, i, j);
                }
            }
        }

        // Group by root, preserving first-seen order.
        let mut groups: Vec<(usize, Vec<usize>)> = Vec::new();
        for i in 0..len {
            let root = find(&mut parent, i);
            match groups.iter_mut().find(|(r, _)| *r == root) {
                Some((_, members)) => members.push(i),
                None => groups.push((root, vec![i])),
            }
        }

        let mut by_index: Vec<Option<BorrowerRecord>> = records.into_iter().map(Some).collect();
        groups
            .into_iter()
            .map(|(_, members)| {
                let mut merged: Option<BorrowerRecord> = None;
                for index in members {
                    let record = by_index[index].take().expect("record taken once");
                    merged = Some(match merged {
                        None => record,
                        Some(base) => Self::merge(base, record),
                    });
                }
                merged.expect("group is non-empty")
            })
            .collect()
    }

    fn is_duplicate(a: &BorrowerRecord, b: &BorrowerRecord) -> bool {
        // S1: identical SSN.
        if let (Some(ssn_a), Some(ssn_b)) = (&a.ssn, &b.ssn) {
            if ssn_a == ssn_b {
                return true;
            }
        }

        // S2: any shared account or loan number.
        let numbers_a: HashSet<&str> = a
            .account_numbers
            .iter()
            .chain(a.loan_numbers.iter())
            .map(String::as_str)
            .collect();
        if b.account_numbers
            .iter()
            .chain(b.loan_numbers.iter())
            .any(|n| numbers_a.contains(n.as_str()))
        {
            return true;
        }

        let similarity = name_similarity(&a.name, &b.name);

        // S3: similar name and matching 5-digit ZIP.
        if similarity >= NAME_ZIP_THRESHOLD {
            if let (Some(zip_a), Some(zip_b)) = (zip5(a), zip5(b)) {
                if zip_a == zip_b {
                    return true;
                }
            }
        }

        // S4: strong name match, with or without address corroboration.
        if similarity >= STRONG_NAME_THRESHOLD {
            return true;
        }

        // S5: similar name and matching SSN last four.
        if similarity >= NAME_LAST4_THRESHOLD {
            if let (Some(last_a), Some(last_b)) = (
                a.ssn.as_deref().and_then(ssn_last4),
                b.ssn.as_deref().and_then(ssn_last4),
            ) {
                if last_a == last_b {
                    return true;
                }
            }
        }

        false
    }

    /// Merge two records: the higher-confidence record is the base; scalar
    /// fields keep the base value when present, list fields union as keyed
    /// sets.
    fn merge(a: BorrowerRecord, b: BorrowerRecord) -> BorrowerRecord {
        let (mut base, other) = if b.confidence_score > a.confidence_score {
            (b, a)
        } else {
            (a, b)
        };

        if base.ssn.is_none() {
            base.ssn = other.ssn;
        }
        if base.phone.is_none() {
            base.phone = other.phone;
        }
        if base.email.is_none() {
            base.email = other.email;
        }
        if base.address.is_none() {
            base.address = other.address;
        }

        for income in other.income_history {
            if !base
                .income_history
                .iter()
                .any(|existing| existing.dedup_key() == income.dedup_key())
            {
                base.income_history.push(income);
            }
        }
        for number in other.account_numbers {
            if !base.account_numbers.contains(&number) {
                base.account_numbers.push(number);
            }
        }
        for number in other.loan_numbers {
            if !base.loan_numbers.contains(&number) {
                base.loan_numbers.push(number);
            }
        }
        for source in other.sources {
            if !base
                .sources
                .iter()
                .any(|existing| existing.dedup_key() == source.dedup_key())
            {
                base.sources.push(source);
            }
        }

        base.confidence_score = base.confidence_score.max(other.confidence_score);
        base
    }
}

impl Default for BorrowerDeduplicator {
    fn default() -> Self {
        Self::new()
    }
}

fn find(parent: &mut Vec<usize>, mut index: usize) -> usize {
    while parent[index] != index {
        parent[index] = parent[parent[index]];
        index = parent[index];
    }
    index
}

fn union(parent: &mut Vec<usize>, a: usize, b: usize) {
    let root_a = find(parent, a);
    let root_b = find(parent, b);
    if root_a != root_b {
        // Attach the later root under the earlier one for determinism.
        let (low, high) = if root_a < root_b {
            (root_a, root_b)
        } else {
            (root_b, root_a)
        };
        parent[high] = low;
    }
}

pub fn name_similarity(a: &str, b: &str) -> f64 {
    normalized_levenshtein(&normalize_name(a), &normalize_name(b))
}

fn zip5(record: &BorrowerRecord) -> Option<String> {
    record
        .address
        .as_ref()
        .and_then(|address| address.zip_code.as_deref())
        .map(|zip| zip.chars().filter(|c| c.is_ascii_digit()).take(5).collect::<String>())
        .filter(|zip| zip.len() == 5)
}
