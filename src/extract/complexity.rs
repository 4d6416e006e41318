use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

pub const MAX_SIMPLE_PAGES: i32 = 10;
pub const QUALITY_INDICATOR_THRESHOLD: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ComplexityLevel {
    Standard,
    Complex,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComplexityAssessment {
    pub level: ComplexityLevel,
    pub reasons: Vec<String>,
    pub estimated_borrowers: usize,
    pub has_handwritten: bool,
    pub has_poor_quality: bool,
    pub page_count: i32,
}

static MULTI_BORROWER_MARKERS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)co-borrower",
        r"(?i)joint applicant",
        r"(?i)spouse",
        r"(?i)borrower 2",
        r"(?i)second borrower",
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).expect("valid regex"))
    .collect()
});

static QUALITY_MARKERS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)\[illegible\]",
        r"(?i)\[unclear\]",
        r"\?\?\?",
        r"[^\w\s]{5,}",
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).expect("valid regex"))
    .collect()
});

static HANDWRITTEN_MARKERS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [r"(?i)\[handwritten\]", r"(?i)signature:", r"(?i)signed:"]
        .iter()
        .map(|pattern| Regex::new(pattern).expect("valid regex"))
        .collect()
});

/// Classifies a document as STANDARD or COMPLEX to route between the flash
/// and pro model tiers.
pub struct ComplexityClassifier;

impl ComplexityClassifier {
    pub fn new() -> Self {
        Self
    }

    pub fn classify(&self, text: &str, page_count: i32) -> ComplexityAssessment {
        let mut reasons = Vec::new();

        // Each distinct multi-borrower marker raises the borrower estimate.
        let marker_hits = MULTI_BORROWER_MARKERS
            .iter()
            .filter(|marker| marker.is_match(text))
            .count();
        let estimated_borrowers = 1 + marker_hits;
        if marker_hits > 0 {
            reasons.push(format!(
                "multi-borrower markers found ({marker_hits}), estimated {estimated_borrowers} borrowers"
            ));
        }

        if page_count > MAX_SIMPLE_PAGES {
            reasons.push(format!("document has {page_count} pages (> {MAX_SIMPLE_PAGES})"));
        }

        let quality_hits: usize = QUALITY_MARKERS
            .iter()
            .map(|marker| marker.find_iter(text).count())
            .sum();
        let has_poor_quality = quality_hits > QUALITY_INDICATOR_THRESHOLD;
        if has_poor_quality {
            reasons.push(format!("{quality_hits} quality indicators found"));
        }

        let has_handwritten = HANDWRITTEN_MARKERS.iter().any(|marker| marker.is_match(text));
        if has_handwritten {
            reasons.push("handwritten content markers found".to_string());
        }

        let level = if reasons.is_empty() {
            ComplexityLevel::Standard
        } else {
            ComplexityLevel::Complex
        };

        ComplexityAssessment {
            level,
            reasons,
            estimated_borrowers,
            has_handwritten,
            has_poor_quality,
            page_count,
        }
    }
}

impl Default for ComplexityClassifier {
    fn default() -> Self {
        Self::new()
    }
}
