//! Qualification rules applied to consolidated staging records.
//!
//! `evaluate` is pure: the same record and filters always give the same verdict.

use serde::Serialize;

use crate::models::{QualificationFilters, StagingRecord};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FilterVerdict {
    pub passes: bool,
    /// Every failing criterion joined with `; `, or `passed`.
    pub reason: String,
}

/// Checks a record against the run's qualification filters (AND semantics).
///
/// Numeric thresholds apply only when set above zero; a record missing the
/// metric fails that threshold.
pub fn evaluate(record: &StagingRecord, filters: &QualificationFilters) -> FilterVerdict {
    let mut failures: Vec<String> = Vec::new();

    if let Some(min_rating) = filters.min_rating.filter(|r| *r > 0.0) {
        match record.payload.rating() {
            Some(rating) if rating >= min_rating => {}
            Some(rating) => failures.push(format!("rating {} < {}", rating, fmt_rating(min_rating))),
            None => failures.push(format!("rating missing (min {})", fmt_rating(min_rating))),
        }
    }

    if let Some(min_reviews) = filters.min_reviews.filter(|r| *r > 0) {
        match record.payload.review_count() {
            Some(reviews) if reviews >= min_reviews => {}
            Some(reviews) => failures.push(format!("reviews {} < {}", reviews, min_reviews)),
            None => failures.push(format!("reviews missing (min {})", min_reviews)),
        }
    }

    if filters.require_email && !has_value(&record.contacts.email) {
        failures.push("missing email".to_string());
    }
    if filters.require_phone && !has_value(&record.contacts.phone) {
        failures.push("missing phone".to_string());
    }
    if filters.require_website && !has_value(&record.contacts.website) {
        failures.push("missing website".to_string());
    }

    if failures.is_empty() {
        FilterVerdict {
            passes: true,
            reason: "passed".to_string(),
        }
    } else {
        FilterVerdict {
            passes: false,
            reason: failures.join("; "),
        }
    }
}

fn has_value(field: &Option<crate::models::SourcedValue>) -> bool {
    field
        .as_ref()
        .map(|v| !v.value.trim().is_empty())
        .unwrap_or(false)
}

/// `4` renders as `4.0` so reasons read like the configured threshold.
fn fmt_rating(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{:.1}", value)
    } else {
        value.to_string()
    }
}
