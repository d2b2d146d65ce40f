//! Post-extraction validation.
//!
//! Pure function of a canonical result plus a historical-index snapshot:
//! fingerprint, duplicate/near-duplicate flags, arithmetic consistency,
//! required fields, and the derived review decision. Anomalies become flags,
//! never errors.

pub mod dedupe;

pub use dedupe::{HistoricalIndex, IndexSnapshot};

use chrono::NaiveDate;

use crate::config::Settings;
use crate::models::{CanonicalExtractionResult, NearDuplicate, ValidationFlags};

use dedupe::InvoiceKey;

/// Validation tunables.
#[derive(Debug, Clone)]
pub struct ValidationConfig {
    /// Near-duplicate similarity threshold.
    pub similarity_threshold: f64,
    /// Field confidence below this requests human review.
    pub confidence_threshold: f64,
    /// Rounding slack for the subtotal + tax check, in currency units.
    pub arithmetic_epsilon: f64,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.85,
            confidence_threshold: 0.85,
            arithmetic_epsilon: 0.01,
        }
    }
}

impl ValidationConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            similarity_threshold: settings.similarity_threshold,
            confidence_threshold: settings.confidence_threshold,
            arithmetic_epsilon: 0.01,
        }
    }
}

fn is_blank(value: Option<&str>) -> bool {
    value.map_or(true, |s| s.trim().is_empty())
}

/// Invoice id format: 3-50 chars, alphanumeric with common separators.
pub fn well_formed_invoice_id(id: &str) -> bool {
    let id = id.trim();
    (3..=50).contains(&id.len())
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '/' | '_' | ' '))
}

/// Strict ISO date (YYYY-MM-DD).
pub fn well_formed_date(date: &str) -> bool {
    NaiveDate::parse_from_str(date, "%Y-%m-%d").is_ok()
}

/// Non-negative and below the sanity ceiling.
pub fn sane_amount(amount: f64) -> bool {
    amount.is_finite() && amount >= 0.0 && amount < 1e10
}

/// ISO-4217 shape: three ASCII letters.
pub fn well_formed_currency(currency: &str) -> bool {
    currency.len() == 3 && currency.chars().all(|c| c.is_ascii_alphabetic())
}

/// Present fields that fail their format check. These do not count as
/// missing, but they do force human review.
fn malformed_fields(result: &CanonicalExtractionResult) -> Vec<&'static str> {
    let mut malformed = Vec::new();
    if let Some(id) = &result.invoice_number {
        if !id.trim().is_empty() && !well_formed_invoice_id(id) {
            malformed.push("invoiceNumber");
        }
    }
    if let Some(date) = &result.invoice_date {
        if !date.trim().is_empty() && !well_formed_date(date) {
            malformed.push("invoiceDate");
        }
    }
    if let Some(amount) = result.total_amount {
        if !sane_amount(amount) {
            malformed.push("totalAmount");
        }
    }
    if let Some(currency) = &result.currency {
        if !currency.trim().is_empty() && !well_formed_currency(currency) {
            malformed.push("currency");
        }
    }
    malformed
}

/// Validate one extraction result against a snapshot of processed documents.
///
/// Idempotent: re-running against an unchanged snapshot yields identical
/// flags.
pub fn validate(
    result: &CanonicalExtractionResult,
    snapshot: &IndexSnapshot,
    config: &ValidationConfig,
) -> ValidationFlags {
    let mut flags = ValidationFlags::default();

    // 1. Fingerprint over the normalized identity fields.
    flags.dedupe_hash = dedupe::dedupe_hash(
        result.vendor_name.as_deref(),
        result.invoice_number.as_deref(),
        result.invoice_date.as_deref(),
        result.total_amount,
    );

    // 2. Exact duplicate lookup. A hit makes the near-duplicate scan moot.
    if let Some(hash) = &flags.dedupe_hash {
        flags.is_duplicate = snapshot.hashes.contains(hash);
    }

    // 3. Near-duplicate scan over the recent window.
    if !flags.is_duplicate {
        if let Some(key) = InvoiceKey::from_result("", result) {
            let mut matches: Vec<NearDuplicate> = snapshot
                .recent
                .iter()
                .filter(|candidate| !candidate.same_identity(&key))
                .filter_map(|candidate| {
                    let similarity = dedupe::similarity(&key, candidate);
                    (similarity >= config.similarity_threshold).then(|| NearDuplicate {
                        job_id: candidate.job_id.clone(),
                        similarity,
                    })
                })
                .collect();
            matches.sort_by(|a, b| {
                b.similarity
                    .partial_cmp(&a.similarity)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            flags.is_near_duplicate = !matches.is_empty();
            flags.near_duplicates = matches;
        }
    }

    // 4. Arithmetic consistency, only when both components are present.
    if let (Some(subtotal), Some(tax), Some(total)) = (
        result.amount_subtotal,
        result.amount_tax,
        result.total_amount,
    ) {
        flags.arithmetic_mismatch = (subtotal + tax - total).abs() > config.arithmetic_epsilon;
    }

    // 5. Required fields.
    flags.missing_invoice_id = is_blank(result.invoice_number.as_deref());
    flags.missing_total = result.total_amount.is_none();
    flags.missing_vendor_name = is_blank(result.vendor_name.as_deref());
    flags.missing_date = is_blank(result.invoice_date.as_deref());
    flags.is_invalid = flags.missing_invoice_id
        || flags.missing_total
        || flags.missing_vendor_name
        || flags.missing_date;

    // 6. Review decision.
    let low_confidence = result
        .field_confidences
        .values()
        .any(|c| *c < config.confidence_threshold);
    flags.needs_human_review = flags.is_duplicate
        || flags.is_near_duplicate
        || flags.arithmetic_mismatch
        || flags.is_invalid
        || low_confidence
        || !malformed_fields(result).is_empty();

    flags
}
