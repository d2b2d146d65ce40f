//! Duplicate detection: content fingerprint, similarity scoring, and the
//! shared historical index.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::NaiveDate;
use tokio::sync::RwLock;

use crate::models::{CanonicalExtractionResult, ValidationFlags};

/// Lowercase, strip punctuation, collapse whitespace. Equal inputs after
/// normalization always fingerprint equal.
pub fn normalize_text(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut last_space = true;
    for c in s.chars() {
        if c.is_alphanumeric() {
            out.extend(c.to_lowercase());
            last_space = false;
        } else if !last_space {
            out.push(' ');
            last_space = true;
        }
    }
    out.trim_end().to_string()
}

/// Round currency to 2 decimal places.
pub fn round_amount(amount: f64) -> f64 {
    (amount * 100.0).round() / 100.0
}

/// Fingerprint of the normalized invoice identity fields. `None` unless all
/// four fields are present, matching exact-duplicate semantics.
pub fn dedupe_hash(
    vendor_name: Option<&str>,
    invoice_number: Option<&str>,
    invoice_date: Option<&str>,
    total_amount: Option<f64>,
) -> Option<String> {
    let vendor = vendor_name.map(normalize_text).filter(|s| !s.is_empty())?;
    let number = invoice_number.map(normalize_text).filter(|s| !s.is_empty())?;
    let date = invoice_date.map(normalize_text).filter(|s| !s.is_empty())?;
    let amount = total_amount?;

    let input = format!("{vendor}|{number}|{date}|{:.2}", round_amount(amount));
    Some(blake3::hash(input.as_bytes()).to_hex().to_string())
}

/// Identity fields of one processed invoice, kept in the recent window.
#[derive(Debug, Clone, PartialEq)]
pub struct InvoiceKey {
    pub job_id: String,
    pub vendor: String,
    pub invoice_number: String,
    pub invoice_date: String,
    pub total_amount: f64,
}

impl InvoiceKey {
    /// Build a key from a result; `None` when any identity field is absent.
    pub fn from_result(job_id: &str, result: &CanonicalExtractionResult) -> Option<Self> {
        Some(Self {
            job_id: job_id.to_string(),
            vendor: result
                .vendor_name
                .as_deref()
                .map(normalize_text)
                .filter(|s| !s.is_empty())?,
            invoice_number: result
                .invoice_number
                .as_deref()
                .map(normalize_text)
                .filter(|s| !s.is_empty())?,
            invoice_date: result.invoice_date.clone()?,
            total_amount: round_amount(result.total_amount?),
        })
    }

    /// Exact identity match, used to keep a document from matching itself.
    pub(crate) fn same_identity(&self, other: &Self) -> bool {
        self.vendor == other.vendor
            && self.invoice_number == other.invoice_number
            && self.invoice_date == other.invoice_date
            && (self.total_amount - other.total_amount).abs() < f64::EPSILON
    }
}

fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0usize; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

fn string_ratio(a: &str, b: &str) -> f64 {
    let longest = a.chars().count().max(b.chars().count());
    if longest == 0 {
        return 1.0;
    }
    1.0 - levenshtein(a, b) as f64 / longest as f64
}

fn date_closeness(a: &str, b: &str) -> f64 {
    if a == b {
        return 1.0;
    }
    let parse = |s: &str| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok();
    match (parse(a), parse(b)) {
        (Some(da), Some(db)) if (da - db).num_days().abs() <= 3 => 0.5,
        _ => 0.0,
    }
}

fn amount_closeness(a: f64, b: f64) -> f64 {
    let largest = a.abs().max(b.abs());
    if largest == 0.0 {
        return 1.0;
    }
    (1.0 - (a - b).abs() / largest).max(0.0)
}

/// Weighted similarity over {vendor, amount, date}. Deterministic; exact
/// equality of all three yields 1.0.
pub fn similarity(a: &InvoiceKey, b: &InvoiceKey) -> f64 {
    0.5 * string_ratio(&a.vendor, &b.vendor)
        + 0.3 * amount_closeness(a.total_amount, b.total_amount)
        + 0.2 * date_closeness(&a.invoice_date, &b.invoice_date)
}

/// Read-only view of the historical index at one point in time. Validation
/// consumes a snapshot, which is what keeps it a pure function.
#[derive(Debug, Clone, Default)]
pub struct IndexSnapshot {
    pub hashes: HashSet<String>,
    /// Most recent processed invoices, newest first.
    pub recent: Vec<InvoiceKey>,
}

#[derive(Default)]
struct IndexInner {
    hashes: HashSet<String>,
    recent: Vec<InvoiceKey>,
}

/// Dedupe index over processed documents. Reads are shared; writes are
/// serialized per document through the write lock.
#[derive(Clone)]
pub struct HistoricalIndex {
    inner: Arc<RwLock<IndexInner>>,
    window: usize,
}

impl HistoricalIndex {
    pub fn new(window: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(IndexInner::default())),
            window,
        }
    }

    pub async fn snapshot(&self) -> IndexSnapshot {
        let inner = self.inner.read().await;
        IndexSnapshot {
            hashes: inner.hashes.clone(),
            recent: inner.recent.clone(),
        }
    }

    /// Record a processed document. Exact duplicates are not re-inserted into
    /// the recent window, so re-running a job does not pollute the scan.
    pub async fn insert(
        &self,
        job_id: &str,
        result: &CanonicalExtractionResult,
        flags: &ValidationFlags,
    ) {
        let mut inner = self.inner.write().await;
        if let Some(hash) = &flags.dedupe_hash {
            inner.hashes.insert(hash.clone());
        }
        if flags.is_duplicate {
            return;
        }
        if let Some(key) = InvoiceKey::from_result(job_id, result) {
            inner.recent.insert(0, key);
            inner.recent.truncate(self.window);
        }
    }
}
