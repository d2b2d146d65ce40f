//! Domain types shared across the extraction pipeline.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of document handed to extraction providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    Pdf,
    Image,
}

impl FileType {
    /// MIME type sent to providers alongside the raw bytes.
    pub fn mime(&self) -> &'static str {
        match self {
            FileType::Pdf => "application/pdf",
            FileType::Image => "image/png",
        }
    }
}

impl std::fmt::Display for FileType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FileType::Pdf => write!(f, "pdf"),
            FileType::Image => write!(f, "image"),
        }
    }
}

/// Extraction model requested by the caller.
///
/// `Best` and `Rexcan` are routing policies rather than concrete providers:
/// `Best` picks a fallback chain for the input, `Rexcan` delegates to an
/// implemented provider and says so in the result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ModelChoice {
    Gemini,
    Openai,
    Groq,
    Claude,
    Rexcan,
    #[default]
    Best,
}

impl std::fmt::Display for ModelChoice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ModelChoice::Gemini => "gemini",
            ModelChoice::Openai => "openai",
            ModelChoice::Groq => "groq",
            ModelChoice::Claude => "claude",
            ModelChoice::Rexcan => "rexcan",
            ModelChoice::Best => "best",
        };
        write!(f, "{name}")
    }
}

/// A unit of extraction work tied to one document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionJob {
    pub document_id: String,
    pub user_id: String,
    pub file_path: PathBuf,
    pub file_type: FileType,
    pub file_name: String,
    #[serde(default)]
    pub selected_model: ModelChoice,
}

/// Deterministic job identity. Re-submitting the same document yields the
/// same id, which is what makes enqueue idempotent.
pub fn job_id(document_id: &str) -> String {
    format!("doc-{document_id}")
}

/// Invoice line item. Absent values stay `None` so downstream validation can
/// tell "zero" from "unknown".
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LineItem {
    pub description: Option<String>,
    pub quantity: Option<f64>,
    pub unit_price: Option<f64>,
    pub amount: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaxInformation {
    pub tax_rate: Option<f64>,
    pub tax_amount: Option<f64>,
}

/// Normalized output of one extraction run. Produced once per job by the
/// router and immutable once validation begins.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalExtractionResult {
    pub invoice_number: Option<String>,
    pub vendor_name: Option<String>,
    /// ISO date (YYYY-MM-DD).
    pub invoice_date: Option<String>,
    pub total_amount: Option<f64>,
    pub amount_subtotal: Option<f64>,
    pub amount_tax: Option<f64>,
    /// ISO-4217 code.
    pub currency: Option<String>,
    pub line_items: Vec<LineItem>,
    pub tax_information: Option<TaxInformation>,
    /// Opaque provider payload, kept for audit/debugging.
    pub raw_extraction: serde_json::Map<String, serde_json::Value>,
    pub field_confidences: BTreeMap<String, f64>,
    pub field_reasons: BTreeMap<String, String>,
    /// Which provider produced each field.
    pub field_sources: BTreeMap<String, String>,
    /// Stage name -> duration in seconds.
    pub timings: BTreeMap<String, f64>,
    pub llm_used: bool,
    pub llm_fields: BTreeSet<String>,
    pub llm_call_reason: Option<String>,
}

/// A prior document similar to this one, above the similarity threshold.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NearDuplicate {
    pub job_id: String,
    pub similarity: f64,
}

/// Flags derived from a [`CanonicalExtractionResult`] plus a snapshot of the
/// historical index. Never raised as failures; recorded alongside the result.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ValidationFlags {
    pub dedupe_hash: Option<String>,
    pub is_duplicate: bool,
    pub is_near_duplicate: bool,
    /// Ordered by descending similarity.
    pub near_duplicates: Vec<NearDuplicate>,
    pub arithmetic_mismatch: bool,
    pub needs_human_review: bool,
    pub missing_invoice_id: bool,
    pub missing_total: bool,
    pub missing_vendor_name: bool,
    pub missing_date: bool,
    pub is_invalid: bool,
}

/// Email attachment as carried on the pub/sub envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailAttachment {
    pub filename: String,
    pub content_type: String,
    pub size: u64,
    /// Base64 payload.
    pub data: String,
}

/// Inbound email with invoice attachments. Transient: consumed into
/// zero-or-more extraction jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailInvoiceMessage {
    pub email_id: String,
    pub message_id: String,
    pub from: String,
    pub subject: String,
    pub received_at: DateTime<Utc>,
    pub attachments: Vec<EmailAttachment>,
    #[serde(default)]
    pub user_id: Option<String>,
}

/// Document status as written back to the external store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Uploaded,
    Queued,
    Processing,
    Processed,
    Failed,
}

impl std::fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DocumentStatus::Uploaded => "uploaded",
            DocumentStatus::Queued => "queued",
            DocumentStatus::Processing => "processing",
            DocumentStatus::Processed => "processed",
            DocumentStatus::Failed => "failed",
        };
        write!(f, "{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_id_is_deterministic() {
        assert_eq!(job_id("A1"), "doc-A1");
        assert_eq!(job_id("A1"), job_id("A1"));
        assert_ne!(job_id("A1"), job_id("A2"));
    }

    #[test]
    fn job_payload_uses_camel_case_wire_keys() {
        let job = ExtractionJob {
            document_id: "d-1".into(),
            user_id: "u-1".into(),
            file_path: PathBuf::from("/tmp/inv.pdf"),
            file_type: FileType::Pdf,
            file_name: "inv.pdf".into(),
            selected_model: ModelChoice::Gemini,
        };

        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["documentId"], "d-1");
        assert_eq!(value["fileType"], "pdf");
        assert_eq!(value["selectedModel"], "gemini");
    }

    #[test]
    fn selected_model_defaults_to_best() {
        let json = r#"{
            "documentId": "d-2",
            "userId": "u-1",
            "filePath": "/tmp/inv.png",
            "fileType": "image",
            "fileName": "inv.png"
        }"#;
        let job: ExtractionJob = serde_json::from_str(json).unwrap();
        assert_eq!(job.selected_model, ModelChoice::Best);
    }
}
