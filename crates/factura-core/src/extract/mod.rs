//! Multi-provider invoice extraction.
//!
//! Each provider implements [`ExtractionProvider`] over the same prompt and
//! JSON response contract; the [`router`] picks a provider chain per job and
//! normalizes whichever raw payload succeeds first into a
//! [`CanonicalExtractionResult`](crate::models::CanonicalExtractionResult).

pub mod claude;
pub mod gemini;
pub mod groq;
pub mod openai;
pub mod prompt;
pub mod router;

pub use prompt::RawExtraction;
pub use router::ExtractionRouter;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::ExtractionJob;

/// One extraction backend. Implementations read the document bytes from the
/// job's file path and return the parsed raw payload.
#[async_trait]
pub trait ExtractionProvider: Send + Sync {
    /// Stable provider name, recorded as the field source.
    fn name(&self) -> &'static str;

    /// Whether this backend accepts the given document kind.
    fn supports(&self, file_type: crate::models::FileType) -> bool;

    async fn extract(&self, job: &ExtractionJob) -> Result<RawExtraction>;
}

/// Map a provider response key onto the canonical camelCase field name.
pub(crate) fn canonical_field_name(key: &str) -> String {
    match key {
        "invoice_id" => "invoiceNumber".to_string(),
        "vendor_name" => "vendorName".to_string(),
        "invoice_date" => "invoiceDate".to_string(),
        "total_amount" => "totalAmount".to_string(),
        "amount_subtotal" => "amountSubtotal".to_string(),
        "amount_tax" => "amountTax".to_string(),
        "tax_rate" => "taxRate".to_string(),
        "line_items" => "lineItems".to_string(),
        other => other.to_string(),
    }
}

/// Read and base64-encode the document bytes behind a job.
pub(crate) async fn encode_document(job: &ExtractionJob) -> Result<String> {
    use anyhow::Context as _;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine as _;

    let bytes = tokio::fs::read(&job.file_path)
        .await
        .with_context(|| format!("failed to read document {}", job.file_path.display()))?;
    Ok(BASE64.encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_names_map_to_wire_casing() {
        assert_eq!(canonical_field_name("invoice_id"), "invoiceNumber");
        assert_eq!(canonical_field_name("total_amount"), "totalAmount");
        assert_eq!(canonical_field_name("currency"), "currency");
    }
}
