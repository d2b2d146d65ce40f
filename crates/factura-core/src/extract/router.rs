//! Provider routing, fallback, and result normalization.
//!
//! The router owns the registered backends, resolves a model choice into an
//! ordered provider chain for the document kind, and tries the chain until one
//! backend returns a parseable payload. Exactly one canonical result is
//! produced per job.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::config::{provider_api_key, Settings};
use crate::error::PipelineError;
use crate::models::{
    CanonicalExtractionResult, ExtractionJob, FileType, ModelChoice, TaxInformation,
};

use super::claude::ClaudeProvider;
use super::gemini::GeminiProvider;
use super::groq::GroqProvider;
use super::openai::OpenAiProvider;
use super::prompt::RawExtraction;
use super::{canonical_field_name, ExtractionProvider};

const REXCAN_REASON: &str = "rexcan is not self-hosted; delegated to the hosted vision chain";

/// Routes jobs to extraction backends with per-call timeouts and fallback.
pub struct ExtractionRouter {
    providers: BTreeMap<&'static str, Arc<dyn ExtractionProvider>>,
    call_timeout: Duration,
}

impl ExtractionRouter {
    pub fn new(providers: Vec<Arc<dyn ExtractionProvider>>, call_timeout: Duration) -> Self {
        Self {
            providers: providers.into_iter().map(|p| (p.name(), p)).collect(),
            call_timeout,
        }
    }

    /// Build the router from settings, registering every provider with an API
    /// key in the environment.
    pub fn from_settings(settings: &Settings) -> Self {
        let mut providers: Vec<Arc<dyn ExtractionProvider>> = Vec::new();
        if let Some(key) = provider_api_key("gemini") {
            providers.push(Arc::new(GeminiProvider::new(
                key,
                settings.gemini_model.clone(),
            )));
        }
        if let Some(key) = provider_api_key("openai") {
            providers.push(Arc::new(OpenAiProvider::new(
                key,
                settings.openai_model.clone(),
            )));
        }
        if let Some(key) = provider_api_key("groq") {
            providers.push(Arc::new(GroqProvider::new(key, settings.groq_model.clone())));
        }
        if let Some(key) = provider_api_key("claude") {
            providers.push(Arc::new(ClaudeProvider::new(
                key,
                settings.claude_model.clone(),
            )));
        }
        if providers.is_empty() {
            tracing::warn!("No provider API keys configured, extraction jobs will fail");
        }
        Self::new(providers, settings.provider_timeout())
    }

    /// Resolve a model choice into an ordered provider chain, plus the reason
    /// recorded when the choice is a delegating shim.
    pub fn chain_for(
        choice: ModelChoice,
        file_type: FileType,
    ) -> (Vec<&'static str>, Option<String>) {
        match choice {
            ModelChoice::Gemini => (vec!["gemini"], None),
            ModelChoice::Openai => (vec!["openai"], None),
            ModelChoice::Groq => (vec!["groq"], None),
            ModelChoice::Claude => (vec!["claude"], None),
            ModelChoice::Best => (Self::best_chain(file_type), None),
            ModelChoice::Rexcan => (
                Self::best_chain(file_type),
                Some(REXCAN_REASON.to_string()),
            ),
        }
    }

    // PDFs can only go to backends that ingest documents natively.
    fn best_chain(file_type: FileType) -> Vec<&'static str> {
        match file_type {
            FileType::Pdf => vec!["gemini", "claude"],
            FileType::Image => vec!["gemini", "openai", "groq", "claude"],
        }
    }

    /// Run the chain for one job. The first parseable payload wins; transient
    /// provider failures fall through to the next backend.
    pub async fn extract(
        &self,
        job: &ExtractionJob,
    ) -> Result<CanonicalExtractionResult, PipelineError> {
        let (chain, call_reason) = Self::chain_for(job.selected_model, job.file_type);

        let candidates: Vec<&Arc<dyn ExtractionProvider>> = chain
            .iter()
            .filter_map(|name| self.providers.get(name))
            .filter(|p| p.supports(job.file_type))
            .collect();
        if candidates.is_empty() {
            return Err(PipelineError::InvalidJob(format!(
                "no available provider accepts a {} document for model {}",
                job.file_type, job.selected_model
            )));
        }

        let mut last_error = String::new();
        let mut last_provider = "";
        for provider in candidates {
            let name = provider.name();
            let started = Instant::now();
            let attempt = tokio::time::timeout(self.call_timeout, provider.extract(job)).await;
            let elapsed = started.elapsed().as_secs_f64();

            match attempt {
                Ok(Ok(raw)) => {
                    tracing::info!(
                        document_id = %job.document_id,
                        provider = name,
                        elapsed_secs = elapsed,
                        "Extraction succeeded"
                    );
                    return Ok(normalize(raw, name, elapsed, call_reason.clone()));
                }
                Ok(Err(e)) => {
                    last_error = format!("{e:#}");
                    last_provider = name;
                }
                Err(_) => {
                    last_error = format!("timed out after {:?}", self.call_timeout);
                    last_provider = name;
                }
            }
            tracing::warn!(
                document_id = %job.document_id,
                provider = name,
                error = %last_error,
                "Provider attempt failed, trying next in chain"
            );
        }

        Err(PipelineError::ProviderExtraction {
            provider: last_provider.to_string(),
            message: last_error,
        })
    }
}

/// Fold a raw provider payload into the canonical result, attributing every
/// present field to the provider that actually produced it.
fn normalize(
    raw: RawExtraction,
    provider: &str,
    elapsed_secs: f64,
    call_reason: Option<String>,
) -> CanonicalExtractionResult {
    let mut result = CanonicalExtractionResult {
        invoice_number: raw.invoice_id,
        vendor_name: raw.vendor_name,
        invoice_date: raw.invoice_date,
        total_amount: raw.total_amount,
        amount_subtotal: raw.amount_subtotal,
        amount_tax: raw.amount_tax,
        currency: raw.currency,
        line_items: raw.line_items,
        raw_extraction: raw.raw,
        llm_used: true,
        llm_call_reason: call_reason,
        ..Default::default()
    };
    if raw.tax_rate.is_some() || result.amount_tax.is_some() {
        result.tax_information = Some(TaxInformation {
            tax_rate: raw.tax_rate,
            tax_amount: result.amount_tax,
        });
    }

    let present: Vec<&'static str> = [
        ("invoiceNumber", result.invoice_number.is_some()),
        ("vendorName", result.vendor_name.is_some()),
        ("invoiceDate", result.invoice_date.is_some()),
        ("totalAmount", result.total_amount.is_some()),
        ("amountSubtotal", result.amount_subtotal.is_some()),
        ("amountTax", result.amount_tax.is_some()),
        ("currency", result.currency.is_some()),
        ("lineItems", !result.line_items.is_empty()),
    ]
    .into_iter()
    .filter_map(|(name, present)| present.then_some(name))
    .collect();

    for field in present {
        result
            .field_sources
            .insert(field.to_string(), provider.to_string());
        result.llm_fields.insert(field.to_string());
    }
    for (key, confidence) in raw.confidences {
        result
            .field_confidences
            .insert(canonical_field_name(&key), confidence);
    }
    for (key, reason) in raw.reasons {
        result
            .field_reasons
            .insert(canonical_field_name(&key), reason);
    }
    result
        .timings
        .insert(format!("extract:{provider}"), elapsed_secs);

    result
}
