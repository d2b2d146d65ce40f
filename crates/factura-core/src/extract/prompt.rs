//! Shared extraction prompt and response parsing.
//!
//! Every provider sends the same field instructions and is asked for strict
//! JSON; the parser tolerates code fences and leading prose around the JSON
//! object.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::models::{FileType, LineItem};

/// Build the invoice-extraction prompt for one document.
pub fn build_prompt(file_type: FileType) -> String {
    format!(
        r#"Extract invoice fields from the attached {file_type} document. Focus on accuracy.

Instructions:
- invoice_id: Look for 'Invoice no:', 'Invoice number', 'Invoice #' followed by a number (often 7-12 digits). Can be pure numeric like '40378170' or alphanumeric like 'INV-123'.
- total_amount: Look for 'Total', 'Amount Due', 'Grand Total' followed by a currency symbol and number, usually in the bottom area. Ignore small numbers that might be invoice IDs.
- amount_subtotal: The pre-tax subtotal, usually above the tax line.
- amount_tax: Look for 'Tax', 'Tax (X%)', 'Sales Tax', 'GST', 'VAT' followed by a currency amount, usually between Subtotal and Total. Extract only the numeric amount (from 'Tax (13%): $456.30' extract 456.30).
- invoice_date: Convert to YYYY-MM-DD format.
- vendor_name: Extract the company name, usually top-left. Not addresses or contact info.
- line_items: One entry per billed row with description, quantity, unit_price and amount where visible.

Return only valid JSON matching this schema:
{{
  "invoice_id": "string or null",
  "vendor_name": "string or null",
  "invoice_date": "YYYY-MM-DD or null",
  "total_amount": float or null,
  "amount_subtotal": float or null,
  "amount_tax": float or null,
  "tax_rate": float or null,
  "currency": "ISO4217 code or null",
  "line_items": [{{ "description": "string", "quantity": float, "unit_price": float, "amount": float }}],
  "confidences": {{ "field_name": 0.0-1.0 }},
  "reasons": {{ "field_name": "1-line reason" }}
}}

Use null for any field you cannot read. Do not output any explanation, only JSON."#
    )
}

#[derive(Debug, Clone, Default, Deserialize)]
struct WireLineItem {
    description: Option<String>,
    quantity: Option<f64>,
    unit_price: Option<f64>,
    amount: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct WireExtraction {
    invoice_id: Option<String>,
    vendor_name: Option<String>,
    invoice_date: Option<String>,
    total_amount: Option<f64>,
    amount_subtotal: Option<f64>,
    amount_tax: Option<f64>,
    tax_rate: Option<f64>,
    currency: Option<String>,
    #[serde(default)]
    line_items: Vec<WireLineItem>,
    #[serde(default)]
    confidences: BTreeMap<String, f64>,
    #[serde(default)]
    reasons: BTreeMap<String, String>,
}

/// Raw extraction payload as returned by one provider, before the router
/// normalizes it. Absent fields stay unset, never defaulted to zero.
#[derive(Debug, Clone, Default)]
pub struct RawExtraction {
    pub invoice_id: Option<String>,
    pub vendor_name: Option<String>,
    pub invoice_date: Option<String>,
    pub total_amount: Option<f64>,
    pub amount_subtotal: Option<f64>,
    pub amount_tax: Option<f64>,
    pub tax_rate: Option<f64>,
    pub currency: Option<String>,
    pub line_items: Vec<LineItem>,
    pub confidences: BTreeMap<String, f64>,
    pub reasons: BTreeMap<String, String>,
    /// Full provider response object, kept opaque for audit.
    pub raw: serde_json::Map<String, serde_json::Value>,
}

/// Parse a provider completion into a [`RawExtraction`].
pub fn parse_response(text: &str) -> Result<RawExtraction> {
    let json = extract_json_object(text)
        .context("provider response contains no JSON object")?;

    let raw: serde_json::Map<String, serde_json::Value> =
        serde_json::from_str(json).context("provider response is not a JSON object")?;
    let wire: WireExtraction = serde_json::from_value(serde_json::Value::Object(raw.clone()))
        .context("provider response does not match the extraction schema")?;

    Ok(RawExtraction {
        invoice_id: non_blank(wire.invoice_id),
        vendor_name: non_blank(wire.vendor_name),
        invoice_date: non_blank(wire.invoice_date),
        total_amount: wire.total_amount,
        amount_subtotal: wire.amount_subtotal,
        amount_tax: wire.amount_tax,
        tax_rate: wire.tax_rate,
        currency: non_blank(wire.currency),
        line_items: wire
            .line_items
            .into_iter()
            .map(|item| LineItem {
                description: non_blank(item.description),
                quantity: item.quantity,
                unit_price: item.unit_price,
                amount: item.amount,
            })
            .collect(),
        confidences: wire.confidences,
        reasons: wire.reasons,
        raw,
    })
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

/// Slice out the outermost `{...}`, skipping markdown fences and prose.
fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}
