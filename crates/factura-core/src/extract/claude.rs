//! Claude extraction backend (Messages API).

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde::{Deserialize, Serialize};

use crate::models::{ExtractionJob, FileType};

use super::prompt::{build_prompt, parse_response, RawExtraction};
use super::ExtractionProvider;

const API_URL: &str = "https://api.anthropic.com/v1/messages";
const API_VERSION: &str = "2023-06-01";
const MAX_TOKENS: u32 = 4096;

#[derive(Serialize)]
struct MessagesRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<Message>,
}

#[derive(Serialize)]
struct Message {
    role: &'static str,
    content: Vec<ContentBlock>,
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ContentBlock {
    Document { source: MediaSource },
    Image { source: MediaSource },
    Text { text: String },
}

#[derive(Serialize)]
struct MediaSource {
    #[serde(rename = "type")]
    source_type: &'static str,
    media_type: String,
    data: String,
}

#[derive(Deserialize)]
struct MessagesResponse {
    content: Vec<ResponseBlock>,
}

#[derive(Deserialize)]
struct ResponseBlock {
    text: Option<String>,
}

pub struct ClaudeProvider {
    client: reqwest::Client,
    api_key: String,
    model: String,
}

impl ClaudeProvider {
    pub fn new(api_key: String, model: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            model,
        }
    }

    fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-api-key",
            HeaderValue::from_str(&self.api_key).context("invalid claude api key")?,
        );
        headers.insert("anthropic-version", HeaderValue::from_static(API_VERSION));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(headers)
    }
}

#[async_trait]
impl ExtractionProvider for ClaudeProvider {
    fn name(&self) -> &'static str {
        "claude"
    }

    fn supports(&self, _file_type: FileType) -> bool {
        true
    }

    async fn extract(&self, job: &ExtractionJob) -> Result<RawExtraction> {
        let source = MediaSource {
            source_type: "base64",
            media_type: job.file_type.mime().to_string(),
            data: super::encode_document(job).await?,
        };
        let attachment = match job.file_type {
            FileType::Pdf => ContentBlock::Document { source },
            FileType::Image => ContentBlock::Image { source },
        };

        let request = MessagesRequest {
            model: self.model.clone(),
            max_tokens: MAX_TOKENS,
            messages: vec![Message {
                role: "user",
                content: vec![
                    attachment,
                    ContentBlock::Text {
                        text: build_prompt(job.file_type),
                    },
                ],
            }],
        };

        let response = self
            .client
            .post(API_URL)
            .headers(self.headers()?)
            .json(&request)
            .send()
            .await
            .context("claude request failed")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("claude returned {status}: {body}");
        }

        let body: MessagesResponse = response
            .json()
            .await
            .context("claude response is not valid JSON")?;
        let text = body
            .content
            .iter()
            .find_map(|block| block.text.as_deref())
            .context("claude response has no text block")?;

        parse_response(text)
    }
}
