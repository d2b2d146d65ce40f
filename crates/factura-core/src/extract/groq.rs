//! Groq extraction backend (OpenAI-compatible chat completions). Vision
//! models on Groq only accept images.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::models::{ExtractionJob, FileType};

use super::prompt::{build_prompt, parse_response, RawExtraction};
use super::ExtractionProvider;

const API_URL: &str = "https://api.groq.com/openai/v1/chat/completions";
const MAX_TOKENS: u32 = 4096;

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<Message>,
}

#[derive(Serialize)]
struct Message {
    role: &'static str,
    content: Vec<ContentPart>,
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart {
    Text {
        text: String,
    },
    ImageUrl {
        image_url: ImageUrl,
    },
}

#[derive(Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

pub struct GroqProvider {
    client: reqwest::Client,
    api_key: String,
    model: String,
}

impl GroqProvider {
    pub fn new(api_key: String, model: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            model,
        }
    }
}

#[async_trait]
impl ExtractionProvider for GroqProvider {
    fn name(&self) -> &'static str {
        "groq"
    }

    fn supports(&self, file_type: FileType) -> bool {
        file_type == FileType::Image
    }

    async fn extract(&self, job: &ExtractionJob) -> Result<RawExtraction> {
        if job.file_type != FileType::Image {
            anyhow::bail!("groq backend only accepts image documents");
        }

        let request = ChatRequest {
            model: self.model.clone(),
            max_tokens: MAX_TOKENS,
            messages: vec![Message {
                role: "user",
                content: vec![
                    ContentPart::Text {
                        text: build_prompt(job.file_type),
                    },
                    ContentPart::ImageUrl {
                        image_url: ImageUrl {
                            url: format!(
                                "data:{};base64,{}",
                                job.file_type.mime(),
                                super::encode_document(job).await?
                            ),
                        },
                    },
                ],
            }],
        };

        let response = self
            .client
            .post(API_URL)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .context("groq request failed")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("groq returned {status}: {body}");
        }

        let body: ChatResponse = response
            .json()
            .await
            .context("groq response is not valid JSON")?;
        let text = body
            .choices
            .first()
            .and_then(|choice| choice.message.content.as_deref())
            .context("groq response has no completion text")?;

        parse_response(text)
    }
}
