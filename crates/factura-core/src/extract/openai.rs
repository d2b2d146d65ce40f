//! OpenAI extraction backend, via the official client. Vision chat only
//! accepts images, so PDF jobs are routed elsewhere.

use anyhow::{Context, Result};
use async_openai::config::OpenAIConfig;
use async_openai::types::{
    ChatCompletionRequestMessageContentPartImageArgs,
    ChatCompletionRequestMessageContentPartTextArgs, ChatCompletionRequestUserMessageArgs,
    ChatCompletionRequestUserMessageContentPart, CreateChatCompletionRequestArgs, ImageUrlArgs,
};
use async_openai::Client;
use async_trait::async_trait;

use crate::models::{ExtractionJob, FileType};

use super::prompt::{build_prompt, parse_response, RawExtraction};
use super::ExtractionProvider;

const MAX_TOKENS: u32 = 4096;

pub struct OpenAiProvider {
    client: Client<OpenAIConfig>,
    model: String,
}

impl OpenAiProvider {
    pub fn new(api_key: String, model: String) -> Self {
        Self {
            client: Client::with_config(OpenAIConfig::new().with_api_key(api_key)),
            model,
        }
    }
}

#[async_trait]
impl ExtractionProvider for OpenAiProvider {
    fn name(&self) -> &'static str {
        "openai"
    }

    fn supports(&self, file_type: FileType) -> bool {
        file_type == FileType::Image
    }

    async fn extract(&self, job: &ExtractionJob) -> Result<RawExtraction> {
        if job.file_type != FileType::Image {
            anyhow::bail!("openai backend only accepts image documents");
        }

        let data_url = format!(
            "data:{};base64,{}",
            job.file_type.mime(),
            super::encode_document(job).await?
        );

        let parts: Vec<ChatCompletionRequestUserMessageContentPart> = vec![
            ChatCompletionRequestMessageContentPartTextArgs::default()
                .text(build_prompt(job.file_type))
                .build()?
                .into(),
            ChatCompletionRequestMessageContentPartImageArgs::default()
                .image_url(ImageUrlArgs::default().url(data_url).build()?)
                .build()?
                .into(),
        ];

        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .max_tokens(MAX_TOKENS)
            .messages(vec![ChatCompletionRequestUserMessageArgs::default()
                .content(parts)
                .build()?
                .into()])
            .build()?;

        let response = self
            .client
            .chat()
            .create(request)
            .await
            .context("openai request failed")?;
        let text = response
            .choices
            .first()
            .and_then(|choice| choice.message.content.as_deref())
            .context("openai response has no completion text")?;

        parse_response(text)
    }
}
