use async_trait::async_trait;
use log::debug;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use super::{decode_batch, encode_batch, BatchItem, TranslationBackend};
use crate::app_config::ProviderConfig;
use crate::errors::ProviderError;

/// Generate request for the Ollama API
#[derive(Debug, Serialize)]
struct GenerationRequest<'a> {
    /// Model name to use for generation
    model: &'a str,
    /// Prompt to generate from
    prompt: String,
    /// System message to guide the model
    system: String,
    /// Additional model parameters
    options: GenerationOptions,
    /// Whether to stream the response
    stream: bool,
}

/// Generation options for the Ollama API
#[derive(Debug, Serialize)]
struct GenerationOptions {
    /// Temperature for generation
    temperature: f32,
}

/// Generation response from the Ollama API
#[derive(Debug, Deserialize)]
struct GenerationResponse {
    /// Generated text
    response: String,
}

/// Backend talking to a local Ollama server
#[derive(Debug)]
pub struct OllamaBackend {
    client: Client,
    base_url: String,
    model: String,
    system_prompt: String,
    temperature: f32,
}

impl OllamaBackend {
    /// Create a backend from configuration
    pub fn new(config: &ProviderConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            // Ollama speaks HTTP/1.1
            .http1_only()
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .unwrap_or_default();

        Self {
            client,
            base_url: config.endpoint.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            system_prompt: config.system_prompt.clone(),
            temperature: config.temperature,
        }
    }

    fn system_prompt(&self, source_language: &str, target_language: &str) -> String {
        self.system_prompt
            .replace("{source_language}", source_language)
            .replace("{target_language}", target_language)
    }

    async fn generate(&self, prompt: String, system: String) -> Result<String, ProviderError> {
        let request = GenerationRequest {
            model: &self.model,
            prompt,
            system,
            options: GenerationOptions { temperature: self.temperature },
            stream: false,
        };

        let response = self
            .client
            .post(format!("{}/api/generate", self.base_url))
            .json(&request)
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(map_status(status, body));
        }

        let parsed: GenerationResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::ParseError(e.to_string()))?;

        let text = parsed.response.trim().to_string();
        if text.is_empty() {
            return Err(ProviderError::EmptyResponse);
        }
        Ok(text)
    }
}

/// Build the prompt for a single line with its surrounding context
fn line_prompt(text: &str, context_before: &[String], context_after: &[String]) -> String {
    if context_before.is_empty() && context_after.is_empty() {
        return text.to_string();
    }

    let mut prompt = String::new();
    if !context_before.is_empty() {
        prompt.push_str("[Previous lines, do not translate]\n");
        prompt.push_str(&context_before.join("\n"));
        prompt.push_str("\n\n");
    }
    prompt.push_str("[Translate this line]\n");
    prompt.push_str(text);
    if !context_after.is_empty() {
        prompt.push_str("\n\n[Following lines, do not translate]\n");
        prompt.push_str(&context_after.join("\n"));
    }
    prompt
}

fn map_transport_error(e: reqwest::Error) -> ProviderError {
    if e.is_timeout() || e.is_connect() {
        ProviderError::ConnectionError(e.to_string())
    } else {
        ProviderError::RequestFailed(e.to_string())
    }
}

fn map_status(status: StatusCode, body: String) -> ProviderError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => ProviderError::RateLimitExceeded(body),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ProviderError::AuthenticationError(body),
        StatusCode::PAYMENT_REQUIRED => ProviderError::PaymentRequired(body),
        _ => ProviderError::ApiError {
            status_code: status.as_u16(),
            message: body,
        },
    }
}

#[async_trait]
impl TranslationBackend for OllamaBackend {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn translate(
        &self,
        text: &str,
        source_language: &str,
        target_language: &str,
        context_before: &[String],
        context_after: &[String],
    ) -> Result<String, ProviderError> {
        self.generate(
            line_prompt(text, context_before, context_after),
            self.system_prompt(source_language, target_language),
        )
        .await
    }

    fn supports_batch(&self) -> bool {
        true
    }

    async fn translate_batch(
        &self,
        items: &[BatchItem],
        source_language: &str,
        target_language: &str,
        pre_context: &[String],
        post_context: &[String],
    ) -> Result<HashMap<usize, String>, ProviderError> {
        let system = format!(
            "{}\nKeep every <<ENTRY_n>> marker exactly as given and end with <<END>>.",
            self.system_prompt(source_language, target_language)
        );

        let response = self
            .generate(encode_batch(items, pre_context, post_context), system)
            .await?;
        let translated = decode_batch(&response, items);

        if translated.len() < items.len() {
            debug!(
                "Ollama answered {} of {} batch entries",
                translated.len(),
                items.len()
            );
        }
        Ok(translated)
    }
}
