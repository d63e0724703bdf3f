use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use lawhelp_core::completion::{ChatMessage, CompletionBackend, CompletionRequest};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Calls a locally-hosted Ollama model via its native chat API.
///
/// Useful when questions and uploaded documents must not leave the local
/// machine. Each call carries the full conversation; the server keeps no
/// state between calls.
pub struct OllamaBackend {
    pub base_url: String,
    pub model: String,
    pub timeout_secs: u64,
}

impl OllamaBackend {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            model: model.into(),
            timeout_secs: 300,
        }
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    fn chat_request(&self, request: &CompletionRequest) -> OllamaChatRequest {
        OllamaChatRequest {
            model: self.model.clone(),
            messages: request.messages.iter().map(OllamaMessage::from).collect(),
            stream: false,
            options: OllamaOptions {
                temperature: request.temperature,
            },
        }
    }
}

#[derive(Serialize)]
struct OllamaMessage {
    role: &'static str,
    content: String,
}

impl From<&ChatMessage> for OllamaMessage {
    fn from(m: &ChatMessage) -> Self {
        Self {
            role: m.role.as_str(),
            content: m.text.clone(),
        }
    }
}

#[derive(Serialize)]
struct OllamaOptions {
    temperature: f32,
}

#[derive(Serialize)]
struct OllamaChatRequest {
    model: String,
    messages: Vec<OllamaMessage>,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Deserialize)]
struct OllamaChatResponse {
    message: OllamaResponseMessage,
}

#[derive(Deserialize)]
struct OllamaResponseMessage {
    content: String,
}

#[async_trait]
impl CompletionBackend for OllamaBackend {
    async fn complete(&self, request: CompletionRequest) -> Result<String> {
        let request_body = self.chat_request(&request);

        info!(
            model = %self.model,
            base_url = %self.base_url,
            turns = request.messages.len(),
            temperature = request.temperature,
            "calling ollama chat API"
        );

        let url = format!("{}/api/chat", self.base_url.trim_end_matches('/'));

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(self.timeout_secs))
            .build()?;

        let response = match client.post(&url).json(&request_body).send().await {
            Ok(r) => r,
            Err(e) if e.is_timeout() => {
                warn!(timeout_secs = self.timeout_secs, "ollama request timed out");
                bail!("Ollama request timed out after {}s", self.timeout_secs);
            },
            Err(e) => {
                warn!("ollama request failed: {}", e);
                bail!("Ollama request failed: {}", e);
            },
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = %status, "ollama returned non-200: {}", body);
            bail!("Ollama error {}: {}", status, body);
        }

        let parsed: OllamaChatResponse = response
            .json()
            .await
            .context("failed to parse Ollama response")?;

        let output = parsed.message.content;
        info!(output_len = output.len(), "ollama response received");
        Ok(output)
    }

    fn name(&self) -> &str {
        "ollama"
    }
}
