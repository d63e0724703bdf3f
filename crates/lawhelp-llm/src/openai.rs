use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use lawhelp_core::completion::{ChatMessage, CompletionBackend, CompletionRequest};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Calls an OpenAI-compatible Chat Completions endpoint.
pub struct OpenAiBackend {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl OpenAiBackend {
    pub fn new(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        model: impl Into<String>,
        timeout_secs: u64,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .context("failed to build OpenAI HTTP client")?;
        Ok(Self {
            client,
            api_key: api_key.into(),
            base_url: base_url.into(),
            model: model.into(),
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    fn chat_request(&self, request: &CompletionRequest) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: self.model.clone(),
            messages: request.messages.iter().map(WireMessage::from).collect(),
            temperature: request.temperature,
        }
    }
}

#[derive(Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<WireMessage>,
    temperature: f32,
}

#[derive(Serialize)]
struct WireMessage {
    role: &'static str,
    content: String,
}

impl From<&ChatMessage> for WireMessage {
    fn from(m: &ChatMessage) -> Self {
        Self {
            role: m.role.as_str(),
            content: m.text.clone(),
        }
    }
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

fn extract_text_response(parsed: ChatCompletionResponse) -> Result<String> {
    let content = parsed
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("OpenAI response had no choices"))?
        .message
        .content
        .unwrap_or_default();
    Ok(content.trim().to_string())
}

#[async_trait]
impl CompletionBackend for OpenAiBackend {
    async fn complete(&self, request: CompletionRequest) -> Result<String> {
        let body = self.chat_request(&request);

        info!(
            model = %self.model,
            turns = request.messages.len(),
            temperature = request.temperature,
            "calling openai chat completions"
        );

        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                warn!(timeout = e.is_timeout(), "openai request failed: {}", e);
                anyhow!("OpenAI API request failed: {e}")
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = %status, "openai returned non-200: {}", body);
            bail!("OpenAI error {}: {}", status, body);
        }

        let parsed: ChatCompletionResponse = response
            .json()
            .await
            .context("failed to parse OpenAI response")?;
        let output = extract_text_response(parsed)?;
        info!(output_len = output.len(), "openai response received");
        Ok(output)
    }

    fn name(&self) -> &str {
        "openai"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> OpenAiBackend {
        OpenAiBackend::new("sk-test", "https://api.openai.com/v1/", "gpt-4o-mini", 30).unwrap()
    }

    #[test]
    fn endpoint_joins_base_url() {
        assert_eq!(backend().endpoint(), "https://api.openai.com/v1/chat/completions");
    }

    #[test]
    fn request_shape() {
        let req = CompletionRequest::new(
            vec![ChatMessage::system("classify"), ChatMessage::assistant("ok")],
            0.0,
        );
        let json = serde_json::to_value(backend().chat_request(&req)).unwrap();
        assert_eq!(json["model"], "gpt-4o-mini");
        assert_eq!(json["temperature"], 0.0);
        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["messages"][1]["role"], "assistant");
        assert_eq!(json["messages"][1]["content"], "ok");
    }

    #[test]
    fn first_choice_is_trimmed() {
        let parsed: ChatCompletionResponse = serde_json::from_str(
            r#"{"id":"x","choices":[{"index":0,"message":{"role":"assistant","content":"  USA\n"}}]}"#,
        )
        .unwrap();
        assert_eq!(extract_text_response(parsed).unwrap(), "USA");
    }

    #[test]
    fn empty_choices_is_error_and_null_content_is_empty() {
        let none: ChatCompletionResponse = serde_json::from_str(r#"{"choices":[]}"#).unwrap();
        assert!(extract_text_response(none).is_err());

        let null: ChatCompletionResponse =
            serde_json::from_str(r#"{"choices":[{"message":{"content":null}}]}"#).unwrap();
        assert_eq!(extract_text_response(null).unwrap(), "");
    }
}
