//! OpenAI chat-completions client: a `reqwest::Client` over a configurable
//! `base_url`/`model`.

use async_trait::async_trait;
use polyagent_common::types::MessageRole;
use polyagent_core::router::{ChatMessage, CompletionParams, ProviderClient, ProviderCompletion, ProviderError, SafetyRatings};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

pub struct OpenAiClient {
    http: reqwest::Client,
    base_url: String,
}

impl OpenAiClient {
    pub fn new(base_url: impl Into<String>, timeout: std::time::Duration) -> Self {
        Self { http: reqwest::Client::builder().timeout(timeout).build().unwrap_or_default(), base_url: base_url.into() }
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    model: String,
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Deserialize)]
struct ErrorDetail {
    message: String,
    #[serde(default)]
    code: Option<String>,
}

fn role_str(role: MessageRole) -> &'static str {
    match role {
        MessageRole::System => "system",
        MessageRole::User => "user",
        MessageRole::Assistant => "assistant",
    }
}

#[async_trait]
impl ProviderClient for OpenAiClient {
    fn provider_name(&self) -> &str {
        "openai"
    }

    async fn chat_completion(
        &self,
        secret: &SecretString,
        model: &str,
        messages: &[ChatMessage],
        params: &CompletionParams,
    ) -> Result<ProviderCompletion, ProviderError> {
        let body = ChatRequest {
            model,
            messages: messages.iter().map(|m| WireMessage { role: role_str(m.role), content: &m.content }).collect(),
            max_tokens: params.max_output_tokens,
            temperature: params.temperature,
        };

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(secret.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() {
                    ProviderError::Transport(e.to_string())
                } else {
                    ProviderError::Other(e.to_string())
                }
            })?;

        let status = response.status();

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = response.headers().get("retry-after").and_then(|v| v.to_str().ok()).and_then(|v| v.parse().ok());
            return Err(ProviderError::RateLimit { retry_after_secs });
        }
        if status.is_server_error() {
            return Err(ProviderError::Transport(format!("server error {status}")));
        }
        if !status.is_success() {
            let body: ErrorBody = response.json().await.map_err(|e| ProviderError::Other(e.to_string()))?;
            if body.error.code.as_deref() == Some("content_filter") {
                return Err(ProviderError::SafetyBlock { ratings: SafetyRatings::default() });
            }
            return Err(ProviderError::Other(body.error.message));
        }

        let parsed: ChatResponse = response.json().await.map_err(|e| ProviderError::Other(e.to_string()))?;
        let choice = parsed.choices.into_iter().next().ok_or_else(|| ProviderError::Other("empty choices array".to_string()))?;

        if choice.finish_reason.as_deref() == Some("content_filter") {
            return Err(ProviderError::SafetyBlock { ratings: SafetyRatings::default() });
        }

        Ok(ProviderCompletion {
            content: choice.message.content.unwrap_or_default(),
            model: parsed.model,
            input_tokens: parsed.usage.as_ref().map_or(0, |u| u.prompt_tokens),
            output_tokens: parsed.usage.as_ref().map_or(0, |u| u.completion_tokens),
            finish_reason: choice.finish_reason.unwrap_or_else(|| "stop".to_string()),
        })
    }
}
