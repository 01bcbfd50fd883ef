//! Anthropic messages-API client. Anthropic has no `system` role inside
//! `messages[]`, so the system prompt is lifted into the top-level
//! `system` field instead of being collapsed into the first user turn.

use async_trait::async_trait;
use polyagent_common::types::MessageRole;
use polyagent_core::router::{ChatMessage, CompletionParams, ProviderClient, ProviderCompletion, ProviderError, SafetyRatings};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

pub struct AnthropicClient {
    http: reqwest::Client,
    base_url: String,
}

impl AnthropicClient {
    pub fn new(base_url: impl Into<String>, timeout: std::time::Duration) -> Self {
        Self { http: reqwest::Client::builder().timeout(timeout).build().unwrap_or_default(), base_url: base_url.into() }
    }
}

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
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
struct MessagesResponse {
    model: String,
    content: Vec<ContentBlock>,
    stop_reason: Option<String>,
    usage: Usage,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: String,
}

#[derive(Deserialize)]
struct Usage {
    input_tokens: u32,
    output_tokens: u32,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Deserialize)]
struct ErrorDetail {
    #[serde(rename = "type")]
    kind: String,
    message: String,
}

#[async_trait]
impl ProviderClient for AnthropicClient {
    fn provider_name(&self) -> &str {
        "anthropic"
    }

    async fn chat_completion(
        &self,
        secret: &SecretString,
        model: &str,
        messages: &[ChatMessage],
        params: &CompletionParams,
    ) -> Result<ProviderCompletion, ProviderError> {
        let system = messages.iter().find(|m| m.role == MessageRole::System).map(|m| m.content.as_str());
        let turns: Vec<WireMessage> = messages
            .iter()
            .filter(|m| m.role != MessageRole::System)
            .map(|m| WireMessage { role: if m.role == MessageRole::User { "user" } else { "assistant" }, content: &m.content })
            .collect();

        let body = MessagesRequest { model, system, messages: turns, max_tokens: params.max_output_tokens, temperature: params.temperature };

        let response = self
            .http
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", secret.expose_secret())
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await
            .map_err(|e| if e.is_timeout() || e.is_connect() { ProviderError::Transport(e.to_string()) } else { ProviderError::Other(e.to_string()) })?;

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
            if body.error.kind == "overloaded_error" {
                return Err(ProviderError::Transport(body.error.message));
            }
            return Err(ProviderError::Other(body.error.message));
        }

        let parsed: MessagesResponse = response.json().await.map_err(|e| ProviderError::Other(e.to_string()))?;

        if parsed.stop_reason.as_deref() == Some("refusal") {
            return Err(ProviderError::SafetyBlock { ratings: SafetyRatings::default() });
        }

        let content = parsed.content.into_iter().map(|b| b.text).collect::<Vec<_>>().join("");

        Ok(ProviderCompletion {
            content,
            model: parsed.model,
            input_tokens: parsed.usage.input_tokens,
            output_tokens: parsed.usage.output_tokens,
            finish_reason: parsed.stop_reason.unwrap_or_else(|| "end_turn".to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn messages() -> Vec<ChatMessage> {
        vec![
            ChatMessage { role: MessageRole::System, content: "be terse".to_string() },
            ChatMessage { role: MessageRole::User, content: "hello".to_string() },
        ]
    }

    fn params() -> CompletionParams {
        CompletionParams { max_output_tokens: 256, temperature: 0.1 }
    }

    #[tokio::test]
    async fn lifts_the_system_message_into_the_top_level_field_and_parses_the_reply() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "model": "claude-3-5-sonnet",
                "content": [{"text": "hi there"}],
                "stop_reason": "end_turn",
                "usage": {"input_tokens": 20, "output_tokens": 6}
            })))
            .mount(&server)
            .await;

        let client = AnthropicClient::new(server.uri(), std::time::Duration::from_secs(5));
        let result = client.chat_completion(&SecretString::new("sk-ant-test".to_string()), "claude-3-5-sonnet", &messages(), &params()).await.unwrap();

        assert_eq!(result.content, "hi there");
        assert_eq!(result.input_tokens, 20);
        assert_eq!(result.output_tokens, 6);
        assert_eq!(result.finish_reason, "end_turn");
    }

    #[tokio::test]
    async fn surfaces_429_as_rate_limit_with_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "3"))
            .mount(&server)
            .await;

        let client = AnthropicClient::new(server.uri(), std::time::Duration::from_secs(5));
        let err = client.chat_completion(&SecretString::new("sk-ant-test".to_string()), "claude-3-5-sonnet", &messages(), &params()).await.unwrap_err();

        assert!(matches!(err, ProviderError::RateLimit { retry_after_secs: Some(3) }));
    }

    #[tokio::test]
    async fn overloaded_error_is_a_retryable_transport_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(ResponseTemplate::new(529).set_body_json(json!({
                "error": {"type": "overloaded_error", "message": "overloaded"}
            })))
            .mount(&server)
            .await;

        let client = AnthropicClient::new(server.uri(), std::time::Duration::from_secs(5));
        let err = client.chat_completion(&SecretString::new("sk-ant-test".to_string()), "claude-3-5-sonnet", &messages(), &params()).await.unwrap_err();

        assert!(err.is_retryable_transport());
    }

    #[tokio::test]
    async fn a_refusal_stop_reason_is_a_safety_block() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "model": "claude-3-5-sonnet",
                "content": [],
                "stop_reason": "refusal",
                "usage": {"input_tokens": 20, "output_tokens": 0}
            })))
            .mount(&server)
            .await;

        let client = AnthropicClient::new(server.uri(), std::time::Duration::from_secs(5));
        let err = client.chat_completion(&SecretString::new("sk-ant-test".to_string()), "claude-3-5-sonnet", &messages(), &params()).await.unwrap_err();

        assert!(matches!(err, ProviderError::SafetyBlock { .. }));
    }
}
