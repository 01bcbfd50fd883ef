//! `RequestRouter` implementation (§4.3): the single entry point for LLM
//! calls - composes the conversation, asks the `KeyManager` for a key,
//! calls the provider, and drives the retry/escalation/sanitization ladder
//! on failure.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use polyagent_common::error::{Error, Result};
use polyagent_common::metrics::{DefaultMetricsCollector, MetricsCollector};
use polyagent_common::types::{MessageRole, Workload};
use polyagent_core::conversation::ConversationStore;
use polyagent_core::key_manager::{KeyManager, KeySelectionRequest, SelectedKey};
use polyagent_core::router::{ChatMessage, CompletionOutcome, CompletionParams, CompletionRequest, ProviderError, RequestRouter, estimate_tokens};
use rand::Rng;
use tracing::{instrument, warn};

use crate::providers::ProviderRegistry;
use crate::sanitize::sanitize_prompt;

pub struct DefaultRequestRouter {
    key_manager: Arc<dyn KeyManager>,
    conversations: Arc<dyn ConversationStore>,
    providers: ProviderRegistry,
    max_retries: u32,
    base_backoff_ms: u64,
    max_backoff_ms: u64,
    metrics: Arc<dyn MetricsCollector>,
}

impl DefaultRequestRouter {
    pub fn new(
        key_manager: Arc<dyn KeyManager>,
        conversations: Arc<dyn ConversationStore>,
        providers: ProviderRegistry,
        max_retries: u32,
        base_backoff_ms: u64,
        max_backoff_ms: u64,
    ) -> Self {
        Self::with_metrics(key_manager, conversations, providers, max_retries, base_backoff_ms, max_backoff_ms, Arc::new(DefaultMetricsCollector))
    }

    /// Same as `new`, but with an injected `MetricsCollector` (tests, or a
    /// deployment that wants a non-Prometheus sink).
    pub fn with_metrics(
        key_manager: Arc<dyn KeyManager>,
        conversations: Arc<dyn ConversationStore>,
        providers: ProviderRegistry,
        max_retries: u32,
        base_backoff_ms: u64,
        max_backoff_ms: u64,
        metrics: Arc<dyn MetricsCollector>,
    ) -> Self {
        Self { key_manager, conversations, providers, max_retries, base_backoff_ms, max_backoff_ms, metrics }
    }

    /// `base * 2^attempt` ms with +-25% jitter, capped at `max_backoff_ms`
    /// (§4.3 step 6 "Rate-limit error").
    fn backoff_duration(&self, attempt: u32) -> std::time::Duration {
        let exp = self.base_backoff_ms.saturating_mul(1u64 << attempt.min(20));
        let capped = exp.min(self.max_backoff_ms);
        let jitter_frac = rand::thread_rng().gen_range(-0.25..=0.25);
        let jittered = (capped as f64) * (1.0 + jitter_frac);
        std::time::Duration::from_millis(jittered.max(0.0) as u64)
    }
}

#[async_trait]
impl RequestRouter for DefaultRequestRouter {
    #[instrument(skip(self, request), fields(conversation_id = %request.conversation_id))]
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionOutcome> {
        let started = Instant::now();

        self.conversations.create(&request.conversation_id, request.system_prompt.as_deref()).await?;
        self.conversations.append(&request.conversation_id, MessageRole::User, &request.user_prompt, None).await?;

        let mut prompt = request.user_prompt.clone();
        let mut workload = request.workload;
        let mut excluded: Vec<String> = Vec::new();
        let attempts_total = self.max_retries + 1;
        let mut last_error: Option<Error> = None;

        for attempt in 0..attempts_total {
            let history = self.conversations.read_history(&request.conversation_id).await?;
            // The in-flight prompt may have been sanitized/escalated since
            // it was appended; re-send the working copy as the final
            // history entry rather than what was persisted.
            let prior = history.len().saturating_sub(1);
            let mut messages: Vec<ChatMessage> = history[..prior].iter().map(|m| ChatMessage { role: m.role, content: m.content.clone() }).collect();
            messages.push(ChatMessage { role: MessageRole::User, content: prompt.clone() });

            let tokens_needed = estimate_tokens(&history.iter().map(|m| m.content.as_str()).collect::<Vec<_>>().join("\n"))
                + estimate_tokens(&prompt)
                + request.expected_completion_tokens;

            let selection = self
                .key_manager
                .select_key(KeySelectionRequest {
                    model_preference: request.model_preference.clone(),
                    tokens_needed,
                    excluded: excluded.clone(),
                    workload,
                })
                .await?;

            let Some(client) = self.providers.get(&selection.provider) else {
                return Err(Error::Internal(format!("no provider client registered for {}", selection.provider)));
            };

            let params = CompletionParams { max_output_tokens: request.max_output_tokens, temperature: request.temperature };

            match client.chat_completion(&selection.secret, &selection.model, &messages, &params).await {
                Ok(completion) => {
                    self.conversations
                        .append(&request.conversation_id, MessageRole::Assistant, &completion.content, Some(completion.output_tokens))
                        .await?;
                    self.metrics.record_request(&selection.provider, "success", started.elapsed().as_secs_f64());
                    self.metrics.record_tokens(&selection.provider, completion.input_tokens, completion.output_tokens);
                    return Ok(CompletionOutcome {
                        content: completion.content,
                        model: completion.model,
                        key_id: selection.key_id,
                        tokens: completion.input_tokens + completion.output_tokens,
                        conversation_id: request.conversation_id,
                        duration_ms: started.elapsed().as_millis() as u64,
                    });
                }
                Err(ProviderError::RateLimit { retry_after_secs }) => {
                    self.metrics.record_request(&selection.provider, "rate_limited", started.elapsed().as_secs_f64());
                    let cooldown = retry_after_secs.unwrap_or(60);
                    self.key_manager.mark_key_unhealthy(&selection.key_id, cooldown, "rate_limited").await?;
                    excluded.push(selection.key_id);
                    last_error = Some(Error::RateLimited("provider returned 429".to_string()));
                    if attempt + 1 < attempts_total {
                        tokio::time::sleep(self.backoff_duration(attempt)).await;
                    }
                }
                Err(ProviderError::SafetyBlock { ratings: _ }) => {
                    self.metrics.record_request(&selection.provider, "safety_blocked", started.elapsed().as_secs_f64());
                    // §4.3 step 6.b: escalate workload, then sanitize on
                    // the final attempt, retrying the *same* key.
                    let is_final_attempt = attempt + 2 >= attempts_total;
                    if is_final_attempt {
                        prompt = sanitize_prompt(&prompt);
                    } else if let Some(next) = workload.unwrap_or(Workload::Light).escalate() {
                        workload = Some(next);
                    } else {
                        prompt = sanitize_prompt(&prompt);
                    }
                    last_error = Some(Error::SafetyBlocked("content blocked by provider safety filter".to_string()));
                }
                Err(e @ ProviderError::Transport(_)) => {
                    self.metrics.record_request(&selection.provider, "transport_error", started.elapsed().as_secs_f64());
                    warn!(key_id = %selection.key_id, error = %e, "transport error, cooling down key and retrying");
                    self.key_manager.mark_key_unhealthy(&selection.key_id, 30, "transport_error").await?;
                    excluded.push(selection.key_id);
                    last_error = Some(Error::Internal(e.to_string()));
                    if attempt + 1 < attempts_total {
                        tokio::time::sleep(self.backoff_duration(attempt)).await;
                    }
                }
                Err(ProviderError::Other(msg)) => {
                    self.metrics.record_request(&selection.provider, "error", started.elapsed().as_secs_f64());
                    return Err(Error::Agent(msg));
                }
            }
        }

        Err(last_error.unwrap_or(Error::AllKeysExhausted))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;

    use polyagent_common::types::{Conversation, Message};
    use polyagent_core::key_manager::{KeyManagerHealth, KeyStatus};
    use polyagent_core::router::{ProviderClient, ProviderCompletion};
    use secrecy::SecretString;

    struct ScriptedKeyManager {
        responses: Mutex<VecDeque<Result<SelectedKey>>>,
        requests: Mutex<Vec<KeySelectionRequest>>,
        unhealthy_calls: Mutex<Vec<(String, u64, String)>>,
    }

    impl ScriptedKeyManager {
        fn new(responses: Vec<Result<SelectedKey>>) -> Self {
            Self { responses: Mutex::new(responses.into()), requests: Mutex::new(Vec::new()), unhealthy_calls: Mutex::new(Vec::new()) }
        }
    }

    #[async_trait]
    impl KeyManager for ScriptedKeyManager {
        async fn select_key(&self, request: KeySelectionRequest) -> Result<SelectedKey> {
            self.requests.lock().unwrap().push(request);
            self.responses.lock().unwrap().pop_front().unwrap_or(Err(Error::AllKeysExhausted))
        }

        async fn mark_key_unhealthy(&self, key_id: &str, duration_seconds: u64, reason: &str) -> Result<()> {
            self.unhealthy_calls.lock().unwrap().push((key_id.to_string(), duration_seconds, reason.to_string()));
            Ok(())
        }

        async fn get_key_status(&self, _key_id: &str) -> Result<KeyStatus> {
            unimplemented!("not exercised by these tests")
        }

        async fn get_all_key_statuses(&self) -> Result<Vec<KeyStatus>> {
            Ok(vec![])
        }

        async fn health_check(&self) -> Result<KeyManagerHealth> {
            unimplemented!("not exercised by these tests")
        }

        async fn reload_keys(&self) -> Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct InMemoryConversations {
        store: Mutex<HashMap<String, Vec<Message>>>,
    }

    #[async_trait]
    impl ConversationStore for InMemoryConversations {
        async fn create(&self, conv_id: &str, system_prompt: Option<&str>) -> Result<()> {
            let mut store = self.store.lock().unwrap();
            store.entry(conv_id.to_string()).or_insert_with(|| {
                system_prompt
                    .map(|s| vec![Message { role: MessageRole::System, content: s.to_string(), tokens: None, metadata: Default::default() }])
                    .unwrap_or_default()
            });
            Ok(())
        }

        async fn append(&self, conv_id: &str, role: MessageRole, content: &str, tokens: Option<u32>) -> Result<()> {
            self.store
                .lock()
                .unwrap()
                .entry(conv_id.to_string())
                .or_default()
                .push(Message { role, content: content.to_string(), tokens, metadata: Default::default() });
            Ok(())
        }

        async fn read_history(&self, conv_id: &str) -> Result<Vec<Message>> {
            Ok(self.store.lock().unwrap().get(conv_id).cloned().unwrap_or_default())
        }

        async fn truncate(&self, _conv_id: &str, _n: usize) -> Result<()> {
            Ok(())
        }

        async fn get(&self, conv_id: &str) -> Result<Option<Conversation>> {
            Ok(self
                .store
                .lock()
                .unwrap()
                .get(conv_id)
                .cloned()
                .map(|messages| Conversation { conv_id: conv_id.to_string(), messages, metadata: Default::default() }))
        }

        async fn health_check(&self) -> Result<bool> {
            Ok(true)
        }
    }

    struct ScriptedProvider {
        name: &'static str,
        responses: Mutex<VecDeque<std::result::Result<ProviderCompletion, ProviderError>>>,
        seen_prompts: Mutex<Vec<String>>,
    }

    impl ScriptedProvider {
        fn new(name: &'static str, responses: Vec<std::result::Result<ProviderCompletion, ProviderError>>) -> Self {
            Self { name, responses: Mutex::new(responses.into()), seen_prompts: Mutex::new(Vec::new()) }
        }
    }

    #[async_trait]
    impl ProviderClient for ScriptedProvider {
        fn provider_name(&self) -> &str {
            self.name
        }

        async fn chat_completion(
            &self,
            _secret: &SecretString,
            _model: &str,
            messages: &[ChatMessage],
            _params: &CompletionParams,
        ) -> std::result::Result<ProviderCompletion, ProviderError> {
            self.seen_prompts.lock().unwrap().push(messages.last().unwrap().content.clone());
            self.responses.lock().unwrap().pop_front().unwrap_or(Err(ProviderError::Other("no more scripted responses".to_string())))
        }
    }

    fn selected_key(key_id: &str) -> SelectedKey {
        SelectedKey { key_id: key_id.to_string(), secret: SecretString::new("sk-test".to_string()), model: "gpt-test".to_string(), provider: "test-provider".to_string() }
    }

    fn completion(content: &str) -> ProviderCompletion {
        ProviderCompletion { content: content.to_string(), model: "gpt-test".to_string(), input_tokens: 10, output_tokens: 5, finish_reason: "stop".to_string() }
    }

    fn request(prompt: &str) -> CompletionRequest {
        CompletionRequest {
            conversation_id: "conv_1".to_string(),
            system_prompt: Some("you are a helpful agent".to_string()),
            user_prompt: prompt.to_string(),
            model_preference: None,
            workload: Some(Workload::Light),
            expected_completion_tokens: 100,
            max_output_tokens: 512,
            temperature: 0.2,
        }
    }

    fn router(key_manager: ScriptedKeyManager, provider: ScriptedProvider, max_retries: u32) -> (DefaultRequestRouter, Arc<InMemoryConversations>) {
        let conversations = Arc::new(InMemoryConversations::default());
        let providers = ProviderRegistry::new().register(Arc::new(provider));
        let router = DefaultRequestRouter::new(Arc::new(key_manager), conversations.clone(), providers, max_retries, 1, 2);
        (router, conversations)
    }

    #[tokio::test]
    async fn succeeds_on_first_attempt_and_persists_assistant_reply() {
        let key_manager = ScriptedKeyManager::new(vec![Ok(selected_key("key_1"))]);
        let provider = ScriptedProvider::new("test-provider", vec![Ok(completion("hello there"))]);
        let (router, conversations) = router(key_manager, provider, 2);

        let outcome = router.complete(request("hi")).await.unwrap();

        assert_eq!(outcome.content, "hello there");
        assert_eq!(outcome.key_id, "key_1");
        assert_eq!(outcome.tokens, 15);

        let history = conversations.read_history("conv_1").await.unwrap();
        assert_eq!(history.len(), 3, "system + user + assistant");
        assert_eq!(history.last().unwrap().role, MessageRole::Assistant);
        assert_eq!(history.last().unwrap().content, "hello there");
    }

    #[tokio::test]
    async fn rate_limit_excludes_key_and_succeeds_on_retry() {
        let key_manager = ScriptedKeyManager::new(vec![Ok(selected_key("key_1")), Ok(selected_key("key_2"))]);
        let provider = ScriptedProvider::new("test-provider", vec![Err(ProviderError::RateLimit { retry_after_secs: Some(5) }), Ok(completion("ok now"))]);
        let (router, _conversations) = router(key_manager, provider, 2);

        let outcome = router.complete(request("hi")).await.unwrap();

        assert_eq!(outcome.key_id, "key_2");
    }

    #[tokio::test]
    async fn rate_limit_marks_key_unhealthy_and_excludes_it_from_the_next_selection() {
        let key_manager = ScriptedKeyManager::new(vec![Ok(selected_key("key_1")), Ok(selected_key("key_2"))]);
        let provider = ScriptedProvider::new("test-provider", vec![Err(ProviderError::RateLimit { retry_after_secs: Some(5) }), Ok(completion("ok now"))]);
        let conversations = Arc::new(InMemoryConversations::default());
        let providers = ProviderRegistry::new().register(Arc::new(provider));
        let key_manager = Arc::new(key_manager);
        let router = DefaultRequestRouter::new(key_manager.clone(), conversations, providers, 2, 1, 2);

        router.complete(request("hi")).await.unwrap();

        assert_eq!(key_manager.unhealthy_calls.lock().unwrap().as_slice(), &[("key_1".to_string(), 5, "rate_limited".to_string())]);
        let requests = key_manager.requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].excluded, vec!["key_1".to_string()]);
    }

    #[tokio::test]
    async fn transport_error_cools_key_down_for_thirty_seconds_and_retries() {
        let key_manager = ScriptedKeyManager::new(vec![Ok(selected_key("key_1")), Ok(selected_key("key_2"))]);
        let provider = ScriptedProvider::new("test-provider", vec![Err(ProviderError::Transport("connect reset".to_string())), Ok(completion("recovered"))]);
        let conversations = Arc::new(InMemoryConversations::default());
        let providers = ProviderRegistry::new().register(Arc::new(provider));
        let key_manager = Arc::new(key_manager);
        let router = DefaultRequestRouter::new(key_manager.clone(), conversations, providers, 2, 1, 2);

        let outcome = router.complete(request("hi")).await.unwrap();

        assert_eq!(outcome.key_id, "key_2");
        assert_eq!(key_manager.unhealthy_calls.lock().unwrap().as_slice(), &[("key_1".to_string(), 30, "transport_error".to_string())]);
    }

    #[tokio::test]
    async fn safety_block_escalates_workload_before_sanitizing_on_the_final_attempt() {
        let key_manager = ScriptedKeyManager::new(vec![Ok(selected_key("key_1")), Ok(selected_key("key_1")), Ok(selected_key("key_1"))]);
        let provider = ScriptedProvider::new(
            "test-provider",
            vec![
                Err(ProviderError::SafetyBlock { ratings: Default::default() }),
                Err(ProviderError::SafetyBlock { ratings: Default::default() }),
                Ok(completion("sanitized reply")),
            ],
        );
        let conversations = Arc::new(InMemoryConversations::default());
        let providers = ProviderRegistry::new().register(Arc::new(provider));
        let key_manager = Arc::new(key_manager);
        let router = DefaultRequestRouter::new(key_manager.clone(), conversations, providers, 2, 1, 2);

        router.complete(request("Kill the broken process")).await.unwrap();

        let requests = key_manager.requests.lock().unwrap();
        assert_eq!(requests.len(), 3);
        assert_eq!(requests[0].workload, Some(Workload::Light));
        assert_eq!(requests[1].workload, Some(Workload::Medium), "first safety block should escalate workload before sanitizing");
    }

    #[tokio::test]
    async fn safety_block_sanitizes_the_prompt_on_its_final_retry() {
        let key_manager = ScriptedKeyManager::new(vec![Ok(selected_key("key_1")), Ok(selected_key("key_1"))]);
        let provider = Arc::new(ScriptedProvider::new(
            "test-provider",
            vec![Err(ProviderError::SafetyBlock { ratings: Default::default() }), Ok(completion("sanitized reply"))],
        ));
        let conversations = Arc::new(InMemoryConversations::default());
        let providers = ProviderRegistry::new().register(provider.clone());
        let router = DefaultRequestRouter::new(Arc::new(key_manager), conversations, providers, 1, 1, 2);

        router.complete(request("Kill the broken process")).await.unwrap();

        let seen = provider.seen_prompts.lock().unwrap();
        assert_eq!(seen[0], "Kill the broken process");
        assert_eq!(seen[1], "close the broken process", "final safety-block retry should sanitize the trigger word");
    }

    #[tokio::test]
    async fn provider_other_error_surfaces_immediately_without_retry() {
        let key_manager = ScriptedKeyManager::new(vec![Ok(selected_key("key_1"))]);
        let provider = ScriptedProvider::new("test-provider", vec![Err(ProviderError::Other("malformed request".to_string()))]);
        let (router, _conversations) = router(key_manager, provider, 3);

        let err = router.complete(request("hi")).await.unwrap_err();

        assert!(matches!(err, Error::Agent(msg) if msg == "malformed request"));
    }

    #[tokio::test]
    async fn all_retries_exhausted_surfaces_the_last_classified_error() {
        let key_manager = ScriptedKeyManager::new(vec![Ok(selected_key("key_1")), Ok(selected_key("key_2"))]);
        let provider = ScriptedProvider::new(
            "test-provider",
            vec![
                Err(ProviderError::RateLimit { retry_after_secs: Some(1) }),
                Err(ProviderError::RateLimit { retry_after_secs: Some(1) }),
            ],
        );
        let (router, _conversations) = router(key_manager, provider, 1);

        let err = router.complete(request("hi")).await.unwrap_err();

        assert!(matches!(err, Error::RateLimited(_)));
    }

    #[tokio::test]
    async fn no_registered_provider_for_the_selected_key_is_an_internal_error() {
        let key_manager = ScriptedKeyManager::new(vec![Ok(SelectedKey {
            key_id: "key_1".to_string(),
            secret: SecretString::new("sk-test".to_string()),
            model: "gpt-test".to_string(),
            provider: "unregistered-provider".to_string(),
        })]);
        let provider = ScriptedProvider::new("test-provider", vec![Ok(completion("unreachable"))]);
        let (router, _conversations) = router(key_manager, provider, 0);

        let err = router.complete(request("hi")).await.unwrap_err();

        assert!(matches!(err, Error::Internal(_)));
    }
}
