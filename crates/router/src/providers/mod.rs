//! LLM provider clients: per-provider `reqwest`-backed implementations of
//! the single `chat_completion` method the router calls.

pub mod anthropic;
pub mod openai;

use std::collections::HashMap;
use std::sync::Arc;

use polyagent_core::router::ProviderClient;

/// Registry of provider name -> client, looked up by the `ApiKey.provider`
/// the `KeyManager` selected.
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    clients: HashMap<String, Arc<dyn ProviderClient>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, client: Arc<dyn ProviderClient>) -> Self {
        self.clients.insert(client.provider_name().to_string(), client);
        self
    }

    pub fn get(&self, provider: &str) -> Option<Arc<dyn ProviderClient>> {
        self.clients.get(provider).cloned()
    }
}
