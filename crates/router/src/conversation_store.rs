//! `ConversationStore` implementation (§4.4): append-only, one logical
//! writer at a time per `conv_id` (§5 "Shared resources").

use async_trait::async_trait;
use parking_lot::Mutex;
use polyagent_common::error::{Error, Result};
use polyagent_common::types::{Conversation, Message, MessageRole};
use polyagent_core::conversation::ConversationStore;
use std::collections::HashMap;
use std::sync::Arc;

/// In-memory store keyed by `conv_id`, each conversation single-writer via
/// its own mutex so concurrent router calls on different conversations
/// never contend.
#[derive(Default)]
pub struct InMemoryConversationStore {
    conversations: Arc<Mutex<HashMap<String, Conversation>>>,
}

impl InMemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConversationStore for InMemoryConversationStore {
    async fn create(&self, conv_id: &str, system_prompt: Option<&str>) -> Result<()> {
        let mut guard = self.conversations.lock();
        guard.entry(conv_id.to_string()).or_insert_with(|| {
            let mut conv = Conversation { conv_id: conv_id.to_string(), ..Default::default() };
            if let Some(system) = system_prompt {
                conv.messages.push(Message { role: MessageRole::System, content: system.to_string(), tokens: None, metadata: HashMap::new() });
            }
            conv
        });
        Ok(())
    }

    async fn append(&self, conv_id: &str, role: MessageRole, content: &str, tokens: Option<u32>) -> Result<()> {
        let mut guard = self.conversations.lock();
        let conv = guard
            .get_mut(conv_id)
            .ok_or_else(|| Error::Internal(format!("conversation {conv_id} does not exist")))?;
        conv.messages.push(Message { role, content: content.to_string(), tokens, metadata: HashMap::new() });
        Ok(())
    }

    async fn read_history(&self, conv_id: &str) -> Result<Vec<Message>> {
        let guard = self.conversations.lock();
        Ok(guard.get(conv_id).map(|c| c.messages.clone()).unwrap_or_default())
    }

    async fn truncate(&self, conv_id: &str, n: usize) -> Result<()> {
        let mut guard = self.conversations.lock();
        let Some(conv) = guard.get_mut(conv_id) else { return Ok(()) };

        let leading_system = conv.messages.first().filter(|m| m.role == MessageRole::System).cloned();
        let tail_start = conv.messages.len().saturating_sub(n);
        let mut tail: Vec<Message> = conv.messages[tail_start..].to_vec();

        if let Some(system) = leading_system {
            if !tail.first().is_some_and(|m| m.role == MessageRole::System) {
                tail.insert(0, system);
            }
        }
        conv.messages = tail;
        Ok(())
    }

    async fn get(&self, conv_id: &str) -> Result<Option<Conversation>> {
        Ok(self.conversations.lock().get(conv_id).cloned())
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }
}
