//! `ConversationStore` contract (§4.4): key-value store of conversation id
//! to ordered message list. Append is the only write path for messages.

use async_trait::async_trait;
use polyagent_common::error::Result;
use polyagent_common::types::{Conversation, Message, MessageRole};

#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Create a conversation, optionally seeding a leading `system`
    /// message.
    async fn create(&self, conv_id: &str, system_prompt: Option<&str>) -> Result<()>;

    /// Append one message. Visible to the next `read_history` call once
    /// this returns (§4.4 invariant).
    async fn append(&self, conv_id: &str, role: MessageRole, content: &str, tokens: Option<u32>) -> Result<()>;

    /// Full ordered history.
    async fn read_history(&self, conv_id: &str) -> Result<Vec<Message>>;

    /// Truncate to the last `n` messages, preserving a leading `system`
    /// message if one is present (§3).
    async fn truncate(&self, conv_id: &str, n: usize) -> Result<()>;

    async fn get(&self, conv_id: &str) -> Result<Option<Conversation>>;

    async fn health_check(&self) -> Result<bool>;
}
