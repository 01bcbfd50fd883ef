//! `MessageBus` contract (§4.1): typed pub/sub over a small fixed set of
//! channels, synchronous in-process delivery for the reference
//! implementation.

use async_trait::async_trait;
use polyagent_common::error::Result;
use polyagent_common::types::Event;

/// A channel subscriber. Implementations may publish further events from
/// inside `handle` (e.g. the Debugger re-publishing a branch todo).
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: Event);
}

/// Typed publish/subscribe bus.
///
/// Ordering: within one channel, events appear to each subscriber in
/// publish order; across channels no ordering is promised (§5).
/// Consumers must be idempotent on `event_id`, since a durable backend may
/// add at-least-once semantics.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Deliver `event` to every subscriber on `channel`. The reference
    /// implementation awaits all handlers before returning.
    async fn publish(&self, channel: &str, event: Event) -> Result<()>;

    /// Register a handler on `channel`. Returns a subscription id that can
    /// be used to unsubscribe.
    fn subscribe(&self, channel: &str, handler: std::sync::Arc<dyn EventHandler>) -> SubscriptionId;

    fn unsubscribe(&self, channel: &str, subscription: SubscriptionId);
}

/// Opaque handle for a registered subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);
