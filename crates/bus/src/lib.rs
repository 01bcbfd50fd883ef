#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! In-process `MessageBus` implementation (§4.1): a typed publish/
//! subscribe bus over the small fixed set of channels named in §6,
//! delivering synchronously so the publisher observes every handler
//! complete before `publish` returns.
//!
//! Channels are rows in a `DashMap`, each holding an ordered subscriber
//! list behind a `parking_lot::RwLock` so registration never blocks
//! delivery for long.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use polyagent_common::error::Result;
use polyagent_common::types::Event;
use polyagent_core::bus::{EventHandler, MessageBus, SubscriptionId};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, instrument};

struct Subscriber {
    id: SubscriptionId,
    handler: Arc<dyn EventHandler>,
}

/// In-process implementation of `MessageBus`.
///
/// Ordering (§5 "Ordering guarantees"): within one channel, events appear
/// to each subscriber in publish order. A per-channel `AsyncMutex`
/// serializes concurrent `publish` calls on the same channel so that two
/// racing publishers cannot interleave delivery; across channels no
/// ordering is promised, matching the per-channel-only guarantee.
pub struct InProcessBus {
    subscribers: DashMap<String, RwLock<Vec<Subscriber>>>,
    publish_locks: DashMap<String, Arc<AsyncMutex<()>>>,
    next_subscription_id: AtomicU64,
}

impl InProcessBus {
    pub fn new() -> Self {
        Self {
            subscribers: DashMap::new(),
            publish_locks: DashMap::new(),
            next_subscription_id: AtomicU64::new(1),
        }
    }

    fn publish_lock(&self, channel: &str) -> Arc<AsyncMutex<()>> {
        self.publish_locks.entry(channel.to_string()).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
    }
}

impl Default for InProcessBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageBus for InProcessBus {
    #[instrument(skip(self, event), fields(channel, event_id = %event.event_id))]
    async fn publish(&self, channel: &str, event: Event) -> Result<()> {
        let lock = self.publish_lock(channel);
        let _guard = lock.lock().await;

        let handlers: Vec<Arc<dyn EventHandler>> = self
            .subscribers
            .get(channel)
            .map(|entry| entry.read().iter().map(|s| s.handler.clone()).collect())
            .unwrap_or_default();

        debug!(channel, subscriber_count = handlers.len(), "publishing event");

        for handler in handlers {
            handler.handle(event.clone()).await;
        }

        Ok(())
    }

    fn subscribe(&self, channel: &str, handler: Arc<dyn EventHandler>) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers
            .entry(channel.to_string())
            .or_insert_with(|| RwLock::new(Vec::new()))
            .write()
            .push(Subscriber { id, handler });
        id
    }

    fn unsubscribe(&self, channel: &str, subscription: SubscriptionId) {
        if let Some(entry) = self.subscribers.get(channel) {
            entry.write().retain(|s| s.id != subscription);
        }
    }
}
