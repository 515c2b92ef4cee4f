use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

pub type MessageHandler = Arc<dyn Fn(Value) + Send + Sync>;

/// Topic a callback delivered to `{path}/{id}` is published under.
pub fn callback_topic(path: &str, id: &str) -> String {
    format!("webhook:post:{}/{}", path.trim_end_matches('/'), id)
}

#[derive(Debug, PartialEq, Eq)]
pub struct SubscriptionHandle {
    id: u64,
    topic: String,
}

pub trait PubSub: Send + Sync {
    fn subscribe(&self, topic: &str, handler: MessageHandler) -> SubscriptionHandle;

    fn unsubscribe(&self, handle: SubscriptionHandle);

    /// Delivers `message` to every handler of `topic`, returns how many received it.
    fn publish(&self, topic: &str, message: Value) -> usize;
}

#[derive(Default)]
pub struct InMemoryPubSub {
    topics: DashMap<String, Vec<(u64, MessageHandler)>>,
    next_id: AtomicU64,
}

impl InMemoryPubSub {
    pub fn new() -> Self {
        InMemoryPubSub::default()
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics.get(topic).map(|h| h.len()).unwrap_or(0)
    }

    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }
}

impl PubSub for InMemoryPubSub {
    fn subscribe(&self, topic: &str, handler: MessageHandler) -> SubscriptionHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.topics
            .entry(topic.to_string())
            .or_default()
            .push((id, handler));
        SubscriptionHandle {
            id,
            topic: topic.to_string(),
        }
    }

    fn unsubscribe(&self, handle: SubscriptionHandle) {
        self.topics.remove_if_mut(&handle.topic, |_, handlers| {
            handlers.retain(|(id, _)| *id != handle.id);
            handlers.is_empty()
        });
    }

    fn publish(&self, topic: &str, message: Value) -> usize {
        // Handlers may unsubscribe while running, so call them outside the map guard.
        let handlers: Vec<MessageHandler> = match self.topics.get(topic) {
            Some(entry) => entry.iter().map(|(_, h)| Arc::clone(h)).collect(),
            None => return 0,
        };
        for handler in &handlers {
            handler(message.clone());
        }
        handlers.len()
    }
}
