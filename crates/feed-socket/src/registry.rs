use feed_core::wire::InboundMessage;
use std::collections::HashMap;
use std::sync::Arc;

pub(crate) type Handler = Arc<dyn Fn(&InboundMessage) + Send + Sync>;

/// Handle for one registered (topic, handler) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subscription {
    topic: String,
    id: u64,
}

impl Subscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }
}

#[derive(Default)]
pub(crate) struct SubscriberRegistry {
    next_id: u64,
    topics: HashMap<String, Vec<(u64, Handler)>>,
}

impl SubscriberRegistry {
    pub(crate) fn insert(&mut self, topic: &str, handler: Handler) -> Subscription {
        self.next_id += 1;
        let id = self.next_id;
        self.topics
            .entry(topic.to_string())
            .or_default()
            .push((id, handler));
        Subscription {
            topic: topic.to_string(),
            id,
        }
    }

    pub(crate) fn remove(&mut self, subscription: &Subscription) -> bool {
        let Some(entries) = self.topics.get_mut(&subscription.topic) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|(id, _)| *id != subscription.id);
        let removed = entries.len() != before;
        if entries.is_empty() {
            self.topics.remove(&subscription.topic);
        }
        removed
    }

    /// Handlers for `topic` in registration order, cloned so dispatch runs
    /// without the registry lock held.
    pub(crate) fn handlers_for(&self, topic: &str) -> Vec<Handler> {
        self.topics
            .get(topic)
            .map(|entries| entries.iter().map(|(_, handler)| handler.clone()).collect())
            .unwrap_or_default()
    }

    pub(crate) fn count(&self, topic: &str) -> usize {
        self.topics.get(topic).map(Vec::len).unwrap_or(0)
    }

    pub(crate) fn total(&self) -> usize {
        self.topics.values().map(Vec::len).sum()
    }
}
