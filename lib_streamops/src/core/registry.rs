//! # Topic Registry
//!
//! Reference counts realtime topics. Several views may ask for the same topic;
//! the server only needs to hear about the first acquisition and the last
//! release.
use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

/// Topic name to reference count.
#[derive(Debug, Default)]
pub struct TopicRegistry {
    topics: Mutex<BTreeMap<String, u32>>,
}

impl TopicRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with one reference per topic.
    pub fn with_topics<I, S>(topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let registry = Self::new();
        for topic in topics {
            registry.acquire(&topic.into());
        }
        registry
    }

    /// Adds a reference. Returns `true` when this is the first one, i.e. the
    /// server has to be told to subscribe.
    pub fn acquire(&self, topic: &str) -> bool {
        let mut topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
        let count = topics.entry(topic.to_string()).or_insert(0);
        *count += 1;
        *count == 1
    }

    /// Drops a reference. Returns `true` when it was the last one.
    /// Releasing an unknown topic is a no-op.
    pub fn release(&self, topic: &str) -> bool {
        let mut topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
        match topics.get_mut(topic) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            Some(_) => {
                topics.remove(topic);
                tracing::debug!("Topic {} has no more subscribers", topic);
                true
            }
            None => false,
        }
    }

    /// Active topics in sorted order.
    pub fn topics(&self) -> Vec<String> {
        self.topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Current reference count, `0` for unknown topics.
    pub fn ref_count(&self, topic: &str) -> u32 {
        self.topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(topic)
            .copied()
            .unwrap_or(0)
    }
}
