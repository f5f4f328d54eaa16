//! Topic subscription registry.
//!
//! Maps each topic to at most one handler. Registering a handler for an
//! existing topic replaces it. The registry never talks to the connection;
//! the client sends `subscribe`/`unsubscribe` frames around it.

use std::fmt;
use std::sync::Arc;

use agent_sync_core::execution_topic;
use agent_sync_core::protocol::execution_id_of;
use indexmap::IndexMap;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

/// Receives the `data` of envelopes matching a topic.
pub trait TopicHandler: Send + Sync {
    fn handle(&self, data: &Value);
}

impl<F> TopicHandler for F
where
    F: Fn(&Value) + Send + Sync,
{
    fn handle(&self, data: &Value) {
        self(data);
    }
}

/// Forwards matching payloads into a channel.
#[derive(Debug, Clone)]
pub struct ChannelHandler(pub mpsc::UnboundedSender<Value>);

impl TopicHandler for ChannelHandler {
    fn handle(&self, data: &Value) {
        if self.0.send(data.clone()).is_err() {
            debug!("Topic receiver dropped");
        }
    }
}

#[derive(Default)]
pub struct SubscriptionRegistry {
    topics: IndexMap<String, Arc<dyn TopicHandler>>,
}

impl fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("topics", &self.topics.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl SubscriptionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `topic`. Returns `true` if it replaced one.
    pub fn insert(&mut self, topic: impl Into<String>, handler: Arc<dyn TopicHandler>) -> bool {
        self.topics.insert(topic.into(), handler).is_some()
    }

    /// Remove the handler for `topic`. Returns `true` if one was registered.
    pub fn remove(&mut self, topic: &str) -> bool {
        self.topics.shift_remove(topic).is_some()
    }

    #[must_use]
    pub fn contains(&self, topic: &str) -> bool {
        self.topics.contains_key(topic)
    }

    /// Registered topics in registration order.
    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.topics.keys().map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.topics.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }

    /// Invoke every handler whose topic matches the envelope.
    ///
    /// A topic matches when it equals `kind`, `<kind>_<execution_id>` or
    /// `execution_<execution_id>`. Each handler runs at most once. Returns
    /// the number of handlers invoked.
    pub fn dispatch(&self, kind: &str, data: &Value) -> usize {
        let scoped = execution_id_of(data).map(|id| (format!("{kind}_{id}"), execution_topic(&id)));
        let mut invoked = 0;
        for (topic, handler) in &self.topics {
            let matches = topic == kind
                || scoped
                    .as_ref()
                    .is_some_and(|(typed, execution)| topic == typed || topic == execution);
            if matches {
                handler.handle(data);
                invoked += 1;
            }
        }
        invoked
    }
}
