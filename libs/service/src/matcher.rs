use bytestring::ByteString;
use codec::Qos;
use parking_lot::RwLock;

use crate::topic_tree::TopicTree;

/// Shared subscription index.
///
/// Readers see a consistent snapshot; matches are copied out under the read
/// lock so fan-out never holds it across awaits.
#[derive(Default)]
pub struct TopicMatcher {
    tree: RwLock<TopicTree<ByteString, Qos>>,
}

impl TopicMatcher {
    /// Idempotent per `(client, filter)`; re-adding replaces the QoS.
    pub fn insert(&self, filter: &str, client_id: ByteString, qos: Qos) -> Option<Qos> {
        self.tree.write().insert(filter, client_id, qos)
    }

    pub fn remove(&self, filter: &str, client_id: &str) -> Option<Qos> {
        self.tree.write().remove(filter, client_id)
    }

    pub fn remove_all(&self, client_id: &str) {
        self.tree.write().remove_all(client_id)
    }

    /// Subscriptions matching `topic`, duplicates per overlapping filter
    /// included.
    pub fn matches(&self, topic: &str) -> Vec<(ByteString, Qos)> {
        self.tree
            .read()
            .matches(topic)
            .map(|(client_id, qos)| (client_id.clone(), *qos))
            .collect()
    }

    pub fn subscription_count(&self) -> usize {
        self.tree.read().subscriber_count()
    }
}
