use std::collections::{HashMap, HashSet};

use anyhow::Result;
use bytestring::ByteString;
use codec::Qos;
use parking_lot::RwLock;
use uuid::Uuid;

use crate::message::Message;
use crate::topic_tree::TopicTree;

/// Holds messages awaiting second-phase delivery or retained replay, keyed
/// by store-assigned guid, plus the retained pointer per topic.
#[async_trait::async_trait]
pub trait MessageStore: Send + Sync + 'static {
    /// Persists the message and assigns it a fresh guid.
    async fn store_publish_for_future(&self, msg: Message) -> Result<Uuid>;

    async fn message_by_guid(&self, guid: Uuid) -> Result<Option<Message>>;

    /// Points the retained slot of the message's topic at `guid`.
    async fn store_retained(&self, topic: &str, guid: Uuid) -> Result<()>;

    /// Clears the retained slot for `topic`.
    async fn clean_retained(&self, topic: &str) -> Result<()>;

    /// Retained messages whose topic is admitted by `filter`.
    async fn search_matching(&self, filter: &str) -> Result<Vec<(Uuid, Message)>>;

    /// Erases stored messages published by this client that are not
    /// referenced as retained.
    async fn drop_messages_in_session(&self, client_id: &str) -> Result<()>;

    async fn retained_count(&self) -> Result<usize>;
}

#[derive(Default)]
struct StoreInner {
    messages: HashMap<Uuid, Message>,
    retained: TopicTree<ByteString, Qos>,
    retained_guids: HashMap<ByteString, Uuid>,
}

#[derive(Default)]
pub struct MemoryMessageStore {
    inner: RwLock<StoreInner>,
}

#[async_trait::async_trait]
impl MessageStore for MemoryMessageStore {
    async fn store_publish_for_future(&self, msg: Message) -> Result<Uuid> {
        let guid = Uuid::new_v4();
        self.inner.write().messages.insert(guid, msg);
        Ok(guid)
    }

    async fn message_by_guid(&self, guid: Uuid) -> Result<Option<Message>> {
        Ok(self.inner.read().messages.get(&guid).cloned())
    }

    async fn store_retained(&self, topic: &str, guid: Uuid) -> Result<()> {
        let mut inner = self.inner.write();
        let msg = match inner.messages.get(&guid) {
            Some(msg) => msg.clone(),
            None => anyhow::bail!("unknown message guid: {}", guid),
        };
        inner.retained.set_retained(topic, Some(msg));
        inner.retained_guids.insert(topic.into(), guid);
        Ok(())
    }

    async fn clean_retained(&self, topic: &str) -> Result<()> {
        let mut inner = self.inner.write();
        inner.retained.set_retained(topic, None);
        inner.retained_guids.remove(topic);
        Ok(())
    }

    async fn search_matching(&self, filter: &str) -> Result<Vec<(Uuid, Message)>> {
        let inner = self.inner.read();
        Ok(inner
            .retained
            .retained_matches(filter)
            .filter_map(|msg| {
                inner
                    .retained_guids
                    .get(msg.topic())
                    .map(|guid| (*guid, msg.clone()))
            })
            .collect())
    }

    async fn drop_messages_in_session(&self, client_id: &str) -> Result<()> {
        let mut inner = self.inner.write();
        let retained = inner
            .retained_guids
            .values()
            .copied()
            .collect::<HashSet<_>>();
        inner.messages.retain(|guid, msg| {
            retained.contains(guid) || msg.publisher().map(|s| &**s) != Some(client_id)
        });
        Ok(())
    }

    async fn retained_count(&self) -> Result<usize> {
        Ok(self.inner.read().retained.retained_count())
    }
}
