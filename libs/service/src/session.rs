use std::collections::{HashMap, VecDeque};
use std::num::NonZeroU16;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use bytestring::ByteString;
use codec::Qos;
use fnv::FnvHashMap;
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use uuid::Uuid;

use crate::message::Message;

/// A QoS >= 1 delivery to one recipient, keyed by the packet id assigned
/// from that recipient's session.
#[derive(Debug, Clone)]
pub struct InflightMessage {
    /// Store guid of the message, when it was persisted.
    pub guid: Option<Uuid>,
    /// Effective QoS for this recipient.
    pub qos: Qos,
    pub message: Message,
}

struct SessionInner {
    subscriptions: HashMap<ByteString, Qos>,
    /// Awaiting PUBACK (QoS 1) or PUBREC (QoS 2). Insertion-ordered so a
    /// reconnect replays in original order.
    inflight: IndexMap<NonZeroU16, InflightMessage>,
    /// Awaiting PUBCOMP. Disjoint from `inflight` by packet id.
    second_phase: FnvHashMap<NonZeroU16, InflightMessage>,
    /// Deliveries diverted while the channel was absent or not writable;
    /// every entry also lives in `inflight`.
    enqueued: VecDeque<NonZeroU16>,
    next_packet_id: u16,
}

impl SessionInner {
    fn allocate_packet_id(&mut self) -> NonZeroU16 {
        // strictly increasing modulo 65535, skipping ids still in use
        loop {
            self.next_packet_id = if self.next_packet_id == u16::MAX {
                1
            } else {
                self.next_packet_id + 1
            };
            let packet_id = NonZeroU16::new(self.next_packet_id).unwrap();
            if !self.inflight.contains_key(&packet_id)
                && !self.second_phase.contains_key(&packet_id)
            {
                return packet_id;
            }
        }
    }
}

/// Per-client state that outlives connections when `clean_session` is false.
pub struct ClientSession {
    client_id: ByteString,
    clean_session: AtomicBool,
    notify: Arc<Notify>,
    inner: Mutex<SessionInner>,
}

impl ClientSession {
    fn new(client_id: ByteString, clean_session: bool) -> Self {
        Self {
            client_id,
            clean_session: AtomicBool::new(clean_session),
            notify: Arc::new(Notify::new()),
            inner: Mutex::new(SessionInner {
                subscriptions: HashMap::new(),
                inflight: IndexMap::new(),
                second_phase: FnvHashMap::default(),
                enqueued: VecDeque::new(),
                next_packet_id: 0,
            }),
        }
    }

    #[inline]
    pub fn client_id(&self) -> &ByteString {
        &self.client_id
    }

    #[inline]
    pub fn is_clean_session(&self) -> bool {
        self.clean_session.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_clean_session(&self, clean_session: bool) {
        self.clean_session.store(clean_session, Ordering::Release);
    }

    /// Wakes the owning connection when deliveries were diverted to the
    /// enqueued queue.
    #[inline]
    pub fn notify(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    pub fn subscribe(&self, filter: ByteString, qos: Qos) -> Option<Qos> {
        self.inner.lock().subscriptions.insert(filter, qos)
    }

    pub fn unsubscribe_from(&self, filter: &str) -> bool {
        self.inner.lock().subscriptions.remove(filter).is_some()
    }

    pub fn subscriptions(&self) -> Vec<(ByteString, Qos)> {
        self.inner
            .lock()
            .subscriptions
            .iter()
            .map(|(filter, qos)| (filter.clone(), *qos))
            .collect()
    }

    pub fn wipe_subscriptions(&self) {
        self.inner.lock().subscriptions.clear();
    }

    /// Allocates a packet id and records the delivery as inflight.
    pub fn add_inflight(&self, guid: Option<Uuid>, qos: Qos, message: Message) -> NonZeroU16 {
        let mut inner = self.inner.lock();
        let packet_id = inner.allocate_packet_id();
        inner
            .inflight
            .insert(packet_id, InflightMessage { guid, qos, message });
        packet_id
    }

    pub fn get_inflight_message(&self, packet_id: NonZeroU16) -> Option<InflightMessage> {
        self.inner.lock().inflight.get(&packet_id).cloned()
    }

    /// PUBACK received: the QoS 1 exchange is complete.
    pub fn in_flight_acknowledged(&self, packet_id: NonZeroU16) -> Option<InflightMessage> {
        let mut inner = self.inner.lock();
        inner.enqueued.retain(|pid| *pid != packet_id);
        inner.inflight.shift_remove(&packet_id)
    }

    /// PUBREC received: the delivery now awaits PUBCOMP.
    pub fn move_in_flight_to_second_phase(&self, packet_id: NonZeroU16) -> bool {
        let mut inner = self.inner.lock();
        inner.enqueued.retain(|pid| *pid != packet_id);
        match inner.inflight.shift_remove(&packet_id) {
            Some(entry) => {
                inner.second_phase.insert(packet_id, entry);
                true
            }
            None => false,
        }
    }

    /// PUBCOMP received: the QoS 2 exchange is complete.
    pub fn second_phase_acknowledged(&self, packet_id: NonZeroU16) -> Option<InflightMessage> {
        self.inner.lock().second_phase.remove(&packet_id)
    }

    /// Diverts an inflight delivery to the enqueued queue and wakes the
    /// owning connection, if any.
    pub fn enqueue(&self, packet_id: NonZeroU16) {
        self.inner.lock().enqueued.push_back(packet_id);
        self.notify.notify_one();
    }

    /// Pops the next enqueued delivery still awaiting transmission.
    pub fn dequeue(&self) -> Option<(NonZeroU16, InflightMessage)> {
        let mut inner = self.inner.lock();
        while let Some(packet_id) = inner.enqueued.pop_front() {
            if let Some(entry) = inner.inflight.get(&packet_id) {
                return Some((packet_id, entry.clone()));
            }
        }
        None
    }

    /// Everything awaiting republish on reconnect, in original send order.
    pub fn stored_messages(&self) -> Vec<(NonZeroU16, InflightMessage)> {
        self.inner
            .lock()
            .inflight
            .iter()
            .map(|(packet_id, entry)| (*packet_id, entry.clone()))
            .collect()
    }

    pub fn enqueued_guids(&self) -> Vec<Uuid> {
        let inner = self.inner.lock();
        inner
            .enqueued
            .iter()
            .filter_map(|pid| inner.inflight.get(pid).and_then(|entry| entry.guid))
            .collect()
    }

    /// Marks a replayed message as dequeued.
    pub fn remove_enqueued(&self, guid: Uuid) {
        let mut inner = self.inner.lock();
        let matching = inner
            .enqueued
            .iter()
            .position(|pid| {
                inner
                    .inflight
                    .get(pid)
                    .map(|entry| entry.guid == Some(guid))
                    .unwrap_or_default()
            });
        if let Some(idx) = matching {
            inner.enqueued.remove(idx);
        }
    }

    /// Discards all transient state; the packet id counter survives.
    pub fn clean_session(&self) {
        let mut inner = self.inner.lock();
        inner.subscriptions.clear();
        inner.inflight.clear();
        inner.second_phase.clear();
        inner.enqueued.clear();
    }
}

#[async_trait::async_trait]
pub trait SessionStore: Send + Sync + 'static {
    async fn session_for_client(&self, client_id: &str) -> Result<Option<Arc<ClientSession>>>;

    /// Fails if a session with that id already exists.
    async fn create_new_session(
        &self,
        client_id: ByteString,
        clean_session: bool,
    ) -> Result<Arc<ClientSession>>;

    async fn remove_session(&self, client_id: &str) -> Result<bool>;

    async fn session_count(&self) -> Result<usize>;
}

#[derive(Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<ByteString, Arc<ClientSession>>>,
}

#[async_trait::async_trait]
impl SessionStore for MemorySessionStore {
    async fn session_for_client(&self, client_id: &str) -> Result<Option<Arc<ClientSession>>> {
        Ok(self.sessions.read().get(client_id).cloned())
    }

    async fn create_new_session(
        &self,
        client_id: ByteString,
        clean_session: bool,
    ) -> Result<Arc<ClientSession>> {
        let mut sessions = self.sessions.write();
        anyhow::ensure!(
            !sessions.contains_key(&client_id),
            "session already exists: {}",
            client_id
        );
        let session = Arc::new(ClientSession::new(client_id.clone(), clean_session));
        sessions.insert(client_id, session.clone());
        Ok(session)
    }

    async fn remove_session(&self, client_id: &str) -> Result<bool> {
        Ok(self.sessions.write().remove(client_id).is_some())
    }

    async fn session_count(&self) -> Result<usize> {
        Ok(self.sessions.read().len())
    }
}
