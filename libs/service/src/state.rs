use std::collections::HashMap;
use std::num::NonZeroU16;
use std::sync::Arc;

use bytestring::ByteString;
use parking_lot::{Mutex, RwLock};

use crate::auth::{Authenticator, Authorizator};
use crate::config::BrokerConfig;
use crate::interceptor::InterceptorBus;
use crate::matcher::TopicMatcher;
use crate::message::WillMessage;
use crate::metrics::{InternalMetrics, MetricsSnapshot};
use crate::registry::ConnectionRegistry;
use crate::session::SessionStore;
use crate::store::MessageStore;

/// Subscribe-in-course guard phases, keyed by `(client id, packet id)`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum SubscribeGuard {
    Verified,
    Stored,
}

/// Everything shared across connections: the registry, the subscription
/// index, the stores, the will map and the observer bus.
pub struct BrokerState {
    pub(crate) config: BrokerConfig,
    pub(crate) registry: ConnectionRegistry,
    pub(crate) matcher: TopicMatcher,
    pub(crate) sessions: Box<dyn SessionStore>,
    pub(crate) messages: Box<dyn MessageStore>,
    pub(crate) interceptors: InterceptorBus,
    pub(crate) authenticator: Box<dyn Authenticator>,
    pub(crate) authorizator: Box<dyn Authorizator>,
    pub(crate) metrics: Arc<InternalMetrics>,
    wills: RwLock<HashMap<ByteString, WillMessage>>,
    sub_guards: Mutex<HashMap<(ByteString, NonZeroU16), SubscribeGuard>>,
}

impl BrokerState {
    pub fn new(
        config: BrokerConfig,
        sessions: Box<dyn SessionStore>,
        messages: Box<dyn MessageStore>,
        authenticator: Box<dyn Authenticator>,
        authorizator: Box<dyn Authorizator>,
        interceptors: InterceptorBus,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            registry: ConnectionRegistry::default(),
            matcher: TopicMatcher::default(),
            sessions,
            messages,
            interceptors,
            authenticator,
            authorizator,
            metrics: Arc::new(InternalMetrics::default()),
            wills: RwLock::new(HashMap::new()),
            sub_guards: Mutex::new(HashMap::new()),
        })
    }

    #[inline]
    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    #[inline]
    pub fn session_store(&self) -> &dyn SessionStore {
        &*self.sessions
    }

    #[inline]
    pub fn message_store(&self) -> &dyn MessageStore {
        &*self.messages
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub(crate) fn store_will(&self, client_id: ByteString, will: WillMessage) {
        self.wills.write().insert(client_id, will);
    }

    pub(crate) fn remove_will(&self, client_id: &str) -> Option<WillMessage> {
        self.wills.write().remove(client_id)
    }

    /// Admits a SUBSCRIBE into processing; a second insert for the same
    /// `(client id, packet id)` is a duplicate to be dropped.
    pub(crate) fn begin_subscribe(&self, client_id: ByteString, packet_id: NonZeroU16) -> bool {
        let mut guards = self.sub_guards.lock();
        match guards.get(&(client_id.clone(), packet_id)) {
            Some(_) => false,
            None => {
                guards.insert((client_id, packet_id), SubscribeGuard::Verified);
                true
            }
        }
    }

    pub(crate) fn advance_subscribe(&self, client_id: &ByteString, packet_id: NonZeroU16) -> bool {
        let mut guards = self.sub_guards.lock();
        match guards.get_mut(&(client_id.clone(), packet_id)) {
            Some(guard) if *guard == SubscribeGuard::Verified => {
                *guard = SubscribeGuard::Stored;
                true
            }
            _ => false,
        }
    }

    pub(crate) fn end_subscribe(&self, client_id: &ByteString, packet_id: NonZeroU16) {
        self.sub_guards
            .lock()
            .remove(&(client_id.clone(), packet_id));
    }
}
