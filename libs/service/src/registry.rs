use std::collections::{HashMap, HashSet};
use std::convert::TryFrom;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use bytestring::ByteString;
use codec::Packet;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Connection lifecycle phases. Every transition is compare-and-set; a
/// failed transition aborts the whole handler without partial side effects.
#[derive(Debug, Copy, Clone, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    SendAck,
    SessionCreated,
    MessagesRepublished,
    Established,
    SubscriptionsRemoved,
    MessagesDropped,
    InterceptorsNotified,
}

#[derive(Debug)]
pub enum Control {
    /// Close the connection; a newer CONNECT claimed this client id.
    Abort,
}

#[derive(Debug)]
pub enum DeliverError {
    /// The outbound channel is at capacity; the channel is not writable.
    ChannelFull,
    /// The connection loop is gone.
    Closed,
}

/// Live connection handle shared between the registry and fan-out. The
/// channel is owned here and closed only through `abort` or the loop ending.
pub struct ConnectionDescriptor {
    client_id: ByteString,
    clean_session: bool,
    state: AtomicU8,
    sink: mpsc::Sender<Packet>,
    control: mpsc::UnboundedSender<Control>,
}

impl ConnectionDescriptor {
    pub fn new(
        client_id: ByteString,
        clean_session: bool,
        sink: mpsc::Sender<Packet>,
        control: mpsc::UnboundedSender<Control>,
    ) -> Self {
        Self {
            client_id,
            clean_session,
            state: AtomicU8::new(ConnectionState::Disconnected.into()),
            sink,
            control,
        }
    }

    #[inline]
    pub fn client_id(&self) -> &ByteString {
        &self.client_id
    }

    #[inline]
    pub fn clean_session(&self) -> bool {
        self.clean_session
    }

    #[inline]
    pub fn state(&self) -> ConnectionState {
        ConnectionState::try_from(self.state.load(Ordering::Acquire)).unwrap()
    }

    /// Compare-and-set phase advance.
    pub fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        self.state
            .compare_exchange(from.into(), to.into(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Asks the owning loop to close the channel.
    pub fn abort(&self) {
        self.control.send(Control::Abort).ok();
    }

    /// Non-blocking write onto the connection's outbound channel.
    pub fn deliver(&self, packet: Packet) -> Result<(), DeliverError> {
        self.sink.try_send(packet).map_err(|err| match err {
            TrySendError::Full(_) => DeliverError::ChannelFull,
            TrySendError::Closed(_) => DeliverError::Closed,
        })
    }
}

/// Maps client id to its single live connection.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<ByteString, Arc<ConnectionDescriptor>>>,
    /// Client ids whose old descriptor was aborted by a newer CONNECT; the
    /// loss handler of the old channel consumes the entry and skips the
    /// will.
    reconnecting: Mutex<HashSet<ByteString>>,
}

impl ConnectionRegistry {
    /// The single admission primitive. Returns the already-registered
    /// descriptor without inserting when the id is taken.
    pub fn put_if_absent(
        &self,
        descriptor: Arc<ConnectionDescriptor>,
    ) -> Option<Arc<ConnectionDescriptor>> {
        let mut connections = self.connections.write();
        match connections.get(descriptor.client_id()) {
            Some(existing) => Some(existing.clone()),
            None => {
                connections.insert(descriptor.client_id().clone(), descriptor);
                None
            }
        }
    }

    pub fn get(&self, client_id: &str) -> Option<Arc<ConnectionDescriptor>> {
        self.connections.read().get(client_id).cloned()
    }

    /// Removes by identity, so a loss handler cannot evict the descriptor a
    /// newer connection registered in the meantime.
    pub fn remove_if_same(&self, descriptor: &Arc<ConnectionDescriptor>) -> bool {
        let mut connections = self.connections.write();
        match connections.get(descriptor.client_id()) {
            Some(existing) if Arc::ptr_eq(existing, descriptor) => {
                connections.remove(descriptor.client_id());
                true
            }
            _ => false,
        }
    }

    pub fn mark_reconnecting(&self, client_id: &ByteString) {
        self.reconnecting.lock().insert(client_id.clone());
    }

    pub fn take_reconnecting(&self, client_id: &str) -> bool {
        self.reconnecting.lock().remove(client_id)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(client_id: &str) -> Arc<ConnectionDescriptor> {
        let (sink, _sink_rx) = mpsc::channel(1);
        let (control, _control_rx) = mpsc::unbounded_channel();
        Arc::new(ConnectionDescriptor::new(
            client_id.into(),
            false,
            sink,
            control,
        ))
    }

    #[test]
    fn test_transition_is_compare_and_set() {
        let desc = descriptor("cli");
        assert_eq!(desc.state(), ConnectionState::Disconnected);

        assert!(desc.transition(ConnectionState::Disconnected, ConnectionState::SendAck));
        assert_eq!(desc.state(), ConnectionState::SendAck);

        // repeating the same transition fails without side effects
        assert!(!desc.transition(ConnectionState::Disconnected, ConnectionState::SendAck));
        assert_eq!(desc.state(), ConnectionState::SendAck);

        assert!(desc.transition(ConnectionState::SendAck, ConnectionState::SessionCreated));
    }

    #[test]
    fn test_put_if_absent() {
        let registry = ConnectionRegistry::default();
        let first = descriptor("cli");
        let second = descriptor("cli");

        assert!(registry.put_if_absent(first.clone()).is_none());
        let existing = registry.put_if_absent(second.clone()).unwrap();
        assert!(Arc::ptr_eq(&existing, &first));
        assert_eq!(registry.connection_count(), 1);
    }

    #[test]
    fn test_remove_if_same_is_by_identity() {
        let registry = ConnectionRegistry::default();
        let stale = descriptor("cli");
        let current = descriptor("cli");

        assert!(registry.put_if_absent(current.clone()).is_none());
        assert!(!registry.remove_if_same(&stale), "stale handle must not evict");
        assert_eq!(registry.connection_count(), 1);
        assert!(registry.remove_if_same(&current));
        assert_eq!(registry.connection_count(), 0);
    }

    #[test]
    fn test_reconnecting_entry_is_consumed_once() {
        let registry = ConnectionRegistry::default();
        registry.mark_reconnecting(&"cli".into());
        assert!(registry.take_reconnecting("cli"));
        assert!(!registry.take_reconnecting("cli"));
    }
}
