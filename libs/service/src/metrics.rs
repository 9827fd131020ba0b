use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};

#[derive(Default)]
pub struct InternalMetrics {
    socket_connections: AtomicUsize,
    connection_count: AtomicUsize,
    msgs_received: AtomicUsize,
    msgs_sent: AtomicUsize,
    pub_msgs_received: AtomicUsize,
    pub_msgs_sent: AtomicUsize,
    msgs_dropped: AtomicUsize,
    bytes_received: AtomicUsize,
    bytes_sent: AtomicUsize,
}

#[derive(Debug, Copy, Clone, Default, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub socket_connections: usize,
    pub clients_connected: usize,
    pub messages_received: usize,
    pub messages_sent: usize,
    pub publish_messages_received: usize,
    pub publish_messages_sent: usize,
    pub publish_messages_dropped: usize,
    pub bytes_received: usize,
    pub bytes_sent: usize,
}

impl InternalMetrics {
    #[inline]
    pub fn inc_socket_connections(&self, n: usize) {
        self.socket_connections.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn dec_socket_connections(&self, n: usize) {
        self.socket_connections.fetch_sub(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_connection_count(&self, n: usize) {
        self.connection_count.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn dec_connection_count(&self, n: usize) {
        self.connection_count.fetch_sub(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_msgs_received(&self, n: usize) {
        self.msgs_received.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_msgs_sent(&self, n: usize) {
        self.msgs_sent.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_pub_msgs_received(&self, n: usize) {
        self.pub_msgs_received.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_pub_msgs_sent(&self, n: usize) {
        self.pub_msgs_sent.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_msgs_dropped(&self, n: usize) {
        self.msgs_dropped.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_bytes_received(&self, n: usize) {
        self.bytes_received.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_bytes_sent(&self, n: usize) {
        self.bytes_sent.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            socket_connections: self.socket_connections.load(Ordering::Relaxed),
            clients_connected: self.connection_count.load(Ordering::Relaxed),
            messages_received: self.msgs_received.load(Ordering::Relaxed),
            messages_sent: self.msgs_sent.load(Ordering::Relaxed),
            publish_messages_received: self.pub_msgs_received.load(Ordering::Relaxed),
            publish_messages_sent: self.pub_msgs_sent.load(Ordering::Relaxed),
            publish_messages_dropped: self.msgs_dropped.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
        }
    }
}
