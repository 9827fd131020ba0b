use std::num::NonZeroU16;
use std::sync::Arc;

use anyhow::Result;
use bytestring::ByteString;
use codec::Qos;

use crate::message::Message;

/// Lifecycle notification fanned out to observers after the state change it
/// describes.
#[derive(Debug, Clone)]
pub enum BrokerEvent {
    ClientConnected {
        client_id: ByteString,
        clean_session: bool,
    },
    ClientDisconnected {
        client_id: ByteString,
    },
    ConnectionLost {
        client_id: ByteString,
    },
    MessagePublished {
        msg: Message,
    },
    TopicSubscribed {
        client_id: ByteString,
        filter: ByteString,
        qos: Qos,
    },
    TopicUnsubscribed {
        client_id: ByteString,
        filter: ByteString,
    },
    MessageAcknowledged {
        client_id: ByteString,
        packet_id: NonZeroU16,
    },
}

#[async_trait::async_trait]
pub trait Interceptor: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    async fn handle_event(&self, event: BrokerEvent) -> Result<()>;
}

/// Observer fan-out. Delivery is best-effort and unordered across observers;
/// each notification runs on its own task so the director never blocks on an
/// observer.
#[derive(Default)]
pub struct InterceptorBus {
    observers: Vec<Arc<dyn Interceptor>>,
}

impl InterceptorBus {
    pub fn new(observers: Vec<Arc<dyn Interceptor>>) -> Self {
        Self { observers }
    }

    pub fn notify(&self, event: BrokerEvent) {
        for observer in &self.observers {
            let observer = observer.clone();
            let event = event.clone();
            tokio::spawn(async move {
                if let Err(err) = observer.handle_event(event).await {
                    tracing::warn!(
                        interceptor = %observer.name(),
                        error = %err,
                        "failed to deliver broker event",
                    );
                }
            });
        }
    }
}
