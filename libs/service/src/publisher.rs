use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use bytestring::ByteString;
use codec::{Packet, Qos};
use uuid::Uuid;

use crate::interceptor::BrokerEvent;
use crate::message::{Message, WillMessage};
use crate::state::BrokerState;

/// Fan a message out to every matching subscription.
///
/// Overlapping filters are collapsed per client keeping the highest
/// requested QoS; each recipient then gets min(publisher QoS, requested).
pub(crate) async fn publish_to_subscribers(
    state: &Arc<BrokerState>,
    guid: Option<Uuid>,
    msg: &Message,
) -> Result<()> {
    let mut recipients: HashMap<ByteString, Qos> = HashMap::new();
    for (client_id, qos) in state.matcher.matches(msg.topic()) {
        recipients
            .entry(client_id)
            .and_modify(|requested| *requested = (*requested).max(qos))
            .or_insert(qos);
    }

    for (client_id, requested) in recipients {
        let effective = msg.qos().min(requested);
        deliver_to_subscriber(state, &client_id, guid, msg, effective, false).await?;
    }

    Ok(())
}

/// Deliver one message to one recipient at the given effective QoS.
///
/// QoS 0 goes straight to the channel and is dropped when the recipient is
/// offline or the channel is not writable. QoS >= 1 is recorded inflight
/// under a packet id from the recipient's session first; failed writes are
/// diverted to the session queue and resumed on reconnect or on the next
/// writable event.
pub(crate) async fn deliver_to_subscriber(
    state: &Arc<BrokerState>,
    client_id: &ByteString,
    guid: Option<Uuid>,
    msg: &Message,
    qos: Qos,
    retain: bool,
) -> Result<()> {
    if qos == Qos::AtMostOnce {
        let publish = msg.to_publish(qos, retain, None, false);
        let delivered = match state.registry.get(client_id) {
            Some(descriptor) => descriptor.deliver(Packet::Publish(publish)).is_ok(),
            None => false,
        };
        if !delivered {
            state.metrics.inc_msgs_dropped(1);
        }
        return Ok(());
    }

    let session = match state.sessions.session_for_client(client_id).await? {
        Some(session) => session,
        None => {
            // matched a subscription whose session is already gone
            state.metrics.inc_msgs_dropped(1);
            return Ok(());
        }
    };

    let packet_id = session.add_inflight(guid, qos, msg.clone());
    let publish = msg.to_publish(qos, retain, Some(packet_id), false);

    match state.registry.get(client_id) {
        Some(descriptor) => {
            if let Err(err) = descriptor.deliver(Packet::Publish(publish)) {
                tracing::debug!(
                    client_id = %client_id,
                    packet_id = packet_id.get(),
                    error = ?err,
                    "channel not writable, delivery enqueued",
                );
                session.enqueue(packet_id);
            }
        }
        None => session.enqueue(packet_id),
    }

    Ok(())
}

/// Publish a will testament through the normal fan-out path.
pub(crate) async fn publish_will(
    state: &Arc<BrokerState>,
    client_id: &ByteString,
    will: WillMessage,
) -> Result<()> {
    let msg = Message::from_will(client_id.clone(), &will);
    let guid = apply_retained(state, &msg, None).await?;

    let guid = match (guid, msg.qos()) {
        (None, Qos::AtMostOnce) => None,
        (None, _) => Some(state.messages.store_publish_for_future(msg.clone()).await?),
        (guid, _) => guid,
    };

    publish_to_subscribers(state, guid, &msg).await?;
    state
        .interceptors
        .notify(BrokerEvent::MessagePublished { msg });
    Ok(())
}

/// Retained-flag handling shared by the QoS handlers: an empty payload
/// clears the topic's retained slot, a non-empty one stores the message
/// (reusing `guid` when it is already persisted) and points the slot at it.
pub(crate) async fn apply_retained(
    state: &Arc<BrokerState>,
    msg: &Message,
    guid: Option<Uuid>,
) -> Result<Option<Uuid>> {
    if !msg.is_retain() {
        return Ok(guid);
    }

    if msg.is_empty() {
        state.messages.clean_retained(msg.topic()).await?;
        return Ok(guid);
    }

    let guid = match guid {
        Some(guid) => guid,
        None => state.messages.store_publish_for_future(msg.clone()).await?,
    };
    state.messages.store_retained(msg.topic(), guid).await?;
    Ok(Some(guid))
}
