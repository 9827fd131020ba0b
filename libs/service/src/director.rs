use std::fmt::{self, Display, Formatter};
use std::num::NonZeroU16;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytestring::ByteString;
use codec::{
    Codec, ConnAck, Connect, ConnectReturnCode, DecodeError, Packet, PubAck, PubComp, PubRec,
    PubRel, Publish, Qos, SubAck, Subscribe, SubscribeReturnCode, UnsubAck, Unsubscribe,
};
use fnv::FnvHashMap;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::Error;
use crate::filter::{self, TopicFilter};
use crate::interceptor::BrokerEvent;
use crate::message::{Message, WillMessage};
use crate::publisher;
use crate::registry::{ConnectionDescriptor, ConnectionState, Control};
use crate::session::ClientSession;
use crate::state::BrokerState;

#[derive(Debug, Clone)]
pub struct RemoteAddr {
    pub protocol: &'static str,
    pub addr: Option<String>,
}

impl Display for RemoteAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}://{}",
            self.protocol,
            self.addr.as_deref().unwrap_or("unknown")
        )
    }
}

struct Connection<R, W> {
    state: Arc<BrokerState>,
    remote_addr: RemoteAddr,
    codec: Codec<R, W>,
    /// Handed to the descriptor when CONNECT registers this connection.
    sink: Option<mpsc::Sender<Packet>>,
    control: Option<mpsc::UnboundedSender<Control>>,
    descriptor: Option<Arc<ConnectionDescriptor>>,
    session: Option<Arc<ClientSession>>,
    username: Option<ByteString>,
    keep_alive: u16,
    last_active: Instant,
    /// Inbound QoS 2 exchanges awaiting PUBREL, packet id to store guid.
    qos2_receiving: FnvHashMap<NonZeroU16, Uuid>,
    graceful: bool,
}

fn advance(
    descriptor: &ConnectionDescriptor,
    from: ConnectionState,
    to: ConnectionState,
) -> Result<(), Error> {
    if descriptor.transition(from, to) {
        Ok(())
    } else {
        Err(Error::StateTransition(from, to))
    }
}

impl<R, W> Connection<R, W>
where
    R: AsyncRead + Send + Unpin,
    W: AsyncWrite + Send + Unpin,
{
    async fn send_packet(&mut self, packet: &Packet) -> Result<(), Error> {
        tracing::debug!(
            remote_addr = %self.remote_addr,
            packet = ?packet,
            "send packet",
        );
        let size = self.codec.encode(packet).await?;
        self.state.metrics.inc_msgs_sent(1);
        self.state.metrics.inc_bytes_sent(size);
        if matches!(packet, Packet::Publish(_)) {
            self.state.metrics.inc_pub_msgs_sent(1);
        }
        Ok(())
    }

    async fn send_conn_ack(&mut self, return_code: ConnectReturnCode) -> Result<(), Error> {
        self.send_packet(&Packet::ConnAck(ConnAck {
            session_present: false,
            return_code,
        }))
        .await
    }

    fn session(&self) -> Result<Arc<ClientSession>, Error> {
        self.session
            .clone()
            .ok_or(Error::ProtocolViolation("no session"))
    }

    async fn handle_packet(&mut self, packet: Packet) -> Result<(), Error> {
        if let Some(descriptor) = &self.descriptor {
            // a descriptor that reached its final state discards everything
            if descriptor.state() == ConnectionState::Disconnected {
                return Ok(());
            }
        }

        match packet {
            Packet::Connect(connect) => self.handle_connect(connect).await,
            _ if self.descriptor.is_none() => {
                Err(Error::ProtocolViolation("expected CONNECT first"))
            }
            Packet::Publish(publish) => self.handle_publish(publish).await,
            Packet::PubAck(pub_ack) => self.handle_pub_ack(pub_ack).await,
            Packet::PubRec(pub_rec) => self.handle_pub_rec(pub_rec).await,
            Packet::PubRel(pub_rel) => self.handle_pub_rel(pub_rel).await,
            Packet::PubComp(pub_comp) => self.handle_pub_comp(pub_comp).await,
            Packet::Subscribe(subscribe) => self.handle_subscribe(subscribe).await,
            Packet::Unsubscribe(unsubscribe) => self.handle_unsubscribe(unsubscribe).await,
            Packet::PingReq => self.send_packet(&Packet::PingResp).await,
            Packet::Disconnect => self.handle_disconnect().await,
            Packet::ConnAck(_) | Packet::SubAck(_) | Packet::UnsubAck(_) | Packet::PingResp => {
                Err(Error::ProtocolViolation("unexpected packet"))
            }
        }
    }

    async fn handle_connect(&mut self, connect: Connect) -> Result<(), Error> {
        if self.descriptor.is_some() {
            return Err(Error::ProtocolViolation("duplicate CONNECT"));
        }

        // client id policy
        let client_id = if connect.client_id.is_empty() {
            if !connect.clean_session || !self.state.config.allow_zero_byte_client_id {
                self.send_conn_ack(ConnectReturnCode::IdentifierRejected)
                    .await?;
                return Err(Error::ProtocolViolation("zero byte client id rejected"));
            }
            let generated: ByteString = Uuid::new_v4().to_simple().to_string().into();
            tracing::debug!(
                remote_addr = %self.remote_addr,
                client_id = %generated,
                "assigned generated client id",
            );
            generated
        } else {
            connect.client_id.clone()
        };

        // authenticate
        let username = match &connect.login {
            Some(login) => {
                if login.password.is_empty() && !self.state.config.allow_anonymous {
                    self.send_conn_ack(ConnectReturnCode::BadUserNameOrPassword)
                        .await?;
                    return Err(Error::ProtocolViolation("password required"));
                }
                let valid = match self
                    .state
                    .authenticator
                    .check_valid(&client_id, &login.username, login.password.as_bytes())
                    .await
                {
                    Ok(valid) => valid,
                    Err(err) => {
                        tracing::error!(
                            error = %err,
                            "failed to call authenticator",
                        );
                        self.send_conn_ack(ConnectReturnCode::ServerUnavailable).await?;
                        return Err(Error::Storage(err));
                    }
                };
                if !valid {
                    self.send_conn_ack(ConnectReturnCode::BadUserNameOrPassword)
                        .await?;
                    return Err(Error::ProtocolViolation("bad credentials"));
                }
                Some(login.username.clone())
            }
            None => {
                if !self.state.config.allow_anonymous {
                    self.send_conn_ack(ConnectReturnCode::NotAuthorized).await?;
                    return Err(Error::ProtocolViolation("anonymous not allowed"));
                }
                None
            }
        };

        // register; a taken client id aborts the old connection and abandons
        // this CONNECT, leaving the retry to the client
        let descriptor = Arc::new(ConnectionDescriptor::new(
            client_id.clone(),
            connect.clean_session,
            self.sink.take().unwrap(),
            self.control.take().unwrap(),
        ));
        if let Some(existing) = self.state.registry.put_if_absent(descriptor.clone()) {
            tracing::debug!(
                remote_addr = %self.remote_addr,
                client_id = %client_id,
                "client id already connected, aborting the old connection",
            );
            self.state.registry.mark_reconnecting(&client_id);
            existing.abort();
            return Err(Error::ConnectAbandoned);
        }
        self.descriptor = Some(descriptor.clone());

        // idle handler fires at keep alive x 1.5
        self.keep_alive = connect.keep_alive;
        self.username = username;

        advance(
            &descriptor,
            ConnectionState::Disconnected,
            ConnectionState::SendAck,
        )?;
        let existing_session = self
            .state
            .sessions
            .session_for_client(&client_id)
            .await
            .map_err(Error::Storage)?;
        let session_present = !connect.clean_session && existing_session.is_some();
        self.send_packet(&Packet::ConnAck(ConnAck {
            session_present,
            return_code: ConnectReturnCode::Accepted,
        }))
        .await?;

        advance(
            &descriptor,
            ConnectionState::SendAck,
            ConnectionState::SessionCreated,
        )?;
        let session = match existing_session {
            Some(session) => {
                if connect.clean_session {
                    session.clean_session();
                    self.state.matcher.remove_all(&client_id);
                }
                session
            }
            None => self
                .state
                .sessions
                .create_new_session(client_id.clone(), connect.clean_session)
                .await
                .map_err(Error::Storage)?,
        };
        session.set_clean_session(connect.clean_session);

        // the will map always reflects the current connection's testament
        match &connect.last_will {
            Some(last_will) => self
                .state
                .store_will(client_id.clone(), WillMessage::from(last_will)),
            None => {
                self.state.remove_will(&client_id);
            }
        }

        advance(
            &descriptor,
            ConnectionState::SessionCreated,
            ConnectionState::MessagesRepublished,
        )?;
        if !connect.clean_session {
            for (packet_id, entry) in session.stored_messages() {
                let publish = entry.message.to_publish(entry.qos, false, Some(packet_id), true);
                self.send_packet(&Packet::Publish(publish)).await?;
                if let Some(guid) = entry.guid {
                    session.remove_enqueued(guid);
                }
            }
        }
        self.session = Some(session);

        advance(
            &descriptor,
            ConnectionState::MessagesRepublished,
            ConnectionState::Established,
        )?;
        self.state.metrics.inc_connection_count(1);
        self.state.interceptors.notify(BrokerEvent::ClientConnected {
            client_id: client_id.clone(),
            clean_session: connect.clean_session,
        });

        tracing::debug!(
            remote_addr = %self.remote_addr,
            client_id = %client_id,
            session_present = session_present,
            "client connected",
        );
        Ok(())
    }

    async fn handle_publish(&mut self, publish: Publish) -> Result<(), Error> {
        let session = self.session()?;
        let client_id = session.client_id().clone();

        self.state.metrics.inc_pub_msgs_received(1);

        if !filter::valid_topic(&publish.topic) {
            return Err(Error::ProtocolViolation("invalid publish topic"));
        }

        let authorized = match self
            .state
            .authorizator
            .can_write(&publish.topic, self.username.as_deref(), &client_id)
            .await
        {
            Ok(authorized) => authorized,
            Err(err) => {
                tracing::error!(
                    error = %err,
                    "failed to call authorizator",
                );
                false
            }
        };
        if !authorized {
            // the protocol has no negative acknowledgment for this
            tracing::debug!(
                client_id = %client_id,
                topic = %publish.topic,
                "publish not authorized, dropped",
            );
            self.state.metrics.inc_msgs_dropped(1);
            return Ok(());
        }

        let msg = Message::from_publish(client_id, &publish);

        match publish.qos {
            Qos::AtMostOnce => {
                let guid = publisher::apply_retained(&self.state, &msg, None)
                    .await
                    .map_err(Error::Storage)?;
                publisher::publish_to_subscribers(&self.state, guid, &msg)
                    .await
                    .map_err(Error::Storage)?;
                self.state
                    .interceptors
                    .notify(BrokerEvent::MessagePublished { msg });
            }
            Qos::AtLeastOnce => {
                let packet_id = publish.packet_id.unwrap();
                let guid = self
                    .state
                    .messages
                    .store_publish_for_future(msg.clone())
                    .await
                    .map_err(Error::Storage)?;
                publisher::apply_retained(&self.state, &msg, Some(guid))
                    .await
                    .map_err(Error::Storage)?;
                publisher::publish_to_subscribers(&self.state, Some(guid), &msg)
                    .await
                    .map_err(Error::Storage)?;
                self.send_packet(&Packet::PubAck(PubAck { packet_id })).await?;
                self.state
                    .interceptors
                    .notify(BrokerEvent::MessagePublished { msg });
            }
            Qos::ExactlyOnce => {
                let packet_id = publish.packet_id.unwrap();
                if self.qos2_receiving.contains_key(&packet_id) {
                    // retransmit of an exchange already in progress:
                    // acknowledge again, do not store or fan out twice
                    self.send_packet(&Packet::PubRec(PubRec { packet_id })).await?;
                    return Ok(());
                }
                let guid = self
                    .state
                    .messages
                    .store_publish_for_future(msg)
                    .await
                    .map_err(Error::Storage)?;
                self.qos2_receiving.insert(packet_id, guid);
                self.send_packet(&Packet::PubRec(PubRec { packet_id })).await?;
            }
        }

        Ok(())
    }

    async fn handle_pub_ack(&mut self, pub_ack: PubAck) -> Result<(), Error> {
        let session = self.session()?;
        match session.in_flight_acknowledged(pub_ack.packet_id) {
            Some(_) => {
                self.state
                    .interceptors
                    .notify(BrokerEvent::MessageAcknowledged {
                        client_id: session.client_id().clone(),
                        packet_id: pub_ack.packet_id,
                    });
            }
            None => tracing::debug!(
                remote_addr = %self.remote_addr,
                packet_id = pub_ack.packet_id.get(),
                "puback for unknown packet id",
            ),
        }
        Ok(())
    }

    async fn handle_pub_rec(&mut self, pub_rec: PubRec) -> Result<(), Error> {
        let session = self.session()?;
        if session.move_in_flight_to_second_phase(pub_rec.packet_id) {
            self.send_packet(&Packet::PubRel(PubRel {
                packet_id: pub_rec.packet_id,
            }))
            .await?;
        } else {
            tracing::debug!(
                remote_addr = %self.remote_addr,
                packet_id = pub_rec.packet_id.get(),
                "pubrec for unknown packet id",
            );
        }
        Ok(())
    }

    async fn handle_pub_rel(&mut self, pub_rel: PubRel) -> Result<(), Error> {
        match self.qos2_receiving.remove(&pub_rel.packet_id) {
            Some(guid) => {
                let msg = self
                    .state
                    .messages
                    .message_by_guid(guid)
                    .await
                    .map_err(Error::Storage)?;
                if let Some(msg) = msg {
                    publisher::apply_retained(&self.state, &msg, Some(guid))
                        .await
                        .map_err(Error::Storage)?;
                    publisher::publish_to_subscribers(&self.state, Some(guid), &msg)
                        .await
                        .map_err(Error::Storage)?;
                    self.state
                        .interceptors
                        .notify(BrokerEvent::MessagePublished { msg });
                }
            }
            None => tracing::debug!(
                remote_addr = %self.remote_addr,
                packet_id = pub_rel.packet_id.get(),
                "pubrel for unknown packet id",
            ),
        }

        // completion is idempotent
        self.send_packet(&Packet::PubComp(PubComp {
            packet_id: pub_rel.packet_id,
        }))
        .await
    }

    async fn handle_pub_comp(&mut self, pub_comp: PubComp) -> Result<(), Error> {
        let session = self.session()?;
        match session.second_phase_acknowledged(pub_comp.packet_id) {
            Some(_) => {
                self.state
                    .interceptors
                    .notify(BrokerEvent::MessageAcknowledged {
                        client_id: session.client_id().clone(),
                        packet_id: pub_comp.packet_id,
                    });
            }
            None => tracing::debug!(
                remote_addr = %self.remote_addr,
                packet_id = pub_comp.packet_id.get(),
                "pubcomp for unknown packet id",
            ),
        }
        Ok(())
    }

    async fn handle_subscribe(&mut self, subscribe: Subscribe) -> Result<(), Error> {
        let session = self.session()?;
        let client_id = session.client_id().clone();

        if !self
            .state
            .begin_subscribe(client_id.clone(), subscribe.packet_id)
        {
            tracing::debug!(
                remote_addr = %self.remote_addr,
                packet_id = subscribe.packet_id.get(),
                "duplicate subscribe in course, dropped",
            );
            return Ok(());
        }

        let mut return_codes = Vec::with_capacity(subscribe.filters.len());
        let mut granted = Vec::new();

        for requested in &subscribe.filters {
            if TopicFilter::try_new(&requested.path).is_none() {
                return_codes.push(SubscribeReturnCode::Failure);
                continue;
            }

            let authorized = match self
                .state
                .authorizator
                .can_read(&requested.path, self.username.as_deref(), &client_id)
                .await
            {
                Ok(authorized) => authorized,
                Err(err) => {
                    tracing::error!(
                        error = %err,
                        "failed to call authorizator",
                    );
                    false
                }
            };
            if !authorized {
                return_codes.push(SubscribeReturnCode::Failure);
                continue;
            }

            return_codes.push(SubscribeReturnCode::granted(requested.qos));
            granted.push((requested.path.clone(), requested.qos));
        }

        if !self.state.advance_subscribe(&client_id, subscribe.packet_id) {
            self.state.end_subscribe(&client_id, subscribe.packet_id);
            return Err(Error::ProtocolViolation("subscribe guard lost"));
        }

        for (path, qos) in &granted {
            session.subscribe(path.clone(), *qos);
            self.state.matcher.insert(path, client_id.clone(), *qos);
        }

        self.send_packet(&Packet::SubAck(SubAck {
            packet_id: subscribe.packet_id,
            return_codes,
        }))
        .await?;

        for (path, qos) in &granted {
            self.state.interceptors.notify(BrokerEvent::TopicSubscribed {
                client_id: client_id.clone(),
                filter: path.clone(),
                qos: *qos,
            });

            // replay retained matches at min(stored, requested)
            let retained = self
                .state
                .messages
                .search_matching(path)
                .await
                .map_err(Error::Storage)?;
            for (guid, msg) in retained {
                let effective = msg.qos().min(*qos);
                publisher::deliver_to_subscriber(
                    &self.state,
                    &client_id,
                    Some(guid),
                    &msg,
                    effective,
                    true,
                )
                .await
                .map_err(Error::Storage)?;
            }
        }

        self.state.end_subscribe(&client_id, subscribe.packet_id);
        Ok(())
    }

    async fn handle_unsubscribe(&mut self, unsubscribe: Unsubscribe) -> Result<(), Error> {
        let session = self.session()?;
        let client_id = session.client_id().clone();

        // an invalid filter in UNSUBSCRIBE is a protocol violation
        for path in &unsubscribe.filters {
            if TopicFilter::try_new(path).is_none() {
                return Err(Error::ProtocolViolation("invalid unsubscribe filter"));
            }
        }

        for path in &unsubscribe.filters {
            self.state.matcher.remove(path, &client_id);
            session.unsubscribe_from(path);
            self.state
                .interceptors
                .notify(BrokerEvent::TopicUnsubscribed {
                    client_id: client_id.clone(),
                    filter: path.clone(),
                });
        }

        self.send_packet(&Packet::UnsubAck(UnsubAck {
            packet_id: unsubscribe.packet_id,
        }))
        .await
    }

    async fn handle_disconnect(&mut self) -> Result<(), Error> {
        let descriptor = self
            .descriptor
            .clone()
            .ok_or(Error::ProtocolViolation("no descriptor"))?;
        let session = self.session()?;
        let client_id = descriptor.client_id().clone();

        advance(
            &descriptor,
            ConnectionState::Established,
            ConnectionState::SubscriptionsRemoved,
        )?;
        if descriptor.clean_session() {
            session.wipe_subscriptions();
            self.state.matcher.remove_all(&client_id);
        }

        advance(
            &descriptor,
            ConnectionState::SubscriptionsRemoved,
            ConnectionState::MessagesDropped,
        )?;
        if descriptor.clean_session() {
            self.state
                .messages
                .drop_messages_in_session(&client_id)
                .await
                .map_err(Error::Storage)?;
        }

        advance(
            &descriptor,
            ConnectionState::MessagesDropped,
            ConnectionState::InterceptorsNotified,
        )?;
        self.state
            .interceptors
            .notify(BrokerEvent::ClientDisconnected {
                client_id: client_id.clone(),
            });

        advance(
            &descriptor,
            ConnectionState::InterceptorsNotified,
            ConnectionState::Disconnected,
        )?;

        // graceful disconnect must not publish the will
        self.state.remove_will(&client_id);
        self.state.registry.remove_if_same(&descriptor);
        if descriptor.clean_session() {
            self.state
                .sessions
                .remove_session(&client_id)
                .await
                .map_err(Error::Storage)?;
        }
        self.state.metrics.dec_connection_count(1);
        self.graceful = true;

        tracing::debug!(
            remote_addr = %self.remote_addr,
            client_id = %client_id,
            "client disconnected",
        );
        Err(Error::ClientDisconnect)
    }

    async fn drain_enqueued(&mut self) -> Result<(), Error> {
        let session = match &self.session {
            Some(session) => session.clone(),
            None => return Ok(()),
        };
        while let Some((packet_id, entry)) = session.dequeue() {
            let publish = entry.message.to_publish(entry.qos, false, Some(packet_id), false);
            self.send_packet(&Packet::Publish(publish)).await?;
        }
        Ok(())
    }

    async fn process_connection_lost(&mut self) {
        let descriptor = match self.descriptor.take() {
            Some(descriptor) => descriptor,
            None => return,
        };
        let client_id = descriptor.client_id().clone();

        self.state.registry.remove_if_same(&descriptor);
        if descriptor.state() == ConnectionState::Established {
            self.state.metrics.dec_connection_count(1);
        }

        if self.state.registry.take_reconnecting(&client_id) {
            // the loss was forced by a newer CONNECT for this id
            tracing::debug!(
                remote_addr = %self.remote_addr,
                client_id = %client_id,
                "connection displaced, will suppressed",
            );
            if self.state.registry.get(&client_id).is_none() {
                self.state.remove_will(&client_id);
            }
        } else if let Some(will) = self.state.remove_will(&client_id) {
            tracing::debug!(
                client_id = %client_id,
                topic = %will.topic,
                "publish will message",
            );
            if let Err(err) = publisher::publish_will(&self.state, &client_id, will).await {
                tracing::error!(
                    error = %err,
                    "failed to publish will message",
                );
            }
        }

        self.state.interceptors.notify(BrokerEvent::ConnectionLost {
            client_id: client_id.clone(),
        });

        if descriptor.clean_session() && self.state.registry.get(&client_id).is_none() {
            self.state.sessions.remove_session(&client_id).await.ok();
            self.state.matcher.remove_all(&client_id);
        }
    }
}

/// Drives one client channel: decodes inbound packets, dispatches them to
/// the handlers, pumps fan-out deliveries from the outbound channel, and
/// enforces keep-alive and the flush cadence. Ordering per channel is
/// guaranteed by processing one packet at a time.
pub async fn client_loop(
    state: Arc<BrokerState>,
    reader: impl AsyncRead + Send + Unpin,
    writer: impl AsyncWrite + Send + Unpin,
    remote_addr: RemoteAddr,
) {
    state.metrics.inc_socket_connections(1);

    let (sink_sender, mut sink_receiver) = mpsc::channel(state.config.outbound_queue.max(1));
    let (control_sender, mut control_receiver) = mpsc::unbounded_channel();

    let mut connection = Connection {
        state: state.clone(),
        remote_addr,
        codec: Codec::new(reader, writer),
        sink: Some(sink_sender),
        control: Some(control_sender),
        descriptor: None,
        session: None,
        username: None,
        keep_alive: 60,
        last_active: Instant::now(),
        qos2_receiving: FnvHashMap::default(),
        graceful: false,
    };
    connection.codec.set_input_max_size(state.config.max_packet_size);

    let mut keep_alive_interval = tokio::time::interval(Duration::from_secs(1));
    let mut flush_interval =
        tokio::time::interval(Duration::from_millis(state.config.flush_interval_ms.max(1)));

    let result: Result<(), Error> = loop {
        let notify = connection.session.as_ref().map(|session| session.notify());

        let res = tokio::select! {
            _ = keep_alive_interval.tick() => {
                if connection.keep_alive > 0
                    && connection.last_active.elapsed().as_secs()
                        > connection.keep_alive as u64 * 3 / 2
                {
                    tracing::debug!(
                        remote_addr = %connection.remote_addr,
                        "keep alive timeout",
                    );
                    break Err(Error::KeepAliveTimeout);
                }
                Ok(())
            }
            _ = flush_interval.tick() => {
                // writes that did not get an explicit flush
                connection.codec.flush().await.map_err(Error::from)
            }
            res = connection.codec.decode() => {
                match res {
                    Ok(Some((packet, packet_size))) => {
                        connection.state.metrics.inc_bytes_received(packet_size);
                        connection.state.metrics.inc_msgs_received(1);
                        connection.last_active = Instant::now();
                        tracing::debug!(
                            remote_addr = %connection.remote_addr,
                            packet = ?packet,
                            "receive packet",
                        );
                        match connection.handle_packet(packet).await {
                            Ok(()) => connection.codec.flush().await.map_err(Error::from),
                            Err(err) => Err(err),
                        }
                    }
                    Ok(None) => break Err(Error::Closed),
                    Err(DecodeError::UnsupportedProtocolLevel(level)) => {
                        tracing::debug!(
                            remote_addr = %connection.remote_addr,
                            level = level,
                            "unacceptable protocol version",
                        );
                        connection
                            .send_conn_ack(ConnectReturnCode::UnacceptableProtocolVersion)
                            .await
                            .ok();
                        break Err(Error::ProtocolViolation("unacceptable protocol version"));
                    }
                    Err(err) => {
                        tracing::debug!(
                            remote_addr = %connection.remote_addr,
                            error = %err,
                            "decode packet",
                        );
                        break Err(Error::Closed);
                    }
                }
            }
            packet = sink_receiver.recv() => {
                match packet {
                    Some(packet) => match connection.send_packet(&packet).await {
                        Ok(()) => connection.codec.flush().await.map_err(Error::from),
                        Err(err) => Err(err),
                    },
                    None => break Err(Error::Closed),
                }
            }
            control = control_receiver.recv() => {
                match control {
                    Some(Control::Abort) => break Err(Error::Displaced),
                    None => break Err(Error::Closed),
                }
            }
            _ = async {
                match &notify {
                    Some(notify) => notify.notified().await,
                    None => std::future::pending::<()>().await,
                }
            } => {
                match connection.drain_enqueued().await {
                    Ok(()) => connection.codec.flush().await.map_err(Error::from),
                    Err(err) => Err(err),
                }
            }
        };

        if let Err(err) = res {
            break Err(err);
        }
    };

    if let Err(err) = &result {
        match err {
            Error::ClientDisconnect | Error::Closed => {}
            err => tracing::debug!(
                remote_addr = %connection.remote_addr,
                error = %err,
                "connection ended",
            ),
        }
    }

    // push out anything pending, CONNACK rejections included
    connection.codec.flush().await.ok();

    if !connection.graceful {
        connection.process_connection_lost().await;
    }

    state.metrics.dec_socket_connections(1);
}
