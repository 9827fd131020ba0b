use std::num::NonZeroU16;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use codec::{
    Codec, Connect, ConnectReturnCode, LastWill, Login, Packet, ProtocolLevel, PubAck, PubComp,
    PubRec, PubRel, Publish, Qos, Subscribe, SubscribeFilter, SubscribeReturnCode, Unsubscribe,
};
use velour_service::{
    client_loop, AcceptAllAuthenticator, BrokerConfig, BrokerState, InterceptorBus,
    MemoryMessageStore, MemorySessionStore, PermitAllAuthorizator, RemoteAddr,
};
use tokio::io::{DuplexStream, ReadHalf, WriteHalf};
use tokio::time::timeout;

type ClientCodec = Codec<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>;

fn pid(n: u16) -> NonZeroU16 {
    NonZeroU16::new(n).unwrap()
}

fn broker(config: BrokerConfig) -> Arc<BrokerState> {
    BrokerState::new(
        config,
        Box::new(MemorySessionStore::default()),
        Box::new(MemoryMessageStore::default()),
        Box::new(AcceptAllAuthenticator),
        Box::new(PermitAllAuthorizator),
        InterceptorBus::default(),
    )
}

async fn open(state: &Arc<BrokerState>) -> ClientCodec {
    let (client, server) = tokio::io::duplex(8192);
    let (client_reader, client_writer) = tokio::io::split(client);
    let (server_reader, server_writer) = tokio::io::split(server);
    let state = state.clone();
    tokio::spawn(async move {
        client_loop(
            state,
            server_reader,
            server_writer,
            RemoteAddr {
                protocol: "test",
                addr: None,
            },
        )
        .await;
    });
    Codec::new(client_reader, client_writer)
}

async fn send(codec: &mut ClientCodec, packet: Packet) {
    codec.encode(&packet).await.unwrap();
    codec.flush().await.unwrap();
}

async fn recv(codec: &mut ClientCodec) -> Packet {
    match timeout(Duration::from_secs(5), codec.decode()).await {
        Ok(Ok(Some((packet, _)))) => packet,
        Ok(Ok(None)) => panic!("connection closed while waiting for a packet"),
        Ok(Err(err)) => panic!("decode: {}", err),
        Err(_) => panic!("timed out waiting for a packet"),
    }
}

async fn recv_closed(codec: &mut ClientCodec) {
    match timeout(Duration::from_secs(5), codec.decode()).await {
        Ok(Ok(None)) => {}
        Ok(Ok(Some((packet, _)))) => panic!("expected close, got: {:?}", packet),
        Ok(Err(err)) => panic!("decode: {}", err),
        Err(_) => panic!("timed out waiting for close"),
    }
}

async fn assert_no_packet(codec: &mut ClientCodec) {
    match timeout(Duration::from_millis(700), codec.decode()).await {
        Err(_) => {}
        Ok(Ok(Some((packet, _)))) => panic!("unexpected packet: {:?}", packet),
        Ok(Ok(None)) => panic!("connection closed unexpectedly"),
        Ok(Err(err)) => panic!("decode: {}", err),
    }
}

fn connect_packet(client_id: &str, clean_session: bool) -> Connect {
    Connect {
        level: ProtocolLevel::V4,
        keep_alive: 0,
        clean_session,
        client_id: client_id.into(),
        last_will: None,
        login: None,
    }
}

/// Opens a connection and completes the handshake.
async fn connect(state: &Arc<BrokerState>, client_id: &str, clean_session: bool) -> ClientCodec {
    let mut codec = open(state).await;
    send(&mut codec, Packet::Connect(connect_packet(client_id, clean_session))).await;
    match recv(&mut codec).await {
        Packet::ConnAck(conn_ack) => {
            assert_eq!(conn_ack.return_code, ConnectReturnCode::Accepted)
        }
        packet => panic!("expected CONNACK, got: {:?}", packet),
    }
    codec
}

async fn subscribe(codec: &mut ClientCodec, packet_id: u16, path: &str, qos: Qos) {
    send(
        codec,
        Packet::Subscribe(Subscribe {
            packet_id: pid(packet_id),
            filters: vec![SubscribeFilter {
                path: path.into(),
                qos,
            }],
        }),
    )
    .await;
    match recv(codec).await {
        Packet::SubAck(sub_ack) => {
            assert_eq!(sub_ack.packet_id, pid(packet_id));
            assert_ne!(sub_ack.return_codes[0], SubscribeReturnCode::Failure);
        }
        packet => panic!("expected SUBACK, got: {:?}", packet),
    }
}

fn publish_packet(topic: &str, payload: &'static [u8], qos: Qos, packet_id: Option<u16>) -> Publish {
    Publish {
        dup: false,
        qos,
        retain: false,
        topic: topic.into(),
        packet_id: packet_id.map(pid),
        payload: Bytes::from_static(payload),
    }
}

#[tokio::test]
async fn anonymous_disabled_rejects_connect_without_credentials() {
    let state = broker(BrokerConfig {
        allow_anonymous: false,
        ..BrokerConfig::default()
    });

    let mut codec = open(&state).await;
    send(&mut codec, Packet::Connect(connect_packet("cli", true))).await;

    match recv(&mut codec).await {
        Packet::ConnAck(conn_ack) => {
            assert_eq!(conn_ack.return_code, ConnectReturnCode::NotAuthorized);
            assert!(!conn_ack.session_present);
        }
        packet => panic!("expected CONNACK, got: {:?}", packet),
    }
    recv_closed(&mut codec).await;
}

#[tokio::test]
async fn anonymous_disabled_accepts_credentials() {
    let state = broker(BrokerConfig {
        allow_anonymous: false,
        ..BrokerConfig::default()
    });

    let mut codec = open(&state).await;
    let mut connect = connect_packet("cli", true);
    connect.login = Some(Login {
        username: "jo".into(),
        password: "secret".into(),
    });
    send(&mut codec, Packet::Connect(connect)).await;

    match recv(&mut codec).await {
        Packet::ConnAck(conn_ack) => {
            assert_eq!(conn_ack.return_code, ConnectReturnCode::Accepted)
        }
        packet => panic!("expected CONNACK, got: {:?}", packet),
    }
}

#[tokio::test]
async fn zero_byte_client_id_policy() {
    // policy disabled: rejected
    let state = broker(BrokerConfig::default());
    let mut codec = open(&state).await;
    send(&mut codec, Packet::Connect(connect_packet("", true))).await;
    match recv(&mut codec).await {
        Packet::ConnAck(conn_ack) => {
            assert_eq!(conn_ack.return_code, ConnectReturnCode::IdentifierRejected)
        }
        packet => panic!("expected CONNACK, got: {:?}", packet),
    }
    recv_closed(&mut codec).await;

    // policy enabled, clean session: a server-generated id is assigned
    let state = broker(BrokerConfig {
        allow_zero_byte_client_id: true,
        ..BrokerConfig::default()
    });
    let mut codec = open(&state).await;
    send(&mut codec, Packet::Connect(connect_packet("", true))).await;
    match recv(&mut codec).await {
        Packet::ConnAck(conn_ack) => {
            assert_eq!(conn_ack.return_code, ConnectReturnCode::Accepted);
            assert!(!conn_ack.session_present);
        }
        packet => panic!("expected CONNACK, got: {:?}", packet),
    }
    assert_eq!(state.session_store().session_count().await.unwrap(), 1);

    // even with the policy enabled, a persistent session needs a real id
    let mut codec = open(&state).await;
    send(&mut codec, Packet::Connect(connect_packet("", false))).await;
    match recv(&mut codec).await {
        Packet::ConnAck(conn_ack) => {
            assert_eq!(conn_ack.return_code, ConnectReturnCode::IdentifierRejected)
        }
        packet => panic!("expected CONNACK, got: {:?}", packet),
    }
    recv_closed(&mut codec).await;
}

#[tokio::test]
async fn retained_message_replayed_at_min_qos() {
    let state = broker(BrokerConfig::default());

    let mut publisher = connect(&state, "pub", true).await;
    send(
        &mut publisher,
        Packet::Publish(Publish {
            retain: true,
            ..publish_packet("a/b", b"x", Qos::AtLeastOnce, Some(1))
        }),
    )
    .await;
    assert_eq!(
        recv(&mut publisher).await,
        Packet::PubAck(PubAck { packet_id: pid(1) })
    );

    let mut subscriber = connect(&state, "sub", true).await;
    subscribe(&mut subscriber, 2, "a/+", Qos::ExactlyOnce).await;

    match recv(&mut subscriber).await {
        Packet::Publish(publish) => {
            assert_eq!(&*publish.topic, "a/b");
            assert_eq!(&*publish.payload, b"x");
            // min of stored qos 1 and requested qos 2
            assert_eq!(publish.qos, Qos::AtLeastOnce);
            assert!(publish.retain);
            send(
                &mut subscriber,
                Packet::PubAck(PubAck {
                    packet_id: publish.packet_id.unwrap(),
                }),
            )
            .await;
        }
        packet => panic!("expected PUBLISH, got: {:?}", packet),
    }
}

#[tokio::test]
async fn empty_retained_payload_clears_the_slot() {
    let state = broker(BrokerConfig::default());

    let mut publisher = connect(&state, "pub", true).await;
    send(
        &mut publisher,
        Packet::Publish(Publish {
            retain: true,
            ..publish_packet("a/b", b"x", Qos::AtMostOnce, None)
        }),
    )
    .await;
    send(
        &mut publisher,
        Packet::Publish(Publish {
            retain: true,
            ..publish_packet("a/b", b"", Qos::AtMostOnce, None)
        }),
    )
    .await;

    // ping round-trip so both publishes are processed before subscribing
    send(&mut publisher, Packet::PingReq).await;
    assert_eq!(recv(&mut publisher).await, Packet::PingResp);

    let mut subscriber = connect(&state, "sub", true).await;
    subscribe(&mut subscriber, 1, "a/#", Qos::AtLeastOnce).await;
    assert_no_packet(&mut subscriber).await;
}

#[tokio::test]
async fn will_published_on_ungraceful_loss() {
    let state = broker(BrokerConfig::default());

    let mut doomed = open(&state).await;
    let mut connect_a = connect_packet("doomed", true);
    connect_a.last_will = Some(LastWill {
        topic: "bye".into(),
        payload: Bytes::from_static(b"gone"),
        qos: Qos::AtLeastOnce,
        retain: false,
    });
    send(&mut doomed, Packet::Connect(connect_a)).await;
    assert!(matches!(recv(&mut doomed).await, Packet::ConnAck(_)));

    let mut watcher = connect(&state, "watcher", true).await;
    subscribe(&mut watcher, 1, "bye", Qos::AtLeastOnce).await;

    // reset the publisher's transport
    drop(doomed);

    match recv(&mut watcher).await {
        Packet::Publish(publish) => {
            assert_eq!(&*publish.topic, "bye");
            assert_eq!(&*publish.payload, b"gone");
            assert_eq!(publish.qos, Qos::AtLeastOnce);
            send(
                &mut watcher,
                Packet::PubAck(PubAck {
                    packet_id: publish.packet_id.unwrap(),
                }),
            )
            .await;
        }
        packet => panic!("expected will PUBLISH, got: {:?}", packet),
    }
}

#[tokio::test]
async fn will_not_published_on_graceful_disconnect() {
    let state = broker(BrokerConfig::default());

    let mut leaver = open(&state).await;
    let mut connect_a = connect_packet("leaver", true);
    connect_a.last_will = Some(LastWill {
        topic: "bye".into(),
        payload: Bytes::from_static(b"gone"),
        qos: Qos::AtMostOnce,
        retain: false,
    });
    send(&mut leaver, Packet::Connect(connect_a)).await;
    assert!(matches!(recv(&mut leaver).await, Packet::ConnAck(_)));

    let mut watcher = connect(&state, "watcher", true).await;
    subscribe(&mut watcher, 1, "bye", Qos::AtMostOnce).await;

    send(&mut leaver, Packet::Disconnect).await;
    recv_closed(&mut leaver).await;

    assert_no_packet(&mut watcher).await;
}

#[tokio::test]
async fn displaced_connect_suppresses_the_will() {
    let state = broker(BrokerConfig::default());

    // first connection for "shared", persistent session, with a will
    let mut first = open(&state).await;
    let mut connect_a = connect_packet("shared", false);
    connect_a.last_will = Some(LastWill {
        topic: "bye".into(),
        payload: Bytes::from_static(b"gone"),
        qos: Qos::AtLeastOnce,
        retain: false,
    });
    send(&mut first, Packet::Connect(connect_a)).await;
    assert!(matches!(recv(&mut first).await, Packet::ConnAck(_)));

    let mut watcher = connect(&state, "watcher", true).await;
    subscribe(&mut watcher, 1, "bye", Qos::AtLeastOnce).await;

    // a newer CONNECT with the same id: the registry aborts the old channel
    // and abandons this attempt, so the client retries
    let mut second = open(&state).await;
    send(&mut second, Packet::Connect(connect_packet("shared", false))).await;
    recv_closed(&mut second).await;
    recv_closed(&mut first).await;

    let mut retry = open(&state).await;
    send(&mut retry, Packet::Connect(connect_packet("shared", false))).await;
    match recv(&mut retry).await {
        Packet::ConnAck(conn_ack) => {
            assert_eq!(conn_ack.return_code, ConnectReturnCode::Accepted);
            assert!(conn_ack.session_present, "the stored session survived");
        }
        packet => panic!("expected CONNACK, got: {:?}", packet),
    }

    // the displaced connection's will must not fire
    assert_no_packet(&mut watcher).await;
}

#[tokio::test]
async fn qos2_duplicate_publish_is_not_fanned_out_twice() {
    let state = broker(BrokerConfig::default());

    let mut subscriber = connect(&state, "sub", true).await;
    subscribe(&mut subscriber, 1, "t", Qos::ExactlyOnce).await;

    let mut publisher = connect(&state, "pub", true).await;
    send(
        &mut publisher,
        Packet::Publish(publish_packet("t", b"x", Qos::ExactlyOnce, Some(10))),
    )
    .await;
    assert_eq!(
        recv(&mut publisher).await,
        Packet::PubRec(PubRec { packet_id: pid(10) })
    );

    // retransmit with the dup flag: acknowledged again, no second exchange
    send(
        &mut publisher,
        Packet::Publish(Publish {
            dup: true,
            ..publish_packet("t", b"x", Qos::ExactlyOnce, Some(10))
        }),
    )
    .await;
    assert_eq!(
        recv(&mut publisher).await,
        Packet::PubRec(PubRec { packet_id: pid(10) })
    );

    // nothing reaches the subscriber before PUBREL
    assert_no_packet(&mut subscriber).await;

    send(&mut publisher, Packet::PubRel(PubRel { packet_id: pid(10) })).await;
    assert_eq!(
        recv(&mut publisher).await,
        Packet::PubComp(PubComp { packet_id: pid(10) })
    );

    // exactly one delivery, completed with the full second phase
    let delivery_pid = match recv(&mut subscriber).await {
        Packet::Publish(publish) => {
            assert_eq!(publish.qos, Qos::ExactlyOnce);
            assert_eq!(&*publish.payload, b"x");
            publish.packet_id.unwrap()
        }
        packet => panic!("expected PUBLISH, got: {:?}", packet),
    };
    send(
        &mut subscriber,
        Packet::PubRec(PubRec {
            packet_id: delivery_pid,
        }),
    )
    .await;
    assert_eq!(
        recv(&mut subscriber).await,
        Packet::PubRel(PubRel {
            packet_id: delivery_pid
        })
    );
    send(
        &mut subscriber,
        Packet::PubComp(PubComp {
            packet_id: delivery_pid,
        }),
    )
    .await;
    assert_no_packet(&mut subscriber).await;
}

#[tokio::test]
async fn qos1_publish_gets_exactly_one_puback() {
    let state = broker(BrokerConfig::default());

    let mut client = connect(&state, "cli", true).await;
    subscribe(&mut client, 1, "loop", Qos::AtLeastOnce).await;

    send(
        &mut client,
        Packet::Publish(publish_packet("loop", b"x", Qos::AtLeastOnce, Some(7))),
    )
    .await;

    // one PUBACK for the inbound id, one delivery back to the subscriber
    let mut got_ack = false;
    let mut got_delivery = false;
    for _ in 0..2 {
        match recv(&mut client).await {
            Packet::PubAck(pub_ack) => {
                assert_eq!(pub_ack.packet_id, pid(7));
                assert!(!got_ack);
                got_ack = true;
            }
            Packet::Publish(publish) => {
                assert_eq!(&*publish.payload, b"x");
                assert!(!got_delivery);
                got_delivery = true;
                send(
                    &mut client,
                    Packet::PubAck(PubAck {
                        packet_id: publish.packet_id.unwrap(),
                    }),
                )
                .await;
            }
            packet => panic!("unexpected packet: {:?}", packet),
        }
    }
    assert!(got_ack && got_delivery);
    assert_no_packet(&mut client).await;
}

#[tokio::test]
async fn durable_session_replays_missed_messages() {
    let state = broker(BrokerConfig::default());

    let mut durable = connect(&state, "durable", false).await;
    subscribe(&mut durable, 1, "news", Qos::AtLeastOnce).await;
    send(&mut durable, Packet::Disconnect).await;
    recv_closed(&mut durable).await;

    // published while the subscriber is offline
    let mut publisher = connect(&state, "pub", true).await;
    for (n, payload) in [&b"one"[..], &b"two"[..]].iter().enumerate() {
        send(
            &mut publisher,
            Packet::Publish(Publish {
                dup: false,
                qos: Qos::AtLeastOnce,
                retain: false,
                topic: "news".into(),
                packet_id: Some(pid(n as u16 + 1)),
                payload: Bytes::from_static(*payload),
            }),
        )
        .await;
        assert!(matches!(recv(&mut publisher).await, Packet::PubAck(_)));
    }

    // reconnecting with clean_session=false replays in original order
    let mut durable = open(&state).await;
    send(&mut durable, Packet::Connect(connect_packet("durable", false))).await;
    match recv(&mut durable).await {
        Packet::ConnAck(conn_ack) => {
            assert_eq!(conn_ack.return_code, ConnectReturnCode::Accepted);
            assert!(conn_ack.session_present);
        }
        packet => panic!("expected CONNACK, got: {:?}", packet),
    }

    for expected in [&b"one"[..], &b"two"[..]].iter() {
        match recv(&mut durable).await {
            Packet::Publish(publish) => {
                assert_eq!(&*publish.payload, *expected);
                assert_eq!(publish.qos, Qos::AtLeastOnce);
                assert!(publish.dup);
                send(
                    &mut durable,
                    Packet::PubAck(PubAck {
                        packet_id: publish.packet_id.unwrap(),
                    }),
                )
                .await;
            }
            packet => panic!("expected PUBLISH, got: {:?}", packet),
        }
    }
    assert_no_packet(&mut durable).await;
}

#[tokio::test]
async fn clean_session_discards_subscriptions() {
    let state = broker(BrokerConfig::default());

    let mut client = connect(&state, "cli", false).await;
    subscribe(&mut client, 1, "t", Qos::AtMostOnce).await;
    send(&mut client, Packet::Disconnect).await;
    recv_closed(&mut client).await;

    // reconnect with clean_session=true wipes the prior state
    let mut client = connect(&state, "cli", true).await;

    let mut publisher = connect(&state, "pub", true).await;
    send(
        &mut publisher,
        Packet::Publish(publish_packet("t", b"x", Qos::AtMostOnce, None)),
    )
    .await;

    assert_no_packet(&mut client).await;
}

#[tokio::test]
async fn multi_level_wildcard_matches_its_parent_topic() {
    let state = broker(BrokerConfig::default());

    let mut subscriber = connect(&state, "sub", true).await;
    subscribe(&mut subscriber, 1, "a/#", Qos::AtMostOnce).await;

    let mut publisher = connect(&state, "pub", true).await;
    send(
        &mut publisher,
        Packet::Publish(publish_packet("a", b"x", Qos::AtMostOnce, None)),
    )
    .await;

    match recv(&mut subscriber).await {
        Packet::Publish(publish) => {
            assert_eq!(&*publish.topic, "a");
            assert_eq!(&*publish.payload, b"x");
        }
        packet => panic!("expected PUBLISH, got: {:?}", packet),
    }
}

#[tokio::test]
async fn unsubscribe_stops_delivery() {
    let state = broker(BrokerConfig::default());

    let mut subscriber = connect(&state, "sub", true).await;
    subscribe(&mut subscriber, 1, "t/+", Qos::AtMostOnce).await;

    let mut publisher = connect(&state, "pub", true).await;
    send(
        &mut publisher,
        Packet::Publish(publish_packet("t/1", b"x", Qos::AtMostOnce, None)),
    )
    .await;
    match recv(&mut subscriber).await {
        Packet::Publish(publish) => assert_eq!(&*publish.topic, "t/1"),
        packet => panic!("expected PUBLISH, got: {:?}", packet),
    }

    send(
        &mut subscriber,
        Packet::Unsubscribe(Unsubscribe {
            packet_id: pid(2),
            filters: vec!["t/+".into()],
        }),
    )
    .await;
    match recv(&mut subscriber).await {
        Packet::UnsubAck(unsub_ack) => assert_eq!(unsub_ack.packet_id, pid(2)),
        packet => panic!("expected UNSUBACK, got: {:?}", packet),
    }

    send(
        &mut publisher,
        Packet::Publish(publish_packet("t/2", b"x", Qos::AtMostOnce, None)),
    )
    .await;
    assert_no_packet(&mut subscriber).await;
}

#[tokio::test]
async fn publish_to_wildcard_topic_closes_the_channel() {
    let state = broker(BrokerConfig::default());

    let mut client = connect(&state, "cli", true).await;
    send(
        &mut client,
        Packet::Publish(publish_packet("a/+/b", b"x", Qos::AtMostOnce, None)),
    )
    .await;
    recv_closed(&mut client).await;
}

#[tokio::test]
async fn subscribe_with_invalid_filter_fails_per_topic() {
    let state = broker(BrokerConfig::default());

    let mut client = connect(&state, "cli", true).await;
    send(
        &mut client,
        Packet::Subscribe(Subscribe {
            packet_id: pid(1),
            filters: vec![
                SubscribeFilter {
                    path: "ok/#".into(),
                    qos: Qos::AtLeastOnce,
                },
                SubscribeFilter {
                    path: "bad/#/filter".into(),
                    qos: Qos::AtLeastOnce,
                },
            ],
        }),
    )
    .await;

    match recv(&mut client).await {
        Packet::SubAck(sub_ack) => {
            assert_eq!(
                sub_ack.return_codes,
                vec![SubscribeReturnCode::QoS1, SubscribeReturnCode::Failure]
            );
        }
        packet => panic!("expected SUBACK, got: {:?}", packet),
    }
}

#[tokio::test]
async fn keep_alive_timeout_closes_the_connection() {
    let state = broker(BrokerConfig::default());

    let mut codec = open(&state).await;
    let mut connect = connect_packet("idle", true);
    connect.keep_alive = 1;
    send(&mut codec, Packet::Connect(connect)).await;
    assert!(matches!(recv(&mut codec).await, Packet::ConnAck(_)));

    // the idle handler fires after keep alive x 1.5
    match timeout(Duration::from_secs(5), codec.decode()).await {
        Ok(Ok(None)) => {}
        res => panic!("expected close, got: {:?}", res.is_ok()),
    }
}
