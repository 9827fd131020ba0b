use std::io::ErrorKind;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use futures_util::{StreamExt, TryStreamExt};
use service::{client_loop, BrokerState, RemoteAddr};
use tokio::net::TcpListener;
use warp::ws::Ws;
use warp::Filter;

use crate::ws_transport::SinkWriter;

async fn run_tcp_server(state: Arc<BrokerState>, host: String, port: u16) -> Result<()> {
    tracing::info!(
        host = %host,
        port = port,
        "tcp listening",
    );

    let listener = TcpListener::bind((host.as_str(), port)).await?;

    loop {
        let (stream, addr) = listener.accept().await?;
        let state = state.clone();

        tokio::spawn(async move {
            tracing::debug!(
                protocol = "tcp",
                remote_addr = %addr,
                "incoming connection",
            );

            let (reader, writer) = tokio::io::split(stream);
            client_loop(
                state,
                reader,
                writer,
                RemoteAddr {
                    protocol: "tcp",
                    addr: Some(addr.to_string()),
                },
            )
            .await;

            tracing::debug!(
                protocol = "tcp",
                remote_addr = %addr,
                "connection disconnected",
            );
        });
    }
}

async fn run_websocket_server(state: Arc<BrokerState>, host: String, port: u16) -> Result<()> {
    tracing::info!(
        host = %host,
        port = port,
        "websocket listening",
    );

    let mqtt_ws = warp::get()
        .and(warp::filters::addr::remote())
        .and(warp::ws())
        .map(move |addr: Option<SocketAddr>, ws: Ws| {
            let state = state.clone();
            let reply = ws.on_upgrade(move |websocket| async move {
                let addr = addr.map(|addr| addr.to_string());

                tracing::debug!(
                    protocol = "websocket",
                    remote_addr = %addr.as_deref().unwrap_or("unknown"),
                    "incoming connection",
                );

                let (sink, stream) = websocket.split();

                let reader = tokio_util::io::StreamReader::new(
                    stream
                        .try_filter_map(|msg| async move {
                            if msg.is_binary() {
                                Ok(Some(Bytes::from(msg.into_bytes())))
                            } else {
                                Ok(None)
                            }
                        })
                        .map_err(|err| std::io::Error::new(ErrorKind::Other, err.to_string())),
                );
                tokio::pin!(reader);

                client_loop(
                    state,
                    reader,
                    SinkWriter(sink),
                    RemoteAddr {
                        protocol: "websocket",
                        addr,
                    },
                )
                .await;
            });

            warp::reply::with_header(reply, "Sec-WebSocket-Protocol", "mqtt")
        });

    let ip_addr: IpAddr = host.parse()?;
    warp::serve(mqtt_ws).run((ip_addr, port)).await;
    Ok(())
}

pub async fn run(state: Arc<BrokerState>) -> Result<()> {
    let mut servers = Vec::new();

    {
        let state = state.clone();
        let host = state.config().host.clone();
        let port = state.config().port;
        servers.push(tokio::spawn(async move {
            if let Err(err) = run_tcp_server(state, host, port).await {
                tracing::error!(
                    error = %err,
                    "tcp server",
                );
            }
        }));
    }

    if let Some(websocket_port) = state.config().websocket_port {
        let host = state.config().host.clone();
        servers.push(tokio::spawn(async move {
            if let Err(err) = run_websocket_server(state, host, websocket_port).await {
                tracing::error!(
                    error = %err,
                    "websocket server",
                );
            }
        }));
    }

    for handle in servers {
        handle.await.ok();
    }
    Ok(())
}
