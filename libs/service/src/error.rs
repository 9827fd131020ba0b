use codec::EncodeError;
use thiserror::Error;

use crate::registry::ConnectionState;

#[derive(Debug, Error)]
pub enum Error {
    /// The connection was closed because a newer CONNECT claimed the same
    /// client id.
    #[error("displaced by a newer connection")]
    Displaced,

    /// A CONNECT arrived for a client id that already has a live connection.
    /// The old connection is aborted and this one is abandoned; the client
    /// retries.
    #[error("connect abandoned, client id already connected")]
    ConnectAbandoned,

    #[error("client disconnect")]
    ClientDisconnect,

    #[error("connection closed")]
    Closed,

    #[error("keep alive timeout")]
    KeepAliveTimeout,

    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    #[error("state transition failed: {0:?} -> {1:?}")]
    StateTransition(ConnectionState, ConnectionState),

    #[error("storage: {0}")]
    Storage(#[source] anyhow::Error),

    #[error("encode packet: {0}")]
    EncodePacket(#[from] EncodeError),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}
