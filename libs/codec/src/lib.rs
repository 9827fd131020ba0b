#![forbid(unsafe_code)]
#![warn(clippy::default_trait_access)]

#[macro_use]
mod macros;
mod codec;
mod connack;
mod connect;
mod error;
mod packet;
mod puback;
mod pubcomp;
mod publish;
mod pubrec;
mod pubrel;
mod reader;
mod suback;
mod subscribe;
mod types;
mod unsuback;
mod unsubscribe;
mod writer;

pub use codec::Codec;
pub use connack::{ConnAck, ConnectReturnCode};
pub use connect::{Connect, LastWill};
pub use error::{DecodeError, EncodeError};
pub use packet::Packet;
pub use puback::PubAck;
pub use pubcomp::PubComp;
pub use publish::Publish;
pub use pubrec::PubRec;
pub use pubrel::PubRel;
pub use suback::{SubAck, SubscribeReturnCode};
pub use subscribe::{Subscribe, SubscribeFilter};
pub use types::{Login, ProtocolLevel, Qos};
pub use unsuback::UnsubAck;
pub use unsubscribe::Unsubscribe;
