use std::num::NonZeroU16;

use bytes::Bytes;
use bytestring::ByteString;
use codec::{LastWill, Publish, Qos};
use serde::{Deserialize, Serialize};

/// An application message as held by the broker, decoupled from any wire
/// packet. Per-recipient concerns (packet id, effective QoS, dup) are applied
/// when the message is turned back into a PUBLISH.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    publisher: Option<ByteString>,
    topic: ByteString,
    qos: Qos,
    payload: Bytes,
    retain: bool,
}

impl Message {
    #[inline]
    pub fn new(topic: impl Into<ByteString>, qos: Qos, payload: impl Into<Bytes>) -> Self {
        Self {
            publisher: None,
            topic: topic.into(),
            qos,
            payload: payload.into(),
            retain: false,
        }
    }

    #[inline]
    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    #[inline]
    pub fn with_publisher(mut self, client_id: impl Into<ByteString>) -> Self {
        self.publisher = Some(client_id.into());
        self
    }

    #[inline]
    pub fn publisher(&self) -> Option<&ByteString> {
        self.publisher.as_ref()
    }

    #[inline]
    pub fn topic(&self) -> &ByteString {
        &self.topic
    }

    #[inline]
    pub fn qos(&self) -> Qos {
        self.qos
    }

    #[inline]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    #[inline]
    pub fn is_retain(&self) -> bool {
        self.retain
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    #[inline]
    pub fn from_publish(publisher: impl Into<ByteString>, publish: &Publish) -> Self {
        Self::new(publish.topic.clone(), publish.qos, publish.payload.clone())
            .with_retain(publish.retain)
            .with_publisher(publisher)
    }

    #[inline]
    pub fn from_will(publisher: impl Into<ByteString>, will: &WillMessage) -> Self {
        Self::new(will.topic.clone(), will.qos, will.payload.clone())
            .with_retain(will.retain)
            .with_publisher(publisher)
    }

    /// Build the outbound PUBLISH for one recipient.
    #[inline]
    pub fn to_publish(
        &self,
        qos: Qos,
        retain: bool,
        packet_id: Option<NonZeroU16>,
        dup: bool,
    ) -> Publish {
        Publish {
            dup,
            qos,
            retain,
            topic: self.topic.clone(),
            packet_id,
            payload: self.payload.clone(),
        }
    }
}

/// Testament published on behalf of a client when its connection is lost
/// without a DISCONNECT.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WillMessage {
    pub topic: ByteString,
    pub payload: Bytes,
    pub qos: Qos,
    pub retain: bool,
}

impl From<&LastWill> for WillMessage {
    fn from(last_will: &LastWill) -> Self {
        Self {
            topic: last_will.topic.clone(),
            payload: last_will.payload.clone(),
            qos: last_will.qos,
            retain: last_will.retain,
        }
    }
}
