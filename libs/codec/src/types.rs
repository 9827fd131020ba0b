use bytestring::ByteString;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};

/// Protocol revisions accepted by the broker.
///
/// v3.1 announces itself with the name `MQIsdp` and level byte `3`, v3.1.1
/// with `MQTT` and level byte `4`.
#[derive(
    Debug, Copy, Clone, Eq, PartialEq, IntoPrimitive, TryFromPrimitive, Serialize, Deserialize,
)]
#[repr(u8)]
pub enum ProtocolLevel {
    V3 = 3,
    V4 = 4,
}

impl ProtocolLevel {
    #[inline]
    pub fn protocol_name(&self) -> &'static str {
        match self {
            ProtocolLevel::V3 => "MQIsdp",
            ProtocolLevel::V4 => "MQTT",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Login {
    pub username: ByteString,
    #[serde(default)]
    pub password: ByteString,
}

/// Level of assurance for delivery of an Application Message.
#[derive(
    Debug,
    Clone,
    Copy,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    IntoPrimitive,
    TryFromPrimitive,
    Serialize,
    Deserialize,
)]
#[repr(u8)]
pub enum Qos {
    /// At most once delivery
    AtMostOnce = 0,

    /// At least once delivery
    AtLeastOnce = 1,

    /// Exactly once delivery
    ExactlyOnce = 2,
}
