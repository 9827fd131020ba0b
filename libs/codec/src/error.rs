use bytestring::ByteString;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed packet")]
    MalformedPacket,

    #[error("unknown packet type: {0}")]
    UnknownPacketType(u8),

    #[error("packet too large")]
    PacketTooLarge,

    #[error("reserved packet type")]
    ReservedPacketType,

    #[error("invalid protocol: {0}")]
    InvalidProtocol(ByteString),

    #[error("unsupported protocol level: {0}")]
    UnsupportedProtocolLevel(u8),

    #[error("invalid connect flags")]
    InvalidConnectFlags,

    #[error("invalid QOS: {0}")]
    InvalidQos(u8),

    #[error("invalid fixed header flags: {0:#x}")]
    InvalidPacketFlags(u8),

    #[error("invalid packet id: 0")]
    InvalidPacketId,

    #[error("invalid connect return code: {0}")]
    InvalidConnectReturnCode(u8),

    #[error("invalid subscribe return code: {0}")]
    InvalidSubscribeReturnCode(u8),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("payload too large")]
    PayloadTooLarge,

    #[error("packet too large")]
    PacketTooLarge,

    #[error("require packet id")]
    RequirePacketId,

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}
