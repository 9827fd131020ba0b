use std::convert::TryInto;
use std::num::NonZeroU16;

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::packet::PUBREL;
use crate::reader::PacketReader;
use crate::writer::PacketWriter;
use crate::{DecodeError, EncodeError};

// PUBREL carries mandatory fixed-header flags [MQTT-3.6.1-1].
const FLAGS: u8 = 0b0010;

/// Publish release (QoS 2 delivery, part 2)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct PubRel {
    pub packet_id: NonZeroU16,
}

impl PubRel {
    pub(crate) fn decode(mut data: Bytes, flags: u8) -> Result<Self, DecodeError> {
        ensure!(
            flags & 0x0f == FLAGS,
            DecodeError::InvalidPacketFlags(flags & 0x0f)
        );
        let packet_id = data
            .read_u16()?
            .try_into()
            .map_err(|_| DecodeError::InvalidPacketId)?;
        Ok(Self { packet_id })
    }

    pub(crate) fn encode(&self, data: &mut BytesMut, max_size: usize) -> Result<(), EncodeError> {
        data.put_u8((PUBREL << 4) | FLAGS);
        ensure!(4 < max_size, EncodeError::PacketTooLarge);
        data.write_remaining_length(2)?;
        data.put_u16(self.packet_id.get());
        Ok(())
    }
}
