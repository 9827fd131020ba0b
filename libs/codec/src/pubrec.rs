use std::convert::TryInto;
use std::num::NonZeroU16;

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::packet::PUBREC;
use crate::reader::PacketReader;
use crate::writer::PacketWriter;
use crate::{DecodeError, EncodeError};

/// Publish received (QoS 2 delivery, part 1)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct PubRec {
    pub packet_id: NonZeroU16,
}

impl PubRec {
    pub(crate) fn decode(mut data: Bytes) -> Result<Self, DecodeError> {
        let packet_id = data
            .read_u16()?
            .try_into()
            .map_err(|_| DecodeError::InvalidPacketId)?;
        Ok(Self { packet_id })
    }

    pub(crate) fn encode(&self, data: &mut BytesMut, max_size: usize) -> Result<(), EncodeError> {
        data.put_u8(PUBREC << 4);
        ensure!(4 < max_size, EncodeError::PacketTooLarge);
        data.write_remaining_length(2)?;
        data.put_u16(self.packet_id.get());
        Ok(())
    }
}
