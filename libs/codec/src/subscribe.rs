use std::convert::TryInto;
use std::num::NonZeroU16;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use bytestring::ByteString;
use serde::{Deserialize, Serialize};

use crate::packet::SUBSCRIBE;
use crate::reader::PacketReader;
use crate::writer::PacketWriter;
use crate::{DecodeError, EncodeError, Qos};

// SUBSCRIBE carries mandatory fixed-header flags [MQTT-3.8.1-1].
const FLAGS: u8 = 0b0010;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubscribeFilter {
    pub path: ByteString,
    pub qos: Qos,
}

/// Subscribe request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Subscribe {
    pub packet_id: NonZeroU16,
    pub filters: Vec<SubscribeFilter>,
}

impl Subscribe {
    pub(crate) fn decode(mut data: Bytes, flags: u8) -> Result<Self, DecodeError> {
        ensure!(
            flags & 0x0f == FLAGS,
            DecodeError::InvalidPacketFlags(flags & 0x0f)
        );
        let packet_id = data
            .read_u16()?
            .try_into()
            .map_err(|_| DecodeError::InvalidPacketId)?;

        let mut filters = Vec::new();
        while data.has_remaining() {
            let path = data.read_string()?;
            let n_qos = data.read_u8()?;
            let qos = n_qos
                .try_into()
                .map_err(|_| DecodeError::InvalidQos(n_qos))?;
            filters.push(SubscribeFilter { path, qos });
        }

        // The payload MUST contain at least one Topic Filter / QoS pair [MQTT-3.8.3-3].
        ensure!(!filters.is_empty(), DecodeError::MalformedPacket);

        Ok(Self { packet_id, filters })
    }

    pub(crate) fn encode(&self, data: &mut BytesMut, max_size: usize) -> Result<(), EncodeError> {
        data.put_u8((SUBSCRIBE << 4) | FLAGS);

        let size = 2 + self
            .filters
            .iter()
            .map(|filter| 2 + filter.path.len() + 1)
            .sum::<usize>();
        ensure!(size < max_size, EncodeError::PacketTooLarge);
        data.write_remaining_length(size)?;

        data.put_u16(self.packet_id.get());
        for filter in &self.filters {
            data.write_string(&filter.path)?;
            data.put_u8(filter.qos.into());
        }
        Ok(())
    }
}
