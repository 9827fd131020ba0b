use std::convert::TryInto;
use std::num::NonZeroU16;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};

use crate::packet::SUBACK;
use crate::reader::PacketReader;
use crate::writer::PacketWriter;
use crate::{DecodeError, EncodeError, Qos};

#[derive(
    Debug, Clone, Copy, Eq, PartialEq, IntoPrimitive, TryFromPrimitive, Serialize, Deserialize,
)]
#[repr(u8)]
pub enum SubscribeReturnCode {
    QoS0 = 0,
    QoS1 = 1,
    QoS2 = 2,
    Failure = 0x80,
}

impl SubscribeReturnCode {
    #[inline]
    pub fn granted(qos: Qos) -> Self {
        match qos {
            Qos::AtMostOnce => SubscribeReturnCode::QoS0,
            Qos::AtLeastOnce => SubscribeReturnCode::QoS1,
            Qos::ExactlyOnce => SubscribeReturnCode::QoS2,
        }
    }
}

/// Subscribe acknowledgment
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubAck {
    pub packet_id: NonZeroU16,
    pub return_codes: Vec<SubscribeReturnCode>,
}

impl SubAck {
    pub(crate) fn decode(mut data: Bytes) -> Result<Self, DecodeError> {
        let packet_id = data
            .read_u16()?
            .try_into()
            .map_err(|_| DecodeError::InvalidPacketId)?;

        let mut return_codes = Vec::new();
        while data.has_remaining() {
            let n_code = data.read_u8()?;
            return_codes.push(
                n_code
                    .try_into()
                    .map_err(|_| DecodeError::InvalidSubscribeReturnCode(n_code))?,
            );
        }

        Ok(Self {
            packet_id,
            return_codes,
        })
    }

    pub(crate) fn encode(&self, data: &mut BytesMut, max_size: usize) -> Result<(), EncodeError> {
        data.put_u8(SUBACK << 4);

        let size = 2 + self.return_codes.len();
        ensure!(size < max_size, EncodeError::PacketTooLarge);
        data.write_remaining_length(size)?;

        data.put_u16(self.packet_id.get());
        for return_code in &self.return_codes {
            data.put_u8((*return_code).into());
        }
        Ok(())
    }
}
