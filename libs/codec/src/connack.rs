use bytes::{BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};
use std::convert::TryInto;

use crate::packet::CONNACK;
use crate::reader::PacketReader;
use crate::writer::PacketWriter;
use crate::{DecodeError, EncodeError};

const SESSION_PRESENT: u8 = 0b0000_0001;

#[derive(
    Debug, Clone, Copy, Eq, PartialEq, IntoPrimitive, TryFromPrimitive, Serialize, Deserialize,
)]
#[repr(u8)]
pub enum ConnectReturnCode {
    Accepted = 0,
    UnacceptableProtocolVersion = 1,
    IdentifierRejected = 2,
    ServerUnavailable = 3,
    BadUserNameOrPassword = 4,
    NotAuthorized = 5,
}

/// Connect acknowledgment
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnAck {
    #[serde(default)]
    pub session_present: bool,
    pub return_code: ConnectReturnCode,
}

impl ConnAck {
    pub(crate) fn decode(mut data: Bytes) -> Result<Self, DecodeError> {
        let ack_flags = data.read_u8()?;
        let n_code = data.read_u8()?;
        let return_code = n_code
            .try_into()
            .map_err(|_| DecodeError::InvalidConnectReturnCode(n_code))?;
        Ok(Self {
            session_present: ack_flags & SESSION_PRESENT > 0,
            return_code,
        })
    }

    pub(crate) fn encode(&self, data: &mut BytesMut, max_size: usize) -> Result<(), EncodeError> {
        data.put_u8(CONNACK << 4);

        ensure!(4 < max_size, EncodeError::PacketTooLarge);
        data.write_remaining_length(2)?;

        data.put_u8(if self.session_present {
            SESSION_PRESENT
        } else {
            0
        });
        data.put_u8(self.return_code.into());
        Ok(())
    }
}
