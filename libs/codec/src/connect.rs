use std::convert::TryInto;

use bytes::{BufMut, Bytes, BytesMut};
use bytestring::ByteString;
use serde::{Deserialize, Serialize};

use crate::packet::CONNECT;
use crate::reader::PacketReader;
use crate::writer::PacketWriter;
use crate::{DecodeError, EncodeError, Login, ProtocolLevel, Qos};

const CF_USERNAME: u8 = 0b10000000;
const CF_PASSWORD: u8 = 0b01000000;
const CF_WILL_RETAIN: u8 = 0b00100000;
const CF_WILL_QOS: u8 = 0b00011000;
const CF_WILL: u8 = 0b00000100;
const CF_CLEAN_SESSION: u8 = 0b00000010;
const CF_RESERVED: u8 = 0b00000001;

const QOS_SHIFT: u8 = 3;

/// Will testament carried in the CONNECT payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LastWill {
    pub topic: ByteString,
    #[serde(default)]
    pub payload: Bytes,
    pub qos: Qos,
    #[serde(default)]
    pub retain: bool,
}

/// Connection Request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Connect {
    pub level: ProtocolLevel,
    #[serde(default = "default_keep_alive")]
    pub keep_alive: u16,
    #[serde(default)]
    pub clean_session: bool,
    #[serde(default)]
    pub client_id: ByteString,
    pub last_will: Option<LastWill>,
    pub login: Option<Login>,
}

fn default_keep_alive() -> u16 {
    60
}

impl Connect {
    #[inline]
    fn variable_header_length(&self) -> usize {
        // protocol name + level + flags + keep alive
        2 + self.level.protocol_name().len() + 1 + 1 + 2
    }

    #[inline]
    fn payload_length(&self) -> usize {
        let mut len = 2 + self.client_id.len();

        if let Some(last_will) = &self.last_will {
            len += 2 + last_will.topic.len();
            len += 2 + last_will.payload.len();
        }

        if let Some(login) = &self.login {
            len += 2 + login.username.len();
            if !login.password.is_empty() {
                len += 2 + login.password.len();
            }
        }

        len
    }

    pub(crate) fn decode(mut data: Bytes) -> Result<Self, DecodeError> {
        // parse header
        let protocol = data.read_string()?;
        let n_level = data.read_u8()?;
        let level = match (&*protocol, n_level) {
            ("MQIsdp", 3) => ProtocolLevel::V3,
            ("MQTT", 4) => ProtocolLevel::V4,
            ("MQIsdp", n) | ("MQTT", n) => return Err(DecodeError::UnsupportedProtocolLevel(n)),
            _ => return Err(DecodeError::InvalidProtocol(protocol)),
        };

        let connect_flags = data.read_u8()?;

        if level == ProtocolLevel::V4 {
            // The Server MUST validate that the reserved flag in the CONNECT Control
            // Packet is set to zero and disconnect the Client if it is not zero [MQTT-3.1.2-3].
            ensure!(
                connect_flags & CF_RESERVED == 0,
                DecodeError::InvalidConnectFlags
            );
        }

        if connect_flags & CF_WILL == 0 {
            // If the Will Flag is set to 0, then the Will QoS MUST be set to 0 (0x00) [MQTT-3.1.2-13].
            ensure!(
                connect_flags & CF_WILL_QOS == 0,
                DecodeError::InvalidConnectFlags
            );

            // If the Will Flag is set to 0, then Will Retain MUST be set to 0 [MQTT-3.1.2-15].
            ensure!(
                connect_flags & CF_WILL_RETAIN == 0,
                DecodeError::InvalidConnectFlags
            );
        }

        let will_retain = connect_flags & CF_WILL_RETAIN > 0;
        let will_qos: Qos = {
            let n_qos = (connect_flags & CF_WILL_QOS) >> QOS_SHIFT;
            n_qos
                .try_into()
                .map_err(|_| DecodeError::InvalidQos(n_qos))?
        };
        let keep_alive = data.read_u16()?;

        // parse payload
        let client_id = data.read_string()?;

        let last_will = if connect_flags & CF_WILL > 0 {
            let topic = data.read_string()?;
            let payload = data.read_binary()?;
            Some(LastWill {
                topic,
                payload,
                qos: will_qos,
                retain: will_retain,
            })
        } else {
            None
        };

        let login = {
            let username = if connect_flags & CF_USERNAME > 0 {
                Some(data.read_string()?)
            } else {
                None
            };
            let password = if connect_flags & CF_PASSWORD > 0 {
                Some(data.read_string()?)
            } else {
                None
            };

            username.map(|username| Login {
                username,
                password: password.unwrap_or_default(),
            })
        };

        Ok(Self {
            level,
            keep_alive,
            clean_session: connect_flags & CF_CLEAN_SESSION > 0,
            client_id,
            last_will,
            login,
        })
    }

    pub(crate) fn encode(&self, data: &mut BytesMut, max_size: usize) -> Result<(), EncodeError> {
        data.put_u8(CONNECT << 4);

        let size = self.variable_header_length() + self.payload_length();
        ensure!(size < max_size, EncodeError::PacketTooLarge);
        data.write_remaining_length(size)?;

        // write variable header
        data.write_string(self.level.protocol_name())?;
        data.put_u8(self.level.into());

        let mut flag = 0;
        if self.clean_session {
            flag |= CF_CLEAN_SESSION;
        }
        if let Some(last_will) = &self.last_will {
            flag |= CF_WILL;
            flag |= Into::<u8>::into(last_will.qos) << QOS_SHIFT;
            if last_will.retain {
                flag |= CF_WILL_RETAIN;
            }
        }
        if let Some(login) = &self.login {
            flag |= CF_USERNAME;
            if !login.password.is_empty() {
                flag |= CF_PASSWORD;
            }
        }

        data.put_u8(flag);
        data.put_u16(self.keep_alive);

        // write payload
        data.write_string(&self.client_id)?;

        if let Some(last_will) = &self.last_will {
            data.write_string(&last_will.topic)?;
            data.write_binary(&last_will.payload)?;
        }

        if let Some(login) = &self.login {
            data.write_string(&login.username)?;
            if !login.password.is_empty() {
                data.write_string(&login.password)?;
            }
        }

        Ok(())
    }
}
