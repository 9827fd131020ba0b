use bytes::{BufMut, BytesMut};

use crate::EncodeError;

pub trait PacketWriter {
    fn write_remaining_length(&mut self, value: usize) -> Result<(), EncodeError>;

    fn write_string(&mut self, value: &str) -> Result<(), EncodeError>;

    fn write_binary(&mut self, value: &[u8]) -> Result<(), EncodeError>;
}

impl PacketWriter for BytesMut {
    #[inline]
    fn write_remaining_length(&mut self, value: usize) -> Result<(), EncodeError> {
        ensure!(value <= 268_435_455, EncodeError::PayloadTooLarge);

        let mut n = value;

        loop {
            let mut value = (n & 0x7f) as u8;
            n >>= 7;
            if n > 0 {
                value |= 0x80;
            }
            self.put_u8(value);
            if n == 0 {
                break;
            }
        }

        Ok(())
    }

    #[inline]
    fn write_string(&mut self, value: &str) -> Result<(), EncodeError> {
        ensure!(
            value.len() <= u16::MAX as usize,
            EncodeError::PayloadTooLarge
        );
        self.put_u16(value.len() as u16);
        self.put_slice(value.as_bytes());
        Ok(())
    }

    #[inline]
    fn write_binary(&mut self, value: &[u8]) -> Result<(), EncodeError> {
        ensure!(
            value.len() <= u16::MAX as usize,
            EncodeError::PayloadTooLarge
        );
        self.put_u16(value.len() as u16);
        self.put_slice(value);
        Ok(())
    }
}
