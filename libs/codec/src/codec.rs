use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter, ErrorKind};

use crate::{DecodeError, EncodeError, Packet};

/// Frames MQTT control packets over any reader/writer pair.
///
/// Writes are buffered; nothing reaches the peer until [`Codec::flush`] is
/// called, which lets the connection loop batch acknowledgements and apply
/// its own flush cadence.
pub struct Codec<R, W> {
    reader: R,
    writer: BufWriter<W>,
    input_max_size: usize,
    output_max_size: usize,
    read_buf: BytesMut,
    write_buf: BytesMut,
    dirty: bool,
}

impl<R, W> Codec<R, W>
where
    R: AsyncRead + Send + Unpin,
    W: AsyncWrite + Send + Unpin,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader,
            writer: BufWriter::new(writer),
            input_max_size: usize::MAX,
            output_max_size: usize::MAX,
            read_buf: BytesMut::new(),
            write_buf: BytesMut::new(),
            dirty: false,
        }
    }

    pub fn set_input_max_size(&mut self, size: usize) {
        self.input_max_size = size;
    }

    pub async fn decode(&mut self) -> Result<Option<(Packet, usize)>, DecodeError> {
        let flag = match self.reader.read_u8().await {
            Ok(flag) => flag,
            Err(err) if err.kind() == ErrorKind::UnexpectedEof => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let (len, len_bytes) = read_remaining_length(&mut self.reader).await?;
        if len > self.input_max_size {
            return Err(DecodeError::PacketTooLarge);
        }
        self.read_buf.resize(len, 0);
        self.reader.read_exact(&mut self.read_buf[..]).await?;

        let packet = Packet::decode(self.read_buf.split().freeze(), flag)?;
        Ok(Some((packet, 1 + len_bytes + len)))
    }

    pub async fn encode(&mut self, packet: &Packet) -> Result<usize, EncodeError> {
        packet.encode(&mut self.write_buf, self.output_max_size)?;
        self.writer.write_all(&self.write_buf).await?;
        let size = self.write_buf.len();
        self.write_buf.clear();
        self.dirty = true;
        Ok(size)
    }

    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub async fn flush(&mut self) -> Result<(), EncodeError> {
        if self.dirty {
            self.writer.flush().await?;
            self.dirty = false;
        }
        Ok(())
    }
}

#[inline]
async fn read_remaining_length(
    mut reader: impl AsyncRead + Unpin,
) -> Result<(usize, usize), DecodeError> {
    let mut n = 0;
    let mut shift = 0;
    let mut bytes = 0;

    loop {
        let byte = reader.read_u8().await?;
        bytes += 1;
        n += ((byte & 0x7f) as usize) << shift;
        let done = (byte & 0x80) == 0;
        if done {
            break;
        }
        shift += 7;
        ensure!(shift <= 21, DecodeError::MalformedPacket);
    }

    Ok((n, bytes))
}
