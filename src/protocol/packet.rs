/// Packet framing: 3-byte little-endian length, 1-byte sequence id, payload

use super::codec::PayloadWriter;
use super::MAX_PAYLOAD_LEN;
use crate::error::{ShardGateError, ShardGateResult};
use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Framed packet stream with sequence tracking.
///
/// Outgoing packets are queued in a write buffer and sent on `flush`, so a
/// whole result set leaves in as few writes as possible.
pub struct PacketIo<S> {
    stream: S,
    seq: u8,
    write_buf: BytesMut,
}

impl<S> PacketIo<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            seq: 0,
            write_buf: BytesMut::with_capacity(4096),
        }
    }

    /// Start a new command exchange
    pub fn reset_seq(&mut self) {
        self.seq = 0;
    }

    pub fn seq(&self) -> u8 {
        self.seq
    }

    pub fn into_inner(self) -> S {
        self.stream
    }

    /// Read one logical packet, joining continuation frames of a payload
    /// larger than `MAX_PAYLOAD_LEN`.
    pub async fn read_packet(&mut self) -> ShardGateResult<Bytes> {
        let mut payload = BytesMut::new();
        loop {
            let mut header = [0u8; 4];
            self.stream.read_exact(&mut header).await?;

            let len = u32::from_le_bytes([header[0], header[1], header[2], 0]) as usize;
            let seq = header[3];
            if seq != self.seq {
                return Err(ShardGateError::protocol(format!(
                    "packets out of order: got sequence {}, expected {}",
                    seq, self.seq
                )));
            }
            self.seq = self.seq.wrapping_add(1);

            let start = payload.len();
            payload.resize(start + len, 0);
            self.stream.read_exact(&mut payload[start..]).await?;

            if len < MAX_PAYLOAD_LEN {
                break;
            }
        }

        log::trace!("read packet: {}", hex_preview(&payload));
        Ok(payload.freeze())
    }

    /// Queue a packet behind the current sequence id without sending it
    pub fn queue_packet(&mut self, payload: &[u8]) {
        log::trace!("queue packet: {}", hex_preview(payload));

        let mut chunks = payload.chunks(MAX_PAYLOAD_LEN).peekable();
        if chunks.peek().is_none() {
            self.put_frame(&[]);
            return;
        }
        while let Some(chunk) = chunks.next() {
            self.put_frame(chunk);
            // a payload that is an exact multiple of the frame size ends with an empty frame
            if chunks.peek().is_none() && chunk.len() == MAX_PAYLOAD_LEN {
                self.put_frame(&[]);
            }
        }
    }

    fn put_frame(&mut self, chunk: &[u8]) {
        self.write_buf.reserve(4 + chunk.len());
        self.write_buf.put_u24_le(chunk.len() as u32);
        self.write_buf.put_u8(self.seq);
        self.write_buf.put_slice(chunk);
        self.seq = self.seq.wrapping_add(1);
    }

    pub async fn flush(&mut self) -> ShardGateResult<()> {
        if !self.write_buf.is_empty() {
            self.stream.write_all(&self.write_buf).await?;
            self.write_buf.clear();
        }
        self.stream.flush().await?;
        Ok(())
    }

    pub async fn write_packet(&mut self, payload: &[u8]) -> ShardGateResult<()> {
        self.queue_packet(payload);
        self.flush().await
    }

    pub async fn shutdown(&mut self) -> ShardGateResult<()> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

fn hex_preview(payload: &[u8]) -> String {
    const PREVIEW: usize = 64;
    if payload.len() > PREVIEW {
        format!("{}.. ({} bytes)", hex::encode(&payload[..PREVIEW]), payload.len())
    } else {
        hex::encode(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::io::Builder;

    #[tokio::test]
    async fn test_read_packet_checks_sequence() {
        let mock = Builder::new()
            .read(&[0x01, 0x00, 0x00, 0x00, 0x0e])
            // a mismatched header is rejected before its payload is read
            .read(&[0x01, 0x00, 0x00, 0x05])
            .build();
        let mut io = PacketIo::new(mock);

        let payload = io.read_packet().await.unwrap();
        assert_eq!(&payload[..], &[0x0e]);
        assert_eq!(io.seq(), 1);

        let err = io.read_packet().await.unwrap_err();
        assert!(matches!(err, ShardGateError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_write_packets_share_one_sequence() {
        let mock = Builder::new()
            .write(&[0x01, 0x00, 0x00, 0x01, 0x02, 0x02, 0x00, 0x00, 0x02, b'o', b'k'])
            .build();
        let mut io = PacketIo::new(mock);
        io.seq = 1;

        io.queue_packet(&[0x02]);
        io.queue_packet(b"ok");
        io.flush().await.unwrap();
        assert_eq!(io.seq(), 3);
    }

    #[tokio::test]
    async fn test_large_payload_is_split() {
        let payload = vec![0xabu8; MAX_PAYLOAD_LEN];
        let mut io = PacketIo::new(std::io::Cursor::new(Vec::new()));
        io.queue_packet(&payload);
        io.flush().await.unwrap();

        let written = io.into_inner().into_inner();
        // full frame plus the empty terminating frame
        assert_eq!(written.len(), 4 + MAX_PAYLOAD_LEN + 4);
        assert_eq!(&written[..4], &[0xff, 0xff, 0xff, 0x00]);
        assert_eq!(&written[written.len() - 4..], &[0x00, 0x00, 0x00, 0x01]);
    }
}
