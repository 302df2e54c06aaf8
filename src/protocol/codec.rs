/// Length-encoded integers and strings, and a bounds-checked payload cursor

use crate::error::{ShardGateError, ShardGateResult};
use bytes::{Buf, BufMut};

/// Marker byte for a NULL column value in text rows
pub const NULL_VALUE: u8 = 0xfb;

/// Cursor over one packet payload. Every read is bounds checked and a short
/// payload surfaces as a protocol error instead of a panic.
#[derive(Debug, Clone)]
pub struct PayloadReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn peek_u8(&self) -> Option<u8> {
        self.buf.get(self.pos).copied()
    }

    pub fn read_bytes(&mut self, n: usize) -> ShardGateResult<&'a [u8]> {
        if self.remaining() < n {
            return Err(ShardGateError::protocol(format!(
                "packet too short: need {} bytes at offset {}, have {}",
                n,
                self.pos,
                self.remaining()
            )));
        }
        let bytes = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(bytes)
    }

    pub fn skip(&mut self, n: usize) -> ShardGateResult<()> {
        self.read_bytes(n).map(|_| ())
    }

    pub fn read_u8(&mut self) -> ShardGateResult<u8> {
        Ok(self.read_bytes(1)?[0])
    }

    pub fn read_u16_le(&mut self) -> ShardGateResult<u16> {
        Ok(self.read_bytes(2)?.get_u16_le())
    }

    pub fn read_u24_le(&mut self) -> ShardGateResult<u32> {
        Ok(self.read_bytes(3)?.get_uint_le(3) as u32)
    }

    pub fn read_u32_le(&mut self) -> ShardGateResult<u32> {
        Ok(self.read_bytes(4)?.get_u32_le())
    }

    pub fn read_u64_le(&mut self) -> ShardGateResult<u64> {
        Ok(self.read_bytes(8)?.get_u64_le())
    }

    /// Bytes up to the next NUL; the terminator is consumed but not returned
    pub fn read_null_terminated(&mut self) -> ShardGateResult<&'a [u8]> {
        let rest = &self.buf[self.pos..];
        match rest.iter().position(|b| *b == 0) {
            Some(end) => {
                self.pos += end + 1;
                Ok(&rest[..end])
            }
            None => Err(ShardGateError::protocol("missing NUL terminator")),
        }
    }

    /// Like `read_null_terminated`, but an unterminated tail is accepted
    pub fn read_null_terminated_or_rest(&mut self) -> &'a [u8] {
        match self.read_null_terminated() {
            Ok(bytes) => bytes,
            Err(_) => self.read_rest(),
        }
    }

    pub fn read_rest(&mut self) -> &'a [u8] {
        let rest = &self.buf[self.pos..];
        self.pos = self.buf.len();
        rest
    }

    /// Length-encoded integer. `None` is the NULL marker.
    pub fn read_lenenc_int(&mut self) -> ShardGateResult<Option<u64>> {
        let first = self.read_u8()?;
        let value = match first {
            0..=0xfa => first as u64,
            NULL_VALUE => return Ok(None),
            0xfc => self.read_u16_le()? as u64,
            0xfd => self.read_u24_le()? as u64,
            0xfe => self.read_u64_le()?,
            _ => {
                return Err(ShardGateError::protocol(format!(
                    "invalid length-encoded integer prefix 0x{:02x}",
                    first
                )))
            }
        };
        Ok(Some(value))
    }

    /// Length-encoded integer where NULL is not allowed
    pub fn read_lenenc_u64(&mut self) -> ShardGateResult<u64> {
        self.read_lenenc_int()?
            .ok_or_else(|| ShardGateError::protocol("unexpected NULL length"))
    }

    pub fn read_lenenc_bytes(&mut self) -> ShardGateResult<Option<&'a [u8]>> {
        match self.read_lenenc_int()? {
            Some(len) => {
                let len = usize::try_from(len)
                    .map_err(|_| ShardGateError::protocol("length-encoded string too long"))?;
                self.read_bytes(len).map(Some)
            }
            None => Ok(None),
        }
    }

    pub fn read_lenenc_string(&mut self) -> ShardGateResult<String> {
        let bytes = self.read_lenenc_bytes()?.unwrap_or_default();
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }
}

/// Writers for the protocol's variable-size encodings
pub trait PayloadWriter: BufMut {
    fn put_lenenc_int(&mut self, value: u64) {
        if value < 251 {
            self.put_u8(value as u8);
        } else if value < 1 << 16 {
            self.put_u8(0xfc);
            self.put_u16_le(value as u16);
        } else if value < 1 << 24 {
            self.put_u8(0xfd);
            self.put_uint_le(value, 3);
        } else {
            self.put_u8(0xfe);
            self.put_u64_le(value);
        }
    }

    fn put_lenenc_bytes(&mut self, bytes: &[u8]) {
        self.put_lenenc_int(bytes.len() as u64);
        self.put_slice(bytes);
    }

    fn put_null_terminated(&mut self, bytes: &[u8]) {
        self.put_slice(bytes);
        self.put_u8(0);
    }

    fn put_u24_le(&mut self, value: u32) {
        self.put_uint_le(value as u64, 3);
    }
}

impl<T: BufMut + ?Sized> PayloadWriter for T {}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_lenenc_int_boundaries() {
        let cases: [(u64, usize); 6] = [
            (0, 1),
            (250, 1),
            (251, 3),
            (65_535, 3),
            (65_536, 4),
            (16_777_216, 9),
        ];
        for (value, encoded_len) in cases {
            let mut buf = BytesMut::new();
            buf.put_lenenc_int(value);
            assert_eq!(buf.len(), encoded_len, "length of {}", value);

            let mut reader = PayloadReader::new(&buf);
            assert_eq!(reader.read_lenenc_int().unwrap(), Some(value));
            assert!(reader.is_empty());
        }
    }

    #[test]
    fn test_null_marker() {
        let mut reader = PayloadReader::new(&[NULL_VALUE, 0x03, b'a', b'b', b'c']);
        assert_eq!(reader.read_lenenc_bytes().unwrap(), None);
        assert_eq!(reader.read_lenenc_bytes().unwrap(), Some(&b"abc"[..]));
    }

    #[test]
    fn test_short_payload_is_protocol_error() {
        let mut reader = PayloadReader::new(&[0x01, 0x02]);
        let err = reader.read_u32_le().unwrap_err();
        assert!(matches!(err, ShardGateError::Protocol(_)));

        let mut reader = PayloadReader::new(b"root");
        assert!(reader.read_null_terminated().is_err());
    }

    #[test]
    fn test_null_terminated() {
        let mut reader = PayloadReader::new(b"root\0shardeddb\0");
        assert_eq!(reader.read_null_terminated().unwrap(), b"root");
        assert_eq!(reader.read_null_terminated().unwrap(), b"shardeddb");
        assert!(reader.is_empty());
    }
}
