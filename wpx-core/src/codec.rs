use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::PayloadError;

/// Largest chunk written by [`write_chunked`].
pub const CHUNK_SIZE: usize = 16 * 1024;

const MAX_BLOB_BYTES: usize = 64 * 1024 * 1024;

#[derive(Debug, Default)]
pub struct Encoder {
    buf: BytesMut,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buf.put_u8(value);
    }

    pub fn write_bool(&mut self, value: bool) {
        self.buf.put_u8(u8::from(value));
    }

    pub fn write_u32(&mut self, value: u32) {
        self.buf.put_u32_le(value);
    }

    pub fn write_i64(&mut self, value: i64) {
        self.buf.put_i64_le(value);
    }

    pub fn write_u64(&mut self, value: u64) {
        self.buf.put_u64_le(value);
    }

    pub fn write_bytes(&mut self, value: &[u8]) {
        self.buf.put_u32_le(value.len() as u32);
        self.buf.put_slice(value);
    }

    pub fn write_str(&mut self, value: &str) {
        self.write_bytes(value.as_bytes());
    }

    pub fn write_opt_u64(&mut self, value: Option<u64>) {
        match value {
            Some(v) => {
                self.write_bool(true);
                self.write_u64(v);
            }
            None => self.write_bool(false),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

#[derive(Debug)]
pub struct Decoder {
    buf: Bytes,
}

impl Decoder {
    pub fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    fn need(&self, n: usize, what: &str) -> Result<(), PayloadError> {
        if self.buf.remaining() < n {
            return Err(PayloadError::Malformed(format!(
                "truncated input while reading {what} (need {n}, have {})",
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    pub fn read_u8(&mut self) -> Result<u8, PayloadError> {
        self.need(1, "u8")?;
        Ok(self.buf.get_u8())
    }

    pub fn read_bool(&mut self) -> Result<bool, PayloadError> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(PayloadError::Malformed(format!("invalid boolean byte {other}"))),
        }
    }

    pub fn read_u32(&mut self) -> Result<u32, PayloadError> {
        self.need(4, "u32")?;
        Ok(self.buf.get_u32_le())
    }

    pub fn read_i64(&mut self) -> Result<i64, PayloadError> {
        self.need(8, "i64")?;
        Ok(self.buf.get_i64_le())
    }

    pub fn read_u64(&mut self) -> Result<u64, PayloadError> {
        self.need(8, "u64")?;
        Ok(self.buf.get_u64_le())
    }

    pub fn read_bytes(&mut self) -> Result<Bytes, PayloadError> {
        let len = self.read_u32()? as usize;
        if len > MAX_BLOB_BYTES {
            return Err(PayloadError::Malformed(format!("blob of {len} bytes is too large")));
        }
        self.need(len, "blob")?;
        Ok(self.buf.split_to(len))
    }

    /// Advances past a length-prefixed blob without copying it out.
    pub fn skip_bytes(&mut self) -> Result<(), PayloadError> {
        let len = self.read_u32()? as usize;
        self.need(len, "skipped blob")?;
        self.buf.advance(len);
        Ok(())
    }

    pub fn read_string(&mut self) -> Result<String, PayloadError> {
        let raw = self.read_bytes()?;
        String::from_utf8(raw.to_vec())
            .map_err(|e| PayloadError::Malformed(format!("invalid utf-8 string: {e}")))
    }

    pub fn read_opt_u64(&mut self) -> Result<Option<u64>, PayloadError> {
        if self.read_bool()? {
            Ok(Some(self.read_u64()?))
        } else {
            Ok(None)
        }
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    pub fn expect_end(&self) -> Result<(), PayloadError> {
        if self.buf.has_remaining() {
            return Err(PayloadError::Malformed(format!(
                "{} trailing bytes",
                self.buf.remaining()
            )));
        }
        Ok(())
    }
}

/// Writes `data` as a sequence of `u32`-length chunks ending in an empty chunk,
/// so a reader can reassemble the block from partial reads.
pub fn write_chunked(data: &[u8], out: &mut BytesMut) {
    for chunk in data.chunks(CHUNK_SIZE) {
        out.put_u32_le(chunk.len() as u32);
        out.put_slice(chunk);
    }
    out.put_u32_le(0);
}

/// Reassembles a block written by [`write_chunked`], consuming it from `input`.
pub fn read_chunked(input: &mut Bytes) -> Result<Bytes, PayloadError> {
    let mut out = BytesMut::new();
    loop {
        if input.remaining() < 4 {
            return Err(PayloadError::Malformed("truncated chunk header".into()));
        }
        let len = input.get_u32_le() as usize;
        if len == 0 {
            return Ok(out.freeze());
        }
        if len > CHUNK_SIZE {
            return Err(PayloadError::Malformed(format!("chunk of {len} bytes exceeds limit")));
        }
        if input.remaining() < len {
            return Err(PayloadError::Malformed("truncated chunk".into()));
        }
        out.put_slice(&input.split_to(len));
        if out.len() > MAX_BLOB_BYTES {
            return Err(PayloadError::Malformed("chunked block is too large".into()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunked_block_spans_multiple_chunks() {
        let data: Vec<u8> = (0..(CHUNK_SIZE * 2 + 17)).map(|i| (i % 251) as u8).collect();
        let mut out = BytesMut::new();
        write_chunked(&data, &mut out);
        out.put_u8(0xAA);

        let mut input = out.freeze();
        let block = read_chunked(&mut input).unwrap();
        assert_eq!(block.as_ref(), data.as_slice());
        assert_eq!(input.as_ref(), &[0xAA]);
    }

    #[test]
    fn truncated_chunk_is_rejected() {
        let mut out = BytesMut::new();
        out.put_u32_le(10);
        out.put_slice(b"abc");
        let mut input = out.freeze();
        assert!(read_chunked(&mut input).is_err());
    }

    #[test]
    fn decoder_reports_truncation() {
        let mut enc = Encoder::new();
        enc.write_str("method");
        let bytes = enc.finish();
        let mut dec = Decoder::new(bytes.slice(..bytes.len() - 1));
        assert!(dec.read_string().is_err());
    }

    #[test]
    fn skip_bytes_leaves_following_fields() {
        let mut enc = Encoder::new();
        enc.write_bytes(b"ignored");
        enc.write_i64(-7);
        let mut dec = Decoder::new(enc.finish());
        dec.skip_bytes().unwrap();
        assert_eq!(dec.read_i64().unwrap(), -7);
        dec.expect_end().unwrap();
    }
}
