//! Little-endian wire primitives shared by the edit and snapshot codecs.
//!
//! All durable formats in this crate are built from the same few shapes:
//! fixed-width little-endian integers, length-prefixed byte strings, and
//! count-prefixed sequences. The reader tracks its offset so decode errors
//! can report where in the stream they happened.

use thiserror::Error;

/// Error produced when a buffer is too short or a length prefix is absurd.
#[derive(Debug, Error)]
pub enum WireError {
    /// The buffer ended before a complete value could be read.
    #[error("unexpected end of input at offset {offset}: need {needed} more bytes, have {have}")]
    UnexpectedEof {
        /// Offset where the value started.
        offset: usize,
        /// Bytes still required.
        needed: usize,
        /// Bytes remaining.
        have: usize,
    },

    /// A length prefix exceeds the sanity limit.
    #[error("length prefix {len} at offset {offset} exceeds limit {limit}")]
    LengthOutOfRange {
        /// Offset of the prefix.
        offset: usize,
        /// Declared length.
        len: usize,
        /// Maximum accepted.
        limit: usize,
    },
}

/// Upper bound for any single length prefix (64 MB). Nothing the
/// coordinator serializes comes anywhere close; a larger value means the
/// stream is corrupt.
pub const MAX_LEN_PREFIX: usize = 64 * 1024 * 1024;

/// Cursor over a byte slice with offset-tracking reads.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
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

    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        if self.remaining() < n {
            return Err(WireError::UnexpectedEof {
                offset: self.pos,
                needed: n - self.remaining(),
                have: self.remaining(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u32(&mut self) -> Result<u32, WireError> {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(bytes))
    }

    pub fn read_u64(&mut self) -> Result<u64, WireError> {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(bytes))
    }

    pub fn read_i64(&mut self) -> Result<i64, WireError> {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(self.take(8)?);
        Ok(i64::from_le_bytes(bytes))
    }

    /// Read exactly `n` raw bytes.
    pub fn read_slice(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        self.take(n)
    }

    /// Read a `u32` length prefix followed by that many bytes.
    pub fn read_bytes(&mut self) -> Result<&'a [u8], WireError> {
        let offset = self.pos;
        let len = self.read_u32()? as usize;
        if len > MAX_LEN_PREFIX {
            return Err(WireError::LengthOutOfRange {
                offset,
                len,
                limit: MAX_LEN_PREFIX,
            });
        }
        self.take(len)
    }

    /// Read a `u32` element count, validated against the remaining bytes so
    /// a corrupt count fails fast instead of allocating gigabytes.
    pub fn read_count(&mut self, min_element_size: usize) -> Result<usize, WireError> {
        let offset = self.pos;
        let count = self.read_u32()? as usize;
        let floor = count.saturating_mul(min_element_size.max(1));
        if floor > self.remaining() {
            return Err(WireError::LengthOutOfRange {
                offset,
                len: count,
                limit: self.remaining() / min_element_size.max(1),
            });
        }
        Ok(count)
    }
}

/// Append helpers for the matching write side.
pub fn put_u8(out: &mut Vec<u8>, v: u8) {
    out.push(v);
}

pub fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

pub fn put_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_le_bytes());
}

pub fn put_i64(out: &mut Vec<u8>, v: i64) {
    out.extend_from_slice(&v.to_le_bytes());
}

/// Write a `u32` length prefix followed by the bytes.
pub fn put_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    put_u32(out, bytes.len() as u32);
    out.extend_from_slice(bytes);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_primitives() {
        let mut buf = Vec::new();
        put_u8(&mut buf, 7);
        put_u32(&mut buf, 0xDEAD_BEEF);
        put_u64(&mut buf, u64::MAX - 1);
        put_i64(&mut buf, -1);
        put_bytes(&mut buf, b"hello");

        let mut r = Reader::new(&buf);
        assert_eq!(r.read_u8().unwrap(), 7);
        assert_eq!(r.read_u32().unwrap(), 0xDEAD_BEEF);
        assert_eq!(r.read_u64().unwrap(), u64::MAX - 1);
        assert_eq!(r.read_i64().unwrap(), -1);
        assert_eq!(r.read_bytes().unwrap(), b"hello");
        assert!(r.is_empty());
    }

    #[test]
    fn eof_reports_offset() {
        let buf = [1u8, 2];
        let mut r = Reader::new(&buf);
        r.read_u8().unwrap();
        let err = r.read_u64().unwrap_err();
        match err {
            WireError::UnexpectedEof { offset, .. } => assert_eq!(offset, 1),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn absurd_count_is_rejected() {
        // Count claims 2^31 entries of >= 8 bytes in a 12-byte buffer.
        let mut buf = Vec::new();
        put_u32(&mut buf, 1 << 31);
        buf.extend_from_slice(&[0u8; 8]);
        let mut r = Reader::new(&buf);
        assert!(matches!(
            r.read_count(8),
            Err(WireError::LengthOutOfRange { .. })
        ));
    }
}
