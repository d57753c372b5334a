//! Framing: big-endian fixed-width integers, u16-length-prefixed UTF-8 strings,
//! u32-length-prefixed byte blobs.

/// Largest string the codec will write (u16 length prefix).
pub const MAX_STRING_LEN: usize = u16::MAX as usize;

/// Growable output buffer for one outbound message.
#[derive(Debug, Default)]
pub struct FrameWriter {
    buf: Vec<u8>,
}

impl FrameWriter {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn with_capacity(cap: usize) -> Self {
        Self {
            buf: Vec::with_capacity(cap),
        }
    }

    pub fn write_u8(&mut self, v: u8) -> &mut Self {
        self.buf.push(v);
        self
    }

    pub fn write_u16(&mut self, v: u16) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    /// Unsigned 4-byte integer (sizes, offsets, chunk indices).
    pub fn write_int(&mut self, v: u32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn write_i32(&mut self, v: i32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    /// Length-prefixed UTF-8 string. Fails if longer than [`MAX_STRING_LEN`] bytes.
    pub fn write_string(&mut self, s: &str) -> Result<&mut Self, WireError> {
        let bytes = s.as_bytes();
        if bytes.len() > MAX_STRING_LEN {
            return Err(WireError::StringTooLong(bytes.len()));
        }
        self.write_u16(bytes.len() as u16);
        self.buf.extend_from_slice(bytes);
        Ok(self)
    }

    /// Length-prefixed byte blob (u32 length).
    pub fn write_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.write_int(bytes.len() as u32);
        self.buf.extend_from_slice(bytes);
        self
    }

    /// Bytes with no prefix; the reader must know the length (or take the rest).
    pub fn write_raw(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(bytes);
        self
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Cursor over a received message. Every read fails with [`WireError::Malformed`]
/// when the buffer runs short; nothing is consumed on failure.
#[derive(Debug, Clone)]
pub struct FrameReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> FrameReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn read_exact(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        if self.remaining() < n {
            return Err(WireError::Malformed {
                needed: n,
                available: self.remaining(),
            });
        }
        let out = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, WireError> {
        Ok(self.read_exact(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, WireError> {
        let b = self.read_exact(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn read_int(&mut self) -> Result<u32, WireError> {
        let b = self.read_exact(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_i32(&mut self) -> Result<i32, WireError> {
        let b = self.read_exact(4)?;
        Ok(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_string(&mut self) -> Result<String, WireError> {
        let mark = self.pos;
        let len = self.read_u16()? as usize;
        let raw = match self.read_exact(len) {
            Ok(raw) => raw,
            Err(e) => {
                self.pos = mark;
                return Err(e);
            }
        };
        String::from_utf8(raw.to_vec()).map_err(|_| {
            self.pos = mark;
            WireError::InvalidUtf8
        })
    }

    pub fn read_bytes(&mut self) -> Result<&'a [u8], WireError> {
        let mark = self.pos;
        let len = self.read_int()? as usize;
        self.read_exact(len).inspect_err(|_| self.pos = mark)
    }

    /// Everything not yet consumed (may be empty).
    pub fn read_rest(&mut self) -> &'a [u8] {
        let out = &self.bytes[self.pos..];
        self.pos = self.bytes.len();
        out
    }
}

/// Error decoding or encoding a primitive value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("malformed message: needed {needed} bytes, {available} available")]
    Malformed { needed: usize, available: usize },
    #[error("malformed message: string is not valid UTF-8")]
    InvalidUtf8,
    #[error("string of {0} bytes exceeds the length prefix")]
    StringTooLong(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integers_are_big_endian() {
        let mut w = FrameWriter::new();
        w.write_int(0x0102_0304).write_u16(0x0506).write_i32(-2);
        assert_eq!(
            w.into_bytes(),
            vec![1, 2, 3, 4, 5, 6, 0xFF, 0xFF, 0xFF, 0xFE]
        );
    }

    #[test]
    fn mixed_values_read_back_in_order() {
        let mut w = FrameWriter::new();
        w.write_u8(7).write_int(10_000);
        w.write_string("ünïcode name.txt").unwrap();
        w.write_bytes(&[9, 8, 7]).write_raw(b"tail");
        let bytes = w.into_bytes();

        let mut r = FrameReader::new(&bytes);
        assert_eq!(r.read_u8().unwrap(), 7);
        assert_eq!(r.read_int().unwrap(), 10_000);
        assert_eq!(r.read_string().unwrap(), "ünïcode name.txt");
        assert_eq!(r.read_bytes().unwrap(), &[9, 8, 7]);
        assert_eq!(r.read_rest(), b"tail");
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn short_int_is_malformed() {
        let mut r = FrameReader::new(&[0, 1, 2]);
        assert_eq!(
            r.read_int(),
            Err(WireError::Malformed {
                needed: 4,
                available: 3
            })
        );
        // Nothing consumed.
        assert_eq!(r.position(), 0);
    }

    #[test]
    fn truncated_string_is_malformed_and_not_consumed() {
        let mut w = FrameWriter::new();
        w.write_string("abcdef").unwrap();
        let bytes = w.into_bytes();
        let mut r = FrameReader::new(&bytes[..5]);
        assert!(matches!(r.read_string(), Err(WireError::Malformed { .. })));
        assert_eq!(r.position(), 0);
    }

    #[test]
    fn invalid_utf8_rejected() {
        let bytes = [0u8, 2, 0xC3, 0x28];
        let mut r = FrameReader::new(&bytes);
        assert_eq!(r.read_string(), Err(WireError::InvalidUtf8));
    }

    #[test]
    fn oversized_string_refused() {
        let long = "a".repeat(MAX_STRING_LEN + 1);
        let mut w = FrameWriter::new();
        assert!(matches!(
            w.write_string(&long),
            Err(WireError::StringTooLong(_))
        ));
        assert!(w.is_empty());
    }

    #[test]
    fn read_rest_on_empty_tail() {
        let mut r = FrameReader::new(&[1]);
        r.read_u8().unwrap();
        assert!(r.read_rest().is_empty());
    }
}
