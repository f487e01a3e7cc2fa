use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("buffer underflow: needed {needed} more bytes, {remaining} remaining")]
    Underflow { needed: usize, remaining: usize },
    #[error("string field is not valid utf-8")]
    InvalidString,
    #[error("unknown message type {0}")]
    UnknownMessageType(u8),
    #[error("unknown operation code {0}")]
    UnknownOperation(u8),
}

/// Append-only wire buffer. All integers are written big-endian, strings as a
/// u16 length prefix followed by raw bytes.
#[derive(Default)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn put_u8(&mut self, val: u8) -> &mut Self {
        self.buf.push(val);
        self
    }

    pub fn put_u16(&mut self, val: u16) -> &mut Self {
        self.buf.extend_from_slice(&val.to_be_bytes());
        self
    }

    pub fn put_u32(&mut self, val: u32) -> &mut Self {
        self.buf.extend_from_slice(&val.to_be_bytes());
        self
    }

    // i32 travels as the two's-complement bit pattern of a u32
    pub fn put_i32(&mut self, val: i32) -> &mut Self {
        self.put_u32(val as u32)
    }

    pub fn put_str(&mut self, val: &str) -> &mut Self {
        debug_assert!(val.len() <= u16::MAX as usize);
        self.put_u16(val.len() as u16);
        self.buf.extend_from_slice(val.as_bytes());
        self
    }

    pub fn put_bytes(&mut self, val: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(val);
        self
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Cursor-based reader over a received datagram. Reading past the end of the
/// buffer fails with [`DecodeError::Underflow`] rather than panicking.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        let remaining = self.buf.len() - self.pos;
        if remaining < n {
            return Err(DecodeError::Underflow {
                needed: n - remaining,
                remaining,
            });
        }

        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn get_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    pub fn get_u16(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_be_bytes(self.take(2)?.try_into().unwrap()))
    }

    pub fn get_u32(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn get_i32(&mut self) -> Result<i32, DecodeError> {
        Ok(self.get_u32()? as i32)
    }

    pub fn get_str(&mut self) -> Result<String, DecodeError> {
        let len = self.get_u16()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| DecodeError::InvalidString)
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitives_round_trip() {
        let mut w = Writer::new();
        w.put_u8(7)
            .put_u16(0xBEEF)
            .put_u32(0xDEAD_BEEF)
            .put_i32(-30)
            .put_str("Lab_101");

        let buf = w.into_bytes();
        let mut r = Reader::new(&buf);
        assert_eq!(r.get_u8().unwrap(), 7);
        assert_eq!(r.get_u16().unwrap(), 0xBEEF);
        assert_eq!(r.get_u32().unwrap(), 0xDEAD_BEEF);
        assert_eq!(r.get_i32().unwrap(), -30);
        assert_eq!(r.get_str().unwrap(), "Lab_101");
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn integers_are_big_endian() {
        let mut w = Writer::new();
        w.put_u32(0x0102_0304);
        assert_eq!(w.as_slice(), &[1, 2, 3, 4]);

        let mut w = Writer::new();
        w.put_u16(0x0102);
        assert_eq!(w.as_slice(), &[1, 2]);
    }

    #[test]
    fn string_has_length_prefix_and_no_terminator() {
        let mut w = Writer::new();
        w.put_str("hi");
        assert_eq!(w.as_slice(), &[0, 2, b'h', b'i']);
    }

    #[test]
    fn negative_offset_travels_as_bit_pattern() {
        let mut w = Writer::new();
        w.put_i32(-1);
        assert_eq!(w.as_slice(), &[0xFF, 0xFF, 0xFF, 0xFF]);

        let mut r = Reader::new(&[0xFF, 0xFF, 0xFF, 0xE2]);
        assert_eq!(r.get_i32().unwrap(), -30);
    }

    #[test]
    fn read_past_end_underflows() {
        let mut r = Reader::new(&[0, 1]);
        assert_eq!(r.get_u16().unwrap(), 1);
        assert!(matches!(
            r.get_u32(),
            Err(DecodeError::Underflow {
                needed: 4,
                remaining: 0
            })
        ));
    }

    #[test]
    fn truncated_string_underflows() {
        // declares 10 bytes, carries 2
        let mut r = Reader::new(&[0, 10, b'a', b'b']);
        assert!(matches!(r.get_str(), Err(DecodeError::Underflow { .. })));
    }

    #[test]
    fn invalid_utf8_is_rejected() {
        let mut r = Reader::new(&[0, 2, 0xFF, 0xFE]);
        assert_eq!(r.get_str(), Err(DecodeError::InvalidString));
    }
}
