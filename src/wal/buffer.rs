//! Big-endian cursor over the replication wire format.
//!
//! Grounded on the teacher's `src/buffer.rs` (`BufferReader`/`BufferWriter`);
//! kept at the same method granularity since the parser dispatches on single
//! bytes (message type, column markers) as often as on fixed-width fields.

use crate::error::{Error, Result};

const MAX_STRING_LEN: usize = 1024 * 1024;

pub struct BufferReader<'a> {
    buffer: &'a [u8],
    position: usize,
}

impl<'a> BufferReader<'a> {
    pub fn new(buffer: &'a [u8]) -> Self {
        Self { buffer, position: 0 }
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn remaining(&self) -> usize {
        self.buffer.len().saturating_sub(self.position)
    }

    pub fn has_bytes(&self, n: usize) -> bool {
        self.remaining() >= n
    }

    pub fn set_position(&mut self, position: usize) -> Result<()> {
        if position > self.buffer.len() {
            return Err(Error::buffer("position out of range"));
        }
        self.position = position;
        Ok(())
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if !self.has_bytes(n) {
            return Err(Error::buffer(format!(
                "expected {n} bytes, {} remaining",
                self.remaining()
            )));
        }
        let slice = &self.buffer[self.position..self.position + n];
        self.position += n;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_char(&mut self) -> Result<char> {
        Ok(self.read_u8()? as char)
    }

    pub fn skip_message_type(&mut self) -> Result<char> {
        self.read_char()
    }

    pub fn peek_u8(&self) -> Result<u8> {
        if !self.has_bytes(1) {
            return Err(Error::buffer("no bytes to peek"));
        }
        Ok(self.buffer[self.position])
    }

    pub fn read_i16(&mut self) -> Result<i16> {
        Ok(i16::from_be_bytes(self.take(2)?.try_into().unwrap()))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(i32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        Ok(i64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        self.take(n)
    }

    /// Reads a NUL-terminated string (relation/column names on the wire).
    pub fn read_null_terminated_string(&mut self) -> Result<String> {
        let start = self.position;
        let mut end = start;
        while end < self.buffer.len() && self.buffer[end] != 0 {
            end += 1;
            if end - start > MAX_STRING_LEN {
                return Err(Error::buffer("null-terminated string exceeds maximum length"));
            }
        }
        if end >= self.buffer.len() {
            return Err(Error::buffer("unterminated string"));
        }
        let s = String::from_utf8(self.buffer[start..end].to_vec())?;
        self.position = end + 1;
        Ok(s)
    }

    /// Reads an `i32`-length-prefixed string (tuple column text values).
    pub fn read_length_prefixed_string(&mut self) -> Result<String> {
        let len = self.read_i32()?;
        if len < 0 {
            return Err(Error::buffer("negative length prefix"));
        }
        let len = len as usize;
        if len > MAX_STRING_LEN {
            return Err(Error::buffer("length-prefixed string exceeds maximum length"));
        }
        let bytes = self.take(len)?.to_vec();
        Ok(String::from_utf8(bytes)?)
    }
}

pub struct BufferWriter {
    buffer: Vec<u8>,
}

impl BufferWriter {
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
        }
    }

    pub fn bytes_written(&self) -> usize {
        self.buffer.len()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buffer.push(value);
    }

    pub fn write_char(&mut self, value: char) {
        self.buffer.push(value as u8);
    }

    pub fn write_i16(&mut self, value: i16) {
        self.buffer.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_u32(&mut self, value: u32) {
        self.buffer.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_raw(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    pub fn write_u64(&mut self, value: u64) {
        self.buffer.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_i64(&mut self, value: i64) {
        self.buffer.extend_from_slice(&value.to_be_bytes());
    }
}

impl Default for BufferWriter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_fixed_width_fields() {
        let mut w = BufferWriter::new();
        w.write_u8(b'w');
        w.write_u64(12345);
        w.write_i64(-42);
        let bytes = w.into_bytes();

        let mut r = BufferReader::new(&bytes);
        assert_eq!(r.read_char().unwrap(), 'w');
        assert_eq!(r.read_u64().unwrap(), 12345);
        assert_eq!(r.read_i64().unwrap(), -42);
    }

    #[test]
    fn reads_null_terminated_string() {
        let mut bytes = b"public".to_vec();
        bytes.push(0);
        bytes.push(b'X');
        let mut r = BufferReader::new(&bytes);
        assert_eq!(r.read_null_terminated_string().unwrap(), "public");
        assert_eq!(r.read_char().unwrap(), 'X');
    }

    #[test]
    fn reads_length_prefixed_string() {
        let mut w = BufferWriter::new();
        w.write_u32(5);
        w.write_raw(b"hello");
        let bytes = w.into_bytes();
        let mut r = BufferReader::new(&bytes);
        assert_eq!(r.read_length_prefixed_string().unwrap(), "hello");
    }

    #[test]
    fn rejects_reads_past_end() {
        let bytes = [0u8; 2];
        let mut r = BufferReader::new(&bytes);
        assert!(r.read_u32().is_err());
    }
}
