//! Bounds-checked cursor over a byte slice. Every read returns a `DecodeError`
//! instead of panicking, which is what lets `decode()` at the layer above be
//! total: a short or garbled buffer ends in `Err`, never a panic.

use crate::errors::{DecodeError, DecodeResult};

const MAX_STRING_LENGTH: usize = 1024 * 1024;

#[derive(Debug)]
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

    pub fn has_bytes(&self, count: usize) -> bool {
        self.remaining() >= count
    }

    fn need(&self, count: usize) -> DecodeResult<()> {
        if !self.has_bytes(count) {
            return Err(DecodeError::Truncated {
                needed: count,
                got: self.remaining(),
            });
        }
        Ok(())
    }

    pub fn read_u8(&mut self) -> DecodeResult<u8> {
        self.need(1)?;
        let value = self.buffer[self.position];
        self.position += 1;
        Ok(value)
    }

    pub fn read_char(&mut self) -> DecodeResult<char> {
        Ok(self.read_u8()? as char)
    }

    pub fn read_i16(&mut self) -> DecodeResult<i16> {
        self.need(2)?;
        let value = i16::from_be_bytes(self.buffer[self.position..self.position + 2].try_into().unwrap());
        self.position += 2;
        Ok(value)
    }

    pub fn read_u16(&mut self) -> DecodeResult<u16> {
        self.need(2)?;
        let value = u16::from_be_bytes(self.buffer[self.position..self.position + 2].try_into().unwrap());
        self.position += 2;
        Ok(value)
    }

    pub fn read_u32(&mut self) -> DecodeResult<u32> {
        self.need(4)?;
        let value = u32::from_be_bytes(self.buffer[self.position..self.position + 4].try_into().unwrap());
        self.position += 4;
        Ok(value)
    }

    pub fn read_i32(&mut self) -> DecodeResult<i32> {
        self.need(4)?;
        let value = i32::from_be_bytes(self.buffer[self.position..self.position + 4].try_into().unwrap());
        self.position += 4;
        Ok(value)
    }

    pub fn read_u64(&mut self) -> DecodeResult<u64> {
        self.need(8)?;
        let value = u64::from_be_bytes(self.buffer[self.position..self.position + 8].try_into().unwrap());
        self.position += 8;
        Ok(value)
    }

    pub fn read_i64(&mut self) -> DecodeResult<i64> {
        self.need(8)?;
        let value = i64::from_be_bytes(self.buffer[self.position..self.position + 8].try_into().unwrap());
        self.position += 8;
        Ok(value)
    }

    /// Reads a NUL-terminated UTF-8 string, consuming the terminator.
    pub fn read_cstr(&mut self) -> DecodeResult<String> {
        let start = self.position;
        while self.position < self.buffer.len() && self.buffer[self.position] != 0 {
            self.position += 1;
        }
        if self.position >= self.buffer.len() {
            return Err(DecodeError::UnterminatedString);
        }
        let bytes = &self.buffer[start..self.position];
        let value = String::from_utf8(bytes.to_vec()).map_err(|_| DecodeError::InvalidUtf8)?;
        self.position += 1;
        Ok(value)
    }

    /// Reads a u32 length prefix followed by that many raw bytes.
    pub fn read_length_prefixed_bytes(&mut self) -> DecodeResult<Vec<u8>> {
        let length = self.read_u32()? as usize;
        if length > MAX_STRING_LENGTH {
            return Err(DecodeError::Truncated {
                needed: length,
                got: self.remaining(),
            });
        }
        self.read_bytes(length)
    }

    pub fn read_bytes(&mut self, count: usize) -> DecodeResult<Vec<u8>> {
        self.need(count)?;
        let bytes = self.buffer[self.position..self.position + count].to_vec();
        self.position += count;
        Ok(bytes)
    }
}

/// A cursor over a mutable byte slice, used to build the `StandbyStatusUpdate`
/// feedback message (§4.3).
#[derive(Debug)]
pub struct BufferWriter<'a> {
    buffer: &'a mut [u8],
    position: usize,
}

impl<'a> BufferWriter<'a> {
    pub fn new(buffer: &'a mut [u8]) -> Self {
        Self { buffer, position: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buffer.len().saturating_sub(self.position)
    }

    pub fn has_space(&self, count: usize) -> bool {
        self.remaining() >= count
    }

    pub fn bytes_written(&self) -> usize {
        self.position
    }

    pub fn write_u8(&mut self, value: u8) -> DecodeResult<()> {
        if !self.has_space(1) {
            return Err(DecodeError::Truncated { needed: 1, got: self.remaining() });
        }
        self.buffer[self.position] = value;
        self.position += 1;
        Ok(())
    }

    pub fn write_char(&mut self, value: char) -> DecodeResult<()> {
        self.write_u8(value as u8)
    }

    pub fn write_u64(&mut self, value: u64) -> DecodeResult<()> {
        if !self.has_space(8) {
            return Err(DecodeError::Truncated { needed: 8, got: self.remaining() });
        }
        self.buffer[self.position..self.position + 8].copy_from_slice(&value.to_be_bytes());
        self.position += 8;
        Ok(())
    }

    pub fn write_i64(&mut self, value: i64) -> DecodeResult<()> {
        if !self.has_space(8) {
            return Err(DecodeError::Truncated { needed: 8, got: self.remaining() });
        }
        self.buffer[self.position..self.position + 8].copy_from_slice(&value.to_be_bytes());
        self.position += 8;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_big_endian_integers() {
        let buf = [0x00, 0x00, 0x00, 0x2a];
        let mut reader = BufferReader::new(&buf);
        assert_eq!(reader.read_u32().unwrap(), 42);
    }

    #[test]
    fn truncated_read_is_an_error_not_a_panic() {
        let buf = [0x01];
        let mut reader = BufferReader::new(&buf);
        assert!(reader.read_u32().is_err());
    }

    #[test]
    fn cstr_requires_terminator() {
        let buf = b"hello";
        let mut reader = BufferReader::new(buf);
        assert!(reader.read_cstr().is_err());

        let buf = b"hello\0world";
        let mut reader = BufferReader::new(buf);
        assert_eq!(reader.read_cstr().unwrap(), "hello");
        assert_eq!(reader.read_cstr().unwrap(), "world");
    }

    #[test]
    fn writer_round_trips_standby_status_update_shape() {
        let mut buf = [0u8; 34];
        {
            let mut writer = BufferWriter::new(&mut buf);
            writer.write_u8(b'r').unwrap();
            writer.write_u64(100).unwrap();
            writer.write_u64(100).unwrap();
            writer.write_u64(90).unwrap();
            writer.write_i64(1234).unwrap();
            writer.write_u8(0).unwrap();
            assert_eq!(writer.bytes_written(), 34);
        }
        let mut reader = BufferReader::new(&buf);
        assert_eq!(reader.read_char().unwrap(), 'r');
        assert_eq!(reader.read_u64().unwrap(), 100);
    }
}
