//! Length-prefixed binary buffers used by the wire format and the store.

use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::SerializationError;

/// An append-only binary writer over a growable buffer.
///
/// All multi-byte values are little-endian; strings and byte blocks are
/// length-prefixed with a `u32`.
#[derive(Default)]
pub struct BufferWriter {
    buffer: Vec<u8>,
}

impl BufferWriter {
    /// Creates an empty writer.
    pub fn new() -> Self {
        BufferWriter { buffer: Vec::new() }
    }

    /// Creates a writer with reserved capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        BufferWriter { buffer: Vec::with_capacity(capacity) }
    }

    /// Bytes written so far.
    pub fn position(&self) -> usize {
        self.buffer.len()
    }

    /// The written bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.buffer
    }

    /// Consumes the writer, returning its buffer.
    pub fn into_vec(self) -> Vec<u8> {
        self.buffer
    }

    /// Clears the buffer, retaining its allocation.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    /// Writes a single byte.
    pub fn write_u8(&mut self, value: u8) {
        self.buffer.push(value);
    }

    /// Writes a little-endian `u32`.
    pub fn write_u32(&mut self, value: u32) {
        self.buffer.write_u32::<LittleEndian>(value).expect("vec write");
    }

    /// Writes a little-endian `u64`.
    pub fn write_u64(&mut self, value: u64) {
        self.buffer.write_u64::<LittleEndian>(value).expect("vec write");
    }

    /// Writes a little-endian `i32`.
    pub fn write_i32(&mut self, value: i32) {
        self.buffer.write_i32::<LittleEndian>(value).expect("vec write");
    }

    /// Writes a little-endian `i64`.
    pub fn write_i64(&mut self, value: i64) {
        self.buffer.write_i64::<LittleEndian>(value).expect("vec write");
    }

    /// Writes a little-endian `f64`.
    pub fn write_f64(&mut self, value: f64) {
        self.buffer.write_f64::<LittleEndian>(value).expect("vec write");
    }

    /// Writes a `u32` length prefix followed by the UTF-8 bytes.
    pub fn write_string(&mut self, value: &str) {
        self.write_u32(value.len() as u32);
        self.buffer.extend_from_slice(value.as_bytes());
    }

    /// Writes a `u32` length prefix followed by the raw bytes.
    pub fn write_bytes(&mut self, value: &[u8]) {
        self.write_u32(value.len() as u32);
        self.buffer.extend_from_slice(value);
    }

    /// Writes raw bytes with no prefix.
    pub fn write_raw(&mut self, value: &[u8]) {
        self.buffer.extend_from_slice(value);
    }
}

impl Write for BufferWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A sequential reader over a byte slice, mirroring [`BufferWriter`].
pub struct BufferReader<'a> {
    slice: &'a [u8],
    position: usize,
}

impl<'a> BufferReader<'a> {
    /// Creates a reader over `slice`.
    pub fn new(slice: &'a [u8]) -> Self {
        BufferReader { slice, position: 0 }
    }

    /// Current read offset.
    pub fn position(&self) -> usize {
        self.position
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.slice.len() - self.position
    }

    fn take(&mut self, count: usize) -> Result<&'a [u8], SerializationError> {
        if self.remaining() < count {
            return Err(SerializationError::Truncated {
                needed: count,
                available: self.remaining(),
            });
        }
        let slice = &self.slice[self.position..self.position + count];
        self.position += count;
        Ok(slice)
    }

    /// Reads a single byte.
    pub fn read_u8(&mut self) -> Result<u8, SerializationError> {
        Ok(self.take(1)?[0])
    }

    /// Reads a little-endian `u32`.
    pub fn read_u32(&mut self) -> Result<u32, SerializationError> {
        Ok(self.take(4)?.read_u32::<LittleEndian>().expect("sized read"))
    }

    /// Reads a little-endian `u64`.
    pub fn read_u64(&mut self) -> Result<u64, SerializationError> {
        Ok(self.take(8)?.read_u64::<LittleEndian>().expect("sized read"))
    }

    /// Reads a little-endian `i32`.
    pub fn read_i32(&mut self) -> Result<i32, SerializationError> {
        Ok(self.take(4)?.read_i32::<LittleEndian>().expect("sized read"))
    }

    /// Reads a little-endian `i64`.
    pub fn read_i64(&mut self) -> Result<i64, SerializationError> {
        Ok(self.take(8)?.read_i64::<LittleEndian>().expect("sized read"))
    }

    /// Reads a little-endian `f64`.
    pub fn read_f64(&mut self) -> Result<f64, SerializationError> {
        Ok(self.take(8)?.read_f64::<LittleEndian>().expect("sized read"))
    }

    /// Reads a `u32`-prefixed UTF-8 string.
    pub fn read_string(&mut self) -> Result<String, SerializationError> {
        let length = self.read_u32()? as usize;
        let bytes = self.take(length)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|error| SerializationError::Codec(error.to_string()))
    }

    /// Reads a `u32`-prefixed byte block.
    pub fn read_bytes(&mut self) -> Result<Vec<u8>, SerializationError> {
        let length = self.read_u32()? as usize;
        Ok(self.take(length)?.to_vec())
    }

    /// Reads `count` raw bytes with no prefix.
    pub fn read_raw(&mut self, count: usize) -> Result<&'a [u8], SerializationError> {
        self.take(count)
    }
}

impl<'a> Read for BufferReader<'a> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let count = buf.len().min(self.remaining());
        buf[..count].copy_from_slice(&self.slice[self.position..self.position + count]);
        self.position += count;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_scalars_and_blocks() {
        let mut writer = BufferWriter::new();
        writer.write_u8(7);
        writer.write_u32(0xDEAD_BEEF);
        writer.write_i64(-42);
        writer.write_f64(2.5);
        writer.write_string("envelope");
        writer.write_bytes(&[1, 2, 3]);

        let bytes = writer.into_vec();
        let mut reader = BufferReader::new(&bytes);
        assert_eq!(reader.read_u8().unwrap(), 7);
        assert_eq!(reader.read_u32().unwrap(), 0xDEAD_BEEF);
        assert_eq!(reader.read_i64().unwrap(), -42);
        assert_eq!(reader.read_f64().unwrap(), 2.5);
        assert_eq!(reader.read_string().unwrap(), "envelope");
        assert_eq!(reader.read_bytes().unwrap(), vec![1, 2, 3]);
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn truncated_read_is_an_error() {
        let bytes = [1u8, 0, 0];
        let mut reader = BufferReader::new(&bytes);
        assert!(matches!(
            reader.read_u32(),
            Err(SerializationError::Truncated { .. })
        ));
    }
}
