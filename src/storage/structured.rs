//! Structured binary I/O with a running checksum.
//!
//! [`StructWriter`] and [`StructReader`] wrap a byte stream and keep a CRC32
//! of every value that passes through them. The run format writes the
//! checksum as a trailer and the reader compares it after the last record.
//!
//! Both sides return `std::io::Result` so callers can tell a truncated
//! stream (`UnexpectedEof`) from a malformed one (`InvalidData`).

use std::io::{self, Read, Write};

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use crc32fast::Hasher;

use crate::util::varint;

/// A structured writer for binary data.
pub struct StructWriter<W: Write> {
    writer: W,
    hasher: Hasher,
    scratch: Vec<u8>,
}

impl<W: Write> StructWriter<W> {
    /// Create a new structured writer.
    pub fn new(writer: W) -> Self {
        StructWriter {
            writer,
            hasher: Hasher::new(),
            scratch: Vec::with_capacity(varint::MAX_VARINT_LEN),
        }
    }

    /// Write a u8 value.
    pub fn write_u8(&mut self, value: u8) -> io::Result<()> {
        self.write_raw(&[value])
    }

    /// Write a u32 value (little-endian).
    pub fn write_u32(&mut self, value: u32) -> io::Result<()> {
        self.write_raw(&value.to_le_bytes())
    }

    /// Write a u64 value (little-endian).
    pub fn write_u64(&mut self, value: u64) -> io::Result<()> {
        self.write_raw(&value.to_le_bytes())
    }

    /// Write a variable-length integer.
    pub fn write_varint(&mut self, value: u64) -> io::Result<()> {
        self.scratch.clear();
        varint::encode_u64_into(value, &mut self.scratch);
        self.writer.write_all(&self.scratch)?;
        self.hasher.update(&self.scratch);
        Ok(())
    }

    /// Write raw bytes without length prefix.
    pub fn write_raw(&mut self, value: &[u8]) -> io::Result<()> {
        self.writer.write_all(value)?;
        self.hasher.update(value);
        Ok(())
    }

    /// CRC32 of everything written so far.
    pub fn checksum(&self) -> u32 {
        self.hasher.clone().finalize()
    }

    /// Append the checksum trailer and hand back the inner writer.
    pub fn finish(mut self) -> io::Result<W> {
        let checksum = self.checksum();
        self.writer.write_u32::<LittleEndian>(checksum)?;
        self.writer.flush()?;
        Ok(self.writer)
    }
}

/// Bytes pulled from the inner reader per refill.
const CHUNK_SIZE: usize = 8 * 1024;

/// A structured reader for binary data.
///
/// Reads the inner stream in chunks and decodes values out of the chunk.
/// Consumed bytes are fed to the checksum in bulk: whenever the chunk is
/// refilled, and when the checksum or trailer is asked for.
pub struct StructReader<R: Read> {
    reader: R,
    hasher: Hasher,
    buf: Box<[u8]>,
    /// Next unread byte in `buf`.
    pos: usize,
    /// End of the valid data in `buf`.
    filled: usize,
    /// Consumed bytes before this index are already hashed.
    hashed: usize,
    eof: bool,
    position: u64,
}

impl<R: Read> StructReader<R> {
    /// Create a new structured reader.
    pub fn new(reader: R) -> Self {
        Self::with_chunk_size(reader, CHUNK_SIZE)
    }

    /// Create a reader refilling `chunk_size` bytes at a time.
    pub fn with_chunk_size(reader: R, chunk_size: usize) -> Self {
        StructReader {
            reader,
            hasher: Hasher::new(),
            buf: vec![0u8; chunk_size.max(varint::MAX_VARINT_LEN)].into_boxed_slice(),
            pos: 0,
            filled: 0,
            hashed: 0,
            eof: false,
            position: 0,
        }
    }

    /// Read a u8 value.
    pub fn read_u8(&mut self) -> io::Result<u8> {
        Ok(self.take(1)?[0])
    }

    /// Read a u32 value (little-endian).
    pub fn read_u32(&mut self) -> io::Result<u32> {
        Ok(LittleEndian::read_u32(self.take(4)?))
    }

    /// Read a u64 value (little-endian).
    pub fn read_u64(&mut self) -> io::Result<u64> {
        Ok(LittleEndian::read_u64(self.take(8)?))
    }

    /// Read a variable-length integer.
    pub fn read_varint(&mut self) -> io::Result<u64> {
        self.fill(varint::MAX_VARINT_LEN)?;
        let (value, len) = varint::decode_u64(&self.buf[self.pos..self.filled])?;
        self.pos += len;
        self.position += len as u64;
        Ok(value)
    }

    /// Read the checksum trailer. The trailer itself is not hashed.
    pub fn read_trailer(&mut self) -> io::Result<u32> {
        self.hash_consumed();
        let value = LittleEndian::read_u32(self.take(4)?);
        self.hashed = self.pos;
        Ok(value)
    }

    /// CRC32 of everything read so far, excluding the trailer.
    pub fn checksum(&self) -> u32 {
        let mut hasher = self.hasher.clone();
        hasher.update(&self.buf[self.hashed..self.pos]);
        hasher.finalize()
    }

    /// Bytes consumed so far.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Consume exactly `len` bytes.
    fn take(&mut self, len: usize) -> io::Result<&[u8]> {
        if !self.fill(len)? {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "failed to fill whole buffer",
            ));
        }
        let start = self.pos;
        self.pos += len;
        self.position += len as u64;
        Ok(&self.buf[start..self.pos])
    }

    /// Make at least `len` unread bytes available, unless the stream ends
    /// first. Returns whether `len` bytes are available.
    fn fill(&mut self, len: usize) -> io::Result<bool> {
        if self.filled - self.pos >= len {
            return Ok(true);
        }
        if self.eof {
            return Ok(false);
        }

        self.hash_consumed();
        self.buf.copy_within(self.pos..self.filled, 0);
        self.filled -= self.pos;
        self.pos = 0;
        self.hashed = 0;

        while self.filled < len {
            match self.reader.read(&mut self.buf[self.filled..]) {
                Ok(0) => {
                    self.eof = true;
                    return Ok(false);
                }
                Ok(n) => self.filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    fn hash_consumed(&mut self) {
        self.hasher.update(&self.buf[self.hashed..self.pos]);
        self.hashed = self.pos;
    }
}
