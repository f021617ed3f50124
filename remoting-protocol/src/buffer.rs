//! Growable byte buffer with independent read and write cursors.
//!
//! The codec reads frames through the reader cursor and writes them through
//! the writer cursor. Moving the writer cursor back over already written bytes
//! and writing again overwrites them in place, which is how the body length is
//! backfilled after the body has been serialized.

use crate::error::ProtocolError;
use bytes::{Buf, BytesMut};
use std::io;

const DEFAULT_CAPACITY: usize = 256;

/// Byte buffer addressed by a reader and a writer index.
///
/// Invariant: `reader <= writer <= storage length`.
#[derive(Debug, Clone, Default)]
pub struct ByteBuffer {
    buf: BytesMut,
    reader: usize,
    writer: usize,
    marked_reader: usize,
}

impl ByteBuffer {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
            reader: 0,
            writer: 0,
            marked_reader: 0,
        }
    }

    pub fn reader_index(&self) -> usize {
        self.reader
    }

    pub fn writer_index(&self) -> usize {
        self.writer
    }

    /// Moves the writer cursor. The target must lie between the reader cursor
    /// and the furthest byte ever written.
    pub fn set_writer_index(&mut self, index: usize) -> Result<(), ProtocolError> {
        if index < self.reader || index > self.buf.len() {
            return Err(ProtocolError::InvalidWriterIndex {
                index,
                min: self.reader,
                max: self.buf.len(),
            });
        }
        self.writer = index;
        Ok(())
    }

    pub fn readable_bytes(&self) -> usize {
        self.writer - self.reader
    }

    pub fn is_readable(&self) -> bool {
        self.writer > self.reader
    }

    /// The unread bytes.
    pub fn readable(&self) -> &[u8] {
        &self.buf[self.reader..self.writer]
    }

    /// Remembers the reader cursor for a later [`reset_reader`](Self::reset_reader).
    pub fn mark_reader(&mut self) {
        self.marked_reader = self.reader;
    }

    pub fn reset_reader(&mut self) {
        self.reader = self.marked_reader.min(self.writer);
    }

    pub fn skip(&mut self, n: usize) -> Result<(), ProtocolError> {
        self.ensure_readable(n)?;
        self.reader += n;
        Ok(())
    }

    /// Drops bytes already read and shifts the rest to the front.
    pub fn discard_read_bytes(&mut self) {
        if self.reader == 0 {
            return;
        }
        self.buf.advance(self.reader);
        self.writer -= self.reader;
        self.marked_reader = self.marked_reader.saturating_sub(self.reader);
        self.reader = 0;
    }

    /// Resets both cursors, keeping the allocation.
    pub fn clear(&mut self) {
        self.buf.clear();
        self.reader = 0;
        self.writer = 0;
        self.marked_reader = 0;
    }

    pub fn write_u8(&mut self, value: u8) {
        self.write_bytes(&[value]);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.write_bytes(&value.to_be_bytes());
    }

    pub fn write_i32(&mut self, value: i32) {
        self.write_bytes(&value.to_be_bytes());
    }

    pub fn write_i64(&mut self, value: i64) {
        self.write_bytes(&value.to_be_bytes());
    }

    /// Writes at the writer cursor, overwriting or growing as needed.
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        let end = self.writer + bytes.len();
        if end > self.buf.len() {
            self.buf.resize(end, 0);
        }
        self.buf[self.writer..end].copy_from_slice(bytes);
        self.writer = end;
    }

    pub fn read_u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.read_array::<1>()?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, ProtocolError> {
        Ok(u16::from_be_bytes(self.read_array()?))
    }

    pub fn read_i32(&mut self) -> Result<i32, ProtocolError> {
        Ok(i32::from_be_bytes(self.read_array()?))
    }

    pub fn read_i64(&mut self) -> Result<i64, ProtocolError> {
        Ok(i64::from_be_bytes(self.read_array()?))
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<Vec<u8>, ProtocolError> {
        self.ensure_readable(n)?;
        let bytes = self.buf[self.reader..self.reader + n].to_vec();
        self.reader += n;
        Ok(bytes)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], ProtocolError> {
        self.ensure_readable(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buf[self.reader..self.reader + N]);
        self.reader += N;
        Ok(out)
    }

    fn ensure_readable(&self, n: usize) -> Result<(), ProtocolError> {
        let available = self.readable_bytes();
        if available < n {
            return Err(ProtocolError::Underflow {
                needed: n,
                available,
            });
        }
        Ok(())
    }
}

impl From<&[u8]> for ByteBuffer {
    fn from(bytes: &[u8]) -> Self {
        let mut buf = Self::with_capacity(bytes.len());
        buf.write_bytes(bytes);
        buf
    }
}

impl io::Write for ByteBuffer {
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        self.write_bytes(bytes);
        Ok(bytes.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
