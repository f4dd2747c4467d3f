//! Growable byte buffer used for connection input and output.
//!
//! The storage is split into three regions:
//!
//! ```text
//! +-------------------+------------------+------------------+
//! | prependable bytes |  readable bytes  |  writable bytes  |
//! +-------------------+------------------+------------------+
//! 0      <=      reader_index   <=   writer_index    <=   len
//! ```
//!
//! Readers consume from the front of the readable region, writers append at
//! the end. Space freed at the front is reclaimed by sliding the readable
//! bytes back before the storage is grown.

use std::io::{self, IoSliceMut, Read};

const CHEAP_PREPEND: usize = 8;
const INITIAL_SIZE: usize = 1024;

/// Byte buffer with a readable and a writable region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Buffer {
    data: Vec<u8>,
    reader_index: usize,
    writer_index: usize,
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

impl Buffer {
    pub fn new() -> Self {
        Self::with_capacity(INITIAL_SIZE)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0; CHEAP_PREPEND + capacity],
            reader_index: CHEAP_PREPEND,
            writer_index: CHEAP_PREPEND,
        }
    }

    pub fn readable_bytes(&self) -> usize {
        self.writer_index - self.reader_index
    }

    pub fn writable_bytes(&self) -> usize {
        self.data.len() - self.writer_index
    }

    pub fn prependable_bytes(&self) -> usize {
        self.reader_index
    }

    pub fn is_empty(&self) -> bool {
        self.readable_bytes() == 0
    }

    /// Returns the readable region without consuming it.
    pub fn peek(&self) -> &[u8] {
        &self.data[self.reader_index..self.writer_index]
    }

    /// Consumes `len` readable bytes. Consuming more than is readable empties
    /// the buffer.
    pub fn retrieve(&mut self, len: usize) {
        if len < self.readable_bytes() {
            self.reader_index += len;
        } else {
            self.retrieve_all();
        }
    }

    pub fn retrieve_all(&mut self) {
        self.reader_index = CHEAP_PREPEND;
        self.writer_index = CHEAP_PREPEND;
    }

    /// Consumes up to `len` readable bytes and returns them.
    pub fn retrieve_as_vec(&mut self, len: usize) -> Vec<u8> {
        let len = len.min(self.readable_bytes());
        let out = self.data[self.reader_index..self.reader_index + len].to_vec();
        self.retrieve(len);
        out
    }

    /// Consumes the whole readable region and returns it.
    pub fn retrieve_all_as_vec(&mut self) -> Vec<u8> {
        self.retrieve_as_vec(self.readable_bytes())
    }

    pub fn append(&mut self, bytes: &[u8]) {
        self.ensure_writable(bytes.len());
        self.data[self.writer_index..self.writer_index + bytes.len()].copy_from_slice(bytes);
        self.writer_index += bytes.len();
    }

    /// Writes `bytes` in front of the readable region.
    ///
    /// # Panics
    ///
    /// Panics if fewer than `bytes.len()` prependable bytes are available.
    pub fn prepend(&mut self, bytes: &[u8]) {
        assert!(
            bytes.len() <= self.prependable_bytes(),
            "prepend of {} bytes exceeds the {} prependable bytes",
            bytes.len(),
            self.prependable_bytes()
        );
        self.reader_index -= bytes.len();
        self.data[self.reader_index..self.reader_index + bytes.len()].copy_from_slice(bytes);
    }

    pub fn ensure_writable(&mut self, len: usize) {
        if self.writable_bytes() < len {
            self.make_space(len);
        }
    }

    /// Exchanges the storage of two buffers without copying.
    pub fn swap(&mut self, other: &mut Buffer) {
        std::mem::swap(self, other);
    }

    /// Reads once from `reader` into the writable region.
    ///
    /// Data that does not fit is first read into `scratch` and appended
    /// afterwards, so a single call can take in up to
    /// `writable_bytes() + scratch.len()` bytes without growing the buffer
    /// up front.
    pub fn read_from<R: Read + ?Sized>(
        &mut self,
        reader: &mut R,
        scratch: &mut [u8],
    ) -> io::Result<usize> {
        let writable = self.writable_bytes();
        let n = {
            let (_, tail) = self.data.split_at_mut(self.writer_index);
            let mut slices = [IoSliceMut::new(tail), IoSliceMut::new(scratch)];
            reader.read_vectored(&mut slices)?
        };
        if n <= writable {
            self.writer_index += n;
        } else {
            self.writer_index = self.data.len();
            self.append(&scratch[..n - writable]);
        }
        Ok(n)
    }

    fn make_space(&mut self, len: usize) {
        if self.writable_bytes() + self.prependable_bytes() < len + CHEAP_PREPEND {
            self.data.resize(self.writer_index + len, 0);
        } else {
            let readable = self.readable_bytes();
            self.data
                .copy_within(self.reader_index..self.writer_index, CHEAP_PREPEND);
            self.reader_index = CHEAP_PREPEND;
            self.writer_index = CHEAP_PREPEND + readable;
        }
    }
}

impl From<&[u8]> for Buffer {
    fn from(bytes: &[u8]) -> Self {
        let mut buffer = Buffer::with_capacity(bytes.len());
        buffer.append(bytes);
        buffer
    }
}
