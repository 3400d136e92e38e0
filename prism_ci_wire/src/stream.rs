//! Chunked binary stream.
//!
//! # Layout
//!
//! ```text
//! ┌──────────────────────── header (16 bytes, first chunk) ───────────────────────┐
//! │ magic "PCIS" │ version u8 │ flags u8 │ reserved u16 │ encode time ns u64 (LE) │
//! └───────────────────────────────────────────────────────────────────────────────┘
//! payload bytes, split across fixed-size chunks (the last one may be short)
//! ```
//!
//! The header alone tells a reader which optional sections follow. All
//! multi-byte values are little-endian.

use crate::error::DecodeError;
use crate::flags::EncodingFlags;
use crate::pool::ObjectPool;

// =============================================================================
// Constants
// =============================================================================

/// Stream magic.
pub const MAGIC: [u8; 4] = *b"PCIS";

/// Newest protocol version this crate reads and writes.
pub const PROTOCOL_VERSION: u8 = 2;

/// Oldest protocol version this crate reads and writes.
pub const MIN_PROTOCOL_VERSION: u8 = 1;

/// Size of the fixed header in bytes.
pub const HEADER_SIZE: usize = 16;

/// Default payload chunk size.
pub const DEFAULT_CHUNK_SIZE: usize = 4096;

// =============================================================================
// Header
// =============================================================================

/// Decoded stream header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamHeader {
    /// Protocol version the payload uses.
    pub version: u8,
    /// Sections present in the payload.
    pub flags: EncodingFlags,
    /// Nanoseconds the encoder spent producing the stream.
    pub encode_nanos: u64,
}

impl StreamHeader {
    /// Serialize into the fixed header layout.
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[0..4].copy_from_slice(&MAGIC);
        bytes[4] = self.version;
        bytes[5] = self.flags.to_byte();
        bytes[8..16].copy_from_slice(&self.encode_nanos.to_le_bytes());
        bytes
    }

    /// Parse the fixed header layout.
    pub fn parse(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() < HEADER_SIZE {
            return Err(DecodeError::Truncated {
                needed: HEADER_SIZE,
                at: 0,
            });
        }
        if bytes[0..4] != MAGIC {
            return Err(DecodeError::BadMagic);
        }
        let version = bytes[4];
        if !(MIN_PROTOCOL_VERSION..=PROTOCOL_VERSION).contains(&version) {
            return Err(DecodeError::UnsupportedVersion(version));
        }
        let mut nanos = [0u8; 8];
        nanos.copy_from_slice(&bytes[8..16]);
        Ok(Self {
            version,
            flags: EncodingFlags::from_byte(bytes[5]),
            encode_nanos: u64::from_le_bytes(nanos),
        })
    }
}

// =============================================================================
// Chunked Writer
// =============================================================================

/// Append-only writer that spills into fixed-size chunks.
#[derive(Debug)]
pub(crate) struct ChunkedWriter {
    chunk_size: usize,
    chunks: Vec<Vec<u8>>,
    current: Vec<u8>,
    len: usize,
}

impl ChunkedWriter {
    pub(crate) fn new(chunk_size: usize) -> Self {
        let chunk_size = chunk_size.max(HEADER_SIZE);
        Self {
            chunk_size,
            chunks: Vec::new(),
            current: Vec::with_capacity(chunk_size),
            len: 0,
        }
    }

    pub(crate) fn put_bytes(&mut self, mut bytes: &[u8]) {
        self.len += bytes.len();
        while !bytes.is_empty() {
            let room = self.chunk_size - self.current.len();
            let n = room.min(bytes.len());
            self.current.extend_from_slice(&bytes[..n]);
            bytes = &bytes[n..];
            if self.current.len() == self.chunk_size {
                let full = std::mem::replace(&mut self.current, Vec::with_capacity(self.chunk_size));
                self.chunks.push(full);
            }
        }
    }

    #[inline]
    pub(crate) fn put_u8(&mut self, value: u8) {
        self.put_bytes(&[value]);
    }

    #[inline]
    pub(crate) fn put_u32(&mut self, value: u32) {
        self.put_bytes(&value.to_le_bytes());
    }

    #[inline]
    pub(crate) fn put_u64(&mut self, value: u64) {
        self.put_bytes(&value.to_le_bytes());
    }

    #[inline]
    pub(crate) fn put_i64(&mut self, value: i64) {
        self.put_bytes(&value.to_le_bytes());
    }

    /// Length-prefixed byte string. Callers validate that the length fits
    /// the 32-bit prefix before writing.
    pub(crate) fn put_blob(&mut self, bytes: &[u8]) {
        debug_assert!(u32::try_from(bytes.len()).is_ok());
        self.put_u32(bytes.len() as u32);
        self.put_bytes(bytes);
    }

    /// Overwrite the header, which always lives in the first chunk.
    pub(crate) fn patch_header(&mut self, header: &StreamHeader) {
        let bytes = header.to_bytes();
        let first = self.chunks.first_mut().unwrap_or(&mut self.current);
        first[..HEADER_SIZE].copy_from_slice(&bytes);
    }

    pub(crate) fn finish(mut self) -> (Vec<Box<[u8]>>, usize) {
        if !self.current.is_empty() {
            self.chunks.push(self.current);
        }
        let chunks = self.chunks.into_iter().map(Vec::into_boxed_slice).collect();
        (chunks, self.len)
    }
}

// =============================================================================
// Stream Reader
// =============================================================================

/// Cursor over the chunks of an [`EncodedStream`].
#[derive(Debug, Clone)]
pub(crate) struct StreamReader<'a> {
    chunks: &'a [Box<[u8]>],
    chunk: usize,
    pos: usize,
    consumed: usize,
    total: usize,
}

impl<'a> StreamReader<'a> {
    fn new(chunks: &'a [Box<[u8]>], total: usize) -> Self {
        Self {
            chunks,
            chunk: 0,
            pos: 0,
            consumed: 0,
            total,
        }
    }

    #[inline]
    pub(crate) fn remaining(&self) -> usize {
        self.total - self.consumed
    }

    pub(crate) fn read_into(&mut self, out: &mut [u8]) -> Result<(), DecodeError> {
        if out.len() > self.remaining() {
            return Err(DecodeError::Truncated {
                needed: out.len(),
                at: self.consumed,
            });
        }
        let mut filled = 0;
        while filled < out.len() {
            let chunk = &self.chunks[self.chunk];
            let n = (chunk.len() - self.pos).min(out.len() - filled);
            out[filled..filled + n].copy_from_slice(&chunk[self.pos..self.pos + n]);
            filled += n;
            self.pos += n;
            if self.pos == chunk.len() {
                self.chunk += 1;
                self.pos = 0;
            }
        }
        self.consumed += out.len();
        Ok(())
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        self.read_into(&mut out)?;
        Ok(out)
    }

    #[inline]
    pub(crate) fn read_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.read_array::<1>()?[0])
    }

    #[inline]
    pub(crate) fn read_u32(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    #[inline]
    pub(crate) fn read_u64(&mut self) -> Result<u64, DecodeError> {
        Ok(u64::from_le_bytes(self.read_array()?))
    }

    #[inline]
    pub(crate) fn read_i64(&mut self) -> Result<i64, DecodeError> {
        Ok(i64::from_le_bytes(self.read_array()?))
    }

    /// Length-prefixed byte string. The length is checked against what is
    /// left before anything is allocated.
    pub(crate) fn read_blob(&mut self) -> Result<Vec<u8>, DecodeError> {
        let len = self.read_u32()? as usize;
        if len > self.remaining() {
            return Err(DecodeError::Truncated {
                needed: len,
                at: self.consumed,
            });
        }
        let mut out = vec![0u8; len];
        self.read_into(&mut out)?;
        Ok(out)
    }

    pub(crate) fn read_str(&mut self) -> Result<String, DecodeError> {
        String::from_utf8(self.read_blob()?).map_err(|_| DecodeError::InvalidUtf8)
    }

    /// Read a section count, rejecting counts that cannot fit in what is
    /// left given each entry takes at least `min_entry_size` bytes.
    pub(crate) fn read_count(&mut self, min_entry_size: usize) -> Result<usize, DecodeError> {
        let count = self.read_u32()? as usize;
        let needed = count.saturating_mul(min_entry_size.max(1));
        if needed > self.remaining() {
            return Err(DecodeError::Truncated {
                needed,
                at: self.consumed,
            });
        }
        Ok(count)
    }
}

// =============================================================================
// Encoded Stream
// =============================================================================

/// The wire representation of one artifact.
///
/// Not `Clone`: a stream is consumed by the single submission it was
/// produced for.
#[derive(Debug)]
pub struct EncodedStream {
    chunks: Vec<Box<[u8]>>,
    len: usize,
    pool: ObjectPool,
}

impl EncodedStream {
    pub(crate) fn from_parts(chunks: Vec<Box<[u8]>>, len: usize, pool: ObjectPool) -> Self {
        Self { chunks, len, pool }
    }

    /// Reassemble a stream from raw bytes and a pool, splitting the bytes
    /// into chunks of `chunk_size`.
    pub fn from_bytes(bytes: &[u8], chunk_size: usize, pool: ObjectPool) -> Self {
        let chunk_size = chunk_size.max(1);
        let chunks = bytes
            .chunks(chunk_size)
            .map(|c| c.to_vec().into_boxed_slice())
            .collect();
        Self {
            chunks,
            len: bytes.len(),
            pool,
        }
    }

    /// Parse the header without touching the payload.
    pub fn header(&self) -> Result<StreamHeader, DecodeError> {
        match self.chunks.first() {
            Some(first) if first.len() >= HEADER_SIZE => StreamHeader::parse(first),
            _ => {
                let mut reader = self.reader();
                let mut bytes = [0u8; HEADER_SIZE];
                reader.read_into(&mut bytes)?;
                StreamHeader::parse(&bytes)
            }
        }
    }

    /// Total encoded length in bytes, header included.
    #[inline]
    pub fn byte_len(&self) -> usize {
        self.len
    }

    /// Number of payload chunks.
    #[inline]
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// The side object pool.
    #[inline]
    pub fn pool(&self) -> &ObjectPool {
        &self.pool
    }

    /// Copy all chunks into one contiguous buffer.
    pub fn to_contiguous(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len);
        for chunk in &self.chunks {
            out.extend_from_slice(chunk);
        }
        out
    }

    pub(crate) fn reader(&self) -> StreamReader<'_> {
        StreamReader::new(&self.chunks, self.len)
    }
}

// =============================================================================
// Tests
// =============================================================================
