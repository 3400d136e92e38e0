//! Encoding and decoding errors.
//!
//! Both are protocol-fatal: an [`EncodeError`] means the artifact cannot be
//! expressed in the negotiated protocol, and a [`DecodeError`] means the
//! stream was malformed. Neither is ever retried.

use thiserror::Error;

use crate::artifact::ReferenceKind;

/// Failure to encode an artifact. No partial stream is produced.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    /// A reference points outside the code buffer.
    #[error("reference at offset {offset} is outside the code buffer (len {code_len})")]
    OffsetOutOfBounds {
        /// Offending offset.
        offset: u32,
        /// Length of the code buffer.
        code_len: usize,
    },

    /// A source comment points past the end of the code buffer.
    #[error("comment at offset {offset} is past the end of the code buffer (len {code_len})")]
    CommentOutOfBounds {
        /// Offending offset.
        offset: u32,
        /// Length of the code buffer.
        code_len: usize,
    },

    /// The reference kind did not exist in the negotiated protocol version.
    #[error("reference kind {kind:?} requires protocol v{required}, negotiated v{negotiated}")]
    UnsupportedReferenceKind {
        /// Offending kind.
        kind: ReferenceKind,
        /// Minimum version the kind needs.
        required: u8,
        /// Version the encoder was configured for.
        negotiated: u8,
    },

    /// The encoder was configured for a version this crate cannot produce.
    #[error("unsupported protocol version {0}")]
    UnsupportedProtocolVersion(u8),

    /// A section length does not fit the 32-bit length prefix.
    #[error("{section} section too large ({len} entries)")]
    SectionTooLarge {
        /// Section name.
        section: &'static str,
        /// Number of entries or bytes.
        len: usize,
    },
}

/// Malformed stream detected while decoding.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Stream does not start with the expected magic.
    #[error("bad stream magic")]
    BadMagic,

    /// Stream was produced by an unknown protocol version.
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    /// Stream ended early.
    #[error("stream truncated: needed {needed} bytes at offset {at}")]
    Truncated {
        /// Bytes requested.
        needed: usize,
        /// Stream offset of the read.
        at: usize,
    },

    /// Unknown reference kind byte.
    #[error("unknown reference kind {0:#04x}")]
    UnknownReferenceKind(u8),

    /// Unknown reference target tag.
    #[error("unknown reference target tag {0:#04x}")]
    UnknownTargetTag(u8),

    /// Unknown dependency-assumption tag.
    #[error("unknown assumption tag {0:#04x}")]
    UnknownAssumptionTag(u8),

    /// Unknown pool-entry kind in type info.
    #[error("unknown pool entry tag {0:#04x}")]
    UnknownPoolTag(u8),

    /// Payload indexes past the end of the object pool.
    #[error("object pool index {index} out of range (pool len {len})")]
    PoolIndexOutOfRange {
        /// Index found in the payload.
        index: u32,
        /// Number of pool entries.
        len: usize,
    },

    /// Type info embedded in the payload disagrees with the pool entry.
    #[error("type info mismatch for object pool index {index}")]
    TypeInfoMismatch {
        /// Pool index.
        index: u32,
    },

    /// Pool entry has a different kind than the payload position requires.
    #[error("object pool index {index} is not a {expected}")]
    UnexpectedPoolEntry {
        /// Pool index.
        index: u32,
        /// Kind the payload position requires.
        expected: &'static str,
    },

    /// Decoded reference offset is outside the decoded code.
    #[error("decoded reference offset {offset} outside code (len {code_len})")]
    OffsetOutOfBounds {
        /// Offending offset.
        offset: u32,
        /// Decoded code length.
        code_len: usize,
    },

    /// Decoded comment offset is past the end of the decoded code.
    #[error("decoded comment offset {offset} past end of code (len {code_len})")]
    CommentOutOfBounds {
        /// Offending offset.
        offset: u32,
        /// Decoded code length.
        code_len: usize,
    },

    /// A string was not valid UTF-8.
    #[error("invalid utf-8 in stream")]
    InvalidUtf8,

    /// The end-of-payload marker is missing or corrupted.
    #[error("bad end-of-payload marker {0:#010x}")]
    BadEndMarker(u32),

    /// Bytes remain after the end marker.
    #[error("{0} trailing bytes after end marker")]
    TrailingBytes(usize),

    /// A speculation record is not in the tagged layout.
    #[error("malformed speculation record: {reason}")]
    MalformedRecord {
        /// What was wrong.
        reason: &'static str,
    },
}
