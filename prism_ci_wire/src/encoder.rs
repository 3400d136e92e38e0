//! Artifact encoder.
//!
//! # Payload Layout
//!
//! ```text
//! header                                  (see stream module)
//! unit u64 | compile_id u32 | name blob
//! code blob
//! refs:        count u32 | { offset u32 | kind u8 | target }*
//!   target:    0x00 raw i64 | 0x01 pool-ref
//!   pool-ref:  index u32 [ | tag u8 [ | type u32 if object ] ]   (bracket = type info)
//! assumptions: count u32 | { tag u8 | fields }*
//! comments:    count u32 | { offset u32 | text blob }*            (if flagged)
//! methods:     count u32 | { pool-ref }*                          (if flagged)
//! end marker u32
//! ```
//!
//! Validation runs before a single byte is written, so an artifact that
//! fails to encode never yields a partial stream.

use std::time::Instant;

use tracing::trace;

use crate::artifact::{CompiledArtifact, DependencyAssumption, ReferenceTarget, RuntimeRef};
use crate::error::EncodeError;
use crate::flags::EncodingFlags;
use crate::pool::ObjectPool;
use crate::stream::{
    ChunkedWriter, DEFAULT_CHUNK_SIZE, EncodedStream, HEADER_SIZE, MIN_PROTOCOL_VERSION,
    PROTOCOL_VERSION, StreamHeader,
};

// =============================================================================
// Wire Tags
// =============================================================================

pub(crate) const TARGET_RAW: u8 = 0x00;
pub(crate) const TARGET_POOL: u8 = 0x01;

pub(crate) const POOL_TYPE: u8 = 0x00;
pub(crate) const POOL_METHOD: u8 = 0x01;
pub(crate) const POOL_OBJECT: u8 = 0x02;

pub(crate) const ASSUME_LEAF_TYPE: u8 = 0x00;
pub(crate) const ASSUME_CONCRETE_METHOD: u8 = 0x01;
pub(crate) const ASSUME_NO_FINALIZABLE_SUBCLASS: u8 = 0x02;
pub(crate) const ASSUME_SPECULATION: u8 = 0x03;

pub(crate) const END_MARKER: u32 = 0xC0DE_E0F5;

// =============================================================================
// Encoder
// =============================================================================

/// Serializes a [`CompiledArtifact`] into an [`EncodedStream`].
///
/// The encoder is configuration only; it holds no state between calls.
#[derive(Debug, Clone, Copy)]
pub struct ArtifactEncoder {
    flags: EncodingFlags,
    version: u8,
    chunk_size: usize,
}

impl ArtifactEncoder {
    /// Create an encoder for the newest protocol version.
    pub fn new(flags: EncodingFlags) -> Self {
        Self {
            flags,
            version: PROTOCOL_VERSION,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Encode for an older negotiated protocol version.
    pub fn with_protocol_version(mut self, version: u8) -> Self {
        self.version = version;
        self
    }

    /// Set the payload chunk size. Values below the header size are raised
    /// to it.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(HEADER_SIZE);
        self
    }

    /// Flags this encoder writes.
    #[inline]
    pub fn flags(&self) -> EncodingFlags {
        self.flags
    }

    /// Encode `artifact`. The artifact is not modified.
    pub fn encode(&self, artifact: &CompiledArtifact) -> Result<EncodedStream, EncodeError> {
        let started = Instant::now();
        self.validate(artifact)?;

        let mut out = ChunkedWriter::new(self.chunk_size);
        let mut pool = ObjectPool::new();

        // Placeholder; patched once the encode time is known.
        out.put_bytes(&[0u8; HEADER_SIZE]);

        out.put_u64(artifact.unit().as_u64());
        out.put_u32(artifact.compile_id().as_u32());
        out.put_blob(artifact.name().as_bytes());
        out.put_blob(artifact.code());

        out.put_u32(len_u32("references", artifact.references().len())?);
        for reference in artifact.references() {
            out.put_u32(reference.offset);
            out.put_u8(reference.kind as u8);
            match &reference.target {
                ReferenceTarget::Raw(value) => {
                    out.put_u8(TARGET_RAW);
                    out.put_i64(*value);
                }
                ReferenceTarget::Runtime(entry) => {
                    out.put_u8(TARGET_POOL);
                    self.put_pool_ref(&mut out, &mut pool, entry);
                }
            }
        }

        out.put_u32(len_u32("assumptions", artifact.assumptions().len())?);
        for assumption in artifact.assumptions() {
            self.put_assumption(&mut out, &mut pool, assumption);
        }

        if self.flags.include_comments {
            out.put_u32(len_u32("comments", artifact.comments().len())?);
            for comment in artifact.comments() {
                out.put_u32(comment.offset);
                out.put_blob(comment.text.as_bytes());
            }
        }

        if self.flags.include_methods {
            out.put_u32(len_u32("methods", artifact.methods().len())?);
            for method in artifact.methods() {
                self.put_pool_ref(&mut out, &mut pool, &RuntimeRef::Method(*method));
            }
        }

        out.put_u32(END_MARKER);

        let header = StreamHeader {
            version: self.version,
            flags: self.flags,
            encode_nanos: started.elapsed().as_nanos() as u64,
        };
        out.patch_header(&header);
        let (chunks, len) = out.finish();

        trace!(
            unit = artifact.unit().as_u64(),
            compile_id = artifact.compile_id().as_u32(),
            bytes = len,
            chunks = chunks.len(),
            pool = pool.len(),
            "encoded artifact"
        );

        Ok(EncodedStream::from_parts(chunks, len, pool))
    }

    fn validate(&self, artifact: &CompiledArtifact) -> Result<(), EncodeError> {
        if !(MIN_PROTOCOL_VERSION..=PROTOCOL_VERSION).contains(&self.version) {
            return Err(EncodeError::UnsupportedProtocolVersion(self.version));
        }
        let code_len = artifact.code().len();
        len_u32("code", code_len)?;
        len_u32("name", artifact.name().len())?;
        for reference in artifact.references() {
            if reference.offset as usize >= code_len {
                return Err(EncodeError::OffsetOutOfBounds {
                    offset: reference.offset,
                    code_len,
                });
            }
            let required = reference.kind.since_version();
            if required > self.version {
                return Err(EncodeError::UnsupportedReferenceKind {
                    kind: reference.kind,
                    required,
                    negotiated: self.version,
                });
            }
        }
        for assumption in artifact.assumptions() {
            if let DependencyAssumption::Speculation(record) = assumption {
                len_u32("speculation record", record.len())?;
            }
        }
        if self.flags.include_comments {
            for comment in artifact.comments() {
                if comment.offset as usize > code_len {
                    return Err(EncodeError::CommentOutOfBounds {
                        offset: comment.offset,
                        code_len,
                    });
                }
                len_u32("comment text", comment.text.len())?;
            }
        }
        Ok(())
    }

    fn put_pool_ref(&self, out: &mut ChunkedWriter, pool: &mut ObjectPool, entry: &RuntimeRef) {
        let index = pool.intern(entry);
        out.put_u32(index.index());
        if self.flags.include_type_info {
            match entry {
                RuntimeRef::Type(_) => out.put_u8(POOL_TYPE),
                RuntimeRef::Method(_) => out.put_u8(POOL_METHOD),
                RuntimeRef::Object(obj) => {
                    out.put_u8(POOL_OBJECT);
                    out.put_u32(obj.type_id.0);
                }
            }
        }
    }

    fn put_assumption(
        &self,
        out: &mut ChunkedWriter,
        pool: &mut ObjectPool,
        assumption: &DependencyAssumption,
    ) {
        match assumption {
            DependencyAssumption::LeafType(ty) => {
                out.put_u8(ASSUME_LEAF_TYPE);
                self.put_pool_ref(out, pool, &RuntimeRef::Type(*ty));
            }
            DependencyAssumption::ConcreteMethod { context, method } => {
                out.put_u8(ASSUME_CONCRETE_METHOD);
                self.put_pool_ref(out, pool, &RuntimeRef::Type(*context));
                self.put_pool_ref(out, pool, &RuntimeRef::Method(*method));
            }
            DependencyAssumption::NoFinalizableSubclass(ty) => {
                out.put_u8(ASSUME_NO_FINALIZABLE_SUBCLASS);
                self.put_pool_ref(out, pool, &RuntimeRef::Type(*ty));
            }
            DependencyAssumption::Speculation(record) => {
                out.put_u8(ASSUME_SPECULATION);
                out.put_blob(record.as_bytes());
            }
        }
    }
}

impl Default for ArtifactEncoder {
    fn default() -> Self {
        Self::new(EncodingFlags::default())
    }
}

#[inline]
fn len_u32(section: &'static str, len: usize) -> Result<u32, EncodeError> {
    u32::try_from(len).map_err(|_| EncodeError::SectionTooLarge { section, len })
}

// =============================================================================
// Tests
// =============================================================================
