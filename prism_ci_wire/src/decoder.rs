//! Stream decoder.
//!
//! Decoding validates everything the encoder guarantees: pool indices are in
//! range, embedded type info agrees with the pool, offsets fall inside the
//! decoded code and the payload ends exactly at the end marker. Any
//! violation is a [`DecodeError`].

use crate::artifact::{
    DependencyAssumption, ObjectConstant, Reference, ReferenceKind, ReferenceTarget, RuntimeRef,
    SourceComment,
};
use crate::encoder::{
    ASSUME_CONCRETE_METHOD, ASSUME_LEAF_TYPE, ASSUME_NO_FINALIZABLE_SUBCLASS, ASSUME_SPECULATION,
    END_MARKER, POOL_METHOD, POOL_OBJECT, POOL_TYPE, TARGET_POOL, TARGET_RAW,
};
use crate::error::DecodeError;
use crate::ids::{CompileId, MethodId, TypeId, UnitId};
use crate::pool::ObjectPool;
use crate::record::SpeculationRecord;
use crate::stream::{EncodedStream, HEADER_SIZE, StreamHeader, StreamReader};

// Smallest possible encoding of one entry in each counted section.
const MIN_REFERENCE_SIZE: usize = 4 + 1 + 1 + 4;
const MIN_ASSUMPTION_SIZE: usize = 1 + 4;
const MIN_COMMENT_SIZE: usize = 4 + 4;
const MIN_METHOD_SIZE: usize = 4;

/// An artifact reconstructed from an [`EncodedStream`].
///
/// Optional sections are `None` when the header says they were not encoded,
/// which is distinct from an encoded but empty section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedArtifact {
    /// Stream header.
    pub header: StreamHeader,
    /// Compiled unit.
    pub unit: UnitId,
    /// Compilation that produced the code.
    pub compile_id: CompileId,
    /// Display name.
    pub name: String,
    /// Executable payload.
    pub code: Vec<u8>,
    /// Reference table in offset order.
    pub references: Vec<Reference>,
    /// Dependency assumptions.
    pub assumptions: Vec<DependencyAssumption>,
    /// Source-position comments, if encoded.
    pub comments: Option<Vec<SourceComment>>,
    /// Referenced-method table, if encoded.
    pub methods: Option<Vec<MethodId>>,
}

impl DecodedArtifact {
    /// Speculation records the code depends on.
    pub fn speculations(&self) -> impl Iterator<Item = &SpeculationRecord> {
        self.assumptions.iter().filter_map(|a| match a {
            DependencyAssumption::Speculation(record) => Some(record),
            _ => None,
        })
    }
}

/// Decode `stream` back into an artifact.
pub fn decode(stream: &EncodedStream) -> Result<DecodedArtifact, DecodeError> {
    let header = stream.header()?;
    let mut reader = stream.reader();
    let mut skipped = [0u8; HEADER_SIZE];
    reader.read_into(&mut skipped)?;

    let mut cx = DecodeContext {
        reader,
        pool: stream.pool(),
        type_info: header.flags.include_type_info,
    };

    let unit = UnitId(cx.reader.read_u64()?);
    let compile_id = CompileId(cx.reader.read_u32()?);
    let name = cx.reader.read_str()?;
    let code = cx.reader.read_blob()?;

    let count = cx.reader.read_count(MIN_REFERENCE_SIZE)?;
    let mut references = Vec::with_capacity(count);
    for _ in 0..count {
        let offset = cx.reader.read_u32()?;
        if offset as usize >= code.len() {
            return Err(DecodeError::OffsetOutOfBounds {
                offset,
                code_len: code.len(),
            });
        }
        let kind_byte = cx.reader.read_u8()?;
        let kind = ReferenceKind::from_u8(kind_byte)
            .filter(|k| k.since_version() <= header.version)
            .ok_or(DecodeError::UnknownReferenceKind(kind_byte))?;
        let target = match cx.reader.read_u8()? {
            TARGET_RAW => ReferenceTarget::Raw(cx.reader.read_i64()?),
            TARGET_POOL => ReferenceTarget::Runtime(cx.pool_ref()?),
            tag => return Err(DecodeError::UnknownTargetTag(tag)),
        };
        references.push(Reference {
            offset,
            kind,
            target,
        });
    }

    let count = cx.reader.read_count(MIN_ASSUMPTION_SIZE)?;
    let mut assumptions = Vec::with_capacity(count);
    for _ in 0..count {
        let assumption = match cx.reader.read_u8()? {
            ASSUME_LEAF_TYPE => DependencyAssumption::LeafType(cx.type_ref()?),
            ASSUME_CONCRETE_METHOD => DependencyAssumption::ConcreteMethod {
                context: cx.type_ref()?,
                method: cx.method_ref()?,
            },
            ASSUME_NO_FINALIZABLE_SUBCLASS => {
                DependencyAssumption::NoFinalizableSubclass(cx.type_ref()?)
            }
            ASSUME_SPECULATION => {
                DependencyAssumption::Speculation(SpeculationRecord::from(cx.reader.read_blob()?))
            }
            tag => return Err(DecodeError::UnknownAssumptionTag(tag)),
        };
        assumptions.push(assumption);
    }

    let comments = if header.flags.include_comments {
        let count = cx.reader.read_count(MIN_COMMENT_SIZE)?;
        let mut comments = Vec::with_capacity(count);
        for _ in 0..count {
            let offset = cx.reader.read_u32()?;
            if offset as usize > code.len() {
                return Err(DecodeError::CommentOutOfBounds {
                    offset,
                    code_len: code.len(),
                });
            }
            let text = cx.reader.read_str()?;
            comments.push(SourceComment { offset, text });
        }
        Some(comments)
    } else {
        None
    };

    let methods = if header.flags.include_methods {
        let count = cx.reader.read_count(MIN_METHOD_SIZE)?;
        let mut methods = Vec::with_capacity(count);
        for _ in 0..count {
            methods.push(cx.method_ref()?);
        }
        Some(methods)
    } else {
        None
    };

    let marker = cx.reader.read_u32()?;
    if marker != END_MARKER {
        return Err(DecodeError::BadEndMarker(marker));
    }
    if cx.reader.remaining() != 0 {
        return Err(DecodeError::TrailingBytes(cx.reader.remaining()));
    }

    Ok(DecodedArtifact {
        header,
        unit,
        compile_id,
        name,
        code,
        references,
        assumptions,
        comments,
        methods,
    })
}

// =============================================================================
// Pool References
// =============================================================================

struct DecodeContext<'a> {
    reader: StreamReader<'a>,
    pool: &'a ObjectPool,
    type_info: bool,
}

impl DecodeContext<'_> {
    fn pool_ref(&mut self) -> Result<RuntimeRef, DecodeError> {
        let index = self.reader.read_u32()?;
        let entry = *self
            .pool
            .as_slice()
            .get(index as usize)
            .ok_or(DecodeError::PoolIndexOutOfRange {
                index,
                len: self.pool.len(),
            })?;

        if self.type_info {
            let matches = match self.reader.read_u8()? {
                POOL_TYPE => matches!(entry, RuntimeRef::Type(_)),
                POOL_METHOD => matches!(entry, RuntimeRef::Method(_)),
                POOL_OBJECT => {
                    let ty = TypeId(self.reader.read_u32()?);
                    matches!(entry, RuntimeRef::Object(ObjectConstant { type_id, .. }) if type_id == ty)
                }
                tag => return Err(DecodeError::UnknownPoolTag(tag)),
            };
            if !matches {
                return Err(DecodeError::TypeInfoMismatch { index });
            }
        }
        Ok(entry)
    }

    fn type_ref(&mut self) -> Result<TypeId, DecodeError> {
        let index = self.reader.read_u32()?;
        self.expect_entry(index, "type", |entry| match entry {
            RuntimeRef::Type(ty) => Some(ty),
            _ => None,
        })
    }

    fn method_ref(&mut self) -> Result<MethodId, DecodeError> {
        let index = self.reader.read_u32()?;
        self.expect_entry(index, "method", |entry| match entry {
            RuntimeRef::Method(method) => Some(method),
            _ => None,
        })
    }

    /// Resolve an already-read index at a position that requires a specific
    /// entry kind, consuming its type info if present.
    fn expect_entry<T>(
        &mut self,
        index: u32,
        expected: &'static str,
        project: impl FnOnce(RuntimeRef) -> Option<T>,
    ) -> Result<T, DecodeError> {
        let entry = *self
            .pool
            .as_slice()
            .get(index as usize)
            .ok_or(DecodeError::PoolIndexOutOfRange {
                index,
                len: self.pool.len(),
            })?;
        if self.type_info {
            let tag = self.reader.read_u8()?;
            let tagged = match tag {
                POOL_TYPE => "type",
                POOL_METHOD => "method",
                POOL_OBJECT => {
                    self.reader.read_u32()?;
                    "object"
                }
                other => return Err(DecodeError::UnknownPoolTag(other)),
            };
            if tagged != entry.kind_name() {
                return Err(DecodeError::TypeInfoMismatch { index });
            }
        }
        project(entry).ok_or(DecodeError::UnexpectedPoolEntry { index, expected })
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::CompiledArtifact;
    use crate::encoder::ArtifactEncoder;
    use crate::flags::EncodingFlags;
    use crate::ids::ObjectHandle;
    use crate::record::SpeculationEncoding;

    fn sample() -> CompiledArtifact {
        let obj = RuntimeRef::Object(ObjectConstant {
            handle: ObjectHandle(0xFEED),
            type_id: TypeId(3),
        });
        CompiledArtifact::builder(UnitId(42), CompileId(7), vec![0x90; 48])
            .name("Foo.bar()")
            .reference(32, ReferenceKind::Call, ReferenceTarget::Runtime(RuntimeRef::Method(MethodId(9))))
            .reference(0, ReferenceKind::ConstantLoad, ReferenceTarget::Runtime(obj))
            .reference(8, ReferenceKind::DataPatch, ReferenceTarget::Raw(-5))
            .reference(16, ReferenceKind::ConstantLoad, ReferenceTarget::Runtime(obj))
            .assume(DependencyAssumption::LeafType(TypeId(3)))
            .assume(DependencyAssumption::ConcreteMethod {
                context: TypeId(3),
                method: MethodId(9),
            })
            .assume(DependencyAssumption::Speculation(
                SpeculationEncoding::new().put_int(1).put_method(MethodId(9)).finish(),
            ))
            .comment(0, "entry")
            .comment(48, "end")
            .method(MethodId(9))
            .build()
    }

    #[test]
    fn test_round_trip_with_all_sections() {
        let artifact = sample();
        let stream = ArtifactEncoder::new(EncodingFlags::ALL).encode(&artifact).unwrap();
        let decoded = decode(&stream).unwrap();

        assert_eq!(decoded.unit, artifact.unit());
        assert_eq!(decoded.compile_id, artifact.compile_id());
        assert_eq!(decoded.name, "Foo.bar()");
        assert_eq!(decoded.code, artifact.code());
        assert_eq!(decoded.references, artifact.references());
        assert_eq!(decoded.assumptions, artifact.assumptions());
        assert_eq!(decoded.comments.as_deref(), Some(artifact.comments()));
        assert_eq!(decoded.methods.as_deref(), Some(artifact.methods()));
        assert_eq!(decoded.speculations().count(), 1);
    }

    #[test]
    fn test_absent_sections_decode_as_none() {
        let flags = EncodingFlags {
            include_comments: false,
            include_methods: false,
            include_type_info: false,
        };
        let artifact = sample();
        let stream = ArtifactEncoder::new(flags).encode(&artifact).unwrap();
        let decoded = decode(&stream).unwrap();

        assert!(decoded.comments.is_none());
        assert!(decoded.methods.is_none());
        assert_eq!(decoded.references, artifact.references());
    }

    #[test]
    fn test_pool_index_out_of_range() {
        let artifact = sample();
        let stream = ArtifactEncoder::default().encode(&artifact).unwrap();
        let truncated_pool = ObjectPool::from_entries(stream.pool().as_slice()[..1].to_vec());
        let tampered = EncodedStream::from_bytes(&stream.to_contiguous(), 64, truncated_pool);

        assert!(matches!(
            decode(&tampered),
            Err(DecodeError::PoolIndexOutOfRange { len: 1, .. })
        ));
    }

    #[test]
    fn test_type_info_disagreeing_with_pool() {
        let artifact = sample();
        let stream = ArtifactEncoder::default().encode(&artifact).unwrap();

        // Same identity, different type: the payload's type info no longer matches.
        let mut entries = stream.pool().as_slice().to_vec();
        for entry in &mut entries {
            if let RuntimeRef::Object(obj) = entry {
                obj.type_id = TypeId(99);
            }
        }
        let tampered = EncodedStream::from_bytes(
            &stream.to_contiguous(),
            64,
            ObjectPool::from_entries(entries),
        );
        assert!(matches!(
            decode(&tampered),
            Err(DecodeError::TypeInfoMismatch { .. })
        ));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let artifact = sample();
        let stream = ArtifactEncoder::default().encode(&artifact).unwrap();
        let mut bytes = stream.to_contiguous();
        bytes.extend_from_slice(&[0, 0]);
        let tampered = EncodedStream::from_bytes(&bytes, 64, stream.pool().clone());
        assert_eq!(decode(&tampered), Err(DecodeError::TrailingBytes(2)));
    }

    #[test]
    fn test_comment_offset_past_code_rejected() {
        let artifact = CompiledArtifact::builder(UnitId(1), CompileId(1), vec![0; 4])
            .comment(4, "x")
            .build();
        let flags = EncodingFlags {
            include_comments: true,
            include_methods: false,
            include_type_info: false,
        };
        let stream = ArtifactEncoder::new(flags).encode(&artifact).unwrap();
        let mut bytes = stream.to_contiguous();

        // Header, unit, compile id, empty name, code, and the three counts.
        let at = HEADER_SIZE + 8 + 4 + 4 + (4 + 4) + 4 + 4 + 4;
        assert_eq!(bytes[at..at + 4], 4u32.to_le_bytes());
        bytes[at..at + 4].copy_from_slice(&99u32.to_le_bytes());

        let tampered = EncodedStream::from_bytes(&bytes, 64, stream.pool().clone());
        assert_eq!(
            decode(&tampered),
            Err(DecodeError::CommentOutOfBounds {
                offset: 99,
                code_len: 4
            })
        );
    }

    #[test]
    fn test_truncated_payload_rejected() {
        let artifact = sample();
        let stream = ArtifactEncoder::default().encode(&artifact).unwrap();
        let bytes = stream.to_contiguous();
        let tampered =
            EncodedStream::from_bytes(&bytes[..bytes.len() - 6], 64, stream.pool().clone());
        assert!(decode(&tampered).is_err());
    }

    #[test]
    fn test_chunk_boundaries_do_not_matter() {
        let artifact = sample();
        let stream = ArtifactEncoder::default().encode(&artifact).unwrap();
        let bytes = stream.to_contiguous();
        for chunk_size in [1, 3, 16, 17, 4096] {
            let rechunked = EncodedStream::from_bytes(&bytes, chunk_size, stream.pool().clone());
            assert_eq!(decode(&rechunked).unwrap().references, artifact.references());
        }
    }
}
