//! Speculation records.
//!
//! A [`SpeculationRecord`] is an opaque byte string naming one optimistic
//! assumption (for example "call site C assumed receiver type T"). Records
//! are compared by exact content. [`SpeculationEncoding`] builds them in a
//! tagged, self-describing layout so that a record can be rendered for
//! diagnostics without knowing which compiler produced it.

use std::fmt;
use std::sync::Arc;

use crate::error::DecodeError;
use crate::ids::{MethodId, TypeId};

// =============================================================================
// Field Tags
// =============================================================================

const TAG_INT: u8 = 1;
const TAG_LONG: u8 = 2;
const TAG_TYPE: u8 = 3;
const TAG_METHOD: u8 = 4;
const TAG_STR: u8 = 5;

// =============================================================================
// Speculation Record
// =============================================================================

/// An immutable, content-compared speculation record.
///
/// Cloning is cheap: the bytes are shared.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SpeculationRecord(Arc<[u8]>);

impl SpeculationRecord {
    /// Wrap raw record bytes.
    pub fn from_bytes(bytes: impl Into<Arc<[u8]>>) -> Self {
        Self(bytes.into())
    }

    /// Get the encoded bytes.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Length of the encoded record.
    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the record carries no bytes.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Decode the tagged fields of a record built by [`SpeculationEncoding`].
    pub fn fields(&self) -> Result<Vec<SpeculationField>, DecodeError> {
        let bytes = self.as_bytes();
        let mut fields = Vec::new();
        let mut pos = 0;
        while pos < bytes.len() {
            let tag = bytes[pos];
            pos += 1;
            let field = match tag {
                TAG_INT => SpeculationField::Int(i32::from_le_bytes(take(bytes, &mut pos)?)),
                TAG_LONG => SpeculationField::Long(i64::from_le_bytes(take(bytes, &mut pos)?)),
                TAG_TYPE => SpeculationField::Type(TypeId(u32::from_le_bytes(take(bytes, &mut pos)?))),
                TAG_METHOD => {
                    SpeculationField::Method(MethodId(u32::from_le_bytes(take(bytes, &mut pos)?)))
                }
                TAG_STR => {
                    let len = u32::from_le_bytes(take(bytes, &mut pos)?) as usize;
                    let end = pos.checked_add(len).filter(|&end| end <= bytes.len()).ok_or(
                        DecodeError::MalformedRecord {
                            reason: "string field overruns record",
                        },
                    )?;
                    let text = std::str::from_utf8(&bytes[pos..end])
                        .map_err(|_| DecodeError::InvalidUtf8)?
                        .to_owned();
                    pos = end;
                    SpeculationField::Str(text)
                }
                _ => {
                    return Err(DecodeError::MalformedRecord {
                        reason: "unknown field tag",
                    });
                }
            };
            fields.push(field);
        }
        Ok(fields)
    }
}

fn take<const N: usize>(bytes: &[u8], pos: &mut usize) -> Result<[u8; N], DecodeError> {
    let end = *pos + N;
    let slice = bytes.get(*pos..end).ok_or(DecodeError::MalformedRecord {
        reason: "field truncated",
    })?;
    *pos = end;
    let mut out = [0u8; N];
    out.copy_from_slice(slice);
    Ok(out)
}

impl fmt::Debug for SpeculationRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SpeculationRecord(")?;
        for byte in self.0.iter() {
            write!(f, "{:02x}", byte)?;
        }
        write!(f, ")")
    }
}

impl From<Vec<u8>> for SpeculationRecord {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes.into())
    }
}

impl From<&[u8]> for SpeculationRecord {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.into())
    }
}

// =============================================================================
// Speculation Encoding
// =============================================================================

/// A decoded field of a speculation record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpeculationField {
    /// 32-bit integer (bytecode index, reason code).
    Int(i32),
    /// 64-bit integer.
    Long(i64),
    /// A type reference.
    Type(TypeId),
    /// A method reference.
    Method(MethodId),
    /// A UTF-8 string (reason group name).
    Str(String),
}

/// Builder for self-describing speculation records.
///
/// ```ignore
/// let record = SpeculationEncoding::new()
///     .put_str("receiver-type")
///     .put_method(MethodId(7))
///     .put_int(12)
///     .put_type(TypeId(3))
///     .finish();
/// ```
#[derive(Debug, Default, Clone)]
pub struct SpeculationEncoding {
    bytes: Vec<u8>,
}

impl SpeculationEncoding {
    /// Create an empty encoding.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a 32-bit integer.
    pub fn put_int(mut self, value: i32) -> Self {
        self.bytes.push(TAG_INT);
        self.bytes.extend_from_slice(&value.to_le_bytes());
        self
    }

    /// Append a 64-bit integer.
    pub fn put_long(mut self, value: i64) -> Self {
        self.bytes.push(TAG_LONG);
        self.bytes.extend_from_slice(&value.to_le_bytes());
        self
    }

    /// Append a type reference.
    pub fn put_type(mut self, ty: TypeId) -> Self {
        self.bytes.push(TAG_TYPE);
        self.bytes.extend_from_slice(&ty.0.to_le_bytes());
        self
    }

    /// Append a method reference.
    pub fn put_method(mut self, method: MethodId) -> Self {
        self.bytes.push(TAG_METHOD);
        self.bytes.extend_from_slice(&method.0.to_le_bytes());
        self
    }

    /// Append a string.
    pub fn put_str(mut self, text: &str) -> Self {
        self.bytes.push(TAG_STR);
        self.bytes
            .extend_from_slice(&(text.len() as u32).to_le_bytes());
        self.bytes.extend_from_slice(text.as_bytes());
        self
    }

    /// Finish the record.
    pub fn finish(self) -> SpeculationRecord {
        SpeculationRecord::from(self.bytes)
    }
}

// =============================================================================
// Tests
// =============================================================================
