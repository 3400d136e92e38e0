//! Compiled-artifact model and wire format for the Prism compiler interface.
//!
//! A JIT compiler running as a client of the managed runtime hands its output
//! across the boundary as an [`EncodedStream`]: a self-describing header, a
//! chunked binary payload and a side [`ObjectPool`] of runtime-object
//! references that the payload indexes by integer.
//!
//! # Architecture
//!
//! ```text
//!  CompiledArtifact ──▶ ArtifactEncoder ──▶ EncodedStream ──▶ decode() ──▶ DecodedArtifact
//!                            │                 │    │
//!                            │            header  chunks
//!                            └──────────▶ ObjectPool (identity-deduplicated)
//! ```
//!
//! The encoder acquires no cross-call state; the stream is consumed by the
//! single submission it was produced for.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod artifact;
pub mod decoder;
pub mod encoder;
pub mod error;
pub mod flags;
pub mod ids;
pub mod pool;
pub mod record;
pub mod stream;

pub use artifact::{
    ArtifactBuilder, CompiledArtifact, DependencyAssumption, ObjectConstant, Reference,
    ReferenceKind, ReferenceTarget, RuntimeRef, SourceComment,
};
pub use decoder::{DecodedArtifact, decode};
pub use encoder::ArtifactEncoder;
pub use error::{DecodeError, EncodeError};
pub use flags::{EncodingFlags, InstallFlags};
pub use ids::{CompileId, MethodId, ObjectHandle, TypeId, UnitId};
pub use pool::{ObjectPool, PoolIndex};
pub use record::{SpeculationEncoding, SpeculationField, SpeculationRecord};
pub use stream::{
    DEFAULT_CHUNK_SIZE, EncodedStream, HEADER_SIZE, MIN_PROTOCOL_VERSION, PROTOCOL_VERSION,
    StreamHeader,
};
