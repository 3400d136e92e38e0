//! The in-memory compiled artifact handed from the compiler to the encoder.
//!
//! An artifact is immutable once built. References are kept in offset order
//! (stable for equal offsets), which is the order the encoder walks them in.

use smallvec::SmallVec;

use crate::ids::{CompileId, MethodId, ObjectHandle, TypeId, UnitId};
use crate::record::SpeculationRecord;

// =============================================================================
// Reference Kinds
// =============================================================================

/// What a reference-table entry patches or describes.
///
/// Each kind exists from a given protocol version onwards; see
/// [`ReferenceKind::since_version`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ReferenceKind {
    /// Direct call to another method.
    Call = 0,
    /// Load of an embedded constant.
    ConstantLoad = 1,
    /// Patchable data word.
    DataPatch = 2,
    /// Exception handler entry.
    ExceptionHandler = 3,
    /// Marker for a runtime-known code position.
    Mark = 4,
    /// Safepoint poll site.
    SafepointPoll = 5,
    /// Inline cache check at a virtual call.
    InlineCacheCheck = 6,
}

impl ReferenceKind {
    /// Convert from the wire byte.
    #[inline]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Call),
            1 => Some(Self::ConstantLoad),
            2 => Some(Self::DataPatch),
            3 => Some(Self::ExceptionHandler),
            4 => Some(Self::Mark),
            5 => Some(Self::SafepointPoll),
            6 => Some(Self::InlineCacheCheck),
            _ => None,
        }
    }

    /// First protocol version that understands this kind.
    #[inline]
    pub const fn since_version(self) -> u8 {
        match self {
            Self::Call
            | Self::ConstantLoad
            | Self::DataPatch
            | Self::ExceptionHandler
            | Self::Mark => 1,
            Self::SafepointPoll | Self::InlineCacheCheck => 2,
        }
    }
}

// =============================================================================
// Targets
// =============================================================================

/// An object constant embedded in code.
///
/// Identity is the handle; the type is provenance carried for verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectConstant {
    /// Object identity.
    pub handle: ObjectHandle,
    /// Type of the object.
    pub type_id: TypeId,
}

/// A runtime-object reference, stored in the side object pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuntimeRef {
    /// A type.
    Type(TypeId),
    /// A method.
    Method(MethodId),
    /// An object constant.
    Object(ObjectConstant),
}

impl RuntimeRef {
    /// Human-readable kind, used in diagnostics.
    #[inline]
    pub const fn kind_name(&self) -> &'static str {
        match self {
            RuntimeRef::Type(_) => "type",
            RuntimeRef::Method(_) => "method",
            RuntimeRef::Object(_) => "object",
        }
    }
}

/// Target of a reference: an inline scalar or a runtime-object reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReferenceTarget {
    /// Raw or primitive value emitted inline.
    Raw(i64),
    /// Runtime object, emitted as an object-pool index.
    Runtime(RuntimeRef),
}

/// One entry of the reference table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Reference {
    /// Offset into the code buffer.
    pub offset: u32,
    /// What the reference does.
    pub kind: ReferenceKind,
    /// What it refers to.
    pub target: ReferenceTarget,
}

// =============================================================================
// Assumptions and Optional Sections
// =============================================================================

/// An optimistic claim the runtime re-validates at install time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DependencyAssumption {
    /// The type has no live subtype.
    LeafType(TypeId),
    /// `method` is the only concrete implementation reachable from `context`.
    ConcreteMethod {
        /// Receiver type the claim is made for.
        context: TypeId,
        /// The single implementation.
        method: MethodId,
    },
    /// No subclass of the type has a finalizer.
    NoFinalizableSubclass(TypeId),
    /// The code relies on this speculation not having failed.
    Speculation(SpeculationRecord),
}

/// Source-position annotation at a code offset.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceComment {
    /// Code offset the comment is attached to.
    pub offset: u32,
    /// Annotation text.
    pub text: String,
}

// =============================================================================
// Compiled Artifact
// =============================================================================

/// One compiler-produced, not-yet-installed body of code plus metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledArtifact {
    unit: UnitId,
    compile_id: CompileId,
    name: String,
    code: Box<[u8]>,
    references: Box<[Reference]>,
    assumptions: SmallVec<[DependencyAssumption; 4]>,
    comments: Box<[SourceComment]>,
    methods: Box<[MethodId]>,
    speculation_snapshot: Box<[SpeculationRecord]>,
}

impl CompiledArtifact {
    /// Start building an artifact for `unit`.
    pub fn builder(unit: UnitId, compile_id: CompileId, code: impl Into<Box<[u8]>>) -> ArtifactBuilder {
        ArtifactBuilder {
            unit,
            compile_id,
            name: String::new(),
            code: code.into(),
            references: Vec::new(),
            assumptions: SmallVec::new(),
            comments: Vec::new(),
            methods: Vec::new(),
            speculation_snapshot: Vec::new(),
        }
    }

    /// Compiled unit this artifact is for.
    #[inline]
    pub fn unit(&self) -> UnitId {
        self.unit
    }

    /// Compilation that produced this artifact.
    #[inline]
    pub fn compile_id(&self) -> CompileId {
        self.compile_id
    }

    /// Display name.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Executable payload.
    #[inline]
    pub fn code(&self) -> &[u8] {
        &self.code
    }

    /// Reference table in offset order.
    #[inline]
    pub fn references(&self) -> &[Reference] {
        &self.references
    }

    /// Dependency assumptions.
    #[inline]
    pub fn assumptions(&self) -> &[DependencyAssumption] {
        &self.assumptions
    }

    /// Source-position comments.
    #[inline]
    pub fn comments(&self) -> &[SourceComment] {
        &self.comments
    }

    /// Referenced-method table.
    #[inline]
    pub fn methods(&self) -> &[MethodId] {
        &self.methods
    }

    /// Failure records the compiler consulted while producing this artifact.
    #[inline]
    pub fn speculation_snapshot(&self) -> &[SpeculationRecord] {
        &self.speculation_snapshot
    }
}

/// Builder for [`CompiledArtifact`].
#[derive(Debug)]
pub struct ArtifactBuilder {
    unit: UnitId,
    compile_id: CompileId,
    name: String,
    code: Box<[u8]>,
    references: Vec<Reference>,
    assumptions: SmallVec<[DependencyAssumption; 4]>,
    comments: Vec<SourceComment>,
    methods: Vec<MethodId>,
    speculation_snapshot: Vec<SpeculationRecord>,
}

impl ArtifactBuilder {
    /// Set the display name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Add a reference.
    pub fn reference(mut self, offset: u32, kind: ReferenceKind, target: ReferenceTarget) -> Self {
        self.references.push(Reference {
            offset,
            kind,
            target,
        });
        self
    }

    /// Add a dependency assumption.
    pub fn assume(mut self, assumption: DependencyAssumption) -> Self {
        self.assumptions.push(assumption);
        self
    }

    /// Add a source-position comment.
    pub fn comment(mut self, offset: u32, text: impl Into<String>) -> Self {
        self.comments.push(SourceComment {
            offset,
            text: text.into(),
        });
        self
    }

    /// Add a referenced method.
    pub fn method(mut self, method: MethodId) -> Self {
        self.methods.push(method);
        self
    }

    /// Record the failure snapshot consulted during compilation.
    pub fn speculation_snapshot(mut self, snapshot: impl IntoIterator<Item = SpeculationRecord>) -> Self {
        self.speculation_snapshot = snapshot.into_iter().collect();
        self
    }

    /// Finish the artifact. References are stably sorted by offset.
    pub fn build(mut self) -> CompiledArtifact {
        self.references.sort_by_key(|r| r.offset);
        CompiledArtifact {
            unit: self.unit,
            compile_id: self.compile_id,
            name: self.name,
            code: self.code,
            references: self.references.into_boxed_slice(),
            assumptions: self.assumptions,
            comments: self.comments.into_boxed_slice(),
            methods: self.methods.into_boxed_slice(),
            speculation_snapshot: self.speculation_snapshot.into_boxed_slice(),
        }
    }
}
