//! Metadata queries used to re-validate dependency assumptions.
//!
//! The runtime's type system is an external collaborator; only the queries
//! installation needs are modeled. [`ClassHierarchy`] is an in-memory
//! implementation for the in-process runtime and tests.

use parking_lot::RwLock;
use prism_ci_wire::{DependencyAssumption, MethodId, TypeId};
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;
use thiserror::Error;

// =============================================================================
// Query Interface
// =============================================================================

/// Outcome of resolving a symbolic reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution<T> {
    /// Resolved to an entity.
    Resolved(T),
    /// Not resolved yet; resolving would require loading.
    Unresolved,
}

/// Resolution failed permanently.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("linkage error at constant pool index {cp_index}: {reason}")]
pub struct LinkageError {
    /// Constant-pool index being resolved.
    pub cp_index: u32,
    /// What went wrong.
    pub reason: String,
}

/// Synchronous type-system queries.
pub trait MetadataQueries: Send + Sync {
    /// Whether `ty` has a loaded strict subtype.
    fn has_live_subtype(&self, ty: TypeId) -> bool;

    /// The single implementation of `method` reachable from receivers of
    /// type `context`, if there is exactly one. An override anywhere in the
    /// subtree, `context` included, makes the answer `None`.
    fn unique_concrete_method(&self, context: TypeId, method: MethodId) -> Option<MethodId>;

    /// Whether `ty` or any subtype declares a finalizer.
    fn has_finalizable_subclass(&self, ty: TypeId) -> bool;

    /// Resolve the type named at `cp_index`.
    fn resolve_type(&self, cp_index: u32) -> Result<Resolution<TypeId>, LinkageError>;

    /// Whether `assumption` still holds. Speculation records are not type
    /// facts and always hold here; the speculation log decides them.
    fn holds(&self, assumption: &DependencyAssumption) -> bool {
        match assumption {
            DependencyAssumption::LeafType(ty) => !self.has_live_subtype(*ty),
            DependencyAssumption::ConcreteMethod { context, method } => {
                self.unique_concrete_method(*context, *method) == Some(*method)
            }
            DependencyAssumption::NoFinalizableSubclass(ty) => !self.has_finalizable_subclass(*ty),
            DependencyAssumption::Speculation(_) => true,
        }
    }
}

// =============================================================================
// Class Hierarchy
// =============================================================================

#[derive(Debug, Default)]
struct TypeNode {
    superclass: Option<TypeId>,
    subclasses: SmallVec<[TypeId; 4]>,
    has_finalizer: bool,
    /// Overridden method -> overriding implementation declared here.
    overrides: FxHashMap<MethodId, MethodId>,
}

#[derive(Debug, Clone, Copy)]
enum PoolEntry {
    Type(TypeId),
    Broken,
}

#[derive(Debug, Default)]
struct HierarchyState {
    types: FxHashMap<TypeId, TypeNode>,
    constant_pool: FxHashMap<u32, PoolEntry>,
}

impl HierarchyState {
    /// `root` and every loaded subtype, root first.
    fn subtree(&self, root: TypeId) -> Vec<TypeId> {
        let mut out = Vec::new();
        let mut seen = FxHashSet::default();
        let mut stack = vec![root];
        while let Some(ty) = stack.pop() {
            if !seen.insert(ty) {
                continue;
            }
            out.push(ty);
            if let Some(node) = self.types.get(&ty) {
                stack.extend(node.subclasses.iter().copied());
            }
        }
        out
    }
}

/// Mutable in-memory class hierarchy.
///
/// Loading a class can falsify assumptions made by already-compiled code;
/// installation re-checks against whatever is loaded at that moment.
#[derive(Debug, Default)]
pub struct ClassHierarchy {
    state: RwLock<HierarchyState>,
}

impl ClassHierarchy {
    /// Create an empty hierarchy.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load `ty` under `superclass`.
    pub fn load(&self, ty: TypeId, superclass: Option<TypeId>) {
        let mut state = self.state.write();
        state.types.entry(ty).or_default().superclass = superclass;
        if let Some(parent) = superclass {
            let siblings = &mut state.types.entry(parent).or_default().subclasses;
            if !siblings.contains(&ty) {
                siblings.push(ty);
            }
        }
    }

    /// Mark `ty` as declaring a finalizer.
    pub fn set_finalizer(&self, ty: TypeId) {
        self.state.write().types.entry(ty).or_default().has_finalizer = true;
    }

    /// Record that `ty` overrides `method` with `implementation`.
    pub fn add_override(&self, ty: TypeId, method: MethodId, implementation: MethodId) {
        self.state
            .write()
            .types
            .entry(ty)
            .or_default()
            .overrides
            .insert(method, implementation);
    }

    /// Bind constant-pool `cp_index` to `ty`.
    pub fn bind_constant(&self, cp_index: u32, ty: TypeId) {
        self.state
            .write()
            .constant_pool
            .insert(cp_index, PoolEntry::Type(ty));
    }

    /// Make constant-pool `cp_index` fail resolution.
    pub fn break_constant(&self, cp_index: u32) {
        self.state
            .write()
            .constant_pool
            .insert(cp_index, PoolEntry::Broken);
    }

    /// Whether `ty` is loaded.
    pub fn is_loaded(&self, ty: TypeId) -> bool {
        self.state.read().types.contains_key(&ty)
    }

    /// Direct superclass of `ty`.
    pub fn superclass(&self, ty: TypeId) -> Option<TypeId> {
        self.state.read().types.get(&ty).and_then(|n| n.superclass)
    }
}

impl MetadataQueries for ClassHierarchy {
    fn has_live_subtype(&self, ty: TypeId) -> bool {
        let state = self.state.read();
        state
            .types
            .get(&ty)
            .is_some_and(|node| !node.subclasses.is_empty())
    }

    fn unique_concrete_method(&self, context: TypeId, method: MethodId) -> Option<MethodId> {
        let state = self.state.read();
        let mut implementations: SmallVec<[MethodId; 2]> = SmallVec::new();
        implementations.push(method);
        for ty in state.subtree(context) {
            if let Some(overriding) = state.types.get(&ty).and_then(|n| n.overrides.get(&method)) {
                if !implementations.contains(overriding) {
                    implementations.push(*overriding);
                }
            }
        }
        match implementations.as_slice() {
            [only] => Some(*only),
            _ => None,
        }
    }

    fn has_finalizable_subclass(&self, ty: TypeId) -> bool {
        let state = self.state.read();
        state
            .subtree(ty)
            .into_iter()
            .any(|t| state.types.get(&t).is_some_and(|n| n.has_finalizer))
    }

    fn resolve_type(&self, cp_index: u32) -> Result<Resolution<TypeId>, LinkageError> {
        let state = self.state.read();
        match state.constant_pool.get(&cp_index) {
            Some(PoolEntry::Type(ty)) if state.types.contains_key(ty) => Ok(Resolution::Resolved(*ty)),
            Some(PoolEntry::Type(_)) => Ok(Resolution::Unresolved),
            Some(PoolEntry::Broken) => Err(LinkageError {
                cp_index,
                reason: "class could not be linked".into(),
            }),
            None => Err(LinkageError {
                cp_index,
                reason: "no such constant".into(),
            }),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use prism_ci_wire::SpeculationRecord;

    const OBJECT: TypeId = TypeId(0);
    const ANIMAL: TypeId = TypeId(1);
    const DOG: TypeId = TypeId(2);
    const SPEAK: MethodId = MethodId(10);
    const DOG_SPEAK: MethodId = MethodId(11);

    fn hierarchy() -> ClassHierarchy {
        let h = ClassHierarchy::new();
        h.load(OBJECT, None);
        h.load(ANIMAL, Some(OBJECT));
        h
    }

    #[test]
    fn test_leaf_type_fails_after_subclass_loads() {
        let h = hierarchy();
        let leaf = DependencyAssumption::LeafType(ANIMAL);
        assert!(h.holds(&leaf));
        h.load(DOG, Some(ANIMAL));
        assert!(!h.holds(&leaf));
        assert_eq!(h.superclass(DOG), Some(ANIMAL));
        assert!(h.is_loaded(DOG));
    }

    #[test]
    fn test_concrete_method_fails_after_override() {
        let h = hierarchy();
        h.load(DOG, Some(ANIMAL));
        let cha = DependencyAssumption::ConcreteMethod {
            context: ANIMAL,
            method: SPEAK,
        };
        assert!(h.holds(&cha));
        h.add_override(DOG, SPEAK, DOG_SPEAK);
        assert_eq!(h.unique_concrete_method(ANIMAL, SPEAK), None);
        assert_eq!(h.unique_concrete_method(DOG, SPEAK), None);
        assert!(!h.holds(&cha));
    }

    #[test]
    fn test_finalizable_subclass() {
        let h = hierarchy();
        h.load(DOG, Some(ANIMAL));
        assert!(h.holds(&DependencyAssumption::NoFinalizableSubclass(OBJECT)));
        h.set_finalizer(DOG);
        assert!(!h.holds(&DependencyAssumption::NoFinalizableSubclass(OBJECT)));
        assert!(h.has_finalizable_subclass(ANIMAL));

        let cat = TypeId(3);
        h.load(cat, Some(ANIMAL));
        assert!(!h.has_finalizable_subclass(cat));
    }

    #[test]
    fn test_resolution() {
        let h = hierarchy();
        h.bind_constant(1, ANIMAL);
        h.bind_constant(2, DOG);
        h.break_constant(3);

        assert_eq!(h.resolve_type(1), Ok(Resolution::Resolved(ANIMAL)));
        assert_eq!(h.resolve_type(2), Ok(Resolution::Unresolved));
        assert_eq!(h.resolve_type(3).unwrap_err().cp_index, 3);
        assert!(h.resolve_type(4).is_err());

        h.load(DOG, Some(ANIMAL));
        assert_eq!(h.resolve_type(2), Ok(Resolution::Resolved(DOG)));
    }

    #[test]
    fn test_speculations_are_not_type_facts() {
        let h = hierarchy();
        let spec = DependencyAssumption::Speculation(SpeculationRecord::from(&b"x"[..]));
        assert!(h.holds(&spec));
    }
}
