//! Side object pool for runtime-object references.
//!
//! The pool provides:
//! - **Identity dedup**: each distinct runtime object occupies one slot no
//!   matter how often the code refers to it
//! - **Stable indices**: slots are appended in first-use order and never move
//! - **O(1) lookup** in both directions
//!
//! Dedup is by identity, not value: two object constants with different
//! handles get two slots even if the objects are equal.

use std::ops::Index;

use rustc_hash::FxHashMap;

use crate::artifact::RuntimeRef;

// =============================================================================
// Pool Index
// =============================================================================

/// Index of a slot in an [`ObjectPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PoolIndex(u32);

impl PoolIndex {
    /// Create from a raw index.
    #[inline]
    pub const fn new(index: u32) -> Self {
        PoolIndex(index)
    }

    /// Get the raw index.
    #[inline]
    pub const fn index(self) -> u32 {
        self.0
    }

    /// Get the index as usize.
    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

/// Identity key for dedup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Identity {
    Type(u32),
    Method(u32),
    Object(u64),
}

impl Identity {
    #[inline]
    fn of(entry: &RuntimeRef) -> Self {
        match entry {
            RuntimeRef::Type(ty) => Identity::Type(ty.0),
            RuntimeRef::Method(method) => Identity::Method(method.0),
            RuntimeRef::Object(obj) => Identity::Object(obj.handle.0),
        }
    }
}

// =============================================================================
// Object Pool
// =============================================================================

/// Ordered store of runtime-object references, indexed by [`PoolIndex`].
#[derive(Debug, Clone, Default)]
pub struct ObjectPool {
    entries: Vec<RuntimeRef>,
    slots: FxHashMap<Identity, PoolIndex>,
}

impl ObjectPool {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a pool from entries in slot order, as received across the
    /// boundary. Duplicates are kept where they are; lookups resolve to the
    /// first slot.
    pub fn from_entries(entries: Vec<RuntimeRef>) -> Self {
        let mut slots = FxHashMap::default();
        for (i, entry) in entries.iter().enumerate() {
            slots
                .entry(Identity::of(entry))
                .or_insert(PoolIndex(i as u32));
        }
        Self { entries, slots }
    }

    /// Return the slot for `entry`, appending it on first use.
    pub fn intern(&mut self, entry: &RuntimeRef) -> PoolIndex {
        let next = PoolIndex(self.entries.len() as u32);
        let slot = *self.slots.entry(Identity::of(entry)).or_insert(next);
        if slot == next {
            self.entries.push(*entry);
        }
        slot
    }

    /// Look up the slot already holding `entry`.
    #[inline]
    pub fn find(&self, entry: &RuntimeRef) -> Option<PoolIndex> {
        self.slots.get(&Identity::of(entry)).copied()
    }

    /// Get an entry by index.
    #[inline]
    pub fn get(&self, index: PoolIndex) -> Option<&RuntimeRef> {
        self.entries.get(index.as_usize())
    }

    /// Number of slots.
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the pool is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in slot order.
    #[inline]
    pub fn as_slice(&self) -> &[RuntimeRef] {
        &self.entries
    }

    /// Iterate `(index, entry)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (PoolIndex, &RuntimeRef)> {
        self.entries
            .iter()
            .enumerate()
            .map(|(i, entry)| (PoolIndex(i as u32), entry))
    }
}

impl Index<PoolIndex> for ObjectPool {
    type Output = RuntimeRef;

    #[inline]
    fn index(&self, index: PoolIndex) -> &RuntimeRef {
        &self.entries[index.as_usize()]
    }
}
