//! Code cache for installed code.
//!
//! The code cache provides:
//! - O(1) lookup of installed code by compile id
//! - Per-unit tracking of entrant and non-entrant code
//! - Capacity accounting; non-entrant code keeps its space until swept
//! - Statistics and debugging support
//!
//! Addresses are simulated: each body gets a fresh, aligned range from a
//! bump pointer, and relocation moves it to a new range.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::RwLock;
use prism_ci_wire::{CompileId, UnitId};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::installed_code::{CodeLocation, InstalledCode};

/// First simulated code address.
const CODE_BASE: u64 = 0x7f00_0000_0000;

// =============================================================================
// Code Blob
// =============================================================================

/// One body of code held by the cache.
#[derive(Debug)]
pub struct CodeBlob {
    unit: UnitId,
    compile_id: CompileId,
    code: Box<[u8]>,
    /// Bytes reserved, after alignment.
    reserved: usize,
    address: AtomicU64,
    entrant: AtomicBool,
    handle: InstalledCode,
}

impl CodeBlob {
    /// Unit the code was compiled for.
    #[inline]
    pub fn unit(&self) -> UnitId {
        self.unit
    }

    /// Compilation that produced the code.
    #[inline]
    pub fn compile_id(&self) -> CompileId {
        self.compile_id
    }

    /// The code bytes.
    #[inline]
    pub fn code(&self) -> &[u8] {
        &self.code
    }

    /// Bytes reserved in the cache.
    #[inline]
    pub fn reserved(&self) -> usize {
        self.reserved
    }

    /// Current start address.
    #[inline]
    pub fn address(&self) -> u64 {
        self.address.load(Ordering::Acquire)
    }

    /// Whether new calls may enter this code.
    #[inline]
    pub fn is_entrant(&self) -> bool {
        self.entrant.load(Ordering::Acquire)
    }

    /// Handle the code was installed through.
    #[inline]
    pub fn handle(&self) -> &InstalledCode {
        &self.handle
    }

    /// Location as reported to handles.
    pub fn location(&self) -> CodeLocation {
        let address = self.address();
        CodeLocation {
            unit: self.unit,
            compile_id: self.compile_id,
            address,
            entry_point: address,
            size: self.code.len(),
        }
    }

    /// Stop new calls from entering. Returns whether this call did it.
    pub(crate) fn make_not_entrant(&self) -> bool {
        self.entrant.swap(false, Ordering::AcqRel)
    }

    /// Check if this code contains a given address.
    #[inline]
    pub fn contains_address(&self, addr: u64) -> bool {
        let base = self.address();
        addr >= base && addr < base + self.code.len() as u64
    }
}

// =============================================================================
// Code Cache
// =============================================================================

#[derive(Debug, Default)]
struct CacheState {
    entries: FxHashMap<CompileId, Arc<CodeBlob>>,
    by_unit: FxHashMap<UnitId, SmallVec<[CompileId; 2]>>,
    used: usize,
}

/// What a commit did.
#[derive(Debug)]
pub enum Commit {
    /// Committed. `superseded` lists code of the same unit made non-entrant.
    Entrant {
        /// The new blob.
        blob: Arc<CodeBlob>,
        /// Older code of the unit that stopped being entrant.
        superseded: Vec<Arc<CodeBlob>>,
    },
    /// Committed non-entrant because the unit already has newer code.
    Stale(Arc<CodeBlob>),
    /// No room.
    Full,
}

/// Result of a sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepResult {
    /// Blobs removed.
    pub removed: usize,
    /// Bytes returned to the cache.
    pub freed: usize,
}

/// A cache for installed code. Thread-safe via internal locking.
#[derive(Debug)]
pub struct CodeCache {
    state: RwLock<CacheState>,
    capacity: usize,
    alignment: usize,
    next_address: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    insertions: AtomicU64,
    evictions: AtomicU64,
}

impl CodeCache {
    /// Create a cache of `capacity` bytes. `alignment` must be a power of two.
    pub fn new(capacity: usize, alignment: usize) -> Self {
        Self {
            state: RwLock::new(CacheState::default()),
            capacity,
            alignment,
            next_address: AtomicU64::new(CODE_BASE),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            insertions: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    #[inline]
    fn aligned(&self, size: usize) -> usize {
        size.max(1).next_multiple_of(self.alignment)
    }

    fn fresh_address(&self, reserved: usize) -> u64 {
        self.next_address
            .fetch_add(reserved as u64, Ordering::Relaxed)
    }

    /// Commit `code` for `unit`.
    ///
    /// The unit's newest entrant code wins: if it has a higher compile id
    /// than `compile_id`, the new code is committed non-entrant. Otherwise
    /// every older entrant body of the unit is made non-entrant in the same
    /// critical section. Nothing is evicted to make room.
    pub fn commit(
        &self,
        unit: UnitId,
        compile_id: CompileId,
        code: Box<[u8]>,
        handle: InstalledCode,
    ) -> Commit {
        let reserved = self.aligned(code.len());
        let mut state = self.state.write();
        if state.used + reserved > self.capacity {
            return Commit::Full;
        }

        let newest = state
            .by_unit
            .get(&unit)
            .into_iter()
            .flatten()
            .filter_map(|id| state.entries.get(id))
            .filter(|blob| blob.is_entrant())
            .map(|blob| blob.compile_id)
            .max();
        let stale = newest.is_some_and(|newest| newest > compile_id);

        let blob = Arc::new(CodeBlob {
            unit,
            compile_id,
            code,
            reserved,
            address: AtomicU64::new(self.fresh_address(reserved)),
            entrant: AtomicBool::new(!stale),
            handle,
        });

        let mut superseded = Vec::new();
        if !stale {
            if let Some(ids) = state.by_unit.get(&unit) {
                for id in ids {
                    if let Some(old) = state.entries.get(id) {
                        if old.make_not_entrant() {
                            superseded.push(Arc::clone(old));
                        }
                    }
                }
            }
        }

        state.used += reserved;
        state.entries.insert(compile_id, Arc::clone(&blob));
        state.by_unit.entry(unit).or_default().push(compile_id);
        self.insertions.fetch_add(1, Ordering::Relaxed);

        if stale {
            Commit::Stale(blob)
        } else {
            Commit::Entrant { blob, superseded }
        }
    }

    /// Look up code by compile id.
    #[inline]
    pub fn lookup(&self, compile_id: CompileId) -> Option<Arc<CodeBlob>> {
        let result = self.state.read().entries.get(&compile_id).cloned();
        if result.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    /// The unit's entrant code, if any.
    pub fn entrant_for(&self, unit: UnitId) -> Option<Arc<CodeBlob>> {
        let state = self.state.read();
        state
            .by_unit
            .get(&unit)?
            .iter()
            .filter_map(|id| state.entries.get(id))
            .find(|blob| blob.is_entrant())
            .cloned()
    }

    /// Find the blob containing the given address.
    pub fn find_by_address(&self, addr: u64) -> Option<Arc<CodeBlob>> {
        self.state
            .read()
            .entries
            .values()
            .find(|blob| blob.contains_address(addr))
            .cloned()
    }

    /// Move live code to a fresh range. Returns the new address.
    pub fn relocate(&self, compile_id: CompileId) -> Option<u64> {
        // Write lock so no commit or sweep interleaves with the move.
        let state = self.state.write();
        let blob = state.entries.get(&compile_id)?;
        if !blob.is_entrant() {
            return None;
        }
        let address = self.fresh_address(blob.reserved);
        blob.address.store(address, Ordering::Release);
        Some(address)
    }

    /// Remove every non-entrant blob and return its space.
    pub fn sweep(&self) -> (SweepResult, Vec<Arc<CodeBlob>>) {
        let mut state = self.state.write();
        let dead: Vec<CompileId> = state
            .entries
            .values()
            .filter(|blob| !blob.is_entrant())
            .map(|blob| blob.compile_id)
            .collect();

        let mut result = SweepResult::default();
        let mut removed = Vec::with_capacity(dead.len());
        for id in dead {
            if let Some(blob) = state.entries.remove(&id) {
                if let Some(ids) = state.by_unit.get_mut(&blob.unit) {
                    ids.retain(|other| *other != id);
                    if ids.is_empty() {
                        state.by_unit.remove(&blob.unit);
                    }
                }
                state.used -= blob.reserved;
                result.removed += 1;
                result.freed += blob.reserved;
                removed.push(blob);
            }
        }
        self.evictions
            .fetch_add(result.removed as u64, Ordering::Relaxed);
        (result, removed)
    }

    /// Get the number of blobs in the cache.
    #[inline]
    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    /// Check if the cache is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes reserved, non-entrant code included.
    #[inline]
    pub fn used(&self) -> usize {
        self.state.read().used
    }

    /// Total capacity in bytes.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Get cache statistics.
    #[inline]
    pub fn stats(&self) -> CodeCacheStats {
        CodeCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            insertions: self.insertions.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Statistics for the code cache.
#[derive(Debug, Default, Clone)]
pub struct CodeCacheStats {
    /// Number of lookup hits.
    pub hits: u64,
    /// Number of lookup misses.
    pub misses: u64,
    /// Number of commits.
    pub insertions: u64,
    /// Number of blobs removed by sweeps.
    pub evictions: u64,
}

impl CodeCacheStats {
    /// Calculate hit rate.
    #[inline]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn commit(cache: &CodeCache, unit: u64, id: u32, size: usize) -> Commit {
        cache.commit(
            UnitId(unit),
            CompileId(id),
            vec![0x90; size].into_boxed_slice(),
            InstalledCode::new("t"),
        )
    }

    #[test]
    fn test_commit_and_lookup() {
        let cache = CodeCache::new(1024, 16);
        assert!(matches!(commit(&cache, 1, 1, 10), Commit::Entrant { .. }));
        assert_eq!(cache.used(), 16);
        assert_eq!(cache.lookup(CompileId(1)).unwrap().code().len(), 10);
        assert!(cache.lookup(CompileId(2)).is_none());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.insertions, 1);
        assert!((stats.hit_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_newer_code_supersedes_older() {
        let cache = CodeCache::new(1024, 16);
        commit(&cache, 1, 1, 10);
        match commit(&cache, 1, 2, 10) {
            Commit::Entrant { superseded, .. } => {
                assert_eq!(superseded.len(), 1);
                assert_eq!(superseded[0].compile_id(), CompileId(1));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(cache.entrant_for(UnitId(1)).unwrap().compile_id(), CompileId(2));
    }

    #[test]
    fn test_older_code_is_committed_stale() {
        let cache = CodeCache::new(1024, 16);
        commit(&cache, 1, 5, 10);
        assert!(matches!(commit(&cache, 1, 3, 10), Commit::Stale(_)));
        assert_eq!(cache.entrant_for(UnitId(1)).unwrap().compile_id(), CompileId(5));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_full_cache_evicts_nothing() {
        let cache = CodeCache::new(64, 16);
        commit(&cache, 1, 1, 48);
        assert!(matches!(commit(&cache, 2, 2, 32), Commit::Full));
        assert!(cache.lookup(CompileId(1)).unwrap().is_entrant());
        assert_eq!(cache.used(), 48);
    }

    #[test]
    fn test_sweep_frees_non_entrant_space() {
        let cache = CodeCache::new(64, 16);
        commit(&cache, 1, 1, 32);
        commit(&cache, 1, 2, 32);
        assert!(matches!(commit(&cache, 2, 3, 16), Commit::Full));

        let (result, removed) = cache.sweep();
        assert_eq!(result, SweepResult { removed: 1, freed: 32 });
        assert_eq!(removed[0].compile_id(), CompileId(1));
        assert!(matches!(commit(&cache, 2, 3, 16), Commit::Entrant { .. }));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_relocate_moves_live_code_only() {
        let cache = CodeCache::new(1024, 16);
        commit(&cache, 1, 1, 10);
        let before = cache.lookup(CompileId(1)).unwrap().address();
        let after = cache.relocate(CompileId(1)).unwrap();
        assert_ne!(before, after);
        assert!(cache.find_by_address(after + 3).is_some());
        assert!(cache.find_by_address(before).is_none());

        commit(&cache, 1, 2, 10);
        assert!(cache.relocate(CompileId(1)).is_none());
    }
}
