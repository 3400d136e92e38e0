//! Lock-free, append-only, content-deduplicated list of failed speculations.
//!
//! Appends link new nodes at the tail with a single CAS on the last `next`
//! pointer. An appender compares the record against every node it walks
//! past, including nodes linked by a racing appender after its CAS lost, so
//! two threads appending the same record converge on one stored entry.
//!
//! Nodes are never unlinked while the list is alive; the whole chain is
//! freed in `Drop`.

use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use prism_ci_wire::SpeculationRecord;
use rustc_hash::FxHashSet;

// =============================================================================
// Node (Internal)
// =============================================================================

struct Node {
    record: SpeculationRecord,
    next: AtomicPtr<Node>,
}

// =============================================================================
// Failed Speculation List
// =============================================================================

/// Failed speculations recorded for one compiled unit.
pub struct FailedSpeculationList {
    head: AtomicPtr<Node>,
    len: AtomicUsize,
}

impl FailedSpeculationList {
    /// Create an empty list.
    pub fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
            len: AtomicUsize::new(0),
        }
    }

    /// Append `record` unless an equal record is already present.
    ///
    /// Returns whether a new entry was stored.
    pub fn append(&self, record: &SpeculationRecord) -> bool {
        // Allocated on first need and reused if a CAS loses.
        let mut pending: *mut Node = ptr::null_mut();
        let mut link = &self.head;

        loop {
            let current = link.load(Ordering::Acquire);
            if !current.is_null() {
                // SAFETY: linked nodes are only freed in Drop, which cannot
                // run while `&self` is borrowed.
                let node = unsafe { &*current };
                if node.record == *record {
                    if !pending.is_null() {
                        // SAFETY: `pending` came from Box::into_raw and was
                        // never published.
                        unsafe { drop(Box::from_raw(pending)) };
                    }
                    return false;
                }
                link = &node.next;
                continue;
            }

            if pending.is_null() {
                pending = Box::into_raw(Box::new(Node {
                    record: record.clone(),
                    next: AtomicPtr::new(ptr::null_mut()),
                }));
            }
            match link.compare_exchange(
                ptr::null_mut(),
                pending,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.len.fetch_add(1, Ordering::Relaxed);
                    return true;
                }
                // Someone linked a node here first; inspect it on the next turn.
                Err(_) => continue,
            }
        }
    }

    /// Whether an equal record is present.
    pub fn contains(&self, record: &SpeculationRecord) -> bool {
        self.iter().any(|r| r == record)
    }

    /// Number of stored records.
    #[inline]
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    /// Whether no record is stored.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }

    /// Iterate the records in append order.
    pub fn iter(&self) -> Records<'_> {
        Records {
            next: self.head.load(Ordering::Acquire),
            _list: self,
        }
    }

    /// Union of the stored records and `known`, deduplicated by content.
    ///
    /// Stored records come first, in append order, followed by the entries
    /// of `known` that were not stored.
    pub fn snapshot(&self, known: &[SpeculationRecord]) -> Vec<SpeculationRecord> {
        let mut seen: FxHashSet<&SpeculationRecord> = FxHashSet::default();
        let mut merged = Vec::with_capacity(self.len() + known.len());
        for record in self.iter().chain(known.iter()) {
            if seen.insert(record) {
                merged.push(record.clone());
            }
        }
        merged
    }
}

impl Default for FailedSpeculationList {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for FailedSpeculationList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

impl Drop for FailedSpeculationList {
    fn drop(&mut self) {
        let mut current = *self.head.get_mut();
        while !current.is_null() {
            // SAFETY: every linked node came from Box::into_raw and we have
            // exclusive access.
            let mut node = unsafe { Box::from_raw(current) };
            current = *node.next.get_mut();
        }
    }
}

/// Iterator over a [`FailedSpeculationList`].
pub struct Records<'a> {
    next: *mut Node,
    _list: &'a FailedSpeculationList,
}

impl<'a> Iterator for Records<'a> {
    type Item = &'a SpeculationRecord;

    fn next(&mut self) -> Option<&'a SpeculationRecord> {
        if self.next.is_null() {
            return None;
        }
        // SAFETY: the node is linked into a list borrowed for 'a.
        let node: &'a Node = unsafe { &*self.next };
        self.next = node.next.load(Ordering::Acquire);
        Some(&node.record)
    }
}

// =============================================================================
// Tests
// =============================================================================
