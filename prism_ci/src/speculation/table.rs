//! Runtime-owned registry of per-unit speculation logs.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use prism_ci_wire::{SpeculationRecord, UnitId};
use tracing::{debug, trace};

use super::LogAddress;
use super::list::FailedSpeculationList;
use crate::error::SpeculationError;

/// Live log behind an address.
#[derive(Debug)]
struct LogEntry {
    unit: UnitId,
    list: Arc<FailedSpeculationList>,
}

/// Maps units to stable log addresses and addresses to their lists.
///
/// An address is created lazily on the first request for a unit and stays
/// the same until [`release`](Self::release). Released addresses are never
/// handed out again.
#[derive(Debug)]
pub struct SpeculationTable {
    by_unit: DashMap<UnitId, LogAddress>,
    logs: DashMap<LogAddress, LogEntry>,
    next_address: AtomicU64,
}

impl SpeculationTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self {
            by_unit: DashMap::new(),
            logs: DashMap::new(),
            next_address: AtomicU64::new(1),
        }
    }

    /// Get the address of `unit`'s log, creating the log on first use.
    pub fn address_of(&self, unit: UnitId) -> LogAddress {
        // The unit shard stays locked while the log is registered, so a
        // concurrent caller never sees an address without its list.
        *self.by_unit.entry(unit).or_insert_with(|| {
            let address = LogAddress::from_raw(self.next_address.fetch_add(1, Ordering::Relaxed));
            self.logs.insert(
                address,
                LogEntry {
                    unit,
                    list: Arc::new(FailedSpeculationList::new()),
                },
            );
            debug!(unit = unit.as_u64(), address = address.raw(), "created speculation log");
            address
        })
    }

    /// Address of `unit`'s log without creating one.
    pub fn existing_address(&self, unit: UnitId) -> Option<LogAddress> {
        self.by_unit.get(&unit).map(|entry| *entry)
    }

    /// Get the list at `address`.
    pub fn list(&self, address: LogAddress) -> Result<Arc<FailedSpeculationList>, SpeculationError> {
        if address.is_null() {
            return Err(SpeculationError::NullAddress);
        }
        self.logs
            .get(&address)
            .map(|entry| Arc::clone(&entry.list))
            .ok_or(SpeculationError::StaleAddress(address))
    }

    /// Unit owning the log at `address`.
    pub fn unit_of(&self, address: LogAddress) -> Option<UnitId> {
        self.logs.get(&address).map(|entry| entry.unit)
    }

    /// Append `record` to the log at `address`. Returns whether it was new.
    pub fn append(
        &self,
        address: LogAddress,
        record: &SpeculationRecord,
    ) -> Result<bool, SpeculationError> {
        let appended = self.list(address)?.append(record);
        trace!(address = address.raw(), appended, "append failed speculation");
        Ok(appended)
    }

    /// Union of the log at `address` and `known`. The null address has no
    /// stored records, so only `known` (deduplicated) is returned.
    pub fn snapshot(
        &self,
        address: LogAddress,
        known: &[SpeculationRecord],
    ) -> Result<Vec<SpeculationRecord>, SpeculationError> {
        if address.is_null() {
            return Ok(FailedSpeculationList::new().snapshot(known));
        }
        Ok(self.list(address)?.snapshot(known))
    }

    /// Union of `unit`'s log, if it has one, and `known`. A log released
    /// concurrently counts as empty.
    pub fn snapshot_unit(&self, unit: UnitId, known: &[SpeculationRecord]) -> Vec<SpeculationRecord> {
        match self.existing_address(unit).and_then(|address| self.list(address).ok()) {
            Some(list) => list.snapshot(known),
            None => FailedSpeculationList::new().snapshot(known),
        }
    }

    /// Free the log at `address`. The unit gets a fresh, empty log with a
    /// new address on its next [`address_of`](Self::address_of).
    pub fn release(&self, address: LogAddress) -> Result<(), SpeculationError> {
        if address.is_null() {
            return Err(SpeculationError::NullAddress);
        }
        let (_, entry) = self
            .logs
            .remove(&address)
            .ok_or(SpeculationError::StaleAddress(address))?;
        self.by_unit.remove_if(&entry.unit, |_, current| *current == address);
        debug!(
            unit = entry.unit.as_u64(),
            address = address.raw(),
            records = entry.list.len(),
            "released speculation log"
        );
        Ok(())
    }

    /// Number of live logs.
    #[inline]
    pub fn log_count(&self) -> usize {
        self.logs.len()
    }
}

impl Default for SpeculationTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(bytes: &[u8]) -> SpeculationRecord {
        SpeculationRecord::from(bytes)
    }

    #[test]
    fn test_address_is_stable_per_unit() {
        let table = SpeculationTable::new();
        let a = table.address_of(UnitId(1));
        let b = table.address_of(UnitId(1));
        let c = table.address_of(UnitId(2));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(!a.is_null());
        assert_eq!(table.unit_of(a), Some(UnitId(1)));
    }

    #[test]
    fn test_append_and_snapshot() {
        let table = SpeculationTable::new();
        let addr = table.address_of(UnitId(1));
        assert!(table.append(addr, &rec(b"x")).unwrap());
        assert!(!table.append(addr, &rec(b"x")).unwrap());
        assert_eq!(
            table.snapshot(addr, &[rec(b"y")]).unwrap(),
            vec![rec(b"x"), rec(b"y")]
        );
    }

    #[test]
    fn test_release_never_reuses_address() {
        let table = SpeculationTable::new();
        let old = table.address_of(UnitId(1));
        table.append(old, &rec(b"x")).unwrap();
        table.release(old).unwrap();

        assert_eq!(table.append(old, &rec(b"x")), Err(SpeculationError::StaleAddress(old)));
        assert_eq!(table.release(old), Err(SpeculationError::StaleAddress(old)));

        assert_eq!(table.existing_address(UnitId(1)), None);
        let fresh = table.address_of(UnitId(1));
        assert_ne!(fresh, old);
        assert!(table.snapshot(fresh, &[]).unwrap().is_empty());
    }

    #[test]
    fn test_snapshot_by_unit() {
        let table = SpeculationTable::new();
        assert_eq!(table.snapshot_unit(UnitId(1), &[rec(b"k")]), vec![rec(b"k")]);
        assert_eq!(table.existing_address(UnitId(1)), None);

        let addr = table.address_of(UnitId(1));
        table.append(addr, &rec(b"x")).unwrap();
        assert_eq!(
            table.snapshot_unit(UnitId(1), &[rec(b"x"), rec(b"k")]),
            vec![rec(b"x"), rec(b"k")]
        );
        assert!(table.snapshot_unit(UnitId(2), &[]).is_empty());

        table.release(addr).unwrap();
        assert!(table.snapshot_unit(UnitId(1), &[]).is_empty());
    }

    #[test]
    fn test_null_address() {
        let table = SpeculationTable::new();
        assert_eq!(
            table.append(LogAddress::NULL, &rec(b"x")),
            Err(SpeculationError::NullAddress)
        );
        assert_eq!(
            table.snapshot(LogAddress::NULL, &[rec(b"k"), rec(b"k")]).unwrap(),
            vec![rec(b"k")]
        );
    }
}
