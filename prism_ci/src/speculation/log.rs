//! Client-side view of one unit's speculation log.

use std::sync::OnceLock;

use parking_lot::{Mutex, RwLock};
use prism_ci_wire::{DependencyAssumption, SpeculationRecord, UnitId};
use rustc_hash::FxHashSet;
use tracing::debug;

use super::LogAddress;
use crate::boundary::SharedRuntime;
use crate::error::SpeculationError;

/// Per-unit proxy used by the compiler while producing an artifact.
///
/// Caches the failures collected from the runtime so that
/// [`may_speculate`](Self::may_speculate) is answered locally, and records
/// which speculations the current compilation relied on.
pub struct SpeculationLog {
    runtime: SharedRuntime,
    unit: UnitId,
    address: OnceLock<LogAddress>,
    failed: RwLock<FxHashSet<SpeculationRecord>>,
    used: Mutex<Vec<SpeculationRecord>>,
}

impl SpeculationLog {
    /// Create a proxy for `unit`. No runtime call is made until the
    /// address is first needed.
    pub fn new(runtime: SharedRuntime, unit: UnitId) -> Self {
        Self {
            runtime,
            unit,
            address: OnceLock::new(),
            failed: RwLock::new(FxHashSet::default()),
            used: Mutex::new(Vec::new()),
        }
    }

    /// Unit this log belongs to.
    #[inline]
    pub fn unit(&self) -> UnitId {
        self.unit
    }

    /// The unit's log address, obtained from the runtime on first call.
    pub fn address(&self) -> LogAddress {
        *self
            .address
            .get_or_init(|| self.runtime.failed_speculations_address(self.unit))
    }

    /// Refresh the cached failures from the runtime. Returns the number of
    /// known failures afterwards.
    pub fn collect_failed_speculations(&self) -> Result<usize, SpeculationError> {
        let known = self.failed_speculations();
        let merged = self.runtime.failed_speculations(self.address(), &known)?;
        let mut failed = self.failed.write();
        failed.extend(merged);
        debug!(unit = self.unit.as_u64(), known = failed.len(), "collected failed speculations");
        Ok(failed.len())
    }

    /// Whether `record` is not known to have failed.
    pub fn may_speculate(&self, record: &SpeculationRecord) -> bool {
        !self.failed.read().contains(record)
    }

    /// Rely on `record` in the current compilation.
    ///
    /// Returns the dependency assumption to attach to the artifact, or
    /// `None` if the speculation is known to fail.
    pub fn speculate(&self, record: SpeculationRecord) -> Option<DependencyAssumption> {
        if !self.may_speculate(&record) {
            return None;
        }
        let mut used = self.used.lock();
        if !used.contains(&record) {
            used.push(record.clone());
        }
        Some(DependencyAssumption::Speculation(record))
    }

    /// Speculations relied on since the last [`take_speculations`](Self::take_speculations).
    pub fn take_speculations(&self) -> Vec<SpeculationRecord> {
        std::mem::take(&mut *self.used.lock())
    }

    /// Cached failures, the snapshot an artifact should carry.
    pub fn failed_speculations(&self) -> Vec<SpeculationRecord> {
        let mut records: Vec<_> = self.failed.read().iter().cloned().collect();
        records.sort();
        records
    }

    /// Record a failed speculation with the runtime, as the deoptimization
    /// path does. Returns whether it was new to the runtime.
    pub fn add_failed_speculation(&self, record: &SpeculationRecord) -> Result<bool, SpeculationError> {
        let appended = self.runtime.add_failed_speculation(self.address(), record)?;
        self.failed.write().insert(record.clone());
        debug!(unit = self.unit.as_u64(), appended, "added failed speculation");
        Ok(appended)
    }
}

impl std::fmt::Debug for SpeculationLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpeculationLog")
            .field("unit", &self.unit)
            .field("address", &self.address.get())
            .field("failed", &self.failed.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boundary::CompilerToRuntime;
    use crate::config::RuntimeConfig;
    use crate::host::HostRuntime;
    use std::sync::Arc;

    fn runtime() -> Arc<HostRuntime> {
        Arc::new(HostRuntime::new(RuntimeConfig::for_testing()).unwrap())
    }

    fn rec(bytes: &[u8]) -> SpeculationRecord {
        SpeculationRecord::from(bytes)
    }

    #[test]
    fn test_address_is_lazy_and_stable() {
        let rt = runtime();
        let log = SpeculationLog::new(rt.clone(), UnitId(7));
        assert_eq!(rt.speculation_table().log_count(), 0);
        let address = log.address();
        assert_eq!(log.address(), address);
        assert_eq!(rt.failed_speculations_address(UnitId(7)), address);
    }

    #[test]
    fn test_collect_sees_failures_from_other_proxies() {
        let rt = runtime();
        let deopt = SpeculationLog::new(rt.clone(), UnitId(1));
        let compiler = SpeculationLog::new(rt.clone(), UnitId(1));

        assert!(deopt.add_failed_speculation(&rec(b"a")).unwrap());
        assert!(!deopt.add_failed_speculation(&rec(b"a")).unwrap());
        assert!(compiler.may_speculate(&rec(b"a")));

        assert_eq!(compiler.collect_failed_speculations().unwrap(), 1);
        assert!(!compiler.may_speculate(&rec(b"a")));
        assert!(compiler.speculate(rec(b"a")).is_none());
    }

    #[test]
    fn test_speculate_tracks_used_records_once() {
        let log = SpeculationLog::new(runtime(), UnitId(1));
        assert_eq!(
            log.speculate(rec(b"x")),
            Some(DependencyAssumption::Speculation(rec(b"x")))
        );
        log.speculate(rec(b"x"));
        log.speculate(rec(b"y"));
        assert_eq!(log.take_speculations(), vec![rec(b"x"), rec(b"y")]);
        assert!(log.take_speculations().is_empty());
    }

    #[test]
    fn test_snapshot_is_sorted() {
        let log = SpeculationLog::new(runtime(), UnitId(1));
        log.add_failed_speculation(&rec(b"b")).unwrap();
        log.add_failed_speculation(&rec(b"a")).unwrap();
        assert_eq!(log.failed_speculations(), vec![rec(b"a"), rec(b"b")]);
    }

    #[test]
    fn test_released_log_is_stale() {
        let rt = runtime();
        let log = SpeculationLog::new(rt.clone(), UnitId(1));
        let address = log.address();
        rt.release_failed_speculations(address).unwrap();
        assert_eq!(
            log.collect_failed_speculations(),
            Err(SpeculationError::StaleAddress(address))
        );
    }
}
