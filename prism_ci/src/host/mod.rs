//! In-process runtime implementing the compiler interface.
//!
//! # Install Protocol
//!
//! ```text
//!  claim handle ─▶ decode ─▶ lock unit ─▶ speculations ─▶ assumptions ─▶ ceiling ─▶ commit
//!       │            │                        │               │            │          │
//!   HandleReused  Malformed          DependenciesFailed ◀─────┘      CodeTooLarge  CacheFull
//! ```
//!
//! Installs of the same unit are serialized by a per-unit lock. Every
//! rejection happens before code memory is committed. A commit makes older
//! code of the unit non-entrant and invalidates its handles in the same
//! step; if the unit already runs code from a newer compilation, the new
//! code is committed non-entrant and its handle goes straight from empty to
//! invalidated.

mod code_cache;
mod executor;

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::Mutex;
use prism_ci_wire::{
    CompileId, DecodedArtifact, EncodedStream, InstallFlags, SpeculationRecord, UnitId, decode,
};
use rustc_hash::FxHashSet;
use tracing::{Level, debug, warn};

pub use code_cache::{CodeBlob, CodeCache, CodeCacheStats, Commit, SweepResult};
pub use executor::{CodeExecutor, Invocation, NoExecutor};

use crate::boundary::CompilerToRuntime;
use crate::config::RuntimeConfig;
use crate::error::{ConfigError, ExecuteError, InstallError, SpeculationError};
use crate::installed_code::{InstalledCode, InvalidationReason};
use crate::metadata::{ClassHierarchy, MetadataQueries};
use crate::outcome::InstallOutcome;
use crate::speculation::{LogAddress, SpeculationTable};
use crate::stats::InstallStats;

/// Emit an install event at the configured level.
macro_rules! install_event {
    ($level:expr, $($arg:tt)+) => {{
        let level: Level = $level;
        if level == Level::TRACE {
            tracing::trace!($($arg)+)
        } else if level == Level::DEBUG {
            tracing::debug!($($arg)+)
        } else if level == Level::INFO {
            tracing::info!($($arg)+)
        } else if level == Level::WARN {
            tracing::warn!($($arg)+)
        } else {
            tracing::error!($($arg)+)
        }
    }};
}

// =============================================================================
// Host Runtime
// =============================================================================

/// Runtime owning a code cache and the speculation logs.
pub struct HostRuntime {
    config: RuntimeConfig,
    cache: CodeCache,
    speculations: SpeculationTable,
    metadata: Arc<dyn MetadataQueries>,
    executor: Arc<dyn CodeExecutor>,
    next_compile_id: AtomicU32,
    unit_locks: DashMap<UnitId, Arc<Mutex<()>>>,
    stats: InstallStats,
}

impl HostRuntime {
    /// Create a runtime with an empty class hierarchy and no executor.
    pub fn new(config: RuntimeConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            cache: CodeCache::new(config.code_cache_capacity, config.code_alignment),
            config,
            speculations: SpeculationTable::new(),
            metadata: Arc::new(ClassHierarchy::new()),
            executor: Arc::new(NoExecutor),
            next_compile_id: AtomicU32::new(1),
            unit_locks: DashMap::new(),
            stats: InstallStats::new(),
        })
    }

    /// Use `metadata` to validate dependency assumptions.
    pub fn with_metadata(mut self, metadata: Arc<dyn MetadataQueries>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Use `executor` to run installed code.
    pub fn with_executor(mut self, executor: Arc<dyn CodeExecutor>) -> Self {
        self.executor = executor;
        self
    }

    /// Get the configuration.
    #[inline]
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Get the code cache.
    #[inline]
    pub fn code_cache(&self) -> &CodeCache {
        &self.cache
    }

    /// Get the speculation table.
    #[inline]
    pub fn speculation_table(&self) -> &SpeculationTable {
        &self.speculations
    }

    /// Get the install statistics.
    #[inline]
    pub fn stats(&self) -> &InstallStats {
        &self.stats
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Free the space held by non-entrant code.
    pub fn sweep(&self) -> SweepResult {
        let (result, removed) = self.cache.sweep();
        for blob in &removed {
            // Already invalid unless something bypassed the protocol.
            if blob.handle().invalidate(InvalidationReason::Evicted) {
                self.stats.record_invalidation(false);
            }
        }
        debug!(removed = result.removed, freed = result.freed, "swept code cache");
        result
    }

    /// Move live code and refresh its handle. Returns the new address.
    pub fn relocate(&self, compile_id: CompileId) -> Option<u64> {
        let address = self.cache.relocate(compile_id)?;
        let blob = self.cache.lookup(compile_id)?;
        self.update_installed_code(blob.handle());
        debug!(compile_id = compile_id.as_u32(), address, "relocated code");
        Some(address)
    }

    /// Revoke the unit's live code and free its speculation log.
    pub fn unload(&self, unit: UnitId) {
        while let Some(blob) = self.cache.entrant_for(unit) {
            blob.make_not_entrant();
            if blob.handle().invalidate(InvalidationReason::Unloaded) {
                self.stats.record_invalidation(false);
            }
        }
        if let Some(address) = self.speculations.existing_address(unit) {
            match self.speculations.release(address) {
                // Racing unloads may both see the address; one release wins.
                Ok(()) | Err(SpeculationError::StaleAddress(_)) => {}
                Err(err) => {
                    warn!(unit = unit.as_u64(), error = %err, "failed to release speculation log")
                }
            }
        }
        self.unit_locks
            .remove_if(&unit, |_, lock| Arc::strong_count(lock) == 1);
        debug!(unit = unit.as_u64(), "unloaded unit");
    }

    /// Deoptimize the code behind `handle` after `failed` proved false.
    ///
    /// The record goes to the unit's log so the next compilation sees it,
    /// then the code is revoked. Returns whether the record was new.
    pub fn deoptimize(
        &self,
        handle: &InstalledCode,
        failed: &SpeculationRecord,
    ) -> Result<bool, SpeculationError> {
        let Some(location) = handle.location() else {
            return Ok(false);
        };
        let address = self.speculations.address_of(location.unit);
        let appended = self.speculations.append(address, failed)?;
        self.invalidate_installed_code(handle, true);
        debug!(
            unit = location.unit.as_u64(),
            compile_id = location.compile_id.as_u32(),
            appended,
            "deoptimized"
        );
        Ok(appended)
    }

    // =========================================================================
    // Install (Internal)
    // =========================================================================

    fn unit_lock(&self, unit: UnitId) -> Arc<Mutex<()>> {
        Arc::clone(&self.unit_locks.entry(unit).or_default())
    }

    fn install_claimed(
        &self,
        stream: EncodedStream,
        handle: &InstalledCode,
        speculation_log: LogAddress,
        known_failures: &[SpeculationRecord],
    ) -> Result<InstallOutcome, InstallError> {
        let artifact = decode(&stream)?;
        drop(stream);

        let unit = artifact.unit;
        if !speculation_log.is_null() && self.speculations.unit_of(speculation_log) != Some(unit) {
            return Err(SpeculationError::StaleAddress(speculation_log).into());
        }

        let lock = self.unit_lock(unit);
        let _serialized = lock.lock();

        if let Some(outcome) = self.check_dependencies(&artifact, speculation_log, known_failures)? {
            return Ok(outcome);
        }

        if artifact.code.len() > self.config.max_unit_code_size {
            install_event!(
                self.config.trace_level,
                unit = unit.as_u64(),
                size = artifact.code.len(),
                ceiling = self.config.max_unit_code_size,
                "code too large"
            );
            return Ok(InstallOutcome::CodeTooLarge);
        }

        let size = artifact.code.len();
        let compile_id = artifact.compile_id;
        match self
            .cache
            .commit(unit, compile_id, artifact.code.into_boxed_slice(), handle.clone())
        {
            Commit::Full => {
                install_event!(
                    self.config.trace_level,
                    unit = unit.as_u64(),
                    size,
                    used = self.cache.used(),
                    capacity = self.cache.capacity(),
                    "code cache full"
                );
                Ok(InstallOutcome::CacheFull)
            }
            Commit::Stale(blob) => {
                handle.populate_invalidated(blob.location(), InvalidationReason::Superseded);
                self.stats.record_code_bytes(blob.reserved());
                self.stats.record_stale_install();
                self.stats.record_invalidation(false);
                install_event!(
                    self.config.trace_level,
                    unit = unit.as_u64(),
                    compile_id = compile_id.as_u32(),
                    "committed stale code non-entrant"
                );
                Ok(InstallOutcome::Installed)
            }
            Commit::Entrant { blob, superseded } => {
                for old in &superseded {
                    if old.handle().invalidate(InvalidationReason::Superseded) {
                        self.stats.record_invalidation(false);
                    }
                }
                handle.populate(blob.location());
                self.stats.record_code_bytes(blob.reserved());
                install_event!(
                    self.config.trace_level,
                    unit = unit.as_u64(),
                    compile_id = compile_id.as_u32(),
                    address = blob.address(),
                    size,
                    superseded = superseded.len(),
                    "installed code"
                );
                Ok(InstallOutcome::Installed)
            }
        }
    }

    /// `Some(DependenciesFailed)` if any assumption no longer holds.
    fn check_dependencies(
        &self,
        artifact: &DecodedArtifact,
        speculation_log: LogAddress,
        known_failures: &[SpeculationRecord],
    ) -> Result<Option<InstallOutcome>, InstallError> {
        // Without an explicit log, the unit's own log still applies.
        let snapshot = if speculation_log.is_null() {
            self.speculations.snapshot_unit(artifact.unit, known_failures)
        } else {
            self.speculations.snapshot(speculation_log, known_failures)?
        };
        let failed: FxHashSet<SpeculationRecord> = snapshot.into_iter().collect();
        if let Some(record) = artifact.speculations().find(|r| failed.contains(*r)) {
            install_event!(
                self.config.trace_level,
                unit = artifact.unit.as_u64(),
                record = ?record,
                "speculation already failed"
            );
            return Ok(Some(InstallOutcome::DependenciesFailed));
        }

        if let Some(assumption) = artifact.assumptions.iter().find(|a| !self.metadata.holds(a)) {
            install_event!(
                self.config.trace_level,
                unit = artifact.unit.as_u64(),
                assumption = ?assumption,
                "dependency no longer holds"
            );
            return Ok(Some(InstallOutcome::DependenciesFailed));
        }
        Ok(None)
    }
}

impl std::fmt::Debug for HostRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostRuntime")
            .field("config", &self.config)
            .field("cache", &self.cache)
            .field("speculations", &self.speculations)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Boundary
// =============================================================================

impl CompilerToRuntime for HostRuntime {
    fn install_flags(&self) -> InstallFlags {
        self.config.install_flags
    }

    fn stream_chunk_size(&self) -> usize {
        self.config.chunk_size
    }

    fn allocate_compile_id(&self, unit: UnitId) -> CompileId {
        let id = CompileId(self.next_compile_id.fetch_add(1, Ordering::Relaxed));
        debug!(unit = unit.as_u64(), compile_id = id.as_u32(), "allocated compile id");
        id
    }

    fn install_code(
        &self,
        stream: EncodedStream,
        handle: &InstalledCode,
        speculation_log: LogAddress,
        known_failures: &[SpeculationRecord],
    ) -> Result<InstallOutcome, InstallError> {
        let started = Instant::now();
        if let Err(state) = handle.claim() {
            self.stats.record_protocol_failure();
            warn!(handle = handle.name(), ?state, "installed-code handle reused");
            return Err(InstallError::HandleReused(state));
        }

        let result = self.install_claimed(stream, handle, speculation_log, known_failures);
        match &result {
            Ok(outcome) => {
                if !outcome.is_installed() {
                    handle.unclaim();
                }
                self.stats.record_outcome(*outcome, started.elapsed());
            }
            Err(err) => {
                handle.unclaim();
                self.stats.record_protocol_failure();
                warn!(handle = handle.name(), error = %err, "protocol failure during install");
            }
        }
        result
    }

    fn request_eviction(&self) -> usize {
        self.sweep().freed
    }

    fn failed_speculations_address(&self, unit: UnitId) -> LogAddress {
        self.speculations.address_of(unit)
    }

    fn failed_speculations(
        &self,
        address: LogAddress,
        known: &[SpeculationRecord],
    ) -> Result<Vec<SpeculationRecord>, SpeculationError> {
        self.speculations.snapshot(address, known)
    }

    fn add_failed_speculation(
        &self,
        address: LogAddress,
        record: &SpeculationRecord,
    ) -> Result<bool, SpeculationError> {
        self.speculations.append(address, record)
    }

    fn release_failed_speculations(&self, address: LogAddress) -> Result<(), SpeculationError> {
        self.speculations.release(address)
    }

    fn update_installed_code(&self, handle: &InstalledCode) -> bool {
        let Some(compile_id) = handle.compile_id() else {
            return false;
        };
        match self.cache.lookup(compile_id) {
            Some(blob) if blob.is_entrant() && blob.handle().ptr_eq(handle) => {
                let address = blob.address();
                handle.relocate(address, address);
            }
            _ => {
                if handle.invalidate(InvalidationReason::Evicted) {
                    self.stats.record_invalidation(false);
                }
            }
        }
        handle.is_valid()
    }

    fn invalidate_installed_code(&self, handle: &InstalledCode, deoptimize: bool) {
        let Some(compile_id) = handle.compile_id() else {
            return;
        };
        if let Some(blob) = self.cache.lookup(compile_id) {
            if blob.handle().ptr_eq(handle) {
                blob.make_not_entrant();
            }
        }
        let reason = if deoptimize {
            InvalidationReason::Deoptimized
        } else {
            InvalidationReason::Explicit
        };
        if handle.invalidate(reason) {
            self.stats.record_invalidation(deoptimize);
            debug!(compile_id = compile_id.as_u32(), deoptimize, "invalidated installed code");
        }
    }

    fn execute_installed_code(
        &self,
        handle: &InstalledCode,
        args: &[i64],
    ) -> Result<i64, ExecuteError> {
        let invalid = || ExecuteError::InvalidInstalledCode(handle.compile_id());
        if !handle.is_valid() {
            return Err(invalid());
        }
        let location = handle.location().ok_or_else(invalid)?;
        let blob = self
            .cache
            .lookup(location.compile_id)
            .filter(|blob| blob.is_entrant())
            .ok_or_else(invalid)?;

        let invocation = Invocation {
            unit: location.unit,
            compile_id: location.compile_id,
            entry_point: blob.address(),
            code: blob.code(),
            args,
        };
        self.executor
            .execute(&invocation)
            .map_err(ExecuteError::Exception)
    }

    fn installed_code_bytes(&self, handle: &InstalledCode) -> Option<Vec<u8>> {
        if !handle.is_valid() {
            return None;
        }
        let blob = self.cache.lookup(handle.compile_id()?)?;
        Some(blob.code().to_vec())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::installed_code::CodeState;
    use prism_ci_wire::{
        ArtifactEncoder, CompiledArtifact, DependencyAssumption, EncodingFlags, TypeId,
    };

    fn runtime() -> HostRuntime {
        HostRuntime::new(RuntimeConfig::for_testing()).unwrap()
    }

    fn stream_for(artifact: &CompiledArtifact) -> EncodedStream {
        ArtifactEncoder::new(EncodingFlags::ALL).encode(artifact).unwrap()
    }

    fn artifact(rt: &HostRuntime, unit: u64, size: usize) -> CompiledArtifact {
        let unit = UnitId(unit);
        CompiledArtifact::builder(unit, rt.allocate_compile_id(unit), vec![0xC3; size]).build()
    }

    fn install(rt: &HostRuntime, artifact: &CompiledArtifact) -> (InstalledCode, InstallOutcome) {
        let handle = InstalledCode::new("test");
        let outcome = rt
            .install_code(stream_for(artifact), &handle, LogAddress::NULL, &[])
            .unwrap();
        (handle, outcome)
    }

    #[test]
    fn test_install_populates_handle() {
        let rt = runtime();
        let a = artifact(&rt, 1, 32);
        let (handle, outcome) = install(&rt, &a);
        assert_eq!(outcome, InstallOutcome::Installed);
        assert!(handle.is_valid());
        assert_eq!(handle.compile_id(), Some(a.compile_id()));
        assert_ne!(handle.address(), 0);
        assert_eq!(rt.installed_code_bytes(&handle).unwrap(), a.code());
        assert_eq!(rt.stats().snapshot().installed, 1);
    }

    #[test]
    fn test_handle_cannot_be_reused() {
        let rt = runtime();
        let a = artifact(&rt, 1, 32);
        let (handle, _) = install(&rt, &a);
        let err = rt
            .install_code(stream_for(&a), &handle, LogAddress::NULL, &[])
            .unwrap_err();
        assert_eq!(err, InstallError::HandleReused(CodeState::Installed));
        assert_eq!(rt.stats().snapshot().protocol_failures, 1);
    }

    #[test]
    fn test_newer_install_supersedes() {
        let rt = runtime();
        let (first, _) = install(&rt, &artifact(&rt, 1, 32));
        let (second, _) = install(&rt, &artifact(&rt, 1, 32));
        assert!(!first.is_valid());
        assert_eq!(first.invalidation_reason(), Some(InvalidationReason::Superseded));
        assert!(second.is_valid());
    }

    #[test]
    fn test_stale_install_is_never_valid() {
        let rt = runtime();
        let older = artifact(&rt, 1, 32);
        let newer = artifact(&rt, 1, 32);
        let (new_handle, _) = install(&rt, &newer);
        let (old_handle, outcome) = install(&rt, &older);

        assert_eq!(outcome, InstallOutcome::Installed);
        assert_eq!(old_handle.state(), CodeState::Invalidated);
        assert!(new_handle.is_valid());
        assert_eq!(rt.stats().snapshot().stale_installs, 1);
    }

    #[test]
    fn test_code_too_large_versus_cache_full() {
        let rt = runtime();
        let ceiling = rt.config().max_unit_code_size;
        let (_, outcome) = install(&rt, &artifact(&rt, 1, ceiling + 1));
        assert_eq!(outcome, InstallOutcome::CodeTooLarge);

        let mut last = InstallOutcome::Installed;
        for unit in 2..64 {
            let (_, outcome) = install(&rt, &artifact(&rt, unit, ceiling));
            last = outcome;
            if outcome != InstallOutcome::Installed {
                break;
            }
        }
        assert_eq!(last, InstallOutcome::CacheFull);
    }

    #[test]
    fn test_failed_type_assumption_rejects_before_commit() {
        let hierarchy = Arc::new(ClassHierarchy::new());
        hierarchy.load(TypeId(1), None);
        hierarchy.load(TypeId(2), Some(TypeId(1)));
        let rt = runtime().with_metadata(hierarchy);

        let unit = UnitId(1);
        let a = CompiledArtifact::builder(unit, rt.allocate_compile_id(unit), vec![0; 16])
            .assume(DependencyAssumption::LeafType(TypeId(1)))
            .build();
        let (handle, outcome) = install(&rt, &a);
        assert_eq!(outcome, InstallOutcome::DependenciesFailed);
        assert_eq!(handle.state(), CodeState::Empty);
        assert_eq!(rt.code_cache().used(), 0);
    }

    #[test]
    fn test_known_failed_speculation_rejects() {
        let rt = runtime();
        let unit = UnitId(1);
        let address = rt.failed_speculations_address(unit);
        let record = SpeculationRecord::from(&b"receiver"[..]);
        assert!(rt.add_failed_speculation(address, &record).unwrap());

        let a = CompiledArtifact::builder(unit, rt.allocate_compile_id(unit), vec![0; 16])
            .assume(DependencyAssumption::Speculation(record))
            .build();
        let handle = InstalledCode::new("t");
        let outcome = rt
            .install_code(stream_for(&a), &handle, address, &[])
            .unwrap();
        assert_eq!(outcome, InstallOutcome::DependenciesFailed);
        assert_eq!(rt.code_cache().used(), 0);
    }

    #[test]
    fn test_null_log_address_still_checks_unit_log() {
        let rt = runtime();
        let unit = UnitId(1);
        let record = SpeculationRecord::from(&b"receiver"[..]);
        let address = rt.failed_speculations_address(unit);
        rt.add_failed_speculation(address, &record).unwrap();

        let a = CompiledArtifact::builder(unit, rt.allocate_compile_id(unit), vec![0; 16])
            .assume(DependencyAssumption::Speculation(record))
            .build();
        let (handle, outcome) = install(&rt, &a);
        assert_eq!(outcome, InstallOutcome::DependenciesFailed);
        assert_eq!(handle.state(), CodeState::Empty);
        assert_eq!(rt.code_cache().used(), 0);

        // Another unit's log does not leak into this check.
        let other = CompiledArtifact::builder(UnitId(2), rt.allocate_compile_id(UnitId(2)), vec![0; 16])
            .assume(DependencyAssumption::Speculation(SpeculationRecord::from(&b"receiver"[..])))
            .build();
        assert_eq!(install(&rt, &other).1, InstallOutcome::Installed);
    }

    #[test]
    fn test_log_of_another_unit_is_protocol_error() {
        let rt = runtime();
        let other = rt.failed_speculations_address(UnitId(99));
        let a = artifact(&rt, 1, 16);
        let err = rt
            .install_code(stream_for(&a), &InstalledCode::new("t"), other, &[])
            .unwrap_err();
        assert_eq!(err, InstallError::Speculation(SpeculationError::StaleAddress(other)));
    }

    #[test]
    fn test_execute_and_invalidate() {
        let executor = |inv: &Invocation<'_>| -> Result<i64, String> {
            if inv.args.first() == Some(&-1) {
                Err("negative".into())
            } else {
                Ok(inv.args.iter().sum::<i64>() + inv.code.len() as i64)
            }
        };
        let rt = runtime().with_executor(Arc::new(executor));
        let (handle, _) = install(&rt, &artifact(&rt, 1, 4));

        assert_eq!(rt.execute_installed_code(&handle, &[1, 2]), Ok(7));
        assert_eq!(
            rt.execute_installed_code(&handle, &[-1]),
            Err(ExecuteError::Exception("negative".into()))
        );

        rt.invalidate_installed_code(&handle, true);
        assert_eq!(handle.invalidation_reason(), Some(InvalidationReason::Deoptimized));
        for _ in 0..3 {
            assert!(rt.execute_installed_code(&handle, &[1]).unwrap_err().is_invalid_code());
        }
        assert!(rt.installed_code_bytes(&handle).is_none());
        assert_eq!(rt.stats().snapshot().deoptimizations, 1);
    }

    #[test]
    fn test_execute_empty_handle_is_invalid_code() {
        let rt = runtime();
        let err = rt
            .execute_installed_code(&InstalledCode::new("t"), &[])
            .unwrap_err();
        assert_eq!(err, ExecuteError::InvalidInstalledCode(None));
    }

    #[test]
    fn test_relocate_updates_handle() {
        let rt = runtime();
        let (handle, _) = install(&rt, &artifact(&rt, 1, 16));
        let before = handle.address();
        let after = rt.relocate(handle.compile_id().unwrap()).unwrap();
        assert_ne!(before, after);
        assert_eq!(handle.address(), after);
        assert_eq!(handle.entry_point(), after);
        assert!(handle.is_valid());
    }

    #[test]
    fn test_sweep_reclaims_superseded_code() {
        let rt = runtime();
        install(&rt, &artifact(&rt, 1, 64));
        install(&rt, &artifact(&rt, 1, 64));
        assert_eq!(rt.code_cache().used(), 128);
        assert_eq!(rt.request_eviction(), 64);
        assert_eq!(rt.code_cache().used(), 64);
    }

    #[test]
    fn test_unload_revokes_code_and_log() {
        let rt = runtime();
        let unit = UnitId(1);
        let address = rt.failed_speculations_address(unit);
        let (handle, _) = install(&rt, &artifact(&rt, 1, 16));

        rt.unload(unit);
        assert_eq!(handle.invalidation_reason(), Some(InvalidationReason::Unloaded));
        assert!(rt.failed_speculations(address, &[]).is_err());
        assert_ne!(rt.failed_speculations_address(unit), address);
    }

    #[test]
    fn test_unload_drops_unit_lock() {
        let rt = runtime();
        install(&rt, &artifact(&rt, 1, 16));
        install(&rt, &artifact(&rt, 2, 16));
        assert_eq!(rt.unit_locks.len(), 2);

        rt.unload(UnitId(1));
        assert_eq!(rt.unit_locks.len(), 1);
        assert!(!rt.unit_locks.contains_key(&UnitId(1)));

        // A held lock survives the unload.
        let held = rt.unit_lock(UnitId(2));
        rt.unload(UnitId(2));
        assert!(rt.unit_locks.contains_key(&UnitId(2)));
        drop(held);
        rt.unload(UnitId(2));
        assert!(rt.unit_locks.is_empty());
    }

    #[test]
    fn test_repeated_unload_is_harmless() {
        let rt = runtime();
        let unit = UnitId(1);
        rt.failed_speculations_address(unit);
        install(&rt, &artifact(&rt, 1, 16));
        assert_eq!(rt.speculations.log_count(), 1);

        rt.unload(unit);
        rt.unload(unit);
        assert_eq!(rt.speculations.log_count(), 0);
        assert_eq!(rt.speculations.existing_address(unit), None);
    }

    #[test]
    fn test_deoptimize_records_failure_and_revokes() {
        let rt = runtime();
        let (handle, _) = install(&rt, &artifact(&rt, 1, 16));
        let record = SpeculationRecord::from(&b"type-check"[..]);

        assert!(rt.deoptimize(&handle, &record).unwrap());
        assert_eq!(handle.invalidation_reason(), Some(InvalidationReason::Deoptimized));
        let address = rt.failed_speculations_address(UnitId(1));
        assert_eq!(rt.failed_speculations(address, &[]).unwrap(), vec![record.clone()]);

        assert!(!rt.deoptimize(&handle, &record).unwrap());
        assert!(!rt.deoptimize(&InstalledCode::new("empty"), &record).unwrap());
    }

    #[test]
    fn test_malformed_stream_is_fatal_and_releases_handle() {
        let rt = runtime();
        let a = artifact(&rt, 1, 16);
        let stream = stream_for(&a);
        let mut bytes = stream.to_contiguous();
        bytes[0] = b'X';
        let broken = EncodedStream::from_bytes(&bytes, 64, stream.pool().clone());

        let handle = InstalledCode::new("t");
        let err = rt
            .install_code(broken, &handle, LogAddress::NULL, &[])
            .unwrap_err();
        assert!(err.is_encoder_defect());
        assert_eq!(handle.state(), CodeState::Empty);

        let outcome = rt
            .install_code(stream, &handle, LogAddress::NULL, &[])
            .unwrap();
        assert_eq!(outcome, InstallOutcome::Installed);
    }
}
