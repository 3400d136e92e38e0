//! Installation statistics.
//!
//! # Metrics
//!
//! - Installs per outcome
//! - Installed code bytes
//! - Time spent installing
//! - Protocol failures
//! - Invalidations and deoptimizations

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::outcome::InstallOutcome;

// =============================================================================
// InstallStats
// =============================================================================

/// Counters for one runtime. All updates are relaxed atomics.
#[derive(Debug, Default)]
pub struct InstallStats {
    /// Indexed by [`InstallOutcome::code`].
    outcomes: [AtomicU64; 4],
    code_bytes: AtomicU64,
    install_time_ns: AtomicU64,
    protocol_failures: AtomicU64,
    invalidations: AtomicU64,
    deoptimizations: AtomicU64,
    stale_installs: AtomicU64,
}

impl InstallStats {
    /// Create zeroed statistics.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an install attempt that produced `outcome`.
    #[inline]
    pub fn record_outcome(&self, outcome: InstallOutcome, elapsed: Duration) {
        self.outcomes[outcome.code() as usize].fetch_add(1, Ordering::Relaxed);
        self.install_time_ns
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }

    /// Record bytes committed to the cache.
    #[inline]
    pub fn record_code_bytes(&self, bytes: usize) {
        self.code_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Record a protocol-fatal submission.
    #[inline]
    pub fn record_protocol_failure(&self) {
        self.protocol_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a handle invalidation.
    #[inline]
    pub fn record_invalidation(&self, deoptimized: bool) {
        self.invalidations.fetch_add(1, Ordering::Relaxed);
        if deoptimized {
            self.deoptimizations.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record an install committed non-entrant because newer code existed.
    #[inline]
    pub fn record_stale_install(&self) {
        self.stale_installs.fetch_add(1, Ordering::Relaxed);
    }

    /// Installs that produced `outcome`.
    #[inline]
    pub fn count(&self, outcome: InstallOutcome) -> u64 {
        self.outcomes[outcome.code() as usize].load(Ordering::Relaxed)
    }

    /// Take a consistent-enough copy for reporting.
    pub fn snapshot(&self) -> InstallStatsSnapshot {
        InstallStatsSnapshot {
            installed: self.count(InstallOutcome::Installed),
            cache_full: self.count(InstallOutcome::CacheFull),
            code_too_large: self.count(InstallOutcome::CodeTooLarge),
            dependencies_failed: self.count(InstallOutcome::DependenciesFailed),
            code_bytes: self.code_bytes.load(Ordering::Relaxed),
            install_time: Duration::from_nanos(self.install_time_ns.load(Ordering::Relaxed)),
            protocol_failures: self.protocol_failures.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            deoptimizations: self.deoptimizations.load(Ordering::Relaxed),
            stale_installs: self.stale_installs.load(Ordering::Relaxed),
        }
    }

    /// Reset all counters.
    pub fn reset(&self) {
        for counter in &self.outcomes {
            counter.store(0, Ordering::Relaxed);
        }
        self.code_bytes.store(0, Ordering::Relaxed);
        self.install_time_ns.store(0, Ordering::Relaxed);
        self.protocol_failures.store(0, Ordering::Relaxed);
        self.invalidations.store(0, Ordering::Relaxed);
        self.deoptimizations.store(0, Ordering::Relaxed);
        self.stale_installs.store(0, Ordering::Relaxed);
    }
}

// =============================================================================
// Snapshot
// =============================================================================

/// Point-in-time copy of [`InstallStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallStatsSnapshot {
    /// Successful installs.
    pub installed: u64,
    /// `CacheFull` outcomes.
    pub cache_full: u64,
    /// `CodeTooLarge` outcomes.
    pub code_too_large: u64,
    /// `DependenciesFailed` outcomes.
    pub dependencies_failed: u64,
    /// Bytes committed to the cache.
    pub code_bytes: u64,
    /// Total time spent in install.
    pub install_time: Duration,
    /// Protocol-fatal submissions.
    pub protocol_failures: u64,
    /// Handles invalidated.
    pub invalidations: u64,
    /// Invalidations that deoptimized activations.
    pub deoptimizations: u64,
    /// Installs committed non-entrant because newer code existed.
    pub stale_installs: u64,
}

impl InstallStatsSnapshot {
    /// Submissions that produced an outcome.
    #[inline]
    pub fn attempts(&self) -> u64 {
        self.installed + self.cache_full + self.code_too_large + self.dependencies_failed
    }

    /// Fraction of attempts that installed.
    #[inline]
    pub fn success_rate(&self) -> f64 {
        let total = self.attempts();
        if total == 0 {
            0.0
        } else {
            self.installed as f64 / total as f64
        }
    }
}
