//! Compilation driver.
//!
//! Runs one unit through produce → encode → install and applies the
//! outcome policy:
//!
//! | Outcome              | Action                                             |
//! |----------------------|----------------------------------------------------|
//! | `Installed`          | done                                               |
//! | `CacheFull`          | request eviction, back off, resubmit (bounded)     |
//! | `CodeTooLarge`       | recompile at a lower tier, else give up            |
//! | `DependenciesFailed` | refresh failed speculations and recompile (bounded)|
//! | protocol error       | abort this compilation with an internal error      |

use std::fmt;
use std::thread;

use prism_ci_wire::{CompileId, CompiledArtifact, UnitId};
use tracing::{debug, error, info, warn};

use crate::boundary::SharedRuntime;
use crate::channel::InstallChannel;
use crate::config::ClientConfig;
use crate::error::DriverError;
use crate::installed_code::InstalledCode;
use crate::outcome::InstallOutcome;
use crate::speculation::SpeculationLog;

// =============================================================================
// Tiers
// =============================================================================

/// Optimization tier. Higher tiers produce faster and larger code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tier(pub u8);

impl Tier {
    /// Least optimized tier.
    pub const BASELINE: Tier = Tier(0);
    /// Most optimized tier.
    pub const FULL: Tier = Tier(2);

    /// Next tier down, if any.
    #[inline]
    pub const fn lower(self) -> Option<Tier> {
        match self.0.checked_sub(1) {
            Some(t) => Some(Tier(t)),
            None => None,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tier{}", self.0)
    }
}

// =============================================================================
// Producer
// =============================================================================

/// One request to the compiler proper.
#[derive(Debug)]
pub struct CompileRequest<'a> {
    /// Unit to compile.
    pub unit: UnitId,
    /// Id the artifact must carry.
    pub compile_id: CompileId,
    /// Tier to compile at.
    pub tier: Tier,
    /// The unit's speculation log. Speculations the artifact relies on go
    /// through [`SpeculationLog::speculate`]; the artifact's snapshot is
    /// [`SpeculationLog::failed_speculations`].
    pub log: &'a SpeculationLog,
    /// Zero for the first compilation of this request, counting recompiles.
    pub attempt: u32,
}

/// The compiler proper.
pub trait ArtifactProducer: Send + Sync {
    /// Compile `request.unit`.
    fn produce(&self, request: &CompileRequest<'_>) -> CompiledArtifact;

    /// Tier to fall back to when code at `tier` is too large.
    fn lower_tier(&self, tier: Tier) -> Option<Tier> {
        tier.lower()
    }
}

/// Installed result of a driven compilation.
#[derive(Debug, Clone)]
pub struct CompileSuccess {
    /// Handle to the installed code. Invalid already if a newer
    /// compilation of the unit won the race.
    pub handle: InstalledCode,
    /// Id of the installed compilation.
    pub compile_id: CompileId,
    /// Tier the code was produced at.
    pub tier: Tier,
    /// Recompiles after failed dependencies or oversized code.
    pub recompiles: u32,
    /// Resubmissions after `CacheFull`.
    pub cache_full_retries: u32,
}

// =============================================================================
// Driver
// =============================================================================

/// Drives compilations against one runtime.
pub struct CompilationDriver<P> {
    channel: InstallChannel,
    producer: P,
}

impl<P: ArtifactProducer> CompilationDriver<P> {
    /// Create a driver submitting to `runtime`.
    pub fn new(runtime: SharedRuntime, config: ClientConfig, producer: P) -> Self {
        Self {
            channel: InstallChannel::new(runtime, config),
            producer,
        }
    }

    /// The channel used for submissions.
    #[inline]
    pub fn channel(&self) -> &InstallChannel {
        &self.channel
    }

    /// The producer.
    #[inline]
    pub fn producer(&self) -> &P {
        &self.producer
    }

    /// Compile and install `unit`, starting at `tier`.
    pub fn compile(&self, unit: UnitId, tier: Tier) -> Result<CompileSuccess, DriverError> {
        let runtime = self.channel.runtime();
        let config = self.channel.config();
        let log = SpeculationLog::new(runtime.clone(), unit);
        log.collect_failed_speculations()
            .map_err(|source| DriverError::Speculation { unit, source })?;

        let mut tier = tier;
        let mut recompiles = 0u32;
        let mut dependency_failures = 0u32;
        let mut cache_full_retries = 0u32;

        loop {
            let compile_id = runtime.allocate_compile_id(unit);
            log.take_speculations();
            let artifact = self.producer.produce(&CompileRequest {
                unit,
                compile_id,
                tier,
                log: &log,
                attempt: recompiles,
            });
            let handle = InstalledCode::new(artifact.name());

            loop {
                let result = self.channel.install(&artifact, &handle, log.address());
                let outcome = result.map_err(|source| {
                    error!(unit = unit.as_u64(), compile_id = compile_id.as_u32(), error = %source, "internal error");
                    DriverError::Internal { unit, source }
                })?;
                match outcome {
                    InstallOutcome::Installed => {
                        info!(
                            unit = unit.as_u64(),
                            compile_id = compile_id.as_u32(),
                            %tier,
                            valid = handle.is_valid(),
                            "compilation installed"
                        );
                        return Ok(CompileSuccess {
                            handle,
                            compile_id,
                            tier,
                            recompiles,
                            cache_full_retries,
                        });
                    }
                    InstallOutcome::CacheFull => {
                        if cache_full_retries >= config.max_cache_full_retries {
                            warn!(unit = unit.as_u64(), attempts = cache_full_retries + 1, "code cache stayed full");
                            return Err(DriverError::CacheFull {
                                unit,
                                attempts: cache_full_retries + 1,
                            });
                        }
                        let freed = runtime.request_eviction();
                        let backoff = config.backoff_for(cache_full_retries);
                        cache_full_retries += 1;
                        debug!(unit = unit.as_u64(), freed, ?backoff, retry = cache_full_retries, "retrying after cache full");
                        if !backoff.is_zero() {
                            thread::sleep(backoff);
                        }
                        // The handle was released by the rejected submission.
                    }
                    InstallOutcome::CodeTooLarge => {
                        let Some(lower) = self.producer.lower_tier(tier) else {
                            warn!(unit = unit.as_u64(), %tier, "code too large at lowest tier");
                            return Err(DriverError::CodeTooLarge { unit });
                        };
                        debug!(unit = unit.as_u64(), from = %tier, to = %lower, "code too large, lowering tier");
                        tier = lower;
                        break;
                    }
                    InstallOutcome::DependenciesFailed => {
                        if dependency_failures >= config.max_recompiles {
                            warn!(unit = unit.as_u64(), recompiles, "dependencies keep failing");
                            return Err(DriverError::RecompileLimit { unit, recompiles });
                        }
                        dependency_failures += 1;
                        let known = log
                            .collect_failed_speculations()
                            .map_err(|source| DriverError::Speculation { unit, source })?;
                        debug!(unit = unit.as_u64(), known, "dependencies failed, recompiling");
                        break;
                    }
                }
            }
            recompiles += 1;
        }
    }
}

impl<P> fmt::Debug for CompilationDriver<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompilationDriver")
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}
