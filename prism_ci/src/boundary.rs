//! The narrow synchronous interface from the compiler into the runtime.
//!
//! Every call blocks until the runtime responds. Callers must not hold
//! unit-level locks of their own across [`CompilerToRuntime::install_code`].
//! Addresses and handles crossing this interface are opaque to the client.

use std::sync::Arc;

use prism_ci_wire::{
    CompileId, DEFAULT_CHUNK_SIZE, EncodedStream, InstallFlags, PROTOCOL_VERSION,
    SpeculationRecord, UnitId,
};

use crate::error::{ExecuteError, InstallError, SpeculationError};
use crate::installed_code::InstalledCode;
use crate::outcome::InstallOutcome;
use crate::speculation::LogAddress;

/// Runtime side of the compiler interface.
///
/// There is one implementation per target runtime. It is constructed once
/// and passed explicitly, as a [`SharedRuntime`], to every component that
/// needs it.
pub trait CompilerToRuntime: Send + Sync {
    // =========================================================================
    // Negotiation
    // =========================================================================

    /// Optional sections the runtime wants in submitted streams.
    fn install_flags(&self) -> InstallFlags;

    /// Newest protocol version the runtime decodes.
    fn protocol_version(&self) -> u8 {
        PROTOCOL_VERSION
    }

    /// Chunk size the runtime prefers for stream payloads.
    fn stream_chunk_size(&self) -> usize {
        DEFAULT_CHUNK_SIZE
    }

    // =========================================================================
    // Installation
    // =========================================================================

    /// Allocate a process-unique, monotonically increasing compile id.
    fn allocate_compile_id(&self, unit: UnitId) -> CompileId;

    /// Submit an encoded artifact.
    ///
    /// `handle` must be empty. `speculation_log` is the unit's log address
    /// or [`LogAddress::NULL`]; `known_failures` is the snapshot the
    /// compiler consulted. Dependency assumptions travel inside the stream.
    fn install_code(
        &self,
        stream: EncodedStream,
        handle: &InstalledCode,
        speculation_log: LogAddress,
        known_failures: &[SpeculationRecord],
    ) -> Result<InstallOutcome, InstallError>;

    /// Ask the runtime to reclaim space held by non-entrant code. Returns
    /// the number of bytes freed.
    fn request_eviction(&self) -> usize {
        0
    }

    // =========================================================================
    // Speculation Log
    // =========================================================================

    /// Address of `unit`'s failed-speculation log, created on first use.
    fn failed_speculations_address(&self, unit: UnitId) -> LogAddress;

    /// Stored failures at `address` merged with `known`, deduplicated.
    fn failed_speculations(
        &self,
        address: LogAddress,
        known: &[SpeculationRecord],
    ) -> Result<Vec<SpeculationRecord>, SpeculationError>;

    /// Record a failed speculation. Returns whether it was new.
    fn add_failed_speculation(
        &self,
        address: LogAddress,
        record: &SpeculationRecord,
    ) -> Result<bool, SpeculationError>;

    /// Free the log at `address` when its unit is unloaded.
    fn release_failed_speculations(&self, address: LogAddress) -> Result<(), SpeculationError>;

    // =========================================================================
    // Installed Code
    // =========================================================================

    /// Refresh the handle's address and entry point from the code cache.
    /// Returns whether the handle is still valid.
    fn update_installed_code(&self, handle: &InstalledCode) -> bool;

    /// Make the code non-entrant and invalidate the handle. With
    /// `deoptimize`, live activations are deoptimized as well.
    fn invalidate_installed_code(&self, handle: &InstalledCode, deoptimize: bool);

    /// Run the installed code.
    fn execute_installed_code(
        &self,
        handle: &InstalledCode,
        args: &[i64],
    ) -> Result<i64, ExecuteError>;

    /// Copy of the installed code, or `None` once the handle is invalid.
    fn installed_code_bytes(&self, handle: &InstalledCode) -> Option<Vec<u8>>;
}

/// Shared, explicitly injected runtime boundary.
pub type SharedRuntime = Arc<dyn CompilerToRuntime>;
