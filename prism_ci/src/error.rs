//! Error types for the compiler/runtime boundary.
//!
//! Install outcomes are not errors (see [`InstallOutcome`](crate::InstallOutcome)).
//! Everything here is either protocol-fatal or a misuse of a handle or
//! address, and is never retried.

use prism_ci_wire::{CompileId, DecodeError, EncodeError, UnitId};
use thiserror::Error;

use crate::installed_code::CodeState;
use crate::speculation::LogAddress;

// =============================================================================
// Speculation Log
// =============================================================================

/// Failure to access a speculation log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SpeculationError {
    /// The address was never handed out or has been released.
    #[error("speculation log address {0} is stale")]
    StaleAddress(LogAddress),

    /// The null address was used where a log is required.
    #[error("null speculation log address")]
    NullAddress,
}

// =============================================================================
// Install
// =============================================================================

/// Protocol-fatal installation failure.
///
/// Indicates a defect in the encoder or in the client's use of the boundary,
/// never a race with runtime state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InstallError {
    /// The stream could not be decoded.
    #[error("malformed stream: {0}")]
    MalformedStream(#[from] DecodeError),

    /// The artifact could not be expressed in the negotiated protocol.
    #[error("artifact not encodable: {0}")]
    Unencodable(#[from] EncodeError),

    /// The handle was not empty when submitted.
    #[error("installed-code handle reused (state {0:?})")]
    HandleReused(CodeState),

    /// The speculation-log address in the submission is not live.
    #[error(transparent)]
    Speculation(#[from] SpeculationError),
}

impl InstallError {
    /// Every install error is protocol-fatal.
    #[inline]
    pub const fn is_fatal(&self) -> bool {
        true
    }

    /// Whether the failure points at the encoder rather than at how the
    /// client used the boundary.
    #[inline]
    pub const fn is_encoder_defect(&self) -> bool {
        matches!(
            self,
            InstallError::MalformedStream(_) | InstallError::Unencodable(_)
        )
    }
}

// =============================================================================
// Execute
// =============================================================================

/// Failure to execute installed code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecuteError {
    /// The handle is empty or has been invalidated.
    #[error("invalid installed code{}", .0.map(|id| format!(" ({id})")).unwrap_or_default())]
    InvalidInstalledCode(Option<CompileId>),

    /// The executed code raised.
    #[error("exception in installed code: {0}")]
    Exception(String),
}

impl ExecuteError {
    /// Whether this is the invalid-code signal rather than an exception.
    #[inline]
    pub const fn is_invalid_code(&self) -> bool {
        matches!(self, ExecuteError::InvalidInstalledCode(_))
    }
}

// =============================================================================
// Config
// =============================================================================

/// Configuration validation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Code cache capacity is zero.
    #[error("code cache capacity must be non-zero")]
    ZeroCapacity,

    /// Per-unit ceiling is zero or larger than the whole cache.
    #[error("max unit code size {max_unit} must be in 1..={capacity}")]
    InvalidUnitCeiling {
        /// Configured ceiling.
        max_unit: usize,
        /// Configured capacity.
        capacity: usize,
    },

    /// Alignment is not a power of two.
    #[error("code alignment {0} must be a power of two")]
    InvalidAlignment(usize),

    /// Chunk size cannot hold the stream header.
    #[error("chunk size {chunk} must be at least {min}")]
    ChunkTooSmall {
        /// Configured chunk size.
        chunk: usize,
        /// Smallest allowed size.
        min: usize,
    },

    /// An environment variable had an unparsable value.
    #[error("invalid value {value:?} for {var}")]
    InvalidEnv {
        /// Variable name.
        var: &'static str,
        /// Raw value.
        value: String,
    },
}

// =============================================================================
// Driver
// =============================================================================

/// Why a compilation driven by [`CompilationDriver`](crate::CompilationDriver)
/// produced no installed code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DriverError {
    /// Protocol-fatal failure; aborts this compilation only.
    #[error("internal error compiling {unit}: {source}")]
    Internal {
        /// Unit being compiled.
        unit: UnitId,
        /// Underlying failure.
        source: InstallError,
    },

    /// The code cache stayed full after every retry.
    #[error("code cache full for {unit} after {attempts} attempts")]
    CacheFull {
        /// Unit being compiled.
        unit: UnitId,
        /// Install attempts made.
        attempts: u32,
    },

    /// No tier produced code under the per-unit ceiling.
    #[error("code for {unit} too large at every tier")]
    CodeTooLarge {
        /// Unit being compiled.
        unit: UnitId,
    },

    /// Dependencies kept failing.
    #[error("{unit} still failing dependencies after {recompiles} recompiles")]
    RecompileLimit {
        /// Unit being compiled.
        unit: UnitId,
        /// Recompiles attempted.
        recompiles: u32,
    },

    /// The unit's speculation log could not be read.
    #[error("speculation log for {unit}: {source}")]
    Speculation {
        /// Unit being compiled.
        unit: UnitId,
        /// Underlying failure.
        source: SpeculationError,
    },
}

impl DriverError {
    /// Unit the failure is about.
    pub fn unit(&self) -> UnitId {
        match self {
            DriverError::Internal { unit, .. }
            | DriverError::CacheFull { unit, .. }
            | DriverError::CodeTooLarge { unit }
            | DriverError::RecompileLimit { unit, .. }
            | DriverError::Speculation { unit, .. } => *unit,
        }
    }

    /// Whether this is an internal error rather than a policy give-up.
    #[inline]
    pub fn is_internal(&self) -> bool {
        matches!(self, DriverError::Internal { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_install_error_classification() {
        let decode: InstallError = DecodeError::BadMagic.into();
        assert!(decode.is_fatal());
        assert!(decode.is_encoder_defect());

        let reused = InstallError::HandleReused(CodeState::Installed);
        assert!(reused.is_fatal());
        assert!(!reused.is_encoder_defect());
    }

    #[test]
    fn test_invalid_code_message() {
        let err = ExecuteError::InvalidInstalledCode(Some(CompileId(4)));
        assert_eq!(err.to_string(), "invalid installed code (compile#4)");
        assert_eq!(
            ExecuteError::InvalidInstalledCode(None).to_string(),
            "invalid installed code"
        );
        assert!(err.is_invalid_code());
        assert!(!ExecuteError::Exception("boom".into()).is_invalid_code());
    }

    #[test]
    fn test_driver_error_names_unit() {
        let err = DriverError::Internal {
            unit: UnitId(7),
            source: DecodeError::BadMagic.into(),
        };
        assert_eq!(err.unit(), UnitId(7));
        assert!(err.to_string().contains("unit#7"));
        assert!(err.is_internal());
    }
}
