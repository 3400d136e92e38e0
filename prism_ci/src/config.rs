//! Runtime and client configuration.
//!
//! Both structs are resolved once and read without synchronization
//! afterwards. Environment resolution goes through a lookup function so it
//! can be exercised without touching the process environment.

use std::time::Duration;

use prism_ci_wire::{DEFAULT_CHUNK_SIZE, HEADER_SIZE, InstallFlags};
use tracing::Level;

use crate::error::ConfigError;

/// Word size of the target, used to scale the per-unit ceiling.
const WORD_SIZE: usize = std::mem::size_of::<usize>();

// =============================================================================
// Runtime Configuration
// =============================================================================

/// Policy of the in-process code cache.
///
/// # Example
///
/// ```ignore
/// use prism_ci::RuntimeConfig;
///
/// let config = RuntimeConfig {
///     code_cache_capacity: 8 * 1024 * 1024,
///     ..Default::default()
/// };
/// config.validate()?;
/// ```
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    // =========================================================================
    // Code Cache
    // =========================================================================
    /// Total bytes of code the cache can hold, non-entrant code included.
    ///
    /// Default: 48MB
    pub code_cache_capacity: usize,

    /// Largest code body accepted for one unit. Larger artifacts are
    /// rejected with `CodeTooLarge` regardless of free space; smaller ones
    /// that do not fit get `CacheFull`.
    ///
    /// Default: 80K words (655360 bytes on 64-bit)
    pub max_unit_code_size: usize,

    /// Alignment of each code body in the cache. Power of two.
    ///
    /// Default: 64
    pub code_alignment: usize,

    // =========================================================================
    // Protocol
    // =========================================================================
    /// Optional stream sections requested from clients.
    ///
    /// Default: type info only
    pub install_flags: InstallFlags,

    /// Preferred stream payload chunk size.
    ///
    /// Default: 4KB
    pub chunk_size: usize,

    // =========================================================================
    // Diagnostics
    // =========================================================================
    /// Level at which installation events are reported.
    ///
    /// Default: DEBUG
    pub trace_level: Level,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            code_cache_capacity: 48 * 1024 * 1024,
            max_unit_code_size: 80 * 1024 * WORD_SIZE,
            code_alignment: 64,
            install_flags: InstallFlags::default(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            trace_level: Level::DEBUG,
        }
    }
}

impl RuntimeConfig {
    /// Small cache, every optional section, small chunks.
    pub fn for_testing() -> Self {
        Self {
            code_cache_capacity: 64 * 1024,
            max_unit_code_size: 16 * 1024,
            code_alignment: 16,
            install_flags: InstallFlags::all(),
            chunk_size: 256,
            trace_level: Level::TRACE,
        }
    }

    /// A cache that fills after a handful of installs.
    pub fn small_cache() -> Self {
        Self {
            code_cache_capacity: 4 * 1024,
            max_unit_code_size: 2 * 1024,
            code_alignment: 16,
            ..Self::default()
        }
    }

    /// Validate configuration consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.code_cache_capacity == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        if self.max_unit_code_size == 0 || self.max_unit_code_size > self.code_cache_capacity {
            return Err(ConfigError::InvalidUnitCeiling {
                max_unit: self.max_unit_code_size,
                capacity: self.code_cache_capacity,
            });
        }
        if !self.code_alignment.is_power_of_two() {
            return Err(ConfigError::InvalidAlignment(self.code_alignment));
        }
        if self.chunk_size < HEADER_SIZE {
            return Err(ConfigError::ChunkTooSmall {
                chunk: self.chunk_size,
                min: HEADER_SIZE,
            });
        }
        Ok(())
    }

    /// Resolve from `PRISM_CI_*` environment variables over the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Resolve from a variable lookup over the defaults.
    ///
    /// Recognized: `PRISM_CI_CODE_CACHE_CAPACITY`,
    /// `PRISM_CI_MAX_UNIT_CODE_SIZE`, `PRISM_CI_CODE_ALIGNMENT`,
    /// `PRISM_CI_INSTALL_FLAGS` (decimal or `0x` hex bitmask),
    /// `PRISM_CI_CHUNK_SIZE`, `PRISM_CI_TRACE_LEVEL`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(v) = env_usize(&lookup, "PRISM_CI_CODE_CACHE_CAPACITY")? {
            config.code_cache_capacity = v;
        }
        if let Some(v) = env_usize(&lookup, "PRISM_CI_MAX_UNIT_CODE_SIZE")? {
            config.max_unit_code_size = v;
        }
        if let Some(v) = env_usize(&lookup, "PRISM_CI_CODE_ALIGNMENT")? {
            config.code_alignment = v;
        }
        if let Some(v) = env_u32(&lookup, "PRISM_CI_INSTALL_FLAGS")? {
            config.install_flags = InstallFlags::from_bits_truncate(v);
        }
        if let Some(v) = env_usize(&lookup, "PRISM_CI_CHUNK_SIZE")? {
            config.chunk_size = v;
        }
        const TRACE_VAR: &str = "PRISM_CI_TRACE_LEVEL";
        if let Some(raw) = lookup(TRACE_VAR) {
            config.trace_level = raw.trim().parse().map_err(|_| ConfigError::InvalidEnv {
                var: TRACE_VAR,
                value: raw.clone(),
            })?;
        }
        config.validate()?;
        Ok(config)
    }
}

// =============================================================================
// Client Configuration
// =============================================================================

/// Compiler-side policy.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Forces type info on or off regardless of the negotiated flags.
    ///
    /// Default: None (follow the runtime)
    pub type_info_override: Option<bool>,

    /// Installs retried after `CacheFull` before giving up.
    ///
    /// Default: 3
    pub max_cache_full_retries: u32,

    /// Delay before the first `CacheFull` retry; doubles on each retry.
    ///
    /// Default: 1ms
    pub cache_full_backoff: Duration,

    /// Recompiles after `DependenciesFailed` before giving up.
    ///
    /// Default: 4
    pub max_recompiles: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            type_info_override: None,
            max_cache_full_retries: 3,
            cache_full_backoff: Duration::from_millis(1),
            max_recompiles: 4,
        }
    }
}

impl ClientConfig {
    /// No backoff delay, small retry bounds.
    pub fn for_testing() -> Self {
        Self {
            type_info_override: None,
            max_cache_full_retries: 2,
            cache_full_backoff: Duration::ZERO,
            max_recompiles: 2,
        }
    }

    /// Backoff before the `retry`-th retry (0-based).
    pub fn backoff_for(&self, retry: u32) -> Duration {
        self.cache_full_backoff
            .saturating_mul(1u32.checked_shl(retry.min(16)).unwrap_or(u32::MAX))
    }

    /// Resolve from `PRISM_CI_*` environment variables over the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Resolve from a variable lookup over the defaults.
    ///
    /// Recognized: `PRISM_CI_TYPE_INFO` (`0`/`1`/`true`/`false`/`on`/`off`),
    /// `PRISM_CI_CACHE_FULL_RETRIES`, `PRISM_CI_CACHE_FULL_BACKOFF_MS`,
    /// `PRISM_CI_MAX_RECOMPILES`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        const TYPE_INFO_VAR: &str = "PRISM_CI_TYPE_INFO";
        if let Some(raw) = lookup(TYPE_INFO_VAR) {
            config.type_info_override = Some(match raw.trim() {
                "1" | "true" | "on" => true,
                "0" | "false" | "off" => false,
                _ => {
                    return Err(ConfigError::InvalidEnv {
                        var: TYPE_INFO_VAR,
                        value: raw,
                    });
                }
            });
        }
        if let Some(v) = env_u32(&lookup, "PRISM_CI_CACHE_FULL_RETRIES")? {
            config.max_cache_full_retries = v;
        }
        if let Some(v) = env_u32(&lookup, "PRISM_CI_CACHE_FULL_BACKOFF_MS")? {
            config.cache_full_backoff = Duration::from_millis(u64::from(v));
        }
        if let Some(v) = env_u32(&lookup, "PRISM_CI_MAX_RECOMPILES")? {
            config.max_recompiles = v;
        }
        Ok(config)
    }
}

// =============================================================================
// Environment Helpers
// =============================================================================

fn parse_number(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => raw.parse().ok(),
    }
}

fn env_usize(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<usize>, ConfigError> {
    match lookup(var) {
        None => Ok(None),
        Some(raw) => parse_number(&raw)
            .and_then(|v| usize::try_from(v).ok())
            .map(Some)
            .ok_or(ConfigError::InvalidEnv { var, value: raw }),
    }
}

fn env_u32(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<u32>, ConfigError> {
    match lookup(var) {
        None => Ok(None),
        Some(raw) => parse_number(&raw)
            .and_then(|v| u32::try_from(v).ok())
            .map(Some)
            .ok_or(ConfigError::InvalidEnv { var, value: raw }),
    }
}

// =============================================================================
// Tests
// =============================================================================
