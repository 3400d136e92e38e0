//! Installation outcomes.

use std::fmt;

/// Result of submitting an artifact to the runtime.
///
/// None of these is an error: every outcome is recoverable at the call site.
/// The discriminants are the stable codes callers branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum InstallOutcome {
    /// Code committed; the handle is populated.
    Installed = 0,
    /// The cache had no room. Retry later or after eviction.
    CacheFull = 1,
    /// The code exceeds the per-unit ceiling. Only a smaller artifact helps.
    CodeTooLarge = 2,
    /// An optimistic assumption no longer holds. Recompile.
    DependenciesFailed = 3,
}

impl InstallOutcome {
    /// Every outcome, in code order.
    pub const ALL: [InstallOutcome; 4] = [
        InstallOutcome::Installed,
        InstallOutcome::CacheFull,
        InstallOutcome::CodeTooLarge,
        InstallOutcome::DependenciesFailed,
    ];

    /// Stable integer code.
    #[inline]
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// Decode a stable integer code.
    #[inline]
    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(InstallOutcome::Installed),
            1 => Some(InstallOutcome::CacheFull),
            2 => Some(InstallOutcome::CodeTooLarge),
            3 => Some(InstallOutcome::DependenciesFailed),
            _ => None,
        }
    }

    /// Whether the code was installed.
    #[inline]
    pub const fn is_installed(self) -> bool {
        matches!(self, InstallOutcome::Installed)
    }

    /// Whether resubmitting the same artifact later may succeed.
    #[inline]
    pub const fn is_retryable(self) -> bool {
        matches!(self, InstallOutcome::CacheFull)
    }

    /// Whether the artifact must be discarded and the unit recompiled.
    #[inline]
    pub const fn requires_recompile(self) -> bool {
        matches!(
            self,
            InstallOutcome::CodeTooLarge | InstallOutcome::DependenciesFailed
        )
    }

    /// Short lower-case name used in logs.
    pub const fn name(self) -> &'static str {
        match self {
            InstallOutcome::Installed => "installed",
            InstallOutcome::CacheFull => "cache_full",
            InstallOutcome::CodeTooLarge => "code_too_large",
            InstallOutcome::DependenciesFailed => "dependencies_failed",
        }
    }
}

impl fmt::Display for InstallOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(InstallOutcome::Installed.code(), 0);
        assert_eq!(InstallOutcome::CacheFull.code(), 1);
        assert_eq!(InstallOutcome::CodeTooLarge.code(), 2);
        assert_eq!(InstallOutcome::DependenciesFailed.code(), 3);
        for outcome in InstallOutcome::ALL {
            assert_eq!(InstallOutcome::from_code(outcome.code()), Some(outcome));
        }
        assert_eq!(InstallOutcome::from_code(4), None);
    }

    #[test]
    fn test_classification() {
        assert!(InstallOutcome::CacheFull.is_retryable());
        assert!(!InstallOutcome::CacheFull.requires_recompile());
        assert!(InstallOutcome::CodeTooLarge.requires_recompile());
        assert!(InstallOutcome::DependenciesFailed.requires_recompile());
        assert!(!InstallOutcome::Installed.is_retryable());
        assert!(!InstallOutcome::Installed.requires_recompile());
    }
}
