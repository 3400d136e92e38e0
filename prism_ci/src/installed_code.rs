//! Client-side proxy for one piece of installed code.
//!
//! # State Machine
//!
//! ```text
//!   Empty ──install──▶ Installed ──invalidate──▶ Invalidated
//!     │                   │  ▲
//!     │                   └──┘ update (relocation)
//!     └──────────── stale install ────────────▶ Invalidated
//! ```
//!
//! A handle is shared between the client, which owns the proxy, and the
//! runtime, which owns the code memory. Only the runtime side of the boundary
//! mutates it; the mutators are crate-private. The state is one atomic byte
//! stored with release ordering after the location is written, so a reader
//! that observes `Installed` also observes the location it was installed at.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use parking_lot::RwLock;
use prism_ci_wire::{CompileId, UnitId};

// =============================================================================
// State
// =============================================================================

/// Lifecycle state of an [`InstalledCode`] handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CodeState {
    /// Created by the client; carries no address.
    Empty = 0,
    /// Populated by a successful installation; executable.
    Installed = 1,
    /// Revoked. Terminal.
    Invalidated = 2,
}

impl CodeState {
    #[inline]
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => CodeState::Empty,
            1 => CodeState::Installed,
            _ => CodeState::Invalidated,
        }
    }
}

/// Why installed code was revoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvalidationReason {
    /// A newer compilation of the same unit was installed.
    Superseded,
    /// Explicit request without deoptimizing activations.
    Explicit,
    /// Explicit request; live activations were deoptimized.
    Deoptimized,
    /// The code was evicted from the cache.
    Evicted,
    /// The unit was unloaded.
    Unloaded,
}

impl InvalidationReason {
    /// Whether live activations are deoptimized as part of the revocation.
    #[inline]
    pub fn deoptimizes(self) -> bool {
        self == InvalidationReason::Deoptimized
    }
}

/// Where installed code lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeLocation {
    /// Unit the code was compiled for.
    pub unit: UnitId,
    /// Compilation that produced the code.
    pub compile_id: CompileId,
    /// Start of the code in the cache.
    pub address: u64,
    /// Address execution starts at.
    pub entry_point: u64,
    /// Installed size in bytes.
    pub size: usize,
}

// =============================================================================
// Handle
// =============================================================================

#[derive(Debug)]
struct HandleInner {
    name: String,
    state: AtomicU8,
    /// Set while a submission owns the handle.
    claimed: AtomicBool,
    location: RwLock<Option<CodeLocation>>,
    reason: RwLock<Option<InvalidationReason>>,
}

/// Handle to installed code.
///
/// Clones share the same underlying handle.
#[derive(Clone)]
pub struct InstalledCode {
    inner: Arc<HandleInner>,
}

impl InstalledCode {
    /// Create an empty handle.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                name: name.into(),
                state: AtomicU8::new(CodeState::Empty as u8),
                claimed: AtomicBool::new(false),
                location: RwLock::new(None),
                reason: RwLock::new(None),
            }),
        }
    }

    /// Display name.
    #[inline]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Current state.
    #[inline]
    pub fn state(&self) -> CodeState {
        CodeState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    /// Whether execution requests against the handle succeed.
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.state() == CodeState::Installed
    }

    /// Location, once the handle has been populated. Kept after
    /// invalidation for diagnostics.
    pub fn location(&self) -> Option<CodeLocation> {
        *self.inner.location.read()
    }

    /// Compilation that produced the code.
    pub fn compile_id(&self) -> Option<CompileId> {
        self.location().map(|loc| loc.compile_id)
    }

    /// Start address, or 0 if never installed.
    pub fn address(&self) -> u64 {
        self.location().map_or(0, |loc| loc.address)
    }

    /// Entry point, or 0 if never installed.
    pub fn entry_point(&self) -> u64 {
        self.location().map_or(0, |loc| loc.entry_point)
    }

    /// Why the handle was invalidated.
    pub fn invalidation_reason(&self) -> Option<InvalidationReason> {
        *self.inner.reason.read()
    }

    /// Whether two handles are the same handle.
    #[inline]
    pub fn ptr_eq(&self, other: &InstalledCode) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    // =========================================================================
    // Runtime-side transitions
    // =========================================================================

    /// Take exclusive ownership for one submission.
    pub(crate) fn claim(&self) -> Result<(), CodeState> {
        let state = self.state();
        if state != CodeState::Empty {
            return Err(state);
        }
        if self.inner.claimed.swap(true, Ordering::AcqRel) {
            return Err(CodeState::Empty);
        }
        Ok(())
    }

    /// Give the handle back after a submission that did not install.
    pub(crate) fn unclaim(&self) {
        if self.state() == CodeState::Empty {
            self.inner.claimed.store(false, Ordering::Release);
        }
    }

    /// `Empty -> Installed`.
    pub(crate) fn populate(&self, location: CodeLocation) {
        *self.inner.location.write() = Some(location);
        self.inner
            .state
            .store(CodeState::Installed as u8, Ordering::Release);
    }

    /// `Empty -> Invalidated` in one step, for code committed non-entrant.
    pub(crate) fn populate_invalidated(&self, location: CodeLocation, reason: InvalidationReason) {
        *self.inner.location.write() = Some(location);
        *self.inner.reason.write() = Some(reason);
        self.inner
            .state
            .store(CodeState::Invalidated as u8, Ordering::Release);
    }

    /// Refresh the location after a relocation. Only valid handles move.
    pub(crate) fn relocate(&self, address: u64, entry_point: u64) -> bool {
        let mut location = self.inner.location.write();
        if self.state() != CodeState::Installed {
            return false;
        }
        match location.as_mut() {
            Some(loc) => {
                loc.address = address;
                loc.entry_point = entry_point;
                true
            }
            None => false,
        }
    }

    /// `Installed -> Invalidated`. Returns whether this call made the
    /// transition.
    pub(crate) fn invalidate(&self, reason: InvalidationReason) -> bool {
        // Held so the reason is visible before the state flips.
        let mut slot = self.inner.reason.write();
        let flipped = self
            .inner
            .state
            .compare_exchange(
                CodeState::Installed as u8,
                CodeState::Invalidated as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if flipped {
            *slot = Some(reason);
        }
        flipped
    }
}

impl fmt::Debug for InstalledCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstalledCode")
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .field("location", &self.location())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
