//! Speculation-failure log.
//!
//! # Architecture
//!
//! ```text
//!  compiler thread                          runtime
//!  ┌──────────────────┐   LogAddress   ┌──────────────────────────────────┐
//!  │ SpeculationLog   │ ─────────────▶ │ SpeculationTable                 │
//!  │  (per unit,      │                │  unit ──▶ address ──▶ list       │
//!  │   cached view)   │ ◀───────────── │  FailedSpeculationList (lock-free│
//!  └──────────────────┘   snapshots    │   append-only, content-deduped)  │
//!                                      └──────────────────────────────────┘
//! ```
//!
//! Addresses are opaque, allocated monotonically and never reused; the null
//! address means "no log yet".

mod list;
mod log;
mod table;

use std::fmt;

pub use list::{FailedSpeculationList, Records};
pub use log::SpeculationLog;
pub use table::SpeculationTable;

/// Stable, opaque handle to one unit's failed-speculation list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct LogAddress(u64);

impl LogAddress {
    /// The null address: the unit has no log yet.
    pub const NULL: LogAddress = LogAddress(0);

    /// Create from the raw value.
    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        LogAddress(raw)
    }

    /// Get the raw value.
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Whether this is the null address.
    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for LogAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}
