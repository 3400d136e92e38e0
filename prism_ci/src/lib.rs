//! Compiler/runtime boundary for Prism.
//!
//! A compiler running as a client of the managed runtime installs code
//! through this crate. The runtime owns the code cache and the
//! failed-speculation logs; the compiler sees them only through the
//! [`CompilerToRuntime`] trait and the handles it hands out.
//!
//! # Architecture
//!
//! ```text
//!  ┌──────────── compiler ─────────────┐        ┌──────────── runtime ───────────────┐
//!  │ CompilationDriver                 │        │ HostRuntime                        │
//!  │   ArtifactProducer ─▶ artifact    │ stream │   decode ─▶ validate ─▶ CodeCache  │
//!  │   InstallChannel  ─▶ encode ──────┼───────▶│              │                     │
//!  │   SpeculationLog (proxy) ◀────────┼────────┼─ SpeculationTable (lock-free lists)│
//!  │   InstalledCode ◀─────────────────┼────────┼─ populate / invalidate             │
//!  └───────────────────────────────────┘        └────────────────────────────────────┘
//! ```
//!
//! # Outcomes
//!
//! Installation returns one of four [`InstallOutcome`]s, all recoverable by
//! the caller. Malformed streams and misuse of the boundary are reported as
//! [`InstallError`] and abort only the compilation that hit them.

#![warn(missing_docs)]

pub mod boundary;
pub mod channel;
pub mod config;
pub mod driver;
pub mod error;
pub mod host;
pub mod installed_code;
pub mod metadata;
pub mod outcome;
pub mod speculation;
pub mod stats;

pub use boundary::{CompilerToRuntime, SharedRuntime};
pub use channel::InstallChannel;
pub use config::{ClientConfig, RuntimeConfig};
pub use driver::{ArtifactProducer, CompilationDriver, CompileRequest, CompileSuccess, Tier};
pub use error::{ConfigError, DriverError, ExecuteError, InstallError, SpeculationError};
pub use host::{CodeExecutor, HostRuntime, Invocation};
pub use installed_code::{CodeLocation, CodeState, InstalledCode, InvalidationReason};
pub use metadata::{ClassHierarchy, LinkageError, MetadataQueries, Resolution};
pub use outcome::InstallOutcome;
pub use speculation::{FailedSpeculationList, LogAddress, SpeculationLog, SpeculationTable};
pub use stats::{InstallStats, InstallStatsSnapshot};

pub use prism_ci_wire as wire;
