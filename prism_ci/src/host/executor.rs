//! Execution of installed code.
//!
//! The in-process runtime does not run machine code itself; it hands the
//! installed bytes to a [`CodeExecutor`]. Closures implement the trait, so
//! tests can plug in an interpreter or a stub.

use prism_ci_wire::{CompileId, UnitId};

/// One call into installed code.
#[derive(Debug, Clone, Copy)]
pub struct Invocation<'a> {
    /// Unit the code belongs to.
    pub unit: UnitId,
    /// Compilation that produced the code.
    pub compile_id: CompileId,
    /// Entry point.
    pub entry_point: u64,
    /// Installed bytes.
    pub code: &'a [u8],
    /// Call arguments.
    pub args: &'a [i64],
}

/// Runs installed code. An `Err` is an exception raised by the code.
pub trait CodeExecutor: Send + Sync {
    /// Execute one invocation.
    fn execute(&self, invocation: &Invocation<'_>) -> Result<i64, String>;
}

impl<F> CodeExecutor for F
where
    F: Fn(&Invocation<'_>) -> Result<i64, String> + Send + Sync,
{
    #[inline]
    fn execute(&self, invocation: &Invocation<'_>) -> Result<i64, String> {
        self(invocation)
    }
}

/// Executor used when none is configured: every call raises.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoExecutor;

impl CodeExecutor for NoExecutor {
    fn execute(&self, invocation: &Invocation<'_>) -> Result<i64, String> {
        Err(format!(
            "no executor configured for {} ({})",
            invocation.unit, invocation.compile_id
        ))
    }
}
