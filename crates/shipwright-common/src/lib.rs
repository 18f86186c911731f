//! Shared domain types for the Shipwright release coordinator.
//!
//! Everything that crosses a component boundary lives here: the branch and
//! task models the HTTP layer serializes, the command envelope the worker
//! dispatches on, and the [`ProcessRunner`] seam every shell-script step goes
//! through.

pub mod process;
pub mod types;

pub use process::{ProcessError, ProcessRunner, ShellRunner};
pub use types::*;
