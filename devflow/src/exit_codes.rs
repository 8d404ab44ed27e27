//! Stable exit codes for devflow CLI commands.

/// Command succeeded; for `run`, the pipeline completed and the report is written.
pub const OK: i32 = 0;
/// Invalid input, config or workspace, or an unexpected error.
pub const INVALID: i32 = 1;
/// The run halted on a pipeline error; the report names it.
pub const HALTED: i32 = 2;
