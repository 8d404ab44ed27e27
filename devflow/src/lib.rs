//! Task-file driven code changes through an LLM.
//!
//! One run reads a task file, gathers context from the target project, asks
//! the model for a reply in a fixed operation format, applies and verifies the
//! file operations, optionally commits them, and writes a markdown report.
//!
//! - **[`core`]**: Pure logic (task parsing, detection, reply parsing, commit
//!   planning). No I/O.
//! - **[`io`]**: Side effects (filesystem, git, HTTP, run artifacts).
//!
//! [`pipeline`] and [`watch`] wire the two together for the CLI.

pub mod core;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod pipeline;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod watch;
