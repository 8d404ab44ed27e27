//! Side-effecting stages and workspace storage.

pub mod atomic;
pub mod config;
pub mod context;
pub mod fileops;
pub mod git;
pub mod init;
pub mod llm;
pub mod process;
pub mod project_history;
pub mod prompt;
pub mod registry;
pub mod report;
pub mod run_log;
pub mod task_file;
pub mod usage;
pub mod watch_state;
pub mod workspace;
