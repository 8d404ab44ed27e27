//! Well-known paths inside a devflow workspace.

use std::path::{Path, PathBuf};

use crate::io::config::CONFIG_FILE;

pub const STATE_DIR: &str = ".devflow";
pub const DEFAULT_TASK_FILE: &str = "task.md";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspacePaths {
    pub root: PathBuf,
    pub config_path: PathBuf,
    pub env_path: PathBuf,
    pub state_dir: PathBuf,
    /// Watch bookkeeping (`.devflow/state.json`).
    pub state_path: PathBuf,
    pub runs_dir: PathBuf,
    pub usage_dir: PathBuf,
    pub backups_dir: PathBuf,
    /// Per-project history files (`.devflow/projects/<id>.json`).
    pub history_dir: PathBuf,
}

impl WorkspacePaths {
    pub fn new(root: &Path) -> Self {
        let state_dir = root.join(STATE_DIR);
        Self {
            root: root.to_path_buf(),
            config_path: root.join(CONFIG_FILE),
            env_path: root.join(".env"),
            state_path: state_dir.join("state.json"),
            runs_dir: state_dir.join("runs"),
            usage_dir: state_dir.join("usage"),
            backups_dir: state_dir.join("backups"),
            history_dir: state_dir.join("projects"),
            state_dir,
        }
    }

    /// Task file path: explicit (relative to the workspace) or `task.md`.
    pub fn task_path(&self, explicit: Option<&Path>) -> PathBuf {
        match explicit {
            Some(path) if path.is_absolute() => path.to_path_buf(),
            Some(path) => self.root.join(path),
            None => self.root.join(DEFAULT_TASK_FILE),
        }
    }

    pub fn history_path(&self, project: &str) -> PathBuf {
        self.history_dir.join(format!("{project}.json"))
    }

    pub fn backup_dir(&self, run_id: &str, project: &str) -> PathBuf {
        self.backups_dir.join(run_id).join(project)
    }
}
