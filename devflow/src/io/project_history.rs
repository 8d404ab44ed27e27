//! Per-project list of recent devflow changes, kept in
//! `.devflow/projects/<id>.json` and fed back into the next prompt.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::io::atomic::write_atomic_str;

/// Changes kept per project, newest first.
pub const MAX_RECENT_CHANGES: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecentChange {
    pub run_id: String,
    pub timestamp: DateTime<Utc>,
    /// First line of the task description.
    pub summary: String,
    pub files: Vec<String>,
    /// Short sha when the run committed.
    #[serde(default)]
    pub commit: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectHistory {
    #[serde(default)]
    pub recent_changes: Vec<RecentChange>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl ProjectHistory {
    pub fn push(&mut self, change: RecentChange) {
        self.updated_at = Some(change.timestamp);
        self.recent_changes.insert(0, change);
        self.recent_changes.truncate(MAX_RECENT_CHANGES);
    }

    pub fn last_change(&self) -> Option<&RecentChange> {
        self.recent_changes.first()
    }
}

/// Load a project's history; a missing file is an empty history.
pub fn load_history(path: &Path) -> Result<ProjectHistory> {
    if !path.exists() {
        return Ok(ProjectHistory::default());
    }
    let contents = fs::read_to_string(path)
        .with_context(|| format!("read project history {}", path.display()))?;
    serde_json::from_str(&contents)
        .with_context(|| format!("parse project history {}", path.display()))
}

/// Prepend `change` and rewrite the file.
pub fn record_change(path: &Path, change: RecentChange) -> Result<ProjectHistory> {
    let mut history = load_history(path)?;
    debug!(path = %path.display(), run_id = %change.run_id, "recording project change");
    history.push(change);
    let mut buf = serde_json::to_string_pretty(&history)?;
    buf.push('\n');
    write_atomic_str(path, &buf)?;
    Ok(history)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn change(n: usize) -> RecentChange {
        RecentChange {
            run_id: format!("run-{n}"),
            timestamp: Utc::now(),
            summary: format!("change {n}"),
            files: vec![format!("src/f{n}.py")],
            commit: None,
        }
    }

    #[test]
    fn missing_history_is_empty() {
        let temp = tempfile::tempdir().expect("tempdir");
        let history = load_history(&temp.path().join("demo.json")).expect("load");
        assert_eq!(history, ProjectHistory::default());
        assert!(history.last_change().is_none());
    }

    /// Verifies the list is newest first and capped.
    #[test]
    fn keeps_only_the_newest_changes() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join(".devflow/projects/demo.json");
        for n in 0..MAX_RECENT_CHANGES + 3 {
            record_change(&path, change(n)).expect("record");
        }
        let history = load_history(&path).expect("load");
        assert_eq!(history.recent_changes.len(), MAX_RECENT_CHANGES);
        assert_eq!(
            history.last_change().map(|c| c.run_id.as_str()),
            Some("run-12")
        );
        assert_eq!(
            history.recent_changes.last().map(|c| c.run_id.as_str()),
            Some("run-3")
        );
    }

    #[test]
    fn corrupt_history_is_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("demo.json");
        fs::write(&path, "{ not json").expect("write");
        assert!(load_history(&path).is_err());
    }
}
