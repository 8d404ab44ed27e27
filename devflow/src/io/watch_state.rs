//! Watch bookkeeping stored in `.devflow/state.json`.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::io::atomic::write_atomic_str;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct WatchState {
    /// SHA-256 (hex) of the last task content that was processed.
    pub last_hash: Option<String>,
    pub last_run_id: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Load watch state; a missing file is an empty state.
pub fn load_watch_state(path: &Path) -> Result<WatchState> {
    if !path.exists() {
        return Ok(WatchState::default());
    }
    let contents =
        fs::read_to_string(path).with_context(|| format!("read watch state {}", path.display()))?;
    let state: WatchState = serde_json::from_str(&contents)
        .with_context(|| format!("parse watch state {}", path.display()))?;
    debug!(last_run_id = ?state.last_run_id, "watch state loaded");
    Ok(state)
}

pub fn write_watch_state(path: &Path, state: &WatchState) -> Result<()> {
    debug!(path = %path.display(), last_run_id = ?state.last_run_id, "writing watch state");
    let mut buf = serde_json::to_string_pretty(state)?;
    buf.push('\n');
    write_atomic_str(path, &buf)
}
