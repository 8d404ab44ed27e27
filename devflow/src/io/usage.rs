//! Append-only API usage ledger (`.devflow/usage/`).
//!
//! One JSON line per successful call in a per-day file, one line per failed
//! call in a shared error file.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

const ERRORS_FILE: &str = "api_errors.jsonl";
pub const PREVIEW_CHARS: usize = 200;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageEntry {
    pub timestamp: DateTime<Utc>,
    pub run_id: String,
    pub project: String,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
    pub duration_ms: u64,
    pub prompt_preview: String,
    pub response_preview: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEntry {
    pub timestamp: DateTime<Utc>,
    pub run_id: String,
    pub project: String,
    pub model: String,
    pub error: String,
}

/// Totals for one UTC day.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DailyUsage {
    pub calls: usize,
    pub errors: usize,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
}

#[derive(Debug, Clone)]
pub struct UsageLedger {
    dir: PathBuf,
}

impl UsageLedger {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn daily_path(&self, date: NaiveDate) -> PathBuf {
        self.dir
            .join(format!("api_usage_{}.jsonl", date.format("%Y%m%d")))
    }

    pub fn errors_path(&self) -> PathBuf {
        self.dir.join(ERRORS_FILE)
    }

    pub fn record(&self, entry: &UsageEntry) -> Result<()> {
        let path = self.daily_path(entry.timestamp.date_naive());
        append_json_line(&path, entry)?;
        debug!(path = %path.display(), "usage recorded");
        Ok(())
    }

    pub fn record_error(&self, entry: &ErrorEntry) -> Result<()> {
        append_json_line(&self.errors_path(), entry)
    }

    /// Sum one day's calls. A missing ledger file means zero usage.
    pub fn daily_summary(&self, date: NaiveDate) -> Result<DailyUsage> {
        let mut summary = DailyUsage::default();
        for entry in read_json_lines::<UsageEntry>(&self.daily_path(date))? {
            summary.calls += 1;
            summary.input_tokens += entry.input_tokens;
            summary.output_tokens += entry.output_tokens;
            summary.cost_usd += entry.cost_usd;
        }
        summary.errors = read_json_lines::<ErrorEntry>(&self.errors_path())?
            .iter()
            .filter(|entry| entry.timestamp.date_naive() == date)
            .count();
        Ok(summary)
    }
}

fn append_json_line<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let mut line = serde_json::to_string(value).context("serialize ledger entry")?;
    line.push('\n');
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open {}", path.display()))?;
    file.write_all(line.as_bytes())
        .with_context(|| format!("append {}", path.display()))
}

fn read_json_lines<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Vec<T>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let contents =
        fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let mut entries = Vec::new();
    for (idx, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(line) {
            Ok(entry) => entries.push(entry),
            Err(err) => warn!(path = %path.display(), line = idx + 1, error = %err, "skipping bad ledger line"),
        }
    }
    Ok(entries)
}
