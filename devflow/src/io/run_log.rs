//! Per-run artifacts under `.devflow/runs/<run-id>/`.
//!
//! Product output: always written, independent of `RUST_LOG`.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

const MAX_SUFFIX: u32 = 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunPaths {
    pub run_id: String,
    pub dir: PathBuf,
    pub prompt_path: PathBuf,
    pub reply_path: PathBuf,
    pub meta_path: PathBuf,
}

impl RunPaths {
    pub fn new(runs_dir: &Path, run_id: &str) -> Self {
        let dir = runs_dir.join(run_id);
        Self {
            run_id: run_id.to_string(),
            prompt_path: dir.join("prompt.md"),
            reply_path: dir.join("reply.md"),
            meta_path: dir.join("meta.json"),
            dir,
        }
    }

    pub fn write_prompt(&self, prompt: &str) -> Result<()> {
        write_text(&self.prompt_path, prompt)
    }

    pub fn write_reply(&self, reply: &str) -> Result<()> {
        write_text(&self.reply_path, reply)
    }

    pub fn write_meta<T: Serialize>(&self, meta: &T) -> Result<()> {
        let mut buf = serde_json::to_string_pretty(meta).context("serialize run meta")?;
        buf.push('\n');
        write_text(&self.meta_path, &buf)
    }
}

/// Reserve a fresh run directory named after `now` (`YYYYMMDD_HHMMSS`),
/// adding `_2`, `_3`, ... when that second is already taken.
pub fn allocate_run(runs_dir: &Path, now: DateTime<Utc>) -> Result<RunPaths> {
    fs::create_dir_all(runs_dir)
        .with_context(|| format!("create runs dir {}", runs_dir.display()))?;
    let base = now.format("%Y%m%d_%H%M%S").to_string();
    for n in 1..=MAX_SUFFIX {
        let run_id = if n == 1 {
            base.clone()
        } else {
            format!("{base}_{n}")
        };
        let paths = RunPaths::new(runs_dir, &run_id);
        match fs::create_dir(&paths.dir) {
            Ok(()) => {
                debug!(run_id = %run_id, "run directory allocated");
                return Ok(paths);
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => continue,
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("create run dir {}", paths.dir.display()));
            }
        }
    }
    Err(anyhow!("no free run id for {base} in {}", runs_dir.display()))
}

fn write_text(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}
