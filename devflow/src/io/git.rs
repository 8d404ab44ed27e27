//! Git adapter for reading project status and committing run results.
//!
//! Every call is an argument vector passed straight to `git`; nothing goes
//! through a shell. Commands run with a timeout and with terminal prompts
//! disabled so a push against a remote that wants credentials fails fast.
//! Pathspecs are literal: a reply path like `a*.txt` names exactly that file.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::core::commit::CommitPlan;
use crate::core::types::CommitRecord;
use crate::error::PipelineError;
use crate::io::process::{CommandOutput, run_with_timeout};

const OUTPUT_LIMIT_BYTES: usize = 256 * 1024;

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    /// Path for the changed file.
    pub path: String,
}

/// Wrapper for executing git commands in a project directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
    timeout: Duration,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            workdir: workdir.into(),
            timeout,
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// True when the project directory sits inside a git work tree, either
    /// as its root or as a subdirectory of a larger repository.
    pub fn is_repo(&self) -> bool {
        match self.run(&["rev-parse", "--is-inside-work-tree"]) {
            Ok(output) => {
                !output.timed_out
                    && output.status.success()
                    && output.stdout_text().trim() == "true"
            }
            Err(err) => {
                debug!(error = %err, "git rev-parse failed");
                false
            }
        }
    }

    /// Current branch name, `None` on a detached HEAD.
    pub fn current_branch(&self) -> Result<Option<String>> {
        let out = self.run_capture(&["branch", "--show-current"])?;
        let name = out.trim().to_string();
        Ok((!name.is_empty()).then_some(name))
    }

    pub fn head_short_sha(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "--short", "HEAD"])?;
        Ok(out.trim().to_string())
    }

    /// Get status entries (including untracked) in porcelain format.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-uall", "--", "."])?;
        let mut entries = Vec::new();
        for line in out.lines() {
            if line.trim().is_empty() {
                continue;
            }
            entries.push(parse_status_line(line)?);
        }
        Ok(entries)
    }

    /// True if any of the plan's paths has a staged change.
    pub fn has_staged_changes(&self, plan: &CommitPlan) -> Result<bool> {
        let output = self.run_checked_owned(&plan.staged_check_args())?;
        Ok(!output.stdout_text().trim().is_empty())
    }

    /// Stage, commit and optionally push according to `plan`.
    ///
    /// Nothing staged after `git add` is reported as an error; the caller
    /// records it and moves on.
    #[instrument(skip_all, fields(files = plan.files.len(), push = plan.push))]
    pub fn apply_plan(&self, plan: &CommitPlan) -> Result<CommitRecord, PipelineError> {
        if !self.is_repo() {
            return Err(PipelineError::GitCommand(format!(
                "{} is not a git repository",
                self.workdir.display()
            )));
        }
        for line in plan.command_lines() {
            debug!(command = %line, "git plan");
        }
        self.run_checked_owned(&plan.add_args())
            .map_err(git_error)?;
        if !self.has_staged_changes(plan).map_err(git_error)? {
            warn!("nothing staged after add");
            return Err(PipelineError::GitCommand("nothing to commit".to_string()));
        }
        self.run_checked_owned(&plan.commit_args())
            .map_err(git_error)?;
        let sha = self.head_short_sha().ok();
        info!(sha = ?sha, "committed");

        let mut record = CommitRecord {
            message: plan.message.clone(),
            files: plan.files.clone(),
            sha,
            pushed: false,
        };
        if let Some(push) = plan.push_args() {
            self.run_checked_owned(&push).map_err(git_error)?;
            info!(remote = %plan.remote, "pushed");
            record.pushed = true;
        }
        Ok(record)
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(output.stdout_text())
    }

    fn run_checked_owned(&self, args: &[String]) -> Result<CommandOutput> {
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run_checked(&args)
    }

    fn run_checked(&self, args: &[&str]) -> Result<CommandOutput> {
        let output = self.run(args)?;
        if output.timed_out {
            return Err(anyhow!(
                "git {} timed out after {}s",
                args.join(" "),
                self.timeout.as_secs()
            ));
        }
        if !output.status.success() {
            let stderr = output.stderr_text();
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<CommandOutput> {
        let mut cmd = Command::new("git");
        cmd.args(args)
            .current_dir(&self.workdir)
            .env("GIT_TERMINAL_PROMPT", "0")
            .env("GIT_LITERAL_PATHSPECS", "1");
        run_with_timeout(cmd, self.timeout, OUTPUT_LIMIT_BYTES)
    }
}

fn git_error(err: anyhow::Error) -> PipelineError {
    PipelineError::GitCommand(format!("{err:#}"))
}

fn parse_status_line(line: &str) -> Result<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: unquote(path.trim()),
        });
    }
    if line.len() < 4 || !line.is_char_boundary(2) || !line.is_char_boundary(3) {
        return Err(anyhow!("unexpected porcelain line: '{line}'"));
    }
    let code = line[..2].to_string();
    let mut path = line[3..].trim().to_string();
    if let Some((_, new)) = path.split_once(" -> ") {
        path = new.trim().to_string();
    }
    Ok(StatusEntry {
        code,
        path: unquote(&path),
    })
}

/// Porcelain quotes paths with unusual characters.
fn unquote(path: &str) -> String {
    path.strip_prefix('"')
        .and_then(|p| p.strip_suffix('"'))
        .unwrap_or(path)
        .to_string()
}
