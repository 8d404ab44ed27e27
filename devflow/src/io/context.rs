//! Smart context assembly from a project's on-disk artifacts.
//!
//! Every source is optional. A missing or unreadable source is recorded as a
//! soft `ContextUnavailable` omission and the bundle is built without it.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, instrument, warn};
use walkdir::{DirEntry, WalkDir};

use crate::core::detector::{Detection, detect};
use crate::core::path::display_relative;
use crate::core::task::Task;
use crate::core::text::{preview, truncate_chars};
use crate::core::types::OperationKind;
use crate::error::PipelineError;
use crate::io::config::ContextConfig;
use crate::io::fileops::resolve_in_root;
use crate::io::git::Git;
use crate::io::project_history::{RecentChange, load_history};

const SESSIONS_DIR: &str = "docs/sessions";
const TODO_EXTENSIONS: &[&str] = &["py", "js", "ts", "java", "cpp", "c", "h", "rs", "go"];
const SKIP_DIRS: &[&str] = &[
    "node_modules",
    "venv",
    ".venv",
    "__pycache__",
    ".git",
    "dist",
    "build",
    "target",
];
const TODO_TEXT_CHARS: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Excerpt {
    /// File the text came from, relative to the project root.
    pub source: String,
    pub text: String,
    pub truncated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GitSnapshot {
    pub branch: Option<String>,
    /// At most `max_changed_files` entries, formatted `XY path`.
    pub changed_files: Vec<String>,
    pub total_changed: usize,
    pub dirty: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TodoItem {
    pub file: String,
    pub line: usize,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileSnapshot {
    pub path: String,
    /// Full content; `None` when the file was too large or unreadable.
    pub content: Option<String>,
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TargetContext {
    pub path: String,
    pub detection: Detection,
    /// What the task asks for this file, when it says.
    pub request: Option<String>,
    /// Current content for MODIFY targets.
    pub current: Option<FileSnapshot>,
    pub companions: Vec<FileSnapshot>,
}

/// Everything gathered for one run. Built once, never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextBundle {
    pub project: String,
    pub project_root: PathBuf,
    pub session: Option<Excerpt>,
    pub readme: Option<Excerpt>,
    pub git: Option<GitSnapshot>,
    pub todos: Vec<TodoItem>,
    pub targets: Vec<TargetContext>,
    /// Earlier devflow runs on this project, newest first.
    pub recent_changes: Vec<RecentChange>,
    /// Sources that were skipped, rendered as `ContextUnavailable` messages.
    pub omitted: Vec<String>,
}

pub struct ContextRequest<'a> {
    pub task: &'a Task,
    pub project_root: &'a Path,
    pub config: &'a ContextConfig,
    pub git_timeout: Duration,
    /// Project history file under `.devflow/projects/`.
    pub history_path: Option<&'a Path>,
}

#[instrument(skip_all, fields(project = %request.task.project))]
pub fn assemble_context(request: &ContextRequest<'_>) -> ContextBundle {
    let mut omitted = Vec::new();
    let root = request.project_root;
    let config = request.config;

    let session = soft(&mut omitted, latest_session(root, config.session_chars));
    let readme = soft(&mut omitted, readme_excerpt(root, config.readme_chars));
    let git = soft(
        &mut omitted,
        git_snapshot(root, config.max_changed_files, request.git_timeout),
    );
    let todos = scan_todos(root, config.max_todos, config.max_file_bytes);
    let targets = request
        .task
        .target_files
        .iter()
        .filter_map(|target| {
            let result = target_context(
                root,
                &target.path,
                target.request.clone(),
                &request.task.description,
                config.max_file_bytes,
            );
            soft(&mut omitted, result)
        })
        .collect::<Vec<_>>();
    let recent_changes = request
        .history_path
        .and_then(|path| soft(&mut omitted, recent_changes(path)))
        .unwrap_or_default();

    info!(
        session = session.is_some(),
        readme = readme.is_some(),
        git = git.is_some(),
        todos = todos.len(),
        targets = targets.len(),
        recent_changes = recent_changes.len(),
        omitted = omitted.len(),
        "context assembled"
    );
    ContextBundle {
        project: request.task.project.clone(),
        project_root: root.to_path_buf(),
        session,
        readme,
        git,
        todos,
        targets,
        recent_changes,
        omitted,
    }
}

fn soft<T>(omitted: &mut Vec<String>, result: Result<T, PipelineError>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(err) => {
            debug!(error = %err, "context source omitted");
            omitted.push(err.to_string());
            None
        }
    }
}

fn unavailable(source_name: &'static str, reason: impl Into<String>) -> PipelineError {
    PipelineError::ContextUnavailable {
        source_name,
        reason: reason.into(),
    }
}

fn recent_changes(path: &Path) -> Result<Vec<RecentChange>, PipelineError> {
    load_history(path)
        .map(|history| history.recent_changes)
        .map_err(|err| unavailable("history", format!("{err:#}")))
}

fn latest_session(root: &Path, max_chars: usize) -> Result<Excerpt, PipelineError> {
    let dir = root.join(SESSIONS_DIR);
    let entries =
        fs::read_dir(&dir).map_err(|err| unavailable("session", format!("{SESSIONS_DIR}: {err}")))?;
    let mut names: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_file())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| name.ends_with(".md"))
        .collect();
    names.sort();
    let latest = names
        .pop()
        .ok_or_else(|| unavailable("session", format!("no notes in {SESSIONS_DIR}")))?;
    let source = format!("{SESSIONS_DIR}/{latest}");
    excerpt(root, &source, "session", max_chars)
}

fn readme_excerpt(root: &Path, max_chars: usize) -> Result<Excerpt, PipelineError> {
    for name in ["README.md", "STATUS.md"] {
        if root.join(name).is_file() {
            return excerpt(root, name, "readme", max_chars);
        }
    }
    Err(unavailable("readme", "no README.md or STATUS.md"))
}

fn excerpt(
    root: &Path,
    relative: &str,
    source_name: &'static str,
    max_chars: usize,
) -> Result<Excerpt, PipelineError> {
    let text = fs::read_to_string(root.join(relative))
        .map_err(|err| unavailable(source_name, format!("{relative}: {err}")))?;
    let (head, truncated) = truncate_chars(text.trim(), max_chars);
    Ok(Excerpt {
        source: relative.to_string(),
        text: head.to_string(),
        truncated,
    })
}

fn git_snapshot(
    root: &Path,
    max_changed_files: usize,
    timeout: Duration,
) -> Result<GitSnapshot, PipelineError> {
    let git = Git::new(root, timeout);
    if !git.is_repo() {
        return Err(unavailable("git", "not a git repository"));
    }
    let branch = git
        .current_branch()
        .map_err(|err| unavailable("git", format!("{err:#}")))?;
    let entries = git
        .status_porcelain()
        .map_err(|err| unavailable("git", format!("{err:#}")))?;
    Ok(GitSnapshot {
        branch,
        changed_files: entries
            .iter()
            .take(max_changed_files)
            .map(|entry| format!("{} {}", entry.code, entry.path))
            .collect(),
        total_changed: entries.len(),
        dirty: !entries.is_empty(),
    })
}

fn is_skipped_dir(entry: &DirEntry) -> bool {
    entry.depth() > 0
        && entry.file_type().is_dir()
        && entry
            .file_name()
            .to_str()
            .is_some_and(|name| SKIP_DIRS.contains(&name))
}

/// Collect up to `max_todos` `TODO`/`FIXME` lines in sorted walk order.
pub fn scan_todos(root: &Path, max_todos: usize, max_file_bytes: u64) -> Vec<TodoItem> {
    let mut todos = Vec::new();
    if max_todos == 0 {
        return todos;
    }
    let walker = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| !is_skipped_dir(entry));
    for entry in walker.filter_map(|entry| entry.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let has_source_ext = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| TODO_EXTENSIONS.contains(&ext));
        if !has_source_ext {
            continue;
        }
        if entry.metadata().map(|m| m.len()).unwrap_or(u64::MAX) > max_file_bytes {
            continue;
        }
        let Ok(contents) = fs::read_to_string(path) else {
            continue;
        };
        let relative = path
            .strip_prefix(root)
            .map(display_relative)
            .unwrap_or_else(|_| path.display().to_string());
        for (idx, line) in contents.lines().enumerate() {
            if line.contains("TODO") || line.contains("FIXME") {
                todos.push(TodoItem {
                    file: relative.clone(),
                    line: idx + 1,
                    text: preview(line.trim(), TODO_TEXT_CHARS),
                });
                if todos.len() >= max_todos {
                    return todos;
                }
            }
        }
    }
    todos
}

fn target_context(
    root: &Path,
    raw_path: &str,
    request: Option<String>,
    task_text: &str,
    max_file_bytes: u64,
) -> Result<TargetContext, PipelineError> {
    let resolved = resolve_in_root(root, raw_path)
        .map_err(|err| unavailable("target", err.to_string()))?;
    let exists = resolved.absolute.is_file();
    let detection = detect(exists, task_text);
    let path = display_relative(&resolved.relative);
    debug!(path = %path, kind = %detection.kind, confidence = detection.confidence, "target detected");

    let (current, companions) = if detection.kind == OperationKind::Modify {
        let current = snapshot(root, &path, max_file_bytes);
        let companions = companion_paths(&path)
            .into_iter()
            .filter(|candidate| root.join(candidate).is_file())
            .map(|candidate| snapshot(root, &candidate, max_file_bytes))
            .collect();
        (Some(current), companions)
    } else {
        (None, Vec::new())
    };

    Ok(TargetContext {
        path,
        detection,
        request,
        current,
        companions,
    })
}

fn snapshot(root: &Path, relative: &str, max_file_bytes: u64) -> FileSnapshot {
    let full = root.join(relative);
    let size = fs::metadata(&full).map(|m| m.len()).unwrap_or(0);
    if size > max_file_bytes {
        warn!(path = relative, size, "file too large for context");
        return FileSnapshot {
            path: relative.to_string(),
            content: None,
            note: Some(format!(
                "file too large ({} KiB > {} KiB)",
                size / 1024,
                max_file_bytes / 1024
            )),
        };
    }
    match fs::read_to_string(&full) {
        Ok(content) => FileSnapshot {
            path: relative.to_string(),
            content: Some(content),
            note: None,
        },
        Err(err) => FileSnapshot {
            path: relative.to_string(),
            content: None,
            note: Some(format!("unreadable: {err}")),
        },
    }
}

/// Conventional test-file names for `relative`, target itself excluded.
pub fn companion_paths(relative: &str) -> Vec<String> {
    let (dir, file) = match relative.rsplit_once('/') {
        Some((dir, file)) => (Some(dir), file),
        None => (None, relative),
    };
    let Some((stem, ext)) = file.rsplit_once('.') else {
        return Vec::new();
    };
    if stem.is_empty() {
        return Vec::new();
    }
    let beside = |name: String| match dir {
        Some(dir) => format!("{dir}/{name}"),
        None => name,
    };
    let candidates = [
        beside(format!("test_{stem}.{ext}")),
        beside(format!("{stem}_test.{ext}")),
        format!("tests/test_{stem}.{ext}"),
        format!("tests/{stem}_test.{ext}"),
        beside(format!("{stem}.test.{ext}")),
        beside(format!("{stem}.spec.{ext}")),
    ];
    let mut out: Vec<String> = Vec::new();
    for candidate in candidates {
        if candidate != relative && !out.contains(&candidate) {
            out.push(candidate);
        }
    }
    out
}
