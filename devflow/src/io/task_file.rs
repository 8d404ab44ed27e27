//! Reading task files from disk and picking their format.

use std::fs;
use std::path::Path;

use anyhow::Result;
use tracing::{debug, instrument};

use crate::core::task::{Task, TaskFormat, parse_task, sniff_format};
use crate::error::PipelineError;

/// Format from the extension, falling back to sniffing the content.
pub fn detect_format(path: &Path, raw: &str) -> TaskFormat {
    let ext = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("md" | "markdown") => TaskFormat::Markdown,
        Some("yaml" | "yml") => TaskFormat::Yaml,
        _ => sniff_format(raw),
    }
}

/// Read and parse a task file. Unreadable files count as malformed tasks.
#[instrument(skip_all, fields(path = %path.display()))]
pub fn load_task(path: &Path, format: Option<TaskFormat>) -> Result<Task> {
    let raw = fs::read_to_string(path).map_err(|err| {
        PipelineError::MalformedTask(format!("cannot read {}: {err}", path.display()))
    })?;
    let format = format.unwrap_or_else(|| detect_format(path, &raw));
    debug!(?format, "parsing task");
    let task = parse_task(&raw, format)?;
    debug!(project = %task.project, targets = task.target_files.len(), "task parsed");
    Ok(task)
}

/// Raw bytes of the task file, for change detection.
pub fn read_task_bytes(path: &Path) -> Result<Vec<u8>> {
    use anyhow::Context;
    fs::read(path).with_context(|| format!("read task file {}", path.display()))
}
