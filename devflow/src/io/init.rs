//! `devflow init`: scaffold a workspace.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use tracing::info;

use crate::io::config::{Config, write_config};
use crate::io::workspace::WorkspacePaths;

/// Options for `init_workspace`.
#[derive(Debug, Clone, Copy)]
pub struct InitOptions {
    /// Overwrite files devflow owns.
    pub force: bool,
}

/// Files written (or left alone) by an init.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InitReport {
    pub written: Vec<String>,
    pub kept: Vec<String>,
}

/// Create `devflow.toml`, a starter `task.md`, `.env.example`, `.gitignore`
/// and the projects directory under `root`.
///
/// Existing files are kept unless `options.force` is set; `.gitignore` is
/// extended rather than replaced.
pub fn init_workspace(root: &Path, options: &InitOptions) -> Result<InitReport> {
    if root.exists() && !root.is_dir() {
        return Err(anyhow!("init: {} is not a directory", root.display()));
    }
    let paths = WorkspacePaths::new(root);
    let mut report = InitReport::default();
    fs::create_dir_all(root).with_context(|| format!("create directory {}", root.display()))?;

    let config = Config::default();
    if options.force || !paths.config_path.exists() {
        write_config(&paths.config_path, &config)?;
        report.written.push(file_label(&paths.config_path));
    } else {
        report.kept.push(file_label(&paths.config_path));
    }

    write_if_missing_or_force(&paths.task_path(None), TASK_TEMPLATE, options.force, &mut report)?;
    write_if_missing_or_force(
        &root.join(".env.example"),
        ENV_EXAMPLE,
        options.force,
        &mut report,
    )?;
    ensure_gitignore(&root.join(".gitignore"), &mut report)?;

    let projects_dir = Config::resolve(root, &config.projects_root);
    fs::create_dir_all(&projects_dir)
        .with_context(|| format!("create directory {}", projects_dir.display()))?;

    info!(root = %root.display(), written = report.written.len(), "workspace initialized");
    Ok(report)
}

fn write_if_missing_or_force(
    path: &Path,
    contents: &str,
    force: bool,
    report: &mut InitReport,
) -> Result<()> {
    if path.exists() && !force {
        report.kept.push(file_label(path));
        return Ok(());
    }
    fs::write(path, contents).with_context(|| format!("write file {}", path.display()))?;
    report.written.push(file_label(path));
    Ok(())
}

fn ensure_gitignore(path: &Path, report: &mut InitReport) -> Result<()> {
    let existing = if path.exists() {
        fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?
    } else {
        String::new()
    };
    let missing: Vec<&str> = GITIGNORE_LINES
        .iter()
        .copied()
        .filter(|line| !existing.lines().any(|l| l.trim() == *line))
        .collect();
    if missing.is_empty() {
        report.kept.push(file_label(path));
        return Ok(());
    }
    let mut updated = existing;
    if !updated.is_empty() && !updated.ends_with('\n') {
        updated.push('\n');
    }
    for line in missing {
        updated.push_str(line);
        updated.push('\n');
    }
    fs::write(path, updated).with_context(|| format!("write file {}", path.display()))?;
    report.written.push(file_label(path));
    Ok(())
}

fn file_label(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

const GITIGNORE_LINES: &[&str] = &[".env", ".devflow/"];

const ENV_EXAMPLE: &str = "# Copy to .env and fill in.\nANTHROPIC_API_KEY=\n";

const TASK_TEMPLATE: &str = "\
PROJECT: my-project
TASK: Describe the change you want in one sentence.
PRIORITY: NORMAL
AUTO_COMMIT: no
AUTO_PUSH: no

## Context

Anything the model should know that is not in the repository.

## Notes

Constraints, style preferences, files to leave alone.
";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::task::{TaskFormat, parse_task};
    use crate::io::config::load_config;

    /// Verifies init writes every scaffold file and the starter task parses.
    #[test]
    fn init_creates_expected_layout() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path();

        let report = init_workspace(root, &InitOptions { force: false }).expect("init");

        assert_eq!(
            report.written,
            vec!["devflow.toml", "task.md", ".env.example", ".gitignore"]
        );
        assert!(root.join("projects").is_dir());
        assert_eq!(
            load_config(&root.join("devflow.toml")).expect("config"),
            Config::default()
        );
        let task = fs::read_to_string(root.join("task.md")).expect("task");
        let parsed = parse_task(&task, TaskFormat::Markdown).expect("starter task parses");
        assert_eq!(parsed.project, "my-project");
        assert!(!parsed.auto_commit);
    }

    /// Verifies a second init keeps user edits unless forced.
    #[test]
    fn init_keeps_existing_files_without_force() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path();
        init_workspace(root, &InitOptions { force: false }).expect("init");
        fs::write(root.join("task.md"), "PROJECT: mine\nTASK: keep me\n").expect("edit");

        let report = init_workspace(root, &InitOptions { force: false }).expect("re-init");
        assert!(report.written.is_empty());
        assert_eq!(
            fs::read_to_string(root.join("task.md")).expect("task"),
            "PROJECT: mine\nTASK: keep me\n"
        );

        init_workspace(root, &InitOptions { force: true }).expect("forced");
        assert_eq!(
            fs::read_to_string(root.join("task.md")).expect("task"),
            TASK_TEMPLATE
        );
    }

    #[test]
    fn gitignore_is_extended_not_replaced() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path();
        fs::write(root.join(".gitignore"), "target/\n.env").expect("seed");
        init_workspace(root, &InitOptions { force: false }).expect("init");
        let gitignore = fs::read_to_string(root.join(".gitignore")).expect("read");
        assert_eq!(gitignore, "target/\n.env\n.devflow/\n");
    }
}
