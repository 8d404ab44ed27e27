//! Project id -> directory resolution, plus listing for `devflow projects`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::debug;

use crate::core::task::validate_project_id;
use crate::error::PipelineError;
use crate::io::config::Config;
use crate::io::git::Git;
use crate::io::project_history::{ProjectHistory, load_history};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ProjectSource {
    /// Listed under `[projects]` in `devflow.toml`.
    Configured,
    /// A directory under `projects_root`.
    Discovered,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProjectEntry {
    pub id: String,
    pub path: PathBuf,
    pub source: ProjectSource,
    pub exists: bool,
}

/// One listed project with git and history details.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProjectSummary {
    pub entry: ProjectEntry,
    pub is_repo: bool,
    pub branch: Option<String>,
    pub history: ProjectHistory,
}

#[derive(Debug, Clone)]
pub struct ProjectRegistry {
    projects_root: PathBuf,
    overrides: BTreeMap<String, PathBuf>,
}

impl ProjectRegistry {
    pub fn from_config(workspace: &Path, config: &Config) -> Self {
        let overrides = config
            .projects
            .iter()
            .map(|(id, path)| (id.clone(), Config::resolve(workspace, path)))
            .collect();
        Self {
            projects_root: Config::resolve(workspace, &config.projects_root),
            overrides,
        }
    }

    /// Resolve a project id to an existing directory.
    ///
    /// Explicit overrides win; otherwise `<projects_root>/<id>` is used.
    pub fn resolve(&self, project: &str) -> Result<PathBuf, PipelineError> {
        validate_project_id(project).map_err(|err| PipelineError::UnknownProject {
            project: project.to_string(),
            reason: err.to_string(),
        })?;
        let path = self
            .overrides
            .get(project)
            .cloned()
            .unwrap_or_else(|| self.projects_root.join(project));
        if !path.is_dir() {
            return Err(PipelineError::UnknownProject {
                project: project.to_string(),
                reason: format!("{} is not a directory", path.display()),
            });
        }
        debug!(project, path = %path.display(), "project resolved");
        Ok(path)
    }

    /// Every known project, sorted by id. Configured entries shadow
    /// discovered directories with the same id; hidden directories and names
    /// that are not valid project ids are skipped.
    pub fn list(&self) -> Result<Vec<ProjectEntry>> {
        let mut entries: BTreeMap<String, ProjectEntry> = self
            .overrides
            .iter()
            .map(|(id, path)| {
                let entry = ProjectEntry {
                    id: id.clone(),
                    path: path.clone(),
                    source: ProjectSource::Configured,
                    exists: path.is_dir(),
                };
                (id.clone(), entry)
            })
            .collect();

        if self.projects_root.is_dir() {
            let dir = fs::read_dir(&self.projects_root)
                .with_context(|| format!("read {}", self.projects_root.display()))?;
            for item in dir {
                let item = item.with_context(|| format!("read {}", self.projects_root.display()))?;
                let path = item.path();
                let id = item.file_name().to_string_lossy().into_owned();
                if !path.is_dir() || id.starts_with('.') || validate_project_id(&id).is_err() {
                    continue;
                }
                entries.entry(id.clone()).or_insert(ProjectEntry {
                    id,
                    path,
                    source: ProjectSource::Discovered,
                    exists: true,
                });
            }
        }
        debug!(count = entries.len(), "projects listed");
        Ok(entries.into_values().collect())
    }
}

/// Add git status and the recorded history to a listed project.
pub fn summarize_project(
    entry: ProjectEntry,
    history_path: &Path,
    git_timeout: Duration,
) -> Result<ProjectSummary> {
    let history = load_history(history_path)?;
    let git = Git::new(&entry.path, git_timeout);
    let is_repo = entry.exists && git.is_repo();
    let branch = if is_repo {
        git.current_branch().unwrap_or_default()
    } else {
        None
    };
    Ok(ProjectSummary {
        entry,
        is_repo,
        branch,
        history,
    })
}
