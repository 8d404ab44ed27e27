//! Task documents and their normalization into one canonical [`Task`].
//!
//! Two input shapes exist: a markdown header block (`PROJECT:`, `TASK:`, ...)
//! followed by `## ` sections, and a YAML document validated against an
//! embedded JSON Schema. Both are parsed into a [`TaskDocument`] and then
//! normalized immediately; nothing downstream sees the raw shapes.

use std::fmt;
use std::sync::LazyLock;

use jsonschema::Draft;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::targets::extract_target_paths;
use crate::error::PipelineError;

const TASK_SCHEMA_V1: &str = include_str!("../../schemas/task.v1.schema.json");

static HEADER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(PROJECT|TASK|PRIORITY|AUTO_COMMIT|AUTO_PUSH)\s*:\s*(.*?)\s*$")
        .expect("valid header regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskFormat {
    Markdown,
    Yaml,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
    P1,
    P2,
    P3,
}

impl Priority {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "LOW" => Some(Priority::Low),
            "NORMAL" => Some(Priority::Normal),
            "HIGH" => Some(Priority::High),
            "URGENT" => Some(Priority::Urgent),
            "P1" => Some(Priority::P1),
            "P2" => Some(Priority::P2),
            "P3" => Some(Priority::P3),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "LOW",
            Priority::Normal => "NORMAL",
            Priority::High => "HIGH",
            Priority::Urgent => "URGENT",
            Priority::P1 => "P1",
            Priority::P2 => "P2",
            Priority::P3 => "P3",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// YAML `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Feature,
    Bugfix,
    Refactor,
    Docs,
    Test,
    Chore,
    Analysis,
}

impl TaskKind {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "feature" => Some(TaskKind::Feature),
            "bugfix" => Some(TaskKind::Bugfix),
            "refactor" => Some(TaskKind::Refactor),
            "docs" => Some(TaskKind::Docs),
            "test" => Some(TaskKind::Test),
            "chore" => Some(TaskKind::Chore),
            "analysis" => Some(TaskKind::Analysis),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Feature => "feature",
            TaskKind::Bugfix => "bugfix",
            TaskKind::Refactor => "refactor",
            TaskKind::Docs => "docs",
            TaskKind::Test => "test",
            TaskKind::Chore => "chore",
            TaskKind::Analysis => "analysis",
        }
    }
}

/// A file the task names, with the requested content/spec when the task gives one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetFile {
    pub path: String,
    pub request: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskSection {
    pub title: String,
    pub body: String,
}

/// Canonical task, read-only once parsed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Task {
    pub format: TaskFormat,
    pub project: String,
    pub description: String,
    pub priority: Priority,
    pub kind: Option<TaskKind>,
    pub auto_commit: bool,
    pub auto_push: bool,
    pub context: Option<String>,
    pub notes: Option<String>,
    pub testing: Option<String>,
    pub dependencies: Vec<String>,
    pub target_files: Vec<TargetFile>,
    pub sections: Vec<TaskSection>,
}

/// Raw markdown header values and sections, before validation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MarkdownTask {
    pub project: Option<String>,
    pub task: Option<String>,
    pub priority: Option<String>,
    pub auto_commit: Option<String>,
    pub auto_push: Option<String>,
    pub sections: Vec<TaskSection>,
}

/// Schema-checked YAML task document.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct YamlTask {
    #[serde(rename = "type")]
    pub kind: String,
    pub project: String,
    pub priority: String,
    pub description: String,
    #[serde(default)]
    pub context: Option<FreeText>,
    #[serde(default)]
    pub notes: Option<FreeText>,
    #[serde(default)]
    pub testing: Option<FreeText>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    pub requirements: YamlRequirements,
    #[serde(default)]
    pub git_commit: Option<GitCommitSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct YamlRequirements {
    pub files: Vec<YamlFile>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct YamlFile {
    pub path: String,
    #[serde(default)]
    pub content: Option<String>,
}

/// Free text given either as one string or a list of lines.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum FreeText {
    Text(String),
    Lines(Vec<String>),
}

impl FreeText {
    fn into_text(self) -> Option<String> {
        let text = match self {
            FreeText::Text(text) => text.trim().to_string(),
            FreeText::Lines(lines) => lines
                .iter()
                .map(|line| line.trim())
                .filter(|line| !line.is_empty())
                .map(|line| format!("- {line}"))
                .collect::<Vec<_>>()
                .join("\n"),
        };
        (!text.is_empty()).then_some(text)
    }
}

/// `git_commit: true` or `git_commit: { enabled, push }`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum GitCommitSpec {
    Flag(bool),
    Settings {
        enabled: Option<bool>,
        push: Option<bool>,
    },
}

impl GitCommitSpec {
    /// `(auto_commit, auto_push)`.
    fn flags(self) -> (bool, bool) {
        match self {
            GitCommitSpec::Flag(enabled) => (enabled, false),
            GitCommitSpec::Settings { enabled, push } => {
                let enabled = enabled.unwrap_or(true);
                (enabled, enabled && push.unwrap_or(false))
            }
        }
    }
}

/// Parser boundary: one of the two accepted input shapes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskDocument {
    Markdown(MarkdownTask),
    Yaml(Box<YamlTask>),
}

impl TaskDocument {
    pub fn parse(raw: &str, format: TaskFormat) -> Result<Self, PipelineError> {
        match format {
            TaskFormat::Markdown => Ok(TaskDocument::Markdown(parse_markdown(raw))),
            TaskFormat::Yaml => parse_yaml(raw).map(|doc| TaskDocument::Yaml(Box::new(doc))),
        }
    }

    pub fn normalize(self) -> Result<Task, PipelineError> {
        match self {
            TaskDocument::Markdown(doc) => normalize_markdown(doc),
            TaskDocument::Yaml(doc) => normalize_yaml(*doc),
        }
    }
}

/// Parse and normalize raw task text in one step.
pub fn parse_task(raw: &str, format: TaskFormat) -> Result<Task, PipelineError> {
    TaskDocument::parse(raw, format)?.normalize()
}

/// Guess the format of extension-less task text: an upper-case `PROJECT:` or
/// `TASK:` header line means markdown.
pub fn sniff_format(raw: &str) -> TaskFormat {
    let has_header = raw.lines().any(|line| {
        let line = line.trim_start();
        line.starts_with("PROJECT:") || line.starts_with("TASK:")
    });
    if has_header {
        TaskFormat::Markdown
    } else {
        TaskFormat::Yaml
    }
}

/// Project ids double as directory names, so they must be plain identifiers.
pub fn validate_project_id(id: &str) -> Result<(), PipelineError> {
    if id.is_empty() {
        return Err(PipelineError::MalformedTask(
            "project must not be empty".to_string(),
        ));
    }
    if id == "." || id == ".." {
        return Err(PipelineError::MalformedTask(format!(
            "project id '{id}' is not allowed"
        )));
    }
    if id
        .chars()
        .any(|c| !(c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-'))
    {
        return Err(PipelineError::MalformedTask(format!(
            "project must be [A-Za-z0-9._-] only (got '{id}')"
        )));
    }
    Ok(())
}

/// Accepts `yes|true|1|ano`; everything else is `false`.
pub fn parse_flag(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "yes" | "true" | "1" | "ano"
    )
}

fn parse_markdown(raw: &str) -> MarkdownTask {
    let mut doc = MarkdownTask::default();
    let mut current: Option<(String, Vec<&str>)> = None;

    for line in raw.lines() {
        if let Some(title) = line.strip_prefix("## ") {
            if let Some((title, body)) = current.take() {
                doc.sections.push(section(title, &body));
            }
            current = Some((title.trim().to_string(), Vec::new()));
            continue;
        }
        if let Some((_, body)) = current.as_mut() {
            body.push(line);
            continue;
        }
        let Some(caps) = HEADER_RE.captures(line) else {
            continue;
        };
        let value = caps[2].to_string();
        let slot = match caps[1].to_ascii_uppercase().as_str() {
            "PROJECT" => &mut doc.project,
            "TASK" => &mut doc.task,
            "PRIORITY" => &mut doc.priority,
            "AUTO_COMMIT" => &mut doc.auto_commit,
            _ => &mut doc.auto_push,
        };
        // First occurrence wins.
        if slot.is_none() {
            *slot = Some(value);
        }
    }
    if let Some((title, body)) = current.take() {
        doc.sections.push(section(title, &body));
    }
    doc
}

fn section(title: String, body: &[&str]) -> TaskSection {
    TaskSection {
        title,
        body: body.join("\n").trim().to_string(),
    }
}

fn find_section<'a>(sections: &'a [TaskSection], titles: &[&str]) -> Option<&'a TaskSection> {
    sections.iter().find(|section| {
        titles
            .iter()
            .any(|title| section.title.eq_ignore_ascii_case(title))
    })
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn normalize_markdown(doc: MarkdownTask) -> Result<Task, PipelineError> {
    let project = non_empty(doc.project)
        .ok_or_else(|| PipelineError::MalformedTask("PROJECT field is required".to_string()))?;
    validate_project_id(&project)?;

    let description = non_empty(doc.task)
        .or_else(|| {
            find_section(&doc.sections, &["Task", "Úloha"])
                .map(|s| s.body.clone())
                .filter(|body| !body.is_empty())
        })
        .ok_or_else(|| PipelineError::MalformedTask("TASK field is required".to_string()))?;

    let priority = match non_empty(doc.priority) {
        None => Priority::default(),
        Some(raw) => Priority::parse(&raw).ok_or_else(|| {
            PipelineError::MalformedTask(format!("unrecognized PRIORITY '{raw}'"))
        })?,
    };

    let context = find_section(&doc.sections, &["Context", "Kontext"])
        .map(|s| s.body.clone())
        .filter(|body| !body.is_empty());
    let notes = find_section(&doc.sections, &["Notes", "Poznámky"])
        .map(|s| s.body.clone())
        .filter(|body| !body.is_empty());

    let mut search_text = description.clone();
    for section in &doc.sections {
        search_text.push('\n');
        search_text.push_str(&section.body);
    }
    let target_files = extract_target_paths(&search_text)
        .into_iter()
        .map(|path| TargetFile {
            path,
            request: None,
        })
        .collect();

    Ok(Task {
        format: TaskFormat::Markdown,
        project,
        description,
        priority,
        kind: None,
        auto_commit: doc.auto_commit.as_deref().is_some_and(parse_flag),
        auto_push: doc.auto_push.as_deref().is_some_and(parse_flag),
        context,
        notes,
        testing: None,
        dependencies: Vec::new(),
        target_files,
        sections: doc.sections,
    })
}

fn parse_yaml(raw: &str) -> Result<YamlTask, PipelineError> {
    let value: Value = serde_yaml::from_str(raw)
        .map_err(|err| PipelineError::MalformedTask(format!("invalid YAML: {err}")))?;
    validate_task_schema(&value)?;
    serde_json::from_value(value)
        .map_err(|err| PipelineError::MalformedTask(format!("invalid task document: {err}")))
}

fn validate_task_schema(value: &Value) -> Result<(), PipelineError> {
    let schema: Value = serde_json::from_str(TASK_SCHEMA_V1)
        .map_err(|err| PipelineError::MalformedTask(format!("embedded task schema: {err}")))?;
    let validator = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .map_err(|err| PipelineError::MalformedTask(format!("embedded task schema: {err}")))?;
    let messages: Vec<String> = validator
        .iter_errors(value)
        .map(|err| err.to_string())
        .collect();
    if messages.is_empty() {
        return Ok(());
    }
    Err(PipelineError::MalformedTask(format!(
        "task does not match schema: {}",
        messages.join("; ")
    )))
}

fn normalize_yaml(doc: YamlTask) -> Result<Task, PipelineError> {
    let project = doc.project.trim().to_string();
    validate_project_id(&project)?;
    let description = doc.description.trim().to_string();
    if description.is_empty() {
        return Err(PipelineError::MalformedTask(
            "description must not be empty".to_string(),
        ));
    }
    let priority = Priority::parse(&doc.priority).ok_or_else(|| {
        PipelineError::MalformedTask(format!("unrecognized priority '{}'", doc.priority))
    })?;
    let kind = TaskKind::parse(&doc.kind)
        .ok_or_else(|| PipelineError::MalformedTask(format!("unrecognized type '{}'", doc.kind)))?;
    let (auto_commit, auto_push) = doc.git_commit.map(GitCommitSpec::flags).unwrap_or_default();

    let target_files = doc
        .requirements
        .files
        .into_iter()
        .map(|file| TargetFile {
            path: file.path.trim().to_string(),
            request: non_empty(file.content),
        })
        .collect();

    Ok(Task {
        format: TaskFormat::Yaml,
        project,
        description,
        priority,
        kind: Some(kind),
        auto_commit,
        auto_push,
        context: doc.context.and_then(FreeText::into_text),
        notes: doc.notes.and_then(FreeText::into_text),
        testing: doc.testing.and_then(FreeText::into_text),
        dependencies: doc.dependencies,
        target_files,
        sections: Vec::new(),
    })
}
