//! The record of one pipeline run, as consumed by the report and run log.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::core::task::Task;
use crate::core::types::{CommitRecord, OperationKind, OperationResult, TokenUsage};
use crate::error::PipelineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Completed,
    Halted,
}

/// The error that stopped forward progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Halt {
    pub kind: String,
    pub message: String,
}

impl From<&PipelineError> for Halt {
    fn from(err: &PipelineError) -> Self {
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TargetSummary {
    pub path: String,
    pub kind: OperationKind,
    pub confidence: f32,
}

/// What went into the prompt, without the file contents.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ContextSummary {
    pub session_source: Option<String>,
    pub readme_source: Option<String>,
    pub git_branch: Option<String>,
    pub todos: usize,
    pub targets: Vec<TargetSummary>,
    pub omitted: Vec<String>,
    pub dropped_sections: Vec<String>,
    pub prompt_chars: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallSummary {
    pub model: String,
    pub usage: TokenUsage,
    pub stop_reason: Option<String>,
    pub duration_ms: u64,
    pub cost_usd: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum GitOutcome {
    /// The run halted before the commit stage.
    NotAttempted,
    Skipped { reason: String },
    Committed(CommitRecord),
    Failed { message: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OperationCounts {
    pub created: usize,
    pub modified: usize,
    pub deleted: usize,
    pub errors: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunOutcome {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub task_path: String,
    pub task: Option<Task>,
    pub project_root: Option<String>,
    pub context: Option<ContextSummary>,
    pub call: Option<CallSummary>,
    /// LLM analysis text; absent when the run halted before the call.
    pub analysis: Option<String>,
    pub parse_issue: Option<String>,
    pub operations: Vec<OperationResult>,
    pub git: GitOutcome,
    pub halt: Option<Halt>,
}

impl RunOutcome {
    pub fn new(run_id: &str, started_at: DateTime<Utc>, task_path: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            started_at,
            finished_at: started_at,
            task_path: task_path.to_string(),
            task: None,
            project_root: None,
            context: None,
            call: None,
            analysis: None,
            parse_issue: None,
            operations: Vec::new(),
            git: GitOutcome::NotAttempted,
            halt: None,
        }
    }

    pub fn status(&self) -> RunStatus {
        if self.halt.is_some() {
            RunStatus::Halted
        } else {
            RunStatus::Completed
        }
    }

    pub fn counts(&self) -> OperationCounts {
        let mut counts = OperationCounts::default();
        for result in &self.operations {
            if !result.success {
                counts.errors += 1;
                continue;
            }
            match result.effective_kind {
                OperationKind::Create => counts.created += 1,
                OperationKind::Modify => counts.modified += 1,
                OperationKind::Delete => counts.deleted += 1,
            }
        }
        counts
    }

    pub fn halt_with(&mut self, err: &PipelineError) {
        self.halt = Some(Halt::from(err));
    }
}
