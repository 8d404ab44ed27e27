//! Typed pipeline errors.
//!
//! Orchestration propagates `anyhow::Error`; the stage that fails wraps one of
//! these variants so the pipeline boundary can recover it with `downcast_ref`.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    #[error("malformed task: {0}")]
    MalformedTask(String),

    #[error("unknown project '{project}': {reason}")]
    UnknownProject { project: String, reason: String },

    /// Soft: a context source was skipped.
    #[error("context source '{source_name}' unavailable: {reason}")]
    ContextUnavailable {
        source_name: &'static str,
        reason: String,
    },

    /// Required prompt sections (including MODIFY target content) do not fit.
    #[error(
        "required prompt sections need {required} chars but the budget is {budget}; raise context.prompt_budget_chars or split the task"
    )]
    PromptOverBudget { required: usize, budget: usize },

    #[error("LLM call failed: {0}")]
    LlmCall(String),

    #[error("path escapes project root: {0}")]
    PathEscape(String),

    #[error("write failed for {path}: {reason}")]
    FileWrite { path: String, reason: String },

    #[error("verification failed for {path}: {reason}")]
    VerificationMismatch { path: String, reason: String },

    #[error("git command failed: {0}")]
    GitCommand(String),
}

impl PipelineError {
    /// Stable label used in run metadata and the report.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::MalformedTask(_) => "MalformedTask",
            PipelineError::UnknownProject { .. } => "UnknownProject",
            PipelineError::ContextUnavailable { .. } => "ContextUnavailable",
            PipelineError::PromptOverBudget { .. } => "PromptOverBudget",
            PipelineError::LlmCall(_) => "LlmCall",
            PipelineError::PathEscape(_) => "PathEscape",
            PipelineError::FileWrite { .. } => "FileWrite",
            PipelineError::VerificationMismatch { .. } => "VerificationMismatch",
            PipelineError::GitCommand(_) => "GitCommand",
        }
    }

    /// Soft errors are recorded but never stop the run.
    pub fn is_soft(&self) -> bool {
        matches!(
            self,
            PipelineError::ContextUnavailable { .. } | PipelineError::GitCommand(_)
        )
    }
}

/// Recover a typed pipeline error from an `anyhow` chain.
pub fn find_pipeline_error(err: &anyhow::Error) -> Option<&PipelineError> {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<PipelineError>())
}
