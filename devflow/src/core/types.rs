//! Shared value types produced and consumed by the pipeline stages.

use std::fmt;

use serde::{Deserialize, Serialize};

/// What a file operation does to its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OperationKind {
    Create,
    Modify,
    Delete,
}

impl OperationKind {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "create" => Some(OperationKind::Create),
            "modify" => Some(OperationKind::Modify),
            "delete" => Some(OperationKind::Delete),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Create => "CREATE",
            OperationKind::Modify => "MODIFY",
            OperationKind::Delete => "DELETE",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One operation parsed from the LLM reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileOperation {
    pub kind: OperationKind,
    /// Path relative to the project root, as written in the reply.
    pub path: String,
    /// Full file content; `None` for deletes.
    pub content: Option<String>,
}

impl FileOperation {
    pub fn create(path: &str, content: &str) -> Self {
        Self {
            kind: OperationKind::Create,
            path: path.to_string(),
            content: Some(content.to_string()),
        }
    }

    pub fn modify(path: &str, content: &str) -> Self {
        Self {
            kind: OperationKind::Modify,
            path: path.to_string(),
            content: Some(content.to_string()),
        }
    }

    pub fn delete(path: &str) -> Self {
        Self {
            kind: OperationKind::Delete,
            path: path.to_string(),
            content: None,
        }
    }
}

/// Outcome of applying (and verifying) one [`FileOperation`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationResult {
    pub operation: FileOperation,
    /// Kind actually applied after re-detection against the filesystem.
    pub effective_kind: OperationKind,
    pub success: bool,
    /// Error label (see `PipelineError::kind`) when the operation failed.
    pub error_kind: Option<String>,
    pub error: Option<String>,
    pub bytes_written: u64,
    /// False for a delete of an already absent file.
    pub changed: bool,
    pub note: Option<String>,
    /// Set once the verification pass has re-checked the result.
    pub verified: bool,
}

impl OperationResult {
    pub fn failed(
        operation: FileOperation,
        effective_kind: OperationKind,
        kind: &str,
        error: String,
    ) -> Self {
        Self {
            operation,
            effective_kind,
            success: false,
            error_kind: Some(kind.to_string()),
            error: Some(error),
            bytes_written: 0,
            changed: false,
            note: None,
            verified: false,
        }
    }
}

/// Token counts reported by the LLM provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Estimated USD cost for `usage` at the given per-million-token prices.
pub fn estimate_cost(usage: &TokenUsage, input_per_mtok: f64, output_per_mtok: f64) -> f64 {
    let input = usage.input_tokens as f64 / 1_000_000.0 * input_per_mtok;
    let output = usage.output_tokens as f64 / 1_000_000.0 * output_per_mtok;
    input + output
}

/// A finished commit, as reported back to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommitRecord {
    pub message: String,
    pub files: Vec<String>,
    pub sha: Option<String>,
    pub pushed: bool,
}
