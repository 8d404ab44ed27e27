//! Markdown report written back to the caller after every run.

use std::path::Path;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use serde::Serialize;
use tracing::debug;

use crate::core::outcome::{GitOutcome, RunOutcome, RunStatus};
use crate::core::text::{char_len, truncate_chars};
use crate::core::types::OperationKind;
use crate::io::atomic::write_atomic_str;
use crate::io::config::PricingConfig;

const REPORT_TEMPLATE: &str = include_str!("templates/report.md");
/// Content shorter than this gets a preview in the report.
const PREVIEW_MAX_FILE_CHARS: usize = 2000;
const PREVIEW_CHARS: usize = 500;
const NO_ANALYSIS: &str = "No analysis: the run halted before the LLM replied.";

#[derive(Debug, Serialize)]
struct CallView {
    model: String,
    input_tokens: u64,
    output_tokens: u64,
    total_tokens: u64,
    duration_ms: u64,
    stop_reason: Option<String>,
    cost: String,
}

#[derive(Debug, Serialize)]
struct OperationView {
    kind: String,
    declared: String,
    path: String,
    success: bool,
    bytes_written: u64,
    note: Option<String>,
    error: Option<String>,
    lang: String,
    preview: Option<String>,
}

fn operation_view(result: &crate::core::types::OperationResult) -> OperationView {
    let preview = result
        .operation
        .content
        .as_deref()
        .filter(|_| result.success && result.effective_kind != OperationKind::Delete)
        .filter(|content| char_len(content) < PREVIEW_MAX_FILE_CHARS)
        .map(|content| {
            let (head, cut) = truncate_chars(content.trim_end(), PREVIEW_CHARS);
            if cut {
                format!("{head}\n...")
            } else {
                head.to_string()
            }
        });
    OperationView {
        kind: result.effective_kind.to_string(),
        declared: result.operation.kind.to_string(),
        path: result.operation.path.clone(),
        success: result.success,
        bytes_written: result.bytes_written,
        note: result.note.clone(),
        error: result.error.clone(),
        lang: Path::new(&result.operation.path)
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or_default()
            .to_string(),
        preview,
    }
}

fn git_text(git: &GitOutcome) -> String {
    match git {
        GitOutcome::NotAttempted => "Not attempted: the run halted before the commit stage.".to_string(),
        GitOutcome::Skipped { reason } => format!("Skipped: {reason}."),
        GitOutcome::Failed { message } => format!("Commit failed: {message}"),
        GitOutcome::Committed(record) => {
            let mut text = format!(
                "Committed {}: `{}`\n",
                record
                    .sha
                    .as_deref()
                    .map(|sha| format!("`{sha}`"))
                    .unwrap_or_else(|| "(unknown sha)".to_string()),
                record.message
            );
            for file in &record.files {
                text.push_str(&format!("\n- `{file}`"));
            }
            text.push_str(if record.pushed {
                "\n\nPushed to remote."
            } else {
                "\n\nNot pushed."
            });
            text
        }
    }
}

fn error_lines(outcome: &RunOutcome) -> Vec<String> {
    let mut lines = Vec::new();
    if let Some(halt) = &outcome.halt {
        lines.push(format!("{}: {}", halt.kind, halt.message));
    }
    if let Some(issue) = &outcome.parse_issue {
        lines.push(format!("Reply parse issue: {issue}"));
    }
    for result in outcome.operations.iter().filter(|r| !r.success) {
        lines.push(format!(
            "{} `{}`: {}",
            result.error_kind.as_deref().unwrap_or("Error"),
            result.operation.path,
            result.error.as_deref().unwrap_or("failed")
        ));
    }
    if let GitOutcome::Failed { message } = &outcome.git {
        lines.push(format!("GitCommand: {message}"));
    }
    lines
}

/// Render the fixed-section markdown report.
pub fn render_report(outcome: &RunOutcome, pricing: &PricingConfig) -> Result<String> {
    let mut env = Environment::new();
    env.set_trim_blocks(true);
    env.set_lstrip_blocks(true);
    env.add_template("report", REPORT_TEMPLATE)
        .context("load report template")?;
    let template = env.get_template("report")?;

    let task = outcome.task.as_ref();
    let call = outcome.call.as_ref().map(|call| CallView {
        model: call.model.clone(),
        input_tokens: call.usage.input_tokens,
        output_tokens: call.usage.output_tokens,
        total_tokens: call.usage.total(),
        duration_ms: call.duration_ms,
        stop_reason: call.stop_reason.clone(),
        cost: format!("{:.4}", call.cost_usd),
    });
    let analysis = outcome
        .analysis
        .as_deref()
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .unwrap_or(if outcome.call.is_some() {
            "(the reply contained no analysis text)"
        } else {
            NO_ANALYSIS
        });
    let status = match outcome.status() {
        RunStatus::Completed => "completed",
        RunStatus::Halted => "halted",
    };

    let rendered = template.render(context! {
        run_id => &outcome.run_id,
        timestamp => outcome.started_at.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
        project => task.map_or("(unknown)", |t| t.project.as_str()),
        priority => task.map_or("-", |t| t.priority.as_str()),
        status => status,
        task => task.map_or("(task could not be parsed)", |t| t.description.as_str()),
        analysis => analysis,
        call => call,
        input_price => format!("{:.2}", pricing.input_per_mtok),
        output_price => format!("{:.2}", pricing.output_per_mtok),
        counts => outcome.counts(),
        operations => outcome.operations.iter().map(operation_view).collect::<Vec<_>>(),
        git => git_text(&outcome.git),
        errors => error_lines(outcome),
    })?;
    Ok(rendered)
}

/// Render and atomically write the report.
pub fn write_report(path: &Path, outcome: &RunOutcome, pricing: &PricingConfig) -> Result<()> {
    let rendered = render_report(outcome, pricing)?;
    write_atomic_str(path, &rendered)?;
    debug!(path = %path.display(), "report written");
    Ok(())
}
