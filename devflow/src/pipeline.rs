//! Orchestration for one `devflow run`: task in, report out.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use crate::core::commit::CommitPlan;
use crate::core::outcome::{
    CallSummary, ContextSummary, GitOutcome, Halt, RunOutcome, TargetSummary,
};
use crate::core::reply::parse_reply;
use crate::core::task::{Task, TaskFormat};
use crate::core::text::{char_len, preview};
use crate::core::types::estimate_cost;
use crate::error::{PipelineError, find_pipeline_error};
use crate::io::config::Config;
use crate::io::context::{ContextBundle, ContextRequest, assemble_context};
use crate::io::fileops::{ApplyRequest, apply_operations, changed_paths, verify_results};
use crate::io::git::Git;
use crate::io::llm::{LlmClient, LlmRequest};
use crate::io::project_history::{RecentChange, record_change};
use crate::io::prompt::{PromptBuilder, PromptPack};
use crate::io::registry::ProjectRegistry;
use crate::io::report::write_report;
use crate::io::run_log::{RunPaths, allocate_run};
use crate::io::task_file::load_task;
use crate::io::usage::{ErrorEntry, PREVIEW_CHARS, UsageEntry, UsageLedger};
use crate::io::workspace::WorkspacePaths;

const HISTORY_SUMMARY_CHARS: usize = 120;

/// Inputs for a pipeline run.
#[derive(Debug, Clone, Copy)]
pub struct PipelineRequest<'a> {
    pub paths: &'a WorkspacePaths,
    pub config: &'a Config,
    pub task_path: &'a Path,
    /// Forced task format; sniffed from the file when `None`.
    pub format: Option<TaskFormat>,
}

/// Run the whole pipeline once.
///
/// Typed pipeline errors end the run early but still produce a report and
/// run metadata; the outcome then carries the halt. Anything else (a run log
/// that cannot be written, say) is returned as an error after a best-effort
/// report.
#[instrument(skip_all, fields(task = %request.task_path.display()))]
pub fn run_pipeline<L: LlmClient + ?Sized>(
    request: &PipelineRequest<'_>,
    llm: &L,
) -> Result<RunOutcome> {
    let started_at = Utc::now();
    let run = allocate_run(&request.paths.runs_dir, started_at)?;
    info!(run_id = %run.run_id, "run started");
    let mut outcome = RunOutcome::new(
        &run.run_id,
        started_at,
        &request.task_path.display().to_string(),
    );

    let result = drive(request, &run, llm, &mut outcome);
    let unexpected = match result {
        Ok(()) => None,
        Err(err) => match find_pipeline_error(&err) {
            Some(pipeline_err) => {
                warn!(kind = pipeline_err.kind(), error = %pipeline_err, "run halted");
                outcome.halt_with(pipeline_err);
                None
            }
            None => {
                outcome.halt = Some(Halt {
                    kind: "Internal".to_string(),
                    message: format!("{err:#}"),
                });
                Some(err)
            }
        },
    };

    outcome.finished_at = Utc::now();
    let finished = finish(request, &run, &outcome);
    if let Some(err) = unexpected {
        if let Err(report_err) = finished {
            warn!(error = %report_err, "report not written");
        }
        return Err(err);
    }
    finished?;
    info!(
        run_id = %outcome.run_id,
        status = ?outcome.status(),
        ops = outcome.operations.len(),
        "run finished"
    );
    Ok(outcome)
}

/// Everything up to the report. Returning early leaves the later stages of
/// `outcome` at their defaults.
fn drive<L: LlmClient + ?Sized>(
    request: &PipelineRequest<'_>,
    run: &RunPaths,
    llm: &L,
    outcome: &mut RunOutcome,
) -> Result<()> {
    let config = request.config;
    let task = load_task(request.task_path, request.format)?;
    outcome.task = Some(task.clone());

    let project_root = resolve_project(request.paths, config, &task)?;
    outcome.project_root = Some(project_root.display().to_string());

    let (bundle, prompt) = prepare_prompt(request.paths, config, &task, &project_root)?;
    run.write_prompt(&prompt.to_markdown())?;
    outcome.context = Some(summarize_context(&bundle, &prompt));

    let llm_request = LlmRequest {
        model: config.model.clone(),
        system: prompt.system.clone(),
        prompt: prompt.user.clone(),
        max_tokens: config.max_tokens,
        temperature: config.temperature,
    };
    let ledger = UsageLedger::new(&request.paths.usage_dir);
    let reply = match llm.complete(&llm_request) {
        Ok(reply) => reply,
        Err(err) => {
            let err = as_llm_error(err);
            let entry = ErrorEntry {
                timestamp: Utc::now(),
                run_id: run.run_id.clone(),
                project: task.project.clone(),
                model: config.model.clone(),
                error: format!("{err:#}"),
            };
            if let Err(ledger_err) = ledger.record_error(&entry) {
                warn!(error = %ledger_err, "error ledger not updated");
            }
            return Err(err);
        }
    };
    run.write_reply(&reply.text)?;

    let cost_usd = estimate_cost(
        &reply.usage,
        config.pricing.input_per_mtok,
        config.pricing.output_per_mtok,
    );
    let entry = UsageEntry {
        timestamp: Utc::now(),
        run_id: run.run_id.clone(),
        project: task.project.clone(),
        model: reply.model.clone(),
        input_tokens: reply.usage.input_tokens,
        output_tokens: reply.usage.output_tokens,
        cost_usd,
        duration_ms: reply.duration_ms,
        prompt_preview: preview(&prompt.user, PREVIEW_CHARS),
        response_preview: preview(&reply.text, PREVIEW_CHARS),
    };
    if let Err(err) = ledger.record(&entry) {
        warn!(error = %err, "usage ledger not updated");
    }
    outcome.call = Some(CallSummary {
        model: reply.model.clone(),
        usage: reply.usage,
        stop_reason: reply.stop_reason.clone(),
        duration_ms: reply.duration_ms,
        cost_usd,
    });

    let parsed = parse_reply(&reply.text);
    debug!(
        ops = parsed.operations.len(),
        block = parsed.block_found,
        "reply parsed"
    );
    outcome.analysis = Some(parsed.analysis);
    if let Some(issue) = &parsed.issue {
        warn!(issue = %issue, "reply block could not be parsed");
    }
    outcome.parse_issue = parsed.issue;

    if parsed.operations.is_empty() {
        let reason = if outcome.parse_issue.is_some() {
            "the operation block could not be parsed"
        } else {
            "the reply contained no file operations"
        };
        outcome.git = GitOutcome::Skipped {
            reason: reason.to_string(),
        };
        return Ok(());
    }

    let backup_dir = config
        .backups
        .then(|| request.paths.backup_dir(&run.run_id, &task.project));
    let apply = ApplyRequest {
        root: &project_root,
        task_text: &task.description,
        backup_dir: backup_dir.as_deref(),
    };
    let mut results = apply_operations(&apply, &parsed.operations);
    let all_verified = verify_results(&project_root, &mut results);
    outcome.operations = results;

    if !all_verified {
        let failed: Vec<_> = outcome.operations.iter().filter(|r| !r.success).collect();
        let kind = failed
            .first()
            .and_then(|r| r.error_kind.clone())
            .unwrap_or_else(|| "VerificationMismatch".to_string());
        outcome.git = GitOutcome::Skipped {
            reason: "one or more file operations failed".to_string(),
        };
        outcome.halt = Some(Halt {
            kind,
            message: format!(
                "{} of {} file operation(s) failed; commit blocked",
                failed.len(),
                outcome.operations.len()
            ),
        });
        return Ok(());
    }

    outcome.git = commit_stage(config, &task, &project_root, &outcome.operations);
    record_history(request.paths, run, &task, outcome);
    Ok(())
}

/// Remember a completed run that changed files, for the next prompt and
/// `devflow projects`. Failures only warn.
fn record_history(paths: &WorkspacePaths, run: &RunPaths, task: &Task, outcome: &RunOutcome) {
    let files = changed_paths(&outcome.operations);
    if files.is_empty() {
        return;
    }
    let commit = match &outcome.git {
        GitOutcome::Committed(record) => record.sha.clone(),
        _ => None,
    };
    let summary = task
        .description
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(|line| preview(line, HISTORY_SUMMARY_CHARS))
        .unwrap_or_default();
    let change = RecentChange {
        run_id: run.run_id.clone(),
        timestamp: Utc::now(),
        summary,
        files,
        commit,
    };
    if let Err(err) = record_change(&paths.history_path(&task.project), change) {
        warn!(error = %format!("{err:#}"), "project history not updated");
    }
}

fn commit_stage(
    config: &Config,
    task: &Task,
    project_root: &Path,
    results: &[crate::core::types::OperationResult],
) -> GitOutcome {
    if !task.auto_commit {
        return GitOutcome::Skipped {
            reason: "auto-commit was not requested".to_string(),
        };
    }
    let files = changed_paths(results);
    if files.is_empty() {
        return GitOutcome::Skipped {
            reason: "no file content changed".to_string(),
        };
    }
    let plan = CommitPlan::new(&task.project, files, task.auto_push, &config.git_remote);
    let git = Git::new(project_root, Duration::from_secs(config.git_timeout_secs));
    match git.apply_plan(&plan) {
        Ok(record) => GitOutcome::Committed(record),
        Err(err) => {
            warn!(error = %err, "commit failed");
            GitOutcome::Failed {
                message: err.to_string(),
            }
        }
    }
}

fn finish(request: &PipelineRequest<'_>, run: &RunPaths, outcome: &RunOutcome) -> Result<()> {
    run.write_meta(outcome)?;
    let report_path = request.config.report_path(&request.paths.root);
    write_report(&report_path, outcome, &request.config.pricing)
        .with_context(|| format!("write report {}", report_path.display()))
}

fn resolve_project(paths: &WorkspacePaths, config: &Config, task: &Task) -> Result<PathBuf> {
    let registry = ProjectRegistry::from_config(&paths.root, config);
    Ok(registry.resolve(&task.project)?)
}

fn prepare_prompt(
    paths: &WorkspacePaths,
    config: &Config,
    task: &Task,
    project_root: &Path,
) -> Result<(ContextBundle, PromptPack)> {
    let history_path = paths.history_path(&task.project);
    let bundle = assemble_context(&ContextRequest {
        task,
        project_root,
        config: &config.context,
        git_timeout: Duration::from_secs(config.git_timeout_secs),
        history_path: Some(&history_path),
    });
    for message in &bundle.omitted {
        debug!(message = %message, "context source omitted");
    }
    let prompt = PromptBuilder::new(config.context.prompt_budget_chars)
        .with_response_language(config.response_language.clone())
        .build(task, &bundle)?;
    if !prompt.dropped.is_empty() {
        info!(dropped = ?prompt.dropped, "prompt sections dropped to fit budget");
    }
    Ok((bundle, prompt))
}

fn summarize_context(bundle: &ContextBundle, prompt: &PromptPack) -> ContextSummary {
    ContextSummary {
        session_source: bundle.session.as_ref().map(|e| e.source.clone()),
        readme_source: bundle.readme.as_ref().map(|e| e.source.clone()),
        git_branch: bundle.git.as_ref().and_then(|g| g.branch.clone()),
        todos: bundle.todos.len(),
        targets: bundle
            .targets
            .iter()
            .map(|target| TargetSummary {
                path: target.path.clone(),
                kind: target.detection.kind,
                confidence: target.detection.confidence,
            })
            .collect(),
        omitted: bundle.omitted.clone(),
        dropped_sections: prompt.dropped.clone(),
        prompt_chars: char_len(&prompt.system) + char_len(&prompt.user),
    }
}

/// Make sure a client failure carries an `LlmCall` error in its chain.
fn as_llm_error(err: anyhow::Error) -> anyhow::Error {
    if find_pipeline_error(&err).is_some() {
        err
    } else {
        PipelineError::LlmCall(format!("{err:#}")).into()
    }
}

/// `devflow context`: parse, assemble and render the prompt without calling
/// the model or writing anything.
pub fn context_dry_run(
    paths: &WorkspacePaths,
    config: &Config,
    task_path: &Path,
    format: Option<TaskFormat>,
) -> Result<PromptPack> {
    let task = load_task(task_path, format)?;
    let project_root = resolve_project(paths, config, &task)?;
    let (_, prompt) = prepare_prompt(paths, config, &task, &project_root)?;
    Ok(prompt)
}
