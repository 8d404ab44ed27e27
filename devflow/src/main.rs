//! devflow: task file in, verified file changes and a report out.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand, ValueEnum};

use devflow::core::outcome::RunStatus;
use devflow::core::task::TaskFormat;
use devflow::exit_codes;
use devflow::io::config::load_config;
use devflow::io::init::{InitOptions, init_workspace};
use devflow::io::llm::DeferredAnthropicClient;
use devflow::io::registry::{ProjectRegistry, ProjectSource, ProjectSummary, summarize_project};
use devflow::io::task_file::load_task;
use devflow::io::usage::UsageLedger;
use devflow::io::workspace::WorkspacePaths;
use devflow::logging;
use devflow::pipeline::{PipelineRequest, context_dry_run, run_pipeline};
use devflow::watch::watch_task;

#[derive(Parser)]
#[command(
    name = "devflow",
    version,
    about = "Apply a task file to a project through an LLM, then verify, commit and report"
)]
struct Cli {
    /// Workspace holding devflow.toml, task.md and the projects directory.
    #[arg(long, global = true, default_value = ".")]
    workspace: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the pipeline once and write the report.
    Run {
        /// Task file (default: task.md in the workspace).
        #[arg(long)]
        task: Option<PathBuf>,
        #[arg(long, value_enum)]
        format: Option<FormatArg>,
    },
    /// Print the prompt a run would send. No LLM call, no writes.
    Context {
        #[arg(long)]
        task: Option<PathBuf>,
        #[arg(long, value_enum)]
        format: Option<FormatArg>,
    },
    /// Parse a task file and print it as JSON.
    Parse {
        file: PathBuf,
        #[arg(long, value_enum)]
        format: Option<FormatArg>,
    },
    /// Summarize one day of API usage.
    Usage {
        /// Day to summarize, YYYY-MM-DD (default: today, UTC).
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Rerun the pipeline whenever the task file content changes.
    Watch {
        #[arg(long)]
        task: Option<PathBuf>,
        #[arg(long, value_enum)]
        format: Option<FormatArg>,
        #[arg(long, default_value_t = 1000)]
        interval_ms: u64,
    },
    /// List known projects, or show one project's recent devflow changes.
    Projects {
        /// Project id to show in detail.
        id: Option<String>,
    },
    /// Create devflow.toml, task.md, .env.example and .gitignore.
    Init {
        /// Overwrite existing files.
        #[arg(short, long)]
        force: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum FormatArg {
    Markdown,
    Yaml,
}

impl From<FormatArg> for TaskFormat {
    fn from(arg: FormatArg) -> Self {
        match arg {
            FormatArg::Markdown => TaskFormat::Markdown,
            FormatArg::Yaml => TaskFormat::Yaml,
        }
    }
}

fn main() {
    logging::init();
    let code = match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{:#}", err);
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let workspace = cli.workspace;
    match cli.command {
        Command::Run { task, format } => cmd_run(&workspace, task.as_deref(), format),
        Command::Context { task, format } => cmd_context(&workspace, task.as_deref(), format),
        Command::Parse { file, format } => cmd_parse(&file, format),
        Command::Usage { date } => cmd_usage(&workspace, date),
        Command::Watch {
            task,
            format,
            interval_ms,
        } => cmd_watch(&workspace, task.as_deref(), format, interval_ms),
        Command::Projects { id } => cmd_projects(&workspace, id.as_deref()),
        Command::Init { force } => cmd_init(&workspace, force),
    }
}

fn cmd_run(workspace: &Path, task: Option<&Path>, format: Option<FormatArg>) -> Result<i32> {
    let paths = WorkspacePaths::new(workspace);
    let config = load_config(&paths.config_path)?;
    let task_path = paths.task_path(task);
    let client = DeferredAnthropicClient::new(&config.llm, &paths.env_path);
    let request = PipelineRequest {
        paths: &paths,
        config: &config,
        task_path: &task_path,
        format: format.map(TaskFormat::from),
    };

    let outcome = run_pipeline(&request, &client)?;
    let counts = outcome.counts();
    println!(
        "{}: {} (created {}, modified {}, deleted {}, errors {})",
        outcome.run_id,
        match outcome.status() {
            RunStatus::Completed => "completed",
            RunStatus::Halted => "halted",
        },
        counts.created,
        counts.modified,
        counts.deleted,
        counts.errors
    );
    println!("report: {}", config.report_path(&paths.root).display());
    Ok(match outcome.status() {
        RunStatus::Completed => exit_codes::OK,
        RunStatus::Halted => exit_codes::HALTED,
    })
}

fn cmd_context(workspace: &Path, task: Option<&Path>, format: Option<FormatArg>) -> Result<i32> {
    let paths = WorkspacePaths::new(workspace);
    let config = load_config(&paths.config_path)?;
    let prompt = context_dry_run(
        &paths,
        &config,
        &paths.task_path(task),
        format.map(TaskFormat::from),
    )?;
    print!("{}", prompt.to_markdown());
    if !prompt.dropped.is_empty() {
        eprintln!("dropped to fit budget: {}", prompt.dropped.join(", "));
    }
    Ok(exit_codes::OK)
}

fn cmd_parse(file: &Path, format: Option<FormatArg>) -> Result<i32> {
    let task = load_task(file, format.map(TaskFormat::from))?;
    let json = serde_json::to_string_pretty(&task).context("serialize task")?;
    println!("{json}");
    Ok(exit_codes::OK)
}

fn cmd_usage(workspace: &Path, date: Option<NaiveDate>) -> Result<i32> {
    let paths = WorkspacePaths::new(workspace);
    let date = date.unwrap_or_else(|| Utc::now().date_naive());
    let summary = UsageLedger::new(&paths.usage_dir).daily_summary(date)?;
    println!("date: {date}");
    println!("calls: {}", summary.calls);
    println!("errors: {}", summary.errors);
    println!("input tokens: {}", summary.input_tokens);
    println!("output tokens: {}", summary.output_tokens);
    println!("cost: ${:.4}", summary.cost_usd);
    Ok(exit_codes::OK)
}

fn cmd_watch(
    workspace: &Path,
    task: Option<&Path>,
    format: Option<FormatArg>,
    interval_ms: u64,
) -> Result<i32> {
    let paths = WorkspacePaths::new(workspace);
    let config = load_config(&paths.config_path)?;
    let task_path = paths.task_path(task);
    let client = DeferredAnthropicClient::new(&config.llm, &paths.env_path);
    let request = PipelineRequest {
        paths: &paths,
        config: &config,
        task_path: &task_path,
        format: format.map(TaskFormat::from),
    };
    eprintln!("watching {} (ctrl-c to stop)", task_path.display());
    watch_task(&request, &client, Duration::from_millis(interval_ms.max(50)))?;
    Ok(exit_codes::OK)
}

fn cmd_projects(workspace: &Path, id: Option<&str>) -> Result<i32> {
    let paths = WorkspacePaths::new(workspace);
    let config = load_config(&paths.config_path)?;
    let timeout = Duration::from_secs(config.git_timeout_secs);
    let entries = ProjectRegistry::from_config(&paths.root, &config).list()?;

    if let Some(id) = id {
        let entry = entries
            .into_iter()
            .find(|entry| entry.id == id)
            .with_context(|| format!("unknown project '{id}'"))?;
        let summary = summarize_project(entry, &paths.history_path(id), timeout)?;
        println!("{}", project_line(&summary));
        if summary.history.recent_changes.is_empty() {
            println!("no recorded changes");
        }
        for change in &summary.history.recent_changes {
            println!(
                "  {} {} [{}] {}{}",
                change.timestamp.format("%Y-%m-%d %H:%M"),
                change.run_id,
                change.files.join(", "),
                change.summary,
                change
                    .commit
                    .as_deref()
                    .map(|sha| format!(" ({sha})"))
                    .unwrap_or_default()
            );
        }
        return Ok(exit_codes::OK);
    }

    let total = entries.len();
    let configured = entries
        .iter()
        .filter(|entry| entry.source == ProjectSource::Configured)
        .count();
    for entry in entries {
        let history_path = paths.history_path(&entry.id);
        let summary = summarize_project(entry, &history_path, timeout)?;
        println!("{}", project_line(&summary));
    }
    println!(
        "{total} project(s): {configured} configured, {} discovered",
        total - configured
    );
    Ok(exit_codes::OK)
}

fn project_line(summary: &ProjectSummary) -> String {
    let entry = &summary.entry;
    let git = match (&summary.branch, summary.is_repo) {
        (Some(branch), _) => format!("git:{branch}"),
        (None, true) => "git:(detached)".to_string(),
        (None, false) => "no git".to_string(),
    };
    let last = summary
        .history
        .last_change()
        .map(|change| format!(", last {}", change.timestamp.format("%Y-%m-%d %H:%M")))
        .unwrap_or_default();
    format!(
        "{}\t{}{}\t{}\tchanges: {}{}",
        entry.id,
        entry.path.display(),
        if entry.exists { "" } else { " (missing)" },
        git,
        summary.history.recent_changes.len(),
        last
    )
}

fn cmd_init(workspace: &Path, force: bool) -> Result<i32> {
    let report = init_workspace(workspace, &InitOptions { force })?;
    for name in &report.written {
        println!("wrote {name}");
    }
    for name in &report.kept {
        println!("kept {name}");
    }
    Ok(exit_codes::OK)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_init() {
        let cli = Cli::parse_from(["devflow", "init"]);
        assert!(matches!(cli.command, Command::Init { force: false }));
        assert_eq!(cli.workspace, PathBuf::from("."));
    }

    #[test]
    fn parse_init_force() {
        let cli = Cli::parse_from(["devflow", "init", "--force"]);
        assert!(matches!(cli.command, Command::Init { force: true }));
    }

    #[test]
    fn parse_run_with_workspace_task_and_format() {
        let cli = Cli::parse_from([
            "devflow",
            "run",
            "--workspace",
            "/ws",
            "--task",
            "tasks/next.yaml",
            "--format",
            "yaml",
        ]);
        assert_eq!(cli.workspace, PathBuf::from("/ws"));
        match cli.command {
            Command::Run { task, format } => {
                assert_eq!(task, Some(PathBuf::from("tasks/next.yaml")));
                assert_eq!(format.map(TaskFormat::from), Some(TaskFormat::Yaml));
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn parse_usage_date() {
        let cli = Cli::parse_from(["devflow", "usage", "--date", "2025-03-04"]);
        match cli.command {
            Command::Usage { date } => {
                assert_eq!(date, NaiveDate::from_ymd_opt(2025, 3, 4));
            }
            _ => panic!("expected usage"),
        }
    }

    #[test]
    fn parse_watch_defaults_interval() {
        let cli = Cli::parse_from(["devflow", "watch"]);
        assert!(matches!(
            cli.command,
            Command::Watch {
                interval_ms: 1000,
                task: None,
                format: None
            }
        ));
    }

    #[test]
    fn parse_projects_with_and_without_id() {
        let cli = Cli::parse_from(["devflow", "projects"]);
        assert!(matches!(cli.command, Command::Projects { id: None }));
        let cli = Cli::parse_from(["devflow", "projects", "demo"]);
        match cli.command {
            Command::Projects { id } => assert_eq!(id.as_deref(), Some("demo")),
            _ => panic!("expected projects"),
        }
    }

    #[test]
    fn rejects_unknown_format() {
        assert!(Cli::try_parse_from(["devflow", "parse", "t.md", "--format", "json"]).is_err());
    }
}
