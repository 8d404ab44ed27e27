//! Test-only helpers: scripted LLM clients and throwaway workspaces with a
//! git-backed project.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Result, anyhow};
use tempfile::TempDir;

use crate::core::types::TokenUsage;
use crate::io::config::Config;
use crate::io::llm::{LlmClient, LlmReply, LlmRequest};
use crate::io::workspace::WorkspacePaths;
use crate::pipeline::PipelineRequest;

pub const SCRIPTED_MODEL: &str = "scripted-model";

/// Replays canned replies in order and records every request it sees.
pub struct ScriptedLlm {
    replies: RefCell<VecDeque<String>>,
    requests: RefCell<Vec<LlmRequest>>,
}

impl ScriptedLlm {
    pub fn new(replies: &[&str]) -> Self {
        Self {
            replies: RefCell::new(replies.iter().map(|r| r.to_string()).collect()),
            requests: RefCell::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.requests.borrow().len()
    }

    pub fn requests(&self) -> Vec<LlmRequest> {
        self.requests.borrow().clone()
    }

    /// User prompt of the most recent request.
    pub fn last_prompt(&self) -> Option<String> {
        self.requests.borrow().last().map(|r| r.prompt.clone())
    }
}

impl LlmClient for ScriptedLlm {
    fn complete(&self, request: &LlmRequest) -> Result<LlmReply> {
        self.requests.borrow_mut().push(request.clone());
        let text = self
            .replies
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| anyhow!("scripted LLM has no reply left"))?;
        Ok(LlmReply {
            text,
            model: SCRIPTED_MODEL.to_string(),
            usage: TokenUsage {
                input_tokens: 1_000,
                output_tokens: 200,
            },
            stop_reason: Some("end_turn".to_string()),
            duration_ms: 5,
        })
    }
}

/// Always fails with the given message.
pub struct FailingLlm {
    message: String,
}

impl FailingLlm {
    pub fn new(message: &str) -> Self {
        Self {
            message: message.to_string(),
        }
    }
}

impl LlmClient for FailingLlm {
    fn complete(&self, _request: &LlmRequest) -> Result<LlmReply> {
        Err(anyhow!("{}", self.message))
    }
}

/// Temporary workspace with one project under `projects/<id>`, initialized
/// as a git repo with one commit.
pub struct TestWorkspace {
    _temp: TempDir,
    pub paths: WorkspacePaths,
    pub config: Config,
    pub project: String,
    task_path: PathBuf,
}

impl TestWorkspace {
    pub fn new(project: &str) -> Self {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = WorkspacePaths::new(temp.path());
        let config = Config {
            git_timeout_secs: 30,
            ..Config::default()
        };
        let task_path = paths.task_path(None);
        let ws = Self {
            _temp: temp,
            paths,
            config,
            project: project.to_string(),
            task_path,
        };
        let root = ws.project_root();
        fs::create_dir_all(&root).expect("project dir");
        ws.git(&["init", "-q"]);
        ws.git(&["config", "user.name", "devflow tests"]);
        ws.git(&["config", "user.email", "devflow@example.invalid"]);
        ws.git(&["config", "commit.gpgsign", "false"]);
        ws.write_project_file("README.md", &format!("# {project}\n"));
        ws.git(&["add", "-A"]);
        ws.git(&["commit", "-q", "-m", "initial"]);
        ws
    }

    pub fn root(&self) -> &Path {
        &self.paths.root
    }

    pub fn project_root(&self) -> PathBuf {
        self.paths.root.join("projects").join(&self.project)
    }

    pub fn task_path(&self) -> PathBuf {
        self.task_path.clone()
    }

    pub fn write_task(&self, contents: &str) {
        fs::write(&self.task_path, contents).expect("write task");
    }

    pub fn write_project_file(&self, relative: &str, contents: &str) {
        let path = self.project_root().join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent");
        }
        fs::write(&path, contents).expect("write project file");
    }

    pub fn read_project_file(&self, relative: &str) -> String {
        fs::read_to_string(self.project_root().join(relative)).expect("read project file")
    }

    /// Commit everything currently in the project tree.
    pub fn commit_all(&self, message: &str) {
        self.git(&["add", "-A"]);
        self.git(&["commit", "-q", "-m", message]);
    }

    pub fn request(&self) -> PipelineRequest<'_> {
        PipelineRequest {
            paths: &self.paths,
            config: &self.config,
            task_path: &self.task_path,
            format: None,
        }
    }

    pub fn report(&self) -> String {
        fs::read_to_string(self.config.report_path(&self.paths.root)).expect("read report")
    }

    /// Run git in the project and return trimmed stdout; panics on failure.
    pub fn git(&self, args: &[&str]) -> String {
        let output = Command::new("git")
            .args(args)
            .current_dir(self.project_root())
            .env("GIT_TERMINAL_PROMPT", "0")
            .output()
            .expect("spawn git");
        assert!(
            output.status.success(),
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    }

    pub fn commit_count(&self) -> usize {
        self.git(&["rev-list", "--count", "HEAD"])
            .parse()
            .expect("commit count")
    }
}
