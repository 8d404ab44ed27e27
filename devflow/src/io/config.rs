//! Workspace configuration stored in `devflow.toml`, plus the API key.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::io::atomic::write_atomic_str;

pub const CONFIG_FILE: &str = "devflow.toml";
pub const API_KEY_VAR: &str = "ANTHROPIC_API_KEY";

/// devflow configuration (TOML).
///
/// Edited by hand; every field has a default so a missing file or a partial
/// file both work.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Directory holding one sub-directory per project id.
    pub projects_root: PathBuf,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: Option<f32>,
    /// Language the analysis part of the reply should be written in.
    pub response_language: Option<String>,
    /// Report path, relative to the workspace unless absolute.
    pub report_file: PathBuf,
    /// Copy files aside before MODIFY/DELETE.
    pub backups: bool,
    pub git_remote: String,
    pub git_timeout_secs: u64,
    pub context: ContextConfig,
    pub llm: LlmConfig,
    pub pricing: PricingConfig,
    /// Explicit project id -> directory overrides.
    pub projects: BTreeMap<String, PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ContextConfig {
    pub session_chars: usize,
    pub readme_chars: usize,
    pub max_changed_files: usize,
    pub max_todos: usize,
    pub max_file_bytes: u64,
    pub prompt_budget_chars: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LlmConfig {
    pub api_url: String,
    pub request_timeout_secs: u64,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PricingConfig {
    /// USD per million input tokens.
    pub input_per_mtok: f64,
    /// USD per million output tokens.
    pub output_per_mtok: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            projects_root: PathBuf::from("projects"),
            model: "claude-sonnet-4-5-20250929".to_string(),
            max_tokens: 8000,
            temperature: None,
            response_language: None,
            report_file: PathBuf::from("response.md"),
            backups: true,
            git_remote: "origin".to_string(),
            git_timeout_secs: 120,
            context: ContextConfig::default(),
            llm: LlmConfig::default(),
            pricing: PricingConfig::default(),
            projects: BTreeMap::new(),
        }
    }
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            session_chars: 3000,
            readme_chars: 2000,
            max_changed_files: 20,
            max_todos: 10,
            max_file_bytes: 500 * 1024,
            prompt_budget_chars: 24_000,
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.anthropic.com/v1/messages".to_string(),
            request_timeout_secs: 300,
            max_retries: 2,
            retry_backoff_ms: 1000,
        }
    }
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            input_per_mtok: 3.0,
            output_per_mtok: 15.0,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.model.trim().is_empty() {
            return Err(anyhow!("model must not be empty"));
        }
        if self.max_tokens == 0 {
            return Err(anyhow!("max_tokens must be > 0"));
        }
        if let Some(t) = self.temperature
            && !(0.0..=1.0).contains(&t)
        {
            return Err(anyhow!("temperature must be within 0.0..=1.0 (got {t})"));
        }
        if self.git_remote.trim().is_empty() || self.git_remote.starts_with('-') {
            return Err(anyhow!("git_remote must be a remote name"));
        }
        if self.git_timeout_secs == 0 {
            return Err(anyhow!("git_timeout_secs must be > 0"));
        }
        if self.context.prompt_budget_chars == 0 {
            return Err(anyhow!("context.prompt_budget_chars must be > 0"));
        }
        if self.llm.api_url.trim().is_empty() {
            return Err(anyhow!("llm.api_url must not be empty"));
        }
        if self.llm.request_timeout_secs == 0 {
            return Err(anyhow!("llm.request_timeout_secs must be > 0"));
        }
        if self.pricing.input_per_mtok < 0.0 || self.pricing.output_per_mtok < 0.0 {
            return Err(anyhow!("pricing must not be negative"));
        }
        Ok(())
    }

    /// Resolve a configured path against the workspace root.
    pub fn resolve(workspace: &Path, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            workspace.join(path)
        }
    }

    pub fn report_path(&self, workspace: &Path) -> PathBuf {
        Self::resolve(workspace, &self.report_file)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `Config::default()`.
pub fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        debug!(path = %path.display(), "config missing, using defaults");
        let cfg = Config::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: Config =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &Config) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic_str(path, &buf)
}

/// Anthropic API key. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiKey(String);

impl ApiKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Read the key from the process environment, falling back to the
    /// workspace `.env` file. The process environment is never modified.
    pub fn from_env(env_file: &Path) -> Result<Self> {
        if let Ok(key) = std::env::var(API_KEY_VAR)
            && !key.trim().is_empty()
        {
            return Ok(Self(key.trim().to_string()));
        }
        if env_file.exists() {
            let entries = dotenvy::from_path_iter(env_file)
                .with_context(|| format!("read {}", env_file.display()))?;
            for entry in entries {
                let (name, value) =
                    entry.with_context(|| format!("parse {}", env_file.display()))?;
                if name == API_KEY_VAR && !value.trim().is_empty() {
                    debug!(path = %env_file.display(), "api key loaded from env file");
                    return Ok(Self(value.trim().to_string()));
                }
            }
        }
        Err(anyhow!(
            "{API_KEY_VAR} is not set (export it or add it to {})",
            env_file.display()
        ))
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ApiKey(***)")
    }
}
