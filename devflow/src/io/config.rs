//! Configuration stored under `.devflow/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Top-level configuration (TOML).
///
/// Intended to be edited by humans. Missing fields fall back to defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DevflowConfig {
    /// Ref that story branches are created from when a work item has none.
    pub base_ref: String,

    /// Directory (relative to the repository root) that holds story worktrees.
    pub worktrees_dir: PathBuf,

    /// Failed attempts after which a story is marked blocked.
    pub max_story_attempts: u32,

    /// Concurrent workers used by `devflow run`.
    pub workers: usize,

    pub provider: ProviderConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProviderConfig {
    /// Command that receives the prompt on stdin (e.g. `["codex","exec","-"]`).
    pub command: Vec<String>,

    /// Wall-clock budget for one provider call.
    pub timeout_secs: u64,

    /// Retries after a transient failure (0 disables retrying).
    pub max_retries: u32,

    pub initial_backoff_ms: u64,

    pub max_backoff_ms: u64,

    /// Truncate captured provider output beyond this many bytes.
    pub output_limit_bytes: usize,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            command: vec!["codex".to_string(), "exec".to_string(), "-".to_string()],
            timeout_secs: 30 * 60,
            max_retries: 3,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 60_000,
            output_limit_bytes: 100_000,
        }
    }
}

impl ProviderConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for DevflowConfig {
    fn default() -> Self {
        Self {
            base_ref: "main".to_string(),
            worktrees_dir: PathBuf::from(".devflow/worktrees"),
            max_story_attempts: 3,
            workers: 2,
            provider: ProviderConfig::default(),
        }
    }
}

impl DevflowConfig {
    pub fn validate(&self) -> Result<()> {
        if self.base_ref.trim().is_empty() {
            return Err(anyhow!("base_ref must not be empty"));
        }
        if self.max_story_attempts == 0 {
            return Err(anyhow!("max_story_attempts must be > 0"));
        }
        if self.workers == 0 {
            return Err(anyhow!("workers must be > 0"));
        }
        if self.provider.timeout_secs == 0 {
            return Err(anyhow!("provider.timeout_secs must be > 0"));
        }
        if self.provider.output_limit_bytes == 0 {
            return Err(anyhow!("provider.output_limit_bytes must be > 0"));
        }
        if self.provider.max_backoff_ms < self.provider.initial_backoff_ms {
            return Err(anyhow!(
                "provider.max_backoff_ms must be >= provider.initial_backoff_ms"
            ));
        }
        if self.provider.command.is_empty() || self.provider.command[0].trim().is_empty() {
            return Err(anyhow!("provider.command must be a non-empty array"));
        }
        Ok(())
    }

    /// Worktree directory resolved against the repository root.
    pub fn worktrees_root(&self, root: &Path) -> PathBuf {
        root.join(&self.worktrees_dir)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `DevflowConfig::default()`.
pub fn load_config(path: &Path) -> Result<DevflowConfig> {
    if !path.exists() {
        let cfg = DevflowConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: DevflowConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &DevflowConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    super::write_atomic(path, &buf)
}
