//! Canonical paths and `.devflow/` scaffolding.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};

use super::board_store::{BoardStore, JsonBoardStore};
use super::config::{DevflowConfig, write_config};
use crate::core::board::Board;

/// All canonical paths within `.devflow/` for a repository root.
#[derive(Debug, Clone)]
pub struct DevflowPaths {
    pub root: PathBuf,
    pub devflow_dir: PathBuf,
    pub state_dir: PathBuf,
    pub gitignore_path: PathBuf,
    pub config_path: PathBuf,
    pub board_path: PathBuf,
    pub log_path: PathBuf,
}

impl DevflowPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let devflow_dir = root.join(".devflow");
        let state_dir = devflow_dir.join("state");
        Self {
            root: root.clone(),
            devflow_dir: devflow_dir.clone(),
            state_dir: state_dir.clone(),
            gitignore_path: devflow_dir.join(".gitignore"),
            config_path: devflow_dir.join("config.toml"),
            board_path: state_dir.join("board.json"),
            log_path: state_dir.join("execution_log.jsonl"),
        }
    }

    /// Fail unless `init` has been run for this root.
    pub fn ensure_initialized(&self) -> Result<()> {
        if !self.board_path.is_file() {
            return Err(anyhow!(
                "{} not found (run `devflow init` first)",
                self.board_path.display()
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct InitOptions {
    /// If true, overwrite an existing config and empty board.
    pub force: bool,
}

/// Create `.devflow/` scaffolding in `root`.
///
/// Fails if `.devflow/` already exists unless `options.force` is set.
pub fn init_devflow(root: &Path, options: &InitOptions) -> Result<DevflowPaths> {
    let paths = DevflowPaths::new(root);
    if paths.devflow_dir.exists() && !paths.devflow_dir.is_dir() {
        return Err(anyhow!("devflow init: .devflow exists but is not a directory"));
    }
    if paths.devflow_dir.exists() && !options.force {
        return Err(anyhow!(
            "devflow init: .devflow already exists (use --force to overwrite)"
        ));
    }

    fs::create_dir_all(&paths.state_dir)
        .with_context(|| format!("create directory {}", paths.state_dir.display()))?;
    fs::write(&paths.gitignore_path, DEVFLOW_GITIGNORE)
        .with_context(|| format!("write file {}", paths.gitignore_path.display()))?;
    write_config(&paths.config_path, &DevflowConfig::default())?;
    JsonBoardStore::new(&paths.board_path).commit(&Board::default())?;
    fs::write(&paths.log_path, "")
        .with_context(|| format!("write file {}", paths.log_path.display()))?;

    Ok(paths)
}

const DEVFLOW_GITIGNORE: &str = "state/\nworktrees/\n";
