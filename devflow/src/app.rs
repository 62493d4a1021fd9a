//! Collaborators wired together for one repository.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Result;

use crate::io::board_store::{BoardStore, JsonBoardStore};
use crate::io::config::{DevflowConfig, load_config};
use crate::io::execution_log::{ExecutionLog, JsonlLogSink, LogSink};
use crate::io::git::{Git, Vcs};
use crate::io::init::DevflowPaths;
use crate::io::provider::{CommandProvider, Provider};
use crate::io::retry::RetryPolicy;
use crate::io::workspace::WorkspaceOrchestrator;
use crate::scheduler::Scheduler;

pub struct App {
    pub root: PathBuf,
    pub config: DevflowConfig,
    pub scheduler: Scheduler,
    pub workspaces: Arc<WorkspaceOrchestrator>,
    pub provider: Arc<dyn Provider>,
    pub retry: RetryPolicy,
}

/// Swappable side-effecting collaborators.
pub struct Parts {
    pub store: Arc<dyn BoardStore>,
    pub sink: Arc<dyn LogSink>,
    pub vcs: Arc<dyn Vcs>,
    pub provider: Arc<dyn Provider>,
}

impl App {
    /// Open an initialized repository with the real git, file and command backends.
    pub fn open(root: &Path) -> Result<Self> {
        let paths = DevflowPaths::new(root);
        paths.ensure_initialized()?;
        let config = load_config(&paths.config_path)?;
        let parts = Parts {
            store: Arc::new(JsonBoardStore::new(&paths.board_path)),
            sink: Arc::new(JsonlLogSink::new(&paths.log_path)),
            vcs: Arc::new(Git::new(root)),
            provider: Arc::new(CommandProvider::new(&config.provider)),
        };
        Self::with_parts(root, config, parts)
    }

    pub fn with_parts(root: &Path, config: DevflowConfig, parts: Parts) -> Result<Self> {
        let log = Arc::new(Mutex::new(ExecutionLog::open(parts.sink)?));
        let scheduler = Scheduler::open(parts.store, log.clone(), config.max_story_attempts)?;
        let workspaces = Arc::new(WorkspaceOrchestrator::new(
            parts.vcs,
            log,
            config.worktrees_root(root),
            config.base_ref.clone(),
        ));
        Ok(Self {
            root: root.to_path_buf(),
            retry: RetryPolicy::from_config(&config.provider),
            config,
            scheduler,
            workspaces,
            provider: parts.provider,
        })
    }

    pub fn log(&self) -> &Arc<Mutex<ExecutionLog>> {
        self.scheduler.log()
    }
}
