//! Per-story branch + worktree lifecycle.
//!
//! Every story runs in its own worktree on its own branch, so independent
//! stories never share a working tree. Branch names are derived from ids and
//! never from titles.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, LazyLock, Mutex, MutexGuard};

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use regex::Regex;
use tracing::{debug, info, instrument, warn};

use super::execution_log::{ExecutionLog, LogRecord};
use super::git::Vcs;
use crate::core::error::Error;
use crate::core::types::{DeveloperStory, LogEvent, StoryId, WorkItem};

static BRANCH_NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]*(/[A-Za-z0-9][A-Za-z0-9._-]*)*$")
        .expect("branch name regex")
});

/// An active, provisioned workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceHandle {
    pub story: StoryId,
    pub branch: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseMode {
    /// Execution succeeded: drop the worktree, keep the branch.
    Success,
    /// Execution failed or was cancelled: keep everything for inspection.
    Preserve,
    /// Explicit cleanup after a failure: drop the worktree.
    Cleanup,
}

impl ReleaseMode {
    fn as_str(self) -> &'static str {
        match self {
            ReleaseMode::Success => "success",
            ReleaseMode::Preserve => "preserve",
            ReleaseMode::Cleanup => "cleanup",
        }
    }
}

pub struct WorkspaceOrchestrator {
    vcs: Arc<dyn Vcs>,
    log: Arc<Mutex<ExecutionLog>>,
    worktrees_root: PathBuf,
    default_base_ref: String,
    active: Mutex<HashMap<PathBuf, StoryId>>,
}

impl WorkspaceOrchestrator {
    pub fn new(
        vcs: Arc<dyn Vcs>,
        log: Arc<Mutex<ExecutionLog>>,
        worktrees_root: impl Into<PathBuf>,
        default_base_ref: impl Into<String>,
    ) -> Self {
        Self {
            vcs,
            log,
            worktrees_root: worktrees_root.into(),
            default_base_ref: default_base_ref.into(),
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Branch a story runs on: its validated override, else `{prefix}-{work item}-{story}`.
    pub fn branch_name(work_item: &WorkItem, story: &DeveloperStory) -> Result<String> {
        match &story.branch_override {
            Some(name) => {
                validate_branch_name(name)?;
                Ok(name.clone())
            }
            None => Ok(format!("{}-{}", work_item.default_branch_name(), story.id())),
        }
    }

    pub fn worktree_path(&self, branch: &str) -> PathBuf {
        self.worktrees_root.join(branch)
    }

    /// Create (or re-attach) the branch and worktree for `story`.
    ///
    /// Never retried here: a failure surfaces to the caller as a typed fault.
    #[instrument(skip_all, fields(story = %story.id()))]
    pub fn provision(
        &self,
        work_item: &WorkItem,
        story: &DeveloperStory,
    ) -> Result<WorkspaceHandle, Error> {
        let story_id = story.id();
        let branch = Self::branch_name(work_item, story)
            .map_err(|err| provision_failed(story_id, err))?;
        let path = self.worktree_path(&branch);
        {
            let mut active = self.active().map_err(|err| provision_failed(story_id, err))?;
            if let Some(owner) = active.get(&path) {
                return Err(provision_failed(
                    story_id,
                    anyhow!("workspace {} already active for story {owner}", path.display()),
                ));
            }
            active.insert(path.clone(), story_id);
        }
        let handle = WorkspaceHandle {
            story: story_id,
            branch,
            path,
        };
        let base_ref = work_item
            .base_ref
            .as_deref()
            .unwrap_or(&self.default_base_ref);
        match self.attach(&handle, base_ref) {
            Ok(()) => Ok(handle),
            Err(err) => {
                if let Ok(mut active) = self.active() {
                    active.remove(&handle.path);
                }
                Err(err)
            }
        }
    }

    fn attach(&self, handle: &WorkspaceHandle, base_ref: &str) -> Result<(), Error> {
        let story = handle.story;
        let exists = self
            .vcs
            .branch_exists(&handle.branch)
            .map_err(|err| provision_failed(story, err))?;
        if exists {
            let owned = self
                .log_handle()
                .map_err(|err| provision_failed(story, err))?
                .story_created_branch(story, &handle.branch);
            if !owned {
                return Err(Error::BranchAlreadyExists {
                    story,
                    branch: handle.branch.clone(),
                });
            }
            debug!(branch = %handle.branch, "reusing branch from a prior run");
        } else {
            self.vcs
                .create_branch(&handle.branch, base_ref)
                .map_err(|err| provision_failed(story, err))?;
            self.log_handle()
                .map_err(|err| provision_failed(story, err))?
                .record(
                    LogRecord::new(story, LogEvent::BranchCreated)
                        .details(format!("created {} from {base_ref}", handle.branch))
                        .meta("branch", handle.branch.as_str())
                        .meta("base_ref", base_ref),
                    Utc::now(),
                );
        }

        if handle.path.exists() {
            // Only a worktree this story attached earlier, on a branch it
            // already owned, may be picked up again.
            let live = self
                .log_handle()
                .map_err(|err| provision_failed(story, err))?
                .live_worktree(story);
            let ours = exists
                && live.is_some_and(|(branch, path)| branch == handle.branch && path == handle.path);
            if !ours {
                return Err(provision_failed(
                    story,
                    anyhow!(
                        "{} exists but is not this story's worktree of branch {}",
                        handle.path.display(),
                        handle.branch
                    ),
                ));
            }
            debug!(path = %handle.path.display(), "worktree already attached");
            return Ok(());
        }
        if let Some(parent) = handle.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))
                .map_err(|err| provision_failed(story, err))?;
        }
        self.vcs
            .create_worktree(&handle.branch, &handle.path)
            .map_err(|err| provision_failed(story, err))?;
        self.log_handle()
            .map_err(|err| provision_failed(story, err))?
            .record(
                LogRecord::new(story, LogEvent::WorktreeCreated)
                    .details(handle.path.display().to_string())
                    .meta("branch", handle.branch.as_str())
                    .meta("path", handle.path.display().to_string()),
                Utc::now(),
            );
        info!(branch = %handle.branch, path = %handle.path.display(), "workspace provisioned");
        Ok(())
    }

    /// Register a workspace provisioned by an earlier process so it can be released.
    pub fn adopt(&self, handle: &WorkspaceHandle) -> Result<()> {
        self.active()?.insert(handle.path.clone(), handle.story);
        Ok(())
    }

    /// Tear down or preserve a workspace. Returns false if `handle` was not active.
    #[instrument(skip_all, fields(story = %handle.story, mode = mode.as_str()))]
    pub fn release(&self, handle: &WorkspaceHandle, mode: ReleaseMode) -> Result<bool> {
        let removed = self.active()?.remove(&handle.path);
        if removed.is_none() {
            debug!("release of inactive workspace ignored");
            return Ok(false);
        }

        match mode {
            ReleaseMode::Success | ReleaseMode::Cleanup => {
                if handle.path.exists() {
                    if let Err(err) = self.vcs.remove_worktree(&handle.path) {
                        warn!(err = %format!("{err:#}"), "worktree removal failed");
                        self.adopt(handle)?;
                        return Err(err)
                            .with_context(|| format!("remove worktree {}", handle.path.display()));
                    }
                }
                self.log_handle()?.record(
                    LogRecord::new(handle.story, LogEvent::WorktreeRemoved)
                        .details(handle.path.display().to_string())
                        .meta("mode", mode.as_str())
                        .meta("branch", handle.branch.as_str()),
                    Utc::now(),
                );
            }
            ReleaseMode::Preserve => {
                self.log_handle()?.record(
                    LogRecord::new(handle.story, LogEvent::Info)
                        .details(format!("workspace preserved at {}", handle.path.display()))
                        .meta("mode", mode.as_str())
                        .meta("branch", handle.branch.as_str())
                        .meta("path", handle.path.display().to_string()),
                    Utc::now(),
                );
            }
        }
        info!(branch = %handle.branch, "workspace released");
        Ok(true)
    }

    fn active(&self) -> Result<MutexGuard<'_, HashMap<PathBuf, StoryId>>> {
        self.active
            .lock()
            .map_err(|_| anyhow!("workspace registry poisoned"))
    }

    fn log_handle(&self) -> Result<MutexGuard<'_, ExecutionLog>> {
        self.log
            .lock()
            .map_err(|_| anyhow!("execution log poisoned"))
    }
}

pub fn validate_branch_name(name: &str) -> Result<()> {
    if !BRANCH_NAME_RE.is_match(name) || name.contains("..") || name.ends_with(".lock") {
        return Err(anyhow!("invalid branch name '{name}'"));
    }
    Ok(())
}

fn provision_failed(story: StoryId, err: anyhow::Error) -> Error {
    Error::WorkspaceProvisionFailed {
        story,
        source: err.into(),
    }
}
