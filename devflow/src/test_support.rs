//! Test-only fixtures: deterministic entities and in-memory collaborators.

use std::collections::{BTreeSet, VecDeque};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::app::{App, Parts};
use crate::core::board::{Board, NewStory, NewWorkItem};
use crate::core::error::Error;
use crate::core::types::{
    Dependency, DeveloperStory, ExecutionLogEntry, Identity, LogEvent, StoryId, StoryStatus, StoryType,
    WorkItem, WorkItemId, WorkItemStatus, WorkItemType,
};
use crate::io::board_store::BoardStore;
use crate::io::config::DevflowConfig;
use crate::io::execution_log::LogSink;
use crate::io::git::Vcs;
use crate::io::provider::{Provider, ProviderRequest, ProviderResponse};

pub fn fixed_now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 1, 9, 0, 0)
        .single()
        .expect("valid timestamp")
}

/// Pending work item with deterministic text fields.
pub fn work_item(id: u64, kind: WorkItemType) -> WorkItem {
    WorkItem {
        identity: Identity::new(WorkItemId(id), fixed_now()),
        kind,
        title: format!("work item {id}"),
        description: format!("work item {id} description"),
        acceptance_criteria: None,
        priority: 5,
        status: WorkItemStatus::Pending,
        error_message: None,
        updated_at: fixed_now(),
        base_ref: None,
        stories: Vec::new(),
    }
}

/// Pending implementation story.
pub fn story(id: u64, work_item: u64, priority: u8) -> DeveloperStory {
    DeveloperStory {
        identity: Identity::new(StoryId(id), fixed_now()),
        work_item_id: WorkItemId(work_item),
        story_type: StoryType::Implementation,
        title: format!("story {id}"),
        description: format!("story {id} description"),
        instructions: format!("implement story {id}"),
        priority,
        status: StoryStatus::Pending,
        branch_name: None,
        workspace_path: None,
        started_at: None,
        completed_at: None,
        error_message: None,
        metadata: None,
        attempts: 0,
        branch_override: None,
        updated_at: fixed_now(),
    }
}

pub fn story_with_status(
    id: u64,
    work_item: u64,
    priority: u8,
    status: StoryStatus,
) -> DeveloperStory {
    DeveloperStory {
        status,
        ..story(id, work_item, priority)
    }
}

/// Edge `dependent -> required`.
pub fn edge(dependent: u64, required: u64) -> Dependency {
    Dependency {
        dependent: StoryId(dependent),
        required: StoryId(required),
        description: None,
        created_at: fixed_now(),
    }
}

pub fn new_work_item(title: &str) -> NewWorkItem {
    NewWorkItem {
        kind: WorkItemType::UserStory,
        title: title.to_string(),
        description: format!("{title} description"),
        acceptance_criteria: None,
        priority: 5,
        base_ref: None,
    }
}

pub fn new_story(title: &str, priority: u8) -> NewStory {
    NewStory {
        story_type: StoryType::Implementation,
        title: title.to_string(),
        description: format!("{title} description"),
        instructions: format!("implement {title}"),
        priority,
        metadata: None,
        branch_override: None,
    }
}

/// Board with one refined work item owning `stories` (title, priority) and no edges.
pub fn refined_board(stories: &[(&str, u8)]) -> (Board, WorkItemId, Vec<StoryId>) {
    let mut board = Board::default();
    let now = fixed_now();
    let item = board.create_work_item(new_work_item("work item"), now);
    board
        .transition_work_item(item, WorkItemStatus::Refining, None, now)
        .expect("refining");
    board
        .transition_work_item(item, WorkItemStatus::Refined, None, now)
        .expect("refined");
    let ids = stories
        .iter()
        .map(|(title, priority)| {
            board
                .add_story(item, new_story(title, *priority), now)
                .expect("add story")
        })
        .collect();
    (board, item, ids)
}

/// [`App`] over in-memory stores, a [`FakeVcs`] and a [`ScriptedProvider`],
/// rooted in a temporary directory.
pub struct TestApp {
    pub app: Arc<App>,
    pub vcs: Arc<FakeVcs>,
    pub provider: Arc<ScriptedProvider>,
    pub store: Arc<MemoryBoardStore>,
    pub sink: Arc<MemoryLogSink>,
    temp: tempfile::TempDir,
}

impl TestApp {
    pub fn new(board: Board, provider: ScriptedProvider, config: DevflowConfig) -> Self {
        let temp = tempfile::tempdir().expect("tempdir");
        let vcs = Arc::new(FakeVcs::default());
        let provider = Arc::new(provider);
        let store = Arc::new(MemoryBoardStore::with_board(board));
        let sink = Arc::new(MemoryLogSink::default());
        let app = App::with_parts(
            temp.path(),
            config,
            Parts {
                store: store.clone(),
                sink: sink.clone(),
                vcs: vcs.clone(),
                provider: provider.clone(),
            },
        )
        .expect("app");
        Self {
            app: Arc::new(app),
            vcs,
            provider,
            store,
            sink,
            temp,
        }
    }

    pub fn root(&self) -> &Path {
        self.temp.path()
    }

    pub fn status(&self, story: StoryId) -> StoryStatus {
        self.app
            .scheduler
            .snapshot()
            .expect("board")
            .story(story)
            .expect("story")
            .status
    }

    /// Events recorded for `story`, in history order.
    pub fn events(&self, story: StoryId) -> Vec<LogEvent> {
        self.app
            .log()
            .lock()
            .expect("log")
            .query_by_story(story)
            .into_iter()
            .map(|entry| entry.event)
            .collect()
    }
}

#[derive(Debug, Default)]
struct FakeVcsState {
    branches: BTreeSet<String>,
    branch_creations: usize,
    fail_worktree: Option<String>,
}

/// In-memory branches; worktrees are plain directories.
#[derive(Debug, Default)]
pub struct FakeVcs {
    state: Mutex<FakeVcsState>,
}

impl FakeVcs {
    fn state(&self) -> std::sync::MutexGuard<'_, FakeVcsState> {
        self.state.lock().expect("fake vcs state")
    }

    /// Pretend `branch` already exists (created outside devflow).
    pub fn seed_branch(&self, branch: &str) {
        self.state().branches.insert(branch.to_string());
    }

    pub fn has_branch(&self, branch: &str) -> bool {
        self.state().branches.contains(branch)
    }

    pub fn branches(&self) -> Vec<String> {
        self.state().branches.iter().cloned().collect()
    }

    pub fn branch_creations(&self) -> usize {
        self.state().branch_creations
    }

    /// Make the next `create_worktree` fail with `message`.
    pub fn fail_next_worktree(&self, message: &str) {
        self.state().fail_worktree = Some(message.to_string());
    }
}

impl Vcs for FakeVcs {
    fn branch_exists(&self, branch: &str) -> Result<bool> {
        Ok(self.has_branch(branch))
    }

    fn create_branch(&self, branch: &str, _base_ref: &str) -> Result<()> {
        let mut state = self.state();
        if !state.branches.insert(branch.to_string()) {
            return Err(anyhow!("branch {branch} already exists"));
        }
        state.branch_creations += 1;
        Ok(())
    }

    fn create_worktree(&self, branch: &str, path: &Path) -> Result<()> {
        let mut state = self.state();
        if let Some(message) = state.fail_worktree.take() {
            return Err(anyhow!(message));
        }
        if !state.branches.contains(branch) {
            return Err(anyhow!("unknown branch {branch}"));
        }
        std::fs::create_dir_all(path)?;
        Ok(())
    }

    fn remove_worktree(&self, path: &Path) -> Result<()> {
        std::fs::remove_dir_all(path)?;
        Ok(())
    }
}

/// One scripted provider reaction.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    Respond(ProviderResponse),
    /// Respond after sleeping (still cancellable).
    Delayed(Duration, ProviderResponse),
    /// Block until cancelled.
    WaitForCancel,
}

/// Provider that replays a script, then succeeds with `"done"`.
#[derive(Debug, Default)]
pub struct ScriptedProvider {
    script: Mutex<VecDeque<ScriptStep>>,
    calls: AtomicUsize,
    requests: Mutex<Vec<ProviderRequest>>,
    entered: Notify,
}

impl ScriptedProvider {
    pub fn new(responses: Vec<ProviderResponse>) -> Self {
        Self::with_steps(responses.into_iter().map(ScriptStep::Respond).collect())
    }

    pub fn with_steps(steps: Vec<ScriptStep>) -> Self {
        Self {
            script: Mutex::new(steps.into()),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<ProviderRequest> {
        self.requests.lock().expect("requests").clone()
    }

    /// Resolves once a call has started (one permit per call).
    pub async fn wait_entered(&self) {
        self.entered.notified().await;
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    async fn execute(
        &self,
        request: &ProviderRequest,
        cancel: &CancellationToken,
    ) -> Result<ProviderResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().expect("requests").push(request.clone());
        let step = self.script.lock().expect("script").pop_front();
        self.entered.notify_one();
        let cancelled = || -> anyhow::Error {
            Error::Cancelled {
                subject: request.subject,
            }
            .into()
        };
        match step {
            None => Ok(ProviderResponse::ok("done")),
            Some(ScriptStep::Respond(response)) => Ok(response),
            Some(ScriptStep::Delayed(delay, response)) => {
                tokio::select! {
                    () = tokio::time::sleep(delay) => Ok(response),
                    () = cancel.cancelled() => Err(cancelled()),
                }
            }
            Some(ScriptStep::WaitForCancel) => {
                cancel.cancelled().await;
                Err(cancelled())
            }
        }
    }
}

/// Board store backed by memory.
#[derive(Debug, Default)]
pub struct MemoryBoardStore {
    board: Mutex<Board>,
    commits: AtomicUsize,
    failing: AtomicBool,
}

impl MemoryBoardStore {
    pub fn with_board(board: Board) -> Self {
        Self {
            board: Mutex::new(board),
            ..Self::default()
        }
    }

    /// Make subsequent commits fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn commits(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> Board {
        self.board.lock().expect("board").clone()
    }
}

impl BoardStore for MemoryBoardStore {
    fn load(&self) -> Result<Board> {
        Ok(self.snapshot())
    }

    fn commit(&self, board: &Board) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(anyhow!("board store unavailable"));
        }
        *self.board.lock().expect("board") = board.clone();
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Log sink backed by memory, with switchable failure.
#[derive(Debug, Default)]
pub struct MemoryLogSink {
    entries: Mutex<Vec<ExecutionLogEntry>>,
    failing: AtomicBool,
}

impl MemoryLogSink {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn entries(&self) -> Vec<ExecutionLogEntry> {
        self.entries.lock().expect("entries").clone()
    }
}

impl LogSink for MemoryLogSink {
    fn append(&self, entries: &[ExecutionLogEntry]) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(anyhow!("log sink unavailable"));
        }
        self.entries
            .lock()
            .expect("entries")
            .extend_from_slice(entries);
        Ok(())
    }

    fn load(&self) -> Result<Vec<ExecutionLogEntry>> {
        Ok(self.entries())
    }
}

/// Run git in `dir`, panicking on failure.
pub fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("spawn git");
    assert!(
        output.status.success(),
        "git {} failed: {}",
        args.join(" "),
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).into_owned()
}

pub fn git_available() -> bool {
    Command::new("git")
        .arg("--version")
        .output()
        .map(|out| out.status.success())
        .unwrap_or(false)
}

/// Temporary git repository with one commit on `main`.
pub struct TestRepo {
    temp: tempfile::TempDir,
}

impl TestRepo {
    pub fn new() -> Self {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path();
        git(root, &["init", "-q", "-b", "main"]);
        git(root, &["config", "user.email", "dev@example.com"]);
        git(root, &["config", "user.name", "dev"]);
        std::fs::write(root.join("README.md"), "hello\n").expect("write readme");
        git(root, &["add", "-A"]);
        git(root, &["commit", "-q", "-m", "init"]);
        Self { temp }
    }

    pub fn path(&self) -> &Path {
        self.temp.path()
    }

    pub fn join(&self, rel: &str) -> PathBuf {
        self.temp.path().join(rel)
    }
}

impl Default for TestRepo {
    fn default() -> Self {
        Self::new()
    }
}
