//! Running one story: reserve, provision, call the provider, finalize, release.

use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::app::App;
use crate::core::error::{Error, Subject, fault_category, find_fault};
use crate::core::lifecycle::{Completion, Failure};
use crate::core::types::{StoryId, StoryStatus, WorkItemId};
use crate::io::prompt::{render_story_instructions, render_work_item_context};
use crate::io::provider::{ProviderRequest, execute_with_retry};
use crate::io::workspace::{ReleaseMode, WorkspaceHandle};
use crate::scheduler::Reservation;

/// Longest completion summary kept in the log.
const SUMMARY_MAX_CHARS: usize = 500;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoryOutcome {
    Completed(Completion),
    Failed {
        failure: Failure,
        category: &'static str,
        reason: String,
    },
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoryRun {
    pub story: StoryId,
    pub branch: Option<String>,
    pub outcome: StoryOutcome,
}

/// Reserve `specific` (or the next story in `scope`) and run it.
///
/// `None` when nothing is reservable.
pub async fn implement_story(
    app: &App,
    scope: Option<WorkItemId>,
    specific: Option<StoryId>,
    cancel: &CancellationToken,
) -> Result<Option<StoryRun>> {
    match app.scheduler.reserve(scope, specific)? {
        Some(reservation) => Ok(Some(run_reserved(app, reservation, cancel).await?)),
        None => Ok(None),
    }
}

/// Drive a reserved story to a terminal state.
///
/// Story-level failures (provisioning, provider) are outcomes, not errors.
/// `Err` means the board or log could not be updated.
#[instrument(skip_all, fields(story = %reservation.story.id()))]
pub async fn run_reserved(
    app: &App,
    reservation: Reservation,
    cancel: &CancellationToken,
) -> Result<StoryRun> {
    let story = reservation.story.id();
    let handle = match provision(app, &reservation).await {
        Ok(handle) => handle,
        Err(err) => {
            let outcome = fail(app, story, &err)?;
            return Ok(StoryRun {
                story,
                branch: None,
                outcome,
            });
        }
    };
    app.scheduler.attach_workspace(&handle)?;

    let result = match build_request(app, &reservation, &handle) {
        Ok(request) => {
            execute_with_retry(
                app.provider.as_ref(),
                &request,
                &app.retry,
                app.log(),
                cancel,
            )
            .await
        }
        Err(err) => Err(err),
    };

    let outcome = match result {
        Ok(response) => {
            let completion = app.scheduler.complete(story, summarize(&response.output))?;
            match release(app, &handle, ReleaseMode::Success).await {
                Ok(_) => app.scheduler.clear_workspace(story)?,
                Err(err) => warn!(err = %format!("{err:#}"), "worktree kept after success"),
            }
            StoryOutcome::Completed(completion)
        }
        Err(err) if matches!(find_fault(&err), Some(Error::Cancelled { .. })) => {
            app.scheduler.cancel(story)?;
            preserve(app, &handle).await;
            StoryOutcome::Cancelled
        }
        Err(err) => {
            let outcome = fail(app, story, &err)?;
            preserve(app, &handle).await;
            outcome
        }
    };
    Ok(StoryRun {
        story,
        branch: Some(handle.branch),
        outcome,
    })
}

/// Return a failed or blocked story to Ready, optionally removing its kept worktree.
///
/// Without cleanup the worktree stays on disk and the next attempt picks it up.
pub async fn retry_story(app: &App, story: StoryId, cleanup: bool) -> Result<()> {
    let kept = app
        .log()
        .lock()
        .map_err(|_| anyhow!("execution log poisoned"))?
        .live_worktree(story);
    app.scheduler.retry(story)?;
    let Some((branch, path)) = kept.filter(|_| cleanup) else {
        return Ok(());
    };
    let handle = WorkspaceHandle {
        story,
        branch,
        path,
    };
    app.workspaces.adopt(&handle)?;
    release(app, &handle, ReleaseMode::Cleanup).await?;
    info!(story = %story, branch = %handle.branch, "worktree cleaned up");
    Ok(())
}

async fn provision(app: &App, reservation: &Reservation) -> Result<WorkspaceHandle> {
    let workspaces = Arc::clone(&app.workspaces);
    let work_item = reservation.work_item.clone();
    let story = reservation.story.clone();
    let handle = tokio::task::spawn_blocking(move || workspaces.provision(&work_item, &story))
        .await
        .context("provision task panicked")??;
    Ok(handle)
}

async fn release(app: &App, handle: &WorkspaceHandle, mode: ReleaseMode) -> Result<bool> {
    let workspaces = Arc::clone(&app.workspaces);
    let handle = handle.clone();
    tokio::task::spawn_blocking(move || workspaces.release(&handle, mode))
        .await
        .map_err(|err| anyhow!("release task panicked: {err}"))?
}

async fn preserve(app: &App, handle: &WorkspaceHandle) {
    if let Err(err) = release(app, handle, ReleaseMode::Preserve).await {
        warn!(err = %format!("{err:#}"), "could not record preserved workspace");
    }
}

fn build_request(
    app: &App,
    reservation: &Reservation,
    handle: &WorkspaceHandle,
) -> Result<ProviderRequest> {
    let board = app.scheduler.snapshot()?;
    let completed: Vec<_> = board
        .stories_of(reservation.work_item.id())?
        .into_iter()
        .filter(|story| story.status == StoryStatus::Completed)
        .collect();
    Ok(ProviderRequest {
        subject: Subject::Story(handle.story),
        context: render_work_item_context(&reservation.work_item, &completed)?,
        instructions: render_story_instructions(&reservation.story, &handle.branch)?,
        prior_analysis: reservation.prior_failure.clone(),
        workdir: handle.path.clone(),
    })
}

fn fail(app: &App, story: StoryId, err: &anyhow::Error) -> Result<StoryOutcome> {
    let reason = format!("{err:#}");
    let failure = app.scheduler.fail(story, &reason)?;
    Ok(StoryOutcome::Failed {
        failure,
        category: fault_category(err),
        reason,
    })
}

/// Last non-empty line of provider output, bounded.
fn summarize(output: &str) -> Option<String> {
    let line = output.lines().rev().map(str::trim).find(|line| !line.is_empty())?;
    Some(line.chars().take(SUMMARY_MAX_CHARS).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::LogEvent;
    use crate::io::config::DevflowConfig;
    use crate::io::provider::ProviderResponse;
    use crate::test_support::{ScriptedProvider, TestApp, refined_board};

    fn harness(provider: ScriptedProvider) -> (TestApp, Vec<StoryId>) {
        let (board, _, stories) = refined_board(&[("form", 1), ("docs", 2)]);
        let config = DevflowConfig {
            max_story_attempts: 2,
            ..DevflowConfig::default()
        };
        (TestApp::new(board, provider, config), stories)
    }

    #[tokio::test]
    async fn success_completes_and_removes_worktree() {
        let (h, stories) =
            harness(ScriptedProvider::new(vec![ProviderResponse::ok("step\nall green\n")]));
        let run = implement_story(&h.app, None, None, &CancellationToken::new())
            .await
            .expect("run")
            .expect("reserved");
        assert_eq!(run.story, stories[0]);
        assert!(matches!(run.outcome, StoryOutcome::Completed(_)));
        assert_eq!(run.branch.as_deref(), Some("us-1-1"));
        assert!(h.vcs.has_branch("us-1-1"));

        let board = h.app.scheduler.snapshot().expect("board");
        let story = &board.stories[&stories[0]];
        assert_eq!(story.status, StoryStatus::Completed);
        assert_eq!(story.workspace_path, None);
        assert!(!h.app.workspaces.worktree_path("us-1-1").exists());
        assert_eq!(
            h.events(stories[0]),
            vec![
                LogEvent::Started,
                LogEvent::BranchCreated,
                LogEvent::WorktreeCreated,
                LogEvent::Completed,
                LogEvent::WorktreeRemoved,
            ]
        );
        let completed = h
            .app
            .log()
            .lock()
            .expect("log")
            .query_by_story(stories[0])
            .into_iter()
            .find(|entry| entry.event == LogEvent::Completed)
            .expect("completed entry");
        assert_eq!(completed.details.as_deref(), Some("all green"));
    }

    #[tokio::test]
    async fn failure_preserves_workspace_and_feeds_next_attempt() {
        let (h, stories) = harness(ScriptedProvider::new(vec![ProviderResponse::failed(
            "tests failed",
            false,
        )]));
        let cancel = CancellationToken::new();
        let run = implement_story(&h.app, None, Some(stories[0]), &cancel)
            .await
            .expect("run")
            .expect("reserved");
        match &run.outcome {
            StoryOutcome::Failed {
                failure, category, ..
            } => {
                assert_eq!(failure.attempts, 1);
                assert_eq!(*category, "ai_provider_failure");
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(h.status(stories[0]), StoryStatus::Error);
        assert!(h.app.workspaces.worktree_path("us-1-1").is_dir());
        assert!(!h.events(stories[0]).contains(&LogEvent::WorktreeRemoved));

        retry_story(&h.app, stories[0], false).await.expect("retry");
        let board = h.app.scheduler.snapshot().expect("board");
        let retried = board.story(stories[0]).expect("story");
        assert_eq!(retried.status, StoryStatus::Ready);
        assert_eq!(retried.branch_name, None);
        assert_eq!(retried.workspace_path, None);
        assert!(h.app.workspaces.worktree_path("us-1-1").is_dir());

        implement_story(&h.app, None, Some(stories[0]), &cancel)
            .await
            .expect("run")
            .expect("reserved");
        assert_eq!(h.status(stories[0]), StoryStatus::Completed);
        assert_eq!(h.vcs.branch_creations(), 1);
        let created = h
            .events(stories[0])
            .into_iter()
            .filter(|event| *event == LogEvent::WorktreeCreated)
            .count();
        assert_eq!(created, 1);
        let second = &h.provider.requests()[1];
        assert!(
            second
                .prior_analysis
                .as_deref()
                .is_some_and(|prior| prior.contains("tests failed"))
        );
    }

    #[tokio::test]
    async fn provisioning_failure_counts_as_an_attempt() {
        let (h, stories) = harness(ScriptedProvider::default());
        h.vcs.seed_branch("us-1-1");
        let run = implement_story(&h.app, None, Some(stories[0]), &CancellationToken::new())
            .await
            .expect("run")
            .expect("reserved");
        match run.outcome {
            StoryOutcome::Failed { category, .. } => assert_eq!(category, "branch_already_exists"),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(h.provider.calls(), 0);
        assert_eq!(h.status(stories[0]), StoryStatus::Error);
    }

    #[tokio::test]
    async fn retry_with_cleanup_removes_kept_worktree() {
        let (h, stories) =
            harness(ScriptedProvider::new(vec![ProviderResponse::failed("nope", false)]));
        implement_story(&h.app, None, None, &CancellationToken::new())
            .await
            .expect("run");
        let kept = h.app.workspaces.worktree_path("us-1-1");
        assert!(kept.is_dir());

        retry_story(&h.app, stories[0], true).await.expect("retry");
        assert!(!kept.exists());
        assert_eq!(h.status(stories[0]), StoryStatus::Ready);
        let board = h.app.scheduler.snapshot().expect("board");
        assert_eq!(board.stories[&stories[0]].branch_name, None);
    }

    #[tokio::test]
    async fn leftover_directory_is_not_used_as_a_workspace() {
        let (h, stories) = harness(ScriptedProvider::default());
        let stray = h.app.workspaces.worktree_path("us-1-1");
        std::fs::create_dir_all(&stray).expect("stray dir");

        let run = implement_story(&h.app, None, Some(stories[0]), &CancellationToken::new())
            .await
            .expect("run")
            .expect("reserved");
        match run.outcome {
            StoryOutcome::Failed { category, .. } => {
                assert_eq!(category, "workspace_provision_failed");
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(h.provider.calls(), 0);
        assert_eq!(
            h.events(stories[0]),
            vec![LogEvent::Started, LogEvent::BranchCreated, LogEvent::Failed]
        );
    }

    #[tokio::test]
    async fn exhausted_story_keeps_worktree_but_drops_its_fields() {
        let (h, stories) = harness(ScriptedProvider::new(vec![
            ProviderResponse::failed("red", false),
            ProviderResponse::failed("still red", false),
        ]));
        let cancel = CancellationToken::new();
        implement_story(&h.app, None, Some(stories[0]), &cancel)
            .await
            .expect("first");
        retry_story(&h.app, stories[0], false).await.expect("retry");
        let run = implement_story(&h.app, None, Some(stories[0]), &cancel)
            .await
            .expect("second")
            .expect("reserved");
        assert!(matches!(
            run.outcome,
            StoryOutcome::Failed { ref failure, .. } if failure.exhausted
        ));

        let board = h.app.scheduler.snapshot().expect("board");
        let story = board.story(stories[0]).expect("story");
        assert_eq!(story.status, StoryStatus::Blocked);
        assert_eq!(story.branch_name, None);
        assert_eq!(story.workspace_path, None);
        let kept = h.app.workspaces.worktree_path("us-1-1");
        assert!(kept.is_dir());

        retry_story(&h.app, stories[0], true).await.expect("retry with cleanup");
        assert!(!kept.exists());
        assert_eq!(h.status(stories[0]), StoryStatus::Ready);
    }

    #[tokio::test]
    async fn nothing_reservable_is_none() {
        let (h, _) = harness(ScriptedProvider::default());
        let cancel = CancellationToken::new();
        for _ in 0..2 {
            implement_story(&h.app, None, None, &cancel)
                .await
                .expect("run")
                .expect("reserved");
        }
        assert!(
            implement_story(&h.app, None, None, &cancel)
                .await
                .expect("run")
                .is_none()
        );
    }

    #[test]
    fn summary_is_last_non_empty_line() {
        assert_eq!(summarize("a\nb\n\n  "), Some("b".to_string()));
        assert_eq!(summarize("   "), None);
    }
}
