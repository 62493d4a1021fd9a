//! Concurrent story execution.
//!
//! Each worker loops: reserve, run, repeat. When nothing is reservable but a
//! story is still running, the worker parks on the scheduler's change channel
//! until a completion or failure may have freed more work.

use std::sync::Arc;

use anyhow::{Result, anyhow, bail};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::app::App;
use crate::core::lifecycle::NextOutcome;
use crate::core::types::{StoryId, StoryStatus, WorkItemId};
use crate::implement::{StoryOutcome, StoryRun, run_reserved};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolReport {
    pub completed: Vec<StoryId>,
    pub failed: Vec<StoryId>,
    pub cancelled: Vec<StoryId>,
    /// Scheduling state once every worker stopped.
    pub outcome: NextOutcome,
}

/// Run up to `workers` stories at a time until the scope is complete, stalled
/// or `cancel` fires.
#[instrument(skip(app, cancel))]
pub async fn run_pool(
    app: Arc<App>,
    scope: Option<WorkItemId>,
    workers: usize,
    cancel: CancellationToken,
) -> Result<PoolReport> {
    if workers == 0 {
        bail!("worker count must be >= 1");
    }
    let board = app.scheduler.snapshot()?;
    if let Some(running) = board.stories.values().find(|story| {
        story.status == StoryStatus::InProgress
            && scope.is_none_or(|id| story.work_item_id == id)
    }) {
        bail!(
            "story {} is already in progress; run `devflow recover` if no other run is active",
            running.id()
        );
    }

    let mut set = JoinSet::new();
    for worker in 0..workers {
        set.spawn(work(app.clone(), scope, cancel.clone(), worker));
    }

    let mut runs = Vec::new();
    let mut first_err = None;
    while let Some(joined) = set.join_next().await {
        let result = joined.map_err(|err| anyhow!("worker task failed: {err}"));
        match result.and_then(|res| res) {
            Ok(mut done) => runs.append(&mut done),
            Err(err) => {
                warn!(err = %format!("{err:#}"), "worker stopped with error");
                cancel.cancel();
                first_err.get_or_insert(err);
            }
        }
    }
    if let Some(err) = first_err {
        return Err(err);
    }

    let report = summarize(runs, app.scheduler.next_outcome(scope)?);
    info!(
        completed = report.completed.len(),
        failed = report.failed.len(),
        cancelled = report.cancelled.len(),
        "worker pool finished"
    );
    Ok(report)
}

async fn work(
    app: Arc<App>,
    scope: Option<WorkItemId>,
    cancel: CancellationToken,
    worker: usize,
) -> Result<Vec<StoryRun>> {
    let mut changes = app.scheduler.subscribe();
    let mut runs = Vec::new();
    while !cancel.is_cancelled() {
        // Mark the current generation seen before looking, so a change that
        // lands between the check and the wait still wakes us.
        changes.borrow_and_update();
        if let Some(reservation) = app.scheduler.reserve(scope, None)? {
            debug!(worker, story = %reservation.story.id(), "worker picked story");
            runs.push(run_reserved(&app, reservation, &cancel).await?);
            continue;
        }
        match app.scheduler.next_outcome(scope)? {
            NextOutcome::Ready(_) => continue,
            NextOutcome::Waiting => {
                tokio::select! {
                    changed = changes.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    () = cancel.cancelled() => break,
                }
            }
            NextOutcome::Complete | NextOutcome::Stalled(_) => break,
        }
    }
    debug!(worker, runs = runs.len(), "worker idle");
    Ok(runs)
}

fn summarize(runs: Vec<StoryRun>, outcome: NextOutcome) -> PoolReport {
    let mut report = PoolReport {
        completed: Vec::new(),
        failed: Vec::new(),
        cancelled: Vec::new(),
        outcome,
    };
    for run in runs {
        match run.outcome {
            StoryOutcome::Completed(_) => report.completed.push(run.story),
            StoryOutcome::Failed { .. } => report.failed.push(run.story),
            StoryOutcome::Cancelled => report.cancelled.push(run.story),
        }
    }
    report.completed.sort();
    report.failed.sort();
    report.cancelled.sort();
    report
}
