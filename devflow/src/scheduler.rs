//! Serialised access to the board.
//!
//! Every mutation runs under one lock, is committed to the store once, and is
//! rolled back in memory if either the change or the commit fails. Lifecycle
//! events are written to the execution log as they happen.

use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::core::board::{Board, NewWorkItem};
use crate::core::lifecycle::{self, CANCELLED_REASON, Completion, Failure, NextOutcome};
use crate::core::types::{
    DeveloperStory, LogEvent, LogId, StoryId, StoryStatus, WorkItem, WorkItemId, WorkItemStatus,
};
use crate::io::board_store::BoardStore;
use crate::io::execution_log::{ExecutionLog, LogRecord, find_orphans};
use crate::io::workspace::WorkspaceHandle;

/// Reason recorded for attempts cut short by a crash or kill.
pub const INTERRUPTED_REASON: &str = "interrupted";

/// A story moved to InProgress, with the data needed to run it.
#[derive(Debug, Clone)]
pub struct Reservation {
    pub story: DeveloperStory,
    pub work_item: WorkItem,
    /// Error from the previous failed attempt, if any.
    pub prior_failure: Option<String>,
}

/// What `recover` moved to Error.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Recovery {
    pub stories: Vec<StoryId>,
    pub work_items: Vec<WorkItemId>,
}

impl Recovery {
    pub fn is_empty(&self) -> bool {
        self.stories.is_empty() && self.work_items.is_empty()
    }
}

pub struct Scheduler {
    board: Mutex<Board>,
    store: Arc<dyn BoardStore>,
    log: Arc<Mutex<ExecutionLog>>,
    max_story_attempts: u32,
    changes: watch::Sender<u64>,
}

impl Scheduler {
    pub fn open(
        store: Arc<dyn BoardStore>,
        log: Arc<Mutex<ExecutionLog>>,
        max_story_attempts: u32,
    ) -> Result<Self> {
        let board = store.load()?;
        let (changes, _) = watch::channel(0);
        Ok(Self {
            board: Mutex::new(board),
            store,
            log,
            max_story_attempts,
            changes,
        })
    }

    pub fn log(&self) -> &Arc<Mutex<ExecutionLog>> {
        &self.log
    }

    pub fn snapshot(&self) -> Result<Board> {
        Ok(self.lock_board()?.clone())
    }

    /// Receiver that ticks whenever a story finishes or is unblocked.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    /// Apply `change` and commit it, or leave the board untouched.
    pub fn update<T>(
        &self,
        change: impl FnOnce(&mut Board, DateTime<Utc>) -> Result<T>,
    ) -> Result<T> {
        let mut board = self.lock_board()?;
        let before = board.clone();
        let outcome = change(&mut *board, Utc::now()).and_then(|value| {
            self.store.commit(&*board)?;
            Ok(value)
        });
        if outcome.is_err() {
            *board = before;
        }
        outcome
    }

    pub fn create_work_item(&self, new: NewWorkItem) -> Result<WorkItemId> {
        let id = self.update(|board, now| Ok(board.create_work_item(new, now)))?;
        info!(work_item = %id, "work item created");
        Ok(id)
    }

    #[instrument(skip(self, description))]
    pub fn add_dependency(
        &self,
        dependent: StoryId,
        required: StoryId,
        description: Option<String>,
    ) -> Result<()> {
        self.update(|board, now| Ok(board.add_dependency(dependent, required, description, now)?))?;
        debug!("dependency added");
        Ok(())
    }

    pub fn next_outcome(&self, scope: Option<WorkItemId>) -> Result<NextOutcome> {
        Ok(lifecycle::next_outcome(&*self.lock_board()?, scope))
    }

    /// Reserve `specific`, or the next story by policy. `None` when nothing is reservable.
    #[instrument(skip(self))]
    pub fn reserve(
        &self,
        scope: Option<WorkItemId>,
        specific: Option<StoryId>,
    ) -> Result<Option<Reservation>> {
        let mut started = None;
        let reserved = self.update(|board, now| {
            let Some(id) = lifecycle::reserve(board, scope, specific, now)? else {
                return Ok(None);
            };
            let story = board.story(id)?.clone();
            let work_item = board.work_item(story.work_item_id)?.clone();
            // Recorded before the commit so a crash never leaves an
            // InProgress story without its Started event.
            let mut log = self.lock_log()?;
            let prior_failure = log
                .query_by_story(id)
                .into_iter()
                .rev()
                .find(|entry| entry.event == LogEvent::Failed)
                .and_then(|entry| entry.error_message);
            log.record(
                LogRecord::new(id, LogEvent::Started)
                    .details(format!("attempt {}", story.attempts + 1))
                    .meta("attempt", story.attempts + 1),
                now,
            );
            started = Some(id);
            Ok(Some(Reservation {
                story,
                work_item,
                prior_failure,
            }))
        });
        let reserved = match reserved {
            Ok(reserved) => reserved,
            Err(err) => {
                if let Some(id) = started {
                    self.record(
                        LogRecord::new(id, LogEvent::Info)
                            .details("reservation rolled back")
                            .error(format!("{err:#}")),
                    )?;
                    warn!(story = %id, "reservation rolled back");
                }
                return Err(err);
            }
        };
        if let Some(reservation) = &reserved {
            info!(story = %reservation.story.id(), "story reserved");
        }
        Ok(reserved)
    }

    pub fn attach_workspace(&self, handle: &WorkspaceHandle) -> Result<()> {
        self.update(|board, now| {
            let story = board.story_mut(handle.story)?;
            story.branch_name = Some(handle.branch.clone());
            story.workspace_path = Some(handle.path.clone());
            story.updated_at = now;
            Ok(())
        })
    }

    /// Forget branch/workspace after a successful teardown.
    pub fn clear_workspace(&self, story: StoryId) -> Result<()> {
        self.update(|board, now| {
            let story = board.story_mut(story)?;
            story.branch_name = None;
            story.workspace_path = None;
            story.updated_at = now;
            Ok(())
        })
    }

    #[instrument(skip(self, summary))]
    pub fn complete(&self, story: StoryId, summary: Option<String>) -> Result<Completion> {
        let completion = self.update(|board, now| Ok(lifecycle::complete_story(board, story, now)?))?;
        {
            let mut log = self.lock_log()?;
            let mut record = LogRecord::new(story, LogEvent::Completed);
            if let Some(summary) = summary {
                record = record.details(summary);
            }
            let now = Utc::now();
            log.record(record, now);
            for dependent in &completion.unblocked {
                log.record(
                    LogRecord::new(*dependent, LogEvent::Info)
                        .details(format!("unblocked: story {story} completed")),
                    now,
                );
            }
        }
        info!(
            unblocked = completion.unblocked.len(),
            work_item_completed = completion.work_item_completed,
            "story completed"
        );
        self.notify();
        Ok(completion)
    }

    #[instrument(skip(self))]
    pub fn fail(&self, story: StoryId, reason: &str) -> Result<Failure> {
        let max = self.max_story_attempts;
        let failure =
            self.update(|board, now| Ok(lifecycle::fail_story(board, story, reason, max, now)?))?;
        {
            let mut log = self.lock_log()?;
            let now = Utc::now();
            log.record(
                LogRecord::new(story, LogEvent::Failed)
                    .error(reason)
                    .meta("attempts", failure.attempts),
                now,
            );
            if failure.exhausted {
                log.record(
                    LogRecord::new(story, LogEvent::Info)
                        .details(format!("blocked after {} attempts", failure.attempts)),
                    now,
                );
            }
            for dependent in &failure.blocked_dependents {
                log.record(
                    LogRecord::new(*dependent, LogEvent::Info)
                        .details(format!("blocked by story {story}")),
                    now,
                );
            }
        }
        warn!(
            attempts = failure.attempts,
            exhausted = failure.exhausted,
            "story failed"
        );
        self.notify();
        Ok(failure)
    }

    #[instrument(skip(self))]
    pub fn cancel(&self, story: StoryId) -> Result<()> {
        self.update(|board, now| Ok(lifecycle::cancel_story(board, story, now)?))?;
        self.record(LogRecord::new(story, LogEvent::Failed).error(CANCELLED_REASON))?;
        info!("story cancelled");
        self.notify();
        Ok(())
    }

    /// Return an Error or Blocked story to Ready.
    pub fn retry(&self, story: StoryId) -> Result<()> {
        let max = self.max_story_attempts;
        self.update(|board, now| Ok(lifecycle::retry_story(board, story, max, now)?))?;
        self.record(LogRecord::new(story, LogEvent::Info).details("retry requested"))?;
        self.notify();
        Ok(())
    }

    /// Fail every InProgress story whose attempt never finished, and every
    /// work item left mid-refinement.
    #[instrument(skip(self))]
    pub fn recover(&self) -> Result<Recovery> {
        let recovery = self.update(|board, now| {
            let stories = find_orphans(board, &*self.lock_log()?);
            for id in &stories {
                board.transition_story(*id, StoryStatus::Error, Some(INTERRUPTED_REASON), now)?;
            }
            let work_items: Vec<WorkItemId> = board
                .work_items
                .values()
                .filter(|item| item.status == WorkItemStatus::Refining)
                .map(|item| item.id())
                .collect();
            for id in &work_items {
                board.transition_work_item(*id, WorkItemStatus::Error, Some(INTERRUPTED_REASON), now)?;
            }
            Ok(Recovery {
                stories,
                work_items,
            })
        })?;
        for id in &recovery.stories {
            self.record(LogRecord::new(*id, LogEvent::Failed).error(INTERRUPTED_REASON))?;
        }
        if !recovery.is_empty() {
            warn!(
                stories = recovery.stories.len(),
                work_items = recovery.work_items.len(),
                "recovered interrupted work"
            );
            self.notify();
        }
        Ok(recovery)
    }

    /// Move a work item to Error with `reason`.
    pub fn fail_work_item(&self, id: WorkItemId, reason: &str) -> Result<()> {
        self.update(|board, now| {
            Ok(board.transition_work_item(id, WorkItemStatus::Error, Some(reason), now)?)
        })
    }

    /// Push any log entries still queued after a sink failure.
    pub fn flush_log(&self) -> Result<()> {
        self.lock_log()?.flush()
    }

    fn record(&self, record: LogRecord) -> Result<LogId> {
        Ok(self.lock_log()?.record(record, Utc::now()))
    }

    fn notify(&self) {
        self.changes.send_modify(|generation| *generation += 1);
    }

    fn lock_board(&self) -> Result<MutexGuard<'_, Board>> {
        self.board.lock().map_err(|_| anyhow!("board lock poisoned"))
    }

    fn lock_log(&self) -> Result<MutexGuard<'_, ExecutionLog>> {
        self.log
            .lock()
            .map_err(|_| anyhow!("execution log poisoned"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::{Error, fault_category, find_fault};
    use crate::test_support::{MemoryBoardStore, MemoryLogSink, new_work_item, refined_board};

    struct Fixture {
        store: Arc<MemoryBoardStore>,
        scheduler: Scheduler,
        item: WorkItemId,
    }

    fn fixture(stories: &[(&str, u8)]) -> (Fixture, Vec<StoryId>) {
        let (board, item, ids) = refined_board(stories);
        let store = Arc::new(MemoryBoardStore::with_board(board));
        let log = Arc::new(Mutex::new(
            ExecutionLog::open(Arc::new(MemoryLogSink::default())).expect("log"),
        ));
        let scheduler = Scheduler::open(store.clone(), log, 2).expect("open");
        (
            Fixture {
                store,
                scheduler,
                item,
            },
            ids,
        )
    }

    fn events(fx: &Fixture, story: StoryId) -> Vec<LogEvent> {
        fx.scheduler
            .log()
            .lock()
            .expect("log")
            .query_by_story(story)
            .into_iter()
            .map(|entry| entry.event)
            .collect()
    }

    #[test]
    fn rejected_dependency_leaves_store_untouched() {
        let (fx, ids) = fixture(&[("s1", 1), ("s2", 2)]);
        fx.scheduler
            .add_dependency(ids[1], ids[0], None)
            .expect("first edge");
        let commits = fx.store.commits();

        let err = fx
            .scheduler
            .add_dependency(ids[0], ids[1], None)
            .expect_err("cycle");
        assert_eq!(fault_category(&err), "cycle_detected");
        assert_eq!(fx.store.commits(), commits);
        assert_eq!(fx.scheduler.snapshot().expect("board").dependencies.len(), 1);
    }

    #[test]
    fn reservation_records_started_and_persists() {
        let (fx, ids) = fixture(&[("s1", 1)]);
        let reservation = fx
            .scheduler
            .reserve(None, None)
            .expect("reserve")
            .expect("some");
        assert_eq!(reservation.story.id(), ids[0]);
        assert_eq!(reservation.story.status, StoryStatus::InProgress);
        assert_eq!(
            fx.store.snapshot().story(ids[0]).expect("story").status,
            StoryStatus::InProgress
        );
        assert_eq!(events(&fx, ids[0]), vec![LogEvent::Started]);
        assert!(fx.scheduler.reserve(None, None).expect("reserve").is_none());
    }

    #[test]
    fn failed_update_rolls_back_memory() {
        let (fx, ids) = fixture(&[("s1", 1)]);
        let err = fx
            .scheduler
            .update(|board, now| {
                board.transition_story(ids[0], StoryStatus::Ready, None, now)?;
                Err::<(), _>(anyhow!("later step failed"))
            })
            .expect_err("fails");
        assert!(err.to_string().contains("later step failed"));
        assert_eq!(
            fx.scheduler.snapshot().expect("board").story(ids[0]).expect("s1").status,
            StoryStatus::Pending
        );
    }

    #[test]
    fn second_failure_exhausts_with_default_limit() {
        let (fx, ids) = fixture(&[("s1", 1)]);
        fx.scheduler.reserve(None, None).expect("reserve");
        let first = fx.scheduler.fail(ids[0], "boom").expect("fail");
        assert!(!first.exhausted);
        fx.scheduler.retry(ids[0]).expect("retry");
        fx.scheduler.reserve(None, None).expect("reserve again");
        let second = fx.scheduler.fail(ids[0], "boom again").expect("fail");
        assert!(second.exhausted);
        assert_eq!(
            fx.scheduler.next_outcome(None).expect("outcome"),
            NextOutcome::Stalled(vec![ids[0]])
        );
        let board = fx.scheduler.snapshot().expect("board");
        assert_eq!(
            board.work_item(fx.item).expect("item").status,
            WorkItemStatus::Error
        );
    }

    #[test]
    fn prior_failure_is_handed_to_the_next_attempt() {
        let (fx, ids) = fixture(&[("s1", 1)]);
        fx.scheduler.reserve(None, None).expect("reserve");
        fx.scheduler.fail(ids[0], "missing import").expect("fail");
        fx.scheduler.retry(ids[0]).expect("retry");
        let reservation = fx
            .scheduler
            .reserve(None, None)
            .expect("reserve")
            .expect("some");
        assert_eq!(reservation.prior_failure.as_deref(), Some("missing import"));
    }

    #[test]
    fn recover_fails_orphans_once() {
        let (fx, ids) = fixture(&[("s1", 1), ("s2", 1)]);
        fx.scheduler.reserve(None, None).expect("reserve");
        fx.scheduler.reserve(None, None).expect("reserve");
        fx.scheduler.complete(ids[1], None).expect("complete");

        assert_eq!(fx.scheduler.recover().expect("recover").stories, vec![ids[0]]);
        assert!(fx.scheduler.recover().expect("again").is_empty());
        let story = fx.scheduler.snapshot().expect("board").stories[&ids[0]].clone();
        assert_eq!(story.status, StoryStatus::Error);
        assert_eq!(story.error_message.as_deref(), Some(INTERRUPTED_REASON));
        assert_eq!(
            events(&fx, ids[0]),
            vec![LogEvent::Started, LogEvent::Failed]
        );
    }

    #[test]
    fn failed_reservation_commit_is_noted_in_the_log() {
        let (fx, ids) = fixture(&[("s1", 1)]);
        fx.store.set_failing(true);
        let err = fx.scheduler.reserve(None, None).expect_err("commit fails");
        assert!(err.to_string().contains("board store unavailable"));
        assert_eq!(
            fx.scheduler.snapshot().expect("board").story(ids[0]).expect("s1").status,
            StoryStatus::Pending
        );
        assert_eq!(events(&fx, ids[0]), vec![LogEvent::Started, LogEvent::Info]);
        let last = fx
            .scheduler
            .log()
            .lock()
            .expect("log")
            .query_by_story(ids[0])
            .pop()
            .expect("entry");
        assert_eq!(last.details.as_deref(), Some("reservation rolled back"));

        fx.store.set_failing(false);
        assert!(fx.scheduler.reserve(None, None).expect("reserve").is_some());
    }

    #[test]
    fn recover_fails_work_items_left_refining() {
        let (fx, _) = fixture(&[]);
        let draft = fx
            .scheduler
            .create_work_item(new_work_item("draft"))
            .expect("create");
        fx.scheduler
            .update(|board, now| {
                Ok(board.transition_work_item(draft, WorkItemStatus::Refining, None, now)?)
            })
            .expect("refining");

        let recovery = fx.scheduler.recover().expect("recover");
        assert_eq!(recovery.work_items, vec![draft]);
        assert!(recovery.stories.is_empty());
        let board = fx.scheduler.snapshot().expect("board");
        let item = board.work_item(draft).expect("item");
        assert_eq!(item.status, WorkItemStatus::Error);
        assert_eq!(item.error_message.as_deref(), Some(INTERRUPTED_REASON));
        assert_eq!(
            board.work_item(fx.item).expect("refined item").status,
            WorkItemStatus::Refined
        );

        fx.scheduler
            .update(|board, now| {
                Ok(board.transition_work_item(draft, WorkItemStatus::Refining, None, now)?)
            })
            .expect("refinement can restart");
        assert_eq!(fx.scheduler.recover().expect("again").work_items, vec![draft]);
    }

    #[test]
    fn completion_ticks_subscribers() {
        let (fx, ids) = fixture(&[("s1", 1)]);
        let mut rx = fx.scheduler.subscribe();
        let _ = rx.borrow_and_update();
        fx.scheduler.reserve(None, None).expect("reserve");
        fx.scheduler.complete(ids[0], Some("ok".into())).expect("complete");
        assert!(rx.has_changed().expect("sender alive"));
    }

    #[test]
    fn unknown_story_is_not_found() {
        let (fx, _) = fixture(&[]);
        let err = fx.scheduler.retry(StoryId(42)).expect_err("missing");
        assert!(matches!(find_fault(&err), Some(Error::EntityNotFound { .. })));
    }
}
