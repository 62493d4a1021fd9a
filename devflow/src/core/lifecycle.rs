//! Scheduling decisions over a [`Board`]: what may run, and what each outcome
//! of a run does to the stories around it.
//!
//! Everything here is pure. Locking, persistence and audit logging are the
//! scheduler's job.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::core::board::Board;
use crate::core::error::{EntityKind, Error};
use crate::core::graph::{compute_ready_set, requirements_completed, transitive_dependents};
use crate::core::selector::{select_next, sort_by_selection_order};
use crate::core::transitions::can_transition;
use crate::core::types::{
    DeveloperStory, StoryId, StoryStatus, WorkItem, WorkItemId, WorkItemStatus,
};

/// Reason recorded on a story whose provider call was cancelled.
pub const CANCELLED_REASON: &str = "cancelled";

/// Answer to "what should run next?".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextOutcome {
    Ready(StoryId),
    /// Nothing can start until a running story finishes.
    Waiting,
    /// Every story in scope is completed.
    Complete,
    /// Nothing can start and nothing is running; these stories are stuck.
    Stalled(Vec<StoryId>),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Completion {
    /// Blocked dependents moved back to Ready.
    pub unblocked: Vec<StoryId>,
    pub work_item_completed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Failure {
    pub attempts: u32,
    /// The story ran out of attempts and is now Blocked.
    pub exhausted: bool,
    /// Ready dependents moved to Blocked.
    pub blocked_dependents: Vec<StoryId>,
    pub work_item_failed: bool,
}

fn in_scope(story: &DeveloperStory, scope: Option<WorkItemId>) -> bool {
    scope.is_none_or(|id| story.work_item_id == id)
}

/// Only stories of refined work items are schedulable.
fn owner_accepts_work(item: &WorkItem) -> bool {
    matches!(
        item.status,
        WorkItemStatus::Refined | WorkItemStatus::InProgress
    )
}

/// Stories that may be reserved right now, in selection order.
///
/// The ready set plus Ready stories (retried or unblocked) whose requirements
/// are all completed. Readiness is judged against every story on the board so
/// edges may cross work items.
pub fn reservation_candidates(board: &Board, scope: Option<WorkItemId>) -> Vec<&DeveloperStory> {
    let all = board.all_stories();
    let status: HashMap<StoryId, StoryStatus> =
        all.iter().map(|story| (story.id(), story.status)).collect();
    let mut candidates = compute_ready_set(&all, &board.dependencies);
    candidates.extend(all.iter().copied().filter(|story| {
        story.status == StoryStatus::Ready
            && requirements_completed(story.id(), &board.dependencies, &status)
    }));
    candidates.retain(|story| {
        in_scope(story, scope)
            && board
                .work_items
                .get(&story.work_item_id)
                .is_some_and(owner_accepts_work)
    });
    sort_by_selection_order(&mut candidates);
    candidates
}

pub fn next_outcome(board: &Board, scope: Option<WorkItemId>) -> NextOutcome {
    if let Some(story) = select_next(&reservation_candidates(board, scope)) {
        return NextOutcome::Ready(story.id());
    }
    let scoped: Vec<&DeveloperStory> = board
        .stories
        .values()
        .filter(|story| in_scope(story, scope))
        .collect();
    if scoped
        .iter()
        .all(|story| story.status == StoryStatus::Completed)
    {
        return NextOutcome::Complete;
    }
    if scoped
        .iter()
        .any(|story| story.status == StoryStatus::InProgress)
    {
        return NextOutcome::Waiting;
    }
    let stuck = scoped
        .iter()
        .filter(|story| story.status != StoryStatus::Completed)
        .map(|story| story.id())
        .collect();
    NextOutcome::Stalled(stuck)
}

/// Move the chosen story to InProgress.
///
/// With `specific`, that story must be a candidate; otherwise the policy picks.
/// Returns `None` when nothing is reservable.
pub fn reserve(
    board: &mut Board,
    scope: Option<WorkItemId>,
    specific: Option<StoryId>,
    now: DateTime<Utc>,
) -> Result<Option<StoryId>, Error> {
    let candidates = reservation_candidates(board, scope);
    let chosen = match specific {
        Some(id) => {
            if !candidates.iter().any(|story| story.id() == id) {
                let story = board.story(id)?;
                return Err(Error::InvalidStateTransition {
                    entity: EntityKind::Story,
                    id: id.0,
                    from: story.status.as_str(),
                    to: StoryStatus::InProgress.as_str(),
                });
            }
            id
        }
        None => match select_next(&candidates) {
            Some(story) => story.id(),
            None => return Ok(None),
        },
    };

    if board.story(chosen)?.status == StoryStatus::Pending {
        board.transition_story(chosen, StoryStatus::Ready, None, now)?;
    }
    board.transition_story(chosen, StoryStatus::InProgress, None, now)?;
    let owner = board.story(chosen)?.work_item_id;
    if board.work_item(owner)?.status == WorkItemStatus::Refined {
        board.transition_work_item(owner, WorkItemStatus::InProgress, None, now)?;
    }
    Ok(Some(chosen))
}

/// InProgress -> Completed, then release dependents and close the work item
/// once every story in it is done.
pub fn complete_story(
    board: &mut Board,
    id: StoryId,
    now: DateTime<Utc>,
) -> Result<Completion, Error> {
    board.transition_story(id, StoryStatus::Completed, None, now)?;
    let mut completion = Completion::default();

    let status: HashMap<StoryId, StoryStatus> = board
        .stories
        .values()
        .map(|story| (story.id(), story.status))
        .collect();
    let blocked: Vec<StoryId> = board
        .dependencies
        .iter()
        .filter(|edge| edge.required == id)
        .map(|edge| edge.dependent)
        .filter(|dependent| status.get(dependent) == Some(&StoryStatus::Blocked))
        .filter(|dependent| requirements_completed(*dependent, &board.dependencies, &status))
        .collect();
    for dependent in blocked {
        board.transition_story(dependent, StoryStatus::Ready, None, now)?;
        completion.unblocked.push(dependent);
    }

    let owner = board.story(id)?.work_item_id;
    let all_done = board
        .stories_of(owner)?
        .iter()
        .all(|story| story.status == StoryStatus::Completed);
    if all_done && board.work_item(owner)?.status == WorkItemStatus::InProgress {
        board.transition_work_item(owner, WorkItemStatus::Completed, None, now)?;
        completion.work_item_completed = true;
    }
    Ok(completion)
}

/// InProgress -> Error, counting the attempt. At `max_attempts` the story is
/// blocked together with its Ready dependents and the work item fails.
pub fn fail_story(
    board: &mut Board,
    id: StoryId,
    reason: &str,
    max_attempts: u32,
    now: DateTime<Utc>,
) -> Result<Failure, Error> {
    board.transition_story(id, StoryStatus::Error, Some(reason), now)?;
    let story = board.story_mut(id)?;
    story.attempts += 1;
    let mut failure = Failure {
        attempts: story.attempts,
        ..Failure::default()
    };
    if failure.attempts < max_attempts {
        return Ok(failure);
    }

    board.transition_story(id, StoryStatus::Blocked, None, now)?;
    release_workspace_fields(board.story_mut(id)?);
    failure.exhausted = true;

    let cause = format!("blocked by story {id}");
    for dependent in transitive_dependents(id, &board.dependencies) {
        if board.story(dependent)?.status == StoryStatus::Ready {
            board.transition_story(dependent, StoryStatus::Blocked, Some(&cause), now)?;
            failure.blocked_dependents.push(dependent);
        }
    }

    let owner = board.story(id)?.work_item_id;
    let status = board.work_item(owner)?.status;
    if can_transition::<WorkItem>(status, WorkItemStatus::Error) {
        let reason = format!("story {id} failed {} times: {reason}", failure.attempts);
        board.transition_work_item(owner, WorkItemStatus::Error, Some(&reason), now)?;
        failure.work_item_failed = true;
    }
    Ok(failure)
}

/// InProgress -> Error without spending an attempt.
pub fn cancel_story(board: &mut Board, id: StoryId, now: DateTime<Utc>) -> Result<(), Error> {
    board.transition_story(id, StoryStatus::Error, Some(CANCELLED_REASON), now)
}

/// Explicitly return an Error or Blocked story to Ready.
///
/// A story that used up its own attempts gets a fresh budget; one blocked only
/// by a failed requirement keeps its count. Branch and workspace fields are
/// dropped: the next reservation provisions again and reuses what the log says
/// this story still owns. A failed work item is walked back to Refined so its
/// stories can run.
pub fn retry_story(
    board: &mut Board,
    id: StoryId,
    max_attempts: u32,
    now: DateTime<Utc>,
) -> Result<(), Error> {
    let story = board.story(id)?;
    let exhausted = story.status == StoryStatus::Blocked && story.attempts >= max_attempts;
    board.transition_story(id, StoryStatus::Ready, None, now)?;
    let story = board.story_mut(id)?;
    if exhausted {
        story.attempts = 0;
    }
    release_workspace_fields(story);
    let owner = story.work_item_id;
    if board.work_item(owner)?.status == WorkItemStatus::Error {
        board.transition_work_item(owner, WorkItemStatus::Refining, None, now)?;
        board.transition_work_item(owner, WorkItemStatus::Refined, None, now)?;
    }
    Ok(())
}

fn release_workspace_fields(story: &mut DeveloperStory) {
    story.branch_name = None;
    story.workspace_path = None;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::board::NewStory;
    use crate::test_support::{fixed_now, new_story, new_work_item};

    struct Fixture {
        board: Board,
        item: WorkItemId,
    }

    impl Fixture {
        fn refined() -> Self {
            let mut board = Board::default();
            let item = board.create_work_item(new_work_item("login"), fixed_now());
            board
                .transition_work_item(item, WorkItemStatus::Refining, None, fixed_now())
                .expect("refining");
            board
                .transition_work_item(item, WorkItemStatus::Refined, None, fixed_now())
                .expect("refined");
            Self { board, item }
        }

        fn add(&mut self, new: NewStory) -> StoryId {
            self.board
                .add_story(self.item, new, fixed_now())
                .expect("story")
        }

        fn depend(&mut self, dependent: StoryId, required: StoryId) {
            self.board
                .add_dependency(dependent, required, None, fixed_now())
                .expect("edge");
        }

        fn status(&self, id: StoryId) -> StoryStatus {
            self.board.story(id).expect("story").status
        }

        fn reserve(&mut self) -> Option<StoryId> {
            reserve(&mut self.board, None, None, fixed_now()).expect("reserve")
        }
    }

    #[test]
    fn dependency_chain_runs_in_order() {
        let mut fx = Fixture::refined();
        let s1 = fx.add(new_story("s1", 1));
        let s2 = fx.add(new_story("s2", 2));
        fx.depend(s2, s1);

        assert_eq!(next_outcome(&fx.board, None), NextOutcome::Ready(s1));
        assert_eq!(fx.reserve(), Some(s1));
        assert_eq!(
            fx.board.work_item(fx.item).expect("item").status,
            WorkItemStatus::InProgress
        );
        assert_eq!(next_outcome(&fx.board, None), NextOutcome::Waiting);

        complete_story(&mut fx.board, s1, fixed_now()).expect("complete");
        assert_eq!(next_outcome(&fx.board, None), NextOutcome::Ready(s2));
        assert_eq!(fx.reserve(), Some(s2));
        let done = complete_story(&mut fx.board, s2, fixed_now()).expect("complete");
        assert!(done.work_item_completed);
        assert_eq!(next_outcome(&fx.board, None), NextOutcome::Complete);
    }

    #[test]
    fn unrefined_work_items_are_not_scheduled() {
        let mut board = Board::default();
        let item = board.create_work_item(new_work_item("x"), fixed_now());
        board
            .add_story(item, new_story("s", 1), fixed_now())
            .expect("story");
        assert!(reservation_candidates(&board, None).is_empty());
    }

    #[test]
    fn scope_limits_candidates_to_one_work_item() {
        let mut fx = Fixture::refined();
        let mine = fx.add(new_story("mine", 5));
        let other = fx
            .board
            .create_work_item(new_work_item("other"), fixed_now());
        fx.board
            .transition_work_item(other, WorkItemStatus::Refining, None, fixed_now())
            .expect("refining");
        fx.board
            .transition_work_item(other, WorkItemStatus::Refined, None, fixed_now())
            .expect("refined");
        fx.board
            .add_story(other, new_story("theirs", 1), fixed_now())
            .expect("story");
        assert_eq!(
            next_outcome(&fx.board, Some(fx.item)),
            NextOutcome::Ready(mine)
        );
    }

    #[test]
    fn specific_story_must_be_reservable() {
        let mut fx = Fixture::refined();
        let s1 = fx.add(new_story("s1", 1));
        let s2 = fx.add(new_story("s2", 1));
        fx.depend(s2, s1);
        let err = reserve(&mut fx.board, None, Some(s2), fixed_now()).expect_err("blocked");
        assert!(matches!(err, Error::InvalidStateTransition { from: "pending", .. }));
        assert_eq!(fx.status(s2), StoryStatus::Pending);
        assert_eq!(
            reserve(&mut fx.board, None, Some(s1), fixed_now()).expect("reserve"),
            Some(s1)
        );
    }

    #[test]
    fn failures_below_limit_leave_story_retryable() {
        let mut fx = Fixture::refined();
        let s1 = fx.add(new_story("s1", 1));
        fx.reserve();
        let failure = fail_story(&mut fx.board, s1, "tests failed", 3, fixed_now()).expect("fail");
        assert_eq!(failure.attempts, 1);
        assert!(!failure.exhausted);
        assert_eq!(fx.status(s1), StoryStatus::Error);

        retry_story(&mut fx.board, s1, 3, fixed_now()).expect("retry");
        assert_eq!(fx.board.story(s1).expect("s1").attempts, 1);
        assert_eq!(fx.reserve(), Some(s1));
    }

    #[test]
    fn exhaustion_blocks_story_dependents_and_work_item() {
        let mut fx = Fixture::refined();
        let s1 = fx.add(new_story("s1", 1));
        let s2 = fx.add(new_story("s2", 1));
        let s3 = fx.add(new_story("s3", 1));
        fx.depend(s2, s1);
        fx.depend(s3, s2);
        fx.reserve();
        // A dependency added after s3 was retried leaves it Ready but waiting.
        fx.board.story_mut(s3).expect("s3").status = StoryStatus::Ready;

        let failure = fail_story(&mut fx.board, s1, "compile error", 1, fixed_now()).expect("fail");
        assert!(failure.exhausted);
        assert!(failure.work_item_failed);
        assert_eq!(failure.blocked_dependents, vec![s3]);
        assert_eq!(fx.status(s1), StoryStatus::Blocked);
        assert_eq!(fx.status(s2), StoryStatus::Pending);
        assert_eq!(fx.status(s3), StoryStatus::Blocked);
        assert_eq!(
            fx.board.story(s1).expect("s1").error_message.as_deref(),
            Some("compile error")
        );
        assert_eq!(
            fx.board.work_item(fx.item).expect("item").status,
            WorkItemStatus::Error
        );
        assert!(matches!(next_outcome(&fx.board, None), NextOutcome::Stalled(_)));
    }

    #[test]
    fn retry_after_exhaustion_reopens_work_item_and_completion_unblocks() {
        let mut fx = Fixture::refined();
        let s1 = fx.add(new_story("s1", 1));
        let s2 = fx.add(new_story("s2", 1));
        fx.depend(s2, s1);
        fx.reserve();
        fx.board.story_mut(s2).expect("s2").status = StoryStatus::Ready;
        fail_story(&mut fx.board, s1, "boom", 1, fixed_now()).expect("fail");
        assert_eq!(fx.status(s2), StoryStatus::Blocked);

        retry_story(&mut fx.board, s1, 1, fixed_now()).expect("retry");
        assert_eq!(
            fx.board.work_item(fx.item).expect("item").status,
            WorkItemStatus::Refined
        );
        assert_eq!(fx.board.story(s1).expect("s1").attempts, 0);
        assert_eq!(fx.reserve(), Some(s1));
        let completion = complete_story(&mut fx.board, s1, fixed_now()).expect("complete");
        assert_eq!(completion.unblocked, vec![s2]);
        assert_eq!(fx.status(s2), StoryStatus::Ready);
        assert_eq!(next_outcome(&fx.board, None), NextOutcome::Ready(s2));
    }

    #[test]
    fn workspace_fields_are_dropped_when_leaving_error_or_exhausting() {
        let mut fx = Fixture::refined();
        let s1 = fx.add(new_story("s1", 1));
        let attach = |board: &mut Board| {
            let story = board.story_mut(s1).expect("s1");
            story.branch_name = Some("us-1-1".to_string());
            story.workspace_path = Some("/trees/us-1-1".into());
        };

        fx.reserve();
        attach(&mut fx.board);
        fail_story(&mut fx.board, s1, "red", 2, fixed_now()).expect("fail");
        let story = fx.board.story(s1).expect("s1");
        assert_eq!(story.status, StoryStatus::Error);
        assert_eq!(story.branch_name.as_deref(), Some("us-1-1"));

        retry_story(&mut fx.board, s1, 2, fixed_now()).expect("retry");
        let story = fx.board.story(s1).expect("s1");
        assert_eq!(story.status, StoryStatus::Ready);
        assert_eq!(story.branch_name, None);
        assert_eq!(story.workspace_path, None);

        fx.reserve();
        attach(&mut fx.board);
        let failure = fail_story(&mut fx.board, s1, "red again", 2, fixed_now()).expect("fail");
        assert!(failure.exhausted);
        let story = fx.board.story(s1).expect("s1");
        assert_eq!(story.status, StoryStatus::Blocked);
        assert_eq!(story.branch_name, None);
        assert_eq!(story.workspace_path, None);
    }

    #[test]
    fn retry_of_a_dependent_blocked_story_keeps_its_attempts() {
        let mut fx = Fixture::refined();
        let s1 = fx.add(new_story("s1", 1));
        let s2 = fx.add(new_story("s2", 1));
        fx.depend(s2, s1);
        fx.reserve();
        {
            let dependent = fx.board.story_mut(s2).expect("s2");
            dependent.status = StoryStatus::Ready;
            dependent.attempts = 1;
        }
        fail_story(&mut fx.board, s1, "boom", 1, fixed_now()).expect("fail");
        assert_eq!(fx.status(s2), StoryStatus::Blocked);

        retry_story(&mut fx.board, s2, 3, fixed_now()).expect("retry");
        assert_eq!(fx.status(s2), StoryStatus::Ready);
        assert_eq!(fx.board.story(s2).expect("s2").attempts, 1);
    }

    #[test]
    fn cancellation_does_not_spend_an_attempt() {
        let mut fx = Fixture::refined();
        let s1 = fx.add(new_story("s1", 1));
        fx.reserve();
        cancel_story(&mut fx.board, s1, fixed_now()).expect("cancel");
        let story = fx.board.story(s1).expect("s1");
        assert_eq!(story.status, StoryStatus::Error);
        assert_eq!(story.error_message.as_deref(), Some(CANCELLED_REASON));
        assert_eq!(story.attempts, 0);
    }

    #[test]
    fn nothing_running_and_nothing_ready_is_stalled() {
        let mut fx = Fixture::refined();
        let s1 = fx.add(new_story("s1", 1));
        fx.reserve();
        fail_story(&mut fx.board, s1, "boom", 5, fixed_now()).expect("fail");
        assert_eq!(next_outcome(&fx.board, None), NextOutcome::Stalled(vec![s1]));
    }
}
