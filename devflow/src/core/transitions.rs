//! Status state machines for work items and developer stories.
//!
//! Legal moves live in explicit tables. Adding a state means editing a table,
//! not a match arm.

use chrono::{DateTime, Utc};

use crate::core::error::{EntityKind, Error};
use crate::core::types::{DeveloperStory, StoryStatus, WorkItem, WorkItemStatus};

const WORK_ITEM_TRANSITIONS: &[(WorkItemStatus, WorkItemStatus)] = &[
    (WorkItemStatus::Pending, WorkItemStatus::Refining),
    (WorkItemStatus::Pending, WorkItemStatus::Error),
    (WorkItemStatus::Refining, WorkItemStatus::Refined),
    (WorkItemStatus::Refining, WorkItemStatus::Error),
    (WorkItemStatus::Refined, WorkItemStatus::InProgress),
    (WorkItemStatus::Refined, WorkItemStatus::Error),
    (WorkItemStatus::InProgress, WorkItemStatus::Completed),
    (WorkItemStatus::InProgress, WorkItemStatus::Error),
    (WorkItemStatus::Error, WorkItemStatus::Pending),
    (WorkItemStatus::Error, WorkItemStatus::Refining),
];

const STORY_TRANSITIONS: &[(StoryStatus, StoryStatus)] = &[
    (StoryStatus::Pending, StoryStatus::Ready),
    (StoryStatus::Ready, StoryStatus::InProgress),
    (StoryStatus::InProgress, StoryStatus::Completed),
    (StoryStatus::InProgress, StoryStatus::Error),
    (StoryStatus::Error, StoryStatus::Ready),
    (StoryStatus::Error, StoryStatus::Blocked),
    (StoryStatus::Ready, StoryStatus::Blocked),
    (StoryStatus::Blocked, StoryStatus::Ready),
];

/// An entity whose status is governed by a transition table.
pub trait Lifecycle {
    type Status: Copy + PartialEq + 'static;

    const ENTITY: EntityKind;
    const TABLE: &'static [(Self::Status, Self::Status)];

    fn raw_id(&self) -> u64;
    fn status(&self) -> Self::Status;
    fn status_label(status: Self::Status) -> &'static str;

    /// Write the new status and any status-specific stamps.
    fn apply(&mut self, target: Self::Status, reason: Option<&str>, now: DateTime<Utc>);
}

pub fn can_transition<L: Lifecycle>(current: L::Status, target: L::Status) -> bool {
    L::TABLE.contains(&(current, target))
}

/// Move `entity` to `target`, or fail without touching it.
///
/// `reason` becomes the error message when entering an error status; leaving
/// one clears it.
pub fn transition<L: Lifecycle>(
    entity: &mut L,
    target: L::Status,
    reason: Option<&str>,
    now: DateTime<Utc>,
) -> Result<(), Error> {
    let current = entity.status();
    if !can_transition::<L>(current, target) {
        return Err(Error::InvalidStateTransition {
            entity: L::ENTITY,
            id: entity.raw_id(),
            from: L::status_label(current),
            to: L::status_label(target),
        });
    }
    entity.apply(target, reason, now);
    Ok(())
}

impl Lifecycle for WorkItem {
    type Status = WorkItemStatus;

    const ENTITY: EntityKind = EntityKind::WorkItem;
    const TABLE: &'static [(WorkItemStatus, WorkItemStatus)] = WORK_ITEM_TRANSITIONS;

    fn raw_id(&self) -> u64 {
        self.id().0
    }

    fn status(&self) -> WorkItemStatus {
        self.status
    }

    fn status_label(status: WorkItemStatus) -> &'static str {
        status.as_str()
    }

    fn apply(&mut self, target: WorkItemStatus, reason: Option<&str>, now: DateTime<Utc>) {
        self.error_message = match target {
            WorkItemStatus::Error => Some(error_reason(reason)),
            _ => None,
        };
        self.status = target;
        self.updated_at = now;
    }
}

impl Lifecycle for DeveloperStory {
    type Status = StoryStatus;

    const ENTITY: EntityKind = EntityKind::Story;
    const TABLE: &'static [(StoryStatus, StoryStatus)] = STORY_TRANSITIONS;

    fn raw_id(&self) -> u64 {
        self.id().0
    }

    fn status(&self) -> StoryStatus {
        self.status
    }

    fn status_label(status: StoryStatus) -> &'static str {
        status.as_str()
    }

    fn apply(&mut self, target: StoryStatus, reason: Option<&str>, now: DateTime<Utc>) {
        match target {
            StoryStatus::InProgress => self.started_at = Some(now),
            StoryStatus::Completed => self.completed_at = Some(now),
            _ => {}
        }
        match target {
            StoryStatus::Error => self.error_message = Some(error_reason(reason)),
            // Blocked keeps the failure that led to it unless a new cause is given.
            StoryStatus::Blocked => {
                if let Some(reason) = reason {
                    self.error_message = Some(reason.to_string());
                }
            }
            _ => self.error_message = None,
        }
        self.status = target;
        self.updated_at = now;
    }
}

fn error_reason(reason: Option<&str>) -> String {
    reason.unwrap_or("unspecified error").to_string()
}
