//! Entities shared by the scheduler core.
//!
//! Entities reference each other by id only. The owning arena is
//! [`crate::core::board::Board`]; nothing here holds a live back-reference.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque key-value payload attached to stories and log entries.
pub type Metadata = BTreeMap<String, serde_json::Value>;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_type!(
    /// Identifier of a [`WorkItem`].
    WorkItemId
);
id_type!(
    /// Identifier of a [`DeveloperStory`].
    StoryId
);
id_type!(
    /// Identifier of an [`ExecutionLogEntry`]. Strictly increasing in record order.
    LogId
);

/// Identity shared by every persisted entity, embedded by composition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity<I> {
    pub id: I,
    pub created_at: DateTime<Utc>,
}

impl<I> Identity<I> {
    pub fn new(id: I, created_at: DateTime<Utc>) -> Self {
        Self { id, created_at }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemType {
    UserStory,
    Bug,
}

impl WorkItemType {
    pub fn branch_prefix(self) -> &'static str {
        match self {
            WorkItemType::UserStory => "us",
            WorkItemType::Bug => "bug",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WorkItemType::UserStory => "user_story",
            WorkItemType::Bug => "bug",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemStatus {
    Pending,
    Refining,
    Refined,
    InProgress,
    Completed,
    Error,
}

impl WorkItemStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkItemStatus::Pending => "pending",
            WorkItemStatus::Refining => "refining",
            WorkItemStatus::Refined => "refined",
            WorkItemStatus::InProgress => "in_progress",
            WorkItemStatus::Completed => "completed",
            WorkItemStatus::Error => "error",
        }
    }
}

impl fmt::Display for WorkItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoryType {
    Implementation,
    UnitTests,
    FeatureTests,
    Documentation,
}

impl StoryType {
    pub fn as_str(self) -> &'static str {
        match self {
            StoryType::Implementation => "implementation",
            StoryType::UnitTests => "unit_tests",
            StoryType::FeatureTests => "feature_tests",
            StoryType::Documentation => "documentation",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoryStatus {
    Pending,
    Ready,
    InProgress,
    Completed,
    Error,
    Blocked,
}

impl StoryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StoryStatus::Pending => "pending",
            StoryStatus::Ready => "ready",
            StoryStatus::InProgress => "in_progress",
            StoryStatus::Completed => "completed",
            StoryStatus::Error => "error",
            StoryStatus::Blocked => "blocked",
        }
    }
}

impl fmt::Display for StoryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top-level unit of requested work (user story or bug).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    #[serde(flatten)]
    pub identity: Identity<WorkItemId>,
    pub kind: WorkItemType,
    pub title: String,
    pub description: String,
    pub acceptance_criteria: Option<String>,
    /// 1 (highest) through 9.
    pub priority: u8,
    pub status: WorkItemStatus,
    pub error_message: Option<String>,
    pub updated_at: DateTime<Utc>,
    /// Ref that story branches are cut from. Falls back to the configured base ref.
    pub base_ref: Option<String>,
    /// Owned stories, in creation order.
    pub stories: Vec<StoryId>,
}

impl WorkItem {
    pub fn id(&self) -> WorkItemId {
        self.identity.id
    }

    pub fn branch_prefix(&self) -> &'static str {
        self.kind.branch_prefix()
    }

    /// `{prefix}-{id}`, e.g. `us-12` or `bug-3`.
    pub fn default_branch_name(&self) -> String {
        format!("{}-{}", self.branch_prefix(), self.id())
    }
}

/// Independently executable unit of work under a work item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeveloperStory {
    #[serde(flatten)]
    pub identity: Identity<StoryId>,
    pub work_item_id: WorkItemId,
    pub story_type: StoryType,
    pub title: String,
    pub description: String,
    /// Prompt handed to the provider when the story executes.
    pub instructions: String,
    pub priority: u8,
    pub status: StoryStatus,
    pub branch_name: Option<String>,
    pub workspace_path: Option<PathBuf>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub metadata: Option<Metadata>,
    /// Finished attempts that ended in a non-cancelled failure.
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub branch_override: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl DeveloperStory {
    pub fn id(&self) -> StoryId {
        self.identity.id
    }
}

/// Directed edge: `dependent` cannot start before `required` is completed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    pub dependent: StoryId,
    pub required: StoryId,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogEvent {
    Started,
    Completed,
    Failed,
    Retried,
    BranchCreated,
    WorktreeCreated,
    WorktreeRemoved,
    Info,
}

impl LogEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            LogEvent::Started => "started",
            LogEvent::Completed => "completed",
            LogEvent::Failed => "failed",
            LogEvent::Retried => "retried",
            LogEvent::BranchCreated => "branch_created",
            LogEvent::WorktreeCreated => "worktree_created",
            LogEvent::WorktreeRemoved => "worktree_removed",
            LogEvent::Info => "info",
        }
    }

    /// Events that close an execution attempt opened by `Started`.
    pub fn is_terminal(self) -> bool {
        matches!(self, LogEvent::Completed | LogEvent::Failed)
    }
}

impl fmt::Display for LogEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One immutable audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionLogEntry {
    pub id: LogId,
    pub story_id: StoryId,
    pub event: LogEvent,
    pub timestamp: DateTime<Utc>,
    pub details: Option<String>,
    pub error_message: Option<String>,
    pub metadata: Option<Metadata>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::work_item;

    #[test]
    fn branch_names_derive_from_type_and_id() {
        let story = work_item(12, WorkItemType::UserStory);
        assert_eq!(story.default_branch_name(), "us-12");
        let bug = work_item(3, WorkItemType::Bug);
        assert_eq!(bug.default_branch_name(), "bug-3");
    }

    #[test]
    fn identity_is_flattened_into_entity_json() {
        let item = work_item(7, WorkItemType::Bug);
        let value = serde_json::to_value(&item).expect("serialize");
        assert_eq!(value["id"], 7);
        assert_eq!(value["kind"], "bug");
        assert_eq!(value["status"], "pending");
        assert!(value.get("identity").is_none());
    }
}
