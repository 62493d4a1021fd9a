//! Fault taxonomy for scheduler operations.
//!
//! Every variant names the entity it concerns so the CLI can bind the message to
//! the originating story or work item.

use std::fmt;

use thiserror::Error;

use crate::core::types::{StoryId, WorkItemId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    WorkItem,
    Story,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKind::WorkItem => f.write_str("work item"),
            EntityKind::Story => f.write_str("story"),
        }
    }
}

/// What a provider call was made for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subject {
    WorkItem(WorkItemId),
    Story(StoryId),
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Subject::WorkItem(id) => write!(f, "work item {id}"),
            Subject::Story(id) => write!(f, "story {id}"),
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("{entity} {id}: illegal status transition {from} -> {to}")]
    InvalidStateTransition {
        entity: EntityKind,
        id: u64,
        from: &'static str,
        to: &'static str,
    },

    #[error("story {dependent} cannot depend on story {required}: dependency cycle")]
    CycleDetected {
        dependent: StoryId,
        required: StoryId,
    },

    #[error("story {story} cannot depend on itself")]
    SelfDependency { story: StoryId },

    #[error("story {dependent} already depends on story {required}")]
    DuplicateDependency {
        dependent: StoryId,
        required: StoryId,
    },

    #[error("story {story}: branch '{branch}' already exists and belongs to another run")]
    BranchAlreadyExists { story: StoryId, branch: String },

    #[error("story {story}: workspace provisioning failed: {source}")]
    WorkspaceProvisionFailed {
        story: StoryId,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("{kind} {id} not found")]
    EntityNotFound { kind: EntityKind, id: u64 },

    #[error("{subject}: ai provider failure: {message}")]
    AiProviderFailure {
        subject: Subject,
        message: String,
        transient: bool,
    },

    #[error("{subject}: cancelled")]
    Cancelled { subject: Subject },
}

impl Error {
    pub fn story_not_found(id: StoryId) -> Self {
        Self::EntityNotFound {
            kind: EntityKind::Story,
            id: id.0,
        }
    }

    /// Stable, machine-friendly category printed next to CLI errors.
    pub fn category(&self) -> &'static str {
        match self {
            Error::InvalidStateTransition { .. } => "invalid_state_transition",
            Error::CycleDetected { .. } => "cycle_detected",
            Error::SelfDependency { .. } => "self_dependency",
            Error::DuplicateDependency { .. } => "duplicate_dependency",
            Error::BranchAlreadyExists { .. } => "branch_already_exists",
            Error::WorkspaceProvisionFailed { .. } => "workspace_provision_failed",
            Error::EntityNotFound { .. } => "entity_not_found",
            Error::AiProviderFailure { .. } => "ai_provider_failure",
            Error::Cancelled { .. } => "cancelled",
        }
    }
}

/// Find the first typed fault anywhere in an error chain.
pub fn find_fault(err: &anyhow::Error) -> Option<&Error> {
    err.chain().find_map(|cause| cause.downcast_ref::<Error>())
}

/// Category for any error; untyped faults report as `internal`.
pub fn fault_category(err: &anyhow::Error) -> &'static str {
    find_fault(err).map_or("internal", Error::category)
}
