//! Id-keyed arena holding every work item, story and dependency edge.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::error::{EntityKind, Error};
use crate::core::graph;
use crate::core::transitions::transition;
use crate::core::types::{
    Dependency, DeveloperStory, Identity, Metadata, StoryId, StoryStatus, StoryType, WorkItem,
    WorkItemId, WorkItemStatus, WorkItemType,
};

/// Fields supplied when creating a work item.
#[derive(Debug, Clone)]
pub struct NewWorkItem {
    pub kind: WorkItemType,
    pub title: String,
    pub description: String,
    pub acceptance_criteria: Option<String>,
    pub priority: u8,
    pub base_ref: Option<String>,
}

/// Fields supplied when creating a developer story.
#[derive(Debug, Clone)]
pub struct NewStory {
    pub story_type: StoryType,
    pub title: String,
    pub description: String,
    pub instructions: String,
    pub priority: u8,
    pub metadata: Option<Metadata>,
    pub branch_override: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Board {
    /// Last id handed out for a work item (0 = none yet).
    pub last_work_item_id: u64,
    /// Last id handed out for a story (0 = none yet).
    pub last_story_id: u64,
    pub work_items: BTreeMap<WorkItemId, WorkItem>,
    pub stories: BTreeMap<StoryId, DeveloperStory>,
    pub dependencies: Vec<Dependency>,
}

impl Board {
    pub fn create_work_item(&mut self, new: NewWorkItem, now: DateTime<Utc>) -> WorkItemId {
        self.last_work_item_id += 1;
        let id = WorkItemId(self.last_work_item_id);
        self.work_items.insert(
            id,
            WorkItem {
                identity: Identity::new(id, now),
                kind: new.kind,
                title: new.title,
                description: new.description,
                acceptance_criteria: new.acceptance_criteria,
                priority: clamp_priority(new.priority),
                status: WorkItemStatus::Pending,
                error_message: None,
                updated_at: now,
                base_ref: new.base_ref,
                stories: Vec::new(),
            },
        );
        id
    }

    pub fn add_story(
        &mut self,
        work_item: WorkItemId,
        new: NewStory,
        now: DateTime<Utc>,
    ) -> Result<StoryId, Error> {
        let owner = self
            .work_items
            .get_mut(&work_item)
            .ok_or_else(|| work_item_not_found(work_item))?;
        self.last_story_id += 1;
        let id = StoryId(self.last_story_id);
        owner.stories.push(id);
        self.stories.insert(
            id,
            DeveloperStory {
                identity: Identity::new(id, now),
                work_item_id: work_item,
                story_type: new.story_type,
                title: new.title,
                description: new.description,
                instructions: new.instructions,
                priority: clamp_priority(new.priority),
                status: StoryStatus::Pending,
                branch_name: None,
                workspace_path: None,
                started_at: None,
                completed_at: None,
                error_message: None,
                metadata: new.metadata,
                attempts: 0,
                branch_override: new.branch_override,
                updated_at: now,
            },
        );
        Ok(id)
    }

    pub fn work_item(&self, id: WorkItemId) -> Result<&WorkItem, Error> {
        self.work_items
            .get(&id)
            .ok_or_else(|| work_item_not_found(id))
    }

    pub fn work_item_mut(&mut self, id: WorkItemId) -> Result<&mut WorkItem, Error> {
        self.work_items
            .get_mut(&id)
            .ok_or_else(|| work_item_not_found(id))
    }

    pub fn story(&self, id: StoryId) -> Result<&DeveloperStory, Error> {
        self.stories
            .get(&id)
            .ok_or_else(|| Error::story_not_found(id))
    }

    pub fn story_mut(&mut self, id: StoryId) -> Result<&mut DeveloperStory, Error> {
        self.stories
            .get_mut(&id)
            .ok_or_else(|| Error::story_not_found(id))
    }

    /// Stories owned by `work_item`, in creation order.
    pub fn stories_of(&self, work_item: WorkItemId) -> Result<Vec<&DeveloperStory>, Error> {
        let owner = self.work_item(work_item)?;
        owner.stories.iter().map(|id| self.story(*id)).collect()
    }

    pub fn all_stories(&self) -> Vec<&DeveloperStory> {
        self.stories.values().collect()
    }

    /// Edges whose dependent is `story`.
    pub fn requirements_of(&self, story: StoryId) -> Vec<&Dependency> {
        self.dependencies
            .iter()
            .filter(|edge| edge.dependent == story)
            .collect()
    }

    /// Add `dependent -> required` after checking both stories exist.
    pub fn add_dependency(
        &mut self,
        dependent: StoryId,
        required: StoryId,
        description: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), Error> {
        self.story(dependent)?;
        self.story(required)?;
        graph::add_dependency(&mut self.dependencies, dependent, required, description, now)
    }

    pub fn transition_story(
        &mut self,
        id: StoryId,
        target: StoryStatus,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), Error> {
        transition(self.story_mut(id)?, target, reason, now)
    }

    pub fn transition_work_item(
        &mut self,
        id: WorkItemId,
        target: WorkItemStatus,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), Error> {
        transition(self.work_item_mut(id)?, target, reason, now)
    }

    /// Delete a story together with every edge that references it.
    pub fn remove_story(&mut self, id: StoryId) -> Result<DeveloperStory, Error> {
        let story = self
            .stories
            .remove(&id)
            .ok_or_else(|| Error::story_not_found(id))?;
        if let Some(owner) = self.work_items.get_mut(&story.work_item_id) {
            owner.stories.retain(|owned| *owned != id);
        }
        self.dependencies
            .retain(|edge| edge.dependent != id && edge.required != id);
        Ok(story)
    }

    /// Delete a work item and, by cascade, its stories and their edges.
    pub fn remove_work_item(&mut self, id: WorkItemId) -> Result<WorkItem, Error> {
        let owned = self.work_item(id)?.stories.clone();
        for story in owned {
            self.remove_story(story)?;
        }
        self.work_items
            .remove(&id)
            .ok_or_else(|| work_item_not_found(id))
    }
}

fn clamp_priority(priority: u8) -> u8 {
    priority.clamp(1, 9)
}

fn work_item_not_found(id: WorkItemId) -> Error {
    Error::EntityNotFound {
        kind: EntityKind::WorkItem,
        id: id.0,
    }
}
