//! Work item refinement.
//!
//! The provider proposes a story breakdown as JSON. The plan is checked against
//! an embedded schema, then applied to the board in one commit: either every
//! story and edge lands, or nothing does.

use std::collections::{HashMap, HashSet};

use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, Utc};
use jsonschema::validator_for;
use serde::Deserialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::app::App;
use crate::core::board::{Board, NewStory};
use crate::core::error::Subject;
use crate::core::types::{StoryId, StoryStatus, StoryType, WorkItemId, WorkItemStatus};
use crate::io::prompt::{render_refinement_instructions, render_work_item_context};
use crate::io::provider::{ProviderRequest, execute_with_retry};

const REFINEMENT_SCHEMA: &str = include_str!("../schemas/refinement.schema.json");

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PlannedStory {
    pub key: String,
    pub story_type: StoryType,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub instructions: String,
    pub priority: u8,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RefinementPlan {
    pub stories: Vec<PlannedStory>,
}

/// Extract, validate and decode a plan from raw provider output.
///
/// The JSON object may be surrounded by prose or a code fence.
pub fn parse_refinement(output: &str) -> Result<RefinementPlan> {
    let start = output.find('{');
    let end = output.rfind('}');
    let raw = match (start, end) {
        (Some(start), Some(end)) if start < end => &output[start..=end],
        _ => bail!("refinement output contains no JSON object"),
    };
    let value: Value = serde_json::from_str(raw).context("parse refinement json")?;

    let schema: Value =
        serde_json::from_str(REFINEMENT_SCHEMA).context("parse refinement schema")?;
    let validator = validator_for(&schema).map_err(|err| anyhow!("invalid schema: {err}"))?;
    if !validator.is_valid(&value) {
        let messages = validator
            .iter_errors(&value)
            .map(|err| err.to_string())
            .collect::<Vec<_>>();
        bail!("refinement schema validation failed: {}", messages.join("; "));
    }

    let plan: RefinementPlan =
        serde_json::from_value(value).context("deserialize refinement plan")?;
    check_keys(&plan)?;
    Ok(plan)
}

fn check_keys(plan: &RefinementPlan) -> Result<()> {
    let mut keys = HashSet::new();
    for story in &plan.stories {
        if !keys.insert(story.key.as_str()) {
            bail!("duplicate story key '{}'", story.key);
        }
    }
    for story in &plan.stories {
        if let Some(unknown) = story.depends_on.iter().find(|key| !keys.contains(key.as_str())) {
            bail!("story '{}' depends on unknown key '{unknown}'", story.key);
        }
    }
    Ok(())
}

/// Pending|Error -> Refining. Stories that never started are discarded so the
/// new plan replaces them; started ones keep their history.
pub fn begin_refinement(board: &mut Board, id: WorkItemId, now: DateTime<Utc>) -> Result<()> {
    board.transition_work_item(id, WorkItemStatus::Refining, None, now)?;
    let unstarted: Vec<StoryId> = board
        .stories_of(id)?
        .iter()
        .filter(|story| story.started_at.is_none() && story.status != StoryStatus::InProgress)
        .map(|story| story.id())
        .collect();
    for story in unstarted {
        board.remove_story(story)?;
    }
    Ok(())
}

/// Create the planned stories and edges, then mark the work item Refined.
pub fn apply_plan(
    board: &mut Board,
    id: WorkItemId,
    plan: &RefinementPlan,
    now: DateTime<Utc>,
) -> Result<Vec<StoryId>> {
    let mut ids: HashMap<&str, StoryId> = HashMap::new();
    let mut created = Vec::with_capacity(plan.stories.len());
    for planned in &plan.stories {
        let story = board.add_story(
            id,
            NewStory {
                story_type: planned.story_type,
                title: planned.title.clone(),
                description: planned.description.clone(),
                instructions: planned.instructions.clone(),
                priority: planned.priority,
                metadata: None,
                branch_override: None,
            },
            now,
        )?;
        ids.insert(planned.key.as_str(), story);
        created.push(story);
    }
    for planned in &plan.stories {
        let dependent = ids[planned.key.as_str()];
        for key in &planned.depends_on {
            let required = *ids
                .get(key.as_str())
                .ok_or_else(|| anyhow!("story '{}' depends on unknown key '{key}'", planned.key))?;
            board
                .add_dependency(dependent, required, None, now)
                .with_context(|| format!("add dependency {} -> {key}", planned.key))?;
        }
    }
    board.transition_work_item(id, WorkItemStatus::Refined, None, now)?;
    Ok(created)
}

/// Ask the provider to break `id` into stories and apply the result.
///
/// Any failure leaves the work item in Error with the reason.
#[instrument(skip(app, cancel))]
pub async fn refine_work_item(
    app: &App,
    id: WorkItemId,
    cancel: &CancellationToken,
) -> Result<Vec<StoryId>> {
    app.scheduler
        .update(|board, now| begin_refinement(board, id, now))?;
    match plan_and_apply(app, id, cancel).await {
        Ok(created) => {
            info!(stories = created.len(), "work item refined");
            Ok(created)
        }
        Err(err) => {
            warn!(err = %format!("{err:#}"), "refinement failed");
            app.scheduler
                .fail_work_item(id, &format!("refinement failed: {err:#}"))?;
            Err(err)
        }
    }
}

async fn plan_and_apply(
    app: &App,
    id: WorkItemId,
    cancel: &CancellationToken,
) -> Result<Vec<StoryId>> {
    let board = app.scheduler.snapshot()?;
    let item = board.work_item(id)?;
    let completed: Vec<_> = board
        .stories_of(id)?
        .into_iter()
        .filter(|story| story.status == StoryStatus::Completed)
        .collect();
    let request = ProviderRequest {
        subject: Subject::WorkItem(id),
        context: render_work_item_context(item, &completed)?,
        instructions: render_refinement_instructions()?,
        prior_analysis: item.error_message.clone(),
        workdir: app.root.clone(),
    };
    let response = execute_with_retry(
        app.provider.as_ref(),
        &request,
        &app.retry,
        app.log(),
        cancel,
    )
    .await?;
    let plan = parse_refinement(&response.output)?;
    app.scheduler
        .update(|board, now| apply_plan(board, id, &plan, now))
}
