//! Prompt rendering for provider calls.

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use serde::Serialize;

use super::provider::ProviderRequest;
use crate::core::types::{DeveloperStory, WorkItem};

const CONTEXT_TEMPLATE: &str = include_str!("prompts/context.md");
const REFINE_TEMPLATE: &str = include_str!("prompts/refine.md");
const IMPLEMENT_TEMPLATE: &str = include_str!("prompts/implement.md");
const REQUEST_TEMPLATE: &str = include_str!("prompts/request.md");

#[derive(Debug, Serialize)]
struct WorkItemContext<'a> {
    id: u64,
    kind: &'static str,
    priority: u8,
    title: &'a str,
    description: &'a str,
    acceptance_criteria: Option<&'a str>,
}

impl<'a> WorkItemContext<'a> {
    fn from_work_item(item: &'a WorkItem) -> Self {
        Self {
            id: item.id().0,
            kind: item.kind.as_str(),
            priority: item.priority,
            title: &item.title,
            description: &item.description,
            acceptance_criteria: item
                .acceptance_criteria
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty()),
        }
    }
}

#[derive(Debug, Serialize)]
struct StoryContext<'a> {
    id: u64,
    story_type: &'static str,
    title: &'a str,
    description: &'a str,
    instructions: &'a str,
    branch: Option<&'a str>,
}

impl<'a> StoryContext<'a> {
    fn from_story(story: &'a DeveloperStory) -> Self {
        Self {
            id: story.id().0,
            story_type: story.story_type.as_str(),
            title: &story.title,
            description: story.description.trim(),
            instructions: story.instructions.trim(),
            branch: story.branch_name.as_deref(),
        }
    }
}

/// Template engine wrapper around minijinja.
struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    fn new() -> Result<Self> {
        let mut env = Environment::new();
        env.add_template("context", CONTEXT_TEMPLATE)
            .context("load context template")?;
        env.add_template("refine", REFINE_TEMPLATE)
            .context("load refine template")?;
        env.add_template("implement", IMPLEMENT_TEMPLATE)
            .context("load implement template")?;
        env.add_template("request", REQUEST_TEMPLATE)
            .context("load request template")?;
        Ok(Self { env })
    }

    fn render(&self, name: &str, ctx: minijinja::Value) -> Result<String> {
        let template = self.env.get_template(name)?;
        let rendered = template
            .render(ctx)
            .with_context(|| format!("render {name} prompt"))?;
        Ok(rendered)
    }
}

/// Work item summary plus the stories already delivered for it.
pub fn render_work_item_context(item: &WorkItem, completed: &[&DeveloperStory]) -> Result<String> {
    let completed: Vec<StoryContext<'_>> = completed
        .iter()
        .map(|story| StoryContext::from_story(story))
        .collect();
    PromptEngine::new()?.render(
        "context",
        context! {
            work_item => WorkItemContext::from_work_item(item),
            completed => completed,
        },
    )
}

pub fn render_refinement_instructions() -> Result<String> {
    PromptEngine::new()?.render("refine", context! {})
}

pub fn render_story_instructions(story: &DeveloperStory, branch: &str) -> Result<String> {
    PromptEngine::new()?.render(
        "implement",
        context! {
            story => StoryContext::from_story(story),
            branch => branch,
        },
    )
}

/// Final text handed to a provider command on stdin.
pub fn render_request(request: &ProviderRequest) -> Result<String> {
    PromptEngine::new()?.render(
        "request",
        context! {
            context => Some(request.context.trim()).filter(|s| !s.is_empty()),
            prior_analysis => request.prior_analysis.as_deref().map(str::trim).filter(|s| !s.is_empty()),
            instructions => request.instructions.trim(),
        },
    )
}
