//! Plain-text views for `devflow list` and `devflow log`.

use std::fmt::Write as _;

use anyhow::Result;

use crate::core::board::Board;
use crate::core::graph::topological_order;
use crate::core::lifecycle::NextOutcome;
use crate::core::types::{ExecutionLogEntry, StoryId};

/// Work items with their stories in dependency order.
pub fn render_board(board: &Board) -> Result<String> {
    let mut out = String::new();
    if board.work_items.is_empty() {
        out.push_str("no work items\n");
        return Ok(out);
    }
    for item in board.work_items.values() {
        writeln!(
            out,
            "work item {} [{}] p{} {} ({})",
            item.id(),
            item.status,
            item.priority,
            item.title,
            item.kind.as_str()
        )?;
        if let Some(reason) = &item.error_message {
            writeln!(out, "  error: {reason}")?;
        }
        let stories = board.stories_of(item.id())?;
        for id in topological_order(&stories, &board.dependencies)? {
            let story = board.story(id)?;
            write!(
                out,
                "  story {} [{}] p{} {} ({})",
                id,
                story.status,
                story.priority,
                story.title,
                story.story_type.as_str()
            )?;
            let requires: Vec<String> = board
                .requirements_of(id)
                .iter()
                .map(|edge| edge.required.to_string())
                .collect();
            if !requires.is_empty() {
                write!(out, " requires {}", requires.join(", "))?;
            }
            if let Some(branch) = &story.branch_name {
                write!(out, " branch {branch}")?;
            }
            out.push('\n');
            if let Some(reason) = &story.error_message {
                writeln!(out, "    error: {reason} (attempts {})", story.attempts)?;
            }
        }
    }
    Ok(out)
}

/// One line per entry, oldest first.
pub fn render_history(story: StoryId, entries: &[ExecutionLogEntry]) -> Result<String> {
    let mut out = String::new();
    if entries.is_empty() {
        writeln!(out, "no history for story {story}")?;
        return Ok(out);
    }
    for entry in entries {
        write!(
            out,
            "{} #{} {}",
            entry.timestamp.to_rfc3339(),
            entry.id,
            entry.event
        )?;
        if let Some(details) = &entry.details {
            write!(out, " {details}")?;
        }
        if let Some(error) = &entry.error_message {
            write!(out, " error: {error}")?;
        }
        out.push('\n');
    }
    Ok(out)
}

pub fn render_outcome(outcome: &NextOutcome) -> String {
    match outcome {
        NextOutcome::Ready(story) => format!("ready {story}"),
        NextOutcome::Waiting => "waiting".to_string(),
        NextOutcome::Complete => "complete".to_string(),
        NextOutcome::Stalled(stories) => {
            let ids: Vec<String> = stories.iter().map(ToString::to_string).collect();
            format!("stalled {}", ids.join(", "))
        }
    }
}
