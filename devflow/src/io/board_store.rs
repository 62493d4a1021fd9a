//! Board snapshot persistence.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::debug;

use super::write_atomic;
use crate::core::board::Board;
use crate::core::graph::find_cycle;

/// Load/commit the whole board. Each use-case commits once.
pub trait BoardStore: Send + Sync {
    fn load(&self) -> Result<Board>;
    fn commit(&self, board: &Board) -> Result<()>;
}

/// `board.json` on disk, replaced atomically on every commit.
#[derive(Debug, Clone)]
pub struct JsonBoardStore {
    path: PathBuf,
}

impl JsonBoardStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl BoardStore for JsonBoardStore {
    fn load(&self) -> Result<Board> {
        debug!(path = %self.path.display(), "loading board");
        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("read board {}", self.path.display()))?;
        let board: Board = serde_json::from_str(&contents)
            .with_context(|| format!("parse board {}", self.path.display()))?;
        validate_board(&board).with_context(|| format!("invalid board {}", self.path.display()))?;
        debug!(
            work_items = board.work_items.len(),
            stories = board.stories.len(),
            edges = board.dependencies.len(),
            "board loaded"
        );
        Ok(board)
    }

    fn commit(&self, board: &Board) -> Result<()> {
        debug!(path = %self.path.display(), "writing board");
        let mut buf = serde_json::to_string_pretty(board).context("serialize board")?;
        buf.push('\n');
        write_atomic(&self.path, &buf)
    }
}

/// Structural checks for a snapshot that may have been edited by hand.
pub fn validate_board(board: &Board) -> Result<()> {
    let mut errors = Vec::new();
    for (id, story) in &board.stories {
        if story.id() != *id {
            errors.push(format!("story keyed {id} carries id {}", story.id()));
        }
        match board.work_items.get(&story.work_item_id) {
            Some(owner) if owner.stories.contains(id) => {}
            Some(_) => errors.push(format!(
                "story {id} missing from work item {} story list",
                story.work_item_id
            )),
            None => errors.push(format!(
                "story {id} owned by unknown work item {}",
                story.work_item_id
            )),
        }
        if story.id().0 > board.last_story_id {
            errors.push(format!("story {id} exceeds last_story_id"));
        }
    }
    for (id, item) in &board.work_items {
        if item.id() != *id {
            errors.push(format!("work item keyed {id} carries id {}", item.id()));
        }
        if id.0 > board.last_work_item_id {
            errors.push(format!("work item {id} exceeds last_work_item_id"));
        }
    }
    for edge in &board.dependencies {
        for end in [edge.dependent, edge.required] {
            if !board.stories.contains_key(&end) {
                errors.push(format!("dependency references unknown story {end}"));
            }
        }
    }
    if let Some(cycle) = find_cycle(&board.dependencies) {
        let path: Vec<String> = cycle.iter().map(ToString::to_string).collect();
        errors.push(format!("dependency cycle {}", path.join(" -> ")));
    }
    if errors.is_empty() {
        return Ok(());
    }
    Err(anyhow!("board invariants failed: {}", errors.join("; ")))
}
