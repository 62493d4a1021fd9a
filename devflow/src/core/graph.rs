//! Dependency graph over developer stories.
//!
//! An edge `(dependent -> required)` means `dependent` may only start once
//! `required` is completed. The engine reports readiness and rejects edges that
//! would close a cycle; it never changes a story's status.

use std::collections::{BTreeSet, HashMap, HashSet};

use chrono::{DateTime, Utc};

use crate::core::error::Error;
use crate::core::types::{Dependency, DeveloperStory, StoryId, StoryStatus};

/// Insert `dependent -> required` into `edges`.
///
/// Rejected insertions leave `edges` untouched.
pub fn add_dependency(
    edges: &mut Vec<Dependency>,
    dependent: StoryId,
    required: StoryId,
    description: Option<String>,
    now: DateTime<Utc>,
) -> Result<(), Error> {
    if dependent == required {
        return Err(Error::SelfDependency { story: dependent });
    }
    if edges
        .iter()
        .any(|edge| edge.dependent == dependent && edge.required == required)
    {
        return Err(Error::DuplicateDependency {
            dependent,
            required,
        });
    }
    // The new edge closes a cycle iff `dependent` is already reachable from `required`.
    if reaches(edges, required, dependent) {
        return Err(Error::CycleDetected {
            dependent,
            required,
        });
    }
    edges.push(Dependency {
        dependent,
        required,
        description,
        created_at: now,
    });
    Ok(())
}

/// Pending stories whose every requirement is completed, in input order.
///
/// A requirement that is not among `stories` counts as unsatisfied.
pub fn compute_ready_set<'a>(
    stories: &[&'a DeveloperStory],
    edges: &[Dependency],
) -> Vec<&'a DeveloperStory> {
    let status = status_index(stories);
    stories
        .iter()
        .copied()
        .filter(|story| story.status == StoryStatus::Pending)
        .filter(|story| requirements_completed(story.id(), edges, &status))
        .collect()
}

/// True when every story `story` depends on is completed.
pub fn requirements_completed(
    story: StoryId,
    edges: &[Dependency],
    status: &HashMap<StoryId, StoryStatus>,
) -> bool {
    edges
        .iter()
        .filter(|edge| edge.dependent == story)
        .all(|edge| status.get(&edge.required) == Some(&StoryStatus::Completed))
}

pub fn status_index(stories: &[&DeveloperStory]) -> HashMap<StoryId, StoryStatus> {
    stories
        .iter()
        .map(|story| (story.id(), story.status))
        .collect()
}

/// Every story that transitively requires `story`.
pub fn transitive_dependents(story: StoryId, edges: &[Dependency]) -> BTreeSet<StoryId> {
    let mut reverse: HashMap<StoryId, Vec<StoryId>> = HashMap::new();
    for edge in edges {
        reverse.entry(edge.required).or_default().push(edge.dependent);
    }
    let mut seen = BTreeSet::new();
    let mut stack = vec![story];
    while let Some(node) = stack.pop() {
        for &next in reverse.get(&node).map(Vec::as_slice).unwrap_or_default() {
            if seen.insert(next) {
                stack.push(next);
            }
        }
    }
    seen
}

/// Find any cycle among `edges`, returned as the stories along it.
///
/// Iterative three-colour DFS, linear in stories plus edges.
pub fn find_cycle(edges: &[Dependency]) -> Option<Vec<StoryId>> {
    #[derive(Clone, Copy, PartialEq, Eq)]
    enum Colour {
        Grey,
        Black,
    }

    let adjacency = adjacency(edges);
    let mut nodes: Vec<StoryId> = adjacency.keys().copied().collect();
    nodes.sort();
    let mut colour: HashMap<StoryId, Colour> = HashMap::new();

    for start in nodes {
        if colour.contains_key(&start) {
            continue;
        }
        // (node, index of next neighbour to visit)
        let mut stack: Vec<(StoryId, usize)> = vec![(start, 0)];
        colour.insert(start, Colour::Grey);
        while let Some(top) = stack.last_mut() {
            let node = top.0;
            let neighbours = adjacency.get(&node).map(Vec::as_slice).unwrap_or_default();
            if let Some(&child) = neighbours.get(top.1) {
                top.1 += 1;
                match colour.get(&child) {
                    None => {
                        colour.insert(child, Colour::Grey);
                        stack.push((child, 0));
                    }
                    Some(Colour::Grey) => {
                        let from = stack
                            .iter()
                            .position(|(id, _)| *id == child)
                            .unwrap_or_default();
                        return Some(stack[from..].iter().map(|(id, _)| *id).collect());
                    }
                    Some(Colour::Black) => {}
                }
            } else {
                colour.insert(node, Colour::Black);
                stack.pop();
            }
        }
    }
    None
}

/// Order `stories` so every requirement precedes its dependents.
///
/// Ties keep input order. Edges touching stories outside the input are ignored.
pub fn topological_order(
    stories: &[&DeveloperStory],
    edges: &[Dependency],
) -> Result<Vec<StoryId>, Error> {
    let ids: HashSet<StoryId> = stories.iter().map(|story| story.id()).collect();
    let mut pending_requirements: HashMap<StoryId, usize> = HashMap::new();
    for edge in edges {
        if ids.contains(&edge.dependent) && ids.contains(&edge.required) {
            *pending_requirements.entry(edge.dependent).or_default() += 1;
        }
    }

    let mut order = Vec::with_capacity(stories.len());
    let mut placed: HashSet<StoryId> = HashSet::new();
    while order.len() < stories.len() {
        let next = stories.iter().map(|story| story.id()).find(|id| {
            !placed.contains(id) && pending_requirements.get(id).copied().unwrap_or(0) == 0
        });
        let Some(next) = next else {
            let stuck = stories
                .iter()
                .map(|story| story.id())
                .find(|id| !placed.contains(id))
                .unwrap_or(StoryId(0));
            let required = edges
                .iter()
                .find(|edge| edge.dependent == stuck && !placed.contains(&edge.required))
                .map_or(stuck, |edge| edge.required);
            return Err(Error::CycleDetected {
                dependent: stuck,
                required,
            });
        };
        placed.insert(next);
        order.push(next);
        for edge in edges.iter().filter(|edge| edge.required == next) {
            if let Some(count) = pending_requirements.get_mut(&edge.dependent) {
                *count = count.saturating_sub(1);
            }
        }
    }
    Ok(order)
}

fn adjacency(edges: &[Dependency]) -> HashMap<StoryId, Vec<StoryId>> {
    let mut adjacency: HashMap<StoryId, Vec<StoryId>> = HashMap::new();
    for edge in edges {
        adjacency
            .entry(edge.dependent)
            .or_default()
            .push(edge.required);
        adjacency.entry(edge.required).or_default();
    }
    adjacency
}

/// True if a path `from -> ... -> target` exists along dependency edges.
fn reaches(edges: &[Dependency], from: StoryId, target: StoryId) -> bool {
    let adjacency = adjacency(edges);
    let mut seen = HashSet::new();
    let mut stack = vec![from];
    while let Some(node) = stack.pop() {
        if node == target {
            return true;
        }
        if !seen.insert(node) {
            continue;
        }
        if let Some(next) = adjacency.get(&node) {
            stack.extend(next.iter().copied());
        }
    }
    false
}
