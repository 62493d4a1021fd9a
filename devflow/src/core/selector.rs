//! Deterministic tie-break among ready stories.

use std::cmp::Ordering;

use crate::core::types::DeveloperStory;

/// Pick the story to run next: lowest priority value first, then lowest id.
///
/// Returns `None` when `ready` is empty. Operates only on the given snapshot.
pub fn select_next<'a>(ready: &[&'a DeveloperStory]) -> Option<&'a DeveloperStory> {
    ready.iter().copied().min_by(|a, b| selection_order(a, b))
}

/// Sort stories into selection order.
pub fn sort_by_selection_order(stories: &mut [&DeveloperStory]) {
    stories.sort_by(|a, b| selection_order(a, b));
}

fn selection_order(a: &DeveloperStory, b: &DeveloperStory) -> Ordering {
    a.priority
        .cmp(&b.priority)
        .then_with(|| a.id().cmp(&b.id()))
}
