//! Hierarchy resolver.
//!
//! # Responsibility
//! - Compute the enclosing category of any position in an ordered sequence.
//! - Recompute parent/owner links for the suffix affected by a structural edit.
//! - Materialize the category tree read model.
//!
//! # Invariants
//! - A text/image line is owned by the nearest preceding heading.
//! - A heading's parent is the nearest preceding heading with strictly lower
//!   level. Same-or-higher level headings close each other as siblings.
//! - Lines before the first heading have no owner (root-pending).
//!
//! The forward walk keeps a stack of open headings with strictly increasing
//! levels; the stack after a heading is exactly its ancestor chain.

use crate::model::line::{Category, Line, LineKey};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// How far `reparent_range` walks after the edited range.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReparentScope {
    /// Walk to the end of the document.
    #[default]
    ToEnd,
    /// Stop at the first heading after the edit whose ancestor chain provably
    /// did not change.
    UntilStable,
}

/// Summary of one reparent pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReparentReport {
    /// Lines visited by the forward walk.
    pub visited: usize,
    /// Lines whose owner changed.
    pub reassigned: usize,
    /// Whether the walk stopped before the end of the document.
    pub stopped_early: bool,
}

#[derive(Debug, Clone, Copy)]
struct OpenHeading {
    key: LineKey,
    level: u8,
    index: usize,
}

/// Returns the enclosing category for `position`.
///
/// For a heading at `position` this is its parent (nearest preceding heading
/// with lower level). For a text/image line, or for an insertion point at
/// `position == lines.len()`, it is the nearest preceding heading.
pub fn find_enclosing_category(lines: &[Line], position: usize) -> Option<LineKey> {
    let ceiling = lines
        .get(position)
        .filter(|line| line.is_heading())
        .map(|line| line.level);
    let end = position.min(lines.len());
    lines[..end]
        .iter()
        .rev()
        .find(|line| line.is_heading() && ceiling.map_or(true, |level| line.level < level))
        .map(|line| line.key)
}

/// Recomputes owners starting at `start` after an edit at that position.
pub fn reparent_from(lines: &mut [Line], start: usize, scope: ReparentScope) -> ReparentReport {
    reparent_range(lines, start, start, scope)
}

/// Recomputes owners for every line at or after `start`.
///
/// `edit_end` is the last index touched by the edit; early stopping is only
/// considered strictly after it. Lines before `start` are assumed unchanged.
pub fn reparent_range(
    lines: &mut [Line],
    start: usize,
    edit_end: usize,
    scope: ReparentScope,
) -> ReparentReport {
    let start = start.min(lines.len());
    let mut stack = open_headings_before(lines, start);
    let mut report = ReparentReport::default();

    for index in start..lines.len() {
        report.visited += 1;
        let line = &mut lines[index];

        if !line.is_heading() {
            if line.set_owner(stack.last().map(|open| open.key)) {
                report.reassigned += 1;
            }
            continue;
        }

        while stack.last().is_some_and(|open| open.level >= line.level) {
            stack.pop();
        }
        let parent = stack.last().copied();
        let parent_key = parent.map(|open| open.key);

        let unchanged = line.category == parent_key;
        if scope == ReparentScope::UntilStable
            && index > edit_end
            && unchanged
            && parent.map_or(true, |open| open.index < start)
        {
            // Ancestor chain lies entirely before the edit: every later
            // assignment already matches.
            report.visited -= 1;
            report.stopped_early = true;
            break;
        }

        if line.set_owner(parent_key) {
            report.reassigned += 1;
        }
        stack.push(OpenHeading {
            key: line.key,
            level: line.level,
            index,
        });
    }

    report
}

/// Moves every direct child of `heading` (lines and sub-categories it owns)
/// to `new_owner`.
///
/// Scans from `from`, which should be the heading's former position. Returns
/// the index of the last reassigned line.
pub fn reassign_direct_children(
    lines: &mut [Line],
    heading: LineKey,
    new_owner: Option<LineKey>,
    from: usize,
) -> Option<usize> {
    let mut last = None;
    for (index, line) in lines.iter_mut().enumerate().skip(from) {
        if line.category == Some(heading) {
            line.set_owner(new_owner);
            last = Some(index);
        }
    }
    last
}

/// Computes every owner from scratch, in sequence order.
pub fn recompute_owners(lines: &[Line]) -> Vec<Option<LineKey>> {
    let mut stack: Vec<(LineKey, u8)> = Vec::new();
    let mut owners = Vec::with_capacity(lines.len());
    for line in lines {
        if line.is_heading() {
            while stack.last().is_some_and(|(_, level)| *level >= line.level) {
                stack.pop();
            }
            owners.push(stack.last().map(|(key, _)| *key));
            stack.push((line.key, line.level));
        } else {
            owners.push(stack.last().map(|(key, _)| *key));
        }
    }
    owners
}

/// Builds the category tree read model from current owner links.
pub fn build_categories(lines: &[Line]) -> Vec<Category> {
    let mut categories: Vec<Category> = Vec::new();
    let mut slots: HashMap<LineKey, usize> = HashMap::new();

    for line in lines.iter().filter(|line| line.is_heading()) {
        slots.insert(line.key, categories.len());
        categories.push(Category {
            key: line.key,
            id: line.persisted.and_then(|id| id.category_id()),
            title: line.display_text.clone(),
            level: line.level,
            parent: line.category,
            lines: Vec::new(),
            children: Vec::new(),
        });
    }

    for line in lines {
        let Some(slot) = line.category.and_then(|owner| slots.get(&owner).copied()) else {
            continue;
        };
        if line.is_heading() {
            categories[slot].children.push(line.key);
        } else {
            categories[slot].lines.push(line.key);
        }
    }

    categories
}

fn open_headings_before(lines: &[Line], position: usize) -> Vec<OpenHeading> {
    let mut open = Vec::new();
    let mut ceiling = u8::MAX;
    for index in (0..position).rev() {
        let line = &lines[index];
        if line.is_heading() && line.level < ceiling {
            open.push(OpenHeading {
                key: line.key,
                level: line.level,
                index,
            });
            ceiling = line.level;
            if ceiling <= 1 {
                break;
            }
        }
    }
    open.reverse();
    open
}
