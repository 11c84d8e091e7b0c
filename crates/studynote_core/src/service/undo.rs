//! Bounded in-memory undo history.
//!
//! # Invariants
//! - At most `capacity` snapshots are kept; the oldest is dropped first.
//! - Consecutive content edits on the same line share one snapshot.

use crate::model::line::{Line, LineKey};
use std::collections::VecDeque;

#[derive(Debug)]
struct Snapshot {
    lines: Vec<Line>,
    coalesce_key: Option<LineKey>,
}

#[derive(Debug)]
pub(crate) struct UndoStack {
    capacity: usize,
    snapshots: VecDeque<Snapshot>,
}

impl UndoStack {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            snapshots: VecDeque::new(),
        }
    }

    /// Records `lines` as the state to return to.
    ///
    /// With `coalesce_key`, the push is skipped when the newest snapshot was
    /// taken for the same line's content edit.
    pub(crate) fn record(&mut self, lines: &[Line], coalesce_key: Option<LineKey>) {
        if self.capacity == 0 {
            return;
        }
        if coalesce_key.is_some()
            && self
                .snapshots
                .back()
                .is_some_and(|snapshot| snapshot.coalesce_key == coalesce_key)
        {
            return;
        }
        if self.snapshots.len() == self.capacity {
            self.snapshots.pop_front();
        }
        self.snapshots.push_back(Snapshot {
            lines: lines.to_vec(),
            coalesce_key,
        });
    }

    /// Ends any coalescing run so the next content edit starts a new step.
    pub(crate) fn seal(&mut self) {
        if let Some(snapshot) = self.snapshots.back_mut() {
            snapshot.coalesce_key = None;
        }
    }

    pub(crate) fn pop(&mut self) -> Option<Vec<Line>> {
        self.snapshots.pop_back().map(|snapshot| snapshot.lines)
    }

    pub(crate) fn len(&self) -> usize {
        self.snapshots.len()
    }
}
