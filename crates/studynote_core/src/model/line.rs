//! Outline line model.
//!
//! # Responsibility
//! - Define the atomic ordered unit of an outline (`Line`) and its identity.
//! - Track per-line persistence state (`New -> Dirty -> Clean`).
//! - Define the materialized `Category` read model.
//!
//! # Invariants
//! - A line's kind and heading level are derived from its raw text; callers
//!   cannot set them independently.
//! - A persisted id always matches the line kind (`Category` for headings,
//!   `Content` for text/image lines).
//! - A `New` line stays `New` until it is written once, whatever else changes.

use crate::outline::classifier::{classify, Classification};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use uuid::Uuid;

/// Stable identifier of one subject (one outline document).
pub type SubjectId = Uuid;
/// Persisted identifier of a category record.
pub type CategoryId = Uuid;
/// Persisted identifier of a content record.
pub type ContentId = Uuid;

/// In-memory handle of one line.
///
/// Stays valid across reorder and heading/content flips, and exists before the
/// line has any persisted identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LineKey(u64);

impl LineKey {
    pub(crate) fn new(value: u64) -> Self {
        Self(value)
    }

    /// Raw numeric value, useful for host-side lookup tables.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl Display for LineKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "line#{}", self.0)
    }
}

/// Line kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineKind {
    /// Text matching the heading marker grammar; materializes as a category.
    Heading,
    /// Plain text content.
    Text,
    /// Image reference content.
    Image,
}

impl LineKind {
    /// Whether lines of this kind persist as category records.
    pub fn is_heading(self) -> bool {
        matches!(self, Self::Heading)
    }
}

/// Persisted identity of one line. Mutually exclusive by kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "record", content = "id", rename_all = "snake_case")]
pub enum PersistedId {
    Category(CategoryId),
    Content(ContentId),
}

impl PersistedId {
    /// Returns whether this identity can back a line of `kind`.
    pub fn matches(self, kind: LineKind) -> bool {
        matches!(
            (self, kind),
            (Self::Category(_), LineKind::Heading)
                | (Self::Content(_), LineKind::Text | LineKind::Image)
        )
    }

    /// Category id, when this identity is a category record.
    pub fn category_id(self) -> Option<CategoryId> {
        match self {
            Self::Category(id) => Some(id),
            Self::Content(_) => None,
        }
    }

    /// Underlying uuid regardless of record kind.
    pub fn uuid(self) -> Uuid {
        match self {
            Self::Category(id) | Self::Content(id) => id,
        }
    }
}

impl Display for PersistedId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Category(id) => write!(f, "category:{id}"),
            Self::Content(id) => write!(f, "content:{id}"),
        }
    }
}

/// Persistence state of one line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineState {
    /// Never persisted; has no persisted identity.
    New,
    /// Persisted, but in-memory state diverged since the last write.
    Dirty,
    /// In-memory state equals the last persisted state.
    Clean,
}

/// Fields changed since the last successful write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LineChanges {
    /// Raw text, display text or heading level.
    pub content: bool,
    /// `display_order`.
    pub order: bool,
    /// Owning category (parent category for headings).
    pub owner: bool,
}

impl LineChanges {
    pub const ALL: Self = Self {
        content: true,
        order: true,
        owner: true,
    };

    pub fn is_empty(self) -> bool {
        !(self.content || self.order || self.owner)
    }

    fn merge(&mut self, other: Self) {
        self.content |= other.content;
        self.order |= other.order;
        self.owner |= other.owner;
    }
}

/// One ordered unit of an outline document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line {
    pub(crate) key: LineKey,
    pub(crate) kind: LineKind,
    pub(crate) raw: String,
    pub(crate) display_text: String,
    pub(crate) level: u8,
    pub(crate) display_order: i64,
    pub(crate) category: Option<LineKey>,
    pub(crate) persisted: Option<PersistedId>,
    pub(crate) state: LineState,
    pub(crate) changes: LineChanges,
}

impl Line {
    /// Creates an unpersisted text line, classifying `raw` on the way in.
    pub(crate) fn new_text(key: LineKey, raw: impl Into<String>, display_order: i64) -> Self {
        let raw = raw.into();
        let Classification {
            level,
            display_text,
        } = classify(&raw);
        Self {
            key,
            kind: kind_for_level(level),
            raw,
            display_text,
            level,
            display_order,
            category: None,
            persisted: None,
            state: LineState::New,
            changes: LineChanges::default(),
        }
    }

    /// Creates an unpersisted image line. Image references never reclassify.
    pub(crate) fn new_image(
        key: LineKey,
        image_ref: impl Into<String>,
        display_order: i64,
    ) -> Self {
        let image_ref = image_ref.into();
        Self {
            key,
            kind: LineKind::Image,
            display_text: image_ref.clone(),
            raw: image_ref,
            level: 0,
            display_order,
            category: None,
            persisted: None,
            state: LineState::New,
            changes: LineChanges::default(),
        }
    }

    pub fn key(&self) -> LineKey {
        self.key
    }

    pub fn kind(&self) -> LineKind {
        self.kind
    }

    /// Text exactly as typed (image reference for image lines).
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Text without heading marker.
    pub fn display_text(&self) -> &str {
        &self.display_text
    }

    /// Heading level `1..=6`, or `0` for text/image lines.
    pub fn level(&self) -> u8 {
        self.level
    }

    pub fn display_order(&self) -> i64 {
        self.display_order
    }

    /// Owning category for content lines, parent category for headings.
    /// `None` means root level.
    pub fn category(&self) -> Option<LineKey> {
        self.category
    }

    pub fn persisted_id(&self) -> Option<PersistedId> {
        self.persisted
    }

    pub fn state(&self) -> LineState {
        self.state
    }

    pub fn changes(&self) -> LineChanges {
        self.changes
    }

    pub fn is_heading(&self) -> bool {
        self.kind.is_heading()
    }

    /// Replaces raw text and reclassifies.
    ///
    /// Returns `true` when heading status flipped. Image lines keep their kind.
    pub(crate) fn apply_text(&mut self, raw: impl Into<String>) -> bool {
        let raw = raw.into();
        if raw == self.raw {
            return false;
        }
        if self.kind == LineKind::Image {
            self.display_text = raw.clone();
            self.raw = raw;
            self.mark_dirty(LineChanges {
                content: true,
                ..LineChanges::default()
            });
            return false;
        }

        let was_heading = self.is_heading();
        let Classification {
            level,
            display_text,
        } = classify(&raw);
        self.raw = raw;
        self.display_text = display_text;
        self.level = level;
        self.kind = kind_for_level(level);
        self.mark_dirty(LineChanges {
            content: true,
            ..LineChanges::default()
        });
        was_heading != self.is_heading()
    }

    /// Sets the owning category. Returns `true` when it changed.
    pub(crate) fn set_owner(&mut self, owner: Option<LineKey>) -> bool {
        if self.category == owner {
            return false;
        }
        self.category = owner;
        self.mark_dirty(LineChanges {
            owner: true,
            ..LineChanges::default()
        });
        true
    }

    pub(crate) fn set_order(&mut self, display_order: i64) {
        if self.display_order == display_order {
            return;
        }
        self.display_order = display_order;
        self.mark_dirty(LineChanges {
            order: true,
            ..LineChanges::default()
        });
    }

    /// Drops the persisted identity, returning it. The line becomes `New`.
    pub(crate) fn detach_identity(&mut self) -> Option<PersistedId> {
        let previous = self.persisted.take();
        self.state = LineState::New;
        self.changes = LineChanges::default();
        previous
    }

    /// Reattaches an identity recovered by undo. All fields are rewritten on
    /// the next flush.
    pub(crate) fn restore_identity(&mut self, id: Option<PersistedId>) {
        self.persisted = id;
        match id {
            Some(_) => {
                self.state = LineState::Dirty;
                self.changes = LineChanges::ALL;
            }
            None => {
                self.state = LineState::New;
                self.changes = LineChanges::default();
            }
        }
    }

    /// Forces the owner to be rewritten on the next flush.
    pub(crate) fn mark_owner_changed(&mut self) {
        self.mark_dirty(LineChanges {
            owner: true,
            ..LineChanges::default()
        });
    }

    pub(crate) fn mark_written(&mut self, id: PersistedId) {
        self.persisted = Some(id);
        self.state = LineState::Clean;
        self.changes = LineChanges::default();
    }

    fn mark_dirty(&mut self, changes: LineChanges) {
        if self.state != LineState::New {
            self.state = LineState::Dirty;
            self.changes.merge(changes);
        }
    }
}

fn kind_for_level(level: u8) -> LineKind {
    if level == 0 {
        LineKind::Text
    } else {
        LineKind::Heading
    }
}

/// Materialized category tree node for one heading line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Category {
    /// Heading line backing this category.
    pub key: LineKey,
    /// Persisted id, `None` until first flush.
    pub id: Option<CategoryId>,
    pub title: String,
    /// `1..=6`.
    pub level: u8,
    /// Parent category line. `None` for root categories.
    pub parent: Option<LineKey>,
    /// Direct text/image lines, in display order.
    pub lines: Vec<LineKey>,
    /// Direct sub-categories, in display order.
    pub children: Vec<LineKey>,
}
