//! Outline document aggregate.
//!
//! # Responsibility
//! - Own the ordered line sequence of one subject.
//! - Apply edits (insert, remove, change content, reorder, undo) and keep the
//!   hierarchy consistent through the resolver.
//! - Track dirty lines and pending deletions, and flush them through an
//!   `OutlineStore` in one transaction per flush.
//!
//! # Invariants
//! - `display_order` is strictly increasing in sequence position.
//! - Every owner link equals a from-scratch recompute after each edit.
//! - A failed flush transaction changes nothing in memory; every line of the
//!   batch stays dirty.
//! - Lines never call into persistence; only `flush` does.

use crate::config::EngineConfig;
use crate::model::line::{
    Category, CategoryId, ContentId, Line, LineChanges, LineKey, LineKind, LineState,
    PersistedId, SubjectId,
};
use crate::outline::classifier::{classify, format_heading};
use crate::outline::resolver::{
    build_categories, find_enclosing_category, reassign_direct_children, recompute_owners,
    reparent_range, ReparentReport, ReparentScope,
};
use crate::repo::outline_repo::{
    CategoryPatch, ContentKind, ContentPatch, OutlineStore, StoreError, StoreResult,
    StoredRecord,
};
use crate::service::undo::UndoStack;
use log::{debug, error, info, warn};
use std::collections::{HashMap, HashSet};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::time::Instant;

/// Order gap left between a new trailing line and its predecessor.
pub const ORDER_STEP: i64 = 1024;

/// Flush scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushMode {
    /// Dirty and new lines plus pending deletions.
    Incremental,
    /// Every line regardless of state, plus pending deletions.
    Full,
}

impl FlushMode {
    fn as_str(self) -> &'static str {
        match self {
            Self::Incremental => "incremental",
            Self::Full => "full",
        }
    }
}

/// Outcome counters of one committed flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Lines created or updated.
    pub written: usize,
    /// Store records deleted (including ones already gone).
    pub deleted: usize,
    /// New text/image lines skipped because no heading encloses them yet.
    pub orphaned: usize,
    /// Lines skipped because their category is not persisted yet.
    pub deferred: usize,
    /// Line writes rejected by the store; retried on the next flush.
    pub failed: usize,
    /// Lines whose persisted record vanished; recreated on the next flush.
    pub stale: usize,
}

impl FlushReport {
    /// Whether nothing is left for a retry. Orphans wait for a heading, not
    /// for a retry.
    pub fn is_complete(&self) -> bool {
        self.failed == 0 && self.deferred == 0 && self.stale == 0
    }
}

/// Errors from document open and flush.
#[derive(Debug)]
pub enum DocumentError {
    /// Loading the subject's records failed.
    Load(StoreError),
    /// The store rejected the flush transaction; nothing was persisted.
    Transaction(StoreError),
}

impl Display for DocumentError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Load(err) => write!(f, "failed to load outline: {err}"),
            Self::Transaction(err) => write!(f, "outline flush transaction failed: {err}"),
        }
    }
}

impl Error for DocumentError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Load(err) | Self::Transaction(err) => Some(err),
        }
    }
}

/// One structural invariant broken by the current sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvariantViolation {
    /// `display_order` at `position` is not greater than its predecessor's.
    OrderNotIncreasing { position: usize },
    /// Owner link differs from a from-scratch recompute.
    WrongOwner {
        key: LineKey,
        expected: Option<LineKey>,
        actual: Option<LineKey>,
    },
    /// A category's parent does not have a strictly lower level.
    ParentLevelNotLower { key: LineKey },
    /// A line's level disagrees with its raw text.
    LevelMismatch { key: LineKey },
}

impl Display for InvariantViolation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OrderNotIncreasing { position } => {
                write!(f, "display order not increasing at position {position}")
            }
            Self::WrongOwner {
                key,
                expected,
                actual,
            } => write!(f, "{key} owned by {actual:?}, expected {expected:?}"),
            Self::ParentLevelNotLower { key } => {
                write!(f, "{key} has a parent with the same or deeper level")
            }
            Self::LevelMismatch { key } => write!(f, "{key} level disagrees with its text"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingDeletion {
    Content {
        key: LineKey,
        id: ContentId,
    },
    Category {
        key: LineKey,
        id: CategoryId,
        reassign_to: Option<LineKey>,
    },
}

impl PendingDeletion {
    fn key(self) -> LineKey {
        match self {
            Self::Content { key, .. } | Self::Category { key, .. } => key,
        }
    }

    fn persisted(self) -> PersistedId {
        match self {
            Self::Content { id, .. } => PersistedId::Content(id),
            Self::Category { id, .. } => PersistedId::Category(id),
        }
    }
}

enum LineWrite {
    Written(PersistedId),
    Orphaned,
    Deferred,
}

/// Staged results of one flush, applied only after commit.
struct FlushBatch {
    category_ids: HashMap<LineKey, CategoryId>,
    written: HashMap<LineKey, PersistedId>,
    stale: HashSet<LineKey>,
    deleted: Vec<usize>,
    report: FlushReport,
}

impl FlushBatch {
    fn new(lines: &[Line]) -> Self {
        let category_ids = lines
            .iter()
            .filter_map(|line| {
                line.persisted
                    .and_then(|id| id.category_id())
                    .map(|id| (line.key, id))
            })
            .collect();
        Self {
            category_ids,
            written: HashMap::new(),
            stale: HashSet::new(),
            deleted: Vec::new(),
            report: FlushReport::default(),
        }
    }
}

/// Ordered line sequence of one subject, with persistence orchestration.
pub struct OutlineDocument<S: OutlineStore> {
    store: S,
    subject_id: SubjectId,
    lines: Vec<Line>,
    next_key: u64,
    pending_deletions: Vec<PendingDeletion>,
    reparent_scope: ReparentScope,
    undo: UndoStack,
}

impl<S: OutlineStore> OutlineDocument<S> {
    /// Loads a subject's records and builds the document.
    ///
    /// Stored orders that are not strictly increasing are repaired, and owner
    /// links are recomputed; repaired lines come back dirty.
    pub fn open(
        store: S,
        subject_id: SubjectId,
        config: &EngineConfig,
    ) -> Result<Self, DocumentError> {
        let started_at = Instant::now();
        let records = store.load_all(subject_id).map_err(|err| {
            error!(
                "event=outline_open module=outline status=error subject={subject_id} error={err}"
            );
            DocumentError::Load(err)
        })?;

        let mut document = Self {
            store,
            subject_id,
            lines: Vec::with_capacity(records.len()),
            next_key: 0,
            pending_deletions: Vec::new(),
            reparent_scope: config.reparent_scope,
            undo: UndoStack::new(config.undo_capacity),
        };
        let repaired = document.hydrate(records);

        info!(
            "event=outline_open module=outline status=ok subject={subject_id} lines={} repaired={repaired} duration_ms={}",
            document.lines.len(),
            started_at.elapsed().as_millis()
        );
        Ok(document)
    }

    pub fn subject_id(&self) -> SubjectId {
        self.subject_id
    }

    /// Lines in display order.
    pub fn lines(&self) -> &[Line] {
        &self.lines
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn line(&self, key: LineKey) -> Option<&Line> {
        self.lines.iter().find(|line| line.key == key)
    }

    pub fn position_of(&self, key: LineKey) -> Option<usize> {
        self.lines.iter().position(|line| line.key == key)
    }

    /// Enclosing category of `position` (see `find_enclosing_category`).
    pub fn enclosing_category(&self, position: usize) -> Option<LineKey> {
        find_enclosing_category(&self.lines, position)
    }

    /// Materialized category tree, in display order.
    pub fn categories(&self) -> Vec<Category> {
        build_categories(&self.lines)
    }

    pub fn category(&self, key: LineKey) -> Option<Category> {
        self.categories()
            .into_iter()
            .find(|category| category.key == key)
    }

    /// Number of lines that are not `Clean`.
    pub fn dirty_count(&self) -> usize {
        self.lines
            .iter()
            .filter(|line| line.state != LineState::Clean)
            .count()
    }

    pub fn pending_deletion_count(&self) -> usize {
        self.pending_deletions.len()
    }

    pub fn has_unsaved_changes(&self) -> bool {
        !self.pending_deletions.is_empty() || self.dirty_count() > 0
    }

    /// Undo steps currently available.
    pub fn undo_depth(&self) -> usize {
        self.undo.len()
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Inserts a text line at `position` (clamped to the end).
    ///
    /// The new line is classified, placed strictly between its neighbours'
    /// orders (shifting successors by one when there is no gap), and the
    /// hierarchy is recomputed from its position.
    pub fn insert_at(&mut self, position: usize, content: impl Into<String>) -> LineKey {
        self.undo.record(&self.lines, None);
        let key = self.allocate_key();
        let position = position.min(self.lines.len());
        let order = self.order_for_slot(position);
        self.lines
            .insert(position, Line::new_text(key, content, order));
        self.settle_insert(position)
    }

    /// Inserts an image line referencing `image_ref` at `position`.
    pub fn insert_image_at(&mut self, position: usize, image_ref: impl Into<String>) -> LineKey {
        self.undo.record(&self.lines, None);
        let key = self.allocate_key();
        let position = position.min(self.lines.len());
        let order = self.order_for_slot(position);
        self.lines
            .insert(position, Line::new_image(key, image_ref, order));
        self.settle_insert(position)
    }

    /// Removes one line. Returns `false` for an unknown key.
    ///
    /// A removed heading hands its direct lines and sub-categories to its own
    /// parent before the hierarchy is recomputed.
    pub fn remove(&mut self, key: LineKey) -> bool {
        let Some(index) = self.position_of(key) else {
            warn_stale_reference("remove", key);
            return false;
        };
        self.undo.record(&self.lines, None);

        let line = self.lines.remove(index);
        let mut edit_end = index;
        if line.is_heading() {
            if let Some(last) =
                reassign_direct_children(&mut self.lines, key, line.category, index)
            {
                edit_end = last;
            }
        }
        if let Some(id) = line.persisted {
            self.queue_deletion(key, id, line.category);
        }

        let report = self.reparent(index, edit_end);
        debug!(
            "event=outline_remove module=outline status=ok key={} kind={:?} position={index} reassigned={}",
            key.get(),
            line.kind,
            report.reassigned
        );
        true
    }

    /// Replaces a line's text and reclassifies it.
    ///
    /// When heading status flips, the line's persisted record is queued for
    /// deletion and a record of the new kind is created on the next flush.
    /// Plain text edits do not touch the hierarchy.
    pub fn change_content(&mut self, key: LineKey, content: impl Into<String>) -> bool {
        let content = content.into();
        let Some(index) = self.position_of(key) else {
            warn_stale_reference("change_content", key);
            return false;
        };
        let line = &self.lines[index];
        if line.raw == content {
            return true;
        }

        let was_heading = line.is_heading();
        let old_level = line.level;
        let old_parent = line.category;
        let structural = line.kind != LineKind::Image && {
            let next = classify(&content);
            next.level != old_level
        };
        self.undo
            .record(&self.lines, if structural { None } else { Some(key) });

        let flipped = self.lines[index].apply_text(content);
        if flipped {
            let new_kind = self.lines[index].kind;
            if let Some(id) = self.lines[index].detach_identity() {
                let reassign_to = if was_heading { old_parent } else { None };
                self.queue_deletion(key, id, reassign_to);
            }
            if let Some(id) = self.take_pending_deletion(key, new_kind) {
                self.lines[index].restore_identity(Some(id));
            }

            let mut edit_end = index;
            if was_heading {
                if let Some(last) =
                    reassign_direct_children(&mut self.lines, key, old_parent, index + 1)
                {
                    edit_end = last;
                }
            }
            let report = self.reparent(index, edit_end);
            debug!(
                "event=outline_reclassify module=outline status=ok key={} heading={} reassigned={}",
                key.get(),
                !was_heading,
                report.reassigned
            );
        } else if structural {
            let report = self.reparent(index, index);
            debug!(
                "event=outline_relevel module=outline status=ok key={} from_level={old_level} to_level={} reassigned={}",
                key.get(),
                self.lines[index].level,
                report.reassigned
            );
        }
        true
    }

    /// Moves a line to `target_position` in the resulting sequence (clamped).
    ///
    /// The moved line gets a fresh order between its new neighbours and the
    /// hierarchy is recomputed over the affected range.
    pub fn reorder(&mut self, key: LineKey, target_position: usize) -> bool {
        let Some(index) = self.position_of(key) else {
            warn_stale_reference("reorder", key);
            return false;
        };
        let target = target_position.min(self.lines.len() - 1);
        if target == index {
            return true;
        }
        self.undo.record(&self.lines, None);

        let mut line = self.lines.remove(index);
        let previous = target
            .checked_sub(1)
            .map(|slot| self.lines[slot].display_order);
        let next = self.lines.get(target).map(|slot| slot.display_order);
        line.set_order(order_between(previous, next));
        self.lines.insert(target, line);
        let renumbered = self.cascade_orders(target + 1);

        let report = self.reparent(index.min(target), index.max(target));
        debug!(
            "event=outline_reorder module=outline status=ok key={} from={index} to={target} renumbered={renumbered} reassigned={}",
            key.get(),
            report.reassigned
        );
        true
    }

    /// Restores the sequence before the most recent edit step.
    ///
    /// Persisted identities are reconciled with the store: deletions queued
    /// since the snapshot are cancelled where the record still exists, and
    /// lines that no longer exist are queued for deletion.
    pub fn undo(&mut self) -> bool {
        let Some(snapshot) = self.undo.pop() else {
            return false;
        };
        self.undo.seal();

        let mut current: HashMap<LineKey, Line> = self
            .lines
            .drain(..)
            .map(|line| (line.key, line))
            .collect();
        let mut restored = Vec::with_capacity(snapshot.len());
        for mut line in snapshot {
            let mut identity = None;
            if let Some(id) = current.remove(&line.key).and_then(|live| live.persisted) {
                if id.matches(line.kind) {
                    identity = Some(id);
                } else {
                    self.queue_deletion(line.key, id, None);
                }
            }
            if identity.is_none() {
                identity = self.take_pending_deletion(line.key, line.kind);
            }
            line.restore_identity(identity);
            restored.push(line);
        }
        for (key, line) in current {
            if let Some(id) = line.persisted {
                self.queue_deletion(key, id, None);
            }
        }

        self.lines = restored;
        reparent_range(&mut self.lines, 0, 0, ReparentScope::ToEnd);
        debug!(
            "event=outline_undo module=outline status=ok lines={} remaining_steps={}",
            self.lines.len(),
            self.undo.len()
        );
        true
    }

    /// Persists changes through the store in one transaction.
    ///
    /// Individual record failures are logged and leave that line dirty. A
    /// failure that aborts the transaction rolls everything back and returns
    /// `DocumentError::Transaction` with all lines still dirty.
    pub fn flush(&mut self, mode: FlushMode) -> Result<FlushReport, DocumentError> {
        let started_at = Instant::now();
        if mode == FlushMode::Incremental && !self.has_unsaved_changes() {
            return Ok(FlushReport::default());
        }

        if let Err(err) = self.store.begin_batch() {
            error!(
                "event=outline_flush module=outline status=error mode={} stage=begin error={err}",
                mode.as_str()
            );
            return Err(DocumentError::Transaction(err));
        }

        let mut batch = FlushBatch::new(&self.lines);
        let outcome = self
            .write_lines(mode, &mut batch)
            .and_then(|()| self.write_deletions(&mut batch))
            .and_then(|()| self.store.commit_batch());
        if let Err(err) = outcome {
            if let Err(rollback_err) = self.store.rollback_batch() {
                error!(
                    "event=outline_flush module=outline status=error mode={} stage=rollback error={rollback_err}",
                    mode.as_str()
                );
            }
            error!(
                "event=outline_flush module=outline status=error mode={} stage=write dirty={} duration_ms={} error={err}",
                mode.as_str(),
                self.dirty_count(),
                started_at.elapsed().as_millis()
            );
            return Err(DocumentError::Transaction(err));
        }

        let report = self.apply_batch(batch);
        info!(
            "event=outline_flush module=outline status=ok mode={} written={} deleted={} orphaned={} deferred={} failed={} stale={} duration_ms={}",
            mode.as_str(),
            report.written,
            report.deleted,
            report.orphaned,
            report.deferred,
            report.failed,
            report.stale,
            started_at.elapsed().as_millis()
        );
        Ok(report)
    }

    /// Checks every structural invariant against the current sequence.
    pub fn check_invariants(&self) -> Vec<InvariantViolation> {
        let mut violations = Vec::new();
        for (offset, pair) in self.lines.windows(2).enumerate() {
            if pair[1].display_order <= pair[0].display_order {
                violations.push(InvariantViolation::OrderNotIncreasing {
                    position: offset + 1,
                });
            }
        }

        let levels: HashMap<LineKey, u8> = self
            .lines
            .iter()
            .filter(|line| line.is_heading())
            .map(|line| (line.key, line.level))
            .collect();
        for (line, expected) in self.lines.iter().zip(recompute_owners(&self.lines)) {
            if line.category != expected {
                violations.push(InvariantViolation::WrongOwner {
                    key: line.key,
                    expected,
                    actual: line.category,
                });
            }
            if line.is_heading() {
                let parent_level = line.category.and_then(|parent| levels.get(&parent));
                if parent_level.is_some_and(|level| *level >= line.level) {
                    violations.push(InvariantViolation::ParentLevelNotLower { key: line.key });
                }
            }
            if line.kind != LineKind::Image && classify(&line.raw).level != line.level {
                violations.push(InvariantViolation::LevelMismatch { key: line.key });
            }
        }
        violations
    }

    fn hydrate(&mut self, records: Vec<StoredRecord>) -> usize {
        let mut stored_owners = Vec::with_capacity(records.len());
        let mut keys_by_category: HashMap<CategoryId, LineKey> = HashMap::new();

        for record in records {
            let key = self.allocate_key();
            let mut line = match record.kind {
                LineKind::Heading => Line::new_text(
                    key,
                    format_heading(record.level, &record.body),
                    record.order,
                ),
                LineKind::Text => Line::new_text(key, record.body, record.order),
                LineKind::Image => Line::new_image(key, record.body, record.order),
            };
            if record.id.matches(line.kind) {
                line.mark_written(record.id);
                if let PersistedId::Category(id) = record.id {
                    keys_by_category.insert(id, key);
                }
            } else {
                warn!(
                    "event=outline_open module=outline status=repair key={} record={} reason=kind_mismatch",
                    key.get(),
                    record.id
                );
                self.queue_deletion(key, record.id, None);
            }
            stored_owners.push(record.parent);
            self.lines.push(line);
        }

        for (line, owner) in self.lines.iter_mut().zip(stored_owners) {
            line.category = owner.and_then(|id| keys_by_category.get(&id).copied());
        }

        let renumbered = self.normalize_orders();
        let report = reparent_range(&mut self.lines, 0, 0, ReparentScope::ToEnd);
        renumbered + report.reassigned + self.pending_deletions.len()
    }

    fn allocate_key(&mut self) -> LineKey {
        let key = LineKey::new(self.next_key);
        self.next_key += 1;
        key
    }

    fn settle_insert(&mut self, position: usize) -> LineKey {
        let key = self.lines[position].key;
        let renumbered = self.cascade_orders(position + 1);
        let report = self.reparent(position, position);
        debug!(
            "event=outline_insert module=outline status=ok key={} kind={:?} position={position} order={} renumbered={renumbered} reassigned={}",
            key.get(),
            self.lines[position].kind,
            self.lines[position].display_order,
            report.reassigned
        );
        key
    }

    fn order_for_slot(&self, position: usize) -> i64 {
        let previous = position
            .checked_sub(1)
            .map(|slot| self.lines[slot].display_order);
        let next = self.lines.get(position).map(|line| line.display_order);
        order_between(previous, next)
    }

    /// Raises every line to at least its predecessor's order plus one.
    ///
    /// Unlike `cascade_orders` this walks the whole sequence, since stored
    /// ties can follow any gap.
    fn normalize_orders(&mut self) -> usize {
        let mut raised = 0;
        for index in 1..self.lines.len() {
            let floor = self.lines[index - 1].display_order;
            if self.lines[index].display_order <= floor {
                self.lines[index].set_order(floor + 1);
                raised += 1;
            }
        }
        raised
    }

    /// Shifts successors up by one while they collide with their predecessor.
    fn cascade_orders(&mut self, from: usize) -> usize {
        let mut shifted = 0;
        for index in from.max(1)..self.lines.len() {
            let floor = self.lines[index - 1].display_order;
            if self.lines[index].display_order > floor {
                break;
            }
            self.lines[index].set_order(floor + 1);
            shifted += 1;
        }
        shifted
    }

    fn reparent(&mut self, start: usize, edit_end: usize) -> ReparentReport {
        reparent_range(&mut self.lines, start, edit_end, self.reparent_scope)
    }

    fn queue_deletion(&mut self, key: LineKey, id: PersistedId, reassign_to: Option<LineKey>) {
        let deletion = match id {
            PersistedId::Category(id) => PendingDeletion::Category {
                key,
                id,
                reassign_to,
            },
            PersistedId::Content(id) => PendingDeletion::Content { key, id },
        };
        self.pending_deletions.push(deletion);
    }

    fn take_pending_deletion(&mut self, key: LineKey, kind: LineKind) -> Option<PersistedId> {
        let slot = self
            .pending_deletions
            .iter()
            .position(|deletion| deletion.key() == key && deletion.persisted().matches(kind))?;
        Some(self.pending_deletions.remove(slot).persisted())
    }

    fn write_lines(&self, mode: FlushMode, batch: &mut FlushBatch) -> StoreResult<()> {
        for line in &self.lines {
            if mode == FlushMode::Incremental && line.state == LineState::Clean {
                continue;
            }

            let result = if line.is_heading() {
                self.write_category(line, mode, batch)
            } else {
                self.write_content(line, mode, batch)
            };
            match result {
                Ok(LineWrite::Written(id)) => {
                    if let PersistedId::Category(category_id) = id {
                        batch.category_ids.insert(line.key, category_id);
                    }
                    batch.written.insert(line.key, id);
                    batch.report.written += 1;
                }
                Ok(LineWrite::Orphaned) => batch.report.orphaned += 1,
                Ok(LineWrite::Deferred) => batch.report.deferred += 1,
                Err(err) if err.aborts_batch() => return Err(err),
                Err(StoreError::NotFound { kind, id }) => {
                    warn!(
                        "event=outline_flush_line module=outline status=stale key={} record={kind}:{id}",
                        line.key.get()
                    );
                    batch.category_ids.remove(&line.key);
                    batch.stale.insert(line.key);
                    batch.report.stale += 1;
                }
                Err(err) => {
                    warn!(
                        "event=outline_flush_line module=outline status=error key={} error={err}",
                        line.key.get()
                    );
                    batch.report.failed += 1;
                }
            }
        }
        Ok(())
    }

    fn write_category(
        &self,
        line: &Line,
        mode: FlushMode,
        batch: &FlushBatch,
    ) -> StoreResult<LineWrite> {
        let changes = match mode {
            FlushMode::Full => LineChanges::ALL,
            FlushMode::Incremental => line.changes,
        };
        let existing = line.persisted.and_then(|id| id.category_id());

        let parent = if existing.is_none() || changes.owner {
            match line.category {
                None => Some(None),
                Some(owner) => match batch.category_ids.get(&owner) {
                    Some(id) => Some(Some(*id)),
                    None => return Ok(LineWrite::Deferred),
                },
            }
        } else {
            None
        };

        let id = match existing {
            Some(id) => {
                let patch = CategoryPatch {
                    title: changes.content.then(|| line.display_text.clone()),
                    level: changes.content.then_some(line.level),
                    order: changes.order.then_some(line.display_order),
                    parent,
                };
                self.store.update_category(id, &patch)?;
                id
            }
            None => self.store.create_category(
                self.subject_id,
                &line.display_text,
                line.level,
                parent.flatten(),
                line.display_order,
            )?,
        };
        Ok(LineWrite::Written(PersistedId::Category(id)))
    }

    fn write_content(
        &self,
        line: &Line,
        mode: FlushMode,
        batch: &FlushBatch,
    ) -> StoreResult<LineWrite> {
        let changes = match mode {
            FlushMode::Full => LineChanges::ALL,
            FlushMode::Incremental => line.changes,
        };
        let existing = match line.persisted {
            Some(PersistedId::Content(id)) => Some(id),
            _ => None,
        };

        let owner = if existing.is_none() || changes.owner {
            match line.category {
                None if existing.is_none() => return Ok(LineWrite::Orphaned),
                None => Some(None),
                Some(category) => match batch.category_ids.get(&category) {
                    Some(id) => Some(Some(*id)),
                    None => return Ok(LineWrite::Deferred),
                },
            }
        } else {
            None
        };

        let id = match existing {
            Some(id) => {
                let patch = ContentPatch {
                    body: changes.content.then(|| line.raw.clone()),
                    order: changes.order.then_some(line.display_order),
                    category: owner,
                };
                self.store.update_content(id, &patch)?;
                id
            }
            None => self.store.create_content(
                self.subject_id,
                ContentKind::for_line(line.kind).unwrap_or(ContentKind::Text),
                &line.raw,
                owner.flatten(),
                line.display_order,
            )?,
        };
        Ok(LineWrite::Written(PersistedId::Content(id)))
    }

    fn write_deletions(&self, batch: &mut FlushBatch) -> StoreResult<()> {
        // Contents first so category deletions never reassign doomed records.
        for categories_pass in [false, true] {
            for (slot, deletion) in self.pending_deletions.iter().enumerate() {
                let result = match *deletion {
                    PendingDeletion::Content { id, .. } if !categories_pass => {
                        self.store.delete_content(id)
                    }
                    PendingDeletion::Category {
                        id, reassign_to, ..
                    } if categories_pass => {
                        let target = self.resolve_reassign_target(reassign_to, batch);
                        self.store.delete_category(id, target)
                    }
                    _ => continue,
                };
                match result {
                    Ok(()) => {
                        batch.deleted.push(slot);
                        batch.report.deleted += 1;
                    }
                    Err(err) if err.aborts_batch() => return Err(err),
                    Err(StoreError::NotFound { kind, id }) => {
                        warn!(
                            "event=outline_flush_delete module=outline status=stale record={kind}:{id}"
                        );
                        batch.deleted.push(slot);
                        batch.report.deleted += 1;
                    }
                    Err(err) => {
                        warn!(
                            "event=outline_flush_delete module=outline status=error record={} error={err}",
                            deletion.persisted()
                        );
                        batch.report.failed += 1;
                    }
                }
            }
        }
        Ok(())
    }

    /// Follows reassignment targets through other pending deletions until a
    /// surviving persisted category (or root) is found.
    fn resolve_reassign_target(
        &self,
        mut target: Option<LineKey>,
        batch: &FlushBatch,
    ) -> Option<CategoryId> {
        for _ in 0..=self.pending_deletions.len() {
            let key = target?;
            if let Some(id) = batch.category_ids.get(&key) {
                return Some(*id);
            }
            target = self.pending_deletions.iter().find_map(|deletion| match *deletion {
                PendingDeletion::Category {
                    key: deleted,
                    reassign_to,
                    ..
                } if deleted == key => Some(reassign_to),
                _ => None,
            })?;
        }
        None
    }

    fn apply_batch(&mut self, batch: FlushBatch) -> FlushReport {
        let FlushBatch {
            written,
            stale,
            mut deleted,
            report,
            ..
        } = batch;

        for line in &mut self.lines {
            if let Some(id) = written.get(&line.key) {
                line.mark_written(*id);
            } else if stale.contains(&line.key) {
                line.detach_identity();
            }
        }
        for line in &mut self.lines {
            if line.category.is_some_and(|owner| stale.contains(&owner)) {
                line.mark_owner_changed();
            }
        }

        deleted.sort_unstable();
        for slot in deleted.into_iter().rev() {
            self.pending_deletions.remove(slot);
        }
        report
    }
}

/// Picks an order strictly between `previous` and `next` when one exists.
///
/// Without an integral gap this returns `previous + 1`; the caller then
/// shifts colliding successors.
fn order_between(previous: Option<i64>, next: Option<i64>) -> i64 {
    match (previous, next) {
        (None, None) => ORDER_STEP,
        (Some(previous), None) => previous.saturating_add(ORDER_STEP),
        (None, Some(next)) => next.saturating_sub(ORDER_STEP),
        (Some(previous), Some(next)) if next.saturating_sub(previous) >= 2 => {
            previous + (next - previous) / 2
        }
        (Some(previous), Some(_)) => previous + 1,
    }
}

fn warn_stale_reference(operation: &'static str, key: LineKey) {
    warn!(
        "event=outline_stale_reference module=outline status=skip operation={operation} key={}",
        key.get()
    );
}
