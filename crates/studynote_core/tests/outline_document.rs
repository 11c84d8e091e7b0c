use rusqlite::Connection;
use std::cell::{Cell, RefCell};
use studynote_core::db::open_db_in_memory;
use studynote_core::{
    CategoryId, CategoryPatch, ContentId, ContentKind, ContentPatch, DocumentError,
    EngineConfig, FlushMode, LineKey, LineKind, LineState, OutlineDocument, OutlineStore,
    PersistedId, ReparentScope, SqliteOutlineStore, SqliteSubjectRepository, StoreError,
    StoreResult, StoredRecord, SubjectId, SubjectRepository,
};

type Structure = Vec<(LineKind, String, u8, i64, Option<usize>)>;

fn setup() -> (Connection, SubjectId) {
    let conn = open_db_in_memory().unwrap();
    let subject = SqliteSubjectRepository::try_new(&conn)
        .unwrap()
        .create_subject("Biology")
        .unwrap();
    (conn, subject.subject_uuid)
}

fn open(conn: &Connection, subject: SubjectId) -> OutlineDocument<SqliteOutlineStore<'_>> {
    open_with(conn, subject, &EngineConfig::default())
}

fn open_with<'conn>(
    conn: &'conn Connection,
    subject: SubjectId,
    config: &EngineConfig,
) -> OutlineDocument<SqliteOutlineStore<'conn>> {
    let store = SqliteOutlineStore::try_new(conn).unwrap();
    OutlineDocument::open(store, subject, config).unwrap()
}

/// Builds scenario 1: `# A`, `text1`, `## B`, `text2`.
fn scenario_one<S: OutlineStore>(document: &mut OutlineDocument<S>) -> [LineKey; 4] {
    let a = document.insert_at(0, "# A");
    let text1 = document.insert_at(1, "text1");
    let b = document.insert_at(2, "## B");
    let text2 = document.insert_at(3, "text2");
    [a, text1, b, text2]
}

/// Kind, display text, level, order and owner position of every line.
fn structure<S: OutlineStore>(document: &OutlineDocument<S>) -> Structure {
    document
        .lines()
        .iter()
        .map(|line| {
            let owner = line
                .category()
                .and_then(|owner| document.position_of(owner));
            (
                line.kind(),
                line.display_text().to_string(),
                line.level(),
                line.display_order(),
                owner,
            )
        })
        .collect()
}

fn category_id<S: OutlineStore>(document: &OutlineDocument<S>, key: LineKey) -> CategoryId {
    document
        .line(key)
        .and_then(|line| line.persisted_id())
        .and_then(PersistedId::category_id)
        .unwrap()
}

fn content_id<S: OutlineStore>(document: &OutlineDocument<S>, key: LineKey) -> ContentId {
    match document.line(key).and_then(|line| line.persisted_id()) {
        Some(PersistedId::Content(id)) => id,
        other => panic!("expected content id, got {other:?}"),
    }
}

#[test]
fn scenario_insert_builds_nested_categories() {
    let (conn, subject) = setup();
    let mut document = open(&conn, subject);
    let [a, text1, b, text2] = scenario_one(&mut document);

    let categories = document.categories();
    assert_eq!(categories.len(), 2);
    assert_eq!(categories[0].key, a);
    assert_eq!(categories[0].title, "A");
    assert_eq!(categories[0].level, 1);
    assert_eq!(categories[0].parent, None);
    assert_eq!(categories[0].lines, vec![text1]);
    assert_eq!(categories[0].children, vec![b]);
    assert_eq!(categories[1].key, b);
    assert_eq!(categories[1].level, 2);
    assert_eq!(categories[1].parent, Some(a));
    assert_eq!(categories[1].lines, vec![text2]);

    assert_eq!(document.line(text1).unwrap().category(), Some(a));
    assert_eq!(document.line(text2).unwrap().category(), Some(b));
    assert_eq!(document.enclosing_category(4), Some(b));
    assert!(document.check_invariants().is_empty());
    assert!(document
        .lines()
        .iter()
        .all(|line| line.state() == LineState::New));
}

#[test]
fn scenario_demoting_heading_destroys_category_and_reassigns_lines() {
    let (conn, subject) = setup();
    let mut document = open(&conn, subject);
    let [a, _, b, text2] = scenario_one(&mut document);

    assert!(document.change_content(b, "text-now"));

    let categories = document.categories();
    assert_eq!(categories.len(), 1);
    assert_eq!(categories[0].key, a);
    let demoted = document.line(b).unwrap();
    assert_eq!(demoted.kind(), LineKind::Text);
    assert_eq!(demoted.level(), 0);
    assert_eq!(demoted.category(), Some(a));
    assert_eq!(document.line(text2).unwrap().category(), Some(a));
    assert!(document.check_invariants().is_empty());
}

#[test]
fn scenario_deleting_root_heading_promotes_children_to_root() {
    let (conn, subject) = setup();
    let mut document = open(&conn, subject);
    let [a, text1, b, text2] = scenario_one(&mut document);

    assert!(document.remove(a));

    assert_eq!(document.len(), 3);
    assert!(document.line(a).is_none());
    assert_eq!(document.line(b).unwrap().category(), None);
    assert_eq!(document.line(text1).unwrap().category(), None);
    assert_eq!(document.line(text2).unwrap().category(), Some(b));
    assert!(document.check_invariants().is_empty());
}

#[test]
fn scenario_moving_subheading_before_root_makes_it_root_category() {
    let (conn, subject) = setup();
    let mut document = open(&conn, subject);
    let [a, text1, b, text2] = scenario_one(&mut document);

    assert!(document.reorder(b, 0));

    let keys: Vec<LineKey> = document.lines().iter().map(|line| line.key()).collect();
    assert_eq!(keys, vec![b, a, text1, text2]);
    assert_eq!(document.line(b).unwrap().category(), None);
    assert_eq!(document.line(b).unwrap().level(), 2);
    assert_eq!(document.line(a).unwrap().category(), None);
    assert_eq!(document.line(text2).unwrap().category(), Some(a));
    assert!(document.check_invariants().is_empty());
}

#[test]
fn scenario_full_flush_then_reload_reproduces_structure() {
    let (conn, subject) = setup();
    let mut document = open(&conn, subject);
    scenario_one(&mut document);
    document.insert_image_at(2, "img://membrane.png");

    let report = document.flush(FlushMode::Full).unwrap();
    assert_eq!(report.written, 5);
    assert!(report.is_complete());
    assert_eq!(document.dirty_count(), 0);

    let reloaded = open(&conn, subject);
    assert_eq!(structure(&reloaded), structure(&document));
    assert_eq!(reloaded.dirty_count(), 0);
    assert_eq!(reloaded.lines()[2].kind(), LineKind::Image);
}

#[test]
fn insert_without_gap_shifts_only_until_a_gap_appears() {
    let (conn, subject) = setup();
    let mut document = open(&conn, subject);
    document.insert_at(0, "# A");
    let tail = document.insert_at(1, "tail");
    let tail_order = document.line(tail).unwrap().display_order();

    for index in 0..16 {
        document.insert_at(1, format!("t{index}"));
        assert!(document.check_invariants().is_empty());
    }

    let orders: Vec<i64> = document
        .lines()
        .iter()
        .map(|line| line.display_order())
        .collect();
    assert!(orders.windows(2).all(|pair| pair[0] < pair[1]));
    assert_eq!(document.line(tail).unwrap().display_order(), tail_order);
}

#[test]
fn cascaded_renumber_marks_persisted_lines_dirty_for_order_only() {
    let (conn, subject) = setup();
    let mut document = open(&conn, subject);
    document.insert_at(0, "# A");
    let tail = document.insert_at(1, "tail");
    for index in 0..10 {
        document.insert_at(1, format!("t{index}"));
    }
    document.flush(FlushMode::Incremental).unwrap();
    assert_eq!(document.dirty_count(), 0);

    document.insert_at(1, "squeezed");

    let shifted: Vec<_> = document
        .lines()
        .iter()
        .filter(|line| line.state() == LineState::Dirty)
        .map(|line| line.changes())
        .collect();
    assert!(!shifted.is_empty());
    assert!(shifted
        .iter()
        .all(|changes| changes.order && !changes.content && !changes.owner));
    assert_eq!(document.line(tail).unwrap().state(), LineState::Clean);

    let report = document.flush(FlushMode::Incremental).unwrap();
    assert_eq!(report.written, shifted.len() + 1);
    assert_eq!(structure(&open(&conn, subject)), structure(&document));
}

#[test]
fn removing_heading_reassigns_direct_children_to_its_parent() {
    let (conn, subject) = setup();
    let mut document = open(&conn, subject);
    let a = document.insert_at(0, "# A");
    let b = document.insert_at(1, "## B");
    let t = document.insert_at(2, "t");
    let c = document.insert_at(3, "### C");
    let deep = document.insert_at(4, "deep");

    assert!(document.remove(b));

    assert_eq!(document.line(t).unwrap().category(), Some(a));
    assert_eq!(document.line(c).unwrap().category(), Some(a));
    assert_eq!(document.line(deep).unwrap().category(), Some(c));
    assert_eq!(document.len(), 4);
}

#[test]
fn releveling_heading_recomputes_nesting() {
    let (conn, subject) = setup();
    let mut document = open(&conn, subject);
    let a = document.insert_at(0, "# A");
    let b = document.insert_at(1, "## B");
    let c = document.insert_at(2, "### C");
    let t = document.insert_at(3, "t");

    assert!(document.change_content(b, "#### B"));

    assert_eq!(document.line(b).unwrap().category(), Some(a));
    assert_eq!(document.line(c).unwrap().category(), Some(a));
    assert_eq!(document.line(t).unwrap().category(), Some(c));
    assert!(document.check_invariants().is_empty());
}

#[test]
fn moving_heading_changes_which_lines_it_encloses() {
    let (conn, subject) = setup();
    let mut document = open(&conn, subject);
    let a = document.insert_at(0, "# A");
    let t1 = document.insert_at(1, "t1");
    let b = document.insert_at(2, "## B");
    let t2 = document.insert_at(3, "t2");
    let c = document.insert_at(4, "# C");
    let t3 = document.insert_at(5, "t3");

    assert!(document.reorder(c, 1));

    assert_eq!(document.line(c).unwrap().category(), None);
    assert_eq!(document.line(t1).unwrap().category(), Some(c));
    assert_eq!(document.line(b).unwrap().category(), Some(c));
    assert_eq!(document.line(t2).unwrap().category(), Some(b));
    assert_eq!(document.line(t3).unwrap().category(), Some(b));
    assert_eq!(document.line(a).unwrap().category(), None);
    assert!(document.check_invariants().is_empty());

    assert!(document.reorder(c, 99));
    assert_eq!(document.lines().last().unwrap().key(), c);
    assert!(document.check_invariants().is_empty());
}

#[test]
fn stale_line_keys_are_ignored() {
    let (conn, subject) = setup();
    let mut document = open(&conn, subject);
    let [_, text1, ..] = scenario_one(&mut document);
    assert!(document.remove(text1));
    let before = structure(&document);

    assert!(!document.remove(text1));
    assert!(!document.change_content(text1, "# X"));
    assert!(!document.reorder(text1, 0));
    assert_eq!(structure(&document), before);
}

#[test]
fn image_lines_never_reclassify() {
    let (conn, subject) = setup();
    let mut document = open(&conn, subject);
    let a = document.insert_at(0, "# A");
    let image = document.insert_image_at(1, "img://cell.png");

    assert!(document.change_content(image, "# not a heading"));
    let line = document.line(image).unwrap();
    assert_eq!(line.kind(), LineKind::Image);
    assert_eq!(line.level(), 0);
    assert_eq!(line.category(), Some(a));
    assert_eq!(document.categories().len(), 1);
}

#[test]
fn incremental_flush_writes_only_dirty_lines() {
    let (conn, subject) = setup();
    let mut document = open(&conn, subject);
    let [_, text1, ..] = scenario_one(&mut document);

    let report = document.flush(FlushMode::Incremental).unwrap();
    assert_eq!(report.written, 4);
    assert!(!document.has_unsaved_changes());
    assert_eq!(
        document.flush(FlushMode::Incremental).unwrap(),
        Default::default()
    );

    document.change_content(text1, "text1 edited");
    assert_eq!(document.dirty_count(), 1);
    let changes = document.line(text1).unwrap().changes();
    assert!(changes.content && !changes.order && !changes.owner);

    let report = document.flush(FlushMode::Incremental).unwrap();
    assert_eq!(report.written, 1);
    let records = document.store().load_all(subject).unwrap();
    assert!(records.iter().any(|record| record.body == "text1 edited"));
}

#[test]
fn orphan_text_waits_for_a_heading() {
    let (conn, subject) = setup();
    let mut document = open(&conn, subject);
    let loose = document.insert_at(0, "loose note");

    let report = document.flush(FlushMode::Incremental).unwrap();
    assert_eq!(report.orphaned, 1);
    assert_eq!(report.written, 0);
    assert!(report.is_complete());
    assert_eq!(document.line(loose).unwrap().state(), LineState::New);
    assert!(document.store().load_all(subject).unwrap().is_empty());

    let a = document.insert_at(0, "# A");
    assert_eq!(document.line(loose).unwrap().category(), Some(a));
    let report = document.flush(FlushMode::Incremental).unwrap();
    assert_eq!(report.written, 2);
    assert_eq!(report.orphaned, 0);
}

#[test]
fn deleting_persisted_heading_flushes_reassignment_and_deletion() {
    let (conn, subject) = setup();
    let mut document = open(&conn, subject);
    let [a, ..] = scenario_one(&mut document);
    document.flush(FlushMode::Incremental).unwrap();

    document.remove(a);
    assert_eq!(document.pending_deletion_count(), 1);
    let report = document.flush(FlushMode::Incremental).unwrap();
    assert_eq!(report.deleted, 1);
    assert_eq!(report.written, 2);
    assert_eq!(document.pending_deletion_count(), 0);

    let records = document.store().load_all(subject).unwrap();
    assert_eq!(records.len(), 3);
    assert!(records
        .iter()
        .filter(|record| record.kind == LineKind::Heading)
        .all(|record| record.parent.is_none()));
    assert_eq!(structure(&open(&conn, subject)), structure(&document));
}

#[test]
fn kind_flip_replaces_record_kind_on_flush() {
    let (conn, subject) = setup();
    let mut document = open(&conn, subject);
    let [a, _, b, text2] = scenario_one(&mut document);
    document.flush(FlushMode::Incremental).unwrap();
    let a_id = category_id(&document, a);

    document.change_content(b, "text-now");
    assert_eq!(document.line(b).unwrap().persisted_id(), None);
    let report = document.flush(FlushMode::Incremental).unwrap();
    assert_eq!(report.deleted, 1);
    assert!(report.is_complete());

    let records = document.store().load_all(subject).unwrap();
    assert_eq!(
        records
            .iter()
            .filter(|record| record.kind == LineKind::Heading)
            .count(),
        1
    );
    assert!(records
        .iter()
        .filter(|record| record.kind == LineKind::Text)
        .all(|record| record.parent == Some(a_id)));
    assert_eq!(
        document.line(text2).unwrap().category(),
        Some(a),
        "text2 follows its enclosing heading"
    );
    assert_eq!(structure(&open(&conn, subject)), structure(&document));
}

#[test]
fn flipping_back_before_flush_reuses_the_original_record() {
    let (conn, subject) = setup();
    let mut document = open(&conn, subject);
    let [_, _, b, _] = scenario_one(&mut document);
    document.flush(FlushMode::Incremental).unwrap();
    let b_id = category_id(&document, b);

    document.change_content(b, "plain");
    assert_eq!(document.pending_deletion_count(), 1);
    document.change_content(b, "## B again");
    assert_eq!(document.pending_deletion_count(), 0);
    assert_eq!(category_id(&document, b), b_id);

    let report = document.flush(FlushMode::Incremental).unwrap();
    assert_eq!(report.deleted, 0);
    let records = document.store().load_all(subject).unwrap();
    assert!(records.iter().any(|record| record.body == "B again"));
}

#[test]
fn deleting_nested_headings_in_one_flush_resolves_surviving_target() {
    let (conn, subject) = setup();
    let mut document = open(&conn, subject);
    let a = document.insert_at(0, "# A");
    let b = document.insert_at(1, "## B");
    let c = document.insert_at(2, "### C");
    document.insert_at(3, "deep");
    document.flush(FlushMode::Incremental).unwrap();
    let a_id = category_id(&document, a);

    document.remove(c);
    document.remove(b);
    let report = document.flush(FlushMode::Incremental).unwrap();
    assert_eq!(report.deleted, 2);

    let records = document.store().load_all(subject).unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[1].parent, Some(a_id));
}

#[test]
fn load_repairs_orders_and_owners() {
    let (conn, subject) = setup();
    let store = SqliteOutlineStore::try_new(&conn).unwrap();
    let a = store.create_category(subject, "A", 1, None, 10).unwrap();
    store
        .create_content(subject, ContentKind::Text, "same order", Some(a), 10)
        .unwrap();
    store
        .create_content(subject, ContentKind::Text, "before A", Some(a), 5)
        .unwrap();

    let mut document = open(&conn, subject);
    let orders: Vec<i64> = document
        .lines()
        .iter()
        .map(|line| line.display_order())
        .collect();
    assert_eq!(orders, vec![5, 10, 11]);
    assert_eq!(document.lines()[0].category(), None);
    assert_eq!(document.dirty_count(), 2);
    assert!(document.check_invariants().is_empty());

    let report = document.flush(FlushMode::Incremental).unwrap();
    assert_eq!(report.written, 2);
    let records = document.store().load_all(subject).unwrap();
    assert_eq!(records[0].parent, None);
    assert_eq!(records[2].order, 11);
}

#[test]
fn load_repairs_ties_that_follow_a_gap() {
    let (conn, subject) = setup();
    let store = SqliteOutlineStore::try_new(&conn).unwrap();
    let a = store.create_category(subject, "A", 1, None, 1).unwrap();
    for body in ["first", "second", "third"] {
        store
            .create_content(subject, ContentKind::Text, body, Some(a), 50)
            .unwrap();
    }
    store
        .create_content(subject, ContentKind::Text, "last", Some(a), 200)
        .unwrap();

    let mut document = open(&conn, subject);
    let orders: Vec<i64> = document
        .lines()
        .iter()
        .map(|line| line.display_order())
        .collect();
    assert_eq!(orders, vec![1, 50, 51, 52, 200]);
    assert_eq!(document.dirty_count(), 2);
    assert!(document.check_invariants().is_empty());

    document.flush(FlushMode::Incremental).unwrap();
    let stored: Vec<i64> = document
        .store()
        .load_all(subject)
        .unwrap()
        .iter()
        .map(|record| record.order)
        .collect();
    assert_eq!(stored, vec![1, 50, 51, 52, 200]);
}

#[test]
fn reload_rewrites_heading_marker_spacing_canonically() {
    let (conn, subject) = setup();
    let mut document = open(&conn, subject);
    document.insert_at(0, "# A");
    let spaced = document.insert_at(1, "##    Spaced");
    document.flush(FlushMode::Full).unwrap();
    assert_eq!(document.line(spaced).unwrap().raw(), "##    Spaced");

    let reloaded = open(&conn, subject);
    let heading = &reloaded.lines()[1];
    assert_eq!(heading.raw(), "## Spaced");
    assert_eq!(heading.display_text(), "Spaced");
    assert_eq!(heading.level(), 2);
    assert_eq!(reloaded.dirty_count(), 0);
}

#[test]
fn load_replaces_records_whose_kind_disagrees_with_text() {
    let (conn, subject) = setup();
    let store = SqliteOutlineStore::try_new(&conn).unwrap();
    store
        .create_content(subject, ContentKind::Text, "# Looks like a heading", None, 1)
        .unwrap();

    let mut document = open(&conn, subject);
    assert_eq!(document.pending_deletion_count(), 1);
    assert_eq!(document.lines()[0].kind(), LineKind::Heading);
    assert_eq!(document.lines()[0].state(), LineState::New);

    let report = document.flush(FlushMode::Incremental).unwrap();
    assert_eq!(report.written, 1);
    assert_eq!(report.deleted, 1);
    let records = document.store().load_all(subject).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].kind, LineKind::Heading);
    assert_eq!(records[0].body, "Looks like a heading");
}

#[test]
fn record_deleted_elsewhere_is_recreated_on_next_flush() {
    let (conn, subject) = setup();
    let mut document = open(&conn, subject);
    let [_, text1, ..] = scenario_one(&mut document);
    document.flush(FlushMode::Incremental).unwrap();
    let old_id = content_id(&document, text1);

    document.store().delete_content(old_id).unwrap();
    document.change_content(text1, "text1 edited");

    let report = document.flush(FlushMode::Incremental).unwrap();
    assert_eq!(report.stale, 1);
    assert!(!report.is_complete());
    assert_eq!(document.line(text1).unwrap().state(), LineState::New);

    let report = document.flush(FlushMode::Incremental).unwrap();
    assert_eq!(report.written, 1);
    assert!(report.is_complete());
    assert_ne!(content_id(&document, text1), old_id);
    assert_eq!(structure(&open(&conn, subject)), structure(&document));
}

#[test]
fn stale_heading_is_recreated_and_children_follow() {
    let (conn, subject) = setup();
    let mut document = open(&conn, subject);
    let [a, _, b, text2] = scenario_one(&mut document);
    document.flush(FlushMode::Incremental).unwrap();
    let a_id = category_id(&document, a);
    let b_id = category_id(&document, b);

    document.store().delete_category(b_id, Some(a_id)).unwrap();
    document.change_content(b, "## B2");

    let report = document.flush(FlushMode::Incremental).unwrap();
    assert_eq!(report.stale, 1);
    assert!(document.line(text2).unwrap().changes().owner);

    let report = document.flush(FlushMode::Incremental).unwrap();
    assert_eq!(report.written, 2);
    let new_b = category_id(&document, b);
    assert_ne!(new_b, b_id);

    let records = document.store().load_all(subject).unwrap();
    let text2_record = records
        .iter()
        .find(|record| record.body == "text2")
        .unwrap();
    assert_eq!(text2_record.parent, Some(new_b));
}

#[test]
fn removing_line_already_deleted_elsewhere_is_a_noop() {
    let (conn, subject) = setup();
    let mut document = open(&conn, subject);
    let [_, text1, ..] = scenario_one(&mut document);
    document.flush(FlushMode::Incremental).unwrap();

    document
        .store()
        .delete_content(content_id(&document, text1))
        .unwrap();
    document.remove(text1);

    let report = document.flush(FlushMode::Incremental).unwrap();
    assert_eq!(report.deleted, 1);
    assert_eq!(report.failed, 0);
    assert_eq!(document.pending_deletion_count(), 0);
}

/// Store wrapper with injectable failures.
struct FlakyStore<'conn> {
    inner: SqliteOutlineStore<'conn>,
    fail_commit: Cell<bool>,
    reject_body: RefCell<Option<String>>,
}

impl<'conn> FlakyStore<'conn> {
    fn new(conn: &'conn Connection) -> Self {
        Self {
            inner: SqliteOutlineStore::try_new(conn).unwrap(),
            fail_commit: Cell::new(false),
            reject_body: RefCell::new(None),
        }
    }

    fn reject(&self, body: &str) -> StoreResult<()> {
        if self.reject_body.borrow().as_deref() == Some(body) {
            return Err(StoreError::InvalidRecord("injected rejection".to_string()));
        }
        Ok(())
    }
}

impl OutlineStore for FlakyStore<'_> {
    fn begin_batch(&self) -> StoreResult<()> {
        self.inner.begin_batch()
    }

    fn commit_batch(&self) -> StoreResult<()> {
        if self.fail_commit.get() {
            return Err(StoreError::Batch("injected commit failure"));
        }
        self.inner.commit_batch()
    }

    fn rollback_batch(&self) -> StoreResult<()> {
        self.inner.rollback_batch()
    }

    fn create_category(
        &self,
        subject_id: SubjectId,
        title: &str,
        level: u8,
        parent: Option<CategoryId>,
        order: i64,
    ) -> StoreResult<CategoryId> {
        self.reject(title)?;
        self.inner
            .create_category(subject_id, title, level, parent, order)
    }

    fn update_category(&self, id: CategoryId, patch: &CategoryPatch) -> StoreResult<()> {
        self.inner.update_category(id, patch)
    }

    fn delete_category(
        &self,
        id: CategoryId,
        reassign_children_to: Option<CategoryId>,
    ) -> StoreResult<()> {
        self.inner.delete_category(id, reassign_children_to)
    }

    fn create_content(
        &self,
        subject_id: SubjectId,
        kind: ContentKind,
        body: &str,
        category: Option<CategoryId>,
        order: i64,
    ) -> StoreResult<ContentId> {
        self.reject(body)?;
        self.inner
            .create_content(subject_id, kind, body, category, order)
    }

    fn update_content(&self, id: ContentId, patch: &ContentPatch) -> StoreResult<()> {
        self.inner.update_content(id, patch)
    }

    fn delete_content(&self, id: ContentId) -> StoreResult<()> {
        self.inner.delete_content(id)
    }

    fn load_all(&self, subject_id: SubjectId) -> StoreResult<Vec<StoredRecord>> {
        self.inner.load_all(subject_id)
    }
}

#[test]
fn failed_transaction_rolls_back_and_keeps_every_line_dirty() {
    let (conn, subject) = setup();
    let store = FlakyStore::new(&conn);
    let mut document = OutlineDocument::open(&store, subject, &EngineConfig::default()).unwrap();
    scenario_one(&mut document);

    store.fail_commit.set(true);
    let err = document.flush(FlushMode::Incremental).unwrap_err();
    assert!(matches!(err, DocumentError::Transaction(StoreError::Batch(_))));
    assert_eq!(document.dirty_count(), 4);
    assert!(document
        .lines()
        .iter()
        .all(|line| line.persisted_id().is_none()));
    assert!(store.load_all(subject).unwrap().is_empty());
    assert!(!store.inner.in_batch());

    store.fail_commit.set(false);
    let report = document.flush(FlushMode::Incremental).unwrap();
    assert_eq!(report.written, 4);
    assert_eq!(store.load_all(subject).unwrap().len(), 4);
}

#[test]
fn failed_line_stays_dirty_while_rest_of_batch_commits() {
    let (conn, subject) = setup();
    let store = FlakyStore::new(&conn);
    let mut document = OutlineDocument::open(&store, subject, &EngineConfig::default()).unwrap();
    let [_, text1, ..] = scenario_one(&mut document);

    *store.reject_body.borrow_mut() = Some("text1".to_string());
    let report = document.flush(FlushMode::Incremental).unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(report.written, 3);
    assert_eq!(document.dirty_count(), 1);
    assert_eq!(document.line(text1).unwrap().state(), LineState::New);

    *store.reject_body.borrow_mut() = None;
    let report = document.flush(FlushMode::Incremental).unwrap();
    assert_eq!(report.written, 1);
    assert!(report.is_complete());
}

#[test]
fn children_of_unsaved_heading_are_deferred() {
    let (conn, subject) = setup();
    let store = FlakyStore::new(&conn);
    let mut document = OutlineDocument::open(&store, subject, &EngineConfig::default()).unwrap();
    document.insert_at(0, "# A");
    document.insert_at(1, "text1");
    document.flush(FlushMode::Incremental).unwrap();

    *store.reject_body.borrow_mut() = Some("Rejected".to_string());
    let b = document.insert_at(2, "## Rejected");
    document.insert_at(3, "under b");
    let report = document.flush(FlushMode::Incremental).unwrap();

    assert_eq!(document.line(b).unwrap().state(), LineState::New);
    assert_eq!(report.failed, 1);
    assert_eq!(report.deferred, 1);
    assert_eq!(document.dirty_count(), 2);
}

#[test]
fn undo_restores_previous_sequence() {
    let (conn, subject) = setup();
    let mut document = open(&conn, subject);
    let [a, text1, b, _] = scenario_one(&mut document);
    let before = structure(&document);

    document.remove(a);
    document.reorder(b, 0);
    assert_eq!(document.undo_depth(), 6);

    assert!(document.undo());
    assert!(document.undo());
    assert_eq!(structure(&document), before);
    assert_eq!(document.line(text1).unwrap().category(), Some(a));
    assert!(document.check_invariants().is_empty());
}

#[test]
fn consecutive_edits_of_one_line_undo_as_one_step() {
    let (conn, subject) = setup();
    let mut document = open(&conn, subject);
    let a = document.insert_at(0, "# A");
    let t = document.insert_at(1, "t");

    document.change_content(t, "te");
    document.change_content(t, "tex");
    document.change_content(t, "text");
    assert_eq!(document.undo_depth(), 3);

    assert!(document.undo());
    assert_eq!(document.line(t).unwrap().raw(), "t");
    assert!(document.undo());
    assert!(document.line(t).is_none());
    assert!(document.undo());
    assert!(document.line(a).is_none());
    assert!(!document.undo());
}

#[test]
fn undo_history_is_bounded() {
    let (conn, subject) = setup();
    let config = EngineConfig {
        undo_capacity: 2,
        ..EngineConfig::default()
    };
    let mut document = open_with(&conn, subject, &config);
    for index in 0..5 {
        document.insert_at(index, format!("# H{index}"));
    }
    assert_eq!(document.undo_depth(), 2);
    assert!(document.undo());
    assert!(document.undo());
    assert!(!document.undo());
    assert_eq!(document.len(), 3);
}

#[test]
fn undo_cancels_pending_deletion_of_persisted_lines() {
    let (conn, subject) = setup();
    let mut document = open(&conn, subject);
    let [a, _, b, _] = scenario_one(&mut document);
    document.flush(FlushMode::Incremental).unwrap();
    let a_id = category_id(&document, a);
    let b_id = category_id(&document, b);

    document.remove(a);
    document.change_content(b, "plain");
    assert_eq!(document.pending_deletion_count(), 2);

    assert!(document.undo());
    assert!(document.undo());
    assert_eq!(document.pending_deletion_count(), 0);
    assert_eq!(category_id(&document, a), a_id);
    assert_eq!(category_id(&document, b), b_id);

    let report = document.flush(FlushMode::Incremental).unwrap();
    assert_eq!(report.deleted, 0);
    assert_eq!(report.written, 4);
    assert_eq!(structure(&open(&conn, subject)), structure(&document));
}

#[test]
fn undo_after_flush_deletes_records_of_undone_inserts() {
    let (conn, subject) = setup();
    let mut document = open(&conn, subject);
    document.insert_at(0, "# A");
    let t = document.insert_at(1, "t");
    document.flush(FlushMode::Incremental).unwrap();

    assert!(document.undo());
    assert!(document.line(t).is_none());
    assert_eq!(document.pending_deletion_count(), 1);

    let report = document.flush(FlushMode::Incremental).unwrap();
    assert_eq!(report.deleted, 1);
    assert_eq!(document.store().load_all(subject).unwrap().len(), 1);
}

/// Deterministic xorshift generator for edit sequences.
struct Edits(u64);

impl Edits {
    fn next(&mut self, bound: usize) -> usize {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 7;
        self.0 ^= self.0 << 17;
        (self.0 % bound as u64) as usize
    }
}

const TEXTS: &[&str] = &[
    "# Chapter",
    "## Section",
    "### Topic",
    "#### Detail",
    "plain note",
    "another note",
    "#no-space is text",
];

fn run_random_edits(scope: ReparentScope, seed: u64) {
    let (conn, subject) = setup();
    let config = EngineConfig {
        reparent_scope: scope,
        ..EngineConfig::default()
    };
    let mut document = open_with(&conn, subject, &config);
    let mut edits = Edits(seed);

    for step in 0..400 {
        let len = document.len();
        match edits.next(6) {
            0 | 1 => {
                let text = TEXTS[edits.next(TEXTS.len())];
                document.insert_at(edits.next(len + 1), text);
            }
            2 if len > 0 => {
                let key = document.lines()[edits.next(len)].key();
                document.remove(key);
            }
            3 if len > 0 => {
                let key = document.lines()[edits.next(len)].key();
                document.change_content(key, TEXTS[edits.next(TEXTS.len())]);
            }
            4 if len > 0 => {
                let key = document.lines()[edits.next(len)].key();
                document.reorder(key, edits.next(len));
            }
            5 if step % 25 == 0 => {
                document.flush(FlushMode::Incremental).unwrap();
            }
            _ => {
                document.undo();
            }
        }
        assert_eq!(
            document.check_invariants(),
            Vec::new(),
            "step {step} seed {seed}"
        );
    }

    // Persist everything reachable: a leading heading owns any orphans.
    document.insert_at(0, "# Root");
    let report = document.flush(FlushMode::Full).unwrap();
    assert!(report.is_complete());
    assert_eq!(structure(&open(&conn, subject)), structure(&document));
}

#[test]
fn random_edits_keep_invariants_when_walking_to_end() {
    for seed in [7, 1_234, 99_991] {
        run_random_edits(ReparentScope::ToEnd, seed);
    }
}

#[test]
fn random_edits_keep_invariants_when_stopping_early() {
    for seed in [7, 1_234, 99_991] {
        run_random_edits(ReparentScope::UntilStable, seed);
    }
}
