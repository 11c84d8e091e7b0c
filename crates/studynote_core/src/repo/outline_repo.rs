//! Ordered outline store contracts and SQLite implementation.
//!
//! # Responsibility
//! - Provide create/update/delete/load APIs for category and content records.
//! - Group writes into caller-driven batches (one transaction per flush).
//! - Keep SQL details and ordering behavior inside the repository boundary.
//!
//! # Invariants
//! - Every statement is parameterized; no SQL is built from user text.
//! - `load_all` returns records ordered by `sort_order ASC`, categories first
//!   on ties, then by uuid.
//! - Deleting a category first moves its remaining children to the supplied
//!   target, so no record ever references a deleted category.

use crate::db::migrations::latest_version;
use crate::db::DbError;
use crate::model::line::{CategoryId, ContentId, LineKind, PersistedId, SubjectId};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, ErrorCode, Row};
use std::cell::Cell;
use std::error::Error;
use std::fmt::{Display, Formatter};
use uuid::Uuid;

/// Result type used by outline store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Persisted record kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Category,
    Content,
}

impl Display for RecordKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Category => write!(f, "category"),
            Self::Content => write!(f, "content"),
        }
    }
}

/// Errors from outline store operations.
#[derive(Debug)]
pub enum StoreError {
    /// Underlying SQLite/bootstrap error.
    Db(DbError),
    /// Target record does not exist (stale identity).
    NotFound { kind: RecordKind, id: Uuid },
    /// Write input violates a record constraint.
    InvalidRecord(String),
    /// Persisted data cannot be converted to a valid read model.
    InvalidData(String),
    /// Batch begin/commit/rollback called out of order.
    Batch(&'static str),
    /// Connection schema is not at the expected migrated version.
    UninitializedConnection {
        expected_version: u32,
        actual_version: u32,
    },
    /// Required table is missing.
    MissingRequiredTable(&'static str),
    /// Required column is missing from expected table.
    MissingRequiredColumn {
        table: &'static str,
        column: &'static str,
    },
}

impl StoreError {
    /// Whether this error means the whole batch transaction failed, as
    /// opposed to one record write failing inside an otherwise healthy batch.
    pub fn aborts_batch(&self) -> bool {
        match self {
            Self::Db(DbError::Sqlite(rusqlite::Error::SqliteFailure(err, _))) => {
                err.code != ErrorCode::ConstraintViolation
            }
            Self::Db(DbError::Sqlite(_)) => false,
            Self::Db(DbError::UnsupportedSchemaVersion { .. }) => true,
            Self::NotFound { .. } | Self::InvalidRecord(_) | Self::InvalidData(_) => false,
            Self::Batch(_)
            | Self::UninitializedConnection { .. }
            | Self::MissingRequiredTable(_)
            | Self::MissingRequiredColumn { .. } => true,
        }
    }
}

impl Display for StoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Db(err) => write!(f, "{err}"),
            Self::NotFound { kind, id } => write!(f, "{kind} record not found: {id}"),
            Self::InvalidRecord(message) => write!(f, "invalid outline record: {message}"),
            Self::InvalidData(message) => write!(f, "invalid persisted outline data: {message}"),
            Self::Batch(message) => write!(f, "outline batch error: {message}"),
            Self::UninitializedConnection {
                expected_version,
                actual_version,
            } => write!(
                f,
                "outline store requires schema version {expected_version}, got {actual_version}"
            ),
            Self::MissingRequiredTable(table) => {
                write!(f, "outline store requires table `{table}`")
            }
            Self::MissingRequiredColumn { table, column } => write!(
                f,
                "outline store requires column `{column}` in table `{table}`"
            ),
        }
    }
}

impl Error for StoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Db(err) => Some(err),
            _ => None,
        }
    }
}

impl From<DbError> for StoreError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

/// Content record payload kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Text,
    Image,
}

impl ContentKind {
    /// Maps a line kind to its content kind. Headings have none.
    pub fn for_line(kind: LineKind) -> Option<Self> {
        match kind {
            LineKind::Heading => None,
            LineKind::Text => Some(Self::Text),
            LineKind::Image => Some(Self::Image),
        }
    }
}

/// Partial category update. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CategoryPatch {
    pub title: Option<String>,
    pub level: Option<u8>,
    pub order: Option<i64>,
    /// `Some(None)` moves the category to root level.
    pub parent: Option<Option<CategoryId>>,
}

/// Partial content update. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContentPatch {
    /// Text, or image reference for image content.
    pub body: Option<String>,
    pub order: Option<i64>,
    /// `Some(None)` marks the content as root-pending.
    pub category: Option<Option<CategoryId>>,
}

/// One record returned by `load_all`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord {
    pub id: PersistedId,
    pub kind: LineKind,
    /// Category title, text body, or image reference.
    pub body: String,
    /// Heading level for categories, `0` for content.
    pub level: u8,
    pub order: i64,
    /// Parent category (categories) or owning category (content).
    pub parent: Option<CategoryId>,
}

/// Ordered persistence interface used by the outline document.
///
/// Mutating calls are made between `begin_batch` and `commit_batch` (or
/// `rollback_batch`); implementations must make the batch atomic.
pub trait OutlineStore {
    /// Opens one atomic write batch.
    fn begin_batch(&self) -> StoreResult<()>;
    /// Commits the open batch.
    fn commit_batch(&self) -> StoreResult<()>;
    /// Discards every write of the open batch.
    fn rollback_batch(&self) -> StoreResult<()>;
    /// Creates one category record.
    fn create_category(
        &self,
        subject_id: SubjectId,
        title: &str,
        level: u8,
        parent: Option<CategoryId>,
        order: i64,
    ) -> StoreResult<CategoryId>;
    /// Applies a partial category update.
    fn update_category(&self, id: CategoryId, patch: &CategoryPatch) -> StoreResult<()>;
    /// Deletes one category after moving its children to `reassign_children_to`.
    fn delete_category(
        &self,
        id: CategoryId,
        reassign_children_to: Option<CategoryId>,
    ) -> StoreResult<()>;
    /// Creates one content record.
    fn create_content(
        &self,
        subject_id: SubjectId,
        kind: ContentKind,
        body: &str,
        category: Option<CategoryId>,
        order: i64,
    ) -> StoreResult<ContentId>;
    /// Applies a partial content update.
    fn update_content(&self, id: ContentId, patch: &ContentPatch) -> StoreResult<()>;
    /// Deletes one content record.
    fn delete_content(&self, id: ContentId) -> StoreResult<()>;
    /// Loads every record of one subject in display order.
    fn load_all(&self, subject_id: SubjectId) -> StoreResult<Vec<StoredRecord>>;
}

impl<T: OutlineStore + ?Sized> OutlineStore for &T {
    fn begin_batch(&self) -> StoreResult<()> {
        (**self).begin_batch()
    }

    fn commit_batch(&self) -> StoreResult<()> {
        (**self).commit_batch()
    }

    fn rollback_batch(&self) -> StoreResult<()> {
        (**self).rollback_batch()
    }

    fn create_category(
        &self,
        subject_id: SubjectId,
        title: &str,
        level: u8,
        parent: Option<CategoryId>,
        order: i64,
    ) -> StoreResult<CategoryId> {
        (**self).create_category(subject_id, title, level, parent, order)
    }

    fn update_category(&self, id: CategoryId, patch: &CategoryPatch) -> StoreResult<()> {
        (**self).update_category(id, patch)
    }

    fn delete_category(
        &self,
        id: CategoryId,
        reassign_children_to: Option<CategoryId>,
    ) -> StoreResult<()> {
        (**self).delete_category(id, reassign_children_to)
    }

    fn create_content(
        &self,
        subject_id: SubjectId,
        kind: ContentKind,
        body: &str,
        category: Option<CategoryId>,
        order: i64,
    ) -> StoreResult<ContentId> {
        (**self).create_content(subject_id, kind, body, category, order)
    }

    fn update_content(&self, id: ContentId, patch: &ContentPatch) -> StoreResult<()> {
        (**self).update_content(id, patch)
    }

    fn delete_content(&self, id: ContentId) -> StoreResult<()> {
        (**self).delete_content(id)
    }

    fn load_all(&self, subject_id: SubjectId) -> StoreResult<Vec<StoredRecord>> {
        (**self).load_all(subject_id)
    }
}

/// SQLite-backed outline store.
///
/// A batch is one `BEGIN IMMEDIATE` transaction, so the database write lock
/// is held for the whole flush and writes from other connections serialize
/// around it.
pub struct SqliteOutlineStore<'conn> {
    conn: &'conn Connection,
    in_batch: Cell<bool>,
}

impl<'conn> SqliteOutlineStore<'conn> {
    /// Creates a store from a migrated connection.
    pub fn try_new(conn: &'conn Connection) -> StoreResult<Self> {
        ensure_outline_connection_ready(conn)?;
        Ok(Self {
            conn,
            in_batch: Cell::new(false),
        })
    }

    /// Whether a batch is currently open.
    pub fn in_batch(&self) -> bool {
        self.in_batch.get()
    }
}

impl OutlineStore for SqliteOutlineStore<'_> {
    fn begin_batch(&self) -> StoreResult<()> {
        if self.in_batch.get() {
            return Err(StoreError::Batch("batch already open"));
        }
        self.conn.execute_batch("BEGIN IMMEDIATE;")?;
        self.in_batch.set(true);
        Ok(())
    }

    fn commit_batch(&self) -> StoreResult<()> {
        if !self.in_batch.get() {
            return Err(StoreError::Batch("no open batch to commit"));
        }
        self.conn.execute_batch("COMMIT;")?;
        self.in_batch.set(false);
        Ok(())
    }

    fn rollback_batch(&self) -> StoreResult<()> {
        if !self.in_batch.get() {
            return Err(StoreError::Batch("no open batch to roll back"));
        }
        self.in_batch.set(false);
        if self.conn.is_autocommit() {
            // SQLite already rolled back (e.g. after a failed COMMIT).
            return Ok(());
        }
        self.conn.execute_batch("ROLLBACK;")?;
        Ok(())
    }

    fn create_category(
        &self,
        subject_id: SubjectId,
        title: &str,
        level: u8,
        parent: Option<CategoryId>,
        order: i64,
    ) -> StoreResult<CategoryId> {
        validate_title(title)?;
        validate_level(level)?;
        let category_uuid = Uuid::new_v4();
        self.conn.execute(
            "INSERT INTO categories (
                category_uuid,
                subject_uuid,
                parent_uuid,
                title,
                level,
                sort_order
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6);",
            params![
                category_uuid.to_string(),
                subject_id.to_string(),
                parent.map(|value| value.to_string()),
                title,
                i64::from(level),
                order,
            ],
        )?;
        Ok(category_uuid)
    }

    fn update_category(&self, id: CategoryId, patch: &CategoryPatch) -> StoreResult<()> {
        if let Some(title) = patch.title.as_deref() {
            validate_title(title)?;
        }
        if let Some(level) = patch.level {
            validate_level(level)?;
        }
        if patch.parent == Some(Some(id)) {
            return Err(StoreError::InvalidRecord(format!(
                "category {id} cannot be its own parent"
            )));
        }

        let mut sql = String::from("UPDATE categories SET updated_at = (strftime('%s', 'now') * 1000)");
        let mut bind_values: Vec<Value> = Vec::new();
        if let Some(title) = &patch.title {
            sql.push_str(", title = ?");
            bind_values.push(Value::Text(title.clone()));
        }
        if let Some(level) = patch.level {
            sql.push_str(", level = ?");
            bind_values.push(Value::Integer(i64::from(level)));
        }
        if let Some(order) = patch.order {
            sql.push_str(", sort_order = ?");
            bind_values.push(Value::Integer(order));
        }
        if let Some(parent) = patch.parent {
            sql.push_str(", parent_uuid = ?");
            bind_values.push(optional_uuid_value(parent));
        }
        sql.push_str(" WHERE category_uuid = ?;");
        bind_values.push(Value::Text(id.to_string()));

        let changed = self.conn.execute(&sql, params_from_iter(bind_values))?;
        if changed == 0 {
            return Err(StoreError::NotFound {
                kind: RecordKind::Category,
                id,
            });
        }
        Ok(())
    }

    fn delete_category(
        &self,
        id: CategoryId,
        reassign_children_to: Option<CategoryId>,
    ) -> StoreResult<()> {
        if reassign_children_to == Some(id) {
            return Err(StoreError::InvalidRecord(format!(
                "category {id} cannot adopt its own children"
            )));
        }
        let target = reassign_children_to.map(|value| value.to_string());
        self.conn.execute(
            "UPDATE categories
             SET parent_uuid = ?2,
                 updated_at = (strftime('%s', 'now') * 1000)
             WHERE parent_uuid = ?1;",
            params![id.to_string(), target],
        )?;
        self.conn.execute(
            "UPDATE contents
             SET category_uuid = ?2,
                 updated_at = (strftime('%s', 'now') * 1000)
             WHERE category_uuid = ?1;",
            params![id.to_string(), target],
        )?;

        let changed = self.conn.execute(
            "DELETE FROM categories WHERE category_uuid = ?1;",
            [id.to_string()],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound {
                kind: RecordKind::Category,
                id,
            });
        }
        Ok(())
    }

    fn create_content(
        &self,
        subject_id: SubjectId,
        kind: ContentKind,
        body: &str,
        category: Option<CategoryId>,
        order: i64,
    ) -> StoreResult<ContentId> {
        let content_uuid = Uuid::new_v4();
        self.conn.execute(
            "INSERT INTO contents (
                content_uuid,
                subject_uuid,
                category_uuid,
                kind,
                body,
                sort_order
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6);",
            params![
                content_uuid.to_string(),
                subject_id.to_string(),
                category.map(|value| value.to_string()),
                content_kind_to_db(kind),
                body,
                order,
            ],
        )?;
        Ok(content_uuid)
    }

    fn update_content(&self, id: ContentId, patch: &ContentPatch) -> StoreResult<()> {
        let mut sql = String::from("UPDATE contents SET updated_at = (strftime('%s', 'now') * 1000)");
        let mut bind_values: Vec<Value> = Vec::new();
        if let Some(body) = &patch.body {
            sql.push_str(", body = ?");
            bind_values.push(Value::Text(body.clone()));
        }
        if let Some(order) = patch.order {
            sql.push_str(", sort_order = ?");
            bind_values.push(Value::Integer(order));
        }
        if let Some(category) = patch.category {
            sql.push_str(", category_uuid = ?");
            bind_values.push(optional_uuid_value(category));
        }
        sql.push_str(" WHERE content_uuid = ?;");
        bind_values.push(Value::Text(id.to_string()));

        let changed = self.conn.execute(&sql, params_from_iter(bind_values))?;
        if changed == 0 {
            return Err(StoreError::NotFound {
                kind: RecordKind::Content,
                id,
            });
        }
        Ok(())
    }

    fn delete_content(&self, id: ContentId) -> StoreResult<()> {
        let changed = self.conn.execute(
            "DELETE FROM contents WHERE content_uuid = ?1;",
            [id.to_string()],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound {
                kind: RecordKind::Content,
                id,
            });
        }
        Ok(())
    }

    fn load_all(&self, subject_id: SubjectId) -> StoreResult<Vec<StoredRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT
                'category' AS record_kind,
                0 AS kind_rank,
                category_uuid AS record_uuid,
                title AS body,
                level AS level,
                sort_order AS sort_order,
                parent_uuid AS owner_uuid
             FROM categories
             WHERE subject_uuid = ?1
             UNION ALL
             SELECT
                kind AS record_kind,
                1 AS kind_rank,
                content_uuid AS record_uuid,
                body AS body,
                0 AS level,
                sort_order AS sort_order,
                category_uuid AS owner_uuid
             FROM contents
             WHERE subject_uuid = ?1
             ORDER BY sort_order ASC, kind_rank ASC, record_uuid ASC;",
        )?;
        let mut rows = stmt.query([subject_id.to_string()])?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            records.push(parse_record_row(row)?);
        }
        Ok(records)
    }
}

fn parse_record_row(row: &Row<'_>) -> StoreResult<StoredRecord> {
    let uuid_text: String = row.get("record_uuid")?;
    let uuid = parse_uuid(&uuid_text, "record_uuid")?;
    let parent = row
        .get::<_, Option<String>>("owner_uuid")?
        .map(|value| parse_uuid(&value, "owner_uuid"))
        .transpose()?;

    let kind_text: String = row.get("record_kind")?;
    let kind = match kind_text.as_str() {
        "category" => LineKind::Heading,
        "text" => LineKind::Text,
        "image" => LineKind::Image,
        other => {
            return Err(StoreError::InvalidData(format!(
                "invalid record kind `{other}` in outline records"
            )));
        }
    };

    let level = match (kind, row.get::<_, i64>("level")?) {
        (LineKind::Heading, value @ 1..=6) => value as u8,
        (LineKind::Heading, other) => {
            return Err(StoreError::InvalidData(format!(
                "invalid level `{other}` in categories.level"
            )));
        }
        _ => 0,
    };

    let id = if kind.is_heading() {
        PersistedId::Category(uuid)
    } else {
        PersistedId::Content(uuid)
    };

    Ok(StoredRecord {
        id,
        kind,
        body: row.get("body")?,
        level,
        order: row.get("sort_order")?,
        parent,
    })
}

fn validate_title(title: &str) -> StoreResult<()> {
    if title.trim().is_empty() {
        return Err(StoreError::InvalidRecord(
            "category title must not be blank".to_string(),
        ));
    }
    Ok(())
}

fn validate_level(level: u8) -> StoreResult<()> {
    if !(1..=6).contains(&level) {
        return Err(StoreError::InvalidRecord(format!(
            "category level must be within 1..=6, got {level}"
        )));
    }
    Ok(())
}

fn content_kind_to_db(kind: ContentKind) -> &'static str {
    match kind {
        ContentKind::Text => "text",
        ContentKind::Image => "image",
    }
}

fn optional_uuid_value(value: Option<Uuid>) -> Value {
    match value {
        Some(uuid) => Value::Text(uuid.to_string()),
        None => Value::Null,
    }
}

fn parse_uuid(value: &str, column: &'static str) -> StoreResult<Uuid> {
    Uuid::parse_str(value)
        .map_err(|_| StoreError::InvalidData(format!("invalid uuid `{value}` in {column}")))
}

fn ensure_outline_connection_ready(conn: &Connection) -> StoreResult<()> {
    let expected_version = latest_version();
    let actual_version: u32 = conn.query_row("PRAGMA user_version;", [], |row| row.get(0))?;
    if actual_version != expected_version {
        return Err(StoreError::UninitializedConnection {
            expected_version,
            actual_version,
        });
    }

    let required: [(&'static str, &[&'static str]); 2] = [
        (
            "categories",
            &[
                "category_uuid",
                "subject_uuid",
                "parent_uuid",
                "title",
                "level",
                "sort_order",
            ],
        ),
        (
            "contents",
            &[
                "content_uuid",
                "subject_uuid",
                "category_uuid",
                "kind",
                "body",
                "sort_order",
            ],
        ),
    ];
    for (table, columns) in required {
        if !table_exists(conn, table)? {
            return Err(StoreError::MissingRequiredTable(table));
        }
        for &column in columns {
            if !table_has_column(conn, table, column)? {
                return Err(StoreError::MissingRequiredColumn { table, column });
            }
        }
    }
    Ok(())
}

pub(crate) fn table_exists(conn: &Connection, table: &str) -> StoreResult<bool> {
    let exists: i64 = conn.query_row(
        "SELECT EXISTS(
            SELECT 1
            FROM sqlite_master
            WHERE type = 'table' AND name = ?1
        );",
        [table],
        |row| row.get(0),
    )?;
    Ok(exists == 1)
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> StoreResult<bool> {
    let mut stmt = conn.prepare("SELECT name FROM pragma_table_info(?1);")?;
    let mut rows = stmt.query([table])?;
    while let Some(row) = rows.next()? {
        let current: String = row.get(0)?;
        if current == column {
            return Ok(true);
        }
    }
    Ok(false)
}
