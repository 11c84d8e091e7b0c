//! Subject repository contracts and SQLite implementation.
//!
//! # Responsibility
//! - Create and list subjects, the unit one outline document belongs to.
//!
//! # Invariants
//! - Subject names are trimmed and never blank.
//! - Listing is deterministic: `name ASC, subject_uuid ASC`.

use crate::model::line::SubjectId;
use crate::repo::outline_repo::{table_exists, StoreError, StoreResult};
use rusqlite::{params, Connection, Row};
use uuid::Uuid;

/// Subject read model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subject {
    pub subject_uuid: SubjectId,
    pub name: String,
    /// Epoch ms creation timestamp.
    pub created_at: i64,
    /// Epoch ms update timestamp.
    pub updated_at: i64,
}

/// Repository interface for subjects.
pub trait SubjectRepository {
    /// Creates one subject.
    fn create_subject(&self, name: &str) -> StoreResult<Subject>;
    /// Loads one subject by id.
    fn get_subject(&self, subject_uuid: SubjectId) -> StoreResult<Option<Subject>>;
    /// Lists all subjects.
    fn list_subjects(&self) -> StoreResult<Vec<Subject>>;
}

/// SQLite-backed subject repository.
pub struct SqliteSubjectRepository<'conn> {
    conn: &'conn Connection,
}

impl<'conn> SqliteSubjectRepository<'conn> {
    /// Creates repository from migrated connection.
    pub fn try_new(conn: &'conn Connection) -> StoreResult<Self> {
        if !table_exists(conn, "subjects")? {
            return Err(StoreError::MissingRequiredTable("subjects"));
        }
        Ok(Self { conn })
    }
}

impl SubjectRepository for SqliteSubjectRepository<'_> {
    fn create_subject(&self, name: &str) -> StoreResult<Subject> {
        let name = name.trim();
        if name.is_empty() {
            return Err(StoreError::InvalidRecord(
                "subject name must not be blank".to_string(),
            ));
        }

        let subject_uuid = Uuid::new_v4();
        self.conn.execute(
            "INSERT INTO subjects (subject_uuid, name) VALUES (?1, ?2);",
            params![subject_uuid.to_string(), name],
        )?;
        self.get_subject(subject_uuid)?
            .ok_or_else(|| StoreError::InvalidData("created subject not found".to_string()))
    }

    fn get_subject(&self, subject_uuid: SubjectId) -> StoreResult<Option<Subject>> {
        let mut stmt = self.conn.prepare(
            "SELECT subject_uuid, name, created_at, updated_at
             FROM subjects
             WHERE subject_uuid = ?1;",
        )?;
        let mut rows = stmt.query([subject_uuid.to_string()])?;
        if let Some(row) = rows.next()? {
            return Ok(Some(parse_subject_row(row)?));
        }
        Ok(None)
    }

    fn list_subjects(&self) -> StoreResult<Vec<Subject>> {
        let mut stmt = self.conn.prepare(
            "SELECT subject_uuid, name, created_at, updated_at
             FROM subjects
             ORDER BY name ASC, subject_uuid ASC;",
        )?;
        let mut rows = stmt.query([])?;
        let mut items = Vec::new();
        while let Some(row) = rows.next()? {
            items.push(parse_subject_row(row)?);
        }
        Ok(items)
    }
}

fn parse_subject_row(row: &Row<'_>) -> StoreResult<Subject> {
    let uuid_text: String = row.get("subject_uuid")?;
    let subject_uuid = Uuid::parse_str(&uuid_text).map_err(|_| {
        StoreError::InvalidData(format!("invalid uuid `{uuid_text}` in subjects.subject_uuid"))
    })?;
    Ok(Subject {
        subject_uuid,
        name: row.get("name")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}
