//! Core outline engine for StudyNote.
//! This crate is the single source of truth for outline structure invariants.

pub mod config;
pub mod db;
pub mod logging;
pub mod model;
pub mod outline;
pub mod repo;
pub mod service;

pub use config::{AutosaveConfig, EngineConfig};
pub use db::{open_db, open_db_in_memory, DbError};
pub use logging::{default_log_level, init_logging, logging_status};
pub use model::line::{
    Category, CategoryId, ContentId, Line, LineChanges, LineKey, LineKind, LineState,
    PersistedId, SubjectId,
};
pub use outline::classifier::{classify, format_heading, Classification, MAX_HEADING_LEVEL};
pub use outline::resolver::{find_enclosing_category, ReparentScope};
pub use repo::outline_repo::{
    CategoryPatch, ContentKind, ContentPatch, OutlineStore, RecordKind, SqliteOutlineStore,
    StoreError, StoreResult, StoredRecord,
};
pub use repo::subject_repo::{SqliteSubjectRepository, Subject, SubjectRepository};
pub use service::autosave::{AutosaveScheduler, Clock, FlushOutcome, SchedulerState, SystemClock};
pub use service::outline_document::{
    DocumentError, FlushMode, FlushReport, InvariantViolation, OutlineDocument, ORDER_STEP,
};
pub use service::study_session::{PersistenceStatus, SessionError, StudySession};

/// Minimal health-check API for early integration.
pub fn ping() -> &'static str {
    "pong"
}

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::{core_version, ping};

    #[test]
    fn ping_returns_pong() {
        assert_eq!(ping(), "pong");
    }

    #[test]
    fn version_is_not_empty() {
        assert!(!core_version().is_empty());
    }
}
