//! Editing session over one subject outline.
//!
//! # Responsibility
//! - Route editing-surface calls to the outline document and feed the
//!   autosave scheduler with activity.
//! - Run due incremental flushes from `tick` and the durable full flush from
//!   `close`.
//! - Surface persistence failures only past the retry bound or at shutdown.
//!
//! # Invariants
//! - Edits and flushes are serialized through `&mut self`.
//! - Transient flush failures are logged, not returned.

use crate::config::EngineConfig;
use crate::model::line::{LineKey, SubjectId};
use crate::repo::outline_repo::OutlineStore;
use crate::service::autosave::{AutosaveScheduler, Clock, FlushOutcome, SystemClock};
use crate::service::outline_document::{DocumentError, FlushMode, FlushReport, OutlineDocument};
use log::{error, info, warn};
use std::error::Error;
use std::fmt::{Display, Formatter};

const SHUTDOWN_FLUSH_ATTEMPTS: usize = 2;

/// Errors surfaced to the editing surface.
#[derive(Debug)]
pub enum SessionError {
    /// Autosave failed `consecutive_failures` times in a row.
    PersistenceFailing {
        consecutive_failures: u32,
        source: DocumentError,
    },
    /// The shutdown full flush transaction failed.
    ShutdownFlush(DocumentError),
    /// The shutdown full flush committed but some lines were not written.
    ShutdownIncomplete(FlushReport),
}

impl Display for SessionError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PersistenceFailing {
                consecutive_failures,
                source,
            } => write!(
                f,
                "autosave failed {consecutive_failures} times in a row: {source}"
            ),
            Self::ShutdownFlush(err) => write!(f, "shutdown flush failed: {err}"),
            Self::ShutdownIncomplete(report) => write!(
                f,
                "shutdown flush left {} failed, {} deferred and {} stale lines",
                report.failed, report.deferred, report.stale
            ),
        }
    }
}

impl Error for SessionError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::PersistenceFailing { source, .. } => Some(source),
            Self::ShutdownFlush(err) => Some(err),
            Self::ShutdownIncomplete(_) => None,
        }
    }
}

/// Persistence health as shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistenceStatus {
    /// Everything in memory is persisted.
    Saved,
    /// Unsaved edits waiting for the idle threshold.
    Pending,
    /// Recent flush transactions failed; still within the retry bound.
    Retrying { consecutive_failures: u32 },
    /// Flush transactions keep failing past the retry bound.
    Failing { consecutive_failures: u32 },
}

/// Outline document plus autosave policy for one open subject.
pub struct StudySession<S: OutlineStore, C: Clock = SystemClock> {
    document: OutlineDocument<S>,
    scheduler: AutosaveScheduler,
    clock: C,
}

impl<S: OutlineStore> StudySession<S, SystemClock> {
    /// Opens a session driven by the wall clock.
    pub fn open(
        store: S,
        subject_id: SubjectId,
        config: &EngineConfig,
    ) -> Result<Self, DocumentError> {
        Self::open_with_clock(store, subject_id, config, SystemClock)
    }
}

impl<S: OutlineStore, C: Clock> StudySession<S, C> {
    pub fn open_with_clock(
        store: S,
        subject_id: SubjectId,
        config: &EngineConfig,
        clock: C,
    ) -> Result<Self, DocumentError> {
        let document = OutlineDocument::open(store, subject_id, config)?;
        let mut scheduler = AutosaveScheduler::new(&config.autosave);
        if document.has_unsaved_changes() {
            // Load repairs are persisted by the first autosave.
            scheduler.record_activity(clock.now());
        }
        Ok(Self {
            document,
            scheduler,
            clock,
        })
    }

    pub fn document(&self) -> &OutlineDocument<S> {
        &self.document
    }

    pub fn scheduler(&self) -> &AutosaveScheduler {
        &self.scheduler
    }

    pub fn insert_at(&mut self, position: usize, content: impl Into<String>) -> LineKey {
        let key = self.document.insert_at(position, content);
        self.touch();
        key
    }

    pub fn insert_image_at(&mut self, position: usize, image_ref: impl Into<String>) -> LineKey {
        let key = self.document.insert_image_at(position, image_ref);
        self.touch();
        key
    }

    pub fn remove(&mut self, key: LineKey) -> bool {
        let removed = self.document.remove(key);
        if removed {
            self.touch();
        }
        removed
    }

    pub fn change_content(&mut self, key: LineKey, content: impl Into<String>) -> bool {
        let changed = self.document.change_content(key, content);
        if changed {
            self.touch();
        }
        changed
    }

    pub fn reorder(&mut self, key: LineKey, target_position: usize) -> bool {
        let moved = self.document.reorder(key, target_position);
        if moved {
            self.touch();
        }
        moved
    }

    pub fn undo(&mut self) -> bool {
        let undone = self.document.undo();
        if undone {
            self.touch();
        }
        undone
    }

    /// Runs the incremental flush when the idle threshold has passed.
    ///
    /// Returns the flush report when a flush committed, `Ok(None)` when
    /// nothing was due or a failure is still within the retry bound.
    pub fn tick(&mut self) -> Result<Option<FlushReport>, SessionError> {
        let now = self.clock.now();
        if !self.scheduler.begin_flush(now) {
            return Ok(None);
        }

        match self.document.flush(FlushMode::Incremental) {
            Ok(report) => {
                let outcome = if report.is_complete() {
                    FlushOutcome::Complete
                } else {
                    FlushOutcome::Partial
                };
                self.scheduler.finish_flush(self.clock.now(), outcome);
                Ok(Some(report))
            }
            Err(err) => {
                self.scheduler
                    .finish_flush(self.clock.now(), FlushOutcome::Failed);
                let consecutive_failures = self.scheduler.consecutive_failures();
                if self.scheduler.is_failing() {
                    error!(
                        "event=autosave_flush module=session status=error consecutive_failures={consecutive_failures} error={err}"
                    );
                    return Err(SessionError::PersistenceFailing {
                        consecutive_failures,
                        source: err,
                    });
                }
                warn!(
                    "event=autosave_flush module=session status=retry consecutive_failures={consecutive_failures} error={err}"
                );
                Ok(None)
            }
        }
    }

    /// Current persistence health.
    pub fn persistence_status(&self) -> PersistenceStatus {
        let consecutive_failures = self.scheduler.consecutive_failures();
        if self.scheduler.is_failing() {
            PersistenceStatus::Failing {
                consecutive_failures,
            }
        } else if consecutive_failures > 0 {
            PersistenceStatus::Retrying {
                consecutive_failures,
            }
        } else if self.document.has_unsaved_changes() {
            PersistenceStatus::Pending
        } else {
            PersistenceStatus::Saved
        }
    }

    /// Synchronous shutdown flush: writes every line regardless of state.
    ///
    /// A second full pass picks up lines deferred or recreated by the first.
    /// Orphan text before the first heading is not persisted.
    pub fn close(&mut self) -> Result<FlushReport, SessionError> {
        let mut report = FlushReport::default();
        for attempt in 1..=SHUTDOWN_FLUSH_ATTEMPTS {
            report = self.document.flush(FlushMode::Full).map_err(|err| {
                error!(
                    "event=session_close module=session status=error attempt={attempt} error={err}"
                );
                SessionError::ShutdownFlush(err)
            })?;
            if report.is_complete() {
                break;
            }
        }

        if !report.is_complete() {
            error!(
                "event=session_close module=session status=error failed={} deferred={} stale={}",
                report.failed, report.deferred, report.stale
            );
            return Err(SessionError::ShutdownIncomplete(report));
        }
        if report.orphaned > 0 {
            warn!(
                "event=session_close module=session status=skip orphaned={}",
                report.orphaned
            );
        }
        self.scheduler.reset();
        info!(
            "event=session_close module=session status=ok written={} deleted={}",
            report.written, report.deleted
        );
        Ok(report)
    }

    /// Returns the underlying document, dropping the autosave policy.
    pub fn into_document(self) -> OutlineDocument<S> {
        self.document
    }

    fn touch(&mut self) {
        self.scheduler.record_activity(self.clock.now());
    }
}
