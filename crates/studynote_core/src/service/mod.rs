//! Core use-case services.
//!
//! # Responsibility
//! - Orchestrate resolver and store calls into editing-surface level APIs.
//! - Keep hosts decoupled from storage details and autosave timing.

pub mod autosave;
pub mod outline_document;
pub mod study_session;
pub(crate) mod undo;
