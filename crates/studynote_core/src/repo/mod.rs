//! Repository layer abstractions and persistence implementations.
//!
//! # Responsibility
//! - Define the ordered-store contract the outline document persists through.
//! - Isolate SQLite query details from document/service orchestration.
//!
//! # Invariants
//! - Repository APIs return semantic errors (`NotFound`, `InvalidRecord`) in
//!   addition to DB transport errors.
//! - Callers own transaction scope through `begin_batch`/`commit_batch`.

pub mod outline_repo;
pub mod subject_repo;
