//! Outline domain model.
//!
//! # Responsibility
//! - Define canonical line/category structures used by the outline engine.
//!
//! # Invariants
//! - Lines are identified in memory by `LineKey` and in storage by
//!   `PersistedId`; the two are never confused.

pub mod line;
