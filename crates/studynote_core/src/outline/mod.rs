//! Pure outline algorithms: heading classification and hierarchy resolution.
//!
//! # Responsibility
//! - Keep structure rules free of storage and scheduling concerns.
//!
//! # Invariants
//! - Nothing in this module performs I/O.

pub mod classifier;
pub mod resolver;
