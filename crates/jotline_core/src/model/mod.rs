//! Domain model for task and journal records.
//!
//! # Responsibility
//! - Define the identity types shared by local and remote state.
//! - Define the business fields of each record kind and their diffs.
//!
//! # Invariants
//! - Server identifiers and local placeholders never share a type.
//! - Record structs carry business fields only; identity and timestamps live
//!   in `Synced<T>` or in the collection's live rows.

pub mod journal;
pub mod record;
pub mod task;
